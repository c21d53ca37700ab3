use crate::error::Result;

/// A forward formula paired with a hand-written backward rule.
///
/// Both halves are registered together: callers go through [`apply`], which
/// evaluates once and keeps the inputs around for [`Applied::backward`], so
/// nothing ever differentiates `evaluate` mechanically.
pub trait ManualGradient {
    /// Borrowed inputs, saved between the forward and backward pass.
    type Inputs<'a>;
    /// Forward value. The upstream gradient has the same shape.
    type Output;
    /// Gradients w.r.t. each differentiable input.
    type Grads;

    fn evaluate(&self, inputs: &Self::Inputs<'_>) -> Result<Self::Output>;

    fn gradient(&self, inputs: &Self::Inputs<'_>, upstream: &Self::Output) -> Result<Self::Grads>;
}

/// The result of running a [`ManualGradient`] forward: its value plus the
/// saved context needed to run its backward rule later.
pub struct Applied<'a, F: ManualGradient> {
    function: F,
    inputs: F::Inputs<'a>,
    value: F::Output,
}

impl<'a, F: ManualGradient> Applied<'a, F> {
    pub fn value(&self) -> &F::Output {
        &self.value
    }

    pub fn into_value(self) -> F::Output {
        self.value
    }

    pub fn inputs(&self) -> &F::Inputs<'a> {
        &self.inputs
    }

    /// Runs the registered backward rule against `upstream`, the gradient of
    /// the final objective w.r.t. this unit's output.
    pub fn backward(&self, upstream: &F::Output) -> Result<F::Grads> {
        self.function.gradient(&self.inputs, upstream)
    }
}

/// Evaluates `function` on `inputs` and records both for the backward pass.
pub fn apply<'a, F: ManualGradient>(function: F, inputs: F::Inputs<'a>) -> Result<Applied<'a, F>> {
    let value = function.evaluate(&inputs)?;
    Ok(Applied { function, inputs, value })
}
