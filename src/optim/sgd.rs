use tracing::trace;

use crate::error::{LossError, Result};
use crate::math::matrix::Matrix;

/// Plain gradient descent on a center table.
pub struct Sgd {
    pub learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Sgd {
        Sgd { learning_rate }
    }

    /// Applies one update in place: `params -= learning_rate · grad`.
    pub fn step(&self, params: &mut Matrix, grad: &Matrix) -> Result<()> {
        if params.shape() != grad.shape() {
            return Err(LossError::ShapeMismatch {
                what: "sgd gradient",
                expected: params.shape(),
                got: grad.shape(),
            });
        }
        let lr = self.learning_rate;
        *params = &*params - &grad.map(|x| x * lr);
        trace!(lr, rows = params.rows, "sgd step");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_moves_against_gradient() {
        let mut params = Matrix::from_data(vec![vec![1.0, 2.0]]);
        Sgd::new(0.5).step(&mut params, &Matrix::from_data(vec![vec![2.0, -2.0]])).unwrap();
        assert_eq!(params.data, vec![vec![0.0, 3.0]]);
    }

    #[test]
    fn mismatched_gradient_is_rejected() {
        let mut params = Matrix::zeros(2, 2);
        assert!(Sgd::new(0.1).step(&mut params, &Matrix::zeros(1, 2)).is_err());
    }
}
