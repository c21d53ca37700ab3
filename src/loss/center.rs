use rand::Rng;
use tracing::{debug, trace};

use crate::error::Result;
use crate::grad::{apply, Applied, ManualGradient};
use crate::loss::batch::{check_batch, check_shape};
use crate::loss::spec::LossSpec;
use crate::math::{matrix::Matrix, vector};
use crate::optim::sgd::Sgd;

/// Center loss (Wen et al., 2016):
///   L = ½ · Σ_i ‖x_i − c_{y_i}‖²
///
/// Owns one learned center per class. The backward pass is the hand-written
/// rule in [`CenterLossFunction`], not the chain rule of the formula above.
#[derive(Debug, Clone)]
pub struct CenterLoss {
    num_classes: usize,
    feat_dim: usize,
    centers: Matrix,
}

impl CenterLoss {
    /// Centers drawn from N(0, 1) with the thread RNG.
    pub fn new(num_classes: usize, feat_dim: usize) -> Result<CenterLoss> {
        CenterLoss::with_rng(num_classes, feat_dim, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(num_classes: usize, feat_dim: usize, rng: &mut R) -> Result<CenterLoss> {
        LossSpec::Center { num_classes, feat_dim }.validate()?;
        debug!(num_classes, feat_dim, "initializing center loss centers");
        Ok(CenterLoss {
            num_classes,
            feat_dim,
            centers: Matrix::randn(num_classes, feat_dim, rng),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    pub fn centers(&self) -> &Matrix {
        &self.centers
    }

    /// One optimizer step on the center table; `grad` must be `num_classes × feat_dim`.
    pub fn apply_update(&mut self, optimizer: &Sgd, grad: &Matrix) -> Result<()> {
        optimizer.step(&mut self.centers, grad)
    }

    /// Replaces the center table; it must stay `num_classes × feat_dim`.
    pub fn set_centers(&mut self, centers: Matrix) -> Result<()> {
        check_shape("center loss centers", &centers, (self.num_classes, self.feat_dim))?;
        self.centers = centers;
        Ok(())
    }

    /// Evaluates the loss on a batch. Call `backward(&upstream)` on the
    /// result to get gradients for the features and the center table.
    pub fn forward<'a>(
        &'a self,
        features: &'a Matrix,
        labels: &'a [usize],
    ) -> Result<Applied<'a, CenterLossFunction>> {
        check_shape("center loss centers", &self.centers, (self.num_classes, self.feat_dim))?;
        apply(CenterLossFunction, CenterLossInputs {
            features,
            labels,
            centers: &self.centers,
        })
    }
}

/// The forward/backward pair behind [`CenterLoss`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CenterLossFunction;

#[derive(Debug, Clone, Copy)]
pub struct CenterLossInputs<'a> {
    pub features: &'a Matrix,
    pub labels: &'a [usize],
    pub centers: &'a Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CenterLossGrads {
    /// ∂L/∂features, `B × D`.
    pub features: Matrix,
    /// Damped per-class center update, `C × D`.
    pub centers: Matrix,
}

impl ManualGradient for CenterLossFunction {
    type Inputs<'a> = CenterLossInputs<'a>;
    type Output = f64;
    type Grads = CenterLossGrads;

    fn evaluate(&self, inputs: &CenterLossInputs<'_>) -> Result<f64> {
        let CenterLossInputs { features, labels, centers } = *inputs;
        check_batch(features, labels, centers.cols, centers.rows)?;

        let centers_pred = centers.gather_rows(labels);
        Ok((features - &centers_pred).map(|x| x * x).sum() / 2.0)
    }

    /// Feature gradient: (x_i − c_{y_i}) · upstream.
    ///
    /// Center gradient: for each class j, Σ_{i: y_i = j} (c_j − x_i) divided
    /// by a count that starts at 1, so the divisor is (occurrences + 1).
    /// Classes absent from the batch get a zero row. The center gradient is
    /// not scaled by `upstream`.
    fn gradient(&self, inputs: &CenterLossInputs<'_>, upstream: &f64) -> Result<CenterLossGrads> {
        let CenterLossInputs { features, labels, centers } = *inputs;
        check_batch(features, labels, centers.cols, centers.rows)?;

        let grad_features = (features - &centers.gather_rows(labels)).map(|x| x * upstream);

        // Fresh per call; nothing carries over between batches.
        let mut counts = vec![1.0_f64; centers.rows];
        let mut grad_centers = Matrix::zeros(centers.rows, centers.cols);
        for (i, &j) in labels.iter().enumerate() {
            counts[j] += 1.0;
            let delta = vector::diff(centers.row(j), features.row(i));
            vector::axpy(&mut grad_centers.data[j], 1.0, &delta);
        }
        for (row, count) in grad_centers.data.iter_mut().zip(counts.iter()) {
            for x in row.iter_mut() {
                *x /= count;
            }
        }

        trace!(?counts, "center gradient divisors");
        debug!(
            batch = labels.len(),
            classes_seen = counts.iter().filter(|&&c| c > 1.0).count(),
            "center loss backward"
        );

        Ok(CenterLossGrads {
            features: grad_features,
            centers: grad_centers,
        })
    }
}
