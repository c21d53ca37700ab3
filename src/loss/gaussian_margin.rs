use rand::Rng;
use tracing::debug;

use crate::error::Result;
use crate::grad::{apply, Applied, ManualGradient};
use crate::loss::batch::{check_batch, check_shape};
use crate::loss::spec::LossSpec;
use crate::math::{matrix::Matrix, vector};
use crate::optim::sgd::Sgd;

/// Large-margin Gaussian mixture loss with identity covariance.
///
/// Produces three tensors for the caller to combine (typically
/// cross-entropy on `margin_logits` plus a weighted `likelihood`):
///
///   dist[i, j]          = ‖x_i − c_j‖²
///   logits[i, j]        = −½ · dist[i, j]
///   margin_logits[i, j] = −½ · (1 + α·[j = y_i]) · dist[i, j]
///   likelihood          = (1/B) · Σ_i ½ ‖x_i − c_{y_i}‖²
#[derive(Debug, Clone)]
pub struct GaussianMarginLoss {
    num_classes: usize,
    feat_dim: usize,
    alpha: f64,
    centers: Matrix,
}

/// Forward value of [`GaussianMarginLoss`]; also the shape of its upstream gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMarginOutput {
    /// `B × C`
    pub logits: Matrix,
    /// `B × C`
    pub margin_logits: Matrix,
    pub likelihood: f64,
}

impl GaussianMarginOutput {
    /// An all-zero cotangent for a `batch × num_classes` output; set the
    /// fields the objective actually depends on.
    pub fn zeros(batch: usize, num_classes: usize) -> GaussianMarginOutput {
        GaussianMarginOutput {
            logits: Matrix::zeros(batch, num_classes),
            margin_logits: Matrix::zeros(batch, num_classes),
            likelihood: 0.0,
        }
    }
}

impl GaussianMarginLoss {
    pub fn new(num_classes: usize, feat_dim: usize, alpha: f64) -> Result<GaussianMarginLoss> {
        GaussianMarginLoss::with_rng(num_classes, feat_dim, alpha, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        num_classes: usize,
        feat_dim: usize,
        alpha: f64,
        rng: &mut R,
    ) -> Result<GaussianMarginLoss> {
        LossSpec::GaussianMargin { num_classes, feat_dim, alpha }.validate()?;
        debug!(num_classes, feat_dim, alpha, "initializing gaussian margin centers");
        Ok(GaussianMarginLoss {
            num_classes,
            feat_dim,
            alpha,
            centers: Matrix::randn(num_classes, feat_dim, rng),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn centers(&self) -> &Matrix {
        &self.centers
    }

    /// One optimizer step on the center table; `grad` must be `num_classes × feat_dim`.
    pub fn apply_update(&mut self, optimizer: &Sgd, grad: &Matrix) -> Result<()> {
        optimizer.step(&mut self.centers, grad)
    }

    pub fn set_centers(&mut self, centers: Matrix) -> Result<()> {
        check_shape("gaussian margin centers", &centers, (self.num_classes, self.feat_dim))?;
        self.centers = centers;
        Ok(())
    }

    pub fn forward<'a>(
        &'a self,
        features: &'a Matrix,
        labels: &'a [usize],
    ) -> Result<Applied<'a, GaussianMarginFunction>> {
        check_shape("gaussian margin centers", &self.centers, (self.num_classes, self.feat_dim))?;
        apply(
            GaussianMarginFunction { alpha: self.alpha },
            GaussianMarginInputs { features, labels, centers: &self.centers },
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GaussianMarginFunction {
    pub alpha: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct GaussianMarginInputs<'a> {
    pub features: &'a Matrix,
    pub labels: &'a [usize],
    pub centers: &'a Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMarginGrads {
    pub features: Matrix,
    pub centers: Matrix,
}

impl GaussianMarginFunction {
    /// Distance scale for column `j` of a row labelled `label`.
    fn weight(&self, label: usize, j: usize) -> f64 {
        if j == label { 1.0 + self.alpha } else { 1.0 }
    }
}

impl ManualGradient for GaussianMarginFunction {
    type Inputs<'a> = GaussianMarginInputs<'a>;
    type Output = GaussianMarginOutput;
    type Grads = GaussianMarginGrads;

    fn evaluate(&self, inputs: &GaussianMarginInputs<'_>) -> Result<GaussianMarginOutput> {
        let GaussianMarginInputs { features, labels, centers } = *inputs;
        check_batch(features, labels, centers.cols, centers.rows)?;

        let (batch, classes) = (features.rows, centers.rows);
        let mut logits = Matrix::zeros(batch, classes);
        let mut margin_logits = Matrix::zeros(batch, classes);
        let mut likelihood = 0.0;
        for (i, &label) in labels.iter().enumerate() {
            for j in 0..classes {
                let dist = vector::squared_distance(features.row(i), centers.row(j));
                logits.data[i][j] = -0.5 * dist;
                margin_logits.data[i][j] = -0.5 * self.weight(label, j) * dist;
                if j == label {
                    likelihood += dist / 2.0;
                }
            }
        }

        Ok(GaussianMarginOutput {
            logits,
            margin_logits,
            likelihood: likelihood / batch as f64,
        })
    }

    fn gradient(
        &self,
        inputs: &GaussianMarginInputs<'_>,
        upstream: &GaussianMarginOutput,
    ) -> Result<GaussianMarginGrads> {
        let GaussianMarginInputs { features, labels, centers } = *inputs;
        check_batch(features, labels, centers.cols, centers.rows)?;
        let (batch, classes) = (features.rows, centers.rows);
        check_shape("upstream logits", &upstream.logits, (batch, classes))?;
        check_shape("upstream margin logits", &upstream.margin_logits, (batch, classes))?;

        let mut grad_features = Matrix::zeros(batch, features.cols);
        let mut grad_centers = Matrix::zeros(classes, centers.cols);
        let likelihood_scale = upstream.likelihood / batch as f64;
        for (i, &label) in labels.iter().enumerate() {
            for j in 0..classes {
                // dL/d dist[i, j], with d dist / d x_i = 2 (x_i − c_j)
                let mut coeff = -(upstream.logits.data[i][j]
                    + self.weight(label, j) * upstream.margin_logits.data[i][j]);
                if j == label {
                    coeff += likelihood_scale;
                }
                if coeff == 0.0 {
                    continue;
                }
                let offset = vector::diff(features.row(i), centers.row(j));
                vector::axpy(&mut grad_features.data[i], coeff, &offset);
                vector::axpy(&mut grad_centers.data[j], -coeff, &offset);
            }
        }

        Ok(GaussianMarginGrads {
            features: grad_features,
            centers: grad_centers,
        })
    }
}
