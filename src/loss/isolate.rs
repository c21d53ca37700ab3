use rand::Rng;
use tracing::debug;

use crate::error::{LossError, Result};
use crate::grad::{apply, Applied, ManualGradient};
use crate::loss::batch::{check_batch, check_shape};
use crate::loss::spec::LossSpec;
use crate::math::{matrix::Matrix, vector};
use crate::optim::sgd::Sgd;

/// Label of genuine samples.
pub const REAL: usize = 0;
/// Label of manipulated samples.
pub const FAKE: usize = 1;

/// Only real and fake are scored, whatever `num_classes` is configured to.
const SCORED_CLASSES: usize = 2;

pub const DEFAULT_NUM_CLASSES: usize = 10;
pub const DEFAULT_FEAT_DIM: usize = 2;
pub const DEFAULT_R_REAL: f64 = 0.042;
pub const DEFAULT_R_FAKE: f64 = 1.638;

/// Isolation loss (Masi et al., 2020).
///
/// Pulls real samples inside a ball of radius `r_real` around one learned
/// center and pushes fake samples outside radius `r_fake`:
///
///   o_real(x) = max(0, ‖x − c‖ − r_real)
///   o_fake(x) = max(0, r_fake − ‖x − c‖)
///   L = mean_{real}(o_real) + mean_{fake}(o_fake)
#[derive(Debug, Clone)]
pub struct IsolationLoss {
    num_classes: usize,
    feat_dim: usize,
    r_real: f64,
    r_fake: f64,
    center: Matrix,
}

impl IsolationLoss {
    pub fn new(num_classes: usize, feat_dim: usize, r_real: f64, r_fake: f64) -> Result<IsolationLoss> {
        IsolationLoss::with_rng(num_classes, feat_dim, r_real, r_fake, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        num_classes: usize,
        feat_dim: usize,
        r_real: f64,
        r_fake: f64,
        rng: &mut R,
    ) -> Result<IsolationLoss> {
        LossSpec::Isolation { num_classes, feat_dim, r_real, r_fake }.validate()?;
        debug!(feat_dim, r_real, r_fake, "initializing isolation loss center");
        Ok(IsolationLoss {
            num_classes,
            feat_dim,
            r_real,
            r_fake,
            center: Matrix::randn(1, feat_dim, rng),
        })
    }

    /// The loss with every hyperparameter at its default.
    pub fn with_defaults() -> Result<IsolationLoss> {
        IsolationLoss::new(DEFAULT_NUM_CLASSES, DEFAULT_FEAT_DIM, DEFAULT_R_REAL, DEFAULT_R_FAKE)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    pub fn radii(&self) -> (f64, f64) {
        (self.r_real, self.r_fake)
    }

    /// The single global center, `1 × feat_dim`.
    pub fn center(&self) -> &Matrix {
        &self.center
    }

    /// One optimizer step on the center; `grad` must be `1 × feat_dim`.
    pub fn apply_update(&mut self, optimizer: &Sgd, grad: &Matrix) -> Result<()> {
        optimizer.step(&mut self.center, grad)
    }

    pub fn set_center(&mut self, center: Matrix) -> Result<()> {
        check_shape("isolation loss center", &center, (1, self.feat_dim))?;
        self.center = center;
        Ok(())
    }

    /// Labels must be [`REAL`] or [`FAKE`], and both must appear in the batch.
    pub fn forward<'a>(
        &'a self,
        features: &'a Matrix,
        labels: &'a [usize],
    ) -> Result<Applied<'a, IsolationFunction>> {
        check_shape("isolation loss center", &self.center, (1, self.feat_dim))?;
        apply(
            IsolationFunction { r_real: self.r_real, r_fake: self.r_fake },
            IsolationInputs { features, labels, center: &self.center },
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IsolationFunction {
    pub r_real: f64,
    pub r_fake: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct IsolationInputs<'a> {
    pub features: &'a Matrix,
    pub labels: &'a [usize],
    pub center: &'a Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IsolationGrads {
    pub features: Matrix,
    /// `1 × D`.
    pub center: Matrix,
}

/// Per-sample state shared by the forward and backward pass.
struct Scored {
    distances: Vec<f64>,
    counts: [usize; SCORED_CLASSES],
}

impl IsolationFunction {
    fn penalty(&self, label: usize, distance: f64) -> f64 {
        if label == REAL {
            (distance - self.r_real).max(0.0)
        } else {
            (self.r_fake - distance).max(0.0)
        }
    }

    /// d penalty / d distance, taking 0 at the hinge.
    fn slope(&self, label: usize, distance: f64) -> f64 {
        if label == REAL {
            if distance > self.r_real { 1.0 } else { 0.0 }
        } else if distance < self.r_fake {
            -1.0
        } else {
            0.0
        }
    }

    fn score(&self, inputs: &IsolationInputs<'_>) -> Result<Scored> {
        let IsolationInputs { features, labels, center } = *inputs;
        check_shape("isolation loss center", center, (1, center.cols))?;
        check_batch(features, labels, center.cols, SCORED_CLASSES)?;

        let mut counts = [0; SCORED_CLASSES];
        for &label in labels {
            counts[label] += 1;
        }
        if let Some(class) = counts.iter().position(|&n| n == 0) {
            return Err(LossError::DivisionByZero { class });
        }

        let c = center.row(0);
        let distances = features.data.iter()
            .map(|x| vector::squared_distance(x, c).sqrt())
            .collect();
        Ok(Scored { distances, counts })
    }
}

impl ManualGradient for IsolationFunction {
    type Inputs<'a> = IsolationInputs<'a>;
    type Output = f64;
    type Grads = IsolationGrads;

    fn evaluate(&self, inputs: &IsolationInputs<'_>) -> Result<f64> {
        let Scored { distances, counts } = self.score(inputs)?;

        let mut sums = [0.0; SCORED_CLASSES];
        for (&label, &d) in inputs.labels.iter().zip(distances.iter()) {
            sums[label] += self.penalty(label, d);
        }
        let real = sums[REAL] / counts[REAL] as f64;
        let fake = sums[FAKE] / counts[FAKE] as f64;
        debug!(real, fake, n_real = counts[REAL], n_fake = counts[FAKE], "isolation loss per-class means");
        Ok(real + fake)
    }

    fn gradient(&self, inputs: &IsolationInputs<'_>, upstream: &f64) -> Result<IsolationGrads> {
        let Scored { distances, counts } = self.score(inputs)?;
        let IsolationInputs { features, labels, center } = *inputs;

        let mut grad_features = Matrix::zeros(features.rows, features.cols);
        let mut grad_center = Matrix::zeros(1, center.cols);
        for (i, (&label, &d)) in labels.iter().zip(distances.iter()).enumerate() {
            let slope = self.slope(label, d);
            // At the center the direction is undefined; treat as flat.
            if slope == 0.0 || d == 0.0 {
                continue;
            }
            let scale = upstream * slope / (counts[label] as f64 * d);
            let offset = vector::diff(features.row(i), center.row(0));
            vector::axpy(&mut grad_features.data[i], scale, &offset);
            vector::axpy(&mut grad_center.data[0], -scale, &offset);
        }

        Ok(IsolationGrads {
            features: grad_features,
            center: grad_center,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn loss_at_origin(dim: usize) -> IsolationLoss {
        let mut loss = IsolationLoss::new(2, dim, 0.5, 2.0).unwrap();
        loss.set_center(Matrix::zeros(1, dim)).unwrap();
        loss
    }

    #[test]
    fn separated_batch_scores_zero() {
        let loss = loss_at_origin(2);
        let x = Matrix::from_data(vec![
            vec![0.1, 0.1],
            vec![3.0, 0.0],
            vec![0.0, -0.2],
            vec![0.0, 5.0],
        ]);
        assert_eq!(*loss.forward(&x, &[REAL, FAKE, REAL, FAKE]).unwrap().value(), 0.0);
    }

    #[test]
    fn crossing_a_boundary_strictly_increases_loss() {
        let loss = loss_at_origin(1);
        let labels = [REAL, FAKE];
        let base = Matrix::from_data(vec![vec![0.1], vec![3.0]]);
        let real_out = Matrix::from_data(vec![vec![0.8], vec![3.0]]);
        let fake_in = Matrix::from_data(vec![vec![0.1], vec![1.5]]);

        let l0 = *loss.forward(&base, &labels).unwrap().value();
        let l1 = *loss.forward(&real_out, &labels).unwrap().value();
        let l2 = *loss.forward(&fake_in, &labels).unwrap().value();
        assert!(l1 > l0);
        assert!(l2 > l0);
        assert_abs_diff_eq!(l1, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(l2, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn penalties_are_averaged_per_class() {
        let loss = loss_at_origin(1);
        // real: 1.5 - 0.5 = 1.0 and 0; fake: 2.0 - 1.0 = 1.0
        let x = Matrix::from_data(vec![vec![1.5], vec![0.0], vec![-1.0]]);
        let value = *loss.forward(&x, &[REAL, REAL, FAKE]).unwrap().value();
        assert_abs_diff_eq!(value, 0.5 + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_class_is_reported() {
        let loss = loss_at_origin(1);
        let x = Matrix::from_data(vec![vec![0.0], vec![1.0]]);
        assert!(matches!(
            loss.forward(&x, &[REAL, REAL]),
            Err(LossError::DivisionByZero { class: FAKE })
        ));
    }

    #[test]
    fn labels_beyond_fake_are_invalid() {
        let loss = IsolationLoss::with_defaults().unwrap();
        let x = Matrix::zeros(2, DEFAULT_FEAT_DIM);
        assert!(matches!(
            loss.forward(&x, &[REAL, 2]),
            Err(LossError::InvalidLabel { label: 2, num_classes: 2 })
        ));
    }

    #[test]
    fn inverted_radii_are_rejected_at_construction() {
        assert!(matches!(IsolationLoss::new(2, 2, 2.0, 1.0), Err(LossError::InvalidConfig(_))));
        assert!(matches!(IsolationLoss::new(2, 2, f64::NAN, 1.0), Err(LossError::InvalidConfig(_))));
        assert!(matches!(IsolationLoss::new(1, 2, 0.1, 1.0), Err(LossError::InvalidConfig(_))));
    }

    #[test]
    fn center_stays_one_row() {
        let mut loss = loss_at_origin(2);
        assert!(matches!(
            loss.set_center(Matrix::zeros(2, 2)),
            Err(LossError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            loss.apply_update(&Sgd::new(0.1), &Matrix::zeros(1, 3)),
            Err(LossError::ShapeMismatch { .. })
        ));
        assert_eq!(loss.center().shape(), (1, 2));
    }

    #[test]
    fn gradient_pulls_real_in_and_pushes_fake_out() {
        let loss = loss_at_origin(1);
        let x = Matrix::from_data(vec![vec![1.0], vec![-1.0]]);
        let grads = loss.forward(&x, &[REAL, FAKE]).unwrap().backward(&1.0).unwrap();
        // descending the gradient moves the real sample toward 0 and the fake one away
        assert_eq!(grads.features.data, vec![vec![1.0], vec![1.0]]);
        assert_eq!(grads.center.data, vec![vec![-2.0]]);
    }
}
