use rand::Rng;
use tracing::debug;

use crate::error::{LossError, Result};
use crate::grad::{apply, Applied, ManualGradient};
use crate::loss::batch::{check_batch, check_shape};
use crate::loss::spec::LossSpec;
use crate::math::{matrix::Matrix, vector};
use crate::optim::sgd::Sgd;

pub const DEFAULT_SCALE: f64 = 7.0;
pub const DEFAULT_MARGIN: f64 = 0.2;

/// Large margin cosine loss (CosFace, Wang et al., CVPR 2018).
///
/// Centers act as per-class weight directions:
///
///   logits        = normalize(x) · normalize(C)ᵀ
///   margin_logits = s · (logits − m · onehot(y))
///
/// The caller applies cross-entropy to `margin_logits`.
#[derive(Debug, Clone)]
pub struct CosineMarginLoss {
    num_classes: usize,
    feat_dim: usize,
    s: f64,
    m: f64,
    centers: Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CosineMarginOutput {
    /// Cosine similarities, `B × C`, each in [-1, 1].
    pub logits: Matrix,
    pub margin_logits: Matrix,
}

impl CosineMarginOutput {
    pub fn zeros(batch: usize, num_classes: usize) -> CosineMarginOutput {
        CosineMarginOutput {
            logits: Matrix::zeros(batch, num_classes),
            margin_logits: Matrix::zeros(batch, num_classes),
        }
    }
}

impl CosineMarginLoss {
    pub fn new(num_classes: usize, feat_dim: usize, s: f64, m: f64) -> Result<CosineMarginLoss> {
        CosineMarginLoss::with_rng(num_classes, feat_dim, s, m, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        num_classes: usize,
        feat_dim: usize,
        s: f64,
        m: f64,
        rng: &mut R,
    ) -> Result<CosineMarginLoss> {
        LossSpec::CosineMargin { num_classes, feat_dim, s, m }.validate()?;
        debug!(num_classes, feat_dim, s, m, "initializing cosine margin centers");
        Ok(CosineMarginLoss {
            num_classes,
            feat_dim,
            s,
            m,
            centers: Matrix::randn(num_classes, feat_dim, rng),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    /// `(s, m)`
    pub fn scale_and_margin(&self) -> (f64, f64) {
        (self.s, self.m)
    }

    pub fn centers(&self) -> &Matrix {
        &self.centers
    }

    /// One optimizer step on the center table; `grad` must be `num_classes × feat_dim`.
    pub fn apply_update(&mut self, optimizer: &Sgd, grad: &Matrix) -> Result<()> {
        optimizer.step(&mut self.centers, grad)
    }

    pub fn set_centers(&mut self, centers: Matrix) -> Result<()> {
        check_shape("cosine margin centers", &centers, (self.num_classes, self.feat_dim))?;
        self.centers = centers;
        Ok(())
    }

    pub fn forward<'a>(
        &'a self,
        features: &'a Matrix,
        labels: &'a [usize],
    ) -> Result<Applied<'a, CosineMarginFunction>> {
        check_shape("cosine margin centers", &self.centers, (self.num_classes, self.feat_dim))?;
        apply(
            CosineMarginFunction { s: self.s, m: self.m },
            CosineMarginInputs { features, labels, centers: &self.centers },
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CosineMarginFunction {
    pub s: f64,
    pub m: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CosineMarginInputs<'a> {
    pub features: &'a Matrix,
    pub labels: &'a [usize],
    pub centers: &'a Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CosineMarginGrads {
    pub features: Matrix,
    pub centers: Matrix,
}

/// Unit-normalized rows plus the norms they were divided by.
struct Normalized {
    rows: Matrix,
    norms: Vec<f64>,
}

fn normalize_rows(m: &Matrix, what: &'static str) -> Result<Normalized> {
    let norms = m.row_norms();
    if let Some(row) = norms.iter().position(|&n| n == 0.0) {
        return Err(LossError::ZeroNorm { what, row });
    }
    let rows = Matrix::from_data(
        m.data.iter().zip(norms.iter())
            .map(|(row, n)| row.iter().map(|x| x / n).collect())
            .collect(),
    );
    Ok(Normalized { rows, norms })
}

/// Pulls a gradient w.r.t. a unit vector `u = v / ‖v‖` back onto `v`:
/// (g − (g·u) u) / ‖v‖
fn project_back(grad_unit: &[f64], unit: &[f64], norm: f64) -> Vec<f64> {
    let along = vector::dot(grad_unit, unit);
    grad_unit.iter().zip(unit.iter())
        .map(|(g, u)| (g - along * u) / norm)
        .collect()
}

impl ManualGradient for CosineMarginFunction {
    type Inputs<'a> = CosineMarginInputs<'a>;
    type Output = CosineMarginOutput;
    type Grads = CosineMarginGrads;

    fn evaluate(&self, inputs: &CosineMarginInputs<'_>) -> Result<CosineMarginOutput> {
        let CosineMarginInputs { features, labels, centers } = *inputs;
        check_batch(features, labels, centers.cols, centers.rows)?;

        let nfeat = normalize_rows(features, "feature")?;
        let ncenters = normalize_rows(centers, "center")?;
        let logits = &nfeat.rows * &ncenters.rows.transpose();

        let mut margin_logits = logits.clone();
        for (row, &label) in margin_logits.data.iter_mut().zip(labels.iter()) {
            row[label] -= self.m;
            for x in row.iter_mut() {
                *x *= self.s;
            }
        }

        Ok(CosineMarginOutput { logits, margin_logits })
    }

    fn gradient(
        &self,
        inputs: &CosineMarginInputs<'_>,
        upstream: &CosineMarginOutput,
    ) -> Result<CosineMarginGrads> {
        let CosineMarginInputs { features, labels, centers } = *inputs;
        check_batch(features, labels, centers.cols, centers.rows)?;
        let (batch, classes) = (features.rows, centers.rows);
        check_shape("upstream logits", &upstream.logits, (batch, classes))?;
        check_shape("upstream margin logits", &upstream.margin_logits, (batch, classes))?;

        let nfeat = normalize_rows(features, "feature")?;
        let ncenters = normalize_rows(centers, "center")?;

        // dL/d cos[i, j]; the margin shift is constant and drops out.
        let dcos = Matrix::from_data(
            upstream.logits.data.iter().zip(upstream.margin_logits.data.iter())
                .map(|(gl, gm)| gl.iter().zip(gm.iter()).map(|(a, b)| a + self.s * b).collect())
                .collect(),
        );

        let dnfeat = &dcos * &ncenters.rows;
        let dncenters = &dcos.transpose() * &nfeat.rows;

        let features_grad = (0..batch)
            .map(|i| project_back(dnfeat.row(i), nfeat.rows.row(i), nfeat.norms[i]))
            .collect();
        let centers_grad = (0..classes)
            .map(|j| project_back(dncenters.row(j), ncenters.rows.row(j), ncenters.norms[j]))
            .collect();

        Ok(CosineMarginGrads {
            features: Matrix::from_data(features_grad),
            centers: Matrix::from_data(centers_grad),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn logits_are_bounded_cosines() {
        let mut rng = StdRng::seed_from_u64(11);
        let loss = CosineMarginLoss::with_rng(5, 4, DEFAULT_SCALE, DEFAULT_MARGIN, &mut rng).unwrap();
        let x = Matrix::randn(8, 4, &mut rng).map(|v| v * 30.0);
        let labels = [0, 1, 2, 3, 4, 0, 1, 2];
        let out = loss.forward(&x, &labels).unwrap().into_value();
        for row in &out.logits.data {
            for &c in row {
                assert!(c.abs() <= 1.0 + 1e-12, "cosine out of range: {c}");
            }
        }
    }

    #[test]
    fn margin_subtracted_only_from_true_class_then_scaled() {
        let (s, m) = (7.0, 0.2);
        let mut loss = CosineMarginLoss::new(2, 2, s, m).unwrap();
        loss.set_centers(Matrix::from_data(vec![vec![2.0, 0.0], vec![0.0, 3.0]])).unwrap();
        let x = Matrix::from_data(vec![vec![1.0, 1.0], vec![0.0, -4.0]]);
        let out = loss.forward(&x, &[1, 0]).unwrap().into_value();

        let r = 0.5_f64.sqrt();
        assert_abs_diff_eq!(out.logits.data[0][0], r, epsilon = 1e-12);
        assert_abs_diff_eq!(out.logits.data[1][1], -1.0, epsilon = 1e-12);

        assert_abs_diff_eq!(out.margin_logits.data[0][1], s * (r - m), epsilon = 1e-12);
        assert_abs_diff_eq!(out.margin_logits.data[0][0], s * r, epsilon = 1e-12);
        assert_abs_diff_eq!(out.margin_logits.data[1][0], s * (0.0 - m), epsilon = 1e-12);
        assert_abs_diff_eq!(out.margin_logits.data[1][1], -s, epsilon = 1e-12);
    }

    #[test]
    fn zero_feature_is_rejected() {
        let loss = CosineMarginLoss::new(2, 3, DEFAULT_SCALE, DEFAULT_MARGIN).unwrap();
        let x = Matrix::from_data(vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 0.0]]);
        assert!(matches!(
            loss.forward(&x, &[0, 1]),
            Err(LossError::ZeroNorm { what: "feature", row: 1 })
        ));
    }

    #[test]
    fn non_positive_scale_is_rejected_at_construction() {
        assert!(matches!(CosineMarginLoss::new(2, 3, 0.0, DEFAULT_MARGIN), Err(LossError::InvalidConfig(_))));
        assert!(matches!(CosineMarginLoss::new(2, 3, -7.0, DEFAULT_MARGIN), Err(LossError::InvalidConfig(_))));
    }

    #[test]
    fn gradient_is_orthogonal_to_feature() {
        let mut rng = StdRng::seed_from_u64(3);
        let loss = CosineMarginLoss::with_rng(3, 4, DEFAULT_SCALE, DEFAULT_MARGIN, &mut rng).unwrap();
        let x = Matrix::randn(2, 4, &mut rng);
        let out = loss.forward(&x, &[2, 1]).unwrap();
        let mut upstream = CosineMarginOutput::zeros(2, 3);
        upstream.margin_logits.data[0][2] = 1.0;
        upstream.logits.data[1][0] = -0.5;
        let grads = out.backward(&upstream).unwrap();
        // rescaling a feature leaves every cosine unchanged
        for i in 0..2 {
            assert_abs_diff_eq!(vector::dot(grads.features.row(i), x.row(i)), 0.0, epsilon = 1e-10);
        }
    }
}
