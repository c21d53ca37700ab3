use rand::Rng;
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::error::{LossError, Result};
use crate::loss::center::CenterLoss;
use crate::loss::cosine_margin::{self, CosineMarginLoss};
use crate::loss::gaussian_margin::GaussianMarginLoss;
use crate::loss::isolate::{self, IsolationLoss};
use crate::loss::one_class::OneClassLoss;
use crate::math::matrix::Matrix;
use crate::optim::sgd::Sgd;

/// Construction-time configuration of a loss, serializable to JSON.
///
/// Tagged by `"type"`:
///
/// ```json
/// { "type": "cosine_margin", "num_classes": 2, "feat_dim": 128 }
/// ```
///
/// Isolation and cosine-margin hyperparameters fall back to their usual
/// values when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossSpec {
    Center {
        num_classes: usize,
        feat_dim: usize,
    },
    Isolation {
        #[serde(default = "default_isolation_classes")]
        num_classes: usize,
        #[serde(default = "default_isolation_feat_dim")]
        feat_dim: usize,
        #[serde(default = "default_r_real")]
        r_real: f64,
        #[serde(default = "default_r_fake")]
        r_fake: f64,
    },
    GaussianMargin {
        num_classes: usize,
        feat_dim: usize,
        alpha: f64,
    },
    CosineMargin {
        num_classes: usize,
        feat_dim: usize,
        #[serde(default = "default_scale")]
        s: f64,
        #[serde(default = "default_margin")]
        m: f64,
    },
    OneClass {
        kind: OneClassLoss,
    },
}

fn default_isolation_classes() -> usize { isolate::DEFAULT_NUM_CLASSES }
fn default_isolation_feat_dim() -> usize { isolate::DEFAULT_FEAT_DIM }
fn default_r_real() -> f64 { isolate::DEFAULT_R_REAL }
fn default_r_fake() -> f64 { isolate::DEFAULT_R_FAKE }
fn default_scale() -> f64 { cosine_margin::DEFAULT_SCALE }
fn default_margin() -> f64 { cosine_margin::DEFAULT_MARGIN }

/// A constructed loss module, ready for per-batch evaluation.
#[derive(Debug, Clone)]
pub enum Loss {
    Center(CenterLoss),
    Isolation(IsolationLoss),
    GaussianMargin(GaussianMarginLoss),
    CosineMargin(CosineMarginLoss),
    OneClass(OneClassLoss),
}

impl Loss {
    pub fn name(&self) -> &'static str {
        match self {
            Loss::Center(_) => "center",
            Loss::Isolation(_) => "isolation",
            Loss::GaussianMargin(_) => "gaussian_margin",
            Loss::CosineMargin(_) => "cosine_margin",
            Loss::OneClass(kind) => kind.name(),
        }
    }

    /// The learned center table, if this loss owns one.
    pub fn centers(&self) -> Option<&Matrix> {
        match self {
            Loss::Center(l) => Some(l.centers()),
            Loss::Isolation(l) => Some(l.center()),
            Loss::GaussianMargin(l) => Some(l.centers()),
            Loss::CosineMargin(l) => Some(l.centers()),
            Loss::OneClass(_) => None,
        }
    }

    /// Replaces the center table, keeping its declared shape.
    pub fn set_centers(&mut self, centers: Matrix) -> Result<()> {
        match self {
            Loss::Center(l) => l.set_centers(centers),
            Loss::Isolation(l) => l.set_center(centers),
            Loss::GaussianMargin(l) => l.set_centers(centers),
            Loss::CosineMargin(l) => l.set_centers(centers),
            Loss::OneClass(kind) => Err(no_centers(*kind)),
        }
    }

    /// One optimizer step on the center table.
    pub fn apply_update(&mut self, optimizer: &Sgd, grad: &Matrix) -> Result<()> {
        match self {
            Loss::Center(l) => l.apply_update(optimizer, grad),
            Loss::Isolation(l) => l.apply_update(optimizer, grad),
            Loss::GaussianMargin(l) => l.apply_update(optimizer, grad),
            Loss::CosineMargin(l) => l.apply_update(optimizer, grad),
            Loss::OneClass(kind) => Err(no_centers(*kind)),
        }
    }
}

fn no_centers(kind: OneClassLoss) -> LossError {
    LossError::InvalidConfig(format!("{kind} loss owns no center table"))
}

fn require(cond: bool, reason: impl FnOnce() -> String) -> Result<()> {
    if cond { Ok(()) } else { Err(LossError::InvalidConfig(reason())) }
}

fn require_shape(num_classes: usize, feat_dim: usize) -> Result<()> {
    require(num_classes > 0, || "num_classes must be at least 1".to_string())?;
    require(feat_dim > 0, || "feat_dim must be at least 1".to_string())
}

fn require_finite(name: &str, value: f64) -> Result<()> {
    require(value.is_finite(), || format!("{name} must be finite, got {value}"))
}

impl LossSpec {
    /// The isolation loss with every hyperparameter at its default.
    pub fn isolation() -> LossSpec {
        LossSpec::Isolation {
            num_classes: default_isolation_classes(),
            feat_dim: default_isolation_feat_dim(),
            r_real: default_r_real(),
            r_fake: default_r_fake(),
        }
    }

    /// Cosine-margin loss with the default scale and margin.
    pub fn cosine_margin(num_classes: usize, feat_dim: usize) -> LossSpec {
        LossSpec::CosineMargin {
            num_classes,
            feat_dim,
            s: default_scale(),
            m: default_margin(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            LossSpec::Center { num_classes, feat_dim } => require_shape(num_classes, feat_dim),
            LossSpec::Isolation { num_classes, feat_dim, r_real, r_fake } => {
                require_shape(num_classes, feat_dim)?;
                require(num_classes >= 2, || {
                    format!("isolation loss needs real and fake classes, got num_classes = {num_classes}")
                })?;
                require_finite("r_real", r_real)?;
                require_finite("r_fake", r_fake)?;
                require(r_real >= 0.0, || format!("r_real must be non-negative, got {r_real}"))?;
                require(r_real < r_fake, || {
                    format!("r_real ({r_real}) must be smaller than r_fake ({r_fake})")
                })
            }
            LossSpec::GaussianMargin { num_classes, feat_dim, alpha } => {
                require_shape(num_classes, feat_dim)?;
                require_finite("alpha", alpha)
            }
            LossSpec::CosineMargin { num_classes, feat_dim, s, m } => {
                require_shape(num_classes, feat_dim)?;
                require_finite("s", s)?;
                require_finite("m", m)?;
                require(s > 0.0, || format!("scale s must be positive, got {s}"))
            }
            LossSpec::OneClass { .. } => Ok(()),
        }
    }

    /// Validates and constructs the loss, drawing centers from the thread RNG.
    pub fn build(&self) -> Result<Loss> {
        self.build_with_rng(&mut rand::thread_rng())
    }

    /// Validates and constructs the loss, drawing centers from `rng`.
    pub fn build_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Loss> {
        let loss = match *self {
            LossSpec::Center { num_classes, feat_dim } => {
                Loss::Center(CenterLoss::with_rng(num_classes, feat_dim, rng)?)
            }
            LossSpec::Isolation { num_classes, feat_dim, r_real, r_fake } => {
                Loss::Isolation(IsolationLoss::with_rng(num_classes, feat_dim, r_real, r_fake, rng)?)
            }
            LossSpec::GaussianMargin { num_classes, feat_dim, alpha } => {
                Loss::GaussianMargin(GaussianMarginLoss::with_rng(num_classes, feat_dim, alpha, rng)?)
            }
            LossSpec::CosineMargin { num_classes, feat_dim, s, m } => {
                Loss::CosineMargin(CosineMarginLoss::with_rng(num_classes, feat_dim, s, m, rng)?)
            }
            LossSpec::OneClass { kind } => Loss::OneClass(kind),
        };
        debug!(loss = loss.name(), "built loss from spec");
        Ok(loss)
    }

    /// Serializes the spec to a pretty-printed JSON file.
    pub fn save_json(&self, path: &str) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        debug!(path, "saved loss spec");
        Ok(())
    }

    /// Deserializes and validates a `LossSpec` from a JSON file.
    pub fn load_json(path: &str) -> Result<LossSpec> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let spec: LossSpec = serde_json::from_reader(reader)?;
        spec.validate()?;
        debug!(path, ?spec, "loaded loss spec");
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_hyperparameters_take_defaults() {
        let spec: LossSpec = serde_json::from_str(r#"{ "type": "isolation" }"#).unwrap();
        assert_eq!(spec, LossSpec::isolation());

        let spec: LossSpec =
            serde_json::from_str(r#"{ "type": "cosine_margin", "num_classes": 3, "feat_dim": 8 }"#).unwrap();
        assert_eq!(spec, LossSpec::cosine_margin(3, 8));
    }

    #[test]
    fn one_class_kind_is_snake_case() {
        let spec: LossSpec =
            serde_json::from_str(r#"{ "type": "one_class", "kind": "descriptive" }"#).unwrap();
        assert_eq!(spec, LossSpec::OneClass { kind: OneClassLoss::Descriptive });
        assert!(serde_json::from_str::<LossSpec>(r#"{ "type": "one_class", "kind": "base" }"#).is_err());
    }

    #[test]
    fn invalid_radii_are_rejected() {
        let spec = LossSpec::Isolation { num_classes: 2, feat_dim: 2, r_real: 2.0, r_fake: 1.0 };
        assert!(matches!(spec.validate(), Err(LossError::InvalidConfig(_))));
        assert!(matches!(spec.build(), Err(LossError::InvalidConfig(_))));
    }

    #[test]
    fn zero_classes_are_rejected() {
        let spec = LossSpec::Center { num_classes: 0, feat_dim: 4 };
        assert!(matches!(spec.validate(), Err(LossError::InvalidConfig(_))));
    }

    #[test]
    fn built_loss_owns_centers_of_declared_shape() {
        let loss = LossSpec::GaussianMargin { num_classes: 4, feat_dim: 3, alpha: 0.1 }.build().unwrap();
        assert_eq!(loss.name(), "gaussian_margin");
        assert_eq!(loss.centers().unwrap().shape(), (4, 3));

        let iso = LossSpec::isolation().build().unwrap();
        assert_eq!(iso.centers().unwrap().shape(), (1, isolate::DEFAULT_FEAT_DIM));

        let mut stub = LossSpec::OneClass { kind: OneClassLoss::Compactness }.build().unwrap();
        assert!(stub.centers().is_none());
        assert!(matches!(stub.set_centers(Matrix::zeros(1, 1)), Err(LossError::InvalidConfig(_))));
    }

    #[test]
    fn built_loss_rejects_reshaped_centers() {
        let mut loss = LossSpec::Center { num_classes: 2, feat_dim: 3 }.build().unwrap();
        assert!(matches!(loss.set_centers(Matrix::zeros(5, 7)), Err(LossError::ShapeMismatch { .. })));
        assert!(matches!(
            loss.apply_update(&Sgd::new(0.1), &Matrix::zeros(5, 7)),
            Err(LossError::ShapeMismatch { .. })
        ));
        assert_eq!(loss.centers().unwrap().shape(), (2, 3));
    }
}
