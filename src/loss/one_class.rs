use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::LossError;

/// Placeholder objectives for one-class anti-spoofing training.
///
/// The set is closed: there is no base variant to call into. Selecting any
/// other name through [`OneClassLoss::from_name`] fails with
/// [`LossError::NotImplemented`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneClassLoss {
    Compactness,
    Descriptive,
}

impl OneClassLoss {
    /// Always 0; neither variant carries an algorithm yet.
    pub fn loss(&self, _ground_truth: &[f64], _predicted: &[f64]) -> f64 {
        match self {
            OneClassLoss::Compactness => 0.0,
            OneClassLoss::Descriptive => 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OneClassLoss::Compactness => "compactness",
            OneClassLoss::Descriptive => "descriptive",
        }
    }

    pub fn from_name(name: &str) -> Result<OneClassLoss, LossError> {
        match name {
            "compactness" => Ok(OneClassLoss::Compactness),
            "descriptive" => Ok(OneClassLoss::Descriptive),
            other => Err(LossError::NotImplemented(other.to_string())),
        }
    }
}

impl FromStr for OneClassLoss {
    type Err = LossError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OneClassLoss::from_name(s)
    }
}

impl fmt::Display for OneClassLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
