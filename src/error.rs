use thiserror::Error;

/// Result alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, LossError>;

/// Contract violations raised while configuring or evaluating a loss.
///
/// None of these are transient: the caller decides whether to skip the
/// batch or abort training.
#[derive(Debug, Error)]
pub enum LossError {
    /// Feature width differs from the width of the center table.
    #[error("center dim {expected} does not match input feature dim {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A label does not index a row of the center table.
    #[error("label {label} is outside the class range [0, {num_classes})")]
    InvalidLabel { label: usize, num_classes: usize },

    #[error("batch has {features} feature rows but {labels} labels")]
    BatchSizeMismatch { features: usize, labels: usize },

    #[error("batch is empty")]
    EmptyBatch,

    /// A per-class mean was requested for a class with no samples in the batch.
    #[error("class {class} has no samples in this batch; its mean penalty divides by zero")]
    DivisionByZero { class: usize },

    /// A zero vector has no direction to normalize to.
    #[error("{what} row {row} has zero norm and cannot be normalized")]
    ZeroNorm { what: &'static str, row: usize },

    /// A matrix handed in from outside has the wrong (rows, cols).
    #[error("{what}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// The selected loss has no concrete implementation.
    #[error("loss `{0}` has not been implemented")]
    NotImplemented(String),

    #[error("invalid loss configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
