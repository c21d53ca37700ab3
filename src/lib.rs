pub mod error;
pub mod math;
pub mod grad;
pub mod loss;
pub mod optim;

// Convenience re-exports
pub use error::{LossError, Result};
pub use math::matrix::Matrix;
pub use grad::function::{apply, Applied, ManualGradient};
pub use loss::center::CenterLoss;
pub use loss::isolate::IsolationLoss;
pub use loss::gaussian_margin::{GaussianMarginLoss, GaussianMarginOutput};
pub use loss::cosine_margin::{CosineMarginLoss, CosineMarginOutput};
pub use loss::one_class::OneClassLoss;
pub use loss::spec::{Loss, LossSpec};
pub use optim::sgd::Sgd;
