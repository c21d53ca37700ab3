mod batch;
pub mod center;
pub mod cosine_margin;
pub mod gaussian_margin;
pub mod isolate;
pub mod one_class;
pub mod spec;

pub use center::CenterLoss;
pub use cosine_margin::{CosineMarginLoss, CosineMarginOutput};
pub use gaussian_margin::{GaussianMarginLoss, GaussianMarginOutput};
pub use isolate::IsolationLoss;
pub use one_class::OneClassLoss;
pub use spec::{Loss, LossSpec};
