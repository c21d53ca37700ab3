pub mod function;

pub use function::{apply, Applied, ManualGradient};
