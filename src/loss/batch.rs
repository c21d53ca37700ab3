use crate::error::{LossError, Result};
use crate::math::matrix::Matrix;

/// Checks a `(features, labels)` batch against a loss expecting `feat_dim`
/// columns and labels in `[0, num_classes)`.
///
/// Order: empty batch, batch length, feature width, then labels.
pub(crate) fn check_batch(
    features: &Matrix,
    labels: &[usize],
    feat_dim: usize,
    num_classes: usize,
) -> Result<()> {
    if features.rows == 0 {
        return Err(LossError::EmptyBatch);
    }
    if labels.len() != features.rows {
        return Err(LossError::BatchSizeMismatch {
            features: features.rows,
            labels: labels.len(),
        });
    }
    if features.cols != feat_dim {
        return Err(LossError::DimensionMismatch {
            expected: feat_dim,
            got: features.cols,
        });
    }
    if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(LossError::InvalidLabel { label, num_classes });
    }
    Ok(())
}

/// Checks that a matrix handed in from outside has exactly `expected` shape.
pub(crate) fn check_shape(what: &'static str, m: &Matrix, expected: (usize, usize)) -> Result<()> {
    if m.shape() != expected {
        return Err(LossError::ShapeMismatch { what, expected, got: m.shape() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_in_documented_order() {
        let empty = Matrix::zeros(0, 3);
        assert!(matches!(check_batch(&empty, &[], 3, 2), Err(LossError::EmptyBatch)));

        let x = Matrix::zeros(2, 3);
        assert!(matches!(
            check_batch(&x, &[0], 4, 2),
            Err(LossError::BatchSizeMismatch { features: 2, labels: 1 })
        ));
        assert!(matches!(
            check_batch(&x, &[0, 5], 4, 2),
            Err(LossError::DimensionMismatch { expected: 4, got: 3 })
        ));
        assert!(matches!(
            check_batch(&x, &[0, 2], 3, 2),
            Err(LossError::InvalidLabel { label: 2, num_classes: 2 })
        ));
        assert!(check_batch(&x, &[1, 0], 3, 2).is_ok());
    }
}
