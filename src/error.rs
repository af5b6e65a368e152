//! Error types for anomaly scoring

use thiserror::Error;

/// Result type alias for anomaly scoring operations
pub type Result<T> = std::result::Result<T, AnomalyError>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum AnomalyError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cannot shrink by {requested}: neighborhood size is only {k}")]
    ShrinkExceedsK { requested: usize, k: usize },

    #[error("No cluster left")]
    NoClusterLeft,

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),
}

impl From<ndarray::ShapeError> for AnomalyError {
    fn from(err: ndarray::ShapeError) -> Self {
        AnomalyError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

impl From<rayon::ThreadPoolBuildError> for AnomalyError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        AnomalyError::ThreadPoolError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnomalyError::InvalidInput("empty point set".to_string());
        assert_eq!(err.to_string(), "Invalid input: empty point set");
        assert_eq!(AnomalyError::NoClusterLeft.to_string(), "No cluster left");
    }

    #[test]
    fn test_shrink_error_display() {
        let err = AnomalyError::ShrinkExceedsK { requested: 5, k: 3 };
        assert_eq!(err.to_string(), "Cannot shrink by 5: neighborhood size is only 3");
    }

    #[test]
    fn test_error_from_shape() {
        let shape_err = ndarray::Array2::<f64>::from_shape_vec((2, 2), vec![1.0]).unwrap_err();
        let err: AnomalyError = shape_err.into();
        assert!(matches!(err, AnomalyError::ShapeError { .. }));
    }
}
