//! Error types for feature construction.

use thiserror::Error;

/// Errors raised while loading records or building features.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Caller supplied an out-of-domain parameter.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A record could not be turned into a runner row.
    #[error("Malformed record in race {race_id}: {reason}")]
    MalformedRecord { race_id: String, reason: String },

    #[error("Storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Data frame error: {0}")]
    Frame(#[from] polars::prelude::PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeatureError {
    /// Create an InvalidArgument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a MalformedRecord error.
    pub fn malformed(race_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            race_id: race_id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, FeatureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FeatureError::invalid_argument("window must be > 0");
        assert!(err.to_string().contains("Invalid argument"));
        assert!(err.is_invalid_argument());

        let err = FeatureError::malformed("202401010101", "bad time");
        assert!(err.to_string().contains("202401010101"));
        assert!(!err.is_invalid_argument());
    }
}
