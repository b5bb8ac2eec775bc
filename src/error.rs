//! Unified error handling for nearby-activity computation.
//!
//! Missing data (an activity without a distance, a window without samples) is
//! never an error here: those activities are skipped. Errors are reserved for
//! bad configuration, storage failures and broken input ordering.

use thiserror::Error;

use crate::ActivityId;

/// Unified error type for similarity and clustering runs.
#[derive(Debug, Error)]
pub enum NearbyError {
    /// Constraint configuration is malformed
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Persistence/storage error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Configuration JSON could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Position samples arrived out of activity order
    #[error("Position stream not ordered by activity: {previous} followed by {next}")]
    UnorderedStream {
        previous: ActivityId,
        next: ActivityId,
    },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NearbyError {
    pub fn config(message: impl Into<String>) -> Self {
        NearbyError::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for nearby-activity operations.
pub type Result<T> = std::result::Result<T, NearbyError>;

/// Extension trait for converting Option to NearbyError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a configuration error.
    fn ok_or_config(self, message: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, message: &str) -> Result<T> {
        self.ok_or_else(|| NearbyError::config(message))
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| NearbyError::Internal {
            message: message.to_string(),
        })
    }
}
