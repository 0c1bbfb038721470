//! Error types for the labflow-poller crate.

use crate::service::PollerId;

/// Boxed error returned by snapshot sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while configuring or driving pollers.
#[derive(Debug, thiserror::Error)]
pub enum PollingError {
    /// Invalid settings provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Settings could not be parsed
    #[error("Invalid settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),

    /// The service already runs its maximum number of pollers
    #[error("Too many active pollers (limit: {limit})")]
    TooManyPollers {
        /// The configured limit
        limit: usize,
    },

    /// No live poller is registered under this id
    #[error("Poller not found: {0}")]
    PollerNotFound(PollerId),

    /// A snapshot request failed
    #[error("Request failed: {0}")]
    Request(#[source] BoxError),

    /// Waiting for a snapshot timed out
    #[error("Timed out waiting for snapshot")]
    Timeout,

    /// The background polling task could not be joined
    #[error("Polling task failed: {0}")]
    TaskJoin(String),
}

/// Convenience type alias for Results using PollingError.
pub type PollingResult<T> = std::result::Result<T, PollingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_polling_error_display() {
        let error = PollingError::Configuration("interval_min must be > 0".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: interval_min must be > 0"
        );

        let error = PollingError::TooManyPollers { limit: 3 };
        assert_eq!(error.to_string(), "Too many active pollers (limit: 3)");

        let error = PollingError::PollerNotFound(PollerId::new(7));
        assert_eq!(error.to_string(), "Poller not found: poller-7");

        let error = PollingError::Timeout;
        assert_eq!(error.to_string(), "Timed out waiting for snapshot");

        let error = PollingError::TaskJoin("panicked".to_string());
        assert_eq!(error.to_string(), "Polling task failed: panicked");
    }

    #[test]
    fn test_request_error_keeps_source() {
        let error = PollingError::Request("backend unavailable".into());
        assert_eq!(error.to_string(), "Request failed: backend unavailable");
        assert!(error.source().is_some());
    }

    #[test]
    fn test_conversion_from_serde_error() {
        let parse_error = serde_json::from_str::<u32>("not json").unwrap_err();
        let error: PollingError = parse_error.into();
        assert!(matches!(error, PollingError::InvalidSettings(_)));
    }
}
