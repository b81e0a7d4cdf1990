use std::time::Duration;

use thiserror::Error;

use crate::scan::report::ReportError;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("The file '{0}' has already been scanned.")]
    AlreadyProcessed(String),

    #[error("Error extracting zip file '{artifact}': {message}")]
    Archive { artifact: String, message: String },

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Scan engine error: {0}")]
    Engine(String),

    #[error("{step} step timed out after {}", humanize(.after))]
    Timeout { step: &'static str, after: Duration },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Whether redelivering the same request has a realistic chance of
    /// succeeding. Data and intent errors never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::Timeout { .. }
            | ScanError::Transport(_)
            | ScanError::Database(_)
            | ScanError::Cancelled(_) => true,
            ScanError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            // Internal errors are bugs or misconfiguration; transient causes
            // carry their own variant.
            ScanError::Io(_)
            | ScanError::Serialization(_)
            | ScanError::InvalidRequest(_)
            | ScanError::NotFound(_)
            | ScanError::AlreadyProcessed(_)
            | ScanError::Archive { .. }
            | ScanError::Report(_)
            | ScanError::Engine(_)
            | ScanError::Internal(_) => false,
        }
    }
}

fn humanize(after: &Duration) -> String {
    format!("{}ms", after.as_millis())
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_http_failures_are_retryable() {
        let busy = ScanError::HttpStatus {
            status: 503,
            url: "https://sonarcloud.io/api/measures/component".into(),
        };
        let throttled = ScanError::HttpStatus {
            status: 429,
            url: "https://sonarcloud.io".into(),
        };
        let rejected = ScanError::HttpStatus {
            status: 401,
            url: "https://sonarcloud.io".into(),
        };

        assert!(busy.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!ScanError::NotFound("a.zip".into()).is_retryable());
        assert!(!ScanError::AlreadyProcessed("a.zip".into()).is_retryable());
        assert!(!ScanError::Report(ReportError::MissingReport).is_retryable());
        assert!(!ScanError::Engine("dotnet build exited with 1".into()).is_retryable());
    }

    #[test]
    fn internal_errors_are_terminal_whatever_the_wording() {
        for message in [
            "extraction task failed: task panicked",
            "solution search failed: connection to worker thread timed out",
            "blob endpoint http://unavailable cannot be a base",
        ] {
            assert!(
                !ScanError::Internal(message.into()).is_retryable(),
                "{message} should not be retried"
            );
        }
    }

    #[test]
    fn timeouts_render_step_and_duration() {
        let err = ScanError::Timeout {
            step: "execute",
            after: Duration::from_secs(2),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "execute step timed out after 2000ms");
    }
}
