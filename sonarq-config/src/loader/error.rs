use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("failed to load env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("{var} is not a valid URL: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("DATABASE_URL must use the postgres:// or postgresql:// scheme (got `{scheme}`)")]
    UnsupportedDatabaseScheme { scheme: String },

    #[error("{var} must be a positive integer (got `{value}`)")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} is not a valid duration (got `{value}`); use forms like `5s` or `250ms`")]
    InvalidDuration { var: &'static str, value: String },

    #[error("{var} is not a boolean (got `{value}`)")]
    InvalidBool { var: &'static str, value: String },

    #[error("ACK_POLICY: {0}")]
    InvalidAckPolicy(String),

    #[error("{var} is not a valid connection string: {reason}")]
    InvalidConnectionString { var: &'static str, reason: String },

    #[error("invalid orchestrator config: {0:#}")]
    Orchestrator(anyhow::Error),
}
