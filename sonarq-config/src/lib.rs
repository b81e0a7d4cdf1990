//! Shared configuration library for the sonarq worker.
//!
//! Environment values (optionally seeded from a `.env` file) are gathered once
//! into [`EnvConfig`], then resolved and validated into a typed [`Config`].
//! Nothing downstream reads the process environment again.

#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod util;

pub use loader::{
    ConfigLoad, ConfigLoader,
    connection::{ServiceBusConnection, StorageConnection},
    error::ConfigLoadError,
};
pub use models::orchestrator::{OrchestratorConfigSource, load_orchestrator_config};
pub use models::sources::EnvConfig;
pub use models::{
    BlobStorageConfig, Config, ConfigMetadata, DatabaseConfig, ServiceBusConfig, SonarConfig,
};
