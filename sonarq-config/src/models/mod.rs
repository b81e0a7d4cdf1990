pub mod orchestrator;
pub mod sources;

use std::{fmt, path::PathBuf};

use sonarq_core::scan::orchestration::OrchestratorConfig;
use url::Url;

use crate::loader::connection::{ServiceBusConnection, StorageConnection};
use orchestrator::OrchestratorConfigSource;

pub const DEFAULT_SONAR_HOST_URL: &str = "https://sonarcloud.io";
pub const DEFAULT_SCANNER_PATH: &str = "dotnet-sonarscanner";
pub const DEFAULT_DOTNET_PATH: &str = "dotnet";

/// Fully resolved worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_bus: ServiceBusConfig,
    pub blob: BlobStorageConfig,
    pub sonar: SonarConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn work_dir(&self) -> &std::path::Path {
        &self.orchestrator.workspace.work_dir
    }
}

#[derive(Debug, Clone)]
pub struct ServiceBusConfig {
    pub connection: ServiceBusConnection,
    pub topic: String,
    pub subscription: String,
}

#[derive(Debug, Clone)]
pub struct BlobStorageConfig {
    pub connection: StorageConnection,
    pub container: String,
}

#[derive(Clone)]
pub struct SonarConfig {
    pub host_url: Url,
    pub token: String,
    pub organization: String,
    pub scanner_path: String,
    pub dotnet_path: String,
}

impl fmt::Debug for SonarConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SonarConfig")
            .field("host_url", &self.host_url.as_str())
            .field("token", &"***")
            .field("organization", &self.organization)
            .field("scanner_path", &self.scanner_path)
            .field("dotnet_path", &self.dotnet_path)
            .finish()
    }
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = Url::parse(&self.url)
            .map(|mut url| {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            })
            .unwrap_or_else(|_| "<unparseable>".to_string());
        f.debug_struct("DatabaseConfig")
            .field("url", &redacted)
            .finish()
    }
}

/// Where the configuration came from, for startup logging.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub env_file: Option<PathBuf>,
    pub orchestrator_source: OrchestratorConfigSource,
}
