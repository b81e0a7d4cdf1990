pub mod connection;
pub mod error;

use std::path::PathBuf;

use sonarq_core::scan::orchestration::AckPolicy;
use tracing::debug;
use url::Url;

use crate::{
    models::{
        BlobStorageConfig, Config, ConfigMetadata, DEFAULT_DOTNET_PATH, DEFAULT_SCANNER_PATH,
        DEFAULT_SONAR_HOST_URL, DatabaseConfig, ServiceBusConfig, SonarConfig,
        orchestrator::load_orchestrator_config,
        sources::EnvConfig,
    },
    util::{non_empty, parse_bool, parse_duration},
};
use connection::{ServiceBusConnection, StorageConnection};
use error::ConfigLoadError;

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
}

/// Reads `.env` (if any) and the process environment once, then resolves a
/// [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    env_file: Option<PathBuf>,
    skip_dotenv: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load this file instead of searching for `.env`. A missing file is an
    /// error.
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn skip_dotenv(mut self, skip: bool) -> Self {
        self.skip_dotenv = skip;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file = self.load_dotenv()?;
        let env = EnvConfig::gather();
        let mut config = Self::resolve(&env)?;
        config.metadata.env_file = env_file;
        Ok(ConfigLoad { config })
    }

    fn load_dotenv(&self) -> Result<Option<PathBuf>, ConfigLoadError> {
        if self.skip_dotenv {
            return Ok(None);
        }

        if let Some(path) = self.env_file.as_ref() {
            debug!(path = %path.display(), "loading env file");
            dotenvy::from_path(path).map_err(|source| ConfigLoadError::EnvFile {
                path: path.clone(),
                source,
            })?;
            return Ok(Some(path.clone()));
        }

        match dotenvy::dotenv() {
            Ok(path) => Ok(Some(path)),
            Err(err) if err.not_found() => {
                debug!("no .env file found; using process environment only");
                Ok(None)
            }
            Err(source) => Err(ConfigLoadError::EnvFile {
                path: PathBuf::from(".env"),
                source,
            }),
        }
    }

    /// Validate raw values into a [`Config`]. Every missing required variable
    /// is reported together.
    pub fn resolve(env: &EnvConfig) -> Result<Config, ConfigLoadError> {
        let mut missing = Vec::new();
        let mut require = |name: &'static str, value: &Option<String>| {
            let found = non_empty(value.as_deref()).map(str::to_string);
            if found.is_none() {
                missing.push(name);
            }
            found
        };

        let service_bus = require(
            "SERVICE_BUS_CONNECTION_STRING",
            &env.service_bus_connection_string,
        );
        let topic = require("SERVICE_BUS_TOPIC", &env.service_bus_topic);
        let subscription = require("SERVICE_BUS_SUBSCRIPTION", &env.service_bus_subscription);
        let blob = require("BLOB_CONNECTION_STRING", &env.blob_connection_string);
        let container = require("BLOB_CONTAINER", &env.blob_container);
        let database_url = require("DATABASE_URL", &env.database_url);
        let token = require("SONAR_TOKEN", &env.sonar_token);
        let organization = require("SONAR_ORGANIZATION", &env.sonar_organization);

        let (
            Some(service_bus),
            Some(topic),
            Some(subscription),
            Some(blob),
            Some(container),
            Some(database_url),
            Some(token),
            Some(organization),
        ) = (
            service_bus,
            topic,
            subscription,
            blob,
            container,
            database_url,
            token,
            organization,
        )
        else {
            return Err(ConfigLoadError::Missing(missing));
        };

        let host_url = non_empty(env.sonar_host_url.as_deref()).unwrap_or(DEFAULT_SONAR_HOST_URL);
        let host_url = Url::parse(host_url).map_err(|source| ConfigLoadError::InvalidUrl {
            var: "SONAR_HOST_URL",
            source,
        })?;

        let parsed_db = Url::parse(&database_url).map_err(|source| ConfigLoadError::InvalidUrl {
            var: "DATABASE_URL",
            source,
        })?;
        if !matches!(parsed_db.scheme(), "postgres" | "postgresql") {
            return Err(ConfigLoadError::UnsupportedDatabaseScheme {
                scheme: parsed_db.scheme().to_string(),
            });
        }

        let (mut orchestrator, orchestrator_source) =
            load_orchestrator_config(env).map_err(ConfigLoadError::Orchestrator)?;

        if let Some(dir) = env.work_dir.as_ref().filter(|dir| !dir.as_os_str().is_empty()) {
            orchestrator.workspace.work_dir = dir.clone();
        }
        if let Some(raw) = non_empty(env.worker_concurrency.as_deref()) {
            orchestrator.messages.concurrency = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigLoadError::InvalidNumber {
                    var: "WORKER_CONCURRENCY",
                    value: raw.to_string(),
                })?;
        }
        if let Some(raw) = non_empty(env.scan_settle_delay.as_deref()) {
            let delay = parse_duration(raw).ok_or_else(|| ConfigLoadError::InvalidDuration {
                var: "SCAN_SETTLE_DELAY",
                value: raw.to_string(),
            })?;
            orchestrator.timeouts.settle_delay_ms =
                u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(raw) = non_empty(env.ack_policy.as_deref()) {
            orchestrator.messages.ack_policy = raw
                .parse::<AckPolicy>()
                .map_err(ConfigLoadError::InvalidAckPolicy)?;
        }
        if let Some(raw) = non_empty(env.remove_sources_on_failure.as_deref()) {
            orchestrator.workspace.remove_sources_on_failure =
                parse_bool(raw).ok_or_else(|| ConfigLoadError::InvalidBool {
                    var: "REMOVE_SOURCES_ON_FAILURE",
                    value: raw.to_string(),
                })?;
        }

        Ok(Config {
            service_bus: ServiceBusConfig {
                connection: ServiceBusConnection::parse(
                    "SERVICE_BUS_CONNECTION_STRING",
                    &service_bus,
                )?,
                topic,
                subscription,
            },
            blob: BlobStorageConfig {
                connection: StorageConnection::parse("BLOB_CONNECTION_STRING", &blob)?,
                container,
            },
            sonar: SonarConfig {
                host_url,
                token,
                organization,
                scanner_path: non_empty(env.sonar_scanner_path.as_deref())
                    .unwrap_or(DEFAULT_SCANNER_PATH)
                    .to_string(),
                dotnet_path: non_empty(env.dotnet_path.as_deref())
                    .unwrap_or(DEFAULT_DOTNET_PATH)
                    .to_string(),
            },
            database: DatabaseConfig { url: database_url },
            orchestrator,
            metadata: ConfigMetadata {
                env_file: None,
                orchestrator_source,
            },
        })
    }
}
