use std::path::PathBuf;

/// Environment-derived configuration values, captured verbatim.
///
/// Validation happens later in [`crate::ConfigLoader`]; this type only
/// records what was present so every problem can be reported at once.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub service_bus_connection_string: Option<String>,
    pub service_bus_topic: Option<String>,
    pub service_bus_subscription: Option<String>,
    pub blob_connection_string: Option<String>,
    pub blob_container: Option<String>,
    pub database_url: Option<String>,
    pub sonar_token: Option<String>,
    pub sonar_organization: Option<String>,
    pub sonar_host_url: Option<String>,
    pub sonar_scanner_path: Option<String>,
    pub dotnet_path: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub worker_concurrency: Option<String>,
    pub scan_settle_delay: Option<String>,
    pub ack_policy: Option<String>,
    pub remove_sources_on_failure: Option<String>,
    pub orchestrator_config_path: Option<PathBuf>,
    pub orchestrator_config_json: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `gather` uses the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            service_bus_connection_string: lookup("SERVICE_BUS_CONNECTION_STRING"),
            service_bus_topic: lookup("SERVICE_BUS_TOPIC"),
            service_bus_subscription: lookup("SERVICE_BUS_SUBSCRIPTION"),
            blob_connection_string: lookup("BLOB_CONNECTION_STRING"),
            blob_container: lookup("BLOB_CONTAINER"),
            database_url: lookup("DATABASE_URL"),
            sonar_token: lookup("SONAR_TOKEN"),
            sonar_organization: lookup("SONAR_ORGANIZATION"),
            sonar_host_url: lookup("SONAR_HOST_URL"),
            sonar_scanner_path: lookup("SONAR_SCANNER_PATH"),
            dotnet_path: lookup("DOTNET_PATH"),
            work_dir: lookup("WORK_DIR").map(PathBuf::from),
            worker_concurrency: lookup("WORKER_CONCURRENCY"),
            scan_settle_delay: lookup("SCAN_SETTLE_DELAY"),
            ack_policy: lookup("ACK_POLICY"),
            remove_sources_on_failure: lookup("REMOVE_SOURCES_ON_FAILURE"),
            orchestrator_config_path: lookup("ORCHESTRATOR_CONFIG_PATH").map(PathBuf::from),
            orchestrator_config_json: lookup("ORCHESTRATOR_CONFIG_JSON"),
        }
    }
}
