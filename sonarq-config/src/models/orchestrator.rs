use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use sonarq_core::scan::orchestration::OrchestratorConfig;

use super::sources::EnvConfig;
use crate::util::non_empty;

/// Source that produced the orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OrchestratorConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
}

/// Load orchestrator tuning overrides.
/// Evaluation order:
/// 1) `$ORCHESTRATOR_CONFIG_PATH` (TOML or JSON file),
/// 2) `$ORCHESTRATOR_CONFIG_JSON` (inline JSON),
/// 3) defaults if neither is set.
pub fn load_orchestrator_config(
    env: &EnvConfig,
) -> anyhow::Result<(OrchestratorConfig, OrchestratorConfigSource)> {
    if let Some(path) = env.orchestrator_config_path.as_ref()
        && !path.as_os_str().is_empty()
    {
        let config = load_from_file(path)?;
        return Ok((config, OrchestratorConfigSource::EnvPath(path.clone())));
    }

    if let Some(raw) = non_empty(env.orchestrator_config_json.as_deref()) {
        let parsed = serde_json::from_str(raw).context("failed to parse ORCHESTRATOR_CONFIG_JSON")?;
        return Ok((parsed, OrchestratorConfigSource::EnvInline));
    }

    Ok((OrchestratorConfig::default(), OrchestratorConfigSource::Default))
}

fn load_from_file(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!("failed to read orchestrator config from {}", path.display())
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("invalid orchestrator config {}", path.display())),
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid orchestrator config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<OrchestratorConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse orchestrator config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}
