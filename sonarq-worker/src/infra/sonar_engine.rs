//! SonarCloud REST client plus the local `dotnet-sonarscanner` invocation.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use sonarq_config::SonarConfig;
use sonarq_core::{
    error::{Result, ScanError},
    scan::{ExtractedSource, ProjectKey, REQUESTED_METRIC_KEYS, ScanEngine, ScanToken},
};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::http::{display_url, ensure_success, transport_error, truncate};

const SOLUTION_EXTENSION: &str = "sln";

pub struct SonarCloudEngine {
    client: Client,
    host_url: String,
    token: String,
    organization: String,
    scanner_path: String,
    dotnet_path: String,
}

impl fmt::Debug for SonarCloudEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SonarCloudEngine")
            .field("host_url", &self.host_url)
            .field("organization", &self.organization)
            .field("scanner_path", &self.scanner_path)
            .field("dotnet_path", &self.dotnet_path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct GeneratedToken {
    #[serde(default)]
    token: Option<String>,
}

/// Pull the `token` field out of a token generation response.
pub fn extract_token(body: &str) -> Result<ScanToken> {
    let parsed: GeneratedToken = serde_json::from_str(body)?;
    parsed
        .token
        .filter(|token| !token.trim().is_empty())
        .map(ScanToken::new)
        .ok_or_else(|| ScanError::Engine("token not found in the response".into()))
}

/// Directory holding the shallowest `*.sln` under `root`; ties go to the
/// lexicographically first path.
pub fn find_solution_dir(root: &Path) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(ScanError::Engine(format!(
            "invalid start directory {}",
            root.display()
        )));
    }

    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(SOLUTION_EXTENSION))
        })
        .min_by_key(|entry| entry.depth())
        .and_then(|entry| entry.path().parent().map(Path::to_path_buf))
        .ok_or_else(|| {
            ScanError::Engine(format!(
                "solution file not found in or below {}",
                root.display()
            ))
        })
}

impl SonarCloudEngine {
    pub fn new(client: Client, config: &SonarConfig) -> Self {
        Self {
            client,
            host_url: config.host_url.as_str().trim_end_matches('/').to_string(),
            token: config.token.clone(),
            organization: config.organization.clone(),
            scanner_path: config.scanner_path.clone(),
            dotnet_path: config.dotnet_path.clone(),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/{path}", self.host_url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.token, None::<&str>)
    }

    /// Arguments for `begin`, `build` and `end`, in execution order.
    pub fn scanner_steps(&self, project: &ProjectKey, token: &ScanToken) -> Vec<(String, Vec<String>)> {
        vec![
            (
                self.scanner_path.clone(),
                vec![
                    "begin".into(),
                    format!("/k:{project}"),
                    format!("/o:{}", self.organization),
                    format!("/d:sonar.host.url={}", self.host_url),
                    format!("/d:sonar.token={}", token.expose()),
                ],
            ),
            (self.dotnet_path.clone(), vec!["build".into()]),
            (
                self.scanner_path.clone(),
                vec!["end".into(), format!("/d:sonar.token={}", token.expose())],
            ),
        ]
    }

    async fn run_step(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Path,
        token: &ScanToken,
    ) -> Result<()> {
        let command_line = redact(&format!("{program} {}", args.join(" ")), token.expose());
        info!(command = %command_line, dir = %working_dir.display(), "running scanner step");

        let output = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ScanError::Engine(format!("failed to start `{program}`: {err}")))?;

        let stdout = redact(&String::from_utf8_lossy(&output.stdout), token.expose());
        let stderr = redact(&String::from_utf8_lossy(&output.stderr), token.expose());
        if !output.status.success() {
            warn!(
                command = %command_line,
                status = %output.status,
                stdout = %truncate(&stdout),
                stderr = %truncate(&stderr),
                "scanner step failed"
            );
            return Err(ScanError::Engine(format!(
                "`{command_line}` exited with {}",
                output.status
            )));
        }

        if !stderr.trim().is_empty() {
            warn!(command = %command_line, stderr = %truncate(&stderr), "scanner step wrote to stderr");
        }
        debug!(command = %command_line, stdout = %truncate(&stdout), "scanner step finished");
        Ok(())
    }

    async fn generate_token(&self, name: &str) -> Result<reqwest::Response> {
        self.authed(self.client.post(self.api("user_tokens/generate")))
            .form(&[("name", name), ("organization", self.organization.as_str())])
            .send()
            .await
            .map_err(transport_error)
    }

    async fn revoke_token(&self, name: &str) -> Result<()> {
        let response = self
            .authed(self.client.post(self.api("user_tokens/revoke")))
            .form(&[("name", name), ("organization", self.organization.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ScanEngine for SonarCloudEngine {
    async fn create_project(&self, project: &ProjectKey) -> Result<()> {
        let response = self
            .authed(self.client.post(self.api("projects/create")))
            .form(&[
                ("project", project.as_str()),
                ("name", project.as_str()),
                ("organization", self.organization.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::BAD_REQUEST {
            let url = display_url(response.url());
            let body = response.text().await.unwrap_or_default();
            if body.contains("already exist") {
                info!("project already exists");
                return Ok(());
            }
            warn!(body = %truncate(&body), "project creation rejected");
            return Err(ScanError::HttpStatus { status: 400, url });
        }

        ensure_success(response).await?;
        info!("project created");
        Ok(())
    }

    async fn issue_token(&self, project: &ProjectKey) -> Result<ScanToken> {
        let name = format!("{project}Token");
        let mut response = self.generate_token(&name).await?;

        // A previous attempt for this project left its token behind.
        if response.status() == StatusCode::BAD_REQUEST {
            debug!(token_name = %name, "token name taken; revoking and regenerating");
            self.revoke_token(&name).await?;
            response = self.generate_token(&name).await?;
        }

        let response = ensure_success(response).await?;
        let body = response.text().await.map_err(transport_error)?;
        let token = extract_token(&body)?;
        info!(token_name = %name, "analysis token issued");
        Ok(token)
    }

    async fn execute(
        &self,
        project: &ProjectKey,
        source: &ExtractedSource,
        token: &ScanToken,
    ) -> Result<()> {
        let root = source.root.clone();
        let solution_dir = tokio::task::spawn_blocking(move || find_solution_dir(&root))
            .await
            .map_err(|err| ScanError::Internal(format!("solution search failed: {err}")))??;
        info!(dir = %solution_dir.display(), "solution located");

        for (program, args) in self.scanner_steps(project, token) {
            self.run_step(&program, &args, &solution_dir, token).await?;
        }
        Ok(())
    }

    async fn fetch_report(&self, project: &ProjectKey) -> Result<String> {
        let metric_keys = REQUESTED_METRIC_KEYS.join(",");
        let response = self
            .authed(self.client.get(self.api("measures/component")))
            .query(&[
                ("component", project.as_str()),
                ("metricKeys", metric_keys.as_str()),
                ("organization", self.organization.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response).await?;
        let body = response.text().await.map_err(transport_error)?;
        debug!(bytes = body.len(), "measures report fetched");
        Ok(body)
    }
}

fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "***")
}
