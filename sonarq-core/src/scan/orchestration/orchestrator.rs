use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{
    config::{OrchestratorConfig, StepTimeouts, WorkspaceConfig},
    ledger::ProcessedLedger,
    lease::ScanLeases,
    outcome::ScanOutcome,
};
use crate::{
    error::{Result, ScanError},
    scan::{
        extract::{ExtractedSource, discard_archive, extract_artifact},
        ports::{ArtifactStore, ResultStore, ScanEngine},
        report,
        request::{ProjectKey, ScanRequest},
    },
};

/// Subdirectory of the work dir that receives downloaded archives. Kept apart
/// from extraction targets, which are named after the project key.
pub const DOWNLOAD_DIR: &str = ".downloads";

/// Contract the message loop uses to drive one request to completion.
#[async_trait]
pub trait ScanRunner: Send + Sync {
    /// Never fails; every failure is reported through the outcome.
    async fn run_scan(&self, request: &ScanRequest) -> ScanOutcome;
}

#[derive(Clone)]
pub struct ScanCollaborators {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub engine: Arc<dyn ScanEngine>,
    pub results: Arc<dyn ResultStore>,
}

impl ScanCollaborators {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        engine: Arc<dyn ScanEngine>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            artifacts,
            engine,
            results,
        }
    }
}

impl fmt::Debug for ScanCollaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCollaborators")
            .field("artifacts", &"ArtifactStore")
            .field("engine", &"ScanEngine")
            .field("results", &"ResultStore")
            .finish()
    }
}

/// Drives fetch → extract → provision → execute → report → persist for one
/// request at a time. Runs for different projects are independent and may
/// execute concurrently; runs for the same project are serialized by lease.
#[derive(Clone, Debug)]
pub struct ScanOrchestrator {
    collaborators: ScanCollaborators,
    workspace: WorkspaceConfig,
    timeouts: StepTimeouts,
    leases: ScanLeases,
    ledger: ProcessedLedger,
}

impl ScanOrchestrator {
    pub fn new(config: &OrchestratorConfig, collaborators: ScanCollaborators) -> Self {
        Self {
            collaborators,
            workspace: config.workspace.clone(),
            timeouts: config.timeouts,
            leases: ScanLeases::new(),
            ledger: ProcessedLedger::new(config.ledger),
        }
    }

    pub fn leases(&self) -> ScanLeases {
        self.leases.clone()
    }

    pub fn ledger(&self) -> ProcessedLedger {
        self.ledger.clone()
    }

    async fn run(&self, request: &ScanRequest, project: ProjectKey) -> ScanOutcome {
        let Some(_lease) = self.leases.try_acquire(&project) else {
            warn!("another run holds this project; backing off");
            return ScanOutcome::InFlight {
                scan_id: request.scan_id.clone(),
            };
        };

        if self.ledger.contains(&project).await {
            info!("project was processed recently; skipping");
            return ScanOutcome::AlreadyScanned {
                scan_id: request.scan_id.clone(),
            };
        }

        let mut extracted = None;
        match self.execute_steps(request, &project, &mut extracted).await {
            Ok(()) => {
                self.ledger.record(project).await;
                info!("scan completed");
                ScanOutcome::Completed
            }
            Err(err) => {
                if let Some(source) = extracted.as_ref()
                    && self.workspace.remove_sources_on_failure
                {
                    source.remove().await;
                }
                if matches!(err, ScanError::AlreadyProcessed(_)) {
                    self.ledger.record(project).await;
                }

                let outcome = ScanOutcome::from_error(&request.scan_id, err);
                match &outcome {
                    ScanOutcome::Failed { message, retryable } => {
                        error!(error = %message, retryable, "scan failed")
                    }
                    other => warn!(outcome = %other, "scan stopped early"),
                }
                outcome
            }
        }
    }

    async fn execute_steps(
        &self,
        request: &ScanRequest,
        project: &ProjectKey,
        extracted: &mut Option<ExtractedSource>,
    ) -> Result<()> {
        let work_dir = &self.workspace.work_dir;
        let t = self.timeouts;

        let downloads = work_dir.join(DOWNLOAD_DIR);
        let destination = downloads.join(request.scan_id.as_str());
        let fetched = bounded("fetch", t.fetch(), async {
            tokio::fs::create_dir_all(&downloads).await?;
            self.collaborators
                .artifacts
                .fetch(&request.scan_id, &request.user_id, destination)
                .await
        })
        .await?;
        let Some(artifact) = fetched else {
            return Err(ScanError::NotFound(request.scan_id.to_string()));
        };
        debug!(path = %artifact.local_path.display(), content_type = %artifact.content_type, "artifact downloaded");

        // Bounded internally; a failed or timed out extraction cleans up its
        // own directory.
        let unpacked = extract_artifact(&artifact, work_dir, project, t.extract()).await;
        discard_archive(&artifact).await;
        let source = unpacked?;
        *extracted = Some(source.clone());

        let engine = &self.collaborators.engine;
        bounded("provision", t.provision(), engine.create_project(project)).await?;
        let token = bounded("provision", t.provision(), engine.issue_token(project)).await?;

        bounded("execute", t.execute(), engine.execute(project, &source, &token)).await?;

        let settle = t.settle_delay();
        if !settle.is_zero() {
            debug!(delay_ms = settle.as_millis() as u64, "waiting for results to settle");
            tokio::time::sleep(settle).await;
        }

        let raw = bounded("report", t.report(), engine.fetch_report(project)).await?;
        let result = report::parse(Some(&raw))?;

        let saved = bounded(
            "persist",
            t.persist(),
            self.collaborators.results.save(&result),
        )
        .await?;
        if !saved {
            return Err(ScanError::Database(format!(
                "result for {project} was not persisted"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ScanRunner for ScanOrchestrator {
    async fn run_scan(&self, request: &ScanRequest) -> ScanOutcome {
        let project = request.project_key();
        let span = info_span!(
            "scan",
            scan_id = %request.scan_id,
            user_id = %request.user_id,
            project = %project
        );
        self.run(request, project).instrument(span).await
    }
}

async fn bounded<T, F>(step: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ScanError::Timeout { step, after: limit }),
    }
}
