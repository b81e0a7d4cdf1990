//! Narrow interfaces to the external systems a scan touches.
//!
//! Implementations live in `sonarq-worker`; tests use in-memory stubs.

use std::{fmt, path::PathBuf};

use async_trait::async_trait;

use crate::{
    error::Result,
    scan::{
        extract::ExtractedSource,
        report::ScanResult,
        request::{ProjectKey, ScanId, UserId},
    },
};

/// Archive downloaded to local disk for one scan run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievedArtifact {
    pub local_path: PathBuf,
    pub original_name: String,
    pub content_type: String,
}

/// Credential issued by the analysis service for a single project.
#[derive(Clone, PartialEq, Eq)]
pub struct ScanToken(String);

impl ScanToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ScanToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScanToken(***)")
    }
}

/// Blob storage holding uploaded archives under `userId/scanId`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Download the artifact into `destination`. Returns `Ok(None)` when the
    /// blob does not exist; any other failure is an error.
    async fn fetch(
        &self,
        scan_id: &ScanId,
        user_id: &UserId,
        destination: PathBuf,
    ) -> Result<Option<RetrievedArtifact>>;
}

/// Remote analysis service plus the local scanner CLI.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    async fn create_project(&self, project: &ProjectKey) -> Result<()>;

    async fn issue_token(&self, project: &ProjectKey) -> Result<ScanToken>;

    /// Run the analysis over the extracted sources using `token`.
    async fn execute(
        &self,
        project: &ProjectKey,
        source: &ExtractedSource,
        token: &ScanToken,
    ) -> Result<()>;

    /// Raw measures report for `project`.
    async fn fetch_report(&self, project: &ProjectKey) -> Result<String>;
}

/// Durable home of scan results. Every call inserts a new row.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Returns `true` when at least one row was written.
    async fn save(&self, result: &ScanResult) -> Result<bool>;
}
