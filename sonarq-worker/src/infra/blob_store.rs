//! Archive download from blob storage using Shared Key authorization.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{
    Client, StatusCode, Url,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use sonarq_config::BlobStorageConfig;
use sonarq_core::{
    error::{Result, ScanError},
    scan::{ArtifactStore, RetrievedArtifact, ScanId, UserId},
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    http::{ensure_success, transport_error},
    signing::{shared_key_authorization, shared_key_string_to_sign},
};

pub const STORAGE_API_VERSION: &str = "2021-08-06";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct BlobArtifactStore {
    client: Client,
    account_name: String,
    account_key: String,
    endpoint: Url,
    container: String,
}

impl fmt::Debug for BlobArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobArtifactStore")
            .field("account_name", &self.account_name)
            .field("endpoint", &self.endpoint.as_str())
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl BlobArtifactStore {
    pub fn new(client: Client, config: &BlobStorageConfig) -> Self {
        Self {
            client,
            account_name: config.connection.account_name.clone(),
            account_key: config.connection.account_key.clone(),
            endpoint: config.connection.blob_endpoint.clone(),
            container: config.container.clone(),
        }
    }

    /// `{endpoint}/{container}/{userId}/{scanId}` with each segment escaped.
    pub fn blob_url(&self, user_id: &UserId, scan_id: &ScanId) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ScanError::Internal(format!("blob endpoint {} cannot be a base", self.endpoint)))?
            .pop_if_empty()
            .push(&self.container)
            .push(user_id.as_str())
            .push(scan_id.as_str());
        Ok(url)
    }

    async fn download(&self, response: reqwest::Response, destination: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_error)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl ArtifactStore for BlobArtifactStore {
    async fn fetch(
        &self,
        scan_id: &ScanId,
        user_id: &UserId,
        destination: PathBuf,
    ) -> Result<Option<RetrievedArtifact>> {
        let url = self.blob_url(user_id, scan_id)?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let string_to_sign = shared_key_string_to_sign(
            "GET",
            &[("x-ms-date", date.as_str()), ("x-ms-version", STORAGE_API_VERSION)],
            &self.account_name,
            url.path(),
        );
        let authorization =
            shared_key_authorization(&self.account_name, &self.account_key, &string_to_sign)?;

        debug!(blob = %url.path(), "downloading blob");
        let response = self
            .client
            .get(url.clone())
            .header("x-ms-date", &date)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            info!(blob = %url.path(), "blob does not exist");
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let written = match self.download(response, &destination).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&destination).await {
                    warn!(path = %destination.display(), error = %cleanup, "failed to remove partial download");
                }
                return Err(err);
            }
        };
        info!(path = %destination.display(), bytes = written, %content_type, "blob downloaded");

        Ok(Some(RetrievedArtifact {
            local_path: destination,
            original_name: scan_id.to_string(),
            content_type,
        }))
    }
}
