//! Inbound scan request decoding.
//!
//! Messages arrive as JSON documents with lower-case keys
//! (`scanid`, `userid`, `projectlanguage`). They are decoded exactly once into
//! a [`ScanRequest`]; everything downstream works with the validated value.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Only C# projects are accepted by this worker.
pub const SUPPORTED_LANGUAGE: &str = "c#";

/// Suffix stripped from a scan identifier to form the project key.
pub const ARCHIVE_SUFFIX: &str = ".zip";

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("message body is not a JSON document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),

    #[error("unsupported project language `{0}`")]
    UnsupportedLanguage(String),

    #[error("scan id `{0}` is not a plain archive name")]
    InvalidScanId(String),
}

/// Caller-supplied archive name, e.g. `proj_1699625745679.zip`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanId(String);

impl ScanId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Project identifier used for extraction, remote project naming, and
    /// report lookup. Only a trailing [`ARCHIVE_SUFFIX`] is removed.
    pub fn project_key(&self) -> ProjectKey {
        let stem = self.0.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(&self.0);
        ProjectKey(stem.to_string())
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scan identifier with the archive suffix stripped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey(String);

impl ProjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated request to scan one uploaded archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub scan_id: ScanId,
    pub user_id: UserId,
    pub project_language: String,
}

#[derive(Debug, Deserialize)]
struct RawScanRequest {
    // Older producers named the archive `filename`.
    #[serde(default, alias = "filename")]
    scanid: Option<String>,
    #[serde(default)]
    userid: Option<String>,
    #[serde(default)]
    projectlanguage: Option<String>,
}

impl ScanRequest {
    /// Build a request from already-trusted parts. Used by tests and tools;
    /// message bodies go through [`ScanRequest::decode`].
    pub fn new(scan_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            scan_id: ScanId(scan_id.into()),
            user_id: UserId(user_id.into()),
            project_language: SUPPORTED_LANGUAGE.to_string(),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, RequestError> {
        let raw: RawScanRequest = serde_json::from_slice(body)?;

        let scan_id = required(raw.scanid, "scanid")?;
        let user_id = required(raw.userid, "userid")?;
        let language = required(raw.projectlanguage, "projectlanguage")?;

        if language != SUPPORTED_LANGUAGE {
            return Err(RequestError::UnsupportedLanguage(language));
        }

        // The scan id becomes a path component on disk and a blob name segment.
        // Dot-prefixed names are reserved for the worker's own directories.
        if scan_id.starts_with('.') || scan_id.contains(['/', '\\']) || scan_id.contains("..") {
            return Err(RequestError::InvalidScanId(scan_id));
        }
        let scan_id = ScanId(scan_id);
        if scan_id.project_key().as_str().is_empty() {
            return Err(RequestError::InvalidScanId(scan_id.0));
        }

        Ok(Self {
            scan_id,
            user_id: UserId(user_id),
            project_language: language,
        })
    }

    pub fn project_key(&self) -> ProjectKey {
        self.scan_id.project_key()
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, RequestError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(RequestError::MissingField(field)),
    }
}
