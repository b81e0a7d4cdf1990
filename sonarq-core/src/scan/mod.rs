//! Scan domain: request decoding, artifact extraction, report mapping, and the
//! orchestration pipeline that ties them to external collaborators.

pub mod extract;
pub mod orchestration;
pub mod ports;
pub mod report;
pub mod request;

pub use extract::{ExtractedSource, discard_archive, extract_artifact};
pub use ports::{ArtifactStore, ResultStore, RetrievedArtifact, ScanEngine, ScanToken};
pub use report::{REQUESTED_METRIC_KEYS, ReportError, ScanResult};
pub use request::{ProjectKey, RequestError, ScanId, ScanRequest, UserId};
