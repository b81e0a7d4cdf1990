//! # sonarq worker
//!
//! Long-running consumer that turns scan requests from a topic subscription
//! into SonarCloud analyses and persists the resulting metrics.
//!
//! The pipeline itself lives in `sonarq-core`; this crate supplies the
//! adapters it runs against:
//!
//! - [`infra::ServiceBusSource`] receives and settles messages
//! - [`infra::BlobArtifactStore`] downloads uploaded archives
//! - [`infra::SonarCloudEngine`] provisions projects and drives the scanner
//! - [`infra::PostgresResultStore`] stores mapped results

pub mod infra;
pub mod telemetry;
