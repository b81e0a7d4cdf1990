//! Cloud adapters behind the scan collaborator ports.

pub mod blob_store;
pub mod http;
pub mod result_store;
pub mod service_bus;
pub mod signing;
pub mod sonar_engine;

pub use blob_store::BlobArtifactStore;
pub use result_store::{MIGRATOR, PostgresResultStore};
pub use service_bus::ServiceBusSource;
pub use sonar_engine::SonarCloudEngine;
