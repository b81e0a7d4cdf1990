//! # Sonarq Core
//!
//! Core library for the sonarq scan worker. It turns a "scan requested"
//! message into a stored static-analysis result.
//!
//! ## Architecture
//!
//! - [`scan::request`]: inbound message decoding and validation
//! - [`scan::extract`]: local unpacking of downloaded source archives
//! - [`scan::report`]: mapping of the measures report onto [`ScanResult`]
//! - [`scan::ports`]: traits for the artifact store, scan engine and result store
//! - [`scan::orchestration`]: the scan pipeline, idempotency guards and the
//!   message loop that settles each message
//!
//! Concrete network and database clients live in the worker crate; this crate
//! only depends on the traits.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Error types and error handling utilities
pub mod error;

/// Scan domain entrypoint bundling request handling, extraction, reports and orchestration.
pub mod scan;

pub use error::{Result, ScanError};
pub use scan::ScanResult;
