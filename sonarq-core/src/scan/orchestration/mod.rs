pub mod config;
pub mod lease;
pub mod ledger;
pub mod orchestrator;
pub mod outcome;
pub mod runtime;

pub use config::{
    AckPolicy, LedgerConfig, MessageLoopConfig, OrchestratorConfig, StepTimeouts, WorkspaceConfig,
};
pub use lease::{ScanLease, ScanLeases};
pub use ledger::ProcessedLedger;
pub use orchestrator::{DOWNLOAD_DIR, ScanCollaborators, ScanOrchestrator, ScanRunner};
pub use outcome::{Disposition, ScanOutcome};
pub use runtime::{InMemoryMessageSource, InboundMessage, MessageLoop, MessageSource};
