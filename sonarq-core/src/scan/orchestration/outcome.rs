use std::fmt;

use super::config::AckPolicy;
use crate::{error::ScanError, scan::request::ScanId};

/// Terminal result of one scan run. Runs never fail with an error; every
/// internal failure is folded into one of these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    /// The artifact store had no blob for the request.
    NotDownloaded { scan_id: ScanId },
    /// The project was processed before (ledger hit or existing directory).
    AlreadyScanned { scan_id: ScanId },
    /// Another run currently owns the same project.
    InFlight { scan_id: ScanId },
    /// Any other failure. `retryable` records whether a redelivery could help.
    Failed { message: String, retryable: bool },
}

impl ScanOutcome {
    pub(crate) fn from_error(scan_id: &ScanId, err: ScanError) -> Self {
        match err {
            ScanError::NotFound(_) => ScanOutcome::NotDownloaded {
                scan_id: scan_id.clone(),
            },
            ScanError::AlreadyProcessed(_) => ScanOutcome::AlreadyScanned {
                scan_id: scan_id.clone(),
            },
            other => ScanOutcome::Failed {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }

    /// How the message that carried this run should be settled.
    pub fn disposition(&self, policy: AckPolicy) -> Disposition {
        match (policy, self) {
            (AckPolicy::AlwaysComplete, _) => Disposition::Complete,
            (AckPolicy::RetryTransient, ScanOutcome::Failed { retryable: true, .. })
            | (AckPolicy::RetryTransient, ScanOutcome::InFlight { .. }) => Disposition::Abandon,
            (AckPolicy::RetryTransient, _) => Disposition::Complete,
        }
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Completed => f.write_str("ok"),
            ScanOutcome::NotDownloaded { scan_id } => {
                write!(f, "File {scan_id} could not be downloaded.")
            }
            ScanOutcome::AlreadyScanned { scan_id } => {
                write!(f, "The file '{scan_id}' has already been scanned.")
            }
            ScanOutcome::InFlight { scan_id } => {
                write!(f, "The file '{scan_id}' is already being scanned.")
            }
            ScanOutcome::Failed { message, .. } => write!(f, "An error occurred: {message}"),
        }
    }
}

/// Settlement of an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the subscription.
    Complete,
    /// Release the lock so the transport can redeliver.
    Abandon,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::request::ScanRequest;

    fn scan_id() -> ScanId {
        ScanRequest::new("proj.zip", "u").scan_id
    }

    #[test]
    fn renders_legacy_outcome_strings() {
        assert_eq!(ScanOutcome::Completed.to_string(), "ok");
        assert_eq!(
            ScanOutcome::NotDownloaded { scan_id: scan_id() }.to_string(),
            "File proj.zip could not be downloaded."
        );
        assert_eq!(
            ScanOutcome::AlreadyScanned { scan_id: scan_id() }.to_string(),
            "The file 'proj.zip' has already been scanned."
        );
        assert_eq!(
            ScanOutcome::Failed {
                message: "boom".into(),
                retryable: false
            }
            .to_string(),
            "An error occurred: boom"
        );
    }

    #[test]
    fn errors_fold_into_outcomes() {
        assert!(matches!(
            ScanOutcome::from_error(&scan_id(), ScanError::NotFound("x".into())),
            ScanOutcome::NotDownloaded { .. }
        ));
        assert!(matches!(
            ScanOutcome::from_error(&scan_id(), ScanError::AlreadyProcessed("x".into())),
            ScanOutcome::AlreadyScanned { .. }
        ));
        assert_eq!(
            ScanOutcome::from_error(&scan_id(), ScanError::Transport("reset".into())),
            ScanOutcome::Failed {
                message: "Transport error: reset".into(),
                retryable: true
            }
        );
    }

    #[test]
    fn always_complete_never_abandons() {
        let transient = ScanOutcome::Failed {
            message: "timeout".into(),
            retryable: true,
        };
        assert_eq!(
            transient.disposition(AckPolicy::AlwaysComplete),
            Disposition::Complete
        );
        assert_eq!(
            ScanOutcome::InFlight { scan_id: scan_id() }.disposition(AckPolicy::AlwaysComplete),
            Disposition::Complete
        );
    }

    #[test]
    fn retry_transient_abandons_only_retryable_failures() {
        let policy = AckPolicy::RetryTransient;
        let transient = ScanOutcome::Failed {
            message: "timeout".into(),
            retryable: true,
        };
        let terminal = ScanOutcome::Failed {
            message: "bad report".into(),
            retryable: false,
        };

        assert_eq!(transient.disposition(policy), Disposition::Abandon);
        assert_eq!(
            ScanOutcome::InFlight { scan_id: scan_id() }.disposition(policy),
            Disposition::Abandon
        );
        assert_eq!(terminal.disposition(policy), Disposition::Complete);
        assert_eq!(ScanOutcome::Completed.disposition(policy), Disposition::Complete);
        assert_eq!(
            ScanOutcome::NotDownloaded { scan_id: scan_id() }.disposition(policy),
            Disposition::Complete
        );
        assert_eq!(
            ScanOutcome::AlreadyScanned { scan_id: scan_id() }.disposition(policy),
            Disposition::Complete
        );
    }
}
