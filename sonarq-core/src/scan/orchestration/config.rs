use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Global knobs that tune orchestrator and message loop behaviour.
///
/// All fields carry defaults so deployments only need to supply the values
/// they want to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Local working area for downloads and extracted sources.
    pub workspace: WorkspaceConfig,
    /// Per-step bounded waits and the post-execution settle delay.
    pub timeouts: StepTimeouts,
    /// Processed-identifier ledger used to short-circuit duplicates.
    pub ledger: LedgerConfig,
    /// Message loop concurrency, backoff, and acknowledgement policy.
    pub messages: MessageLoopConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root directory; archives land here and projects unpack beneath it.
    pub work_dir: PathBuf,
    /// Remove the extracted sources when a run fails after extraction so a
    /// redelivered message can try again.
    pub remove_sources_on_failure: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            remove_sources_on_failure: true,
        }
    }
}

/// Bounded waits per orchestration step, in milliseconds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTimeouts {
    pub fetch_ms: u64,
    pub extract_ms: u64,
    pub provision_ms: u64,
    pub execute_ms: u64,
    pub report_ms: u64,
    pub persist_ms: u64,
    /// Pause after execution before querying results; the service publishes
    /// measures asynchronously.
    pub settle_delay_ms: u64,
}

impl StepTimeouts {
    pub fn fetch(&self) -> Duration {
        Duration::from_millis(self.fetch_ms)
    }

    pub fn extract(&self) -> Duration {
        Duration::from_millis(self.extract_ms)
    }

    pub fn provision(&self) -> Duration {
        Duration::from_millis(self.provision_ms)
    }

    pub fn execute(&self) -> Duration {
        Duration::from_millis(self.execute_ms)
    }

    pub fn report(&self) -> Duration {
        Duration::from_millis(self.report_ms)
    }

    pub fn persist(&self) -> Duration {
        Duration::from_millis(self.persist_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            fetch_ms: 5 * 60 * 1_000,
            extract_ms: 2 * 60 * 1_000,
            provision_ms: 60 * 1_000,
            execute_ms: 30 * 60 * 1_000,
            report_ms: 60 * 1_000,
            persist_ms: 30 * 1_000,
            settle_delay_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long a successfully processed identifier is remembered (seconds).
    pub ttl_secs: u64,
    /// Upper bound on remembered identifiers; oldest entries go first.
    pub max_entries: usize,
}

impl LedgerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_entries: 10_000,
        }
    }
}

/// How scan outcomes translate into message settlement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Complete every message that reached the orchestrator, whatever the
    /// outcome. Transient failures are logged and dropped.
    AlwaysComplete,
    /// Abandon messages whose run failed for a retryable reason or collided
    /// with an in-flight run; the broker redelivers them and dead-letters
    /// after its own max delivery count.
    #[default]
    RetryTransient,
}

impl std::str::FromStr for AckPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "always-complete" | "always_complete" => Ok(AckPolicy::AlwaysComplete),
            "retry-transient" | "retry_transient" => Ok(AckPolicy::RetryTransient),
            other => Err(format!(
                "unknown ack policy `{other}` (expected always-complete or retry-transient)"
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageLoopConfig {
    /// Number of messages handled concurrently.
    pub concurrency: usize,
    pub ack_policy: AckPolicy,
    /// Pause after a receive error before polling again (ms).
    pub receive_error_backoff_ms: u64,
    /// Pause when the source reports no message (ms).
    pub idle_poll_ms: u64,
    /// Cadence of the "waiting for messages" heartbeat (ms).
    pub idle_log_interval_ms: u64,
    /// How often a held message lock is renewed while its scan runs (ms).
    /// Must stay below the broker's lock duration.
    pub lock_renew_interval_ms: u64,
    /// Pause between attempts while another run owns the same project (ms).
    pub in_flight_retry_ms: u64,
    /// Longest a message waits on a busy project before it is settled by the
    /// ack policy (ms).
    pub in_flight_max_wait_ms: u64,
}

impl MessageLoopConfig {
    pub fn receive_error_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_error_backoff_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn idle_log_interval(&self) -> Duration {
        Duration::from_millis(self.idle_log_interval_ms)
    }

    pub fn lock_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lock_renew_interval_ms)
    }

    pub fn in_flight_retry(&self) -> Duration {
        Duration::from_millis(self.in_flight_retry_ms)
    }

    pub fn in_flight_max_wait(&self) -> Duration {
        Duration::from_millis(self.in_flight_max_wait_ms)
    }
}

impl Default for MessageLoopConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            ack_policy: AckPolicy::default(),
            receive_error_backoff_ms: 5_000,
            idle_poll_ms: 250,
            idle_log_interval_ms: 10_000,
            lock_renew_interval_ms: 20_000,
            in_flight_retry_ms: 15_000,
            in_flight_max_wait_ms: 35 * 60 * 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_payload_keeps_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"timeouts": {"settle_delay_ms": 0}, "messages": {"ack_policy": "always-complete"}}"#,
        )
        .expect("partial config");

        assert_eq!(config.timeouts.settle_delay(), Duration::ZERO);
        assert_eq!(config.timeouts.execute(), Duration::from_secs(30 * 60));
        assert_eq!(config.messages.ack_policy, AckPolicy::AlwaysComplete);
        assert_eq!(config.messages.concurrency, 1);
        assert!(config.workspace.remove_sources_on_failure);
    }

    #[test]
    fn busy_project_wait_outlasts_a_full_scan() {
        let defaults = OrchestratorConfig::default();
        let messages = &defaults.messages;

        assert!(messages.in_flight_max_wait() > defaults.timeouts.execute());
        assert!(messages.in_flight_retry() > Duration::ZERO);
        assert!(messages.lock_renew_interval() < Duration::from_secs(60));
    }

    #[test]
    fn ack_policy_parses_both_spellings() {
        assert_eq!("retry_transient".parse::<AckPolicy>(), Ok(AckPolicy::RetryTransient));
        assert_eq!(" Always-Complete ".parse::<AckPolicy>(), Ok(AckPolicy::AlwaysComplete));
        assert!("sometimes".parse::<AckPolicy>().is_err());
    }
}
