use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use super::config::LedgerConfig;
use crate::scan::request::ProjectKey;

/// Recently processed projects, remembered for a bounded time.
///
/// Checked before any download so a redelivered message for a finished scan
/// is recognised without touching the filesystem.
#[derive(Clone, Debug)]
pub struct ProcessedLedger {
    inner: Arc<Mutex<HashMap<ProjectKey, Instant>>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for ProcessedLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl ProcessedLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
        }
    }

    pub async fn contains(&self, project: &ProjectKey) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.get(project) {
            Some(recorded) if recorded.elapsed() < self.ttl => true,
            Some(_) => {
                guard.remove(project);
                false
            }
            None => false,
        }
    }

    pub async fn record(&self, project: ProjectKey) {
        let mut guard = self.inner.lock().await;
        let ttl = self.ttl;
        guard.retain(|_, recorded| recorded.elapsed() < ttl);

        if guard.len() >= self.max_entries
            && !guard.contains_key(&project)
            && let Some(oldest) = guard
                .iter()
                .min_by_key(|(_, recorded)| **recorded)
                .map(|(key, _)| key.clone())
        {
            debug!(project = %oldest, "ledger full; evicting oldest entry");
            guard.remove(&oldest);
        }

        guard.insert(project, Instant::now());
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
