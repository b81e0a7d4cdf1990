use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::scan::request::ProjectKey;

/// In-process mutual exclusion keyed by project.
///
/// Two runs for the same project would race on the extraction directory and
/// on remote project creation; the second one backs off instead.
#[derive(Clone, Default)]
pub struct ScanLeases {
    held: Arc<Mutex<HashSet<ProjectKey>>>,
}

impl fmt::Debug for ScanLeases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanLeases")
            .field("held", &self.lock().len())
            .finish()
    }
}

impl ScanLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `project`, or `None` while another run holds it.
    pub fn try_acquire(&self, project: &ProjectKey) -> Option<ScanLease> {
        let mut held = self.lock();
        if !held.insert(project.clone()) {
            return None;
        }
        Some(ScanLease {
            project: project.clone(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, project: &ProjectKey) -> bool {
        self.lock().contains(project)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ProjectKey>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held for the duration of one run; released on drop.
pub struct ScanLease {
    project: ProjectKey,
    held: Arc<Mutex<HashSet<ProjectKey>>>,
}

impl fmt::Debug for ScanLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanLease")
            .field("project", &self.project)
            .finish()
    }
}

impl Drop for ScanLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.project);
    }
}
