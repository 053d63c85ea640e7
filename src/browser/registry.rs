//! Active-browser registry: tracks which instances currently have an open
//! browser and lets the Fleet Scheduler's janitor force-close one. Replaces
//! the source's long-lived `BrowserPool` (which kept sessions open for
//! reuse) with a much lighter "who's open right now" index, since the new
//! Worker opens and closes a browser once per attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

struct Entry {
    opened_at: DateTime<Utc>,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct ActiveBrowsers {
    entries: RwLock<HashMap<u32, Entry>>,
}

impl ActiveBrowsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the Worker right after a browser successfully launches.
    /// Returns the cancellation flag the Worker must poll between steps.
    pub fn register(&self, instance_id: u32) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        self.entries.write().insert(
            instance_id,
            Entry { opened_at: Utc::now(), cancel: cancel.clone() },
        );
        cancel
    }

    pub fn unregister(&self, instance_id: u32) {
        self.entries.write().remove(&instance_id);
    }

    /// Signal the Worker running for `instance_id` to close its browser at
    /// the next checkpoint. Returns false if no browser is registered for
    /// that instance.
    pub fn force_close(&self, instance_id: u32) -> bool {
        if let Some(entry) = self.entries.read().get(&instance_id) {
            entry.cancel.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn list_open(&self) -> Vec<(u32, DateTime<Utc>)> {
        self.entries
            .read()
            .iter()
            .map(|(id, e)| (*id, e.opened_at))
            .collect()
    }

    pub fn opened_at(&self, instance_id: u32) -> Option<DateTime<Utc>> {
        self.entries.read().get(&instance_id).map(|e| e.opened_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_close_requires_registration() {
        let registry = ActiveBrowsers::new();
        assert!(!registry.force_close(1));
        let cancel = registry.register(1);
        assert!(registry.force_close(1));
        assert!(cancel.load(Ordering::SeqCst));
        registry.unregister(1);
        assert!(registry.list_open().is_empty());
    }
}
