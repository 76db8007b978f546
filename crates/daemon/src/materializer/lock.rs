use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One writer per external timeline; a second writer is turned away, not queued
#[derive(Default)]
pub struct TimelineLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TimelineLocks {
    pub fn try_acquire(&self, timeline: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(timeline.to_string()).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }
}
