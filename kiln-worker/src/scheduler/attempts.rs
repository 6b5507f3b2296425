//! In-process delivery attempt tracking
//!
//! Brokers that do not report a delivery count still redeliver the same
//! payload, so failures are counted per payload digest. Entries are cleared
//! when a task finally succeeds or is dead-lettered.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Tracked payloads before the table is reset
const MAX_TRACKED: usize = 10_000;

/// Counts failed attempts per message payload
#[derive(Debug, Default)]
pub struct AttemptTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed attempt and returns the failure count including it
    pub fn record_failure(&self, payload: &[u8]) -> u32 {
        let id = identity(payload);
        let mut failures = self.lock();

        if failures.len() >= MAX_TRACKED && !failures.contains_key(&id) {
            // Broker counts take over for anything forgotten here
            debug!("Attempt table full ({} entries), resetting", failures.len());
            failures.clear();
        }

        let count = failures.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    /// Forgets the payload's failure history
    pub fn clear(&self, payload: &[u8]) {
        self.lock().remove(&identity(payload));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        // A poisoned table only loses counts; keep using it
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hex SHA-256 of the raw payload
fn identity(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}
