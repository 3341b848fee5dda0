//! Per-submission locks.
//!
//! Recomputing a submission reads its sources and then writes its aggregate.
//! Two recomputes of the same submission must not interleave, or an older
//! read could overwrite a newer write. Distinct submissions proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use patchtag_core::SubmissionId;

/// A set of async mutexes keyed by submission id.
#[derive(Debug, Default)]
pub struct SubmissionLocks {
    locks: Mutex<HashMap<SubmissionId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a submission is being recomputed.
pub struct SubmissionGuard {
    _guard: OwnedMutexGuard<()>,
}

impl SubmissionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a submission.
    pub async fn lock(&self, id: SubmissionId) -> SubmissionGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody else holds are dropped to keep the map small.
            locks.retain(|key, m| *key == id || Arc::strong_count(m) > 1);
            locks.entry(id).or_default().clone()
        };
        SubmissionGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
