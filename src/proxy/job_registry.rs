use dashmap::DashMap;
use std::sync::Arc;

use crate::proxy::load_tracker::LoadTracker;

/// Job id -> index of the token that created it.
///
/// Each tracked job holds one load slot on its token for its whole lifetime.
/// Entries live in process memory only and have no expiry.
pub struct JobRegistry {
    jobs: DashMap<String, usize>,
    load: Arc<LoadTracker>,
}

impl JobRegistry {
    pub fn new(load: Arc<LoadTracker>) -> Self {
        Self {
            jobs: DashMap::new(),
            load,
        }
    }

    /// Track `job_id` and reserve a slot on `token_index`.
    /// Re-recording the same id moves the reservation instead of doubling it.
    pub fn record(&self, job_id: &str, token_index: usize) {
        if let Some(previous) = self.jobs.insert(job_id.to_string(), token_index) {
            self.load.decrement(previous);
        }
        self.load.increment(token_index);
        tracing::debug!("[JobRegistry] Recorded job {} on slot #{}", job_id, token_index);
    }

    pub fn lookup(&self, job_id: &str) -> Option<usize> {
        self.jobs.get(job_id).map(|v| *v)
    }

    /// Drop the job and free its slot. Unknown ids are ignored.
    pub fn release(&self, job_id: &str) -> Option<usize> {
        let (_, token_index) = self.jobs.remove(job_id)?;
        self.load.decrement(token_index);
        tracing::debug!("[JobRegistry] Released job {} from slot #{}", job_id, token_index);
        Some(token_index)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Forget every job without touching counters; callers reset counters themselves.
    pub fn clear(&self) {
        self.jobs.clear();
    }
}
