use std::sync::{Mutex, MutexGuard};

/// Per-token in-flight counters bounded by a fixed concurrency limit.
///
/// The lock is never held across an `.await`; every method is a short
/// critical section.
pub struct LoadTracker {
    limit: usize,
    counts: Mutex<Vec<usize>>,
}

impl LoadTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            counts: Mutex::new(Vec::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn counts(&self) -> MutexGuard<'_, Vec<usize>> {
        // counters are plain integers; a poisoned lock still holds usable data
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resize to `n` slots. Any size change drops the previous counts.
    pub fn ensure_counts(&self, n: usize) {
        let mut counts = self.counts();
        if counts.len() != n {
            if !counts.is_empty() {
                tracing::info!(
                    "[LoadTracker] Pool size {} -> {}, counters reinitialized",
                    counts.len(),
                    n
                );
            }
            *counts = vec![0; n];
        }
    }

    /// Zero everything when every slot is saturated but no job is tracked:
    /// the counters have drifted from reality.
    pub fn auto_reset(&self, n: usize, jobs_empty: bool) -> bool {
        let mut counts = self.counts();
        if n == 0 || counts.len() != n || !jobs_empty {
            return false;
        }
        if counts.iter().all(|&c| c >= self.limit) {
            tracing::warn!(
                "[LoadTracker] All {} slot(s) saturated with no tracked jobs, auto-resetting",
                n
            );
            counts.iter_mut().for_each(|c| *c = 0);
            return true;
        }
        false
    }

    /// First slot below the limit scanning from `start`; `start` itself when
    /// every slot is saturated.
    pub fn pick_index_by_load(&self, n: usize, start: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let start = start % n;
        let counts = self.counts();
        for offset in 0..n {
            let idx = (start + offset) % n;
            if counts.get(idx).copied().unwrap_or(0) < self.limit {
                return idx;
            }
        }
        start
    }

    pub fn is_saturated(&self, index: usize) -> bool {
        self.counts()
            .get(index)
            .map(|&c| c >= self.limit)
            .unwrap_or(false)
    }

    pub fn increment(&self, index: usize) {
        if let Some(c) = self.counts().get_mut(index) {
            *c += 1;
        }
    }

    pub fn decrement(&self, index: usize) {
        if let Some(c) = self.counts().get_mut(index) {
            *c = c.saturating_sub(1);
        }
    }

    pub fn reset_all(&self) {
        self.counts().iter_mut().for_each(|c| *c = 0);
    }

    pub fn snapshot(&self) -> Vec<usize> {
        self.counts().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(limit: usize, counts: &[usize]) -> LoadTracker {
        let tracker = LoadTracker::new(limit);
        tracker.ensure_counts(counts.len());
        for (idx, &c) in counts.iter().enumerate() {
            for _ in 0..c {
                tracker.increment(idx);
            }
        }
        tracker
    }

    #[test]
    fn ensure_counts_resizes_and_zeroes() {
        let tracker = tracker_with(2, &[1, 2]);
        tracker.ensure_counts(2);
        assert_eq!(tracker.snapshot(), vec![1, 2]);
        tracker.ensure_counts(3);
        assert_eq!(tracker.snapshot(), vec![0, 0, 0]);
        tracker.ensure_counts(1);
        assert_eq!(tracker.snapshot(), vec![0]);
    }

    #[test]
    fn pick_never_returns_saturated_slot_when_free_one_exists() {
        let limit = 2;
        let layouts: Vec<Vec<usize>> = vec![
            vec![0],
            vec![2, 0],
            vec![2, 2, 1],
            vec![3, 2, 2, 0],
            vec![1, 2, 5, 2],
        ];
        for counts in layouts {
            let tracker = tracker_with(limit, &counts);
            let n = counts.len();
            for start in 0..n {
                let idx = tracker.pick_index_by_load(n, start);
                assert!(counts[idx] < limit, "counts={:?} start={} idx={}", counts, start, idx);
            }
        }
    }

    #[test]
    fn pick_prefers_start_and_falls_back_to_it_when_all_saturated() {
        let tracker = tracker_with(2, &[0, 0, 0]);
        assert_eq!(tracker.pick_index_by_load(3, 1), 1);
        assert_eq!(tracker.pick_index_by_load(3, 4), 1);

        let full = tracker_with(2, &[2, 2, 2]);
        assert_eq!(full.pick_index_by_load(3, 2), 2);
    }

    #[test]
    fn auto_reset_only_when_all_saturated_and_no_jobs() {
        let tracker = tracker_with(2, &[2, 3]);
        assert!(!tracker.auto_reset(2, false));
        assert_eq!(tracker.snapshot(), vec![2, 3]);

        assert!(tracker.auto_reset(2, true));
        assert_eq!(tracker.snapshot(), vec![0, 0]);

        let partial = tracker_with(2, &[2, 1]);
        assert!(!partial.auto_reset(2, true));
        assert_eq!(partial.snapshot(), vec![2, 1]);
    }

    #[test]
    fn decrement_floors_at_zero_and_ignores_out_of_range() {
        let tracker = tracker_with(2, &[1]);
        tracker.decrement(0);
        tracker.decrement(0);
        tracker.decrement(7);
        tracker.increment(7);
        assert_eq!(tracker.snapshot(), vec![0]);
        assert!(!tracker.is_saturated(7));
    }
}
