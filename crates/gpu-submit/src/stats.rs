use std::sync::atomic::{AtomicU64, Ordering};

/// Submission-core counters. Updated with relaxed atomics from any thread.
#[derive(Debug, Default)]
pub struct SubmitStats {
    /// BO allocations served from a cache bucket.
    bo_cache_hits: AtomicU64,
    bo_cache_misses: AtomicU64,
    bo_fresh_allocs: AtomicU64,
    /// Cached BOs whose pages the kernel reclaimed while idle.
    bo_purged: AtomicU64,
    bo_zombies: AtomicU64,
    bo_closes: AtomicU64,
    submits: AtomicU64,
    failed_submits: AtomicU64,
    binds: AtomicU64,
    prim_cull_dispatches: AtomicU64,
    prim_cull_batches: AtomicU64,
    /// Draws that took the graphics-only path.
    prim_cull_fallbacks: AtomicU64,
}

impl SubmitStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_bo_cache_hits(&self) {
        self.bo_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bo_cache_misses(&self) {
        self.bo_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bo_fresh_allocs(&self) {
        self.bo_fresh_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bo_purged(&self) {
        self.bo_purged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bo_zombies(&self) {
        self.bo_zombies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bo_closes(&self) {
        self.bo_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submits(&self) {
        self.submits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_submits(&self) {
        self.failed_submits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_binds(&self) {
        self.binds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_prim_cull_dispatches(&self) {
        self.prim_cull_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_prim_cull_batches(&self) {
        self.prim_cull_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_prim_cull_fallbacks(&self) {
        self.prim_cull_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SubmitStatsSnapshot {
        SubmitStatsSnapshot {
            bo_cache_hits: self.bo_cache_hits.load(Ordering::Relaxed),
            bo_cache_misses: self.bo_cache_misses.load(Ordering::Relaxed),
            bo_fresh_allocs: self.bo_fresh_allocs.load(Ordering::Relaxed),
            bo_purged: self.bo_purged.load(Ordering::Relaxed),
            bo_zombies: self.bo_zombies.load(Ordering::Relaxed),
            bo_closes: self.bo_closes.load(Ordering::Relaxed),
            submits: self.submits.load(Ordering::Relaxed),
            failed_submits: self.failed_submits.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            prim_cull_dispatches: self.prim_cull_dispatches.load(Ordering::Relaxed),
            prim_cull_batches: self.prim_cull_batches.load(Ordering::Relaxed),
            prim_cull_fallbacks: self.prim_cull_fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitStatsSnapshot {
    pub bo_cache_hits: u64,
    pub bo_cache_misses: u64,
    pub bo_fresh_allocs: u64,
    pub bo_purged: u64,
    pub bo_zombies: u64,
    pub bo_closes: u64,
    pub submits: u64,
    pub failed_submits: u64,
    pub binds: u64,
    pub prim_cull_dispatches: u64,
    pub prim_cull_batches: u64,
    pub prim_cull_fallbacks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = SubmitStats::new();
        stats.inc_bo_cache_hits();
        stats.inc_bo_cache_hits();
        stats.inc_submits();
        stats.inc_prim_cull_fallbacks();
        let snap = stats.snapshot();
        assert_eq!(snap.bo_cache_hits, 2);
        assert_eq!(snap.submits, 1);
        assert_eq!(snap.prim_cull_fallbacks, 1);
        assert_eq!(snap.failed_submits, 0);
    }
}
