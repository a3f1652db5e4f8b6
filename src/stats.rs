//! Counters recorded by channels, caches, and the PTW. These are plain
//! data: printing, aggregation across a run, and ROI-vs-warmup slicing
//! are the job of an external collaborator. `begin_phase`/`end_phase`
//! only snapshot and reset so that collaborator can diff two points in
//! time.

use serde::Serialize;

/// Per-channel queue traffic counters, mirroring the reference
/// simulator's `cache_queue_stats`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ChannelStats {
    pub rq_access: u64,
    pub rq_merged: u64,
    pub rq_full: u64,
    pub rq_to_cache: u64,
    pub pq_access: u64,
    pub pq_merged: u64,
    pub pq_full: u64,
    pub pq_to_cache: u64,
    pub wq_access: u64,
    pub wq_merged: u64,
    pub wq_full: u64,
    pub wq_to_cache: u64,
    pub wq_forward: u64,
}

/// Per-cache counters: hits/misses broken down by request kind, MSHR
/// occupancy peak, evictions, and useful prefetches.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub mshr_merges: u64,
    pub mshr_promotions: u64,
    pub mshr_peak_occupancy: usize,
    pub evictions: u64,
    pub dirty_evictions: u64,
    pub useful_prefetches: u64,
    pub issued_prefetches: u64,
}

/// Per-PTW counters: one entry per walk step taken/elided.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PtwStats {
    pub walks_started: u64,
    pub walks_completed: u64,
    pub steps_issued: u64,
    pub pscl_hits: [u64; 8],
    pub pscl_misses: [u64; 8],
    pub mshr_merges: u64,
}

/// A snapshot of a stats struct taken at a phase boundary (e.g. the end
/// of warmup / the end of ROI); produced by `StatsSnapshot::new` and
/// serialized by an external collaborator, never printed by this crate.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot<T> {
    pub begin_cycle: u64,
    pub end_cycle: u64,
    pub stats: T,
}

impl<T: Clone> StatsSnapshot<T> {
    pub fn new(begin_cycle: u64, end_cycle: u64, stats: &T) -> Self {
        StatsSnapshot {
            begin_cycle,
            end_cycle,
            stats: stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes() {
        let stats = ChannelStats {
            rq_access: 3,
            ..Default::default()
        };
        let snap = StatsSnapshot::new(0, 100, &stats);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"rq_access\":3"));
    }
}
