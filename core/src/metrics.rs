//! Process-wide atomic counters. The core bumps these directly; the daemon
//! binary reads them into its Prometheus registry (spec.md SPEC_FULL §3 —
//! core stays free of a metrics-backend dependency).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub garbage_frames: AtomicU64,
    pub unknown_family: AtomicU64,
    pub missing_ctid: AtomicU64,
    pub conntrack_garbage: AtomicU64,
    pub conntrack_errors: AtomicU64,
    pub conntrack_dumps: AtomicU64,
    pub plugin_panics: AtomicU64,
    pub plugin_timeouts: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub cert_cache_hits: AtomicU64,
    pub cert_cache_misses: AtomicU64,
    pub cert_cache_inflight_joins: AtomicU64,
    pub classify_cache_hits: AtomicU64,
    pub classify_cache_misses: AtomicU64,
    pub classify_retries: AtomicU64,
    pub classify_unknown_replies: AtomicU64,
    pub verdicts_submitted: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            garbage_frames: self.garbage_frames.load(Ordering::Relaxed),
            unknown_family: self.unknown_family.load(Ordering::Relaxed),
            missing_ctid: self.missing_ctid.load(Ordering::Relaxed),
            conntrack_garbage: self.conntrack_garbage.load(Ordering::Relaxed),
            conntrack_errors: self.conntrack_errors.load(Ordering::Relaxed),
            conntrack_dumps: self.conntrack_dumps.load(Ordering::Relaxed),
            plugin_panics: self.plugin_panics.load(Ordering::Relaxed),
            plugin_timeouts: self.plugin_timeouts.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            cert_cache_hits: self.cert_cache_hits.load(Ordering::Relaxed),
            cert_cache_misses: self.cert_cache_misses.load(Ordering::Relaxed),
            cert_cache_inflight_joins: self.cert_cache_inflight_joins.load(Ordering::Relaxed),
            classify_cache_hits: self.classify_cache_hits.load(Ordering::Relaxed),
            classify_cache_misses: self.classify_cache_misses.load(Ordering::Relaxed),
            classify_retries: self.classify_retries.load(Ordering::Relaxed),
            classify_unknown_replies: self.classify_unknown_replies.load(Ordering::Relaxed),
            verdicts_submitted: self.verdicts_submitted.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time read of every counter, handed to the daemon's metrics
/// exporter on its collection interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub garbage_frames: u64,
    pub unknown_family: u64,
    pub missing_ctid: u64,
    pub conntrack_garbage: u64,
    pub conntrack_errors: u64,
    pub conntrack_dumps: u64,
    pub plugin_panics: u64,
    pub plugin_timeouts: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub cert_cache_hits: u64,
    pub cert_cache_misses: u64,
    pub cert_cache_inflight_joins: u64,
    pub classify_cache_hits: u64,
    pub classify_cache_misses: u64,
    pub classify_retries: u64,
    pub classify_unknown_replies: u64,
    pub verdicts_submitted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_snapshot() {
        let counters = Counters::new();
        Counters::bump(&counters.garbage_frames);
        Counters::bump(&counters.garbage_frames);
        assert_eq!(counters.snapshot().garbage_frames, 2);
    }
}
