//! Counters for the MTA-STS policy cache

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters maintained by a policy cache instance. Read-only from the
/// outside; use [`CacheMetrics::snapshot`] or [`CacheMetrics::as_pairs`].
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Total fetches through the cache
    pub(crate) fetches: Counter,
    /// Cache hits
    pub(crate) hits: Counter,
    /// Entries found expired on load
    pub(crate) expired: Counter,
    /// I/O errors while maintaining the cache
    pub(crate) io_errors: Counter,
    /// Failed upstream fetches
    pub(crate) failed_fetch: Counter,
    /// Invalid policies found in the cache
    pub(crate) invalid: Counter,
    /// Policy encoding failures
    pub(crate) marshal_errors: Counter,
    /// Policy decoding failures
    pub(crate) unmarshal_errors: Counter,
    /// Completed refresh passes
    pub(crate) refresh_cycles: Counter,
    /// Individual domain refreshes attempted
    pub(crate) refreshes: Counter,
    /// Individual domain refreshes that failed
    pub(crate) refresh_errors: Counter,
}

/// A point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub fetches: u64,
    pub hits: u64,
    pub expired: u64,
    pub io_errors: u64,
    pub failed_fetch: u64,
    pub invalid: u64,
    pub marshal_errors: u64,
    pub unmarshal_errors: u64,
    pub refresh_cycles: u64,
    pub refreshes: u64,
    pub refresh_errors: u64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            fetches: self.fetches.get(),
            hits: self.hits.get(),
            expired: self.expired.get(),
            io_errors: self.io_errors.get(),
            failed_fetch: self.failed_fetch.get(),
            invalid: self.invalid.get(),
            marshal_errors: self.marshal_errors.get(),
            unmarshal_errors: self.unmarshal_errors.get(),
            refresh_cycles: self.refresh_cycles.get(),
            refreshes: self.refreshes.get(),
            refresh_errors: self.refresh_errors.get(),
        }
    }

    /// The counters under their stable export names.
    pub fn as_pairs(&self) -> [(&'static str, u64); 11] {
        [
            ("sts/cache/fetches", self.fetches.get()),
            ("sts/cache/hits", self.hits.get()),
            ("sts/cache/expired", self.expired.get()),
            ("sts/cache/ioErrors", self.io_errors.get()),
            ("sts/cache/failedFetch", self.failed_fetch.get()),
            ("sts/cache/invalid", self.invalid.get()),
            ("sts/cache/marshalErrors", self.marshal_errors.get()),
            ("sts/cache/unmarshalErrors", self.unmarshal_errors.get()),
            ("sts/cache/refreshCycles", self.refresh_cycles.get()),
            ("sts/cache/refreshes", self.refreshes.get()),
            ("sts/cache/refreshErrors", self.refresh_errors.get()),
        ]
    }
}
