//! Unit-of-work statistics.
//!
//! Counters for monitoring flush activity. All counters are atomic and can
//! be read while a flush is in progress.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = uow.stats();
//! println!("inserts: {}", stats.inserts());
//! println!("failed writes: {}", stats.failed_writes());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Flush statistics for one unit of work.
#[derive(Debug, Default)]
pub struct UnitOfWorkStats {
    inserts: AtomicU64,
    upserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    failed_writes: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    transaction_retries: AtomicU64,
    documents_loaded: AtomicU64,
}

impl UnitOfWorkStats {
    /// Creates zeroed statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upsert(&self) {
        self.upserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_write(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, ok: bool) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_transaction_retry(&self) {
        self.transaction_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.documents_loaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Documents inserted.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Documents upserted.
    pub fn upserts(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    /// Documents updated.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Documents deleted.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Writes that failed.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Flushes attempted.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Flushes that returned an error.
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    /// Transactional flush attempts retried after a transient failure.
    pub fn transaction_retries(&self) -> u64 {
        self.transaction_retries.load(Ordering::Relaxed)
    }

    /// Documents hydrated from storage.
    pub fn documents_loaded(&self) -> u64 {
        self.documents_loaded.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inserts: self.inserts(),
            upserts: self.upserts(),
            updates: self.updates(),
            deletes: self.deletes(),
            failed_writes: self.failed_writes(),
            flushes: self.flushes(),
            failed_flushes: self.failed_flushes(),
            transaction_retries: self.transaction_retries(),
            documents_loaded: self.documents_loaded(),
        }
    }
}

/// A copy of [`UnitOfWorkStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Documents inserted.
    pub inserts: u64,
    /// Documents upserted.
    pub upserts: u64,
    /// Documents updated.
    pub updates: u64,
    /// Documents deleted.
    pub deletes: u64,
    /// Writes that failed.
    pub failed_writes: u64,
    /// Flushes attempted.
    pub flushes: u64,
    /// Flushes that returned an error.
    pub failed_flushes: u64,
    /// Transaction retries.
    pub transaction_retries: u64,
    /// Documents hydrated.
    pub documents_loaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = UnitOfWorkStats::new();
        stats.record_insert();
        stats.record_insert();
        stats.record_update();
        stats.record_failed_write();
        stats.record_flush(true);
        stats.record_flush(false);

        let snap = stats.snapshot();
        assert_eq!(snap.inserts, 2);
        assert_eq!(snap.updates, 1);
        assert_eq!(snap.failed_writes, 1);
        assert_eq!(snap.flushes, 2);
        assert_eq!(snap.failed_flushes, 1);
        assert_eq!(snap.deletes, 0);
    }
}
