//! Diagnostic counters.
//!
//! Counters are advisory: they are bumped with relaxed atomics from whichever
//! thread does the work and are only ever read for the report.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
pub struct Stats {
    fast_copies: AtomicU64,
    slow_copies: AtomicU64,
    fast_writes: AtomicU64,
    slow_writes: AtomicU64,
    missing_faults: AtomicU64,
    write_protect_faults: AtomicU64,
    records_created: AtomicU64,
    bytes_materialized: AtomicU64,
    lookup_nanos: AtomicU64,
    insert_nanos: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Above-threshold copies that aliased at least one record.
    pub fast_copies: u64,
    /// Above-threshold copies that ended up copying everything.
    pub slow_copies: u64,
    /// Transport calls that read at least one segment from an origin.
    pub fast_writes: u64,
    pub slow_writes: u64,
    pub missing_faults: u64,
    pub write_protect_faults: u64,
    pub records_created: u64,
    pub bytes_materialized: u64,
    pub lookup_nanos: u64,
    pub insert_nanos: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zcopy stats: fast_copies={} slow_copies={} fast_writes={} slow_writes={} \
             missing_faults={} write_protect_faults={} records_created={} \
             bytes_materialized={} lookup_us={} insert_us={}",
            self.fast_copies,
            self.slow_copies,
            self.fast_writes,
            self.slow_writes,
            self.missing_faults,
            self.write_protect_faults,
            self.records_created,
            self.bytes_materialized,
            self.lookup_nanos / 1000,
            self.insert_nanos / 1000,
        )
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

impl Stats {
    pub fn fast_copy(&self) {
        bump(&self.fast_copies, 1);
    }

    pub fn slow_copy(&self) {
        bump(&self.slow_copies, 1);
    }

    pub fn fast_write(&self) {
        bump(&self.fast_writes, 1);
    }

    pub fn slow_write(&self) {
        bump(&self.slow_writes, 1);
    }

    pub fn missing_fault(&self) {
        bump(&self.missing_faults, 1);
    }

    pub fn write_protect_fault(&self) {
        bump(&self.write_protect_faults, 1);
    }

    pub fn record_created(&self) {
        bump(&self.records_created, 1);
    }

    pub fn add_materialized(&self, len: usize) {
        bump(&self.bytes_materialized, len as u64);
    }

    pub fn add_lookup_time(&self, elapsed: Duration) {
        bump(&self.lookup_nanos, nanos(elapsed));
    }

    pub fn add_insert_time(&self, elapsed: Duration) {
        bump(&self.insert_nanos, nanos(elapsed));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|counter| counter.load(Ordering::Relaxed))
    }

    /// Snapshot and reset every counter.
    pub fn take(&self) -> StatsSnapshot {
        self.collect(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        StatsSnapshot {
            fast_copies: read(&self.fast_copies),
            slow_copies: read(&self.slow_copies),
            fast_writes: read(&self.fast_writes),
            slow_writes: read(&self.slow_writes),
            missing_faults: read(&self.missing_faults),
            write_protect_faults: read(&self.write_protect_faults),
            records_created: read(&self.records_created),
            bytes_materialized: read(&self.bytes_materialized),
            lookup_nanos: read(&self.lookup_nanos),
            insert_nanos: read(&self.insert_nanos),
        }
    }

    /// Log the counters and reset them.
    pub fn report(&self) {
        info!("{}", self.take());
    }
}
