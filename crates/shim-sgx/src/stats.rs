// SPDX-License-Identifier: Apache-2.0

//! Advisory memory statistics

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Counters of one allocation layer
#[derive(Debug, Default)]
pub struct Counters {
    alloc_count: AtomicU64,
    alloc_bytes: AtomicU64,
    alloc_max: AtomicU64,
    free_count: AtomicU64,
    free_bytes: AtomicU64,
    freed_bytes: AtomicU64,
    runtime: AtomicU64,
    runtime_max: AtomicU64,
}

/// A copy of [`Counters`] at one point in time
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub alloc_bytes: u64,
    pub alloc_max: u64,
    pub free_count: u64,
    pub free_bytes: u64,
    pub freed_bytes: u64,
    pub runtime: u64,
    pub runtime_max: u64,
}

impl Counters {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            alloc_max: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            free_bytes: AtomicU64::new(0),
            freed_bytes: AtomicU64::new(0),
            runtime: AtomicU64::new(0),
            runtime_max: AtomicU64::new(0),
        }
    }

    /// Count an allocation request of `bytes`.
    pub fn allocated(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.alloc_max.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Count `bytes` newly in use.
    pub fn grow(&self, bytes: usize) {
        let bytes = bytes as u64;
        let runtime = self.runtime.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.runtime_max.fetch_max(runtime, Ordering::Relaxed);
    }

    /// Count a free request of `requested` bytes which released `freed` bytes.
    pub fn freed(&self, requested: usize, freed: usize) {
        let freed = freed as u64;
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.free_bytes.fetch_add(requested as u64, Ordering::Relaxed);
        self.freed_bytes.fetch_add(freed, Ordering::Relaxed);

        // the counters are advisory, an underflow just clamps
        let _ = self
            .runtime
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |runtime| {
                Some(runtime.saturating_sub(freed))
            });
    }

    /// Read all counters.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            alloc_bytes: self.alloc_bytes.load(Ordering::Relaxed),
            alloc_max: self.alloc_max.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
            free_bytes: self.free_bytes.load(Ordering::Relaxed),
            freed_bytes: self.freed_bytes.load(Ordering::Relaxed),
            runtime: self.runtime.load(Ordering::Relaxed),
            runtime_max: self.runtime_max.load(Ordering::Relaxed),
        }
    }
}

/// Statistics of the heap and the demand paging layer
#[derive(Debug, Default)]
pub struct Stats {
    /// Heap registry counters
    pub heap: Counters,
    /// Demand paging counters
    pub edmm: Counters,
}

impl Stats {
    /// Create zeroed statistics.
    pub const fn new() -> Self {
        Self {
            heap: Counters::new(),
            edmm: Counters::new(),
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap.snapshot();
        let edmm = self.edmm.snapshot();

        let rows: [(&str, u64, u64); 8] = [
            ("runtime (KiB)", heap.runtime / 1024, edmm.runtime / 1024),
            ("runtime_max (KiB)", heap.runtime_max / 1024, edmm.runtime_max / 1024),
            ("alloc_cnt", heap.alloc_count, edmm.alloc_count),
            ("alloc_size (KiB)", heap.alloc_bytes / 1024, edmm.alloc_bytes / 1024),
            ("alloc_max_size (KiB)", heap.alloc_max / 1024, edmm.alloc_max / 1024),
            ("free_cnt", heap.free_count, edmm.free_count),
            ("free_size (KiB)", heap.free_bytes / 1024, edmm.free_bytes / 1024),
            ("freed_size (KiB)", heap.freed_bytes / 1024, edmm.freed_bytes / 1024),
        ];

        writeln!(f, "----- Enclave Memory stats -----")?;
        writeln!(f, "  {:<22} | {:>10} | {:>10}", "", "heap", "edmm")?;
        for (name, heap, edmm) in rows {
            writeln!(f, "  {name:<22} | {heap:>10} | {edmm:>10}")?;
        }

        Ok(())
    }
}
