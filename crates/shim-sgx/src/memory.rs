// SPDX-License-Identifier: Apache-2.0

//! The enclave memory manager
//!
//! [`EnclaveMemory`] is the single context owning the heap registry, the
//! demand paging state and the statistics. It is constructed once and
//! shared by reference with every hardware thread.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lset::Line;
use primordial::Page;
use spin::Mutex;
use tracing::{error, info, instrument};

use crate::bitmap::Bitmap;
use crate::config::{Batch, Config, Mode};
use crate::heap::Heap;
use crate::platform::Platform;
use crate::pool::{Pool, Slot};
use crate::stats::Stats;
use crate::vma::VmaList;
use crate::Result;

/// Backing storage of the memory manager, supplied by the owner
///
/// In the enclave this is static memory, so the manager never allocates.
pub struct Storage<'a> {
    /// Slots of the heap VMA pool
    pub heap_vmas: &'a mut [Slot],
    /// Slots of the demand paging mirror pool
    pub edmm_vmas: &'a mut [Slot],
    /// Words of the committed page bitmap
    pub committed: &'a [AtomicU64],
    /// Words of the allocated page bitmap
    pub allocated: &'a [AtomicU64],
}

/// The enclave memory manager
pub struct EnclaveMemory<'a, P> {
    pub(crate) config: Config,
    pub(crate) platform: P,
    pub(crate) heap: Mutex<Heap<'a>>,
    pub(crate) mirror: Mutex<VmaList<'a>>,
    pub(crate) committed: Bitmap<'a>,
    pub(crate) allocated: Bitmap<'a>,
    allocated_pages: AtomicUsize,
    pub(crate) stats: Stats,
}

impl<'a, P: Platform> EnclaveMemory<'a, P> {
    /// Create a new instance.
    ///
    /// # Safety
    ///
    /// The heap range of `config` must be enclave memory exclusively owned
    /// by the new instance, mapped writable wherever it is committed.
    pub unsafe fn new(config: Config, platform: P, storage: Storage<'a>) -> Result<Self> {
        let committed = Bitmap::new(storage.committed, config.heap)?;
        let allocated = Bitmap::new(storage.allocated, config.heap)?;
        committed.reset();
        allocated.reset();

        let heap = Heap::new(
            config.heap,
            config.internal_budget,
            Pool::new(storage.heap_vmas),
        );
        let mirror = VmaList::new(Pool::new(storage.edmm_vmas));

        Ok(Self {
            config,
            platform,
            heap: Mutex::new(heap),
            mirror: Mutex::new(mirror),
            committed,
            allocated,
            allocated_pages: AtomicUsize::new(0),
            stats: Stats::new(),
        })
    }

    /// The configuration
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The platform primitives
    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Allocate `size` bytes of heap memory, at `hint` if given.
    ///
    /// Returns the page aligned start address. In eager mode the pages are
    /// committed before returning.
    #[instrument(level = "trace", skip(self))]
    pub fn allocate(&self, hint: Option<usize>, size: usize, internal: bool) -> Result<usize> {
        let mut heap = self.heap.lock();
        let allocation = heap.allocate(hint, size, internal)?;

        // allocated bits only change under the heap lock
        if self.config.edmm.batch == Batch::Bitmap {
            let line = Line::new(allocation.addr, allocation.addr + allocation.size);
            self.allocated.set_range(line);
        }
        self.allocated_pages
            .fetch_add(allocation.allocated / Page::SIZE, Ordering::SeqCst);
        drop(heap);

        self.stats.heap.allocated(allocation.size);
        self.stats.heap.grow(allocation.allocated);

        if self.config.edmm.mode == Mode::Eager {
            self.commit_range(allocation.addr, allocation.size, true)?;
        }

        Ok(allocation.addr)
    }

    /// Free `[addr, addr + size)`.
    ///
    /// Committed pages in the range are removed from the enclave first,
    /// unless the reclaim policy retains them. A failed removal is logged
    /// and does not fail the free.
    #[instrument(level = "trace", skip(self))]
    pub fn free(&self, addr: usize, size: usize) -> Result<()> {
        let mut heap = self.heap.lock();
        let line = heap.check_free(addr, size)?;

        // no batched commit may pick up pages of the range from here on
        if self.config.edmm.batch == Batch::Bitmap {
            self.allocated.clear_range(line);
        }

        self.release(line);

        let freed = heap.free(line.start, line.end - line.start)?;
        self.allocated_pages
            .fetch_sub(freed.bytes / Page::SIZE, Ordering::SeqCst);
        drop(heap);

        self.stats.heap.freed(size, freed.bytes);

        Ok(())
    }

    /// Zero `[addr, addr + size)`.
    ///
    /// With demand paging only the committed pages are written, the others
    /// are zeroed by the hardware when they get committed.
    ///
    /// # Safety
    ///
    /// No live reference may point into the range.
    pub unsafe fn zero(&self, addr: usize, size: usize) -> Result<()> {
        self.zero_range(addr, size)
    }

    /// The lowest address of the contiguous allocated region at the heap top
    pub fn heap_top(&self) -> usize {
        self.heap.lock().top()
    }

    /// Commit the pages of `[addr, addr + size)`, see [`EnclaveMemory::commit_range`].
    pub fn commit(&self, addr: usize, size: usize, executable: bool) -> Result<usize> {
        self.commit_range(addr, size, executable)
    }

    /// Remove the pages of `[addr, addr + size)`, see [`EnclaveMemory::remove_range`].
    pub fn remove(&self, addr: usize, size: usize) -> Result<()> {
        self.remove_range(addr, size)
    }

    /// Number of allocated heap pages
    #[inline]
    pub fn allocated_pages(&self) -> usize {
        self.allocated_pages.load(Ordering::SeqCst)
    }

    /// Bytes of the internal budget in use
    pub fn internal_used(&self) -> usize {
        self.heap.lock().internal_used()
    }

    /// Number of committed heap pages
    pub fn committed_pages(&self) -> usize {
        self.committed.count(self.config.heap)
    }

    /// Whether the page containing `addr` is committed
    #[inline]
    pub fn is_committed(&self, addr: usize) -> bool {
        self.committed.is_set(addr)
    }

    /// The statistics
    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Log the statistics.
    pub fn print_stats(&self) {
        info!("{}", self.stats);

        let heap = self.heap.lock();
        let mirror = self.mirror.lock();
        info!(
            heap_vmas = heap.vmas().pool().used(),
            heap_vmas_free = heap.vmas().pool().available(),
            edmm_vmas = mirror.pool().used(),
            edmm_vmas_free = mirror.pool().available(),
            heap_pages = self.config.heap_pages(),
            allocated_pages = self.allocated_pages(),
            committed_pages = self.committed_pages(),
            "vma usage"
        );
    }

    /// Call `f` with the heap VMAs from the highest to the lowest as
    /// `(start, end, internal)`.
    pub fn for_each_vma(&self, mut f: impl FnMut(usize, usize, bool)) {
        let heap = self.heap.lock();
        for vma in heap.vmas().iter() {
            f(vma.line.start, vma.line.end, vma.internal);
        }
    }

    /// Panic if the heap bookkeeping is inconsistent.
    pub fn assert_consistent(&self) {
        let heap = self.heap.lock();
        heap.vmas().assert_consistent();

        let pages = heap.vmas().bytes(false) + heap.vmas().bytes(true);
        if pages / Page::SIZE != self.allocated_pages() {
            error!("allocated page counter out of sync");
            panic!("allocated page counter out of sync");
        }
    }
}
