// SPDX-License-Identifier: Apache-2.0

//! Dynamic commit and removal of enclave pages (EDMM)
//!
//! A heap page is committed by `EACCEPT`ing it as a pending regular page,
//! after which the host driver has added it with `EAUG`. Removal is a
//! handshake with the host:
//!
//! 1. the host changes the page type to trimmed,
//! 2. the enclave `EACCEPT`s every trimmed page,
//! 3. the host is notified and removes the pages.
//!
//! The commit bitmap is the authority on which pages are committed. The
//! committed runs are additionally mirrored in a VMA list for statistics.

use lset::Line;
use primordial::Page;
use tracing::{debug, error, instrument, trace, warn};

use crate::config::Reclaim;
use crate::memory::EnclaveMemory;
use crate::platform::Platform;
use crate::secinfo::SecInfo;
use crate::vma::VmaList;
use crate::{is_page_aligned, Error, Result, EDMM_BATCH_SIZE};

fn mirror_insert(mirror: &mut VmaList<'_>, line: Line<usize>) {
    let above = mirror.above(line.start);
    if let Err(e) = mirror.insert(line.start, line.end - line.start, false, above) {
        warn!(
            "unable to mirror committed pages {:#x}..{:#x}: {}",
            line.start, line.end, e
        );
    }
}

fn mirror_remove(mirror: &mut VmaList<'_>, line: Line<usize>) {
    if let Err(e) = mirror.remove(line.start, line.end - line.start) {
        warn!(
            "unable to mirror removed pages {:#x}..{:#x}: {}",
            line.start, line.end, e
        );
    }
}

impl<P: Platform> EnclaveMemory<'_, P> {
    /// Check that `[addr, addr + size)` is a non-empty, page aligned heap range.
    fn heap_range(&self, addr: usize, size: usize) -> Result<Line<usize>> {
        if size == 0 || !is_page_aligned(addr) || !is_page_aligned(size) {
            return Err(Error::InvalidRange);
        }

        let end = addr.checked_add(size).ok_or(Error::InvalidRange)?;
        let heap = self.config.heap;
        if addr < heap.start || end > heap.end {
            return Err(Error::InvalidRange);
        }

        Ok(Line::new(addr, end))
    }

    /// Commit the pages of `[addr, addr + size)` not committed yet.
    ///
    /// Pages are accepted from the highest to the lowest. A page which fails
    /// to be accepted is skipped. With `executable` the permissions of every
    /// committed page are extended to `RWX`. In lazy mode with bitmap
    /// batching the end of the range is extended by [`EDMM_BATCH_SIZE`] - 1
    /// pages, clamped to the heap top, and only allocated pages are committed.
    ///
    /// Returns the number of newly committed pages.
    #[instrument(level = "trace", skip(self))]
    pub fn commit_range(&self, addr: usize, size: usize, executable: bool) -> Result<usize> {
        let mut line = self.heap_range(addr, size)?;

        if !self.config.edmm.enabled() {
            return Ok(0);
        }

        self.stats.edmm.allocated(size);

        let batching = self.config.edmm.batching();
        if batching {
            line.end = line
                .end
                .saturating_add((EDMM_BATCH_SIZE - 1) * Page::SIZE)
                .min(self.config.heap.end);
        }

        let mut mirror = self.mirror.lock();
        let mut run: Option<Line<usize>> = None;
        let mut committed = 0;

        for page in (line.start..line.end).step_by(Page::SIZE).rev() {
            if batching && !self.allocated.is_set(page) {
                continue;
            }

            if self.committed.is_set(page) {
                continue;
            }

            if let Err(e) = self.platform.accept(page, &SecInfo::pending()) {
                debug!("accepting page {:#x} failed: {}", page, e);
                continue;
            }

            self.committed.set(page);
            self.stats.edmm.grow(Page::SIZE);
            committed += 1;

            if executable {
                if let Err(e) = self.platform.extend(page, &SecInfo::executable()) {
                    debug!("extending page {:#x} failed: {}", page, e);
                }
            }

            run = match run {
                Some(r) if r.start == page + Page::SIZE => Some(Line::new(page, r.end)),
                Some(r) => {
                    mirror_insert(&mut mirror, r);
                    Some(Line::new(page, page + Page::SIZE))
                }
                None => Some(Line::new(page, page + Page::SIZE)),
            };
        }

        if let Some(r) = run {
            mirror_insert(&mut mirror, r);
        }

        trace!(committed, "commit range");
        Ok(committed)
    }

    /// Remove the pages of `[addr, addr + size)` from the enclave.
    ///
    /// A page is marked uncommitted once its trimmed state was accepted. The
    /// first failing step aborts the handshake and its error is returned,
    /// the pages not accepted yet stay marked committed.
    #[instrument(level = "trace", skip(self))]
    pub fn remove_range(&self, addr: usize, size: usize) -> Result<()> {
        let line = self.heap_range(addr, size)?;

        if !self.config.edmm.enabled() {
            return Ok(());
        }

        let mut mirror = self.mirror.lock();
        self.remove_locked(&mut mirror, line)
    }

    fn remove_locked(&self, mirror: &mut VmaList<'_>, line: Line<usize>) -> Result<()> {
        let size = line.end - line.start;
        let pages = size / Page::SIZE;

        self.platform.trim(line.start, pages).map_err(|e| {
            debug!("trimming {:#x}..{:#x} failed: {}", line.start, line.end, e);
            e
        })?;

        let trimmed = SecInfo::trimmed();
        let mut cleared = line.start;
        let accepted = (line.start..line.end)
            .step_by(Page::SIZE)
            .try_for_each(|page| -> Result<()> {
                self.platform.accept(page, &trimmed).map_err(|e| {
                    debug!("accepting trimmed page {:#x} failed: {}", page, e);
                    e
                })?;
                self.committed.clear(page);
                cleared = page + Page::SIZE;
                Ok(())
            });

        if cleared > line.start {
            mirror_remove(mirror, Line::new(line.start, cleared));
            self.stats.edmm.freed(size, cleared - line.start);
        }
        accepted?;

        self.platform.notify_removed(line.start, pages).map_err(|e| {
            debug!(
                "notifying removal of {:#x}..{:#x} failed: {}",
                line.start, line.end, e
            );
            e
        })
    }

    /// Zero `[addr, addr + size)`, skipping uncommitted pages with demand paging.
    pub(crate) unsafe fn zero_range(&self, addr: usize, size: usize) -> Result<()> {
        let line = self.heap_range(addr, size)?;

        if !self.config.edmm.enabled() {
            core::ptr::write_bytes(addr as *mut u8, 0, size);
            return Ok(());
        }

        for run in self.committed.runs(line) {
            core::ptr::write_bytes(run.start as *mut u8, 0, run.end - run.start);
        }

        Ok(())
    }

    /// Remove the committed pages of a freed range.
    ///
    /// Runs of committed pages are removed one by one. Failures are logged,
    /// the range is freed anyway.
    pub(crate) fn release(&self, line: Line<usize>) {
        if !self.config.edmm.enabled() || self.config.edmm.reclaim == Reclaim::Retain {
            return;
        }

        let mut mirror = self.mirror.lock();

        let mut cursor = line.start;
        while let Some(run) = self.committed.runs(Line::new(cursor, line.end)).next() {
            if let Err(e) = self.remove_locked(&mut mirror, run) {
                error!(
                    "removing committed pages {:#x}..{:#x} failed: {}",
                    run.start, run.end, e
                );
            }
            cursor = run.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Batch, Config, Edmm, Mode, Reclaim};
    use crate::memory::{EnclaveMemory, Storage};
    use crate::platform::mock::{Call, Recorder};
    use crate::pool::Slot;
    use crate::secinfo::Class;
    use crate::{Error, EDMM_BATCH_SIZE};

    use core::sync::atomic::AtomicU64;

    use const_default::ConstDefault;
    use lset::Line;
    use primordial::Page;

    const P: usize = Page::SIZE;
    const BASE: usize = 0x100_0000;
    const PAGES: usize = 128;

    // nothing in these tests touches the heap memory itself
    fn with_memory(edmm: Edmm, edmm_slots: usize, f: impl FnOnce(&EnclaveMemory<'_, Recorder>)) {
        let mut heap_vmas = vec![Slot::DEFAULT; 16];
        let mut edmm_vmas = vec![Slot::DEFAULT; edmm_slots];
        let committed: Vec<_> = (0..2).map(|_| AtomicU64::new(0)).collect();
        let allocated: Vec<_> = (0..2).map(|_| AtomicU64::new(0)).collect();

        let config = Config::new(Line::new(BASE, BASE + PAGES * P), 0, edmm).unwrap();
        let storage = Storage {
            heap_vmas: &mut heap_vmas,
            edmm_vmas: &mut edmm_vmas,
            committed: &committed,
            allocated: &allocated,
        };

        let memory = unsafe { EnclaveMemory::new(config, Recorder::default(), storage).unwrap() };
        f(&memory)
    }

    fn lazy(batch: Batch) -> Edmm {
        Edmm {
            mode: Mode::Lazy,
            reclaim: Reclaim::Release,
            batch,
        }
    }

    fn mirror(memory: &EnclaveMemory<'_, Recorder>) -> Vec<(usize, usize)> {
        memory
            .mirror
            .lock()
            .iter()
            .map(|vma| (vma.line.start, vma.line.end))
            .collect()
    }

    #[test]
    fn commit_once() {
        with_memory(lazy(Batch::None), 16, |memory| {
            assert_eq!(memory.commit_range(BASE, 2 * P, false), Ok(2));
            assert_eq!(memory.commit_range(BASE, 3 * P, false), Ok(1));

            assert_eq!(
                memory.platform().calls(),
                vec![
                    Call::Accept(BASE + P, Some(Class::Regular)),
                    Call::Accept(BASE, Some(Class::Regular)),
                    Call::Accept(BASE + 2 * P, Some(Class::Regular)),
                ]
            );
            assert_eq!(mirror(memory), vec![(BASE, BASE + 3 * P)]);
        });
    }

    #[test]
    fn commit_invalid() {
        with_memory(lazy(Batch::None), 16, |memory| {
            assert_eq!(memory.commit_range(BASE + 1, P, false), Err(Error::InvalidRange));
            assert_eq!(memory.commit_range(BASE - P, P, false), Err(Error::InvalidRange));
            assert_eq!(
                memory.commit_range(BASE + PAGES * P - P, 2 * P, false),
                Err(Error::InvalidRange)
            );
            assert_eq!(memory.commit_range(BASE, 0, false), Err(Error::InvalidRange));
            assert!(memory.platform().calls().is_empty());
        });
    }

    #[test]
    fn commit_disabled() {
        with_memory(Edmm::default(), 16, |memory| {
            assert_eq!(memory.commit_range(BASE, 4 * P, true), Ok(0));
            assert!(memory.platform().calls().is_empty());
        });
    }

    #[test]
    fn commit_skips_failed_pages() {
        with_memory(lazy(Batch::None), 16, |memory| {
            memory.platform().fail_accept.lock().unwrap().push(BASE + P);

            assert_eq!(memory.commit_range(BASE, 3 * P, false), Ok(2));
            assert!(!memory.is_committed(BASE + P));
            assert_eq!(
                mirror(memory),
                vec![(BASE + 2 * P, BASE + 3 * P), (BASE, BASE + P)]
            );
        });
    }

    #[test]
    fn commit_batched() {
        with_memory(lazy(Batch::Bitmap), 16, |memory| {
            let addr = memory.allocate(Some(BASE + 4 * P), 3 * P, false).unwrap();
            memory.allocate(Some(BASE + 80 * P), P, false).unwrap();

            // one fault in the allocation commits all of its pages, but
            // nothing outside of the window or not allocated
            assert_eq!(memory.commit_range(BASE, P, false), Ok(3));
            assert_eq!(memory.committed_pages(), 3);
            assert!(memory.is_committed(addr));
            assert!(memory.is_committed(addr + 2 * P));
            assert!(!memory.is_committed(BASE));
            assert!(!memory.is_committed(BASE + 80 * P));
        });
    }

    #[test]
    fn commit_batched_extends_range() {
        with_memory(lazy(Batch::Bitmap), 16, |memory| {
            memory.allocate(Some(BASE), 2 * P, false).unwrap();
            memory.allocate(Some(BASE + 66 * P), P, false).unwrap();
            memory.allocate(Some(BASE + 68 * P), P, false).unwrap();

            // the range is extended past its own end, not just to the window
            assert_eq!(memory.commit_range(BASE, 4 * P, false), Ok(3));
            assert!(memory.is_committed(BASE + 66 * P));
            assert!(!memory.is_committed(BASE + 68 * P));
        });
    }

    #[test]
    fn commit_batched_clamped() {
        with_memory(lazy(Batch::Bitmap), 16, |memory| {
            let top = BASE + PAGES * P;
            memory.allocate(None, 2 * P, false).unwrap();

            assert_eq!(memory.commit_range(top - P, P, false), Ok(1));
            assert_eq!(EDMM_BATCH_SIZE, 64);
            assert_eq!(memory.committed_pages(), 1);
        });
    }

    #[test]
    fn remove_order() {
        with_memory(lazy(Batch::None), 16, |memory| {
            memory.commit_range(BASE, 2 * P, false).unwrap();
            memory.platform().clear();

            memory.remove_range(BASE, 2 * P).unwrap();
            assert_eq!(
                memory.platform().calls(),
                vec![
                    Call::Trim(BASE, 2),
                    Call::Accept(BASE, Some(Class::Trimmed)),
                    Call::Accept(BASE + P, Some(Class::Trimmed)),
                    Call::NotifyRemoved(BASE, 2),
                ]
            );
            assert_eq!(memory.committed_pages(), 0);
            assert!(mirror(memory).is_empty());
        });
    }

    #[test]
    fn remove_first_error() {
        with_memory(lazy(Batch::None), 16, |memory| {
            memory.commit_range(BASE, 2 * P, false).unwrap();
            memory.platform().clear();
            memory.platform().fail_accept.lock().unwrap().push(BASE);

            assert_eq!(memory.remove_range(BASE, 2 * P), Err(Error::Enclu(11)));
            assert_eq!(memory.platform().calls(), vec![Call::Trim(BASE, 2)]);
            assert_eq!(memory.committed_pages(), 2);

            *memory.platform().fail_trim.lock().unwrap() = Some(Error::Host(libc::EPERM));
            assert_eq!(memory.remove_range(BASE, P), Err(Error::Host(libc::EPERM)));
            assert!(memory.is_committed(BASE));
            assert_eq!(mirror(memory), vec![(BASE, BASE + 2 * P)]);
        });
    }

    #[test]
    fn remove_partially_accepted() {
        with_memory(lazy(Batch::None), 16, |memory| {
            memory.commit_range(BASE, 3 * P, false).unwrap();
            memory.platform().clear();
            memory.platform().fail_accept.lock().unwrap().push(BASE + P);

            assert_eq!(memory.remove_range(BASE, 3 * P), Err(Error::Enclu(11)));
            assert_eq!(
                memory.platform().calls(),
                vec![
                    Call::Trim(BASE, 3),
                    Call::Accept(BASE, Some(Class::Trimmed)),
                ]
            );

            // only the accepted page is gone
            assert!(!memory.is_committed(BASE));
            assert!(memory.is_committed(BASE + P));
            assert!(memory.is_committed(BASE + 2 * P));
            assert_eq!(mirror(memory), vec![(BASE + P, BASE + 3 * P)]);
        });
    }

    #[test]
    fn mirror_exhaustion_is_advisory() {
        with_memory(lazy(Batch::None), 1, |memory| {
            memory.commit_range(BASE, 3 * P, false).unwrap();
            assert_eq!(memory.commit_range(BASE + 4 * P, P, false), Ok(1));
            assert_eq!(memory.committed_pages(), 4);
            assert_eq!(mirror(memory), vec![(BASE, BASE + 3 * P)]);

            // splitting the mirror fails as well, the removal does not
            memory.remove_range(BASE + P, P).unwrap();
            assert_eq!(memory.committed_pages(), 3);
            assert_eq!(mirror(memory), vec![(BASE, BASE + 3 * P)]);
        });
    }

    #[test]
    fn release_runs() {
        with_memory(lazy(Batch::None), 16, |memory| {
            memory.commit_range(BASE + P, P, false).unwrap();
            memory.commit_range(BASE + 3 * P, 2 * P, false).unwrap();
            memory.platform().clear();

            memory.release(Line::new(BASE, BASE + 8 * P));
            assert_eq!(
                memory.platform().calls(),
                vec![
                    Call::Trim(BASE + P, 1),
                    Call::Accept(BASE + P, Some(Class::Trimmed)),
                    Call::NotifyRemoved(BASE + P, 1),
                    Call::Trim(BASE + 3 * P, 2),
                    Call::Accept(BASE + 3 * P, Some(Class::Trimmed)),
                    Call::Accept(BASE + 4 * P, Some(Class::Trimmed)),
                    Call::NotifyRemoved(BASE + 3 * P, 2),
                ]
            );
        });
    }
}
