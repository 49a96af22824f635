// SPDX-License-Identifier: Apache-2.0

//! Allocate and deallocate memory on the enclave heap
//!
//! The heap keeps a [`VmaList`] of the allocated regions. Allocations
//! without an address hint are placed top-down into the first gap which
//! fits; allocations with a hint behave like `MAP_FIXED` and merge with the
//! regions they overlap.

use lset::Line;
use tracing::trace;

use crate::pool::Pool;
use crate::vma::{Freed, VmaList};
use crate::{is_page_aligned, page_down, page_up, Error, Result};

/// A successful heap allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Start of the allocated range
    pub addr: usize,
    /// Page aligned size of the allocated range
    pub size: usize,
    /// Bytes which were not allocated before
    pub allocated: usize,
}

/// The heap VMA registry
#[derive(Debug)]
pub struct Heap<'a> {
    line: Line<usize>,
    vmas: VmaList<'a>,
    internal_budget: usize,
    internal_used: usize,
}

impl<'a> Heap<'a> {
    /// Create a new instance managing `line` with the VMA slots of `pool`.
    pub fn new(line: Line<usize>, internal_budget: usize, pool: Pool<'a>) -> Self {
        Self {
            line,
            vmas: VmaList::new(pool),
            internal_budget,
            internal_used: 0,
        }
    }

    /// The heap range
    #[inline]
    pub fn line(&self) -> Line<usize> {
        self.line
    }

    /// The allocated regions
    #[inline]
    pub fn vmas(&self) -> &VmaList<'a> {
        &self.vmas
    }

    /// Bytes of the internal budget in use
    #[inline]
    pub fn internal_used(&self) -> usize {
        self.internal_used
    }

    /// Allocate `size` bytes, at `hint` if given.
    pub fn allocate(
        &mut self,
        hint: Option<usize>,
        size: usize,
        internal: bool,
    ) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::InvalidRange);
        }

        let size = page_up(size).ok_or(Error::InvalidRange)?;

        if internal && size > self.internal_budget - self.internal_used {
            return Err(Error::NoMemory);
        }

        let (addr, above) = match hint {
            Some(hint) => {
                let addr = page_down(hint);
                let end = addr.checked_add(size).ok_or(Error::InvalidRange)?;
                if addr < self.line.start || end > self.line.end {
                    return Err(Error::InvalidRange);
                }
                (addr, self.vmas.above(addr))
            }

            None => self.find_gap(size).ok_or(Error::NoMemory)?,
        };

        let inserted = self.vmas.insert(addr, size, internal, above)?;

        let merged = self.vmas.vma(inserted.index).size();
        assert!(merged >= inserted.absorbed, "bad memory bookkeeping");
        let allocated = merged - inserted.absorbed;

        if internal {
            self.internal_used += allocated;
        }

        trace!(addr, size, internal, allocated, "heap allocate");

        Ok(Allocation {
            addr,
            size,
            allocated,
        })
    }

    /// Find the highest gap which fits `size` bytes.
    ///
    /// Returns the start of the new range at the top of the gap and the VMA
    /// above it.
    fn find_gap(&self, size: usize) -> Option<(usize, Option<usize>)> {
        let mut frontier = self.line.end;
        let mut above = None;

        let mut cursor = self.vmas.head();
        while let Some(index) = cursor {
            let vma = self.vmas.vma(index);
            let addr = frontier.checked_sub(size)?;

            if vma.line.end <= addr {
                return Some((addr, above));
            }

            above = Some(index);
            frontier = vma.line.start;
            cursor = self.vmas.next(index);
        }

        let addr = frontier.checked_sub(size)?;
        (addr >= self.line.start).then_some((addr, above))
    }

    /// Validate a free of `[addr, addr + size)` without changing anything.
    ///
    /// Returns the page aligned range to free.
    pub fn check_free(&self, addr: usize, size: usize) -> Result<Line<usize>> {
        if size == 0 {
            return Err(Error::NoMemory);
        }

        let size = page_up(size).ok_or(Error::InvalidArgument)?;
        let end = addr.checked_add(size).ok_or(Error::InvalidArgument)?;

        if !is_page_aligned(addr) || addr < self.line.start || end > self.line.end {
            return Err(Error::InvalidArgument);
        }

        self.vmas.check_remove(addr, size)?;

        Ok(Line::new(addr, end))
    }

    /// Free `[addr, addr + size)`.
    ///
    /// Freeing memory which is not allocated is not an error.
    pub fn free(&mut self, addr: usize, size: usize) -> Result<Freed> {
        let line = self.check_free(addr, size)?;
        let freed = self.vmas.remove(line.start, line.end - line.start)?;

        if freed.internal == Some(true) {
            assert!(self.internal_used >= freed.bytes, "bad memory bookkeeping");
            self.internal_used -= freed.bytes;
        }

        trace!(addr, size, freed = freed.bytes, "heap free");

        Ok(freed)
    }

    /// The lowest address of the contiguous allocated region at the heap top
    pub fn top(&self) -> usize {
        let mut frontier = self.line.end;

        for vma in self.vmas.iter() {
            if vma.line.end != frontier {
                break;
            }
            frontier = vma.line.start;
        }

        frontier
    }
}
