// SPDX-License-Identifier: Apache-2.0

//! Sorted list of VMAs threaded through a [`Pool`]
//!
//! The list is kept in strictly descending order of the VMA start address,
//! the head being the highest VMA. VMAs never overlap and never have an
//! empty range.

use tracing::{error, trace};

use crate::pool::{Pool, Slot, Vma};
use crate::{Error, Result};

/// Result of [`VmaList::insert`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inserted {
    /// Slot of the resulting, possibly merged, VMA
    pub index: usize,
    /// Bytes of the existing VMAs merged into the new one
    pub absorbed: usize,
}

/// Result of [`VmaList::remove`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Freed {
    /// Bytes removed from the list
    pub bytes: usize,
    /// Tag of the VMAs the bytes were removed from, `None` if nothing overlapped
    pub internal: Option<bool>,
}

/// A descending, doubly linked list of VMAs
#[derive(Debug)]
pub struct VmaList<'a> {
    pool: Pool<'a>,
    head: Option<usize>,
}

/// Iterator over the VMAs from the highest to the lowest
pub struct Iter<'l, 'a> {
    list: &'l VmaList<'a>,
    cursor: Option<usize>,
}

impl<'l> Iterator for Iter<'l, '_> {
    type Item = &'l Vma;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        self.cursor = self.list.pool[index].next;
        Some(&self.list.pool[index].vma)
    }
}

impl<'a> VmaList<'a> {
    /// Create an empty list backed by `pool`.
    pub fn new(pool: Pool<'a>) -> Self {
        Self { pool, head: None }
    }

    /// The backing pool
    #[inline]
    pub fn pool(&self) -> &Pool<'a> {
        &self.pool
    }

    /// Slot of the highest VMA
    #[inline]
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// The VMA in slot `index`
    #[inline]
    pub fn vma(&self, index: usize) -> &Vma {
        &self.pool[index].vma
    }

    /// Slot of the next lower VMA
    #[inline]
    pub fn next(&self, index: usize) -> Option<usize> {
        self.pool[index].next
    }

    /// Slot of the next higher VMA
    #[inline]
    pub fn prev(&self, index: usize) -> Option<usize> {
        self.pool[index].prev
    }

    /// Iterate from the highest to the lowest VMA.
    pub fn iter(&self) -> Iter<'_, 'a> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Slot of the VMA with the lowest start still at or above `addr`
    pub fn above(&self, addr: usize) -> Option<usize> {
        let mut above = None;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            if self.vma(index).line.start < addr {
                break;
            }
            above = Some(index);
            cursor = self.next(index);
        }

        above
    }

    /// Total bytes covered by VMAs with the given tag
    pub fn bytes(&self, internal: bool) -> usize {
        self.iter()
            .filter(|vma| vma.internal == internal)
            .map(Vma::size)
            .sum()
    }

    fn unlink(&mut self, index: usize) {
        let Slot { prev, next, .. } = self.pool[index];

        match prev {
            Some(prev) => self.pool[prev].next = next,
            None => self.head = next,
        }

        if let Some(next) = next {
            self.pool[next].prev = prev;
        }
    }

    /// Link `index` directly below `above`, or at the head if `above` is `None`.
    fn link_after(&mut self, index: usize, above: Option<usize>) {
        let next = match above {
            Some(above) => self.pool[above].next,
            None => self.head,
        };

        self.pool[index].prev = above;
        self.pool[index].next = next;

        match above {
            Some(above) => self.pool[above].next = Some(index),
            None => self.head = Some(index),
        }

        if let Some(next) = next {
            self.pool[next].prev = Some(index);
        }
    }

    /// Insert `[addr, addr + size)` directly below `above`.
    ///
    /// `above` must be the VMA with the lowest start at or above `addr` (see
    /// [`VmaList::above`]). VMAs of the same tag which touch or overlap the
    /// new range are merged into it. Overlapping a VMA of the other tag is an
    /// [`Error::InvalidRange`], an exhausted pool an [`Error::NoMemory`].
    pub fn insert(
        &mut self,
        addr: usize,
        size: usize,
        internal: bool,
        above: Option<usize>,
    ) -> Result<Inserted> {
        let end = addr.checked_add(size).ok_or(Error::InvalidRange)?;

        let below = match above {
            Some(above) => self.next(above),
            None => self.head,
        };

        let mut check = above;
        while let Some(index) = check {
            let vma = self.vma(index);
            if end <= vma.line.start {
                break;
            }
            if vma.internal != internal {
                return Err(Error::InvalidRange);
            }
            check = self.prev(index);
        }

        let mut check = below;
        while let Some(index) = check {
            let vma = self.vma(index);
            if addr >= vma.line.end {
                break;
            }
            if vma.internal != internal {
                return Err(Error::InvalidRange);
            }
            check = self.next(index);
        }

        let index = self
            .pool
            .alloc(Vma::new(addr, end, internal))
            .ok_or(Error::NoMemory)?;

        let mut merged = Vma::new(addr, end, internal);
        let mut absorbed = 0;

        let mut above = above;
        while let Some(other) = above {
            let vma = *self.vma(other);
            if vma.line.start > merged.line.end || vma.internal != internal {
                break;
            }

            trace!("merging {:#x}..{:#x} into new vma", vma.line.start, vma.line.end);
            absorbed += vma.size();
            merged.line.start = merged.line.start.min(vma.line.start);
            merged.line.end = merged.line.end.max(vma.line.end);

            above = self.prev(other);
            self.unlink(other);
            self.pool.free(other);
        }

        let mut below = below;
        while let Some(other) = below {
            let vma = *self.vma(other);
            if vma.line.end < merged.line.start || vma.internal != internal {
                break;
            }

            trace!("merging {:#x}..{:#x} into new vma", vma.line.start, vma.line.end);
            absorbed += vma.size();
            merged.line.start = merged.line.start.min(vma.line.start);
            merged.line.end = merged.line.end.max(vma.line.end);

            below = self.next(other);
            self.unlink(other);
            self.pool.free(other);
        }

        if merged.line.start >= merged.line.end {
            error!(
                "bad memory bookkeeping: {:#x}..{:#x}",
                merged.line.start, merged.line.end
            );
            panic!("bad memory bookkeeping");
        }

        self.pool[index].vma = merged;
        self.link_after(index, above);

        if crate::DEBUG {
            self.assert_consistent();
        }

        Ok(Inserted { index, absorbed })
    }

    /// Check that [`VmaList::remove`] of `[addr, addr + size)` would succeed.
    ///
    /// Returns the tag of the overlapping VMAs, `None` if nothing overlaps.
    pub fn check_remove(&self, addr: usize, size: usize) -> Result<Option<bool>> {
        let end = addr.checked_add(size).ok_or(Error::InvalidArgument)?;

        let mut internal = None;
        let mut split = false;

        let mut cursor = self.head;
        while let Some(index) = cursor {
            let vma = self.vma(index);
            cursor = self.next(index);

            if vma.line.start >= end {
                continue;
            }
            if vma.line.end <= addr {
                break;
            }

            match internal {
                None => internal = Some(vma.internal),
                Some(tag) if tag != vma.internal => {
                    error!(
                        "area to free {:#x}..{:#x} overlaps with both internal and user memory",
                        addr, end
                    );
                    return Err(Error::InvalidArgument);
                }
                Some(_) => (),
            }

            split |= vma.line.start < addr && vma.line.end > end;
        }

        if split && self.pool.is_full() {
            error!("cannot create split vma during freeing of {:#x}", addr);
            return Err(Error::NoMemory);
        }

        Ok(internal)
    }

    /// Remove `[addr, addr + size)` from the list.
    ///
    /// VMAs covered completely are dropped, partially covered ones shrink and
    /// a VMA strictly containing the range is split in two. Nothing is
    /// changed if the range overlaps VMAs of both tags
    /// ([`Error::InvalidArgument`]) or a split is needed while the pool is
    /// exhausted ([`Error::NoMemory`]).
    pub fn remove(&mut self, addr: usize, size: usize) -> Result<Freed> {
        let internal = self.check_remove(addr, size)?;
        let end = addr + size;

        let mut bytes = 0;

        let mut cursor = self.head;
        while let Some(index) = cursor {
            let vma = *self.vma(index);
            cursor = self.next(index);

            if vma.line.start >= end {
                continue;
            }
            if vma.line.end <= addr {
                break;
            }

            bytes += vma.line.end.min(end) - vma.line.start.max(addr);

            match (vma.line.start < addr, vma.line.end > end) {
                (false, false) => {
                    self.unlink(index);
                    self.pool.free(index);
                }

                (true, true) => {
                    let lower = Vma::new(vma.line.start, addr, vma.internal);
                    // checked above
                    let lower = self.pool.alloc(lower).ok_or(Error::NoMemory)?;
                    self.pool[index].vma.line.start = end;
                    self.link_after(lower, Some(index));
                }

                (true, false) => self.pool[index].vma.line.end = addr,
                (false, true) => self.pool[index].vma.line.start = end,
            }
        }

        if crate::DEBUG {
            self.assert_consistent();
        }

        Ok(Freed { bytes, internal })
    }

    /// Panic unless the list is sorted, disjoint and correctly linked.
    pub fn assert_consistent(&self) {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        let mut count = 0;

        while let Some(index) = cursor {
            let vma = self.vma(index);
            assert!(vma.line.start < vma.line.end, "empty vma in list");
            assert_eq!(self.prev(index), prev, "broken back link");

            if let Some(prev) = prev {
                assert!(vma.line.end <= self.vma(prev).line.start, "vmas out of order");
            }

            count += 1;
            prev = Some(index);
            cursor = self.next(index);
        }

        assert_eq!(count, self.pool.used(), "leaked pool slots");
    }
}
