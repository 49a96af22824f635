// SPDX-License-Identifier: Apache-2.0

//! Fixed capacity arena of VMA slots
//!
//! The memory manager must never allocate memory while it allocates memory,
//! so every VMA lives in a slot of a pre-allocated array supplied by the
//! owner. A slot is vacant when its VMA is empty (`start == end == 0`).

use core::ops::{Index, IndexMut};

use const_default::ConstDefault;
use lset::Line;

/// A virtual memory area of the enclave heap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vma {
    /// The address range `[start, end)`
    pub line: Line<usize>,

    /// Whether the memory belongs to the runtime itself
    pub internal: bool,
}

impl ConstDefault for Vma {
    const DEFAULT: Self = Self {
        line: Line { start: 0, end: 0 },
        internal: false,
    };
}

impl Vma {
    /// Create a new instance.
    #[inline]
    pub fn new(start: usize, end: usize, internal: bool) -> Self {
        Self {
            line: Line { start, end },
            internal,
        }
    }

    /// Size of the area in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.line.end.saturating_sub(self.line.start)
    }

    #[inline]
    fn is_vacant(&self) -> bool {
        self.line.start == 0 && self.line.end == 0
    }
}

/// A pool slot, linked into a [`VmaList`](crate::vma::VmaList) when in use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub(crate) vma: Vma,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl ConstDefault for Slot {
    const DEFAULT: Self = Self {
        vma: Vma::DEFAULT,
        prev: None,
        next: None,
    };
}

impl Default for Slot {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The pool of VMA slots
#[derive(Debug)]
pub struct Pool<'a> {
    slots: &'a mut [Slot],
    cached: Option<usize>,
    used: usize,
}

impl<'a> Pool<'a> {
    /// Create a new pool over `slots`, marking every slot vacant.
    pub fn new(slots: &'a mut [Slot]) -> Self {
        slots.fill(Slot::DEFAULT);

        Self {
            slots,
            cached: None,
            used: 0,
        }
    }

    /// Take a vacant slot for `vma`.
    ///
    /// Returns `None` if the pool is exhausted. The last freed slot is reused
    /// first, otherwise the slots are scanned for a vacant one.
    pub fn alloc(&mut self, vma: Vma) -> Option<usize> {
        debug_assert!(!vma.is_vacant());

        let index = match self.cached.take() {
            Some(index) if self.slots[index].vma.is_vacant() => index,
            _ => self.slots.iter().position(|slot| slot.vma.is_vacant())?,
        };

        self.slots[index] = Slot {
            vma,
            prev: None,
            next: None,
        };
        self.used += 1;

        Some(index)
    }

    /// Return the slot at `index` to the pool.
    pub fn free(&mut self, index: usize) {
        debug_assert!(!self.slots[index].vma.is_vacant());

        self.slots[index] = Slot::DEFAULT;
        self.cached = Some(index);
        self.used -= 1;
    }

    /// Number of slots in use
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Whether no slot is vacant
    #[inline]
    pub fn is_full(&self) -> bool {
        self.used == self.slots.len()
    }

    /// Number of vacant slots
    #[inline]
    pub fn available(&self) -> usize {
        self.slots.len() - self.used
    }
}

impl Index<usize> for Pool<'_> {
    type Output = Slot;

    #[inline]
    fn index(&self, index: usize) -> &Slot {
        &self.slots[index]
    }
}

impl IndexMut<usize> for Pool<'_> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.slots[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free() {
        let mut slots = [Slot::DEFAULT; 3];
        let mut pool = Pool::new(&mut slots);

        let a = pool.alloc(Vma::new(0x1000, 0x2000, false)).unwrap();
        let b = pool.alloc(Vma::new(0x3000, 0x4000, true)).unwrap();
        let c = pool.alloc(Vma::new(0x5000, 0x6000, false)).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(pool.is_full());
        assert_eq!(pool.alloc(Vma::new(0x7000, 0x8000, false)), None);

        pool.free(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool[b].vma, Vma::DEFAULT);

        // the freed slot is handed out again
        assert_eq!(pool.alloc(Vma::new(0x7000, 0x8000, false)), Some(b));
        assert_eq!(pool[b].vma.size(), 0x1000);
        assert_eq!(pool.used(), 3);
    }

    #[test]
    fn scan_fallback() {
        let mut slots = [Slot::DEFAULT; 4];
        let mut pool = Pool::new(&mut slots);

        let a = pool.alloc(Vma::new(0x1000, 0x2000, false)).unwrap();
        let b = pool.alloc(Vma::new(0x2000, 0x3000, false)).unwrap();
        pool.free(a);
        pool.free(b);

        // only one cached index, the other slot is found by scanning
        assert_eq!(pool.alloc(Vma::new(0x1000, 0x2000, false)), Some(b));
        assert_eq!(pool.alloc(Vma::new(0x2000, 0x3000, false)), Some(a));
        assert_eq!(pool.used() + pool.available(), 4);
    }

    #[test]
    fn new_resets() {
        let mut slots = [Slot {
            vma: Vma::new(0x1000, 0x2000, true),
            prev: Some(1),
            next: None,
        }; 2];

        let pool = Pool::new(&mut slots);
        assert_eq!(pool.used(), 0);
        assert_eq!(pool[0], Slot::DEFAULT);
    }
}
