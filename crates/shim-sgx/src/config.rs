// SPDX-License-Identifier: Apache-2.0

//! Memory manager configuration
//!
//! The host hands over the demand paging policy as one packed mode word:
//!
//! | bits  | field     | values                              |
//! |-------|-----------|-------------------------------------|
//! | 0-3   | mode      | `0` off, `1` eager, `2` lazy        |
//! | 4-7   | mempool   | `0` none, `0x10` retain, `0x20` release |
//! | 8-11  | batch     | `0` none, `0x100` bitmap            |

use core::convert::TryFrom;

use lset::Line;

use crate::{is_page_aligned, Error, Result};

const MODE_MASK: u64 = 0xF;
const MEMPOOL_MASK: u64 = 0xF0;
const BATCH_MASK: u64 = 0xF00;

/// When enclave pages get committed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// All heap pages are committed at build time
    #[default]
    Off,

    /// Pages are committed when they are allocated
    Eager,

    /// Pages are committed on the first access
    Lazy,
}

/// What happens to committed pages of freed memory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reclaim {
    /// Committed pages are removed from the enclave on free
    #[default]
    Release,

    /// Committed pages stay committed for later reuse
    Retain,
}

/// How many pages a lazy commit covers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Batch {
    /// Only the faulting page
    #[default]
    None,

    /// All allocated pages in a window around the faulting page
    Bitmap,
}

/// Demand paging policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Edmm {
    /// Commit mode
    pub mode: Mode,
    /// Reclaim policy on free
    pub reclaim: Reclaim,
    /// Batching policy for lazy commits
    pub batch: Batch,
}

impl Edmm {
    /// Whether enclave pages are committed on demand at all
    #[inline]
    pub fn enabled(&self) -> bool {
        self.mode != Mode::Off
    }

    /// Whether lazy commits are widened to the batching window
    #[inline]
    pub fn batching(&self) -> bool {
        self.mode == Mode::Lazy && self.batch == Batch::Bitmap
    }
}

impl TryFrom<u64> for Edmm {
    type Error = Error;

    fn try_from(word: u64) -> Result<Self> {
        if word & !(MODE_MASK | MEMPOOL_MASK | BATCH_MASK) != 0 {
            return Err(Error::InvalidArgument);
        }

        let mode = match word & MODE_MASK {
            0x0 => Mode::Off,
            0x1 => Mode::Eager,
            0x2 => Mode::Lazy,
            _ => return Err(Error::InvalidArgument),
        };

        let reclaim = match word & MEMPOOL_MASK {
            0x00 | 0x20 => Reclaim::Release,
            0x10 => Reclaim::Retain,
            _ => return Err(Error::InvalidArgument),
        };

        let batch = match word & BATCH_MASK {
            0x000 => Batch::None,
            0x100 => Batch::Bitmap,
            _ => return Err(Error::InvalidArgument),
        };

        Ok(Self {
            mode,
            reclaim,
            batch,
        })
    }
}

/// Configuration of the enclave memory manager, immutable once built
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The heap address range `[start, end)`
    pub heap: Line<usize>,
    /// Maximum number of bytes the runtime may allocate for itself
    pub internal_budget: usize,
    /// Demand paging policy
    pub edmm: Edmm,
}

impl Config {
    /// Create a validated configuration.
    ///
    /// Both heap bounds must be page aligned and the heap must not be empty.
    pub fn new(heap: Line<usize>, internal_budget: usize, edmm: Edmm) -> Result<Self> {
        if !is_page_aligned(heap.start) || !is_page_aligned(heap.end) {
            return Err(Error::InvalidArgument);
        }

        if heap.start >= heap.end {
            return Err(Error::InvalidRange);
        }

        Ok(Self {
            heap,
            internal_budget,
            edmm,
        })
    }

    /// Number of pages in the heap
    #[inline]
    pub fn heap_pages(&self) -> usize {
        (self.heap.end - self.heap.start) / primordial::Page::SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_word() {
        assert_eq!(Edmm::try_from(0).unwrap(), Edmm::default());

        let edmm = Edmm::try_from(0x112).unwrap();
        assert_eq!(edmm.mode, Mode::Lazy);
        assert_eq!(edmm.reclaim, Reclaim::Retain);
        assert_eq!(edmm.batch, Batch::Bitmap);
        assert!(edmm.enabled());
        assert!(edmm.batching());

        let edmm = Edmm::try_from(0x121).unwrap();
        assert_eq!(edmm.mode, Mode::Eager);
        assert_eq!(edmm.reclaim, Reclaim::Release);
        assert!(!edmm.batching());
    }

    #[test]
    fn mode_word_invalid() {
        assert_eq!(Edmm::try_from(0x3), Err(Error::InvalidArgument));
        assert_eq!(Edmm::try_from(0x30), Err(Error::InvalidArgument));
        assert_eq!(Edmm::try_from(0x200), Err(Error::InvalidArgument));
        assert_eq!(Edmm::try_from(0x1000), Err(Error::InvalidArgument));
    }

    #[test]
    fn config() {
        let edmm = Edmm::default();
        let config = Config::new(Line::new(0x10000, 0x20000), 0x1000, edmm).unwrap();
        assert_eq!(config.heap_pages(), 16);

        assert_eq!(
            Config::new(Line::new(0x10001, 0x20000), 0, edmm),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            Config::new(Line::new(0x20000, 0x20000), 0, edmm),
            Err(Error::InvalidRange)
        );
    }
}
