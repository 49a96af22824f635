// SPDX-License-Identifier: Apache-2.0

//! The SGX shim memory manager and call gate
//!
//! This crate contains the trusted part of the enclave runtime which keeps
//! track of the enclave heap, commits and removes enclave pages on demand
//! (EDMM) and validates every transition from the host into the enclave.
//!
//! The hardware leaves (`EACCEPT`, `EMODPE`) and the host calls are provided
//! by the embedder through the [`platform::Platform`] trait, the payload
//! entry points through the [`gate::Runtime`] trait.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::all)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bitmap;
pub mod config;
pub mod edmm;
pub mod error;
pub mod gate;
pub mod heap;
pub mod memory;
pub mod platform;
pub mod pool;
pub mod secinfo;
pub mod stats;
pub mod vma;
pub mod xsave;

pub use error::{Error, Result};

use primordial::Page;

const DEBUG: bool = cfg!(feature = "dbg");

/// Number of VMA slots of the heap registry pool
pub const MAX_HEAP_VMAS: usize = 100_000;

/// Number of VMA slots of the demand paging mirror pool
pub const MAX_EDMM_VMAS: usize = 100_000;

/// Number of pages committed together by the bitmap batching policy
pub const EDMM_BATCH_SIZE: usize = 64;

/// Round `value` down to the page size
#[inline]
pub(crate) const fn page_down(value: usize) -> usize {
    value & !(Page::SIZE - 1)
}

/// Round `value` up to the page size, `None` on overflow
#[inline]
pub(crate) const fn page_up(value: usize) -> Option<usize> {
    match value.checked_add(Page::SIZE - 1) {
        Some(v) => Some(page_down(v)),
        None => None,
    }
}

#[inline]
pub(crate) const fn is_page_aligned(value: usize) -> bool {
    value & (Page::SIZE - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_down(0x1fff), 0x1000);
        assert_eq!(page_down(0x2000), 0x2000);
        assert_eq!(page_up(1), Some(0x1000));
        assert_eq!(page_up(0x1000), Some(0x1000));
        assert_eq!(page_up(usize::MAX), None);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3008));
    }
}
