// SPDX-License-Identifier: Apache-2.0

//! ABI for calls from the untrusted host into the enclave
//!
//! The host enters the enclave with a call number and a pointer to an
//! argument block. Everything defined here crosses the trust boundary: the
//! enclave side MUST treat every field as attacker controlled until it has
//! been validated.
//!
//! # Call numbers
//!
//! * `ENCLAVE_START`: `0` - the one-shot start of the enclave, argument is a [`StartArgs`]
//! * `THREAD_START`: `1` - enter a new thread after the enclave is initialized
//! * `THREAD_RESET`: `2` - reserved
//! * `PLACEHOLDER`: `3` - reserved
//! * `ALLOCATE_PAGE`: `4` - commit a heap page, argument points to the page address
//!
//! Any other number is invalid and MUST be rejected without side effects.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::all)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

mod start;

pub use start::*;

use core::convert::TryFrom;

/// Number of an enclave call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum Ecall {
    /// Start the enclave, argument is a [`StartArgs`] block.
    EnclaveStart = 0x00,

    /// Start an additional thread.
    ThreadStart = 0x01,

    /// Reset a thread (reserved).
    ThreadReset = 0x02,

    /// Reserved.
    Placeholder = 0x03,

    /// Commit the heap page whose address the argument points to.
    AllocatePage = 0x04,
}

/// Number of valid enclave calls.
pub const ECALL_NR: i64 = 5;

/// Error returned for an invalid call number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidEcall(pub i64);

impl TryFrom<i64> for Ecall {
    type Error = InvalidEcall;

    #[inline]
    fn try_from(index: i64) -> Result<Self, Self::Error> {
        match index {
            index if index == Ecall::EnclaveStart as _ => Ok(Ecall::EnclaveStart),
            index if index == Ecall::ThreadStart as _ => Ok(Ecall::ThreadStart),
            index if index == Ecall::ThreadReset as _ => Ok(Ecall::ThreadReset),
            index if index == Ecall::Placeholder as _ => Ok(Ecall::Placeholder),
            index if index == Ecall::AllocatePage as _ => Ok(Ecall::AllocatePage),
            index => Err(InvalidEcall(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_numbers() {
        assert_eq!(Ecall::EnclaveStart as i64, 0);
        assert_eq!(Ecall::ThreadStart as i64, 1);
        assert_eq!(Ecall::ThreadReset as i64, 2);
        assert_eq!(Ecall::Placeholder as i64, 3);
        assert_eq!(Ecall::AllocatePage as i64, 4);
    }

    #[test]
    fn try_from_index() {
        for index in 0..ECALL_NR {
            assert_eq!(Ecall::try_from(index).unwrap() as i64, index);
        }

        assert_eq!(Ecall::try_from(-1), Err(InvalidEcall(-1)));
        assert_eq!(Ecall::try_from(ECALL_NR), Err(InvalidEcall(ECALL_NR)));
        assert_eq!(Ecall::try_from(i64::MIN), Err(InvalidEcall(i64::MIN)));
    }
}
