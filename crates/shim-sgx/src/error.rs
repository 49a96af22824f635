// SPDX-License-Identifier: Apache-2.0

//! Errors of the heap manager and the demand paging layer

use core::ffi::c_int;
use core::fmt;

use libc::{EFAULT, EINVAL, ENOMEM};

/// Error type used within this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A VMA pool or the internal memory budget is exhausted, or no gap fits.
    NoMemory,

    /// The range is outside of the heap, empty, or overlaps memory of the other kind.
    InvalidRange,

    /// The request is misaligned or spans internal and user memory.
    InvalidArgument,

    /// An `ENCLU` leaf failed with the given error code.
    Enclu(u32),

    /// A host call failed with the given errno.
    Host(c_int),
}

/// Result type returned by functionality exposed by this crate.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMemory => write!(f, "out of enclave memory"),
            Error::InvalidRange => write!(f, "invalid enclave memory range"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Enclu(code) => write!(f, "ENCLU failed with {code:#x}"),
            Error::Host(errno) => write!(f, "host call failed with errno {errno}"),
        }
    }
}

impl From<Error> for c_int {
    /// Map to the errno reported to the payload.
    #[inline]
    fn from(error: Error) -> Self {
        match error {
            Error::NoMemory => ENOMEM,
            Error::InvalidRange | Error::InvalidArgument => EINVAL,
            Error::Enclu(_) => EFAULT,
            Error::Host(errno) => errno,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno() {
        assert_eq!(c_int::from(Error::NoMemory), ENOMEM);
        assert_eq!(c_int::from(Error::InvalidRange), EINVAL);
        assert_eq!(c_int::from(Error::InvalidArgument), EINVAL);
        assert_eq!(c_int::from(Error::Enclu(11)), EFAULT);
        assert_eq!(c_int::from(Error::Host(libc::EAGAIN)), libc::EAGAIN);
    }
}
