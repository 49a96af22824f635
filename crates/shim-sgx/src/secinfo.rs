// SPDX-License-Identifier: Apache-2.0

//! Security information passed to `EACCEPT` and `EMODPE`

bitflags::bitflags! {
    /// Page permission and state flags
    #[derive(Default)]
    #[repr(transparent)]
    pub struct Flags: u8 {
        /// Read access
        const READ = 1 << 0;

        /// Write access
        const WRITE = 1 << 1;

        /// Execute access
        const EXECUTE = 1 << 2;

        /// The page is pending acceptance
        const PENDING = 1 << 3;

        /// The page type or permissions were modified
        const MODIFIED = 1 << 4;

        /// The page permissions were restricted
        const RESTRICTED = 1 << 5;
    }
}

/// Page class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Class {
    /// Regular enclave page
    Regular = 2,

    /// Page trimmed by the host, waiting for removal
    Trimmed = 4,
}

/// The security information block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct SecInfo {
    flags: u64,
    reserved: [u64; 7],
}

impl SecInfo {
    /// Create a new instance.
    #[inline]
    pub const fn new(class: Class, flags: Flags) -> Self {
        Self {
            flags: flags.bits() as u64 | (class as u64) << 8,
            reserved: [0; 7],
        }
    }

    /// A freshly added heap page: `REG | R | W | PENDING`
    #[inline]
    pub const fn pending() -> Self {
        Self::new(
            Class::Regular,
            Flags::from_bits_truncate(
                Flags::READ.bits() | Flags::WRITE.bits() | Flags::PENDING.bits(),
            ),
        )
    }

    /// Extension of a committed page to `R | W | X`
    #[inline]
    pub const fn executable() -> Self {
        Self::new(
            Class::Regular,
            Flags::from_bits_truncate(
                Flags::READ.bits() | Flags::WRITE.bits() | Flags::EXECUTE.bits(),
            ),
        )
    }

    /// A page trimmed by the host: `TRIM | MODIFIED`
    #[inline]
    pub const fn trimmed() -> Self {
        Self::new(Class::Trimmed, Flags::MODIFIED)
    }

    /// The page flags
    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags as u8)
    }

    /// The page class
    #[inline]
    pub fn class(&self) -> Option<Class> {
        match (self.flags >> 8) as u8 {
            c if c == Class::Regular as u8 => Some(Class::Regular),
            c if c == Class::Trimmed as u8 => Some(Class::Trimmed),
            _ => None,
        }
    }
}
