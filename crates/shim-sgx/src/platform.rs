// SPDX-License-Identifier: Apache-2.0

//! Hardware leaves and host calls consumed by the demand paging layer

use crate::secinfo::SecInfo;
use crate::Result;

/// Enclave page primitives
///
/// The removal of pages has a mandatory order:
/// [`trim`](Platform::trim), then [`accept`](Platform::accept) of every
/// trimmed page, then [`notify_removed`](Platform::notify_removed).
pub trait Platform {
    /// `EACCEPT` the page at `page` with the given security information.
    fn accept(&self, page: usize, secinfo: &SecInfo) -> Result<()>;

    /// `EMODPE` the page at `page` to extend its permissions.
    fn extend(&self, page: usize, secinfo: &SecInfo) -> Result<()>;

    /// Ask the host to trim `pages` pages starting at `addr`.
    fn trim(&self, addr: usize, pages: usize) -> Result<()>;

    /// Tell the host that `pages` trimmed pages starting at `addr` were accepted.
    fn notify_removed(&self, addr: usize, pages: usize) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::secinfo::Class;
    use crate::Error;

    use std::sync::Mutex;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Call {
        Accept(usize, Option<Class>),
        Extend(usize),
        Trim(usize, usize),
        NotifyRemoved(usize, usize),
    }

    /// Records every primitive and fails on request
    #[derive(Default)]
    pub struct Recorder {
        pub calls: Mutex<Vec<Call>>,
        pub fail_accept: Mutex<Vec<usize>>,
        pub fail_trim: Mutex<Option<Error>>,
    }

    impl Recorder {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    impl Platform for Recorder {
        fn accept(&self, page: usize, secinfo: &SecInfo) -> Result<()> {
            if self.fail_accept.lock().unwrap().contains(&page) {
                return Err(Error::Enclu(11));
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Accept(page, secinfo.class()));
            Ok(())
        }

        fn extend(&self, page: usize, _secinfo: &SecInfo) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Extend(page));
            Ok(())
        }

        fn trim(&self, addr: usize, pages: usize) -> Result<()> {
            if let Some(err) = *self.fail_trim.lock().unwrap() {
                return Err(err);
            }
            self.calls.lock().unwrap().push(Call::Trim(addr, pages));
            Ok(())
        }

        fn notify_removed(&self, addr: usize, pages: usize) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::NotifyRemoved(addr, pages));
            Ok(())
        }
    }
}
