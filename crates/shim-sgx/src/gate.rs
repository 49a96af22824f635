// SPDX-License-Identifier: Apache-2.0

//! The call gate validating every entry of the host into the enclave
//!
//! The entry trampoline saves the untrusted stack pointer into the [`Tcb`]
//! and calls [`Gate::handle`] with the call number and argument pointer the
//! host passed. Everything but the enclave base address is untrusted. A
//! rejected call has no side effect on the enclave state and must not be
//! resumed by the trampoline.

use core::fmt;
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use ecall::{Ecall, RpcQueue, SecurityInfo, StartArgs, MAX_ARGS_SIZE, MAX_ENV_SIZE};
use lset::Line;
use primordial::Page;
use spin::Once;
use tracing::{debug, trace};

use crate::is_page_aligned;
use crate::memory::EnclaveMemory;
use crate::platform::Platform;
use crate::xsave::xsave_size;

/// Phase of the one-shot enclave start
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No start was attempted
    Uninitialized = 0,
    /// A start is in progress or failed validation
    Starting = 1,
    /// The start block was validated and the main entry was entered
    Ready = 2,
}

/// Tri-state guard of the enclave start
#[derive(Debug)]
pub struct StartGuard(AtomicU8);

impl StartGuard {
    /// Create a new guard in [`State::Uninitialized`].
    pub const fn new() -> Self {
        Self(AtomicU8::new(State::Uninitialized as u8))
    }

    /// The current state
    pub fn state(&self) -> State {
        match self.0.load(Ordering::Acquire) {
            s if s == State::Ready as u8 => State::Ready,
            s if s == State::Starting as u8 => State::Starting,
            _ => State::Uninitialized,
        }
    }

    /// Move from [`State::Uninitialized`] to [`State::Starting`].
    ///
    /// Only one caller ever succeeds, all others get the state they lost to.
    fn begin(&self) -> Result<(), State> {
        self.0
            .compare_exchange(
                State::Uninitialized as u8,
                State::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| self.state())
    }

    fn ready(&self) {
        self.0.store(State::Ready as u8, Ordering::Release);
    }
}

impl Default for StartGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Set by the main entry once the enclave is fully initialized
#[derive(Debug, Default)]
pub struct InitFlag(AtomicBool);

impl InitFlag {
    /// Create a cleared flag.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark the enclave as fully initialized.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the enclave is fully initialized
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per thread control block
///
/// `enclave_size` is part of the measured enclave image, `ursp` is saved by
/// the trampoline and untrusted. The remaining fields are set by the gate on
/// every accepted entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tcb {
    /// Size of the enclave in bytes
    pub enclave_size: usize,
    /// Untrusted stack pointer saved at SSA level 0 and above 0
    pub ursp: [usize; 2],
    /// Address the host resumes at after exiting the enclave
    pub exit_target: usize,
    /// Untrusted stack of the thread
    pub ustack: usize,
    /// Top of the untrusted stack of the thread
    pub ustack_top: usize,
    /// Untrusted stack of a nested entry
    pub ecall_ustack: usize,
    /// Address to clear when the thread exits
    pub clear_child_tid: usize,
    /// Whether the untrusted scratch area is in use
    pub untrusted_area_in_use: bool,
}

/// An entry from the host as decoded by the trampoline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    /// Call number
    pub index: i64,
    /// Argument pointer
    pub args: usize,
    /// Address to resume the host at
    pub exit_target: usize,
    /// Base address of the enclave, computed by the trampoline
    pub enclave_base: usize,
    /// Current SSA level
    pub cssa: u64,
}

/// Validated start parameters handed to [`Runtime::enclave_main`]
#[derive(Clone, Copy, Debug)]
pub struct Start<'g> {
    /// Untrusted argument strings
    pub args: Line<usize>,
    /// Untrusted environment strings
    pub env: Line<usize>,
    /// Copy of the security information
    pub security: SecurityInfo,
    /// Untrusted exitless call queue, if requested
    pub rpc_queue: Option<usize>,
    /// Size of the XSAVE area
    pub xsave_size: usize,
    /// To be set once the enclave is fully initialized
    pub initialized: &'g InitFlag,
}

/// Entry points of the payload runtime
pub trait Runtime {
    /// Start the enclave. Never returns in production.
    fn enclave_main(&self, start: Start<'_>);

    /// Start an additional thread. Never returns in production.
    fn thread_start(&self);
}

/// Outcome of an accepted call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The main entry returned
    Started,
    /// The thread entry returned
    ThreadStarted,
    /// A heap page was requested, with the number of newly committed pages
    PageCommitted(usize),
}

/// Reason of a rejected call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejected {
    /// The call number is invalid
    UnknownCall(i64),
    /// The untrusted stack pointer points into the enclave
    StackInEnclave,
    /// Another thread is starting the enclave, or its start failed
    AlreadyStarting,
    /// The enclave was started already
    AlreadyStarted,
    /// The enclave was not started yet
    NotStarted,
    /// The enclave is not fully initialized yet
    NotInitialized,
    /// The start block is invalid
    BadStartArgs,
    /// The exitless call queue is invalid
    BadRpcQueue,
    /// The security information is invalid
    BadSecurityInfo,
    /// The argument or environment strings are invalid
    BadArgs,
    /// The requested page is invalid
    InvalidPage,
    /// The call is reserved
    Unsupported(Ecall),
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejected::UnknownCall(index) => write!(f, "unknown call {index}"),
            Rejected::StackInEnclave => write!(f, "untrusted stack inside the enclave"),
            Rejected::AlreadyStarting => write!(f, "enclave start in progress or failed"),
            Rejected::AlreadyStarted => write!(f, "enclave already started"),
            Rejected::NotStarted => write!(f, "enclave not started"),
            Rejected::NotInitialized => write!(f, "enclave not initialized"),
            Rejected::BadStartArgs => write!(f, "invalid start arguments"),
            Rejected::BadRpcQueue => write!(f, "invalid rpc queue"),
            Rejected::BadSecurityInfo => write!(f, "invalid security info"),
            Rejected::BadArgs => write!(f, "invalid arguments or environment"),
            Rejected::InvalidPage => write!(f, "invalid page"),
            Rejected::Unsupported(call) => write!(f, "unsupported call {call:?}"),
        }
    }
}

/// Whether `[addr, addr + len)` lies completely outside of `enclave`
#[inline]
pub fn is_outside(addr: usize, len: usize, enclave: Line<usize>) -> bool {
    match addr.checked_add(len) {
        Some(end) => end <= enclave.start || addr >= enclave.end,
        None => false,
    }
}

/// `ptr` if it is non-null and aligned for `T`
#[inline]
pub fn is_aligned_non_null<T>(ptr: usize) -> Option<usize> {
    if ptr == 0 || ptr % align_of::<T>() != 0 {
        return None;
    }
    Some(ptr)
}

/// Copy a `T` from untrusted memory, if it lies completely outside of `enclave`.
///
/// # Safety
///
/// Untrusted memory passing the checks must be readable.
unsafe fn copy_in<T: Copy>(ptr: usize, enclave: Line<usize>) -> Option<T> {
    let ptr = is_aligned_non_null::<T>(ptr)?;

    if !is_outside(ptr, size_of::<T>(), enclave) {
        return None;
    }

    Some(core::ptr::read_volatile(ptr as *const T))
}

fn strings(addr: usize, size: usize, max: usize, enclave: Line<usize>) -> Option<Line<usize>> {
    if size > max || (size > 0 && addr == 0) || !is_outside(addr, size, enclave) {
        return None;
    }

    Some(Line::new(addr, addr + size))
}

#[derive(Clone, Copy, Debug)]
struct Boot {
    rpc_queue: Option<usize>,
    xsave_size: usize,
}

/// The call gate
pub struct Gate<'m, 'a, P, R> {
    memory: &'m EnclaveMemory<'a, P>,
    runtime: R,
    guard: StartGuard,
    initialized: InitFlag,
    enclave: Once<Line<usize>>,
    boot: Once<Boot>,
}

impl<'m, 'a, P: Platform, R: Runtime> Gate<'m, 'a, P, R> {
    /// Create a new gate committing heap pages through `memory`.
    pub fn new(memory: &'m EnclaveMemory<'a, P>, runtime: R) -> Self {
        Self {
            memory,
            runtime,
            guard: StartGuard::new(),
            initialized: InitFlag::new(),
            enclave: Once::new(),
            boot: Once::new(),
        }
    }

    /// The payload runtime
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// The start phase
    pub fn state(&self) -> State {
        self.guard.state()
    }

    /// Whether the main entry reported the enclave as fully initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized.is_set()
    }

    /// The enclave range, once observed
    pub fn enclave(&self) -> Option<Line<usize>> {
        self.enclave.get().copied()
    }

    /// The validated exitless call queue
    pub fn rpc_queue(&self) -> Option<usize> {
        self.boot.get().and_then(|boot| boot.rpc_queue)
    }

    /// The XSAVE area size computed on start
    pub fn xsave_size(&self) -> Option<usize> {
        self.boot.get().map(|boot| boot.xsave_size)
    }

    /// Handle an entry of the host.
    ///
    /// # Safety
    ///
    /// Every object outside of the enclave which passes validation must be
    /// readable. The trampoline must not resume a rejected entry.
    pub unsafe fn handle(&self, entry: &Entry, tcb: &mut Tcb) -> Result<Dispatch, Rejected> {
        let call = Ecall::try_from(entry.index).map_err(|e| reject(Rejected::UnknownCall(e.0)))?;

        let enclave = *self.enclave.call_once(|| {
            Line::new(
                entry.enclave_base,
                entry.enclave_base.saturating_add(tcb.enclave_size),
            )
        });

        let level = if entry.cssa == 0 { 0 } else { 1 };
        let ursp = tcb.ursp[level];
        if ursp >= enclave.start && ursp <= enclave.end {
            return Err(reject(Rejected::StackInEnclave));
        }

        tcb.exit_target = entry.exit_target;
        if level == 0 {
            tcb.ustack = ursp;
            tcb.ustack_top = ursp;
        } else {
            tcb.ecall_ustack = ursp;
        }
        tcb.clear_child_tid = 0;
        tcb.untrusted_area_in_use = false;

        match call {
            Ecall::EnclaveStart => self.enclave_start(entry.args, enclave),
            Ecall::ThreadStart => self.thread_start(),
            Ecall::AllocatePage => self.allocate_page(entry.args, enclave),
            call => Err(reject(Rejected::Unsupported(call))),
        }
    }

    unsafe fn enclave_start(&self, ptr: usize, enclave: Line<usize>) -> Result<Dispatch, Rejected> {
        self.guard.begin().map_err(|state| match state {
            State::Ready => reject(Rejected::AlreadyStarted),
            _ => reject(Rejected::AlreadyStarting),
        })?;

        // From here on a failed validation leaves the guard starting forever.
        let args: StartArgs = copy_in(ptr, enclave).ok_or_else(|| reject(Rejected::BadStartArgs))?;

        let rpc_queue = match args.rpc_queue {
            0 => None,
            queue => {
                let queue = is_aligned_non_null::<RpcQueue>(queue)
                    .filter(|queue| is_outside(*queue, size_of::<RpcQueue>(), enclave))
                    .ok_or_else(|| reject(Rejected::BadRpcQueue))?;
                Some(queue)
            }
        };

        let security: SecurityInfo = copy_in(args.security_info, enclave)
            .ok_or_else(|| reject(Rejected::BadSecurityInfo))?;

        let argv = strings(args.args, args.args_size, MAX_ARGS_SIZE, enclave)
            .ok_or_else(|| reject(Rejected::BadArgs))?;
        let envp = strings(args.env, args.env_size, MAX_ENV_SIZE, enclave)
            .ok_or_else(|| reject(Rejected::BadArgs))?;

        let boot = *self.boot.call_once(|| Boot {
            rpc_queue,
            xsave_size: xsave_size(security.attributes.xfrm),
        });

        self.guard.ready();
        trace!(?rpc_queue, xsave_size = boot.xsave_size, "enclave start");

        self.runtime.enclave_main(Start {
            args: argv,
            env: envp,
            security,
            rpc_queue: boot.rpc_queue,
            xsave_size: boot.xsave_size,
            initialized: &self.initialized,
        });

        Ok(Dispatch::Started)
    }

    fn thread_start(&self) -> Result<Dispatch, Rejected> {
        if self.guard.state() != State::Ready {
            return Err(reject(Rejected::NotStarted));
        }

        if !self.initialized.is_set() {
            return Err(reject(Rejected::NotInitialized));
        }

        trace!("thread start");
        self.runtime.thread_start();
        Ok(Dispatch::ThreadStarted)
    }

    unsafe fn allocate_page(&self, ptr: usize, enclave: Line<usize>) -> Result<Dispatch, Rejected> {
        if self.guard.state() != State::Ready {
            return Err(reject(Rejected::NotStarted));
        }

        let page: usize = copy_in(ptr, enclave).ok_or_else(|| reject(Rejected::InvalidPage))?;
        if !is_page_aligned(page) {
            return Err(reject(Rejected::InvalidPage));
        }

        let committed = self
            .memory
            .commit_range(page, Page::SIZE, true)
            .map_err(|e| {
                debug!("committing page {:#x} failed: {}", page, e);
                Rejected::InvalidPage
            })?;

        trace!(page, committed, "allocate page");
        Ok(Dispatch::PageCommitted(committed))
    }
}

#[inline]
fn reject(reason: Rejected) -> Rejected {
    debug!("rejecting enclave entry: {}", reason);
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside() {
        let enclave = Line::new(0x1000, 0x2000);

        assert!(is_outside(0x0, 0x1000, enclave));
        assert!(is_outside(0x2000, 0x10, enclave));
        assert!(!is_outside(0x0, 0x1001, enclave));
        assert!(!is_outside(0x1fff, 0x1, enclave));
        assert!(!is_outside(0x0, 0x3000, enclave));
        assert!(!is_outside(usize::MAX, 2, enclave));
    }

    #[test]
    fn aligned_non_null() {
        assert_eq!(is_aligned_non_null::<u64>(0), None);
        assert_eq!(is_aligned_non_null::<u64>(4), None);
        assert_eq!(is_aligned_non_null::<u64>(8), Some(8));
        assert_eq!(is_aligned_non_null::<u8>(3), Some(3));
    }

    #[test]
    fn start_guard() {
        let guard = StartGuard::new();
        assert_eq!(guard.state(), State::Uninitialized);

        assert_eq!(guard.begin(), Ok(()));
        assert_eq!(guard.begin(), Err(State::Starting));
        assert_eq!(guard.state(), State::Starting);

        guard.ready();
        assert_eq!(guard.begin(), Err(State::Ready));
    }

    #[test]
    fn init_flag() {
        let flag = InitFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn string_limits() {
        let enclave = Line::new(0x10_0000, 0x20_0000);

        assert_eq!(strings(0, 0, MAX_ARGS_SIZE, enclave), Some(Line::new(0, 0)));
        assert_eq!(strings(0, 8, MAX_ARGS_SIZE, enclave), None);
        assert_eq!(strings(0x1000, MAX_ARGS_SIZE + 1, MAX_ARGS_SIZE, enclave), None);
        assert_eq!(strings(0x0f_fff0, 0x20, MAX_ARGS_SIZE, enclave), None);
        assert_eq!(
            strings(0x1000, 0x20, MAX_ARGS_SIZE, enclave),
            Some(Line::new(0x1000, 0x1020))
        );
    }
}
