// SPDX-License-Identifier: Apache-2.0

//! Argument blocks passed by the host

/// Maximum size of the argument string block
pub const MAX_ARGS_SIZE: usize = 10_000_000;

/// Maximum size of the environment string block
pub const MAX_ENV_SIZE: usize = 10_000_000;

/// Number of request slots in the exitless [`RpcQueue`]
pub const RPC_QUEUE_SIZE: usize = 1024;

/// Argument block of [`Ecall::EnclaveStart`](crate::Ecall::EnclaveStart)
///
/// Every pointer is an address in untrusted memory. None of them may be
/// dereferenced before the enclave verified that the pointed-to object lies
/// completely outside of the enclave.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct StartArgs {
    /// Address of the argument strings
    pub args: usize,
    /// Size of the argument strings in bytes
    pub args_size: usize,
    /// Address of the environment strings
    pub env: usize,
    /// Size of the environment strings in bytes
    pub env_size: usize,
    /// Address of the [`SecurityInfo`]
    pub security_info: usize,
    /// Address of the exitless [`RpcQueue`], or `0` if not requested
    pub rpc_queue: usize,
}

/// Enclave attributes as reported by the host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Attributes {
    /// Enclave feature flags
    pub flags: u64,
    /// Enabled extended CPU state components
    pub xfrm: u64,
}

/// Security parameters handed over by the host on start
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SecurityInfo {
    /// Enclave attributes
    pub attributes: Attributes,
    /// Size of the enclave in bytes
    pub enclave_size: u64,
}

/// Queue for exitless calls, living in untrusted memory
#[derive(Debug)]
#[repr(C)]
pub struct RpcQueue {
    /// Spin lock word shared with the host
    pub lock: u32,
    /// Index of the first pending request
    pub front: u64,
    /// Index after the last pending request
    pub rear: u64,
    /// Untrusted request pointers
    pub q: [usize; RPC_QUEUE_SIZE],
}

#[cfg(test)]
mod tests {
    use super::*;

    use testaso::testaso;

    testaso! {
        struct StartArgs: 8, 48 => {
            args: 0,
            args_size: 8,
            env: 16,
            env_size: 24,
            security_info: 32,
            rpc_queue: 40
        }

        struct Attributes: 8, 16 => {
            flags: 0,
            xfrm: 8
        }

        struct SecurityInfo: 8, 24 => {
            attributes: 0,
            enclave_size: 16
        }

        struct RpcQueue: 8, 8216 => {
            lock: 0,
            front: 8,
            rear: 16,
            q: 24
        }
    }
}
