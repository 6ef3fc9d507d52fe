//! Syscall numbers and wire encodings
//!
//! The kernel-side state machine works with typed values (`Option<VirtAddr>`,
//! `KernelError`). This module pins down how those cross the syscall
//! boundary as raw words, so kernel and environments agree without sharing
//! internal types.

use vega_kernel_core::{KernelError, VirtAddr, USER_TOP};

// =============================================================================
// Syscall Numbers (Environment → Kernel operations)
// =============================================================================

/// Yield/cooperative scheduling hint
pub const SYS_YIELD: u32 = 0x02;
/// Exit environment
pub const SYS_EXIT: u32 = 0x03;
/// Get current time (nanos since boot)
pub const SYS_TIME: u32 = 0x04;

/// One non-blocking delivery attempt
pub const SYS_IPC_TRY_SEND: u32 = 0x40;
/// Post a blocking receive
pub const SYS_IPC_RECV: u32 = 0x41;

// =============================================================================
// Wire Encodings
// =============================================================================

/// "No page" in a page-address argument.
///
/// All ones rather than zero: zero is a legitimate address to map a page
/// at, while no user address can ever be at or above [`USER_TOP`].
pub const NO_PAGE_SENTINEL: u64 = u64::MAX;

/// Success return value
pub const OK: i64 = 0;

/// Target was not blocked in a receive (transient; retry after a yield)
pub const ERR_NOT_RECEIVING: i64 = -1;
/// Target environment does not exist or is being torn down
pub const ERR_BAD_TARGET: i64 = -2;
/// Offered rights are malformed or exceed what the source page allows
pub const ERR_INVALID_PERMISSION: i64 = -3;
/// No memory to establish the receiver-side mapping
pub const ERR_OUT_OF_MEMORY: i64 = -4;
/// Malformed address or argument
pub const ERR_INVALID_ARGUMENT: i64 = -5;

/// Encode an optional page address for the wire.
pub fn encode_page_arg(va: Option<VirtAddr>) -> u64 {
    match va {
        Some(va) => va.0,
        None => NO_PAGE_SENTINEL,
    }
}

/// Decode a page-address argument. Any value outside the user range means
/// "no page"; the canonical spelling is [`NO_PAGE_SENTINEL`].
pub fn decode_page_arg(raw: u64) -> Option<VirtAddr> {
    if raw >= USER_TOP {
        None
    } else {
        Some(VirtAddr(raw))
    }
}

/// The wire code for a kernel error.
pub fn error_code(err: KernelError) -> i64 {
    match err {
        KernelError::NotReceiving => ERR_NOT_RECEIVING,
        KernelError::BadTarget => ERR_BAD_TARGET,
        KernelError::InvalidPermission => ERR_INVALID_PERMISSION,
        KernelError::OutOfMemory => ERR_OUT_OF_MEMORY,
        KernelError::InvalidArgument => ERR_INVALID_ARGUMENT,
    }
}

/// Decode a wire error code. Returns `None` for `OK` or unknown codes.
pub fn error_from_code(code: i64) -> Option<KernelError> {
    match code {
        ERR_NOT_RECEIVING => Some(KernelError::NotReceiving),
        ERR_BAD_TARGET => Some(KernelError::BadTarget),
        ERR_INVALID_PERMISSION => Some(KernelError::InvalidPermission),
        ERR_OUT_OF_MEMORY => Some(KernelError::OutOfMemory),
        ERR_INVALID_ARGUMENT => Some(KernelError::InvalidArgument),
        _ => None,
    }
}
