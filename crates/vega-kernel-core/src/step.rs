//! Pure step function - the heart of the kernel core
//!
//! This module contains the pure `step(state, syscall) -> (state', result)`
//! function. All state transformations happen here - no HAL, no I/O, no
//! side effects.
//!
//! # Design
//!
//! The step function takes:
//! - Current kernel state
//! - The calling environment and a syscall request
//! - Current timestamp
//!
//! And returns:
//! - Updated state (via mutation)
//! - Syscall result
//! - List of commits (state mutations for audit log)
//!
//! This design enables:
//! - Deterministic replay from the commit list
//! - Property-based testing of the rendezvous contract

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::rendezvous::try_deliver;
use crate::state::KernelState;
use crate::types::{EnvId, EnvState, Message, PageTransfer, VirtAddr};

// ============================================================================
// Syscall definitions
// ============================================================================

/// Syscall variants - all kernel operations
#[derive(Clone, Copy, Debug)]
pub enum Syscall {
    /// Yield the CPU
    Yield,

    /// Get current time
    GetTime,

    /// Exit the calling environment
    Exit { code: i32 },

    /// Post a blocking receive. `dst_va` is the landing address for an
    /// incoming page; `None` means "accept no page".
    IpcRecv { dst_va: Option<VirtAddr> },

    /// One non-blocking delivery attempt to a specific target.
    IpcTrySend {
        target: EnvId,
        value: u32,
        page: Option<PageTransfer>,
    },
}

// ============================================================================
// Syscall results
// ============================================================================

/// Syscall result - what the kernel returns to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallResult {
    /// Success with value
    Ok(u64),
    /// Error
    Err(KernelError),
    /// The caller is parked; the scheduler must not resume it until a
    /// match marks it runnable again
    Blocked,
}

/// Kernel errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Target is not currently blocked in a receive. The only transient
    /// error: expected under normal retry use.
    NotReceiving,
    /// Environment lookup failed
    BadTarget,
    /// Offered rights are malformed or exceed what the source page allows
    InvalidPermission,
    /// Malformed address or argument
    InvalidArgument,
    /// No memory available to establish the mapping
    OutOfMemory,
}

impl KernelError {
    /// Whether this failure is expected under normal concurrent operation
    /// and safe to retry. Everything except `NotReceiving` indicates a
    /// programming error or resource exhaustion in the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, KernelError::NotReceiving)
    }
}

// ============================================================================
// Commit types for audit log
// ============================================================================

/// Commit types - describe state mutations for audit/replay
#[derive(Clone, Debug)]
pub enum CommitType {
    /// Genesis commit (initial state)
    Genesis,
    /// Environment registered
    EnvRegistered { env: u64, name: String },
    /// Environment exited
    EnvExited { env: u64, code: i32 },
    /// A receive was posted and the caller parked
    ReceivePosted { env: u64 },
    /// A rendezvous completed
    IpcDelivered {
        from: u64,
        to: u64,
        value: u32,
        perm_bits: u32,
        page_mapped: bool,
    },
}

/// A commit record
#[derive(Clone, Debug)]
pub struct Commit {
    /// Sequence number (assigned by the commit log)
    pub seq: u64,
    /// Timestamp
    pub timestamp: u64,
    /// Type of mutation
    pub commit_type: CommitType,
}

impl Commit {
    /// Create a new commit (sequence is assigned when appended to a log)
    pub fn new(commit_type: CommitType, timestamp: u64) -> Self {
        Self {
            seq: 0,
            timestamp,
            commit_type,
        }
    }
}

/// Result of a step operation
pub struct StepResult {
    /// The syscall result
    pub result: SyscallResult,
    /// Commits generated by this step
    pub commits: Vec<Commit>,
}

// ============================================================================
// The pure step function
// ============================================================================

/// Execute a syscall on the kernel state.
///
/// This is the pure state machine function. It:
/// - Takes the current state, the calling environment and a syscall
/// - Updates the state (via mutation)
/// - Returns the result and commits
///
/// # Properties
///
/// 1. **Deterministic**: Same state + syscall always produces same result
/// 2. **No side effects**: Only mutates the provided state
/// 3. **Non-blocking sends**: `IpcTrySend` either completes the whole match
///    inside this call or fails without touching the target
pub fn step(
    state: &mut KernelState,
    from_env: EnvId,
    syscall: Syscall,
    timestamp: u64,
) -> StepResult {
    state.update_syscall_metrics(from_env, timestamp);

    match syscall {
        Syscall::Yield => StepResult {
            result: SyscallResult::Ok(0),
            commits: vec![],
        },

        Syscall::GetTime => StepResult {
            result: SyscallResult::Ok(timestamp),
            commits: vec![],
        },

        Syscall::Exit { code } => step_exit(state, from_env, code, timestamp),
        Syscall::IpcRecv { dst_va } => step_ipc_recv(state, from_env, dst_va, timestamp),
        Syscall::IpcTrySend {
            target,
            value,
            page,
        } => step_ipc_try_send(state, from_env, target, value, page, timestamp),
    }
}

// ============================================================================
// Syscall handlers
// ============================================================================

fn step_exit(state: &mut KernelState, from_env: EnvId, code: i32, timestamp: u64) -> StepResult {
    if let Some(env) = state.envs.get_mut(&from_env) {
        env.state = EnvState::Dying;
    }

    StepResult {
        result: SyscallResult::Ok(code as u64),
        commits: vec![Commit::new(
            CommitType::EnvExited {
                env: from_env.0,
                code,
            },
            timestamp,
        )],
    }
}

/// Post a receive: record the landing address, raise the receiving flag and
/// park the caller. While parked the environment is not schedulable for
/// anything except being the target of a match.
fn step_ipc_recv(
    state: &mut KernelState,
    from_env: EnvId,
    dst_va: Option<VirtAddr>,
    timestamp: u64,
) -> StepResult {
    if let Some(va) = dst_va {
        if !va.is_page_aligned() || !va.is_user() {
            return StepResult {
                result: SyscallResult::Err(KernelError::InvalidArgument),
                commits: vec![],
            };
        }
    }

    let env = match state.envs.get_mut(&from_env) {
        Some(e) => e,
        None => {
            return StepResult {
                result: SyscallResult::Err(KernelError::BadTarget),
                commits: vec![],
            }
        }
    };

    env.ipc.receiving = true;
    env.ipc.dst_va = dst_va;
    env.state = EnvState::BlockedOnReceive;

    StepResult {
        result: SyscallResult::Blocked,
        commits: vec![Commit::new(
            CommitType::ReceivePosted { env: from_env.0 },
            timestamp,
        )],
    }
}

/// One delivery attempt. The entire rendezvous (state check, page grant,
/// control-record write, wake) happens inside `try_deliver`, so a failed
/// attempt leaves no trace.
fn step_ipc_try_send(
    state: &mut KernelState,
    from_env: EnvId,
    target: EnvId,
    value: u32,
    page: Option<PageTransfer>,
    timestamp: u64,
) -> StepResult {
    match try_deliver(state, from_env, target, Message { value, page }) {
        Ok(granted) => StepResult {
            result: SyscallResult::Ok(0),
            commits: vec![Commit::new(
                CommitType::IpcDelivered {
                    from: from_env.0,
                    to: target.0,
                    value,
                    perm_bits: granted.bits(),
                    page_mapped: !granted.is_empty(),
                },
                timestamp,
            )],
        },
        Err(e) => StepResult {
            result: SyscallResult::Err(e),
            commits: vec![],
        },
    }
}
