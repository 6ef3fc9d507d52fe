//! Core kernel types
//!
//! This module contains the fundamental types used throughout the kernel
//! core. All types here are pure data - no behavior that depends on HAL.

use alloc::string::String;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Environment identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvId(pub u64);

/// Physical frame handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

/// Environment run state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvState {
    /// Ready to run
    Runnable,
    /// Currently executing
    Running,
    /// Parked in a posted receive, schedulable only as a match target
    BlockedOnReceive,
    /// Exists but is not eligible for scheduling
    NotRunnable,
    /// Being torn down
    Dying,
}

/// Size of one page in bytes
pub const PAGE_SIZE: u64 = 4096;

/// First address above the user-addressable range.
///
/// The wire-level "no page" sentinel (all ones) depends on this bound: no
/// legitimate user address is at or above `USER_TOP`, while zero IS a
/// legitimate place to map a page and must never be used as a sentinel.
pub const USER_TOP: u64 = 0x8000_0000_0000;

/// A user virtual address
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// Whether this address sits on a page boundary
    pub fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Whether this address is inside the user-addressable range
    pub fn is_user(&self) -> bool {
        self.0 < USER_TOP
    }

    /// Round down to the containing page boundary
    pub fn page_base(&self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }
}

bitflags! {
    /// Access rights for a transferred page
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PagePerm: u32 {
        /// Page is readable
        const READ = 1 << 0;
        /// Page is writable
        const WRITE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
    }
}

impl PagePerm {
    /// Capped maximum any rendezvous can grant. Whatever the sender offers
    /// is intersected with this mask before it reaches the receiver.
    pub const GRANT_MASK: PagePerm = PagePerm::READ.union(PagePerm::WRITE).union(PagePerm::USER);

    /// Bits every offered permission must carry: a transferred page is
    /// always readable and user-visible.
    pub const REQUIRED: PagePerm = PagePerm::READ.union(PagePerm::USER);

    /// Whether this mask is well-formed as an offer: carries the required
    /// bits and nothing outside the grantable set.
    pub fn is_grantable(&self) -> bool {
        self.contains(Self::REQUIRED) && Self::GRANT_MASK.contains(*self)
    }
}

/// Per-environment IPC control record.
///
/// Owned exclusively by its environment. Mutated only by the rendezvous
/// matcher (which runs inside the winning sender's step) and read by the
/// receive path when its owner resumes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpcState {
    /// True between a posted receive and the matching delivery
    pub receiving: bool,
    /// Environment that delivered the last message
    pub from: Option<EnvId>,
    /// Last delivered payload
    pub value: u32,
    /// Rights actually granted for a transferred page; empty if none moved
    pub perm: PagePerm,
    /// Receiver-chosen landing address for an incoming page, recorded when
    /// the receive is posted and consumed by the match
    pub dst_va: Option<VirtAddr>,
}

impl IpcState {
    /// Reset the record to its neutral (not receiving, nothing delivered)
    /// state. Called when the environment starts and when a delivery has
    /// been consumed.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Environment descriptor
pub struct Env {
    /// Environment ID
    pub id: EnvId,
    /// Environment name
    pub name: String,
    /// Current run state
    pub state: EnvState,
    /// IPC control record
    pub ipc: IpcState,
    /// Detailed metrics for this environment
    pub metrics: EnvMetrics,
}

/// Per-environment resource tracking
#[derive(Clone, Debug, Default)]
pub struct EnvMetrics {
    /// Messages delivered by this environment
    pub ipc_sent: u64,
    /// Messages delivered to this environment
    pub ipc_received: u64,
    /// Syscalls made
    pub syscall_count: u64,
    /// Time of last activity (nanos since boot)
    pub last_active_ns: u64,
    /// Environment start time (nanos since boot)
    pub start_time_ns: u64,
}

/// System-wide metrics
#[derive(Clone, Debug)]
pub struct SystemMetrics {
    /// Environment count
    pub env_count: usize,
    /// Environments parked in a posted receive
    pub blocked_on_receive: usize,
    /// Frames left in the bookkeeping pool
    pub free_frames: usize,
    /// Total IPC messages since boot
    pub total_ipc_messages: u64,
    /// Uptime in nanoseconds
    pub uptime_ns: u64,
}

// ============================================================================
// IPC Types
// ============================================================================

/// An optional page offer accompanying a send: the sender's source address
/// and the permission it is willing to grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTransfer {
    /// Page-aligned address of the page in the sender's address space
    pub src_va: VirtAddr,
    /// Rights the sender offers on that page
    pub perm: PagePerm,
}

/// A message in flight. Not a persisted entity - it exists only as the
/// matcher's working state between the send attempt and the control-record
/// write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// Scalar payload
    pub value: u32,
    /// Optional page offer
    pub page: Option<PageTransfer>,
}

/// What a completed receive exposes to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Identity of the environment that delivered the message
    pub from: EnvId,
    /// Delivered scalar
    pub value: u32,
    /// Rights actually granted; empty whenever no page was transferred
    pub perm: PagePerm,
}
