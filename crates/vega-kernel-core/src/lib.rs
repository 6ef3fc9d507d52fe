//! Vega OS Kernel Core - Pure State Machine for Rendezvous IPC
//!
//! This crate contains the **pure, HAL-free** kernel state machine that
//! models Vega OS's synchronous, single-message IPC facility: isolated
//! environments exchange one 32-bit scalar and, optionally, one page of
//! memory (with a narrowed permission grant) per rendezvous.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: All platform-specific code lives in `vega-kernel`
//! 2. **No I/O or side effects**: Pure state transformations only
//! 3. **Deterministic**: Same input always produces same output
//! 4. **Verifiable**: Small core suitable for property-based testing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   vega-kernel-core                          │
//! │                 (Pure State Machine)                        │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │  KernelState  │    │    step()     │                   │
//! │   │  - envs       │───▶│  Pure state   │                   │
//! │   │  - addr spaces│    │  transformer  │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │  Rendezvous   │    │  Invariants   │                   │
//! │   │  try_deliver  │    │  Assertions   │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      vega-kernel                            │
//! │                  (Runtime Wrapper)                          │
//! │                                                             │
//! │   - Cooperative round-robin scheduling                      │
//! │   - Commit recording, structured logging                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # The rendezvous contract
//!
//! `IpcRecv` parks the calling environment in `BlockedOnReceive` and marks
//! its control record as receiving. `IpcTrySend` never blocks: it either
//! completes the whole match synchronously inside the sender's step (value
//! write, optional page grant, receiver wake) or fails with a transient
//! `NotReceiving`. Exactly one sender can win a match because the matcher
//! runs under the single `&mut KernelState` borrow.
//!
//! # Module Organization
//!
//! - `types` - Core kernel types (EnvId, IpcState, PagePerm, etc.)
//! - `mem` - Address spaces and the page mapping primitive
//! - `state` - KernelState struct with all kernel data
//! - `step` - Pure `step(state, syscall) -> (state', result)` function
//! - `rendezvous` - The atomic sender/receiver matcher
//! - `invariants` - Runtime-checkable invariant assertions
//! - `unwind` - Frame-pointer stack walker for diagnostics

#![no_std]
extern crate alloc;

pub mod invariants;
pub mod mem;
pub mod rendezvous;
pub mod state;
pub mod step;
pub mod types;
pub mod unwind;

// Re-export all public types for convenient access
pub use invariants::{check_all_invariants, InvariantViolation};
pub use mem::{AddressSpace, Mapping};
pub use rendezvous::try_deliver;
pub use state::KernelState;
pub use step::{step, Commit, CommitType, KernelError, StepResult, Syscall, SyscallResult};
pub use types::{
    Delivery, Env, EnvId, EnvMetrics, EnvState, FrameId, IpcState, Message, PagePerm,
    PageTransfer, SystemMetrics, VirtAddr, PAGE_SIZE, USER_TOP,
};
pub use unwind::{Backtrace, FrameReader, StackFrame, SymbolInfo, SymbolResolver};
