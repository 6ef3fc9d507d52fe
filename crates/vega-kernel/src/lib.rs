//! Vega OS kernel runtime
//!
//! This crate wraps the pure state machine in `vega-kernel-core` with a
//! cooperative round-robin scheduler. The core decides what every syscall
//! does; this crate decides who runs next, resumes environment programs
//! with the outcome of their last syscall, and hands matched deliveries to
//! woken receivers.
//!
//! The split mirrors the core's design: everything observable about IPC is
//! decided inside `step`, so the runtime stays a thin driver that can be
//! replaced (or ported to a real interrupt-driven host) without touching
//! rendezvous semantics.

#![no_std]
extern crate alloc;

pub mod sched;

// Re-export the core so runtime users need only one dependency
pub use vega_kernel_core::{
    check_all_invariants, step, Commit, CommitType, Delivery, Env, EnvId, EnvState, FrameId,
    InvariantViolation, KernelError, KernelState, PagePerm, PageTransfer, StepResult, Syscall,
    SyscallResult, SystemMetrics, VirtAddr, PAGE_SIZE, USER_TOP,
};

pub use sched::{Action, EnvProgram, Event, Kernel, TIME_SLICE_NS};
