//! IPC Protocol Constants & Client Helpers for Vega OS
//!
//! This crate defines:
//! - **Syscall numbers and wire encodings** (environment → kernel)
//! - **User-side helpers** wrapping the raw syscalls: the blocking
//!   receive and the retrying send loop
//!
//! It is the **single source of truth** for the IPC wire protocol,
//! eliminating duplication between the kernel and environment code.
//!
//! # Syscall Number Ranges
//!
//! | Range     | Category                      |
//! |-----------|-------------------------------|
//! | 0x01-0x0F | Misc (yield, exit, time)      |
//! | 0x40-0x4F | IPC (try-send, recv)          |
//!
//! # Wire Conventions
//!
//! | Convention          | Encoding                                  |
//! |---------------------|-------------------------------------------|
//! | "no page" address   | all-ones (`u64::MAX`), never zero         |
//! | success             | `0`                                       |
//! | errors              | small negative codes, one per failure     |
//!
//! Zero is a legitimate place to map a page, so the absent-page sentinel
//! is the all-ones word, which can never be a user address.

#![no_std]
extern crate alloc;

pub mod abi;
pub mod client;

pub use abi::{
    decode_page_arg, encode_page_arg, error_code, error_from_code, ERR_BAD_TARGET,
    ERR_INVALID_ARGUMENT, ERR_INVALID_PERMISSION, ERR_NOT_RECEIVING, ERR_OUT_OF_MEMORY,
    NO_PAGE_SENTINEL, OK, SYS_EXIT, SYS_IPC_RECV, SYS_IPC_TRY_SEND, SYS_TIME, SYS_YIELD,
};
pub use client::{call, recv, send, CallError, IpcSyscalls, RecvError, RetryPolicy, SendError};
