//! User-side send and receive helpers
//!
//! The kernel's send is deliberately non-blocking: one attempt, one
//! answer. The convenience environments actually want is "send this and
//! keep trying until it lands", which is what [`send`] provides: it spins
//! on the transient not-receiving failure with a yield between attempts so
//! the receiver gets scheduled, and surfaces every other failure
//! immediately as fatal.
//!
//! [`call`] composes the two into the request/reply round trip that
//! service clients are built on.
//!
//! Syscall access goes through the [`IpcSyscalls`] trait so the same loop
//! runs against the real syscall layer or a scripted stand-in in tests.

use core::num::NonZeroU64;

use thiserror::Error;
use vega_kernel_core::{Delivery, EnvId, KernelError, Message, PagePerm, VirtAddr};

/// The raw IPC syscalls as seen from an environment.
pub trait IpcSyscalls {
    /// One non-blocking delivery attempt. Returns the permission actually
    /// granted on success.
    fn ipc_try_send(&mut self, target: EnvId, msg: Message) -> Result<PagePerm, KernelError>;

    /// Post a receive and block until a sender matches it.
    fn ipc_recv(&mut self, dst_va: Option<VirtAddr>) -> Result<Delivery, KernelError>;

    /// Give up the rest of this slice so other environments can run.
    fn yield_now(&mut self);
}

/// How long [`send`] keeps retrying a transient failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before giving up; `None` retries forever. The
    /// default is unbounded: a missing receiver is expected to post
    /// eventually, and the yield keeps the loop from starving it.
    pub max_attempts: Option<NonZeroU64>,
}

impl RetryPolicy {
    /// Retry until delivery or a fatal error.
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// Give up after `max_attempts` tries.
    pub fn bounded(max_attempts: NonZeroU64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }
}

/// Why a [`send`] gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The kernel rejected the send for a non-transient reason. Retrying
    /// would fail identically, so the loop stops at the first occurrence.
    #[error("send to env {} failed: {err:?}", target.0)]
    Fatal { target: EnvId, err: KernelError },

    /// A bounded policy ran out of attempts while the target still had no
    /// receive posted.
    #[error("send to env {} gave up after {attempts} attempts", target.0)]
    AttemptsExhausted { target: EnvId, attempts: u64 },
}

/// A failed receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("receive failed: {err:?}")]
pub struct RecvError {
    /// The kernel's reason
    pub err: KernelError,
}

/// A failed request/reply round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CallError {
    /// The request never landed
    #[error(transparent)]
    Send(#[from] SendError),
    /// The request landed but the reply receive failed
    #[error(transparent)]
    Recv(#[from] RecvError),
}

/// Deliver `msg` to `target`, retrying with a yield while the target has
/// no receive posted. Returns the number of attempts the delivery took.
pub fn send<S: IpcSyscalls>(
    sys: &mut S,
    target: EnvId,
    msg: Message,
    policy: RetryPolicy,
) -> Result<u64, SendError> {
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match sys.ipc_try_send(target, msg) {
            Ok(_granted) => return Ok(attempts),
            Err(err) if err.is_transient() => {
                if let Some(max) = policy.max_attempts {
                    if attempts >= max.get() {
                        return Err(SendError::AttemptsExhausted { target, attempts });
                    }
                }
                log::trace!(
                    "send to env {} attempt {} missed, yielding",
                    target.0,
                    attempts
                );
                sys.yield_now();
            }
            Err(err) => {
                log::warn!("send to env {} failed: {:?}", target.0, err);
                return Err(SendError::Fatal { target, err });
            }
        }
    }
}

/// Post a receive and block until a message arrives.
pub fn recv<S: IpcSyscalls>(sys: &mut S, dst_va: Option<VirtAddr>) -> Result<Delivery, RecvError> {
    sys.ipc_recv(dst_va).map_err(|err| RecvError { err })
}

/// One request/reply round trip: deliver `msg` to `target` under `policy`,
/// then block in a receive for the reply. `reply_dst` is the landing
/// address to use if the reply may carry a page.
///
/// This is the shape a service client actually wants: every request is a
/// send immediately followed by a receive, so the caller is already parked
/// when the service turns the request around.
pub fn call<S: IpcSyscalls>(
    sys: &mut S,
    target: EnvId,
    msg: Message,
    reply_dst: Option<VirtAddr>,
    policy: RetryPolicy,
) -> Result<Delivery, CallError> {
    send(sys, target, msg, policy)?;
    Ok(recv(sys, reply_dst)?)
}
