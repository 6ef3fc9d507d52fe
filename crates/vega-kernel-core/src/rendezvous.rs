//! The rendezvous matcher
//!
//! `try_deliver` is the atomic step that pairs one waiting receiver with
//! one sending attempt. It runs synchronously inside the sender's step:
//! state check, permission-checked page grant, control-record write and
//! wake form one unit of work under the single `&mut KernelState` borrow,
//! so two senders can never both observe "receiving" and both believe they
//! delivered.
//!
//! Ordering discipline: every fallible check happens before the first
//! mutation, and the page mapping (the one fallible mutation) happens
//! before the control-record write. A failed attempt therefore leaves the
//! receiver exactly as it was - still waiting.

use crate::state::KernelState;
use crate::step::KernelError;
use crate::types::{EnvId, EnvState, Message, PagePerm, PageTransfer};

/// Attempt one delivery of `msg` from `sender` to `target`.
///
/// On success the receiver's control record holds the message value, the
/// sender's identity and the granted permission, its receiving flag is
/// cleared and it is marked runnable. Returns the permission actually
/// granted (empty unless both sides opted into a page transfer).
///
/// # Errors
///
/// - `NotReceiving` - target is not currently blocked in a receive
///   (transient; no state change)
/// - `BadTarget` - target does not exist or is being torn down
/// - `InvalidArgument` - malformed or unmapped source address
/// - `InvalidPermission` - offer is malformed, exceeds the grantable set,
///   or asks for write on a read-only source mapping
/// - `OutOfMemory` - the receiver-side mapping could not be established;
///   the receiver stays waiting
pub fn try_deliver(
    state: &mut KernelState,
    sender: EnvId,
    target: EnvId,
    msg: Message,
) -> Result<PagePerm, KernelError> {
    // Target must exist, be live, and be parked in a receive.
    let dst_va = {
        let env = state.envs.get(&target).ok_or(KernelError::BadTarget)?;
        if env.state == EnvState::Dying {
            return Err(KernelError::BadTarget);
        }
        if !env.ipc.receiving {
            return Err(KernelError::NotReceiving);
        }
        env.ipc.dst_va
    };

    // Validate the page offer against the sender's own mapping. This runs
    // even when the receiver asked for no page: a malformed offer is a
    // caller bug, not something the receiver's choices can mask.
    let mut offered_frame = None;
    if let Some(PageTransfer { src_va, perm }) = msg.page {
        if !src_va.is_page_aligned() || !src_va.is_user() {
            return Err(KernelError::InvalidArgument);
        }
        if !perm.is_grantable() {
            return Err(KernelError::InvalidPermission);
        }
        let mapping = state
            .address_space(sender)
            .and_then(|aspace| aspace.lookup(src_va))
            .ok_or(KernelError::InvalidArgument)?;
        if perm.contains(PagePerm::WRITE) && !mapping.perm.contains(PagePerm::WRITE) {
            return Err(KernelError::InvalidPermission);
        }
        offered_frame = Some(mapping.frame);
    }

    // Page moves only when both sides opted in. The mapping is the last
    // fallible step: if it cannot be established the match aborts and the
    // receiver remains waiting.
    let mut granted = PagePerm::empty();
    if let (Some(frame), Some(dst), Some(transfer)) = (offered_frame, dst_va, msg.page) {
        let narrowed = transfer.perm & PagePerm::GRANT_MASK;
        state.map_page(target, dst, frame, narrowed)?;
        granted = narrowed;
    }

    // Point of no return: write the control record, clear the receiving
    // flag and wake the receiver in one go.
    if let Some(env) = state.envs.get_mut(&target) {
        env.ipc.value = msg.value;
        env.ipc.from = Some(sender);
        env.ipc.perm = granted;
        env.ipc.receiving = false;
        env.state = EnvState::Runnable;
        env.metrics.ipc_received += 1;
    }
    if let Some(env) = state.envs.get_mut(&sender) {
        env.metrics.ipc_sent += 1;
    }
    state.total_ipc_count += 1;

    Ok(granted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{step, Syscall, SyscallResult};
    use crate::types::{VirtAddr, PAGE_SIZE, USER_TOP};
    use proptest::prelude::*;

    const RU: PagePerm = PagePerm::REQUIRED;

    fn msg(value: u32, page: Option<PageTransfer>) -> Message {
        Message { value, page }
    }

    /// Receiver at `dst`, sender with a page mapped at src VirtAddr(0).
    fn rendezvous_fixture(dst: Option<VirtAddr>, src_perm: PagePerm) -> (KernelState, EnvId, EnvId) {
        let mut state = KernelState::new();
        let tx = state.register_env("tx", 0);
        let rx = state.register_env("rx", 0);

        let frame = state.alloc_frame().unwrap();
        state.map_page(tx, VirtAddr(0), frame, src_perm).unwrap();

        let r = step(&mut state, rx, Syscall::IpcRecv { dst_va: dst }, 1);
        assert_eq!(r.result, SyscallResult::Blocked);
        (state, tx, rx)
    }

    #[test]
    fn test_round_trip_no_page() {
        let (mut state, tx, rx) = rendezvous_fixture(None, PagePerm::GRANT_MASK);

        let granted = try_deliver(&mut state, tx, rx, msg(0x1234, None)).unwrap();
        assert_eq!(granted, PagePerm::empty());

        let delivery = state.take_delivery(rx).unwrap();
        assert_eq!(delivery.from, tx);
        assert_eq!(delivery.value, 0x1234);
        assert_eq!(delivery.perm, PagePerm::empty());
        assert_eq!(state.get_env(rx).unwrap().state, EnvState::Runnable);
    }

    #[test]
    fn test_not_receiving_is_side_effect_free() {
        let mut state = KernelState::new();
        let tx = state.register_env("tx", 0);
        let rx = state.register_env("rx", 0);

        let err = try_deliver(&mut state, tx, rx, msg(1, None)).unwrap_err();
        assert_eq!(err, KernelError::NotReceiving);

        let env = state.get_env(rx).unwrap();
        assert_eq!(env.ipc.from, None);
        assert_eq!(env.metrics.ipc_received, 0);
        assert_eq!(state.total_ipc_count, 0);
    }

    #[test]
    fn test_bad_target() {
        let mut state = KernelState::new();
        let tx = state.register_env("tx", 0);

        assert_eq!(
            try_deliver(&mut state, tx, EnvId(42), msg(1, None)),
            Err(KernelError::BadTarget)
        );

        // A dying target is as good as gone
        let rx = state.register_env("rx", 0);
        step(&mut state, rx, Syscall::IpcRecv { dst_va: None }, 1);
        state.mark_dying(rx);
        assert_eq!(
            try_deliver(&mut state, tx, rx, msg(1, None)),
            Err(KernelError::BadTarget)
        );
    }

    #[test]
    fn test_exclusive_winner() {
        let (mut state, tx1, rx) = rendezvous_fixture(None, PagePerm::GRANT_MASK);
        let tx2 = state.register_env("tx2", 0);

        // First sender wins the match...
        assert!(try_deliver(&mut state, tx1, rx, msg(111, None)).is_ok());
        // ...and the second attempt against the same receiver is transient
        assert_eq!(
            try_deliver(&mut state, tx2, rx, msg(222, None)),
            Err(KernelError::NotReceiving)
        );

        // The record reflects only the winner
        let delivery = state.take_delivery(rx).unwrap();
        assert_eq!(delivery.from, tx1);
        assert_eq!(delivery.value, 111);
    }

    #[test]
    fn test_page_transfer_maps_and_narrows() {
        let dst = VirtAddr(4 * PAGE_SIZE);
        let (mut state, tx, rx) = rendezvous_fixture(Some(dst), PagePerm::GRANT_MASK);

        let offer = PageTransfer {
            src_va: VirtAddr(0),
            perm: RU | PagePerm::WRITE,
        };
        let granted = try_deliver(&mut state, tx, rx, msg(5, Some(offer))).unwrap();
        assert_eq!(granted, RU | PagePerm::WRITE);

        // Receiver now shares the sender's frame at its chosen address
        let tx_frame = state.address_space(tx).unwrap().lookup(VirtAddr(0)).unwrap().frame;
        let mapping = *state.address_space(rx).unwrap().lookup(dst).unwrap();
        assert_eq!(mapping.frame, tx_frame);
        assert_eq!(mapping.perm, granted);

        assert_eq!(state.take_delivery(rx).unwrap().perm, granted);
    }

    #[test]
    fn test_no_accidental_mapping_when_receiver_declined() {
        // Receiver asked for no page; sender offers one anyway
        let (mut state, tx, rx) = rendezvous_fixture(None, PagePerm::GRANT_MASK);

        let offer = PageTransfer {
            src_va: VirtAddr(0),
            perm: RU | PagePerm::WRITE,
        };
        let granted = try_deliver(&mut state, tx, rx, msg(5, Some(offer))).unwrap();
        assert_eq!(granted, PagePerm::empty());

        // Verified via absence of the mapping, not just the reported perm
        assert!(state.address_space(rx).unwrap().is_empty());
        assert_eq!(state.take_delivery(rx).unwrap().perm, PagePerm::empty());
    }

    #[test]
    fn test_malformed_offer_rejected_even_without_landing_address() {
        let (mut state, tx, rx) = rendezvous_fixture(None, PagePerm::GRANT_MASK);

        // Missing the required READ|USER bits
        let offer = PageTransfer {
            src_va: VirtAddr(0),
            perm: PagePerm::WRITE,
        };
        assert_eq!(
            try_deliver(&mut state, tx, rx, msg(1, Some(offer))),
            Err(KernelError::InvalidPermission)
        );
        // Receiver still waiting
        assert!(state.get_env(rx).unwrap().ipc.receiving);
    }

    #[test]
    fn test_write_offer_on_read_only_source() {
        let dst = VirtAddr(PAGE_SIZE);
        let (mut state, tx, rx) = rendezvous_fixture(Some(dst), RU);

        let offer = PageTransfer {
            src_va: VirtAddr(0),
            perm: RU | PagePerm::WRITE,
        };
        assert_eq!(
            try_deliver(&mut state, tx, rx, msg(1, Some(offer))),
            Err(KernelError::InvalidPermission)
        );
        assert!(state.address_space(rx).unwrap().is_empty());
    }

    #[test]
    fn test_unmapped_or_bad_source() {
        let dst = VirtAddr(PAGE_SIZE);
        let (mut state, tx, rx) = rendezvous_fixture(Some(dst), PagePerm::GRANT_MASK);

        // Nothing mapped at this source address
        let unmapped = PageTransfer {
            src_va: VirtAddr(8 * PAGE_SIZE),
            perm: RU,
        };
        assert_eq!(
            try_deliver(&mut state, tx, rx, msg(1, Some(unmapped))),
            Err(KernelError::InvalidArgument)
        );

        // Unaligned and out-of-range sources
        for bad in [VirtAddr(5), VirtAddr(USER_TOP)] {
            let offer = PageTransfer {
                src_va: bad,
                perm: RU,
            };
            assert_eq!(
                try_deliver(&mut state, tx, rx, msg(1, Some(offer))),
                Err(KernelError::InvalidArgument)
            );
        }
        assert!(state.get_env(rx).unwrap().ipc.receiving);
    }

    #[test]
    fn test_out_of_memory_leaves_receiver_waiting() {
        let mut state = KernelState::with_frames(2);
        let tx = state.register_env("tx", 0);
        let rx = state.register_env("rx", 0);

        let frame = state.alloc_frame().unwrap();
        state
            .map_page(tx, VirtAddr(0), frame, PagePerm::GRANT_MASK)
            .unwrap();
        // Pool is now empty: the receiver-side mapping cannot be installed
        assert_eq!(state.free_frames, 0);

        let dst = VirtAddr(PAGE_SIZE);
        step(&mut state, rx, Syscall::IpcRecv { dst_va: Some(dst) }, 1);

        let offer = PageTransfer {
            src_va: VirtAddr(0),
            perm: RU,
        };
        assert_eq!(
            try_deliver(&mut state, tx, rx, msg(1, Some(offer))),
            Err(KernelError::OutOfMemory)
        );

        let env = state.get_env(rx).unwrap();
        assert!(env.ipc.receiving);
        assert_eq!(env.state, EnvState::BlockedOnReceive);
        assert_eq!(env.ipc.from, None);
        assert!(state.address_space(rx).unwrap().is_empty());
    }

    #[test]
    fn test_retry_convergence() {
        let mut state = KernelState::new();
        let tx = state.register_env("tx", 0);
        let rx = state.register_env("rx", 0);

        // Attempts before any receive is posted fail transiently
        for _ in 0..3 {
            assert_eq!(
                try_deliver(&mut state, tx, rx, msg(0xBEEF, None)),
                Err(KernelError::NotReceiving)
            );
        }

        // Once the receive is posted, the next attempt lands with no side
        // effects left over from the failed ones
        step(&mut state, rx, Syscall::IpcRecv { dst_va: None }, 1);
        assert!(try_deliver(&mut state, tx, rx, msg(0xBEEF, None)).is_ok());

        assert_eq!(state.total_ipc_count, 1);
        assert_eq!(state.get_env(tx).unwrap().metrics.ipc_sent, 1);
        assert_eq!(state.take_delivery(rx).unwrap().value, 0xBEEF);
    }

    #[test]
    fn test_metrics_updated_on_delivery() {
        let (mut state, tx, rx) = rendezvous_fixture(None, PagePerm::GRANT_MASK);

        try_deliver(&mut state, tx, rx, msg(1, None)).unwrap();
        assert_eq!(state.get_env(tx).unwrap().metrics.ipc_sent, 1);
        assert_eq!(state.get_env(rx).unwrap().metrics.ipc_received, 1);
        assert_eq!(state.total_ipc_count, 1);
    }

    // ========================================================================
    // Property tests
    // ========================================================================

    fn arb_perm() -> impl Strategy<Value = PagePerm> {
        (0u32..8).prop_map(PagePerm::from_bits_truncate)
    }

    proptest! {
        /// Whatever the offer, a granted permission never exceeds it and
        /// never exceeds the grantable cap.
        #[test]
        fn granted_perm_is_narrowed(offer in arb_perm(), want_page in any::<bool>()) {
            let dst = want_page.then_some(VirtAddr(PAGE_SIZE));
            let (mut state, tx, rx) = rendezvous_fixture(dst, PagePerm::GRANT_MASK);

            let transfer = PageTransfer { src_va: VirtAddr(0), perm: offer };
            match try_deliver(&mut state, tx, rx, msg(7, Some(transfer))) {
                Ok(granted) => {
                    prop_assert!(offer.contains(granted));
                    prop_assert!(PagePerm::GRANT_MASK.contains(granted));
                    if !want_page {
                        prop_assert_eq!(granted, PagePerm::empty());
                        prop_assert!(state.address_space(rx).unwrap().is_empty());
                    }
                }
                Err(e) => {
                    // Only a malformed offer can fail here, and it must
                    // leave the receiver waiting.
                    prop_assert_eq!(e, KernelError::InvalidPermission);
                    prop_assert!(!offer.is_grantable());
                    prop_assert!(state.get_env(rx).unwrap().ipc.receiving);
                }
            }
        }

        /// A delivered value survives the rendezvous bit-for-bit.
        #[test]
        fn value_round_trips(value in any::<u32>()) {
            let (mut state, tx, rx) = rendezvous_fixture(None, PagePerm::GRANT_MASK);
            try_deliver(&mut state, tx, rx, msg(value, None)).unwrap();
            prop_assert_eq!(state.take_delivery(rx).unwrap().value, value);
        }
    }
}
