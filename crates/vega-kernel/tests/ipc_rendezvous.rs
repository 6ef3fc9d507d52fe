//! End-to-end rendezvous tests
//!
//! Drives full send/receive interactions through the scheduler and checks
//! the observable outcomes: delivered values, granted permissions, shared
//! frames, the commit log and metrics.

use std::cell::RefCell;
use std::rc::Rc;

use vega_kernel::{
    Action, CommitType, Delivery, EnvId, EnvProgram, Event, Kernel, KernelError, PagePerm,
    PageTransfer, Syscall, SyscallResult, VirtAddr, PAGE_SIZE,
};

/// Posts one receive and records the delivery.
struct Receiver {
    dst_va: Option<VirtAddr>,
    got: Rc<RefCell<Option<Delivery>>>,
}

impl Receiver {
    fn new(dst_va: Option<VirtAddr>) -> Self {
        Self {
            dst_va,
            got: Rc::new(RefCell::new(None)),
        }
    }
}

impl EnvProgram for Receiver {
    fn resume(&mut self, event: Event) -> Action {
        match event {
            Event::Started => Action::Syscall(Syscall::IpcRecv { dst_va: self.dst_va }),
            Event::Delivered(d) => {
                *self.got.borrow_mut() = Some(d);
                Action::Halt
            }
            Event::Returned(_) => Action::Halt,
        }
    }
}

/// Retries the send with a yield in between until the result is anything
/// other than the transient not-receiving failure.
struct Sender {
    target: EnvId,
    value: u32,
    page: Option<PageTransfer>,
    yielding: bool,
    attempts: Rc<RefCell<u32>>,
    result: Rc<RefCell<Option<SyscallResult>>>,
}

impl Sender {
    fn new(target: EnvId, value: u32, page: Option<PageTransfer>) -> Self {
        Self {
            target,
            value,
            page,
            yielding: false,
            attempts: Rc::new(RefCell::new(0)),
            result: Rc::new(RefCell::new(None)),
        }
    }

    fn send(&mut self) -> Action {
        *self.attempts.borrow_mut() += 1;
        self.yielding = false;
        Action::Syscall(Syscall::IpcTrySend {
            target: self.target,
            value: self.value,
            page: self.page,
        })
    }
}

impl EnvProgram for Sender {
    fn resume(&mut self, event: Event) -> Action {
        match event {
            Event::Started => self.send(),
            Event::Returned(_) if self.yielding => self.send(),
            Event::Returned(SyscallResult::Err(e)) if e.is_transient() => {
                self.yielding = true;
                Action::Syscall(Syscall::Yield)
            }
            Event::Returned(r) => {
                *self.result.borrow_mut() = Some(r);
                Action::Halt
            }
            Event::Delivered(_) => Action::Halt,
        }
    }
}

#[test]
fn round_trip_and_commit_log_order() {
    let mut kernel = Kernel::new();

    let receiver = Receiver::new(None);
    let got = Rc::clone(&receiver.got);
    let rx = kernel.spawn("rx", Box::new(receiver));

    let sender = Sender::new(rx, 0x1234, None);
    let result = Rc::clone(&sender.result);
    let tx = kernel.spawn("tx", Box::new(sender));

    kernel.run_until_idle(100);

    let delivery = got.borrow().unwrap();
    assert_eq!(delivery.from, tx);
    assert_eq!(delivery.value, 0x1234);
    assert_eq!(delivery.perm, PagePerm::empty());
    assert_eq!(*result.borrow(), Some(SyscallResult::Ok(0)));

    // The receive was posted before the delivery that matched it
    let posted = kernel
        .commits()
        .iter()
        .position(|c| matches!(c.commit_type, CommitType::ReceivePosted { env } if env == rx.0));
    let delivered = kernel
        .commits()
        .iter()
        .position(|c| matches!(c.commit_type, CommitType::IpcDelivered { .. }));
    assert!(posted.unwrap() < delivered.unwrap());

    // Exactly one rendezvous happened
    let deliveries = kernel
        .commits()
        .iter()
        .filter(|c| matches!(c.commit_type, CommitType::IpcDelivered { .. }))
        .count();
    assert_eq!(deliveries, 1);
    assert_eq!(kernel.metrics().total_ipc_messages, 1);
}

#[test]
fn sender_scheduled_first_converges_by_retrying() {
    let mut kernel = Kernel::new();

    // Sender targets the id the receiver will get, and runs first
    let sender = Sender::new(EnvId(2), 99, None);
    let attempts = Rc::clone(&sender.attempts);
    let result = Rc::clone(&sender.result);
    kernel.spawn("tx", Box::new(sender));

    let receiver = Receiver::new(None);
    let got = Rc::clone(&receiver.got);
    kernel.spawn("rx", Box::new(receiver));

    kernel.run_until_idle(100);

    assert!(*attempts.borrow() >= 2, "first attempt should have missed");
    assert_eq!(*result.borrow(), Some(SyscallResult::Ok(0)));
    assert_eq!(got.borrow().unwrap().value, 99);
}

#[test]
fn competing_senders_each_match_one_receive() {
    let mut kernel = Kernel::new();

    let receiver = Receiver::new(None);
    let got = Rc::clone(&receiver.got);
    let rx = kernel.spawn("rx", Box::new(receiver));

    let s1 = Sender::new(rx, 111, None);
    let s2 = Sender::new(rx, 222, None);
    let r1 = Rc::clone(&s1.result);
    let r2 = Rc::clone(&s2.result);
    kernel.spawn("tx1", Box::new(s1));
    kernel.spawn("tx2", Box::new(s2));

    // One receive is posted. Exactly one sender wins it; the other keeps
    // retrying until the slice budget runs out.
    kernel.run_until_idle(50);

    let delivered = got.borrow().unwrap().value;
    assert!(delivered == 111 || delivered == 222);

    let wins = [*r1.borrow(), *r2.borrow()]
        .iter()
        .filter(|r| **r == Some(SyscallResult::Ok(0)))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(kernel.metrics().total_ipc_messages, 1);
}

#[test]
fn page_transfer_shares_frame_with_narrowed_grant() {
    let mut kernel = Kernel::new();

    let dst = VirtAddr(16 * PAGE_SIZE);
    let receiver = Receiver::new(Some(dst));
    let got = Rc::clone(&receiver.got);
    let rx = kernel.spawn("rx", Box::new(receiver));

    let offer = PageTransfer {
        src_va: VirtAddr(0),
        perm: PagePerm::GRANT_MASK,
    };
    let tx = kernel.spawn("tx", Box::new(Sender::new(rx, 5, Some(offer))));
    let frame = kernel
        .seed_page(tx, VirtAddr(0), PagePerm::GRANT_MASK)
        .unwrap();

    kernel.run_until_idle(100);

    // Full offer stays inside the cap, so everything offered arrives
    let delivery = got.borrow().unwrap();
    assert_eq!(delivery.perm, PagePerm::GRANT_MASK);

    let rx_mapping = *kernel
        .state()
        .address_space(rx)
        .unwrap()
        .lookup(dst)
        .unwrap();
    assert_eq!(rx_mapping.frame, frame);

    // Sender's own mapping is untouched
    let tx_mapping = *kernel
        .state()
        .address_space(tx)
        .unwrap()
        .lookup(VirtAddr(0))
        .unwrap();
    assert_eq!(tx_mapping.frame, frame);
}

#[test]
fn receiver_that_declines_gets_value_but_no_page() {
    let mut kernel = Kernel::new();

    let receiver = Receiver::new(None);
    let got = Rc::clone(&receiver.got);
    let rx = kernel.spawn("rx", Box::new(receiver));

    let offer = PageTransfer {
        src_va: VirtAddr(0),
        perm: PagePerm::REQUIRED,
    };
    let tx = kernel.spawn("tx", Box::new(Sender::new(rx, 8, Some(offer))));
    kernel.seed_page(tx, VirtAddr(0), PagePerm::GRANT_MASK).unwrap();

    kernel.run_until_idle(100);

    let delivery = got.borrow().unwrap();
    assert_eq!(delivery.value, 8);
    assert_eq!(delivery.perm, PagePerm::empty());
    assert!(kernel.state().address_space(rx).unwrap().is_empty());
}

#[test]
fn write_offer_on_read_only_source_is_fatal() {
    let mut kernel = Kernel::new();

    let dst = VirtAddr(4 * PAGE_SIZE);
    let rx = kernel.spawn("rx", Box::new(Receiver::new(Some(dst))));

    let offer = PageTransfer {
        src_va: VirtAddr(0),
        perm: PagePerm::GRANT_MASK,
    };
    let sender = Sender::new(rx, 1, Some(offer));
    let attempts = Rc::clone(&sender.attempts);
    let result = Rc::clone(&sender.result);
    let tx = kernel.spawn("tx", Box::new(sender));
    // Source page is mapped read-only, so the write offer cannot be honored
    kernel.seed_page(tx, VirtAddr(0), PagePerm::REQUIRED).unwrap();

    kernel.run_until_idle(100);

    assert_eq!(*attempts.borrow(), 1, "fatal errors must not be retried");
    assert_eq!(
        *result.borrow(),
        Some(SyscallResult::Err(KernelError::InvalidPermission))
    );

    // Receiver is still parked waiting for a valid sender
    assert!(kernel.state().get_env(rx).unwrap().ipc.receiving);
}

#[test]
fn metrics_track_both_sides_of_a_match() {
    let mut kernel = Kernel::new();

    let rx = kernel.spawn("rx", Box::new(Receiver::new(None)));
    let tx = kernel.spawn("tx", Box::new(Sender::new(rx, 3, None)));

    kernel.run_until_idle(100);

    let state = kernel.state();
    assert_eq!(state.get_env(tx).unwrap().metrics.ipc_sent, 1);
    assert_eq!(state.get_env(rx).unwrap().metrics.ipc_received, 1);
    assert_eq!(state.total_ipc_count, 1);
}
