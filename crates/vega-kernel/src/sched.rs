//! Cooperative round-robin scheduler
//!
//! Environments are driven as [`EnvProgram`]s: small state machines that
//! the scheduler resumes with an [`Event`] and that answer with the next
//! [`Action`]. One slice resumes one program, executes the syscall it asks
//! for through the pure `step` function, and requeues or parks the
//! environment depending on the result.
//!
//! A parked receiver is never requeued directly. It re-enters the run
//! queue only after a sender's step completes the rendezvous, at which
//! point the scheduler consumes the delivery from its control record and
//! resumes the program with `Event::Delivered`.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use vega_kernel_core::{
    step, Commit, CommitType, Delivery, EnvId, EnvState, FrameId, KernelError, KernelState,
    PagePerm, StepResult, Syscall, SyscallResult, SystemMetrics, VirtAddr,
};

/// Nanoseconds charged to the clock per scheduling slice.
pub const TIME_SLICE_NS: u64 = 1_000;

/// What an environment program is resumed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// First resumption after spawn
    Started,
    /// The previous syscall completed with this result
    Returned(SyscallResult),
    /// A sender matched this environment's posted receive
    Delivered(Delivery),
}

/// What an environment program wants next.
#[derive(Clone, Copy, Debug)]
pub enum Action {
    /// Execute a syscall and resume me with the result
    Syscall(Syscall),
    /// Done; exit cleanly
    Halt,
}

/// A scheduled environment body. Implementations hold whatever program
/// state they need between resumptions.
pub trait EnvProgram {
    /// Advance the program one step in response to `event`.
    fn resume(&mut self, event: Event) -> Action;
}

/// The runtime kernel: core state plus scheduling and the commit log.
pub struct Kernel {
    state: KernelState,
    programs: BTreeMap<EnvId, Box<dyn EnvProgram>>,
    /// Event each queued environment will be resumed with
    pending: BTreeMap<EnvId, Event>,
    run_queue: VecDeque<EnvId>,
    commits: Vec<Commit>,
    next_seq: u64,
    clock_ns: u64,
}

impl Kernel {
    /// Boot an empty kernel. The commit log starts with a genesis record.
    pub fn new() -> Self {
        let mut kernel = Self {
            state: KernelState::new(),
            programs: BTreeMap::new(),
            pending: BTreeMap::new(),
            run_queue: VecDeque::new(),
            commits: Vec::new(),
            next_seq: 0,
            clock_ns: 0,
        };
        kernel.append(vec![Commit::new(CommitType::Genesis, 0)]);
        kernel
    }

    /// Register an environment and queue it for its first slice.
    pub fn spawn(&mut self, name: &str, program: Box<dyn EnvProgram>) -> EnvId {
        let id = self.state.register_env(name, self.clock_ns);
        self.append(vec![Commit::new(
            CommitType::EnvRegistered {
                env: id.0,
                name: String::from(name),
            },
            self.clock_ns,
        )]);
        self.programs.insert(id, program);
        self.pending.insert(id, Event::Started);
        self.run_queue.push_back(id);
        log::debug!("spawned env {} ({})", id.0, name);
        id
    }

    /// Map a fresh frame into `env` at `va`. Used when setting an
    /// environment up with pages it can later offer over IPC.
    pub fn seed_page(
        &mut self,
        env: EnvId,
        va: VirtAddr,
        perm: PagePerm,
    ) -> Result<FrameId, KernelError> {
        let frame = self.state.alloc_frame().ok_or(KernelError::OutOfMemory)?;
        self.state.map_page(env, va, frame, perm)?;
        Ok(frame)
    }

    /// Read-only view of the core state
    pub fn state(&self) -> &KernelState {
        &self.state
    }

    /// The commit log so far, in sequence order
    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    /// Nanoseconds of scheduled time since boot
    pub fn clock_ns(&self) -> u64 {
        self.clock_ns
    }

    /// System-wide metrics snapshot
    pub fn metrics(&self) -> SystemMetrics {
        self.state.system_metrics(self.clock_ns)
    }

    /// Run one scheduling slice. Returns `false` when the run queue is
    /// empty and there is nothing to do.
    pub fn run_slice(&mut self) -> bool {
        let id = match self.run_queue.pop_front() {
            Some(id) => id,
            None => return false,
        };
        self.clock_ns += TIME_SLICE_NS;

        // Queue entries can go stale if the environment died meanwhile
        if !self.state.env_exists(id) {
            self.programs.remove(&id);
            self.pending.remove(&id);
            return true;
        }
        let event = match self.pending.remove(&id) {
            Some(e) => e,
            None => return true,
        };

        if let Some(env) = self.state.get_env_mut(id) {
            env.state = EnvState::Running;
        }
        let action = match self.programs.get_mut(&id) {
            Some(program) => program.resume(event),
            None => return true,
        };

        match action {
            Action::Syscall(syscall) => {
                log::trace!("env {} syscall {:?}", id.0, syscall);
                let StepResult { result, commits } = step(&mut self.state, id, syscall, self.clock_ns);
                self.append(commits);

                match self.state.get_env(id).map(|e| e.state) {
                    Some(EnvState::Dying) => {
                        log::debug!("env {} exited", id.0);
                        self.programs.remove(&id);
                    }
                    // Parked; woken only by a completed match
                    Some(EnvState::BlockedOnReceive) => {}
                    _ => {
                        if let Some(env) = self.state.get_env_mut(id) {
                            env.state = EnvState::Runnable;
                        }
                        self.pending.insert(id, Event::Returned(result));
                        self.run_queue.push_back(id);
                    }
                }
            }
            Action::Halt => {
                let StepResult { commits, .. } =
                    step(&mut self.state, id, Syscall::Exit { code: 0 }, self.clock_ns);
                self.append(commits);
                log::debug!("env {} halted", id.0);
                self.programs.remove(&id);
            }
        }

        self.wake_matched();
        true
    }

    /// Run slices until the queue drains or `max_slices` is spent.
    /// Returns the number of slices executed.
    pub fn run_until_idle(&mut self, max_slices: usize) -> usize {
        let mut slices = 0;
        while slices < max_slices {
            if !self.run_slice() {
                return slices;
            }
            slices += 1;
        }
        if !self.run_queue.is_empty() {
            log::warn!(
                "slice budget exhausted with {} envs still queued",
                self.run_queue.len()
            );
        }
        slices
    }

    /// Requeue receivers whose posted receive was matched this slice. The
    /// delivery is consumed from the control record here and travels to the
    /// program as an event.
    fn wake_matched(&mut self) {
        let woken: Vec<EnvId> = self
            .state
            .envs
            .iter()
            .filter(|(_, env)| {
                env.state == EnvState::Runnable && !env.ipc.receiving && env.ipc.from.is_some()
            })
            .map(|(&id, _)| id)
            .collect();

        for id in woken {
            if let Some(delivery) = self.state.take_delivery(id) {
                log::trace!(
                    "env {} woken by delivery from env {}",
                    id.0,
                    delivery.from.0
                );
                self.pending.insert(id, Event::Delivered(delivery));
                self.run_queue.push_back(id);
            }
        }
    }

    /// Append commits, assigning log sequence numbers.
    fn append(&mut self, commits: Vec<Commit>) {
        for mut commit in commits {
            commit.seq = self.next_seq;
            self.next_seq += 1;
            self.commits.push(commit);
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
