//! Kernel state - pure data structure holding all kernel state
//!
//! This module contains the KernelState struct which holds all mutable
//! kernel state. It has NO HAL dependency - all platform-specific behavior
//! is in the runtime wrapper (`vega-kernel`).

use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::vec::Vec;

use crate::mem::{AddressSpace, Mapping};
use crate::step::KernelError;
use crate::types::{
    Delivery, Env, EnvId, EnvMetrics, EnvState, FrameId, IpcState, PagePerm, SystemMetrics,
    VirtAddr,
};

/// Frames available to a freshly booted state when none are specified.
pub const DEFAULT_FRAME_POOL: usize = 1024;

/// The pure kernel state - no HAL, no I/O, no side effects.
///
/// All state transformations are done via the `step` function. The
/// rendezvous matcher mutates a receiver's control record only through the
/// single `&mut KernelState` borrow, which is what makes a match atomic
/// with respect to any other would-be sender.
pub struct KernelState {
    /// Environment table
    pub envs: BTreeMap<EnvId, Env>,
    /// Address spaces (per-environment)
    pub address_spaces: BTreeMap<EnvId, AddressSpace>,
    /// Next environment ID to allocate
    pub next_env_id: u64,
    /// Next physical frame handle to hand out
    pub next_frame_id: u64,
    /// Frames left for data pages and mapping bookkeeping
    pub free_frames: usize,
    /// Total IPC messages delivered since boot
    pub total_ipc_count: u64,
}

impl KernelState {
    /// Create a new empty kernel state with the default frame pool.
    pub fn new() -> Self {
        Self::with_frames(DEFAULT_FRAME_POOL)
    }

    /// Create a new empty kernel state with `frames` frames available.
    ///
    /// Tests use tiny pools to exercise the out-of-memory paths.
    pub fn with_frames(frames: usize) -> Self {
        Self {
            envs: BTreeMap::new(),
            address_spaces: BTreeMap::new(),
            next_env_id: 1,
            next_frame_id: 1,
            free_frames: frames,
            total_ipc_count: 0,
        }
    }

    /// Generate next environment ID
    pub fn alloc_env_id(&mut self) -> EnvId {
        let id = EnvId(self.next_env_id);
        self.next_env_id += 1;
        id
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Get environment info
    pub fn get_env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(&id)
    }

    /// Get mutable environment info
    pub fn get_env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs.get_mut(&id)
    }

    /// Get all environments
    pub fn list_envs(&self) -> Vec<(EnvId, &Env)> {
        self.envs.iter().map(|(&id, e)| (id, e)).collect()
    }

    /// Get the address space of an environment
    pub fn address_space(&self, id: EnvId) -> Option<&AddressSpace> {
        self.address_spaces.get(&id)
    }

    /// Get the mutable address space of an environment
    pub fn address_space_mut(&mut self, id: EnvId) -> Option<&mut AddressSpace> {
        self.address_spaces.get_mut(&id)
    }

    /// Environments currently parked in a posted receive
    pub fn blocked_receivers(&self) -> Vec<EnvId> {
        self.envs
            .values()
            .filter(|e| e.state == EnvState::BlockedOnReceive)
            .map(|e| e.id)
            .collect()
    }

    /// Check if an environment exists and is not being torn down
    pub fn env_exists(&self, id: EnvId) -> bool {
        self.envs
            .get(&id)
            .map(|e| e.state != EnvState::Dying)
            .unwrap_or(false)
    }

    /// Get system-wide metrics
    pub fn system_metrics(&self, uptime_ns: u64) -> SystemMetrics {
        SystemMetrics {
            env_count: self.envs.len(),
            blocked_on_receive: self.blocked_receivers().len(),
            free_frames: self.free_frames,
            total_ipc_messages: self.total_ipc_count,
            uptime_ns,
        }
    }

    // ========================================================================
    // State mutation helpers (pure - no side effects)
    // ========================================================================

    /// Register a new environment, returns its id.
    ///
    /// The control record starts neutral and the environment gets an empty
    /// address space.
    pub fn register_env(&mut self, name: &str, timestamp: u64) -> EnvId {
        let id = self.alloc_env_id();
        self.insert_env(id, name, timestamp);
        id
    }

    /// Register an environment with a specific id
    pub fn register_env_with_id(&mut self, id: EnvId, name: &str, timestamp: u64) -> EnvId {
        // Keep id allocation monotonic past explicit ids
        if id.0 >= self.next_env_id {
            self.next_env_id = id.0 + 1;
        }
        self.insert_env(id, name, timestamp);
        id
    }

    fn insert_env(&mut self, id: EnvId, name: &str, timestamp: u64) {
        let env = Env {
            id,
            name: name.to_string(),
            state: EnvState::Runnable,
            ipc: IpcState::default(),
            metrics: EnvMetrics {
                start_time_ns: timestamp,
                ..Default::default()
            },
        };
        self.envs.insert(id, env);
        self.address_spaces.insert(id, AddressSpace::new());
    }

    /// Mark an environment as dying (it stays in the table)
    pub fn mark_dying(&mut self, id: EnvId) -> bool {
        if let Some(env) = self.envs.get_mut(&id) {
            env.state = EnvState::Dying;
            true
        } else {
            false
        }
    }

    /// Remove an environment completely, refunding the bookkeeping frames
    /// its mappings held. Data frames may be shared with other address
    /// spaces and are not refcounted, so they stay allocated.
    pub fn destroy_env(&mut self, id: EnvId) -> bool {
        let env_removed = self.envs.remove(&id).is_some();
        let aspace_removed = match self.address_spaces.remove(&id) {
            Some(aspace) => {
                self.free_frames += aspace.len();
                true
            }
            None => false,
        };
        env_removed && aspace_removed
    }

    /// Allocate a fresh physical frame from the pool
    pub fn alloc_frame(&mut self) -> Option<FrameId> {
        if self.free_frames == 0 {
            return None;
        }
        self.free_frames -= 1;
        let frame = FrameId(self.next_frame_id);
        self.next_frame_id += 1;
        Some(frame)
    }

    /// Install a page mapping in `env`'s address space.
    ///
    /// This is the page-table mapping primitive: mapping a previously
    /// unmapped address consumes one bookkeeping frame from the pool and
    /// fails with `OutOfMemory` when the pool is empty, leaving the address
    /// space untouched. Remapping an already mapped address replaces the
    /// mapping at no frame cost.
    pub fn map_page(
        &mut self,
        env: EnvId,
        va: VirtAddr,
        frame: FrameId,
        perm: PagePerm,
    ) -> Result<(), KernelError> {
        if !va.is_page_aligned() || !va.is_user() {
            return Err(KernelError::InvalidArgument);
        }

        // Target check precedes the pool check: an unknown env is
        // BadTarget even when the pool happens to be empty
        let needs_frame = !self
            .address_spaces
            .get(&env)
            .ok_or(KernelError::BadTarget)?
            .contains(va);
        if needs_frame && self.free_frames == 0 {
            return Err(KernelError::OutOfMemory);
        }

        let aspace = self
            .address_spaces
            .get_mut(&env)
            .ok_or(KernelError::BadTarget)?;
        let created = aspace.install(va, Mapping { frame, perm });
        if created {
            self.free_frames -= 1;
        }
        Ok(())
    }

    /// Consume a delivered message, resetting the control record to
    /// neutral. Returns `None` if nothing has been delivered since the
    /// record was last reset.
    pub fn take_delivery(&mut self, id: EnvId) -> Option<Delivery> {
        let env = self.envs.get_mut(&id)?;
        if env.ipc.receiving {
            return None;
        }
        let from = env.ipc.from?;
        let delivery = Delivery {
            from,
            value: env.ipc.value,
            perm: env.ipc.perm,
        };
        env.ipc.reset();
        Some(delivery)
    }

    /// Update syscall metrics for an environment
    pub fn update_syscall_metrics(&mut self, id: EnvId, timestamp: u64) {
        if let Some(env) = self.envs.get_mut(&id) {
            env.metrics.syscall_count += 1;
            env.metrics.last_active_ns = timestamp;
        }
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}
