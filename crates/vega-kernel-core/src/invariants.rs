//! Runtime-checkable invariants for the rendezvous core
//!
//! This module contains invariants that should always hold between steps.
//! These are used for:
//! 1. Runtime assertion checking during development
//! 2. Property-based testing across random syscall sequences
//!
//! # Invariants
//!
//! 1. **Blocked/Receiving Consistency**: an environment is parked in
//!    `BlockedOnReceive` if and only if its receiving flag is raised
//! 2. **Address Space Consistency**: every environment has an address
//!    space and every address space has an environment
//! 3. **Grant Bounds**: a recorded grant never exceeds the grantable cap,
//!    and is empty whenever nothing has been delivered
//! 4. **Landing Address Validity**: a registered landing address is
//!    page-aligned and inside the user range
//! 5. **ID Monotonicity**: the next id is always greater than existing ids

use alloc::string::String;
use alloc::vec::Vec;

use crate::state::KernelState;
use crate::types::{EnvState, PagePerm};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_blocked_receiving_consistency(state));
    violations.extend(check_address_space_consistency(state));
    violations.extend(check_grant_bounds(state));
    violations.extend(check_landing_addresses(state));
    violations.extend(check_id_monotonicity(state));

    violations
}

/// Invariant 1: BlockedOnReceive <=> receiving flag raised
fn check_blocked_receiving_consistency(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, env) in &state.envs {
        let blocked = env.state == EnvState::BlockedOnReceive;
        if blocked != env.ipc.receiving {
            violations.push(InvariantViolation {
                invariant: "blocked_receiving_consistency",
                description: alloc::format!(
                    "Env {} is {:?} but its receiving flag is {}",
                    id.0,
                    env.state,
                    env.ipc.receiving
                ),
            });
        }
    }

    violations
}

/// Invariant 2: env table and address-space table agree
fn check_address_space_consistency(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for id in state.envs.keys() {
        if !state.address_spaces.contains_key(id) {
            violations.push(InvariantViolation {
                invariant: "address_space_consistency",
                description: alloc::format!("Env {} exists but has no address space", id.0),
            });
        }
    }

    for id in state.address_spaces.keys() {
        if !state.envs.contains_key(id) {
            violations.push(InvariantViolation {
                invariant: "address_space_consistency",
                description: alloc::format!(
                    "Address space exists for non-existent env {}",
                    id.0
                ),
            });
        }
    }

    violations
}

/// Invariant 3: recorded grants stay inside the cap; no grant without a
/// delivery
fn check_grant_bounds(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, env) in &state.envs {
        if !PagePerm::GRANT_MASK.contains(env.ipc.perm) {
            violations.push(InvariantViolation {
                invariant: "grant_bounds",
                description: alloc::format!(
                    "Env {} records grant {:#x} outside the grantable cap",
                    id.0,
                    env.ipc.perm.bits()
                ),
            });
        }
        if env.ipc.from.is_none() && !env.ipc.perm.is_empty() {
            violations.push(InvariantViolation {
                invariant: "grant_bounds",
                description: alloc::format!(
                    "Env {} records a grant with no delivered message",
                    id.0
                ),
            });
        }
    }

    violations
}

/// Invariant 4: registered landing addresses are well-formed
fn check_landing_addresses(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, env) in &state.envs {
        if let Some(va) = env.ipc.dst_va {
            if !va.is_page_aligned() || !va.is_user() {
                violations.push(InvariantViolation {
                    invariant: "landing_address_validity",
                    description: alloc::format!(
                        "Env {} registered malformed landing address {:#x}",
                        id.0,
                        va.0
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 5: next ids are always greater than existing ids
fn check_id_monotonicity(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for id in state.envs.keys() {
        if id.0 >= state.next_env_id {
            violations.push(InvariantViolation {
                invariant: "id_monotonicity",
                description: alloc::format!(
                    "Env {} exists but next_env_id is {}",
                    id.0,
                    state.next_env_id
                ),
            });
        }
    }

    for aspace in state.address_spaces.values() {
        for mapping in aspace.mappings.values() {
            if mapping.frame.0 >= state.next_frame_id {
                violations.push(InvariantViolation {
                    invariant: "id_monotonicity",
                    description: alloc::format!(
                        "Frame {} is mapped but next_frame_id is {}",
                        mapping.frame.0,
                        state.next_frame_id
                    ),
                });
            }
        }
    }

    violations
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(state: &KernelState) {
    let violations = check_all_invariants(state);
    if !violations.is_empty() {
        panic!("Invariant violated: {}", violations[0].invariant);
    }
}
