//! Address spaces and page mappings
//!
//! Each environment owns one [`AddressSpace`]: a pure map from page-aligned
//! virtual addresses to physical frame handles with a permission mask. The
//! fallible mapping primitive itself (`map_page`) lives on `KernelState`
//! because it draws bookkeeping frames from the state's finite pool.

use alloc::collections::BTreeMap;

use crate::types::{FrameId, PagePerm, VirtAddr};

/// A single installed mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Physical frame backing this page
    pub frame: FrameId,
    /// Access rights on this mapping
    pub perm: PagePerm,
}

/// Per-environment page mappings
#[derive(Default)]
pub struct AddressSpace {
    /// Installed mappings, keyed by page-aligned virtual address
    pub mappings: BTreeMap<VirtAddr, Mapping>,
}

impl AddressSpace {
    /// Create an empty address space
    pub fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }

    /// Look up the mapping at `va`, if any
    pub fn lookup(&self, va: VirtAddr) -> Option<&Mapping> {
        self.mappings.get(&va)
    }

    /// Whether `va` is currently mapped
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.mappings.contains_key(&va)
    }

    /// Install a mapping at `va`, replacing any existing one.
    ///
    /// Returns true if the address was previously unmapped (i.e. the
    /// install created a new entry rather than replacing one).
    pub fn install(&mut self, va: VirtAddr, mapping: Mapping) -> bool {
        self.mappings.insert(va, mapping).is_none()
    }

    /// Remove the mapping at `va`
    pub fn unmap(&mut self, va: VirtAddr) -> Option<Mapping> {
        self.mappings.remove(&va)
    }

    /// Number of installed mappings
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether no mappings are installed
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
