use derive_new::new;
use serde::{Deserialize, Serialize};

/// The memory type tag attached to every allocation and every task address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum MemoryType {
    /// Dynamic device memory, used for feature maps and model IO.
    Hbm,
    /// Task-scheduler side memory.
    Ts,
    Weight,
    Const,
    Absolute,
}

impl MemoryType {
    /// Feature maps and model IO share a tag, only the allocation table tells them apart.
    pub fn is_feature_map_like(&self) -> bool {
        matches!(self, MemoryType::Hbm)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum AllocationKind {
    Input,
    Output,
    FeatureMap,
    FixedFeatureMap,
    Absolute,
}

impl AllocationKind {
    pub fn is_model_io(&self) -> bool {
        matches!(self, AllocationKind::Input | AllocationKind::Output)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub u64);

impl std::fmt::Debug for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// A logical memory range produced by the memory planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct Allocation {
    pub id: AllocationId,
    pub logical_addr: u64,
    pub size: u64,
    pub kind: AllocationKind,
    pub memory_type: MemoryType,
}

impl Allocation {
    /// Saturates, an allocation reaching the end of the address space is still searchable.
    pub fn end(&self) -> u64 {
        self.logical_addr.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.logical_addr && addr < self.end()
    }

    pub fn range(&self) -> std::ops::Range<u64> {
        self.logical_addr..self.end()
    }
}

/// Attached by a task's parser to every input, output and workspace slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct AddressDescriptor {
    pub logical_addr: u64,
    pub memory_type: MemoryType,
    pub supports_refresh: bool,
}
