use std::ops::Range;

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::{Allocation, AllocationId, AllocationKind};

/// Whether a tensor tolerates its physical pages moving under a stable virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum RemapPolicy {
    Support,
    /// Supported only if the whole tensor moves at once.
    ConditionalSupport,
    NoSupport,
}

/// A tensor living at `offset` inside the allocation in `row`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct TensorOccupancy {
    pub row: usize,
    pub offset: u64,
    pub size: u64,
    pub policy: RemapPolicy,
}

impl TensorOccupancy {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum_macros::Display)]
pub enum RemapResult {
    Supported,
    NotSupported,
    Unknown,
}

/// The part of one allocation the remapped range covers, in active addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, new)]
pub struct OverlapRange {
    pub alloc_id: AllocationId,
    pub range: Range<u64>,
    /// Absolute allocations end the scan and are left to the caller.
    pub absolute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RemapReport {
    pub result: RemapResult,
    pub overlaps: Vec<OverlapRange>,
}

/// Tensor occupancy per allocation row, sorted by offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapIndex {
    rows: Vec<Vec<TensorOccupancy>>,
}

impl RemapIndex {
    /// Tensors of rows beyond `num_rows` are dropped.
    pub fn new(num_rows: usize, tensors: &[TensorOccupancy]) -> Self {
        let mut rows = vec![Vec::new(); num_rows];
        for tensor in tensors {
            match rows.get_mut(tensor.row) {
                Some(row) => row.push(*tensor),
                None => log::warn!("Tensor {:?} references an unknown allocation", tensor),
            }
        }
        for row in rows.iter_mut() {
            row.sort_by_key(|t| (t.offset, t.size));
        }
        Self { rows }
    }

    /// Reconciles a virtual range whose physical backing changed.
    /// `bases` are the active base of every allocation row.
    pub fn query(
        &self,
        allocations: &[Allocation],
        bases: &[u64],
        va: u64,
        len: u64,
    ) -> RemapReport {
        let remapped = va..va.saturating_add(len);
        let mut overlaps = Vec::new();
        let mut covered = false;
        let mut unsupported = false;

        for (row, allocation) in allocations.iter().enumerate() {
            let base = bases.get(row).copied().unwrap_or(allocation.logical_addr);
            let start = remapped.start.max(base);
            let end = remapped.end.min(base.saturating_add(allocation.size));
            if start >= end {
                continue;
            }
            let absolute = allocation.kind == AllocationKind::Absolute;
            overlaps.push(OverlapRange::new(allocation.id, start..end, absolute));
            if absolute {
                break;
            }

            let local = start - base..end - base;
            let tensors = self.rows.get(row).map_or(&[][..], |r| r.as_slice());
            let upper = tensors.partition_point(|t| t.offset < local.end);
            for tensor in tensors[..upper].iter().filter(|t| t.end() > local.start) {
                covered = true;
                let whole = local.start <= tensor.offset && tensor.end() <= local.end;
                match tensor.policy {
                    RemapPolicy::Support => {}
                    RemapPolicy::ConditionalSupport if whole => {}
                    RemapPolicy::ConditionalSupport | RemapPolicy::NoSupport => {
                        log::debug!(
                            "Remap of {:#x}..{:#x} hits {} tensor {:?}",
                            remapped.start,
                            remapped.end,
                            tensor.policy,
                            tensor
                        );
                        unsupported = true;
                    }
                }
            }
        }

        let result = if unsupported {
            RemapResult::NotSupported
        } else if !covered {
            RemapResult::Unknown
        } else {
            RemapResult::Supported
        };
        RemapReport { result, overlaps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryType;

    fn allocations() -> Vec<Allocation> {
        vec![
            Allocation::new(
                AllocationId(0),
                0x1000,
                0x1000,
                AllocationKind::FeatureMap,
                MemoryType::Hbm,
            ),
            Allocation::new(
                AllocationId(1),
                0x3000,
                0x1000,
                AllocationKind::Absolute,
                MemoryType::Hbm,
            ),
            Allocation::new(
                AllocationId(2),
                0x3800,
                0x1000,
                AllocationKind::Input,
                MemoryType::Hbm,
            ),
        ]
    }

    fn bases() -> Vec<u64> {
        allocations().iter().map(|a| a.logical_addr).collect()
    }

    #[test]
    fn contained_no_support_tensor() {
        let index = RemapIndex::new(
            3,
            &[TensorOccupancy::new(0, 0x100, 0x200, RemapPolicy::NoSupport)],
        );
        let report = index.query(&allocations(), &bases(), 0x1000, 0x1000);
        assert_eq!(report.result, RemapResult::NotSupported);
        assert_eq!(
            report.overlaps,
            vec![OverlapRange::new(AllocationId(0), 0x1000..0x2000, false)]
        );
    }

    #[test]
    fn conditional_support_needs_the_whole_tensor() {
        let index = RemapIndex::new(
            3,
            &[TensorOccupancy::new(0, 0x100, 0x200, RemapPolicy::ConditionalSupport)],
        );
        let whole = index.query(&allocations(), &bases(), 0x1100, 0x200);
        assert_eq!(whole.result, RemapResult::Supported);
        let partial = index.query(&allocations(), &bases(), 0x1100, 0x100);
        assert_eq!(partial.result, RemapResult::NotSupported);
    }

    #[test]
    fn uncovered_ranges_are_unknown() {
        let index = RemapIndex::new(
            3,
            &[TensorOccupancy::new(0, 0x100, 0x200, RemapPolicy::Support)],
        );
        let report = index.query(&allocations(), &bases(), 0x1800, 0x100);
        assert_eq!(report.result, RemapResult::Unknown);
        assert_eq!(report.overlaps.len(), 1);

        let report = index.query(&allocations(), &bases(), 0x1000, 0x800);
        assert_eq!(report.result, RemapResult::Supported);
    }

    #[test]
    fn absolute_allocations_end_the_scan() {
        let index = RemapIndex::new(
            3,
            &[TensorOccupancy::new(2, 0, 0x1000, RemapPolicy::NoSupport)],
        );
        let report = index.query(&allocations(), &bases(), 0x3000, 0x1000);
        assert_eq!(
            report.overlaps,
            vec![OverlapRange::new(AllocationId(1), 0x3000..0x4000, true)]
        );
        assert_eq!(report.result, RemapResult::Unknown);
    }

    #[test]
    fn queries_follow_active_bases() {
        let index = RemapIndex::new(
            3,
            &[TensorOccupancy::new(0, 0, 0x100, RemapPolicy::NoSupport)],
        );
        let moved = [0x9000, 0x3000, 0x3800];
        let report = index.query(&allocations(), &moved, 0x9000, 0x10);
        assert_eq!(report.result, RemapResult::NotSupported);
        assert_eq!(report, index.query(&allocations(), &moved, 0x9000, 0x10));
        let stale = index.query(&allocations(), &moved, 0x1000, 0x10);
        assert!(stale.overlaps.is_empty());
    }
}
