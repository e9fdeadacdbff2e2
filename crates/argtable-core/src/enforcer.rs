use std::ops::RangeInclusive;

use crate::{Allocation, AllocationId, Placement, TaskArgsDesc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantError {
    #[error("Overflow while accumulating {what}: {lhs} + {rhs}.")]
    Overflow {
        what: &'static str,
        lhs: u64,
        rhs: u64,
    },
    #[error("Wrong argument region arity for task {task}. Allowed range is {accepted:?}, task has {actual}.")]
    RegionArity {
        task: usize,
        accepted: RangeInclusive<usize>,
        actual: usize,
    },
    #[error("Task {task} declares more than one argument region for placement {placement}.")]
    DuplicatePlacement { task: usize, placement: Placement },
    #[error("Allocations {a:?} and {b:?} of the same kind and memory type overlap.")]
    OverlappingAllocations { a: AllocationId, b: AllocationId },
    #[error("Fusion start {start} is beyond the allocation table ({len} entries).")]
    FusionStartOutOfRange { start: usize, len: usize },
    #[error("Range {offset}+{len} is out of bounds of a {capacity} byte buffer.")]
    OutOfBounds { offset: u64, len: u64, capacity: u64 },
    #[error("Active base table has {actual} rows, the model has {expected} allocations.")]
    BaseTableMismatch { expected: usize, actual: usize },
    #[error("No argument table was allocated for placement {0}.")]
    MissingArgsTable(Placement),
}

/// # Enforcer
///
/// Enforcer enforces common invariants on model descriptions.
pub struct Enforcer;

impl Enforcer {
    pub const MAX_ARGS_REGIONS: usize = 2;

    pub fn checked_add(what: &'static str, lhs: u64, rhs: u64) -> Result<u64, InvariantError> {
        lhs.checked_add(rhs)
            .ok_or(InvariantError::Overflow { what, lhs, rhs })
    }

    /// A task may own at most two regions, and at most one per placement.
    /// SQE is a placement like any other here, so a second SQE region is a duplicate.
    pub fn check_args_descs(task: usize, descs: &[TaskArgsDesc]) -> Result<(), InvariantError> {
        let accepted = 0..=Self::MAX_ARGS_REGIONS;
        if !accepted.contains(&descs.len()) {
            return Err(InvariantError::RegionArity {
                task,
                accepted,
                actual: descs.len(),
            });
        }
        for (i, desc) in descs.iter().enumerate() {
            if descs[..i].iter().any(|d| d.placement == desc.placement) {
                return Err(InvariantError::DuplicatePlacement {
                    task,
                    placement: desc.placement,
                });
            }
        }
        Ok(())
    }

    /// Allocations of different kinds may nest, and every memory type is its own address space.
    pub fn check_no_overlap(allocations: &[Allocation]) -> Result<(), InvariantError> {
        let mut sorted: Vec<&Allocation> = allocations.iter().filter(|a| a.size > 0).collect();
        sorted.sort_by_key(|a| (a.memory_type as u8, a.kind as u8, a.logical_addr));
        for pair in sorted.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let same_space = a.kind == b.kind && a.memory_type == b.memory_type;
            if same_space && b.logical_addr < a.end() {
                return Err(InvariantError::OverlappingAllocations { a: a.id, b: b.id });
            }
        }
        Ok(())
    }

    pub fn check_base_table(expected: usize, bases: &[u64]) -> Result<(), InvariantError> {
        if bases.len() != expected {
            return Err(InvariantError::BaseTableMismatch {
                expected,
                actual: bases.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocationKind, MemoryType};

    fn alloc(id: u64, addr: u64, size: u64, kind: AllocationKind) -> Allocation {
        Allocation::new(AllocationId(id), addr, size, kind, MemoryType::Hbm)
    }

    #[test]
    fn duplicate_placement_is_rejected() {
        let descs = [
            TaskArgsDesc::new(8, Placement::Hbm),
            TaskArgsDesc::new(16, Placement::Hbm),
        ];
        assert_eq!(
            Enforcer::check_args_descs(3, &descs),
            Err(InvariantError::DuplicatePlacement {
                task: 3,
                placement: Placement::Hbm
            })
        );
    }

    #[test]
    fn three_regions_are_rejected() {
        let descs = [
            TaskArgsDesc::new(8, Placement::Hbm),
            TaskArgsDesc::new(8, Placement::Sqe),
            TaskArgsDesc::new(8, Placement::Ts),
        ];
        assert!(matches!(
            Enforcer::check_args_descs(0, &descs),
            Err(InvariantError::RegionArity { actual: 3, .. })
        ));
    }

    #[test]
    fn overlap_only_matters_within_a_kind() {
        let ok = [
            alloc(0, 0x1000, 0x100, AllocationKind::FeatureMap),
            alloc(1, 0x1080, 0x100, AllocationKind::Input),
        ];
        assert!(Enforcer::check_no_overlap(&ok).is_ok());

        let other_space = [
            alloc(0, 0x1000, 0x100, AllocationKind::FeatureMap),
            Allocation::new(
                AllocationId(1),
                0x1000,
                0x100,
                AllocationKind::FeatureMap,
                MemoryType::Ts,
            ),
        ];
        assert!(Enforcer::check_no_overlap(&other_space).is_ok());

        let bad = [
            alloc(0, 0x1000, 0x100, AllocationKind::FeatureMap),
            alloc(1, 0x10ff, 0x100, AllocationKind::FeatureMap),
        ];
        assert_eq!(
            Enforcer::check_no_overlap(&bad),
            Err(InvariantError::OverlappingAllocations {
                a: AllocationId(0),
                b: AllocationId(1)
            })
        );
    }

    #[test]
    fn checked_add_reports_operands() {
        assert_eq!(Enforcer::checked_add("x", 1, 2), Ok(3));
        assert_eq!(
            Enforcer::checked_add("partition", u64::MAX, 1),
            Err(InvariantError::Overflow {
                what: "partition",
                lhs: u64::MAX,
                rhs: 1
            })
        );
    }
}
