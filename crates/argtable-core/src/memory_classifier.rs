use std::cmp::Reverse;
use std::ops::Range;

use derive_new::new;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    AddressDescriptor, Allocation, AllocationKind, Enforcer, InvariantError, MemoryType,
    TaskRunParam,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, strum_macros::Display,
)]
pub enum MemoryCategory {
    /// Weights, constants, absolute and pinned buffers. Never refreshed.
    Fixed,
    FeatureMap,
    ModelIO,
}

/// Where an address lives relative to its allocation.
/// At execution time the address becomes `active_bases[row] + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct BaseRef {
    pub row: usize,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct AddrResolution {
    pub category: MemoryCategory,
    pub base: Option<BaseRef>,
}

impl AddrResolution {
    pub fn fixed() -> Self {
        Self::new(MemoryCategory::Fixed, None)
    }
}

pub type AddrKey = (MemoryType, u64);

/// # Memory Classifier
///
/// Assigns every address a task touches a semantic category.
///
/// Allocations from `fusion_start_id` onwards are fusion segments and always hold model IO.
/// Everything before it is kept sorted by end address. A binary search finds the first
/// candidate, and allocations of different kinds may nest, so the innermost owner of the
/// address's memory type wins.
#[derive(Debug, Clone)]
pub struct MemoryClassifier {
    allocations: Vec<Allocation>,
    fusion: Vec<(usize, Range<u64>)>,
    by_end: Vec<usize>,
}

impl MemoryClassifier {
    pub fn new(allocations: &[Allocation], fusion_start_id: usize) -> Result<Self, InvariantError> {
        if fusion_start_id > allocations.len() {
            return Err(InvariantError::FusionStartOutOfRange {
                start: fusion_start_id,
                len: allocations.len(),
            });
        }
        Enforcer::check_no_overlap(&allocations[..fusion_start_id])?;

        let fusion = allocations
            .iter()
            .enumerate()
            .skip(fusion_start_id)
            .map(|(row, a)| (row, a.range()))
            .collect();

        let mut by_end: Vec<usize> = (0..fusion_start_id)
            .filter(|&row| allocations[row].size > 0)
            .collect();
        by_end.sort_by_key(|&row| {
            let a = &allocations[row];
            (a.end(), Reverse(a.logical_addr))
        });

        log::debug!(
            "Memory classifier: {} searchable allocations, {} fusion segments",
            by_end.len(),
            allocations.len() - fusion_start_id
        );
        Ok(Self {
            allocations: allocations.to_vec(),
            fusion,
            by_end,
        })
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// What a change of each row's active base means for the argument tables.
    /// Matches [`MemoryClassifier::resolve`]: every TS address is a feature map.
    pub fn row_categories(&self) -> Vec<MemoryCategory> {
        let fusion_start = self.fusion.first().map_or(self.allocations.len(), |f| f.0);
        self.allocations
            .iter()
            .enumerate()
            .map(|(row, a)| {
                match a.kind {
                    _ if a.memory_type == MemoryType::Ts => MemoryCategory::FeatureMap,
                    _ if !a.memory_type.is_feature_map_like() => MemoryCategory::Fixed,
                    _ if row >= fusion_start => MemoryCategory::ModelIO,
                    AllocationKind::FeatureMap => MemoryCategory::FeatureMap,
                    AllocationKind::Input | AllocationKind::Output => MemoryCategory::ModelIO,
                    AllocationKind::FixedFeatureMap | AllocationKind::Absolute => {
                        MemoryCategory::Fixed
                    }
                }
            })
            .collect()
    }

    pub fn classify_addr(&self, memory_type: MemoryType, addr: u64) -> MemoryCategory {
        self.resolve(memory_type, addr).category
    }

    pub fn resolve(&self, memory_type: MemoryType, addr: u64) -> AddrResolution {
        if memory_type == MemoryType::Ts {
            // TS memory can never hold weights or model IO.
            let base = self
                .locate(memory_type, addr)
                .map(|(row, a)| BaseRef::new(row, addr - a.logical_addr));
            return AddrResolution::new(MemoryCategory::FeatureMap, base);
        }
        if !memory_type.is_feature_map_like() {
            return AddrResolution::fixed();
        }

        let fusion = self.fusion.iter().find(|(row, r)| {
            self.allocations[*row].memory_type == memory_type && r.contains(&addr)
        });
        if let Some((row, range)) = fusion {
            return AddrResolution::new(
                MemoryCategory::ModelIO,
                Some(BaseRef::new(*row, addr - range.start)),
            );
        }

        match self.locate(memory_type, addr) {
            Some((row, a)) => {
                let base = Some(BaseRef::new(row, addr - a.logical_addr));
                match a.kind {
                    AllocationKind::FixedFeatureMap | AllocationKind::Absolute => {
                        AddrResolution::fixed()
                    }
                    AllocationKind::FeatureMap => {
                        AddrResolution::new(MemoryCategory::FeatureMap, base)
                    }
                    AllocationKind::Input | AllocationKind::Output => {
                        AddrResolution::new(MemoryCategory::ModelIO, base)
                    }
                }
            }
            // Nobody owns it, so it is a dynamic model boundary.
            None => AddrResolution::new(MemoryCategory::ModelIO, None),
        }
    }

    /// TS and HBM are separate address spaces, only rows of `memory_type` can own `addr`.
    fn locate(&self, memory_type: MemoryType, addr: u64) -> Option<(usize, &Allocation)> {
        let first = self
            .by_end
            .partition_point(|&row| self.allocations[row].end() <= addr);
        self.by_end[first..]
            .iter()
            .map(|&row| (row, &self.allocations[row]))
            .find(|(_, a)| a.memory_type == memory_type && a.contains(addr))
    }

    /// Categories are address invariant, so every `(memory_type, address)` is resolved once.
    pub fn classify_by_task_params(
        &self,
        params: &[TaskRunParam],
    ) -> FxHashMap<AddrKey, AddrResolution> {
        let mut resolved = FxHashMap::default();
        for param in params {
            for desc in param.all_addrs() {
                resolved
                    .entry(Self::key(desc))
                    .or_insert_with(|| self.resolve(desc.memory_type, desc.logical_addr));
            }
        }
        resolved
    }

    pub fn key(desc: &AddressDescriptor) -> AddrKey {
        (desc.memory_type, desc.logical_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, AllocationId};
    use test_strategy::proptest;

    fn alloc(id: u64, addr: u64, size: u64, kind: AllocationKind) -> Allocation {
        Allocation::new(AllocationId(id), addr, size, kind, MemoryType::Hbm)
    }

    fn table() -> Vec<Allocation> {
        vec![
            alloc(0, 0x1000, 0x1000, AllocationKind::FeatureMap),
            alloc(1, 0x4000, 0x100, AllocationKind::FixedFeatureMap),
            alloc(2, 0x8000, 0x200, AllocationKind::Input),
            alloc(3, 0x2000, 0x800, AllocationKind::Output),
            alloc(4, 0x9000, 0x100, AllocationKind::FeatureMap),
        ]
    }

    #[test]
    fn ts_is_always_feature_map() {
        let classifier = MemoryClassifier::new(&table(), 4).unwrap();
        assert_eq!(
            classifier.classify_addr(MemoryType::Ts, 0xdead_0000),
            MemoryCategory::FeatureMap
        );
        assert_eq!(
            classifier.classify_addr(MemoryType::Ts, 0x4010),
            MemoryCategory::FeatureMap
        );
    }

    #[test]
    fn non_feature_map_types_are_fixed() {
        let classifier = MemoryClassifier::new(&table(), 4).unwrap();
        for ty in [MemoryType::Weight, MemoryType::Const, MemoryType::Absolute] {
            assert_eq!(classifier.classify_addr(ty, 0x1000), MemoryCategory::Fixed);
        }
    }

    #[test]
    fn searchable_allocations() {
        let classifier = MemoryClassifier::new(&table(), 4).unwrap();
        let resolved = classifier.resolve(MemoryType::Hbm, 0x1010);
        assert_eq!(resolved.category, MemoryCategory::FeatureMap);
        assert_eq!(resolved.base, Some(BaseRef::new(0, 0x10)));

        assert_eq!(
            classifier.classify_addr(MemoryType::Hbm, 0x4000),
            MemoryCategory::Fixed
        );
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x81ff),
            AddrResolution::new(MemoryCategory::ModelIO, Some(BaseRef::new(2, 0x1ff)))
        );
        assert_eq!(
            classifier.classify_addr(MemoryType::Hbm, 0x2000),
            MemoryCategory::ModelIO
        );
        // one past the end of the feature map
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x2800),
            AddrResolution::new(MemoryCategory::ModelIO, None)
        );
    }

    #[test]
    fn nested_allocations_resolve_to_the_innermost_owner() {
        let allocations = vec![
            alloc(0, 0x1000, 0x1000, AllocationKind::FeatureMap),
            alloc(1, 0x1800, 0x100, AllocationKind::Input),
            alloc(2, 0x1f00, 0x100, AllocationKind::Output),
        ];
        let classifier = MemoryClassifier::new(&allocations, 3).unwrap();
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x1100),
            AddrResolution::new(MemoryCategory::FeatureMap, Some(BaseRef::new(0, 0x100)))
        );
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x1810),
            AddrResolution::new(MemoryCategory::ModelIO, Some(BaseRef::new(1, 0x10)))
        );
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x1900),
            AddrResolution::new(MemoryCategory::FeatureMap, Some(BaseRef::new(0, 0x900)))
        );
        // same end address, the later start is the inner one
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x1f80),
            AddrResolution::new(MemoryCategory::ModelIO, Some(BaseRef::new(2, 0x80)))
        );
    }

    #[test]
    fn memory_types_do_not_share_rows() {
        let allocations = vec![
            alloc(0, 0x1000, 0x1000, AllocationKind::FeatureMap),
            Allocation::new(
                AllocationId(1),
                0x8000,
                0x100,
                AllocationKind::Input,
                MemoryType::Ts,
            ),
        ];
        let classifier = MemoryClassifier::new(&allocations, 2).unwrap();
        assert_eq!(
            classifier.resolve(MemoryType::Ts, 0x1010),
            AddrResolution::new(MemoryCategory::FeatureMap, None)
        );
        assert_eq!(
            classifier.resolve(MemoryType::Ts, 0x8010),
            AddrResolution::new(MemoryCategory::FeatureMap, Some(BaseRef::new(1, 0x10)))
        );
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x8010),
            AddrResolution::new(MemoryCategory::ModelIO, None)
        );
        use MemoryCategory::*;
        assert_eq!(classifier.row_categories(), vec![FeatureMap, FeatureMap]);
    }

    #[test]
    fn fusion_segments_are_model_io() {
        let classifier = MemoryClassifier::new(&table(), 4).unwrap();
        assert_eq!(
            classifier.resolve(MemoryType::Hbm, 0x9004),
            AddrResolution::new(MemoryCategory::ModelIO, Some(BaseRef::new(4, 4)))
        );
    }

    #[test]
    fn row_categories_follow_kinds() {
        let mut allocations = table();
        allocations.push(Allocation::new(
            AllocationId(5),
            0xa000,
            0x100,
            AllocationKind::Input,
            MemoryType::Weight,
        ));
        let classifier = MemoryClassifier::new(&allocations, 4).unwrap();
        use MemoryCategory::*;
        assert_eq!(
            classifier.row_categories(),
            vec![FeatureMap, Fixed, ModelIO, ModelIO, ModelIO, Fixed]
        );
    }

    #[test]
    fn fusion_start_out_of_range() {
        assert!(matches!(
            MemoryClassifier::new(&table(), 6),
            Err(InvariantError::FusionStartOutOfRange { start: 6, len: 5 })
        ));
    }

    #[test]
    fn task_params_are_memoized() {
        let classifier = MemoryClassifier::new(&table(), 4).unwrap();
        let a = AddressDescriptor::new(0x1000, MemoryType::Hbm, true);
        let w = AddressDescriptor::new(0x1000, MemoryType::Weight, false);
        let params = vec![
            TaskRunParam {
                inputs: rvec![a, w],
                outputs: rvec![a],
                ..Default::default()
            },
            TaskRunParam {
                workspaces: rvec![a],
                ..Default::default()
            },
        ];
        let resolved = classifier.classify_by_task_params(&params);
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved[&(MemoryType::Hbm, 0x1000)].category,
            MemoryCategory::FeatureMap
        );
        assert_eq!(
            resolved[&(MemoryType::Weight, 0x1000)].category,
            MemoryCategory::Fixed
        );
    }

    #[proptest(cases = 256)]
    fn unowned_feature_map_addresses_are_model_io(
        #[strategy(0u64..0x10000)] addr: u64,
    ) {
        let classifier = MemoryClassifier::new(&table(), 4).unwrap();
        let owned = table()[..4].iter().any(|a| a.contains(addr))
            || table()[4..].iter().any(|a| a.contains(addr));
        let category = classifier.classify_addr(MemoryType::Hbm, addr);
        if !owned {
            assert_eq!(category, MemoryCategory::ModelIO);
        }
    }
}
