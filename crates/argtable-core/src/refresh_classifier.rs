use derive_new::new;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    AddrKey, AddrResolution, AddressDescriptor, IoSlots, MemoryCategory, MemoryClassifier, RVec,
    SlotRef, TaskGraph, TaskKind, TaskRunParam,
};

/// When a byte range of an argument table must be rewritten.
///
/// The order is load bearing: partitions are laid out in this order, and an update only ever
/// rewrites a suffix of the triggers that fired.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::EnumCount,
)]
pub enum RefreshTrigger {
    #[default]
    NoUpdate,
    OnFeatureMap,
    OnFeatureMapAndIO,
    OnHostInput,
}

impl RefreshTrigger {
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Least upper bound. A task touching model IO must land in the IO partition even if it
    /// also touches feature maps.
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn for_slot(
        resolution: &AddrResolution,
        desc: &AddressDescriptor,
        fm_refreshable: bool,
    ) -> Self {
        match resolution.category {
            MemoryCategory::ModelIO if desc.supports_refresh => RefreshTrigger::OnFeatureMapAndIO,
            MemoryCategory::FeatureMap if desc.supports_refresh && fm_refreshable => {
                RefreshTrigger::OnFeatureMap
            }
            _ => RefreshTrigger::NoUpdate,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRefreshType {
    pub task: RefreshTrigger,
    pub slots: IoSlots<RefreshTrigger>,
}

impl TaskRefreshType {
    fn recompute(&mut self) {
        self.task = self
            .slots
            .iter()
            .fold(RefreshTrigger::NoUpdate, |acc, (_, _, t)| acc.join(*t));
    }
}

/// Slots sharing one pinned buffer, allocated once in the fixed-address bulk.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct FixedAddrGroup {
    pub slots: RVec<SlotRef>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("{slot:?} has no classified address.")]
    MissingResolution { slot: SlotRef },
    #[error("Pinned {slot:?} has {peers} peers, exactly one is supported.")]
    FanOut { slot: SlotRef, peers: usize },
    #[error("Pinned {slot:?} is fed by {peer:?} of kind {kind:?}, which is not a pass-through task.")]
    UnsupportedPeer {
        slot: SlotRef,
        peer: SlotRef,
        kind: Option<TaskKind>,
    },
    #[error("Peer {peer:?} does not exist.")]
    MissingPeerSlot { peer: SlotRef },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshClassification {
    pub task_types: Vec<TaskRefreshType>,
    pub fixed_addr_groups: Vec<FixedAddrGroup>,
}

impl RefreshClassification {
    pub fn triggers(&self) -> Vec<RefreshTrigger> {
        self.task_types.iter().map(|t| t.task).collect()
    }

    pub fn has_trigger(&self, trigger: RefreshTrigger) -> bool {
        self.task_types.iter().any(|t| t.task == trigger)
    }
}

/// # Task Refresh Classifier
///
/// Decides, per slot and per task, what has to change before a task's arguments are stale.
/// Also finds fixed-address chains: slots pinned to a pass-through producer, which leave the
/// dynamic tables entirely.
pub struct TaskRefreshClassifier;

impl TaskRefreshClassifier {
    pub fn classify(
        graph: &dyn TaskGraph,
        params: &[TaskRunParam],
        resolved: &FxHashMap<AddrKey, AddrResolution>,
        fm_refreshable: bool,
    ) -> Result<RefreshClassification, ClassifyError> {
        let mut task_types = Vec::with_capacity(params.len());
        for (task_index, param) in params.iter().enumerate() {
            let slots = param.io_slots();
            let mut missing = None;
            let triggers = slots.map(|slot_type, slot_index, desc| {
                match resolved.get(&MemoryClassifier::key(desc)) {
                    Some(resolution) => RefreshTrigger::for_slot(resolution, desc, fm_refreshable),
                    None => {
                        missing.get_or_insert(SlotRef::new(task_index, slot_type, slot_index));
                        RefreshTrigger::NoUpdate
                    }
                }
            });
            if let Some(slot) = missing {
                return Err(ClassifyError::MissingResolution { slot });
            }
            task_types.push(TaskRefreshType {
                task: RefreshTrigger::NoUpdate,
                slots: triggers,
            });
        }

        let fixed_addr_groups = Self::find_fixed_addr_groups(graph, params, resolved)?;
        for group in fixed_addr_groups.iter() {
            for slot in group.slots.iter() {
                if let Some(trigger) = task_types[slot.task_index]
                    .slots
                    .get_mut(slot.slot_type, slot.slot_index)
                {
                    *trigger = RefreshTrigger::NoUpdate;
                }
            }
        }

        for (task_index, task_type) in task_types.iter_mut().enumerate() {
            task_type.recompute();
            log::debug!(
                "Task {} refresh type {} {:?}",
                task_index,
                task_type.task,
                task_type.slots
            );
        }

        Ok(RefreshClassification {
            task_types,
            fixed_addr_groups,
        })
    }

    fn find_fixed_addr_groups(
        graph: &dyn TaskGraph,
        params: &[TaskRunParam],
        resolved: &FxHashMap<AddrKey, AddrResolution>,
    ) -> Result<Vec<FixedAddrGroup>, ClassifyError> {
        let mut groups: Vec<FixedAddrGroup> = Vec::new();
        let mut grouped: FxHashMap<SlotRef, usize> = FxHashMap::default();

        for (task_index, param) in params.iter().enumerate() {
            for (slot_type, slot_index, desc) in param.io_slots().iter() {
                let slot = SlotRef::new(task_index, slot_type, slot_index);
                let category = resolved
                    .get(&MemoryClassifier::key(desc))
                    .map(|r| r.category)
                    .ok_or(ClassifyError::MissingResolution { slot })?;
                if category != MemoryCategory::Fixed || desc.supports_refresh {
                    continue;
                }
                let Some(edge) = graph.pinned_peers(slot) else {
                    continue;
                };

                let [peer] = edge.peers.as_slice() else {
                    return Err(ClassifyError::FanOut {
                        slot,
                        peers: edge.peers.len(),
                    });
                };
                let peer = *peer;
                let kind = graph.task_kind(peer.task_index);
                if !kind.is_some_and(|k| k.is_pass_through()) {
                    return Err(ClassifyError::UnsupportedPeer { slot, peer, kind });
                }
                let peer_exists = params
                    .get(peer.task_index)
                    .map(|p| p.io_slots().get(peer.slot_type, peer.slot_index).is_some())
                    .unwrap_or(false);
                if !peer_exists {
                    return Err(ClassifyError::MissingPeerSlot { peer });
                }

                let existing = (grouped.get(&slot).copied(), grouped.get(&peer).copied());
                let group_index = match existing {
                    (Some(a), Some(b)) if a != b => {
                        let (keep, merged) = (a.min(b), a.max(b));
                        let moved = std::mem::take(&mut groups[merged].slots);
                        for s in moved.iter() {
                            grouped.insert(*s, keep);
                        }
                        let size = groups[merged].size;
                        let group = &mut groups[keep];
                        group.slots.extend(moved);
                        group.size = group.size.max(size);
                        log::debug!("Fixed address groups {} and {} merged", keep, merged);
                        keep
                    }
                    (Some(index), _) | (None, Some(index)) => index,
                    (None, None) => {
                        groups.push(FixedAddrGroup {
                            slots: RVec::new(),
                            size: 0,
                        });
                        groups.len() - 1
                    }
                };
                let group = &mut groups[group_index];
                group.size = group.size.max(edge.size);
                for s in [slot, peer] {
                    if grouped.insert(s, group_index).is_none() {
                        groups[group_index].slots.push(s);
                    }
                }
                log::debug!("Fixed address chain {:?} <-> {:?}", slot, peer);
            }
        }
        groups.retain(|g| !g.slots.is_empty());
        Ok(groups)
    }
}
