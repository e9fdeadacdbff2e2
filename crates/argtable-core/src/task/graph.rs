use derive_new::new;
use rustc_hash::FxHashMap;

use crate::{RVec, SlotRef, TaskKind};

/// A data edge whose buffer is pinned, as reported by the graph layer.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct PinnedEdge {
    /// The other endpoints of the edge.
    pub peers: RVec<SlotRef>,
    /// Size in bytes of the pinned buffer.
    pub size: u64,
}

/// The slice of the graph layer the argument manager needs.
pub trait TaskGraph {
    /// Node lookup by task index.
    fn task_kind(&self, task_index: usize) -> Option<TaskKind>;

    /// `None` unless the slot is an endpoint of a pinned edge.
    fn pinned_peers(&self, slot: SlotRef) -> Option<PinnedEdge>;
}

/// A graph described up front, as loaded from a model description.
#[derive(Debug, Clone, Default)]
pub struct StaticTaskGraph {
    kinds: Vec<TaskKind>,
    pinned: FxHashMap<SlotRef, PinnedEdge>,
}

impl StaticTaskGraph {
    pub fn new(kinds: Vec<TaskKind>) -> Self {
        Self {
            kinds,
            pinned: FxHashMap::default(),
        }
    }

    /// Pins `slot`. The edge is recorded one way only, peers are not back-linked.
    pub fn pin(&mut self, slot: SlotRef, peers: RVec<SlotRef>, size: u64) -> &mut Self {
        self.pinned.insert(slot, PinnedEdge::new(peers, size));
        self
    }
}

impl TaskGraph for StaticTaskGraph {
    fn task_kind(&self, task_index: usize) -> Option<TaskKind> {
        self.kinds.get(task_index).copied()
    }

    fn pinned_peers(&self, slot: SlotRef) -> Option<PinnedEdge> {
        self.pinned.get(&slot).cloned()
    }
}
