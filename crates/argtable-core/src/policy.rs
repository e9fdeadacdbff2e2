use std::ops::Range;

use derive_new::new;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};

use crate::{LayoutResult, MemoryCategory, Placement, RVec, RefreshTrigger};

/// How much of the argument tables an execution rewrites. Stronger policies are supersets of
/// weaker ones, so the order doubles as a cost order.
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
pub enum UpdatePolicy {
    #[default]
    NoNeedUpdate,
    UpdateHostInput,
    UpdateModelIO,
    UpdateFmAndModelIO,
    InitOneTime,
}

impl UpdatePolicy {
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Policies that rewrite task addresses, and may therefore use the refresh kernel.
    pub fn refreshes_addresses(&self) -> bool {
        matches!(
            self,
            UpdatePolicy::UpdateModelIO | UpdatePolicy::UpdateFmAndModelIO
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct HostRefreshDesc {
    pub task_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct H2dCopyDesc {
    pub placement: Placement,
    pub range: Range<u64>,
}

impl H2dCopyDesc {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// An SQE-class region that must be re-sent once the task's stream identifiers are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct SqeUpdateDesc {
    pub task_index: usize,
    pub region: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyEntry {
    pub refresh: Vec<HostRefreshDesc>,
    pub copies: RVec<H2dCopyDesc>,
    pub sqe_updates: Vec<SqeUpdateDesc>,
}

impl PolicyEntry {
    pub fn is_empty(&self) -> bool {
        self.refresh.is_empty() && self.copies.is_empty() && self.sqe_updates.is_empty()
    }

    pub fn copy_bytes(&self, placement: Placement) -> u64 {
        self.copies
            .iter()
            .filter(|c| c.placement == placement)
            .map(|c| c.len())
            .sum()
    }
}

/// # UpdatePolicyTable
///
/// For every policy: the tasks whose host arguments are refreshed, the byte ranges pushed to
/// the device and the SQE regions re-sent afterwards. Built once from the layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePolicyTable([PolicyEntry; UpdatePolicy::COUNT]);

impl UpdatePolicyTable {
    pub fn build(layout: &LayoutResult, triggers: &[RefreshTrigger]) -> Self {
        let mut table = Self::default();
        for policy in UpdatePolicy::iter() {
            let entry = &mut table.0[policy.index()];
            let Some(tasks) = Self::refreshed_triggers(policy) else {
                continue;
            };
            for (task_index, trigger) in triggers.iter().enumerate() {
                if !tasks.contains(trigger) {
                    continue;
                }
                entry.refresh.push(HostRefreshDesc::new(task_index));
            }
            for (task_index, entries) in layout.tasks.iter().enumerate() {
                let sends_sqe = policy == UpdatePolicy::InitOneTime
                    || entry.refresh.iter().any(|r| r.task_index == task_index);
                if !sends_sqe {
                    continue;
                }
                for (region, e) in entries.iter().enumerate() {
                    if e.declared == Placement::Sqe {
                        entry.sqe_updates.push(SqeUpdateDesc::new(task_index, region));
                    }
                }
            }
        }

        for placement in layout.partitions.non_empty_placements() {
            let p = &layout.partitions;
            let copies = [
                (UpdatePolicy::InitOneTime, 0..p.placement_len(placement)),
                (
                    UpdatePolicy::UpdateFmAndModelIO,
                    p.span(
                        placement,
                        RefreshTrigger::OnFeatureMap,
                        RefreshTrigger::OnFeatureMapAndIO,
                    ),
                ),
                (
                    UpdatePolicy::UpdateModelIO,
                    p.range(placement, RefreshTrigger::OnFeatureMapAndIO),
                ),
            ];
            for (policy, range) in copies {
                if !range.is_empty() {
                    table.0[policy.index()]
                        .copies
                        .push(H2dCopyDesc::new(placement, range));
                }
            }
        }
        if let Some(host_input) = layout.host_input {
            table.0[UpdatePolicy::UpdateHostInput.index()]
                .copies
                .push(H2dCopyDesc::new(host_input.placement, host_input.range()));
        }

        for policy in UpdatePolicy::iter() {
            let entry = table.get(policy);
            log::debug!(
                "{}: {} tasks, {} copies, {} SQE updates",
                policy,
                entry.refresh.len(),
                entry.copies.len(),
                entry.sqe_updates.len()
            );
        }
        table
    }

    /// `None` if the policy refreshes no task.
    fn refreshed_triggers(policy: UpdatePolicy) -> Option<Range<RefreshTrigger>> {
        match policy {
            UpdatePolicy::NoNeedUpdate | UpdatePolicy::UpdateHostInput => None,
            UpdatePolicy::UpdateModelIO => {
                Some(RefreshTrigger::OnFeatureMapAndIO..RefreshTrigger::OnHostInput)
            }
            UpdatePolicy::UpdateFmAndModelIO | UpdatePolicy::InitOneTime => {
                Some(RefreshTrigger::OnFeatureMap..RefreshTrigger::OnHostInput)
            }
        }
    }

    pub fn get(&self, policy: UpdatePolicy) -> &PolicyEntry {
        &self.0[policy.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (UpdatePolicy, &PolicyEntry)> {
        UpdatePolicy::iter().zip(self.0.iter())
    }
}

/// # PolicySelector
///
/// Picks the cheapest sufficient policy by comparing this execution's active bases with the
/// previous execution's.
#[derive(Debug, Clone, Default, PartialEq, Eq, new)]
pub struct PolicySelector {
    row_categories: Vec<MemoryCategory>,
    /// Whether any task is triggered by model IO.
    has_io_refresh: bool,
}

impl PolicySelector {
    pub fn select(&self, previous: Option<&[u64]>, current: &[u64]) -> UpdatePolicy {
        let Some(previous) = previous else {
            return UpdatePolicy::InitOneTime;
        };
        let changed = |category: MemoryCategory| {
            self.row_categories
                .iter()
                .zip(previous.iter().zip(current))
                .any(|(c, (a, b))| *c == category && a != b)
        };
        if changed(MemoryCategory::FeatureMap) {
            UpdatePolicy::UpdateFmAndModelIO
        } else if self.has_io_refresh && changed(MemoryCategory::ModelIO) {
            UpdatePolicy::UpdateModelIO
        } else {
            UpdatePolicy::NoNeedUpdate
        }
    }
}
