use std::ops::Range;

use derive_new::new;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};

use crate::{Align, Enforcer, InvariantError, RVec, RefreshTrigger};

/// The physical memory space an argument table lives in.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum Placement {
    Hbm,
    Ts,
    /// Arguments stored next to the submission queue entry.
    Sqe,
    HostSvm,
}

impl Placement {
    /// SQE-class arguments are always stored physically adjacent to HBM arguments.
    /// HBM, TS and HostSVM are never merged.
    pub fn physical(&self) -> Placement {
        match self {
            Placement::Sqe => Placement::Hbm,
            p => *p,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, new)]
pub struct TaskArgsDesc {
    pub length: u64,
    pub placement: Placement,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Partition {
    /// Aligned length, padding included.
    pub len: u64,
    pub align_pad: u64,
}

impl Partition {
    pub fn raw_len(&self) -> u64 {
        self.len - self.align_pad
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// `[placement][trigger] -> (len, align_pad)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PartitionTable([[Partition; RefreshTrigger::COUNT]; Placement::COUNT]);

impl PartitionTable {
    pub fn get(&self, placement: Placement, trigger: RefreshTrigger) -> &Partition {
        &self.0[placement.index()][trigger.index()]
    }

    fn get_mut(&mut self, placement: Placement, trigger: RefreshTrigger) -> &mut Partition {
        &mut self.0[placement.index()][trigger.index()]
    }

    pub fn row(&self, placement: Placement) -> &[Partition; RefreshTrigger::COUNT] {
        &self.0[placement.index()]
    }

    pub fn placement_len(&self, placement: Placement) -> u64 {
        self.row(placement).iter().map(|p| p.len).sum()
    }

    /// Partitions of a placement are laid out in trigger order.
    pub fn partition_start(&self, placement: Placement, trigger: RefreshTrigger) -> u64 {
        self.row(placement)[..trigger.index()]
            .iter()
            .map(|p| p.len)
            .sum()
    }

    pub fn range(&self, placement: Placement, trigger: RefreshTrigger) -> Range<u64> {
        let start = self.partition_start(placement, trigger);
        start..start + self.get(placement, trigger).len
    }

    /// Bytes covering every partition with `first <= trigger <= last`.
    pub fn span(
        &self,
        placement: Placement,
        first: RefreshTrigger,
        last: RefreshTrigger,
    ) -> Range<u64> {
        let start = self.partition_start(placement, first);
        let end = self.range(placement, last).end;
        start..end.max(start)
    }

    pub fn non_empty_placements(&self) -> impl Iterator<Item = Placement> + '_ {
        Placement::iter().filter(|p| self.placement_len(*p) > 0)
    }
}

/// Where one declared argument region of a task landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    /// The placement the task asked for.
    pub declared: Placement,
    /// The buffer the region physically lives in.
    pub placement: Placement,
    pub trigger: RefreshTrigger,
    pub offset: u64,
    pub len: u64,
}

impl LayoutEntry {
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LayoutResult {
    pub partitions: PartitionTable,
    pub tasks: Vec<RVec<LayoutEntry>>,
    pub host_input: Option<LayoutEntry>,
}

impl LayoutResult {
    pub fn task(&self, task_index: usize) -> &[LayoutEntry] {
        self.tasks.get(task_index).map_or(&[], |t| t.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error("{triggers} task triggers were provided for {descs} tasks.")]
    TaskCountMismatch { triggers: usize, descs: usize },
    #[error("Task {0} cannot be triggered by host input.")]
    HostInputTrigger(usize),
    #[error("Partition {placement}/{trigger} holds {assigned} bytes of arguments but was planned for {planned}.")]
    OffsetMismatch {
        placement: Placement,
        trigger: RefreshTrigger,
        assigned: u64,
        planned: u64,
    },
}

/// # Argument Layout Planner
///
/// Computes a global `[placement][trigger]` byte layout and the offset of every task's
/// argument regions within it.
///
/// 1. Plan partitions: accumulate every region's length into its cell.
/// 2. Merge placements: SQE is folded into HBM.
/// 3. Align partitions: 32 bytes of slack, then round up to 64.
/// 4. Plan tasks: hand out offsets in task order, partitions in trigger order.
///
/// The result is checked before it is returned, a partial layout is never handed out.
pub struct ArgsLayoutPlanner;

impl ArgsLayoutPlanner {
    pub fn plan(
        triggers: &[RefreshTrigger],
        args_descs: &[RVec<TaskArgsDesc>],
        host_input_size: u64,
    ) -> Result<LayoutResult, LayoutError> {
        if triggers.len() != args_descs.len() {
            return Err(LayoutError::TaskCountMismatch {
                triggers: triggers.len(),
                descs: args_descs.len(),
            });
        }
        for (task, descs) in args_descs.iter().enumerate() {
            Enforcer::check_args_descs(task, descs)?;
            if triggers[task] == RefreshTrigger::OnHostInput {
                return Err(LayoutError::HostInputTrigger(task));
            }
        }

        let mut partitions = Self::plan_partitions(triggers, args_descs, host_input_size)?;
        Self::merge_placements(&mut partitions)?;
        Self::align_partitions(&mut partitions)?;
        let layout = Self::plan_tasks(partitions, triggers, args_descs, host_input_size)?;

        for placement in layout.partitions.non_empty_placements() {
            log::debug!(
                "{} argument table: {} bytes {:?}",
                placement,
                layout.partitions.placement_len(placement),
                layout.partitions.row(placement)
            );
        }
        Ok(layout)
    }

    fn plan_partitions(
        triggers: &[RefreshTrigger],
        args_descs: &[RVec<TaskArgsDesc>],
        host_input_size: u64,
    ) -> Result<PartitionTable, LayoutError> {
        let mut table = PartitionTable::default();
        for (descs, trigger) in args_descs.iter().zip(triggers) {
            for desc in descs {
                let cell = table.get_mut(desc.placement, *trigger);
                cell.len = Enforcer::checked_add("partition length", cell.len, desc.length)?;
            }
        }
        if host_input_size > 0 {
            table
                .get_mut(Placement::Hbm, RefreshTrigger::OnHostInput)
                .len = host_input_size;
        }
        Ok(table)
    }

    fn merge_placements(table: &mut PartitionTable) -> Result<(), LayoutError> {
        for placement in Placement::iter().filter(|p| p.physical() != *p) {
            for trigger in RefreshTrigger::iter() {
                let folded = std::mem::take(&mut table.get_mut(placement, trigger).len);
                let target = table.get_mut(placement.physical(), trigger);
                target.len = Enforcer::checked_add("merged partition", target.len, folded)?;
            }
        }
        Ok(())
    }

    fn align_partitions(table: &mut PartitionTable) -> Result<(), LayoutError> {
        for placement in Placement::iter() {
            for trigger in RefreshTrigger::iter() {
                let cell = table.get_mut(placement, trigger);
                let aligned = cell.len.align_for_args().ok_or(InvariantError::Overflow {
                    what: "aligned partition",
                    lhs: cell.len,
                    rhs: u64::ARGS_SLACK,
                })?;
                cell.align_pad = aligned - cell.len;
                cell.len = aligned;
            }
        }
        Placement::iter()
            .flat_map(|p| *table.row(p))
            .try_fold(0u64, |total, partition| {
                Enforcer::checked_add("placement length", total, partition.len)
            })?;
        Ok(())
    }

    fn plan_tasks(
        partitions: PartitionTable,
        triggers: &[RefreshTrigger],
        args_descs: &[RVec<TaskArgsDesc>],
        host_input_size: u64,
    ) -> Result<LayoutResult, LayoutError> {
        let mut starts = [[0u64; RefreshTrigger::COUNT]; Placement::COUNT];
        for placement in Placement::iter() {
            for trigger in RefreshTrigger::iter() {
                starts[placement.index()][trigger.index()] =
                    partitions.partition_start(placement, trigger);
            }
        }
        let mut cursors = starts;

        let mut tasks = Vec::with_capacity(args_descs.len());
        for (descs, trigger) in args_descs.iter().zip(triggers) {
            let mut entries = RVec::new();
            for desc in descs {
                let placement = desc.placement.physical();
                let cursor = &mut cursors[placement.index()][trigger.index()];
                entries.push(LayoutEntry {
                    declared: desc.placement,
                    placement,
                    trigger: *trigger,
                    offset: *cursor,
                    len: desc.length,
                });
                *cursor = Enforcer::checked_add("task offset", *cursor, desc.length)?;
            }
            tasks.push(entries);
        }

        let host_input = (host_input_size > 0).then(|| {
            let cursor =
                &mut cursors[Placement::Hbm.index()][RefreshTrigger::OnHostInput.index()];
            let entry = LayoutEntry {
                declared: Placement::Hbm,
                placement: Placement::Hbm,
                trigger: RefreshTrigger::OnHostInput,
                offset: *cursor,
                len: host_input_size,
            };
            *cursor += host_input_size;
            entry
        });

        for placement in Placement::iter() {
            for trigger in RefreshTrigger::iter() {
                let (p, t) = (placement.index(), trigger.index());
                let assigned = cursors[p][t] - starts[p][t];
                let planned = partitions.get(placement, trigger).raw_len();
                if assigned != planned {
                    return Err(LayoutError::OffsetMismatch {
                        placement,
                        trigger,
                        assigned,
                        planned,
                    });
                }
            }
        }

        Ok(LayoutResult {
            partitions,
            tasks,
            host_input,
        })
    }
}
