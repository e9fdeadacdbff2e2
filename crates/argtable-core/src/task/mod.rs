mod graph;
mod slot_table;

pub use graph::*;
pub use slot_table::*;

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::{
    AddrResolution, AddressDescriptor, DevicePtr, InvariantError, LayoutEntry, MemoryCategory,
    ModelArgsTable, RVec, RefreshTrigger, TaskArgsDesc,
};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Failed to parse task definition: {0}")]
    Parse(String),
    #[error("Argument region {region} holds {capacity} bytes, {required} are required.")]
    RegionTooSmall {
        region: usize,
        capacity: u64,
        required: u64,
    },
    #[error("Task has no {slot_type} slot {index}.")]
    MissingSlot { slot_type: SlotType, index: usize },
    #[error(transparent)]
    Args(#[from] InvariantError),
}

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
)]
pub enum SlotType {
    Input,
    Output,
    Workspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, new)]
pub struct SlotRef {
    pub task_index: usize,
    pub slot_type: SlotType,
    pub slot_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum TaskKind {
    Kernel,
    AiCpu,
    Identity,
    MemCopy,
    Concat,
}

impl TaskKind {
    /// Tasks that forward their input buffer untouched.
    pub fn is_pass_through(&self) -> bool {
        matches!(self, TaskKind::Identity | TaskKind::MemCopy)
    }
}

/// One value per input, output and workspace slot of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IoSlots<T> {
    pub inputs: RVec<T>,
    pub outputs: RVec<T>,
    pub workspaces: RVec<T>,
}

impl<T> IoSlots<T> {
    pub fn slots(&self, slot_type: SlotType) -> &[T] {
        match slot_type {
            SlotType::Input => &self.inputs,
            SlotType::Output => &self.outputs,
            SlotType::Workspace => &self.workspaces,
        }
    }

    pub fn slots_mut(&mut self, slot_type: SlotType) -> &mut [T] {
        match slot_type {
            SlotType::Input => &mut self.inputs,
            SlotType::Output => &mut self.outputs,
            SlotType::Workspace => &mut self.workspaces,
        }
    }

    pub fn get(&self, slot_type: SlotType, index: usize) -> Option<&T> {
        self.slots(slot_type).get(index)
    }

    pub fn get_mut(&mut self, slot_type: SlotType, index: usize) -> Option<&mut T> {
        self.slots_mut(slot_type).get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len() + self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inputs, then outputs, then workspaces.
    pub fn iter(&self) -> impl Iterator<Item = (SlotType, usize, &T)> {
        let inputs = self.inputs.iter().enumerate();
        let outputs = self.outputs.iter().enumerate();
        let workspaces = self.workspaces.iter().enumerate();
        inputs
            .map(|(i, v)| (SlotType::Input, i, v))
            .chain(outputs.map(|(i, v)| (SlotType::Output, i, v)))
            .chain(workspaces.map(|(i, v)| (SlotType::Workspace, i, v)))
    }

    pub fn map<U>(&self, mut f: impl FnMut(SlotType, usize, &T) -> U) -> IoSlots<U> {
        IoSlots {
            inputs: self
                .inputs
                .iter()
                .enumerate()
                .map(|(i, v)| f(SlotType::Input, i, v))
                .collect(),
            outputs: self
                .outputs
                .iter()
                .enumerate()
                .map(|(i, v)| f(SlotType::Output, i, v))
                .collect(),
            workspaces: self
                .workspaces
                .iter()
                .enumerate()
                .map(|(i, v)| f(SlotType::Workspace, i, v))
                .collect(),
        }
    }
}

/// What a task's parser extracts from its definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRunParam {
    pub inputs: RVec<AddressDescriptor>,
    pub outputs: RVec<AddressDescriptor>,
    pub workspaces: RVec<AddressDescriptor>,
    pub args_descs: RVec<TaskArgsDesc>,
    pub persistent_workspace_descs: RVec<TaskArgsDesc>,
}

impl TaskRunParam {
    pub fn all_addrs(&self) -> impl Iterator<Item = &AddressDescriptor> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .chain(self.workspaces.iter())
    }

    pub fn io_slots(&self) -> IoSlots<AddressDescriptor> {
        IoSlots {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            workspaces: self.workspaces.clone(),
        }
    }
}

/// An I/O address as handed to `ArgsTask::init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct ClassifiedAddr {
    pub addr: u64,
    pub resolution: AddrResolution,
    pub trigger: RefreshTrigger,
}

impl ClassifiedAddr {
    pub fn category(&self) -> MemoryCategory {
        self.resolution.category
    }

    pub fn is_refreshable(&self) -> bool {
        self.trigger != RefreshTrigger::NoUpdate
    }
}

/// Where a task wrote an I/O address inside one of its argument regions.
/// Addresses are always stored as 8 little-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct AddrPosition {
    pub slot_type: SlotType,
    pub slot_index: usize,
    pub region: usize,
    pub offset: u64,
}

/// A task's window onto the model's argument buffers.
/// Every region access is bounds checked against the planned layout.
#[derive(Debug)]
pub struct TaskArgsView<'a> {
    args: &'a mut ModelArgsTable,
    entries: &'a [LayoutEntry],
}

impl<'a> TaskArgsView<'a> {
    pub(crate) fn new(args: &'a mut ModelArgsTable, entries: &'a [LayoutEntry]) -> Self {
        Self { args, entries }
    }

    pub fn num_regions(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, region: usize) -> Option<&LayoutEntry> {
        self.entries.get(region)
    }

    pub fn region_len(&self, region: usize) -> u64 {
        self.entry(region).map_or(0, |e| e.len)
    }

    fn checked_entry(&self, region: usize) -> Result<&LayoutEntry, InvariantError> {
        self.entries
            .get(region)
            .ok_or(InvariantError::OutOfBounds {
                offset: region as u64,
                len: 1,
                capacity: self.entries.len() as u64,
            })
    }

    /// Device address of the first byte of a region.
    pub fn device_addr(&self, region: usize) -> Result<DevicePtr, InvariantError> {
        let entry = self.checked_entry(region)?;
        Ok(self.args.device_ptr(entry.placement)?.offset(entry.offset))
    }

    pub fn host(&self, region: usize) -> Result<&[u8], InvariantError> {
        let entry = *self.checked_entry(region)?;
        self.args.host(entry.placement, entry.range())
    }

    pub fn host_mut(&mut self, region: usize) -> Result<&mut [u8], InvariantError> {
        let entry = *self.checked_entry(region)?;
        self.args.host_mut(entry.placement, entry.range())
    }

    pub fn write_addr(
        &mut self,
        region: usize,
        offset: u64,
        addr: u64,
    ) -> Result<(), InvariantError> {
        let host = self.host_mut(region)?;
        let capacity = host.len() as u64;
        let out_of_bounds = InvariantError::OutOfBounds {
            offset,
            len: 8,
            capacity,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds.clone())?;
        let dst = host
            .get_mut(start..start.saturating_add(8))
            .ok_or(out_of_bounds)?;
        dst.copy_from_slice(bytemuck::bytes_of(&addr.to_le()));
        Ok(())
    }

    pub fn read_addr(&self, region: usize, offset: u64) -> Result<u64, InvariantError> {
        let host = self.host(region)?;
        let out_of_bounds = InvariantError::OutOfBounds {
            offset,
            len: 8,
            capacity: host.len() as u64,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds.clone())?;
        let src = host
            .get(start..start.saturating_add(8))
            .ok_or(out_of_bounds)?;
        Ok(u64::from_le(bytemuck::pod_read_unaligned(src)))
    }
}

/// Everything a task needs to write its initial argument tables.
#[derive(Debug)]
pub struct TaskInitContext<'a> {
    pub task_index: usize,
    pub args: TaskArgsView<'a>,
    /// One device address per declared persistent workspace region.
    pub persistent_workspaces: RVec<DevicePtr>,
    pub io: &'a IoSlots<ClassifiedAddr>,
}

/// # ArgsTask
///
/// The capability every task kind implements to take part in argument management.
pub trait ArgsTask: std::fmt::Debug {
    fn kind(&self) -> TaskKind;

    /// Index of the graph node this task was generated from, if any.
    fn op_index(&self) -> Option<usize>;

    fn parse_run_param(&self) -> Result<TaskRunParam, TaskError>;

    /// Writes the initial argument tables, returns where every I/O address was placed.
    fn init(&mut self, ctx: TaskInitContext<'_>) -> Result<RVec<AddrPosition>, TaskError>;

    /// Rewrites the task's addresses for the current execution.
    fn update_host_args(
        &mut self,
        io: &IoSlots<u64>,
        args: &mut TaskArgsView<'_>,
    ) -> Result<(), TaskError>;

    fn update_dump_infos(&mut self, _args: &TaskArgsView<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    /// The addresses as they were last captured by [`ArgsTask::update_dump_infos`].
    fn dump_snapshot(&self) -> &[u64] {
        &[]
    }
}
