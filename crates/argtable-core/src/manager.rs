use derive_new::new;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};

use crate::{
    AddrPosition, AddrResolution, Align, Allocation, ArgsConfig, ArgsLayoutPlanner, ArgsTask,
    ClassifiedAddr, ClassifyError, DeviceError, DevicePtr, DeviceRuntime, Enforcer,
    ExecutionStage, FixedAddrBulk, FixedAddrError, InvariantError, IoSlots, KernelRefresh,
    KernelRefreshError, LayoutError, LayoutResult, MemoryClassifier, ModelArgsTable, Placement,
    PolicySelector, RVec, RefreshClassification, RefreshTables, RefreshTiling, RefreshTrigger,
    RemapIndex, RemapReport, SlotRef, Stream, TaskArgsView, TaskError, TaskGraph, TaskHandle,
    TaskInitContext, TaskRefreshClassifier, TaskRunParam, TensorOccupancy, UpdatePolicy,
    UpdatePolicyTable,
};

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    FixedAddr(#[from] FixedAddrError),
    #[error(transparent)]
    KernelRefresh(#[from] KernelRefreshError),
    #[error("Task {task} failed: {source}")]
    Task {
        task: usize,
        #[source]
        source: TaskError,
    },
    #[error("Task index {0} is out of range.")]
    UnknownTask(usize),
    #[error("Task {0} has SQE arguments but was never distributed.")]
    MissingTaskHandle(usize),
    #[error("Host input is {actual} bytes, the model expects {expected}.")]
    HostInputSize { expected: u64, actual: u64 },
    #[error("The argument manager has been torn down.")]
    Released,
}

impl ArgsError {
    fn task(task: usize) -> impl FnOnce(TaskError) -> ArgsError {
        move |source| ArgsError::Task { task, source }
    }
}

/// Everything the manager needs to know about a compiled model besides its tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, new)]
#[serde(default)]
pub struct ModelDesc {
    pub allocations: Vec<Allocation>,
    /// First fusion segment row. `None` if there are none.
    pub fusion_start_id: Option<usize>,
    pub host_input_size: u64,
    pub tensor_occupancy: Vec<TensorOccupancy>,
}

impl ModelDesc {
    pub fn fusion_start(&self) -> usize {
        self.fusion_start_id.unwrap_or(self.allocations.len())
    }
}

#[derive(Debug, Clone)]
struct TaskSlots {
    io: IoSlots<ClassifiedAddr>,
    positions: RVec<AddrPosition>,
}

impl TaskSlots {
    /// Refreshable addresses are rebased, everything else keeps its initial address.
    fn rebased(&self, bases: &[u64]) -> IoSlots<u64> {
        self.io.map(|_, _, slot| match slot.resolution.base {
            Some(base) if slot.is_refreshable() => bases
                .get(base.row)
                .map_or(slot.addr, |b| b.wrapping_add(base.offset)),
            _ => slot.addr,
        })
    }
}

/// # ArgsManager
///
/// Owns every argument table of one loaded model.
///
/// `init` drives the classifiers and the planner, allocates the tables and lets every task
/// write its initial arguments. `update_for_execute` then runs once per execution: it picks
/// the cheapest sufficient policy, refreshes the affected host bytes and pushes them, or lets
/// the refresh kernel rewrite the device table directly.
#[derive(Debug)]
pub struct ArgsManager<D: DeviceRuntime> {
    device: D,
    config: ArgsConfig,
    tasks: Vec<Box<dyn ArgsTask>>,
    allocations: Vec<Allocation>,
    refresh: RefreshClassification,
    slots: Vec<TaskSlots>,
    layout: LayoutResult,
    args: ModelArgsTable,
    fixed_addr: FixedAddrBulk,
    persistent: Vec<DevicePtr>,
    policies: UpdatePolicyTable,
    selector: PolicySelector,
    kernel: Option<KernelRefresh>,
    remap: RemapIndex,
    task_handles: FxHashMap<usize, TaskHandle>,
    last_bases: Option<Vec<u64>>,
    last_host_input: Option<Vec<u8>>,
    released: bool,
}

impl<D: DeviceRuntime> ArgsManager<D> {
    /// On failure every device allocation made so far is released.
    pub fn init(
        device: D,
        config: ArgsConfig,
        desc: ModelDesc,
        tasks: Vec<Box<dyn ArgsTask>>,
        graph: &dyn TaskGraph,
    ) -> Result<Self, ArgsError> {
        let num_rows = desc.allocations.len();
        let mut manager = Self {
            device,
            config,
            tasks,
            allocations: Vec::new(),
            refresh: RefreshClassification::default(),
            slots: Vec::new(),
            layout: LayoutResult::default(),
            args: ModelArgsTable::default(),
            fixed_addr: FixedAddrBulk::default(),
            persistent: Vec::new(),
            policies: UpdatePolicyTable::default(),
            selector: PolicySelector::default(),
            kernel: None,
            remap: RemapIndex::new(num_rows, &desc.tensor_occupancy),
            task_handles: FxHashMap::default(),
            last_bases: None,
            last_host_input: None,
            released: false,
        };

        let params = manager
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| task.parse_run_param().map_err(ArgsError::task(i)))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, task) in manager.tasks.iter().enumerate() {
            if graph.task_kind(i).is_some_and(|k| k != task.kind()) {
                log::warn!(
                    "Task {} is a {} but the graph reports {:?}",
                    i,
                    task.kind(),
                    graph.task_kind(i)
                );
            }
        }

        let classifier = MemoryClassifier::new(&desc.allocations, desc.fusion_start())?;
        let resolved = classifier.classify_by_task_params(&params);
        manager.refresh = TaskRefreshClassifier::classify(
            graph,
            &params,
            &resolved,
            manager.config.fm_refreshable,
        )?;
        manager.fixed_addr =
            FixedAddrBulk::allocate(&manager.device, &manager.refresh.fixed_addr_groups)?;

        let triggers = manager.refresh.triggers();
        let args_descs: Vec<_> = params.iter().map(|p| p.args_descs.clone()).collect();
        manager.layout = ArgsLayoutPlanner::plan(&triggers, &args_descs, desc.host_input_size)?;
        manager.args = ModelArgsTable::allocate(&manager.device, &manager.layout.partitions)?;
        let workspaces = manager.allocate_persistent_workspaces(&params)?;

        for (task_index, param) in params.iter().enumerate() {
            let types = &manager.refresh.task_types[task_index];
            let fixed_addr = &manager.fixed_addr;
            let io = param.io_slots().map(|slot_type, slot_index, desc| {
                let slot = SlotRef::new(task_index, slot_type, slot_index);
                let resolution = resolved
                    .get(&MemoryClassifier::key(desc))
                    .copied()
                    .unwrap_or_else(AddrResolution::fixed);
                let trigger = types
                    .slots
                    .get(slot_type, slot_index)
                    .copied()
                    .unwrap_or_default();
                let addr = fixed_addr
                    .addr_of(slot)
                    .map_or(desc.logical_addr, |p| p.addr());
                ClassifiedAddr::new(addr, resolution, trigger)
            });
            let ctx = TaskInitContext {
                task_index,
                args: TaskArgsView::new(&mut manager.args, manager.layout.task(task_index)),
                persistent_workspaces: workspaces[task_index].clone(),
                io: &io,
            };
            let positions = manager.tasks[task_index]
                .init(ctx)
                .map_err(ArgsError::task(task_index))?;
            manager.slots.push(TaskSlots { io, positions });
        }

        manager.policies = UpdatePolicyTable::build(&manager.layout, &triggers);
        manager.selector = PolicySelector::new(
            classifier.row_categories(),
            manager.refresh.has_trigger(RefreshTrigger::OnFeatureMapAndIO),
        );
        manager.allocations = desc.allocations;
        manager.kernel = manager.build_kernel_refresh()?;

        log::info!(
            "Argument manager ready: {} tasks, {} fixed address groups, kernel refresh {}",
            manager.tasks.len(),
            manager.refresh.fixed_addr_groups.len(),
            manager.kernel.is_some()
        );
        Ok(manager)
    }

    /// One allocation per placement, every region 64-byte aligned inside it.
    fn allocate_persistent_workspaces(
        &mut self,
        params: &[TaskRunParam],
    ) -> Result<Vec<RVec<DevicePtr>>, ArgsError> {
        let mut cursors = [0u64; Placement::COUNT];
        let mut planned: Vec<RVec<(Placement, u64)>> = Vec::with_capacity(params.len());
        for param in params {
            let mut regions = RVec::new();
            for desc in param.persistent_workspace_descs.iter() {
                let placement = desc.placement.physical();
                let cursor = &mut cursors[placement.index()];
                let offset = cursor.align_to(u64::ARGS_ALIGNMENT).ok_or(
                    InvariantError::Overflow {
                        what: "persistent workspace",
                        lhs: *cursor,
                        rhs: u64::ARGS_ALIGNMENT,
                    },
                )?;
                *cursor = Enforcer::checked_add("persistent workspace", offset, desc.length)?;
                regions.push((placement, offset));
            }
            planned.push(regions);
        }

        let mut bases = [None; Placement::COUNT];
        for placement in Placement::iter() {
            let len = cursors[placement.index()];
            if len == 0 {
                continue;
            }
            let ptr = self.device.alloc(placement, len)?;
            log::info!("Persistent workspace: {} bytes of {}", len, placement);
            self.persistent.push(ptr);
            bases[placement.index()] = Some(ptr);
        }

        Ok(planned
            .into_iter()
            .map(|regions| {
                regions
                    .into_iter()
                    .filter_map(|(p, offset)| bases[p.index()].map(|b| b.offset(offset)))
                    .collect()
            })
            .collect())
    }

    /// The refresh kernel pays off only for large dynamic HBM tables, and only rewrites HBM.
    fn build_kernel_refresh(&self) -> Result<Option<KernelRefresh>, ArgsError> {
        if !self.config.kernel_refresh {
            return Ok(None);
        }
        let dynamic_bytes = self
            .policies
            .get(UpdatePolicy::UpdateFmAndModelIO)
            .copy_bytes(Placement::Hbm);
        if dynamic_bytes <= self.config.kernel_refresh_min_bytes {
            return Ok(None);
        }

        let mut slots = Vec::new();
        for refresh in self.policies.get(UpdatePolicy::UpdateFmAndModelIO).refresh.iter() {
            let task_slots = &self.slots[refresh.task_index];
            let entries = self.layout.task(refresh.task_index);
            for position in task_slots.positions.iter() {
                let Some(slot) = task_slots.io.get(position.slot_type, position.slot_index) else {
                    continue;
                };
                let Some(base) = slot.resolution.base.filter(|_| slot.is_refreshable()) else {
                    continue;
                };
                match entries.get(position.region) {
                    Some(entry) if entry.placement == Placement::Hbm => {
                        slots.push((base, entry.offset + position.offset))
                    }
                    _ => {
                        log::warn!(
                            "Task {} refreshes addresses outside HBM, using host refresh",
                            refresh.task_index
                        );
                        return Ok(None);
                    }
                }
            }
        }

        let tables = match RefreshTables::build(slots, self.config.max_refresh_cores) {
            Ok(tables) if tables.is_empty() => return Ok(None),
            Ok(tables) => tables,
            Err(e @ KernelRefreshError::Misaligned(_))
            | Err(e @ KernelRefreshError::IndexOverflow(_)) => {
                log::warn!("{}, using host refresh", e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let args_table = self.args.device_ptr(Placement::Hbm)?;
        Ok(Some(KernelRefresh::upload(
            &self.device,
            &tables,
            args_table,
            self.allocations.len(),
        )?))
    }

    /// Brings the device argument tables up to date for one execution.
    ///
    /// `active_bases` holds the base address of every allocation row for this run. Returns the
    /// policy that was applied. On failure nothing about the previous execution is forgotten,
    /// so a retry selects the same or a stronger policy.
    pub fn update_for_execute(
        &mut self,
        active_bases: &[u64],
        host_input: Option<&[u8]>,
        hint: Option<UpdatePolicy>,
        stream: &Stream,
        stage: ExecutionStage,
    ) -> Result<UpdatePolicy, ArgsError> {
        if self.released {
            return Err(ArgsError::Released);
        }
        Enforcer::check_base_table(self.allocations.len(), active_bases)?;

        let selected = match stage {
            ExecutionStage::Load => UpdatePolicy::InitOneTime,
            ExecutionStage::Run => self.selector.select(self.last_bases.as_deref(), active_bases),
        };
        let mut policy = selected.max(hint.unwrap_or_default());
        let asynchronous = stage == ExecutionStage::Run && self.config.is_async();
        let copy_stream = asynchronous.then_some(stream);

        let host_input_changed = match (host_input, self.layout.host_input) {
            (None, _) => false,
            (Some(bytes), Some(entry)) => {
                if bytes.len() as u64 != entry.len {
                    return Err(ArgsError::HostInputSize {
                        expected: entry.len,
                        actual: bytes.len() as u64,
                    });
                }
                let changed = policy == UpdatePolicy::InitOneTime
                    || self.last_host_input.as_deref() != Some(bytes);
                if changed {
                    self.args
                        .host_mut(entry.placement, entry.range())?
                        .copy_from_slice(bytes);
                }
                changed
            }
            (Some(bytes), None) => {
                return Err(ArgsError::HostInputSize {
                    expected: 0,
                    actual: bytes.len() as u64,
                })
            }
        };

        let use_kernel = policy.refreshes_addresses() && self.kernel.is_some();
        let entry = self.policies.get(policy);
        if use_kernel && self.config.dump_enabled {
            log::debug!(
                "{} runs on the refresh kernel, dump infos of {} tasks are not refreshed",
                policy,
                entry.refresh.len()
            );
        }
        if !use_kernel {
            for refresh in entry.refresh.iter() {
                let task_index = refresh.task_index;
                let io = self.slots[task_index].rebased(active_bases);
                let mut view = TaskArgsView::new(&mut self.args, self.layout.task(task_index));
                let task = &mut self.tasks[task_index];
                task.update_host_args(&io, &mut view)
                    .map_err(ArgsError::task(task_index))?;
                if self.config.dump_enabled {
                    task.update_dump_infos(&view)
                        .map_err(ArgsError::task(task_index))?;
                }
            }
        }

        for copy in entry.copies.iter() {
            if use_kernel && copy.placement == Placement::Hbm {
                continue;
            }
            self.args
                .push(&self.device, copy.placement, copy.range.clone(), copy_stream)?;
        }
        if let Some(kernel) = self.kernel.as_ref().filter(|_| use_kernel) {
            kernel.launch(&self.device, active_bases, stream, asynchronous)?;
        }

        let pushes_host_input = matches!(
            policy,
            UpdatePolicy::InitOneTime | UpdatePolicy::UpdateHostInput
        );
        if host_input_changed && !pushes_host_input {
            for copy in self.policies.get(UpdatePolicy::UpdateHostInput).copies.iter() {
                self.args
                    .push(&self.device, copy.placement, copy.range.clone(), copy_stream)?;
            }
            policy = policy.max(UpdatePolicy::UpdateHostInput);
        }

        for sqe in entry.sqe_updates.iter() {
            let Some(handle) = self.task_handles.get(&sqe.task_index) else {
                if stage == ExecutionStage::Load {
                    continue;
                }
                return Err(ArgsError::MissingTaskHandle(sqe.task_index));
            };
            let region = self.layout.task(sqe.task_index)[sqe.region];
            let ptr = self.args.device_ptr(region.placement)?.offset(region.offset);
            self.device.update_sqe(stream, *handle, ptr, region.len)?;
        }

        if !asynchronous && use_kernel {
            self.device.synchronize(stream)?;
        }

        #[cfg(feature = "debug")]
        self.dump_tables(policy);

        log::debug!(
            "Execution refreshed with {} (selected {}, hint {:?}, kernel {})",
            policy,
            selected,
            hint,
            use_kernel
        );
        self.last_bases = Some(active_bases.to_vec());
        if host_input_changed {
            self.last_host_input = host_input.map(<[u8]>::to_vec);
        }
        Ok(policy)
    }

    #[cfg(feature = "debug")]
    fn dump_tables(&self, policy: UpdatePolicy) {
        for args in self.args.iter() {
            let words: Vec<String> = args
                .host
                .chunks_exact(8)
                .map(|w| format!("{:#x}", u64::from_le(bytemuck::pod_read_unaligned(w))))
                .collect();
            log::debug!("{} after {}: {:?}", args.placement, policy, words);
        }
    }

    /// Records the stream identifiers a task received, for SQE updates.
    pub fn on_task_distributed(
        &mut self,
        task_index: usize,
        handle: TaskHandle,
    ) -> Result<(), ArgsError> {
        if task_index >= self.tasks.len() {
            return Err(ArgsError::UnknownTask(task_index));
        }
        self.task_handles.insert(task_index, handle);
        Ok(())
    }

    /// Reconciles a physical remap of `len` bytes at `va`. The result is advisory: callers
    /// that get anything but `Supported` should hint `InitOneTime` on the next execution.
    pub fn pa_remapped(&self, va: u64, new_pa: u64, len: u64) -> RemapReport {
        let logical: Vec<u64>;
        let bases = match self.last_bases.as_deref() {
            Some(bases) => bases,
            None => {
                logical = self.allocations.iter().map(|a| a.logical_addr).collect();
                &logical
            }
        };
        let report = self.remap.query(&self.allocations, bases, va, len);
        log::debug!(
            "Remap {:#x}+{:#x} -> {:#x}: {} over {} allocations",
            va,
            len,
            new_pa,
            report.result,
            report.overlaps.len()
        );
        report
    }

    /// Host staging copies of the argument tables.
    ///
    /// When the refresh kernel rewrote addresses on the device, the host bytes of the
    /// refreshed partitions still hold the addresses of the last host refresh.
    pub fn model_args(&self) -> &ModelArgsTable {
        &self.args
    }

    pub fn fixed_addr_bulk(&self) -> &FixedAddrBulk {
        &self.fixed_addr
    }

    pub fn layout(&self) -> &LayoutResult {
        &self.layout
    }

    pub fn policy_table(&self) -> &UpdatePolicyTable {
        &self.policies
    }

    pub fn refresh_classification(&self) -> &RefreshClassification {
        &self.refresh
    }

    pub fn kernel_tiling(&self) -> Option<RefreshTiling> {
        self.kernel.as_ref().map(KernelRefresh::tiling)
    }

    /// Addresses a task last captured for dumping. Empty unless dumping is enabled.
    pub fn dump_snapshot(&self, task_index: usize) -> Option<&[u64]> {
        self.tasks.get(task_index).map(|t| t.dump_snapshot())
    }

    pub fn task_positions(&self, task_index: usize) -> &[AddrPosition] {
        self.slots
            .get(task_index)
            .map_or(&[], |s| s.positions.as_slice())
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Frees every device allocation. Idempotent.
    /// All allocations are attempted, the first failure is reported.
    pub fn teardown(&mut self) -> Result<(), ArgsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let mut result = Ok(());
        if let Some(kernel) = self.kernel.take() {
            result = result.and(kernel.release(&self.device));
        }
        result = result.and(self.fixed_addr.release(&self.device));
        for ptr in self.persistent.drain(..) {
            result = result.and(self.device.free(ptr));
        }
        self.args.release(&self.device);
        log::debug!("Argument manager torn down");
        result.map_err(ArgsError::from)
    }
}

impl<D: DeviceRuntime> Drop for ArgsManager<D> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("Failed to release argument tables: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rvec, AddressDescriptor, AllocationId, AllocationKind, HostDevice, MemoryType,
        SlotTableTask, StaticTaskGraph, TaskArgsDesc, TaskKind,
    };

    fn model() -> ModelDesc {
        ModelDesc::new(
            vec![Allocation::new(
                AllocationId(0),
                0x1000,
                0x1000,
                AllocationKind::FeatureMap,
                MemoryType::Hbm,
            )],
            None,
            0,
            vec![],
        )
    }

    fn task() -> Box<dyn ArgsTask> {
        let param = TaskRunParam {
            inputs: rvec![AddressDescriptor::new(0x1010, MemoryType::Hbm, true)],
            args_descs: rvec![TaskArgsDesc::new(16, Placement::Hbm)],
            persistent_workspace_descs: rvec![TaskArgsDesc::new(100, Placement::Ts)],
            ..Default::default()
        };
        Box::new(SlotTableTask::new(TaskKind::Kernel, Some(0), param, vec![]))
    }

    #[test]
    fn teardown_releases_everything() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = HostDevice::new();
        let graph = StaticTaskGraph::new(vec![TaskKind::Kernel]);
        let mut manager = ArgsManager::init(
            device.clone(),
            ArgsConfig::default(),
            model(),
            vec![task()],
            &graph,
        )?;
        assert_eq!(device.num_live_allocations(), 2);

        manager.teardown()?;
        assert_eq!(device.num_live_allocations(), 0);
        manager.teardown()?;
        assert!(matches!(
            manager.update_for_execute(
                &[0x1000],
                None,
                None,
                &Stream::new(0),
                ExecutionStage::Run
            ),
            Err(ArgsError::Released)
        ));
        Ok(())
    }

    #[test]
    fn drop_releases_everything() -> anyhow::Result<()> {
        let device = HostDevice::new();
        let graph = StaticTaskGraph::new(vec![TaskKind::Kernel]);
        let manager = ArgsManager::init(
            device.clone(),
            ArgsConfig::default(),
            model(),
            vec![task()],
            &graph,
        )?;
        drop(manager);
        assert_eq!(device.num_live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn failed_init_releases_everything() {
        let device = HostDevice::with_capacity(80);
        let graph = StaticTaskGraph::new(vec![TaskKind::Kernel]);
        let result = ArgsManager::init(
            device.clone(),
            ArgsConfig::default(),
            model(),
            vec![task()],
            &graph,
        );
        assert!(matches!(
            result,
            Err(ArgsError::Device(DeviceError::AllocationFailed { .. }))
        ));
        assert_eq!(device.num_live_allocations(), 0);
    }

    #[test]
    fn base_table_must_match_allocations() -> anyhow::Result<()> {
        let graph = StaticTaskGraph::new(vec![TaskKind::Kernel]);
        let mut manager = ArgsManager::init(
            HostDevice::new(),
            ArgsConfig::default(),
            model(),
            vec![task()],
            &graph,
        )?;
        let result =
            manager.update_for_execute(&[], None, None, &Stream::new(0), ExecutionStage::Load);
        assert!(matches!(
            result,
            Err(ArgsError::Invariant(InvariantError::BaseTableMismatch {
                expected: 1,
                actual: 0
            }))
        ));
        Ok(())
    }
}
