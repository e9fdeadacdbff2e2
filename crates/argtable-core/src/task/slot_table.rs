use derive_new::new;

use crate::{
    AddrPosition, ArgsTask, IoSlots, RVec, TaskArgsView, TaskError, TaskInitContext, TaskKind,
    TaskRunParam,
};

const ADDR_BYTES: u64 = 8;

/// # SlotTableTask
///
/// A task whose primary argument region is a flat table of 64-bit addresses.
///
/// ```text
/// | inputs.. | outputs.. | workspaces.. | persistent workspaces.. | scalars.. |
/// ```
///
/// If the task declares a second region, its first word points at the primary region.
#[derive(Debug, Clone, new)]
pub struct SlotTableTask {
    kind: TaskKind,
    op_index: Option<usize>,
    param: TaskRunParam,
    scalars: Vec<u8>,
    #[new(default)]
    positions: RVec<AddrPosition>,
    #[new(default)]
    dump: Vec<u64>,
}

impl SlotTableTask {
    /// Bytes the primary region must hold.
    pub fn required_len(&self) -> u64 {
        let words = self.param.all_addrs().count() + self.param.persistent_workspace_descs.len();
        words as u64 * ADDR_BYTES + self.scalars.len() as u64
    }

    pub fn positions(&self) -> &[AddrPosition] {
        &self.positions
    }
}

impl ArgsTask for SlotTableTask {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn op_index(&self) -> Option<usize> {
        self.op_index
    }

    fn parse_run_param(&self) -> Result<TaskRunParam, TaskError> {
        Ok(self.param.clone())
    }

    fn init(&mut self, ctx: TaskInitContext<'_>) -> Result<RVec<AddrPosition>, TaskError> {
        let TaskInitContext {
            mut args,
            persistent_workspaces,
            io,
            ..
        } = ctx;
        let required = self.required_len();
        if required == 0 {
            return Ok(RVec::new());
        }
        let capacity = args.region_len(0);
        if capacity < required {
            return Err(TaskError::RegionTooSmall {
                region: 0,
                capacity,
                required,
            });
        }

        let mut cursor = 0;
        let mut positions = RVec::with_capacity(io.len());
        for (slot_type, slot_index, addr) in io.iter() {
            args.write_addr(0, cursor, addr.addr)?;
            positions.push(AddrPosition::new(slot_type, slot_index, 0, cursor));
            cursor += ADDR_BYTES;
        }
        for workspace in persistent_workspaces.iter() {
            args.write_addr(0, cursor, workspace.addr())?;
            cursor += ADDR_BYTES;
        }
        if !self.scalars.is_empty() {
            let end = cursor as usize + self.scalars.len();
            args.host_mut(0)?[cursor as usize..end].copy_from_slice(&self.scalars);
        }

        if args.region_len(1) >= ADDR_BYTES {
            let primary = args.device_addr(0)?;
            args.write_addr(1, 0, primary.addr())?;
        }

        self.positions = positions.clone();
        Ok(positions)
    }

    fn update_host_args(
        &mut self,
        io: &IoSlots<u64>,
        args: &mut TaskArgsView<'_>,
    ) -> Result<(), TaskError> {
        for position in self.positions.iter() {
            let addr = io
                .get(position.slot_type, position.slot_index)
                .ok_or(TaskError::MissingSlot {
                    slot_type: position.slot_type,
                    index: position.slot_index,
                })?;
            args.write_addr(position.region, position.offset, *addr)?;
        }
        Ok(())
    }

    fn update_dump_infos(&mut self, args: &TaskArgsView<'_>) -> Result<(), TaskError> {
        self.dump = self
            .positions
            .iter()
            .map(|p| args.read_addr(p.region, p.offset))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn dump_snapshot(&self) -> &[u64] {
        &self.dump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rvec, AddrResolution, AddressDescriptor, ArgsLayoutPlanner, ClassifiedAddr, DevicePtr,
        HostDevice, MemoryType, ModelArgsTable, Placement, RefreshTrigger, SlotType,
        TaskArgsDesc,
    };

    fn param(regions: RVec<TaskArgsDesc>) -> TaskRunParam {
        TaskRunParam {
            inputs: rvec![AddressDescriptor::new(0x1000, MemoryType::Hbm, true)],
            outputs: rvec![AddressDescriptor::new(0x2000, MemoryType::Hbm, true)],
            args_descs: regions,
            ..Default::default()
        }
    }

    fn classified(param: &TaskRunParam) -> IoSlots<ClassifiedAddr> {
        param.io_slots().map(|_, _, desc| {
            ClassifiedAddr::new(
                desc.logical_addr,
                AddrResolution::fixed(),
                RefreshTrigger::NoUpdate,
            )
        })
    }

    #[test]
    fn init_writes_addresses_then_scalars() -> anyhow::Result<()> {
        let regions = rvec![
            TaskArgsDesc::new(32, Placement::Hbm),
            TaskArgsDesc::new(8, Placement::Sqe)
        ];
        let param = param(regions.clone());
        let layout = ArgsLayoutPlanner::plan(&[RefreshTrigger::NoUpdate], &[regions], 0)?;
        let device = HostDevice::new();
        let mut table = ModelArgsTable::allocate(&device, &layout.partitions)?;

        let io = classified(&param);
        let mut task = SlotTableTask::new(TaskKind::Kernel, Some(0), param, vec![7; 4]);
        let positions = task.init(TaskInitContext {
            task_index: 0,
            args: TaskArgsView::new(&mut table, layout.task(0)),
            persistent_workspaces: rvec![DevicePtr(0xabc0)],
            io: &io,
        })?;
        assert_eq!(
            positions.as_slice(),
            &[
                AddrPosition::new(SlotType::Input, 0, 0, 0),
                AddrPosition::new(SlotType::Output, 0, 0, 8),
            ]
        );

        let view = TaskArgsView::new(&mut table, layout.task(0));
        assert_eq!(view.read_addr(0, 0)?, 0x1000);
        assert_eq!(view.read_addr(0, 8)?, 0x2000);
        assert_eq!(view.read_addr(0, 16)?, 0xabc0);
        assert_eq!(&view.host(0)?[24..28], &[7; 4]);
        assert_eq!(view.read_addr(1, 0)?, view.device_addr(0)?.addr());
        Ok(())
    }

    #[test]
    fn refresh_rewrites_recorded_positions() -> anyhow::Result<()> {
        let regions = rvec![TaskArgsDesc::new(16, Placement::Hbm)];
        let param = param(regions.clone());
        let layout = ArgsLayoutPlanner::plan(&[RefreshTrigger::OnFeatureMap], &[regions], 0)?;
        let device = HostDevice::new();
        let mut table = ModelArgsTable::allocate(&device, &layout.partitions)?;

        let io = classified(&param);
        let mut task = SlotTableTask::new(TaskKind::Kernel, None, param, vec![]);
        task.init(TaskInitContext {
            task_index: 0,
            args: TaskArgsView::new(&mut table, layout.task(0)),
            persistent_workspaces: rvec![],
            io: &io,
        })?;

        let mut view = TaskArgsView::new(&mut table, layout.task(0));
        let current = IoSlots {
            inputs: rvec![0x9000],
            outputs: rvec![0xa000],
            workspaces: rvec![],
        };
        task.update_host_args(&current, &mut view)?;
        task.update_dump_infos(&view)?;
        assert_eq!(task.dump_snapshot(), &[0x9000, 0xa000]);

        let missing = IoSlots {
            inputs: rvec![0x9000],
            ..Default::default()
        };
        assert!(matches!(
            task.update_host_args(&missing, &mut view),
            Err(TaskError::MissingSlot {
                slot_type: SlotType::Output,
                index: 0
            })
        ));
        Ok(())
    }

    #[test]
    fn short_region_is_rejected() -> anyhow::Result<()> {
        let regions = rvec![TaskArgsDesc::new(8, Placement::Hbm)];
        let param = param(regions.clone());
        let layout = ArgsLayoutPlanner::plan(&[RefreshTrigger::NoUpdate], &[regions], 0)?;
        let device = HostDevice::new();
        let mut table = ModelArgsTable::allocate(&device, &layout.partitions)?;
        let io = classified(&param);
        let mut task = SlotTableTask::new(TaskKind::Kernel, None, param, vec![]);
        let result = task.init(TaskInitContext {
            task_index: 0,
            args: TaskArgsView::new(&mut table, layout.task(0)),
            persistent_workspaces: rvec![],
            io: &io,
        });
        assert!(matches!(
            result,
            Err(TaskError::RegionTooSmall {
                capacity: 8,
                required: 16,
                ..
            })
        ));
        Ok(())
    }
}
