use std::ops::Range;

use strum::EnumCount;

use crate::{
    ArgsError, DeviceError, DevicePtr, DeviceRuntime, InvariantError, Partition, PartitionTable,
    Placement, RefreshTrigger, Stream,
};

/// The argument table of one placement: a host staging buffer and its device twin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArgs {
    pub placement: Placement,
    pub host: Vec<u8>,
    pub device: DevicePtr,
    pub partitions: [Partition; RefreshTrigger::COUNT],
}

impl ModelArgs {
    pub fn len(&self) -> u64 {
        self.host.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    fn slice_range(&self, range: &Range<u64>) -> Result<Range<usize>, InvariantError> {
        let out_of_bounds = InvariantError::OutOfBounds {
            offset: range.start,
            len: range.end.saturating_sub(range.start),
            capacity: self.len(),
        };
        if range.start > range.end || range.end > self.len() {
            return Err(out_of_bounds);
        }
        Ok(range.start as usize..range.end as usize)
    }
}

/// Every non-empty placement's argument table, indexed by placement.
#[derive(Debug, Default)]
pub struct ModelArgsTable {
    args: [Option<ModelArgs>; Placement::COUNT],
}

impl ModelArgsTable {
    /// Allocates a device buffer for every non-empty placement of `partitions`.
    /// On failure everything allocated so far is released again.
    pub fn allocate<D: DeviceRuntime>(
        device: &D,
        partitions: &PartitionTable,
    ) -> Result<Self, DeviceError> {
        let mut table = Self::default();
        for placement in partitions.non_empty_placements() {
            let len = partitions.placement_len(placement);
            let ptr = match device.alloc(placement, len) {
                Ok(ptr) => ptr,
                Err(e) => {
                    table.release(device);
                    return Err(e);
                }
            };
            log::info!("Allocated {} bytes of {} arguments at {:?}", len, placement, ptr);
            table.args[placement.index()] = Some(ModelArgs {
                placement,
                host: vec![0u8; len as usize],
                device: ptr,
                partitions: *partitions.row(placement),
            });
        }
        Ok(table)
    }

    pub fn get(&self, placement: Placement) -> Option<&ModelArgs> {
        self.args[placement.index()].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelArgs> {
        self.args.iter().flatten()
    }

    fn checked(&self, placement: Placement) -> Result<&ModelArgs, InvariantError> {
        self.get(placement)
            .ok_or(InvariantError::MissingArgsTable(placement))
    }

    pub fn device_ptr(&self, placement: Placement) -> Result<DevicePtr, InvariantError> {
        Ok(self.checked(placement)?.device)
    }

    pub fn host(&self, placement: Placement, range: Range<u64>) -> Result<&[u8], InvariantError> {
        let args = self.checked(placement)?;
        let range = args.slice_range(&range)?;
        Ok(&args.host[range])
    }

    pub fn host_mut(
        &mut self,
        placement: Placement,
        range: Range<u64>,
    ) -> Result<&mut [u8], InvariantError> {
        let args = self.args[placement.index()]
            .as_mut()
            .ok_or(InvariantError::MissingArgsTable(placement))?;
        let range = args.slice_range(&range)?;
        Ok(&mut args.host[range])
    }

    /// Pushes `range` of a placement's host buffer to the device.
    pub fn push<D: DeviceRuntime>(
        &self,
        device: &D,
        placement: Placement,
        range: Range<u64>,
        stream: Option<&Stream>,
    ) -> Result<(), ArgsError> {
        let dst = self.device_ptr(placement)?.offset(range.start);
        let src = self.host(placement, range)?;
        match stream {
            Some(stream) => device.copy_h2d_async(dst, src, stream)?,
            None => device.copy_h2d(dst, src)?,
        }
        Ok(())
    }

    /// Frees every device buffer. Failures are logged, the table is emptied regardless.
    pub fn release<D: DeviceRuntime>(&mut self, device: &D) {
        for args in self.args.iter_mut().filter_map(Option::take) {
            if let Err(e) = device.free(args.device) {
                log::error!("Failed to free {} argument table: {}", args.placement, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, ArgsLayoutPlanner, HostDevice, TaskArgsDesc};

    #[test]
    fn only_non_empty_placements_are_allocated() -> anyhow::Result<()> {
        let layout = ArgsLayoutPlanner::plan(
            &[RefreshTrigger::OnFeatureMap],
            &[rvec![
                TaskArgsDesc::new(16, Placement::Sqe),
                TaskArgsDesc::new(8, Placement::Ts)
            ]],
            0,
        )?;
        let device = HostDevice::new();
        let mut table = ModelArgsTable::allocate(&device, &layout.partitions)?;

        assert_eq!(table.iter().count(), 2);
        assert_eq!(table.get(Placement::Hbm).map(|a| a.len()), Some(64));
        assert!(table.get(Placement::Sqe).is_none());
        assert_eq!(
            table.device_ptr(Placement::HostSvm),
            Err(InvariantError::MissingArgsTable(Placement::HostSvm))
        );
        assert!(matches!(
            table.host(Placement::Ts, 60..72),
            Err(InvariantError::OutOfBounds { .. })
        ));

        table.host_mut(Placement::Hbm, 0..4)?.copy_from_slice(&[1, 2, 3, 4]);
        table.push(&device, Placement::Hbm, 0..64, None)?;
        let ptr = table.device_ptr(Placement::Hbm)?;
        assert_eq!(device.read(ptr, 4)?, vec![1, 2, 3, 4]);

        table.release(&device);
        assert_eq!(device.num_live_allocations(), 0);
        assert_eq!(table.iter().count(), 0);
        Ok(())
    }

    #[test]
    fn failed_allocation_releases_earlier_buffers() -> anyhow::Result<()> {
        let layout = ArgsLayoutPlanner::plan(
            &[RefreshTrigger::NoUpdate, RefreshTrigger::NoUpdate],
            &[
                rvec![TaskArgsDesc::new(8, Placement::Hbm)],
                rvec![TaskArgsDesc::new(128, Placement::Ts)],
            ],
            0,
        )?;
        let device = HostDevice::with_capacity(100);
        assert!(ModelArgsTable::allocate(&device, &layout.partitions).is_err());
        assert_eq!(device.num_live_allocations(), 0);
        Ok(())
    }
}
