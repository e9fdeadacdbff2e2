use derive_new::new;

use crate::{
    Align, DeviceError, DevicePtr, DeviceRuntime, Enforcer, FixedAddrGroup, InvariantError,
    Placement, SlotRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct FixedAddrPiece {
    pub slot: SlotRef,
    pub offset: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FixedAddrError {
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// # FixedAddrBulk
///
/// One side-memory allocation backing every fixed-address group. Both endpoints of a group
/// share a piece. Allocated once, never refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixedAddrBulk {
    device: Option<DevicePtr>,
    len: u64,
    pieces: Vec<FixedAddrPiece>,
}

impl FixedAddrBulk {
    pub fn allocate<D: DeviceRuntime>(
        device: &D,
        groups: &[FixedAddrGroup],
    ) -> Result<Self, FixedAddrError> {
        let mut pieces = Vec::new();
        let mut len = 0u64;
        for group in groups {
            let offset = len.align_for_memory().ok_or(InvariantError::Overflow {
                what: "fixed address bulk",
                lhs: len,
                rhs: u64::MEMORY_ALIGNMENT,
            })?;
            pieces.extend(group.slots.iter().map(|s| FixedAddrPiece::new(*s, offset)));
            len = Enforcer::checked_add("fixed address bulk", offset, group.size)?;
        }
        if len == 0 {
            return Ok(Self::default());
        }

        let ptr = device.alloc(Placement::Ts, len)?;
        log::info!(
            "Fixed address bulk: {} bytes for {} groups at {:?}",
            len,
            groups.len(),
            ptr
        );
        Ok(Self {
            device: Some(ptr),
            len,
            pieces,
        })
    }

    pub fn device(&self) -> Option<DevicePtr> {
        self.device
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pieces(&self) -> &[FixedAddrPiece] {
        &self.pieces
    }

    /// Device address backing `slot`, if it belongs to a fixed-address group.
    pub fn addr_of(&self, slot: SlotRef) -> Option<DevicePtr> {
        let base = self.device?;
        self.pieces
            .iter()
            .find(|p| p.slot == slot)
            .map(|p| base.offset(p.offset))
    }

    pub fn release<D: DeviceRuntime>(&mut self, device: &D) -> Result<(), DeviceError> {
        match self.device.take() {
            Some(ptr) => device.free(ptr),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rvec, HostDevice, SlotType};

    #[test]
    fn pieces_are_memory_aligned() -> anyhow::Result<()> {
        let a = SlotRef::new(0, SlotType::Output, 0);
        let b = SlotRef::new(1, SlotType::Input, 0);
        let c = SlotRef::new(2, SlotType::Output, 1);
        let groups = [
            FixedAddrGroup::new(rvec![a, b], 100),
            FixedAddrGroup::new(rvec![c], 8),
        ];
        let device = HostDevice::new();
        let mut bulk = FixedAddrBulk::allocate(&device, &groups)?;

        assert_eq!(bulk.len(), 520);
        let base = bulk.device().unwrap();
        assert_eq!(bulk.addr_of(a), Some(base));
        assert_eq!(bulk.addr_of(b), Some(base));
        assert_eq!(bulk.addr_of(c), Some(base.offset(512)));
        assert_eq!(bulk.addr_of(SlotRef::new(3, SlotType::Input, 0)), None);

        bulk.release(&device)?;
        assert_eq!(device.num_live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn no_groups_no_allocation() -> anyhow::Result<()> {
        let device = HostDevice::new();
        let bulk = FixedAddrBulk::allocate(&device, &[])?;
        assert!(bulk.is_empty());
        assert_eq!(device.num_live_allocations(), 0);
        Ok(())
    }
}
