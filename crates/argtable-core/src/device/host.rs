use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use slotmap::SlotMap;

use crate::{
    execute_refresh, Align, DeviceError, DevicePtr, DeviceRuntime, Placement, RefreshIndex,
    RefreshKernelArgs, Stream, TaskHandle, ARGS_REFRESH_KERNEL,
};

//All slotmap keys are COPY
slotmap::new_key_type! { pub struct HostBufferHandle; }

/// Everything the host device was asked to do, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    Alloc {
        placement: Placement,
        ptr: DevicePtr,
        size: u64,
    },
    Free(DevicePtr),
    CopyH2D {
        dst: DevicePtr,
        len: u64,
        stream: Option<u32>,
    },
    Launch {
        name: String,
        block_dim: u32,
        stream: u32,
    },
    Synchronize(u32),
    UpdateSqe {
        handle: TaskHandle,
        ptr: DevicePtr,
        len: u64,
    },
}

#[derive(Debug)]
struct HostBuffer {
    base: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct HostDeviceState {
    buffers: SlotMap<HostBufferHandle, HostBuffer>,
    by_base: BTreeMap<u64, HostBufferHandle>,
    next_addr: [u64; 4],
    allocated: u64,
    capacity: Option<u64>,
    ops: Vec<DeviceOp>,
}

impl HostDeviceState {
    fn locate(&self, ptr: DevicePtr, len: u64) -> Result<(HostBufferHandle, usize), DeviceError> {
        let (_, handle) = self
            .by_base
            .range(..=ptr.addr())
            .next_back()
            .ok_or(DeviceError::InvalidAddress(ptr))?;
        let buffer = &self.buffers[*handle];
        let start = ptr.addr() - buffer.base;
        if start.saturating_add(len) > buffer.bytes.len() as u64 {
            return Err(DeviceError::OutOfBounds { addr: ptr, len });
        }
        Ok((*handle, start as usize))
    }

    fn read(&self, ptr: DevicePtr, len: u64) -> Result<&[u8], DeviceError> {
        let (handle, start) = self.locate(ptr, len)?;
        Ok(&self.buffers[handle].bytes[start..start + len as usize])
    }

    fn write(&mut self, ptr: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        let (handle, start) = self.locate(ptr, src.len() as u64)?;
        self.buffers[handle].bytes[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn run_args_refresh(&mut self, block_dim: u32, raw: &[u8]) -> Result<(), DeviceError> {
        let args: RefreshKernelArgs = bytemuck::try_pod_read_unaligned(raw)
            .map_err(|e| DeviceError::MalformedKernelArgs(e.to_string()))?;
        let padded = block_dim as u64 * args.tile as u64;
        let offsets: Vec<u64> = self
            .read(DevicePtr(args.offset_table), padded * 8)?
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let indices: Vec<RefreshIndex> = self
            .read(DevicePtr(args.index_table), padded * 8)?
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let bases: Vec<u64> = self
            .read(DevicePtr(args.base_table), args.num_bases as u64 * 8)?
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        let table = DevicePtr(args.args_table);
        let (handle, start) = self.locate(table, 0)?;
        let bytes = &mut self.buffers[handle].bytes[start..];
        execute_refresh(&args, block_dim, &offsets, &indices, &bases, bytes)
    }
}

/// # HostDevice
///
/// A device living in host memory. Addresses are stable and unique per placement, every
/// operation is recorded, and the argument refresh kernel is executed for real.
#[derive(Clone, Debug, Default)]
pub struct HostDevice {
    state: Arc<RwLock<HostDeviceState>>,
}

impl HostDevice {
    const ADDRESS_SPACE_STRIDE: u64 = 1 << 36;

    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations fail once `capacity` bytes are live.
    pub fn with_capacity(capacity: u64) -> Self {
        let device = Self::default();
        device.state.write().capacity = Some(capacity);
        device
    }

    pub fn read(&self, ptr: DevicePtr, len: u64) -> Result<Vec<u8>, DeviceError> {
        Ok(self.state.read().read(ptr, len)?.to_vec())
    }

    pub fn read_u64(&self, ptr: DevicePtr) -> Result<u64, DeviceError> {
        let state = self.state.read();
        Ok(u64::from_le(bytemuck::pod_read_unaligned(
            state.read(ptr, 8)?,
        )))
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.state.read().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.write().ops.clear();
    }

    pub fn num_live_allocations(&self) -> usize {
        self.state.read().buffers.len()
    }

    pub fn total_bytes_allocated(&self) -> u64 {
        self.state.read().allocated
    }
}

impl DeviceRuntime for HostDevice {
    fn alloc(&self, placement: Placement, size: u64) -> Result<DevicePtr, DeviceError> {
        if placement == Placement::Sqe {
            return Err(DeviceError::InvalidPlacement(placement));
        }
        let mut state = self.state.write();
        let failed = DeviceError::AllocationFailed { placement, size };
        if let Some(capacity) = state.capacity {
            if state.allocated.saturating_add(size) > capacity {
                return Err(failed);
            }
        }
        let reserved = size.max(1).align_for_memory().ok_or(failed.clone())?;
        let region = placement.index() as u64 + 1;
        let next = &mut state.next_addr[placement.index()];
        let base = region * Self::ADDRESS_SPACE_STRIDE + *next;
        *next = next.checked_add(reserved).ok_or(failed)?;

        let bytes = vec![0u8; size as usize];
        let handle = state.buffers.insert(HostBuffer { base, bytes });
        state.by_base.insert(base, handle);
        state.allocated += size;
        let ptr = DevicePtr(base);
        state.ops.push(DeviceOp::Alloc {
            placement,
            ptr,
            size,
        });
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut state = self.state.write();
        let handle = state
            .by_base
            .remove(&ptr.addr())
            .ok_or(DeviceError::InvalidAddress(ptr))?;
        if let Some(buffer) = state.buffers.remove(handle) {
            state.allocated -= buffer.bytes.len() as u64;
        }
        state.ops.push(DeviceOp::Free(ptr));
        Ok(())
    }

    fn copy_h2d(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.write();
        state.write(dst, src)?;
        state.ops.push(DeviceOp::CopyH2D {
            dst,
            len: src.len() as u64,
            stream: None,
        });
        Ok(())
    }

    fn copy_h2d_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: &Stream,
    ) -> Result<(), DeviceError> {
        // The host device completes work on submission, which satisfies stream ordering.
        let mut state = self.state.write();
        state.write(dst, src)?;
        state.ops.push(DeviceOp::CopyH2D {
            dst,
            len: src.len() as u64,
            stream: Some(stream.id),
        });
        Ok(())
    }

    fn launch_kernel(
        &self,
        name: &str,
        block_dim: u32,
        args: &[u8],
        stream: &Stream,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.write();
        match name {
            ARGS_REFRESH_KERNEL => state.run_args_refresh(block_dim, args)?,
            _ => return Err(DeviceError::KernelNotFound(name.to_string())),
        }
        state.ops.push(DeviceOp::Launch {
            name: name.to_string(),
            block_dim,
            stream: stream.id,
        });
        Ok(())
    }

    fn synchronize(&self, stream: &Stream) -> Result<(), DeviceError> {
        self.state.write().ops.push(DeviceOp::Synchronize(stream.id));
        Ok(())
    }

    fn update_sqe(
        &self,
        _stream: &Stream,
        handle: TaskHandle,
        ptr: DevicePtr,
        len: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.write();
        state.read(ptr, len)?;
        state.ops.push(DeviceOp::UpdateSqe { handle, ptr, len });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_addressable() -> anyhow::Result<()> {
        let device = HostDevice::new();
        let a = device.alloc(Placement::Hbm, 64)?;
        let b = device.alloc(Placement::Hbm, 8)?;
        let t = device.alloc(Placement::Ts, 8)?;
        assert!(b.addr() >= a.addr() + 64);
        assert_ne!(a.addr() >> 36, t.addr() >> 36);

        device.copy_h2d(a.offset(8), &42u64.to_le_bytes())?;
        assert_eq!(device.read_u64(a.offset(8))?, 42);
        assert!(matches!(
            device.copy_h2d(a.offset(60), &[0u8; 8]),
            Err(DeviceError::OutOfBounds { .. })
        ));

        device.free(a)?;
        assert!(matches!(
            device.read(a, 1),
            Err(DeviceError::InvalidAddress(_))
        ));
        assert_eq!(device.num_live_allocations(), 2);
        Ok(())
    }

    #[test]
    fn capacity_is_enforced() {
        let device = HostDevice::with_capacity(100);
        assert!(device.alloc(Placement::Hbm, 64).is_ok());
        assert_eq!(
            device.alloc(Placement::Ts, 64),
            Err(DeviceError::AllocationFailed {
                placement: Placement::Ts,
                size: 64
            })
        );
    }

    #[test]
    fn sqe_is_not_allocatable() {
        let device = HostDevice::new();
        assert_eq!(
            device.alloc(Placement::Sqe, 8),
            Err(DeviceError::InvalidPlacement(Placement::Sqe))
        );
    }
}
