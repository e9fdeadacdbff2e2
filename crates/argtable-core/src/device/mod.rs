#[cfg(feature = "host-device")]
mod host;

#[cfg(feature = "host-device")]
pub use host::*;

use derive_new::new;

use crate::Placement;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to allocate {size} bytes of {placement} memory.")]
    AllocationFailed { placement: Placement, size: u64 },
    #[error("{0} memory cannot be allocated directly.")]
    InvalidPlacement(Placement),
    #[error("Address {0:?} does not belong to a live allocation.")]
    InvalidAddress(DevicePtr),
    #[error("Access of {len} bytes at {addr:?} is out of bounds.")]
    OutOfBounds { addr: DevicePtr, len: u64 },
    #[error("Kernel {0} is not registered.")]
    KernelNotFound(String),
    #[error("Malformed kernel arguments: {0}")]
    MalformedKernelArgs(String),
}

/// A device virtual address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl std::fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl DevicePtr {
    /// Wraps like rebased addresses do, the runtime rejects the result if it is not mapped.
    pub fn offset(&self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    pub fn addr(&self) -> u64 {
        self.0
    }
}

/// A device command stream. Work on one stream executes in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct Stream {
    pub id: u32,
}

/// Identifiers a task receives once it has been distributed onto a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, new)]
pub struct TaskHandle {
    pub stream_id: u32,
    pub task_id: u32,
}

/// # DeviceRuntime
///
/// The runtime primitives the argument manager consumes.
/// Nothing here is owned by the manager beyond the allocations it requests.
pub trait DeviceRuntime: std::fmt::Debug {
    fn alloc(&self, placement: Placement, size: u64) -> Result<DevicePtr, DeviceError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    fn copy_h2d(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError>;

    /// Ordered after all previously submitted work on `stream`.
    fn copy_h2d_async(&self, dst: DevicePtr, src: &[u8], stream: &Stream)
        -> Result<(), DeviceError>;

    fn launch_kernel(
        &self,
        name: &str,
        block_dim: u32,
        args: &[u8],
        stream: &Stream,
    ) -> Result<(), DeviceError>;

    fn synchronize(&self, stream: &Stream) -> Result<(), DeviceError>;

    /// Re-sends the submission queue entry arguments of an already distributed task.
    fn update_sqe(
        &self,
        stream: &Stream,
        handle: TaskHandle,
        addr: DevicePtr,
        len: u64,
    ) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_wrap_at_the_end_of_the_address_space() {
        assert_eq!(DevicePtr(0x1000).offset(0x40), DevicePtr(0x1040));
        assert_eq!(DevicePtr(u64::MAX).offset(2), DevicePtr(1));
    }
}
