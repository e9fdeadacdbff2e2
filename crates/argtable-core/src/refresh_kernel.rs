use bytemuck::{Pod, Zeroable};
use derive_new::new;

use crate::{
    div_ceil, BaseRef, DeviceError, DevicePtr, DeviceRuntime, Placement, RVec, Stream,
};

pub const ARGS_REFRESH_KERNEL: &str = "args_refresh";

/// Index entries with this base row are tile padding.
pub const SKIP_ROW: u32 = u32::MAX;

/// Launch arguments of the refresh kernel, as laid out in the raw argument blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RefreshKernelArgs {
    pub offset_table: u64,
    pub index_table: u64,
    pub base_table: u64,
    pub args_table: u64,
    pub num_slots: u32,
    pub tile: u32,
    pub num_bases: u32,
    pub _pad: u32,
}

/// Which active base a slot is relative to, and which 64-bit word of the argument table
/// it is written to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct RefreshIndex {
    pub base_row: u32,
    pub dst_word: u32,
}

impl RefreshIndex {
    pub fn skip() -> Self {
        Self {
            base_row: SKIP_ROW,
            dst_word: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KernelRefreshError {
    #[error("Address slot at byte {0} is not 8-byte aligned.")]
    Misaligned(u64),
    #[error("Address slot at byte {0} cannot be indexed with 32 bits.")]
    IndexOverflow(u64),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// How the slots are split across device cores.
///
/// Every core handles `tile` slots, a multiple of one 256-byte granule of offset entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, new)]
pub struct RefreshTiling {
    pub cores: u32,
    pub tile: u32,
}

impl RefreshTiling {
    pub const GRANULE_BYTES: u64 = 256;
    pub const ENTRIES_PER_GRANULE: u64 = Self::GRANULE_BYTES / 8;

    pub fn compute(num_slots: u64, max_cores: u32) -> Self {
        if num_slots == 0 || max_cores == 0 {
            return Self::default();
        }
        let per_core = div_ceil(num_slots, max_cores as u64);
        let tile = div_ceil(per_core, Self::ENTRIES_PER_GRANULE) * Self::ENTRIES_PER_GRANULE;
        let cores = div_ceil(num_slots, tile);
        Self::new(cores as u32, tile as u32)
    }

    pub fn padded_len(&self) -> usize {
        self.cores as usize * self.tile as usize
    }
}

/// Host side of the two refresh tables: one 64-bit offset and one index pair per slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshTables {
    pub offsets: Vec<u64>,
    pub indices: Vec<RefreshIndex>,
    pub num_slots: usize,
    pub tiling: RefreshTiling,
}

impl RefreshTables {
    /// `slots` yields the base of every address and its byte position in the argument table.
    pub fn build(
        slots: impl IntoIterator<Item = (BaseRef, u64)>,
        max_cores: u32,
    ) -> Result<Self, KernelRefreshError> {
        let mut offsets = Vec::new();
        let mut indices = Vec::new();
        for (base, position) in slots {
            if position % 8 != 0 {
                return Err(KernelRefreshError::Misaligned(position));
            }
            let dst_word =
                u32::try_from(position / 8).map_err(|_| KernelRefreshError::IndexOverflow(position))?;
            let base_row = u32::try_from(base.row)
                .ok()
                .filter(|r| *r != SKIP_ROW)
                .ok_or(KernelRefreshError::IndexOverflow(position))?;
            offsets.push(base.offset);
            indices.push(RefreshIndex { base_row, dst_word });
        }

        let num_slots = offsets.len();
        let tiling = RefreshTiling::compute(num_slots as u64, max_cores);
        offsets.resize(tiling.padded_len(), 0);
        indices.resize(tiling.padded_len(), RefreshIndex::skip());
        Ok(Self {
            offsets,
            indices,
            num_slots,
            tiling,
        })
    }

    /// Device bytes taken by both tables.
    pub fn footprint(&self) -> u64 {
        (self.offsets.len() * std::mem::size_of::<u64>()
            + self.indices.len() * std::mem::size_of::<RefreshIndex>()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.num_slots == 0
    }
}

/// Reference semantics of the refresh kernel: every core walks its tile and writes
/// `bases[row] + offset` into the argument table.
pub fn execute_refresh(
    args: &RefreshKernelArgs,
    block_dim: u32,
    offsets: &[u64],
    indices: &[RefreshIndex],
    bases: &[u64],
    args_table: &mut [u8],
) -> Result<(), DeviceError> {
    let malformed = |what: &str| DeviceError::MalformedKernelArgs(what.to_string());
    let num_slots = args.num_slots as usize;
    let tile = args.tile as usize;
    for core in 0..block_dim as usize {
        let start = core * tile;
        let end = (start + tile).min(num_slots);
        for i in start..end {
            let index = indices.get(i).ok_or_else(|| malformed("index table"))?;
            if index.base_row == SKIP_ROW {
                continue;
            }
            let base = bases
                .get(index.base_row as usize)
                .ok_or_else(|| malformed("base row"))?;
            let offset = offsets.get(i).ok_or_else(|| malformed("offset table"))?;
            let word = index.dst_word as usize * 8;
            let dst = args_table
                .get_mut(word..word + 8)
                .ok_or_else(|| malformed("destination word"))?;
            dst.copy_from_slice(bytemuck::bytes_of(&base.wrapping_add(*offset).to_le()));
        }
    }
    Ok(())
}

/// The refresh tables resident on the device, plus the table of active bases pushed before
/// every launch.
#[derive(Debug)]
pub struct KernelRefresh {
    offset_table: DevicePtr,
    index_table: DevicePtr,
    base_table: DevicePtr,
    args: RefreshKernelArgs,
    tiling: RefreshTiling,
}

impl KernelRefresh {
    pub fn upload<D: DeviceRuntime>(
        device: &D,
        tables: &RefreshTables,
        args_table: DevicePtr,
        num_bases: usize,
    ) -> Result<Self, KernelRefreshError> {
        let offset_bytes: &[u8] = bytemuck::cast_slice(&tables.offsets);
        let index_bytes: &[u8] = bytemuck::cast_slice(&tables.indices);
        let sizes = [
            offset_bytes.len() as u64,
            index_bytes.len() as u64,
            num_bases as u64 * 8,
        ];
        let mut ptrs: RVec<DevicePtr> = RVec::new();
        for size in sizes {
            match device.alloc(Placement::Hbm, size) {
                Ok(ptr) => ptrs.push(ptr),
                Err(e) => {
                    Self::free_all(device, &ptrs);
                    return Err(e.into());
                }
            }
        }
        let (offset_table, index_table, base_table) = (ptrs[0], ptrs[1], ptrs[2]);
        let copied = device
            .copy_h2d(offset_table, offset_bytes)
            .and_then(|_| device.copy_h2d(index_table, index_bytes));
        if let Err(e) = copied {
            Self::free_all(device, &ptrs);
            return Err(e.into());
        }

        let args = RefreshKernelArgs {
            offset_table: offset_table.addr(),
            index_table: index_table.addr(),
            base_table: base_table.addr(),
            args_table: args_table.addr(),
            num_slots: tables.num_slots as u32,
            tile: tables.tiling.tile,
            num_bases: num_bases as u32,
            _pad: 0,
        };
        log::info!(
            "Refresh kernel: {} slots over {} cores, {} bytes of tables",
            tables.num_slots,
            tables.tiling.cores,
            tables.footprint()
        );
        Ok(Self {
            offset_table,
            index_table,
            base_table,
            args,
            tiling: tables.tiling,
        })
    }

    fn free_all<D: DeviceRuntime>(device: &D, ptrs: &[DevicePtr]) {
        for ptr in ptrs {
            if let Err(e) = device.free(*ptr) {
                log::error!("Failed to free refresh table {:?}: {}", ptr, e);
            }
        }
    }

    pub fn tiling(&self) -> RefreshTiling {
        self.tiling
    }

    /// Pushes the active bases and launches. Both are ordered on `stream`, so consumers of the
    /// argument table enqueued afterwards observe the refreshed addresses.
    pub fn launch<D: DeviceRuntime>(
        &self,
        device: &D,
        bases: &[u64],
        stream: &Stream,
        asynchronous: bool,
    ) -> Result<(), DeviceError> {
        let base_bytes: &[u8] = bytemuck::cast_slice(bases);
        if asynchronous {
            device.copy_h2d_async(self.base_table, base_bytes, stream)?;
        } else {
            device.copy_h2d(self.base_table, base_bytes)?;
        }
        device.launch_kernel(
            ARGS_REFRESH_KERNEL,
            self.tiling.cores,
            bytemuck::bytes_of(&self.args),
            stream,
        )
    }

    pub fn release<D: DeviceRuntime>(&self, device: &D) -> Result<(), DeviceError> {
        device.free(self.offset_table)?;
        device.free(self.index_table)?;
        device.free(self.base_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn tiling_is_granule_aligned() {
        assert_eq!(RefreshTiling::compute(0, 48), RefreshTiling::new(0, 0));
        assert_eq!(RefreshTiling::compute(1, 48), RefreshTiling::new(1, 32));
        assert_eq!(RefreshTiling::compute(100, 48), RefreshTiling::new(4, 32));
        assert_eq!(RefreshTiling::compute(10_000, 48), RefreshTiling::new(45, 224));
    }

    #[proptest(cases = 256)]
    fn tiling_covers_every_slot(
        #[strategy(1u64..1_000_000)] num_slots: u64,
        #[strategy(1u32..64)] max_cores: u32,
    ) {
        let tiling = RefreshTiling::compute(num_slots, max_cores);
        assert!(tiling.cores <= max_cores);
        assert_eq!(tiling.tile as u64 % RefreshTiling::ENTRIES_PER_GRANULE, 0);
        assert!(tiling.padded_len() as u64 >= num_slots);
        assert!(((tiling.cores - 1) as u64 * tiling.tile as u64) < num_slots);
    }

    #[test]
    fn misaligned_slots_are_rejected() {
        let result = RefreshTables::build([(BaseRef::new(0, 0), 12)], 8);
        assert!(matches!(result, Err(KernelRefreshError::Misaligned(12))));
    }

    #[test]
    fn execute_writes_rebased_addresses() -> anyhow::Result<()> {
        let tables = RefreshTables::build(
            [
                (BaseRef::new(1, 0x10), 0),
                (BaseRef::new(0, 0x20), 16),
                (BaseRef::new(1, 0x30), 24),
            ],
            4,
        )?;
        assert_eq!(tables.num_slots, 3);
        assert_eq!(tables.offsets.len(), 32);
        assert_eq!(tables.footprint(), 32 * 16);

        let args = RefreshKernelArgs {
            num_slots: 3,
            tile: tables.tiling.tile,
            num_bases: 2,
            ..Default::default()
        };
        let mut table = vec![0xffu8; 32];
        execute_refresh(
            &args,
            tables.tiling.cores,
            &tables.offsets,
            &tables.indices,
            &[0x1000, 0x2000],
            &mut table,
        )?;
        let words: Vec<u64> = table
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
            .collect();
        assert_eq!(words[0], 0x2010);
        assert_eq!(words[1], u64::MAX);
        assert_eq!(words[2], 0x1020);
        assert_eq!(words[3], 0x2030);
        Ok(())
    }
}
