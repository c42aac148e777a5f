use crate::block::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

/// A block device backed by kernel memory.
///
/// Every sector has its own lock, so I/O to distinct sectors proceeds in
/// parallel.
pub struct RamDisk {
    sectors: Vec<Mutex<[u8; BLOCK_SECTOR_SIZE]>>,
    failing: AtomicBool,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: (0..sectors)
                .map(|_| Mutex::new([0; BLOCK_SECTOR_SIZE]))
                .collect(),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent transfer fail (or succeed again), the way a
    /// disk that dropped off the bus would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn sector(&self, sector: BlockSector) -> Result<&Mutex<[u8; BLOCK_SECTOR_SIZE]>, BlockError> {
        self.sectors
            .get(sector as usize)
            .ok_or(BlockError::SectorOutOfBounds {
                sector,
                size: self.size(),
            })
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        let len = buf.len();
        let data = self.sector(sector)?.lock();
        buf.get_mut(..BLOCK_SECTOR_SIZE)
            .ok_or(BlockError::BufferInvalid(len))?
            .copy_from_slice(&*data);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        let mut data = self.sector(sector)?.lock();
        data.copy_from_slice(
            buf.get(..BLOCK_SECTOR_SIZE)
                .ok_or(BlockError::BufferInvalid(buf.len()))?,
        );
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size(&self) -> BlockSector {
        self.sectors.len() as BlockSector
    }
}
