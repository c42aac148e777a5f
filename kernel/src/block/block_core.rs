use super::block_error::BlockError;
use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kidneyvm_shared::sizes::SECTOR_SIZE;
use log::debug;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// Owned by another operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers.
///
/// Drivers synchronize internally: the swap layer issues I/O for different
/// sectors from several threads at once.
pub trait BlockOp: Send + Sync {
    /// Read one sector into `buf`, which holds exactly `BLOCK_SECTOR_SIZE` bytes.
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write one sector from `buf`, which holds exactly `BLOCK_SECTOR_SIZE` bytes.
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
    /// Capacity of the device in sectors.
    fn size(&self) -> BlockSector;
}

/// A block device
///
/// **Note:** Once blocks are made they are immutable
pub struct Block<D> {
    /// Tha name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: D,
    /// The size of the block device in sectors
    block_size: BlockSector,
    read_count: AtomicU32,
    write_count: AtomicU32,
}

impl<D: BlockOp> Block<D> {
    pub fn new(block_name: &str, block_type: BlockType, driver: D) -> Self {
        let block_size = driver.size();
        debug!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size
        );

        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid(buf.len()));
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds {
                sector,
                size: self.block_size,
            });
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        assert!(
            self.block_type != BlockType::Foreign,
            "Cannot write to foreign block"
        );

        self.driver.write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn get_driver(&self) -> &D {
        &self.driver
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl<D: BlockOp> fmt::Display for Block<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}
