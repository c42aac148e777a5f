pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

/// Sector size of every block device we drive (IDE, and most USB/SCSI disks).
pub const SECTOR_SIZE: u32 = 512;
/// Sectors in the default swap partition (4MB).
pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: u32 = SECTOR_SIZE * SWAP_SECTORS;
