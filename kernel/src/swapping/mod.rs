pub mod page_replacement;

use crate::block::{Block, BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use bitvec::vec::BitVec;
use core::fmt;
use kidneyvm_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, error};

/// Sectors per swap slot. A slot holds exactly one page image.
pub const BLOCKS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Handle to an occupied swap slot.
///
/// Slot `i` occupies sectors `[i * BLOCKS_PER_PAGE, (i + 1) * BLOCKS_PER_PAGE)`
/// of the swap device. There is no header: a slot is a raw page image.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SwapSlot(usize);

impl SwapSlot {
    #[cfg(test)]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sector(self, block: usize) -> BlockSector {
        (self.0 * BLOCKS_PER_PAGE + block) as BlockSector
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fixed-slot page store on a raw block device.
///
/// Slot bookkeeping happens under the bitmap lock; the device transfers run
/// outside it. A slot is marked occupied before its image is written and
/// stays occupied until its image has been read back, so no slot is ever
/// handed out twice.
pub struct SwapSpace<D> {
    block: Block<D>,
    /// One bit per slot, set = occupied.
    bitmap: Mutex<BitVec>,
}

impl<D: BlockOp> SwapSpace<D> {
    pub fn new(block: Block<D>) -> Self {
        let slots = block.get_size() as usize / BLOCKS_PER_PAGE;
        debug!("swap: {} holds {} page slots", block.get_name(), slots);

        Self {
            block,
            bitmap: Mutex::new(BitVec::repeat(false, slots)),
        }
    }

    /// Persist one page image to the lowest free slot.
    ///
    /// Panics if every slot is occupied: there is nothing else to evict swap
    /// space to. If the device fails the slot is released again.
    pub fn write_out(&self, page: &[u8]) -> Result<SwapSlot, BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE, "swap images are one page");
        let slot = self.reserve();

        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(err) = self.block.write(slot.sector(i), sector) {
                error!("swap: writing slot {} failed: {}", slot, err);
                self.release(slot);
                return Err(err);
            }
        }

        debug!("swap: wrote slot {}", slot);
        Ok(slot)
    }

    /// Read the image in `slot` into `page` and free the slot.
    ///
    /// `slot` must come from [`SwapSpace::write_out`] and not have been
    /// freed since. On a device error the slot keeps its image.
    pub fn read_in(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE, "swap images are one page");
        self.assert_occupied(slot);

        for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            self.block.read(slot.sector(i), sector)?;
        }

        self.release(slot);
        debug!("swap: read slot {}", slot);
        Ok(())
    }

    /// Free `slot` without reading it back.
    pub fn discard(&self, slot: SwapSlot) {
        self.release(slot);
        debug!("swap: discarded slot {}", slot);
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.bitmap.lock().count_ones()
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        self.bitmap
            .lock()
            .get(slot.0)
            .is_some_and(|bit| *bit)
    }

    pub fn block(&self) -> &Block<D> {
        &self.block
    }

    fn reserve(&self) -> SwapSlot {
        let mut bitmap = self.bitmap.lock();
        let Some(index) = bitmap.first_zero() else {
            error!("swap: all {} slots in use", bitmap.len());
            panic!("swap space exhausted");
        };
        bitmap.set(index, true);
        SwapSlot(index)
    }

    fn release(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        assert!(
            bitmap.get(slot.0).is_some_and(|bit| *bit),
            "swap slot {slot} is not in use"
        );
        bitmap.set(slot.0, false);
    }

    fn assert_occupied(&self, slot: SwapSlot) {
        assert!(self.is_occupied(slot), "swap slot {slot} is not in use");
    }
}
