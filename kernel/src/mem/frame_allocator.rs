pub mod placement_algorithms;

use super::{PhysicalMemory, Pool};
use crate::sync::Mutex;
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use core::ops::Range;
use kidneyvm_shared::mem::{KernelAddr, PAGE_FRAME_SIZE, UPPER_MEMORY_START};
use log::trace;
use placement_algorithms::{NextFit, PlacementAlgorithm};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(2, rw)]
    is_kernel: bool,
}

struct CoreMap<A> {
    entries: Box<[CoreMapEntry]>,
    kernel_placement: A,
    user_placement: A,
    frames_allocated: usize,
}

/// Upper memory split into a kernel pool followed by a user pool, one core
/// map entry per frame.
///
/// Frame `i` is the physical page at `UPPER_MEMORY_START + i * PAGE_FRAME_SIZE`.
pub struct FramePool<A = NextFit> {
    core_map: Mutex<CoreMap<A>>,
    memory: Box<[Mutex<Box<[u8]>>]>,
    kernel_frames: usize,
}

impl FramePool<NextFit> {
    pub fn new(kernel_frames: usize, user_frames: usize) -> Self {
        Self::with_placement(kernel_frames, user_frames)
    }
}

impl<A: PlacementAlgorithm> FramePool<A> {
    pub fn with_placement(kernel_frames: usize, user_frames: usize) -> Self {
        let total = kernel_frames + user_frames;
        let entries = (0..total)
            .map(|frame| CoreMapEntry::DEFAULT.with_is_kernel(frame < kernel_frames))
            .collect();

        Self {
            core_map: Mutex::new(CoreMap {
                entries,
                kernel_placement: A::default(),
                user_placement: A::default(),
                frames_allocated: 0,
            }),
            memory: (0..total)
                .map(|_| Mutex::new(vec![0u8; PAGE_FRAME_SIZE].into_boxed_slice()))
                .collect(),
            kernel_frames,
        }
    }

    fn pool_range(&self, pool: Pool) -> Range<usize> {
        match pool {
            Pool::Kernel => 0..self.kernel_frames,
            Pool::User => self.kernel_frames..self.memory.len(),
        }
    }

    fn frame_address(frame: usize) -> KernelAddr {
        KernelAddr::from_phys(UPPER_MEMORY_START + frame * PAGE_FRAME_SIZE)
    }

    fn frame_number(&self, page: KernelAddr) -> usize {
        assert!(page.is_page_aligned(), "{page} is not page aligned");
        let frame = page
            .to_phys()
            .checked_sub(UPPER_MEMORY_START)
            .map(|offset| offset / PAGE_FRAME_SIZE)
            .filter(|&frame| frame < self.memory.len());
        match frame {
            Some(frame) => frame,
            None => panic!("{page} is not managed by this frame pool"),
        }
    }

    fn frame_memory(&self, page: KernelAddr) -> &Mutex<Box<[u8]>> {
        let frame = self.frame_number(page);
        assert!(
            self.core_map.lock().entries[frame].allocated(),
            "access to unallocated frame {page}"
        );
        &self.memory[frame]
    }

    /// Number of unallocated frames left in `pool`.
    pub fn free_frames(&self, pool: Pool) -> usize {
        let core_map = self.core_map.lock();
        self.pool_range(pool)
            .filter(|&frame| !core_map.entries[frame].allocated())
            .count()
    }

    pub fn frames_allocated(&self) -> usize {
        self.core_map.lock().frames_allocated
    }

    pub fn capacity(&self, pool: Pool) -> usize {
        self.pool_range(pool).len()
    }
}

impl<A: PlacementAlgorithm> PhysicalMemory for FramePool<A> {
    fn allocate(&self, pool: Pool, zero_fill: bool) -> Option<KernelAddr> {
        let range = self.pool_range(pool);
        let frame = {
            let mut core_map = self.core_map.lock();
            let CoreMap {
                entries,
                kernel_placement,
                user_placement,
                frames_allocated,
            } = &mut *core_map;
            let placement = match pool {
                Pool::Kernel => kernel_placement,
                Pool::User => user_placement,
            };

            let frame = placement.place(entries, range)?;
            assert!(!entries[frame].allocated());
            entries[frame] = entries[frame].with_allocated(true);
            *frames_allocated += 1;
            frame
        };

        if zero_fill {
            self.memory[frame].lock().fill(0);
        }

        let page = Self::frame_address(frame);
        trace!("allocated {:?} page {}", pool, page);
        Some(page)
    }

    fn free(&self, page: KernelAddr) {
        let frame = self.frame_number(page);
        let mut core_map = self.core_map.lock();
        assert!(
            core_map.entries[frame].allocated(),
            "double free of frame {page}"
        );
        core_map.entries[frame] = core_map.entries[frame].with_allocated(false);
        core_map.frames_allocated -= 1;
        trace!("freed page {}", page);
    }

    fn read_page(&self, page: KernelAddr, buf: &mut [u8]) {
        buf.copy_from_slice(&self.frame_memory(page).lock());
    }

    fn write_page(&self, page: KernelAddr, buf: &[u8]) {
        self.frame_memory(page).lock().copy_from_slice(buf);
    }
}
