pub mod mem_addr_types;

use crate::sizes::{KB, MB};

pub use mem_addr_types::{KernelAddr, UserAddr};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;
pub const HUGE_PAGE_SIZE: usize = 4 * MB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// "Upper memory" (as opposed to "lower memory") starts at 1MB. Frames handed
// out to the page pools live above it.
pub const UPPER_MEMORY_START: usize = MB;

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_FRAME_SIZE == 0
}

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}
