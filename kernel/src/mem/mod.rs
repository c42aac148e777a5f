mod frame_allocator;

pub use frame_allocator::{
    placement_algorithms::{FirstFit, NextFit, PlacementAlgorithm},
    CoreMapEntry, FramePool,
};

use kidneyvm_shared::mem::KernelAddr;

/// Which page pool an allocation is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Kernel-only pages. Never tracked by the frame table, never evicted.
    Kernel,
    /// Pages that back user virtual memory.
    User,
}

/// The physical page allocator, and access to the memory it hands out.
///
/// Pages are named by their kernel address. On the target the kernel reads
/// and writes them through that address directly; the `read_page`/`write_page`
/// pair keeps the swap path free of raw pointers.
pub trait PhysicalMemory: Send + Sync {
    /// Allocate one page from `pool`, zeroing it if `zero_fill` is set.
    ///
    /// Returns [`None`] if the pool is exhausted.
    fn allocate(&self, pool: Pool, zero_fill: bool) -> Option<KernelAddr>;

    /// Return a page previously handed out by [`PhysicalMemory::allocate`].
    fn free(&self, page: KernelAddr);

    /// Copy the full contents of `page` into `buf`.
    fn read_page(&self, page: KernelAddr, buf: &mut [u8]);

    /// Overwrite the full contents of `page` with `buf`.
    fn write_page(&self, page: KernelAddr, buf: &[u8]);
}
