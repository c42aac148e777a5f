//! User virtual memory: frame allocation, mapping, eviction to swap and
//! teardown.
//!
//! [`VirtualMemory`] ties together the physical page pools, the per-thread
//! page tables and the swap space. Every user frame it hands out is recorded
//! in a [`FrameTable`] together with the mappings onto it, so that when the
//! user pool runs dry a victim can be chosen, written to swap and unmapped
//! from every address space that uses it.

mod arena;
pub mod frame_table;
pub mod vm_error;


pub use frame_table::{Frame, FrameId, FrameTable, Page, PageId};
pub use vm_error::VmError;

use crate::block::BlockOp;
use crate::mem::{PhysicalMemory, Pool};
use crate::paging::PageTables;
use crate::swapping::page_replacement::{PageReplacementPolicy, SecondChance};
use crate::swapping::{SwapSlot, SwapSpace};
use crate::sync::Mutex;
use crate::threading::{ThreadContext, Tid};
use alloc::{boxed::Box, vec};
use kidneyvm_shared::mem::{KernelAddr, UserAddr, PAGE_FRAME_SIZE};
use log::{debug, error, trace, warn};

/// Where the page behind a mapping currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident(KernelAddr),
    Swapped(SwapSlot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStats {
    pub resident_frames: usize,
    pub swapped_frames: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    pub swap_ins: usize,
    pub swap_slots_in_use: usize,
}

struct VmState {
    frames: FrameTable,
    policy: Box<dyn PageReplacementPolicy>,
    evictions: usize,
    swap_outs: usize,
    swap_ins: usize,
}

/// The VM manager.
///
/// Lock order: the frame table lock is taken first, then the swap bitmap,
/// then the page tables and block device. The swap and page-table locks are
/// never held while calling back into this type.
pub struct VirtualMemory<M, P, D, T> {
    memory: M,
    page_tables: P,
    swap: SwapSpace<D>,
    threads: T,
    state: Mutex<VmState>,
}

impl<M, P, D, T> VirtualMemory<M, P, D, T>
where
    M: PhysicalMemory,
    P: PageTables,
    D: BlockOp,
    T: ThreadContext,
{
    /// A manager that evicts with the clock algorithm.
    pub fn new(memory: M, page_tables: P, swap: SwapSpace<D>, threads: T) -> Self {
        Self::with_policy(memory, page_tables, swap, threads, SecondChance::new())
    }

    pub fn with_policy(
        memory: M,
        page_tables: P,
        swap: SwapSpace<D>,
        threads: T,
        policy: impl PageReplacementPolicy + 'static,
    ) -> Self {
        debug!(
            "vm: {} swap slots on {}",
            swap.slot_count(),
            swap.block().get_name()
        );
        Self {
            memory,
            page_tables,
            swap,
            threads,
            state: Mutex::new(VmState {
                frames: FrameTable::new(),
                policy: Box::new(policy),
                evictions: 0,
                swap_outs: 0,
                swap_ins: 0,
            }),
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn page_tables(&self) -> &P {
        &self.page_tables
    }

    pub fn swap(&self) -> &SwapSpace<D> {
        &self.swap
    }

    /// Allocate a page for the running thread. See [`Self::acquire_for`].
    pub fn acquire(&self, pool: Pool, zero_fill: bool) -> KernelAddr {
        self.acquire_for(self.threads.running_thread_tid(), pool, zero_fill)
    }

    /// Allocate a page from `pool` on behalf of `tid`.
    ///
    /// User pages never run out: if the pool is empty a resident frame is
    /// evicted to make room. The new user frame has no mappings until it is
    /// passed to [`Self::install_for`], and until then it is the first thing
    /// eviction takes. Callers that cannot tolerate that use
    /// [`Self::load_page_for`].
    ///
    /// Kernel pages are not tracked. Running out of them is fatal.
    pub fn acquire_for(&self, tid: Tid, pool: Pool, zero_fill: bool) -> KernelAddr {
        match pool {
            Pool::Kernel => self.memory.allocate(Pool::Kernel, zero_fill).unwrap_or_else(|| {
                error!("vm: kernel pool exhausted");
                panic!("out of kernel pages");
            }),
            Pool::User => {
                let mut state = self.state.lock();
                let (_, kpage) = self.allocate_user(&mut state, tid, zero_fill);
                kpage
            }
        }
    }

    /// Map `upage` to `kpage` in the running thread's address space. See
    /// [`Self::install_for`].
    pub fn install(&self, upage: UserAddr, kpage: KernelAddr, writable: bool) -> bool {
        self.install_for(self.threads.running_thread_tid(), upage, kpage, writable)
    }

    /// Map `upage` to `kpage` in the address space of `tid`.
    ///
    /// `kpage` must be a resident user page from [`Self::acquire_for`].
    /// Returns false, changing nothing, if `tid` already maps `upage`
    /// (resident or swapped out) or if the page table cannot take the entry.
    /// A refused frame stays unmapped and is reclaimed by eviction or by
    /// [`Self::release_all`].
    pub fn install_for(&self, tid: Tid, upage: UserAddr, kpage: KernelAddr, writable: bool) -> bool {
        assert!(upage.is_page_aligned(), "{upage} is not page aligned");
        assert!(kpage.is_page_aligned(), "{kpage} is not page aligned");
        assert!(upage.is_user(), "{upage} is not a user address");
        assert!(kpage.is_kernel(), "{kpage} is not a kernel address");

        let mut state = self.state.lock();
        if state.frames.mapping(tid, upage).is_some()
            || self.page_tables.query(tid, upage).is_some()
        {
            trace!("vm: thread {} already maps {}", tid, upage);
            return false;
        }
        let Some(frame) = state.frames.resident_frame(kpage) else {
            error!("vm: install of untracked page {} at {}", kpage, upage);
            panic!("{kpage} was not acquired from the user pool");
        };
        if !self.page_tables.install(tid, upage, kpage, writable) {
            debug!("vm: page table refused {} -> {} for thread {}", upage, kpage, tid);
            return false;
        }

        state.frames.attach(frame, tid, upage, writable);
        trace!("vm: thread {} maps {} -> {}", tid, upage, kpage);
        true
    }

    /// Load `image` into a fresh page mapped at `upage` for the running
    /// thread. See [`Self::load_page_for`].
    pub fn load_page(&self, upage: UserAddr, image: &[u8], writable: bool) -> bool {
        self.load_page_for(self.threads.running_thread_tid(), upage, image, writable)
    }

    /// Acquire a user page, copy `image` into it and map it at `upage` in
    /// `tid`, without letting go of the frame table in between.
    ///
    /// `image` may be shorter than a page; the rest is zeroed. Returns false
    /// if the mapping is refused, in which case the page goes straight back
    /// to the pool.
    pub fn load_page_for(&self, tid: Tid, upage: UserAddr, image: &[u8], writable: bool) -> bool {
        assert!(upage.is_page_aligned(), "{upage} is not page aligned");
        assert!(upage.is_user(), "{upage} is not a user address");
        assert!(image.len() <= PAGE_FRAME_SIZE, "image larger than a page");

        let mut state = self.state.lock();
        if state.frames.mapping(tid, upage).is_some()
            || self.page_tables.query(tid, upage).is_some()
        {
            trace!("vm: thread {} already maps {}", tid, upage);
            return false;
        }

        let (frame, kpage) = self.allocate_user(&mut state, tid, image.is_empty());
        if !image.is_empty() {
            let mut page = vec![0; PAGE_FRAME_SIZE];
            page[..image.len()].copy_from_slice(image);
            self.memory.write_page(kpage, &page);
        }
        if !self.page_tables.install(tid, upage, kpage, writable) {
            debug!("vm: page table refused {} -> {} for thread {}", upage, kpage, tid);
            self.reclaim(&mut state, frame);
            return false;
        }

        state.frames.attach(frame, tid, upage, writable);
        trace!("vm: thread {} loaded {} -> {}", tid, upage, kpage);
        true
    }

    /// Bring the page behind `addr` back from swap for the running thread.
    /// See [`Self::page_in_for`].
    pub fn page_in(&self, addr: UserAddr) -> Result<KernelAddr, VmError> {
        self.page_in_for(self.threads.running_thread_tid(), addr)
    }

    /// Bring the swapped-out page that `tid` maps at `addr` back into
    /// memory.
    ///
    /// A fresh user page is acquired, evicting if it has to, and filled from
    /// the swap slot. Every mapping of the old frame, including those of
    /// other threads, moves to the new page and is installed again. An alias
    /// that no longer fits in its page table is dropped.
    ///
    /// On a device error nothing changes and the image stays in swap.
    pub fn page_in_for(&self, tid: Tid, addr: UserAddr) -> Result<KernelAddr, VmError> {
        let upage = addr.page_round_down();
        let mut state = self.state.lock();

        let page = state.frames.mapping(tid, upage).ok_or(VmError::NotMapped)?;
        let old = state.frames.page(page).frame();
        let Some(slot) = state.frames.frame(old).swap_index() else {
            return Err(VmError::AlreadyResident);
        };

        // Read first: the slot it frees may be needed by the eviction below.
        let mut image = vec![0; PAGE_FRAME_SIZE];
        self.swap.read_in(slot, &mut image)?;
        state.swap_ins += 1;

        let (frame, kpage) = self.allocate_user(&mut state, tid, false);
        self.memory.write_page(kpage, &image);
        state.frames.transfer_owners(old, frame);

        let mut result = Ok(kpage);
        let owners = state.frames.frame(frame).owners().to_vec();
        for owner in owners {
            let record = *state.frames.page(owner);
            let (owner_tid, owner_upage) = (record.owner_thread(), record.virtual_address());
            if self
                .page_tables
                .install(owner_tid, owner_upage, kpage, record.writable())
            {
                continue;
            }

            warn!(
                "vm: page-in could not remap {} for thread {}, dropping it",
                owner_upage, owner_tid
            );
            state.frames.detach(owner);
            if owner == page {
                result = Err(VmError::InstallFailed);
            }
        }

        if state.frames.frame(frame).owners().is_empty() {
            self.reclaim(&mut state, frame);
        }
        debug!("vm: paged {} in from slot {} to {}", upage, slot, kpage);
        result
    }

    /// Unmap `upage` from the running thread. See [`Self::uninstall_for`].
    pub fn uninstall(&self, upage: UserAddr) -> bool {
        self.uninstall_for(self.threads.running_thread_tid(), upage)
    }

    /// Remove the mapping of `upage` in `tid`, reclaiming the frame if it was
    /// the last one. Returns false if there was no such mapping.
    pub fn uninstall_for(&self, tid: Tid, upage: UserAddr) -> bool {
        let mut state = self.state.lock();
        let Some(page) = state.frames.mapping(tid, upage) else {
            return false;
        };

        self.page_tables.clear(tid, upage);
        let frame = state.frames.detach(page).frame();
        if state.frames.frame(frame).owners().is_empty() {
            self.reclaim(&mut state, frame);
        }
        trace!("vm: thread {} unmapped {}", tid, upage);
        true
    }

    /// Drop every mapping of a terminating thread.
    ///
    /// Frames left without mappings are reclaimed: resident ones return their
    /// page to the pool, swapped ones free their slot unread. Frames `tid`
    /// acquired but never mapped are reclaimed too. Must run before the
    /// thread's address space is destroyed. Returns the number of frames
    /// reclaimed.
    pub fn release_all(&self, tid: Tid) -> usize {
        let mut state = self.state.lock();
        let mut reclaimed = 0;

        for page in state.frames.pages_of(tid) {
            self.page_tables
                .clear(tid, state.frames.page(page).virtual_address());
            let frame = state.frames.detach(page).frame();
            if state.frames.frame(frame).owners().is_empty() {
                self.reclaim(&mut state, frame);
                reclaimed += 1;
            }
        }
        for frame in state.frames.orphans_of(tid) {
            self.reclaim(&mut state, frame);
            reclaimed += 1;
        }

        debug!("vm: thread {} released, {} frames reclaimed", tid, reclaimed);
        reclaimed
    }

    /// Where the page `tid` maps at `upage` lives, if it is mapped at all.
    pub fn lookup(&self, tid: Tid, upage: UserAddr) -> Option<Residency> {
        let state = self.state.lock();
        let page = state.frames.mapping(tid, upage)?;
        let frame = state.frames.frame(state.frames.page(page).frame());
        Some(match frame.swap_index() {
            Some(slot) => Residency::Swapped(slot),
            None => Residency::Resident(frame.kpage()),
        })
    }

    pub fn stats(&self) -> VmStats {
        let state = self.state.lock();
        VmStats {
            resident_frames: state.frames.resident_count(),
            swapped_frames: state.frames.swapped_count(),
            evictions: state.evictions,
            swap_outs: state.swap_outs,
            swap_ins: state.swap_ins,
            swap_slots_in_use: self.swap.slots_in_use(),
        }
    }

    /// A copy of the frame table as it is right now.
    pub fn snapshot(&self) -> FrameTable {
        self.state.lock().frames.clone()
    }

    fn allocate_user(&self, state: &mut VmState, tid: Tid, zero_fill: bool) -> (FrameId, KernelAddr) {
        let kpage = match self.memory.allocate(Pool::User, zero_fill) {
            Some(kpage) => kpage,
            None => {
                self.evict(state);
                self.memory
                    .allocate(Pool::User, zero_fill)
                    .unwrap_or_else(|| {
                        error!("vm: user pool still empty after eviction");
                        panic!("out of user pages");
                    })
            }
        };

        let frame = state.frames.register(kpage, tid);
        state.policy.track(frame);
        trace!("vm: thread {} acquired {}", tid, kpage);
        (frame, kpage)
    }

    /// Free one resident frame's physical page, writing it to swap if anyone
    /// still maps it.
    fn evict(&self, state: &mut VmState) {
        let victim = state.policy.select_victim(&state.frames, &self.page_tables);
        state.policy.untrack(victim);
        state.evictions += 1;

        let frame = state.frames.frame(victim);
        let kpage = frame.kpage();
        if frame.owners().is_empty() {
            debug!("vm: evicting unmapped frame {}", kpage);
            state.frames.remove(victim);
            self.memory.free(kpage);
            return;
        }

        // Unmap before copying so no write lands after the image is taken.
        for &owner in frame.owners() {
            let page = state.frames.page(owner);
            self.page_tables
                .clear(page.owner_thread(), page.virtual_address());
        }

        let mut image = vec![0; PAGE_FRAME_SIZE];
        self.memory.read_page(kpage, &mut image);
        let slot = self.swap.write_out(&image).unwrap_or_else(|err| {
            error!("vm: writing {} to swap failed: {}", kpage, err);
            panic!("swap device failed during eviction");
        });
        state.swap_outs += 1;

        state.frames.mark_swapped(victim, slot);
        self.memory.free(kpage);
        debug!("vm: evicted {} to slot {}", kpage, slot);
    }

    /// Destroy an ownerless frame and release what backs it.
    fn reclaim(&self, state: &mut VmState, frame: FrameId) {
        state.policy.untrack(frame);
        let record = state.frames.remove(frame);
        match record.swap_index() {
            Some(slot) => self.swap.discard(slot),
            None => self.memory.free(record.kpage()),
        }
    }
}
