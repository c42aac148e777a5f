//! The frame table: every user frame, and every mapping onto it.

use super::arena::Arena;
use crate::swapping::SwapSlot;
use crate::threading::Tid;
use alloc::{collections::BTreeMap, vec::Vec};
use kidneyvm_shared::mem::{KernelAddr, UserAddr};

/// Stable handle of a [`Frame`] record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FrameId(usize);

/// Stable handle of a [`Page`] record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PageId(usize);

/// A physical frame committed to the user pool.
///
/// A frame is either resident, in which case `kpage` is live and unique in
/// the table, or swapped, in which case its physical page has been freed
/// and its content lives in `swap_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kpage: KernelAddr,
    swap_index: Option<SwapSlot>,
    /// Mappings onto this frame, in the order they were installed.
    owners: Vec<PageId>,
    /// The thread whose allocation created the frame.
    acquirer: Tid,
}

impl Frame {
    pub fn kpage(&self) -> KernelAddr {
        self.kpage
    }
    pub fn swap_index(&self) -> Option<SwapSlot> {
        self.swap_index
    }
    pub fn owners(&self) -> &[PageId] {
        &self.owners
    }
    pub fn acquirer(&self) -> Tid {
        self.acquirer
    }
    pub fn is_resident(&self) -> bool {
        self.swap_index.is_none()
    }
    pub fn is_swapped(&self) -> bool {
        self.swap_index.is_some()
    }
}

/// One virtual page of one thread, bound to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    virtual_address: UserAddr,
    owner_thread: Tid,
    writable: bool,
    frame: FrameId,
}

impl Page {
    pub fn virtual_address(&self) -> UserAddr {
        self.virtual_address
    }
    pub fn owner_thread(&self) -> Tid {
        self.owner_thread
    }
    pub fn writable(&self) -> bool {
        self.writable
    }
    pub fn frame(&self) -> FrameId {
        self.frame
    }
}

/// Arena-backed registry of frames and pages.
///
/// Two indices are maintained next to the arenas: resident frames by kernel
/// page (a physical page appears at most once) and pages by `(thread,
/// address)` (a thread maps an address at most once). Callers serialize all
/// access under the VM lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameTable {
    frames: Arena<Frame>,
    pages: Arena<Page>,
    resident: BTreeMap<KernelAddr, FrameId>,
    mappings: BTreeMap<(Tid, UserAddr), PageId>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly allocated user page. The frame starts with no owners,
    /// which leaves it open to eviction until something maps it.
    pub fn register(&mut self, kpage: KernelAddr, acquirer: Tid) -> FrameId {
        assert!(
            !self.resident.contains_key(&kpage),
            "{kpage} is already tracked by a resident frame"
        );
        let id = FrameId(self.frames.insert(Frame {
            kpage,
            swap_index: None,
            owners: Vec::new(),
            acquirer,
        }));
        self.resident.insert(kpage, id);
        id
    }

    /// Record that `tid` maps `upage` onto `frame`, which must be resident.
    pub fn attach(&mut self, frame: FrameId, tid: Tid, upage: UserAddr, writable: bool) -> PageId {
        assert!(
            !self.mappings.contains_key(&(tid, upage)),
            "thread {tid} already maps {upage}"
        );
        assert!(self.frame(frame).is_resident(), "attach to swapped frame");

        let page = PageId(self.pages.insert(Page {
            virtual_address: upage,
            owner_thread: tid,
            writable,
            frame,
        }));
        self.mappings.insert((tid, upage), page);

        self.frame_mut(frame).owners.push(page);
        page
    }

    /// Drop the page record, returning it. The frame it was bound to stays,
    /// possibly with no owners left.
    pub fn detach(&mut self, page: PageId) -> Page {
        let Some(record) = self.pages.remove(page.0) else {
            panic!("detach of unknown page {page:?}");
        };
        self.mappings
            .remove(&(record.owner_thread, record.virtual_address));
        self.frame_mut(record.frame).owners.retain(|&owner| owner != page);
        record
    }

    /// The content of `frame` now lives in `slot`; its physical page is about
    /// to be released.
    pub fn mark_swapped(&mut self, frame: FrameId, slot: SwapSlot) {
        let kpage = self.frame(frame).kpage;
        assert!(self.frame(frame).is_resident(), "frame {kpage} swapped twice");
        self.resident.remove(&kpage);
        self.frame_mut(frame).swap_index = Some(slot);
    }

    /// Rebind every owner of `from` to `to` and destroy `from`.
    pub fn transfer_owners(&mut self, from: FrameId, to: FrameId) -> Frame {
        let owners = core::mem::take(&mut self.frame_mut(from).owners);
        for &page in &owners {
            if let Some(record) = self.pages.get_mut(page.0) {
                record.frame = to;
            }
        }
        self.frame_mut(to).owners.extend(owners);
        self.remove(from)
    }

    /// Forget a frame that has no owners left.
    pub fn remove(&mut self, frame: FrameId) -> Frame {
        assert!(
            self.frame(frame).owners.is_empty(),
            "removing frame {} with live owners",
            self.frame(frame).kpage
        );
        let Some(record) = self.frames.remove(frame.0) else {
            panic!("remove of unknown frame {frame:?}");
        };
        if record.is_resident() {
            self.resident.remove(&record.kpage);
        }
        record
    }

    pub fn resident_frame(&self, kpage: KernelAddr) -> Option<FrameId> {
        self.resident.get(&kpage).copied()
    }

    pub fn mapping(&self, tid: Tid, upage: UserAddr) -> Option<PageId> {
        self.mappings.get(&(tid, upage)).copied()
    }

    /// Every page mapped by `tid`, in address order.
    pub fn pages_of(&self, tid: Tid) -> Vec<PageId> {
        self.mappings
            .range((tid, UserAddr::new(0))..=(tid, UserAddr::new(usize::MAX)))
            .map(|(_, &page)| page)
            .collect()
    }

    /// Frames `tid` acquired that never received a mapping.
    pub fn orphans_of(&self, tid: Tid) -> Vec<FrameId> {
        self.frames
            .iter()
            .filter(|(_, frame)| frame.acquirer == tid && frame.owners.is_empty())
            .map(|(index, _)| FrameId(index))
            .collect()
    }

    pub fn frame(&self, frame: FrameId) -> &Frame {
        match self.frames.get(frame.0) {
            Some(record) => record,
            None => panic!("unknown frame {frame:?}"),
        }
    }

    fn frame_mut(&mut self, frame: FrameId) -> &mut Frame {
        match self.frames.get_mut(frame.0) {
            Some(record) => record,
            None => panic!("unknown frame {frame:?}"),
        }
    }

    pub fn page(&self, page: PageId) -> &Page {
        match self.pages.get(page.0) {
            Some(record) => record,
            None => panic!("unknown page {page:?}"),
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = (FrameId, &Frame)> {
        self.frames.iter().map(|(index, frame)| (FrameId(index), frame))
    }

    pub fn pages(&self) -> impl Iterator<Item = (PageId, &Page)> {
        self.pages.iter().map(|(index, page)| (PageId(index), page))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn swapped_count(&self) -> usize {
        self.frames.len() - self.resident.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidneyvm_shared::mem::OFFSET;

    const KPAGE: KernelAddr = KernelAddr::new(OFFSET + 0x0010_0000);
    const UPAGE: UserAddr = UserAddr::new(0x0804_8000);

    fn slot(index: usize) -> SwapSlot {
        SwapSlot::from_index(index)
    }

    #[test]
    fn register_and_attach() {
        let mut table = FrameTable::new();
        let frame = table.register(KPAGE, 1);
        assert!(table.frame(frame).owners().is_empty());
        assert_eq!(table.frame(frame).acquirer(), 1);
        assert_eq!(table.resident_frame(KPAGE), Some(frame));

        let page = table.attach(frame, 1, UPAGE, true);
        assert_eq!(table.frame(frame).owners(), [page]);
        assert_eq!(table.mapping(1, UPAGE), Some(page));
        assert_eq!(table.page(page).frame(), frame);
        assert!(table.page(page).writable());
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn physical_page_is_unique() {
        let mut table = FrameTable::new();
        table.register(KPAGE, 1);
        table.register(KPAGE, 2);
    }

    #[test]
    #[should_panic(expected = "already maps")]
    fn mapping_is_unique_per_thread() {
        let mut table = FrameTable::new();
        let a = table.register(KPAGE, 1);
        let b = table.register(KPAGE.add_pages(1), 1);
        table.attach(a, 1, UPAGE, true);
        table.attach(b, 1, UPAGE, true);
    }

    #[test]
    fn owners_keep_install_order() {
        let mut table = FrameTable::new();
        let frame = table.register(KPAGE, 1);
        let first = table.attach(frame, 1, UPAGE, true);
        let second = table.attach(frame, 1, UPAGE.add_pages(1), false);
        let third = table.attach(frame, 2, UPAGE, false);
        assert_eq!(table.frame(frame).owners(), [first, second, third]);

        table.detach(second);
        assert_eq!(table.frame(frame).owners(), [first, third]);
        assert_eq!(table.mapping(1, UPAGE.add_pages(1)), None);
    }

    #[test]
    fn swapped_frame_leaves_resident_index() {
        let mut table = FrameTable::new();
        let frame = table.register(KPAGE, 1);
        table.attach(frame, 1, UPAGE, true);
        table.mark_swapped(frame, slot(3));

        assert!(table.frame(frame).is_swapped());
        assert_eq!(table.frame(frame).swap_index(), Some(slot(3)));
        assert_eq!(table.resident_frame(KPAGE), None);
        assert_eq!((table.resident_count(), table.swapped_count()), (0, 1));

        // The physical page can now back a different frame.
        let other = table.register(KPAGE, 2);
        assert_ne!(other, frame);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn transfer_moves_every_owner() {
        let mut table = FrameTable::new();
        let old = table.register(KPAGE, 1);
        let a = table.attach(old, 1, UPAGE, true);
        let b = table.attach(old, 1, UPAGE.add_pages(1), true);
        table.mark_swapped(old, slot(0));

        let new = table.register(KPAGE.add_pages(1), 1);
        let removed = table.transfer_owners(old, new);
        assert!(removed.owners().is_empty());
        assert_eq!(table.frame(new).owners(), [a, b]);
        assert_eq!(table.page(a).frame(), new);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn pages_and_orphans_by_thread() {
        let mut table = FrameTable::new();
        let shared = table.register(KPAGE, 1);
        let p1 = table.attach(shared, 1, UPAGE.add_pages(2), true);
        let p2 = table.attach(shared, 1, UPAGE, true);
        table.attach(shared, 2, UPAGE, true);
        let orphan = table.register(KPAGE.add_pages(1), 1);
        table.register(KPAGE.add_pages(2), 2);

        assert_eq!(table.pages_of(1), [p2, p1]);
        assert_eq!(table.orphans_of(1), [orphan]);
        assert!(table.pages_of(3).is_empty());
    }

    #[test]
    #[should_panic(expected = "with live owners")]
    fn remove_with_owners_panics() {
        let mut table = FrameTable::new();
        let frame = table.register(KPAGE, 1);
        table.attach(frame, 1, UPAGE, true);
        table.remove(frame);
    }
}
