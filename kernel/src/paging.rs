//! The hardware page-table capability, and a software model of it.

use crate::sync::Mutex;
use crate::threading::Tid;
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use kidneyvm_shared::mem::{KernelAddr, UserAddr, PAGE_FRAME_SIZE};
use kidneyvm_shared::paging::{
    PageDirectory, PageTable, PageTableEntry, VirtualAddress, PAGE_DIRECTORY_LEN,
    PAGE_TABLE_LEN,
};

/// Per-thread page-table primitives.
///
/// Every call names the address space by the thread that owns it. Calls for
/// a thread whose address space no longer exists behave as if nothing were
/// mapped.
pub trait PageTables: Send + Sync {
    /// The kernel page `upage` is mapped to, if any.
    fn query(&self, tid: Tid, upage: UserAddr) -> Option<KernelAddr>;

    /// Map `upage` to `kpage`. Returns false if the mapping could not be
    /// created (the table itself ran out of memory).
    fn install(&self, tid: Tid, upage: UserAddr, kpage: KernelAddr, writable: bool) -> bool;

    /// Remove the mapping for `upage`, if present.
    fn clear(&self, tid: Tid, upage: UserAddr);

    fn is_accessed(&self, tid: Tid, upage: UserAddr) -> bool;

    fn set_accessed(&self, tid: Tid, upage: UserAddr, accessed: bool);
}

struct AddressSpace {
    directory: Box<PageDirectory>,
    tables: Vec<Option<Box<PageTable>>>,
}

impl AddressSpace {
    fn new() -> Self {
        Self {
            directory: Box::default(),
            tables: (0..PAGE_DIRECTORY_LEN).map(|_| None).collect(),
        }
    }

    fn indices(upage: UserAddr) -> (usize, usize) {
        let va = VirtualAddress::from(upage);
        (
            usize::from(va.page_directory_index().value()),
            usize::from(va.page_table_index().value()),
        )
    }

    fn entry(&self, upage: UserAddr) -> Option<&PageTableEntry> {
        let (pde, pte) = Self::indices(upage);
        if !self.directory[pde].present() {
            return None;
        }
        self.tables[pde]
            .as_ref()
            .map(|table| &table[pte])
            .filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, upage: UserAddr) -> Option<&mut PageTableEntry> {
        let (pde, pte) = Self::indices(upage);
        if !self.directory[pde].present() {
            return None;
        }
        self.tables[pde]
            .as_mut()
            .map(|table| &mut table[pte])
            .filter(|entry| entry.present())
    }

    fn table_count(&self) -> usize {
        self.tables.iter().flatten().count()
    }
}

struct SoftState {
    spaces: BTreeMap<Tid, AddressSpace>,
    tables_allocated: usize,
}

/// Two-level x86 page tables kept in ordinary kernel memory, one directory
/// per thread.
///
/// There is no MMU behind them: [`SoftPageTables::touch`] stands in for a
/// user access and sets the accessed/dirty bits the way the hardware would.
/// An optional limit on second-level tables lets callers exercise the
/// "table allocation failed" path of [`PageTables::install`].
pub struct SoftPageTables {
    state: Mutex<SoftState>,
    table_limit: Option<usize>,
}

impl SoftPageTables {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftState {
                spaces: BTreeMap::new(),
                tables_allocated: 0,
            }),
            table_limit: None,
        }
    }

    /// At most `limit` second-level page tables may exist at once, across
    /// all address spaces.
    pub fn with_table_limit(limit: usize) -> Self {
        Self {
            table_limit: Some(limit),
            ..Self::new()
        }
    }

    /// Simulate a user access to `addr`. Returns false if the access would
    /// fault (not mapped, or a write to a read-only page).
    pub fn touch(&self, tid: Tid, addr: UserAddr, write: bool) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state
            .spaces
            .get_mut(&tid)
            .and_then(|space| space.entry_mut(addr.page_round_down()))
        else {
            return false;
        };
        if write && !entry.read_write() {
            return false;
        }
        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        true
    }

    pub fn is_writable(&self, tid: Tid, upage: UserAddr) -> bool {
        let state = self.state.lock();
        state
            .spaces
            .get(&tid)
            .and_then(|space| space.entry(upage))
            .is_some_and(|entry| entry.read_write())
    }

    /// Every present mapping of `tid`, in address order.
    pub fn mappings(&self, tid: Tid) -> Vec<(UserAddr, KernelAddr)> {
        let state = self.state.lock();
        let Some(space) = state.spaces.get(&tid) else {
            return Vec::new();
        };

        let mut mappings = Vec::new();
        for (pde, table) in space.tables.iter().enumerate() {
            let Some(table) = table else { continue };
            for (pte, entry) in table.iter().enumerate() {
                if entry.present() {
                    let upage = UserAddr::new((pde * PAGE_TABLE_LEN + pte) * PAGE_FRAME_SIZE);
                    mappings.push((upage, entry.kernel_page()));
                }
            }
        }
        mappings
    }

    /// Threads that currently have an address space.
    pub fn threads(&self) -> Vec<Tid> {
        self.state.lock().spaces.keys().copied().collect()
    }

    /// Tear down the address space of `tid`, giving its tables back.
    pub fn destroy(&self, tid: Tid) {
        let mut state = self.state.lock();
        if let Some(space) = state.spaces.remove(&tid) {
            state.tables_allocated -= space.table_count();
        }
    }

    pub fn tables_allocated(&self) -> usize {
        self.state.lock().tables_allocated
    }
}

impl Default for SoftPageTables {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTables for SoftPageTables {
    fn query(&self, tid: Tid, upage: UserAddr) -> Option<KernelAddr> {
        let state = self.state.lock();
        state
            .spaces
            .get(&tid)
            .and_then(|space| space.entry(upage))
            .map(PageTableEntry::kernel_page)
    }

    fn install(&self, tid: Tid, upage: UserAddr, kpage: KernelAddr, writable: bool) -> bool {
        let mut state = self.state.lock();
        let SoftState {
            spaces,
            tables_allocated,
        } = &mut *state;
        let space = spaces.entry(tid).or_insert_with(AddressSpace::new);
        let (pde, pte) = AddressSpace::indices(upage);

        if space.tables[pde].is_none() {
            if self.table_limit.is_some_and(|limit| *tables_allocated >= limit) {
                return false;
            }
            space.tables[pde] = Some(Box::default());
            space.directory[pde] = space.directory[pde]
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true);
            *tables_allocated += 1;
        }

        let Some(table) = space.tables[pde].as_mut() else {
            return false;
        };
        if table[pte].present() {
            return false;
        }
        table[pte] = PageTableEntry::user_mapping(kpage, writable);
        true
    }

    fn clear(&self, tid: Tid, upage: UserAddr) {
        let mut state = self.state.lock();
        if let Some(entry) = state
            .spaces
            .get_mut(&tid)
            .and_then(|space| space.entry_mut(upage))
        {
            *entry = PageTableEntry::DEFAULT;
        }
    }

    fn is_accessed(&self, tid: Tid, upage: UserAddr) -> bool {
        let state = self.state.lock();
        state
            .spaces
            .get(&tid)
            .and_then(|space| space.entry(upage))
            .is_some_and(|entry| entry.accessed())
    }

    fn set_accessed(&self, tid: Tid, upage: UserAddr, accessed: bool) {
        let mut state = self.state.lock();
        if let Some(entry) = state
            .spaces
            .get_mut(&tid)
            .and_then(|space| space.entry_mut(upage))
        {
            *entry = entry.with_accessed(accessed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidneyvm_shared::mem::OFFSET;

    const UPAGE: UserAddr = UserAddr::new(0x0804_8000);
    const KPAGE: KernelAddr = KernelAddr::new(OFFSET + 0x0020_0000);

    #[test]
    fn install_query_clear() {
        let tables = SoftPageTables::new();
        assert_eq!(tables.query(1, UPAGE), None);
        assert!(tables.install(1, UPAGE, KPAGE, true));
        assert_eq!(tables.query(1, UPAGE), Some(KPAGE));
        assert_eq!(tables.query(2, UPAGE), None);
        assert!(tables.is_writable(1, UPAGE));

        tables.clear(1, UPAGE);
        assert_eq!(tables.query(1, UPAGE), None);
    }

    #[test]
    fn install_over_existing_mapping_fails() {
        let tables = SoftPageTables::new();
        assert!(tables.install(1, UPAGE, KPAGE, true));
        assert!(!tables.install(1, UPAGE, KPAGE.add_pages(1), false));
        assert_eq!(tables.query(1, UPAGE), Some(KPAGE));
    }

    #[test]
    fn touch_sets_accessed_and_dirty() {
        let tables = SoftPageTables::new();
        assert!(!tables.touch(1, UPAGE, false));
        assert!(tables.install(1, UPAGE, KPAGE, false));
        assert!(!tables.is_accessed(1, UPAGE));

        assert!(tables.touch(1, UserAddr::new(UPAGE.as_usize() + 0x10), false));
        assert!(tables.is_accessed(1, UPAGE));
        assert!(!tables.touch(1, UPAGE, true));

        tables.set_accessed(1, UPAGE, false);
        assert!(!tables.is_accessed(1, UPAGE));
    }

    #[test]
    fn table_limit_fails_install() {
        let tables = SoftPageTables::with_table_limit(1);
        assert!(tables.install(1, UPAGE, KPAGE, true));
        // Same second-level table, no new allocation needed.
        assert!(tables.install(1, UPAGE.add_pages(1), KPAGE.add_pages(1), true));
        // A different 4MB region needs a second table.
        let far = UserAddr::new(UPAGE.as_usize() + 0x0040_0000);
        assert!(!tables.install(1, far, KPAGE.add_pages(2), true));
        assert_eq!(tables.query(1, far), None);

        tables.destroy(1);
        assert_eq!(tables.tables_allocated(), 0);
        assert!(tables.install(2, far, KPAGE.add_pages(2), true));
    }

    #[test]
    fn mappings_lists_present_entries() {
        let tables = SoftPageTables::new();
        assert!(tables.install(3, UPAGE.add_pages(1), KPAGE, true));
        assert!(tables.install(3, UPAGE, KPAGE.add_pages(4), true));
        assert_eq!(
            tables.mappings(3),
            [(UPAGE, KPAGE.add_pages(4)), (UPAGE.add_pages(1), KPAGE)]
        );
        assert_eq!(tables.threads(), [3]);
    }
}
