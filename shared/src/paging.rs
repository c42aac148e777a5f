// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{KernelAddr, UserAddr, PAGE_FRAME_SIZE};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

pub const PAGE_DIRECTORY_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageDirectoryEntry>();
pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageDirectory(pub [PageDirectoryEntry; PAGE_DIRECTORY_LEN]);

impl PageDirectory {
    pub const DEFAULT: Self = Self([PageDirectoryEntry::DEFAULT; PAGE_DIRECTORY_LEN]);
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Deref for PageDirectory {
    type Target = [PageDirectoryEntry; PAGE_DIRECTORY_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageDirectory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(7, rw)]
    page_size: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl PageTable {
    pub const DEFAULT: Self = Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN]);
}

impl Default for PageTable {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user-mode entry pointing at the frame behind `kpage`.
    pub fn user_mapping(kpage: KernelAddr, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new((kpage.to_phys() / PAGE_FRAME_SIZE) as u32))
    }

    /// The kernel address of the frame this entry points at.
    pub fn kernel_page(&self) -> KernelAddr {
        KernelAddr::from_phys(self.page_frame_address().value() as usize * PAGE_FRAME_SIZE)
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl From<UserAddr> for VirtualAddress {
    fn from(addr: UserAddr) -> Self {
        Self::new_with_raw_value(addr.as_usize() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::OFFSET;

    #[test]
    fn virtual_address_split() {
        let va = VirtualAddress::from(UserAddr::new(0x0804_9123));
        assert_eq!(va.page_directory_index().value(), 0x20);
        assert_eq!(va.page_table_index().value(), 0x49);
        assert_eq!(va.offset().value(), 0x123);
    }

    #[test]
    fn user_mapping_points_at_frame() {
        let kpage = KernelAddr::new(OFFSET + 0x0012_3000);
        let entry = PageTableEntry::user_mapping(kpage, false);
        assert!(entry.present());
        assert!(entry.user_supervisor());
        assert!(!entry.read_write());
        assert!(!entry.accessed());
        assert_eq!(entry.page_frame_address().value(), 0x123);
        assert_eq!(entry.kernel_page(), kpage);
    }
}
