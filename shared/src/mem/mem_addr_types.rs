//! Typed addresses for the two halves of the 32-bit address space.
//!
//! A [`UserAddr`] lives below [`OFFSET`]; a [`KernelAddr`] lives at or above it
//! and is directly dereferenceable by the kernel. Physical addresses are never
//! handled directly: a physical frame is named by the kernel address it is
//! mapped at, `phys + OFFSET`.

use super::{is_page_aligned, page_round_down, OFFSET, PAGE_FRAME_SIZE};
use core::fmt;

macro_rules! addr_types {
    ($($(#[$meta:meta])* $name:ident),*) => {
        $(
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                is_page_aligned(self.0)
            }

            #[inline]
            pub const fn page_round_down(self) -> Self {
                Self(page_round_down(self.0))
            }

            /// The address `pages` pages above this one.
            #[inline]
            pub const fn add_pages(self, pages: usize) -> Self {
                Self(self.0 + pages * PAGE_FRAME_SIZE)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#010X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:#010X}", self.0)
            }
        }
        )*
    };
}

addr_types!(
    /// A virtual address in some user address space.
    UserAddr,
    /// A kernel virtual address; names the physical frame at `self - OFFSET`.
    KernelAddr
);

impl UserAddr {
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < OFFSET
    }
}

impl KernelAddr {
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= OFFSET
    }

    #[inline]
    pub const fn from_phys(phys: usize) -> Self {
        Self(phys + OFFSET)
    }

    #[inline]
    pub const fn to_phys(self) -> usize {
        self.0 - OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_and_kernel_halves() {
        assert!(UserAddr::new(0x0804_8000).is_user());
        assert!(!UserAddr::new(OFFSET).is_user());
        assert!(KernelAddr::new(OFFSET).is_kernel());
        assert!(!KernelAddr::new(OFFSET - PAGE_FRAME_SIZE).is_kernel());
    }

    #[test]
    fn alignment_helpers() {
        let addr = UserAddr::new(0x1234_5678);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.page_round_down(), UserAddr::new(0x1234_5000));
        assert!(addr.page_round_down().is_page_aligned());
        assert_eq!(
            UserAddr::new(0x1000).add_pages(2),
            UserAddr::new(0x3000)
        );
    }

    #[test]
    fn phys_round_trip() {
        let kpage = KernelAddr::from_phys(0x0010_0000);
        assert_eq!(kpage.as_usize(), OFFSET + 0x0010_0000);
        assert_eq!(kpage.to_phys(), 0x0010_0000);
    }
}
