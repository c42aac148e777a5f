#![cfg_attr(not(test), no_std)]

//! The user memory manager of the kernel.
//!
//! [`vm::VirtualMemory`] hands out physical frames to user processes, records
//! which virtual pages map them, pushes frames out to a swap device when the
//! user pool runs dry, and takes everything back when a thread exits. It
//! talks to the rest of the kernel through three traits:
//! [`mem::PhysicalMemory`] for the page pools, [`paging::PageTables`] for the
//! per-thread page tables and [`block::BlockOp`] for the swap disk. Hosted
//! implementations of each ([`mem::FramePool`], [`paging::SoftPageTables`],
//! [`drivers::RamDisk`]) are included.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod threading;
pub mod vm;

pub use vm::{Residency, VirtualMemory, VmError, VmStats};
