use crate::paging::PageTables;
use crate::vm::{FrameId, FrameTable};
use alloc::collections::VecDeque;
use log::{error, trace, warn};

/// Chooses which resident frame gives up its physical page when the user
/// pool runs dry.
///
/// The policy sees frames as they are registered and dropped; it never owns
/// them. `select_victim` runs under the frame-table lock.
pub trait PageReplacementPolicy: Send {
    /// Start considering `frame`.
    fn track(&mut self, frame: FrameId);

    /// Stop considering `frame`. It has been swapped out or destroyed.
    fn untrack(&mut self, frame: FrameId);

    /// Pick the next victim among tracked frames.
    ///
    /// Panics if nothing is tracked.
    fn select_victim(&mut self, frames: &FrameTable, page_tables: &dyn PageTables) -> FrameId;
}

/// The clock algorithm.
///
/// Frames sit on a ring in registration order. Each inspection moves the
/// front frame to the back. A frame whose representative mapping (its first
/// owner) has been accessed loses the bit and survives one more lap; an
/// unaccessed frame, or one nobody maps, is the victim.
#[derive(Debug, Default)]
pub struct SecondChance {
    ring: VecDeque<FrameId>,
}

impl SecondChance {
    pub const fn new() -> Self {
        Self {
            ring: VecDeque::new(),
        }
    }

    /// Tracked frames, front of the clock hand first.
    pub fn ring(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.ring.iter().copied()
    }
}

impl PageReplacementPolicy for SecondChance {
    fn track(&mut self, frame: FrameId) {
        self.ring.push_back(frame);
    }

    fn untrack(&mut self, frame: FrameId) {
        // A victim was just rotated to the back.
        if self.ring.back() == Some(&frame) {
            self.ring.pop_back();
        } else {
            self.ring.retain(|&tracked| tracked != frame);
        }
    }

    fn select_victim(&mut self, frames: &FrameTable, page_tables: &dyn PageTables) -> FrameId {
        // First lap clears every accessed bit, so the second always ends.
        let mut budget = 2 * self.ring.len();
        let mut fallback = None;

        while budget > 0 {
            budget -= 1;
            let Some(id) = self.ring.pop_front() else {
                break;
            };
            let frame = frames.frame(id);
            if frame.is_swapped() {
                trace!("clock: dropping swapped frame {:?}", id);
                continue;
            }

            self.ring.push_back(id);
            if fallback.is_none() {
                fallback = Some(id);
            }

            let Some(&first) = frame.owners().first() else {
                return id;
            };
            let page = frames.page(first);
            let (tid, upage) = (page.owner_thread(), page.virtual_address());
            if page_tables.is_accessed(tid, upage) {
                trace!("clock: second chance for {}", frame.kpage());
                page_tables.set_accessed(tid, upage, false);
            } else {
                return id;
            }
        }

        // Only reachable when user threads keep re-touching pages mid-scan.
        if let Some(id) = fallback {
            warn!("clock: no unaccessed frame after two laps, taking {:?}", id);
            return id;
        }
        error!("clock: no resident frame to evict");
        panic!("no evictable frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::SoftPageTables;
    use crate::swapping::SwapSlot;
    use kidneyvm_shared::mem::{KernelAddr, UserAddr, OFFSET};
    use std::vec::Vec;

    const KPAGE: KernelAddr = KernelAddr::new(OFFSET + 0x0010_0000);
    const UPAGE: UserAddr = UserAddr::new(0x0804_8000);

    struct Fixture {
        frames: FrameTable,
        tables: SoftPageTables,
        clock: SecondChance,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                frames: FrameTable::new(),
                tables: SoftPageTables::new(),
                clock: SecondChance::new(),
            }
        }

        /// A frame mapped by thread 1 at the `n`th user page.
        fn mapped(&mut self, n: usize) -> FrameId {
            let kpage = KPAGE.add_pages(n);
            let upage = UPAGE.add_pages(n);
            let frame = self.frames.register(kpage, 1);
            self.frames.attach(frame, 1, upage, true);
            assert!(self.tables.install(1, upage, kpage, true));
            self.clock.track(frame);
            frame
        }

        fn touch(&self, n: usize) {
            assert!(self.tables.touch(1, UPAGE.add_pages(n), false));
        }

        fn select(&mut self) -> FrameId {
            self.clock.select_victim(&self.frames, &self.tables)
        }
    }

    #[test]
    fn unaccessed_front_frame_is_taken() {
        let mut fx = Fixture::new();
        let frames: Vec<_> = (0..3).map(|n| fx.mapped(n)).collect();
        assert_eq!(fx.select(), frames[0]);
        // The victim was rotated to the back.
        assert_eq!(fx.clock.ring().collect::<Vec<_>>(), [frames[1], frames[2], frames[0]]);
    }

    #[test]
    fn accessed_frames_get_a_second_chance() {
        let mut fx = Fixture::new();
        let frames: Vec<_> = (0..3).map(|n| fx.mapped(n)).collect();
        fx.touch(0);
        fx.touch(1);

        assert_eq!(fx.select(), frames[2]);
        assert!(!fx.tables.is_accessed(1, UPAGE));
        assert!(!fx.tables.is_accessed(1, UPAGE.add_pages(1)));
    }

    #[test]
    fn all_accessed_ends_on_second_lap() {
        let mut fx = Fixture::new();
        let frames: Vec<_> = (0..4).map(|n| fx.mapped(n)).collect();
        for n in 0..4 {
            fx.touch(n);
        }
        assert_eq!(fx.select(), frames[0]);
    }

    #[test]
    fn only_first_owner_is_consulted() {
        let mut fx = Fixture::new();
        let shared = fx.mapped(0);
        let alias = UPAGE.add_pages(8);
        fx.frames.attach(shared, 2, alias, false);
        assert!(fx.tables.install(2, alias, KPAGE, false));
        let other = fx.mapped(1);

        // The alias was touched, the first owner was not.
        assert!(fx.tables.touch(2, alias, false));
        assert_eq!(fx.select(), shared);

        fx.touch(0);
        assert_eq!(fx.select(), other);
    }

    #[test]
    fn ownerless_frame_is_taken_at_once() {
        let mut fx = Fixture::new();
        let mapped = fx.mapped(0);
        let orphan = fx.frames.register(KPAGE.add_pages(9), 1);
        fx.clock.track(orphan);
        fx.touch(0);

        assert_eq!(fx.select(), orphan);
        assert_eq!(fx.clock.ring().collect::<Vec<_>>(), [mapped, orphan]);
        assert!(!fx.tables.is_accessed(1, UPAGE));
    }

    #[test]
    fn ownerless_frame_at_front_needs_no_bit() {
        let mut fx = Fixture::new();
        let orphan = fx.frames.register(KPAGE.add_pages(9), 1);
        fx.clock.track(orphan);
        fx.mapped(0);
        fx.touch(0);

        assert_eq!(fx.select(), orphan);
        // The mapped frame was never inspected.
        assert!(fx.tables.is_accessed(1, UPAGE));
    }

    #[test]
    fn stale_swapped_entries_are_dropped() {
        let mut fx = Fixture::new();
        let swapped = fx.mapped(0);
        let resident = fx.mapped(1);
        fx.frames.mark_swapped(swapped, SwapSlot::from_index(0));

        assert_eq!(fx.select(), resident);
        assert_eq!(fx.clock.ring().collect::<Vec<_>>(), [resident]);
    }

    #[test]
    fn untrack_removes_anywhere_in_ring() {
        let mut fx = Fixture::new();
        let frames: Vec<_> = (0..3).map(|n| fx.mapped(n)).collect();
        fx.clock.untrack(frames[1]);
        fx.clock.untrack(frames[2]);
        assert_eq!(fx.clock.ring().collect::<Vec<_>>(), [frames[0]]);
    }

    #[test]
    fn fair_within_one_pass() {
        // Frames accessed at scan start are never chosen while an
        // unaccessed one exists.
        let mut fx = Fixture::new();
        let frames: Vec<_> = (0..6).map(|n| fx.mapped(n)).collect();
        for n in [0, 1, 3, 4] {
            fx.touch(n);
        }
        let first = fx.select();
        fx.clock.untrack(first);
        let second = fx.select();
        assert_eq!([first, second], [frames[2], frames[5]]);
    }

    #[test]
    #[should_panic(expected = "no evictable frame")]
    fn empty_ring_is_fatal() {
        Fixture::new().select();
    }
}
