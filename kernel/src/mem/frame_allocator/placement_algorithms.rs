//! Implementation of some common frame placement policies.

use super::CoreMapEntry;
use core::ops::Range;

/// A placement algorithm for allocating single frames out of a pool.
pub trait PlacementAlgorithm: Default + Send {
    /// Returns the frame number to allocate from `pool`, a range of indices
    /// into `core_map`, or [`None`] if every frame in the pool is taken.
    fn place(&mut self, core_map: &[CoreMapEntry], pool: Range<usize>) -> Option<usize>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

// No internal state. Declared as a zero-sized type.
#[derive(Default)]
pub struct FirstFit;

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry], pool: Range<usize>) -> Option<usize> {
        if pool.is_empty() {
            return None;
        }

        // The cursor can be left over from another pool's range.
        let start = if pool.contains(&self.position) {
            self.position
        } else {
            pool.start
        };

        let found = (start..pool.end)
            .chain(pool.start..start)
            .find(|&frame| !core_map[frame].allocated())?;

        self.position = if found + 1 == pool.end {
            pool.start
        } else {
            found + 1
        };
        Some(found)
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(&mut self, core_map: &[CoreMapEntry], mut pool: Range<usize>) -> Option<usize> {
        pool.find(|&frame| !core_map[frame].allocated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Marks the coremap entries in `range` as allocated.
    fn fill_coremap_range(core_map: &mut [CoreMapEntry], range: Range<usize>) {
        for i in range {
            assert!(!core_map[i].allocated());
            core_map[i] = core_map[i].with_allocated(true);
        }
    }

    #[test]
    fn test_next_fit() {
        let mut core_map = [CoreMapEntry::DEFAULT; 8];
        fill_coremap_range(&mut core_map, 1..3);

        let mut algorithm = NextFit::default();
        assert_eq!(algorithm.place(&core_map, 0..8), Some(0));
        fill_coremap_range(&mut core_map, 0..1);

        // Continues after the last placement rather than restarting at 0.
        assert_eq!(algorithm.place(&core_map, 0..8), Some(3));
        core_map[0] = core_map[0].with_allocated(false);
        assert_eq!(algorithm.place(&core_map, 0..8), Some(4));
    }

    #[test]
    fn test_next_fit_wrap_around() {
        let mut core_map = [CoreMapEntry::DEFAULT; 8];
        fill_coremap_range(&mut core_map, 2..8);
        let mut algorithm = NextFit { position: 6 };
        assert_eq!(algorithm.place(&core_map, 0..8), Some(0));
        assert_eq!(algorithm.place(&core_map, 0..8), Some(1));
        fill_coremap_range(&mut core_map, 0..2);
        assert_eq!(algorithm.place(&core_map, 0..8), None);
    }

    #[test]
    fn test_next_fit_stays_in_pool() {
        let core_map = [CoreMapEntry::DEFAULT; 8];
        let mut algorithm = NextFit { position: 1 };
        assert_eq!(algorithm.place(&core_map, 4..8), Some(4));
        assert_eq!(algorithm.place(&core_map, 4..8), Some(5));
        assert_eq!(algorithm.place(&core_map, 4..4), None);
    }

    #[test]
    fn test_first_fit() {
        let mut core_map = [CoreMapEntry::DEFAULT; 8];
        fill_coremap_range(&mut core_map, 0..3);

        let mut algorithm = FirstFit;
        assert_eq!(algorithm.place(&core_map, 0..8), Some(3));
        assert_eq!(algorithm.place(&core_map, 0..2), None);
        assert_eq!(algorithm.place(&core_map, 2..8), Some(3));
    }
}
