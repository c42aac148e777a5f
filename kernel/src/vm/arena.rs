use alloc::vec::Vec;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot<T> {
    Occupied(T),
    Vacant { next_free: Option<usize> },
}

/// A vector of records addressed by stable indices.
///
/// Removing a record leaves a hole that is threaded onto a free list and
/// reused by the next insertion, so indices of live records never move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> usize {
        self.len += 1;
        match self.free_head {
            Some(index) => {
                let Slot::Vacant { next_free } = self.slots[index] else {
                    unreachable!("free list points at an occupied slot");
                };
                self.free_head = next_free;
                self.slots[index] = Slot::Occupied(value);
                index
            }
            None => {
                self.slots.push(Slot::Occupied(value));
                self.slots.len() - 1
            }
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        match self.slots.get(index) {
            Some(Slot::Occupied(_)) => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            next_free: self.free_head,
        };
        let Slot::Occupied(value) = core::mem::replace(&mut self.slots[index], vacant) else {
            unreachable!();
        };
        self.free_head = Some(index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        match self.slots.get(index) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.slots.get_mut(index) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(value) => Some((index, value)),
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
