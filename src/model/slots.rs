//! Slot Allocator
//!
//! Bijection between connected devices and disjoint 4-wide offsets into
//! the sample register. A freed slot remembers its last holder so a
//! device that drops and comes back lands on the same channels.

use std::collections::HashMap;

use crate::core::constants::{SLOT_COUNT, SLOT_WIDTH};
use crate::core::events::ObjectPath;

#[derive(Debug, Clone)]
struct FreeSlot {
    offset: usize,
    last_holder: Option<ObjectPath>,
}

#[derive(Debug)]
pub struct SlotAllocator {
    allocated: HashMap<ObjectPath, usize>,
    free: Vec<FreeSlot>,
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self {
            allocated: HashMap::new(),
            free: (0..SLOT_COUNT)
                .map(|i| FreeSlot {
                    offset: i * SLOT_WIDTH,
                    last_holder: None,
                })
                .collect(),
        }
    }
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns an offset to `path`: the offset it held before if that is
    /// still free, otherwise the smallest free offset. Returns `None`
    /// when every slot is taken.
    pub fn allocate(&mut self, path: &str) -> Option<usize> {
        if let Some(&offset) = self.allocated.get(path) {
            return Some(offset);
        }
        let idx = self
            .free
            .iter()
            .position(|slot| slot.last_holder.as_deref() == Some(path))
            .or_else(|| {
                self.free
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.offset)
                    .map(|(idx, _)| idx)
            })?;
        let slot = self.free.swap_remove(idx);
        self.allocated.insert(path.to_string(), slot.offset);
        Some(slot.offset)
    }

    /// Returns `path`'s offset to the free set, remembering the holder.
    /// A no-op for unknown paths.
    pub fn deallocate(&mut self, path: &str) {
        if let Some(offset) = self.allocated.remove(path) {
            self.free.push(FreeSlot {
                offset,
                last_holder: Some(path.to_string()),
            });
        }
    }

    pub fn offset_of(&self, path: &str) -> Option<usize> {
        self.allocated.get(path).copied()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[cfg(test)]
    fn all_offsets(&self) -> Vec<usize> {
        let mut offsets: Vec<usize> = self
            .allocated
            .values()
            .copied()
            .chain(self.free.iter().map(|slot| slot.offset))
            .collect();
        offsets.sort_unstable();
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [usize; 6] = [0, 4, 8, 12, 16, 20];

    #[test]
    fn allocates_smallest_free_offset_first() {
        let mut slots = SlotAllocator::new();
        assert_eq!(slots.allocate("/d1"), Some(0));
        assert_eq!(slots.allocate("/d2"), Some(4));
        assert_eq!(slots.allocate("/d3"), Some(8));
        assert_eq!(slots.all_offsets(), ALL);
    }

    #[test]
    fn allocate_is_idempotent_per_path() {
        let mut slots = SlotAllocator::new();
        assert_eq!(slots.allocate("/d1"), Some(0));
        assert_eq!(slots.allocate("/d1"), Some(0));
        assert_eq!(slots.free_count(), 5);
    }

    #[test]
    fn deallocate_returns_the_taken_offset() {
        let mut slots = SlotAllocator::new();
        let offset = slots.allocate("/d1").unwrap();
        slots.deallocate("/d1");
        assert_eq!(slots.offset_of("/d1"), None);
        assert_eq!(slots.free_count(), 6);
        assert!(slots.all_offsets().contains(&offset));
    }

    #[test]
    fn deallocate_unknown_path_is_a_noop() {
        let mut slots = SlotAllocator::new();
        slots.deallocate("/ghost");
        assert_eq!(slots.all_offsets(), ALL);
    }

    #[test]
    fn reobserved_device_reuses_its_old_offset() {
        let mut slots = SlotAllocator::new();
        slots.allocate("/d1");
        slots.allocate("/d2");
        slots.allocate("/d3");
        slots.deallocate("/d1");
        slots.deallocate("/d3");
        // The remembered offset wins over the smaller free one.
        assert_eq!(slots.allocate("/d3"), Some(8));
        assert_eq!(slots.allocate("/d4"), Some(0));
    }

    #[test]
    fn remembered_offset_is_not_reserved() {
        let mut slots = SlotAllocator::new();
        slots.allocate("/d1");
        slots.deallocate("/d1");
        // Offset 0 is free again and the smallest, so a new device takes
        // it despite the remembered holder.
        assert_eq!(slots.allocate("/d2"), Some(0));
    }

    #[test]
    fn refuses_a_seventh_device() {
        let mut slots = SlotAllocator::new();
        for i in 0..6 {
            assert!(slots.allocate(&format!("/d{}", i)).is_some());
        }
        assert_eq!(slots.allocate("/d6"), None);
        assert_eq!(slots.free_count(), 0);
        assert_eq!(slots.all_offsets(), ALL);
    }
}
