// SlotBoard: fixed-size slot array plus the category counts that enforce
// `max_per_category`. Pins are resolved here too since every strategy starts
// from the same pinned board.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use quire_common::types::{AllocatedSlot, PinOverrides};

use super::SlotItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Pinned(Uuid),
    Filled(Uuid),
}

#[derive(Debug, Clone)]
pub struct SlotBoard {
    slots: Vec<Slot>,
    max_per_category: Option<usize>,
    category_counts: HashMap<String, usize>,
    placed: HashSet<Uuid>,
}

impl SlotBoard {
    pub fn new(capacity: usize, max_per_category: Option<usize>) -> Self {
        Self {
            slots: vec![Slot::Empty; capacity],
            max_per_category,
            category_counts: HashMap::new(),
            placed: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| *s != Slot::Empty)
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| **s == Slot::Empty).count()
    }

    pub fn contains(&self, item_id: Uuid) -> bool {
        self.placed.contains(&item_id)
    }

    fn count(&mut self, item: &SlotItem) {
        if let Some(category) = &item.category {
            *self.category_counts.entry(category.clone()).or_default() += 1;
        }
        self.placed.insert(item.id);
    }

    /// Whether placing `item` would exceed the category cap. Uncategorized
    /// items are never capped.
    pub fn category_full(&self, item: &SlotItem) -> bool {
        match (&item.category, self.max_per_category) {
            (Some(category), Some(cap)) => {
                self.category_counts.get(category).copied().unwrap_or(0) >= cap
            }
            _ => false,
        }
    }

    /// Pin `item` at 1-based `position`. Fails when the position is out of
    /// range or already taken, or when the item's category is already at its
    /// cap; the caller returns the item to the pool.
    pub fn pin(&mut self, position: usize, item: &SlotItem) -> bool {
        if position == 0
            || position > self.slots.len()
            || self.contains(item.id)
            || self.category_full(item)
        {
            return false;
        }
        let slot = &mut self.slots[position - 1];
        if *slot != Slot::Empty {
            return false;
        }
        *slot = Slot::Pinned(item.id);
        self.count(item);
        true
    }

    /// Place `item` in the first empty slot subject to the category cap.
    pub fn fill(&mut self, item: &SlotItem) -> bool {
        if self.contains(item.id) || self.category_full(item) {
            return false;
        }
        let Some(slot) = self.slots.iter_mut().find(|s| **s == Slot::Empty) else {
            return false;
        };
        *slot = Slot::Filled(item.id);
        self.count(item);
        true
    }

    /// Place `item` in the first empty slot without a category check.
    /// Used for operator selections, which override caps.
    pub fn fill_unchecked(&mut self, item_id: Uuid) -> bool {
        if self.placed.contains(&item_id) {
            return false;
        }
        let Some(slot) = self.slots.iter_mut().find(|s| **s == Slot::Empty) else {
            return false;
        };
        *slot = Slot::Filled(item_id);
        self.placed.insert(item_id);
        true
    }

    /// Occupied slots ordered by position.
    pub fn into_slots(self) -> Vec<AllocatedSlot> {
        self.slots
            .into_iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Empty => None,
                Slot::Pinned(item_id) => Some(AllocatedSlot {
                    position: i + 1,
                    item_id,
                    pinned: true,
                }),
                Slot::Filled(item_id) => Some(AllocatedSlot {
                    position: i + 1,
                    item_id,
                    pinned: false,
                }),
            })
            .collect()
    }

    /// Rebuild a board from stored slots (pinned ones only when `pins_only`).
    pub fn from_slots(capacity: usize, slots: &[AllocatedSlot], pins_only: bool) -> Self {
        let mut board = Self::new(capacity, None);
        for slot in slots {
            if pins_only && !slot.pinned {
                continue;
            }
            if slot.position == 0 || slot.position > capacity {
                continue;
            }
            board.slots[slot.position - 1] = if slot.pinned {
                Slot::Pinned(slot.item_id)
            } else {
                Slot::Filled(slot.item_id)
            };
            board.placed.insert(slot.item_id);
        }
        board
    }
}

/// Effective pin for one item: `Some((position, from_override))`.
///
/// Per-issue overrides win over the item's global pin: `None` unpins,
/// `Some(p)` moves it. Items with an override but no global pin are pinned
/// by the override alone.
pub fn effective_pin(item: &SlotItem, overrides: &PinOverrides) -> Option<(usize, bool)> {
    match overrides.get(&item.id) {
        Some(Some(position)) => Some((*position, item.pinned_position.is_none())),
        Some(None) => None,
        None => item.pinned_position.map(|p| (p, false)),
    }
}

/// Phase 0: place pinned items. Global pins go first, then issue-only pins,
/// each group in position order; the first writer wins a slot. Returns the
/// ids that could not be pinned so they can compete in the regular fill.
pub fn place_pins(board: &mut SlotBoard, items: &[SlotItem], overrides: &PinOverrides) -> HashSet<Uuid> {
    let mut pinned: Vec<(bool, usize, &SlotItem)> = items
        .iter()
        .filter_map(|item| {
            effective_pin(item, overrides).map(|(pos, issue_only)| (issue_only, pos, item))
        })
        .collect();
    pinned.sort_by(|a, b| (a.0, a.1, &a.2.name, a.2.id).cmp(&(b.0, b.1, &b.2.name, b.2.id)));

    let mut losers = HashSet::new();
    for (_, position, item) in pinned {
        if !board.pin(position, item) {
            losers.insert(item.id);
        }
    }
    losers
}
