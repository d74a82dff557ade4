// Selection strategies, one per module selection mode. Each receives the
// board with pins already placed and the remaining pool.

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use quire_common::types::SelectionMode;

use super::board::SlotBoard;
use super::{Selection, SlotItem};

/// Inputs shared by every strategy for one module allocation.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub as_of: NaiveDate,
    pub cooldown_days: i64,
    pub seed: u64,
}

impl SelectionContext {
    /// An item is outside cooldown when it was never used or was last used
    /// at least `cooldown_days` before `as_of`.
    pub fn cooled_down(&self, item: &SlotItem) -> bool {
        match item.last_used_on {
            None => true,
            Some(last) => (self.as_of - last).num_days() >= self.cooldown_days,
        }
    }
}

pub trait SelectionStrategy: Send + Sync {
    fn mode(&self) -> SelectionMode;

    fn select(&self, board: SlotBoard, pool: Vec<&SlotItem>, ctx: &SelectionContext) -> Selection;
}

pub fn strategy_for(mode: SelectionMode) -> &'static dyn SelectionStrategy {
    match mode {
        SelectionMode::AffiliatePriority => &AffiliatePriority,
        SelectionMode::Random => &RandomFill,
        SelectionMode::Manual => &ManualSelection,
    }
}

/// Fill the board in `order`, first fit, skipping capped categories.
fn fill_in_order(board: &mut SlotBoard, order: &[&SlotItem]) {
    for item in order {
        if board.is_full() {
            break;
        }
        board.fill(item);
    }
}

/// Deterministic shuffle: sort by id, then shuffle with the seeded RNG.
fn seeded_shuffle<'a>(mut items: Vec<&'a SlotItem>, seed: u64) -> Vec<&'a SlotItem> {
    items.sort_by_key(|i| i.id);
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
    items
}

/// Eligible affiliates by priority first, then non-affiliates in seeded
/// random order. Affiliates inside cooldown are never selected.
pub struct AffiliatePriority;

impl SelectionStrategy for AffiliatePriority {
    fn mode(&self) -> SelectionMode {
        SelectionMode::AffiliatePriority
    }

    fn select(&self, mut board: SlotBoard, pool: Vec<&SlotItem>, ctx: &SelectionContext) -> Selection {
        let (mut affiliates, others): (Vec<&SlotItem>, Vec<&SlotItem>) =
            pool.into_iter().partition(|i| i.is_affiliate);
        affiliates.retain(|i| ctx.cooled_down(i));
        affiliates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });

        fill_in_order(&mut board, &affiliates);
        fill_in_order(&mut board, &seeded_shuffle(others, ctx.seed));
        Selection::Assigned(board.into_slots())
    }
}

/// Every remaining item in seeded random order.
pub struct RandomFill;

impl SelectionStrategy for RandomFill {
    fn mode(&self) -> SelectionMode {
        SelectionMode::Random
    }

    fn select(&self, mut board: SlotBoard, pool: Vec<&SlotItem>, ctx: &SelectionContext) -> Selection {
        fill_in_order(&mut board, &seeded_shuffle(pool, ctx.seed));
        Selection::Assigned(board.into_slots())
    }
}

/// An operator picks the items; only pins are resolved automatically.
pub struct ManualSelection;

impl SelectionStrategy for ManualSelection {
    fn mode(&self) -> SelectionMode {
        SelectionMode::Manual
    }

    fn select(&self, board: SlotBoard, _pool: Vec<&SlotItem>, _ctx: &SelectionContext) -> Selection {
        Selection::SelectionRequired {
            pinned: board.into_slots(),
        }
    }
}
