//! Allocation behaviour through the store: category caps, pin overrides,
//! operator assignment, plus seeded-loop checks of the selector's bounds
//! with random pins and per-issue overrides.
//!
//! Run with: cargo test -p quire-pipeline --test allocation_test

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use quire_common::types::{Asset, IssueStatus, Module, PinOverrides, SelectionMode};
use quire_common::QuireError;
use quire_pipeline::allocation::board::effective_pin;
use quire_pipeline::allocation::{
    allocate, assign_manual, select_for_module, Selection, SlotItem,
};
use quire_pipeline::testing::{asset, asset_module, deps_with, issue_on, test_date};
use quire_store::{IssueStore, MemoryStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn seed_module(store: &MemoryStore, module: &Module, assets: &[Asset]) {
    store.insert_module(module.clone()).unwrap();
    for a in assets {
        store.insert_asset(a.clone()).unwrap();
    }
}

fn names(assets: &[Asset], ids: &[Uuid]) -> Vec<String> {
    ids.iter()
        .filter_map(|id| assets.iter().find(|a| a.id == *id))
        .map(|a| a.name.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Category caps and pins
// ---------------------------------------------------------------------------

#[tokio::test]
async fn category_cap_leaves_room_for_a_non_affiliate() {
    let store = Arc::new(MemoryStore::new());
    let issue = issue_on(store.as_ref()).await;
    let mut module = asset_module("sponsors", 3, SelectionMode::AffiliatePriority);
    module.max_per_category = Some(1);
    let assets = vec![
        asset(&module, "tools-9", Some("tools"), true, 9),
        asset(&module, "tools-7", Some("tools"), true, 7),
        asset(&module, "tools-5", Some("tools"), true, 5),
        asset(&module, "travel-8", Some("travel"), true, 8),
        asset(&module, "travel-6", Some("travel"), true, 6),
        asset(&module, "community", None, false, 0),
    ];
    seed_module(&store, &module, &assets);

    let summary = allocate(&deps_with(store.clone()), &issue, &module).await.unwrap();
    assert_eq!(summary.filled, 3);

    let allocation = store.get_allocation(issue.id, module.id).await.unwrap().unwrap();
    assert_eq!(
        names(&assets, &allocation.item_ids()),
        vec!["tools-9", "travel-8", "community"]
    );
}

#[tokio::test]
async fn unpinned_override_lets_a_priority_affiliate_take_slot_one() {
    let store = Arc::new(MemoryStore::new());
    let issue = issue_on(store.as_ref()).await;
    let module = asset_module("sponsors", 2, SelectionMode::AffiliatePriority);
    let mut house = asset(&module, "house-ad", None, false, 0);
    house.pinned_position = Some(1);
    let partner = asset(&module, "partner", None, true, 5);
    seed_module(&store, &module, &[house.clone(), partner.clone()]);
    store
        .set_pin_override(issue.id, module.id, house.id, None)
        .unwrap();

    allocate(&deps_with(store.clone()), &issue, &module).await.unwrap();

    let allocation = store.get_allocation(issue.id, module.id).await.unwrap().unwrap();
    let first = allocation.slots.iter().find(|s| s.position == 1).unwrap();
    assert_eq!(first.item_id, partner.id);
    assert!(!first.pinned);
    assert!(allocation.slots.iter().all(|s| !s.pinned));
}

#[tokio::test]
async fn issue_override_pins_an_unpinned_asset() {
    let store = Arc::new(MemoryStore::new());
    let issue = issue_on(store.as_ref()).await;
    let module = asset_module("apps", 3, SelectionMode::Random);
    let featured = asset(&module, "featured", None, false, 0);
    let others: Vec<Asset> = (0..4)
        .map(|i| asset(&module, &format!("app{i}"), None, false, 0))
        .collect();
    let mut all = others.clone();
    all.push(featured.clone());
    seed_module(&store, &module, &all);
    store
        .set_pin_override(issue.id, module.id, featured.id, Some(3))
        .unwrap();

    allocate(&deps_with(store.clone()), &issue, &module).await.unwrap();

    let allocation = store.get_allocation(issue.id, module.id).await.unwrap().unwrap();
    let third = allocation.slots.iter().find(|s| s.position == 3).unwrap();
    assert_eq!(third.item_id, featured.id);
    assert!(third.pinned);
    assert_eq!(allocation.slots.len(), 3);
}

#[tokio::test]
async fn rerunning_allocation_gives_the_same_slots() {
    let store = Arc::new(MemoryStore::new());
    let issue = issue_on(store.as_ref()).await;
    let module = asset_module("apps", 3, SelectionMode::Random);
    let assets: Vec<Asset> = (0..8)
        .map(|i| asset(&module, &format!("app{i}"), None, i % 2 == 0, i))
        .collect();
    seed_module(&store, &module, &assets);
    let deps = deps_with(store.clone());

    allocate(&deps, &issue, &module).await.unwrap();
    let first = store.get_allocation(issue.id, module.id).await.unwrap().unwrap();
    allocate(&deps, &issue, &module).await.unwrap();
    let second = store.get_allocation(issue.id, module.id).await.unwrap().unwrap();

    assert_eq!(first.slots, second.slots);
}

// ---------------------------------------------------------------------------
// Operator assignment
// ---------------------------------------------------------------------------

struct ManualFixture {
    store: Arc<MemoryStore>,
    issue_id: Uuid,
    module: Module,
    pinned: Asset,
    picks: Vec<Asset>,
}

/// Manual module with two slots: one global pin at position 1 and three
/// selectable assets. Allocation has run, so the module awaits selection.
async fn manual_fixture() -> ManualFixture {
    let store = Arc::new(MemoryStore::new());
    let issue = issue_on(store.as_ref()).await;
    let module = asset_module("polls", 2, SelectionMode::Manual);
    let mut pinned = asset(&module, "weekly-poll", None, false, 0);
    pinned.pinned_position = Some(1);
    let picks: Vec<Asset> = ["best-editor", "tabs-or-spaces", "favourite-language"]
        .iter()
        .map(|name| asset(&module, name, None, false, 0))
        .collect();
    let mut all = picks.clone();
    all.push(pinned.clone());
    seed_module(&store, &module, &all);

    let summary = allocate(&deps_with(store.clone()), &issue, &module).await.unwrap();
    assert!(summary.awaiting_selection);

    ManualFixture {
        store,
        issue_id: issue.id,
        module,
        pinned,
        picks,
    }
}

#[tokio::test]
async fn manual_module_keeps_pins_while_awaiting_selection() {
    let f = manual_fixture().await;
    let allocation = f
        .store
        .get_allocation(f.issue_id, f.module.id)
        .await
        .unwrap()
        .unwrap();
    assert!(allocation.awaiting_selection);
    assert_eq!(allocation.item_ids(), vec![f.pinned.id]);
}

#[tokio::test]
async fn assignment_fills_free_slots_after_pins() {
    let f = manual_fixture().await;
    let allocation = assign_manual(f.store.as_ref(), f.issue_id, "polls", &[f.picks[1].id])
        .await
        .unwrap();

    assert!(!allocation.awaiting_selection);
    assert!(allocation.manually_edited);
    assert_eq!(allocation.item_ids(), vec![f.pinned.id, f.picks[1].id]);

    // Still processing: assets are marked used at finalization, not now.
    let used = f
        .store
        .assets()
        .unwrap()
        .into_iter()
        .filter(|a| a.last_used_on.is_some())
        .count();
    assert_eq!(used, 0);
}

#[tokio::test]
async fn reassignment_replaces_the_previous_pick() {
    let f = manual_fixture().await;
    assign_manual(f.store.as_ref(), f.issue_id, "polls", &[f.picks[0].id])
        .await
        .unwrap();
    let allocation = assign_manual(f.store.as_ref(), f.issue_id, "polls", &[f.picks[2].id])
        .await
        .unwrap();
    assert_eq!(allocation.item_ids(), vec![f.pinned.id, f.picks[2].id]);
}

#[tokio::test]
async fn automatic_allocation_leaves_operator_edits_alone() {
    let f = manual_fixture().await;
    assign_manual(f.store.as_ref(), f.issue_id, "polls", &[f.picks[0].id])
        .await
        .unwrap();

    let issue = f.store.get_issue(f.issue_id).await.unwrap().unwrap();
    let summary = allocate(&deps_with(f.store.clone()), &issue, &f.module)
        .await
        .unwrap();
    assert!(summary.skipped_manual_edit);

    let allocation = f
        .store
        .get_allocation(f.issue_id, f.module.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocation.item_ids(), vec![f.pinned.id, f.picks[0].id]);
}

#[tokio::test]
async fn assignment_on_a_draft_issue_is_finalized_immediately() {
    let f = manual_fixture().await;
    f.store
        .set_issue_status(f.issue_id, IssueStatus::Draft, None)
        .await
        .unwrap();

    assign_manual(f.store.as_ref(), f.issue_id, "polls", &[f.picks[0].id])
        .await
        .unwrap();

    let used: HashSet<Uuid> = f
        .store
        .assets()
        .unwrap()
        .into_iter()
        .filter(|a| a.last_used_on == Some(test_date()))
        .map(|a| a.id)
        .collect();
    assert_eq!(used, HashSet::from([f.pinned.id, f.picks[0].id]));
}

#[tokio::test]
async fn assignment_rejects_more_items_than_free_slots() {
    let f = manual_fixture().await;
    let err = assign_manual(
        f.store.as_ref(),
        f.issue_id,
        "polls",
        &[f.picks[0].id, f.picks[1].id],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, QuireError::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn assignment_rejects_duplicate_ids() {
    let f = manual_fixture().await;
    let err = assign_manual(
        f.store.as_ref(),
        f.issue_id,
        "polls",
        &[f.picks[0].id, f.picks[0].id],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, QuireError::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn assignment_rejects_items_from_outside_the_module() {
    let f = manual_fixture().await;
    let err = assign_manual(f.store.as_ref(), f.issue_id, "polls", &[Uuid::new_v4()])
        .await
        .unwrap_err();
    assert!(matches!(err, QuireError::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn assignment_to_unknown_module_is_not_found() {
    let f = manual_fixture().await;
    let err = assign_manual(f.store.as_ref(), f.issue_id, "missing", &[f.picks[0].id])
        .await
        .unwrap_err();
    assert!(matches!(err, QuireError::NotFound { .. }), "got {err:?}");
}

#[tokio::test]
async fn sent_issue_cannot_be_edited() {
    let f = manual_fixture().await;
    f.store
        .set_issue_status(f.issue_id, IssueStatus::Sent, None)
        .await
        .unwrap();

    let err = assign_manual(f.store.as_ref(), f.issue_id, "polls", &[f.picks[0].id])
        .await
        .unwrap_err();
    assert!(matches!(err, QuireError::Validation(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Seeded loops over the pure selector
// ---------------------------------------------------------------------------

const CATEGORIES: [&str; 3] = ["tools", "travel", "food"];

fn random_module(rng: &mut StdRng) -> Module {
    let mode = match rng.random_range(0..2) {
        0 => SelectionMode::AffiliatePriority,
        _ => SelectionMode::Random,
    };
    let mut module = asset_module("loop", rng.random_range(1..=5), mode);
    module.max_per_category = rng.random_bool(0.6).then(|| rng.random_range(1..=2));
    module.cooldown_days = rng.random_range(0..=10);
    module
}

fn random_items(rng: &mut StdRng, module: &Module) -> Vec<SlotItem> {
    (0..rng.random_range(0..12))
        .map(|i| {
            let category = rng
                .random_bool(0.7)
                .then(|| CATEGORIES[rng.random_range(0..CATEGORIES.len())]);
            let mut a = asset(
                module,
                &format!("item{i}"),
                category,
                rng.random_bool(0.5),
                rng.random_range(0..10),
            );
            if rng.random_bool(0.4) {
                a.last_used_on = Some(test_date() - Duration::days(rng.random_range(0..15)));
            }
            // Position 0 and positions past capacity are out of range on purpose.
            a.pinned_position = rng.random_bool(0.25).then(|| rng.random_range(0..=6));
            SlotItem::from(&a)
        })
        .collect()
}

fn random_overrides(rng: &mut StdRng, items: &[SlotItem]) -> PinOverrides {
    let mut overrides = PinOverrides::new();
    for item in items {
        if rng.random_bool(0.2) {
            let position = rng.random_bool(0.7).then(|| rng.random_range(1..=6));
            overrides.insert(item.id, position);
        }
    }
    overrides
}

fn assert_pins_hold_their_position(
    selection: &Selection,
    items: &[SlotItem],
    overrides: &PinOverrides,
    round: usize,
) {
    for slot in selection.slots().iter().filter(|s| s.pinned) {
        let item = items.iter().find(|i| i.id == slot.item_id).unwrap();
        assert_eq!(
            effective_pin(item, overrides).map(|(p, _)| p),
            Some(slot.position),
            "round {round}: {} pinned off its position",
            item.name
        );
    }
}

#[test]
fn selection_never_exceeds_capacity_or_category_caps() {
    let mut rng = StdRng::seed_from_u64(20261014);
    for round in 0..300 {
        let module = random_module(&mut rng);
        let items = random_items(&mut rng, &module);
        let overrides = random_overrides(&mut rng, &items);
        let selection = select_for_module(&items, &module, test_date(), &overrides, rng.random());
        assert_pins_hold_their_position(&selection, &items, &overrides, round);
        let slots = selection.slots();

        assert!(slots.len() <= module.capacity, "round {round}");
        let positions: HashSet<usize> = slots.iter().map(|s| s.position).collect();
        assert_eq!(positions.len(), slots.len(), "round {round}: positions repeat");
        assert!(positions.iter().all(|p| (1..=module.capacity).contains(p)));

        if let Some(cap) = module.max_per_category {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for slot in slots {
                let item = items.iter().find(|i| i.id == slot.item_id).unwrap();
                if let Some(category) = item.category.as_deref() {
                    *counts.entry(category).or_default() += 1;
                }
            }
            assert!(counts.values().all(|n| *n <= cap), "round {round}: {counts:?}");
        }
    }
}

#[test]
fn affiliates_inside_cooldown_are_never_selected() {
    let mut rng = StdRng::seed_from_u64(7);
    for round in 0..300 {
        let mut module = random_module(&mut rng);
        module.selection_mode = SelectionMode::AffiliatePriority;
        module.cooldown_days = rng.random_range(1..=10);
        let items = random_items(&mut rng, &module);
        let overrides = random_overrides(&mut rng, &items);
        let selection = select_for_module(&items, &module, test_date(), &overrides, rng.random());
        assert_pins_hold_their_position(&selection, &items, &overrides, round);

        for slot in selection.slots() {
            let item = items.iter().find(|i| i.id == slot.item_id).unwrap();
            if !item.is_affiliate {
                continue;
            }
            if let Some(last) = item.last_used_on {
                assert!(
                    (test_date() - last).num_days() >= module.cooldown_days,
                    "round {round}: {} used {last}",
                    item.name
                );
            }
        }
    }
}

#[test]
fn selection_is_a_function_of_its_inputs() {
    let mut rng = StdRng::seed_from_u64(99);
    for round in 0..100 {
        let module = random_module(&mut rng);
        let items = random_items(&mut rng, &module);
        let overrides = random_overrides(&mut rng, &items);
        let seed: u64 = rng.random();
        let mut shuffled = items.clone();
        shuffled.reverse();

        let a = select_for_module(&items, &module, test_date(), &overrides, seed);
        let b = select_for_module(&shuffled, &module, test_date(), &overrides, seed);
        assert_eq!(a, b, "round {round}");
    }
}
