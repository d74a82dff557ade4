//! Module slot allocation.
//!
//! `select_for_module` is pure: items, module config, date, pin overrides and
//! a seed in; slots out. The `allocate` step feeds it articles or assets from
//! the store and persists the result; `assign_manual` is the operator path for
//! manual-mode modules.

pub mod board;
pub mod strategy;

use std::collections::HashSet;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use quire_common::types::{
    AllocatedSlot, Asset, GeneratedArticle, Issue, IssueStatus, Module, ModuleAllocation,
    PinOverrides, SelectionMode,
};
use quire_common::{QuireError, Result};
use quire_store::IssueStore;

use crate::deps::PipelineDeps;
use board::{place_pins, SlotBoard};
use strategy::{strategy_for, SelectionContext};

/// What the selector knows about one allocatable item.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotItem {
    pub id: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub is_affiliate: bool,
    pub priority: i32,
    pub pinned_position: Option<usize>,
    pub last_used_on: Option<NaiveDate>,
}

impl From<&Asset> for SlotItem {
    fn from(asset: &Asset) -> Self {
        Self {
            id: asset.id,
            name: asset.name.clone(),
            category: asset.category.clone(),
            is_affiliate: asset.is_affiliate,
            priority: asset.priority,
            pinned_position: asset.pinned_position,
            last_used_on: asset.last_used_on,
        }
    }
}

impl SlotItem {
    /// Articles compete in the priority phase, ranked by source score:
    /// `priority` is the reverse of their score order.
    fn from_article(article: &GeneratedArticle, priority: i32) -> Self {
        Self {
            id: article.id,
            name: article.headline.clone(),
            category: article.category.clone(),
            is_affiliate: true,
            priority,
            pinned_position: None,
            last_used_on: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Assigned(Vec<AllocatedSlot>),
    /// Manual mode: pins are resolved, the rest waits for an operator.
    SelectionRequired { pinned: Vec<AllocatedSlot> },
}

impl Selection {
    pub fn slots(&self) -> &[AllocatedSlot] {
        match self {
            Self::Assigned(slots) => slots,
            Self::SelectionRequired { pinned } => pinned,
        }
    }
}

/// Stable per-(issue, module) seed for the random fill phases.
pub fn allocation_seed(issue_id: Uuid, module_id: Uuid) -> u64 {
    let (a, b) = issue_id.as_u64_pair();
    let (c, d) = module_id.as_u64_pair();
    a ^ b.rotate_left(17) ^ c.rotate_left(31) ^ d.rotate_left(47)
}

pub fn select_for_module(
    items: &[SlotItem],
    module: &Module,
    as_of: NaiveDate,
    overrides: &PinOverrides,
    seed: u64,
) -> Selection {
    let ctx = SelectionContext {
        as_of,
        cooldown_days: module.cooldown_days,
        seed,
    };
    let mut board = SlotBoard::new(module.capacity, module.max_per_category);
    if module.selection_mode == SelectionMode::AffiliatePriority {
        // Affiliates inside cooldown are not pinnable; the priority fill drops them too.
        let pinnable: Vec<SlotItem> = items
            .iter()
            .filter(|i| !i.is_affiliate || ctx.cooled_down(i))
            .cloned()
            .collect();
        place_pins(&mut board, &pinnable, overrides);
    } else {
        place_pins(&mut board, items, overrides);
    }

    let pool: Vec<&SlotItem> = items.iter().filter(|i| !board.contains(i.id)).collect();
    strategy_for(module.selection_mode).select(board, pool, &ctx)
}

/// Whether a generated article is ready to be placed: it has a body and
/// passed its fact-check.
pub fn allocatable(article: &GeneratedArticle, min_fact_check_ratio: f64) -> bool {
    !article.suppressed
        && article.body.is_some()
        && article
            .fact_check
            .as_ref()
            .is_some_and(|f| f.ratio() >= min_fact_check_ratio)
}

fn article_items(articles: &[GeneratedArticle], module: &Module, min_ratio: f64) -> Vec<SlotItem> {
    let mut ready: Vec<&GeneratedArticle> = articles
        .iter()
        .filter(|a| a.module_id == module.id && allocatable(a, min_ratio))
        .collect();
    ready.sort_by(|a, b| {
        b.source_score
            .partial_cmp(&a.source_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });
    let n = ready.len();
    ready
        .into_iter()
        .enumerate()
        .map(|(i, a)| SlotItem::from_article(a, i32::try_from(n - i).unwrap_or(i32::MAX)))
        .collect()
}

/// Set `rank` and `active` on a module's articles from its slots.
async fn apply_article_ranks(
    store: &dyn IssueStore,
    articles: &[GeneratedArticle],
    module: &Module,
    slots: &[AllocatedSlot],
) -> Result<()> {
    for article in articles.iter().filter(|a| a.module_id == module.id) {
        let rank = slots
            .iter()
            .find(|s| s.item_id == article.id)
            .and_then(|s| u32::try_from(s.position).ok());
        let active = rank.is_some();
        if article.rank == rank && article.active == active {
            continue;
        }
        let mut updated = article.clone();
        updated.rank = rank;
        updated.active = active;
        store.upsert_article(&updated).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationSummary {
    pub candidates: usize,
    pub filled: usize,
    pub pinned: usize,
    pub awaiting_selection: bool,
    pub skipped_manual_edit: bool,
}

pub async fn allocate(
    deps: &PipelineDeps,
    issue: &Issue,
    module: &Module,
) -> Result<AllocationSummary> {
    if let Some(existing) = deps.store.get_allocation(issue.id, module.id).await? {
        if existing.manually_edited {
            info!(module = module.slug.as_str(), "Allocation edited by operator, leaving as is");
            return Ok(AllocationSummary {
                filled: existing.slots.len(),
                pinned: existing.slots.iter().filter(|s| s.pinned).count(),
                skipped_manual_edit: true,
                ..AllocationSummary::default()
            });
        }
    }

    let (items, articles) = if module.kind.uses_generated_content() {
        let articles = deps.store.articles_for_issue(issue.id).await?;
        let items = article_items(&articles, module, deps.settings.min_fact_check_ratio);
        (items, articles)
    } else {
        let assets = deps.store.assets_for_module(module.id).await?;
        (assets.iter().map(SlotItem::from).collect(), Vec::new())
    };
    let overrides = deps.store.pin_overrides(issue.id, module.id).await?;

    let selection = select_for_module(
        &items,
        module,
        issue.issue_date,
        &overrides,
        allocation_seed(issue.id, module.id),
    );
    let awaiting_selection = matches!(selection, Selection::SelectionRequired { .. });
    let slots = selection.slots().to_vec();

    if module.kind.uses_generated_content() {
        apply_article_ranks(deps.store.as_ref(), &articles, module, &slots).await?;
    }

    let summary = AllocationSummary {
        candidates: items.len(),
        filled: slots.len(),
        pinned: slots.iter().filter(|s| s.pinned).count(),
        awaiting_selection,
        skipped_manual_edit: false,
    };
    deps.store
        .upsert_allocation(&ModuleAllocation {
            issue_id: issue.id,
            module_id: module.id,
            selection_mode: module.selection_mode,
            slots,
            awaiting_selection,
            manually_edited: false,
            updated_at: Utc::now(),
        })
        .await?;

    if summary.filled < module.capacity && !awaiting_selection {
        warn!(
            module = module.slug.as_str(),
            filled = summary.filled,
            capacity = module.capacity,
            "Module under-filled"
        );
    }
    info!(
        issue_id = %issue.id,
        module = module.slug.as_str(),
        mode = %strategy_for(module.selection_mode).mode(),
        filled = summary.filled,
        pinned = summary.pinned,
        awaiting_selection,
        "Module allocated"
    );
    Ok(summary)
}

/// Operator assignment for a module: keeps pinned slots and fills the rest
/// with `item_ids` in order. Marks the allocation as manually edited so later
/// automatic runs leave it alone.
pub async fn assign_manual(
    store: &dyn IssueStore,
    issue_id: Uuid,
    module_slug: &str,
    item_ids: &[Uuid],
) -> Result<ModuleAllocation> {
    let issue = store
        .get_issue(issue_id)
        .await?
        .ok_or_else(|| QuireError::not_found("issue", issue_id))?;
    if !issue.status.is_in_flight() {
        return Err(QuireError::Validation(format!(
            "issue {issue_id} is {} and can no longer be edited",
            issue.status
        )));
    }
    let module = store
        .module_by_slug(module_slug)
        .await?
        .ok_or_else(|| QuireError::not_found("module", module_slug))?;

    let mut seen = HashSet::new();
    if let Some(dup) = item_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(QuireError::Validation(format!("item {dup} listed more than once")));
    }

    let (known, articles, items): (HashSet<Uuid>, Vec<GeneratedArticle>, Vec<SlotItem>) =
        if module.kind.uses_generated_content() {
            let articles = store.articles_for_issue(issue_id).await?;
            let known = articles
                .iter()
                .filter(|a| a.module_id == module.id && a.body.is_some() && !a.suppressed)
                .map(|a| a.id)
                .collect();
            (known, articles, Vec::new())
        } else {
            let assets = store.assets_for_module(module.id).await?;
            let items: Vec<SlotItem> = assets.iter().map(SlotItem::from).collect();
            (items.iter().map(|i| i.id).collect(), Vec::new(), items)
        };
    if let Some(unknown) = item_ids.iter().find(|id| !known.contains(id)) {
        return Err(QuireError::Validation(format!(
            "item {unknown} is not selectable for module '{module_slug}'"
        )));
    }

    let mut board = match store.get_allocation(issue_id, module.id).await? {
        Some(existing) => SlotBoard::from_slots(module.capacity, &existing.slots, true),
        None => {
            let overrides = store.pin_overrides(issue_id, module.id).await?;
            let mut board = SlotBoard::new(module.capacity, None);
            place_pins(&mut board, &items, &overrides);
            board
        }
    };

    let fresh: Vec<Uuid> = item_ids.iter().copied().filter(|id| !board.contains(*id)).collect();
    let free = board.free_slots();
    if fresh.len() > free {
        return Err(QuireError::Validation(format!(
            "module '{module_slug}' has {free} free slots, {} items given",
            fresh.len()
        )));
    }
    for id in &fresh {
        board.fill_unchecked(*id);
    }

    let allocation = ModuleAllocation {
        issue_id,
        module_id: module.id,
        selection_mode: module.selection_mode,
        slots: board.into_slots(),
        awaiting_selection: false,
        manually_edited: true,
        updated_at: Utc::now(),
    };
    store.upsert_allocation(&allocation).await?;

    if module.kind.uses_generated_content() {
        apply_article_ranks(store, &articles, &module, &allocation.slots).await?;
    }
    if issue.status != IssueStatus::Processing {
        crate::finalize::finalize_module(store, &issue, &module, &allocation).await?;
    }

    info!(
        %issue_id,
        module = module_slug,
        items = allocation.slots.len(),
        "Manual allocation saved"
    );
    Ok(allocation)
}
