//! Finalization: turn allocations into the ordered content of the issue.
//!
//! Operator actions (skip, reorder) are applied on top of each module's
//! allocation, final positions are stamped, the issue title is taken from the
//! primary article module, and every candidate that did not make it into the
//! issue goes back to the pool.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use quire_common::types::{
    Issue, IssueStatus, ManualAction, ManualActionKind, Module, ModuleAllocation,
};
use quire_common::Result;
use quire_store::IssueStore;

use crate::deps::PipelineDeps;

/// Apply operator actions in creation order. Skips drop an item; a reorder
/// moves the listed ids to the front in the listed order, ignoring ids that
/// are not (or no longer) present.
pub fn apply_manual_actions(item_ids: Vec<Uuid>, actions: &[&ManualAction]) -> Vec<Uuid> {
    let mut ordered: Vec<&ManualAction> = actions.to_vec();
    ordered.sort_by_key(|a| a.created_at);

    ordered.into_iter().fold(item_ids, |ids, action| match &action.kind {
        ManualActionKind::Skip { item_id } => ids.into_iter().filter(|id| id != item_id).collect(),
        ManualActionKind::Reorder { ordered_ids } => {
            let present: HashSet<Uuid> = ids.iter().copied().collect();
            let mut front: Vec<Uuid> = Vec::new();
            for id in ordered_ids {
                if present.contains(id) && !front.contains(id) {
                    front.push(*id);
                }
            }
            let rest: Vec<Uuid> = ids.into_iter().filter(|id| !front.contains(id)).collect();
            front.into_iter().chain(rest).collect()
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Finalized,
    AwaitingSelection,
    /// No allocation was recorded for the module.
    Unallocated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleOutcome {
    pub module_id: Uuid,
    pub slug: String,
    pub status: ModuleStatus,
    /// Final item order, position 1 first.
    pub item_ids: Vec<Uuid>,
}

/// Stamp the final order of one module.
///
/// Article modules: final articles get `final_position`, `rank`, and become
/// active; every other article of the module is deactivated. Asset modules:
/// final assets are marked used on the issue date.
pub async fn finalize_module(
    store: &dyn IssueStore,
    issue: &Issue,
    module: &Module,
    allocation: &ModuleAllocation,
) -> Result<ModuleOutcome> {
    let actions = store.manual_actions(issue.id).await?;
    let mine: Vec<&ManualAction> = actions.iter().filter(|a| a.module_id == module.id).collect();
    let ids = apply_manual_actions(allocation.item_ids(), &mine);

    if module.kind.uses_generated_content() {
        let articles = store.articles_for_issue(issue.id).await?;
        for article in articles.iter().filter(|a| a.module_id == module.id) {
            let position = ids
                .iter()
                .position(|id| *id == article.id)
                .and_then(|i| u32::try_from(i + 1).ok());
            let active = position.is_some();
            if article.final_position == position && article.active == active
                && (position.is_none() || article.rank == position)
            {
                continue;
            }
            let mut updated = article.clone();
            updated.final_position = position;
            updated.active = active;
            if position.is_some() {
                updated.rank = position;
            }
            store.upsert_article(&updated).await?;
        }
    } else if !ids.is_empty() {
        store.mark_assets_used(&ids, issue.issue_date).await?;
    }

    Ok(ModuleOutcome {
        module_id: module.id,
        slug: module.slug.clone(),
        status: ModuleStatus::Finalized,
        item_ids: ids,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeSummary {
    pub title: Option<String>,
    pub modules: Vec<ModuleOutcome>,
    pub released: u64,
}

pub async fn finalize(deps: &PipelineDeps, issue: &Issue) -> Result<FinalizeSummary> {
    let store = deps.store.as_ref();
    let modules = store.active_modules().await?;

    let mut outcomes = Vec::with_capacity(modules.len());
    for module in &modules {
        let outcome = match store.get_allocation(issue.id, module.id).await? {
            None => {
                warn!(module = module.slug.as_str(), "No allocation for module");
                ModuleOutcome {
                    module_id: module.id,
                    slug: module.slug.clone(),
                    status: ModuleStatus::Unallocated,
                    item_ids: Vec::new(),
                }
            }
            Some(allocation) if allocation.awaiting_selection => {
                info!(module = module.slug.as_str(), "Module awaiting manual selection");
                ModuleOutcome {
                    module_id: module.id,
                    slug: module.slug.clone(),
                    status: ModuleStatus::AwaitingSelection,
                    item_ids: allocation.item_ids(),
                }
            }
            Some(allocation) => finalize_module(store, issue, module, &allocation).await?,
        };
        outcomes.push(outcome);
    }

    let articles = store.articles_for_issue(issue.id).await?;

    let primary = modules.iter().find(|m| m.kind.uses_generated_content());
    let title = primary.and_then(|module| {
        articles
            .iter()
            .filter(|a| a.module_id == module.id && a.active)
            .find(|a| a.final_position == Some(1))
            .map(|a| a.headline.clone())
    });
    match &title {
        Some(title) => store.set_issue_title(issue.id, title).await?,
        None => warn!(issue_id = %issue.id, "No primary article, issue title left unchanged"),
    }

    let keep: HashSet<Uuid> = articles
        .iter()
        .filter(|a| a.active && a.final_position.is_some())
        .map(|a| a.candidate_id)
        .collect();
    let released = store.release_candidates(issue.id, &keep).await?;

    let next = issue.status.transition(IssueStatus::Draft)?;
    store.set_issue_status(issue.id, next, None).await?;

    info!(
        issue_id = %issue.id,
        title = title.as_deref().unwrap_or(""),
        modules = outcomes.len(),
        released,
        "Issue finalized"
    );
    Ok(FinalizeSummary {
        title,
        modules: outcomes,
        released,
    })
}
