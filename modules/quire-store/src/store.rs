// IssueStore: the persisted store contract for the pipeline.
//
// Every read and write a step performs goes through this trait, scoped by
// issue and module. Steps for one issue never run concurrently, and each step
// writes a disjoint set of records, so row-level upserts are the only
// consistency mechanism needed.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quire_common::types::{
    Asset, Candidate, CriteriaConfig, DuplicateGroup, GeneratedArticle, Issue, IssueStatus,
    ManualAction, Module, ModuleAllocation, PinOverrides, PublishedItem, RunRecord, ScoreRecord,
    StepFailure,
};

use crate::error::{Result, StoreError};

/// Rows touched by [`IssueStore::reset_issue`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetStats {
    pub candidates_released: u64,
    pub scores_deleted: u64,
    pub groups_deleted: u64,
    pub articles_deleted: u64,
    pub allocations_deleted: u64,
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    // --- Issues ---

    async fn create_issue(&self, issue: &Issue) -> Result<()>;

    async fn get_issue(&self, issue_id: Uuid) -> Result<Option<Issue>>;

    /// Set the lifecycle status. `failure` is recorded when moving to
    /// `failed`; any other status clears the previous failure.
    async fn set_issue_status(
        &self,
        issue_id: Uuid,
        status: IssueStatus,
        failure: Option<&StepFailure>,
    ) -> Result<()>;

    async fn set_issue_title(&self, issue_id: Uuid, title: &str) -> Result<()>;

    // --- Candidates ---

    /// Insert or refresh candidates keyed by `(issue_id, source_url)`.
    /// Existing rows keep their id, score, and suppression state.
    /// Returns the stored id for each input, in input order.
    async fn upsert_candidates(&self, candidates: &[Candidate]) -> Result<Vec<Uuid>>;

    /// Assign unclaimed pool candidates published at or after `since`.
    async fn claim_pool_candidates(&self, issue_id: Uuid, since: DateTime<Utc>) -> Result<u64>;

    async fn candidates_for_issue(&self, issue_id: Uuid) -> Result<Vec<Candidate>>;

    /// Return every candidate of the issue not in `keep` to the pool.
    async fn release_candidates(&self, issue_id: Uuid, keep: &HashSet<Uuid>) -> Result<u64>;

    // --- Scoring ---

    async fn scoring_criteria(&self) -> Result<CriteriaConfig>;

    /// Write a score record and stamp the candidate's total score.
    async fn upsert_score(&self, record: &ScoreRecord) -> Result<()>;

    async fn scores_for_issue(&self, issue_id: Uuid) -> Result<Vec<ScoreRecord>>;

    // --- Deduplication ---

    /// Articles that ran in sent issues dated on or after `since`, excluding
    /// `exclude_issue`.
    async fn published_since(
        &self,
        since: NaiveDate,
        exclude_issue: Uuid,
    ) -> Result<Vec<PublishedItem>>;

    /// Atomically replace the issue's duplicate groups and recompute the
    /// suppression flags of its candidates from them.
    async fn replace_duplicate_groups(&self, issue_id: Uuid, groups: &[DuplicateGroup])
        -> Result<()>;

    async fn duplicate_groups(&self, issue_id: Uuid) -> Result<Vec<DuplicateGroup>>;

    // --- Modules & assets ---

    /// Active modules sorted by display order.
    async fn active_modules(&self) -> Result<Vec<Module>>;

    async fn module_by_slug(&self, slug: &str) -> Result<Option<Module>>;

    /// Active assets of a module, highest priority first.
    async fn assets_for_module(&self, module_id: Uuid) -> Result<Vec<Asset>>;

    async fn pin_overrides(&self, issue_id: Uuid, module_id: Uuid) -> Result<PinOverrides>;

    async fn mark_assets_used(&self, asset_ids: &[Uuid], on: NaiveDate) -> Result<()>;

    // --- Generated content ---

    async fn articles_for_issue(&self, issue_id: Uuid) -> Result<Vec<GeneratedArticle>>;

    /// Upsert keyed by `(issue_id, module_id, candidate_id)`.
    async fn upsert_article(&self, article: &GeneratedArticle) -> Result<()>;

    // --- Allocations ---

    async fn get_allocation(
        &self,
        issue_id: Uuid,
        module_id: Uuid,
    ) -> Result<Option<ModuleAllocation>>;

    async fn upsert_allocation(&self, allocation: &ModuleAllocation) -> Result<()>;

    async fn manual_actions(&self, issue_id: Uuid) -> Result<Vec<ManualAction>>;

    async fn add_manual_action(&self, action: &ManualAction) -> Result<()>;

    // --- Runs ---

    async fn record_run(&self, run: &RunRecord) -> Result<()>;

    /// Drop everything derived for the issue, release its candidates back to
    /// the pool, and put the issue back into `processing`.
    async fn reset_issue(&self, issue_id: Uuid) -> Result<ResetStats>;
}

/// Groups of one issue must partition its candidates: no candidate may be a
/// member or canonical of more than one group.
pub(crate) fn check_disjoint(groups: &[DuplicateGroup]) -> Result<()> {
    let mut seen = HashSet::new();
    for group in groups {
        for id in group.canonical_candidate().into_iter().chain(group.suppressed_ids()) {
            if !seen.insert(id) {
                return Err(StoreError::Conflict(format!(
                    "candidate {id} appears in more than one duplicate group"
                )));
            }
        }
    }
    Ok(())
}
