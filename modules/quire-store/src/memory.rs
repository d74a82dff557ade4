//! In-memory [`IssueStore`] for tests and local dry runs.
//!
//! Mirrors the Postgres semantics (natural-key upserts, atomic group
//! replacement, reset) over plain collections behind a mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use quire_common::types::{
    Asset, Candidate, CriteriaConfig, DuplicateGroup, GeneratedArticle, Issue, IssueStatus,
    ManualAction, Module, ModuleAllocation, PinOverrides, PublishedItem, RunRecord, ScoreRecord,
    StepFailure,
};

use crate::error::{Result, StoreError};
use crate::store::{check_disjoint, IssueStore, ResetStats};

#[derive(Default)]
struct Inner {
    issues: HashMap<Uuid, Issue>,
    /// Insertion order is preserved so reads are deterministic.
    candidates: Vec<Candidate>,
    scores: HashMap<Uuid, ScoreRecord>,
    criteria: Option<CriteriaConfig>,
    groups: Vec<DuplicateGroup>,
    modules: Vec<Module>,
    assets: Vec<Asset>,
    pin_overrides: HashMap<(Uuid, Uuid), PinOverrides>,
    articles: Vec<GeneratedArticle>,
    allocations: HashMap<(Uuid, Uuid), ModuleAllocation>,
    manual_actions: Vec<ManualAction>,
    runs: Vec<RunRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- Seeding (module/asset configuration lives outside the pipeline) ---

    pub fn insert_module(&self, module: Module) -> Result<()> {
        let mut inner = self.lock()?;
        inner.modules.retain(|m| m.id != module.id);
        inner.modules.push(module);
        Ok(())
    }

    pub fn insert_asset(&self, asset: Asset) -> Result<()> {
        let mut inner = self.lock()?;
        inner.assets.retain(|a| a.id != asset.id);
        inner.assets.push(asset);
        Ok(())
    }

    pub fn set_pin_override(
        &self,
        issue_id: Uuid,
        module_id: Uuid,
        asset_id: Uuid,
        position: Option<usize>,
    ) -> Result<()> {
        self.lock()?
            .pin_overrides
            .entry((issue_id, module_id))
            .or_default()
            .insert(asset_id, position);
        Ok(())
    }

    pub fn set_scoring_criteria(&self, criteria: CriteriaConfig) -> Result<()> {
        self.lock()?.criteria = Some(criteria);
        Ok(())
    }

    /// Snapshot of every stored candidate, including pool rows.
    pub fn all_candidates(&self) -> Result<Vec<Candidate>> {
        Ok(self.lock()?.candidates.clone())
    }

    pub fn assets(&self) -> Result<Vec<Asset>> {
        Ok(self.lock()?.assets.clone())
    }

    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.lock()?.runs.clone())
    }
}

fn release(candidate: &mut Candidate) {
    candidate.issue_id = None;
    candidate.total_score = None;
    candidate.suppressed = false;
    candidate.duplicate_group_id = None;
}

#[async_trait]
impl IssueStore for MemoryStore {
    async fn create_issue(&self, issue: &Issue) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.issues.contains_key(&issue.id) {
            return Err(StoreError::Conflict(format!("issue {} already exists", issue.id)));
        }
        inner.issues.insert(issue.id, issue.clone());
        Ok(())
    }

    async fn get_issue(&self, issue_id: Uuid) -> Result<Option<Issue>> {
        Ok(self.lock()?.issues.get(&issue_id).cloned())
    }

    async fn set_issue_status(
        &self,
        issue_id: Uuid,
        status: IssueStatus,
        failure: Option<&StepFailure>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let issue = inner
            .issues
            .get_mut(&issue_id)
            .ok_or_else(|| StoreError::not_found("issue", issue_id))?;
        issue.status = status;
        if status == IssueStatus::Failed {
            issue.last_failed_step = failure.map(|f| f.step.clone());
            issue.last_error = failure.map(|f| f.error.clone());
        } else {
            issue.last_failed_step = None;
            issue.last_error = None;
        }
        issue.updated_at = Utc::now();
        Ok(())
    }

    async fn set_issue_title(&self, issue_id: Uuid, title: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let issue = inner
            .issues
            .get_mut(&issue_id)
            .ok_or_else(|| StoreError::not_found("issue", issue_id))?;
        issue.title = Some(title.to_string());
        issue.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_candidates(&self, candidates: &[Candidate]) -> Result<Vec<Uuid>> {
        let mut inner = self.lock()?;
        let mut ids = Vec::with_capacity(candidates.len());
        for incoming in candidates {
            let in_issue = inner.candidates.iter().position(|c| {
                c.issue_id.is_some()
                    && c.issue_id == incoming.issue_id
                    && c.source_url == incoming.source_url
            });
            // An unassigned pool row for the same URL is adopted, not duplicated.
            let existing = in_issue.or_else(|| {
                incoming.issue_id?;
                inner
                    .candidates
                    .iter()
                    .position(|c| c.issue_id.is_none() && c.source_url == incoming.source_url)
            });
            match existing.map(|i| &mut inner.candidates[i]) {
                Some(row) => {
                    row.issue_id = incoming.issue_id;
                    row.source_id = incoming.source_id.clone();
                    row.title = incoming.title.clone();
                    row.description = incoming.description.clone();
                    row.full_text = incoming.full_text.clone();
                    row.category = incoming.category.clone();
                    row.published_at = incoming.published_at;
                    row.content_hash = incoming.content_hash.clone();
                    ids.push(row.id);
                }
                None => {
                    ids.push(incoming.id);
                    inner.candidates.push(incoming.clone());
                }
            }
        }
        Ok(ids)
    }

    async fn claim_pool_candidates(&self, issue_id: Uuid, since: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut taken: HashSet<String> = inner
            .candidates
            .iter()
            .filter(|c| c.issue_id == Some(issue_id))
            .map(|c| c.source_url.clone())
            .collect();
        let mut claimed = 0;
        for candidate in inner.candidates.iter_mut() {
            let fresh = candidate.published_at.is_some_and(|p| p >= since);
            if candidate.issue_id.is_none() && fresh && !taken.contains(&candidate.source_url) {
                candidate.issue_id = Some(issue_id);
                taken.insert(candidate.source_url.clone());
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn candidates_for_issue(&self, issue_id: Uuid) -> Result<Vec<Candidate>> {
        Ok(self
            .lock()?
            .candidates
            .iter()
            .filter(|c| c.issue_id == Some(issue_id))
            .cloned()
            .collect())
    }

    async fn release_candidates(&self, issue_id: Uuid, keep: &HashSet<Uuid>) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut released = Vec::new();
        for candidate in inner.candidates.iter_mut() {
            if candidate.issue_id == Some(issue_id) && !keep.contains(&candidate.id) {
                release(candidate);
                released.push(candidate.id);
            }
        }
        for id in &released {
            inner.scores.remove(id);
        }
        Ok(released.len() as u64)
    }

    async fn scoring_criteria(&self) -> Result<CriteriaConfig> {
        self.lock()?
            .criteria
            .clone()
            .ok_or_else(|| StoreError::not_found("scoring criteria", "default"))
    }

    async fn upsert_score(&self, record: &ScoreRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let candidate = inner
            .candidates
            .iter_mut()
            .find(|c| c.id == record.candidate_id)
            .ok_or_else(|| StoreError::not_found("candidate", record.candidate_id))?;
        candidate.total_score = Some(record.total_score);
        inner.scores.insert(record.candidate_id, record.clone());
        Ok(())
    }

    async fn scores_for_issue(&self, issue_id: Uuid) -> Result<Vec<ScoreRecord>> {
        let mut scores: Vec<ScoreRecord> = self
            .lock()?
            .scores
            .values()
            .filter(|s| s.issue_id == issue_id)
            .cloned()
            .collect();
        scores.sort_by_key(|s| s.candidate_id);
        Ok(scores)
    }

    async fn published_since(
        &self,
        since: NaiveDate,
        exclude_issue: Uuid,
    ) -> Result<Vec<PublishedItem>> {
        let inner = self.lock()?;
        let items = inner
            .articles
            .iter()
            .filter(|a| a.active && a.final_position.is_some() && a.issue_id != exclude_issue)
            .filter_map(|article| {
                let issue = inner.issues.get(&article.issue_id)?;
                if issue.status != IssueStatus::Sent || issue.issue_date < since {
                    return None;
                }
                let candidate = inner.candidates.iter().find(|c| c.id == article.candidate_id)?;
                Some(PublishedItem {
                    article_id: article.id,
                    issue_id: issue.id,
                    issue_date: issue.issue_date,
                    title: candidate.title.clone(),
                    source_url: candidate.source_url.clone(),
                    content_hash: candidate.content_hash.clone(),
                })
            })
            .collect();
        Ok(items)
    }

    async fn replace_duplicate_groups(
        &self,
        issue_id: Uuid,
        groups: &[DuplicateGroup],
    ) -> Result<()> {
        check_disjoint(groups)?;

        let mut inner = self.lock()?;
        inner.groups.retain(|g| g.issue_id != issue_id);
        for candidate in inner.candidates.iter_mut().filter(|c| c.issue_id == Some(issue_id)) {
            candidate.suppressed = false;
            candidate.duplicate_group_id = None;
        }
        for group in groups {
            for candidate in inner.candidates.iter_mut() {
                if group.suppressed_ids().any(|id| id == candidate.id) {
                    candidate.suppressed = true;
                    candidate.duplicate_group_id = Some(group.id);
                } else if group.canonical_candidate() == Some(candidate.id) {
                    candidate.duplicate_group_id = Some(group.id);
                }
            }
            inner.groups.push(group.clone());
        }
        Ok(())
    }

    async fn duplicate_groups(&self, issue_id: Uuid) -> Result<Vec<DuplicateGroup>> {
        Ok(self
            .lock()?
            .groups
            .iter()
            .filter(|g| g.issue_id == issue_id)
            .cloned()
            .collect())
    }

    async fn active_modules(&self) -> Result<Vec<Module>> {
        let mut modules: Vec<Module> =
            self.lock()?.modules.iter().filter(|m| m.active).cloned().collect();
        modules.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(modules)
    }

    async fn module_by_slug(&self, slug: &str) -> Result<Option<Module>> {
        Ok(self.lock()?.modules.iter().find(|m| m.slug == slug).cloned())
    }

    async fn assets_for_module(&self, module_id: Uuid) -> Result<Vec<Asset>> {
        let mut assets: Vec<Asset> = self
            .lock()?
            .assets
            .iter()
            .filter(|a| a.module_id == module_id && a.active)
            .cloned()
            .collect();
        assets.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(assets)
    }

    async fn pin_overrides(&self, issue_id: Uuid, module_id: Uuid) -> Result<PinOverrides> {
        Ok(self
            .lock()?
            .pin_overrides
            .get(&(issue_id, module_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_assets_used(&self, asset_ids: &[Uuid], on: NaiveDate) -> Result<()> {
        let mut inner = self.lock()?;
        for asset in inner.assets.iter_mut().filter(|a| asset_ids.contains(&a.id)) {
            asset.last_used_on = Some(on);
        }
        Ok(())
    }

    async fn articles_for_issue(&self, issue_id: Uuid) -> Result<Vec<GeneratedArticle>> {
        Ok(self
            .lock()?
            .articles
            .iter()
            .filter(|a| a.issue_id == issue_id)
            .cloned()
            .collect())
    }

    async fn upsert_article(&self, article: &GeneratedArticle) -> Result<()> {
        let mut inner = self.lock()?;
        let existing = inner.articles.iter_mut().find(|a| {
            a.issue_id == article.issue_id
                && a.module_id == article.module_id
                && a.candidate_id == article.candidate_id
        });
        match existing {
            Some(row) => {
                let id = row.id;
                let created_at = row.created_at;
                *row = article.clone();
                row.id = id;
                row.created_at = created_at;
                row.updated_at = Utc::now();
            }
            None => inner.articles.push(article.clone()),
        }
        Ok(())
    }

    async fn get_allocation(
        &self,
        issue_id: Uuid,
        module_id: Uuid,
    ) -> Result<Option<ModuleAllocation>> {
        Ok(self.lock()?.allocations.get(&(issue_id, module_id)).cloned())
    }

    async fn upsert_allocation(&self, allocation: &ModuleAllocation) -> Result<()> {
        self.lock()?
            .allocations
            .insert((allocation.issue_id, allocation.module_id), allocation.clone());
        Ok(())
    }

    async fn manual_actions(&self, issue_id: Uuid) -> Result<Vec<ManualAction>> {
        let mut actions: Vec<ManualAction> = self
            .lock()?
            .manual_actions
            .iter()
            .filter(|a| a.issue_id == issue_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.created_at);
        Ok(actions)
    }

    async fn add_manual_action(&self, action: &ManualAction) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.manual_actions.iter().any(|a| a.id == action.id) {
            inner.manual_actions.push(action.clone());
        }
        Ok(())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        let mut inner = self.lock()?;
        inner.runs.retain(|r| r.run_id != run.run_id);
        inner.runs.push(run.clone());
        Ok(())
    }

    async fn reset_issue(&self, issue_id: Uuid) -> Result<ResetStats> {
        let mut inner = self.lock()?;
        let issue = inner
            .issues
            .get_mut(&issue_id)
            .ok_or_else(|| StoreError::not_found("issue", issue_id))?;
        if issue.status == IssueStatus::Sent {
            return Err(StoreError::Conflict(format!("issue {issue_id} was already sent")));
        }
        issue.status = IssueStatus::Processing;
        issue.title = None;
        issue.last_failed_step = None;
        issue.last_error = None;
        issue.updated_at = Utc::now();

        let mut stats = ResetStats::default();

        let before = inner.scores.len();
        inner.scores.retain(|_, s| s.issue_id != issue_id);
        stats.scores_deleted = (before - inner.scores.len()) as u64;

        let before = inner.groups.len();
        inner.groups.retain(|g| g.issue_id != issue_id);
        stats.groups_deleted = (before - inner.groups.len()) as u64;

        let before = inner.articles.len();
        inner.articles.retain(|a| a.issue_id != issue_id);
        stats.articles_deleted = (before - inner.articles.len()) as u64;

        let before = inner.allocations.len();
        inner.allocations.retain(|(issue, _), _| *issue != issue_id);
        stats.allocations_deleted = (before - inner.allocations.len()) as u64;

        inner.manual_actions.retain(|a| a.issue_id != issue_id);

        for candidate in inner.candidates.iter_mut().filter(|c| c.issue_id == Some(issue_id)) {
            release(candidate);
            stats.candidates_released += 1;
        }
        Ok(stats)
    }
}
