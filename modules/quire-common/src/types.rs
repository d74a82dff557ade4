use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QuireError;

// --- Issue ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Processing,
    Draft,
    InReview,
    Failed,
    Sent,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Draft => "draft",
            Self::InReview => "in_review",
            Self::Failed => "failed",
            Self::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "draft" => Some(Self::Draft),
            "in_review" => Some(Self::InReview),
            "failed" => Some(Self::Failed),
            "sent" => Some(Self::Sent),
            _ => None,
        }
    }

    /// Any state the pipeline or an editor may still be working on.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Processing | Self::Draft | Self::InReview)
    }

    /// Lifecycle edges. `Failed -> Processing` is the re-run edge.
    pub fn can_transition_to(&self, to: IssueStatus) -> bool {
        if *self == to {
            return true;
        }
        match (self, to) {
            (Self::Processing, Self::Draft) => true,
            (Self::Draft, Self::InReview) => true,
            (Self::InReview, Self::Sent) => true,
            (Self::Failed, Self::Processing) => true,
            (from, Self::Failed) => from.is_in_flight(),
            _ => false,
        }
    }

    pub fn transition(self, to: IssueStatus) -> Result<IssueStatus, QuireError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(QuireError::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One edition of the newsletter. Owns everything scoped to its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub issue_date: NaiveDate,
    pub status: IssueStatus,
    pub title: Option<String>,
    pub last_failed_step: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(issue_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            issue_date,
            status: IssueStatus::Processing,
            title: None,
            last_failed_step: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Why the last run of an issue failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

// --- Candidates ---

/// A harvested content unit before scoring and generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    pub issue_id: Option<Uuid>,
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub full_text: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub total_score: Option<f64>,
    pub suppressed: bool,
    pub duplicate_group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Build a fresh candidate for an issue from a harvested item.
    pub fn from_harvested(item: HarvestedItem, issue_id: Uuid) -> Self {
        let content_hash = crate::fingerprint::content_hash(
            item.full_text.as_deref(),
            &item.description,
            &item.title,
        );
        Self {
            id: Uuid::new_v4(),
            issue_id: Some(issue_id),
            source_id: item.source_id,
            source_url: item.source_url,
            title: item.title,
            description: item.description,
            full_text: item.full_text,
            category: item.category,
            published_at: item.published_at,
            content_hash,
            total_score: None,
            suppressed: false,
            duplicate_group_id: None,
            created_at: Utc::now(),
        }
    }

    /// Text handed to evaluators and writers: full text when extracted,
    /// the description otherwise.
    pub fn body_text(&self) -> &str {
        match self.full_text.as_deref() {
            Some(text) if !text.trim().is_empty() => text,
            _ => &self.description,
        }
    }
}

/// What the ingestion collaborator hands over for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestedItem {
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub full_text: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

// --- Scoring ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionConfig {
    pub name: String,
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Up to five weighted relevance criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaConfig {
    pub criteria: Vec<CriterionConfig>,
}

pub const MAX_ENABLED_CRITERIA: usize = 5;
pub const MIN_CRITERION_SCORE: u8 = 1;
pub const MAX_CRITERION_SCORE: u8 = 10;

impl CriteriaConfig {
    pub fn enabled(&self) -> impl Iterator<Item = &CriterionConfig> {
        self.criteria.iter().filter(|c| c.enabled)
    }

    pub fn validate(&self) -> Result<(), QuireError> {
        let enabled = self.enabled().count();
        if enabled == 0 || enabled > MAX_ENABLED_CRITERIA {
            return Err(QuireError::Config(format!(
                "scoring needs 1-{MAX_ENABLED_CRITERIA} enabled criteria, found {enabled}"
            )));
        }
        for criterion in self.enabled() {
            if !criterion.weight.is_finite() || criterion.weight < 0.0 {
                return Err(QuireError::Config(format!(
                    "criterion '{}' has invalid weight {}",
                    criterion.name, criterion.weight
                )));
            }
        }
        Ok(())
    }
}

/// Raw score for one criterion as returned by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CriterionScore {
    /// Criterion name, exactly as configured
    pub name: String,
    /// Integer score from 1 (irrelevant) to 10 (essential)
    pub score: u8,
    /// One or two sentences explaining the score
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedCriterionScore {
    pub name: String,
    pub score: u8,
    pub weight: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub candidate_id: Uuid,
    pub issue_id: Uuid,
    pub criteria: Vec<WeightedCriterionScore>,
    pub total_score: f64,
    pub scored_at: DateTime<Utc>,
}

// --- Deduplication ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMethod {
    Historical,
    ContentHash,
    TitleSimilarity,
    Semantic,
}

impl fmt::Display for DedupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Historical => write!(f, "historical"),
            Self::ContentHash => write!(f, "content_hash"),
            Self::TitleSimilarity => write!(f, "title_similarity"),
            Self::Semantic => write!(f, "semantic"),
        }
    }
}

/// The surviving member of a duplicate group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupCanonical {
    /// A candidate of this issue stays live.
    Candidate { candidate_id: Uuid },
    /// The topic already ran in a previous issue; every member is suppressed.
    Published {
        article_id: Uuid,
        issue_id: Uuid,
        title: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMember {
    pub candidate_id: Uuid,
    pub similarity: f64,
    pub method: DedupMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub topic_signature: String,
    pub method: DedupMethod,
    pub canonical: GroupCanonical,
    /// Suppressed members. Never contains the canonical candidate.
    pub members: Vec<DuplicateMember>,
}

impl DuplicateGroup {
    pub fn canonical_candidate(&self) -> Option<Uuid> {
        match &self.canonical {
            GroupCanonical::Candidate { candidate_id } => Some(*candidate_id),
            GroupCanonical::Published { .. } => None,
        }
    }

    pub fn suppressed_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.members.iter().map(|m| m.candidate_id)
    }

    /// Members including the canonical candidate, if any.
    pub fn size(&self) -> usize {
        self.members.len() + usize::from(self.canonical_candidate().is_some())
    }
}

/// An article that ran in a sent issue, for historical matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedItem {
    pub article_id: Uuid,
    pub issue_id: Uuid,
    pub issue_date: NaiveDate,
    pub title: String,
    pub source_url: String,
    pub content_hash: String,
}

// --- Modules & assets ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Article,
    Spotlight,
    Poll,
    Ad,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Spotlight => "spotlight",
            Self::Poll => "poll",
            Self::Ad => "ad",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "article" => Some(Self::Article),
            "spotlight" => Some(Self::Spotlight),
            "poll" => Some(Self::Poll),
            "ad" => Some(Self::Ad),
            _ => None,
        }
    }

    /// Article modules are filled from generated content; the rest from assets.
    pub fn uses_generated_content(&self) -> bool {
        matches!(self, Self::Article)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    AffiliatePriority,
    Random,
    Manual,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AffiliatePriority => "affiliate_priority",
            Self::Random => "random",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "affiliate_priority" => Some(Self::AffiliatePriority),
            "random" => Some(Self::Random),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded slot container, configured once and reused across issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub kind: ModuleKind,
    pub capacity: usize,
    pub selection_mode: SelectionMode,
    pub max_per_category: Option<usize>,
    pub cooldown_days: i64,
    pub display_order: i32,
    pub active: bool,
}

/// A pre-existing entry (sponsor, app, poll, ad) a module can draw from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub is_affiliate: bool,
    pub priority: i32,
    /// 1-based slot this asset is pinned to across all issues.
    pub pinned_position: Option<usize>,
    pub last_used_on: Option<NaiveDate>,
    pub active: bool,
}

/// Per-issue pin overrides for one module: `None` unpins, `Some(p)` pins to `p`.
pub type PinOverrides = HashMap<Uuid, Option<usize>>;

// --- Allocation ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedSlot {
    /// 1-based slot position.
    pub position: usize,
    pub item_id: Uuid,
    pub pinned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleAllocation {
    pub issue_id: Uuid,
    pub module_id: Uuid,
    pub selection_mode: SelectionMode,
    pub slots: Vec<AllocatedSlot>,
    /// Manual-mode module waiting for an operator to pick items.
    pub awaiting_selection: bool,
    /// An operator changed this allocation; automatic runs leave it alone.
    pub manually_edited: bool,
    pub updated_at: DateTime<Utc>,
}

impl ModuleAllocation {
    pub fn item_ids(&self) -> Vec<Uuid> {
        let mut slots: Vec<&AllocatedSlot> = self.slots.iter().collect();
        slots.sort_by_key(|s| s.position);
        slots.into_iter().map(|s| s.item_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManualActionKind {
    Reorder { ordered_ids: Vec<Uuid> },
    Skip { item_id: Uuid },
}

/// An operator override applied at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualAction {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub module_id: Uuid,
    pub kind: ManualActionKind,
    pub created_at: DateTime<Utc>,
}

// --- Generated content ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FactCheck {
    /// Points earned across all checks
    pub score: u32,
    /// Points available across all checks
    pub max_score: u32,
    /// Short notes on any claim that could not be verified
    pub notes: String,
}

impl FactCheck {
    pub fn ratio(&self) -> f64 {
        if self.max_score == 0 {
            return 0.0;
        }
        f64::from(self.score) / f64::from(self.max_score)
    }
}

impl fmt::Display for FactCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.score, self.max_score)
    }
}

/// Finished content for an article module, derived from one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArticle {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub module_id: Uuid,
    pub candidate_id: Uuid,
    pub category: Option<String>,
    pub source_score: f64,
    pub headline: String,
    pub body: Option<String>,
    pub word_count: u32,
    pub rank: Option<u32>,
    pub final_position: Option<u32>,
    pub active: bool,
    pub suppressed: bool,
    pub fact_check: Option<FactCheck>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GeneratedArticle {
    pub fn new(
        issue_id: Uuid,
        module_id: Uuid,
        candidate: &Candidate,
        headline: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            issue_id,
            module_id,
            candidate_id: candidate.id,
            category: candidate.category.clone(),
            source_score: candidate.total_score.unwrap_or_default(),
            headline,
            body: None,
            word_count: 0,
            rank: None,
            final_position: None,
            active: false,
            suppressed: false,
            fact_check: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// --- Run log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Cancelled,
}

/// Outcome of one orchestrator step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted timeline of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub issue_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub steps: Vec<StepResult>,
}
