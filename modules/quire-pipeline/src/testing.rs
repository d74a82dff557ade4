// Test mocks for the issue pipeline.
//
// One mock per collaborator trait:
// - MockSource (CandidateSource): canned harvested items, or a failing feed
// - MockEvaluator (ContentEvaluator): title→scores, with an optional default
// - MockWriter (ContentWriter): echo headlines, canned bodies and fact-checks
// - FixedEmbedder / FailingEmbedder (TextEmbedder): hash-based vectors
// - RecordingNotifier (Notifier): captures run outcomes
//
// Plus fixture builders for issues, candidates, modules, and assets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use quire_common::types::{
    Asset, Candidate, CriteriaConfig, CriterionConfig, CriterionScore, FactCheck,
    GeneratedArticle, HarvestedItem, Issue, Module, ModuleKind, SelectionMode, StepFailure,
};
use quire_common::PipelineSettings;
use quire_store::{IssueStore, MemoryStore};

use crate::deps::PipelineDeps;
use crate::orchestrator::PipelineReport;
use crate::traits::{
    BodyRequest, CandidateSource, ContentEvaluator, ContentWriter, Notifier, TextEmbedder,
};

// ---------------------------------------------------------------------------
// Test constants
// ---------------------------------------------------------------------------

/// Standard embedding dimension for test vectors.
pub const TEST_EMBEDDING_DIM: usize = 64;

/// Issue date used by every fixture.
pub fn test_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

pub struct MockSource {
    name: String,
    items: Vec<HarvestedItem>,
    fail: bool,
}

impl MockSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Vec::new(),
            fail: false,
        }
    }

    /// A source whose every harvest errors.
    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn with_items(mut self, items: Vec<HarvestedItem>) -> Self {
        self.items = items;
        self
    }
}

#[async_trait]
impl CandidateSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn harvest(&self, _issue: &Issue) -> Result<Vec<HarvestedItem>> {
        if self.fail {
            bail!("MockSource {}: feed unavailable", self.name);
        }
        Ok(self.items.clone())
    }
}

// ---------------------------------------------------------------------------
// MockEvaluator
// ---------------------------------------------------------------------------

/// Title-keyed evaluator. Unregistered titles get `default_score` for every
/// requested criterion, or an `Err` when no default is set.
pub struct MockEvaluator {
    scores: HashMap<String, Vec<CriterionScore>>,
    default_score: Option<u8>,
}

impl MockEvaluator {
    pub fn new() -> Self {
        Self {
            scores: HashMap::new(),
            default_score: None,
        }
    }

    pub fn on_title(mut self, title: &str, scores: Vec<CriterionScore>) -> Self {
        self.scores.insert(title.to_string(), scores);
        self
    }

    pub fn with_default_score(mut self, score: u8) -> Self {
        self.default_score = Some(score);
        self
    }
}

impl Default for MockEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentEvaluator for MockEvaluator {
    async fn evaluate(
        &self,
        candidate: &Candidate,
        criteria: &[CriterionConfig],
    ) -> Result<Vec<CriterionScore>> {
        if let Some(scores) = self.scores.get(&candidate.title) {
            return Ok(scores.clone());
        }
        let Some(score) = self.default_score else {
            bail!("MockEvaluator: no scores registered for '{}'", candidate.title);
        };
        Ok(criteria
            .iter()
            .map(|c| CriterionScore {
                name: c.name.clone(),
                score,
                rationale: "default".to_string(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockWriter
// ---------------------------------------------------------------------------

/// Headlines echo the candidate title, bodies are generated from the
/// headline, and fact-checks return the configured score.
pub struct MockWriter {
    fail_headlines: bool,
    fail_bodies: bool,
    fact_check: FactCheck,
    fact_checks: HashMap<String, FactCheck>,
    body_calls: AtomicU32,
}

impl MockWriter {
    pub fn new() -> Self {
        Self {
            fail_headlines: false,
            fail_bodies: false,
            fact_check: FactCheck {
                score: 9,
                max_score: 10,
                notes: String::new(),
            },
            fact_checks: HashMap::new(),
            body_calls: AtomicU32::new(0),
        }
    }

    pub fn failing_headlines(mut self) -> Self {
        self.fail_headlines = true;
        self
    }

    pub fn failing_bodies(mut self) -> Self {
        self.fail_bodies = true;
        self
    }

    /// Fact-check result for the article with this headline.
    pub fn on_fact_check(mut self, headline: &str, score: u32, max_score: u32) -> Self {
        self.fact_checks.insert(
            headline.to_string(),
            FactCheck {
                score,
                max_score,
                notes: String::new(),
            },
        );
        self
    }

    pub fn body_calls(&self) -> u32 {
        self.body_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentWriter for MockWriter {
    async fn headline(&self, candidate: &Candidate) -> Result<String> {
        if self.fail_headlines {
            bail!("MockWriter: headline model unavailable");
        }
        Ok(candidate.title.clone())
    }

    async fn bodies(&self, batch: &[BodyRequest]) -> Result<Vec<String>> {
        self.body_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_bodies {
            bail!("MockWriter: body model unavailable");
        }
        Ok(batch
            .iter()
            .map(|r| format!("{} explained in a few plain words.", r.headline))
            .collect())
    }

    async fn fact_check(&self, article: &GeneratedArticle, _source: &Candidate) -> Result<FactCheck> {
        Ok(self
            .fact_checks
            .get(&article.headline)
            .cloned()
            .unwrap_or_else(|| self.fact_check.clone()))
    }
}

// ---------------------------------------------------------------------------
// FixedEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder for testing. Registered texts get exact vectors;
/// unmatched texts get a unique hash-based vector (low similarity to everything).
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    dimension: usize,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            dimension,
        }
    }

    /// Register a text→vector mapping for controlled similarity.
    pub fn on_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let mut state = hasher.finish();

        let mut vec = vec![0.0f32; self.dimension];
        for v in vec.iter_mut() {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *v = ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0;
        }
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vec.iter_mut() {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                self.vectors
                    .get(t.as_str())
                    .cloned()
                    .unwrap_or_else(|| self.hash_vector(t))
            })
            .collect())
    }
}

/// Embedder whose every call errors.
pub struct FailingEmbedder;

#[async_trait]
impl TextEmbedder for FailingEmbedder {
    async fn embed_batch(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        bail!("FailingEmbedder: embedding service unavailable")
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Notification {
    pub success: bool,
    pub issue_id: Uuid,
    pub failure: Option<StepFailure>,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn pipeline_succeeded(&self, report: &PipelineReport) -> Result<()> {
        self.sent.lock().unwrap().push(Notification {
            success: true,
            issue_id: report.issue_id,
            failure: None,
        });
        Ok(())
    }

    async fn pipeline_failed(&self, report: &PipelineReport, failure: &StepFailure) -> Result<()> {
        self.sent.lock().unwrap().push(Notification {
            success: false,
            issue_id: report.issue_id,
            failure: Some(failure.clone()),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Settings for tests: production defaults without the retry delay.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        retry_delay: Duration::ZERO,
        ..PipelineSettings::default()
    }
}

/// Deps over `store` with permissive mocks: every criterion scores 5,
/// headlines echo titles, fact-checks pass.
pub fn deps_with(store: Arc<MemoryStore>) -> PipelineDeps {
    PipelineDeps::builder()
        .store(store)
        .evaluator(Arc::new(MockEvaluator::new().with_default_score(5)))
        .writer(Arc::new(MockWriter::new()))
        .embedder(Arc::new(FixedEmbedder::new(TEST_EMBEDDING_DIM)))
        .settings(test_settings())
        .build()
}

/// Create and persist a processing issue dated [`test_date`].
pub async fn issue_on(store: &dyn IssueStore) -> Issue {
    let issue = Issue::new(test_date());
    store.create_issue(&issue).await.unwrap();
    issue
}

pub fn harvested(url: &str, title: &str) -> HarvestedItem {
    HarvestedItem {
        source_id: "test-feed".to_string(),
        source_url: url.to_string(),
        title: title.to_string(),
        description: format!("{title}. Summary of the story."),
        full_text: None,
        category: None,
        published_at: Some(Utc::now()),
    }
}

pub fn candidate(issue_id: Uuid, url: &str, title: &str) -> Candidate {
    Candidate::from_harvested(harvested(url, title), issue_id)
}

pub fn criteria(entries: &[(&str, f64, bool)]) -> CriteriaConfig {
    CriteriaConfig {
        criteria: entries
            .iter()
            .map(|(name, weight, enabled)| CriterionConfig {
                name: name.to_string(),
                weight: *weight,
                enabled: *enabled,
            })
            .collect(),
    }
}

pub fn article_module(slug: &str, capacity: usize) -> Module {
    Module {
        id: Uuid::new_v4(),
        name: slug.to_string(),
        slug: slug.to_string(),
        kind: ModuleKind::Article,
        capacity,
        selection_mode: SelectionMode::AffiliatePriority,
        max_per_category: None,
        cooldown_days: 0,
        display_order: 0,
        active: true,
    }
}

pub fn asset_module(slug: &str, capacity: usize, mode: SelectionMode) -> Module {
    Module {
        id: Uuid::new_v4(),
        name: slug.to_string(),
        slug: slug.to_string(),
        kind: ModuleKind::Spotlight,
        capacity,
        selection_mode: mode,
        max_per_category: None,
        cooldown_days: 0,
        display_order: 10,
        active: true,
    }
}

pub fn asset(
    module: &Module,
    name: &str,
    category: Option<&str>,
    is_affiliate: bool,
    priority: i32,
) -> Asset {
    Asset {
        id: Uuid::new_v4(),
        module_id: module.id,
        name: name.to_string(),
        category: category.map(str::to_string),
        is_affiliate,
        priority,
        pinned_position: None,
        last_used_on: None,
        active: true,
    }
}
