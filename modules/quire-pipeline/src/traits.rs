// Trait abstractions for the pipeline's external collaborators.
//
// CandidateSource: where raw items come from (feeds in production).
// ContentEvaluator: per-criterion relevance scores.
// ContentWriter: headlines, bodies, and fact-checks.
// TextEmbedder: vectors for semantic deduplication.
// Notifier: run outcome notifications.
//
// Steps only talk to the outside world through these, so every step can be
// driven by the mocks in `testing.rs` with no network and no database.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use quire_common::types::{
    Candidate, CriterionConfig, CriterionScore, FactCheck, GeneratedArticle, HarvestedItem,
    Issue, StepFailure,
};

use crate::orchestrator::PipelineReport;

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    async fn harvest(&self, issue: &Issue) -> Result<Vec<HarvestedItem>>;
}

#[async_trait]
pub trait ContentEvaluator: Send + Sync {
    /// Raw 1-10 scores for the given criteria. Implementations may return
    /// extra or missing entries; the scoring engine validates the response.
    async fn evaluate(
        &self,
        candidate: &Candidate,
        criteria: &[CriterionConfig],
    ) -> Result<Vec<CriterionScore>>;
}

/// One article in a body-generation batch.
#[derive(Debug, Clone)]
pub struct BodyRequest {
    pub article_id: Uuid,
    pub headline: String,
    pub source_title: String,
    pub source_text: String,
}

#[async_trait]
pub trait ContentWriter: Send + Sync {
    async fn headline(&self, candidate: &Candidate) -> Result<String>;

    /// Bodies for a batch, one per request in request order.
    async fn bodies(&self, batch: &[BodyRequest]) -> Result<Vec<String>>;

    async fn fact_check(&self, article: &GeneratedArticle, source: &Candidate)
        -> Result<FactCheck>;
}

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn pipeline_succeeded(&self, report: &PipelineReport) -> Result<()>;

    async fn pipeline_failed(&self, report: &PipelineReport, failure: &StepFailure)
        -> Result<()>;
}
