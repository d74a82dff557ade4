//! Weighted multi-criteria relevance scoring.
//!
//! The evaluator supplies raw 1-10 scores per criterion; the total is
//! `Σ raw × weight` over enabled criteria. A candidate whose evaluation fails
//! or comes back incomplete is deferred: it keeps `total_score = None` and
//! stays in the pool, but is never ranked.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use quire_common::types::{
    Candidate, CriteriaConfig, CriterionConfig, Issue, ScoreRecord, WeightedCriterionScore,
    MAX_CRITERION_SCORE, MIN_CRITERION_SCORE,
};
use quire_common::{QuireError, Result};

use crate::deps::PipelineDeps;
use crate::traits::ContentEvaluator;

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    Scored(ScoreRecord),
    Deferred { reason: String },
}

/// Score one candidate. Never fails: collaborator errors become `Deferred`.
pub async fn score_candidate(
    evaluator: &dyn ContentEvaluator,
    candidate: &Candidate,
    issue_id: uuid::Uuid,
    criteria: &CriteriaConfig,
) -> ScoreOutcome {
    let enabled: Vec<CriterionConfig> = criteria.enabled().cloned().collect();
    let raw = match evaluator.evaluate(candidate, &enabled).await {
        Ok(raw) => raw,
        Err(e) => {
            return ScoreOutcome::Deferred {
                reason: format!("evaluator failed: {e}"),
            }
        }
    };

    let mut weighted = Vec::with_capacity(enabled.len());
    for criterion in &enabled {
        let Some(entry) = raw.iter().find(|s| s.name == criterion.name) else {
            return ScoreOutcome::Deferred {
                reason: format!("missing score for '{}'", criterion.name),
            };
        };
        if !(MIN_CRITERION_SCORE..=MAX_CRITERION_SCORE).contains(&entry.score) {
            return ScoreOutcome::Deferred {
                reason: format!("score {} for '{}' out of range", entry.score, criterion.name),
            };
        }
        weighted.push(WeightedCriterionScore {
            name: criterion.name.clone(),
            score: entry.score,
            weight: criterion.weight,
            rationale: entry.rationale.clone(),
        });
    }

    let total_score = weighted
        .iter()
        .map(|w| f64::from(w.score) * w.weight)
        .sum();

    ScoreOutcome::Scored(ScoreRecord {
        candidate_id: candidate.id,
        issue_id,
        criteria: weighted,
        total_score,
        scored_at: Utc::now(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreSummary {
    pub scored: usize,
    pub deferred: usize,
    pub skipped: usize,
}

/// Score every unscored candidate of the issue.
pub async fn score_issue(deps: &PipelineDeps, issue: &Issue) -> Result<ScoreSummary> {
    let criteria = deps.store.scoring_criteria().await?;
    criteria.validate()?;

    let candidates = deps.store.candidates_for_issue(issue.id).await?;
    if candidates.is_empty() {
        return Err(QuireError::Fatal(format!(
            "issue {} has no candidates to score",
            issue.id
        )));
    }

    let (done, pending): (Vec<Candidate>, Vec<Candidate>) = candidates
        .into_iter()
        .partition(|c| c.total_score.is_some());
    let mut summary = ScoreSummary {
        skipped: done.len(),
        ..ScoreSummary::default()
    };

    let evaluator = deps.evaluator.as_ref();
    let outcomes: Vec<(Candidate, ScoreOutcome)> = stream::iter(pending)
        .map(|candidate| {
            let criteria = &criteria;
            async move {
                let outcome = score_candidate(evaluator, &candidate, issue.id, criteria).await;
                (candidate, outcome)
            }
        })
        .buffered(deps.settings.scoring_concurrency)
        .collect()
        .await;

    for (candidate, outcome) in outcomes {
        match outcome {
            ScoreOutcome::Scored(record) => {
                debug!(candidate_id = %candidate.id, total = record.total_score, "Scored candidate");
                deps.store.upsert_score(&record).await?;
                summary.scored += 1;
            }
            ScoreOutcome::Deferred { reason } => {
                warn!(
                    issue_id = %issue.id,
                    candidate_id = %candidate.id,
                    reason = reason.as_str(),
                    "Scoring deferred"
                );
                summary.deferred += 1;
            }
        }
    }

    info!(
        issue_id = %issue.id,
        scored = summary.scored,
        deferred = summary.deferred,
        skipped = summary.skipped,
        "Scoring complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, criteria, MockEvaluator};
    use quire_common::types::CriterionScore;
    use uuid::Uuid;

    fn raw(name: &str, score: u8) -> CriterionScore {
        CriterionScore {
            name: name.into(),
            score,
            rationale: format!("{name} rationale"),
        }
    }

    #[tokio::test]
    async fn total_is_weighted_sum_of_enabled_criteria() {
        let issue_id = Uuid::new_v4();
        let c = candidate(issue_id, "https://a.example/1", "Story");
        let config = criteria(&[("relevance", 2.0, true), ("novelty", 0.5, true), ("tone", 9.0, false)]);
        let evaluator = MockEvaluator::new()
            .on_title("Story", vec![raw("relevance", 8), raw("novelty", 4), raw("tone", 10)]);

        let ScoreOutcome::Scored(record) = score_candidate(&evaluator, &c, issue_id, &config).await
        else {
            panic!("expected a score");
        };
        assert!((record.total_score - 18.0).abs() < 1e-9);
        assert_eq!(record.criteria.len(), 2, "disabled criteria are excluded");
    }

    #[tokio::test]
    async fn missing_criterion_defers() {
        let issue_id = Uuid::new_v4();
        let c = candidate(issue_id, "https://a.example/1", "Story");
        let config = criteria(&[("relevance", 1.0, true), ("novelty", 1.0, true)]);
        let evaluator = MockEvaluator::new().on_title("Story", vec![raw("relevance", 8)]);

        let outcome = score_candidate(&evaluator, &c, issue_id, &config).await;
        assert!(matches!(outcome, ScoreOutcome::Deferred { .. }));
    }

    #[tokio::test]
    async fn out_of_range_score_defers() {
        let issue_id = Uuid::new_v4();
        let c = candidate(issue_id, "https://a.example/1", "Story");
        let config = criteria(&[("relevance", 1.0, true)]);
        let evaluator = MockEvaluator::new().on_title("Story", vec![raw("relevance", 0)]);

        let outcome = score_candidate(&evaluator, &c, issue_id, &config).await;
        assert!(matches!(outcome, ScoreOutcome::Deferred { .. }));
    }

    #[tokio::test]
    async fn evaluator_failure_defers_instead_of_raising() {
        let issue_id = Uuid::new_v4();
        let c = candidate(issue_id, "https://a.example/1", "Unregistered");
        let config = criteria(&[("relevance", 1.0, true)]);

        let outcome = score_candidate(&MockEvaluator::new(), &c, issue_id, &config).await;
        assert!(matches!(outcome, ScoreOutcome::Deferred { .. }));
    }
}
