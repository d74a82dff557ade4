//! Content generation for article modules, split into the three steps the
//! orchestrator runs per module: titles, bodies, fact-check.
//!
//! Each step only touches articles that still need its work, so a retried
//! step picks up where the failed attempt stopped.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use quire_common::types::{Candidate, GeneratedArticle, Issue, Module};
use quire_common::{QuireError, Result};

use crate::dedup::candidate_order;
use crate::deps::PipelineDeps;
use crate::traits::BodyRequest;

/// Trim a headline to `max_chars`, cutting at the last word boundary.
pub fn trim_headline(raw: &str, max_chars: usize) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let headline = collapsed.trim_matches(|c| c == '"' || c == '\'').trim();
    if headline.chars().count() <= max_chars {
        return headline.to_string();
    }
    let cut: String = headline.chars().take(max_chars).collect();
    let next_is_boundary = headline.chars().nth(max_chars).is_some_and(char::is_whitespace);
    if next_is_boundary {
        return cut.trim_end().to_string();
    }
    match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].trim_end().to_string(),
        _ => cut,
    }
}

/// Candidates eligible for a module, best first: scored, not suppressed, and
/// not already the source of an article in another module of the issue.
pub fn generation_pool(
    candidates: &[Candidate],
    articles: &[GeneratedArticle],
    module: &Module,
    size: usize,
) -> Vec<Candidate> {
    let used_elsewhere: HashSet<_> = articles
        .iter()
        .filter(|a| a.module_id != module.id)
        .map(|a| a.candidate_id)
        .collect();
    let mut pool: Vec<Candidate> = candidates
        .iter()
        .filter(|c| !c.suppressed && c.total_score.is_some() && !used_elsewhere.contains(&c.id))
        .cloned()
        .collect();
    pool.sort_by(candidate_order);
    pool.truncate(size);
    pool
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TitlesSummary {
    pub pool: usize,
    pub generated: usize,
    pub failed: usize,
    pub existing: usize,
}

pub async fn generate_titles(
    deps: &PipelineDeps,
    issue: &Issue,
    module: &Module,
) -> Result<TitlesSummary> {
    let candidates = deps.store.candidates_for_issue(issue.id).await?;
    let articles = deps.store.articles_for_issue(issue.id).await?;
    let pool = generation_pool(
        &candidates,
        &articles,
        module,
        deps.settings.generation_pool_size(),
    );
    if pool.is_empty() {
        return Err(QuireError::Fatal(format!(
            "no eligible candidates for module '{}'",
            module.slug
        )));
    }

    let have_article: HashSet<_> = articles
        .iter()
        .filter(|a| a.module_id == module.id)
        .map(|a| a.candidate_id)
        .collect();

    let mut summary = TitlesSummary {
        pool: pool.len(),
        ..TitlesSummary::default()
    };
    for candidate in &pool {
        if have_article.contains(&candidate.id) {
            summary.existing += 1;
            continue;
        }
        let headline = match deps.writer.headline(candidate).await {
            Ok(raw) => trim_headline(&raw, deps.settings.headline_max_chars),
            Err(e) => {
                warn!(
                    module = module.slug.as_str(),
                    candidate_id = %candidate.id,
                    error = %e,
                    "Headline generation failed"
                );
                summary.failed += 1;
                continue;
            }
        };
        if headline.is_empty() {
            warn!(module = module.slug.as_str(), candidate_id = %candidate.id, "Empty headline");
            summary.failed += 1;
            continue;
        }
        let article = GeneratedArticle::new(issue.id, module.id, candidate, headline);
        deps.store.upsert_article(&article).await?;
        summary.generated += 1;
    }

    if summary.generated == 0 && summary.failed > 0 {
        return Err(QuireError::Transient(format!(
            "all {} headlines failed for module '{}'",
            summary.failed, module.slug
        )));
    }
    info!(
        issue_id = %issue.id,
        module = module.slug.as_str(),
        generated = summary.generated,
        failed = summary.failed,
        existing = summary.existing,
        "Titles generated"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BodiesSummary {
    pub batches: usize,
    pub failed_batches: usize,
    pub completed: usize,
}

pub async fn generate_bodies(
    deps: &PipelineDeps,
    issue: &Issue,
    module: &Module,
) -> Result<BodiesSummary> {
    let candidates = deps.store.candidates_for_issue(issue.id).await?;
    let mut pending: Vec<GeneratedArticle> = deps
        .store
        .articles_for_issue(issue.id)
        .await?
        .into_iter()
        .filter(|a| a.module_id == module.id && a.body.is_none() && !a.suppressed)
        .collect();
    pending.sort_by(|a, b| {
        b.source_score
            .partial_cmp(&a.source_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });
    let batch_size = deps.settings.body_batch_size;
    pending.truncate(batch_size * deps.settings.body_batch_count);

    let mut summary = BodiesSummary::default();
    for batch in pending.chunks(batch_size) {
        summary.batches += 1;
        let requests: Vec<BodyRequest> = batch
            .iter()
            .filter_map(|article| {
                let source = candidates.iter().find(|c| c.id == article.candidate_id)?;
                Some(BodyRequest {
                    article_id: article.id,
                    headline: article.headline.clone(),
                    source_title: source.title.clone(),
                    source_text: source.body_text().to_string(),
                })
            })
            .collect();

        let bodies = match deps.writer.bodies(&requests).await {
            Ok(bodies) if bodies.len() == requests.len() => bodies,
            Ok(bodies) => {
                warn!(
                    module = module.slug.as_str(),
                    expected = requests.len(),
                    got = bodies.len(),
                    "Body batch returned wrong count"
                );
                summary.failed_batches += 1;
                continue;
            }
            Err(e) => {
                warn!(module = module.slug.as_str(), error = %e, "Body batch failed");
                summary.failed_batches += 1;
                continue;
            }
        };

        for (request, body) in requests.iter().zip(bodies) {
            let Some(article) = batch.iter().find(|a| a.id == request.article_id) else {
                continue;
            };
            let mut article = article.clone();
            article.word_count = word_count(&body);
            article.body = Some(body);
            article.active = true;
            deps.store.upsert_article(&article).await?;
            summary.completed += 1;
        }
    }

    if summary.batches > 0 && summary.failed_batches == summary.batches {
        return Err(QuireError::Transient(format!(
            "every body batch failed for module '{}'",
            module.slug
        )));
    }
    info!(
        issue_id = %issue.id,
        module = module.slug.as_str(),
        completed = summary.completed,
        failed_batches = summary.failed_batches,
        "Bodies generated"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactCheckSummary {
    pub checked: usize,
    pub passed: usize,
    pub rejected: usize,
    pub errored: usize,
}

pub async fn fact_check(
    deps: &PipelineDeps,
    issue: &Issue,
    module: &Module,
) -> Result<FactCheckSummary> {
    let candidates = deps.store.candidates_for_issue(issue.id).await?;
    let pending: Vec<GeneratedArticle> = deps
        .store
        .articles_for_issue(issue.id)
        .await?
        .into_iter()
        .filter(|a| {
            a.module_id == module.id && a.active && a.body.is_some() && a.fact_check.is_none()
        })
        .collect();

    let mut summary = FactCheckSummary::default();
    for mut article in pending {
        let Some(source) = candidates.iter().find(|c| c.id == article.candidate_id) else {
            warn!(article_id = %article.id, "Source candidate missing, deactivating article");
            article.active = false;
            deps.store.upsert_article(&article).await?;
            summary.errored += 1;
            continue;
        };
        summary.checked += 1;
        match deps.writer.fact_check(&article, source).await {
            Ok(check) => {
                let ratio = check.ratio();
                if ratio < deps.settings.min_fact_check_ratio {
                    warn!(
                        article_id = %article.id,
                        fact_check = %check,
                        "Article failed fact-check"
                    );
                    article.active = false;
                    summary.rejected += 1;
                } else {
                    summary.passed += 1;
                }
                article.fact_check = Some(check);
            }
            Err(e) => {
                warn!(article_id = %article.id, error = %e, "Fact-check errored, deactivating article");
                article.active = false;
                summary.errored += 1;
            }
        }
        deps.store.upsert_article(&article).await?;
    }

    info!(
        issue_id = %issue.id,
        module = module.slug.as_str(),
        passed = summary.passed,
        rejected = summary.rejected,
        errored = summary.errored,
        "Fact-check complete"
    );
    Ok(summary)
}
