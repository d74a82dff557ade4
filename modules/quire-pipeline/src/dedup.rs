//! Four-pass duplicate detection for an issue's candidates.
//!
//! Passes run cheapest first: historical match against recently sent issues,
//! exact content hash, title similarity, then embedding similarity. An item
//! placed in a group is never reconsidered by a later pass, so groups are
//! disjoint. The canonical member of a group is the first in candidate order
//! (highest score, then earliest publication), which makes re-running the
//! step over the same inputs produce the same canonical set.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::Duration;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use quire_common::fingerprint::{
    cosine_similarity, normalize_title, normalize_url, title_similarity,
};
use quire_common::types::{
    Candidate, DedupMethod, DuplicateGroup, DuplicateMember, GroupCanonical, Issue,
    PublishedItem,
};
use quire_common::Result;

use crate::deps::PipelineDeps;
use crate::traits::TextEmbedder;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupSummary {
    pub group_count: usize,
    pub duplicate_count: usize,
    /// Set when the embedding pass could not run.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub semantic_skipped: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupThresholds {
    pub title: f64,
    pub semantic: f64,
}

/// Total order defining "first seen": score descending with unscored last,
/// then publication ascending with undated last, then id.
pub fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    let by_score = match (a.total_score, b.total_score) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    let by_date = match (a.published_at, b.published_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score.then(by_date).then_with(|| a.id.cmp(&b.id))
}

/// Working state shared by the passes.
struct Grouping<'a> {
    issue_id: Uuid,
    ordered: Vec<&'a Candidate>,
    grouped: HashSet<Uuid>,
    groups: Vec<DuplicateGroup>,
}

impl<'a> Grouping<'a> {
    fn new(issue_id: Uuid, candidates: &'a [Candidate]) -> Self {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| candidate_order(a, b));
        Self {
            issue_id,
            ordered,
            grouped: HashSet::new(),
            groups: Vec::new(),
        }
    }

    fn ungrouped(&self) -> Vec<&'a Candidate> {
        self.ordered
            .iter()
            .copied()
            .filter(|c| !self.grouped.contains(&c.id))
            .collect()
    }

    /// Record a group whose canonical is `seed`; `members` are suppressed.
    fn push_candidate_group(
        &mut self,
        method: DedupMethod,
        seed: &Candidate,
        members: Vec<(Uuid, f64)>,
    ) {
        self.grouped.insert(seed.id);
        let canonical = GroupCanonical::Candidate {
            candidate_id: seed.id,
        };
        self.push(method, canonical, &seed.title, members);
    }

    fn push(
        &mut self,
        method: DedupMethod,
        canonical: GroupCanonical,
        title: &str,
        members: Vec<(Uuid, f64)>,
    ) {
        let members = members
            .into_iter()
            .map(|(candidate_id, similarity)| {
                self.grouped.insert(candidate_id);
                DuplicateMember {
                    candidate_id,
                    similarity,
                    method,
                }
            })
            .collect();
        self.groups.push(DuplicateGroup {
            id: Uuid::new_v4(),
            issue_id: self.issue_id,
            topic_signature: normalize_title(title),
            method,
            canonical,
            members,
        });
    }

    /// Pass 1: candidates matching an already-published item. Every match is
    /// suppressed; the published item is the canonical.
    fn historical(&mut self, published: &[PublishedItem], threshold: f64) {
        for item in published {
            let item_url = normalize_url(&item.source_url);
            let matches: Vec<(Uuid, f64)> = self
                .ungrouped()
                .into_iter()
                .filter_map(|c| {
                    if normalize_url(&c.source_url) == item_url
                        || c.content_hash == item.content_hash
                    {
                        return Some((c.id, 1.0));
                    }
                    let sim = title_similarity(&c.title, &item.title);
                    (sim >= threshold).then_some((c.id, sim))
                })
                .collect();
            if matches.is_empty() {
                continue;
            }
            self.push(
                DedupMethod::Historical,
                GroupCanonical::Published {
                    article_id: item.article_id,
                    issue_id: item.issue_id,
                    title: item.title.clone(),
                },
                &item.title,
                matches,
            );
        }
    }

    /// Pass 2: identical content hashes.
    fn content_hash(&mut self) {
        let mut buckets: Vec<(String, Vec<&Candidate>)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for c in self.ungrouped() {
            match index.get(c.content_hash.as_str()) {
                Some(&i) => buckets[i].1.push(c),
                None => {
                    index.insert(c.content_hash.as_str(), buckets.len());
                    buckets.push((c.content_hash.clone(), vec![c]));
                }
            }
        }
        for (_, bucket) in buckets {
            if bucket.len() < 2 {
                continue;
            }
            let seed = bucket[0];
            let members = bucket[1..].iter().map(|c| (c.id, 1.0)).collect();
            self.push_candidate_group(DedupMethod::ContentHash, seed, members);
        }
    }

    /// Greedy seeding shared by the similarity passes: each ungrouped item in
    /// order claims every later ungrouped item at or above the threshold.
    fn greedy<F>(&mut self, method: DedupMethod, threshold: f64, similarity: F)
    where
        F: Fn(&Candidate, &Candidate) -> Option<f64>,
    {
        let ungrouped = self.ungrouped();
        for (i, seed) in ungrouped.iter().enumerate() {
            if self.grouped.contains(&seed.id) {
                continue;
            }
            let members: Vec<(Uuid, f64)> = ungrouped[i + 1..]
                .iter()
                .filter(|other| !self.grouped.contains(&other.id))
                .filter_map(|other| {
                    let sim = similarity(*seed, *other)?;
                    (sim >= threshold).then_some((other.id, sim))
                })
                .collect();
            if !members.is_empty() {
                self.push_candidate_group(method, *seed, members);
            }
        }
    }
}

/// Text sent to the embedder for one candidate.
fn embedding_text(candidate: &Candidate) -> String {
    if candidate.description.trim().is_empty() {
        candidate.title.clone()
    } else {
        format!("{}\n{}", candidate.title, candidate.description)
    }
}

/// Group an issue's candidates. Returns the groups and whether the semantic
/// pass was skipped.
pub async fn detect_duplicates(
    issue_id: Uuid,
    candidates: &[Candidate],
    published: &[PublishedItem],
    embedder: &dyn TextEmbedder,
    thresholds: DedupThresholds,
) -> (Vec<DuplicateGroup>, bool) {
    let mut grouping = Grouping::new(issue_id, candidates);

    grouping.historical(published, thresholds.title);
    grouping.content_hash();
    grouping.greedy(DedupMethod::TitleSimilarity, thresholds.title, |a, b| {
        Some(title_similarity(&a.title, &b.title))
    });

    let remaining = grouping.ungrouped();
    let mut semantic_skipped = false;
    if remaining.len() >= 2 {
        let texts = remaining.iter().map(|c| embedding_text(c)).collect();
        match embedder.embed_batch(texts).await {
            Ok(vectors) if vectors.len() == remaining.len() => {
                let by_id: HashMap<Uuid, Vec<f32>> =
                    remaining.iter().map(|c| c.id).zip(vectors).collect();
                grouping.greedy(DedupMethod::Semantic, thresholds.semantic, |a, b| {
                    Some(cosine_similarity(by_id.get(&a.id)?, by_id.get(&b.id)?))
                });
            }
            Ok(vectors) => {
                warn!(
                    %issue_id,
                    expected = remaining.len(),
                    got = vectors.len(),
                    "Embedding count mismatch, skipping semantic pass"
                );
                semantic_skipped = true;
            }
            Err(e) => {
                warn!(%issue_id, error = %e, "Embedding failed, skipping semantic pass");
                semantic_skipped = true;
            }
        }
    }

    (grouping.groups, semantic_skipped)
}

/// Deduplication step: detect groups and replace the issue's stored groups
/// and suppression flags with them.
pub async fn deduplicate(deps: &PipelineDeps, issue: &Issue) -> Result<DedupSummary> {
    let candidates = deps.store.candidates_for_issue(issue.id).await?;
    let since = issue.issue_date - Duration::days(deps.settings.historical_window_days);
    let published = deps.store.published_since(since, issue.id).await?;

    let thresholds = DedupThresholds {
        title: deps.settings.title_similarity_threshold,
        semantic: deps.settings.semantic_similarity_threshold,
    };
    let (groups, semantic_skipped) = detect_duplicates(
        issue.id,
        &candidates,
        &published,
        deps.embedder.as_ref(),
        thresholds,
    )
    .await;

    deps.store.replace_duplicate_groups(issue.id, &groups).await?;

    let summary = DedupSummary {
        group_count: groups.len(),
        duplicate_count: groups.iter().map(|g| g.members.len()).sum(),
        semantic_skipped,
    };
    info!(
        issue_id = %issue.id,
        candidates = candidates.len(),
        published = published.len(),
        groups = summary.group_count,
        duplicates = summary.duplicate_count,
        "Deduplication complete"
    );
    Ok(summary)
}
