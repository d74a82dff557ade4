//! Ingestion step: harvest from every configured source, upsert the items as
//! candidates of the issue, then claim recent unassigned pool candidates.

use chrono::{Duration, NaiveTime};
use serde::Serialize;
use tracing::{info, warn};

use quire_common::types::{Candidate, Issue};
use quire_common::{QuireError, Result};

use crate::deps::PipelineDeps;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub harvested: usize,
    pub failed_sources: usize,
    pub claimed: u64,
    pub total: usize,
}

pub async fn ingest(deps: &PipelineDeps, issue: &Issue) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();

    for source in &deps.sources {
        let items = match source.harvest(issue).await {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    issue_id = %issue.id,
                    source = source.name(),
                    error = %e,
                    "Source harvest failed, skipping"
                );
                summary.failed_sources += 1;
                continue;
            }
        };
        let candidates: Vec<Candidate> = items
            .into_iter()
            .filter(|item| !item.source_url.trim().is_empty() && !item.title.trim().is_empty())
            .map(|item| Candidate::from_harvested(item, issue.id))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        let ids = deps.store.upsert_candidates(&candidates).await?;
        info!(issue_id = %issue.id, source = source.name(), items = ids.len(), "Harvested candidates");
        summary.harvested += ids.len();
    }

    let since = issue.issue_date.and_time(NaiveTime::MIN).and_utc()
        - Duration::days(deps.settings.candidate_lookback_days);
    summary.claimed = deps.store.claim_pool_candidates(issue.id, since).await?;

    summary.total = deps.store.candidates_for_issue(issue.id).await?.len();
    if summary.total == 0 {
        return Err(QuireError::Fatal(format!(
            "issue {} has no candidates after ingestion",
            issue.id
        )));
    }

    info!(
        issue_id = %issue.id,
        harvested = summary.harvested,
        claimed = summary.claimed,
        total = summary.total,
        "Ingestion complete"
    );
    Ok(summary)
}
