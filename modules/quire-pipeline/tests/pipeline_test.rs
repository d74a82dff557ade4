//! End-to-end pipeline runs over the in-memory store with mock collaborators.
//!
//! Run with: cargo test -p quire-pipeline --test pipeline_test

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use quire_common::types::{
    CriterionScore, HarvestedItem, Issue, IssueStatus, SelectionMode, StepStatus,
};
use quire_pipeline::dedup::deduplicate;
use quire_pipeline::finalize::ModuleStatus;
use quire_pipeline::scoring::score_issue;
use quire_pipeline::testing::{
    article_module, asset, asset_module, criteria, deps_with, harvested, issue_on, test_date,
    MockEvaluator, MockSource, MockWriter, RecordingNotifier,
};
use quire_pipeline::traits::CandidateSource;
use quire_pipeline::{Orchestrator, PipelineDeps};
use quire_store::{IssueStore, MemoryStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Ten stories; the first two are near-identical headlines of one event.
const TITLES: [&str; 10] = [
    "Apple announces new MacBook Pro with M5 chip",
    "Apple announces the new MacBook Pro with M5 chips",
    "City council approves downtown bike lanes",
    "Heatwave breaks records across southern Europe",
    "Central bank holds interest rates steady",
    "Startup raises funding for battery recycling",
    "Museum reopens after two-year renovation",
    "Researchers map deep ocean trenches",
    "Local library launches free coding classes",
    "Wildfire season starts early in California",
];

fn items() -> Vec<HarvestedItem> {
    TITLES
        .iter()
        .enumerate()
        .map(|(i, title)| harvested(&format!("https://news{i}.example/story"), title))
        .collect()
}

/// Scores 10, 9, 8, ... in title order.
fn ranked_evaluator() -> MockEvaluator {
    TITLES.iter().enumerate().fold(MockEvaluator::new(), |evaluator, (i, title)| {
        evaluator.on_title(
            title,
            vec![CriterionScore {
                name: "relevance".into(),
                score: 10 - i as u8,
                rationale: "ranked".into(),
            }],
        )
    })
}

struct Fixture {
    store: Arc<MemoryStore>,
    issue: Issue,
    notifier: Arc<RecordingNotifier>,
    deps: PipelineDeps,
}

/// Store seeded with criteria, a news module (3 slots), and a sponsors module
/// (2 slots, 3 assets); deps harvest [`TITLES`].
async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    store
        .set_scoring_criteria(criteria(&[("relevance", 1.0, true)]))
        .unwrap();
    store.insert_module(article_module("news", 3)).unwrap();
    let sponsors = asset_module("sponsors", 2, SelectionMode::AffiliatePriority);
    store.insert_module(sponsors.clone()).unwrap();
    for (name, affiliate, priority) in [("acme", true, 5), ("globex", true, 3), ("initech", false, 0)] {
        store
            .insert_asset(asset(&sponsors, name, None, affiliate, priority))
            .unwrap();
    }

    let issue = issue_on(store.as_ref()).await;
    let notifier = Arc::new(RecordingNotifier::new());
    let source: Arc<dyn CandidateSource> =
        Arc::new(MockSource::new("news").with_items(items()));
    let deps = PipelineDeps {
        sources: vec![source],
        evaluator: Arc::new(ranked_evaluator()),
        notifier: notifier.clone(),
        ..deps_with(store.clone())
    };
    Fixture {
        store,
        issue,
        notifier,
        deps,
    }
}

/// Source that marks the issue failed while harvesting, as an operator would.
struct CancellingSource {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl CandidateSource for CancellingSource {
    fn name(&self) -> &str {
        "cancelling"
    }

    async fn harvest(&self, issue: &Issue) -> anyhow::Result<Vec<HarvestedItem>> {
        self.store
            .set_issue_status(issue.id, IssueStatus::Failed, None)
            .await?;
        Ok(items())
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_pair_leaves_nine_survivors_in_one_group() {
    let f = fixture().await;
    let candidates: Vec<_> = items()
        .into_iter()
        .map(|item| quire_common::types::Candidate::from_harvested(item, f.issue.id))
        .collect();
    f.store.upsert_candidates(&candidates).await.unwrap();
    score_issue(&f.deps, &f.issue).await.unwrap();

    let summary = deduplicate(&f.deps, &f.issue).await.unwrap();
    assert_eq!(summary.group_count, 1);
    assert_eq!(summary.duplicate_count, 1);

    let groups = f.store.duplicate_groups(f.issue.id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].size(), 2);

    let survivors = f
        .store
        .candidates_for_issue(f.issue.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| !c.suppressed)
        .count();
    assert_eq!(survivors, 9);
}

#[tokio::test]
async fn deduplication_is_idempotent() {
    let f = fixture().await;
    let candidates: Vec<_> = items()
        .into_iter()
        .map(|item| quire_common::types::Candidate::from_harvested(item, f.issue.id))
        .collect();
    f.store.upsert_candidates(&candidates).await.unwrap();
    score_issue(&f.deps, &f.issue).await.unwrap();

    deduplicate(&f.deps, &f.issue).await.unwrap();
    let first = f.store.duplicate_groups(f.issue.id).await.unwrap();
    deduplicate(&f.deps, &f.issue).await.unwrap();
    let second = f.store.duplicate_groups(f.issue.id).await.unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].canonical, second[0].canonical);
    assert_eq!(first[0].members, second[0].members);
}

#[tokio::test]
async fn full_run_produces_a_draft_issue() {
    let f = fixture().await;
    let report = Orchestrator::new(f.deps.clone()).run_pipeline(f.issue.id).await;

    assert!(report.success, "report: {:?}", report.results);
    let names: Vec<&str> = report.results.iter().map(|r| r.step_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "prepare",
            "plan",
            "ingest",
            "score",
            "deduplicate",
            "module:news:titles",
            "module:news:bodies",
            "module:news:fact_check",
            "module:news:allocate",
            "module:sponsors:allocate",
            "finalize",
        ]
    );
    assert!(report.results.iter().all(|r| r.status == StepStatus::Success));

    let issue = f.store.get_issue(f.issue.id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Draft);
    assert_eq!(issue.title.as_deref(), Some(TITLES[0]));

    let mut finals: Vec<_> = f
        .store
        .articles_for_issue(f.issue.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.final_position.is_some())
        .collect();
    finals.sort_by_key(|a| a.final_position);
    let headlines: Vec<&str> = finals.iter().map(|a| a.headline.as_str()).collect();
    assert_eq!(headlines, vec![TITLES[0], TITLES[2], TITLES[3]]);
    assert!(finals.iter().all(|a| a.active && a.body.is_some()));

    // Only the sources of final articles stay with the issue.
    assert_eq!(f.store.candidates_for_issue(f.issue.id).await.unwrap().len(), 3);

    let used: Vec<_> = f
        .store
        .assets()
        .unwrap()
        .into_iter()
        .filter(|a| a.last_used_on == Some(test_date()))
        .map(|a| a.name)
        .collect();
    assert_eq!(used.len(), 2);
    assert!(used.contains(&"acme".to_string()));
    assert!(used.contains(&"globex".to_string()));

    let sent = f.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].success);
    assert_eq!(f.store.runs().unwrap().len(), 1);
}

#[tokio::test]
async fn always_failing_step_fails_the_issue_after_three_attempts() {
    let f = fixture().await;
    let deps = PipelineDeps {
        writer: Arc::new(MockWriter::new().failing_headlines()),
        ..f.deps.clone()
    };

    let report = Orchestrator::new(deps).run_pipeline(f.issue.id).await;
    assert!(!report.success);

    let last = report.results.last().unwrap();
    assert_eq!(last.step_name, "module:news:titles");
    assert_eq!(last.status, StepStatus::Failed);
    assert_eq!(last.attempts, 3);

    let issue = f.store.get_issue(f.issue.id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Failed);
    assert_eq!(issue.last_failed_step.as_deref(), Some("module:news:titles"));
    assert!(issue.last_error.is_some());

    let sent = f.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].success);
    assert_eq!(
        sent[0].failure.as_ref().map(|failure| failure.step.as_str()),
        Some("module:news:titles")
    );
    let runs = f.store.runs().unwrap();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].success);
}

#[tokio::test]
async fn failed_issue_can_be_rerun_to_success() {
    let f = fixture().await;
    let failing = PipelineDeps {
        writer: Arc::new(MockWriter::new().failing_headlines()),
        ..f.deps.clone()
    };
    assert!(!Orchestrator::new(failing).run_pipeline(f.issue.id).await.success);

    let report = Orchestrator::new(f.deps.clone()).run_pipeline(f.issue.id).await;
    assert!(report.success, "report: {:?}", report.results);

    let score = report.results.iter().find(|r| r.step_name == "score").unwrap();
    let skipped = score.data.as_ref().and_then(|d| d["skipped"].as_u64());
    assert_eq!(skipped, Some(10), "scores from the failed run are reused");

    let issue = f.store.get_issue(f.issue.id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Draft);
    assert!(issue.last_failed_step.is_none());
}

#[tokio::test]
async fn external_failure_cancels_the_pending_step() {
    let f = fixture().await;
    let source: Arc<dyn CandidateSource> = Arc::new(CancellingSource {
        store: f.store.clone(),
    });
    let deps = PipelineDeps {
        sources: vec![source],
        ..f.deps.clone()
    };

    let report = Orchestrator::new(deps).run_pipeline(f.issue.id).await;
    assert!(!report.success);

    let last = report.results.last().unwrap();
    assert_eq!(last.step_name, "score");
    assert_eq!(last.status, StepStatus::Cancelled);
    assert!(f.store.scores_for_issue(f.issue.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_issue_fails_prepare_and_writes_nothing() {
    let f = fixture().await;
    let report = Orchestrator::new(f.deps.clone()).run_pipeline(Uuid::new_v4()).await;

    assert!(!report.success);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].step_name, "prepare");
    assert!(f.store.runs().unwrap().is_empty());
    assert!(f.notifier.sent().is_empty());
}

#[tokio::test]
async fn draft_issue_is_refused_without_status_change() {
    let f = fixture().await;
    let orchestrator = Orchestrator::new(f.deps.clone());
    assert!(orchestrator.run_pipeline(f.issue.id).await.success);

    let report = orchestrator.run_pipeline(f.issue.id).await;
    assert!(!report.success);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].attempts, 1);

    let issue = f.store.get_issue(f.issue.id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Draft);
}

#[tokio::test]
async fn no_active_modules_fails_the_plan_step() {
    let store = Arc::new(MemoryStore::new());
    let issue = issue_on(store.as_ref()).await;

    let report = Orchestrator::new(deps_with(store.clone())).run_pipeline(issue.id).await;
    assert!(!report.success);
    assert_eq!(report.results.last().unwrap().step_name, "plan");

    let issue = store.get_issue(issue.id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Failed);
    assert_eq!(issue.last_failed_step.as_deref(), Some("plan"));
}

#[tokio::test]
async fn reset_releases_candidates_and_allows_a_clean_rerun() {
    let f = fixture().await;
    let orchestrator = Orchestrator::new(f.deps.clone());
    assert!(orchestrator.run_pipeline(f.issue.id).await.success);

    let stats = orchestrator.reset_issue(f.issue.id).await.unwrap();
    assert_eq!(stats.candidates_released, 3);
    assert!(stats.articles_deleted > 0);

    let issue = f.store.get_issue(f.issue.id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Processing);
    assert!(issue.title.is_none());
    assert!(f.store.articles_for_issue(f.issue.id).await.unwrap().is_empty());

    let report = orchestrator.run_pipeline(f.issue.id).await;
    assert!(report.success, "report: {:?}", report.results);
}

#[tokio::test]
async fn manual_module_is_reported_as_awaiting_selection() {
    let f = fixture().await;
    let mut polls = asset_module("polls", 2, SelectionMode::Manual);
    polls.display_order = 20;
    f.store.insert_module(polls.clone()).unwrap();
    f.store
        .insert_asset(asset(&polls, "favourite-editor", None, false, 0))
        .unwrap();

    let report = Orchestrator::new(f.deps.clone()).run_pipeline(f.issue.id).await;
    assert!(report.success, "report: {:?}", report.results);

    let finalize = report.results.iter().find(|r| r.step_name == "finalize").unwrap();
    let modules = finalize.data.as_ref().unwrap()["modules"].as_array().unwrap().clone();
    let polls_outcome = modules.iter().find(|m| m["slug"] == "polls").unwrap();
    assert_eq!(
        polls_outcome["status"],
        serde_json::to_value(ModuleStatus::AwaitingSelection).unwrap()
    );

    let allocation = f
        .store
        .get_allocation(f.issue.id, polls.id)
        .await
        .unwrap()
        .unwrap();
    assert!(allocation.awaiting_selection);
    assert!(allocation.slots.is_empty());
}
