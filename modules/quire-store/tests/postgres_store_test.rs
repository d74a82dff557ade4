//! Integration tests for PgIssueStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::collections::HashSet;

use chrono::{NaiveDate, Utc};
use quire_common::types::{
    Candidate, DedupMethod, DuplicateGroup, DuplicateMember, GroupCanonical, HarvestedItem,
    Issue, IssueStatus, Module, ModuleKind, ScoreRecord, SelectionMode,
};
use quire_store::{IssueStore, PgIssueStore, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

/// Get a migrated, empty test store, or skip if no test DB is available.
async fn test_store() -> Option<PgIssueStore> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    let store = PgIssueStore::new(pool);
    store.migrate().await.ok()?;

    sqlx::query(
        r#"
        TRUNCATE pipeline_runs, manual_actions, module_allocations, generated_articles,
                 pin_overrides, assets, modules, duplicate_groups, score_records,
                 scoring_criteria, candidates, issues CASCADE
        "#,
    )
    .execute(store.pool())
    .await
    .ok()?;

    Some(store)
}

fn candidate(issue_id: Uuid, url: &str, title: &str) -> Candidate {
    Candidate::from_harvested(
        HarvestedItem {
            source_id: "feed".into(),
            source_url: url.into(),
            title: title.into(),
            description: format!("{title}, described"),
            full_text: None,
            category: Some("tech".into()),
            published_at: Some(Utc::now()),
        },
        issue_id,
    )
}

async fn new_issue(store: &PgIssueStore) -> Issue {
    let issue = Issue::new(NaiveDate::from_ymd_opt(2026, 10, 14).unwrap());
    store.create_issue(&issue).await.unwrap();
    issue
}

#[tokio::test]
async fn issue_round_trips_with_failure() {
    let Some(store) = test_store().await else {
        return;
    };
    let issue = new_issue(&store).await;

    let failure = quire_common::types::StepFailure {
        step: "deduplicate".into(),
        error: "embedding timeout".into(),
    };
    store
        .set_issue_status(issue.id, IssueStatus::Failed, Some(&failure))
        .await
        .unwrap();

    let stored = store.get_issue(issue.id).await.unwrap().unwrap();
    assert_eq!(stored.status, IssueStatus::Failed);
    assert_eq!(stored.last_failed_step.as_deref(), Some("deduplicate"));
    assert_eq!(stored.last_error.as_deref(), Some("embedding timeout"));
}

#[tokio::test]
async fn candidate_upsert_is_keyed_by_issue_and_url() {
    let Some(store) = test_store().await else {
        return;
    };
    let issue = new_issue(&store).await;

    let first = candidate(issue.id, "https://a.example/story", "Story");
    let second = candidate(issue.id, "https://a.example/story", "Story, revised");
    let ids_a = store.upsert_candidates(&[first.clone()]).await.unwrap();
    let ids_b = store.upsert_candidates(&[second]).await.unwrap();

    assert_eq!(ids_a, ids_b);
    let rows = store.candidates_for_issue(issue.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, first.id);
    assert_eq!(rows[0].title, "Story, revised");
}

#[tokio::test]
async fn upsert_adopts_pool_row_with_same_url() {
    let Some(store) = test_store().await else {
        return;
    };
    let issue = new_issue(&store).await;
    let url = format!("https://pool.example/{}", Uuid::new_v4());

    let mut pooled = candidate(issue.id, &url, "Pooled");
    pooled.issue_id = None;
    store.upsert_candidates(&[pooled.clone()]).await.unwrap();

    let ids = store
        .upsert_candidates(&[candidate(issue.id, &url, "Pooled, again")])
        .await
        .unwrap();
    assert_eq!(ids, vec![pooled.id]);
    let rows = store.candidates_for_issue(issue.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].title, "Pooled, again");
}

#[tokio::test]
async fn group_replacement_recomputes_suppression() {
    let Some(store) = test_store().await else {
        return;
    };
    let issue = new_issue(&store).await;
    let a = candidate(issue.id, "https://a.example/1", "Same story");
    let b = candidate(issue.id, "https://b.example/1", "Same story");
    store.upsert_candidates(&[a.clone(), b.clone()]).await.unwrap();

    let group = DuplicateGroup {
        id: Uuid::new_v4(),
        issue_id: issue.id,
        topic_signature: "same story".into(),
        method: DedupMethod::ContentHash,
        canonical: GroupCanonical::Candidate { candidate_id: a.id },
        members: vec![DuplicateMember {
            candidate_id: b.id,
            similarity: 1.0,
            method: DedupMethod::ContentHash,
        }],
    };
    store
        .replace_duplicate_groups(issue.id, &[group.clone()])
        .await
        .unwrap();

    let groups = store.duplicate_groups(issue.id).await.unwrap();
    assert_eq!(groups, vec![group.clone()]);
    let rows = store.candidates_for_issue(issue.id).await.unwrap();
    let suppressed: Vec<Uuid> = rows.iter().filter(|c| c.suppressed).map(|c| c.id).collect();
    assert_eq!(suppressed, vec![b.id]);
    assert!(rows.iter().all(|c| c.duplicate_group_id == Some(group.id)));

    store.replace_duplicate_groups(issue.id, &[]).await.unwrap();
    let rows = store.candidates_for_issue(issue.id).await.unwrap();
    assert!(rows.iter().all(|c| !c.suppressed && c.duplicate_group_id.is_none()));
}

#[tokio::test]
async fn reset_releases_candidates_and_clears_scores() {
    let Some(store) = test_store().await else {
        return;
    };
    let issue = new_issue(&store).await;
    let c = candidate(issue.id, "https://a.example/1", "Story");
    store.upsert_candidates(&[c.clone()]).await.unwrap();
    store
        .upsert_score(&ScoreRecord {
            candidate_id: c.id,
            issue_id: issue.id,
            criteria: Vec::new(),
            total_score: 8.5,
            scored_at: Utc::now(),
        })
        .await
        .unwrap();

    let stats = store.reset_issue(issue.id).await.unwrap();
    assert_eq!(stats.candidates_released, 1);
    assert_eq!(stats.scores_deleted, 1);
    assert!(store.candidates_for_issue(issue.id).await.unwrap().is_empty());

    // Released candidates can be claimed again.
    let claimed = store
        .claim_pool_candidates(issue.id, Utc::now() - chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(claimed, 1);
    let rows = store.candidates_for_issue(issue.id).await.unwrap();
    assert_eq!(rows[0].total_score, None);
}

#[tokio::test]
async fn released_candidates_keep_the_final_set() {
    let Some(store) = test_store().await else {
        return;
    };
    let issue = new_issue(&store).await;
    let keep = candidate(issue.id, "https://a.example/keep", "Keep");
    let drop = candidate(issue.id, "https://a.example/drop", "Drop");
    store.upsert_candidates(&[keep.clone(), drop]).await.unwrap();

    let released = store
        .release_candidates(issue.id, &HashSet::from([keep.id]))
        .await
        .unwrap();
    assert_eq!(released, 1);
    let rows = store.candidates_for_issue(issue.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, keep.id);
}

#[tokio::test]
async fn sent_issue_cannot_be_reset() {
    let Some(store) = test_store().await else {
        return;
    };
    let issue = new_issue(&store).await;
    store
        .set_issue_status(issue.id, IssueStatus::Sent, None)
        .await
        .unwrap();
    assert!(matches!(
        store.reset_issue(issue.id).await,
        Err(StoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn modules_load_in_display_order() {
    let Some(store) = test_store().await else {
        return;
    };
    let module = |slug: &str, order: i32| Module {
        id: Uuid::new_v4(),
        name: slug.to_uppercase(),
        slug: slug.into(),
        kind: ModuleKind::Spotlight,
        capacity: 2,
        selection_mode: SelectionMode::Random,
        max_per_category: Some(1),
        cooldown_days: 7,
        display_order: order,
        active: true,
    };
    store.upsert_module(&module("later", 2)).await.unwrap();
    store.upsert_module(&module("first", 1)).await.unwrap();

    let slugs: Vec<String> = store
        .active_modules()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.slug)
        .collect();
    assert_eq!(slugs, vec!["first", "later"]);
    let first = store.module_by_slug("first").await.unwrap().unwrap();
    assert_eq!(first.max_per_category, Some(1));
}
