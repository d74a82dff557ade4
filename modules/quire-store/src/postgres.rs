// Postgres-backed IssueStore.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use quire_common::types::{
    AllocatedSlot, Asset, Candidate, CriteriaConfig, CriterionConfig, DedupMethod,
    DuplicateGroup, DuplicateMember, FactCheck, GeneratedArticle, GroupCanonical, Issue,
    IssueStatus, ManualAction, ManualActionKind, Module, ModuleAllocation, ModuleKind,
    PinOverrides, PublishedItem, RunRecord, ScoreRecord, SelectionMode, StepFailure,
    WeightedCriterionScore,
};

use crate::error::{Result, StoreError};
use crate::store::{check_disjoint, IssueStore, ResetStats};

pub struct PgIssueStore {
    pool: PgPool,
}

impl PgIssueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Store migrations applied");
        Ok(())
    }

    // --- Configuration writes (modules, assets, criteria are operator-managed) ---

    pub async fn upsert_module(&self, module: &Module) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO modules
                (id, name, slug, kind, capacity, selection_mode,
                 max_per_category, cooldown_days, display_order, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                slug = EXCLUDED.slug,
                kind = EXCLUDED.kind,
                capacity = EXCLUDED.capacity,
                selection_mode = EXCLUDED.selection_mode,
                max_per_category = EXCLUDED.max_per_category,
                cooldown_days = EXCLUDED.cooldown_days,
                display_order = EXCLUDED.display_order,
                active = EXCLUDED.active
            "#,
        )
        .bind(module.id)
        .bind(&module.name)
        .bind(&module.slug)
        .bind(module.kind.as_str())
        .bind(to_i32(module.capacity, "capacity")?)
        .bind(module.selection_mode.as_str())
        .bind(module.max_per_category.map(|v| to_i32(v, "max_per_category")).transpose()?)
        .bind(to_i32_days(module.cooldown_days)?)
        .bind(module.display_order)
        .bind(module.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_asset(&self, asset: &Asset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assets
                (id, module_id, name, category, is_affiliate, priority,
                 pinned_position, last_used_on, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                module_id = EXCLUDED.module_id,
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                is_affiliate = EXCLUDED.is_affiliate,
                priority = EXCLUDED.priority,
                pinned_position = EXCLUDED.pinned_position,
                last_used_on = EXCLUDED.last_used_on,
                active = EXCLUDED.active
            "#,
        )
        .bind(asset.id)
        .bind(asset.module_id)
        .bind(&asset.name)
        .bind(&asset.category)
        .bind(asset.is_affiliate)
        .bind(asset.priority)
        .bind(asset.pinned_position.map(|p| to_i32(p, "pinned_position")).transpose()?)
        .bind(asset.last_used_on)
        .bind(asset.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_pin_override(
        &self,
        issue_id: Uuid,
        module_id: Uuid,
        asset_id: Uuid,
        position: Option<usize>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pin_overrides (issue_id, module_id, asset_id, position)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (issue_id, asset_id) DO UPDATE SET position = EXCLUDED.position
            "#,
        )
        .bind(issue_id)
        .bind(module_id)
        .bind(asset_id)
        .bind(position.map(|p| to_i32(p, "position")).transpose()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the criteria set. Listing order is preserved.
    pub async fn set_scoring_criteria(&self, criteria: &CriteriaConfig) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM scoring_criteria").execute(&mut *tx).await?;
        for (order, criterion) in criteria.criteria.iter().enumerate() {
            sqlx::query(
                "INSERT INTO scoring_criteria (name, weight, enabled, sort_order) VALUES ($1, $2, $3, $4)",
            )
            .bind(&criterion.name)
            .bind(criterion.weight)
            .bind(criterion.enabled)
            .bind(to_i32(order, "sort_order")?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// --- Row types ---

#[derive(sqlx::FromRow)]
struct IssueRow {
    id: Uuid,
    issue_date: NaiveDate,
    status: String,
    title: Option<String>,
    last_failed_step: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IssueRow> for Issue {
    type Error = StoreError;

    fn try_from(row: IssueRow) -> Result<Self> {
        Ok(Issue {
            id: row.id,
            issue_date: row.issue_date,
            status: parse_status(&row.status)?,
            title: row.title,
            last_failed_step: row.last_failed_step,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: Uuid,
    issue_id: Option<Uuid>,
    source_id: String,
    source_url: String,
    title: String,
    description: String,
    full_text: Option<String>,
    category: Option<String>,
    published_at: Option<DateTime<Utc>>,
    content_hash: String,
    total_score: Option<f64>,
    suppressed: bool,
    duplicate_group_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<CandidateRow> for Candidate {
    fn from(row: CandidateRow) -> Self {
        Candidate {
            id: row.id,
            issue_id: row.issue_id,
            source_id: row.source_id,
            source_url: row.source_url,
            title: row.title,
            description: row.description,
            full_text: row.full_text,
            category: row.category,
            published_at: row.published_at,
            content_hash: row.content_hash,
            total_score: row.total_score,
            suppressed: row.suppressed,
            duplicate_group_id: row.duplicate_group_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScoreRow {
    candidate_id: Uuid,
    issue_id: Uuid,
    criteria: Json<Vec<WeightedCriterionScore>>,
    total_score: f64,
    scored_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: Uuid,
    issue_id: Uuid,
    topic_signature: String,
    method: String,
    canonical: Json<GroupCanonical>,
    members: Json<Vec<DuplicateMember>>,
}

impl TryFrom<GroupRow> for DuplicateGroup {
    type Error = StoreError;

    fn try_from(row: GroupRow) -> Result<Self> {
        Ok(DuplicateGroup {
            id: row.id,
            issue_id: row.issue_id,
            topic_signature: row.topic_signature,
            method: parse_method(&row.method)?,
            canonical: row.canonical.0,
            members: row.members.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ModuleRow {
    id: Uuid,
    name: String,
    slug: String,
    kind: String,
    capacity: i32,
    selection_mode: String,
    max_per_category: Option<i32>,
    cooldown_days: i32,
    display_order: i32,
    active: bool,
}

impl TryFrom<ModuleRow> for Module {
    type Error = StoreError;

    fn try_from(row: ModuleRow) -> Result<Self> {
        Ok(Module {
            kind: ModuleKind::parse(&row.kind)
                .ok_or_else(|| StoreError::Corrupt(format!("module kind '{}'", row.kind)))?,
            selection_mode: SelectionMode::parse(&row.selection_mode).ok_or_else(|| {
                StoreError::Corrupt(format!("selection mode '{}'", row.selection_mode))
            })?,
            capacity: to_usize(row.capacity, "capacity")?,
            max_per_category: row
                .max_per_category
                .map(|v| to_usize(v, "max_per_category"))
                .transpose()?,
            cooldown_days: i64::from(row.cooldown_days),
            id: row.id,
            name: row.name,
            slug: row.slug,
            display_order: row.display_order,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AssetRow {
    id: Uuid,
    module_id: Uuid,
    name: String,
    category: Option<String>,
    is_affiliate: bool,
    priority: i32,
    pinned_position: Option<i32>,
    last_used_on: Option<NaiveDate>,
    active: bool,
}

impl TryFrom<AssetRow> for Asset {
    type Error = StoreError;

    fn try_from(row: AssetRow) -> Result<Self> {
        Ok(Asset {
            id: row.id,
            module_id: row.module_id,
            name: row.name,
            category: row.category,
            is_affiliate: row.is_affiliate,
            priority: row.priority,
            pinned_position: row
                .pinned_position
                .map(|p| to_usize(p, "pinned_position"))
                .transpose()?,
            last_used_on: row.last_used_on,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: Uuid,
    issue_id: Uuid,
    module_id: Uuid,
    candidate_id: Uuid,
    category: Option<String>,
    source_score: f64,
    headline: String,
    body: Option<String>,
    word_count: i32,
    rank: Option<i32>,
    final_position: Option<i32>,
    active: bool,
    suppressed: bool,
    fact_check: Option<Json<FactCheck>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ArticleRow> for GeneratedArticle {
    type Error = StoreError;

    fn try_from(row: ArticleRow) -> Result<Self> {
        let to_u32 = |v: i32, what: &str| {
            u32::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative {what}: {v}")))
        };
        Ok(GeneratedArticle {
            id: row.id,
            issue_id: row.issue_id,
            module_id: row.module_id,
            candidate_id: row.candidate_id,
            category: row.category,
            source_score: row.source_score,
            headline: row.headline,
            body: row.body,
            word_count: to_u32(row.word_count, "word_count")?,
            rank: row.rank.map(|v| to_u32(v, "rank")).transpose()?,
            final_position: row
                .final_position
                .map(|v| to_u32(v, "final_position"))
                .transpose()?,
            active: row.active,
            suppressed: row.suppressed,
            fact_check: row.fact_check.map(|j| j.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AllocationRow {
    issue_id: Uuid,
    module_id: Uuid,
    selection_mode: String,
    slots: Json<Vec<AllocatedSlot>>,
    awaiting_selection: bool,
    manually_edited: bool,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: Uuid,
    issue_id: Uuid,
    module_id: Uuid,
    action: Json<ManualActionKind>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PublishedRow {
    article_id: Uuid,
    issue_id: Uuid,
    issue_date: NaiveDate,
    title: String,
    source_url: String,
    content_hash: String,
}

// --- Conversions ---

fn parse_status(raw: &str) -> Result<IssueStatus> {
    IssueStatus::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("issue status '{raw}'")))
}

fn parse_method(raw: &str) -> Result<DedupMethod> {
    match raw {
        "historical" => Ok(DedupMethod::Historical),
        "content_hash" => Ok(DedupMethod::ContentHash),
        "title_similarity" => Ok(DedupMethod::TitleSimilarity),
        "semantic" => Ok(DedupMethod::Semantic),
        other => Err(StoreError::Corrupt(format!("dedup method '{other}'"))),
    }
}

fn to_usize(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {what}: {value}")))
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Conflict(format!("{what} out of range: {value}")))
}

fn to_i32_days(days: i64) -> Result<i32> {
    i32::try_from(days).map_err(|_| StoreError::Conflict(format!("cooldown out of range: {days}")))
}

fn u32_to_i32(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Conflict(format!("{what} out of range: {value}")))
}

#[async_trait]
impl IssueStore for PgIssueStore {
    async fn create_issue(&self, issue: &Issue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO issues (id, issue_date, status, title, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(issue.id)
        .bind(issue.issue_date)
        .bind(issue.status.as_str())
        .bind(&issue.title)
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_issue(&self, issue_id: Uuid) -> Result<Option<Issue>> {
        let row = sqlx::query_as::<_, IssueRow>("SELECT * FROM issues WHERE id = $1")
            .bind(issue_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Issue::try_from).transpose()
    }

    async fn set_issue_status(
        &self,
        issue_id: Uuid,
        status: IssueStatus,
        failure: Option<&StepFailure>,
    ) -> Result<()> {
        let (step, error) = match (status, failure) {
            (IssueStatus::Failed, Some(f)) => (Some(f.step.as_str()), Some(f.error.as_str())),
            _ => (None, None),
        };
        let result = sqlx::query(
            r#"
            UPDATE issues
            SET status = $2, last_failed_step = $3, last_error = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(issue_id)
        .bind(status.as_str())
        .bind(step)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("issue", issue_id));
        }
        Ok(())
    }

    async fn set_issue_title(&self, issue_id: Uuid, title: &str) -> Result<()> {
        let result = sqlx::query("UPDATE issues SET title = $2, updated_at = now() WHERE id = $1")
            .bind(issue_id)
            .bind(title)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("issue", issue_id));
        }
        Ok(())
    }

    async fn upsert_candidates(&self, candidates: &[Candidate]) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(candidates.len());
        for c in candidates {
            if c.issue_id.is_some() {
                // Adopt an unassigned pool row for the same URL instead of duplicating it.
                let adopted = sqlx::query_scalar::<_, Uuid>(
                    r#"
                    UPDATE candidates SET
                        issue_id = $1,
                        source_id = $3,
                        title = $4,
                        description = $5,
                        full_text = $6,
                        category = $7,
                        published_at = $8,
                        content_hash = $9
                    WHERE id = (
                        SELECT id FROM candidates
                        WHERE issue_id IS NULL AND source_url = $2
                        ORDER BY created_at
                        LIMIT 1
                    )
                    AND NOT EXISTS (
                        SELECT 1 FROM candidates WHERE issue_id = $1 AND source_url = $2
                    )
                    RETURNING id
                    "#,
                )
                .bind(c.issue_id)
                .bind(&c.source_url)
                .bind(&c.source_id)
                .bind(&c.title)
                .bind(&c.description)
                .bind(&c.full_text)
                .bind(&c.category)
                .bind(c.published_at)
                .bind(&c.content_hash)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(id) = adopted {
                    ids.push(id);
                    continue;
                }
            }
            let id = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO candidates
                    (id, issue_id, source_id, source_url, title, description, full_text,
                     category, published_at, content_hash, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (issue_id, source_url) WHERE issue_id IS NOT NULL DO UPDATE SET
                    source_id = EXCLUDED.source_id,
                    title = EXCLUDED.title,
                    description = EXCLUDED.description,
                    full_text = EXCLUDED.full_text,
                    category = EXCLUDED.category,
                    published_at = EXCLUDED.published_at,
                    content_hash = EXCLUDED.content_hash
                RETURNING id
                "#,
            )
            .bind(c.id)
            .bind(c.issue_id)
            .bind(&c.source_id)
            .bind(&c.source_url)
            .bind(&c.title)
            .bind(&c.description)
            .bind(&c.full_text)
            .bind(&c.category)
            .bind(c.published_at)
            .bind(&c.content_hash)
            .bind(c.created_at)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn claim_pool_candidates(&self, issue_id: Uuid, since: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE candidates SET issue_id = $1
            WHERE id IN (
                SELECT DISTINCT ON (p.source_url) p.id
                FROM candidates p
                WHERE p.issue_id IS NULL
                  AND p.published_at >= $2
                  AND NOT EXISTS (
                      SELECT 1 FROM candidates o
                      WHERE o.issue_id = $1 AND o.source_url = p.source_url
                  )
                ORDER BY p.source_url, p.created_at
            )
            "#,
        )
        .bind(issue_id)
        .bind(since)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn candidates_for_issue(&self, issue_id: Uuid) -> Result<Vec<Candidate>> {
        let rows = sqlx::query_as::<_, CandidateRow>(
            "SELECT * FROM candidates WHERE issue_id = $1 ORDER BY created_at, id",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Candidate::from).collect())
    }

    async fn release_candidates(&self, issue_id: Uuid, keep: &HashSet<Uuid>) -> Result<u64> {
        let keep: Vec<Uuid> = keep.iter().copied().collect();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM score_records WHERE issue_id = $1 AND NOT (candidate_id = ANY($2))",
        )
        .bind(issue_id)
        .bind(&keep)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            r#"
            UPDATE candidates
            SET issue_id = NULL, total_score = NULL, suppressed = false, duplicate_group_id = NULL
            WHERE issue_id = $1 AND NOT (id = ANY($2))
            "#,
        )
        .bind(issue_id)
        .bind(&keep)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn scoring_criteria(&self) -> Result<CriteriaConfig> {
        let rows = sqlx::query_as::<_, (String, f64, bool)>(
            "SELECT name, weight, enabled FROM scoring_criteria ORDER BY sort_order, name",
        )
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Err(StoreError::not_found("scoring criteria", "default"));
        }
        Ok(CriteriaConfig {
            criteria: rows
                .into_iter()
                .map(|(name, weight, enabled)| CriterionConfig {
                    name,
                    weight,
                    enabled,
                })
                .collect(),
        })
    }

    async fn upsert_score(&self, record: &ScoreRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE candidates SET total_score = $2 WHERE id = $1")
            .bind(record.candidate_id)
            .bind(record.total_score)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("candidate", record.candidate_id));
        }
        sqlx::query(
            r#"
            INSERT INTO score_records (candidate_id, issue_id, criteria, total_score, scored_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (candidate_id) DO UPDATE SET
                issue_id = EXCLUDED.issue_id,
                criteria = EXCLUDED.criteria,
                total_score = EXCLUDED.total_score,
                scored_at = EXCLUDED.scored_at
            "#,
        )
        .bind(record.candidate_id)
        .bind(record.issue_id)
        .bind(Json(&record.criteria))
        .bind(record.total_score)
        .bind(record.scored_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn scores_for_issue(&self, issue_id: Uuid) -> Result<Vec<ScoreRecord>> {
        let rows = sqlx::query_as::<_, ScoreRow>(
            "SELECT * FROM score_records WHERE issue_id = $1 ORDER BY candidate_id",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ScoreRecord {
                candidate_id: r.candidate_id,
                issue_id: r.issue_id,
                criteria: r.criteria.0,
                total_score: r.total_score,
                scored_at: r.scored_at,
            })
            .collect())
    }

    async fn published_since(
        &self,
        since: NaiveDate,
        exclude_issue: Uuid,
    ) -> Result<Vec<PublishedItem>> {
        let rows = sqlx::query_as::<_, PublishedRow>(
            r#"
            SELECT a.id AS article_id, i.id AS issue_id, i.issue_date,
                   c.title, c.source_url, c.content_hash
            FROM generated_articles a
            JOIN issues i ON i.id = a.issue_id
            JOIN candidates c ON c.id = a.candidate_id
            WHERE i.status = 'sent'
              AND i.issue_date >= $1
              AND i.id <> $2
              AND a.active
              AND a.final_position IS NOT NULL
            ORDER BY i.issue_date DESC, a.final_position
            "#,
        )
        .bind(since)
        .bind(exclude_issue)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| PublishedItem {
                article_id: r.article_id,
                issue_id: r.issue_id,
                issue_date: r.issue_date,
                title: r.title,
                source_url: r.source_url,
                content_hash: r.content_hash,
            })
            .collect())
    }

    async fn replace_duplicate_groups(
        &self,
        issue_id: Uuid,
        groups: &[DuplicateGroup],
    ) -> Result<()> {
        check_disjoint(groups)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM duplicate_groups WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE candidates SET suppressed = false, duplicate_group_id = NULL WHERE issue_id = $1",
        )
        .bind(issue_id)
        .execute(&mut *tx)
        .await?;

        for group in groups {
            sqlx::query(
                r#"
                INSERT INTO duplicate_groups
                    (id, issue_id, topic_signature, method, canonical, members)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(group.id)
            .bind(group.issue_id)
            .bind(&group.topic_signature)
            .bind(group.method.to_string())
            .bind(Json(&group.canonical))
            .bind(Json(&group.members))
            .execute(&mut *tx)
            .await?;

            let suppressed: Vec<Uuid> = group.suppressed_ids().collect();
            sqlx::query(
                r#"
                UPDATE candidates SET suppressed = true, duplicate_group_id = $2
                WHERE issue_id = $1 AND id = ANY($3)
                "#,
            )
            .bind(issue_id)
            .bind(group.id)
            .bind(&suppressed)
            .execute(&mut *tx)
            .await?;

            if let Some(canonical) = group.canonical_candidate() {
                sqlx::query("UPDATE candidates SET duplicate_group_id = $2 WHERE id = $1")
                    .bind(canonical)
                    .bind(group.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        debug!(%issue_id, groups = groups.len(), "Duplicate groups replaced");
        Ok(())
    }

    async fn duplicate_groups(&self, issue_id: Uuid) -> Result<Vec<DuplicateGroup>> {
        let rows = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT id, issue_id, topic_signature, method, canonical, members
            FROM duplicate_groups WHERE issue_id = $1 ORDER BY created_at, id
            "#,
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DuplicateGroup::try_from).collect()
    }

    async fn active_modules(&self) -> Result<Vec<Module>> {
        let rows = sqlx::query_as::<_, ModuleRow>(
            "SELECT * FROM modules WHERE active ORDER BY display_order, name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Module::try_from).collect()
    }

    async fn module_by_slug(&self, slug: &str) -> Result<Option<Module>> {
        let row = sqlx::query_as::<_, ModuleRow>("SELECT * FROM modules WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Module::try_from).transpose()
    }

    async fn assets_for_module(&self, module_id: Uuid) -> Result<Vec<Asset>> {
        let rows = sqlx::query_as::<_, AssetRow>(
            "SELECT * FROM assets WHERE module_id = $1 AND active ORDER BY priority DESC, name",
        )
        .bind(module_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Asset::try_from).collect()
    }

    async fn pin_overrides(&self, issue_id: Uuid, module_id: Uuid) -> Result<PinOverrides> {
        let rows = sqlx::query_as::<_, (Uuid, Option<i32>)>(
            "SELECT asset_id, position FROM pin_overrides WHERE issue_id = $1 AND module_id = $2",
        )
        .bind(issue_id)
        .bind(module_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(asset_id, position)| {
                Ok((asset_id, position.map(|p| to_usize(p, "position")).transpose()?))
            })
            .collect()
    }

    async fn mark_assets_used(&self, asset_ids: &[Uuid], on: NaiveDate) -> Result<()> {
        if asset_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE assets SET last_used_on = $2 WHERE id = ANY($1)")
            .bind(asset_ids)
            .bind(on)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn articles_for_issue(&self, issue_id: Uuid) -> Result<Vec<GeneratedArticle>> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            "SELECT * FROM generated_articles WHERE issue_id = $1 ORDER BY created_at, id",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(GeneratedArticle::try_from).collect()
    }

    async fn upsert_article(&self, a: &GeneratedArticle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO generated_articles
                (id, issue_id, module_id, candidate_id, category, source_score, headline,
                 body, word_count, rank, final_position, active, suppressed, fact_check,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now())
            ON CONFLICT (issue_id, module_id, candidate_id) DO UPDATE SET
                category = EXCLUDED.category,
                source_score = EXCLUDED.source_score,
                headline = EXCLUDED.headline,
                body = EXCLUDED.body,
                word_count = EXCLUDED.word_count,
                rank = EXCLUDED.rank,
                final_position = EXCLUDED.final_position,
                active = EXCLUDED.active,
                suppressed = EXCLUDED.suppressed,
                fact_check = EXCLUDED.fact_check,
                updated_at = now()
            "#,
        )
        .bind(a.id)
        .bind(a.issue_id)
        .bind(a.module_id)
        .bind(a.candidate_id)
        .bind(&a.category)
        .bind(a.source_score)
        .bind(&a.headline)
        .bind(&a.body)
        .bind(u32_to_i32(a.word_count, "word_count")?)
        .bind(a.rank.map(|v| u32_to_i32(v, "rank")).transpose()?)
        .bind(a.final_position.map(|v| u32_to_i32(v, "final_position")).transpose()?)
        .bind(a.active)
        .bind(a.suppressed)
        .bind(a.fact_check.as_ref().map(Json))
        .bind(a.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_allocation(
        &self,
        issue_id: Uuid,
        module_id: Uuid,
    ) -> Result<Option<ModuleAllocation>> {
        let row = sqlx::query_as::<_, AllocationRow>(
            "SELECT * FROM module_allocations WHERE issue_id = $1 AND module_id = $2",
        )
        .bind(issue_id)
        .bind(module_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(ModuleAllocation {
                issue_id: r.issue_id,
                module_id: r.module_id,
                selection_mode: SelectionMode::parse(&r.selection_mode).ok_or_else(|| {
                    StoreError::Corrupt(format!("selection mode '{}'", r.selection_mode))
                })?,
                slots: r.slots.0,
                awaiting_selection: r.awaiting_selection,
                manually_edited: r.manually_edited,
                updated_at: r.updated_at,
            })
        })
        .transpose()
    }

    async fn upsert_allocation(&self, allocation: &ModuleAllocation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO module_allocations
                (issue_id, module_id, selection_mode, slots, awaiting_selection,
                 manually_edited, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (issue_id, module_id) DO UPDATE SET
                selection_mode = EXCLUDED.selection_mode,
                slots = EXCLUDED.slots,
                awaiting_selection = EXCLUDED.awaiting_selection,
                manually_edited = EXCLUDED.manually_edited,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(allocation.issue_id)
        .bind(allocation.module_id)
        .bind(allocation.selection_mode.as_str())
        .bind(Json(&allocation.slots))
        .bind(allocation.awaiting_selection)
        .bind(allocation.manually_edited)
        .bind(allocation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn manual_actions(&self, issue_id: Uuid) -> Result<Vec<ManualAction>> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM manual_actions WHERE issue_id = $1 ORDER BY created_at, id",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ManualAction {
                id: r.id,
                issue_id: r.issue_id,
                module_id: r.module_id,
                kind: r.action.0,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn add_manual_action(&self, action: &ManualAction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_actions (id, issue_id, module_id, action, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(action.id)
        .bind(action.issue_id)
        .bind(action.module_id)
        .bind(Json(&action.kind))
        .bind(action.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, issue_id, started_at, finished_at, success, steps)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id) DO UPDATE SET
                finished_at = EXCLUDED.finished_at,
                success = EXCLUDED.success,
                steps = EXCLUDED.steps
            "#,
        )
        .bind(run.run_id)
        .bind(run.issue_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.success)
        .bind(Json(&run.steps))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_issue(&self, issue_id: Uuid) -> Result<ResetStats> {
        let mut tx = self.pool.begin().await?;

        let status = sqlx::query_scalar::<_, String>("SELECT status FROM issues WHERE id = $1 FOR UPDATE")
            .bind(issue_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("issue", issue_id))?;
        if parse_status(&status)? == IssueStatus::Sent {
            return Err(StoreError::Conflict(format!("issue {issue_id} was already sent")));
        }

        let mut stats = ResetStats::default();
        stats.scores_deleted = sqlx::query("DELETE FROM score_records WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        stats.groups_deleted = sqlx::query("DELETE FROM duplicate_groups WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        stats.articles_deleted = sqlx::query("DELETE FROM generated_articles WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        stats.allocations_deleted =
            sqlx::query("DELETE FROM module_allocations WHERE issue_id = $1")
                .bind(issue_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        sqlx::query("DELETE FROM manual_actions WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;
        stats.candidates_released = sqlx::query(
            r#"
            UPDATE candidates
            SET issue_id = NULL, total_score = NULL, suppressed = false, duplicate_group_id = NULL
            WHERE issue_id = $1
            "#,
        )
        .bind(issue_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(
            r#"
            UPDATE issues
            SET status = 'processing', title = NULL, last_failed_step = NULL,
                last_error = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(issue_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(%issue_id, ?stats, "Issue reset");
        Ok(stats)
    }
}
