//! Stage orchestrator: runs the fixed step plan for one issue.
//!
//! `prepare` loads the issue and moves a failed issue back to processing,
//! `plan` builds the per-module steps, then every step runs sequentially
//! through the [`RetryPolicy`]. The first step that fails for good marks the
//! issue failed and ends the run. Notification and the run record are
//! best-effort.

pub mod retry;

use std::future::Future;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use quire_common::types::{
    Issue, IssueStatus, Module, RunRecord, StepFailure, StepResult, StepStatus,
};
use quire_common::{QuireError, Result};
use quire_store::ResetStats;

use crate::deps::PipelineDeps;
use crate::{allocation, dedup, finalize, generation, ingest, scoring};
pub use retry::{RetryOutcome, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub issue_id: Uuid,
    pub success: bool,
    pub results: Vec<StepResult>,
}

impl PipelineReport {
    /// The step that ended an unsuccessful run.
    pub fn failure(&self) -> Option<StepFailure> {
        self.results
            .iter()
            .find(|r| r.status != StepStatus::Success)
            .map(|r| StepFailure {
                step: r.step_name.clone(),
                error: r.error.clone().unwrap_or_default(),
            })
    }
}

/// One unit of the step plan.
#[derive(Debug, Clone)]
pub enum Step {
    Ingest,
    Score,
    Deduplicate,
    Titles(Module),
    Bodies(Module),
    FactCheck(Module),
    Allocate(Module),
    Finalize,
}

impl Step {
    pub fn name(&self) -> String {
        match self {
            Self::Ingest => "ingest".to_string(),
            Self::Score => "score".to_string(),
            Self::Deduplicate => "deduplicate".to_string(),
            Self::Titles(m) => format!("module:{}:titles", m.slug),
            Self::Bodies(m) => format!("module:{}:bodies", m.slug),
            Self::FactCheck(m) => format!("module:{}:fact_check", m.slug),
            Self::Allocate(m) => format!("module:{}:allocate", m.slug),
            Self::Finalize => "finalize".to_string(),
        }
    }
}

/// The step plan of one run. Only the names are reported.
#[derive(Debug, Clone, Serialize)]
struct PlannedRun {
    step_names: Vec<String>,
    #[serde(skip)]
    steps: Vec<Step>,
}

/// Fixed step plan for the given active modules, in display order.
pub fn build_plan(modules: &[Module]) -> Vec<Step> {
    let mut steps = vec![Step::Ingest, Step::Score, Step::Deduplicate];
    for module in modules {
        if module.kind.uses_generated_content() {
            steps.push(Step::Titles(module.clone()));
            steps.push(Step::Bodies(module.clone()));
            steps.push(Step::FactCheck(module.clone()));
        }
        steps.push(Step::Allocate(module.clone()));
    }
    steps.push(Step::Finalize);
    steps
}

fn to_data<T: Serialize>(summary: T) -> Result<serde_json::Value> {
    serde_json::to_value(summary).map_err(|e| QuireError::Anyhow(e.into()))
}

pub struct Orchestrator {
    deps: PipelineDeps,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(deps: PipelineDeps) -> Self {
        let retry = RetryPolicy::from_settings(&deps.settings);
        Self { deps, retry }
    }

    /// Run a step through the retry policy and record its result.
    async fn attempt<T, F, Fut>(
        &self,
        name: &str,
        results: &mut Vec<StepResult>,
        op: F,
    ) -> std::result::Result<T, QuireError>
    where
        T: Serialize + Clone,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let RetryOutcome { result, attempts } = self.retry.run(name, op).await;
        match result {
            Ok(value) => {
                results.push(StepResult {
                    step_name: name.to_string(),
                    status: StepStatus::Success,
                    attempts,
                    data: serde_json::to_value(value.clone()).ok(),
                    error: None,
                });
                Ok(value)
            }
            Err(e) => {
                error!(step = name, attempts, error = %e, "Step failed");
                results.push(StepResult {
                    step_name: name.to_string(),
                    status: StepStatus::Failed,
                    attempts,
                    data: None,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Load the issue and move it into `processing`. A `failed` issue is
    /// re-run; any state other than `processing` or `failed` is refused.
    async fn prepare(&self, issue_id: Uuid) -> Result<Issue> {
        let mut issue = self
            .deps
            .store
            .get_issue(issue_id)
            .await?
            .ok_or_else(|| QuireError::not_found("issue", issue_id))?;
        let next = issue.status.transition(IssueStatus::Processing)?;
        if next != issue.status {
            self.deps.store.set_issue_status(issue_id, next, None).await?;
            info!(%issue_id, from = %issue.status, "Re-running failed issue");
            issue.status = next;
            issue.last_failed_step = None;
            issue.last_error = None;
        }
        Ok(issue)
    }

    async fn plan(&self) -> Result<PlannedRun> {
        let modules = self.deps.store.active_modules().await?;
        if modules.is_empty() {
            return Err(QuireError::Fatal("no active modules configured".into()));
        }
        let steps = build_plan(&modules);
        Ok(PlannedRun {
            step_names: steps.iter().map(Step::name).collect(),
            steps,
        })
    }

    async fn execute(&self, step: &Step, issue: &Issue) -> Result<serde_json::Value> {
        let deps = &self.deps;
        match step {
            Step::Ingest => to_data(ingest::ingest(deps, issue).await?),
            Step::Score => to_data(scoring::score_issue(deps, issue).await?),
            Step::Deduplicate => to_data(dedup::deduplicate(deps, issue).await?),
            Step::Titles(m) => to_data(generation::generate_titles(deps, issue, m).await?),
            Step::Bodies(m) => to_data(generation::generate_bodies(deps, issue, m).await?),
            Step::FactCheck(m) => to_data(generation::fact_check(deps, issue, m).await?),
            Step::Allocate(m) => to_data(allocation::allocate(deps, issue, m).await?),
            Step::Finalize => to_data(finalize::finalize(deps, issue).await?),
        }
    }

    pub async fn run_pipeline(&self, issue_id: Uuid) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut results = Vec::new();
        info!(%run_id, %issue_id, "Pipeline run starting");

        let issue = match self.attempt("prepare", &mut results, |_| self.prepare(issue_id)).await {
            Ok(issue) => issue,
            Err(QuireError::NotFound { .. }) => {
                return PipelineReport {
                    run_id,
                    issue_id,
                    success: false,
                    results,
                };
            }
            Err(_) => {
                return self.complete(run_id, issue_id, started_at, false, results).await;
            }
        };

        let plan = match self.attempt("plan", &mut results, |_| self.plan()).await {
            Ok(plan) => plan,
            Err(e) => {
                self.mark_failed(issue.id, "plan", &e).await;
                return self.complete(run_id, issue_id, started_at, false, results).await;
            }
        };

        let mut success = true;
        for step in &plan.steps {
            let name = step.name();

            // Cancellation: an issue marked failed from outside halts the run.
            let current = match self.deps.store.get_issue(issue.id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    let e = QuireError::not_found("issue", issue.id);
                    results.push(failed_result(&name, 0, &e));
                    success = false;
                    break;
                }
                Err(e) => {
                    let e = QuireError::from(e);
                    results.push(failed_result(&name, 0, &e));
                    self.mark_failed(issue.id, &name, &e).await;
                    success = false;
                    break;
                }
            };
            if current.status == IssueStatus::Failed {
                warn!(%issue_id, step = name.as_str(), "Issue marked failed externally, cancelling run");
                results.push(StepResult {
                    step_name: name,
                    status: StepStatus::Cancelled,
                    attempts: 0,
                    data: None,
                    error: Some("issue marked failed".to_string()),
                });
                success = false;
                break;
            }

            info!(%issue_id, step = name.as_str(), "Step starting");
            let outcome = self
                .attempt(&name, &mut results, |_| self.execute(step, &current))
                .await;
            if let Err(e) = outcome {
                self.mark_failed(issue.id, &name, &e).await;
                success = false;
                break;
            }
        }

        self.complete(run_id, issue_id, started_at, success, results).await
    }

    async fn mark_failed(&self, issue_id: Uuid, step: &str, err: &QuireError) {
        let failure = StepFailure {
            step: step.to_string(),
            error: err.to_string(),
        };
        if let Err(e) = self
            .deps
            .store
            .set_issue_status(issue_id, IssueStatus::Failed, Some(&failure))
            .await
        {
            error!(%issue_id, step, error = %e, "Failed to mark issue failed");
        }
    }

    /// Notify and persist the run record. Neither may fail the run.
    async fn complete(
        &self,
        run_id: Uuid,
        issue_id: Uuid,
        started_at: chrono::DateTime<Utc>,
        success: bool,
        results: Vec<StepResult>,
    ) -> PipelineReport {
        let report = PipelineReport {
            run_id,
            issue_id,
            success,
            results,
        };

        let notified = match report.failure() {
            Some(failure) if !success => self.deps.notifier.pipeline_failed(&report, &failure).await,
            _ => self.deps.notifier.pipeline_succeeded(&report).await,
        };
        if let Err(e) = notified {
            warn!(%run_id, error = %e, "Failed to send pipeline notification");
        }

        let record = RunRecord {
            run_id,
            issue_id,
            started_at,
            finished_at: Utc::now(),
            success,
            steps: report.results.clone(),
        };
        if let Err(e) = self.deps.store.record_run(&record).await {
            warn!(%run_id, error = %e, "Failed to persist run record");
        }

        info!(
            %run_id,
            %issue_id,
            success,
            steps = report.results.len(),
            "Pipeline run finished"
        );
        report
    }

    /// Drop derived state and put the issue back into `processing`.
    pub async fn reset_issue(&self, issue_id: Uuid) -> Result<ResetStats> {
        let stats = self.deps.store.reset_issue(issue_id).await?;
        info!(
            %issue_id,
            released = stats.candidates_released,
            articles = stats.articles_deleted,
            "Issue reset"
        );
        Ok(stats)
    }
}

fn failed_result(name: &str, attempts: u32, err: &QuireError) -> StepResult {
    StepResult {
        step_name: name.to_string(),
        status: StepStatus::Failed,
        attempts,
        data: None,
        error: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{article_module, asset_module};
    use quire_common::types::SelectionMode;

    #[test]
    fn plan_orders_module_steps_in_display_order() {
        let news = article_module("news", 3);
        let sponsors = asset_module("sponsors", 2, SelectionMode::AffiliatePriority);
        let names: Vec<String> = build_plan(&[news, sponsors]).iter().map(Step::name).collect();
        assert_eq!(
            names,
            vec![
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
    }

    #[test]
    fn report_failure_names_first_unsuccessful_step() {
        let report = PipelineReport {
            run_id: Uuid::new_v4(),
            issue_id: Uuid::new_v4(),
            success: false,
            results: vec![
                StepResult {
                    step_name: "ingest".into(),
                    status: StepStatus::Success,
                    attempts: 1,
                    data: None,
                    error: None,
                },
                failed_result("score", 3, &QuireError::Transient("timeout".into())),
            ],
        };
        let failure = report.failure().unwrap();
        assert_eq!(failure.step, "score");
        assert!(failure.error.contains("timeout"));
    }
}
