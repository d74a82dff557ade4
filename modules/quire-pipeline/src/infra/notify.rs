use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use quire_common::types::{StepFailure, StepStatus};

use crate::orchestrator::PipelineReport;
use crate::traits::Notifier;

/// Notifier that drops every message. The default when no webhook is set.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn pipeline_succeeded(&self, _report: &PipelineReport) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pipeline_failed(
        &self,
        _report: &PipelineReport,
        _failure: &StepFailure,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Slack incoming webhook notifier.
pub struct SlackNotifier {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, text: String) -> anyhow::Result<()> {
        let payload = json!({
            "text": text,
            "unfurl_links": false,
        });
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook returned non-success");
            anyhow::bail!("Slack webhook returned {status}");
        }
        Ok(())
    }
}

fn step_lines(report: &PipelineReport) -> Vec<String> {
    report
        .results
        .iter()
        .map(|r| {
            let mark = match r.status {
                StepStatus::Success => ":white_check_mark:",
                StepStatus::Failed => ":x:",
                StepStatus::Cancelled => ":no_entry_sign:",
            };
            format!("{mark} `{}` ({} attempts)", r.step_name, r.attempts)
        })
        .collect()
}

pub(crate) fn success_text(report: &PipelineReport) -> String {
    let mut lines = vec![format!(
        ":newspaper: *Issue `{}` ready for review*",
        report.issue_id
    )];
    lines.extend(step_lines(report));
    lines.join("\n")
}

pub(crate) fn failure_text(report: &PipelineReport, failure: &StepFailure) -> String {
    let mut lines = vec![
        format!(":rotating_light: *Issue `{}` pipeline failed*", report.issue_id),
        format!("*Step:* `{}`", failure.step),
        format!("*Error:* {}", failure.error),
        format!("_Run {}_", report.run_id),
    ];
    lines.extend(step_lines(report));
    lines.join("\n")
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn pipeline_succeeded(&self, report: &PipelineReport) -> anyhow::Result<()> {
        self.post(success_text(report)).await
    }

    async fn pipeline_failed(
        &self,
        report: &PipelineReport,
        failure: &StepFailure,
    ) -> anyhow::Result<()> {
        self.post(failure_text(report, failure)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_common::types::StepResult;
    use uuid::Uuid;

    #[test]
    fn failure_text_names_step_and_error() {
        let report = PipelineReport {
            run_id: Uuid::new_v4(),
            issue_id: Uuid::new_v4(),
            success: false,
            results: vec![StepResult {
                step_name: "score".into(),
                status: StepStatus::Failed,
                attempts: 3,
                data: None,
                error: Some("timeout".into()),
            }],
        };
        let failure = report.failure().unwrap();
        let text = failure_text(&report, &failure);
        assert!(text.contains("`score`"));
        assert!(text.contains("timeout"));
        assert!(text.contains("(3 attempts)"));
    }
}
