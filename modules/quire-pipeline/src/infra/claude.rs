// Claude adapters for scoring and content generation.
//
// Every call uses forced tool use: the response schema is derived from the
// output type with schemars and Claude must answer through a single
// `structured_response` tool.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use quire_common::types::{Candidate, CriterionConfig, CriterionScore, FactCheck, GeneratedArticle};

use crate::traits::{BodyRequest, ContentEvaluator, ContentWriter};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const TOOL_NAME: &str = "structured_response";

/// Source text is cut to this many characters before it is sent.
const MAX_SOURCE_CHARS: usize = 12_000;

// --- Wire types ---

#[derive(Debug, Clone, Serialize)]
struct ToolDefinition {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    tools: Vec<ToolDefinition>,
    tool_choice: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[allow(dead_code)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
}

/// JSON schema for a structured output type, fully inlined.
pub(crate) fn tool_schema<T: JsonSchema>() -> serde_json::Value {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_default();
    if let serde_json::Value::Object(map) = &mut value {
        map.remove("definitions");
        map.remove("$schema");
    }
    value
}

// --- Client ---

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Ask Claude for a `T`, forcing the answer through the response tool.
    pub async fn extract<T: JsonSchema + DeserializeOwned>(
        &self,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<T> {
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: 4096,
            system: system_prompt.into(),
            messages: vec![WireMessage {
                role: "user",
                content: user_prompt.into(),
            }],
            temperature: 0.0,
            tools: vec![ToolDefinition {
                name: TOOL_NAME.to_string(),
                description: "Return the structured result.".to_string(),
                input_schema: tool_schema::<T>(),
            }],
            tool_choice: serde_json::json!({ "type": "tool", "name": TOOL_NAME }),
        };

        let url = format!("{}/messages", self.base_url);
        debug!(model = %self.model, "Claude structured request");
        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(anyhow!("Claude API error ({status}): {error_text}"));
        }
        let response: ChatResponse = response.json().await?;

        response
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::ToolUse { name, input } if name == TOOL_NAME => Some(input),
                _ => None,
            })
            .ok_or_else(|| anyhow!("No structured output in Claude response"))
            .and_then(|input| {
                serde_json::from_value(input)
                    .map_err(|e| anyhow!("Failed to deserialize response: {e}"))
            })
    }
}

fn source_excerpt(text: &str) -> String {
    text.chars().take(MAX_SOURCE_CHARS).collect()
}

// --- Evaluator ---

#[derive(Debug, Deserialize, JsonSchema)]
struct CriterionScores {
    /// One entry per criterion listed in the prompt
    scores: Vec<CriterionScore>,
}

pub struct ClaudeEvaluator {
    claude: Claude,
}

impl ClaudeEvaluator {
    pub fn new(claude: Claude) -> Self {
        Self { claude }
    }
}

#[async_trait]
impl ContentEvaluator for ClaudeEvaluator {
    async fn evaluate(
        &self,
        candidate: &Candidate,
        criteria: &[CriterionConfig],
    ) -> Result<Vec<CriterionScore>> {
        let criteria_list = criteria
            .iter()
            .map(|c| format!("- {}", c.name))
            .collect::<Vec<_>>()
            .join("\n");
        let system = "You rate news items for a daily newsletter. Score every listed \
                      criterion from 1 (irrelevant) to 10 (essential) and use the \
                      criterion names exactly as given.";
        let user = format!(
            "Criteria:\n{criteria_list}\n\nTitle: {}\nSource: {}\n\n{}",
            candidate.title,
            candidate.source_url,
            source_excerpt(candidate.body_text()),
        );
        let scores: CriterionScores = self.claude.extract(system, user).await?;
        Ok(scores.scores)
    }
}

// --- Writer ---

#[derive(Debug, Deserialize, JsonSchema)]
struct HeadlineResponse {
    /// A single headline, no quotes, no trailing punctuation
    headline: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ArticleBody {
    /// Zero-based index of the article in the request
    index: usize,
    /// Article body in plain prose
    body: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BodyBatchResponse {
    bodies: Vec<ArticleBody>,
}

pub struct ClaudeWriter {
    claude: Claude,
    headline_max_chars: usize,
}

impl ClaudeWriter {
    pub fn new(claude: Claude, headline_max_chars: usize) -> Self {
        Self {
            claude,
            headline_max_chars,
        }
    }
}

/// Bodies in request order. Missing or duplicate indices fail the batch.
fn order_bodies(mut bodies: Vec<ArticleBody>, expected: usize) -> Result<Vec<String>> {
    bodies.sort_by_key(|b| b.index);
    bodies.dedup_by_key(|b| b.index);
    if bodies.len() != expected || bodies.iter().enumerate().any(|(i, b)| b.index != i) {
        return Err(anyhow!(
            "body batch returned indices {:?}, expected 0..{expected}",
            bodies.iter().map(|b| b.index).collect::<Vec<_>>()
        ));
    }
    Ok(bodies.into_iter().map(|b| b.body).collect())
}

#[async_trait]
impl ContentWriter for ClaudeWriter {
    async fn headline(&self, candidate: &Candidate) -> Result<String> {
        let system = format!(
            "You write newsletter headlines. Keep them factual and under {} characters.",
            self.headline_max_chars
        );
        let user = format!(
            "Original title: {}\n\n{}",
            candidate.title,
            source_excerpt(candidate.body_text())
        );
        let response: HeadlineResponse = self.claude.extract(system, user).await?;
        Ok(response.headline)
    }

    async fn bodies(&self, batch: &[BodyRequest]) -> Result<Vec<String>> {
        let system = "You write short newsletter articles (120-200 words) grounded only \
                      in the provided source text. Return one body per article index.";
        let user = batch
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "## Article {i}\nHeadline: {}\nSource title: {}\nSource text:\n{}",
                    r.headline,
                    r.source_title,
                    source_excerpt(&r.source_text)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let response: BodyBatchResponse = self.claude.extract(system, user).await?;
        order_bodies(response.bodies, batch.len())
    }

    async fn fact_check(&self, article: &GeneratedArticle, source: &Candidate) -> Result<FactCheck> {
        let system = "You fact-check newsletter articles against their source. For each \
                      factual claim award up to 3 points: 3 stated in the source, 1 \
                      plausible but unstated, 0 contradicted. Report the totals.";
        let user = format!(
            "Headline: {}\n\nArticle:\n{}\n\nSource:\n{}",
            article.headline,
            article.body.as_deref().unwrap_or_default(),
            source_excerpt(source.body_text())
        );
        self.claude.extract(system, user).await
    }
}
