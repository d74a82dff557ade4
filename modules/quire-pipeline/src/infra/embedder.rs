use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::traits::TextEmbedder;

const VOYAGE_API_URL: &str = "https://api.voyageai.com/v1";
const VOYAGE_MODEL: &str = "voyage-3-large";

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Voyage AI embeddings via the OpenAI-compatible API.
pub struct Embedder {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl Embedder {
    pub fn new(voyage_api_key: &str) -> Self {
        Self {
            api_key: voyage_api_key.to_string(),
            model: VOYAGE_MODEL.to_string(),
            base_url: VOYAGE_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl TextEmbedder for Embedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        debug!(model = %self.model, count = texts.len(), "Embedding batch request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: &texts,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(anyhow!("Voyage embedding error ({status}): {error_text}"));
        }

        let mut data = response.json::<EmbeddingResponse>().await?.data;
        if data.len() != texts.len() {
            return Err(anyhow!(
                "Voyage returned {} embeddings for {} texts",
                data.len(),
                texts.len()
            ));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}
