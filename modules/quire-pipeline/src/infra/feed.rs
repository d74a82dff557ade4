// RSS/Atom feed source for ingestion.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use quire_common::types::{HarvestedItem, Issue};

use crate::traits::CandidateSource;

const FEED_MAX_ITEMS: usize = 50;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("Invalid tag regex"));
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("Invalid space regex"));

fn strip_html(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    SPACE_RE.replace_all(text.trim(), " ").into_owned()
}

/// Feed host, used as the source id of every item it yields.
fn source_name(feed_url: &str) -> String {
    url::Url::parse(feed_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| feed_url.to_string())
}

/// Parse a feed body into harvested items, newest first.
pub fn parse_feed(bytes: &[u8], source_id: &str) -> Result<Vec<HarvestedItem>> {
    let feed = feed_rs::parser::parse(bytes).context("Failed to parse RSS/Atom feed")?;

    let mut items: Vec<HarvestedItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;
            let title = entry.title.map(|t| strip_html(&t.content))?;
            let description = entry
                .summary
                .map(|s| strip_html(&s.content))
                .unwrap_or_default();
            let full_text = entry
                .content
                .and_then(|c| c.body)
                .map(|body| strip_html(&body))
                .filter(|t| !t.is_empty());

            Some(HarvestedItem {
                source_id: source_id.to_string(),
                source_url: url,
                title,
                description,
                full_text,
                category: entry.categories.first().map(|c| c.term.to_lowercase()),
                published_at: entry.published.or(entry.updated),
            })
        })
        .collect();

    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    items.truncate(FEED_MAX_ITEMS);
    Ok(items)
}

pub struct FeedSource {
    feed_url: String,
    name: String,
    client: reqwest::Client,
}

impl FeedSource {
    pub fn new(feed_url: impl Into<String>) -> Result<Self> {
        let feed_url = feed_url.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build feed HTTP client")?;
        Ok(Self {
            name: source_name(&feed_url),
            feed_url,
            client,
        })
    }
}

#[async_trait]
impl CandidateSource for FeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn harvest(&self, _issue: &Issue) -> Result<Vec<HarvestedItem>> {
        let resp = self
            .client
            .get(&self.feed_url)
            .header("User-Agent", "quire/0.1")
            .send()
            .await
            .context("Feed fetch failed")?
            .error_for_status()
            .context("Feed returned an error status")?;
        let bytes = resp.bytes().await.context("Failed to read feed body")?;

        let items = parse_feed(&bytes, &self.name)?;
        info!(feed_url = self.feed_url.as_str(), items = items.len(), "Feed parsed");
        Ok(items)
    }
}
