//! Text fingerprints shared by ingestion and deduplication.
//!
//! Everything here is pure and deterministic: the same input always yields
//! the same hash, normalized title, or similarity.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static NON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let lower = text.to_lowercase();
    let stripped = NON_WORD_RE.replace_all(&lower, " ");
    WHITESPACE_RE.replace_all(stripped.trim(), " ").into_owned()
}

/// Normalized form used for title comparison and topic signatures.
pub fn normalize_title(title: &str) -> String {
    normalize_text(title)
}

/// SHA-256 over the normalized text of an item. Prefers the extracted full
/// text, then the description, then the title.
pub fn content_hash(full_text: Option<&str>, description: &str, title: &str) -> String {
    let source = [full_text.unwrap_or_default(), description, title]
        .into_iter()
        .find(|s| !s.trim().is_empty())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(source).as_bytes());
    hex::encode(hasher.finalize())
}

/// Sørensen–Dice bigram similarity of two normalized titles, 0.0–1.0.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::sorensen_dice(&a, &b)
}

/// Cosine similarity between two vectors. Returns 0.0 for zero-norm or
/// mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

const TRACKING_PARAMS: &[&str] = &[
    "fbclid",
    "gclid",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "ref",
    "mc_cid",
    "mc_eid",
];

/// Canonical form of a source URL for identity comparison: tracking
/// parameters, fragment, `www.` and trailing slash removed, host lowercased.
/// Unparseable input is returned trimmed and lowercased.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw.trim()) else {
        return raw.trim().to_lowercase();
    };

    parsed.set_fragment(None);
    if parsed.query().is_some() {
        let clean_pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if clean_pairs.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(clean_pairs);
        }
    }

    let host = parsed
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_lowercase())
        .unwrap_or_default();
    let path = parsed.path().trim_end_matches('/');
    match parsed.query() {
        Some(query) => format!("{host}{path}?{query}"),
        None => format!("{host}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_strips_punctuation_and_case() {
        assert_eq!(normalize_text("  Rust 2.0: Released!  "), "rust 2 0 released");
    }

    #[test]
    fn content_hash_ignores_formatting_noise() {
        let a = content_hash(Some("The quick, brown fox."), "", "");
        let b = content_hash(Some("the QUICK brown   fox"), "", "");
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_falls_back_to_description_then_title() {
        let from_description = content_hash(None, "Same words", "Other");
        assert_eq!(from_description, content_hash(Some("  "), "same words", "x"));
        let from_title = content_hash(None, "", "Only a title");
        assert_eq!(from_title, content_hash(None, " ", "only a title"));
    }

    #[test]
    fn different_text_hashes_differently() {
        assert_ne!(content_hash(Some("alpha"), "", ""), content_hash(Some("beta"), "", ""));
    }

    #[test]
    fn identical_titles_are_fully_similar() {
        assert!((title_similarity("OpenAI ships a model", "openai ships a model!") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn near_duplicate_titles_score_high() {
        let sim = title_similarity(
            "Apple announces new MacBook Pro with M5 chip",
            "Apple announces the new MacBook Pro with M5 chips",
        );
        assert!(sim >= 0.85, "got {sim}");
    }

    #[test]
    fn unrelated_titles_score_low() {
        let sim = title_similarity("Rust 1.90 released", "Local bakery wins award");
        assert!(sim < 0.5, "got {sim}");
    }

    #[test]
    fn empty_title_never_matches() {
        assert_eq!(title_similarity("", "anything"), 0.0);
    }

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn normalize_url_strips_tracking_and_www() {
        assert_eq!(
            normalize_url("https://www.Example.com/post/1/?utm_source=x&id=7#top"),
            "example.com/post/1?id=7"
        );
    }

    #[test]
    fn normalize_url_treats_scheme_and_slash_as_noise() {
        assert_eq!(
            normalize_url("http://example.com/a/"),
            normalize_url("https://example.com/a")
        );
    }

    #[test]
    fn normalize_url_passes_through_garbage() {
        assert_eq!(normalize_url("  Not A Url "), "not a url");
    }
}
