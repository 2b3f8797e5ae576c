// src/feed/mod.rs
//! Collaborator ports (candidate source, executor, composer) and the
//! per-batch candidate hygiene pass that runs before scoring.

pub mod fixture;
pub mod types;

pub use types::{
    AttemptContext, CandidatePost, CandidateSource, CommentComposer, EngagementExecutor,
    EngagementIntent, EngagementOutcome,
};

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::error::EngineError;

/// Texts longer than this are truncated before scoring.
pub const MAX_TEXT_CHARS: usize = 3000;

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Collapse whitespace, trim, cap length.
pub fn normalize_text(s: &str) -> String {
    let out = RE_WS.replace_all(s, " ");
    let out = out.trim();
    if out.chars().count() > MAX_TEXT_CHARS {
        out.chars().take(MAX_TEXT_CHARS).collect()
    } else {
        out.to_string()
    }
}

/// Lowercase, strip `#`, drop empties and duplicates (first occurrence wins).
pub fn normalize_hashtags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|t| t.trim().trim_start_matches('#').to_lowercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Outcome of the hygiene pass over one batch.
#[derive(Debug, Default)]
pub struct BatchSplit {
    pub valid: Vec<CandidatePost>,
    pub rejected: Vec<(CandidatePost, EngineError)>,
    pub duplicates: usize,
}

/// Normalize and validate a batch. A malformed candidate is rejected on its
/// own; it never aborts the rest of the batch.
pub fn split_batch(raw: Vec<CandidatePost>) -> BatchSplit {
    let mut split = BatchSplit::default();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for mut post in raw {
        post.text = normalize_text(&post.text);
        post.platform_id = post.platform_id.trim().to_string();
        post.source_platform = post.source_platform.trim().to_ascii_lowercase();
        post.hashtags = normalize_hashtags(&post.hashtags);

        if let Err(e) = validate(&post) {
            split.rejected.push((post, e));
            continue;
        }
        let key = (post.source_platform.clone(), post.platform_id.clone());
        if !seen.insert(key) {
            split.duplicates += 1;
            continue;
        }
        split.valid.push(post);
    }
    split
}

fn validate(post: &CandidatePost) -> Result<(), EngineError> {
    if post.platform_id.is_empty() {
        return Err(EngineError::Parse("candidate without platform id".into()));
    }
    if post.source_platform.is_empty() {
        return Err(EngineError::Parse(format!(
            "candidate {} without source platform",
            post.platform_id
        )));
    }
    if post.text.is_empty() {
        return Err(EngineError::Parse(format!(
            "candidate {} has no text",
            post.platform_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_ws() {
        assert_eq!(normalize_text("  Hello,\n\n  world!  "), "Hello, world!");
    }

    #[test]
    fn hashtags_are_cleaned() {
        let tags = vec!["#Rust".into(), "rust".into(), " ".into(), "#AI".into()];
        assert_eq!(normalize_hashtags(&tags), vec!["rust", "ai"]);
    }

    #[test]
    fn malformed_candidates_are_isolated() {
        let raw = vec![
            CandidatePost::new("p1", "LinkedIn", "A", "first post"),
            CandidatePost::new("", "linkedin", "B", "no id"),
            CandidatePost::new("p2", "linkedin", "C", "   "),
            CandidatePost::new("p3", "linkedin", "D", "third post"),
            CandidatePost::new("p1", "linkedin", "A", "first post again"),
        ];
        let split = split_batch(raw);
        let ids: Vec<_> = split.valid.iter().map(|p| p.platform_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        assert_eq!(split.rejected.len(), 2);
        assert_eq!(split.duplicates, 1);
        assert_eq!(split.valid[0].source_platform, "linkedin");
    }
}
