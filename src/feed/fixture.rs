// src/feed/fixture.rs
//! Local collaborators for demos and tests: a JSON fixture source, a canned
//! comment composer and a dry-run executor that only logs intents.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use tracing::info;

use super::types::{
    AttemptContext, CandidatePost, CandidateSource, CommentComposer, EngagementExecutor,
    EngagementIntent, EngagementOutcome,
};
use crate::content_hash::{anon_id, content_hash};
use crate::relevance::RelevanceAnalysis;

/// Serves a fixed list of posts in pages, wrapping around at the end.
pub struct FixtureSource {
    posts: Vec<CandidatePost>,
    page_size: usize,
    cursor: Mutex<usize>,
}

impl FixtureSource {
    pub fn new(posts: Vec<CandidatePost>, page_size: usize) -> Self {
        Self {
            posts,
            page_size: page_size.max(1),
            cursor: Mutex::new(0),
        }
    }

    /// JSON array of candidate posts.
    pub fn from_json_str(s: &str, page_size: usize) -> Result<Self> {
        let posts: Vec<CandidatePost> = serde_json::from_str(s).context("parsing fixture posts")?;
        Ok(Self::new(posts, page_size))
    }

    pub fn from_path(path: &Path, page_size: usize) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading fixture posts from {}", path.display()))?;
        Self::from_json_str(&content, page_size)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}

#[async_trait]
impl CandidateSource for FixtureSource {
    async fn next_candidates(&self) -> Result<Vec<CandidatePost>> {
        if self.posts.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self.cursor.lock();
        let page = (0..self.page_size.min(self.posts.len()))
            .map(|i| self.posts[(*cursor + i) % self.posts.len()].clone())
            .collect();
        *cursor = (*cursor + self.page_size) % self.posts.len();
        Ok(page)
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

/// Picks one of a fixed set of replies, deterministically per post.
pub struct CannedComposer {
    replies: Vec<String>,
}

impl CannedComposer {
    pub fn new(replies: Vec<String>) -> Self {
        Self { replies }
    }
}

impl Default for CannedComposer {
    fn default() -> Self {
        Self::new(vec![
            "Great insights, thanks for sharing this.".into(),
            "Really useful perspective on this topic.".into(),
            "Appreciate the detailed write-up here.".into(),
        ])
    }
}

#[async_trait]
impl CommentComposer for CannedComposer {
    async fn compose(&self, post: &CandidatePost, _analysis: &RelevanceAnalysis) -> Result<String> {
        if self.replies.is_empty() {
            anyhow::bail!("composer has no replies configured");
        }
        let h = content_hash(&post.platform_id);
        let idx = usize::from_str_radix(&h[..4], 16).unwrap_or(0) % self.replies.len();
        Ok(self.replies[idx].clone())
    }
}

/// Logs the intent instead of performing it.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl EngagementExecutor for DryRunExecutor {
    async fn attempt_engagement(
        &self,
        intent: &EngagementIntent,
        ctx: &AttemptContext,
    ) -> Result<EngagementOutcome> {
        info!(
            target: "engine",
            platform = %intent.post.source_platform,
            post = %intent.post.platform_id,
            text_id = %anon_id(&intent.text),
            score = intent.relevance.score,
            attempt = ctx.attempt,
            "dry-run engagement"
        );
        Ok(EngagementOutcome::Posted { reference: None })
    }
}
