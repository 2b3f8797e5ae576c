// src/feed/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RecoveryHint;
use crate::relevance::RelevanceAnalysis;

/// An inbound content item the engine may act on. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidatePost {
    pub platform_id: String,     // post id on the source platform
    pub source_platform: String, // e.g. "linkedin", "x"
    pub author_label: String,
    pub text: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl CandidatePost {
    pub fn new(
        platform_id: impl Into<String>,
        source_platform: impl Into<String>,
        author_label: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            source_platform: source_platform.into(),
            author_label: author_label.into(),
            text: text.into(),
            hashtags: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn with_hashtags(mut self, hashtags: Vec<String>) -> Self {
        self.hashtags = hashtags;
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }
}

/// What the executor is asked to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementIntent {
    pub post: CandidatePost,
    pub text: String,
    pub relevance: RelevanceAnalysis,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngagementOutcome {
    Posted { reference: Option<String> },
    Skipped { reason: String },
}

/// Per-attempt context handed to collaborators inside a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptContext {
    /// 1-based.
    pub attempt: u32,
    pub timeout: Duration,
    /// Hint left by the previous failed attempt, if any.
    pub recovery: Option<RecoveryHint>,
}

impl AttemptContext {
    pub fn first(timeout: Duration) -> Self {
        Self {
            attempt: 1,
            timeout,
            recovery: None,
        }
    }

    /// The previous attempt could not locate the target; try the alternate locator.
    pub fn use_fallback_locator(&self) -> bool {
        self.recovery == Some(RecoveryHint::UseFallbackLocator)
    }
}

/// Pull-based candidate supply (scraper, API poller, fixture...).
#[async_trait::async_trait]
pub trait CandidateSource: Send + Sync {
    async fn next_candidates(&self) -> Result<Vec<CandidatePost>>;
    fn name(&self) -> &'static str;
}

/// Performs the engagement. Called only after suppression checks pass.
#[async_trait::async_trait]
pub trait EngagementExecutor: Send + Sync {
    async fn attempt_engagement(
        &self,
        intent: &EngagementIntent,
        ctx: &AttemptContext,
    ) -> Result<EngagementOutcome>;
}

/// Produces the comment text for a relevant post. Text generation lives outside the engine.
#[async_trait::async_trait]
pub trait CommentComposer: Send + Sync {
    async fn compose(&self, post: &CandidatePost, analysis: &RelevanceAnalysis) -> Result<String>;
}
