// src/ledger.rs
//! Suppression ledger: the append-only history of past engagements and the
//! three cooldown tiers evaluated against it.
//!
//! Records are kept newest-first. Every mutation (append, import, compaction)
//! runs under one async mutex and is written back to the store before the
//! lock is released, so concurrent callers cannot lose each other's updates.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, saturating_add, saturating_sub};
use crate::content_hash::{anon_id, content_hash};
use crate::error::EngineError;
use crate::similarity::SimilarityEngine;
use crate::store::KvStore;

pub const LEDGER_STORE_KEY: &str = "engagement_ledger";

/// Upper bound for any cooldown window.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;
/// Upper bound for `retention_days`.
pub const MAX_RETENTION_DAYS: u32 = 3650;

/// Cooldown windows, similarity threshold and retention bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
    pub same_post_window_secs: u64,
    pub similar_window_secs: u64,
    pub platform_window_secs: u64,
    pub similarity_threshold: f64,
    pub max_records: usize,
    pub cleanup_threshold: usize,
    pub retention_days: u32,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            same_post_window_secs: 60 * 60,
            similar_window_secs: 30 * 60,
            platform_window_secs: 5 * 60,
            similarity_threshold: 0.8,
            max_records: 1000,
            cleanup_threshold: 1200,
            retention_days: 30,
        }
    }
}

impl SuppressionConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_records == 0 {
            return Err(EngineError::Config("suppression.max_records must be > 0".into()));
        }
        if self.cleanup_threshold < self.max_records {
            return Err(EngineError::Config(
                "suppression.cleanup_threshold must be >= max_records".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(EngineError::Config(
                "suppression.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.retention_days == 0 || self.retention_days > MAX_RETENTION_DAYS {
            return Err(EngineError::Config(format!(
                "suppression.retention_days must be within 1..={MAX_RETENTION_DAYS}"
            )));
        }
        for (name, secs) in [
            ("same_post_window_secs", self.same_post_window_secs),
            ("similar_window_secs", self.similar_window_secs),
            ("platform_window_secs", self.platform_window_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(EngineError::Config(format!(
                    "suppression.{name} must be <= {MAX_WINDOW_SECS}"
                )));
            }
        }
        Ok(())
    }

    fn retention(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.retention_days))
    }
}

/// One past engagement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementRecord {
    pub id: String,
    pub platform_id: String,
    pub platform: String,
    pub text: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub word_count: usize,
    pub char_count: usize,
}

impl EngagementRecord {
    pub fn new(text: &str, platform_id: &str, platform: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform_id: platform_id.to_string(),
            platform: platform.to_string(),
            text: text.to_string(),
            content_hash: content_hash(text),
            created_at: now,
            word_count: text.split_whitespace().count(),
            char_count: text.chars().count(),
        }
    }
}

/// Why an engagement was withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuppressionReason {
    /// Already engaged with this post recently.
    SamePost { remaining_secs: u64 },
    /// Exact (normalized) duplicate of a recent comment on this platform.
    DuplicateContent { remaining_secs: u64 },
    /// Too similar to a recent comment on this platform.
    SimilarContent { similarity: f64, remaining_secs: u64 },
    /// Platform-wide pacing limit.
    PlatformCooldown { remaining_secs: u64 },
}

impl SuppressionReason {
    pub fn kind(&self) -> &'static str {
        match self {
            SuppressionReason::SamePost { .. } => "same_post",
            SuppressionReason::DuplicateContent { .. } => "duplicate_content",
            SuppressionReason::SimilarContent { .. } => "similar_content",
            SuppressionReason::PlatformCooldown { .. } => "platform_cooldown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuppressionCheck {
    pub suppress: bool,
    pub reason: Option<SuppressionReason>,
}

impl SuppressionCheck {
    fn allow() -> Self {
        Self {
            suppress: false,
            reason: None,
        }
    }

    fn block(reason: SuppressionReason) -> Self {
        Self {
            suppress: true,
            reason: Some(reason),
        }
    }
}

/// Remaining cooldown for a record seen at `last`, or `None` once the window has passed.
pub fn cooldown_remaining(
    now: DateTime<Utc>,
    last: DateTime<Utc>,
    window: Duration,
) -> Option<Duration> {
    let ends = saturating_add(last, window);
    if ends > now {
        Some(elapsed_between(now, ends))
    } else {
        None
    }
}

/// Drop records past retention, then keep the newest `max_records`.
/// Records must be newest-first; survivors keep their order. Returns the
/// number of records removed.
pub fn compact_records(
    records: &mut Vec<EngagementRecord>,
    now: DateTime<Utc>,
    max_records: usize,
    retention: ChronoDuration,
) -> usize {
    let before = records.len();
    let horizon = saturating_sub(now, retention);
    records.retain(|r| r.created_at >= horizon);
    records.truncate(max_records);
    before - records.len()
}

#[derive(Debug, Default)]
struct LedgerState {
    loaded: bool,
    records: Vec<EngagementRecord>,
}

pub struct SuppressionLedger {
    store: Arc<dyn KvStore>,
    similarity: RwLock<SimilarityEngine>,
    cfg: RwLock<SuppressionConfig>,
    state: Mutex<LedgerState>,
}

impl SuppressionLedger {
    pub fn new(
        store: Arc<dyn KvStore>,
        cfg: SuppressionConfig,
        similarity: SimilarityEngine,
    ) -> Self {
        Self {
            store,
            similarity: RwLock::new(similarity),
            cfg: RwLock::new(cfg),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> SuppressionConfig {
        self.cfg.read().clone()
    }

    /// Applies to the next check or compaction; stored records are untouched.
    pub fn update_config(&self, cfg: SuppressionConfig, similarity: SimilarityEngine) {
        *self.cfg.write() = cfg;
        *self.similarity.write() = similarity;
    }

    async fn ensure_loaded(&self, state: &mut LedgerState) -> Result<(), EngineError> {
        if state.loaded {
            return Ok(());
        }
        let value = match self.store.get(LEDGER_STORE_KEY).await {
            Ok(value) => value,
            Err(EngineError::Parse(e)) => {
                warn!(target: "ledger", error = %e, "stored ledger unreadable; starting empty");
                None
            }
            Err(e) => return Err(e),
        };
        state.records = match value {
            None => Vec::new(),
            Some(v) => match serde_json::from_value::<Vec<EngagementRecord>>(v) {
                Ok(mut records) => {
                    // Restore the newest-first invariant if the stored copy lost it.
                    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    records
                }
                Err(e) => {
                    warn!(target: "ledger", error = %e, "stored ledger unreadable; starting empty");
                    Vec::new()
                }
            },
        };
        state.loaded = true;
        info!(target: "ledger", records = state.records.len(), "ledger loaded");
        Ok(())
    }

    async fn persist(&self, state: &LedgerState) -> Result<(), EngineError> {
        let value = serde_json::to_value(&state.records)?;
        self.store.set(LEDGER_STORE_KEY, value).await
    }

    /// Decide whether engaging with `text` on `(platform_id, platform)` at `now`
    /// would be a duplicate or too frequent.
    pub async fn should_suppress(
        &self,
        text: &str,
        platform_id: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<SuppressionCheck, EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let cfg = self.config();
        let similarity = *self.similarity.read();
        let check = evaluate(&state.records, &cfg, &similarity, text, platform_id, platform, now);
        if let Some(reason) = &check.reason {
            debug!(
                target: "ledger",
                platform,
                post = platform_id,
                text_id = %anon_id(text),
                reason = reason.kind(),
                "suppressed"
            );
        }
        Ok(check)
    }

    /// Append a new record for an engagement made at `now`.
    pub async fn record(
        &self,
        text: &str,
        platform_id: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<EngagementRecord, EngineError> {
        let record = EngagementRecord::new(text, platform_id, platform, now);
        self.append(record.clone(), now).await?;
        Ok(record)
    }

    /// Insert a prepared record. Idempotent on `record.id`: re-appending after a
    /// failed write only retries the write.
    pub async fn append(&self, record: EngagementRecord, now: DateTime<Utc>) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        if !state.records.iter().any(|r| r.id == record.id) {
            let at = state
                .records
                .partition_point(|r| r.created_at > record.created_at);
            state.records.insert(at, record);
        }

        let cfg = self.config();
        let horizon = saturating_sub(now, cfg.retention());
        let oldest_expired = state
            .records
            .last()
            .is_some_and(|r| r.created_at < horizon);
        if state.records.len() > cfg.cleanup_threshold || oldest_expired {
            let removed = compact_records(&mut state.records, now, cfg.max_records, cfg.retention());
            info!(target: "ledger", removed, kept = state.records.len(), "ledger compacted");
        }
        self.persist(&state).await
    }

    /// Bulk-load history (e.g. migrated from another store), then compact if over the cap.
    pub async fn import(
        &self,
        records: Vec<EngagementRecord>,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut added = 0usize;
        for r in records {
            if !state.records.iter().any(|x| x.id == r.id) {
                state.records.push(r);
                added += 1;
            }
        }
        // Stable: equal timestamps keep their relative order.
        state.records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let cfg = self.config();
        if state.records.len() > cfg.cleanup_threshold {
            compact_records(&mut state.records, now, cfg.max_records, cfg.retention());
        } else {
            let horizon = saturating_sub(now, cfg.retention());
            state.records.retain(|r| r.created_at >= horizon);
        }
        self.persist(&state).await?;
        Ok(added)
    }

    /// Force compaction regardless of the cleanup threshold.
    pub async fn compact(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let cfg = self.config();
        let removed = compact_records(&mut state.records, now, cfg.max_records, cfg.retention());
        self.persist(&state).await?;
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize, EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.records.len())
    }

    pub async fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self.len().await? == 0)
    }

    /// Newest `n` records, newest first.
    pub async fn recent(&self, n: usize) -> Result<Vec<EngagementRecord>, EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.records.iter().take(n).cloned().collect())
    }
}

/// The three tiers, in order; the first hit wins.
fn evaluate(
    records: &[EngagementRecord],
    cfg: &SuppressionConfig,
    similarity: &SimilarityEngine,
    text: &str,
    platform_id: &str,
    platform: &str,
    now: DateTime<Utc>,
) -> SuppressionCheck {
    let same_post = Duration::from_secs(cfg.same_post_window_secs);
    let similar = Duration::from_secs(cfg.similar_window_secs);
    let pacing = Duration::from_secs(cfg.platform_window_secs);

    // 1) same post
    if let Some(remaining) = records
        .iter()
        .filter(|r| r.platform == platform && r.platform_id == platform_id)
        .find_map(|r| cooldown_remaining(now, r.created_at, same_post))
    {
        return SuppressionCheck::block(SuppressionReason::SamePost {
            remaining_secs: remaining.as_secs(),
        });
    }

    // 2) similar content on the same platform
    let hash = content_hash(text);
    for r in records.iter().filter(|r| r.platform == platform) {
        let Some(remaining) = cooldown_remaining(now, r.created_at, similar) else {
            continue;
        };
        if r.content_hash == hash {
            return SuppressionCheck::block(SuppressionReason::DuplicateContent {
                remaining_secs: remaining.as_secs(),
            });
        }
        let score = similarity.score(text, &r.text);
        if score >= cfg.similarity_threshold {
            return SuppressionCheck::block(SuppressionReason::SimilarContent {
                similarity: score,
                remaining_secs: remaining.as_secs(),
            });
        }
    }

    // 3) platform-wide pacing
    if let Some(remaining) = records
        .iter()
        .filter(|r| r.platform == platform)
        .find_map(|r| cooldown_remaining(now, r.created_at, pacing))
    {
        return SuppressionCheck::block(SuppressionReason::PlatformCooldown {
            remaining_secs: remaining.as_secs(),
        });
    }

    SuppressionCheck::allow()
}
