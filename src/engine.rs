//! # Engagement Engine
//! One fire of the cadence loop: fetch candidates, gate them on relevance,
//! veto duplicates through the ledger, hand the survivor(s) to the executor
//! under the retry policy, and record what was actually done.
//!
//! The engine never decides *when* to run; the scheduler calls `on_fire` and
//! receives a `FireOutcome` telling it whether to keep going, pause or halt.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{EngagementConfig, EngineConfig, RelevanceConfig};
use crate::content_hash::anon_id;
use crate::error::{EngineError, ErrorCategory, RecoveryHint};
use crate::events::{EngineEvent, EventSink};
use crate::feed::{
    split_batch, CandidatePost, CandidateSource, CommentComposer, EngagementExecutor,
    EngagementIntent, EngagementOutcome,
};
use crate::ledger::{EngagementRecord, SuppressionCheck, SuppressionLedger};
use crate::relevance::{RelevanceAnalysis, RelevanceHandle, RelevanceScorer};
use crate::retry::{RetryFailure, RetryPolicy};
use crate::scheduler::{FireHandler, FireOutcome};
use crate::similarity::SimilarityEngine;

fn describe_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("engagement_fires_total", "Scheduler fires handled by the engine.");
        describe_counter!(
            "engagement_suppressed_total",
            "Candidates vetoed by the suppression ledger."
        );
        describe_counter!(
            "engagement_recorded_total",
            "Engagements performed and recorded in the ledger."
        );
        describe_counter!(
            "engagement_failed_total",
            "Engagements that failed after the retry budget was spent."
        );
    });
}

/// Counters for one fire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub irrelevant: usize,
    pub suppressed: usize,
    pub engaged: usize,
    /// Executor declined (outcome `Skipped`).
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip)]
    pub outcome: FireOutcome,
}

impl Default for CycleReport {
    fn default() -> Self {
        Self {
            fetched: 0,
            rejected: 0,
            duplicates: 0,
            irrelevant: 0,
            suppressed: 0,
            engaged: 0,
            skipped: 0,
            failed: 0,
            outcome: FireOutcome::Continue,
        }
    }
}

/// Compile the relevance scorer a config section asks for.
pub fn build_scorer(cfg: &RelevanceConfig) -> anyhow::Result<RelevanceScorer> {
    let scorer = match &cfg.terms_path {
        Some(path) => RelevanceScorer::from_path(path)?,
        None => RelevanceScorer::builtin()?,
    };
    Ok(scorer.with_threshold(cfg.threshold))
}

pub struct Engine {
    relevance: RelevanceHandle,
    ledger: Arc<SuppressionLedger>,
    retry: RwLock<RetryPolicy>,
    settings: RwLock<EngagementConfig>,
    source: Arc<dyn CandidateSource>,
    executor: Arc<dyn EngagementExecutor>,
    composer: Arc<dyn CommentComposer>,
    events: EventSink,
    clock: Arc<dyn Clock>,
    last_report: Mutex<Option<CycleReport>>,
}

/// Collaborators the engine drives but does not own the lifecycle of.
pub struct EnginePorts {
    pub source: Arc<dyn CandidateSource>,
    pub executor: Arc<dyn EngagementExecutor>,
    pub composer: Arc<dyn CommentComposer>,
}

impl Engine {
    pub fn new(
        cfg: &EngineConfig,
        relevance: RelevanceHandle,
        ledger: Arc<SuppressionLedger>,
        ports: EnginePorts,
        events: EventSink,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        describe_metrics();
        Ok(Self {
            relevance,
            ledger,
            retry: RwLock::new(cfg.retry_policy()?),
            settings: RwLock::new(cfg.engagement.clone()),
            source: ports.source,
            executor: ports.executor,
            composer: ports.composer,
            events,
            clock,
            last_report: Mutex::new(None),
        })
    }

    pub fn ledger(&self) -> &Arc<SuppressionLedger> {
        &self.ledger
    }

    pub fn relevance(&self) -> &RelevanceHandle {
        &self.relevance
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.lock().clone()
    }

    /// Swap relevance, suppression, similarity, retry and engagement settings.
    /// Everything is built before anything is replaced, so a bad config leaves
    /// the running one untouched. Takes effect from the next decision.
    pub fn update_config(&self, cfg: &EngineConfig) -> anyhow::Result<()> {
        cfg.validate()?;
        let scorer = build_scorer(&cfg.relevance)?;
        let policy = cfg.retry_policy()?;

        self.relevance.replace(scorer);
        self.ledger
            .update_config(cfg.suppression.clone(), SimilarityEngine::new(cfg.similarity));
        *self.retry.write() = policy;
        *self.settings.write() = cfg.engagement.clone();
        info!(target: "engine", "engine config updated");
        Ok(())
    }

    /// Run one decision pass as of `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let retry = self.retry.read().clone();
        let settings = self.settings.read().clone();
        let mut report = CycleReport::default();

        // 1) Fetch
        let raw = match self.fetch(&retry).await {
            Ok(posts) => posts,
            Err(failure) => {
                warn!(
                    target: "engine",
                    source = self.source.name(),
                    category = %failure.error.category,
                    attempts = failure.attempts,
                    "candidate fetch failed"
                );
                report.outcome = outcome_for(&retry, failure.error.category)
                    .unwrap_or(FireOutcome::Continue);
                return self.finish(report);
            }
        };
        report.fetched = raw.len();

        // 2) Validate and dedupe the batch
        let batch = split_batch(raw);
        report.rejected = batch.rejected.len();
        report.duplicates = batch.duplicates;
        for (post, err) in &batch.rejected {
            warn!(
                target: "engine",
                platform = %post.source_platform,
                post = %post.platform_id,
                error = %err,
                "malformed candidate dropped"
            );
        }

        // 3) Relevance gate, best first
        let mut relevant: Vec<(CandidatePost, RelevanceAnalysis)> = Vec::new();
        for post in batch.valid {
            let analysis = self.relevance.analyze_post(&post);
            if analysis.is_relevant {
                relevant.push((post, analysis));
            } else {
                report.irrelevant += 1;
            }
        }
        relevant.sort_by(|a, b| b.1.score.cmp(&a.1.score));

        // 4) Suppression + execution, bounded per fire
        let mut budget = settings.max_engagements_per_fire;
        for (post, analysis) in relevant {
            if budget == 0 {
                break;
            }
            match self.consider(&retry, &post, analysis, now, &mut report).await {
                Step::Vetoed => {}
                Step::Attempted => budget -= 1,
                Step::Stop(outcome) => {
                    report.outcome = outcome;
                    break;
                }
            }
        }

        self.finish(report)
    }

    fn finish(&self, report: CycleReport) -> CycleReport {
        info!(
            target: "engine",
            fetched = report.fetched,
            rejected = report.rejected,
            irrelevant = report.irrelevant,
            suppressed = report.suppressed,
            engaged = report.engaged,
            failed = report.failed,
            outcome = ?report.outcome,
            "cycle complete"
        );
        *self.last_report.lock() = Some(report.clone());
        report
    }

    async fn fetch(&self, retry: &RetryPolicy) -> Result<Vec<CandidatePost>, RetryFailure> {
        let source = Arc::clone(&self.source);
        retry
            .execute("next_candidates", &self.events, move |ctx| {
                let source = Arc::clone(&source);
                async move {
                    match tokio::time::timeout(ctx.timeout, source.next_candidates()).await {
                        Ok(res) => res,
                        Err(_) => Err(EngineError::Timeout(ctx.timeout).into()),
                    }
                }
            })
            .await
    }

    async fn consider(
        &self,
        retry: &RetryPolicy,
        post: &CandidatePost,
        analysis: RelevanceAnalysis,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Step {
        let platform = post.source_platform.as_str();
        let post_id = post.platform_id.as_str();

        let text = match self.composer.compose(post, &analysis).await {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) => {
                debug!(target: "engine", platform, post = post_id, "composer returned empty text");
                return Step::Vetoed;
            }
            Err(e) => {
                warn!(target: "engine", platform, post = post_id, error = %e, "compose failed");
                report.failed += 1;
                return Step::Vetoed;
            }
        };

        let check = match self.check_suppression(retry, &text, post_id, platform, now).await {
            Ok(c) => c,
            Err(failure) => {
                // Engaging without a working ledger risks duplicates.
                error!(
                    target: "engine",
                    post = post_id,
                    attempts = failure.attempts,
                    error = %failure,
                    "suppression check failed; skipping candidate"
                );
                report.failed += 1;
                return Step::Vetoed;
            }
        };
        if check.suppress {
            counter!("engagement_suppressed_total").increment(1);
            report.suppressed += 1;
            if let Some(reason) = check.reason {
                self.events.emit(EngineEvent::SuppressionBlocked {
                    platform: platform.to_string(),
                    platform_id: post_id.to_string(),
                    reason,
                });
            }
            return Step::Vetoed;
        }

        let intent = EngagementIntent {
            post: post.clone(),
            text,
            relevance: analysis,
            decided_at: now,
        };
        info!(
            target: "engine",
            platform,
            post = post_id,
            score = intent.relevance.score,
            text_id = %anon_id(&intent.text),
            "engaging"
        );

        match self.execute(retry, &intent).await {
            Ok(EngagementOutcome::Posted { reference }) => {
                debug!(target: "engine", post = post_id, reference = ?reference, "posted");
                self.record(retry, &intent).await;
                report.engaged += 1;
                Step::Attempted
            }
            Ok(EngagementOutcome::Skipped { reason }) => {
                info!(target: "engine", platform, post = post_id, reason = %reason, "executor skipped");
                report.skipped += 1;
                Step::Attempted
            }
            Err(failure) => {
                let category = failure.error.category;
                counter!("engagement_failed_total").increment(1);
                report.failed += 1;
                warn!(
                    target: "engine",
                    platform,
                    post = post_id,
                    category = %category,
                    attempts = failure.attempts,
                    "engagement failed"
                );
                self.events.emit(EngineEvent::EngagementFailed {
                    platform: platform.to_string(),
                    platform_id: post_id.to_string(),
                    category,
                    attempts: failure.attempts,
                    elapsed_ms: failure.elapsed.as_millis() as u64,
                });
                if category == ErrorCategory::ContentBlocked {
                    // Remember the text so it is never offered again.
                    self.record(retry, &intent).await;
                }
                match outcome_for(retry, category) {
                    Some(outcome) => Step::Stop(outcome),
                    None => Step::Attempted,
                }
            }
        }
    }

    async fn check_suppression(
        &self,
        retry: &RetryPolicy,
        text: &str,
        post_id: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<SuppressionCheck, RetryFailure> {
        let ledger = Arc::clone(&self.ledger);
        retry
            .execute("suppression_check", &self.events, move |_ctx| {
                let ledger = Arc::clone(&ledger);
                async move {
                    let check = ledger.should_suppress(text, post_id, platform, now).await?;
                    Ok::<_, anyhow::Error>(check)
                }
            })
            .await
    }

    async fn execute(
        &self,
        retry: &RetryPolicy,
        intent: &EngagementIntent,
    ) -> Result<EngagementOutcome, RetryFailure> {
        let executor = Arc::clone(&self.executor);
        retry
            .execute("attempt_engagement", &self.events, move |ctx| {
                let executor = Arc::clone(&executor);
                async move {
                    match tokio::time::timeout(ctx.timeout, executor.attempt_engagement(intent, &ctx))
                        .await
                    {
                        Ok(res) => res,
                        Err(_) => Err(EngineError::Timeout(ctx.timeout).into()),
                    }
                }
            })
            .await
    }

    /// Append to the ledger; a storage failure compacts and retries the same
    /// record (appends are idempotent on record id).
    async fn record(&self, retry: &RetryPolicy, intent: &EngagementIntent) {
        let post = &intent.post;
        let record = EngagementRecord::new(
            &intent.text,
            &post.platform_id,
            &post.source_platform,
            self.clock.now(),
        );
        let ledger = Arc::clone(&self.ledger);
        let clock = Arc::clone(&self.clock);
        let prepared = &record;
        let res = retry
            .execute("record_engagement", &self.events, move |ctx| {
                let ledger = Arc::clone(&ledger);
                let clock = Arc::clone(&clock);
                async move {
                    let now = clock.now();
                    if ctx.recovery == Some(RecoveryHint::CompactStorage) {
                        ledger.compact(now).await?;
                    }
                    ledger.append(prepared.clone(), now).await?;
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await;

        match res {
            Ok(()) => {
                counter!("engagement_recorded_total").increment(1);
                self.events.emit(EngineEvent::EngagementRecorded {
                    record_id: record.id.clone(),
                    platform: record.platform.clone(),
                    platform_id: record.platform_id.clone(),
                });
            }
            Err(failure) => error!(
                target: "engine",
                post = %post.platform_id,
                error = %failure,
                "engagement performed but not recorded"
            ),
        }
    }
}

enum Step {
    /// Dropped before reaching the executor; does not use the per-fire budget.
    Vetoed,
    Attempted,
    Stop(FireOutcome),
}

/// Scheduler consequence of a failure category, if any.
fn outcome_for(retry: &RetryPolicy, category: ErrorCategory) -> Option<FireOutcome> {
    match category {
        ErrorCategory::InvalidCredential => Some(FireOutcome::Halt),
        ErrorCategory::QuotaExceeded => {
            let pause = retry.rule(category).delay_after(1);
            Some(FireOutcome::PauseFor(pause.max(Duration::from_secs(1))))
        }
        _ => None,
    }
}

#[async_trait::async_trait]
impl FireHandler for Engine {
    async fn on_fire(&self, fired_at: DateTime<Utc>) -> FireOutcome {
        counter!("engagement_fires_total").increment(1);
        self.run_cycle(fired_at).await.outcome
    }
}
