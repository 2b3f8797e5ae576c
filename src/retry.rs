// src/retry.rs
//! Retry policy: per-category backoff rules and the retry loop that applies
//! them to an async operation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{classify, ClassifiedError, EngineError, ErrorCategory, RecoveryHint};
use crate::events::{EngineEvent, EventSink};
use crate::feed::AttemptContext;

/// Multiplier applied to the attempt timeout after a timeout failure.
const TIMEOUT_GROWTH: f64 = 1.5;

const FIBONACCI: [u64; 12] = [1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
}

/// Delay before the retry that follows failed attempt `attempt` (1-based),
/// capped at `max`.
///
/// - exponential: `base * 2^attempt`
/// - linear: `base * attempt`
/// - fixed: `base`
/// - fibonacci: `base * fib(attempt)` from a fixed table (last entry repeats)
pub fn next_delay(strategy: BackoffStrategy, attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let ms = match strategy {
        BackoffStrategy::Exponential => {
            let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
            base_ms.saturating_mul(factor)
        }
        BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempt.max(1))),
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Fibonacci => {
            let idx = (attempt.max(1) as usize - 1).min(FIBONACCI.len() - 1);
            base_ms.saturating_mul(FIBONACCI[idx])
        }
    };
    Duration::from_millis(ms).min(max)
}

/// Backoff rule for one error category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryRule {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl RetryRule {
    const fn new(strategy: BackoffStrategy, base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            strategy,
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        next_delay(
            self.strategy,
            attempt,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    /// Built-in rule per category.
    pub fn default_for(category: ErrorCategory) -> Self {
        use BackoffStrategy::*;
        match category {
            ErrorCategory::Network => Self::new(Exponential, 1_000, 30_000, 4),
            ErrorCategory::InvalidCredential => Self::new(Fixed, 0, 0, 1),
            // One attempt per fire; the scheduler pause is the retry.
            ErrorCategory::QuotaExceeded => Self::new(Fixed, 15 * 60_000, 15 * 60_000, 1),
            ErrorCategory::ContentBlocked => Self::new(Fixed, 0, 0, 1),
            ErrorCategory::ElementNotFound => Self::new(Linear, 2_000, 10_000, 3),
            ErrorCategory::Timeout => Self::new(Fibonacci, 1_000, 20_000, 3),
            // Compact, then retry once.
            ErrorCategory::StorageError => Self::new(Fixed, 500, 500, 2),
            ErrorCategory::ParseError => Self::new(Fixed, 250, 250, 2),
            ErrorCategory::Unknown => Self::new(Fixed, 1_000, 1_000, 2),
        }
    }
}

/// Partial override of a category rule, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryRuleOverride {
    pub strategy: Option<BackoffStrategy>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl RetryRuleOverride {
    fn apply(&self, mut rule: RetryRule) -> RetryRule {
        if let Some(s) = self.strategy {
            rule.strategy = s;
        }
        if let Some(v) = self.base_delay_ms {
            rule.base_delay_ms = v;
        }
        if let Some(v) = self.max_delay_ms {
            rule.max_delay_ms = v;
        }
        if let Some(v) = self.max_attempts {
            rule.max_attempts = v.max(1);
        }
        rule
    }
}

/// Final failure of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: ClassifiedError,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl std::fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} attempt(s) in {:?}",
            self.error, self.attempts, self.elapsed
        )
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    rules: HashMap<ErrorCategory, RetryRule>,
    base_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(base_timeout: Duration) -> Self {
        let rules = ErrorCategory::ALL
            .into_iter()
            .map(|c| (c, RetryRule::default_for(c)))
            .collect();
        Self {
            rules,
            base_timeout,
        }
    }

    /// Built-in rules with configured overrides applied. Keys are category names.
    pub fn from_overrides(
        base_timeout: Duration,
        overrides: &BTreeMap<String, RetryRuleOverride>,
    ) -> Result<Self, EngineError> {
        let mut policy = Self::new(base_timeout);
        for (key, ov) in overrides {
            let category: ErrorCategory = key.parse()?;
            let rule = ov.apply(policy.rule(category));
            policy.rules.insert(category, rule);
        }
        Ok(policy)
    }

    pub fn base_timeout(&self) -> Duration {
        self.base_timeout
    }

    pub fn rule(&self, category: ErrorCategory) -> RetryRule {
        self.rules
            .get(&category)
            .copied()
            .unwrap_or_else(|| RetryRule::default_for(category))
    }

    /// Attempt budget for a category; non-retryable categories always get one.
    pub fn max_attempts(&self, category: ErrorCategory) -> u32 {
        if category.is_retryable() {
            self.rule(category).max_attempts.max(1)
        } else {
            1
        }
    }

    /// Classify `err` and attach the suggested delay for the next attempt.
    pub fn classify(&self, err: &anyhow::Error, attempt: u32) -> ClassifiedError {
        let mut c = classify(err, attempt);
        if c.retryable {
            c.suggested_delay = Some(self.rule(c.category).delay_after(attempt));
        }
        c
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// category's attempt budget is spent. Each failure is emitted as
    /// `error.classified`.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        events: &EventSink,
        mut op: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let mut ctx = AttemptContext::first(self.base_timeout);
        loop {
            let err = match op(ctx.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let classified = self.classify(&err, ctx.attempt);
            events.emit(EngineEvent::ErrorClassified {
                operation: operation.to_string(),
                category: classified.category,
                severity: classified.severity,
                retryable: classified.retryable,
                attempt: ctx.attempt,
            });

            let budget = self.max_attempts(classified.category);
            if !classified.retryable || ctx.attempt >= budget {
                debug!(
                    target: "retry",
                    operation,
                    category = %classified.category,
                    attempts = ctx.attempt,
                    "giving up"
                );
                return Err(RetryFailure {
                    error: classified,
                    attempts: ctx.attempt,
                    elapsed: started.elapsed(),
                });
            }

            let delay = classified.suggested_delay.unwrap_or_default();
            warn!(
                target: "retry",
                operation,
                category = %classified.category,
                attempt = ctx.attempt,
                max_attempts = budget,
                delay_ms = delay.as_millis() as u64,
                "attempt failed; retrying"
            );
            tokio::time::sleep(delay).await;

            ctx = AttemptContext {
                attempt: ctx.attempt + 1,
                timeout: if classified.recovery == RecoveryHint::ExtendTimeout {
                    ctx.timeout.mul_f64(TIMEOUT_GROWTH)
                } else {
                    ctx.timeout
                },
                recovery: Some(classified.recovery),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const S: Duration = Duration::from_secs(1);

    #[test]
    fn strategy_formulas() {
        let cap = Duration::from_secs(100);
        assert_eq!(next_delay(BackoffStrategy::Exponential, 1, S, cap), S * 2);
        assert_eq!(next_delay(BackoffStrategy::Exponential, 3, S, cap), S * 8);
        assert_eq!(next_delay(BackoffStrategy::Linear, 3, S, cap), S * 3);
        assert_eq!(next_delay(BackoffStrategy::Fixed, 7, S, cap), S);
        assert_eq!(next_delay(BackoffStrategy::Fibonacci, 1, S, cap), S);
        assert_eq!(next_delay(BackoffStrategy::Fibonacci, 5, S, cap), S * 5);
        assert_eq!(next_delay(BackoffStrategy::Fibonacci, 6, S, cap), S * 8);
    }

    #[test]
    fn delays_are_capped_and_never_overflow() {
        let cap = Duration::from_secs(30);
        assert_eq!(next_delay(BackoffStrategy::Exponential, 10, S, cap), cap);
        assert_eq!(next_delay(BackoffStrategy::Exponential, 200, S, cap), cap);
        assert_eq!(next_delay(BackoffStrategy::Fibonacci, 99, S, cap), cap);
    }

    #[test]
    fn non_retryable_categories_ignore_overrides() {
        let mut ov = BTreeMap::new();
        ov.insert(
            "invalid_credential".to_string(),
            RetryRuleOverride {
                max_attempts: Some(9),
                ..Default::default()
            },
        );
        let p = RetryPolicy::from_overrides(S, &ov).unwrap();
        assert_eq!(p.max_attempts(ErrorCategory::InvalidCredential), 1);
    }

    #[test]
    fn overrides_merge_onto_category_defaults() {
        let mut ov = BTreeMap::new();
        ov.insert(
            "NETWORK".to_string(),
            RetryRuleOverride {
                max_attempts: Some(6),
                ..Default::default()
            },
        );
        let p = RetryPolicy::from_overrides(S, &ov).unwrap();
        let rule = p.rule(ErrorCategory::Network);
        assert_eq!(rule.max_attempts, 6);
        assert_eq!(rule.strategy, BackoffStrategy::Exponential);
        assert!(RetryPolicy::from_overrides(S, &{
            let mut m = BTreeMap::new();
            m.insert("nope".to_string(), RetryRuleOverride::default());
            m
        })
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_network_until_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let out = policy
            .execute("op", &EventSink::default(), |ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    assert_eq!(ctx.attempt, n);
                    if n < 3 {
                        anyhow::bail!("connection reset by peer")
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts_with_count_and_elapsed() {
        let policy = RetryPolicy::default();
        let events = EventSink::default();
        let mut rx = events.subscribe();
        let failure = policy
            .execute("op", &events, |_ctx| async {
                Err::<(), _>(anyhow::Error::new(EngineError::ElementNotFound(
                    "comment box".into(),
                )))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error.category, ErrorCategory::ElementNotFound);
        // linear 2s + 4s between the three attempts
        assert_eq!(failure.elapsed, Duration::from_secs(6));
        assert_eq!(crate::events::drain(&mut rx).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let failure = policy
            .execute("op", &EventSink::default(), |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("Invalid API key")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert!(!failure.error.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn hints_flow_into_the_next_attempt() {
        let policy = RetryPolicy::new(Duration::from_secs(10));
        let seen = parking_lot::Mutex::new(Vec::new());
        let _ = policy
            .execute("op", &EventSink::default(), |ctx| {
                seen.lock().push(ctx.clone());
                async { Err::<(), _>(anyhow::Error::new(EngineError::Timeout(S))) }
            })
            .await;
        let seen = seen.into_inner();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].recovery, None);
        assert_eq!(seen[1].recovery, Some(RecoveryHint::ExtendTimeout));
        assert_eq!(seen[1].timeout, Duration::from_secs(15));
        assert_eq!(seen[2].timeout, Duration::from_millis(22_500));
    }
}
