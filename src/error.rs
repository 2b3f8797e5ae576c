//! Error taxonomy for the engagement engine.
//!
//! Errors raised inside the crate are typed at their origin (`EngineError`).
//! Errors that cross a collaborator boundary arrive as `anyhow::Error` and are
//! mapped to a category by `classify`, which prefers a typed `EngineError`
//! anywhere in the chain and only falls back to message patterns otherwise.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Failure category; drives retryability and backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    InvalidCredential,
    QuotaExceeded,
    ContentBlocked,
    ElementNotFound,
    Timeout,
    StorageError,
    ParseError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Network,
        ErrorCategory::InvalidCredential,
        ErrorCategory::QuotaExceeded,
        ErrorCategory::ContentBlocked,
        ErrorCategory::ElementNotFound,
        ErrorCategory::Timeout,
        ErrorCategory::StorageError,
        ErrorCategory::ParseError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::InvalidCredential => "INVALID_CREDENTIAL",
            ErrorCategory::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCategory::ContentBlocked => "CONTENT_BLOCKED",
            ErrorCategory::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::StorageError => "STORAGE_ERROR",
            ErrorCategory::ParseError => "PARSE_ERROR",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// Credential and content-policy failures are never retried, whatever the
    /// configured attempt budget says.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorCategory::InvalidCredential | ErrorCategory::ContentBlocked
        )
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorCategory::InvalidCredential => Severity::Critical,
            ErrorCategory::QuotaExceeded | ErrorCategory::StorageError => Severity::High,
            ErrorCategory::ParseError => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = EngineError;

    /// Accepts `QUOTA_EXCEEDED`, `quota_exceeded` and `quota-exceeded`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_uppercase().replace('-', "_");
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == key)
            .ok_or_else(|| EngineError::Config(format!("unknown error category `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Typed errors produced inside the engine and by well-behaved collaborators.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("content blocked: {0}")]
    ContentBlocked(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Network(_) => ErrorCategory::Network,
            EngineError::InvalidCredential(_) => ErrorCategory::InvalidCredential,
            EngineError::QuotaExceeded(_) => ErrorCategory::QuotaExceeded,
            EngineError::ContentBlocked(_) => ErrorCategory::ContentBlocked,
            EngineError::ElementNotFound(_) => ErrorCategory::ElementNotFound,
            EngineError::Timeout(_) => ErrorCategory::Timeout,
            EngineError::Storage(_) => ErrorCategory::StorageError,
            EngineError::Parse(_) => ErrorCategory::ParseError,
            EngineError::Config(_) | EngineError::Other(_) => ErrorCategory::Unknown,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Parse(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

/// What the next attempt should do differently after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryHint {
    Backoff,
    UseFallbackLocator,
    ExtendTimeout,
    CompactStorage,
    PauseScheduler,
    DropCandidate,
    OperatorAction,
    BestEffort,
}

impl RecoveryHint {
    pub fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Network | ErrorCategory::Unknown => RecoveryHint::Backoff,
            ErrorCategory::InvalidCredential => RecoveryHint::OperatorAction,
            ErrorCategory::QuotaExceeded => RecoveryHint::PauseScheduler,
            ErrorCategory::ContentBlocked => RecoveryHint::DropCandidate,
            ErrorCategory::ElementNotFound => RecoveryHint::UseFallbackLocator,
            ErrorCategory::Timeout => RecoveryHint::ExtendTimeout,
            ErrorCategory::StorageError => RecoveryHint::CompactStorage,
            ErrorCategory::ParseError => RecoveryHint::BestEffort,
        }
    }
}

/// A failure tagged for policy-driven handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    /// 1-based attempt that produced this error.
    pub attempt: u32,
    pub suggested_delay: Option<Duration>,
    pub recovery: RecoveryHint,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            category,
            severity: category.severity(),
            retryable: category.is_retryable(),
            attempt,
            suggested_delay: None,
            recovery: RecoveryHint::for_category(category),
            message: message.into(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, attempt {}): {}",
            self.category, self.severity, self.attempt, self.message
        )
    }
}

// Order matters: the first matching pattern wins. Storage precedes quota so that
// browser storage quota messages are not mistaken for API rate limits, and
// timeout precedes network so "network timeout" lands on the timeout policy.
static FALLBACK_PATTERNS: Lazy<Vec<(ErrorCategory, Regex)>> = Lazy::new(|| {
    let table: [(ErrorCategory, &str); 8] = [
        (
            ErrorCategory::InvalidCredential,
            r"(?i)invalid (api )?key|api key not valid|invalid credential|unauthori[sz]ed|authentication failed|forbidden|\b40[13]\b",
        ),
        (
            ErrorCategory::StorageError,
            r"(?i)storage|quota_bytes|no space left|disk full|write failed",
        ),
        (
            ErrorCategory::QuotaExceeded,
            r"(?i)quota|rate.?limit|too many requests|resource.?exhausted|\b429\b",
        ),
        (
            ErrorCategory::ContentBlocked,
            r"(?i)content (was )?blocked|blocked by|safety|content policy|flagged|moderation",
        ),
        (
            ErrorCategory::Timeout,
            r"(?i)timed? ?out|timeout|deadline exceeded",
        ),
        (
            ErrorCategory::ElementNotFound,
            r"(?i)element not found|no such element|selector|could not find (the )?(element|button|input|comment box)",
        ),
        (
            ErrorCategory::Network,
            r"(?i)network|fetch failed|connection|econn\w*|enotfound|dns|socket|offline|\b50[234]\b",
        ),
        (
            ErrorCategory::ParseError,
            r"(?i)parse|json|unexpected token|syntax error|malformed|deserializ",
        ),
    ];
    table
        .into_iter()
        .filter_map(|(cat, pat)| Regex::new(pat).ok().map(|re| (cat, re)))
        .collect()
});

/// Classify an un-typed error message by ordered pattern match.
pub fn classify_message(message: &str) -> ErrorCategory {
    FALLBACK_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(cat, _)| *cat)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Classify any error: typed `EngineError` in the chain first, message patterns second.
pub fn classify(err: &anyhow::Error, attempt: u32) -> ClassifiedError {
    let typed = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map(EngineError::category);
    let message = format!("{err:#}");
    let category = typed.unwrap_or_else(|| classify_message(&message));
    ClassifiedError::new(category, attempt, message)
}
