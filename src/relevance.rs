// src/relevance.rs
//! Relevance gate: weighted term sets and signal patterns compiled once from
//! TOML, then applied to case-folded candidate text.
//!
//! Score = sum of matched term weights (high/medium/low, negatives subtract)
//! plus pattern weights, clamped to `[0, max_score]`. A post is relevant when
//! `score >= threshold`. The threshold is independent of the compiled term
//! sets and may be swapped at runtime without recompiling anything.

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::content_hash::anon_id;
use crate::feed::CandidatePost;

pub const DEFAULT_RELEVANCE_TOML: &str = include_str!("../config/relevance.toml");
pub const DEFAULT_RELEVANCE_THRESHOLD: i32 = 3;
pub const DEFAULT_MAX_SCORE: i32 = 20;

const SHORT_TEXT_CHARS: usize = 50;
const LONG_TEXT_CHARS: usize = 200;

/// Result of one relevance evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceAnalysis {
    pub score: i32,
    /// 0..=100
    pub confidence: u8,
    pub matched_terms: Vec<String>,
    /// Negative terms that subtracted from the score.
    pub penalties: Vec<String>,
    pub is_relevant: bool,
}

/* ----------------------------
Config schema (from TOML)
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct RelevanceRoot {
    #[serde(default)]
    pub relevance: RelevanceSection,
    #[serde(default)]
    pub weights: TierWeights,
    #[serde(default)]
    pub terms: TermSets,
    #[serde(default)]
    pub patterns: Vec<PatternCfg>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelevanceSection {
    pub threshold: i32,
    pub max_score: i32,
}

impl Default for RelevanceSection {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_RELEVANCE_THRESHOLD,
            max_score: DEFAULT_MAX_SCORE,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TierWeights {
    pub high: i32,
    pub medium: i32,
    pub low: i32,
    pub negative: i32,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            high: 3,
            medium: 2,
            low: 1,
            negative: -2,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TermSets {
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
    pub negative: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternCfg {
    pub id: String,
    pub pattern: String,
    pub weight: i32,
}

/* ----------------------------
Compiled structures
---------------------------- */

#[derive(Debug)]
struct CompiledTerm {
    term: String,
    weight: i32,
    re: Regex,
}

#[derive(Debug)]
struct CompiledPattern {
    id: String,
    weight: i32,
    re: Regex,
}

#[derive(Debug)]
struct CompiledTerms {
    terms: Vec<CompiledTerm>,
    patterns: Vec<CompiledPattern>,
    max_score: i32,
}

/// Compiled, immutable scorer. Cloning shares the compiled term sets.
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    compiled: Arc<CompiledTerms>,
    threshold: i32,
}

/// Term regex bounded by non-word characters (so `node.js` works); inner
/// spaces match any whitespace run.
fn term_regex(term: &str) -> anyhow::Result<Regex> {
    let escaped = regex::escape(&term.trim().to_lowercase()).replace(' ', r"\s+");
    Regex::new(&format!(r"(?i)(?:^|\W){escaped}(?:$|\W)"))
        .map_err(|e| anyhow::anyhow!("term `{term}` regex error: {e}"))
}

impl RelevanceScorer {
    /// Built-in term sets (`config/relevance.toml`, embedded at compile time).
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(DEFAULT_RELEVANCE_TOML)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read relevance terms at {}: {}",
                path.display(),
                e
            )
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let cfg: RelevanceRoot = toml::from_str(toml_str)?;
        Self::compile(&cfg)
    }

    pub fn compile(cfg: &RelevanceRoot) -> anyhow::Result<Self> {
        if cfg.relevance.max_score <= 0 {
            anyhow::bail!("relevance.max_score must be positive");
        }
        let w = cfg.weights;
        let tiers = [
            (&cfg.terms.high, w.high),
            (&cfg.terms.medium, w.medium),
            (&cfg.terms.low, w.low),
            (&cfg.terms.negative, w.negative),
        ];

        let mut terms = Vec::new();
        for (set, weight) in tiers {
            for term in set.iter().filter(|t| !t.trim().is_empty()) {
                terms.push(CompiledTerm {
                    term: term.trim().to_lowercase(),
                    weight,
                    re: term_regex(term)?,
                });
            }
        }

        let patterns = cfg
            .patterns
            .iter()
            .map(|p| {
                let re = Regex::new(&p.pattern)
                    .map_err(|e| anyhow::anyhow!("pattern `{}` regex error: {}", p.id, e))?;
                Ok(CompiledPattern {
                    id: p.id.clone(),
                    weight: p.weight,
                    re,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            compiled: Arc::new(CompiledTerms {
                terms,
                patterns,
                max_score: cfg.relevance.max_score,
            }),
            threshold: cfg.relevance.threshold,
        })
    }

    /// Same compiled term sets, different threshold.
    pub fn with_threshold(&self, threshold: i32) -> Self {
        Self {
            compiled: Arc::clone(&self.compiled),
            threshold,
        }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn max_score(&self) -> i32 {
        self.compiled.max_score
    }

    /// Score raw text. Pure: identical text always yields the same analysis.
    pub fn analyze(&self, text: &str) -> RelevanceAnalysis {
        self.analyze_scaled(text, text.chars().count())
    }

    /// Score `text`, scaling confidence by a length of `chars` characters.
    fn analyze_scaled(&self, text: &str, chars: usize) -> RelevanceAnalysis {
        let folded = text.to_lowercase();
        let mut raw: i32 = 0;
        let mut matched_terms = Vec::new();
        let mut penalties = Vec::new();

        for t in &self.compiled.terms {
            if t.re.is_match(&folded) {
                raw += t.weight;
                if t.weight < 0 {
                    penalties.push(t.term.clone());
                } else {
                    matched_terms.push(t.term.clone());
                }
            }
        }
        for p in &self.compiled.patterns {
            if p.re.is_match(&folded) {
                raw += p.weight;
                matched_terms.push(p.id.clone());
            }
        }

        let max = self.compiled.max_score;
        let score = raw.clamp(0, max);
        let confidence = confidence_for(score, max, chars);
        let is_relevant = score >= self.threshold;

        debug!(
            target: "relevance",
            id = %anon_id(text),
            score,
            threshold = self.threshold,
            matched = ?matched_terms.iter().take(5).collect::<Vec<_>>(),
            "relevance scored"
        );

        RelevanceAnalysis {
            score,
            confidence,
            matched_terms,
            penalties,
            is_relevant,
        }
    }

    /// Score a post: its text plus its hashtags as plain words. Confidence
    /// scales with the length of the post text alone.
    pub fn analyze_post(&self, post: &CandidatePost) -> RelevanceAnalysis {
        if post.hashtags.is_empty() {
            return self.analyze(&post.text);
        }
        let tags = post
            .hashtags
            .iter()
            .map(|h| h.trim_start_matches('#'))
            .collect::<Vec<_>>()
            .join(" ");
        self.analyze_scaled(&format!("{} {}", post.text, tags), post.text.chars().count())
    }
}

/// `score / max * 100`, scaled 0.7x for short text and 1.2x for long text.
fn confidence_for(score: i32, max_score: i32, chars: usize) -> u8 {
    let mut c = score as f64 * 100.0 / max_score as f64;
    if chars < SHORT_TEXT_CHARS {
        c *= 0.7;
    } else if chars > LONG_TEXT_CHARS {
        c *= 1.2;
    }
    c.round().clamp(0.0, 100.0) as u8
}

/* ----------------------------
Thread-safe handle
---------------------------- */

/// Shared scorer that can be swapped (new terms) or re-thresholded at runtime.
/// Readers always see one consistent scorer.
#[derive(Clone)]
pub struct RelevanceHandle {
    inner: Arc<RwLock<RelevanceScorer>>,
}

impl RelevanceHandle {
    pub fn new(scorer: RelevanceScorer) -> Self {
        Self {
            inner: Arc::new(RwLock::new(scorer)),
        }
    }

    pub fn current(&self) -> RelevanceScorer {
        self.inner.read().clone()
    }

    pub fn analyze_post(&self, post: &CandidatePost) -> RelevanceAnalysis {
        self.inner.read().analyze_post(post)
    }

    pub fn set_threshold(&self, threshold: i32) {
        let mut guard = self.inner.write();
        if guard.threshold != threshold {
            *guard = guard.with_threshold(threshold);
        }
    }

    pub fn replace(&self, scorer: RelevanceScorer) {
        *self.inner.write() = scorer;
    }
}

/* ----------------------------
Tests
---------------------------- */
