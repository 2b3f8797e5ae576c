//! Comment similarity: token-set Jaccard blended with normalized Levenshtein.
//! Both inputs are normalized first; identical normalized text scores 1.0.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::content_hash::normalize;

/// Blend weights. Defaults are 0.7 Jaccard / 0.3 Levenshtein.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub jaccard: f64,
    pub levenshtein: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            jaccard: 0.7,
            levenshtein: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityEngine {
    weights: SimilarityWeights,
}

impl SimilarityEngine {
    pub fn new(weights: SimilarityWeights) -> Self {
        // Keep weights non-negative and normalized so the score stays in [0, 1].
        let j = weights.jaccard.max(0.0);
        let l = weights.levenshtein.max(0.0);
        let sum = j + l;
        let weights = if sum > 0.0 {
            SimilarityWeights {
                jaccard: j / sum,
                levenshtein: l / sum,
            }
        } else {
            SimilarityWeights::default()
        };
        Self { weights }
    }

    pub fn weights(&self) -> SimilarityWeights {
        self.weights
    }

    /// Similarity in [0.0, 1.0].
    pub fn score(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let na = normalize(a);
        let nb = normalize(b);
        if na.is_empty() || nb.is_empty() {
            return 0.0;
        }
        if na == nb {
            return 1.0;
        }
        let combined = self.weights.jaccard * jaccard(&na, &nb)
            + self.weights.levenshtein * normalized_levenshtein(&na, &nb);
        combined.clamp(0.0, 1.0)
    }
}

/// Token-set Jaccard over already-normalized strings.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let sa: HashSet<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    let sb: HashSet<&str> = b.split(' ').filter(|t| !t.is_empty()).collect();
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / union as f64
}

/// `1 - distance / max(len)` with the exact DP Levenshtein distance over chars.
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let dist = strsim::levenshtein(a, b) as f64;
    1.0 - dist / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SimilarityEngine {
        SimilarityEngine::default()
    }

    #[test]
    fn reflexive_for_non_empty_text() {
        let e = engine();
        for s in ["a", "Great post!", "rust 🦀 async", "   spaced   out  "] {
            assert_eq!(e.score(s, s), 1.0, "score({s:?}, {s:?})");
        }
    }

    #[test]
    fn near_paraphrase_scores_high() {
        let s = engine().score("great work on the project", "great work on your project");
        assert!(s >= 0.7, "got {s}");
    }

    #[test]
    fn unrelated_text_scores_low() {
        let s = engine().score(
            "great work on the project",
            "completely different content here",
        );
        assert!(s <= 0.3, "got {s}");
    }

    #[test]
    fn punctuation_and_case_do_not_matter() {
        assert_eq!(engine().score("Nice work!", "nice work"), 1.0);
    }

    #[test]
    fn empty_against_text_is_zero() {
        assert_eq!(engine().score("", "hello"), 0.0);
        assert_eq!(engine().score("!!!", "hello"), 0.0);
    }

    #[test]
    fn levenshtein_is_exact() {
        assert_eq!(strsim::levenshtein("kitten", "sitting"), 3);
        let s = normalized_levenshtein("kitten", "sitting");
        assert!((s - (1.0 - 3.0 / 7.0)).abs() < 1e-12);
    }

    #[test]
    fn weights_are_normalized() {
        let e = SimilarityEngine::new(SimilarityWeights {
            jaccard: 7.0,
            levenshtein: 3.0,
        });
        let w = e.weights();
        assert!((w.jaccard - 0.7).abs() < 1e-12);
        assert!((w.levenshtein - 0.3).abs() < 1e-12);
    }
}
