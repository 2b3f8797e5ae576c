//! Text normalization and content hashing.
//!
//! The hash is a fast duplicate pre-filter: SHA-256 over the sorted token
//! multiset of the normalized text, so word order and punctuation do not
//! matter and the value is identical across runs and processes.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        }
        // punctuation and symbols are dropped
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Tokens of the normalized text, in order.
pub fn tokens(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stable, order-independent content hash (16 hex chars).
pub fn content_hash(text: &str) -> String {
    let mut toks = tokens(text);
    toks.sort_unstable();
    let mut hasher = Sha256::new();
    for (i, t) in toks.iter().enumerate() {
        if i > 0 {
            hasher.update(b" ");
        }
        hasher.update(t.as_bytes());
    }
    short_hex(&hasher.finalize(), 8)
}

/// Anonymized id for logs: never log raw candidate text.
pub fn anon_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    short_hex(&digest, 6)
}

fn short_hex(bytes: &[u8], take: usize) -> String {
    let mut out = String::with_capacity(take * 2);
    for b in bytes.iter().take(take) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
