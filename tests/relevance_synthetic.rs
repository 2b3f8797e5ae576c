//! Synthetic relevance suite: ~150 programmatically built sentences scored
//! with the built-in term sets, checked against hand-computed tier math.
//! Env toggles:
//!   SHOW_ROWS=1  -> print every row (text, expected, actual)

use feed_engagement::relevance::RelevanceScorer;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::fmt::Write as _;

const HIGH: [&str; 5] = ["rust", "python", "golang", "kubernetes", "typescript"];
const MEDIUM: [&str; 5] = ["database", "cloud", "devops", "backend", "algorithm"];
const LOW: [&str; 3] = ["career", "tools", "innovation"];
const NEGATIVE: [&str; 3] = ["vacation", "horoscope", "giveaway"];
// None of these is a term or part of a pattern.
const FILLER: [&str; 10] = [
    "today", "we", "shared", "some", "notes", "about", "our", "week", "here", "are",
];

struct Case {
    text: String,
    expect_score: i32,
}

fn pick<'a>(pool: &[&'a str], n: usize, rng: &mut StdRng) -> Vec<&'a str> {
    let mut v = pool.to_vec();
    v.shuffle(rng);
    v.truncate(n);
    v
}

fn build_cases(seed: u64, n: usize) -> Vec<Case> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let nh = rng.random_range(0..=2usize);
            let nm = rng.random_range(0..=2usize);
            let nl = rng.random_range(0..=2usize);
            let nn = rng.random_range(0..=1usize);

            let mut words = Vec::new();
            words.extend(pick(&HIGH, nh, &mut rng));
            words.extend(pick(&MEDIUM, nm, &mut rng));
            words.extend(pick(&LOW, nl, &mut rng));
            words.extend(pick(&NEGATIVE, nn, &mut rng));
            words.extend(pick(&FILLER, 4, &mut rng));
            words.shuffle(&mut rng);

            let raw = 3 * nh as i32 + 2 * nm as i32 + nl as i32 - 2 * nn as i32;
            Case {
                text: words.join(" "),
                expect_score: raw.clamp(0, 20),
            }
        })
        .collect()
}

#[test]
fn synthetic_sentences_match_tier_math() {
    let scorer = RelevanceScorer::builtin().expect("builtin terms");
    let show = std::env::var("SHOW_ROWS").ok().as_deref() == Some("1");
    let mut failures = String::new();

    for case in build_cases(42, 150) {
        let a = scorer.analyze(&case.text);
        if show {
            println!("{:>2} {:>2} | {}", case.expect_score, a.score, case.text);
        }
        if a.score != case.expect_score || a.is_relevant != (case.expect_score >= 3) {
            let _ = writeln!(
                failures,
                "expected {} got {} (relevant={}) :: {}",
                case.expect_score, a.score, a.is_relevant, case.text
            );
        }
        assert!(a.confidence <= 100);
    }

    assert!(failures.is_empty(), "mismatches:\n{failures}");
}

#[test]
fn adding_a_high_term_never_lowers_the_score() {
    let scorer = RelevanceScorer::builtin().expect("builtin terms");
    for case in build_cases(7, 60) {
        let before = scorer.analyze(&case.text).score;
        let after = scorer.analyze(&format!("{} programming", case.text)).score;
        assert!(after >= before, "{before} -> {after} :: {}", case.text);
    }
}

#[test]
fn same_text_scores_identically_across_scorers() {
    let a = RelevanceScorer::builtin().expect("builtin terms");
    let b = RelevanceScorer::builtin().expect("builtin terms");
    for case in build_cases(99, 40) {
        assert_eq!(a.analyze(&case.text), b.analyze(&case.text));
    }
}

#[test]
fn terms_can_be_loaded_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("terms.toml");
    std::fs::write(
        &path,
        r#"
[relevance]
threshold = 2

[terms]
high = ["zig"]
"#,
    )
    .unwrap();

    let scorer = RelevanceScorer::from_path(&path).unwrap();
    let a = scorer.analyze("Trying Zig for embedded work");
    assert_eq!(a.score, 3);
    assert!(a.is_relevant);
    // Built-in terms are not merged in.
    assert_eq!(scorer.analyze("rust and python").score, 0);
}
