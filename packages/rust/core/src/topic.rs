//! Topic normalization, hashing and validation.
//!
//! The normalized topic is the dedup identity: two topics that differ only in
//! case, spacing, emoji, punctuation at the edges or arrow style share a hash.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// The canonical separator between topic parts.
pub const ARROW: char = '→';

/// Words that carry no meaning on their own in a topic segment.
const VAGUE_TERMS: &[&str] = &["mejora", "optimiza", "mejor", "bueno", "buena"];

/// Markers that make a damage segment concrete.
const CONSEQUENCE_MARKERS: &[&str] = &[
    "pierdes", "pierde", "pierden", "reduce", "reduces", "reducen", "aumenta", "aumentan",
    "causa", "causan", "provoca", "provocan", "mata", "matan", "destruye", "destruyen", "%",
    "porcentaje",
];

static ASCII_ARROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-=]+\s*>").expect("valid regex"));

static EMOJI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        "[",
        r"\x{1F600}-\x{1F64F}",
        r"\x{1F300}-\x{1F5FF}",
        r"\x{1F680}-\x{1F6FF}",
        r"\x{1F1E0}-\x{1F1FF}",
        r"\x{2702}-\x{27B0}",
        r"\x{24C2}-\x{1F251}",
        "]+"
    ))
    .expect("valid regex")
});

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static ARROW_SPACING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*→\s*").expect("valid regex"));

static EDGE_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\w→]+|[^\w→]+$").expect("valid regex"));

/// Canonical form of a topic. Idempotent.
pub fn normalize(topic: &str) -> String {
    let lowered = topic.to_lowercase();
    let arrows = ASCII_ARROW_RE.replace_all(&lowered, "→");
    let arrows = arrows.replace(['➜', '➡'], "→");
    let no_emoji = EMOJI_RE.replace_all(&arrows, "");
    let collapsed = WHITESPACE_RE.replace_all(no_emoji.trim(), " ");
    let spaced = ARROW_SPACING_RE.replace_all(&collapsed, " → ");
    let trimmed = EDGE_PUNCT_RE.replace_all(spaced.trim(), "");
    trimmed.trim().to_string()
}

/// Hex SHA-256 of [`normalize`]`(topic)`.
pub fn hash(topic: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(topic).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A normalized topic broken at its separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    /// The error (3-part) or problem (2-part) half.
    pub problem: String,
    /// Present only in the three-part form.
    pub damage: Option<String>,
    /// Empty when the topic has no separator.
    pub solution: String,
}

impl TopicParts {
    pub fn part_count(&self) -> usize {
        match (&self.damage, self.solution.is_empty()) {
            (Some(_), _) => 3,
            (None, false) => 2,
            (None, true) => 1,
        }
    }
}

/// Split a topic into normalized parts.
///
/// Two or more separators give `(error, damage, solution)`, with anything
/// past the second separator kept in the solution. One separator gives
/// `(problem, None, solution)`. None gives `(whole, None, "")`.
pub fn split(topic: &str) -> TopicParts {
    let normalized = normalize(topic);
    let mut parts = normalized.splitn(3, ARROW).map(|p| p.trim().to_string());
    let first = parts.next().unwrap_or_default();
    match (parts.next(), parts.next()) {
        (Some(damage), Some(solution)) => TopicParts {
            problem: first,
            damage: Some(damage),
            solution,
        },
        (Some(solution), None) => TopicParts {
            problem: first,
            damage: None,
            solution,
        },
        _ => TopicParts {
            problem: first,
            damage: None,
            solution: String::new(),
        },
    }
}

/// Number of separators in the normalized topic.
pub fn separator_count(topic: &str) -> usize {
    normalize(topic).matches(ARROW).count()
}

/// Check a topic against the separator form rules.
///
/// Accepts `"Problema → Solución"` and `"Error → Daño → Solución"`. The
/// error names the failing segment.
pub fn validate(topic: &str) -> std::result::Result<(), String> {
    if topic.trim().is_empty() {
        return Err("topic is empty".into());
    }
    if !normalize(topic).contains(ARROW) {
        return Err(format!(
            "topic must contain {ARROW}. Format: 'Error {ARROW} Daño concreto {ARROW} Solución' \
             or 'Problema {ARROW} Solución'"
        ));
    }

    let parts = split(topic);
    match &parts.damage {
        Some(damage) => {
            min_len("error", &parts.problem, 8)?;
            min_len("damage", damage, 10)?;
            min_len("solution", &parts.solution, 8)?;
            if !is_concrete(damage) && char_len(damage) < 15 {
                return Err(format!(
                    "damage part should be concrete: '{damage}'. Include numbers, percentages \
                     or a consequence, e.g. 'pierdes 40% de agua'"
                ));
            }
            not_vague("error", &parts.problem)?;
            not_vague("solution", &parts.solution)?;
        }
        None => {
            min_len("problem", &parts.problem, 10)?;
            min_len("solution", &parts.solution, 8)?;
            not_vague("problem", &parts.problem)?;
            not_vague("solution", &parts.solution)?;
        }
    }
    Ok(())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn min_len(name: &str, segment: &str, min: usize) -> std::result::Result<(), String> {
    let len = char_len(segment);
    if len < min {
        return Err(format!(
            "{name} part too short ({len} chars, minimum {min}): '{segment}'"
        ));
    }
    Ok(())
}

fn is_concrete(damage: &str) -> bool {
    damage.chars().any(|c| c.is_ascii_digit())
        || CONSEQUENCE_MARKERS.iter().any(|m| damage.contains(m))
}

fn not_vague(name: &str, segment: &str) -> std::result::Result<(), String> {
    let words: HashSet<&str> = segment.split_whitespace().collect();
    if words.iter().all(|w| VAGUE_TERMS.contains(w)) {
        return Err(format!(
            "{name} part is too vague (only generic terms): '{segment}'"
        ));
    }
    Ok(())
}
