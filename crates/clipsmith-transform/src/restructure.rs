//! Zero-cost predicate deciding whether an item is worth an AI restructure call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use clipsmith_core::CandidateItem;

use crate::lexicon::count_fillers;

const LONG_WORD_CHARS: usize = 4;
const REPEAT_LIMIT: usize = 3;
const REPEATED_WORDS_LIMIT: usize = 2;
const SLOW_MIN_DURATION: f64 = 90.0;
const SLOW_WORDS_PER_SEC: f64 = 2.0;
const SLOW_SEVERITY: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum RestructureIssue {
    HighFillerDensity { density: f64 },
    Repetition { words: Vec<String> },
    SlowPacing { words_per_sec: f64 },
}

impl RestructureIssue {
    pub fn severity(&self) -> f64 {
        match self {
            Self::HighFillerDensity { density } => density.min(1.0),
            Self::Repetition { words } => (words.len() as f64 / 10.0).min(1.0),
            Self::SlowPacing { .. } => SLOW_SEVERITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestructureAnalysis {
    pub word_count: usize,
    pub filler_density: f64,
    pub issues: Vec<RestructureIssue>,
    /// Mean of the issue severities, 0 without issues.
    pub severity: f64,
    pub needs_restructure: bool,
}

/// Inspect filler density, repetition of long words, and pacing.
pub fn analyze(item: &CandidateItem, threshold: f64) -> RestructureAnalysis {
    let text = item.full_text();
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    let word_count = words.len();

    let filler_density = if word_count == 0 {
        0.0
    } else {
        count_fillers(&text) as f64 / word_count as f64
    };

    let mut issues = Vec::new();
    if filler_density > threshold {
        issues.push(RestructureIssue::HighFillerDensity {
            density: filler_density,
        });
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for w in words.iter().filter(|w| w.chars().count() > LONG_WORD_CHARS) {
        *counts.entry(w.as_str()).or_default() += 1;
    }
    let mut repeated: Vec<String> = counts
        .into_iter()
        .filter(|(_, n)| *n > REPEAT_LIMIT)
        .map(|(w, _)| w.to_string())
        .collect();
    if repeated.len() > REPEATED_WORDS_LIMIT {
        repeated.sort();
        issues.push(RestructureIssue::Repetition { words: repeated });
    }

    let duration = item.span().duration();
    if duration > SLOW_MIN_DURATION {
        let words_per_sec = word_count as f64 / duration;
        if words_per_sec < SLOW_WORDS_PER_SEC {
            issues.push(RestructureIssue::SlowPacing { words_per_sec });
        }
    }

    let severity = if issues.is_empty() {
        0.0
    } else {
        issues.iter().map(RestructureIssue::severity).sum::<f64>() / issues.len() as f64
    };

    RestructureAnalysis {
        word_count,
        filler_density,
        needs_restructure: !issues.is_empty() && severity > threshold,
        issues,
        severity,
    }
}

pub fn needs_restructure(item: &CandidateItem, threshold: f64) -> bool {
    analyze(item, threshold).needs_restructure
}
