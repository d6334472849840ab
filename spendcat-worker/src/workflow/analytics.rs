//! Distribution analytics over a consolidated job

use serde::{Deserialize, Serialize};
use spendcat_common::{text, Level};
use std::collections::{BTreeMap, HashMap};

use crate::models::{MatchStatus, Outcome};

/// Entries kept per ranking
pub const TOP_N: usize = 20;
/// Cumulative share up to which a category is class A
pub const PARETO_CLASS_A: f64 = 0.80;
/// Cumulative share up to which a category is class B
pub const PARETO_CLASS_B: f64 = 0.95;
/// Gap words must be longer than this
pub const MIN_GAP_WORD_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParetoClass {
    A,
    B,
    C,
}

impl ParetoClass {
    fn from_cumulative(share: f64) -> Self {
        if share <= PARETO_CLASS_A {
            ParetoClass::A
        } else if share <= PARETO_CLASS_B {
            ParetoClass::B
        } else {
            ParetoClass::C
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoEntry {
    pub value: String,
    pub count: usize,
    pub share: f64,
    pub cumulative_share: f64,
    pub class: ParetoClass,
}

/// Frequent word among unmatched descriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapWord {
    pub word: String,
    pub count: usize,
}

/// Frequent set of ambiguous options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityCombo {
    pub options: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub unique: usize,
    pub ambiguous: usize,
    pub unmatched: usize,
    pub error: usize,
    pub needs_review: usize,
}

/// level → status → value → count
pub type Distribution = BTreeMap<String, BTreeMap<String, BTreeMap<String, usize>>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    pub summary: StatusSummary,
    pub distribution: Distribution,
    /// level → top entries
    pub pareto: BTreeMap<String, Vec<ParetoEntry>>,
    pub gaps: Vec<GapWord>,
    pub ambiguity: Vec<AmbiguityCombo>,
}

/// Compute analytics; `descriptions[i]` belongs to `outcomes[i]`
pub fn compute(outcomes: &[Outcome], descriptions: &[String]) -> Analytics {
    Analytics {
        summary: summarize(outcomes),
        distribution: distribution(outcomes),
        pareto: Level::ALL
            .into_iter()
            .map(|level| (level.to_string(), pareto(outcomes, level)))
            .collect(),
        gaps: gaps(outcomes, descriptions),
        ambiguity: ambiguity(outcomes),
    }
}

pub fn summarize(outcomes: &[Outcome]) -> StatusSummary {
    let mut summary = StatusSummary {
        total: outcomes.len(),
        ..StatusSummary::default()
    };
    for outcome in outcomes {
        match outcome.status {
            MatchStatus::Unique => summary.unique += 1,
            MatchStatus::Ambiguous => summary.ambiguous += 1,
            MatchStatus::Unmatched => summary.unmatched += 1,
            MatchStatus::Error => summary.error += 1,
        }
        if outcome.needs_review() {
            summary.needs_review += 1;
        }
    }
    summary
}

fn distribution(outcomes: &[Outcome]) -> Distribution {
    let mut result = Distribution::new();
    for level in Level::ALL {
        let by_status = result.entry(level.to_string()).or_default();
        for outcome in outcomes {
            let value = outcome.path.get(level).trim();
            if value.is_empty() {
                continue;
            }
            *by_status
                .entry(outcome.status.to_string())
                .or_default()
                .entry(value.to_string())
                .or_default() += 1;
        }
    }
    result
}

/// Count desc, then value asc; at most `TOP_N`
fn ranked(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn pareto(outcomes: &[Outcome], level: Level) -> Vec<ParetoEntry> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for outcome in outcomes {
        let value = outcome.path.get(level).trim();
        if !value.is_empty() {
            *counts.entry(value.to_string()).or_default() += 1;
        }
    }
    let total: usize = counts.values().sum();
    if total == 0 {
        return Vec::new();
    }

    let mut running = 0;
    ranked(counts)
        .into_iter()
        .take(TOP_N)
        .map(|(value, count)| {
            running += count;
            let cumulative_share = running as f64 / total as f64;
            ParetoEntry {
                value,
                count,
                share: count as f64 / total as f64,
                cumulative_share,
                class: ParetoClass::from_cumulative(cumulative_share),
            }
        })
        .collect()
}

fn gaps(outcomes: &[Outcome], descriptions: &[String]) -> Vec<GapWord> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (outcome, description) in outcomes.iter().zip(descriptions) {
        if outcome.status != MatchStatus::Unmatched {
            continue;
        }
        for word in text::normalize(description).split(' ') {
            if word.chars().count() > MIN_GAP_WORD_CHARS {
                *counts.entry(word.to_string()).or_default() += 1;
            }
        }
    }
    ranked(counts)
        .into_iter()
        .take(TOP_N)
        .map(|(word, count)| GapWord { word, count })
        .collect()
}

fn ambiguity(outcomes: &[Outcome]) -> Vec<AmbiguityCombo> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for outcome in outcomes.iter().filter(|o| o.status == MatchStatus::Ambiguous) {
        let combo = if outcome.ambiguous_options.is_empty() {
            outcome.path.n4.clone()
        } else {
            outcome.ambiguous_options.join(" | ")
        };
        if !combo.is_empty() {
            *counts.entry(combo).or_default() += 1;
        }
    }
    ranked(counts)
        .into_iter()
        .take(TOP_N)
        .map(|(options, count)| AmbiguityCombo { options, count })
        .collect()
}
