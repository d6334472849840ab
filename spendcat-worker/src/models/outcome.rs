//! Per-row classification outcome

use serde::{Deserialize, Serialize};
use spendcat_common::{CategoryPath, Level};
use std::fmt;

/// Outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    /// One confident category
    Unique,
    /// Several divergent candidates
    Ambiguous,
    /// No resolvable category
    Unmatched,
    /// Local classification failed for this row
    Error,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Unique => "Unique",
            MatchStatus::Ambiguous => "Ambiguous",
            MatchStatus::Unmatched => "Unmatched",
            MatchStatus::Error => "Error",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage that produced the category fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    None,
    Dictionary,
    Model,
    /// Single-item LLM call from the decision engine
    Llm,
    /// Batched LLM pass of the chunk processor
    LlmBatch,
}

impl Source {
    pub fn is_llm(&self) -> bool {
        matches!(self, Source::Llm | Source::LlmBatch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::None => "None",
            Source::Dictionary => "Dictionary",
            Source::Model => "ML",
            Source::Llm => "LLM",
            Source::LlmBatch => "LLM (batch)",
        }
    }
}

/// How an LLM path was reconciled against a client taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    ExactPath,
    LevelShift,
    PartialFuzzy,
    LeafReverse,
    /// No evidence found; raw answer kept
    Unvalidated,
}

impl Reconciliation {
    pub fn tag(&self) -> &'static str {
        match self {
            Reconciliation::ExactPath => "[validated]",
            Reconciliation::LevelShift => "[shift-corrected]",
            Reconciliation::PartialFuzzy => "[fuzzy-corrected]",
            Reconciliation::LeafReverse => "[n4-reverse]",
            Reconciliation::Unvalidated => "[unvalidated]",
        }
    }
}

/// Classification of one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: MatchStatus,

    #[serde(flatten)]
    pub path: CategoryPath,

    /// In [0, 1]
    pub confidence: f64,

    pub source: Source,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<Reconciliation>,

    /// First level where ambiguous candidates disagree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambiguity_level: Option<Level>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous_options: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_terms: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Outcome {
    pub fn unique(path: CategoryPath, confidence: f64, source: Source) -> Self {
        Self {
            status: MatchStatus::Unique,
            path,
            confidence: clamp_unit(confidence),
            source,
            reconciliation: None,
            ambiguity_level: None,
            ambiguous_options: Vec::new(),
            matched_terms: Vec::new(),
            explanation: None,
        }
    }

    /// No category; confidence carried from the best prior attempt
    pub fn unmatched(confidence: f64) -> Self {
        Self {
            status: MatchStatus::Unmatched,
            source: Source::None,
            ..Self::unique(CategoryPath::default(), confidence, Source::None)
        }
    }

    /// Local classification failed; the row is still offered to the LLM pass
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: MatchStatus::Error,
            explanation: Some(reason.into()),
            ..Self::unmatched(0.0)
        }
    }

    /// Rows the batched LLM pass should try
    pub fn is_unresolved(&self) -> bool {
        matches!(self.status, MatchStatus::Unmatched | MatchStatus::Error)
    }

    /// Flag for manual review
    pub fn needs_review(&self) -> bool {
        matches!(
            self.status,
            MatchStatus::Ambiguous | MatchStatus::Unmatched | MatchStatus::Error
        ) || self.reconciliation == Some(Reconciliation::Unvalidated)
    }

    /// Source label with reconciliation tag, e.g. `LLM (batch) [shift-corrected]`
    pub fn source_label(&self) -> String {
        match self.reconciliation {
            Some(r) => format!("{} {}", self.source.as_str(), r.tag()),
            None => self.source.as_str().to_string(),
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
