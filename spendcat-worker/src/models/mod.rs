//! Data models for jobs, chunks and classification outcomes

pub mod job;
pub mod outcome;

pub use job::{Job, JobStatus, StatusTransition, Submission};
pub use outcome::{MatchStatus, Outcome, Reconciliation, Source};

use serde::{Deserialize, Serialize};

/// One input row: arbitrary named fields
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A contiguous slice of input rows (`chunks/NNNNN.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_index: usize,
    pub rows: Vec<Row>,
}

/// Outcomes for one chunk, in row order (`results/NNNNN.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub outcomes: Vec<Outcome>,
}

/// Text of the description column, empty when absent
pub fn description_of(row: &Row, column: &str) -> String {
    match row.get(column) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
