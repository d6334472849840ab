//! Job state machine
//!
//! PENDING → PROCESSING → COMPLETED, with ERROR reachable from any
//! non-terminal state. Terminal states are never left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::Row;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Written by the submission side, not yet seen by a tick
    Pending,
    /// Chunks are being classified
    Processing,
    /// Consolidated; final artifact available
    Completed,
    /// Failed; `Job::error` carries the reason
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub job_id: String,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// Job metadata (`job.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique id
    pub id: String,

    pub status: JobStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Sector label selecting dictionary and model
    pub sector: String,

    /// Name of the column holding the item description
    pub description_column: String,

    /// Input column order, used for the flat export
    #[serde(default)]
    pub columns: Vec<String>,

    pub total_rows: usize,

    /// Fixed at creation
    pub total_chunks: usize,

    /// Count of chunk result artifacts, refreshed by the scheduler
    pub processed_chunks: usize,

    #[serde(default)]
    pub client_context: Option<String>,

    #[serde(default)]
    pub has_custom_taxonomy: bool,

    /// Verbatim failure text once in ERROR
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Create a PENDING job sized for `total_rows` split into `chunk_size` slices
    pub fn new(submission: &Submission, chunk_size: usize) -> Self {
        let now = Utc::now();
        let total_rows = submission.rows.len();
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            sector: submission.sector.clone(),
            description_column: submission.description_column.clone(),
            columns: submission.columns(),
            total_rows,
            total_chunks: total_rows.div_ceil(chunk_size.max(1)),
            processed_chunks: 0,
            client_context: submission
                .client_context
                .as_ref()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            has_custom_taxonomy: submission.custom_taxonomy.is_some(),
            error: None,
        }
    }

    /// Transition to new status
    ///
    /// A terminal job keeps its status; the returned transition then records
    /// no change.
    pub fn transition_to(&mut self, new_status: JobStatus) -> StatusTransition {
        let new_status = if self.status.is_terminal() && new_status != self.status {
            warn!(job_id = %self.id, from = ?self.status, to = ?new_status, "Ignoring transition out of terminal state");
            self.status
        } else {
            new_status
        };
        let transition = StatusTransition {
            job_id: self.id.clone(),
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;
        self.updated_at = transition.transitioned_at;
        transition
    }

    /// Move to ERROR recording `error` verbatim; a terminal job is left as is
    pub fn fail(&mut self, error: impl Into<String>) -> StatusTransition {
        if !self.is_terminal() {
            self.error = Some(error.into());
        }
        self.transition_to(JobStatus::Error)
    }

    /// Record the on-disk result count, clamped to the chunk total
    pub fn set_processed(&mut self, count: usize) {
        self.processed_chunks = count.min(self.total_chunks);
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Progress percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            return if self.status == JobStatus::Completed { 100.0 } else { 0.0 };
        }
        (self.processed_chunks as f64 / self.total_chunks as f64) * 100.0
    }
}

/// What the submission side hands to `JobStore::submit`
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub sector: String,
    pub description_column: String,
    pub rows: Vec<Row>,
    /// Base64 spreadsheet or CSV payload
    pub custom_taxonomy: Option<String>,
    pub client_context: Option<String>,
}

impl Submission {
    /// Column names in first-seen order across all rows
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(rows: usize) -> Submission {
        Submission {
            sector: "Varejo".into(),
            description_column: "Descricao".into(),
            rows: (0..rows)
                .map(|i| {
                    json!({"Codigo": i, "Descricao": format!("item {}", i)})
                        .as_object()
                        .cloned()
                        .unwrap()
                })
                .collect(),
            custom_taxonomy: None,
            client_context: Some("  ".into()),
        }
    }

    #[test]
    fn test_terminal_states_are_never_left() {
        let mut job = Job::new(&submission(3), 500);
        job.transition_to(JobStatus::Processing);
        job.fail("chunk 0: boom");

        let t = job.transition_to(JobStatus::Processing);
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(t.old_status, JobStatus::Error);
        assert_eq!(t.new_status, JobStatus::Error);

        job.fail("later failure");
        assert_eq!(job.error.as_deref(), Some("chunk 0: boom"));

        let mut done = Job::new(&submission(1), 500);
        done.transition_to(JobStatus::Processing);
        done.transition_to(JobStatus::Completed);
        done.fail("too late");
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.error.is_none());
    }

    #[test]
    fn test_new_job_chunk_count() {
        assert_eq!(Job::new(&submission(1200), 500).total_chunks, 3);
        assert_eq!(Job::new(&submission(1000), 500).total_chunks, 2);
        assert_eq!(Job::new(&submission(0), 500).total_chunks, 0);
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(&submission(3), 500);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.columns, vec!["Codigo".to_string(), "Descricao".to_string()]);
        assert!(job.client_context.is_none());
        assert!(!job.has_custom_taxonomy);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(JobStatus::Processing).unwrap(), "PROCESSING");
        let s: JobStatus = serde_json::from_value(json!("ERROR")).unwrap();
        assert_eq!(s, JobStatus::Error);
    }

    #[test]
    fn test_fail_records_error() {
        let mut job = Job::new(&submission(3), 500);
        job.transition_to(JobStatus::Processing);
        let t = job.fail("chunk 1 exploded");
        assert_eq!(t.old_status, JobStatus::Processing);
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("chunk 1 exploded"));
        assert!(job.is_terminal());
    }

    #[test]
    fn test_processed_never_exceeds_total() {
        let mut job = Job::new(&submission(1200), 500);
        job.set_processed(7);
        assert_eq!(job.processed_chunks, 3);
        assert_eq!(job.percentage(), 100.0);
    }
}
