//! Job lifecycle events
//!
//! The scheduler publishes progress through an [`EventBus`]. Nothing in the
//! worker depends on a subscriber being present; a status surface or a test
//! can subscribe to observe ticks as they happen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while jobs move through the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// A PENDING job was promoted to PROCESSING
    JobStarted {
        job_id: String,
        total_chunks: usize,
        timestamp: DateTime<Utc>,
    },

    /// One chunk result was persisted
    ChunkCompleted {
        job_id: String,
        chunk_index: usize,
        processed_chunks: usize,
        total_chunks: usize,
        timestamp: DateTime<Utc>,
    },

    /// A job reached ERROR (chunk failure, consolidation failure or staleness)
    JobFailed {
        job_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A job was consolidated and marked COMPLETED
    JobCompleted {
        job_id: String,
        total_rows: usize,
        timestamp: DateTime<Utc>,
    },

    /// One scheduler tick finished
    TickFinished {
        jobs_seen: usize,
        chunks_processed: usize,
        jobs_failed: usize,
        jobs_completed: usize,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Job the event refers to, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::ChunkCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. } => Some(job_id),
            JobEvent::TickFinished { .. } => None,
        }
    }
}

/// Broadcast bus for [`JobEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
