//! Job workflow: chunk processing, the tick scheduler and consolidation

pub mod analytics;
pub mod consolidate;
pub mod processor;
pub mod scheduler;

pub use analytics::{Analytics, StatusSummary};
pub use consolidate::{consolidate, read_final, FinalArtifact, OUTPUT_COLUMNS};
pub use processor::{ChunkProcessor, ChunkStats, JobContext};
pub use scheduler::{round_robin_batch, Scheduler, TickReport};
