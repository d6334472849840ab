//! # spendcat-worker
//!
//! Asynchronous chunked classification of procurement line items into a
//! four-level category hierarchy.
//!
//! Jobs are submitted to a file-backed [`store::JobStore`], split into
//! chunks, and driven to completion by periodic ticks of the
//! [`workflow::Scheduler`]. Each chunk goes through local classification
//! (keyword dictionary and statistical model), one batched LLM pass for what
//! stays unresolved, and reconciliation against the client's own taxonomy.

pub mod classify;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod taxonomy_loader;
pub mod workflow;

pub use error::{WorkerError, WorkerResult};
