//! Chunk processor
//!
//! One chunk, start to finish:
//! 1. skip if its result already exists (no LLM spend on reprocessing)
//! 2. local pass (model + dictionary) on a blocking thread
//! 3. one batched LLM call for the distinct unresolved descriptions
//! 4. reconciliation of LLM rows against the job's taxonomy
//! 5. write the result artifact once

use spendcat_common::HierarchyLookup;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::classify::engine::{outcome_from_guess, DecisionEngine};
use crate::error::{WorkerError, WorkerResult};
use crate::llm::{LlmClassifier, LlmContext};
use crate::models::{description_of, ChunkResult, MatchStatus, Outcome, Source};
use crate::reconcile::{reconcile_all, ReconcileStats};
use crate::store::JobStore;

/// Everything a worker needs about its job, built once per job per tick
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub description_column: String,
    pub engine: DecisionEngine,
    /// Sector, client context and taxonomy hints for the LLM
    pub llm_context: LlmContext,
}

impl JobContext {
    pub fn lookup(&self) -> Option<&HierarchyLookup> {
        self.llm_context.taxonomy.as_deref()
    }
}

/// What happened to one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkStats {
    pub chunk_index: usize,
    /// Result already existed; nothing was done
    pub skipped: bool,
    pub rows: usize,
    pub local_resolved: usize,
    pub local_errors: usize,
    /// Distinct descriptions sent to the LLM
    pub llm_items: usize,
    pub llm_calls: usize,
    /// Rows upgraded by the LLM answer
    pub llm_resolved: usize,
    pub reconcile: ReconcileStats,
}

/// Runs the per-chunk pipeline against the job store
pub struct ChunkProcessor {
    store: JobStore,
    llm: Arc<dyn LlmClassifier>,
}

impl ChunkProcessor {
    pub fn new(store: JobStore, llm: Arc<dyn LlmClassifier>) -> Self {
        Self { store, llm }
    }

    pub async fn process(&self, ctx: &JobContext, chunk_index: usize) -> WorkerResult<ChunkStats> {
        let job_id = ctx.job_id.as_str();
        let mut stats = ChunkStats {
            chunk_index,
            ..ChunkStats::default()
        };

        if self.store.result_exists(job_id, chunk_index) {
            debug!(job_id, chunk_index, "Chunk already has a result, skipping");
            stats.skipped = true;
            return Ok(stats);
        }

        let rows = self.store.read_chunk(job_id, chunk_index)?;
        let descriptions: Vec<String> = rows
            .iter()
            .map(|row| description_of(row, &ctx.description_column))
            .collect();
        stats.rows = rows.len();

        // Open sectors go straight to the LLM
        let mut outcomes = if ctx.engine.is_open_sector() {
            vec![Outcome::unmatched(0.0); descriptions.len()]
        } else {
            local_pass(ctx.engine.clone(), descriptions.clone()).await?
        };
        stats.local_errors = outcomes.iter().filter(|o| o.status == MatchStatus::Error).count();
        stats.local_resolved = outcomes.iter().filter(|o| !o.is_unresolved()).count();

        // Distinct unresolved descriptions, first-seen order
        let mut pending: Vec<String> = Vec::new();
        let mut rows_by_text: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, (outcome, description)) in outcomes.iter().zip(&descriptions).enumerate() {
            let text = description.trim();
            if !outcome.is_unresolved() || text.is_empty() {
                continue;
            }
            let entry = rows_by_text.entry(text.to_string()).or_default();
            if entry.is_empty() {
                pending.push(text.to_string());
            }
            entry.push(idx);
        }

        if !pending.is_empty() && self.llm.is_enabled() {
            stats.llm_items = pending.len();
            stats.llm_calls = 1;
            let guesses = self.llm.classify(&pending, &ctx.llm_context).await;
            for (text, guess) in pending.iter().zip(guesses) {
                if guess.is_placeholder() {
                    continue;
                }
                for &idx in rows_by_text.get(text).map(Vec::as_slice).unwrap_or_default() {
                    outcomes[idx] = outcome_from_guess(guess.clone(), Source::LlmBatch);
                    stats.llm_resolved += 1;
                }
            }
        }

        if let Some(lookup) = ctx.lookup() {
            stats.reconcile = reconcile_all(&mut outcomes, lookup, ctx.engine.config().fuzzy_cutoff);
        }

        let result = ChunkResult {
            chunk_index,
            outcomes,
        };
        if !self.store.mark_chunk_done(job_id, chunk_index, &result)? {
            debug!(job_id, chunk_index, "Result written concurrently, keeping existing artifact");
        }

        debug!(
            job_id,
            chunk_index,
            rows = stats.rows,
            local_resolved = stats.local_resolved,
            llm_items = stats.llm_items,
            llm_resolved = stats.llm_resolved,
            "Chunk processed"
        );
        Ok(stats)
    }
}

/// Model and dictionary over every row, off the async runtime
async fn local_pass(engine: DecisionEngine, descriptions: Vec<String>) -> WorkerResult<Vec<Outcome>> {
    tokio::task::spawn_blocking(move || {
        descriptions
            .iter()
            .map(|description| match engine.classify_local(description) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(sector = engine.sector(), error = %e, "Row classification failed");
                    Outcome::error(e.to_string())
                }
            })
            .collect()
    })
    .await
    .map_err(|e| WorkerError::Other(anyhow::anyhow!("local classification task failed: {}", e)))
}
