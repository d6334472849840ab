//! Tick scheduler
//!
//! One tick owns every job-state mutation. Per tick:
//! 1. fail PROCESSING jobs older than the staleness threshold
//! 2. promote PENDING jobs, build one [`JobContext`] per job
//! 3. run round-robin batches of chunks until nothing is left or the time
//!    budget is spent; refresh progress from the result count on disk after
//!    each batch
//! 4. consolidate every active job whose results are all present
//!
//! Chunk workers only write their own result artifact; `job.json` is written
//! here, between batches.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use spendcat_common::events::{EventBus, JobEvent};
use spendcat_common::{time, HierarchyLookup};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::consolidate::consolidate;
use super::processor::{ChunkProcessor, JobContext};
use crate::classify::{DecisionEngine, ResourceRegistry};
use crate::config::{ClassificationConfig, SchedulerConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::llm::{LlmClassifier, LlmContext};
use crate::models::{Job, JobStatus};
use crate::store::JobStore;
use crate::taxonomy_loader::decode_taxonomy;

/// Counters for one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub jobs_seen: usize,
    pub jobs_started: usize,
    pub stale_failed: usize,
    pub batches: usize,
    pub chunks_processed: usize,
    pub chunks_skipped: usize,
    pub jobs_failed: usize,
    pub jobs_completed: usize,
    /// Budget ran out with chunks still queued
    pub budget_exhausted: bool,
    pub elapsed_ms: u64,
}

/// A job being worked on during one tick
struct ActiveJob {
    job: Job,
    ctx: Arc<JobContext>,
    failed: bool,
}

pub struct Scheduler {
    store: JobStore,
    config: SchedulerConfig,
    classification: ClassificationConfig,
    registry: Arc<ResourceRegistry>,
    processor: Arc<ChunkProcessor>,
    events: EventBus,
}

impl Scheduler {
    pub fn new(
        store: JobStore,
        config: SchedulerConfig,
        classification: ClassificationConfig,
        registry: Arc<ResourceRegistry>,
        llm: Arc<dyn LlmClassifier>,
        events: EventBus,
    ) -> Self {
        let processor = Arc::new(ChunkProcessor::new(store.clone(), llm));
        Self {
            store,
            config,
            classification,
            registry,
            processor,
            events,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run ticks every `tick_interval` until `cancel` fires
    ///
    /// A tick in progress always runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.tick_interval().max(Duration::from_secs(1));
        info!(
            interval_secs = period.as_secs(),
            max_parallel_chunks = self.config.max_parallel_chunks,
            time_budget_secs = self.config.time_budget_secs,
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.run_tick().await {
                error!(error = %e, "Tick failed");
            }
            if let Err(e) = self.purge_expired() {
                warn!(error = %e, "Retention sweep failed");
            }
        }
    }

    pub async fn run_tick(&self) -> WorkerResult<TickReport> {
        self.run_tick_at(Utc::now()).await
    }

    /// One tick, with `now` used for the staleness sweep
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> WorkerResult<TickReport> {
        let started = Instant::now();
        let mut report = TickReport::default();

        let mut jobs = Vec::new();
        for job in self.store.list_active()? {
            report.jobs_seen += 1;
            if let Some(active) = self.sweep_or_start(job, now, &mut report) {
                jobs.push(active);
            }
        }

        let mut queues: Vec<VecDeque<usize>> = Vec::with_capacity(jobs.len());
        for active in &mut jobs {
            match self.store.done_chunks(&active.job.id) {
                Ok(done) => queues.push((0..active.job.total_chunks).filter(|i| !done.contains(i)).collect()),
                Err(e) => {
                    self.fail_job(&mut active.job, format!("listing results: {}", e), &mut report);
                    active.failed = true;
                    queues.push(VecDeque::new());
                }
            }
        }

        let budget = self.config.time_budget();
        loop {
            let batch = round_robin_batch(&mut queues, self.config.max_parallel_chunks);
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            self.run_batch(&batch, &mut jobs, &mut queues, &mut report).await;

            if started.elapsed() >= budget {
                report.budget_exhausted = queues.iter().any(|q| !q.is_empty());
                if report.budget_exhausted {
                    info!(budget_secs = budget.as_secs(), "Tick budget spent, remaining chunks wait for the next tick");
                }
                break;
            }
        }

        self.consolidate_ready(&mut report).await?;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.events.emit_lossy(JobEvent::TickFinished {
            jobs_seen: report.jobs_seen,
            chunks_processed: report.chunks_processed,
            jobs_failed: report.jobs_failed,
            jobs_completed: report.jobs_completed,
            elapsed_ms: report.elapsed_ms,
            timestamp: time::now(),
        });
        info!(
            jobs_seen = report.jobs_seen,
            batches = report.batches,
            chunks_processed = report.chunks_processed,
            jobs_failed = report.jobs_failed,
            jobs_completed = report.jobs_completed,
            elapsed_ms = report.elapsed_ms,
            "Tick finished"
        );
        Ok(report)
    }

    /// Delete terminal jobs past the retention window
    pub fn purge_expired(&self) -> WorkerResult<usize> {
        // Capped at a century; chrono panics on out-of-range durations
        let hours = self.config.retention_hours.min(24 * 365 * 100) as i64;
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        Ok(self.store.purge_expired(cutoff)?)
    }

    /// Staleness check, then PENDING → PROCESSING; `None` if the job is done for this tick
    fn sweep_or_start(&self, mut job: Job, now: DateTime<Utc>, report: &mut TickReport) -> Option<ActiveJob> {
        if job.status == JobStatus::Processing
            && time::is_older_than(job.created_at, now, self.config.stale_after_secs)
        {
            let age = time::elapsed_secs(job.created_at, now);
            warn!(job_id = %job.id, age_secs = age, "Job stale, failing it");
            report.stale_failed += 1;
            self.fail_job(
                &mut job,
                format!(
                    "Job stale: PROCESSING for {} seconds (limit {})",
                    age, self.config.stale_after_secs
                ),
                report,
            );
            return None;
        }

        if job.status == JobStatus::Pending {
            job.transition_to(JobStatus::Processing);
            if let Err(e) = self.store.write_status(&job) {
                error!(job_id = %job.id, error = %e, "Failed to persist job start");
                return None;
            }
            report.jobs_started += 1;
            info!(job_id = %job.id, sector = %job.sector, total_chunks = job.total_chunks, "Job started");
            self.events.emit_lossy(JobEvent::JobStarted {
                job_id: job.id.clone(),
                total_chunks: job.total_chunks,
                timestamp: time::now(),
            });
        }

        let ctx = Arc::new(self.build_context(&job));
        Some(ActiveJob {
            job,
            ctx,
            failed: false,
        })
    }

    /// Resources, engine and taxonomy lookup for one job
    fn build_context(&self, job: &Job) -> JobContext {
        let resources = self.registry.get(&job.sector);
        let taxonomy = if job.has_custom_taxonomy {
            self.load_taxonomy(&job.id).map(Arc::new)
        } else {
            None
        };

        JobContext {
            job_id: job.id.clone(),
            description_column: job.description_column.clone(),
            engine: DecisionEngine::new(self.classification.clone(), resources),
            llm_context: LlmContext {
                sector: job.sector.clone(),
                client_context: job.client_context.clone(),
                taxonomy,
            },
        }
    }

    /// Decode the job's taxonomy; failures degrade to "no taxonomy"
    fn load_taxonomy(&self, job_id: &str) -> Option<HierarchyLookup> {
        let payload = match self.store.read_taxonomy_payload(job_id) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                warn!(job_id, error = %e, "Custom taxonomy unreadable, continuing without it");
                return None;
            }
        };
        match decode_taxonomy(&payload) {
            Ok(entries) if !entries.is_empty() => {
                let lookup = HierarchyLookup::new(&entries);
                debug!(job_id, entries = lookup.len(), "Custom taxonomy loaded");
                Some(lookup)
            }
            Ok(_) => {
                warn!(job_id, "Custom taxonomy has no usable rows, continuing without it");
                None
            }
            Err(e) => {
                warn!(job_id, error = %e, "Custom taxonomy invalid, continuing without it");
                None
            }
        }
    }

    /// Process one batch concurrently, then write progress for the touched jobs
    async fn run_batch(
        &self,
        batch: &[(usize, usize)],
        jobs: &mut [ActiveJob],
        queues: &mut [VecDeque<usize>],
        report: &mut TickReport,
    ) {
        let handles: Vec<_> = batch
            .iter()
            .map(|&(slot, chunk_index)| {
                let processor = Arc::clone(&self.processor);
                let ctx = Arc::clone(&jobs[slot].ctx);
                let handle = tokio::spawn(async move { processor.process(&ctx, chunk_index).await });
                (slot, chunk_index, handle)
            })
            .collect();

        // Per job: completed chunk indices and the first failure
        let mut completed: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut failures: BTreeMap<usize, String> = BTreeMap::new();

        for (slot, chunk_index, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(WorkerError::Other(anyhow::anyhow!("worker task aborted: {}", e))),
            };
            match outcome {
                Ok(stats) => {
                    if stats.skipped {
                        report.chunks_skipped += 1;
                    } else {
                        report.chunks_processed += 1;
                    }
                    completed.entry(slot).or_default().push(chunk_index);
                }
                Err(e) => {
                    error!(job_id = %jobs[slot].job.id, chunk_index, error = %e, "Chunk failed");
                    failures
                        .entry(slot)
                        .or_insert_with(|| format!("chunk {}: {}", chunk_index, e));
                }
            }
        }

        for (slot, message) in failures {
            let active = &mut jobs[slot];
            if active.failed {
                continue;
            }
            active.failed = true;
            queues[slot].clear();
            self.fail_job(&mut active.job, message, report);
        }

        for (slot, chunks) in completed {
            let active = &mut jobs[slot];
            if active.failed {
                continue;
            }
            let count = match self.store.count_results(&active.job.id) {
                Ok(count) => count,
                Err(e) => {
                    warn!(job_id = %active.job.id, error = %e, "Could not count results");
                    continue;
                }
            };
            active.job.set_processed(count);
            if let Err(e) = self.store.write_status(&active.job) {
                error!(job_id = %active.job.id, error = %e, "Failed to persist progress");
                continue;
            }
            for chunk_index in chunks {
                self.events.emit_lossy(JobEvent::ChunkCompleted {
                    job_id: active.job.id.clone(),
                    chunk_index,
                    processed_chunks: active.job.processed_chunks,
                    total_chunks: active.job.total_chunks,
                    timestamp: time::now(),
                });
            }
            debug!(
                job_id = %active.job.id,
                processed_chunks = active.job.processed_chunks,
                total_chunks = active.job.total_chunks,
                "Progress updated"
            );
        }
    }

    /// Consolidate every PROCESSING job whose results are all on disk
    async fn consolidate_ready(&self, report: &mut TickReport) -> WorkerResult<()> {
        for mut job in self.store.list_active()? {
            if job.status != JobStatus::Processing {
                continue;
            }
            let count = match self.store.count_results(&job.id) {
                Ok(count) => count,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Could not count results");
                    continue;
                }
            };
            if count < job.total_chunks {
                continue;
            }

            let store = self.store.clone();
            let snapshot = job.clone();
            let result = tokio::task::spawn_blocking(move || consolidate(&store, &snapshot))
                .await
                .unwrap_or_else(|e| Err(WorkerError::Other(anyhow::anyhow!("consolidation task aborted: {}", e))));

            match result {
                Ok(artifact) => {
                    job = artifact.job;
                    if let Err(e) = self.store.write_status(&job) {
                        error!(job_id = %job.id, error = %e, "Failed to persist completion");
                        continue;
                    }
                    if let Err(e) = self.store.purge(&job.id) {
                        warn!(job_id = %job.id, error = %e, "Purge after consolidation failed");
                    }
                    report.jobs_completed += 1;
                    info!(job_id = %job.id, total_rows = job.total_rows, "Job completed");
                    self.events.emit_lossy(JobEvent::JobCompleted {
                        job_id: job.id.clone(),
                        total_rows: job.total_rows,
                        timestamp: time::now(),
                    });
                }
                Err(e) => {
                    self.fail_job(&mut job, e.to_string(), report);
                }
            }
        }
        Ok(())
    }

    fn fail_job(&self, job: &mut Job, message: String, report: &mut TickReport) {
        error!(job_id = %job.id, error = %message, "Job failed");
        if let Ok(count) = self.store.count_results(&job.id) {
            job.set_processed(count);
        }
        job.fail(message.clone());
        if let Err(e) = self.store.write_status(job) {
            error!(job_id = %job.id, error = %e, "Failed to persist job failure");
        }
        report.jobs_failed += 1;
        self.events.emit_lossy(JobEvent::JobFailed {
            job_id: job.id.clone(),
            error: message,
            timestamp: time::now(),
        });
    }
}

/// Take at most one chunk per job per round until `cap` is reached
///
/// Returns `(job slot, chunk index)` pairs in assignment order.
pub fn round_robin_batch(queues: &mut [VecDeque<usize>], cap: usize) -> Vec<(usize, usize)> {
    let mut batch = Vec::new();
    while batch.len() < cap {
        let mut took = false;
        for (slot, queue) in queues.iter_mut().enumerate() {
            if batch.len() >= cap {
                break;
            }
            if let Some(chunk) = queue.pop_front() {
                batch.push((slot, chunk));
                took = true;
            }
        }
        if !took {
            break;
        }
    }
    batch
}
