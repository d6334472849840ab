//! File-backed job store
//!
//! Layout under the root folder:
//!
//! ```text
//! jobs/<id>/job.json            metadata (rewritten on every status change)
//! jobs/<id>/taxonomy.b64        optional custom taxonomy payload
//! jobs/<id>/chunks/NNNNN.json   input rows, immutable
//! jobs/<id>/results/NNNNN.json  chunk results, written once
//! jobs/<id>/final.json          consolidated artifact
//! jobs/<id>/final.csv           flat export
//! ```
//!
//! Every write goes to `<file>.tmp` first and is renamed into place, so a
//! reader never observes a half-written artifact. The scheduler is the only
//! writer of `job.json` for active jobs; chunk workers only create result
//! files.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use spendcat_common::{Error, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::{Chunk, ChunkResult, Job, Row, Submission};

const JOBS_DIR: &str = "jobs";
const JOB_FILE: &str = "job.json";
const TAXONOMY_FILE: &str = "taxonomy.b64";
const CHUNKS_DIR: &str = "chunks";
const RESULTS_DIR: &str = "results";
pub const FINAL_JSON: &str = "final.json";
pub const FINAL_CSV: &str = "final.csv";

/// Durable job metadata and artifacts
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    /// Open (creating if needed) a store under `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(JOBS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(JOBS_DIR).join(job_id)
    }

    fn chunk_path(&self, job_id: &str, index: usize) -> PathBuf {
        self.job_dir(job_id).join(CHUNKS_DIR).join(artifact_name(index))
    }

    fn result_path(&self, job_id: &str, index: usize) -> PathBuf {
        self.job_dir(job_id).join(RESULTS_DIR).join(artifact_name(index))
    }

    /// Split a submission into chunks and persist it as a PENDING job
    pub fn submit(&self, submission: Submission, chunk_size: usize) -> Result<Job> {
        if chunk_size == 0 {
            return Err(Error::InvalidInput("chunk size must be at least 1".into()));
        }
        let job = Job::new(&submission, chunk_size);
        let chunks = split_into_chunks(submission.rows, chunk_size);
        self.create(&job, &chunks, submission.custom_taxonomy.as_deref())?;
        Ok(job)
    }

    /// Write metadata and chunk files for a new job
    ///
    /// Fails with `DuplicateJob` if the job directory already exists.
    /// `job.json` is written last so listings never see a partial job.
    pub fn create(&self, job: &Job, chunks: &[Chunk], custom_taxonomy: Option<&str>) -> Result<()> {
        if chunks.len() != job.total_chunks {
            return Err(Error::InvalidInput(format!(
                "job {} declares {} chunks, got {}",
                job.id,
                job.total_chunks,
                chunks.len()
            )));
        }

        let dir = self.job_dir(&job.id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::DuplicateJob(job.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(dir.join(CHUNKS_DIR))?;
        fs::create_dir_all(dir.join(RESULTS_DIR))?;

        for chunk in chunks {
            write_json_atomic(&self.chunk_path(&job.id, chunk.chunk_index), chunk)?;
        }
        if let Some(payload) = custom_taxonomy {
            write_atomic(&dir.join(TAXONOMY_FILE), payload.as_bytes())?;
        }
        write_json_atomic(&dir.join(JOB_FILE), job)?;

        info!(
            job_id = %job.id,
            sector = %job.sector,
            total_rows = job.total_rows,
            total_chunks = job.total_chunks,
            "Job created"
        );
        Ok(())
    }

    /// Read job metadata
    pub fn read(&self, job_id: &str) -> Result<Job> {
        read_json(&self.job_dir(job_id).join(JOB_FILE))
            .map_err(|e| not_found_or(e, || format!("job {}", job_id)))
    }

    /// Overwrite job metadata
    pub fn write_status(&self, job: &Job) -> Result<()> {
        let dir = self.job_dir(&job.id);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("job {}", job.id)));
        }
        write_json_atomic(&dir.join(JOB_FILE), job)
    }

    /// Every readable job, oldest first
    pub fn list_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(self.root.join(JOBS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join(JOB_FILE);
            if !path.exists() {
                continue;
            }
            match read_json::<Job>(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job metadata"),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Jobs whose status is neither COMPLETED nor ERROR, oldest first
    pub fn list_active(&self) -> Result<Vec<Job>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|job| !job.is_terminal())
            .collect())
    }

    pub fn read_chunk(&self, job_id: &str, index: usize) -> Result<Vec<Row>> {
        let chunk: Chunk = read_json(&self.chunk_path(job_id, index))
            .map_err(|e| not_found_or(e, || format!("chunk {} of job {}", index, job_id)))?;
        Ok(chunk.rows)
    }

    /// Raw custom taxonomy payload, if one was submitted
    pub fn read_taxonomy_payload(&self, job_id: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.job_dir(job_id).join(TAXONOMY_FILE)) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn result_exists(&self, job_id: &str, index: usize) -> bool {
        self.result_path(job_id, index).is_file()
    }

    /// Persist a chunk result exactly once
    ///
    /// Returns `false` (and writes nothing) when a result already exists.
    pub fn mark_chunk_done(&self, job_id: &str, index: usize, result: &ChunkResult) -> Result<bool> {
        let path = self.result_path(job_id, index);
        if path.exists() {
            debug!(job_id, chunk_index = index, "Result already present, not rewriting");
            return Ok(false);
        }
        write_json_atomic(&path, result)?;
        Ok(true)
    }

    pub fn read_result(&self, job_id: &str, index: usize) -> Result<ChunkResult> {
        read_json(&self.result_path(job_id, index))
            .map_err(|e| not_found_or(e, || format!("result {} of job {}", index, job_id)))
    }

    /// Chunk indices that have a result artifact
    pub fn done_chunks(&self, job_id: &str) -> Result<BTreeSet<usize>> {
        let dir = self.job_dir(job_id).join(RESULTS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut done = BTreeSet::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(index) = name.to_str().and_then(parse_artifact_name) {
                done.insert(index);
            }
        }
        Ok(done)
    }

    /// Number of result artifacts on disk
    pub fn count_results(&self, job_id: &str) -> Result<usize> {
        Ok(self.done_chunks(job_id)?.len())
    }

    /// Write a named artifact into the job directory
    pub fn write_artifact(&self, job_id: &str, name: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.job_dir(job_id).join(name), bytes)
    }

    pub fn read_artifact(&self, job_id: &str, name: &str) -> Result<Vec<u8>> {
        fs::read(self.job_dir(job_id).join(name))
            .map_err(|e| not_found_or(e.into(), || format!("{} of job {}", name, job_id)))
    }

    /// Delete chunk and result artifacts (and the taxonomy payload), keeping
    /// metadata and final artifacts
    pub fn purge(&self, job_id: &str) -> Result<()> {
        let dir = self.job_dir(job_id);
        for sub in [CHUNKS_DIR, RESULTS_DIR] {
            remove_dir_if_exists(&dir.join(sub))?;
        }
        match fs::remove_file(dir.join(TAXONOMY_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(job_id, "Intermediate artifacts purged");
        Ok(())
    }

    /// Delete terminal jobs last updated before `cutoff`
    pub fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for job in self.list_all()? {
            if job.is_terminal() && job.updated_at < cutoff {
                remove_dir_if_exists(&self.job_dir(&job.id))?;
                info!(job_id = %job.id, status = ?job.status, "Expired job removed");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Split rows into contiguous chunks of at most `chunk_size`
pub fn split_into_chunks(rows: Vec<Row>, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(rows.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size.min(rows.len()));

    for row in rows {
        current.push(row);
        if current.len() == chunk_size {
            chunks.push(Chunk {
                chunk_index: chunks.len(),
                rows: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        chunks.push(Chunk {
            chunk_index: chunks.len(),
            rows: current,
        });
    }
    chunks
}

fn artifact_name(index: usize) -> String {
    format!("{:05}.json", index)
}

fn parse_artifact_name(name: &str) -> Option<usize> {
    name.strip_suffix(".json")?.parse().ok()
}

fn not_found_or(e: Error, what: impl FnOnce() -> String) -> Error {
    if e.is_not_found() {
        Error::NotFound(what())
    } else {
        e
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Write to `<path>.tmp`, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, Outcome};
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| json!({"Descricao": format!("item {}", i)}).as_object().cloned().unwrap())
            .collect()
    }

    fn submission(n: usize) -> Submission {
        Submission {
            sector: "Varejo".into(),
            description_column: "Descricao".into(),
            rows: rows(n),
            ..Submission::default()
        }
    }

    fn result(index: usize) -> ChunkResult {
        ChunkResult {
            chunk_index: index,
            outcomes: vec![Outcome::unmatched(0.0)],
        }
    }

    #[test]
    fn test_split_into_chunks() {
        let chunks = split_into_chunks(rows(1001), 500);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].rows.len(), 500);
        assert_eq!(chunks[2].rows.len(), 1);
        assert_eq!(chunks[2].chunk_index, 2);
        assert!(split_into_chunks(Vec::new(), 500).is_empty());
    }

    #[test]
    fn test_submit_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let job = store.submit(submission(7), 3).unwrap();
        assert_eq!(job.total_chunks, 3);

        let read = store.read(&job.id).unwrap();
        assert_eq!(read, job);
        assert_eq!(store.read_chunk(&job.id, 2).unwrap().len(), 1);
        assert!(store.read_taxonomy_payload(&job.id).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_create_fails() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let s = submission(2);
        let job = Job::new(&s, 500);
        let chunks = split_into_chunks(s.rows.clone(), 500);

        store.create(&job, &chunks, None).unwrap();
        let err = store.create(&job, &chunks, None).unwrap_err();
        assert!(matches!(err, Error::DuplicateJob(_)));
    }

    #[test]
    fn test_read_missing_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        assert!(matches!(store.read("nope"), Err(Error::NotFound(_))));
        assert!(matches!(store.read_chunk("nope", 0), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_mark_chunk_done_writes_once() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = store.submit(submission(4), 2).unwrap();

        assert!(store.mark_chunk_done(&job.id, 1, &result(1)).unwrap());
        let first = fs::read(store.result_path(&job.id, 1)).unwrap();

        let mut other = result(1);
        other.outcomes.push(Outcome::error("different"));
        assert!(!store.mark_chunk_done(&job.id, 1, &other).unwrap());
        assert_eq!(fs::read(store.result_path(&job.id, 1)).unwrap(), first);

        assert_eq!(store.count_results(&job.id).unwrap(), 1);
        assert_eq!(store.done_chunks(&job.id).unwrap().into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_list_active_filters_terminal() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let a = store.submit(submission(1), 500).unwrap();
        let mut b = store.submit(submission(1), 500).unwrap();
        b.fail("boom");
        store.write_status(&b).unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[test]
    fn test_purge_keeps_metadata_and_final() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let s = Submission {
            custom_taxonomy: Some("TjEsTjIsTjMsTjQ=".into()),
            ..submission(2)
        };
        let job = store.submit(s, 1).unwrap();
        store.mark_chunk_done(&job.id, 0, &result(0)).unwrap();
        store.write_artifact(&job.id, FINAL_JSON, b"{}").unwrap();

        store.purge(&job.id).unwrap();

        assert!(store.read(&job.id).is_ok());
        assert_eq!(store.read_artifact(&job.id, FINAL_JSON).unwrap(), b"{}");
        assert_eq!(store.count_results(&job.id).unwrap(), 0);
        assert!(store.read_taxonomy_payload(&job.id).unwrap().is_none());
        // Purging twice is harmless
        store.purge(&job.id).unwrap();
    }

    #[test]
    fn test_purge_expired_only_removes_old_terminal_jobs() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let mut old_done = store.submit(submission(1), 500).unwrap();
        old_done.transition_to(JobStatus::Completed);
        old_done.updated_at = Utc::now() - Duration::hours(100);
        store.write_status(&old_done).unwrap();

        let mut fresh_error = store.submit(submission(1), 500).unwrap();
        fresh_error.fail("boom");
        store.write_status(&fresh_error).unwrap();

        let mut old_pending = store.submit(submission(1), 500).unwrap();
        old_pending.updated_at = Utc::now() - Duration::hours(100);
        store.write_status(&old_pending).unwrap();

        let removed = store.purge_expired(Utc::now() - Duration::hours(72)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.read(&old_done.id).is_err());
        assert!(store.read(&fresh_error.id).is_ok());
        assert!(store.read(&old_pending.id).is_ok());
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = store.submit(submission(3), 2).unwrap();
        for entry in fs::read_dir(store.job_dir(&job.id).join(CHUNKS_DIR)).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().ends_with(".tmp"));
        }
    }
}
