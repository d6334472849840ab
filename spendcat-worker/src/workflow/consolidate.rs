//! Job consolidation
//!
//! Reassembles every chunk result in index order next to its input rows,
//! computes analytics and writes `final.json` plus a flat `final.csv`.
//! Status changes and purging are left to the scheduler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::analytics::{self, Analytics, StatusSummary};
use crate::error::{WorkerError, WorkerResult};
use crate::models::{description_of, Job, JobStatus, MatchStatus, Outcome, Row};
use crate::store::{JobStore, FINAL_CSV, FINAL_JSON};

/// Classification columns appended to every exported row
pub const OUTPUT_COLUMNS: [&str; 11] = [
    "N1",
    "N2",
    "N3",
    "N4",
    "Match_Type",
    "Matched_Terms",
    "Match_Score",
    "Classification_Source",
    "Ambiguity_Level",
    "Ambiguous_Options",
    "Needs_Review",
];

/// Contents of `final.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub job: Job,
    pub summary: StatusSummary,
    pub analytics: Analytics,
    pub rows: Vec<Row>,
}

/// Read back the consolidated artifact of a COMPLETED job
pub fn read_final(store: &JobStore, job_id: &str) -> WorkerResult<FinalArtifact> {
    let bytes = store.read_artifact(job_id, FINAL_JSON)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| WorkerError::Consolidation(format!("final artifact of job {} unreadable: {}", job_id, e)))
}

/// Build and write the final artifacts of `job`
///
/// Every chunk in `[0, total_chunks)` must have a result whose length
/// matches its input rows. The returned artifact carries the job already
/// flipped to COMPLETED; persisting that status is up to the caller.
pub fn consolidate(store: &JobStore, job: &Job) -> WorkerResult<FinalArtifact> {
    let job_id = job.id.as_str();
    let mut rows = Vec::with_capacity(job.total_rows);
    let mut outcomes = Vec::with_capacity(job.total_rows);
    let mut descriptions = Vec::with_capacity(job.total_rows);

    for index in 0..job.total_chunks {
        let input = store
            .read_chunk(job_id, index)
            .map_err(|e| consolidation(format!("chunk {}: {}", index, e)))?;
        let result = store
            .read_result(job_id, index)
            .map_err(|e| consolidation(format!("result {}: {}", index, e)))?;
        if input.len() != result.outcomes.len() {
            return Err(consolidation(format!(
                "chunk {} has {} rows but {} outcomes",
                index,
                input.len(),
                result.outcomes.len()
            )));
        }

        for (row, outcome) in input.into_iter().zip(result.outcomes) {
            descriptions.push(description_of(&row, &job.description_column));
            rows.push(output_row(row, &outcome));
            outcomes.push(outcome);
        }
    }

    let analytics = analytics::compute(&outcomes, &descriptions);
    let mut completed = job.clone();
    completed.set_processed(job.total_chunks);
    completed.transition_to(JobStatus::Completed);
    let artifact = FinalArtifact {
        job: completed,
        summary: analytics.summary.clone(),
        analytics,
        rows,
    };

    // Both payloads are built before either is written
    let csv = to_csv(&export_columns(job, &artifact.rows), &artifact.rows)?;
    let json = serde_json::to_vec_pretty(&artifact)
        .map_err(|e| consolidation(format!("serializing final artifact: {}", e)))?;
    store.write_artifact(job_id, FINAL_CSV, &csv)?;
    store.write_artifact(job_id, FINAL_JSON, &json)?;

    debug!(job_id, bytes = json.len(), "Final artifacts written");
    info!(
        job_id,
        rows = artifact.rows.len(),
        unique = artifact.summary.unique,
        ambiguous = artifact.summary.ambiguous,
        unmatched = artifact.summary.unmatched,
        "Job consolidated"
    );
    Ok(artifact)
}

/// Input fields minus internal and colliding columns, then the output columns
pub fn output_row(row: Row, outcome: &Outcome) -> Row {
    let mut out: Row = row
        .into_iter()
        .filter(|(name, _)| keep_input_column(name))
        .collect();

    out.insert("N1".into(), Value::String(outcome.path.n1.clone()));
    out.insert("N2".into(), Value::String(outcome.path.n2.clone()));
    out.insert("N3".into(), Value::String(outcome.path.n3.clone()));
    out.insert("N4".into(), Value::String(outcome.path.n4.clone()));
    out.insert("Match_Type".into(), Value::String(outcome.status.to_string()));
    out.insert("Matched_Terms".into(), Value::String(outcome.matched_terms.join(", ")));
    out.insert("Match_Score".into(), Value::from(round_score(outcome.confidence)));
    out.insert("Classification_Source".into(), Value::String(outcome.source_label()));
    out.insert(
        "Ambiguity_Level".into(),
        Value::String(outcome.ambiguity_level.map(|l| l.to_string()).unwrap_or_default()),
    );
    let options = if outcome.status == MatchStatus::Ambiguous {
        outcome.ambiguous_options.join(" | ")
    } else {
        String::new()
    };
    out.insert("Ambiguous_Options".into(), Value::String(options));
    out.insert("Needs_Review".into(), Value::Bool(outcome.needs_review()));
    out
}

fn keep_input_column(name: &str) -> bool {
    !name.starts_with('_') && !OUTPUT_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(name))
}

fn round_score(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Header order: kept input columns as submitted, then the output columns
fn export_columns(job: &Job, rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if keep_input_column(name) && !columns.iter().any(|c| c == name) {
            columns.push(name.to_string());
        }
    };
    for name in &job.columns {
        push(name);
    }
    // Jobs written without a column list
    for row in rows {
        for name in row.keys() {
            push(name);
        }
    }
    columns.extend(OUTPUT_COLUMNS.iter().map(|c| c.to_string()));
    columns
}

fn to_csv(columns: &[String], rows: &[Row]) -> WorkerResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(columns)
        .map_err(|e| consolidation(format!("writing CSV header: {}", e)))?;
    for row in rows {
        let record: Vec<String> = columns.iter().map(|c| cell_text(row.get(c))).collect();
        writer
            .write_record(&record)
            .map_err(|e| consolidation(format!("writing CSV row: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| consolidation(format!("flushing CSV: {}", e)))
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn consolidation(message: String) -> WorkerError {
    WorkerError::Consolidation(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkResult, Reconciliation, Source, Submission};
    use serde_json::json;
    use spendcat_common::{CategoryPath, Level};
    use tempfile::TempDir;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn submit(store: &JobStore, rows: Vec<Row>, chunk_size: usize) -> Job {
        store
            .submit(
                Submission {
                    sector: "Industrial".into(),
                    description_column: "Descricao".into(),
                    rows,
                    ..Submission::default()
                },
                chunk_size,
            )
            .unwrap()
    }

    #[test]
    fn test_output_row_drops_internal_and_colliding_columns() {
        let input = row(json!({"Codigo": 7, "_tmp": "x", "n1": "old", "Descricao": "Tubo"}));
        let mut outcome = Outcome::unique(CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo"), 0.91234, Source::LlmBatch);
        outcome.reconciliation = Some(Reconciliation::LevelShift);

        let out = output_row(input, &outcome);
        assert!(out.get("_tmp").is_none());
        assert!(out.get("n1").is_none());
        assert_eq!(out["N1"], "MRO");
        assert_eq!(out["Codigo"], 7);
        assert_eq!(out["Match_Type"], "Unique");
        assert_eq!(out["Match_Score"], 0.9123);
        assert_eq!(out["Classification_Source"], "LLM (batch) [shift-corrected]");
        assert_eq!(out["Needs_Review"], false);
        assert_eq!(out["Ambiguous_Options"], "");
    }

    #[test]
    fn test_ambiguous_row_lists_options() {
        let outcome = Outcome {
            status: MatchStatus::Ambiguous,
            ambiguity_level: Some(Level::N3),
            ambiguous_options: vec!["Aço".into(), "PVC".into()],
            ..Outcome::unique(CategoryPath::new("MRO", "Tubulações", "", ""), 0.3, Source::Model)
        };
        let out = output_row(Row::new(), &outcome);
        assert_eq!(out["Ambiguity_Level"], "N3");
        assert_eq!(out["Ambiguous_Options"], "Aço | PVC");
        assert_eq!(out["Needs_Review"], true);
    }

    #[test]
    fn test_consolidate_preserves_row_order() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let rows: Vec<Row> = (0..5)
            .map(|i| row(json!({"Codigo": i, "Descricao": format!("item {}", i)})))
            .collect();
        let job = submit(&store, rows, 2);

        // Results land out of order
        for index in [2, 0, 1] {
            let len = store.read_chunk(&job.id, index).unwrap().len();
            let outcomes = (0..len)
                .map(|i| Outcome::unique(CategoryPath::new(format!("C{}", index), "", "", format!("L{}", i)), 0.9, Source::Model))
                .collect();
            store.mark_chunk_done(&job.id, index, &ChunkResult { chunk_index: index, outcomes }).unwrap();
        }

        let artifact = consolidate(&store, &job).unwrap();
        let codes: Vec<i64> = artifact.rows.iter().map(|r| r["Codigo"].as_i64().unwrap()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
        assert_eq!(artifact.rows[4]["N1"], "C2");
        assert_eq!(artifact.summary.total, 5);

        let csv = String::from_utf8(store.read_artifact(&job.id, FINAL_CSV).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Codigo,Descricao,N1,N2,N3,N4,Match_Type,Matched_Terms,Match_Score,Classification_Source,Ambiguity_Level,Ambiguous_Options,Needs_Review"
        );
        assert_eq!(lines.count(), 5);

        let back = read_final(&store, &job.id).unwrap();
        assert_eq!(back.rows.len(), 5);
    }

    #[test]
    fn test_missing_result_is_consolidation_error() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = submit(&store, vec![row(json!({"Descricao": "a"}))], 500);

        let err = consolidate(&store, &job).unwrap_err();
        assert!(matches!(err, WorkerError::Consolidation(_)));
        assert!(store.read_artifact(&job.id, FINAL_JSON).is_err());
    }

    #[test]
    fn test_failed_csv_write_leaves_no_final_json() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = submit(&store, vec![row(json!({"Descricao": "a"}))], 500);
        store
            .mark_chunk_done(&job.id, 0, &ChunkResult { chunk_index: 0, outcomes: vec![Outcome::unmatched(0.0)] })
            .unwrap();
        // A directory in the way makes the rename into final.csv fail
        std::fs::create_dir_all(store.job_dir(&job.id).join(FINAL_CSV).join("blocker")).unwrap();

        assert!(consolidate(&store, &job).is_err());
        assert!(store.read_artifact(&job.id, FINAL_JSON).is_err());
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = submit(&store, vec![row(json!({"Descricao": "a"})), row(json!({"Descricao": "b"}))], 500);
        store
            .mark_chunk_done(&job.id, 0, &ChunkResult { chunk_index: 0, outcomes: vec![Outcome::unmatched(0.0)] })
            .unwrap();

        let err = consolidate(&store, &job).unwrap_err();
        assert!(err.to_string().contains("2 rows but 1 outcomes"));
    }
}
