//! Custom taxonomy payload decoding
//!
//! The submission carries the client's taxonomy as a base64 file: a workbook
//! (XLSX / XLS / ODS, first sheet) or a CSV. Headers are matched after trim
//! and upper-casing; `N1`..`N4` are required and rows without an N4 are
//! skipped.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use calamine::Reader;
use spendcat_common::{CategoryPath, TaxonomyEntry};
use std::io::Cursor;
use tracing::debug;

use crate::error::WorkerResult;

const REQUIRED: [&str; 4] = ["N1", "N2", "N3", "N4"];

/// Decode a base64 taxonomy payload into entries
pub fn decode_taxonomy(payload: &str) -> WorkerResult<Vec<TaxonomyEntry>> {
    let bytes = decode_base64(payload)?;
    let table = match read_workbook(&bytes) {
        Some(table) => table,
        None => read_csv(&bytes)?,
    };
    entries_from_table(table)
}

fn decode_base64(payload: &str) -> WorkerResult<Vec<u8>> {
    // Tolerate a data-URL prefix and wrapped lines
    let body = payload
        .split_once("base64,")
        .map(|(_, rest)| rest)
        .unwrap_or(payload);
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| invalid(format!("taxonomy payload is not valid base64: {}", e)))
}

/// First worksheet as rows of strings; `None` if the bytes are not a workbook
fn read_workbook(bytes: &[u8]) -> Option<Vec<Vec<String>>> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).ok()?;
    let first = workbook.sheet_names().first()?.clone();
    let range = workbook.worksheet_range(&first).ok()?;
    debug!(sheet = %first, rows = range.height(), "Taxonomy read from workbook");
    Some(
        range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect(),
    )
}

fn read_csv(bytes: &[u8]) -> WorkerResult<Vec<Vec<String>>> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_start_matches('\u{feff}');
    let first_line = text.lines().next().unwrap_or_default();
    let delimiter = if first_line.matches(';').count() > first_line.matches(',').count() {
        b';'
    } else {
        b','
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| invalid(format!("taxonomy CSV unreadable: {}", e)))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    debug!(rows = rows.len(), "Taxonomy read from CSV");
    Ok(rows)
}

fn entries_from_table(table: Vec<Vec<String>>) -> WorkerResult<Vec<TaxonomyEntry>> {
    let mut rows = table.into_iter();
    let headers: Vec<String> = rows
        .next()
        .ok_or_else(|| invalid("taxonomy file is empty".to_string()))?
        .iter()
        .map(|h| h.trim().to_uppercase())
        .collect();

    let missing: Vec<&str> = REQUIRED
        .iter()
        .copied()
        .filter(|name| !headers.iter().any(|h| h == *name))
        .collect();
    if !missing.is_empty() {
        return Err(invalid(format!(
            "taxonomy missing required columns: {}",
            missing.join(", ")
        )));
    }
    let position = |name: &str| headers.iter().position(|h| h == name).unwrap_or_default();
    let columns = REQUIRED.map(position);

    Ok(rows
        .filter_map(|row| {
            let n4 = cell(&row, columns[3]);
            if n4.is_empty() || n4.eq_ignore_ascii_case("nan") {
                return None;
            }
            Some(CategoryPath::new(
                cell(&row, columns[0]),
                cell(&row, columns[1]),
                cell(&row, columns[2]),
                n4,
            ))
        })
        .collect())
}

fn cell(row: &[String], idx: usize) -> String {
    row.get(idx).map(|s| s.trim().to_string()).unwrap_or_default()
}

fn cell_to_string(c: &calamine::DataType) -> String {
    use calamine::DataType as D;
    match c {
        D::Empty => String::new(),
        D::String(s) => s.clone(),
        D::Float(f) => {
            if f.fract() == 0.0 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        D::Int(i) => i.to_string(),
        D::Bool(b) => b.to_string(),
        D::Error(_) => String::new(),
        other => format!("{}", other),
    }
}

fn invalid(message: String) -> crate::error::WorkerError {
    spendcat_common::Error::InvalidInput(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(text: &str) -> String {
        STANDARD.encode(text.as_bytes())
    }

    #[test]
    fn test_decode_csv_payload() {
        let payload = encode(" n1 ,N2,n3,N4,Extra\nMRO,Tubulações,Aço,Tubo Industrial,x\nMRO,Tubulações,PVC,,y\n");
        let entries = decode_taxonomy(&payload).unwrap();
        assert_eq!(entries, vec![CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Industrial")]);
    }

    #[test]
    fn test_semicolon_and_bom() {
        let payload = encode("\u{feff}N4;N3;N2;N1\nDetergente;Químicos;Limpeza;Facilities\n");
        let entries = decode_taxonomy(&payload).unwrap();
        assert_eq!(entries[0], CategoryPath::new("Facilities", "Limpeza", "Químicos", "Detergente"));
    }

    #[test]
    fn test_wrapped_and_data_url_payload() {
        let raw = encode("N1,N2,N3,N4\nA,B,C,D\n");
        let wrapped = format!("data:text/csv;base64,{}\n{}", &raw[..8], &raw[8..]);
        assert_eq!(decode_taxonomy(&wrapped).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_columns_rejected() {
        let err = decode_taxonomy(&encode("N1,N2,N4\nA,B,D\n")).unwrap_err();
        assert!(err.to_string().contains("N3"));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(decode_taxonomy("***not base64***").is_err());
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(decode_taxonomy("").is_err());
    }

    #[test]
    fn test_cell_formatting() {
        use calamine::DataType as D;
        assert_eq!(cell_to_string(&D::Float(42.0)), "42");
        assert_eq!(cell_to_string(&D::Float(1.5)), "1.5");
        assert_eq!(cell_to_string(&D::Empty), "");
    }
}
