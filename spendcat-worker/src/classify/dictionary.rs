//! Keyword dictionary
//!
//! Each category (identified by its N4) owns a list of terms. A term matches
//! when its normalized form occurs in the normalized description on word
//! boundaries, with spaces in the term tolerating any run of spaces, hyphens
//! or underscores. The score of a category is the number of its distinct
//! terms that match.

use regex::{Regex, RegexBuilder};
use spendcat_common::text;
use spendcat_common::CategoryPath;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};

/// Terms too generic to classify anything on their own (normalized form)
const STOP_TERMS: &[&str] = &[
    "kit", "conjunto", "peca", "pecas", "servico", "servicos", "varios", "diversos",
];

const N1_HEADERS: &[&str] = &["N1_Categoria", "N1", "Categoria N1"];
const N2_HEADERS: &[&str] = &["N2_Subcategoria", "N2", "Subcategoria N2"];
const N3_HEADERS: &[&str] = &["N3_Subcategoria", "N3", "Subcategoria N3"];
const N4_HEADERS: &[&str] = &["N4_Subcategorias", "N4_Subcategoria", "N4", "Subcategoria N4"];
const KEYWORD_HEADERS: &[&str] = &[
    "Palavras_chave",
    "Palavras-chave",
    "Keywords",
    "Palavra_Chave",
    "Palavras-chave / Variações",
];
const VARIATION_HEADERS: &[&str] = &[
    "Variacoes",
    "Variações",
    "Variacoes_Palavras",
    "Variacoes Palavras",
    "Variations",
];

#[derive(Debug)]
struct Category {
    path: CategoryPath,
    terms: Vec<String>,
    patterns: Vec<Regex>,
    seen: HashSet<String>,
}

/// Result of matching one description
#[derive(Debug, Clone, PartialEq)]
pub enum DictionaryMatch {
    /// No term of any category matched
    None,
    /// One category scored highest
    Unique {
        path: CategoryPath,
        terms: Vec<String>,
        score: usize,
    },
    /// Several categories share the highest score
    Tie {
        paths: Vec<CategoryPath>,
        terms: Vec<String>,
        score: usize,
    },
}

/// Per-sector keyword dictionary
#[derive(Debug, Default)]
pub struct KeywordDictionary {
    categories: Vec<Category>,
    by_leaf: HashMap<String, usize>,
}

impl KeywordDictionary {
    /// Load `dictionary.csv`
    pub fn load(path: &Path) -> WorkerResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    /// Parse a dictionary CSV (comma or semicolon separated)
    pub fn from_csv_reader<R: Read>(mut reader: R) -> WorkerResult<Self> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        let content = content.trim_start_matches('\u{feff}');

        let header_line = content.lines().next().unwrap_or_default();
        let delimiter = if header_line.matches(';').count() > header_line.matches(',').count() {
            b';'
        } else {
            b','
        };

        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers: Vec<String> = csv_reader
            .headers()
            .map_err(|e| WorkerError::Other(anyhow::anyhow!("dictionary header: {}", e)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let col_n1 = require_column(&headers, N1_HEADERS)?;
        let col_n2 = require_column(&headers, N2_HEADERS)?;
        let col_n3 = require_column(&headers, N3_HEADERS)?;
        let col_n4 = require_column(&headers, N4_HEADERS)?;
        let col_keywords = require_column(&headers, KEYWORD_HEADERS)?;
        let col_variations = pick_column(&headers, VARIATION_HEADERS);

        let mut dictionary = Self::default();
        for (line, record) in csv_reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(line = line + 2, error = %e, "Skipping malformed dictionary row");
                    continue;
                }
            };
            let field = |idx: usize| record.get(idx).unwrap_or_default().trim().to_string();

            let path = CategoryPath::new(field(col_n1), field(col_n2), field(col_n3), field(col_n4));
            let mut terms = split_terms(&field(col_keywords));
            if let Some(col) = col_variations {
                terms.extend(split_terms(&field(col)));
            }
            dictionary.add(path, terms);
        }

        debug!(
            categories = dictionary.len(),
            patterns = dictionary.pattern_count(),
            "Keyword dictionary loaded"
        );
        Ok(dictionary)
    }

    /// Add terms for a category; the first occurrence of an N4 fixes its path
    pub fn add(&mut self, path: CategoryPath, terms: impl IntoIterator<Item = String>) {
        let path = path.trimmed();
        if path.n4.is_empty() {
            return;
        }

        let idx = match self.by_leaf.get(&path.n4) {
            Some(idx) => *idx,
            None => {
                self.by_leaf.insert(path.n4.clone(), self.categories.len());
                self.categories.push(Category {
                    path,
                    terms: Vec::new(),
                    patterns: Vec::new(),
                    seen: HashSet::new(),
                });
                self.categories.len() - 1
            }
        };
        let category = &mut self.categories[idx];

        for term in terms {
            let key = text::normalize(&term);
            if key.is_empty() || STOP_TERMS.contains(&key.as_str()) || !category.seen.insert(key.clone()) {
                continue;
            }
            match term_pattern(&key) {
                Ok(pattern) => {
                    category.terms.push(term.trim().to_string());
                    category.patterns.push(pattern);
                }
                Err(e) => warn!(term = %term, error = %e, "Skipping unusable dictionary term"),
            }
        }
    }

    /// Number of categories
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Total number of compiled term patterns
    pub fn pattern_count(&self) -> usize {
        self.categories.iter().map(|c| c.patterns.len()).sum()
    }

    /// Match a raw description
    pub fn match_description(&self, description: &str) -> DictionaryMatch {
        self.match_normalized(&text::normalize(description))
    }

    /// Match an already normalized description
    pub fn match_normalized(&self, desc_norm: &str) -> DictionaryMatch {
        if desc_norm.is_empty() {
            return DictionaryMatch::None;
        }

        let mut best_score = 0;
        let mut winners: Vec<(usize, Vec<&str>)> = Vec::new();

        for (idx, category) in self.categories.iter().enumerate() {
            let matched: Vec<&str> = category
                .patterns
                .iter()
                .zip(&category.terms)
                .filter(|(pattern, _)| pattern.is_match(desc_norm))
                .map(|(_, term)| term.as_str())
                .collect();

            let score = matched.len();
            if score == 0 || score < best_score {
                continue;
            }
            if score > best_score {
                best_score = score;
                winners.clear();
            }
            winners.push((idx, matched));
        }

        match winners.len() {
            0 => DictionaryMatch::None,
            1 => {
                let (idx, terms) = winners.remove(0);
                DictionaryMatch::Unique {
                    path: self.categories[idx].path.clone(),
                    terms: terms.into_iter().map(str::to_string).collect(),
                    score: best_score,
                }
            }
            _ => {
                let mut seen = HashSet::new();
                let mut terms = Vec::new();
                for (_, matched) in &winners {
                    for term in matched {
                        if seen.insert(text::normalize(term)) {
                            terms.push(term.to_string());
                        }
                    }
                }
                DictionaryMatch::Tie {
                    paths: winners
                        .iter()
                        .map(|(idx, _)| self.categories[*idx].path.clone())
                        .collect(),
                    terms,
                    score: best_score,
                }
            }
        }
    }
}

/// Comma-separated cell to trimmed, non-empty terms
fn split_terms(cell: &str) -> Vec<String> {
    cell.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// `\b` + term + `\b`, spaces tolerant of `[\s_-]+`
fn term_pattern(normalized: &str) -> Result<Regex, regex::Error> {
    let body = normalized
        .split(' ')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"[\s_-]+");
    RegexBuilder::new(&format!(r"\b{}\b", body))
        .case_insensitive(true)
        .build()
}

/// First header matching one of `options`: exact, then case/accent-insensitive
fn pick_column(headers: &[String], options: &[&str]) -> Option<usize> {
    for option in options {
        if let Some(idx) = headers.iter().position(|h| h == option) {
            return Some(idx);
        }
    }
    let folded: Vec<String> = headers.iter().map(|h| text::fold(h)).collect();
    for option in options {
        let key = text::fold(option);
        if let Some(idx) = folded.iter().position(|h| *h == key) {
            return Some(idx);
        }
    }
    None
}

fn require_column(headers: &[String], options: &[&str]) -> WorkerResult<usize> {
    pick_column(headers, options).ok_or_else(|| {
        WorkerError::Other(anyhow::anyhow!(
            "Dictionary column not found. Try renaming to one of these: {:?}",
            options
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
N1_Categoria,N2_Subcategoria,N3_Subcategoria,N4_Subcategoria,Palavras_chave,Variacoes
MRO,Elétrica,Cabos,Cabo Flexível,\"cabo flexivel, cabo pp\",cabo-flex
MRO,Elétrica,Cabos,Cabo Rígido,\"cabo rigido, kit\",
MRO,Tubulações,Aço,Tubo Industrial,\"tubo aco, tubo industrial\",
MRO,Tubulações,PVC,Tubo Soldável,\"tubo pvc, tubo soldavel\",
Facilities,Limpeza,Químicos,Detergente,detergente,
";

    fn dictionary() -> KeywordDictionary {
        KeywordDictionary::from_csv_reader(CSV.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_counts() {
        let d = dictionary();
        assert_eq!(d.len(), 5);
        // "kit" is a stop term
        assert_eq!(d.pattern_count(), 9);
    }

    #[test]
    fn test_unique_match_reports_terms() {
        let d = dictionary();
        match d.match_description("CABO FLEXÍVEL 2,5mm preto") {
            DictionaryMatch::Unique { path, terms, score } => {
                assert_eq!(path.n4, "Cabo Flexível");
                assert_eq!(terms, vec!["cabo flexivel".to_string()]);
                assert_eq!(score, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_separator_tolerance() {
        let d = dictionary();
        assert!(matches!(
            d.match_normalized("cabo_flex 10mm"),
            DictionaryMatch::Unique { .. }
        ));
        assert!(matches!(
            d.match_description("Cabo-Flex 10mm"),
            DictionaryMatch::Unique { .. }
        ));
    }

    #[test]
    fn test_word_boundaries() {
        let d = dictionary();
        assert_eq!(d.match_description("detergentes"), DictionaryMatch::None);
        assert!(matches!(d.match_description("detergente neutro"), DictionaryMatch::Unique { .. }));
    }

    #[test]
    fn test_higher_score_wins() {
        let d = dictionary();
        match d.match_description("tubo industrial de aco") {
            DictionaryMatch::Unique { path, score, .. } => {
                assert_eq!(path.n4, "Tubo Industrial");
                assert_eq!(score, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tie_lists_all_winners() {
        let d = dictionary();
        match d.match_description("cabo pp e cabo rigido") {
            DictionaryMatch::Tie { paths, terms, score } => {
                assert_eq!(score, 1);
                assert_eq!(paths.len(), 2);
                assert_eq!(terms.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stop_term_alone_never_matches() {
        let d = dictionary();
        assert_eq!(d.match_description("kit"), DictionaryMatch::None);
        assert_eq!(d.match_description(""), DictionaryMatch::None);
    }

    #[test]
    fn test_semicolon_and_alternate_headers() {
        let csv = "N1;N2;N3;N4;Keywords\nA;B;C;D;alpha, beta\n";
        let d = KeywordDictionary::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(d.len(), 1);
        assert!(matches!(d.match_description("Beta"), DictionaryMatch::Unique { .. }));
    }

    #[test]
    fn test_missing_required_column() {
        let csv = "N1,N2,N3,Keywords\nA,B,C,alpha\n";
        assert!(KeywordDictionary::from_csv_reader(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_first_leaf_occurrence_defines_path() {
        let mut d = KeywordDictionary::default();
        d.add(CategoryPath::new("A", "B", "C", "Leaf"), vec!["one".to_string()]);
        d.add(CategoryPath::new("X", "Y", "Z", "Leaf"), vec!["two".to_string(), "one".to_string()]);
        assert_eq!(d.len(), 1);
        assert_eq!(d.pattern_count(), 2);
        match d.match_description("two") {
            DictionaryMatch::Unique { path, .. } => assert_eq!(path.n1, "A"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
