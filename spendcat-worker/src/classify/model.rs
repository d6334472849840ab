//! Statistical model runtime
//!
//! The training side exports a term-weighted vectorizer and a linear
//! classifier as one `model.json`. Prediction reproduces the vectorizer
//! (normalized word n-grams, raw counts times idf, L2 norm) and the classifier
//! (linear scores, softmax across classes or logistic for a single-row
//! binary model).

use serde::Deserialize;
use spendcat_common::text;
use spendcat_common::CategoryPath;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{ClassificationError, WorkerResult};

/// One ranked prediction
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Full path of the predicted leaf
    pub path: CategoryPath,
    pub confidence: f64,
}

/// Anything that can rank categories for a description
pub trait CategoryModel: Send + Sync {
    /// Top `k` predictions, best first
    fn predict_top_k(&self, description: &str, k: usize) -> Result<Vec<Prediction>, ClassificationError>;
}

/// Ancestors of a leaf label
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeafAncestors {
    #[serde(rename = "N1", default)]
    pub n1: String,
    #[serde(rename = "N2", default)]
    pub n2: String,
    #[serde(rename = "N3", default)]
    pub n3: String,
}

/// Exported vectorizer + linear classifier
#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    /// Term → feature index
    pub vocabulary: HashMap<String, usize>,
    /// Inverse document frequency per feature
    pub idf: Vec<f64>,
    /// Inclusive (min, max) word n-gram sizes
    #[serde(default = "default_ngram_range")]
    pub ngram_range: (usize, usize),
    #[serde(default)]
    pub sublinear_tf: bool,
    /// Leaf labels (N4), in class order
    pub classes: Vec<String>,
    /// One row per class (or a single row for a binary model)
    pub coef: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
    /// Leaf → ancestors
    #[serde(default)]
    pub hierarchy: HashMap<String, LeafAncestors>,
}

fn default_ngram_range() -> (usize, usize) {
    (1, 2)
}

impl LinearModel {
    /// Load and check `model.json`
    pub fn load(path: &Path) -> WorkerResult<Self> {
        let bytes = std::fs::read(path)?;
        let model: LinearModel = serde_json::from_slice(&bytes)
            .map_err(|e| ClassificationError::Model(format!("{}: {}", path.display(), e)))?;
        model.check()?;
        Ok(model)
    }

    /// Shape consistency between vocabulary, idf, coefficients and classes
    pub fn check(&self) -> Result<(), ClassificationError> {
        let features = self.idf.len();
        if let Some((term, idx)) = self.vocabulary.iter().find(|(_, idx)| **idx >= features) {
            return Err(ClassificationError::Model(format!(
                "vocabulary term '{}' maps to feature {} but idf has {}",
                term, idx, features
            )));
        }
        let binary = self.coef.len() == 1 && self.classes.len() == 2;
        if !binary && self.coef.len() != self.classes.len() {
            return Err(ClassificationError::Model(format!(
                "{} coefficient rows for {} classes",
                self.coef.len(),
                self.classes.len()
            )));
        }
        if self.intercept.len() != self.coef.len() {
            return Err(ClassificationError::Model(format!(
                "{} intercepts for {} coefficient rows",
                self.intercept.len(),
                self.coef.len()
            )));
        }
        if let Some(row) = self.coef.iter().find(|row| row.len() != features) {
            return Err(ClassificationError::Model(format!(
                "coefficient row has {} weights, expected {}",
                row.len(),
                features
            )));
        }
        if self.ngram_range.0 == 0 || self.ngram_range.0 > self.ngram_range.1 {
            return Err(ClassificationError::Model(format!(
                "invalid n-gram range {:?}",
                self.ngram_range
            )));
        }
        Ok(())
    }

    /// Sparse tf-idf vector (feature index, weight), L2-normalized
    fn vectorize(&self, description: &str) -> Vec<(usize, f64)> {
        let normalized = text::normalize(description);
        let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();

        let mut counts: HashMap<usize, f64> = HashMap::new();
        let (min_n, max_n) = self.ngram_range;
        for n in min_n..=max_n {
            for window in tokens.windows(n) {
                if let Some(idx) = self.vocabulary.get(&window.join(" ")) {
                    *counts.entry(*idx).or_insert(0.0) += 1.0;
                }
            }
        }

        let mut features: Vec<(usize, f64)> = counts
            .into_iter()
            .map(|(idx, tf)| {
                let tf = if self.sublinear_tf { 1.0 + tf.ln() } else { tf };
                (idx, tf * self.idf[idx])
            })
            .collect();
        features.sort_by_key(|(idx, _)| *idx);

        let norm = features.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, w) in &mut features {
                *w /= norm;
            }
        }
        features
    }

    /// Class probabilities in class order
    fn probabilities(&self, features: &[(usize, f64)]) -> Vec<f64> {
        let scores: Vec<f64> = self
            .coef
            .iter()
            .zip(&self.intercept)
            .map(|(row, b)| b + features.iter().map(|(idx, w)| row[*idx] * w).sum::<f64>())
            .collect();

        if scores.len() == 1 {
            let p = 1.0 / (1.0 + (-scores[0]).exp());
            return vec![1.0 - p, p];
        }

        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }

    fn path_for(&self, leaf: &str) -> CategoryPath {
        let ancestors = self.hierarchy.get(leaf).cloned().unwrap_or_default();
        CategoryPath::new(ancestors.n1, ancestors.n2, ancestors.n3, leaf)
    }
}

impl CategoryModel for LinearModel {
    fn predict_top_k(&self, description: &str, k: usize) -> Result<Vec<Prediction>, ClassificationError> {
        if self.classes.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let features = self.vectorize(description);
        let probabilities = self.probabilities(&features);
        if probabilities.len() != self.classes.len() {
            return Err(ClassificationError::Model(format!(
                "{} probabilities for {} classes",
                probabilities.len(),
                self.classes.len()
            )));
        }

        let mut ranked: Vec<(usize, f64)> = probabilities.into_iter().enumerate().collect();
        // Stable on ties: lower class index first
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(idx, confidence)| Prediction {
                path: self.path_for(&self.classes[idx]),
                confidence,
            })
            .collect())
    }
}
