//! Deterministic in-process classifier
//!
//! Answers from a fixed description → path table and counts calls. Used by
//! tests and by offline runs that should never leave the machine.

use async_trait::async_trait;
use spendcat_common::{text, CategoryPath};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{LlmClassifier, LlmContext, LlmGuess};

#[derive(Debug, Default)]
pub struct ScriptedClassifier {
    answers: HashMap<String, CategoryPath>,
    confidence: f64,
    calls: AtomicUsize,
    items_seen: AtomicUsize,
    contexts: Mutex<Vec<LlmContext>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self {
            confidence: 0.8,
            ..Self::default()
        }
    }

    /// Answer `path` for descriptions equal to `description` (case-insensitive)
    pub fn with_answer(mut self, description: &str, path: CategoryPath) -> Self {
        self.answers.insert(text::key(description), path);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Number of `classify` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total descriptions received so far
    pub fn items_seen(&self) -> usize {
        self.items_seen.load(Ordering::SeqCst)
    }

    /// Contexts received, in call order
    pub fn contexts(&self) -> Vec<LlmContext> {
        match self.contexts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl LlmClassifier for ScriptedClassifier {
    async fn classify(&self, descriptions: &[String], context: &LlmContext) -> Vec<LlmGuess> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items_seen.fetch_add(descriptions.len(), Ordering::SeqCst);
        match self.contexts.lock() {
            Ok(mut guard) => guard.push(context.clone()),
            Err(poisoned) => poisoned.into_inner().push(context.clone()),
        }

        descriptions
            .iter()
            .map(|d| match self.answers.get(&text::key(d)) {
                Some(path) => LlmGuess {
                    path: path.clone(),
                    confidence: self.confidence,
                    explanation: "scripted".to_string(),
                },
                None => LlmGuess::placeholder("Item não retornado pelo LLM"),
            })
            .collect()
    }
}
