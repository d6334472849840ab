//! LLM collaborator
//!
//! The worker only depends on [`LlmClassifier`]: given descriptions plus
//! sector, client and taxonomy hints, return one guess per description.
//! Transport failures never cross this boundary; an implementation that
//! cannot answer returns placeholder guesses, which callers treat exactly
//! like Unmatched.

pub mod azure;
pub mod prompt;
pub mod scripted;

pub use azure::AzureOpenAiClassifier;
pub use scripted::ScriptedClassifier;

use async_trait::async_trait;
use spendcat_common::{CategoryPath, HierarchyLookup};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Top-level values the model uses for "could not classify"
const UNCLASSIFIED_MARKERS: &[&str] = &["não identificado", "nao identificado"];

/// Hints sent with every request
#[derive(Debug, Clone, Default)]
pub struct LlmContext {
    pub sector: String,
    pub client_context: Option<String>,
    /// Client taxonomy the answer should stay within
    pub taxonomy: Option<Arc<HierarchyLookup>>,
}

/// One guess for one description
#[derive(Debug, Clone, PartialEq)]
pub struct LlmGuess {
    pub path: CategoryPath,
    pub confidence: f64,
    pub explanation: String,
}

impl LlmGuess {
    /// "Unidentified" result carrying the reason
    pub fn placeholder(reason: impl Into<String>) -> Self {
        Self {
            path: CategoryPath::default(),
            confidence: 0.0,
            explanation: reason.into(),
        }
    }

    /// No usable top-level category
    pub fn is_placeholder(&self) -> bool {
        let n1 = self.path.n1.trim();
        n1.is_empty() || UNCLASSIFIED_MARKERS.contains(&n1.to_lowercase().as_str())
    }
}

/// Remote text-classification service
#[async_trait]
pub trait LlmClassifier: Send + Sync {
    /// Exactly one guess per description, in input order
    async fn classify(&self, descriptions: &[String], context: &LlmContext) -> Vec<LlmGuess>;

    /// False when every call would only return placeholders
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Stand-in used when no credentials are configured
#[derive(Debug, Clone, Default)]
pub struct DisabledClassifier;

#[async_trait]
impl LlmClassifier for DisabledClassifier {
    async fn classify(&self, descriptions: &[String], _context: &LlmContext) -> Vec<LlmGuess> {
        descriptions
            .iter()
            .map(|_| LlmGuess::placeholder("LLM not configured"))
            .collect()
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Transport-level failure of one request (retried inside the client)
#[derive(Debug, Error)]
pub enum LlmTransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl LlmTransportError {
    /// Worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmTransportError::Timeout
            | LlmTransportError::RateLimited { .. }
            | LlmTransportError::Network(_) => true,
            LlmTransportError::Http { status, .. } => *status >= 500,
            LlmTransportError::Malformed(_) => false,
        }
    }
}
