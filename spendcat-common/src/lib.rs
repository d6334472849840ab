//! # Spendcat Common Library
//!
//! Shared code for the spend classification worker and its collaborators:
//! - Error and result types
//! - Configuration loading and root folder resolution
//! - Text normalization used by every matching stage
//! - Taxonomy types and the read-only hierarchy lookup
//! - Job lifecycle events

pub mod config;
pub mod error;
pub mod events;
pub mod taxonomy;
pub mod text;
pub mod time;

pub use error::{Error, Result};
pub use taxonomy::{CategoryPath, HierarchyLookup, Level, PathKey, TaxonomyEntry};
