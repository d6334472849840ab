//! Local classification: keyword dictionary, statistical model, decision engine

pub mod dictionary;
pub mod engine;
pub mod model;
pub mod resources;

pub use dictionary::{DictionaryMatch, KeywordDictionary};
pub use engine::{find_ambiguity_level, DecisionEngine};
pub use model::{CategoryModel, LinearModel, Prediction};
pub use resources::{ResourceRegistry, SectorResources};
