//! Per-sector classification resources
//!
//! Dictionaries and models are loaded lazily from
//! `<models_dir>/<sector>/dictionary.csv` and `<models_dir>/<sector>/model.json`
//! and cached by sector. After retraining, the owner calls
//! [`ResourceRegistry::invalidate`] so the next lookup reloads from disk.

use spendcat_common::text;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::dictionary::KeywordDictionary;
use super::model::{CategoryModel, LinearModel};
use crate::error::{WorkerError, WorkerResult};

pub const DICTIONARY_FILE: &str = "dictionary.csv";
pub const MODEL_FILE: &str = "model.json";

/// What is available for one sector
#[derive(Clone, Default)]
pub struct SectorResources {
    pub sector: String,
    pub dictionary: Option<Arc<KeywordDictionary>>,
    pub model: Option<Arc<dyn CategoryModel>>,
}

impl std::fmt::Debug for SectorResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorResources")
            .field("sector", &self.sector)
            .field("dictionary", &self.dictionary.as_ref().map(|d| d.len()))
            .field("model", &self.model.is_some())
            .finish()
    }
}

impl SectorResources {
    /// No dictionary, no model
    pub fn empty(sector: impl Into<String>) -> Self {
        Self {
            sector: sector.into(),
            ..Self::default()
        }
    }
}

/// Cache of [`SectorResources`] keyed by normalized sector name
#[derive(Debug)]
pub struct ResourceRegistry {
    models_dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<SectorResources>>>,
}

impl ResourceRegistry {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Cache key and folder name for a sector (`"Padrão"` → `"padrao"`)
    pub fn sector_key(sector: &str) -> String {
        text::fold(sector).replace(' ', "_")
    }

    /// Resources for `sector`, loading on first use
    ///
    /// Missing artifacts are degradations: the returned resources simply lack
    /// the dictionary and/or the model.
    pub fn get(&self, sector: &str) -> Arc<SectorResources> {
        let key = Self::sector_key(sector);
        {
            let cache = match self.cache.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(resources) = cache.get(&key) {
                return Arc::clone(resources);
            }
        }

        let resources = Arc::new(self.load(sector, &key));
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(cache.entry(key).or_insert(resources))
    }

    /// Install resources directly (preloaded or built in memory)
    pub fn insert(&self, sector: &str, resources: SectorResources) {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(Self::sector_key(sector), Arc::new(resources));
    }

    /// Drop the cached entry for one sector
    pub fn invalidate(&self, sector: &str) -> bool {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = cache.remove(&Self::sector_key(sector)).is_some();
        if removed {
            info!(sector, "Sector resources invalidated");
        }
        removed
    }

    /// Drop every cached entry
    pub fn invalidate_all(&self) {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = cache.len();
        cache.clear();
        info!(count, "All sector resources invalidated");
    }

    pub fn cached_sectors(&self) -> usize {
        match self.cache.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn load(&self, sector: &str, key: &str) -> SectorResources {
        let dir = self.models_dir.join(key);

        let dictionary = match load_dictionary(&dir) {
            Ok(d) => Some(Arc::new(d)),
            Err(e) => {
                warn!(sector, error = %e, "Keyword dictionary unavailable");
                None
            }
        };

        let model: Option<Arc<dyn CategoryModel>> = match load_model(&dir) {
            Ok(m) => Some(Arc::new(m)),
            Err(e) => {
                warn!(sector, error = %e, "Continuing without statistical model");
                None
            }
        };

        info!(
            sector,
            dictionary = dictionary.is_some(),
            model = model.is_some(),
            "Sector resources loaded"
        );

        SectorResources {
            sector: sector.to_string(),
            dictionary,
            model,
        }
    }
}

fn load_dictionary(dir: &Path) -> WorkerResult<KeywordDictionary> {
    let path = dir.join(DICTIONARY_FILE);
    if !path.is_file() {
        return Err(WorkerError::NotFound(path.display().to_string()));
    }
    KeywordDictionary::load(&path)
}

fn load_model(dir: &Path) -> WorkerResult<LinearModel> {
    let path = dir.join(MODEL_FILE);
    if !path.is_file() {
        return Err(WorkerError::ModelUnavailable(path.display().to_string()));
    }
    LinearModel::load(&path)
}
