//! Classification decision engine
//!
//! Per description, in order:
//! 1. open sectors ask the LLM first;
//! 2. model top-K: confident → Unique, middling → Ambiguous at the first
//!    divergent level, weak → dictionary;
//! 3. dictionary: best-scoring category, ties Ambiguous on differing levels;
//! 4. optional LLM last resort, else Unmatched.
//!
//! [`DecisionEngine::classify_local`] stops after step 3 so the chunk
//! processor can batch the LLM calls itself.

use spendcat_common::{text, CategoryPath, Level};
use std::sync::Arc;
use tracing::debug;

use super::dictionary::DictionaryMatch;
use super::model::Prediction;
use super::resources::SectorResources;
use crate::config::ClassificationConfig;
use crate::error::ClassificationError;
use crate::llm::{LlmClassifier, LlmContext, LlmGuess};
use crate::models::{MatchStatus, Outcome, Source};

/// Decision engine for one sector
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: ClassificationConfig,
    resources: Arc<SectorResources>,
}

impl DecisionEngine {
    pub fn new(config: ClassificationConfig, resources: Arc<SectorResources>) -> Self {
        Self { config, resources }
    }

    pub fn sector(&self) -> &str {
        &self.resources.sector
    }

    pub fn config(&self) -> &ClassificationConfig {
        &self.config
    }

    /// Sector relies on the LLM's general knowledge
    pub fn is_open_sector(&self) -> bool {
        self.config.is_open_sector(&self.resources.sector)
    }

    /// Steps 2 and 3 (model, then dictionary); never calls the LLM
    pub fn classify_local(&self, description: &str) -> Result<Outcome, ClassificationError> {
        let desc_norm = text::normalize(description);

        let mut ml_confidence = 0.0;
        if let Some(model) = &self.resources.model {
            let candidates = model.predict_top_k(description, self.config.top_k)?;
            if let Some(top) = candidates.first() {
                ml_confidence = top.confidence;

                if top.confidence >= self.config.unique_threshold {
                    return Ok(Outcome::unique(top.path.clone(), top.confidence, Source::Model));
                }
                if top.confidence >= self.config.ambiguous_threshold {
                    return Ok(ambiguous_from_candidates(&candidates));
                }
            }
        }

        if let Some(dictionary) = &self.resources.dictionary {
            match dictionary.match_normalized(&desc_norm) {
                DictionaryMatch::Unique { path, terms, score } => {
                    debug!(sector = %self.resources.sector, score, "Dictionary match");
                    let mut outcome = Outcome::unique(path, ml_confidence, Source::Dictionary);
                    outcome.matched_terms = terms;
                    return Ok(outcome);
                }
                DictionaryMatch::Tie { paths, terms, .. } => {
                    let mut outcome = ambiguous_from_tie(&paths, ml_confidence);
                    outcome.matched_terms = terms;
                    return Ok(outcome);
                }
                DictionaryMatch::None => {}
            }
        }

        Ok(Outcome::unmatched(ml_confidence))
    }

    /// Full cascade including the single-item LLM calls
    pub async fn classify(
        &self,
        description: &str,
        llm: &dyn LlmClassifier,
        context: &LlmContext,
    ) -> Result<Outcome, ClassificationError> {
        if self.is_open_sector() {
            return Ok(ask_llm(description, llm, context)
                .await
                .unwrap_or_else(|| Outcome::unmatched(0.0)));
        }

        let local = self.classify_local(description)?;
        if local.status != MatchStatus::Unmatched || !llm.is_enabled() {
            return Ok(local);
        }

        Ok(ask_llm(description, llm, context)
            .await
            .unwrap_or(local))
    }
}

/// Single-item LLM call; `None` when the answer is unusable
async fn ask_llm(description: &str, llm: &dyn LlmClassifier, context: &LlmContext) -> Option<Outcome> {
    let guesses = llm.classify(&[description.to_string()], context).await;
    let guess = guesses.into_iter().next().filter(|g| !g.is_placeholder())?;
    Some(outcome_from_guess(guess, Source::Llm))
}

/// Unique outcome from a usable LLM guess
pub fn outcome_from_guess(guess: LlmGuess, source: Source) -> Outcome {
    let mut outcome = Outcome::unique(guess.path.trimmed(), guess.confidence, source);
    if !guess.explanation.is_empty() {
        outcome.explanation = Some(guess.explanation);
    }
    outcome
}

/// First level whose non-empty candidate values are not all identical,
/// with the distinct values in first-seen order
pub fn find_ambiguity_level(candidates: &[CategoryPath]) -> Option<(Level, Vec<String>)> {
    Level::ALL.into_iter().find_map(|level| {
        let mut options: Vec<String> = Vec::new();
        for candidate in candidates {
            let value = candidate.get(level).trim();
            if !value.is_empty() && !options.iter().any(|o| o == value) {
                options.push(value.to_string());
            }
        }
        (options.len() > 1).then_some((level, options))
    })
}

/// Keep levels above `level` from `top`, blank the rest
fn prefix_above(top: &CategoryPath, level: Level) -> CategoryPath {
    let mut path = CategoryPath::default();
    for above in Level::ALL.into_iter().take_while(|l| *l != level) {
        path.set(above, top.get(above));
    }
    path
}

fn ambiguous_from_candidates(candidates: &[Prediction]) -> Outcome {
    let top = &candidates[0];
    let paths: Vec<CategoryPath> = candidates.iter().map(|c| c.path.clone()).collect();

    match find_ambiguity_level(&paths) {
        Some((level, options)) => Outcome {
            status: MatchStatus::Ambiguous,
            ambiguity_level: Some(level),
            ambiguous_options: options,
            ..Outcome::unique(prefix_above(&top.path, level), top.confidence, Source::Model)
        },
        // Candidates agree everywhere: keep the full path, still flagged
        None => Outcome {
            status: MatchStatus::Ambiguous,
            ..Outcome::unique(top.path.clone(), top.confidence, Source::Model)
        },
    }
}

/// Tied dictionary categories: shared levels kept, differing levels blanked
fn ambiguous_from_tie(paths: &[CategoryPath], confidence: f64) -> Outcome {
    let mut merged = CategoryPath::default();
    for level in Level::ALL {
        let first = paths.first().map(|p| p.get(level)).unwrap_or_default();
        if paths.iter().all(|p| text::key(p.get(level)) == text::key(first)) {
            merged.set(level, first);
        }
    }

    let first_divergent = Level::ALL
        .into_iter()
        .find(|level| merged.get(*level).is_empty() && paths.iter().any(|p| !p.get(*level).is_empty()));

    let options = first_divergent
        .map(|level| {
            let mut options: Vec<String> = Vec::new();
            for path in paths {
                let value = path.get(level).trim();
                if !value.is_empty() && !options.iter().any(|o| o == value) {
                    options.push(value.to_string());
                }
            }
            options
        })
        .unwrap_or_default();

    Outcome {
        status: MatchStatus::Ambiguous,
        ambiguity_level: first_divergent,
        ambiguous_options: options,
        ..Outcome::unique(merged, confidence, Source::Dictionary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::dictionary::KeywordDictionary;
    use crate::classify::model::CategoryModel;
    use crate::llm::{DisabledClassifier, ScriptedClassifier};

    /// Fixed ranking regardless of input
    struct FixedModel(Vec<Prediction>);

    impl CategoryModel for FixedModel {
        fn predict_top_k(&self, _description: &str, k: usize) -> Result<Vec<Prediction>, ClassificationError> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    struct BrokenModel;

    impl CategoryModel for BrokenModel {
        fn predict_top_k(&self, _description: &str, _k: usize) -> Result<Vec<Prediction>, ClassificationError> {
            Err(ClassificationError::Model("corrupt weights".into()))
        }
    }

    fn prediction(n1: &str, n2: &str, n3: &str, n4: &str, confidence: f64) -> Prediction {
        Prediction {
            path: CategoryPath::new(n1, n2, n3, n4),
            confidence,
        }
    }

    fn dictionary() -> KeywordDictionary {
        let csv = "N1,N2,N3,N4,Keywords\n\
                   MRO,Elétrica,Cabos,Cabo Flexível,cabo\n\
                   MRO,Elétrica,Cabos,Cabo Rígido,cabo\n\
                   Facilities,Limpeza,Químicos,Detergente,detergente\n";
        KeywordDictionary::from_csv_reader(csv.as_bytes()).unwrap()
    }

    fn engine(model: Option<Arc<dyn CategoryModel>>, with_dictionary: bool, sector: &str) -> DecisionEngine {
        let resources = SectorResources {
            sector: sector.to_string(),
            dictionary: with_dictionary.then(|| Arc::new(dictionary())),
            model,
        };
        DecisionEngine::new(ClassificationConfig::default(), Arc::new(resources))
    }

    #[test]
    fn test_confident_model_is_unique() {
        let model = FixedModel(vec![prediction("MRO", "Elétrica", "Cabos", "Cabo Flexível", 0.8)]);
        let outcome = engine(Some(Arc::new(model)), true, "Industrial")
            .classify_local("cabo flexível")
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::Unique);
        assert_eq!(outcome.source, Source::Model);
        assert_eq!(outcome.path.n4, "Cabo Flexível");
    }

    #[test]
    fn test_middling_model_is_ambiguous_at_n3() {
        let model = FixedModel(vec![
            prediction("MRO", "Tubulações", "Aço", "Tubo Industrial", 0.30),
            prediction("MRO", "Tubulações", "PVC", "Tubo Soldável", 0.28),
            prediction("MRO", "Tubulações", "Aço", "Tubo Galvanizado", 0.20),
        ]);
        let outcome = engine(Some(Arc::new(model)), true, "Industrial")
            .classify_local("tubo")
            .unwrap();

        assert_eq!(outcome.status, MatchStatus::Ambiguous);
        assert_eq!(outcome.ambiguity_level, Some(Level::N3));
        assert_eq!(outcome.path, CategoryPath::new("MRO", "Tubulações", "", ""));
        assert_eq!(outcome.ambiguous_options, vec!["Aço", "PVC"]);
        assert_eq!(outcome.confidence, 0.30);
    }

    #[test]
    fn test_middling_model_skips_dictionary() {
        let model = FixedModel(vec![
            prediction("A", "", "", "x", 0.3),
            prediction("B", "", "", "y", 0.2),
        ]);
        let outcome = engine(Some(Arc::new(model)), true, "Industrial")
            .classify_local("detergente")
            .unwrap();
        assert_eq!(outcome.source, Source::Model);
        assert_eq!(outcome.ambiguity_level, Some(Level::N1));
        assert!(outcome.path.is_empty());
    }

    #[test]
    fn test_weak_model_falls_back_to_dictionary() {
        let model = FixedModel(vec![prediction("X", "Y", "Z", "W", 0.1)]);
        let outcome = engine(Some(Arc::new(model)), true, "Industrial")
            .classify_local("Detergente neutro 5L")
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::Unique);
        assert_eq!(outcome.source, Source::Dictionary);
        assert_eq!(outcome.path.n1, "Facilities");
        assert_eq!(outcome.matched_terms, vec!["detergente"]);
        assert_eq!(outcome.confidence, 0.1);
    }

    #[test]
    fn test_dictionary_tie_blanks_only_differing_levels() {
        let outcome = engine(None, true, "Industrial").classify_local("cabo 2,5mm").unwrap();
        assert_eq!(outcome.status, MatchStatus::Ambiguous);
        assert_eq!(outcome.path, CategoryPath::new("MRO", "Elétrica", "Cabos", ""));
        assert_eq!(outcome.ambiguity_level, Some(Level::N4));
        assert_eq!(outcome.ambiguous_options, vec!["Cabo Flexível", "Cabo Rígido"]);
        assert_eq!(outcome.source, Source::Dictionary);
    }

    #[test]
    fn test_nothing_matches_is_unmatched() {
        let outcome = engine(None, true, "Industrial").classify_local("parafuso").unwrap();
        assert_eq!(outcome.status, MatchStatus::Unmatched);
        assert!(outcome.path.is_empty());
        assert_eq!(outcome.confidence, 0.0);

        let outcome = engine(None, false, "Industrial").classify_local("cabo").unwrap();
        assert_eq!(outcome.status, MatchStatus::Unmatched);
    }

    #[test]
    fn test_broken_model_is_an_error() {
        let result = engine(Some(Arc::new(BrokenModel)), true, "Industrial").classify_local("cabo");
        assert!(matches!(result, Err(ClassificationError::Model(_))));
    }

    #[test]
    fn test_find_ambiguity_level() {
        let same = CategoryPath::new("A", "B", "C", "D");
        assert_eq!(find_ambiguity_level(&[same.clone(), same.clone()]), None);

        let other = CategoryPath::new("A", "B2", "C", "D");
        assert_eq!(
            find_ambiguity_level(&[same, other]),
            Some((Level::N2, vec!["B".to_string(), "B2".to_string()]))
        );
    }

    #[test]
    fn test_identical_candidates_keep_full_path() {
        let model = FixedModel(vec![
            prediction("A", "B", "C", "D", 0.3),
            prediction("A", "B", "C", "D", 0.3),
        ]);
        let outcome = engine(Some(Arc::new(model)), false, "Industrial")
            .classify_local("x")
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::Ambiguous);
        assert_eq!(outcome.ambiguity_level, None);
        assert_eq!(outcome.path.n4, "D");
    }

    #[tokio::test]
    async fn test_open_sector_asks_llm_first() {
        let llm = ScriptedClassifier::new()
            .with_answer("cabo", CategoryPath::new("Elétrica", "Fios", "Cabos", "Cabo"));
        let engine = engine(None, true, "Padrão");
        assert!(engine.is_open_sector());

        let outcome = engine.classify("cabo", &llm, &LlmContext::default()).await.unwrap();
        assert_eq!(outcome.source, Source::Llm);
        assert_eq!(outcome.path.n1, "Elétrica");
        assert_eq!(llm.calls(), 1);

        let outcome = engine.classify("desconhecido", &llm, &LlmContext::default()).await.unwrap();
        assert_eq!(outcome.status, MatchStatus::Unmatched);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_llm_is_last_resort_only() {
        let llm = ScriptedClassifier::new()
            .with_answer("parafuso", CategoryPath::new("MRO", "Fixação", "Parafusos", "Parafuso"))
            .with_answer("detergente", CategoryPath::new("Wrong", "", "", ""));
        let engine = engine(None, true, "Industrial");

        let outcome = engine.classify("detergente", &llm, &LlmContext::default()).await.unwrap();
        assert_eq!(outcome.source, Source::Dictionary);
        assert_eq!(llm.calls(), 0);

        let outcome = engine.classify("parafuso", &llm, &LlmContext::default()).await.unwrap();
        assert_eq!(outcome.status, MatchStatus::Unique);
        assert_eq!(outcome.source, Source::Llm);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_disabled_llm_is_not_called() {
        let outcome = engine(None, true, "Industrial")
            .classify("parafuso", &DisabledClassifier, &LlmContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, MatchStatus::Unmatched);
    }
}
