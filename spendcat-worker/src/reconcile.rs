//! Reconciliation of LLM answers against a client taxonomy
//!
//! Cascade, first success wins:
//! - A: exact path
//! - B: level shift (answer one level too deep)
//! - C: valid N1/N2, fuzzy N3 and N4 within that branch
//! - D: reverse lookup from the leaf
//! - E: keep the raw answer, tagged unvalidated
//!
//! All comparisons are on trimmed, lower-cased values; adopted paths take
//! the taxonomy's display casing.

use serde::Serialize;
use spendcat_common::{text, HierarchyLookup, Level, PathKey};
use tracing::debug;

use crate::models::{Outcome, Reconciliation};

const UNCLASSIFIED: &[&str] = &["não identificado", "nao identificado"];

/// Per-step counters for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub exact_path: usize,
    pub level_shift: usize,
    pub partial_fuzzy: usize,
    pub leaf_reverse: usize,
    pub unvalidated: usize,
    /// Not an LLM row, or nothing to reconcile
    pub skipped: usize,
}

impl ReconcileStats {
    fn record(&mut self, step: Option<Reconciliation>) {
        match step {
            Some(Reconciliation::ExactPath) => self.exact_path += 1,
            Some(Reconciliation::LevelShift) => self.level_shift += 1,
            Some(Reconciliation::PartialFuzzy) => self.partial_fuzzy += 1,
            Some(Reconciliation::LeafReverse) => self.leaf_reverse += 1,
            Some(Reconciliation::Unvalidated) => self.unvalidated += 1,
            None => self.skipped += 1,
        }
    }

    pub fn corrected(&self) -> usize {
        self.level_shift + self.partial_fuzzy + self.leaf_reverse
    }
}

/// Reconcile every LLM-sourced outcome in place
pub fn reconcile_all(outcomes: &mut [Outcome], lookup: &HierarchyLookup, cutoff: f64) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    for outcome in outcomes.iter_mut() {
        stats.record(reconcile(outcome, lookup, cutoff));
    }
    debug!(
        exact = stats.exact_path,
        corrected = stats.corrected(),
        unvalidated = stats.unvalidated,
        skipped = stats.skipped,
        "Reconciliation pass"
    );
    stats
}

/// Reconcile one outcome in place; `None` when the row is not eligible
pub fn reconcile(outcome: &mut Outcome, lookup: &HierarchyLookup, cutoff: f64) -> Option<Reconciliation> {
    if !outcome.source.is_llm() || lookup.is_empty() {
        return None;
    }
    let n1 = text::key(&outcome.path.n1);
    if n1.is_empty() || UNCLASSIFIED.contains(&n1.as_str()) {
        return None;
    }
    let n2 = text::key(&outcome.path.n2);
    let n3 = text::key(&outcome.path.n3);
    let n4 = text::key(&outcome.path.n4);

    let resolved = exact_path(lookup, &n1, &n2, &n3, &n4)
        .or_else(|| level_shift(lookup, &n1, &n2, &n3, cutoff))
        .or_else(|| partial_fuzzy(lookup, &n1, &n2, &n3, &n4, cutoff))
        .or_else(|| leaf_reverse(lookup, &n1, &n2, &n3, &n4, cutoff));

    let step = match resolved {
        Some((step, PathKey(r1, r2, r3, r4))) => {
            outcome.path = lookup.canonical_path(&r1, &r2, &r3, &r4);
            step
        }
        None => Reconciliation::Unvalidated,
    };
    outcome.reconciliation = Some(step);
    Some(step)
}

type Resolved = (Reconciliation, PathKey);

fn exact_path(lookup: &HierarchyLookup, n1: &str, n2: &str, n3: &str, n4: &str) -> Option<Resolved> {
    let key = PathKey(n1.into(), n2.into(), n3.into(), n4.into());
    lookup
        .contains_path(&key)
        .then_some((Reconciliation::ExactPath, key))
}

/// Returned N1 is really an N2: prepend each possible parent
fn level_shift(lookup: &HierarchyLookup, n1: &str, n2: &str, n3: &str, cutoff: f64) -> Option<Resolved> {
    if lookup.is_valid(Level::N1, n1) || !lookup.is_valid(Level::N2, n1) {
        return None;
    }
    let parents = lookup.n1_parents(n1)?;
    for parent in parents {
        let shifted = PathKey(parent.clone(), n1.into(), n2.into(), n3.into());
        if lookup.contains_path(&shifted) {
            return Some((Reconciliation::LevelShift, shifted));
        }
        if let Some(leaves) = lookup.leaves(parent, n1, n2) {
            if let Some(leaf) = fuzzy_match(n3, leaves, cutoff) {
                return Some((
                    Reconciliation::LevelShift,
                    PathKey(parent.clone(), n1.into(), n2.into(), leaf),
                ));
            }
        }
    }
    None
}

/// N1 and N2 valid: resolve N3 then N4 inside the branch
fn partial_fuzzy(
    lookup: &HierarchyLookup,
    n1: &str,
    n2: &str,
    n3: &str,
    n4: &str,
    cutoff: f64,
) -> Option<Resolved> {
    if !lookup.is_valid(Level::N1, n1) || !lookup.is_valid(Level::N2, n2) {
        return None;
    }
    let n3_options = lookup.n3_children(n1, n2).filter(|s| !s.is_empty())?;
    let target_n3 = if n3_options.contains(n3) {
        n3.to_string()
    } else {
        fuzzy_match(n3, n3_options, cutoff)?
    };

    let leaves = lookup.leaves(n1, n2, &target_n3).filter(|s| !s.is_empty())?;
    let target_n4 = if leaves.contains(n4) {
        n4.to_string()
    } else if let Some(leaf) = fuzzy_match(n4, leaves, cutoff) {
        leaf
    } else if leaves.len() == 1 {
        leaves.iter().next()?.clone()
    } else {
        return None;
    };

    Some((
        Reconciliation::PartialFuzzy,
        PathKey(n1.into(), n2.into(), target_n3, target_n4),
    ))
}

/// Paths containing the leaf (exact, else fuzzy across all leaves)
fn leaf_reverse(
    lookup: &HierarchyLookup,
    n1: &str,
    n2: &str,
    n3: &str,
    n4: &str,
    cutoff: f64,
) -> Option<Resolved> {
    let mut leaf = n4.to_string();
    let mut paths = lookup.leaf_paths(n4);
    if paths.is_empty() {
        leaf = fuzzy_match(n4, lookup.values(Level::N4), cutoff)?;
        paths = lookup.leaf_paths(&leaf);
    }

    let chosen = match paths {
        [] => return None,
        [only] => only,
        _ => {
            let mut best: Option<(u32, &(String, String, String))> = None;
            for path in paths {
                let mut score = 0;
                if path.0 == n1 {
                    score += 3;
                }
                if path.1 == n2 {
                    score += 2;
                }
                if path.2 == n3 {
                    score += 1;
                }
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, path));
                }
            }
            match best {
                Some((score, path)) if score > 0 => path,
                _ => return None,
            }
        }
    };

    Some((
        Reconciliation::LeafReverse,
        PathKey(chosen.0.clone(), chosen.1.clone(), chosen.2.clone(), leaf),
    ))
}

/// Most similar candidate at or above `cutoff`; ties keep the first in order
pub fn fuzzy_match<'a, I>(value: &str, candidates: I, cutoff: f64) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    if value.is_empty() {
        return None;
    }
    let mut best: Option<(f64, &String)> = None;
    for candidate in candidates {
        let score = strsim::normalized_levenshtein(value, candidate);
        if score >= cutoff && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, c)| c.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchStatus, Source};
    use spendcat_common::CategoryPath;

    const CUTOFF: f64 = 0.6;

    fn lookup() -> HierarchyLookup {
        HierarchyLookup::new(&[
            CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Industrial"),
            CategoryPath::new("MRO", "Tubulações", "PVC", "Tubo Soldável"),
            CategoryPath::new("MRO", "Tubulações", "PVC", "Joelho 90"),
            CategoryPath::new("MRO", "Elétrica", "Cabos", "Cabo Flexível"),
            CategoryPath::new("Facilities", "Limpeza", "Químicos", "Detergente"),
            CategoryPath::new("Facilities", "Copa", "Descartáveis", "Copo"),
            CategoryPath::new("Escritório", "Copa", "Descartáveis", "Copo"),
        ])
    }

    fn llm(n1: &str, n2: &str, n3: &str, n4: &str) -> Outcome {
        Outcome::unique(CategoryPath::new(n1, n2, n3, n4), 0.9, Source::LlmBatch)
    }

    #[test]
    fn test_exact_path_takes_canonical_casing() {
        let mut outcome = llm("mro", "TUBULAÇÕES", " aço ", "tubo industrial");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::ExactPath));
        assert_eq!(outcome.path, CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Industrial"));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let lookup = lookup();
        let mut outcome = llm("MRO", "Tubulações", "Aço", "Tubo Industrial");
        reconcile(&mut outcome, &lookup, CUTOFF);
        let once = outcome.clone();
        reconcile(&mut outcome, &lookup, CUTOFF);
        assert_eq!(outcome, once);
        assert_eq!(outcome.reconciliation, Some(Reconciliation::ExactPath));
    }

    #[test]
    fn test_level_shift_corrects_one_level_too_deep() {
        let lookup = HierarchyLookup::new(&[CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Industrial")]);
        let mut outcome = llm("Tubulações", "Aço", "Tubo Industrial", "Tubo Industrial");
        assert_eq!(reconcile(&mut outcome, &lookup, CUTOFF), Some(Reconciliation::LevelShift));
        assert_eq!(outcome.path, CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Industrial"));
        assert_eq!(outcome.source_label(), "LLM (batch) [shift-corrected]");
    }

    #[test]
    fn test_level_shift_with_fuzzy_leaf() {
        let mut outcome = llm("Tubulações", "PVC", "Tubo Soldavel", "");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::LevelShift));
        assert_eq!(outcome.path.n4, "Tubo Soldável");
    }

    #[test]
    fn test_partial_fuzzy_within_branch() {
        let mut outcome = llm("MRO", "Elétrica", "Cabo", "Cabo flexivel 2,5mm");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::PartialFuzzy));
        assert_eq!(outcome.path, CategoryPath::new("MRO", "Elétrica", "Cabos", "Cabo Flexível"));
    }

    #[test]
    fn test_partial_fuzzy_single_leaf_branch() {
        let mut outcome = llm("Facilities", "Limpeza", "Químicos", "Sabão em pó");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::PartialFuzzy));
        assert_eq!(outcome.path.n4, "Detergente");
    }

    #[test]
    fn test_leaf_reverse_unique_and_scored() {
        let mut outcome = llm("Industrial", "Hidráulica", "Metal", "Tubo Industrial");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::LeafReverse));
        assert_eq!(outcome.path, CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Industrial"));

        let mut outcome = llm("Escritório", "Outros", "Outros", "Copo");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::LeafReverse));
        assert_eq!(outcome.path.n1, "Escritório");
    }

    #[test]
    fn test_leaf_reverse_needs_evidence_when_ambiguous() {
        let mut outcome = llm("Outro", "Outro", "Outro", "Copo");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::Unvalidated));
        assert_eq!(outcome.path.n1, "Outro");
        assert!(outcome.needs_review());
    }

    #[test]
    fn test_leaf_reverse_fuzzy_across_all_leaves() {
        let lookup = HierarchyLookup::new(&[
            CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Aço"),
            CategoryPath::new("MRO", "Elétrica", "Cabos", "Cabo Flexível"),
        ]);
        let mut outcome = llm("Materiais", "Hidráulica", "Metal", "Tubo Aco");
        assert_eq!(reconcile(&mut outcome, &lookup, CUTOFF), Some(Reconciliation::LeafReverse));
        assert_eq!(outcome.path, CategoryPath::new("MRO", "Tubulações", "Aço", "Tubo Aço"));
    }

    #[test]
    fn test_leaf_reverse_fuzzy_candidates_need_a_matching_level() {
        let lookup = HierarchyLookup::new(&[
            CategoryPath::new("Facilities", "Copa", "Descartáveis", "Copo Plástico"),
            CategoryPath::new("Escritório", "Copa", "Descartáveis", "Copo Plástico"),
        ]);

        let mut outcome = llm("Outro", "Outro", "Outro", "Copo Plastico");
        assert_eq!(reconcile(&mut outcome, &lookup, CUTOFF), Some(Reconciliation::Unvalidated));
        assert_eq!(outcome.path, CategoryPath::new("Outro", "Outro", "Outro", "Copo Plastico"));
        assert!(outcome.needs_review());

        let mut outcome = llm("Escritório", "Outro", "Outro", "Copo Plastico");
        assert_eq!(reconcile(&mut outcome, &lookup, CUTOFF), Some(Reconciliation::LeafReverse));
        assert_eq!(outcome.path, CategoryPath::new("Escritório", "Copa", "Descartáveis", "Copo Plástico"));
    }

    #[test]
    fn test_no_evidence_is_unvalidated_and_untouched() {
        let mut outcome = llm("Serviços", "Consultoria", "TI", "Licença de software");
        assert_eq!(reconcile(&mut outcome, &lookup(), CUTOFF), Some(Reconciliation::Unvalidated));
        assert_eq!(outcome.path, CategoryPath::new("Serviços", "Consultoria", "TI", "Licença de software"));
        assert_eq!(outcome.status, MatchStatus::Unique);
        assert_eq!(outcome.source_label(), "LLM (batch) [unvalidated]");
    }

    #[test]
    fn test_non_llm_and_unidentified_rows_are_skipped() {
        let lookup = lookup();
        let mut model_row = Outcome::unique(CategoryPath::new("x", "y", "z", "w"), 0.9, Source::Model);
        assert_eq!(reconcile(&mut model_row, &lookup, CUTOFF), None);
        assert_eq!(model_row.reconciliation, None);

        let mut unidentified = llm("Não Identificado", "", "", "");
        assert_eq!(reconcile(&mut unidentified, &lookup, CUTOFF), None);
    }

    #[test]
    fn test_reconcile_all_counts() {
        let mut outcomes = vec![
            llm("MRO", "Tubulações", "Aço", "Tubo Industrial"),
            llm("Tubulações", "Aço", "Tubo Industrial", "Tubo Industrial"),
            llm("Serviços", "", "", "Nada parecido"),
            Outcome::unmatched(0.0),
        ];
        let stats = reconcile_all(&mut outcomes, &lookup(), CUTOFF);
        assert_eq!(stats.exact_path, 1);
        assert_eq!(stats.level_shift, 1);
        assert_eq!(stats.unvalidated, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_fuzzy_match_cutoff_and_ties() {
        let candidates: Vec<String> = vec!["cabos".into(), "cabas".into(), "tubos".into()];
        assert_eq!(fuzzy_match("cabo", &candidates, 0.6), Some("cabos".to_string()));
        assert_eq!(fuzzy_match("xyz", &candidates, 0.6), None);
        assert_eq!(fuzzy_match("", &candidates, 0.0), None);
    }
}
