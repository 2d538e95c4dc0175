//! Fuzzy matching of candidate facility names against the canonical roster.

use strsim::normalized_levenshtein;

use crate::MatchResult;

/// Acceptance threshold for title and description candidates during ingestion.
pub const PIPELINE_THRESHOLD: f64 = 0.7;

/// Looser threshold used by the standalone roster cross-check.
pub const CROSSCHECK_THRESHOLD: f64 = 0.6;

/// Case-insensitive similarity in `[0, 1]`; symmetric and `1.0` for equal strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
}

/// Score `candidate` against every roster entry and keep the best.
///
/// Verified only when the best score is strictly greater than `threshold`. Ties keep
/// the entry seen first. An absent candidate is not scored at all.
pub fn match_candidate<S: AsRef<str>>(
    candidate: Option<&str>,
    roster: &[S],
    threshold: f64,
) -> MatchResult {
    let Some(candidate) = candidate else {
        return MatchResult::unverified(0.0);
    };
    let candidate = candidate.to_lowercase();

    let mut best: Option<&str> = None;
    let mut best_score = 0.0;
    for entry in roster {
        let entry = entry.as_ref();
        let score = normalized_levenshtein(&candidate, &entry.to_lowercase());
        if score > best_score {
            best_score = score;
            best = Some(entry);
        }
    }

    match best {
        Some(name) if best_score > threshold => MatchResult::verified(name, best_score),
        _ => MatchResult::unverified(best_score),
    }
}
