//! Per-path success/failure counters that re-rank fallback candidates.
//!
//! Ranking never drops a candidate, so worst-case coverage is the same as an
//! unordered search. Counters live for the lifetime of the engine only.
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Outcome counters for one candidate index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CandidateStats {
    pub successes: u64,
    pub failures: u64,
}

// keeps the ratio defined for a candidate with no observations
const SCORE_EPSILON: f64 = 1e-9;

impl CandidateStats {
    /// `successes / (successes + failures + ε)`. An unobserved candidate
    /// scores 0, so any recorded success ranks above it.
    pub fn score(&self) -> f64 {
        self.successes as f64 / ((self.successes + self.failures) as f64 + SCORE_EPSILON)
    }
}

pub type PathStats = BTreeMap<usize, CandidateStats>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LearnerStatus {
    pub paths: usize,
    pub observations: u64,
}

#[derive(Debug, Default)]
pub struct SelectorLearner {
    stats: Mutex<HashMap<String, PathStats>>,
}

impl SelectorLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, path: &str, index: usize) {
        let mut stats = self.stats.lock();
        stats
            .entry(path.to_string())
            .or_default()
            .entry(index)
            .or_default()
            .successes += 1;
    }

    pub fn record_failure(&self, path: &str, index: usize) {
        let mut stats = self.stats.lock();
        stats
            .entry(path.to_string())
            .or_default()
            .entry(index)
            .or_default()
            .failures += 1;
    }

    /// Pair every candidate with its original index and sort by score,
    /// highest first. The sort is stable so ties keep their original order.
    pub fn get_optimized_order(&self, path: &str, candidates: &[String]) -> Vec<(usize, String)> {
        let mut ranked: Vec<(usize, String, f64)> = {
            let stats = self.stats.lock();
            let path_stats = stats.get(path);
            candidates
                .iter()
                .enumerate()
                .map(|(index, selector)| {
                    let score = path_stats
                        .and_then(|s| s.get(&index))
                        .copied()
                        .unwrap_or_default()
                        .score();
                    (index, selector.clone(), score)
                })
                .collect()
        };
        ranked.sort_by(|a, b| b.2.total_cmp(&a.2));
        ranked
            .into_iter()
            .map(|(index, selector, _)| (index, selector))
            .collect()
    }

    pub fn stats(&self, path: &str) -> PathStats {
        self.stats.lock().get(path).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, PathStats> {
        self.stats
            .lock()
            .iter()
            .map(|(path, stats)| (path.clone(), stats.clone()))
            .collect()
    }

    /// Forget everything recorded for `path`; used when its candidate list changes.
    pub fn reset(&self, path: &str) {
        if self.stats.lock().remove(path).is_some() {
            tracing::debug!(%path, "learner.reset");
        }
    }

    pub fn status(&self) -> LearnerStatus {
        let stats = self.stats.lock();
        LearnerStatus {
            paths: stats.len(),
            observations: stats
                .values()
                .flat_map(|p| p.values())
                .map(|c| c.successes + c.failures)
                .sum(),
        }
    }
}
