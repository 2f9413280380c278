//! Scoring Aggregator (C8) — best-of tracking per item, live score
//! triples per competency and overall, and stage-finalization summaries.
//!
//! Ported directly from `original_source/services/scoring.py`: the
//! `best_of` seed of `1.0`, the avg/median/max triple rounded to one
//! decimal, and the two-level (item -> competency -> overall) rollup are
//! all preserved exactly. The teacher's `insert_score`/`insert_scores_*`
//! analytics-DB calls are not reproduced — durability here is the
//! session checkpoint itself (`session::store::CheckpointStore`), which
//! already carries `ScoreCache` (see DESIGN.md).

use crate::session::{CompetencyScoreBucket, EvalResult, ItemScoreEntry, LiveScores, ScoreCache, ScoresTriple};

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn bucket_mut<'a>(cache: &'a mut ScoreCache, competency_id: &str) -> &'a mut CompetencyScoreBucket {
    cache.competencies.entry(competency_id.to_string()).or_default()
}

/// Append a turn's evaluation to its item's history and raise `best_of`
/// if this turn scored higher than anything seen before for the item
/// (I2: `best_of` is monotonic nondecreasing).
pub fn record_eval(cache: &mut ScoreCache, eval: EvalResult) {
    let bucket = bucket_mut(cache, &eval.competency_id);
    let item = bucket.items.entry(eval.item_id.clone()).or_insert_with(|| ItemScoreEntry {
        turns: Vec::new(),
        best_of: 1.0,
    });
    if eval.overall > item.best_of {
        item.best_of = eval.overall;
    }
    item.turns.push(eval);
}

/// Record a skipped item: bumps the competency's skip counter and
/// ensures the item exists in the bucket (with no turns) so it is
/// visible in later attempted/skipped accounting.
pub fn mark_skip(cache: &mut ScoreCache, competency_id: &str, item_id: &str) {
    let bucket = bucket_mut(cache, competency_id);
    bucket.skipped_count += 1;
    bucket.items.entry(item_id.to_string()).or_insert_with(|| ItemScoreEntry { turns: Vec::new(), best_of: 1.0 });
}

fn triples_from_bestofs(bestofs: &[f64]) -> ScoresTriple {
    if bestofs.is_empty() {
        return ScoresTriple { avg: 0.0, median: 0.0, max: 0.0 };
    }
    let sum: f64 = bestofs.iter().sum();
    let avg = round1(sum / bestofs.len() as f64);

    let mut sorted = bestofs.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        round1((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        round1(sorted[mid])
    };

    let max = round1(sorted.last().copied().unwrap_or(0.0));
    ScoresTriple { avg, median, max }
}

fn attempted_bestofs(bucket: &CompetencyScoreBucket) -> Vec<f64> {
    bucket.items.values().filter(|entry| !entry.turns.is_empty()).map(|entry| entry.best_of).collect()
}

/// Per-competency and overall score triples, recomputed fresh from the
/// cache on every call — there is no separate running total to drift out
/// of sync with `record_eval`/`mark_skip`.
pub fn live_scores(cache: &ScoreCache) -> LiveScores {
    let mut per_competency = std::collections::HashMap::new();
    let mut comp_avgs = Vec::new();

    for (comp_id, bucket) in &cache.competencies {
        let bestofs = attempted_bestofs(bucket);
        let triple = triples_from_bestofs(&bestofs);
        if !bestofs.is_empty() {
            comp_avgs.push(triple.avg);
        }
        per_competency.insert(comp_id.clone(), triple);
    }

    let overall = triples_from_bestofs(&comp_avgs);
    LiveScores { per_competency, overall }
}

#[derive(Debug, Clone)]
pub struct CompetencySummary {
    pub competency_id: String,
    pub triple: ScoresTriple,
    pub attempted: usize,
    pub skipped: u64,
}

pub fn finalize_competency(cache: &ScoreCache, competency_id: &str) -> CompetencySummary {
    let empty = CompetencyScoreBucket::default();
    let bucket = cache.competencies.get(competency_id).unwrap_or(&empty);
    let bestofs = attempted_bestofs(bucket);
    let attempted = bestofs.len();
    CompetencySummary {
        competency_id: competency_id.to_string(),
        triple: triples_from_bestofs(&bestofs),
        attempted,
        skipped: bucket.skipped_count,
    }
}

pub fn finalize_overall(cache: &ScoreCache) -> LiveScores {
    live_scores(cache)
}
