//! Rank fusion and score blending
//!
//! Reciprocal-rank fusion combines the dense and lexical candidate lists
//! without requiring calibrated score compatibility; the weighted blend then
//! acts as a tunable tie-break over per-query normalized component scores.

use std::collections::HashMap;

/// A candidate after rank fusion, with the rank it held on each side.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub id: String,
    pub rrf_score: f64,
    pub dense_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
}

/// Reciprocal Rank Fusion over the two candidate id lists, best first.
///
/// Each candidate scores `1/(k + rank)` per side it appears on; a missing
/// side contributes zero. `k` (typically 60) dampens the effect of top ranks.
pub fn reciprocal_rank_fusion(
    dense_ids: &[String],
    lexical_ids: &[String],
    k: f64,
) -> Vec<FusedCandidate> {
    let mut fused: HashMap<String, FusedCandidate> = HashMap::new();

    for (rank, id) in dense_ids.iter().enumerate() {
        let entry = fused.entry(id.clone()).or_insert_with(|| FusedCandidate {
            id: id.clone(),
            rrf_score: 0.0,
            dense_rank: None,
            lexical_rank: None,
        });
        entry.rrf_score += 1.0 / (k + rank as f64);
        entry.dense_rank = Some(rank);
    }
    for (rank, id) in lexical_ids.iter().enumerate() {
        let entry = fused.entry(id.clone()).or_insert_with(|| FusedCandidate {
            id: id.clone(),
            rrf_score: 0.0,
            dense_rank: None,
            lexical_rank: None,
        });
        entry.rrf_score += 1.0 / (k + rank as f64);
        entry.lexical_rank = Some(rank);
    }

    let mut results: Vec<FusedCandidate> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results
}

/// Min-max normalize scores to [0, 1] within this query. A constant list
/// maps to 1.0 so a lone candidate keeps full weight.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let Some(max) = scores
        .iter()
        .copied()
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return Vec::new();
    };
    let min = scores
        .iter()
        .copied()
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or(max);
    let range = max - min;
    scores
        .iter()
        .map(|s| {
            if range <= f64::EPSILON {
                1.0
            } else {
                (s - min) / range
            }
        })
        .collect()
}

/// Exponential recency boost in [0, 1].
pub fn recency_boost(age_seconds: f64, half_life_seconds: f64) -> f64 {
    if half_life_seconds <= 0.0 {
        return 0.0;
    }
    (-age_seconds.max(0.0) / half_life_seconds).exp()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rrf_rewards_presence_on_both_sides() {
        let dense = ids(&["a", "b", "c"]);
        let lexical = ids(&["b", "a", "d"]);
        let fused = reciprocal_rank_fusion(&dense, &lexical, 60.0);

        // a and b appear on both sides and outrank the single-side entries.
        assert!(fused[0].id == "a" || fused[0].id == "b");
        assert!(fused[1].id == "a" || fused[1].id == "b");
        let d = fused.iter().find(|f| f.id == "d").unwrap();
        assert!(d.dense_rank.is_none());
        assert_eq!(d.lexical_rank, Some(2));
    }

    #[test]
    fn test_rrf_missing_side_contributes_zero() {
        let dense: Vec<String> = vec![];
        let lexical = ids(&["only"]);
        let fused = reciprocal_rank_fusion(&dense, &lexical, 60.0);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].rrf_score - 1.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_is_sorted_descending() {
        let dense = ids(&["a", "b", "c", "d"]);
        let lexical = ids(&["c", "d", "a"]);
        let fused = reciprocal_rank_fusion(&dense, &lexical, 60.0);
        for pair in fused.windows(2) {
            assert!(pair[0].rrf_score >= pair[1].rrf_score);
        }
    }

    #[test]
    fn test_normalize_scores() {
        let normalized = normalize_scores(&[2.0, 4.0, 6.0]);
        assert_eq!(normalized, vec![0.0, 0.5, 1.0]);

        // Constant list keeps full weight.
        assert_eq!(normalize_scores(&[3.0, 3.0]), vec![1.0, 1.0]);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_recency_boost_decays() {
        let half_life = 3600.0;
        let fresh = recency_boost(0.0, half_life);
        let hour = recency_boost(3600.0, half_life);
        let day = recency_boost(86400.0, half_life);
        assert!((fresh - 1.0).abs() < 1e-12);
        assert!(hour < fresh && day < hour);
        assert!(day > 0.0);
    }
}
