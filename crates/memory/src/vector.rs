//! Vector similarity and predicate-scoped ranking.

use docchat_core::error::VectorError;
use docchat_core::vector::{ScoredRecord, VectorQuery, VectorRecord, matches_all};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is empty, zero-norm, or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    dot / denom
}

/// Rank candidate records against a query.
///
/// Only records matching every predicate are scored. Results are sorted by
/// descending similarity and cut to `top_k`. An unscoped query is refused.
pub fn rank_records<'a, I>(records: I, query: &VectorQuery) -> Result<Vec<ScoredRecord>, VectorError>
where
    I: IntoIterator<Item = &'a VectorRecord>,
{
    query.ensure_scoped()?;

    let mut scored = Vec::new();
    for record in records {
        if !matches_all(&query.predicates, &record.metadata) {
            continue;
        }
        if record.embedding.len() != query.embedding.len() {
            return Err(VectorError::DimensionMismatch {
                expected: query.embedding.len(),
                actual: record.embedding.len(),
            });
        }
        let score = cosine_similarity(&record.embedding, &query.embedding);
        if query.min_score.is_some_and(|min| score < min) {
            continue;
        }
        scored.push(ScoredRecord {
            record: record.clone(),
            score,
        });
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(query.top_k);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docchat_core::vector::Predicate;

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }

    #[test]
    fn cosine_zero_and_mismatched() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn ranking_respects_predicates_and_top_k() {
        let records = vec![
            VectorRecord::new("a", vec![1.0, 0.0]).tag("file_id", "f1"),
            VectorRecord::new("b", vec![0.9, 0.1]).tag("file_id", "f1"),
            VectorRecord::new("c", vec![1.0, 0.0]).tag("file_id", "f2"),
        ];
        let query = VectorQuery::new(vec![1.0, 0.0], vec![Predicate::file("f1")], 1);
        let hits = rank_records(&records, &query).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.text, "a");
    }

    #[test]
    fn min_score_filters() {
        let records = vec![VectorRecord::new("a", vec![0.0, 1.0]).tag("file_id", "f1")];
        let mut query = VectorQuery::new(vec![1.0, 0.0], vec![Predicate::file("f1")], 5);
        query.min_score = Some(0.5);
        assert!(rank_records(&records, &query).unwrap().is_empty());
    }

    #[test]
    fn unscoped_ranking_is_refused() {
        let records = vec![VectorRecord::new("a", vec![1.0])];
        let query = VectorQuery::new(vec![1.0], vec![], 5);
        assert!(rank_records(&records, &query).is_err());
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let records = vec![VectorRecord::new("a", vec![1.0, 0.0, 0.0]).tag("file_id", "f1")];
        let query = VectorQuery::new(vec![1.0, 0.0], vec![Predicate::file("f1")], 5);
        assert!(matches!(
            rank_records(&records, &query),
            Err(VectorError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }
}
