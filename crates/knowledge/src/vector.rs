//! Cosine-similarity vector ranking.

use uuid::Uuid;

use butler_domain::knowledge::KnowledgeItem;

/// Cosine similarity; 0.0 for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Top `limit` items by cosine similarity to the query embedding, at or
/// above `threshold`, best first (stable by id on ties).
pub fn rank_vector(
    query_embedding: &[f32],
    items: &[KnowledgeItem],
    limit: usize,
    threshold: f32,
) -> Vec<(Uuid, f32)> {
    let mut scored: Vec<(Uuid, f32)> = items
        .iter()
        .filter_map(|item| {
            let sim = cosine_similarity(query_embedding, &item.embedding);
            (sim >= threshold).then_some((item.id, sim))
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(limit);
    scored
}
