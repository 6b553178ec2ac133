use std::cmp::Ordering;

use recall_core::{Message, ScoredMessage};

/// Cosine similarity in [-1, 1]. Mismatched lengths, empty or zero
/// vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Score `candidates` against `query`, keep those with `score >= threshold`,
/// and return the best `limit`, highest score first. Equal scores put the
/// most recent message first. Candidates without an embedding of the
/// query's length never match.
///
/// Filtering happens before truncation, so raising the threshold can only
/// shrink the result set.
pub fn rank(
    query: &[f32],
    candidates: impl IntoIterator<Item = Message>,
    limit: usize,
    threshold: f32,
) -> Vec<ScoredMessage> {
    let mut scored: Vec<ScoredMessage> = candidates
        .into_iter()
        .filter_map(|message| {
            let score = match message.embedding.as_deref() {
                Some(embedding) if embedding.len() == query.len() => {
                    cosine_similarity(query, embedding)
                }
                _ => return None,
            };
            (score >= threshold).then(|| ScoredMessage::new(message, score))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.message.timestamp.cmp(&a.message.timestamp))
    });
    scored.truncate(limit);
    scored
}
