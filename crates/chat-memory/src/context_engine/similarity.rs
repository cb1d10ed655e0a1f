//! Vector similarity and Maximal Marginal Relevance re-ranking
use crate::error::{MemoryError, Result};

/// Cosine similarity of two vectors.
///
/// Mismatched widths, zero-norm inputs and non-finite results all yield `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        sim as f32
    } else {
        0.0
    }
}

/// Greedy MMR selection of up to `k` candidate indices.
///
/// The first pick is the candidate closest to `query`; each later pick
/// maximises `lambda * sim(query) - (1 - lambda) * max sim(selected)`.
/// Ties go to the lowest index.
pub fn maximal_marginal_relevance(
    query: &[f32],
    candidates: &[Vec<f32>],
    lambda: f32,
    k: usize,
) -> Result<Vec<usize>> {
    if let Some(bad) = candidates.iter().find(|c| c.len() != query.len()) {
        return Err(MemoryError::EmbeddingMismatch {
            expected: query.len(),
            found: bad.len(),
        });
    }
    if k == 0 || candidates.is_empty() {
        return Ok(Vec::new());
    }

    let lambda = lambda as f64;
    let relevance: Vec<f64> = candidates
        .iter()
        .map(|c| cosine_similarity(query, c) as f64)
        .collect();
    let target = k.min(candidates.len());

    let mut selected: Vec<usize> = Vec::with_capacity(target);
    let mut chosen = vec![false; candidates.len()];
    // highest similarity to any already-selected candidate
    let mut redundancy = vec![f64::NEG_INFINITY; candidates.len()];

    let first = argmax(relevance.iter().copied().enumerate());
    selected.push(first);
    chosen[first] = true;

    while selected.len() < target {
        let last = selected[selected.len() - 1];
        for (i, candidate) in candidates.iter().enumerate() {
            if !chosen[i] {
                let sim = cosine_similarity(candidate, &candidates[last]) as f64;
                if sim > redundancy[i] {
                    redundancy[i] = sim;
                }
            }
        }

        let next = argmax(
            (0..candidates.len())
                .filter(|i| !chosen[*i])
                .map(|i| (i, lambda * relevance[i] - (1.0 - lambda) * redundancy[i])),
        );
        selected.push(next);
        chosen[next] = true;
    }

    Ok(selected)
}

fn argmax(scores: impl Iterator<Item = (usize, f64)>) -> usize {
    let mut best: Option<(usize, f64)> = None;
    for (i, score) in scores {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i).unwrap_or(0)
}
