//! Reciprocal Rank Fusion over ranked result lists
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedItem<T> {
    pub item: T,
    pub score: f64,
}

/// Fuse ranked lists: `score = Σ 1 / (rank + 1)` with 0-based ranks.
///
/// Items are deduplicated by `key`, keeping the first-seen record. Equal
/// scores keep first-seen order (list index, then rank).
pub fn reciprocal_rank_fusion<T, K, F>(result_sets: Vec<Vec<T>>, key: F) -> Vec<FusedItem<T>>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut position: HashMap<K, usize> = HashMap::new();
    let mut fused: Vec<FusedItem<T>> = Vec::new();

    for set in result_sets {
        for (rank, item) in set.into_iter().enumerate() {
            let contribution = 1.0 / (rank as f64 + 1.0);
            match position.get(&key(&item)) {
                Some(&idx) => fused[idx].score += contribution,
                None => {
                    position.insert(key(&item), fused.len());
                    fused.push(FusedItem { item, score: contribution });
                }
            }
        }
    }

    // stable sort keeps first-seen order among equal scores
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}
