//! Splitting card work into container-sized batches

use std::collections::HashMap;
use std::hash::Hash;

/// Maximum slots a single card container holds
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Split `items` into consecutive batches of at most `batch_size`.
///
/// Every batch but the last is full. A `batch_size` of zero is treated as one.
pub fn chunk<T>(items: &[T], batch_size: usize) -> Vec<&[T]> {
    items.chunks(batch_size.max(1)).collect()
}

/// Occurrences of each key within one batch
pub fn tally<T, K, F>(items: &[T], key: F) -> HashMap<K, usize>
where
    K: Eq + Hash,
    F: Fn(&T) -> Option<K>,
{
    let mut counts = HashMap::new();
    for item in items {
        if let Some(k) = key(item) {
            *counts.entry(k).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_sizes() {
        let units: Vec<u32> = (0..450).collect();
        let sizes: Vec<usize> = chunk(&units, DEFAULT_BATCH_SIZE).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![200, 200, 50]);
    }

    #[test]
    fn test_chunk_edges() {
        let exact: Vec<u32> = (0..400).collect();
        assert_eq!(chunk(&exact, 200).len(), 2);
        assert!(chunk::<u32>(&[], 200).is_empty());
        assert_eq!(chunk(&[1, 2, 3], 0).len(), 3);
    }

    #[test]
    fn test_chunk_preserves_order() {
        let units: Vec<u32> = (0..5).collect();
        let batches = chunk(&units, 2);
        assert_eq!(batches, vec![&[0, 1][..], &[2, 3][..], &[4][..]]);
    }

    #[test]
    fn test_tally_skips_missing_keys() {
        let pairs = [Some((1, 2)), Some((1, 2)), None, Some((3, 3))];
        let counts = tally(&pairs, |pair| *pair);
        assert_eq!(counts[&(1, 2)], 2);
        assert_eq!(counts[&(3, 3)], 1);
        assert_eq!(counts.len(), 2);
    }
}
