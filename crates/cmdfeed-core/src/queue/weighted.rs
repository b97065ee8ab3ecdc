//! Weighted random selection.

use rand::Rng;

/// Pick an index with probability proportional to its weight.
///
/// Zero-weight entries are never picked. Returns `None` when every weight is
/// zero or the slice is empty.
pub fn choose_weighted<R: Rng + ?Sized>(weights: &[u32], rng: &mut R) -> Option<usize> {
    let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
    if total == 0 {
        return None;
    }

    let mut point = rng.gen_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        let weight = u64::from(*weight);
        if point < weight {
            return Some(index);
        }
        point -= weight;
    }
    None
}
