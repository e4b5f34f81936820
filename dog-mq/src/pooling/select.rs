use rand::Rng;

use crate::types::Pool;

/// Weighted random choice; pools with weight 0 are never picked.
///
/// Returns `None` when no pool has a positive weight.
pub fn weighted<'a, R: Rng + ?Sized>(pools: &'a [Pool], rng: &mut R) -> Option<&'a Pool> {
    let total: u64 = pools.iter().map(|p| u64::from(p.weight)).sum();
    if total == 0 {
        return None;
    }

    let mut pick = rng.gen_range(0..total);
    for pool in pools.iter().filter(|p| p.weight > 0) {
        let weight = u64::from(pool.weight);
        if pick < weight {
            return Some(pool);
        }
        pick -= weight;
    }
    None
}
