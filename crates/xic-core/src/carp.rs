//! Weighted rendezvous hashing (CARP).
//!
//! Every member gets a 64-bit hash of its identifier. For a 32-bit key the
//! score of member `i` is `combine(hash_i, key)`, optionally scaled by a
//! per-member load factor. [`Carp::which`] returns the member with the best
//! score; [`Carp::sequence`] ranks the best `k`.
//!
//! Load factors follow the Cache Array Routing Protocol draft so that, in
//! expectation, each member receives a share of keys proportional to its
//! weight. Members with weight 0 never win.

use crate::{Result, XicError};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Deterministic selector over a fixed member set.
#[derive(Debug, Clone)]
pub struct Carp {
    hashes: Vec<u64>,
    /// `None` for an unweighted selector.
    factors: Option<Vec<f64>>,
}

impl Carp {
    /// Unweighted selector over the given member identifiers.
    pub fn new(members: &[u32]) -> Result<Self> {
        if members.is_empty() {
            return Err(XicError::InvalidParams {
                message: "CARP needs at least one member".to_string(),
            });
        }
        Ok(Self {
            hashes: members.iter().map(|&id| member_hash(id)).collect(),
            factors: None,
        })
    }

    /// Weighted selector. `weights[i]` belongs to `members[i]`.
    ///
    /// If every weight is zero the selector behaves as unweighted.
    pub fn weighted(members: &[u32], weights: &[u32]) -> Result<Self> {
        if members.len() != weights.len() {
            return Err(XicError::InvalidParams {
                message: format!(
                    "CARP got {} members but {} weights",
                    members.len(),
                    weights.len()
                ),
            });
        }
        let mut carp = Self::new(members)?;
        if weights.iter().any(|&w| w > 0) {
            carp.factors = Some(load_factors(weights));
        }
        Ok(carp)
    }

    /// Unweighted selector whose member identifiers are checksums of names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let ids: Vec<u32> = names
            .iter()
            .map(|name| crc32c::crc32c(name.as_ref().as_bytes()))
            .collect();
        Self::new(&ids)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Index of the member with the highest score for `key`.
    ///
    /// Ties go to the lowest index.
    pub fn which(&self, key: u32) -> usize {
        let mut best = 0;
        let mut best_score = self.score(0, key);
        for i in 1..self.hashes.len() {
            let score = self.score(i, key);
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        best
    }

    /// Indices of the `k` best members for `key`, best first.
    ///
    /// `k` is clamped to the member count. Among equal scores the member
    /// with the lower index ranks first.
    pub fn sequence(&self, key: u32, k: usize) -> Vec<usize> {
        let k = k.min(self.hashes.len());
        if k == 0 {
            return Vec::new();
        }

        // Min-heap keyed by (score, later index first) so the root is the
        // entry to evict: lowest score, and among equals the latest inserted.
        let mut heap: BinaryHeap<Reverse<(Score, Reverse<usize>)>> = BinaryHeap::with_capacity(k);
        for i in 0..self.hashes.len() {
            let score = Score(self.score(i, key));
            if heap.len() < k {
                heap.push(Reverse((score, Reverse(i))));
                continue;
            }
            let replace = heap
                .peek()
                .map(|Reverse((min, _))| score > *min)
                .unwrap_or(false);
            if replace {
                heap.pop();
                heap.push(Reverse((score, Reverse(i))));
            }
        }

        let mut ranked: Vec<(Score, usize)> = heap
            .into_iter()
            .map(|Reverse((score, Reverse(i)))| (score, i))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, i)| i).collect()
    }

    fn score(&self, index: usize, key: u32) -> f64 {
        let combined = f64::from(combine(self.hashes[index], key));
        match &self.factors {
            Some(factors) => factors[index] * combined,
            None => combined,
        }
    }
}

/// Combine a member hash with a key.
pub fn combine(member_hash: u64, key: u32) -> u32 {
    let low = member_hash as u32;
    let high = (member_hash >> 32) as u32;
    mix32(key.wrapping_sub(low) ^ high)
}

/// 32-bit avalanche finalizer.
pub fn mix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Spread a 32-bit member identifier over 64 bits.
pub fn member_hash(id: u32) -> u64 {
    let mut z = u64::from(id).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// CARP load factors, one per member, in member order.
///
/// Members are processed in ascending weight order (ties by index); only
/// positive weights take part in the recurrence.
fn load_factors(weights: &[u32]) -> Vec<f64> {
    let total: f64 = weights.iter().map(|&w| f64::from(w)).sum();
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by_key(|&i| (weights[i], i));
    let positive: Vec<usize> = order.into_iter().filter(|&i| weights[i] > 0).collect();

    let n = positive.len();
    let mut factors = vec![0.0; weights.len()];
    let mut product = 1.0;
    let mut prev_factor: f64 = 0.0;
    let mut prev_share = 0.0;

    for (pos, &member) in positive.iter().enumerate() {
        let share = f64::from(weights[member]) / total;
        let remaining = (n - pos) as f64;
        let factor = if pos == 0 {
            (remaining * share).powf(1.0 / remaining)
        } else {
            (remaining * (share - prev_share) / product + prev_factor.powf(remaining))
                .powf(1.0 / remaining)
        };
        factors[member] = factor;
        product *= factor;
        prev_factor = factor;
        prev_share = share;
    }

    factors
}

/// Total order over finite scores.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_which_is_deterministic() {
        let carp = Carp::new(&[11, 22, 33, 44, 55]).unwrap();
        for key in [0u32, 1, 42, 0xdead_beef, u32::MAX] {
            let first = carp.which(key);
            for _ in 0..10 {
                assert_eq!(carp.which(key), first);
            }
        }
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        // Identical identifiers produce identical scores for every key.
        let carp = Carp::new(&[7, 7, 7]).unwrap();
        for key in 0..1000 {
            assert_eq!(carp.which(key), 0);
            assert_eq!(carp.sequence(key, 3), vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_unweighted_spreads_keys() {
        let carp = Carp::new(&[1, 2, 3, 4]).unwrap();
        let mut counts = [0usize; 4];
        for key in 0..10_000 {
            counts[carp.which(key)] += 1;
        }
        for count in counts {
            assert!((2000..3000).contains(&count), "counts {:?}", counts);
        }
    }

    #[test]
    fn test_weighted_share_follows_weights() {
        let carp = Carp::weighted(&[100, 101, 102], &[1, 1, 2]).unwrap();
        let mut counts = [0usize; 3];
        for key in 0..10_000 {
            counts[carp.which(key)] += 1;
        }
        assert!((4500..5500).contains(&counts[2]), "counts {:?}", counts);
        assert!((2100..2900).contains(&counts[0]), "counts {:?}", counts);
        assert!((2100..2900).contains(&counts[1]), "counts {:?}", counts);
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let carp = Carp::weighted(&[100, 101, 102, 103], &[1, 1, 2, 0]).unwrap();
        for key in 0..10_000 {
            assert_ne!(carp.which(key), 3);
        }
    }

    #[test]
    fn test_all_zero_weights_behave_unweighted() {
        let weighted = Carp::weighted(&[5, 6, 7], &[0, 0, 0]).unwrap();
        let plain = Carp::new(&[5, 6, 7]).unwrap();
        for key in 0..500 {
            assert_eq!(weighted.which(key), plain.which(key));
        }
    }

    #[test]
    fn test_factors_increase_with_weight() {
        let factors = load_factors(&[1, 2, 3, 4]);
        assert!(factors.windows(2).all(|w| w[0] < w[1]), "{:?}", factors);
        let equal = load_factors(&[3, 3, 3]);
        assert!(equal.iter().all(|f| (f - 1.0).abs() < 1e-9), "{:?}", equal);
    }

    #[test]
    fn test_sequence_ranks_best_first() {
        let carp = Carp::weighted(&[1, 2, 3, 4, 5], &[1, 2, 1, 3, 1]).unwrap();
        for key in 0..200 {
            let all = carp.sequence(key, 5);
            assert_eq!(all.len(), 5);
            assert_eq!(all[0], carp.which(key));
            let top2 = carp.sequence(key, 2);
            assert_eq!(top2, all[..2].to_vec());
            let scores: Vec<f64> = all.iter().map(|&i| carp.score(i, key)).collect();
            assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn test_sequence_clamps_k() {
        let carp = Carp::new(&[1, 2]).unwrap();
        assert_eq!(carp.sequence(9, 10).len(), 2);
        assert!(carp.sequence(9, 0).is_empty());
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Carp::new(&[]).is_err());
        assert!(Carp::weighted(&[1, 2], &[1]).is_err());
    }

    #[test]
    fn test_combine_uses_both_halves() {
        let hash = 0x0000_0001_0000_0002u64;
        assert_eq!(combine(hash, 2), mix32(1));
        assert_eq!(mix32(0), 0);
    }
}
