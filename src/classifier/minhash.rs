use rand::prelude::*;
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use crate::record::RecordId;

/// Seeded `(a, b)` coefficients of the universal hash family.
#[derive(Clone, Debug)]
pub struct Permutations(Vec<(u64, u64)>);

impl Permutations {
    pub fn seeded(num_perm: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Permutations((0..num_perm).map(|_| (rng.gen(), rng.gen())).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MinHash {
    pub hash_values: Vec<u32>,
    num_perm: usize,
}

impl MinHash {
    /// Signature over items already reduced to 64-bit hashes.
    pub fn from_hashes<I: IntoIterator<Item = u64>>(items: I, permutations: &Permutations) -> Self {
        let num_perm = permutations.len();
        let mut hash_values = vec![u32::MAX; num_perm];
        for item_hash in items {
            for (i, &(a, b)) in permutations.0.iter().enumerate() {
                let hash = permute_hash(item_hash, a, b);
                hash_values[i] = hash_values[i].min(hash);
            }
        }
        MinHash {
            hash_values,
            num_perm,
        }
    }

    pub fn new<T: Hash, I: IntoIterator<Item = T>>(items: I, permutations: &Permutations) -> Self {
        Self::from_hashes(items.into_iter().map(|t| calculate_hash(&t)), permutations)
    }

    /// Estimated Jaccard similarity of the two underlying sets.
    pub fn jaccard_similarity(&self, other: &MinHash) -> f64 {
        if self.num_perm == 0 {
            return 0.0;
        }
        let equal_count = self
            .hash_values
            .iter()
            .zip(&other.hash_values)
            .filter(|&(&a, &b)| a == b)
            .count();
        equal_count as f64 / self.num_perm as f64
    }
}

/// Character trigrams of `value`, padded with a space on each side.
pub fn shingles(value: &str) -> Vec<String> {
    let padded: Vec<char> = format!(" {value} ").chars().collect();
    padded.windows(3).map(|w| w.iter().collect()).collect()
}

///
/// Banded locality-sensitive hash index: records whose signatures agree on
/// every row of at least one band land in a shared bucket.
///
#[derive(Clone)]
pub struct LshIndex {
    /// Rows per band
    band_size: usize,
    /// One table per band, band hash → ids in insertion order
    hash_tables: Vec<FxHashMap<u64, Vec<RecordId>>>,
}

impl LshIndex {
    ///
    /// ## Arguments
    ///
    /// * `num_perm` - Signature length.
    /// * `num_bands` - Number of times to split each signature (number of hash tables).
    ///
    pub fn new(num_perm: usize, num_bands: usize) -> Self {
        let num_bands = num_bands.max(1);
        LshIndex {
            band_size: num_perm / num_bands,
            hash_tables: vec![FxHashMap::default(); num_bands],
        }
    }

    pub fn insert(&mut self, id: RecordId, minhash: &MinHash) {
        let band_size = self.band_size;
        for (i, table) in self.hash_tables.iter_mut().enumerate() {
            let band_hash = calculate_band_hash(band(minhash, i, band_size));
            table.entry(band_hash).or_default().push(id);
        }
    }

    /// Ids sharing at least one band bucket with `minhash`.
    pub fn query(&self, minhash: &MinHash) -> BTreeSet<RecordId> {
        self.hash_tables
            .iter()
            .enumerate()
            .fold(BTreeSet::new(), |mut ids, (i, table)| {
                let band_hash = calculate_band_hash(band(minhash, i, self.band_size));
                if let Some(found) = table.get(&band_hash) {
                    ids.extend(found);
                }
                ids
            })
    }

    /// Buckets holding more than one id.
    pub fn shared_buckets(&self) -> impl Iterator<Item = &[RecordId]> {
        self.hash_tables
            .iter()
            .flat_map(|table| table.values())
            .filter(|ids| ids.len() > 1)
            .map(Vec::as_slice)
    }
}

fn band(minhash: &MinHash, index: usize, band_size: usize) -> &[u32] {
    let start = index * band_size;
    let end = (start + band_size).min(minhash.hash_values.len());
    &minhash.hash_values[start.min(end)..end]
}

#[inline]
pub(crate) fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut s = FxHasher::default();
    t.hash(&mut s);
    s.finish()
}

#[inline]
fn permute_hash(hash: u64, a: u64, b: u64) -> u32 {
    ((a.wrapping_mul(hash).wrapping_add(b)) >> 32) as u32
}

#[inline]
fn calculate_band_hash(band: &[u32]) -> u64 {
    let mut hasher = FxHasher::default();
    for &value in band {
        hasher.write_u32(value);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shingles_pad_short_values() {
        assert_eq!(shingles("ab"), vec![" ab", "ab "]);
        assert_eq!(shingles("a"), vec![" a "]);
    }

    #[test]
    fn identical_sets_are_fully_similar() {
        let perms = Permutations::seeded(32, 7);
        let left = MinHash::new(shingles("oakwood school"), &perms);
        let right = MinHash::new(shingles("oakwood school"), &perms);
        assert_eq!(left.jaccard_similarity(&right), 1.0);
    }

    #[test]
    fn similarity_orders_near_and_far_values() {
        let perms = Permutations::seeded(128, 7);
        let base = MinHash::new(shingles("st marys catholic primary school"), &perms);
        let near = MinHash::new(shingles("st marys catholic primary"), &perms);
        let far = MinHash::new(shingles("elmhurst grammar"), &perms);
        assert!(base.jaccard_similarity(&near) > base.jaccard_similarity(&far));
    }

    #[test]
    fn seeded_permutations_are_reproducible() {
        let first = MinHash::new(shingles("leeds"), &Permutations::seeded(16, 3));
        let second = MinHash::new(shingles("leeds"), &Permutations::seeded(16, 3));
        assert_eq!(first, second);
    }

    #[test]
    fn index_buckets_identical_signatures() {
        let perms = Permutations::seeded(20, 11);
        let mut index = LshIndex::new(20, 5);
        let same = MinHash::new(shingles("oakwood"), &perms);
        index.insert(RecordId::bare(0), &same);
        index.insert(RecordId::bare(1), &same);
        let found = index.query(&same);
        assert!(found.contains(&RecordId::bare(0)) && found.contains(&RecordId::bare(1)));
        assert!(index.shared_buckets().count() >= 5);
    }
}
