// MinHash signatures and the LSH candidate index for near-duplicate retrieval.

use ahash::RandomState;
use anyhow::{Error, Result};
use dashmap::DashMap;
use ndarray::Array1;
use rand::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use regex::Regex;
use sha2::{Digest, Sha256};

// Largest 64-bit prime; signature slots start here and only move down.
const MAX_HASH: u64 = 18446744073709551557;

const PUNCTUATION_CHARS: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// SlimPajama-style cleaning applied to the dedup key text before hashing.
pub fn clean_text(text: &str) -> String {
    // Convert the document to lowercase
    let mut text = text.to_lowercase();

    // Remove punctuation
    let punctuation_chars: Vec<char> = PUNCTUATION_CHARS.chars().collect();
    text.retain(|c| !punctuation_chars.contains(&c));

    // Replace multiple whitespace characters with a single space
    let re = Regex::new(r"\s+").unwrap();
    text = re.replace_all(&text, " ").to_string();

    text.trim().to_string()
}

/// Derive the `(num_bands, band_size)` split from the target Jaccard threshold
/// by minimizing the equally weighted false positive / false negative
/// probability integrals over the banding S-curve.
pub fn optimal_bands(threshold: f64, num_perm: usize) -> (usize, usize) {
    let false_positive_area =
        |b: f64, r: f64| integrate(|s| 1.0 - (1.0 - s.powf(r)).powf(b), 0.0, threshold);
    let false_negative_area =
        |b: f64, r: f64| integrate(|s| (1.0 - s.powf(r)).powf(b), threshold, 1.0);

    let mut best = (1, num_perm);
    let mut best_error = f64::INFINITY;
    for num_bands in 1..=num_perm {
        let max_band_size = num_perm / num_bands;
        for band_size in 1..=max_band_size {
            let error = false_positive_area(num_bands as f64, band_size as f64)
                + false_negative_area(num_bands as f64, band_size as f64);
            if error < best_error {
                best_error = error;
                best = (num_bands, band_size);
            }
        }
    }
    best
}

fn integrate<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    // Midpoint rule is plenty for a parameter sweep over smooth S-curves.
    const STEPS: usize = 100;
    let dx = (b - a) / STEPS as f64;
    (0..STEPS)
        .map(|i| f(a + (i as f64 + 0.5) * dx) * dx)
        .sum()
}

fn expand_band_seeds(band_seeds: &[u32], band_size: usize) -> Vec<u64> {
    // Each band seed expands to band_size u64s, flattened, to seed the
    // per-slot permutations.
    let mut perm_seeds: Vec<u64> = Vec::new();
    for band_seed in band_seeds.iter() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(*band_seed as u64);
        for _i in 0..band_size {
            perm_seeds.push(rng.next_u64());
        }
    }
    perm_seeds
}

fn init_permutations(seeds: &[u64]) -> Array1<u128> {
    let n = seeds.len();
    let mut a = Array1::zeros(n);
    for (i, &seed) in seeds.iter().enumerate() {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        a[i] = rng.gen::<u128>();
    }
    a
}

/// Word-set MinHasher. One signature slot per permutation; tokens are the
/// whitespace words of the cleaned key text, hashed independently (record
/// level near-duplication, not passage overlap, so no shingling).
pub struct MinHasher {
    num_bands: usize,
    band_size: usize,
    perms: Array1<u128>,
    hash_a: RandomState,
    hash_b: RandomState,
}

impl MinHasher {
    pub fn new(num_bands: usize, band_size: usize, hash_seed: usize) -> Self {
        let band_seeds: Vec<u32> = expand_band_seeds(&[hash_seed as u32], num_bands)
            .into_iter()
            .map(|x| x as u32)
            .collect();
        let perm_seeds = expand_band_seeds(&band_seeds, band_size);
        let perms = init_permutations(&perm_seeds);
        MinHasher {
            num_bands,
            band_size,
            perms,
            hash_a: RandomState::with_seed(123),
            hash_b: RandomState::with_seed(456),
        }
    }

    pub fn num_perm(&self) -> usize {
        self.num_bands * self.band_size
    }

    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    pub fn band_size(&self) -> usize {
        self.band_size
    }

    /// Signature over the cleaned text's whitespace tokens. Empty text leaves
    /// every slot at the MAX_HASH fill value.
    pub fn signature(&self, text: &str) -> Array1<u64> {
        let cleaned = clean_text(text);
        let mut hash_vals: Array1<u64> = Array1::ones(self.num_perm()) * MAX_HASH;
        for word in cleaned.split_whitespace() {
            hash_vals = self.update_hash_vals(hash_vals, word);
        }
        hash_vals
    }

    fn update_hash_vals(&self, mut hash_vals: Array1<u64>, word: &str) -> Array1<u64> {
        // Two seeded 64-bit hashes combine into the u128 the permutations act on.
        let hash_val_a = self.hash_a.hash_one(word);
        let hash_val_b = self.hash_b.hash_one(word);
        let cur_hash = ((hash_val_a as u128) << 64) | (hash_val_b as u128);

        // Multiply by the permutation constant (mod 2^128), keep the top 64 bits.
        let phv: Array1<u64> = self.perms.mapv(|x| (x.wrapping_mul(cur_hash) >> 64) as u64);
        hash_vals.zip_mut_with(&phv, |x, y| *x = std::cmp::min(*x, *y));

        hash_vals
    }
}

/// In-memory LSH index over record signatures: band digest -> record indices.
pub struct LshIndex {
    num_bands: usize,
    band_size: usize,
    buckets: DashMap<Vec<u8>, Vec<usize>>,
}

impl LshIndex {
    pub fn new(num_bands: usize, band_size: usize) -> Self {
        LshIndex {
            num_bands,
            band_size,
            buckets: DashMap::new(),
        }
    }

    fn band_keys(&self, signature: &Array1<u64>) -> Result<Vec<Vec<u8>>, Error> {
        let bands = signature
            .clone()
            .into_shape((self.num_bands, self.band_size))?;
        let mut keys = Vec::with_capacity(self.num_bands);
        for row in bands.rows() {
            let mut hasher = Sha256::new();
            hasher.update(bytemuck::cast_slice(row.as_slice().unwrap()));
            let hash = hasher.finalize();
            keys.push(hash[..8].to_vec()); // Truncate to 8 bytes for efficiency
        }
        Ok(keys)
    }

    pub fn insert(&self, idx: usize, signature: &Array1<u64>) -> Result<(), Error> {
        for key in self.band_keys(signature)? {
            self.buckets.entry(key).or_default().push(idx);
        }
        Ok(())
    }

    /// Union of bucket members across the signature's bands, minus the query
    /// index itself. Candidates only - confirmation is the caller's job.
    pub fn query(&self, idx: usize, signature: &Array1<u64>) -> Result<Vec<usize>, Error> {
        let mut candidates = Vec::new();
        for key in self.band_keys(signature)? {
            if let Some(members) = self.buckets.get(&key) {
                for &member in members.value() {
                    if member != idx {
                        candidates.push(member);
                    }
                }
            }
        }
        candidates.sort_unstable();
        candidates.dedup();
        Ok(candidates)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
