// SPDX-License-Identifier: MPL-2.0

//! Tabulation hashing and the seed streams that fill its tables.
//!
//! Two peers constructed with the same seed produce identical hashes on
//! identical keys; that is the only property the protocol relies on, so the
//! tables are expanded from a deterministic AES-128-CTR keystream rather
//! than anything cryptographic.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;

type Aes128Ctr = ctr::Ctr64LE<Aes128>;

/// A stream of pseudorandom bytes derived from a seed.
pub(crate) struct SeedStream(Aes128Ctr);

impl SeedStream {
    pub(crate) fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        SeedStream(Aes128Ctr::new(&key.into(), &iv.into()))
    }

    /// Fill `buf` with the next `buf.len()` bytes of output.
    pub(crate) fn fill(&mut self, buf: &mut [u8]) {
        buf.fill(0);
        self.0.apply_keystream(buf);
    }
}

const KEY_BYTES: usize = 8;
const TABLE_ENTRIES: usize = 256;

/// Deterministic, seedable tabulation hash over 64-bit keys.
///
/// The key is split into its eight bytes; byte position `i` indexes a
/// precomputed table of 256 64-bit values and the selected entries are
/// XOR-combined. Table `i` is filled from a keystream whose cipher key
/// holds the seed in its first four bytes (little-endian) and `i` in the
/// fifth, an injective combination that keeps every table of every
/// distinctly seeded hasher on its own keystream.
#[derive(Debug)]
pub struct TabulationHasher {
    tables: Vec<[u64; TABLE_ENTRIES]>,
}

impl TabulationHasher {
    /// Builds the per-byte tables for the given seed.
    pub fn new(seed: u32) -> Self {
        let mut tables = Vec::with_capacity(KEY_BYTES);
        for i in 0..KEY_BYTES {
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&seed.to_le_bytes());
            key[4] = i as u8;
            let mut stream = SeedStream::new(key, [0u8; 16]);
            let mut buf = [0u8; TABLE_ENTRIES * 8];
            stream.fill(&mut buf);

            let mut table = [0u64; TABLE_ENTRIES];
            for (entry, chunk) in table.iter_mut().zip(buf.chunks_exact(8)) {
                *entry = u64::from_le_bytes(chunk.try_into().unwrap());
            }
            tables.push(table);
        }
        TabulationHasher { tables }
    }

    /// Hashes a 64-bit key.
    pub fn hash(&self, key: u64) -> u64 {
        let bytes = key.to_le_bytes();
        let mut out = 0;
        for (table, &byte) in self.tables.iter().zip(bytes.iter()) {
            out ^= table[byte as usize];
        }
        out
    }
}

/// The hasher family a session shares between its sketch, its estimator
/// strata, and any sketches decoded off the wire. Read-only after
/// construction, so sharing behind an `Arc` needs no locking.
#[derive(Debug)]
pub struct HasherSet {
    pub(crate) key: TabulationHasher,
    pub(crate) subs: Vec<TabulationHasher>,
}

impl HasherSet {
    /// Builds the key hasher at `seed` and sub-table hasher `i` at
    /// `seed + 1 + i`.
    pub fn new(seed: u32, num_subs: usize) -> Self {
        HasherSet {
            key: TabulationHasher::new(seed),
            subs: (0..num_subs)
                .map(|i| TabulationHasher::new(seed.wrapping_add(1 + i as u32)))
                .collect(),
        }
    }

    /// Number of sub-table hashers available.
    pub fn num_subs(&self) -> usize {
        self.subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identical_seeds_agree() {
        let a = TabulationHasher::new(0x5eed);
        let b = TabulationHasher::new(0x5eed);
        for key in [0u64, 1, 0xffff_ffff_ffff_ffff, 0x0123_4567_89ab_cdef] {
            assert_eq!(a.hash(key), b.hash(key));
        }
    }

    #[test]
    fn test_distinct_seeds_disagree() {
        let a = TabulationHasher::new(0);
        let b = TabulationHasher::new(1);
        let disagreements = (0u64..64)
            .filter(|&key| a.hash(key) != b.hash(key))
            .count();
        assert!(disagreements > 60);
    }

    #[test]
    fn test_output_spread() {
        // Sequential keys must not collide; tabulation hashing is
        // 3-independent so this is overwhelmingly likely.
        let hasher = TabulationHasher::new(7);
        let outputs: HashSet<u64> = (0u64..1000).map(|key| hasher.hash(key)).collect();
        assert_eq!(outputs.len(), 1000);
    }

    #[test]
    fn test_hasher_set_layout() {
        let set = HasherSet::new(3, 4);
        assert_eq!(set.num_subs(), 4);
        // The key hasher and each sub hasher are seeded apart.
        let key_sample = set.key.hash(99);
        for sub in &set.subs {
            assert_ne!(sub.hash(99), key_sample);
        }
    }
}
