// SPDX-License-Identifier: MPL-2.0

//! Content-defined chunking of a byte stream into blocks.
//!
//! The rolling sum is the "rollsum" of bup and librsync: two windowed
//! sums updated per byte, with a block boundary declared whenever the low
//! bits of the second sum are all set. Boundaries therefore depend only on
//! the bytes near them, so an edit perturbs block keys locally instead of
//! shifting every block after it.

use sha2::{Digest, Sha256};

const WINDOW_SIZE: u32 = 64;
const CHAR_OFFSET: u32 = 31;

/// One content-defined block of a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// The block's 64-bit content key.
    pub key: u64,
    /// Byte offset of the block within the source.
    pub offset: u64,
    /// The block bytes.
    pub data: Vec<u8>,
}

/// Rolling checksum over a fixed 64-byte window.
pub struct Rollsum {
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE as usize],
    wofs: usize,
}

impl Rollsum {
    /// A sum primed with an all-zero window.
    pub fn new() -> Self {
        Rollsum {
            s1: WINDOW_SIZE * CHAR_OFFSET,
            s2: WINDOW_SIZE * (WINDOW_SIZE - 1) * CHAR_OFFSET,
            window: [0; WINDOW_SIZE as usize],
            wofs: 0,
        }
    }

    /// Rolls one byte into the window, dropping the oldest.
    pub fn update(&mut self, byte: u8) {
        let drop = self.window[self.wofs] as u32;
        let add = byte as u32;
        self.s1 = self.s1.wrapping_add(add.wrapping_sub(drop));
        self.s2 = self
            .s2
            .wrapping_add(self.s1.wrapping_sub(WINDOW_SIZE * (drop + CHAR_OFFSET)));
        self.window[self.wofs] = byte;
        self.wofs = (self.wofs + 1) % (WINDOW_SIZE as usize);
    }

    /// True when the current digest hits the split pattern: all the bits
    /// selected by `mask` are set.
    pub fn split(&self, mask: u32) -> bool {
        self.s2 & mask == mask
    }
}

impl Default for Rollsum {
    fn default() -> Self {
        Rollsum::new()
    }
}

/// The 64-bit content key of a block: the first eight bytes of its
/// SHA-256 digest, little-endian.
pub fn block_key(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Splits `data` into content-defined blocks whose sizes average roughly
/// `avg_block_size` bytes (rounded to the nearest power of two). Both
/// peers must chunk with the same average for their block keys to line
/// up. Empty input yields no blocks.
pub fn chunk_bytes(data: &[u8], avg_block_size: usize) -> Vec<Block> {
    let mask = split_mask(avg_block_size);
    let mut blocks = Vec::new();
    let mut sum = Rollsum::new();
    let mut start = 0usize;
    for (position, &byte) in data.iter().enumerate() {
        sum.update(byte);
        if sum.split(mask) {
            push_block(&mut blocks, data, start, position + 1);
            start = position + 1;
            sum = Rollsum::new();
        }
    }
    if start < data.len() {
        push_block(&mut blocks, data, start, data.len());
    }
    blocks
}

fn push_block(blocks: &mut Vec<Block>, data: &[u8], start: usize, end: usize) {
    let slice = &data[start..end];
    blocks.push(Block {
        key: block_key(slice),
        offset: start as u64,
        data: slice.to_vec(),
    });
}

/// Low-bit mask whose width makes the expected block size land near the
/// requested average.
fn split_mask(avg_block_size: usize) -> u32 {
    let bits = (avg_block_size.max(16) as f64).log2().round() as u32;
    (1u32 << bits.clamp(4, 22)) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};
    use std::collections::HashSet;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_blocks_concatenate_to_input() {
        let data = random_bytes(50_000, 1);
        let blocks = chunk_bytes(&data, 700);
        let mut rebuilt = Vec::new();
        let mut expected_offset = 0u64;
        for block in &blocks {
            assert_eq!(block.offset, expected_offset);
            assert_eq!(block.key, block_key(&block.data));
            expected_offset += block.data.len() as u64;
            rebuilt.extend_from_slice(&block.data);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let data = random_bytes(20_000, 2);
        let first = chunk_bytes(&data, 700);
        let second = chunk_bytes(&data, 700);
        assert_eq!(first, second);
    }

    #[test]
    fn test_average_block_size_in_range() {
        let data = random_bytes(200_000, 3);
        let blocks = chunk_bytes(&data, 700);
        let average = data.len() / blocks.len();
        // The mask rounds 700 to 512; random input should land well within
        // a factor of two of that.
        assert!(
            (256..2048).contains(&average),
            "average block size {average}"
        );
    }

    #[test]
    fn test_edit_perturbs_keys_locally() {
        let mut data = random_bytes(100_000, 4);
        let original: HashSet<u64> = chunk_bytes(&data, 700).iter().map(|b| b.key).collect();

        let mut rng = StdRng::seed_from_u64(5);
        let position = rng.gen_range(40_000..60_000);
        data[position] ^= 0xff;
        let edited: HashSet<u64> = chunk_bytes(&data, 700).iter().map(|b| b.key).collect();

        let changed = original.symmetric_difference(&edited).count();
        assert!(changed > 0);
        assert!(changed <= 8, "one byte edit changed {changed} block keys");
    }

    #[test]
    fn test_empty_input() {
        assert!(chunk_bytes(&[], 700).is_empty());
    }
}
