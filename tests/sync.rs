// SPDX-License-Identifier: MPL-2.0

//! End-to-end synchronization over generated file pairs.

use blocksync::chunker::chunk_bytes;
use blocksync::hash::HasherSet;
use blocksync::iblt::MultiIblt;
use blocksync::codec::Encode;
use blocksync::sync::{synchronize, FileSync, SyncConfig, SyncError, SyncOutcome};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

fn random_file(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Overwrites a run of `len` bytes at `offset` with fresh random bytes.
fn overwrite_run(data: &mut [u8], offset: usize, len: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    rng.fill_bytes(&mut data[offset..offset + len]);
}

/// Resamples each byte independently with the given probability.
fn resample_bytes(data: &mut [u8], probability: f64, seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut changed = 0;
    for byte in data.iter_mut() {
        if rng.gen_bool(probability) {
            *byte = rng.gen();
            changed += 1;
        }
    }
    changed
}

fn symmetric_key_difference(a: &[u8], b: &[u8], avg_block_size: usize) -> usize {
    let keys_a: HashSet<u64> = chunk_bytes(a, avg_block_size).iter().map(|b| b.key).collect();
    let keys_b: HashSet<u64> = chunk_bytes(b, avg_block_size).iter().map(|b| b.key).collect();
    keys_a.symmetric_difference(&keys_b).count()
}

fn sync_pair(a: &[u8], b: &[u8]) -> SyncOutcome {
    let config = SyncConfig::default();
    let mut initiator = FileSync::new(a, config.clone()).unwrap();
    let mut responder = FileSync::new(b, config).unwrap();
    let outcome = synchronize(&mut initiator, &mut responder).unwrap();
    assert_eq!(outcome.data, b, "reconstruction must match the responder's file");
    outcome
}

#[test]
fn single_changed_run() {
    let a = random_file(100_000, 42);
    let mut b = a.clone();
    overwrite_run(&mut b, 30_000, 50, 43);

    let outcome = sync_pair(&a, &b);
    assert!(
        outcome.report.blocks_received <= 4,
        "received {} blocks for a 50-byte edit",
        outcome.report.blocks_received
    );
    assert!(outcome.report.local_only_blocks <= 4);
    let wire_bytes = outcome.report.sketch_bytes + outcome.report.transfer_bytes;
    assert!(
        wire_bytes < 6_000,
        "transferred {wire_bytes} bytes beyond the strata"
    );
}

#[test]
fn scattered_resampled_bytes() {
    let a = random_file(100_000, 42);
    let mut b = a.clone();
    let changed = resample_bytes(&mut b, 0.001, 44);
    assert!(changed > 50);

    let outcome = sync_pair(&a, &b);
    let actual = symmetric_key_difference(&a, &b, 700) as u64;
    let estimate = outcome.report.difference_estimate;
    assert!(
        estimate >= actual / 2 && estimate <= actual * 2 + 8,
        "estimate {estimate} not within a factor of two of the actual difference {actual}"
    );
}

#[test]
fn identical_files() {
    let a = random_file(10_000, 42);
    let outcome = sync_pair(&a, &a);
    assert_eq!(outcome.report.difference_estimate, 0);
    assert_eq!(outcome.report.blocks_received, 0);
    assert_eq!(outcome.report.local_only_blocks, 0);
    assert_eq!(outcome.report.retries, 0);
}

#[test]
fn empty_files() {
    let outcome = sync_pair(&[], &[]);
    assert!(outcome.data.is_empty());
    assert_eq!(outcome.report.blocks_received, 0);
    assert_eq!(outcome.report.transfer_bytes, 4 + 8 + 8);
}

#[test]
fn inserted_block() {
    let a = random_file(100_000, 42);
    let mut b = a.clone();
    let insertion = random_file(1_000, 45);
    b.splice(50_000..50_000, insertion);

    let outcome = sync_pair(&a, &b);
    assert!(
        (1..=6).contains(&outcome.report.blocks_received),
        "received {} blocks for one inserted run",
        outcome.report.blocks_received
    );
    assert_eq!(Sha256::digest(&outcome.data), Sha256::digest(&b));
}

#[test]
fn appended_tail() {
    let a = random_file(100_000, 42);
    let mut b = a.clone();
    b.extend_from_slice(&random_file(700, 46));

    let outcome = sync_pair(&a, &b);
    // Only the final block region can differ; the boundary block may split
    // differently so allow a little slack around "exactly one".
    assert!(
        (1..=3).contains(&outcome.report.blocks_received),
        "received {} blocks for an appended tail",
        outcome.report.blocks_received
    );
}

#[test]
fn many_single_byte_edits() {
    let a = random_file(100_000, 42);
    let mut b = a.clone();
    let mut rng = StdRng::seed_from_u64(47);
    let mut positions = HashSet::new();
    while positions.len() < 100 {
        positions.insert(rng.gen_range(0..b.len()));
    }
    for position in positions {
        b[position] = b[position].wrapping_add(1);
    }

    let outcome = sync_pair(&a, &b);
    assert!(outcome.report.retries <= 2);
    let wire_bytes = outcome.report.sketch_bytes + outcome.report.transfer_bytes;
    assert!(
        wire_bytes < a.len(),
        "scattered edits transferred {wire_bytes} bytes for a {} byte file",
        a.len()
    );
}

#[test]
fn undersized_sketch_retries_until_success() {
    let config = SyncConfig::default();
    let a = random_file(60_000, 42);
    let mut b = a.clone();
    overwrite_run(&mut b, 10_000, 4_000, 48);

    let mut initiator = FileSync::new(&a, config.clone()).unwrap();
    let mut responder = FileSync::new(&b, config.clone()).unwrap();
    assert!(initiator.num_blocks() > 0);

    let round1 = initiator.start_sync().unwrap();
    let reply = responder.receive_strata(&round1).unwrap();
    let _agreed = initiator.receive_estimate(&reply).unwrap();

    // Ship a sketch far too small for the difference instead of the agreed
    // one; the responder adapts to the incoming size, fails to decode, and
    // reports that in-band.
    let hashers = Arc::new(HasherSet::new(config.hash_seed, config.num_hashfns));
    let mut tiny = MultiIblt::new(4, config.num_hashfns, config.n_parties, config.hash_seed, hashers)
        .unwrap();
    for block in chunk_bytes(&a, config.avg_block_size) {
        tiny.insert(block.key);
    }
    let transfer = responder.receive_sketch(&tiny.get_encoded()).unwrap();
    let failed = initiator.receive_blocks(&transfer);
    assert!(matches!(failed, Err(SyncError::DecodeFailed)));

    // Doubling from the properly sized sketch recovers within the cap.
    let mut attempts = 0;
    let mut round2 = initiator.resize_sketch().unwrap();
    let data = loop {
        attempts += 1;
        assert!(attempts <= 3, "retries did not converge");
        let transfer = responder.receive_sketch(&round2).unwrap();
        match initiator.receive_blocks(&transfer) {
            Ok(data) => break data,
            Err(SyncError::DecodeFailed) => {
                round2 = initiator.resize_sketch().unwrap();
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    };
    assert_eq!(data, b);
}

#[test]
fn retries_exhaust_when_estimator_is_blinded() {
    // A single-stratum ladder clamps every key into one 81-bucket sketch;
    // with far more differing blocks than that it never decodes, the
    // estimate collapses to zero, and the minimal sketch can never cover
    // the true difference within the retry budget.
    let config = SyncConfig {
        strata_levels: 1,
        ..SyncConfig::default()
    };
    let a = random_file(200_000, 42);
    let b = random_file(200_000, 49);

    let mut initiator = FileSync::new(&a, config.clone()).unwrap();
    let mut responder = FileSync::new(&b, config).unwrap();
    let result = synchronize(&mut initiator, &mut responder);
    assert!(matches!(result, Err(SyncError::RetriesExhausted(3))));
}

#[test]
fn sessions_from_files_on_disk() {
    let dir = std::env::temp_dir();
    let path_a = dir.join("blocksync-test-a.bin");
    let path_b = dir.join("blocksync-test-b.bin");
    let a = random_file(20_000, 42);
    let mut b = a.clone();
    overwrite_run(&mut b, 5_000, 100, 51);
    std::fs::write(&path_a, &a).unwrap();
    std::fs::write(&path_b, &b).unwrap();

    let config = SyncConfig::default();
    let mut initiator = FileSync::from_path(&path_a, config.clone()).unwrap();
    let mut responder = FileSync::from_path(&path_b, config).unwrap();
    let outcome = synchronize(&mut initiator, &mut responder).unwrap();
    assert_eq!(outcome.data, b);

    std::fs::remove_file(&path_a).unwrap();
    std::fs::remove_file(&path_b).unwrap();
}

#[test]
fn one_way_transfer_is_proportional_to_difference() {
    // A large shared prefix with a rewritten tail: the bodies that cross
    // the wire stay close to the rewritten region, not the file size.
    let a = random_file(100_000, 42);
    let mut b = a.clone();
    overwrite_run(&mut b, 90_000, 10_000, 50);

    let outcome = sync_pair(&a, &b);
    let wire_bytes = outcome.report.sketch_bytes + outcome.report.transfer_bytes;
    assert!(
        wire_bytes < 30_000,
        "rewriting 10% of the file transferred {wire_bytes} bytes"
    );
}
