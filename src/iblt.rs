// SPDX-License-Identifier: MPL-2.0

//! The multi-sub-table invertible Bloom lookup table and its peeling
//! decoder.
//!
//! A key inserted into the sketch lands in exactly one bucket per
//! sub-table, contributing its field encoding, its fingerprint, and a unit
//! count to each. Subtracting a peer's structurally identical sketch leaves
//! cells encoding the signed multiset difference, which [`MultiIblt::peel`]
//! drains bucket by bucket: any cell provably holding `m` copies of a
//! single key (certified by fingerprint agreement after dividing by `m`)
//! gives up that key, the key is removed everywhere it lives, and the
//! removals expose further pure cells until the sketch empties or no
//! progress remains.

use crate::codec::{CodecError, Decode, Encode};
use crate::field::{FieldElem, FieldShape, HASH_BITS, KEY_BITS};
use crate::fp::SmallFp;
use crate::hash::{HasherSet, TabulationHasher};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Cursor;
use std::ops::{AddAssign, SubAssign};
use std::sync::Arc;

/// Space overhead of the sketch relative to the difference it must decode.
const SPACE_OVERHEAD: f64 = 1.6;

/// Errors emitted by this module.
#[derive(Debug, thiserror::Error)]
pub enum IbltError {
    /// The bucket count does not divide evenly across the sub-tables.
    #[error("bucket count {0} is not a multiple of {1} sub-tables")]
    UnevenSubTables(usize, usize),
    /// Two sketches disagree on their structural parameters.
    #[error("sketches disagree on structural parameters")]
    ShapeMismatch,
    /// The shared hasher set does not cover the requested sub-tables.
    #[error("hasher set provides {have} sub-table hashers, {need} needed")]
    NotEnoughHashers {
        /// Hashers available in the shared set.
        have: usize,
        /// Hashers the sketch requires.
        need: usize,
    },
}

/// Number of buckets needed to decode a difference of the given size:
/// `ceil(1.6 * difference)` rounded up to a multiple of `num_hashfns`,
/// with a floor of one bucket per sub-table.
pub fn buckets_for_difference(difference: usize, num_hashfns: usize) -> usize {
    let want = ((SPACE_OVERHEAD * difference as f64).ceil() as usize).max(1);
    want.div_ceil(num_hashfns) * num_hashfns
}

/// One cell of the sketch: field sums of the inserted keys and of their
/// fingerprints, plus a signed count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    key_sum: FieldElem,
    hash_sum: FieldElem,
    count: i32,
}

impl Bucket {
    fn empty(fp: SmallFp) -> Self {
        Bucket {
            key_sum: FieldElem::zero(fp, KEY_BITS),
            hash_sum: FieldElem::zero(fp, HASH_BITS),
            count: 0,
        }
    }

    /// Signed count of entries currently folded into the cell.
    pub fn count(&self) -> i32 {
        self.count
    }

    /// Folds one `(key, fingerprint)` entry into the cell.
    pub(crate) fn add_entry(&mut self, key: &FieldElem, hash: &FieldElem) {
        self.key_sum += key;
        self.hash_sum += hash;
        self.count += 1;
    }

    /// Removes one `(key, fingerprint)` entry from the cell.
    pub(crate) fn remove_entry(&mut self, key: &FieldElem, hash: &FieldElem) {
        self.key_sum -= key;
        self.hash_sum -= hash;
        self.count -= 1;
    }

    /// Removes `m` copies of an entry in one step; `m` may be negative.
    fn remove_scaled(&mut self, key: &FieldElem, hash: &FieldElem, m: i32, fp: SmallFp) {
        let scale = fp.reduce_signed(m);
        self.key_sum.sub_scaled(key, scale);
        self.hash_sum.sub_scaled(hash, scale);
        self.count -= m;
    }

    fn is_zero(&self) -> bool {
        self.count == 0 && self.key_sum.is_zero() && self.hash_sum.is_zero()
    }

    /// If the cell provably holds exactly `m` copies of one key for some
    /// multiplicity `1 <= |m| < n_parties`, returns the key and `m`.
    /// Magnitudes are swept in increasing order, positive sign first, and
    /// the first certifying multiplicity wins.
    fn pure_multiplicity(
        &self,
        n_parties: u16,
        key_hasher: &TabulationHasher,
    ) -> Option<(u64, i32)> {
        if self.count == 0 || self.count.unsigned_abs() >= n_parties as u32 {
            return None;
        }
        for magnitude in 1..n_parties as i32 {
            for m in [magnitude, -magnitude] {
                if self.count != m
                    || !self.key_sum.can_divide_by(m)
                    || !self.hash_sum.can_divide_by(m)
                {
                    continue;
                }
                let key = self.key_sum.extract(m);
                let fingerprint = self.hash_sum.extract(m);
                if key_hasher.hash(key) == fingerprint {
                    return Some((key, m));
                }
            }
        }
        None
    }
}

impl AddAssign<&Bucket> for Bucket {
    fn add_assign(&mut self, rhs: &Bucket) {
        self.key_sum += &rhs.key_sum;
        self.hash_sum += &rhs.hash_sum;
        self.count += rhs.count;
    }
}

impl SubAssign<&Bucket> for Bucket {
    fn sub_assign(&mut self, rhs: &Bucket) {
        self.key_sum -= &rhs.key_sum;
        self.hash_sum -= &rhs.hash_sum;
        self.count -= rhs.count;
    }
}

impl Encode for Bucket {
    fn encode(&self, bytes: &mut Vec<u8>) {
        self.key_sum.encode(bytes);
        self.hash_sum.encode(bytes);
        self.count.encode(bytes);
    }
}

impl Decode<SmallFp> for Bucket {
    fn decode(fp: &SmallFp, bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let key_sum = FieldElem::decode(
            &FieldShape {
                fp: *fp,
                width_bits: KEY_BITS,
            },
            bytes,
        )?;
        let hash_sum = FieldElem::decode(
            &FieldShape {
                fp: *fp,
                width_bits: HASH_BITS,
            },
            bytes,
        )?;
        let count = i32::decode(&(), bytes)?;
        Ok(Bucket {
            key_sum,
            hash_sum,
            count,
        })
    }
}

/// The result of draining a sketch.
#[derive(Clone, Debug)]
pub struct Peeled {
    /// Recovered keys, each tagged with the signed multiplicity that peeled
    /// it. After subtracting sketch B from sketch A, `+1` means the key is
    /// only in A and `-1` only in B.
    pub recovered: Vec<(u64, i32)>,
    /// Whether every cell drained to zero. When false the recovered set is
    /// still correct but incomplete, and callers must treat the decode as
    /// failed.
    pub complete: bool,
}

/// A sketch of a key set, split across `num_hashfns` sub-tables that each
/// place a key in one bucket.
#[derive(Clone, Debug)]
pub struct MultiIblt {
    n_parties: u16,
    seed: u32,
    fp: SmallFp,
    num_buckets: usize,
    num_hashfns: usize,
    buckets_per_sub: usize,
    sub_tables: Vec<Vec<Bucket>>,
    hashers: Arc<HasherSet>,
}

impl MultiIblt {
    /// Creates an empty sketch. `num_buckets` must be a positive multiple
    /// of `num_hashfns` (zero buckets is also accepted and yields a sketch
    /// that only ever certifies an empty difference).
    pub fn new(
        num_buckets: usize,
        num_hashfns: usize,
        n_parties: u16,
        seed: u32,
        hashers: Arc<HasherSet>,
    ) -> Result<Self, IbltError> {
        if num_hashfns == 0 || num_buckets % num_hashfns != 0 {
            return Err(IbltError::UnevenSubTables(num_buckets, num_hashfns));
        }
        if hashers.num_subs() < num_hashfns {
            return Err(IbltError::NotEnoughHashers {
                have: hashers.num_subs(),
                need: num_hashfns,
            });
        }
        let fp = SmallFp::for_parties(n_parties);
        let buckets_per_sub = num_buckets / num_hashfns;
        let sub_tables = (0..num_hashfns)
            .map(|_| vec![Bucket::empty(fp); buckets_per_sub])
            .collect();
        Ok(MultiIblt {
            n_parties,
            seed,
            fp,
            num_buckets,
            num_hashfns,
            buckets_per_sub,
            sub_tables,
            hashers,
        })
    }

    /// Total bucket count across all sub-tables.
    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Number of sub-tables.
    pub fn num_hashfns(&self) -> usize {
        self.num_hashfns
    }

    fn bucket_index(&self, key: u64, sub: usize) -> usize {
        (self.hashers.subs[sub].hash(key) % self.buckets_per_sub as u64) as usize
    }

    fn encode_entry(&self, key: u64) -> (FieldElem, FieldElem) {
        let fingerprint = self.hashers.key.hash(key);
        (
            FieldElem::encode_value(self.fp, KEY_BITS, key),
            FieldElem::encode_value(self.fp, HASH_BITS, fingerprint),
        )
    }

    /// Inserts a key into one bucket per sub-table.
    pub fn insert(&mut self, key: u64) {
        if self.buckets_per_sub == 0 {
            return;
        }
        let (key_enc, hash_enc) = self.encode_entry(key);
        for sub in 0..self.num_hashfns {
            let index = self.bucket_index(key, sub);
            self.sub_tables[sub][index].add_entry(&key_enc, &hash_enc);
        }
    }

    /// Removes a key from one bucket per sub-table; the exact inverse of
    /// [`MultiIblt::insert`].
    pub fn remove(&mut self, key: u64) {
        if self.buckets_per_sub == 0 {
            return;
        }
        let (key_enc, hash_enc) = self.encode_entry(key);
        for sub in 0..self.num_hashfns {
            let index = self.bucket_index(key, sub);
            self.sub_tables[sub][index].remove_entry(&key_enc, &hash_enc);
        }
    }

    /// Cellwise subtraction of a structurally identical sketch. Afterwards
    /// the cells encode the signed multiset difference of the two inserted
    /// key sets.
    pub fn subtract(&mut self, other: &MultiIblt) -> Result<(), IbltError> {
        if !self.same_shape(other) {
            return Err(IbltError::ShapeMismatch);
        }
        for (mine, theirs) in self.sub_tables.iter_mut().zip(&other.sub_tables) {
            for (a, b) in mine.iter_mut().zip(theirs.iter()) {
                *a -= b;
            }
        }
        Ok(())
    }

    fn same_shape(&self, other: &MultiIblt) -> bool {
        self.num_buckets == other.num_buckets
            && self.num_hashfns == other.num_hashfns
            && self.n_parties == other.n_parties
            && self.seed == other.seed
    }

    /// Drains the sketch, recovering the keys it encodes.
    ///
    /// Cells are scanned in (sub-table ascending, bucket ascending) order;
    /// each pure cell found seeds a FIFO drain that removes the recovered
    /// key from every sub-table, enqueueing any cells that become pure in
    /// the process. The sketch is mutated in place and is all-zero exactly
    /// when the decode completed; callers that need it afterwards must
    /// clone first.
    pub fn peel(&mut self) -> Peeled {
        let mut recovered = Vec::new();
        let mut already = HashSet::new();
        let mut queue: VecDeque<(u64, i32)> = VecDeque::new();
        loop {
            while let Some((key, m)) = queue.pop_front() {
                if !already.insert(key) {
                    continue;
                }
                recovered.push((key, m));
                self.remove_multiplicity(key, m, &mut queue, &already);
            }
            match self.find_pure(&already) {
                Some(candidate) => queue.push_back(candidate),
                None => break,
            }
        }
        let complete = self.sub_tables.iter().flatten().all(Bucket::is_zero);
        Peeled {
            recovered,
            complete,
        }
    }

    /// First pure cell in scan order whose key has not been peeled yet.
    fn find_pure(&self, already: &HashSet<u64>) -> Option<(u64, i32)> {
        for sub in &self.sub_tables {
            for bucket in sub {
                if let Some((key, m)) = bucket.pure_multiplicity(self.n_parties, &self.hashers.key)
                {
                    if !already.contains(&key) {
                        return Some((key, m));
                    }
                }
            }
        }
        None
    }

    /// Removes `m` copies of `key` from the cell it occupies in each
    /// sub-table, enqueueing cells that become pure in sub-table order.
    fn remove_multiplicity(
        &mut self,
        key: u64,
        m: i32,
        queue: &mut VecDeque<(u64, i32)>,
        already: &HashSet<u64>,
    ) {
        let (key_enc, hash_enc) = self.encode_entry(key);
        let mut newly_pure = BTreeMap::new();
        for sub in 0..self.num_hashfns {
            let index = self.bucket_index(key, sub);
            let bucket = &mut self.sub_tables[sub][index];
            bucket.remove_scaled(&key_enc, &hash_enc, m, self.fp);
            if let Some(candidate) = bucket.pure_multiplicity(self.n_parties, &self.hashers.key) {
                if !already.contains(&candidate.0) {
                    newly_pure.insert((sub, index), candidate);
                }
            }
        }
        queue.extend(newly_pure.into_values());
    }
}

impl Encode for MultiIblt {
    fn encode(&self, bytes: &mut Vec<u8>) {
        (self.num_buckets as u32).encode(bytes);
        (self.num_hashfns as u16).encode(bytes);
        for sub in &self.sub_tables {
            for bucket in sub {
                bucket.encode(bytes);
            }
        }
    }
}

/// Decoding parameter for [`MultiIblt`]: the structural context a sketch
/// does not carry on the wire.
#[derive(Clone)]
pub struct IbltShape {
    /// Number of synchronizing parties.
    pub n_parties: u16,
    /// Base tabulation seed of the session.
    pub seed: u32,
    /// The session's shared hasher family.
    pub hashers: Arc<HasherSet>,
}

/// Wire length of one bucket for the given field.
fn bucket_wire_len(fp: SmallFp) -> usize {
    let key_len = (fp.num_digits(KEY_BITS) * fp.digit_bits() + 7) / 8;
    let hash_len = (fp.num_digits(HASH_BITS) * fp.digit_bits() + 7) / 8;
    key_len + hash_len + std::mem::size_of::<i32>()
}

impl Decode<IbltShape> for MultiIblt {
    fn decode(shape: &IbltShape, bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let num_buckets = u32::decode(&(), bytes)? as usize;
        let num_hashfns = u16::decode(&(), bytes)? as usize;
        let fp = SmallFp::for_parties(shape.n_parties);
        let remaining = bytes.get_ref().len() as u64 - bytes.position();
        if (num_buckets as u64) * bucket_wire_len(fp) as u64 > remaining {
            return Err(CodecError::UnexpectedValue);
        }
        let mut iblt = MultiIblt::new(
            num_buckets,
            num_hashfns,
            shape.n_parties,
            shape.seed,
            Arc::clone(&shape.hashers),
        )
        .map_err(|_| CodecError::UnexpectedValue)?;
        for sub in iblt.sub_tables.iter_mut() {
            for bucket in sub.iter_mut() {
                *bucket = Bucket::decode(&fp, bytes)?;
            }
        }
        Ok(iblt)
    }
}
