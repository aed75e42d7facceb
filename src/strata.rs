// SPDX-License-Identifier: MPL-2.0

//! Estimating the size of a symmetric difference with a ladder of small
//! sketches that sample the key space at geometrically decreasing rates.
//!
//! Stratum `t` receives exactly the keys whose fingerprint has `t`
//! trailing zero bits, i.e. a `2^-(t+1)` sample of the key space. Two
//! peers exchange their ladders; walking the strata from the most
//! selective down and decoding each subtracted pair yields an estimate of
//! the total difference good to a small constant factor, which is all the
//! sketch sizing needs.

use crate::codec::{CodecError, Decode, Encode};
use crate::hash::HasherSet;
use crate::iblt::{IbltError, IbltShape, MultiIblt};
use std::io::Cursor;
use std::sync::Arc;

/// Number of strata in the default ladder: one per possible trailing-zero
/// count worth distinguishing for 64-bit fingerprints.
pub const STRATA_LEVELS: usize = 32;

/// Buckets per stratum; three sub-tables of 27.
const STRATUM_BUCKETS: usize = 81;

/// Sub-tables per stratum.
pub(crate) const STRATUM_HASHFNS: usize = 3;

/// A ladder of fixed-size sketches estimating the symmetric difference
/// between two key sets.
#[derive(Clone)]
pub struct StrataEstimator {
    levels: Vec<MultiIblt>,
    hashers: Arc<HasherSet>,
}

impl StrataEstimator {
    /// Creates an empty ladder of `levels` strata.
    pub fn new(
        levels: usize,
        n_parties: u16,
        seed: u32,
        hashers: Arc<HasherSet>,
    ) -> Result<Self, IbltError> {
        let levels = (0..levels)
            .map(|_| {
                MultiIblt::new(
                    STRATUM_BUCKETS,
                    STRATUM_HASHFNS,
                    n_parties,
                    seed,
                    Arc::clone(&hashers),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StrataEstimator { levels, hashers })
    }

    /// Number of strata in the ladder.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Inserts a key into the stratum selected by the trailing-zero count
    /// of its fingerprint, clamped to the deepest stratum.
    pub fn insert(&mut self, key: u64) {
        if self.levels.is_empty() {
            return;
        }
        let fingerprint = self.hashers.key.hash(key);
        let stratum = (fingerprint.trailing_zeros() as usize).min(self.levels.len() - 1);
        self.levels[stratum].insert(key);
    }

    /// Estimates the size of the symmetric difference between this
    /// estimator's key set and a peer's.
    ///
    /// Strata are subtracted and decoded from the most selective level
    /// down, summing the recovered counts. The first level that fails to
    /// decode has seen roughly a `2^-(t+1)` sample of the whole
    /// difference, so the running sum is scaled up by `2^(t+1)`; if every
    /// level decodes the sum is exact.
    pub fn estimate(&self, other: &StrataEstimator) -> Result<u64, IbltError> {
        if self.levels.len() != other.levels.len() {
            return Err(IbltError::ShapeMismatch);
        }
        let mut recovered = 0u64;
        for stratum in (0..self.levels.len()).rev() {
            let mut diff = self.levels[stratum].clone();
            diff.subtract(&other.levels[stratum])?;
            let peeled = diff.peel();
            if !peeled.complete {
                let scale = 1u64 << ((stratum as u32 + 1).min(63));
                return Ok(recovered.saturating_mul(scale));
            }
            recovered += peeled.recovered.len() as u64;
        }
        Ok(recovered)
    }
}

impl Encode for StrataEstimator {
    fn encode(&self, bytes: &mut Vec<u8>) {
        for level in &self.levels {
            level.encode(bytes);
        }
    }
}

/// Decoding parameter for [`StrataEstimator`].
#[derive(Clone)]
pub struct StrataShape {
    /// Number of strata to read.
    pub levels: usize,
    /// Structural context for each stratum.
    pub iblt: IbltShape,
}

impl Decode<StrataShape> for StrataEstimator {
    fn decode(shape: &StrataShape, bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let levels = (0..shape.levels)
            .map(|_| MultiIblt::decode(&shape.iblt, bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StrataEstimator {
            levels,
            hashers: Arc::clone(&shape.iblt.hashers),
        })
    }
}
