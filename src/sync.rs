// SPDX-License-Identifier: MPL-2.0

//! The two-round file synchronization protocol.
//!
//! Each peer chunks its file, sketches the resulting block-key set, and
//! exchanges four messages: the initiator's strata ladder, the responder's
//! difference estimate plus sized sketch, the initiator's sketch of the
//! same size, and finally the responder's missing-block payload together
//! with its file's full block-key sequence. The initiator then replays
//! that sequence against its own block table plus the received bodies to
//! reconstruct the responder's file. Only a sketch decode failure is
//! recovered locally, by retrying with a doubled sketch; every other error
//! is fatal to the session.

use crate::chunker;
use crate::codec::{CodecError, Decode, Encode};
use crate::field::{HASH_BITS, KEY_BITS};
use crate::hash::HasherSet;
use crate::iblt::{buckets_for_difference, IbltError, IbltShape, MultiIblt};
use crate::strata::{StrataEstimator, StrataShape, STRATA_LEVELS, STRATUM_HASHFNS};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decode status carried by a [`BlockTransfer`]: the responder's sketch
/// decode succeeded.
pub const DECODE_OK: u32 = 0;

/// Decode status carried by a [`BlockTransfer`]: the responder's sketch
/// decode failed and the initiator should retry with a larger sketch.
pub const DECODE_FAILED: u32 = 1;

/// Errors surfaced by a synchronization session.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The responder could not decode the subtracted sketches. Retriable
    /// with a larger sketch.
    #[error("sketch decode failed")]
    DecodeFailed,
    /// Sketch decoding kept failing after the configured retries.
    #[error("sketch decode failed after {0} attempts")]
    RetriesExhausted(usize),
    /// The peers disagree on structural parameters.
    #[error("peers disagree on structural parameters")]
    SizeMismatch,
    /// The peers disagree on the tabulation hash seed.
    #[error("peers disagree on the tabulation hash seed")]
    HashSeedMismatch,
    /// A message arrived out of protocol order.
    #[error("message received out of protocol order")]
    OutOfOrder,
    /// A block key named by the peer's file sequence is present in neither
    /// the local table nor the transferred payload; indicates a hash
    /// collision or a protocol bug.
    #[error("block {0:#018x} missing during reconstruction")]
    BlockMissing(u64),
    /// An error surfaced from the file system or transport.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// A message failed to parse.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// An error surfaced from the sketch layer.
    #[error("sketch error: {0}")]
    Iblt(#[from] IbltError),
}

/// Parameters of a synchronization session. Both peers must construct
/// their sessions from equal configurations.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Target average block size for the content-defined chunker.
    pub avg_block_size: usize,
    /// Number of synchronizing parties the cell algebra is sized for.
    pub n_parties: u16,
    /// Sub-tables per sketch.
    pub num_hashfns: usize,
    /// Strata in the difference estimator.
    pub strata_levels: usize,
    /// Round-2 attempts before the session gives up.
    pub retry_cap: usize,
    /// Base seed for the tabulation hasher family.
    pub hash_seed: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            avg_block_size: 700,
            n_parties: 2,
            num_hashfns: 4,
            strata_levels: STRATA_LEVELS,
            retry_cap: 3,
            hash_seed: 0,
        }
    }
}

/// Round 1: the initiator's strata ladder, prefixed by the structural
/// parameters the session was built with so disagreements surface at
/// first contact.
pub struct StrataMessage {
    /// Number of parties the sender's cell algebra is sized for.
    pub n_parties: u16,
    /// Sender's block-key width in bits.
    pub key_bits: u16,
    /// Sender's fingerprint width in bits.
    pub hash_bits: u16,
    /// Strata in the sender's ladder.
    pub levels: u16,
    /// Sender's tabulation seed.
    pub seed: u32,
    /// The ladder itself.
    pub estimator: StrataEstimator,
}

impl Encode for StrataMessage {
    fn encode(&self, bytes: &mut Vec<u8>) {
        self.n_parties.encode(bytes);
        self.key_bits.encode(bytes);
        self.hash_bits.encode(bytes);
        self.levels.encode(bytes);
        self.seed.encode(bytes);
        self.estimator.encode(bytes);
    }
}

impl Decode<IbltShape> for StrataMessage {
    fn decode(shape: &IbltShape, bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let n_parties = u16::decode(&(), bytes)?;
        let key_bits = u16::decode(&(), bytes)?;
        let hash_bits = u16::decode(&(), bytes)?;
        let levels = u16::decode(&(), bytes)?;
        let seed = u32::decode(&(), bytes)?;
        // Strata are parsed with the sender's declared geometry; the
        // session rejects any disagreement before using them.
        let estimator = StrataEstimator::decode(
            &StrataShape {
                levels: levels as usize,
                iblt: IbltShape {
                    n_parties,
                    seed,
                    hashers: Arc::clone(&shape.hashers),
                },
            },
            bytes,
        )?;
        Ok(StrataMessage {
            n_parties,
            key_bits,
            hash_bits,
            levels,
            seed,
            estimator,
        })
    }
}

/// Round 1 reply: the responder's difference estimate and its sketch,
/// sized from that estimate. Round 2 is a bare sketch of the same size
/// from the initiator.
pub struct EstimateReply {
    /// Estimated size of the symmetric block-key difference.
    pub estimate: u32,
    /// The responder's sketch.
    pub iblt: MultiIblt,
}

impl Encode for EstimateReply {
    fn encode(&self, bytes: &mut Vec<u8>) {
        self.estimate.encode(bytes);
        self.iblt.encode(bytes);
    }
}

impl Decode<IbltShape> for EstimateReply {
    fn decode(shape: &IbltShape, bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let estimate = u32::decode(&(), bytes)?;
        let iblt = MultiIblt::decode(shape, bytes)?;
        Ok(EstimateReply { estimate, iblt })
    }
}

/// Round 2 reply: the responder's decode status, the block bodies only it
/// holds, and its file's complete block-key sequence.
#[derive(Debug)]
pub struct BlockTransfer {
    /// [`DECODE_OK`] or [`DECODE_FAILED`].
    pub status: u32,
    /// Bodies of the blocks only the responder holds.
    pub blocks: Vec<(u64, Vec<u8>)>,
    /// The responder's file as a sequence of block keys.
    pub order: Vec<u64>,
}

impl Encode for BlockTransfer {
    fn encode(&self, bytes: &mut Vec<u8>) {
        self.status.encode(bytes);
        (self.blocks.len() as u64).encode(bytes);
        for (key, data) in &self.blocks {
            key.encode(bytes);
            (data.len() as u64).encode(bytes);
            bytes.extend_from_slice(data);
        }
        (self.order.len() as u64).encode(bytes);
        for key in &self.order {
            key.encode(bytes);
        }
    }
}

impl Decode<()> for BlockTransfer {
    fn decode(_: &(), bytes: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let status = u32::decode(&(), bytes)?;
        let num_blocks = u64::decode(&(), bytes)?;
        let mut blocks = Vec::new();
        for _ in 0..num_blocks {
            let key = u64::decode(&(), bytes)?;
            let length = u64::decode(&(), bytes)?;
            let remaining = bytes.get_ref().len() as u64 - bytes.position();
            if length > remaining {
                return Err(CodecError::UnexpectedValue);
            }
            let mut data = vec![0u8; length as usize];
            std::io::Read::read_exact(bytes, &mut data)?;
            blocks.push((key, data));
        }
        let num_keys = u64::decode(&(), bytes)?;
        let remaining = bytes.get_ref().len() as u64 - bytes.position();
        if num_keys > remaining / 8 {
            return Err(CodecError::UnexpectedValue);
        }
        let mut order = Vec::with_capacity(num_keys as usize);
        for _ in 0..num_keys {
            order.push(u64::decode(&(), bytes)?);
        }
        Ok(BlockTransfer {
            status,
            blocks,
            order,
        })
    }
}

/// Protocol position of a session; transitions are monotone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Idle,
    Round1Sent,
    Round2Sent,
    Reconstructed,
}

/// One peer's synchronization session over a single file.
///
/// The session owns its block table, its strata ladder, its sketch, and
/// the shared hasher family; nothing is shared across sessions, so
/// independent sessions may run on separate threads freely. Messages are
/// byte buffers: the caller moves them between peers over whatever
/// transport it likes, in protocol order.
pub struct FileSync {
    config: SyncConfig,
    hashers: Arc<HasherSet>,
    blocks: HashMap<u64, Vec<u8>>,
    order: Vec<u64>,
    strata: StrataEstimator,
    sketch: Option<MultiIblt>,
    estimate: Option<u64>,
    local_only: usize,
    transferred: usize,
    state: SessionState,
}

impl FileSync {
    /// Creates a session over in-memory file content: chunks it, indexes
    /// the blocks, and fills the strata ladder with the distinct block
    /// keys.
    pub fn new(data: &[u8], config: SyncConfig) -> Result<Self, SyncError> {
        let hashers = Arc::new(HasherSet::new(
            config.hash_seed,
            config.num_hashfns.max(STRATUM_HASHFNS),
        ));
        let mut strata = StrataEstimator::new(
            config.strata_levels,
            config.n_parties,
            config.hash_seed,
            Arc::clone(&hashers),
        )?;
        let mut blocks = HashMap::new();
        let mut order = Vec::new();
        for block in chunker::chunk_bytes(data, config.avg_block_size) {
            order.push(block.key);
            if blocks.insert(block.key, block.data).is_none() {
                strata.insert(block.key);
            }
        }
        debug!(
            num_blocks = order.len(),
            distinct = blocks.len(),
            "session indexed"
        );
        Ok(FileSync {
            config,
            hashers,
            blocks,
            order,
            strata,
            sketch: None,
            estimate: None,
            local_only: 0,
            transferred: 0,
            state: SessionState::Idle,
        })
    }

    /// Creates a session over a file on disk.
    pub fn from_path(path: impl AsRef<Path>, config: SyncConfig) -> Result<Self, SyncError> {
        let data = std::fs::read(path)?;
        FileSync::new(&data, config)
    }

    /// The session's configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Number of blocks in the session's file (with repetitions).
    pub fn num_blocks(&self) -> usize {
        self.order.len()
    }

    /// The difference estimate agreed in Round 1, once known.
    pub fn difference_estimate(&self) -> Option<u64> {
        self.estimate
    }

    /// Blocks only this session's file has, per its own view of the
    /// decoded difference (initiator side, once Round 2 is prepared).
    pub fn local_only_blocks(&self) -> usize {
        self.local_only
    }

    /// Block bodies received from the peer during reconstruction.
    pub fn transferred_blocks(&self) -> usize {
        self.transferred
    }

    fn shape(&self) -> IbltShape {
        IbltShape {
            n_parties: self.config.n_parties,
            seed: self.config.hash_seed,
            hashers: Arc::clone(&self.hashers),
        }
    }

    fn build_sketch(&self, num_buckets: usize) -> Result<MultiIblt, SyncError> {
        let mut sketch = MultiIblt::new(
            num_buckets,
            self.config.num_hashfns,
            self.config.n_parties,
            self.config.hash_seed,
            Arc::clone(&self.hashers),
        )?;
        for key in self.blocks.keys() {
            sketch.insert(*key);
        }
        Ok(sketch)
    }

    /// Initiator, Round 1: produces the strata message.
    pub fn start_sync(&mut self) -> Result<Vec<u8>, SyncError> {
        if self.state != SessionState::Idle {
            return Err(SyncError::OutOfOrder);
        }
        let message = StrataMessage {
            n_parties: self.config.n_parties,
            key_bits: KEY_BITS as u16,
            hash_bits: HASH_BITS as u16,
            levels: self.config.strata_levels as u16,
            seed: self.config.hash_seed,
            estimator: self.strata.clone(),
        };
        self.state = SessionState::Round1Sent;
        Ok(message.get_encoded())
    }

    /// Responder, Round 1: consumes the initiator's strata, estimates the
    /// difference, and produces the estimate reply carrying this side's
    /// sized sketch.
    pub fn receive_strata(&mut self, bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
        if self.state != SessionState::Idle {
            return Err(SyncError::OutOfOrder);
        }
        let message = StrataMessage::get_decoded(&self.shape(), bytes)?;
        if message.seed != self.config.hash_seed {
            return Err(SyncError::HashSeedMismatch);
        }
        if message.n_parties != self.config.n_parties
            || message.key_bits as usize != KEY_BITS
            || message.hash_bits as usize != HASH_BITS
            || message.levels as usize != self.config.strata_levels
        {
            return Err(SyncError::SizeMismatch);
        }

        let estimate = self.strata.estimate(&message.estimator)?;
        let num_buckets =
            buckets_for_difference(2 * estimate as usize, self.config.num_hashfns);
        debug!(estimate, num_buckets, "difference estimated");

        let sketch = self.build_sketch(num_buckets)?;
        let reply = EstimateReply {
            estimate: estimate.min(u32::MAX as u64) as u32,
            iblt: sketch.clone(),
        };
        self.sketch = Some(sketch);
        self.estimate = Some(estimate);
        self.state = SessionState::Round1Sent;
        Ok(reply.get_encoded())
    }

    /// Initiator, Round 2: consumes the estimate reply and produces this
    /// side's sketch at the agreed size. The responder's sketch from the
    /// reply is also decoded locally, which fixes the count of blocks only
    /// this side holds for reporting.
    pub fn receive_estimate(&mut self, bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
        if self.state != SessionState::Round1Sent {
            return Err(SyncError::OutOfOrder);
        }
        let reply = EstimateReply::get_decoded(&self.shape(), bytes)?;
        if reply.iblt.num_hashfns() != self.config.num_hashfns {
            return Err(SyncError::SizeMismatch);
        }
        self.estimate = Some(reply.estimate as u64);

        let sketch = self.build_sketch(reply.iblt.num_buckets())?;
        let mut local_view = sketch.clone();
        local_view.subtract(&reply.iblt)?;
        let peeled = local_view.peel();
        if peeled.complete {
            self.local_only = peeled.recovered.iter().filter(|(_, m)| *m > 0).count();
        } else {
            debug!("local difference view did not decode; counts unavailable");
        }

        let encoded = sketch.get_encoded();
        self.sketch = Some(sketch);
        self.state = SessionState::Round2Sent;
        Ok(encoded)
    }

    /// Initiator: produces a replacement Round-2 sketch with doubled
    /// capacity, after the responder reported a decode failure.
    pub fn resize_sketch(&mut self) -> Result<Vec<u8>, SyncError> {
        if self.state != SessionState::Round2Sent {
            return Err(SyncError::OutOfOrder);
        }
        let current = self.sketch.as_ref().map(MultiIblt::num_buckets).unwrap_or(0);
        let next = if current == 0 {
            4 * self.config.num_hashfns
        } else {
            current * 2
        };
        warn!(current, next, "growing sketch for retry");
        let sketch = self.build_sketch(next)?;
        let encoded = sketch.get_encoded();
        self.sketch = Some(sketch);
        Ok(encoded)
    }

    /// Responder, Round 2: consumes the initiator's sketch, decodes the
    /// difference, and produces the block transfer. A decode failure is
    /// reported in-band so the initiator can retry; this method may be
    /// called again with the replacement sketch.
    pub fn receive_sketch(&mut self, bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
        if self.state != SessionState::Round1Sent && self.state != SessionState::Round2Sent {
            return Err(SyncError::OutOfOrder);
        }
        let mut incoming = MultiIblt::get_decoded(&self.shape(), bytes)?;
        if incoming.num_hashfns() != self.config.num_hashfns {
            return Err(SyncError::SizeMismatch);
        }

        // Retries arrive at a larger size than Round 1 agreed; rebuild to
        // match whatever the initiator sent.
        let mine = match self.sketch.take() {
            Some(sketch) if sketch.num_buckets() == incoming.num_buckets() => sketch,
            _ => self.build_sketch(incoming.num_buckets())?,
        };
        incoming.subtract(&mine)?;
        self.sketch = Some(mine);

        let peeled = incoming.peel();
        let transfer = if peeled.complete {
            let mut blocks = Vec::new();
            for (key, m) in &peeled.recovered {
                if *m < 0 {
                    let data = self
                        .blocks
                        .get(key)
                        .ok_or(SyncError::BlockMissing(*key))?;
                    blocks.push((*key, data.clone()));
                }
            }
            debug!(
                only_initiator = peeled.recovered.len() - blocks.len(),
                only_here = blocks.len(),
                "sketch decoded"
            );
            BlockTransfer {
                status: DECODE_OK,
                blocks,
                order: self.order.clone(),
            }
        } else {
            warn!(
                num_buckets = incoming.num_buckets(),
                "sketch decode failed"
            );
            BlockTransfer {
                status: DECODE_FAILED,
                blocks: Vec::new(),
                order: Vec::new(),
            }
        };
        self.state = SessionState::Round2Sent;
        Ok(transfer.get_encoded())
    }

    /// Initiator: consumes the block transfer and reconstructs the
    /// responder's file. Returns [`SyncError::DecodeFailed`] when the
    /// transfer reports a failed decode; the caller may then
    /// [`FileSync::resize_sketch`] and repeat Round 2.
    pub fn receive_blocks(&mut self, bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
        if self.state != SessionState::Round2Sent {
            return Err(SyncError::OutOfOrder);
        }
        let transfer = BlockTransfer::get_decoded(&(), bytes)?;
        if transfer.status != DECODE_OK {
            return Err(SyncError::DecodeFailed);
        }

        let received: HashMap<u64, Vec<u8>> = transfer.blocks.into_iter().collect();
        let mut output = Vec::new();
        for key in &transfer.order {
            if let Some(data) = self.blocks.get(key) {
                output.extend_from_slice(data);
            } else if let Some(data) = received.get(key) {
                output.extend_from_slice(data);
            } else {
                return Err(SyncError::BlockMissing(*key));
            }
        }
        debug!(
            transferred = received.len(),
            output_len = output.len(),
            "reconstructed peer file"
        );
        self.transferred = received.len();
        self.state = SessionState::Reconstructed;
        Ok(output)
    }
}

/// Transfer accounting for one completed session.
#[derive(Clone, Debug, Default)]
pub struct SyncReport {
    /// The responder's difference estimate.
    pub difference_estimate: u64,
    /// Bytes of the Round-1 strata message.
    pub strata_bytes: usize,
    /// Bytes of sketches exchanged (the estimate reply plus every Round-2
    /// attempt).
    pub sketch_bytes: usize,
    /// Bytes of Round-2 replies, block bodies and key sequence included.
    pub transfer_bytes: usize,
    /// Round-2 attempts beyond the first.
    pub retries: usize,
    /// Block bodies the initiator received.
    pub blocks_received: usize,
    /// Blocks only the initiator held, per its local decode.
    pub local_only_blocks: usize,
}

/// A completed synchronization: the responder's file content as
/// reconstructed by the initiator, plus transfer accounting.
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    /// The reconstructed file content.
    pub data: Vec<u8>,
    /// Transfer accounting.
    pub report: SyncReport,
}

/// Drives a complete session between two in-process peers, moving every
/// message through its wire encoding. The initiator ends holding the
/// responder's file content.
pub fn synchronize(
    initiator: &mut FileSync,
    responder: &mut FileSync,
) -> Result<SyncOutcome, SyncError> {
    let mut report = SyncReport::default();

    let round1 = initiator.start_sync()?;
    report.strata_bytes = round1.len();
    let reply = responder.receive_strata(&round1)?;
    report.sketch_bytes += reply.len();
    let mut round2 = initiator.receive_estimate(&reply)?;
    report.difference_estimate = initiator.difference_estimate().unwrap_or(0);

    let retry_cap = initiator.config().retry_cap.max(1);
    for attempt in 1..=retry_cap {
        report.sketch_bytes += round2.len();
        let transfer = responder.receive_sketch(&round2)?;
        report.transfer_bytes += transfer.len();
        match initiator.receive_blocks(&transfer) {
            Ok(data) => {
                report.retries = attempt - 1;
                report.blocks_received = initiator.transferred_blocks();
                report.local_only_blocks = initiator.local_only_blocks();
                return Ok(SyncOutcome { data, report });
            }
            Err(SyncError::DecodeFailed) if attempt < retry_cap => {
                round2 = initiator.resize_sketch()?;
            }
            Err(SyncError::DecodeFailed) => return Err(SyncError::RetriesExhausted(retry_cap)),
            Err(err) => return Err(err),
        }
    }
    Err(SyncError::RetriesExhausted(retry_cap))
}
