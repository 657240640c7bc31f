//! Chunk codec for data channel messages.
//!
//! Assembled messages can exceed what a single SCTP frame will carry, so
//! every message travels as one or more framed chunks:
//! `version(1) | msg_id(16) | seq(4) | total(4) | payload`, integers
//! big-endian. The channel is ordered and reliable, so a partial message
//! converges without timers; a stalled message id holds exactly one partial
//! buffer until the channel goes away.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::ChunkError;

pub const CHUNK_VERSION: u8 = 0xCA;
const HEADER_LEN: usize = 1 + 16 + 4 + 4;
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_chunk_bytes: usize,
    pub max_message_bytes: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ChunkConfig {
    pub fn payload_capacity(&self) -> usize {
        self.max_chunk_bytes.saturating_sub(HEADER_LEN).max(1)
    }

    pub fn max_chunks(&self) -> usize {
        let payload_cap = self.payload_capacity();
        self.max_message_bytes.div_ceil(payload_cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub msg_id: u128,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

pub fn split_message(
    payload: &[u8],
    msg_id: u128,
    config: &ChunkConfig,
) -> Result<Vec<ChunkFrame>, ChunkError> {
    if payload.len() > config.max_message_bytes {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    if payload.is_empty() {
        return Ok(vec![ChunkFrame {
            msg_id,
            seq: 0,
            total: 1,
            payload: Bytes::new(),
        }]);
    }

    let payload_cap = config.payload_capacity();
    let mut frames = Vec::new();
    for (seq, chunk) in payload.chunks(payload_cap).enumerate() {
        let seq = u32::try_from(seq).map_err(|_| ChunkError::Malformed("chunk seq overflow"))?;
        frames.push(ChunkFrame {
            msg_id,
            seq,
            total: 0, // patched below
            payload: Bytes::copy_from_slice(chunk),
        });
    }
    if frames.len() > config.max_chunks() {
        return Err(ChunkError::MessageTooLarge(payload.len()));
    }
    let total =
        u32::try_from(frames.len()).map_err(|_| ChunkError::Malformed("chunk total overflow"))?;
    for frame in frames.iter_mut() {
        frame.total = total;
    }
    Ok(frames)
}

pub fn encode_chunk(frame: &ChunkFrame) -> Bytes {
    let mut buf = Vec::with_capacity(HEADER_LEN.saturating_add(frame.payload.len()));
    buf.push(CHUNK_VERSION);
    buf.extend_from_slice(&frame.msg_id.to_be_bytes());
    buf.extend_from_slice(&frame.seq.to_be_bytes());
    buf.extend_from_slice(&frame.total.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Bytes::from(buf)
}

pub fn decode_chunk(bytes: &[u8], config: &ChunkConfig) -> Result<ChunkFrame, ChunkError> {
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("chunk frame too short"));
    }
    if bytes[0] != CHUNK_VERSION {
        return Err(ChunkError::Malformed("unknown chunk version"));
    }
    if bytes.len() > config.max_chunk_bytes {
        return Err(ChunkError::ChunkTooLarge(bytes.len()));
    }
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&bytes[1..17]);
    let msg_id = u128::from_be_bytes(id_bytes);
    let seq = u32::from_be_bytes(bytes[17..21].try_into().unwrap_or_default());
    let total = u32::from_be_bytes(bytes[21..25].try_into().unwrap_or_default());

    let frame = ChunkFrame {
        msg_id,
        seq,
        total,
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
    };
    validate_chunk_bounds(&frame, config)?;
    Ok(frame)
}

fn validate_chunk_bounds(frame: &ChunkFrame, config: &ChunkConfig) -> Result<(), ChunkError> {
    if frame.total == 0 {
        return Err(ChunkError::Malformed("chunk total cannot be zero"));
    }
    if frame.seq >= frame.total {
        return Err(ChunkError::Malformed("chunk seq exceeds total"));
    }
    if frame.payload.len() > config.payload_capacity() {
        return Err(ChunkError::ChunkTooLarge(frame.payload.len()));
    }
    if frame.total as usize > config.max_chunks() {
        return Err(ChunkError::MessageTooLarge(
            frame.total as usize * config.payload_capacity(),
        ));
    }
    Ok(())
}

#[derive(Debug)]
struct PartialMessage {
    total: u32,
    chunks: Vec<Option<Bytes>>,
    received: u32,
    received_bytes: usize,
}

impl PartialMessage {
    fn new(total: u32) -> Self {
        Self {
            total,
            chunks: vec![None; total as usize],
            received: 0,
            received_bytes: 0,
        }
    }
}

/// Rebuilds messages from frames. Duplicate frames are ignored; an invalid
/// frame drops only its own message id.
pub struct Reassembler {
    partials: HashMap<u128, PartialMessage>,
    config: ChunkConfig,
}

impl Reassembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
        }
    }

    pub fn ingest(&mut self, frame: ChunkFrame) -> Result<Option<Bytes>, ChunkError> {
        validate_chunk_bounds(&frame, &self.config)?;
        if frame.total == 1 && frame.seq == 0 {
            if frame.payload.len() > self.config.max_message_bytes {
                return Err(ChunkError::MessageTooLarge(frame.payload.len()));
            }
            // A reused id supersedes whatever partial it left behind.
            self.partials.remove(&frame.msg_id);
            return Ok(Some(frame.payload));
        }

        let ChunkFrame {
            msg_id,
            seq,
            total,
            payload,
        } = frame;

        let entry = self
            .partials
            .entry(msg_id)
            .or_insert_with(|| PartialMessage::new(total));

        if entry.total != total {
            self.partials.remove(&msg_id);
            return Err(ChunkError::Malformed("chunk total changed for message"));
        }

        let slot = seq as usize;
        if entry.chunks[slot].is_none() {
            entry.received_bytes = entry.received_bytes.saturating_add(payload.len());
            entry.chunks[slot] = Some(payload);
            entry.received += 1;
        }

        if entry.received_bytes > self.config.max_message_bytes {
            let size = entry.received_bytes;
            self.partials.remove(&msg_id);
            return Err(ChunkError::MessageTooLarge(size));
        }

        if entry.received < entry.total {
            return Ok(None);
        }

        let mut combined = Vec::with_capacity(entry.received_bytes);
        for chunk in entry.chunks.iter() {
            match chunk {
                Some(payload) => combined.extend_from_slice(payload),
                None => return Err(ChunkError::Malformed("missing chunk during reassembly")),
            }
        }
        self.partials.remove(&msg_id);
        Ok(Some(Bytes::from(combined)))
    }

    pub fn inflight(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::thread_rng;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_chunk_bytes: HEADER_LEN + 8,
            max_message_bytes: 1024,
        }
    }

    #[test]
    fn split_and_reassemble_round_trip() {
        let config = small_config();
        let payload: Vec<u8> = (0..100u8).collect();
        let frames = split_message(&payload, 42, &config).unwrap();
        assert!(frames.len() > 1);

        let mut reassembler = Reassembler::new(config);
        let mut completed = None;
        for frame in frames {
            let decoded = decode_chunk(&encode_chunk(&frame), &config).unwrap();
            if let Some(message) = reassembler.ingest(decoded).unwrap() {
                completed = Some(message);
            }
        }
        assert_eq!(completed.unwrap().as_ref(), payload.as_slice());
        assert_eq!(reassembler.inflight(), 0);
    }

    #[test]
    fn out_of_order_and_duplicate_frames() {
        let config = small_config();
        let payload: Vec<u8> = (0..64u8).collect();
        let mut frames = split_message(&payload, 7, &config).unwrap();
        let duplicate = frames[0].clone();
        frames.push(duplicate);
        frames.shuffle(&mut thread_rng());

        let mut reassembler = Reassembler::new(config);
        let mut completed = None;
        for frame in frames {
            if let Some(message) = reassembler.ingest(frame).unwrap() {
                assert!(completed.is_none(), "message completed twice");
                completed = Some(message);
            }
        }
        assert_eq!(completed.unwrap().as_ref(), payload.as_slice());
    }

    #[test]
    fn empty_message_is_a_single_frame() {
        let config = small_config();
        let frames = split_message(&[], 1, &config).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].total, 1);

        let mut reassembler = Reassembler::new(config);
        let message = reassembler.ingest(frames.into_iter().next().unwrap()).unwrap();
        assert_eq!(message.unwrap().len(), 0);
    }

    #[test]
    fn oversize_message_rejected_on_split() {
        let config = small_config();
        let payload = vec![0u8; config.max_message_bytes + 1];
        assert_eq!(
            split_message(&payload, 1, &config),
            Err(ChunkError::MessageTooLarge(payload.len()))
        );
    }

    #[test]
    fn decode_rejects_bad_frames() {
        let config = small_config();
        assert_eq!(
            decode_chunk(&[CHUNK_VERSION, 0, 0], &config),
            Err(ChunkError::Malformed("chunk frame too short"))
        );
        let mut frame = encode_chunk(&ChunkFrame {
            msg_id: 1,
            seq: 0,
            total: 1,
            payload: Bytes::from_static(b"xy"),
        })
        .to_vec();
        frame[0] = 0x00;
        assert_eq!(
            decode_chunk(&frame, &config),
            Err(ChunkError::Malformed("unknown chunk version"))
        );
    }

    #[test]
    fn seq_out_of_range_rejected() {
        let config = small_config();
        let frame = ChunkFrame {
            msg_id: 1,
            seq: 3,
            total: 2,
            payload: Bytes::new(),
        };
        let encoded = encode_chunk(&frame);
        assert_eq!(
            decode_chunk(&encoded, &config),
            Err(ChunkError::Malformed("chunk seq exceeds total"))
        );
    }

    #[test]
    fn total_mismatch_drops_partial() {
        let config = small_config();
        let mut reassembler = Reassembler::new(config);
        let first = ChunkFrame {
            msg_id: 5,
            seq: 0,
            total: 3,
            payload: Bytes::from_static(b"a"),
        };
        assert_eq!(reassembler.ingest(first), Ok(None));
        let conflicting = ChunkFrame {
            msg_id: 5,
            seq: 1,
            total: 2,
            payload: Bytes::from_static(b"b"),
        };
        assert!(reassembler.ingest(conflicting).is_err());
        assert_eq!(reassembler.inflight(), 0);
    }

    #[test]
    fn single_frame_reuse_of_an_id_clears_its_stale_partial() {
        let config = small_config();
        let mut reassembler = Reassembler::new(config);
        let partial = ChunkFrame {
            msg_id: 11,
            seq: 0,
            total: 2,
            payload: Bytes::from_static(b"a"),
        };
        assert_eq!(reassembler.ingest(partial), Ok(None));
        assert_eq!(reassembler.inflight(), 1);

        let whole = ChunkFrame {
            msg_id: 11,
            seq: 0,
            total: 1,
            payload: Bytes::from_static(b"whole"),
        };
        let message = reassembler.ingest(whole).unwrap().unwrap();
        assert_eq!(message.as_ref(), b"whole");
        assert_eq!(reassembler.inflight(), 0);
    }

    #[test]
    fn stalled_message_keeps_single_entry() {
        let config = small_config();
        let mut reassembler = Reassembler::new(config);
        for _ in 0..10 {
            let frame = ChunkFrame {
                msg_id: 9,
                seq: 0,
                total: 2,
                payload: Bytes::from_static(b"a"),
            };
            assert_eq!(reassembler.ingest(frame), Ok(None));
        }
        assert_eq!(reassembler.inflight(), 1);
    }
}
