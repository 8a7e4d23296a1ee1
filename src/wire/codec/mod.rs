use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;

use rmpv::Value;
use uuid::Uuid;

use crate::wire::frame::{Frame, FrameError};

pub const PING_BYTE: u8 = 0x01;
pub const PONG_BYTE: u8 = 0x02;
pub const WHOLE_MESSAGE_BYTE: u8 = 0x10;
pub const PARTIAL_MESSAGE_BYTE: u8 = 0x11;

pub const WHOLE_HEADER_SIZE_BYTES: usize = 1 + 4;
pub const PARTIAL_HEADER_SIZE_BYTES: usize = 1 + 16 + 4 + 4;

pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 16 * 1024;
pub const OFFLOAD_THRESHOLD_BYTES: usize = 30 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_frame_size_bytes: usize,
    pub chunk_size_bytes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: DEFAULT_MAX_FRAME_SIZE_BYTES,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    ZeroLengthPayload,
    UnknownControlByte { byte: u8 },
    DeclaredLengthTooLarge { length: usize, limit: usize },
    ChunkLargerThanTotal { chunk: usize, total: usize },
    TotalSizeMismatch { uuid: Uuid, declared: usize, previous: usize },
    AccumulationOverflow { uuid: Uuid, accumulated: usize, total: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    Frame(FrameError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::ZeroLengthPayload => write!(f, "protocol error: payload length cannot be zero"),
            Self::UnknownControlByte { byte } => {
                write!(f, "protocol error: unknown control byte 0x{byte:02x}")
            }
            Self::DeclaredLengthTooLarge { length, limit } => {
                write!(f, "protocol error: declared length {length} exceeds max {limit}")
            }
            Self::ChunkLargerThanTotal { chunk, total } => {
                write!(f, "protocol error: chunk of {chunk} bytes exceeds declared total {total}")
            }
            Self::TotalSizeMismatch {
                uuid,
                declared,
                previous,
            } => write!(
                f,
                "protocol error: chunk for {uuid} declares total {declared}, earlier chunks declared {previous}"
            ),
            Self::AccumulationOverflow {
                uuid,
                accumulated,
                total,
            } => write!(
                f,
                "protocol error: accumulated {accumulated} bytes for {uuid} past declared total {total}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::Frame(source) => write!(f, "frame error: {source}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// A frame encoded for the wire: the ordered transport chunks plus the
/// size of the MessagePack payload they reassemble into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub chunks: Vec<Vec<u8>>,
    pub total_size: usize,
}

/// Serializes a frame to its MessagePack payload bytes. This is the
/// CPU-heavy half of `encode`; the worker pool runs exactly this function
/// for payloads above the offload threshold.
pub fn encode_payload(frame: &Frame, limits: &CodecLimits) -> Result<Vec<u8>, CodecError> {
    let value = frame.clone().into_value();
    let mut encoded = Vec::new();
    rmpv::encode::write_value(&mut encoded, &value).map_err(CodecError::MessagePackEncode)?;

    if encoded.is_empty() {
        return Err(CodecError::ZeroLengthPayload);
    }
    if encoded.len() > limits.max_frame_size_bytes {
        return Err(CodecError::PayloadTooLarge {
            size: encoded.len(),
            limit: limits.max_frame_size_bytes,
        });
    }

    Ok(encoded)
}

/// Deserializes MessagePack payload bytes back into a frame. The worker
/// pool runs this for large inbound payloads.
pub fn decode_payload(payload: &[u8], limits: &CodecLimits) -> Result<Frame, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::ZeroLengthPayload);
    }
    if payload.len() > limits.max_frame_size_bytes {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            limit: limits.max_frame_size_bytes,
        });
    }

    let mut cursor = Cursor::new(payload);
    let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
    if cursor.position() as usize != payload.len() {
        return Err(CodecError::TrailingDataInPayload);
    }

    Frame::from_value(value).map_err(CodecError::Frame)
}

/// Splits already-serialized payload bytes into wire chunks. Deterministic:
/// the same payload and uuid always produce the same chunk sequence.
pub fn chunk_payload(uuid: Uuid, payload: &[u8], limits: &CodecLimits) -> EncodedFrame {
    let total_size = payload.len();
    if total_size <= limits.chunk_size_bytes {
        let mut chunk = Vec::with_capacity(WHOLE_HEADER_SIZE_BYTES + total_size);
        chunk.push(WHOLE_MESSAGE_BYTE);
        chunk.extend_from_slice(&(total_size as u32).to_be_bytes());
        chunk.extend_from_slice(payload);
        return EncodedFrame {
            chunks: vec![chunk],
            total_size,
        };
    }

    let mut chunks = Vec::with_capacity(total_size.div_ceil(limits.chunk_size_bytes));
    for part in payload.chunks(limits.chunk_size_bytes) {
        let mut chunk = Vec::with_capacity(PARTIAL_HEADER_SIZE_BYTES + part.len());
        chunk.push(PARTIAL_MESSAGE_BYTE);
        chunk.extend_from_slice(uuid.as_bytes());
        chunk.extend_from_slice(&(total_size as u32).to_be_bytes());
        chunk.extend_from_slice(&(part.len() as u32).to_be_bytes());
        chunk.extend_from_slice(part);
        chunks.push(chunk);
    }

    EncodedFrame { chunks, total_size }
}

/// Serializes and chunks a frame in one step, inline on the calling thread.
pub fn encode(frame: &Frame, limits: &CodecLimits) -> Result<EncodedFrame, CodecError> {
    let payload = encode_payload(frame, limits)?;
    Ok(chunk_payload(frame.uuid, &payload, limits))
}

/// Lower bound on the encoded size of a frame, used to decide whether
/// serialization should be offloaded without paying for it twice. Binary
/// bodies dominate large frames, so only those and strings are counted.
pub fn estimated_payload_size(frame: &Frame) -> usize {
    fn content_bytes(value: &Value) -> usize {
        match value {
            Value::Binary(bytes) => bytes.len(),
            Value::String(text) => text.as_bytes().len(),
            Value::Array(values) => values.iter().map(content_bytes).sum(),
            Value::Map(entries) => entries.iter().map(|(_, v)| content_bytes(v)).sum(),
            _ => 0,
        }
    }

    frame.name.len() + 36 + content_bytes(&frame.body)
}

#[derive(Debug, PartialEq)]
pub enum DecodeEvent {
    Ping,
    Pong,
    /// A fully reassembled MessagePack payload, not yet deserialized. The
    /// caller decides between inline and offloaded deserialization based
    /// on its size.
    Message { payload: Vec<u8> },
    /// A partial chunk landed; the frame for `uuid` is still incomplete.
    Progress {
        uuid: Uuid,
        total_size: usize,
        completed_size: usize,
    },
}

struct Accumulation {
    total_size: usize,
    bytes: Vec<u8>,
}

/// Incremental per-connection decoder. Bytes are fed as they arrive off the
/// socket; complete chunks are consumed, partial trailing bytes are kept
/// for the next read. Reassembly state is keyed by the uuid carried in
/// partial-chunk headers and cleared when a frame completes.
///
/// On a framing error the caller closes the connection, which drops the
/// decoder and all accumulation state with it.
pub struct FrameDecoder {
    limits: CodecLimits,
    buffer: Vec<u8>,
    partials: HashMap<Uuid, Accumulation>,
}

impl FrameDecoder {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            limits,
            buffer: Vec::new(),
            partials: HashMap::new(),
        }
    }

    /// Clears buffered bytes and per-uuid reassembly state. Shared codec
    /// workers are unaffected; they hold no per-connection state.
    pub fn dispose(&mut self) {
        self.buffer.clear();
        self.buffer.shrink_to_fit();
        self.partials.clear();
    }

    pub fn pending_reassemblies(&self) -> usize {
        self.partials.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<DecodeEvent>, CodecError> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(event) = self.try_consume_one()? {
            events.push(event);
        }
        Ok(events)
    }

    fn try_consume_one(&mut self) -> Result<Option<DecodeEvent>, CodecError> {
        let Some(&control) = self.buffer.first() else {
            return Ok(None);
        };

        match control {
            PING_BYTE => {
                self.buffer.drain(..1);
                Ok(Some(DecodeEvent::Ping))
            }
            PONG_BYTE => {
                self.buffer.drain(..1);
                Ok(Some(DecodeEvent::Pong))
            }
            WHOLE_MESSAGE_BYTE => self.consume_whole(),
            PARTIAL_MESSAGE_BYTE => self.consume_partial(),
            byte => Err(CodecError::UnknownControlByte { byte }),
        }
    }

    fn consume_whole(&mut self) -> Result<Option<DecodeEvent>, CodecError> {
        if self.buffer.len() < WHOLE_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if declared == 0 {
            return Err(CodecError::ZeroLengthPayload);
        }
        if declared > self.limits.max_frame_size_bytes {
            return Err(CodecError::DeclaredLengthTooLarge {
                length: declared,
                limit: self.limits.max_frame_size_bytes,
            });
        }

        let frame_end = WHOLE_HEADER_SIZE_BYTES + declared;
        if self.buffer.len() < frame_end {
            return Ok(None);
        }

        let payload = self.buffer[WHOLE_HEADER_SIZE_BYTES..frame_end].to_vec();
        self.buffer.drain(..frame_end);
        Ok(Some(DecodeEvent::Message { payload }))
    }

    fn consume_partial(&mut self) -> Result<Option<DecodeEvent>, CodecError> {
        if self.buffer.len() < PARTIAL_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let mut uuid_bytes = [0_u8; 16];
        uuid_bytes.copy_from_slice(&self.buffer[1..17]);
        let uuid = Uuid::from_bytes(uuid_bytes);
        let total = u32::from_be_bytes([
            self.buffer[17],
            self.buffer[18],
            self.buffer[19],
            self.buffer[20],
        ]) as usize;
        let chunk_len = u32::from_be_bytes([
            self.buffer[21],
            self.buffer[22],
            self.buffer[23],
            self.buffer[24],
        ]) as usize;

        if total == 0 || chunk_len == 0 {
            return Err(CodecError::ZeroLengthPayload);
        }
        if total > self.limits.max_frame_size_bytes {
            return Err(CodecError::DeclaredLengthTooLarge {
                length: total,
                limit: self.limits.max_frame_size_bytes,
            });
        }
        if chunk_len > total {
            return Err(CodecError::ChunkLargerThanTotal {
                chunk: chunk_len,
                total,
            });
        }

        let chunk_end = PARTIAL_HEADER_SIZE_BYTES + chunk_len;
        if self.buffer.len() < chunk_end {
            return Ok(None);
        }

        let accumulation = self.partials.entry(uuid).or_insert_with(|| Accumulation {
            total_size: total,
            bytes: Vec::with_capacity(total),
        });
        if accumulation.total_size != total {
            let previous = accumulation.total_size;
            self.partials.remove(&uuid);
            return Err(CodecError::TotalSizeMismatch {
                uuid,
                declared: total,
                previous,
            });
        }

        accumulation
            .bytes
            .extend_from_slice(&self.buffer[PARTIAL_HEADER_SIZE_BYTES..chunk_end]);
        self.buffer.drain(..chunk_end);

        let completed = accumulation.bytes.len();
        if completed > total {
            self.partials.remove(&uuid);
            return Err(CodecError::AccumulationOverflow {
                uuid,
                accumulated: completed,
                total,
            });
        }

        if completed == total {
            let finished = self
                .partials
                .remove(&uuid)
                .expect("accumulation entry must exist at completion");
            return Ok(Some(DecodeEvent::Message {
                payload: finished.bytes,
            }));
        }

        Ok(Some(DecodeEvent::Progress {
            uuid,
            total_size: total,
            completed_size: completed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use rmpv::Value;
    use uuid::Uuid;

    use crate::wire::frame::Frame;

    use super::{
        chunk_payload, decode_payload, encode, encode_payload, estimated_payload_size, CodecError,
        CodecLimits, DecodeEvent, FrameDecoder, PARTIAL_MESSAGE_BYTE, PING_BYTE, PONG_BYTE,
        WHOLE_MESSAGE_BYTE,
    };

    fn small_frame() -> Frame {
        Frame::new(
            Uuid::new_v4(),
            "Echo.echo",
            Value::Array(vec![Value::from("hi")]),
        )
    }

    fn large_binary_frame() -> Frame {
        Frame::new(
            Uuid::new_v4(),
            "Files.put",
            Value::Array(vec![Value::Binary(vec![0xa7; 100 * 1024])]),
        )
    }

    #[test]
    fn small_frame_encodes_to_a_single_whole_chunk() {
        let frame = small_frame();
        let encoded = encode(&frame, &CodecLimits::default()).expect("frame should encode");

        assert_eq!(encoded.chunks.len(), 1);
        assert_eq!(encoded.chunks[0][0], WHOLE_MESSAGE_BYTE);
    }

    #[test]
    fn large_frame_splits_into_partial_chunks() {
        let frame = large_binary_frame();
        let encoded = encode(&frame, &CodecLimits::default()).expect("frame should encode");

        assert!(encoded.chunks.len() > 1);
        for chunk in &encoded.chunks {
            assert_eq!(chunk[0], PARTIAL_MESSAGE_BYTE);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let frame = large_binary_frame();
        let first = encode(&frame, &CodecLimits::default()).expect("frame should encode");
        let second = encode(&frame, &CodecLimits::default()).expect("frame should encode");
        assert_eq!(first, second);
    }

    #[test]
    fn chunked_round_trip_reconstructs_binary_frame() {
        let frame = large_binary_frame();
        let limits = CodecLimits::default();
        let encoded = encode(&frame, &limits).expect("frame should encode");
        assert!(encoded.chunks.len() > 1);

        let mut decoder = FrameDecoder::new(limits);
        let mut payload = None;
        let mut progress_seen = 0_usize;
        for chunk in &encoded.chunks {
            for event in decoder.feed(chunk).expect("chunks should decode") {
                match event {
                    DecodeEvent::Progress {
                        uuid,
                        total_size,
                        completed_size,
                    } => {
                        assert_eq!(uuid, frame.uuid);
                        assert_eq!(total_size, encoded.total_size);
                        assert!(completed_size < total_size);
                        progress_seen += 1;
                    }
                    DecodeEvent::Message { payload: bytes } => payload = Some(bytes),
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }

        assert_eq!(progress_seen, encoded.chunks.len() - 1);
        assert_eq!(decoder.pending_reassemblies(), 0);
        let decoded = decode_payload(&payload.expect("message should complete"), &limits)
            .expect("payload should decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decoder_handles_chunks_split_across_reads() {
        let frame = small_frame();
        let limits = CodecLimits::default();
        let encoded = encode(&frame, &limits).expect("frame should encode");
        let wire = &encoded.chunks[0];

        let mut decoder = FrameDecoder::new(limits);
        let split = wire.len() / 2;
        assert!(decoder
            .feed(&wire[..split])
            .expect("partial read should not fail")
            .is_empty());
        let events = decoder
            .feed(&wire[split..])
            .expect("completed read should decode");

        assert!(matches!(events.as_slice(), [DecodeEvent::Message { .. }]));
    }

    #[test]
    fn decoder_handles_interleaved_uuids() {
        let limits = CodecLimits {
            max_frame_size_bytes: 1024 * 1024,
            chunk_size_bytes: 64,
        };
        let first = Frame::new(Uuid::new_v4(), "A.a", Value::Binary(vec![1_u8; 200]));
        let second = Frame::new(Uuid::new_v4(), "B.b", Value::Binary(vec![2_u8; 200]));
        let first_encoded = encode(&first, &limits).expect("first should encode");
        let second_encoded = encode(&second, &limits).expect("second should encode");

        let mut decoder = FrameDecoder::new(limits);
        let mut completed = Vec::new();
        let interleaved = first_encoded
            .chunks
            .iter()
            .zip(&second_encoded.chunks)
            .flat_map(|(a, b)| [a, b]);
        for chunk in interleaved {
            for event in decoder.feed(chunk).expect("interleaved chunks should decode") {
                if let DecodeEvent::Message { payload } = event {
                    completed
                        .push(decode_payload(&payload, &limits).expect("payload should decode"));
                }
            }
        }

        assert_eq!(completed.len(), 2);
        assert!(completed.contains(&first));
        assert!(completed.contains(&second));
    }

    #[test]
    fn raw_ping_and_pong_bypass_frame_decoding() {
        let mut decoder = FrameDecoder::new(CodecLimits::default());
        let events = decoder
            .feed(&[PING_BYTE, PONG_BYTE])
            .expect("control bytes should decode");
        assert_eq!(events, vec![DecodeEvent::Ping, DecodeEvent::Pong]);
    }

    #[test]
    fn unknown_control_byte_is_a_framing_error() {
        let mut decoder = FrameDecoder::new(CodecLimits::default());
        let err = decoder.feed(&[0x7f]).expect_err("unknown byte should fail");
        assert!(matches!(err, CodecError::UnknownControlByte { byte: 0x7f }));
    }

    #[test]
    fn zero_length_whole_message_is_rejected() {
        let mut decoder = FrameDecoder::new(CodecLimits::default());
        let err = decoder
            .feed(&[WHOLE_MESSAGE_BYTE, 0, 0, 0, 0])
            .expect_err("zero length should fail");
        assert!(matches!(err, CodecError::ZeroLengthPayload));
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let limits = CodecLimits {
            max_frame_size_bytes: 16,
            chunk_size_bytes: 8,
        };
        let mut decoder = FrameDecoder::new(limits);
        let mut bytes = vec![WHOLE_MESSAGE_BYTE];
        bytes.extend_from_slice(&64_u32.to_be_bytes());
        let err = decoder.feed(&bytes).expect_err("oversized length should fail");
        assert!(matches!(err, CodecError::DeclaredLengthTooLarge { .. }));
    }

    #[test]
    fn mismatched_totals_for_one_uuid_are_rejected() {
        let limits = CodecLimits {
            max_frame_size_bytes: 1024,
            chunk_size_bytes: 4,
        };
        let uuid = Uuid::new_v4();
        let mut first = vec![PARTIAL_MESSAGE_BYTE];
        first.extend_from_slice(uuid.as_bytes());
        first.extend_from_slice(&10_u32.to_be_bytes());
        first.extend_from_slice(&4_u32.to_be_bytes());
        first.extend_from_slice(&[0_u8; 4]);
        let mut second = vec![PARTIAL_MESSAGE_BYTE];
        second.extend_from_slice(uuid.as_bytes());
        second.extend_from_slice(&12_u32.to_be_bytes());
        second.extend_from_slice(&4_u32.to_be_bytes());
        second.extend_from_slice(&[0_u8; 4]);

        let mut decoder = FrameDecoder::new(limits);
        decoder.feed(&first).expect("first chunk should be accepted");
        let err = decoder.feed(&second).expect_err("total mismatch should fail");
        assert!(matches!(err, CodecError::TotalSizeMismatch { .. }));
    }

    #[test]
    fn dispose_clears_reassembly_state() {
        let limits = CodecLimits {
            max_frame_size_bytes: 1024,
            chunk_size_bytes: 4,
        };
        let frame = Frame::new(Uuid::new_v4(), "A.a", Value::Binary(vec![3_u8; 32]));
        let encoded = encode(&frame, &limits).expect("frame should encode");

        let mut decoder = FrameDecoder::new(limits);
        decoder
            .feed(&encoded.chunks[0])
            .expect("first chunk should decode");
        assert_eq!(decoder.pending_reassemblies(), 1);

        decoder.dispose();
        assert_eq!(decoder.pending_reassemblies(), 0);
    }

    #[test]
    fn payload_larger_than_limit_fails_encode() {
        let limits = CodecLimits {
            max_frame_size_bytes: 1024,
            chunk_size_bytes: 256,
        };
        let frame = Frame::new(Uuid::new_v4(), "A.a", Value::Binary(vec![0_u8; 4096]));
        let err = encode_payload(&frame, &limits).expect_err("oversized payload should fail");
        assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn estimated_size_counts_nested_binary_bodies() {
        let frame = Frame::new(
            Uuid::new_v4(),
            "Files.put",
            Value::Array(vec![
                Value::Binary(vec![0_u8; 1000]),
                Value::Map(vec![(Value::from("extra"), Value::Binary(vec![0_u8; 500]))]),
            ]),
        );
        assert!(estimated_payload_size(&frame) >= 1500);
    }

    #[test]
    fn chunking_preserves_payload_bytes_in_order() {
        let limits = CodecLimits {
            max_frame_size_bytes: 1024,
            chunk_size_bytes: 3,
        };
        let payload: Vec<u8> = (0..10).collect();
        let encoded = chunk_payload(Uuid::new_v4(), &payload, &limits);

        let mut reassembled = Vec::new();
        for chunk in &encoded.chunks {
            reassembled.extend_from_slice(&chunk[super::PARTIAL_HEADER_SIZE_BYTES..]);
        }
        assert_eq!(reassembled, payload);
        assert_eq!(encoded.total_size, payload.len());
    }
}
