//! Frame codec
//!
//! # Message Framing
//!
//! Every frame is prefixed with its payload length as an unsigned LEB128
//! varint (1-5 bytes). The payload starts with a two-byte family tag followed
//! by the bincode body:
//!
//! ```text
//! ┌──────────────┬──────────┬────────────────────────────────┐
//! │ Length (1-5) │ Tag (2B) │ Body (bincode)                 │
//! └──────────────┴──────────┴────────────────────────────────┘
//! ```
//!
//! Datagram links carry exactly one frame per datagram. Stream links feed a
//! [`StreamDecoder`] which reassembles frames across reads. Malformed frames
//! are dropped where they are found; the connection keeps going.
//!
//! Decoding a data frame accounts its size in the traffic counters and opens
//! the payload with the session cipher; encoding seals packet payloads first.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::crypto::{Cipher, CipherError};
use crate::protocol::{ControlFrame, DataFrame, DataKind, Frame};
use crate::state::{PeerState, StateCell};
use crate::stats::{TrafficStats, FRAME_OVERHEAD};

// ============================================================================
// Constants
// ============================================================================

/// Frame ceiling for the peer data protocol
pub const MAX_PEER_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Longest varint accepted for a 32-bit length
pub const MAX_VARINT_LEN: usize = 5;

/// Leading payload bytes of a data frame
pub const DATA_TAG: [u8; 2] = [0x90, 0x03];

/// Leading payload bytes of a control frame
pub const CONTROL_TAG: [u8; 2] = [0x0a, 0x5c];

/// Length of the family tag
pub const TAG_LEN: usize = 2;

// ============================================================================
// Varint
// ============================================================================

/// Append `value` as an unsigned LEB128 varint
pub fn put_uvarint(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Read an unsigned LEB128 varint, returning the value and bytes consumed
pub fn read_uvarint(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(DecodeError::InvalidLength);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if value > u64::from(u32::MAX) {
                return Err(DecodeError::InvalidLength);
            }
            return Ok((value as u32, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(DecodeError::InvalidLength);
    }
    Err(DecodeError::Incomplete(1))
}

// ============================================================================
// Frame Context
// ============================================================================

/// Reasons a payload was left as is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Session has no server connection yet
    NotReady(PeerState),
    Empty,
    NoCipher,
    Cipher(CipherError),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::NotReady(state) => write!(f, "session not connected ({})", state),
            PayloadError::Empty => write!(f, "empty payload"),
            PayloadError::NoCipher => write!(f, "no cipher configured"),
            PayloadError::Cipher(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Session facilities the codec consults while framing: the payload cipher,
/// the session state gating it, and the traffic counters
pub struct FrameContext {
    state: Arc<StateCell>,
    cipher: RwLock<Option<Arc<dyn Cipher>>>,
    stats: TrafficStats,
}

impl FrameContext {
    pub fn new(state: Arc<StateCell>) -> Self {
        FrameContext {
            state,
            cipher: RwLock::new(None),
            stats: TrafficStats::new(),
        }
    }

    pub fn set_cipher(&self, cipher: Option<Arc<dyn Cipher>>) {
        match self.cipher.write() {
            Ok(mut slot) => *slot = cipher,
            Err(poisoned) => *poisoned.into_inner() = cipher,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    /// Move the session to `state`, returning the previous one
    pub fn set_state(&self, state: PeerState) -> PeerState {
        self.state.set(state)
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    fn cipher(&self) -> Option<Arc<dyn Cipher>> {
        match self.cipher.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn checked_cipher(&self, data: &[u8]) -> Result<Arc<dyn Cipher>, PayloadError> {
        let state = self.state.get();
        if state < PeerState::ConnOk {
            return Err(PayloadError::NotReady(state));
        }
        if data.is_empty() {
            return Err(PayloadError::Empty);
        }
        self.cipher().ok_or(PayloadError::NoCipher)
    }

    /// Seal a payload with the session cipher
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, PayloadError> {
        self.checked_cipher(data)?
            .encrypt(data)
            .map_err(PayloadError::Cipher)
    }

    /// Open a payload sealed by [`FrameContext::encrypt`]
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, PayloadError> {
        self.checked_cipher(data)?
            .decrypt(data)
            .map_err(PayloadError::Cipher)
    }

    /// Account traffic once the session has a server connection
    pub fn record(&self, bytes: u64, receive: bool, direct: bool) {
        if self.state.get() >= PeerState::ConnOk {
            self.stats.record(bytes, receive, direct);
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Stateless frame encoder and datagram decoder bound to a session context
#[derive(Clone)]
pub struct FrameCodec {
    context: Arc<FrameContext>,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(context: Arc<FrameContext>, max_frame_len: usize) -> Self {
        FrameCodec {
            context,
            max_frame_len,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode a frame with its length prefix
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
        let payload = match frame {
            Frame::Control(control) => {
                let payload = serialize_tagged(CONTROL_TAG, control)?;
                self.context.record(payload.len() as u64, false, false);
                payload
            }
            Frame::Data(data) => {
                let data = self.seal(data)?;
                let payload = serialize_tagged(DATA_TAG, &*data)?;
                self.context.record(
                    FRAME_OVERHEAD + data.data.len() as u64,
                    false,
                    data.is_direct(),
                );
                payload
            }
        };

        if payload.len() > self.max_frame_len {
            return Err(EncodeError::MessageTooLarge {
                size: payload.len(),
                max: self.max_frame_len,
            });
        }

        let mut buf = Vec::with_capacity(MAX_VARINT_LEN + payload.len());
        put_uvarint(&mut buf, payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode exactly one frame from a datagram
    pub fn decode_datagram(&self, datagram: &[u8]) -> Result<Frame, DecodeError> {
        let (length, consumed) = read_uvarint(datagram)?;
        let length = length as usize;
        if length > self.max_frame_len {
            return Err(DecodeError::MessageTooLarge(length));
        }
        let body = &datagram[consumed..];
        if body.len() < length {
            return Err(DecodeError::Incomplete(length - body.len()));
        }
        self.decode_payload(&body[..length])
    }

    /// Decode a payload (tag + body) without its length prefix
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Frame, DecodeError> {
        if payload.len() < TAG_LEN {
            return Err(DecodeError::Undersized);
        }
        let (tag, body) = payload.split_at(TAG_LEN);
        match [tag[0], tag[1]] {
            DATA_TAG => {
                let mut frame: DataFrame = deserialize(body)?;
                self.context.record(
                    FRAME_OVERHEAD + frame.data.len() as u64,
                    true,
                    frame.is_direct(),
                );
                self.open(&mut frame);
                Ok(Frame::Data(frame))
            }
            CONTROL_TAG => {
                let frame: ControlFrame = deserialize(body)?;
                self.context.record(payload.len() as u64, true, false);
                Ok(Frame::Control(frame))
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }

    /// Start a reassembler for a stream link
    pub fn stream_decoder(&self) -> StreamDecoder {
        StreamDecoder::new(self.clone())
    }

    /// Packets travel sealed whenever the session holds a cipher
    fn seal<'a>(&self, frame: &'a DataFrame) -> Result<Cow<'a, DataFrame>, EncodeError> {
        if frame.kind != DataKind::Packet || frame.data.is_empty() || self.context.cipher().is_none() {
            return Ok(Cow::Borrowed(frame));
        }
        match self.context.encrypt(&frame.data) {
            Ok(sealed) => Ok(Cow::Owned(DataFrame {
                data: sealed,
                ..frame.clone()
            })),
            Err(e) => {
                log::warn!("packet to {} dropped: {}", frame.dst, e);
                Err(EncodeError::Seal(e.to_string()))
            }
        }
    }

    fn open(&self, frame: &mut DataFrame) {
        if frame.kind != DataKind::Packet || frame.data.is_empty() {
            return;
        }
        match self.context.decrypt(&frame.data) {
            Ok(plain) => frame.data = plain,
            Err(e) => log::trace!("keeping packet as received: {}", e),
        }
    }
}

fn serialize_tagged<T: serde::Serialize>(tag: [u8; 2], body: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serialize(&(tag, body)).map_err(|e| EncodeError::Serialization(e.to_string()))
}

fn deserialize<'a, T: serde::Deserialize<'a>>(body: &'a [u8]) -> Result<T, DecodeError> {
    bincode::deserialize(body).map_err(|e| DecodeError::Deserialization(e.to_string()))
}

// ============================================================================
// Stream Reassembly
// ============================================================================

/// Accumulates stream bytes and yields complete frames in order
pub struct StreamDecoder {
    codec: FrameCodec,
    buf: Vec<u8>,
    /// Length of the frame whose prefix has been consumed
    expected: Option<usize>,
    /// Bytes of an oversized frame still to discard
    skip: usize,
}

impl StreamDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        StreamDecoder {
            codec,
            buf: Vec::new(),
            expected: None,
            skip: 0,
        }
    }

    /// Feed bytes read from the stream; returns every frame completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut input = bytes;

        if self.skip > 0 {
            let n = self.skip.min(input.len());
            self.skip -= n;
            input = &input[n..];
        }
        self.buf.extend_from_slice(input);

        loop {
            let length = match self.expected {
                Some(length) => length,
                None => match read_uvarint(&self.buf) {
                    Ok((length, consumed)) => {
                        self.buf.drain(..consumed);
                        let length = length as usize;
                        if length > self.codec.max_frame_len {
                            log::debug!("dropping oversized frame ({} bytes)", length);
                            let n = length.min(self.buf.len());
                            self.buf.drain(..n);
                            self.skip = length - n;
                            continue;
                        }
                        self.expected = Some(length);
                        length
                    }
                    Err(DecodeError::Incomplete(_)) => break,
                    Err(e) => {
                        log::debug!("resetting stream framing: {}", e);
                        self.reset();
                        break;
                    }
                },
            };

            if self.buf.len() < length {
                break;
            }
            let payload: Vec<u8> = self.buf.drain(..length).collect();
            self.expected = None;

            match self.codec.decode_payload(&payload) {
                Ok(frame) => frames.push(frame),
                Err(e) => log::debug!("dropping frame: {}", e),
            }
        }

        frames
    }

    /// Bytes buffered towards the next frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = None;
        self.skip = 0;
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during frame encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Frame exceeds the link's ceiling
    MessageTooLarge { size: usize, max: usize },
    /// Packet could not be sealed with the session cipher
    Seal(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::MessageTooLarge { size, max } => {
                write!(f, "frame too large: {} bytes (max {})", size, max)
            }
            EncodeError::Seal(e) => write!(f, "packet not sealed: {}", e),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur during frame decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data (need N more bytes)
    Incomplete(usize),
    /// Length prefix is not a valid 32-bit varint
    InvalidLength,
    /// Frame exceeds the link's ceiling
    MessageTooLarge(usize),
    /// Payload shorter than the family tag
    Undersized,
    /// Payload does not start with a known family tag
    UnknownTag([u8; 2]),
    /// Deserialization failed
    Deserialization(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Incomplete(needed) => {
                write!(f, "incomplete frame, need {} more bytes", needed)
            }
            DecodeError::InvalidLength => write!(f, "invalid length prefix"),
            DecodeError::MessageTooLarge(size) => write!(f, "frame too large: {} bytes", size),
            DecodeError::Undersized => write!(f, "frame shorter than its tag"),
            DecodeError::UnknownTag(tag) => {
                write!(f, "unknown frame tag {:02x}{:02x}", tag[0], tag[1])
            }
            DecodeError::Deserialization(e) => write!(f, "deserialization error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PeerId;
    use crate::crypto::AesGcmCipher;
    use crate::protocol::{ControlMessage, P2PTrigger, Pong, Statistics};

    const A: PeerId = PeerId(0x0000_1122_3344_5566);
    const B: PeerId = PeerId(0x0000_6655_4433_2210);

    fn context(state: PeerState) -> Arc<FrameContext> {
        Arc::new(FrameContext::new(Arc::new(StateCell::new(state))))
    }

    fn codec() -> FrameCodec {
        FrameCodec::new(context(PeerState::Ok), MAX_PEER_FRAME_LEN)
    }

    fn trigger() -> Frame {
        Frame::Control(ControlFrame::new(
            A,
            7,
            ControlMessage::P2PTrigger(P2PTrigger { src: A, dst: B }),
        ))
    }

    #[test]
    fn test_varint_encoding() {
        for (value, len) in [(0u32, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (u32::MAX, 5)] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, value);
            assert_eq!(buf.len(), len, "value {}", value);
            assert_eq!(read_uvarint(&buf).unwrap(), (value, len));
        }
    }

    #[test]
    fn test_varint_incomplete_and_overflow() {
        assert!(matches!(read_uvarint(&[]), Err(DecodeError::Incomplete(_))));
        assert!(matches!(read_uvarint(&[0x80, 0x80]), Err(DecodeError::Incomplete(_))));
        assert_eq!(
            read_uvarint(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(DecodeError::InvalidLength)
        );
        // Fifth byte carries bits above 32
        assert_eq!(
            read_uvarint(&[0xff, 0xff, 0xff, 0xff, 0x7f]),
            Err(DecodeError::InvalidLength)
        );
    }

    #[test]
    fn test_datagram_roundtrip_control() {
        let codec = codec();
        let frame = trigger();
        let encoded = codec.encode(&frame).unwrap();
        assert_eq!(codec.decode_datagram(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_datagram_roundtrip_payload_sizes() {
        let codec = codec();
        for size in [0usize, 1, 127, 128, 1500, 65_535, MAX_PEER_FRAME_LEN - 64] {
            let frame = Frame::Data(DataFrame::packet(A, B, vec![0xab; size]));
            let encoded = codec.encode(&frame).unwrap();
            assert_eq!(codec.decode_datagram(&encoded).unwrap(), frame, "size {}", size);
        }
    }

    #[test]
    fn test_family_tags_lead_payload() {
        let codec = codec();
        let data = codec
            .encode(&Frame::Data(DataFrame::packet(A, B, vec![1, 2, 3])))
            .unwrap();
        let (_, consumed) = read_uvarint(&data).unwrap();
        assert_eq!(data[consumed..consumed + 2], DATA_TAG);

        let control = codec.encode(&trigger()).unwrap();
        let (_, consumed) = read_uvarint(&control).unwrap();
        assert_eq!(control[consumed..consumed + 2], CONTROL_TAG);
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let codec = FrameCodec::new(context(PeerState::Ok), 64);
        let frame = Frame::Data(DataFrame::packet(A, B, vec![0; 128]));
        assert!(matches!(
            codec.encode(&frame),
            Err(EncodeError::MessageTooLarge { max: 64, .. })
        ));
    }

    #[test]
    fn test_datagram_rejects_malformed() {
        let codec = FrameCodec::new(context(PeerState::Ok), 1024);

        let mut oversized = Vec::new();
        put_uvarint(&mut oversized, 4096);
        oversized.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            codec.decode_datagram(&oversized),
            Err(DecodeError::MessageTooLarge(4096))
        );

        assert_eq!(codec.decode_datagram(&[1, 0x90]), Err(DecodeError::Undersized));
        assert_eq!(
            codec.decode_datagram(&[3, 0xde, 0xad, 0x00]),
            Err(DecodeError::UnknownTag([0xde, 0xad]))
        );
        assert!(matches!(
            codec.decode_datagram(&[4, 0x90, 0x03, 0xff, 0xff]),
            Err(DecodeError::Deserialization(_))
        ));

        let encoded = codec.encode(&trigger()).unwrap();
        assert!(matches!(
            codec.decode_datagram(&encoded[..encoded.len() - 1]),
            Err(DecodeError::Incomplete(1))
        ));
    }

    #[test]
    fn test_stream_split_at_every_boundary() {
        let codec = codec();
        let frames = vec![
            trigger(),
            Frame::Data(DataFrame::packet(A, B, vec![7; 300])),
            Frame::Control(ControlFrame::new(
                B,
                0,
                ControlMessage::Pong(Pong {
                    extern_sock: Some("203.0.113.9:4000".parse().unwrap()),
                }),
            )),
            Frame::Data(DataFrame::signal(DataKind::P2PTry, A, B)),
        ];
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend(codec.encode(frame).unwrap());
        }

        for split in 0..=wire.len() {
            let mut decoder = codec.stream_decoder();
            let mut out = decoder.feed(&wire[..split]);
            out.extend(decoder.feed(&wire[split..]));
            assert_eq!(out, frames, "split at {}", split);
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_stream_byte_by_byte() {
        let codec = codec();
        let frames = vec![trigger(), Frame::Data(DataFrame::packet(A, B, vec![9; 200]))];
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend(codec.encode(frame).unwrap());
        }

        let mut decoder = codec.stream_decoder();
        let mut out = Vec::new();
        for byte in &wire {
            out.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(out, frames);
    }

    #[test]
    fn test_stream_skips_oversized_frame() {
        let codec = FrameCodec::new(context(PeerState::Ok), 256);
        let good = trigger();

        let mut wire = Vec::new();
        put_uvarint(&mut wire, 1000);
        wire.extend(vec![0x5a; 1000]);
        wire.extend(codec.encode(&good).unwrap());

        let mut decoder = codec.stream_decoder();
        let mut out = decoder.feed(&wire[..600]);
        out.extend(decoder.feed(&wire[600..]));
        assert_eq!(out, vec![good]);
    }

    #[test]
    fn test_stream_drops_corrupt_frame_and_continues() {
        let codec = codec();
        let good = trigger();

        let mut wire = vec![3, 0xde, 0xad, 0xbe];
        wire.extend(codec.encode(&good).unwrap());

        let mut decoder = codec.stream_decoder();
        assert_eq!(decoder.feed(&wire), vec![good]);
    }

    #[test]
    fn test_stream_resets_on_invalid_prefix() {
        let codec = codec();
        let mut decoder = codec.stream_decoder();
        assert!(decoder.feed(&[0xff; 6]).is_empty());
        assert_eq!(decoder.buffered(), 0);

        let good = trigger();
        assert_eq!(decoder.feed(&codec.encode(&good).unwrap()), vec![good]);
    }

    struct FailingCipher;

    impl Cipher for FailingCipher {
        fn encrypt(&self, _plain: &[u8]) -> Result<Vec<u8>, CipherError> {
            Err(CipherError::Seal)
        }

        fn decrypt(&self, _sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
            Err(CipherError::Open)
        }
    }

    #[test]
    fn test_unsealable_packet_dropped() {
        let ctx = context(PeerState::Ok);
        ctx.set_cipher(Some(Arc::new(FailingCipher)));
        let codec = FrameCodec::new(ctx.clone(), MAX_PEER_FRAME_LEN);

        let frame = Frame::Data(DataFrame::packet(A, B, b"secret payload".to_vec()));
        assert!(matches!(codec.encode(&frame), Err(EncodeError::Seal(_))));
        assert_eq!(ctx.stats().snapshot(), Statistics::default());

        // Signals carry no payload and still go out
        let ping = Frame::Data(DataFrame::signal(DataKind::Ping, A, B));
        assert!(codec.encode(&ping).is_ok());
    }

    #[test]
    fn test_cipher_before_connect_drops_packet() {
        let ctx = context(PeerState::UnConn);
        ctx.set_cipher(Some(Arc::new(AesGcmCipher::new(b"k").unwrap())));
        let codec = FrameCodec::new(ctx, MAX_PEER_FRAME_LEN);

        let frame = Frame::Data(DataFrame::packet(A, B, b"early".to_vec()));
        assert!(matches!(codec.encode(&frame), Err(EncodeError::Seal(_))));
    }

    #[test]
    fn test_packet_plain_without_cipher() {
        let codec = codec();
        let plain = b"plain ethernet frame".to_vec();
        let frame = Frame::Data(DataFrame::packet(A, B, plain.clone()));
        let encoded = codec.encode(&frame).unwrap();
        assert!(encoded.windows(plain.len()).any(|w| w == plain.as_slice()));
    }

    #[test]
    fn test_packet_sealed_on_wire() {
        let ctx = context(PeerState::Ok);
        ctx.set_cipher(Some(Arc::new(AesGcmCipher::new(b"k").unwrap())));
        let codec = FrameCodec::new(ctx, MAX_PEER_FRAME_LEN);

        let plain = b"plain ethernet frame".to_vec();
        let frame = Frame::Data(DataFrame::packet(A, B, plain.clone()));
        let encoded = codec.encode(&frame).unwrap();
        assert!(!encoded.windows(plain.len()).any(|w| w == plain.as_slice()));
        assert_eq!(codec.decode_datagram(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_payload_ops_gated_by_state() {
        let ctx = context(PeerState::UnConn);
        ctx.set_cipher(Some(Arc::new(AesGcmCipher::new(b"k").unwrap())));
        assert_eq!(
            ctx.encrypt(b"x"),
            Err(PayloadError::NotReady(PeerState::UnConn))
        );

        let ctx = context(PeerState::ConnOk);
        assert_eq!(ctx.encrypt(b"x"), Err(PayloadError::NoCipher));
        ctx.set_cipher(Some(Arc::new(AesGcmCipher::new(b"k").unwrap())));
        assert_eq!(ctx.encrypt(b""), Err(PayloadError::Empty));
        assert_eq!(ctx.decrypt(b""), Err(PayloadError::Empty));
    }

    #[test]
    fn test_stats_split_relay_and_direct() {
        let ctx = context(PeerState::Ok);
        let codec = FrameCodec::new(ctx.clone(), MAX_PEER_FRAME_LEN);

        let direct = Frame::Data(DataFrame::packet(A, B, vec![0; 100]));
        let mut relayed = DataFrame::packet(A, B, vec![0; 50]);
        relayed.token = 9;

        let wire = codec.encode(&direct).unwrap();
        codec.decode_datagram(&wire).unwrap();
        codec.encode(&Frame::Data(relayed)).unwrap();

        let s = ctx.stats().snapshot();
        assert_eq!(s.direct_send, FRAME_OVERHEAD + 100);
        assert_eq!(s.direct_receive, FRAME_OVERHEAD + 100);
        assert_eq!(s.relay_send, FRAME_OVERHEAD + 50);
    }

    #[test]
    fn test_stats_ignored_before_connect() {
        let ctx = context(PeerState::InitOk);
        let codec = FrameCodec::new(ctx.clone(), MAX_PEER_FRAME_LEN);
        codec.encode(&trigger()).unwrap();
        assert_eq!(ctx.stats().snapshot(), Default::default());
    }
}
