//! HTTP/2 wire-format frame codec (component C1).
//!
//! Grounded in the teacher crate's `frame.rs`/`enums.rs`/`types.rs`: the
//! 9-byte header layout, `FrameType`/`ErrorCode` as `#[repr]` enums decoded
//! with `num_derive::FromPrimitive`, and the convenience constructors idea
//! are all carried over. What changes: the teacher's `Frame` read directly
//! off an `async_std` stream; here `parse`/`encode` are pure, allocation-
//! light, sans-I/O functions over byte slices, so the connection layer
//! (C4) owns all I/O and this module owns none — matching Design Note 5's
//! instruction that the codec stay a pure bytes-to-record translator with
//! zero semantic validation.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// 9-byte frame header, §3 "Frame" invariant: `length <= MAX_FRAME_SIZE`.
pub const FRAME_HEADER_LEN: usize = 9;

/// Initial (and minimum) negotiable value of SETTINGS_MAX_FRAME_SIZE.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// The largest length a 24-bit frame-length field can represent.
pub const ABSOLUTE_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Mask applied to stream ids on the wire: the top bit is reserved and
/// MUST be ignored by the receiver (spec §3).
const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    #[must_use]
    pub fn from_wire(value: u32) -> Self {
        Self::from_u32(value).unwrap_or(ErrorCode::InternalError)
    }
}

bitflags! {
    pub struct DataFlags: u8 {
        const END_STREAM = 0x1;
        const PADDED = 0x8;
    }
}

bitflags! {
    pub struct HeadersFlags: u8 {
        const END_STREAM = 0x1;
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
        const PRIORITY = 0x20;
    }
}

bitflags! {
    pub struct SettingsFlags: u8 {
        const ACK = 0x1;
    }
}

bitflags! {
    pub struct PingFlags: u8 {
        const ACK = 0x1;
    }
}

bitflags! {
    pub struct ContinuationFlags: u8 {
        const END_HEADERS = 0x4;
    }
}

/// A decoded (but not semantically validated) HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub typ: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("frame length {0} exceeds the negotiated maximum {1}")]
    TooLarge(u32, u32),
}

impl Frame {
    #[must_use]
    pub fn new(typ: FrameType, flags: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            typ,
            flags,
            stream_id: stream_id & STREAM_ID_MASK,
            payload,
        }
    }

    /// Reads the 24-bit length prefix without consuming anything, so a
    /// caller can decide how many more bytes to wait for. Returns `None`
    /// if fewer than 3 bytes are buffered.
    #[must_use]
    pub fn peek_length(buf: &[u8]) -> Option<u32> {
        if buf.len() < 3 {
            return None;
        }
        Some(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]))
    }

    /// Parses exactly one frame from the front of `buf`.
    ///
    /// - `Ok(None)`: fewer than `FRAME_HEADER_LEN + length` bytes are
    ///   available; the buffer is untouched, try again once more bytes
    ///   arrive.
    /// - `Ok(Some((frame, consumed)))`: the frame, and how many bytes of
    ///   `buf` it occupies. The caller advances its own cursor by
    ///   `consumed`; this function never mutates `buf`.
    /// - `Err(_)`: an unknown frame type or an over-budget length — a
    ///   hard failure, not a need-more-data signal. No other validation
    ///   (stream-id legality, per-type length rules, ...) happens here;
    ///   that is the connection layer's job (C4).
    pub fn parse(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        if length > max_frame_size.min(ABSOLUTE_MAX_FRAME_SIZE) {
            return Err(FrameError::TooLarge(length, max_frame_size));
        }
        let raw_type = buf[3];
        let typ = FrameType::from_u8(raw_type).ok_or(FrameError::UnknownType(raw_type))?;
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & STREAM_ID_MASK;

        let total = FRAME_HEADER_LEN + length as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..total]);
        Ok(Some((Frame::new(typ, flags, stream_id, payload), total)))
    }

    /// Encodes this frame's 9-byte header followed by its payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        let len = self.payload.len() as u32;
        out.put_u8((len >> 16) as u8);
        out.put_u8((len >> 8) as u8);
        out.put_u8(len as u8);
        // SAFETY-free: FrameType is repr(u8) so to_u8 never fails.
        out.put_u8(self.typ.to_u8().expect("FrameType is repr(u8)"));
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & STREAM_ID_MASK);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    // ---- convenience constructors -----------------------------------

    #[must_use]
    pub fn headers(stream_id: u32, flags: HeadersFlags, fragment: Bytes) -> Self {
        Self::new(FrameType::Headers, flags.bits(), stream_id, fragment)
    }

    #[must_use]
    pub fn data(stream_id: u32, end_stream: bool, data: Bytes) -> Self {
        let flags = if end_stream {
            DataFlags::END_STREAM.bits()
        } else {
            0
        };
        Self::new(FrameType::Data, flags, stream_id, data)
    }

    #[must_use]
    pub fn continuation(stream_id: u32, end_headers: bool, fragment: Bytes) -> Self {
        let flags = if end_headers {
            ContinuationFlags::END_HEADERS.bits()
        } else {
            0
        };
        Self::new(FrameType::Continuation, flags, stream_id, fragment)
    }

    #[must_use]
    pub fn settings(params: &[(u16, u32)]) -> Self {
        let mut payload = BytesMut::with_capacity(params.len() * 6);
        for (id, value) in params {
            payload.put_u16(*id);
            payload.put_u32(*value);
        }
        Self::new(FrameType::Settings, 0, 0, payload.freeze())
    }

    #[must_use]
    pub fn settings_ack() -> Self {
        Self::new(FrameType::Settings, SettingsFlags::ACK.bits(), 0, Bytes::new())
    }

    /// Decodes a SETTINGS payload into `(identifier, value)` pairs,
    /// silently dropping any identifier this server doesn't recognise —
    /// per RFC 7540 §6.5.2, unknown settings parameters are ignored.
    #[must_use]
    pub fn settings_params(&self) -> Vec<(u16, u32)> {
        self.payload
            .chunks_exact(6)
            .map(|chunk| {
                let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                (id, value)
            })
            .collect()
    }

    #[must_use]
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment & STREAM_ID_MASK);
        Self::new(FrameType::WindowUpdate, 0, stream_id, payload.freeze())
    }

    #[must_use]
    pub fn window_update_increment(&self) -> Option<u32> {
        if self.payload.len() != 4 {
            return None;
        }
        Some(u32::from_be_bytes(self.payload[..4].try_into().ok()?) & STREAM_ID_MASK)
    }

    #[must_use]
    pub fn ping(ack: bool, data: [u8; 8]) -> Self {
        let flags = if ack { PingFlags::ACK.bits() } else { 0 };
        Self::new(FrameType::Ping, flags, 0, Bytes::copy_from_slice(&data))
    }

    #[must_use]
    pub fn goaway(last_stream_id: u32, error: ErrorCode, debug: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(8 + debug.len());
        payload.put_u32(last_stream_id & STREAM_ID_MASK);
        payload.put_u32(error.to_u32().expect("ErrorCode is repr(u32)"));
        payload.extend_from_slice(debug);
        Self::new(FrameType::GoAway, 0, 0, payload.freeze())
    }

    #[must_use]
    pub fn goaway_fields(&self) -> Option<(u32, ErrorCode, Bytes)> {
        if self.payload.len() < 8 {
            return None;
        }
        let mut cursor = &self.payload[..];
        let last_stream_id = cursor.get_u32() & STREAM_ID_MASK;
        let error = ErrorCode::from_wire(cursor.get_u32());
        Some((last_stream_id, error, self.payload.slice(8..)))
    }

    #[must_use]
    pub fn rst_stream(stream_id: u32, error: ErrorCode) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(error.to_u32().expect("ErrorCode is repr(u32)"));
        Self::new(FrameType::RstStream, 0, stream_id, payload.freeze())
    }

    #[must_use]
    pub fn rst_stream_error(&self) -> Option<ErrorCode> {
        if self.payload.len() != 4 {
            return None;
        }
        Some(ErrorCode::from_wire(u32::from_be_bytes(
            self.payload[..4].try_into().ok()?,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_headers_frame() {
        let f = Frame::headers(
            1,
            HeadersFlags::END_STREAM | HeadersFlags::END_HEADERS,
            Bytes::from_static(b"hello"),
        );
        let encoded = f.encode();
        let (parsed, consumed) = Frame::parse(&encoded, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed, f);
    }

    #[test]
    fn round_trip_every_constructor() {
        let frames = vec![
            Frame::data(3, true, Bytes::from_static(b"body")),
            Frame::settings(&[(1, 4096), (4, 65_535)]),
            Frame::settings_ack(),
            Frame::window_update(0, 100),
            Frame::ping(false, *b"12345678"),
            Frame::goaway(9, ErrorCode::ProtocolError, b"bye"),
            Frame::rst_stream(3, ErrorCode::Cancel),
            Frame::continuation(3, true, Bytes::from_static(b"more-headers")),
        ];
        for f in frames {
            let encoded = f.encode();
            let (parsed, consumed) = Frame::parse(&encoded, ABSOLUTE_MAX_FRAME_SIZE)
                .unwrap()
                .unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(parsed, f);
        }
    }

    #[test]
    fn short_buffer_yields_none_and_no_partial_parse() {
        let f = Frame::data(1, true, Bytes::from_static(b"0123456789"));
        let encoded = f.encode();
        assert_eq!(Frame::parse(&encoded[..5], ABSOLUTE_MAX_FRAME_SIZE).unwrap(), None);
        assert_eq!(
            Frame::parse(&encoded[..encoded.len() - 1], ABSOLUTE_MAX_FRAME_SIZE).unwrap(),
            None
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(0);
        bytes.put_u8(0);
        bytes.put_u8(0);
        bytes.put_u8(0xFF); // unknown type
        bytes.put_u8(0);
        bytes.put_u32(0);
        assert_eq!(
            Frame::parse(&bytes, ABSOLUTE_MAX_FRAME_SIZE),
            Err(FrameError::UnknownType(0xFF))
        );
    }

    #[test]
    fn oversized_length_is_rejected() {
        let f = Frame::data(1, false, Bytes::from(vec![0u8; 100]));
        let encoded = f.encode();
        assert_eq!(
            Frame::parse(&encoded, 16),
            Err(FrameError::TooLarge(100, 16))
        );
    }

    #[test]
    fn reserved_high_bit_is_masked() {
        let f = Frame::new(FrameType::Data, 0, 0x8000_0005, Bytes::new());
        assert_eq!(f.stream_id, 5);
        let encoded = f.encode();
        let (parsed, _) = Frame::parse(&encoded, ABSOLUTE_MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(parsed.stream_id, 5);
    }

    #[test]
    fn settings_params_round_trip() {
        let f = Frame::settings(&[(1, 4096), (3, 100)]);
        assert_eq!(f.settings_params(), vec![(1, 4096), (3, 100)]);
    }

    #[test]
    fn goaway_fields_round_trip() {
        let f = Frame::goaway(42, ErrorCode::EnhanceYourCalm, b"slow down");
        let (last, err, debug) = f.goaway_fields().unwrap();
        assert_eq!(last, 42);
        assert_eq!(err, ErrorCode::EnhanceYourCalm);
        assert_eq!(&debug[..], b"slow down");
    }
}
