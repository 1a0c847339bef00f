//! WSCodec (component C12): the RFC 6455 handshake and frame codec.
//!
//! Grounded in two pack examples that both solve this exact problem:
//! `fastwebsockets`' `parse_frame_header` for the overall two-byte-header
//! → extended-length → mask → payload read sequence and its
//! control-frame/fin/length validation order, and `kmet-wtx`'s
//! `ReadFrameInfo::manage_first_two_bytes`/`manage_mask` for the
//! bit-mask constants and the split between "this role must send masked
//! frames" and "this role must reject masked frames" (this crate is
//! server-only, so it always takes the latter branch). The handshake's
//! accept-key derivation follows RFC 6455 §1.3 directly, using the
//! `sha1`/`base64` crates already in the dependency stack for C2/C7.

use crate::error::ConnectionError;
use crate::handler::WsHandler;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_CONTROL_PAYLOAD_LEN: usize = 125;

const FIN_MASK: u8 = 0b1000_0000;
const RSV_MASK: u8 = 0b0111_0000;
const OPCODE_MASK: u8 = 0b0000_1111;
const MASKED_MASK: u8 = 0b1000_0000;
const PAYLOAD_LEN_MASK: u8 = 0b0111_1111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    fn raw(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WsError {
    #[error("reserved bits must be zero")]
    ReservedBitsNonzero,
    #[error("unknown opcode")]
    UnknownOpcode,
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,
    #[error("payload length exceeds configured maximum")]
    PayloadTooLarge,
    #[error("client-to-server frame must be masked")]
    MissingMask,
    #[error("server-to-client frame must not be masked")]
    UnexpectedMask,
    #[error("text frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid handshake request")]
    InvalidHandshake,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Text, payload: payload.into() }
    }

    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Binary, payload: payload.into() }
    }

    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Ping, payload: payload.into() }
    }

    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self { fin: true, opcode: OpCode::Pong, payload: payload.into() }
    }

    /// Builds a close frame, echoing `code` followed by a UTF-8 `reason`
    /// (spec §4.12's close-frame body format).
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self { fin: true, opcode: OpCode::Close, payload: payload.freeze() }
    }

    /// Serializes a server→client frame: never masked, per RFC 6455.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.payload.len() + 10);
        let first_byte = if self.fin { FIN_MASK } else { 0 } | self.opcode.raw();
        out.extend_from_slice(&[first_byte]);
        let len = self.payload.len();
        if len <= 125 {
            out.extend_from_slice(&[len as u8]);
        } else if len <= u16::MAX as usize {
            out.extend_from_slice(&[126]);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.extend_from_slice(&[127]);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}

/// Parses one client→server frame from `buf`, returning the frame and
/// the number of bytes consumed, or `None` if `buf` doesn't yet hold a
/// complete frame. `max_frame_bytes` bounds the payload length (spec
/// §4.12: "negative or > max_frame_bytes -> protocol error").
pub fn parse_frame(buf: &[u8], max_frame_bytes: usize) -> Result<Option<(Frame, usize)>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[0];
    if first & RSV_MASK != 0 {
        return Err(WsError::ReservedBitsNonzero);
    }
    let fin = first & FIN_MASK != 0;
    let opcode = OpCode::from_raw(first & OPCODE_MASK).ok_or(WsError::UnknownOpcode)?;
    if opcode.is_control() && !fin {
        return Err(WsError::FragmentedControlFrame);
    }

    let second = buf[1];
    let masked = second & MASKED_MASK != 0;
    if !masked {
        return Err(WsError::MissingMask);
    }
    let length_code = second & PAYLOAD_LEN_MASK;

    let mut offset = 2;
    let payload_len: usize = match length_code {
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;
            offset += 2;
            len
        }
        127 => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let len = u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap());
            offset += 8;
            usize::try_from(len).map_err(|_| WsError::PayloadTooLarge)?
        }
        n => n as usize,
    };

    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD_LEN {
        return Err(WsError::ControlFrameTooLarge);
    }
    if payload_len > max_frame_bytes {
        return Err(WsError::PayloadTooLarge);
    }

    if buf.len() < offset + 4 {
        return Ok(None);
    }
    let mask: [u8; 4] = buf[offset..offset + 4].try_into().unwrap();
    offset += 4;

    if buf.len() < offset + payload_len {
        return Ok(None);
    }
    let mut payload = BytesMut::from(&buf[offset..offset + payload_len]);
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    offset += payload_len;

    if opcode == OpCode::Text && std::str::from_utf8(&payload).is_err() {
        return Err(WsError::InvalidUtf8);
    }

    Ok(Some((Frame { fin, opcode, payload: payload.freeze() }, offset)))
}

/// Strips a leading complete frame from `buf` once `parse_frame` has
/// located one, mirroring the advance-after-parse shape `h2::frame`
/// uses for TCP-framed input.
pub fn advance(buf: &mut BytesMut, consumed: usize) {
    buf.advance(consumed);
}

/// Validates an upgrade request's headers (spec §4.12) and computes the
/// `Sec-WebSocket-Accept` response value.
pub fn accept_key(headers: &HashMap<String, String>) -> Result<String, WsError> {
    let upgrade = header(headers, "upgrade").ok_or(WsError::InvalidHandshake)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(WsError::InvalidHandshake);
    }
    let connection = header(headers, "connection").ok_or(WsError::InvalidHandshake)?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(WsError::InvalidHandshake);
    }
    let version = header(headers, "sec-websocket-version").ok_or(WsError::InvalidHandshake)?;
    if version.trim() != "13" {
        return Err(WsError::InvalidHandshake);
    }
    let key = header(headers, "sec-websocket-key").ok_or(WsError::InvalidHandshake)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key.trim())
        .map_err(|_| WsError::InvalidHandshake)?;
    if decoded.len() != 16 {
        return Err(WsError::InvalidHandshake);
    }
    Ok(derive_accept_value(key.trim()))
}

fn derive_accept_value(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Standard close-status codes spec §4.12 calls out by number.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const EXTENSION_REQUIRED: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
}

impl WsError {
    /// The close code a server sends back when it tears down the
    /// connection in response to this validation failure (RFC 6455
    /// §7.4.1's status codes, picked per error).
    #[must_use]
    fn close_code(self) -> u16 {
        match self {
            WsError::ReservedBitsNonzero
            | WsError::UnknownOpcode
            | WsError::FragmentedControlFrame
            | WsError::ControlFrameTooLarge
            | WsError::MissingMask
            | WsError::UnexpectedMask => close_code::PROTOCOL_ERROR,
            WsError::PayloadTooLarge => close_code::MESSAGE_TOO_BIG,
            WsError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            WsError::InvalidHandshake => close_code::PROTOCOL_ERROR,
        }
    }
}

/// Drives one accepted WebSocket connection to completion: reads frames
/// off `io`, dispatches them to `handler`'s callbacks, and answers pings
/// and close handshakes itself. Runs until the peer closes the
/// connection, sends an invalid frame, or the socket errors.
///
/// Grounded in `router::run_http1`'s own read-loop shape (accumulate into
/// a `BytesMut`, try to parse, read more on `Ok(None)`), generalized from
/// HTTP/1.x request framing to RFC 6455 frame framing.
pub async fn drive_connection<IO>(
    mut io: IO,
    handler: WsHandler,
    connection_id: u64,
    max_frame_bytes: usize,
) -> Result<(), ConnectionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(on_open) = &handler.on_open {
        on_open(connection_id);
    }

    let mut buf = BytesMut::with_capacity(4 * 1024);
    let mut chunk = [0u8; 4 * 1024];
    let mut close_reason: Option<(u16, String)> = None;
    let mut error_reason: Option<String> = None;

    'connection: loop {
        loop {
            match parse_frame(&buf, max_frame_bytes) {
                Ok(Some((frame, consumed))) => {
                    advance(&mut buf, consumed);
                    match frame.opcode {
                        OpCode::Text => {
                            // Already UTF-8 validated by `parse_frame`.
                            let text = String::from_utf8_lossy(&frame.payload).into_owned();
                            if let Some(on_text) = &handler.on_text {
                                on_text(connection_id, text).await;
                            }
                        }
                        OpCode::Binary => {
                            if let Some(on_binary) = &handler.on_binary {
                                on_binary(connection_id, frame.payload).await;
                            }
                        }
                        OpCode::Ping => {
                            io.write_all(&Frame::pong(frame.payload).encode())
                                .await
                                .map_err(ConnectionError::Io)?;
                        }
                        OpCode::Pong => {}
                        OpCode::Close => {
                            let (code, reason) = decode_close_payload(&frame.payload);
                            io.write_all(&Frame::close(code, &reason).encode())
                                .await
                                .map_err(ConnectionError::Io)?;
                            close_reason = Some((code, reason));
                            break 'connection;
                        }
                        OpCode::Continuation => {
                            trace!("ws: conn={connection_id} dropped bare continuation frame");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("ws: conn={connection_id} frame validation failed: {err}");
                    let _ = io.write_all(&Frame::close(err.close_code(), "").encode()).await;
                    error_reason = Some(err.to_string());
                    break 'connection;
                }
            }
        }

        let n = match io.read(&mut chunk).await {
            Ok(n) => n,
            Err(err) => {
                error_reason = Some(err.to_string());
                break 'connection;
            }
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    if let Some(message) = error_reason {
        if let Some(on_error) = &handler.on_error {
            on_error(connection_id, message);
        }
    } else if let Some(on_close) = &handler.on_close {
        on_close(connection_id, close_reason);
    }
    Ok(())
}

/// Parses a close frame's optional `{code: u16}{reason utf8}` body (spec
/// §4.12), falling back to a code-less close when the peer sent an empty
/// payload and to a lossy reason when the trailing bytes aren't UTF-8.
fn decode_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (close_code::NORMAL, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mask_payload(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect()
    }

    #[test]
    fn parses_a_masked_text_frame() {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let masked = mask_payload(b"hi", mask);
        let mut buf = vec![0x81, 0x80 | 2];
        buf.extend_from_slice(&mask);
        buf.extend_from_slice(&masked);
        let (frame, consumed) = parse_frame(&buf, 1 << 20).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"hi");
    }

    #[test]
    fn unmasked_client_frame_is_a_protocol_error() {
        let buf = vec![0x81, 2, b'h', b'i'];
        assert_eq!(parse_frame(&buf, 1 << 20), Err(WsError::MissingMask));
    }

    #[test]
    fn nonzero_reserved_bits_are_rejected() {
        let buf = vec![0xF1, 0x80, 0, 0, 0, 0];
        assert_eq!(parse_frame(&buf, 1 << 20), Err(WsError::ReservedBitsNonzero));
    }

    #[test]
    fn fragmented_control_frame_is_rejected() {
        // FIN=0, opcode=Ping(0x9)
        let buf = vec![0x09, 0x80, 0, 0, 0, 0];
        assert_eq!(parse_frame(&buf, 1 << 20), Err(WsError::FragmentedControlFrame));
    }

    #[test]
    fn oversized_control_frame_is_rejected() {
        let mask = [0u8; 4];
        let mut buf = vec![0x89, 0x80 | 126];
        buf.extend_from_slice(&200u16.to_be_bytes());
        buf.extend_from_slice(&mask);
        buf.extend_from_slice(&vec![0u8; 200]);
        assert_eq!(parse_frame(&buf, 1 << 20), Err(WsError::ControlFrameTooLarge));
    }

    #[test]
    fn incomplete_frame_returns_none_not_error() {
        let buf = vec![0x81, 0x80 | 5, 1, 2];
        assert_eq!(parse_frame(&buf, 1 << 20), Ok(None));
    }

    #[test]
    fn accept_key_matches_rfc6455_worked_example() {
        let mut headers = HashMap::new();
        headers.insert("Upgrade".to_string(), "websocket".to_string());
        headers.insert("Connection".to_string(), "Upgrade".to_string());
        headers.insert("Sec-WebSocket-Version".to_string(), "13".to_string());
        headers.insert(
            "Sec-WebSocket-Key".to_string(),
            "dGhlIHNhbXBsZSBub25jZQ==".to_string(),
        );
        let accept = accept_key(&headers).unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn close_frame_encodes_code_and_reason() {
        let frame = Frame::close(close_code::NORMAL, "bye");
        let encoded = frame.encode();
        // header byte, length byte, 2-byte code, "bye"
        assert_eq!(&encoded[2..4], &1000u16.to_be_bytes());
        assert_eq!(&encoded[4..], b"bye");
    }

    fn masked_text_frame(text: &str) -> Vec<u8> {
        let mask = [0xde, 0xad, 0xbe, 0xef];
        let masked = mask_payload(text.as_bytes(), mask);
        let mut out = vec![0x81, 0x80 | text.len() as u8];
        out.extend_from_slice(&mask);
        out.extend_from_slice(&masked);
        out
    }

    fn masked_close_frame(code: u16, reason: &str) -> Vec<u8> {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        let mask = [1, 2, 3, 4];
        let masked = mask_payload(&payload, mask);
        let mut out = vec![0x88, 0x80 | payload.len() as u8];
        out.extend_from_slice(&mask);
        out.extend_from_slice(&masked);
        out
    }

    #[tokio::test]
    async fn drive_connection_calls_on_open_on_text_and_on_close() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Mutex;

        let (mut client, server) = tokio::io::duplex(4096);
        let opened = Arc::new(AtomicBool::new(false));
        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let closed: Arc<Mutex<Option<Option<(u16, String)>>>> = Arc::new(Mutex::new(None));

        let opened2 = opened.clone();
        let received2 = received.clone();
        let closed2 = closed.clone();
        let handler = WsHandler {
            on_open: Some(Arc::new(move |_id| opened2.store(true, Ordering::SeqCst))),
            on_text: Some(Arc::new(move |_id, text| {
                let received = received2.clone();
                Box::pin(async move {
                    received.lock().unwrap().push(text);
                })
            })),
            on_binary: None,
            on_close: Some(Arc::new(move |_id, reason| {
                *closed2.lock().unwrap() = Some(reason);
            })),
            on_error: None,
        };

        let drive = tokio::spawn(drive_connection(server, handler, 1, 1 << 20));

        client.write_all(&masked_text_frame("hi")).await.unwrap();
        client.write_all(&masked_close_frame(close_code::NORMAL, "bye")).await.unwrap();

        drive.await.unwrap().unwrap();

        assert!(opened.load(Ordering::SeqCst));
        assert_eq!(&received.lock().unwrap()[..], &["hi".to_string()]);
        assert_eq!(
            closed.lock().unwrap().clone(),
            Some(Some((close_code::NORMAL, "bye".to_string())))
        );
    }

    #[tokio::test]
    async fn drive_connection_calls_on_error_for_invalid_frame() {
        use std::sync::Mutex;

        let (mut client, server) = tokio::io::duplex(4096);
        let error_message: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let error_message2 = error_message.clone();
        let handler = WsHandler {
            on_error: Some(Arc::new(move |_id, message| {
                *error_message2.lock().unwrap() = Some(message);
            })),
            ..WsHandler::default()
        };

        let drive = tokio::spawn(drive_connection(server, handler, 1, 1 << 20));
        // Unmasked client->server frame: a protocol error.
        client.write_all(&[0x81, 2, b'h', b'i']).await.unwrap();
        drop(client);

        drive.await.unwrap().unwrap();
        assert!(error_message.lock().unwrap().is_some());
    }
}
