//! H2Connection (component C4): settings negotiation, GOAWAY, and the
//! multiplexer tying the frame codec (C1), HPACK (C2) and StreamTable
//! (C3) together.
//!
//! The teacher's `connection.rs` split a connection into two OS threads
//! — one driving an outbound request channel, one driving an inbound
//! frame-dispatch loop — coordinating through a shared `Socket` mutex and
//! a condvar-guarded ready flag. The shape survives the trip from client
//! to server: a dedicated writer task drains an outbound channel while
//! this task owns the inbound read-and-dispatch loop, except now the
//! "outbound channel" carries encoded frame bytes for *responses* rather
//! than the teacher's own outbound *requests*, and the synchronization
//! primitive is a Tokio mpsc channel instead of a condvar, matching the
//! ambient async runtime (spec §5).

use crate::error::{ConnectionError, StreamError};
use crate::h2::frame::{
    ContinuationFlags, DataFlags, ErrorCode, Frame, FrameError, FrameType, HeadersFlags,
    PingFlags, SettingsFlags, ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE,
};
use crate::h2::hpack;
use crate::h2::stream::{StreamTable, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::handler::BoxFuture;
use crate::metrics::Metrics;
use crate::types::{HttpVersion, Request, Response};
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub const CLIENT_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Submits a fully-reassembled HTTP request for handler execution and
/// returns its response. Implemented by `server.rs` as an adapter over
/// the C10 scheduler, so the connection task never spawns per-request
/// work itself — it only awaits pending dispatches concurrently.
pub trait RequestDispatcher: Send + Sync {
    fn dispatch(&self, request: Request) -> BoxFuture<'static, Response>;
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    header_table_size: u32,
    max_concurrent_streams: u32,
    initial_window_size: u32,
    max_frame_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            max_concurrent_streams: 100,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE as u32,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

struct PendingHeaderBlock {
    stream_id: u32,
    fragment: BytesMut,
    end_stream: bool,
}

/// `handle_frame`'s error channel: a connection-fatal error tears the
/// whole connection down with a GOAWAY (spec §7 class ii); a stream error
/// (spec §7 class iii) only resets the one offending stream, identified
/// here so `drain_frames` can send `RST_STREAM` on the right id without
/// the frame handlers needing to touch the socket themselves.
enum FrameHandlingError {
    Connection(ConnectionError),
    Stream(u32, StreamError),
}

impl From<ConnectionError> for FrameHandlingError {
    fn from(err: ConnectionError) -> Self {
        FrameHandlingError::Connection(err)
    }
}

/// Stream-id-ordering violations surfaced by `StreamTable::open` are
/// connection-scoped (RFC 7540 §5.1.1): the high-water mark they protect
/// is connection-wide state, not this one stream's.
fn open_err(err: StreamError) -> FrameHandlingError {
    FrameHandlingError::Connection(stream_err_to_conn(err))
}

struct PendingDispatch {
    stream_id: u32,
    future: BoxFuture<'static, Response>,
}

impl std::future::Future for PendingDispatch {
    type Output = (u32, Response);

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.future.as_mut().poll(cx).map(|resp| (self.stream_id, resp))
    }
}

pub struct H2Connection {
    conn_id: u64,
    streams: StreamTable,
    encoder: Arc<AsyncMutex<hpack::Encoder>>,
    decoder: hpack::Decoder,
    local_settings: Settings,
    peer_settings: Settings,
    conn_sender_window: i64,
    conn_receiver_window: i64,
    peer_last_stream_id: u32,
    goaway_sent: bool,
    pending_header_block: Option<PendingHeaderBlock>,
    dispatcher: Arc<dyn RequestDispatcher>,
    metrics: Arc<Metrics>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// Drains the outbound channel onto the socket's write half. This is the
/// one task an `H2Connection` spawns (mirroring the teacher's own
/// request-sender/response-receiver thread split); per-stream handler
/// work is awaited cooperatively in-line via `FuturesUnordered`, never
/// spawned.
async fn writer_loop<W>(mut write_half: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = write_half.write_all(&bytes).await {
            warn!("h2 writer: {err}");
            return;
        }
    }
}

impl H2Connection {
    /// Runs one HTTP/2 connection to completion: preface, settings
    /// exchange, then the inbound frame loop until a connection error,
    /// a peer GOAWAY, or clean EOF.
    pub async fn run<IO>(
        io: IO,
        dispatcher: Arc<dyn RequestDispatcher>,
        conn_id: u64,
        metrics: Arc<Metrics>,
    ) -> Result<(), ConnectionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(write_half, outbound_rx));

        let mut preface = [0u8; 24];
        read_half
            .read_exact(&mut preface)
            .await
            .map_err(ConnectionError::Io)?;

        let mut conn = Self {
            conn_id,
            streams: StreamTable::new(),
            encoder: Arc::new(AsyncMutex::new(hpack::Encoder::default())),
            decoder: hpack::Decoder::default(),
            local_settings: Settings::default(),
            peer_settings: Settings::default(),
            conn_sender_window: DEFAULT_INITIAL_WINDOW_SIZE,
            conn_receiver_window: DEFAULT_INITIAL_WINDOW_SIZE,
            peer_last_stream_id: 0,
            goaway_sent: false,
            pending_header_block: None,
            dispatcher,
            metrics,
            outbound: outbound_tx,
        };

        if &preface != CLIENT_PREFACE {
            conn.goaway(ErrorCode::ProtocolError, b"missing client preface");
            return Err(ConnectionError::Protocol("missing client preface"));
        }

        conn.send_frame(Frame::settings(&[
            (3, conn.local_settings.max_concurrent_streams),
            (4, conn.local_settings.initial_window_size),
        ]));

        trace!("conn={} h2 preface accepted, settings sent", conn.conn_id);
        conn.read_loop(read_half).await
    }

    fn send_frame(&self, frame: Frame) {
        let _ = self.outbound.send(frame.encode());
    }

    async fn read_loop<R>(&mut self, mut read_half: R) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let mut pending: FuturesUnordered<PendingDispatch> = FuturesUnordered::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            tokio::select! {
                biased;
                Some((stream_id, response)) = pending.next(), if !pending.is_empty() => {
                    self.write_response(stream_id, response).await?;
                }
                read_result = read_half.read(&mut chunk) => {
                    let n = read_result.map_err(ConnectionError::Io)?;
                    if n == 0 {
                        return Ok(());
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    self.drain_frames(&mut buf, &mut pending).await?;
                }
            }
        }
    }

    async fn drain_frames(
        &mut self,
        buf: &mut BytesMut,
        pending: &mut FuturesUnordered<PendingDispatch>,
    ) -> Result<(), ConnectionError> {
        loop {
            match Frame::parse(buf, self.local_settings.max_frame_size) {
                Ok(Some((frame, consumed))) => {
                    buf.advance(consumed);
                    match self.handle_frame(frame).await {
                        Ok(Some(dispatch)) => pending.push(dispatch),
                        Ok(None) => {}
                        Err(FrameHandlingError::Stream(stream_id, err)) => {
                            debug!("conn={} stream={stream_id} reset: {err}", self.conn_id);
                            if let Some(stream) = self.streams.get(stream_id) {
                                stream.lock().reset();
                            }
                            self.send_frame(Frame::rst_stream(stream_id, err.to_h2_error_code()));
                            self.streams.reap_closed();
                        }
                        Err(FrameHandlingError::Connection(err)) => {
                            self.goaway_for_error(&err);
                            return Err(err);
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(FrameError::TooLarge(len, max)) => {
                    warn!("conn={} frame length {len} exceeds max {max}", self.conn_id);
                    self.goaway(ErrorCode::FrameSizeError, b"frame too large");
                    return Err(ConnectionError::Protocol("frame length exceeds negotiated maximum"));
                }
                Err(FrameError::UnknownType(_)) => {
                    // RFC 7540 §4.1: unknown frame types are ignored, not fatal.
                    buf.advance(9.min(buf.len()));
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<PendingDispatch>, FrameHandlingError> {
        use FrameType::*;
        // Spec §4.4 item 3: a HEADERS block without END_HEADERS must be
        // immediately followed by CONTINUATION frames on the same stream
        // and nothing else may interleave.
        if let Some(pending) = &self.pending_header_block {
            if frame.typ != Continuation || frame.stream_id != pending.stream_id {
                return Err(ConnectionError::Protocol(
                    "frame interleaved with an unterminated HEADERS block",
                )
                .into());
            }
        }
        let control_frame = matches!(frame.typ, Settings | Ping | GoAway);
        if control_frame && frame.stream_id != 0 {
            return Err(ConnectionError::Protocol("control frame on non-zero stream").into());
        }
        if !control_frame && frame.typ != WindowUpdate && frame.stream_id == 0 {
            return Err(ConnectionError::Protocol("stream frame on stream 0").into());
        }

        match frame.typ {
            Data => self.on_data(frame).map(|()| None),
            Headers => self.on_headers(frame).await,
            Priority => self.on_priority(frame).map_err(FrameHandlingError::from).map(|()| None),
            RstStream => self.on_rst_stream(frame).map_err(FrameHandlingError::from).map(|()| None),
            Settings => self.on_settings(frame).map_err(FrameHandlingError::from).map(|()| None),
            PushPromise => {
                Err(ConnectionError::Protocol("server does not accept PUSH_PROMISE").into())
            }
            Ping => self.on_ping(frame).map_err(FrameHandlingError::from).map(|()| None),
            GoAway => self.on_goaway(frame).map_err(FrameHandlingError::from).map(|()| None),
            WindowUpdate => self.on_window_update(frame).map(|()| None),
            Continuation => self.on_continuation(frame).await,
        }
    }

    fn on_settings(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if frame.payload.len() % 6 != 0 {
            return Err(ConnectionError::Protocol("SETTINGS length not a multiple of 6"));
        }
        if frame.flags & SettingsFlags::ACK.bits() != 0 {
            return Ok(());
        }
        let previous_initial_window = self.peer_settings.initial_window_size;
        for (id, value) in frame.settings_params() {
            match id {
                1 => self.peer_settings.header_table_size = value,
                3 => self.peer_settings.max_concurrent_streams = value,
                4 => {
                    if value > crate::h2::stream::MAX_WINDOW_SIZE as u32 {
                        return Err(ConnectionError::Protocol("initial window size out of range"));
                    }
                    self.peer_settings.initial_window_size = value;
                }
                5 => {
                    if !(16_384..=ABSOLUTE_MAX_FRAME_SIZE).contains(&value) {
                        return Err(ConnectionError::Protocol("max frame size out of range"));
                    }
                    self.peer_settings.max_frame_size = value;
                }
                _ => {} // unknown identifiers are ignored, RFC 7540 §6.5.2
            }
        }
        if self.peer_settings.initial_window_size != previous_initial_window {
            self.streams
                .set_initial_window_size(i64::from(self.peer_settings.initial_window_size));
        }
        self.send_frame(Frame::settings_ack());
        Ok(())
    }

    fn on_ping(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if frame.payload.len() != 8 {
            return Err(ConnectionError::Protocol("PING payload must be 8 bytes"));
        }
        if frame.flags & PingFlags::ACK.bits() != 0 {
            return Ok(());
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.payload);
        self.send_frame(Frame::ping(true, data));
        Ok(())
    }

    fn on_goaway(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if let Some((last, error, _debug)) = frame.goaway_fields() {
            debug!("conn={} peer GOAWAY last_stream={last} error={error:?}", self.conn_id);
        }
        Err(ConnectionError::PeerGoneAway)
    }

    fn on_window_update(&mut self, frame: Frame) -> Result<(), FrameHandlingError> {
        if frame.payload.len() != 4 {
            return Err(ConnectionError::Protocol("WINDOW_UPDATE payload must be 4 bytes").into());
        }
        let increment = frame
            .window_update_increment()
            .ok_or(ConnectionError::Protocol("malformed WINDOW_UPDATE"))?;
        if frame.stream_id == 0 {
            if increment != 0 {
                self.conn_sender_window = self
                    .conn_sender_window
                    .checked_add(i64::from(increment))
                    .ok_or(ConnectionError::Protocol("connection window overflow"))?;
            }
            return Ok(());
        }
        if let Some(stream) = self.streams.get(frame.stream_id) {
            // A stream window overflowing RFC 7540's max is a stream-level
            // FLOW_CONTROL_ERROR (§6.9.1): only this stream resets.
            stream
                .lock()
                .apply_window_update(increment)
                .map_err(|e| FrameHandlingError::Stream(frame.stream_id, e))?;
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if frame.payload.len() != 4 {
            return Err(ConnectionError::Protocol("RST_STREAM payload must be 4 bytes"));
        }
        if let Some(stream) = self.streams.get(frame.stream_id) {
            stream.lock().reset();
        }
        Ok(())
    }

    fn on_priority(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if frame.payload.len() != 5 {
            return Err(ConnectionError::Protocol("PRIORITY payload must be 5 bytes"));
        }
        let stream = self.streams.open(frame.stream_id).map_err(stream_err_to_conn)?;
        let dependency = u32::from_be_bytes(frame.payload[..4].try_into().unwrap()) & 0x7FFF_FFFF;
        let weight = frame.payload[4];
        let mut s = stream.lock();
        s.dependency = Some(dependency);
        s.priority = weight;
        Ok(())
    }

    fn on_data(&mut self, frame: Frame) -> Result<(), FrameHandlingError> {
        let end_stream = frame.flags & DataFlags::END_STREAM.bits() != 0;
        let payload = strip_padding(&frame, DataFlags::PADDED.bits())?;
        let n = payload.len() as i64;
        self.conn_receiver_window = self
            .conn_receiver_window
            .checked_sub(n)
            .ok_or(ConnectionError::Protocol("connection receive window exceeded"))?;
        let stream = self
            .streams
            .get(frame.stream_id)
            .ok_or(ConnectionError::Protocol("DATA on unknown stream"))?;
        let mut s = stream.lock();
        // Exceeding this stream's own receive window, or DATA arriving
        // after END_STREAM on an already-closed stream, are stream-scoped
        // (spec §7 class iii / RFC 7540 §6.9, §5.1): only this stream resets.
        s.apply_data_received(n)
            .map_err(|e| FrameHandlingError::Stream(frame.stream_id, e))?;
        s.received_data.extend_from_slice(&payload);
        if end_stream {
            s.on_end_stream(false)
                .map_err(|e| FrameHandlingError::Stream(frame.stream_id, e))?;
        }
        Ok(())
    }

    async fn on_headers(&mut self, frame: Frame) -> Result<Option<PendingDispatch>, FrameHandlingError> {
        let end_stream = frame.flags & HeadersFlags::END_STREAM.bits() != 0;
        let end_headers = frame.flags & HeadersFlags::END_HEADERS.bits() != 0;
        let mut payload = strip_padding(&frame, HeadersFlags::PADDED.bits())?;
        if frame.flags & HeadersFlags::PRIORITY.bits() != 0 {
            if payload.len() < 5 {
                return Err(ConnectionError::Protocol("HEADERS priority fields truncated").into());
            }
            payload = payload.slice(5..);
        }

        // A reused/out-of-order stream id is connection-scoped (RFC 7540
        // §5.1.1): the high-water mark it violates is connection-wide.
        self.streams.open(frame.stream_id).map_err(open_err)?;

        if end_headers {
            self.finish_header_block(frame.stream_id, payload, end_stream).await
        } else {
            self.pending_header_block = Some(PendingHeaderBlock {
                stream_id: frame.stream_id,
                fragment: BytesMut::from(&payload[..]),
                end_stream,
            });
            Ok(None)
        }
    }

    async fn on_continuation(&mut self, frame: Frame) -> Result<Option<PendingDispatch>, FrameHandlingError> {
        let end_headers = frame.flags & ContinuationFlags::END_HEADERS.bits() != 0;
        let pending = self
            .pending_header_block
            .as_mut()
            .ok_or(ConnectionError::Protocol("CONTINUATION with no pending HEADERS"))?;
        if pending.stream_id != frame.stream_id {
            return Err(ConnectionError::Protocol("CONTINUATION stream id mismatch").into());
        }
        pending.fragment.extend_from_slice(&frame.payload);
        if !end_headers {
            return Ok(None);
        }
        let PendingHeaderBlock { stream_id, fragment, end_stream } =
            self.pending_header_block.take().unwrap();
        self.finish_header_block(stream_id, fragment.freeze(), end_stream).await
    }

    async fn finish_header_block(
        &mut self,
        stream_id: u32,
        fragment: Bytes,
        end_stream: bool,
    ) -> Result<Option<PendingDispatch>, FrameHandlingError> {
        let decoded = self
            .decoder
            .decode(&fragment)
            .map_err(ConnectionError::from)?;
        // Record the high-water mark of processed client streams so
        // `goaway()` can report the last one actually handled (spec §4.4
        // item 4) instead of always advertising 0.
        if stream_id % 2 == 1 && stream_id > self.peer_last_stream_id {
            self.peer_last_stream_id = stream_id;
        }
        let (method, path, header_map) = split_pseudo_headers(decoded)?;
        let stream = self
            .streams
            .get(stream_id)
            .ok_or(ConnectionError::Protocol("HEADERS on unknown stream"))?;
        {
            let mut s = stream.lock();
            // A HEADERS frame landing on a stream already past IDLE (e.g.
            // a second, non-trailer HEADERS) or already CLOSED is a
            // stream-scoped violation (RFC 7540 §5.1): reset only this
            // stream, the connection keeps running.
            s.on_headers(end_stream, false)
                .map_err(|e| FrameHandlingError::Stream(stream_id, e))?;
            s.request_headers = header_map
                .iter()
                .map(|(k, v)| (Bytes::from(k.clone()), Bytes::from(v.clone())))
                .collect();
        }

        if !end_stream {
            return Ok(None);
        }

        let request = {
            let s = stream.lock();
            Request {
                method,
                path,
                version: HttpVersion::Http2,
                headers: header_map,
                body: Bytes::copy_from_slice(&s.received_data),
                peer_addr: None,
            }
        };
        let future = self.dispatcher.dispatch(request);
        Ok(Some(PendingDispatch { stream_id, future }))
    }

    async fn write_response(&mut self, stream_id: u32, response: Response) -> Result<(), ConnectionError> {
        let status = response.status.to_string();
        let mut header_fields: Vec<(Bytes, Bytes)> = vec![(Bytes::from_static(b":status"), Bytes::from(status))];
        for (name, value) in &response.headers {
            header_fields.push((Bytes::from(name.clone().to_lowercase()), Bytes::from(value.clone())));
        }
        let end_stream_on_headers = response.body.is_empty();
        let encoded = {
            let mut encoder = self.encoder.lock().await;
            encoder.encode(header_fields)
        };
        let headers_flags = if end_stream_on_headers {
            HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM
        } else {
            HeadersFlags::END_HEADERS
        };
        self.send_frame(Frame::headers(stream_id, headers_flags, encoded));
        if !end_stream_on_headers {
            self.write_data(stream_id, response.body)?;
        }
        if let Some(stream) = self.streams.get(stream_id) {
            let mut s = stream.lock();
            let _ = s.on_end_stream(true);
        }
        self.streams.reap_closed();
        Ok(())
    }

    /// Splits `body` into DATA frames no larger than the peer's
    /// negotiated `SETTINGS_MAX_FRAME_SIZE`, decrementing both the
    /// connection and stream sender windows as each chunk goes out (spec
    /// §4.4's flow-control arithmetic).
    ///
    /// This task only ever sends a response once its handler has already
    /// produced the full body, so there is no producer to pause mid-response
    /// the way a streaming handler would need; if the peer's advertised
    /// window is smaller than the body, chunks still go out and the
    /// window is allowed to run negative rather than stalling this task
    /// waiting on a WINDOW_UPDATE it alone would otherwise be responsible
    /// for reading (see DESIGN.md).
    fn write_data(&mut self, stream_id: u32, body: Bytes) -> Result<(), ConnectionError> {
        let frame_size = self.peer_settings.max_frame_size.max(1) as usize;
        let mut offset = 0usize;
        while offset < body.len() {
            let end = body.len().min(offset + frame_size);
            let chunk = body.slice(offset..end);
            let chunk_len = chunk.len() as i64;
            self.conn_sender_window -= chunk_len;
            if let Some(stream) = self.streams.get(stream_id) {
                let mut s = stream.lock();
                let _ = s.apply_data_sent(chunk_len);
            }
            offset = end;
            let is_last = offset == body.len();
            self.send_frame(Frame::data(stream_id, is_last, chunk));
        }
        Ok(())
    }

    fn goaway(&mut self, error: ErrorCode, debug: &[u8]) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        self.send_frame(Frame::goaway(self.peer_last_stream_id, error, debug));
    }

    /// Spec §4.4 item 5: every connection-fatal error gets a GOAWAY
    /// before the transport closes. `PeerGoneAway` and transport I/O
    /// failures are the exceptions — there's no peer left to notify.
    fn goaway_for_error(&mut self, err: &ConnectionError) {
        let code = match err {
            ConnectionError::PeerGoneAway | ConnectionError::Io(_) => return,
            ConnectionError::Hpack(_) => ErrorCode::CompressionError,
            _ => ErrorCode::ProtocolError,
        };
        let debug = err.to_string();
        self.goaway(code, debug.as_bytes());
    }
}

fn stream_err_to_conn(err: StreamError) -> ConnectionError {
    match err {
        StreamError::Protocol => ConnectionError::Protocol("stream protocol error"),
        StreamError::FlowControl => ConnectionError::Protocol("stream flow-control error"),
        StreamError::Closed => ConnectionError::Protocol("frame on closed stream"),
        StreamError::Cancel | StreamError::Internal => ConnectionError::Protocol("stream error"),
    }
}

fn strip_padding(frame: &Frame, padded_flag: u8) -> Result<Bytes, ConnectionError> {
    if frame.flags & padded_flag == 0 {
        return Ok(frame.payload.clone());
    }
    let pad_len = *frame
        .payload
        .first()
        .ok_or(ConnectionError::Protocol("PADDED frame missing pad length byte"))? as usize;
    let body_end = frame
        .payload
        .len()
        .checked_sub(1 + pad_len)
        .ok_or(ConnectionError::Protocol("pad length exceeds frame payload"))?;
    Ok(frame.payload.slice(1..1 + body_end))
}

fn split_pseudo_headers(
    decoded: Vec<(Bytes, Bytes)>,
) -> Result<(String, String, HashMap<String, String>), ConnectionError> {
    let mut method = None;
    let mut path = None;
    let mut rest = HashMap::new();
    for (k, v) in decoded {
        let key = String::from_utf8_lossy(&k).into_owned();
        let value = String::from_utf8_lossy(&v).into_owned();
        match key.as_str() {
            ":method" => method = Some(value),
            ":path" => path = Some(value),
            _ => {
                rest.insert(key, value);
            }
        }
    }
    let method = method.ok_or(ConnectionError::Protocol("missing :method pseudo-header"))?;
    let path = path.ok_or(ConnectionError::Protocol("missing :path pseudo-header"))?;
    Ok((method, path, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_padding_removes_length_byte_and_trailer() {
        let frame = Frame::new(
            FrameType::Data,
            DataFlags::PADDED.bits(),
            1,
            Bytes::from_static(&[3, b'h', b'i', 0, 0, 0]),
        );
        let stripped = strip_padding(&frame, DataFlags::PADDED.bits()).unwrap();
        assert_eq!(&stripped[..], b"hi");
    }

    #[test]
    fn split_pseudo_headers_extracts_method_and_path() {
        let decoded = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/x")),
            (Bytes::from_static(b"x-a"), Bytes::from_static(b"1")),
        ];
        let (method, path, rest) = split_pseudo_headers(decoded).unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/x");
        assert_eq!(rest.get("x-a").unwrap(), "1");
    }

    struct NullDispatcher;
    impl RequestDispatcher for NullDispatcher {
        fn dispatch(&self, _request: Request) -> BoxFuture<'static, Response> {
            Box::pin(async { Response::text(200, "") })
        }
    }

    fn test_connection() -> (H2Connection, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = H2Connection {
            conn_id: 1,
            streams: StreamTable::new(),
            encoder: Arc::new(AsyncMutex::new(hpack::Encoder::default())),
            decoder: hpack::Decoder::default(),
            local_settings: Settings::default(),
            peer_settings: Settings::default(),
            conn_sender_window: DEFAULT_INITIAL_WINDOW_SIZE,
            conn_receiver_window: DEFAULT_INITIAL_WINDOW_SIZE,
            peer_last_stream_id: 0,
            goaway_sent: false,
            pending_header_block: None,
            dispatcher: Arc::new(NullDispatcher),
            metrics: Metrics::new(),
            outbound: outbound_tx,
        };
        (conn, outbound_rx)
    }

    #[tokio::test]
    async fn connection_error_sends_goaway_before_propagating() {
        let (mut conn, mut outbound_rx) = test_connection();
        // WINDOW_UPDATE must carry a 4-byte payload; this one is short.
        let frame = Frame::new(FrameType::WindowUpdate, 0, 0, Bytes::from_static(&[0, 0, 0]));
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let mut pending = FuturesUnordered::new();

        let result = conn.drain_frames(&mut buf, &mut pending).await;

        assert!(matches!(result, Err(ConnectionError::Protocol(_))));
        let sent = outbound_rx.try_recv().expect("expected a GOAWAY frame on the wire");
        let (goaway_frame, _) = Frame::parse(&sent, ABSOLUTE_MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(goaway_frame.typ, FrameType::GoAway);
    }

    #[test]
    fn write_data_chunks_by_peer_max_frame_size_and_decrements_windows() {
        let (mut conn, mut outbound_rx) = test_connection();
        conn.peer_settings.max_frame_size = 16;
        conn.streams.open(1).unwrap();
        let before_conn_window = conn.conn_sender_window;

        conn.write_data(1, Bytes::from_static(&[b'x'; 40])).unwrap();

        let mut total = 0usize;
        let mut frames = 0usize;
        while let Ok(bytes) = outbound_rx.try_recv() {
            let (frame, _) = Frame::parse(&bytes, ABSOLUTE_MAX_FRAME_SIZE).unwrap().unwrap();
            assert!(frame.payload.len() <= 16);
            total += frame.payload.len();
            frames += 1;
        }
        assert_eq!(total, 40);
        assert!(frames >= 3, "expected multiple chunks, got {frames}");
        assert_eq!(conn.conn_sender_window, before_conn_window - 40);
        let stream_window = conn.streams.get(1).unwrap().lock().sender_window;
        assert_eq!(stream_window, DEFAULT_INITIAL_WINDOW_SIZE - 40);
    }

    #[tokio::test]
    async fn stream_scoped_violation_sends_rst_stream_and_keeps_connection_alive() {
        let (mut conn, mut outbound_rx) = test_connection();
        let stream = conn.streams.open(1).unwrap();
        // Push the window right up to the max so one more increment overflows
        // it — a stream-scoped FLOW_CONTROL_ERROR (RFC 7540 §6.9.1).
        stream.lock().sender_window = crate::h2::stream::MAX_WINDOW_SIZE;
        let frame = Frame::window_update(1, 1);
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let mut pending = FuturesUnordered::new();

        let result = conn.drain_frames(&mut buf, &mut pending).await;

        assert!(result.is_ok(), "a stream error must not tear down the connection");
        let sent = outbound_rx.try_recv().expect("expected an RST_STREAM frame on the wire");
        let (rst_frame, _) = Frame::parse(&sent, ABSOLUTE_MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(rst_frame.typ, FrameType::RstStream);
        assert_eq!(rst_frame.stream_id, 1);
        assert_eq!(rst_frame.rst_stream_error(), Some(ErrorCode::FlowControlError));
        assert!(conn.streams.get(1).unwrap().lock().is_closed());
        assert!(outbound_rx.try_recv().is_err(), "no GOAWAY should follow a stream-scoped error");
    }

    #[tokio::test]
    async fn goaway_advertises_highest_processed_client_stream() {
        let (mut conn, mut outbound_rx) = test_connection();
        let mut encoder = hpack::Encoder::default();
        let fragment = encoder.encode(vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
        ]);

        conn.streams.open(1).unwrap();
        conn.finish_header_block(1, fragment.clone(), true).await.unwrap();
        assert_eq!(conn.peer_last_stream_id, 1);

        conn.streams.open(3).unwrap();
        conn.finish_header_block(3, fragment, true).await.unwrap();
        assert_eq!(conn.peer_last_stream_id, 3);

        conn.goaway(ErrorCode::ProtocolError, b"test");
        let sent = outbound_rx.try_recv().expect("expected a GOAWAY frame on the wire");
        let (goaway_frame, _) = Frame::parse(&sent, ABSOLUTE_MAX_FRAME_SIZE).unwrap().unwrap();
        let (last_stream_id, _, _) = goaway_frame.goaway_fields().unwrap();
        assert_eq!(last_stream_id, 3);
    }
}
