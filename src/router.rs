//! ProtocolRouter (component C6): classifies a freshly accepted
//! connection as HTTP/2 or HTTP/1.x by peeking its opening bytes, then
//! drives the HTTP/1.1 keep-alive request loop.

use crate::config::ServerConfig;
use crate::error::{ConnectionError, RequestError};
use crate::h1::{self, BodyMode};
use crate::h2::{RequestDispatcher, CLIENT_PREFACE};
use crate::security;
use crate::types::{HttpVersion, Request, Response};
use crate::ws;
use bytes::{Bytes, BytesMut};
use httpdate::fmt_http_date;
use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// A reader that first replays already-consumed bytes before delegating
/// to the underlying I/O — lets the router peek at a connection's
/// opening bytes without an actual (TLS-incompatible) socket-level peek.
pub struct PrefixedReader<IO> {
    prefix: Bytes,
    inner: IO,
}

impl<IO> PrefixedReader<IO> {
    pub fn new(prefix: Bytes, inner: IO) -> Self {
        Self { prefix, inner }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for PrefixedReader<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix = self.prefix.slice(n..);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for PrefixedReader<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Reads whatever bytes are immediately available (bounded by
/// `peek_timeout`) and classifies the connection without losing them.
pub async fn classify<IO>(
    mut io: IO,
    peek_timeout: std::time::Duration,
) -> Result<(Protocol, PrefixedReader<IO>), ConnectionError>
where
    IO: AsyncRead + Unpin,
{
    let mut buf = [0u8; 24];
    let n = match tokio::time::timeout(peek_timeout, io.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(err)) => return Err(ConnectionError::Io(err)),
        Err(_) => 0, // peek timeout elapsed with nothing to read: fall through to HTTP/1.x
    };
    let prefix = Bytes::copy_from_slice(&buf[..n]);
    let protocol = if prefix.starts_with(CLIENT_PREFACE) || CLIENT_PREFACE.starts_with(&prefix[..]) && n > 0 && n < CLIENT_PREFACE.len() {
        Protocol::Http2
    } else {
        // Any other opening token is handed to the HTTP/1.x parser, which
        // rejects an unrecognized method with 405 (spec §7(vi)).
        Protocol::Http1
    };
    trace!("router: classified connection as {protocol:?} from {n} peeked bytes");
    Ok((protocol, PrefixedReader::new(prefix, io)))
}

/// Drives the HTTP/1.1 keep-alive loop for one accepted connection
/// (spec §4.6): parse → dispatch → write response → decide whether to
/// read another request line or close. A response carrying a WebSocket
/// `upgrade` (spec §4.12) ends the HTTP loop and hands `io` off to C12's
/// connection-driving loop instead.
pub async fn run_http1<IO>(
    mut io: IO,
    dispatcher: Arc<dyn RequestDispatcher>,
    config: Arc<ServerConfig>,
    peer_addr: Option<SocketAddr>,
    connection_id: u64,
) -> Result<(), ConnectionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut requests_served: u32 = 0;
    let mut chunk = [0u8; 8 * 1024];

    loop {
        let head_and_mode = loop {
            match h1::parse_head(&buf) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {}
                Err(err) => {
                    // Malformed request line/headers leave the read cursor in
                    // an indeterminate spot relative to the next request, so
                    // the connection always closes after the error response
                    // (spec §7, class ii/vi) — unlike an oversized body,
                    // which is bounded by its own declared length.
                    write_error_response(&mut io, err, true, config.tls.is_some()).await?;
                    return Ok(());
                }
            }
            let read_fut = io.read(&mut chunk);
            let n = if requests_served == 0 {
                read_fut.await.map_err(ConnectionError::Io)?
            } else {
                match tokio::time::timeout(config.keep_alive_timeout(), read_fut).await {
                    Ok(result) => result.map_err(ConnectionError::Io)?,
                    Err(_) => return Ok(()), // idle timeout: close quietly
                }
            };
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let (head, body_mode, head_len) = head_and_mode;
        buf.split_to(head_len);

        let body = match read_body(&mut io, &mut buf, &mut chunk, body_mode, config.request_body_max_bytes).await? {
            Ok(body) => body,
            Err(err) => {
                requests_served += 1;
                let last_request = requests_served >= config.keep_alive_max_requests || !config.keep_alive_enabled;
                // A declared Content-Length beyond the configured maximum is
                // known up front; drain exactly that many bytes so the
                // connection can keep serving requests (spec §4.5/§7(vi)).
                // An oversized chunked body has no declared total to drain
                // safely, so that path closes instead.
                if let BodyMode::ContentLength(len) = body_mode {
                    if !last_request {
                        drain_content_length(&mut io, &mut buf, &mut chunk, len).await?;
                        write_error_response(&mut io, err, false, config.tls.is_some()).await?;
                        continue;
                    }
                }
                write_error_response(&mut io, err, true, config.tls.is_some()).await?;
                return Ok(());
            }
        };

        requests_served += 1;
        let client_wants_close = wants_close(&head.headers, head.version);
        let last_request = client_wants_close
            || requests_served >= config.keep_alive_max_requests
            || !config.keep_alive_enabled;

        let request = Request {
            method: head.method,
            path: head.path,
            version: head.version,
            headers: head.headers,
            body,
            peer_addr,
        };
        let mut response = dispatcher.dispatch(request).await;

        if response.status == 101 {
            if let Some(upgrade) = response.upgrade.take() {
                write_upgrade_response(&mut io, &response).await?;
                debug!("h1: conn={connection_id} handing off to the WebSocket frame loop");
                return ws::drive_connection(io, upgrade.handler, connection_id, upgrade.max_frame_bytes).await;
            }
        }

        apply_standard_headers(&mut response, last_request, &config, requests_served);
        write_response(&mut io, &response).await?;

        if last_request {
            debug!("h1: closing connection after {requests_served} request(s)");
            return Ok(());
        }
    }
}

/// Writes a `101 Switching Protocols` response with no body and no
/// `Content-Length`/keep-alive headers, since the socket is handed off
/// to a different framing entirely right after (spec §4.12).
async fn write_upgrade_response<IO>(io: &mut IO, response: &Response) -> Result<(), ConnectionError>
where
    IO: AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", response.status, response.reason_phrase()).as_bytes());
    for (name, value) in &response.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    io.write_all(&out).await.map_err(ConnectionError::Io)?;
    io.flush().await.map_err(ConnectionError::Io)
}

/// Reads the request body, if any. The outer `Result` carries transport
/// and unrecoverable-framing failures (connection closes); the inner one
/// carries an oversized-body rejection the caller can still answer with a
/// response (spec §4.5/§7(vi)).
async fn read_body<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    chunk: &mut [u8],
    mode: BodyMode,
    max_body_bytes: u64,
) -> Result<Result<Bytes, RequestError>, ConnectionError>
where
    IO: AsyncRead + Unpin,
{
    match mode {
        BodyMode::None => Ok(Ok(Bytes::new())),
        BodyMode::ContentLength(len) => {
            if len > max_body_bytes {
                return Ok(Err(RequestError::PayloadTooLarge));
            }
            while (buf.len() as u64) < len {
                let n = io.read(chunk).await.map_err(ConnectionError::Io)?;
                if n == 0 {
                    warn!("h1: peer closed mid-body with {} of {len} bytes received", buf.len());
                    return Err(ConnectionError::MalformedRequest);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Ok(Ok(buf.split_to(len as usize).freeze()))
        }
        BodyMode::Chunked => loop {
            match h1::decode_chunked(buf, max_body_bytes) {
                Ok(Some((body, consumed))) => {
                    buf.split_to(consumed);
                    return Ok(Ok(body));
                }
                Ok(None) => {}
                // Both a too-large and a malformed chunk size surface as a
                // response the caller can still write (spec §7(vi)); the
                // caller closes afterward since a malformed chunk desyncs
                // the stream, but a too-large one is announced up front.
                Err(err) => return Ok(Err(err)),
            }
            let n = io.read(chunk).await.map_err(ConnectionError::Io)?;
            if n == 0 {
                return Err(ConnectionError::MalformedRequest);
            }
            buf.extend_from_slice(&chunk[..n]);
        },
    }
}

/// Drains exactly `len` bytes of a rejected Content-Length body from the
/// wire (discarding them) so the connection's read cursor lands back on
/// the next request line and keep-alive can continue.
async fn drain_content_length<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    chunk: &mut [u8],
    len: u64,
) -> Result<(), ConnectionError>
where
    IO: AsyncRead + Unpin,
{
    let mut remaining = len.saturating_sub(buf.len() as u64);
    if remaining == 0 {
        buf.split_to(len as usize);
        return Ok(());
    }
    buf.clear();
    while remaining > 0 {
        let want = (chunk.len() as u64).min(remaining) as usize;
        let n = io.read(&mut chunk[..want]).await.map_err(ConnectionError::Io)?;
        if n == 0 {
            return Err(ConnectionError::MalformedRequest);
        }
        remaining -= n as u64;
    }
    Ok(())
}

/// Writes a standalone error response (no application handler ran) and
/// flushes it. Used for parse-time and body-size rejections that never
/// reach `dispatcher.dispatch`. `close` picks between advertising
/// `Connection: close` (the socket is abandoned right after) and
/// `keep-alive` (the caller is about to read another request line).
async fn write_error_response<IO>(
    io: &mut IO,
    err: RequestError,
    close: bool,
    is_tls: bool,
) -> Result<(), ConnectionError>
where
    IO: AsyncWrite + Unpin,
{
    let mut response = Response::text(err.status_code(), err.reason_phrase().to_string());
    security::apply(&mut response.headers, is_tls);
    response
        .headers
        .insert("connection".to_string(), if close { "close" } else { "keep-alive" }.to_string());
    response
        .headers
        .entry("date".to_string())
        .or_insert_with(|| fmt_http_date(SystemTime::now()));
    response
        .headers
        .entry("content-length".to_string())
        .or_insert_with(|| response.body.len().to_string());
    write_response(io, &response).await
}

fn wants_close(headers: &std::collections::HashMap<String, String>, version: HttpVersion) -> bool {
    let connection = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("connection"))
        .map(|(_, v)| v.to_ascii_lowercase());
    match (version, connection.as_deref()) {
        (_, Some(v)) if v.contains("close") => true,
        (HttpVersion::Http10, Some(v)) if v.contains("keep-alive") => false,
        (HttpVersion::Http10, _) => true,
        _ => false,
    }
}

fn apply_standard_headers(response: &mut Response, last_request: bool, config: &ServerConfig, served: u32) {
    response
        .headers
        .entry("date".to_string())
        .or_insert_with(|| fmt_http_date(SystemTime::now()));
    response
        .headers
        .entry("content-length".to_string())
        .or_insert_with(|| response.body.len().to_string());
    if last_request {
        response.headers.insert("connection".to_string(), "close".to_string());
    } else {
        response.headers.insert("connection".to_string(), "keep-alive".to_string());
        let remaining_max = config.keep_alive_max_requests.saturating_sub(served);
        response.headers.insert(
            "keep-alive".to_string(),
            format!(
                "timeout={}, max={}",
                config.keep_alive_timeout_ms / 1000,
                remaining_max
            ),
        );
    }
}

async fn write_response<IO>(io: &mut IO, response: &Response) -> Result<(), ConnectionError>
where
    IO: AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(256 + response.body.len());
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", response.status, response.reason_phrase()).as_bytes());
    for (name, value) in &response.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    io.write_all(&out).await.map_err(ConnectionError::Io)?;
    io.flush().await.map_err(ConnectionError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wants_close_honors_explicit_header() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("Connection".to_string(), "close".to_string());
        assert!(wants_close(&headers, HttpVersion::Http11));
    }

    #[test]
    fn http10_defaults_to_close_without_keep_alive_header() {
        let headers = std::collections::HashMap::new();
        assert!(wants_close(&headers, HttpVersion::Http10));
    }

    #[test]
    fn http10_with_keep_alive_header_stays_open() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        assert!(!wants_close(&headers, HttpVersion::Http10));
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        let headers = std::collections::HashMap::new();
        assert!(!wants_close(&headers, HttpVersion::Http11));
    }

    struct EchoDispatcher;
    impl crate::h2::RequestDispatcher for EchoDispatcher {
        fn dispatch(&self, request: Request) -> crate::handler::BoxFuture<'static, Response> {
            Box::pin(async move { Response::text(200, format!("echo:{}", request.path)) })
        }
    }

    fn read_status_line(raw: &str) -> u16 {
        raw.lines().next().unwrap().split_whitespace().nth(1).unwrap().parse().unwrap()
    }

    /// An oversized `Content-Length` body is rejected with 413 but the
    /// connection stays open: the declared length lets the server drain
    /// the rejected body and keep serving the same socket (spec §4.5/§7(vi)).
    #[tokio::test]
    async fn oversized_content_length_body_gets_413_and_keeps_connection_alive() {
        let (mut client, server) = tokio::io::duplex(8192);
        let config = Arc::new(ServerConfig {
            request_body_max_bytes: 8,
            ..ServerConfig::default()
        });
        let dispatcher: Arc<dyn crate::h2::RequestDispatcher> = Arc::new(EchoDispatcher);
        let drive = tokio::spawn(run_http1(server, dispatcher, config, None, 1));

        let oversized_body = "x".repeat(100);
        client
            .write_all(format!("POST /big HTTP/1.1\r\nContent-Length: {}\r\n\r\n{oversized_body}", oversized_body.len()).as_bytes())
            .await
            .unwrap();
        client
            .write_all(b"GET /small HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        drive.await.unwrap().unwrap();

        let text = String::from_utf8(response).unwrap();
        let responses: Vec<&str> = text.split("HTTP/1.1").filter(|s| !s.is_empty()).collect();
        assert_eq!(responses.len(), 2, "expected a 413 then a 200: got {text:?}");
        assert_eq!(read_status_line(&format!("HTTP/1.1{}", responses[0])), 413);
        assert_eq!(read_status_line(&format!("HTTP/1.1{}", responses[1])), 200);
        assert!(responses[1].contains("echo:/small"));
    }

    /// A malformed request line never reaches the dispatcher and still
    /// gets an explicit 400 response before the connection closes.
    #[tokio::test]
    async fn malformed_request_line_gets_400_and_closes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let config = Arc::new(ServerConfig::default());
        let dispatcher: Arc<dyn crate::h2::RequestDispatcher> = Arc::new(EchoDispatcher);
        let drive = tokio::spawn(run_http1(server, dispatcher, config, None, 1));

        client.write_all(b"\x01\x02\x03 not-a-request\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        drive.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&response);
        assert_eq!(read_status_line(&text), 400);
        assert!(text.to_ascii_lowercase().contains("connection: close"));
    }
}
