//! HTTP/1.0 and HTTP/1.1 request parsing (component C5).
//!
//! Grounded in `tailhook-rotor-http`'s `http1.rs` for the shape (request
//! line + header block size limits, an explicit fixed-size body mode vs.
//! an unsupported-yet one) and `httparse`'s own idiom of parsing into a
//! caller-owned, stack-allocated header array. Chunked transfer-encoding,
//! which that reference left a `TODO`, is implemented here in full.

use crate::error::RequestError;
use crate::types::HttpVersion;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// `httparse` requires a fixed-size header slot array up front.
const MAX_HEADER_COUNT: usize = 128;

/// RFC 7231/7540 methods this server dispatches. Spec §7(vi): anything
/// else gets 405 rather than being handed to the application.
pub const KNOWN_METHODS: &[&str] = &[
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

/// Spec §4.5: request line and header block are each bounded to 8 KiB.
pub const MAX_REQUEST_LINE_BYTES: usize = 8 * 1024;
pub const MAX_HEADERS_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: HttpVersion,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
}

/// Parses the request line + header block at the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed (and no declared limit
/// has yet been exceeded); `Ok(Some((head, body_mode, consumed)))` on a
/// complete parse; `Err` for a limit violation or malformed input.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, BodyMode, usize)>, RequestError> {
    if let Some(line_end) = find_crlf(buf) {
        if line_end > MAX_REQUEST_LINE_BYTES {
            return Err(RequestError::UriTooLong);
        }
    } else if buf.len() > MAX_REQUEST_LINE_BYTES {
        return Err(RequestError::UriTooLong);
    }

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(buf).map_err(|_| RequestError::BadRequest)?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            if buf.len() > MAX_REQUEST_LINE_BYTES + MAX_HEADERS_BYTES {
                return Err(RequestError::HeaderTooLarge);
            }
            return Ok(None);
        }
    };
    if consumed > MAX_REQUEST_LINE_BYTES + MAX_HEADERS_BYTES {
        return Err(RequestError::HeaderTooLarge);
    }

    let method = req.method.ok_or(RequestError::BadRequest)?.to_string();
    if !KNOWN_METHODS.contains(&method.as_str()) {
        return Err(RequestError::MethodNotAllowed);
    }
    let path = req.path.ok_or(RequestError::UriTooLong)?.to_string();
    let version = match req.version {
        Some(0) => HttpVersion::Http10,
        Some(1) => HttpVersion::Http11,
        _ => return Err(RequestError::BadRequest),
    };

    let mut headers = HashMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = h.name.to_string();
        let value = String::from_utf8(h.value.to_vec()).map_err(|_| RequestError::BadRequest)?;
        headers.insert(name, value);
    }

    let body_mode = determine_body_mode(&headers, version)?;

    Ok(Some((
        RequestHead { method, path, version, headers },
        body_mode,
        consumed,
    )))
}

fn determine_body_mode(headers: &HashMap<String, String>, version: HttpVersion) -> Result<BodyMode, RequestError> {
    let transfer_encoding = find_header(headers, "transfer-encoding");
    if let Some(te) = transfer_encoding {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyMode::Chunked);
        }
    }
    if let Some(cl) = find_header(headers, "content-length") {
        let cl = cl.trim();
        let len: i64 = cl.parse().map_err(|_| RequestError::BadRequest)?;
        if len < 0 {
            return Err(RequestError::BadRequest);
        }
        return Ok(BodyMode::ContentLength(len as u64));
    }
    let _ = version;
    Ok(BodyMode::None)
}

fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|pos| pos + 2)
}

/// Decodes as many complete chunks as are available at the front of
/// `buf`. Returns `Ok(Some((body, consumed)))` once the terminating
/// zero-length chunk (and its trailing CRLF, ignoring any trailers) has
/// been seen, `Ok(None)` if more bytes are needed, `Err` on a malformed
/// chunk size or a body that would exceed `max_body_bytes`.
pub fn decode_chunked(buf: &[u8], max_body_bytes: u64) -> Result<Option<(Bytes, usize)>, RequestError> {
    let mut pos = 0;
    let mut body = BytesMut::new();
    loop {
        let size_line_end = match find_crlf(&buf[pos..]) {
            Some(n) => pos + n,
            None => return Ok(None),
        };
        let size_line = std::str::from_utf8(&buf[pos..size_line_end - 2])
            .map_err(|_| RequestError::BadRequest)?;
        let size_token = size_line.split(';').next().unwrap_or("").trim();
        let chunk_size =
            u64::from_str_radix(size_token, 16).map_err(|_| RequestError::BadRequest)?;

        if chunk_size == 0 {
            // Zero-sized chunk: optional trailers, then a terminating blank line.
            let mut cursor = size_line_end;
            loop {
                let trailer_end = match find_crlf(&buf[cursor..]) {
                    Some(n) => cursor + n,
                    None => return Ok(None),
                };
                if trailer_end == cursor + 2 {
                    return Ok(Some((body.freeze(), trailer_end)));
                }
                cursor = trailer_end;
            }
        }

        if body.len() as u64 + chunk_size > max_body_bytes {
            return Err(RequestError::PayloadTooLarge);
        }

        let chunk_start = size_line_end;
        let chunk_end = chunk_start + chunk_size as usize;
        let trailer_end = chunk_end + 2; // chunk data is followed by CRLF
        if buf.len() < trailer_end {
            return Ok(None);
        }
        body.extend_from_slice(&buf[chunk_start..chunk_end]);
        pos = trailer_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (head, mode, consumed) = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/index.html");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(mode, BodyMode::None);
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn content_length_drives_body_mode() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (_, mode, consumed) = parse_head(raw).unwrap().unwrap();
        assert_eq!(mode, BodyMode::ContentLength(5));
        assert_eq!(consumed, raw.len() - 5);
    }

    #[test]
    fn negative_content_length_is_rejected() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: -1\r\n\r\n";
        assert!(parse_head(raw).is_err());
    }

    #[test]
    fn incomplete_headers_return_none() {
        let raw = b"GET / HTTP/1.1\r\nHost: ex";
        assert_eq!(parse_head(raw).unwrap(), None);
    }

    #[test]
    fn chunked_body_decodes_across_multiple_chunks() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (body, consumed) = decode_chunked(raw, 1_000).unwrap().unwrap();
        assert_eq!(&body[..], b"Wikipedia");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn chunked_body_over_budget_is_rejected() {
        let raw = b"a\r\n01234567890\r\n0\r\n\r\n";
        assert_eq!(decode_chunked(raw, 5), Err(RequestError::PayloadTooLarge));
    }

    #[test]
    fn oversized_request_line_is_uri_too_long() {
        let mut raw = format!("GET /{} HTTP/1.1\r\n", "a".repeat(MAX_REQUEST_LINE_BYTES)).into_bytes();
        raw.extend_from_slice(b"\r\n");
        assert_eq!(parse_head(&raw), Err(RequestError::UriTooLong));
    }

    #[test]
    fn garbled_request_line_is_bad_request_not_method_not_allowed() {
        let raw = b"\x01\x02\x03 not-a-request\r\n\r\n";
        assert_eq!(parse_head(raw), Err(RequestError::BadRequest));
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let raw = b"FOO /x HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(parse_head(raw), Err(RequestError::MethodNotAllowed));
    }
}
