//! HTTP/1.0 / HTTP/1.1 request parsing (component C5).

pub mod parser;

pub use parser::{
    decode_chunked, parse_head, BodyMode, RequestHead, KNOWN_METHODS, MAX_HEADERS_BYTES,
    MAX_REQUEST_LINE_BYTES,
};
