//! Crate-wide error taxonomy (spec §7).
//!
//! Low-level parse errors are typed so the protocol layer — not the codec —
//! decides between stream-scoped and connection-scoped recovery.

use thiserror::Error;

/// Errors that can terminate a connection outright (spec §7, classes i/ii).
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed HTTP/1.x request line or headers")]
    MalformedRequest,

    #[error("HPACK decode failure: {0}")]
    Hpack(#[from] crate::h2::hpack::DecodeError),

    #[error("HTTP/2 protocol error: {0}")]
    Protocol(&'static str),

    #[error("peer sent GOAWAY")]
    PeerGoneAway,
}

/// Errors scoped to a single HTTP/2 stream (spec §7, class iii). The
/// connection continues; only the offending stream is reset.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream-level protocol error")]
    Protocol,
    #[error("stream flow-control violation")]
    FlowControl,
    #[error("stream closed")]
    Closed,
    #[error("stream cancelled")]
    Cancel,
    #[error("internal error")]
    Internal,
}

impl StreamError {
    #[must_use]
    pub fn to_h2_error_code(self) -> crate::h2::frame::ErrorCode {
        use crate::h2::frame::ErrorCode;
        match self {
            StreamError::Protocol => ErrorCode::ProtocolError,
            StreamError::FlowControl => ErrorCode::FlowControlError,
            StreamError::Closed => ErrorCode::StreamClosed,
            StreamError::Cancel => ErrorCode::Cancel,
            StreamError::Internal => ErrorCode::InternalError,
        }
    }
}

/// Admission-control and resource-limit failures (spec §7, classes iv/vi).
/// These map onto concrete HTTP status codes and never tear down a
/// reusable keep-alive connection by themselves.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed request line or headers")]
    BadRequest,
    #[error("request body exceeds configured maximum")]
    PayloadTooLarge,
    #[error("request headers exceed configured maximum")]
    HeaderTooLarge,
    #[error("request URI exceeds configured maximum")]
    UriTooLong,
    #[error("unsupported or malformed method")]
    MethodNotAllowed,
    #[error("worker queue is full")]
    ServiceUnavailable,
    #[error("rate limit exceeded")]
    TooManyRequests,
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error("request exceeded its deadline")]
    Timeout,
}

impl RequestError {
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            RequestError::BadRequest => 400,
            RequestError::PayloadTooLarge => 413,
            RequestError::HeaderTooLarge => 431,
            RequestError::UriTooLong => 414,
            RequestError::MethodNotAllowed => 405,
            RequestError::ServiceUnavailable => 503,
            RequestError::TooManyRequests => 429,
            RequestError::Unauthorized => 401,
            RequestError::Timeout => 504,
        }
    }

    #[must_use]
    pub fn reason_phrase(self) -> &'static str {
        match self {
            RequestError::BadRequest => "Bad Request",
            RequestError::PayloadTooLarge => "Payload Too Large",
            RequestError::HeaderTooLarge => "Request Header Fields Too Large",
            RequestError::UriTooLong => "URI Too Long",
            RequestError::MethodNotAllowed => "Method Not Allowed",
            RequestError::ServiceUnavailable => "Service Unavailable",
            RequestError::TooManyRequests => "Too Many Requests",
            RequestError::Unauthorized => "Unauthorized",
            RequestError::Timeout => "Gateway Timeout",
        }
    }
}
