//! HTTP/2 protocol stack: frame codec (C1), HPACK (C2), per-stream state
//! (C3) and the connection multiplexer (C4).

pub mod connection;
pub mod frame;
mod huffman;
pub mod hpack;
pub mod stream;

pub use connection::{H2Connection, RequestDispatcher, CLIENT_PREFACE};
