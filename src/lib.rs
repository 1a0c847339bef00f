#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

pub mod cache;
pub mod compression;
pub mod config;
pub mod error;
pub mod h1;
pub mod h2;
pub mod handler;
pub mod metrics;
pub mod ratelimit;
pub mod router;
pub mod scheduler;
pub mod security;
pub mod server;
pub mod sse;
pub mod types;
pub mod ws;

pub use config::ServerConfig;
pub use handler::{Handler, Upgrade, WsHandler};
pub use metrics::Metrics;
pub use server::Server;
pub use types::{HttpVersion, Request, Response};
