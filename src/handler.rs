//! Handler capability (spec §4.13, Design Note 1): a request handler is
//! a value, not a position in a class hierarchy. Anything `Fn(Request)
//! -> impl Future<Output = Response>` implements `Handler` for free.

use crate::types::{Request, Response};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Handler: Send + Sync {
    fn call(&self, request: Request) -> BoxFuture<'static, Response>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<'static, Response> {
        Box::pin(self(request))
    }
}

/// The tagged-record spec §4.13 calls a "quadruple" despite carrying five
/// optional slots, called back by C12's connection-driving loop. Each
/// slot is optional so a handler can, say, only care about `on_text`.
#[derive(Clone)]
pub struct WsHandler {
    pub on_open: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    pub on_text: Option<Arc<dyn Fn(u64, String) -> BoxFuture<'static, ()> + Send + Sync>>,
    pub on_binary: Option<Arc<dyn Fn(u64, Bytes) -> BoxFuture<'static, ()> + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(u64, Option<(u16, String)>) + Send + Sync>>,
    /// Fires for a frame that fails C12 validation or an I/O failure on
    /// the socket, in place of `on_close` (which only fires for a clean
    /// close handshake).
    pub on_error: Option<Arc<dyn Fn(u64, String) + Send + Sync>>,
}

impl Default for WsHandler {
    fn default() -> Self {
        Self {
            on_open: None,
            on_text: None,
            on_binary: None,
            on_close: None,
            on_error: None,
        }
    }
}

/// Attached to a `Response` with status 101 to signal that C6/C4's write
/// path should hand the connection off to C12's frame loop instead of
/// writing a body and continuing the HTTP/1.x keep-alive loop (spec
/// §4.12). `max_frame_bytes` bounds a single frame's payload length.
#[derive(Clone)]
pub struct Upgrade {
    pub handler: WsHandler,
    pub max_frame_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_async_fn_is_a_handler() {
        async fn echo(req: Request) -> Response {
            Response::text(200, req.path)
        }
        let handler: Arc<dyn Handler> = Arc::new(echo);
        let req = Request {
            method: "GET".into(),
            path: "/ok".into(),
            version: crate::types::HttpVersion::Http11,
            headers: Default::default(),
            body: Bytes::new(),
            peer_addr: None,
        };
        let resp = handler.call(req).await;
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"/ok");
    }
}
