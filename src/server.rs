//! Top-level server: the accept loop wiring C6 (ProtocolRouter), C9
//! (RateLimiter), and C10 (Scheduler) together behind one
//! `RequestDispatcher` every connection task shares.
//!
//! Mirrors the teacher's own `socket.rs`/`connection.rs` split between
//! "accept and hand off" and "drive one connection to completion",
//! generalized from a single blocking client loop into a Tokio accept
//! loop that spawns one task per connection.

use crate::cache::EtagCache;
use crate::config::ServerConfig;
use crate::error::RequestError;
use crate::h2::{H2Connection, RequestDispatcher};
use crate::handler::{BoxFuture, Handler};
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::router::{self, Protocol};
use crate::scheduler::Scheduler;
use crate::security::{self, AuthOutcome};
use crate::types::{Request, Response};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Wraps the C10 scheduler with the per-request admission checks that
/// apply regardless of protocol: rate limiting, authentication, and the
/// fixed security-response headers (spec §4.15/§4.16). Both the H1 loop
/// and `H2Connection` submit through this one `RequestDispatcher` impl,
/// so neither protocol layer re-implements these checks.
pub struct CoreDispatcher {
    scheduler: Arc<Scheduler>,
    rate_limiter: Arc<RateLimiter>,
    config: Arc<ServerConfig>,
    metrics: Arc<Metrics>,
    is_tls: bool,
}

impl RequestDispatcher for CoreDispatcher {
    fn dispatch(&self, request: Request) -> BoxFuture<'static, Response> {
        let scheduler = self.scheduler.clone();
        let rate_limiter = self.rate_limiter.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let is_tls = self.is_tls;
        Box::pin(async move {
            metrics
                .requests_total
                .with_label_values(&[request.version.as_str()])
                .inc();

            if config.rate_limit_enabled {
                let client_id = request
                    .peer_addr
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let decision = rate_limiter.try_acquire(&client_id);
                if !decision.allowed {
                    metrics.rate_limited_total.with_label_values(&["bucket_exhausted"]).inc();
                    let mut response = Response::text(
                        RequestError::TooManyRequests.status_code(),
                        RequestError::TooManyRequests.reason_phrase().to_string(),
                    );
                    response
                        .headers
                        .insert("retry-after".to_string(), decision.reset_seconds.ceil().to_string());
                    security::apply(&mut response.headers, is_tls);
                    return response;
                }
            }

            match security::authenticate(&request, &config.auth) {
                AuthOutcome::Unauthorized => {
                    let mut response = Response::text(
                        RequestError::Unauthorized.status_code(),
                        RequestError::Unauthorized.reason_phrase().to_string(),
                    );
                    response.headers.insert(
                        "www-authenticate".to_string(),
                        security::www_authenticate_value("restricted"),
                    );
                    security::apply(&mut response.headers, is_tls);
                    response
                }
                AuthOutcome::NotConfigured | AuthOutcome::Authorized => {
                    let mut response = scheduler.submit(request).await;
                    security::apply(&mut response.headers, is_tls);
                    response
                }
            }
        })
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    metrics: Arc<Metrics>,
    etag_cache: Arc<EtagCache>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Builds a server around a process-wide `Metrics` instance created
    /// fresh for this call. Use `with_metrics` instead when the caller
    /// needs to share that registry elsewhere (e.g. to answer
    /// `/health/metrics` from a handler wrapped around this server's).
    #[must_use]
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        Self::with_metrics(config, handler, Metrics::new())
    }

    #[must_use]
    pub fn with_metrics(config: ServerConfig, handler: Arc<dyn Handler>, metrics: Arc<Metrics>) -> Self {
        let etag_cache = Arc::new(EtagCache::new(config.etag_cache_entries));
        Self {
            config: Arc::new(config),
            handler,
            metrics,
            etag_cache,
            next_conn_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    #[must_use]
    pub fn etag_cache(&self) -> Arc<EtagCache> {
        self.etag_cache.clone()
    }

    /// Runs the accept loop until the listener errors out. Each
    /// accepted socket is classified and driven to completion on its
    /// own task; per-request handler execution is further admission
    /// controlled by the shared `CoreDispatcher` (spec §5).
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let scheduler = Scheduler::new(
            self.config.thread_pool_size,
            self.config.request_queue_limit,
            self.config.request_timeout(),
            self.handler.clone(),
            self.metrics.clone(),
        );
        let rate_limiter = Arc::new(RateLimiter::new(
            self.config.rate_limit_burst,
            self.config.rate_limit_per_second,
            self.config.rate_limit_max_buckets,
        ));
        let dispatcher: Arc<dyn RequestDispatcher> = Arc::new(CoreDispatcher {
            scheduler,
            rate_limiter,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            is_tls: self.config.tls.is_some(),
        });

        info!("accept loop listening on {:?}", listener.local_addr());
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let dispatcher = dispatcher.clone();
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer_addr, conn_id, dispatcher, config, metrics).await
                {
                    debug!("conn={conn_id} closed: {err}");
                }
            });
        }
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    peer_addr: std::net::SocketAddr,
    conn_id: u64,
    dispatcher: Arc<dyn RequestDispatcher>,
    config: Arc<ServerConfig>,
    metrics: Arc<Metrics>,
) -> Result<(), crate::error::ConnectionError> {
    let _ = socket.set_nodelay(true);
    let (protocol, prefixed) = router::classify(socket, config.peek_timeout()).await?;
    match protocol {
        Protocol::Http2 => {
            metrics.connections_active.with_label_values(&["h2"]).inc();
            let result = H2Connection::run(prefixed, dispatcher, conn_id, metrics.clone()).await;
            metrics.connections_active.with_label_values(&["h2"]).dec();
            result
        }
        Protocol::Http1 => {
            metrics.connections_active.with_label_values(&["h1"]).inc();
            let result = router::run_http1(prefixed, dispatcher, config, Some(peer_addr), conn_id).await;
            metrics.connections_active.with_label_values(&["h1"]).dec();
            result
        }
    }
}

/// Handles `GET /health` and `GET /health/metrics`, the two fixed
/// endpoints spec §6 requires regardless of the application handler.
/// Callers compose this in front of their own `Handler` (see
/// `with_health_endpoints`).
#[must_use]
pub fn health_response(path: &str, metrics: &Metrics) -> Option<Response> {
    match path {
        "/health" => Some(Response::text(200, "ok")),
        "/health/metrics" => {
            let body = metrics.render();
            Some(
                Response::new(200)
                    .with_header("content-type", "text/plain; version=0.0.4")
                    .with_body(body),
            )
        }
        _ => None,
    }
}

/// Wraps a handler so `/health` and `/health/metrics` are answered
/// without reaching the application handler at all.
pub fn with_health_endpoints(
    metrics: Arc<Metrics>,
    inner: Arc<dyn Handler>,
) -> Arc<dyn Handler> {
    struct WithHealth {
        metrics: Arc<Metrics>,
        inner: Arc<dyn Handler>,
    }
    impl Handler for WithHealth {
        fn call(&self, request: Request) -> BoxFuture<'static, Response> {
            if let Some(response) = health_response(&request.path, &self.metrics) {
                return Box::pin(async move { response });
            }
            self.inner.call(request)
        }
    }
    Arc::new(WithHealth { metrics, inner })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_endpoint_returns_ok() {
        let metrics = Metrics::new();
        let response = health_response("/health", &metrics).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"ok");
    }

    #[test]
    fn metrics_endpoint_renders_prometheus_text() {
        let metrics = Metrics::new();
        let response = health_response("/health/metrics", &metrics).unwrap();
        assert!(response.headers.get("content-type").unwrap().contains("text/plain"));
    }

    #[test]
    fn unknown_path_falls_through() {
        let metrics = Metrics::new();
        assert!(health_response("/anything-else", &metrics).is_none());
    }

    #[tokio::test]
    async fn with_health_endpoints_shortcircuits_before_inner_handler() {
        let metrics = Metrics::new();
        let inner: Arc<dyn Handler> =
            Arc::new(|_req: Request| async move { Response::text(500, "should not run") });
        let wrapped = with_health_endpoints(metrics, inner);
        let req = Request {
            method: "GET".into(),
            path: "/health".into(),
            version: crate::types::HttpVersion::Http11,
            headers: Default::default(),
            body: bytes::Bytes::new(),
            peer_addr: None,
        };
        let resp = wrapped.call(req).await;
        assert_eq!(resp.status, 200);
    }
}
