//! Scheduler (component C10): a bounded FIFO queue fronting a fixed
//! worker pool, admission-controlled rather than spawn-per-request.
//!
//! Grounded in `maker_web`'s `limits::ServerLimits` design (a fixed
//! number of long-lived worker tasks created once at startup, pulling
//! from a shared admission queue, with dedicated handling for
//! queue-full rather than unbounded task spawning) generalized from its
//! `Vec`-based slot pool to an async `mpsc` channel — the bounded
//! channel itself supplies the "reject when full" semantics that
//! `maker_web` implements by hand with a polled ring buffer.

use crate::error::RequestError;
use crate::h2::RequestDispatcher;
use crate::handler::{BoxFuture, Handler};
use crate::metrics::Metrics;
use crate::types::{Request, Response};
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// One unit of admitted work: spec §4.3's `QueuedRequest` (arrival time,
/// deadline, and a completion channel standing in for "connection").
/// Owned by the queue until a worker dequeues it; from that point the
/// worker is single-owner for the duration of handler execution.
struct QueuedRequest {
    request: Request,
    arrival: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Response>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

/// Handed back to the submitter so it can mark its item cancelled if the
/// owning connection closes before a worker dequeues it (spec §4.10).
pub struct SubmitHandle {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl SubmitHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

pub struct Scheduler {
    tx: mpsc::Sender<QueuedRequest>,
    request_timeout: Duration,
}

impl Scheduler {
    /// Spawns `worker_count` long-lived worker tasks pulling from a
    /// queue bounded at `queue_limit`, exactly the "exactly N handlers
    /// created once" shape `maker_web`'s doc comment describes for its
    /// own `ServerLimits::max_connections`.
    #[must_use]
    pub fn new(
        worker_count: usize,
        queue_limit: usize,
        request_timeout: Duration,
        handler: Arc<dyn Handler>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_limit.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_id in 0..worker_count.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            let metrics = metrics.clone();
            tokio::spawn(worker_loop(worker_id, rx, handler, metrics));
        }
        Arc::new(Self { tx, request_timeout })
    }

    /// Submits a request for execution. Returns the eventual response,
    /// or a synthesized error response if the queue is full, the item's
    /// deadline elapses before a worker dequeues it, or it is cancelled
    /// first (spec §4.10's three non-execution outcomes).
    pub async fn submit(&self, request: Request) -> Response {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let arrival = Instant::now();
        let item = QueuedRequest {
            request,
            arrival,
            deadline: arrival + self.request_timeout,
            reply: reply_tx,
            cancelled,
        };
        if self.tx.try_send(item).is_err() {
            return error_response(RequestError::ServiceUnavailable);
        }
        match reply_rx.await {
            Ok(response) => response,
            // The worker dropped the sender without replying: it saw a
            // past-deadline or cancelled item and skipped execution.
            Err(_) => error_response(RequestError::Timeout),
        }
    }

    /// A `SubmitHandle`-returning variant for callers (the HTTP/2
    /// connection task) that need to cancel a still-queued item when
    /// the owning connection closes before the worker dequeues it.
    pub fn submit_cancellable(
        &self,
        request: Request,
    ) -> (BoxFuture<'static, Response>, SubmitHandle) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let arrival = Instant::now();
        let item = QueuedRequest {
            request,
            arrival,
            deadline: arrival + self.request_timeout,
            reply: reply_tx,
            cancelled: cancelled.clone(),
        };
        let tx = self.tx.clone();
        let future: BoxFuture<'static, Response> = Box::pin(async move {
            if tx.try_send(item).is_err() {
                return error_response(RequestError::ServiceUnavailable);
            }
            match reply_rx.await {
                Ok(response) => response,
                Err(_) => error_response(RequestError::Timeout),
            }
        });
        (future, SubmitHandle { cancelled })
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedRequest>>>,
    handler: Arc<dyn Handler>,
    metrics: Arc<Metrics>,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(item) => item,
                None => return, // scheduler dropped, shut down quietly
            }
        };
        if item.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
            continue; // connection closed before we could dequeue it
        }
        if Instant::now() > item.deadline {
            log::warn!("scheduler: worker={worker_id} skipped request past its deadline");
            continue; // drop `item.reply`; submitter observes a closed channel
        }
        let response = std::panic::AssertUnwindSafe(handler.call(item.request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                log::error!("scheduler: worker={worker_id} handler panicked");
                error_response(RequestError::ServiceUnavailable)
            });
        metrics.responses_total.with_label_values(&[status_class(response.status)]).inc();
        let _ = item.reply.send(response);
    }
}

fn status_class(status: u16) -> &'static str {
    match status / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "unknown",
    }
}

fn error_response(err: RequestError) -> Response {
    Response::text(err.status_code(), err.reason_phrase().to_string())
}

/// Adapts a `Scheduler` to the `H2Connection`/`router.rs` dispatch
/// contract, so neither protocol layer ever spawns per-request work
/// itself — they only submit to this bounded pool (spec §5).
pub struct SchedulerDispatcher {
    scheduler: Arc<Scheduler>,
}

impl SchedulerDispatcher {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

impl RequestDispatcher for SchedulerDispatcher {
    fn dispatch(&self, request: Request) -> BoxFuture<'static, Response> {
        let scheduler = self.scheduler.clone();
        Box::pin(async move { scheduler.submit(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpVersion;
    use bytes::Bytes;

    fn sample_request(path: &str) -> Request {
        Request {
            method: "GET".into(),
            path: path.into(),
            version: HttpVersion::Http11,
            headers: Default::default(),
            body: Bytes::new(),
            peer_addr: None,
        }
    }

    #[tokio::test]
    async fn accepted_request_runs_the_handler() {
        let handler: Arc<dyn Handler> =
            Arc::new(|req: Request| async move { Response::text(200, req.path) });
        let scheduler = Scheduler::new(2, 8, Duration::from_secs(5), handler, Metrics::new());
        let resp = scheduler.submit(sample_request("/ok")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"/ok");
    }

    #[tokio::test]
    async fn full_queue_rejects_with_503() {
        let handler: Arc<dyn Handler> = Arc::new(|_req: Request| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Response::text(200, "done".to_string())
        });
        // Single worker, single queue slot: the third concurrent submit
        // finds both the in-flight slot and the queue slot occupied.
        let scheduler = Scheduler::new(1, 1, Duration::from_secs(5), handler, Metrics::new());
        let s1 = scheduler.clone();
        let s2 = scheduler.clone();
        let s3 = scheduler.clone();
        let (r1, r2, r3) = tokio::join!(
            s1.submit(sample_request("/a")),
            s2.submit(sample_request("/b")),
            s3.submit(sample_request("/c")),
        );
        let statuses = [r1.status, r2.status, r3.status];
        assert!(statuses.contains(&503), "expected at least one 503, got {statuses:?}");
    }

    #[tokio::test]
    async fn cancelled_item_is_skipped_by_the_worker() {
        let handler: Arc<dyn Handler> =
            Arc::new(|req: Request| async move { Response::text(200, req.path) });
        let scheduler = Scheduler::new(1, 8, Duration::from_secs(5), handler, Metrics::new());
        let (future, submit_handle) = scheduler.submit_cancellable(sample_request("/never"));
        submit_handle.cancel();
        let resp = future.await;
        assert_eq!(resp.status, RequestError::Timeout.status_code());
    }

    #[tokio::test]
    async fn past_deadline_item_is_skipped_with_timeout_response() {
        let handler: Arc<dyn Handler> = Arc::new(|_req: Request| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Response::text(200, "late".to_string())
        });
        // One worker kept busy long enough that the queued item's
        // zero-duration deadline has already elapsed by dequeue time.
        let scheduler = Scheduler::new(1, 8, Duration::from_nanos(1), handler, Metrics::new());
        let busy = scheduler.submit(sample_request("/busy"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (_, timed_out) = tokio::join!(busy, scheduler.submit(sample_request("/late")));
        assert_eq!(timed_out.status, RequestError::Timeout.status_code());
    }
}
