//! SSEBroker (component C11): topic-keyed pub/sub over Server-Sent
//! Events, built on the same `dashmap` sharded-map idiom `cache.rs` and
//! `ratelimit.rs` use for every other process-global table in this
//! crate (spec §5), with each subscriber's outbound half backed by a
//! bounded `tokio::mpsc` channel instead of a broadcast channel so one
//! slow reader's backpressure cannot stall delivery to the rest of a
//! topic's subscribers.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// One Server-Sent Event (spec §4.11's wire format). `data` may contain
/// embedded newlines; the writer splits it into multiple `data:` lines.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
    pub data: String,
}

impl SseEvent {
    #[must_use]
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Serializes to the W3C SSE wire format: `event:`/`id:`/`retry:`
    /// lines, one `data:` line per line of `data`, terminated by a
    /// blank line. Empty `data` is rejected by `SseBroker::broadcast`
    /// before this is ever called.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(retry) = self.retry_ms {
            out.push_str("retry: ");
            out.push_str(&retry.to_string());
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }

    /// A `:`-prefixed comment line used to keep idle connections alive;
    /// not a real event (spec §4.11).
    #[must_use]
    pub fn keepalive() -> Bytes {
        Bytes::from_static(b":\n\n")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TopicStats {
    pub subscriber_count: usize,
}

/// Topic-keyed registry of subscribers. `register`/`unregister` are the
/// only operations that touch both the per-topic map and the
/// connection-to-topic index, so they are the only two methods that
/// lock more than one shard at a time.
pub struct SseBroker {
    topics: DashMap<String, DashMap<ConnectionId, mpsc::Sender<Bytes>>>,
    connection_topic: DashMap<ConnectionId, String>,
    max_per_topic: usize,
    next_id: AtomicU64,
}

impl SseBroker {
    #[must_use]
    pub fn new(max_per_topic: usize) -> Self {
        Self {
            topics: DashMap::new(),
            connection_topic: DashMap::new(),
            max_per_topic,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `connection` under `topic`, returning the receiving
    /// half of its outbound channel on success. Returns `None` (spec's
    /// `register(...) -> bool` false case) once the topic is at its
    /// connection cap.
    pub fn register(
        &self,
        topic: &str,
        connection: ConnectionId,
        channel_capacity: usize,
    ) -> Option<mpsc::Receiver<Bytes>> {
        let subscribers = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(DashMap::new);
        if subscribers.len() >= self.max_per_topic {
            return None;
        }
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        subscribers.insert(connection, tx);
        drop(subscribers);
        self.connection_topic.insert(connection, topic.to_string());
        Some(rx)
    }

    /// Removes `connection` from its topic, garbage-collecting the
    /// topic entirely once its subscriber count reaches zero.
    pub fn unregister(&self, connection: ConnectionId) {
        let Some((_, topic)) = self.connection_topic.remove(&connection) else {
            return;
        };
        let mut drop_topic = false;
        if let Some(subscribers) = self.topics.get(&topic) {
            subscribers.remove(&connection);
            drop_topic = subscribers.is_empty();
        }
        if drop_topic {
            self.topics.remove_if(&topic, |_, s| s.is_empty());
        }
    }

    /// Best-effort fan-out: each subscriber's send is independent, and a
    /// full or closed channel drops that one subscriber without
    /// aborting the rest of the broadcast (spec §4.11). Returns the
    /// count of recipients the send was *issued* to, not acked.
    ///
    /// Per-topic ordering falls out of this broker's locking: `DashMap`
    /// serializes concurrent writers to the same topic's shard, and
    /// each subscriber's own `mpsc::Sender` preserves send order to that
    /// one receiver — so broadcasts for one topic are observed by any
    /// one subscriber in the order `broadcast` was called, even though
    /// distinct topics may interleave freely.
    pub fn broadcast(&self, topic: &str, event: &SseEvent) -> usize {
        if event.data.is_empty() {
            return 0; // spec §4.11: empty data is disallowed
        }
        let Some(subscribers) = self.topics.get(topic) else {
            return 0;
        };
        let encoded = event.encode();
        let mut issued = 0;
        let mut dead: Vec<ConnectionId> = Vec::new();
        for entry in subscribers.iter() {
            match entry.value().try_send(encoded.clone()) {
                Ok(()) => issued += 1,
                Err(_) => dead.push(*entry.key()),
            }
        }
        drop(subscribers);
        for connection in dead {
            self.unregister(connection);
        }
        issued
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> HashMap<String, TopicStats> {
        self.topics
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    TopicStats { subscriber_count: entry.value().len() },
                )
            })
            .collect()
    }
}

impl Default for SseBroker {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_broadcast_reaches_subscriber() {
        let broker = SseBroker::new(10);
        let conn = broker.next_connection_id();
        let mut rx = broker.register("chat", conn, 8).unwrap();
        let issued = broker.broadcast("chat", &SseEvent::new("hello"));
        assert_eq!(issued, 1);
        let bytes = rx.try_recv().unwrap();
        assert_eq!(&bytes[..], b"data: hello\n\n");
    }

    #[test]
    fn topic_cap_rejects_further_registrations() {
        let broker = SseBroker::new(1);
        assert!(broker.register("t", broker.next_connection_id(), 4).is_some());
        assert!(broker.register("t", broker.next_connection_id(), 4).is_none());
    }

    #[test]
    fn unregister_garbage_collects_empty_topic() {
        let broker = SseBroker::new(10);
        let conn = broker.next_connection_id();
        broker.register("t", conn, 4);
        assert!(broker.topics().contains(&"t".to_string()));
        broker.unregister(conn);
        assert!(!broker.topics().contains(&"t".to_string()));
    }

    #[test]
    fn empty_data_is_rejected() {
        let broker = SseBroker::new(10);
        let conn = broker.next_connection_id();
        broker.register("t", conn, 4);
        let issued = broker.broadcast("t", &SseEvent { data: String::new(), ..Default::default() });
        assert_eq!(issued, 0);
    }

    #[test]
    fn multiline_data_becomes_multiple_data_lines() {
        let event = SseEvent::new("line one\nline two").with_event("update").with_id("42");
        let encoded = String::from_utf8(event.encode().to_vec()).unwrap();
        assert_eq!(encoded, "event: update\nid: 42\ndata: line one\ndata: line two\n\n");
    }

    #[test]
    fn broadcast_to_unknown_topic_returns_zero() {
        let broker = SseBroker::new(10);
        assert_eq!(broker.broadcast("missing", &SseEvent::new("x")), 0);
    }
}
