//! Per-stream state machine and flow-control windows (component C3).
//!
//! The teacher's `stream.rs`/`stream_coordinator.rs` paired a `Stream`
//! struct with a coordinator that owned a `HashMap<StreamId, Stream>`
//! behind a single mutex and drove client-side request/response
//! matching. Here the table is server-shaped (streams are opened by
//! inbound HEADERS, not by an outbound request call) and per-stream
//! state is independently lockable — spec §4.3 requires that
//! concurrent per-stream operations "serialize per stream", not behind
//! one table-wide lock — so `StreamTable` keeps a `DashMap<u32,
//! Mutex<Stream>>` rather than the teacher's `Mutex<HashMap<..>>`.

use crate::error::StreamError;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// SETTINGS_INITIAL_WINDOW_SIZE default (RFC 7540 §6.5.2).
pub const DEFAULT_INITIAL_WINDOW_SIZE: i64 = 65_535;

/// Largest legal flow-control window (RFC 7540 §6.9.1): 2^31 - 1.
pub const MAX_WINDOW_SIZE: i64 = (1i64 << 31) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub sender_window: i64,
    pub receiver_window: i64,
    pub priority: u8,
    /// Weak reference by id — the dependency graph is informational and
    /// never owns the stream it points at (spec.md §3 DATA MODEL).
    pub dependency: Option<u32>,
    pub request_headers: Vec<(Bytes, Bytes)>,
    pub received_data: BytesMut,
    pub end_stream_received: bool,
    pub end_stream_sent: bool,
    pub client_initiated: bool,
}

impl Stream {
    fn new(id: u32, initial_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            sender_window: initial_window,
            receiver_window: initial_window,
            priority: 16,
            dependency: None,
            request_headers: Vec::new(),
            received_data: BytesMut::new(),
            end_stream_received: false,
            end_stream_sent: false,
            client_initiated: id % 2 == 1,
        }
    }

    /// Transition on a HEADERS frame, sent or received (both open a
    /// stream out of IDLE — spec §4.3 state table).
    pub fn on_headers(&mut self, end_stream: bool, sent: bool) -> Result<(), StreamError> {
        match self.state {
            StreamState::Idle => {
                self.state = StreamState::Open;
                if end_stream {
                    self.on_end_stream(sent)?;
                }
                Ok(())
            }
            StreamState::Closed => Err(StreamError::Closed),
            _ => Err(StreamError::Protocol),
        }
    }

    /// Transition on END_STREAM, sent (`sent = true`) or received.
    pub fn on_end_stream(&mut self, sent: bool) -> Result<(), StreamError> {
        if sent {
            self.end_stream_sent = true;
        } else {
            self.end_stream_received = true;
        }
        self.state = match (self.state, sent) {
            (StreamState::Closed, _) => return Err(StreamError::Closed),
            (StreamState::Open, true) => StreamState::HalfClosedLocal,
            (StreamState::Open, false) => StreamState::HalfClosedRemote,
            (StreamState::HalfClosedLocal, false) => StreamState::Closed,
            (StreamState::HalfClosedRemote, true) => StreamState::Closed,
            // END_STREAM sent twice locally, or received twice remotely,
            // or on an otherwise-idle stream: the frame sequence is illegal,
            // but that judgment belongs to C4 (spec §4.3); here we just
            // hold the last legal state rather than invent a new one.
            (other, _) => other,
        };
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Applies a DATA payload of `n` bytes to the appropriate window,
    /// returning a flow-control error if it would go past what RFC 7540
    /// permits (a window may go negative only via a SETTINGS resize, never
    /// by a sender exceeding what it was granted).
    pub fn apply_data_sent(&mut self, n: i64) -> Result<(), StreamError> {
        if n > self.sender_window {
            return Err(StreamError::FlowControl);
        }
        self.sender_window -= n;
        Ok(())
    }

    pub fn apply_data_received(&mut self, n: i64) -> Result<(), StreamError> {
        if n > self.receiver_window {
            return Err(StreamError::FlowControl);
        }
        self.receiver_window -= n;
        Ok(())
    }

    /// WINDOW_UPDATE increment applied to this stream's sender window.
    /// Zero increments are silently absorbed (spec §4.3); a window that
    /// would exceed `MAX_WINDOW_SIZE` is a flow-control error.
    pub fn apply_window_update(&mut self, increment: u32) -> Result<(), StreamError> {
        if increment == 0 {
            return Ok(());
        }
        let updated = self
            .sender_window
            .checked_add(i64::from(increment))
            .ok_or(StreamError::FlowControl)?;
        if updated > MAX_WINDOW_SIZE {
            return Err(StreamError::FlowControl);
        }
        self.sender_window = updated;
        Ok(())
    }

    /// Applied when SETTINGS_INITIAL_WINDOW_SIZE changes: every open
    /// stream's sender window shifts by the delta, and may go transiently
    /// negative (spec §4.3).
    pub fn apply_initial_window_delta(&mut self, delta: i64) {
        self.sender_window += delta;
    }
}

/// Owns every `Stream` for one connection. Per-stream operations are
/// serialized by locking that stream's own mutex; the table itself
/// (a `DashMap`) only ever needs a brief lock to find or insert the
/// entry, so two different streams never block each other.
pub struct StreamTable {
    streams: DashMap<u32, Arc<parking_lot::Mutex<Stream>>>,
    highest_client_id: AtomicU32,
    highest_server_id: AtomicU32,
    initial_window_size: parking_lot::Mutex<i64>,
}

impl StreamTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            highest_client_id: AtomicU32::new(0),
            highest_server_id: AtomicU32::new(0),
            initial_window_size: parking_lot::Mutex::new(DEFAULT_INITIAL_WINDOW_SIZE),
        }
    }

    pub fn set_initial_window_size(&self, size: i64) {
        let mut guard = self.initial_window_size.lock();
        let delta = size - *guard;
        *guard = size;
        drop(guard);
        for entry in self.streams.iter() {
            entry.value().lock().apply_initial_window_delta(delta);
        }
    }

    /// Opens (or fetches an already-open) stream for an inbound or
    /// outbound HEADERS frame, enforcing the monotonically-increasing id
    /// high-water mark from spec §3's Stream invariant.
    pub fn open(&self, id: u32) -> Result<Arc<parking_lot::Mutex<Stream>>, StreamError> {
        if let Some(existing) = self.streams.get(&id) {
            return Ok(existing.clone());
        }
        let high_water = if id % 2 == 1 {
            &self.highest_client_id
        } else {
            &self.highest_server_id
        };
        let prev = high_water.load(Ordering::SeqCst);
        if id != 0 && id <= prev {
            return Err(StreamError::Protocol);
        }
        high_water.store(id, Ordering::SeqCst);
        let window = *self.initial_window_size.lock();
        let stream = Arc::new(parking_lot::Mutex::new(Stream::new(id, window)));
        self.streams.insert(id, stream.clone());
        Ok(stream)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<parking_lot::Mutex<Stream>>> {
        self.streams.get(&id).map(|e| e.value().clone())
    }

    /// Frees closed streams so a long-lived connection's table doesn't
    /// grow without bound (the teacher's coordinator never reaped
    /// completed requests since a client only opens a handful per run).
    pub fn reap_closed(&self) {
        self.streams.retain(|_, s| !s.lock().is_closed());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_then_end_stream_opens_and_half_closes() {
        let table = StreamTable::new();
        let stream = table.open(1).unwrap();
        {
            let mut s = stream.lock();
            s.on_headers(false, false).unwrap();
            assert_eq!(s.state, StreamState::Open);
            s.on_end_stream(false).unwrap();
            assert_eq!(s.state, StreamState::HalfClosedRemote);
            s.on_end_stream(true).unwrap();
            assert_eq!(s.state, StreamState::Closed);
        }
    }

    #[test]
    fn stale_stream_id_is_protocol_error() {
        let table = StreamTable::new();
        table.open(5).unwrap();
        assert_eq!(table.open(3), Err(StreamError::Protocol));
    }

    #[test]
    fn window_update_increments_sender_window() {
        let table = StreamTable::new();
        let stream = table.open(1).unwrap();
        let mut s = stream.lock();
        let before = s.sender_window;
        s.apply_window_update(1000).unwrap();
        assert_eq!(s.sender_window, before + 1000);
        // zero increments are absorbed without error or change.
        s.apply_window_update(0).unwrap();
        assert_eq!(s.sender_window, before + 1000);
    }

    #[test]
    fn data_exceeding_window_is_flow_control_error() {
        let table = StreamTable::new();
        let stream = table.open(1).unwrap();
        let mut s = stream.lock();
        assert_eq!(
            s.apply_data_sent(DEFAULT_INITIAL_WINDOW_SIZE + 1),
            Err(StreamError::FlowControl)
        );
    }

    #[test]
    fn initial_window_resize_shifts_open_streams() {
        let table = StreamTable::new();
        let stream = table.open(1).unwrap();
        stream.lock().apply_data_sent(1000).unwrap();
        table.set_initial_window_size(DEFAULT_INITIAL_WINDOW_SIZE - 2000);
        // window can go transiently negative after a shrinking resize.
        assert!(stream.lock().sender_window < 0);
    }

    #[test]
    fn reap_closed_drops_finished_streams() {
        let table = StreamTable::new();
        let stream = table.open(1).unwrap();
        stream.lock().reset();
        table.reap_closed();
        assert!(table.get(1).is_none());
    }
}
