//! HTTP/2 stream state (RFC 7540 section 5.1) and flow-control
//! accounting.
//!
//! Streams live in an id-keyed table owned by the connection. Closed
//! streams are dropped from the table immediately; a later frame naming
//! a dropped id is recognized as "closed" because the id is at or below
//! the highest id seen, which is the lazy reaping the arena needs.

use crate::h2::frame::ErrorCode;
use std::collections::HashMap;

pub(crate) const WINDOW_MAX: i64 = 0x7FFF_FFFF;

/// A signed flow-control window; negative values are legal after a
/// SETTINGS-driven shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window(pub(crate) i64);

impl Window {
    pub(crate) fn new(initial: u32) -> Self {
        Window(i64::from(initial))
    }

    /// WINDOW_UPDATE increment; overflow past 2^31-1 is a flow-control
    /// error.
    pub(crate) fn widen(&mut self, increment: u32) -> Result<(), ErrorCode> {
        let next = self.0 + i64::from(increment);
        if next > WINDOW_MAX {
            return Err(ErrorCode::FlowControlError);
        }
        self.0 = next;
        Ok(())
    }

    /// Consume credit for sent or received payload bytes.
    pub(crate) fn narrow(&mut self, bytes: usize) {
        self.0 -= bytes as i64;
    }

    /// Retroactive adjustment when INITIAL_WINDOW_SIZE changes.
    pub(crate) fn shift(&mut self, delta: i64) {
        self.0 += delta;
    }

    pub(crate) fn available(&self) -> usize {
        self.0.max(0) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    ReservedLocal,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

pub(crate) struct Stream {
    pub(crate) id: u32,
    pub(crate) state: StreamState,
    pub(crate) send_window: Window,
    pub(crate) recv_window: Window,

    /// HEADERS/CONTINUATION fragments until END_HEADERS.
    pub(crate) header_block: Vec<u8>,
    pub(crate) headers_done: bool,
    pub(crate) headers: Vec<(String, String)>,
    /// Request body accumulated from DATA frames.
    pub(crate) body: Vec<u8>,

    /// Response bytes not yet permitted by the send windows.
    pub(crate) pending_data: Vec<u8>,
    pub(crate) response_started: bool,
    pub(crate) end_queued: bool,

    /// END_STREAM was set on the HEADERS frame now being assembled.
    pub(crate) remote_end_after_headers: bool,
    /// Opened only to keep HPACK state aligned; reset after decoding.
    pub(crate) refused: bool,
    /// `:authority` of the request, kept for push synthesis.
    pub(crate) authority: String,
}

impl Stream {
    pub(crate) fn new(id: u32, state: StreamState, initial_window: u32) -> Self {
        Self {
            id,
            state,
            send_window: Window::new(initial_window),
            recv_window: Window::new(initial_window),
            header_block: Vec::new(),
            headers_done: false,
            headers: Vec::new(),
            body: Vec::new(),
            pending_data: Vec::new(),
            response_started: false,
            end_queued: false,
            remote_end_after_headers: false,
            refused: false,
            authority: String::new(),
        }
    }

    /// The peer finished its side of the stream.
    pub(crate) fn remote_closed(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// We sent a frame carrying END_STREAM.
    pub(crate) fn local_closed(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::ReservedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub(crate) fn may_receive_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }
}

/// The per-connection stream arena.
pub(crate) struct StreamTable {
    streams: HashMap<u32, Stream>,
    /// Highest client-initiated id seen; lower unknown ids are closed.
    pub(crate) highest_client: u32,
    /// Next even id for server pushes.
    next_push: u32,
    initial_window: u32,
}

impl StreamTable {
    pub(crate) fn new(initial_window: u32) -> Self {
        Self {
            streams: HashMap::new(),
            highest_client: 0,
            next_push: 2,
            initial_window,
        }
    }

    /// Open a client-initiated stream from its first HEADERS frame.
    pub(crate) fn open(&mut self, id: u32, max_concurrent: u32) -> Result<&mut Stream, ErrorCode> {
        if id % 2 == 0 || id == 0 {
            return Err(ErrorCode::ProtocolError);
        }
        if id <= self.highest_client {
            // Reuse of an old id; its stream was reaped as closed.
            return Err(ErrorCode::StreamClosed);
        }
        if self.active_count() >= max_concurrent as usize {
            return Err(ErrorCode::RefusedStream);
        }

        self.highest_client = id;
        let initial = self.initial_window;
        Ok(self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, StreamState::Open, initial)))
    }

    /// Open a stream past the concurrency cap purely so its header
    /// block can run through the HPACK decoder; the connection refuses
    /// it with RST_STREAM right after.
    pub(crate) fn open_refused(&mut self, id: u32) {
        self.highest_client = self.highest_client.max(id);
        let mut stream = Stream::new(id, StreamState::Open, self.initial_window);
        stream.refused = true;
        self.streams.insert(id, stream);
    }

    /// Stream 1 of an h2c upgrade: the request arrived over HTTP/1.1,
    /// so the stream starts half-closed (remote).
    pub(crate) fn open_upgraded(&mut self) {
        self.highest_client = 1;
        self.streams.insert(
            1,
            Stream::new(1, StreamState::HalfClosedRemote, self.initial_window),
        );
    }

    /// Reserve an even server-initiated stream for a PUSH_PROMISE.
    pub(crate) fn reserve_push(&mut self) -> u32 {
        let id = self.next_push;
        self.next_push += 2;
        self.streams.insert(
            id,
            Stream::new(id, StreamState::ReservedLocal, self.initial_window),
        );
        id
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Whether a frame for `id` names a reaped (closed) stream rather
    /// than one that never existed.
    pub(crate) fn is_reaped(&self, id: u32) -> bool {
        !self.streams.contains_key(&id)
            && ((id % 2 == 1 && id <= self.highest_client)
                || (id % 2 == 0 && id < self.next_push))
    }

    pub(crate) fn reap(&mut self, id: u32) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !matches!(s.state, StreamState::Closed))
            .count()
    }

    pub(crate) fn ids(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }

    /// SETTINGS changed INITIAL_WINDOW_SIZE: adjust every open send
    /// window by the delta (section 6.9.2).
    pub(crate) fn adjust_send_windows(&mut self, new_initial: u32) {
        let delta = i64::from(new_initial) - i64::from(self.initial_window);
        self.initial_window = new_initial;
        for stream in self.streams.values_mut() {
            stream.send_window.shift(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_arithmetic() {
        let mut w = Window::new(65_535);
        w.narrow(1_000);
        assert_eq!(w.available(), 64_535);

        w.widen(1_000).unwrap();
        assert_eq!(w.available(), 65_535);

        // Overflow past 2^31-1 is a flow-control error.
        let mut w = Window::new(0x7FFF_FFFF);
        assert_eq!(w.widen(1), Err(ErrorCode::FlowControlError));

        // A settings shrink may drive the window negative.
        let mut w = Window::new(10);
        w.shift(-100);
        assert_eq!(w.available(), 0);
        w.widen(200).unwrap();
        assert_eq!(w.available(), 110);
    }

    #[test]
    fn lifecycle_request_response() {
        let mut stream = Stream::new(1, StreamState::Open, 65_535);

        stream.remote_closed();
        assert_eq!(stream.state, StreamState::HalfClosedRemote);
        assert!(!stream.may_receive_data());

        stream.local_closed();
        assert_eq!(stream.state, StreamState::Closed);
    }

    #[test]
    fn lifecycle_server_finishes_first() {
        let mut stream = Stream::new(1, StreamState::Open, 65_535);

        stream.local_closed();
        assert_eq!(stream.state, StreamState::HalfClosedLocal);
        assert!(stream.may_receive_data());

        stream.remote_closed();
        assert_eq!(stream.state, StreamState::Closed);
    }

    #[test]
    fn push_stream_lifecycle() {
        let mut table = StreamTable::new(65_535);
        let id = table.reserve_push();
        assert_eq!(id, 2);
        assert_eq!(table.reserve_push(), 4);

        let stream = table.get_mut(id).unwrap();
        assert_eq!(stream.state, StreamState::ReservedLocal);
        stream.local_closed();
        assert_eq!(stream.state, StreamState::Closed);
    }

    #[test]
    fn open_validations() {
        let mut table = StreamTable::new(65_535);

        assert!(table.open(1, 100).is_ok());
        assert!(table.open(3, 100).is_ok());

        // Even and zero ids are protocol errors for client streams.
        assert!(matches!(table.open(0, 100), Err(ErrorCode::ProtocolError)));
        assert!(matches!(table.open(4, 100), Err(ErrorCode::ProtocolError)));
        // Ids may only increase.
        assert!(matches!(table.open(1, 100), Err(ErrorCode::StreamClosed)));
        // Concurrency cap refuses, leaving the connection alive.
        assert!(matches!(table.open(5, 2), Err(ErrorCode::RefusedStream)));
    }

    #[test]
    fn reaping_is_lazy() {
        let mut table = StreamTable::new(65_535);
        table.open(1, 100).unwrap();
        table.open(3, 100).unwrap();

        assert!(table.reap(1).is_some());
        assert!(table.is_reaped(1), "old client id reads as closed");
        assert!(!table.is_reaped(3));
        assert!(!table.is_reaped(5), "future ids are idle, not closed");
        assert_eq!(table.active_count(), 1);
    }

    #[test]
    fn settings_adjust_open_send_windows() {
        let mut table = StreamTable::new(65_535);
        table.open(1, 100).unwrap();
        table.get_mut(1).unwrap().send_window.narrow(535);

        table.adjust_send_windows(16_384);
        let w = table.get_mut(1).unwrap().send_window;
        // 65535 - 535 + (16384 - 65535) = 15849
        assert_eq!(w.0, 15_849);
    }
}
