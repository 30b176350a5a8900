use std::net::IpAddr;

use libc::c_int;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::http::{Continuation, HttpResponse, StreamGenerator};
use crate::parser::ParserState;
use crate::tls::TlsSession;

/// What the next readiness event on this connection means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Accept,
    Handshake,
    Recv,
    Send,
    SendFile,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Close,
}

/// In-flight file transfer. The descriptor belongs to the worker's file
/// cache; the connection only tracks progress and must not close it.
pub struct FileSend {
    pub fd: c_int,
    pub size: i64,
    pub offset: i64,
}

/// Per-connection state, one slot of the fixed connection table. Hot fields
/// sit inline; request/response/file/stream state is boxed lazily on first
/// use so idle slots stay small.
pub struct Conn {
    pub fd: c_int,
    /// Stamped into completion tokens; mismatch means the slot was reused
    /// and the event is stale. Zero is reserved for non-connection tokens.
    pub generation: u32,
    pub event_type: EventType,
    pub conn_state: ConnState,
    pub parse: ParserState,

    pub is_stream_op: bool,
    pub is_file_op: bool,
    pub is_async_timer_op: bool,
    pub is_shutting_down: bool,
    pub stream_chunked: bool,
    pub handshake_done: bool,

    pub peer: Option<IpAddr>,
    pub tls: Option<Box<TlsSession>>,
    pub read_buf: ReadBuffer,
    pub write_buf: WriteBuffer,
    /// Parked response while an async delay is pending.
    pub response: Option<Box<HttpResponse>>,
    pub file: Option<Box<FileSend>>,
    pub stream: Option<StreamGenerator>,
    /// Continuations resumed when the async timer fires, innermost last.
    pub coro_stack: Vec<Continuation>,
}

impl Conn {
    pub fn empty() -> Self {
        Self {
            fd: -1,
            generation: 0,
            event_type: EventType::Accept,
            conn_state: ConnState::Alive,
            parse: ParserState::new(),
            is_stream_op: false,
            is_file_op: false,
            is_async_timer_op: false,
            is_shutting_down: false,
            stream_chunked: false,
            handshake_done: false,
            peer: None,
            tls: None,
            read_buf: ReadBuffer::new(),
            write_buf: WriteBuffer::new(),
            response: None,
            file: None,
            stream: None,
            coro_stack: Vec::new(),
        }
    }

    /// Keep-alive boundary: buffers emptied (capacity retained), request
    /// cycle state cleared, transport state kept.
    pub fn clear_for_next_request(&mut self) {
        self.read_buf.clear();
        self.write_buf.clear();
        self.parse.reset();
        self.is_stream_op = false;
        self.is_file_op = false;
        self.stream_chunked = false;
        self.response = None;
        self.file = None;
        self.stream = None;
    }

    /// Slot release: everything back to the empty state except the
    /// generation, which only moves forward at allocation.
    pub fn reset(&mut self) {
        self.fd = -1;
        self.event_type = EventType::Accept;
        self.conn_state = ConnState::Alive;
        self.parse.reset();
        self.is_stream_op = false;
        self.is_file_op = false;
        self.is_async_timer_op = false;
        self.is_shutting_down = false;
        self.stream_chunked = false;
        self.handshake_done = false;
        self.peer = None;
        self.tls = None;
        self.read_buf.release();
        self.write_buf.release();
        self.response = None;
        self.file = None;
        self.stream = None;
        self.coro_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The slot table holds max_connections of these; keep the inline part
    // bounded so the table stays cache-friendly.
    #[test]
    fn conn_stays_compact() {
        assert!(
            std::mem::size_of::<Conn>() <= 256,
            "Conn grew to {} bytes",
            std::mem::size_of::<Conn>()
        );
    }

    #[test]
    fn clear_keeps_transport_state() {
        let mut conn = Conn::empty();
        conn.fd = 9;
        conn.handshake_done = true;
        conn.read_buf.init(64);
        conn.read_buf.advance(10);
        conn.is_file_op = true;

        conn.clear_for_next_request();
        assert_eq!(conn.fd, 9);
        assert!(conn.handshake_done);
        assert_eq!(conn.read_buf.len(), 0);
        assert_eq!(conn.read_buf.capacity(), 64);
        assert!(!conn.is_file_op);
    }

    #[test]
    fn reset_releases_everything() {
        let mut conn = Conn::empty();
        conn.fd = 9;
        conn.read_buf.init(64);
        conn.peer = Some("127.0.0.1".parse().unwrap());

        conn.reset();
        assert_eq!(conn.fd, -1);
        assert!(conn.peer.is_none());
        assert!(!conn.read_buf.is_initialized());
    }
}
