use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use libc::c_int;

use crate::app::App;
use crate::config::Config;
use crate::conn::{Conn, ConnState, EventType, FileSend};
use crate::error::Result;
use crate::file_cache::FileCache;
use crate::http::{pages, StreamAction, StreamResult};
use crate::limiter::IpLimiter;
use crate::metrics::WorkerMetrics;
use crate::parser::ParsePhase;
use crate::slab::SlotAllocator;
use crate::syscalls::{self, Epoll, Event, ReactorTimers, EV_READ, EV_WRITE};
use crate::timer_heap::TimerHeap;
use crate::timer_wheel::TimerWheel;
use crate::tls::{TlsContext, TlsStatus};

// Completion tokens pack the slot generation in the high 32 bits and the
// slot index below. Generation zero marks the special descriptors.
const TOKEN_LISTEN: u64 = u32::MAX as u64;
const TOKEN_TICK_TIMER: u64 = (u32::MAX - 1) as u64;
const TOKEN_ASYNC_TIMER: u64 = (u32::MAX - 2) as u64;
const TOKEN_WAKE: u64 = (u32::MAX - 3) as u64;

const WHEEL_SLOTS: u32 = 1024;
const TICK_SECONDS: u32 = 1;
/// ±window for coalescing user timers onto one wakeup.
const ASYNC_COALESCE_MS: u64 = 10;

/// `<hex len>\r\n` fits in 10 bytes for any chunk a fixed write buffer holds.
const CHUNK_HEADER_RESERVE: usize = 10;
const CHUNK_TRAILER: usize = 2;
const CHUNK_END: &[u8] = b"0\r\n\r\n";

enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Closed,
    Fatal,
}

enum WriteOutcome {
    Progress(usize),
    /// TLS consumed `n` plaintext bytes but encrypted records are still
    /// queued; wait for writability, then flush.
    PartialPending(usize),
    WouldBlock,
    Closed,
    Fatal,
}

#[derive(PartialEq, Eq)]
pub(crate) enum Drain {
    Complete,
    Pending,
    Closed,
}

enum StreamStep {
    ChunkQueued,
    Finished,
    Aborted,
}

/// One worker's reactor: the single-threaded event loop owning every mutable
/// subsystem — connection table, timers, limiter, file cache, and the app's
/// routing state. Workers share nothing but the SO_REUSEPORT listener group.
pub struct Worker {
    pub(crate) cfg: Arc<Config>,
    pub(crate) app: App,
    pub(crate) metrics: Arc<WorkerMetrics>,

    epoll: Epoll,
    listen_fd: c_int,
    wake_rx: c_int,
    timers: ReactorTimers,

    pub(crate) conns: Box<[Conn]>,
    slots: SlotAllocator,
    pub(crate) wheel: TimerWheel,
    pub(crate) heap: TimerHeap,
    limiter: IpLimiter,
    pub(crate) file_cache: FileCache,
    tls: Option<Arc<TlsContext>>,

    start: Instant,
    expired_scratch: Vec<u32>,
}

impl Worker {
    /// `listen_fd` is this worker's own SO_REUSEPORT listener; `wake_rx` the
    /// read end of the shutdown pipe.
    pub fn new(
        cfg: Arc<Config>,
        app: App,
        tls: Option<Arc<TlsContext>>,
        listen_fd: c_int,
        wake_rx: c_int,
        metrics: Arc<WorkerMetrics>,
    ) -> Result<Self> {
        let net = &cfg.network;

        let slots = SlotAllocator::new(net.max_connections.min(u32::MAX as u64) as u32);
        let capacity = slots.capacity();

        let mut conns = Vec::with_capacity(capacity as usize);
        conns.resize_with(capacity as usize, Conn::empty);

        let epoll = Epoll::new()?;
        epoll.add(listen_fd, TOKEN_LISTEN, EV_READ)?;
        epoll.add_level(wake_rx, TOKEN_WAKE, EV_READ)?;
        let timers = ReactorTimers::new(&epoll, TOKEN_TICK_TIMER, TOKEN_ASYNC_TIMER, TICK_SECONDS)?;

        Ok(Self {
            limiter: IpLimiter::new(
                net.max_connections_per_ip,
                net.max_request_burst_per_ip,
                net.max_requests_per_ip_per_sec,
            ),
            file_cache: FileCache::new(cfg.os.file_cache_size as usize),
            wheel: TimerWheel::new(capacity, WHEEL_SLOTS, TICK_SECONDS as u64),
            heap: TimerHeap::new(),
            conns: conns.into_boxed_slice(),
            slots,
            epoll,
            listen_fd,
            wake_rx,
            timers,
            tls,
            start: Instant::now(),
            expired_scratch: Vec::new(),
            cfg,
            app,
            metrics,
        })
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Run until `shutdown` is raised (and the wake pipe breaks the wait).
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        let mut events = vec![Event::empty(); 1024];

        while !shutdown.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("event wait failed: {e}");
                    break;
                }
            };

            for i in 0..n {
                let ev = events[i];
                let gen = (ev.token >> 32) as u32;

                if gen == 0 {
                    match ev.token {
                        TOKEN_TICK_TIMER => self.on_tick(),
                        TOKEN_ASYNC_TIMER => self.on_async_timer(),
                        TOKEN_LISTEN => self.on_accept(&shutdown),
                        TOKEN_WAKE => syscalls::pipe_drain(self.wake_rx),
                        _ => {}
                    }
                    continue;
                }

                let idx = (ev.token & 0xFFFF_FFFF) as usize;
                if idx >= self.conns.len() {
                    continue;
                }
                // Stale completion: the slot was freed and possibly reused
                if !self.slots.is_allocated(idx as u32) || self.conns[idx].generation != gen {
                    continue;
                }

                self.on_conn_event(idx, ev.readable(), ev.writable(), ev.err_or_hup());
            }
        }

        self.shutdown_cleanup();
    }

    // ---- Special descriptors ----

    fn on_tick(&mut self) {
        self.timers.drain_tick();
        let now_tick = self.start.elapsed().as_secs();

        let mut expired = std::mem::take(&mut self.expired_scratch);
        self.wheel.tick(now_tick, &mut expired);

        for idx in expired.drain(..) {
            if !self.slots.is_allocated(idx) {
                continue;
            }
            let conn = &self.conns[idx as usize];
            // A connection already marked close finishes its send and cleans
            // up on its own; a hung async operation does not, so take it down
            if conn.conn_state != ConnState::Close
                || conn.is_async_timer_op
                || !conn.coro_stack.is_empty()
            {
                self.close(idx as usize, true);
            }
        }
        self.expired_scratch = expired;
    }

    fn on_async_timer(&mut self) {
        self.timers.drain_async();
        let now = self.now_ms();

        while let Some(key) = self.heap.pop_expired(now) {
            let idx = key as usize;
            if idx >= self.conns.len() || !self.slots.is_allocated(idx as u32) {
                continue;
            }
            self.conns[idx].is_async_timer_op = false;
            self.resume_continuations(idx);
        }

        // One-shot timer: re-arm for whatever is still pending
        self.update_async_timer();
    }

    fn on_accept(&mut self, shutdown: &Arc<AtomicBool>) {
        // No new work during graceful shutdown
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, Some(ip)))) => {
                    if !self.limiter.allow_connection(ip) {
                        syscalls::close_fd(fd);
                        continue;
                    }
                    let Some((idx, gen)) = self.slots.alloc() else {
                        // Out of slots: shed load immediately
                        self.limiter.release_connection(ip);
                        syscalls::close_fd(fd);
                        continue;
                    };

                    let conn = &mut self.conns[idx as usize];
                    conn.fd = fd;
                    conn.generation = gen;
                    conn.peer = Some(ip);

                    self.metrics.inc_conn();
                    self.register_accepted(idx as usize);
                }
                Ok(Some((fd, None))) => {
                    // Unknown address family
                    syscalls::close_fd(fd);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    /// Single epoll registration per connection (edge-triggered, both
    /// directions); `event_type` gates what each wakeup means afterwards.
    fn register_accepted(&mut self, idx: usize) {
        let token = ((self.conns[idx].generation as u64) << 32) | idx as u64;

        if let Some(tls) = &self.tls {
            let fd = self.conns[idx].fd;
            let Some(session) = tls.wrap(fd) else {
                self.close(idx, true);
                return;
            };
            self.conns[idx].tls = Some(session);

            match self.conns[idx].tls.as_mut().map(|s| s.handshake()) {
                Some(TlsStatus::Success) => {
                    self.conns[idx].event_type = EventType::Recv;
                    self.conns[idx].handshake_done = true;
                }
                Some(TlsStatus::WantRead) | Some(TlsStatus::WantWrite) => {
                    self.conns[idx].event_type = EventType::Handshake;
                }
                _ => {
                    self.close(idx, true);
                    return;
                }
            }
        } else {
            self.conns[idx].event_type = EventType::Recv;
        }

        let fd = self.conns[idx].fd;
        if self.epoll.add(fd, token, EV_READ | EV_WRITE).is_err() {
            self.close(idx, true);
            return;
        }

        // New connections may not sit idle forever
        self.wheel.schedule(idx as u32, self.cfg.network.idle_timeout as u64);
    }

    // ---- Per-connection events ----

    fn on_conn_event(&mut self, idx: usize, readable: bool, writable: bool, err: bool) {
        match self.conns[idx].event_type {
            EventType::Handshake => {
                match self.conns[idx].tls.as_mut().map(|s| s.handshake()) {
                    Some(TlsStatus::Success) => {
                        self.conns[idx].event_type = EventType::Recv;
                        self.conns[idx].handshake_done = true;
                        if readable {
                            self.receive(idx);
                        }
                    }
                    Some(TlsStatus::WantRead) | Some(TlsStatus::WantWrite) => {}
                    _ => self.close(idx, false),
                }
                return;
            }
            EventType::Shutdown => {
                match self.conns[idx].tls.as_mut().map(|s| s.shutdown()) {
                    Some(TlsStatus::WantRead) | Some(TlsStatus::WantWrite) => {}
                    _ => {
                        self.conns[idx].tls = None;
                        let fd = self.conns[idx].fd;
                        let _ = self.epoll.delete(fd);
                        self.release_connection(idx);
                    }
                }
                return;
            }
            _ => {}
        }

        if err {
            self.close(idx, false);
            return;
        }

        // Data while another operation is in flight is left in the socket
        // buffer; keep-alive pipelining is sequential by design
        if readable
            && self.conns[idx].event_type == EventType::Recv
            && !self.conns[idx].is_async_timer_op
            && self.conns[idx].coro_stack.is_empty()
        {
            let peer = self.conns[idx].peer;
            if let Some(ip) = peer {
                if !self.limiter.allow_request(ip) {
                    self.conns[idx].conn_state = ConnState::Close;
                    self.write_static(idx, pages::TOO_MANY_REQUESTS);
                    return;
                }
            }
            self.receive(idx);
        }

        if writable {
            match self.conns[idx].event_type {
                EventType::SendFile => self.send_file(idx),
                EventType::Send => self.do_write(idx),
                _ => {}
            }
        }
    }

    // ---- Read path ----

    fn ensure_read_ready(&mut self, idx: usize) -> bool {
        let incr = self.cfg.network.recv_buffer_incr;
        let conn = &mut self.conns[idx];
        if !conn.read_buf.is_initialized() {
            conn.read_buf.init(incr);
        }
        true
    }

    pub(crate) fn resume_receive(&mut self, idx: usize) {
        if !self.ensure_read_ready(idx) {
            return;
        }
        self.conns[idx].event_type = EventType::Recv;
    }

    /// Edge-triggered drain: read until would-block, growing the buffer when
    /// full, then hand the bytes to the engine exactly once.
    fn receive(&mut self, idx: usize) {
        if !self.ensure_read_ready(idx) {
            return;
        }

        let incr = self.cfg.network.recv_buffer_incr;
        let max = self.cfg.network.recv_buffer_max;
        let mut got_data = false;

        loop {
            {
                let conn = &mut self.conns[idx];
                if conn.read_buf.writable_region().is_empty() && !conn.read_buf.grow(incr, max) {
                    tracing::warn!("read buffer at its maximum; closing connection");
                    self.close(idx, false);
                    return;
                }
            }

            match Self::conn_read(&mut self.conns[idx]) {
                ReadOutcome::Data(n) => {
                    self.conns[idx].read_buf.advance(n as u32);
                    got_data = true;
                }
                ReadOutcome::Closed => {
                    self.close(idx, false);
                    return;
                }
                ReadOutcome::WouldBlock => {
                    self.conns[idx].event_type = EventType::Recv;
                    break;
                }
                ReadOutcome::Fatal => {
                    self.close(idx, false);
                    return;
                }
            }
        }

        if got_data {
            self.handle_request(idx);
        }
    }

    fn conn_read(conn: &mut Conn) -> ReadOutcome {
        let fd = conn.fd;
        let region = conn.read_buf.writable_region();

        match conn.tls.as_mut() {
            None => match syscalls::recv(fd, region) {
                Ok(0) => ReadOutcome::Closed,
                Ok(n) => ReadOutcome::Data(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                Err(_) => ReadOutcome::Fatal,
            },
            Some(tls) => match tls.read(region) {
                (TlsStatus::Success, n) => ReadOutcome::Data(n),
                (TlsStatus::WantRead, _) | (TlsStatus::WantWrite, _) => ReadOutcome::WouldBlock,
                (TlsStatus::Closed, _) => ReadOutcome::Closed,
                _ => ReadOutcome::Fatal,
            },
        }
    }

    // ---- Write path ----

    /// Fire-and-forget static response (error pages, `100 Continue`).
    /// Delivery is not tracked; the connection then follows the normal
    /// close-or-rearm logic.
    pub(crate) fn write_static(&mut self, idx: usize, page: &'static str) {
        {
            let conn = &mut self.conns[idx];
            match conn.tls.as_mut() {
                None => {
                    let _ = syscalls::send(conn.fd, page.as_bytes());
                }
                Some(tls) => {
                    let _ = tls.write(page.as_bytes());
                }
            }
        }
        self.on_write_complete(idx);
    }

    /// Drain the write buffer. Sets `EVENT_SEND` and reports `Pending` on
    /// would-block; closes on transport failure.
    pub(crate) fn drain_write(&mut self, idx: usize) -> Drain {
        // Flush any TLS records left from the previous call first
        {
            let conn = &mut self.conns[idx];
            if let Some(tls) = conn.tls.as_mut() {
                match tls.flush() {
                    TlsStatus::Success => {}
                    TlsStatus::WantWrite => {
                        conn.event_type = EventType::Send;
                        return Drain::Pending;
                    }
                    _ => {
                        self.close(idx, false);
                        return Drain::Closed;
                    }
                }
            }
        }

        let mut sent_total: u64 = 0;
        let result = loop {
            let conn = &mut self.conns[idx];
            if conn.write_buf.unsent().is_empty() {
                break Drain::Complete;
            }

            match Self::conn_write(conn) {
                WriteOutcome::Progress(n) => {
                    conn.write_buf.mark_sent(n as u32);
                    sent_total += n as u64;
                }
                WriteOutcome::PartialPending(n) => {
                    conn.write_buf.mark_sent(n as u32);
                    sent_total += n as u64;
                    conn.event_type = EventType::Send;
                    break Drain::Pending;
                }
                WriteOutcome::WouldBlock => {
                    conn.event_type = EventType::Send;
                    break Drain::Pending;
                }
                WriteOutcome::Closed | WriteOutcome::Fatal => {
                    self.close(idx, false);
                    sent_total = 0;
                    break Drain::Closed;
                }
            }
        };

        if sent_total > 0 {
            self.metrics.add_bytes(sent_total);
        }
        result
    }

    fn conn_write(conn: &mut Conn) -> WriteOutcome {
        let fd = conn.fd;
        let buf = conn.write_buf.unsent();

        match conn.tls.as_mut() {
            None => match syscalls::send(fd, buf) {
                Ok(0) => WriteOutcome::Closed,
                Ok(n) => WriteOutcome::Progress(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
                Err(_) => WriteOutcome::Fatal,
            },
            Some(tls) => match tls.write(buf) {
                (TlsStatus::Success, n) => WriteOutcome::Progress(n),
                (TlsStatus::WantWrite, n) => WriteOutcome::PartialPending(n),
                (TlsStatus::Closed, _) => WriteOutcome::Closed,
                _ => WriteOutcome::Fatal,
            },
        }
    }

    /// Entry point for EVENT_SEND readiness and post-serialize hand-off.
    pub(crate) fn do_write(&mut self, idx: usize) {
        if self.drain_write(idx) == Drain::Complete {
            self.on_write_complete(idx);
        }
    }

    fn on_write_complete(&mut self, idx: usize) {
        let conn = &self.conns[idx];

        if conn.is_stream_op && conn.stream.is_some() {
            self.stream_pump(idx);
            return;
        }
        if conn.is_file_op {
            self.send_file(idx);
            return;
        }
        if conn.conn_state == ConnState::Close {
            self.close(idx, false);
            return;
        }

        // Keep-alive. A completed cycle (parser back at Idle) clears the
        // buffers; a mid-cycle control line like `100 Continue` must leave
        // the parse state and buffered bytes alone.
        if self.conns[idx].parse.phase == ParsePhase::Idle {
            self.conns[idx].clear_for_next_request();
        }
        self.resume_receive(idx);
    }

    // ---- File send ----

    /// Zero-copy transfer loop; over TLS the adapter reports `NoImpl` and
    /// the transfer restarts as a fixed (non-chunked) stream of pread chunks.
    pub(crate) fn send_file(&mut self, idx: usize) {
        if self.conns[idx].file.is_none() {
            tracing::warn!("send_file without file state");
            self.conns[idx].conn_state = ConnState::Close;
            self.write_static(idx, pages::INTERNAL_ERROR);
            return;
        }

        // The record layer rules out kernel zero-copy: the adapter would
        // answer NoImpl, so switch straight to the pread stream
        if self.conns[idx].tls.is_some() {
            self.switch_file_to_stream(idx);
            self.stream_pump(idx);
            return;
        }

        let mut sent_total: u64 = 0;
        loop {
            let conn = &mut self.conns[idx];
            let file = conn.file.as_deref_mut().expect("checked above");
            if file.offset >= file.size {
                break;
            }
            let remaining = (file.size - file.offset) as usize;

            match syscalls::sendfile(conn.fd, file.fd, &mut file.offset, remaining) {
                Ok(0) => break, // premature EOF: treat what we have as done
                Ok(n) => {
                    sent_total += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    conn.event_type = EventType::SendFile;
                    if sent_total > 0 {
                        self.metrics.add_bytes(sent_total);
                    }
                    return;
                }
                Err(_) => {
                    self.close(idx, false);
                    return;
                }
            }
        }
        if sent_total > 0 {
            self.metrics.add_bytes(sent_total);
        }

        if self.conns[idx].conn_state == ConnState::Close {
            self.close(idx, false);
        } else {
            self.conns[idx].clear_for_next_request();
            self.resume_receive(idx);
        }
    }

    /// TLS cannot sendfile; turn the remaining range into a pread-driven
    /// fixed stream (the head already carried Content-Length).
    fn switch_file_to_stream(&mut self, idx: usize) {
        let conn = &mut self.conns[idx];
        let file = conn.file.take().expect("file state required");
        let close_after = conn.conn_state == ConnState::Close;
        let mut file = *file;

        conn.is_file_op = false;
        conn.is_stream_op = true;
        conn.stream_chunked = false;
        conn.stream = Some(Box::new(move |buf: &mut [u8]| {
            let remaining = (file.size - file.offset).max(0) as usize;
            if remaining == 0 {
                return StreamResult {
                    written: 0,
                    action: if close_after { StreamAction::StopClose } else { StreamAction::StopKeepAlive },
                };
            }
            let want = buf.len().min(remaining);
            match syscalls::pread(file.fd, &mut buf[..want], file.offset) {
                Ok(0) => StreamResult {
                    written: 0,
                    action: if close_after { StreamAction::StopClose } else { StreamAction::StopKeepAlive },
                },
                Ok(n) => {
                    file.offset += n as i64;
                    StreamResult {
                        written: n,
                        action: StreamAction::Continue,
                    }
                }
                Err(_) => StreamResult {
                    written: 0,
                    action: StreamAction::StopClose,
                },
            }
        }));
    }

    // ---- Stream path ----

    /// Pump generator chunks through the write buffer until the generator
    /// stops or the socket pushes back.
    pub(crate) fn stream_pump(&mut self, idx: usize) {
        loop {
            match self.stream_chunk_once(idx) {
                StreamStep::ChunkQueued => match self.drain_write(idx) {
                    Drain::Complete => continue,
                    Drain::Pending | Drain::Closed => return,
                },
                StreamStep::Finished | StreamStep::Aborted => return,
            }
        }
    }

    fn stream_chunk_once(&mut self, idx: usize) -> StreamStep {
        if self.conns[idx].stream.is_none() {
            tracing::warn!("stream resume without a generator");
            self.close(idx, false);
            return StreamStep::Aborted;
        }

        // Each chunk owns the whole buffer; the previous one was fully sent
        let send_max = self.cfg.network.send_buffer_max;
        let (written, action, chunk_cap) = {
            let conn = &mut self.conns[idx];
            conn.write_buf.init(send_max);
            conn.write_buf.clear();

            let chunked = conn.stream_chunked;
            let raw = conn.write_buf.raw_mut();
            if raw.is_empty() || (chunked && raw.len() <= CHUNK_HEADER_RESERVE + CHUNK_TRAILER) {
                self.close(idx, false);
                return StreamStep::Aborted;
            }

            let region = if chunked {
                let cap = raw.len() - CHUNK_TRAILER;
                &mut raw[CHUNK_HEADER_RESERVE..cap]
            } else {
                raw
            };
            let cap = region.len();

            let generator = conn.stream.as_mut().expect("checked above");
            let result = generator(region);
            (result.written, result.action, cap)
        };

        // Every delivered chunk buys the connection more time
        self.wheel.schedule(idx as u32, self.cfg.network.idle_timeout as u64);

        match action {
            StreamAction::Continue => {
                if written == 0 || written > chunk_cap {
                    self.close(idx, false);
                    return StreamStep::Aborted;
                }

                let conn = &mut self.conns[idx];
                if !conn.stream_chunked {
                    conn.write_buf.set_data_len(written as u32);
                    return StreamStep::ChunkQueued;
                }

                // Chunk framing: the hex length header is written backwards
                // from the chunk start so no gap is sent; the send cursor
                // skips the unused reserve bytes.
                let mut header = [0u8; CHUNK_HEADER_RESERVE];
                let header_len = {
                    use std::io::Write;
                    let mut cur = std::io::Cursor::new(&mut header[..]);
                    let _ = write!(cur, "{written:X}\r\n");
                    cur.position() as usize
                };
                if header_len == 0 || header_len > CHUNK_HEADER_RESERVE {
                    self.close(idx, false);
                    return StreamStep::Aborted;
                }

                let raw = conn.write_buf.raw_mut();
                let start = CHUNK_HEADER_RESERVE - header_len;
                raw[start..CHUNK_HEADER_RESERVE].copy_from_slice(&header[..header_len]);
                let trailer_at = CHUNK_HEADER_RESERVE + written;
                raw[trailer_at] = b'\r';
                raw[trailer_at + 1] = b'\n';

                conn.write_buf.set_data_len((trailer_at + CHUNK_TRAILER) as u32);
                conn.write_buf.skip_sent(start as u32);
                StreamStep::ChunkQueued
            }

            StreamAction::StopKeepAlive | StreamAction::StopClose => {
                let was_chunked;
                {
                    let conn = &mut self.conns[idx];
                    conn.conn_state = if action == StreamAction::StopKeepAlive {
                        ConnState::Alive
                    } else {
                        ConnState::Close
                    };

                    was_chunked = conn.stream_chunked;
                    conn.write_buf.clear();
                    conn.is_stream_op = false;
                    conn.stream_chunked = false;
                    conn.stream = None;
                }

                if was_chunked {
                    // Terminal chunk closes the framing
                    if self.conns[idx].write_buf.append(CHUNK_END) {
                        self.do_write(idx);
                    } else {
                        self.close(idx, false);
                    }
                } else if self.conns[idx].conn_state == ConnState::Alive {
                    self.conns[idx].clear_for_next_request();
                    self.resume_receive(idx);
                } else {
                    self.close(idx, false);
                }
                StreamStep::Finished
            }
        }
    }

    // ---- Async timers ----

    /// Park the connection on the timer heap; at most one pending entry per
    /// connection (duplicate inserts are rejected by the heap).
    pub(crate) fn arm_async_delay(&mut self, idx: usize, delay_ms: u32) -> bool {
        let expire = self.now_ms() + delay_ms as u64;
        if !self.heap.insert(idx as u64, expire, ASYNC_COALESCE_MS) {
            tracing::warn!("async timer refresh failed for an already scheduled connection");
            return false;
        }
        self.conns[idx].is_async_timer_op = true;
        self.update_async_timer();
        true
    }

    fn update_async_timer(&mut self) {
        match self.heap.min() {
            None => {
                let _ = self.timers.disarm_async(&self.epoll);
            }
            Some(min) => {
                let now = self.now_ms();
                let remain = if min.expire_ms <= now { 1 } else { min.expire_ms - now };
                if let Err(e) = self.timers.arm_async_ms(&self.epoll, remain) {
                    tracing::error!("failed to arm the async timer: {e}");
                }
            }
        }
    }

    // ---- Close / teardown ----

    /// Graceful close unless `force`; force skips the TLS close_notify
    /// exchange and is what timeout and shutdown paths use.
    pub(crate) fn close(&mut self, idx: usize, force: bool) {
        let conn = &mut self.conns[idx];
        if !force && conn.is_shutting_down {
            return;
        }
        conn.is_shutting_down = true;

        if conn.tls.is_some() {
            if force {
                conn.tls = None;
            } else {
                match conn.tls.as_mut().map(|s| s.shutdown()) {
                    Some(TlsStatus::WantRead) | Some(TlsStatus::WantWrite) => {
                        // Event loop finishes the close_notify exchange
                        conn.event_type = EventType::Shutdown;
                        return;
                    }
                    _ => conn.tls = None,
                }
            }
        }

        let fd = conn.fd;
        let _ = self.epoll.delete(fd);
        self.release_connection(idx);
    }

    fn release_connection(&mut self, idx: usize) {
        self.metrics.dec_conn();

        // Timeout-wheel slot dies with the connection; an async heap entry
        // must go too or a stale fire would hit the slot's next tenant
        self.wheel.cancel(idx as u32);
        if self.conns[idx].is_async_timer_op {
            if self.heap.remove(idx as u64) {
                self.update_async_timer();
            } else {
                tracing::warn!("failed to cancel an async timer during connection release");
            }
        }

        let conn = &mut self.conns[idx];
        if conn.fd > 0 {
            syscalls::close_fd(conn.fd);
        }
        if let Some(ip) = conn.peer {
            self.limiter.release_connection(ip);
        }

        self.conns[idx].reset();
        self.slots.free(idx as u32);
    }

    fn shutdown_cleanup(&mut self) {
        syscalls::close_fd(self.listen_fd);

        for idx in 0..self.conns.len() {
            if self.slots.is_allocated(idx as u32) {
                self.close(idx, true);
            }
        }
        tracing::info!("worker drained and stopped");
    }
}
