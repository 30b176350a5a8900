//! Core engine: turns parse outcomes into responses. Implemented as further
//! `Worker` methods so the dispatch path shares the reactor's connection
//! table without indirection; the reactor half lives in `worker.rs`.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::conn::{ConnState, FileSend};
use crate::http::{pages, HttpResponse, Status};
use crate::parser::{self, ParseErrorKind, ParseLimits, ParseOutcome};
use crate::response::Response;
use crate::serializer::{self, SerializeResult};
use crate::worker::Worker;

/// What the dispatch scope decided; acted on after the request views into
/// the read buffer are gone.
enum Directive {
    /// Refresh the wheel to this many seconds and keep receiving.
    Resume(u16),
    /// Send `100 Continue`, refresh the body deadline, keep receiving.
    Continue100,
    /// Static page, connection closes.
    Reject(&'static str),
    /// Full response ready for serialization.
    Respond(Box<HttpResponse>, bool),
    /// Handler deferred; arm the async timer.
    Defer(u32),
}

impl Worker {
    /// Engine request callback: invoked by the reactor once per read drain.
    pub(crate) fn handle_request(&mut self, idx: usize) {
        let net = self.cfg.network.clone();
        let limits = ParseLimits {
            max_header_size: net.max_header_size,
            max_header_count: net.max_header_count,
            max_body_size: net.max_body_size,
            max_recv_buffer: net.recv_buffer_max,
        };

        let directive = {
            let Worker { conns, app, metrics, cfg, .. } = &mut *self;
            let conn = &mut conns[idx];

            let outcome = {
                let (state, data) = (&mut conn.parse, conn.read_buf.data_mut());
                parser::parse(state, data, &limits)
            };

            match outcome {
                ParseOutcome::IncompleteHeaders => {
                    conn.conn_state = ConnState::Alive;
                    Directive::Resume(net.header_timeout)
                }
                ParseOutcome::IncompleteBody => {
                    conn.conn_state = ConnState::Alive;
                    Directive::Resume(net.body_timeout)
                }
                ParseOutcome::Expect100 => {
                    conn.conn_state = ConnState::Alive;
                    Directive::Continue100
                }
                ParseOutcome::Expect417 => Directive::Reject(pages::EXPECTATION_FAILED),
                ParseOutcome::Error(ParseErrorKind::BadRequest) => Directive::Reject(pages::BAD_REQUEST),
                ParseOutcome::Error(ParseErrorKind::PayloadTooLarge) => {
                    Directive::Reject(pages::PAYLOAD_TOO_LARGE)
                }
                ParseOutcome::StreamingBody => Directive::Reject(pages::NOT_IMPLEMENTED),

                ParseOutcome::Success(mut req) => {
                    metrics.inc_req();

                    let mut res = Box::new(HttpResponse::new());
                    res.version = req.version;
                    res.global_data = app.user_data;

                    // 1.0 closes unless asked to stay, 1.1 stays unless told
                    // to close
                    let conn_header = req.header("Connection");
                    let should_close = if req.version.defaults_to_keep_alive() {
                        conn_header.is_some_and(|v| v.eq_ignore_ascii_case("close"))
                    } else {
                        !conn_header.is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
                    };

                    let mut panicked = false;
                    if let Some(rel) = req.path.strip_prefix("/public/") {
                        // Static shortcut bypassing the router entirely
                        let full = format!("{}/{}", cfg.project.public_dir, rel);
                        res.set_status(Status::Ok);
                        res.send_file(full, true);
                    } else {
                        match app.router.match_route(req.method, req.path, &mut req.segments) {
                            None => {
                                res.set_status(Status::NotFound);
                                res.send_text_static("404: Route not found :(");
                            }
                            Some(node) => {
                                let handler = node.handler().expect("matched node carries a handler");
                                let route_id = node.route_id();

                                let mut builder = Response::new(&mut res, &app.templates);
                                if app.middleware.execute(route_id, &req, &mut builder) {
                                    let run = catch_unwind(AssertUnwindSafe(|| {
                                        handler(&req, &mut builder);
                                    }));
                                    panicked = run.is_err();
                                }
                            }
                        }
                    }

                    if panicked {
                        tracing::error!("handler panicked; answering 500 and closing");
                        Directive::Reject(pages::INTERNAL_ERROR)
                    } else if let Some((delay_ms, cont)) = res.pending_delay.take() {
                        // Handler deferred: park the response on the context
                        conn.conn_state = if should_close { ConnState::Close } else { ConnState::Alive };
                        conn.coro_stack.push(cont);
                        conn.response = Some(res);
                        Directive::Defer(delay_ms)
                    } else {
                        conn.parse.reset();
                        Directive::Respond(res, should_close)
                    }
                }
            }
        };

        match directive {
            Directive::Resume(timeout) => {
                self.wheel.schedule(idx as u32, timeout as u64);
                self.resume_receive(idx);
            }
            Directive::Continue100 => {
                self.wheel.schedule(idx as u32, net.body_timeout as u64);
                self.write_static(idx, pages::CONTINUE_100);
            }
            Directive::Reject(page) => {
                self.conns[idx].conn_state = ConnState::Close;
                self.write_static(idx, page);
            }
            Directive::Respond(res, should_close) => {
                self.wheel.schedule(idx as u32, net.idle_timeout as u64);
                self.handle_response(*res, idx, should_close);
            }
            Directive::Defer(delay_ms) => {
                // Async work gets the body deadline as its leash; expiry
                // force-closes a hung operation
                self.wheel.schedule(idx as u32, net.body_timeout as u64);
                if !self.arm_async_delay(idx, delay_ms) {
                    self.conns[idx].coro_stack.clear();
                    self.conns[idx].response = None;
                    self.conns[idx].conn_state = ConnState::Close;
                    self.write_static(idx, pages::INTERNAL_ERROR);
                }
            }
        }
    }

    /// Serialize and hand the response to the reactor. File operations are
    /// resolved through the descriptor cache *before* the head goes out so a
    /// miss can still become a clean 404/500.
    pub(crate) fn handle_response(&mut self, mut res: HttpResponse, idx: usize, should_close: bool) {
        res.set_header("Connection", if should_close { "close" } else { "keep-alive" });

        if res.is_file_operation() {
            let req = res.take_file_request().expect("file op carries a request");
            match self.file_cache.get(&req.path) {
                Ok((fd, size)) => {
                    let mut len = itoa::Buffer::new();
                    res.set_header("Content-Length", len.format(size));
                    self.conns[idx].file = Some(Box::new(FileSend {
                        fd,
                        size: size as i64,
                        offset: 0,
                    }));
                    self.conns[idx].is_file_op = true;
                }
                Err(e) => {
                    tracing::warn!("file send failed to open '{}': {e}", req.path);
                    let status = if req.auto_404 { Status::NotFound } else { Status::InternalServerError };
                    let version = res.version;
                    res = HttpResponse::new();
                    res.version = version;
                    res.set_status(status);
                    res.send_text_static(match status {
                        Status::NotFound => "File not found",
                        _ => "File unavailable",
                    });
                    res.set_header("Connection", if should_close { "close" } else { "keep-alive" });
                }
            }
        }

        if res.is_stream_operation() {
            let conn = &mut self.conns[idx];
            conn.is_stream_op = true;
            conn.stream_chunked = res.operation() == crate::http::OperationType::StreamChunked;
            conn.stream = res.take_stream();
            if conn.stream.is_none() {
                tracing::error!("stream operation without a generator");
                self.close(idx, false);
                return;
            }
        }

        // Decided before the write so the post-drain logic can close or
        // keep alive without re-deriving it
        self.conns[idx].conn_state = if should_close { ConnState::Close } else { ConnState::Alive };

        let send_max = self.cfg.network.send_buffer_max;
        let outcome = serializer::serialize(&res, &mut self.conns[idx].write_buf, send_max);
        match outcome {
            SerializeResult::Success => self.do_write(idx),
            SerializeResult::Insufficient => {
                tracing::error!("response head does not fit the send buffer; answering 500");
                self.conns[idx].write_buf.clear();
                self.conns[idx].is_file_op = false;
                self.conns[idx].is_stream_op = false;
                self.conns[idx].stream = None;
                self.conns[idx].conn_state = ConnState::Close;
                self.write_static(idx, pages::INTERNAL_ERROR);
            }
            SerializeResult::Failed => {
                tracing::error!("failed to serialize response");
                self.close(idx, false);
            }
        }
    }

    /// Resume the continuation stack after the async timer fired. Each
    /// continuation may finish the response, schedule another delay, or
    /// fail; the connection context is the explicit carrier throughout.
    pub(crate) fn resume_continuations(&mut self, idx: usize) {
        loop {
            let Some(mut cont) = self.conns[idx].coro_stack.pop() else {
                self.finish_async_response(idx);
                return;
            };
            let Some(mut res) = self.conns[idx].response.take() else {
                tracing::error!("async resume without a parked response");
                self.close(idx, true);
                return;
            };

            let status = cont(&mut res);

            if let Some((delay_ms, inner)) = res.pending_delay.take() {
                // Another hop: repark everything and rearm
                self.conns[idx].coro_stack.push(inner);
                self.conns[idx].response = Some(res);
                if !self.arm_async_delay(idx, delay_ms) {
                    self.conns[idx].coro_stack.clear();
                    self.conns[idx].response = None;
                    self.conns[idx].conn_state = ConnState::Close;
                    self.write_static(idx, pages::INTERNAL_ERROR);
                }
                return;
            }

            self.conns[idx].response = Some(res);
            match status {
                crate::http::AsyncStatus::Completed => continue,
                crate::http::AsyncStatus::Failed => {
                    self.conns[idx].coro_stack.clear();
                    self.conns[idx].response = None;
                    self.conns[idx].conn_state = ConnState::Close;
                    self.write_static(idx, pages::INTERNAL_ERROR);
                    return;
                }
            }
        }
    }

    fn finish_async_response(&mut self, idx: usize) {
        let Some(res) = self.conns[idx].response.take() else {
            self.close(idx, true);
            return;
        };
        let should_close = self.conns[idx].conn_state == ConnState::Close;

        self.conns[idx].parse.reset();
        self.wheel.schedule(idx as u32, self.cfg.network.idle_timeout as u64);
        self.handle_response(*res, idx, should_close);
    }
}
