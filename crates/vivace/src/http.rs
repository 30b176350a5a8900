use std::borrow::Cow;
use std::sync::Arc;

use crate::template::TemplateEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Only GET and POST are served; anything else is a 400 at parse time.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http09,
    Http10,
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"HTTP/1.1" => Some(Version::Http11),
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/0.9" => Some(Version::Http09),
            _ => None,
        }
    }

    /// Keep-alive default when no Connection header overrides it.
    pub fn defaults_to_keep_alive(self) -> bool {
        matches!(self, Version::Http11)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Continue = 100,
    Ok = 200,
    Created = 201,
    NoContent = 204,
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    PayloadTooLarge = 413,
    UriTooLong = 414,
    ExpectationFailed = 417,
    TooManyRequests = 429,
    InternalServerError = 500,
    NotImplemented = 501,
    ServiceUnavailable = 503,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Continue => "Continue",
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::NoContent => "No Content",
            Status::MovedPermanently => "Moved Permanently",
            Status::Found => "Found",
            Status::NotModified => "Not Modified",
            Status::BadRequest => "Bad Request",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::PayloadTooLarge => "Payload Too Large",
            Status::UriTooLong => "URI Too Long",
            Status::ExpectationFailed => "Expectation Failed",
            Status::TooManyRequests => "Too Many Requests",
            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }
}

// ---- Static error responses ----
//
// Fire-and-forget pages written straight to the socket, bypassing the
// serializer. Keep-alive is always suppressed on these.
pub mod pages {
    pub const CONTINUE_100: &str = "HTTP/1.1 100 Continue\r\n\r\n";

    pub const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 11\r\n\r\nBad Request";

    pub const FORBIDDEN: &str = "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 9\r\n\r\nForbidden";

    pub const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 9\r\n\r\nNot Found";

    pub const METHOD_NOT_ALLOWED: &str = "HTTP/1.1 405 Method Not Allowed\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 18\r\n\r\nMethod Not Allowed";

    pub const PAYLOAD_TOO_LARGE: &str = "HTTP/1.1 413 Payload Too Large\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 17\r\n\r\nPayload Too Large";

    pub const URI_TOO_LONG: &str = "HTTP/1.1 414 URI Too Long\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 12\r\n\r\nURI Too Long";

    pub const EXPECTATION_FAILED: &str = "HTTP/1.1 417 Expectation Failed\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 18\r\n\r\nExpectation Failed";

    pub const TOO_MANY_REQUESTS: &str = "HTTP/1.1 429 Too Many Requests\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 17\r\n\r\nToo Many Requests";

    pub const INTERNAL_ERROR: &str = "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 21\r\n\r\nInternal Server Error";

    pub const NOT_IMPLEMENTED: &str = "HTTP/1.1 501 Not Implemented\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 15\r\n\r\nNot Implemented";

    pub const SERVICE_UNAVAILABLE: &str = "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain; charset=UTF-8\r\nConnection: close\r\nContent-Length: 19\r\n\r\nService Unavailable";
}

// ---- Request side ----

/// Case-insensitive header view borrowed from the connection's read buffer.
pub struct Headers<'a> {
    entries: Vec<(&'a str, &'a str)>,
}

impl<'a> Headers<'a> {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
        }
    }

    pub fn push(&mut self, name: &'a str, value: &'a str) {
        self.entries.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.entries.iter().copied()
    }
}

/// A dynamic route segment, typed at registration and parsed at match time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathSegment<'a> {
    Uint(u64),
    Int(i64),
    Str(&'a str),
    Uuid(uuid::Uuid),
}

impl<'a> PathSegment<'a> {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            PathSegment::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PathSegment::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            PathSegment::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<uuid::Uuid> {
        match self {
            PathSegment::Uuid(v) => Some(*v),
            _ => None,
        }
    }
}

/// A fully parsed request. Everything borrows the connection read buffer; the
/// path has been normalized in place before this exists.
pub struct Request<'a> {
    pub method: Method,
    pub version: Version,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: Headers<'a>,
    pub body: &'a [u8],
    pub segments: Vec<PathSegment<'a>>,
}

impl<'a> Request<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name)
    }

    pub fn segment(&self, idx: usize) -> Option<&PathSegment<'a>> {
        self.segments.get(idx)
    }
}

// ---- Response side ----

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Continue,
    StopKeepAlive,
    StopClose,
}

pub struct StreamResult {
    pub written: usize,
    pub action: StreamAction,
}

/// Fills the supplied write-buffer region and says how to proceed. Called by
/// the reactor once per drained chunk.
pub type StreamGenerator = Box<dyn FnMut(&mut [u8]) -> StreamResult>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationType {
    Text,
    File,
    StreamChunked,
    StreamFixed,
}

/// Response body: set at most once, over exactly one of these shapes.
pub enum Body {
    Empty,
    Static(&'static str),
    Owned(String),
    Stream(StreamGenerator),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Static(s) => s.len(),
            Body::Owned(s) => s.len(),
            Body::Stream(_) => 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Static(s) => s.as_bytes(),
            Body::Owned(s) => s.as_bytes(),
            Body::Stream(_) => &[],
        }
    }
}

/// File to be sent by the reactor. `path` may share ownership with the
/// immutable template map.
pub struct FileSendRequest {
    pub path: Arc<str>,
    pub auto_404: bool,
}

pub enum AsyncStatus {
    Completed,
    Failed,
}

/// Continuation resumed by the reactor when a user-scheduled delay fires.
/// The connection context is handed back explicitly through the parked
/// response.
pub type Continuation = Box<dyn FnMut(&mut HttpResponse) -> AsyncStatus>;

/// Engine-owned response state. User code manipulates it through the
/// [`crate::response::Response`] builder, which delegates via the dispatch
/// table.
pub struct HttpResponse {
    pub status: Status,
    pub version: Version,
    headers: Vec<(Cow<'static, str>, String)>,
    pub body: Body,
    op: OperationType,
    file: Option<FileSendRequest>,
    pub(crate) pending_delay: Option<(u32, Continuation)>,
    pub(crate) global_data: *mut std::ffi::c_void,
}

/// Unrecoverable user programming error: diagnostic, then worker exit.
/// Handler panics are recoverable (500); misuse of the response builder is
/// not.
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    std::process::exit(1);
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            status: Status::Ok,
            version: Version::Http11,
            headers: Vec::new(),
            body: Body::Empty,
            op: OperationType::Text,
            file: None,
            pending_delay: None,
            global_data: std::ptr::null_mut(),
        }
    }

    pub fn set_status(&mut self, status: Status) -> &mut Self {
        self.status = status;
        self
    }

    /// Insert or replace a header (case-insensitive on the name). Insertion
    /// order is what the serializer emits.
    pub fn set_header(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            slot.1 = value;
        } else {
            self.headers.push((key, value));
        }
        self
    }

    pub fn headers(&self) -> &[(Cow<'static, str>, String)] {
        &self.headers
    }

    pub fn operation(&self) -> OperationType {
        self.op
    }

    pub fn is_file_operation(&self) -> bool {
        self.op == OperationType::File
    }

    pub fn is_stream_operation(&self) -> bool {
        matches!(self.op, OperationType::StreamChunked | OperationType::StreamFixed)
    }

    pub fn file_request(&self) -> Option<&FileSendRequest> {
        self.file.as_ref()
    }

    pub(crate) fn take_file_request(&mut self) -> Option<FileSendRequest> {
        self.file.take()
    }

    /// Move the generator out for the reactor; the body is spent afterwards.
    pub(crate) fn take_stream(&mut self) -> Option<StreamGenerator> {
        match std::mem::replace(&mut self.body, Body::Empty) {
            Body::Stream(generator) => Some(generator),
            other => {
                self.body = other;
                None
            }
        }
    }

    fn guard_body_unset(&self, func: &str) {
        if !matches!(self.body, Body::Empty) || self.op != OperationType::Text || self.file.is_some() {
            fatal(&format!("HttpResponse: {func} called after response body already set"));
        }
    }

    pub fn send_text_static(&mut self, text: &'static str) {
        self.guard_body_unset("send_text");
        let mut len = itoa::Buffer::new();
        self.set_header("Content-Length", len.format(text.len()));
        self.set_header("Content-Type", "text/plain");
        self.body = Body::Static(text);
    }

    pub fn send_text(&mut self, text: String) {
        self.set_text_body(text, "text/plain");
    }

    pub fn send_json(&mut self, json: &serde_json::Value) {
        self.set_text_body(json.to_string(), "application/json");
    }

    /// Queue a file send. Size and existence are resolved by the engine when
    /// the response is handed off (a miss becomes 404/500 there, depending
    /// on `auto_404`); only the Content-Type is decided here.
    pub fn send_file(&mut self, path: String, auto_404: bool) {
        self.guard_body_unset("send_file");

        let mime = mime_guess::from_path(&path).first_or_octet_stream();
        self.set_header("Content-Type", mime.essence_str().to_string());
        self.op = OperationType::File;
        self.file = Some(FileSendRequest {
            path: Arc::from(path.as_str()),
            auto_404,
        });
    }

    /// Serve a precompiled template by its path relative to the template
    /// root. The metadata map is immutable after init, so the stored path is
    /// shared, not copied.
    pub fn send_template(&mut self, templates: &TemplateEngine, rel_path: &str, auto_404: bool) {
        self.guard_body_unset("send_template");

        let Some(meta) = templates.get(rel_path) else {
            if auto_404 {
                self.set_status(Status::NotFound);
                self.send_text_static("Template not found");
            } else {
                self.set_status(Status::InternalServerError);
                self.send_text_static("Template unavailable");
            }
            return;
        };

        let mut len = itoa::Buffer::new();
        self.set_header("Content-Length", len.format(meta.size));
        self.set_header("Content-Type", "text/html");
        self.op = OperationType::File;
        self.file = Some(FileSendRequest {
            path: Arc::clone(&meta.full_path),
            auto_404,
        });
    }

    /// Install a stream generator. Chunked mode adds the Transfer-Encoding
    /// header and frames every chunk; fixed mode sends raw bytes (the caller
    /// is responsible for Content-Length).
    pub fn stream(&mut self, generator: StreamGenerator, chunked: bool) {
        self.guard_body_unset("stream");

        if chunked {
            self.set_header("Transfer-Encoding", "chunked");
            self.op = OperationType::StreamChunked;
        } else {
            self.op = OperationType::StreamFixed;
        }
        self.body = Body::Stream(generator);
    }

    /// Park this response and resume `cont` after `delay_ms` (±10 ms
    /// coalescing). The engine arms the connection's async timer when the
    /// handler returns.
    pub fn delay(&mut self, delay_ms: u32, cont: Continuation) {
        if self.pending_delay.is_some() {
            fatal("HttpResponse: delay() called while a delay is already pending");
        }
        self.pending_delay = Some((delay_ms, cont));
    }

    pub fn global_data(&self) -> *mut std::ffi::c_void {
        self.global_data
    }

    fn set_text_body(&mut self, text: String, content_type: &'static str) {
        self.guard_body_unset("send_text");
        let mut len = itoa::Buffer::new();
        self.set_header("Content-Length", len.format(text.len()));
        self.set_header("Content-Type", content_type);
        self.body = Body::Owned(text);
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}
