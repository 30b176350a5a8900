use crate::http::{Headers, Method, Request, Version};

/// Persisted parse phase (3 bits of connection state in the wire-level
/// context). Monotonic within a request-response cycle except for the
/// transition back to `Idle` on keep-alive completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    Idle,
    IncompleteHeaders,
    IncompleteBody,
    StreamingBody,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Malformed framing, bad URI, unknown method/version, oversized headers.
    BadRequest,
    /// Content-Length above the body or receive-buffer budget.
    PayloadTooLarge,
}

/// What one `parse` call produced. `Success` borrows the read buffer.
pub enum ParseOutcome<'a> {
    IncompleteHeaders,
    IncompleteBody,
    /// Client asked `Expect: 100-continue` and the declared body fits:
    /// transmit `100 Continue` and keep receiving.
    Expect100,
    /// `Expect` present but unacceptable: answer 417 and close.
    Expect417,
    /// `Transfer-Encoding: chunked` request body (not decoded; answered 501).
    StreamingBody,
    Success(Request<'a>),
    Error(ParseErrorKind),
}

#[derive(Clone, Copy)]
pub struct ParseLimits {
    pub max_header_size: u32,
    pub max_header_count: u32,
    pub max_body_size: u32,
    pub max_recv_buffer: u32,
}

/// Incremental parser state carried on the connection between reads. Offsets
/// index into the read buffer; views are rebuilt from them on completion, so
/// nothing borrowed outlives a single `parse` call.
#[derive(Debug, Clone, Copy)]
pub struct ParserState {
    pub phase: ParsePhase,
    /// Scan/progress cursor: resume point while headers are incomplete, then
    /// `header_end + content_len` while the body is incomplete.
    pub track_bytes: u32,
    pub expected_body_len: u32,
    header_end: u32,
    headers_start: u32,
    path_start: u32,
    path_len: u32,
    query_start: u32,
    query_len: u32,
    method: Option<Method>,
    version: Option<Version>,
}

impl ParserState {
    pub const fn new() -> Self {
        Self {
            phase: ParsePhase::Idle,
            track_bytes: 0,
            expected_body_len: 0,
            header_end: 0,
            headers_start: 0,
            path_start: 0,
            path_len: 0,
            query_start: 0,
            query_len: 0,
            method: None,
            version: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for ParserState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the state machine over the buffered bytes. `buf` is the read
/// buffer's valid region; the URI is normalized in place on the pass that
/// completes the headers.
pub fn parse<'a>(st: &mut ParserState, buf: &'a mut [u8], limits: &ParseLimits) -> ParseOutcome<'a> {
    if buf.is_empty() {
        st.phase = ParsePhase::Error;
        return ParseOutcome::Error(ParseErrorKind::BadRequest);
    }

    match st.phase {
        ParsePhase::Idle | ParsePhase::IncompleteHeaders => {
            st.phase = ParsePhase::IncompleteHeaders;
            parse_headers_phase(st, buf, limits)
        }

        ParsePhase::IncompleteBody => {
            if (buf.len() as u32) < st.track_bytes {
                return ParseOutcome::IncompleteBody;
            }
            st.phase = ParsePhase::Success;
            let body_start = (st.track_bytes - st.expected_body_len) as usize;
            let body_end = st.track_bytes as usize;
            build_request(st, buf, body_start..body_end, limits)
        }

        ParsePhase::StreamingBody => ParseOutcome::StreamingBody,

        ParsePhase::Success => {
            let body_start = (st.track_bytes - st.expected_body_len) as usize;
            let body_end = st.track_bytes as usize;
            build_request(st, buf, body_start..body_end, limits)
        }

        ParsePhase::Error => ParseOutcome::Error(ParseErrorKind::BadRequest),
    }
}

fn fail(st: &mut ParserState, kind: ParseErrorKind) -> ParseOutcome<'static> {
    st.phase = ParsePhase::Error;
    ParseOutcome::Error(kind)
}

fn parse_headers_phase<'a>(st: &mut ParserState, buf: &'a mut [u8], limits: &ParseLimits) -> ParseOutcome<'a> {
    let size = buf.len() as u32;

    let Some(header_end) = find_header_end(buf, st.track_bytes) else {
        // Keep the cursor moving so retries never rescan from the start
        if size > limits.max_header_size {
            return fail(st, ParseErrorKind::BadRequest);
        }
        st.track_bytes = size;
        return ParseOutcome::IncompleteHeaders;
    };

    if header_end > limits.max_header_size {
        return fail(st, ParseErrorKind::BadRequest);
    }
    st.track_bytes = header_end;
    st.header_end = header_end;

    // Request line: METHOD SP URI SP HTTP/x.y CRLF
    let Some(line_end) = find_crlf(buf, 0, header_end as usize) else {
        return fail(st, ParseErrorKind::BadRequest);
    };
    let line = &buf[..line_end];

    let Some(m_end) = line.iter().position(|&b| b == b' ') else {
        return fail(st, ParseErrorKind::BadRequest);
    };
    let Some(method) = Method::from_bytes(&line[..m_end]) else {
        return fail(st, ParseErrorKind::BadRequest);
    };

    let uri_start = m_end + 1;
    let Some(rel_uri_end) = line[uri_start..].iter().position(|&b| b == b' ') else {
        return fail(st, ParseErrorKind::BadRequest);
    };
    let uri_end = uri_start + rel_uri_end;
    if uri_end == uri_start {
        return fail(st, ParseErrorKind::BadRequest);
    }

    let Some(version) = Version::from_bytes(&line[uri_end + 1..]) else {
        return fail(st, ParseErrorKind::BadRequest);
    };

    // Split the query off before normalization; it is preserved verbatim
    let uri = &buf[uri_start..uri_end];
    let (path_end, query_start, query_len) = match uri.iter().position(|&b| b == b'?') {
        Some(q) => (
            uri_start + q,
            (uri_start + q + 1) as u32,
            (uri_end - (uri_start + q + 1)) as u32,
        ),
        None => (uri_end, 0, 0),
    };

    let Some(path_len) = normalize_uri_path(&mut buf[uri_start..path_end]) else {
        return fail(st, ParseErrorKind::BadRequest);
    };

    st.method = Some(method);
    st.version = Some(version);
    st.path_start = uri_start as u32;
    st.path_len = path_len as u32;
    st.query_start = query_start;
    st.query_len = query_len;
    st.headers_start = (line_end + 2) as u32;

    // Mutation is over; everything below reads shared views
    let buf: &'a [u8] = buf;

    let headers = match parse_header_lines(buf, st.headers_start as usize, header_end as usize, limits.max_header_count)
    {
        Some(h) => h,
        None => return fail(st, ParseErrorKind::BadRequest),
    };

    let expect_header = headers.get("Expect");
    let content_length = headers.get("Content-Length");
    let transfer_encoding = headers.get("Transfer-Encoding");

    let has_expect = expect_header.is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

    // RFC 7230: the two framing headers are mutually exclusive
    if content_length.is_some() && transfer_encoding.is_some() {
        return fail(st, ParseErrorKind::BadRequest);
    }

    // Expect with no body indication at all
    if has_expect && content_length.is_none() && transfer_encoding.is_none() {
        return ParseOutcome::Expect417;
    }

    if let Some(cl) = content_length {
        let Some(content_len) = parse_u64_strict(cl) else {
            return fail(st, ParseErrorKind::BadRequest);
        };

        let body_budget = limits.max_body_size as u64;
        let buffer_budget = limits.max_recv_buffer as u64;
        if content_len > body_budget
            || content_len > buffer_budget - 1
            || header_end as u64 > buffer_budget - 1 - content_len
        {
            if has_expect {
                return ParseOutcome::Expect417;
            }
            return fail(st, ParseErrorKind::PayloadTooLarge);
        }
        let content_len = content_len as u32;

        if has_expect {
            st.expected_body_len = content_len;
            st.track_bytes = header_end + content_len;
            st.phase = ParsePhase::IncompleteBody;
            return ParseOutcome::Expect100;
        }

        if content_len > 0 {
            let available = buf.len() as u32 - header_end;
            if available < content_len {
                st.expected_body_len = content_len;
                st.track_bytes = header_end + content_len;
                st.phase = ParsePhase::IncompleteBody;
                return ParseOutcome::IncompleteBody;
            }

            st.expected_body_len = content_len;
            st.track_bytes = header_end + content_len;
            st.phase = ParsePhase::Success;
            let body = &buf[header_end as usize..(header_end + content_len) as usize];
            return ParseOutcome::Success(assemble(st, buf, headers, body));
        }

        st.expected_body_len = 0;
        st.phase = ParsePhase::Success;
        return ParseOutcome::Success(assemble(st, buf, headers, &[]));
    }

    if let Some(te) = transfer_encoding {
        if !te.eq_ignore_ascii_case("chunked") {
            return fail(st, ParseErrorKind::BadRequest);
        }
        st.phase = ParsePhase::StreamingBody;
        if has_expect {
            return ParseOutcome::Expect100;
        }
        return ParseOutcome::StreamingBody;
    }

    // Header-only request
    st.expected_body_len = 0;
    st.phase = ParsePhase::Success;
    ParseOutcome::Success(assemble(st, buf, headers, &[]))
}

/// Completion path: views are rebuilt from the offsets recorded when the
/// headers were first parsed (the header region is untouched by later reads).
fn build_request<'a>(
    st: &mut ParserState,
    buf: &'a [u8],
    body: std::ops::Range<usize>,
    limits: &ParseLimits,
) -> ParseOutcome<'a> {
    if body.end > buf.len() {
        return fail(st, ParseErrorKind::BadRequest);
    }
    let headers = match parse_header_lines(
        buf,
        st.headers_start as usize,
        st.header_end as usize,
        limits.max_header_count,
    ) {
        Some(h) => h,
        None => return fail(st, ParseErrorKind::BadRequest),
    };
    let body = &buf[body];
    ParseOutcome::Success(assemble(st, buf, headers, body))
}

fn assemble<'a>(st: &ParserState, buf: &'a [u8], headers: Headers<'a>, body: &'a [u8]) -> Request<'a> {
    let path_range = st.path_start as usize..(st.path_start + st.path_len) as usize;
    // Normalization guarantees printable ASCII
    let path = std::str::from_utf8(&buf[path_range]).unwrap_or("/");

    let query = if st.query_start > 0 {
        let range = st.query_start as usize..(st.query_start + st.query_len) as usize;
        std::str::from_utf8(&buf[range]).ok()
    } else {
        None
    };

    Request {
        method: st.method.unwrap_or(Method::Get),
        version: st.version.unwrap_or(Version::Http11),
        path,
        query,
        headers,
        body,
        segments: Vec::new(),
    }
}

// ---- Framing helpers ----

/// Scan for `\r\n\r\n` resuming near `from`; returns the offset one past the
/// terminator. The resume point backs up three bytes so a terminator
/// straddling the previous read boundary is still seen.
fn find_header_end(buf: &[u8], from: u32) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let start = (from.saturating_sub(3)) as usize;
    let hay = &buf[start..];
    hay.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (start + p + 4) as u32)
}

fn find_crlf(buf: &[u8], from: usize, to: usize) -> Option<usize> {
    let to = to.min(buf.len());
    if from >= to {
        return None;
    }
    buf[from..to]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

fn parse_header_lines<'a>(buf: &'a [u8], start: usize, header_end: usize, max_count: u32) -> Option<Headers<'a>> {
    let mut headers = Headers::with_capacity(16);
    let mut pos = start;
    let mut count: u32 = 0;

    loop {
        let line_end = find_crlf(buf, pos, header_end)?;
        let line = &buf[pos..line_end];
        pos = line_end + 2;

        if line.is_empty() {
            break;
        }

        let colon = line.iter().position(|&b| b == b':')?;
        if colon == 0 {
            return None;
        }

        let name = std::str::from_utf8(&line[..colon]).ok()?;
        let raw_value = std::str::from_utf8(&line[colon + 1..]).ok()?;
        let value = raw_value.trim_matches(|c| c == ' ' || c == '\t');

        headers.push(name, value);

        count += 1;
        if count > max_count {
            return None;
        }
    }

    Some(headers)
}

/// Strict unsigned decimal: ASCII digits only, no sign, overflow rejected.
fn parse_u64_strict(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

// ---- URI path normalization ----

/// Normalize the path bytes in place; returns the new length or `None` on a
/// malformed path.
///
/// Rejects: non-ASCII, control bytes, backslash, and any `%XY` whose decoded
/// byte is `/`, `\`, `.`, `%`, or outside printable ASCII (the escape itself
/// is validated but kept encoded). Collapses repeated `/`, resolves `.` and
/// `..` (refusing to escape the root), and strips a trailing `/` unless the
/// result is the root itself.
pub fn normalize_uri_path(buf: &mut [u8]) -> Option<usize> {
    if buf.is_empty() || buf[0] != b'/' {
        return None;
    }

    let len = buf.len();
    let mut read = 1usize;
    let mut write = 1usize;
    let mut segments: Vec<usize> = Vec::new();

    while read < len {
        // Collapse repeated slashes
        while read < len && buf[read] == b'/' {
            read += 1;
        }
        if read >= len {
            break;
        }

        let segment_start = write;

        while read < len && buf[read] != b'/' {
            let c = buf[read];

            if c < 0x20 || c >= 0x7F {
                return None;
            }
            if c == b'\\' {
                return None;
            }

            if c == b'%' {
                if len - read < 3 {
                    return None;
                }
                let h1 = hex_val(buf[read + 1])?;
                let h2 = hex_val(buf[read + 2])?;
                let decoded = (h1 << 4) | h2;
                if decoded <= 0x1F || decoded >= 0x7F {
                    return None;
                }
                if decoded == b'/' || decoded == b'\\' || decoded == b'.' {
                    return None;
                }
                // Double encodings like %252e would survive one decode
                if decoded == b'%' {
                    return None;
                }
            }

            buf[write] = buf[read];
            write += 1;
            read += 1;
        }

        let seg_len = write - segment_start;

        if seg_len == 1 && buf[segment_start] == b'.' {
            write = segment_start;
            continue;
        }

        if seg_len == 2 && buf[segment_start] == b'.' && buf[segment_start + 1] == b'.' {
            let prev = segments.pop()?; // ".." above root is rejected
            write = prev;
            continue;
        }

        segments.push(segment_start);
        if write < len {
            buf[write] = b'/';
            write += 1;
        }
    }

    // Strip the trailing slash unless this is the root
    if write > 1 && buf[write - 1] == b'/' {
        write -= 1;
    }

    Some(write)
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
