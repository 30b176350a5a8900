use crate::buffer::WriteBuffer;
use crate::http::{HttpResponse, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeResult {
    Success,
    /// The fixed write buffer cannot hold the head + inline body.
    Insufficient,
    Failed,
}

/// Serialize the status line, headers and (for plain text operations) the
/// body into the connection's fixed write buffer. File and stream bodies are
/// delivered by the reactor after the head goes out.
pub fn serialize(res: &HttpResponse, buf: &mut WriteBuffer, send_buffer_max: u32) -> SerializeResult {
    buf.init(send_buffer_max);
    if !buf.is_initialized() {
        return SerializeResult::Failed;
    }

    let reason = res.status.reason();
    let include_body = !res.is_file_operation() && !res.is_stream_operation();
    let body = if include_body { res.body.as_bytes() } else { &[] };

    // "HTTP/1.x " + "NNN " + reason + CRLF
    let mut head_size = 9 + 4 + reason.len() + 2;
    for (k, v) in res.headers() {
        head_size += k.len() + 2 + v.len() + 2;
    }
    head_size += 2;

    if (head_size + body.len()) as u64 > buf.capacity() as u64 {
        return SerializeResult::Insufficient;
    }

    let version: &[u8] = match res.version {
        Version::Http11 => b"HTTP/1.1 ",
        Version::Http10 | Version::Http09 => b"HTTP/1.0 ",
    };
    buf.append(version);

    let code = res.status.code();
    let digits = [
        b'0' + (code / 100) as u8,
        b'0' + ((code / 10) % 10) as u8,
        b'0' + (code % 10) as u8,
        b' ',
    ];
    buf.append(&digits);
    buf.append(reason.as_bytes());
    buf.append(b"\r\n");

    for (k, v) in res.headers() {
        buf.append(k.as_bytes());
        buf.append(b": ");
        buf.append(v.as_bytes());
        buf.append(b"\r\n");
    }
    buf.append(b"\r\n");

    if !body.is_empty() && !buf.append(body) {
        return SerializeResult::Failed;
    }

    SerializeResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Status, StreamAction, StreamResult};

    fn render(res: &HttpResponse, cap: u32) -> (SerializeResult, Vec<u8>) {
        let mut buf = WriteBuffer::new();
        let out = serialize(res, &mut buf, cap);
        (out, buf.unsent().to_vec())
    }

    #[test]
    fn text_response_is_byte_exact() {
        let mut res = HttpResponse::new();
        res.send_text("hi".to_string());
        res.set_header("Connection", "keep-alive");

        let (out, bytes) = render(&res, 2048);
        assert_eq!(out, SerializeResult::Success);
        assert_eq!(
            bytes,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Type: text/plain\r\nConnection: keep-alive\r\n\r\nhi"
        );
    }

    #[test]
    fn http10_version_line() {
        let mut res = HttpResponse::new();
        res.version = Version::Http10;
        res.set_status(Status::NotFound);
        let (out, bytes) = render(&res, 2048);
        assert_eq!(out, SerializeResult::Success);
        assert!(bytes.starts_with(b"HTTP/1.0 404 Not Found\r\n"));
    }

    #[test]
    fn stream_head_omits_body_bytes() {
        let mut res = HttpResponse::new();
        res.stream(
            Box::new(|_| StreamResult {
                written: 0,
                action: StreamAction::StopKeepAlive,
            }),
            true,
        );
        let (out, bytes) = render(&res, 2048);
        assert_eq!(out, SerializeResult::Success);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with("\r\n\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked"));
    }

    #[test]
    fn oversized_payload_reports_insufficient() {
        let mut res = HttpResponse::new();
        res.send_text("x".repeat(4096));
        let (out, _) = render(&res, 256);
        assert_eq!(out, SerializeResult::Insufficient);
    }

    // A response serialized here must read back with the same status,
    // headers and body through a conformant parser.
    #[test]
    fn round_trips_through_a_parser() {
        let mut res = HttpResponse::new();
        res.set_status(Status::Created);
        res.send_json(&serde_json::json!({ "id": 9 }));
        res.set_header("Connection", "close");

        let (out, bytes) = render(&res, 2048);
        assert_eq!(out, SerializeResult::Success);

        let text = String::from_utf8(bytes).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let mut lines = head.lines();
        assert_eq!(lines.next().unwrap(), "HTTP/1.1 201 Created");

        let parsed: Vec<(String, String)> = lines
            .map(|l| {
                let (k, v) = l.split_once(": ").unwrap();
                (k.to_string(), v.to_string())
            })
            .collect();

        for (k, v) in res.headers() {
            assert!(parsed.iter().any(|(pk, pv)| pk.eq_ignore_ascii_case(k) && pv == v));
        }
        assert_eq!(body, r#"{"id":9}"#);
        assert_eq!(
            parsed
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .unwrap()
                .1,
            body.len().to_string()
        );
    }
}
