//! End-to-end scenarios against a live single-worker reactor on loopback.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vivace::api::{ApiTable, API_V1};
use vivace::app::{App, AppInit};
use vivace::http::AsyncStatus;
use vivace::metrics::WorkerMetrics;
use vivace::template::TemplateEngine;
use vivace::worker::Worker;
use vivace::{Config, Method, Request, Response, StreamAction, StreamResult};

fn hi(_req: &Request, res: &mut Response) {
    res.send_text_static("hi");
}

fn user(req: &Request, res: &mut Response) {
    let id = req.segment(0).and_then(|s| s.as_uint()).unwrap_or(0);
    res.send_text(id.to_string());
}

fn files(req: &Request, res: &mut Response) {
    let captured = req.segment(0).and_then(|s| s.as_str()).unwrap_or("");
    res.send_text(captured.to_string());
}

fn echo(req: &Request, res: &mut Response) {
    res.send_text(String::from_utf8_lossy(req.body).into_owned());
}

fn stream_hello(_req: &Request, res: &mut Response) {
    let mut sent = false;
    res.stream(
        Box::new(move |buf: &mut [u8]| {
            if sent {
                return StreamResult {
                    written: 0,
                    action: StreamAction::StopKeepAlive,
                };
            }
            sent = true;
            buf[..5].copy_from_slice(b"Hello");
            StreamResult {
                written: 5,
                action: StreamAction::Continue,
            }
        }),
        true,
    );
}

fn slow(_req: &Request, res: &mut Response) {
    res.delay(
        30,
        Box::new(|res| {
            res.send_text_static("later");
            AsyncStatus::Completed
        }),
    );
}

fn register(api: &'static ApiTable, init: &mut AppInit) {
    (api.register_route)(init, Method::Get, "/", hi);
    (api.register_route)(init, Method::Get, "/u/<id:uint>", user);
    (api.register_route)(init, Method::Get, "/files/*", files);
    (api.register_route)(init, Method::Get, "/stream", stream_hello);
    (api.register_route)(init, Method::Get, "/slow", slow);
    (api.register_route)(init, Method::Post, "/submit", echo);
}

struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    wake_tx: i32,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(config: Config) -> Self {
        let listen_fd =
            vivace::syscalls::create_listen_socket_reuseport("127.0.0.1", 0, 128).unwrap();
        let port = vivace::syscalls::local_port(listen_fd).unwrap();
        let (wake_rx, wake_tx) = vivace::syscalls::create_pipe().unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let cfg = Arc::new(config);
        let sd = Arc::clone(&shutdown);

        let handle = thread::spawn(move || {
            let mut init = AppInit::new();
            register(&API_V1, &mut init);
            let app = App::build(init, Arc::new(TemplateEngine::empty()), &cfg.project.middleware_list);
            let mut worker = Worker::new(
                cfg,
                app,
                None,
                listen_fd,
                wake_rx,
                Arc::new(WorkerMetrics::new()),
            )
            .unwrap();
            worker.run(sd);
        });

        Self {
            port,
            shutdown,
            wake_tx,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        vivace::syscalls::pipe_wake(self.wake_tx);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Read one response without consuming the connection: headers, then exactly
/// Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read header byte");
        assert!(n > 0, "connection closed before header end");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();

    let content_length: usize = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse().ok())?
        })
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("read body");
    (head, body)
}

fn read_chunked_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        out.push({
            stream.read_exact(&mut byte).unwrap();
            byte[0]
        });
        if out.ends_with(b"0\r\n\r\n") {
            break;
        }
    }
    out
}

#[test]
fn plain_get_root_keeps_alive() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert_eq!(
        head,
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Type: text/plain\r\nConnection: keep-alive\r\n\r\n"
    );
    assert_eq!(body, b"hi");

    // The connection must survive for a second request
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (_, body2) = read_response(&mut stream);
    assert_eq!(body2, b"hi");
}

#[test]
fn typed_param_with_connection_close() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    stream
        .write_all(b"GET /u/42 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut full = Vec::new();
    stream.read_to_end(&mut full).unwrap(); // server closes after the response
    let text = String::from_utf8(full).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.ends_with("\r\n\r\n42"));
}

#[test]
fn expect_with_oversized_body_gets_417() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    stream
        .write_all(
            b"POST /submit HTTP/1.1\r\nContent-Length: 100000\r\nExpect: 100-continue\r\nHost: x\r\n\r\n",
        )
        .unwrap();

    let mut full = Vec::new();
    stream.read_to_end(&mut full).unwrap();
    let text = String::from_utf8(full).unwrap();
    assert!(text.starts_with("HTTP/1.1 417 Expectation Failed\r\n"));
    assert!(text.ends_with("Expectation Failed"));
}

#[test]
fn expect_continue_then_body() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    stream
        .write_all(b"POST /submit HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut interim = [0u8; 25];
    stream.read_exact(&mut interim).unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"data").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"data");
}

#[test]
fn wildcard_captures_the_remaining_path() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    stream
        .write_all(b"GET /files/a/b/c.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"a/b/c.txt");
}

#[test]
fn unknown_route_is_404_and_bad_method_is_400() {
    let server = TestServer::start(Config::default());

    let mut stream = server.connect();
    stream.write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let mut stream = server.connect();
    stream.write_all(b"DELETE / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let mut full = Vec::new();
    stream.read_to_end(&mut full).unwrap();
    assert!(String::from_utf8(full).unwrap().starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn rate_limit_returns_429_on_the_third_burst_request() {
    let mut config = Config::default();
    config.network.max_request_burst_per_ip = 2;
    config.network.max_requests_per_ip_per_sec = 1;
    let server = TestServer::start(config);

    // Three live connections share the per-IP bucket
    let mut c1 = server.connect();
    let mut c2 = server.connect();
    let mut c3 = server.connect();

    c1.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut c1);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

    c2.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut c2);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

    c3.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let mut full = Vec::new();
    c3.read_to_end(&mut full).unwrap();
    assert!(String::from_utf8(full).unwrap().starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
}

#[test]
fn chunked_stream_frames_and_keeps_alive() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    stream.write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    // Headers first
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));

    let body = read_chunked_body(&mut stream);
    assert_eq!(body, b"5\r\nHello\r\n0\r\n\r\n");

    // Still keep-alive
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (_, body2) = read_response(&mut stream);
    assert_eq!(body2, b"hi");
}

#[test]
fn delayed_handler_answers_after_the_timer() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    let started = std::time::Instant::now();
    stream.write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"later");
    assert!(started.elapsed() >= Duration::from_millis(15), "response must wait for the timer");
}

#[test]
fn body_split_across_writes_is_reassembled() {
    let server = TestServer::start(Config::default());
    let mut stream = server.connect();

    stream
        .write_all(b"POST /submit HTTP/1.1\r\nContent-Length: 10\r\nHost: x\r\n\r\n12345")
        .unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"67890").unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"1234567890");
}
