//! Routes, middleware, typed params, a wildcard sink and a chunked stream,
//! wired through the dispatch table the same way a compiled user module
//! would be.
//!
//! Run with `cargo run --example hello`, then:
//!   curl -v http://127.0.0.1:8080/
//!   curl -v http://127.0.0.1:8080/api/users/42
//!   curl -v http://127.0.0.1:8080/files/css/site.css
//!   curl -v http://127.0.0.1:8080/ticks

use vivace::{
    ApiTable, AppInit, Config, Method, MiddlewareAction, Request, Response, Server, StreamAction,
    StreamResult,
};

fn home(_req: &Request, res: &mut Response) {
    res.send_text_static("Welcome to vivace!");
}

fn user(req: &Request, res: &mut Response) {
    let id = req.segment(0).and_then(|s| s.as_uint()).unwrap_or(0);
    res.send_json(&serde_json::json!({ "id": id, "name": format!("user-{id}") }));
}

fn files(req: &Request, res: &mut Response) {
    let captured = req.segment(0).and_then(|s| s.as_str()).unwrap_or("");
    res.send_text(format!("you asked for: {captured}"));
}

fn ticks(_req: &Request, res: &mut Response) {
    let mut remaining = 3u32;
    res.stream(
        Box::new(move |buf: &mut [u8]| {
            if remaining == 0 {
                return StreamResult {
                    written: 0,
                    action: StreamAction::StopKeepAlive,
                };
            }
            remaining -= 1;
            let msg = b"tick\n";
            let n = msg.len().min(buf.len());
            buf[..n].copy_from_slice(&msg[..n]);
            StreamResult {
                written: n,
                action: StreamAction::Continue,
            }
        }),
        true,
    );
}

fn slow(_req: &Request, res: &mut Response) {
    res.delay(
        250,
        Box::new(|res| {
            res.send_text_static("worth the wait");
            vivace::http::AsyncStatus::Completed
        }),
    );
}

fn request_log(req: &Request, _res: &mut Response) -> MiddlewareAction {
    tracing::info!("{:?} {}", req.method, req.path);
    MiddlewareAction::Continue
}

fn register(api: &'static ApiTable, init: &mut AppInit) {
    (api.register_middleware)(init, "request_log", request_log);

    (api.register_route)(init, Method::Get, "/", home);
    (api.register_route)(init, Method::Get, "/files/*", files);
    (api.register_route)(init, Method::Get, "/ticks", ticks);
    (api.register_route)(init, Method::Get, "/slow", slow);

    (api.push_route_prefix)(init, "/api");
    (api.register_route)(init, Method::Get, "/users/<id:uint>", user);
    (api.pop_route_prefix)(init);
}

fn main() -> vivace::Result<()> {
    vivace::init_logging();

    let mut config = Config::default();
    config.project.middleware_list = vec!["request_log".to_string()];

    Server::bind("127.0.0.1:8080").config(config).workers(2).serve(register)
}
