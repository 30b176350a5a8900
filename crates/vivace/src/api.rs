use std::ffi::c_void;

use crate::app::AppInit;
use crate::http::{Continuation, HttpResponse, Method, Status, StreamGenerator};
use crate::middleware::Middleware;
use crate::router::Handler;
use crate::template::TemplateEngine;

/// Symbol the user module must export:
/// `fn vivace_register(api: &'static ApiTable, init: &mut AppInit)`.
/// The loader (an external collaborator) resolves it once at startup and
/// calls it with [`API_V1`]; the table pointer is valid for the process
/// lifetime and may be captured.
pub const REGISTER_ENTRYPOINT: &str = "vivace_register";

pub type RegisterFn = fn(&'static ApiTable, &mut AppInit);

pub const API_VERSION_V1: u32 = 1;

/// Versioned dispatch table handed to user code exactly once at load time.
///
/// Nothing crossing this boundary transfers ownership: arguments are
/// primitives, borrowed views, or engine-owned handles (`AppInit` during
/// registration, `HttpResponse` during a request) that outlive the call.
/// User code must check `version` before using any field beyond it.
#[repr(C)]
pub struct ApiTable {
    pub version: u32,

    // Routing
    pub register_route: fn(&mut AppInit, Method, &str, Handler),
    pub register_route_ex: fn(&mut AppInit, Method, &str, &[Middleware], Handler),
    pub push_route_prefix: fn(&mut AppInit, &str),
    pub pop_route_prefix: fn(&mut AppInit),

    // Middleware
    pub register_middleware: fn(&mut AppInit, &str, Middleware),

    // Response manipulation
    pub set_status: fn(&mut HttpResponse, Status),
    pub set_header: fn(&mut HttpResponse, &str, &str),
    pub send_text: fn(&mut HttpResponse, &str),
    pub send_text_static: fn(&mut HttpResponse, &'static str),
    pub send_json: fn(&mut HttpResponse, &serde_json::Value),
    pub send_file: fn(&mut HttpResponse, &str, bool),
    pub send_template: fn(&mut HttpResponse, &TemplateEngine, &str, bool),
    pub stream: fn(&mut HttpResponse, StreamGenerator, bool),

    // Async
    pub register_async_timer: fn(&mut HttpResponse, u32, Continuation),

    // Ambient data
    pub set_global_ptr_data: fn(&mut AppInit, *mut c_void),
    pub get_global_ptr_data: fn(&HttpResponse) -> *mut c_void,
}

pub static API_V1: ApiTable = ApiTable {
    version: API_VERSION_V1,

    register_route: |init, method, path, handler| {
        let _ = init.router.register(method, path, handler);
    },
    register_route_ex: |init, method, path, stack, handler| {
        let id = init.router.register(method, path, handler);
        init.middleware.register_per_route(id, stack.to_vec());
    },
    push_route_prefix: |init, prefix| init.router.push_group(prefix),
    pop_route_prefix: |init| init.router.pop_group(),

    register_middleware: |init, name, mw| init.middleware.register(name, mw),

    set_status: |res, status| {
        res.set_status(status);
    },
    set_header: |res, key, value| {
        res.set_header(key.to_string(), value.to_string());
    },
    send_text: |res, text| res.send_text(text.to_string()),
    send_text_static: |res, text| res.send_text_static(text),
    send_json: |res, json| res.send_json(json),
    send_file: |res, path, auto_404| res.send_file(path.to_string(), auto_404),
    send_template: |res, templates, rel, auto_404| res.send_template(templates, rel, auto_404),
    stream: |res, generator, chunked| res.stream(generator, chunked),

    register_async_timer: |res, delay_ms, cont| res.delay(delay_ms, cont),

    set_global_ptr_data: |init, data| init.user_data = data,
    get_global_ptr_data: |res| res.global_data(),
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{PathSegment, Request};
    use crate::response::Response;

    fn handler(_req: &Request, _res: &mut Response) {}

    #[test]
    fn table_registers_routes_and_prefixes() {
        let mut init = AppInit::new();
        (API_V1.push_route_prefix)(&mut init, "/api");
        (API_V1.register_route)(&mut init, Method::Get, "/ping", handler);
        (API_V1.pop_route_prefix)(&mut init);
        (API_V1.register_route)(&mut init, Method::Get, "/top", handler);

        let mut segs: Vec<PathSegment> = Vec::new();
        assert!(init.router.match_route(Method::Get, "/api/ping", &mut segs).is_some());
        assert!(init.router.match_route(Method::Get, "/top", &mut segs).is_some());
        assert!(init.router.match_route(Method::Get, "/ping", &mut segs).is_none());
    }

    #[test]
    fn table_drives_the_response_backend() {
        let mut res = HttpResponse::new();
        (API_V1.set_status)(&mut res, Status::Created);
        (API_V1.set_header)(&mut res, "X-A", "1");
        (API_V1.send_text)(&mut res, "done");

        assert_eq!(res.status, Status::Created);
        assert_eq!(res.body.as_bytes(), b"done");
    }

    #[test]
    fn global_data_round_trips() {
        let mut init = AppInit::new();
        let mut value = 7u32;
        (API_V1.set_global_ptr_data)(&mut init, &mut value as *mut _ as *mut c_void);
        assert!(!init.user_data.is_null());
    }

    #[test]
    fn version_is_v1() {
        assert_eq!(API_V1.version, API_VERSION_V1);
    }
}
