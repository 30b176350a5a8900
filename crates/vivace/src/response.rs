use std::ffi::c_void;

use crate::api::{ApiTable, API_V1};
use crate::http::{Continuation, HttpResponse, Status, StreamGenerator};
use crate::template::TemplateEngine;

/// User-visible response builder handed to handlers and middleware. A thin
/// shell over the engine-owned [`HttpResponse`]: every operation goes
/// through the dispatch table, so in-process handlers and shared-library
/// handlers behave identically.
pub struct Response<'r> {
    backend: &'r mut HttpResponse,
    templates: &'r TemplateEngine,
    api: &'static ApiTable,
}

impl<'r> Response<'r> {
    pub(crate) fn new(backend: &'r mut HttpResponse, templates: &'r TemplateEngine) -> Self {
        Self {
            backend,
            templates,
            api: &API_V1,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(backend: &'r mut HttpResponse) -> Self {
        Self::new(backend, empty_engine())
    }

    pub fn status(&mut self, status: Status) -> &mut Self {
        (self.api.set_status)(self.backend, status);
        self
    }

    pub fn set(&mut self, key: &str, value: impl AsRef<str>) -> &mut Self {
        (self.api.set_header)(self.backend, key, value.as_ref());
        self
    }

    pub fn send_text(&mut self, text: impl AsRef<str>) {
        (self.api.send_text)(self.backend, text.as_ref());
    }

    /// Zero-copy variant for literals.
    pub fn send_text_static(&mut self, text: &'static str) {
        (self.api.send_text_static)(self.backend, text);
    }

    pub fn send_json(&mut self, json: &serde_json::Value) {
        (self.api.send_json)(self.backend, json);
    }

    /// Queue a file send; with `auto_404` a missing file becomes a 404 when
    /// the response is handed off.
    pub fn send_file(&mut self, path: impl AsRef<str>, auto_404: bool) {
        (self.api.send_file)(self.backend, path.as_ref(), auto_404);
    }

    /// Serve a precompiled template by path relative to the template root.
    pub fn send_template(&mut self, rel_path: &str, auto_404: bool) {
        (self.api.send_template)(self.backend, self.templates, rel_path, auto_404);
    }

    /// Install a stream generator; `chunked` selects wire framing.
    pub fn stream(&mut self, generator: StreamGenerator, chunked: bool) {
        (self.api.stream)(self.backend, generator, chunked);
    }

    /// Finish this response later: `cont` resumes after `delay_ms` on the
    /// worker's timer heap (±10 ms coalescing). The connection stays parked
    /// until the continuation completes the response.
    pub fn delay(&mut self, delay_ms: u32, cont: Continuation) {
        (self.api.register_async_timer)(self.backend, delay_ms, cont);
    }

    pub fn global_data(&self) -> *mut c_void {
        (self.api.get_global_ptr_data)(self.backend)
    }

    /// Direct access to the engine-owned state (read-only).
    pub fn backend(&self) -> &HttpResponse {
        self.backend
    }
}

#[cfg(test)]
fn empty_engine() -> &'static TemplateEngine {
    use std::sync::OnceLock;
    static EMPTY: OnceLock<TemplateEngine> = OnceLock::new();
    EMPTY.get_or_init(TemplateEngine::empty)
}
