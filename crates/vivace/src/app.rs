use std::ffi::c_void;
use std::sync::Arc;

use crate::middleware::MiddlewareRegistry;
use crate::router::Router;
use crate::template::TemplateEngine;

/// Registration-time state handed (through the dispatch table) to the user
/// module's entry point. Routing and middleware registration happen here;
/// once the worker starts serving, the result is frozen into an [`App`].
pub struct AppInit {
    pub(crate) router: Router,
    pub(crate) middleware: MiddlewareRegistry,
    pub(crate) user_data: *mut c_void,
}

impl AppInit {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            middleware: MiddlewareRegistry::new(),
            user_data: std::ptr::null_mut(),
        }
    }
}

impl Default for AppInit {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-owned application state: router, middleware stacks, template map
/// and the user's ambient pointer. Constructed once at worker init and
/// read-only from then on — the worker is single-threaded, so nothing here
/// is locked.
pub struct App {
    pub router: Router,
    pub middleware: MiddlewareRegistry,
    pub templates: Arc<TemplateEngine>,
    pub user_data: *mut c_void,
}

impl App {
    /// Freeze the registration state. The global middleware stack is
    /// materialized here from the config-ordered name list, after which the
    /// factory map is gone.
    pub fn build(mut init: AppInit, templates: Arc<TemplateEngine>, middleware_order: &[String]) -> Self {
        init.middleware.load_from_config(middleware_order);
        Self {
            router: init.router,
            middleware: init.middleware,
            templates,
            user_data: init.user_data,
        }
    }
}
