use std::collections::{HashMap, HashSet};

use crate::http::Request;
use crate::response::Response;

/// Tri-state middleware verdict: advance one, jump over the next, or abort
/// the whole chain (the handler is then never called).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareAction {
    Continue,
    SkipNext,
    Break,
}

pub type Middleware = fn(&Request, &mut Response) -> MiddlewareAction;

/// Name → middleware registry plus the materialized execution stacks.
///
/// User init code registers middleware by name; the ordered global stack is
/// then built from the config-provided name list, and per-route stacks are
/// attached by route id. After `load_from_config` the factory map is
/// discarded — everything that survives is read-only for the worker's
/// lifetime.
pub struct MiddlewareRegistry {
    factories: HashMap<String, Middleware>,
    global_stack: Vec<Middleware>,
    per_route: HashMap<u32, Vec<Middleware>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            global_stack: Vec::new(),
            per_route: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, mw: Middleware) {
        if self.factories.contains_key(name) {
            tracing::warn!("middleware '{name}' registered twice; keeping the first registration");
            return;
        }
        self.factories.insert(name.to_string(), mw);
    }

    pub fn register_per_route(&mut self, route_id: u32, stack: Vec<Middleware>) {
        if self.per_route.contains_key(&route_id) {
            tracing::warn!("route {route_id} already has a middleware stack; ignoring the new one");
            return;
        }
        self.per_route.insert(route_id, stack);
    }

    /// Materialize the global stack in config order, then drop the factory
    /// map. Duplicate names and names never registered are warned about and
    /// skipped.
    pub fn load_from_config(&mut self, ordered_names: &[String]) {
        self.global_stack.clear();
        let mut loaded: HashSet<&str> = HashSet::new();

        for name in ordered_names {
            if !loaded.insert(name.as_str()) {
                tracing::warn!("middleware '{name}' listed multiple times in config; skipping duplicate");
                continue;
            }
            match self.factories.get(name.as_str()) {
                Some(mw) => self.global_stack.push(*mw),
                None => tracing::warn!(
                    "middleware '{name}' listed in config but never registered; skipped"
                ),
            }
        }

        self.factories = HashMap::new();
    }

    /// Run the global stack, then the matched route's stack. Returns true
    /// iff no middleware broke the chain.
    pub fn execute(&self, route_id: u32, req: &Request, res: &mut Response) -> bool {
        if !Self::run_stack(&self.global_stack, req, res) {
            return false;
        }

        match self.per_route.get(&route_id) {
            Some(stack) => Self::run_stack(stack, req, res),
            None => true,
        }
    }

    pub fn global_len(&self) -> usize {
        self.global_stack.len()
    }

    fn run_stack(stack: &[Middleware], req: &Request, res: &mut Response) -> bool {
        let mut i = 0;
        while i < stack.len() {
            match stack[i](req, res) {
                MiddlewareAction::Continue => i += 1,
                MiddlewareAction::SkipNext => i += 2,
                MiddlewareAction::Break => return false,
            }
        }
        true
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, HttpResponse, Method, Request, Status, Version};
    use crate::response::Response;

    // Execution order is observed through a header the middlewares append to.
    fn trace(res: &mut Response, tag: &str) {
        let prior = res
            .backend()
            .headers()
            .iter()
            .find(|(k, _)| k == "X-Trace")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        res.set("X-Trace", format!("{prior}{tag}"));
    }

    fn mw_a(_req: &Request, res: &mut Response) -> MiddlewareAction {
        trace(res, "a");
        MiddlewareAction::Continue
    }
    fn mw_b(_req: &Request, res: &mut Response) -> MiddlewareAction {
        trace(res, "b");
        MiddlewareAction::Continue
    }
    fn mw_skip(_req: &Request, res: &mut Response) -> MiddlewareAction {
        trace(res, "s");
        MiddlewareAction::SkipNext
    }
    fn mw_break(_req: &Request, res: &mut Response) -> MiddlewareAction {
        trace(res, "x");
        MiddlewareAction::Break
    }

    fn dummy_request() -> Request<'static> {
        Request {
            method: Method::Get,
            version: Version::Http11,
            path: "/",
            query: None,
            headers: Headers::with_capacity(0),
            body: &[],
            segments: Vec::new(),
        }
    }

    fn trace_of(res: &HttpResponse) -> String {
        res.headers()
            .iter()
            .find(|(k, _)| k == "X-Trace")
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    fn run(reg: &MiddlewareRegistry, route_id: u32) -> (bool, String, Status) {
        let req = dummy_request();
        let mut backend = HttpResponse::new();
        let ok = {
            let mut res = Response::for_tests(&mut backend);
            reg.execute(route_id, &req, &mut res)
        };
        (ok, trace_of(&backend), backend.status)
    }

    fn loaded(names: &[&str]) -> MiddlewareRegistry {
        let mut reg = MiddlewareRegistry::new();
        reg.register("a", mw_a);
        reg.register("b", mw_b);
        reg.register("skip", mw_skip);
        reg.register("break", mw_break);
        reg.load_from_config(&names.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        reg
    }

    #[test]
    fn continue_advances_through_the_stack() {
        let reg = loaded(&["a", "b"]);
        let (ok, trace, _) = run(&reg, 0);
        assert!(ok);
        assert_eq!(trace, "ab");
    }

    #[test]
    fn skip_next_jumps_one() {
        let reg = loaded(&["skip", "a", "b"]);
        let (ok, trace, _) = run(&reg, 0);
        assert!(ok);
        assert_eq!(trace, "sb");
    }

    #[test]
    fn break_aborts_and_reports_false() {
        let reg = loaded(&["a", "break", "b"]);
        let (ok, trace, _) = run(&reg, 0);
        assert!(!ok);
        assert_eq!(trace, "ax");
    }

    #[test]
    fn duplicate_config_names_load_once() {
        let reg = loaded(&["a", "a", "b"]);
        assert_eq!(reg.global_len(), 2);
        let (_, trace, _) = run(&reg, 0);
        assert_eq!(trace, "ab");
    }

    #[test]
    fn unregistered_config_name_is_skipped() {
        let reg = loaded(&["a", "ghost", "b"]);
        assert_eq!(reg.global_len(), 2);
    }

    #[test]
    fn per_route_stack_runs_after_global() {
        let mut reg = loaded(&["a"]);
        reg.register_per_route(7, vec![mw_b]);

        let (ok, trace, _) = run(&reg, 7);
        assert!(ok);
        assert_eq!(trace, "ab");

        // Other routes only get the global stack
        let (ok, trace, _) = run(&reg, 8);
        assert!(ok);
        assert_eq!(trace, "a");
    }

    #[test]
    fn per_route_break_stops_before_handler() {
        let mut reg = loaded(&[]);
        reg.register_per_route(3, vec![mw_break]);
        let (ok, _, _) = run(&reg, 3);
        assert!(!ok);
    }
}
