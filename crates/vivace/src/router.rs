use crate::http::{fatal, Method, PathSegment, Request};
use crate::response::Response;

/// Route handler: borrow of the parsed request, exclusive borrow of the
/// response builder.
pub type Handler = fn(&Request, &mut Response);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Uint,
    Int,
    Str,
    Uuid,
}

/// One edge in the trie: a literal, a typed parameter, or the wildcard sink.
enum SegmentKey {
    Static(String),
    Param(ParamType),
    Wildcard,
}

pub struct TrieNode {
    key: SegmentKey,
    children: Vec<TrieNode>,
    handler: Option<Handler>,
    id: u32,
}

impl TrieNode {
    fn new(key: SegmentKey) -> Self {
        Self {
            key,
            children: Vec::new(),
            handler: None,
            id: 0,
        }
    }

    pub fn route_id(&self) -> u32 {
        self.id
    }

    pub fn handler(&self) -> Option<Handler> {
        self.handler
    }
}

/// Radix trie with an insertion cursor: `push_group` moves the cursor to the
/// subtree rooted at a prefix, so subsequent inserts attach there until the
/// matching `pop_group`.
struct RouteTrie {
    root: TrieNode,
    cursor: Vec<usize>,
    cursor_stack: Vec<Vec<usize>>,
}

impl RouteTrie {
    fn new() -> Self {
        Self {
            root: TrieNode::new(SegmentKey::Static(String::new())),
            cursor: Vec::new(),
            cursor_stack: Vec::new(),
        }
    }

    fn node_mut(&mut self, path: &[usize]) -> &mut TrieNode {
        let mut node = &mut self.root;
        for &idx in path {
            node = &mut node.children[idx];
        }
        node
    }

    fn insert(&mut self, route: &str, handler: Handler, id: u32) {
        let path = self.insert_route(route);
        let node = self.node_mut(&path);
        node.handler = Some(handler);
        node.id = id;
    }

    fn push_group(&mut self, prefix: &str) {
        let old = self.cursor.clone();
        self.cursor_stack.push(old);
        self.cursor = self.insert_route(prefix);
    }

    fn pop_group(&mut self) {
        match self.cursor_stack.pop() {
            Some(prev) => self.cursor = prev,
            None => fatal("Router: pop_group called without a matching push_group"),
        }
    }

    /// Walk/extend the trie along `route`, returning the index path of the
    /// final node (relative to the root).
    fn insert_route(&mut self, route: &str) -> Vec<usize> {
        let mut node_path = self.cursor.clone();
        let mut rest = route.strip_prefix('/').unwrap_or(route);

        while !rest.is_empty() {
            let (segment, tail) = match rest.find('/') {
                Some(p) => (&rest[..p], &rest[p + 1..]),
                None => (rest, ""),
            };
            rest = tail;

            if segment.is_empty() {
                continue;
            }

            let key = Self::segment_key(segment);
            let is_wildcard = matches!(key, SegmentKey::Wildcard);
            if is_wildcard && !rest.is_empty() {
                fatal(&format!(
                    "Router: wildcard '*' must be the last segment of a route (got trailing '{rest}')"
                ));
            }

            let node = self.node_mut(&node_path);
            let child_idx = match node.children.iter().position(|c| Self::same_key(&c.key, &key)) {
                Some(i) => i,
                None => {
                    node.children.push(TrieNode::new(key));
                    node.children.len() - 1
                }
            };
            node_path.push(child_idx);
        }

        node_path
    }

    fn segment_key(segment: &str) -> SegmentKey {
        if segment == "*" {
            return SegmentKey::Wildcard;
        }

        if segment.starts_with('<') && segment.ends_with('>') {
            if segment.len() <= 2 {
                fatal(&format!(
                    "Router: empty parameter segment '{segment}'; write <id:int> or <int>"
                ));
            }
            let inner = &segment[1..segment.len() - 1];

            // The identifier before ':' is documentation; segments are
            // addressed by index, so only the type matters
            let ty = match inner.find(':') {
                None => inner,
                Some(colon) => {
                    if colon == 0 || colon == inner.len() - 1 {
                        fatal(&format!(
                            "Router: malformed dynamic segment '{segment}'; write <id:int> or <int>"
                        ));
                    }
                    &inner[colon + 1..]
                }
            };

            let ty = match ty {
                "uint" => ParamType::Uint,
                "int" => ParamType::Int,
                "uuid" => ParamType::Uuid,
                "string" => ParamType::Str,
                other => fatal(&format!(
                    "Router: unknown parameter type '{other}'; valid types are uint, int, uuid, string"
                )),
            };
            return SegmentKey::Param(ty);
        }

        SegmentKey::Static(segment.to_string())
    }

    fn same_key(a: &SegmentKey, b: &SegmentKey) -> bool {
        match (a, b) {
            (SegmentKey::Static(x), SegmentKey::Static(y)) => x == y,
            (SegmentKey::Param(x), SegmentKey::Param(y)) => x == y,
            (SegmentKey::Wildcard, SegmentKey::Wildcard) => true,
            _ => false,
        }
    }

    /// Static match first at each depth, then typed parameters in
    /// declaration order (a failed parse does not consume), wildcard last.
    /// The wildcard swallows the remaining path, slashes included, as one
    /// string segment.
    fn match_route<'a, 's>(&'s self, path: &'a str, out: &mut Vec<PathSegment<'a>>) -> Option<&'s TrieNode> {
        let p = path.strip_prefix('/').unwrap_or(path);
        let mut current = &self.root;
        let mut pos = 0usize;

        while pos < p.len() {
            let (seg_end, next_pos) = match p[pos..].find('/') {
                Some(s) => (pos + s, pos + s + 1),
                None => (p.len(), p.len()),
            };
            let segment = &p[pos..seg_end];

            if segment.is_empty() {
                pos = next_pos;
                continue;
            }

            let mut next: Option<&TrieNode> = None;

            for child in &current.children {
                if let SegmentKey::Static(key) = &child.key {
                    if key == segment {
                        next = Some(child);
                        break;
                    }
                }
            }

            if next.is_none() {
                for child in &current.children {
                    if let SegmentKey::Param(ty) = &child.key {
                        let parsed = match ty {
                            ParamType::Uint => parse_uint(segment).map(PathSegment::Uint),
                            ParamType::Int => parse_int(segment).map(PathSegment::Int),
                            ParamType::Uuid => parse_uuid(segment).map(PathSegment::Uuid),
                            ParamType::Str => Some(PathSegment::Str(segment)),
                        };
                        if let Some(value) = parsed {
                            out.push(value);
                            next = Some(child);
                            break;
                        }
                    }
                }
            }

            if next.is_none() {
                for child in &current.children {
                    if matches!(child.key, SegmentKey::Wildcard) {
                        out.push(PathSegment::Str(&p[pos..]));
                        return child.handler.as_ref().map(|_| child);
                    }
                }
            }

            current = next?;
            pos = next_pos;
        }

        if current.handler.is_some() {
            Some(current)
        } else {
            None
        }
    }
}

fn parse_uint(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_int(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_uuid(s: &str) -> Option<uuid::Uuid> {
    if s.len() != 36 {
        return None;
    }
    uuid::Uuid::try_parse(s).ok()
}

/// Method-split route tables. GET and POST each get their own trie; groups
/// apply to both so a prefix pushed once scopes every verb registered under
/// it.
pub struct Router {
    get_routes: RouteTrie,
    post_routes: RouteTrie,
    next_id: u32,
}

impl Router {
    pub fn new() -> Self {
        Self {
            get_routes: RouteTrie::new(),
            post_routes: RouteTrie::new(),
            next_id: 1,
        }
    }

    /// Returns the route id used to key per-route middleware.
    pub fn register(&mut self, method: Method, path: &str, handler: Handler) -> u32 {
        if path.is_empty() || !path.starts_with('/') {
            fatal(&format!("Router: route path '{path}' must start with '/'"));
        }

        let id = self.next_id;
        self.next_id += 1;

        match method {
            Method::Get => self.get_routes.insert(path, handler, id),
            Method::Post => self.post_routes.insert(path, handler, id),
        }
        id
    }

    pub fn push_group(&mut self, prefix: &str) {
        self.get_routes.push_group(prefix);
        self.post_routes.push_group(prefix);
    }

    pub fn pop_group(&mut self) {
        self.get_routes.pop_group();
        self.post_routes.pop_group();
    }

    /// Query string (first `?` on) is stripped before matching. Typed
    /// segments are appended to `out` in match order.
    pub fn match_route<'a, 's>(
        &'s self,
        method: Method,
        path: &'a str,
        out: &mut Vec<PathSegment<'a>>,
    ) -> Option<&'s TrieNode> {
        let path = &path[..path.find('?').unwrap_or(path.len())];
        match method {
            Method::Get => self.get_routes.match_route(path, out),
            Method::Post => self.post_routes.match_route(path, out),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(_req: &Request, _res: &mut Response) {}
    fn h2(_req: &Request, _res: &mut Response) {}

    fn matched(router: &Router, method: Method, path: &str) -> Option<(u32, Vec<String>)> {
        let mut segs = Vec::new();
        router.match_route(method, path, &mut segs).map(|node| {
            let rendered = segs
                .iter()
                .map(|s| match s {
                    PathSegment::Uint(v) => format!("u:{v}"),
                    PathSegment::Int(v) => format!("i:{v}"),
                    PathSegment::Str(v) => format!("s:{v}"),
                    PathSegment::Uuid(v) => format!("id:{v}"),
                })
                .collect();
            (node.route_id(), rendered)
        })
    }

    #[test]
    fn static_routes() {
        let mut router = Router::new();
        router.register(Method::Get, "/hello/world", h);

        assert!(matched(&router, Method::Get, "/hello/world").is_some());
        assert!(matched(&router, Method::Get, "/hello").is_none());
        assert!(matched(&router, Method::Post, "/hello/world").is_none());
    }

    #[test]
    fn root_route() {
        let mut router = Router::new();
        router.register(Method::Get, "/", h);
        assert!(matched(&router, Method::Get, "/").is_some());
        assert!(matched(&router, Method::Get, "/x").is_none());
    }

    #[test]
    fn typed_params_in_declaration_order() {
        let mut router = Router::new();
        router.register(Method::Get, "/u/<id:uint>/posts/<slug:string>", h);

        let (_, segs) = matched(&router, Method::Get, "/u/42/posts/intro").unwrap();
        assert_eq!(segs, vec!["u:42", "s:intro"]);
    }

    #[test]
    fn uint_param_rejects_non_numeric() {
        let mut router = Router::new();
        router.register(Method::Get, "/u/<id:uint>", h);
        assert!(matched(&router, Method::Get, "/u/42").is_some());
        assert!(matched(&router, Method::Get, "/u/abc").is_none());
        assert!(matched(&router, Method::Get, "/u/-3").is_none());
        assert!(matched(&router, Method::Get, "/u/+3").is_none());
    }

    #[test]
    fn int_param_accepts_negative() {
        let mut router = Router::new();
        router.register(Method::Get, "/t/<int>", h);
        let (_, segs) = matched(&router, Method::Get, "/t/-17").unwrap();
        assert_eq!(segs, vec!["i:-17"]);
    }

    #[test]
    fn uuid_param() {
        let mut router = Router::new();
        router.register(Method::Get, "/obj/<uuid>", h);
        let (_, segs) = matched(&router, Method::Get, "/obj/6f1c7a1e-9f2b-4f3d-8c5a-2b1d0e9f8a7b").unwrap();
        assert_eq!(segs, vec!["id:6f1c7a1e-9f2b-4f3d-8c5a-2b1d0e9f8a7b"]);
        assert!(matched(&router, Method::Get, "/obj/not-a-uuid").is_none());
    }

    #[test]
    fn static_wins_over_param_at_same_depth() {
        let mut router = Router::new();
        router.register(Method::Get, "/u/<id:uint>", h);
        let me = router.register(Method::Get, "/u/me", h2);

        let (id, segs) = matched(&router, Method::Get, "/u/me").unwrap();
        assert_eq!(id, me);
        assert!(segs.is_empty(), "static match must not capture a segment");
    }

    #[test]
    fn params_tried_in_declaration_order() {
        let mut router = Router::new();
        let uint_route = router.register(Method::Get, "/v/<uint>", h);
        let str_route = router.register(Method::Get, "/v/<string>", h2);

        let (id, segs) = matched(&router, Method::Get, "/v/7").unwrap();
        assert_eq!(id, uint_route);
        assert_eq!(segs, vec!["u:7"]);

        let (id, segs) = matched(&router, Method::Get, "/v/seven").unwrap();
        assert_eq!(id, str_route);
        assert_eq!(segs, vec!["s:seven"]);
    }

    #[test]
    fn wildcard_captures_remainder_with_slashes() {
        let mut router = Router::new();
        router.register(Method::Get, "/files/*", h);

        let (_, segs) = matched(&router, Method::Get, "/files/a/b/c.txt").unwrap();
        assert_eq!(segs, vec!["s:a/b/c.txt"]);

        assert!(matched(&router, Method::Get, "/files").is_none());
    }

    #[test]
    fn query_string_is_stripped() {
        let mut router = Router::new();
        router.register(Method::Get, "/s/<string>", h);
        let (_, segs) = matched(&router, Method::Get, "/s/term?page=2").unwrap();
        assert_eq!(segs, vec!["s:term"]);
    }

    #[test]
    fn groups_nest_and_pop() {
        let mut router = Router::new();
        router.push_group("/api");
        router.register(Method::Get, "/ping", h);
        router.push_group("/v1");
        router.register(Method::Get, "/users", h);
        router.pop_group();
        router.register(Method::Get, "/health", h);
        router.pop_group();
        router.register(Method::Get, "/top", h);

        assert!(matched(&router, Method::Get, "/api/ping").is_some());
        assert!(matched(&router, Method::Get, "/api/v1/users").is_some());
        assert!(matched(&router, Method::Get, "/api/health").is_some());
        assert!(matched(&router, Method::Get, "/top").is_some());
        assert!(matched(&router, Method::Get, "/ping").is_none());
        assert!(matched(&router, Method::Get, "/v1/users").is_none());
    }

    #[test]
    fn insertion_is_order_insensitive_and_match_stable() {
        let routes = ["/a/b", "/a/<id:uint>", "/a/b/c", "/z"];

        let mut forward = Router::new();
        for r in routes {
            forward.register(Method::Get, r, h);
        }
        let mut backward = Router::new();
        for r in routes.iter().rev() {
            backward.register(Method::Get, r, h);
        }

        for probe in ["/a/b", "/a/7", "/a/b/c", "/z", "/a/q"] {
            let f = matched(&forward, Method::Get, probe).map(|(_, s)| s);
            let b = matched(&backward, Method::Get, probe).map(|(_, s)| s);
            assert_eq!(f, b, "probe {probe}");
            // Re-matching with no mutation yields the same result
            let f2 = matched(&forward, Method::Get, probe).map(|(_, s)| s);
            assert_eq!(f, f2);
        }
    }

    #[test]
    fn intermediate_node_without_handler_does_not_match() {
        let mut router = Router::new();
        router.register(Method::Get, "/a/b/c", h);
        assert!(matched(&router, Method::Get, "/a/b").is_none());
    }
}
