// src/router.rs
//
// Hierarchical REST router. Each node holds an optional root handler and a
// list of routes; a route pairs a path spec (literal or regex), a
// verb/parameter filter, and a child router. Matching threads a
// ParsingContext through the tree so handlers can address nested resources.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::http::RestParams;
use crate::rest::{RestConnection, RestRequest};

/// Result of processing a request against a router subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Didn't match; the caller keeps searching.
    NoMatch,
    /// Matched and handled.
    Matched,
    /// Matched, but the handler reported an error response.
    Error,
    /// Matched; the response will be sent asynchronously.
    Async,
}

/* PATH SPEC */

/// Matches a prefix of the remaining URL path: either a literal fragment or
/// a regex anchored at the start of the remainder.
#[derive(Clone, Debug)]
pub enum PathSpec {
    Literal(String),
    Regex {
        pattern: String,
        rex: Regex,
        desc: String,
    },
}

impl PathSpec {
    /// Number of entries this spec appends to `resources` on a match: one
    /// for a literal, one plus one per capture group for a regex.
    pub fn num_captured_elements(&self) -> usize {
        match self {
            PathSpec::Literal(_) => 1,
            PathSpec::Regex { rex, .. } => rex.captures_len(),
        }
    }

    pub fn path_desc(&self) -> String {
        match self {
            PathSpec::Literal(path) => path.clone(),
            PathSpec::Regex { pattern, desc, .. } => {
                if desc.is_empty() {
                    pattern.clone()
                } else {
                    desc.clone()
                }
            }
        }
    }

    /// Consume a prefix of `ctx.remaining`, pushing captured elements.
    fn match_path(&self, ctx: &mut ParsingContext) -> bool {
        match self {
            PathSpec::Literal(lit) => {
                if ctx.remaining.starts_with(lit.as_str()) {
                    ctx.resources.push(lit.clone());
                    ctx.remaining = ctx.remaining[lit.len()..].to_string();
                    true
                } else {
                    false
                }
            }
            PathSpec::Regex { rex, .. } => match rex.captures(&ctx.remaining) {
                Some(caps) => {
                    let full = caps.get(0).expect("group 0 always present");
                    for i in 0..caps.len() {
                        ctx.resources
                            .push(caps.get(i).map(|m| m.as_str()).unwrap_or("").to_string());
                    }
                    ctx.remaining = ctx.remaining[full.end()..].to_string();
                    true
                }
                None => false,
            },
        }
    }

    fn describe(&self) -> Value {
        match self {
            PathSpec::Literal(path) => json!(path),
            PathSpec::Regex { pattern, desc, .. } => json!({
                "regex": pattern,
                "desc": desc,
            }),
        }
    }
}

impl From<&str> for PathSpec {
    fn from(path: &str) -> Self {
        PathSpec::Literal(path.to_string())
    }
}

/// Shortcut for a regex path spec, anchored at the start of the remaining
/// path. Capture groups contribute to the resources list.
pub fn rx(pattern: &str, desc: &str) -> PathSpec {
    let rex = Regex::new(&format!("^(?:{})", pattern))
        .unwrap_or_else(|e| panic!("invalid route regex {:?}: {}", pattern, e));
    PathSpec::Regex {
        pattern: pattern.to_string(),
        rex,
        desc: desc.to_string(),
    }
}

/* REQUEST FILTER */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterLocation {
    Query,
    Header,
}

#[derive(Debug, Clone)]
pub struct ParamFilter {
    pub location: FilterLocation,
    pub param: String,
    pub value: String,
}

/// Filters a route by verb set and by request parameters. An empty verb set
/// matches any verb. Entries of the form `key=value` test a query
/// parameter; `header:key=value` tests a header, key case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    verbs: BTreeSet<String>,
    filters: Vec<ParamFilter>,
}

impl RequestFilter {
    /// Matches any verb, no parameter constraints.
    pub fn any() -> Self {
        RequestFilter::default()
    }

    pub fn verbs(&self) -> &BTreeSet<String> {
        &self.verbs
    }

    fn add_entry(&mut self, entry: &str) {
        match entry.split_once('=') {
            None => {
                self.verbs.insert(entry.to_string());
            }
            Some((key, value)) => {
                let (location, param) = match key.strip_prefix("header:") {
                    Some(name) => (FilterLocation::Header, name),
                    None => (FilterLocation::Query, key),
                };
                self.filters.push(ParamFilter {
                    location,
                    param: param.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    fn matches(&self, request: &RestRequest) -> bool {
        if !self.verbs.is_empty() && !self.verbs.contains(&request.verb) {
            return false;
        }
        self.filters.iter().all(|f| match f.location {
            FilterLocation::Query => request
                .params
                .iter()
                .any(|(k, v)| k == f.param && v == f.value),
            FilterLocation::Header => request.headers.get(&f.param) == Some(f.value.as_str()),
        })
    }

    fn describe(&self) -> Value {
        let mut out = json!({});
        if !self.verbs.is_empty() {
            out["verbs"] = json!(self.verbs.iter().collect::<Vec<_>>());
        }
        if !self.filters.is_empty() {
            let rendered: Vec<String> = self
                .filters
                .iter()
                .map(|f| {
                    let prefix = match f.location {
                        FilterLocation::Header => "header:",
                        FilterLocation::Query => "",
                    };
                    format!("{}{}={}", prefix, f.param, f.value)
                })
                .collect();
            out["filters"] = json!(rendered);
        }
        out
    }
}

impl From<&str> for RequestFilter {
    fn from(entry: &str) -> Self {
        let mut filter = RequestFilter::default();
        filter.add_entry(entry);
        filter
    }
}

impl<const N: usize> From<[&str; N]> for RequestFilter {
    fn from(entries: [&str; N]) -> Self {
        let mut filter = RequestFilter::default();
        for entry in entries {
            filter.add_entry(entry);
        }
        filter
    }
}

/* PARSING CONTEXT */

/// Snapshot of a context, for scoped save/restore around route attempts.
pub struct ContextState {
    remaining: String,
    resources_len: usize,
    objects_len: usize,
}

/// Per-request state threaded through the route tree: the unmatched path
/// suffix, the captured path elements, and a stack of typed payloads
/// attached by extractor hooks.
pub struct ParsingContext {
    pub remaining: String,
    pub resources: Vec<String>,
    objects: Vec<Box<dyn Any + Send>>,
}

impl ParsingContext {
    pub fn new(request: &RestRequest) -> Self {
        ParsingContext {
            remaining: request.resource.clone(),
            resources: Vec::new(),
            objects: Vec::new(),
        }
    }

    /// Attach a typed payload for downstream handlers.
    pub fn add_object<T: Send + 'static>(&mut self, obj: T) {
        self.objects.push(Box::new(obj));
    }

    /// Attach a shared payload; retrieve it with [`shared_object`](Self::shared_object).
    pub fn add_shared<T: Send + Sync + 'static>(&mut self, obj: Arc<T>) {
        self.objects.push(Box::new(obj));
    }

    /// The most recently attached payload of type `T`.
    pub fn find_object<T: 'static>(&self) -> Option<&T> {
        self.objects
            .iter()
            .rev()
            .find_map(|entry| entry.downcast_ref::<T>())
    }

    pub fn shared_object<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.objects
            .iter()
            .rev()
            .find_map(|entry| entry.downcast_ref::<Arc<T>>())
            .cloned()
    }

    pub fn objects_len(&self) -> usize {
        self.objects.len()
    }

    pub fn save(&self) -> ContextState {
        ContextState {
            remaining: self.remaining.clone(),
            resources_len: self.resources.len(),
            objects_len: self.objects.len(),
        }
    }

    pub fn restore(&mut self, state: ContextState) {
        self.remaining = state.remaining;
        self.resources.truncate(state.resources_len);
        self.objects.truncate(state.objects_len);
    }
}

/* ROUTER */

/// Terminal handler: consumes the request and produces a response through
/// the connection.
pub type OnProcessRequest = Arc<
    dyn Fn(&mut dyn RestConnection, &RestRequest, &mut ParsingContext) -> MatchResult
        + Send
        + Sync,
>;

/// Hook run after a route matches, to attach objects to the context or to
/// emit an early error response.
pub type ExtractObject =
    Arc<dyn Fn(&mut dyn RestConnection, &RestRequest, &mut ParsingContext) + Send + Sync>;

/// Wrap a closure as a terminal handler.
pub fn on<F>(f: F) -> OnProcessRequest
where
    F: Fn(&mut dyn RestConnection, &RestRequest, &mut ParsingContext) -> MatchResult
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

enum RouterNode {
    Owned(Box<Router>),
    Shared(Arc<Router>),
}

impl RouterNode {
    fn get(&self) -> &Router {
        match self {
            RouterNode::Owned(router) => router,
            RouterNode::Shared(router) => router,
        }
    }
}

pub struct Route {
    path: PathSpec,
    filter: RequestFilter,
    router: RouterNode,
    extract: Option<ExtractObject>,
}

impl Route {
    fn process(
        &self,
        conn: &mut dyn RestConnection,
        request: &RestRequest,
        ctx: &mut ParsingContext,
    ) -> MatchResult {
        if !self.filter.matches(request) {
            return MatchResult::NoMatch;
        }

        let saved = ctx.save();
        if !self.path.match_path(ctx) {
            ctx.restore(saved);
            return MatchResult::NoMatch;
        }

        if let Some(extract) = &self.extract {
            extract(conn, request, ctx);
            if conn.response_sent() {
                ctx.restore(saved);
                return MatchResult::Matched;
            }
        }

        let result = self.router.get().process_request(conn, request, ctx);
        // Context mutations are visible to the subtree only.
        ctx.restore(saved);
        result
    }

    fn options(
        &self,
        verbs: &mut BTreeSet<String>,
        help: &mut Value,
        request: &RestRequest,
        ctx: &mut ParsingContext,
    ) {
        let saved = ctx.save();
        if self.path.match_path(ctx) {
            if ctx.remaining.is_empty() {
                verbs.extend(self.filter.verbs.iter().cloned());
                let key = format!("{} {}", self.path.path_desc(), verbs_str(&self.filter.verbs));
                help[key] = json!({
                    "path": self.path.describe(),
                    "filter": self.filter.describe(),
                    "description": self.router.get().description,
                });
            }
            self.router.get().options(verbs, help, request, ctx);
        }
        ctx.restore(saved);
    }
}

fn verbs_str(verbs: &BTreeSet<String>) -> String {
    verbs.iter().cloned().collect::<Vec<_>>().join(",")
}

/// One node of the route tree.
pub struct Router {
    root_handler: Option<OnProcessRequest>,
    pub description: String,
    terminal: bool,
    arg_help: Option<Value>,
    routes: Vec<Route>,
    trace: bool,
}

impl Router {
    pub fn new() -> Self {
        Router {
            root_handler: None,
            description: String::new(),
            terminal: false,
            arg_help: None,
            routes: Vec::new(),
            trace: false,
        }
    }

    /// Terminal node wrapping a handler.
    pub fn terminal(
        handler: OnProcessRequest,
        description: &str,
        arg_help: Option<Value>,
    ) -> Self {
        Router {
            root_handler: Some(handler),
            description: description.to_string(),
            terminal: true,
            arg_help,
            routes: Vec::new(),
            trace: false,
        }
    }

    /// Enable per-request trace events on this node. Threaded explicitly;
    /// there is no process-wide switch.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Add a terminal route: `path` + `filter` dispatching to `handler`.
    pub fn add_route(
        &mut self,
        path: impl Into<PathSpec>,
        filter: impl Into<RequestFilter>,
        description: &str,
        handler: OnProcessRequest,
    ) {
        self.add_route_with_help(path, filter, description, handler, None);
    }

    pub fn add_route_with_help(
        &mut self,
        path: impl Into<PathSpec>,
        filter: impl Into<RequestFilter>,
        description: &str,
        handler: OnProcessRequest,
        arg_help: Option<Value>,
    ) {
        assert!(
            self.root_handler.is_none(),
            "cannot add a sub-route to a terminal route"
        );
        self.routes.push(Route {
            path: path.into(),
            filter: filter.into(),
            router: RouterNode::Owned(Box::new(Router::terminal(
                handler,
                description,
                arg_help,
            ))),
            extract: None,
        });
    }

    /// Add a nested router and return it for further building.
    pub fn add_sub_router(&mut self, path: impl Into<PathSpec>, description: &str) -> &mut Router {
        self.add_sub_router_with(path, description, None)
    }

    /// Nested router with an extractor hook that runs after the path
    /// matches, before recursion.
    pub fn add_sub_router_with(
        &mut self,
        path: impl Into<PathSpec>,
        description: &str,
        extract: Option<ExtractObject>,
    ) -> &mut Router {
        assert!(
            self.root_handler.is_none(),
            "cannot add a sub-route to a terminal route"
        );
        let mut child = Router::new();
        child.description = description.to_string();
        child.trace = self.trace;
        self.routes.push(Route {
            path: path.into(),
            filter: RequestFilter::any(),
            router: RouterNode::Owned(Box::new(child)),
            extract,
        });
        match &mut self.routes.last_mut().unwrap().router {
            RouterNode::Owned(router) => router,
            RouterNode::Shared(_) => unreachable!(),
        }
    }

    /// Mount a shared router subtree (for reuse across mount points).
    pub fn mount(
        &mut self,
        path: impl Into<PathSpec>,
        filter: impl Into<RequestFilter>,
        router: Arc<Router>,
        extract: Option<ExtractObject>,
    ) {
        assert!(
            self.root_handler.is_none(),
            "cannot add a sub-route to a terminal route"
        );
        self.routes.push(Route {
            path: path.into(),
            filter: filter.into(),
            router: RouterNode::Shared(router),
            extract,
        });
    }

    /// Mount a route answering with a JSON help document for the tree as it
    /// is at this moment; call after the rest of the tree is built.
    pub fn add_help_route(&mut self, path: impl Into<PathSpec>, filter: impl Into<RequestFilter>) {
        let help = render_help(&self.describe());
        let body = serde_json::to_vec_pretty(&help).unwrap_or_default();
        self.add_route(
            path,
            filter,
            "Get help on the available API commands",
            on(move |conn, _req, _ctx| {
                let _ = conn.send_response(200, &body, "application/json");
                MatchResult::Matched
            }),
        );
    }

    /// Dispatch a request. Sends 404 when nothing matches, or synthesizes
    /// an OPTIONS response from the matching routes' verb sets.
    pub fn handle_request(&self, conn: &mut dyn RestConnection, request: &RestRequest) {
        let mut ctx = ParsingContext::new(request);
        let result = self.process_request(conn, request, &mut ctx);
        if result == MatchResult::NoMatch {
            if request.verb == "OPTIONS" {
                self.send_options_response(conn, request, &mut ctx);
            } else {
                let _ = conn.send_error_response(
                    404,
                    &format!("unknown resource {} {}", request.verb, request.resource),
                );
            }
        }
    }

    /// Walk this subtree. `NoMatch` means the caller keeps searching.
    pub fn process_request(
        &self,
        conn: &mut dyn RestConnection,
        request: &RestRequest,
        ctx: &mut ParsingContext,
    ) -> MatchResult {
        if self.trace {
            tracing::debug!(
                "processing {} {} remaining={:?} against {:?} with {} routes",
                request.verb,
                request.resource,
                ctx.remaining,
                self.description,
                self.routes.len()
            );
        }

        if let Some(handler) = &self.root_handler
            && (!self.terminal || ctx.remaining.is_empty())
        {
            return match panic::catch_unwind(AssertUnwindSafe(|| handler(conn, request, ctx))) {
                Ok(result) => result,
                Err(payload) => self.handle_panic(conn, payload),
            };
        }

        for route in &self.routes {
            match panic::catch_unwind(AssertUnwindSafe(|| route.process(conn, request, ctx))) {
                Ok(MatchResult::NoMatch) => continue,
                Ok(result) => return result,
                Err(payload) => return self.handle_panic(conn, payload),
            }
        }

        MatchResult::NoMatch
    }

    fn handle_panic(
        &self,
        conn: &mut dyn RestConnection,
        payload: Box<dyn Any + Send>,
    ) -> MatchResult {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        tracing::error!("handler panic: {}", message);
        if !conn.response_sent() {
            let _ = conn.send_error_response(500, &format!("handler failed: {}", message));
        }
        MatchResult::Matched
    }

    /// Collect the verbs accepted at the current context position, plus
    /// per-route help entries.
    pub fn options(
        &self,
        verbs: &mut BTreeSet<String>,
        help: &mut Value,
        request: &RestRequest,
        ctx: &mut ParsingContext,
    ) {
        for route in &self.routes {
            route.options(verbs, help, request, ctx);
        }
    }

    fn send_options_response(
        &self,
        conn: &mut dyn RestConnection,
        request: &RestRequest,
        ctx: &mut ParsingContext,
    ) {
        let mut verbs = BTreeSet::new();
        let mut help = json!({});
        self.options(&mut verbs, &mut help, request, ctx);

        let mut headers = RestParams::new();
        headers.push("Allow", verbs_str(&verbs));
        if verbs.is_empty() {
            let _ = conn.send_http_response(400, b"", "", &headers);
        } else {
            let body = serde_json::to_vec_pretty(&help).unwrap_or_default();
            let _ = conn.send_http_response(200, &body, "application/json", &headers);
        }
    }

    /// Export the route tree as data. Rendering (help text, docs) is a
    /// separate concern; see [`render_help`].
    pub fn describe(&self) -> RouterDescription {
        RouterDescription {
            description: self.description.clone(),
            terminal: self.terminal,
            arg_help: self.arg_help.clone(),
            routes: self
                .routes
                .iter()
                .map(|route| RouteEntry {
                    path: route.path.path_desc(),
                    path_spec: route.path.describe(),
                    verbs: route.filter.verbs.iter().cloned().collect(),
                    filter: route.filter.describe(),
                    router: route.router.get().describe(),
                })
                .collect(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/* ROUTE TREE DESCRIPTIONS */

#[derive(Debug, Clone, Serialize)]
pub struct RouterDescription {
    pub description: String,
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg_help: Option<Value>,
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteEntry {
    pub path: String,
    pub path_spec: Value,
    pub verbs: Vec<String>,
    pub filter: Value,
    pub router: RouterDescription,
}

/// Render a description tree into the flat help document served by
/// [`Router::add_help_route`]: one entry per path, keyed by
/// `"<path> <verbs>"`.
pub fn render_help(description: &RouterDescription) -> Value {
    let mut out = json!({});
    walk_help(description, "", &mut out);
    out
}

fn walk_help(description: &RouterDescription, current_path: &str, out: &mut Value) {
    for entry in &description.routes {
        let path = format!("{}{}", current_path, entry.path);
        let key = if entry.verbs.is_empty() {
            path.clone()
        } else {
            format!("{} {}", path, entry.verbs.join(","))
        };
        let mut rendered = json!({
            "description": entry.router.description,
        });
        if let Some(arg_help) = &entry.router.arg_help {
            rendered["arguments"] = arg_help.clone();
        }
        if !entry.filter.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            rendered["filter"] = entry.filter.clone();
        }
        out[key] = rendered;
        walk_help(&entry.router, &path, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::InProcessRestConnection;

    fn items_router() -> Router {
        let mut router = Router::new();
        let v1 = router.add_sub_router("/v1", "version 1 API");
        v1.add_route(
            "/items",
            "GET",
            "list items",
            on(|conn, _req, ctx| {
                let body = format!(
                    "resources={:?} remaining={:?}",
                    ctx.resources, ctx.remaining
                );
                conn.send_response(200, body.as_bytes(), "text/plain").unwrap();
                MatchResult::Matched
            }),
        );
        router
    }

    #[test]
    fn literal_route_dispatch() {
        let router = items_router();
        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/v1/items"));

        assert_eq!(conn.status, 200);
        assert_eq!(
            conn.body_str(),
            "resources=[\"/v1\", \"/items\"] remaining=\"\""
        );
    }

    #[test]
    fn unknown_resource_is_404() {
        let router = items_router();
        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/v1/other"));
        assert_eq!(conn.status, 404);
    }

    #[test]
    fn verb_filter_is_enforced() {
        let router = items_router();
        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("DELETE", "/v1/items"));
        assert_eq!(conn.status, 404);
    }

    #[test]
    fn regex_route_captures() {
        let mut router = Router::new();
        let v1 = router.add_sub_router("/v1", "version 1 API");
        v1.add_route(
            rx("/items/([0-9]+)", "/items/<id>"),
            "GET",
            "get one item",
            on(|conn, _req, ctx| {
                let body = ctx.resources.join("|");
                conn.send_response(200, body.as_bytes(), "text/plain").unwrap();
                MatchResult::Matched
            }),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/v1/items/42"));
        assert_eq!(conn.status, 200);
        assert_eq!(conn.body_str(), "/v1|/items/42|42");

        // Non-numeric id yields NoMatch, hence 404, not an error.
        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/v1/items/abc"));
        assert_eq!(conn.status, 404);
    }

    #[test]
    fn resources_count_matches_captured_elements() {
        let spec = rx("/items/([0-9]+)/tags/([a-z]+)", "");
        assert_eq!(spec.num_captured_elements(), 3);

        let mut ctx = ParsingContext::new(&RestRequest::new("GET", "/items/7/tags/red"));
        assert!(spec.match_path(&mut ctx));
        assert_eq!(ctx.resources.len(), 3);
        assert_eq!(ctx.resources, vec!["/items/7/tags/red", "7", "red"]);
        assert!(ctx.remaining.is_empty());
    }

    #[test]
    fn sibling_matching_restores_context() {
        let mut router = Router::new();
        let first = router.add_sub_router("/api", "api");
        // A subtree that matches the prefix but not the rest.
        first.add_route(
            "/nope",
            "GET",
            "never matches",
            on(|_conn, _req, _ctx| MatchResult::Matched),
        );
        router.add_route(
            "/api/real",
            "GET",
            "the real one",
            on(|conn, _req, ctx| {
                conn.send_response(200, ctx.resources.join("|").as_bytes(), "text/plain")
                    .unwrap();
                MatchResult::Matched
            }),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/api/real"));
        assert_eq!(conn.status, 200);
        // The failed sibling attempt left no residue.
        assert_eq!(conn.body_str(), "/api/real");
    }

    #[test]
    fn options_synthesizes_allow_header() {
        let mut router = Router::new();
        router.add_route("/x", "GET", "get x", on(|_c, _r, _x| MatchResult::Matched));
        router.add_route("/x", "POST", "post x", on(|_c, _r, _x| MatchResult::Matched));

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("OPTIONS", "/x"));
        assert_eq!(conn.status, 200);
        assert_eq!(conn.headers.get("Allow"), Some("GET,POST"));
    }

    #[test]
    fn options_with_no_matching_route_is_400() {
        let mut router = Router::new();
        router.add_route("/x", "GET", "get x", on(|_c, _r, _x| MatchResult::Matched));

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("OPTIONS", "/zzz"));
        assert_eq!(conn.status, 400);
    }

    #[test]
    fn handler_panic_becomes_500() {
        let mut router = Router::new();
        router.add_route(
            "/boom",
            "GET",
            "panics",
            on(|_conn, _req, _ctx| panic!("kaboom")),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/boom"));
        assert_eq!(conn.status, 500);
        assert!(conn.body_str().contains("kaboom"));
    }

    #[test]
    fn param_filters_select_among_routes() {
        let mut router = Router::new();
        router.add_route(
            "/data",
            ["GET", "format=csv"],
            "csv variant",
            on(|conn, _r, _x| {
                conn.send_response(200, b"csv", "text/csv").unwrap();
                MatchResult::Matched
            }),
        );
        router.add_route(
            "/data",
            "GET",
            "default variant",
            on(|conn, _r, _x| {
                conn.send_response(200, b"json", "application/json").unwrap();
                MatchResult::Matched
            }),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(
            &mut conn,
            &RestRequest::from_target("GET", "/data?format=csv"),
        );
        assert_eq!(conn.body_str(), "csv");

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::from_target("GET", "/data"));
        assert_eq!(conn.body_str(), "json");
    }

    #[test]
    fn header_filter_matches_case_insensitively() {
        let mut router = Router::new();
        router.add_route(
            "/hooks",
            ["POST", "header:x-event=push"],
            "push hook",
            on(|conn, _r, _x| {
                conn.send_response(200, b"push", "text/plain").unwrap();
                MatchResult::Matched
            }),
        );

        let mut req = RestRequest::new("POST", "/hooks");
        req.headers.push("X-Event", "push");
        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &req);
        assert_eq!(conn.body_str(), "push");

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("POST", "/hooks"));
        assert_eq!(conn.status, 404);
    }

    #[test]
    fn extractor_attaches_objects() {
        struct Dataset {
            name: String,
        }

        let mut router = Router::new();
        let datasets = router.add_sub_router_with(
            rx("/datasets/([a-z]+)", "/datasets/<name>"),
            "operations on one dataset",
            Some(Arc::new(|_conn: &mut dyn RestConnection,
                           _req: &RestRequest,
                           ctx: &mut ParsingContext| {
                let name = ctx.resources.last().unwrap().clone();
                ctx.add_object(Dataset { name });
            })),
        );
        datasets.add_route(
            "/info",
            "GET",
            "dataset info",
            on(|conn, _req, ctx| {
                let dataset = ctx.find_object::<Dataset>().unwrap();
                conn.send_response(200, dataset.name.as_bytes(), "text/plain")
                    .unwrap();
                MatchResult::Matched
            }),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/datasets/alpha/info"));
        assert_eq!(conn.status, 200);
        assert_eq!(conn.body_str(), "alpha");
    }

    #[test]
    fn extractor_error_response_short_circuits() {
        let mut router = Router::new();
        let sub = router.add_sub_router_with(
            rx("/things/([0-9]+)", "/things/<id>"),
            "one thing",
            Some(Arc::new(|conn: &mut dyn RestConnection,
                           _req: &RestRequest,
                           ctx: &mut ParsingContext| {
                if ctx.resources.last().map(|s| s.as_str()) == Some("0") {
                    let _ = conn.send_error_response(404, "thing 0 does not exist");
                }
            })),
        );
        sub.add_route(
            "",
            "GET",
            "fetch",
            on(|conn, _r, _x| {
                conn.send_response(200, b"thing", "text/plain").unwrap();
                MatchResult::Matched
            }),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/things/0"));
        assert_eq!(conn.status, 404);
        assert_eq!(conn.body_str(), "thing 0 does not exist");

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/things/7"));
        assert_eq!(conn.status, 200);
    }

    #[test]
    fn terminal_with_trailing_path_falls_through() {
        let mut router = Router::new();
        router.add_route(
            "/exact",
            "GET",
            "exact only",
            on(|conn, _r, _x| {
                conn.send_response(200, b"ok", "text/plain").unwrap();
                MatchResult::Matched
            }),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/exact/more"));
        assert_eq!(conn.status, 404);
    }

    #[test]
    fn shared_subtree_mounts_at_two_points() {
        let mut shared = Router::new();
        shared.add_route(
            "/ping",
            "GET",
            "ping",
            on(|conn, _r, _x| {
                conn.send_response(200, b"pong", "text/plain").unwrap();
                MatchResult::Matched
            }),
        );
        let shared = Arc::new(shared);

        let mut router = Router::new();
        router.mount("/a", RequestFilter::any(), shared.clone(), None);
        router.mount("/b", RequestFilter::any(), shared, None);

        for path in ["/a/ping", "/b/ping"] {
            let mut conn = InProcessRestConnection::new();
            router.handle_request(&mut conn, &RestRequest::new("GET", path));
            assert_eq!(conn.body_str(), "pong", "path {}", path);
        }
    }

    #[test]
    fn help_route_describes_tree() {
        let mut router = items_router();
        router.add_help_route("/help", "GET");

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/help"));
        assert_eq!(conn.status, 200);
        assert_eq!(conn.content_type, "application/json");

        let doc: Value = serde_json::from_slice(&conn.body).unwrap();
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert!(keys.iter().any(|k| k.contains("/v1/items")));
    }

    #[test]
    fn match_is_deterministic_in_insertion_order() {
        let mut router = Router::new();
        router.add_route(
            rx("/r/([a-z]+)", ""),
            "GET",
            "first",
            on(|conn, _r, _x| {
                conn.send_response(200, b"first", "text/plain").unwrap();
                MatchResult::Matched
            }),
        );
        router.add_route(
            "/r/abc",
            "GET",
            "second",
            on(|conn, _r, _x| {
                conn.send_response(200, b"second", "text/plain").unwrap();
                MatchResult::Matched
            }),
        );

        let mut conn = InProcessRestConnection::new();
        router.handle_request(&mut conn, &RestRequest::new("GET", "/r/abc"));
        assert_eq!(conn.body_str(), "first");
    }
}
