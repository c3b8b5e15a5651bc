//! Path-template router.
//!
//! Templates are slash-delimited; a segment is either a literal, a
//! single-segment parameter `{name}` / `{name:int}`, or a greedy
//! terminal `{name:path}`. Each method owns a segment tree; matching
//! walks it with priority literal > int > str > path, backtracking to
//! the next lower-priority sibling on a dead end. The router is a plain
//! value: build it, register routes, hand it to the server. Nothing
//! global, so every test constructs a fresh one.

use crate::{
    errors::RouteError,
    http::{request::Request, response::Response, types::Method},
    ws::connection::WebSocketConnection,
};
use std::{future::Future, pin::Pin, sync::Arc};

/// Boxed future every handler and middleware resolves to.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;
pub(crate) type HandlerFn = Arc<dyn Fn(Request) -> ResponseFuture + Send + Sync>;
pub(crate) type WsFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type WsHandlerFn = Arc<dyn Fn(WebSocketConnection) -> WsFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Int(String),
    Str(String),
    Path(String),
}

fn compile(template: &str) -> Result<Vec<Segment>, RouteError> {
    if !template.starts_with('/') {
        return Err(RouteError::InvalidTemplate(template.to_string()));
    }

    let mut segments = Vec::new();
    for (index, part) in split_segments(template).iter().enumerate() {
        let segment = if let Some(inner) = part
            .strip_prefix('{')
            .and_then(|p| p.strip_suffix('}'))
        {
            let (name, kind) = match inner.split_once(':') {
                Some((name, kind)) => (name, kind),
                None => (inner, "str"),
            };
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(RouteError::InvalidTemplate(template.to_string()));
            }
            match kind {
                "str" => Segment::Str(name.to_string()),
                "int" => Segment::Int(name.to_string()),
                "path" => Segment::Path(name.to_string()),
                _ => return Err(RouteError::InvalidTemplate(template.to_string())),
            }
        } else if part.contains(['{', '}']) {
            return Err(RouteError::InvalidTemplate(template.to_string()));
        } else {
            Segment::Literal(part.to_string())
        };

        // A greedy segment swallows the rest of the path, so it can
        // only be terminal, and only one may exist.
        if matches!(segment, Segment::Path(_))
            && index + 1 != split_segments(template).len()
        {
            return Err(RouteError::InvalidTemplate(template.to_string()));
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// Split a path into segments: the leading empty segment from the
/// leading `/` is dropped, and one trailing empty segment (trailing
/// slash) is tolerated.
fn split_segments(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = path.split('/').skip(1).collect();
    if parts.last() == Some(&"") {
        parts.pop();
    }
    parts
}

// Segment tree, generic over the endpoint payload so the HTTP and
// WebSocket trees share the matching logic.

struct Node<T> {
    literals: Vec<(String, Node<T>)>,
    int_param: Option<Box<(String, Node<T>)>>,
    str_param: Option<Box<(String, Node<T>)>>,
    path_param: Option<Box<(String, T)>>,
    endpoint: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literals: Vec::new(),
            int_param: None,
            str_param: None,
            path_param: None,
            endpoint: None,
        }
    }
}

impl<T> Node<T> {
    fn insert(
        &mut self,
        segments: &[Segment],
        endpoint: T,
        template: &str,
    ) -> Result<(), RouteError> {
        let Some((head, rest)) = segments.split_first() else {
            if self.endpoint.is_some() {
                return Err(RouteError::Conflict(template.to_string()));
            }
            self.endpoint = Some(endpoint);
            return Ok(());
        };

        match head {
            Segment::Literal(lit) => {
                let child = match self.literals.iter_mut().find(|(l, _)| l == lit) {
                    Some((_, child)) => child,
                    None => {
                        self.literals.push((lit.clone(), Node::default()));
                        &mut self.literals.last_mut().unwrap().1
                    }
                };
                child.insert(rest, endpoint, template)
            }
            Segment::Int(name) => {
                Self::param_child(&mut self.int_param, name, template)?
                    .insert(rest, endpoint, template)
            }
            Segment::Str(name) => {
                Self::param_child(&mut self.str_param, name, template)?
                    .insert(rest, endpoint, template)
            }
            Segment::Path(name) => {
                if self.path_param.is_some() {
                    return Err(RouteError::Conflict(template.to_string()));
                }
                self.path_param = Some(Box::new((name.clone(), endpoint)));
                Ok(())
            }
        }
    }

    fn param_child<'a>(
        slot: &'a mut Option<Box<(String, Node<T>)>>,
        name: &str,
        template: &str,
    ) -> Result<&'a mut Node<T>, RouteError> {
        match slot {
            Some(boxed) if boxed.0 != name => {
                // Two names for the same position would be ambiguous.
                Err(RouteError::Conflict(template.to_string()))
            }
            Some(boxed) => Ok(&mut boxed.1),
            None => {
                *slot = Some(Box::new((name.to_string(), Node::default())));
                Ok(&mut slot.as_mut().unwrap().1)
            }
        }
    }

    /// Match decoded segments against this subtree, collecting captures.
    fn lookup<'a>(
        &'a self,
        segments: &[String],
        params: &mut Vec<(String, String)>,
    ) -> Option<&'a T> {
        let Some((head, rest)) = segments.split_first() else {
            return self.endpoint.as_ref();
        };

        if let Some((_, child)) = self.literals.iter().find(|(lit, _)| lit == head) {
            if let Some(found) = child.lookup(rest, params) {
                return Some(found);
            }
        }

        if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
            if let Some(boxed) = &self.int_param {
                params.push((boxed.0.clone(), head.clone()));
                if let Some(found) = boxed.1.lookup(rest, params) {
                    return Some(found);
                }
                params.pop();
            }
        }

        if !head.is_empty() {
            if let Some(boxed) = &self.str_param {
                params.push((boxed.0.clone(), head.clone()));
                if let Some(found) = boxed.1.lookup(rest, params) {
                    return Some(found);
                }
                params.pop();
            }
        }

        if let Some(boxed) = &self.path_param {
            params.push((boxed.0.clone(), segments.join("/")));
            return Some(&boxed.1);
        }

        None
    }
}

struct Endpoint {
    handler: HandlerFn,
    template: Arc<str>,
}

struct WsEndpoint {
    handler: WsHandlerFn,
}

/// Outcome of routing one request.
pub(crate) enum RouteMatch {
    Found {
        handler: HandlerFn,
        params: Vec<(String, String)>,
        template: Arc<str>,
    },
    MethodNotAllowed {
        allow: Vec<Method>,
    },
    NotFound,
}

/// The route table. Immutable once serving begins; reads are lock-free.
pub struct Router {
    trees: Vec<(Method, Node<Endpoint>)>,
    ws_tree: Node<WsEndpoint>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            trees: Vec::new(),
            ws_tree: Node::default(),
        }
    }

    /// Register `handler` for `method` + `template`.
    ///
    /// # Examples
    /// ```
    /// use polyhttp::{Method, Response, Router};
    ///
    /// let mut router = Router::new();
    /// router
    ///     .route(Method::Get, "/users/{id:int}", |req| async move {
    ///         let id = req.param("id").unwrap_or("?").to_string();
    ///         Response::text(id)
    ///     })
    ///     .unwrap();
    /// ```
    pub fn route<F, Fut>(
        &mut self,
        method: Method,
        template: &str,
        handler: F,
    ) -> Result<(), RouteError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let segments = compile(template)?;
        let endpoint = Endpoint {
            handler: Arc::new(move |req| Box::pin(handler(req)) as ResponseFuture),
            template: Arc::from(template),
        };

        let tree = match self.trees.iter_mut().find(|(m, _)| *m == method) {
            Some((_, tree)) => tree,
            None => {
                self.trees.push((method, Node::default()));
                &mut self.trees.last_mut().unwrap().1
            }
        };
        tree.insert(&segments, endpoint, template)
    }

    pub fn get<F, Fut>(&mut self, template: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Get, template, handler)
    }

    pub fn post<F, Fut>(&mut self, template: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Post, template, handler)
    }

    pub fn put<F, Fut>(&mut self, template: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Put, template, handler)
    }

    pub fn delete<F, Fut>(&mut self, template: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Delete, template, handler)
    }

    pub fn patch<F, Fut>(&mut self, template: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Patch, template, handler)
    }

    /// Register a WebSocket handler for upgrade requests on `template`.
    /// The handler owns the connection until it returns.
    pub fn websocket<F, Fut>(&mut self, template: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(WebSocketConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let segments = compile(template)?;
        let endpoint = WsEndpoint {
            handler: Arc::new(move |conn| Box::pin(handler(conn)) as WsFuture),
        };
        self.ws_tree.insert(&segments, endpoint, template)
    }

    /// Route a request path. Segments are percent-decoded after
    /// splitting, so an encoded slash never separates segments.
    pub(crate) fn match_route(&self, method: &Method, path: &str) -> RouteMatch {
        let segments = decode_segments(path);

        if let Some(tree) = self.tree(method) {
            let mut params = Vec::new();
            if let Some(endpoint) = tree.lookup(&segments, &mut params) {
                return RouteMatch::Found {
                    handler: endpoint.handler.clone(),
                    params,
                    template: endpoint.template.clone(),
                };
            }
        }

        let mut allow: Vec<Method> = Vec::new();
        for (m, tree) in &self.trees {
            if m == method {
                continue;
            }
            let mut params = Vec::new();
            if tree.lookup(&segments, &mut params).is_some() {
                allow.push(m.clone());
            }
        }

        if allow.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodNotAllowed { allow }
        }
    }

    pub(crate) fn match_websocket(
        &self,
        path: &str,
    ) -> Option<(WsHandlerFn, Vec<(String, String)>)> {
        let segments = decode_segments(path);
        let mut params = Vec::new();
        let endpoint = self.ws_tree.lookup(&segments, &mut params)?;
        Some((endpoint.handler.clone(), params))
    }

    fn tree(&self, method: &Method) -> Option<&Node<Endpoint>> {
        self.trees.iter().find(|(m, _)| m == method).map(|(_, t)| t)
    }
}

fn decode_segments(path: &str) -> Vec<String> {
    split_segments(path)
        .into_iter()
        .map(|seg| match crate::http::types::percent_decode(seg.as_bytes()) {
            Some(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
            None => seg.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(tag: &'static str) -> impl Fn(Request) -> ResponseFuture + Send + Sync + Clone {
        move |_req| Box::pin(async move { Response::text(tag) }) as ResponseFuture
    }

    fn matched(router: &Router, method: Method, path: &str) -> Option<Vec<(String, String)>> {
        match router.match_route(&method, path) {
            RouteMatch::Found { params, .. } => Some(params),
            _ => None,
        }
    }

    #[test]
    fn literal_match() {
        let mut router = Router::new();
        router.get("/hello", handler("hello")).unwrap();

        assert_eq!(matched(&router, Method::Get, "/hello"), Some(vec![]));
        assert_eq!(matched(&router, Method::Get, "/hello/"), Some(vec![]));
        assert!(matched(&router, Method::Get, "/other").is_none());
        assert!(matched(&router, Method::Get, "/hello/x").is_none());
    }

    #[test]
    fn typed_params() {
        let mut router = Router::new();
        router.get("/users/{id:int}", handler("int")).unwrap();
        router.get("/users/{name}", handler("str")).unwrap();
        router.get("/files/{rest:path}", handler("path")).unwrap();

        assert_eq!(
            matched(&router, Method::Get, "/users/42"),
            Some(vec![("id".into(), "42".into())])
        );
        assert_eq!(
            matched(&router, Method::Get, "/users/alice"),
            Some(vec![("name".into(), "alice".into())])
        );
        assert_eq!(
            matched(&router, Method::Get, "/files/a/b/c.txt"),
            Some(vec![("rest".into(), "a/b/c.txt".into())])
        );
    }

    #[test]
    fn priority_literal_over_int_over_str() {
        let mut router = Router::new();
        router.get("/v/{s}", handler("str")).unwrap();
        router.get("/v/{n:int}", handler("int")).unwrap();
        router.get("/v/latest", handler("lit")).unwrap();

        // Literal wins over both parameter kinds.
        assert_eq!(matched(&router, Method::Get, "/v/latest"), Some(vec![]));
        // Digits prefer the int parameter.
        assert_eq!(
            matched(&router, Method::Get, "/v/7"),
            Some(vec![("n".into(), "7".into())])
        );
        // Everything else falls to str.
        assert_eq!(
            matched(&router, Method::Get, "/v/abc"),
            Some(vec![("s".into(), "abc".into())])
        );
    }

    #[test]
    fn backtracking_past_a_dead_literal() {
        let mut router = Router::new();
        router.get("/a/special/end", handler("lit")).unwrap();
        router.get("/a/{x}/other", handler("param")).unwrap();

        // "special" matches the literal child but that branch cannot
        // finish "/a/special/other"; matching must back off to {x}.
        assert_eq!(
            matched(&router, Method::Get, "/a/special/other"),
            Some(vec![("x".into(), "special".into())])
        );
    }

    #[test]
    fn percent_decoding_happens_after_split() {
        let mut router = Router::new();
        router.get("/files/{name}", handler("one")).unwrap();

        // %2F decodes to '/' inside the segment; it is still one segment.
        assert_eq!(
            matched(&router, Method::Get, "/files/a%2Fb"),
            Some(vec![("name".into(), "a/b".into())])
        );
        // A literal template matches the decoded form of the request.
        router.get("/café/menu", handler("two")).unwrap();
        assert_eq!(
            matched(&router, Method::Get, "/caf%C3%A9/menu"),
            Some(vec![])
        );
    }

    #[test]
    fn method_not_allowed_vs_not_found() {
        let mut router = Router::new();
        router.get("/x", handler("get")).unwrap();
        router.put("/x", handler("put")).unwrap();

        match router.match_route(&Method::Post, "/x") {
            RouteMatch::MethodNotAllowed { allow } => {
                assert!(allow.contains(&Method::Get));
                assert!(allow.contains(&Method::Put));
                assert_eq!(allow.len(), 2);
            }
            _ => panic!("expected MethodNotAllowed"),
        }

        assert!(matches!(
            router.match_route(&Method::Post, "/nowhere"),
            RouteMatch::NotFound
        ));
    }

    #[test]
    fn conflicts_and_bad_templates() {
        let mut router = Router::new();
        router.get("/a/{id}", handler("one")).unwrap();

        assert_eq!(
            router.get("/a/{id}", handler("two")),
            Err(RouteError::Conflict("/a/{id}".into()))
        );
        assert_eq!(
            router.get("/a/{other}", handler("three")),
            Err(RouteError::Conflict("/a/{other}".into()))
        );

        #[rustfmt::skip]
        let bad = [
            "no-slash",
            "/u/{}",
            "/u/{name:bogus}",
            "/u/{p:path}/more",
            "/u/{bad name}",
            "/u/half{brace",
        ];
        for template in bad {
            assert!(
                matches!(
                    router.get(template, handler("x")),
                    Err(RouteError::InvalidTemplate(_))
                ),
                "{template}"
            );
        }
    }

    #[test]
    fn deterministic_rematch() {
        let mut router = Router::new();
        router.get("/r/{a}/{b}", handler("ab")).unwrap();
        router.get("/r/{a:int}/x", handler("ax")).unwrap();

        for _ in 0..3 {
            assert_eq!(
                matched(&router, Method::Get, "/r/1/x"),
                Some(vec![("a".into(), "1".into())])
            );
            assert_eq!(
                matched(&router, Method::Get, "/r/1/y"),
                Some(vec![("a".into(), "1".into()), ("b".into(), "y".into())])
            );
        }
    }

    #[test]
    fn websocket_routes_are_separate() {
        let mut router = Router::new();
        router
            .websocket("/ws/{room}", |_conn| async {})
            .unwrap();

        let (_, params) = router.match_websocket("/ws/lobby").unwrap();
        assert_eq!(params, vec![("room".into(), "lobby".into())]);
        assert!(router.match_websocket("/nope").is_none());
        assert!(matched(&router, Method::Get, "/ws/lobby").is_none());
    }

    #[test]
    fn root_path() {
        let mut router = Router::new();
        router.get("/", handler("root")).unwrap();
        assert_eq!(matched(&router, Method::Get, "/"), Some(vec![]));
    }
}
