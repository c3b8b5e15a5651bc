//! Request dispatch: middleware chain, routing outcomes, exception
//! handlers.
//!
//! The chain is composed once when the server freezes its router;
//! serving a request walks a slice of pre-built function values, never
//! re-composing closures. Parse and protocol errors are settled in the
//! connection drivers and never reach this layer; what arrives here is
//! a complete request, and what leaves is always a response.

use crate::{
    http::{request::Request, response::Response, types::Method},
    routing::router::{HandlerFn, ResponseFuture, RouteMatch, Router},
};
use futures_util::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};

/// A middleware: sees the request before the handler, may short-circuit
/// by not calling [`Next::run`].
pub type Middleware = Arc<dyn Fn(Request, Next) -> ResponseFuture + Send + Sync>;

/// What failed inside a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The handler (or a middleware) panicked.
    Panic,
}

/// Details of a handler failure passed to exception handlers.
#[derive(Debug, Clone)]
pub struct HandlerFault {
    pub kind: FaultKind,
    pub message: String,
}

pub(crate) type CatcherFn = Arc<dyn Fn(&Request, &HandlerFault) -> Response + Send + Sync>;

pub(crate) struct Catcher {
    pub(crate) template: Option<Arc<str>>,
    pub(crate) kind: Option<FaultKind>,
    pub(crate) handler: CatcherFn,
}

/// The remainder of the middleware chain plus the routed handler.
pub struct Next {
    chain: Arc<[Middleware]>,
    index: usize,
    handler: HandlerFn,
}

impl Next {
    /// Run the rest of the chain. Not calling this short-circuits.
    pub fn run(self, request: Request) -> ResponseFuture {
        match self.chain.get(self.index) {
            Some(middleware) => {
                let middleware = middleware.clone();
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    handler: self.handler,
                };
                middleware(request, next)
            }
            None => (self.handler)(request),
        }
    }
}

/// Frozen routing + middleware + exception handler state shared by
/// every connection driver.
pub(crate) struct Dispatcher {
    router: Router,
    chain: Arc<[Middleware]>,
    catchers: Vec<Catcher>,
}

impl Dispatcher {
    pub(crate) fn new(router: Router, chain: Vec<Middleware>, catchers: Vec<Catcher>) -> Self {
        Self {
            router,
            chain: chain.into(),
            catchers,
        }
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// Route and run one request to completion. Never panics: handler
    /// panics are converted to faults and routed through the exception
    /// handler registry.
    pub(crate) async fn dispatch(&self, mut request: Request) -> Response {
        let head_fallback = request.method() == &Method::Head;

        let (handler, params, template) = match self.route(&request) {
            Routed::Found {
                handler,
                params,
                template,
            } => (handler, params, template),
            Routed::NotFound => {
                return error_response(404, "not found", request.accepts_json());
            }
            Routed::MethodNotAllowed { allow } => {
                let mut response =
                    error_response(405, "method not allowed", request.accepts_json());
                let list = allow
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                response.set_header("allow", list);
                return response;
            }
        };

        request.set_path_params(params);

        let next = Next {
            chain: self.chain.clone(),
            index: 0,
            handler,
        };

        // The request moves into the handler, so the catcher gets a
        // shallow descriptor rather than the request itself.
        let descriptor = RequestDescriptor::of(&request);
        let outcome = AssertUnwindSafe(next.run(request)).catch_unwind().await;

        let mut response = match outcome {
            Ok(response) => response,
            Err(panic) => {
                let fault = HandlerFault {
                    kind: FaultKind::Panic,
                    message: panic_message(panic),
                };
                tracing::error!(
                    path = %descriptor.path,
                    fault = %fault.message,
                    "handler failed"
                );
                self.recover(&descriptor, &template, &fault)
            }
        };

        if head_fallback {
            response.clear_body();
        }
        response
    }

    fn route(&self, request: &Request) -> Routed {
        match self.router.match_route(request.method(), request.path()) {
            RouteMatch::Found {
                handler,
                params,
                template,
            } => Routed::Found {
                handler,
                params,
                template,
            },
            RouteMatch::MethodNotAllowed { allow } => Routed::MethodNotAllowed { allow },
            RouteMatch::NotFound if request.method() == &Method::Head => {
                // HEAD falls back to the GET route; the driver strips
                // the body after the handler runs.
                match self.router.match_route(&Method::Get, request.path()) {
                    RouteMatch::Found {
                        handler,
                        params,
                        template,
                    } => Routed::Found {
                        handler,
                        params,
                        template,
                    },
                    RouteMatch::MethodNotAllowed { allow } => {
                        Routed::MethodNotAllowed { allow }
                    }
                    RouteMatch::NotFound => Routed::NotFound,
                }
            }
            RouteMatch::NotFound => Routed::NotFound,
        }
    }

    /// Walk the exception handler registry from most specific to
    /// least; a match produces the response, otherwise a 500.
    fn recover(
        &self,
        descriptor: &RequestDescriptor,
        template: &Arc<str>,
        fault: &HandlerFault,
    ) -> Response {
        let ranks: [(bool, bool); 4] =
            [(true, true), (true, false), (false, true), (false, false)];

        for (want_template, want_kind) in ranks {
            for catcher in &self.catchers {
                let template_ok = match (&catcher.template, want_template) {
                    (Some(t), true) => t.as_ref() == template.as_ref(),
                    (None, false) => true,
                    _ => false,
                };
                let kind_ok = match (catcher.kind, want_kind) {
                    (Some(kind), true) => kind == fault.kind,
                    (None, false) => true,
                    _ => false,
                };
                if template_ok && kind_ok {
                    return (catcher.handler)(&descriptor.request, fault);
                }
            }
        }

        error_response(500, "internal server error", descriptor.accepts_json)
    }
}

enum Routed {
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

/// A lightweight copy of request metadata that survives the request
/// moving into a handler that later panics.
struct RequestDescriptor {
    path: String,
    accepts_json: bool,
    request: Request,
}

impl RequestDescriptor {
    fn of(request: &Request) -> Self {
        let shallow = Request::new(
            request.method().clone(),
            request.path().to_string(),
            request.query().to_vec(),
            request.headers().clone(),
            Vec::new(),
            request.version(),
            request.remote_addr(),
        );
        Self {
            path: request.path().to_string(),
            accepts_json: request.accepts_json(),
            request: shallow,
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// The minimal error body every protocol-generated failure carries:
/// JSON when the client accepts it, plain text otherwise.
pub(crate) fn error_response(status: u16, reason: &str, json: bool) -> Response {
    let mut response = Response::new(status);
    if json {
        response.set_header("content-type", "application/json");
        response.set_body(format!("{{\"error\":\"{reason}\"}}"));
    } else {
        response.set_header("content-type", "text/plain");
        response.set_body(reason.to_string());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::{HeaderMap, Version};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: Method, path: &str) -> Request {
        Request::new(
            method,
            path.to_string(),
            Vec::new(),
            HeaderMap::default(),
            Vec::new(),
            Version::Http11,
            None,
        )
    }

    fn dispatcher(router: Router) -> Dispatcher {
        Dispatcher::new(router, Vec::new(), Vec::new())
    }

    #[tokio::test]
    async fn routes_to_handler_with_params() {
        let mut router = Router::new();
        router
            .get("/users/{id:int}", |req| async move {
                Response::text(format!("user={}", req.param("id").unwrap()))
            })
            .unwrap();

        let response = dispatcher(router)
            .dispatch(request(Method::Get, "/users/42"))
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"user=42");
    }

    #[tokio::test]
    async fn not_found_and_method_not_allowed() {
        let mut router = Router::new();
        router.get("/x", |_| async { Response::text("ok") }).unwrap();

        let dispatcher = dispatcher(router);

        let missing = dispatcher.dispatch(request(Method::Get, "/nope")).await;
        assert_eq!(missing.status(), 404);
        assert_eq!(missing.body(), b"not found");

        let wrong = dispatcher.dispatch(request(Method::Post, "/x")).await;
        assert_eq!(wrong.status(), 405);
        assert_eq!(wrong.header("allow"), Some(&b"GET"[..]));
    }

    #[tokio::test]
    async fn head_uses_get_with_stripped_body() {
        let mut router = Router::new();
        router
            .get("/page", |_| async { Response::text("page body") })
            .unwrap();

        let response = dispatcher(router)
            .dispatch(request(Method::Head, "/page"))
            .await;
        assert_eq!(response.status(), 200);
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn middleware_runs_outside_in_and_can_short_circuit() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);

        let mut router = Router::new();
        router
            .get("/open", |_| async { Response::text("handler") })
            .unwrap();
        router
            .get("/blocked", |_| async { Response::text("handler") })
            .unwrap();

        let outer: Middleware = Arc::new(|req, next| {
            Box::pin(async move {
                assert_eq!(ORDER.fetch_add(1, Ordering::SeqCst), 0, "outer first");
                let mut resp = next.run(req).await;
                resp.add_header("x-outer", "1");
                resp
            })
        });
        let inner: Middleware = Arc::new(|req, next| {
            Box::pin(async move {
                assert_eq!(ORDER.fetch_add(1, Ordering::SeqCst), 1, "inner second");
                if req.path() == "/blocked" {
                    return Response::new(403).with_body("denied");
                }
                next.run(req).await
            })
        });

        let dispatcher = Dispatcher::new(router, vec![outer, inner], Vec::new());

        let open = dispatcher.dispatch(request(Method::Get, "/open")).await;
        assert_eq!(open.body(), b"handler");
        assert_eq!(open.header("x-outer"), Some(&b"1"[..]));

        ORDER.store(0, Ordering::SeqCst);
        let blocked = dispatcher.dispatch(request(Method::Get, "/blocked")).await;
        assert_eq!(blocked.status(), 403);
        // Outer middleware still wrapped the short-circuited response.
        assert_eq!(blocked.header("x-outer"), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn panic_becomes_500() {
        let mut router = Router::new();
        router
            .get("/boom", |_| async { panic!("kaput") })
            .unwrap();

        let response = dispatcher(router)
            .dispatch(request(Method::Get, "/boom"))
            .await;
        assert_eq!(response.status(), 500);
        assert_eq!(response.body(), b"internal server error");
    }

    #[tokio::test]
    async fn exception_handlers_walk_most_specific_first() {
        let mut router = Router::new();
        router.get("/a", |_| async { panic!("a") }).unwrap();
        router.get("/b", |_| async { panic!("b") }).unwrap();

        let catchers = vec![
            Catcher {
                template: None,
                kind: None,
                handler: Arc::new(|_, _| Response::new(502).with_body("global")),
            },
            Catcher {
                template: Some(Arc::from("/a")),
                kind: Some(FaultKind::Panic),
                handler: Arc::new(|_, fault| {
                    Response::new(503).with_body(format!("specific:{}", fault.message))
                }),
            },
        ];

        let dispatcher = Dispatcher::new(router, Vec::new(), catchers);

        // /a hits the (template, kind) catcher even though the global
        // one was registered first.
        let a = dispatcher.dispatch(request(Method::Get, "/a")).await;
        assert_eq!(a.status(), 503);
        assert_eq!(a.body(), b"specific:a");

        // /b only matches the global catcher.
        let b = dispatcher.dispatch(request(Method::Get, "/b")).await;
        assert_eq!(b.status(), 502);
        assert_eq!(b.body(), b"global");
    }

    #[test]
    fn error_body_negotiation() {
        let json = error_response(404, "not found", true);
        assert_eq!(json.body(), br#"{"error":"not found"}"#);
        assert_eq!(json.header("content-type"), Some(&b"application/json"[..]));

        let text = error_response(404, "not found", false);
        assert_eq!(text.body(), b"not found");
    }
}
