//! Route, hook and status-handler table of one server.
//!
//! # Responsibilities
//! - Registration API consumed by applications (routes, hooks, method tables)
//! - Run one exchange through its hooks and handler
//!
//! # Hook Sequence
//! ```text
//! BeforeServe → handler (or status handler) → AfterServe → BeforeOutput
//!     → conversion to the wire response → AfterOutput
//!     → (detached) BeforeClose → AfterClose
//! ```
//!
//! # Design Decisions
//! - Hooks see the variables bound by their own pattern, the handler sees
//!   those of the route
//! - A table is immutable in shape once swapped in by a reload: reload
//!   builds a new table rather than editing the live one

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use axum::http::StatusCode;

use crate::error::ServerError;
use crate::http::handler::{Handler, Hook, MethodTable, SharedHandler, SharedHook, INDEX_METHOD};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::routing::{parse_route, HookEvent, HookTree, Resolution, RouteMethod, RouteTree};

pub struct RouteTable {
    routes: RouteTree<SharedHandler>,
    hooks: HookTree<SharedHook>,
    status_handlers: RwLock<HashMap<StatusCode, SharedHandler>>,
}

impl RouteTable {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            routes: RouteTree::new(cache_capacity),
            hooks: HookTree::new(cache_capacity),
            status_handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        method: RouteMethod,
        domain: &str,
        pattern: &str,
        priority: Option<i32>,
        handler: SharedHandler,
    ) -> Result<(), ServerError> {
        self.routes.register(method, domain, pattern, priority, handler)
    }

    pub fn register_hook(
        &self,
        event: HookEvent,
        domain: &str,
        pattern: &str,
        priority: Option<i32>,
        hook: SharedHook,
    ) -> Result<(), ServerError> {
        self.hooks.register(event, domain, pattern, priority, hook)
    }

    /// Register a handler with the combined `METHOD:/path@domain` notation.
    pub fn handle(&self, route: &str, handler: impl Handler) -> Result<(), ServerError> {
        let (method, pattern, domain) = parse_route(route)?;
        self.register(method, &domain, &pattern, None, Arc::new(handler))
    }

    /// Register a hook with the `/path@domain` notation.
    pub fn hook(&self, event: HookEvent, route: &str, hook: impl Hook) -> Result<(), ServerError> {
        let (method, pattern, domain) = parse_route(route)?;
        if method != RouteMethod::All {
            return Err(ServerError::invalid_pattern(route, "hooks apply to every method"));
        }
        self.register_hook(event, &domain, &pattern, None, Arc::new(hook))
    }

    /// Register every method of `table` as `<base>/<name>`; a method named
    /// `index` is also served at `<base>` itself. Stops at the first error.
    pub fn bind_methods(&self, route: &str, table: &MethodTable) -> Result<(), ServerError> {
        let (method, base, domain) = parse_route(route)?;
        let base = base.trim_end_matches('/');
        for (name, handler) in table.iter() {
            let pattern = format!("{base}/{name}");
            self.register(method.clone(), &domain, &pattern, None, Arc::clone(handler))?;
            if name == INDEX_METHOD {
                let index = if base.is_empty() { "/" } else { base };
                self.register(method.clone(), &domain, index, None, Arc::clone(handler))?;
            }
        }
        Ok(())
    }

    /// Handler used when a response carries `status` and no body, and for
    /// unmatched requests (404).
    pub fn set_status_handler(&self, status: StatusCode, handler: impl Handler) {
        self.status_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status, Arc::new(handler));
    }

    pub fn status_handler(&self, status: StatusCode) -> Option<SharedHandler> {
        self.status_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&status)
            .cloned()
    }

    pub fn routes(&self) -> &RouteTree<SharedHandler> {
        &self.routes
    }

    pub fn hooks(&self) -> &HookTree<SharedHook> {
        &self.hooks
    }

    /// Run every hook bound to `event` for this request, in priority order.
    pub fn run_hooks(&self, event: HookEvent, req: &mut Request, res: &mut Response) {
        if self.hooks.is_empty() {
            return;
        }
        let hooks = self.hooks.resolve_all(event, req.host(), req.path());
        if hooks.is_empty() {
            return;
        }

        let route_params = req.take_params();
        for hook in hooks.iter() {
            if event == HookEvent::BeforeServe && res.is_halted() {
                break;
            }
            req.set_params(hook.params.clone());
            hook.target().call(req, res);
        }
        req.set_params(route_params);
    }

    /// Serve up to and including `BeforeOutput`.
    pub fn serve(&self, req: &mut Request) -> Response {
        let resolution = self.routes.resolve(req.method(), req.host(), req.path());

        let mut res = Response::default();
        self.run_hooks(HookEvent::BeforeServe, req, &mut res);

        if !res.is_halted() {
            let hooked = std::mem::take(&mut res);
            res = match resolution {
                Resolution::Found(route) => {
                    req.set_params(route.params.clone());
                    let out = route.target().handle(req);
                    self.apply_status_handler(req, out)
                }
                Resolution::NotFound => {
                    tracing::debug!(request_id = %req.id(), host = %req.host(), path = %req.path(), "No route matched");
                    match self.status_handler(StatusCode::NOT_FOUND) {
                        Some(handler) => handler.handle(req),
                        None => Response::not_found(),
                    }
                }
            };
            for (name, value) in hooked.headers() {
                if !res.headers().contains_key(name) {
                    res.headers_mut().insert(name.clone(), value.clone());
                }
            }
        }

        self.run_hooks(HookEvent::AfterServe, req, &mut res);
        self.run_hooks(HookEvent::BeforeOutput, req, &mut res);
        res
    }

    /// Run the close hooks once the response has left.
    pub fn close(&self, mut req: Request, mut res: Response) {
        self.run_hooks(HookEvent::BeforeClose, &mut req, &mut res);
        self.run_hooks(HookEvent::AfterClose, &mut req, &mut res);
    }

    fn apply_status_handler(&self, req: &Request, res: Response) -> Response {
        if !res.body().is_empty() || res.status().is_success() {
            return res;
        }
        match self.status_handler(res.status()) {
            Some(handler) => handler.handle(req),
            None => res,
        }
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use std::sync::Mutex;

    fn request(method: &str, host: &str, path: &str) -> Request {
        let (parts, _) = axum::http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", host)
            .body(())
            .unwrap()
            .into_parts();
        Request::from_parts(parts, Bytes::new(), "127.0.0.1:1".parse().unwrap(), false)
    }

    fn body(res: &Response) -> &str {
        std::str::from_utf8(res.body()).unwrap()
    }

    #[test]
    fn test_handle_and_params() {
        let table = RouteTable::new(16);
        table
            .handle("GET:/user/:id", |req: &Request| {
                Response::text(StatusCode::OK, format!("user {}", req.param("id").unwrap_or("?")))
            })
            .unwrap();

        let res = table.serve(&mut request("GET", "any.host", "/user/42"));
        assert_eq!(body(&res), "user 42");

        let res = table.serve(&mut request("POST", "any.host", "/user/42"));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_handlers() {
        let table = RouteTable::new(16);
        table
            .handle("/gone", |_: &Request| Response::new(StatusCode::GONE))
            .unwrap();
        table.set_status_handler(StatusCode::NOT_FOUND, |req: &Request| {
            Response::text(StatusCode::NOT_FOUND, format!("nothing at {}", req.path()))
        });
        table.set_status_handler(StatusCode::GONE, |_: &Request| Response::text(StatusCode::GONE, "gone for good"));

        assert_eq!(body(&table.serve(&mut request("GET", "h", "/missing"))), "nothing at /missing");
        assert_eq!(body(&table.serve(&mut request("GET", "h", "/gone"))), "gone for good");
    }

    #[test]
    fn test_bind_methods() {
        let table = RouteTable::new(16);
        let methods = MethodTable::new()
            .method("Index", |_: &Request| Response::text(StatusCode::OK, "index"))
            .method("show", |_: &Request| Response::text(StatusCode::OK, "show"));
        table.bind_methods("/user/@example.com", &methods).unwrap();

        assert_eq!(body(&table.serve(&mut request("GET", "example.com", "/user"))), "index");
        assert_eq!(body(&table.serve(&mut request("GET", "example.com", "/user/index"))), "index");
        assert_eq!(body(&table.serve(&mut request("GET", "example.com", "/user/show"))), "show");
        assert_eq!(
            table.serve(&mut request("GET", "other.com", "/user/show")).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_hook_sequence_and_params() {
        let table = RouteTable::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        table
            .handle("/files/:name", |req: &Request| {
                Response::text(StatusCode::OK, req.param("name").unwrap_or_default().to_string())
            })
            .unwrap();
        for event in HookEvent::ALL {
            let seen = Arc::clone(&seen);
            table
                .hook(event, "/files/*rest", move |req: &mut Request, _: &mut Response| {
                    seen.lock().unwrap().push(format!("{event}:{}", req.param("rest").unwrap_or_default()));
                })
                .unwrap();
        }

        let mut req = request("GET", "h", "/files/a.txt");
        let res = table.serve(&mut req);
        assert_eq!(body(&res), "a.txt");
        table.close(req, res);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "BeforeServe:a.txt");
        assert_eq!(seen[1], "AfterServe:a.txt");
        assert_eq!(seen[2], "BeforeOutput:a.txt");
        assert_eq!(seen[3], "BeforeClose:a.txt");
        assert_eq!(seen[4], "AfterClose:a.txt");
    }

    #[test]
    fn test_halt_skips_handler() {
        let table = RouteTable::new(16);
        table
            .handle("/admin/*", |_: &Request| Response::text(StatusCode::OK, "secret"))
            .unwrap();
        table
            .hook(HookEvent::BeforeServe, "/admin/*", |_: &mut Request, res: &mut Response| {
                *res = Response::text(StatusCode::FORBIDDEN, "denied");
                res.halt();
            })
            .unwrap();

        let res = table.serve(&mut request("GET", "h", "/admin/panel"));
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(body(&res), "denied");
    }

    #[test]
    fn test_hook_headers_survive_handler() {
        let table = RouteTable::new(16);
        table.handle("/", |_: &Request| Response::text(StatusCode::OK, "home")).unwrap();
        table
            .hook(HookEvent::BeforeServe, "/*", |_: &mut Request, res: &mut Response| {
                res.headers_mut().insert("x-served-by", "gracehttp".parse().unwrap());
            })
            .unwrap();

        let res = table.serve(&mut request("GET", "h", "/"));
        assert_eq!(res.headers().get("x-served-by").unwrap(), "gracehttp");
    }

    #[test]
    fn test_hook_rejects_method() {
        let table = RouteTable::new(16);
        let err = table
            .hook(HookEvent::BeforeServe, "GET:/x", |_: &mut Request, _: &mut Response| {})
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidPattern { .. }));
    }
}
