//! Handler and hook capabilities.
//!
//! Anything implementing [`Handler`] can be registered for a route; closures
//! qualify through blanket impls. [`MethodTable`] replaces name-based method
//! discovery with an explicit list built at registration time.

use std::sync::Arc;

use crate::http::request::Request;
use crate::http::response::Response;

/// Serves a request.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, req: &Request) -> Response {
        self(req)
    }
}

/// Runs around a handler; may inspect and change both sides of the exchange.
pub trait Hook: Send + Sync + 'static {
    fn call(&self, req: &mut Request, res: &mut Response);
}

impl<F> Hook for F
where
    F: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
{
    fn call(&self, req: &mut Request, res: &mut Response) {
        self(req, res)
    }
}

pub type SharedHandler = Arc<dyn Handler>;
pub type SharedHook = Arc<dyn Hook>;

/// Method bound under `/<base>` by `bind_methods` in place of `/<base>/index`.
pub const INDEX_METHOD: &str = "index";

/// Named handlers registered together under a base path.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: Vec<(String, SharedHandler)>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named method. Names become path segments, lowercased.
    pub fn method(mut self, name: &str, handler: impl Handler) -> Self {
        self.methods.push((name.to_ascii_lowercase(), Arc::new(handler)));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SharedHandler)> {
        self.methods.iter().map(|(name, handler)| (name.as_str(), handler))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.methods.iter().map(|(name, _)| name)).finish()
    }
}
