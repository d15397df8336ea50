//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes per domain and per method
//! - Resolve (method, host, path) to the single best binding
//! - Cache outcomes, including explicit no-match
//!
//! # Design Decisions
//! - Single writer (registration) behind a write lock, many readers
//! - Exact domain is a secondary key tried before `*`, not extra tree depth
//! - Exact-method and `ALL` bindings compete on priority, then registration order
//! - Explicit NotFound rather than silent default

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::http::Method;

use crate::error::ServerError;
use crate::routing::cache::ResolutionCache;
use crate::routing::pattern::{
    compile, normalize_host, split_path, CompiledPattern, Params, RouteMethod, ANY_DOMAIN,
};
use crate::routing::tree::{binding_order, Binding, PatternTree};
use crate::routing::Target;

type MethodTrees<T> = HashMap<RouteMethod, PatternTree<T>>;

/// A resolved binding and the variables its pattern bound.
#[derive(Debug)]
pub struct RouteMatch<T> {
    pub binding: Arc<Binding<T>>,
    pub params: Params,
}

impl<T> Clone for RouteMatch<T> {
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
            params: self.params.clone(),
        }
    }
}

impl<T> RouteMatch<T> {
    pub fn target(&self) -> &T {
        self.binding.target()
    }
}

/// Outcome of a route lookup.
#[derive(Debug)]
pub enum Resolution<T> {
    Found(RouteMatch<T>),
    NotFound,
}

impl<T> Clone for Resolution<T> {
    fn clone(&self) -> Self {
        match self {
            Resolution::Found(m) => Resolution::Found(m.clone()),
            Resolution::NotFound => Resolution::NotFound,
        }
    }
}

impl<T> Resolution<T> {
    pub fn found(self) -> Option<RouteMatch<T>> {
        match self {
            Resolution::Found(m) => Some(m),
            Resolution::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

/// Per-domain, per-method route tree with a resolution cache.
#[derive(Debug)]
pub struct RouteTree<T> {
    domains: RwLock<HashMap<String, MethodTrees<T>>>,
    cache: ResolutionCache<Resolution<T>>,
    seq: AtomicU64,
}

impl<T: Target> RouteTree<T> {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            cache: ResolutionCache::new("routes", cache_capacity),
            seq: AtomicU64::new(0),
        }
    }

    /// Compile and insert in one step.
    pub fn register(
        &self,
        method: RouteMethod,
        domain: &str,
        pattern: &str,
        priority: Option<i32>,
        target: T,
    ) -> Result<(), ServerError> {
        let compiled = compile(pattern, method, domain, priority)?;
        self.insert(compiled, target)
    }

    /// Insert a compiled pattern.
    ///
    /// Re-registering the same target on an identical shape is a no-op; a
    /// different target is rejected and the tree is left untouched.
    pub fn insert(&self, pattern: CompiledPattern, target: T) -> Result<(), ServerError> {
        let mut domains = self
            .domains
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let tree = domains
            .entry(pattern.domain().to_string())
            .or_default()
            .entry(pattern.method().clone())
            .or_default();

        if let Some(existing) = tree.terminal(&pattern).first() {
            if existing.target().same_target(&target) {
                return Ok(());
            }
            return Err(ServerError::DuplicateRoute(pattern.to_string()));
        }

        tracing::debug!(route = %pattern, priority = pattern.priority(), "Route registered");
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        tree.insert(pattern, target, seq);
        self.cache.invalidate();
        Ok(())
    }

    /// Resolve a request to its highest-priority binding.
    pub fn resolve(&self, method: &Method, host: &str, path: &str) -> Resolution<T> {
        let key = format!("{method} {host} {path}");
        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }

        let (generation, resolution) = {
            let domains = self
                .domains
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let generation = self.cache.generation();
            let segments = split_path(path);
            let host = normalize_host(host);

            let best = candidate_domains(&host)
                .filter_map(|domain| domains.get(domain))
                .find_map(|methods| best_in_domain(methods, method, &segments));

            let resolution = match best {
                Some(binding) => {
                    let params = binding.pattern().extract(&segments);
                    Resolution::Found(RouteMatch { binding, params })
                }
                None => Resolution::NotFound,
            };
            (generation, resolution)
        };

        self.cache.put(key, generation, resolution.clone());
        resolution
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.domains
            .read()
            .map(|d| d.values().flat_map(|m| m.values()).map(PatternTree::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache(&self) -> &ResolutionCache<Resolution<T>> {
        &self.cache
    }
}

/// The request host first, then the any-domain slot.
pub(crate) fn candidate_domains(host: &str) -> impl Iterator<Item = &str> {
    let exact = (host != ANY_DOMAIN && !host.is_empty()).then_some(host);
    exact.into_iter().chain(std::iter::once(ANY_DOMAIN))
}

fn best_in_domain<T>(
    methods: &MethodTrees<T>,
    method: &Method,
    segments: &[&str],
) -> Option<Arc<Binding<T>>> {
    let exact = methods.get(&RouteMethod::Exact(method.clone()));
    let all = methods.get(&RouteMethod::All);
    exact
        .into_iter()
        .chain(all)
        .filter_map(|tree| tree.matches(segments).into_iter().next())
        .min_by(binding_order)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Tree = RouteTree<Arc<str>>;

    fn target(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    fn resolve_name(tree: &Tree, method: Method, host: &str, path: &str) -> Option<String> {
        tree.resolve(&method, host, path)
            .found()
            .map(|m| m.target().to_string())
    }

    #[test]
    fn test_literal_beats_variable() {
        let tree = Tree::new(16);
        tree.register(RouteMethod::All, "*", "/user/:id", None, target("show")).unwrap();
        tree.register(RouteMethod::All, "*", "/user/list", None, target("list")).unwrap();

        assert_eq!(resolve_name(&tree, Method::GET, "a.com", "/user/list").as_deref(), Some("list"));
        let m = tree.resolve(&Method::GET, "a.com", "/user/42").found().unwrap();
        assert_eq!(m.target().as_ref(), "show");
        assert_eq!(m.params.get("id"), Some("42"));
    }

    #[test]
    fn test_exact_domain_before_any() {
        let tree = Tree::new(16);
        tree.register(RouteMethod::All, "*", "/", None, target("any")).unwrap();
        tree.register(RouteMethod::All, "example.com", "/", None, target("exact")).unwrap();

        assert_eq!(resolve_name(&tree, Method::GET, "Example.com:80", "/").as_deref(), Some("exact"));
        assert_eq!(resolve_name(&tree, Method::GET, "other.com", "/").as_deref(), Some("any"));
    }

    #[test]
    fn test_method_filter() {
        let tree = Tree::new(16);
        tree.register("POST".parse().unwrap(), "*", "/items", None, target("create")).unwrap();
        assert!(resolve_name(&tree, Method::GET, "h", "/items").is_none());
        assert_eq!(resolve_name(&tree, Method::POST, "h", "/items").as_deref(), Some("create"));
    }

    #[test]
    fn test_duplicate_rejected_and_tree_unchanged() {
        let tree = Tree::new(16);
        let first = target("first");
        tree.register(RouteMethod::All, "*", "/a/:id", None, first.clone()).unwrap();
        // Same target again is idempotent.
        tree.register(RouteMethod::All, "*", "/a/:id", None, first).unwrap();

        let err = tree
            .register(RouteMethod::All, "*", "/a/:other", None, target("second"))
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateRoute(_)));
        assert_eq!(tree.len(), 1);
        assert_eq!(resolve_name(&tree, Method::GET, "h", "/a/1").as_deref(), Some("first"));
    }

    #[test]
    fn test_negative_cache_invalidated_by_insert() {
        let tree = Tree::new(16);
        assert!(!tree.resolve(&Method::GET, "h", "/late").is_found());
        assert!(!tree.resolve(&Method::GET, "h", "/late").is_found());
        assert_eq!(tree.cache().len(), 1);

        tree.register(RouteMethod::All, "*", "/late", None, target("late")).unwrap();
        assert_eq!(resolve_name(&tree, Method::GET, "h", "/late").as_deref(), Some("late"));
    }

    #[test]
    fn test_equal_priority_earlier_registration_wins() {
        let tree = Tree::new(16);
        tree.register("GET".parse().unwrap(), "*", "/x/:a", Some(7), target("get")).unwrap();
        tree.register(RouteMethod::All, "*", "/x/*", Some(7), target("all")).unwrap();
        assert_eq!(resolve_name(&tree, Method::GET, "h", "/x/1").as_deref(), Some("get"));
    }
}
