//! Lifecycle hook bindings.
//!
//! Same tree as routes, keyed by event instead of method. Hooks are
//! advisory: every matching binding runs, from the exact domain and from
//! `*` alike, in priority-descending then registration order.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::ServerError;
use crate::routing::cache::ResolutionCache;
use crate::routing::pattern::{compile, normalize_host, split_path, CompiledPattern, Params, RouteMethod};
use crate::routing::router::candidate_domains;
use crate::routing::tree::{binding_order, Binding, PatternTree};
use crate::routing::Target;

/// Points in the request lifecycle where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeServe,
    AfterServe,
    BeforeOutput,
    AfterOutput,
    BeforeClose,
    AfterClose,
}

impl HookEvent {
    pub const ALL: [HookEvent; 6] = [
        HookEvent::BeforeServe,
        HookEvent::AfterServe,
        HookEvent::BeforeOutput,
        HookEvent::AfterOutput,
        HookEvent::BeforeClose,
        HookEvent::AfterClose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeServe => "BeforeServe",
            HookEvent::AfterServe => "AfterServe",
            HookEvent::BeforeOutput => "BeforeOutput",
            HookEvent::AfterOutput => "AfterOutput",
            HookEvent::BeforeClose => "BeforeClose",
            HookEvent::AfterClose => "AfterClose",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookEvent::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ServerError::invalid_pattern(s, "unknown hook event"))
    }
}

/// A matching hook binding with its own bound variables.
#[derive(Debug)]
pub struct HookMatch<T> {
    pub binding: Arc<Binding<T>>,
    pub params: Params,
}

impl<T> Clone for HookMatch<T> {
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
            params: self.params.clone(),
        }
    }
}

impl<T> HookMatch<T> {
    pub fn target(&self) -> &T {
        self.binding.target()
    }
}

type EventTrees<T> = HashMap<HookEvent, PatternTree<T>>;

/// Per-domain, per-event hook tree.
#[derive(Debug)]
pub struct HookTree<T> {
    domains: RwLock<HashMap<String, EventTrees<T>>>,
    cache: ResolutionCache<Arc<[HookMatch<T>]>>,
    seq: AtomicU64,
}

impl<T: Target> HookTree<T> {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            cache: ResolutionCache::new("hooks", cache_capacity),
            seq: AtomicU64::new(0),
        }
    }

    pub fn register(
        &self,
        event: HookEvent,
        domain: &str,
        pattern: &str,
        priority: Option<i32>,
        target: T,
    ) -> Result<(), ServerError> {
        let compiled = compile(pattern, RouteMethod::All, domain, priority)?;
        self.insert(event, compiled, target)
    }

    /// Insert a hook. Different hooks on one pattern stack; the same hook
    /// twice on one pattern is a duplicate.
    pub fn insert(&self, event: HookEvent, pattern: CompiledPattern, target: T) -> Result<(), ServerError> {
        let mut domains = self
            .domains
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let tree = domains
            .entry(pattern.domain().to_string())
            .or_default()
            .entry(event)
            .or_default();

        if tree
            .terminal(&pattern)
            .iter()
            .any(|existing| existing.target().same_target(&target))
        {
            return Err(ServerError::DuplicateRoute(format!("{event} {pattern}")));
        }

        tracing::debug!(event = %event, hook = %pattern, priority = pattern.priority(), "Hook registered");
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        tree.insert(pattern, target, seq);
        self.cache.invalidate();
        Ok(())
    }

    /// Every hook bound to `event` whose pattern matches, in execution order.
    pub fn resolve_all(&self, event: HookEvent, host: &str, path: &str) -> Arc<[HookMatch<T>]> {
        let key = format!("{event} {host} {path}");
        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }

        let (generation, matches) = {
            let domains = self
                .domains
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let generation = self.cache.generation();
            let segments = split_path(path);
            let host = normalize_host(host);

            let mut bindings: Vec<Arc<Binding<T>>> = candidate_domains(&host)
                .filter_map(|domain| domains.get(domain))
                .filter_map(|events| events.get(&event))
                .flat_map(|tree| tree.matches(&segments))
                .collect();
            bindings.sort_by(binding_order);

            let matches: Arc<[HookMatch<T>]> = bindings
                .into_iter()
                .map(|binding| {
                    let params = binding.pattern().extract(&segments);
                    HookMatch { binding, params }
                })
                .collect();
            (generation, matches)
        };

        self.cache.put(key, generation, Arc::clone(&matches));
        matches
    }

    pub fn len(&self) -> usize {
        self.domains
            .read()
            .map(|d| d.values().flat_map(|e| e.values()).map(PatternTree::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache(&self) -> &ResolutionCache<Arc<[HookMatch<T>]>> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Tree = HookTree<Arc<str>>;

    fn names(tree: &Tree, event: HookEvent, host: &str, path: &str) -> Vec<String> {
        tree.resolve_all(event, host, path)
            .iter()
            .map(|m| m.target().to_string())
            .collect()
    }

    #[test]
    fn test_hooks_stack_in_priority_order() {
        let tree = Tree::new(16);
        tree.register(HookEvent::BeforeServe, "*", "/*", None, Arc::from("global")).unwrap();
        tree.register(HookEvent::BeforeServe, "*", "/api/:v", None, Arc::from("api")).unwrap();
        tree.register(HookEvent::BeforeServe, "*", "/api/:v", None, Arc::from("api-second")).unwrap();
        tree.register(HookEvent::AfterServe, "*", "/api/:v", None, Arc::from("after")).unwrap();

        assert_eq!(
            names(&tree, HookEvent::BeforeServe, "h", "/api/v1"),
            vec!["api", "api-second", "global"]
        );
        assert_eq!(names(&tree, HookEvent::AfterServe, "h", "/api/v1"), vec!["after"]);
        assert!(names(&tree, HookEvent::BeforeClose, "h", "/api/v1").is_empty());
    }

    #[test]
    fn test_exact_and_any_domain_both_apply() {
        let tree = Tree::new(16);
        tree.register(HookEvent::BeforeServe, "*", "/", Some(1), Arc::from("any")).unwrap();
        tree.register(HookEvent::BeforeServe, "example.com", "/", Some(2), Arc::from("exact")).unwrap();
        assert_eq!(names(&tree, HookEvent::BeforeServe, "example.com", "/"), vec!["exact", "any"]);
        assert_eq!(names(&tree, HookEvent::BeforeServe, "other.com", "/"), vec!["any"]);
    }

    #[test]
    fn test_same_hook_twice_is_duplicate() {
        let tree = Tree::new(16);
        let hook: Arc<str> = Arc::from("h");
        tree.register(HookEvent::AfterClose, "*", "/x", None, hook.clone()).unwrap();
        let err = tree.register(HookEvent::AfterClose, "*", "/x", None, hook).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateRoute(_)));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_event_names() {
        assert_eq!("beforeserve".parse::<HookEvent>().unwrap(), HookEvent::BeforeServe);
        assert!("OnServe".parse::<HookEvent>().is_err());
    }
}
