//! Segment tree shared by routes and hooks.
//!
//! Each node owns the bindings whose pattern ends at it. Children are keyed
//! by the next segment: literal children by their text, plus at most one
//! variable child and one wildcard-tail child. The tree itself is not
//! synchronized; owners wrap it in their own lock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::routing::pattern::{CompiledPattern, SegmentKey};

/// A pattern bound to its target, in tree order.
#[derive(Debug)]
pub struct Binding<T> {
    pattern: CompiledPattern,
    target: T,
    seq: u64,
}

impl<T> Binding<T> {
    pub fn pattern(&self) -> &CompiledPattern {
        &self.pattern
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn priority(&self) -> i32 {
        self.pattern.priority()
    }

    /// Registration sequence number; lower registered earlier.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Priority descending, then registration order ascending.
pub(crate) fn binding_order<T>(a: &Arc<Binding<T>>, b: &Arc<Binding<T>>) -> std::cmp::Ordering {
    b.priority().cmp(&a.priority()).then(a.seq.cmp(&b.seq))
}

#[derive(Debug)]
struct Node<T> {
    literals: HashMap<Box<str>, Node<T>>,
    variable: Option<Box<Node<T>>>,
    wildcard: Option<Box<Node<T>>>,
    bindings: Vec<Arc<Binding<T>>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literals: HashMap::new(),
            variable: None,
            wildcard: None,
            bindings: Vec::new(),
        }
    }
}

impl<T> Node<T> {
    fn child_mut(&mut self, key: SegmentKey) -> &mut Node<T> {
        match key {
            SegmentKey::Literal(text) => self.literals.entry(text).or_default(),
            SegmentKey::Variable => self.variable.get_or_insert_with(Default::default),
            SegmentKey::Wildcard => self.wildcard.get_or_insert_with(Default::default),
        }
    }

    fn child(&self, key: &SegmentKey) -> Option<&Node<T>> {
        match key {
            SegmentKey::Literal(text) => self.literals.get(text),
            SegmentKey::Variable => self.variable.as_deref(),
            SegmentKey::Wildcard => self.wildcard.as_deref(),
        }
    }

    fn collect(&self, path: &[&str], out: &mut Vec<Arc<Binding<T>>>) {
        // A wildcard tail also matches when nothing is left.
        if let Some(wildcard) = &self.wildcard {
            out.extend(wildcard.bindings.iter().cloned());
        }
        match path.split_first() {
            None => out.extend(self.bindings.iter().cloned()),
            Some((head, rest)) => {
                if let Some(child) = self.literals.get(*head) {
                    child.collect(rest, out);
                }
                if let Some(child) = &self.variable {
                    child.collect(rest, out);
                }
            }
        }
    }

    fn count(&self) -> usize {
        self.bindings.len()
            + self.literals.values().map(Node::count).sum::<usize>()
            + self.variable.as_ref().map_or(0, |n| n.count())
            + self.wildcard.as_ref().map_or(0, |n| n.count())
    }
}

/// Unsynchronized pattern tree for one (domain, method or event) slot.
#[derive(Debug)]
pub struct PatternTree<T> {
    root: Node<T>,
}

impl<T> Default for PatternTree<T> {
    fn default() -> Self {
        Self { root: Node::default() }
    }
}

impl<T> PatternTree<T> {
    /// Bindings already stored at the node `pattern` ends at.
    ///
    /// Every binding returned has the same segment shape as `pattern`.
    pub fn terminal(&self, pattern: &CompiledPattern) -> &[Arc<Binding<T>>] {
        let mut node = &self.root;
        for segment in pattern.segments() {
            match node.child(&segment.key()) {
                Some(child) => node = child,
                None => return &[],
            }
        }
        &node.bindings
    }

    /// Append a binding to its terminal node and restore the node order.
    pub fn insert(&mut self, pattern: CompiledPattern, target: T, seq: u64) -> Arc<Binding<T>> {
        let mut node = &mut self.root;
        for segment in pattern.segments() {
            node = node.child_mut(segment.key());
        }
        let binding = Arc::new(Binding { pattern, target, seq });
        node.bindings.push(Arc::clone(&binding));
        node.bindings.sort_by(binding_order);
        binding
    }

    /// Every binding whose pattern matches the split path, in tree order.
    pub fn matches(&self, path: &[&str]) -> Vec<Arc<Binding<T>>> {
        let mut out = Vec::new();
        self.root.collect(path, &mut out);
        out.sort_by(binding_order);
        out
    }

    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::pattern::{compile, split_path, RouteMethod};

    fn pattern(p: &str, priority: Option<i32>) -> CompiledPattern {
        compile(p, RouteMethod::All, "*", priority).unwrap()
    }

    #[test]
    fn test_collects_all_shapes() {
        let mut tree = PatternTree::default();
        tree.insert(pattern("/user/:id", None), "var", 1);
        tree.insert(pattern("/user/list", None), "lit", 2);
        tree.insert(pattern("/user/*", None), "wild", 3);
        tree.insert(pattern("/other", None), "other", 4);

        let found: Vec<_> = tree
            .matches(&split_path("/user/list"))
            .iter()
            .map(|b| *b.target())
            .collect();
        assert_eq!(found, vec!["lit", "var", "wild"]);

        let found: Vec<_> = tree
            .matches(&split_path("/user"))
            .iter()
            .map(|b| *b.target())
            .collect();
        assert_eq!(found, vec!["wild"]);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let mut tree = PatternTree::default();
        tree.insert(pattern("/a/:x", Some(5)), "first", 10);
        tree.insert(pattern("/a/:y", Some(5)), "second", 11);
        let terminal: Vec<_> = tree
            .terminal(&pattern("/a/:z", None))
            .iter()
            .map(|b| *b.target())
            .collect();
        assert_eq!(terminal, vec!["first", "second"]);
    }
}
