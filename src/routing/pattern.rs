//! Route pattern compilation.
//!
//! # Responsibilities
//! - Parse `/`-delimited URI templates into segment descriptors
//! - Validate variable and wildcard placement
//! - Derive a default priority that favours literal-heavy patterns
//!
//! # Syntax
//! ```text
//! /user/list          literal segments
//! /user/:id           named variable, matches exactly one segment
//! /static/*rest       wildcard tail, matches zero or more segments
//! /static/*           wildcard tail bound under the reserved name "*"
//! ```
//!
//! Empty path segments are ignored when matching, so `/user/` and `//user`
//! both resolve like `/user`.

use std::fmt;
use std::str::FromStr;

use axum::http::Method;

use crate::error::ServerError;

/// Domain that matches every host.
pub const ANY_DOMAIN: &str = "*";

/// Name bound by a bare `*` wildcard.
pub const WILDCARD_PARAM: &str = "*";

/// Methods accepted at registration, besides `ALL`.
pub const HTTP_METHODS: [&str; 9] = [
    "GET", "PUT", "POST", "DELETE", "PATCH", "HEAD", "CONNECT", "OPTIONS", "TRACE",
];

const VARIABLE_MARKER: char = ':';
const WILDCARD_MARKER: char = '*';

const LITERAL_WEIGHT: i32 = 1_000;
const VARIABLE_WEIGHT: i32 = 10;
/// Variables past this many add nothing, so their total stays below one literal.
const MAX_WEIGHTED_VARIABLES: i32 = 99;
const WILDCARD_PENALTY: i32 = 1;

/// Method filter of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteMethod {
    /// Matches every request method.
    All,
    Exact(Method),
}

impl RouteMethod {
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            RouteMethod::All => true,
            RouteMethod::Exact(m) => m == method,
        }
    }
}

impl FromStr for RouteMethod {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if upper.is_empty() || upper == "ALL" {
            return Ok(RouteMethod::All);
        }
        if !HTTP_METHODS.contains(&upper.as_str()) {
            return Err(ServerError::invalid_pattern(s, "unknown HTTP method"));
        }
        Method::from_bytes(upper.as_bytes())
            .map(RouteMethod::Exact)
            .map_err(|_| ServerError::invalid_pattern(s, "unknown HTTP method"))
    }
}

impl From<Method> for RouteMethod {
    fn from(method: Method) -> Self {
        RouteMethod::Exact(method)
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMethod::All => f.write_str("ALL"),
            RouteMethod::Exact(m) => f.write_str(m.as_str()),
        }
    }
}

/// One compiled path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(Box<str>),
    Variable(Box<str>),
    Wildcard(Box<str>),
}

/// Tree key of a segment. Variable names do not take part in the shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SegmentKey {
    Literal(Box<str>),
    Variable,
    Wildcard,
}

impl Segment {
    pub fn key(&self) -> SegmentKey {
        match self {
            Segment::Literal(s) => SegmentKey::Literal(s.clone()),
            Segment::Variable(_) => SegmentKey::Variable,
            Segment::Wildcard(_) => SegmentKey::Wildcard,
        }
    }
}

/// Immutable, registration-time form of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    source: String,
    domain: String,
    method: RouteMethod,
    segments: Vec<Segment>,
    priority: i32,
}

impl CompiledPattern {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn method(&self) -> &RouteMethod {
        &self.method
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Bind variable values from an already matched, split request path.
    pub fn extract(&self, path: &[&str]) -> Params {
        let mut params = Params::default();
        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(_) => {}
                Segment::Variable(name) => {
                    if let Some(value) = path.get(idx) {
                        params.push(name, value);
                    }
                }
                Segment::Wildcard(name) => {
                    let rest = path.get(idx..).map(|r| r.join("/")).unwrap_or_default();
                    params.push(name, &rest);
                }
            }
        }
        params
    }
}

impl fmt::Display for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.method, self.source, self.domain)
    }
}

/// Compile a pattern for `method` on `domain`.
///
/// `priority` overrides the derived default when given.
pub fn compile(
    pattern: &str,
    method: RouteMethod,
    domain: &str,
    priority: Option<i32>,
) -> Result<CompiledPattern, ServerError> {
    if !pattern.starts_with('/') {
        return Err(ServerError::invalid_pattern(pattern, "must start with '/'"));
    }

    let raw: Vec<&str> = pattern[1..].split('/').collect();
    let last = raw.len() - 1;
    let mut segments = Vec::with_capacity(raw.len());
    let mut names: Vec<&str> = Vec::new();

    for (idx, part) in raw.iter().enumerate() {
        if part.is_empty() {
            // A single trailing slash is tolerated, anything else is a typo.
            if idx == last {
                continue;
            }
            return Err(ServerError::invalid_pattern(pattern, "empty path segment"));
        }

        if let Some(name) = part.strip_prefix(VARIABLE_MARKER) {
            validate_name(pattern, name)?;
            if names.contains(&name) {
                return Err(ServerError::invalid_pattern(pattern, format!("variable `{name}` bound twice")));
            }
            names.push(name);
            segments.push(Segment::Variable(name.into()));
        } else if let Some(name) = part.strip_prefix(WILDCARD_MARKER) {
            if idx != last {
                return Err(ServerError::invalid_pattern(pattern, "wildcard must be the last segment"));
            }
            let name = if name.is_empty() {
                WILDCARD_PARAM
            } else {
                validate_name(pattern, name)?;
                name
            };
            if names.contains(&name) {
                return Err(ServerError::invalid_pattern(pattern, format!("variable `{name}` bound twice")));
            }
            names.push(name);
            segments.push(Segment::Wildcard(name.into()));
        } else {
            segments.push(Segment::Literal((*part).into()));
        }
    }

    let priority = priority.unwrap_or_else(|| default_priority(&segments));

    Ok(CompiledPattern {
        source: pattern.to_string(),
        domain: normalize_domain(domain),
        method,
        segments,
        priority,
    })
}

/// Orders by literal count first, then variable count; a wildcard tail
/// costs a little. No number of variables outranks one more literal.
pub fn default_priority(segments: &[Segment]) -> i32 {
    let (mut literals, mut variables, mut wildcard) = (0i32, 0i32, false);
    for segment in segments {
        match segment {
            Segment::Literal(_) => literals = literals.saturating_add(1),
            Segment::Variable(_) => variables = variables.saturating_add(1),
            Segment::Wildcard(_) => wildcard = true,
        }
    }
    let penalty = if wildcard { WILDCARD_PENALTY } else { 0 };
    literals
        .saturating_mul(LITERAL_WEIGHT)
        .saturating_add(variables.min(MAX_WEIGHTED_VARIABLES) * VARIABLE_WEIGHT)
        - penalty
}

fn validate_name(pattern: &str, name: &str) -> Result<(), ServerError> {
    if name.is_empty() {
        return Err(ServerError::invalid_pattern(pattern, "variable name is empty"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ServerError::invalid_pattern(
            pattern,
            format!("variable `{name}` contains invalid characters"),
        ));
    }
    Ok(())
}

/// Split a request path into its non-empty segments.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Lowercase a domain; an empty one means any domain.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim();
    if domain.is_empty() {
        ANY_DOMAIN.to_string()
    } else {
        domain.to_ascii_lowercase()
    }
}

/// Lowercase a Host header value and strip its port.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // [::1]:8080
        host.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(host)
    } else {
        host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
    };
    without_port.to_ascii_lowercase()
}

/// Parse the combined `METHOD:/path@domain` notation.
///
/// A missing method means `ALL`, a missing domain means any domain.
pub fn parse_route(route: &str) -> Result<(RouteMethod, String, String), ServerError> {
    let route = route.trim();
    let (method, rest) = if route.starts_with('/') {
        (RouteMethod::All, route)
    } else {
        let (method, rest) = route
            .split_once(':')
            .ok_or_else(|| ServerError::invalid_pattern(route, "expected METHOD:/path"))?;
        (method.parse()?, rest)
    };
    let (path, domain) = match rest.rsplit_once('@') {
        Some((path, domain)) => (path, domain),
        None => (rest, ANY_DOMAIN),
    };
    Ok((method, path.to_string(), normalize_domain(domain)))
}

/// Variables bound by a matched pattern, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(Box<str>, String)>,
}

impl Params {
    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.into(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
