//! Request view handed to handlers and hooks.
//!
//! # Responsibilities
//! - Carry the request ID assigned by the middleware stack (or a fresh one)
//! - Extract routing-relevant information (host, path)
//! - Expose the variables bound by the matched pattern
//!
//! # Design Decisions
//! - The body is fully buffered: handlers are synchronous
//! - Host is lowercased and stripped of its port once, at construction

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::http::{request::Parts, HeaderMap, Method, Uri, Version};

use crate::routing::pattern::{normalize_host, Params};

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct Request {
    id: String,
    method: Method,
    uri: Uri,
    version: Version,
    host: String,
    headers: HeaderMap,
    body: Bytes,
    peer: SocketAddr,
    secure: bool,
    params: Params,
}

impl Request {
    pub fn from_parts(parts: Parts, body: Bytes, peer: SocketAddr, secure: bool) -> Self {
        let id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let host = parts
            .headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.authority().map(|a| a.as_str()))
            .map(normalize_host)
            .unwrap_or_default();

        Self {
            id,
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            host,
            headers: parts.headers,
            body,
            peer,
            secure,
            params: Params::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Host without port, lowercased. Empty when the client sent none.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// True when the request arrived on an HTTPS listener.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// A variable bound by the pattern currently being served.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    pub(crate) fn take_params(&mut self) -> Params {
        std::mem::take(&mut self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = axum::http::Request::builder().uri(uri).header(X_REQUEST_ID, "req-1");
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_host_normalized() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let req = Request::from_parts(parts("/a/b?x=1", Some("Example.COM:8080")), Bytes::new(), peer, false);
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("x=1"));
        assert_eq!(req.id(), "req-1");

        let req = Request::from_parts(parts("http://api.local:81/", None), Bytes::new(), peer, true);
        assert_eq!(req.host(), "api.local");
        assert!(req.is_secure());
    }
}
