//! Incoming HTTP request type.
//!
//! A [`Request`] is the transport's view of one inbound request after the
//! body has been fully read and the route matched. It is owned by the
//! [`RequestContext`](crate::RequestContext) for the rest of the request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Uri};

use crate::method::Method;

/// An incoming HTTP request.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) route: Arc<str>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) peer: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        parts: http::request::Parts,
        body: Bytes,
        route: Arc<str>,
        params: HashMap<String, String>,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self { method, uri: parts.uri, route, headers: parts.headers, body, params, peer }
    }

    pub fn method(&self) -> Method { self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn peer(&self) -> Option<SocketAddr> { self.peer }

    /// The matched route pattern, e.g. `/users/{id}`.
    pub fn route(&self) -> &str { &self.route }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the raw (still percent-encoded) value of a cookie.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.trim_matches('"'))
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// First non-empty value of a query parameter.
    pub fn query(&self, key: &str) -> Option<String> {
        self.query_pairs()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v)
    }

    pub(crate) fn query_pairs(&self) -> impl Iterator<Item = (String, String)> + '_ {
        url::form_urlencoded::parse(self.uri.query().unwrap_or_default().as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
    }

    /// Resolves the client address: first `X-Forwarded-For` hop, then
    /// `X-Real-Ip`, then the transport peer.
    pub fn client_ip(&self) -> String {
        client_ip(&self.headers, self.peer)
    }
}

pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let forwarded = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded.or_else(|| header("x-real-ip")) {
        Some(ip) => ip.to_owned(),
        None => peer.map(|p| p.ip().to_string()).unwrap_or_default(),
    }
}

/// Query-string unescaping: `+` is a space, `%XX` a byte. Cookie values
/// are decoded this way wherever they are read.
pub(crate) fn query_unescape(raw: &str) -> Option<String> {
    urlencoding::decode(&raw.replace('+', " ")).ok().map(|v| v.into_owned())
}
