//! The request model handed to user handlers.

use crate::http::types::{HeaderMap, Method, Version};
use std::{net::SocketAddr, sync::OnceLock};

/// A fully received HTTP request.
///
/// Immutable once delivered to a handler: the body is complete, headers
/// are indexed, and path parameters from the matched route are filled
/// in. The same type flows out of the HTTP/1.1 parser, the HTTP/2
/// multiplexer, and any installed HTTP/3 transport.
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Vec<u8>,
    path_params: Vec<(String, String)>,
    version: Version,
    remote_addr: Option<SocketAddr>,
    json_cache: OnceLock<Option<serde_json::Value>>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        path: String,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        body: Vec<u8>,
        version: Version,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Request {
            method,
            path,
            query,
            headers,
            body,
            path_params: Vec::new(),
            version,
            remote_addr,
            json_cache: OnceLock::new(),
        }
    }

    pub(crate) fn set_path_params(&mut self, params: Vec<(String, String)>) {
        self.path_params = params;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The undecoded path component of the request target.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Ordered, percent-decoded query pairs; duplicate names are kept.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First value of the query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of the header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// The complete request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// The body parsed as JSON, memoized across calls. A body that is
    /// not valid JSON yields `None`; nothing panics.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json_cache
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    /// Parameters captured by the matched route template. Keys are
    /// exactly the template's parameter names.
    pub fn path_params(&self) -> &[(String, String)] {
        &self.path_params
    }

    /// A single captured path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Protocol the request arrived on.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Peer address, when the transport knows one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether error bodies for this client should be JSON.
    pub(crate) fn accepts_json(&self) -> bool {
        match self.headers.get("accept") {
            Some(accept) => {
                let accept = accept.to_ascii_lowercase();
                accept.windows(4).any(|w| w == b"json") || accept.windows(3).any(|w| w == b"*/*")
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::HeaderMap;

    fn request(headers: Vec<(String, Vec<u8>)>, body: &[u8]) -> Request {
        Request::new(
            Method::Post,
            "/items".to_string(),
            vec![("page".into(), "2".into()), ("page".into(), "3".into())],
            HeaderMap::from_pairs(headers),
            body.to_vec(),
            Version::Http11,
            None,
        )
    }

    #[test]
    fn accessors() {
        let req = request(
            vec![("Content-Type".into(), b"application/json".to_vec())],
            b"{}",
        );

        assert_eq!(req.method(), &Method::Post);
        assert_eq!(req.path(), "/items");
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.header("content-type"), Some(&b"application/json"[..]));
        assert_eq!(req.version(), Version::Http11);
    }

    #[test]
    fn json_is_memoized_and_failure_is_a_value() {
        let good = request(vec![], br#"{"id": 7, "tags": ["a"]}"#);
        let parsed = good.json().expect("valid json");
        assert_eq!(parsed["id"], 7);
        // Second call returns the same cached value.
        assert!(std::ptr::eq(good.json().unwrap(), parsed));

        let bad = request(vec![], b"not json");
        assert!(bad.json().is_none());
        assert!(bad.json().is_none());
    }

    #[test]
    fn path_params_round_trip() {
        let mut req = request(vec![], b"");
        req.set_path_params(vec![("id".into(), "42".into())]);
        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.param("other"), None);
    }

    #[test]
    fn accept_negotiation() {
        #[rustfmt::skip]
        let cases: [(Option<&[u8]>, bool); 5] = [
            (Some(b"application/json"),        true),
            (Some(b"application/JSON"),        true),
            (Some(b"text/html, */*;q=0.1"),    true),
            (Some(b"text/plain"),              false),
            (None,                             false),
        ];

        for (accept, expected) in cases {
            let headers = match accept {
                Some(v) => vec![("accept".to_string(), v.to_vec())],
                None => vec![],
            };
            assert_eq!(request(headers, b"").accepts_json(), expected);
        }
    }
}
