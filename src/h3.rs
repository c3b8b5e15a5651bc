//! Pluggable HTTP/3 transport seam.
//!
//! The QUIC and frame layers live outside this crate. An installed
//! transport surfaces finished requests as `(method, path, headers,
//! body)` units; the run loop feeds each through the same dispatcher as
//! every other protocol and hands the response back through the
//! exchange's reply slot. No transport installed means no UDP listener,
//! full stop.

use crate::{
    http::{
        query,
        request::Request,
        response::Response,
        types::{HeaderMap, Method, Version},
    },
    Dispatcher,
};
use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};

/// A request unit produced by an HTTP/3 transport.
pub struct H3RequestParts {
    pub method: Method,
    /// Raw request target, path plus optional query.
    pub target: String,
    /// Header pairs; names are matched case-insensitively downstream.
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
}

/// One in-flight HTTP/3 request: the parts plus the way to answer it.
pub struct H3Exchange {
    pub parts: H3RequestParts,
    /// Invoked exactly once with the dispatched response; the
    /// transport owns serialization back onto its streams.
    pub respond: Box<dyn FnOnce(Response) + Send>,
}

/// The transport contract the run loop consults when `http3_port` is
/// configured. Implementations wrap a QUIC endpoint and yield request
/// units; returning `None` ends the pump.
pub trait H3Transport: Send + 'static {
    /// Bind the UDP side. Called once before the first `accept`.
    fn bind(&mut self, port: u16) -> std::io::Result<()>;

    /// Await the next request unit.
    fn accept(&mut self) -> Pin<Box<dyn Future<Output = Option<H3Exchange>> + Send + '_>>;
}

/// Pump a transport's request units through the dispatcher until it
/// runs dry. Each unit is served on its own task, like an HTTP/2
/// stream.
pub(crate) async fn pump(mut transport: Box<dyn H3Transport>, dispatcher: Arc<Dispatcher>) {
    while let Some(exchange) = transport.accept().await {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let request = into_request(exchange.parts);
            let response = dispatcher.dispatch(request).await;
            (exchange.respond)(response);
        });
    }
    tracing::debug!("http/3 transport drained");
}

fn into_request(parts: H3RequestParts) -> Request {
    let (path, query_pairs) = match parts.target.split_once('?') {
        Some((path, query)) => (
            path.to_string(),
            query::parse(query.as_bytes(), usize::MAX).unwrap_or_default(),
        ),
        None => (parts.target, Vec::new()),
    };

    Request::new(
        parts.method,
        path,
        query_pairs,
        HeaderMap::from_pairs(parts.headers),
        parts.body,
        Version::H3,
        parts.remote_addr,
    )
}
