//! polyhttp - a multi-protocol HTTP server library.
//!
//! A connection-oriented engine that accepts TCP connections (plain or
//! TLS with ALPN), speaks HTTP/1.0, HTTP/1.1 and HTTP/2 on them,
//! upgrades HTTP/1.1 connections to WebSocket, and routes every request
//! through one template-based route table regardless of the wire
//! protocol it arrived on.
//!
//! # Protocol Support
//!
//! - **HTTP/1.x**: incremental parser, chunked bodies, `Expect:
//!   100-continue`, pipelining-safe keep-alive.
//! - **HTTP/2**: full frame layer with HPACK, per-stream flow control,
//!   concurrent stream handlers, server push, h2c upgrade.
//! - **WebSocket**: RFC 6455 handshake, fragmentation reassembly,
//!   ping/pong, close handshake.
//! - **HTTP/3**: a pluggable transport seam ([`H3Transport`]); no QUIC
//!   stack ships in this crate.
//!
//! # Quick Start
//!
//! ```no_run
//! use polyhttp::{Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut router = Router::new();
//!     router
//!         .get("/users/{id:int}", |req| async move {
//!             let id = req.param("id").unwrap_or("?").to_string();
//!             Response::json(&serde_json::json!({ "id": id }))
//!         })
//!         .unwrap();
//!     router
//!         .websocket("/ws", |conn| async move {
//!             while let Ok(Some(msg)) = conn.recv().await {
//!                 let _ = conn.send(&msg).await;
//!             }
//!         })
//!         .unwrap();
//!
//!     Server::builder()
//!         .router(router)
//!         .build()
//!         .expect("valid configuration")
//!         .run()
//!         .await
//!         .expect("serve");
//! }
//! ```
//!
//! Routes attach to an explicit [`Router`] value, never to process
//! globals, so tests can build as many independent routers as they
//! like. Handlers receive an immutable [`Request`] with the body fully
//! assembled and return a [`Response`]; middleware wraps them
//! outside-in in registration order.

pub(crate) mod http {
    pub(crate) mod h1;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod h2 {
    pub(crate) mod connection;
    pub(crate) mod frame;
    pub(crate) mod hpack;
    pub(crate) mod huffman;
    pub(crate) mod stream;
}
pub(crate) mod ws {
    pub(crate) mod connection;
    pub(crate) mod frame;
}
pub(crate) mod routing {
    pub(crate) mod router;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod connection;
    pub(crate) mod deadline;
}
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod dispatch;
pub(crate) mod errors;
pub mod h3;

pub(crate) use dispatch::Dispatcher;

pub use crate::{
    config::{H2Config, ParseLimits, ServerConfig, WsConfig},
    dispatch::{FaultKind, HandlerFault, Middleware, Next},
    errors::{AcceptError, ConfigError, RouteError},
    h3::{H3Exchange, H3RequestParts, H3Transport},
    http::{
        query,
        request::Request,
        response::{PushKind, Response},
        types::{status, Header, HeaderMap, Method, Version},
    },
    routing::router::{ResponseFuture, Router},
    server::acceptor::{BoundServer, Server, ServerBuilder, ShutdownHandle},
    ws::connection::{Message, WebSocketConnection, WsError},
};
