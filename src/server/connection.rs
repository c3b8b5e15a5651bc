//! Per-connection HTTP/1.x driver.
//!
//! Pumps bytes into the incremental parser, dispatches each complete
//! request, serializes the response, and honors keep-alive. Pipelined
//! requests are answered strictly in arrival order because the loop
//! parses the next request only after the previous response is on the
//! wire. Upgrade requests hand the socket to the WebSocket or HTTP/2
//! engines.

use crate::{
    buffer::BufferPool,
    config::ServerConfig,
    dispatch::Dispatcher,
    errors::ErrorKind,
    h2::connection::{self as h2, H2Entry},
    http::{
        h1::{H1Parser, H1Request, Parse},
        query,
        request::Request,
        types::{Method, Version},
    },
    server::deadline::{Deadline, Expired},
    ws,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::broadcast,
};

/// Drive one accepted connection to completion.
pub(crate) async fn drive<S>(
    stream: S,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    pool: Arc<BufferPool>,
    shutdown: broadcast::Receiver<()>,
    h2_direct: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if h2_direct {
        h2::serve(stream, Some(peer), dispatcher, config, shutdown, H2Entry::Direct).await;
        return;
    }
    drive_h1(stream, peer, dispatcher, config, pool, shutdown).await;
}

async fn drive_h1<S>(
    mut stream: S,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    pool: Arc<BufferPool>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut read_buf = pool.acquire().await;
    let mut write_buf = pool.acquire().await;
    let mut parser = H1Parser::new(config.limits.clone());

    let mut served: usize = 0;
    let mut closing = false;
    let mut continue_sent = false;
    let mut request_deadline: Option<Deadline> = None;

    tracing::debug!(peer = %peer, "connection open");

    loop {
        match parser.advance(&read_buf) {
            Parse::Done { request, consumed } => {
                read_buf.drain(..consumed);
                request_deadline = None;
                continue_sent = false;
                served += 1;

                // WebSocket upgrade takes the socket away for good.
                if let Some(key) = websocket_upgrade(&request, &dispatcher) {
                    let leftover = std::mem::take(&mut *read_buf);
                    drop(read_buf);
                    drop(write_buf);
                    run_websocket(stream, request, key, leftover, dispatcher, config).await;
                    return;
                }

                // h2c upgrade restarts the connection as HTTP/2 with
                // the current request on stream 1.
                if let Some(settings_payload) = h2c_upgrade(&request) {
                    let Ok(upgraded) = to_request(&config, request, Version::H2, peer) else {
                        let _ = send_error(&mut stream, &config, ErrorKind::InvalidTarget).await;
                        return;
                    };
                    const SWITCH: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
                                            connection: Upgrade\r\n\
                                            upgrade: h2c\r\n\r\n";
                    if write_all_timed(&mut stream, &config, SWITCH).await.is_err() {
                        return;
                    }

                    let leftover = std::mem::take(&mut *read_buf);
                    drop(read_buf);
                    drop(write_buf);
                    h2::serve(
                        Rewind::new(leftover, stream),
                        Some(peer),
                        dispatcher,
                        config,
                        shutdown,
                        H2Entry::Upgrade {
                            settings_payload,
                            request: upgraded,
                        },
                    )
                    .await;
                    return;
                }

                let version = request.version;
                let head_only = request.method == Method::Head;
                let keep_alive = request.keep_alive
                    && !closing
                    && served < config.max_requests_per_connection;

                let req = match to_request(&config, request, version, peer) {
                    Ok(req) => req,
                    Err(kind) => {
                        let _ = send_error(&mut stream, &config, kind).await;
                        return;
                    }
                };

                let response = dispatcher.dispatch(req).await;

                write_buf.clear();
                response.serialize_h1(
                    version,
                    keep_alive,
                    head_only,
                    config.server_header.as_deref(),
                    &mut write_buf,
                );
                if write_all_timed(&mut stream, &config, &write_buf).await.is_err() {
                    return;
                }

                if !keep_alive {
                    break;
                }
            }

            Parse::Invalid(kind) => {
                tracing::debug!(
                    peer = %peer,
                    class = ?kind.class(),
                    error = %kind,
                    "rejecting malformed request"
                );
                let _ = send_error(&mut stream, &config, kind).await;
                return;
            }

            Parse::NeedMore => {
                // `Expect: 100-continue` is answered before the body
                // is read, once per request.
                if parser.take_expect_continue() && !continue_sent {
                    continue_sent = true;
                    if write_all_timed(&mut stream, &config, b"HTTP/1.1 100 Continue\r\n\r\n")
                        .await
                        .is_err()
                    {
                        return;
                    }
                }

                let mid_request = parser.mid_request() || !read_buf.is_empty();
                let deadline = match request_deadline {
                    Some(deadline) => deadline,
                    None if mid_request => {
                        let deadline = Deadline::after(config.request_timeout);
                        request_deadline = Some(deadline);
                        deadline
                    }
                    None => Deadline::after(config.keep_alive_timeout),
                };

                tokio::select! {
                    result = deadline.run(stream.read_buf(&mut *read_buf)) => match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(_)) => {}
                        Ok(Err(_)) => break,
                        Err(Expired) => {
                            if mid_request {
                                let _ = send_error(
                                    &mut stream,
                                    &config,
                                    ErrorKind::RequestTimeout,
                                )
                                .await;
                            }
                            // Idle expiry closes silently.
                            break;
                        }
                    },
                    _ = shutdown.recv(), if !closing => {
                        closing = true;
                        if !mid_request {
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(peer = %peer, served, "connection closed");
}

/// A valid WebSocket upgrade aimed at a registered WebSocket route.
fn websocket_upgrade(request: &H1Request, dispatcher: &Dispatcher) -> Option<String> {
    if request.method != Method::Get {
        return None;
    }
    let key = ws::connection::upgrade_key(&request.headers)?;
    let path = raw_path(&request.target);
    dispatcher.router().match_websocket(&path)?;
    Some(key)
}

async fn run_websocket<S>(
    mut stream: S,
    request: H1Request,
    key: String,
    leftover: Vec<u8>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let path = raw_path(&request.target);
    let Some((handler, params)) = dispatcher.router().match_websocket(&path) else {
        return;
    };

    let accept = ws::connection::handshake_response(&key);
    if write_all_timed(&mut stream, &config, &accept).await.is_err() {
        return;
    }

    let conn = ws::connection::WebSocketConnection::new(
        Box::new(stream),
        leftover,
        path,
        request.headers,
        params,
        config.ws.clone(),
    );

    // The handler owns the connection until it returns; the clone
    // stays behind for the closing handshake.
    let tail = conn.clone();
    handler(conn).await;
    tail.finish().await;
}

/// `Upgrade: h2c` with a decodable `HTTP2-Settings` payload.
fn h2c_upgrade(request: &H1Request) -> Option<Vec<u8>> {
    if !request.headers.contains_token("upgrade", "h2c")
        || !request.headers.contains_token("connection", "upgrade")
    {
        return None;
    }
    let raw = request.headers.get_str("http2-settings")?;
    URL_SAFE_NO_PAD.decode(raw.trim()).ok()
}

fn raw_path(target: &[u8]) -> String {
    let target = String::from_utf8_lossy(target);
    match target.split_once('?') {
        Some((path, _)) => path.to_string(),
        None => target.into_owned(),
    }
}

fn to_request(
    config: &ServerConfig,
    parsed: H1Request,
    version: Version,
    peer: SocketAddr,
) -> Result<Request, ErrorKind> {
    let target = String::from_utf8_lossy(&parsed.target).into_owned();
    let (path, query_pairs) = match target.split_once('?') {
        Some((path, raw_query)) => (
            path.to_string(),
            query::parse(raw_query.as_bytes(), config.limits.max_query_pairs)
                .map_err(|_| ErrorKind::InvalidTarget)?,
        ),
        None => (target, Vec::new()),
    };

    Ok(Request::new(
        parsed.method,
        path,
        query_pairs,
        parsed.headers,
        parsed.body,
        version,
        Some(peer),
    ))
}

async fn send_error<S>(
    stream: &mut S,
    config: &ServerConfig,
    kind: ErrorKind,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_all_timed(stream, config, &kind.to_http(Version::Http11, false)).await
}

async fn write_all_timed<S>(
    stream: &mut S,
    config: &ServerConfig,
    bytes: &[u8],
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match tokio::time::timeout(config.request_timeout, stream.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
    }
}

/// A byte stream that replays already-buffered bytes before reading
/// from the socket again; used when a protocol switch happens after
/// some of the next protocol's bytes were read into the HTTP/1.1
/// buffer.
pub(crate) struct Rewind<S> {
    pre: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub(crate) fn new(pre: Vec<u8>, inner: S) -> Self {
        Self { pre, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.pre.len() {
            let n = buf.remaining().min(this.pre.len() - this.pos);
            buf.put_slice(&this.pre[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::response::Response, routing::router::Router};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    fn test_dispatcher() -> Arc<Dispatcher> {
        let mut router = Router::new();
        router
            .get("/hello", |_| async { Response::text("hi") })
            .unwrap();
        router
            .post("/echo", |req| async move {
                Response::new(200).with_body(req.body().to_vec())
            })
            .unwrap();
        Arc::new(Dispatcher::new(router, Vec::new(), Vec::new()))
    }

    fn start(config: ServerConfig) -> (DuplexStream, broadcast::Sender<()>) {
        let (server_io, client_io) = duplex(1 << 16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = Arc::new(config);
        let pool = BufferPool::new(4, config.read_buffer_size);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        tokio::spawn(drive(
            server_io,
            peer,
            test_dispatcher(),
            config,
            pool,
            shutdown_rx,
            false,
        ));
        (client_io, shutdown_tx)
    }

    async fn read_response(client: &mut DuplexStream) -> String {
        // Responses here are small; one read after a short settle is
        // enough for these tests.
        let mut out = vec![0u8; 8192];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut out))
            .await
            .expect("response expected")
            .unwrap();
        String::from_utf8_lossy(&out[..n]).into_owned()
    }

    #[tokio::test]
    async fn keep_alive_serves_sequential_requests() {
        let (mut client, _guard) = start(ServerConfig::default());

        for round in 0..3 {
            client
                .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let response = read_response(&mut client).await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "round {round}");
            assert!(response.contains("connection: keep-alive\r\n"));
            assert!(response.ends_with("\r\n\r\nhi"));
        }
    }

    #[tokio::test]
    async fn connection_close_is_honored() {
        let (mut client, _guard) = start(ServerConfig::default());

        client
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.contains("connection: close\r\n"));

        // The driver closed its end; the next read reports EOF.
        let mut probe = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut probe))
            .await
            .expect("EOF expected")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn pipelined_requests_answered_in_order() {
        let (mut client, _guard) = start(ServerConfig::default());

        client
            .write_all(
                b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nonePOST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\ntwo",
            )
            .await
            .unwrap();

        let mut all = String::new();
        while all.matches("HTTP/1.1 200").count() < 2 {
            all.push_str(&read_response(&mut client).await);
        }
        let first = all.find("one").expect("first body");
        let second = all.find("two").expect("second body");
        assert!(first < second, "responses must keep request order");
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_close() {
        let (mut client, _guard) = start(ServerConfig::default());

        client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
        assert!(response.contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn request_timeout_yields_408() {
        let mut config = ServerConfig::default();
        config.request_timeout = Duration::from_millis(80);
        let (mut client, _guard) = start(config);

        // First byte arrives, the rest never does.
        client.write_all(b"GET /hel").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(
            response.starts_with("HTTP/1.1 408 Request Timeout\r\n"),
            "{response}"
        );
    }

    #[tokio::test]
    async fn idle_timeout_closes_silently() {
        let mut config = ServerConfig::default();
        config.keep_alive_timeout = Duration::from_millis(60);
        let (mut client, _guard) = start(config);

        let mut probe = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut probe))
            .await
            .expect("silent close expected")
            .unwrap();
        assert_eq!(n, 0, "no bytes before the silent close");
    }

    #[tokio::test]
    async fn expect_continue_interim_response() {
        let (mut client, _guard) = start(ServerConfig::default());

        client
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
            .await
            .unwrap();
        let interim = read_response(&mut client).await;
        assert!(interim.starts_with("HTTP/1.1 100 Continue\r\n\r\n"), "{interim}");

        client.write_all(b"hello").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.contains("content-length: 5"));
        assert!(response.ends_with("hello"));
    }

    #[tokio::test]
    async fn shutdown_marks_next_response_close() {
        let (mut client, shutdown) = start(ServerConfig::default());

        // Start a request, signal shutdown mid-parse, then finish it.
        client.write_all(b"GET /hello HTTP/1.1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.write_all(b"Host: x\r\n\r\n").await.unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("connection: close\r\n"), "{response}");
    }

    #[tokio::test]
    async fn rewind_replays_buffered_bytes() {
        let (mut far, near) = duplex(64);
        far.write_all(b" world").await.unwrap();

        let mut rewound = Rewind::new(b"hello".to_vec(), near);
        let mut out = [0u8; 11];
        rewound.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }
}
