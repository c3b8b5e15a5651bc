//! Listener and server assembly.
//!
//! The builder collects the router, middleware, exception handlers and
//! configuration, freezes them into a [`Dispatcher`], and the bound
//! server accepts connections into per-connection driver tasks. The
//! connection bound is a semaphore permit acquired before `accept()`,
//! so an overloaded server defers admission instead of queueing
//! unbounded work.

use crate::{
    buffer::BufferPool,
    config::ServerConfig,
    dispatch::{Catcher, Dispatcher, FaultKind, HandlerFault, Middleware, Next},
    errors::{AcceptError, ConfigError},
    h3::{self, H3Transport},
    http::{request::Request, response::Response},
    routing::router::{ResponseFuture, Router},
    server::connection,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, Semaphore},
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;

/// Configures and assembles a [`Server`].
///
/// # Examples
/// ```no_run
/// use polyhttp::{Response, Router, Server};
///
/// #[tokio::main]
/// async fn main() {
///     let mut router = Router::new();
///     router.get("/hello", |_| async { Response::text("hi") }).unwrap();
///
///     Server::builder()
///         .router(router)
///         .build()
///         .unwrap()
///         .run()
///         .await
///         .unwrap();
/// }
/// ```
pub struct ServerBuilder {
    router: Router,
    config: ServerConfig,
    middleware: Vec<Middleware>,
    catchers: Vec<Catcher>,
    http3: Option<Box<dyn H3Transport>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            config: ServerConfig::default(),
            middleware: Vec::new(),
            catchers: Vec::new(),
            http3: None,
        }
    }

    /// Install the route table.
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Replace the configuration wholesale.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a middleware; registration order is execution order,
    /// first registered outermost.
    pub fn middleware<F, Fut>(mut self, middleware: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.middleware.push(Arc::new(move |req, next| {
            Box::pin(middleware(req, next)) as ResponseFuture
        }));
        self
    }

    /// Register an exception handler. `template` scopes it to one
    /// route (`None` = global); `kind` scopes it to one fault kind
    /// (`None` = any). Lookup walks from most specific to least.
    pub fn exception_handler<F>(
        mut self,
        template: Option<&str>,
        kind: Option<FaultKind>,
        handler: F,
    ) -> Self
    where
        F: Fn(&Request, &HandlerFault) -> Response + Send + Sync + 'static,
    {
        self.catchers.push(Catcher {
            template: template.map(Arc::from),
            kind,
            handler: Arc::new(handler),
        });
        self
    }

    /// Install an HTTP/3 transport; it is only started when
    /// [`ServerConfig::http3_port`] is also set.
    pub fn http3_transport(mut self, transport: Box<dyn H3Transport>) -> Self {
        self.http3 = Some(transport);
        self
    }

    /// Validate the configuration and freeze the dispatcher.
    /// A configuration error maps to process exit code 2.
    pub fn build(self) -> Result<Server, ConfigError> {
        self.config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Server {
            dispatcher: Arc::new(Dispatcher::new(self.router, self.middleware, self.catchers)),
            config: Arc::new(self.config),
            http3: self.http3,
            shutdown_tx,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured server, ready to bind.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    http3: Option<Box<dyn H3Transport>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Triggers graceful shutdown from anywhere. Triggering twice is the
/// same as once.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Handle for signalling graceful shutdown; keep it before calling
    /// [`run`](Server::run).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Bind the listener without serving yet; useful to learn the
    /// local address when binding port 0.
    pub async fn bind(self) -> Result<BoundServer, AcceptError> {
        let listener = TcpListener::bind(self.config.bind_addr())
            .await
            .map_err(AcceptError::BindFailed)?;
        let local_addr = listener.local_addr().map_err(AcceptError::BindFailed)?;

        // ALPN decides h2 vs http/1.1 on TLS connections.
        let tls = self.config.tls.as_ref().map(|tls| {
            let mut tls_config = (**tls).clone();
            tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            TlsAcceptor::from(Arc::new(tls_config))
        });

        tracing::info!(
            address = %local_addr,
            tls = tls.is_some(),
            max_connections = self.config.max_connections,
            "listener bound"
        );

        Ok(BoundServer {
            listener,
            local_addr,
            tls,
            dispatcher: self.dispatcher,
            config: self.config,
            http3: self.http3,
            shutdown_tx: self.shutdown_tx,
        })
    }

    /// Bind and serve until shutdown is triggered.
    ///
    /// Exit codes for a wrapping binary: `0` after a clean shutdown,
    /// `1` for a fatal startup error ([`AcceptError::exit_code`]), `2`
    /// for a configuration error rejected by
    /// [`ServerBuilder::build`].
    pub async fn run(self) -> Result<(), AcceptError> {
        self.bind().await?.serve().await
    }
}

/// A server with its listener bound.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    http3: Option<Box<dyn H3Transport>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown, then drain: stop accepting,
    /// let in-flight requests finish within `shutdown_grace`, cancel
    /// the rest.
    pub async fn serve(mut self) -> Result<(), AcceptError> {
        let pool = BufferPool::new(
            self.config.max_connections * 2,
            self.config.read_buffer_size,
        );
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if let (Some(mut transport), Some(port)) = (self.http3.take(), self.config.http3_port) {
            match transport.bind(port) {
                Ok(()) => {
                    tracing::info!(port, "http/3 transport started");
                    tasks.spawn(h3::pump(transport, self.dispatcher.clone()));
                }
                Err(error) => {
                    tracing::warn!(port, %error, "http/3 transport failed to bind; disabled")
                }
            }
        }

        loop {
            // Admission control: no accept without a free permit.
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => {
                    permit.expect("connection semaphore closed")
                }
                _ = shutdown_rx.recv() => break,
            };

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let _ = socket.set_nodelay(true);
                        let dispatcher = self.dispatcher.clone();
                        let config = self.config.clone();
                        let pool = pool.clone();
                        let tls = self.tls.clone();
                        let shutdown = self.shutdown_tx.subscribe();

                        tasks.spawn(async move {
                            let _permit = permit;
                            handle_socket(socket, peer, tls, dispatcher, config, pool, shutdown)
                                .await;
                        });
                    }
                    Err(error) => {
                        // Transient (fd pressure and kin): back off,
                        // keep the listener alive.
                        tracing::warn!(
                            error = %AcceptError::ResourceExhausted(error),
                            "accept failed"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        tracing::info!(
            in_flight = tasks.len(),
            grace = ?self.config.shutdown_grace,
            "shutting down"
        );

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), "grace expired, cancelling tasks");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!("shutdown complete");
        Ok(())
    }
}

async fn handle_socket(
    socket: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    pool: Arc<BufferPool>,
    shutdown: broadcast::Receiver<()>,
) {
    match tls {
        Some(acceptor) => {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::debug!(
                        peer = %peer,
                        error = %AcceptError::TlsHandshakeFailed(error),
                        "closing connection"
                    );
                    return;
                }
            };
            // Absent ALPN defaults to HTTP/1.1.
            let h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2");
            connection::drive(stream, peer, dispatcher, config, pool, shutdown, h2).await;
        }
        None => {
            connection::drive(socket, peer, dispatcher, config, pool, shutdown, false).await;
        }
    }
}
