//! Server configuration: run options, parse limits, protocol tuning.
//!
//! Defaults are intentionally conservative. They protect against resource
//! exhaustion (header flooding, slowloris, oversized bodies) while staying
//! permissive enough for ordinary REST traffic. Raise a limit only when
//! you see legitimate requests rejected with 413/414/431.

use crate::errors::ConfigError;
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio_rustls::rustls;

/// Top-level run options for [`Server`](crate::Server).
///
/// # Examples
/// ```
/// use polyhttp::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig {
///     port: 9000,
///     keep_alive_timeout: Duration::from_secs(10),
///     ..ServerConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct ServerConfig {
    /// Bind address (default `"127.0.0.1"`).
    pub host: String,
    /// TCP port (default `8080`).
    pub port: u16,

    /// TLS configuration. When set, the listener wraps every accepted
    /// socket in TLS and offers ALPN ids `h2` and `http/1.1`; the
    /// negotiated id selects the initial protocol. Certificate loading is
    /// the caller's business.
    pub tls: Option<Arc<rustls::ServerConfig>>,

    /// UDP port handed to the HTTP/3 transport, when one is installed
    /// via [`ServerBuilder::http3_transport`]. Ignored otherwise.
    ///
    /// [`ServerBuilder::http3_transport`]: crate::ServerBuilder::http3_transport
    pub http3_port: Option<u16>,

    /// Idle time before an HTTP/1.x connection is closed between
    /// requests (default `5s`).
    pub keep_alive_timeout: Duration,
    /// Time from the first byte of a request to its complete arrival
    /// (default `60s`). Expiry yields `408 Request Timeout`.
    pub request_timeout: Duration,

    /// Initial read buffer capacity per connection (default `16 KiB`).
    pub read_buffer_size: usize,
    /// Initial write buffer capacity per connection (default `16 KiB`).
    pub write_buffer_size: usize,

    /// Concurrent connection bound (default `10_000`). Beyond this the
    /// acceptor defers `accept()` until a slot frees up.
    pub max_connections: usize,
    /// Requests served on one keep-alive connection before it is
    /// recycled (default `1_000`).
    pub max_requests_per_connection: usize,

    /// Grace period for in-flight requests during shutdown (default
    /// `30s`); afterwards remaining tasks are cancelled.
    pub shutdown_grace: Duration,

    /// Value of the `server` response header; `None` omits it.
    pub server_header: Option<String>,

    /// HTTP/1.x parse limits.
    pub limits: ParseLimits,
    /// HTTP/2 settings advertised to clients.
    pub h2: H2Config,
    /// WebSocket transport limits.
    pub ws: WsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tls: None,
            http3_port: None,
            keep_alive_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            read_buffer_size: 16 * 1024,
            write_buffer_size: 16 * 1024,
            max_connections: 10_000,
            max_requests_per_connection: 1_000,
            shutdown_grace: Duration::from_secs(30),
            server_header: Some("polyhttp".to_string()),
            limits: ParseLimits::default(),
            h2: H2Config::default(),
            ws: WsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check the configuration for values the protocol engines cannot
    /// honor. A binary should treat an error as exit code 2.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::BadAddress(self.host.clone()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::BadSetting("max_connections must be > 0"));
        }
        if !(16_384..=16_777_215).contains(&self.h2.max_frame_size) {
            return Err(ConfigError::BadSetting(
                "h2.max_frame_size outside [16384, 2^24-1]",
            ));
        }
        if self.h2.initial_window_size > 0x7FFF_FFFF {
            return Err(ConfigError::BadSetting(
                "h2.initial_window_size exceeds 2^31-1",
            ));
        }
        Ok(())
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// HTTP/1.x wire limits.
///
/// The parser enforces these while the request is still arriving, so an
/// abusive client is rejected before it can stage a large allocation.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Request target bound, path plus query (default `8 KiB`).
    pub max_target: usize,
    /// Header count bound per request (default `100`).
    pub max_headers: usize,
    /// Single header line bound, name + value (default `8 KiB`).
    pub max_header_line: usize,
    /// Whole header block bound (default `64 KiB`).
    pub max_header_block: usize,
    /// Body bound for both content-length and chunked framing
    /// (default `16 MiB`).
    pub max_body: usize,
    /// Query pair count bound (default `64`).
    pub max_query_pairs: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_target: 8 * 1024,
            max_headers: 100,
            max_header_line: 8 * 1024,
            max_header_block: 64 * 1024,
            max_body: 16 * 1024 * 1024,
            max_query_pairs: 64,
        }
    }
}

/// Initial HTTP/2 settings, advertised in the server's first SETTINGS
/// frame. Field meanings per RFC 7540 section 6.5.2.
#[derive(Debug, Clone)]
pub struct H2Config {
    /// HPACK dynamic table bound for the peer's encoder (default `4096`).
    pub header_table_size: u32,
    /// Whether PUSH_PROMISE may be sent (default `true`; the client can
    /// still disable it from its side).
    pub enable_push: bool,
    /// Concurrent stream bound per connection (default `100`).
    pub max_concurrent_streams: u32,
    /// Initial per-stream flow-control window (default `65_535`).
    pub initial_window_size: u32,
    /// Largest frame payload accepted (default `16_384`).
    pub max_frame_size: u32,
    /// Decoded header list bound; `None` leaves it unset.
    pub max_header_list_size: Option<u32>,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: None,
        }
    }
}

/// WebSocket limits.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Reassembled message bound (default `64 MiB`); larger messages
    /// close the connection with code 1009.
    pub max_message_size: usize,
    /// How long to wait for the peer's TCP close after the closing
    /// handshake (default `2s`).
    pub close_grace: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            close_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_run_api() {
        let c = ServerConfig::default();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 8080);
        assert_eq!(c.keep_alive_timeout, Duration::from_secs(5));
        assert_eq!(c.request_timeout, Duration::from_secs(60));
        assert_eq!(c.read_buffer_size, 16 * 1024);
        assert_eq!(c.max_connections, 10_000);
        assert_eq!(c.shutdown_grace, Duration::from_secs(30));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        #[rustfmt::skip]
        let cases: [(&str, Box<dyn Fn(&mut ServerConfig)>); 4] = [
            ("host",        Box::new(|c| c.host = "not-an-ip".into())),
            ("connections", Box::new(|c| c.max_connections = 0)),
            ("frame size",  Box::new(|c| c.h2.max_frame_size = 100)),
            ("window",      Box::new(|c| c.h2.initial_window_size = u32::MAX)),
        ];

        for (name, mutate) in cases {
            let mut c = ServerConfig::default();
            mutate(&mut c);
            assert!(c.validate().is_err(), "{name} should be rejected");
        }
    }
}
