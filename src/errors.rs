use crate::http::types::Version;
use std::{error, fmt, io};

/// Broad error classes used for propagation decisions: parse and protocol
/// errors never reach handlers, transport errors abandon the connection
/// outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    Parse,
    Timeout,
    Handler,
    Transport,
    Resource,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,
    InvalidTarget,
    TargetTooLong,

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    HeaderBlockTooLarge,
    InvalidContentLength,
    ConflictingBodyFraming,
    InvalidChunk,
    BodyTooLarge,

    RequestTimeout,
    ServiceUnavailable,
    HandlerFailed,

    Io(IoError),
}

macro_rules! error_table {
    ($( $name:ident: $class:ident, $code:literal, $reason:literal; )*) => {
        impl ErrorKind {
            pub(crate) const fn status(&self) -> (u16, &'static str) {
                match self {
                    $( Self::$name { .. } => ($code, $reason), )*
                }
            }

            pub(crate) const fn class(&self) -> ErrorClass {
                match self {
                    $( Self::$name { .. } => ErrorClass::$class, )*
                }
            }
        }
    };
}

error_table! {
    InvalidMethod:          Parse,     400, "invalid method";
    InvalidTarget:          Parse,     400, "invalid request target";
    TargetTooLong:          Parse,     414, "request target too long";

    InvalidVersion:         Parse,     400, "invalid http version";
    UnsupportedVersion:     Parse,     505, "http version not supported";

    InvalidHeader:          Parse,     400, "invalid header";
    TooManyHeaders:         Parse,     431, "too many headers";
    HeaderBlockTooLarge:    Parse,     431, "header block too large";
    InvalidContentLength:   Parse,     400, "invalid content-length";
    ConflictingBodyFraming: Parse,     400, "conflicting body framing";
    InvalidChunk:           Parse,     400, "invalid chunk encoding";
    BodyTooLarge:           Parse,     413, "request body too large";

    RequestTimeout:         Timeout,   408, "request timeout";
    ServiceUnavailable:     Resource,  503, "service unavailable";
    HandlerFailed:          Handler,   500, "internal server error";

    Io:                     Transport, 503, "transport failure";
}

impl ErrorKind {
    /// Serialize the canned error response for this kind. The body is
    /// `{"error":"<reason>"}` when the client accepts JSON, plain text
    /// otherwise; either way `content-length` is exact and the connection
    /// is marked for close.
    pub(crate) fn to_http(&self, version: Version, json: bool) -> Vec<u8> {
        let (code, reason) = self.status();
        let phrase = crate::http::types::reason_phrase(code);

        let mut buf = Vec::with_capacity(128 + reason.len());
        buf.extend_from_slice(version.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(code.to_string().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(phrase.as_bytes());
        buf.extend_from_slice(b"\r\nconnection: close\r\n");

        let body = if json {
            buf.extend_from_slice(b"content-type: application/json\r\n");
            format!("{{\"error\":\"{reason}\"}}")
        } else {
            buf.extend_from_slice(b"content-type: text/plain\r\n");
            reason.to_string()
        };

        buf.extend_from_slice(b"content-length: ");
        buf.extend_from_slice(body.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n\r\n");
        buf.extend_from_slice(body.as_bytes());
        buf
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (code, reason) = self.status();
        write!(f, "{code} {reason}")
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

// Public error surface

/// Failure while accepting or serving connections.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// Binding the listening socket failed. Fatal to the listener.
    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] io::Error),
    /// The TLS handshake with one client failed. Only that connection
    /// is closed.
    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(#[source] io::Error),
    /// Accepting a socket failed transiently (fd exhaustion and kin).
    #[error("accept failed: {0}")]
    ResourceExhausted(#[source] io::Error),
}

impl AcceptError {
    /// Process exit code for a binary wrapping [`Server::run`]: fatal
    /// startup errors exit 1.
    ///
    /// [`Server::run`]: crate::Server::run
    pub fn exit_code(&self) -> i32 {
        match self {
            AcceptError::BindFailed(_) => 1,
            _ => 0,
        }
    }
}

/// Rejected route registration.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The (method, template) pair is already registered.
    #[error("route already registered: {0}")]
    Conflict(String),
    /// The template is malformed: bad parameter syntax, a non-terminal
    /// `path` parameter, or more than one `path` parameter.
    #[error("invalid route template: {0}")]
    InvalidTemplate(String),
}

/// Invalid server configuration. A binary should exit with code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid bind address: {0}")]
    BadAddress(String),
    #[error("invalid setting: {0}")]
    BadSetting(&'static str),
}
