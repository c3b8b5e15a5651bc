//! The response model and the HTTP/1.x serializer.

use crate::http::types::{reason_phrase, Version};
use std::time::{SystemTime, UNIX_EPOCH};

/// The `as`-type of a pushed resource, advertised alongside its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Document,
    Script,
    Style,
    Image,
    Font,
    Fetch,
    Other(String),
}

impl PushKind {
    /// Content type hinted into the synthetic request's `accept` header.
    pub(crate) fn accept_hint(&self) -> &str {
        match self {
            PushKind::Document => "text/html",
            PushKind::Script => "application/javascript",
            PushKind::Style => "text/css",
            PushKind::Image => "image/*",
            PushKind::Font => "font/*",
            PushKind::Fetch => "*/*",
            PushKind::Other(_) => "*/*",
        }
    }
}

/// An HTTP response under construction by a handler.
///
/// Mutable until returned; the connection driver then owns serialization.
/// Status must stay within `[100, 599]` (checked by [`set_status`]);
/// header names match case-insensitively but are written to the wire as
/// given.
///
/// [`set_status`]: Response::set_status
///
/// # Examples
/// ```
/// use polyhttp::Response;
///
/// let resp = Response::text("created")
///     .with_status(201)
///     .with_header("x-request-id", "abc123");
/// assert_eq!(resp.status(), 201);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    push_promises: Vec<(String, PushKind)>,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status: status.clamp(100, 599),
            headers: Vec::new(),
            body: Vec::new(),
            push_promises: Vec::new(),
        }
    }

    /// `200 OK` with a plain-text body.
    pub fn text(body: impl Into<String>) -> Self {
        let mut resp = Self::new(200);
        resp.set_header("content-type", "text/plain; charset=utf-8");
        resp.body = body.into().into_bytes();
        resp
    }

    /// `200 OK` with an HTML body.
    pub fn html(body: impl Into<String>) -> Self {
        let mut resp = Self::new(200);
        resp.set_header("content-type", "text/html; charset=utf-8");
        resp.body = body.into().into_bytes();
        resp
    }

    /// `200 OK` with a compact JSON body. Serialization failure becomes
    /// a 500 with a plain body instead of a panic.
    pub fn json(value: &impl serde::Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => {
                let mut resp = Self::new(200);
                resp.set_header("content-type", "application/json");
                resp.body = body;
                resp
            }
            Err(_) => {
                let mut resp = Self::new(500);
                resp.set_header("content-type", "text/plain");
                resp.body = b"serialization failed".to_vec();
                resp
            }
        }
    }

    /// A redirect to `location` (302 by default; override with
    /// [`with_status`](Response::with_status)).
    pub fn redirect(location: impl Into<String>) -> Self {
        let mut resp = Self::new(302);
        resp.set_header("location", location.into());
        resp
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set the status, clamped into `[100, 599]`.
    pub fn set_status(&mut self, status: u16) {
        self.status = status.clamp(100, 599);
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.set_status(status);
        self
    }

    /// Append a header, keeping any existing values with the same name.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replace every header called `name` with a single value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.add_header(name, value);
        self
    }

    /// First value of the header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn headers(&self) -> &[(String, Vec<u8>)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.set_body(body);
        self
    }

    pub(crate) fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    pub(crate) fn clear_body(&mut self) {
        self.body.clear();
    }

    /// Promise a server push of `path` before this response's headers.
    /// Only meaningful on HTTP/2; other transports ignore it.
    pub fn push(&mut self, path: impl Into<String>, kind: PushKind) {
        self.push_promises.push((path.into(), kind));
    }

    pub fn push_promises(&self) -> &[(String, PushKind)] {
        &self.push_promises
    }

    pub(crate) fn push_promises_mut(&mut self) -> &mut Vec<(String, PushKind)> {
        &mut self.push_promises
    }
}

// HTTP/1.x serialization

impl Response {
    /// Serialize into `buf` as an HTTP/1.x response.
    ///
    /// Adds `date` (when the handler did not), the configured `server`
    /// header, the computed `content-length`, and the
    /// keep-alive/close `connection` header. `head_only` suppresses the
    /// body bytes while keeping the content-length of the full body.
    pub(crate) fn serialize_h1(
        &self,
        version: Version,
        keep_alive: bool,
        head_only: bool,
        server_header: Option<&str>,
        buf: &mut Vec<u8>,
    ) {
        buf.extend_from_slice(version.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.status.to_string().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reason_phrase(self.status).as_bytes());
        buf.extend_from_slice(b"\r\n");

        let mut saw_date = false;
        let mut saw_server = false;
        for (name, value) in &self.headers {
            // The driver owns message framing; a handler-set
            // content-length or connection header would let it lie.
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            saw_date |= name.eq_ignore_ascii_case("date");
            saw_server |= name.eq_ignore_ascii_case("server");

            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }

        if !saw_date {
            buf.extend_from_slice(b"date: ");
            buf.extend_from_slice(imf_fixdate(SystemTime::now()).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if let (false, Some(server)) = (saw_server, server_header) {
            buf.extend_from_slice(b"server: ");
            buf.extend_from_slice(server.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"content-length: ");
        buf.extend_from_slice(self.body.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\nconnection: ");
        buf.extend_from_slice(if keep_alive { b"keep-alive" } else { b"close" });
        buf.extend_from_slice(b"\r\n\r\n");

        if !head_only {
            buf.extend_from_slice(&self.body);
        }
    }
}

// IMF-fixdate (RFC 9110 section 5.6.7), e.g. `Tue, 06 Nov 1994 08:49:37 GMT`.

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

pub(crate) fn imf_fixdate(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = (secs / 86_400) as i64;
    let (year, month, day) = civil_from_days(days);
    let weekday = ((days % 7 + 4) % 7) as usize;
    let second_of_day = secs % 86_400;

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAY_NAMES[weekday],
        day,
        MONTH_NAMES[month - 1],
        year,
        second_of_day / 3600,
        second_of_day / 60 % 60,
        second_of_day % 60,
    )
}

// Days-since-epoch to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, usize, u8) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as usize;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
