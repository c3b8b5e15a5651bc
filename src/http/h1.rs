//! Incremental HTTP/1.x request parser.
//!
//! The parser owns a cursor over the connection's read buffer and walks
//! `RequestLine -> Headers -> Body -> Complete`. Each call to
//! [`H1Parser::advance`] consumes as much as the buffer allows and
//! reports one of three outcomes; it never panics on any input. The
//! caller keeps appending bytes and must not drain the buffer until a
//! request completes.

use crate::{
    config::ParseLimits,
    errors::ErrorKind,
    http::types::{self, trim_ascii, Header, HeaderMap, Method, Version},
};
use memchr::memchr;

/// Outcome of one parser step.
#[derive(Debug)]
pub(crate) enum Parse {
    /// The buffer holds an incomplete request; read more bytes.
    NeedMore,
    /// A complete request; `consumed` bytes may be drained from the
    /// front of the buffer (pipelined followers start right after).
    Done {
        request: H1Request,
        consumed: usize,
    },
    /// Malformed or oversized input. The connection answers with the
    /// canned response for the kind and closes.
    Invalid(ErrorKind),
}

/// A parsed request before routing: the raw target is not yet split
/// into path and query.
#[derive(Debug)]
pub(crate) struct H1Request {
    pub(crate) method: Method,
    pub(crate) target: Vec<u8>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Vec<u8>,
    pub(crate) keep_alive: bool,
}

#[derive(Debug)]
enum State {
    RequestLine,
    Headers,
    Body(BodyMode),
}

#[derive(Debug)]
enum BodyMode {
    Length { remaining: usize },
    Chunked(ChunkState),
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

pub(crate) struct H1Parser {
    limits: ParseLimits,
    state: State,
    pos: usize,
    header_block: usize,

    method: Option<Method>,
    target: Vec<u8>,
    version: Version,
    headers: HeaderMap,
    body: Vec<u8>,
    keep_alive: bool,
    expect_continue: bool,
}

impl H1Parser {
    pub(crate) fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            state: State::RequestLine,
            pos: 0,
            header_block: 0,
            method: None,
            target: Vec::new(),
            version: Version::Http11,
            headers: HeaderMap::with_capacity(16),
            body: Vec::new(),
            keep_alive: true,
            expect_continue: false,
        }
    }

    /// True once the headers of the in-progress request asked for
    /// `100 Continue` and the body has not finished arriving. The caller
    /// resets it by sending the interim response.
    pub(crate) fn take_expect_continue(&mut self) -> bool {
        std::mem::take(&mut self.expect_continue)
    }

    /// Whether any bytes of the current request have been consumed;
    /// decides 408-vs-silent-close on timeout.
    pub(crate) fn mid_request(&self) -> bool {
        self.pos > 0 || !matches!(self.state, State::RequestLine)
    }

    fn reset(&mut self) {
        self.state = State::RequestLine;
        self.pos = 0;
        self.header_block = 0;
        self.method = None;
        self.target = Vec::new();
        self.headers = HeaderMap::with_capacity(16);
        self.body = Vec::new();
        self.keep_alive = true;
        self.expect_continue = false;
    }

    /// Advance over `buf`, which must start at the same request the
    /// previous call saw (append-only between completions).
    pub(crate) fn advance(&mut self, buf: &[u8]) -> Parse {
        loop {
            match &mut self.state {
                State::RequestLine => {
                    let limit = self.limits.max_target + 96;
                    let line = match self.take_line(buf, limit, ErrorKind::TargetTooLong) {
                        Ok(Some(line)) => line,
                        Ok(None) => return Parse::NeedMore,
                        Err(kind) => return Parse::Invalid(kind),
                    };
                    if let Err(kind) = self.parse_request_line(&line) {
                        return Parse::Invalid(kind);
                    }
                    self.state = State::Headers;
                }

                State::Headers => {
                    let line = match self.take_line(
                        buf,
                        self.limits.max_header_line,
                        ErrorKind::HeaderBlockTooLarge,
                    ) {
                        Ok(Some(line)) => line,
                        Ok(None) => return Parse::NeedMore,
                        Err(kind) => return Parse::Invalid(kind),
                    };

                    self.header_block += line.len() + 2;
                    if self.header_block > self.limits.max_header_block {
                        return Parse::Invalid(ErrorKind::HeaderBlockTooLarge);
                    }

                    if line.is_empty() {
                        match self.finish_headers() {
                            Ok(mode) => self.state = State::Body(mode),
                            Err(kind) => return Parse::Invalid(kind),
                        }
                        continue;
                    }

                    if self.headers.len() >= self.limits.max_headers {
                        return Parse::Invalid(ErrorKind::TooManyHeaders);
                    }
                    if let Err(kind) = self.parse_header_line(&line) {
                        return Parse::Invalid(kind);
                    }
                }

                State::Body(BodyMode::Length { remaining }) => {
                    let available = buf.len() - self.pos;
                    let take = available.min(*remaining);
                    self.body.extend_from_slice(&buf[self.pos..self.pos + take]);
                    self.pos += take;
                    *remaining -= take;

                    if *remaining > 0 {
                        return Parse::NeedMore;
                    }
                    return self.complete();
                }

                State::Body(BodyMode::Chunked(chunk)) => match chunk {
                    ChunkState::Size => {
                        let line = match self.take_line(buf, 1024, ErrorKind::InvalidChunk) {
                            Ok(Some(line)) => line,
                            Ok(None) => return Parse::NeedMore,
                            Err(kind) => return Parse::Invalid(kind),
                        };
                        let size = match parse_chunk_size(&line) {
                            Some(size) => size,
                            None => return Parse::Invalid(ErrorKind::InvalidChunk),
                        };
                        if self.body.len().saturating_add(size) > self.limits.max_body {
                            return Parse::Invalid(ErrorKind::BodyTooLarge);
                        }
                        self.state = State::Body(BodyMode::Chunked(if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data { remaining: size }
                        }));
                    }
                    ChunkState::Data { remaining } => {
                        let available = buf.len() - self.pos;
                        let take = available.min(*remaining);
                        self.body.extend_from_slice(&buf[self.pos..self.pos + take]);
                        self.pos += take;
                        *remaining -= take;

                        if *remaining > 0 {
                            return Parse::NeedMore;
                        }
                        self.state = State::Body(BodyMode::Chunked(ChunkState::DataCrlf));
                    }
                    ChunkState::DataCrlf => {
                        let line = match self.take_line(buf, 2, ErrorKind::InvalidChunk) {
                            Ok(Some(line)) => line,
                            Ok(None) => return Parse::NeedMore,
                            Err(kind) => return Parse::Invalid(kind),
                        };
                        if !line.is_empty() {
                            return Parse::Invalid(ErrorKind::InvalidChunk);
                        }
                        self.state = State::Body(BodyMode::Chunked(ChunkState::Size));
                    }
                    ChunkState::Trailers => {
                        // Trailer fields are consumed and discarded.
                        let line = match self.take_line(
                            buf,
                            self.limits.max_header_line,
                            ErrorKind::HeaderBlockTooLarge,
                        ) {
                            Ok(Some(line)) => line,
                            Ok(None) => return Parse::NeedMore,
                            Err(kind) => return Parse::Invalid(kind),
                        };
                        if line.is_empty() {
                            return self.complete();
                        }
                    }
                },
            }
        }
    }

    /// Pull one `\n`-terminated line, tolerating a bare LF and
    /// stripping the optional `\r`. `None` means the terminator has not
    /// arrived; a line longer than `limit` fails with `over`.
    fn take_line(
        &mut self,
        buf: &[u8],
        limit: usize,
        over: ErrorKind,
    ) -> Result<Option<Vec<u8>>, ErrorKind> {
        let window = &buf[self.pos..];
        match memchr(b'\n', window) {
            Some(nl) => {
                if nl > limit {
                    return Err(over);
                }
                let mut line = &window[..nl];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                let line = line.to_vec();
                self.pos += nl + 1;
                Ok(Some(line))
            }
            None => {
                if window.len() > limit {
                    return Err(over);
                }
                Ok(None)
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ErrorKind> {
        let first_sp = memchr(b' ', line).ok_or(ErrorKind::InvalidMethod)?;
        let method =
            Method::from_token(&line[..first_sp]).ok_or(ErrorKind::InvalidMethod)?;

        let rest = &line[first_sp + 1..];
        let second_sp = memchr(b' ', rest).ok_or(ErrorKind::InvalidTarget)?;
        let target = &rest[..second_sp];
        let version_token = &rest[second_sp + 1..];

        if target.is_empty() || !(target[0] == b'/' || target == b"*") {
            return Err(ErrorKind::InvalidTarget);
        }
        if target.len() > self.limits.max_target {
            return Err(ErrorKind::TargetTooLong);
        }
        if memchr(b' ', version_token).is_some() {
            return Err(ErrorKind::InvalidVersion);
        }

        let version = match Version::from_bytes(version_token) {
            Some(version) => version,
            None if version_token.starts_with(b"HTTP/") => {
                return Err(ErrorKind::UnsupportedVersion)
            }
            None => return Err(ErrorKind::InvalidVersion),
        };

        self.method = Some(method);
        self.target = target.to_vec();
        self.version = version;
        self.keep_alive = version.default_keep_alive();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ErrorKind> {
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        let raw_name = &line[..colon];
        if raw_name.is_empty()
            || raw_name
                .iter()
                .any(|b| *b == b' ' || *b == b'\t' || !b.is_ascii_graphic())
        {
            return Err(ErrorKind::InvalidHeader);
        }

        let name = types::lower_string(raw_name);
        let value = trim_ascii(&line[colon + 1..]).to_vec();
        self.headers.push(Header::new(name, value));
        Ok(())
    }

    /// Decide body framing once the header block ends.
    fn finish_headers(&mut self) -> Result<BodyMode, ErrorKind> {
        let chunked = self.headers.contains_token("transfer-encoding", "chunked");
        let content_length = self.headers.get("content-length").map(|v| v.to_vec());

        if chunked && content_length.is_some() {
            // Accepting both would let a smuggled body slip past any
            // intermediary that picked the other framing.
            return Err(ErrorKind::ConflictingBodyFraming);
        }

        if self.headers.contains_token("connection", "close") {
            self.keep_alive = false;
        } else if self.headers.contains_token("connection", "keep-alive") {
            self.keep_alive = true;
        }

        if let Some(expect) = self.headers.get("expect") {
            if expect.eq_ignore_ascii_case(b"100-continue") {
                self.expect_continue = true;
            }
        }

        if chunked {
            return Ok(BodyMode::Chunked(ChunkState::Size));
        }

        match content_length {
            Some(value) => {
                let mut lengths = self.headers.get_all("content-length");
                if !lengths.all(|v| v == value.as_slice()) {
                    return Err(ErrorKind::InvalidContentLength);
                }
                let length =
                    types::slice_to_usize(&value).ok_or(ErrorKind::InvalidContentLength)?;
                if length > self.limits.max_body {
                    return Err(ErrorKind::BodyTooLarge);
                }
                Ok(BodyMode::Length { remaining: length })
            }
            None => Ok(BodyMode::Length { remaining: 0 }),
        }
    }

    fn complete(&mut self) -> Parse {
        let request = H1Request {
            method: self.method.take().unwrap_or(Method::Get),
            target: std::mem::take(&mut self.target),
            version: self.version,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
            keep_alive: self.keep_alive,
        };
        let consumed = self.pos;
        self.reset();
        Parse::Done { request, consumed }
    }
}

/// Chunk-size line: hex digits, optionally followed by extensions after
/// `;` which are ignored.
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let digits = match memchr(b';', line) {
        Some(semi) => trim_ascii(&line[..semi]),
        None => trim_ascii(line),
    };
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }

    let mut size: usize = 0;
    for &byte in digits {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return None,
        };
        size = size.checked_mul(16)?.checked_add(digit as usize)?;
    }
    Some(size)
}
