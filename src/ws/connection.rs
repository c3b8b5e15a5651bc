//! WebSocket connections: upgrade handshake, message reassembly, close
//! handshake.
//!
//! A [`WebSocketConnection`] is handed to the registered handler after a
//! successful `101 Switching Protocols`. The handle is a cheap clone
//! over shared state; the driver keeps one so it can finish the closing
//! handshake once the handler returns.

use crate::{
    config::WsConfig,
    http::types::HeaderMap,
    ws::frame::{self, Opcode},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

/// RFC 6455 GUID appended to the client key for `Sec-WebSocket-Accept`.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) trait WsStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> WsStream for T {}

/// Compute `Sec-WebSocket-Accept` per RFC 6455 section 4.2.2.
pub(crate) fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Check an HTTP/1.1 request's headers for a well-formed WebSocket
/// upgrade; returns the client key on success.
pub(crate) fn upgrade_key(headers: &HeaderMap) -> Option<String> {
    if !headers.contains_token("upgrade", "websocket")
        || !headers.contains_token("connection", "upgrade")
    {
        return None;
    }
    match headers.get("sec-websocket-version") {
        Some(v) if v == b"13" => {}
        _ => return None,
    }

    let key = headers.get_str("sec-websocket-key")?.trim().to_string();
    // The key must be 16 bytes of base64.
    match BASE64.decode(&key) {
        Ok(raw) if raw.len() == 16 => Some(key),
        _ => None,
    }
}

/// The `101 Switching Protocols` response completing the handshake.
pub(crate) fn handshake_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         upgrade: websocket\r\n\
         connection: Upgrade\r\n\
         sec-websocket-accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

/// A complete, reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// WebSocket transport failure. Protocol violations have already been
/// answered with the appropriate Close frame by the time the error
/// surfaces.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("websocket i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket protocol violation, closed with {0}")]
    Protocol(u16),
    #[error("message exceeds the configured maximum")]
    MessageTooLarge,
}

/// A server-side WebSocket connection born from an HTTP/1.1 upgrade.
///
/// Clones share the same underlying connection; the handler may move
/// its clone freely while the driver keeps one for the closing
/// handshake.
#[derive(Clone)]
pub struct WebSocketConnection {
    inner: Arc<Mutex<Inner>>,
    closed: Arc<AtomicBool>,
    path: Arc<str>,
    headers: Arc<HeaderMap>,
    path_params: Arc<[(String, String)]>,
    close_grace: std::time::Duration,
}

struct Inner {
    stream: Box<dyn WsStream>,
    read_buf: Vec<u8>,
    config: WsConfig,
    fragment: Option<(Opcode, Vec<u8>)>,
    close_sent: bool,
    closed: Arc<AtomicBool>,
}

impl WebSocketConnection {
    pub(crate) fn new(
        stream: Box<dyn WsStream>,
        leftover: Vec<u8>,
        path: String,
        headers: HeaderMap,
        path_params: Vec<(String, String)>,
        config: WsConfig,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let close_grace = config.close_grace;
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stream,
                read_buf: leftover,
                config,
                fragment: None,
                close_sent: false,
                closed: closed.clone(),
            })),
            closed,
            path: path.into(),
            headers: Arc::new(headers),
            path_params: path_params.into(),
            close_grace,
        }
    }

    /// Path of the upgrade request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Headers of the upgrade request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Path parameter captured by the matched WebSocket route.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the close handshake has completed in either direction.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receive the next complete message. `Ok(None)` means the peer
    /// closed (cleanly or by dropping the socket). Pings are answered
    /// automatically and control frames may interleave between the
    /// fragments of a message.
    pub async fn recv(&self) -> Result<Option<Message>, WsError> {
        self.inner.lock().await.recv().await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.inner
            .lock()
            .await
            .send_frame(Opcode::Text, text.as_bytes())
            .await
    }

    pub async fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.inner.lock().await.send_frame(Opcode::Binary, data).await
    }

    pub async fn send(&self, message: &Message) -> Result<(), WsError> {
        match message {
            Message::Text(text) => self.send_text(text).await,
            Message::Binary(data) => self.send_binary(data).await,
        }
    }

    pub async fn ping(&self, data: &[u8]) -> Result<(), WsError> {
        self.inner.lock().await.send_frame(Opcode::Ping, data).await
    }

    /// Start the closing handshake with `code` and `reason`.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), WsError> {
        self.inner.lock().await.close(code, reason).await
    }

    /// Run the tail of the close handshake after the handler returns:
    /// make sure a Close was sent, then give the peer the configured
    /// grace period to finish before the TCP stream is dropped.
    pub(crate) async fn finish(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.close_sent {
            let _ = inner.close(1000, "").await;
        }

        if !inner.closed() {
            let _ = tokio::time::timeout(self.close_grace, async {
                while !inner.closed() {
                    if inner.recv().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
        let _ = inner.stream.shutdown().await;
    }
}

impl Inner {
    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    async fn recv(&mut self) -> Result<Option<Message>, WsError> {
        if self.closed() {
            return Ok(None);
        }

        loop {
            let decoded = frame::decode(&self.read_buf, self.config.max_message_size);
            let frame = match decoded {
                Ok(Some((frame, used))) => {
                    self.read_buf.drain(..used);
                    frame
                }
                Ok(None) => {
                    let n = self.stream.read_buf(&mut self.read_buf).await?;
                    if n == 0 {
                        self.set_closed();
                        return Ok(None);
                    }
                    continue;
                }
                Err(err) => {
                    let code = err.close_code();
                    self.fail(code).await;
                    return Err(WsError::Protocol(code));
                }
            };

            match frame.opcode {
                Opcode::Ping => {
                    self.send_frame(Opcode::Pong, &frame.payload).await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    self.answer_close(&frame.payload).await;
                    return Ok(None);
                }
                Opcode::Text | Opcode::Binary => {
                    if self.fragment.is_some() {
                        self.fail(1002).await;
                        return Err(WsError::Protocol(1002));
                    }
                    if frame.fin {
                        return self.deliver(frame.opcode, frame.payload).await;
                    }
                    self.fragment = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut assembled)) = self.fragment.take() else {
                        self.fail(1002).await;
                        return Err(WsError::Protocol(1002));
                    };
                    if assembled.len() + frame.payload.len() > self.config.max_message_size {
                        self.fail(1009).await;
                        return Err(WsError::MessageTooLarge);
                    }
                    assembled.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return self.deliver(opcode, assembled).await;
                    }
                    self.fragment = Some((opcode, assembled));
                }
            }
        }
    }

    /// Finish a data message; text is UTF-8 validated only here, on the
    /// complete payload.
    async fn deliver(
        &mut self,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<Option<Message>, WsError> {
        match opcode {
            Opcode::Text => match String::from_utf8(payload) {
                Ok(text) => Ok(Some(Message::Text(text))),
                Err(_) => {
                    self.fail(1007).await;
                    Err(WsError::Protocol(1007))
                }
            },
            _ => Ok(Some(Message::Binary(payload))),
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        if self.close_sent {
            return Ok(());
        }
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.close_sent = true;
        self.send_frame(Opcode::Close, &payload).await
    }

    async fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        let mut out = Vec::with_capacity(payload.len() + 10);
        frame::encode(true, opcode, payload, &mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Echo the peer's Close: same code when valid, 1000 otherwise.
    async fn answer_close(&mut self, payload: &[u8]) {
        if !self.close_sent {
            let code = match payload {
                [hi, lo, ..] => {
                    let code = u16::from_be_bytes([*hi, *lo]);
                    if close_code_valid(code) {
                        code
                    } else {
                        1000
                    }
                }
                _ => 1000,
            };
            let _ = self.close(code, "").await;
        }
        self.set_closed();
    }

    /// Protocol failure: send Close(code), stop talking.
    async fn fail(&mut self, code: u16) {
        let _ = self.close(code, "").await;
        self.set_closed();
    }
}

fn close_code_valid(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::frame::encode_masked;
    use tokio::io::duplex;

    const KEY: [u8; 4] = [9, 8, 7, 6];

    fn conn(stream: impl WsStream + 'static) -> WebSocketConnection {
        WebSocketConnection::new(
            Box::new(stream),
            Vec::new(),
            "/ws".to_string(),
            HeaderMap::default(),
            Vec::new(),
            WsConfig::default(),
        )
    }

    /// Parse unmasked server frames out of a raw byte stream.
    fn server_frames(mut raw: &[u8]) -> Vec<(bool, u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while raw.len() >= 2 {
            let fin = raw[0] & 0x80 != 0;
            let opcode = raw[0] & 0x0F;
            let (len, off) = match raw[1] & 0x7F {
                126 => (u16::from_be_bytes([raw[2], raw[3]]) as usize, 4),
                127 => (u64::from_be_bytes(raw[2..10].try_into().unwrap()) as usize, 10),
                n => (n as usize, 2),
            };
            frames.push((fin, opcode, raw[off..off + len].to_vec()));
            raw = &raw[off + len..];
        }
        frames
    }

    #[test]
    fn accept_key_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_validation() {
        let base = |name: &str, value: &[u8]| {
            let mut pairs = vec![
                ("upgrade".to_string(), b"websocket".to_vec()),
                ("connection".to_string(), b"keep-alive, Upgrade".to_vec()),
                ("sec-websocket-version".to_string(), b"13".to_vec()),
                (
                    "sec-websocket-key".to_string(),
                    b"dGhlIHNhbXBsZSBub25jZQ==".to_vec(),
                ),
            ];
            for pair in pairs.iter_mut() {
                if pair.0 == name {
                    pair.1 = value.to_vec();
                }
            }
            HeaderMap::from_pairs(pairs)
        };

        assert_eq!(
            upgrade_key(&base("", b"")).as_deref(),
            Some("dGhlIHNhbXBsZSBub25jZQ==")
        );

        #[rustfmt::skip]
        let broken: [(&str, &[u8]); 4] = [
            ("upgrade",               b"h2c"),
            ("connection",            b"close"),
            ("sec-websocket-version", b"8"),
            ("sec-websocket-key",     b"too-short"),
        ];
        for (name, value) in broken {
            assert!(
                upgrade_key(&base(name, value)).is_none(),
                "{name} should invalidate the upgrade"
            );
        }
    }

    #[test]
    fn handshake_response_shape() {
        let raw = handshake_response("dGhlIHNhbXBsZSBub25jZQ==");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn recv_and_echo() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let mut raw = Vec::new();
        encode_masked(true, Opcode::Text, b"ping", KEY, &mut raw);
        client.write_all(&raw).await.unwrap();

        let msg = ws.recv().await.unwrap().unwrap();
        assert_eq!(msg, Message::Text("ping".into()));

        ws.send(&msg).await.unwrap();
        let mut out = vec![0u8; 64];
        let n = client.read(&mut out).await.unwrap();
        assert_eq!(server_frames(&out[..n]), vec![(true, 0x1, b"ping".to_vec())]);
    }

    #[tokio::test]
    async fn fragmented_message_with_interleaved_ping() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let mut raw = Vec::new();
        encode_masked(false, Opcode::Text, b"hel", KEY, &mut raw);
        encode_masked(true, Opcode::Ping, b"beat", KEY, &mut raw);
        encode_masked(false, Opcode::Continuation, b"lo ", KEY, &mut raw);
        encode_masked(true, Opcode::Continuation, b"there", KEY, &mut raw);
        client.write_all(&raw).await.unwrap();

        let msg = ws.recv().await.unwrap().unwrap();
        assert_eq!(msg, Message::Text("hello there".into()));

        // The ping was answered with a pong mid-message.
        let mut out = vec![0u8; 64];
        let n = client.read(&mut out).await.unwrap();
        assert_eq!(server_frames(&out[..n]), vec![(true, 0xA, b"beat".to_vec())]);
    }

    #[tokio::test]
    async fn close_handshake_echoes_code() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");
        let mut raw = Vec::new();
        encode_masked(true, Opcode::Close, &payload, KEY, &mut raw);
        client.write_all(&raw).await.unwrap();

        assert_eq!(ws.recv().await.unwrap(), None);
        assert!(ws.is_closed());

        let mut out = vec![0u8; 64];
        let n = client.read(&mut out).await.unwrap();
        let frames = server_frames(&out[..n]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, 0x8);
        assert_eq!(&frames[0].2[..2], &1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn invalid_close_code_becomes_1000() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let payload = 999u16.to_be_bytes().to_vec();
        let mut raw = Vec::new();
        encode_masked(true, Opcode::Close, &payload, KEY, &mut raw);
        client.write_all(&raw).await.unwrap();

        assert_eq!(ws.recv().await.unwrap(), None);

        let mut out = vec![0u8; 64];
        let n = client.read(&mut out).await.unwrap();
        let frames = server_frames(&out[..n]);
        assert_eq!(&frames[0].2[..2], &1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn invalid_utf8_text_closes_1007() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let mut raw = Vec::new();
        encode_masked(true, Opcode::Text, &[0xFF, 0xFE, 0x41], KEY, &mut raw);
        client.write_all(&raw).await.unwrap();

        match ws.recv().await {
            Err(WsError::Protocol(1007)) => {}
            other => panic!("expected 1007, got {other:?}"),
        }

        let mut out = vec![0u8; 64];
        let n = client.read(&mut out).await.unwrap();
        let frames = server_frames(&out[..n]);
        assert_eq!(&frames[0].2[..2], &1007u16.to_be_bytes());
    }

    #[tokio::test]
    async fn unmasked_frame_closes_1002() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let mut raw = Vec::new();
        frame::encode(true, Opcode::Text, b"nope", &mut raw);
        client.write_all(&raw).await.unwrap();

        match ws.recv().await {
            Err(WsError::Protocol(1002)) => {}
            other => panic!("expected 1002, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn finish_sends_close_when_handler_did_not() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let driver_handle = ws.clone();
        drop(ws);
        // Peer answers the close immediately, so the grace wait ends.
        let peer = tokio::spawn(async move {
            let mut out = vec![0u8; 64];
            let n = client.read(&mut out).await.unwrap();
            let frames = server_frames(&out[..n]);
            assert_eq!(frames[0].1, 0x8, "driver-initiated close frame");

            let mut raw = Vec::new();
            encode_masked(true, Opcode::Close, &1000u16.to_be_bytes(), KEY, &mut raw);
            client.write_all(&raw).await.unwrap();
        });

        driver_handle.finish().await;
        assert!(driver_handle.is_closed());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn binary_round_trip() {
        let (server_io, mut client) = duplex(4096);
        let ws = conn(server_io);

        let payload = vec![0u8, 159, 146, 150];
        let mut raw = Vec::new();
        encode_masked(true, Opcode::Binary, &payload, KEY, &mut raw);
        client.write_all(&raw).await.unwrap();

        assert_eq!(ws.recv().await.unwrap(), Some(Message::Binary(payload)));
    }
}
