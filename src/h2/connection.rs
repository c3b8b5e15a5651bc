//! HTTP/2 connection driver: frame demultiplexer, stream lifecycle,
//! flow-controlled response writer.
//!
//! One task runs the frame loop; every completed request is dispatched
//! on its own task, so responses across streams interleave freely while
//! frames within a stream keep RFC 7540 order. A reader task feeds
//! frames over a channel so the loop can also react to finished
//! handlers and the shutdown signal.

use crate::{
    config::ServerConfig,
    dispatch::Dispatcher,
    h2::{
        frame::{self, ErrorCode, FrameHead, FrameType},
        hpack,
        stream::{StreamState, StreamTable, Window},
    },
    http::{
        query,
        request::Request,
        response::{imf_fixdate, Response},
        types::{HeaderMap, Method, Version},
    },
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

/// How an HTTP/2 connection came to be.
pub(crate) enum H2Entry {
    /// ALPN `h2` or prior knowledge; the client preface is still on
    /// the wire.
    Direct,
    /// `Upgrade: h2c`: the 101 response has been written, the decoded
    /// `HTTP2-Settings` payload and the upgraded request come along.
    /// That request is served as stream 1.
    Upgrade {
        settings_payload: Vec<u8>,
        request: Request,
    },
}

enum ReadEvent {
    Frame(FrameHead, Vec<u8>),
    Oversize,
}

/// Connection-fatal protocol error; the driver answers with GOAWAY.
struct ConnError(ErrorCode);

pub(crate) async fn serve<S>(
    mut stream: S,
    peer: Option<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    mut shutdown: broadcast::Receiver<()>,
    entry: H2Entry,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let upgrade = match entry {
        H2Entry::Direct => {
            let mut preface = [0u8; frame::PREFACE.len()];
            match stream.read_exact(&mut preface).await {
                Ok(_) if preface == *frame::PREFACE => None,
                _ => {
                    tracing::debug!(peer = ?peer, "bad http/2 preface");
                    return;
                }
            }
        }
        H2Entry::Upgrade {
            settings_payload,
            request,
        } => Some((settings_payload, request)),
    };

    let (read_half, write_half) = tokio::io::split(stream);

    let (frame_tx, frame_rx) = mpsc::channel::<ReadEvent>(32);
    let max_recv_frame = config.h2.max_frame_size as usize;
    let reader: JoinHandle<()> = tokio::spawn(async move {
        let mut rd = read_half;
        loop {
            let mut head_raw = [0u8; frame::FRAME_HEADER_LEN];
            if rd.read_exact(&mut head_raw).await.is_err() {
                break;
            }
            let head = FrameHead::parse(&head_raw);
            if head.length as usize > max_recv_frame {
                let _ = frame_tx.send(ReadEvent::Oversize).await;
                break;
            }
            let mut payload = vec![0u8; head.length as usize];
            if rd.read_exact(&mut payload).await.is_err() {
                break;
            }
            if frame_tx.send(ReadEvent::Frame(head, payload)).await.is_err() {
                break;
            }
        }
    });

    let (resp_tx, resp_rx) = mpsc::channel::<(u32, Response)>(32);

    let mut driver = Driver {
        write: write_half,
        out: Vec::with_capacity(config.write_buffer_size),
        encoder: hpack::Encoder::new(config.h2.header_table_size as usize),
        decoder: hpack::Decoder::new(
            config.h2.header_table_size as usize,
            config.h2.max_header_list_size.map(|v| v as usize),
        ),
        streams: StreamTable::new(config.h2.initial_window_size),
        conn_send: Window::new(65_535),
        conn_recv: Window::new(65_535),
        local_stream_window: config.h2.initial_window_size,
        max_send_frame: 16_384,
        peer_push_enabled: true,
        expect_continuation: None,
        tasks: Vec::new(),
        resp_tx,
        dispatcher,
        config,
        peer,
        draining: false,
        goaway_sent: false,
    };

    driver.send_local_settings();

    if let Some((settings_payload, request)) = upgrade {
        if let Ok(settings) = frame::parse_settings(&settings_payload) {
            driver.apply_remote_settings(&settings);
        }
        driver.begin_upgraded_stream(request);
    }

    let _ = driver.flush().await;
    driver.run(frame_rx, resp_rx, &mut shutdown).await;

    reader.abort();
    for (_, task) in driver.tasks.drain(..) {
        task.abort();
    }
}

struct Driver<S> {
    write: WriteHalf<S>,
    out: Vec<u8>,

    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
    streams: StreamTable,

    conn_send: Window,
    conn_recv: Window,
    /// Our advertised per-stream receive window.
    local_stream_window: u32,
    /// The peer's MAX_FRAME_SIZE; bounds our DATA and header blocks.
    max_send_frame: usize,
    peer_push_enabled: bool,

    /// Stream currently mid header block (awaiting CONTINUATION).
    expect_continuation: Option<u32>,
    tasks: Vec<(u32, JoinHandle<()>)>,
    resp_tx: mpsc::Sender<(u32, Response)>,

    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    peer: Option<SocketAddr>,
    draining: bool,
    goaway_sent: bool,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(
        &mut self,
        mut frame_rx: mpsc::Receiver<ReadEvent>,
        mut resp_rx: mpsc::Receiver<(u32, Response)>,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = frame_rx.recv() => match event {
                    Some(ReadEvent::Frame(head, payload)) => {
                        if let Err(ConnError(code)) = self.handle_frame(head, payload) {
                            self.goaway(code);
                            let _ = self.flush().await;
                            return;
                        }
                    }
                    Some(ReadEvent::Oversize) => {
                        self.goaway(ErrorCode::FrameSizeError);
                        let _ = self.flush().await;
                        return;
                    }
                    None => return,
                },
                Some((stream_id, response)) = resp_rx.recv() => {
                    self.on_response(stream_id, response);
                }
                _ = shutdown.recv(), if !self.draining => {
                    self.start_drain();
                }
            }

            if self.flush().await.is_err() {
                return;
            }
            if self.draining && self.streams.active_count() == 0 {
                return;
            }
        }
    }

    // Outbound plumbing

    fn send_local_settings(&mut self) {
        let h2 = &self.config.h2;
        let mut settings = vec![
            (frame::SETTINGS_HEADER_TABLE_SIZE, h2.header_table_size),
            (frame::SETTINGS_ENABLE_PUSH, u32::from(h2.enable_push)),
            (
                frame::SETTINGS_MAX_CONCURRENT_STREAMS,
                h2.max_concurrent_streams,
            ),
            (frame::SETTINGS_INITIAL_WINDOW_SIZE, h2.initial_window_size),
            (frame::SETTINGS_MAX_FRAME_SIZE, h2.max_frame_size),
        ];
        if let Some(max) = h2.max_header_list_size {
            settings.push((frame::SETTINGS_MAX_HEADER_LIST_SIZE, max));
        }

        let mut payload = Vec::with_capacity(settings.len() * 6);
        frame::encode_settings(&settings, &mut payload);
        frame::write_frame(FrameType::Settings, 0, 0, &payload, &mut self.out);
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let result = self.write.write_all(&self.out).await;
        self.out.clear();
        result
    }

    fn goaway(&mut self, code: ErrorCode) {
        if self.goaway_sent && code == ErrorCode::NoError {
            return;
        }
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.streams.highest_client.to_be_bytes());
        payload.extend_from_slice(&(code as u32).to_be_bytes());
        frame::write_frame(FrameType::Goaway, 0, 0, &payload, &mut self.out);
        self.goaway_sent = true;

        if code != ErrorCode::NoError {
            tracing::warn!(peer = ?self.peer, code = ?code, "http/2 connection error");
        }
    }

    fn start_drain(&mut self) {
        self.draining = true;
        self.goaway(ErrorCode::NoError);
    }

    fn rst_stream(&mut self, stream_id: u32, code: ErrorCode) {
        frame::write_frame(
            FrameType::RstStream,
            0,
            stream_id,
            &(code as u32).to_be_bytes(),
            &mut self.out,
        );
        self.abort_task(stream_id);
        self.streams.reap(stream_id);
    }

    fn abort_task(&mut self, stream_id: u32) {
        if let Some(pos) = self.tasks.iter().position(|(id, _)| *id == stream_id) {
            let (_, task) = self.tasks.swap_remove(pos);
            task.abort();
        }
    }

    // Inbound frames

    fn handle_frame(&mut self, head: FrameHead, payload: Vec<u8>) -> Result<(), ConnError> {
        // A header block must be contiguous: only CONTINUATION on the
        // same stream may follow until END_HEADERS.
        if let Some(expected) = self.expect_continuation {
            let ok = head.kind == FrameType::Continuation && head.stream_id == expected;
            if !ok {
                return Err(ConnError(ErrorCode::ProtocolError));
            }
        }

        match head.kind {
            FrameType::Settings => self.on_settings(&head, &payload),
            FrameType::Ping => self.on_ping(&head, &payload),
            FrameType::Headers => self.on_headers(&head, payload),
            FrameType::Continuation => self.on_continuation(&head, payload),
            FrameType::Data => self.on_data(&head, &payload),
            FrameType::WindowUpdate => self.on_window_update(&head, &payload),
            FrameType::RstStream => self.on_rst(&head, &payload),
            FrameType::Goaway => {
                // Finish in-flight work, accept nothing new.
                self.draining = true;
                Ok(())
            }
            FrameType::Priority => {
                // Priority is only a hint; nothing is recorded.
                Ok(())
            }
            FrameType::PushPromise => Err(ConnError(ErrorCode::ProtocolError)),
            FrameType::Unknown(_) => Ok(()),
        }
    }

    fn on_settings(&mut self, head: &FrameHead, payload: &[u8]) -> Result<(), ConnError> {
        if head.stream_id != 0 {
            return Err(ConnError(ErrorCode::ProtocolError));
        }
        if head.has(frame::FLAG_ACK) {
            if !payload.is_empty() {
                return Err(ConnError(ErrorCode::FrameSizeError));
            }
            return Ok(());
        }

        let settings = frame::parse_settings(payload).map_err(ConnError)?;
        self.apply_remote_settings(&settings);
        frame::write_frame(FrameType::Settings, frame::FLAG_ACK, 0, &[], &mut self.out);
        self.flush_all_streams();
        Ok(())
    }

    fn apply_remote_settings(&mut self, settings: &[(u16, u32)]) {
        for &(id, value) in settings {
            match id {
                frame::SETTINGS_HEADER_TABLE_SIZE => {
                    // The encoder table never grows past our own bound.
                    let capped =
                        (value as usize).min(self.config.h2.header_table_size as usize);
                    self.encoder.set_table_size(capped);
                }
                frame::SETTINGS_ENABLE_PUSH => self.peer_push_enabled = value == 1,
                frame::SETTINGS_INITIAL_WINDOW_SIZE => {
                    self.streams.adjust_send_windows(value);
                }
                frame::SETTINGS_MAX_FRAME_SIZE => self.max_send_frame = value as usize,
                _ => {}
            }
        }
    }

    fn on_ping(&mut self, head: &FrameHead, payload: &[u8]) -> Result<(), ConnError> {
        if head.stream_id != 0 {
            return Err(ConnError(ErrorCode::ProtocolError));
        }
        if payload.len() != 8 {
            return Err(ConnError(ErrorCode::FrameSizeError));
        }
        if !head.has(frame::FLAG_ACK) {
            frame::write_frame(FrameType::Ping, frame::FLAG_ACK, 0, payload, &mut self.out);
        }
        Ok(())
    }

    fn on_headers(&mut self, head: &FrameHead, payload: Vec<u8>) -> Result<(), ConnError> {
        if head.stream_id == 0 || head.stream_id % 2 == 0 {
            return Err(ConnError(ErrorCode::ProtocolError));
        }

        let stripped = frame::strip_padding(&payload, head.flags).map_err(ConnError)?;
        let block = frame::strip_priority(stripped, head.flags).map_err(ConnError)?;

        let end_stream = head.has(frame::FLAG_END_STREAM);
        let id = head.stream_id;

        if self.streams.get_mut(id).is_none() {
            if self.streams.is_reaped(id) {
                return Err(ConnError(ErrorCode::ProtocolError));
            }
            match self.streams.open(id, self.config.h2.max_concurrent_streams) {
                Ok(_) => {}
                Err(ErrorCode::RefusedStream) => {
                    // The header block still has to run through the
                    // decoder to keep HPACK state aligned, so the
                    // stream is opened and refused after END_HEADERS.
                    self.streams.open_refused(id);
                }
                Err(code) => return Err(ConnError(code)),
            }
            if self.draining {
                // New work after GOAWAY is refused, not served.
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.refused = true;
                }
            }
        }

        let stream = self.streams.get_mut(id).expect("stream just ensured");
        if !stream.may_receive_data() {
            // HEADERS after the peer already ended its side.
            self.rst_stream(id, ErrorCode::StreamClosed);
            return Ok(());
        }
        stream.header_block.extend_from_slice(block);
        stream.remote_end_after_headers = end_stream;

        if head.has(frame::FLAG_END_HEADERS) {
            self.finish_header_block(id)
        } else {
            self.expect_continuation = Some(id);
            Ok(())
        }
    }

    fn on_continuation(&mut self, head: &FrameHead, payload: Vec<u8>) -> Result<(), ConnError> {
        if self.expect_continuation != Some(head.stream_id) {
            return Err(ConnError(ErrorCode::ProtocolError));
        }
        let id = head.stream_id;
        let max_block = self.config.limits.max_header_block;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(ConnError(ErrorCode::ProtocolError))?;

        stream.header_block.extend_from_slice(&payload);
        if stream.header_block.len() > max_block {
            return Err(ConnError(ErrorCode::EnhanceYourCalm));
        }

        if head.has(frame::FLAG_END_HEADERS) {
            self.expect_continuation = None;
            self.finish_header_block(id)
        } else {
            Ok(())
        }
    }

    fn finish_header_block(&mut self, id: u32) -> Result<(), ConnError> {
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(ConnError(ErrorCode::ProtocolError))?;
        let block = std::mem::take(&mut stream.header_block);

        let decoded = self
            .decoder
            .decode(&block)
            .map_err(|_| ConnError(ErrorCode::CompressionError))?;

        let stream = self.streams.get_mut(id).expect("stream exists");
        if !stream.headers_done {
            stream.headers = decoded;
            stream.headers_done = true;
        }
        // A trailing header block is decoded for HPACK state and
        // otherwise discarded.

        let refused = stream.refused;
        let ended = stream.remote_end_after_headers;
        if refused {
            self.rst_stream(id, ErrorCode::RefusedStream);
            return Ok(());
        }

        if ended {
            let stream = self.streams.get_mut(id).expect("stream exists");
            stream.remote_closed();
            self.dispatch_stream(id)?;
        }
        Ok(())
    }

    fn on_data(&mut self, head: &FrameHead, payload: &[u8]) -> Result<(), ConnError> {
        if head.stream_id == 0 {
            return Err(ConnError(ErrorCode::ProtocolError));
        }

        // Flow control counts the whole frame, padding included, and
        // applies even when the stream is already gone.
        self.conn_recv.narrow(payload.len());
        if self.conn_recv.0 < 0 {
            return Err(ConnError(ErrorCode::FlowControlError));
        }
        self.replenish_connection_window();

        let id = head.stream_id;
        if self.streams.get_mut(id).is_none() {
            if self.streams.is_reaped(id) {
                self.rst_stream(id, ErrorCode::StreamClosed);
                return Ok(());
            }
            return Err(ConnError(ErrorCode::ProtocolError));
        }

        let data = frame::strip_padding(payload, head.flags).map_err(ConnError)?;
        let max_body = self.config.limits.max_body;
        let local_window = self.local_stream_window;

        let stream = self.streams.get_mut(id).expect("checked above");
        if !stream.may_receive_data() {
            self.rst_stream(id, ErrorCode::StreamClosed);
            return Ok(());
        }

        stream.recv_window.narrow(payload.len());
        if stream.recv_window.0 < 0 {
            self.rst_stream(id, ErrorCode::FlowControlError);
            return Ok(());
        }

        if stream.body.len() + data.len() > max_body {
            self.rst_stream(id, ErrorCode::Cancel);
            return Ok(());
        }
        stream.body.extend_from_slice(data);

        // Top the stream window back up once half the credit is spent.
        if stream.recv_window.available() < (local_window / 2) as usize {
            let increment = local_window as usize - stream.recv_window.available();
            let _ = stream.recv_window.widen(increment as u32);
            frame::write_frame(
                FrameType::WindowUpdate,
                0,
                id,
                &(increment as u32).to_be_bytes(),
                &mut self.out,
            );
        }

        if head.has(frame::FLAG_END_STREAM) {
            let stream = self.streams.get_mut(id).expect("checked above");
            stream.remote_closed();
            self.dispatch_stream(id)?;
        }
        Ok(())
    }

    fn replenish_connection_window(&mut self) {
        if self.conn_recv.available() < 65_535 / 2 {
            let increment = 65_535 - self.conn_recv.available();
            let _ = self.conn_recv.widen(increment as u32);
            frame::write_frame(
                FrameType::WindowUpdate,
                0,
                0,
                &(increment as u32).to_be_bytes(),
                &mut self.out,
            );
        }
    }

    fn on_window_update(&mut self, head: &FrameHead, payload: &[u8]) -> Result<(), ConnError> {
        if payload.len() != 4 {
            return Err(ConnError(ErrorCode::FrameSizeError));
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;

        if head.stream_id == 0 {
            if increment == 0 {
                return Err(ConnError(ErrorCode::ProtocolError));
            }
            self.conn_send.widen(increment).map_err(ConnError)?;
            self.flush_all_streams();
        } else if let Some(stream) = self.streams.get_mut(head.stream_id) {
            if increment == 0 {
                self.rst_stream(head.stream_id, ErrorCode::ProtocolError);
                return Ok(());
            }
            if stream.send_window.widen(increment).is_err() {
                self.rst_stream(head.stream_id, ErrorCode::FlowControlError);
                return Ok(());
            }
            self.flush_stream(head.stream_id);
        }
        Ok(())
    }

    fn on_rst(&mut self, head: &FrameHead, payload: &[u8]) -> Result<(), ConnError> {
        if head.stream_id == 0 {
            return Err(ConnError(ErrorCode::ProtocolError));
        }
        if payload.len() != 4 {
            return Err(ConnError(ErrorCode::FrameSizeError));
        }
        // The peer gave up on this stream: cancel its handler task.
        self.abort_task(head.stream_id);
        self.streams.reap(head.stream_id);
        Ok(())
    }

    // Requests and responses

    fn begin_upgraded_stream(&mut self, request: Request) {
        self.streams.open_upgraded();
        self.spawn_handler(1, request);
    }

    fn dispatch_stream(&mut self, id: u32) -> Result<(), ConnError> {
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(ConnError(ErrorCode::ProtocolError))?;
        let headers = std::mem::take(&mut stream.headers);
        let body = std::mem::take(&mut stream.body);

        let request = match assemble_request(headers, body, self.peer) {
            Some((request, authority)) => {
                stream.authority = authority;
                request
            }
            None => {
                self.rst_stream(id, ErrorCode::ProtocolError);
                return Ok(());
            }
        };

        self.spawn_handler(id, request);
        Ok(())
    }

    fn spawn_handler(&mut self, id: u32, request: Request) {
        let dispatcher = self.dispatcher.clone();
        let tx = self.resp_tx.clone();
        let task = tokio::spawn(async move {
            let response = dispatcher.dispatch(request).await;
            let _ = tx.send((id, response)).await;
        });
        self.tasks.push((id, task));
    }

    fn on_response(&mut self, id: u32, mut response: Response) {
        self.abort_task(id);
        let Some(stream) = self.streams.get_mut(id) else {
            // Reset while the handler ran; the response is dropped.
            return;
        };
        if stream.response_started {
            return;
        }
        stream.response_started = true;

        // PUSH_PROMISE frames go out before the parent's HEADERS.
        let promises = std::mem::take(response.push_promises_mut());
        let authority = stream.authority.clone();
        if !promises.is_empty()
            && self.peer_push_enabled
            && self.config.h2.enable_push
            && !self.draining
        {
            for (path, kind) in &promises {
                self.emit_push_promise(id, path, kind, &authority);
            }
        }

        let body = response.take_body();
        let header_list = response_header_list(&response, self.config.server_header.as_deref());
        let block = self.encoder.encode(&header_list);

        let end_stream = body.is_empty();
        self.write_header_block(id, &block, end_stream);

        let stream = self.streams.get_mut(id).expect("stream exists");
        if stream.state == StreamState::ReservedLocal {
            stream.state = StreamState::HalfClosedRemote;
        }
        if end_stream {
            stream.local_closed();
            if stream.state == StreamState::Closed {
                self.streams.reap(id);
            }
            return;
        }

        let stream = self.streams.get_mut(id).expect("stream exists");
        stream.pending_data = body;
        stream.end_queued = true;
        self.flush_stream(id);
    }

    fn emit_push_promise(
        &mut self,
        parent: u32,
        path: &str,
        kind: &crate::http::response::PushKind,
        authority: &str,
    ) {
        let promised = self.streams.reserve_push();

        let pseudo = vec![
            (":method".to_string(), "GET".to_string()),
            (":path".to_string(), path.to_string()),
            (":scheme".to_string(), "https".to_string()),
            (":authority".to_string(), authority.to_string()),
        ];
        let block = self.encoder.encode(&pseudo);

        let mut payload = Vec::with_capacity(4 + block.len());
        payload.extend_from_slice(&promised.to_be_bytes());
        payload.extend_from_slice(&block);
        frame::write_frame(
            FrameType::PushPromise,
            frame::FLAG_END_HEADERS,
            parent,
            &payload,
            &mut self.out,
        );

        // The pushed resource is a synthetic request through the
        // normal router.
        let headers = HeaderMap::from_pairs(vec![
            ("accept".to_string(), kind.accept_hint().as_bytes().to_vec()),
        ]);
        let (raw_path, raw_query) = split_target(path);
        let request = Request::new(
            Method::Get,
            raw_path,
            raw_query,
            headers,
            Vec::new(),
            Version::H2,
            self.peer,
        );
        self.spawn_handler(promised, request);
    }

    fn write_header_block(&mut self, id: u32, block: &[u8], end_stream: bool) {
        let end_flag = if end_stream { frame::FLAG_END_STREAM } else { 0 };

        if block.len() <= self.max_send_frame {
            frame::write_frame(
                FrameType::Headers,
                frame::FLAG_END_HEADERS | end_flag,
                id,
                block,
                &mut self.out,
            );
            return;
        }

        // Oversized header block: HEADERS + CONTINUATION chain, with
        // END_HEADERS only on the final fragment.
        let mut chunks = block.chunks(self.max_send_frame).peekable();
        let first = chunks.next().unwrap();
        frame::write_frame(FrameType::Headers, end_flag, id, first, &mut self.out);
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                frame::FLAG_END_HEADERS
            } else {
                0
            };
            frame::write_frame(FrameType::Continuation, flags, id, chunk, &mut self.out);
        }
    }

    fn flush_all_streams(&mut self) {
        for id in self.streams.ids() {
            self.flush_stream(id);
        }
    }

    /// Write as much queued DATA as the windows and frame size allow;
    /// END_STREAM rides the frame that empties the queue.
    fn flush_stream(&mut self, id: u32) {
        loop {
            let conn_available = self.conn_send.available();
            let max_frame = self.max_send_frame;

            let Some(stream) = self.streams.get_mut(id) else {
                return;
            };
            if stream.pending_data.is_empty() {
                return;
            }

            let allowed = stream
                .pending_data
                .len()
                .min(conn_available)
                .min(stream.send_window.available())
                .min(max_frame);
            if allowed == 0 {
                // Blocked on flow control; a WINDOW_UPDATE resumes us.
                return;
            }

            let chunk: Vec<u8> = stream.pending_data.drain(..allowed).collect();
            let last = stream.pending_data.is_empty() && stream.end_queued;

            stream.send_window.narrow(chunk.len());
            self.conn_send.narrow(chunk.len());

            let flags = if last { frame::FLAG_END_STREAM } else { 0 };
            frame::write_frame(FrameType::Data, flags, id, &chunk, &mut self.out);

            if last {
                let stream = self.streams.get_mut(id).expect("stream exists");
                stream.local_closed();
                if stream.state == StreamState::Closed {
                    self.streams.reap(id);
                }
                return;
            }
        }
    }
}

/// Turn decoded pseudo + regular headers and a body into a [`Request`].
/// Returns the `:authority` alongside for push synthesis. `None` means
/// the request is malformed.
fn assemble_request(
    decoded: Vec<(String, String)>,
    body: Vec<u8>,
    peer: Option<SocketAddr>,
) -> Option<(Request, String)> {
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut authority = String::new();
    let mut regular: Vec<(String, Vec<u8>)> = Vec::new();
    let mut saw_regular = false;

    for (name, value) in decoded {
        if let Some(pseudo) = name.strip_prefix(':') {
            // Pseudo-headers come strictly before regular fields.
            if saw_regular {
                return None;
            }
            match pseudo {
                "method" if method.is_none() => method = Method::from_name(&value),
                "path" if path.is_none() && !value.is_empty() => path = Some(value),
                "scheme" if scheme.is_none() => scheme = Some(value),
                "authority" if authority.is_empty() => authority = value,
                _ => return None,
            }
        } else {
            saw_regular = true;
            // Field names arrive lowercased by a conforming encoder;
            // an uppercase name is malformed (RFC 7540 section 8.1.2).
            if name.chars().any(|c| c.is_ascii_uppercase()) {
                return None;
            }
            regular.push((name, value.into_bytes()));
        }
    }

    let method = method?;
    let target = path?;
    scheme?;

    let (raw_path, query) = split_target(&target);
    let request = Request::new(
        method,
        raw_path,
        query,
        HeaderMap::from_pairs(regular),
        body,
        Version::H2,
        peer,
    );
    Some((request, authority))
}

/// Split a request target into its raw path and parsed query pairs.
fn split_target(target: &str) -> (String, Vec<(String, String)>) {
    match target.split_once('?') {
        Some((path, query)) => (
            path.to_string(),
            query::parse(query.as_bytes(), usize::MAX).unwrap_or_default(),
        ),
        None => (target.to_string(), Vec::new()),
    }
}

/// The response's header list for HPACK: `:status` first, then `date`
/// and `server` (when absent), then the handler's headers minus the
/// connection-specific ones HTTP/2 forbids.
fn response_header_list(
    response: &Response,
    server_header: Option<&str>,
) -> Vec<(String, String)> {
    let mut list = vec![(":status".to_string(), response.status().to_string())];

    let mut saw_date = false;
    let mut saw_server = false;
    let mut user = Vec::new();
    for (name, value) in response.headers() {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "content-length"
        ) {
            continue;
        }
        saw_date |= lower == "date";
        saw_server |= lower == "server";
        user.push((lower, String::from_utf8_lossy(value).into_owned()));
    }

    if !saw_date {
        list.push((
            "date".to_string(),
            imf_fixdate(std::time::SystemTime::now()),
        ));
    }
    if let (false, Some(server)) = (saw_server, server_header) {
        list.push(("server".to_string(), server.to_string()));
    }
    list.extend(user);
    list
}
