use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{HandshakeInfo, Options};
use crate::connection::keepalive::KeepAlive;
use crate::connection::sink::FrameSink;
use crate::connection::{ConnectionState, Role};
use crate::error::{Error, Result};
use crate::events;
use crate::extensions;
use crate::message::{CloseCode, MessageKind};
use crate::protocol::frame::MAX_HEADER_LEN;
use crate::protocol::{self, OpCode, MAX_CONTROL_FRAME_PAYLOAD};

/// Bound on the best-effort close frame emitted after a receive failure.
const AUTO_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on the close frame emitted by [`Connection::shutdown`].
const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of one successful [`Connection::receive`] call.
///
/// The payload bytes are in the caller's buffer at offset 0 for
/// [`count`](Received::count) bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Payload bytes written into the caller's buffer.
    pub count: usize,
    /// What arrived: a text fragment, a binary fragment, or the peer's
    /// close frame. Continuation frames report the kind that started the
    /// message.
    pub kind: MessageKind,
    /// FIN bit of the frame; true when this completes a message. Always
    /// true for close frames.
    pub end_of_message: bool,
    /// Decoded close status, set only when `kind` is Close.
    pub close_status: Option<CloseCode>,
    /// Decoded close reason, set only when `kind` is Close.
    pub close_reason: Option<String>,
}

struct Lifecycle {
    state: ConnectionState,
    close_status: Option<CloseCode>,
    close_reason: Option<String>,
}

struct Shared<T> {
    id: Uuid,
    role: Role,
    options: Options,
    info: HandshakeInfo,
    created_at: SystemTime,
    deflate: bool,
    reader: tokio::sync::Mutex<ReadHalf<T>>,
    sink: FrameSink,
    lifecycle: Mutex<Lifecycle>,
    /// Opcode (Text/Binary) that started the in-progress inbound
    /// fragmented message. Binary until a fragmented message starts.
    continuation_kind: AtomicU8,
    /// Whether the next outbound data frame continues a fragmented message.
    sending_continuation: AtomicBool,
    /// Cancelled on every transition into a terminal state; wakes the
    /// receive path and the keep-alive task.
    cancel: CancellationToken,
    keepalive: KeepAlive,
    disposed: AtomicBool,
}

impl<T> Shared<T> {
    fn state(&self) -> ConnectionState {
        self.lifecycle.lock().unwrap().state
    }
}

impl<T> Shared<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Encode one frame into a scratch buffer and hand it to the write
    /// serializer. Clients get a fresh mask per frame.
    async fn emit_frame(
        &self,
        opcode: OpCode,
        payload: &[u8],
        fin: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let mask = self.role.must_mask().then(protocol::make_mask);
        let mut scratch = BytesMut::with_capacity(MAX_HEADER_LEN + payload.len());
        protocol::write_frame(&mut scratch, opcode, payload, fin, mask)?;
        events::sending_frame(self.id, opcode, fin, payload.len());
        match cancel {
            Some(cancel) => self.sink.send_cancellable(scratch.freeze(), cancel).await,
            None => self.sink.send(scratch.freeze()).await,
        }
    }

    async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::ControlFrameTooLarge(payload.len()));
        }
        self.emit_frame(OpCode::Pong, payload, true, None).await
    }
}

/// One endpoint of a WebSocket connection over an already-established byte
/// stream.
///
/// The HTTP upgrade handshake, TLS, and socket acquisition are the host's
/// job; `Connection` takes over once bytes flow. It owns the framing codec,
/// the lifecycle state machine, serialized writes, keep-alive pings, and
/// the close handshake.
///
/// One task drives [`receive`](Self::receive); any number of tasks may
/// send, ping, or close concurrently without interleaving frames on the
/// wire.
///
/// ## Example
///
/// ```rust,ignore
/// use wscore::{Connection, MessageKind, Options, Role};
///
/// let conn = Connection::new(stream, Role::Server, Options::default());
/// let mut buf = conn.options().receive_buffer();
/// let cancel = tokio_util::sync::CancellationToken::new();
///
/// loop {
///     let received = conn.receive(&mut buf, &cancel).await?;
///     match received.kind {
///         MessageKind::Close => break,
///         _ => conn.send(&buf[..received.count], received.kind, true, &cancel).await?,
///     }
/// }
/// ```
pub struct Connection<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a connection over `io` with default handshake details.
    pub fn new(io: T, role: Role, options: Options) -> Self {
        Self::with_handshake(io, role, options, HandshakeInfo::default())
    }

    /// Create a connection over `io` with the details the upgrade
    /// handshake negotiated.
    ///
    /// Must be called within a tokio runtime; the connection spawns its
    /// transport writer and, when the keep-alive interval is non-zero, a
    /// ping task.
    pub fn with_handshake(io: T, role: Role, options: Options, info: HandshakeInfo) -> Self {
        let id = Uuid::new_v4();

        let deflate = match info.extensions.as_deref() {
            Some(ext) if extensions::negotiates_deflate(ext) => {
                events::use_per_message_deflate(id, ext);
                true
            }
            _ => {
                events::no_message_compression(id);
                false
            }
        };

        let (read_half, write_half) = tokio::io::split(io);
        let shared = Arc::new(Shared {
            id,
            role,
            options,
            info,
            created_at: SystemTime::now(),
            deflate,
            reader: tokio::sync::Mutex::new(read_half),
            sink: FrameSink::spawn(write_half),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Open,
                close_status: None,
                close_reason: None,
            }),
            continuation_kind: AtomicU8::new(OpCode::Binary.as_u8()),
            sending_continuation: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            keepalive: KeepAlive::new(),
            disposed: AtomicBool::new(false),
        });

        if shared.options.keep_alive_interval.is_zero() {
            events::keep_alive_interval_zero(id);
        } else {
            spawn_keep_alive(shared.clone());
        }

        Self { shared }
    }

    /// Read frames until one produces a result for the caller.
    ///
    /// Data frames return immediately with the payload in `buf[..count]`.
    /// Pings are answered with a pong and pongs are forwarded to the
    /// [`on_pong`](Self::on_pong) observer; neither surfaces here, the
    /// loop keeps reading. A close frame completes or answers the close
    /// handshake and returns a [`MessageKind::Close`] result.
    ///
    /// Any failure that may have corrupted the inbound stream moves the
    /// connection to a terminal state (emitting a best-effort close frame,
    /// bounded to 3 seconds) before the error is returned. Cancellation,
    /// whether from `cancel` or from the connection shutting down, surfaces
    /// as [`Error::Cancelled`] after the same best-effort close.
    pub async fn receive(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<Received> {
        let shared = &self.shared;
        let state = shared.state();
        if !state.can_receive() {
            return Err(Error::InvalidState(state));
        }

        loop {
            let read_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = shared.cancel.cancelled() => Err(Error::Cancelled),
                result = async {
                    let mut reader = shared.reader.lock().await;
                    protocol::read_frame(&mut *reader, buf).await
                } => result,
            };

            let frame = match read_result {
                Ok(frame) => frame,
                Err(err) => {
                    self.close_on_receive_failure(&err).await;
                    return Err(err);
                }
            };
            events::received_frame(shared.id, frame.opcode, frame.fin, frame.len);

            match frame.opcode {
                OpCode::Text | OpCode::Binary => {
                    if !frame.fin {
                        shared
                            .continuation_kind
                            .store(frame.opcode.as_u8(), Ordering::Relaxed);
                    }
                    let kind = if frame.opcode == OpCode::Text {
                        MessageKind::Text
                    } else {
                        MessageKind::Binary
                    };
                    return Ok(Received {
                        count: frame.len,
                        kind,
                        end_of_message: frame.fin,
                        close_status: None,
                        close_reason: None,
                    });
                }
                OpCode::Continuation => {
                    let started_as = shared.continuation_kind.load(Ordering::Relaxed);
                    let kind = if started_as == OpCode::Text.as_u8() {
                        MessageKind::Text
                    } else {
                        MessageKind::Binary
                    };
                    return Ok(Received {
                        count: frame.len,
                        kind,
                        end_of_message: frame.fin,
                        close_status: None,
                        close_reason: None,
                    });
                }
                OpCode::Ping => {
                    if shared.state() == ConnectionState::Open {
                        if let Err(err) = shared.send_pong(&buf[..frame.len]).await {
                            self.close_on_receive_failure(&err).await;
                            return Err(err);
                        }
                    }
                }
                OpCode::Pong => {
                    shared.keepalive.pong_received(&buf[..frame.len]);
                }
                OpCode::Close => {
                    let (code, reason) = protocol::decode_close(&buf[..frame.len]);
                    self.respond_to_close_frame(code, &reason, &buf[..frame.len])
                        .await;
                    return Ok(Received {
                        count: frame.len,
                        kind: MessageKind::Close,
                        end_of_message: true,
                        close_status: Some(code),
                        close_reason: Some(reason),
                    });
                }
            }
        }
    }

    /// Send one data frame.
    ///
    /// While a fragmented message is in progress (`end_of_message` was
    /// false on the previous send), the frame goes out as a continuation
    /// regardless of `kind`. [`MessageKind::Close`] is rejected; use
    /// [`close`](Self::close).
    pub async fn send(
        &self,
        buf: &[u8],
        kind: MessageKind,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let shared = &self.shared;
        let state = shared.state();
        if !state.can_send() {
            return Err(Error::InvalidState(state));
        }

        let opcode = match kind {
            MessageKind::Close => {
                return Err(Error::ProtocolViolation(
                    "close frames are sent via close(), not send()".into(),
                ));
            }
            _ if shared.sending_continuation.load(Ordering::Acquire) => OpCode::Continuation,
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        };

        shared
            .emit_frame(opcode, buf, end_of_message, Some(cancel))
            .await?;
        shared
            .sending_continuation
            .store(!end_of_message, Ordering::Release);
        Ok(())
    }

    /// Send a ping with an application payload of at most 125 bytes.
    pub async fn send_ping(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        if payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::ControlFrameTooLarge(payload.len()));
        }
        let state = self.shared.state();
        if state != ConnectionState::Open {
            return Err(Error::InvalidState(state));
        }
        self.shared
            .emit_frame(OpCode::Ping, payload, true, Some(cancel))
            .await
    }

    /// Start the close handshake.
    ///
    /// Sends a close frame and moves to `CloseSent`; the handshake
    /// completes when [`receive`](Self::receive) observes the peer's close
    /// reply. Requested in any other state, this logs and does nothing.
    pub async fn close(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let shared = &self.shared;
        {
            let mut lifecycle = shared.lifecycle.lock().unwrap();
            if lifecycle.state != ConnectionState::Open {
                events::invalid_state_before_close(shared.id, lifecycle.state);
                return Ok(());
            }
            // Claim the transition before the write so racing closers
            // cannot both emit a close frame.
            lifecycle.state = ConnectionState::CloseSent;
        }
        events::close_handshake_started(shared.id, code, reason);
        let payload = protocol::encode_close(code, reason);
        shared
            .emit_frame(OpCode::Close, &payload, true, Some(cancel))
            .await
    }

    /// Close the output side without waiting for the peer's reply.
    ///
    /// The state moves to `Closed` before the close frame is written, so a
    /// write failure cannot leave the lifecycle inconsistent; inbound
    /// reading is cancelled afterwards.
    pub async fn close_output(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.close_output_with(code, reason, Some(cancel)).await
    }

    async fn close_output_with(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let shared = &self.shared;
        let emit = {
            let mut lifecycle = shared.lifecycle.lock().unwrap();
            match lifecycle.state {
                ConnectionState::Open => {
                    lifecycle.state = ConnectionState::Closed;
                    true
                }
                ConnectionState::CloseSent | ConnectionState::CloseReceived => {
                    // A close frame is already on its way out; just finish.
                    lifecycle.state = ConnectionState::Closed;
                    false
                }
                terminal => {
                    events::invalid_state_before_close_output(shared.id, terminal);
                    return Ok(());
                }
            }
        };

        if emit {
            events::close_output_no_handshake(shared.id, code);
            let payload = protocol::encode_close(code, reason);
            let result = shared.emit_frame(OpCode::Close, &payload, true, cancel).await;
            shared.cancel.cancel();
            result
        } else {
            shared.cancel.cancel();
            Ok(())
        }
    }

    /// Tear the connection down immediately: no close frame, state
    /// `Aborted`, inbound reading cancelled.
    pub fn abort(&self) {
        let shared = &self.shared;
        {
            let mut lifecycle = shared.lifecycle.lock().unwrap();
            if !lifecycle.state.is_terminal() {
                lifecycle.state = ConnectionState::Aborted;
            }
        }
        shared.cancel.cancel();
    }

    /// Release the connection's resources. Idempotent.
    ///
    /// If the connection is still open, a close frame is emitted with a
    /// 5-second bound, then inbound reading is cancelled and the transport
    /// is shut down. Dropping the connection does the same minus the close
    /// frame.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = shared.state();
        events::dispose(shared.id, state);

        if state == ConnectionState::Open {
            let closing =
                self.close_output_with(CloseCode::EndpointUnavailable, "", None);
            match tokio::time::timeout(SHUTDOWN_CLOSE_TIMEOUT, closing).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => events::dispose_error(shared.id, &err),
                Err(_) => events::dispose_close_timeout(shared.id),
            }
        }

        shared.cancel.cancel();
        shared.sink.shutdown();
    }

    /// Best-effort close after a receive-path failure, bounded to 3
    /// seconds. Secondary failures are logged and never replace the
    /// primary cause.
    async fn close_on_receive_failure(&self, cause: &Error) {
        let shared = &self.shared;
        events::close_output_auto_timeout(shared.id, cause);

        let reason = if shared.options.include_error_in_close_reason {
            format!("\n\n{cause}")
        } else {
            String::new()
        };

        let closing = self.close_output_with(cause.close_code(), &reason, None);
        match tokio::time::timeout(AUTO_CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => events::close_output_auto_timeout_error(shared.id, &err),
            Err(_) => events::close_output_auto_timeout_cancelled(shared.id),
        }
    }

    /// Handle the peer's close frame per the close handshake.
    async fn respond_to_close_frame(&self, code: CloseCode, reason: &str, raw_payload: &[u8]) {
        enum Action {
            Complete,
            Echo,
            Ignore,
        }

        let shared = &self.shared;
        let action = {
            let mut lifecycle = shared.lifecycle.lock().unwrap();
            match lifecycle.state {
                ConnectionState::CloseSent => {
                    lifecycle.close_status = Some(code);
                    lifecycle.close_reason = Some(reason.to_owned());
                    lifecycle.state = ConnectionState::Closed;
                    Action::Complete
                }
                ConnectionState::Open => {
                    lifecycle.close_status = Some(code);
                    lifecycle.close_reason = Some(reason.to_owned());
                    lifecycle.state = ConnectionState::CloseReceived;
                    Action::Echo
                }
                other => {
                    events::close_frame_received_in_unexpected_state(shared.id, other);
                    Action::Ignore
                }
            }
        };

        match action {
            Action::Complete => {
                events::close_handshake_complete(shared.id);
                shared.cancel.cancel();
            }
            Action::Echo => {
                events::close_handshake_respond(shared.id, code);
                // Echo the peer's close payload back unchanged; the
                // handshake is done for us either way.
                let _ = shared
                    .emit_frame(OpCode::Close, raw_payload, true, None)
                    .await;
                shared.lifecycle.lock().unwrap().state = ConnectionState::Closed;
                events::close_handshake_complete(shared.id);
                shared.cancel.cancel();
            }
            Action::Ignore => {}
        }
    }

    /// Register the observer called with every pong payload the peer
    /// sends. Replaces any previous observer.
    pub fn on_pong(&self, observer: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.keepalive.set_observer(Box::new(observer));
    }
}

impl<T> Connection<T> {
    /// Opaque identity of this connection, created once, never reused.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Which side of the connection this endpoint is.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Whether this endpoint masks its outgoing frames.
    pub fn is_client(&self) -> bool {
        self.shared.role == Role::Client
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Close status from the peer's close frame, once received.
    pub fn close_status(&self) -> Option<CloseCode> {
        self.shared.lifecycle.lock().unwrap().close_status
    }

    /// Close reason from the peer's close frame, once received.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.lifecycle.lock().unwrap().close_reason.clone()
    }

    /// Connection options.
    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Keep-alive ping interval; zero means pings are disabled.
    pub fn keep_alive_interval(&self) -> Duration {
        self.shared.options.keep_alive_interval
    }

    /// Negotiated subprotocol, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.info.subprotocol.as_deref()
    }

    /// Request path of the upgrade request.
    pub fn uri_path(&self) -> &str {
        &self.shared.info.uri_path
    }

    /// Local endpoint address, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.info.local_addr
    }

    /// Remote endpoint address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.info.remote_addr
    }

    /// When this connection was constructed.
    pub fn created_at(&self) -> SystemTime {
        self.shared.created_at
    }

    /// Whether the peer negotiated `permessage-deflate`. Recorded only;
    /// the core does not compress.
    pub fn per_message_deflate(&self) -> bool {
        self.shared.deflate
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.sink.shutdown();
    }
}

fn spawn_keep_alive<T>(shared: Arc<Shared<T>>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let interval = shared.options.keep_alive_interval;
    let cancel = shared.cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if shared.state() != ConnectionState::Open {
                break;
            }
            let payload = shared.keepalive.next_ping_payload();
            if shared
                .emit_frame(OpCode::Ping, &payload, true, None)
                .await
                .is_err()
            {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Read side replays canned bytes; write side is shared with the test
    /// so frames the connection emits can be inspected.
    struct MockStream {
        read_data: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl MockStream {
        fn new(data: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    read_data: Cursor::new(data),
                    written: written.clone(),
                },
                written,
            )
        }
    }

    impl AsyncRead for MockStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let pos = self.read_data.position() as usize;
            let data = self.read_data.get_ref();
            if pos >= data.len() {
                return Poll::Ready(Ok(()));
            }
            let remaining = &data[pos..];
            let to_copy = std::cmp::min(remaining.len(), buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.read_data.set_position((pos + to_copy) as u64);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn server(data: Vec<u8>) -> (Connection<MockStream>, Arc<Mutex<Vec<u8>>>) {
        let (stream, written) = MockStream::new(data);
        // Keep-alive off so tests control every byte on the wire.
        let options = Options::new().with_keep_alive_interval(Duration::ZERO);
        (Connection::new(stream, Role::Server, options), written)
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_receive_short_text() {
        // FIN=1, Text, len=5, "Hello"
        let (conn, _) = server(vec![0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);
        let mut buf = [0u8; 32];

        let received = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(received.count, 5);
        assert_eq!(received.kind, MessageKind::Text);
        assert!(received.end_of_message);
        assert_eq!(&buf[..5], &[0x48, 0x65, 0x6C, 0x6C, 0x6F]);
    }

    #[tokio::test]
    async fn test_receive_masked_client_frame() {
        let (conn, _) = server(vec![
            0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58,
        ]);
        let mut buf = [0u8; 32];

        let received = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(received.count, 5);
        assert_eq!(&buf[..5], b"Hello");
    }

    #[tokio::test]
    async fn test_receive_fragmented_binary_uses_continuation_memory() {
        let (conn, _) = server(vec![
            0x02, 0x03, 0xAA, 0xBB, 0xCC, // Binary, FIN=0
            0x80, 0x02, 0xDD, 0xEE, // Continuation, FIN=1
        ]);
        let mut buf = [0u8; 32];

        let first = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(first.count, 3);
        assert_eq!(first.kind, MessageKind::Binary);
        assert!(!first.end_of_message);
        assert_eq!(&buf[..3], &[0xAA, 0xBB, 0xCC]);

        let second = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.kind, MessageKind::Binary);
        assert!(second.end_of_message);
        assert_eq!(&buf[..2], &[0xDD, 0xEE]);
    }

    #[tokio::test]
    async fn test_receive_fragmented_text_continuation_reports_text() {
        let (conn, _) = server(vec![
            0x01, 0x03, 0x48, 0x65, 0x6C, // Text, FIN=0, "Hel"
            0x80, 0x02, 0x6C, 0x6F, // Continuation, FIN=1, "lo"
        ]);
        let mut buf = [0u8; 32];

        let first = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(first.kind, MessageKind::Text);
        let second = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(second.kind, MessageKind::Text);
        assert!(second.end_of_message);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong_and_loop_continues() {
        let (conn, written) = server(vec![
            0x89, 0x04, 0x70, 0x69, 0x6E, 0x67, // Ping "ping"
            0x81, 0x02, 0x68, 0x69, // Text "hi"
        ]);
        let mut buf = [0u8; 32];

        // The ping never surfaces; the text frame is the first result.
        let received = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(received.kind, MessageKind::Text);
        assert_eq!(&buf[..2], b"hi");

        let written = written.lock().unwrap().clone();
        assert_eq!(written, vec![0x8A, 0x04, 0x70, 0x69, 0x6E, 0x67]);
    }

    #[tokio::test]
    async fn test_pong_raises_observer_and_loop_continues() {
        let (conn, _) = server(vec![
            0x8A, 0x04, 0x70, 0x6F, 0x6E, 0x67, // Pong "pong"
            0x81, 0x02, 0x68, 0x69, // Text "hi"
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_observer = seen.clone();
        conn.on_pong(move |payload| {
            seen_by_observer.lock().unwrap().push(payload.to_vec());
        });
        let mut buf = [0u8; 32];

        let received = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(received.kind, MessageKind::Text);
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"pong".to_vec()]);
    }

    #[tokio::test]
    async fn test_local_close_handshake() {
        let (conn, written) = server(vec![
            0x88, 0x02, 0x03, 0xE8, // Peer's close reply, code 1000
        ]);
        let mut buf = [0u8; 32];

        conn.close(CloseCode::NormalClosure, "bye", &token())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::CloseSent);
        assert_eq!(
            written.lock().unwrap().clone(),
            vec![0x88, 0x05, 0x03, 0xE8, 0x62, 0x79, 0x65]
        );

        let received = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(received.kind, MessageKind::Close);
        assert_eq!(received.count, 2);
        assert_eq!(received.close_status, Some(CloseCode::NormalClosure));
        assert_eq!(received.close_reason.as_deref(), Some(""));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_status(), Some(CloseCode::NormalClosure));
    }

    #[tokio::test]
    async fn test_remote_close_is_echoed() {
        let (conn, written) = server(vec![
            0x88, 0x05, 0x03, 0xE8, 0x62, 0x79, 0x65, // Close 1000 "bye"
        ]);
        let mut buf = [0u8; 32];

        let received = conn.receive(&mut buf, &token()).await.unwrap();
        assert_eq!(received.kind, MessageKind::Close);
        assert_eq!(received.close_status, Some(CloseCode::NormalClosure));
        assert_eq!(received.close_reason.as_deref(), Some("bye"));
        assert_eq!(conn.state(), ConnectionState::Closed);

        // The received payload is echoed back unchanged.
        assert_eq!(
            written.lock().unwrap().clone(),
            vec![0x88, 0x05, 0x03, 0xE8, 0x62, 0x79, 0x65]
        );
    }

    #[tokio::test]
    async fn test_receive_after_close_reports_state() {
        let (conn, _) = server(vec![0x88, 0x02, 0x03, 0xE8]);
        let mut buf = [0u8; 32];

        let _ = conn.receive(&mut buf, &token()).await.unwrap();
        let err = conn.receive(&mut buf, &token()).await.unwrap_err();
        assert_eq!(err, Error::InvalidState(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_oversize_declared_length_closes_with_protocol_error() {
        // 64-bit length with the high bit set
        let mut wire = vec![0x82, 0x7F];
        wire.extend((1u64 << 63).to_be_bytes());
        let (conn, written) = server(wire);
        let mut buf = [0u8; 32];

        let err = conn.receive(&mut buf, &token()).await.unwrap_err();
        assert!(matches!(err, Error::PayloadLengthOutOfRange(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Best-effort close frame carries 1002.
        let written = written.lock().unwrap().clone();
        assert_eq!(&written[..4], &[0x88, 0x02, 0x03, 0xEA]);
    }

    #[tokio::test]
    async fn test_reserved_opcode_closes_with_protocol_error() {
        let (conn, written) = server(vec![0x83, 0x00]);
        let mut buf = [0u8; 32];

        let err = conn.receive(&mut buf, &token()).await.unwrap_err();
        assert!(matches!(err, Error::ReservedOpcode(0x03)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        let written = written.lock().unwrap().clone();
        assert_eq!(&written[..4], &[0x88, 0x02, 0x03, 0xEA]);
    }

    #[tokio::test]
    async fn test_buffer_overflow_closes_with_message_too_big() {
        let (conn, written) = server(vec![0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);
        let mut buf = [0u8; 2];

        let err = conn.receive(&mut buf, &token()).await.unwrap_err();
        assert!(matches!(err, Error::BufferOverflow { .. }));
        let written = written.lock().unwrap().clone();
        assert_eq!(&written[..4], &[0x88, 0x02, 0x03, 0xF1]); // 1009
    }

    #[tokio::test]
    async fn test_cancelled_receive_closes_endpoint_unavailable() {
        // The cancel arm wins the biased select before any read happens.
        let (conn, written) = server(vec![]);
        let mut buf = [0u8; 8];
        let cancel = token();
        cancel.cancel();

        let err = conn.receive(&mut buf, &cancel).await.unwrap_err();
        assert_eq!(err, Error::Cancelled);
        assert_eq!(conn.state(), ConnectionState::Closed);
        let written = written.lock().unwrap().clone();
        assert_eq!(&written[..4], &[0x88, 0x02, 0x03, 0xE9]); // 1001
    }

    #[tokio::test]
    async fn test_send_text_and_binary() {
        let (conn, written) = server(vec![]);

        conn.send(b"One", MessageKind::Text, true, &token())
            .await
            .unwrap();
        conn.send(&[1, 2], MessageKind::Binary, true, &token())
            .await
            .unwrap();

        let written = written.lock().unwrap().clone();
        assert_eq!(
            written,
            vec![0x81, 0x03, b'O', b'n', b'e', 0x82, 0x02, 0x01, 0x02]
        );
    }

    #[tokio::test]
    async fn test_send_fragmented_uses_continuation_opcode() {
        let (conn, written) = server(vec![]);

        conn.send(b"ab", MessageKind::Text, false, &token())
            .await
            .unwrap();
        conn.send(b"cd", MessageKind::Text, false, &token())
            .await
            .unwrap();
        conn.send(b"ef", MessageKind::Text, true, &token())
            .await
            .unwrap();
        // Flag cleared after the final fragment.
        conn.send(b"gh", MessageKind::Text, true, &token())
            .await
            .unwrap();

        let written = written.lock().unwrap().clone();
        assert_eq!(
            written,
            vec![
                0x01, 0x02, b'a', b'b', // Text, FIN=0
                0x00, 0x02, b'c', b'd', // Continuation, FIN=0
                0x80, 0x02, b'e', b'f', // Continuation, FIN=1
                0x81, 0x02, b'g', b'h', // Text, FIN=1
            ]
        );
    }

    #[tokio::test]
    async fn test_send_close_kind_rejected_without_touching_flag() {
        let (conn, _) = server(vec![]);

        conn.send(b"ab", MessageKind::Text, false, &token())
            .await
            .unwrap();
        let err = conn
            .send(b"", MessageKind::Close, true, &token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        // Still mid-message: the next send continues.
        assert!(conn.shared.sending_continuation.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_client_frames_are_masked() {
        let (stream, written) = MockStream::new(vec![]);
        let options = Options::new().with_keep_alive_interval(Duration::ZERO);
        let conn = Connection::new(stream, Role::Client, options);

        conn.send(b"Hello", MessageKind::Text, true, &token())
            .await
            .unwrap();

        let written = written.lock().unwrap().clone();
        assert_eq!(written[0], 0x81);
        assert_eq!(written[1], 0x85); // MASK bit + len 5
        assert_eq!(written.len(), 11);
        let mask = [written[2], written[3], written[4], written[5]];
        let unmasked: Vec<u8> = written[6..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect();
        assert_eq!(unmasked, b"Hello");
    }

    #[tokio::test]
    async fn test_send_ping_too_large_is_local_error() {
        let (conn, written) = server(vec![]);
        let payload = vec![0u8; 126];

        let err = conn.send_ping(&payload, &token()).await.unwrap_err();
        assert_eq!(err, Error::ControlFrameTooLarge(126));
        // No close frame, nothing written, connection still open.
        assert!(written.lock().unwrap().is_empty());
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _) = server(vec![]);
        conn.close(CloseCode::NormalClosure, "", &token())
            .await
            .unwrap();

        let err = conn
            .send(b"x", MessageKind::Text, true, &token())
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidState(ConnectionState::CloseSent));
    }

    #[tokio::test]
    async fn test_close_twice_sends_one_frame() {
        let (conn, written) = server(vec![]);

        conn.close(CloseCode::NormalClosure, "", &token())
            .await
            .unwrap();
        conn.close(CloseCode::NormalClosure, "", &token())
            .await
            .unwrap();

        assert_eq!(written.lock().unwrap().clone(), vec![0x88, 0x02, 0x03, 0xE8]);
    }

    #[tokio::test]
    async fn test_close_output_transitions_before_write() {
        let (conn, written) = server(vec![]);

        conn.close_output(CloseCode::NormalClosure, "", &token())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(written.lock().unwrap().clone(), vec![0x88, 0x02, 0x03, 0xE8]);

        // Inbound reads are cancelled from here on.
        assert!(conn.shared.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_abort_is_unconditional_and_silent() {
        let (conn, written) = server(vec![]);

        conn.abort();
        assert_eq!(conn.state(), ConnectionState::Aborted);
        assert!(written.lock().unwrap().is_empty());
        assert!(conn.shared.cancel.is_cancelled());

        // Terminal states are never left.
        conn.abort();
        assert_eq!(conn.state(), ConnectionState::Aborted);
        let result = conn.close(CloseCode::NormalClosure, "", &token()).await;
        assert!(result.is_ok()); // logged no-op
        assert_eq!(conn.state(), ConnectionState::Aborted);
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let (conn, written) = server(vec![]);

        conn.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        let after_first = written.lock().unwrap().clone();
        assert_eq!(&after_first[..4], &[0x88, 0x02, 0x03, 0xE9]); // 1001

        conn.shutdown().await;
        assert_eq!(written.lock().unwrap().clone(), after_first);
    }

    #[tokio::test]
    async fn test_shutdown_after_close_emits_nothing() {
        let (conn, written) = server(vec![0x88, 0x02, 0x03, 0xE8]);
        let mut buf = [0u8; 8];

        conn.close(CloseCode::NormalClosure, "", &token())
            .await
            .unwrap();
        let _ = conn.receive(&mut buf, &token()).await.unwrap();
        let before = written.lock().unwrap().clone();

        conn.shutdown().await;
        assert_eq!(written.lock().unwrap().clone(), before);
    }

    #[tokio::test]
    async fn test_keep_alive_pings_flow() {
        let (stream, written) = MockStream::new(vec![]);
        let options = Options::new().with_keep_alive_interval(Duration::from_millis(5));
        let conn = Connection::new(stream, Role::Server, options);

        tokio::time::sleep(Duration::from_millis(40)).await;
        conn.abort();

        let written = written.lock().unwrap().clone();
        assert!(!written.is_empty(), "keep-alive should have pinged");
        // Ping opcode with the 8-byte counter payload.
        assert_eq!(written[0], 0x89);
        assert_eq!(written[1], 0x08);
        assert_eq!(&written[2..10], &0u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_handshake_info_accessors() {
        let (stream, _) = MockStream::new(vec![]);
        let info = HandshakeInfo {
            uri_path: "/chat".into(),
            subprotocol: Some("v1.protocol".into()),
            extensions: Some("permessage-deflate; client_max_window_bits=15".into()),
            local_addr: None,
            remote_addr: None,
        };
        let options = Options::new().with_keep_alive_interval(Duration::ZERO);
        let conn = Connection::with_handshake(stream, Role::Server, options, info);

        assert_eq!(conn.uri_path(), "/chat");
        assert_eq!(conn.subprotocol(), Some("v1.protocol"));
        assert!(conn.per_message_deflate());
        assert!(!conn.is_client());
        assert_eq!(conn.state(), ConnectionState::Open);
    }
}
