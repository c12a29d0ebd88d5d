//! # wscore - WebSocket Endpoint Core
//!
//! `wscore` is the per-connection core of an RFC 6455 WebSocket endpoint:
//! the frame codec, the connection state machine, serialized writes on the
//! shared transport, keep-alive pings, and the close handshake.
//!
//! It deliberately starts where the HTTP upgrade ends. The host owns socket
//! and TLS acquisition, the handshake, and connection registries; `wscore`
//! takes the already-upgraded byte stream plus whatever the handshake
//! negotiated, and runs the wire protocol from there.
//!
//! ## Features
//!
//! - **Caller-owned buffers**: frames are read directly into the buffer you
//!   supply, no internal reassembly or hidden allocation per message
//! - **Concurrent senders**: one receive task plus any number of send/close
//!   tasks; frames never interleave on the wire
//! - **Full close handshake** with best-effort close frames on every
//!   failure path
//! - **Keep-alive** pings with a pong observer
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use wscore::{Connection, MessageKind, Options, Role};
//!
//! // After the HTTP upgrade completed on `stream`:
//! let conn = Connection::new(stream, Role::Server, Options::default());
//! let mut buf = conn.options().receive_buffer();
//! let cancel = CancellationToken::new();
//!
//! loop {
//!     let received = conn.receive(&mut buf, &cancel).await?;
//!     match received.kind {
//!         MessageKind::Close => break,
//!         kind => conn.send(&buf[..received.count], kind, received.end_of_message, &cancel).await?,
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod message;
pub mod protocol;

mod events;

pub use config::{HandshakeInfo, Options};
pub use connection::{Connection, ConnectionState, PongObserver, Received, Role};
pub use error::{Error, Result};
pub use message::{CloseCode, MessageKind};
pub use protocol::{Frame, OpCode};

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_public_types_are_send() {
        assert_send::<Error>();
        assert_send::<Options>();
        assert_send::<HandshakeInfo>();
        assert_send::<Received>();
        assert_send::<CloseCode>();
        assert_send::<MessageKind>();
        assert_send::<ConnectionState>();
        assert_send::<Role>();
        assert_send::<Connection<tokio::io::DuplexStream>>();
    }

    #[test]
    fn test_public_types_are_sync() {
        assert_sync::<Error>();
        assert_sync::<Options>();
        assert_sync::<HandshakeInfo>();
        assert_sync::<Received>();
        assert_sync::<CloseCode>();
        assert_sync::<MessageKind>();
        assert_sync::<ConnectionState>();
        assert_sync::<Role>();
        assert_sync::<Connection<tokio::io::DuplexStream>>();
    }
}
