//! Connection lifecycle states.
//!
//! The state only ever moves forward:
//!
//! ```text
//! Open ──local close──▶ CloseSent ──peer close──▶ Closed
//!   │                                               ▲
//!   ├──peer close──▶ CloseReceived ──reply sent─────┤
//!   ├──close output─────────────────────────────────┘
//!   └──abort──▶ Aborted          (abort reaches Aborted from any
//!                                 non-terminal state)
//! ```

/// Lifecycle state of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Data flows both ways.
    #[default]
    Open,
    /// We sent a close frame and are waiting for the peer's reply.
    CloseSent,
    /// The peer's close frame arrived; our reply is on its way out.
    CloseReceived,
    /// The close handshake finished, or the output side was shut down.
    Closed,
    /// Torn down without a close handshake.
    Aborted,
}

impl ConnectionState {
    /// Terminal states are never left.
    #[must_use]
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Aborted)
    }

    /// Data and control frames may be sent only while fully open.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Frames may still arrive while open or while awaiting the peer's
    /// close reply.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::CloseSent)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::CloseSent => write!(f, "CloseSent"),
            ConnectionState::CloseReceived => write!(f, "CloseReceived"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Aborted => write!(f, "Aborted"),
        }
    }
}
