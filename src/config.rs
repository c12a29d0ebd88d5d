//! Connection options and negotiated handshake details.

use std::net::SocketAddr;
use std::time::Duration;

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Interval between keep-alive pings on an idle connection.
    ///
    /// Zero disables the ping task. Default: 30 seconds.
    pub keep_alive_interval: Duration,

    /// Append a textual representation of the triggering error to the
    /// reason of automatically emitted close frames.
    ///
    /// Useful while debugging; leaks error detail to the peer, so it is
    /// off by default.
    pub include_error_in_close_reason: bool,

    /// Suggested capacity for receive buffers allocated by the host.
    ///
    /// Default: 16 KiB.
    pub receive_buffer_len: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(30),
            include_error_in_close_reason: false,
            receive_buffer_len: 16 * 1024,
        }
    }
}

impl Options {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keep-alive ping interval. Zero disables pings.
    #[must_use]
    pub const fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Include error detail in auto-close reasons.
    #[must_use]
    pub const fn with_error_in_close_reason(mut self, include: bool) -> Self {
        self.include_error_in_close_reason = include;
        self
    }

    /// Set the suggested receive buffer capacity.
    #[must_use]
    pub const fn with_receive_buffer_len(mut self, len: usize) -> Self {
        self.receive_buffer_len = len;
        self
    }

    /// Allocate a receive buffer of the configured capacity.
    #[must_use]
    pub fn receive_buffer(&self) -> Vec<u8> {
        vec![0u8; self.receive_buffer_len]
    }
}

/// What the (external) HTTP upgrade handshake negotiated for a connection.
///
/// Informational; set once at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Request path of the upgrade request, e.g. `/chat`.
    pub uri_path: String,

    /// Negotiated subprotocol, if any.
    pub subprotocol: Option<String>,

    /// Raw negotiated `Sec-WebSocket-Extensions` value, if any.
    pub extensions: Option<String>,

    /// Local endpoint address.
    pub local_addr: Option<SocketAddr>,

    /// Remote endpoint address.
    pub remote_addr: Option<SocketAddr>,
}

impl HandshakeInfo {
    /// Handshake details with only a request path.
    #[must_use]
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            uri_path: path.into(),
            ..Self::default()
        }
    }
}
