//! The per-connection state machine and its supporting pieces.
//!
//! ## Connection lifecycle
//!
//! 1. **Open** - data flows both ways
//! 2. **CloseSent** - we started the close handshake
//! 3. **CloseReceived** - the peer started it; our reply is going out
//! 4. **Closed** - handshake complete or output shut down
//! 5. **Aborted** - torn down without a handshake

mod keepalive;
mod role;
mod sink;
mod state;

pub use keepalive::PongObserver;
pub use role::Role;
pub use state::ConnectionState;

#[allow(clippy::module_inception)]
mod connection;

pub use connection::{Connection, Received};
