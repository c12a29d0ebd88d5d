//! Named log events emitted by the connection core.
//!
//! One thin function per event keeps call sites greppable and the wording
//! in one place. Everything goes through the `log` facade under the
//! `wscore` target; hosts plug in whatever logger they run.

use uuid::Uuid;

use crate::connection::ConnectionState;
use crate::message::CloseCode;
use crate::protocol::OpCode;

const TARGET: &str = "wscore";

pub(crate) fn received_frame(id: Uuid, opcode: OpCode, fin: bool, len: usize) {
    log::debug!(target: TARGET, "{id} received frame: opcode={opcode} fin={fin} len={len}");
}

pub(crate) fn sending_frame(id: Uuid, opcode: OpCode, fin: bool, len: usize) {
    log::debug!(target: TARGET, "{id} sending frame: opcode={opcode} fin={fin} len={len}");
}

pub(crate) fn keep_alive_interval_zero(id: Uuid) {
    log::debug!(target: TARGET, "{id} keep-alive interval is zero, pings disabled");
}

pub(crate) fn use_per_message_deflate(id: Uuid, extensions: &str) {
    log::info!(
        target: TARGET,
        "{id} permessage-deflate negotiated ({extensions}); compression is not applied"
    );
}

pub(crate) fn no_message_compression(id: Uuid) {
    log::debug!(target: TARGET, "{id} no message compression negotiated");
}

pub(crate) fn close_handshake_started(id: Uuid, code: CloseCode, reason: &str) {
    log::info!(target: TARGET, "{id} close handshake started: code={code} reason={reason:?}");
}

pub(crate) fn close_handshake_respond(id: Uuid, code: CloseCode) {
    log::debug!(target: TARGET, "{id} responding to peer close frame: code={code}");
}

pub(crate) fn close_handshake_complete(id: Uuid) {
    log::info!(target: TARGET, "{id} close handshake complete");
}

pub(crate) fn close_output_no_handshake(id: Uuid, code: CloseCode) {
    log::debug!(target: TARGET, "{id} emitting close frame without handshake: code={code}");
}

pub(crate) fn close_output_auto_timeout(id: Uuid, cause: &dyn std::fmt::Display) {
    log::warn!(target: TARGET, "{id} auto-close after receive failure: {cause}");
}

pub(crate) fn close_output_auto_timeout_cancelled(id: Uuid) {
    log::warn!(target: TARGET, "{id} auto-close timed out before the close frame was written");
}

pub(crate) fn close_output_auto_timeout_error(id: Uuid, err: &dyn std::fmt::Display) {
    log::error!(target: TARGET, "{id} auto-close failed: {err}");
}

pub(crate) fn invalid_state_before_close(id: Uuid, state: ConnectionState) {
    log::warn!(target: TARGET, "{id} close requested while {state}");
}

pub(crate) fn invalid_state_before_close_output(id: Uuid, state: ConnectionState) {
    log::warn!(target: TARGET, "{id} close-output requested while {state}");
}

pub(crate) fn close_frame_received_in_unexpected_state(id: Uuid, state: ConnectionState) {
    log::warn!(target: TARGET, "{id} close frame received while {state}, ignoring");
}

pub(crate) fn dispose(id: Uuid, state: ConnectionState) {
    log::debug!(target: TARGET, "{id} disposing connection in state {state}");
}

pub(crate) fn dispose_close_timeout(id: Uuid) {
    log::warn!(target: TARGET, "{id} close on dispose timed out");
}

pub(crate) fn dispose_error(id: Uuid, err: &dyn std::fmt::Display) {
    log::error!(target: TARGET, "{id} error during dispose: {err}");
}
