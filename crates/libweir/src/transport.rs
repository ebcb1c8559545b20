//! The push-based transport contract the bridge drives.
//!
//! A real transport (a gRPC call object, an in-memory link in tests)
//! provides four things: push-callback delivery of inbound traffic into a
//! [`PushHandler`], an explicit [`ReadControl::request_next`] credit for
//! inbound flow control, a [`WriteControl`] send path gated by a readiness
//! signal, and cancellation. All operations must be callable from any
//! callback context; none may block.

use thiserror::Error;

use crate::BridgeError;

/// Transport-side failures, surfaced to the bridge through
/// [`PushHandler::on_error`].
#[derive(Error, Debug, Clone)]
pub enum TransportFault {
    #[error("peer reset: {0}")]
    Reset(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("transport i/o: {0}")]
    Io(String),
}

/// Inbound half of a call: pull credit toward the peer.
pub trait ReadControl: Send + Sync {
    /// Asks the transport to read and deliver one more unit from the peer.
    /// The transport must not push a message without a pending request.
    fn request_next(&self);

    /// Tears the call down from the receiving side.
    fn cancel(&self, reason: &str);
}

/// Outbound half of a call.
pub trait WriteControl<T>: Send + Sync {
    /// Hands one message to the transport. Only called while
    /// [`is_ready`](WriteControl::is_ready) reports true.
    fn send(&self, item: T);

    /// Whether another send can be issued without unbounded buffering
    /// inside the transport. Owned by the transport; may flip to false
    /// after any send and back to true via [`ReadyHandler::on_ready`].
    fn is_ready(&self) -> bool;

    /// Signals that the local side is done sending.
    fn half_close(&self);

    /// Aborts the call, carrying the terminal error to the peer.
    fn abort(&self, fault: BridgeError);
}

/// Callbacks the transport invokes as inbound traffic arrives.
pub trait PushHandler<T>: Send + Sync {
    fn on_message(&self, item: T);
    /// The peer closed its sending side.
    fn on_complete(&self);
    fn on_error(&self, fault: TransportFault);
}

/// Callback the transport invokes when the readiness signal returns to
/// true after a send found it false.
pub trait ReadyHandler: Send + Sync {
    fn on_ready(&self);
}
