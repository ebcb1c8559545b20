pub mod call;
pub mod demand;
pub mod egress;
pub mod ingress;
pub mod interop;
pub mod reactive;
pub mod transport;

use thiserror::Error;

use crate::transport::TransportFault;

/// Flow-control knobs for one bridged call.
///
/// `pull_credit` is the number of elements an [`egress::EgressSink`] keeps
/// requested from its upstream producer; values below 1 are treated as 1.
/// `allow_unbounded` controls whether a consumer may request the
/// [`reactive::UNBOUNDED`] sentinel from an [`ingress::IngressSource`].
#[derive(Clone, Copy, Debug)]
pub struct BridgeConfig {
    pub pull_credit: u32,
    pub allow_unbounded: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            pull_credit: 1,
            allow_unbounded: true,
        }
    }
}

/// Identifies one bridged call in log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        CallId(uuid::Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal failures a bridged stream direction can report.
///
/// Exactly one terminal signal (complete or one of these) reaches the
/// reactive consumer per direction.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The transport or a reactive peer broke the flow-control contract:
    /// a message was pushed without an outstanding read request, the
    /// single-element buffer overflowed, or demand was requested with a
    /// forbidden amount. Fatal to the stream, never retried.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The transport itself failed (peer reset, deadline, I/O).
    #[error(transparent)]
    Transport(#[from] TransportFault),

    /// The reactive consumer cancelled before completion.
    #[error("consumer cancelled before completion")]
    Cancelled,

    /// The reactive producer being forwarded outbound failed.
    #[error("upstream producer failed: {0}")]
    Upstream(anyhow::Error),
}

impl BridgeError {
    /// True when the transport already knows the stream is dead, so the
    /// bridge must not issue a redundant cancel instruction.
    pub fn is_transport_origin(&self) -> bool {
        matches!(self, BridgeError::Transport(_))
    }
}
