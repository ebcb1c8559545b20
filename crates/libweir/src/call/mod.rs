//! Wires adapters to the four RPC shapes and propagates termination.
//!
//! A [`CallRelay`] owns one call's worth of bridging: up to one inbound and
//! one outbound adapter, a shared [`CancellationToken`], and the rule that
//! a failure on either direction tears the other one down. The streaming
//! shapes map onto the constructors directly: a streaming request uses
//! [`CallRelay::inbound`], a streaming response uses
//! [`CallRelay::outbound`], and bidi uses [`CallRelay::bidi`] — two fully
//! independent directions sharing only the cancellation channel. Unary legs
//! carry a single message and stay with the call site.

mod direction;

pub use direction::{DirectionCell, DirectionState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

use crate::egress::EgressSink;
use crate::ingress::IngressSource;
use crate::reactive::Source;
use crate::transport::{ReadControl, TransportFault, WriteControl};
use crate::{BridgeConfig, CallId};

/// Teardown hooks the relay invokes on the members of a dying call.
pub trait CallMember: Send + Sync {
    /// The paired direction failed or the call was cancelled; release
    /// buffered state and stop quietly.
    fn shutdown(&self);

    /// The transport reported a call-level failure; surface it as an error
    /// where the member has a consumer to tell.
    fn transport_fault(&self, fault: TransportFault) {
        let _ = fault;
        self.shutdown();
    }
}

pub(crate) struct RelayCore {
    id: CallId,
    token: CancellationToken,
    faulted: AtomicBool,
    members: Mutex<Vec<(&'static str, Weak<dyn CallMember>)>>,
}

impl RelayCore {
    /// Cancels every member except the direction the fault originated
    /// from. Runs at most once per call.
    pub(crate) fn fault_from(&self, origin: &'static str) {
        if self.faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let others: Vec<Weak<dyn CallMember>> = self
            .members
            .lock()
            .unwrap()
            .iter()
            .filter(|(label, _)| *label != origin)
            .map(|(_, member)| member.clone())
            .collect();
        for member in others {
            if let Some(member) = member.upgrade() {
                member.shutdown();
            }
        }
    }

    fn fault_all(&self, fault: TransportFault) {
        if self.faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let members: Vec<Weak<dyn CallMember>> = self
            .members
            .lock()
            .unwrap()
            .iter()
            .map(|(_, member)| member.clone())
            .collect();
        for member in members {
            if let Some(member) = member.upgrade() {
                member.transport_fault(fault.clone());
            }
        }
    }
}

/// Orchestrates the adapters of one RPC call.
pub struct CallRelay {
    core: Arc<RelayCore>,
    config: BridgeConfig,
}

impl CallRelay {
    pub fn new(config: BridgeConfig) -> Self {
        CallRelay {
            core: Arc::new(RelayCore {
                id: CallId::new(),
                token: CancellationToken::new(),
                faulted: AtomicBool::new(false),
                members: Mutex::new(Vec::new()),
            }),
            config,
        }
    }

    pub fn id(&self) -> CallId {
        self.core.id
    }

    /// Cancelled when either direction errors or the transport reports a
    /// call-level fault. Transport integrations may watch this to tie the
    /// call object's own lifetime to the bridge.
    pub fn cancellation(&self) -> CancellationToken {
        self.core.token.clone()
    }

    /// Streaming-request shape: expose the transport's push deliveries as a
    /// demand-driven source for the service logic. The returned adapter
    /// must also be registered with the transport as its push handler.
    pub fn inbound<T: Send + 'static>(
        &self,
        reader: Arc<dyn ReadControl>,
    ) -> Arc<IngressSource<T>> {
        let cell = DirectionCell::for_call(self.core.id, "inbound", Arc::downgrade(&self.core));
        let ingress = IngressSource::new(reader, cell, self.config);
        self.register("inbound", ingress.clone());
        ingress
    }

    /// Streaming-response shape: drain a reactive source into the
    /// transport's write half under its readiness signal. The returned
    /// adapter must also be registered as the transport's ready handler.
    pub fn outbound<T: Send + 'static>(
        &self,
        source: Box<dyn Source<T>>,
        writer: Arc<dyn WriteControl<T>>,
    ) -> Arc<EgressSink<T>> {
        let cell = DirectionCell::for_call(self.core.id, "outbound", Arc::downgrade(&self.core));
        let egress = EgressSink::new(writer, cell, self.config);
        self.register("outbound", egress.clone());
        source.subscribe(egress.clone());
        egress
    }

    /// Bidi shape: one adapter per direction, independent except for the
    /// shared cancellation channel.
    #[allow(clippy::type_complexity)]
    pub fn bidi<I, O>(
        &self,
        reader: Arc<dyn ReadControl>,
        source: Box<dyn Source<O>>,
        writer: Arc<dyn WriteControl<O>>,
    ) -> (Arc<IngressSource<I>>, Arc<EgressSink<O>>)
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let ingress = self.inbound(reader);
        let egress = self.outbound(source, writer);
        (ingress, egress)
    }

    /// Injects a call-level transport failure (peer reset, deadline) and
    /// cancels every member.
    pub fn transport_fault(&self, fault: TransportFault) {
        tracing::warn!(call = %self.core.id, %fault, "transport fault, cancelling call");
        self.core.fault_all(fault);
    }

    fn register(&self, label: &'static str, member: Arc<dyn CallMember>) {
        let weak = Arc::downgrade(&member);
        self.core.members.lock().unwrap().push((label, weak));
    }
}

impl Default for CallRelay {
    fn default() -> Self {
        CallRelay::new(BridgeConfig::default())
    }
}
