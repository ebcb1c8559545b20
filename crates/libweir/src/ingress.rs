//! Inbound adapter: turns transport pushes into a demand-driven source.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::call::{CallMember, DirectionCell};
use crate::demand::DemandLedger;
use crate::reactive::{Source, Subscriber, Subscription, UNBOUNDED};
use crate::transport::{PushHandler, ReadControl, TransportFault};
use crate::{BridgeConfig, BridgeError};

/// Exposes a push transport's inbound traffic as a [`Source`].
///
/// The adapter requests nothing from the transport until the consumer
/// signals demand; each demand-covered read is requested one unit at a
/// time, so at most one message is ever in flight and at most one waits in
/// the buffer slot. Pausing the transport is simply declining to request
/// the next unit.
///
/// Register the adapter with the transport as its [`PushHandler`] and hand
/// it to the consumer as a [`Source`] (or call
/// [`subscribe`](IngressSource::subscribe) directly).
pub struct IngressSource<T> {
    reader: Arc<dyn ReadControl>,
    direction: Arc<DirectionCell>,
    allow_unbounded: bool,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    ledger: DemandLedger,
    /// The single buffered element permitted by the backpressure contract.
    slot: Option<T>,
    subscriber: Option<Arc<dyn Subscriber<T>>>,
    /// A read request was issued and its message has not arrived yet.
    read_outstanding: bool,
    /// Terminal error waiting for the drain loop to emit it.
    fault: Option<BridgeError>,
    draining: bool,
    cancel_sent: bool,
    terminal_sent: bool,
}

impl<T: Send + 'static> IngressSource<T> {
    pub fn new(
        reader: Arc<dyn ReadControl>,
        direction: Arc<DirectionCell>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new(IngressSource {
            reader,
            direction,
            allow_unbounded: config.allow_unbounded,
            inner: Mutex::new(Inner {
                ledger: DemandLedger::new(),
                slot: None,
                subscriber: None,
                read_outstanding: false,
                fault: None,
                draining: false,
                cancel_sent: false,
                terminal_sent: false,
            }),
        })
    }

    /// Attaches the single consumer. No transport read is issued until the
    /// consumer requests demand through the subscription it receives here.
    pub fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.subscriber.is_some() {
                drop(inner);
                subscriber.on_error(BridgeError::Protocol(
                    "source supports a single subscriber".into(),
                ));
                return;
            }
            inner.subscriber = Some(subscriber.clone());
        }
        tracing::debug!(direction = %self.direction, "consumer subscribed");
        let subscription: Arc<dyn Subscription> = self.clone();
        subscriber.on_subscribe(subscription);
        // completion or error may have arrived before the consumer did
        self.drain(self.inner.lock().unwrap());
    }

    /// The deliver/pause/complete decision loop.
    ///
    /// At most one thread drains at a time; callbacks into the consumer and
    /// the transport run with the lock released, so a demand request made
    /// from inside `on_next` (or a message pushed back synchronously by
    /// `request_next`) only records state for this loop to pick up on its
    /// next pass. The demand check, the buffer-or-deliver choice, and the
    /// read-or-pause choice all happen under one lock acquisition, which is
    /// what keeps the buffer at a single element.
    fn drain<'a>(&'a self, mut inner: MutexGuard<'a, Inner<T>>) {
        if inner.draining || inner.terminal_sent {
            return;
        }
        inner.draining = true;
        loop {
            // terminal signals wait for a consumer to tell
            if inner.fault.is_some() && inner.subscriber.is_some() {
                let fault = inner.fault.take().expect("fault checked above");
                inner.slot = None;
                inner.ledger.terminate();
                inner.terminal_sent = true;
                inner.draining = false;
                let subscriber = inner.subscriber.take();
                let send_cancel = !inner.cancel_sent && !fault.is_transport_origin();
                if send_cancel {
                    inner.cancel_sent = true;
                }
                drop(inner);
                if send_cancel {
                    self.reader.cancel("stream errored");
                }
                self.direction.errored(&fault);
                if let Some(subscriber) = subscriber {
                    subscriber.on_error(fault);
                }
                return;
            }

            if inner.slot.is_some() && inner.ledger.has_demand() && inner.subscriber.is_some() {
                let item = inner.slot.take().expect("slot checked above");
                if let Err(violation) = inner.ledger.consume_one() {
                    inner.fault = Some(violation);
                    continue;
                }
                let subscriber = inner.subscriber.clone().expect("subscriber checked above");
                drop(inner);
                tracing::trace!(direction = %self.direction, "delivering element");
                subscriber.on_next(item);
                inner = self.inner.lock().unwrap();
                continue;
            }

            if inner.ledger.is_exhausted() && inner.slot.is_none() && inner.subscriber.is_some() {
                inner.ledger.terminate();
                inner.terminal_sent = true;
                inner.draining = false;
                let subscriber = inner.subscriber.take();
                drop(inner);
                self.direction.completed();
                if let Some(subscriber) = subscriber {
                    subscriber.on_complete();
                }
                return;
            }

            let should_read = !inner.read_outstanding
                && inner.slot.is_none()
                && inner.ledger.has_demand()
                && !inner.ledger.is_exhausted()
                && !inner.ledger.is_terminated()
                && inner.subscriber.is_some();
            if should_read {
                inner.read_outstanding = true;
                drop(inner);
                tracing::trace!(direction = %self.direction, "requesting next unit");
                self.reader.request_next();
                inner = self.inner.lock().unwrap();
                continue;
            }

            inner.draining = false;
            return;
        }
    }

    fn fail(&self, mut inner: MutexGuard<'_, Inner<T>>, fault: BridgeError) {
        inner.fault = Some(fault);
        self.drain(inner);
    }
}

impl<T: Send + 'static> Subscription for IngressSource<T> {
    fn request(&self, n: u64) {
        self.direction.activate();
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_sent || inner.ledger.is_terminated() {
            return;
        }
        if n == 0 {
            self.fail(inner, BridgeError::Protocol("demand request of zero".into()));
            return;
        }
        if n == UNBOUNDED && !self.allow_unbounded {
            self.fail(
                inner,
                BridgeError::Protocol("unbounded demand is not permitted".into()),
            );
            return;
        }
        inner.ledger.request_more(n);
        tracing::trace!(
            direction = %self.direction,
            outstanding = inner.ledger.outstanding(),
            "demand requested"
        );
        self.drain(inner);
    }

    fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_sent || inner.cancel_sent {
            return;
        }
        inner.cancel_sent = true;
        inner.terminal_sent = true;
        inner.slot = None;
        inner.subscriber = None;
        inner.ledger.terminate();
        drop(inner);
        tracing::debug!(direction = %self.direction, "consumer cancelled, cancelling transport read");
        self.reader.cancel("consumer cancelled");
        self.direction.errored(&BridgeError::Cancelled);
    }
}

impl<T: Send + 'static> PushHandler<T> for IngressSource<T> {
    fn on_message(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_sent || inner.ledger.is_terminated() {
            // push racing a cancel that already went out
            return;
        }
        if !inner.read_outstanding {
            self.fail(
                inner,
                BridgeError::Protocol("message pushed without an outstanding read request".into()),
            );
            return;
        }
        if inner.slot.is_some() {
            self.fail(
                inner,
                BridgeError::Protocol("message pushed while one is already buffered".into()),
            );
            return;
        }
        inner.read_outstanding = false;
        inner.slot = Some(item);
        self.drain(inner);
    }

    fn on_complete(&self) {
        self.direction.half_closed();
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_sent {
            return;
        }
        inner.read_outstanding = false;
        inner.ledger.mark_exhausted();
        self.drain(inner);
    }

    fn on_error(&self, fault: TransportFault) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_sent {
            return;
        }
        inner.slot = None;
        inner.read_outstanding = false;
        self.fail(inner, fault.into());
    }
}

impl<T: Send + 'static> CallMember for IngressSource<T> {
    fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal_sent {
            return;
        }
        inner.slot = None;
        self.fail(inner, BridgeError::Cancelled);
    }

    fn transport_fault(&self, fault: TransportFault) {
        PushHandler::on_error(self, fault);
    }
}

impl<T: Send + 'static> Source<T> for Arc<IngressSource<T>> {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        IngressSource::subscribe(*self, subscriber);
    }
}
