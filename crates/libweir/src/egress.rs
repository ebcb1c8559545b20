//! Outbound adapter: drains a reactive source into a push transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::call::{CallMember, DirectionCell};
use crate::reactive::{Subscriber, Subscription};
use crate::transport::{ReadyHandler, WriteControl};
use crate::{BridgeConfig, BridgeError};

/// Consumes a reactive sequence and forwards it to a transport write half.
///
/// The adapter keeps the configured pull-credit requested from upstream
/// and never calls [`WriteControl::send`] while the transport reports
/// unready: elements accepted in the meantime wait in a credit-bounded
/// queue that the readiness callback flushes. Each send owes one top-up
/// request to upstream, paid immediately when the transport stays ready
/// and deferred to [`on_ready`](ReadyHandler::on_ready) otherwise, so the
/// transport's own flow control stays authoritative end to end.
///
/// Register the adapter with the transport as its [`ReadyHandler`] and
/// subscribe it to the upstream source.
pub struct EgressSink<T> {
    writer: Arc<dyn WriteControl<T>>,
    direction: Arc<DirectionCell>,
    pull_credit: u32,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    subscription: Option<Arc<dyn Subscription>>,
    /// Accepted from upstream, not yet sent. Bounded by the pull-credit.
    pending: VecDeque<T>,
    /// Top-up requests owed to upstream once the transport is ready.
    deferred: u64,
    upstream_done: bool,
    terminal: bool,
    flushing: bool,
}

impl<T: Send + 'static> EgressSink<T> {
    pub fn new(
        writer: Arc<dyn WriteControl<T>>,
        direction: Arc<DirectionCell>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new(EgressSink {
            writer,
            direction,
            pull_credit: config.pull_credit.max(1),
            inner: Mutex::new(Inner {
                subscription: None,
                pending: VecDeque::new(),
                deferred: 0,
                upstream_done: false,
                terminal: false,
                flushing: false,
            }),
        })
    }

    /// Send/top-up/half-close loop, serialized by the `flushing` guard.
    /// Transport and upstream calls run with the lock released; a producer
    /// that emits synchronously from inside `request` only grows the
    /// pending queue for this loop to pick up.
    fn flush<'a>(&'a self, mut inner: MutexGuard<'a, Inner<T>>) {
        if inner.flushing || inner.terminal {
            return;
        }
        inner.flushing = true;
        loop {
            if inner.terminal {
                break;
            }

            if !inner.pending.is_empty() && self.writer.is_ready() {
                let item = inner.pending.pop_front().expect("pending checked above");
                let top_up = !inner.upstream_done;
                drop(inner);
                self.writer.send(item);
                inner = self.inner.lock().unwrap();
                if top_up {
                    inner.deferred += 1;
                }
                continue;
            }

            if inner.deferred > 0 && !inner.upstream_done && self.writer.is_ready() {
                if let Some(subscription) = inner.subscription.clone() {
                    let n = inner.deferred;
                    inner.deferred = 0;
                    drop(inner);
                    tracing::trace!(direction = %self.direction, n, "topping up upstream demand");
                    subscription.request(n);
                    inner = self.inner.lock().unwrap();
                    continue;
                }
            }

            if inner.upstream_done && inner.pending.is_empty() {
                inner.terminal = true;
                inner.flushing = false;
                inner.subscription = None;
                drop(inner);
                tracing::debug!(direction = %self.direction, "upstream complete, half-closing");
                self.writer.half_close();
                self.direction.half_closed();
                self.direction.completed();
                return;
            }

            break;
        }
        inner.flushing = false;
    }

    /// Terminal failure: release everything and abort the call.
    fn fail(&self, mut inner: MutexGuard<'_, Inner<T>>, fault: BridgeError) {
        if inner.terminal {
            return;
        }
        inner.terminal = true;
        inner.pending.clear();
        inner.deferred = 0;
        let subscription = inner.subscription.take();
        drop(inner);
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.direction.errored(&fault);
        self.writer.abort(fault);
    }
}

impl<T: Send + 'static> Subscriber<T> for EgressSink<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal || inner.subscription.is_some() {
                drop(inner);
                subscription.cancel();
                return;
            }
            inner.subscription = Some(subscription.clone());
        }
        self.direction.activate();
        let credit = u64::from(self.pull_credit);
        tracing::trace!(direction = %self.direction, credit, "requesting initial pull credit");
        subscription.request(credit);
    }

    fn on_next(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal {
            return;
        }
        if inner.pending.len() >= self.pull_credit as usize {
            self.fail(
                inner,
                BridgeError::Protocol("upstream produced beyond requested demand".into()),
            );
            return;
        }
        inner.pending.push_back(item);
        self.flush(inner);
    }

    fn on_complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal {
            return;
        }
        inner.upstream_done = true;
        self.flush(inner);
    }

    fn on_error(&self, fault: BridgeError) {
        let inner = self.inner.lock().unwrap();
        self.fail(inner, fault);
    }
}

impl<T: Send + 'static> ReadyHandler for EgressSink<T> {
    fn on_ready(&self) {
        let inner = self.inner.lock().unwrap();
        if inner.terminal {
            return;
        }
        tracing::trace!(direction = %self.direction, "transport ready again");
        self.flush(inner);
    }
}

impl<T: Send + 'static> CallMember for EgressSink<T> {
    fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal {
            return;
        }
        inner.terminal = true;
        inner.pending.clear();
        inner.deferred = 0;
        let subscription = inner.subscription.take();
        drop(inner);
        tracing::debug!(direction = %self.direction, "cancelling upstream producer");
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.direction.errored(&BridgeError::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeWriter {
        ready: AtomicBool,
        sent: Mutex<Vec<u32>>,
        unready_sends: AtomicUsize,
        half_closed: AtomicUsize,
        aborted: Mutex<Option<String>>,
    }

    impl FakeWriter {
        fn ready() -> Arc<Self> {
            let writer = Arc::new(FakeWriter::default());
            writer.ready.store(true, Ordering::SeqCst);
            writer
        }

        fn sent(&self) -> Vec<u32> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl WriteControl<u32> for FakeWriter {
        fn send(&self, item: u32) {
            if !self.ready.load(Ordering::SeqCst) {
                self.unready_sends.fetch_add(1, Ordering::SeqCst);
            }
            self.sent.lock().unwrap().push(item);
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn half_close(&self) {
            self.half_closed.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(&self, fault: BridgeError) {
            *self.aborted.lock().unwrap() = Some(fault.to_string());
        }
    }

    #[derive(Default)]
    struct FakeUpstream {
        requests: Mutex<Vec<u64>>,
        cancels: AtomicUsize,
    }

    impl FakeUpstream {
        fn requested(&self) -> u64 {
            self.requests.lock().unwrap().iter().sum()
        }
    }

    impl Subscription for FakeUpstream {
        fn request(&self, n: u64) {
            self.requests.lock().unwrap().push(n);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wired(
        writer: Arc<FakeWriter>,
        config: BridgeConfig,
    ) -> (Arc<EgressSink<u32>>, Arc<FakeUpstream>) {
        let egress = EgressSink::new(writer, DirectionCell::detached("outbound"), config);
        let upstream = Arc::new(FakeUpstream::default());
        egress.on_subscribe(upstream.clone());
        (egress, upstream)
    }

    #[test]
    fn initial_request_matches_pull_credit() {
        let (_egress, upstream) = wired(FakeWriter::ready(), BridgeConfig::default());
        assert_eq!(*upstream.requests.lock().unwrap(), vec![1]);

        let (_egress, upstream) = wired(
            FakeWriter::ready(),
            BridgeConfig {
                pull_credit: 3,
                ..BridgeConfig::default()
            },
        );
        assert_eq!(*upstream.requests.lock().unwrap(), vec![3]);
    }

    #[test]
    fn sends_and_tops_up_while_ready() {
        let writer = FakeWriter::ready();
        let (egress, upstream) = wired(writer.clone(), BridgeConfig::default());
        egress.on_next(7);
        assert_eq!(writer.sent(), vec![7]);
        // initial credit plus one top-up for the send
        assert_eq!(upstream.requested(), 2);
    }

    #[test]
    fn holds_elements_while_transport_unready() {
        let writer = Arc::new(FakeWriter::default());
        let (egress, upstream) = wired(writer.clone(), BridgeConfig::default());
        egress.on_next(1);
        assert_eq!(writer.sent(), Vec::<u32>::new());
        assert_eq!(upstream.requested(), 1);

        writer.ready.store(true, Ordering::SeqCst);
        egress.on_ready();
        assert_eq!(writer.sent(), vec![1]);
        assert_eq!(upstream.requested(), 2);
        assert_eq!(writer.unready_sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn half_close_waits_for_pending_elements() {
        let writer = Arc::new(FakeWriter::default());
        let (egress, _upstream) = wired(writer.clone(), BridgeConfig::default());
        egress.on_next(9);
        egress.on_complete();
        assert_eq!(writer.half_closed.load(Ordering::SeqCst), 0);

        writer.ready.store(true, Ordering::SeqCst);
        egress.on_ready();
        assert_eq!(writer.sent(), vec![9]);
        assert_eq!(writer.half_closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_upstream_half_closes_immediately() {
        let writer = FakeWriter::ready();
        let (egress, _upstream) = wired(writer.clone(), BridgeConfig::default());
        egress.on_complete();
        assert_eq!(writer.half_closed.load(Ordering::SeqCst), 1);
        assert_eq!(writer.sent(), Vec::<u32>::new());
    }

    #[test]
    fn upstream_error_aborts_the_call() {
        let writer = FakeWriter::ready();
        let (egress, _upstream) = wired(writer.clone(), BridgeConfig::default());
        egress.on_error(BridgeError::Upstream(anyhow::anyhow!("service blew up")));
        let aborted = writer.aborted.lock().unwrap().clone().unwrap();
        assert!(aborted.contains("service blew up"));
        // terminal is terminal
        egress.on_next(1);
        egress.on_complete();
        assert_eq!(writer.sent(), Vec::<u32>::new());
        assert_eq!(writer.half_closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn overproduction_is_a_protocol_violation() {
        let writer = Arc::new(FakeWriter::default());
        let (egress, upstream) = wired(writer.clone(), BridgeConfig::default());
        egress.on_next(1);
        egress.on_next(2);
        let aborted = writer.aborted.lock().unwrap().clone().unwrap();
        assert!(aborted.contains("protocol violation"));
        assert_eq!(upstream.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_cancels_upstream_without_abort() {
        let writer = Arc::new(FakeWriter::default());
        let (egress, upstream) = wired(writer.clone(), BridgeConfig::default());
        egress.on_next(4);
        egress.shutdown();
        assert_eq!(upstream.cancels.load(Ordering::SeqCst), 1);
        assert!(writer.aborted.lock().unwrap().is_none());

        writer.ready.store(true, Ordering::SeqCst);
        egress.on_ready();
        assert_eq!(writer.sent(), Vec::<u32>::new());
    }

    #[test]
    fn deferred_top_ups_accumulate_under_wider_credit() {
        let writer = FakeWriter::ready();
        let (egress, upstream) = wired(
            writer.clone(),
            BridgeConfig {
                pull_credit: 2,
                ..BridgeConfig::default()
            },
        );
        // ready for the first send, unready right after it
        egress.on_next(1);
        writer.ready.store(false, Ordering::SeqCst);
        egress.on_next(2);
        assert_eq!(writer.sent(), vec![1]);
        assert_eq!(upstream.requested(), 3);

        writer.ready.store(true, Ordering::SeqCst);
        egress.on_ready();
        assert_eq!(writer.sent(), vec![1, 2]);
        assert_eq!(upstream.requested(), 4);
        assert_eq!(writer.unready_sends.load(Ordering::SeqCst), 0);
    }
}
