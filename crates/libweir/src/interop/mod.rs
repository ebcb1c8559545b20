//! Bridges between the demand-driven [`Source`] contract and
//! [`futures::Stream`], so call sites can consume a bridged direction with
//! ordinary async iteration and publish ordinary streams through the
//! bridge.

mod pump;

pub use pump::TaskSource;

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::Stream;

use crate::reactive::{Source, Subscriber, Subscription};
use crate::BridgeError;

enum Terminal {
    Complete,
    Failed(BridgeError),
}

struct State<T> {
    subscription: Option<Arc<dyn Subscription>>,
    item: Option<T>,
    terminal: Option<Terminal>,
    done: bool,
    requested: bool,
    waker: Option<Waker>,
}

struct Shared<T> {
    inner: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn wake(state: &mut State<T>) {
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Shared<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let mut state = self.inner.lock().unwrap();
        state.subscription = Some(subscription);
        Self::wake(&mut state);
    }

    fn on_next(&self, item: T) {
        let mut state = self.inner.lock().unwrap();
        state.item = Some(item);
        state.requested = false;
        Self::wake(&mut state);
    }

    fn on_complete(&self) {
        let mut state = self.inner.lock().unwrap();
        state.terminal = Some(Terminal::Complete);
        Self::wake(&mut state);
    }

    fn on_error(&self, fault: BridgeError) {
        let mut state = self.inner.lock().unwrap();
        state.terminal = Some(Terminal::Failed(fault));
        Self::wake(&mut state);
    }
}

/// Pulls a [`Source`] one element of demand per poll.
///
/// Dropping the stream cancels the subscription, so an abandoned consumer
/// releases the transport side instead of wedging it.
pub struct FlowStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> FlowStream<T> {
    pub fn new(source: Box<dyn Source<T>>) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(State {
                subscription: None,
                item: None,
                terminal: None,
                done: false,
                requested: false,
                waker: None,
            }),
        });
        source.subscribe(shared.clone());
        FlowStream { shared }
    }
}

impl<T: Send + 'static> Stream for FlowStream<T> {
    type Item = Result<T, BridgeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.shared.inner.lock().unwrap();
        loop {
            if let Some(item) = state.item.take() {
                return Poll::Ready(Some(Ok(item)));
            }
            if state.done {
                return Poll::Ready(None);
            }
            if let Some(terminal) = state.terminal.take() {
                state.done = true;
                return match terminal {
                    Terminal::Complete => Poll::Ready(None),
                    Terminal::Failed(fault) => Poll::Ready(Some(Err(fault))),
                };
            }
            state.waker = Some(cx.waker().clone());
            if !state.requested {
                if let Some(subscription) = state.subscription.clone() {
                    state.requested = true;
                    drop(state);
                    subscription.request(1);
                    // a synchronous producer may already have delivered
                    state = self.shared.inner.lock().unwrap();
                    continue;
                }
            }
            return Poll::Pending;
        }
    }
}

impl<T> Drop for FlowStream<T> {
    fn drop(&mut self) {
        let mut state = self.shared.inner.lock().unwrap();
        let subscription = state.subscription.take();
        let live = !state.done && state.terminal.is_none();
        state.done = true;
        drop(state);
        if let (Some(subscription), true) = (subscription, live) {
            subscription.cancel();
        }
    }
}
