use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use tokio::sync::Notify;

use crate::reactive::{Source, Subscriber, Subscription, UNBOUNDED};

/// Publishes a [`futures::Stream`] as a demand-driven [`Source`].
///
/// Subscribing spawns a pump task that polls the stream only while the
/// subscriber has demand outstanding, one element per unit. Requires a
/// tokio runtime.
pub struct TaskSource<S> {
    stream: S,
}

impl<S> TaskSource<S> {
    pub fn new(stream: S) -> Self {
        TaskSource { stream }
    }
}

struct PumpState {
    demand: Mutex<u64>,
    cancelled: AtomicBool,
    notify: Notify,
}

struct PumpHandle {
    state: Arc<PumpState>,
}

impl Subscription for PumpHandle {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        {
            let mut demand = self.state.demand.lock().unwrap();
            *demand = if n == UNBOUNDED || *demand == UNBOUNDED {
                UNBOUNDED
            } else {
                demand.saturating_add(n)
            };
        }
        self.state.notify.notify_one();
    }

    fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_one();
    }
}

impl<S, T> Source<T> for TaskSource<S>
where
    S: Stream<Item = T> + Send + Unpin + 'static,
    T: Send + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let state = Arc::new(PumpState {
            demand: Mutex::new(0),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        });
        subscriber.on_subscribe(Arc::new(PumpHandle {
            state: state.clone(),
        }));

        let mut stream = self.stream;
        tokio::spawn(async move {
            loop {
                // park until the subscriber authorizes the next element
                loop {
                    if state.cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    {
                        let mut demand = state.demand.lock().unwrap();
                        if *demand > 0 {
                            if *demand != UNBOUNDED {
                                *demand -= 1;
                            }
                            break;
                        }
                    }
                    state.notify.notified().await;
                }
                match stream.next().await {
                    Some(item) => subscriber.on_next(item),
                    None => {
                        subscriber.on_complete();
                        return;
                    }
                }
            }
        });
    }
}
