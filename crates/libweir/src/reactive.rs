//! The pull-based sequence contract the bridge adapts to and from.
//!
//! The bridge never implements application producers or consumers itself;
//! it depends only on these three traits. Signals on one subscription are
//! serialized by the caller: `on_next`/`on_complete`/`on_error` never
//! overlap for a single subscriber, though they may arrive from changing
//! threads.

use std::sync::Arc;

use crate::BridgeError;

/// Demand sentinel meaning "everything the producer has".
pub const UNBOUNDED: u64 = u64::MAX;

/// Demand and cancellation channel handed to a subscriber.
pub trait Subscription: Send + Sync {
    /// Authorizes `n` further elements. `n` must be at least 1;
    /// [`UNBOUNDED`] requests the rest of the sequence.
    fn request(&self, n: u64);

    /// Stops the sequence. After cancellation no further signals reach the
    /// subscriber.
    fn cancel(&self);
}

/// Consumer side of a sequence.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_complete(&self);
    fn on_error(&self, fault: BridgeError);
}

/// Producer side of a sequence. Emits to the subscriber only as demand is
/// requested through the subscription handed over in `on_subscribe`.
pub trait Source<T>: Send {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<T>>);
}
