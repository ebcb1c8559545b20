use std::sync::{Mutex, Weak};

use crate::call::RelayCore;
use crate::{BridgeError, CallId};

/// Lifecycle of one stream direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionState {
    Unopened,
    Active,
    HalfClosed,
    Completed,
    Errored,
}

/// One direction's state machine.
///
/// Adapters report transitions here; an error fans out to the paired
/// direction through the owning relay. Transitions that are not legal for
/// the current state are ignored, so reporting is idempotent.
pub struct DirectionCell {
    call: CallId,
    label: &'static str,
    state: Mutex<DirectionState>,
    relay: Weak<RelayCore>,
}

impl DirectionCell {
    /// A cell with no owning relay, for adapters wired outside a
    /// [`CallRelay`](crate::call::CallRelay).
    pub fn detached(label: &'static str) -> std::sync::Arc<Self> {
        Self::for_call(CallId::new(), label, Weak::new())
    }

    pub(crate) fn for_call(
        call: CallId,
        label: &'static str,
        relay: Weak<RelayCore>,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(DirectionCell {
            call,
            label,
            state: Mutex::new(DirectionState::Unopened),
            relay,
        })
    }

    pub fn call(&self) -> CallId {
        self.call
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn state(&self) -> DirectionState {
        *self.state.lock().unwrap()
    }

    /// First demand-request (inbound) or first element pulled (outbound).
    pub fn activate(&self) {
        self.advance(DirectionState::Active);
    }

    /// The local or remote sending side finished.
    pub fn half_closed(&self) {
        self.advance(DirectionState::HalfClosed);
    }

    /// Natural completion with no pending undelivered work.
    pub fn completed(&self) {
        self.advance(DirectionState::Completed);
    }

    /// Terminal failure. Cancels the paired direction exactly once via the
    /// owning relay.
    pub fn errored(&self, fault: &BridgeError) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, DirectionState::Completed | DirectionState::Errored) {
                return;
            }
            *state = DirectionState::Errored;
        }
        tracing::warn!(call = %self.call, direction = self.label, %fault, "direction errored");
        if let Some(core) = self.relay.upgrade() {
            core.fault_from(self.label);
        }
    }

    fn advance(&self, next: DirectionState) {
        let mut state = self.state.lock().unwrap();
        let legal = matches!(
            (*state, next),
            (DirectionState::Unopened, DirectionState::Active)
                | (DirectionState::Active, DirectionState::HalfClosed)
                | (DirectionState::Active, DirectionState::Completed)
                | (DirectionState::HalfClosed, DirectionState::Completed)
        );
        if !legal {
            return;
        }
        *state = next;
        drop(state);
        tracing::debug!(call = %self.call, direction = self.label, state = ?next, "direction state");
    }
}

impl std::fmt::Display for DirectionCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.call, self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_lifecycle_walks_forward() {
        let cell = DirectionCell::detached("outbound");
        assert_eq!(cell.state(), DirectionState::Unopened);
        cell.activate();
        cell.half_closed();
        cell.completed();
        assert_eq!(cell.state(), DirectionState::Completed);
    }

    #[test]
    fn completion_without_half_close_is_legal() {
        let cell = DirectionCell::detached("inbound");
        cell.activate();
        cell.completed();
        assert_eq!(cell.state(), DirectionState::Completed);
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let cell = DirectionCell::detached("inbound");
        cell.half_closed();
        assert_eq!(cell.state(), DirectionState::Unopened);
        cell.activate();
        cell.completed();
        cell.activate();
        assert_eq!(cell.state(), DirectionState::Completed);
    }

    #[test]
    fn errored_is_terminal() {
        let cell = DirectionCell::detached("inbound");
        cell.activate();
        cell.errored(&BridgeError::Cancelled);
        assert_eq!(cell.state(), DirectionState::Errored);
        cell.completed();
        assert_eq!(cell.state(), DirectionState::Errored);
    }

    #[test]
    fn completed_direction_cannot_error() {
        let cell = DirectionCell::detached("outbound");
        cell.activate();
        cell.completed();
        cell.errored(&BridgeError::Cancelled);
        assert_eq!(cell.state(), DirectionState::Completed);
    }
}
