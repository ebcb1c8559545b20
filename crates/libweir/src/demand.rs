//! Outstanding-demand bookkeeping for one stream direction.

use crate::reactive::UNBOUNDED;
use crate::BridgeError;

/// Tracks how many elements a consumer has authorized but not yet received.
///
/// The ledger is plain data; its owner guards it with the same lock that
/// covers the buffered-element slot, so a demand update and the resulting
/// deliver-or-pause decision happen in one critical section.
#[derive(Debug, Default)]
pub struct DemandLedger {
    outstanding: u64,
    unbounded: bool,
    exhausted: bool,
    terminated: bool,
}

impl DemandLedger {
    pub fn new() -> Self {
        DemandLedger::default()
    }

    /// Adds `n` to outstanding demand, saturating. The [`UNBOUNDED`]
    /// sentinel switches the ledger to unbounded mode. No-op once
    /// terminated.
    pub fn request_more(&mut self, n: u64) {
        if self.terminated {
            return;
        }
        if n == UNBOUNDED {
            self.unbounded = true;
        } else {
            self.outstanding = self.outstanding.saturating_add(n);
        }
    }

    /// Accounts for one element delivered to the consumer.
    ///
    /// Delivery without outstanding demand, or after termination, means a
    /// producer emitted without authorization.
    pub fn consume_one(&mut self) -> Result<(), BridgeError> {
        if self.terminated {
            return Err(BridgeError::Protocol(
                "element delivered after termination".into(),
            ));
        }
        if self.unbounded {
            return Ok(());
        }
        if self.outstanding == 0 {
            return Err(BridgeError::Protocol(
                "element delivered without outstanding demand".into(),
            ));
        }
        self.outstanding -= 1;
        Ok(())
    }

    pub fn outstanding(&self) -> u64 {
        if self.unbounded {
            UNBOUNDED
        } else {
            self.outstanding
        }
    }

    pub fn has_demand(&self) -> bool {
        self.unbounded || self.outstanding > 0
    }

    /// Records that the producing side has no further elements.
    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Marks the direction completed or errored. Idempotent.
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_without_demand_is_a_protocol_violation() {
        let mut ledger = DemandLedger::new();
        let err = ledger.consume_one().unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn request_then_consume_balances() {
        let mut ledger = DemandLedger::new();
        ledger.request_more(2);
        assert_eq!(ledger.outstanding(), 2);
        ledger.consume_one().unwrap();
        ledger.consume_one().unwrap();
        assert!(!ledger.has_demand());
        assert!(ledger.consume_one().is_err());
    }

    #[test]
    fn unbounded_demand_never_drains() {
        let mut ledger = DemandLedger::new();
        ledger.request_more(UNBOUNDED);
        for _ in 0..1000 {
            ledger.consume_one().unwrap();
        }
        assert_eq!(ledger.outstanding(), UNBOUNDED);
    }

    #[test]
    fn demand_saturates_instead_of_wrapping() {
        let mut ledger = DemandLedger::new();
        ledger.request_more(u64::MAX - 1);
        ledger.request_more(u64::MAX - 1);
        assert_eq!(ledger.outstanding(), u64::MAX);
        ledger.consume_one().unwrap();
    }

    #[test]
    fn terminate_is_idempotent_and_final() {
        let mut ledger = DemandLedger::new();
        ledger.request_more(5);
        ledger.terminate();
        ledger.terminate();
        assert!(ledger.is_terminated());
        ledger.request_more(3);
        assert!(ledger.consume_one().is_err());
    }
}
