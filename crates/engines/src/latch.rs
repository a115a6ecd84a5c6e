use parking_lot::Mutex;
use tracing::*;

use crate::errors::{EngineError, EngineResult};

/// An adapter's sticky fatal-error state.
///
/// The first latching error is kept as a message; while engaged, mutating
/// API calls and background passes short-circuit.  There is no automatic
/// retry: only an operator clears the latch.
#[derive(Default)]
pub struct FaultLatch {
    slot: Mutex<Option<String>>,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors with the stored fault if the latch is engaged.
    pub fn check(&self) -> EngineResult<()> {
        match &*self.slot.lock() {
            Some(msg) => Err(EngineError::Faulted(msg.clone())),
            None => Ok(()),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn message(&self) -> Option<String> {
        self.slot.lock().clone()
    }

    pub fn engage(&self, err: &EngineError) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            warn!(%err, "engaging adapter fault latch");
            *slot = Some(err.to_string());
        }
    }

    /// Operator reset; returns whether a fault was present.
    pub fn clear(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            info!("adapter fault latch cleared");
        }
        slot.take().is_some()
    }

    /// Passes a result through, engaging the latch on latching errors.
    pub fn absorb<T>(&self, res: EngineResult<T>) -> EngineResult<T> {
        if let Err(err) = &res {
            if err.is_latching() {
                self.engage(err);
            }
        }
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn latch_keeps_first_fault_until_cleared() {
        let latch = FaultLatch::new();
        assert!(latch.check().is_ok());

        latch.engage(&EngineError::Fault("first".into()));
        latch.engage(&EngineError::Fault("second".into()));
        assert!(latch.is_engaged());
        let msg = latch.message().unwrap();
        assert!(msg.contains("first"), "later faults must not overwrite: {msg}");
        assert!(matches!(latch.check(), Err(EngineError::Faulted(_))));

        assert!(latch.clear());
        assert!(!latch.clear());
        assert!(latch.check().is_ok());
    }

    #[test]
    fn absorb_latches_only_latching_kinds() {
        let latch = FaultLatch::new();
        let res: EngineResult<()> = Err(EngineError::InvalidInput("nope".into()));
        assert!(latch.absorb(res).is_err());
        assert!(!latch.is_engaged(), "input validation must not latch");

        let res: EngineResult<()> = Err(EngineError::Fault("broken books".into()));
        assert!(latch.absorb(res).is_err());
        assert!(latch.is_engaged());
    }
}
