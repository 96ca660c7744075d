use core::fmt;

/// Ledger submission state of a batch.
///
/// Transitions only move forward (`Unsubmitted -> Submitted -> Confirmed`);
/// `Failed` is reachable from the two non-final states and may only be
/// retried back into `Unsubmitted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BatchState {
    Unsubmitted = 0,
    Submitted = 1,
    Confirmed = 2,
    Failed = 3,
}

impl BatchState {
    pub fn from_u8(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Unsubmitted),
            1 => Ok(Self::Submitted),
            2 => Ok(Self::Confirmed),
            3 => Ok(Self::Failed),
            _ => Err(format!("invalid batch state byte: {v}")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Unsubmitted => "unsubmitted",
            BatchState::Submitted => "submitted",
            BatchState::Confirmed => "confirmed",
            BatchState::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: BatchState) -> bool {
        matches!(
            (self, next),
            (BatchState::Unsubmitted, BatchState::Submitted)
                | (BatchState::Unsubmitted, BatchState::Failed)
                | (BatchState::Submitted, BatchState::Confirmed)
                | (BatchState::Submitted, BatchState::Failed)
                | (BatchState::Failed, BatchState::Unsubmitted)
        )
    }

    /// Batches the reconciler still has to chase on the ledger.
    pub fn is_unconfirmed(self) -> bool {
        matches!(self, BatchState::Submitted | BatchState::Failed)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsubmitted" => Ok(Self::Unsubmitted),
            "submitted" => Ok(Self::Submitted),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown batch state: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Kani bounded model checking proofs
// ---------------------------------------------------------------------------
#[cfg(kani)]
mod verification {
    use super::*;

    /// Every state byte either decodes and re-encodes to itself or is rejected.
    #[kani::proof]
    fn verify_state_byte_roundtrip() {
        let v: u8 = kani::any();
        if let Ok(state) = BatchState::from_u8(v) {
            assert_eq!(state as u8, v);
        }
    }

    /// Confirmed is final, and only Failed may step back to Unsubmitted.
    #[kani::proof]
    fn verify_transitions_monotonic() {
        let a = BatchState::from_u8(kani::any::<u8>() % 4);
        let b = BatchState::from_u8(kani::any::<u8>() % 4);
        if let (Ok(from), Ok(to)) = (a, b) {
            if from.can_transition_to(to) {
                assert!(from != BatchState::Confirmed);
                assert!(to as u8 > from as u8 || from == BatchState::Failed || to == BatchState::Failed);
                if to == BatchState::Unsubmitted {
                    assert_eq!(from, BatchState::Failed);
                }
            }
        }
    }
}
