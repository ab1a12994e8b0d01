//! Lifecycle of an aggregate property's computed values.

use serde::Serialize;
use std::fmt;

/// ```text
/// Unconfigured --Configured--> Valid --Invalidated--> Stale
///                                ^                      |
///                                |                RecomputeStarted
///                                |                      v
///                                +--RecomputeFinished-- Recomputing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    Unconfigured,
    Valid,
    Stale,
    Recomputing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateEvent {
    /// Definition saved and values computed (or queued).
    Configured,
    /// A formula the target depends on changed meaning.
    Invalidated,
    RecomputeStarted,
    RecomputeFinished,
    /// Definition no longer valid (for example its tree was removed).
    Deconfigured,
}

impl AggregateState {
    /// Next state, or `None` when the event does not apply in this state.
    pub fn on(self, event: AggregateEvent) -> Option<AggregateState> {
        use AggregateEvent::*;
        use AggregateState::*;
        match (self, event) {
            (_, Deconfigured) => Some(Unconfigured),
            (Unconfigured, Configured) => Some(Valid),
            (Valid, Configured) => Some(Valid),
            (Valid | Stale, Invalidated) => Some(Stale),
            // work queued while a recompute is running leaves markers behind
            (Recomputing, Invalidated) => Some(Stale),
            (Stale | Valid, RecomputeStarted) => Some(Recomputing),
            (Recomputing, RecomputeFinished) => Some(Valid),
            _ => None,
        }
    }

    pub fn is_current(&self) -> bool {
        matches!(self, AggregateState::Valid)
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateState::Unconfigured => "unconfigured",
            AggregateState::Valid => "valid",
            AggregateState::Stale => "stale",
            AggregateState::Recomputing => "recomputing",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let state = AggregateState::Unconfigured;
        let state = state.on(AggregateEvent::Configured).unwrap();
        assert_eq!(state, AggregateState::Valid);
        let state = state.on(AggregateEvent::Invalidated).unwrap();
        assert_eq!(state, AggregateState::Stale);
        let state = state.on(AggregateEvent::RecomputeStarted).unwrap();
        assert_eq!(state, AggregateState::Recomputing);
        let state = state.on(AggregateEvent::RecomputeFinished).unwrap();
        assert!(state.is_current());
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(AggregateState::Unconfigured.on(AggregateEvent::Invalidated), None);
        assert_eq!(AggregateState::Stale.on(AggregateEvent::RecomputeFinished), None);
        assert_eq!(
            AggregateState::Recomputing.on(AggregateEvent::Deconfigured),
            Some(AggregateState::Unconfigured)
        );
    }
}
