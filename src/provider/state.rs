//! Provider lifecycle states and the allowed-transition table.

use crate::error::HangarError;

/// Lifecycle state of a managed provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderState {
    /// No process; nothing has been started (or it was shut down cleanly).
    Cold,
    /// Spawn + handshake in progress.
    Initializing,
    /// Handshake complete, catalog populated, client live.
    Ready,
    /// Consecutive failures reached the threshold; backoff gates restarts.
    Degraded,
    /// The process died or failed to start below the degradation threshold.
    Dead,
}

impl ProviderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderState::Cold => "cold",
            ProviderState::Initializing => "initializing",
            ProviderState::Ready => "ready",
            ProviderState::Degraded => "degraded",
            ProviderState::Dead => "dead",
        }
    }

    /// Whether the lifecycle table allows `self -> to`.
    ///
    /// Self-transitions are not listed here; callers treat them as no-ops.
    pub fn can_transition_to(&self, to: ProviderState) -> bool {
        use ProviderState::*;
        matches!(
            (self, to),
            (Cold, Initializing)
                | (Initializing, Ready)
                | (Initializing, Dead)
                | (Initializing, Degraded)
                | (Ready, Cold)
                | (Ready, Dead)
                | (Ready, Degraded)
                | (Degraded, Initializing)
                | (Degraded, Cold)
                | (Dead, Initializing)
                | (Dead, Degraded)
        )
    }

    /// Parse a state-filter string from the query surface.
    pub fn parse(s: &str) -> Option<ProviderState> {
        match s {
            "cold" => Some(ProviderState::Cold),
            "initializing" => Some(ProviderState::Initializing),
            "ready" => Some(ProviderState::Ready),
            "degraded" => Some(ProviderState::Degraded),
            "dead" => Some(ProviderState::Dead),
            _ => None,
        }
    }
}

/// Validate a transition, producing the domain error on violation.
pub fn check_transition(
    provider: &str,
    from: ProviderState,
    to: ProviderState,
) -> crate::Result<()> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(HangarError::InvalidStateTransition {
            provider: provider.to_string(),
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProviderState::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Cold.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Ready));
        assert!(Initializing.can_transition_to(Dead));
        assert!(Initializing.can_transition_to(Degraded));
        assert!(Ready.can_transition_to(Cold));
        assert!(Ready.can_transition_to(Dead));
        assert!(Ready.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Initializing));
        assert!(Degraded.can_transition_to(Cold));
        assert!(Dead.can_transition_to(Initializing));
        assert!(Dead.can_transition_to(Degraded));
    }

    #[test]
    fn test_forbidden_transitions() {
        assert!(!Cold.can_transition_to(Ready));
        assert!(!Cold.can_transition_to(Dead));
        assert!(!Cold.can_transition_to(Degraded));
        assert!(!Ready.can_transition_to(Initializing));
        assert!(!Degraded.can_transition_to(Ready));
        assert!(!Degraded.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Ready));
        assert!(!Dead.can_transition_to(Cold));
        assert!(!Initializing.can_transition_to(Cold));
    }

    #[test]
    fn test_self_transition_is_noop_not_error() {
        assert!(check_transition("p", Ready, Ready).is_ok());
        assert!(check_transition("p", Cold, Cold).is_ok());
    }

    #[test]
    fn test_check_transition_error_carries_states() {
        let err = check_transition("math", Cold, Ready).unwrap_err();
        match err {
            HangarError::InvalidStateTransition { provider, from, to } => {
                assert_eq!(provider, "math");
                assert_eq!(from, "cold");
                assert_eq!(to, "ready");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_round_trips() {
        for state in [Cold, Initializing, Ready, Degraded, Dead] {
            assert_eq!(ProviderState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ProviderState::parse("warm"), None);
    }
}
