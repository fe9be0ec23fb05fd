//! Lifecycle state of a testnet handle.

use std::fmt;

use crate::error::{TestnetError, TestnetResult};

/// Where a [`Testnet`](crate::Testnet) is in its lifecycle.
///
/// ```text
/// Unconfigured -> GenesisGenerated -> Starting -> Healthy -> Bootstrapped
///      any state -> Failed(reason)
///      any state -> TornDown
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestnetState {
    Unconfigured,
    GenesisGenerated,
    Starting,
    Healthy,
    Bootstrapped,
    TornDown,
    Failed(String),
}

impl TestnetState {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: &TestnetState) -> bool {
        use TestnetState::*;
        match (self, next) {
            (TornDown, _) => false,
            (_, TornDown) | (_, Failed(_)) => true,
            (Unconfigured, GenesisGenerated)
            | (GenesisGenerated, Starting)
            | (Starting, Healthy)
            | (Healthy, Bootstrapped) => true,
            _ => false,
        }
    }

    /// Moves to `next`, rejecting transitions the state machine does not have.
    pub fn transition(&mut self, next: TestnetState) -> TestnetResult<()> {
        if !self.can_transition_to(&next) {
            return Err(TestnetError::InvalidState {
                operation: "change state",
                state: format!("{self} (requested {next})"),
            });
        }
        *self = next;
        Ok(())
    }

    /// Containers may be running in this state.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            TestnetState::Starting | TestnetState::Healthy | TestnetState::Bootstrapped
        )
    }
}

impl fmt::Display for TestnetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestnetState::Unconfigured => f.write_str("unconfigured"),
            TestnetState::GenesisGenerated => f.write_str("genesis-generated"),
            TestnetState::Starting => f.write_str("starting"),
            TestnetState::Healthy => f.write_str("healthy"),
            TestnetState::Bootstrapped => f.write_str("bootstrapped"),
            TestnetState::TornDown => f.write_str("torn-down"),
            TestnetState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = TestnetState::Unconfigured;
        for next in [
            TestnetState::GenesisGenerated,
            TestnetState::Starting,
            TestnetState::Healthy,
            TestnetState::Bootstrapped,
            TestnetState::TornDown,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state, TestnetState::TornDown);
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        let mut state = TestnetState::GenesisGenerated;
        assert!(state.transition(TestnetState::Healthy).is_err());

        let mut state = TestnetState::Healthy;
        assert!(state.transition(TestnetState::Starting).is_err());
        assert_eq!(state, TestnetState::Healthy);
    }

    #[test]
    fn test_failed_can_be_torn_down() {
        let mut state = TestnetState::Starting;
        state.transition(TestnetState::Failed("boom".to_string())).unwrap();
        assert!(!state.is_running());
        state.transition(TestnetState::TornDown).unwrap();
    }

    #[test]
    fn test_torn_down_is_terminal() {
        let mut state = TestnetState::TornDown;
        assert!(state.transition(TestnetState::Failed("late".to_string())).is_err());
        assert!(state.transition(TestnetState::Starting).is_err());
    }
}
