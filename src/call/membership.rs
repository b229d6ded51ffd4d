use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, Result};

/// Local participant's membership in a room
///
/// ```text
/// Idle --join--> Joining --subscribed--> Joined --leave--> Left
///                  |  \                                      |
///                  |   `--leave--> Left <----------- rejoin -'
///                  `--media/subscribe failure--> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    #[default]
    Idle,
    Joining,
    Joined,
    Left,
}

impl MembershipState {
    pub fn can_transition_to(self, next: MembershipState) -> bool {
        use MembershipState::*;
        matches!(
            (self, next),
            (Idle, Joining)
                | (Left, Joining)
                | (Joining, Joined)
                | (Joining, Idle)
                | (Joining, Left)
                | (Joined, Left)
        )
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: MembershipState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "cannot go from {} to {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_joined(self) -> bool {
        self == MembershipState::Joined
    }

    /// Joining or joined
    pub fn is_active(self) -> bool {
        matches!(self, MembershipState::Joining | MembershipState::Joined)
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipState::Idle => write!(f, "idle"),
            MembershipState::Joining => write!(f, "joining"),
            MembershipState::Joined => write!(f, "joined"),
            MembershipState::Left => write!(f, "left"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = MembershipState::default();
        state.transition(MembershipState::Joining).unwrap();
        state.transition(MembershipState::Joined).unwrap();
        assert!(state.is_joined());
        state.transition(MembershipState::Left).unwrap();
        state.transition(MembershipState::Joining).unwrap();
        assert!(state.is_active());
    }

    #[test]
    fn test_rejected_transitions() {
        let mut state = MembershipState::Idle;
        assert!(state.transition(MembershipState::Joined).is_err());
        assert_eq!(state, MembershipState::Idle);
        assert!(!MembershipState::Joined.can_transition_to(MembershipState::Joining));
        assert!(!MembershipState::Left.can_transition_to(MembershipState::Left));
    }
}
