//! Per-branch transaction state

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

use super::Xid;
use crate::error::{ProxyError, XaErrorCode};
use crate::types::SessionId;

/// Where a branch is in the two-phase protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxState {
    NonExistent,
    Active,
    Ended,
    Prepared,
    Committed,
    RolledBack,
    /// Prepare failed; outcome unknown until an operator reconciles it
    Indeterminate,
}

impl TxState {
    /// Committed and rolled-back branches accept no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TxState::{Active, Committed, Ended, Indeterminate, NonExistent, Prepared, RolledBack};
        matches!(
            (self, next),
            (NonExistent, Active)
                | (Active, Ended | RolledBack)
                | (Ended, Active | Prepared | Committed | RolledBack | Indeterminate)
                | (Prepared, Committed | RolledBack)
                | (Indeterminate, RolledBack)
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NonExistent => "NONEXISTENT",
            Self::Active => "ACTIVE",
            Self::Ended => "ENDED",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLEDBACK",
            Self::Indeterminate => "INDETERMINATE",
        })
    }
}

/// State of one XA branch known to a node
#[derive(Debug, Clone)]
pub struct TxContext {
    pub xid: Xid,
    pub state: TxState,
    /// Session whose backend connection runs the branch
    pub owner: SessionId,
    /// Times the branch has been joined or resumed
    pub associations: u32,
    /// Ended with TMFAIL; only rollback is accepted
    pub rollback_only: bool,
    pub started_at: Instant,
}

impl TxContext {
    pub fn new(xid: Xid, owner: SessionId) -> Self {
        Self {
            xid,
            state: TxState::NonExistent,
            owner,
            associations: 0,
            rollback_only: false,
            started_at: Instant::now(),
        }
    }

    /// Move to `next`, rejecting transitions the protocol does not allow
    ///
    /// # Errors
    ///
    /// `XAER_PROTO` when the transition is not allowed from the current state.
    pub fn transition(&mut self, next: TxState) -> Result<(), ProxyError> {
        if !self.state.can_transition_to(next) {
            return Err(ProxyError::xa(
                XaErrorCode::Proto,
                format!("branch {} cannot move from {} to {}", self.xid, self.state, next),
            ));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TxContext {
        TxContext::new(Xid::new(1, b"g".to_vec(), b"b".to_vec()), SessionId::new())
    }

    #[test]
    fn test_two_phase_path() {
        let mut c = ctx();
        c.transition(TxState::Active).unwrap();
        c.transition(TxState::Ended).unwrap();
        c.transition(TxState::Prepared).unwrap();
        c.transition(TxState::Committed).unwrap();
        assert!(c.state.is_terminal());
    }

    #[test]
    fn test_one_phase_from_ended() {
        let mut c = ctx();
        c.transition(TxState::Active).unwrap();
        c.transition(TxState::Ended).unwrap();
        c.transition(TxState::Committed).unwrap();
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut c = ctx();
        c.transition(TxState::Active).unwrap();
        c.transition(TxState::RolledBack).unwrap();
        let err = c.transition(TxState::Active).unwrap_err();
        assert_eq!(err.xa_code(), Some(XaErrorCode::Proto));
        assert_eq!(c.state, TxState::RolledBack);
    }

    #[test]
    fn test_cannot_commit_active_branch() {
        let mut c = ctx();
        c.transition(TxState::Active).unwrap();
        assert!(c.transition(TxState::Committed).is_err());
        assert!(c.transition(TxState::Prepared).is_err());
    }

    #[test]
    fn test_indeterminate_can_only_roll_back() {
        let mut c = ctx();
        c.transition(TxState::Active).unwrap();
        c.transition(TxState::Ended).unwrap();
        c.transition(TxState::Indeterminate).unwrap();
        assert!(c.transition(TxState::Committed).is_err());
        c.transition(TxState::RolledBack).unwrap();
    }
}
