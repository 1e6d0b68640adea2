//! Per-backend session state machine
//!
//! `Disconnected -> Locked -> Unlocked`, with `Disconnected` reachable from
//! every state. The machine only validates transitions; PIN checks and
//! device calls are driven by the coordinator.

use crate::error::SessionError;
use crate::types::{Backend, SessionState, SessionStatus};

/// Token handed out by [`SessionStateMachine::begin_unlock`]. An unlock
/// may only complete while the session epoch it captured is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockTicket {
    epoch: u64,
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    backend: Backend,
    state: SessionState,
    /// Bumped on disconnect and reset
    epoch: u64,
}

impl SessionStateMachine {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: SessionState::default(),
            epoch: 0,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.status == SessionStatus::Unlocked
    }

    /// Result of a `connect()` probe. A backend without a wallet stays
    /// `Disconnected` with `has_wallet = false` (awaiting setup).
    pub fn connected(&mut self, has_wallet: bool) {
        self.state.has_wallet = has_wallet;
        if !has_wallet {
            self.state.status = SessionStatus::Disconnected;
        } else if self.state.status == SessionStatus::Disconnected {
            self.state.status = SessionStatus::Locked;
        }
    }

    pub fn begin_unlock(&self) -> Result<UnlockTicket, SessionError> {
        match self.state.status {
            SessionStatus::Locked | SessionStatus::Unlocked => Ok(UnlockTicket { epoch: self.epoch }),
            SessionStatus::Disconnected if !self.state.has_wallet => {
                Err(SessionError::NotSetUp(self.backend))
            }
            SessionStatus::Disconnected => Err(SessionError::InvalidState(format!(
                "{} backend is not connected",
                self.backend
            ))),
        }
    }

    /// Enters `Unlocked`. A lock fired by the idle timer while the unlock
    /// was in flight does not invalidate the ticket; a disconnect does.
    pub fn complete_unlock(&mut self, ticket: UnlockTicket) -> Result<(), SessionError> {
        if ticket.epoch != self.epoch {
            return Err(SessionError::InvalidState(format!(
                "{} session was disconnected while unlocking",
                self.backend
            )));
        }
        self.state.status = SessionStatus::Unlocked;
        Ok(())
    }

    /// Unlocked -> Locked. Returns whether anything changed.
    pub fn lock(&mut self) -> bool {
        if self.state.status == SessionStatus::Unlocked {
            self.state.status = SessionStatus::Locked;
            true
        } else {
            false
        }
    }

    pub fn disconnect(&mut self) -> SessionStatus {
        let previous = self.state.status;
        self.state.status = SessionStatus::Disconnected;
        self.epoch += 1;
        previous
    }

    /// A wallet was just created or imported with a PIN: the backend is
    /// set up and unlocked in one step.
    pub fn setup_completed(&mut self) {
        self.state = SessionState {
            status: SessionStatus::Unlocked,
            has_wallet: true,
        };
    }

    /// Wallet destroyed or quarantined: back to awaiting setup.
    pub fn reset(&mut self) {
        self.state = SessionState::default();
        self.epoch += 1;
    }

    pub fn require_unlocked(&self) -> Result<(), SessionError> {
        match self.state.status {
            SessionStatus::Unlocked => Ok(()),
            SessionStatus::Locked => Err(SessionError::InvalidState(format!(
                "{} backend is locked",
                self.backend
            ))),
            SessionStatus::Disconnected if !self.state.has_wallet => {
                Err(SessionError::NotSetUp(self.backend))
            }
            SessionStatus::Disconnected => Err(SessionError::InvalidState(format!(
                "{} backend is not connected",
                self.backend
            ))),
        }
    }
}
