//! Session state machine.
//!
//! Valid transitions:
//! - AwaitingInput -> Formatting (user text appended)
//! - AwaitingInput -> Terminated (exit command or end of input)
//! - Formatting -> Generating (submission slice computed)
//! - Formatting -> AwaitingInput (template failure)
//! - Generating -> Responding (reply accepted)
//! - Generating -> AwaitingInput (encode failure or reply discarded)
//! - Responding -> AwaitingInput (reply recorded)
//!
//! `Terminated` is absorbing.

use std::fmt;

use crate::error::ChatError;

/// Phase of the turn-taking loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the operator's next line.
    AwaitingInput,
    /// Rendering the history and computing the submission slice.
    Formatting,
    /// Driving the engine.
    Generating,
    /// Recording the reply and moving the cursor.
    Responding,
    /// No further turns are processed.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::AwaitingInput => write!(f, "AwaitingInput"),
            SessionState::Formatting => write!(f, "Formatting"),
            SessionState::Generating => write!(f, "Generating"),
            SessionState::Responding => write!(f, "Responding"),
            SessionState::Terminated => write!(f, "Terminated"),
        }
    }
}

impl SessionState {
    /// Returns whether a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::AwaitingInput, SessionState::Formatting)
                | (SessionState::AwaitingInput, SessionState::Terminated)
                | (SessionState::Formatting, SessionState::Generating)
                | (SessionState::Generating, SessionState::Responding)
                | (SessionState::Responding, SessionState::AwaitingInput)
                // Abort transitions
                | (SessionState::Formatting, SessionState::AwaitingInput)
                | (SessionState::Generating, SessionState::AwaitingInput)
        )
    }
}

/// Owned state machine; the session is single-threaded, so no locking.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine waiting for input.
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingInput,
        }
    }

    pub fn current(&self) -> SessionState {
        self.state
    }

    /// Attempt to transition to the target state.
    ///
    /// Leaves the state untouched and returns `ChatError::SessionClosed` from
    /// `Terminated`, or `ChatError::Engine` for any other invalid transition.
    pub fn transition(&mut self, target: SessionState) -> Result<(), ChatError> {
        if self.state.can_transition_to(&target) {
            tracing::trace!("Session state: {} -> {}", self.state, target);
            self.state = target;
            Ok(())
        } else if self.state == SessionState::Terminated {
            Err(ChatError::SessionClosed)
        } else {
            Err(ChatError::Engine(format!(
                "invalid session transition: {} -> {}",
                self.state, target
            )))
        }
    }

    /// Return to `AwaitingInput` after an aborted turn. `Terminated` stays put.
    pub fn reset(&mut self) {
        if self.state != SessionState::Terminated {
            self.state = SessionState::AwaitingInput;
        }
    }
}
