//! Recording session state machine.
//!
//! Valid transitions:
//! - Idle -> Starting (start requested)
//! - Starting -> Listening (engine running, task in flight)
//! - Starting -> Idle (start failed, partial session torn down)
//! - Listening -> Stopping (stop requested, or the task reported its final result)
//! - Listening -> Erroring (the task reported an error)
//! - Stopping -> Erroring (error while waiting for the final result)
//! - Stopping -> Starting (restart before the previous task finished)
//! - Stopping -> Idle, Erroring -> Idle (session torn down)

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No capture engine, request or task.
    Idle,
    /// Building the audio session, request, tap and engine.
    Starting,
    /// Capturing audio and receiving results.
    Listening,
    /// Engine stopped and end of audio signalled; waiting for the final result.
    Stopping,
    /// Tearing down after a recognition error.
    Erroring,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Starting => write!(f, "Starting"),
            SessionState::Listening => write!(f, "Listening"),
            SessionState::Stopping => write!(f, "Stopping"),
            SessionState::Erroring => write!(f, "Erroring"),
        }
    }
}

impl SessionState {
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Idle, SessionState::Starting)
                | (SessionState::Starting, SessionState::Listening)
                | (SessionState::Starting, SessionState::Idle)
                | (SessionState::Listening, SessionState::Stopping)
                | (SessionState::Listening, SessionState::Erroring)
                | (SessionState::Stopping, SessionState::Erroring)
                | (SessionState::Stopping, SessionState::Starting)
                | (SessionState::Stopping, SessionState::Idle)
                | (SessionState::Erroring, SessionState::Idle)
        )
    }

    /// True while a capture engine may be running or a task is in flight.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}
