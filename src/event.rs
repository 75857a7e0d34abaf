//! Recognition events and their message encoding.
//!
//! Every event leaves the bridge as a `(target, handler, payload)` triple. The
//! handler names follow the engine-side convention of `On<Event>` methods on
//! the target object.

use std::fmt;

pub const ON_AUTHORIZED: &str = "OnAuthorized";
pub const ON_UNAUTHORIZED: &str = "OnUnauthorized";
pub const ON_AVAILABLE: &str = "OnAvailable";
pub const ON_UNAVAILABLE: &str = "OnUnavailable";
pub const ON_RECOGNIZED: &str = "OnRecognized";
pub const ON_ERROR: &str = "OnError";
pub const ON_COMPLETED: &str = "OnCompleted";

/// An event produced by the session controller for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Authorized,
    Unauthorized,
    Available,
    Unavailable,
    /// Current best transcription of the active session.
    Recognized { text: String },
    Error { description: String },
    /// The recognition task finished without an error.
    Completed,
}

impl RecognitionEvent {
    /// Handler (method) name the event is delivered to.
    pub fn handler_name(&self) -> &'static str {
        match self {
            RecognitionEvent::Authorized => ON_AUTHORIZED,
            RecognitionEvent::Unauthorized => ON_UNAUTHORIZED,
            RecognitionEvent::Available => ON_AVAILABLE,
            RecognitionEvent::Unavailable => ON_UNAVAILABLE,
            RecognitionEvent::Recognized { .. } => ON_RECOGNIZED,
            RecognitionEvent::Error { .. } => ON_ERROR,
            RecognitionEvent::Completed => ON_COMPLETED,
        }
    }

    /// String payload carried with the event. Empty for unit events.
    pub fn payload(&self) -> &str {
        match self {
            RecognitionEvent::Recognized { text } => text,
            RecognitionEvent::Error { description } => description,
            _ => "",
        }
    }

    /// Decodes a relayed message back into an event.
    ///
    /// Returns `None` for handler names the bridge never emits.
    pub fn from_message(handler: &str, payload: &str) -> Option<Self> {
        let event = match handler {
            ON_AUTHORIZED => RecognitionEvent::Authorized,
            ON_UNAUTHORIZED => RecognitionEvent::Unauthorized,
            ON_AVAILABLE => RecognitionEvent::Available,
            ON_UNAVAILABLE => RecognitionEvent::Unavailable,
            ON_RECOGNIZED => RecognitionEvent::Recognized {
                text: payload.to_string(),
            },
            ON_ERROR => RecognitionEvent::Error {
                description: payload.to_string(),
            },
            ON_COMPLETED => RecognitionEvent::Completed,
            _ => return None,
        };
        Some(event)
    }

    /// True for events that end a recognition session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecognitionEvent::Error { .. } | RecognitionEvent::Completed
        )
    }
}

impl fmt::Display for RecognitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload() {
            "" => write!(f, "{}", self.handler_name()),
            payload => write!(f, "{}({:?})", self.handler_name(), payload),
        }
    }
}
