//! unispeech - native speech-to-text bridge for game engine scripting layers.
//!
//! A [`SessionController`] streams microphone audio into the platform speech
//! recognizer and relays authorization, availability, transcript and error
//! events to the host as `(target, handler, payload)` messages.

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod ffi;
pub mod relay;
pub mod speech;
pub mod state;

pub use config::{BridgeConfig, CompletionPolicy};
pub use controller::SessionController;
pub use error::{Result, SpeechError};
pub use event::RecognitionEvent;
pub use relay::{ChannelRelay, MessageRelay, RelayedMessage, TracingRelay};
pub use speech::{AuthorizationStatus, SpeechBackend, TaskReport};
pub use state::SessionState;
