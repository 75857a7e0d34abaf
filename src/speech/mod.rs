//! Speech recognition backends with platform-specific implementations.
//!
//! - macOS / iOS: native Speech framework via objc2-speech
//! - Windows: native Windows.Media.SpeechRecognition API
//! - Linux: Vosk offline speech recognition (`vosk` feature)
//! - Other platforms: mock implementation replaying a demo phrase

use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::error::Result;

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod apple;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(all(target_os = "linux", feature = "vosk"))]
mod vosk;

pub mod mock;

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use self::apple::AppleSpeechBackend;

#[cfg(target_os = "windows")]
pub use self::windows::WindowsSpeechBackend;

#[cfg(all(target_os = "linux", feature = "vosk"))]
pub use self::vosk::VoskSpeechBackend;

pub use mock::{BackendCall, MockBackend, MockHandle};

/// Speech permission state as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    NotDetermined,
    Denied,
    Restricted,
    Authorized,
}

impl AuthorizationStatus {
    /// Maps the raw `SFSpeechRecognizerAuthorizationStatus` value.
    pub fn from_raw(raw: isize) -> Self {
        match raw {
            1 => AuthorizationStatus::Denied,
            2 => AuthorizationStatus::Restricted,
            3 => AuthorizationStatus::Authorized,
            _ => AuthorizationStatus::NotDetermined,
        }
    }

    pub fn is_authorized(self) -> bool {
        self == AuthorizationStatus::Authorized
    }
}

/// Best transcription delivered by a recognition task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub text: String,
    pub is_final: bool,
}

/// One invocation of a recognition task's result handler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskReport {
    pub result: Option<RecognitionResult>,
    pub error: Option<String>,
}

impl TaskReport {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            result: Some(RecognitionResult {
                text: text.into(),
                is_final: false,
            }),
            error: None,
        }
    }

    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            result: Some(RecognitionResult {
                text: text.into(),
                is_final: true,
            }),
            error: None,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(description.into()),
        }
    }

    /// True when the task ends with this report.
    pub fn ends_task(&self) -> bool {
        self.error.is_some() || self.result.as_ref().is_some_and(|r| r.is_final)
    }
}

/// Invoked by the backend, on any thread, for every task result or error.
pub type TaskHandler = Arc<dyn Fn(TaskReport) + Send + Sync>;

/// Invoked by the backend, on any thread, when recognizer availability changes.
pub type AvailabilityHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Invoked once with the outcome of an authorization request.
pub type AuthorizationReply = Box<dyn FnOnce(AuthorizationStatus) + Send>;

/// The OS speech stack as seen by the session controller: one capture
/// engine, at most one recognition request and one recognition task.
///
/// Backends are created and used on the controller's session thread only.
/// Callbacks they receive may be invoked from any thread.
pub trait SpeechBackend {
    fn name(&self) -> &str;

    /// Asks the OS for speech and microphone permission.
    fn request_authorization(&self, reply: AuthorizationReply);

    fn set_availability_handler(&mut self, handler: AvailabilityHandler);

    /// Whether the capture engine is running.
    fn is_running(&self) -> bool;

    /// Puts the platform audio session into recording mode.
    fn configure_audio_session(&mut self) -> Result<()>;

    /// Creates a fresh recognition request and begins a task on it.
    fn start_recognition(&mut self, partial_results: bool, handler: TaskHandler) -> Result<()>;

    /// Installs the input tap that streams captured buffers into the request.
    fn install_tap(&mut self, buffer_size: u32) -> Result<()>;

    /// Prepares and starts the capture engine.
    fn start_engine(&mut self) -> Result<()>;

    fn stop_engine(&mut self);

    fn remove_tap(&mut self);

    /// Signals end of audio to the recognition request.
    fn end_audio(&mut self);

    /// Cancels the recognition task. The task reports the cancellation
    /// through its handler.
    fn cancel_task(&mut self);

    /// Drops the request and task handles.
    fn release_request(&mut self);
}

/// Creates the native backend for the current platform.
pub fn platform_backend(config: &BridgeConfig) -> Result<Box<dyn SpeechBackend>> {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        Ok(Box::new(AppleSpeechBackend::new(config)?))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(WindowsSpeechBackend::new(config)?))
    }

    #[cfg(all(target_os = "linux", feature = "vosk"))]
    {
        Ok(Box::new(VoskSpeechBackend::new(config)?))
    }

    #[cfg(not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "windows",
        all(target_os = "linux", feature = "vosk")
    )))]
    {
        let _ = config;
        tracing::warn!("no native speech backend for this platform, using the demo backend");
        Ok(Box::new(MockBackend::demo()))
    }
}
