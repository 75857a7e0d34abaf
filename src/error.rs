//! Error type shared by the controller, the speech backends and the C ABI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeechError {
    /// `start()` was called while a capture engine is running.
    #[error("a recording session is already running")]
    AlreadyRunning,

    /// `stop()` was called with no capture engine running.
    #[error("no recording session is running")]
    NotRunning,

    #[error("speech recognizer unavailable: {0}")]
    RecognizerUnavailable(String),

    #[error("audio session configuration failed: {0}")]
    AudioSession(String),

    #[error("recognition request failed: {0}")]
    Request(String),

    #[error("audio engine failed to start: {0}")]
    Engine(String),

    #[error("speech backend error: {0}")]
    Backend(String),

    #[error("target name must not be empty")]
    InvalidTargetName,

    /// The session thread has exited and no longer accepts commands.
    #[error("session controller has shut down")]
    ControllerClosed,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = SpeechError> = std::result::Result<T, E>;
