use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_TARGET_OBJECT: &str = "SpeechRecognizer";
pub const DEFAULT_BUFFER_SIZE: u32 = 1024;

/// What the controller emits when a task finishes without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Emit `OnCompleted`.
    #[default]
    Completed,
    /// Emit `OnError` with a `"nil"` description, as older engine-side
    /// scripts expect.
    LegacyError,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Engine object that receives every message.
    pub target_object: String,
    /// Recognizer locale identifier (e.g. `ja-JP`). `None` uses the current locale.
    pub locale: Option<String>,
    /// Audio tap buffer size in frames.
    pub buffer_size: u32,
    pub partial_results: bool,
    pub completion: CompletionPolicy,
    /// Vosk model directory (Linux backend only).
    pub vosk_model_path: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            target_object: DEFAULT_TARGET_OBJECT.to_string(),
            locale: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            partial_results: true,
            completion: CompletionPolicy::default(),
            vosk_model_path: None,
        }
    }
}

impl BridgeConfig {
    /// Loads the configuration from an optional file, then `UNISPEECH_*`
    /// environment variables. Missing keys keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("UNISPEECH"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Loading reads the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.target_object, "SpeechRecognizer");
        assert_eq!(config.buffer_size, 1024);
        assert!(config.partial_results);
        assert_eq!(config.completion, CompletionPolicy::Completed);
        assert!(config.locale.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
target_object = "Microphone"
locale = "ja-JP"
completion = "legacy_error"
"#
        )
        .unwrap();

        let config = BridgeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.target_object, "Microphone");
        assert_eq!(config.locale.as_deref(), Some("ja-JP"));
        assert_eq!(config.completion, CompletionPolicy::LegacyError);
        // Untouched keys keep their defaults
        assert_eq!(config.buffer_size, 1024);
        assert!(config.partial_results);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(BridgeConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "buffer_size = 512\ntarget_object = \"Microphone\"").unwrap();

        std::env::set_var("UNISPEECH_BUFFER_SIZE", "2048");
        std::env::set_var("UNISPEECH_PARTIAL_RESULTS", "false");
        std::env::set_var("UNISPEECH_VOSK_MODEL_PATH", "/opt/vosk/model-en");
        let loaded = BridgeConfig::load(Some(file.path()));
        std::env::remove_var("UNISPEECH_BUFFER_SIZE");
        std::env::remove_var("UNISPEECH_PARTIAL_RESULTS");
        std::env::remove_var("UNISPEECH_VOSK_MODEL_PATH");

        let config = loaded.unwrap();
        assert_eq!(config.buffer_size, 2048);
        assert!(!config.partial_results);
        assert_eq!(config.vosk_model_path.as_deref(), Some("/opt/vosk/model-en"));
        assert_eq!(config.target_object, "Microphone");
        assert_eq!(config.completion, CompletionPolicy::Completed);
    }
}
