//! Windows speech recognition using the native Windows.Media.SpeechRecognition API.
//!
//! The continuous recognition session captures the microphone itself, so the
//! tap is implicit. Hypotheses are reported as partial results on top of the
//! phrases completed so far; the session's completion is the final result.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tracing::debug;
use windows::{
    core::HSTRING,
    Foundation::TypedEventHandler,
    Globalization::Language,
    Media::SpeechRecognition::{
        SpeechContinuousRecognitionCompletedEventArgs,
        SpeechContinuousRecognitionResultGeneratedEventArgs,
        SpeechRecognitionHypothesisGeneratedEventArgs, SpeechRecognitionResultStatus,
        SpeechRecognizer as WinSpeechRecognizer,
    },
};

use crate::config::BridgeConfig;
use crate::error::{Result, SpeechError};

use super::{
    AuthorizationReply, AuthorizationStatus, AvailabilityHandler, SpeechBackend, TaskHandler,
    TaskReport,
};

const DEFAULT_LANGUAGE: &str = "en-US";

fn backend_error(context: &str, err: windows::core::Error) -> SpeechError {
    SpeechError::Backend(format!("{context}: {err}"))
}

pub struct WindowsSpeechBackend {
    language: String,
    recognizer: Option<WinSpeechRecognizer>,
    /// Phrases completed during the current session.
    phrases: Arc<Mutex<String>>,
    is_running: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    handler: Option<TaskHandler>,
}

impl WindowsSpeechBackend {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            language: config
                .locale
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            recognizer: None,
            phrases: Arc::new(Mutex::new(String::new())),
            is_running: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            handler: None,
        })
    }

    fn register_handlers(&self, recognizer: &WinSpeechRecognizer, handler: TaskHandler) -> Result<()> {
        let session = recognizer
            .ContinuousRecognitionSession()
            .map_err(|e| backend_error("failed to get recognition session", e))?;

        // Hypotheses: partial results on top of the completed phrases
        let phrases_for_hypothesis = Arc::clone(&self.phrases);
        let handler_for_hypothesis = Arc::clone(&handler);
        let hypothesis_handler = TypedEventHandler::new(
            move |_sender: &Option<WinSpeechRecognizer>,
                  args: &Option<SpeechRecognitionHypothesisGeneratedEventArgs>| {
                if let Some(args) = args {
                    let text = args.Hypothesis()?.Text()?.to_string();
                    if !text.is_empty() {
                        let phrases = phrases_for_hypothesis
                            .lock()
                            .map(|p| p.clone())
                            .unwrap_or_default();
                        handler_for_hypothesis(TaskReport::partial(join(&phrases, &text)));
                    }
                }
                Ok(())
            },
        );
        recognizer
            .HypothesisGenerated(&hypothesis_handler)
            .map_err(|e| backend_error("failed to register hypothesis handler", e))?;

        // Completed phrases accumulate into the transcript
        let phrases_for_result = Arc::clone(&self.phrases);
        let handler_for_result = Arc::clone(&handler);
        let result_handler = TypedEventHandler::new(
            move |_sender: &Option<_>,
                  args: &Option<SpeechContinuousRecognitionResultGeneratedEventArgs>| {
                if let Some(args) = args {
                    let text = args.Result()?.Text()?.to_string();
                    if !text.is_empty() {
                        if let Ok(mut phrases) = phrases_for_result.lock() {
                            *phrases = join(&phrases, &text);
                            handler_for_result(TaskReport::partial(phrases.clone()));
                        }
                    }
                }
                Ok(())
            },
        );
        session
            .ResultGenerated(&result_handler)
            .map_err(|e| backend_error("failed to register result handler", e))?;

        // Session completion ends the task
        let phrases_for_complete = Arc::clone(&self.phrases);
        let is_running = Arc::clone(&self.is_running);
        let cancelled = Arc::clone(&self.cancelled);
        let completed_handler = TypedEventHandler::new(
            move |_sender: &Option<_>,
                  args: &Option<SpeechContinuousRecognitionCompletedEventArgs>| {
                is_running.store(false, Ordering::SeqCst);
                let status = match args {
                    Some(args) => args.Status()?,
                    None => SpeechRecognitionResultStatus::Unknown,
                };
                let transcript = phrases_for_complete
                    .lock()
                    .map(|p| p.clone())
                    .unwrap_or_default();

                let report = if cancelled.load(Ordering::SeqCst) {
                    TaskReport::error("Recognition request was canceled")
                } else if status == SpeechRecognitionResultStatus::Success {
                    TaskReport::final_result(transcript)
                } else {
                    TaskReport::error(format!("recognition session ended: {status:?}"))
                };
                handler(report);
                Ok(())
            },
        );
        session
            .Completed(&completed_handler)
            .map_err(|e| backend_error("failed to register completion handler", e))?;

        Ok(())
    }

    fn stop_session(&self) {
        if let Some(ref recognizer) = self.recognizer {
            if let Ok(session) = recognizer.ContinuousRecognitionSession() {
                if let Ok(stop_op) = session.StopAsync() {
                    let _ = stop_op.get();
                }
            }
        }
    }
}

fn join(phrases: &str, text: &str) -> String {
    if phrases.is_empty() {
        text.to_string()
    } else {
        format!("{phrases} {text}")
    }
}

impl SpeechBackend for WindowsSpeechBackend {
    fn name(&self) -> &str {
        "windows-speech"
    }

    fn request_authorization(&self, reply: AuthorizationReply) {
        // Microphone consent is handled by the OS privacy settings on first use
        reply(AuthorizationStatus::Authorized);
    }

    fn set_availability_handler(&mut self, _handler: AvailabilityHandler) {
        // The dictation recognizer reports no availability changes
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn configure_audio_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_recognition(&mut self, _partial_results: bool, handler: TaskHandler) -> Result<()> {
        let language = Language::CreateLanguage(&HSTRING::from(self.language.as_str()))
            .map_err(|e| backend_error("failed to create language", e))?;
        let recognizer = WinSpeechRecognizer::Create(&language)
            .map_err(|e| SpeechError::RecognizerUnavailable(e.to_string()))?;

        // Compile the default dictation grammar
        recognizer
            .CompileConstraintsAsync()
            .and_then(|op| op.get())
            .map_err(|e| SpeechError::Request(format!("failed to compile grammar: {e}")))?;

        if let Ok(mut phrases) = self.phrases.lock() {
            phrases.clear();
        }
        self.cancelled.store(false, Ordering::SeqCst);

        self.register_handlers(&recognizer, Arc::clone(&handler))?;
        self.recognizer = Some(recognizer);
        self.handler = Some(handler);
        Ok(())
    }

    fn install_tap(&mut self, buffer_size: u32) -> Result<()> {
        debug!(buffer_size, "capture is owned by the recognition session");
        Ok(())
    }

    fn start_engine(&mut self) -> Result<()> {
        let recognizer = self
            .recognizer
            .as_ref()
            .ok_or_else(|| SpeechError::Request("no recognition session".to_string()))?;

        recognizer
            .ContinuousRecognitionSession()
            .and_then(|session| session.StartAsync())
            .and_then(|op| op.get())
            .map_err(|e| SpeechError::Engine(e.to_string()))?;

        self.is_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_engine(&mut self) {
        if self.is_running.swap(false, Ordering::SeqCst) {
            self.stop_session();
        }
    }

    fn remove_tap(&mut self) {}

    fn end_audio(&mut self) {
        // StopAsync already flushes pending audio and completes the session
    }

    fn cancel_task(&mut self) {
        if self.recognizer.is_none() {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        if self.is_running.swap(false, Ordering::SeqCst) {
            if let Some(ref recognizer) = self.recognizer {
                if let Ok(session) = recognizer.ContinuousRecognitionSession() {
                    if let Ok(cancel_op) = session.CancelAsync() {
                        let _ = cancel_op.get();
                    }
                }
            }
        } else if let Some(handler) = &self.handler {
            // Session already stopped; report the cancellation ourselves
            handler(TaskReport::error("Recognition request was canceled"));
        }
    }

    fn release_request(&mut self) {
        self.recognizer = None;
        self.handler = None;
    }
}

impl Drop for WindowsSpeechBackend {
    fn drop(&mut self) {
        self.stop_engine();
        self.release_request();
    }
}
