//! Mock speech backend for platforms without native support and for tests.
//!
//! `MockBackend::demo()` simulates recognition by replaying a phrase word by
//! word once the engine starts. `MockBackend::scripted()` does nothing on its
//! own; the returned [`MockHandle`] drives results, errors, availability and
//! audio buffers from the outside and records every backend call.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::thread;
use std::time::Duration;

use crate::error::{Result, SpeechError};

use super::{
    AuthorizationReply, AuthorizationStatus, AvailabilityHandler, SpeechBackend, TaskHandler,
    TaskReport,
};

const DEMO_WORDS: [&str; 12] = [
    "Hello", "world,", "this", "is", "a", "demo", "of", "speech", "recognition", "from",
    "the", "bridge.",
];
const DEMO_WORD_DELAY: Duration = Duration::from_millis(400);
const CANCELED: &str = "Recognition request was canceled";

/// A call made by the controller into the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    RequestAuthorization,
    ConfigureAudioSession,
    StartRecognition { partial_results: bool },
    InstallTap { buffer_size: u32 },
    StartEngine,
    StopEngine,
    RemoveTap,
    EndAudio,
    CancelTask,
    ReleaseRequest,
}

struct MockState {
    calls: Vec<BackendCall>,
    authorization: AuthorizationStatus,
    availability: Option<AvailabilityHandler>,
    /// One handler per task started, oldest first.
    handlers: Vec<TaskHandler>,
    task_alive: bool,
    request_open: bool,
    tap_installed: bool,
    running: bool,
    appended_frames: usize,
    engine_failure: Option<String>,
    audio_session_failure: Option<String>,
}

struct Demo {
    stop_signal: Arc<AtomicBool>,
    audio_ended: Arc<AtomicBool>,
}

pub struct MockBackend {
    shared: Arc<Mutex<MockState>>,
    demo: Option<Demo>,
}

/// Test-side view of a [`MockBackend`].
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Mutex<MockState>>,
}

fn lock(shared: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBackend {
    fn with_demo(demo: Option<Demo>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                authorization: AuthorizationStatus::Authorized,
                availability: None,
                handlers: Vec::new(),
                task_alive: false,
                request_open: false,
                tap_installed: false,
                running: false,
                appended_frames: 0,
                engine_failure: None,
                audio_session_failure: None,
            })),
            demo,
        }
    }

    pub fn demo() -> Self {
        Self::with_demo(Some(Demo {
            stop_signal: Arc::new(AtomicBool::new(false)),
            audio_ended: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn scripted() -> (Self, MockHandle) {
        let backend = Self::with_demo(None);
        let handle = MockHandle {
            shared: Arc::clone(&backend.shared),
        };
        (backend, handle)
    }

    fn record(&self, call: BackendCall) -> MutexGuard<'_, MockState> {
        let mut state = lock(&self.shared);
        state.calls.push(call);
        state
    }

    fn spawn_demo(&self, handler: TaskHandler) {
        let Some(demo) = &self.demo else {
            return;
        };
        demo.stop_signal.store(false, Ordering::SeqCst);
        demo.audio_ended.store(false, Ordering::SeqCst);

        let stop_signal = Arc::clone(&demo.stop_signal);
        let audio_ended = Arc::clone(&demo.audio_ended);

        thread::spawn(move || {
            let mut transcript = String::new();

            for word in DEMO_WORDS.iter() {
                if stop_signal.load(Ordering::SeqCst) {
                    return;
                }
                if audio_ended.load(Ordering::SeqCst) {
                    break;
                }

                thread::sleep(DEMO_WORD_DELAY);

                if !transcript.is_empty() {
                    transcript.push(' ');
                }
                transcript.push_str(word);
                handler(TaskReport::partial(transcript.clone()));
            }

            if !stop_signal.load(Ordering::SeqCst) {
                handler(TaskReport::final_result(transcript));
            }
        });
    }
}

impl SpeechBackend for MockBackend {
    fn name(&self) -> &str {
        if self.demo.is_some() {
            "demo"
        } else {
            "scripted"
        }
    }

    fn request_authorization(&self, reply: AuthorizationReply) {
        let status = self.record(BackendCall::RequestAuthorization).authorization;
        // The OS answers on its own queue
        thread::spawn(move || reply(status));
    }

    fn set_availability_handler(&mut self, handler: AvailabilityHandler) {
        lock(&self.shared).availability = Some(handler);
    }

    fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    fn configure_audio_session(&mut self) -> Result<()> {
        let state = self.record(BackendCall::ConfigureAudioSession);
        match &state.audio_session_failure {
            Some(reason) => Err(SpeechError::AudioSession(reason.clone())),
            None => Ok(()),
        }
    }

    fn start_recognition(&mut self, partial_results: bool, handler: TaskHandler) -> Result<()> {
        let mut state = self.record(BackendCall::StartRecognition { partial_results });
        state.handlers.push(handler);
        state.task_alive = true;
        state.request_open = true;
        Ok(())
    }

    fn install_tap(&mut self, buffer_size: u32) -> Result<()> {
        self.record(BackendCall::InstallTap { buffer_size }).tap_installed = true;
        Ok(())
    }

    fn start_engine(&mut self) -> Result<()> {
        let handler = {
            let mut state = self.record(BackendCall::StartEngine);
            if let Some(reason) = &state.engine_failure {
                return Err(SpeechError::Engine(reason.clone()));
            }
            state.running = true;
            state.handlers.last().cloned()
        };

        if let Some(handler) = handler {
            self.spawn_demo(handler);
        }
        Ok(())
    }

    fn stop_engine(&mut self) {
        self.record(BackendCall::StopEngine).running = false;
    }

    fn remove_tap(&mut self) {
        self.record(BackendCall::RemoveTap).tap_installed = false;
    }

    fn end_audio(&mut self) {
        self.record(BackendCall::EndAudio).request_open = false;
        if let Some(demo) = &self.demo {
            demo.audio_ended.store(true, Ordering::SeqCst);
        }
    }

    fn cancel_task(&mut self) {
        let handler = {
            let mut state = self.record(BackendCall::CancelTask);
            if !state.task_alive {
                return;
            }
            state.task_alive = false;
            state.handlers.last().cloned()
        };

        if let Some(demo) = &self.demo {
            demo.stop_signal.store(true, Ordering::SeqCst);
        }
        if let Some(handler) = handler {
            handler(TaskReport::error(CANCELED));
        }
    }

    fn release_request(&mut self) {
        let mut state = self.record(BackendCall::ReleaseRequest);
        state.request_open = false;
        state.task_alive = false;
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(demo) = &self.demo {
            demo.stop_signal.store(true, Ordering::SeqCst);
        }
    }
}

impl MockHandle {
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.shared).calls.clear();
    }

    /// Number of recognition tasks started so far.
    pub fn task_count(&self) -> usize {
        lock(&self.shared).handlers.len()
    }

    /// Whether the most recent task is still in flight.
    pub fn task_alive(&self) -> bool {
        lock(&self.shared).task_alive
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    pub fn tap_installed(&self) -> bool {
        lock(&self.shared).tap_installed
    }

    /// Handler of the `index`-th task, for replaying late reports.
    pub fn task_handler(&self, index: usize) -> Option<TaskHandler> {
        lock(&self.shared).handlers.get(index).cloned()
    }

    /// Delivers a report through the most recent task's handler, as the
    /// recognizer would from its own queue.
    pub fn emit(&self, report: TaskReport) -> bool {
        let handler = lock(&self.shared).handlers.last().cloned();
        match handler {
            Some(handler) => {
                handler(report);
                true
            }
            None => false,
        }
    }

    pub fn emit_partial(&self, text: &str) -> bool {
        self.emit(TaskReport::partial(text))
    }

    pub fn emit_final(&self, text: &str) -> bool {
        self.emit(TaskReport::final_result(text))
    }

    pub fn emit_error(&self, description: &str) -> bool {
        self.emit(TaskReport::error(description))
    }

    pub fn set_authorization(&self, status: AuthorizationStatus) {
        lock(&self.shared).authorization = status;
    }

    /// Reports a recognizer availability change.
    pub fn set_available(&self, available: bool) -> bool {
        let handler = lock(&self.shared).availability.clone();
        match handler {
            Some(handler) => {
                handler(available);
                true
            }
            None => false,
        }
    }

    /// Pushes a captured buffer through the tap. Returns whether the buffer
    /// reached an open request.
    pub fn feed_buffer(&self, frames: &[f32]) -> bool {
        let mut state = lock(&self.shared);
        if state.running && state.tap_installed && state.request_open {
            state.appended_frames += frames.len();
            true
        } else {
            false
        }
    }

    pub fn appended_frames(&self) -> usize {
        lock(&self.shared).appended_frames
    }

    pub fn fail_engine_start(&self, reason: Option<&str>) {
        lock(&self.shared).engine_failure = reason.map(str::to_string);
    }

    pub fn fail_audio_session(&self, reason: Option<&str>) {
        lock(&self.shared).audio_session_failure = reason.map(str::to_string);
    }
}
