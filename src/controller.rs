//! Recording session controller.
//!
//! The controller owns one speech backend on a dedicated session thread.
//! Inbound calls and every backend callback (authorization, availability,
//! task reports) are posted as commands onto a single FIFO channel and
//! handled one at a time, so `stop()` never races the task completion
//! callback.
//!
//! Events are queued in order to a separate relay thread that invokes the
//! [`MessageRelay`]. A relay may therefore call back into the controller
//! (`stop()` on `OnRecognized`, or even dropping it) without blocking the
//! session thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::config::{BridgeConfig, CompletionPolicy};
use crate::error::{Result, SpeechError};
use crate::event::RecognitionEvent;
use crate::relay::{MessageRelay, RelayedMessage};
use crate::speech::{self, AuthorizationStatus, SpeechBackend, TaskHandler, TaskReport};
use crate::state::SessionState;

/// Description sent with `OnError` for a clean finish under
/// [`CompletionPolicy::LegacyError`].
pub const LEGACY_COMPLETION_DESCRIPTION: &str = "nil";

enum Command {
    RequestAuthorization,
    Start(Sender<Result<()>>),
    Stop(Sender<Result<()>>),
    RefreshTask,
    SetTargetName(String),
    TargetName(Sender<String>),
    State(Sender<SessionState>),
    Authorization(AuthorizationStatus),
    Availability(bool),
    Task { session: u64, report: TaskReport },
    Shutdown,
}

/// Handle to a recording session controller running on its own thread.
///
/// Dropping the handle cancels any running session and joins the thread.
pub struct SessionController {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    relay_thread: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Starts a controller whose backend is built by `factory` on the
    /// session thread. Fails if the backend cannot be created.
    pub fn spawn<F>(config: BridgeConfig, relay: Arc<dyn MessageRelay>, factory: F) -> Result<Self>
    where
        F: FnOnce(&BridgeConfig) -> Result<Box<dyn SpeechBackend>> + Send + 'static,
    {
        let (commands, receiver) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let worker_commands = commands.clone();
        let (outbox, relay_thread) = spawn_relay_thread(relay)?;

        let worker = thread::Builder::new()
            .name("unispeech-session".to_string())
            .spawn(move || {
                let session = match factory(&config) {
                    Ok(backend) => Worker::new(backend, outbox, config, worker_commands),
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                session.run(receiver);
            })
            .map_err(|e| SpeechError::Backend(format!("failed to spawn session thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                worker: Some(worker),
                relay_thread: Some(relay_thread),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                let _ = relay_thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                let _ = relay_thread.join();
                Err(SpeechError::ControllerClosed)
            }
        }
    }

    /// Starts a controller on the native backend for this platform.
    pub fn with_platform_backend(config: BridgeConfig, relay: Arc<dyn MessageRelay>) -> Result<Self> {
        Self::spawn(config, relay, speech::platform_backend)
    }

    /// Asks the OS for speech permission. Emits exactly one of
    /// `OnAuthorized` / `OnUnauthorized` when the OS answers.
    pub fn request_authorization(&self) -> Result<()> {
        self.post(Command::RequestAuthorization)
    }

    /// Starts a recording session.
    ///
    /// Fails with [`SpeechError::AlreadyRunning`] while the capture engine is
    /// running. Any task left over from a stopped session is cancelled first.
    pub fn start(&self) -> Result<()> {
        self.call(Command::Start)?
    }

    /// Stops capturing and signals end of audio. The final result and the
    /// terminal event follow asynchronously.
    pub fn stop(&self) -> Result<()> {
        self.call(Command::Stop)?
    }

    /// Cancels the in-flight recognition task, if any.
    pub fn refresh_task(&self) -> Result<()> {
        self.post(Command::RefreshTask)
    }

    pub fn set_target_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(SpeechError::InvalidTargetName);
        }
        self.post(Command::SetTargetName(name))
    }

    pub fn target_name(&self) -> Result<String> {
        self.call(Command::TargetName)
    }

    pub fn state(&self) -> Result<SessionState> {
        self.call(Command::State)
    }

    fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SpeechError::ControllerClosed)
    }

    fn call<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.post(command(reply_tx))?;
        reply_rx.recv().map_err(|_| SpeechError::ControllerClosed)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // Dropped from inside the relay: the relay thread drains and exits
        // on its own once the session thread is gone
        if let Some(relay_thread) = self.relay_thread.take() {
            if relay_thread.thread().id() != thread::current().id() {
                let _ = relay_thread.join();
            }
        }
    }
}

/// Runs the relay on its own thread, delivering messages in queue order.
/// The thread exits once every sender is dropped and the queue is drained.
fn spawn_relay_thread(
    relay: Arc<dyn MessageRelay>,
) -> Result<(Sender<RelayedMessage>, JoinHandle<()>)> {
    let (outbox, messages) = unbounded::<RelayedMessage>();
    let handle = thread::Builder::new()
        .name("unispeech-relay".to_string())
        .spawn(move || {
            for message in messages.iter() {
                relay.send_message(&message.target, &message.handler, &message.payload);
            }
        })
        .map_err(|e| SpeechError::Backend(format!("failed to spawn relay thread: {e}")))?;
    Ok((outbox, handle))
}

struct Worker {
    backend: Box<dyn SpeechBackend>,
    outbox: Sender<RelayedMessage>,
    config: BridgeConfig,
    commands: Sender<Command>,
    target: String,
    state: SessionState,
    /// Incremented for every session; reports carry the value they were
    /// created with.
    session: u64,
    task_active: bool,
    availability: Option<bool>,
}

impl Worker {
    fn new(
        mut backend: Box<dyn SpeechBackend>,
        outbox: Sender<RelayedMessage>,
        config: BridgeConfig,
        commands: Sender<Command>,
    ) -> Self {
        let availability_commands = commands.clone();
        backend.set_availability_handler(Arc::new(move |available| {
            let _ = availability_commands.send(Command::Availability(available));
        }));

        info!(backend = backend.name(), target_object = %config.target_object, "session controller ready");

        Self {
            backend,
            outbox,
            target: config.target_object.clone(),
            config,
            commands,
            state: SessionState::Idle,
            session: 0,
            task_active: false,
            availability: None,
        }
    }

    fn run(mut self, receiver: Receiver<Command>) {
        while let Ok(command) = receiver.recv() {
            match command {
                Command::RequestAuthorization => self.request_authorization(),
                Command::Start(reply) => {
                    let _ = reply.send(self.start());
                }
                Command::Stop(reply) => {
                    let _ = reply.send(self.stop());
                }
                Command::RefreshTask => self.refresh_task(),
                Command::SetTargetName(name) => {
                    debug!(from = %self.target, to = %name, "target object changed");
                    self.target = name;
                }
                Command::TargetName(reply) => {
                    let _ = reply.send(self.target.clone());
                }
                Command::State(reply) => {
                    let _ = reply.send(self.state);
                }
                Command::Authorization(status) => self.authorization_changed(status),
                Command::Availability(available) => self.availability_changed(available),
                Command::Task { session, report } => self.task_report(session, report),
                Command::Shutdown => break,
            }
        }

        self.shutdown();
    }

    fn transition(&mut self, target: SessionState) {
        if !self.state.can_transition_to(&target) {
            warn!("unexpected session transition: {} -> {}", self.state, target);
        }
        debug!("session state: {} -> {}", self.state, target);
        self.state = target;
    }

    fn emit(&self, event: RecognitionEvent) {
        debug!(target_object = %self.target, %event, "emitting event");
        // The relay thread only exits after the session thread
        let _ = self.outbox.send(RelayedMessage {
            target: self.target.clone(),
            handler: event.handler_name().to_string(),
            payload: event.payload().to_string(),
        });
    }

    fn request_authorization(&self) {
        let commands = self.commands.clone();
        self.backend.request_authorization(Box::new(move |status| {
            let _ = commands.send(Command::Authorization(status));
        }));
    }

    fn authorization_changed(&self, status: AuthorizationStatus) {
        info!(?status, "speech authorization answered");
        if status.is_authorized() {
            self.emit(RecognitionEvent::Authorized);
        } else {
            self.emit(RecognitionEvent::Unauthorized);
        }
    }

    fn availability_changed(&mut self, available: bool) {
        if self.availability == Some(available) {
            trace!(available, "availability unchanged");
            return;
        }
        self.availability = Some(available);
        if available {
            self.emit(RecognitionEvent::Available);
        } else {
            self.emit(RecognitionEvent::Unavailable);
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.backend.is_running() || !self.state.can_transition_to(&SessionState::Starting) {
            debug!(state = %self.state, "start rejected: session already running");
            return Err(SpeechError::AlreadyRunning);
        }

        let resuming = self.state == SessionState::Stopping;
        self.transition(SessionState::Starting);

        // Supersede the previous session before its task reports back
        self.refresh_task();
        self.session += 1;
        if resuming {
            self.backend.remove_tap();
            self.backend.release_request();
            self.task_active = false;
        }

        match self.begin_session() {
            Ok(()) => {
                self.transition(SessionState::Listening);
                info!(session = self.session, "recording started");
                Ok(())
            }
            Err(err) => {
                warn!(session = self.session, "failed to start recording: {err}");
                self.refresh_task();
                self.teardown();
                self.transition(SessionState::Idle);
                self.emit(RecognitionEvent::Error {
                    description: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn begin_session(&mut self) -> Result<()> {
        self.backend.configure_audio_session()?;

        let handler = self.task_handler(self.session);
        self.backend
            .start_recognition(self.config.partial_results, handler)?;
        self.task_active = true;

        self.backend.install_tap(self.config.buffer_size)?;
        self.backend.start_engine()
    }

    fn task_handler(&self, session: u64) -> TaskHandler {
        let commands = self.commands.clone();
        Arc::new(move |report| {
            let _ = commands.send(Command::Task { session, report });
        })
    }

    fn stop(&mut self) -> Result<()> {
        if !self.backend.is_running() || self.state != SessionState::Listening {
            debug!(state = %self.state, "stop rejected: no session running");
            return Err(SpeechError::NotRunning);
        }

        self.backend.stop_engine();
        self.backend.end_audio();
        self.transition(SessionState::Stopping);
        info!(session = self.session, "recording stopped, waiting for final result");
        Ok(())
    }

    fn refresh_task(&mut self) {
        if self.task_active {
            debug!(session = self.session, "cancelling recognition task");
            self.backend.cancel_task();
        }
    }

    fn task_report(&mut self, session: u64, report: TaskReport) {
        if session != self.session || !self.task_active {
            trace!(session, current = self.session, "dropping report from a finished session");
            return;
        }

        if let Some(result) = &report.result {
            self.emit(RecognitionEvent::Recognized {
                text: result.text.clone(),
            });
        }

        if !report.ends_task() {
            return;
        }

        match report.error {
            Some(description) => {
                warn!(session, "recognition failed: {description}");
                self.transition(SessionState::Erroring);
                self.teardown();
                self.transition(SessionState::Idle);
                self.emit(RecognitionEvent::Error { description });
            }
            None => {
                info!(session, "recognition finished");
                if self.state == SessionState::Listening {
                    self.transition(SessionState::Stopping);
                }
                self.teardown();
                self.transition(SessionState::Idle);
                self.emit(self.completion_event());
            }
        }
    }

    fn completion_event(&self) -> RecognitionEvent {
        match self.config.completion {
            CompletionPolicy::Completed => RecognitionEvent::Completed,
            CompletionPolicy::LegacyError => RecognitionEvent::Error {
                description: LEGACY_COMPLETION_DESCRIPTION.to_string(),
            },
        }
    }

    fn teardown(&mut self) {
        self.backend.stop_engine();
        self.backend.remove_tap();
        self.backend.release_request();
        self.task_active = false;
    }

    fn shutdown(&mut self) {
        if self.state.is_active() || self.task_active {
            info!(session = self.session, "shutting down active session");
            self.refresh_task();
            self.teardown();
            self.state = SessionState::Idle;
        }
        debug!("session controller stopped");
    }
}
