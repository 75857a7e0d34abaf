// Session controller behaviour against the scripted mock backend
//
// Every test drives the controller the way a host would and observes the
// messages it relays.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use unispeech::speech::{BackendCall, MockBackend, MockHandle};
use unispeech::{
    AuthorizationStatus, BridgeConfig, ChannelRelay, CompletionPolicy, RecognitionEvent,
    RelayedMessage, SessionController, SessionState, SpeechBackend, SpeechError, TaskReport,
};

const TIMEOUT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

fn spawn_scripted(
    config: BridgeConfig,
) -> (SessionController, MockHandle, Receiver<RelayedMessage>) {
    let (backend, mock) = MockBackend::scripted();
    let (relay, messages) = ChannelRelay::new();
    let controller = SessionController::spawn(config, Arc::new(relay), move |_| {
        Ok(Box::new(backend) as Box<dyn SpeechBackend>)
    })
    .unwrap();
    (controller, mock, messages)
}

fn next_message(messages: &Receiver<RelayedMessage>) -> RelayedMessage {
    messages.recv_timeout(TIMEOUT).expect("expected a relayed message")
}

fn next_event(messages: &Receiver<RelayedMessage>) -> RecognitionEvent {
    next_message(messages).event().expect("unknown handler name")
}

/// Waits until the controller has processed everything posted so far, then
/// checks that nothing reaches the relay.
fn assert_no_event(controller: &SessionController, messages: &Receiver<RelayedMessage>) {
    controller.state().unwrap();
    assert!(
        messages.recv_timeout(QUIET).is_err(),
        "unexpected message relayed"
    );
}

fn recognized(text: &str) -> RecognitionEvent {
    RecognitionEvent::Recognized {
        text: text.to_string(),
    }
}

#[test]
fn test_start_twice_keeps_one_task() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());

    assert!(controller.start().is_ok());
    assert!(matches!(controller.start(), Err(SpeechError::AlreadyRunning)));

    assert_eq!(mock.task_count(), 1);
    assert!(mock.is_running());
    assert_eq!(controller.state().unwrap(), SessionState::Listening);
    assert_no_event(&controller, &messages);
}

#[test]
fn test_start_sequence() {
    let (controller, mock, _messages) = spawn_scripted(BridgeConfig::default());

    controller.start().unwrap();

    assert_eq!(
        mock.calls(),
        vec![
            BackendCall::ConfigureAudioSession,
            BackendCall::StartRecognition { partial_results: true },
            BackendCall::InstallTap { buffer_size: 1024 },
            BackendCall::StartEngine,
        ]
    );
}

#[test]
fn test_stop_without_session_fails() {
    let (controller, mock, _messages) = spawn_scripted(BridgeConfig::default());

    assert!(matches!(controller.stop(), Err(SpeechError::NotRunning)));
    assert!(mock.calls().is_empty());
    assert_eq!(controller.state().unwrap(), SessionState::Idle);
}

#[test]
fn test_stop_then_final_result_completes() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();
    mock.clear_calls();

    controller.stop().unwrap();
    assert_eq!(mock.calls(), vec![BackendCall::StopEngine, BackendCall::EndAudio]);
    assert_eq!(controller.state().unwrap(), SessionState::Stopping);
    assert!(matches!(controller.stop(), Err(SpeechError::NotRunning)));

    assert!(mock.emit_final("hello world"));
    assert_eq!(next_event(&messages), recognized("hello world"));
    assert_eq!(next_event(&messages), RecognitionEvent::Completed);

    assert_eq!(controller.state().unwrap(), SessionState::Idle);
    assert!(mock.calls().ends_with(&[
        BackendCall::StopEngine,
        BackendCall::RemoveTap,
        BackendCall::ReleaseRequest,
    ]));

    // Handles are cleared, so a new session starts
    controller.start().unwrap();
    assert_eq!(mock.task_count(), 2);
}

#[test]
fn test_partial_results_relayed_in_order() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();

    mock.emit_partial("what");
    mock.emit_partial("what is");
    mock.emit_partial("what is this");

    assert_eq!(next_event(&messages), recognized("what"));
    assert_eq!(next_event(&messages), recognized("what is"));
    assert_eq!(next_event(&messages), recognized("what is this"));
    assert_no_event(&controller, &messages);
    assert_eq!(controller.state().unwrap(), SessionState::Listening);
}

#[test]
fn test_final_result_without_stop_completes() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();

    mock.emit_final("done");
    assert_eq!(next_event(&messages), recognized("done"));
    assert_eq!(next_event(&messages), RecognitionEvent::Completed);
    assert_eq!(controller.state().unwrap(), SessionState::Idle);
    assert!(!mock.is_running());
}

#[test]
fn test_error_tears_down_session() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();

    mock.emit_error("The network connection was lost.");
    assert_eq!(
        next_event(&messages),
        RecognitionEvent::Error {
            description: "The network connection was lost.".to_string()
        }
    );

    assert_eq!(controller.state().unwrap(), SessionState::Idle);
    assert!(!mock.is_running());
    assert!(!mock.tap_installed());
    assert!(!mock.task_alive());

    controller.start().unwrap();
    assert_eq!(controller.state().unwrap(), SessionState::Listening);
}

#[test]
fn test_result_with_error_emits_both() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();

    let mut report = TaskReport::partial("half a sen");
    report.error = Some("audio interrupted".to_string());
    mock.emit(report);

    assert_eq!(next_event(&messages), recognized("half a sen"));
    assert_eq!(
        next_event(&messages),
        RecognitionEvent::Error {
            description: "audio interrupted".to_string()
        }
    );
    assert_eq!(controller.state().unwrap(), SessionState::Idle);
}

#[test]
fn test_legacy_completion_reports_error() {
    let config = BridgeConfig {
        completion: CompletionPolicy::LegacyError,
        ..BridgeConfig::default()
    };
    let (controller, mock, messages) = spawn_scripted(config);
    controller.start().unwrap();
    controller.stop().unwrap();

    mock.emit_final("bye");
    assert_eq!(next_event(&messages), recognized("bye"));
    let message = next_message(&messages);
    assert_eq!(message.handler, "OnError");
    assert_eq!(message.payload, "nil");
}

#[test]
fn test_reports_after_teardown_are_dropped() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();

    mock.emit_error("first failure");
    assert!(next_event(&messages).is_terminal());

    mock.emit_final("late");
    mock.emit_error("second failure");
    assert_no_event(&controller, &messages);
}

#[test]
fn test_restart_while_stopping_supersedes_old_task() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();
    controller.stop().unwrap();
    mock.clear_calls();

    // The stopped task has not delivered its final result yet
    controller.start().unwrap();
    assert_eq!(
        mock.calls(),
        vec![
            BackendCall::CancelTask,
            BackendCall::RemoveTap,
            BackendCall::ReleaseRequest,
            BackendCall::ConfigureAudioSession,
            BackendCall::StartRecognition { partial_results: true },
            BackendCall::InstallTap { buffer_size: 1024 },
            BackendCall::StartEngine,
        ]
    );

    // The cancellation report and any late result of the old task are ignored
    let old_task = mock.task_handler(0).unwrap();
    old_task(TaskReport::final_result("stale"));
    assert_no_event(&controller, &messages);
    assert_eq!(controller.state().unwrap(), SessionState::Listening);

    mock.emit_partial("fresh");
    assert_eq!(next_event(&messages), recognized("fresh"));
}

#[test]
fn test_refresh_task_cancels_running_session() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();

    controller.refresh_task().unwrap();
    assert_eq!(
        next_event(&messages),
        RecognitionEvent::Error {
            description: "Recognition request was canceled".to_string()
        }
    );
    assert_eq!(controller.state().unwrap(), SessionState::Idle);
    assert!(!mock.is_running());

    controller.start().unwrap();
}

#[test]
fn test_engine_failure_rolls_back() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    mock.fail_engine_start(Some("no input device"));

    let result = controller.start();
    assert!(matches!(result, Err(SpeechError::Engine(_))));

    match next_event(&messages) {
        RecognitionEvent::Error { description } => {
            assert!(description.contains("no input device"), "{description}")
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert_no_event(&controller, &messages);
    assert_eq!(controller.state().unwrap(), SessionState::Idle);
    assert!(!mock.task_alive());
    assert!(!mock.tap_installed());

    mock.fail_engine_start(None);
    controller.start().unwrap();
}

#[test]
fn test_audio_session_failure_skips_recognition() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    mock.fail_audio_session(Some("session busy"));

    assert!(matches!(controller.start(), Err(SpeechError::AudioSession(_))));
    assert!(next_event(&messages).is_terminal());
    assert_eq!(mock.task_count(), 0);
    assert!(!mock.calls().contains(&BackendCall::StartEngine));
}

#[test]
fn test_audio_reaches_only_active_request() {
    let (controller, mock, _messages) = spawn_scripted(BridgeConfig::default());
    assert!(!mock.feed_buffer(&[0.1; 1024]));

    controller.start().unwrap();
    assert!(mock.feed_buffer(&[0.1; 1024]));
    assert!(mock.feed_buffer(&[0.2; 1024]));

    controller.stop().unwrap();
    assert!(!mock.feed_buffer(&[0.3; 1024]));
    assert_eq!(mock.appended_frames(), 2048);
}

#[test]
fn test_custom_buffer_size_and_partial_flag() {
    let config = BridgeConfig {
        buffer_size: 4096,
        partial_results: false,
        ..BridgeConfig::default()
    };
    let (controller, mock, _messages) = spawn_scripted(config);
    controller.start().unwrap();

    let calls = mock.calls();
    assert!(calls.contains(&BackendCall::StartRecognition { partial_results: false }));
    assert!(calls.contains(&BackendCall::InstallTap { buffer_size: 4096 }));
}

#[test]
fn test_authorization_answers_once() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());

    controller.request_authorization().unwrap();
    assert_eq!(next_event(&messages), RecognitionEvent::Authorized);

    mock.set_authorization(AuthorizationStatus::Denied);
    controller.request_authorization().unwrap();
    assert_eq!(next_event(&messages), RecognitionEvent::Unauthorized);

    mock.set_authorization(AuthorizationStatus::Restricted);
    controller.request_authorization().unwrap();
    assert_eq!(next_event(&messages), RecognitionEvent::Unauthorized);

    mock.set_authorization(AuthorizationStatus::NotDetermined);
    controller.request_authorization().unwrap();
    assert_eq!(next_event(&messages), RecognitionEvent::Unauthorized);

    // The mock answers from another thread; give a straggler time to show up
    assert!(messages.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_availability_changes() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());

    assert!(mock.set_available(false));
    assert_eq!(next_event(&messages), RecognitionEvent::Unavailable);

    mock.set_available(false);
    assert_no_event(&controller, &messages);

    mock.set_available(true);
    assert_eq!(next_event(&messages), RecognitionEvent::Available);

    mock.set_available(true);
    assert_no_event(&controller, &messages);
}

#[test]
fn test_target_name_routes_messages() {
    let (controller, mock, messages) = spawn_scripted(BridgeConfig::default());
    assert_eq!(controller.target_name().unwrap(), "SpeechRecognizer");

    mock.set_available(true);
    assert_eq!(next_message(&messages).target, "SpeechRecognizer");

    controller.set_target_name("VoiceInput").unwrap();
    assert!(matches!(
        controller.set_target_name(""),
        Err(SpeechError::InvalidTargetName)
    ));
    assert_eq!(controller.target_name().unwrap(), "VoiceInput");

    mock.set_available(false);
    let message = next_message(&messages);
    assert_eq!(message.target, "VoiceInput");
    assert_eq!(message.handler, "OnUnavailable");
    assert_eq!(message.payload, "");
}

#[test]
fn test_drop_tears_down_running_session() {
    let (controller, mock, _messages) = spawn_scripted(BridgeConfig::default());
    controller.start().unwrap();

    drop(controller);

    assert!(!mock.is_running());
    assert!(!mock.tap_installed());
    assert!(mock.calls().contains(&BackendCall::CancelTask));
}

#[test]
fn test_backend_construction_failure() {
    let (relay, _messages) = ChannelRelay::new();
    let result = SessionController::spawn(BridgeConfig::default(), Arc::new(relay), |_| {
        Err(SpeechError::RecognizerUnavailable("no recognizer for xx-XX".to_string()))
    });

    assert!(matches!(result, Err(SpeechError::RecognizerUnavailable(_))));
}

#[test]
fn test_demo_backend_session() {
    let (relay, messages) = ChannelRelay::new();
    let controller = SessionController::spawn(BridgeConfig::default(), Arc::new(relay), |_| {
        Ok(Box::new(MockBackend::demo()) as Box<dyn SpeechBackend>)
    })
    .unwrap();

    controller.start().unwrap();
    assert_eq!(next_event(&messages), recognized("Hello"));

    controller.stop().unwrap();
    let terminal = loop {
        let event = next_event(&messages);
        if event.is_terminal() {
            break event;
        }
    };
    assert_eq!(terminal, RecognitionEvent::Completed);
    assert_eq!(controller.state().unwrap(), SessionState::Idle);
}

#[test]
fn test_relay_can_stop_session_from_callback() {
    let (backend, mock) = MockBackend::scripted();
    let (handlers_tx, handlers) = unbounded();
    let (stopped_tx, stopped) = unbounded();
    let slot: Arc<OnceLock<Weak<SessionController>>> = Arc::new(OnceLock::new());

    let relay_slot = Arc::clone(&slot);
    let relay = move |_target: &str, handler: &str, _payload: &str| {
        if handler == "OnRecognized" {
            if let Some(controller) = relay_slot.get().and_then(Weak::upgrade) {
                let _ = stopped_tx.send(controller.stop());
            }
        }
        let _ = handlers_tx.send(handler.to_string());
    };

    let controller = Arc::new(
        SessionController::spawn(BridgeConfig::default(), Arc::new(relay), move |_| {
            Ok(Box::new(backend) as Box<dyn SpeechBackend>)
        })
        .unwrap(),
    );
    slot.set(Arc::downgrade(&controller)).unwrap();

    controller.start().unwrap();
    assert!(mock.emit_partial("stop now"));

    let result = stopped.recv_timeout(TIMEOUT).expect("stop() from the relay never returned");
    assert!(result.is_ok());
    assert_eq!(handlers.recv_timeout(TIMEOUT).unwrap(), "OnRecognized");
    assert_eq!(controller.state().unwrap(), SessionState::Stopping);
    assert!(!mock.is_running());

    assert!(mock.emit_final("stop now"));
    assert_eq!(handlers.recv_timeout(TIMEOUT).unwrap(), "OnRecognized");
    assert!(matches!(
        stopped.recv_timeout(TIMEOUT),
        Ok(Err(SpeechError::NotRunning))
    ));
    assert_eq!(handlers.recv_timeout(TIMEOUT).unwrap(), "OnCompleted");
    assert_eq!(controller.state().unwrap(), SessionState::Idle);
}

#[test]
fn test_relay_can_drop_controller_from_callback() {
    let (backend, mock) = MockBackend::scripted();
    let (dropped_tx, dropped) = unbounded();
    let slot: Arc<Mutex<Option<SessionController>>> = Arc::new(Mutex::new(None));

    let relay_slot = Arc::clone(&slot);
    let relay = move |_target: &str, handler: &str, _payload: &str| {
        if handler == "OnRecognized" {
            let controller = relay_slot.lock().unwrap().take();
            if let Some(controller) = controller {
                drop(controller);
                let _ = dropped_tx.send(());
            }
        }
    };

    let controller = SessionController::spawn(BridgeConfig::default(), Arc::new(relay), move |_| {
        Ok(Box::new(backend) as Box<dyn SpeechBackend>)
    })
    .unwrap();
    controller.start().unwrap();
    *slot.lock().unwrap() = Some(controller);

    assert!(mock.emit_partial("goodbye"));

    dropped
        .recv_timeout(TIMEOUT)
        .expect("dropping the controller from the relay never returned");
    assert!(!mock.is_running());
    assert!(!mock.tap_installed());
    assert!(mock.calls().contains(&BackendCall::CancelTask));
}
