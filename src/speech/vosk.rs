//! Linux speech recognition using Vosk offline speech recognition.
//!
//! Requires a Vosk model to be downloaded and available. The model path
//! can be configured via:
//! 1. `vosk_model_path` in the bridge configuration
//! 2. `VOSK_MODEL_PATH` environment variable
//! 3. `~/.local/share/vosk/model` (default)
//!
//! Download models from: https://alphacephei.com/vosk/models
//!
//! The recognition request is a channel of mono i16 buffers consumed by a
//! recognition thread; the capture engine is a cpal input stream running on
//! its own thread and feeding that channel through the tap.

use std::env;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};
use vosk::{Model, Recognizer};

use crate::config::BridgeConfig;
use crate::error::{Result, SpeechError};

use super::{
    AuthorizationReply, AuthorizationStatus, AvailabilityHandler, SpeechBackend, TaskHandler,
    TaskReport,
};

const CANCELED: &str = "Recognition request was canceled";

struct Request {
    audio: Option<Sender<Vec<i16>>>,
    sample_rate: f32,
    cancelled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

struct Capture {
    stop_signal: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct VoskSpeechBackend {
    model: Arc<Model>,
    request: Option<Request>,
    tap_buffer_size: Option<u32>,
    capture: Option<Capture>,
}

impl VoskSpeechBackend {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let model_path = Self::get_model_path(config)?;
        if !model_path.exists() {
            return Err(SpeechError::RecognizerUnavailable(format!(
                "Vosk model not found at: {}\n\
                 Download a model from https://alphacephei.com/vosk/models\n\
                 and extract it to ~/.local/share/vosk/model\n\
                 or set VOSK_MODEL_PATH environment variable",
                model_path.display()
            )));
        }

        let model = Model::new(model_path.to_string_lossy()).ok_or_else(|| {
            SpeechError::RecognizerUnavailable(format!(
                "failed to load Vosk model from {}",
                model_path.display()
            ))
        })?;

        Ok(Self {
            model: Arc::new(model),
            request: None,
            tap_buffer_size: None,
            capture: None,
        })
    }

    fn get_model_path(config: &BridgeConfig) -> Result<PathBuf> {
        if let Some(path) = &config.vosk_model_path {
            return Ok(PathBuf::from(path));
        }

        if let Ok(path) = env::var("VOSK_MODEL_PATH") {
            return Ok(PathBuf::from(path));
        }

        let home = env::var("HOME")
            .map_err(|_| SpeechError::Backend("HOME environment variable not set".to_string()))?;
        Ok(PathBuf::from(home).join(".local/share/vosk/model"))
    }

    fn input_sample_rate() -> Result<f32> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| SpeechError::Engine("no input device available".to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| SpeechError::Engine(e.to_string()))?;
        Ok(config.sample_rate().0 as f32)
    }

    fn run_recognition(
        model: Arc<Model>,
        sample_rate: f32,
        audio: Receiver<Vec<i16>>,
        cancelled: Arc<AtomicBool>,
        handler: TaskHandler,
        partial_results: bool,
    ) {
        let Some(mut recognizer) = Recognizer::new(&model, sample_rate) else {
            handler(TaskReport::error("failed to create Vosk recognizer"));
            return;
        };
        recognizer.set_words(true);
        recognizer.set_partial_words(true);

        let mut last_partial = String::new();

        // Runs until end of audio drops the sender
        for samples in audio.iter() {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = recognizer.accept_waveform(&samples) {
                warn!("vosk rejected audio: {err:?}");
                handler(TaskReport::error(format!("failed to decode audio: {err:?}")));
                return;
            }

            if partial_results {
                let partial = recognizer.partial_result().partial.to_string();
                if !partial.is_empty() && partial != last_partial {
                    handler(TaskReport::partial(partial.clone()));
                    last_partial = partial;
                }
            }
        }

        if cancelled.load(Ordering::SeqCst) {
            handler(TaskReport::error(CANCELED));
            return;
        }

        let text = recognizer
            .final_result()
            .single()
            .map(|result| result.text.to_string())
            .unwrap_or_default();
        handler(TaskReport::final_result(text));
    }

    fn run_capture(
        audio: Sender<Vec<i16>>,
        stop_signal: Arc<AtomicBool>,
        buffer_size: u32,
        started: Sender<Result<()>>,
    ) {
        let stream = (|| -> Result<cpal::Stream> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| SpeechError::Engine("no input device available".to_string()))?;
            let config = device
                .default_input_config()
                .map_err(|e| SpeechError::Engine(e.to_string()))?;
            let channels = config.channels() as usize;

            let mut stream_config: cpal::StreamConfig = config.into();
            stream_config.buffer_size = cpal::BufferSize::Fixed(buffer_size);

            let stream = device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Average channels to mono and convert to i16
                        let samples: Vec<i16> = data
                            .chunks(channels)
                            .map(|frame| {
                                let sum: f32 = frame.iter().sum();
                                let mono = sum / channels as f32;
                                (mono * 32767.0) as i16
                            })
                            .collect();
                        let _ = audio.try_send(samples);
                    },
                    |err| {
                        warn!("audio stream error: {err}");
                    },
                    None,
                )
                .map_err(|e| SpeechError::Engine(e.to_string()))?;
            stream.play().map_err(|e| SpeechError::Engine(e.to_string()))?;
            Ok(stream)
        })();

        match stream {
            Ok(stream) => {
                let _ = started.send(Ok(()));
                while !stop_signal.load(Ordering::SeqCst) {
                    thread::park_timeout(std::time::Duration::from_millis(50));
                }
                drop(stream);
            }
            Err(err) => {
                let _ = started.send(Err(err));
            }
        }
    }
}

impl SpeechBackend for VoskSpeechBackend {
    fn name(&self) -> &str {
        "vosk"
    }

    fn request_authorization(&self, reply: AuthorizationReply) {
        // No speech permission model on Linux
        reply(AuthorizationStatus::Authorized);
    }

    fn set_availability_handler(&mut self, handler: AvailabilityHandler) {
        // The offline model is available as soon as it is loaded
        handler(true);
    }

    fn is_running(&self) -> bool {
        self.capture.is_some()
    }

    fn configure_audio_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_recognition(&mut self, partial_results: bool, handler: TaskHandler) -> Result<()> {
        let sample_rate = Self::input_sample_rate()?;
        let (audio_tx, audio_rx) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));

        let model = Arc::clone(&self.model);
        let cancelled_for_worker = Arc::clone(&cancelled);
        let worker = thread::Builder::new()
            .name("unispeech-vosk".to_string())
            .spawn(move || {
                Self::run_recognition(
                    model,
                    sample_rate,
                    audio_rx,
                    cancelled_for_worker,
                    handler,
                    partial_results,
                )
            })
            .map_err(|e| SpeechError::Request(e.to_string()))?;

        self.request = Some(Request {
            audio: Some(audio_tx),
            sample_rate,
            cancelled,
            worker: Some(worker),
        });
        Ok(())
    }

    fn install_tap(&mut self, buffer_size: u32) -> Result<()> {
        if self.request.is_none() {
            return Err(SpeechError::Request("no recognition request to feed".to_string()));
        }
        self.tap_buffer_size = Some(buffer_size);
        Ok(())
    }

    fn start_engine(&mut self) -> Result<()> {
        let audio = self
            .request
            .as_ref()
            .and_then(|request| request.audio.clone())
            .ok_or_else(|| SpeechError::Request("no recognition request to feed".to_string()))?;
        let buffer_size = self
            .tap_buffer_size
            .ok_or_else(|| SpeechError::Engine("no tap installed".to_string()))?;

        let stop_signal = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = bounded(1);
        let stop_for_capture = Arc::clone(&stop_signal);

        // cpal streams are not Send, so the stream lives on its own thread
        let thread = thread::Builder::new()
            .name("unispeech-capture".to_string())
            .spawn(move || Self::run_capture(audio, stop_for_capture, buffer_size, started_tx))
            .map_err(|e| SpeechError::Engine(e.to_string()))?;

        match started_rx.recv() {
            Ok(Ok(())) => {
                debug!(
                    sample_rate = self.request.as_ref().map(|r| r.sample_rate),
                    "capture started"
                );
                self.capture = Some(Capture {
                    stop_signal,
                    thread,
                });
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(SpeechError::Engine("capture thread exited".to_string()))
            }
        }
    }

    fn stop_engine(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop_signal.store(true, Ordering::SeqCst);
            capture.thread.thread().unpark();
            let _ = capture.thread.join();
        }
    }

    fn remove_tap(&mut self) {
        self.tap_buffer_size = None;
    }

    fn end_audio(&mut self) {
        if let Some(request) = self.request.as_mut() {
            request.audio = None;
        }
    }

    fn cancel_task(&mut self) {
        if let Some(request) = self.request.as_mut() {
            request.cancelled.store(true, Ordering::SeqCst);
            // Closing the channel wakes the worker so it can report
            request.audio = None;
        }
    }

    fn release_request(&mut self) {
        if let Some(mut request) = self.request.take() {
            request.audio = None;
            // The worker exits once its channel closes; it is not joined here
            // because it reports through the controller's own queue
            drop(request.worker.take());
        }
    }
}

impl Drop for VoskSpeechBackend {
    fn drop(&mut self) {
        self.cancel_task();
        self.stop_engine();
        self.release_request();
    }
}
