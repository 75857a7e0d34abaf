//! macOS and iOS speech recognition using the native Speech framework.

use std::ptr::NonNull;
use std::sync::Mutex;

use block2::RcBlock;
use objc2::rc::Retained;
use objc2::runtime::{NSObject, NSObjectProtocol, ProtocolObject};
use objc2::{define_class, msg_send, AllocAnyThread, DefinedClass};
use objc2_avf_audio::{AVAudioEngine, AVAudioPCMBuffer, AVAudioTime};
use objc2_foundation::{NSError, NSLocale, NSOperationQueue, NSString};
use objc2_speech::{
    SFSpeechAudioBufferRecognitionRequest, SFSpeechRecognitionResult, SFSpeechRecognitionTask,
    SFSpeechRecognizer, SFSpeechRecognizerAuthorizationStatus, SFSpeechRecognizerDelegate,
};
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{Result, SpeechError};

use super::{
    AuthorizationReply, AuthorizationStatus, AvailabilityHandler, RecognitionResult,
    SpeechBackend, TaskHandler, TaskReport,
};

const INPUT_BUS: usize = 0;

struct ObserverIvars {
    handler: AvailabilityHandler,
}

define_class!(
    // SAFETY: NSObject has no subclassing requirements and the class does
    // not implement Drop.
    #[unsafe(super(NSObject))]
    #[name = "UniSpeechAvailabilityObserver"]
    #[ivars = ObserverIvars]
    struct AvailabilityObserver;

    unsafe impl NSObjectProtocol for AvailabilityObserver {}

    unsafe impl SFSpeechRecognizerDelegate for AvailabilityObserver {
        #[unsafe(method(speechRecognizer:availabilityDidChange:))]
        fn availability_did_change(&self, _recognizer: &SFSpeechRecognizer, available: bool) {
            (self.ivars().handler)(available);
        }
    }
);

impl AvailabilityObserver {
    fn new(handler: AvailabilityHandler) -> Retained<Self> {
        let this = Self::alloc().set_ivars(ObserverIvars { handler });
        unsafe { msg_send![super(this), init] }
    }
}

type TapBlock = RcBlock<dyn Fn(NonNull<AVAudioPCMBuffer>, NonNull<AVAudioTime>)>;
type ResultBlock = RcBlock<dyn Fn(*mut SFSpeechRecognitionResult, *mut NSError)>;

pub struct AppleSpeechBackend {
    recognizer: Retained<SFSpeechRecognizer>,
    audio_engine: Retained<AVAudioEngine>,
    request: Option<Retained<SFSpeechAudioBufferRecognitionRequest>>,
    task: Option<Retained<SFSpeechRecognitionTask>>,
    // The recognizer holds its delegate weakly
    observer: Option<Retained<AvailabilityObserver>>,
    _queue: Retained<NSOperationQueue>,
    // Keep blocks alive
    tap_block: Option<TapBlock>,
    result_block: Option<ResultBlock>,
}

fn describe(error: &NSError) -> String {
    unsafe { error.localizedDescription() }.to_string()
}

impl AppleSpeechBackend {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let recognizer = unsafe {
            let locale = match &config.locale {
                Some(identifier) => {
                    NSLocale::localeWithLocaleIdentifier(&NSString::from_str(identifier))
                }
                None => NSLocale::currentLocale(),
            };
            SFSpeechRecognizer::initWithLocale(SFSpeechRecognizer::alloc(), &locale)
        }
        .ok_or_else(|| {
            SpeechError::RecognizerUnavailable(format!(
                "no recognizer for locale {}",
                config.locale.as_deref().unwrap_or("(current)")
            ))
        })?;

        // Results arrive on our own queue; the controller marshals them
        let queue = NSOperationQueue::new();
        unsafe {
            recognizer.setQueue(&queue);
        }

        let audio_engine = unsafe { AVAudioEngine::new() };

        Ok(Self {
            recognizer,
            audio_engine,
            request: None,
            task: None,
            observer: None,
            _queue: queue,
            tap_block: None,
            result_block: None,
        })
    }
}

impl SpeechBackend for AppleSpeechBackend {
    fn name(&self) -> &str {
        "apple-speech"
    }

    fn request_authorization(&self, reply: AuthorizationReply) {
        let reply = Mutex::new(Some(reply));
        let handler = RcBlock::new(move |status: SFSpeechRecognizerAuthorizationStatus| {
            let reply = reply.lock().ok().and_then(|mut reply| reply.take());
            if let Some(reply) = reply {
                reply(AuthorizationStatus::from_raw(status.0));
            }
        });

        unsafe {
            SFSpeechRecognizer::requestAuthorization(&handler);
        }
    }

    fn set_availability_handler(&mut self, handler: AvailabilityHandler) {
        let observer = AvailabilityObserver::new(handler);
        unsafe {
            self.recognizer
                .setDelegate(Some(ProtocolObject::from_ref(&*observer)));
        }
        self.observer = Some(observer);
    }

    fn is_running(&self) -> bool {
        unsafe { self.audio_engine.isRunning() }
    }

    #[cfg(target_os = "ios")]
    fn configure_audio_session(&mut self) -> Result<()> {
        use objc2_avf_audio::{
            AVAudioSession, AVAudioSessionCategoryRecord, AVAudioSessionModeMeasurement,
            AVAudioSessionSetActiveOptions,
        };

        unsafe {
            let session = AVAudioSession::sharedInstance();
            session
                .setCategory_error(AVAudioSessionCategoryRecord)
                .map_err(|e| SpeechError::AudioSession(describe(&e)))?;
            session
                .setMode_error(AVAudioSessionModeMeasurement)
                .map_err(|e| SpeechError::AudioSession(describe(&e)))?;
            session
                .setActive_withOptions_error(
                    true,
                    AVAudioSessionSetActiveOptions::NotifyOthersOnDeactivation,
                )
                .map_err(|e| SpeechError::AudioSession(describe(&e)))?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "ios"))]
    fn configure_audio_session(&mut self) -> Result<()> {
        // macOS has no shared audio session to configure
        Ok(())
    }

    fn start_recognition(&mut self, partial_results: bool, handler: TaskHandler) -> Result<()> {
        let request = unsafe { SFSpeechAudioBufferRecognitionRequest::new() };
        unsafe {
            request.setShouldReportPartialResults(partial_results);
        }

        let result_block = RcBlock::new(
            move |result: *mut SFSpeechRecognitionResult, error: *mut NSError| {
                let mut report = TaskReport::default();

                if let Some(result) = unsafe { result.as_ref() } {
                    let text = unsafe { result.bestTranscription().formattedString() };
                    report.result = Some(RecognitionResult {
                        text: text.to_string(),
                        is_final: unsafe { result.isFinal() },
                    });
                }
                if let Some(error) = unsafe { error.as_ref() } {
                    report.error = Some(describe(error));
                }

                handler(report);
            },
        );

        let task = unsafe {
            self.recognizer
                .recognitionTaskWithRequest_resultHandler(&request, &result_block)
        };

        self.request = Some(request);
        self.task = Some(task);
        self.result_block = Some(result_block);
        Ok(())
    }

    fn install_tap(&mut self, buffer_size: u32) -> Result<()> {
        let request_for_tap = self
            .request
            .clone()
            .ok_or_else(|| SpeechError::Request("no recognition request to feed".to_string()))?;

        let input_node = unsafe { self.audio_engine.inputNode() };
        let format = unsafe { input_node.outputFormatForBus(INPUT_BUS) };

        let tap_block = RcBlock::new(
            move |buffer: NonNull<AVAudioPCMBuffer>, _when: NonNull<AVAudioTime>| unsafe {
                request_for_tap.appendAudioPCMBuffer(buffer.as_ref());
            },
        );

        unsafe {
            // Convert RcBlock to raw pointer for the C API
            let tap_block_ptr = &*tap_block as *const block2::Block<_> as *mut block2::Block<_>;
            input_node.installTapOnBus_bufferSize_format_block(
                INPUT_BUS,
                buffer_size,
                Some(&format),
                tap_block_ptr,
            );
        }

        self.tap_block = Some(tap_block);
        Ok(())
    }

    fn start_engine(&mut self) -> Result<()> {
        unsafe {
            self.audio_engine.prepare();
            self.audio_engine
                .startAndReturnError()
                .map_err(|e| SpeechError::Engine(describe(&e)))?;
        }
        debug!("audio engine started");
        Ok(())
    }

    fn stop_engine(&mut self) {
        unsafe {
            self.audio_engine.stop();
        }
    }

    fn remove_tap(&mut self) {
        if self.tap_block.take().is_some() {
            unsafe {
                self.audio_engine.inputNode().removeTapOnBus(INPUT_BUS);
            }
        }
    }

    fn end_audio(&mut self) {
        if let Some(ref request) = self.request {
            unsafe {
                request.endAudio();
            }
        }
    }

    fn cancel_task(&mut self) {
        if let Some(ref task) = self.task {
            unsafe {
                task.cancel();
            }
        }
    }

    fn release_request(&mut self) {
        self.request = None;
        self.task = None;
        self.result_block = None;
    }
}

impl Drop for AppleSpeechBackend {
    fn drop(&mut self) {
        self.cancel_task();
        self.stop_engine();
        self.remove_tap();
        self.release_request();
        unsafe {
            self.recognizer.setDelegate(None);
        }
    }
}
