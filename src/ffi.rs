//! C ABI for engine plugins.
//!
//! The host creates a controller with a `send_message` callback (on iOS
//! typically a shim around `UnitySendMessage`), drives it through the
//! `unispeech_*` calls and destroys it when done. The callback is invoked
//! from the controller's relay thread and may itself call any `unispeech_*`
//! function on the same handle, including `unispeech_destroy`. See
//! `include/unispeech.h`.
//!
//! # Swift Side
//!
//! ```swift
//! @_cdecl("unispeech_send_message")
//! func unispeechSendMessage(target: UnsafePointer<CChar>,
//!                           handler: UnsafePointer<CChar>,
//!                           payload: UnsafePointer<CChar>) {
//!     UnityFramework.getInstance().sendMessageToGO(
//!         withName: String(cString: target),
//!         functionName: String(cString: handler),
//!         message: String(cString: payload))
//! }
//!
//! let speech = unispeech_create(unispeech_send_message)
//! unispeech_request_authorization(speech)
//! ```

use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::sync::Arc;

use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BridgeConfig;
use crate::controller::SessionController;
use crate::relay::{MessageRelay, TracingRelay};

/// `send_message(target, handler, payload)`, all NUL-terminated UTF-8.
pub type SendMessageFn =
    unsafe extern "C" fn(target: *const c_char, handler: *const c_char, payload: *const c_char);

struct ExternRelay {
    send_message: SendMessageFn,
}

fn to_cstring(value: &str) -> CString {
    CString::new(value.replace('\0', "")).unwrap_or_default()
}

impl MessageRelay for ExternRelay {
    fn send_message(&self, target: &str, handler: &str, payload: &str) {
        let target = to_cstring(target);
        let handler = to_cstring(handler);
        let payload = to_cstring(payload);
        unsafe { (self.send_message)(target.as_ptr(), handler.as_ptr(), payload.as_ptr()) }
    }
}

fn into_handle(controller: SessionController) -> *mut SessionController {
    Box::into_raw(Box::new(controller))
}

/// Installs a stderr log subscriber honouring `RUST_LOG`. Safe to call
/// more than once.
#[no_mangle]
pub extern "C" fn unispeech_init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Creates a controller on the platform backend. Returns null on failure.
/// A null `send_message` logs messages instead of delivering them.
#[no_mangle]
pub extern "C" fn unispeech_create(send_message: Option<SendMessageFn>) -> *mut SessionController {
    let relay: Arc<dyn MessageRelay> = match send_message {
        Some(send_message) => Arc::new(ExternRelay { send_message }),
        None => Arc::new(TracingRelay),
    };

    let config = match BridgeConfig::load(None) {
        Ok(config) => config,
        Err(err) => {
            warn!("ignoring invalid environment configuration: {err}");
            BridgeConfig::default()
        }
    };

    match SessionController::with_platform_backend(config, relay) {
        Ok(controller) => into_handle(controller),
        Err(err) => {
            error!("failed to create speech controller: {err}");
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `controller` must come from `unispeech_create` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn unispeech_destroy(controller: *mut SessionController) {
    if !controller.is_null() {
        drop(Box::from_raw(controller));
    }
}

/// # Safety
/// `controller` must be a live handle; `name` a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn unispeech_set_target_name(
    controller: *const SessionController,
    name: *const c_char,
) -> bool {
    let Some(controller) = controller.as_ref() else {
        return false;
    };
    if name.is_null() {
        return false;
    }
    let name = CStr::from_ptr(name).to_string_lossy().into_owned();
    controller.set_target_name(name).is_ok()
}

/// # Safety
/// `controller` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn unispeech_request_authorization(controller: *const SessionController) {
    if let Some(controller) = controller.as_ref() {
        if let Err(err) = controller.request_authorization() {
            warn!("authorization request failed: {err}");
        }
    }
}

/// Returns false if a session is already running or the start failed.
///
/// # Safety
/// `controller` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn unispeech_start_record(controller: *const SessionController) -> bool {
    controller
        .as_ref()
        .is_some_and(|controller| controller.start().is_ok())
}

/// Returns false if no session is running.
///
/// # Safety
/// `controller` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn unispeech_stop_record(controller: *const SessionController) -> bool {
    controller
        .as_ref()
        .is_some_and(|controller| controller.stop().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{MockBackend, SpeechBackend};
    use std::sync::Mutex;

    static RECEIVED: Mutex<Vec<(String, String, String)>> = Mutex::new(Vec::new());

    unsafe extern "C" fn record_message(
        target: *const c_char,
        handler: *const c_char,
        payload: *const c_char,
    ) {
        let read = |ptr: *const c_char| CStr::from_ptr(ptr).to_string_lossy().into_owned();
        RECEIVED
            .lock()
            .unwrap()
            .push((read(target), read(handler), read(payload)));
    }

    #[test]
    fn test_extern_relay_strips_nul_bytes() {
        let relay = ExternRelay {
            send_message: record_message,
        };
        relay.send_message("Speech\0Recognizer", "OnRecognized", "a\0b");

        let received = RECEIVED.lock().unwrap();
        assert!(received.contains(&(
            "SpeechRecognizer".to_string(),
            "OnRecognized".to_string(),
            "ab".to_string()
        )));
    }

    #[test]
    fn test_record_calls_map_to_bool() {
        let (backend, _mock) = MockBackend::scripted();
        let controller = SessionController::spawn(
            BridgeConfig::default(),
            Arc::new(TracingRelay),
            move |_| Ok(Box::new(backend) as Box<dyn SpeechBackend>),
        )
        .unwrap();
        let handle = into_handle(controller);

        unsafe {
            assert!(!unispeech_stop_record(handle));
            assert!(unispeech_start_record(handle));
            assert!(!unispeech_start_record(handle));
            assert!(unispeech_stop_record(handle));
            assert!(!unispeech_stop_record(handle));

            let name = CString::new("Microphone").unwrap();
            assert!(unispeech_set_target_name(handle, name.as_ptr()));
            let empty = CString::new("").unwrap();
            assert!(!unispeech_set_target_name(handle, empty.as_ptr()));
            assert_eq!((*handle).target_name().unwrap(), "Microphone");

            unispeech_destroy(handle);
        }
    }

    #[test]
    fn test_null_handles_are_rejected() {
        unsafe {
            assert!(!unispeech_start_record(ptr::null()));
            assert!(!unispeech_stop_record(ptr::null()));
            assert!(!unispeech_set_target_name(ptr::null(), ptr::null()));
            unispeech_request_authorization(ptr::null());
            unispeech_destroy(ptr::null_mut());
        }
    }
}
