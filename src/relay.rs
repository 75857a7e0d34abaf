//! Outbound message relay.
//!
//! The host receives every event as a `(target, handler, payload)` call. The
//! controller invokes the relay from its relay thread, in event order, so a
//! relay may call back into the controller.

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::info;

use crate::event::RecognitionEvent;

/// Delivers a named event with a string payload to the hosting application.
pub trait MessageRelay: Send + Sync {
    fn send_message(&self, target: &str, handler: &str, payload: &str);
}

impl<F> MessageRelay for F
where
    F: Fn(&str, &str, &str) + Send + Sync,
{
    fn send_message(&self, target: &str, handler: &str, payload: &str) {
        self(target, handler, payload)
    }
}

/// A message as it was handed to a [`ChannelRelay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    pub target: String,
    pub handler: String,
    pub payload: String,
}

impl RelayedMessage {
    pub fn event(&self) -> Option<RecognitionEvent> {
        RecognitionEvent::from_message(&self.handler, &self.payload)
    }
}

/// Forwards messages into a channel for a consumer on another thread.
#[derive(Debug, Clone)]
pub struct ChannelRelay {
    sender: Sender<RelayedMessage>,
}

impl ChannelRelay {
    pub fn new() -> (Self, Receiver<RelayedMessage>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl MessageRelay for ChannelRelay {
    fn send_message(&self, target: &str, handler: &str, payload: &str) {
        // A dropped receiver means nobody is listening anymore
        let _ = self.sender.send(RelayedMessage {
            target: target.to_string(),
            handler: handler.to_string(),
            payload: payload.to_string(),
        });
    }
}

/// Logs every message. Used when the host registers no callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRelay;

impl MessageRelay for TracingRelay {
    fn send_message(&self, target: &str, handler: &str, payload: &str) {
        info!(target_object = target, handler, payload, "relayed message");
    }
}
