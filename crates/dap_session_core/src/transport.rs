//! Contracts the core expects from a DAP transport.
//!
//! The wire framing lives with whoever implements [`DapClient`]; the core only
//! needs request/response correlation and listener registration by event name.

use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::Result;

/// Callback invoked with the full DAP event message (`{"type":"event", ...}`).
///
/// Listeners run inside the transport's read loop and must return promptly.
pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

pub trait EventSource: Send + Sync {
    fn on_event(&self, event: &str, listener: EventListener);
}

#[async_trait]
pub trait DapClient: EventSource {
    /// Sends `command` and waits for the correlated response.
    ///
    /// Implementations return the whole response message on success and an
    /// error when the adapter answers with `success: false`.
    async fn send_request(&self, command: &str, arguments: Value) -> Result<Value>;

    /// Releases transport resources. Called once by the cleanup coordinator.
    async fn shutdown(&self) {}
}

/// Listener table keyed by DAP event name.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invokes every listener registered for the message's `event` field, in
    /// registration order. Returns how many listeners ran.
    pub fn dispatch(&self, message: &Value) -> usize {
        let Some(event) = message.get("event").and_then(Value::as_str) else {
            return 0;
        };

        // Listeners are cloned out so one may register another without deadlocking.
        let listeners = {
            let table = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            match table.get(event) {
                Some(listeners) => listeners.clone(),
                None => return 0,
            }
        };

        for listener in &listeners {
            listener(message);
        }

        tracing::trace!("Dispatched DAP event: event={}, listeners={}", event, listeners.len());
        listeners.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }
}

impl EventSource for EventDispatcher {
    fn on_event(&self, event: &str, listener: EventListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }
}
