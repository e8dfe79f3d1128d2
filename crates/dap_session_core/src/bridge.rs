//! Event bridge.
//!
//! Relays a session's DAP execution-flow events to a [`NotificationSink`]
//! without blocking the transport:
//!
//! - listeners only copy the raw event into a bounded per-session queue
//! - one worker task per session drains the queue, so order is preserved
//! - translation and delivery failures are logged and the event is dropped
//!
//! `breakpoint` change events are subscribed to but never forwarded; consumers
//! query breakpoint state explicitly.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    transport::{EventListener, EventSource},
    DapError, Result,
};

/// Event names a bridge subscribes to.
pub const BRIDGED_EVENTS: [&str; 4] = ["stopped", "breakpoint", "terminated", "thread"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    BreakpointHit,
    Exception,
    Terminated,
    ThreadEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointHitPayload {
    pub session_id: String,
    pub location: String,
    pub thread_id: Option<i64>,
    pub reason: String,
    pub description: Option<String>,
    pub all_threads_stopped: bool,
    pub preserve_focus_hint: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionPayload {
    pub session_id: String,
    pub exception_type: String,
    pub message: String,
    pub thread_id: Option<i64>,
    pub reason: String,
    pub all_threads_stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedPayload {
    pub session_id: String,
    pub message: String,
    /// The adapter's `restart` value, `false` when absent.
    pub restart: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPayload {
    pub session_id: String,
    pub thread_id: Option<i64>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EventPayload {
    BreakpointHit(BreakpointHitPayload),
    Exception(ExceptionPayload),
    Terminated(TerminatedPayload),
    ThreadEvent(ThreadPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub session_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::BreakpointHit(_) => EventKind::BreakpointHit,
            EventPayload::Exception(_) => EventKind::Exception,
            EventPayload::Terminated(_) => EventKind::Terminated,
            EventPayload::ThreadEvent(_) => EventKind::ThreadEvent,
        }
    }
}

/// Receives translated envelopes. Provided by the embedding application.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// Sink that hands envelopes to an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<()> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| DapError::Delivery("envelope receiver dropped".to_string()))
    }
}

/// Translates one raw DAP event message.
///
/// `Ok(None)` means the event is deliberately not forwarded.
pub fn translate_event(session_id: &str, message: &Value) -> Result<Option<EventEnvelope>> {
    let event = message
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| DapError::InvalidEvent("missing 'event' field".to_string()))?;
    let empty = Value::Object(Default::default());
    let body = message.get("body").unwrap_or(&empty);

    let str_field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
    let bool_field = |key: &str| body.get(key).and_then(Value::as_bool).unwrap_or(false);
    let thread_id = body.get("threadId").and_then(Value::as_i64);

    let payload = match event {
        "stopped" => {
            let reason = str_field("reason").unwrap_or_default();
            match reason.as_str() {
                "breakpoint" => {
                    let location = body
                        .get("hitBreakpointIds")
                        .and_then(Value::as_array)
                        .and_then(|ids| ids.first())
                        .map(|id| match id {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_else(|| "unknown".to_string());
                    EventPayload::BreakpointHit(BreakpointHitPayload {
                        session_id: session_id.to_string(),
                        location,
                        thread_id,
                        reason: reason.clone(),
                        description: str_field("description"),
                        all_threads_stopped: bool_field("allThreadsStopped"),
                        preserve_focus_hint: bool_field("preserveFocusHint"),
                    })
                }
                "exception" => EventPayload::Exception(ExceptionPayload {
                    session_id: session_id.to_string(),
                    exception_type: "Exception".to_string(),
                    message: str_field("description")
                        .unwrap_or_else(|| "Exception occurred".to_string()),
                    thread_id,
                    reason: reason.clone(),
                    all_threads_stopped: bool_field("allThreadsStopped"),
                }),
                _ => {
                    tracing::debug!("Session {} stopped (reason={}); not forwarded", session_id, reason);
                    return Ok(None);
                }
            }
        }
        "terminated" => EventPayload::Terminated(TerminatedPayload {
            session_id: session_id.to_string(),
            message: "Program terminated".to_string(),
            restart: body.get("restart").cloned().unwrap_or(Value::Bool(false)),
        }),
        "thread" => {
            let reason = str_field("reason").unwrap_or_default();
            let message = match thread_id {
                Some(id) => format!("Thread {id} {reason}"),
                None => format!("Thread {reason}"),
            };
            EventPayload::ThreadEvent(ThreadPayload {
                session_id: session_id.to_string(),
                thread_id,
                message,
                reason,
            })
        }
        "breakpoint" => {
            let change = body.get("breakpoint").unwrap_or(&Value::Null);
            tracing::debug!(
                "Breakpoint {} in session {}: {}",
                str_field("reason").unwrap_or_default(),
                session_id,
                change
            );
            return Ok(None);
        }
        other => {
            tracing::trace!("Ignoring '{}' event for session {}", other, session_id);
            return Ok(None);
        }
    };

    Ok(Some(EventEnvelope {
        session_id: session_id.to_string(),
        payload,
    }))
}

/// Per-session relay from an [`EventSource`] to a [`NotificationSink`].
///
/// Must be created inside a tokio runtime. Dropping the bridge lets the worker
/// drain what is already queued and exit; [`EventBridge::shutdown`] also
/// waits for that.
pub struct EventBridge {
    session_id: String,
    queue: mpsc::Sender<Value>,
    worker: JoinHandle<()>,
}

impl EventBridge {
    pub fn new(
        session_id: impl Into<String>,
        source: &dyn EventSource,
        sink: Arc<dyn NotificationSink>,
        capacity: usize,
    ) -> Self {
        let session_id = session_id.into();
        let (queue, rx) = mpsc::channel(capacity.max(1));

        for event in BRIDGED_EVENTS {
            source.on_event(event, enqueue_listener(&session_id, &queue));
        }

        let worker = tokio::spawn(run_worker(session_id.clone(), rx, sink));
        tracing::debug!("Event bridge started for session {}", session_id);

        Self {
            session_id,
            queue,
            worker,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stops accepting events and waits for queued ones to be delivered.
    pub async fn shutdown(self) {
        let Self {
            session_id,
            queue,
            worker,
        } = self;
        drop(queue);
        if let Err(e) = worker.await {
            tracing::error!("Event bridge worker for session {} failed: {}", session_id, e);
        }
    }
}

fn enqueue_listener(session_id: &str, queue: &mpsc::Sender<Value>) -> EventListener {
    // Weak so the bridge, not the source, decides when the queue closes.
    let queue = queue.downgrade();
    let session_id = session_id.to_string();
    Arc::new(move |message: &Value| {
        let Some(queue) = queue.upgrade() else {
            return;
        };
        match queue.try_send(message.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Event queue full for session {}; dropping event", session_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    })
}

async fn run_worker(
    session_id: String,
    mut rx: mpsc::Receiver<Value>,
    sink: Arc<dyn NotificationSink>,
) {
    while let Some(message) = rx.recv().await {
        let envelope = match translate_event(&session_id, &message) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Failed to translate event for session {}: {}", session_id, e);
                continue;
            }
        };

        // Delivery runs in its own task so a panicking sink is contained.
        let sink = sink.clone();
        let delivery = tokio::spawn(async move { sink.deliver(&envelope).await });
        match delivery.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Dropping notification for session {}: {}", session_id, e);
            }
            Err(e) => {
                tracing::error!("Notification sink crashed for session {}: {}", session_id, e);
            }
        }
    }
    tracing::debug!("Event bridge stopped for session {}", session_id);
}
