use async_trait::async_trait;
use dap_session_core::{DapError, EventEnvelope, EventKind, NotificationSink, Result};
use rmcp::{
    model::{LoggingLevel, LoggingMessageNotificationParam},
    service::{Peer, RoleServer},
};

const LOGGER_NAME: &str = "dap_events";

/// Pushes event envelopes to the MCP client as logging notifications.
pub struct McpNotificationSink {
    peer: Peer<RoleServer>,
}

impl McpNotificationSink {
    pub fn new(peer: Peer<RoleServer>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl NotificationSink for McpNotificationSink {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<()> {
        let data = serde_json::to_value(envelope)?;
        self.peer
            .notify_logging_message(LoggingMessageNotificationParam {
                level: notification_level(envelope.kind()),
                logger: Some(LOGGER_NAME.to_string()),
                data,
            })
            .await
            .map_err(|e| DapError::Delivery(e.to_string()))
    }
}

fn notification_level(kind: EventKind) -> LoggingLevel {
    match kind {
        EventKind::Exception => LoggingLevel::Warning,
        EventKind::BreakpointHit | EventKind::Terminated => LoggingLevel::Notice,
        EventKind::ThreadEvent => LoggingLevel::Info,
    }
}
