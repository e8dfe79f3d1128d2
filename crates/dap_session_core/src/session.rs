use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::transport::DapClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Terminated,
    Errored,
}

impl SessionStatus {
    /// Status implied by a DAP lifecycle event, if the event implies one.
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "stopped" => Some(Self::Paused),
            "continued" => Some(Self::Running),
            "terminated" | "exited" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Terminated => write!(f, "terminated"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// One debuggee under control of a DAP connection.
///
/// Identity fields are fixed at construction; only the status changes, in
/// place, as execution-control events arrive.
pub struct Session {
    id: String,
    language: String,
    is_child: bool,
    status: RwLock<SessionStatus>,
    client: Option<Arc<dyn DapClient>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub language: String,
    pub is_child: bool,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            language: language.into(),
            is_child: false,
            status: RwLock::new(SessionStatus::Running),
            client: None,
        }
    }

    pub fn as_child(mut self) -> Self {
        self.is_child = true;
        self
    }

    pub fn with_status(self, status: SessionStatus) -> Self {
        self.set_status(status);
        self
    }

    pub fn with_client(mut self, client: Arc<dyn DapClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn is_child(&self) -> bool {
        self.is_child
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: SessionStatus) {
        let mut current = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if *current != status {
            tracing::debug!("Session {} status: {} -> {}", self.id, *current, status);
            *current = status;
        }
    }

    /// Updates the status from a DAP event message. Returns the new status
    /// when the event changed it.
    pub fn apply_event(&self, message: &Value) -> Option<SessionStatus> {
        let event = message.get("event").and_then(Value::as_str)?;
        let status = SessionStatus::from_event(event)?;
        self.set_status(status);
        Some(status)
    }

    pub fn client(&self) -> Option<&Arc<dyn DapClient>> {
        self.client.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            language: self.language.clone(),
            is_child: self.is_child,
            status: self.status(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("is_child", &self.is_child)
            .field("status", &self.status())
            .field("has_client", &self.client.is_some())
            .finish()
    }
}
