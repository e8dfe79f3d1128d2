use async_trait::async_trait;
use serde_json::json;
use std::{sync::Arc, time::Duration};

use crate::{
    session::{Session, SessionStatus},
    CoreConfig, DapError, Result,
};

/// Tears down the adapter-side resources behind a session.
///
/// The registry calls this before dropping a session from its tables; the
/// coordinator must not call back into the registry.
#[async_trait]
pub trait CleanupCoordinator: Send + Sync {
    async fn cleanup_session(&self, session: &Session) -> Result<()>;

    /// `sessions` arrives with children ahead of their parents.
    async fn cleanup_all(&self, sessions: &[Arc<Session>]) -> Result<()> {
        for session in sessions {
            if let Err(e) = self.cleanup_session(session).await {
                tracing::warn!("Cleanup of session {} failed: {}", session.id(), e);
            }
        }
        Ok(())
    }
}

/// Sends a best-effort `disconnect` and then shuts the client down.
///
/// `disconnect` is never retried; a timeout or adapter error only gets logged
/// and the transport is closed regardless.
#[derive(Debug, Clone)]
pub struct DisconnectCleanup {
    timeout: Duration,
    terminate_debuggee: bool,
}

impl Default for DisconnectCleanup {
    fn default() -> Self {
        Self::new(CoreConfig::default().cleanup_timeout)
    }
}

impl DisconnectCleanup {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            terminate_debuggee: true,
        }
    }

    pub fn terminate_debuggee(mut self, terminate: bool) -> Self {
        self.terminate_debuggee = terminate;
        self
    }
}

#[async_trait]
impl CleanupCoordinator for DisconnectCleanup {
    async fn cleanup_session(&self, session: &Session) -> Result<()> {
        let Some(client) = session.client() else {
            session.set_status(SessionStatus::Terminated);
            return Ok(());
        };

        let disconnect = client.send_request(
            "disconnect",
            json!({ "terminateDebuggee": self.terminate_debuggee }),
        );
        let outcome = match tokio::time::timeout(self.timeout, disconnect).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(DapError::Timeout(self.timeout)),
        };

        client.shutdown().await;
        session.set_status(SessionStatus::Terminated);

        if let Err(e) = &outcome {
            tracing::debug!("Disconnect of session {} did not complete: {}", session.id(), e);
        }
        outcome
    }
}
