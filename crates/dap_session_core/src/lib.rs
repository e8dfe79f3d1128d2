//! DAP Session Core
//!
//! Orchestration layer for live Debug Adapter Protocol sessions: which requests
//! may be retried and how, the registry of parent/child debug sessions and
//! "active session" routing, and the bridge that relays transport events to
//! a notification sink without blocking the transport.

pub mod bridge;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod registry;
pub mod retry;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use bridge::{ChannelSink, EventBridge, EventEnvelope, EventKind, EventPayload, NotificationSink};
pub use cleanup::{CleanupCoordinator, DisconnectCleanup};
pub use config::CoreConfig;
pub use error::{DapError, ErrorKind};
pub use registry::{SessionCounts, SessionRegistry};
pub use retry::{
    calculate_delay, get_retry_config, is_retryable_error, DapOperation, RetryPolicy, RetryStrategy,
    RetryingRequest,
};
pub use session::{Session, SessionSnapshot, SessionStatus};
pub use transport::{DapClient, EventDispatcher, EventListener, EventSource};

/// Result type alias using DapError
pub type Result<T> = std::result::Result<T, DapError>;
