use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Deadline for a single request attempt.
    pub request_timeout: Duration,
    /// Bound of each session's event bridge queue.
    pub event_queue_capacity: usize,
    /// Deadline for the best-effort `disconnect` sent during cleanup.
    pub cleanup_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

impl CoreConfig {
    pub fn new(request_timeout: Duration, event_queue_capacity: usize) -> Self {
        Self {
            request_timeout,
            event_queue_capacity: event_queue_capacity.max(1),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let request_timeout = env_millis("DAP_REQUEST_TIMEOUT_MS").unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let event_queue_capacity = std::env::var("DAP_EVENT_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_EVENT_QUEUE_CAPACITY);

        let cleanup_timeout = env_millis("DAP_CLEANUP_TIMEOUT_MS").unwrap_or(DEFAULT_CLEANUP_TIMEOUT);

        Self {
            request_timeout,
            event_queue_capacity,
            cleanup_timeout,
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
