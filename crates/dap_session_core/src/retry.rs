//! Retry policy engine.
//!
//! Classifies DAP operations as retryable or not and computes backoff delays.
//! Side-effecting control-flow requests are never retried: a duplicate
//! `continue` or `setVariable` would change what the debuggee does.

use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tokio::sync::watch;

use crate::{transport::DapClient, DapError, ErrorKind, Result};

const RETRYABLE_MESSAGES: [&str; 4] = ["connection", "timeout", "adapter not ready", "handshake"];
const NON_RETRYABLE_MESSAGES: [&str; 3] = ["session lost", "terminated", "invalid session"];

/// A DAP request name, parsed into a closed set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DapOperation {
    Continue,
    Next,
    StepIn,
    StepOut,
    StepBack,
    ReverseContinue,
    Pause,
    Launch,
    Attach,
    Disconnect,
    Terminate,
    SetVariable,
    SetBreakpoints,
    Threads,
    StackTrace,
    Scopes,
    Variables,
    Source,
    Initialize,
    ConfigurationDone,
    Evaluate,
    /// Any request this engine does not know. Always denied.
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    NonRetryable,
    Idempotent,
    ContextSensitive,
}

impl DapOperation {
    pub fn parse(name: &str) -> Self {
        match name {
            "continue" => Self::Continue,
            "next" => Self::Next,
            "stepIn" => Self::StepIn,
            "stepOut" => Self::StepOut,
            "stepBack" => Self::StepBack,
            "reverseContinue" => Self::ReverseContinue,
            "pause" => Self::Pause,
            "launch" => Self::Launch,
            "attach" => Self::Attach,
            "disconnect" => Self::Disconnect,
            "terminate" => Self::Terminate,
            "setVariable" => Self::SetVariable,
            "setBreakpoints" => Self::SetBreakpoints,
            "threads" => Self::Threads,
            "stackTrace" => Self::StackTrace,
            "scopes" => Self::Scopes,
            "variables" => Self::Variables,
            "source" => Self::Source,
            "initialize" => Self::Initialize,
            "configurationDone" => Self::ConfigurationDone,
            "evaluate" => Self::Evaluate,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Continue => "continue",
            Self::Next => "next",
            Self::StepIn => "stepIn",
            Self::StepOut => "stepOut",
            Self::StepBack => "stepBack",
            Self::ReverseContinue => "reverseContinue",
            Self::Pause => "pause",
            Self::Launch => "launch",
            Self::Attach => "attach",
            Self::Disconnect => "disconnect",
            Self::Terminate => "terminate",
            Self::SetVariable => "setVariable",
            Self::SetBreakpoints => "setBreakpoints",
            Self::Threads => "threads",
            Self::StackTrace => "stackTrace",
            Self::Scopes => "scopes",
            Self::Variables => "variables",
            Self::Source => "source",
            Self::Initialize => "initialize",
            Self::ConfigurationDone => "configurationDone",
            Self::Evaluate => "evaluate",
            Self::Other(name) => name,
        }
    }

    /// `None` for operations outside the known set.
    pub fn class(&self) -> Option<OperationClass> {
        match self {
            Self::Continue
            | Self::Next
            | Self::StepIn
            | Self::StepOut
            | Self::StepBack
            | Self::ReverseContinue
            | Self::Pause
            | Self::Launch
            | Self::Attach
            | Self::Disconnect
            | Self::Terminate
            | Self::SetVariable => Some(OperationClass::NonRetryable),
            Self::SetBreakpoints
            | Self::Threads
            | Self::StackTrace
            | Self::Scopes
            | Self::Variables
            | Self::Source
            | Self::Initialize
            | Self::ConfigurationDone => Some(OperationClass::Idempotent),
            Self::Evaluate => Some(OperationClass::ContextSensitive),
            Self::Other(_) => None,
        }
    }

    pub fn retry_policy(&self, context: Option<&HashMap<String, String>>) -> Option<RetryPolicy> {
        match self.class()? {
            OperationClass::NonRetryable => None,
            OperationClass::Idempotent => match self {
                Self::Initialize | Self::ConfigurationDone => Some(RetryPolicy::handshake()),
                _ => Some(RetryPolicy::default()),
            },
            OperationClass::ContextSensitive => {
                let evaluation_context = context.and_then(|ctx| ctx.get("context"))?;
                match evaluation_context.as_str() {
                    "watch" | "hover" => Some(RetryPolicy::default()),
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    None,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, counting the first one.
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy for `initialize`/`configurationDone`, where adapter start-up
    /// races make early failures likely to be transient.
    pub fn handshake() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            ..Self::default()
        }
    }
}

pub fn get_retry_config(operation: &str, context: Option<&HashMap<String, String>>) -> Option<RetryPolicy> {
    DapOperation::parse(operation).retry_policy(context)
}

pub fn calculate_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    match policy.strategy {
        RetryStrategy::None => Duration::ZERO,
        RetryStrategy::Linear => policy
            .initial_delay
            .checked_mul(attempt.saturating_add(1))
            .unwrap_or(policy.max_delay)
            .min(policy.max_delay),
        RetryStrategy::Exponential => {
            let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
            let secs = policy.initial_delay.as_secs_f64() * policy.backoff_factor.powi(exponent);
            let capped = secs.min(policy.max_delay.as_secs_f64());
            if capped.is_nan() || capped <= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(capped)
            }
        }
    }
}

/// Uses the error's kind tag when it has one, otherwise matches its message.
/// An exhausted or cancelled request is final whatever its cause was.
pub fn is_retryable_error(err: &(dyn std::error::Error + 'static)) -> bool {
    if let Some(dap) = err.downcast_ref::<DapError>() {
        if matches!(dap, DapError::Cancelled(_) | DapError::RetriesExhausted { .. }) {
            return false;
        }
        match dap.kind() {
            Some(ErrorKind::Timeout | ErrorKind::Connection) => return true,
            Some(ErrorKind::SessionLost) => return false,
            None => {}
        }
    }
    is_retryable_message(&err.to_string())
}

/// Unmatched messages are not retryable. Non-retryable phrases win over
/// retryable ones when both appear.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if NON_RETRYABLE_MESSAGES.iter().any(|needle| lower.contains(needle)) {
        return false;
    }
    RETRYABLE_MESSAGES.iter().any(|needle| lower.contains(needle))
}

/// One DAP request driven through the retry engine.
///
/// Each attempt gets its own deadline; between attempts the request sleeps
/// for the policy's delay unless the cancel signal fires first.
pub struct RetryingRequest<'a> {
    command: &'a str,
    arguments: Value,
    context: Option<&'a HashMap<String, String>>,
    attempt_timeout: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> RetryingRequest<'a> {
    pub fn new(command: &'a str, arguments: Value) -> Self {
        Self {
            command,
            arguments,
            context: None,
            attempt_timeout: None,
            cancel: None,
        }
    }

    /// Context used when the request arguments carry no `context` of their
    /// own. The arguments' value always wins: it is what the adapter runs.
    pub fn context(mut self, context: Option<&'a HashMap<String, String>>) -> Self {
        self.context = context;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Aborts the retry loop once the receiver observes `true`.
    pub fn cancel_on(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn send(mut self, client: &dyn DapClient) -> Result<Value> {
        let argument_context = self
            .arguments
            .get("context")
            .and_then(Value::as_str)
            .map(|context| HashMap::from([("context".to_string(), context.to_string())]));
        let policy = get_retry_config(self.command, argument_context.as_ref().or(self.context));
        let max_attempts = policy.as_ref().map_or(1, |p| p.max_attempts.max(1));
        let mut attempt = 0_u32;

        loop {
            if self.is_cancelled() {
                return Err(DapError::Cancelled(self.command.to_string()));
            }

            let err = match self.attempt_once(client).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let Some(policy) = policy.as_ref() else {
                return Err(err);
            };
            if !is_retryable_error(&err) {
                tracing::debug!("Not retrying '{}': {}", self.command, err);
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                tracing::warn!(
                    "Retry budget exhausted: command={}, attempts={}, error={}",
                    self.command,
                    max_attempts,
                    err
                );
                return Err(DapError::RetriesExhausted {
                    operation: self.command.to_string(),
                    attempts: max_attempts,
                    source: Box::new(err),
                });
            }

            let delay = calculate_delay(attempt, policy);
            tracing::warn!(
                "Retrying '{}' after {:?} (attempt {}/{}): {}",
                self.command,
                delay,
                attempt + 2,
                max_attempts,
                err
            );

            match self.cancel.as_mut() {
                Some(cancel) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_cancel(cancel) => {
                            return Err(DapError::Cancelled(self.command.to_string()));
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }

    async fn attempt_once(&self, client: &dyn DapClient) -> Result<Value> {
        let request = client.send_request(self.command, self.arguments.clone());
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| DapError::Timeout(limit))?,
            None => request.await,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|cancel| *cancel.borrow())
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}
