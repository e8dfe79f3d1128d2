mod adapter;
mod sink;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dap_session_core::{
    CoreConfig, DapClient, DapError, DisconnectCleanup, EventBridge, EventSource, RetryingRequest,
    Session, SessionRegistry,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    service::{RequestContext, RoleServer},
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex};

use crate::{adapter::StdioAdapter, sink::McpNotificationSink};

const INITIALIZED_EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_EVENTS: [&str; 4] = ["stopped", "continued", "terminated", "exited"];

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerAttachParams {
    language: String,
    /// "attach" (default) or "launch"
    #[serde(default)]
    request: Option<String>,
    /// Adapter-specific attach/launch arguments, passed through verbatim.
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
    #[serde(default)]
    adapter_path: Option<String>,
    #[serde(default)]
    adapter_args: Vec<String>,
    #[serde(default)]
    session_id: Option<String>,
    /// Registers the new session as a child of this one.
    #[serde(default)]
    parent_session_id: Option<String>,
    /// Makes the new child the parent's active child.
    #[serde(default)]
    activate: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerDetachParams {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSessionsParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerActiveSessionParams {
    language: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSetActiveChildParams {
    parent_session_id: String,
    child_session_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerRequestParams {
    command: String,
    /// DAP request arguments. For `evaluate`, `arguments.context` decides
    /// whether the request may be retried.
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
    /// Session to address; its active child receives the request if it has one.
    #[serde(default)]
    session_id: Option<String>,
}

/// Per-session resources owned by the server rather than the registry.
struct SessionHandles {
    bridge: EventBridge,
    cancel: watch::Sender<bool>,
}

#[derive(Clone)]
struct DebuggerMcpServer {
    tool_router: ToolRouter<Self>,
    registry: Arc<SessionRegistry>,
    handles: Arc<Mutex<HashMap<String, SessionHandles>>>,
    config: CoreConfig,
    next_session: Arc<AtomicU64>,
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

const PTRACE_DENIED_MARKERS: [&str; 3] = ["eperm", "ptrace", "operation not permitted"];

fn attach_error(stage: &str, e: DapError) -> McpError {
    to_mcp_error(describe_attach_failure(stage, &e.to_string()))
}

/// Adds a hint when the adapter was refused ptrace access to the debuggee.
fn describe_attach_failure(stage: &str, cause: &str) -> String {
    let lower = cause.to_lowercase();
    if PTRACE_DENIED_MARKERS.iter().any(|marker| lower.contains(marker)) {
        format!("{stage}: {cause} (the OS denied ptrace; check kernel.yama.ptrace_scope or grant CAP_SYS_PTRACE)")
    } else {
        format!("{stage}: {cause}")
    }
}

fn initialize_args(language: &str) -> Value {
    json!({
        "adapterID": language,
        "clientID": "debugger_mcp_server",
        "clientName": "debugger_mcp_server",
        "locale": "en-US",
        "pathFormat": "path",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "supportsVariableType": true,
        "supportsVariablePaging": true,
        "supportsRunInTerminalRequest": false,
    })
}

/// Keeps the session's status in step with lifecycle events. Holds the
/// session weakly: the session owns the client that owns this listener.
fn track_status(client: &dyn EventSource, session: &Arc<Session>) {
    for event in STATUS_EVENTS {
        let session: Weak<Session> = Arc::downgrade(session);
        client.on_event(
            event,
            Arc::new(move |message: &Value| {
                if let Some(session) = session.upgrade() {
                    session.apply_event(message);
                }
            }),
        );
    }
}

#[tool_router]
impl DebuggerMcpServer {
    fn new(config: CoreConfig) -> Self {
        let cleanup = DisconnectCleanup::new(config.cleanup_timeout);
        Self {
            tool_router: Self::tool_router(),
            registry: Arc::new(SessionRegistry::new(Arc::new(cleanup))),
            handles: Arc::new(Mutex::new(HashMap::new())),
            config,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    fn target_session(&self, session_id: Option<&str>, tool_name: &str) -> Result<Arc<Session>, McpError> {
        let session = match session_id {
            Some(id) => self.registry.get_session(id),
            None => self.registry.default_session(),
        };
        session.ok_or_else(|| {
            to_mcp_error(format!(
                "{tool_name} requires an attached debugger session. Call debugger_attach first."
            ))
        })
    }

    async fn release_handles(&self, session_ids: &[String]) {
        let released: Vec<SessionHandles> = {
            let mut handles = self.handles.lock().await;
            session_ids.iter().filter_map(|id| handles.remove(id)).collect()
        };
        for handle in released {
            let _ = handle.cancel.send(true);
            handle.bridge.shutdown().await;
        }
    }

    #[tool(description = "Start a debug adapter, attach or launch, and register the session")]
    async fn debugger_attach(
        &self,
        params: Parameters<DebuggerAttachParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;

        if let Some(parent_id) = params.parent_session_id.as_deref() {
            if self.registry.get_session(parent_id).is_none() {
                return Err(McpError::invalid_params(
                    format!("Unknown parent session '{parent_id}'"),
                    None,
                ));
            }
        }

        let request = params.request.as_deref().unwrap_or("attach");
        if request != "attach" && request != "launch" {
            return Err(McpError::invalid_params(
                format!("request must be 'attach' or 'launch', got '{request}'"),
                None,
            ));
        }

        let session_id = params.session_id.clone().unwrap_or_else(|| {
            let n = self.next_session.fetch_add(1, Ordering::SeqCst);
            format!("{}-{n}", params.language)
        });
        if self.registry.get_session(&session_id).is_some() {
            return Err(McpError::invalid_params(
                format!("Session '{session_id}' is already registered"),
                None,
            ));
        }

        let adapter_path = params
            .adapter_path
            .clone()
            .or_else(|| std::env::var("DAP_ADAPTER_PATH").ok())
            .ok_or_else(|| {
                to_mcp_error("Missing debug adapter path. Set DAP_ADAPTER_PATH or pass adapter_path.")
            })?;

        let adapter = StdioAdapter::spawn(&adapter_path, &params.adapter_args, self.config.request_timeout)
            .map_err(|e| to_mcp_error(format!("Failed to start debug adapter: {e}")))?;

        let (cancel, cancel_rx) = watch::channel(false);
        let handshake = async {
            RetryingRequest::new("initialize", initialize_args(&params.language))
                .attempt_timeout(self.config.request_timeout)
                .cancel_on(cancel_rx.clone())
                .send(adapter.as_ref())
                .await
                .map_err(|e| attach_error("Failed DAP initialize handshake with adapter", e))?;

            let arguments = Value::Object(params.arguments.clone().unwrap_or_default());
            let (seq, rx) = adapter
                .send_request_begin(request, arguments)
                .await
                .map_err(|e| attach_error("Failed to send DAP attach request", e))?;

            if !adapter.wait_for_initialized_event(INITIALIZED_EVENT_WAIT_TIMEOUT).await {
                tracing::warn!("Timed out waiting for DAP initialized event before configurationDone");
            }

            RetryingRequest::new("configurationDone", json!({}))
                .attempt_timeout(self.config.request_timeout)
                .cancel_on(cancel_rx.clone())
                .send(adapter.as_ref())
                .await
                .map_err(|e| attach_error("Failed to send DAP configurationDone", e))?;

            adapter
                .await_response(request, seq, rx)
                .await
                .map_err(|e| attach_error("DAP attach request failed", e))
        };

        if let Err(e) = handshake.await {
            adapter.shutdown().await;
            return Err(e);
        }

        let mut session = Session::new(session_id.clone(), params.language.clone())
            .with_client(adapter.clone());
        if params.parent_session_id.is_some() {
            session = session.as_child();
        }
        let session = Arc::new(session);
        track_status(adapter.as_ref(), &session);

        let bridge = EventBridge::new(
            session_id.clone(),
            adapter.as_ref(),
            Arc::new(McpNotificationSink::new(context.peer.clone())),
            self.config.event_queue_capacity,
        );
        self.handles
            .lock()
            .await
            .insert(session_id.clone(), SessionHandles { bridge, cancel });

        self.registry.register_session(session);
        if let Some(parent_id) = params.parent_session_id.as_deref() {
            self.registry.register_parent_child(parent_id, &session_id);
            if params.activate {
                self.registry.set_active_child(parent_id, &session_id);
            }
        }
        if self.registry.default_session().is_none() {
            self.registry.set_default_session(&session_id);
        }

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "attached",
            "session_id": session_id,
            "parent_session_id": params.parent_session_id,
        })))
    }

    #[tool(description = "Detach a debugger session and tear down its child sessions")]
    async fn debugger_detach(
        &self,
        params: Parameters<DebuggerDetachParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = match self.target_session(params.session_id.as_deref(), "debugger_detach") {
            Ok(session) => session,
            Err(_) if params.session_id.is_none() => {
                return Ok(CallToolResult::structured(json!({
                    "ok": true,
                    "state": "detached",
                })));
            }
            Err(e) => return Err(e),
        };

        let mut removed = self.registry.get_child_ids(session.id());
        removed.push(session.id().to_string());

        // Stop in-flight retries before the transport goes away.
        {
            let handles = self.handles.lock().await;
            for id in &removed {
                if let Some(handle) = handles.get(id) {
                    let _ = handle.cancel.send(true);
                }
            }
        }

        self.registry.cleanup_session(session.id()).await;
        self.release_handles(&removed).await;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": "detached",
            "session_id": session.id(),
            "removed": removed,
        })))
    }

    #[tool(description = "List registered debugger sessions and their parent/child relationships")]
    async fn debugger_sessions(
        &self,
        _params: Parameters<DebuggerSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let sessions: Vec<Value> = self
            .registry
            .get_all_sessions()
            .iter()
            .map(|session| {
                json!({
                    "session": session.snapshot(),
                    "children": self.registry.get_child_ids(session.id()),
                    "active_child": self.registry.get_active_child(session.id()),
                })
            })
            .collect();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "counts": self.registry.count_sessions(),
            "default_session_id": self.registry.default_session().map(|s| s.id().to_string()),
            "sessions": sessions,
        })))
    }

    #[tool(description = "Resolve which session the next command for a language should target")]
    async fn debugger_active_session(
        &self,
        params: Parameters<DebuggerActiveSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let active = self.registry.get_active_session(&params.0.language);
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "language": params.0.language,
            "session": active.map(|s| s.snapshot()),
        })))
    }

    #[tool(description = "Route commands addressed to a parent session to one of its children")]
    async fn debugger_set_active_child(
        &self,
        params: Parameters<DebuggerSetActiveChildParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        if !self
            .registry
            .get_child_ids(&params.parent_session_id)
            .contains(&params.child_session_id)
        {
            return Err(McpError::invalid_params(
                format!(
                    "Session '{}' is not a child of '{}'",
                    params.child_session_id, params.parent_session_id
                ),
                None,
            ));
        }

        self.registry
            .set_active_child(&params.parent_session_id, &params.child_session_id);

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "parent_session_id": params.parent_session_id,
            "active_child": params.child_session_id,
        })))
    }

    #[tool(description = "Send a DAP request to a session, retrying only when it is safe to")]
    async fn debugger_request(
        &self,
        params: Parameters<DebuggerRequestParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let addressed = self.target_session(params.session_id.as_deref(), "debugger_request")?;
        let session = self.registry.resolve_active_session(&addressed);
        let client = session
            .client()
            .cloned()
            .ok_or_else(|| to_mcp_error(format!("Session '{}' has no adapter connection", session.id())))?;

        let cancel = {
            let handles = self.handles.lock().await;
            handles.get(session.id()).map(|h| h.cancel.subscribe())
        };
        let arguments = Value::Object(params.arguments.unwrap_or_default());

        let mut request = RetryingRequest::new(&params.command, arguments)
            .attempt_timeout(self.config.request_timeout);
        if let Some(cancel) = cancel {
            request = request.cancel_on(cancel);
        }

        let response = request
            .send(client.as_ref())
            .await
            .map_err(|e| to_mcp_error(e.to_string()))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "session_id": session.id(),
            "command": params.command,
            "body": response.get("body").cloned().unwrap_or(Value::Null),
        })))
    }
}

#[tool_handler]
impl ServerHandler for DebuggerMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_logging()
                .enable_tools()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Debugger MCP Server managing multiple DAP sessions with parent/child routing".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP transport.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let server = DebuggerMcpServer::new(CoreConfig::from_env());
    let registry = server.registry.clone();
    let transport = transport::stdio();

    tracing::info!("Starting Debugger MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    registry.cleanup_all().await;

    Ok(())
}
