//! DAP client over a debug adapter's stdio.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dap_session_core::{DapClient, DapError, EventDispatcher, EventListener, EventSource, Result};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{oneshot, Mutex, Notify},
    task::JoinHandle,
    time::timeout,
};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct StdioAdapter {
    child: Mutex<Option<Child>>,
    writer: Mutex<ChildStdin>,
    pending: PendingMap,
    next_seq: AtomicU64,
    events: Arc<EventDispatcher>,
    initialized_seen: Arc<AtomicBool>,
    initialized_notify: Arc<Notify>,
    request_timeout: Duration,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioAdapter {
    pub fn spawn(adapter_path: &str, adapter_args: &[String], request_timeout: Duration) -> Result<Arc<Self>> {
        let mut child = Command::new(adapter_path)
            .args(adapter_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DapError::Connection(format!("Failed to spawn adapter at '{adapter_path}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DapError::AdapterNotReady("missing stdin pipe for adapter process".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DapError::AdapterNotReady("missing stdout pipe for adapter process".into()))?;

        if let Some(status) = child.try_wait()? {
            return Err(DapError::AdapterNotReady(format!(
                "adapter exited during startup with status: {status}"
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(EventDispatcher::new());
        let initialized_seen = Arc::new(AtomicBool::new(false));
        let initialized_notify = Arc::new(Notify::new());

        let reader_task = tokio::spawn(reader_loop(
            BufReader::new(stdout),
            pending.clone(),
            events.clone(),
            initialized_seen.clone(),
            initialized_notify.clone(),
        ));

        tracing::info!("Spawned debug adapter '{}'", adapter_path);

        Ok(Arc::new(Self {
            child: Mutex::new(Some(child)),
            writer: Mutex::new(stdin),
            pending,
            next_seq: AtomicU64::new(0),
            events,
            initialized_seen,
            initialized_notify,
            request_timeout,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        }))
    }

    /// Writes a request and returns the receiver for its response without
    /// waiting. Needed for `attach`/`launch`, which some adapters only answer
    /// after `configurationDone`.
    pub async fn send_request_begin(
        &self,
        command: &str,
        arguments: Value,
    ) -> Result<(u64, oneshot::Receiver<Value>)> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });

        let body = serde_json::to_string(&request)?;
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(framed.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&seq);
            return Err(DapError::Connection(format!(
                "Failed to send DAP request '{command}' to adapter stdin: {e}"
            )));
        }

        tracing::debug!("Sent DAP request: command={}, seq={}", command, seq);
        Ok((seq, rx))
    }

    pub async fn await_response(
        &self,
        command: &str,
        seq: u64,
        rx: oneshot::Receiver<Value>,
    ) -> Result<Value> {
        let response = match timeout(self.request_timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => {
                return Err(DapError::SessionLost(format!(
                    "adapter closed while waiting for '{command}'"
                )));
            }
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                return Err(DapError::Timeout(self.request_timeout));
            }
        };

        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !success {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown adapter error");
            return Err(DapError::adapter(command, message));
        }

        Ok(response)
    }

    pub async fn wait_for_initialized_event(&self, wait_timeout: Duration) -> bool {
        let notified = self.initialized_notify.notified();
        if self.initialized_seen.load(Ordering::SeqCst) {
            return true;
        }
        let _ = timeout(wait_timeout, notified).await;
        self.initialized_seen.load(Ordering::SeqCst)
    }
}

impl EventSource for StdioAdapter {
    fn on_event(&self, event: &str, listener: EventListener) {
        self.events.on_event(event, listener);
    }
}

#[async_trait]
impl DapClient for StdioAdapter {
    async fn send_request(&self, command: &str, arguments: Value) -> Result<Value> {
        let (seq, rx) = self.send_request_begin(command, arguments).await?;
        self.await_response(command, seq, rx).await
    }

    async fn shutdown(&self) {
        let reader_task = self
            .reader_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = reader_task {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.pending.lock().await.clear();
    }
}

async fn reader_loop<R>(
    mut reader: R,
    pending: PendingMap,
    events: Arc<EventDispatcher>,
    initialized_seen: Arc<AtomicBool>,
    initialized_notify: Arc<Notify>,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let message = match read_dap_message(&mut reader).await {
            Ok(value) => value,
            Err(e) => {
                tracing::info!("Adapter stream ended: {}", e);
                break;
            }
        };

        match message.get("type").and_then(Value::as_str) {
            Some("response") => {
                if let Some(request_seq) = message.get("request_seq").and_then(Value::as_u64) {
                    if let Some(tx) = pending.lock().await.remove(&request_seq) {
                        let _ = tx.send(message);
                    }
                }
            }
            Some("event") => {
                if message.get("event").and_then(Value::as_str) == Some("initialized") {
                    initialized_seen.store(true, Ordering::SeqCst);
                    initialized_notify.notify_waiters();
                }
                events.dispatch(&message);
            }
            _ => {}
        }
    }

    // Dropping the senders fails every in-flight request as session lost.
    pending.lock().await.clear();
}

const CONTENT_LENGTH: &str = "content-length";

/// Reads one `Content-Length` framed message. A stream that ends between
/// messages is reported as the session going away.
async fn read_dap_message<R>(reader: &mut R) -> Result<Value>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(DapError::SessionLost("adapter closed its output".into()));
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some(length) = parse_content_length(header)? {
            content_length = Some(length);
        }
    }

    let length = content_length
        .ok_or_else(|| DapError::Framing("header block has no Content-Length".into()))?;
    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// `Ok(None)` for headers other than `Content-Length`, which DAP allows.
fn parse_content_length(header: &str) -> Result<Option<usize>> {
    let Some((name, value)) = header.split_once(':') else {
        return Err(DapError::Framing(format!("header without ':': {header}")));
    };
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| DapError::Framing(format!("bad Content-Length '{}'", value.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn frame(value: &Value) -> Vec<u8> {
        let body = serde_json::to_string(value).unwrap();
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[tokio::test]
    async fn read_dap_message_parses_framed_body() {
        let message = json!({"seq": 3, "type": "event", "event": "stopped", "body": {"threadId": 7}});
        let bytes = frame(&message);
        let mut reader = BufReader::new(bytes.as_slice());

        let parsed = read_dap_message(&mut reader).await.expect("message parses");
        assert_eq!(parsed, message);
    }

    #[tokio::test]
    async fn read_dap_message_rejects_missing_content_length() {
        let mut reader = BufReader::new(&b"X-Other: 1\r\n\r\n{}"[..]);
        let err = read_dap_message(&mut reader).await.expect_err("header required");
        assert!(matches!(err, DapError::Framing(_)));
    }

    #[test]
    fn parse_content_length_skips_other_headers() {
        assert_eq!(parse_content_length("Content-Length: 42").unwrap(), Some(42));
        assert_eq!(parse_content_length("content-length:7").unwrap(), Some(7));
        assert_eq!(parse_content_length("Content-Type: application/json").unwrap(), None);
        assert!(matches!(parse_content_length("Content-Length: abc"), Err(DapError::Framing(_))));
        assert!(matches!(parse_content_length("garbage"), Err(DapError::Framing(_))));
    }

    #[tokio::test]
    async fn read_dap_message_reports_eof() {
        let mut reader = BufReader::new(&b""[..]);
        let err = read_dap_message(&mut reader).await.expect_err("empty stream");
        assert!(matches!(err, DapError::SessionLost(_)));
    }

    #[tokio::test]
    async fn reader_loop_routes_responses_and_events() {
        let mut stream = frame(&json!({"seq": 1, "type": "event", "event": "initialized"}));
        stream.extend(frame(&json!({"seq": 2, "type": "response", "request_seq": 5, "success": true})));
        stream.extend(frame(&json!({"seq": 3, "type": "event", "event": "stopped", "body": {}})));

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        let (orphan_tx, orphan_rx) = oneshot::channel();
        pending.lock().await.insert(5, tx);
        pending.lock().await.insert(9, orphan_tx);

        let events = Arc::new(EventDispatcher::new());
        let stopped = Arc::new(AtomicUsize::new(0));
        let counter = stopped.clone();
        events.on_event(
            "stopped",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let initialized_seen = Arc::new(AtomicBool::new(false));

        reader_loop(
            BufReader::new(stream.as_slice()),
            pending.clone(),
            events,
            initialized_seen.clone(),
            Arc::new(Notify::new()),
        )
        .await;

        let response = rx.await.expect("response routed");
        assert_eq!(response["request_seq"], 5);
        assert!(orphan_rx.await.is_err(), "unanswered request must fail once the stream ends");
        assert!(initialized_seen.load(Ordering::SeqCst));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_reports_missing_adapter_binary() {
        let err = StdioAdapter::spawn("/nonexistent/dap-adapter", &[], Duration::from_secs(1))
            .err()
            .expect("spawn must fail");
        assert!(matches!(err, DapError::Connection(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_against_silent_adapter_times_out_and_shutdown_reaps_it() {
        let adapter = StdioAdapter::spawn(
            "sh",
            &["-c".to_string(), "cat > /dev/null".to_string()],
            Duration::from_millis(50),
        )
        .expect("sh should spawn");

        let err = adapter
            .send_request("threads", json!({}))
            .await
            .expect_err("nobody answers");
        assert!(matches!(err, DapError::Timeout(_)));
        assert!(adapter.pending.lock().await.is_empty());

        adapter.shutdown().await;
        assert!(adapter.child.lock().await.is_none());
    }
}
