//! Stdio transport for process-based MCP servers
//!
//! One child process per `server_id`, spawned lazily on first use and
//! memoized. Each process sits behind its own async mutex, which serializes
//! both creation and all request/response traffic on its pipes, so two
//! callers can never interleave bytes on the same stdin.

use async_trait::async_trait;
use futures::future::join_all;
use router_config::{resolve_env_value, TransportSettings};
use router_core::{Result, RetryPolicy, RouterError, ServerInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::{
    methods, IncomingMessage, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId,
};
use crate::Transport;

type ProcessSlot = Arc<Mutex<Option<StdioProcess>>>;

/// A running MCP server child process
struct StdioProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: JoinHandle<()>,
}

impl StdioProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close stdin and give the process `grace` to exit before killing it
    async fn shutdown(self, server_id: &str, grace: Duration) {
        let StdioProcess {
            mut child,
            stdin,
            stderr_task,
            ..
        } = self;
        drop(stdin);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("MCP server '{}' exited with {}", server_id, status),
            Ok(Err(e)) => warn!("Failed waiting for MCP server '{}': {}", server_id, e),
            Err(_) => {
                warn!(
                    "MCP server '{}' did not exit within {:?}, killing it",
                    server_id, grace
                );
                if let Err(e) = child.kill().await {
                    error!("Failed to kill MCP server '{}': {}", server_id, e);
                }
            }
        }
        stderr_task.abort();
    }

    /// Drop the process immediately; `kill_on_drop` reaps it
    fn discard(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Kill of discarded MCP server process failed: {}", e);
        }
        self.stderr_task.abort();
    }
}

/// Stdio transport for child-process MCP servers
pub struct StdioTransport {
    processes: Mutex<HashMap<String, ProcessSlot>>,
    next_id: AtomicI64,
    read_timeout: Duration,
    shutdown_grace: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("read_timeout", &self.read_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl StdioTransport {
    pub fn new(settings: &TransportSettings, retry: RetryPolicy) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            read_timeout: settings.request_timeout(),
            shutdown_grace: settings.shutdown_grace(),
            retry,
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn slot(&self, server_id: &str) -> ProcessSlot {
        let mut processes = self.processes.lock().await;
        processes
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Number of live process handles, for diagnostics
    pub async fn process_count(&self) -> usize {
        self.processes.lock().await.len()
    }

    fn spawn(&self, server: &ServerInfo) -> Result<StdioProcess> {
        let command = server.metadata_str("command").ok_or_else(|| {
            RouterError::ValidationError(format!(
                "Stdio server '{}' has no 'command' in metadata",
                server.server_id
            ))
        })?;
        let args = parse_args(server.metadata.get("args"));

        info!("Starting MCP server '{}' via stdio: {} {:?}", server.server_id, command, args);

        let mut cmd = Command::new(command);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(Value::Object(env)) = server.metadata.get("env") {
            for (key, value) in env {
                if let Some(raw) = value.as_str() {
                    cmd.env(key, resolve_env_value(raw));
                }
            }
        }
        if let Some(cwd) = server.metadata_str("cwd") {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RouterError::ProcessExited(format!(
                "Failed to spawn MCP server '{}': {}",
                server.server_id, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RouterError::TransportError("Failed to get process stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RouterError::TransportError("Failed to get process stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RouterError::TransportError("Failed to get process stderr".into()))?;

        let server_id = server.server_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            debug!("MCP server '{}' stderr: {}", server_id, trimmed);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Error reading MCP server '{}' stderr: {}", server_id, e);
                        break;
                    }
                }
            }
        });

        Ok(StdioProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_task,
        })
    }

    /// Spawn and run the MCP handshake
    async fn start(&self, server: &ServerInfo) -> Result<StdioProcess> {
        let mut process = self.spawn(server)?;
        let timeout = self.timeout_for(server);

        let params = serde_json::to_value(InitializeParams::default())?;
        let init =
            JsonRpcRequest::new(methods::INITIALIZE, Some(params)).with_id(self.next_request_id());
        let result = exchange(&mut process, &init, timeout).await?.into_result()?;

        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => match init.server_info {
                Some(info) => info!(
                    "MCP server '{}' initialized: {} v{} (protocol {})",
                    server.server_id, info.name, info.version, init.protocol_version
                ),
                None => info!(
                    "MCP server '{}' initialized (protocol {})",
                    server.server_id, init.protocol_version
                ),
            },
            Err(e) => warn!(
                "MCP server '{}' sent an unexpected initialize result: {}",
                server.server_id, e
            ),
        }

        let initialized = JsonRpcNotification::new(methods::INITIALIZED, None);
        write_line(&mut process, &serde_json::to_string(&initialized)?).await?;

        // Tool discovery is informational only
        let list = JsonRpcRequest::new(methods::TOOLS_LIST, None).with_id(self.next_request_id());
        let listed = exchange(&mut process, &list, timeout)
            .await
            .and_then(JsonRpcResponse::into_result);
        match listed {
            Ok(value) => match serde_json::from_value::<ListToolsResult>(value) {
                Ok(listed) => {
                    let names: Vec<&str> = listed.tools.iter().map(|t| t.name.as_str()).collect();
                    info!("MCP server '{}' tools: {:?}", server.server_id, names);
                }
                Err(e) => warn!(
                    "MCP server '{}' sent an unreadable tools/list result: {}",
                    server.server_id, e
                ),
            },
            Err(e) => warn!("tools/list failed for MCP server '{}': {}", server.server_id, e),
        }

        Ok(process)
    }

    fn timeout_for(&self, server: &ServerInfo) -> Duration {
        server.timeout_override().unwrap_or(self.read_timeout)
    }

    /// One attempt: reuse or (re)spawn the process, then exchange one message
    async fn send_once(
        &self,
        server: &ServerInfo,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        let slot = self.slot(&server.server_id).await;
        let mut guard = slot.lock().await;

        if let Some(process) = guard.as_mut() {
            if !process.is_alive() {
                info!("MCP server '{}' has exited, respawning", server.server_id);
                if let Some(dead) = guard.take() {
                    dead.discard();
                }
            }
        }

        if guard.is_none() {
            *guard = Some(self.start(server).await?);
        }

        let process = guard.as_mut().ok_or_else(|| {
            RouterError::ProcessExited(format!("MCP server '{}' is not running", server.server_id))
        })?;

        let result = exchange(process, request, self.timeout_for(server)).await;

        if let Err(e) = &result {
            warn!("Discarding MCP server '{}' process after error: {}", server.server_id, e);
            if let Some(broken) = guard.take() {
                broken.discard();
            }
        }
        result
    }
}

#[async_trait]
impl Transport for StdioTransport {
    /// Alive means the process exists and has not exited; nothing is sent.
    async fn check_server_health(&self, server: &ServerInfo) -> bool {
        let slot = {
            let processes = self.processes.lock().await;
            match processes.get(&server.server_id) {
                Some(slot) => slot.clone(),
                None => return false,
            }
        };

        // A held lock means a request is in flight on a live process
        let Ok(mut guard) = slot.try_lock() else {
            return true;
        };
        guard.as_mut().map(StdioProcess::is_alive).unwrap_or(false)
    }

    async fn send_request(
        &self,
        server: &ServerInfo,
        mut request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        if request.id.is_none() {
            request.id = Some(self.next_request_id());
        }

        let mut attempt = 0;
        loop {
            match self.send_once(server, &request).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() || attempt >= self.retry.max_retries => {
                    error!(
                        "Request {} to MCP server '{}' failed after {} attempt(s): {}",
                        request.method,
                        server.server_id,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "Request {} to MCP server '{}' failed, retrying in {:?} \
                         (attempt {}/{}): {}",
                        request.method,
                        server.server_id,
                        delay,
                        attempt,
                        self.retry.max_retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect(&self, server: &ServerInfo) -> Result<()> {
        let slot = self.slot(&server.server_id).await;
        let mut guard = slot.lock().await;
        if guard.as_mut().map(StdioProcess::is_alive).unwrap_or(false) {
            return Ok(());
        }
        *guard = Some(self.start(server).await?);
        Ok(())
    }

    /// Shut down the server's process, if any, and forget its slot
    async fn release(&self, server: &ServerInfo) {
        let slot = self.processes.lock().await.remove(&server.server_id);
        let Some(slot) = slot else {
            return;
        };

        // Waits for an in-flight exchange to finish first
        let process = slot.lock().await.take();
        if let Some(process) = process {
            info!("Releasing MCP server '{}'", server.server_id);
            process.shutdown(&server.server_id, self.shutdown_grace).await;
        }
    }

    async fn cleanup(&self) {
        let slots: Vec<(String, ProcessSlot)> = self.processes.lock().await.drain().collect();
        if slots.is_empty() {
            return;
        }

        info!("Shutting down {} MCP server process(es)", slots.len());
        let grace = self.shutdown_grace;
        join_all(slots.into_iter().map(|(server_id, slot)| async move {
            let process = slot.lock().await.take();
            if let Some(process) = process {
                process.shutdown(&server_id, grace).await;
            }
        }))
        .await;
    }
}

/// `args` may be an array of strings or a single whitespace-separated string
fn parse_args(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(resolve_env_value)
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().map(resolve_env_value).collect(),
        _ => Vec::new(),
    }
}

/// Write one complete newline-terminated message
async fn write_line(process: &mut StdioProcess, json: &str) -> Result<()> {
    let mut frame = Vec::with_capacity(json.len() + 1);
    frame.extend_from_slice(json.as_bytes());
    frame.push(b'\n');

    debug!("Sending to MCP server: {}", json);
    let written = async {
        process.stdin.write_all(&frame).await?;
        process.stdin.flush().await
    }
    .await;

    written.map_err(|e| match e.kind() {
        std::io::ErrorKind::BrokenPipe => {
            RouterError::ProcessExited(format!("stdin closed: {}", e))
        }
        _ => RouterError::TransportError(format!("Failed to write to stdin: {}", e)),
    })
}

/// Send `request` and read lines until the response with the same id arrives
async fn exchange(
    process: &mut StdioProcess,
    request: &JsonRpcRequest,
    timeout: Duration,
) -> Result<JsonRpcResponse> {
    write_line(process, &serde_json::to_string(request)?).await?;

    let read = async {
        loop {
            let line = match process.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(RouterError::ProcessExited("stdout closed".into()));
                }
                Err(e) => {
                    return Err(RouterError::TransportError(format!(
                        "Failed to read stdout: {}",
                        e
                    )));
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!("Received from MCP server: {}", trimmed);

            match IncomingMessage::parse(trimmed)? {
                IncomingMessage::Response(response) if response.id == request.id => {
                    return Ok(response)
                }
                IncomingMessage::Response(response) => {
                    warn!(
                        "Skipping response for request {:?} while waiting for {:?}",
                        response.id, request.id
                    );
                }
                IncomingMessage::ServerMessage { method } => {
                    debug!("Skipping server message '{}'", method);
                }
            }
        }
    };

    tokio::time::timeout(timeout, read).await.map_err(|_| {
        RouterError::TimeoutError(format!(
            "No response to {} within {:?}",
            request.method, timeout
        ))
    })?
}
