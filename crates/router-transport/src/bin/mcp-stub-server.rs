//! Minimal MCP server speaking newline-delimited JSON-RPC over stdio.
//!
//! Tools:
//! - `echo`: returns its arguments as text
//! - `sleep`: waits `ms` milliseconds, then answers
//! - `exit`: terminates the process without answering
//!
//! Any stdin line that is not one complete JSON document aborts the
//! process with status 2, so torn or interleaved frames are visible to
//! whoever is driving it.

use router_transport::types::{JsonRpcRequest, ToolCallResult};
use router_transport::ToolDispatcher;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error};

const FRAMING_ERROR_EXIT: i32 = 2;

fn exit_now(code: i32) -> router_core::Result<ToolCallResult> {
    std::process::exit(code)
}

fn build_dispatcher(name: &str) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new(name, env!("CARGO_PKG_VERSION"));
    dispatcher
        .register(
            "echo",
            "Return the arguments unchanged",
            json!({"type": "object"}),
            |args| async move { Ok(ToolCallResult::text(args.to_string())) },
        )
        .register(
            "sleep",
            "Wait for `ms` milliseconds before answering",
            json!({"type": "object", "properties": {"ms": {"type": "integer"}}}),
            |args| async move {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ToolCallResult::text(format!("slept {}ms", ms)))
            },
        )
        .register(
            "exit",
            "Terminate the server process immediately",
            json!({"type": "object", "properties": {"code": {"type": "integer"}}}),
            |args| async move {
                let code = args
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(0);
                exit_now(code)
            },
        );
    dispatcher
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "mcp-stub-server".to_string());
    let dispatcher = build_dispatcher(&name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                error!("Rejecting malformed frame ({}): {:?}", e, line);
                std::process::exit(FRAMING_ERROR_EXIT);
            }
        };
        debug!("Handling {}", request.method);

        if let Some(response) = dispatcher.handle(request).await {
            let mut frame = serde_json::to_vec(&response)?;
            frame.push(b'\n');
            stdout.write_all(&frame).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}
