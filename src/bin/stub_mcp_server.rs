//! stub-mcp-server: a scripted MCP server over stdio.
//!
//! Used by the integration tests and handy for trying the gateway without a
//! real server. Declares two tools (`t1`, `echo`) and answers a few hidden
//! ones that exercise failure paths:
//!
//! - `sleep {ms, tag}`: reply with `{tag}` after `ms` milliseconds
//! - `hang`: never reply
//! - `crash`: exit immediately
//! - `stale`: emit a response for an unknown id and a notification first
//! - `log {message}`: write `message` to stderr
//!
//! `STUB_INIT=silent|malformed|crash` breaks the handshake on purpose.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

const METHOD_NOT_FOUND: i32 = -32601;

type Output = Arc<Mutex<Stdout>>;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let init_mode = std::env::var("STUB_INIT").unwrap_or_default();
    let out: Output = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("stub-mcp-server ready (pid {})", std::process::id());

    while let Some(line) = lines.next_line().await? {
        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
            eprintln!("unparseable input: {line}");
            continue;
        };
        let Some(id) = frame.get("id").cloned() else {
            continue; // notification
        };
        let method = frame["method"].as_str().unwrap_or_default().to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "initialize" => match init_mode.as_str() {
                "silent" => {}
                "malformed" => send(&out, json!({"jsonrpc": "2.0", "id": id, "result": "not an object"})).await,
                "crash" => {
                    eprintln!("crashing during initialize");
                    std::process::exit(3);
                }
                _ => {
                    let result = json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "stub-mcp-server", "version": env!("CARGO_PKG_VERSION")},
                    });
                    send(&out, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
            },
            "tools/list" => send(&out, json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools()}})).await,
            "tools/call" => call_tool(&out, id, params).await,
            _ => send(&out, error(id, &format!("method not found: {method}"))).await,
        }
    }
    Ok(())
}

fn tools() -> Value {
    json!([
        {
            "name": "t1",
            "description": "Returns a fixed payload",
            "inputSchema": {"type": "object", "properties": {}},
        },
        {
            "name": "echo",
            "description": "Returns its arguments unchanged",
            "inputSchema": {"type": "object"},
            "example": {"a": 1, "b": "x"},
        },
    ])
}

async fn call_tool(out: &Output, id: Value, params: Value) {
    let name = params["name"].as_str().unwrap_or_default().to_string();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name.as_str() {
        "t1" => {
            let result = json!({"content": [{"type": "text", "text": "t1 fixed payload"}]});
            send(out, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
        }
        "echo" => send(out, json!({"jsonrpc": "2.0", "id": id, "result": arguments})).await,
        "sleep" => {
            let ms = arguments["ms"].as_u64().unwrap_or(0);
            let tag = arguments.get("tag").cloned().unwrap_or(Value::Null);
            let out = Arc::clone(out);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                send(&out, json!({"jsonrpc": "2.0", "id": id, "result": {"tag": tag}})).await;
            });
        }
        "hang" => {}
        "crash" => {
            eprintln!("crashing on request");
            std::process::exit(1);
        }
        "stale" => {
            send(out, json!({"jsonrpc": "2.0", "id": 999_999, "result": {"stale": true}})).await;
            send(out, json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}})).await;
            send(out, json!({"jsonrpc": "2.0", "id": id, "result": {"stale": false}})).await;
        }
        "log" => {
            eprintln!("{}", arguments["message"].as_str().unwrap_or_default());
            send(out, json!({"jsonrpc": "2.0", "id": id, "result": {"logged": true}})).await;
        }
        _ => send(out, error(id, &format!("unknown tool: {name}"))).await,
    }
}

fn error(id: Value, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": METHOD_NOT_FOUND, "message": message}})
}

/// Write one frame as a single line.
async fn send(out: &Output, frame: Value) {
    let mut line = frame.to_string();
    line.push('\n');
    let mut out = out.lock().await;
    if out.write_all(line.as_bytes()).await.is_ok() {
        let _ = out.flush().await;
    }
}
