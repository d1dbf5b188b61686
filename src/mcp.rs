//! Playback over a MIDI tool server speaking MCP (JSON-RPC 2.0, one message
//! per line on the child's stdin/stdout).

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::transport::PlaybackTransport;
use crate::BoxFuture;

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "kantanplay-host";

type Reader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Request/response half of an MCP client over any byte pipe.
struct RpcChannel {
    reader: Reader,
    writer: Writer,
    next_id: u64,
}

impl RpcChannel {
    fn new(reader: Box<dyn AsyncRead + Send + Unpin>, writer: Writer) -> Self {
        Self { reader: BufReader::new(reader).lines(), writer, next_id: 1 }
    }

    async fn write_line(&mut self, message: &Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(message).context("failed to encode MCP message")?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.context("failed to write to MCP server")?;
        self.writer.flush().await.context("failed to flush MCP server stdin")?;
        Ok(())
    }

    async fn notify(&mut self, method: &str, params: Value) -> anyhow::Result<()> {
        self.write_line(&json!({ "jsonrpc": "2.0", "method": method, "params": params })).await
    }

    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_line(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;

        loop {
            let line = self
                .reader
                .next_line()
                .await
                .context("failed to read from MCP server")?
                .ok_or_else(|| anyhow!("MCP server closed its output"))?;
            let message: Value = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(_) => {
                    debug!("ignoring non-JSON line from MCP server: {line}");
                    continue;
                }
            };
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                debug!("ignoring unrelated MCP message: {message}");
                continue;
            }
            if let Some(error) = message.get("error") {
                let text = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
                bail!("{method} failed: {text}");
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn initialize(&mut self) -> anyhow::Result<Value> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await
            .context("MCP initialize handshake failed")?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(result)
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> anyhow::Result<Value> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            bail!("tool {name} reported an error: {}", tool_text(&result));
        }
        Ok(result)
    }
}

/// Concatenated text content of a tool result.
fn tool_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Transport that calls `send_midi_sequence` on an MCP MIDI server.
pub struct McpTransport {
    channel: Mutex<RpcChannel>,
    child: Mutex<Option<Child>>,
}

impl McpTransport {
    /// Starts the server process and completes the MCP handshake.
    pub async fn spawn(command: &str, args: &[String], cwd: Option<&Path>) -> anyhow::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start MCP server `{command}`"))?;
        let stdin = child.stdin.take().context("MCP server stdin unavailable")?;
        let stdout = child.stdout.take().context("MCP server stdout unavailable")?;

        let transport = Self::connect(Box::new(stdout), Box::new(stdin)).await?;
        *transport.child.lock().await = Some(child);
        info!("Connected to MCP MIDI server `{}`", command);
        Ok(transport)
    }

    async fn connect(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Writer,
    ) -> anyhow::Result<Self> {
        let mut channel = RpcChannel::new(reader, writer);
        let server = channel.initialize().await?;
        let server_info = server.get("serverInfo").cloned().unwrap_or_default();
        debug!("MCP server info: {}", server_info);

        match channel.call_tool("open_midi_port", json!({ "port_index": 0 })).await {
            Ok(result) => info!("MIDI port opened: {}", tool_text(&result)),
            Err(err) => warn!("failed to open MIDI port on MCP server: {err:#}"),
        }

        Ok(Self { channel: Mutex::new(channel), child: Mutex::new(None) })
    }

    /// Terminates the server process, if this transport started one.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                warn!("failed to stop MCP server: {err}");
            } else {
                info!("Disconnected from MCP MIDI server");
            }
        }
    }
}

impl PlaybackTransport for McpTransport {
    fn play_sequence<'a>(
        &'a self,
        tempo: u32,
        notes: &'a [i32],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut channel = self.channel.lock().await;
            channel
                .call_tool("send_midi_sequence", json!({ "bpm": tempo, "notes": notes }))
                .await
                .map(|_| ())
        })
    }
}
