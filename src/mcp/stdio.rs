//! Stdio transport for the tool server: newline-delimited JSON-RPC.
//!
//! One request per input line, one response per output line. Notifications
//! (requests without an `id`) are handled but get no response. Logging goes
//! to stderr so stdout carries only protocol traffic.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::server::McpServer;

/// Serve requests read from `reader` until it reaches end of input.
pub async fn serve<R, W>(server: McpServer, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0usize;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = server.handle_json(line).await;
        handled += 1;
        if is_notification(line) {
            tracing::debug!("Notification handled; no response sent");
            continue;
        }

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
    }

    tracing::info!("Input closed after {} message(s)", handled);
    Ok(())
}

/// Serve the tool server on the process's stdin and stdout.
pub async fn run_stdio(server: McpServer) -> anyhow::Result<()> {
    tracing::info!("Starting MCP server on stdio ({} tools)", server.tools().len());
    serve(server, tokio::io::stdin(), tokio::io::stdout()).await
}

fn is_notification(line: &str) -> bool {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => map.contains_key("method") && !map.contains_key("id"),
        _ => false,
    }
}
