//! Stdio transport for the gateway: JSON-RPC 2.0, one message per line.
//!
//! Requests are handled concurrently — a long batch must not block a
//! health probe — with responses serialized through a shared writer lock.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::server::GatewayServer;

/// Serve the gateway over stdin/stdout until EOF or cancellation.
pub async fn run_stdio_server(server: GatewayServer, cancel: CancellationToken) {
    let stdin = tokio::io::stdin();
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(stdin).lines();

    tracing::info!("stdio transport listening");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => {
                tracing::info!("stdio transport cancelled");
                return;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("stdin closed, stdio transport stopping");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "discarding non-JSON stdin line");
                continue;
            }
        };

        let server = server.clone();
        let stdout = stdout.clone();
        tokio::spawn(async move {
            if let Some(response) = server.handle_message(message).await {
                let mut line = response.to_string();
                line.push('\n');
                let mut stdout = stdout.lock().await;
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
                let _ = stdout.flush().await;
            }
        });
    }
}
