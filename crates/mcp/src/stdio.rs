// Newline-delimited JSON transport over stdin/stdout

use crate::connection::{Connection, TransportError};
use crate::protocol::{parse_request, JsonRpcResponse};
use crate::server::McpServer;
use crate::session::Chunk;
use gantz_core::audit::Transport;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const OUTPUT_BUFFER: usize = 64;

/// Serve one client on the process's stdin/stdout until stdin closes
pub async fn serve_stdio(server: Arc<McpServer>) -> Result<(), TransportError> {
    serve_lines(server, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one client over any line-oriented byte stream. Each message is one
/// JSON object per line in both directions.
///
/// The auth token arrives in the `initialize` params. End of input lets
/// queued requests finish; a closed output kills everything still running.
pub async fn serve_lines<R, W>(server: Arc<McpServer>, reader: R, writer: W) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = server.session(Transport::Stdio, None);
    let (output_tx, output_rx) = mpsc::channel::<Chunk>(OUTPUT_BUFFER);
    let connection = Connection::spawn(Arc::clone(&session), output_tx.clone());
    let writer_task = tokio::spawn(write_chunks(writer, output_rx));

    tracing::info!(session_id = %session.id(), "stdio client connected");

    let mut lines = BufReader::new(reader).lines();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(TransportError::Io(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_request(&line) {
            Ok(request) => {
                if connection.submit(request).is_err() {
                    break Ok(());
                }
            }
            Err(error) => {
                tracing::debug!(kind = %error.kind, "Rejected malformed message");
                let response = JsonRpcResponse::error(Value::Null, error);
                if output_tx.send(Chunk::Response(response)).await.is_err() {
                    break Ok(());
                }
            }
        }
    };

    tracing::info!(session_id = %session.id(), "stdio client disconnected");
    connection.shutdown(false).await;
    drop(output_tx);

    match writer_task.await {
        Ok(Ok(())) => read_result,
        Ok(Err(e)) => read_result.and(Err(e)),
        Err(e) => {
            tracing::error!(error = %e, "stdio writer task failed");
            read_result
        }
    }
}

async fn write_chunks<W>(mut writer: W, mut chunks: mpsc::Receiver<Chunk>) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = chunks.recv().await {
        if let Some(text) = chunk.to_json() {
            writer.write_all(text.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }
    Ok(())
}
