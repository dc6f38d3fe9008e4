//! Line-framed JSON transport over any `AsyncRead`/`AsyncWrite` pair.
//!
//! The engine is transport-agnostic: it reads text frames and pushes
//! serializable values onto a single-writer outbound queue. This adapter
//! frames each JSON value as one line. `main.rs` wires it to stdio; tests
//! wire it to `tokio::io::duplex`.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the outbound queue. A full queue suspends producers, which
/// propagates back-pressure from a slow client all the way to the child's
/// pipes.
const OUTBOUND_CAPACITY: usize = 1024;

/// One bidirectional client connection.
///
/// Owns the read half directly; the write half lives in a dedicated writer
/// task fed by a bounded queue, so there is exactly one writer and
/// outbound ordering matches enqueue ordering.
pub struct Connection<R> {
    reader: BufReader<R>,
    // Persistent line buffer: read_until is cancellation safe and leaves
    // partially read frames here, so the engine may select! over next_frame.
    line: Vec<u8>,
    outbound: mpsc::Sender<Value>,
    writer_task: JoinHandle<()>,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin,
{
    /// Build a connection from a read/write pair, spawning the writer task.
    pub fn new<W>(read: R, write: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(write_loop(write, rx));
        Self {
            reader: BufReader::new(read),
            line: Vec::new(),
            outbound: tx,
            writer_task,
        }
    }

    /// Clone of the outbound queue sender.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Value> {
        self.outbound.clone()
    }

    /// Read the next frame. Returns `None` on EOF or read error (both are
    /// treated as disconnect).
    pub async fn next_frame(&mut self) -> Option<String> {
        loop {
            match self.reader.read_until(b'\n', &mut self.line).await {
                Ok(0) => return None,
                Ok(_) => {
                    let frame = String::from_utf8_lossy(&self.line).trim().to_string();
                    self.line.clear();
                    if frame.is_empty() {
                        continue;
                    }
                    return Some(frame);
                }
                Err(e) => {
                    tracing::info!(error = %e, "transport read error, treating as disconnect");
                    return None;
                }
            }
        }
    }

    /// Close the outbound side and wait for queued frames to flush.
    pub async fn shutdown(self) {
        drop(self.outbound);
        let _ = self.writer_task.await;
    }
}

async fn write_loop<W>(mut write: W, mut rx: mpsc::Receiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = rx.recv().await {
        let mut frame = match serde_json::to_string(&value) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound frame");
                continue;
            }
        };
        frame.push('\n');
        if write.write_all(frame.as_bytes()).await.is_err() {
            tracing::info!("transport write failed, stopping writer");
            break;
        }
        if write.flush().await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}
