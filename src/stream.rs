//! Stream multiplexing: concurrent stdout/stderr readers with bounded
//! buffers, oversized-line handling, client chunking, and inline event
//! detection.
//!
//! Both streams must be drained while the process is alive or the OS pipe
//! buffers fill and the child deadlocks. Each reader consumes its stream in
//! fixed-size reads, splits on newlines, carries a trailing partial line
//! across reads, and pushes [`MuxEvent`]s into an mpsc channel. The channel
//! is bounded, so a slow consumer exerts back-pressure on the readers rather
//! than ballooning memory. Readers never call back into the session engine.

use crate::protocol::{StreamKind, StreamOutput};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Size of a single read from the pipe.
const READ_CHUNK: usize = 8 * 1024;

/// Bounded capacity of the reader → engine channel.
const CHANNEL_CAPACITY: usize = 256;

/// Phrases in stdout that indicate the meaningful work finished before the
/// process exited.
const COMPLETION_MARKERS: &[&str] = &[
    "task completed successfully",
    "i've completed",
    "i have completed",
    "the task is complete",
    "process complete",
    "done!",
    "finished!",
    "operation complete",
    "all done",
];

static FILE_CREATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:Created?|Wrote|Generated?|Saved?)\s+(?:file|script|program):\s*(\S+)")
        .expect("invalid file creation regex")
});

static TOKEN_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)token.*limit",
        r"(?i)context.*window",
        r"(?i)maximum.*length",
        r"(?i)too.*long",
        r"(?i)\btruncated\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid token limit regex"))
    .collect()
});

static TOKEN_COUNT_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{2,})\s*(?:output\s+)?tokens?\b").expect("invalid token count regex")
});

static TOKEN_COUNT_BEFORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:token\s+limit|maximum\s+length|context\s+window|limit)\D{0,20}(\d{2,})")
        .expect("invalid token count regex")
});

static RATE_LIMIT_RESET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"resets at (\d+)").expect("invalid reset regex"));

/// Default token limit reported when none can be extracted from the output.
const DEFAULT_TOKEN_LIMIT: u64 = 32_000;

/// Events emitted by the stream readers.
#[derive(Debug, Clone)]
pub enum MuxEvent {
    /// A line (or flushed partial / fragment of an oversized line) of output.
    Output(StreamOutput),
    /// A completion marker or file-creation phrase was seen in stdout.
    EarlyCompletion {
        marker: Option<String>,
        file_path: Option<String>,
        elapsed_secs: f64,
        output_line: String,
    },
    /// Output matched a token/context-limit error pattern.
    TokenLimit { limit: u64, error_text: String },
    /// Output matched a rate-limit error pattern.
    RateLimit {
        error_type: &'static str,
        message: &'static str,
        reset_timestamp: Option<u64>,
        retry_after: Option<u64>,
        recoverable: bool,
        error_text: String,
    },
    /// A read error on one of the streams. Streaming stops for that stream.
    ReadError { kind: StreamKind, error: String },
}

/// Create the bounded channel connecting readers to the engine.
#[must_use]
pub fn channel() -> (mpsc::Sender<MuxEvent>, mpsc::Receiver<MuxEvent>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Detects inline events in delivered output.
///
/// Early-completion fires at most once per execution and only for stdout;
/// token/rate-limit patterns are stateless and checked on both streams since
/// tools report those errors on either.
#[derive(Debug)]
struct EventDetector {
    started: Instant,
    early_completion_fired: bool,
}

impl EventDetector {
    fn new(started: Instant) -> Self {
        Self {
            started,
            early_completion_fired: false,
        }
    }

    fn inspect(&mut self, kind: StreamKind, data: &str) -> Vec<MuxEvent> {
        let mut events = Vec::new();
        let lower = data.to_lowercase();

        if kind == StreamKind::Stdout && !self.early_completion_fired {
            if let Some(marker) = COMPLETION_MARKERS.iter().find(|m| lower.contains(*m)) {
                self.early_completion_fired = true;
                let elapsed = self.started.elapsed().as_secs_f64();
                tracing::info!(marker, elapsed, "early completion detected");
                events.push(MuxEvent::EarlyCompletion {
                    marker: Some((*marker).to_string()),
                    file_path: None,
                    elapsed_secs: elapsed,
                    output_line: data.trim().to_string(),
                });
            } else if let Some(caps) = FILE_CREATION.captures(data) {
                self.early_completion_fired = true;
                let elapsed = self.started.elapsed().as_secs_f64();
                let file_path = caps[1].to_string();
                tracing::info!(file_path, elapsed, "early completion detected (file created)");
                events.push(MuxEvent::EarlyCompletion {
                    marker: None,
                    file_path: Some(file_path),
                    elapsed_secs: elapsed,
                    output_line: data.trim().to_string(),
                });
            }
        }

        if TOKEN_LIMIT_PATTERNS.iter().any(|re| re.is_match(data)) {
            let limit = TOKEN_COUNT_BEFORE
                .captures(data)
                .or_else(|| TOKEN_COUNT_AFTER.captures(data))
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or(DEFAULT_TOKEN_LIMIT);
            tracing::warn!(limit, "token limit error detected in output");
            events.push(MuxEvent::TokenLimit {
                limit,
                error_text: data.trim().to_string(),
            });
        } else if lower.contains("usage limit reached") {
            let reset_timestamp = RATE_LIMIT_RESET
                .captures(data)
                .and_then(|caps| caps[1].parse().ok());
            tracing::warn!(?reset_timestamp, "usage limit error detected in output");
            events.push(MuxEvent::RateLimit {
                error_type: "usage_limit",
                message: "usage limit reached",
                reset_timestamp,
                retry_after: None,
                recoverable: false,
                error_text: data.trim().to_string(),
            });
        } else if data.contains("429")
            && (lower.contains("rate limit") || lower.contains("too many requests"))
        {
            tracing::warn!("HTTP 429 rate limit detected in output");
            events.push(MuxEvent::RateLimit {
                error_type: "rate_limit_429",
                message: "HTTP 429 Too Many Requests",
                reset_timestamp: None,
                retry_after: Some(60),
                recoverable: true,
                error_text: data.trim().to_string(),
            });
        }

        events
    }
}

/// Concurrent line-oriented reader pair for one child process.
#[derive(Debug, Clone, Copy)]
pub struct StreamMultiplexer {
    /// Flush an unfinished logical line once it grows past this.
    pub max_line_size: usize,
    /// Hard ceiling for one logical line; the remainder is dropped.
    pub line_ceiling: usize,
    /// Maximum payload of a single `process.output` notification.
    pub chunk_size: usize,
}

impl StreamMultiplexer {
    #[must_use]
    pub fn new(max_line_size: usize, line_ceiling: usize, chunk_size: usize) -> Self {
        Self {
            max_line_size,
            line_ceiling,
            chunk_size,
        }
    }

    /// Spawn a reader task for one stream.
    ///
    /// The task runs to EOF (or read error) and delivers events through `tx`.
    /// Dropping the receiver stops the task at its next send.
    pub fn spawn_reader<R>(
        &self,
        reader: R,
        kind: StreamKind,
        tx: mpsc::Sender<MuxEvent>,
        started: Instant,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let limits = *self;
        tokio::spawn(async move {
            limits.read_loop(reader, kind, tx, started).await;
        })
    }

    async fn read_loop<R>(
        self,
        mut reader: R,
        kind: StreamKind,
        tx: mpsc::Sender<MuxEvent>,
        started: Instant,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut detector = EventDetector::new(started);
        let mut buf = vec![0u8; READ_CHUNK];
        // Bytes of the current logical line not yet delivered.
        let mut pending: Vec<u8> = Vec::new();
        // Bytes already flushed for the current (oversized) logical line.
        let mut flushed: usize = 0;
        // True while discarding the remainder of a line past the ceiling.
        let mut dropping = false;
        let mut lines_read: u64 = 0;
        let mut bytes_read: u64 = 0;

        tracing::debug!(%kind, "starting stream reader");

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(%kind, error = %e, "stream read error");
                    let _ = tx
                        .send(MuxEvent::ReadError {
                            kind,
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
            };
            bytes_read += n as u64;

            let mut rest = &buf[..n];
            while !rest.is_empty() {
                match rest.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        if dropping {
                            // Ceiling was hit on this line; resume at the newline.
                            dropping = false;
                        } else {
                            pending.extend_from_slice(&rest[..=pos]);
                            lines_read += 1;
                            if !self.deliver(&mut detector, kind, &pending, &tx).await {
                                return;
                            }
                        }
                        pending.clear();
                        flushed = 0;
                        rest = &rest[pos + 1..];
                    }
                    None => {
                        if !dropping {
                            pending.extend_from_slice(rest);
                            if pending.len() >= self.max_line_size {
                                flushed += pending.len();
                                tracing::warn!(
                                    %kind,
                                    flushed,
                                    "line exceeded buffer limit without newline, flushing"
                                );
                                if !self.deliver(&mut detector, kind, &pending, &tx).await {
                                    return;
                                }
                                pending.clear();
                                if flushed >= self.line_ceiling {
                                    tracing::warn!(
                                        %kind,
                                        flushed,
                                        "line exceeded hard ceiling, dropping until next newline"
                                    );
                                    dropping = true;
                                }
                            }
                        }
                        rest = &[];
                    }
                }
            }
        }

        // EOF with an unterminated final line: deliver what we have.
        if !pending.is_empty() && !dropping {
            let _ = self.deliver(&mut detector, kind, &pending, &tx).await;
        }

        tracing::debug!(%kind, lines_read, bytes_read, "stream reader finished");
    }

    /// Decode one logical unit, run event detection, and send it (fragmented
    /// if it exceeds the chunk limit). Returns false when the receiver is gone.
    async fn deliver(
        &self,
        detector: &mut EventDetector,
        kind: StreamKind,
        raw: &[u8],
        tx: &mpsc::Sender<MuxEvent>,
    ) -> bool {
        // Non-UTF-8 bytes are decoded with replacement; never fatal.
        let data = String::from_utf8_lossy(raw).into_owned();

        for event in detector.inspect(kind, &data) {
            if tx.send(event).await.is_err() {
                return false;
            }
        }

        if data.len() <= self.chunk_size {
            return tx
                .send(MuxEvent::Output(StreamOutput {
                    kind,
                    data,
                    truncated: false,
                    chunk_index: None,
                    total_chunks: None,
                }))
                .await
                .is_ok();
        }

        let chunks = split_chunks(&data, self.chunk_size);
        let total = chunks.len();
        tracing::info!(%kind, bytes = data.len(), chunks = total, "fragmenting large output line");
        for (index, chunk) in chunks.into_iter().enumerate() {
            let sent = tx
                .send(MuxEvent::Output(StreamOutput {
                    kind,
                    data: chunk.to_string(),
                    truncated: index + 1 < total,
                    chunk_index: Some(index),
                    total_chunks: Some(total),
                }))
                .await;
            if sent.is_err() {
                return false;
            }
        }
        true
    }
}

/// Split a string into chunks of at most `size` bytes on char boundaries.
fn split_chunks(data: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() <= size {
            chunks.push(rest);
            break;
        }
        let mut end = size;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(&rest[..end]);
        rest = &rest[end..];
    }
    chunks
}
