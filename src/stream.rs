//! # Streaming replies
//!
//! The chat backend answers with server-sent events: newline-delimited lines, each one
//! of
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Olá"}}]}    content delta
//! data: [DONE]                                        end of stream
//! : keep-alive                                        comment, ignored
//! ```
//!
//! [`FrameDecoder`] turns raw byte chunks into [`StreamEvent`]s. Chunks may cut a line
//! (or a UTF-8 sequence) anywhere; bytes are buffered until a newline completes the
//! line. A complete line that does not parse is reported as
//! [`StreamEvent::Malformed`] and skipped; an unterminated tail stays buffered and is
//! decoded once more when the transport closes ([`FrameDecoder::finish`]).
//!
//! [`consume_stream`] drives a decoder over a chunk stream and writes the reply into a
//! [`Transcript`] as deltas arrive.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{error::Result, session::Transcript};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Malformed(String),
}

#[derive(Deserialize)]
struct ChunkFrame {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the events of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(event) = decode_line(&line[..newline]) {
                events.push(event);
            }
        }
        events
    }

    /// Transport closed: decode whatever is left in the buffer.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let Ok(line) = std::str::from_utf8(raw) else {
        return Some(StreamEvent::Malformed(
            String::from_utf8_lossy(raw).into_owned(),
        ));
    };

    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }

    let Some(payload) = line.strip_prefix("data:") else {
        if ["event:", "id:", "retry:"]
            .iter()
            .any(|field| line.starts_with(field))
        {
            return None;
        }
        return Some(StreamEvent::Malformed(line.to_string()));
    };

    let payload = payload.trim();
    if payload == "[DONE]" {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<ChunkFrame>(payload) {
        Ok(frame) => {
            let content: String = frame
                .choices
                .iter()
                .filter_map(|choice| choice.delta.as_ref()?.content.as_deref())
                .collect();
            (!content.is_empty()).then_some(StreamEvent::Delta(content))
        }
        Err(_) => Some(StreamEvent::Malformed(payload.to_string())),
    }
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamEnd {
    /// The `[DONE]` sentinel arrived.
    Done,
    /// The transport closed without a sentinel.
    #[default]
    Closed,
    /// The caller cancelled; the partial reply was kept.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    /// Every delta, concatenated in arrival order.
    pub content: String,
    pub malformed_frames: usize,
    pub end: StreamEnd,
}

/// Cancels a stream being consumed with the paired [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// What an interrupt hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// A turn was in flight and has been cancelled.
    Cancelled,
    /// Nothing was running.
    Idle,
}

/// Routes interrupts (Ctrl-C) to whichever turn is currently armed.
///
/// A single process-wide signal listener calls [`Interrupts::interrupt`]; each turn
/// calls [`Interrupts::arm`] before streaming and [`Interrupts::disarm`] after.
#[derive(Debug, Default)]
pub struct Interrupts {
    active: Mutex<Option<CancelHandle>>,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a turn; the returned signal fires on the next interrupt.
    pub fn arm(&self) -> CancelSignal {
        let (handle, signal) = cancel_pair();
        if let Ok(mut active) = self.active.lock() {
            *active = Some(handle);
        }
        signal
    }

    pub fn disarm(&self) {
        if let Ok(mut active) = self.active.lock() {
            active.take();
        }
    }

    /// Cancel the armed turn, if any. One interrupt cancels at most one turn.
    pub fn interrupt(&self) -> Interrupt {
        let armed = self.active.lock().ok().and_then(|mut active| active.take());
        match armed {
            Some(handle) => {
                handle.cancel();
                Interrupt::Cancelled
            }
            None => Interrupt::Idle,
        }
    }
}

/// Apply decoded events; returns true once the end sentinel is seen.
fn apply_events(
    events: Vec<StreamEvent>,
    summary: &mut StreamSummary,
    transcript: &mut Transcript,
    on_delta: &mut impl FnMut(&str),
) -> bool {
    for event in events {
        match event {
            StreamEvent::Delta(delta) => {
                summary.content.push_str(&delta);
                transcript.append_delta(&delta);
                on_delta(&delta);
            }
            StreamEvent::Done => return true,
            StreamEvent::Malformed(line) => {
                summary.malformed_frames += 1;
                warn!(frame = %line, "Skipping malformed stream frame");
            }
        }
    }
    false
}

/// Read `chunks` to the end, cancellation, or a transport error, writing the reply
/// into `transcript`. The last entry is extended in place while it is an unfinished
/// assistant reply; otherwise a new one is started. `on_delta` sees each delta after it
/// has been applied.
///
/// Whatever happens, the reply entry is marked finished before returning, so a
/// cancelled or broken stream leaves its partial text in the transcript.
///
/// # Errors
/// The first transport error of `chunks`, after the partial reply was closed.
pub async fn consume_stream<S>(
    mut chunks: S,
    transcript: &mut Transcript,
    mut cancel: CancelSignal,
    mut on_delta: impl FnMut(&str),
) -> Result<StreamSummary>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut summary = StreamSummary::default();

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let events = decoder.push(&chunk);
                if apply_events(events, &mut summary, transcript, &mut on_delta) {
                    break StreamEnd::Done;
                }
            }
            Some(Err(err)) => {
                transcript.finish_streaming();
                return Err(err);
            }
            None => {
                let tail = decoder.finish().into_iter().collect();
                if apply_events(tail, &mut summary, transcript, &mut on_delta) {
                    break StreamEnd::Done;
                }
                break StreamEnd::Closed;
            }
        }
    };

    transcript.finish_streaming();
    summary.end = end;
    debug!(
        chars = summary.content.len(),
        malformed = summary.malformed_frames,
        end = ?summary.end,
        "Stream consumed"
    );
    Ok(summary)
}
