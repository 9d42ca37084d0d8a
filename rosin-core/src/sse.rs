//! Server-Sent Events frame parsing.
//!
//! [`SseParser`] assembles `data: ` payloads from arbitrarily split byte
//! chunks. Bytes are buffered until a newline so multi-byte UTF-8 sequences
//! split across chunks decode correctly. [`sse_payloads`] lifts the parser over
//! a byte-chunk stream.

use futures::{Stream, StreamExt, stream};
use std::collections::VecDeque;
use std::pin::Pin;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental line assembler yielding SSE data payloads.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel has been seen; later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk and return every payload completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        if self.done {
            return payloads;
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = &self.buffer[start..end];
            start = end + 1;
            match parse_line(line) {
                Line::Payload(p) => payloads.push(p),
                Line::Done => {
                    self.done = true;
                    self.buffer.clear();
                    return payloads;
                }
                Line::Ignored => {}
            }
        }
        self.buffer.drain(..start);
        payloads
    }

    /// Flush the trailing partial line at end of input.
    pub fn finish(&mut self) -> Option<String> {
        if self.done || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        match parse_line(&rest) {
            Line::Payload(p) => Some(p),
            Line::Done => {
                self.done = true;
                None
            }
            Line::Ignored => None,
        }
    }
}

enum Line {
    Payload(String),
    Done,
    Ignored,
}

fn parse_line(raw: &[u8]) -> Line {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    match text.strip_prefix(DATA_PREFIX) {
        Some(DONE_SENTINEL) => Line::Done,
        Some(payload) => Line::Payload(payload.to_string()),
        // event:, id:, retry:, comments, blank separators
        None => Line::Ignored,
    }
}

struct PayloadState<S> {
    inner: Pin<Box<S>>,
    parser: SseParser,
    pending: VecDeque<String>,
    exhausted: bool,
}

/// Turn a byte-chunk stream into a stream of SSE data payloads.
///
/// Ends at the `[DONE]` sentinel or when the input ends. A transport error is
/// yielded once and ends the stream.
pub fn sse_payloads<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let state = PayloadState {
        inner: Box::pin(bytes),
        parser: SseParser::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(payload) = st.pending.pop_front() {
                return Some((Ok(payload), st));
            }
            if st.exhausted || st.parser.is_done() {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    let payloads = st.parser.feed(chunk.as_ref());
                    st.pending.extend(payloads);
                }
                Some(Err(e)) => {
                    st.exhausted = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.exhausted = true;
                    if let Some(payload) = st.parser.finish() {
                        st.pending.push_back(payload);
                    }
                }
            }
        }
    })
}
