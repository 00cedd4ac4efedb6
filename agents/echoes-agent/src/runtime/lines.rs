//! Line framing for raw log output.

use anyhow::{anyhow, Result};
use futures_util::{stream, Stream, StreamExt};
use std::collections::VecDeque;

use crate::runtime::adapter::LogStream;

/// Longest line accepted, terminator excluded
pub const MAX_LINE_BYTES: usize = 64 * 1024;

struct LineState<S> {
    chunks: S,
    partial: Vec<u8>,
    ready: VecDeque<String>,
    overflow: bool,
    done: bool,
}

impl<S> LineState<S> {
    fn push(&mut self, chunk: &[u8]) {
        for byte in chunk {
            if *byte == b'\n' {
                let line = std::mem::take(&mut self.partial);
                self.ready.push_back(decode(line));
            } else if self.partial.len() == MAX_LINE_BYTES {
                self.overflow = true;
                return;
            } else {
                self.partial.push(*byte);
            }
        }
    }
}

fn decode(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}

/// Re-split arbitrary byte chunks into text lines.
///
/// A trailing unterminated line is emitted when the input ends. An error
/// from the input is passed through and ends the stream. So does a line
/// longer than [`MAX_LINE_BYTES`]; lines completed before it are still
/// yielded.
pub fn split_lines<S, B>(chunks: S) -> LogStream
where
    S: Stream<Item = Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = LineState {
        chunks,
        partial: Vec::new(),
        ready: VecDeque::new(),
        overflow: false,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            if state.overflow {
                state.done = true;
                state.partial = Vec::new();
                let err = anyhow!("log line longer than {MAX_LINE_BYTES} bytes");
                return Some((Err(err), state));
            }

            match state.chunks.next().await {
                Some(Ok(chunk)) => state.push(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    if !state.partial.is_empty() {
                        let line = decode(std::mem::take(&mut state.partial));
                        return Some((Ok(line), state));
                    }
                }
            }
        }
    }))
}
