use anyhow::anyhow;
use futures_util::StreamExt;
use std::collections::VecDeque;

use super::ChunkStream;

/// Decode a `text/event-stream` body into its `data:` payloads.
///
/// Event names and comment lines are skipped and the OpenAI-style `[DONE]`
/// sentinel is swallowed. Byte chunks may split lines (and UTF-8 sequences)
/// arbitrarily, so the buffer is kept as raw bytes and only complete
/// newline-terminated lines are decoded.
pub(crate) fn data_events(response: reqwest::Response) -> ChunkStream {
    let state = DecodeState {
        body: response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed(),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    drain_lines(&mut state.buffer, &mut state.ready);
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(anyhow!("stream read failed: {}", err)), state));
                }
                None => {
                    state.done = true;
                    // Trailing data without a final newline still counts.
                    if !state.buffer.is_empty() {
                        let rest = std::mem::take(&mut state.buffer);
                        push_data_line(&String::from_utf8_lossy(&rest), &mut state.ready);
                    }
                }
            }
        }
    }))
}

struct DecodeState {
    body: futures_util::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    ready: VecDeque<String>,
    done: bool,
}

fn drain_lines(buffer: &mut Vec<u8>, ready: &mut VecDeque<String>) {
    while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        push_data_line(line.trim_end_matches(['\n', '\r']), ready);
    }
}

fn push_data_line(line: &str, ready: &mut VecDeque<String>) {
    let Some(payload) = line.strip_prefix("data:") else {
        return;
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return;
    }
    ready.push_back(payload.to_string());
}
