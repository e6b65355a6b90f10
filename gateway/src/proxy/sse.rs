//! Server-sent-event pipe between the upstream stream and the client.
//!
//! Upstream frames arrive as `data: <json>` and may be wrapped in the
//! `{response:{…}}` envelope. The pipe reframes byte chunks into complete
//! lines, unwraps (or passes through) each frame, and tracks the last seen
//! `usageMetadata.totalTokenCount` for accounting.

use serde_json::Value;

use crate::proxy::payload::{total_token_count, unwrap_envelope};

/// Whether frames are rewritten to the unwrapped public shape or forwarded
/// exactly as the upstream sent them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Unwrap,
    Verbatim,
}

pub struct SsePipe {
    mode: FrameMode,
    buffer: String,
    last_token_count: Option<i64>,
    frames_emitted: u64,
}

impl SsePipe {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            mode,
            buffer: String::new(),
            last_token_count: None,
            frames_emitted: 0,
        }
    }

    /// Feed a raw byte chunk; returns the data payloads of every frame that
    /// completed inside it. Frames can split across chunk boundaries, so a
    /// partial trailing line stays buffered.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(payload) = self.process_line(line.trim_end_matches(['\r', '\n'])) {
                out.push(payload);
            }
        }
        out
    }

    /// Flush any buffered tail at end-of-stream (a final frame without a
    /// trailing newline).
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        self.process_line(line.trim_end_matches(['\r', '\n']))
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();

        // The gateway appends its own terminator; an upstream one is dropped.
        if data == "[DONE]" {
            return None;
        }

        self.frames_emitted += 1;

        match serde_json::from_str::<Value>(data) {
            Ok(frame) => {
                if let Some(count) = total_token_count(&frame) {
                    self.last_token_count = Some(count);
                }
                match self.mode {
                    FrameMode::Unwrap => {
                        Some(unwrap_envelope(frame).to_string())
                    }
                    FrameMode::Verbatim => Some(data.to_string()),
                }
            }
            // Unparseable frames go through untouched.
            Err(_) => Some(data.to_string()),
        }
    }

    /// Latest token count seen in any frame (either envelope shape).
    pub fn token_count(&self) -> Option<i64> {
        self.last_token_count
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }
}

/// Format a data payload as an SSE frame.
pub fn format_frame(payload: &str) -> String {
    format!("data: {}\n\n", payload)
}

/// The terminal frame of a completed public stream.
pub fn done_frame() -> String {
    "data: [DONE]\n\n".to_string()
}
