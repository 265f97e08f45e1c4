// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;
use tracing::warn;

/// Incremental parser for newline-delimited JSON frames.
///
/// The stdio transport reads arbitrary chunks from the child's stdout;
/// messages may arrive split across reads or several per read.  The buffer
/// accumulates bytes, splits on `\n`, and yields each complete line that
/// parses as JSON.  Unparseable lines are dropped with a warning: a server
/// printing diagnostics to stdout must not wedge the protocol.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; return every complete frame it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = &line[..line.len() - 1];
            let text = String::from_utf8_lossy(line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!(line = %trimmed, error = %e, "dropping unparseable frame"),
            }
        }
        frames
    }

    /// Bytes of the current incomplete line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn whole_frame_in_one_chunk() {
        let mut fb = FrameBuffer::new();
        let frames = fb.push(b"{\"id\":1,\"result\":{}}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], json!(1));
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut fb = FrameBuffer::new();
        assert!(fb.push(b"{\"id\":").is_empty());
        assert!(fb.push(b"2,\"result\"").is_empty());
        let frames = fb.push(b":null}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], json!(2));
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut fb = FrameBuffer::new();
        let frames = fb.push(b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2]["id"], json!(3));
    }

    #[test]
    fn trailing_partial_is_retained() {
        let mut fb = FrameBuffer::new();
        let frames = fb.push(b"{\"id\":1}\n{\"id\":");
        assert_eq!(frames.len(), 1);
        assert!(fb.pending_len() > 0);
        let frames = fb.push(b"2}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(fb.pending_len(), 0);
    }

    #[test]
    fn garbage_lines_are_dropped() {
        let mut fb = FrameBuffer::new();
        let frames = fb.push(b"not json at all\n{\"id\":7}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], json!(7));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut fb = FrameBuffer::new();
        let frames = fb.push(b"\n\n{\"id\":1}\n\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn k_responses_with_arbitrary_splits_yield_k_frames() {
        // Rebuild the same byte stream with every possible single split
        // point and verify the frame count never changes.
        let stream: Vec<u8> = (1..=5)
            .map(|i| format!("{{\"jsonrpc\":\"2.0\",\"id\":{i},\"result\":{{\"n\":{i}}}}}\n"))
            .collect::<String>()
            .into_bytes();
        for split in 0..stream.len() {
            let mut fb = FrameBuffer::new();
            let mut frames = fb.push(&stream[..split]);
            frames.extend(fb.push(&stream[split..]));
            assert_eq!(frames.len(), 5, "split at byte {split}");
            for (i, frame) in frames.iter().enumerate() {
                assert_eq!(frame["id"], json!(i as i64 + 1), "order must be preserved");
            }
        }
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let stream = b"{\"id\":42,\"result\":\"ok\"}\n";
        let mut fb = FrameBuffer::new();
        let mut frames = Vec::new();
        for b in stream {
            frames.extend(fb.push(&[*b]));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], json!(42));
    }
}
