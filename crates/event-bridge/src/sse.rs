//! Incremental decoder for `text/event-stream` bodies
//!
//! Bytes arrive in arbitrary chunks; the decoder buffers partial lines
//! across calls to `feed`. A frame collects `event`, `data` and `id` fields
//! until a blank line, and only frames carrying all three become an `Event`.
//! Keep-alive frames and comments therefore produce nothing.
//!
//! Line terminators `\r\n`, `\n` and a lone `\r` are all accepted, including
//! a `\r\n` pair split across two chunks. A frame still open when the
//! stream ends is dropped.
//!
//! Lines and accumulated `data` are capped at `MAX_FRAME_BYTES`; a frame
//! exceeding the cap is discarded up to the next blank line.

use tracing::warn;

use crate::event::Event;

/// Upper bound for a single line and for the joined `data` of one frame.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Default)]
struct Frame {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
}

impl Frame {
    fn into_event(self) -> Option<Event> {
        Some(Event {
            equipment_id: self.id?,
            event_name: self.event?,
            payload: self.data?,
        })
    }
}

/// Stateful frame decoder for one stream connection.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    /// Previous chunk ended in `\r`; a leading `\n` belongs to that line break.
    pending_cr: bool,
    /// Current line exceeded the cap; skip bytes until its terminator.
    skip_line: bool,
    /// Current frame exceeded the cap; ignore fields until the blank line.
    discarding: bool,
    frame: Frame,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.pending_cr = true;
                    self.end_line(&mut events);
                }
                _ if self.skip_line => {}
                _ if self.line.len() >= MAX_FRAME_BYTES => {
                    warn!(limit = MAX_FRAME_BYTES, "event stream line too long, dropping frame");
                    self.line = Vec::new();
                    self.skip_line = true;
                    self.discard_frame();
                }
                _ => self.line.push(byte),
            }
        }
        events
    }

    fn discard_frame(&mut self) {
        self.frame = Frame::default();
        self.discarding = true;
    }

    fn end_line(&mut self, events: &mut Vec<Event>) {
        if std::mem::take(&mut self.skip_line) {
            return;
        }
        let raw = std::mem::take(&mut self.line);
        if raw.is_empty() {
            let frame = std::mem::take(&mut self.frame);
            if std::mem::take(&mut self.discarding) {
                return;
            }
            if let Some(event) = frame.into_event() {
                events.push(event);
            }
            return;
        }

        let line = String::from_utf8_lossy(&raw);
        if self.discarding || line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match field {
            "event" => self.frame.event = Some(value.to_owned()),
            "id" => self.frame.id = Some(value.to_owned()),
            "data" => match self.frame.data.as_mut() {
                Some(data) if data.len() + 1 + value.len() > MAX_FRAME_BYTES => {
                    warn!(limit = MAX_FRAME_BYTES, "event data too long, dropping frame");
                    self.discard_frame();
                }
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.frame.data = Some(value.to_owned()),
            },
            // `retry` and unknown fields
            _ => {}
        }
    }
}
