use tracing::{debug, trace};

const STATUS_BIT: u8 = 0x80;
const CONTROL_CHANGE: u8 = 0xB0;
const PROGRAM_CHANGE: u8 = 0xC0;
const CHANNEL_PRESSURE: u8 = 0xD0;
const SYSTEM: u8 = 0xF0;

/// A Control Change message: controller number and its 0-127 value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEvent {
    pub controller: u8,
    pub value: u8,
}

/// Incremental MIDI frame parser for an append-only byte stream.
///
/// Bytes that do not yet form a complete frame stay buffered until the next
/// call to [`FrameParser::feed`]. Only Control Change frames produce events;
/// every other message is consumed and discarded.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every Control Change completed by them,
    /// in stream order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ControlEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut pos = 0;

        while pos < self.buffer.len() {
            let status = self.buffer[pos];

            // Data byte with no status in front of it: resync.
            if status & STATUS_BIT == 0 {
                pos += 1;
                continue;
            }

            let frame_len = match status & 0xF0 {
                CONTROL_CHANGE => 3,
                PROGRAM_CHANGE | CHANNEL_PRESSURE => 2,
                SYSTEM => {
                    // No length table for system messages; drop the status byte.
                    trace!("skipping system status byte {:#04x}", status);
                    pos += 1;
                    continue;
                }
                _ => 3,
            };

            if self.buffer.len() - pos < frame_len {
                break;
            }

            if status & 0xF0 == CONTROL_CHANGE {
                let event = ControlEvent {
                    controller: self.buffer[pos + 1],
                    value: self.buffer[pos + 2],
                };
                debug!("CC{} = {}", event.controller, event.value);
                events.push(event);
            } else {
                trace!("discarding {:?}", &self.buffer[pos..pos + frame_len]);
            }
            pos += frame_len;
        }

        self.buffer.drain(..pos);
        events
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
