//! Incremental assembly of token pieces into complete UTF-8 text.
//!
//! A single token frequently carries only part of a multi-byte character.
//! Pieces are buffered until the buffer holds whole characters only.

use crate::error::{BridgeError, Result};

/// Expected length of the unit introduced by `lead`, or `None` for a byte
/// that cannot start a unit.
fn unit_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// `true` when `bytes` is a run of structurally complete units with no
/// trailing partial unit.
pub fn is_complete_utf8(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        let Some(len) = unit_len(bytes[i]) else {
            return false;
        };
        let Some(unit) = bytes.get(i..i + len) else {
            return false;
        };
        if !unit[1..].iter().all(|&b| is_continuation(b)) {
            return false;
        }
        i += len;
    }
    true
}

/// Per-session pending-fragment buffer.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
    max_pending: Option<usize>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that fails with [`BridgeError::PendingOverflow`] once more
    /// than `max` bytes are waiting.
    pub fn with_limit(max: Option<usize>) -> Self {
        Self {
            pending: Vec::new(),
            max_pending: max,
        }
    }

    /// Add a piece. Returns the buffered text once it is complete, or
    /// `None` while more bytes are needed. An empty buffer never yields
    /// text.
    pub fn push(&mut self, piece: &[u8]) -> Result<Option<String>> {
        self.pending.extend_from_slice(piece);

        if self.pending.is_empty() || !is_complete_utf8(&self.pending) {
            let len = self.pending.len();
            if self.max_pending.is_some_and(|max| len > max) {
                self.pending.clear();
                return Err(BridgeError::PendingOverflow(len));
            }
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Ok(Some(text))
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
