//! Hex rendering for the byte view of a conversation.
//!
//! Mirrors the tool's hex pane: two-digit uppercase hex per byte, space
//! separated, with a line break after each 0x0A so the hex view lines up
//! with the text view.

use std::fmt::Write;

/// Render bytes the way the hex pane shows them.
pub fn format_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for &byte in data {
        let _ = write!(out, "{:02X} ", byte);
        if byte == 0x0A {
            out.push('\n');
        }
    }
    out
}
