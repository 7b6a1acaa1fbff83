//! Terminal emulator state
//!
//! Mirrors PTY output into a vt100 parser so a session's screen can be
//! captured, serialized to a single byte stream, and replayed on
//! recovery. The serialized payload is a bounded tail of the raw
//! output stream; replaying it rebuilds both the visible screen and
//! the scrollback behind it, which a viewport snapshot alone cannot.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::SCROLLBACK_LINES;

/// Upper bound on the retained raw-output tail. Sized so a full
/// scrollback of ordinary lines fits with ample headroom.
const RAW_TAIL_BYTES: usize = 512 * 1024;

/// In-memory terminal screen fed by the session's forward loop.
pub struct ScreenState {
    parser: vt100::Parser,
    /// Bounded raw output, replayed to rebuild screen and scrollback.
    tail: Vec<u8>,
}

impl ScreenState {
    /// Create an emulator with the given dimensions and the bounded
    /// default scrollback.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, SCROLLBACK_LINES),
            tail: Vec::new(),
        }
    }

    /// Process PTY output bytes.
    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
        self.tail.extend_from_slice(bytes);
        if self.tail.len() > RAW_TAIL_BYTES {
            let excess = self.tail.len() - RAW_TAIL_BYTES;
            self.tail.drain(..excess);
            // Also drop the partial line left at the new front so the
            // tail starts on a clean boundary.
            if let Some(newline) = self.tail.iter().position(|&b| b == b'\n') {
                self.tail.drain(..=newline);
            }
        }
    }

    /// Resize the emulated screen.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
    }

    /// Current size as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }

    /// Visible screen contents as plain text.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    /// Everything the retained output still shows, scrollback included.
    ///
    /// Replays the tail through a parser tall enough that nothing
    /// scrolls off, so lines above the visible viewport are readable.
    pub fn full_contents(&self) -> String {
        let (_, cols) = self.size();
        let mut parser = vt100::Parser::new(SCROLLBACK_LINES as u16, cols, 0);
        parser.process(&self.tail);
        parser.screen().contents()
    }

    /// Serialize the screen to an opaque single-stream form.
    ///
    /// The payload is the base64 of the bounded raw-output tail;
    /// feeding it through a fresh parser reproduces the visible screen
    /// and the scrollback behind it, within the retention bound.
    pub fn serialize(&self) -> String {
        STANDARD.encode(&self.tail)
    }

    /// Rebuild a screen from a serialized payload.
    ///
    /// An undecodable payload yields an empty screen of the requested
    /// size rather than an error; recovery is best-effort.
    pub fn restore(serialized: &str, rows: u16, cols: u16) -> Self {
        let mut state = Self::new(rows, cols);
        if let Ok(bytes) = STANDARD.decode(serialized) {
            state.process(&bytes);
        }
        state
    }
}
