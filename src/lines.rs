//! Incremental line framing: push raw bytes in, pop complete lines out.
//!
//! Lines are split on the byte `\n` before any text decoding happens. A UTF-8
//! continuation byte can never be `\n`, so a multi-byte character split across
//! two pushes is reassembled before its line is decoded.

use bytes::BytesMut;

#[derive(Debug, Default)]
pub struct LineReader {
    buffer: BytesMut,
}

impl LineReader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete line, without its `\n` or a trailing `\r`.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line = self.buffer.split_to(newline + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes retained after the last complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drains the unterminated tail, if any.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let text = String::from_utf8_lossy(&rest);
        Some(text.trim_end_matches('\r').to_string())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
