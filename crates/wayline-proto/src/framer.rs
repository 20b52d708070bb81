use bytes::BytesMut;

use crate::codec::MAX_MESSAGE_SIZE;
use crate::error::FrameError;

/// Splits a byte stream into `\n`-terminated lines.
///
/// Reads may cut a line anywhere; the unterminated tail is kept until the
/// next call. At most one partial line is ever buffered, and it is bounded
/// by `max_line`. A line that outgrows the bound is reported once and the
/// rest of it is skipped up to the next terminator.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    max_line: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self { buf: BytesMut::with_capacity(256), max_line, discarding: false }
    }

    /// Feed one chunk. Returns every line completed by it, in arrival order.
    /// Empty lines are skipped and a trailing `\r` is removed.
    pub fn accumulate(&mut self, bytes: &[u8]) -> Vec<Result<String, FrameError>> {
        let mut out = Vec::new();
        let mut rest = bytes;

        while !rest.is_empty() {
            match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let head = &rest[..pos];
                    rest = &rest[pos + 1..];

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    let ends_cr = match head.last() {
                        Some(b) => *b == b'\r',
                        None => self.buf.last() == Some(&b'\r'),
                    };
                    let dropped = self.buf.len() + head.len();
                    // the `\r` of a CRLF terminator is not line content
                    if dropped - usize::from(ends_cr) > self.max_line {
                        self.buf.clear();
                        out.push(Err(FrameError::Oversized { dropped, max: self.max_line }));
                        continue;
                    }

                    self.buf.extend_from_slice(head);
                    let line = self.buf.split();
                    if let Some(frame) = finish(&line) {
                        out.push(frame);
                    }
                }
                None => {
                    if self.discarding {
                        // still inside an oversized line
                    } else if self.buf.len() + rest.len() > self.max_line + usize::from(rest.last() == Some(&b'\r')) {
                        let dropped = self.buf.len() + rest.len();
                        self.buf.clear();
                        self.discarding = true;
                        out.push(Err(FrameError::Oversized { dropped, max: self.max_line }));
                    } else {
                        self.buf.extend_from_slice(rest);
                    }
                    break;
                }
            }
        }

        out
    }

    /// Bytes of the pending unterminated line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}

fn finish(raw: &[u8]) -> Option<Result<String, FrameError>> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    Some(
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| FrameError::InvalidUtf8 { len: raw.len() }),
    )
}
