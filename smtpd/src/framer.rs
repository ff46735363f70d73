//! The line framer: turns an inbound byte stream into CRLF-delimited
//! commands, and in DATA mode into a dot-unstuffed payload stream
//! terminated by `<CRLF>.<CRLF>`.
//!
//! The DATA terminator is tracked with a bounded-memory, incremental
//! `ANY -> CR -> LF -> DOT -> CR -> LF` sub-state-machine, kept as a
//! small standalone type so it can be driven a chunk at a time without
//! ever holding the full payload in memory.

use crate::error::ConnectionError;

/// Maximum command-line length, including the terminating CRLF.
pub const MAX_LINE_LEN: usize = 512;

/// One event produced by feeding bytes through the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete command line, CRLF stripped.
    Line(String),
    /// A chunk of DATA payload, post dot-unstuffing, pre-terminator.
    Payload(Vec<u8>),
    /// The DATA terminator was seen; back to command mode.
    DataComplete,
    /// A command-mode line exceeded [`MAX_LINE_LEN`]; the framer has
    /// already discarded through the terminating CRLF.
    LineTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    /// Discard bytes of an over-long command line until its CRLF.
    DiscardingLine,
    Data,
}

/// Tracks progress through the `<CR><LF>.<CR><LF>` (or tolerant
/// `<LF>.<LF>`) terminator while scanning DATA payload bytes one at a
/// time. `Any` is also the "mid-line" state after a dot that turned out
/// not to start a terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DotState {
    /// Start of a line: a `.` here might begin dot-stuffing or the
    /// terminator.
    LineStart,
    Any,
    Cr,
    CrLfDot,
    CrLfDotCr,
}

pub struct LineFramer {
    mode: Mode,
    /// Command-mode line accumulator, capped at `MAX_LINE_LEN`.
    line_buf: Vec<u8>,
    dot_state: DotState,
    /// Buffered, not-yet-terminator-confirmed bytes held back while the
    /// dot-state machine disambiguates a line-leading `.`/CR/LF run.
    pending: Vec<u8>,
    /// Ordinary (non-CR) DATA payload bytes accumulated since the last
    /// flush, so a chunk of plain content becomes one `Frame::Payload`
    /// instead of one per byte. Flushed whenever a `\r` starts a
    /// terminator candidate, and at the end of every `feed` call.
    payload_buf: Vec<u8>,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self {
            mode: Mode::Command,
            line_buf: Vec::with_capacity(128),
            dot_state: DotState::LineStart,
            pending: Vec::new(),
            payload_buf: Vec::new(),
        }
    }
}

impl LineFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches into DATA mode: called once the state machine accepts
    /// the `DATA` command and replies `354`.
    pub fn enter_data_mode(&mut self) {
        self.mode = Mode::Data;
        self.dot_state = DotState::LineStart;
        self.pending.clear();
        self.payload_buf.clear();
    }

    #[must_use]
    pub fn in_data_mode(&self) -> bool {
        matches!(self.mode, Mode::Data)
    }

    /// Feeds a chunk of freshly-read bytes through the framer, appending
    /// every resulting [`Frame`] to `out`. Never buffers more than one
    /// pending command line (capped) or a handful of disambiguation bytes
    /// in DATA mode -- bounded memory regardless of message size.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Frame>) -> Result<(), ConnectionError> {
        for &byte in chunk {
            match self.mode {
                Mode::Command => self.feed_command_byte(byte, out),
                Mode::DiscardingLine => self.feed_discard_byte(byte, out),
                Mode::Data => self.feed_data_byte(byte, out),
            }
        }
        self.flush_payload(out);
        Ok(())
    }

    /// Emits any ordinary bytes accumulated since the last flush as a
    /// single `Frame::Payload`, instead of letting each chunk trail an
    /// unflushed remainder until the next `feed` call.
    fn flush_payload(&mut self, out: &mut Vec<Frame>) {
        if !self.payload_buf.is_empty() {
            out.push(Frame::Payload(std::mem::take(&mut self.payload_buf)));
        }
    }

    fn feed_command_byte(&mut self, byte: u8, out: &mut Vec<Frame>) {
        if byte == b'\n' {
            let line = std::mem::take(&mut self.line_buf);
            let line = line.strip_suffix(b"\r").unwrap_or(&line).to_vec();
            let text = String::from_utf8_lossy(&line).into_owned();
            out.push(Frame::Line(text));
            return;
        }

        self.line_buf.push(byte);
        if self.line_buf.len() > MAX_LINE_LEN {
            self.line_buf.clear();
            self.mode = Mode::DiscardingLine;
            out.push(Frame::LineTooLong);
        }
    }

    fn feed_discard_byte(&mut self, byte: u8, _out: &mut Vec<Frame>) {
        if byte == b'\n' {
            self.mode = Mode::Command;
        }
    }

    /// Drives the dot-unstuffing terminator sub-state-machine one byte at
    /// a time: `LineStart --.-> Cr? ... -> CrLfDot -> CrLfDotCr -> (LF =
    /// terminator)`. Also accepts the tolerant `<LF>.<LF>` form.
    fn feed_data_byte(&mut self, byte: u8, out: &mut Vec<Frame>) {
        match (self.dot_state, byte) {
            // Line start: a leading dot is either stuffing (followed by
            // more payload) or the first byte of the terminator. Hold it
            // back until we know which.
            (DotState::LineStart, b'.') => {
                self.flush_payload(out);
                self.pending.push(byte);
                self.dot_state = DotState::CrLfDot;
            }
            (DotState::LineStart, b'\r') => {
                self.flush_payload(out);
                self.pending.push(byte);
                self.dot_state = DotState::Cr;
            }
            (DotState::LineStart, _) => {
                self.payload_buf.push(byte);
                self.dot_state = if byte == b'\n' {
                    DotState::LineStart
                } else {
                    DotState::Any
                };
            }

            // Mid-line: only CR is interesting (start of a terminator
            // candidate); everything else passes straight through.
            (DotState::Any, b'\r') => {
                self.flush_payload(out);
                self.pending.push(byte);
                self.dot_state = DotState::Cr;
            }
            (DotState::Any, b'\n') => {
                self.payload_buf.push(byte);
                self.dot_state = DotState::LineStart;
            }
            (DotState::Any, _) => {
                self.payload_buf.push(byte);
            }

            // Saw CR: LF continues toward a terminator candidate (the
            // line that follows might start with the dot); anything else
            // flushes CR as ordinary payload and re-evaluates this byte
            // as a fresh line-start byte.
            (DotState::Cr, b'\n') => {
                self.pending.push(byte);
                self.dot_state = DotState::LineStart;
                // A bare CRLF with nothing pending beyond it is just a
                // line break; flush it now, since only a *following*
                // dot turns this into terminator business.
                let flushed = std::mem::take(&mut self.pending);
                out.push(Frame::Payload(flushed));
            }
            (DotState::Cr, other) => {
                let mut flushed = std::mem::take(&mut self.pending);
                flushed.push(other);
                out.push(Frame::Payload(flushed));
                self.dot_state = if other == b'\r' {
                    self.pending.push(b'\r');
                    DotState::Cr
                } else {
                    DotState::Any
                };
            }

            // After `<CR><LF>.`: CR continues toward the terminator.
            // Anything else means this was dot-stuffing: emit one dot
            // fewer than received and resume as ordinary payload.
            (DotState::CrLfDot, b'\r') => {
                self.pending.push(byte);
                self.dot_state = DotState::CrLfDotCr;
            }
            // Tolerant terminator: a lone `.` directly
            // followed by `\n`, with no intervening CR, on implementations
            // that accept `<LF>.<LF>`. Unambiguous against dot-stuffing:
            // a genuine content line of `.` is always stuffed to `..`.
            (DotState::CrLfDot, b'\n') => {
                self.pending.clear();
                self.dot_state = DotState::LineStart;
                out.push(Frame::DataComplete);
                self.mode = Mode::Command;
            }
            (DotState::CrLfDot, other) => {
                // Unstuff: the buffered leading dot (and any CRLF that
                // preceded it) is payload, but the extra dot itself is
                // removed. `pending` holds, at most, `\r\n.` or just `.`.
                let unstuffed = unstuff_pending(&self.pending);
                let mut flushed = unstuffed;
                flushed.push(other);
                out.push(Frame::Payload(flushed));
                self.pending.clear();
                self.dot_state = if other == b'\r' {
                    self.pending.push(b'\r');
                    DotState::Cr
                } else {
                    DotState::Any
                };
            }

            // After `<CR><LF>.<CR>`: LF completes the terminator.
            // Anything else was not a terminator after all.
            (DotState::CrLfDotCr, b'\n') => {
                self.pending.clear();
                self.dot_state = DotState::LineStart;
                out.push(Frame::DataComplete);
                self.mode = Mode::Command;
            }
            (DotState::CrLfDotCr, other) => {
                let unstuffed = unstuff_pending(&self.pending);
                let mut flushed = unstuffed;
                flushed.push(other);
                out.push(Frame::Payload(flushed));
                self.pending.clear();
                self.dot_state = if other == b'\r' {
                    self.pending.push(b'\r');
                    DotState::Cr
                } else {
                    DotState::Any
                };
            }
        }

    }
}

/// Removes exactly one leading `.` from a pending `.` / `.\r` buffer
/// (dot-unstuffing); the dot is always the first byte pushed when entering
/// `CrLfDot`, regardless of how many bytes follow it.
fn unstuff_pending(pending: &[u8]) -> Vec<u8> {
    if let Some(rest) = pending.strip_prefix(b".") {
        rest.to_vec()
    } else {
        pending.to_vec()
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::Command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut LineFramer, data: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        framer.feed(data, &mut out).unwrap();
        out
    }

    #[test]
    fn splits_command_lines_on_crlf() {
        let mut framer = LineFramer::new();
        let out = feed(&mut framer, b"EHLO foo\r\nQUIT\r\n");
        assert_eq!(
            out,
            vec![
                Frame::Line("EHLO foo".to_string()),
                Frame::Line("QUIT".to_string())
            ]
        );
    }

    #[test]
    fn splits_across_multiple_feeds() {
        let mut framer = LineFramer::new();
        let mut out = feed(&mut framer, b"EHLO fo");
        assert!(out.is_empty());
        out = feed(&mut framer, b"o\r\n");
        assert_eq!(out, vec![Frame::Line("EHLO foo".to_string())]);
    }

    #[test]
    fn rejects_oversized_line() {
        let mut framer = LineFramer::new();
        let long_line = vec![b'A'; MAX_LINE_LEN + 10];
        let mut out = feed(&mut framer, &long_line);
        assert_eq!(out, vec![Frame::LineTooLong]);
        out = feed(&mut framer, b"\r\nQUIT\r\n");
        assert_eq!(out, vec![Frame::Line("QUIT".to_string())]);
    }

    #[test]
    fn exactly_512_octets_is_accepted() {
        // 512 includes the trailing CRLF, so 510 content bytes + CRLF.
        let mut framer = LineFramer::new();
        let content = vec![b'A'; MAX_LINE_LEN - 2];
        let mut line = content.clone();
        line.extend_from_slice(b"\r\n");
        let out = feed(&mut framer, &line);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Frame::Line(s) if s.len() == MAX_LINE_LEN - 2));
    }

    #[test]
    fn data_mode_passes_through_plain_payload() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        let out = feed(&mut framer, b"Subject: hi\r\n\r\nbody\r\n.\r\n");
        let mut payload = Vec::new();
        let mut completed = false;
        for frame in out {
            match frame {
                Frame::Payload(bytes) => payload.extend(bytes),
                Frame::DataComplete => completed = true,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(completed);
        assert_eq!(payload, b"Subject: hi\r\n\r\nbody\r\n");
    }

    #[test]
    fn data_mode_unstuffs_leading_dots() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        let out = feed(&mut framer, b"..leading dot\r\n.\r\n");
        let mut payload = Vec::new();
        for frame in out {
            if let Frame::Payload(bytes) = frame {
                payload.extend(bytes);
            }
        }
        assert_eq!(payload, b".leading dot\r\n");
    }

    #[test]
    fn stuffed_terminator_look_alike_does_not_terminate_early() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        // Client sent a line that was literally "." and dot-stuffed it to
        // "..": on the wire this is `\r\n..\r\n`, which must NOT look like
        // the terminator and must decode back to a lone `.` line.
        let mut out = Vec::new();
        framer
            .feed(b"before\r\n..\r\nafter\r\n.\r\n", &mut out)
            .unwrap();
        let mut payload = Vec::new();
        let mut completions = 0;
        for frame in out {
            match frame {
                Frame::Payload(bytes) => payload.extend(bytes),
                Frame::DataComplete => completions += 1,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(payload, b"before\r\n.\r\nafter\r\n");
    }

    #[test]
    fn data_terminator_split_across_feeds() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        let mut out = feed(&mut framer, b"body\r\n.");
        assert!(out.iter().all(|f| !matches!(f, Frame::DataComplete)));
        out = feed(&mut framer, b"\r\n");
        assert!(out.iter().any(|f| matches!(f, Frame::DataComplete)));
    }

    #[test]
    fn tolerant_bare_lf_terminator() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        let out = feed(&mut framer, b"line one\n.\n");
        assert!(out.iter().any(|f| matches!(f, Frame::DataComplete)));
    }

    #[test]
    fn stuffed_dot_line_survives_bare_lf_transport() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        let out = feed(&mut framer, b"..\n.\n");
        let mut payload = Vec::new();
        let mut completions = 0;
        for frame in out {
            match frame {
                Frame::Payload(bytes) => payload.extend(bytes),
                Frame::DataComplete => completions += 1,
                _ => {}
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(payload, b".\n");
    }

    #[test]
    fn stuffed_dot_followed_by_bare_cr_is_unstuffed() {
        // Stuffed line ".\rX" (a leading dot followed by a bare CR that is
        // not part of a CRLF) must lose exactly the stuffed dot, not leak
        // it into the payload, even though the terminator candidate here
        // runs two bytes deep (`.` then `\r`) before failing.
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        let out = feed(&mut framer, b".\rX\r\n.\r\n");
        let mut payload = Vec::new();
        let mut completions = 0;
        for frame in out {
            match frame {
                Frame::Payload(bytes) => payload.extend(bytes),
                Frame::DataComplete => completions += 1,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(payload, b"\rX\r\n");
    }

    #[test]
    fn ordinary_payload_bytes_are_batched_not_emitted_one_frame_per_byte() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        let body = vec![b'A'; 4096];
        let mut out = Vec::new();
        framer.feed(&body, &mut out).unwrap();
        // One contiguous run of ordinary bytes in a single feed() call must
        // collapse to a single Payload frame, not 4096 of them.
        assert_eq!(out, vec![Frame::Payload(body)]);
    }

    #[test]
    fn returns_to_command_mode_after_terminator() {
        let mut framer = LineFramer::new();
        framer.enter_data_mode();
        feed(&mut framer, b".\r\n");
        assert!(!framer.in_data_mode());
        let out = feed(&mut framer, b"MAIL FROM:<a@example.com>\r\n");
        assert_eq!(
            out,
            vec![Frame::Line("MAIL FROM:<a@example.com>".to_string())]
        );
    }
}
