//! Byte-level filter over raw PTY output.
//!
//! The session forwards shell output to the real terminal unmodified except
//! for one sequence: a full scroll region reset (`CSI r`), which would
//! release the status row, is rewritten to the content region. Alternate
//! screen switches and full resets are reported so the session can suspend
//! or redraw the status line.

/// Alternate screen buffer modes.
const ALT_SCREEN_MODES: &[u16] = &[47, 1047, 1049];

/// Longest escape sequence held back before giving up on it.
const MAX_SEQUENCE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalEvent {
    /// `CSI ? 1049 h` and friends (`true`), or the matching reset.
    AltScreen(bool),
    /// `CSI r`, scroll region reset to the whole screen.
    ScrollRegionReset,
    /// `ESC c`, full terminal reset.
    FullReset,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Filtered {
    pub bytes: Vec<u8>,
    pub events: Vec<TerminalEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Ground,
    Esc,
    Csi,
}

/// Stateful filter; escape sequences split across reads are held back until
/// they complete.
pub struct OutputFilter {
    state: ScanState,
    seq: Vec<u8>,
}

impl OutputFilter {
    pub fn new() -> Self {
        Self {
            state: ScanState::Ground,
            seq: Vec::new(),
        }
    }

    /// Filter one chunk. `content_rows` is the height of the region above
    /// the status row; `None` leaves scroll region resets untouched.
    pub fn process(&mut self, data: &[u8], content_rows: Option<u16>) -> Filtered {
        let mut out = Filtered {
            bytes: Vec::with_capacity(data.len()),
            events: Vec::new(),
        };

        for &byte in data {
            match self.state {
                ScanState::Ground => {
                    if byte == 0x1b {
                        self.seq.clear();
                        self.seq.push(byte);
                        self.state = ScanState::Esc;
                    } else {
                        out.bytes.push(byte);
                    }
                }
                ScanState::Esc => match byte {
                    b'[' => {
                        self.seq.push(byte);
                        self.state = ScanState::Csi;
                    }
                    0x1b => {
                        // Lone ESC followed by another sequence.
                        out.bytes.push(0x1b);
                    }
                    b'c' => {
                        self.seq.push(byte);
                        out.bytes.append(&mut self.seq);
                        out.events.push(TerminalEvent::FullReset);
                        self.state = ScanState::Ground;
                    }
                    _ => {
                        self.seq.push(byte);
                        out.bytes.append(&mut self.seq);
                        self.state = ScanState::Ground;
                    }
                },
                ScanState::Csi => {
                    self.seq.push(byte);
                    if (0x40..=0x7e).contains(&byte) {
                        self.complete_csi(content_rows, &mut out);
                        self.state = ScanState::Ground;
                    } else if self.seq.len() >= MAX_SEQUENCE_LEN {
                        out.bytes.append(&mut self.seq);
                        self.state = ScanState::Ground;
                    }
                }
            }
        }

        out
    }

    fn complete_csi(&mut self, content_rows: Option<u16>, out: &mut Filtered) {
        let seq = std::mem::take(&mut self.seq);
        let final_byte = seq[seq.len() - 1];
        let params = &seq[2..seq.len() - 1];

        if final_byte == b'r' && params.iter().all(|&b| b == b';') {
            out.events.push(TerminalEvent::ScrollRegionReset);
            match content_rows {
                Some(rows) => out
                    .bytes
                    .extend_from_slice(format!("\x1b[1;{rows}r").as_bytes()),
                None => out.bytes.extend_from_slice(&seq),
            }
            return;
        }

        if let Some(modes) = params.strip_prefix(b"?")
            && matches!(final_byte, b'h' | b'l')
        {
            let alt = modes
                .split(|&b| b == b';')
                .filter_map(|m| std::str::from_utf8(m).ok()?.parse::<u16>().ok())
                .any(|m| ALT_SCREEN_MODES.contains(&m));
            if alt {
                out.events.push(TerminalEvent::AltScreen(final_byte == b'h'));
            }
        }

        out.bytes.extend_from_slice(&seq);
    }
}

impl Default for OutputFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_sgr_pass_through() {
        let mut filter = OutputFilter::new();
        let input = b"hello \x1b[1;31mred\x1b[0m\r\n";
        let out = filter.process(input, Some(23));
        assert_eq!(out.bytes, input);
        assert!(out.events.is_empty());
    }

    #[test]
    fn scroll_region_reset_is_rewritten() {
        let mut filter = OutputFilter::new();
        let out = filter.process(b"a\x1b[rb", Some(23));
        assert_eq!(out.bytes, b"a\x1b[1;23rb");
        assert_eq!(out.events, vec![TerminalEvent::ScrollRegionReset]);
    }

    #[test]
    fn scroll_region_reset_untouched_without_status_row() {
        let mut filter = OutputFilter::new();
        let out = filter.process(b"\x1b[;r", None);
        assert_eq!(out.bytes, b"\x1b[;r");
        assert_eq!(out.events, vec![TerminalEvent::ScrollRegionReset]);
    }

    #[test]
    fn explicit_scroll_region_is_kept() {
        let mut filter = OutputFilter::new();
        let out = filter.process(b"\x1b[2;10r", Some(23));
        assert_eq!(out.bytes, b"\x1b[2;10r");
        assert!(out.events.is_empty());
    }

    #[test]
    fn detects_alt_screen() {
        let mut filter = OutputFilter::new();
        let out = filter.process(b"\x1b[?1049hvim\x1b[?1049l", Some(23));
        assert_eq!(
            out.events,
            vec![TerminalEvent::AltScreen(true), TerminalEvent::AltScreen(false)]
        );
        assert_eq!(out.bytes, b"\x1b[?1049hvim\x1b[?1049l");
    }

    #[test]
    fn detects_compound_alt_screen_modes() {
        let mut filter = OutputFilter::new();
        let out = filter.process(b"\x1b[?1006;47h", None);
        assert_eq!(out.events, vec![TerminalEvent::AltScreen(true)]);
    }

    #[test]
    fn ignores_other_private_modes() {
        let mut filter = OutputFilter::new();
        let out = filter.process(b"\x1b[?25l\x1b[?2004h", None);
        assert!(out.events.is_empty());
    }

    #[test]
    fn detects_full_reset() {
        let mut filter = OutputFilter::new();
        let out = filter.process(b"\x1bc", Some(23));
        assert_eq!(out.bytes, b"\x1bc");
        assert_eq!(out.events, vec![TerminalEvent::FullReset]);
    }

    #[test]
    fn sequence_split_across_chunks() {
        let mut filter = OutputFilter::new();
        let first = filter.process(b"x\x1b[", Some(10));
        assert_eq!(first.bytes, b"x");
        let second = filter.process(b"r", Some(10));
        assert_eq!(second.bytes, b"\x1b[1;10r");
        assert_eq!(second.events, vec![TerminalEvent::ScrollRegionReset]);
    }

    #[test]
    fn split_at_every_byte() {
        let mut filter = OutputFilter::new();
        let mut events = Vec::new();
        let mut bytes = Vec::new();
        for &b in b"\x1b[?1049h" {
            let out = filter.process(&[b], None);
            events.extend(out.events);
            bytes.extend(out.bytes);
        }
        assert_eq!(events, vec![TerminalEvent::AltScreen(true)]);
        assert_eq!(bytes, b"\x1b[?1049h");
    }

    #[test]
    fn other_escapes_pass_through() {
        let mut filter = OutputFilter::new();
        let input = b"\x1b7\x1b8\x1b]0;title\x07";
        let out = filter.process(input, Some(5));
        assert_eq!(out.bytes, input);
        assert!(out.events.is_empty());
    }
}
