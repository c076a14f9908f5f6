//! Splitting a byte stream into text lines

/// Incremental line splitter.
///
/// Accepts arbitrary chunks and yields complete lines. LF and CRLF both
/// terminate a line, invalid UTF-8 is replaced, and a line that grows past
/// `max_line_bytes` is cut at a character boundary.
#[derive(Debug)]
pub struct LineSplitter {
    pending: Vec<u8>,
    max_line_bytes: usize,
    /// A partial line was flushed early; a newline that immediately follows
    /// belongs to it and must not produce an empty line.
    after_partial: bool,
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(4),
            after_partial: false,
        }
    }

    /// Feed a chunk and collect the lines it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.pending.extend_from_slice(&rest[..pos]);
                    rest = &rest[pos + 1..];
                    // CR of a CRLF terminator is not line content
                    if self.pending.last() == Some(&b'\r') {
                        self.pending.pop();
                    }

                    let swallow = self.after_partial && self.pending.is_empty();
                    self.after_partial = false;
                    self.cut_oversized(&mut lines);
                    if swallow {
                        continue;
                    }
                    lines.push(self.take_pending());
                }
                None => {
                    self.pending.extend_from_slice(rest);
                    rest = &[];
                    if !self.pending.is_empty() && self.pending != b"\r" {
                        self.after_partial = false;
                    }
                    self.cut_oversized(&mut lines);
                }
            }
        }

        lines
    }

    /// Emit whatever partial line is buffered
    pub fn flush(&mut self) -> Option<String> {
        // A lone CR after a flushed prompt is the start of its CRLF
        if self.pending.is_empty() || (self.after_partial && self.pending == b"\r") {
            return None;
        }
        self.after_partial = true;
        Some(self.take_pending())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() && !(self.after_partial && self.pending == b"\r")
    }

    fn cut_oversized(&mut self, lines: &mut Vec<String>) {
        while self.pending.len() > self.max_line_bytes {
            // Wait for the next byte: a trailing CR may end the line
            if self.pending.len() == self.max_line_bytes + 1 && self.pending.last() == Some(&b'\r')
            {
                break;
            }
            let mut cut = self.max_line_bytes;
            // Back off to the start of a UTF-8 sequence
            while cut > 0 && (self.pending[cut] & 0xC0) == 0x80 {
                cut -= 1;
            }
            if cut == 0 {
                cut = self.max_line_bytes;
            }
            let head: Vec<u8> = self.pending.drain(..cut).collect();
            lines.push(String::from_utf8_lossy(&head).into_owned());
        }
    }

    fn take_pending(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_lf_and_crlf() {
        let mut splitter = LineSplitter::new(1024);
        let lines = splitter.push(b"one\ntwo\r\nthree");
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(splitter.flush().as_deref(), Some("three"));
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn joins_lines_across_chunks() {
        let mut splitter = LineSplitter::new(1024);
        assert!(splitter.push(b"Server st").is_empty());
        assert!(splitter.push(b"arted\r").is_empty());
        assert_eq!(splitter.push(b"\n"), vec!["Server started"]);
    }

    #[test]
    fn keeps_empty_lines() {
        let mut splitter = LineSplitter::new(1024);
        assert_eq!(splitter.push(b"a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn crlf_after_flushed_prompt_is_swallowed() {
        let mut splitter = LineSplitter::new(1024);
        assert!(splitter.push(b"Choose World: ").is_empty());
        assert_eq!(splitter.flush().as_deref(), Some("Choose World: "));
        assert_eq!(splitter.push(b"\r\nnext\r\n"), vec!["next"]);
    }

    #[test]
    fn crlf_split_across_chunks_after_prompt() {
        let mut splitter = LineSplitter::new(1024);
        splitter.push(b"> ");
        assert_eq!(splitter.flush().as_deref(), Some("> "));
        assert!(splitter.push(b"\r").is_empty());
        assert_eq!(splitter.flush(), None);
        assert_eq!(splitter.push(b"\nok\n"), vec!["ok"]);
    }

    #[test]
    fn cut_just_before_crlf_adds_no_empty_line() {
        let mut splitter = LineSplitter::new(4);
        assert_eq!(splitter.push(b"abcd\r\nef\n"), vec!["abcd", "ef"]);
    }

    #[test]
    fn newline_after_flushed_prompt_is_swallowed() {
        let mut splitter = LineSplitter::new(1024);
        assert!(splitter.push(b"Choose World: ").is_empty());
        assert_eq!(splitter.flush().as_deref(), Some("Choose World: "));
        assert_eq!(splitter.push(b"\nnext\n"), vec!["next"]);
    }

    #[test]
    fn cuts_long_lines() {
        let mut splitter = LineSplitter::new(4);
        let lines = splitter.push(b"abcdefghij\n");
        assert_eq!(lines, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn cut_respects_char_boundaries() {
        let mut splitter = LineSplitter::new(4);
        // "é" occupies bytes 3..5, so the cut backs off to byte 3
        let lines = splitter.push("aaaébb\n".as_bytes());
        assert_eq!(lines, vec!["aaa", "ébb"]);
    }

    #[test]
    fn replaces_invalid_utf8() {
        let mut splitter = LineSplitter::new(1024);
        let lines = splitter.push(b"bad \xff byte\n");
        assert_eq!(lines, vec!["bad \u{fffd} byte"]);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_lines(
            lines in prop::collection::vec("[a-zA-Z0-9 :]{0,40}", 1..20),
            cuts in prop::collection::vec(1usize..16, 0..40),
        ) {
            let mut input = Vec::new();
            for line in &lines {
                input.extend_from_slice(line.as_bytes());
                input.push(b'\n');
            }

            let mut splitter = LineSplitter::new(1024);
            let mut out = Vec::new();
            let mut rest = input.as_slice();
            for cut in cuts {
                if rest.is_empty() {
                    break;
                }
                let n = cut.min(rest.len());
                out.extend(splitter.push(&rest[..n]));
                rest = &rest[n..];
            }
            out.extend(splitter.push(rest));

            prop_assert_eq!(out, lines);
            prop_assert!(!splitter.has_pending());
        }
    }
}
