//! Reassembly of the VM's byte-at-a-time character output.
//!
//! The VM emits output one byte at a time, including the individual bytes of
//! multi-byte UTF-8 sequences. `CharAssembler` turns that stream back into
//! complete characters; `LineAssembler` turns it into complete
//! newline-terminated lines. Neither stage validates the encoding: decoding
//! is always best-effort, and neither stage ever blocks.

/// Handler invoked with each completed text unit
pub type TextHandler = Box<dyn FnMut(&str)>;

/// Accumulates single bytes into complete UTF-8 characters.
///
/// The number of continuation bytes still expected is inferred from the lead
/// byte's high bits. Lead bytes in the 0xF8/0xFC ranges (overlong sequences,
/// as the source encoder can produce them) are accepted and decoded lossily
/// rather than rejected.
pub struct CharAssembler {
    pending: usize,
    buffer: Vec<u8>,
    handler: TextHandler,
}

impl CharAssembler {
    /// Create an assembler delivering completed characters to `handler`
    pub fn new(handler: TextHandler) -> Self {
        CharAssembler {
            pending: 0,
            buffer: Vec::new(),
            handler,
        }
    }

    /// Feed one byte of output
    pub fn accept(&mut self, byte: u8) {
        if self.pending > 0 {
            self.buffer.push(byte);
            self.pending -= 1;
            if self.pending == 0 {
                let text = String::from_utf8_lossy(&self.buffer).into_owned();
                (self.handler)(&text);
                self.buffer.clear();
            }
        } else if byte & 0x80 == 0 {
            let mut scratch = [0u8; 4];
            (self.handler)((byte as char).encode_utf8(&mut scratch));
        } else {
            self.buffer.clear();
            self.buffer.push(byte);
            self.pending = if byte & 0xe0 == 0xc0 {
                1
            } else if byte & 0xf0 == 0xe0 {
                2
            } else if byte & 0xf8 == 0xf0 {
                3
            } else if byte & 0xfc == 0xf8 {
                4
            } else if byte & 0xfe == 0xfc {
                5
            } else {
                // stray continuation byte: held until the next lead byte
                0
            };
        }
    }
}

/// Accumulates bytes into complete lines.
///
/// The full accumulated run, newline included, is delivered whenever a
/// newline byte arrives. `flush` delivers any partial line immediately and
/// is meant for shutdown.
pub struct LineAssembler {
    buffer: Vec<u8>,
    handler: TextHandler,
}

impl LineAssembler {
    /// Create an assembler delivering completed lines to `handler`
    pub fn new(handler: TextHandler) -> Self {
        LineAssembler {
            buffer: Vec::new(),
            handler,
        }
    }

    /// Feed one byte of output
    pub fn accept(&mut self, byte: u8) {
        self.buffer.push(byte);
        if byte == b'\n' {
            self.flush();
        }
    }

    /// Deliver any buffered partial line
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let text = String::from_utf8_lossy(&self.buffer).into_owned();
            (self.handler)(&text);
            self.buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn collecting_chars() -> (Rc<RefCell<Vec<String>>>, CharAssembler) {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&out);
        let assembler = CharAssembler::new(Box::new(move |c| sink.borrow_mut().push(c.to_string())));
        (out, assembler)
    }

    #[test]
    fn test_ascii_passthrough() {
        let (out, mut chars) = collecting_chars();
        for b in b"ok" {
            chars.accept(*b);
        }
        assert_eq!(*out.borrow(), vec!["o".to_string(), "k".to_string()]);
    }

    #[test]
    fn test_multibyte_reassembly() {
        let (out, mut chars) = collecting_chars();
        // two-, three- and four-byte sequences, delivered byte at a time
        for b in "é世🌍".as_bytes() {
            chars.accept(*b);
        }
        assert_eq!(
            *out.borrow(),
            vec!["é".to_string(), "世".to_string(), "🌍".to_string()]
        );
    }

    #[test]
    fn test_split_delivery_matches_whole_delivery() {
        // byte-at-a-time delivery must produce the same units regardless of
        // how the source was chunked upstream
        let text = "a é 世 🌍\n";
        let (out, mut chars) = collecting_chars();
        for b in text.as_bytes() {
            chars.accept(*b);
        }
        assert_eq!(out.borrow().concat(), text);
    }

    #[test]
    fn test_malformed_sequence_is_best_effort() {
        let (out, mut chars) = collecting_chars();
        // 0xf8 lead claims four continuation bytes
        for b in [0xf8, 0x80, 0x80, 0x80, 0x80] {
            chars.accept(b);
        }
        assert_eq!(out.borrow().len(), 1);
        assert!(out.borrow()[0].contains('\u{fffd}'));
    }

    #[test]
    fn test_lines_with_embedded_newlines() {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&out);
        let mut lines = LineAssembler::new(Box::new(move |l| sink.borrow_mut().push(l.to_string())));
        for b in b"one\ntwo\nthr" {
            lines.accept(*b);
        }
        assert_eq!(*out.borrow(), vec!["one\n".to_string(), "two\n".to_string()]);

        lines.flush();
        assert_eq!(out.borrow().last().unwrap(), "thr");

        // flushing again delivers nothing
        lines.flush();
        assert_eq!(out.borrow().len(), 3);
    }
}
