//! Buffered source input
//!
//! A [`BufferedFile`] reads its source through a fixed-size window. The byte
//! just past the valid data is always the end-of-buffer sentinel
//! [`CH_EOB`]; the window is only refilled when the reader actually lands on
//! a sentinel that sits at the window end, so a real backslash in the source
//! costs a single comparison.
//!
//! Backslash-newline pairs are spliced out here, before the lexer sees them.

use std::io::Read;

/// Size of the read window
pub const IO_BUF_SIZE: usize = 8192;

/// End-of-buffer sentinel. Chosen to be a byte that is rare in C source.
pub const CH_EOB: u8 = b'\\';

/// End-of-file marker returned by [`BufferedFile::peek`]
pub const CH_EOF: i32 = -1;

pub struct BufferedFile {
    pub filename: String,
    pub line_num: u32,
    /// Depth of the conditional stack when this file was opened
    pub ifdef_stack_depth: usize,
    /// Nothing but whitespace read since the last newline
    pub bol: bool,
    buffer: Vec<u8>,
    buf_ptr: usize,
    buf_end: usize,
    source: Option<Box<dyn Read>>,
    peeked: Option<i32>,
}

impl BufferedFile {
    /// Open a reader-backed file with an empty window.
    pub fn from_reader(filename: &str, source: Box<dyn Read>) -> Self {
        let mut buffer = vec![0u8; IO_BUF_SIZE + 1];
        buffer[0] = CH_EOB;
        BufferedFile {
            filename: filename.to_string(),
            line_num: 1,
            ifdef_stack_depth: 0,
            bol: true,
            buffer,
            buf_ptr: 0,
            buf_end: 0,
            source: Some(source),
            peeked: None,
        }
    }

    /// Wrap an in-memory source. The whole text is one window.
    pub fn from_bytes(filename: &str, text: &[u8]) -> Self {
        let mut buffer = Vec::with_capacity(text.len() + 1);
        buffer.extend_from_slice(text);
        buffer.push(CH_EOB);
        BufferedFile {
            filename: filename.to_string(),
            line_num: 1,
            ifdef_stack_depth: 0,
            bol: true,
            buf_end: text.len(),
            buffer,
            buf_ptr: 0,
            source: None,
            peeked: None,
        }
    }

    /// Refill the window from the reader. Returns false at end of input.
    fn fill(&mut self) -> bool {
        let Some(source) = self.source.as_mut() else {
            return false;
        };
        let mut len = 0;
        while len < IO_BUF_SIZE {
            match source.read(&mut self.buffer[len..IO_BUF_SIZE]) {
                Ok(0) => break,
                Ok(n) => len += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.buf_ptr = 0;
        self.buf_end = len;
        self.buffer[len] = CH_EOB;
        len > 0
    }

    /// Next raw byte, before line splicing.
    fn raw_peek(&mut self) -> i32 {
        let c = self.buffer[self.buf_ptr];
        if c == CH_EOB && self.buf_ptr >= self.buf_end {
            if !self.fill() {
                return CH_EOF;
            }
            return self.buffer[self.buf_ptr] as i32;
        }
        c as i32
    }

    fn raw_next(&mut self) -> i32 {
        let c = self.raw_peek();
        if c != CH_EOF {
            self.buf_ptr += 1;
        }
        c
    }

    /// Read one logical character with backslash-newline removed.
    fn read_char(&mut self) -> i32 {
        loop {
            let c = self.raw_next();
            if c != b'\\' as i32 {
                return c;
            }
            match self.raw_peek() {
                n if n == b'\n' as i32 => {
                    self.raw_next();
                    self.line_num += 1;
                }
                n if n == b'\r' as i32 => {
                    self.raw_next();
                    if self.raw_peek() == b'\n' as i32 {
                        self.raw_next();
                    }
                    self.line_num += 1;
                }
                _ => return c,
            }
        }
    }

    /// Current character without consuming it.
    pub fn peek(&mut self) -> i32 {
        match self.peeked {
            Some(c) => c,
            None => {
                let c = self.read_char();
                self.peeked = Some(c);
                c
            }
        }
    }

    /// Consume and return the current character. Newlines bump the line
    /// counter.
    pub fn next_char(&mut self) -> i32 {
        let c = self.peek();
        self.peeked = None;
        if c == b'\n' as i32 {
            self.line_num += 1;
        }
        c
    }

    /// Consume the current character when it equals `expected`.
    pub fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == expected as i32 {
            self.next_char();
            true
        } else {
            false
        }
    }

    pub fn at_eof(&mut self) -> bool {
        self.peek() == CH_EOF
    }
}

impl std::fmt::Debug for BufferedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedFile")
            .field("filename", &self.filename)
            .field("line_num", &self.line_num)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(file: &mut BufferedFile) -> String {
        let mut out = String::new();
        loop {
            let c = file.next_char();
            if c == CH_EOF {
                return out;
            }
            out.push(c as u8 as char);
        }
    }

    #[test]
    fn test_backslash_newline_is_spliced() {
        let mut file = BufferedFile::from_bytes("t.c", b"ab\\\ncd\\x\n");
        assert_eq!(drain(&mut file), "abcd\\x\n");
        assert_eq!(file.line_num, 3);
    }

    #[test]
    fn test_refill_across_window_boundary() {
        let mut text = vec![b'a'; IO_BUF_SIZE - 1];
        text.extend_from_slice(b"\\\nz\\");
        let len = text.len();
        let mut file = BufferedFile::from_reader("big.c", Box::new(std::io::Cursor::new(text)));
        let out = drain(&mut file);
        assert_eq!(out.len(), len - 2);
        assert!(out.ends_with("az\\"));
    }

    #[test]
    fn test_eat_and_eof() {
        let mut file = BufferedFile::from_bytes("t.c", b"x");
        assert!(!file.eat(b'y'));
        assert!(file.eat(b'x'));
        assert!(file.at_eof());
        assert_eq!(file.next_char(), CH_EOF);
    }
}
