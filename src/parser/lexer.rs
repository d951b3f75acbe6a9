//! Lexer (tokenizer) for C source code
//!
//! Reads characters from a [`BufferedFile`] and produces preprocessing
//! [`Token`]s. Numbers, character constants and strings keep their source
//! spelling; they are only decoded when the parser (or `#if`) needs a value.
//! Identifiers are interned, keywords are pre-interned ids below
//! [`KEYWORD_COUNT`].

use super::buffer::{BufferedFile, CH_EOF};
use super::intern::{Interner, TokId};
use std::fmt;
use std::rc::Rc;

macro_rules! keywords {
    ($($name:ident => $text:literal,)*) => {
        /// C keywords. The discriminant is the interned id.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Keyword {
            $($name,)*
        }

        pub const KEYWORD_NAMES: &[&str] = &[$($text,)*];

        impl Keyword {
            const ALL: &'static [Keyword] = &[$(Keyword::$name,)*];
        }
    };
}

keywords! {
    Int => "int",
    Void => "void",
    Char => "char",
    Short => "short",
    Long => "long",
    Signed => "signed",
    Signed2 => "__signed__",
    Signed3 => "__signed",
    Unsigned => "unsigned",
    Bool => "_Bool",
    Float => "float",
    Double => "double",
    Struct => "struct",
    Union => "union",
    Enum => "enum",
    Typedef => "typedef",
    Extern => "extern",
    Static => "static",
    Auto => "auto",
    Register => "register",
    Const => "const",
    Const2 => "__const",
    Const3 => "__const__",
    Volatile => "volatile",
    Volatile2 => "__volatile",
    Volatile3 => "__volatile__",
    Inline => "inline",
    Inline2 => "__inline",
    Inline3 => "__inline__",
    Restrict => "restrict",
    Restrict2 => "__restrict",
    Restrict3 => "__restrict__",
    If => "if",
    Else => "else",
    While => "while",
    Do => "do",
    For => "for",
    Switch => "switch",
    Case => "case",
    Default => "default",
    Break => "break",
    Continue => "continue",
    Return => "return",
    Goto => "goto",
    Sizeof => "sizeof",
    Attribute => "__attribute__",
    Attribute2 => "__attribute",
    Asm => "asm",
    Asm2 => "__asm",
    Asm3 => "__asm__",
    Extension => "__extension__",
    Typeof => "typeof",
    Typeof2 => "__typeof",
    Typeof3 => "__typeof__",
    Alignof => "_Alignof",
    Alignof2 => "__alignof__",
    Noreturn => "_Noreturn",
}

pub const KEYWORD_COUNT: u32 = KEYWORD_NAMES.len() as u32;

impl Keyword {
    pub fn from_id(id: TokId) -> Option<Keyword> {
        Keyword::ALL.get(id.0 as usize).copied()
    }

    pub fn id(self) -> TokId {
        TokId(self as u32)
    }
}

/// Punctuators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semicolon,
    Comma,
    Dot,
    Ellipsis,
    Arrow,
    PlusPlus,
    MinusMinus,
    Amp,
    Star,
    Plus,
    Minus,
    Tilde,
    Bang,
    Slash,
    Percent,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    NotEq,
    Caret,
    Pipe,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Assign,
    StarEq,
    SlashEq,
    PercentEq,
    PlusEq,
    MinusEq,
    ShlEq,
    ShrEq,
    AmpEq,
    CaretEq,
    PipeEq,
    Hash,
    HashHash,
}

impl Punct {
    pub fn as_str(self) -> &'static str {
        match self {
            Punct::LParen => "(",
            Punct::RParen => ")",
            Punct::LBracket => "[",
            Punct::RBracket => "]",
            Punct::LBrace => "{",
            Punct::RBrace => "}",
            Punct::Semicolon => ";",
            Punct::Comma => ",",
            Punct::Dot => ".",
            Punct::Ellipsis => "...",
            Punct::Arrow => "->",
            Punct::PlusPlus => "++",
            Punct::MinusMinus => "--",
            Punct::Amp => "&",
            Punct::Star => "*",
            Punct::Plus => "+",
            Punct::Minus => "-",
            Punct::Tilde => "~",
            Punct::Bang => "!",
            Punct::Slash => "/",
            Punct::Percent => "%",
            Punct::Shl => "<<",
            Punct::Shr => ">>",
            Punct::Lt => "<",
            Punct::Gt => ">",
            Punct::Le => "<=",
            Punct::Ge => ">=",
            Punct::EqEq => "==",
            Punct::NotEq => "!=",
            Punct::Caret => "^",
            Punct::Pipe => "|",
            Punct::AndAnd => "&&",
            Punct::OrOr => "||",
            Punct::Question => "?",
            Punct::Colon => ":",
            Punct::Assign => "=",
            Punct::StarEq => "*=",
            Punct::SlashEq => "/=",
            Punct::PercentEq => "%=",
            Punct::PlusEq => "+=",
            Punct::MinusEq => "-=",
            Punct::ShlEq => "<<=",
            Punct::ShrEq => ">>=",
            Punct::AmpEq => "&=",
            Punct::CaretEq => "^=",
            Punct::PipeEq => "|=",
            Punct::Hash => "#",
            Punct::HashHash => "##",
        }
    }
}

impl fmt::Display for Punct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token payload
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(TokId),
    /// Preprocessing number, as spelled
    Number(Rc<str>),
    /// Character constant including quotes and any `L` prefix, as raw
    /// source bytes
    Char(Rc<[u8]>),
    /// String literal including quotes and any `L` prefix, as raw source
    /// bytes
    Str(Rc<[u8]>),
    Punct(Punct),
    /// End of line; only produced while reading a directive
    Newline,
    /// Reference to parameter N inside a macro body
    MacroParam(u32),
    /// `#param` inside a macro body
    Stringize(u32),
    /// `##` inside a macro body
    Paste,
    /// Stands in for an empty macro argument next to `##`
    Placemarker,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    /// Preceded by whitespace
    pub space: bool,
    /// First token on its line
    pub bol: bool,
    /// Must not be macro-expanded again
    pub noexpand: bool,
}

impl Token {
    pub fn new(kind: TokenKind, line: u32) -> Self {
        Token {
            kind,
            line,
            space: false,
            bol: false,
            noexpand: false,
        }
    }

    pub fn eof(line: u32) -> Self {
        Token::new(TokenKind::Eof, line)
    }

    pub fn is_punct(&self, p: Punct) -> bool {
        self.kind == TokenKind::Punct(p)
    }

    pub fn ident(&self) -> Option<TokId> {
        match self.kind {
            TokenKind::Ident(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    /// Source spelling of the token.
    pub fn spell(&self, idents: &Interner) -> String {
        match &self.kind {
            TokenKind::Ident(id) => idents.spell(*id),
            TokenKind::Number(s) => s.to_string(),
            TokenKind::Char(s) | TokenKind::Str(s) => String::from_utf8_lossy(s).into_owned(),
            TokenKind::Punct(p) => p.as_str().to_string(),
            TokenKind::Newline => "\n".to_string(),
            TokenKind::MacroParam(n) => format!("<param {}>", n),
            TokenKind::Stringize(n) => format!("#<param {}>", n),
            TokenKind::Paste => "##".to_string(),
            TokenKind::Placemarker => String::new(),
            TokenKind::Eof => "<eof>".to_string(),
        }
    }

    /// Exact spelling; literals keep bytes that are not valid UTF-8.
    pub fn spell_bytes(&self, idents: &Interner) -> Vec<u8> {
        match &self.kind {
            TokenKind::Char(s) | TokenKind::Str(s) => s.to_vec(),
            _ => self.spell(idents).into_bytes(),
        }
    }
}

/// Lexer error type
#[derive(Debug)]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for LexError {}

fn is_ident_start(c: i32) -> bool {
    c >= 0 && (c as u8).is_ascii_alphabetic() || c == b'_' as i32 || c == b'$' as i32 || c >= 0x80
}

fn is_ident_char(c: i32) -> bool {
    is_ident_start(c) || (c >= 0 && (c as u8).is_ascii_digit())
}

fn is_digit(c: i32) -> bool {
    c >= 0 && (c as u8).is_ascii_digit()
}

/// Lexer over one buffered file
pub struct Lexer<'a> {
    file: &'a mut BufferedFile,
    idents: &'a mut Interner,
}

impl<'a> Lexer<'a> {
    pub fn new(file: &'a mut BufferedFile, idents: &'a mut Interner) -> Self {
        Lexer { file, idents }
    }

    fn peek(&mut self) -> i32 {
        self.file.peek()
    }

    fn advance(&mut self) -> i32 {
        self.file.next_char()
    }

    fn error(&self, message: impl Into<String>, line: u32) -> LexError {
        LexError {
            message: message.into(),
            line,
        }
    }

    /// Read the next token. When `newlines` is set, a line end comes back as
    /// [`TokenKind::Newline`] and is left unread instead of being skipped.
    pub fn next_token(&mut self, newlines: bool) -> Result<Token, LexError> {
        let mut space = false;
        loop {
            let c = self.peek();
            match c {
                0x20 | 0x09 | 0x0b | 0x0c | 0x0d => {
                    self.advance();
                    space = true;
                }
                0x0a => {
                    if newlines {
                        return Ok(Token::new(TokenKind::Newline, self.file.line_num));
                    }
                    self.advance();
                    self.file.bol = true;
                    space = false;
                }
                c if c == b'/' as i32 => {
                    let line = self.file.line_num;
                    self.advance();
                    if self.peek() == b'*' as i32 {
                        self.advance();
                        self.block_comment(line)?;
                        space = true;
                    } else if self.peek() == b'/' as i32 {
                        self.line_comment();
                        space = true;
                    } else {
                        let p = if self.file.eat(b'=') {
                            Punct::SlashEq
                        } else {
                            Punct::Slash
                        };
                        return Ok(self.finish(TokenKind::Punct(p), line, space));
                    }
                }
                _ => break,
            }
        }

        let line = self.file.line_num;
        let c = self.peek();
        if c == CH_EOF {
            let mut tok = Token::eof(line);
            tok.space = space;
            return Ok(tok);
        }

        let kind = if is_ident_start(c) {
            self.identifier(line)?
        } else if is_digit(c) {
            self.advance();
            self.number(c as u8)
        } else if c == b'"' as i32 {
            self.advance();
            TokenKind::Str(self.quoted(b'"', b"\"", line)?.into())
        } else if c == b'\'' as i32 {
            self.advance();
            TokenKind::Char(self.quoted(b'\'', b"'", line)?.into())
        } else {
            self.advance();
            self.punct(c as u8, line)?
        };
        Ok(self.finish(kind, line, space))
    }

    fn finish(&mut self, kind: TokenKind, line: u32, space: bool) -> Token {
        let mut tok = Token::new(kind, line);
        tok.space = space;
        tok.bol = self.file.bol;
        self.file.bol = false;
        tok
    }

    fn block_comment(&mut self, line: u32) -> Result<(), LexError> {
        loop {
            match self.advance() {
                CH_EOF => return Err(self.error("unterminated comment", line)),
                c if c == b'*' as i32 => {
                    if self.file.eat(b'/') {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    fn line_comment(&mut self) {
        while self.peek() != b'\n' as i32 && self.peek() != CH_EOF {
            self.advance();
        }
    }

    fn identifier(&mut self, line: u32) -> Result<TokenKind, LexError> {
        let mut bytes = Vec::new();
        while is_ident_char(self.peek()) {
            bytes.push(self.advance() as u8);
        }
        if bytes == b"L" {
            if self.file.eat(b'"') {
                return Ok(TokenKind::Str(self.quoted(b'"', b"L\"", line)?.into()));
            }
            if self.file.eat(b'\'') {
                return Ok(TokenKind::Char(self.quoted(b'\'', b"L'", line)?.into()));
            }
        }
        let name = String::from_utf8_lossy(&bytes);
        Ok(TokenKind::Ident(self.idents.intern(&name)))
    }

    /// Preprocessing number: digits, letters, dots, and signs after an
    /// exponent letter.
    fn number(&mut self, first: u8) -> TokenKind {
        let mut text = String::new();
        text.push(first as char);
        let mut prev = first;
        loop {
            let c = self.peek();
            let sign = (c == b'+' as i32 || c == b'-' as i32)
                && matches!(prev, b'e' | b'E' | b'p' | b'P');
            if is_ident_char(c) || c == b'.' as i32 || sign {
                prev = self.advance() as u8;
                text.push(prev as char);
            } else {
                break;
            }
        }
        TokenKind::Number(text.into())
    }

    fn quoted(&mut self, quote: u8, prefix: &[u8], line: u32) -> Result<Vec<u8>, LexError> {
        let mut bytes = prefix.to_vec();
        loop {
            let c = self.peek();
            if c == CH_EOF || c == b'\n' as i32 {
                return Err(self.error(
                    format!("missing terminating {} character", quote as char),
                    line,
                ));
            }
            self.advance();
            bytes.push(c as u8);
            if c == quote as i32 {
                break;
            }
            if c == b'\\' as i32 {
                let e = self.peek();
                if e == CH_EOF || e == b'\n' as i32 {
                    continue;
                }
                self.advance();
                bytes.push(e as u8);
            }
        }
        Ok(bytes)
    }

    fn punct(&mut self, c: u8, line: u32) -> Result<TokenKind, LexError> {
        let p = match c {
            b'(' => Punct::LParen,
            b')' => Punct::RParen,
            b'[' => Punct::LBracket,
            b']' => Punct::RBracket,
            b'{' => Punct::LBrace,
            b'}' => Punct::RBrace,
            b';' => Punct::Semicolon,
            b',' => Punct::Comma,
            b'?' => Punct::Question,
            b':' => Punct::Colon,
            b'~' => Punct::Tilde,
            b'.' => {
                if is_digit(self.peek()) {
                    return Ok(self.number(b'.'));
                }
                if self.file.eat(b'.') {
                    if self.file.eat(b'.') {
                        Punct::Ellipsis
                    } else {
                        return Err(self.error("'..' is not a valid token", line));
                    }
                } else {
                    Punct::Dot
                }
            }
            b'+' => {
                if self.file.eat(b'+') {
                    Punct::PlusPlus
                } else if self.file.eat(b'=') {
                    Punct::PlusEq
                } else {
                    Punct::Plus
                }
            }
            b'-' => {
                if self.file.eat(b'-') {
                    Punct::MinusMinus
                } else if self.file.eat(b'=') {
                    Punct::MinusEq
                } else if self.file.eat(b'>') {
                    Punct::Arrow
                } else {
                    Punct::Minus
                }
            }
            b'*' => self.with_eq(Punct::Star, Punct::StarEq),
            b'%' => self.with_eq(Punct::Percent, Punct::PercentEq),
            b'^' => self.with_eq(Punct::Caret, Punct::CaretEq),
            b'=' => self.with_eq(Punct::Assign, Punct::EqEq),
            b'!' => self.with_eq(Punct::Bang, Punct::NotEq),
            b'&' => {
                if self.file.eat(b'&') {
                    Punct::AndAnd
                } else {
                    self.with_eq(Punct::Amp, Punct::AmpEq)
                }
            }
            b'|' => {
                if self.file.eat(b'|') {
                    Punct::OrOr
                } else {
                    self.with_eq(Punct::Pipe, Punct::PipeEq)
                }
            }
            b'<' => {
                if self.file.eat(b'<') {
                    self.with_eq(Punct::Shl, Punct::ShlEq)
                } else {
                    self.with_eq(Punct::Lt, Punct::Le)
                }
            }
            b'>' => {
                if self.file.eat(b'>') {
                    self.with_eq(Punct::Shr, Punct::ShrEq)
                } else {
                    self.with_eq(Punct::Gt, Punct::Ge)
                }
            }
            b'#' => {
                if self.file.eat(b'#') {
                    Punct::HashHash
                } else {
                    Punct::Hash
                }
            }
            _ => {
                let shown = if c.is_ascii_graphic() {
                    format!("'{}'", c as char)
                } else {
                    format!("\\x{:02x}", c)
                };
                return Err(self.error(format!("unrecognized character {}", shown), line));
            }
        };
        Ok(TokenKind::Punct(p))
    }

    fn with_eq(&mut self, plain: Punct, with_eq: Punct) -> Punct {
        if self.file.eat(b'=') {
            with_eq
        } else {
            plain
        }
    }

    /// Skip spaces, tabs and comments without crossing a line end.
    pub fn skip_blanks(&mut self) {
        loop {
            let c = self.peek();
            if c == b' ' as i32 || c == b'\t' as i32 || c == b'\r' as i32 || c == 0x0b || c == 0x0c {
                self.advance();
            } else if c == b'/' as i32 {
                // only a comment opener can follow here in a directive context
                self.advance();
                if self.file.eat(b'*') {
                    let line = self.file.line_num;
                    if self.block_comment(line).is_err() {
                        return;
                    }
                } else if self.peek() == b'/' as i32 {
                    self.line_comment();
                } else {
                    return;
                }
            } else {
                return;
            }
        }
    }

    /// Skip the rest of the current line inside an excluded conditional
    /// block. Unterminated quotes are tolerated; block comments may span
    /// lines.
    pub fn skip_line(&mut self) {
        loop {
            let c = self.advance();
            if c == CH_EOF || c == b'\n' as i32 {
                self.file.bol = true;
                return;
            }
            if c == b'/' as i32 {
                if self.file.eat(b'*') {
                    let line = self.file.line_num;
                    if self.block_comment(line).is_err() {
                        return;
                    }
                } else if self.peek() == b'/' as i32 {
                    self.line_comment();
                }
            } else if c == b'"' as i32 || c == b'\'' as i32 {
                loop {
                    let q = self.peek();
                    if q == CH_EOF || q == b'\n' as i32 {
                        break;
                    }
                    self.advance();
                    if q == c {
                        break;
                    }
                    if q == b'\\' as i32 && self.peek() != b'\n' as i32 {
                        self.advance();
                    }
                }
            }
        }
    }

    /// Read the operand of `#include` when written as `<...>` or `"..."`.
    /// Returns the name and whether it used angle brackets, or None when the
    /// operand is something else (a macro).
    pub fn include_operand(&mut self) -> Result<Option<(String, bool)>, LexError> {
        self.skip_blanks();
        let line = self.file.line_num;
        let close = match self.peek() {
            c if c == b'<' as i32 => b'>',
            c if c == b'"' as i32 => b'"',
            _ => return Ok(None),
        };
        self.advance();
        let mut bytes = Vec::new();
        loop {
            let c = self.peek();
            if c == CH_EOF || c == b'\n' as i32 {
                return Err(self.error(
                    format!("missing terminating {} character", close as char),
                    line,
                ));
            }
            self.advance();
            if c == close as i32 {
                break;
            }
            bytes.push(c as u8);
        }
        Ok(Some((String::from_utf8_lossy(&bytes).into_owned(), close == b'>')))
    }

    pub fn line(&self) -> u32 {
        self.file.line_num
    }
}

/// Tokenize a whole buffer (used for token pasting and tests).
pub fn tokenize(text: &[u8], idents: &mut Interner) -> Result<Vec<Token>, LexError> {
    let mut file = BufferedFile::from_bytes("<string>", text);
    let mut lexer = Lexer::new(&mut file, idents);
    let mut tokens = Vec::new();
    loop {
        let tok = lexer.next_token(false)?;
        if tok.is_eof() {
            break;
        }
        tokens.push(tok);
    }
    Ok(tokens)
}

/// Integer constant decoded from a preprocessing number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLiteral {
    pub value: u64,
    pub unsigned: bool,
    pub long: bool,
    /// Written in decimal (affects which types it may take)
    pub decimal: bool,
}

/// Whether a preprocessing number spells a floating constant.
pub fn is_float_literal(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    if lower.starts_with("0x") {
        lower.contains('.') || lower.contains('p')
    } else {
        lower.contains('.') || lower.contains('e')
    }
}

/// Decode an integer constant with optional `u`/`l`/`ll` suffixes.
pub fn parse_int_literal(text: &str) -> Result<IntLiteral, String> {
    let lower = text.to_ascii_lowercase();
    let (digits, radix, decimal) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16, false)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2, false)
    } else if lower.starts_with('0') && lower.len() > 1 {
        (&lower[1..], 8, false)
    } else {
        (lower.as_str(), 10, true)
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let (number, suffix) = digits.split_at(end);
    let value = if number.is_empty() {
        if radix == 8 {
            0
        } else {
            return Err(format!("invalid number '{}'", text));
        }
    } else {
        u64::from_str_radix(number, radix)
            .map_err(|_| format!("integer constant '{}' is too large", text))?
    };
    let (unsigned, long) = match suffix {
        "" => (false, false),
        "u" => (true, false),
        "l" | "ll" => (false, true),
        "ul" | "lu" | "ull" | "llu" => (true, true),
        _ => return Err(format!("invalid suffix '{}' on integer constant", suffix)),
    };
    Ok(IntLiteral {
        value,
        unsigned,
        long,
        decimal,
    })
}

/// Decode the body of a character constant or string literal into code
/// units. Returns the units and whether the literal was wide (`L` prefix).
/// Narrow literals keep source bytes as they are; wide literals decode
/// UTF-8 into code points.
pub fn decode_literal(spelling: &[u8]) -> Result<(Vec<u32>, bool), String> {
    let (wide, body) = match spelling {
        [b'L', rest @ ..] => (true, rest),
        _ => (false, spelling),
    };
    if body.len() < 2 {
        return Err(format!("invalid literal {}", String::from_utf8_lossy(spelling)));
    }
    let inner = &body[1..body.len() - 1];
    let mut units = Vec::new();
    let mut i = 0;
    while i < inner.len() {
        if inner[i] != b'\\' {
            let end = inner[i..].iter().position(|&b| b == b'\\').map_or(inner.len(), |p| i + p);
            let run = &inner[i..end];
            if wide {
                units.extend(String::from_utf8_lossy(run).chars().map(|c| c as u32));
            } else {
                units.extend(run.iter().map(|&b| b as u32));
            }
            i = end;
            continue;
        }
        let Some(&e) = inner.get(i + 1) else {
            return Err("invalid escape at end of literal".to_string());
        };
        i += 2;
        let value = match e {
            b'n' => 10,
            b't' => 9,
            b'r' => 13,
            b'a' => 7,
            b'b' => 8,
            b'f' => 12,
            b'v' => 11,
            b'e' | b'E' => 27,
            b'\\' | b'\'' | b'"' | b'?' => e as u32,
            b'0'..=b'7' => {
                let mut v = (e - b'0') as u32;
                for _ in 0..2 {
                    match inner.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            v = v * 8 + (d - b'0') as u32;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                v
            }
            b'x' => {
                let mut v: u32 = 0;
                let mut any = false;
                while let Some(d) = inner.get(i).and_then(|&c| (c as char).to_digit(16)) {
                    v = v.wrapping_mul(16).wrapping_add(d);
                    i += 1;
                    any = true;
                }
                if !any {
                    return Err("\\x used with no following hex digits".to_string());
                }
                v
            }
            other => return Err(format!("unknown escape sequence: '\\{}'", other as char)),
        };
        units.push(if wide { value } else { value & 0xff });
    }
    Ok((units, wide))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> (Vec<Token>, Interner) {
        let mut idents = Interner::new();
        let tokens = tokenize(text.as_bytes(), &mut idents).unwrap();
        (tokens, idents)
    }

    #[test]
    fn test_simple_tokens() {
        let (tokens, idents) = lex("int main() { return 0; }");

        assert!(matches!(tokens[0].kind, TokenKind::Ident(id) if id == Keyword::Int.id()));
        assert!(matches!(tokens[1].kind, TokenKind::Ident(id) if idents.spell(id) == "main"));
        assert!(tokens[2].is_punct(Punct::LParen));
        assert!(tokens[3].is_punct(Punct::RParen));
        assert!(tokens[4].is_punct(Punct::LBrace));
        assert!(matches!(tokens[5].kind, TokenKind::Ident(id) if id == Keyword::Return.id()));
        assert!(matches!(tokens[6].kind, TokenKind::Number(ref s) if &**s == "0"));
        assert!(tokens[7].is_punct(Punct::Semicolon));
        assert!(tokens[8].is_punct(Punct::RBrace));
        assert_eq!(tokens.len(), 9);
    }

    #[test]
    fn test_operators() {
        let (tokens, _) = lex("++ -- += -= == != && || <<= >>= -> ... ##");
        let expected = [
            Punct::PlusPlus,
            Punct::MinusMinus,
            Punct::PlusEq,
            Punct::MinusEq,
            Punct::EqEq,
            Punct::NotEq,
            Punct::AndAnd,
            Punct::OrOr,
            Punct::ShlEq,
            Punct::ShrEq,
            Punct::Arrow,
            Punct::Ellipsis,
            Punct::HashHash,
        ];
        for (tok, p) in tokens.iter().zip(expected) {
            assert!(tok.is_punct(p), "expected {:?}, got {:?}", p, tok.kind);
        }
    }

    #[test]
    fn test_comments_and_flags() {
        let (tokens, _) = lex("a /* x\n */ b // c\n  d");
        assert_eq!(tokens.len(), 3);
        assert!(tokens[0].bol);
        assert!(tokens[1].space && !tokens[1].bol);
        assert!(tokens[2].bol);
        assert_eq!(tokens[2].line, 3);
    }

    #[test]
    fn test_literals_keep_spelling() {
        let (tokens, _) = lex(r#""hello\n" 'a' L"w" 0x1fUL 1.5e+3"#);
        assert!(matches!(tokens[0].kind, TokenKind::Str(ref s) if &**s == b"\"hello\\n\""));
        assert!(matches!(tokens[1].kind, TokenKind::Char(ref s) if &**s == b"'a'"));
        assert!(matches!(tokens[2].kind, TokenKind::Str(ref s) if &**s == b"L\"w\""));
        assert!(matches!(tokens[3].kind, TokenKind::Number(ref s) if &**s == "0x1fUL"));
        assert!(matches!(tokens[4].kind, TokenKind::Number(ref s) if &**s == "1.5e+3"));
    }

    #[test]
    fn test_unterminated_string() {
        let mut idents = Interner::new();
        let err = tokenize(b"int x;\n\"abc\n", &mut idents).unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.message, "missing terminating \" character");
    }

    #[test]
    fn test_int_literals() {
        let lit = parse_int_literal("0x1fUL").unwrap();
        assert_eq!(lit.value, 31);
        assert!(lit.unsigned && lit.long && !lit.decimal);
        assert_eq!(parse_int_literal("0755").unwrap().value, 0o755);
        assert_eq!(parse_int_literal("0").unwrap().value, 0);
        assert!(parse_int_literal("12abc").is_err());
        assert!(is_float_literal("1.5"));
        assert!(!is_float_literal("0x1e"));
    }

    #[test]
    fn test_decode_escapes() {
        let (units, wide) = decode_literal(br#""a\n\x41\101\0""#).unwrap();
        assert!(!wide);
        assert_eq!(units, vec![97, 10, 65, 65, 0]);
        let (units, wide) = decode_literal(b"L'\\377'").unwrap();
        assert!(wide);
        assert_eq!(units, vec![255]);
    }
}
