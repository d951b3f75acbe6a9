//! Preprocessor: token source for the parser
//!
//! [`Preprocessor::next`] returns fully macro-expanded tokens. Tokens come,
//! in order of priority, from:
//! - a one-token pushback slot
//! - the stack of macro expansion frames (innermost first)
//! - the include stack of [`BufferedFile`]s, where `#` at the start of a
//!   line triggers directive processing
//!
//! A macro is not re-expanded while one of its own expansion frames is still
//! on the stack; names found in that state are painted `noexpand` for good.
//! Function-like macro arguments are fully expanded before substitution,
//! except next to `#` and `##`.

use super::buffer::BufferedFile;
use super::intern::{Interner, TokId};
use super::lexer::{tokenize, Lexer, Punct, Token, TokenKind};
use crate::errors::{CResult, CompileError, Diagnostics, ErrorKind, Location};
use crate::util::DynArray;
use rustc_hash::{FxHashMap, FxHashSet};
use std::io::Write;
use std::rc::Rc;

/// Maximum nesting of `#include`
pub const INCLUDE_STACK_SIZE: usize = 32;

/// Most blank lines reproduced in preprocessor output between two tokens
const MAX_BLANK_LINES: u32 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    /// Parameter names; `None` for object-like macros
    pub params: Option<Vec<TokId>>,
    /// The last parameter collects the remaining arguments
    pub variadic: bool,
    pub body: Vec<Token>,
}

impl Macro {
    pub fn object(body: Vec<Token>) -> Self {
        Macro {
            params: None,
            variadic: false,
            body,
        }
    }

    fn same_definition(&self, other: &Macro) -> bool {
        self.params == other.params
            && self.variadic == other.variadic
            && self.body.len() == other.body.len()
            && self
                .body
                .iter()
                .zip(&other.body)
                .enumerate()
                .all(|(i, (a, b))| a.kind == b.kind && (i == 0 || a.space == b.space))
    }
}

#[derive(Debug)]
pub(crate) struct MacroFrame {
    pub(crate) tokens: Vec<Token>,
    pub(crate) pos: usize,
    /// Macro whose expansion this frame holds
    pub(crate) hide: Option<TokId>,
    /// Report end of input instead of falling through to the frame below
    pub(crate) barrier: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct IfState {
    /// Some branch of this conditional has been included
    pub(crate) taken: bool,
    pub(crate) in_else: bool,
}

/// Ids of the identifiers the preprocessor treats specially
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpecialIds {
    pub(crate) defined: TokId,
    pub(crate) va_args: TokId,
    pub(crate) line: TokId,
    pub(crate) file: TokId,
    pub(crate) date: TokId,
    pub(crate) time: TokId,
    pub(crate) counter: TokId,
}

pub struct Preprocessor {
    pub idents: Interner,
    pub(crate) files: Vec<BufferedFile>,
    pub(crate) ifdef_stack: Vec<IfState>,
    pub(crate) defines: FxHashMap<TokId, Rc<Macro>>,
    define_history: Vec<(TokId, Option<Rc<Macro>>)>,
    pub(crate) frames: Vec<MacroFrame>,
    pushback: Vec<Token>,
    pub include_paths: DynArray<String>,
    pub sysinclude_paths: DynArray<String>,
    /// Every file opened, in order
    pub deps: DynArray<String>,
    pub(crate) once_files: FxHashSet<String>,
    /// Bumped whenever the current file changes
    pub file_switches: u32,
    pub(crate) ids: SpecialIds,
    counter: u64,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    pub fn new() -> Self {
        let mut idents = Interner::new();
        let ids = SpecialIds {
            defined: idents.intern("defined"),
            va_args: idents.intern("__VA_ARGS__"),
            line: idents.intern("__LINE__"),
            file: idents.intern("__FILE__"),
            date: idents.intern("__DATE__"),
            time: idents.intern("__TIME__"),
            counter: idents.intern("__COUNTER__"),
        };
        let mut pp = Preprocessor {
            idents,
            files: Vec::new(),
            ifdef_stack: Vec::new(),
            defines: FxHashMap::default(),
            define_history: Vec::new(),
            frames: Vec::new(),
            pushback: Vec::new(),
            include_paths: DynArray::new(),
            sysinclude_paths: DynArray::new(),
            deps: DynArray::new(),
            once_files: FxHashSet::default(),
            file_switches: 0,
            ids,
            counter: 0,
        };
        // dynamic macros exist so that `defined` and `#undef` see them
        for id in [ids.line, ids.file, ids.date, ids.time, ids.counter] {
            pp.defines.insert(id, Rc::new(Macro::object(Vec::new())));
        }
        pp
    }

    /// Include chain for diagnostics, outermost file first.
    pub fn context(&self) -> Vec<Location> {
        self.files
            .iter()
            .map(|f| Location {
                filename: f.filename.clone(),
                line: f.line_num,
            })
            .collect()
    }

    /// Line number in the current file.
    pub fn line(&self) -> u32 {
        self.files.last().map_or(0, |f| f.line_num)
    }

    pub fn filename(&self) -> &str {
        self.files.last().map_or("", |f| f.filename.as_str())
    }

    pub(crate) fn error(&self, diag: &mut Diagnostics, kind: ErrorKind, msg: &str) -> CompileError {
        diag.error(&self.context(), kind, msg)
    }

    pub(crate) fn error_at(
        &self,
        diag: &mut Diagnostics,
        kind: ErrorKind,
        line: u32,
        msg: &str,
    ) -> CompileError {
        let mut chain = self.context();
        if let Some(last) = chain.last_mut() {
            last.line = line;
        }
        diag.error(&chain, kind, msg)
    }

    pub(crate) fn warning(&self, diag: &mut Diagnostics, msg: &str) {
        diag.warning(&self.context(), msg);
    }

    /// Make `file` the current input.
    pub fn push_file(&mut self, mut file: BufferedFile, diag: &mut Diagnostics) -> CResult<()> {
        if self.files.len() >= INCLUDE_STACK_SIZE {
            return Err(self.error(diag, ErrorKind::Resource, "#include recursion too deep"));
        }
        log::debug!("open {}", file.filename);
        file.ifdef_stack_depth = self.ifdef_stack.len();
        self.deps.push(file.filename.clone());
        self.files.push(file);
        self.file_switches += 1;
        Ok(())
    }

    /// Close the current input.
    pub fn pop_file(&mut self) -> Option<BufferedFile> {
        let file = self.files.pop();
        if file.is_some() {
            self.file_switches += 1;
        }
        file
    }

    /// Forget any in-flight state after a compilation.
    pub fn reset_state(&mut self) {
        self.ifdef_stack.clear();
        self.frames.clear();
        self.pushback.clear();
    }

    /// Read one raw token from the current file.
    pub(crate) fn lex(&mut self, diag: &mut Diagnostics, newlines: bool) -> CResult<Token> {
        let Some(file) = self.files.last_mut() else {
            return Ok(Token::eof(0));
        };
        let result = Lexer::new(file, &mut self.idents).next_token(newlines);
        result.map_err(|e| self.error_at(diag, ErrorKind::Lexical, e.line, &e.message))
    }

    /// Handle the end of the current file. Returns true when an including
    /// file was resumed.
    fn end_of_file(&mut self, diag: &mut Diagnostics) -> bool {
        let depth = self.files.last().map_or(0, |f| f.ifdef_stack_depth);
        if self.ifdef_stack.len() > depth {
            self.error(diag, ErrorKind::Syntax, "missing #endif");
            self.ifdef_stack.truncate(depth);
        }
        if self.files.len() > 1 {
            if let Some(file) = self.pop_file() {
                log::debug!("close {}", file.filename);
            }
            true
        } else {
            false
        }
    }

    /// Next token before macro expansion.
    pub(crate) fn next_unexpanded(&mut self, diag: &mut Diagnostics) -> CResult<Token> {
        if let Some(tok) = self.pushback.pop() {
            return Ok(tok);
        }
        loop {
            if let Some(frame) = self.frames.last_mut() {
                if frame.pos < frame.tokens.len() {
                    let tok = frame.tokens[frame.pos].clone();
                    frame.pos += 1;
                    return Ok(tok);
                }
                if frame.barrier {
                    return Ok(Token::eof(self.line()));
                }
                self.frames.pop();
                continue;
            }
            if self.files.is_empty() {
                return Ok(Token::eof(0));
            }
            let tok = self.lex(diag, false)?;
            match tok.kind {
                TokenKind::Punct(Punct::Hash) if tok.bol => {
                    self.directive(diag)?;
                }
                TokenKind::Eof => {
                    if !self.end_of_file(diag) {
                        return Ok(tok);
                    }
                }
                _ => return Ok(tok),
            }
        }
    }

    fn is_hidden(&self, id: TokId) -> bool {
        self.frames.iter().any(|f| f.hide == Some(id))
    }

    /// Next fully expanded token.
    pub fn next(&mut self, diag: &mut Diagnostics) -> CResult<Token> {
        loop {
            let mut tok = self.next_unexpanded(diag)?;
            let TokenKind::Ident(id) = tok.kind else {
                return Ok(tok);
            };
            if tok.noexpand {
                return Ok(tok);
            }
            let Some(m) = self.defines.get(&id).cloned() else {
                return Ok(tok);
            };
            if self.is_hidden(id) {
                tok.noexpand = true;
                return Ok(tok);
            }
            if let Some(dynamic) = self.dynamic_macro(id, &tok) {
                return Ok(dynamic);
            }

            let expansion = match &m.params {
                None => self.substitute(&m, &[], &tok, diag)?,
                Some(_) => {
                    let after = self.next_unexpanded(diag)?;
                    if !after.is_punct(Punct::LParen) {
                        self.pushback.push(after);
                        return Ok(tok);
                    }
                    let args = self.collect_args(id, &m, diag)?;
                    self.substitute(&m, &args, &tok, diag)?
                }
            };
            log::trace!("expand {} -> {} tokens", self.idents.spell(id), expansion.len());
            self.frames.push(MacroFrame {
                tokens: expansion,
                pos: 0,
                hide: Some(id),
                barrier: false,
            });
        }
    }

    /// Replay already expanded tokens ahead of the current input.
    pub fn push_tokens(&mut self, mut tokens: Vec<Token>) {
        for tok in tokens.iter_mut() {
            tok.noexpand = true;
        }
        // tokens read ahead by macro lookup come after the replayed ones
        while let Some(tok) = self.pushback.pop() {
            tokens.push(tok);
        }
        self.frames.push(MacroFrame {
            tokens,
            pos: 0,
            hide: None,
            barrier: false,
        });
    }

    fn dynamic_macro(&mut self, id: TokId, call: &Token) -> Option<Token> {
        let kind = if id == self.ids.line {
            TokenKind::Number(call.line.to_string().into())
        } else if id == self.ids.file {
            TokenKind::Str(quote_string(self.filename()).into_bytes().into())
        } else if id == self.ids.date || id == self.ids.time {
            let (date, time) = current_date_time();
            let text = if id == self.ids.date { date } else { time };
            TokenKind::Str(format!("\"{}\"", text).into_bytes().into())
        } else if id == self.ids.counter {
            self.counter += 1;
            TokenKind::Number((self.counter - 1).to_string().into())
        } else {
            return None;
        };
        let mut tok = Token::new(kind, call.line);
        tok.space = call.space;
        tok.bol = call.bol;
        Some(tok)
    }

    fn collect_args(
        &mut self,
        name: TokId,
        m: &Macro,
        diag: &mut Diagnostics,
    ) -> CResult<Vec<Vec<Token>>> {
        let nparams = m.params.as_ref().map_or(0, |p| p.len());
        let mut args = Vec::new();
        let mut current = Vec::new();
        let mut depth = 0usize;
        loop {
            let tok = self.next_unexpanded(diag)?;
            match tok.kind {
                TokenKind::Eof => {
                    let msg = format!(
                        "unterminated argument list invoking macro '{}'",
                        self.idents.spell(name)
                    );
                    return Err(self.error(diag, ErrorKind::Syntax, &msg));
                }
                TokenKind::Punct(Punct::LParen) => {
                    depth += 1;
                    current.push(tok);
                }
                TokenKind::Punct(Punct::RParen) => {
                    if depth == 0 {
                        args.push(current);
                        break;
                    }
                    depth -= 1;
                    current.push(tok);
                }
                TokenKind::Punct(Punct::Comma)
                    if depth == 0 && !(m.variadic && args.len() + 1 >= nparams) =>
                {
                    args.push(std::mem::take(&mut current));
                }
                _ => current.push(tok),
            }
        }
        if nparams == 0 && args.len() == 1 && args[0].is_empty() {
            args.clear();
        }
        if m.variadic && args.len() + 1 == nparams {
            args.push(Vec::new());
        }
        if args.len() != nparams {
            let which = if args.len() > nparams { "many" } else { "few" };
            let msg = format!(
                "macro '{}' used with too {} args",
                self.idents.spell(name),
                which
            );
            return Err(self.error(diag, ErrorKind::Syntax, &msg));
        }
        Ok(args)
    }

    /// Build the replacement list of one invocation.
    fn substitute(
        &mut self,
        m: &Macro,
        args: &[Vec<Token>],
        call: &Token,
        diag: &mut Diagnostics,
    ) -> CResult<Vec<Token>> {
        let body = &m.body;
        let nparams = m.params.as_ref().map_or(0, |p| p.len());
        let mut out: Vec<Token> = Vec::with_capacity(body.len());
        for (i, tok) in body.iter().enumerate() {
            match tok.kind {
                TokenKind::Stringize(n) => {
                    let text = self.stringify(&args[n as usize]);
                    let mut s = Token::new(TokenKind::Str(text.into()), call.line);
                    s.space = tok.space;
                    out.push(s);
                }
                TokenKind::MacroParam(n) => {
                    let arg = &args[n as usize];
                    let prev_paste = i > 0 && body[i - 1].kind == TokenKind::Paste;
                    let next_paste = body.get(i + 1).is_some_and(|t| t.kind == TokenKind::Paste);
                    if prev_paste || next_paste {
                        let is_va = m.variadic && n as usize + 1 == nparams;
                        if prev_paste && is_va && i >= 2 && body[i - 2].is_punct(Punct::Comma) {
                            // `, ## __VA_ARGS__`: drop the comma when there are no
                            // variadic arguments, otherwise keep both unpasted
                            out.pop();
                            if arg.is_empty() {
                                out.pop();
                            } else {
                                push_arg(&mut out, arg.clone(), tok.space);
                            }
                            continue;
                        }
                        if arg.is_empty() {
                            out.push(Token::new(TokenKind::Placemarker, call.line));
                        } else {
                            push_arg(&mut out, arg.clone(), tok.space);
                        }
                    } else {
                        let expanded = self.expand_list(arg.clone(), diag)?;
                        push_arg(&mut out, expanded, tok.space);
                    }
                }
                _ => out.push(tok.clone()),
            }
        }

        let mut result: Vec<Token> = Vec::with_capacity(out.len());
        let mut i = 0;
        while i < out.len() {
            if out[i].kind == TokenKind::Paste {
                let placemarker = Token::new(TokenKind::Placemarker, call.line);
                let lhs = result.pop().unwrap_or_else(|| placemarker.clone());
                let rhs = out.get(i + 1).cloned().unwrap_or(placemarker);
                let pasted = self.paste(lhs, rhs, diag)?;
                result.extend(pasted);
                i += 2;
            } else {
                result.push(out[i].clone());
                i += 1;
            }
        }
        result.retain(|t| t.kind != TokenKind::Placemarker);
        for tok in result.iter_mut() {
            tok.line = call.line;
            tok.bol = false;
        }
        if let Some(first) = result.first_mut() {
            first.space = call.space;
            first.bol = call.bol;
        }
        Ok(result)
    }

    fn paste(&mut self, lhs: Token, rhs: Token, diag: &mut Diagnostics) -> CResult<Vec<Token>> {
        if lhs.kind == TokenKind::Placemarker {
            return Ok(vec![rhs]);
        }
        if rhs.kind == TokenKind::Placemarker {
            return Ok(vec![lhs]);
        }
        let mut text = lhs.spell_bytes(&self.idents);
        text.extend(rhs.spell_bytes(&self.idents));
        match tokenize(&text, &mut self.idents) {
            Ok(mut tokens) if tokens.len() == 1 => {
                let mut tok = tokens.remove(0);
                tok.line = lhs.line;
                tok.space = lhs.space;
                tok.bol = false;
                Ok(vec![tok])
            }
            _ => {
                let msg = format!(
                    "pasting \"{}\" and \"{}\" does not give a valid preprocessing token",
                    lhs.spell(&self.idents),
                    rhs.spell(&self.idents)
                );
                self.error(diag, ErrorKind::Syntax, &msg);
                Ok(vec![lhs, rhs])
            }
        }
    }

    fn stringify(&self, arg: &[Token]) -> Vec<u8> {
        let mut text = vec![b'"'];
        for (i, tok) in arg.iter().enumerate() {
            if i > 0 && tok.space {
                text.push(b' ');
            }
            let spelled = tok.spell_bytes(&self.idents);
            match tok.kind {
                TokenKind::Str(_) | TokenKind::Char(_) => {
                    for c in spelled {
                        if c == b'"' || c == b'\\' {
                            text.push(b'\\');
                        }
                        text.push(c);
                    }
                }
                _ => text.extend(spelled),
            }
        }
        text.push(b'"');
        text
    }

    /// Fully expand a token list in isolation from the surrounding input.
    pub(crate) fn expand_list(
        &mut self,
        tokens: Vec<Token>,
        diag: &mut Diagnostics,
    ) -> CResult<Vec<Token>> {
        let saved_pushback = std::mem::take(&mut self.pushback);
        let base = self.frames.len();
        self.frames.push(MacroFrame {
            tokens,
            pos: 0,
            hide: None,
            barrier: true,
        });
        let mut out = Vec::new();
        let result = loop {
            match self.next(diag) {
                Ok(tok) if tok.is_eof() => break Ok(()),
                Ok(tok) => out.push(tok),
                Err(e) => break Err(e),
            }
        };
        self.frames.truncate(base);
        self.pushback = saved_pushback;
        result.map(|_| out)
    }

    /// Install a macro, warning when it changes an existing definition.
    pub fn define(&mut self, id: TokId, m: Macro, diag: &mut Diagnostics) {
        let old = self.defines.get(&id).cloned();
        if let Some(prev) = &old {
            if !prev.same_definition(&m) {
                let msg = format!("{} redefined", self.idents.spell(id));
                self.warning(diag, &msg);
            }
        }
        self.define_history.push((id, old));
        self.defines.insert(id, Rc::new(m));
    }

    pub fn undefine(&mut self, id: TokId) {
        if let Some(old) = self.defines.remove(&id) {
            self.define_history.push((id, Some(old)));
        }
    }

    pub fn is_defined(&self, id: TokId) -> bool {
        self.defines.contains_key(&id)
    }

    pub fn lookup_macro(&self, name: &str) -> Option<&Macro> {
        let id = self.idents.lookup(name)?;
        self.defines.get(&id).map(|m| &**m)
    }

    /// Mark for [`Preprocessor::release_defines`].
    pub fn define_mark(&self) -> usize {
        self.define_history.len()
    }

    /// Undo every `#define` and `#undef` made since `mark`.
    pub fn release_defines(&mut self, mark: usize) {
        while self.define_history.len() > mark {
            let Some((id, prev)) = self.define_history.pop() else {
                break;
            };
            match prev {
                Some(m) => {
                    self.defines.insert(id, m);
                }
                None => {
                    self.defines.remove(&id);
                }
            }
        }
    }

    /// Define `name` (which may carry a parameter list) as `value`, or as
    /// `1` when no value is given.
    pub fn define_symbol(
        &mut self,
        name: &str,
        value: Option<&str>,
        diag: &mut Diagnostics,
    ) -> CResult<()> {
        let text = format!("{} {}\n", name, value.unwrap_or("1"));
        self.files
            .push(BufferedFile::from_bytes("<define>", text.as_bytes()));
        let result = self.parse_define(diag);
        self.files.pop();
        result
    }

    pub fn undefine_symbol(&mut self, name: &str) {
        let id = self.idents.intern(name);
        self.undefine(id);
    }

    /// Write the expanded token stream of the current input to `out`.
    /// Adjacent tokens that would lex differently when glued together are
    /// separated by a space, so the output preprocesses to itself.
    pub fn preprocess(&mut self, diag: &mut Diagnostics, out: &mut dyn Write) -> CResult<()> {
        let mut started = false;
        let mut last_line = 0;
        let mut last_switch = self.file_switches;
        let mut prev: Vec<u8> = Vec::new();
        let io_error =
            |pp: &Preprocessor, diag: &mut Diagnostics, e: std::io::Error| -> CompileError {
                pp.error(diag, ErrorKind::Resource, &format!("could not write output: {}", e))
            };
        loop {
            let tok = self.next(diag)?;
            if tok.is_eof() {
                break;
            }
            let text = tok.spell_bytes(&self.idents);
            let mut sep: Vec<u8> = Vec::new();
            if started {
                if self.file_switches != last_switch {
                    sep.push(b'\n');
                } else if tok.line > last_line {
                    let n = (tok.line - last_line).min(MAX_BLANK_LINES);
                    sep.resize(n as usize, b'\n');
                } else if tok.space || would_glue(&prev, &text) {
                    sep.push(b' ');
                }
            }
            if let Err(e) = out.write_all(&sep).and_then(|_| out.write_all(&text)) {
                return Err(io_error(self, diag, e));
            }
            started = true;
            last_line = tok.line;
            last_switch = self.file_switches;
            prev = text;
        }
        let finished = if started { writeln!(out) } else { Ok(()) };
        if let Err(e) = finished.and_then(|_| out.flush()) {
            return Err(io_error(self, diag, e));
        }
        Ok(())
    }
}

/// Multi-character punctuators and comment openers, by their first two
/// characters
const GLUING_PAIRS: &[&[u8; 2]] = &[
    b"++", b"--", b"+=", b"-=", b"->", b"*=", b"/=", b"%=", b"&=", b"|=", b"^=", b"<<", b">>",
    b"<=", b">=", b"==", b"!=", b"&&", b"||", b"##", b"//", b"/*", b"..",
];

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c >= 0x80
}

/// Whether writing `next` right after `prev` would re-lex as different
/// tokens.
fn would_glue(prev: &[u8], next: &[u8]) -> bool {
    let (Some(&last), Some(&first)) = (prev.last(), next.first()) else {
        return false;
    };
    let prev_is_number = prev[0].is_ascii_digit() || (prev[0] == b'.' && prev.len() > 1);
    if is_word_byte(last) && (is_word_byte(first) || first == b'"' || first == b'\'') {
        return true;
    }
    if prev_is_number && (first == b'.' || is_word_byte(first)) {
        return true;
    }
    if prev_is_number && matches!(last, b'e' | b'E' | b'p' | b'P') && matches!(first, b'+' | b'-') {
        return true;
    }
    if last == b'.' && first.is_ascii_digit() {
        return true;
    }
    GLUING_PAIRS.iter().any(|pair| pair[0] == last && pair[1] == first)
}

fn push_arg(out: &mut Vec<Token>, arg: Vec<Token>, space: bool) {
    for (i, mut tok) in arg.into_iter().enumerate() {
        if i == 0 {
            tok.space = space;
        }
        out.push(tok);
    }
}

/// Quote `text` as a C string literal.
pub(crate) fn quote_string(text: &str) -> String {
    let mut s = String::from("\"");
    for c in text.chars() {
        if c == '"' || c == '\\' {
            s.push('\\');
        }
        s.push(c);
    }
    s.push('"');
    s
}

/// `__DATE__` and `__TIME__` strings for the current UTC time.
fn current_date_time() -> (String, String) {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;

    // days since 1970-01-01 to a civil date
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };

    let date = format!("{} {:2} {}", MONTHS[(month - 1) as usize], day, year);
    let time = format!(
        "{:02}:{:02}:{:02}",
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    );
    (date, time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> String {
        let mut pp = Preprocessor::new();
        let mut diag = Diagnostics::new();
        pp.push_file(BufferedFile::from_bytes("t.c", src.as_bytes()), &mut diag)
            .unwrap();
        let mut out = Vec::new();
        pp.preprocess(&mut diag, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_object_macro() {
        assert_eq!(run("#define FOO 1\nFOO\n"), "1\n");
    }

    #[test]
    fn test_function_macro_and_stringize() {
        let src = "#define SQ(x) ((x)*(x))\n#define STR(x) #x\nSQ(a+1) STR(a  \"b\")\n";
        assert_eq!(run(src), "((a+1)*(a+1)) \"a \\\"b\\\"\"\n");
    }

    #[test]
    fn test_token_paste_and_varargs() {
        let src = "#define CAT(a,b) a##b\n#define F(fmt, ...) f(fmt,##__VA_ARGS__)\nCAT(x,1) F(1) F(1,2)\n";
        assert_eq!(run(src), "x1 f(1) f(1,2)\n");
    }

    #[test]
    fn test_recursive_macro_is_not_reexpanded() {
        assert_eq!(run("#define foo foo + 1\nfoo\n"), "foo + 1\n");
        assert_eq!(run("#define a b\n#define b a\na\n"), "a\n");
    }

    #[test]
    fn test_function_macro_without_parens() {
        assert_eq!(run("#define f(x) x\nf + f(2)\n"), "f + 2\n");
    }

    #[test]
    fn test_conditionals() {
        let src = "#if 1 + 1 == 2\nyes\n#else\nno\n#endif\n#ifdef NOPE\nbad\n#elif defined(__LINE__)\nline\n#endif\n";
        assert_eq!(run(src), format!("yes{}line\n", "\n".repeat(7)));
    }

    #[test]
    fn test_skipped_block_tolerates_stray_quotes() {
        let src = "#if 0\nit's fine\n#if 1\nnested\n#endif\n#endif\nok\n";
        assert_eq!(run(src), "ok\n");
    }

    #[test]
    fn test_blank_lines_are_capped() {
        let src = format!("a{}b\n", "\n".repeat(20));
        assert_eq!(run(&src), format!("a{}b\n", "\n".repeat(8)));
    }

    #[test]
    fn test_release_defines_restores_previous_state() {
        let mut pp = Preprocessor::new();
        let mut diag = Diagnostics::new();
        pp.define_symbol("KEEP", Some("1"), &mut diag).unwrap();
        let mark = pp.define_mark();
        pp.define_symbol("TEMP", None, &mut diag).unwrap();
        pp.undefine_symbol("KEEP");
        assert!(pp.lookup_macro("KEEP").is_none());
        pp.release_defines(mark);
        assert!(pp.lookup_macro("KEEP").is_some());
        assert!(pp.lookup_macro("TEMP").is_none());
    }

    #[test]
    fn test_line_macro() {
        assert_eq!(run("\n__LINE__\n"), "2\n");
    }

    #[test]
    fn test_adjacent_tokens_do_not_glue() {
        assert_eq!(run("#define N -1\nint x = -N;\n"), "int x = - -1;\n");
        assert_eq!(run("#define F(a) a\nF(x)F(y)\n"), "x y\n");
        assert_eq!(run("#define E\nx/E/y\n"), "x/ /y\n");
        assert_eq!(run("#define P +\na P+ b\n"), "a + + b\n");
        assert_eq!(run("#define ONE 1\nONE.5\n"), "1 .5\n");
    }

    #[test]
    fn test_output_preprocesses_to_itself() {
        let src = "#define N -1\n#define E\n#define F(a) a\n#define S(x) #x\n\
                   int x = -N; a F(x)F(y) b/E/c +F(+)d S(\"q\\n\")\n";
        let once = run(src);
        assert_eq!(run(&once), once);
    }

    #[test]
    fn test_non_utf8_bytes_pass_through() {
        let mut pp = Preprocessor::new();
        let mut diag = Diagnostics::new();
        let src = b"char *s = \"\xc3\x28\";\n";
        pp.push_file(BufferedFile::from_bytes("t.c", src), &mut diag).unwrap();
        let mut out = Vec::new();
        pp.preprocess(&mut diag, &mut out).unwrap();
        assert_eq!(out, src.to_vec());
    }

    #[test]
    fn test_write_failure_is_reported() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Err(std::io::Error::other("disk full"))
            }
        }
        let mut pp = Preprocessor::new();
        let mut diag = Diagnostics::new();
        pp.push_file(BufferedFile::from_bytes("t.c", b"a\n"), &mut diag).unwrap();
        let err = pp.preprocess(&mut diag, &mut Broken).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resource);
    }
}
