//! Main parser coordinator
//!
//! This module provides the [`Parser`] struct and the translation-unit
//! driver. The parser pulls fully expanded tokens from the [`Preprocessor`]
//! one at a time and generates code as soon as it recognizes a construct;
//! there is no syntax tree.
//!
//! # Parser Architecture
//!
//! - This module: Parser struct, token helpers, token replay, unit driver
//! - `declarations`: type specifiers, declarators, struct/enum bodies,
//!   file-scope and block-scope declarations, function bodies
//! - `initializers`: brace and string initializers for static and automatic
//!   objects
//! - `statements`: statements and jump bookkeeping
//! - `expressions`: expressions by precedence climbing
//! - [`crate::codegen`]: the value stack the other modules drive
//!
//! # Implementation
//!
//! Parser methods are split across multiple files using `impl Parser` blocks,
//! allowing each module to extend the Parser with related functionality while
//! maintaining access to the shared parser state.

use crate::codegen::{FuncState, SValue};
use crate::elf::{SectionId, Sections};
use crate::errors::{CResult, CompileError, Diagnostics, ErrorKind, Location};
use crate::parser::lexer::{Keyword, Punct, Token, TokenKind};
use crate::parser::preprocess::Preprocessor;
use crate::state::Settings;
use crate::symbols::types::CType;
use crate::symbols::{SymId, SymTable};
use log::debug;

/// Body of a `static inline` function, compiled only once referenced
#[derive(Debug)]
pub(crate) struct InlineFunc {
    pub sym: SymId,
    pub tokens: Vec<Token>,
    pub done: bool,
}

/// Cases collected while parsing a `switch` body
#[derive(Debug)]
pub(crate) struct SwitchState {
    /// `(low, high, code position)`; `low == high` for plain cases
    pub cases: Vec<(i64, i64, usize)>,
    pub default: Option<usize>,
    pub ty: CType,
}

/// Recursive descent parser fused with the code generator
pub struct Parser<'a> {
    pub(crate) pp: &'a mut Preprocessor,
    pub(crate) diag: &'a mut Diagnostics,
    pub(crate) secs: &'a mut Sections,
    pub(crate) settings: &'a Settings,
    pub(crate) syms: SymTable,
    /// Current token
    pub(crate) tok: Token,
    peeked: Option<Token>,
    recording: Option<Vec<Token>>,
    pub(crate) vstack: Vec<SValue>,
    /// Track values without emitting anything
    pub(crate) nocode: bool,
    /// Do not allocate string literals either (`sizeof`, size counting)
    pub(crate) nodata: bool,
    pub(crate) cur_text: SectionId,
    /// Lowest frame offset handed out in the current function
    pub(crate) loc: i32,
    /// Bytes pushed on the machine stack by spills and outgoing arguments
    pub(crate) stack_depth: i32,
    /// Current cast/unary nesting, bounded by `MAX_EXPR_DEPTH`
    pub(crate) expr_depth: usize,
    pub(crate) func: Option<FuncState>,
    pub(crate) break_lists: Vec<Vec<usize>>,
    pub(crate) continue_lists: Vec<Vec<usize>>,
    pub(crate) switches: Vec<SwitchState>,
    pub(crate) inline_fns: Vec<InlineFunc>,
}

impl<'a> Parser<'a> {
    pub fn new(
        pp: &'a mut Preprocessor,
        diag: &'a mut Diagnostics,
        secs: &'a mut Sections,
        settings: &'a Settings,
    ) -> Self {
        let cur_text = secs.text;
        Parser {
            pp,
            diag,
            secs,
            settings,
            syms: SymTable::new(),
            tok: Token::eof(0),
            peeked: None,
            recording: None,
            vstack: Vec::new(),
            nocode: false,
            nodata: false,
            cur_text,
            loc: 0,
            stack_depth: 0,
            expr_depth: 0,
            func: None,
            break_lists: Vec::new(),
            continue_lists: Vec::new(),
            switches: Vec::new(),
            inline_fns: Vec::new(),
        }
    }

    /// Compile every external declaration up to end of file, then the
    /// `static inline` functions that ended up referenced.
    pub fn translation_unit(&mut self) -> CResult<()> {
        debug!("parse {}", self.pp.filename());
        self.next()?;
        while !self.tok.is_eof() {
            self.external_declaration()?;
            if !self.vstack.is_empty() {
                let msg = format!("internal compiler error: vstack leak ({})", self.vstack.len());
                self.warning(&msg);
                self.vstack.clear();
            }
        }
        self.gen_inline_functions()
    }

    fn gen_inline_functions(&mut self) -> CResult<()> {
        loop {
            let pending: Vec<usize> = (0..self.inline_fns.len())
                .filter(|&i| {
                    let f = &self.inline_fns[i];
                    !f.done && self.syms.get(f.sym).flags.used
                })
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            for i in pending {
                let sym = self.inline_fns[i].sym;
                let tokens = std::mem::take(&mut self.inline_fns[i].tokens);
                self.inline_fns[i].done = true;
                debug!("inline {}", self.pp.idents.spell(self.syms.get(sym).v));
                self.rewind(tokens)?;
                self.gen_function(sym)?;
            }
        }
    }

    // ===== Diagnostics =====

    /// Include chain with the current token's line.
    pub(crate) fn location(&self) -> Vec<Location> {
        let mut chain = self.pp.context();
        if let Some(last) = chain.last_mut() {
            if self.tok.line != 0 {
                last.line = self.tok.line;
            }
        }
        chain
    }

    pub(crate) fn error(&mut self, kind: ErrorKind, msg: &str) -> CompileError {
        let chain = self.location();
        self.diag.error(&chain, kind, msg)
    }

    pub(crate) fn warning(&mut self, msg: &str) {
        let chain = self.location();
        self.diag.warning(&chain, msg);
    }

    pub(crate) fn spell_tok(&self) -> String {
        self.tok.spell(&self.pp.idents)
    }

    // ===== Token helpers =====

    fn fetch(&mut self) -> CResult<Token> {
        let tok = self.pp.next(self.diag)?;
        if let Some(buf) = self.recording.as_mut() {
            buf.push(tok.clone());
        }
        Ok(tok)
    }

    pub(crate) fn next(&mut self) -> CResult<()> {
        self.tok = match self.peeked.take() {
            Some(tok) => tok,
            None => self.fetch()?,
        };
        Ok(())
    }

    /// The token after the current one.
    pub(crate) fn peek(&mut self) -> CResult<Token> {
        if let Some(tok) = &self.peeked {
            return Ok(tok.clone());
        }
        let tok = self.fetch()?;
        self.peeked = Some(tok.clone());
        Ok(tok)
    }

    pub(crate) fn is_punct(&self, p: Punct) -> bool {
        self.tok.is_punct(p)
    }

    pub(crate) fn accept(&mut self, p: Punct) -> CResult<bool> {
        if self.tok.is_punct(p) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn expect(&mut self, p: Punct) -> CResult<()> {
        if self.accept(p)? {
            return Ok(());
        }
        let msg = format!("'{}' expected (got \"{}\")", p.as_str(), self.spell_tok());
        Err(self.error(ErrorKind::Syntax, &msg))
    }

    pub(crate) fn keyword(&self) -> Option<Keyword> {
        match self.tok.kind {
            TokenKind::Ident(id) if id.is_keyword() => Keyword::from_id(id),
            _ => None,
        }
    }

    pub(crate) fn is_kw(&self, kw: Keyword) -> bool {
        self.keyword() == Some(kw)
    }

    pub(crate) fn accept_kw(&mut self, kw: Keyword) -> CResult<bool> {
        if self.is_kw(kw) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current token as a non-keyword identifier.
    pub(crate) fn ident(&self) -> Option<crate::parser::intern::TokId> {
        self.tok.ident().filter(|id| !id.is_keyword())
    }

    pub(crate) fn expect_ident(&mut self) -> CResult<crate::parser::intern::TokId> {
        match self.ident() {
            Some(id) => {
                self.next()?;
                Ok(id)
            }
            None => {
                let msg = format!("identifier expected (got \"{}\")", self.spell_tok());
                Err(self.error(ErrorKind::Syntax, &msg))
            }
        }
    }

    // ===== Token replay =====

    /// Start saving every token from the current one on.
    pub(crate) fn start_recording(&mut self) {
        let mut buf = vec![self.tok.clone()];
        if let Some(tok) = &self.peeked {
            buf.push(tok.clone());
        }
        self.recording = Some(buf);
    }

    pub(crate) fn stop_recording(&mut self) -> Vec<Token> {
        self.recording.take().unwrap_or_default()
    }

    /// Continue parsing from `tokens`, then from wherever the input was.
    pub(crate) fn rewind(&mut self, tokens: Vec<Token>) -> CResult<()> {
        self.peeked = None;
        self.pp.push_tokens(tokens);
        self.next()
    }

    /// Collect a balanced `{ ... }` group starting at the current token.
    pub(crate) fn record_braces(&mut self) -> CResult<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut depth = 0usize;
        loop {
            if self.tok.is_eof() {
                return Err(self.error(ErrorKind::Syntax, "unexpected end of file"));
            }
            if self.is_punct(Punct::LBrace) {
                depth += 1;
            } else if self.is_punct(Punct::RBrace) {
                depth -= 1;
            }
            tokens.push(self.tok.clone());
            self.next()?;
            if depth == 0 {
                return Ok(tokens);
            }
        }
    }

    /// Run `f` with code generation switched off.
    pub(crate) fn without_code<T>(&mut self, f: impl FnOnce(&mut Self) -> CResult<T>) -> CResult<T> {
        let saved = self.nocode;
        self.nocode = true;
        let result = f(self);
        self.nocode = saved;
        result
    }

    /// Like [`Parser::without_code`], and string literals are not stored.
    pub(crate) fn without_data<T>(&mut self, f: impl FnOnce(&mut Self) -> CResult<T>) -> CResult<T> {
        let saved = self.nodata;
        self.nodata = true;
        let result = self.without_code(f);
        self.nodata = saved;
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::buffer::BufferedFile;

    /// Compile `source` into fresh sections, returning them and the
    /// collected diagnostics.
    pub(crate) fn compile(source: &str, settings: &Settings) -> (Sections, Result<(), String>) {
        let mut pp = Preprocessor::new();
        let mut diag = Diagnostics::new();
        diag.set_error_func(Box::new(|_: &str| {}));
        let mut secs = Sections::new();
        let file = BufferedFile::from_bytes("test.c", source.as_bytes());
        let result = pp
            .push_file(file, &mut diag)
            .and_then(|_| Parser::new(&mut pp, &mut diag, &mut secs, settings).translation_unit());
        (secs, result.map_err(|e| e.message))
    }

    #[test]
    fn test_parse_simple_function() {
        let (secs, result) = compile("int main() { return 0; }", &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let index = secs.find_elf_sym(secs.symtab, "main");
        assert_ne!(index, 0);
        let sym = secs.elf_sym(secs.symtab, index);
        assert_eq!(sym.st_shndx as usize, secs[secs.text].sh_num);
        assert!(sym.st_size > 0);
    }

    #[test]
    fn test_syntax_error_names_token() {
        let (_, result) = compile("int main() { return 0 }", &Settings::default());
        let msg = result.unwrap_err();
        assert!(msg.contains("test.c:1: error: ';' expected (got \"}\")"), "{}", msg);
    }

    #[test]
    fn test_unused_static_inline_is_not_emitted() {
        let source = "static inline int twice(int x) { return 2 * x; }\nint main() { return 0; }\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok());
        let names: Vec<String> = (1..secs.nb_syms(secs.symtab))
            .map(|i| secs.elf_sym_name(secs.symtab, i).to_string())
            .collect();
        assert!(!names.iter().any(|n| n == "twice"), "{:?}", names);
    }

    #[test]
    fn test_used_static_inline_is_emitted_local() {
        let source = "static inline int twice(int x) { return 2 * x; }\nint main() { return twice(3); }\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let names: Vec<String> = (1..secs.nb_syms(secs.symtab))
            .map(|i| secs.elf_sym_name(secs.symtab, i).to_string())
            .collect();
        assert!(names.iter().any(|n| n == "twice"), "{:?}", names);
        assert_eq!(secs.find_elf_sym(secs.symtab, "twice"), 0);
    }
}
