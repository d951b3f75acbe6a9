//! Preprocessing directives
//!
//! Directive lines are read raw, with line ends visible. Excluded
//! conditional blocks are skipped line by line without tokenizing them, so
//! they may contain text that would not lex.

use super::buffer::BufferedFile;
use super::lexer::{decode_literal, Lexer, Punct, Token, TokenKind};
use super::preprocess::{IfState, Macro, Preprocessor};
use crate::errors::{CResult, Diagnostics, ErrorKind};
use crate::util::parent_dir;
use std::path::Path;

impl Preprocessor {
    /// Handle the directive following a `#` at the start of a line.
    pub(crate) fn directive(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        let tok = self.lex(diag, true)?;
        let name = match tok.kind.clone() {
            TokenKind::Newline | TokenKind::Eof => return Ok(()),
            TokenKind::Ident(id) => self.idents.spell(id),
            // `# 12 "file.c"` line markers
            TokenKind::Number(_) => {
                let mut tokens = vec![tok];
                tokens.extend(self.read_line(diag)?);
                return self.do_line(tokens, diag);
            }
            _ => {
                let spelled = tok.spell(&self.idents);
                let msg = format!("invalid preprocessing directive #{}", spelled);
                self.error(diag, ErrorKind::Syntax, &msg);
                self.skip_rest_of_line(diag)?;
                return Ok(());
            }
        };
        match name.as_str() {
            "define" => self.parse_define(diag),
            "undef" => {
                let tokens = self.read_line(diag)?;
                match tokens.first().and_then(Token::ident) {
                    Some(id) => {
                        self.undefine(id);
                        Ok(())
                    }
                    None => Err(self.error(diag, ErrorKind::Syntax, "macro name required")),
                }
            }
            "include" => self.do_include(diag),
            "if" => {
                let value = self.eval_condition(diag)?;
                self.push_if(value, diag)
            }
            "ifdef" | "ifndef" => {
                let tokens = self.read_line(diag)?;
                let Some(id) = tokens.first().and_then(Token::ident) else {
                    let msg = format!("#{} needs an identifier", name);
                    return Err(self.error(diag, ErrorKind::Syntax, &msg));
                };
                let defined = self.is_defined(id);
                self.push_if(defined == (name == "ifdef"), diag)
            }
            "elif" => self.do_elif(diag),
            "else" => {
                self.read_line(diag)?;
                self.do_else(diag)
            }
            "endif" => {
                self.read_line(diag)?;
                self.do_endif(diag);
                Ok(())
            }
            "line" => {
                let tokens = self.read_line(diag)?;
                let tokens = self.expand_list(tokens, diag)?;
                self.do_line(tokens, diag)
            }
            "error" => {
                let text = self.line_text(diag)?;
                Err(self.error(diag, ErrorKind::Syntax, &format!("#error {}", text)))
            }
            "warning" => {
                let text = self.line_text(diag)?;
                self.warning(diag, &format!("#warning {}", text));
                Ok(())
            }
            "pragma" => self.do_pragma(diag),
            "ident" | "sccs" => self.skip_rest_of_line(diag),
            _ => {
                let msg = format!("invalid preprocessing directive #{}", name);
                self.error(diag, ErrorKind::Syntax, &msg);
                self.skip_rest_of_line(diag)
            }
        }
    }

    /// Tokens up to the end of the directive line. The newline is left for
    /// the normal token stream.
    pub(crate) fn read_line(&mut self, diag: &mut Diagnostics) -> CResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.lex(diag, true)?;
            match tok.kind {
                TokenKind::Newline | TokenKind::Eof => return Ok(tokens),
                _ => tokens.push(tok),
            }
        }
    }

    fn skip_rest_of_line(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        self.read_line(diag).map(|_| ())
    }

    /// Rest of the line as text, for `#error` and `#warning`.
    fn line_text(&mut self, diag: &mut Diagnostics) -> CResult<String> {
        let tokens = self.read_line(diag)?;
        let mut text = String::new();
        for (i, tok) in tokens.iter().enumerate() {
            if i > 0 && tok.space {
                text.push(' ');
            }
            text.push_str(&tok.spell(&self.idents));
        }
        Ok(text)
    }

    /// Parse `#define` from the current file.
    pub(crate) fn parse_define(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        let name_tok = self.lex(diag, true)?;
        let Some(name) = name_tok.ident() else {
            return Err(self.error(diag, ErrorKind::Syntax, "macro name required"));
        };
        if name == self.ids.defined {
            return Err(self.error(diag, ErrorKind::Syntax, "'defined' cannot be used as a macro name"));
        }

        let mut tok = self.lex(diag, true)?;
        let mut params = None;
        let mut variadic = false;
        if tok.is_punct(Punct::LParen) && !tok.space {
            let mut names = Vec::new();
            loop {
                tok = self.lex(diag, true)?;
                if tok.is_punct(Punct::RParen) && names.is_empty() {
                    break;
                }
                if tok.is_punct(Punct::Ellipsis) {
                    names.push(self.ids.va_args);
                    variadic = true;
                    tok = self.lex(diag, true)?;
                } else if let Some(param) = tok.ident() {
                    names.push(param);
                    tok = self.lex(diag, true)?;
                    if tok.is_punct(Punct::Ellipsis) {
                        variadic = true;
                        tok = self.lex(diag, true)?;
                    }
                } else {
                    return Err(self.error(diag, ErrorKind::Syntax, "bad macro parameter list"));
                }
                if tok.is_punct(Punct::RParen) {
                    break;
                }
                if variadic || !tok.is_punct(Punct::Comma) {
                    return Err(self.error(diag, ErrorKind::Syntax, "bad macro parameter list"));
                }
            }
            params = Some(names);
            tok = self.lex(diag, true)?;
        }

        let mut body: Vec<Token> = Vec::new();
        while !matches!(tok.kind, TokenKind::Newline | TokenKind::Eof) {
            let param_index = |t: &Token| {
                let id = t.ident()?;
                params
                    .as_ref()?
                    .iter()
                    .position(|&p| p == id)
                    .map(|i| i as u32)
            };
            let mut out = tok.clone();
            out.bol = false;
            if let Some(i) = param_index(&tok) {
                out.kind = TokenKind::MacroParam(i);
            } else if tok.is_punct(Punct::Hash) && params.is_some() {
                let next = self.lex(diag, true)?;
                match param_index(&next) {
                    Some(i) => out.kind = TokenKind::Stringize(i),
                    None => {
                        return Err(self.error(
                            diag,
                            ErrorKind::Syntax,
                            "'#' is not followed by a macro parameter",
                        ))
                    }
                }
            } else if tok.is_punct(Punct::HashHash) {
                out.kind = TokenKind::Paste;
            }
            body.push(out);
            tok = self.lex(diag, true)?;
        }
        if body.first().is_some_and(|t| t.kind == TokenKind::Paste)
            || body.last().is_some_and(|t| t.kind == TokenKind::Paste)
        {
            return Err(self.error(
                diag,
                ErrorKind::Syntax,
                "'##' cannot appear at either end of macro expansion",
            ));
        }
        if let Some(first) = body.first_mut() {
            first.space = false;
        }
        log::trace!("#define {}", self.idents.spell(name));
        self.define(
            name,
            Macro {
                params,
                variadic,
                body,
            },
            diag,
        );
        Ok(())
    }

    fn do_include(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        let operand = {
            let Some(file) = self.files.last_mut() else {
                return Ok(());
            };
            let result = Lexer::new(file, &mut self.idents).include_operand();
            result.map_err(|e| self.error_at(diag, ErrorKind::Lexical, e.line, &e.message))?
        };
        let (name, angle) = match operand {
            Some(found) => {
                let rest = self.read_line(diag)?;
                if !rest.is_empty() {
                    self.warning(diag, "extra tokens after #include");
                }
                found
            }
            None => {
                let tokens = self.read_line(diag)?;
                let tokens = self.expand_list(tokens, diag)?;
                self.include_name_from_tokens(&tokens)
                    .ok_or_else(|| self.error(diag, ErrorKind::Syntax, "#include expects \"FILENAME\" or <FILENAME>"))?
            }
        };

        let mut candidates = Vec::new();
        if Path::new(&name).is_absolute() {
            candidates.push(name.clone());
        } else {
            if !angle {
                let dir = parent_dir(self.filename());
                candidates.push(join_path(&dir, &name));
            }
            for dir in self.include_paths.iter().chain(self.sysinclude_paths.iter()) {
                candidates.push(join_path(dir, &name));
            }
        }

        for path in candidates {
            if self.once_files.contains(&path) {
                log::debug!("#pragma once skips {}", path);
                return Ok(());
            }
            let Ok(handle) = std::fs::File::open(&path) else {
                continue;
            };
            if !Path::new(&path).is_file() {
                continue;
            }
            let file = BufferedFile::from_reader(&path, Box::new(handle));
            return self.push_file(file, diag);
        }
        let msg = format!("include file '{}' not found", name);
        Err(self.error(diag, ErrorKind::Resource, &msg))
    }

    fn include_name_from_tokens(&self, tokens: &[Token]) -> Option<(String, bool)> {
        let first = tokens.first()?;
        match &first.kind {
            TokenKind::Str(s) if tokens.len() == 1 => {
                let inner = s.strip_prefix(b"\"")?.strip_suffix(b"\"")?;
                Some((String::from_utf8_lossy(inner).into_owned(), false))
            }
            TokenKind::Punct(Punct::Lt) => {
                let close = tokens.iter().position(|t| t.is_punct(Punct::Gt))?;
                let mut name = String::new();
                for (i, tok) in tokens[1..close].iter().enumerate() {
                    if i > 0 && tok.space {
                        name.push(' ');
                    }
                    name.push_str(&tok.spell(&self.idents));
                }
                Some((name, true))
            }
            _ => None,
        }
    }

    fn do_line(&mut self, tokens: Vec<Token>, diag: &mut Diagnostics) -> CResult<()> {
        let number = match tokens.first().map(|t| &t.kind) {
            Some(TokenKind::Number(n)) => n.parse::<u32>().ok(),
            _ => None,
        };
        let Some(number) = number else {
            return Err(self.error(diag, ErrorKind::Syntax, "#line expects a line number"));
        };
        let filename = match tokens.get(1).map(|t| &t.kind) {
            Some(TokenKind::Str(s)) => {
                let (units, _) = decode_literal(s)
                    .map_err(|msg| self.error(diag, ErrorKind::Lexical, &msg))?;
                let bytes: Vec<u8> = units.iter().map(|&u| u as u8).collect();
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            None => None,
            Some(_) => return Err(self.error(diag, ErrorKind::Syntax, "invalid filename for #line")),
        };
        if let Some(file) = self.files.last_mut() {
            // the pending newline bumps this to `number`
            file.line_num = number.saturating_sub(1);
            if let Some(name) = filename {
                file.filename = name;
            }
        }
        Ok(())
    }

    fn do_pragma(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        let tokens = self.read_line(diag)?;
        let first = tokens.first().map(|t| t.spell(&self.idents));
        if first.as_deref() == Some("once") {
            let name = self.filename().to_string();
            self.once_files.insert(name);
        } else if diag.warnings.unsupported {
            let text = first.unwrap_or_default();
            self.warning(diag, &format!("#pragma {} is ignored", text));
        }
        Ok(())
    }

    fn push_if(&mut self, value: bool, diag: &mut Diagnostics) -> CResult<()> {
        self.ifdef_stack.push(IfState {
            taken: value,
            in_else: false,
        });
        if value {
            Ok(())
        } else {
            self.skip_block(diag)
        }
    }

    fn do_elif(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        let file_depth = self.files.last().map_or(0, |f| f.ifdef_stack_depth);
        let Some(top) = self.ifdef_stack.last().copied().filter(|_| self.ifdef_stack.len() > file_depth) else {
            return Err(self.error(diag, ErrorKind::Syntax, "#elif without matching #if"));
        };
        if top.in_else {
            return Err(self.error(diag, ErrorKind::Syntax, "#elif after #else"));
        }
        if top.taken {
            self.skip_rest_of_line(diag)?;
            return self.skip_block(diag);
        }
        let value = self.eval_condition(diag)?;
        if value {
            if let Some(state) = self.ifdef_stack.last_mut() {
                state.taken = true;
            }
            Ok(())
        } else {
            self.skip_block(diag)
        }
    }

    fn do_else(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        let file_depth = self.files.last().map_or(0, |f| f.ifdef_stack_depth);
        if self.ifdef_stack.len() <= file_depth {
            self.error(diag, ErrorKind::Syntax, "#else without matching #if");
            return Ok(());
        }
        let Some(state) = self.ifdef_stack.last_mut() else {
            return Ok(());
        };
        if state.in_else {
            self.error(diag, ErrorKind::Syntax, "#else after #else");
            return Ok(());
        }
        state.in_else = true;
        if state.taken {
            self.skip_block(diag)
        } else {
            state.taken = true;
            Ok(())
        }
    }

    fn do_endif(&mut self, diag: &mut Diagnostics) {
        let file_depth = self.files.last().map_or(0, |f| f.ifdef_stack_depth);
        if self.ifdef_stack.len() <= file_depth {
            self.error(diag, ErrorKind::Syntax, "#endif without matching #if");
            return;
        }
        self.ifdef_stack.pop();
    }

    /// Skip an excluded group up to the `#elif`, `#else` or `#endif` that
    /// closes it, then let that directive decide what follows.
    fn skip_block(&mut self, diag: &mut Diagnostics) -> CResult<()> {
        let mut depth = 0usize;
        loop {
            let Some(file) = self.files.last_mut() else {
                return Ok(());
            };
            let mut lexer = Lexer::new(file, &mut self.idents);
            lexer.skip_blanks();
            if file.at_eof() {
                // reported as a missing #endif by the end-of-file handling
                return Ok(());
            }
            if !file.eat(b'#') {
                Lexer::new(file, &mut self.idents).skip_line();
                continue;
            }
            let directive = Lexer::new(file, &mut self.idents).next_token(true);
            let name = match directive {
                Ok(tok) => match tok.kind {
                    TokenKind::Ident(id) => self.idents.spell(id),
                    TokenKind::Newline => continue,
                    _ => String::new(),
                },
                Err(_) => String::new(),
            };
            match name.as_str() {
                "if" | "ifdef" | "ifndef" => depth += 1,
                "endif" if depth > 0 => depth -= 1,
                "endif" => {
                    self.skip_rest_of_line(diag)?;
                    self.do_endif(diag);
                    return Ok(());
                }
                "else" if depth == 0 => {
                    self.skip_rest_of_line(diag)?;
                    return self.do_else(diag);
                }
                "elif" if depth == 0 => return self.do_elif(diag),
                _ => {}
            }
            if let Some(file) = self.files.last_mut() {
                Lexer::new(file, &mut self.idents).skip_line();
            }
        }
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocess(pp: &mut Preprocessor, src: &str) -> Result<String, String> {
        let mut diag = Diagnostics::new();
        diag.set_error_func(Box::new(|_| {}));
        pp.push_file(BufferedFile::from_bytes("t.c", src.as_bytes()), &mut diag)
            .map_err(|e| e.message)?;
        let mut out = Vec::new();
        pp.preprocess(&mut diag, &mut out).map_err(|e| e.message)?;
        if diag.nb_errors > 0 {
            return Err(diag.failure().message);
        }
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_missing_include() {
        let mut pp = Preprocessor::new();
        let err = preprocess(&mut pp, "#include \"nope_not_here.h\"\n").unwrap_err();
        assert!(err.ends_with("include file 'nope_not_here.h' not found"), "{}", err);
    }

    #[test]
    fn test_include_and_pop() {
        let dir = std::env::temp_dir().join(format!("crustcc-inc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("inner.h"), "#pragma once\ninner\n").unwrap();
        let mut pp = Preprocessor::new();
        pp.include_paths.push(dir.to_string_lossy().into_owned());
        let out = preprocess(&mut pp, "a\n#include <inner.h>\n#include <inner.h>\nb\n").unwrap();
        assert_eq!(out, "a\ninner\nb\n");
        assert_eq!(pp.files.len(), 1);
        assert_eq!(pp.deps.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_error_directive() {
        let mut pp = Preprocessor::new();
        let err = preprocess(&mut pp, "#error stop here\n").unwrap_err();
        assert_eq!(err, "t.c:1: error: #error stop here");
    }

    #[test]
    fn test_unknown_directive_and_mismatched_endif() {
        let mut pp = Preprocessor::new();
        let err = preprocess(&mut pp, "#frobnicate\n").unwrap_err();
        assert!(err.contains("invalid preprocessing directive #frobnicate"));
        let mut pp = Preprocessor::new();
        let err = preprocess(&mut pp, "#endif\n").unwrap_err();
        assert!(err.contains("#endif without matching #if"));
    }

    #[test]
    fn test_missing_endif() {
        let mut pp = Preprocessor::new();
        let err = preprocess(&mut pp, "#if 1\nx\n").unwrap_err();
        assert!(err.contains("missing #endif"));
    }

    #[test]
    fn test_line_directive() {
        let mut pp = Preprocessor::new();
        let out = preprocess(&mut pp, "#line 100 \"other.c\"\n__LINE__ __FILE__\n").unwrap();
        assert_eq!(out, "100 \"other.c\"\n");
    }
}
