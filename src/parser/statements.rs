//! Statement parsing implementation
//!
//! This module handles parsing of all C statement types and emits their
//! control flow directly:
//!
//! - Blocks and declarations mixed with statements
//! - Control flow: `if`, `while`, `for`, `do-while`, `switch`
//! - Jump statements: `return`, `break`, `continue`, `goto`
//! - Labels, `case` (with GNU `lo ... hi` ranges) and `default`
//! - Expression statements
//!
//! # Grammar
//!
//! ```text
//! statement ::= block | if_stmt | while_stmt | for_stmt
//!             | do_while_stmt | switch_stmt | return_stmt
//!             | break_stmt | continue_stmt | goto_stmt
//!             | label ":" statement | expr? ";"
//! ```
//!
//! Forward jumps are emitted with a zero displacement and collected in
//! lists (`break_lists`, `continue_lists`, a label's pending jumps) that
//! are patched once the target is known.

use crate::codegen::x86_64::Cond;
use crate::codegen::Emit;
use crate::errors::{CResult, ErrorKind};
use crate::parser::intern::TokId;
use crate::parser::lexer::{Keyword, Punct};
use crate::parser::parse::{Parser, SwitchState};
use crate::symbols::types::{canonical_value, CType};
use crate::symbols::{Namespace, Storage, Sym, SymId};

impl<'a> Parser<'a> {
    /// `{ ... }`. Function bodies share the scope of their parameters and
    /// pass `new_scope = false`.
    pub(crate) fn compound_statement(&mut self, new_scope: bool) -> CResult<()> {
        self.expect(Punct::LBrace)?;
        let mark = if new_scope {
            self.syms.block_depth += 1;
            Some(self.syms.local_mark())
        } else {
            None
        };
        while !self.is_punct(Punct::RBrace) {
            if self.tok.is_eof() {
                let msg = format!("'}}' expected (got \"{}\")", self.spell_tok());
                return Err(self.error(ErrorKind::Syntax, &msg));
            }
            self.block_item()?;
        }
        if let Some(mark) = mark {
            self.syms.pop_locals(mark);
            self.syms.block_depth -= 1;
        }
        self.next()
    }

    fn block_item(&mut self) -> CResult<()> {
        let is_label = self.ident().is_some() && self.peek()?.is_punct(Punct::Colon);
        if self.is_type_start() && !is_label {
            self.declaration(false)
        } else {
            self.statement()
        }
    }

    /// Parse and generate one statement.
    pub(crate) fn statement(&mut self) -> CResult<()> {
        match self.keyword() {
            Some(Keyword::If) => return self.if_statement(),
            Some(Keyword::While) => return self.while_statement(),
            Some(Keyword::Do) => return self.do_statement(),
            Some(Keyword::For) => return self.for_statement(),
            Some(Keyword::Switch) => return self.switch_statement(),
            Some(Keyword::Case) => return self.case_label(),
            Some(Keyword::Default) => return self.default_label(),
            Some(Keyword::Break) => return self.break_statement(),
            Some(Keyword::Continue) => return self.continue_statement(),
            Some(Keyword::Return) => return self.return_statement(),
            Some(Keyword::Goto) => return self.goto_statement(),
            Some(Keyword::Asm | Keyword::Asm2 | Keyword::Asm3) => {
                return Err(self.error(ErrorKind::Semantic, "inline assembly is not supported"));
            }
            _ => {}
        }
        if self.is_punct(Punct::LBrace) {
            return self.compound_statement(true);
        }
        if self.accept(Punct::Semicolon)? {
            return Ok(());
        }
        if let Some(name) = self.ident() {
            if self.peek()?.is_punct(Punct::Colon) {
                self.next()?;
                self.next()?;
                return self.label(name);
            }
        }
        self.expr()?;
        self.vpop();
        self.expect(Punct::Semicolon)
    }

    /// Statement after a label; a label may also end a block.
    fn labeled_statement(&mut self) -> CResult<()> {
        if self.is_punct(Punct::RBrace) {
            return Ok(());
        }
        self.statement()
    }

    /// Parenthesized controlling expression.
    fn condition(&mut self) -> CResult<()> {
        self.expect(Punct::LParen)?;
        self.expr()?;
        self.expect(Punct::RParen)
    }

    fn if_statement(&mut self) -> CResult<()> {
        self.next()?;
        self.condition()?;
        let exit = self.gtst(false)?;
        self.statement()?;
        if self.accept_kw(Keyword::Else)? {
            let end = self.gjmp();
            self.gsym(exit);
            self.statement()?;
            self.gsym(end);
        } else {
            self.gsym(exit);
        }
        Ok(())
    }

    /// Body of a loop, with fresh break and continue lists.
    fn loop_body(&mut self) -> CResult<(Vec<usize>, Vec<usize>)> {
        self.break_lists.push(Vec::new());
        self.continue_lists.push(Vec::new());
        let result = self.statement();
        let continues = self.continue_lists.pop().unwrap_or_default();
        let breaks = self.break_lists.pop().unwrap_or_default();
        result.map(|_| (breaks, continues))
    }

    fn while_statement(&mut self) -> CResult<()> {
        self.next()?;
        let top = self.ind();
        self.condition()?;
        let exit = self.gtst(false)?;
        let (breaks, continues) = self.loop_body()?;
        self.gjmp_to(top);
        self.gsym_to(continues, top);
        self.gsym(exit);
        self.gsym(breaks);
        Ok(())
    }

    fn do_statement(&mut self) -> CResult<()> {
        self.next()?;
        let top = self.ind();
        let (breaks, continues) = self.loop_body()?;
        if !self.accept_kw(Keyword::While)? {
            let msg = format!("'while' expected (got \"{}\")", self.spell_tok());
            return Err(self.error(ErrorKind::Syntax, &msg));
        }
        self.gsym(continues);
        self.condition()?;
        let again = self.gtst(true)?;
        self.gsym_to(again, top);
        self.gsym(breaks);
        self.expect(Punct::Semicolon)
    }

    fn for_statement(&mut self) -> CResult<()> {
        self.next()?;
        self.expect(Punct::LParen)?;
        self.syms.block_depth += 1;
        let mark = self.syms.local_mark();

        if !self.accept(Punct::Semicolon)? {
            if self.is_type_start() {
                self.declaration(false)?;
            } else {
                self.expr()?;
                self.vpop();
                self.expect(Punct::Semicolon)?;
            }
        }
        let top = self.ind();
        let exit = if self.is_punct(Punct::Semicolon) {
            None
        } else {
            self.expr()?;
            self.gtst(false)?
        };
        self.expect(Punct::Semicolon)?;
        let (to_body, step) = if self.is_punct(Punct::RParen) {
            (None, top)
        } else {
            let to_body = self.gjmp();
            let step = self.ind();
            self.expr()?;
            self.vpop();
            self.gjmp_to(top);
            (to_body, step)
        };
        self.expect(Punct::RParen)?;
        self.gsym(to_body);

        let (breaks, continues) = self.loop_body()?;
        self.gjmp_to(step);
        self.gsym_to(continues, step);
        self.gsym(exit);
        self.gsym(breaks);

        self.syms.pop_locals(mark);
        self.syms.block_depth -= 1;
        Ok(())
    }

    /// The controlling value is kept in a frame slot; the body is emitted
    /// first and the compare chain after it, reached by a jump over the
    /// body.
    fn switch_statement(&mut self) -> CResult<()> {
        self.next()?;
        self.condition()?;
        self.rvalue();
        let ty = self.vtop().ty.clone();
        if !ty.is_integer() {
            return Err(self.error(ErrorKind::Semantic, "switch quantity not an integer"));
        }
        let ty = ty.promote();
        self.gen_cast(&ty)?;
        self.gv();
        let slot = self.alloc_slot();
        self.store_slot(slot);
        self.vpop();
        let dispatch = self.gjmp();

        self.switches.push(SwitchState {
            cases: Vec::new(),
            default: None,
            ty: ty.clone(),
        });
        self.break_lists.push(Vec::new());
        let body = self.statement();
        let mut breaks = self.break_lists.pop().unwrap_or_default();
        let state = self.switches.pop();
        body?;
        let Some(state) = state else {
            return Err(self.error(ErrorKind::Internal, "switch state lost"));
        };
        breaks.extend(self.gjmp());

        self.gsym(dispatch);
        self.load_slot(slot);
        let unsigned = ty.is_unsigned();
        for (low, high, pos) in state.cases {
            if low == high {
                let hit = self.gen_case_test(low, Cond::E);
                self.gsym_to(hit, pos);
            } else {
                let below = self.gen_case_test(low, if unsigned { Cond::B } else { Cond::L });
                let hit = self.gen_case_test(high, if unsigned { Cond::Be } else { Cond::Le });
                self.gsym_to(hit, pos);
                self.gsym(below);
            }
        }
        if let Some(pos) = state.default {
            self.gjmp_to(pos);
        } else {
            breaks.extend(self.gjmp());
        }
        self.gsym(breaks);
        Ok(())
    }

    fn case_label(&mut self) -> CResult<()> {
        self.next()?;
        let Some(ty) = self.switches.last().map(|s| s.ty.clone()) else {
            return Err(self.error(ErrorKind::Semantic, "case label not in switch"));
        };
        let low = canonical_value(&ty, self.expr_const()?);
        let high = if self.accept(Punct::Ellipsis)? {
            canonical_value(&ty, self.expr_const()?)
        } else {
            low
        };
        self.expect(Punct::Colon)?;
        let unsigned = ty.is_unsigned();
        let le = |a: i64, b: i64| if unsigned { (a as u64) <= (b as u64) } else { a <= b };
        if !le(low, high) {
            self.warning("empty range specified");
        }
        let overlaps = self
            .switches
            .last()
            .is_some_and(|s| s.cases.iter().any(|&(l, h, _)| le(low, h) && le(l, high)));
        if overlaps {
            return Err(self.error(ErrorKind::Semantic, "duplicate case value"));
        }
        let here = self.ind();
        if let Some(state) = self.switches.last_mut() {
            state.cases.push((low, high, here));
        }
        self.labeled_statement()
    }

    fn default_label(&mut self) -> CResult<()> {
        self.next()?;
        self.expect(Punct::Colon)?;
        let here = self.ind();
        match self.switches.last_mut() {
            None => return Err(self.error(ErrorKind::Semantic, "'default' label not in switch")),
            Some(state) if state.default.is_some() => {
                return Err(self.error(ErrorKind::Semantic, "too many 'default'"));
            }
            Some(state) => state.default = Some(here),
        }
        self.labeled_statement()
    }

    fn break_statement(&mut self) -> CResult<()> {
        self.next()?;
        if self.break_lists.is_empty() {
            return Err(self.error(ErrorKind::Semantic, "cannot break"));
        }
        let jump = self.gjmp();
        if let Some(list) = self.break_lists.last_mut() {
            list.extend(jump);
        }
        self.expect(Punct::Semicolon)
    }

    fn continue_statement(&mut self) -> CResult<()> {
        self.next()?;
        if self.continue_lists.is_empty() {
            return Err(self.error(ErrorKind::Semantic, "cannot continue"));
        }
        let jump = self.gjmp();
        if let Some(list) = self.continue_lists.last_mut() {
            list.extend(jump);
        }
        self.expect(Punct::Semicolon)
    }

    fn return_statement(&mut self) -> CResult<()> {
        self.next()?;
        let ret = self.func.as_ref().map_or_else(CType::void, |f| f.ret.clone());
        if !self.is_punct(Punct::Semicolon) {
            self.expr()?;
            if ret.is_void() {
                if !self.vtop().ty.is_void() {
                    self.warning("'return' with a value, in function returning void");
                }
                self.vpop();
            } else if ret.is_struct() {
                return Err(self.error(ErrorKind::Semantic, "returning structs is not supported"));
            } else {
                self.gen_assign_cast(&ret)?;
                self.gv();
                self.vpop();
            }
        } else if !ret.is_void() {
            self.warning("'return' with no value, in function returning non-void");
        }
        self.expect(Punct::Semicolon)?;
        let jump = self.gjmp();
        if let Some(func) = self.func.as_mut() {
            func.returns.extend(jump);
        }
        Ok(())
    }

    /// Label symbol for `name`, created on first mention.
    fn label_sym(&mut self, name: TokId) -> SymId {
        match self.syms.find_label(name) {
            Some(sid) => sid,
            None => {
                let pending = Storage::Label {
                    pos: None,
                    pending: Vec::new(),
                };
                self.syms.push(Namespace::Label, Sym::new(name, CType::void(), pending))
            }
        }
    }

    fn goto_statement(&mut self) -> CResult<()> {
        self.next()?;
        let name = self.expect_ident()?;
        let sid = self.label_sym(name);
        let jump = self.gjmp();
        let target = match &mut self.syms.get_mut(sid).storage {
            Storage::Label { pos: Some(pos), .. } => Some(*pos),
            Storage::Label { pending, .. } => {
                pending.extend(jump);
                None
            }
            _ => None,
        };
        if let Some(pos) = target {
            self.gsym_to(jump, pos);
        }
        self.expect(Punct::Semicolon)
    }

    /// `name:` has been consumed.
    fn label(&mut self, name: TokId) -> CResult<()> {
        let sid = self.label_sym(name);
        let here = self.ind();
        let pending = match &mut self.syms.get_mut(sid).storage {
            Storage::Label { pos: Some(_), .. } => None,
            Storage::Label { pos, pending } => {
                *pos = Some(here);
                Some(std::mem::take(pending))
            }
            _ => None,
        };
        let Some(pending) = pending else {
            let msg = format!("duplicate label '{}'", self.pp.idents.spell(name));
            return Err(self.error(ErrorKind::Semantic, &msg));
        };
        self.gsym_to(pending, here);
        self.labeled_statement()
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse::tests::compile;
    use crate::state::Settings;

    fn error_of(source: &str) -> String {
        let (_, result) = compile(source, &Settings::default());
        result.unwrap_err()
    }

    #[test]
    fn test_control_flow_compiles() {
        let source = "int f(int n) {\n\
                      int s = 0;\n\
                      for (int i = 0; i < n; i++) { if (i & 1) continue; s += i; }\n\
                      while (n > 0) { n--; if (n == 3) break; }\n\
                      do { s++; } while (s < 10);\n\
                      switch (n) { case 1: s = 1; break; case 2 ... 4: s = 2; default: s++; }\n\
                      again: if (s > 100) goto done; s *= 2; goto again;\n\
                      done: return s;\n\
                      }\n";
        let (_, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn test_duplicate_case() {
        let msg = error_of("int f(int x) { switch (x) { case 1: case 0 ... 2: ; } return 0; }");
        assert!(msg.contains("duplicate case value"), "{}", msg);
    }

    #[test]
    fn test_case_outside_switch() {
        let msg = error_of("int f(void) { case 1: return 0; }");
        assert!(msg.contains("case label not in switch"), "{}", msg);
    }

    #[test]
    fn test_second_default() {
        let msg = error_of("int f(int x) { switch (x) { default: default: ; } return 0; }");
        assert!(msg.contains("too many 'default'"), "{}", msg);
    }

    #[test]
    fn test_undefined_label() {
        let msg = error_of("int f(void) { goto nowhere; }");
        assert!(msg.contains("label 'nowhere' used but not defined"), "{}", msg);
    }

    #[test]
    fn test_duplicate_label() {
        let msg = error_of("int f(void) { a: ; a: ; return 0; }");
        assert!(msg.contains("duplicate label 'a'"), "{}", msg);
    }

    #[test]
    fn test_break_outside_loop() {
        let msg = error_of("int f(void) { break; }");
        assert!(msg.contains("cannot break"), "{}", msg);
    }
}
