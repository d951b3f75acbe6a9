//! Expression parsing and code generation
//!
//! Expressions are parsed by recursive descent for the assignment, ternary
//! and short-circuit levels, and by precedence climbing for the binary
//! operators below them. Each operand is pushed on the value stack as soon
//! as it is recognized and combined by the generators in
//! [`crate::codegen`]; constant operands fold without emitting code.
//!
//! # Supported Expressions
//!
//! - Literals: integers (with C's typing rules for suffixes and radix),
//!   character constants, string literals with concatenation
//! - Identifiers: objects, functions, enumeration constants, `__func__`
//! - Binary operators: arithmetic, comparison, bitwise, shifts, pointer
//!   arithmetic
//! - Logical `&&` / `||` with short-circuit jumps
//! - Unary: `-`, `+`, `~`, `!`, `&`, `*`, prefix `++` / `--`
//! - Postfix: `[]`, `.`, `->`, calls, `++`, `--`
//! - Ternary `? :`, simple and compound assignment, comma
//! - Casts, `sizeof`, `_Alignof`, `typeof` operands
//!
//! # Grammar
//!
//! ```text
//! expr     := assign ( ',' assign )*
//! assign   := cond ( assign-op assign )?
//! cond     := lor ( '?' expr ':' cond )?
//! lor      := land ( '||' land )*
//! land     := binary ( '&&' binary )*
//! binary   := cast ( binop cast )*          by precedence
//! cast     := '(' type-name ')' cast | unary
//! unary    := unary-op cast | ('++' | '--') unary | sizeof | postfix
//! postfix  := primary ( '[' expr ']' | '(' args ')' | '.' id | '->' id
//!             | '++' | '--' )*
//! ```

use crate::codegen::{BinOp, Callee, Loc, SValue, UnOp};
use crate::errors::{CResult, ErrorKind};
use crate::parser::lexer::{decode_literal, is_float_literal, parse_int_literal, Keyword, Punct, TokenKind};
use crate::parser::parse::Parser;
use crate::symbols::types::{common_int_type, size_align, CType, Conversion, FuncType, TypeKind};
use crate::symbols::{Namespace, Storage, Sym};
use std::rc::Rc;

/// Deepest nesting of casts, unary operators and parentheses
pub(crate) const MAX_EXPR_DEPTH: usize = 256;

/// Truth of a condition known at compile time, by the same rules the
/// conditional jumps use.
fn known_truth(sv: &SValue) -> Option<bool> {
    match sv.const_value() {
        Some(v) => Some(v != 0),
        None if sv.is_addr_const() => Some(true),
        None if !sv.lval && matches!(sv.loc, Loc::Local(_)) => Some(true),
        None => None,
    }
}

/// Binary operator and precedence of a punctuator
fn binary_op(p: Punct) -> Option<(BinOp, u8)> {
    let op = match p {
        Punct::Pipe => (BinOp::Or, 1),
        Punct::Caret => (BinOp::Xor, 2),
        Punct::Amp => (BinOp::And, 3),
        Punct::EqEq => (BinOp::Eq, 4),
        Punct::NotEq => (BinOp::Ne, 4),
        Punct::Lt => (BinOp::Lt, 5),
        Punct::Gt => (BinOp::Gt, 5),
        Punct::Le => (BinOp::Le, 5),
        Punct::Ge => (BinOp::Ge, 5),
        Punct::Shl => (BinOp::Shl, 6),
        Punct::Shr => (BinOp::Shr, 6),
        Punct::Plus => (BinOp::Add, 7),
        Punct::Minus => (BinOp::Sub, 7),
        Punct::Star => (BinOp::Mul, 8),
        Punct::Slash => (BinOp::Div, 8),
        Punct::Percent => (BinOp::Mod, 8),
        _ => return None,
    };
    Some(op)
}

/// Operator applied by a compound assignment; `None` for plain `=`
fn assign_op(p: Punct) -> Option<Option<BinOp>> {
    let op = match p {
        Punct::Assign => None,
        Punct::PlusEq => Some(BinOp::Add),
        Punct::MinusEq => Some(BinOp::Sub),
        Punct::StarEq => Some(BinOp::Mul),
        Punct::SlashEq => Some(BinOp::Div),
        Punct::PercentEq => Some(BinOp::Mod),
        Punct::ShlEq => Some(BinOp::Shl),
        Punct::ShrEq => Some(BinOp::Shr),
        Punct::AmpEq => Some(BinOp::And),
        Punct::CaretEq => Some(BinOp::Xor),
        Punct::PipeEq => Some(BinOp::Or),
        _ => return None,
    };
    Some(op)
}

/// Type of an integer constant: the first of int, unsigned int, long,
/// unsigned long that holds the value. Decimal constants without `u`
/// skip the unsigned candidates except the last.
fn int_literal_type(value: u64, unsigned: bool, long: bool, decimal: bool) -> CType {
    let may_unsigned = unsigned || !decimal;
    if !long {
        if !unsigned && value <= i32::MAX as u64 {
            return CType::int();
        }
        if may_unsigned && value <= u32::MAX as u64 {
            return CType::uint();
        }
    }
    if !unsigned && value <= i64::MAX as u64 {
        CType::long()
    } else {
        CType::ulong()
    }
}

impl<'a> Parser<'a> {
    /// Parse a full expression, comma operator included.
    pub(crate) fn expr(&mut self) -> CResult<()> {
        self.assign_expr()?;
        while self.accept(Punct::Comma)? {
            self.vpop();
            self.assign_expr()?;
        }
        Ok(())
    }

    /// Assignment or anything of higher precedence (right-associative).
    pub(crate) fn assign_expr(&mut self) -> CResult<()> {
        self.cond_expr()?;
        let op = match self.tok.kind {
            TokenKind::Punct(p) => match assign_op(p) {
                Some(op) => op,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        self.next()?;
        if !self.vtop().lval {
            return Err(self.error(ErrorKind::Semantic, "lvalue expected"));
        }
        match op {
            None => {
                let dst = self.vtop().ty.clone();
                self.assign_expr()?;
                if !dst.is_struct() {
                    self.gen_assign_cast(&dst)?;
                }
            }
            Some(op) => {
                self.make_stable_lval();
                self.vdup();
                self.assign_expr()?;
                self.gen_op(op)?;
            }
        }
        self.vstore()
    }

    /// Check the implicit conversion of the top value to `to` and emit it.
    /// Used for assignment, argument passing, `return` and initializers.
    pub(crate) fn gen_assign_cast(&mut self, to: &CType) -> CResult<()> {
        self.rvalue();
        let src = self.vtop().clone();
        let null = src.ty.is_integer() && src.const_value() == Some(0);
        let check = self
            .settings
            .conversions
            .check_assign(to, &src.ty, null, &self.syms.structs);
        match check {
            Conversion::Ok => {}
            Conversion::Warn(msg) => self.warning(&msg),
            Conversion::Error(msg) => return Err(self.error(ErrorKind::Semantic, &msg)),
        }
        if to.is_struct() {
            return Ok(());
        }
        self.gen_cast(&to.unqualified())
    }

    /// Ternary conditional.
    pub(crate) fn cond_expr(&mut self) -> CResult<()> {
        self.logical_or()?;
        if !self.accept(Punct::Question)? {
            return Ok(());
        }
        self.rvalue();
        match known_truth(self.vtop()) {
            Some(truth) => {
                self.vpop();
                self.constant_conditional(truth)
            }
            None => self.runtime_conditional(),
        }
    }

    /// `c ? a : b` with `c` known: only the selected operand gets code.
    fn constant_conditional(&mut self, truth: bool) -> CResult<()> {
        let other = if truth {
            self.expr()?;
            self.rvalue();
            self.expect(Punct::Colon)?;
            self.without_data(|p| {
                p.cond_expr()?;
                p.rvalue();
                let ty = p.vtop().ty.clone();
                p.vpop();
                Ok(ty)
            })?
        } else {
            let ty = self.without_data(|p| {
                p.expr()?;
                p.rvalue();
                let ty = p.vtop().ty.clone();
                p.vpop();
                Ok(ty)
            })?;
            self.expect(Punct::Colon)?;
            self.cond_expr()?;
            self.rvalue();
            ty
        };
        let live = self.vtop().ty.clone();
        let common = if truth {
            self.conditional_type(&live, &other)?
        } else {
            self.conditional_type(&other, &live)?
        };
        if common.is_scalar() {
            self.gen_cast(&common)?;
        }
        Ok(())
    }

    fn runtime_conditional(&mut self) -> CResult<()> {
        let to_else = self.gtst(false)?;
        self.expr()?;
        self.rvalue();
        let void_a = self.vtop().ty.is_void();
        if !void_a {
            self.gv();
        }
        let a = self.vstack.pop().unwrap_or_else(|| SValue::constant(CType::void(), 0));
        let to_fix_a = self.gjmp();
        self.expect(Punct::Colon)?;
        self.gsym(to_else);

        self.cond_expr()?;
        self.rvalue();
        let b_ty = self.vtop().ty.clone();
        let common = self.conditional_type(&a.ty, &b_ty)?;
        if common.is_void() {
            self.vpop();
            self.gsym(to_fix_a);
            self.vpush(SValue::constant(CType::void(), 0));
            return Ok(());
        }
        if common.is_scalar() {
            self.gen_cast(&common)?;
        }
        self.gv();
        self.vstack.pop();
        let end = self.gjmp();

        self.gsym(to_fix_a);
        self.vpush(a);
        if common.is_scalar() {
            self.gen_cast(&common)?;
        }
        self.gv();
        self.vstack.pop();
        self.gsym(end);
        let lval = common.is_struct();
        self.vpush(SValue::new(common, Loc::Reg, lval));
        Ok(())
    }

    /// Result type of `c ? a : b`.
    fn conditional_type(&mut self, a: &CType, b: &CType) -> CResult<CType> {
        if a.is_void() || b.is_void() {
            return Ok(CType::void());
        }
        if a.is_integer() && b.is_integer() {
            return Ok(common_int_type(a, b));
        }
        match (a.is_pointer(), b.is_pointer()) {
            (true, false) if b.is_integer() => return Ok(a.unqualified()),
            (false, true) if a.is_integer() => return Ok(b.unqualified()),
            (true, true) => {
                let b_void = b.pointee().is_some_and(|t| t.is_void());
                return Ok(if b_void { b.unqualified() } else { a.unqualified() });
            }
            _ => {}
        }
        if a.is_struct() && a.struct_id() == b.struct_id() {
            return Ok(a.unqualified());
        }
        if a.is_float() || b.is_float() {
            return Err(self.error(ErrorKind::Semantic, "floating point types are not supported"));
        }
        Err(self.error(ErrorKind::Semantic, "type mismatch in conditional expression"))
    }

    fn logical_or(&mut self) -> CResult<()> {
        self.logical_and()?;
        if self.is_punct(Punct::OrOr) {
            self.short_circuit(false)?;
        }
        Ok(())
    }

    fn logical_and(&mut self) -> CResult<()> {
        self.binary_expr(1)?;
        if self.is_punct(Punct::AndAnd) {
            self.short_circuit(true)?;
        }
        Ok(())
    }

    /// Chain of `&&` (or `||`) operands, the first already on the stack.
    /// Each operand jumps out as soon as it decides the result; constant
    /// operands fold, and operands after a deciding constant are parsed
    /// without code.
    fn short_circuit(&mut self, and: bool) -> CResult<()> {
        let op = if and { Punct::AndAnd } else { Punct::OrOr };
        let mut jumps = Vec::new();
        let mut decided = false;
        let mut runtime = false;
        loop {
            self.rvalue();
            if decided {
                self.vpop();
            } else {
                match known_truth(self.vtop()) {
                    Some(t) => {
                        self.vpop();
                        decided = t != and;
                    }
                    None => {
                        runtime = true;
                        jumps.extend(self.gtst(!and)?);
                    }
                }
            }
            if !self.accept(op)? {
                break;
            }
            if decided {
                self.without_data(|p| if and { p.binary_expr(1) } else { p.logical_and() })?;
            } else if and {
                self.binary_expr(1)?;
            } else {
                self.logical_and()?;
            }
        }
        if decided {
            self.gsym(jumps);
            self.vpush_const(CType::int(), !and as i64);
        } else if runtime {
            self.gen_bool_result(jumps, and);
        } else {
            self.vpush_const(CType::int(), and as i64);
        }
        Ok(())
    }

    /// Binary operators of precedence `min` and above, left-associative.
    fn binary_expr(&mut self, min: u8) -> CResult<()> {
        self.cast_expr()?;
        loop {
            let Some((op, prec)) = (match self.tok.kind {
                TokenKind::Punct(p) => binary_op(p),
                _ => None,
            }) else {
                return Ok(());
            };
            if prec < min {
                return Ok(());
            }
            self.next()?;
            self.binary_expr(prec + 1)?;
            self.gen_op(op)?;
        }
    }

    /// Whether a `(` at the current token opens a type name.
    fn at_type_in_parens(&mut self) -> CResult<bool> {
        if !self.is_punct(Punct::LParen) {
            return Ok(false);
        }
        let next = self.peek()?;
        Ok(self.starts_type(&next))
    }

    fn cast_expr(&mut self) -> CResult<()> {
        self.nested(Self::cast_operand)
    }

    /// Run one level of recursive descent, bounded by `MAX_EXPR_DEPTH`.
    fn nested(&mut self, parse: fn(&mut Self) -> CResult<()>) -> CResult<()> {
        if self.expr_depth >= MAX_EXPR_DEPTH {
            return Err(self.error(ErrorKind::Syntax, "expression nested too deeply"));
        }
        self.expr_depth += 1;
        let result = parse(self);
        self.expr_depth -= 1;
        result
    }

    fn cast_operand(&mut self) -> CResult<()> {
        if !self.at_type_in_parens()? {
            return self.unary_expr();
        }
        self.next()?;
        let ty = self.type_name()?;
        self.expect(Punct::RParen)?;
        if self.is_punct(Punct::LBrace) {
            return Err(self.error(ErrorKind::Semantic, "compound literals are not supported"));
        }
        self.cast_expr()?;
        self.gen_cast(&ty)
    }

    fn unary_expr(&mut self) -> CResult<()> {
        if let Some(kw) = self.keyword() {
            match kw {
                Keyword::Sizeof | Keyword::Alignof | Keyword::Alignof2 => {
                    return self.sizeof_expr(kw == Keyword::Sizeof);
                }
                Keyword::Extension => {
                    self.next()?;
                    return self.cast_expr();
                }
                _ => {}
            }
        }
        let TokenKind::Punct(p) = self.tok.kind else {
            return self.postfix_expr();
        };
        match p {
            Punct::PlusPlus | Punct::MinusMinus => {
                self.next()?;
                self.nested(Self::unary_expr)?;
                self.pre_increment(p == Punct::PlusPlus)
            }
            Punct::Amp => {
                self.next()?;
                self.cast_expr()?;
                self.gen_addr()
            }
            Punct::Star => {
                self.next()?;
                self.cast_expr()?;
                self.gen_deref()
            }
            Punct::Plus => {
                self.next()?;
                self.cast_expr()?;
                self.rvalue();
                let ty = self.vtop().ty.clone();
                if !ty.is_integer() {
                    return Err(self.error(ErrorKind::Semantic, "invalid operand type for unary '+'"));
                }
                self.gen_cast(&ty.promote())
            }
            Punct::Minus | Punct::Tilde | Punct::Bang => {
                self.next()?;
                self.cast_expr()?;
                let op = match p {
                    Punct::Minus => UnOp::Neg,
                    Punct::Tilde => UnOp::BitNot,
                    _ => UnOp::LogNot,
                };
                self.gen_unary(op)
            }
            _ => self.postfix_expr(),
        }
    }

    /// `++x` / `--x`: leaves the new value.
    fn pre_increment(&mut self, inc: bool) -> CResult<()> {
        let top = self.vtop().clone();
        if !top.lval || !top.ty.is_scalar() {
            return Err(self.error(ErrorKind::Semantic, "lvalue expected"));
        }
        self.make_stable_lval();
        self.vdup();
        self.vpush_const(CType::int(), 1);
        self.gen_op(if inc { BinOp::Add } else { BinOp::Sub })?;
        self.vstore()
    }

    /// `sizeof` / `_Alignof` of a parenthesized type or an unevaluated
    /// expression.
    fn sizeof_expr(&mut self, size: bool) -> CResult<()> {
        self.next()?;
        let ty = if self.at_type_in_parens()? {
            self.next()?;
            let ty = self.type_name()?;
            self.expect(Punct::RParen)?;
            ty
        } else {
            self.without_data(|p| {
                p.unary_expr()?;
                let ty = p.vtop().ty.clone();
                p.vpop();
                Ok(ty)
            })?
        };
        let value = if ty.is_func() {
            1
        } else {
            match size_align(&ty, &self.syms.structs) {
                Some((s, a)) => {
                    if size {
                        s
                    } else {
                        a
                    }
                }
                None => {
                    let msg = if size {
                        "sizeof applied to an incomplete type"
                    } else {
                        "_Alignof applied to an incomplete type"
                    };
                    return Err(self.error(ErrorKind::Semantic, msg));
                }
            }
        };
        self.vpush_const(CType::ulong(), value as i64);
        Ok(())
    }

    fn postfix_expr(&mut self) -> CResult<()> {
        self.primary_expr()?;
        loop {
            let TokenKind::Punct(p) = self.tok.kind else {
                return Ok(());
            };
            match p {
                Punct::LBracket => {
                    self.next()?;
                    self.rvalue();
                    self.expr()?;
                    self.expect(Punct::RBracket)?;
                    self.gen_op(BinOp::Add)?;
                    self.gen_deref()?;
                }
                Punct::LParen => {
                    self.next()?;
                    self.call_expr()?;
                }
                Punct::Dot => {
                    self.next()?;
                    self.member_access()?;
                }
                Punct::Arrow => {
                    self.next()?;
                    self.gen_deref()?;
                    self.member_access()?;
                }
                Punct::PlusPlus | Punct::MinusMinus => {
                    self.next()?;
                    self.gen_post_inc(p == Punct::PlusPlus)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn member_access(&mut self) -> CResult<()> {
        let Some(id) = self.vtop().ty.struct_id() else {
            return Err(self.error(ErrorKind::Semantic, "struct or union expected"));
        };
        let name = self.expect_ident()?;
        let Some(field) = self.syms.find_field(id, name).cloned() else {
            let msg = format!("field not found: {}", self.pp.idents.spell(name));
            return Err(self.error(ErrorKind::Semantic, &msg));
        };
        self.gen_member(field.offset, field.ty);
        Ok(())
    }

    /// Arguments and call, after the `(`. The callee is on top of the stack.
    fn call_expr(&mut self) -> CResult<()> {
        self.rvalue();
        let top = self.vtop().clone();
        let Some(fty) = top.ty.pointee().and_then(|t| t.func()).cloned() else {
            return Err(self.error(ErrorKind::Semantic, "function pointer expected"));
        };
        if fty.ret.is_struct() {
            return Err(self.error(ErrorKind::Semantic, "returning structs is not supported"));
        }
        let callee = match (top.lval, top.loc) {
            (false, Loc::Sym { sym, addend: 0 }) => {
                self.vpop();
                self.spill_reg();
                Callee::Direct(sym)
            }
            _ => {
                self.gen_push_callee();
                Callee::Indirect
            }
        };
        let mut nargs = 0;
        if !self.is_punct(Punct::RParen) {
            loop {
                self.assign_expr()?;
                self.call_argument(&fty, nargs)?;
                self.gen_push_arg();
                nargs += 1;
                if !self.accept(Punct::Comma)? {
                    break;
                }
            }
        }
        self.expect(Punct::RParen)?;
        if nargs < fty.params.len() && !fty.old_style {
            return Err(self.error(ErrorKind::Semantic, "too few arguments to function"));
        }
        self.gen_call(callee, nargs, &fty.ret);
        Ok(())
    }

    /// Convert argument `index` to its parameter type, or apply the default
    /// promotions past the prototype.
    fn call_argument(&mut self, fty: &FuncType, index: usize) -> CResult<()> {
        self.rvalue();
        if self.vtop().ty.is_struct() {
            return Err(self.error(ErrorKind::Semantic, "passing structs by value is not supported"));
        }
        match fty.params.get(index) {
            Some(param) => self.gen_assign_cast(&param.ty),
            None if fty.variadic || fty.old_style => {
                let ty = self.vtop().ty.clone();
                if ty.is_integer() {
                    self.gen_cast(&ty.promote())
                } else {
                    self.gen_cast(&ty)
                }
            }
            None => Err(self.error(ErrorKind::Semantic, "too many arguments to function")),
        }
    }

    fn primary_expr(&mut self) -> CResult<()> {
        match self.tok.kind.clone() {
            TokenKind::Number(text) => {
                self.number(&text)?;
                self.next()
            }
            TokenKind::Char(text) => {
                self.char_constant(&text)?;
                self.next()
            }
            TokenKind::Str(_) => self.string_expr(),
            TokenKind::Punct(Punct::LParen) => {
                self.next()?;
                self.expr()?;
                self.expect(Punct::RParen)
            }
            TokenKind::Ident(id) if !id.is_keyword() => self.identifier(id),
            _ => {
                let msg = format!("expression expected before \"{}\"", self.spell_tok());
                Err(self.error(ErrorKind::Syntax, &msg))
            }
        }
    }

    fn number(&mut self, text: &str) -> CResult<()> {
        if is_float_literal(text) {
            return Err(self.error(ErrorKind::Semantic, "floating point types are not supported"));
        }
        let lit = match parse_int_literal(text) {
            Ok(lit) => lit,
            Err(msg) => return Err(self.error(ErrorKind::Lexical, &msg)),
        };
        let ty = int_literal_type(lit.value, lit.unsigned, lit.long, lit.decimal);
        self.vpush_const(ty, lit.value as i64);
        Ok(())
    }

    fn char_constant(&mut self, text: &[u8]) -> CResult<()> {
        let (units, wide) = match decode_literal(text) {
            Ok(decoded) => decoded,
            Err(msg) => return Err(self.error(ErrorKind::Lexical, &msg)),
        };
        let Some(&first) = units.first() else {
            return Err(self.error(ErrorKind::Lexical, "empty character constant"));
        };
        let value = if wide || self.settings.char_is_unsigned {
            first as i64
        } else {
            first as u8 as i8 as i64
        };
        self.vpush_const(CType::int(), value);
        Ok(())
    }

    fn identifier(&mut self, id: crate::parser::intern::TokId) -> CResult<()> {
        let sid = match self.syms.find_ident(id) {
            Some(sid) => sid,
            None => {
                if self.pp.idents.spell(id) == "__func__" {
                    return self.func_name();
                }
                if !self.peek()?.is_punct(Punct::LParen) {
                    let msg = format!("'{}' undeclared", self.pp.idents.spell(id));
                    return Err(self.error(ErrorKind::Semantic, &msg));
                }
                self.implicit_declaration(id)
            }
        };
        self.next()?;
        let sym = self.syms.get(sid);
        let (storage, ty) = (sym.storage.clone(), sym.ty.clone());
        let sv = match storage {
            Storage::EnumConst(v) => {
                self.vpush_const(CType::int(), v);
                return Ok(());
            }
            Storage::Local(off) => SValue::new(ty, Loc::Local(off), true),
            Storage::Global => SValue::new(ty, Loc::Sym { sym: sid, addend: 0 }, true),
            _ => {
                let msg = format!("unexpected '{}' in expression", self.pp.idents.spell(id));
                return Err(self.error(ErrorKind::Syntax, &msg));
            }
        };
        self.vpush(sv);
        Ok(())
    }

    /// `f(...)` with `f` never declared: `int f()`.
    fn implicit_declaration(&mut self, id: crate::parser::intern::TokId) -> crate::symbols::SymId {
        if self.diag.warnings.implicit_function_declaration {
            let msg = format!("implicit declaration of function '{}'", self.pp.idents.spell(id));
            self.warning(&msg);
        }
        let fty = FuncType {
            ret: CType::int(),
            params: Vec::new(),
            variadic: false,
            old_style: true,
            call_conv: Default::default(),
        };
        let mut sym = Sym::new(id, CType::new(TypeKind::Func(Rc::new(fty))), Storage::Global);
        sym.flags.is_extern = true;
        self.syms.push_global(Namespace::Ident, sym)
    }

    /// `__func__`: the enclosing function's name as a string.
    fn func_name(&mut self) -> CResult<()> {
        let Some(fsym) = self.func.as_ref().map(|f| f.sym) else {
            return Err(self.error(ErrorKind::Semantic, "'__func__' is not defined outside of function scope"));
        };
        let name = self.pp.idents.spell(self.syms.get(fsym).v);
        let mut units: Vec<u32> = name.bytes().map(u32::from).collect();
        units.push(0);
        self.next()?;
        let elem = CType::char(self.settings.char_is_unsigned).with_const();
        self.push_string(units, elem)
    }

    /// Concatenated string literal tokens, decoded into code units without
    /// the terminating zero.
    pub(crate) fn string_units(&mut self) -> CResult<(Vec<u32>, bool)> {
        let mut units = Vec::new();
        let mut wide = false;
        while let TokenKind::Str(text) = self.tok.kind.clone() {
            match decode_literal(&text) {
                Ok((u, w)) => {
                    units.extend(u);
                    wide |= w;
                }
                Err(msg) => return Err(self.error(ErrorKind::Lexical, &msg)),
            }
            self.next()?;
        }
        Ok((units, wide))
    }

    /// A narrow string operand of an attribute or `__asm__` label.
    pub(crate) fn string_literal(&mut self) -> CResult<String> {
        if !matches!(self.tok.kind, TokenKind::Str(_)) {
            let msg = format!("string expected (got \"{}\")", self.spell_tok());
            return Err(self.error(ErrorKind::Syntax, &msg));
        }
        let (units, wide) = self.string_units()?;
        if wide {
            return Err(self.error(ErrorKind::Syntax, "wide string not allowed here"));
        }
        let bytes: Vec<u8> = units.iter().map(|&u| u as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn string_expr(&mut self) -> CResult<()> {
        let (mut units, wide) = self.string_units()?;
        units.push(0);
        let mut elem = if wide {
            CType::int()
        } else {
            CType::char(self.settings.char_is_unsigned)
        };
        if self.diag.warnings.write_strings {
            elem = elem.with_const();
        }
        self.push_string(units, elem)
    }

    /// Store a string in `.data` under an anonymous local symbol and push
    /// it as an array lvalue. Unevaluated operands only get the type.
    fn push_string(&mut self, units: Vec<u32>, elem: CType) -> CResult<()> {
        let esize = elem.width().0 as usize;
        let ty = elem.array_of(Some(units.len() as u64));
        if self.nodata {
            self.vpush(SValue::new(ty, Loc::Const(0), true));
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(units.len() * esize);
        for unit in units {
            bytes.extend_from_slice(&(unit as u64).to_le_bytes()[..esize]);
        }
        let name = self.syms.anon_id();
        let mut sym = Sym::new(name, ty.clone(), Storage::Global);
        sym.flags.is_static = true;
        sym.flags.defined = true;
        let sid = self.syms.alloc(sym);
        let data = self.secs.data;
        let offset = self.alloc_static(data, bytes.len() as u64, esize as u64)?;
        self.secs[data].write_bytes(offset as usize, &bytes);
        let shndx = self.shndx_of(data);
        self.put_extern_sym(sid, shndx, offset, bytes.len() as u64)?;
        self.vpush(SValue::new(ty, Loc::Sym { sym: sid, addend: 0 }, true));
        Ok(())
    }

    /// Type of an expression that is parsed but not evaluated (`typeof`).
    pub(crate) fn type_of_expr(&mut self) -> CResult<CType> {
        self.without_data(|p| {
            p.expr()?;
            let ty = p.vtop().ty.clone();
            p.vpop();
            Ok(ty)
        })
    }

    /// Integer constant expression.
    pub(crate) fn expr_const(&mut self) -> CResult<i64> {
        let sv = self.without_data(|p| {
            p.cond_expr()?;
            p.rvalue();
            let sv = p.vtop().clone();
            p.vpop();
            Ok(sv)
        })?;
        match sv.const_value() {
            Some(v) if sv.ty.is_integer() => Ok(v),
            _ => Err(self.error(ErrorKind::Semantic, "constant expression expected")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::int_literal_type;
    use crate::parser::parse::tests::compile;
    use crate::state::Settings;
    use crate::symbols::types::CType;

    /// Bytes of the initialized global `name`.
    fn global(source: &str, name: &str) -> Vec<u8> {
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let sym = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, name));
        let off = sym.st_value as usize;
        secs[secs.data].data()[off..off + sym.st_size as usize].to_vec()
    }

    fn int_global(source: &str, name: &str) -> i64 {
        let bytes = global(source, name);
        let mut word = [0u8; 8];
        word[..bytes.len()].copy_from_slice(&bytes);
        let v = i64::from_le_bytes(word);
        match bytes.len() {
            4 => v as i32 as i64,
            _ => v,
        }
    }

    #[test]
    fn test_integer_literal_types() {
        assert_eq!(int_literal_type(1, false, false, true), CType::int());
        assert_eq!(int_literal_type(0xffff_ffff, false, false, false), CType::uint());
        assert_eq!(int_literal_type(4_294_967_295, false, false, true), CType::long());
        assert_eq!(int_literal_type(1, true, true, true), CType::ulong());
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(int_global("int x = 1 + 2 * 3 - (10 >> 1);", "x"), 2);
        assert_eq!(int_global("int x = -7 / 2;", "x"), -3);
        assert_eq!(int_global("int x = (unsigned)-1 > 0;", "x"), 1);
        assert_eq!(int_global("int x = -1 < 0u;", "x"), 0);
        assert_eq!(int_global("int x = (char)300;", "x"), 44);
    }

    #[test]
    fn test_logical_and_conditional_fold() {
        assert_eq!(int_global("int x = (3 && 0) || 5;", "x"), 1);
        assert_eq!(int_global("int x = 0 ? 4 : 9;", "x"), 9);
        assert_eq!(int_global("int x = !!7 + !0;", "x"), 2);
    }

    #[test]
    fn test_sizeof_does_not_evaluate() {
        let source = "struct s { char c; long l; };\n\
                      int a = sizeof(struct s);\n\
                      int b = sizeof \"abc\";\n\
                      int c = _Alignof(struct s);\n\
                      int d = sizeof(4294967296);\n";
        assert_eq!(int_global(source, "a"), 16);
        assert_eq!(int_global(source, "b"), 4);
        assert_eq!(int_global(source, "c"), 8);
        assert_eq!(int_global(source, "d"), 8);
        // the string inside sizeof is not stored
        let (secs, _) = compile(source, &Settings::default());
        assert!(!secs[secs.data].data().windows(3).any(|w| w == b"abc"));
    }

    #[test]
    fn test_char_constants_follow_char_signedness() {
        assert_eq!(int_global("int x = '\\xff';", "x"), -1);
        let settings = Settings {
            char_is_unsigned: true,
            ..Settings::default()
        };
        let (secs, result) = compile("int x = '\\xff';", &settings);
        assert!(result.is_ok());
        let sym = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, "x"));
        let off = sym.st_value as usize;
        assert_eq!(&secs[secs.data].data()[off..off + 4], &[0xff, 0, 0, 0]);
    }

    #[test]
    fn test_string_literal_is_stored_once() {
        let source = "char *p = \"hello\";\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let data = secs[secs.data].data();
        assert_eq!(data.windows(6).filter(|w| *w == b"hello\0").count(), 1);
        assert_eq!(secs.relocations(secs.data).len(), 1);
    }

    #[test]
    fn test_function_bodies_compile() {
        let source = "struct pt { int x, y; };\n\
                      int sum(int *a, int n) { int s = 0; while (n--) s += *a++; return s; }\n\
                      int pick(struct pt *p, int c) { return c ? p->x : (*p).y; }\n\
                      int many(int a, int b, int c, int d, int e, int f, int g, int h) { return a + h; }\n\
                      int main() { int v[3] = {1, 2, 3}; struct pt q = {4, 5}; int (*fp)(int *, int) = sum;\n\
                        q.x += v[1] << 2; ++q.y; return fp(v, 3) + pick(&q, 1) + many(1,2,3,4,5,6,7,8) && 1; }\n";
        let (_, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn test_undeclared_identifier() {
        let (_, result) = compile("int main() { return y; }", &Settings::default());
        assert!(result.unwrap_err().contains("'y' undeclared"));
    }

    #[test]
    fn test_implicit_declaration_compiles() {
        let (secs, result) = compile("int main() { return puts(\"x\"); }", &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        assert_ne!(secs.find_elf_sym(secs.symtab, "puts"), 0);
    }

    #[test]
    fn test_float_rejected() {
        let (_, result) = compile("int main() { return 1.5; }", &Settings::default());
        assert!(result.unwrap_err().contains("floating point types are not supported"));
    }

    #[test]
    fn test_assignment_needs_lvalue() {
        let (_, result) = compile("int main() { int a; 3 = a; return 0; }", &Settings::default());
        assert!(result.unwrap_err().contains("lvalue expected"));
    }

    #[test]
    fn test_const_object_is_read_only() {
        let (_, result) = compile("int main() { const int a = 1; a = 2; return a; }", &Settings::default());
        assert!(result.unwrap_err().contains("assignment of read-only location"));
    }

    #[test]
    fn test_argument_count_checked() {
        let (_, result) = compile("int f(int a);\nint main() { return f(1, 2); }", &Settings::default());
        assert!(result.unwrap_err().contains("too many arguments to function"));
        let (_, result) = compile("int f(int a);\nint main() { return f(); }", &Settings::default());
        assert!(result.unwrap_err().contains("too few arguments to function"));
    }

    #[test]
    fn test_nesting_limit() {
        // deep recursion needs more than the default test thread stack
        let worker = std::thread::Builder::new().stack_size(256 << 20).spawn(|| {
            assert_eq!(int_global(&format!("int x = {}7{};", "(".repeat(200), ")".repeat(200)), "x"), 7);
            assert_eq!(int_global(&format!("int x = {}3;", "- ".repeat(200)), "x"), 3);

            let deep = format!("int x = {}1{};", "(".repeat(2000), ")".repeat(2000));
            let (_, result) = compile(&deep, &Settings::default());
            assert!(result.unwrap_err().contains("expression nested too deeply"));
            let deep = format!("int main() {{ int i; return {}i; }}", "++".repeat(2000));
            let (_, result) = compile(&deep, &Settings::default());
            assert!(result.unwrap_err().contains("expression nested too deeply"));
            let deep = format!("int main() {{ return {}0; }}", "!".repeat(2000));
            let (_, result) = compile(&deep, &Settings::default());
            assert!(result.unwrap_err().contains("expression nested too deeply"));
        });
        worker.unwrap().join().unwrap();
    }
}
