//! `#if` expression evaluation
//!
//! `defined X` and `defined(X)` are resolved before macro expansion; any
//! identifier left afterwards evaluates to 0. Arithmetic is done in
//! `intmax_t`/`uintmax_t` with the usual promotion to unsigned.

use super::intern::Interner;
use super::lexer::{decode_literal, parse_int_literal, Punct, Token, TokenKind};
use super::preprocess::Preprocessor;
use crate::errors::{CResult, Diagnostics, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PpValue {
    value: i64,
    unsigned: bool,
}

impl PpValue {
    fn signed(value: i64) -> Self {
        PpValue {
            value,
            unsigned: false,
        }
    }

    fn truth(self) -> bool {
        self.value != 0
    }
}

impl Preprocessor {
    /// Read, expand and evaluate the rest of an `#if`/`#elif` line.
    pub(crate) fn eval_condition(&mut self, diag: &mut Diagnostics) -> CResult<bool> {
        let raw = self.read_line(diag)?;
        let mut tokens = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            let tok = &raw[i];
            if tok.ident() != Some(self.ids.defined) {
                tokens.push(tok.clone());
                i += 1;
                continue;
            }
            let (name, next) = match raw.get(i + 1) {
                Some(t) if t.is_punct(Punct::LParen) => {
                    let closed = raw.get(i + 3).is_some_and(|t| t.is_punct(Punct::RParen));
                    match raw.get(i + 2).and_then(Token::ident) {
                        Some(id) if closed => (id, i + 4),
                        _ => {
                            return Err(self.error(
                                diag,
                                ErrorKind::Syntax,
                                "missing ')' after \"defined\"",
                            ))
                        }
                    }
                }
                Some(t) => match t.ident() {
                    Some(id) => (id, i + 2),
                    None => {
                        return Err(self.error(
                            diag,
                            ErrorKind::Syntax,
                            "operator \"defined\" requires an identifier",
                        ))
                    }
                },
                None => {
                    return Err(self.error(
                        diag,
                        ErrorKind::Syntax,
                        "operator \"defined\" requires an identifier",
                    ))
                }
            };
            let value = if self.is_defined(name) { "1" } else { "0" };
            let mut replaced = Token::new(TokenKind::Number(value.into()), tok.line);
            replaced.space = tok.space;
            tokens.push(replaced);
            i = next;
        }

        let expanded = self.expand_list(tokens, diag)?;
        if expanded.is_empty() {
            return Err(self.error(diag, ErrorKind::Syntax, "#if with no expression"));
        }
        let mut eval = Evaluator {
            tokens: &expanded,
            pos: 0,
            idents: &self.idents,
            depth: 0,
        };
        let result = eval.expr().and_then(|v| {
            if eval.pos < expanded.len() {
                Err("missing binary operator in #if expression".to_string())
            } else {
                Ok(v)
            }
        });
        match result {
            Ok(value) => Ok(value.truth()),
            Err(msg) => Err(self.error(diag, ErrorKind::Syntax, &msg)),
        }
    }
}

/// Precedence-climbing evaluator over an expanded token list
struct Evaluator<'a> {
    tokens: &'a [Token],
    pos: usize,
    idents: &'a Interner,
    depth: usize,
}

/// Deepest unary or parenthesized nesting in an `#if` expression
const MAX_DEPTH: usize = 256;

fn binary_precedence(p: Punct) -> Option<u8> {
    Some(match p {
        Punct::Star | Punct::Slash | Punct::Percent => 10,
        Punct::Plus | Punct::Minus => 9,
        Punct::Shl | Punct::Shr => 8,
        Punct::Lt | Punct::Gt | Punct::Le | Punct::Ge => 7,
        Punct::EqEq | Punct::NotEq => 6,
        Punct::Amp => 5,
        Punct::Caret => 4,
        Punct::Pipe => 3,
        Punct::AndAnd => 2,
        Punct::OrOr => 1,
        _ => return None,
    })
}

impl<'a> Evaluator<'a> {
    fn peek_punct(&self) -> Option<Punct> {
        match self.tokens.get(self.pos).map(|t| &t.kind) {
            Some(TokenKind::Punct(p)) => Some(*p),
            _ => None,
        }
    }

    fn expect(&mut self, p: Punct) -> Result<(), String> {
        if self.peek_punct() == Some(p) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("'{}' expected in #if expression", p))
        }
    }

    fn expr(&mut self) -> Result<PpValue, String> {
        let cond = self.binary(1)?;
        if self.peek_punct() != Some(Punct::Question) {
            return Ok(cond);
        }
        self.pos += 1;
        let then = self.expr()?;
        self.expect(Punct::Colon)?;
        let otherwise = self.expr()?;
        let unsigned = then.unsigned || otherwise.unsigned;
        let chosen = if cond.truth() { then } else { otherwise };
        Ok(PpValue {
            value: chosen.value,
            unsigned,
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<PpValue, String> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.peek_punct() {
            let Some(prec) = binary_precedence(op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = apply(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<PpValue, String> {
        if self.depth >= MAX_DEPTH {
            return Err("#if expression nested too deeply".to_string());
        }
        self.depth += 1;
        let v = self.unary_operand();
        self.depth -= 1;
        v
    }

    fn unary_operand(&mut self) -> Result<PpValue, String> {
        match self.peek_punct() {
            Some(Punct::Plus) => {
                self.pos += 1;
                self.unary()
            }
            Some(Punct::Minus) => {
                self.pos += 1;
                let v = self.unary()?;
                Ok(PpValue {
                    value: v.value.wrapping_neg(),
                    unsigned: v.unsigned,
                })
            }
            Some(Punct::Tilde) => {
                self.pos += 1;
                let v = self.unary()?;
                Ok(PpValue {
                    value: !v.value,
                    unsigned: v.unsigned,
                })
            }
            Some(Punct::Bang) => {
                self.pos += 1;
                let v = self.unary()?;
                Ok(PpValue::signed(!v.truth() as i64))
            }
            Some(Punct::LParen) => {
                self.pos += 1;
                let v = self.expr()?;
                self.expect(Punct::RParen)?;
                Ok(v)
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<PpValue, String> {
        let Some(tok) = self.tokens.get(self.pos) else {
            return Err("#if expression ends unexpectedly".to_string());
        };
        self.pos += 1;
        match &tok.kind {
            TokenKind::Number(text) => {
                let lit = parse_int_literal(text)
                    .map_err(|_| format!("invalid number '{}' in #if expression", text))?;
                Ok(PpValue {
                    value: lit.value as i64,
                    unsigned: lit.unsigned || lit.value > i64::MAX as u64,
                })
            }
            TokenKind::Char(text) => {
                let (units, wide) = decode_literal(text)?;
                let unit = units.first().copied().unwrap_or(0);
                // plain char is signed
                let value = if wide { unit as i32 as i64 } else { unit as u8 as i8 as i64 };
                Ok(PpValue::signed(value))
            }
            TokenKind::Ident(_) => Ok(PpValue::signed(0)),
            _ => Err(format!(
                "token \"{}\" is not valid in preprocessor expressions",
                tok.spell(self.idents)
            )),
        }
    }
}

fn apply(op: Punct, lhs: PpValue, rhs: PpValue) -> Result<PpValue, String> {
    let unsigned = lhs.unsigned || rhs.unsigned;
    let (a, b) = (lhs.value, rhs.value);
    let (ua, ub) = (a as u64, b as u64);
    let bool_value = |v: bool| PpValue::signed(v as i64);
    let value = match op {
        Punct::AndAnd => return Ok(bool_value(lhs.truth() && rhs.truth())),
        Punct::OrOr => return Ok(bool_value(lhs.truth() || rhs.truth())),
        Punct::EqEq => return Ok(bool_value(a == b)),
        Punct::NotEq => return Ok(bool_value(a != b)),
        Punct::Lt => return Ok(bool_value(if unsigned { ua < ub } else { a < b })),
        Punct::Gt => return Ok(bool_value(if unsigned { ua > ub } else { a > b })),
        Punct::Le => return Ok(bool_value(if unsigned { ua <= ub } else { a <= b })),
        Punct::Ge => return Ok(bool_value(if unsigned { ua >= ub } else { a >= b })),
        Punct::Plus => a.wrapping_add(b),
        Punct::Minus => a.wrapping_sub(b),
        Punct::Star => a.wrapping_mul(b),
        Punct::Slash | Punct::Percent => {
            if b == 0 {
                return Err("division by zero in #if".to_string());
            }
            match (op, unsigned) {
                (Punct::Slash, true) => (ua / ub) as i64,
                (Punct::Slash, false) => a.wrapping_div(b),
                (_, true) => (ua % ub) as i64,
                (_, false) => a.wrapping_rem(b),
            }
        }
        Punct::Shl => a.wrapping_shl(b as u32),
        Punct::Shr if unsigned => (ua.wrapping_shr(b as u32)) as i64,
        Punct::Shr => a.wrapping_shr(b as u32),
        Punct::Amp => a & b,
        Punct::Pipe => a | b,
        Punct::Caret => a ^ b,
        _ => return Err(format!("operator '{}' is not valid in #if", op)),
    };
    Ok(PpValue { value, unsigned })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::buffer::BufferedFile;

    fn eval(expr: &str) -> Result<bool, String> {
        let mut pp = Preprocessor::new();
        let mut diag = Diagnostics::new();
        diag.set_error_func(Box::new(|_| {}));
        pp.define_symbol("TWO", Some("2"), &mut diag).unwrap();
        pp.define_symbol("ADD(a,b)", Some("((a)+(b))"), &mut diag).unwrap();
        let src = format!("{}\n", expr);
        pp.push_file(BufferedFile::from_bytes("t.c", src.as_bytes()), &mut diag)
            .unwrap();
        pp.eval_condition(&mut diag).map_err(|e| e.message)
    }

    #[test]
    fn test_arithmetic_and_macros() {
        assert_eq!(eval("ADD(TWO, 3) == 5"), Ok(true));
        assert_eq!(eval("1 + 2 * 3 == 7 && !0"), Ok(true));
        assert_eq!(eval("(1 ? 0 : 1)"), Ok(false));
        assert_eq!(eval("-1 < 0"), Ok(true));
        assert_eq!(eval("-1 < 0u"), Ok(false));
        assert_eq!(eval("'A' == 65"), Ok(true));
    }

    #[test]
    fn test_defined_and_unknown_identifiers() {
        assert_eq!(eval("defined TWO && defined(ADD)"), Ok(true));
        assert_eq!(eval("defined NOPE || UNKNOWN"), Ok(false));
    }

    #[test]
    fn test_errors() {
        assert!(eval("1 / 0").unwrap_err().contains("division by zero"));
        assert!(eval("1 2").is_err());
        assert!(eval("(1").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let shallow = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval(&shallow), Ok(true));
        let deep = format!("{}1{}", "(".repeat(5000), ")".repeat(5000));
        assert!(eval(&deep).unwrap_err().contains("nested too deeply"));
        assert!(eval(&"!".repeat(5000)).unwrap_err().contains("nested too deeply"));
    }
}
