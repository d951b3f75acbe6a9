//! Value stack and code generation
//!
//! The parser pushes one [`SValue`] per operand it recognizes and calls the
//! generators here to combine them; machine code is appended to the current
//! text section as soon as a value has to be materialized. Everything goes
//! through the [`Emit`] trait, which is the only place bytes and relocations
//! enter a section.
//!
//! # Register discipline
//!
//! - At most one vstack entry lives in `rax` ([`Loc::Reg`])
//! - Before another value is loaded, that entry is pushed on the machine
//!   stack and becomes [`Loc::Spilled`]; spills are consumed in LIFO order
//! - Integer values in registers are always the 64-bit extension of their
//!   C type, so conversions only emit code when the target is narrower or
//!   changes signedness
//!
//! While `nocode` is set (`sizeof`, constant expressions, the dead side of
//! `0 && x`), values are still tracked but nothing is emitted.

pub mod bind;
pub mod x86_64;

use crate::elf::{ByteSink, R_X86_64_GOTPCREL, R_X86_64_PC32, SHN_ABS, SHN_UNDEF};
use crate::errors::{CResult, ErrorKind};
use crate::parser::parse::Parser;
use crate::symbols::types::{canonical_value, size_align, CType};
use crate::symbols::SymId;
use x86_64::{self as x86, Alu, Cond, Mem, Reg, Shift, ARG_REGS};

/// Largest stack frame of one function, in bytes
const MAX_FRAME_SIZE: i64 = 1 << 30;

/// Sink for generated code. The parser implements it on top of the current
/// text section; tests use a plain buffer.
pub trait Emit {
    /// Current write offset
    fn ind(&self) -> usize;
    fn emit(&mut self, bytes: &[u8]);
    /// Overwrite the 32-bit field at `at`
    fn patch32(&mut self, at: usize, value: i64);
    /// Record a relocation against ELF symbol `elf_sym` at `offset`
    fn reloc(&mut self, offset: usize, r_type: u32, elf_sym: usize, addend: i64);
}

/// Where a vstack value is. With `lval` set the value is the object stored
/// at the described address instead of the address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// Integer constant, or an absolute address
    Const(i64),
    /// `rbp + offset`
    Local(i32),
    /// Address of a symbol plus a byte offset
    Sym { sym: SymId, addend: i64 },
    /// In `rax`
    Reg,
    /// Pushed on the machine stack
    Spilled,
    /// Address stored in the frame slot at `rbp + offset`
    Indirect(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SValue {
    pub ty: CType,
    pub loc: Loc,
    pub lval: bool,
}

impl SValue {
    pub fn new(ty: CType, loc: Loc, lval: bool) -> Self {
        SValue { ty, loc, lval }
    }

    pub fn constant(ty: CType, value: i64) -> Self {
        SValue::new(ty, Loc::Const(value), false)
    }

    pub fn const_value(&self) -> Option<i64> {
        match (self.lval, self.loc) {
            (false, Loc::Const(v)) => Some(v),
            _ => None,
        }
    }

    /// Address of a symbol, fixed at link time
    pub fn is_addr_const(&self) -> bool {
        !self.lval && matches!(self.loc, Loc::Sym { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    fn cond(self, unsigned: bool) -> Cond {
        match (self, unsigned) {
            (BinOp::Eq, _) => Cond::E,
            (BinOp::Ne, _) => Cond::Ne,
            (BinOp::Lt, false) => Cond::L,
            (BinOp::Lt, true) => Cond::B,
            (BinOp::Le, false) => Cond::Le,
            (BinOp::Le, true) => Cond::Be,
            (BinOp::Gt, false) => Cond::G,
            (BinOp::Gt, true) => Cond::A,
            (BinOp::Ge, false) => Cond::Ge,
            _ => Cond::Ae,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    BitNot,
    LogNot,
}

/// How a call reaches its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// `call sym` through a PLT32 relocation
    Direct(SymId),
    /// Function address pushed below the arguments
    Indirect,
}

/// Per-function code generation state
#[derive(Debug, Clone)]
pub struct FuncState {
    pub sym: SymId,
    pub ret: CType,
    /// Offset of the 32-bit frame size in the prologue
    pub frame_patch: usize,
    /// Jumps to the epilogue
    pub returns: Vec<usize>,
    pub is_main: bool,
}

/// Fold a binary operation on canonical 64-bit values.
fn fold(op: BinOp, a: i64, b: i64, unsigned: bool) -> i64 {
    let (ua, ub) = (a as u64, b as u64);
    let flag = |v: bool| v as i64;
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div if unsigned => (ua / ub) as i64,
        BinOp::Div => a.wrapping_div(b),
        BinOp::Mod if unsigned => (ua % ub) as i64,
        BinOp::Mod => a.wrapping_rem(b),
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr if unsigned => ua.wrapping_shr(b as u32) as i64,
        BinOp::Shr => a.wrapping_shr(b as u32),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Eq => flag(a == b),
        BinOp::Ne => flag(a != b),
        BinOp::Lt => flag(if unsigned { ua < ub } else { a < b }),
        BinOp::Le => flag(if unsigned { ua <= ub } else { a <= b }),
        BinOp::Gt => flag(if unsigned { ua > ub } else { a > b }),
        BinOp::Ge => flag(if unsigned { ua >= ub } else { a >= b }),
    }
}

/// Whether a register holding a `from` value needs re-extension to hold
/// the same value as `to`.
fn needs_extend(from: &CType, to: &CType) -> bool {
    let (wt, st) = to.width();
    let (wf, sf) = from.width();
    wt < 8 && (wt < wf || (wt == wf && sf != st) || (sf && !st))
}

impl Emit for Parser<'_> {
    fn ind(&self) -> usize {
        self.secs[self.cur_text].offset()
    }

    fn emit(&mut self, bytes: &[u8]) {
        if self.nocode {
            return;
        }
        let text = self.cur_text;
        self.secs[text].append(bytes);
    }

    fn patch32(&mut self, at: usize, value: i64) {
        if self.nocode {
            return;
        }
        let text = self.cur_text;
        self.secs[text].patch(at, &(value as i32).to_le_bytes());
    }

    fn reloc(&mut self, offset: usize, r_type: u32, elf_sym: usize, addend: i64) {
        if self.nocode {
            return;
        }
        let (symtab, text) = (self.secs.symtab, self.cur_text);
        self.secs
            .put_elf_reloc(symtab, text, offset as u64, r_type, elf_sym, addend);
    }
}

impl<'a> Parser<'a> {
    // ---- vstack primitives ----

    pub(crate) fn vpush(&mut self, sv: SValue) {
        self.vstack.push(sv);
    }

    pub(crate) fn vpush_const(&mut self, ty: CType, value: i64) {
        let value = canonical_value(&ty, value);
        self.vpush(SValue::constant(ty, value));
    }

    pub(crate) fn vtop(&self) -> &SValue {
        &self.vstack[self.vstack.len() - 1]
    }

    pub(crate) fn vtop_mut(&mut self) -> &mut SValue {
        let n = self.vstack.len();
        &mut self.vstack[n - 1]
    }

    /// Discard the top value, dropping its machine stack slot if spilled.
    pub(crate) fn vpop(&mut self) {
        if let Some(sv) = self.vstack.pop() {
            if sv.loc == Loc::Spilled {
                self.pop_reg(Reg::R11);
            }
        }
    }

    /// Duplicate the top value. Only valid for values that do not live in a
    /// register or on the machine stack.
    pub(crate) fn vdup(&mut self) {
        let top = self.vtop().clone();
        self.vpush(top);
    }

    fn push_reg(&mut self, r: Reg) {
        if self.nocode {
            return;
        }
        x86::push(self, r);
        self.stack_depth += 8;
    }

    fn pop_reg(&mut self, r: Reg) {
        if self.nocode {
            return;
        }
        x86::pop(self, r);
        self.stack_depth -= 8;
    }

    /// Push the register-resident entry, if any, except the ones in `keep`.
    fn spill_except(&mut self, keep: &[usize]) {
        if self.nocode {
            return;
        }
        if let Some(i) = self.vstack.iter().rposition(|v| v.loc == Loc::Reg) {
            if !keep.contains(&i) {
                self.push_reg(Reg::Rax);
                self.vstack[i].loc = Loc::Spilled;
            }
        }
    }

    /// Free `rax`, e.g. before a call.
    pub(crate) fn spill_reg(&mut self) {
        self.spill_except(&[]);
    }

    /// Reserve a frame slot and return its offset from `rbp`.
    pub(crate) fn alloc_local(&mut self, size: u64, align: u64) -> CResult<i32> {
        let align = i64::try_from(align.max(1)).unwrap_or(i64::MAX);
        let bottom = i64::try_from(size)
            .ok()
            .and_then(|size| size.checked_sub(self.loc as i64))
            .and_then(|bottom| bottom.checked_add(align - 1))
            .map(|bottom| bottom / align * align)
            .filter(|&bottom| bottom <= MAX_FRAME_SIZE);
        match bottom {
            Some(bottom) => {
                self.loc = -(bottom as i32);
                Ok(self.loc)
            }
            None => Err(self.error(ErrorKind::Semantic, "stack frame too large")),
        }
    }

    /// An 8-byte temporary frame slot.
    pub(crate) fn alloc_slot(&mut self) -> i32 {
        self.loc = self.loc.saturating_sub(8) & !7;
        self.loc
    }

    // ---- materializing values ----

    /// Defined in this output; absolute symbols may be anywhere in the
    /// address space and go through the GOT.
    fn is_direct(&self, elf_sym: usize) -> bool {
        let shndx = self.secs.elf_sym(self.secs.symtab, elf_sym).st_shndx;
        shndx != SHN_UNDEF && shndx != SHN_ABS
    }

    /// Address of `sym + addend` into `dst`.
    fn sym_address(&mut self, dst: Reg, sym: SymId, addend: i64) {
        let elf_sym = self.elf_sym_of(sym);
        if self.is_direct(elf_sym) {
            let mem = Mem::Rip {
                elf_sym,
                addend,
                r_type: R_X86_64_PC32,
            };
            x86::lea(self, dst, &mem);
        } else {
            let got = Mem::Rip {
                elf_sym,
                addend: 0,
                r_type: R_X86_64_GOTPCREL,
            };
            x86::load(self, dst, &got, 8, false);
            if addend != 0 {
                x86::lea(self, dst, &Mem::Base(dst, addend as i32));
            }
        }
    }

    /// Memory operand for the object an lvalue designates. May use `r11`.
    fn lval_mem(&mut self, loc: Loc) -> Mem {
        match loc {
            Loc::Local(off) => Mem::Frame(off),
            Loc::Const(addr) => {
                x86::mov_imm(self, Reg::R11, addr);
                Mem::Base(Reg::R11, 0)
            }
            Loc::Sym { sym, addend } => {
                let elf_sym = self.elf_sym_of(sym);
                if self.is_direct(elf_sym) {
                    Mem::Rip {
                        elf_sym,
                        addend,
                        r_type: R_X86_64_PC32,
                    }
                } else {
                    let got = Mem::Rip {
                        elf_sym,
                        addend: 0,
                        r_type: R_X86_64_GOTPCREL,
                    };
                    x86::load(self, Reg::R11, &got, 8, false);
                    Mem::Base(Reg::R11, addend as i32)
                }
            }
            Loc::Reg => Mem::Base(Reg::Rax, 0),
            Loc::Spilled => {
                self.pop_reg(Reg::R11);
                Mem::Base(Reg::R11, 0)
            }
            Loc::Indirect(off) => {
                x86::load(self, Reg::R11, &Mem::Frame(off), 8, false);
                Mem::Base(Reg::R11, 0)
            }
        }
    }

    /// The address a location describes, into `dst`.
    fn addr_to(&mut self, dst: Reg, loc: Loc) {
        match loc {
            Loc::Const(v) => x86::mov_imm(self, dst, v),
            Loc::Local(off) => x86::lea(self, dst, &Mem::Frame(off)),
            Loc::Sym { sym, addend } => self.sym_address(dst, sym, addend),
            Loc::Reg => x86::mov_rr(self, dst, Reg::Rax),
            Loc::Spilled => self.pop_reg(dst),
            Loc::Indirect(off) => x86::load(self, dst, &Mem::Frame(off), 8, false),
        }
    }

    /// Load a value into `dst`. Aggregates load as their address.
    fn load_to(&mut self, dst: Reg, sv: &SValue) {
        if sv.lval && !sv.ty.is_aggregate() {
            let mem = self.lval_mem(sv.loc);
            let (width, signed) = sv.ty.width();
            x86::load(self, dst, &mem, width, signed);
        } else {
            self.addr_to(dst, sv.loc);
        }
    }

    /// Bring the top value into `rax`.
    pub(crate) fn gv(&mut self) {
        let top = self.vstack.len() - 1;
        let sv = self.vstack[top].clone();
        let aggregate = sv.ty.is_aggregate();
        if sv.loc == Loc::Reg && (!sv.lval || aggregate) {
            return;
        }
        self.spill_except(&[top]);
        self.load_to(Reg::Rax, &sv);
        let entry = &mut self.vstack[top];
        entry.loc = Loc::Reg;
        entry.lval = sv.lval && aggregate;
    }

    /// Right operand into `rcx`, left operand into `rax`.
    fn gv2(&mut self) {
        let n = self.vstack.len();
        let (l, r) = (n - 2, n - 1);
        self.spill_except(&[l, r]);
        let rhs = self.vstack[r].clone();
        if rhs.loc == Loc::Reg && !rhs.lval {
            x86::mov_rr(self, Reg::Rcx, Reg::Rax);
        } else {
            self.load_to(Reg::Rcx, &rhs);
        }
        let lhs = self.vstack[l].clone();
        if lhs.loc != Loc::Reg || lhs.lval {
            self.load_to(Reg::Rax, &lhs);
        }
        // both are consumed now
        self.vstack[r].loc = Loc::Reg;
        self.vstack[l].loc = Loc::Reg;
        self.vstack[l].lval = false;
    }

    fn convert_reg(&mut self, reg: Reg, from: &CType, to: &CType) {
        if needs_extend(from, to) {
            let (width, signed) = to.width();
            x86::extend(self, reg, width, signed);
        }
    }

    fn decay_at(&mut self, i: usize) {
        let sv = &mut self.vstack[i];
        if sv.lval && (sv.ty.is_array() || sv.ty.is_func()) {
            sv.ty = sv.ty.decay();
            sv.lval = false;
        }
    }

    /// Array and function designators become pointer rvalues.
    pub(crate) fn rvalue(&mut self) {
        let n = self.vstack.len();
        self.decay_at(n - 1);
    }

    pub(crate) fn elem_size(&mut self, ptr: &CType) -> CResult<i64> {
        let Some(elem) = ptr.pointee() else {
            return Err(self.error(ErrorKind::Semantic, "pointer expected"));
        };
        if elem.is_func() {
            return Ok(1);
        }
        match size_align(elem, &self.syms.structs) {
            Some((size, _)) => Ok(size as i64),
            None => Err(self.error(ErrorKind::Semantic, "unknown type size")),
        }
    }

    // ---- conversions and operators ----

    /// Convert the top value to `to`.
    pub(crate) fn gen_cast(&mut self, to: &CType) -> CResult<()> {
        if to.is_void() {
            let top = self.vtop_mut();
            top.ty = CType::void();
            top.lval = top.lval && top.loc == Loc::Spilled;
            return Ok(());
        }
        self.rvalue();
        let from = self.vtop().ty.clone();
        if to.is_float() || from.is_float() {
            return Err(self.error(ErrorKind::Semantic, "floating point types are not supported"));
        }
        if to.is_struct() || from.is_struct() {
            if to.struct_id() == from.struct_id() {
                self.vtop_mut().ty = to.clone();
                return Ok(());
            }
            return Err(self.error(ErrorKind::Semantic, "cannot convert struct value"));
        }
        if from.is_void() {
            return Err(self.error(ErrorKind::Semantic, "void value not ignored as it ought to be"));
        }
        if !to.is_scalar() {
            return Err(self.error(ErrorKind::Semantic, "cast to non-scalar type"));
        }

        if let Some(v) = self.vtop().const_value() {
            let value = if to.is_integer() { canonical_value(to, v) } else { v };
            *self.vtop_mut() = SValue::constant(to.clone(), value);
            return Ok(());
        }
        let top = self.vtop().clone();
        let keeps_address = !top.lval && matches!(top.loc, Loc::Sym { .. } | Loc::Local(_));
        if keeps_address && to.width().0 == 8 && !to.is_bool() {
            self.vtop_mut().ty = to.clone();
            return Ok(());
        }
        if to.is_bool() {
            self.gv();
            x86::test_rax(self);
            x86::setcc(self, Cond::Ne);
        } else if top.lval || needs_extend(&from, to) {
            self.gv();
            self.convert_reg(Reg::Rax, &from, to);
        }
        let top = self.vtop_mut();
        top.ty = to.clone();
        top.lval = false;
        Ok(())
    }

    pub(crate) fn gen_op(&mut self, op: BinOp) -> CResult<()> {
        let n = self.vstack.len();
        self.decay_at(n - 1);
        self.decay_at(n - 2);
        let lt = self.vstack[n - 2].ty.clone();
        let rt = self.vstack[n - 1].ty.clone();
        if lt.is_float() || rt.is_float() {
            return Err(self.error(ErrorKind::Semantic, "floating point types are not supported"));
        }
        if !lt.is_scalar() || !rt.is_scalar() {
            return Err(self.error(ErrorKind::Semantic, "invalid operand types for binary operation"));
        }
        match (lt.is_pointer(), rt.is_pointer()) {
            (true, true) if op == BinOp::Sub => {
                let size = self.elem_size(&lt)?;
                self.int_op(op, &CType::long(), &CType::long(), (1, 1))?;
                if size > 1 {
                    self.vpush_const(CType::long(), size);
                    self.int_op(BinOp::Div, &CType::long(), &CType::long(), (1, 1))?;
                }
                Ok(())
            }
            (true, false) if matches!(op, BinOp::Add | BinOp::Sub) => {
                let size = self.elem_size(&lt)?;
                self.int_op(op, &CType::long(), &lt, (1, size))
            }
            (false, true) if op == BinOp::Add => {
                let size = self.elem_size(&rt)?;
                self.int_op(op, &CType::long(), &rt, (size, 1))
            }
            (true, _) | (_, true) if op.is_comparison() => {
                self.int_op(op, &CType::ulong(), &CType::int(), (1, 1))
            }
            (false, false) => {
                let (common, result) = match op {
                    BinOp::Shl | BinOp::Shr => (lt.promote(), lt.promote()),
                    _ if op.is_comparison() => (crate::symbols::types::common_int_type(&lt, &rt), CType::int()),
                    _ => {
                        let c = crate::symbols::types::common_int_type(&lt, &rt);
                        (c.clone(), c)
                    }
                };
                self.int_op(op, &common, &result, (1, 1))
            }
            _ => Err(self.error(ErrorKind::Semantic, "invalid operand types for binary operation")),
        }
    }

    /// Integer operation on the top two values, computed in `common` and
    /// producing `result`. `scale` multiplies the (left, right) operands
    /// first, for pointer arithmetic.
    fn int_op(&mut self, op: BinOp, common: &CType, result: &CType, scale: (i64, i64)) -> CResult<()> {
        let n = self.vstack.len();
        let (l, r) = (n - 2, n - 1);
        let shift = matches!(op, BinOp::Shl | BinOp::Shr);
        let lt = self.vstack[l].ty.clone();
        let rt = self.vstack[r].ty.clone();
        for (i, factor) in [(l, scale.0), (r, scale.1)] {
            if factor != 1 {
                if let Some(v) = self.vstack[i].const_value() {
                    self.vstack[i] = SValue::constant(CType::long(), v.wrapping_mul(factor));
                }
            }
        }
        let lc = self.vstack[l].const_value();
        let rc = self.vstack[r].const_value();

        if let (Some(a), Some(b)) = (lc, rc) {
            let a = canonical_value(common, a);
            let b = if shift { b } else { canonical_value(common, b) };
            if matches!(op, BinOp::Div | BinOp::Mod) && b == 0 {
                self.warning("division by zero");
            } else {
                let v = fold(op, a, b, common.is_unsigned());
                self.vstack.truncate(l);
                self.vpush_const(result.clone(), v);
                return Ok(());
            }
        }

        // symbol or frame address plus a constant
        if matches!(op, BinOp::Add | BinOp::Sub) {
            let lhs = self.vstack[l].clone();
            if let (Some(b), false) = (rc, lhs.lval) {
                let b = if op == BinOp::Sub { b.wrapping_neg() } else { b };
                let folded = match lhs.loc {
                    Loc::Sym { sym, addend } => Some(Loc::Sym {
                        sym,
                        addend: addend.wrapping_add(b),
                    }),
                    Loc::Local(off) => i32::try_from(off as i64 + b).ok().map(Loc::Local),
                    _ => None,
                };
                if let Some(loc) = folded {
                    self.vstack.truncate(r);
                    self.vstack[l] = SValue::new(result.clone(), loc, false);
                    return Ok(());
                }
            }
            let rhs = self.vstack[r].clone();
            if let (Some(a), false, BinOp::Add) = (lc, rhs.lval, op) {
                if let Loc::Sym { sym, addend } = rhs.loc {
                    self.vstack.truncate(l);
                    let loc = Loc::Sym {
                        sym,
                        addend: addend.wrapping_add(a),
                    };
                    self.vpush(SValue::new(result.clone(), loc, false));
                    return Ok(());
                }
            }
        }

        self.gv2();
        if scale.0 != 1 && lc.is_none() {
            x86::imul_imm(self, Reg::Rax, scale.0 as i32);
        }
        if scale.1 != 1 && rc.is_none() {
            x86::imul_imm(self, Reg::Rcx, scale.1 as i32);
        }
        self.convert_reg(Reg::Rax, &lt, common);
        if !shift {
            self.convert_reg(Reg::Rcx, &rt, common);
        }
        let unsigned = common.is_unsigned();
        match op {
            BinOp::Add => x86::alu_rr(self, Alu::Add, Reg::Rax, Reg::Rcx),
            BinOp::Sub => x86::alu_rr(self, Alu::Sub, Reg::Rax, Reg::Rcx),
            BinOp::And => x86::alu_rr(self, Alu::And, Reg::Rax, Reg::Rcx),
            BinOp::Or => x86::alu_rr(self, Alu::Or, Reg::Rax, Reg::Rcx),
            BinOp::Xor => x86::alu_rr(self, Alu::Xor, Reg::Rax, Reg::Rcx),
            BinOp::Mul => x86::imul(self, Reg::Rax, Reg::Rcx),
            BinOp::Div => x86::div_rcx(self, !unsigned),
            BinOp::Mod => {
                x86::div_rcx(self, !unsigned);
                x86::mov_rr(self, Reg::Rax, Reg::Rdx);
            }
            BinOp::Shl => x86::shift_cl(self, Shift::Shl),
            BinOp::Shr if unsigned => x86::shift_cl(self, Shift::Shr),
            BinOp::Shr => x86::shift_cl(self, Shift::Sar),
            _ => {
                x86::alu_rr(self, Alu::Cmp, Reg::Rax, Reg::Rcx);
                x86::setcc(self, op.cond(unsigned));
            }
        }
        if !op.is_comparison() {
            self.convert_reg(Reg::Rax, &CType::long(), result);
        }
        self.vstack.truncate(r);
        self.vstack[l] = SValue::new(result.clone(), Loc::Reg, false);
        Ok(())
    }

    pub(crate) fn gen_unary(&mut self, op: UnOp) -> CResult<()> {
        self.rvalue();
        let ty = self.vtop().ty.clone();
        if ty.is_float() {
            return Err(self.error(ErrorKind::Semantic, "floating point types are not supported"));
        }
        if op == UnOp::LogNot {
            if !ty.is_scalar() {
                return Err(self.error(ErrorKind::Semantic, "invalid operand type for '!'"));
            }
            let known = match self.vtop().const_value() {
                Some(v) => Some(v == 0),
                None if self.vtop().is_addr_const() => Some(false),
                None => None,
            };
            if let Some(result) = known {
                self.vpop();
                self.vpush_const(CType::int(), result as i64);
                return Ok(());
            }
            self.gv();
            x86::test_rax(self);
            x86::setcc(self, Cond::E);
            *self.vtop_mut() = SValue::new(CType::int(), Loc::Reg, false);
            return Ok(());
        }
        if !ty.is_integer() {
            return Err(self.error(ErrorKind::Semantic, "invalid operand type for unary operator"));
        }
        let result = ty.promote();
        if let Some(v) = self.vtop().const_value() {
            let v = if op == UnOp::Neg { v.wrapping_neg() } else { !v };
            self.vpop();
            self.vpush_const(result, v);
            return Ok(());
        }
        self.gv();
        self.convert_reg(Reg::Rax, &ty, &result);
        if op == UnOp::Neg {
            x86::neg(self);
        } else {
            x86::not(self);
        }
        self.convert_reg(Reg::Rax, &CType::long(), &result);
        *self.vtop_mut() = SValue::new(result, Loc::Reg, false);
        Ok(())
    }

    /// Store the top value into the lvalue below it; the stored value
    /// replaces both.
    pub(crate) fn vstore(&mut self) -> CResult<()> {
        let n = self.vstack.len();
        let dst = self.vstack[n - 2].clone();
        if !dst.lval || dst.ty.is_array() || dst.ty.is_func() {
            return Err(self.error(ErrorKind::Semantic, "lvalue expected"));
        }
        if dst.ty.is_const {
            return Err(self.error(ErrorKind::Semantic, "assignment of read-only location"));
        }

        if let Some(id) = dst.ty.struct_id() {
            if self.vtop().ty.struct_id() != Some(id) {
                return Err(self.error(ErrorKind::Semantic, "incompatible types in assignment"));
            }
            let size = self.syms.struct_def(id).size;
            self.gv();
            x86::mov_rr(self, Reg::Rsi, Reg::Rax);
            let dst_loc = self.vstack[n - 2].loc;
            self.addr_to(Reg::Rdi, dst_loc);
            x86::mov_imm(self, Reg::Rcx, size as i64);
            x86::rep_movsb(self);
            self.vstack.truncate(n - 2);
            self.vpush(SValue::new(dst.ty.unqualified(), Loc::Reg, true));
            return Ok(());
        }

        let ty = dst.ty.unqualified();
        self.gen_cast(&ty)?;
        self.gv();
        let dst_loc = self.vstack[n - 2].loc;
        let mem = self.lval_mem(dst_loc);
        x86::store(self, Reg::Rax, &mem, ty.width().0);
        self.vstack.truncate(n - 2);
        self.vpush(SValue::new(ty, Loc::Reg, false));
        Ok(())
    }

    /// Move an lvalue whose address is in a register or on the machine stack
    /// into a frame slot, so it can be read and written again.
    pub(crate) fn make_stable_lval(&mut self) {
        let loc = self.vtop().loc;
        if !matches!(loc, Loc::Reg | Loc::Spilled) {
            return;
        }
        self.addr_to(Reg::Rax, loc);
        let off = self.alloc_slot();
        x86::store(self, Reg::Rax, &Mem::Frame(off), 8);
        self.vtop_mut().loc = Loc::Indirect(off);
    }

    /// `x++` / `x--`: leaves the old value.
    pub(crate) fn gen_post_inc(&mut self, inc: bool) -> CResult<()> {
        let top = self.vtop().clone();
        if !top.lval || !top.ty.is_scalar() {
            return Err(self.error(ErrorKind::Semantic, "lvalue expected"));
        }
        if top.ty.is_const {
            return Err(self.error(ErrorKind::Semantic, "assignment of read-only location"));
        }
        let step = if top.ty.is_pointer() {
            self.elem_size(&top.ty)?
        } else {
            1
        };
        let delta = if inc { step } else { -step };
        self.make_stable_lval();
        self.vdup();
        self.gv();
        let n = self.vstack.len();
        let lv = self.vstack[n - 2].clone();
        if lv.ty.is_bool() {
            x86::mov_imm(self, Reg::Rcx, inc as i64);
        } else {
            x86::lea(self, Reg::Rcx, &Mem::Base(Reg::Rax, delta as i32));
        }
        let mem = self.lval_mem(lv.loc);
        x86::store(self, Reg::Rcx, &mem, lv.ty.width().0);
        self.vstack.remove(n - 2);
        self.vtop_mut().ty = lv.ty.unqualified();
        Ok(())
    }

    /// Select a member at `offset` of the struct lvalue on top.
    pub(crate) fn gen_member(&mut self, offset: u64, ty: CType) {
        let off = offset as i64;
        let loc = match self.vtop().loc {
            Loc::Local(o) => Some(Loc::Local(o + off as i32)),
            Loc::Sym { sym, addend } => Some(Loc::Sym {
                sym,
                addend: addend + off,
            }),
            Loc::Const(a) => Some(Loc::Const(a + off)),
            _ => None,
        };
        match loc {
            Some(loc) => self.vtop_mut().loc = loc,
            None => {
                self.gv();
                if off != 0 {
                    x86::alu_rax_imm(self, Alu::Add, off as i32);
                }
            }
        }
        let parent_const = self.vtop().ty.is_const;
        let top = self.vtop_mut();
        top.ty = ty;
        top.ty.is_const |= parent_const;
        top.lval = true;
    }

    /// `*p`
    pub(crate) fn gen_deref(&mut self) -> CResult<()> {
        self.rvalue();
        let ty = self.vtop().ty.clone();
        let Some(pointee) = ty.pointee().cloned() else {
            return Err(self.error(ErrorKind::Semantic, "pointer expected"));
        };
        if pointee.is_void() {
            return Err(self.error(ErrorKind::Semantic, "dereferencing void pointer"));
        }
        if self.vtop().lval {
            self.gv();
        }
        let top = self.vtop_mut();
        top.ty = pointee;
        top.lval = true;
        Ok(())
    }

    /// `&x`
    pub(crate) fn gen_addr(&mut self) -> CResult<()> {
        if !self.vtop().lval {
            return Err(self.error(ErrorKind::Semantic, "lvalue expected"));
        }
        let top = self.vtop_mut();
        top.ty = top.ty.clone().pointer_to();
        top.lval = false;
        Ok(())
    }

    // ---- jumps ----

    /// Forward jump to be patched with [`Parser::gsym`].
    pub(crate) fn gjmp(&mut self) -> Option<usize> {
        if self.nocode {
            None
        } else {
            Some(x86::jmp(self))
        }
    }

    fn gjcc(&mut self, cond: Cond) -> Option<usize> {
        if self.nocode {
            None
        } else {
            Some(x86::jcc(self, cond))
        }
    }

    /// Backward jump to `addr`.
    pub(crate) fn gjmp_to(&mut self, addr: usize) {
        if let Some(at) = self.gjmp() {
            x86::patch_jump(self, at, addr);
        }
    }

    /// Resolve pending jumps to the current position.
    pub(crate) fn gsym(&mut self, list: impl IntoIterator<Item = usize>) {
        let here = self.ind();
        self.gsym_to(list, here);
    }

    pub(crate) fn gsym_to(&mut self, list: impl IntoIterator<Item = usize>, addr: usize) {
        for at in list {
            x86::patch_jump(self, at, addr);
        }
    }

    /// Pop the top value and jump when its truth equals `jump_if_true`.
    /// Constant conditions give an unconditional jump or none.
    pub(crate) fn gtst(&mut self, jump_if_true: bool) -> CResult<Option<usize>> {
        self.rvalue();
        let top = self.vtop().clone();
        if !top.ty.is_scalar() {
            let msg = if top.ty.is_float() {
                "floating point types are not supported"
            } else {
                "scalar type expected"
            };
            return Err(self.error(ErrorKind::Semantic, msg));
        }
        let known = match top.const_value() {
            Some(v) => Some(v != 0),
            None if top.is_addr_const() => Some(true),
            None if !top.lval && matches!(top.loc, Loc::Local(_)) => Some(true),
            None => None,
        };
        if let Some(truth) = known {
            self.vpop();
            return Ok(if truth == jump_if_true { self.gjmp() } else { None });
        }
        self.gv();
        x86::test_rax(self);
        self.vpop();
        Ok(self.gjcc(if jump_if_true { Cond::Ne } else { Cond::E }))
    }

    /// Result of a short-circuit chain: `fall` when control falls through,
    /// the opposite when it arrives through one of `jumps`.
    pub(crate) fn gen_bool_result(&mut self, jumps: Vec<usize>, fall: bool) {
        self.spill_reg();
        x86::mov_imm(self, Reg::Rax, fall as i64);
        let end = self.gjmp();
        self.gsym(jumps);
        x86::mov_imm(self, Reg::Rax, !fall as i64);
        self.gsym(end);
        self.vpush(SValue::new(CType::int(), Loc::Reg, false));
    }

    /// Compare `rax` with `value` and jump to `target` when `cond` holds.
    pub(crate) fn gen_case_test(&mut self, value: i64, cond: Cond) -> Option<usize> {
        match i32::try_from(value) {
            Ok(imm) => x86::alu_rax_imm(self, Alu::Cmp, imm),
            Err(_) => {
                x86::mov_imm(self, Reg::Rcx, value);
                x86::alu_rr(self, Alu::Cmp, Reg::Rax, Reg::Rcx);
            }
        }
        self.gjcc(cond)
    }

    /// Load an 8-byte frame slot into `rax`.
    pub(crate) fn load_slot(&mut self, off: i32) {
        x86::load(self, Reg::Rax, &Mem::Frame(off), 8, false);
    }

    /// Store `rax` into an 8-byte frame slot.
    pub(crate) fn store_slot(&mut self, off: i32) {
        x86::store(self, Reg::Rax, &Mem::Frame(off), 8);
    }

    // ---- calls and functions ----

    /// Emit a call. The `nargs` argument values have already been pushed on
    /// the machine stack in order, above the function address when the call
    /// is indirect.
    pub(crate) fn gen_call(&mut self, callee: Callee, nargs: usize, ret: &CType) {
        let nreg = nargs.min(ARG_REGS.len());
        let nstack = nargs - nreg;
        let depth = self.stack_depth as usize;
        let pad = (16 - (depth + nstack * 8) % 16) % 16;
        let area = (pad + nstack * 8) as i32;
        x86::sub_rsp(self, area);
        let arg_slot = |i: usize| area + 8 * (nargs - 1 - i) as i32;
        for j in 0..nstack {
            let from = Mem::Stack(arg_slot(nreg + j));
            x86::load(self, Reg::Rax, &from, 8, false);
            x86::store(self, Reg::Rax, &Mem::Stack(8 * j as i32), 8);
        }
        for (i, &reg) in ARG_REGS.iter().enumerate().take(nreg) {
            x86::load(self, reg, &Mem::Stack(arg_slot(i)), 8, false);
        }
        x86::clear_eax(self);
        let mut popped = area + 8 * nargs as i32;
        match callee {
            Callee::Direct(sym) => {
                let elf_sym = self.elf_sym_of(sym);
                x86::call_sym(self, elf_sym);
            }
            Callee::Indirect => {
                let at = Mem::Stack(area + 8 * nargs as i32);
                x86::load(self, Reg::R11, &at, 8, false);
                x86::call_r11(self);
                popped += 8;
            }
        }
        x86::add_rsp(self, popped);
        if !self.nocode {
            self.stack_depth -= popped - area;
        }
        if ret.is_void() {
            self.vpush(SValue::constant(CType::void(), 0));
        } else {
            let (width, signed) = ret.width();
            if ret.is_bool() {
                x86::extend(self, Reg::Rax, 1, false);
            } else {
                x86::extend(self, Reg::Rax, width, signed);
            }
            self.vpush(SValue::new(ret.unqualified(), Loc::Reg, false));
        }
    }

    /// Push the value in `rax` as an outgoing argument.
    pub(crate) fn gen_push_arg(&mut self) {
        self.gv();
        self.push_reg(Reg::Rax);
        self.vstack.pop();
    }

    /// Push the function address for an indirect call.
    pub(crate) fn gen_push_callee(&mut self) {
        self.gen_push_arg();
    }

    /// `push rbp; mov rbp, rsp; sub rsp, N` with N patched by
    /// [`Parser::gen_epilogue`].
    pub(crate) fn gen_prologue(&mut self) -> usize {
        self.loc = 0;
        self.stack_depth = 0;
        x86::prologue(self)
    }

    /// Spill register argument `index` to a fresh frame slot.
    pub(crate) fn gen_store_param(&mut self, index: usize, ty: &CType, size: u64, align: u64) -> CResult<i32> {
        let off = self.alloc_local(size.max(1), align)?;
        let width = ty.width().0;
        x86::store(self, ARG_REGS[index], &Mem::Frame(off), width);
        Ok(off)
    }

    pub(crate) fn gen_epilogue(&mut self, frame_patch: usize, returns: Vec<usize>, is_main: bool) {
        if is_main {
            x86::clear_eax(self);
        }
        self.gsym(returns);
        x86::epilogue(self);
        let frame = crate::util::align_up((-self.loc) as u64, 16);
        self.patch32(frame_patch, frame as i64);
    }

    /// Zero `size` bytes at `rbp + off`.
    pub(crate) fn gen_zero_local(&mut self, off: i32, size: u64) {
        self.spill_reg();
        x86::lea(self, Reg::Rdi, &Mem::Frame(off));
        x86::mov_imm(self, Reg::Rcx, size as i64);
        x86::clear_eax(self);
        x86::rep_stosb(self);
    }

    /// Copy literal bytes into the frame at `rbp + off`.
    pub(crate) fn gen_store_bytes(&mut self, off: i32, bytes: &[u8]) {
        self.spill_reg();
        let mut pos = 0;
        for chunk in bytes.chunks(8) {
            let at = Mem::Frame(off + pos as i32);
            if chunk.len() == 8 {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                x86::mov_imm(self, Reg::Rax, i64::from_le_bytes(word));
                x86::store(self, Reg::Rax, &at, 8);
            } else {
                for (i, &b) in chunk.iter().enumerate() {
                    x86::mov_imm(self, Reg::Rax, b as i64);
                    x86::store(self, Reg::Rax, &Mem::Frame(off + (pos + i) as i32), 1);
                }
            }
            pos += chunk.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_signedness() {
        assert_eq!(fold(BinOp::Div, -7, 2, false), -3);
        assert_eq!(fold(BinOp::Lt, -1, 0, false), 1);
        assert_eq!(fold(BinOp::Lt, -1, 0, true), 0);
        assert_eq!(fold(BinOp::Shr, -8, 1, false), -4);
        assert_eq!(fold(BinOp::Shr, 0xffff_fff0, 4, true), 0x0fff_ffff);
    }

    #[test]
    fn test_extension_rules() {
        let int = CType::int();
        let uint = CType::uint();
        let uchar = CType::char(true);
        let long = CType::long();
        assert!(needs_extend(&int, &uint));
        assert!(needs_extend(&uint, &int));
        assert!(needs_extend(&long, &int));
        assert!(!needs_extend(&uchar, &int));
        assert!(!needs_extend(&int, &long));
        assert!(needs_extend(&CType::char(false), &uint));
    }
}
