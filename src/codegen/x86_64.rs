//! x86-64 instruction encoders
//!
//! Every function here appends one instruction (or a short fixed sequence)
//! through an [`Emit`] sink. Nothing in this module knows about C values;
//! the vstack layer in [`super`] decides what to encode.
//!
//! Register usage by generated code:
//! - `rax` holds the one register-resident vstack value
//! - `rcx` holds the right operand of a binary operator
//! - `rdx` is clobbered by division
//! - `r11` is scratch for addresses (GOT loads, popped pointers)
//! - `rdi`/`rsi`/`rcx` are used by block copies

use super::Emit;
use crate::elf::R_X86_64_PLT32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
}

impl Reg {
    fn code(self) -> u8 {
        self as u8
    }

    fn low(self) -> u8 {
        self as u8 & 7
    }

    fn ext(self) -> bool {
        self as u8 >= 8
    }
}

/// Integer argument registers in System V order
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Memory operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    /// `[rbp + off]`
    Frame(i32),
    /// `[rsp + off]`
    Stack(i32),
    /// `[reg + off]`
    Base(Reg, i32),
    /// `[rip + sym]`, relocated with `r_type`
    Rip { elf_sym: usize, addend: i64, r_type: u32 },
}

/// Condition codes, numbered as in `jcc`/`setcc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Two-operand ALU opcodes (`op r/m64, r64` form)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alu {
    Add = 0x01,
    Or = 0x09,
    And = 0x21,
    Sub = 0x29,
    Xor = 0x31,
    Cmp = 0x39,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

fn rex<E: Emit + ?Sized>(e: &mut E, w: bool, reg: u8, base: u8, force: bool) {
    let byte = 0x40 | (w as u8) << 3 | ((reg >> 3) & 1) << 2 | ((base >> 3) & 1);
    if byte != 0x40 || force {
        e.emit(&[byte]);
    }
}

/// REX prefix, opcode, ModRM and displacement for `reg` against `mem`.
/// `imm_len` is the size of any immediate that follows, which matters for
/// RIP-relative addends.
fn modrm_mem<E: Emit + ?Sized>(
    e: &mut E,
    w: bool,
    byte_reg: bool,
    opcode: &[u8],
    reg: u8,
    mem: &Mem,
    imm_len: i64,
) {
    // spl/bpl/sil/dil need an empty REX
    let force = byte_reg && (4..8).contains(&reg);
    let (base, disp) = match *mem {
        Mem::Frame(off) => (Reg::Rbp, off),
        Mem::Stack(off) => (Reg::Rsp, off),
        Mem::Base(base, off) => (base, off),
        Mem::Rip {
            elf_sym,
            addend,
            r_type,
        } => {
            rex(e, w, reg, 0, force);
            e.emit(opcode);
            e.emit(&[(reg & 7) << 3 | 0x05]);
            let at = e.ind();
            e.reloc(at, r_type, elf_sym, addend - 4 - imm_len);
            e.emit(&[0; 4]);
            return;
        }
    };
    rex(e, w, reg, base.code(), force);
    e.emit(opcode);
    let rm = base.low();
    let mode = if disp == 0 && rm != 5 {
        0x00
    } else if (-128..128).contains(&disp) {
        0x40
    } else {
        0x80
    };
    e.emit(&[mode | (reg & 7) << 3 | rm]);
    if rm == 4 {
        e.emit(&[0x24]);
    }
    match mode {
        0x40 => e.emit(&[disp as i8 as u8]),
        0x80 => e.emit(&disp.to_le_bytes()),
        _ => {}
    }
}

fn modrm_rr<E: Emit + ?Sized>(e: &mut E, w: bool, opcode: &[u8], reg: Reg, rm: Reg) {
    rex(e, w, reg.code(), rm.code(), false);
    e.emit(opcode);
    e.emit(&[0xc0 | reg.low() << 3 | rm.low()]);
}

/// Load `width` bytes from `mem` into `dst`, extending to 64 bits.
pub fn load<E: Emit + ?Sized>(e: &mut E, dst: Reg, mem: &Mem, width: u8, signed: bool) {
    let d = dst.code();
    match (width, signed) {
        (1, true) => modrm_mem(e, true, false, &[0x0f, 0xbe], d, mem, 0),
        (1, false) => modrm_mem(e, false, false, &[0x0f, 0xb6], d, mem, 0),
        (2, true) => modrm_mem(e, true, false, &[0x0f, 0xbf], d, mem, 0),
        (2, false) => modrm_mem(e, false, false, &[0x0f, 0xb7], d, mem, 0),
        (4, true) => modrm_mem(e, true, false, &[0x63], d, mem, 0),
        (4, false) => modrm_mem(e, false, false, &[0x8b], d, mem, 0),
        _ => modrm_mem(e, true, false, &[0x8b], d, mem, 0),
    }
}

/// Store the low `width` bytes of `src` to `mem`.
pub fn store<E: Emit + ?Sized>(e: &mut E, src: Reg, mem: &Mem, width: u8) {
    let s = src.code();
    match width {
        1 => modrm_mem(e, false, true, &[0x88], s, mem, 0),
        2 => {
            e.emit(&[0x66]);
            modrm_mem(e, false, false, &[0x89], s, mem, 0)
        }
        4 => modrm_mem(e, false, false, &[0x89], s, mem, 0),
        _ => modrm_mem(e, true, false, &[0x89], s, mem, 0),
    }
}

pub fn lea<E: Emit + ?Sized>(e: &mut E, dst: Reg, mem: &Mem) {
    modrm_mem(e, true, false, &[0x8d], dst.code(), mem, 0);
}

pub fn mov_imm<E: Emit + ?Sized>(e: &mut E, dst: Reg, value: i64) {
    if i32::try_from(value).is_ok() {
        modrm_rr(e, true, &[0xc7], Reg::Rax, dst);
        e.emit(&(value as i32).to_le_bytes());
    } else if u32::try_from(value).is_ok() {
        rex(e, false, 0, dst.code(), false);
        e.emit(&[0xb8 + dst.low()]);
        e.emit(&(value as u32).to_le_bytes());
    } else {
        rex(e, true, 0, dst.code(), false);
        e.emit(&[0xb8 + dst.low()]);
        e.emit(&value.to_le_bytes());
    }
}

pub fn mov_rr<E: Emit + ?Sized>(e: &mut E, dst: Reg, src: Reg) {
    if dst != src {
        modrm_rr(e, true, &[0x89], src, dst);
    }
}

pub fn push<E: Emit + ?Sized>(e: &mut E, r: Reg) {
    if r.ext() {
        e.emit(&[0x41]);
    }
    e.emit(&[0x50 + r.low()]);
}

pub fn pop<E: Emit + ?Sized>(e: &mut E, r: Reg) {
    if r.ext() {
        e.emit(&[0x41]);
    }
    e.emit(&[0x58 + r.low()]);
}

/// `op dst, src` on 64-bit registers
pub fn alu_rr<E: Emit + ?Sized>(e: &mut E, op: Alu, dst: Reg, src: Reg) {
    modrm_rr(e, true, &[op as u8], src, dst);
}

/// `op rax, imm32`
pub fn alu_rax_imm<E: Emit + ?Sized>(e: &mut E, op: Alu, imm: i32) {
    let ext = match op {
        Alu::Add => 0,
        Alu::Or => 1,
        Alu::And => 4,
        Alu::Sub => 5,
        Alu::Xor => 6,
        Alu::Cmp => 7,
    };
    e.emit(&[0x48, 0x05 | ext << 3]);
    e.emit(&imm.to_le_bytes());
}

pub fn imul<E: Emit + ?Sized>(e: &mut E, dst: Reg, src: Reg) {
    modrm_rr(e, true, &[0x0f, 0xaf], dst, src);
}

/// `imul reg, reg, imm32`
pub fn imul_imm<E: Emit + ?Sized>(e: &mut E, reg: Reg, imm: i32) {
    modrm_rr(e, true, &[0x69], reg, reg);
    e.emit(&imm.to_le_bytes());
}

/// Divide `rax` by `rcx`; quotient in `rax`, remainder in `rdx`.
pub fn div_rcx<E: Emit + ?Sized>(e: &mut E, signed: bool) {
    if signed {
        e.emit(&[0x48, 0x99, 0x48, 0xf7, 0xf9]);
    } else {
        e.emit(&[0x31, 0xd2, 0x48, 0xf7, 0xf1]);
    }
}

/// Shift `rax` by `cl`.
pub fn shift_cl<E: Emit + ?Sized>(e: &mut E, kind: Shift) {
    e.emit(&[0x48, 0xd3, 0xc0 | (kind as u8) << 3]);
}

/// Shift `rax` by a constant.
pub fn shift_imm<E: Emit + ?Sized>(e: &mut E, kind: Shift, count: u8) {
    e.emit(&[0x48, 0xc1, 0xc0 | (kind as u8) << 3, count]);
}

pub fn neg<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0x48, 0xf7, 0xd8]);
}

pub fn not<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0x48, 0xf7, 0xd0]);
}

/// `test rax, rax`
pub fn test_rax<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0x48, 0x85, 0xc0]);
}

/// `setcc al; movzx eax, al`
pub fn setcc<E: Emit + ?Sized>(e: &mut E, cond: Cond) {
    e.emit(&[0x0f, 0x90 | cond as u8, 0xc0, 0x0f, 0xb6, 0xc0]);
}

/// Re-extend the low `width` bytes of `reg` to 64 bits.
pub fn extend<E: Emit + ?Sized>(e: &mut E, reg: Reg, width: u8, signed: bool) {
    match (width, signed) {
        (1, true) => modrm_rr(e, true, &[0x0f, 0xbe], reg, reg),
        (1, false) => modrm_rr(e, false, &[0x0f, 0xb6], reg, reg),
        (2, true) => modrm_rr(e, true, &[0x0f, 0xbf], reg, reg),
        (2, false) => modrm_rr(e, false, &[0x0f, 0xb7], reg, reg),
        (4, true) => modrm_rr(e, true, &[0x63], reg, reg),
        (4, false) => modrm_rr(e, false, &[0x89], reg, reg),
        _ => {}
    }
}

/// `jmp rel32`; returns the offset of the displacement.
pub fn jmp<E: Emit + ?Sized>(e: &mut E) -> usize {
    e.emit(&[0xe9]);
    let at = e.ind();
    e.emit(&[0; 4]);
    at
}

/// `jcc rel32`; returns the offset of the displacement.
pub fn jcc<E: Emit + ?Sized>(e: &mut E, cond: Cond) -> usize {
    e.emit(&[0x0f, 0x80 | cond as u8]);
    let at = e.ind();
    e.emit(&[0; 4]);
    at
}

/// Point the rel32 at `at` to `target`.
pub fn patch_jump<E: Emit + ?Sized>(e: &mut E, at: usize, target: usize) {
    e.patch32(at, target as i64 - (at as i64 + 4));
}

/// `call sym` through the PLT
pub fn call_sym<E: Emit + ?Sized>(e: &mut E, elf_sym: usize) {
    e.emit(&[0xe8]);
    let at = e.ind();
    e.reloc(at, R_X86_64_PLT32, elf_sym, -4);
    e.emit(&[0; 4]);
}

/// `call r11`
pub fn call_r11<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0x41, 0xff, 0xd3]);
}

/// Clear `al` before a call; variadic callees read it as the vector count.
pub fn clear_eax<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0x31, 0xc0]);
}

pub fn sub_rsp<E: Emit + ?Sized>(e: &mut E, n: i32) {
    if n != 0 {
        e.emit(&[0x48, 0x81, 0xec]);
        e.emit(&n.to_le_bytes());
    }
}

pub fn add_rsp<E: Emit + ?Sized>(e: &mut E, n: i32) {
    if n != 0 {
        e.emit(&[0x48, 0x81, 0xc4]);
        e.emit(&n.to_le_bytes());
    }
}

/// `push rbp; mov rbp, rsp; sub rsp, imm32`. Returns the offset of the
/// frame size, patched when the function ends.
pub fn prologue<E: Emit + ?Sized>(e: &mut E) -> usize {
    e.emit(&[0x55, 0x48, 0x89, 0xe5, 0x48, 0x81, 0xec]);
    let at = e.ind();
    e.emit(&[0; 4]);
    at
}

/// `leave; ret`
pub fn epilogue<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0xc9, 0xc3]);
}

/// `rep movsb`: copy `rcx` bytes from `[rsi]` to `[rdi]`
pub fn rep_movsb<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0xf3, 0xa4]);
}

/// `rep stosb`: fill `rcx` bytes at `[rdi]` with `al`
pub fn rep_stosb<E: Emit + ?Sized>(e: &mut E) {
    e.emit(&[0xf3, 0xaa]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buf {
        code: Vec<u8>,
        relocs: Vec<(usize, u32, usize, i64)>,
    }

    impl Emit for Buf {
        fn ind(&self) -> usize {
            self.code.len()
        }

        fn emit(&mut self, bytes: &[u8]) {
            self.code.extend_from_slice(bytes);
        }

        fn patch32(&mut self, at: usize, value: i64) {
            self.code[at..at + 4].copy_from_slice(&(value as i32).to_le_bytes());
        }

        fn reloc(&mut self, offset: usize, r_type: u32, elf_sym: usize, addend: i64) {
            self.relocs.push((offset, r_type, elf_sym, addend));
        }
    }

    fn encode(f: impl FnOnce(&mut Buf)) -> Vec<u8> {
        let mut buf = Buf::default();
        f(&mut buf);
        buf.code
    }

    #[test]
    fn test_frame_loads_and_stores() {
        // mov eax, [rbp-4] ; movsxd rax, dword [rbp-4]
        assert_eq!(
            encode(|e| load(e, Reg::Rax, &Mem::Frame(-4), 4, false)),
            [0x8b, 0x45, 0xfc]
        );
        assert_eq!(
            encode(|e| load(e, Reg::Rax, &Mem::Frame(-4), 4, true)),
            [0x48, 0x63, 0x45, 0xfc]
        );
        // mov [rbp-0x100], rax
        assert_eq!(
            encode(|e| store(e, Reg::Rax, &Mem::Frame(-256), 8)),
            [0x48, 0x89, 0x85, 0x00, 0xff, 0xff, 0xff]
        );
        // mov [rbp-1], sil needs a REX prefix
        assert_eq!(
            encode(|e| store(e, Reg::Rsi, &Mem::Frame(-1), 1)),
            [0x40, 0x88, 0x75, 0xff]
        );
        // mov word [r11], cx
        assert_eq!(
            encode(|e| store(e, Reg::Rcx, &Mem::Base(Reg::R11, 0), 2)),
            [0x66, 0x41, 0x89, 0x0b]
        );
    }

    #[test]
    fn test_stack_operand_uses_sib() {
        // mov rdi, [rsp+8]
        assert_eq!(
            encode(|e| load(e, Reg::Rdi, &Mem::Stack(8), 8, false)),
            [0x48, 0x8b, 0x7c, 0x24, 0x08]
        );
    }

    #[test]
    fn test_rip_relative_reloc() {
        let mut buf = Buf::default();
        let mem = Mem::Rip {
            elf_sym: 3,
            addend: 8,
            r_type: crate::elf::R_X86_64_PC32,
        };
        lea(&mut buf, Reg::Rax, &mem);
        assert_eq!(buf.code, [0x48, 0x8d, 0x05, 0, 0, 0, 0]);
        assert_eq!(buf.relocs, vec![(3, crate::elf::R_X86_64_PC32, 3, 4)]);
    }

    #[test]
    fn test_immediates() {
        assert_eq!(
            encode(|e| mov_imm(e, Reg::Rax, -1)),
            [0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            encode(|e| mov_imm(e, Reg::Rcx, 0x8000_0000)),
            [0xb9, 0x00, 0x00, 0x00, 0x80]
        );
        assert_eq!(encode(|e| mov_imm(e, Reg::R11, 1 << 40)).len(), 10);
    }

    #[test]
    fn test_register_ops() {
        assert_eq!(encode(|e| mov_rr(e, Reg::Rcx, Reg::Rax)), [0x48, 0x89, 0xc1]);
        assert_eq!(encode(|e| alu_rr(e, Alu::Sub, Reg::Rax, Reg::Rcx)), [0x48, 0x29, 0xc8]);
        assert_eq!(encode(|e| imul(e, Reg::Rax, Reg::Rcx)), [0x48, 0x0f, 0xaf, 0xc1]);
        assert_eq!(
            encode(|e| imul_imm(e, Reg::Rcx, 8)),
            [0x48, 0x69, 0xc9, 8, 0, 0, 0]
        );
        assert_eq!(encode(|e| extend(e, Reg::Rax, 4, true)), [0x48, 0x63, 0xc0]);
        assert_eq!(encode(|e| extend(e, Reg::Rax, 1, false)), [0x0f, 0xb6, 0xc0]);
        assert_eq!(encode(|e| push(e, Reg::R8)), [0x41, 0x50]);
        assert_eq!(encode(|e| pop(e, Reg::R11)), [0x41, 0x5b]);
    }

    #[test]
    fn test_jumps_patch_relative() {
        let mut buf = Buf::default();
        let at = jmp(&mut buf);
        buf.emit(&[0x90; 3]);
        let end = buf.ind();
        patch_jump(&mut buf, at, end);
        assert_eq!(buf.code[..5], [0xe9, 3, 0, 0, 0]);

        let mut buf = Buf::default();
        let at = jcc(&mut buf, Cond::E);
        patch_jump(&mut buf, at, 0);
        assert_eq!(buf.code, [0x0f, 0x84, 0xfa, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_condition_negation() {
        assert_eq!(Cond::L.negate(), Cond::Ge);
        assert_eq!(Cond::A.negate().negate(), Cond::A);
    }
}
