//! Initializers
//!
//! Brace and string initializers for two kinds of objects:
//!
//! - Static storage: bytes are written straight into the object's section;
//!   address constants become `R_X86_64_64` relocations
//! - Automatic storage: the frame slot is zero-filled, then each element is
//!   stored with ordinary assignment code
//!
//! Inner braces of nested aggregates may be omitted, and `[index] =` /
//! `.member =` designators reposition the cursor. An array declared without
//! a size takes it from its initializer; the initializer is scanned once
//! with code generation off to count the elements, then replayed.

use crate::codegen::{Loc, SValue};
use crate::elf::{SectionId, R_X86_64_64};
use crate::errors::{CResult, ErrorKind};
use crate::parser::lexer::{Punct, TokenKind};
use crate::parser::parse::Parser;
use crate::symbols::types::{size_align, CType, StructId, TypeKind};

/// Where initialized elements go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Section bytes at a section offset
    Static(SectionId),
    /// Frame slot at an `rbp` offset
    Local,
}

impl<'a> Parser<'a> {
    fn is_str(&self) -> bool {
        matches!(self.tok.kind, TokenKind::Str(_))
    }

    /// Give an array declared with `[]` the length its initializer implies.
    pub(crate) fn complete_array_type(&mut self, ty: CType) -> CResult<CType> {
        let TypeKind::Array(elem, None) = &ty.kind else {
            return Ok(ty);
        };
        let elem = (**elem).clone();
        self.start_recording();
        let counted = self.without_data(|p| p.count_elements(&elem));
        let tokens = self.stop_recording();
        let len = counted?;
        self.rewind(tokens)?;
        let mut complete = elem.array_of(Some(len));
        complete.is_const = ty.is_const;
        Ok(complete)
    }

    fn count_elements(&mut self, elem: &CType) -> CResult<u64> {
        let text = elem.is_integer();
        if text && self.is_str() {
            return Ok(self.string_units()?.0.len() as u64 + 1);
        }
        if !self.accept(Punct::LBrace)? {
            return Err(self.error(ErrorKind::Semantic, "invalid initializer"));
        }
        if text && self.is_str() {
            let len = self.string_units()?.0.len() as u64 + 1;
            self.accept(Punct::Comma)?;
            self.expect(Punct::RBrace)?;
            return Ok(len);
        }
        let (mut index, mut max) = (0u64, 0u64);
        while !self.is_punct(Punct::RBrace) {
            if self.accept(Punct::LBracket)? {
                index = self.designator_index()?;
            }
            if self.is_punct(Punct::LBrace) {
                self.record_braces()?;
            } else {
                self.assign_expr()?;
                self.vpop();
            }
            index += 1;
            max = max.max(index);
            if !self.accept(Punct::Comma)? {
                break;
            }
        }
        self.expect(Punct::RBrace)?;
        Ok(max)
    }

    /// `[n] =` after the `[`.
    fn designator_index(&mut self) -> CResult<u64> {
        let index = self.expr_const()?;
        if index < 0 {
            return Err(self.error(ErrorKind::Semantic, "negative array index in initializer"));
        }
        self.expect(Punct::RBracket)?;
        self.accept(Punct::Assign)?;
        Ok(index as u64)
    }

    /// Fill an object with static storage at `offset` in `sec`.
    pub(crate) fn static_initializer(&mut self, sec: SectionId, offset: u64, ty: &CType) -> CResult<()> {
        self.initializer(Target::Static(sec), offset as i64, ty)
    }

    /// Initialize the automatic object at `rbp + off`.
    pub(crate) fn local_initializer(&mut self, off: i32, ty: &CType) -> CResult<()> {
        if ty.is_array() || (ty.is_struct() && self.is_punct(Punct::LBrace)) {
            let size = size_align(ty, &self.syms.structs).map_or(0, |(size, _)| size);
            self.gen_zero_local(off, size);
        }
        self.initializer(Target::Local, off as i64, ty)
    }

    fn initializer(&mut self, target: Target, off: i64, ty: &CType) -> CResult<()> {
        match &ty.kind {
            TypeKind::Array(elem, len) => {
                let elem = (**elem).clone();
                if elem.is_integer() && self.is_str() {
                    return self.string_initializer(target, off, &elem, *len);
                }
                if !self.accept(Punct::LBrace)? {
                    return Err(self.error(ErrorKind::Semantic, "invalid initializer"));
                }
                if elem.is_integer() && self.is_str() {
                    self.string_initializer(target, off, &elem, *len)?;
                    self.accept(Punct::Comma)?;
                    return self.expect(Punct::RBrace);
                }
                self.array_elements(target, off, &elem, *len, true)?;
                self.expect(Punct::RBrace)
            }
            TypeKind::Struct(id) => {
                if self.accept(Punct::LBrace)? {
                    self.struct_members(target, off, *id, true)?;
                    return self.expect(Punct::RBrace);
                }
                if target == Target::Local {
                    return self.scalar_initializer(target, off, ty);
                }
                Err(self.error(ErrorKind::Semantic, "invalid initializer"))
            }
            _ => {
                if self.accept(Punct::LBrace)? {
                    self.scalar_initializer(target, off, ty)?;
                    self.accept(Punct::Comma)?;
                    return self.expect(Punct::RBrace);
                }
                self.scalar_initializer(target, off, ty)
            }
        }
    }

    /// An element inside braces: aggregates without their own braces take
    /// as many of the following values as they need.
    fn element(&mut self, target: Target, off: i64, ty: &CType) -> CResult<()> {
        if self.is_punct(Punct::LBrace) {
            return self.initializer(target, off, ty);
        }
        match &ty.kind {
            TypeKind::Array(elem, len) => {
                let elem = (**elem).clone();
                if elem.is_integer() && self.is_str() {
                    return self.string_initializer(target, off, &elem, *len);
                }
                self.array_elements(target, off, &elem, *len, false)
            }
            TypeKind::Struct(id) => self.struct_members(target, off, *id, false),
            _ => self.scalar_initializer(target, off, ty),
        }
    }

    /// Consume the `,` before another element. Without braces of its own an
    /// aggregate stops at a designator or closing brace meant for the
    /// enclosing one.
    fn next_element(&mut self, braced: bool) -> CResult<bool> {
        if !self.is_punct(Punct::Comma) {
            return Ok(false);
        }
        if !braced {
            let next = self.peek()?;
            if next.is_punct(Punct::RBrace) || next.is_punct(Punct::Dot) || next.is_punct(Punct::LBracket) {
                return Ok(false);
            }
        }
        self.next()?;
        Ok(true)
    }

    fn array_elements(&mut self, target: Target, off: i64, elem: &CType, len: Option<u64>, braced: bool) -> CResult<()> {
        let Some((esize, _)) = size_align(elem, &self.syms.structs) else {
            return Err(self.error(ErrorKind::Semantic, "unknown type size"));
        };
        let mut index = 0u64;
        loop {
            if self.is_punct(Punct::RBrace) {
                break;
            }
            if self.is_punct(Punct::LBracket) {
                if !braced {
                    break;
                }
                self.next()?;
                index = self.designator_index()?;
            }
            if len.is_some_and(|n| index >= n) {
                return Err(self.error(ErrorKind::Semantic, "excess elements in array initializer"));
            }
            self.element(target, off + (index * esize) as i64, elem)?;
            index += 1;
            if !braced && len.is_some_and(|n| index >= n) {
                break;
            }
            if !self.next_element(braced)? {
                break;
            }
        }
        Ok(())
    }

    fn struct_members(&mut self, target: Target, off: i64, id: StructId, braced: bool) -> CResult<()> {
        let def = self.syms.struct_def(id).clone();
        if !def.defined {
            return Err(self.error(ErrorKind::Semantic, "initialization of incomplete type"));
        }
        let mut i = 0usize;
        loop {
            if self.is_punct(Punct::RBrace) {
                break;
            }
            if self.is_punct(Punct::Dot) {
                if !braced {
                    break;
                }
                self.next()?;
                let name = self.expect_ident()?;
                let Some(pos) = def.fields.iter().position(|f| f.name == name) else {
                    let msg = format!("field '{}' not found", self.pp.idents.spell(name));
                    return Err(self.error(ErrorKind::Semantic, &msg));
                };
                i = pos;
                self.accept(Punct::Assign)?;
            }
            if i >= def.fields.len() {
                if braced {
                    return Err(self.error(ErrorKind::Semantic, "excess elements in struct initializer"));
                }
                break;
            }
            let field = def.fields[i].clone();
            self.element(target, off + field.offset as i64, &field.ty)?;
            i = if def.is_union { def.fields.len() } else { i + 1 };
            if !braced && i >= def.fields.len() {
                break;
            }
            if !self.next_element(braced)? {
                break;
            }
        }
        Ok(())
    }

    fn string_initializer(&mut self, target: Target, off: i64, elem: &CType, len: Option<u64>) -> CResult<()> {
        let (units, _) = self.string_units()?;
        let esize = elem.width().0 as usize;
        let mut count = units.len() + 1;
        if let Some(n) = len {
            if units.len() as u64 > n {
                self.warning("initializer-string for array is too long");
            }
            count = count.min(n as usize);
        }
        let mut bytes = Vec::with_capacity(count * esize);
        for i in 0..count {
            let unit = units.get(i).copied().unwrap_or(0) as u64;
            bytes.extend_from_slice(&unit.to_le_bytes()[..esize]);
        }
        match target {
            Target::Static(sec) => self.secs[sec].write_bytes(off as usize, &bytes),
            Target::Local => self.gen_store_bytes(off as i32, &bytes),
        }
        Ok(())
    }

    fn scalar_initializer(&mut self, target: Target, off: i64, ty: &CType) -> CResult<()> {
        match target {
            Target::Static(sec) => {
                let value = self.without_code(|p| {
                    p.assign_expr()?;
                    p.gen_assign_cast(ty)?;
                    let v = p.vtop().clone();
                    p.vpop();
                    Ok(v)
                })?;
                self.write_static(sec, off as u64, ty, &value)
            }
            Target::Local => {
                self.vpush(SValue::new(ty.unqualified(), Loc::Local(off as i32), true));
                self.assign_expr()?;
                if !ty.is_struct() {
                    self.gen_assign_cast(ty)?;
                }
                self.vstore()?;
                self.vpop();
                Ok(())
            }
        }
    }

    /// Store a folded initializer value into section bytes.
    fn write_static(&mut self, sec: SectionId, off: u64, ty: &CType, value: &SValue) -> CResult<()> {
        let width = ty.width().0 as usize;
        if let Some(v) = value.const_value() {
            self.secs[sec].write_bytes(off as usize, &v.to_le_bytes()[..width]);
            return Ok(());
        }
        if let (false, Loc::Sym { sym, addend }, 8) = (value.lval, value.loc, width) {
            let elf_sym = self.elf_sym_of(sym);
            let symtab = self.secs.symtab;
            self.secs.put_elf_reloc(symtab, sec, off, R_X86_64_64, elf_sym, addend);
            return Ok(());
        }
        Err(self.error(ErrorKind::Semantic, "initializer element is not constant"))
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse::tests::compile;
    use crate::state::Settings;

    fn data_of(source: &str, name: &str, len: usize) -> Vec<u8> {
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let sym = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, name));
        assert_eq!(sym.st_size as usize, len);
        let off = sym.st_value as usize;
        secs[secs.data].data()[off..off + len].to_vec()
    }

    #[test]
    fn test_unsized_string_array() {
        assert_eq!(data_of("char s[] = \"hi\" \"!\";", "s", 4), b"hi!\0".to_vec());
    }

    #[test]
    fn test_elided_braces_fill_rows() {
        let bytes = data_of("char m[2][3] = { 1, 2, 3, 4 };", "m", 6);
        assert_eq!(bytes, vec![1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_designators() {
        let source = "struct p { char a, b, c; };\n\
                      struct p v = { .c = 7, .a = 1 };\n\
                      char d[] = { [3] = 9, 1 };\n";
        assert_eq!(data_of(source, "v", 3), vec![1, 0, 7]);
        assert_eq!(data_of(source, "d", 5), vec![0, 0, 0, 9, 1]);
    }

    #[test]
    fn test_address_constant_gets_relocation() {
        let source = "int g[4];\nint *p = &g[2];\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let relocs = secs.relocations(secs.data);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].r_type, crate::elf::R_X86_64_64);
        assert_eq!(relocs[0].r_addend, 8);
    }

    #[test]
    fn test_non_constant_initializer() {
        let (_, result) = compile("int f(void);\nint x = f();\n", &Settings::default());
        assert!(result.unwrap_err().contains("initializer element is not constant"));
    }
}
