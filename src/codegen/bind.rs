//! Binding C symbols to ELF symbols
//!
//! A C symbol gets its `.symtab` entry the first time it is referenced or
//! defined. Later definitions update that entry in place, so code emitted
//! before the definition (calls, address loads) relocates against the final
//! value.

use crate::elf::symtab::{default_bind, ElfSym};
use crate::elf::{SectionId, SHN_COMMON, SHN_UNDEF, STT_FUNC, STT_NOTYPE, STT_OBJECT};
use crate::errors::{CResult, ErrorKind};
use crate::parser::parse::Parser;
use crate::symbols::types::{size_align, CallConv};
use crate::symbols::SymId;
use log::trace;

/// Functions redirected to their checking wrappers under `bounds-check`.
const BOUND_CHECKED: &[&str] = &[
    "memcpy", "memmove", "memset", "strlen", "strcpy", "strncpy", "strcat", "strchr", "strdup",
    "malloc", "free", "realloc", "calloc",
];

impl<'a> Parser<'a> {
    /// Symbol name as written to `.symtab`.
    pub(crate) fn external_name(&self, sid: SymId) -> String {
        let sym = self.syms.get(sid);
        if let Some(label) = &sym.asm_label {
            return label.clone();
        }
        let name = self.pp.idents.spell(sym.v);
        if sym.v.is_anonymous() {
            return name;
        }
        let mut name = name;
        if let Some(f) = sym.ty.func() {
            if self.settings.bounds_check
                && !sym.flags.defined
                && BOUND_CHECKED.contains(&name.as_str())
            {
                name = format!("__bound_{}", name);
            }
            if self.settings.pe_mangling && f.call_conv == CallConv::Stdcall {
                let args: u64 = f
                    .params
                    .iter()
                    .map(|p| {
                        let size = size_align(&p.ty, &self.syms.structs).map_or(8, |(s, _)| s);
                        crate::util::align_up(size, 8)
                    })
                    .sum();
                name = format!("{}@{}", name, args);
            }
        }
        if self.settings.leading_underscore {
            name.insert(0, '_');
        }
        name
    }

    /// Create or update the ELF symbol of `sid`.
    pub(crate) fn put_extern_sym(&mut self, sid: SymId, shndx: u16, value: u64, size: u64) -> CResult<()> {
        let symtab = self.secs.symtab;
        let existing = self.syms.get(sid).elf_sym;
        if existing != 0 {
            let mut esym = self.secs.elf_sym(symtab, existing);
            esym.st_value = value;
            esym.st_size = size;
            esym.st_shndx = shndx;
            self.secs.set_elf_sym(symtab, existing, &esym);
            return Ok(());
        }

        let name = self.external_name(sid);
        let sym = self.syms.get(sid);
        let bind = default_bind(sym.flags.is_static, sym.flags.is_weak);
        let typ = if sym.ty.is_func() {
            STT_FUNC
        } else if sym.ty.is_void() {
            STT_NOTYPE
        } else {
            STT_OBJECT
        };
        let info = ElfSym::info(bind, typ);
        trace!("bind {} shndx={} value={:#x} size={}", name, shndx, value, size);
        match self.secs.add_elf_sym(symtab, value, size, info, 0, shndx, &name) {
            Ok(index) => {
                self.syms.get_mut(sid).elf_sym = index;
                Ok(())
            }
            Err(dup) => {
                let msg = format!("'{}' defined twice", dup.name);
                Err(self.error(ErrorKind::Semantic, &msg))
            }
        }
    }

    /// ELF index of `sid`, declaring it undefined on first reference.
    pub(crate) fn elf_sym_of(&mut self, sid: SymId) -> usize {
        self.syms.get_mut(sid).flags.used = true;
        let index = self.syms.get(sid).elf_sym;
        if index != 0 {
            return index;
        }
        // a reference never clashes with an existing definition
        if self.put_extern_sym(sid, SHN_UNDEF, 0, 0).is_err() {
            return 0;
        }
        self.syms.get(sid).elf_sym
    }

    /// Reserve `size` bytes aligned to `align` at the end of `sec`.
    pub(crate) fn alloc_static(&mut self, sec: SectionId, size: u64, align: u64) -> CResult<u64> {
        let section = &mut self.secs[sec];
        section.align_to(align.max(1));
        match section.grow(size) {
            Some(offset) => Ok(offset as u64),
            None => {
                let msg = format!("section '{}' is too large", section.name);
                Err(self.error(ErrorKind::Semantic, &msg))
            }
        }
    }

    /// Give a file-scope object without initializer its storage: a common
    /// symbol under the `common` policy, `.bss` space otherwise.
    pub(crate) fn alloc_tentative(&mut self, sid: SymId, size: u64, align: u64) -> CResult<()> {
        let sym = self.syms.get(sid);
        let explicit_section = sym.section;
        if self.settings.common && !sym.flags.is_static && explicit_section.is_none() {
            return self.put_extern_sym(sid, SHN_COMMON, align, size);
        }
        let sec = explicit_section.unwrap_or(self.secs.bss);
        let offset = self.alloc_static(sec, size, align)?;
        let shndx = self.secs[sec].sh_num as u16;
        self.put_extern_sym(sid, shndx, offset, size)
    }

    /// Section number to write in symbols defined in `sec`.
    pub(crate) fn shndx_of(&self, sec: SectionId) -> u16 {
        self.secs[sec].sh_num as u16
    }
}
