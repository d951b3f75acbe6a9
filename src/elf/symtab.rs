//! Symbol, string, hash and relocation tables
//!
//! Symbol tables hold raw `Elf64_Sym` records so they can be written to an
//! object file unchanged. Each table has a linked string table and a private
//! SysV hash table used for lookups by name.

use super::{
    Section, SectionId, Sections, R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GOTPCREL,
    R_X86_64_GOTPCRELX, R_X86_64_NONE, R_X86_64_PC32, R_X86_64_PLT32, R_X86_64_REX_GOTPCRELX,
    SHF_PRIVATE, SHN_COMMON, SHN_UNDEF, SHT_HASH, SHT_RELA, SHT_STRTAB, STB_GLOBAL, STB_LOCAL,
    STB_WEAK,
};

pub const SYM_SIZE: usize = 24;
pub const RELA_SIZE: usize = 24;

/// One `Elf64_Sym` record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElfSym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl ElfSym {
    pub fn info(bind: u8, typ: u8) -> u8 {
        (bind << 4) | (typ & 0xf)
    }

    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn typ(&self) -> u8 {
        self.st_info & 0xf
    }

    pub fn visibility(&self) -> u8 {
        self.st_other & 3
    }

    pub fn read(bytes: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let u64_at = |o: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[o..o + 8]);
            u64::from_le_bytes(buf)
        };
        ElfSym {
            st_name: u32_at(0),
            st_info: bytes[4],
            st_other: bytes[5],
            st_shndx: u16::from_le_bytes([bytes[6], bytes[7]]),
            st_value: u64_at(8),
            st_size: u64_at(16),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.st_name.to_le_bytes());
        out[4] = self.st_info;
        out[5] = self.st_other;
        out[6..8].copy_from_slice(&self.st_shndx.to_le_bytes());
        out[8..16].copy_from_slice(&self.st_value.to_le_bytes());
        out[16..24].copy_from_slice(&self.st_size.to_le_bytes());
    }
}

/// One `Elf64_Rela` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub r_offset: u64,
    pub r_sym: u32,
    pub r_type: u32,
    pub r_addend: i64,
}

impl Rela {
    pub fn read(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[0..8]);
        let r_offset = u64::from_le_bytes(buf);
        buf.copy_from_slice(&bytes[8..16]);
        let info = u64::from_le_bytes(buf);
        buf.copy_from_slice(&bytes[16..24]);
        Rela {
            r_offset,
            r_sym: (info >> 32) as u32,
            r_type: info as u32,
            r_addend: i64::from_le_bytes(buf),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        let info = ((self.r_sym as u64) << 32) | self.r_type as u64;
        out[0..8].copy_from_slice(&self.r_offset.to_le_bytes());
        out[8..16].copy_from_slice(&info.to_le_bytes());
        out[16..24].copy_from_slice(&self.r_addend.to_le_bytes());
    }
}

/// Bytes patched by relocation `r_type`, or `None` for types the linker
/// does not handle.
pub fn reloc_width(r_type: u32) -> Option<usize> {
    match r_type {
        R_X86_64_NONE => Some(0),
        R_X86_64_64 => Some(8),
        R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_32 | R_X86_64_32S => Some(4),
        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => Some(4),
        _ => None,
    }
}

/// Classic SysV ELF hash
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &c in name {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// Returned by [`Sections::add_elf_sym`] when a strong definition meets
/// another strong definition of the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedTwice {
    pub index: usize,
    pub name: String,
}

impl Sections {
    /// Create a symbol table with its string and hash tables. The table
    /// starts with the null symbol and a one-bucket hash.
    pub fn new_symtab(
        &mut self,
        symtab_name: &str,
        sh_type: u32,
        sh_flags: u32,
        strtab_name: &str,
        hash_name: &str,
        hash_flags: u32,
    ) -> SectionId {
        let symtab = self.create(symtab_name, sh_type, sh_flags);
        self[symtab].sh_entsize = SYM_SIZE as u64;
        let strtab = self.create(strtab_name, SHT_STRTAB, sh_flags);
        self.put_elf_str(strtab, "");
        self[symtab].link = Some(strtab);

        let hash = self.create(hash_name, SHT_HASH, hash_flags | SHF_PRIVATE);
        self[hash].sh_entsize = 4;
        self[hash].link = Some(symtab);
        self[symtab].hash = Some(hash);
        {
            let sec = &mut self[hash];
            sec.ptr_add(12);
            sec.write_u32(0, 1);
            sec.write_u32(4, 0);
        }
        self.put_elf_sym(symtab, 0, 0, 0, 0, 0, None);
        symtab
    }

    /// Append a NUL-terminated string and return its offset.
    pub fn put_elf_str(&mut self, strtab: SectionId, s: &str) -> u32 {
        let sec = &mut self[strtab];
        let offset = sec.data_offset();
        let dst = sec.ptr_add(s.len() + 1);
        dst[..s.len()].copy_from_slice(s.as_bytes());
        dst[s.len()] = 0;
        offset as u32
    }

    /// String at `offset` in a string table.
    pub fn elf_str(&self, strtab: SectionId, offset: u32) -> &str {
        let data = self[strtab].data();
        let start = offset as usize;
        if start >= data.len() {
            return "";
        }
        let end = data[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(data.len(), |p| start + p);
        std::str::from_utf8(&data[start..end]).unwrap_or("")
    }

    pub fn nb_syms(&self, symtab: SectionId) -> usize {
        self[symtab].data_offset() / SYM_SIZE
    }

    pub fn elf_sym(&self, symtab: SectionId, index: usize) -> ElfSym {
        let off = index * SYM_SIZE;
        ElfSym::read(&self[symtab].data()[off..off + SYM_SIZE])
    }

    pub fn set_elf_sym(&mut self, symtab: SectionId, index: usize, sym: &ElfSym) {
        let off = index * SYM_SIZE;
        sym.write(&mut self[symtab].data_mut()[off..off + SYM_SIZE]);
    }

    /// Name of symbol `index`.
    pub fn elf_sym_name(&self, symtab: SectionId, index: usize) -> &str {
        let sym = self.elf_sym(symtab, index);
        match self[symtab].link {
            Some(strtab) => self.elf_str(strtab, sym.st_name),
            None => "",
        }
    }

    /// Append a symbol record and hash it when it is not local. Returns its
    /// index.
    #[allow(clippy::too_many_arguments)]
    pub fn put_elf_sym(
        &mut self,
        symtab: SectionId,
        value: u64,
        size: u64,
        info: u8,
        other: u8,
        shndx: u16,
        name: Option<&str>,
    ) -> usize {
        let st_name = match (name, self[symtab].link) {
            (Some(name), Some(strtab)) if !name.is_empty() => self.put_elf_str(strtab, name),
            _ => 0,
        };
        let sym_index = self.nb_syms(symtab);
        let sym = ElfSym {
            st_name,
            st_info: info,
            st_other: other,
            st_shndx: shndx,
            st_value: value,
            st_size: size,
        };
        sym.write(self[symtab].ptr_add(SYM_SIZE));

        if let Some(hash) = self[symtab].hash {
            let hashed = info >> 4 != STB_LOCAL;
            let h = if hashed {
                elf_hash(name.unwrap_or("").as_bytes())
            } else {
                0
            };
            let sec = &mut self[hash];
            sec.ptr_add(4);
            let nbuckets = sec.read_u32(0) as usize;
            let chain_off = (2 + nbuckets + sym_index) * 4;
            let nchain = sec.read_u32(4);
            sec.write_u32(4, nchain + 1);
            if hashed {
                let bucket_off = (2 + h as usize % nbuckets) * 4;
                let head = sec.read_u32(bucket_off);
                sec.write_u32(chain_off, head);
                sec.write_u32(bucket_off, sym_index as u32);
                sec.nb_hashed_syms += 1;
                if sec.nb_hashed_syms > 2 * nbuckets {
                    self.rebuild_hash(symtab, 2 * nbuckets);
                }
            } else {
                sec.write_u32(chain_off, 0);
            }
        }
        sym_index
    }

    /// Recompute the hash table of `symtab` with `nbuckets` buckets.
    pub fn rebuild_hash(&mut self, symtab: SectionId, nbuckets: usize) {
        let Some(hash) = self[symtab].hash else {
            return;
        };
        let nb_syms = self.nb_syms(symtab);
        let mut words = vec![0u32; 2 + nbuckets + nb_syms];
        words[0] = nbuckets as u32;
        words[1] = nb_syms as u32;
        let mut hashed = 0;
        for index in 1..nb_syms {
            let sym = self.elf_sym(symtab, index);
            if sym.bind() == STB_LOCAL {
                continue;
            }
            let h = elf_hash(self.elf_sym_name(symtab, index).as_bytes()) as usize % nbuckets;
            words[2 + nbuckets + index] = words[2 + h];
            words[2 + h] = index as u32;
            hashed += 1;
        }
        let sec = &mut self[hash];
        sec.clear();
        let out = sec.ptr_add(words.len() * 4);
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        sec.nb_hashed_syms = hashed;
    }

    /// Index of the non-local symbol called `name`, or 0.
    pub fn find_elf_sym(&self, symtab: SectionId, name: &str) -> usize {
        let Some(hash) = self[symtab].hash else {
            return 0;
        };
        let sec = &self[hash];
        let nbuckets = sec.read_u32(0) as usize;
        if nbuckets == 0 {
            return 0;
        }
        let h = elf_hash(name.as_bytes()) as usize % nbuckets;
        let mut index = sec.read_u32((2 + h) * 4) as usize;
        while index != 0 {
            if self.elf_sym_name(symtab, index) == name {
                return index;
            }
            index = sec.read_u32((2 + nbuckets + index) * 4) as usize;
        }
        0
    }

    /// Add a symbol, merging it with an existing global of the same name.
    ///
    /// Merge rules for two definitions of one name:
    /// - an undefined reference never replaces a definition
    /// - a global definition replaces a weak one, a weak one never wins
    /// - an initialized definition replaces a common or bss one
    /// - two strong definitions are an error, except in `.dynsymtab`
    #[allow(clippy::too_many_arguments)]
    pub fn add_elf_sym(
        &mut self,
        symtab: SectionId,
        value: u64,
        size: u64,
        info: u8,
        other: u8,
        shndx: u16,
        name: &str,
    ) -> Result<usize, DefinedTwice> {
        let bind = info >> 4;
        if bind == STB_LOCAL {
            return Ok(self.put_elf_sym(symtab, value, size, info, other, shndx, Some(name)));
        }
        let index = self.find_elf_sym(symtab, name);
        if index == 0 {
            return Ok(self.put_elf_sym(symtab, value, size, info, other, shndx, Some(name)));
        }

        let mut esym = self.elf_sym(symtab, index);
        if esym.st_shndx != SHN_UNDEF {
            if shndx == SHN_UNDEF {
                // existing definition wins over a reference
                return Ok(index);
            }
            let esym_bind = esym.bind();
            let replace = if esym_bind != STB_WEAK && bind == STB_WEAK {
                false
            } else if esym_bind == STB_WEAK && bind != STB_WEAK {
                true
            } else if esym_bind == STB_WEAK && bind == STB_WEAK {
                false
            } else if shndx == SHN_COMMON || shndx as usize == self[self.bss].sh_num {
                // tentative definition against an existing one
                if esym.st_shndx == SHN_COMMON && shndx == SHN_COMMON && size > esym.st_size {
                    esym.st_size = size;
                    self.set_elf_sym(symtab, index, &esym);
                }
                false
            } else if esym.st_shndx == SHN_COMMON || esym.st_shndx as usize == self[self.bss].sh_num {
                true
            } else if symtab == self.dynsymtab {
                // two shared libraries may export the same name
                false
            } else {
                return Err(DefinedTwice {
                    index,
                    name: name.to_string(),
                });
            };
            if !replace {
                return Ok(index);
            }
        }
        esym.st_info = ElfSym::info(bind, info & 0xf);
        esym.st_other = other;
        esym.st_shndx = shndx;
        esym.st_value = value;
        esym.st_size = size;
        self.set_elf_sym(symtab, index, &esym);
        Ok(index)
    }

    /// Append a relocation against `target`, creating its `.rela` section on
    /// first use.
    pub fn put_elf_reloc(
        &mut self,
        symtab: SectionId,
        target: SectionId,
        offset: u64,
        r_type: u32,
        sym_index: usize,
        addend: i64,
    ) {
        let rela = match self[target].reloc {
            Some(rela) => rela,
            None => {
                let name = format!(".rela{}", self[target].name);
                let flags = self[symtab].sh_flags & SHF_PRIVATE;
                let rela = self.create(&name, SHT_RELA, flags);
                let info = self[target].sh_num as u32;
                let sec = &mut self[rela];
                sec.sh_entsize = RELA_SIZE as u64;
                sec.sh_info = info;
                sec.sh_addralign = 8;
                sec.link = Some(symtab);
                self[target].reloc = Some(rela);
                rela
            }
        };
        let rel = Rela {
            r_offset: offset,
            r_sym: sym_index as u32,
            r_type,
            r_addend: addend,
        };
        rel.write(self[rela].ptr_add(RELA_SIZE));
    }

    /// All relocations recorded against `target`.
    pub fn relocations(&self, target: SectionId) -> Vec<Rela> {
        match self[target].reloc {
            Some(rela) => relocations_in(&self[rela]),
            None => Vec::new(),
        }
    }

    /// Global symbols only, as `(index, name)`.
    pub fn global_syms(&self, symtab: SectionId) -> Vec<(usize, String)> {
        (1..self.nb_syms(symtab))
            .filter(|&i| self.elf_sym(symtab, i).bind() != STB_LOCAL)
            .map(|i| (i, self.elf_sym_name(symtab, i).to_string()))
            .collect()
    }
}

/// Decode every record of a `.rela` section.
pub fn relocations_in(sec: &Section) -> Vec<Rela> {
    sec.data().chunks_exact(RELA_SIZE).map(Rela::read).collect()
}

/// Bind value used when a symbol's binding is not otherwise known.
pub fn default_bind(is_static: bool, is_weak: bool) -> u8 {
    if is_static {
        STB_LOCAL
    } else if is_weak {
        STB_WEAK
    } else {
        STB_GLOBAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{STT_FUNC, STT_OBJECT};

    fn global(typ: u8) -> u8 {
        ElfSym::info(STB_GLOBAL, typ)
    }

    #[test]
    fn test_put_and_find_symbols() {
        let mut secs = Sections::new();
        let symtab = secs.symtab;
        let text = secs[secs.text].sh_num as u16;
        for i in 0..20 {
            let name = format!("sym{}", i);
            secs.put_elf_sym(symtab, i, 0, global(STT_FUNC), 0, text, Some(&name));
        }
        assert_eq!(secs.nb_syms(symtab), 21);
        assert_eq!(secs.find_elf_sym(symtab, "sym7"), 8);
        assert_eq!(secs.find_elf_sym(symtab, "sym19"), 20);
        assert_eq!(secs.find_elf_sym(symtab, "missing"), 0);
        assert_eq!(secs.elf_sym_name(symtab, 3), "sym2");
    }

    #[test]
    fn test_local_symbols_are_not_found() {
        let mut secs = Sections::new();
        let symtab = secs.symtab;
        let info = ElfSym::info(STB_LOCAL, STT_OBJECT);
        let idx = secs.put_elf_sym(symtab, 0, 4, info, 0, 2, Some("hidden"));
        assert_eq!(idx, 1);
        assert_eq!(secs.find_elf_sym(symtab, "hidden"), 0);
    }

    #[test]
    fn test_add_elf_sym_merge_rules() {
        let mut secs = Sections::new();
        let symtab = secs.symtab;
        let data = secs[secs.data].sh_num as u16;

        let undef = secs
            .add_elf_sym(symtab, 0, 0, global(STT_OBJECT), 0, SHN_UNDEF, "x")
            .unwrap();
        let def = secs
            .add_elf_sym(symtab, 8, 4, global(STT_OBJECT), 0, data, "x")
            .unwrap();
        assert_eq!(undef, def);
        assert_eq!(secs.elf_sym(symtab, def).st_value, 8);

        // a later reference does not disturb the definition
        secs.add_elf_sym(symtab, 0, 0, global(STT_OBJECT), 0, SHN_UNDEF, "x")
            .unwrap();
        assert_eq!(secs.elf_sym(symtab, def).st_shndx, data);

        let err = secs
            .add_elf_sym(symtab, 16, 4, global(STT_OBJECT), 0, data, "x")
            .unwrap_err();
        assert_eq!(err.name, "x");

        let weak = ElfSym::info(STB_WEAK, STT_FUNC);
        let w = secs.add_elf_sym(symtab, 1, 0, weak, 0, data, "f").unwrap();
        secs.add_elf_sym(symtab, 2, 0, global(STT_FUNC), 0, data, "f")
            .unwrap();
        let sym = secs.elf_sym(symtab, w);
        assert_eq!(sym.st_value, 2);
        assert_eq!(sym.bind(), STB_GLOBAL);
    }

    #[test]
    fn test_common_symbols_merge() {
        let mut secs = Sections::new();
        let symtab = secs.symtab;
        let data = secs[secs.data].sh_num as u16;
        let a = secs
            .add_elf_sym(symtab, 4, 4, global(STT_OBJECT), 0, SHN_COMMON, "c")
            .unwrap();
        let b = secs
            .add_elf_sym(symtab, 8, 8, global(STT_OBJECT), 0, SHN_COMMON, "c")
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(secs.elf_sym(symtab, a).st_size, 8);
        secs.add_elf_sym(symtab, 0, 8, global(STT_OBJECT), 0, data, "c")
            .unwrap();
        assert_eq!(secs.elf_sym(symtab, a).st_shndx, data);
    }

    #[test]
    fn test_relocations_roundtrip_through_section() {
        let mut secs = Sections::new();
        let (symtab, text) = (secs.symtab, secs.text);
        secs.put_elf_reloc(symtab, text, 12, crate::elf::R_X86_64_PLT32, 3, -4);
        let rela = secs[text].reloc.unwrap();
        assert_eq!(secs[rela].name, ".rela.text");
        assert_eq!(secs[rela].sh_info as usize, secs[text].sh_num);
        let rels = secs.relocations(text);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].r_sym, 3);
        assert_eq!(rels[0].r_addend, -4);
    }
}
