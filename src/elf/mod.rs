//! ELF section model
//!
//! Every byte the compiler produces lands in a [`Section`]: machine code in
//! `.text`, initialized globals in `.data`, zero-initialized globals in
//! `.bss`, and the symbol, string, hash and relocation tables that describe
//! them. Sections live in one arena ([`Sections`]) and refer to each other by
//! [`SectionId`].
//!
//! - Public sections get an ELF section number and are written to object files
//! - Private sections (`SHF_PRIVATE`) are compiler bookkeeping only
//! - Section storage grows by doubling and is never shrunk while in use
//! - `SHT_NOBITS` sections only track their size and own no storage

pub mod loader;
pub mod output;
pub mod symtab;

pub use object::elf::{
    EM_X86_64, ET_DYN, ET_REL, R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GOTPCREL,
    R_X86_64_GOTPCRELX, R_X86_64_NONE, R_X86_64_PC32, R_X86_64_PLT32, R_X86_64_REX_GOTPCRELX,
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHN_ABS, SHN_COMMON, SHN_UNDEF, SHT_HASH, SHT_NOBITS,
    SHT_NULL, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STB_LOCAL, STB_WEAK,
    STT_FILE, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION,
};

use std::ops::{Index, IndexMut};

/// Section flag for compiler-internal sections that never reach an output
/// file and get no section number.
pub const SHF_PRIVATE: u32 = 0x8000_0000;

/// Largest section backed by storage. Code and data are reached through
/// 32-bit displacements.
pub const MAX_SECTION_SIZE: u64 = i32::MAX as u64;

/// Largest `SHT_NOBITS` section
pub const MAX_NOBITS_SIZE: u64 = u32::MAX as u64;

/// Handle to a section in a [`Sections`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub usize);

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u32,
    /// ELF section number; 0 for the null section and private sections
    pub sh_num: usize,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
    pub sh_info: u32,
    /// Load address once relocated in memory
    pub sh_addr: u64,
    /// Linked section (string table of a symtab, symtab of a rela)
    pub link: Option<SectionId>,
    /// Relocation section targeting this one
    pub reloc: Option<SectionId>,
    /// Hash table of a symbol table
    pub hash: Option<SectionId>,
    /// Number of non-local symbols hashed (hash sections only)
    pub nb_hashed_syms: usize,
    data: Vec<u8>,
    data_offset: usize,
}

impl Section {
    fn new(name: &str, sh_type: u32, sh_flags: u32) -> Self {
        let sh_addralign = match sh_type {
            SHT_SYMTAB | SHT_RELA | SHT_HASH => 4,
            SHT_STRTAB => 1,
            _ => 32,
        };
        Section {
            name: name.to_string(),
            sh_type,
            sh_flags,
            sh_num: 0,
            sh_addralign,
            sh_entsize: 0,
            sh_info: 0,
            sh_addr: 0,
            link: None,
            reloc: None,
            hash: None,
            nb_hashed_syms: 0,
            data: Vec::new(),
            data_offset: 0,
        }
    }

    /// Logical size in bytes.
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Allocated capacity in bytes; always >= `data_offset` unless the
    /// section is `SHT_NOBITS`.
    pub fn data_allocated(&self) -> usize {
        self.data.len()
    }

    /// The stored contents; empty for `SHT_NOBITS` sections.
    pub fn data(&self) -> &[u8] {
        let end = self.data_offset.min(self.data.len());
        &self.data[..end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = self.data_offset.min(self.data.len());
        &mut self.data[..end]
    }

    pub fn is_private(&self) -> bool {
        self.sh_flags & SHF_PRIVATE != 0
    }

    pub fn is_nobits(&self) -> bool {
        self.sh_type == SHT_NOBITS
    }

    /// Grow the allocation to at least `new_size` bytes, doubling from the
    /// current size (starting at 1) and zero-filling the new tail.
    pub fn realloc(&mut self, new_size: usize) {
        let mut size = self.data.len();
        if size >= new_size {
            return;
        }
        if size == 0 {
            size = 1;
        }
        while size < new_size {
            size = size.saturating_mul(2);
        }
        self.data.resize(size, 0);
    }

    /// Move the logical end to `end`, allocating storage unless the section
    /// is `SHT_NOBITS`.
    fn set_end(&mut self, end: usize) {
        if !self.is_nobits() && end > self.data.len() {
            self.realloc(end);
        }
        self.data_offset = end;
    }

    /// Reserve `size` bytes at the end and return them for writing. Empty
    /// for `SHT_NOBITS` sections.
    pub fn ptr_add(&mut self, size: usize) -> &mut [u8] {
        let offset = self.data_offset;
        let end = offset + size;
        self.set_end(end);
        let stored = end.min(self.data.len());
        &mut self.data[offset.min(stored)..stored]
    }

    /// Extend the section by `size` bytes and return their offset, or
    /// `None` when the section would outgrow its limit.
    pub fn grow(&mut self, size: u64) -> Option<usize> {
        let limit = if self.is_nobits() { MAX_NOBITS_SIZE } else { MAX_SECTION_SIZE };
        let offset = self.data_offset;
        let end = (offset as u64).checked_add(size).filter(|&end| end <= limit)?;
        self.set_end(end as usize);
        Some(offset)
    }

    /// Guarantee `size` writable bytes past the current offset without
    /// moving the offset.
    pub fn reserve(&mut self, size: usize) {
        let end = self.data_offset + size;
        if !self.is_nobits() && end > self.data.len() {
            self.realloc(end);
        }
    }

    /// Pad with zeros until the offset is a multiple of `align`.
    pub fn align_to(&mut self, align: u64) -> usize {
        let aligned = crate::util::align_up(self.data_offset as u64, align) as usize;
        if aligned > self.data_offset {
            self.set_end(aligned);
        }
        aligned
    }

    /// Forget the contents while keeping the allocation. Only used to rebuild
    /// private tables.
    pub(crate) fn clear(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
        self.data_offset = 0;
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Byte sink used by the code generator: append at the end, patch earlier
/// bytes in place.
pub trait ByteSink {
    fn offset(&self) -> usize;
    fn append(&mut self, bytes: &[u8]);
    fn patch(&mut self, at: usize, bytes: &[u8]);
}

impl ByteSink for Section {
    fn offset(&self) -> usize {
        self.data_offset
    }

    fn append(&mut self, bytes: &[u8]) {
        self.ptr_add(bytes.len()).copy_from_slice(bytes);
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) {
        self.write_bytes(at, bytes);
    }
}

/// Arena of all sections of one compilation state, plus the handles of the
/// standard ones.
#[derive(Debug, Clone)]
pub struct Sections {
    list: Vec<Section>,
    public: Vec<SectionId>,
    private: Vec<SectionId>,
    pub text: SectionId,
    pub data: SectionId,
    pub bss: SectionId,
    pub symtab: SectionId,
    /// Symbols exported by loaded shared libraries
    pub dynsymtab: SectionId,
}

impl Default for Sections {
    fn default() -> Self {
        Self::new()
    }
}

impl Sections {
    pub fn new() -> Self {
        let mut sections = Sections {
            list: Vec::new(),
            public: Vec::new(),
            private: Vec::new(),
            text: SectionId(0),
            data: SectionId(0),
            bss: SectionId(0),
            symtab: SectionId(0),
            dynsymtab: SectionId(0),
        };
        sections.create("", SHT_NULL, 0);
        sections.text = sections.create(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR);
        sections.data = sections.create(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE);
        sections.bss = sections.create(".bss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE);
        sections.symtab = sections.new_symtab(
            ".symtab",
            SHT_SYMTAB,
            0,
            ".strtab",
            ".hashtab",
            SHF_PRIVATE,
        );
        sections.dynsymtab = sections.new_symtab(
            ".dynsymtab",
            SHT_SYMTAB,
            SHF_PRIVATE,
            ".dynstrtab",
            ".dynhashtab",
            SHF_PRIVATE,
        );
        sections
    }

    /// Create a section and register it in the public or private list.
    pub fn create(&mut self, name: &str, sh_type: u32, sh_flags: u32) -> SectionId {
        let id = SectionId(self.list.len());
        let mut sec = Section::new(name, sh_type, sh_flags);
        if sh_flags & SHF_PRIVATE != 0 {
            self.private.push(id);
        } else {
            sec.sh_num = self.public.len();
            self.public.push(id);
        }
        log::trace!("new section {} (#{})", name, sec.sh_num);
        self.list.push(sec);
        id
    }

    /// Look a public section up by name.
    pub fn find(&self, name: &str) -> Option<SectionId> {
        self.public
            .iter()
            .skip(1)
            .copied()
            .find(|&id| self.list[id.0].name == name)
    }

    /// Find a public section, creating a PROGBITS/ALLOC one when missing.
    pub fn find_or_create(&mut self, name: &str) -> SectionId {
        match self.find(name) {
            Some(id) => id,
            None => self.create(name, SHT_PROGBITS, SHF_ALLOC),
        }
    }

    /// Public sections in section-number order, including the null section.
    pub fn public(&self) -> &[SectionId] {
        &self.public
    }

    pub fn private(&self) -> &[SectionId] {
        &self.private
    }

    /// Section with ELF number `sh_num`.
    pub fn by_num(&self, sh_num: usize) -> Option<SectionId> {
        self.public.get(sh_num).copied()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Borrow two distinct sections mutably at once.
    pub fn pair_mut(&mut self, a: SectionId, b: SectionId) -> (&mut Section, &mut Section) {
        assert_ne!(a, b, "pair_mut needs distinct sections");
        if a.0 < b.0 {
            let (lo, hi) = self.list.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.list.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }
}

impl Index<SectionId> for Sections {
    type Output = Section;

    fn index(&self, id: SectionId) -> &Section {
        &self.list[id.0]
    }
}

impl IndexMut<SectionId> for Sections {
    fn index_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.list[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_sections() {
        let secs = Sections::new();
        assert_eq!(secs[secs.text].name, ".text");
        assert_eq!(secs[secs.text].sh_num, 1);
        assert_eq!(secs[secs.data].sh_num, 2);
        assert_eq!(secs[secs.bss].sh_type, SHT_NOBITS);
        assert!(secs[secs.dynsymtab].is_private());
        assert_eq!(secs.find(".text"), Some(secs.text));
        assert_eq!(secs.find(".hashtab"), None);
    }

    #[test]
    fn test_default_alignment() {
        let mut secs = Sections::new();
        let id = secs.create(".foo", SHT_PROGBITS, SHF_ALLOC);
        assert_eq!(secs[id].sh_addralign, 32);
        assert_eq!(secs[secs.symtab].sh_addralign, 4);
        let strtab = secs[secs.symtab].link.unwrap();
        assert_eq!(secs[strtab].sh_addralign, 1);
    }

    #[test]
    fn test_growth_is_zero_filled_doubling() {
        let mut secs = Sections::new();
        let id = secs.find_or_create(".rodata");
        assert_eq!(secs.find_or_create(".rodata"), id);
        let sec = &mut secs[id];
        sec.ptr_add(3).copy_from_slice(b"abc");
        assert_eq!(sec.data_allocated(), 4);
        sec.ptr_add(2);
        assert_eq!(sec.data_offset(), 5);
        assert_eq!(sec.data_allocated(), 8);
        assert_eq!(&sec.data()[3..], &[0, 0]);
        sec.reserve(100);
        assert_eq!(sec.data_offset(), 5);
        assert!(sec.data_allocated() >= 105);
    }

    #[test]
    fn test_bss_has_no_storage() {
        let mut secs = Sections::new();
        let id = secs.bss;
        let bss = &mut secs[id];
        assert_eq!(bss.grow(4_000_000_000), Some(0));
        bss.align_to(32);
        assert_eq!(bss.data_offset(), 4_000_000_000);
        assert_eq!(bss.data_allocated(), 0);
        assert!(bss.data().is_empty());
    }

    #[test]
    fn test_growth_is_bounded() {
        let mut secs = Sections::new();
        let (data, bss) = (secs.data, secs.bss);
        assert_eq!(secs[data].grow(MAX_SECTION_SIZE + 1), None);
        assert_eq!(secs[data].grow(u64::MAX), None);
        assert_eq!(secs[data].data_offset(), 0);
        secs[bss].grow(16);
        assert_eq!(secs[bss].grow(MAX_NOBITS_SIZE), None);
        assert_eq!(secs[bss].data_offset(), 16);
    }
}
