//! Loading of binary inputs
//!
//! Inputs that are not C source are recognized by their leading bytes:
//!
//! - ELF `ET_REL` objects are merged into the current sections: each
//!   allocated section is appended to the section of the same name, symbols
//!   are re-added with their section numbers and values translated, and
//!   relocations are re-targeted at the merged symbols
//! - ELF `ET_DYN` shared objects contribute their exported dynamic symbols
//!   to `.dynsymtab`
//! - `!<arch>` archives load only the members that define a symbol that is
//!   still undefined, repeating until nothing new is pulled in
//! - COFF objects are recognized and refused
//! - anything else is read as a GNU ld script (`GROUP`, `INPUT`,
//!   `AS_NEEDED`, `-lname`)

use super::symtab::{reloc_width, ElfSym};
use super::{
    SectionId, Sections, ET_DYN, ET_REL, EM_X86_64, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHN_UNDEF,
    SHT_NOBITS, SHT_PROGBITS, SHT_RELA, STB_LOCAL, STT_SECTION,
};
use log::debug;
use object::elf::{
    FileHeader64, Rela64, SectionHeader64, Sym64, ELFCLASS64, ELFDATA2LSB, SHN_LORESERVE, SHT_DYNSYM,
    SHT_FINI_ARRAY, SHT_INIT_ARRAY, SHT_NOTE, SHT_PREINIT_ARRAY, SHT_REL, SHT_SYMTAB,
};
use object::read::archive::{ArchiveFile, ArchiveOffset};
use object::read::elf::{FileHeader, SectionHeader, SectionTable, SymbolTable};
use object::LittleEndian;
use rustc_hash::FxHashSet;
use std::fmt;

type Elf = FileHeader64<LittleEndian>;

const ARMAG: &[u8] = b"!<arch>\n";

/// Errors while decoding a binary input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElfError {
    /// The file ends inside a header or table
    Truncated { what: &'static str },
    /// Headers or tables that point outside the file or contradict each other
    Malformed(String),
    /// Not a 64-bit little-endian ELF file
    UnsupportedClass,
    WrongMachine(u16),
    /// ELF file that is neither relocatable nor shared
    UnrecognizedType(u16),
    /// Recognized but not handled (COFF, REL relocations)
    Unsupported(String),
    InvalidSection(String),
    InvalidRelocation { section: String, index: usize },
    DefinedTwice(String),
    InvalidArchive(String),
    InvalidScript(String),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::Truncated { what } => write!(f, "truncated file ({})", what),
            ElfError::Malformed(msg) => write!(f, "malformed file: {}", msg),
            ElfError::UnsupportedClass => write!(f, "only 64-bit little-endian ELF files are supported"),
            ElfError::WrongMachine(m) => write!(f, "bad architecture (e_machine {})", m),
            ElfError::UnrecognizedType(_) => write!(f, "unrecognized ELF file"),
            ElfError::Unsupported(what) => write!(f, "{} not supported", what),
            ElfError::InvalidSection(msg) => write!(f, "{}", msg),
            ElfError::InvalidRelocation { section, index } => {
                write!(f, "invalid relocation entry [{}] in '{}'", index, section)
            }
            ElfError::DefinedTwice(name) => write!(f, "'{}' defined twice", name),
            ElfError::InvalidArchive(msg) => write!(f, "invalid archive: {}", msg),
            ElfError::InvalidScript(msg) => write!(f, "unrecognized file type: {}", msg),
        }
    }
}

impl std::error::Error for ElfError {}

impl From<object::read::Error> for ElfError {
    fn from(e: object::read::Error) -> Self {
        ElfError::Malformed(e.to_string())
    }
}

/// What a binary input turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Object,
    SharedObject,
    Archive,
    Coff,
    Script,
}

/// Recognize an input file by its magic bytes.
pub fn classify(data: &[u8]) -> Result<InputKind, ElfError> {
    if data.starts_with(b"\x7fELF") {
        let elf = ElfFile::parse(data)?;
        return match elf.e_type {
            ET_REL => Ok(InputKind::Object),
            ET_DYN => Ok(InputKind::SharedObject),
            other => Err(ElfError::UnrecognizedType(other)),
        };
    }
    if data.starts_with(ARMAG) {
        return Ok(InputKind::Archive);
    }
    // x86-64, i386, arm64 and TI C67 COFF machine numbers
    if data.len() >= 2 && matches!(u16::from_le_bytes([data[0], data[1]]), 0x8664 | 0x014c | 0xaa64 | 0x00c2) {
        return Ok(InputKind::Coff);
    }
    Ok(InputKind::Script)
}

fn lossy(name: &[u8]) -> &str {
    std::str::from_utf8(name).unwrap_or("")
}

/// Section view of an ELF64 file
struct ElfFile<'a> {
    data: &'a [u8],
    endian: LittleEndian,
    e_type: u16,
    sections: SectionTable<'a, Elf>,
}

impl<'a> ElfFile<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let ident = data.get(..16).ok_or(ElfError::Truncated { what: "ELF header" })?;
        if ident[4] != ELFCLASS64 || ident[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedClass);
        }
        let header = Elf::parse(data)?;
        let endian = header.endian()?;
        let machine = header.e_machine(endian);
        if machine != EM_X86_64 {
            return Err(ElfError::WrongMachine(machine));
        }
        let sections = header.sections(endian, data)?;
        Ok(ElfFile {
            data,
            endian,
            e_type: header.e_type(endian),
            sections,
        })
    }

    fn headers(&self) -> impl Iterator<Item = (usize, &'a SectionHeader64<LittleEndian>)> {
        self.sections.iter().enumerate()
    }

    fn name(&self, sh: &SectionHeader64<LittleEndian>) -> &'a str {
        self.sections
            .section_name(self.endian, sh)
            .map_or("", lossy)
    }

    fn contents(&self, sh: &SectionHeader64<LittleEndian>) -> Result<&'a [u8], ElfError> {
        Ok(sh.data(self.endian, self.data)?)
    }

    /// First symbol table of `sh_type`.
    fn symbols(&self, sh_type: u32) -> Result<SymbolTable<'a, Elf>, ElfError> {
        Ok(self.sections.symbols(self.endian, self.data, sh_type)?)
    }

    fn elf_sym(&self, sym: &Sym64<LittleEndian>) -> ElfSym {
        ElfSym {
            st_name: sym.st_name.get(self.endian),
            st_info: sym.st_info,
            st_other: sym.st_other,
            st_shndx: sym.st_shndx.get(self.endian),
            st_value: sym.st_value.get(self.endian),
            st_size: sym.st_size.get(self.endian),
        }
    }
}

/// Sections whose contents are merged into the output
fn is_loadable(sh_type: u32, flags: u64) -> bool {
    flags & SHF_ALLOC as u64 != 0
        && matches!(
            sh_type,
            SHT_PROGBITS | SHT_NOBITS | SHT_NOTE | SHT_INIT_ARRAY | SHT_FINI_ARRAY | SHT_PREINIT_ARRAY
        )
}

/// An input section after merging: where it landed and how big it was
#[derive(Debug, Clone, Copy)]
struct Placed {
    dest: SectionId,
    offset: u64,
    size: u64,
}

/// Merge a relocatable object into `secs`.
pub fn load_object(secs: &mut Sections, data: &[u8]) -> Result<(), ElfError> {
    let elf = ElfFile::parse(data)?;
    let endian = elf.endian;
    if elf.e_type != ET_REL {
        return Err(ElfError::UnrecognizedType(elf.e_type));
    }
    if elf.headers().filter(|(_, sh)| sh.sh_type(endian) == SHT_SYMTAB).count() > 1 {
        return Err(ElfError::InvalidSection("object must contain only one symtab".to_string()));
    }

    let mut placed: Vec<Option<Placed>> = vec![None; elf.sections.len()];
    for (i, sh) in elf.headers().skip(1) {
        let (sh_type, flags) = (sh.sh_type(endian), sh.sh_flags(endian));
        if !is_loadable(sh_type, flags) {
            continue;
        }
        let name = elf.name(sh);
        let dest = match secs.find(name) {
            Some(id) => {
                if secs[id].sh_type != sh_type {
                    return Err(ElfError::InvalidSection(format!("invalid section type for '{}'", name)));
                }
                id
            }
            None => {
                let flags = flags as u32 & (SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR);
                let id = secs.create(name, sh_type, flags);
                secs[id].sh_addralign = 1;
                id
            }
        };
        let align = sh.sh_addralign(endian).max(1);
        let size = sh.sh_size(endian);
        let bytes = elf.contents(sh)?;
        let sec = &mut secs[dest];
        if align > sec.sh_addralign {
            sec.sh_addralign = align;
        }
        sec.align_to(align);
        let offset = sec
            .grow(size)
            .ok_or_else(|| ElfError::InvalidSection(format!("section '{}' is too large", name)))?;
        if !bytes.is_empty() {
            sec.write_bytes(offset, bytes);
        }
        placed[i] = Some(Placed {
            dest,
            offset: offset as u64,
            size,
        });
    }

    let symtab = secs.symtab;
    let symbols = elf.symbols(SHT_SYMTAB)?;
    let strings = symbols.strings();
    let mut remap = vec![0usize; symbols.len()];
    for (i, raw) in symbols.iter().enumerate().skip(1) {
        let mut sym = elf.elf_sym(raw);
        let name = if sym.typ() == STT_SECTION {
            ""
        } else {
            strings.get(sym.st_name).map_or("", lossy)
        };
        if sym.st_shndx != SHN_UNDEF && sym.st_shndx < SHN_LORESERVE {
            match placed.get(sym.st_shndx as usize).copied().flatten() {
                Some(at) => {
                    sym.st_shndx = secs[at.dest].sh_num as u16;
                    sym.st_value = sym.st_value.wrapping_add(at.offset);
                }
                // local symbol of a section that was not loaded
                None if sym.bind() == STB_LOCAL => continue,
                None => {
                    return Err(ElfError::InvalidSection(format!(
                        "'{}' is defined in an unsupported section",
                        name
                    )))
                }
            }
        }
        remap[i] = if sym.bind() == STB_LOCAL {
            let name = (!name.is_empty()).then_some(name);
            secs.put_elf_sym(symtab, sym.st_value, sym.st_size, sym.st_info, sym.st_other, sym.st_shndx, name)
        } else {
            secs.add_elf_sym(symtab, sym.st_value, sym.st_size, sym.st_info, sym.st_other, sym.st_shndx, name)
                .map_err(|dup| ElfError::DefinedTwice(dup.name))?
        };
    }

    for (_, sh) in elf.headers() {
        let sh_type = sh.sh_type(endian);
        if sh_type != SHT_RELA && sh_type != SHT_REL {
            continue;
        }
        let Some(target) = placed.get(sh.sh_info(endian) as usize).copied().flatten() else {
            continue;
        };
        if sh_type == SHT_REL {
            return Err(ElfError::Unsupported("REL relocations".to_string()));
        }
        let rels: &[Rela64<LittleEndian>] = sh.data_as_array(endian, elf.data)?;
        for (k, rel) in rels.iter().enumerate() {
            let invalid = || ElfError::InvalidRelocation {
                section: elf.name(sh).to_string(),
                index: k,
            };
            let r_offset = rel.r_offset.get(endian);
            let info = rel.r_info.get(endian);
            let (r_sym, r_type) = ((info >> 32) as usize, info as u32);
            let width = reloc_width(r_type).unwrap_or(1) as u64;
            if r_offset.checked_add(width).map_or(true, |end| end > target.size) {
                return Err(invalid());
            }
            let sym = match remap.get(r_sym) {
                Some(&s) if s != 0 || r_sym == 0 => s,
                _ => return Err(invalid()),
            };
            let addend = rel.r_addend.get(endian);
            secs.put_elf_reloc(symtab, target.dest, r_offset + target.offset, r_type, sym, addend);
        }
    }
    debug!("loaded object: {} sections, {} symbols", elf.sections.len(), remap.len());
    Ok(())
}

/// Register the exported symbols of a shared object in `.dynsymtab`.
/// Returns how many were added.
pub fn load_dll(secs: &mut Sections, data: &[u8]) -> Result<usize, ElfError> {
    let elf = ElfFile::parse(data)?;
    if elf.e_type != ET_DYN {
        return Err(ElfError::UnrecognizedType(elf.e_type));
    }
    let symbols = elf.symbols(SHT_DYNSYM)?;
    let strings = symbols.strings();
    let dynsymtab = secs.dynsymtab;
    let mut count = 0;
    for raw in symbols.iter().skip(1) {
        let sym = elf.elf_sym(raw);
        if sym.bind() == STB_LOCAL || sym.st_shndx == SHN_UNDEF {
            continue;
        }
        let name = strings.get(sym.st_name).map_or("", lossy);
        // two libraries may export one name; the first one stays
        let _ = secs.add_elf_sym(dynsymtab, sym.st_value, sym.st_size, sym.st_info, sym.st_other, sym.st_shndx, name);
        count += 1;
    }
    debug!("loaded dll: {} exported symbols", count);
    Ok(count)
}

/// Load the archive members needed to define currently undefined symbols.
/// Without a symbol index every object member is loaded. Returns the
/// number of members loaded.
pub fn load_archive(secs: &mut Sections, data: &[u8]) -> Result<usize, ElfError> {
    let archive = ArchiveFile::parse(data).map_err(|e| ElfError::InvalidArchive(e.to_string()))?;
    let Some(index) = archive.symbols()? else {
        let mut loaded = 0;
        for member in archive.members() {
            let member = member.map_err(|e| ElfError::InvalidArchive(e.to_string()))?;
            let bytes = member.data(data)?;
            if bytes.starts_with(b"\x7fELF") {
                debug!("archive member {}", lossy(member.name()));
                load_object(secs, bytes)?;
                loaded += 1;
            }
        }
        return Ok(loaded);
    };
    let mut entries = Vec::new();
    for symbol in index {
        let symbol = symbol.map_err(|e| ElfError::InvalidArchive(e.to_string()))?;
        entries.push((lossy(symbol.name()), symbol.offset().0));
    }

    let symtab = secs.symtab;
    let mut done: FxHashSet<u64> = FxHashSet::default();
    loop {
        let mut bound = 0;
        for &(name, header) in &entries {
            if done.contains(&header) {
                continue;
            }
            let sym = secs.find_elf_sym(symtab, name);
            if sym == 0 || secs.elf_sym(symtab, sym).st_shndx != SHN_UNDEF {
                continue;
            }
            let member = archive
                .member(ArchiveOffset(header))
                .map_err(|e| ElfError::InvalidArchive(format!("no member at {} for '{}': {}", header, name, e)))?;
            debug!("archive member {} for {}", lossy(member.name()), name);
            load_object(secs, member.data(data)?)?;
            done.insert(header);
            bound += 1;
        }
        if bound == 0 {
            break;
        }
    }
    Ok(done.len())
}

/// A file named by a linker script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptInput {
    File(String),
    /// `-lname`
    Library(String),
}

fn script_tokens(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return tokens;
        }
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |end| &after[end + 2..]);
            continue;
        }
        let first = rest.as_bytes()[0];
        if matches!(first, b'(' | b')' | b',') {
            tokens.push(&rest[..1]);
            rest = &rest[1..];
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ','))
            .unwrap_or(rest.len());
        tokens.push(&rest[..end]);
        rest = &rest[end..];
    }
}

/// Parse the input list of a GNU ld script.
///
/// # Grammar
///
/// ```text
/// script  := command*
/// command := ("GROUP" | "INPUT") "(" files ")"
///          | ("OUTPUT_FORMAT" | "TARGET") "(" anything ")"
/// files   := (file | "-l"name | "AS_NEEDED" "(" files ")" | ",")*
/// ```
pub fn parse_ld_script(data: &[u8]) -> Result<Vec<ScriptInput>, ElfError> {
    let text = std::str::from_utf8(data).map_err(|_| ElfError::InvalidScript("binary data".to_string()))?;
    let tokens = script_tokens(text);
    let mut inputs = Vec::new();
    let mut pos = 0;
    while pos < tokens.len() {
        let command = tokens[pos];
        if tokens.get(pos + 1) != Some(&"(") {
            return Err(ElfError::InvalidScript(format!("unexpected '{}'", command)));
        }
        pos += 2;
        match command {
            "GROUP" | "INPUT" => {
                let mut depth = 1;
                while depth > 0 {
                    let Some(&tok) = tokens.get(pos) else {
                        return Err(ElfError::InvalidScript("missing ')'".to_string()));
                    };
                    pos += 1;
                    match tok {
                        ")" => depth -= 1,
                        "," => {}
                        "AS_NEEDED" => {
                            if tokens.get(pos) != Some(&"(") {
                                return Err(ElfError::InvalidScript("'(' expected after AS_NEEDED".to_string()));
                            }
                            pos += 1;
                            depth += 1;
                        }
                        "(" => return Err(ElfError::InvalidScript("unexpected '('".to_string())),
                        _ => match tok.strip_prefix("-l") {
                            Some(lib) => inputs.push(ScriptInput::Library(lib.to_string())),
                            None => inputs.push(ScriptInput::File(tok.to_string())),
                        },
                    }
                }
            }
            "OUTPUT_FORMAT" | "TARGET" => {
                while tokens.get(pos).is_some_and(|&t| t != ")") {
                    pos += 1;
                }
                if pos >= tokens.len() {
                    return Err(ElfError::InvalidScript("missing ')'".to_string()));
                }
                pos += 1;
            }
            other => return Err(ElfError::InvalidScript(format!("unexpected '{}'", other))),
        }
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::output::object_bytes;
    use crate::elf::{R_X86_64_64, R_X86_64_PC32, SHN_ABS, STB_GLOBAL, STT_FUNC, STT_OBJECT};

    const AR_HEADER_SIZE: usize = 60;

    fn global(typ: u8) -> u8 {
        ElfSym::info(STB_GLOBAL, typ)
    }

    /// An object defining `name` in `.text` and referencing `needs`.
    fn object_defining(name: &str, needs: Option<&str>) -> Vec<u8> {
        let mut secs = Sections::new();
        let (symtab, text) = (secs.symtab, secs.text);
        secs[text].ptr_add(8).copy_from_slice(&[0x90; 8]);
        let shndx = secs[text].sh_num as u16;
        secs.put_elf_sym(symtab, 0, 8, global(STT_FUNC), 0, shndx, Some(name));
        if let Some(needed) = needs {
            let sym = secs.put_elf_sym(symtab, 0, 0, global(STT_FUNC), 0, SHN_UNDEF, Some(needed));
            secs.put_elf_reloc(symtab, text, 4, R_X86_64_PC32, sym, -4);
        }
        object_bytes(&secs).unwrap()
    }

    fn ar_header(name: &str, size: usize) -> Vec<u8> {
        let mut hdr = format!("{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}", name, 0, 0, 0, 644, size).into_bytes();
        hdr.extend_from_slice(b"`\n");
        hdr
    }

    /// Archive of `(member name, contents, symbols)` with a symbol index.
    fn archive(members: &[(&str, Vec<u8>, &[&str])]) -> Vec<u8> {
        let nsyms: usize = members.iter().map(|m| m.2.len()).sum();
        let names: usize = members.iter().flat_map(|m| m.2.iter()).map(|s| s.len() + 1).sum();
        let index_size = 4 + 4 * nsyms + names;
        let mut offset = ARMAG.len() + AR_HEADER_SIZE + index_size + (index_size & 1);
        let mut words = Vec::new();
        let mut strings = Vec::new();
        for (_, data, syms) in members {
            for sym in syms.iter() {
                words.extend_from_slice(&(offset as u32).to_be_bytes());
                strings.extend_from_slice(sym.as_bytes());
                strings.push(0);
            }
            offset += AR_HEADER_SIZE + data.len() + (data.len() & 1);
        }
        let mut out = ARMAG.to_vec();
        out.extend(ar_header("/", index_size));
        out.extend_from_slice(&(nsyms as u32).to_be_bytes());
        out.extend(words);
        out.extend(strings);
        if index_size & 1 == 1 {
            out.push(b'\n');
        }
        for (name, data, _) in members {
            out.extend(ar_header(&format!("{}/", name), data.len()));
            out.extend_from_slice(data);
            if data.len() & 1 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&object_defining("f", None)).unwrap(), InputKind::Object);
        assert_eq!(classify(b"!<arch>\nrest").unwrap(), InputKind::Archive);
        assert_eq!(classify(&[0x64, 0x86, 0, 0]).unwrap(), InputKind::Coff);
        assert_eq!(classify(b"GROUP ( libc.so.6 )").unwrap(), InputKind::Script);
    }

    #[test]
    fn test_object_merge_translates_offsets() {
        let mut secs = Sections::new();
        let text = secs.text;
        secs[text].ptr_add(3);
        load_object(&mut secs, &object_defining("f", Some("g"))).unwrap();

        let symtab = secs.symtab;
        let f = secs.elf_sym(symtab, secs.find_elf_sym(symtab, "f"));
        // appended after the 3 existing bytes at .text alignment
        assert_eq!(f.st_value, 32);
        assert_eq!(f.st_shndx as usize, secs[text].sh_num);

        let rels = secs.relocations(text);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].r_offset, 36);
        assert_eq!(secs.elf_sym_name(symtab, rels[0].r_sym as usize), "g");
    }

    #[test]
    fn test_object_duplicate_definition() {
        let mut secs = Sections::new();
        let obj = object_defining("f", None);
        load_object(&mut secs, &obj).unwrap();
        assert_eq!(load_object(&mut secs, &obj), Err(ElfError::DefinedTwice("f".to_string())));
    }

    #[test]
    fn test_archive_loads_members_on_demand() {
        let a = object_defining("a", Some("b"));
        let b = object_defining("b", None);
        let unused = object_defining("unused", None);
        let ar = archive(&[("a.o", a, &["a"]), ("b.o", b, &["b"]), ("u.o", unused, &["unused"])]);

        let mut secs = Sections::new();
        let symtab = secs.symtab;
        secs.put_elf_sym(symtab, 0, 0, global(STT_FUNC), 0, SHN_UNDEF, Some("a"));
        assert_eq!(load_archive(&mut secs, &ar).unwrap(), 2);
        let b = secs.find_elf_sym(symtab, "b");
        assert_ne!(secs.elf_sym(symtab, b).st_shndx, SHN_UNDEF);
        assert_eq!(secs.find_elf_sym(symtab, "unused"), 0);
    }

    #[test]
    fn test_archive_without_needed_symbols_loads_nothing() {
        let ar = archive(&[("a.o", object_defining("a", None), &["a"])]);
        let mut secs = Sections::new();
        let symtab = secs.symtab;
        secs.put_elf_sym(symtab, 0, 0, global(STT_OBJECT), 0, SHN_ABS, Some("a"));
        assert_eq!(load_archive(&mut secs, &ar).unwrap(), 0);
    }

    #[test]
    fn test_malformed_objects_are_rejected() {
        let good = object_defining("f", Some("g"));

        let mut bad_shoff = good.clone();
        bad_shoff[40..48].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(load_object(&mut Sections::new(), &bad_shoff), Err(ElfError::Malformed(_))));

        let truncated = &good[..good.len() / 2];
        assert!(load_object(&mut Sections::new(), truncated).is_err());
        assert!(load_object(&mut Sections::new(), &good[..10]).is_err());

        let mut big_endian = good.clone();
        big_endian[5] = 2;
        assert_eq!(load_object(&mut Sections::new(), &big_endian), Err(ElfError::UnsupportedClass));
    }

    #[test]
    fn test_relocation_outside_section_is_rejected() {
        let mut secs = Sections::new();
        let (symtab, text) = (secs.symtab, secs.text);
        secs[text].ptr_add(8);
        let shndx = secs[text].sh_num as u16;
        let f = secs.put_elf_sym(symtab, 0, 8, global(STT_FUNC), 0, shndx, Some("f"));
        secs.put_elf_reloc(symtab, text, 4, R_X86_64_64, f, 0);
        let obj = object_bytes(&secs).unwrap();

        let err = load_object(&mut Sections::new(), &obj).unwrap_err();
        assert!(matches!(err, ElfError::InvalidRelocation { index: 0, .. }), "{:?}", err);
    }

    #[test]
    fn test_bss_input_section_takes_no_storage() {
        let mut secs = Sections::new();
        let (symtab, bss) = (secs.symtab, secs.bss);
        secs[bss].grow(1 << 20);
        let shndx = secs[bss].sh_num as u16;
        secs.put_elf_sym(symtab, 0, 1 << 20, global(STT_OBJECT), 0, shndx, Some("buffer"));
        let obj = object_bytes(&secs).unwrap();
        assert!(obj.len() < 4096);

        let mut merged = Sections::new();
        load_object(&mut merged, &obj).unwrap();
        let bss = &merged[merged.bss];
        assert_eq!(bss.data_offset(), 1 << 20);
        assert_eq!(bss.data_allocated(), 0);
    }

    #[test]
    fn test_archive_with_bad_member_size() {
        let mut ar = ARMAG.to_vec();
        let mut header = format!("{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}", "a.o/", 0, 0, 0, 644, 9999).into_bytes();
        header.extend_from_slice(b"`\n");
        ar.extend(header);
        ar.extend_from_slice(b"short");
        assert!(load_archive(&mut Sections::new(), &ar).is_err());
    }

    #[test]
    fn test_ld_script() {
        let script = b"/* GNU ld script */\nOUTPUT_FORMAT(elf64-x86-64)\nGROUP ( /lib/libc.so.6 /usr/lib/libc_nonshared.a  AS_NEEDED ( /lib/ld-linux-x86-64.so.2 ) -lgcc )\n";
        let inputs = parse_ld_script(script).unwrap();
        assert_eq!(
            inputs,
            vec![
                ScriptInput::File("/lib/libc.so.6".to_string()),
                ScriptInput::File("/usr/lib/libc_nonshared.a".to_string()),
                ScriptInput::File("/lib/ld-linux-x86-64.so.2".to_string()),
                ScriptInput::Library("gcc".to_string()),
            ]
        );
        assert!(parse_ld_script(b"SECTIONS { }").is_err());
        assert!(parse_ld_script(b"GROUP ( a.o").is_err());
    }
}
