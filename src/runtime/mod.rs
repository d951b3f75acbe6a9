//! In-memory linking and execution
//!
//! [`relocate`] turns the sections of a compilation state into a runnable
//! image without writing any file:
//!
//! 1. common symbols get their space at the end of `.bss`
//! 2. undefined symbols are resolved through a lookup callback (the host
//!    process and the libraries it has loaded); weak ones may stay at 0
//! 3. every allocated section is placed in one anonymous mapping, followed
//!    by a GOT and a jump table for symbols that live outside it
//! 4. relocations are applied and the mapping is made executable
//!
//! The [`Image`] owns that single mapping; dropping it unmaps exactly what
//! [`relocate`] mapped.

pub mod reloc;

use crate::elf::{SectionId, Sections, R_X86_64_PLT32, SHF_ALLOC, SHN_ABS, SHN_COMMON, SHN_UNDEF, SHT_NOBITS, STB_LOCAL, STB_WEAK};
use crate::util::align_up;
use log::{debug, trace};
use memmap2::MmapMut;
use reloc::RelocError;
use rustc_hash::FxHashMap;
use libc::{c_char, c_int, c_void};
use std::ffi::CString;
use std::fmt;

const GOT_ENTRY_SIZE: u64 = 8;
/// `jmp *rel32(%rip)` padded with `int3`
const JUMP_SLOT_SIZE: u64 = 8;

/// Failures while linking in memory or starting the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// Referenced symbols nobody defines
    Undefined(Vec<String>),
    Overflow { symbol: String, r_type: u32 },
    UnsupportedRelocation { symbol: String, r_type: u32 },
    /// Relocation whose field lies outside its section
    BadRelocation { symbol: String, r_type: u32 },
    /// A section outgrew its limit while placing common symbols
    SectionTooLarge(String),
    /// Mapping or protecting memory failed
    Map(String),
    /// The entry symbol does not exist
    NoEntry(String),
    /// Program arguments containing NUL bytes
    BadArgument(String),
    NotRelocated,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Undefined(names) => {
                let quoted: Vec<String> = names.iter().map(|n| format!("'{}'", n)).collect();
                write!(f, "undefined symbol {}", quoted.join(", "))
            }
            RunError::Overflow { symbol, r_type } => {
                write!(f, "relocation {} against '{}' out of range", r_type, symbol)
            }
            RunError::UnsupportedRelocation { symbol, r_type } => {
                write!(f, "unsupported relocation {} against '{}'", r_type, symbol)
            }
            RunError::BadRelocation { symbol, r_type } => {
                write!(f, "relocation {} against '{}' outside its section", r_type, symbol)
            }
            RunError::SectionTooLarge(name) => write!(f, "section '{}' is too large", name),
            RunError::Map(msg) => write!(f, "could not map code: {}", msg),
            RunError::NoEntry(name) => write!(f, "{} not defined", name),
            RunError::BadArgument(arg) => write!(f, "invalid program argument {:?}", arg),
            RunError::NotRelocated => write!(f, "program is not relocated"),
        }
    }
}

impl std::error::Error for RunError {}

/// Relocated program resident in memory
pub struct Image {
    map: MmapMut,
    symbols: FxHashMap<String, u64>,
}

impl Image {
    /// Runtime address of a global symbol.
    pub fn get_symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn base(&self) -> u64 {
        self.map.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

/// Give every `SHN_COMMON` symbol its space in `.bss`.
pub fn place_common_symbols(secs: &mut Sections) -> Result<(), RunError> {
    let (symtab, bss) = (secs.symtab, secs.bss);
    let bss_num = secs[bss].sh_num as u16;
    for index in 1..secs.nb_syms(symtab) {
        let mut sym = secs.elf_sym(symtab, index);
        if sym.st_shndx != SHN_COMMON {
            continue;
        }
        // a common symbol's value is its alignment
        let align = sym.st_value.max(1);
        let sec = &mut secs[bss];
        if align > sec.sh_addralign {
            sec.sh_addralign = align;
        }
        sec.align_to(align);
        let offset = sec
            .grow(sym.st_size)
            .ok_or_else(|| RunError::SectionTooLarge(sec.name.clone()))?;
        sym.st_shndx = bss_num;
        sym.st_value = offset as u64;
        secs.set_elf_sym(symtab, index, &sym);
    }
    Ok(())
}

/// Bind undefined symbols to addresses found by `lookup`. Unresolved weak
/// symbols stay undefined and read as 0.
pub fn resolve_undefined(
    secs: &mut Sections,
    lookup: &mut dyn FnMut(&str) -> Option<u64>,
) -> Result<(), RunError> {
    let symtab = secs.symtab;
    let mut missing = Vec::new();
    for index in 1..secs.nb_syms(symtab) {
        let mut sym = secs.elf_sym(symtab, index);
        if sym.st_shndx != SHN_UNDEF || sym.bind() == STB_LOCAL {
            continue;
        }
        let name = secs.elf_sym_name(symtab, index).to_string();
        match lookup(&name) {
            Some(addr) => {
                trace!("resolved {} = {:#x}", name, addr);
                sym.st_shndx = SHN_ABS;
                sym.st_value = addr;
                secs.set_elf_sym(symtab, index, &sym);
            }
            None if sym.bind() == STB_WEAK => {}
            None => missing.push(name),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RunError::Undefined(missing))
    }
}

/// Slots handed out in first-use order
#[derive(Default)]
struct SlotTable {
    index: FxHashMap<usize, u64>,
}

impl SlotTable {
    fn slot(&mut self, sym: usize) {
        let next = self.index.len() as u64;
        self.index.entry(sym).or_insert(next);
    }

    fn get(&self, sym: usize) -> Option<u64> {
        self.index.get(&sym).copied()
    }

    fn len(&self) -> u64 {
        self.index.len() as u64
    }
}

fn allocated_sections(secs: &Sections) -> Vec<SectionId> {
    secs.public()
        .iter()
        .skip(1)
        .copied()
        .filter(|&id| secs[id].sh_flags & SHF_ALLOC != 0)
        .collect()
}

fn symbol_address(secs: &Sections, index: usize) -> u64 {
    let sym = secs.elf_sym(secs.symtab, index);
    match sym.st_shndx {
        SHN_UNDEF => 0,
        SHN_ABS => sym.st_value,
        shndx => secs
            .by_num(shndx as usize)
            .map_or(0, |id| secs[id].sh_addr + sym.st_value),
    }
}

/// Link the sections into executable memory.
pub fn relocate(
    secs: &mut Sections,
    lookup: &mut dyn FnMut(&str) -> Option<u64>,
) -> Result<Image, RunError> {
    place_common_symbols(secs)?;
    resolve_undefined(secs, lookup)?;

    let symtab = secs.symtab;
    let sections = allocated_sections(secs);

    // which symbols need a GOT entry or a jump slot
    let mut got = SlotTable::default();
    let mut plt = SlotTable::default();
    for &id in &sections {
        for rel in secs.relocations(id) {
            let sym = rel.r_sym as usize;
            if reloc::uses_got(rel.r_type) {
                got.slot(sym);
            } else if rel.r_type == R_X86_64_PLT32
                && secs.elf_sym(symtab, sym).st_shndx == SHN_ABS
            {
                got.slot(sym);
                plt.slot(sym);
            }
        }
    }

    let mut offsets = Vec::with_capacity(sections.len());
    let mut size = 0u64;
    for &id in &sections {
        let sec = &secs[id];
        size = align_up(size, sec.sh_addralign.max(1));
        offsets.push(size);
        size += sec.data_offset() as u64;
    }
    let got_offset = align_up(size, GOT_ENTRY_SIZE);
    size = got_offset + got.len() * GOT_ENTRY_SIZE;
    let plt_offset = align_up(size, 16);
    size = plt_offset + plt.len() * JUMP_SLOT_SIZE;

    let mut map = MmapMut::map_anon(size.max(1) as usize).map_err(|e| RunError::Map(e.to_string()))?;
    let base = map.as_ptr() as u64;
    for (&id, &offset) in sections.iter().zip(&offsets) {
        secs[id].sh_addr = base + offset;
    }

    // contents; .bss and the tables start zeroed
    for (&id, &offset) in sections.iter().zip(&offsets) {
        let sec = &secs[id];
        if sec.sh_type == SHT_NOBITS {
            continue;
        }
        let start = offset as usize;
        map[start..start + sec.data().len()].copy_from_slice(sec.data());
    }

    let addresses: Vec<u64> = (0..secs.nb_syms(symtab)).map(|i| symbol_address(secs, i)).collect();
    let got_addr = |slot: u64| base + got_offset + slot * GOT_ENTRY_SIZE;
    for (&sym, &slot) in &got.index {
        let at = (got_offset + slot * GOT_ENTRY_SIZE) as usize;
        map[at..at + 8].copy_from_slice(&addresses[sym].to_le_bytes());
    }
    for (&sym, &slot) in &plt.index {
        let at = (plt_offset + slot * JUMP_SLOT_SIZE) as usize;
        let entry = got.get(sym).map_or(0, got_addr);
        let disp = entry.wrapping_sub(base + at as u64 + 6) as i32;
        map[at..at + 2].copy_from_slice(&[0xff, 0x25]);
        map[at + 2..at + 6].copy_from_slice(&disp.to_le_bytes());
        map[at + 6..at + 8].copy_from_slice(&[0xcc, 0xcc]);
    }

    let mut nb_relocs = 0;
    for (&id, &offset) in sections.iter().zip(&offsets) {
        let sec_addr = secs[id].sh_addr;
        let sec_size = secs[id].data().len() as u64;
        for rel in secs.relocations(id) {
            let sym = rel.r_sym as usize;
            let symbol = || secs.elf_sym_name(symtab, sym).to_string();
            if rel.r_offset > sec_size {
                return Err(RunError::BadRelocation { symbol: symbol(), r_type: rel.r_type });
            }
            let target = match plt.get(sym) {
                Some(slot) if rel.r_type == R_X86_64_PLT32 => base + plt_offset + slot * JUMP_SLOT_SIZE,
                _ => addresses.get(sym).copied().unwrap_or(0),
            };
            let at = (offset + rel.r_offset) as usize;
            let place = sec_addr + rel.r_offset;
            let entry = got.get(sym).map(got_addr);
            trace!("reloc type {} at {:#x} -> {:#x}{:+}", rel.r_type, place, target, rel.r_addend);
            // the field may not reach into the next section
            let end = (offset + sec_size) as usize;
            reloc::apply(&mut map[at..end], rel.r_type, place, target, rel.r_addend, entry).map_err(
                |e| {
                    let (symbol, r_type) = (symbol(), rel.r_type);
                    match e {
                        RelocError::Overflow => RunError::Overflow { symbol, r_type },
                        RelocError::OutOfBounds => RunError::BadRelocation { symbol, r_type },
                        RelocError::Unsupported | RelocError::MissingGot => {
                            RunError::UnsupportedRelocation { symbol, r_type }
                        }
                    }
                },
            )?;
            nb_relocs += 1;
        }
    }

    set_executable(&mut map)?;

    let symbols = secs
        .global_syms(symtab)
        .into_iter()
        .filter(|&(index, _)| secs.elf_sym(symtab, index).st_shndx != SHN_UNDEF)
        .map(|(index, name)| (name, addresses[index]))
        .collect();
    debug!(
        "relocated {} bytes at {:#x}: {} relocations, {} GOT entries, {} jump slots",
        size,
        base,
        nb_relocs,
        got.len(),
        plt.len()
    );
    Ok(Image { map, symbols })
}

/// Allow execution of the mapping while keeping it writable for the
/// program's data.
fn set_executable(map: &mut MmapMut) -> Result<(), RunError> {
    let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    // SAFETY: the range is exactly the live anonymous mapping owned by `map`
    let rc = unsafe { libc::mprotect(map.as_mut_ptr() as *mut c_void, map.len(), prot) };
    if rc != 0 {
        return Err(RunError::Map(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

/// Call `entry` as `int entry(int argc, char **argv)`.
pub fn run(image: &Image, entry: &str, args: &[String]) -> Result<i32, RunError> {
    let addr = image
        .get_symbol(entry)
        .filter(|&a| a != 0)
        .ok_or_else(|| RunError::NoEntry(entry.to_string()))?;
    let cargs = args
        .iter()
        .map(|a| CString::new(a.as_str()).map_err(|_| RunError::BadArgument(a.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    let mut argv: Vec<*mut c_char> = cargs.iter().map(|a| a.as_ptr() as *mut c_char).collect();
    argv.push(std::ptr::null_mut());

    debug!("run {} at {:#x} with {} argument(s)", entry, addr, cargs.len());
    // SAFETY: `addr` is the relocated entry point inside `image`, which
    // outlives the call; the compiler emits SysV `int (int, char **)` code
    let status = unsafe {
        let main: unsafe extern "C" fn(c_int, *mut *mut c_char) -> c_int =
            std::mem::transmute(addr as usize);
        main(cargs.len() as c_int, argv.as_mut_ptr())
    };
    Ok(status)
}

/// Address of `name` in the host process or any library loaded with
/// `RTLD_GLOBAL`.
pub fn host_symbol(name: &str) -> Option<u64> {
    let cname = CString::new(name).ok()?;
    // SAFETY: dlsym only reads the NUL-terminated name
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
    (!addr.is_null()).then_some(addr as u64)
}

/// A shared library opened for in-memory runs
#[derive(Debug)]
pub struct DynamicLibrary {
    handle: *mut c_void,
    pub path: String,
}

impl DynamicLibrary {
    /// `dlopen` with global symbol visibility so that [`host_symbol`] finds
    /// its exports.
    pub fn open(path: &str) -> Result<Self, String> {
        let cpath = CString::new(path).map_err(|_| format!("invalid path {:?}", path))?;
        // SAFETY: the path is NUL-terminated; the handle is closed on drop
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_GLOBAL | libc::RTLD_LAZY) };
        if handle.is_null() {
            return Err(dl_error());
        }
        debug!("dlopen {}", path);
        Ok(DynamicLibrary {
            handle,
            path: path.to_string(),
        })
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        // SAFETY: `handle` came from a successful dlopen and is closed once
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

fn dl_error() -> String {
    // SAFETY: dlerror returns a thread-local C string or null
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "dlopen failed".to_string()
        } else {
            std::ffi::CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::symtab::ElfSym;
    use crate::elf::{R_X86_64_64, STB_GLOBAL, STT_FUNC, STT_OBJECT};

    fn global(typ: u8) -> u8 {
        ElfSym::info(STB_GLOBAL, typ)
    }

    #[test]
    fn test_common_symbols_go_to_bss() {
        let mut secs = Sections::new();
        let (symtab, bss) = (secs.symtab, secs.bss);
        secs[bss].ptr_add(4);
        let c = secs.put_elf_sym(symtab, 16, 8, global(STT_OBJECT), 0, SHN_COMMON, Some("c"));
        place_common_symbols(&mut secs).unwrap();
        let sym = secs.elf_sym(symtab, c);
        assert_eq!(sym.st_shndx as usize, secs[bss].sh_num);
        assert_eq!(sym.st_value, 16);
        assert_eq!(secs[bss].data_offset(), 24);
    }

    #[test]
    fn test_undefined_symbols() {
        let mut secs = Sections::new();
        let symtab = secs.symtab;
        let weak = ElfSym::info(STB_WEAK, STT_FUNC);
        secs.put_elf_sym(symtab, 0, 0, global(STT_FUNC), 0, SHN_UNDEF, Some("known"));
        secs.put_elf_sym(symtab, 0, 0, weak, 0, SHN_UNDEF, Some("maybe"));
        secs.put_elf_sym(symtab, 0, 0, global(STT_FUNC), 0, SHN_UNDEF, Some("missing"));
        let mut lookup = |name: &str| (name == "known").then_some(0x1234);
        let err = resolve_undefined(&mut secs, &mut lookup).unwrap_err();
        assert_eq!(err, RunError::Undefined(vec!["missing".to_string()]));
        assert_eq!(err.to_string(), "undefined symbol 'missing'");
        let known = secs.find_elf_sym(symtab, "known");
        assert_eq!(secs.elf_sym(symtab, known).st_shndx, SHN_ABS);
        assert_eq!(symbol_address(&secs, known), 0x1234);
    }

    #[test]
    fn test_relocate_data_pointer() {
        let mut secs = Sections::new();
        let (symtab, data) = (secs.symtab, secs.data);
        let shndx = secs[data].sh_num as u16;
        secs[data].ptr_add(16);
        let target = secs.put_elf_sym(symtab, 8, 8, global(STT_OBJECT), 0, shndx, Some("value"));
        secs.put_elf_sym(symtab, 0, 8, global(STT_OBJECT), 0, shndx, Some("ptr"));
        secs.put_elf_reloc(symtab, data, 0, R_X86_64_64, target, 0);

        let image = relocate(&mut secs, &mut |_| None).unwrap();
        let ptr = image.get_symbol("ptr").unwrap();
        let value = image.get_symbol("value").unwrap();
        assert_eq!(value, ptr + 8);
        // SAFETY: `ptr` points into the live image
        let stored = unsafe { std::ptr::read_unaligned(ptr as *const u64) };
        assert_eq!(stored, value);
    }

    #[test]
    fn test_relocation_past_section_end() {
        let mut secs = Sections::new();
        let (symtab, data) = (secs.symtab, secs.data);
        let shndx = secs[data].sh_num as u16;
        secs[data].ptr_add(16);
        let target = secs.put_elf_sym(symtab, 0, 8, global(STT_OBJECT), 0, shndx, Some("value"));
        secs.put_elf_reloc(symtab, data, 12, R_X86_64_64, target, 0);
        let err = relocate(&mut secs, &mut |_| None).unwrap_err();
        assert_eq!(
            err,
            RunError::BadRelocation { symbol: "value".to_string(), r_type: R_X86_64_64 }
        );

        let mut secs = Sections::new();
        let (symtab, data) = (secs.symtab, secs.data);
        secs[data].ptr_add(8);
        secs.put_elf_reloc(symtab, data, 64, R_X86_64_64, 0, 0);
        assert!(matches!(
            relocate(&mut secs, &mut |_| None),
            Err(RunError::BadRelocation { .. })
        ));
    }

    #[test]
    fn test_large_bss_is_mapped_lazily() {
        let mut secs = Sections::new();
        let (symtab, bss) = (secs.symtab, secs.bss);
        let shndx = secs[bss].sh_num as u16;
        secs[bss].grow(1 << 28);
        secs.put_elf_sym(symtab, 0, 1 << 28, global(STT_OBJECT), 0, shndx, Some("arena"));
        let image = relocate(&mut secs, &mut |_| None).unwrap();
        assert!(image.len() >= 1 << 28);
        assert_eq!(secs[bss].data_allocated(), 0);
        let arena = image.get_symbol("arena").unwrap();
        // SAFETY: `arena` is the start of the live, zero-filled .bss mapping
        assert_eq!(unsafe { std::ptr::read((arena + (1 << 27)) as *const u8) }, 0);
    }

    #[test]
    fn test_host_symbol_lookup() {
        assert!(host_symbol("malloc").is_some());
        assert!(host_symbol("surely_no_such_symbol_here").is_none());
    }
}
