//! Relocatable object output
//!
//! Serializes the public sections of a [`Sections`] arena as an ELF64
//! `ET_REL` file through `object`'s ELF writer.
//!
//! - Section numbers are reserved in arena order, so symbol section indices
//!   and `.rela` links stay valid without translation
//! - `.symtab` is rewritten with all local symbols first, as ELF requires,
//!   and every relocation is renumbered to match
//! - `SHT_NOBITS` sections occupy no file space
//! - `.shstrtab` is the last section

use super::symtab::{relocations_in, Rela};
use super::{SectionId, Sections, EM_X86_64, ET_REL, SHT_NOBITS, SHT_RELA, STB_LOCAL};
use log::debug;
use object::elf::ELFOSABI_NONE;
use object::write::elf::{FileHeader, Rel, SectionHeader, Sym, Writer};
use object::write::StringId;
use object::Endianness;

/// Symbol order with locals first. `remap[old] == new`.
struct SortedSymtab {
    order: Vec<usize>,
    remap: Vec<u32>,
    first_global: u32,
}

fn sort_symtab(secs: &Sections, symtab: SectionId) -> SortedSymtab {
    let n = secs.nb_syms(symtab);
    let (locals, globals): (Vec<usize>, Vec<usize>) =
        (0..n).partition(|&i| i == 0 || secs.elf_sym(symtab, i).bind() == STB_LOCAL);

    let first_global = locals.len() as u32;
    let order: Vec<usize> = locals.into_iter().chain(globals).collect();
    let mut remap = vec![0u32; n];
    for (new, &old) in order.iter().enumerate() {
        remap[old] = new as u32;
    }
    SortedSymtab {
        order,
        remap,
        first_global,
    }
}

fn remap_relocations(rels: &mut [Rela], remap: &[u32]) {
    for rel in rels {
        rel.r_sym = remap.get(rel.r_sym as usize).copied().unwrap_or(0);
    }
}

/// How one public section is written
enum Slot {
    Symtab,
    Strtab,
    Rela { name: StringId, rels: Vec<Rela>, offset: usize },
    Data { name: StringId, offset: usize },
}

/// Build the complete object file image.
pub fn object_bytes(secs: &Sections) -> object::write::Result<Vec<u8>> {
    let symtab = secs.symtab;
    let strtab = secs[symtab].link;
    let sorted = sort_symtab(secs, symtab);
    let public = secs.public();

    let mut buffer = Vec::new();
    let mut writer = Writer::new(Endianness::Little, true, &mut buffer);

    // section numbers, in arena order
    writer.reserve_null_section_index();
    let mut slots = Vec::with_capacity(public.len());
    for &id in public.iter().skip(1) {
        let sec = &secs[id];
        let slot = if id == symtab {
            writer.reserve_symtab_section_index();
            Slot::Symtab
        } else if Some(id) == strtab {
            writer.reserve_strtab_section_index();
            Slot::Strtab
        } else {
            let name = writer.add_section_name(sec.name.as_bytes());
            let index = writer.reserve_section_index();
            debug_assert_eq!(index.0 as usize, sec.sh_num);
            if sec.sh_type == SHT_RELA && sec.link == Some(symtab) {
                let mut rels = relocations_in(sec);
                remap_relocations(&mut rels, &sorted.remap);
                Slot::Rela { name, rels, offset: 0 }
            } else {
                Slot::Data { name, offset: 0 }
            }
        };
        slots.push((id, slot));
    }
    writer.reserve_shstrtab_section_index();

    // symbol names and indices
    let names: Vec<Option<StringId>> = sorted
        .order
        .iter()
        .map(|&old| {
            let name = secs.elf_sym_name(symtab, old);
            (old != 0 && !name.is_empty()).then(|| writer.add_string(name.as_bytes()))
        })
        .collect();
    writer.reserve_null_symbol_index();
    for _ in 1..sorted.order.len() {
        writer.reserve_symbol_index(None);
    }

    // file layout: header, contents, tables, relocations, names, headers
    writer.reserve_file_header();
    for (id, slot) in slots.iter_mut() {
        if let Slot::Data { offset, .. } = slot {
            let sec = &secs[*id];
            *offset = if sec.sh_type == SHT_NOBITS || sec.data().is_empty() {
                writer.reserved_len()
            } else {
                writer.reserve(sec.data().len(), sec.sh_addralign.max(1) as usize)
            };
        }
    }
    writer.reserve_symtab();
    writer.reserve_strtab();
    for (_, slot) in slots.iter_mut() {
        if let Slot::Rela { rels, offset, .. } = slot {
            *offset = if rels.is_empty() {
                writer.reserved_len()
            } else {
                writer.reserve_relocations(rels.len(), true)
            };
        }
    }
    writer.reserve_shstrtab();
    writer.reserve_section_headers();

    writer.write_file_header(&FileHeader {
        os_abi: ELFOSABI_NONE,
        abi_version: 0,
        e_type: ET_REL,
        e_machine: EM_X86_64,
        e_entry: 0,
        e_flags: 0,
    })?;
    for (id, slot) in &slots {
        let sec = &secs[*id];
        if let Slot::Data { .. } = slot {
            if sec.sh_type != SHT_NOBITS && !sec.data().is_empty() {
                writer.write_align(sec.sh_addralign.max(1) as usize);
                writer.write(sec.data());
            }
        }
    }
    writer.write_null_symbol();
    for (new, &old) in sorted.order.iter().enumerate().skip(1) {
        let sym = secs.elf_sym(symtab, old);
        writer.write_symbol(&Sym {
            name: names[new],
            section: None,
            st_info: sym.st_info,
            st_other: sym.st_other,
            st_shndx: sym.st_shndx,
            st_value: sym.st_value,
            st_size: sym.st_size,
        });
    }
    writer.write_strtab();
    for (_, slot) in &slots {
        if let Slot::Rela { rels, .. } = slot {
            if rels.is_empty() {
                continue;
            }
            writer.write_align_relocation();
            for rel in rels {
                writer.write_relocation(
                    true,
                    &Rel {
                        r_offset: rel.r_offset,
                        r_sym: rel.r_sym,
                        r_type: rel.r_type,
                        r_addend: rel.r_addend,
                    },
                );
            }
        }
    }
    writer.write_shstrtab();

    writer.write_null_section_header();
    for (id, slot) in &slots {
        let sec = &secs[*id];
        let link = sec.link.map_or(0, |l| secs[l].sh_num as u32);
        match slot {
            Slot::Symtab => writer.write_symtab_section_header(sorted.first_global),
            Slot::Strtab => writer.write_strtab_section_header(),
            Slot::Rela { name, rels, offset } => writer.write_section_header(&SectionHeader {
                name: Some(*name),
                sh_type: SHT_RELA,
                sh_flags: sec.sh_flags as u64,
                sh_addr: 0,
                sh_offset: *offset as u64,
                sh_size: (rels.len() * super::symtab::RELA_SIZE) as u64,
                sh_link: link,
                sh_info: sec.sh_info,
                sh_addralign: 8,
                sh_entsize: super::symtab::RELA_SIZE as u64,
            }),
            Slot::Data { name, offset } => writer.write_section_header(&SectionHeader {
                name: Some(*name),
                sh_type: sec.sh_type,
                sh_flags: sec.sh_flags as u64,
                sh_addr: 0,
                sh_offset: *offset as u64,
                sh_size: sec.data_offset() as u64,
                sh_link: link,
                sh_info: sec.sh_info,
                sh_addralign: sec.sh_addralign.max(1),
                sh_entsize: sec.sh_entsize,
            }),
        }
    }
    writer.write_shstrtab_section_header();

    debug!(
        "object: {} sections, {} symbols, {} bytes",
        public.len() + 1,
        sorted.order.len(),
        buffer.len()
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::loader::load_object;
    use crate::elf::symtab::ElfSym;
    use crate::elf::{R_X86_64_PLT32, SHN_UNDEF, STB_GLOBAL, STT_FILE, STT_FUNC, STT_OBJECT};
    use object::read::elf::{FileHeader as _, SectionHeader as _};
    use object::LittleEndian;

    type Elf = object::elf::FileHeader64<LittleEndian>;

    #[test]
    fn test_header_and_shstrtab() {
        let mut secs = Sections::new();
        let text_id = secs.text;
        secs[text_id].ptr_add(1)[0] = 0xc3;
        let bytes = object_bytes(&secs).unwrap();

        let header = Elf::parse(&*bytes).unwrap();
        let endian = header.endian().unwrap();
        assert_eq!(header.e_type(endian), ET_REL);
        assert_eq!(header.e_machine(endian), EM_X86_64);
        let sections = header.sections(endian, &*bytes).unwrap();
        let shstrndx = header.e_shstrndx(endian) as usize;
        assert_eq!(shstrndx, sections.len() - 1);

        // .text holds the one byte and keeps its number
        let text = sections.section(object::SectionIndex(secs[text_id].sh_num)).unwrap();
        assert_eq!(sections.section_name(endian, text).unwrap(), b".text");
        assert_eq!(text.sh_type(endian), crate::elf::SHT_PROGBITS);
        assert_eq!(text.data(endian, &*bytes).unwrap(), &[0xc3]);
    }

    #[test]
    fn test_locals_are_moved_first() {
        let mut secs = Sections::new();
        let symtab = secs.symtab;
        let text = secs[secs.text].sh_num as u16;
        let g = secs.put_elf_sym(symtab, 0, 0, ElfSym::info(STB_GLOBAL, STT_FUNC), 0, SHN_UNDEF, Some("puts"));
        let l = secs.put_elf_sym(symtab, 0, 0, ElfSym::info(STB_LOCAL, STT_FILE), 0, text, Some("a.c"));
        assert_eq!((g, l), (1, 2));
        let text_id = secs.text;
        secs.put_elf_reloc(symtab, text_id, 0, R_X86_64_PLT32, g, -4);

        let sorted = sort_symtab(&secs, symtab);
        assert_eq!(sorted.first_global, 2);
        assert_eq!(sorted.remap, vec![0, 2, 1]);

        let mut rels = secs.relocations(text_id);
        remap_relocations(&mut rels, &sorted.remap);
        assert_eq!(rels[0].r_sym, 2);
    }

    #[test]
    fn test_bss_size_without_file_space() {
        let mut secs = Sections::new();
        let (symtab, bss) = (secs.symtab, secs.bss);
        secs[bss].grow(4_000_000_000);
        let shndx = secs[bss].sh_num as u16;
        secs.put_elf_sym(symtab, 0, 4_000_000_000, ElfSym::info(STB_GLOBAL, STT_OBJECT), 0, shndx, Some("big"));
        let bytes = object_bytes(&secs).unwrap();
        assert!(bytes.len() < 4096);

        let header = Elf::parse(&*bytes).unwrap();
        let endian = header.endian().unwrap();
        let sections = header.sections(endian, &*bytes).unwrap();
        let sh = sections.section(object::SectionIndex(secs[bss].sh_num)).unwrap();
        assert_eq!(sh.sh_type(endian), SHT_NOBITS);
        assert_eq!(sh.sh_size(endian), 4_000_000_000);

        let mut merged = Sections::new();
        load_object(&mut merged, &bytes).unwrap();
        let big = merged.find_elf_sym(merged.symtab, "big");
        assert_eq!(merged.elf_sym(merged.symtab, big).st_size, 4_000_000_000);
    }
}
