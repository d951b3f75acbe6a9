//! Scoped symbol tables
//!
//! Symbols live in one arena and are addressed by [`SymId`]. Each namespace
//! (ordinary identifiers, struct/union/enum tags, labels) maps a name to its
//! innermost binding; every symbol remembers the binding it shadows, so
//! popping a scope is a matter of walking the scope stack back to a mark
//! and restoring those links.
//!
//! - File-scope symbols stay bound until the end of the translation unit
//! - Block-scope symbols are popped when their block closes
//! - Labels are function-scoped and popped when the function ends

pub mod types;

use crate::elf::SectionId;
use crate::parser::intern::{TokId, SYM_FIRST_ANON};
use rustc_hash::FxHashMap;
use types::{CType, Field, StructDef, StructId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymId(pub usize);

/// Where a symbol's value lives
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    /// Static storage, reached through the ELF symbol
    Global,
    /// Frame slot at `rbp + offset`
    Local(i32),
    Typedef,
    EnumConst(i64),
    /// Code position once the label is placed, and the jumps still waiting
    /// for it
    Label {
        pos: Option<usize>,
        pending: Vec<usize>,
    },
    /// struct/union/enum tag
    Tag,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymFlags {
    pub is_static: bool,
    pub is_extern: bool,
    pub is_weak: bool,
    pub is_inline: bool,
    pub noreturn: bool,
    /// Has a definition (function body or initializer)
    pub defined: bool,
    /// File-scope object declared without initializer
    pub tentative: bool,
    /// Referenced; inline functions are only emitted when set
    pub used: bool,
}

#[derive(Debug, Clone)]
pub struct Sym {
    pub v: TokId,
    pub ty: CType,
    pub storage: Storage,
    pub flags: SymFlags,
    /// Index in `.symtab`, 0 while the symbol has no ELF counterpart
    pub elf_sym: usize,
    /// Assembler name from `__asm__("name")`
    pub asm_label: Option<String>,
    /// Output section from `__attribute__((section(..)))`
    pub section: Option<SectionId>,
    /// Extra alignment from `__attribute__((aligned(n)))`
    pub align: u64,
    /// Block depth the symbol was declared at
    pub scope: u32,
    prev: Option<SymId>,
}

impl Sym {
    pub fn new(v: TokId, ty: CType, storage: Storage) -> Self {
        Sym {
            v,
            ty,
            storage,
            flags: SymFlags::default(),
            elf_sym: 0,
            asm_label: None,
            section: None,
            align: 0,
            scope: 0,
            prev: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Ident,
    Tag,
    Label,
}

/// All symbols of one translation unit
#[derive(Debug, Default)]
pub struct SymTable {
    syms: Vec<Sym>,
    idents: FxHashMap<TokId, SymId>,
    tags: FxHashMap<TokId, SymId>,
    labels: FxHashMap<TokId, SymId>,
    global_stack: Vec<(Namespace, SymId)>,
    local_stack: Vec<(Namespace, SymId)>,
    label_stack: Vec<SymId>,
    /// 0 at file scope, incremented per nested block
    pub block_depth: u32,
    pub structs: Vec<StructDef>,
    anon: u32,
}

impl SymTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, ns: Namespace) -> &FxHashMap<TokId, SymId> {
        match ns {
            Namespace::Ident => &self.idents,
            Namespace::Tag => &self.tags,
            Namespace::Label => &self.labels,
        }
    }

    fn map_mut(&mut self, ns: Namespace) -> &mut FxHashMap<TokId, SymId> {
        match ns {
            Namespace::Ident => &mut self.idents,
            Namespace::Tag => &mut self.tags,
            Namespace::Label => &mut self.labels,
        }
    }

    /// Fresh name for an anonymous symbol.
    pub fn anon_id(&mut self) -> TokId {
        let id = TokId(SYM_FIRST_ANON + self.anon);
        self.anon += 1;
        id
    }

    /// Store a symbol without binding its name (string literals, compound
    /// temporaries).
    pub fn alloc(&mut self, mut sym: Sym) -> SymId {
        sym.scope = self.block_depth;
        let id = SymId(self.syms.len());
        self.syms.push(sym);
        id
    }

    /// Bind `sym` in `ns` at the current scope, shadowing any outer binding.
    pub fn push(&mut self, ns: Namespace, sym: Sym) -> SymId {
        let v = sym.v;
        let id = self.alloc(sym);
        let prev = self.map_mut(ns).insert(v, id);
        self.syms[id.0].prev = prev;
        match ns {
            Namespace::Label => self.label_stack.push(id),
            _ if self.block_depth > 0 => self.local_stack.push((ns, id)),
            _ => self.global_stack.push((ns, id)),
        }
        id
    }

    /// Bind `sym` at file scope even from inside a block. Only valid when the
    /// name has no binding at all, as for implicitly declared functions.
    pub fn push_global(&mut self, ns: Namespace, mut sym: Sym) -> SymId {
        let v = sym.v;
        sym.scope = 0;
        let id = SymId(self.syms.len());
        self.syms.push(sym);
        let prev = self.map_mut(ns).insert(v, id);
        self.syms[id.0].prev = prev;
        self.global_stack.push((ns, id));
        id
    }

    pub fn find(&self, ns: Namespace, v: TokId) -> Option<SymId> {
        self.map(ns).get(&v).copied()
    }

    pub fn find_ident(&self, v: TokId) -> Option<SymId> {
        self.find(Namespace::Ident, v)
    }

    pub fn find_tag(&self, v: TokId) -> Option<SymId> {
        self.find(Namespace::Tag, v)
    }

    pub fn find_label(&self, v: TokId) -> Option<SymId> {
        self.find(Namespace::Label, v)
    }

    pub fn get(&self, id: SymId) -> &Sym {
        &self.syms[id.0]
    }

    pub fn get_mut(&mut self, id: SymId) -> &mut Sym {
        &mut self.syms[id.0]
    }

    fn unbind(&mut self, ns: Namespace, id: SymId) {
        let (v, prev) = {
            let sym = &self.syms[id.0];
            (sym.v, sym.prev)
        };
        let map = self.map_mut(ns);
        if map.get(&v) == Some(&id) {
            match prev {
                Some(p) => {
                    map.insert(v, p);
                }
                None => {
                    map.remove(&v);
                }
            }
        }
    }

    /// Mark for [`SymTable::pop_locals`].
    pub fn local_mark(&self) -> usize {
        self.local_stack.len()
    }

    /// Unbind every block-scope symbol pushed since `mark`.
    pub fn pop_locals(&mut self, mark: usize) {
        while self.local_stack.len() > mark {
            let Some((ns, id)) = self.local_stack.pop() else {
                break;
            };
            self.unbind(ns, id);
        }
    }

    /// Labels of the function that just ended.
    pub fn take_labels(&mut self) -> Vec<SymId> {
        let labels = std::mem::take(&mut self.label_stack);
        for &id in labels.iter().rev() {
            self.unbind(Namespace::Label, id);
        }
        labels
    }

    /// File-scope symbols in declaration order.
    pub fn globals(&self) -> impl Iterator<Item = SymId> + '_ {
        self.global_stack
            .iter()
            .filter(|(ns, _)| *ns == Namespace::Ident)
            .map(|&(_, id)| id)
    }

    /// Unbind everything at file scope.
    pub fn pop_globals(&mut self) {
        while let Some((ns, id)) = self.global_stack.pop() {
            self.unbind(ns, id);
        }
    }

    pub fn new_struct(&mut self, tag: TokId, is_union: bool) -> StructId {
        let id = StructId(self.structs.len());
        self.structs.push(StructDef::new(tag, is_union));
        id
    }

    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id.0]
    }

    /// Look up member `name` of a struct or union.
    pub fn find_field(&self, id: StructId, name: TokId) -> Option<&Field> {
        self.structs.get(id.0)?.field(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_sym(v: u32, off: i32) -> Sym {
        Sym::new(TokId(v), CType::int(), Storage::Local(off))
    }

    #[test]
    fn test_shadowing_and_pop() {
        let mut table = SymTable::new();
        let outer = table.push(Namespace::Ident, Sym::new(TokId(500), CType::int(), Storage::Global));
        table.block_depth = 1;
        let mark = table.local_mark();
        let inner = table.push(Namespace::Ident, int_sym(500, -4));
        table.push(Namespace::Ident, int_sym(501, -8));
        assert_eq!(table.find_ident(TokId(500)), Some(inner));
        assert_eq!(table.get(inner).scope, 1);

        table.pop_locals(mark);
        table.block_depth = 0;
        assert_eq!(table.find_ident(TokId(500)), Some(outer));
        assert_eq!(table.find_ident(TokId(501)), None);
    }

    #[test]
    fn test_namespaces_are_separate() {
        let mut table = SymTable::new();
        let tag = table.push(Namespace::Tag, Sym::new(TokId(600), CType::int(), Storage::Tag));
        assert_eq!(table.find_ident(TokId(600)), None);
        assert_eq!(table.find_tag(TokId(600)), Some(tag));
    }

    #[test]
    fn test_labels_are_function_scoped() {
        let mut table = SymTable::new();
        let label = Storage::Label {
            pos: None,
            pending: Vec::new(),
        };
        let id = table.push(Namespace::Label, Sym::new(TokId(700), CType::void(), label));
        assert_eq!(table.find_label(TokId(700)), Some(id));
        assert_eq!(table.take_labels(), vec![id]);
        assert_eq!(table.find_label(TokId(700)), None);
    }

    #[test]
    fn test_anonymous_ids_do_not_collide() {
        let mut table = SymTable::new();
        let a = table.anon_id();
        let b = table.anon_id();
        assert_ne!(a, b);
        assert!(a.is_anonymous() && b.is_anonymous());
    }
}
