//! Identifier interning
//!
//! Every identifier spelling maps to a dense [`TokId`]. Ids below
//! [`KEYWORD_COUNT`] are the C keywords, in [`Keyword`] order. Ids from
//! [`SYM_FIRST_ANON`] upward are anonymous symbols (string literals,
//! unnamed structs) that never appear in source.
//!
//! [`Keyword`]: super::lexer::Keyword

use super::lexer::{KEYWORD_COUNT, KEYWORD_NAMES};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// First id handed out for anonymous symbols
pub const SYM_FIRST_ANON: u32 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokId(pub u32);

impl TokId {
    pub fn is_keyword(self) -> bool {
        self.0 < KEYWORD_COUNT
    }

    pub fn is_anonymous(self) -> bool {
        self.0 >= SYM_FIRST_ANON
    }
}

#[derive(Debug, Clone)]
pub struct Interner {
    map: FxHashMap<Rc<str>, TokId>,
    names: Vec<Rc<str>>,
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Interner {
    /// Create an interner seeded with the keywords.
    pub fn new() -> Self {
        let mut interner = Interner {
            map: FxHashMap::default(),
            names: Vec::new(),
        };
        for name in KEYWORD_NAMES {
            interner.intern(name);
        }
        interner
    }

    pub fn intern(&mut self, name: &str) -> TokId {
        if let Some(&id) = self.map.get(name) {
            return id;
        }
        let id = TokId(self.names.len() as u32);
        let name: Rc<str> = Rc::from(name);
        self.names.push(name.clone());
        self.map.insert(name, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<TokId> {
        self.map.get(name).copied()
    }

    /// Spelling of an interned identifier; anonymous ids have none.
    pub fn name(&self, id: TokId) -> Option<&str> {
        self.names.get(id.0 as usize).map(|s| &**s)
    }

    /// Printable name for any id, `L.<n>` for anonymous ones.
    pub fn spell(&self, id: TokId) -> String {
        if id.is_anonymous() {
            return format!("L.{}", id.0 - SYM_FIRST_ANON);
        }
        self.name(id).unwrap_or("").to_string()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::lexer::Keyword;

    #[test]
    fn test_keywords_are_preinterned() {
        let mut idents = Interner::new();
        assert_eq!(idents.intern("int"), Keyword::Int.id());
        assert_eq!(idents.intern("__asm__"), Keyword::Asm3.id());
        assert!(Keyword::Return.id().is_keyword());
        let id = idents.intern("main");
        assert!(!id.is_keyword());
        assert_eq!(idents.intern("main"), id);
        assert_eq!(idents.spell(id), "main");
    }

    #[test]
    fn test_anonymous_spelling() {
        let idents = Interner::new();
        assert_eq!(idents.spell(TokId(SYM_FIRST_ANON + 3)), "L.3");
        assert!(idents.name(TokId(SYM_FIRST_ANON)).is_none());
    }
}
