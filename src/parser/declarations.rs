//! Declaration parsing implementation
//!
//! This module handles everything that introduces a name:
//!
//! - Declaration specifiers: base types, qualifiers, storage classes,
//!   `__attribute__((...))`, `typeof`
//! - Declarators: pointers, arrays, function parameter lists, nested
//!   `(*name)` forms and abstract declarators for casts and `sizeof`
//! - struct/union/enum bodies
//! - File-scope and block-scope declarations, with the merge rules for
//!   redeclared globals
//! - Function definitions, generated as soon as the body is parsed
//!
//! # Grammar
//!
//! ```text
//! declaration  ::= specifiers (declarator asm? attributes* ("=" init)?) % "," ";"
//!                | specifiers declarator "{" body "}"
//! declarator   ::= ("*" qualifiers)* (identifier | "(" declarator ")")? suffix*
//! suffix       ::= "[" constant? "]" | "(" params ")"
//! ```
//!
//! A declarator is collected as a list of type operations and applied to
//! the base type afterwards, so `int (*f)(int)` reads inside out like C
//! does.

use crate::codegen::{Emit, FuncState};
use crate::elf::{SectionId, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_PROGBITS};
use crate::errors::{CResult, ErrorKind};
use crate::parser::intern::TokId;
use crate::parser::lexer::{Keyword, Punct, Token, TokenKind};
use crate::parser::parse::{InlineFunc, Parser};
use crate::symbols::types::{
    compatible, layout_fields, size_align, CType, CallConv, Field, FloatKind, FuncType, IntKind, Param,
    TypeKind,
};
use crate::symbols::{Namespace, Storage, Sym};
use crate::symbols::SymId;
use log::debug;
use std::rc::Rc;

/// GNU attributes collected from `__attribute__((...))` lists
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Attributes {
    pub aligned: u64,
    pub packed: bool,
    pub weak: bool,
    pub noreturn: bool,
    pub section: Option<String>,
    pub call_conv: Option<CallConv>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageClass {
    None,
    Extern,
    Static,
    Typedef,
}

/// Declaration specifiers shared by every declarator of one declaration
#[derive(Debug, Clone)]
pub(crate) struct DeclSpec {
    pub ty: CType,
    pub storage: StorageClass,
    pub is_inline: bool,
    pub attrs: Attributes,
}

/// One step of a declarator, applied to the type built so far
#[derive(Debug, Clone)]
enum DeclOp {
    Pointer { is_const: bool, is_volatile: bool },
    Array(Option<u64>),
    /// Return type is filled in when applied
    Func(FuncType),
}

fn is_type_keyword(kw: Keyword) -> bool {
    use Keyword::*;
    matches!(
        kw,
        Int | Void
            | Char
            | Short
            | Long
            | Signed
            | Signed2
            | Signed3
            | Unsigned
            | Bool
            | Float
            | Double
            | Struct
            | Union
            | Enum
            | Typedef
            | Extern
            | Static
            | Auto
            | Register
            | Const
            | Const2
            | Const3
            | Volatile
            | Volatile2
            | Volatile3
            | Inline
            | Inline2
            | Inline3
            | Restrict
            | Restrict2
            | Restrict3
            | Attribute
            | Attribute2
            | Extension
            | Typeof
            | Typeof2
            | Typeof3
            | Noreturn
    )
}

impl<'a> Parser<'a> {
    // ===== Names and types =====

    /// Type bound to `id` when it names a typedef in scope.
    pub(crate) fn typedef_type(&self, id: TokId) -> Option<CType> {
        let sid = self.syms.find_ident(id)?;
        let sym = self.syms.get(sid);
        (sym.storage == Storage::Typedef).then(|| sym.ty.clone())
    }

    /// Whether `tok` can start a declaration.
    pub(crate) fn starts_type(&self, tok: &Token) -> bool {
        match tok.kind {
            TokenKind::Ident(id) if id.is_keyword() => Keyword::from_id(id).is_some_and(is_type_keyword),
            TokenKind::Ident(id) => self.typedef_type(id).is_some(),
            _ => false,
        }
    }

    pub(crate) fn is_type_start(&self) -> bool {
        self.starts_type(&self.tok)
    }

    fn is_attribute_kw(&self) -> bool {
        matches!(self.keyword(), Some(Keyword::Attribute | Keyword::Attribute2))
    }

    /// Parse declaration specifiers. Returns `None` when the current token
    /// cannot start a declaration.
    pub(crate) fn parse_btype(&mut self) -> CResult<Option<DeclSpec>> {
        let mut storage = StorageClass::None;
        let mut is_inline = false;
        let mut attrs = Attributes::default();
        let (mut is_const, mut is_volatile) = (false, false);
        let mut base: Option<CType> = None;
        let (mut n_char, mut n_short, mut n_int, mut n_long) = (0u32, 0u32, 0u32, 0u32);
        let mut signed: Option<bool> = None;
        let mut double = false;
        let mut seen = false;

        loop {
            let Some(kw) = self.keyword() else {
                let counted = n_char + n_short + n_int + n_long > 0 || signed.is_some() || double;
                if let Some(id) = self.ident() {
                    if base.is_none() && !counted {
                        if let Some(ty) = self.typedef_type(id) {
                            base = Some(ty);
                            seen = true;
                            self.next()?;
                            continue;
                        }
                    }
                }
                break;
            };
            match kw {
                Keyword::Void => self.set_base(&mut base, CType::void())?,
                Keyword::Char => n_char += 1,
                Keyword::Short => n_short += 1,
                Keyword::Int => n_int += 1,
                Keyword::Long => n_long += 1,
                Keyword::Signed | Keyword::Signed2 | Keyword::Signed3 | Keyword::Unsigned => {
                    let is_signed = kw != Keyword::Unsigned;
                    if signed.is_some_and(|s| s != is_signed) {
                        return Err(self.error(ErrorKind::Syntax, "signed and unsigned modifier"));
                    }
                    signed = Some(is_signed);
                }
                Keyword::Bool => self.set_base(&mut base, CType::int_of(IntKind::Bool, true))?,
                Keyword::Float => self.set_base(&mut base, CType::new(TypeKind::Float(FloatKind::Float)))?,
                Keyword::Double => double = true,
                Keyword::Struct | Keyword::Union => {
                    let ty = self.struct_specifier(kw == Keyword::Union)?;
                    self.set_base(&mut base, ty)?;
                    seen = true;
                    continue;
                }
                Keyword::Enum => {
                    let ty = self.enum_specifier()?;
                    self.set_base(&mut base, ty)?;
                    seen = true;
                    continue;
                }
                Keyword::Typeof | Keyword::Typeof2 | Keyword::Typeof3 => {
                    let ty = self.parse_typeof()?;
                    self.set_base(&mut base, ty)?;
                    seen = true;
                    continue;
                }
                Keyword::Attribute | Keyword::Attribute2 => {
                    self.parse_attributes(&mut attrs)?;
                    seen = true;
                    continue;
                }
                Keyword::Typedef | Keyword::Extern | Keyword::Static => {
                    let class = match kw {
                        Keyword::Typedef => StorageClass::Typedef,
                        Keyword::Extern => StorageClass::Extern,
                        _ => StorageClass::Static,
                    };
                    if storage != StorageClass::None && storage != class {
                        return Err(self.error(ErrorKind::Syntax, "multiple storage classes specified"));
                    }
                    storage = class;
                }
                Keyword::Auto | Keyword::Register | Keyword::Extension => {}
                Keyword::Const | Keyword::Const2 | Keyword::Const3 => is_const = true,
                Keyword::Volatile | Keyword::Volatile2 | Keyword::Volatile3 => is_volatile = true,
                Keyword::Restrict | Keyword::Restrict2 | Keyword::Restrict3 => {}
                Keyword::Inline | Keyword::Inline2 | Keyword::Inline3 => is_inline = true,
                Keyword::Noreturn => attrs.noreturn = true,
                _ => break,
            }
            seen = true;
            self.next()?;
        }
        if !seen {
            return Ok(None);
        }

        let counted = n_char + n_short + n_int + n_long > 0 || signed.is_some();
        let mut ty = match base {
            Some(ty) => {
                if counted || double {
                    return Err(self.error(ErrorKind::Syntax, "too many basic types"));
                }
                ty
            }
            None if double => {
                if n_char + n_short + n_int > 0 || signed.is_some() || n_long > 1 {
                    return Err(self.error(ErrorKind::Syntax, "too many basic types"));
                }
                let kind = if n_long == 1 {
                    FloatKind::LongDouble
                } else {
                    FloatKind::Double
                };
                CType::new(TypeKind::Float(kind))
            }
            None => {
                let too_many = n_char > 1
                    || n_short > 1
                    || n_int > 1
                    || n_long > 2
                    || (n_char > 0 && n_short + n_int + n_long > 0)
                    || (n_short > 0 && n_long > 0);
                if too_many {
                    return Err(self.error(ErrorKind::Syntax, "too many basic types"));
                }
                let kind = if n_char > 0 {
                    IntKind::Char
                } else if n_short > 0 {
                    IntKind::Short
                } else if n_long > 0 {
                    IntKind::Long
                } else {
                    IntKind::Int
                };
                let unsigned = match signed {
                    Some(s) => !s,
                    None => kind == IntKind::Char && self.settings.char_is_unsigned,
                };
                CType::int_of(kind, unsigned)
            }
        };
        ty.is_const |= is_const;
        ty.is_volatile |= is_volatile;
        Ok(Some(DeclSpec {
            ty,
            storage,
            is_inline,
            attrs,
        }))
    }

    fn set_base(&mut self, base: &mut Option<CType>, ty: CType) -> CResult<()> {
        if base.is_some() {
            return Err(self.error(ErrorKind::Syntax, "too many basic types"));
        }
        *base = Some(ty);
        Ok(())
    }

    /// `typeof(type)` or `typeof(expr)`; the expression is not evaluated.
    fn parse_typeof(&mut self) -> CResult<CType> {
        self.next()?;
        self.expect(Punct::LParen)?;
        let ty = if self.is_type_start() {
            self.type_name()?
        } else {
            self.type_of_expr()?
        };
        self.expect(Punct::RParen)?;
        Ok(ty)
    }

    /// Type operand of a cast, `sizeof` or `typeof`.
    pub(crate) fn type_name(&mut self) -> CResult<CType> {
        let Some(spec) = self.parse_btype()? else {
            let msg = format!("type expected (got \"{}\")", self.spell_tok());
            return Err(self.error(ErrorKind::Syntax, &msg));
        };
        if spec.storage != StorageClass::None {
            return Err(self.error(ErrorKind::Syntax, "storage class in type name"));
        }
        let mut attrs = spec.attrs;
        let (ty, name) = self.declarator(spec.ty, &mut attrs)?;
        if name.is_some() {
            return Err(self.error(ErrorKind::Syntax, "identifier not allowed in type name"));
        }
        Ok(ty)
    }

    // ===== Attributes =====

    /// Parse one `__attribute__((...))` list into `attrs`.
    pub(crate) fn parse_attributes(&mut self, attrs: &mut Attributes) -> CResult<()> {
        self.next()?;
        self.expect(Punct::LParen)?;
        self.expect(Punct::LParen)?;
        while !self.is_punct(Punct::RParen) {
            let Some(id) = self.tok.ident() else {
                let msg = format!("attribute name expected (got \"{}\")", self.spell_tok());
                return Err(self.error(ErrorKind::Syntax, &msg));
            };
            let spelled = self.pp.idents.spell(id);
            let name = spelled.trim_start_matches("__").trim_end_matches("__").to_string();
            self.next()?;
            match name.as_str() {
                "aligned" => {
                    attrs.aligned = if self.accept(Punct::LParen)? {
                        let n = self.expr_const()?;
                        self.expect(Punct::RParen)?;
                        if n <= 0 || n & (n - 1) != 0 {
                            return Err(self.error(ErrorKind::Semantic, "alignment must be a positive power of two"));
                        }
                        n as u64
                    } else {
                        16
                    };
                }
                "section" => {
                    self.expect(Punct::LParen)?;
                    attrs.section = Some(self.string_literal()?);
                    self.expect(Punct::RParen)?;
                }
                "weak" => attrs.weak = true,
                "noreturn" => attrs.noreturn = true,
                "packed" => attrs.packed = true,
                "stdcall" => attrs.call_conv = Some(CallConv::Stdcall),
                "fastcall" => attrs.call_conv = Some(CallConv::Fastcall),
                "cdecl" => attrs.call_conv = Some(CallConv::Cdecl),
                "unused" | "used" => {}
                _ => {
                    if self.diag.warnings.unsupported {
                        let msg = format!("'{}' attribute ignored", name);
                        self.warning(&msg);
                    }
                    self.skip_parens()?;
                }
            }
            if !self.accept(Punct::Comma)? {
                break;
            }
        }
        self.expect(Punct::RParen)?;
        self.expect(Punct::RParen)
    }

    /// Skip a balanced parenthesized group if one starts here.
    fn skip_parens(&mut self) -> CResult<()> {
        if !self.is_punct(Punct::LParen) {
            return Ok(());
        }
        let mut depth = 0usize;
        loop {
            if self.tok.is_eof() {
                return Err(self.error(ErrorKind::Syntax, "unexpected end of file"));
            }
            if self.is_punct(Punct::LParen) {
                depth += 1;
            } else if self.is_punct(Punct::RParen) {
                depth -= 1;
            }
            self.next()?;
            if depth == 0 {
                return Ok(());
            }
        }
    }

    /// `__asm__("name")` after a declarator renames the ELF symbol.
    fn parse_asm_label(&mut self) -> CResult<Option<String>> {
        if !matches!(self.keyword(), Some(Keyword::Asm | Keyword::Asm2 | Keyword::Asm3)) {
            return Ok(None);
        }
        self.next()?;
        self.expect(Punct::LParen)?;
        let label = self.string_literal()?;
        self.expect(Punct::RParen)?;
        Ok(Some(label))
    }

    fn user_section(&mut self, name: &str, code: bool) -> SectionId {
        if let Some(id) = self.secs.find(name) {
            return id;
        }
        let flags = if code {
            SHF_ALLOC | SHF_EXECINSTR
        } else {
            SHF_ALLOC | SHF_WRITE
        };
        debug!("create section {}", name);
        self.secs.create(name, SHT_PROGBITS, flags)
    }

    // ===== struct / union / enum =====

    fn struct_specifier(&mut self, is_union: bool) -> CResult<CType> {
        self.next()?;
        let mut attrs = Attributes::default();
        while self.is_attribute_kw() {
            self.parse_attributes(&mut attrs)?;
        }
        let tag = self.ident();
        if tag.is_some() {
            self.next()?;
        }

        let existing = tag.and_then(|t| self.syms.find_tag(t)).map(|sid| {
            let sym = self.syms.get(sid);
            (sym.ty.struct_id(), sym.scope)
        });
        if let Some((found, _)) = existing {
            let same_kind = found.is_some_and(|id| self.syms.struct_def(id).is_union == is_union);
            if !same_kind {
                let name = tag.map(|t| self.pp.idents.spell(t)).unwrap_or_default();
                let msg = format!("'{}' defined as wrong kind of tag", name);
                return Err(self.error(ErrorKind::Semantic, &msg));
            }
        }

        if !self.is_punct(Punct::LBrace) {
            let Some(t) = tag else {
                let msg = format!("identifier expected (got \"{}\")", self.spell_tok());
                return Err(self.error(ErrorKind::Syntax, &msg));
            };
            if let Some((Some(id), _)) = existing {
                return Ok(CType::new(TypeKind::Struct(id)));
            }
            let id = self.syms.new_struct(t, is_union);
            self.syms
                .push(Namespace::Tag, Sym::new(t, CType::new(TypeKind::Struct(id)), Storage::Tag));
            return Ok(CType::new(TypeKind::Struct(id)));
        }

        let id = match (tag, existing) {
            (Some(_), Some((Some(id), scope))) if scope == self.syms.block_depth => {
                if self.syms.struct_def(id).defined {
                    return Err(self.error(ErrorKind::Semantic, "struct/union/enum already defined"));
                }
                id
            }
            (Some(t), _) => {
                let id = self.syms.new_struct(t, is_union);
                self.syms
                    .push(Namespace::Tag, Sym::new(t, CType::new(TypeKind::Struct(id)), Storage::Tag));
                id
            }
            (None, _) => {
                let anon = self.syms.anon_id();
                self.syms.new_struct(anon, is_union)
            }
        };
        self.struct_body(id, attrs)?;
        Ok(CType::new(TypeKind::Struct(id)))
    }

    fn struct_body(&mut self, id: crate::symbols::types::StructId, mut attrs: Attributes) -> CResult<()> {
        self.expect(Punct::LBrace)?;
        let mut fields: Vec<Field> = Vec::new();
        while !self.accept(Punct::RBrace)? {
            let Some(spec) = self.parse_btype()? else {
                let msg = format!("declaration expected (got \"{}\")", self.spell_tok());
                return Err(self.error(ErrorKind::Syntax, &msg));
            };
            if spec.storage != StorageClass::None {
                return Err(self.error(ErrorKind::Syntax, "storage class in struct member"));
            }
            if self.accept(Punct::Semicolon)? {
                // anonymous struct/union member
                if let Some(inner) = spec.ty.struct_id() {
                    if self.syms.struct_def(inner).tag.is_anonymous() {
                        let name = self.syms.anon_id();
                        fields.push(Field {
                            name,
                            ty: spec.ty,
                            offset: 0,
                        });
                    }
                }
                continue;
            }
            loop {
                let mut field_attrs = spec.attrs.clone();
                let (ty, name) = self.declarator(spec.ty.clone(), &mut field_attrs)?;
                if self.is_punct(Punct::Colon) {
                    return Err(self.error(ErrorKind::Semantic, "bit-fields are not supported"));
                }
                while self.is_attribute_kw() {
                    self.parse_attributes(&mut field_attrs)?;
                }
                if ty.is_func() {
                    return Err(self.error(ErrorKind::Semantic, "field declared as a function"));
                }
                let Some(name) = name else {
                    return Err(self.error(ErrorKind::Syntax, "identifier expected"));
                };
                if fields.iter().any(|f| f.name == name) {
                    let msg = format!("duplicate member '{}'", self.pp.idents.spell(name));
                    return Err(self.error(ErrorKind::Semantic, &msg));
                }
                fields.push(Field { name, ty, offset: 0 });
                if !self.accept(Punct::Comma)? {
                    break;
                }
            }
            self.expect(Punct::Semicolon)?;
        }
        while self.is_attribute_kw() {
            self.parse_attributes(&mut attrs)?;
        }

        let is_union = self.syms.struct_def(id).is_union;
        let (size, align) = match layout_fields(&mut fields, is_union, attrs.aligned, &self.syms.structs) {
            Ok(layout) => layout,
            Err(msg) => return Err(self.error(ErrorKind::Semantic, &msg)),
        };

        // members of anonymous members are reachable directly
        let mut flat = Vec::with_capacity(fields.len());
        for field in fields {
            if field.name.is_anonymous() {
                if let Some(inner) = field.ty.struct_id() {
                    for f in &self.syms.struct_def(inner).fields {
                        flat.push(Field {
                            offset: f.offset + field.offset,
                            ..f.clone()
                        });
                    }
                    continue;
                }
            }
            flat.push(field);
        }

        let def = &mut self.syms.structs[id.0];
        def.fields = flat;
        def.size = size;
        def.align = align;
        def.defined = true;
        Ok(())
    }

    fn enum_specifier(&mut self) -> CResult<CType> {
        self.next()?;
        let mut attrs = Attributes::default();
        while self.is_attribute_kw() {
            self.parse_attributes(&mut attrs)?;
        }
        let tag = self.ident();
        if tag.is_some() {
            self.next()?;
        }
        if let Some(t) = tag {
            match self.syms.find_tag(t) {
                Some(sid) if self.syms.get(sid).ty.struct_id().is_some() => {
                    let msg = format!("'{}' defined as wrong kind of tag", self.pp.idents.spell(t));
                    return Err(self.error(ErrorKind::Semantic, &msg));
                }
                Some(_) => {}
                None => {
                    self.syms.push(Namespace::Tag, Sym::new(t, CType::int(), Storage::Tag));
                }
            }
        }
        if !self.accept(Punct::LBrace)? {
            if tag.is_none() {
                let msg = format!("identifier expected (got \"{}\")", self.spell_tok());
                return Err(self.error(ErrorKind::Syntax, &msg));
            }
            return Ok(CType::int());
        }
        let mut value = 0i64;
        while !self.accept(Punct::RBrace)? {
            let name = self.expect_ident()?;
            if self.accept(Punct::Assign)? {
                value = self.expr_const()?;
            }
            if let Some(sid) = self.syms.find_ident(name) {
                if self.syms.get(sid).scope == self.syms.block_depth {
                    let msg = format!("redefinition of '{}'", self.pp.idents.spell(name));
                    return Err(self.error(ErrorKind::Semantic, &msg));
                }
            }
            self.syms
                .push(Namespace::Ident, Sym::new(name, CType::int(), Storage::EnumConst(value as i32 as i64)));
            value = value.wrapping_add(1);
            if !self.accept(Punct::Comma)? {
                self.expect(Punct::RBrace)?;
                break;
            }
        }
        Ok(CType::int())
    }

    // ===== Declarators =====

    /// Parse a declarator over `base`. The name is `None` for abstract
    /// declarators.
    pub(crate) fn declarator(&mut self, base: CType, attrs: &mut Attributes) -> CResult<(CType, Option<TokId>)> {
        let mut ops = Vec::new();
        let name = self.declarator_ops(&mut ops, attrs)?;
        let mut ty = self.apply_decl_ops(base, ops)?;
        if let (Some(cc), TypeKind::Func(f)) = (attrs.call_conv, &ty.kind) {
            let mut f = (**f).clone();
            f.call_conv = cc;
            ty = CType::new(TypeKind::Func(Rc::new(f)));
        }
        Ok((ty, name))
    }

    fn declarator_ops(&mut self, ops: &mut Vec<DeclOp>, attrs: &mut Attributes) -> CResult<Option<TokId>> {
        let mut pointers = Vec::new();
        while self.accept(Punct::Star)? {
            let (mut is_const, mut is_volatile) = (false, false);
            loop {
                match self.keyword() {
                    Some(Keyword::Const | Keyword::Const2 | Keyword::Const3) => is_const = true,
                    Some(Keyword::Volatile | Keyword::Volatile2 | Keyword::Volatile3) => is_volatile = true,
                    Some(Keyword::Restrict | Keyword::Restrict2 | Keyword::Restrict3) => {}
                    Some(Keyword::Attribute | Keyword::Attribute2) => {
                        self.parse_attributes(attrs)?;
                        continue;
                    }
                    _ => break,
                }
                self.next()?;
            }
            pointers.push(DeclOp::Pointer { is_const, is_volatile });
        }

        let mut inner = Vec::new();
        let mut name = None;
        if self.is_punct(Punct::LParen) && self.is_nested_declarator()? {
            self.next()?;
            while self.is_attribute_kw() {
                self.parse_attributes(attrs)?;
            }
            name = self.declarator_ops(&mut inner, attrs)?;
            self.expect(Punct::RParen)?;
        } else if let Some(id) = self.ident() {
            name = Some(id);
            self.next()?;
        }

        let mut suffixes = Vec::new();
        loop {
            if self.accept(Punct::LBracket)? {
                while matches!(
                    self.keyword(),
                    Some(Keyword::Static | Keyword::Const | Keyword::Restrict | Keyword::Restrict2 | Keyword::Restrict3)
                ) {
                    self.next()?;
                }
                let len = if self.is_punct(Punct::RBracket) {
                    None
                } else {
                    let n = self.expr_const()?;
                    if n < 0 {
                        return Err(self.error(ErrorKind::Semantic, "invalid array size"));
                    }
                    Some(n as u64)
                };
                self.expect(Punct::RBracket)?;
                suffixes.push(DeclOp::Array(len));
            } else if self.accept(Punct::LParen)? {
                let f = self.param_list()?;
                suffixes.push(DeclOp::Func(f));
            } else {
                break;
            }
        }

        ops.extend(pointers);
        ops.extend(suffixes.into_iter().rev());
        ops.extend(inner);
        Ok(name)
    }

    /// At `(`: does it open a nested declarator rather than a parameter
    /// list?
    fn is_nested_declarator(&mut self) -> CResult<bool> {
        let next = self.peek()?;
        Ok(match next.kind {
            TokenKind::Punct(Punct::Star) | TokenKind::Punct(Punct::LParen) => true,
            TokenKind::Ident(id) if id.is_keyword() => {
                matches!(Keyword::from_id(id), Some(Keyword::Attribute | Keyword::Attribute2))
            }
            TokenKind::Ident(id) => self.typedef_type(id).is_none(),
            _ => false,
        })
    }

    fn apply_decl_ops(&mut self, base: CType, ops: Vec<DeclOp>) -> CResult<CType> {
        let mut ty = base;
        for op in ops {
            ty = match op {
                DeclOp::Pointer { is_const, is_volatile } => {
                    let mut p = ty.pointer_to();
                    p.is_const = is_const;
                    p.is_volatile = is_volatile;
                    p
                }
                DeclOp::Array(len) => {
                    if ty.is_func() {
                        return Err(self.error(ErrorKind::Semantic, "declaration of an array of functions"));
                    }
                    if ty.is_void() {
                        return Err(self.error(ErrorKind::Semantic, "declaration of an array of voids"));
                    }
                    let array = ty.clone().array_of(len);
                    let elem_known = size_align(&ty, &self.syms.structs).is_some();
                    if len.is_some() && elem_known && size_align(&array, &self.syms.structs).is_none() {
                        return Err(self.error(ErrorKind::Semantic, "size of array is too large"));
                    }
                    array
                }
                DeclOp::Func(mut f) => {
                    if ty.is_array() || ty.is_func() {
                        return Err(self.error(ErrorKind::Semantic, "function cannot return an array or a function"));
                    }
                    f.ret = ty;
                    CType::new(TypeKind::Func(Rc::new(f)))
                }
            };
        }
        Ok(ty)
    }

    /// Parameter list after `(`, through the closing `)`.
    fn param_list(&mut self) -> CResult<FuncType> {
        let mut f = FuncType {
            ret: CType::void(),
            params: Vec::new(),
            variadic: false,
            old_style: false,
            call_conv: CallConv::Cdecl,
        };
        if self.accept(Punct::RParen)? {
            f.old_style = true;
            return Ok(f);
        }
        if self.is_kw(Keyword::Void) && self.peek()?.is_punct(Punct::RParen) {
            self.next()?;
            self.next()?;
            return Ok(f);
        }
        loop {
            if self.accept(Punct::Ellipsis)? {
                f.variadic = true;
                break;
            }
            let Some(spec) = self.parse_btype()? else {
                let msg = format!("parameter declaration expected (got \"{}\")", self.spell_tok());
                return Err(self.error(ErrorKind::Syntax, &msg));
            };
            if matches!(spec.storage, StorageClass::Extern | StorageClass::Static | StorageClass::Typedef) {
                return Err(self.error(ErrorKind::Syntax, "storage class specified for parameter"));
            }
            let mut attrs = spec.attrs.clone();
            let (ty, name) = self.declarator(spec.ty, &mut attrs)?;
            let ty = match &ty.kind {
                TypeKind::Array(elem, _) => (**elem).clone().pointer_to(),
                TypeKind::Func(_) => ty.pointer_to(),
                _ => ty,
            };
            if ty.is_void() {
                return Err(self.error(ErrorKind::Semantic, "parameter declared as void"));
            }
            f.params.push(Param { name, ty });
            if !self.accept(Punct::Comma)? {
                break;
            }
        }
        self.expect(Punct::RParen)?;
        Ok(f)
    }

    // ===== Declarations =====

    /// One file-scope declaration or function definition.
    pub(crate) fn external_declaration(&mut self) -> CResult<()> {
        if self.accept(Punct::Semicolon)? {
            return Ok(());
        }
        if matches!(self.keyword(), Some(Keyword::Asm | Keyword::Asm2 | Keyword::Asm3)) {
            return Err(self.error(ErrorKind::Semantic, "inline assembly is not supported"));
        }
        self.declaration(true)
    }

    /// Parse a declaration at file scope (`global`) or in a block.
    pub(crate) fn declaration(&mut self, global: bool) -> CResult<()> {
        let Some(spec) = self.parse_btype()? else {
            let msg = format!("declaration expected (got \"{}\")", self.spell_tok());
            return Err(self.error(ErrorKind::Syntax, &msg));
        };
        if self.accept(Punct::Semicolon)? {
            return Ok(());
        }
        let mut first = true;
        loop {
            let mut attrs = spec.attrs.clone();
            let (ty, name) = self.declarator(spec.ty.clone(), &mut attrs)?;
            let asm_label = self.parse_asm_label()?;
            while self.is_attribute_kw() {
                self.parse_attributes(&mut attrs)?;
            }
            let Some(name) = name else {
                let msg = format!("identifier expected (got \"{}\")", self.spell_tok());
                return Err(self.error(ErrorKind::Syntax, &msg));
            };

            if ty.is_func() && self.is_punct(Punct::LBrace) {
                if !global || !first || spec.storage == StorageClass::Typedef {
                    return Err(self.error(ErrorKind::Syntax, "function definition not allowed here"));
                }
                return self.function_definition(name, ty, &spec, &attrs, asm_label);
            }
            match spec.storage {
                StorageClass::Typedef => self.declare_typedef(name, ty)?,
                _ if ty.is_func() => {
                    self.declare_function(name, ty, &spec, &attrs, asm_label)?;
                }
                _ => self.declare_object(name, ty, &spec, &attrs, asm_label, global)?,
            }
            first = false;
            if !self.accept(Punct::Comma)? {
                break;
            }
        }
        self.expect(Punct::Semicolon)
    }

    fn redefinition(&mut self, name: TokId) -> crate::errors::CompileError {
        let msg = format!("redefinition of '{}'", self.pp.idents.spell(name));
        self.error(ErrorKind::Semantic, &msg)
    }

    fn incompatible_redefinition(&mut self, name: TokId) -> crate::errors::CompileError {
        let msg = format!("incompatible types for redefinition of '{}'", self.pp.idents.spell(name));
        self.error(ErrorKind::Semantic, &msg)
    }

    fn declare_typedef(&mut self, name: TokId, ty: CType) -> CResult<()> {
        if let Some(sid) = self.syms.find_ident(name) {
            let old = self.syms.get(sid);
            if old.scope == self.syms.block_depth {
                if old.storage == Storage::Typedef && compatible(&old.ty, &ty, &self.syms.structs) {
                    return Ok(());
                }
                return Err(self.redefinition(name));
            }
        }
        self.syms.push(Namespace::Ident, Sym::new(name, ty, Storage::Typedef));
        Ok(())
    }

    /// Declare a function, merging with an earlier declaration of the same
    /// name.
    fn declare_function(
        &mut self,
        name: TokId,
        ty: CType,
        spec: &DeclSpec,
        attrs: &Attributes,
        asm_label: Option<String>,
    ) -> CResult<SymId> {
        if let Some(sid) = self.syms.find_ident(name) {
            let old = self.syms.get(sid).clone();
            if old.ty.is_func() && old.storage == Storage::Global {
                if !compatible(&old.ty, &ty, &self.syms.structs) {
                    return Err(self.incompatible_redefinition(name));
                }
                let sym = self.syms.get_mut(sid);
                let old_style = sym.ty.func().is_some_and(|f| f.old_style);
                if old_style && ty.func().is_some_and(|f| !f.old_style) {
                    sym.ty = ty;
                }
                sym.flags.is_weak |= attrs.weak;
                sym.flags.noreturn |= attrs.noreturn;
                sym.flags.is_inline |= spec.is_inline;
                if spec.storage == StorageClass::Static {
                    sym.flags.is_static = true;
                }
                if asm_label.is_some() && sym.elf_sym == 0 {
                    sym.asm_label = asm_label;
                }
                return Ok(sid);
            }
            if old.scope == self.syms.block_depth {
                return Err(self.redefinition(name));
            }
        }

        let mut sym = Sym::new(name, ty, Storage::Global);
        sym.flags.is_static = spec.storage == StorageClass::Static;
        sym.flags.is_extern = spec.storage == StorageClass::Extern;
        sym.flags.is_weak = attrs.weak;
        sym.flags.is_inline = spec.is_inline;
        sym.flags.noreturn = attrs.noreturn;
        sym.asm_label = asm_label;
        if let Some(section) = &attrs.section {
            sym.section = Some(self.user_section(section, true));
        }
        let sid = if self.syms.block_depth > 0 && self.syms.find_ident(name).is_none() {
            self.syms.push_global(Namespace::Ident, sym)
        } else {
            self.syms.push(Namespace::Ident, sym)
        };
        Ok(sid)
    }

    fn function_definition(
        &mut self,
        name: TokId,
        ty: CType,
        spec: &DeclSpec,
        attrs: &Attributes,
        asm_label: Option<String>,
    ) -> CResult<()> {
        let sid = self.declare_function(name, ty.clone(), spec, attrs, asm_label)?;
        if self.syms.get(sid).flags.defined {
            return Err(self.redefinition(name));
        }
        let section = match &attrs.section {
            Some(s) => Some(self.user_section(s, true)),
            None => None,
        };
        let sym = self.syms.get_mut(sid);
        sym.ty = ty;
        sym.flags.defined = true;
        if section.is_some() {
            sym.section = section;
        }
        if sym.flags.is_static && sym.flags.is_inline {
            let tokens = self.record_braces()?;
            self.inline_fns.push(InlineFunc {
                sym: sid,
                tokens,
                done: false,
            });
            return Ok(());
        }
        self.gen_function(sid)
    }

    /// Generate the body of function `sid`; the current token is its `{`.
    pub(crate) fn gen_function(&mut self, sid: SymId) -> CResult<()> {
        let sym = self.syms.get(sid).clone();
        let Some(fty) = sym.ty.func().cloned() else {
            return Err(self.error(ErrorKind::Internal, "function type expected"));
        };
        let name = self.pp.idents.spell(sym.v);
        debug!("function {}", name);
        let text = sym.section.unwrap_or(self.secs.text);
        self.cur_text = text;
        let shndx = self.shndx_of(text);
        let start = self.ind();
        self.put_extern_sym(sid, shndx, start as u64, 0)?;

        let frame_patch = self.gen_prologue();
        self.func = Some(FuncState {
            sym: sid,
            ret: fty.ret.clone(),
            frame_patch,
            returns: Vec::new(),
            is_main: name == "main",
        });
        self.vstack.clear();

        self.syms.block_depth += 1;
        let mark = self.syms.local_mark();
        for (i, param) in fty.params.iter().enumerate() {
            if param.ty.is_struct() {
                return Err(self.error(ErrorKind::Semantic, "struct parameters are not supported"));
            }
            if param.ty.is_float() {
                return Err(self.error(ErrorKind::Semantic, "floating point types are not supported"));
            }
            let Some((size, align)) = size_align(&param.ty, &self.syms.structs) else {
                return Err(self.error(ErrorKind::Semantic, "parameter has incomplete type"));
            };
            let off = if i < crate::codegen::x86_64::ARG_REGS.len() {
                self.gen_store_param(i, &param.ty, size, align)?
            } else {
                16 + 8 * (i - crate::codegen::x86_64::ARG_REGS.len()) as i32
            };
            if let Some(pname) = param.name {
                self.syms
                    .push(Namespace::Ident, Sym::new(pname, param.ty.clone(), Storage::Local(off)));
            }
        }

        self.compound_statement(false)?;

        let func = self.func.take();
        let (returns, is_main) = func.map_or((Vec::new(), false), |f| (f.returns, f.is_main));
        self.gen_epilogue(frame_patch, returns, is_main);

        for label in self.syms.take_labels() {
            let sym = self.syms.get(label);
            if let Storage::Label { pos: None, .. } = sym.storage {
                let msg = format!("label '{}' used but not defined", self.pp.idents.spell(sym.v));
                return Err(self.error(ErrorKind::Semantic, &msg));
            }
        }
        self.syms.pop_locals(mark);
        self.syms.block_depth -= 1;

        let size = self.ind() - start;
        self.put_extern_sym(sid, shndx, start as u64, size as u64)?;
        self.cur_text = self.secs.text;
        Ok(())
    }

    fn declare_object(
        &mut self,
        name: TokId,
        ty: CType,
        spec: &DeclSpec,
        attrs: &Attributes,
        asm_label: Option<String>,
        global: bool,
    ) -> CResult<()> {
        if ty.is_void() {
            let msg = format!("variable '{}' declared void", self.pp.idents.spell(name));
            return Err(self.error(ErrorKind::Semantic, &msg));
        }
        if !global && spec.storage == StorageClass::None {
            return self.declare_local(name, ty, attrs);
        }
        let sid = self.bind_static_object(name, ty, spec, attrs, asm_label)?;
        if self.accept(Punct::Assign)? {
            if spec.storage == StorageClass::Extern {
                if !global {
                    let msg = format!("'{}' has both 'extern' and initializer", self.pp.idents.spell(name));
                    return Err(self.error(ErrorKind::Semantic, &msg));
                }
                let msg = format!("'{}' initialized and declared 'extern'", self.pp.idents.spell(name));
                self.warning(&msg);
            }
            self.define_initialized(sid)
        } else if spec.storage == StorageClass::Extern {
            Ok(())
        } else {
            self.define_tentative(sid)
        }
    }

    /// Find or create the symbol of an object with static storage.
    fn bind_static_object(
        &mut self,
        name: TokId,
        ty: CType,
        spec: &DeclSpec,
        attrs: &Attributes,
        asm_label: Option<String>,
    ) -> CResult<SymId> {
        if let Some(sid) = self.syms.find_ident(name) {
            let old = self.syms.get(sid).clone();
            if old.scope == self.syms.block_depth {
                if old.storage != Storage::Global || old.ty.is_func() {
                    return Err(self.redefinition(name));
                }
                if !compatible(&old.ty, &ty, &self.syms.structs) {
                    return Err(self.incompatible_redefinition(name));
                }
                let sym = self.syms.get_mut(sid);
                if sym.ty.array_len().is_none() && ty.array_len().is_some() {
                    sym.ty = ty;
                }
                sym.flags.is_weak |= attrs.weak;
                if spec.storage != StorageClass::Extern {
                    sym.flags.is_extern = false;
                }
                if asm_label.is_some() && sym.elf_sym == 0 {
                    sym.asm_label = asm_label;
                }
                return Ok(sid);
            }
        }
        let mut sym = Sym::new(name, ty, Storage::Global);
        sym.flags.is_static = spec.storage == StorageClass::Static;
        sym.flags.is_extern = spec.storage == StorageClass::Extern;
        sym.flags.is_weak = attrs.weak;
        sym.asm_label = asm_label;
        sym.align = attrs.aligned;
        if let Some(section) = &attrs.section {
            sym.section = Some(self.user_section(section, false));
        }
        Ok(self.syms.push(Namespace::Ident, sym))
    }

    /// Allocate an object with an initializer in `.data` (or its own
    /// section) and fill it in.
    fn define_initialized(&mut self, sid: SymId) -> CResult<()> {
        let sym = self.syms.get(sid).clone();
        if sym.flags.defined {
            return Err(self.redefinition(sym.v));
        }
        let ty = self.complete_array_type(sym.ty.clone())?;
        let Some((size, align)) = size_align(&ty, &self.syms.structs) else {
            return Err(self.error(ErrorKind::Semantic, "unknown type size"));
        };
        let sec = sym.section.unwrap_or(self.secs.data);
        if self.secs[sec].is_nobits() {
            let msg = format!("initialized object in NOBITS section '{}'", self.secs[sec].name);
            return Err(self.error(ErrorKind::Semantic, &msg));
        }
        let offset = self.alloc_static(sec, size, align.max(sym.align))?;
        {
            let s = self.syms.get_mut(sid);
            s.ty = ty.clone();
            s.flags.defined = true;
            s.flags.tentative = false;
            s.flags.is_extern = false;
        }
        let shndx = self.shndx_of(sec);
        self.put_extern_sym(sid, shndx, offset, size)?;
        self.static_initializer(sec, offset, &ty)
    }

    /// An object declared without initializer and without `extern`.
    fn define_tentative(&mut self, sid: SymId) -> CResult<()> {
        let sym = self.syms.get(sid).clone();
        if sym.flags.defined {
            return Ok(());
        }
        if sym.flags.tentative {
            if self.settings.common {
                return Ok(());
            }
            return Err(self.redefinition(sym.v));
        }
        let mut ty = sym.ty.clone();
        if let TypeKind::Array(elem, None) = &ty.kind {
            let msg = format!("array '{}' assumed to have one element", self.pp.idents.spell(sym.v));
            self.warning(&msg);
            ty = (**elem).clone().array_of(Some(1));
        }
        let Some((size, align)) = size_align(&ty, &self.syms.structs) else {
            return Err(self.error(ErrorKind::Semantic, "unknown type size"));
        };
        {
            let s = self.syms.get_mut(sid);
            s.ty = ty;
            s.flags.tentative = true;
        }
        self.alloc_tentative(sid, size, align.max(sym.align))
    }

    /// Automatic variable: a frame slot, initialized in place.
    fn declare_local(&mut self, name: TokId, ty: CType, attrs: &Attributes) -> CResult<()> {
        if let Some(sid) = self.syms.find_ident(name) {
            if self.syms.get(sid).scope == self.syms.block_depth {
                let msg = format!("redeclaration of '{}'", self.pp.idents.spell(name));
                return Err(self.error(ErrorKind::Semantic, &msg));
            }
        }
        let has_init = self.accept(Punct::Assign)?;
        let ty = if has_init {
            self.complete_array_type(ty)?
        } else {
            ty
        };
        let Some((size, align)) = size_align(&ty, &self.syms.structs) else {
            let msg = format!("storage size of '{}' isn't known", self.pp.idents.spell(name));
            return Err(self.error(ErrorKind::Semantic, &msg));
        };
        let off = self.alloc_local(size, align.max(attrs.aligned))?;
        self.syms
            .push(Namespace::Ident, Sym::new(name, ty.clone(), Storage::Local(off)));
        if has_init {
            self.local_initializer(off, &ty)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse::tests::compile;
    use crate::state::Settings;

    #[test]
    fn test_duplicate_tentative_depends_on_common() {
        let source = "int x; int x;";
        let (_, strict) = compile(source, &Settings::default());
        let msg = strict.unwrap_err();
        assert!(msg.contains("redefinition of 'x'"), "{}", msg);

        let settings = Settings {
            common: true,
            ..Settings::default()
        };
        let (secs, merged) = compile(source, &settings);
        assert!(merged.is_ok(), "{:?}", merged);
        let index = secs.find_elf_sym(secs.symtab, "x");
        assert_eq!(secs.elf_sym(secs.symtab, index).st_shndx, crate::elf::SHN_COMMON);
    }

    #[test]
    fn test_initialized_twice_is_an_error() {
        let (_, result) = compile("int x = 1; int x = 2;", &Settings::default());
        assert!(result.unwrap_err().contains("redefinition of 'x'"));
    }

    #[test]
    fn test_incompatible_redeclaration() {
        let (_, result) = compile("int x; long x;", &Settings::default());
        assert!(result.unwrap_err().contains("incompatible types for redefinition of 'x'"));
    }

    #[test]
    fn test_tentative_then_initialized_moves_to_data() {
        let (secs, result) = compile("int x; int x = 3;", &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let sym = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, "x"));
        assert_eq!(sym.st_shndx as usize, secs[secs.data].sh_num);
        let off = sym.st_value as usize;
        assert_eq!(&secs[secs.data].data()[off..off + 4], &3i32.to_le_bytes());
    }

    #[test]
    fn test_struct_layout_and_sizeof() {
        let source = "struct s { char c; int i; long l; };\nint size = sizeof(struct s);\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let sym = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, "size"));
        let off = sym.st_value as usize;
        assert_eq!(&secs[secs.data].data()[off..off + 4], &16i32.to_le_bytes());
    }

    #[test]
    fn test_function_pointer_declarator() {
        let source = "int apply(int (*f)(int), int v) { return f(v); }\n\
                      int (*table[2])(int);\n\
                      int n = sizeof(table) / sizeof(table[0]);\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let sym = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, "n"));
        let off = sym.st_value as usize;
        assert_eq!(&secs[secs.data].data()[off..off + 4], &2i32.to_le_bytes());
    }

    #[test]
    fn test_enum_constants_count_up() {
        let source = "enum color { RED, GREEN = 5, BLUE };\nint v = BLUE;\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let sym = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, "v"));
        let off = sym.st_value as usize;
        assert_eq!(&secs[secs.data].data()[off..off + 4], &6i32.to_le_bytes());
    }

    #[test]
    fn test_bit_fields_rejected() {
        let (_, result) = compile("struct s { int a : 3; };", &Settings::default());
        assert!(result.unwrap_err().contains("bit-fields are not supported"));
    }

    #[test]
    fn test_asm_label_and_weak() {
        let source = "int impl(void) __asm__(\"renamed\");\n\
                      __attribute__((weak)) int maybe(void) { return 1; }\n\
                      int main(void) { return impl(); }\n";
        let (secs, result) = compile(source, &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        assert_ne!(secs.find_elf_sym(secs.symtab, "renamed"), 0);
        assert_eq!(secs.find_elf_sym(secs.symtab, "impl"), 0);
        let maybe = secs.elf_sym(secs.symtab, secs.find_elf_sym(secs.symtab, "maybe"));
        assert_eq!(maybe.bind(), crate::elf::STB_WEAK);
    }

    #[test]
    fn test_huge_bss_object_takes_no_storage() {
        let (secs, result) = compile("char big[4000000000];", &Settings::default());
        assert!(result.is_ok(), "{:?}", result);
        let bss = &secs[secs.bss];
        assert_eq!(bss.data_offset(), 4_000_000_000);
        assert_eq!(bss.data_allocated(), 0);
    }

    #[test]
    fn test_oversized_objects_are_rejected() {
        let (_, result) = compile("char a[0x4000000000000000][4];", &Settings::default());
        assert!(result.unwrap_err().contains("size of array is too large"));

        let (_, result) = compile("int f(void) { char buf[0x80000000]; return 0; }", &Settings::default());
        assert!(result.unwrap_err().contains("stack frame too large"));

        let (_, result) = compile("char big[0x80000000] = { 1 };", &Settings::default());
        assert!(result.unwrap_err().contains("section '.data' is too large"));

        let (_, result) = compile("char huge[0x200000000];", &Settings::default());
        assert!(result.unwrap_err().contains("section '.bss' is too large"));
    }

    #[test]
    fn test_initializer_in_nobits_section() {
        let source = "int x __attribute__((section(\".bss\"))) = 1;";
        let (_, result) = compile(source, &Settings::default());
        assert!(result.unwrap_err().contains("NOBITS section '.bss'"));
    }
}
