//! C type descriptors
//!
//! A [`CType`] is a base kind plus qualifiers. Derived types (pointers,
//! arrays, functions) share their element types through `Rc`, so copying a
//! type is cheap. Struct and union layouts live in a side table indexed by
//! [`StructId`], which lets a pointer to an incomplete struct be declared
//! before the struct body is seen.
//!
//! Layout follows the x86-64 System V ABI:
//! - `char` 1, `short` 2, `int` 4, `long`/`long long` and pointers 8
//! - struct members at their natural alignment, size rounded up to the
//!   struct alignment
//! - all union members at offset 0

use crate::parser::intern::TokId;
use std::rc::Rc;

/// Integer ranks, narrowest first. `long long` is the same as `long`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntKind {
    Bool,
    Char,
    Short,
    Int,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    Float,
    Double,
    LongDouble,
}

/// Calling convention tag of a function type. Only `Cdecl` changes nothing;
/// the others only affect symbol mangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CallConv {
    #[default]
    Cdecl,
    Stdcall,
    Fastcall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Option<TokId>,
    pub ty: CType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncType {
    pub ret: CType,
    pub params: Vec<Param>,
    pub variadic: bool,
    /// Declared with `()`: arguments are not checked
    pub old_style: bool,
    pub call_conv: CallConv,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Void,
    Int { kind: IntKind, unsigned: bool },
    Float(FloatKind),
    Pointer(Rc<CType>),
    /// Element type and element count; `None` until known
    Array(Rc<CType>, Option<u64>),
    Func(Rc<FuncType>),
    Struct(StructId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CType {
    pub kind: TypeKind,
    pub is_const: bool,
    pub is_volatile: bool,
}

impl CType {
    pub fn new(kind: TypeKind) -> Self {
        CType {
            kind,
            is_const: false,
            is_volatile: false,
        }
    }

    pub fn void() -> Self {
        CType::new(TypeKind::Void)
    }

    pub fn int_of(kind: IntKind, unsigned: bool) -> Self {
        CType::new(TypeKind::Int { kind, unsigned })
    }

    pub fn int() -> Self {
        CType::int_of(IntKind::Int, false)
    }

    pub fn uint() -> Self {
        CType::int_of(IntKind::Int, true)
    }

    pub fn short() -> Self {
        CType::int_of(IntKind::Short, false)
    }

    pub fn long() -> Self {
        CType::int_of(IntKind::Long, false)
    }

    pub fn ulong() -> Self {
        CType::int_of(IntKind::Long, true)
    }

    /// Plain `char`, signed unless `unsigned_char` is set
    pub fn char(unsigned_char: bool) -> Self {
        CType::int_of(IntKind::Char, unsigned_char)
    }

    pub fn with_const(mut self) -> Self {
        self.is_const = true;
        self
    }

    pub fn unqualified(&self) -> CType {
        CType::new(self.kind.clone())
    }

    pub fn pointer_to(self) -> CType {
        CType::new(TypeKind::Pointer(Rc::new(self)))
    }

    pub fn array_of(self, len: Option<u64>) -> CType {
        CType::new(TypeKind::Array(Rc::new(self), len))
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, TypeKind::Int { .. })
    }

    pub fn is_bool(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Int {
                kind: IntKind::Bool,
                ..
            }
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self.kind, TypeKind::Float(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array(..))
    }

    pub fn is_func(&self) -> bool {
        matches!(self.kind, TypeKind::Func(_))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind, TypeKind::Struct(_))
    }

    /// Integers and pointers: everything that fits in a register
    pub fn is_scalar(&self) -> bool {
        self.is_integer() || self.is_pointer()
    }

    /// Arrays, structs and functions are handled through their address
    pub fn is_aggregate(&self) -> bool {
        self.is_array() || self.is_struct() || self.is_func()
    }

    pub fn is_unsigned(&self) -> bool {
        match self.kind {
            TypeKind::Int { unsigned, .. } => unsigned,
            TypeKind::Pointer(_) => true,
            _ => false,
        }
    }

    pub fn int_kind(&self) -> Option<IntKind> {
        match self.kind {
            TypeKind::Int { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Element type of a pointer or array
    pub fn pointee(&self) -> Option<&CType> {
        match &self.kind {
            TypeKind::Pointer(t) | TypeKind::Array(t, _) => Some(t),
            _ => None,
        }
    }

    pub fn func(&self) -> Option<&FuncType> {
        match &self.kind {
            TypeKind::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn struct_id(&self) -> Option<StructId> {
        match self.kind {
            TypeKind::Struct(id) => Some(id),
            _ => None,
        }
    }

    pub fn array_len(&self) -> Option<u64> {
        match self.kind {
            TypeKind::Array(_, len) => len,
            _ => None,
        }
    }

    /// Array-to-pointer and function-to-pointer conversion
    pub fn decay(&self) -> CType {
        match &self.kind {
            TypeKind::Array(elem, _) => CType::new(TypeKind::Pointer(elem.clone())),
            TypeKind::Func(_) => self.clone().pointer_to(),
            _ => self.clone(),
        }
    }

    /// Integer promotion: anything narrower than `int` becomes `int`
    pub fn promote(&self) -> CType {
        match self.kind {
            TypeKind::Int { kind, .. } if kind < IntKind::Int => CType::int(),
            _ => self.unqualified(),
        }
    }

    /// Register width in bytes and signedness, for loads and stores
    pub fn width(&self) -> (u8, bool) {
        match self.kind {
            TypeKind::Int { kind, unsigned } => {
                let bytes = match kind {
                    IntKind::Bool | IntKind::Char => 1,
                    IntKind::Short => 2,
                    IntKind::Int => 4,
                    IntKind::Long => 8,
                };
                (bytes, !unsigned && kind != IntKind::Bool)
            }
            _ => (8, false),
        }
    }
}

/// Usual arithmetic conversions for two integer operands
pub fn common_int_type(a: &CType, b: &CType) -> CType {
    let a = a.promote();
    let b = b.promote();
    let (ka, ua) = match a.kind {
        TypeKind::Int { kind, unsigned } => (kind, unsigned),
        _ => return CType::long(),
    };
    let (kb, ub) = match b.kind {
        TypeKind::Int { kind, unsigned } => (kind, unsigned),
        _ => return CType::long(),
    };
    if ka == kb {
        CType::int_of(ka, ua || ub)
    } else if ka > kb {
        CType::int_of(ka, ua)
    } else {
        CType::int_of(kb, ub)
    }
}

/// Truncate `value` to `ty` and extend it back to 64 bits the way a
/// register holding that type would.
pub fn canonical_value(ty: &CType, value: i64) -> i64 {
    if ty.is_bool() {
        return (value != 0) as i64;
    }
    match ty.width() {
        (1, true) => value as i8 as i64,
        (1, false) => value as u8 as i64,
        (2, true) => value as i16 as i64,
        (2, false) => value as u16 as i64,
        (4, true) => value as i32 as i64,
        (4, false) => value as u32 as i64,
        _ => value,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: TokId,
    pub ty: CType,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    /// Tag name, anonymous for untagged structs
    pub tag: TokId,
    pub is_union: bool,
    pub fields: Vec<Field>,
    pub size: u64,
    pub align: u64,
    /// Body seen; size and fields are valid
    pub defined: bool,
}

impl StructDef {
    pub fn new(tag: TokId, is_union: bool) -> Self {
        StructDef {
            tag,
            is_union,
            fields: Vec::new(),
            size: 0,
            align: 1,
            defined: false,
        }
    }

    pub fn field(&self, name: TokId) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Largest object size, so that pointer differences fit `long`
pub const MAX_OBJECT_SIZE: u64 = i64::MAX as u64;

/// Size and alignment, or `None` for incomplete types and types whose size
/// overflows.
pub fn size_align(ty: &CType, structs: &[StructDef]) -> Option<(u64, u64)> {
    match &ty.kind {
        TypeKind::Void => Some((1, 1)),
        TypeKind::Int { .. } => {
            let (bytes, _) = ty.width();
            Some((bytes as u64, bytes as u64))
        }
        TypeKind::Float(FloatKind::Float) => Some((4, 4)),
        TypeKind::Float(FloatKind::Double) => Some((8, 8)),
        TypeKind::Float(FloatKind::LongDouble) => Some((16, 16)),
        TypeKind::Pointer(_) => Some((8, 8)),
        TypeKind::Func(_) => Some((1, 1)),
        TypeKind::Array(elem, len) => {
            let (size, align) = size_align(elem, structs)?;
            let total = size.checked_mul((*len)?).filter(|&t| t <= MAX_OBJECT_SIZE)?;
            Some((total, align))
        }
        TypeKind::Struct(id) => {
            let def = structs.get(id.0)?;
            def.defined.then_some((def.size, def.align))
        }
    }
}

/// Lay out `fields` in place and compute the aggregate size and alignment.
pub fn layout_fields(
    fields: &mut [Field],
    is_union: bool,
    min_align: u64,
    structs: &[StructDef],
) -> Result<(u64, u64), String> {
    let mut offset = 0u64;
    let mut size = 0u64;
    let mut align = min_align.max(1);
    for field in fields.iter_mut() {
        let (fsize, falign) = size_align(&field.ty, structs)
            .ok_or_else(|| "field has incomplete type".to_string())?;
        align = align.max(falign);
        if is_union {
            field.offset = 0;
            size = size.max(fsize);
        } else {
            offset = crate::util::align_up(offset, falign);
            field.offset = offset;
            offset = offset
                .checked_add(fsize)
                .filter(|&end| end <= MAX_OBJECT_SIZE)
                .ok_or_else(|| "struct is too large".to_string())?;
            size = offset;
        }
    }
    Ok((crate::util::align_up(size, align), align))
}

/// Outcome of checking an implicit conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Ok,
    Warn(String),
    Error(String),
}

/// How strictly questionable conversions are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Allow,
    Warn,
    Error,
}

/// Policy table for implicit conversions on assignment, argument passing
/// and return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionPolicy {
    pub int_to_pointer: Check,
    pub pointer_to_int: Check,
    pub incompatible_pointers: Check,
    pub discards_qualifiers: Check,
}

impl Default for ConversionPolicy {
    fn default() -> Self {
        ConversionPolicy {
            int_to_pointer: Check::Warn,
            pointer_to_int: Check::Warn,
            incompatible_pointers: Check::Warn,
            discards_qualifiers: Check::Warn,
        }
    }
}

impl ConversionPolicy {
    fn apply(check: Check, msg: &str) -> Conversion {
        match check {
            Check::Allow => Conversion::Ok,
            Check::Warn => Conversion::Warn(msg.to_string()),
            Check::Error => Conversion::Error(msg.to_string()),
        }
    }

    /// Check assigning a value of type `src` to an object of type `dst`.
    /// `null_constant` is set when the source is the integer constant 0.
    pub fn check_assign(
        &self,
        dst: &CType,
        src: &CType,
        null_constant: bool,
        structs: &[StructDef],
    ) -> Conversion {
        let src = src.decay();
        match (&dst.kind, &src.kind) {
            (TypeKind::Void, _) => Conversion::Ok,
            (TypeKind::Int { .. }, TypeKind::Int { .. }) => Conversion::Ok,
            (TypeKind::Pointer(_), TypeKind::Int { .. }) if null_constant => Conversion::Ok,
            (TypeKind::Int { .. }, TypeKind::Pointer(_)) if dst.is_bool() => Conversion::Ok,
            (TypeKind::Pointer(_), TypeKind::Int { .. }) => Self::apply(
                self.int_to_pointer,
                "assignment makes pointer from integer without a cast",
            ),
            (TypeKind::Int { .. }, TypeKind::Pointer(_)) => Self::apply(
                self.pointer_to_int,
                "assignment makes integer from pointer without a cast",
            ),
            (TypeKind::Pointer(to), TypeKind::Pointer(from)) => {
                if from.is_const && !to.is_const {
                    return Self::apply(
                        self.discards_qualifiers,
                        "assignment discards qualifiers from pointer target type",
                    );
                }
                if to.is_void() || from.is_void() || compatible(to, from, structs) {
                    Conversion::Ok
                } else {
                    Self::apply(
                        self.incompatible_pointers,
                        "assignment from incompatible pointer type",
                    )
                }
            }
            (TypeKind::Struct(a), TypeKind::Struct(b)) if a == b => Conversion::Ok,
            (TypeKind::Float(_), _) | (_, TypeKind::Float(_)) => {
                Conversion::Error("floating point types are not supported".to_string())
            }
            _ => Conversion::Error("incompatible types in assignment".to_string()),
        }
    }
}

/// Type compatibility, ignoring top-level qualifiers and parameter names.
/// Arrays of unknown size are compatible with any length, old-style
/// function types with any prototype.
pub fn compatible(a: &CType, b: &CType, structs: &[StructDef]) -> bool {
    match (&a.kind, &b.kind) {
        (TypeKind::Void, TypeKind::Void) => true,
        (TypeKind::Int { kind: ka, unsigned: ua }, TypeKind::Int { kind: kb, unsigned: ub }) => {
            ka == kb && ua == ub
        }
        (TypeKind::Float(x), TypeKind::Float(y)) => x == y,
        (TypeKind::Pointer(x), TypeKind::Pointer(y)) => compatible(x, y, structs),
        (TypeKind::Array(x, lx), TypeKind::Array(y, ly)) => {
            (lx.is_none() || ly.is_none() || lx == ly) && compatible(x, y, structs)
        }
        (TypeKind::Func(f), TypeKind::Func(g)) => {
            if !compatible(&f.ret, &g.ret, structs) {
                return false;
            }
            if f.old_style || g.old_style {
                return true;
            }
            f.variadic == g.variadic
                && f.params.len() == g.params.len()
                && f
                    .params
                    .iter()
                    .zip(&g.params)
                    .all(|(p, q)| compatible(&p.ty.unqualified(), &q.ty.unqualified(), structs))
        }
        (TypeKind::Struct(x), TypeKind::Struct(y)) => x == y,
        _ => false,
    }
}

/// Human readable type for diagnostics, e.g. `unsigned int *`.
pub fn type_to_string(ty: &CType, name_of: &dyn Fn(TokId) -> String, structs: &[StructDef]) -> String {
    let mut out = String::new();
    if ty.is_const {
        out.push_str("const ");
    }
    match &ty.kind {
        TypeKind::Void => out.push_str("void"),
        TypeKind::Int { kind, unsigned } => {
            if *unsigned && *kind != IntKind::Bool {
                out.push_str("unsigned ");
            }
            out.push_str(match kind {
                IntKind::Bool => "_Bool",
                IntKind::Char => "char",
                IntKind::Short => "short",
                IntKind::Int => "int",
                IntKind::Long => "long",
            });
        }
        TypeKind::Float(FloatKind::Float) => out.push_str("float"),
        TypeKind::Float(FloatKind::Double) => out.push_str("double"),
        TypeKind::Float(FloatKind::LongDouble) => out.push_str("long double"),
        TypeKind::Pointer(t) => {
            out.push_str(&type_to_string(t, name_of, structs));
            out.push_str(" *");
        }
        TypeKind::Array(t, len) => {
            out.push_str(&type_to_string(t, name_of, structs));
            match len {
                Some(n) => out.push_str(&format!("[{}]", n)),
                None => out.push_str("[]"),
            }
        }
        TypeKind::Func(f) => {
            out.push_str(&type_to_string(&f.ret, name_of, structs));
            out.push_str(" (");
            let params: Vec<String> = f
                .params
                .iter()
                .map(|p| type_to_string(&p.ty, name_of, structs))
                .collect();
            out.push_str(&params.join(", "));
            if f.variadic {
                out.push_str(", ...");
            }
            out.push(')');
        }
        TypeKind::Struct(id) => {
            let def = structs.get(id.0);
            let keyword = if def.is_some_and(|d| d.is_union) {
                "union"
            } else {
                "struct"
            };
            out.push_str(keyword);
            if let Some(def) = def {
                if !def.tag.is_anonymous() {
                    out.push(' ');
                    out.push_str(&name_of(def.tag));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let structs = Vec::new();
        assert_eq!(size_align(&CType::char(false), &structs), Some((1, 1)));
        assert_eq!(size_align(&CType::long(), &structs), Some((8, 8)));
        let arr = CType::int().array_of(Some(10)).array_of(Some(2));
        assert_eq!(size_align(&arr, &structs), Some((80, 4)));
        assert_eq!(size_align(&CType::int().array_of(None), &structs), None);
    }

    #[test]
    fn test_struct_layout() {
        let mut fields = vec![
            Field {
                name: TokId(100),
                ty: CType::char(false),
                offset: 0,
            },
            Field {
                name: TokId(101),
                ty: CType::long(),
                offset: 0,
            },
            Field {
                name: TokId(102),
                ty: CType::short(),
                offset: 0,
            },
        ];
        let (size, align) = layout_fields(&mut fields, false, 1, &[]).unwrap();
        assert_eq!((size, align), (24, 8));
        assert_eq!(fields[1].offset, 8);
        assert_eq!(fields[2].offset, 16);

        let (size, _) = layout_fields(&mut fields, true, 1, &[]).unwrap();
        assert_eq!(size, 8);
        assert!(fields.iter().all(|f| f.offset == 0));
    }

    #[test]
    fn test_usual_arithmetic_conversions() {
        let c = CType::char(false);
        assert_eq!(common_int_type(&c, &c), CType::int());
        assert_eq!(common_int_type(&CType::int(), &CType::uint()), CType::uint());
        assert_eq!(common_int_type(&CType::uint(), &CType::long()), CType::long());
        assert_eq!(common_int_type(&CType::ulong(), &CType::int()), CType::ulong());
    }

    #[test]
    fn test_canonical_values() {
        assert_eq!(canonical_value(&CType::char(false), 0xff), -1);
        assert_eq!(canonical_value(&CType::uint(), -1), 0xffff_ffff);
        assert_eq!(canonical_value(&CType::int_of(IntKind::Bool, true), 42), 1);
    }

    #[test]
    fn test_assignment_policy() {
        let policy = ConversionPolicy::default();
        let int_ptr = CType::int().pointer_to();
        let char_ptr = CType::char(false).pointer_to();
        assert_eq!(policy.check_assign(&int_ptr, &CType::int(), true, &[]), Conversion::Ok);
        assert!(matches!(
            policy.check_assign(&int_ptr, &CType::int(), false, &[]),
            Conversion::Warn(_)
        ));
        assert!(matches!(
            policy.check_assign(&int_ptr, &char_ptr, false, &[]),
            Conversion::Warn(_)
        ));
        let strict = ConversionPolicy {
            incompatible_pointers: Check::Error,
            ..policy
        };
        assert!(matches!(
            strict.check_assign(&int_ptr, &char_ptr, false, &[]),
            Conversion::Error(_)
        ));
        let void_ptr = CType::void().pointer_to();
        assert_eq!(policy.check_assign(&int_ptr, &void_ptr, false, &[]), Conversion::Ok);
    }
}
