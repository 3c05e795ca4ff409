//! The type graph: kinds, qualifiers, function signatures, and the
//! identity/convertibility predicates used by the parser and marshaler.

use crate::layout::{self, LayoutError};
use crate::record::{EnumDecl, Record};
use smol_str::SmolStr;
use std::fmt;
use std::rc::Rc;

/// cv-qualifier mask.
///
/// Signedness is folded into the scalar kind rather than kept as a bit, so
/// only `const` and `volatile` survive into a finished [`Type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qualifiers(u8);

impl Qualifiers {
    pub const NONE: Qualifiers = Qualifiers(0);
    pub const CONST: Qualifiers = Qualifiers(1);
    pub const VOLATILE: Qualifiers = Qualifiers(1 << 1);

    pub fn contains(self, other: Qualifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Qualifiers) {
        self.0 |= other.0;
    }

    pub fn union(self, other: Qualifiers) -> Qualifiers {
        Qualifiers(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every qualifier in `self` is also in `other`; converting
    /// from `self` to `other` then only *adds* qualifiers.
    pub fn weaker_or_equal(self, other: Qualifiers) -> bool {
        other.contains(self)
    }
}

impl fmt::Display for Qualifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if self.contains(Qualifiers::CONST) {
            write!(f, "const")?;
            sep = " ";
        }
        if self.contains(Qualifiers::VOLATILE) {
            write!(f, "{sep}volatile")?;
        }
        Ok(())
    }
}

/// Array dimension: a fixed length, a construction-time length (VLA), or a
/// flexible tail (`[]` as a struct's last member).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    Fixed(u64),
    Variable,
    Flexible,
}

/// Calling convention tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConv {
    #[default]
    C,
    Std,
    Fast,
}

impl CallConv {
    pub fn as_str(self) -> &'static str {
        match self {
            CallConv::C => "__cdecl",
            CallConv::Std => "__stdcall",
            CallConv::Fast => "__fastcall",
        }
    }
}

/// One function parameter. Names are kept for diagnostics only and are
/// ignored by every identity predicate.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Option<SmolStr>,
    pub ty: Type,
}

/// A function signature: result, parameters, variadic flag, convention.
#[derive(Debug, Clone)]
pub struct FuncSig {
    pub result: Type,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub convention: CallConv,
}

impl FuncSig {
    /// Signature identity: equal result, variadic flag, arity, and pairwise
    /// parameter types. Parameter names do not participate.
    pub fn is_same(&self, other: &FuncSig) -> bool {
        self.variadic == other.variadic
            && self.convention == other.convention
            && self.params.len() == other.params.len()
            && self.result.is_same(&other.result)
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty.is_same(&b.ty))
    }
}

/// The kind of a type. Pointer/array/function components own their nested
/// descriptor; record/enum components share the registered declaration.
#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Bool,
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Size,
    SSize,
    IntPtr,
    UIntPtr,
    PtrDiff,
    Float,
    Double,
    LongDouble,
    WChar,
    Char16,
    Char32,
    VaList,
    Pointer(Box<Type>),
    Reference(Box<Type>),
    Array(Box<Type>, ArrayLen),
    Function(Box<FuncSig>),
    FunctionPointer(Box<FuncSig>),
    Record(Rc<Record>),
    Enum(Rc<EnumDecl>),
}

/// A C type: kind plus cv-qualifiers.
#[derive(Debug, Clone)]
pub struct Type {
    pub kind: TypeKind,
    pub qual: Qualifiers,
}

impl Type {
    pub fn new(kind: TypeKind) -> Type {
        Type {
            kind,
            qual: Qualifiers::NONE,
        }
    }

    pub fn qualified(kind: TypeKind, qual: Qualifiers) -> Type {
        Type { kind, qual }
    }

    pub fn void() -> Type {
        Type::new(TypeKind::Void)
    }

    pub fn int() -> Type {
        Type::new(TypeKind::Int)
    }

    pub fn pointer_to(pointee: Type) -> Type {
        Type::new(TypeKind::Pointer(Box::new(pointee)))
    }

    pub fn reference_to(referee: Type) -> Type {
        Type::new(TypeKind::Reference(Box::new(referee)))
    }

    pub fn array_of(elem: Type, len: ArrayLen) -> Type {
        Type::new(TypeKind::Array(Box::new(elem), len))
    }

    pub fn unqualified(&self) -> Type {
        Type::new(self.kind.clone())
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.kind, TypeKind::Bool)
    }

    /// Any integer scalar, including enums (which carry `int` representation).
    pub fn is_integer(&self) -> bool {
        use TypeKind::*;
        matches!(
            self.kind,
            Bool | Char
                | SChar
                | UChar
                | Short
                | UShort
                | Int
                | UInt
                | Long
                | ULong
                | LongLong
                | ULongLong
                | I8
                | U8
                | I16
                | U16
                | I32
                | U32
                | I64
                | U64
                | Size
                | SSize
                | IntPtr
                | UIntPtr
                | PtrDiff
                | WChar
                | Char16
                | Char32
                | Enum(_)
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Float | TypeKind::Double | TypeKind::LongDouble
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Signedness of an integer kind. Plain `char` follows the platform.
    pub fn is_signed_integer(&self) -> bool {
        use TypeKind::*;
        match self.kind {
            Char => libc::c_char::MIN != 0,
            SChar | Short | Int | Long | LongLong => true,
            I8 | I16 | I32 | I64 | SSize | IntPtr | PtrDiff => true,
            Enum(_) => true,
            WChar => (libc::wchar_t::MIN as i64) != 0,
            _ => false,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, TypeKind::Reference(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array(..))
    }

    pub fn is_record(&self) -> bool {
        matches!(self.kind, TypeKind::Record(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Function(_) | TypeKind::FunctionPointer(_)
        )
    }

    /// The pointed-to / referenced type, if any.
    pub fn pointee(&self) -> Option<&Type> {
        match &self.kind {
            TypeKind::Pointer(t) | TypeKind::Reference(t) => Some(t),
            _ => None,
        }
    }

    /// Element type for arrays.
    pub fn element(&self) -> Option<&Type> {
        match &self.kind {
            TypeKind::Array(t, _) => Some(t),
            _ => None,
        }
    }

    /// A type a value of this one can be passed by as a function argument.
    /// Unbounded arrays and bare function types cannot be passed by value.
    pub fn is_passable(&self) -> bool {
        match &self.kind {
            TypeKind::Void | TypeKind::Function(_) => false,
            TypeKind::Array(_, len) => !matches!(len, ArrayLen::Flexible | ArrayLen::Variable),
            TypeKind::Record(rec) => rec.layout().map_or(false, |l| !l.flexible),
            _ => true,
        }
    }

    /// Native size in bytes.
    pub fn size(&self) -> Result<usize, LayoutError> {
        layout::size_of(self)
    }

    /// Native alignment in bytes.
    pub fn align(&self) -> Result<usize, LayoutError> {
        layout::align_of(self)
    }

    /// Size of a VLA / flexible-tail type given the construction-time
    /// element count; delegates to [`size`](Type::size) for sized types.
    pub fn size_with_count(&self, count: usize) -> Result<usize, LayoutError> {
        layout::size_with_count(self, count)
    }

    /// Exact identity: same kind, same qualifiers, nested descriptors same.
    /// Records and enums compare by declaration identity.
    pub fn is_same(&self, other: &Type) -> bool {
        self.qual == other.qual && self.is_same_unqualified(other)
    }

    /// Identity ignoring this level's cv-qualifiers.
    pub fn is_same_unqualified(&self, other: &Type) -> bool {
        use TypeKind::*;
        match (&self.kind, &other.kind) {
            (Pointer(a), Pointer(b)) | (Reference(a), Reference(b)) => a.is_same(b),
            (Array(a, la), Array(b, lb)) => la == lb && a.is_same(b),
            (Function(a), Function(b)) | (FunctionPointer(a), FunctionPointer(b)) => a.is_same(b),
            (Record(a), Record(b)) => Rc::ptr_eq(a, b),
            (Enum(a), Enum(b)) => Rc::ptr_eq(a, b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }

    /// Assignment-style convertibility: `self` (source) to `target`.
    ///
    /// Weaker than [`is_same`](Type::is_same): pointers may decay through
    /// `void*`, cv-qualifiers may be added (never dropped) outside reference
    /// context, and one level of pointer-to-pointer structure is recursed.
    pub fn is_convertible_to(&self, target: &Type) -> bool {
        self.convertible(target, 0, false)
    }

    fn convertible(&self, target: &Type, depth: u8, in_ref: bool) -> bool {
        use TypeKind::*;

        // Reference context forbids weakening or strengthening qualifiers.
        if in_ref {
            if self.qual != target.qual {
                return false;
            }
        } else if !self.qual.weaker_or_equal(target.qual) {
            return false;
        }

        match (&self.kind, &target.kind) {
            (Pointer(a), Pointer(b)) => {
                if a.is_void() || b.is_void() {
                    return a.qual.weaker_or_equal(b.qual);
                }
                if a.is_same_unqualified(b) {
                    return a.qual.weaker_or_equal(b.qual);
                }
                // one extra structural level, then identity only
                depth == 0 && a.convertible(b, depth + 1, false)
            }
            (Reference(a), Reference(b)) => a.convertible(b, depth, true),
            (Array(a, _), Pointer(b)) => {
                // array decay
                b.is_void() || (a.is_same_unqualified(b) && a.qual.weaker_or_equal(b.qual))
            }
            (FunctionPointer(a), FunctionPointer(b)) | (Function(a), FunctionPointer(b)) => {
                a.is_same(b)
            }
            _ => self.is_same_unqualified(target),
        }
    }

    /// Name of the base specifier, e.g. `unsigned long`, `struct point`.
    fn specifier(&self) -> String {
        use TypeKind::*;
        let base: String = match &self.kind {
            Void => "void".into(),
            Bool => "bool".into(),
            Char => "char".into(),
            SChar => "signed char".into(),
            UChar => "unsigned char".into(),
            Short => "short".into(),
            UShort => "unsigned short".into(),
            Int => "int".into(),
            UInt => "unsigned int".into(),
            Long => "long".into(),
            ULong => "unsigned long".into(),
            LongLong => "long long".into(),
            ULongLong => "unsigned long long".into(),
            I8 => "int8_t".into(),
            U8 => "uint8_t".into(),
            I16 => "int16_t".into(),
            U16 => "uint16_t".into(),
            I32 => "int32_t".into(),
            U32 => "uint32_t".into(),
            I64 => "int64_t".into(),
            U64 => "uint64_t".into(),
            Size => "size_t".into(),
            SSize => "ssize_t".into(),
            IntPtr => "intptr_t".into(),
            UIntPtr => "uintptr_t".into(),
            PtrDiff => "ptrdiff_t".into(),
            Float => "float".into(),
            Double => "double".into(),
            LongDouble => "long double".into(),
            WChar => "wchar_t".into(),
            Char16 => "char16_t".into(),
            Char32 => "char32_t".into(),
            VaList => "va_list".into(),
            Record(rec) => {
                let kw = if rec.is_union() { "union" } else { "struct" };
                if rec.name().is_empty() {
                    format!("{kw} {{}}")
                } else {
                    format!("{kw} {}", rec.name())
                }
            }
            Enum(e) => {
                if e.name().is_empty() {
                    "enum {}".into()
                } else {
                    format!("enum {}", e.name())
                }
            }
            Pointer(_) | Reference(_) | Array(..) | Function(_) | FunctionPointer(_) => {
                unreachable!("specifier called on derived type")
            }
        };
        if self.qual.is_empty() {
            base
        } else {
            format!("{} {base}", self.qual)
        }
    }

    /// Serialize back to C syntax with `name` as the declared identifier
    /// (may be empty for an abstract declarator). Re-parsing the result
    /// yields an [`is_same`](Type::is_same) type.
    pub fn display_named(&self, name: &str) -> String {
        fn build(ty: &Type, inner: String) -> String {
            use TypeKind::*;
            match &ty.kind {
                Pointer(p) => {
                    let mut decl = String::from("*");
                    if !ty.qual.is_empty() {
                        decl.push_str(&format!("{} ", ty.qual));
                    }
                    decl.push_str(&inner);
                    build(p, decl)
                }
                Reference(p) => build(p, format!("&{inner}")),
                Array(elem, len) => {
                    let inner = parenthesize_if_prefixed(inner);
                    let dim = match len {
                        ArrayLen::Fixed(n) => format!("[{n}]"),
                        ArrayLen::Variable => "[?]".to_string(),
                        ArrayLen::Flexible => "[]".to_string(),
                    };
                    build(elem, format!("{inner}{dim}"))
                }
                Function(sig) => {
                    let inner = parenthesize_if_prefixed(inner);
                    build(&sig.result, format!("{inner}({})", params_string(sig)))
                }
                FunctionPointer(sig) => {
                    let decl = format!("(*{inner})({})", params_string(sig));
                    build(&sig.result, decl)
                }
                _ => {
                    let specifier = ty.specifier();
                    if inner.is_empty() {
                        specifier
                    } else {
                        format!("{specifier} {inner}")
                    }
                }
            }
        }

        fn parenthesize_if_prefixed(inner: String) -> String {
            if inner.starts_with('*') || inner.starts_with('&') {
                format!("({inner})")
            } else {
                inner
            }
        }

        fn params_string(sig: &FuncSig) -> String {
            let mut parts: Vec<String> =
                sig.params.iter().map(|p| p.ty.display_named("")).collect();
            if sig.variadic {
                parts.push("...".to_string());
            }
            if parts.is_empty() {
                parts.push("void".to_string());
            }
            parts.join(", ")
        }

        build(self, name.to_string())
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_named(""))
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}
