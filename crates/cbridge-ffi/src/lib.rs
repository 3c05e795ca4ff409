//! cbridge-ffi: value marshaling between a dynamic host and native code.
//!
//! The [`Bridge`] owns the declaration store and per-record metatypes, and
//! exposes the full opaque-value protocol: declaration (`cdef`),
//! construction, casting, indexing, calls, arithmetic, type queries, and
//! symbol resolution against loaded libraries. The host talks to it purely
//! through [`HostValue`]s and [`Cdata`] handles.

mod call;
mod cdata;
mod closure;
mod desc;
mod error;
mod library;
mod marshal;
mod ops;
mod value;

pub use cdata::Cdata;
pub use error::FfiError;
pub use library::NativeLibrary;
pub use ops::{arith, compare, BinOp, CmpOp};
pub use value::{HostFn, HostValue};

pub use cbridge_parser::{ParseArg, ParseError};

use cbridge_ast::{DeclStore, Declaration, Type, TypeKind};
use cdata::Repr;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use std::rc::Rc;
use thiserror::Error;

/// Any failure the host can see: a declaration-parsing error or a
/// marshaling error.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Ffi(#[from] FfiError),
    #[error(transparent)]
    Layout(#[from] cbridge_ast::LayoutError),
}

/// Per-record metamethod table. Attached to a record declaration at most
/// once.
#[derive(Default)]
pub struct Metatype {
    entries: FxHashMap<SmolStr, HostFn>,
}

impl Metatype {
    pub fn new() -> Metatype {
        Metatype::default()
    }

    /// Register a metamethod under its protocol name (`__index`, `__add`,
    /// `__call`, `__tostring`, ...).
    pub fn set(&mut self, name: &str, f: HostFn) -> &mut Self {
        self.entries.insert(SmolStr::new(name), f);
        self
    }

    fn get(&self, name: &str) -> Option<&HostFn> {
        self.entries.get(name)
    }
}

/// The FFI context: declaration store plus metatype registry. All parse
/// entry points go through an explicit `Bridge`, so independent bridges
/// are fully isolated.
#[derive(Default)]
pub struct Bridge {
    store: DeclStore,
    metatypes: FxHashMap<usize, Metatype>,
}

impl Bridge {
    pub fn new() -> Bridge {
        Bridge::default()
    }

    pub fn store(&self) -> &DeclStore {
        &self.store
    }

    /// Parse a declaration blob into the store. Atomic: either every
    /// declaration commits or none does.
    pub fn cdef(&mut self, src: &str, args: Vec<ParseArg>) -> Result<(), ParseError> {
        cbridge_parser::parse_decls(&mut self.store, src, args)
    }

    /// Parse a type into a bare ctype value.
    pub fn ctype(&mut self, src: &str) -> Result<Cdata, ParseError> {
        let ty = cbridge_parser::parse_type(&mut self.store, src, Vec::new())?;
        Ok(Cdata::ctype(ty))
    }

    fn resolve(&mut self, src: &str) -> Result<Type, ParseError> {
        cbridge_parser::parse_type(&mut self.store, src, Vec::new())
    }

    /// Construct a new value of the named type: zero-initialized, then
    /// filled from the initializers (a leading count for VLA types).
    pub fn new_value(&mut self, ty_src: &str, args: &[HostValue]) -> Result<Cdata, BridgeError> {
        let ty = self.resolve(ty_src)?;
        Ok(marshal::construct(&ty, args)?)
    }

    /// Construct from an existing ctype.
    pub fn new_from(&self, ct: &Cdata, args: &[HostValue]) -> Result<Cdata, FfiError> {
        marshal::construct(ct.ty(), args)
    }

    /// Explicit cast: reinterpreting, unchecked pointee.
    pub fn cast(&mut self, ty_src: &str, value: &HostValue) -> Result<Cdata, BridgeError> {
        let ty = self.resolve(ty_src)?;
        Ok(marshal::cast_value(&ty, value)?)
    }

    pub fn cast_to(&self, ct: &Cdata, value: &HostValue) -> Result<Cdata, FfiError> {
        marshal::cast_value(ct.ty(), value)
    }

    /// `sizeof`, with an element count for VLA / flexible types.
    pub fn sizeof(&mut self, ty_src: &str, count: Option<usize>) -> Result<usize, BridgeError> {
        let ty = self.resolve(ty_src)?;
        let size = match count {
            Some(n) => ty.size_with_count(n)?,
            None => ty.size()?,
        };
        Ok(size)
    }

    pub fn alignof(&mut self, ty_src: &str) -> Result<usize, BridgeError> {
        let ty = self.resolve(ty_src)?;
        Ok(ty.align()?)
    }

    /// Byte offset of a (possibly transparently nested) record field.
    pub fn offsetof(&mut self, ty_src: &str, field: &str) -> Result<usize, BridgeError> {
        let ty = self.resolve(ty_src)?;
        let TypeKind::Record(rec) = &ty.kind else {
            return Err(BridgeError::Ffi(FfiError::NotIndexable {
                ty: ty.to_string(),
            }));
        };
        let found = rec.find_field(field).ok_or_else(|| {
            BridgeError::Ffi(FfiError::NoSuchField {
                ty: ty.to_string(),
                field: field.to_string(),
            })
        })?;
        Ok(found.offset)
    }

    /// Is `value` a cdata of (unqualified) the named type?
    pub fn istype(&mut self, ty_src: &str, value: &HostValue) -> Result<bool, BridgeError> {
        let ty = self.resolve(ty_src)?;
        Ok(match value {
            HostValue::Cdata(cd) => cd.ty().is_same_unqualified(&ty),
            _ => false,
        })
    }

    // ── metatypes ───────────────────────────────────────────────────

    fn record_key(ty: &Type) -> Option<usize> {
        match &ty.kind {
            TypeKind::Record(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            TypeKind::Pointer(inner) | TypeKind::Reference(inner) => Self::record_key(inner),
            _ => None,
        }
    }

    /// Attach a metatype to a record declaration. A second attach for the
    /// same declaration is a hard error.
    pub fn metatype(&mut self, ty_src: &str, mt: Metatype) -> Result<(), BridgeError> {
        let ty = self.resolve(ty_src)?;
        let Some(key) = Self::record_key(&ty) else {
            return Err(BridgeError::Ffi(FfiError::Unsupported(format!(
                "metatypes attach to struct/union types, not `{ty}`"
            ))));
        };
        if self.metatypes.contains_key(&key) {
            return Err(BridgeError::Ffi(FfiError::MetatypeAlreadySet {
                ty: ty.to_string(),
            }));
        }
        self.metatypes.insert(key, mt);
        Ok(())
    }

    fn metamethod(&self, ty: &Type, name: &str) -> Option<&HostFn> {
        let key = Self::record_key(ty)?;
        self.metatypes.get(&key)?.get(name)
    }

    // ── the opaque value protocol ───────────────────────────────────

    /// Indexed/field read with `__index` fallback.
    pub fn index(&self, cd: &Cdata, key: &HostValue) -> Result<HostValue, FfiError> {
        match cd.get(key) {
            Err(FfiError::NoSuchField { .. }) | Err(FfiError::NotIndexable { .. }) => {
                if let Some(f) = self.metamethod(cd.ty(), "__index") {
                    return f(&[HostValue::Cdata(cd.clone()), key.clone()]);
                }
                cd.get(key)
            }
            other => other,
        }
    }

    /// Indexed/field write with `__newindex` fallback.
    pub fn newindex(
        &self,
        cd: &Cdata,
        key: &HostValue,
        value: &HostValue,
    ) -> Result<(), FfiError> {
        match cd.set(key, value) {
            Err(FfiError::NoSuchField { .. }) | Err(FfiError::NotIndexable { .. }) => {
                if let Some(f) = self.metamethod(cd.ty(), "__newindex") {
                    f(&[
                        HostValue::Cdata(cd.clone()),
                        key.clone(),
                        value.clone(),
                    ])?;
                    return Ok(());
                }
                cd.set(key, value)
            }
            other => other,
        }
    }

    /// Call with `__call` support for record-typed values.
    pub fn call_value(&self, cd: &Cdata, args: &[HostValue]) -> Result<HostValue, FfiError> {
        if !cd.ty().is_function() {
            if let Some(f) = self.metamethod(cd.ty(), "__call") {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(HostValue::Cdata(cd.clone()));
                full.extend_from_slice(args);
                return f(&full);
            }
        }
        cd.call(args)
    }

    /// Arithmetic with record metamethod override.
    pub fn arith_value(
        &self,
        op: BinOp,
        a: &HostValue,
        b: &HostValue,
    ) -> Result<HostValue, FfiError> {
        let name = match op {
            BinOp::Add => "__add",
            BinOp::Sub => "__sub",
            BinOp::Mul => "__mul",
            BinOp::Div => "__div",
            BinOp::Mod => "__mod",
        };
        for side in [a, b] {
            if let HostValue::Cdata(cd) = side {
                if let Some(f) = self.metamethod(cd.ty(), name) {
                    return f(&[a.clone(), b.clone()]);
                }
            }
        }
        ops::arith(op, a, b)
    }

    /// String conversion with `__tostring` override.
    pub fn tostring(&self, value: &HostValue) -> Result<String, FfiError> {
        if let HostValue::Cdata(cd) = value {
            if let Some(f) = self.metamethod(cd.ty(), "__tostring") {
                let out = f(&[value.clone()])?;
                return match out {
                    HostValue::Str(s) => Ok(String::from_utf8_lossy(&s).into_owned()),
                    other => Ok(format!("{other:?}")),
                };
            }
            return Ok(cd.to_string());
        }
        Ok(format!("{value:?}"))
    }

    // ── symbols ─────────────────────────────────────────────────────

    /// Resolve a declared name against a library: functions become
    /// callable cdata, variables are read through their declared type,
    /// constants come straight from the store.
    pub fn symbol(&self, lib: &NativeLibrary, name: &str) -> Result<HostValue, FfiError> {
        let decl = self
            .store
            .lookup(name)
            .ok_or_else(|| FfiError::MissingDeclaration {
                name: name.to_string(),
            })?;
        match decl {
            Declaration::Constant(v) => Ok(HostValue::Int(*v)),
            Declaration::Function(sig) => {
                let code = lib.symbol(name)?;
                let ty = Type::new(TypeKind::FunctionPointer(Box::new((**sig).clone())));
                let func = call::NativeFunc::new(sig.clone(), code);
                Ok(HostValue::Cdata(Cdata::from_parts(
                    ty,
                    Repr::Func(Rc::new(func)),
                )))
            }
            Declaration::Variable(ty) => {
                let addr = lib.symbol(name)?;
                let ty = ty.clone();
                unsafe {
                    marshal::from_native(addr as *const u8, &ty, marshal::ValueCtx::Deref, None)
                }
            }
            other => Err(FfiError::MissingSymbol {
                name: name.to_string(),
                detail: format!("`{}` is not a callable or data symbol", other.describe(name)),
            }),
        }
    }

    /// Convenience: resolve and call a declared function in one step.
    pub fn call_symbol(
        &self,
        lib: &NativeLibrary,
        name: &str,
        args: &[HostValue],
    ) -> Result<HostValue, FfiError> {
        match self.symbol(lib, name)? {
            HostValue::Cdata(cd) => cd.call(args),
            other => Err(FfiError::NotCallable {
                ty: other.type_name().to_string(),
            }),
        }
    }
}
