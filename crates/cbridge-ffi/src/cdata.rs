//! The opaque typed value exposed to the host: a parsed C type paired with
//! native-format bytes, a native code pointer, or nothing at all (a bare
//! ctype used for construction and casting).
//!
//! Cloning a `Cdata` is shallow: handles share the underlying storage, so
//! address-of and dereference views stay valid while any handle lives.

use crate::call::NativeFunc;
use crate::closure::ClosureData;
use crate::error::FfiError;
use crate::marshal::{self, ValueCtx};
use crate::value::{HostFn, HostValue};
use cbridge_ast::{ArrayLen, BitField, Type, TypeKind};
use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

// ── aligned storage ─────────────────────────────────────────────────

/// Heap bytes with explicit alignment, zero-initialized.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
}

impl AlignedBuf {
    pub(crate) fn zeroed(size: usize, align: usize) -> AlignedBuf {
        let align = align.max(1);
        if size == 0 {
            return AlignedBuf {
                ptr: NonNull::dangling(),
                size: 0,
                align,
            };
        }
        let layout = Layout::from_size_align(size, align).expect("valid layout");
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        AlignedBuf { ptr, size, align }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    pub(crate) fn align(&self) -> usize {
        self.align
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.size != 0 {
            let layout = Layout::from_size_align(self.size, self.align).expect("valid layout");
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// ── value storage ───────────────────────────────────────────────────

/// Anything that must stay alive while some storage can reach it: other
/// allocations pointed into, or closure trampolines whose code address was
/// stored.
#[derive(Clone)]
pub(crate) enum Keep {
    Data(Rc<DataBox>),
    Closure(Rc<ClosureData>),
}

/// Owned native bytes plus whatever must stay alive while they are
/// reachable (pointed-into allocations, marshaled string copies) and an
/// optional host finalizer.
pub(crate) struct DataBox {
    pub(crate) buf: AlignedBuf,
    pub(crate) ty: Type,
    pub(crate) keepalive: RefCell<Vec<Keep>>,
    pub(crate) finalizer: RefCell<Option<HostFn>>,
}

impl DataBox {
    pub(crate) fn zeroed(ty: Type, size: usize, align: usize) -> Rc<DataBox> {
        Rc::new(DataBox {
            buf: AlignedBuf::zeroed(size, align),
            ty,
            keepalive: RefCell::new(Vec::new()),
            finalizer: RefCell::new(None),
        })
    }
}

impl Drop for DataBox {
    fn drop(&mut self) {
        let Some(finalizer) = self.finalizer.borrow_mut().take() else {
            return;
        };
        // hand the finalizer the pointer value (or storage address) so it
        // can release the native resource; errors cannot propagate out of
        // a destructor and are dropped
        let addr = if self.ty.is_pointer() && self.buf.len() >= std::mem::size_of::<usize>() {
            unsafe { (self.buf.as_ptr() as *const usize).read() }
        } else {
            self.buf.as_ptr() as usize
        };
        let target = Cdata::pointer_from_addr(
            Type::pointer_to(self.ty.unqualified()),
            addr,
        );
        let _ = finalizer(&[HostValue::Cdata(target)]);
    }
}

#[derive(Clone)]
pub(crate) enum Repr {
    /// A bare ctype: no value.
    Ctype,
    /// Inline native-format bytes.
    Data(Rc<DataBox>),
    /// Native function: code pointer plus call interface.
    Func(Rc<NativeFunc>),
    /// Native-callable trampoline into a host function.
    Closure(Rc<ClosureData>),
}

/// A typed native value (or bare type) handed to the host.
#[derive(Clone)]
pub struct Cdata {
    ty: Type,
    repr: Repr,
}

impl Cdata {
    /// A value-less type descriptor.
    pub fn ctype(ty: Type) -> Cdata {
        Cdata {
            ty,
            repr: Repr::Ctype,
        }
    }

    pub(crate) fn from_parts(ty: Type, repr: Repr) -> Cdata {
        Cdata { ty, repr }
    }

    /// Fresh zeroed storage for `ty` (VLA/flexible sizes resolved by the
    /// caller through `size`).
    pub(crate) fn new_data(ty: Type, size: usize, align: usize) -> Cdata {
        let data = DataBox::zeroed(ty.clone(), size, align);
        Cdata {
            ty,
            repr: Repr::Data(data),
        }
    }

    /// A pointer cdata holding a raw address, keeping nothing alive.
    pub(crate) fn pointer_from_addr(ty: Type, addr: usize) -> Cdata {
        let data = DataBox::zeroed(ty.clone(), std::mem::size_of::<usize>(), std::mem::align_of::<usize>());
        unsafe { (data.buf.as_ptr() as *mut usize).write(addr) };
        Cdata {
            ty,
            repr: Repr::Data(data),
        }
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn is_ctype(&self) -> bool {
        matches!(self.repr, Repr::Ctype)
    }

    pub(crate) fn repr(&self) -> &Repr {
        &self.repr
    }

    pub(crate) fn data_box(&self) -> Option<&Rc<DataBox>> {
        match &self.repr {
            Repr::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Address of the stored bytes (not the pointee).
    pub(crate) fn storage_ptr(&self) -> Option<*mut u8> {
        match &self.repr {
            Repr::Data(data) => Some(data.buf.as_ptr()),
            _ => None,
        }
    }

    /// The semantic address: pointer values dereference their stored
    /// address, functions and closures expose their code address,
    /// aggregates their storage.
    pub fn address(&self) -> usize {
        match &self.repr {
            Repr::Ctype => 0,
            Repr::Data(data) => {
                if self.ty.is_pointer() || self.ty.is_reference() {
                    unsafe { (data.buf.as_ptr() as *const usize).read() }
                } else {
                    data.buf.as_ptr() as usize
                }
            }
            Repr::Func(func) => func.code as usize,
            Repr::Closure(cl) => cl.code as usize,
        }
    }

    /// Pointer to the value a dereference-style operation should read:
    /// for pointers and references the pointed-to memory, for everything
    /// else the storage itself.
    pub(crate) fn deref_ptr(&self) -> Option<*mut u8> {
        let storage = self.storage_ptr()?;
        if self.ty.is_pointer() || self.ty.is_reference() {
            let addr = unsafe { (storage as *const usize).read() };
            if addr == 0 {
                return None;
            }
            Some(addr as *mut u8)
        } else {
            Some(storage)
        }
    }

    // ── protocol operations ─────────────────────────────────────────

    /// `&value`: a pointer cdata sharing this value's storage.
    pub fn addr_of(&self) -> Result<Cdata, FfiError> {
        let data = self.data_box().ok_or_else(|| FfiError::Conversion {
            from: self.ty.to_string(),
            to: format!("{} *", self.ty),
            detail: "value has no addressable storage".into(),
        })?;
        let ptr_ty = Type::pointer_to(self.ty.clone());
        let boxed = Cdata::pointer_from_addr(ptr_ty, data.buf.as_ptr() as usize);
        boxed
            .data_box()
            .expect("pointer cdata has storage")
            .keepalive
            .borrow_mut()
            .push(Keep::Data(data.clone()));
        Ok(boxed)
    }

    /// Register a finalizer, replacing any previous one. It runs when the
    /// last handle to this storage is destroyed.
    pub fn set_finalizer(&self, f: Option<HostFn>) -> Result<(), FfiError> {
        let data = self.data_box().ok_or_else(|| {
            FfiError::Unsupported("finalizers require a value with storage".into())
        })?;
        *data.finalizer.borrow_mut() = f;
        Ok(())
    }

    /// Indexed or field read. Pointers and arrays index by integer,
    /// records by field name (transparent anonymous members included).
    pub fn get(&self, key: &HostValue) -> Result<HostValue, FfiError> {
        match key {
            HostValue::Int(idx) => self.get_index(*idx),
            HostValue::Str(name) => {
                let name = String::from_utf8_lossy(name).into_owned();
                self.get_field(&name)
            }
            other => Err(FfiError::NotIndexable {
                ty: format!("{} (indexed with {})", self.ty, other.type_name()),
            }),
        }
    }

    /// Indexed or field write.
    pub fn set(&self, key: &HostValue, value: &HostValue) -> Result<(), FfiError> {
        match key {
            HostValue::Int(idx) => self.set_index(*idx, value),
            HostValue::Str(name) => {
                let name = String::from_utf8_lossy(name).into_owned();
                self.set_field(&name, value)
            }
            other => Err(FfiError::NotIndexable {
                ty: format!("{} (indexed with {})", self.ty, other.type_name()),
            }),
        }
    }

    fn element_at(&self, index: i64) -> Result<(*mut u8, Type), FfiError> {
        match &self.ty.kind {
            TypeKind::Array(elem, len) => {
                let data = self.data_box().ok_or_else(|| FfiError::NotIndexable {
                    ty: self.ty.to_string(),
                })?;
                let esize = elem.size()?;
                let in_bounds = match len {
                    ArrayLen::Fixed(n) => index >= 0 && (index as u64) < *n,
                    // construction-sized storage bounds the index
                    ArrayLen::Variable | ArrayLen::Flexible => {
                        index >= 0 && (index as usize + 1) * esize <= data.buf.len()
                    }
                };
                if !in_bounds {
                    return Err(FfiError::IndexOutOfBounds {
                        ty: self.ty.to_string(),
                        index,
                    });
                }
                Ok((
                    unsafe { data.buf.as_ptr().add(index as usize * esize) },
                    (**elem).clone(),
                ))
            }
            TypeKind::Pointer(pointee) | TypeKind::Reference(pointee) => {
                let base = self.deref_ptr().ok_or_else(|| FfiError::Conversion {
                    from: self.ty.to_string(),
                    to: pointee.to_string(),
                    detail: "null pointer dereference".into(),
                })?;
                let esize = pointee.size()?;
                Ok((
                    unsafe { base.offset(index as isize * esize as isize) },
                    (**pointee).clone(),
                ))
            }
            _ => Err(FfiError::NotIndexable {
                ty: self.ty.to_string(),
            }),
        }
    }

    fn get_index(&self, index: i64) -> Result<HostValue, FfiError> {
        let (ptr, ty) = self.element_at(index)?;
        unsafe { marshal::from_native(ptr, &ty, ValueCtx::Deref, self.data_box()) }
    }

    fn set_index(&self, index: i64, value: &HostValue) -> Result<(), FfiError> {
        let (ptr, ty) = self.element_at(index)?;
        let mut keep = Vec::new();
        marshal::to_native(value, &ty, ptr, &mut keep)?;
        if let Some(data) = self.data_box() {
            data.keepalive.borrow_mut().extend(keep);
        }
        Ok(())
    }

    fn field_target(&self, name: &str) -> Result<(*mut u8, Type, Option<BitField>), FfiError> {
        // a pointer/reference to a record indexes through to the pointee
        let (record_ty, base) = match &self.ty.kind {
            TypeKind::Pointer(p) | TypeKind::Reference(p) if p.is_record() => {
                let base = self.deref_ptr().ok_or_else(|| FfiError::Conversion {
                    from: self.ty.to_string(),
                    to: (**p).to_string(),
                    detail: "null pointer dereference".into(),
                })?;
                ((**p).clone(), base)
            }
            TypeKind::Record(_) => {
                let base = self.storage_ptr().ok_or_else(|| FfiError::NotIndexable {
                    ty: self.ty.to_string(),
                })?;
                (self.ty.clone(), base)
            }
            _ => {
                return Err(FfiError::NotIndexable {
                    ty: self.ty.to_string(),
                })
            }
        };
        let TypeKind::Record(rec) = &record_ty.kind else {
            unreachable!("record type checked above");
        };
        let field = rec.find_field(name).ok_or_else(|| FfiError::NoSuchField {
            ty: record_ty.to_string(),
            field: name.to_string(),
        })?;
        Ok((
            unsafe { base.add(field.offset) },
            field.ty,
            field.bits,
        ))
    }

    fn get_field(&self, name: &str) -> Result<HostValue, FfiError> {
        let (ptr, ty, bits) = self.field_target(name)?;
        if let Some(bits) = bits {
            let raw = unsafe { marshal::read_int_bits(ptr, &ty)? };
            return Ok(HostValue::Int(extract_bitfield(
                raw,
                bits,
                ty.is_signed_integer(),
            )));
        }
        unsafe { marshal::from_native(ptr, &ty, ValueCtx::Deref, self.data_box()) }
    }

    fn set_field(&self, name: &str, value: &HostValue) -> Result<(), FfiError> {
        let (ptr, ty, bits) = self.field_target(name)?;
        if let Some(bits) = bits {
            let new = match value {
                HostValue::Int(v) => *v,
                HostValue::Bool(b) => *b as i64,
                other => {
                    return Err(FfiError::conversion(
                        other.type_name(),
                        ty.to_string(),
                        "bitfields take integer values",
                    ))
                }
            };
            let raw = unsafe { marshal::read_int_bits(ptr, &ty)? };
            let merged = insert_bitfield(raw, bits, new);
            return unsafe { marshal::write_int_bits(ptr, &ty, merged) };
        }
        let mut keep = Vec::new();
        marshal::to_native(value, &ty, ptr, &mut keep)?;
        if let Some(data) = self.data_box() {
            data.keepalive.borrow_mut().extend(keep);
        }
        Ok(())
    }

    /// Call a function-typed value.
    pub fn call(&self, args: &[HostValue]) -> Result<HostValue, FfiError> {
        match &self.repr {
            Repr::Func(func) => func.invoke(args),
            Repr::Closure(cl) => cl.invoke_native(args),
            Repr::Data(_) if self.ty.is_function() => {
                // a function pointer stored as data: materialize the callee
                let addr = self.address();
                if addr == 0 {
                    return Err(FfiError::NotCallable {
                        ty: format!("{} (null)", self.ty),
                    });
                }
                let TypeKind::FunctionPointer(sig) = &self.ty.kind else {
                    return Err(FfiError::NotCallable {
                        ty: self.ty.to_string(),
                    });
                };
                let func = NativeFunc::new(Rc::new((**sig).clone()), addr as *mut _);
                func.invoke(args)
            }
            _ => Err(FfiError::NotCallable {
                ty: self.ty.to_string(),
            }),
        }
    }
}

fn extract_bitfield(raw: u64, bits: BitField, signed: bool) -> i64 {
    let shifted = raw >> bits.bit_offset;
    let mask = if bits.width >= 64 {
        u64::MAX
    } else {
        (1u64 << bits.width) - 1
    };
    let value = shifted & mask;
    if signed && bits.width < 64 && value & (1u64 << (bits.width - 1)) != 0 {
        (value | !mask) as i64
    } else {
        value as i64
    }
}

fn insert_bitfield(raw: u64, bits: BitField, value: i64) -> u64 {
    let mask = if bits.width >= 64 {
        u64::MAX
    } else {
        (1u64 << bits.width) - 1
    };
    let cleared = raw & !(mask << bits.bit_offset);
    cleared | (((value as u64) & mask) << bits.bit_offset)
}

impl fmt::Display for Cdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ctype() {
            return write!(f, "ctype<{}>", self.ty);
        }
        write!(f, "cdata<{}>: {:#x}", self.ty, self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn aligned_buf_is_aligned_and_zeroed() {
        for align in [1usize, 2, 4, 8, 16] {
            let buf = AlignedBuf::zeroed(32, align);
            assert_eq!(buf.as_ptr() as usize % align, 0);
            let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), 32) };
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn bitfield_round_trip() {
        let bits = BitField {
            bit_offset: 3,
            width: 4,
        };
        let raw = insert_bitfield(0, bits, 0b1011);
        assert_eq!(extract_bitfield(raw, bits, false), 0b1011);
        // signed extraction sign-extends
        assert_eq!(extract_bitfield(raw, bits, true), 0b1011 - 16);
    }

    #[test]
    fn ctype_has_no_value() {
        let cd = Cdata::ctype(Type::int());
        assert!(cd.is_ctype());
        assert_eq!(cd.address(), 0);
        assert_eq!(cd.to_string(), "ctype<int>");
    }
}
