//! Conversions between host values and native representations.
//!
//! Dynamic-to-native conversion is directed by the declared target type and
//! range-checked; the only silent path is the deliberate boxing of values
//! that exceed the host's numeric precision. Native-to-dynamic conversion
//! always boxes pointers, records, arrays and functions, because those need
//! continued access to their type and address.

use crate::cdata::{Cdata, DataBox, Keep, Repr};
use crate::closure;
use crate::error::FfiError;
use crate::value::HostValue;
use cbridge_ast::{ArrayLen, Type, TypeKind};
use std::rc::Rc;

/// How a native value is being observed: through a dereference (field or
/// element read, out-parameter) or as a fresh value (return, construction).
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueCtx {
    Deref,
    NewValue,
}

// ── raw scalar access ───────────────────────────────────────────────

/// Read an integer storage unit, zero-extended to its raw bits.
///
/// # Safety
/// `ptr` must be valid for `ty.size()` bytes.
pub(crate) unsafe fn read_int_bits(ptr: *const u8, ty: &Type) -> Result<u64, FfiError> {
    Ok(match ty.size()? {
        1 => ptr.read() as u64,
        2 => (ptr as *const u16).read_unaligned() as u64,
        4 => (ptr as *const u32).read_unaligned() as u64,
        8 => (ptr as *const u64).read_unaligned(),
        n => {
            return Err(FfiError::Unsupported(format!(
                "integer of width {n} bytes"
            )))
        }
    })
}

/// Write an integer storage unit from raw bits.
///
/// # Safety
/// `ptr` must be valid for `ty.size()` bytes.
pub(crate) unsafe fn write_int_bits(ptr: *mut u8, ty: &Type, bits: u64) -> Result<(), FfiError> {
    match ty.size()? {
        1 => ptr.write(bits as u8),
        2 => (ptr as *mut u16).write_unaligned(bits as u16),
        4 => (ptr as *mut u32).write_unaligned(bits as u32),
        8 => (ptr as *mut u64).write_unaligned(bits),
        n => {
            return Err(FfiError::Unsupported(format!(
                "integer of width {n} bytes"
            )))
        }
    }
    Ok(())
}

/// Read an integer value with its signedness: `(value bits, unsigned)`.
/// Signed values are sign-extended into the i64 bits.
pub(crate) unsafe fn read_int_value(ptr: *const u8, ty: &Type) -> Result<(i64, bool), FfiError> {
    let raw = read_int_bits(ptr, ty)?;
    if ty.is_signed_integer() {
        let size = ty.size()?;
        let shift = 64 - 8 * size as u32;
        Ok((((raw << shift) as i64) >> shift, false))
    } else {
        Ok((raw as i64, true))
    }
}

unsafe fn read_float_value(ptr: *const u8, ty: &Type) -> Result<f64, FfiError> {
    Ok(match ty.size()? {
        4 => (ptr as *const f32).read_unaligned() as f64,
        8 => (ptr as *const f64).read_unaligned(),
        n => {
            return Err(FfiError::Unsupported(format!(
                "float of width {n} bytes"
            )))
        }
    })
}

/// Does the target integer type represent `value` exactly?
fn int_in_range(value: i64, from_unsigned: bool, target: &Type) -> Result<bool, FfiError> {
    let size = target.size()?;
    let bits = 8 * size as u32;
    if target.is_signed_integer() {
        if from_unsigned && value < 0 {
            // source is a u64 above i64::MAX; only a 64-bit target could
            // hold it, and signed 64 cannot
            return Ok(false);
        }
        if bits >= 64 {
            return Ok(true);
        }
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        Ok(value >= min && value <= max)
    } else {
        if !from_unsigned && value < 0 {
            return Ok(false);
        }
        if bits >= 64 {
            return Ok(true);
        }
        Ok((value as u64) < (1u64 << bits))
    }
}

fn is_byte_like(ty: &Type) -> bool {
    matches!(
        ty.kind,
        TypeKind::Void | TypeKind::Char | TypeKind::SChar | TypeKind::UChar | TypeKind::I8 | TypeKind::U8
    )
}

// ── dynamic → native ────────────────────────────────────────────────

/// Write `value` into `dst` as a `target`-typed native value. Temporary
/// allocations (string copies, materialized referents, closures) are pushed
/// to `keep` and must outlive the written bytes.
pub(crate) fn to_native(
    value: &HostValue,
    target: &Type,
    dst: *mut u8,
    keep: &mut Vec<Keep>,
) -> Result<(), FfiError> {
    use TypeKind::*;
    match &target.kind {
        Bool => {
            let truthy = match value {
                HostValue::Bool(b) => *b,
                HostValue::Int(v) => *v != 0,
                HostValue::Float(v) => *v != 0.0,
                other => return Err(mismatch(other, target)),
            };
            unsafe { dst.write(truthy as u8) };
            Ok(())
        }
        Enum(_) => to_native(value, &Type::int(), dst, keep),
        _ if target.is_integer() => {
            let (bits, from_unsigned) = int_source(value, target)?;
            if !int_in_range(bits, from_unsigned, target)? {
                return Err(FfiError::conversion(
                    format!("{value:?}"),
                    target.to_string(),
                    "value out of range",
                ));
            }
            unsafe { write_int_bits(dst, target, bits as u64) }
        }
        Float | Double => {
            let v = match value {
                HostValue::Int(v) => *v as f64,
                HostValue::Float(v) => *v,
                HostValue::Cdata(cd) => scalar_to_f64(cd)?,
                other => return Err(mismatch(other, target)),
            };
            match target.size()? {
                4 => unsafe { (dst as *mut f32).write_unaligned(v as f32) },
                _ => unsafe { (dst as *mut f64).write_unaligned(v) },
            }
            Ok(())
        }
        LongDouble | VaList => Err(FfiError::Unsupported(format!(
            "cannot marshal values of type `{target}`"
        ))),
        Pointer(pointee) => to_native_pointer(value, target, pointee, dst, keep),
        Reference(referee) => to_native_reference(value, referee, dst, keep),
        FunctionPointer(sig) => {
            match value {
                HostValue::Null => {
                    unsafe { (dst as *mut usize).write_unaligned(0) };
                    Ok(())
                }
                HostValue::Func(f) => {
                    let cl = closure::make_closure(Rc::new((**sig).clone()), f.clone())?;
                    unsafe { (dst as *mut usize).write_unaligned(cl.code as usize) };
                    keep.push(Keep::Closure(cl));
                    Ok(())
                }
                HostValue::Cdata(cd) => {
                    let compatible = match &cd.ty().kind {
                        FunctionPointer(other) => sig.is_same(other),
                        _ => false,
                    };
                    if !compatible {
                        return Err(FfiError::conversion(
                            cd.ty().to_string(),
                            target.to_string(),
                            "incompatible function signatures",
                        ));
                    }
                    unsafe { (dst as *mut usize).write_unaligned(cd.address()) };
                    keep_cdata(cd, keep);
                    Ok(())
                }
                other => Err(mismatch(other, target)),
            }
        }
        Record(rec) => match value {
            HostValue::Cdata(cd) => {
                let same = matches!(&cd.ty().kind, Record(other) if Rc::ptr_eq(rec, other));
                if !same {
                    return Err(FfiError::conversion(
                        cd.ty().to_string(),
                        target.to_string(),
                        "record types differ",
                    ));
                }
                let src = cd.storage_ptr().ok_or_else(|| {
                    FfiError::conversion(cd.ty().to_string(), target.to_string(), "no storage")
                })?;
                let size = target.size()?;
                unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
                keep_cdata(cd, keep);
                Ok(())
            }
            other => Err(mismatch(other, target)),
        },
        Array(elem, _) => match value {
            HostValue::Str(s) if is_byte_like(elem) => {
                let size = target.size()?;
                if s.len() >= size {
                    return Err(FfiError::conversion(
                        "string",
                        target.to_string(),
                        "initializer does not fit",
                    ));
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
                    std::ptr::write_bytes(dst.add(s.len()), 0, size - s.len());
                }
                Ok(())
            }
            HostValue::Cdata(cd) => {
                if !cd.ty().is_same_unqualified(target) {
                    return Err(FfiError::conversion(
                        cd.ty().to_string(),
                        target.to_string(),
                        "array types differ",
                    ));
                }
                let src = cd.storage_ptr().ok_or_else(|| {
                    FfiError::conversion(cd.ty().to_string(), target.to_string(), "no storage")
                })?;
                let size = target.size()?;
                unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
                Ok(())
            }
            HostValue::Aggregate(items) => init_aggregate(target, dst, items, keep),
            other => Err(mismatch(other, target)),
        },
        _ => Err(mismatch(value, target)),
    }
}

/// Integer bits for a host value feeding an integer target.
fn int_source(value: &HostValue, target: &Type) -> Result<(i64, bool), FfiError> {
    match value {
        HostValue::Bool(b) => Ok((*b as i64, false)),
        HostValue::Int(v) => Ok((*v, false)),
        HostValue::Float(v) => {
            if v.is_nan() || v.is_infinite() {
                return Err(FfiError::conversion(
                    "number",
                    target.to_string(),
                    "not a finite value",
                ));
            }
            let truncated = v.trunc();
            if truncated < i64::MIN as f64 || truncated > u64::MAX as f64 {
                return Err(FfiError::conversion(
                    "number",
                    target.to_string(),
                    "value out of range",
                ));
            }
            if truncated >= 0.0 {
                Ok((truncated as u64 as i64, truncated > i64::MAX as f64))
            } else {
                Ok((truncated as i64, false))
            }
        }
        HostValue::Cdata(cd) => {
            let ty = cd.ty().clone();
            if !ty.is_integer() {
                return Err(FfiError::conversion(
                    ty.to_string(),
                    target.to_string(),
                    "not an integer value",
                ));
            }
            let src = cd.storage_ptr().ok_or_else(|| {
                FfiError::conversion(ty.to_string(), target.to_string(), "no storage")
            })?;
            unsafe { read_int_value(src, &ty) }
        }
        other => Err(mismatch(other, target)),
    }
}

fn scalar_to_f64(cd: &Cdata) -> Result<f64, FfiError> {
    let ty = cd.ty().clone();
    let src = cd
        .storage_ptr()
        .ok_or_else(|| FfiError::conversion(ty.to_string(), "double", "no storage"))?;
    if ty.is_float() {
        unsafe { read_float_value(src, &ty) }
    } else if ty.is_integer() {
        let (bits, unsigned) = unsafe { read_int_value(src, &ty)? };
        Ok(if unsigned {
            bits as u64 as f64
        } else {
            bits as f64
        })
    } else {
        Err(FfiError::conversion(
            ty.to_string(),
            "double",
            "not an arithmetic value",
        ))
    }
}

fn to_native_pointer(
    value: &HostValue,
    target: &Type,
    pointee: &Type,
    dst: *mut u8,
    keep: &mut Vec<Keep>,
) -> Result<(), FfiError> {
    let write_addr = |addr: usize| unsafe { (dst as *mut usize).write_unaligned(addr) };
    match value {
        HostValue::Null => {
            write_addr(0);
            Ok(())
        }
        HostValue::Int(0) => {
            write_addr(0);
            Ok(())
        }
        HostValue::Str(s) if is_byte_like(pointee) => {
            // copy with a terminating NUL; the copy must outlive the call
            let data = DataBox::zeroed(
                Type::array_of(Type::new(TypeKind::Char), ArrayLen::Fixed(s.len() as u64 + 1)),
                s.len() + 1,
                1,
            );
            unsafe { std::ptr::copy_nonoverlapping(s.as_ptr(), data.buf.as_ptr(), s.len()) };
            write_addr(data.buf.as_ptr() as usize);
            keep.push(Keep::Data(data));
            Ok(())
        }
        HostValue::Cdata(cd) => {
            let src_ty = cd.ty().clone();
            match &src_ty.kind {
                TypeKind::Pointer(_) | TypeKind::Reference(_) => {
                    if !src_ty.is_convertible_to(target) {
                        return Err(FfiError::conversion(
                            src_ty.to_string(),
                            target.to_string(),
                            "incompatible pointer types",
                        ));
                    }
                    write_addr(cd.address());
                    keep_cdata(cd, keep);
                    Ok(())
                }
                // arrays decay to a pointer to their first element
                TypeKind::Array(elem, _) => {
                    let ok = pointee.is_void()
                        || (elem.is_same_unqualified(pointee)
                            && elem.qual.weaker_or_equal(pointee.qual));
                    if !ok {
                        return Err(FfiError::conversion(
                            src_ty.to_string(),
                            target.to_string(),
                            "incompatible element type",
                        ));
                    }
                    let base = cd.storage_ptr().ok_or_else(|| {
                        FfiError::conversion(src_ty.to_string(), target.to_string(), "no storage")
                    })?;
                    write_addr(base as usize);
                    keep_cdata(cd, keep);
                    Ok(())
                }
                // records pass by address where a pointer is expected
                TypeKind::Record(_) => {
                    let ok = pointee.is_void() || src_ty.is_same_unqualified(pointee);
                    if !ok {
                        return Err(FfiError::conversion(
                            src_ty.to_string(),
                            target.to_string(),
                            "record does not match pointee",
                        ));
                    }
                    let base = cd.storage_ptr().ok_or_else(|| {
                        FfiError::conversion(src_ty.to_string(), target.to_string(), "no storage")
                    })?;
                    write_addr(base as usize);
                    keep_cdata(cd, keep);
                    Ok(())
                }
                _ if pointee.is_void() => {
                    // any addressable value may feed void*
                    let base = cd.storage_ptr().ok_or_else(|| {
                        FfiError::conversion(src_ty.to_string(), target.to_string(), "no storage")
                    })?;
                    write_addr(base as usize);
                    keep_cdata(cd, keep);
                    Ok(())
                }
                _ => Err(FfiError::conversion(
                    src_ty.to_string(),
                    target.to_string(),
                    "cannot pass by address",
                )),
            }
        }
        other => Err(mismatch(other, target)),
    }
}

fn to_native_reference(
    value: &HostValue,
    referee: &Type,
    dst: *mut u8,
    keep: &mut Vec<Keep>,
) -> Result<(), FfiError> {
    let write_addr = |addr: usize| unsafe { (dst as *mut usize).write_unaligned(addr) };
    if let HostValue::Cdata(cd) = value {
        let src_ty = cd.ty().clone();
        if src_ty.is_reference() {
            if !src_ty.is_convertible_to(&Type::reference_to(referee.clone())) {
                return Err(FfiError::conversion(
                    src_ty.to_string(),
                    format!("{referee} &"),
                    "incompatible reference",
                ));
            }
            write_addr(cd.address());
            keep_cdata(cd, keep);
            return Ok(());
        }
        // taking the address must not weaken qualifiers
        if src_ty.is_same_unqualified(referee) && src_ty.qual.weaker_or_equal(referee.qual) {
            let base = cd.storage_ptr().ok_or_else(|| {
                FfiError::conversion(src_ty.to_string(), format!("{referee} &"), "no storage")
            })?;
            write_addr(base as usize);
            keep_cdata(cd, keep);
            return Ok(());
        }
    }
    // materialize a temporary referent from the value
    let size = referee.size()?;
    let align = referee.align()?;
    let temp = DataBox::zeroed(referee.clone(), size, align);
    let mut inner = Vec::new();
    to_native(value, referee, temp.buf.as_ptr(), &mut inner)?;
    temp.keepalive.borrow_mut().extend(inner);
    write_addr(temp.buf.as_ptr() as usize);
    keep.push(Keep::Data(temp));
    Ok(())
}

fn keep_cdata(cd: &Cdata, keep: &mut Vec<Keep>) {
    match cd.repr() {
        Repr::Data(data) => keep.push(Keep::Data(data.clone())),
        Repr::Closure(cl) => keep.push(Keep::Closure(cl.clone())),
        _ => {}
    }
}

fn mismatch(value: &HostValue, target: &Type) -> FfiError {
    FfiError::conversion(
        value.type_name(),
        target.to_string(),
        "no conversion between these types",
    )
}

// ── aggregate initialization ────────────────────────────────────────

/// Apply a positional initializer list to an aggregate (array or record).
/// A record with a flexible tail takes its fixed fields first, then spills
/// the remaining initializers into the tail elements.
pub(crate) fn init_aggregate(
    ty: &Type,
    dst: *mut u8,
    items: &[HostValue],
    keep: &mut Vec<Keep>,
) -> Result<(), FfiError> {
    match &ty.kind {
        TypeKind::Array(elem, len) => {
            if let ArrayLen::Fixed(n) = len {
                if items.len() as u64 > *n {
                    return Err(FfiError::conversion(
                        "table",
                        ty.to_string(),
                        "too many initializers",
                    ));
                }
            }
            let esize = elem.size()?;
            for (i, item) in items.iter().enumerate() {
                let at = unsafe { dst.add(i * esize) };
                match item {
                    HostValue::Aggregate(inner) => init_aggregate(elem, at, inner, keep)?,
                    other => to_native(other, elem, at, keep)?,
                }
            }
            Ok(())
        }
        TypeKind::Record(rec) => {
            let layout = rec.layout().ok_or_else(|| {
                FfiError::Layout(cbridge_ast::LayoutError::Opaque {
                    name: rec.name().clone(),
                })
            })?;
            if rec.is_union() {
                // a union takes at most one initializer, for its first field
                if items.len() > 1 {
                    return Err(FfiError::conversion(
                        "table",
                        ty.to_string(),
                        "a union accepts at most one initializer",
                    ));
                }
                if let (Some(item), Some(field)) = (items.first(), layout.fields.first()) {
                    return init_field(field, dst, item, keep);
                }
                return Ok(());
            }

            let tail = if layout.flexible {
                layout.fields.last()
            } else {
                None
            };
            let fixed = &layout.fields[..layout.fields.len() - tail.is_some() as usize];
            let mut item_iter = items.iter();
            for field in fixed
                .iter()
                .filter(|f| !(f.name.is_empty() && f.bits.is_some()))
            {
                let Some(item) = item_iter.next() else {
                    break;
                };
                init_field(field, dst, item, keep)?;
            }
            let remaining: Vec<HostValue> = item_iter.cloned().collect();
            match tail {
                Some(tail_field) => {
                    let at = unsafe { dst.add(tail_field.offset) };
                    match remaining.as_slice() {
                        [] => Ok(()),
                        [HostValue::Aggregate(inner)] => {
                            init_aggregate(&tail_field.ty, at, inner, keep)
                        }
                        many => init_aggregate(&tail_field.ty, at, many, keep),
                    }
                }
                None if remaining.is_empty() => Ok(()),
                None => Err(FfiError::conversion(
                    "table",
                    ty.to_string(),
                    "too many initializers",
                )),
            }
        }
        _ => Err(FfiError::conversion(
            "table",
            ty.to_string(),
            "only aggregates take initializer tables",
        )),
    }
}

fn init_field(
    field: &cbridge_ast::Field,
    base: *mut u8,
    item: &HostValue,
    keep: &mut Vec<Keep>,
) -> Result<(), FfiError> {
    let at = unsafe { base.add(field.offset) };
    if let Some(bits) = field.bits {
        let new = match item {
            HostValue::Int(v) => *v,
            HostValue::Bool(b) => *b as i64,
            other => {
                return Err(FfiError::conversion(
                    other.type_name(),
                    field.ty.to_string(),
                    "bitfields take integer values",
                ))
            }
        };
        let raw = unsafe { read_int_bits(at, &field.ty)? };
        let mask = if bits.width >= 64 {
            u64::MAX
        } else {
            (1u64 << bits.width) - 1
        };
        let merged =
            (raw & !(mask << bits.bit_offset)) | (((new as u64) & mask) << bits.bit_offset);
        return unsafe { write_int_bits(at, &field.ty, merged) };
    }
    match item {
        HostValue::Aggregate(inner) => init_aggregate(&field.ty, at, inner, keep),
        other => to_native(other, &field.ty, at, keep),
    }
}

// ── construction ────────────────────────────────────────────────────

/// `new`-style construction: allocate zeroed storage for `ty` (consuming a
/// leading element count for VLA / flexible types) and apply initializers.
pub(crate) fn construct(ty: &Type, args: &[HostValue]) -> Result<Cdata, FfiError> {
    let needs_count = match &ty.kind {
        TypeKind::Array(_, ArrayLen::Variable | ArrayLen::Flexible) => true,
        TypeKind::Record(rec) => rec.layout().is_some_and(|l| l.flexible),
        _ => false,
    };
    let (count, inits) = if needs_count {
        match args.split_first() {
            Some((HostValue::Int(n), rest)) if *n >= 0 => (Some(*n as usize), rest),
            _ => {
                return Err(FfiError::conversion(
                    "arguments",
                    ty.to_string(),
                    "variable-size construction takes a leading element count",
                ))
            }
        }
    } else {
        (None, args)
    };

    let size = match count {
        Some(n) => ty.size_with_count(n)?,
        None => ty.size()?,
    };
    let align = ty.align()?;

    // concretize a VLA dimension into the runtime type
    let runtime_ty = match (&ty.kind, count) {
        (TypeKind::Array(elem, ArrayLen::Variable | ArrayLen::Flexible), Some(n)) => {
            Type::array_of((**elem).clone(), ArrayLen::Fixed(n as u64))
        }
        _ => ty.clone(),
    };

    // bound the initializer spill into a flexible tail by the allocated
    // element count
    if let (TypeKind::Record(rec), Some(n)) = (&ty.kind, count) {
        if let Some(layout) = rec.layout() {
            if layout.flexible {
                let fixed = layout.fields[..layout.fields.len() - 1]
                    .iter()
                    .filter(|f| !(f.name.is_empty() && f.bits.is_some()))
                    .count();
                let items: &[HostValue] = match inits {
                    [HostValue::Aggregate(items)] => items,
                    many => many,
                };
                let tail_items = match items.get(fixed..) {
                    Some([HostValue::Aggregate(inner)]) => inner.len(),
                    Some(rest) => rest.len(),
                    None => 0,
                };
                if tail_items > n {
                    return Err(FfiError::conversion(
                        "table",
                        ty.to_string(),
                        "more tail initializers than allocated elements",
                    ));
                }
            }
        }
    }

    let cd = Cdata::new_data(runtime_ty.clone(), size, align);
    let dst = cd.storage_ptr().expect("fresh data has storage");
    let mut keep = Vec::new();

    match inits {
        [] => {}
        [HostValue::Aggregate(items)] => init_aggregate(&runtime_ty, dst, items, &mut keep)?,
        // a single string fills a byte array directly
        [single @ HostValue::Str(_)] if runtime_ty.is_array() => {
            to_native(single, &runtime_ty, dst, &mut keep)?
        }
        [single] if !runtime_ty.is_array() && !runtime_ty.is_record() => {
            to_native(single, &runtime_ty, dst, &mut keep)?
        }
        many => init_aggregate(&runtime_ty, dst, many, &mut keep)?,
    }

    cd.data_box()
        .expect("fresh data has storage")
        .keepalive
        .borrow_mut()
        .extend(keep);
    Ok(cd)
}

/// Explicit cast: looser than assignment conversion. Integers and pointers
/// reinterpret freely; pointee types are not checked.
pub(crate) fn cast_value(target: &Type, value: &HostValue) -> Result<Cdata, FfiError> {
    let size = target.size()?;
    let align = target.align()?;
    let cd = Cdata::new_data(target.clone(), size, align);
    let dst = cd.storage_ptr().expect("fresh data has storage");
    let mut keep = Vec::new();

    let done = match (value, &target.kind) {
        (HostValue::Int(v), _) if target.is_pointer() => {
            unsafe { (dst as *mut usize).write_unaligned(*v as usize) };
            true
        }
        (HostValue::Int(v), _) if target.is_integer() => {
            // casts wrap instead of range-checking
            unsafe { write_int_bits(dst, target, *v as u64)? };
            true
        }
        (HostValue::Cdata(src), _) if target.is_pointer() || target.is_integer() => {
            let src_ty = src.ty().clone();
            let bits: u64 = if src_ty.is_pointer()
                || src_ty.is_reference()
                || src_ty.is_function()
                || src_ty.is_array()
            {
                src.address() as u64
            } else if src_ty.is_integer() {
                let p = src.storage_ptr().ok_or_else(|| {
                    FfiError::conversion(src_ty.to_string(), target.to_string(), "no storage")
                })?;
                unsafe { read_int_value(p, &src_ty)?.0 as u64 }
            } else if src_ty.is_float() {
                let p = src.storage_ptr().ok_or_else(|| {
                    FfiError::conversion(src_ty.to_string(), target.to_string(), "no storage")
                })?;
                unsafe { read_float_value(p, &src_ty)? as i64 as u64 }
            } else {
                return Err(FfiError::conversion(
                    src_ty.to_string(),
                    target.to_string(),
                    "cannot cast this value",
                ));
            };
            if target.is_pointer() {
                unsafe { (dst as *mut usize).write_unaligned(bits as usize) };
            } else {
                unsafe { write_int_bits(dst, target, bits)? };
            }
            keep_cdata(src, &mut keep);
            true
        }
        _ => false,
    };

    if !done {
        // fall back to the checked conversion
        to_native(value, target, dst, &mut keep)?;
    }

    cd.data_box()
        .expect("fresh data has storage")
        .keepalive
        .borrow_mut()
        .extend(keep);
    Ok(cd)
}

// ── native → dynamic ────────────────────────────────────────────────

/// Convert native bytes at `src` into a host value. `origin` is the
/// storage the bytes live in, kept alive by boxed views produced here.
///
/// # Safety
/// `src` must be valid for reads of `ty`'s size.
pub(crate) unsafe fn from_native(
    src: *const u8,
    ty: &Type,
    ctx: ValueCtx,
    origin: Option<&Rc<DataBox>>,
) -> Result<HostValue, FfiError> {
    use TypeKind::*;
    match &ty.kind {
        Void => Ok(HostValue::Null),
        Bool => Ok(HostValue::Bool(src.read() != 0)),
        Float | Double => Ok(HostValue::Float(read_float_value(src, ty)?)),
        Enum(_) => Ok(HostValue::Int((src as *const i32).read_unaligned() as i64)),
        LongDouble => {
            // no host representation; box the bits
            Ok(HostValue::Cdata(box_copy(src, ty)?))
        }
        _ if ty.is_integer() => {
            let (bits, unsigned) = read_int_value(src, ty)?;
            if unsigned && bits < 0 {
                // above i64::MAX: box instead of truncating
                return Ok(HostValue::Cdata(box_copy(src, ty)?));
            }
            Ok(HostValue::Int(bits))
        }
        Pointer(_) | Reference(_) => {
            let cd = box_copy(src, ty)?;
            keep_origin(&cd, origin);
            Ok(HostValue::Cdata(cd))
        }
        FunctionPointer(sig) => {
            let addr = (src as *const usize).read_unaligned();
            if addr == 0 {
                return Ok(HostValue::Cdata(box_copy(src, ty)?));
            }
            let func = crate::call::NativeFunc::new(Rc::new((**sig).clone()), addr as *mut _);
            Ok(HostValue::Cdata(Cdata::from_parts(
                ty.clone(),
                Repr::Func(Rc::new(func)),
            )))
        }
        Record(_) => match ctx {
            // observing in place: box a pointer sharing the address
            ValueCtx::Deref => {
                let cd = Cdata::pointer_from_addr(
                    Type::pointer_to(ty.clone()),
                    src as usize,
                );
                keep_origin(&cd, origin);
                Ok(HostValue::Cdata(cd))
            }
            ValueCtx::NewValue => Ok(HostValue::Cdata(box_copy(src, ty)?)),
        },
        Array(elem, _) => match ctx {
            // arrays viewed in place decay to a pointer to their storage
            ValueCtx::Deref => {
                let cd = Cdata::pointer_from_addr(
                    Type::pointer_to((**elem).clone()),
                    src as usize,
                );
                keep_origin(&cd, origin);
                Ok(HostValue::Cdata(cd))
            }
            ValueCtx::NewValue => Ok(HostValue::Cdata(box_copy(src, ty)?)),
        },
        _ => Err(FfiError::Unsupported(format!(
            "cannot read values of type `{ty}`"
        ))),
    }
}

unsafe fn box_copy(src: *const u8, ty: &Type) -> Result<Cdata, FfiError> {
    let size = ty.size()?;
    let align = ty.align()?;
    let cd = Cdata::new_data(ty.clone(), size, align);
    std::ptr::copy_nonoverlapping(src, cd.storage_ptr().expect("fresh data"), size);
    Ok(cd)
}

fn keep_origin(cd: &Cdata, origin: Option<&Rc<DataBox>>) {
    if let (Some(data), Some(origin)) = (cd.data_box(), origin) {
        data.keepalive.borrow_mut().push(Keep::Data(origin.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip_int(ty: Type, value: i64) {
        let cd = construct(&ty, &[HostValue::Int(value)]).unwrap();
        let got = unsafe {
            from_native(cd.storage_ptr().unwrap(), &ty, ValueCtx::NewValue, None).unwrap()
        };
        match got {
            HostValue::Int(v) => assert_eq!(v, value, "{ty}"),
            other => panic!("expected int back for {ty}, got {other:?}"),
        }
    }

    #[test]
    fn scalar_boundary_round_trips() {
        roundtrip_int(Type::new(TypeKind::I8), i8::MIN as i64);
        roundtrip_int(Type::new(TypeKind::I8), i8::MAX as i64);
        roundtrip_int(Type::new(TypeKind::U8), u8::MAX as i64);
        roundtrip_int(Type::new(TypeKind::I16), i16::MIN as i64);
        roundtrip_int(Type::new(TypeKind::U16), u16::MAX as i64);
        roundtrip_int(Type::new(TypeKind::I32), i32::MIN as i64);
        roundtrip_int(Type::new(TypeKind::U32), u32::MAX as i64);
        roundtrip_int(Type::new(TypeKind::I64), i64::MIN);
        roundtrip_int(Type::new(TypeKind::I64), i64::MAX);
    }

    #[test]
    fn negative_zero_survives() {
        let ty = Type::new(TypeKind::Double);
        let cd = construct(&ty, &[HostValue::Float(-0.0)]).unwrap();
        let got = unsafe {
            from_native(cd.storage_ptr().unwrap(), &ty, ValueCtx::NewValue, None).unwrap()
        };
        let HostValue::Float(v) = got else { panic!() };
        assert_eq!(v.to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn uint64_above_i64_boxes() {
        let ty = Type::new(TypeKind::U64);
        let cd = Cdata::new_data(ty.clone(), 8, 8);
        unsafe { (cd.storage_ptr().unwrap() as *mut u64).write(u64::MAX) };
        let got = unsafe {
            from_native(cd.storage_ptr().unwrap(), &ty, ValueCtx::NewValue, None).unwrap()
        };
        let HostValue::Cdata(boxed) = got else {
            panic!("expected a boxed wrapper, got {got:?}");
        };
        let raw = unsafe { (boxed.storage_ptr().unwrap() as *const u64).read() };
        assert_eq!(raw, u64::MAX);
    }

    #[test]
    fn out_of_range_conversion_errors() {
        let ty = Type::new(TypeKind::I8);
        let err = construct(&ty, &[HostValue::Int(300)]);
        assert!(matches!(err, Err(FfiError::Conversion { .. })));
        let ty = Type::new(TypeKind::U32);
        let err = construct(&ty, &[HostValue::Int(-1)]);
        assert!(matches!(err, Err(FfiError::Conversion { .. })));
    }

    #[test]
    fn string_initializes_char_array() {
        let ty = Type::array_of(Type::new(TypeKind::Char), ArrayLen::Fixed(8));
        let cd = construct(&ty, &[HostValue::str_from("hi")]).unwrap();
        let bytes =
            unsafe { std::slice::from_raw_parts(cd.storage_ptr().unwrap(), 8) };
        assert_eq!(&bytes[..3], b"hi\0");
    }

    #[test]
    fn vla_takes_leading_count() {
        let ty = Type::array_of(Type::int(), ArrayLen::Variable);
        let cd = construct(
            &ty,
            &[
                HostValue::Int(3),
                HostValue::Int(7),
                HostValue::Int(8),
                HostValue::Int(9),
            ],
        )
        .unwrap();
        assert!(matches!(cd.ty().kind, TypeKind::Array(_, ArrayLen::Fixed(3))));
        assert_eq!(cd.get(&HostValue::Int(2)).unwrap().as_int(), Some(9));
        assert!(cd.get(&HostValue::Int(3)).is_err());
    }

    #[test]
    fn aggregate_initializers_recurse() {
        let inner = Type::array_of(Type::int(), ArrayLen::Fixed(2));
        let outer = Type::array_of(inner, ArrayLen::Fixed(2));
        let cd = construct(
            &outer,
            &[HostValue::aggregate(vec![
                HostValue::aggregate(vec![HostValue::Int(1), HostValue::Int(2)]),
                HostValue::aggregate(vec![HostValue::Int(3), HostValue::Int(4)]),
            ])],
        )
        .unwrap();
        let row = cd.get(&HostValue::Int(1)).unwrap();
        let HostValue::Cdata(row) = row else { panic!() };
        // rows decay to int pointers when observed
        assert_eq!(row.get(&HostValue::Int(0)).unwrap().as_int(), Some(3));
    }

    #[test]
    fn cast_reinterprets() {
        let cd = cast_value(&Type::new(TypeKind::U8), &HostValue::Int(-1)).unwrap();
        let raw = unsafe { cd.storage_ptr().unwrap().read() };
        assert_eq!(raw, 0xFF);

        let p = cast_value(&Type::pointer_to(Type::void()), &HostValue::Int(0x1000)).unwrap();
        assert_eq!(p.address(), 0x1000);
    }
}
