//! Native size and alignment computation.
//!
//! Scalar widths come from the platform C ABI via `libc` / `std::os::raw`
//! aliases, so `long`, `size_t`, `wchar_t` and the pointer-width family
//! resolve exactly as the host compiler would.

use crate::record::Record;
use crate::types::{ArrayLen, Type, TypeKind};
use smol_str::SmolStr;
use std::mem;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("type `{ty}` has no compile-time size")]
    Unsized { ty: String },

    #[error("struct `{name}` is opaque")]
    Opaque { name: SmolStr },

    #[error("enum `{name}` is opaque")]
    OpaqueEnum { name: SmolStr },

    #[error("array length overflows native size")]
    Oversized,
}

pub fn align_up(off: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (off + align - 1) & !(align - 1)
}

// Rust has no native long double; libffi handles the register convention,
// the in-memory footprint is per-target.
#[cfg(all(target_arch = "x86_64", not(windows)))]
const LONG_DOUBLE: (usize, usize) = (16, 16);
#[cfg(all(target_arch = "x86", not(windows)))]
const LONG_DOUBLE: (usize, usize) = (12, 4);
#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
const LONG_DOUBLE: (usize, usize) = (16, 16);
#[cfg(not(any(
    all(target_arch = "x86_64", not(windows)),
    all(target_arch = "x86", not(windows)),
    all(target_arch = "aarch64", target_os = "linux")
)))]
const LONG_DOUBLE: (usize, usize) = (mem::size_of::<f64>(), mem::align_of::<f64>());

fn scalar_layout(kind: &TypeKind) -> Option<(usize, usize)> {
    use TypeKind::*;
    Some(match kind {
        Bool => (1, 1),
        Char | SChar | UChar | I8 | U8 => (1, 1),
        Short | UShort => (
            mem::size_of::<libc::c_short>(),
            mem::align_of::<libc::c_short>(),
        ),
        Int | UInt => (mem::size_of::<libc::c_int>(), mem::align_of::<libc::c_int>()),
        Long | ULong => (
            mem::size_of::<libc::c_long>(),
            mem::align_of::<libc::c_long>(),
        ),
        LongLong | ULongLong => (
            mem::size_of::<libc::c_longlong>(),
            mem::align_of::<libc::c_longlong>(),
        ),
        I16 | U16 => (2, 2),
        I32 | U32 => (4, 4),
        I64 | U64 => (mem::size_of::<i64>(), mem::align_of::<i64>()),
        Size | SSize => (
            mem::size_of::<libc::size_t>(),
            mem::align_of::<libc::size_t>(),
        ),
        IntPtr | UIntPtr => (
            mem::size_of::<libc::intptr_t>(),
            mem::align_of::<libc::intptr_t>(),
        ),
        PtrDiff => (
            mem::size_of::<libc::ptrdiff_t>(),
            mem::align_of::<libc::ptrdiff_t>(),
        ),
        Float => (mem::size_of::<f32>(), mem::align_of::<f32>()),
        Double => (mem::size_of::<f64>(), mem::align_of::<f64>()),
        LongDouble => LONG_DOUBLE,
        WChar => (
            mem::size_of::<libc::wchar_t>(),
            mem::align_of::<libc::wchar_t>(),
        ),
        Char16 => (2, 2),
        Char32 => (4, 4),
        _ => return None,
    })
}

const PTR: (usize, usize) = (
    mem::size_of::<*const ()>(),
    mem::align_of::<*const ()>(),
);

pub(crate) fn size_of(ty: &Type) -> Result<usize, LayoutError> {
    layout_of(ty).map(|(size, _)| size)
}

pub(crate) fn align_of(ty: &Type) -> Result<usize, LayoutError> {
    layout_of(ty).map(|(_, align)| align)
}

fn record_layout(rec: &Record) -> Result<(usize, usize), LayoutError> {
    let layout = rec.layout().ok_or_else(|| LayoutError::Opaque {
        name: rec.name().clone(),
    })?;
    Ok((layout.size, layout.align))
}

pub(crate) fn layout_of(ty: &Type) -> Result<(usize, usize), LayoutError> {
    use TypeKind::*;
    match &ty.kind {
        Pointer(_) | FunctionPointer(_) | VaList => Ok(PTR),
        Reference(inner) => layout_of(inner),
        Array(elem, len) => {
            let (esize, ealign) = layout_of(elem)?;
            match len {
                ArrayLen::Fixed(n) => {
                    let total = esize
                        .checked_mul(*n as usize)
                        .ok_or(LayoutError::Oversized)?;
                    Ok((total, ealign))
                }
                ArrayLen::Variable | ArrayLen::Flexible => Err(LayoutError::Unsized {
                    ty: ty.to_string(),
                }),
            }
        }
        Record(rec) => record_layout(rec),
        Enum(e) => {
            if !e.is_complete() {
                return Err(LayoutError::OpaqueEnum {
                    name: e.name().clone(),
                });
            }
            Ok((mem::size_of::<libc::c_int>(), mem::align_of::<libc::c_int>()))
        }
        Void | Function(_) => Err(LayoutError::Unsized {
            ty: ty.to_string(),
        }),
        kind => scalar_layout(kind).ok_or_else(|| LayoutError::Unsized {
            ty: ty.to_string(),
        }),
    }
}

/// Size of a type whose outermost dimension (or flexible record tail) takes
/// a construction-time element count.
pub(crate) fn size_with_count(ty: &Type, count: usize) -> Result<usize, LayoutError> {
    use TypeKind::*;
    match &ty.kind {
        Array(elem, ArrayLen::Variable) | Array(elem, ArrayLen::Flexible) => {
            let (esize, _) = layout_of(elem)?;
            esize.checked_mul(count).ok_or(LayoutError::Oversized)
        }
        Record(rec) => {
            let layout = rec.layout().ok_or_else(|| LayoutError::Opaque {
                name: rec.name().clone(),
            })?;
            if !layout.flexible {
                return Ok(layout.size);
            }
            let tail = layout
                .fields
                .last()
                .and_then(|f| f.ty.element().cloned())
                .ok_or_else(|| LayoutError::Unsized {
                    ty: ty.to_string(),
                })?;
            let (esize, _) = layout_of(&tail)?;
            let tail_bytes = esize.checked_mul(count).ok_or(LayoutError::Oversized)?;
            let total = layout
                .size
                .checked_add(tail_bytes)
                .ok_or(LayoutError::Oversized)?;
            Ok(align_up(total, layout.align))
        }
        _ => size_of(ty),
    }
}
