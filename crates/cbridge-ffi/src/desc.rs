//! Lowering from the semantic [`Type`] model to libffi type descriptors.
//!
//! Scalars map by width and signedness; pointers, references, decayed
//! arrays and function pointers all become the platform pointer type.
//! Records become libffi structures assembled from their layout: fixed
//! arrays flatten into repeated elements, overlapping members (unions,
//! bitfield storage units) collapse to the most strictly aligned member at
//! each offset, and gaps pad out bytewise so libffi's computed size and
//! alignment agree with the type model's.

use crate::error::FfiError;
use cbridge_ast::{ArrayLen, Type, TypeKind};
use libffi::middle::Type as FfiType;

/// libffi descriptor for a type used as an argument or return value.
pub(crate) fn ffi_type_of(ty: &Type) -> Result<FfiType, FfiError> {
    use TypeKind::*;
    Ok(match &ty.kind {
        Void => FfiType::void(),
        Bool => FfiType::u8(),
        Float => FfiType::f32(),
        Double => FfiType::f64(),
        LongDouble => FfiType::longdouble(),
        Pointer(_) | Reference(_) | FunctionPointer(_) | VaList => FfiType::pointer(),
        // arrays decay to pointers in argument position
        Array(..) => FfiType::pointer(),
        Enum(_) => FfiType::i32(),
        Record(rec) => {
            let layout = rec.layout().ok_or_else(|| {
                FfiError::Layout(cbridge_ast::LayoutError::Opaque {
                    name: rec.name().clone(),
                })
            })?;
            let mut elements = Vec::new();
            let mut cursor = 0usize;
            let fields = &layout.fields;
            let mut idx = 0;
            while idx < fields.len() {
                let offset = fields[idx].offset;
                if offset < cursor {
                    idx += 1;
                    continue;
                }
                // among members at this offset, the most strictly aligned
                // (then largest) one represents the storage
                let mut best: Option<(usize, usize, usize)> = None; // (index, size, align)
                while idx < fields.len() && fields[idx].offset == offset {
                    if let (Ok(size), Ok(align)) =
                        (fields[idx].ty.size(), fields[idx].ty.align())
                    {
                        let better = match best {
                            None => true,
                            Some((_, bsize, balign)) => {
                                align > balign || (align == balign && size > bsize)
                            }
                        };
                        if better {
                            best = Some((idx, size, align));
                        }
                    }
                    idx += 1;
                }
                // unsized members (the flexible tail) contribute nothing
                let Some((field_idx, fsize, _)) = best else {
                    continue;
                };
                while cursor < offset {
                    elements.push(FfiType::u8());
                    cursor += 1;
                }
                push_elements(&fields[field_idx].ty, &mut elements)?;
                cursor = offset + fsize;
            }
            while cursor < layout.size {
                elements.push(FfiType::u8());
                cursor += 1;
            }
            FfiType::structure(elements)
        }
        Function(_) => {
            return Err(FfiError::Unsupported(
                "bare function type has no value representation".into(),
            ))
        }
        _ => {
            let size = ty.size()?;
            match (size, ty.is_signed_integer()) {
                (1, true) => FfiType::i8(),
                (1, false) => FfiType::u8(),
                (2, true) => FfiType::i16(),
                (2, false) => FfiType::u16(),
                (4, true) => FfiType::i32(),
                (4, false) => FfiType::u32(),
                (8, true) => FfiType::i64(),
                (8, false) => FfiType::u64(),
                _ => {
                    return Err(FfiError::Unsupported(format!(
                        "no libffi descriptor for `{ty}`"
                    )))
                }
            }
        }
    })
}

/// Push the in-place representation of a record member: fixed arrays
/// flatten to repeated element descriptors, everything else is itself.
fn push_elements(ty: &Type, out: &mut Vec<FfiType>) -> Result<(), FfiError> {
    if let TypeKind::Array(elem, ArrayLen::Fixed(n)) = &ty.kind {
        for _ in 0..*n {
            push_elements(elem, out)?;
        }
        return Ok(());
    }
    out.push(ffi_type_of(ty)?);
    Ok(())
}
