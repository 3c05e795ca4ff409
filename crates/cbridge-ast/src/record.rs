//! Struct/union and enum declarations.
//!
//! A `Record` is created opaque (forward declaration) and completed at most
//! once with `set_fields`, which computes the native layout: sequential
//! alignment-respecting placement for structs, offset 0 for unions, shared
//! storage units for consecutive bitfields, and a trailing flexible array
//! member contributing no size of its own.

use crate::layout::{align_up, layout_of, LayoutError};
use crate::types::{ArrayLen, Type, TypeKind};
use smol_str::SmolStr;
use std::cell::OnceCell;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{0}")]
    Layout(#[from] LayoutError),

    #[error("struct `{name}` is already defined")]
    AlreadyDefined { name: SmolStr },

    #[error("field `{field}` has unsized type")]
    UnsizedField { field: SmolStr },

    #[error("flexible array member must be the last field")]
    FlexibleNotLast,

    #[error("bitfield `{field}` exceeds the width of its type")]
    BitfieldTooWide { field: SmolStr },

    #[error("bitfield `{field}` must have integer type")]
    BitfieldNotInteger { field: SmolStr },
}

/// Bit position of a bitfield within its storage unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub bit_offset: u32,
    pub width: u32,
}

/// A laid-out record field. An empty name on a record-typed field marks a
/// transparent anonymous member whose children resolve through the parent.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: SmolStr,
    pub ty: Type,
    pub offset: usize,
    pub bits: Option<BitField>,
}

/// Completed record layout.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub fields: Vec<Field>,
    pub size: usize,
    pub align: usize,
    pub flexible: bool,
}

/// Field description handed to [`Record::set_fields`].
pub struct FieldDef {
    pub name: SmolStr,
    pub ty: Type,
    pub bit_width: Option<u32>,
}

/// Result of a (possibly transparent) field lookup.
#[derive(Debug, Clone)]
pub struct ResolvedField {
    pub ty: Type,
    pub offset: usize,
    pub bits: Option<BitField>,
}

/// A struct or union declaration. Shared by every `Type` referring to it.
#[derive(Debug)]
pub struct Record {
    name: SmolStr,
    is_union: bool,
    layout: OnceCell<RecordLayout>,
}

impl Record {
    pub fn new(name: SmolStr, is_union: bool) -> Record {
        Record {
            name,
            is_union,
            layout: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn is_union(&self) -> bool {
        self.is_union
    }

    pub fn is_complete(&self) -> bool {
        self.layout.get().is_some()
    }

    pub fn layout(&self) -> Option<&RecordLayout> {
        self.layout.get()
    }

    /// Complete the record. Legal exactly once; the only mutation a record
    /// supports after creation.
    pub fn set_fields(&self, defs: Vec<FieldDef>) -> Result<(), RecordError> {
        if self.is_complete() {
            return Err(RecordError::AlreadyDefined {
                name: self.name.clone(),
            });
        }
        let layout = if self.is_union {
            compute_union(defs)?
        } else {
            compute_struct(defs)?
        };
        // cannot race: completion is single-threaded by contract
        let _ = self.layout.set(layout);
        Ok(())
    }

    /// Look up a field by name, falling through transparent anonymous
    /// members; the returned offset is accumulated from the parent.
    pub fn find_field(&self, name: &str) -> Option<ResolvedField> {
        let layout = self.layout.get()?;
        for field in &layout.fields {
            if field.name == name {
                return Some(ResolvedField {
                    ty: field.ty.clone(),
                    offset: field.offset,
                    bits: field.bits,
                });
            }
            if field.name.is_empty() {
                if let TypeKind::Record(inner) = &field.ty.kind {
                    if let Some(found) = inner.find_field(name) {
                        return Some(ResolvedField {
                            ty: found.ty,
                            offset: field.offset + found.offset,
                            bits: found.bits,
                        });
                    }
                }
            }
        }
        None
    }

    /// Structural layout comparison for cross-declaration sameness: equal
    /// size and alignment with pairwise same-typed fields in order.
    pub fn same_layout(&self, other: &Record) -> bool {
        match (self.layout.get(), other.layout.get()) {
            (Some(a), Some(b)) => {
                a.size == b.size
                    && a.align == b.align
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .zip(&b.fields)
                        .all(|(x, y)| x.offset == y.offset && x.ty.is_same(&y.ty))
            }
            _ => false,
        }
    }
}

fn bit_width_of(ty: &Type) -> Result<u32, LayoutError> {
    Ok(8 * layout_of(ty)?.0 as u32)
}

fn compute_struct(defs: Vec<FieldDef>) -> Result<RecordLayout, RecordError> {
    let mut fields = Vec::with_capacity(defs.len());
    let mut cursor: usize = 0; // byte offset past the last allocated field
    let mut align: usize = 1;
    let mut flexible = false;

    // open bitfield storage unit: (byte offset, unit bits, next free bit)
    let mut open_unit: Option<(usize, u32, u32)> = None;

    let count = defs.len();
    for (idx, def) in defs.into_iter().enumerate() {
        if flexible {
            return Err(RecordError::FlexibleNotLast);
        }

        if let Some(width) = def.bit_width {
            if !def.ty.is_integer() {
                return Err(RecordError::BitfieldNotInteger { field: def.name });
            }
            let unit_bits = bit_width_of(&def.ty)?;
            if width > unit_bits {
                return Err(RecordError::BitfieldTooWide { field: def.name });
            }
            let (unit_size, ualign) = layout_of(&def.ty)?;
            align = align.max(ualign);

            if width == 0 {
                // zero-width closes the current unit
                open_unit = None;
                continue;
            }

            let (unit_off, bit_off) = match open_unit {
                Some((off, bits, used)) if bits == unit_bits && used + width <= bits => {
                    open_unit = Some((off, bits, used + width));
                    (off, used)
                }
                _ => {
                    let off = align_up(cursor, ualign);
                    cursor = off + unit_size;
                    open_unit = Some((off, unit_bits, width));
                    (off, 0)
                }
            };
            // unnamed bitfields only pad
            if !def.name.is_empty() {
                fields.push(Field {
                    name: def.name,
                    ty: def.ty,
                    offset: unit_off,
                    bits: Some(BitField {
                        bit_offset: bit_off,
                        width,
                    }),
                });
            }
            continue;
        }

        open_unit = None;

        if let TypeKind::Array(_, ArrayLen::Flexible) = def.ty.kind {
            if idx + 1 != count {
                return Err(RecordError::FlexibleNotLast);
            }
            let ealign = def
                .ty
                .element()
                .map(layout_of)
                .transpose()?
                .map_or(1, |(_, a)| a);
            align = align.max(ealign);
            let offset = align_up(cursor, ealign);
            fields.push(Field {
                name: def.name,
                ty: def.ty,
                offset,
                bits: None,
            });
            flexible = true;
            continue;
        }

        let (fsize, falign) = layout_of(&def.ty).map_err(|_| RecordError::UnsizedField {
            field: def.name.clone(),
        })?;
        align = align.max(falign);
        let offset = align_up(cursor, falign);
        cursor = offset + fsize;
        fields.push(Field {
            name: def.name,
            ty: def.ty,
            offset,
            bits: None,
        });
    }

    Ok(RecordLayout {
        fields,
        size: align_up(cursor, align),
        align,
        flexible,
    })
}

fn compute_union(defs: Vec<FieldDef>) -> Result<RecordLayout, RecordError> {
    let mut fields = Vec::with_capacity(defs.len());
    let mut size: usize = 0;
    let mut align: usize = 1;

    for def in defs {
        if def.ty.is_array() && !matches!(def.ty.kind, TypeKind::Array(_, ArrayLen::Fixed(_))) {
            return Err(RecordError::UnsizedField { field: def.name });
        }
        let (fsize, falign) = layout_of(&def.ty).map_err(|_| RecordError::UnsizedField {
            field: def.name.clone(),
        })?;
        size = size.max(fsize);
        align = align.max(falign);
        let bits = match def.bit_width {
            Some(width) => {
                if !def.ty.is_integer() {
                    return Err(RecordError::BitfieldNotInteger { field: def.name });
                }
                Some(BitField {
                    bit_offset: 0,
                    width,
                })
            }
            None => None,
        };
        fields.push(Field {
            name: def.name,
            ty: def.ty,
            offset: 0,
            bits,
        });
    }

    Ok(RecordLayout {
        fields,
        size: align_up(size, align),
        align,
        flexible: false,
    })
}

/// One enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMember {
    pub name: SmolStr,
    pub value: i64,
}

/// An enum declaration; opaque until `set_members` runs (once).
#[derive(Debug)]
pub struct EnumDecl {
    name: SmolStr,
    members: OnceCell<Vec<EnumMember>>,
}

impl EnumDecl {
    pub fn new(name: SmolStr) -> EnumDecl {
        EnumDecl {
            name,
            members: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn is_complete(&self) -> bool {
        self.members.get().is_some()
    }

    pub fn members(&self) -> Option<&[EnumMember]> {
        self.members.get().map(|m| m.as_slice())
    }

    pub fn set_members(&self, members: Vec<EnumMember>) -> Result<(), RecordError> {
        if self.is_complete() {
            return Err(RecordError::AlreadyDefined {
                name: self.name.clone(),
            });
        }
        let _ = self.members.set(members);
        Ok(())
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.members
            .get()?
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value)
    }
}
