//! Semantic C type model for cbridge.
//!
//! A parsed declaration becomes a [`Type`] graph: scalar kinds carry their
//! platform-native layout, pointer/function components own their nested
//! descriptors (`Box`), and struct/enum components share the registered
//! declaration (`Rc`, living as long as the declaration store). The store
//! itself supports staged parsing with atomic commit so that a failed
//! multi-declaration parse leaves nothing behind.

mod layout;
mod record;
mod store;
mod types;

pub use layout::{align_up, LayoutError};
pub use record::{
    BitField, EnumDecl, EnumMember, Field, FieldDef, Record, RecordError, RecordLayout,
    ResolvedField,
};
pub use store::{DeclStore, Declaration, StagedStore, StoreError};
pub use types::{ArrayLen, CallConv, FuncSig, Param, Qualifiers, Type, TypeKind};
