//! Marshaling-stage error taxonomy.
//!
//! Every error here is raised synchronously at the point of failure and
//! propagates to the embedding host unchanged; nothing in this crate
//! catches or retries.

use cbridge_ast::LayoutError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FfiError {
    /// A value cannot be represented as the requested native type (or the
    /// reverse direction).
    #[error("cannot convert {from} to {to}: {detail}")]
    Conversion {
        from: String,
        to: String,
        detail: String,
    },

    /// A feature the engine deliberately does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No declaration under that name.
    #[error("missing declaration `{name}`")]
    MissingDeclaration { name: String },

    /// The declaration exists but the native symbol does not.
    #[error("missing native symbol `{name}`: {detail}")]
    MissingSymbol { name: String, detail: String },

    #[error("failed to load library `{path}`: {detail}")]
    LibraryOpen { path: String, detail: String },

    #[error("value of type `{ty}` is not callable")]
    NotCallable { ty: String },

    #[error("wrong argument count: expected {expected} (variadic: {variadic}), got {got}")]
    Arity {
        expected: usize,
        variadic: bool,
        got: usize,
    },

    #[error("index {index} out of bounds for `{ty}`")]
    IndexOutOfBounds { ty: String, index: i64 },

    #[error("`{ty}` has no field `{field}`")]
    NoSuchField { ty: String, field: String },

    #[error("cannot index a value of type `{ty}`")]
    NotIndexable { ty: String },

    #[error("a metatype is already set for `{ty}`")]
    MetatypeAlreadySet { ty: String },

    #[error("invalid arithmetic on `{lhs}` and `{rhs}`")]
    Arithmetic { lhs: String, rhs: String },

    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// An error raised by a host callback while native code was running.
    #[error("host callback failed: {0}")]
    Callback(String),
}

impl FfiError {
    pub(crate) fn conversion(
        from: impl Into<String>,
        to: impl Into<String>,
        detail: impl Into<String>,
    ) -> FfiError {
        FfiError::Conversion {
            from: from.into(),
            to: to.into(),
            detail: detail.into(),
        }
    }
}
