//! The declaration store: name → declared entity, with a staging layer so a
//! multi-declaration parse commits atomically or not at all.

use crate::record::{EnumDecl, Record};
use crate::types::{FuncSig, Type};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("attempt to redefine `{name}`")]
    Redefinition { name: SmolStr },
}

/// A declared entity. Records and enums are shared with every `Type` that
/// refers to them.
#[derive(Debug, Clone)]
pub enum Declaration {
    Typedef(Type),
    Function(Rc<FuncSig>),
    Variable(Type),
    Record(Rc<Record>),
    Enum(Rc<EnumDecl>),
    /// Integer constant (enumerators, substituted parameters).
    Constant(i64),
}

impl Declaration {
    /// C-like rendering for diagnostics.
    pub fn describe(&self, name: &str) -> String {
        match self {
            Declaration::Typedef(ty) => format!("typedef {}", ty.display_named(name)),
            Declaration::Function(sig) => {
                let ty = Type::new(crate::types::TypeKind::Function(Box::new((**sig).clone())));
                ty.display_named(name)
            }
            Declaration::Variable(ty) => ty.display_named(name),
            Declaration::Record(rec) => {
                let kw = if rec.is_union() { "union" } else { "struct" };
                format!("{kw} {}", rec.name())
            }
            Declaration::Enum(e) => format!("enum {}", e.name()),
            Declaration::Constant(v) => format!("static const int {name} = {v}"),
        }
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(""))
    }
}

/// The committed store.
#[derive(Debug, Default)]
pub struct DeclStore {
    entries: IndexMap<SmolStr, Declaration>,
}

impl DeclStore {
    pub fn new() -> DeclStore {
        DeclStore::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Declaration> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Declaration)> {
        self.entries.iter()
    }

    /// Insert directly into the committed store. Prefer staged parsing via
    /// [`stage`](DeclStore::stage) for anything user-driven.
    pub fn define(&mut self, name: SmolStr, decl: Declaration) -> Result<(), StoreError> {
        if self.entries.contains_key(&name) {
            return Err(StoreError::Redefinition { name });
        }
        self.entries.insert(name, decl);
        Ok(())
    }

    /// Open a staging layer over this store.
    pub fn stage(&mut self) -> StagedStore<'_> {
        StagedStore {
            base: self,
            staged: IndexMap::new(),
        }
    }
}

/// A staging layer: lookups fall back to the base store, definitions land in
/// the layer. `commit` merges everything into the base; dropping the layer
/// discards it.
pub struct StagedStore<'a> {
    base: &'a mut DeclStore,
    staged: IndexMap<SmolStr, Declaration>,
}

impl StagedStore<'_> {
    pub fn lookup(&self, name: &str) -> Option<&Declaration> {
        self.staged.get(name).or_else(|| self.base.lookup(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.staged.contains_key(name) || self.base.contains(name)
    }

    /// Stage a definition. Redefinition of any visible name is an error;
    /// completing a previously-opaque record or enum goes through the shared
    /// declaration itself, never through a second `define`.
    pub fn define(&mut self, name: SmolStr, decl: Declaration) -> Result<(), StoreError> {
        if self.contains(&name) {
            return Err(StoreError::Redefinition { name });
        }
        self.staged.insert(name, decl);
        Ok(())
    }

    /// Number of staged (not yet committed) declarations.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Merge every staged declaration into the base store.
    ///
    /// The base was checked at `define` time and cannot have gained entries
    /// since (single-writer contract), so the merge cannot fail.
    pub fn commit(self) {
        for (name, decl) in self.staged {
            self.base.entries.insert(name, decl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn define_and_lookup() {
        let mut store = DeclStore::new();
        store
            .define(SmolStr::new("myint"), Declaration::Typedef(Type::int()))
            .unwrap();
        assert!(matches!(
            store.lookup("myint"),
            Some(Declaration::Typedef(_))
        ));
        assert!(store.lookup("other").is_none());
    }

    #[test]
    fn redefinition_is_an_error() {
        let mut store = DeclStore::new();
        store
            .define(SmolStr::new("x"), Declaration::Constant(1))
            .unwrap();
        let err = store.define(SmolStr::new("x"), Declaration::Constant(2));
        assert_eq!(
            err,
            Err(StoreError::Redefinition {
                name: SmolStr::new("x")
            })
        );
        // original untouched
        assert!(matches!(store.lookup("x"), Some(Declaration::Constant(1))));
    }

    #[test]
    fn staged_lookup_falls_back() {
        let mut store = DeclStore::new();
        store
            .define(SmolStr::new("base"), Declaration::Constant(1))
            .unwrap();
        let mut staged = store.stage();
        staged
            .define(SmolStr::new("new"), Declaration::Constant(2))
            .unwrap();
        assert!(staged.lookup("base").is_some());
        assert!(staged.lookup("new").is_some());
    }

    #[test]
    fn staged_cannot_shadow_base() {
        let mut store = DeclStore::new();
        store
            .define(SmolStr::new("x"), Declaration::Constant(1))
            .unwrap();
        let mut staged = store.stage();
        let err = staged.define(SmolStr::new("x"), Declaration::Constant(2));
        assert!(err.is_err());
    }

    #[test]
    fn drop_discards_commit_merges() {
        let mut store = DeclStore::new();
        {
            let mut staged = store.stage();
            staged
                .define(SmolStr::new("gone"), Declaration::Constant(1))
                .unwrap();
            // dropped without commit
        }
        assert!(store.lookup("gone").is_none());

        let mut staged = store.stage();
        staged
            .define(SmolStr::new("kept"), Declaration::Constant(1))
            .unwrap();
        staged.commit();
        assert!(store.lookup("kept").is_some());
    }

    #[test]
    fn describe_renders_c_like_text() {
        let decl = Declaration::Typedef(Type::pointer_to(Type::int()));
        assert_eq!(decl.describe("ip"), "typedef int *ip");
    }
}
