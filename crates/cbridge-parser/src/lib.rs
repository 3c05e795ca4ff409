//! C declaration parser for cbridge.
//!
//! Recursive descent over the token stream, producing types and staged
//! declarations in an explicitly passed [`DeclStore`]. A parse either fully
//! succeeds (every declaration committed atomically) or fully fails with a
//! [`ParseError`] and no visible store change, with the single documented
//! exception that completing a previously-opaque struct or enum mutates the
//! shared declaration in place.
//!
//! Parameterized parsing consumes `$` markers left to right as a name, an
//! integer constant, or a pre-parsed type, depending on the position the
//! marker appears in.

mod declarator;
mod expr;

pub use expr::ConstValue;

use cbridge_ast::{
    DeclStore, Declaration, EnumDecl, EnumMember, FieldDef, Qualifiers, Record, RecordError,
    StagedStore, StoreError, Type, TypeKind,
};
use cbridge_lexer::{Kw, LexError, Lexer, Token, TokenKind};
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::rc::Rc;
use thiserror::Error;

/// A positional substitution argument for a `$` marker.
#[derive(Debug, Clone)]
pub enum ParseArg {
    Name(SmolStr),
    Int(i64),
    Type(Type),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("line {line}: syntax error near `{token}`: {message}")]
    Syntax {
        line: u32,
        token: SmolStr,
        message: String,
    },

    #[error(transparent)]
    Redefinition(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Parse a `;`-separated blob of declarations into `store`.
///
/// All declarations commit atomically on success; any error leaves the
/// store unchanged.
pub fn parse_decls(
    store: &mut DeclStore,
    input: &str,
    args: Vec<ParseArg>,
) -> Result<(), ParseError> {
    let mut parser = Parser::new(store, input, args);
    parser.run_decls()?;
    parser.commit();
    Ok(())
}

/// Parse a single (possibly abstract) type, committing any record or enum
/// the type text itself declares.
pub fn parse_type(
    store: &mut DeclStore,
    input: &str,
    args: Vec<ParseArg>,
) -> Result<Type, ParseError> {
    let mut parser = Parser::new(store, input, args);
    let base = parser.parse_base_type()?;
    let (_, ty) = parser.parse_declarator(base, false)?;
    let tok = parser.peek_tok()?;
    if tok.kind != TokenKind::Eof {
        return Err(parser.syntax_err(&tok, "trailing input after type"));
    }
    parser.commit();
    Ok(ty)
}

pub(crate) struct Parser<'s, 'i> {
    lexer: Lexer<'i>,
    pub(crate) store: StagedStore<'s>,
    args: VecDeque<ParseArg>,
}

impl<'s, 'i> Parser<'s, 'i> {
    pub(crate) fn new(store: &'s mut DeclStore, input: &'i str, args: Vec<ParseArg>) -> Self {
        Parser {
            lexer: Lexer::new(input),
            store: store.stage(),
            args: args.into(),
        }
    }

    fn commit(self) {
        self.store.commit();
    }

    // ── token plumbing ──────────────────────────────────────────────

    pub(crate) fn next_tok(&mut self) -> Result<Token, ParseError> {
        Ok(self.lexer.next()?)
    }

    pub(crate) fn peek_tok(&mut self) -> Result<Token, ParseError> {
        Ok(self.lexer.peek()?.clone())
    }

    pub(crate) fn eat(&mut self, kind: &TokenKind) -> Result<bool, ParseError> {
        if self.lexer.peek()?.kind == *kind {
            self.lexer.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        let tok = self.next_tok()?;
        if tok.kind == kind {
            Ok(tok)
        } else {
            Err(self.syntax_err(&tok, format!("expected {what}")))
        }
    }

    pub(crate) fn syntax_err(&self, tok: &Token, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            line: tok.line,
            token: tok.kind.describe(),
            message: message.into(),
        }
    }

    pub(crate) fn syntax_err_here(&mut self, message: impl Into<String>) -> ParseError {
        match self.peek_tok() {
            Ok(tok) => self.syntax_err(&tok, message),
            Err(err) => err,
        }
    }

    pub(crate) fn take_arg(&mut self, at: &Token) -> Result<ParseArg, ParseError> {
        self.args
            .pop_front()
            .ok_or_else(|| self.syntax_err(at, "not enough substitution arguments for `$`"))
    }

    // ── declaration specifiers ──────────────────────────────────────

    /// Does the next token begin a type?
    pub(crate) fn starts_type(&mut self) -> Result<bool, ParseError> {
        let tok = self.lexer.peek()?;
        Ok(match &tok.kind {
            TokenKind::Kw(kw) => matches!(
                kw,
                Kw::Void
                    | Kw::Bool
                    | Kw::Char
                    | Kw::Short
                    | Kw::Int
                    | Kw::Long
                    | Kw::Float
                    | Kw::Double
                    | Kw::Signed
                    | Kw::Unsigned
                    | Kw::Struct
                    | Kw::Union
                    | Kw::Enum
                    | Kw::Const
                    | Kw::Volatile
                    | Kw::Restrict
                    | Kw::Extension
                    | Kw::Int8
                    | Kw::Int16
                    | Kw::Int32
                    | Kw::Int64
                    | Kw::Uint8
                    | Kw::Uint16
                    | Kw::Uint32
                    | Kw::Uint64
                    | Kw::SizeT
                    | Kw::SsizeT
                    | Kw::IntptrT
                    | Kw::UintptrT
                    | Kw::PtrdiffT
                    | Kw::WcharT
                    | Kw::Char16T
                    | Kw::Char32T
                    | Kw::VaList
            ),
            TokenKind::Ident(name) => {
                matches!(self.store.lookup(name), Some(Declaration::Typedef(_)))
            }
            TokenKind::Dollar => matches!(self.args.front(), Some(ParseArg::Type(_))),
            _ => false,
        })
    }

    /// Parse declaration specifiers into a base type: qualifiers, sign and
    /// width modifiers, a scalar/typedef/record/enum base.
    pub(crate) fn parse_base_type(&mut self) -> Result<Type, ParseError> {
        let mut qual = Qualifiers::NONE;
        let mut unsigned: Option<bool> = None;
        let mut short = false;
        let mut longs = 0u8;
        let mut base: Option<TypeKind> = None;
        let mut resolved: Option<Type> = None;

        loop {
            let tok = self.peek_tok()?;
            match &tok.kind {
                TokenKind::Kw(Kw::Const) => {
                    self.next_tok()?;
                    qual.insert(Qualifiers::CONST);
                }
                TokenKind::Kw(Kw::Volatile) => {
                    self.next_tok()?;
                    qual.insert(Qualifiers::VOLATILE);
                }
                TokenKind::Kw(Kw::Restrict) | TokenKind::Kw(Kw::Extension) => {
                    self.next_tok()?;
                }
                TokenKind::Kw(Kw::Signed) => {
                    self.next_tok()?;
                    if unsigned == Some(true) {
                        return Err(self.syntax_err(&tok, "both `signed` and `unsigned`"));
                    }
                    unsigned = Some(false);
                }
                TokenKind::Kw(Kw::Unsigned) => {
                    self.next_tok()?;
                    if unsigned == Some(false) {
                        return Err(self.syntax_err(&tok, "both `signed` and `unsigned`"));
                    }
                    unsigned = Some(true);
                }
                TokenKind::Kw(Kw::Short) => {
                    self.next_tok()?;
                    short = true;
                }
                TokenKind::Kw(Kw::Long) => {
                    self.next_tok()?;
                    longs += 1;
                    if longs > 2 {
                        return Err(self.syntax_err(&tok, "too many `long` specifiers"));
                    }
                }
                TokenKind::Kw(kw) if resolved.is_none() && base.is_none() => {
                    let simple = simple_base(*kw);
                    match simple {
                        Some(kind) => {
                            self.next_tok()?;
                            base = Some(kind);
                        }
                        None => match kw {
                            Kw::Struct => {
                                self.next_tok()?;
                                resolved = Some(self.parse_record(false)?);
                            }
                            Kw::Union => {
                                self.next_tok()?;
                                resolved = Some(self.parse_record(true)?);
                            }
                            Kw::Enum => {
                                self.next_tok()?;
                                resolved = Some(self.parse_enum()?);
                            }
                            _ => break,
                        },
                    }
                }
                TokenKind::Ident(name)
                    if resolved.is_none()
                        && base.is_none()
                        && unsigned.is_none()
                        && !short
                        && longs == 0 =>
                {
                    match self.store.lookup(name) {
                        Some(Declaration::Typedef(ty)) => {
                            let ty = ty.clone();
                            self.next_tok()?;
                            resolved = Some(ty);
                        }
                        _ => break,
                    }
                }
                TokenKind::Dollar
                    if resolved.is_none()
                        && base.is_none()
                        && matches!(self.args.front(), Some(ParseArg::Type(_))) =>
                {
                    self.next_tok()?;
                    match self.take_arg(&tok)? {
                        ParseArg::Type(ty) => resolved = Some(ty),
                        _ => unreachable!("front argument checked above"),
                    }
                }
                _ => break,
            }
        }

        if let Some(mut ty) = resolved {
            if unsigned.is_some() || short || longs > 0 {
                return Err(
                    self.syntax_err_here("sign/width modifiers cannot apply to this type")
                );
            }
            ty.qual.insert(qual);
            return Ok(ty);
        }

        let kind = self.combine_scalar(base, unsigned, short, longs)?;
        Ok(Type::qualified(kind, qual))
    }

    /// Fold sign/short/long modifiers and the base keyword into one scalar
    /// kind.
    fn combine_scalar(
        &mut self,
        base: Option<TypeKind>,
        unsigned: Option<bool>,
        short: bool,
        longs: u8,
    ) -> Result<TypeKind, ParseError> {
        use TypeKind::*;
        let is_unsigned = unsigned == Some(true);
        let no_base = base.is_none();
        let kind = match base {
            Some(Char) => {
                if short || longs > 0 {
                    return Err(self.syntax_err_here("invalid width modifier for `char`"));
                }
                match unsigned {
                    None => Char,
                    Some(true) => UChar,
                    Some(false) => SChar,
                }
            }
            Some(Double) => {
                if short || longs > 1 || unsigned.is_some() {
                    return Err(self.syntax_err_here("invalid modifiers for `double`"));
                }
                if longs == 1 {
                    LongDouble
                } else {
                    Double
                }
            }
            Some(Float) => {
                if short || longs > 0 || unsigned.is_some() {
                    return Err(self.syntax_err_here("invalid modifiers for `float`"));
                }
                Float
            }
            Some(Int) | None => {
                if no_base && unsigned.is_none() && !short && longs == 0 {
                    return Err(self.syntax_err_here("expected a type"));
                }
                if short && longs > 0 {
                    return Err(self.syntax_err_here("both `short` and `long`"));
                }
                if short {
                    if is_unsigned {
                        UShort
                    } else {
                        Short
                    }
                } else if longs == 1 {
                    if is_unsigned {
                        ULong
                    } else {
                        Long
                    }
                } else if longs == 2 {
                    if is_unsigned {
                        ULongLong
                    } else {
                        LongLong
                    }
                } else if is_unsigned {
                    UInt
                } else {
                    Int
                }
            }
            Some(other) => {
                if unsigned.is_some() || short || longs > 0 {
                    return Err(
                        self.syntax_err_here("sign/width modifiers cannot apply to this type")
                    );
                }
                other
            }
        };
        Ok(kind)
    }

    // ── struct / union ──────────────────────────────────────────────

    /// Optional tag (identifier or `$` name argument).
    fn parse_tag(&mut self) -> Result<Option<SmolStr>, ParseError> {
        let tok = self.peek_tok()?;
        match &tok.kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.next_tok()?;
                Ok(Some(name))
            }
            TokenKind::Dollar => {
                self.next_tok()?;
                match self.take_arg(&tok)? {
                    ParseArg::Name(name) => Ok(Some(name)),
                    _ => Err(self.syntax_err(&tok, "expected a name substitution argument")),
                }
            }
            _ => Ok(None),
        }
    }

    /// `struct`/`union` keyword already consumed.
    fn parse_record(&mut self, is_union: bool) -> Result<Type, ParseError> {
        let keyword = if is_union { "union" } else { "struct" };
        let tag = self.parse_tag()?;
        let key = tag
            .as_ref()
            .map(|t| SmolStr::new(format!("{keyword} {t}")));

        let existing = key.as_deref().and_then(|k| match self.store.lookup(k) {
            Some(Declaration::Record(rc)) => Some(rc.clone()),
            _ => None,
        });
        if let Some(rc) = &existing {
            if rc.is_union() != is_union {
                return Err(self.syntax_err_here(format!(
                    "`{}` redeclared as a different record kind",
                    tag.as_deref().unwrap_or_default()
                )));
            }
        }

        if self.eat(&TokenKind::LBrace)? {
            let rc = match existing {
                Some(rc) => {
                    if rc.is_complete() {
                        return Err(StoreError::Redefinition {
                            name: key.expect("complete record always has a tag"),
                        }
                        .into());
                    }
                    rc
                }
                None => {
                    let rc = Rc::new(Record::new(
                        tag.clone().unwrap_or_default(),
                        is_union,
                    ));
                    if let Some(key) = key {
                        self.store.define(key, Declaration::Record(rc.clone()))?;
                    }
                    rc
                }
            };
            let defs = self.parse_record_fields()?;
            rc.set_fields(defs)?;
            Ok(Type::new(TypeKind::Record(rc)))
        } else {
            // reference or forward declaration
            let Some(key) = key else {
                return Err(self.syntax_err_here(format!("expected `{{` or tag after `{keyword}`")));
            };
            let rc = match existing {
                Some(rc) => rc,
                None => {
                    let rc = Rc::new(Record::new(tag.unwrap_or_default(), is_union));
                    self.store.define(key, Declaration::Record(rc.clone()))?;
                    rc
                }
            };
            Ok(Type::new(TypeKind::Record(rc)))
        }
    }

    /// Member lines up to the closing `}`.
    fn parse_record_fields(&mut self) -> Result<Vec<FieldDef>, ParseError> {
        let mut defs = Vec::new();
        loop {
            if self.eat(&TokenKind::RBrace)? {
                return Ok(defs);
            }
            let tok = self.peek_tok()?;
            if tok.kind == TokenKind::Eof {
                return Err(self.syntax_err(&tok, "unterminated record body"));
            }
            let base = self.parse_base_type()?;

            // `struct {...};` with no declarator: transparent anonymous member
            if self.eat(&TokenKind::Semi)? {
                if base.is_record() {
                    defs.push(FieldDef {
                        name: SmolStr::default(),
                        ty: base,
                        bit_width: None,
                    });
                }
                // a bare enum specifier only contributes its constants
                continue;
            }

            loop {
                let def = if self.eat(&TokenKind::Colon)? {
                    // unnamed bitfield, padding only
                    let width = self.bitfield_width()?;
                    FieldDef {
                        name: SmolStr::default(),
                        ty: base.clone(),
                        bit_width: Some(width),
                    }
                } else {
                    let (name, ty) = self.parse_declarator(base.clone(), false)?;
                    let Some(name) = name else {
                        return Err(self.syntax_err_here("expected a field name"));
                    };
                    let width = if self.eat(&TokenKind::Colon)? {
                        Some(self.bitfield_width()?)
                    } else {
                        None
                    };
                    FieldDef {
                        name,
                        ty,
                        bit_width: width,
                    }
                };
                defs.push(def);
                if self.eat(&TokenKind::Comma)? {
                    continue;
                }
                self.expect(TokenKind::Semi, "`;` after field")?;
                break;
            }
        }
    }

    fn bitfield_width(&mut self) -> Result<u32, ParseError> {
        let tok = self.peek_tok()?;
        let value = self.const_expr()?;
        match value.as_dimension() {
            Some(width) if width <= 64 => Ok(width as u32),
            _ => Err(self.syntax_err(&tok, "invalid bitfield width")),
        }
    }

    // ── enum ────────────────────────────────────────────────────────

    /// `enum` keyword already consumed.
    fn parse_enum(&mut self) -> Result<Type, ParseError> {
        let tag = self.parse_tag()?;
        let key = tag.as_ref().map(|t| SmolStr::new(format!("enum {t}")));

        let existing = key.as_deref().and_then(|k| match self.store.lookup(k) {
            Some(Declaration::Enum(rc)) => Some(rc.clone()),
            _ => None,
        });

        if self.eat(&TokenKind::LBrace)? {
            let rc = match existing {
                Some(rc) => {
                    if rc.is_complete() {
                        return Err(StoreError::Redefinition {
                            name: key.expect("complete enum always has a tag"),
                        }
                        .into());
                    }
                    rc
                }
                None => {
                    let rc = Rc::new(EnumDecl::new(tag.clone().unwrap_or_default()));
                    if let Some(key) = key {
                        self.store.define(key, Declaration::Enum(rc.clone()))?;
                    }
                    rc
                }
            };

            let mut members = Vec::new();
            let mut next = 0i64;
            loop {
                if self.eat(&TokenKind::RBrace)? {
                    break;
                }
                let name = match self.parse_tag()? {
                    Some(name) => name,
                    None => return Err(self.syntax_err_here("expected an enumerator name")),
                };
                let value = if self.eat(&TokenKind::Assign)? {
                    self.const_expr()?.as_i64()
                } else {
                    next
                };
                next = value.wrapping_add(1);
                // each enumerator doubles as an integer constant
                self.store
                    .define(name.clone(), Declaration::Constant(value))?;
                members.push(EnumMember { name, value });
                if self.eat(&TokenKind::Comma)? {
                    continue;
                }
                self.expect(TokenKind::RBrace, "`}` after enumerators")?;
                break;
            }
            rc.set_members(members)?;
            Ok(Type::new(TypeKind::Enum(rc)))
        } else {
            let Some(key) = key else {
                return Err(self.syntax_err_here("expected `{` or tag after `enum`"));
            };
            let rc = match existing {
                Some(rc) => rc,
                None => {
                    let rc = Rc::new(EnumDecl::new(tag.unwrap_or_default()));
                    self.store.define(key, Declaration::Enum(rc.clone()))?;
                    rc
                }
            };
            Ok(Type::new(TypeKind::Enum(rc)))
        }
    }

    // ── top level ───────────────────────────────────────────────────

    fn run_decls(&mut self) -> Result<(), ParseError> {
        loop {
            if self.peek_tok()?.kind == TokenKind::Eof {
                return Ok(());
            }
            if self.eat(&TokenKind::Semi)? {
                continue;
            }
            self.parse_declaration()?;
        }
    }

    fn parse_declaration(&mut self) -> Result<(), ParseError> {
        let mut is_typedef = false;
        loop {
            match self.peek_tok()?.kind {
                TokenKind::Kw(Kw::Typedef) => {
                    self.next_tok()?;
                    is_typedef = true;
                }
                TokenKind::Kw(
                    Kw::Extern | Kw::Static | Kw::Inline | Kw::Register | Kw::Extension,
                ) => {
                    self.next_tok()?;
                }
                _ => break,
            }
        }

        let base = self.parse_base_type()?;

        // bare `struct foo {...};` / `enum {...};` declaration
        if self.eat(&TokenKind::Semi)? {
            return Ok(());
        }

        loop {
            let (name, ty) = self.parse_declarator(base.clone(), true)?;
            let name = name.expect("declarator name was required");
            let decl = if is_typedef {
                Declaration::Typedef(ty)
            } else if let TypeKind::Function(sig) = &ty.kind {
                Declaration::Function(Rc::new((**sig).clone()))
            } else {
                Declaration::Variable(ty)
            };
            self.store.define(name, decl)?;
            if self.eat(&TokenKind::Comma)? {
                continue;
            }
            self.expect(TokenKind::Semi, "`;` after declaration")?;
            return Ok(());
        }
    }
}

fn simple_base(kw: Kw) -> Option<TypeKind> {
    use TypeKind::*;
    Some(match kw {
        Kw::Void => Void,
        Kw::Bool => Bool,
        Kw::Char => Char,
        Kw::Int => Int,
        Kw::Float => Float,
        Kw::Double => Double,
        Kw::Int8 => I8,
        Kw::Int16 => I16,
        Kw::Int32 => I32,
        Kw::Int64 => I64,
        Kw::Uint8 => U8,
        Kw::Uint16 => U16,
        Kw::Uint32 => U32,
        Kw::Uint64 => U64,
        Kw::SizeT => Size,
        Kw::SsizeT => SSize,
        Kw::IntptrT => IntPtr,
        Kw::UintptrT => UIntPtr,
        Kw::PtrdiffT => PtrDiff,
        Kw::WcharT => WChar,
        Kw::Char16T => Char16,
        Kw::Char32T => Char32,
        Kw::VaList => VaList,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbridge_ast::ArrayLen;
    use pretty_assertions::assert_eq;

    fn ty(input: &str) -> Type {
        let mut store = DeclStore::new();
        parse_type(&mut store, input, Vec::new()).expect("parse type")
    }

    #[test]
    fn scalars() {
        assert_eq!(ty("int").to_string(), "int");
        assert_eq!(ty("unsigned").to_string(), "unsigned int");
        assert_eq!(ty("unsigned long long int").to_string(), "unsigned long long");
        assert_eq!(ty("signed char").to_string(), "signed char");
        assert_eq!(ty("long double").to_string(), "long double");
        assert_eq!(ty("const volatile int").to_string(), "const volatile int");
        assert_eq!(ty("uint32_t").to_string(), "uint32_t");
    }

    #[test]
    fn pointers_and_arrays() {
        assert_eq!(ty("int *").to_string(), "int *");
        assert_eq!(ty("int **").to_string(), "int **");
        assert_eq!(ty("int *const *").to_string(), "int *const *");
        assert_eq!(ty("int [3]").to_string(), "int [3]");
        assert_eq!(ty("int [2][3]").to_string(), "int [2][3]");
        assert_eq!(ty("int (*)[3]").to_string(), "int (*)[3]");
        assert_eq!(ty("int *[3]").to_string(), "int *[3]");
    }

    #[test]
    fn array_dim_expressions() {
        let t = ty("int [2 + 3 * 2]");
        match &t.kind {
            TypeKind::Array(_, ArrayLen::Fixed(8)) => {}
            other => panic!("wrong dims: {other:?}"),
        }
    }

    #[test]
    fn vla_and_flexible_markers() {
        assert!(matches!(
            ty("int [?]").kind,
            TypeKind::Array(_, ArrayLen::Variable)
        ));
        assert!(matches!(
            ty("int []").kind,
            TypeKind::Array(_, ArrayLen::Flexible)
        ));
        // inner dimensions must be fixed
        let mut store = DeclStore::new();
        assert!(parse_type(&mut store, "int [2][?]", Vec::new()).is_err());
    }

    #[test]
    fn function_pointers() {
        let t = ty("int (*)(float, char *)");
        let TypeKind::FunctionPointer(sig) = &t.kind else {
            panic!("not a function pointer: {t}");
        };
        assert_eq!(sig.params.len(), 2);
        assert!(!sig.variadic);
        assert_eq!(t.to_string(), "int (*)(float, char *)");
    }

    #[test]
    fn void_parameter_list_is_empty() {
        let t = ty("int (*)(void)");
        let TypeKind::FunctionPointer(sig) = &t.kind else {
            panic!();
        };
        assert!(sig.params.is_empty());
        assert!(!sig.variadic);
    }

    #[test]
    fn variadic_parameter_list() {
        let t = ty("int (*)(char const *, ...)");
        let TypeKind::FunctionPointer(sig) = &t.kind else {
            panic!();
        };
        assert_eq!(sig.params.len(), 1);
        assert!(sig.variadic);
    }

    #[test]
    fn typedef_then_use() {
        let mut store = DeclStore::new();
        parse_decls(&mut store, "typedef unsigned int uint; typedef uint *puint;", Vec::new())
            .unwrap();
        let t = parse_type(&mut store, "puint", Vec::new()).unwrap();
        assert_eq!(t.to_string(), "unsigned int *");
    }

    #[test]
    fn function_declaration() {
        let mut store = DeclStore::new();
        parse_decls(&mut store, "int puts(const char *s);", Vec::new()).unwrap();
        let Some(Declaration::Function(sig)) = store.lookup("puts") else {
            panic!("puts not declared as a function");
        };
        assert_eq!(sig.params.len(), 1);
        assert_eq!(sig.result.to_string(), "int");
    }

    #[test]
    fn struct_definition_and_reference() {
        let mut store = DeclStore::new();
        parse_decls(
            &mut store,
            "struct point { int x; int y; }; struct point origin;",
            Vec::new(),
        )
        .unwrap();
        let Some(Declaration::Record(rec)) = store.lookup("struct point") else {
            panic!("struct point not declared");
        };
        assert!(rec.is_complete());
        assert!(rec.find_field("y").is_some());
        let Some(Declaration::Variable(v)) = store.lookup("origin") else {
            panic!("origin not declared");
        };
        assert_eq!(v.to_string(), "struct point");
    }

    #[test]
    fn opaque_struct_completed_later() {
        let mut store = DeclStore::new();
        parse_decls(&mut store, "struct node; typedef struct node node_t;", Vec::new()).unwrap();
        let Some(Declaration::Record(rec)) = store.lookup("struct node") else {
            panic!();
        };
        assert!(!rec.is_complete());
        parse_decls(
            &mut store,
            "struct node { struct node *next; int v; };",
            Vec::new(),
        )
        .unwrap();
        let Some(Declaration::Record(rec)) = store.lookup("struct node") else {
            panic!();
        };
        assert!(rec.is_complete());
    }

    #[test]
    fn completing_twice_is_redefinition() {
        let mut store = DeclStore::new();
        parse_decls(&mut store, "struct s { int a; };", Vec::new()).unwrap();
        let err = parse_decls(&mut store, "struct s { int b; };", Vec::new());
        assert!(matches!(err, Err(ParseError::Redefinition(_))));
    }

    #[test]
    fn enum_values_and_constants() {
        let mut store = DeclStore::new();
        parse_decls(
            &mut store,
            "enum color { RED, GREEN = 5, BLUE, };",
            Vec::new(),
        )
        .unwrap();
        let Some(Declaration::Enum(e)) = store.lookup("enum color") else {
            panic!();
        };
        assert_eq!(e.value_of("RED"), Some(0));
        assert_eq!(e.value_of("GREEN"), Some(5));
        assert_eq!(e.value_of("BLUE"), Some(6));
        // enumerators register as constants
        assert!(matches!(store.lookup("BLUE"), Some(Declaration::Constant(6))));
        // and are usable in later constant expressions
        let t = parse_type(&mut store, "int [BLUE]", Vec::new()).unwrap();
        assert!(matches!(t.kind, TypeKind::Array(_, ArrayLen::Fixed(6))));
    }

    #[test]
    fn anonymous_member_promotion() {
        let mut store = DeclStore::new();
        parse_decls(
            &mut store,
            "struct outer { int tag; union { int i; float f; }; };",
            Vec::new(),
        )
        .unwrap();
        let Some(Declaration::Record(rec)) = store.lookup("struct outer") else {
            panic!();
        };
        assert!(rec.find_field("i").is_some());
        assert!(rec.find_field("f").is_some());
        assert_eq!(
            rec.find_field("i").unwrap().offset,
            rec.find_field("f").unwrap().offset
        );
    }

    #[test]
    fn bitfield_members() {
        let mut store = DeclStore::new();
        parse_decls(
            &mut store,
            "struct flags { unsigned a : 3; unsigned b : 4; unsigned : 0; unsigned c : 1; };",
            Vec::new(),
        )
        .unwrap();
        let Some(Declaration::Record(rec)) = store.lookup("struct flags") else {
            panic!();
        };
        let a = rec.find_field("a").unwrap();
        let b = rec.find_field("b").unwrap();
        let c = rec.find_field("c").unwrap();
        assert_eq!(a.offset, b.offset);
        assert_ne!(a.offset, c.offset);
    }

    #[test]
    fn calling_convention_propagates_outward() {
        let mut store = DeclStore::new();
        parse_decls(&mut store, "int (__stdcall *cb)(int);", Vec::new()).unwrap();
        let Some(Declaration::Variable(v)) = store.lookup("cb") else {
            panic!();
        };
        let TypeKind::FunctionPointer(sig) = &v.kind else {
            panic!("cb is not a function pointer");
        };
        assert_eq!(sig.convention, cbridge_ast::CallConv::Std);
    }

    #[test]
    fn gnu_attribute_convention() {
        let mut store = DeclStore::new();
        parse_decls(
            &mut store,
            "int f(int) __attribute__((stdcall));",
            Vec::new(),
        )
        .unwrap();
        let Some(Declaration::Function(sig)) = store.lookup("f") else {
            panic!();
        };
        assert_eq!(sig.convention, cbridge_ast::CallConv::Std);
    }

    #[test]
    fn convention_on_non_function_is_an_error() {
        let mut store = DeclStore::new();
        let err = parse_decls(&mut store, "int __stdcall x;", Vec::new());
        assert!(matches!(err, Err(ParseError::Syntax { .. })));
    }

    #[test]
    fn references_are_trailing_only() {
        assert_eq!(ty("int &").to_string(), "int &");
        let mut store = DeclStore::new();
        assert!(parse_type(&mut store, "int &*", Vec::new()).is_err());
        assert!(parse_type(&mut store, "int &&", Vec::new()).is_err());
    }

    #[test]
    fn function_cannot_return_array() {
        let mut store = DeclStore::new();
        let err = parse_decls(&mut store, "int f(int)[3];", Vec::new());
        assert!(err.is_err());
    }

    #[test]
    fn unbounded_array_parameter_rejected() {
        let mut store = DeclStore::new();
        let err = parse_decls(&mut store, "void f(int x[?]);", Vec::new());
        assert!(err.is_err());
    }

    #[test]
    fn substitution_arguments() {
        let mut store = DeclStore::new();
        parse_decls(
            &mut store,
            "typedef int $; struct $ { $ v[$]; };",
            vec![
                ParseArg::Name(SmolStr::new("myint")),
                ParseArg::Name(SmolStr::new("box")),
                ParseArg::Type(Type::int()),
                ParseArg::Int(4),
            ],
        )
        .unwrap();
        let Some(Declaration::Record(rec)) = store.lookup("struct box") else {
            panic!();
        };
        let v = rec.find_field("v").unwrap();
        assert!(matches!(v.ty.kind, TypeKind::Array(_, ArrayLen::Fixed(4))));
    }

    #[test]
    fn failed_parse_commits_nothing() {
        let mut store = DeclStore::new();
        let err = parse_decls(&mut store, "int a; bad!syntax; int b;", Vec::new());
        assert!(err.is_err());
        assert!(store.lookup("a").is_none());
        assert!(store.lookup("b").is_none());
    }

    #[test]
    fn redefining_typedef_fails_and_leaves_store() {
        let mut store = DeclStore::new();
        parse_decls(&mut store, "typedef int x;", Vec::new()).unwrap();
        let before = store.len();
        let err = parse_decls(&mut store, "typedef int x;", Vec::new());
        assert!(matches!(err, Err(ParseError::Redefinition(_))));
        assert_eq!(store.len(), before);
    }

    #[test]
    fn multiple_declarators_share_base() {
        let mut store = DeclStore::new();
        parse_decls(&mut store, "int a, *b, c[2];", Vec::new()).unwrap();
        assert_eq!(
            store.lookup("a").map(|d| d.describe("a")),
            Some("int a".to_string())
        );
        assert_eq!(
            store.lookup("b").map(|d| d.describe("b")),
            Some("int *b".to_string())
        );
        assert_eq!(
            store.lookup("c").map(|d| d.describe("c")),
            Some("int c[2]".to_string())
        );
    }
}
