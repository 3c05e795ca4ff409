//! Declarator parsing.
//!
//! C binds `*` to whatever lies left of it inside the innermost open
//! parenthesis, while trailing `(...)` and `[...]` bind to parenthesis
//! levels counted from the right. The parser models this with an explicit
//! level stack, one entry per parenthesis nesting plus the implicit outer
//! level, filled in three passes over one declarator:
//!
//! 1. inward: collect pointer runs, reference markers and calling
//!    conventions per level, pushing a level at each nested `(`, and pull
//!    out the declared name at the innermost point;
//! 2. unwinding right-to-left: attach the parameter list or array
//!    dimensions that follow each level's closing parenthesis (the name
//!    position counts as the innermost close);
//! 3. left-to-right build: wrap the base type in pointers/references first,
//!    then in the level's function or array construct, outermost level
//!    first.
//!
//! The stack lives in the [`Parser`] call frame, so nested parses (function
//! parameters) simply recurse.

use crate::{ParseArg, ParseError, Parser};
use cbridge_ast::{ArrayLen, CallConv, FuncSig, Param, Qualifiers, Type, TypeKind};
use cbridge_lexer::{Kw, TokenKind};
use smol_str::SmolStr;

enum Suffix {
    Params { params: Vec<Param>, variadic: bool },
    Dims(Vec<ArrayLen>),
}

#[derive(Default)]
struct Level {
    pointers: Vec<Qualifiers>,
    reference: bool,
    convention: Option<CallConv>,
    suffix: Option<Suffix>,
}

impl Parser<'_, '_> {
    /// Parse one (possibly abstract) declarator around `base`, returning
    /// the declared name, if any, and the complete type.
    pub(crate) fn parse_declarator(
        &mut self,
        base: Type,
        name_required: bool,
    ) -> Result<(Option<SmolStr>, Type), ParseError> {
        let mut levels: Vec<Level> = vec![Level::default()];
        let mut name: Option<SmolStr> = None;
        let mut conv_written = false;
        // set when the inward pass consumed a `(` that turned out to open a
        // parameter list rather than a nested declarator
        let mut params_open = false;

        // pass 1: inward
        loop {
            let tok = self.peek_tok()?;
            let level = levels.last_mut().expect("level stack is never empty");
            match &tok.kind {
                TokenKind::Star => {
                    self.next_tok()?;
                    if level.reference {
                        return Err(self.syntax_err(&tok, "pointer to reference is not allowed"));
                    }
                    let qual = self.qualifier_run()?;
                    level.pointers.push(qual);
                }
                TokenKind::Amp => {
                    self.next_tok()?;
                    if level.reference {
                        return Err(self.syntax_err(&tok, "reference to reference is not allowed"));
                    }
                    level.reference = true;
                }
                TokenKind::Kw(kw @ (Kw::Cdecl | Kw::Stdcall | Kw::Fastcall)) => {
                    let kw = *kw;
                    self.next_tok()?;
                    level.convention = Some(convention_of(kw));
                    conv_written = true;
                }
                TokenKind::LParen => {
                    self.next_tok()?;
                    if self.paren_opens_params()? {
                        params_open = true;
                        break;
                    }
                    levels.push(Level::default());
                }
                TokenKind::Ident(id) => {
                    name = Some(id.clone());
                    self.next_tok()?;
                    break;
                }
                TokenKind::Dollar => {
                    self.next_tok()?;
                    match self.take_arg(&tok)? {
                        ParseArg::Name(n) => name = Some(n),
                        _ => {
                            return Err(
                                self.syntax_err(&tok, "expected a name substitution argument")
                            )
                        }
                    }
                    break;
                }
                _ => break, // abstract declarator
            }
        }

        // pass 2: unwind right-to-left, attaching trailing constructs
        for idx in (0..levels.len()).rev() {
            self.attach_suffix(&mut levels[idx], &mut params_open)?;
            if idx > 0 {
                let tok = self.next_tok()?;
                if tok.kind != TokenKind::RParen {
                    return Err(self.syntax_err(&tok, "expected `)` to close declarator"));
                }
            }
        }

        // a convention fixed on an inner level propagates outward when the
        // outer level does not set its own
        let mut carried: Option<CallConv> = None;
        for level in levels.iter_mut().rev() {
            if level.convention.is_none() {
                level.convention = carried;
            }
            carried = level.convention;
        }

        // pass 3: build, outermost level first
        let mut ty = base;
        let mut saw_function = false;
        for level in &levels {
            for qual in &level.pointers {
                if ty.is_reference() {
                    return Err(self.syntax_err_here("pointer to reference is not allowed"));
                }
                ty = wrap_pointer(ty, *qual);
            }
            if level.reference {
                if ty.is_reference() {
                    return Err(self.syntax_err_here("reference to reference is not allowed"));
                }
                ty = Type::reference_to(ty);
            }
            match &level.suffix {
                Some(Suffix::Params { params, variadic }) => {
                    self.check_result_type(&ty)?;
                    saw_function = true;
                    let sig = FuncSig {
                        result: ty,
                        params: params.clone(),
                        variadic: *variadic,
                        convention: level.convention.unwrap_or_default(),
                    };
                    ty = Type::new(TypeKind::Function(Box::new(sig)));
                }
                Some(Suffix::Dims(dims)) => {
                    if ty.is_void() || ty.is_function() || ty.is_reference() {
                        return Err(
                            self.syntax_err_here(format!("cannot declare an array of `{ty}`"))
                        );
                    }
                    for dim in dims.iter().rev() {
                        ty = Type::array_of(ty, *dim);
                    }
                }
                None => {}
            }
        }

        if conv_written && !saw_function {
            return Err(
                self.syntax_err_here("calling convention applied to a non-function declarator")
            );
        }
        if name_required && name.is_none() {
            return Err(self.syntax_err_here("expected a name in declarator"));
        }
        Ok((name, ty))
    }

    /// cv-qualifiers following a `*`.
    fn qualifier_run(&mut self) -> Result<Qualifiers, ParseError> {
        let mut qual = Qualifiers::NONE;
        loop {
            match self.peek_tok()?.kind {
                TokenKind::Kw(Kw::Const) => {
                    self.next_tok()?;
                    qual.insert(Qualifiers::CONST);
                }
                TokenKind::Kw(Kw::Volatile) => {
                    self.next_tok()?;
                    qual.insert(Qualifiers::VOLATILE);
                }
                TokenKind::Kw(Kw::Restrict) => {
                    self.next_tok()?;
                }
                _ => return Ok(qual),
            }
        }
    }

    /// After consuming a `(` during the inward pass: does it open a
    /// parameter list (as opposed to a nested declarator)? Anything that
    /// starts a type does; so does an immediate `)` or `...`.
    fn paren_opens_params(&mut self) -> Result<bool, ParseError> {
        if matches!(
            self.peek_tok()?.kind,
            TokenKind::RParen | TokenKind::Ellipsis
        ) {
            return Ok(true);
        }
        self.starts_type()
    }

    /// Attach the `(...)` or `[...]` found at the current position to
    /// `level`, if there is one.
    fn attach_suffix(
        &mut self,
        level: &mut Level,
        params_open: &mut bool,
    ) -> Result<(), ParseError> {
        if *params_open {
            *params_open = false;
        } else if self.peek_tok()?.kind == TokenKind::LParen {
            self.next_tok()?;
        } else if self.peek_tok()?.kind == TokenKind::LBracket {
            level.suffix = Some(Suffix::Dims(self.parse_dims()?));
            return Ok(());
        } else {
            return Ok(());
        }

        let (params, variadic) = self.parse_params()?;
        level.suffix = Some(Suffix::Params { params, variadic });

        // GNU-style convention attribute directly after the parameter list
        if self.peek_tok()?.kind == TokenKind::Kw(Kw::Attribute) {
            self.next_tok()?;
            if let Some(conv) = self.parse_gnu_attribute()? {
                level.convention = Some(conv);
            }
        }
        Ok(())
    }

    /// Parameter list; the opening `(` is already consumed.
    fn parse_params(&mut self) -> Result<(Vec<Param>, bool), ParseError> {
        let mut params = Vec::new();
        let mut variadic = false;

        if self.eat(&TokenKind::RParen)? {
            return Ok((params, variadic));
        }
        loop {
            if self.eat(&TokenKind::Ellipsis)? {
                variadic = true;
                self.expect(TokenKind::RParen, "`)` after `...`")?;
                break;
            }
            let base = self.parse_base_type()?;
            let (name, ty) = self.parse_declarator(base, false)?;
            let ty = self.adjust_param_type(ty)?;
            params.push(Param { name, ty });
            if self.eat(&TokenKind::Comma)? {
                continue;
            }
            self.expect(TokenKind::RParen, "`)` after parameters")?;
            break;
        }

        // `(void)` declares an empty parameter list
        if params.len() == 1 && params[0].name.is_none() && params[0].ty.is_void() {
            params.clear();
        }
        for param in &params {
            if param.ty.is_void() {
                return Err(self.syntax_err_here("parameter cannot have type `void`"));
            }
        }
        Ok((params, variadic))
    }

    /// C parameter adjustments plus passability checks.
    fn adjust_param_type(&mut self, ty: Type) -> Result<Type, ParseError> {
        match &ty.kind {
            TypeKind::Function(sig) => Ok(Type::new(TypeKind::FunctionPointer(sig.clone()))),
            TypeKind::Array(_, ArrayLen::Variable | ArrayLen::Flexible) => {
                Err(self.syntax_err_here(format!(
                    "parameter of type `{ty}` cannot be passed by value"
                )))
            }
            TypeKind::Record(rec) if rec.layout().is_some_and(|l| l.flexible) => {
                Err(self.syntax_err_here(format!(
                    "parameter of type `{ty}` cannot be passed by value"
                )))
            }
            _ => Ok(ty),
        }
    }

    /// Function results must be passable or void; functions and arrays are
    /// never valid results.
    fn check_result_type(&mut self, ty: &Type) -> Result<(), ParseError> {
        if ty.is_array() {
            return Err(self.syntax_err_here("function cannot return an array"));
        }
        if matches!(ty.kind, TypeKind::Function(_)) {
            return Err(self.syntax_err_here("function cannot return a function"));
        }
        if let TypeKind::Record(rec) = &ty.kind {
            if rec.layout().is_some_and(|l| l.flexible) {
                return Err(
                    self.syntax_err_here(format!("function cannot return `{ty}` by value"))
                );
            }
        }
        Ok(())
    }

    /// One or more `[...]` dimensions. Only the outermost dimension may be
    /// flexible (`[]`) or construction-sized (`[?]`).
    fn parse_dims(&mut self) -> Result<Vec<ArrayLen>, ParseError> {
        let mut dims = Vec::new();
        while self.eat(&TokenKind::LBracket)? {
            if self.eat(&TokenKind::RBracket)? {
                dims.push(ArrayLen::Flexible);
                continue;
            }
            if self.eat(&TokenKind::Question)? {
                self.expect(TokenKind::RBracket, "`]`")?;
                dims.push(ArrayLen::Variable);
                continue;
            }
            let tok = self.peek_tok()?;
            let value = self.const_expr()?;
            let Some(dim) = value.as_dimension() else {
                return Err(self.syntax_err(&tok, "array dimension cannot be negative"));
            };
            self.expect(TokenKind::RBracket, "`]`")?;
            dims.push(ArrayLen::Fixed(dim));
        }
        for dim in &dims[1..] {
            if !matches!(dim, ArrayLen::Fixed(_)) {
                return Err(self.syntax_err_here(
                    "only the outermost array dimension may have unknown size",
                ));
            }
        }
        Ok(dims)
    }

    /// `__attribute__((...))`; recognizes convention attributes, skips the
    /// rest with balanced parentheses.
    fn parse_gnu_attribute(&mut self) -> Result<Option<CallConv>, ParseError> {
        self.expect(TokenKind::LParen, "`((` after __attribute__")?;
        self.expect(TokenKind::LParen, "`((` after __attribute__")?;
        let mut conv = None;
        let mut depth = 2u32;
        loop {
            let tok = self.next_tok()?;
            match &tok.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                TokenKind::Kw(Kw::Cdecl) => conv = Some(CallConv::C),
                TokenKind::Kw(Kw::Stdcall) => conv = Some(CallConv::Std),
                TokenKind::Kw(Kw::Fastcall) => conv = Some(CallConv::Fast),
                TokenKind::Ident(id) => match id.as_str() {
                    "cdecl" => conv = Some(CallConv::C),
                    "stdcall" => conv = Some(CallConv::Std),
                    "fastcall" => conv = Some(CallConv::Fast),
                    _ => {}
                },
                TokenKind::Eof => {
                    return Err(self.syntax_err(&tok, "unterminated __attribute__"))
                }
                _ => {}
            }
        }
        Ok(conv)
    }
}

fn convention_of(kw: Kw) -> CallConv {
    match kw {
        Kw::Stdcall => CallConv::Std,
        Kw::Fastcall => CallConv::Fast,
        _ => CallConv::C,
    }
}

/// Pointer wrapping; a pointer over a bare function type becomes a function
/// pointer.
fn wrap_pointer(ty: Type, qual: Qualifiers) -> Type {
    if matches!(ty.kind, TypeKind::Function(_)) {
        let TypeKind::Function(sig) = ty.kind else {
            unreachable!()
        };
        return Type::qualified(TypeKind::FunctionPointer(sig), qual);
    }
    Type::qualified(TypeKind::Pointer(Box::new(ty)), qual)
}
