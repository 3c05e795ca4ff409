//! C declaration lexer for cbridge.
//!
//! Tokenizes a single declaration blob (the text handed to `cdef`) into a
//! stream of C tokens: keywords, identifiers, integer/char/string literals
//! with full C prefix/suffix/escape handling, and multi-character operators.
//!
//! The lexer is pull-based: `next` consumes one token, `peek` gives a
//! one-token lookahead. All errors carry the line number and the offending
//! text.

use smol_str::SmolStr;
use std::mem;
use thiserror::Error;

/// Lexical error, carrying the line it occurred on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("line {line}: unterminated block comment")]
    UnterminatedComment { line: u32 },

    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: u32 },

    #[error("line {line}: unterminated character literal")]
    UnterminatedChar { line: u32 },

    #[error("line {line}: empty character literal")]
    EmptyChar { line: u32 },

    #[error("line {line}: unknown escape sequence `\\{escape}`")]
    UnknownEscape { line: u32, escape: char },

    #[error("line {line}: malformed escape sequence in literal")]
    MalformedEscape { line: u32 },

    #[error("line {line}: integer literal `{text}` out of range")]
    IntOutOfRange { line: u32, text: SmolStr },

    #[error("line {line}: malformed numeric literal `{text}`")]
    MalformedNumber { line: u32, text: SmolStr },

    #[error("line {line}: stray character `{ch}`")]
    StrayChar { line: u32, ch: char },
}

/// C keywords recognized in declarations.
///
/// Resolved from identifiers through a fixed match table; anything not in
/// the table stays an [`TokenKind::Ident`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kw {
    Void,
    Bool,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Signed,
    Unsigned,
    Struct,
    Union,
    Enum,
    Typedef,
    Const,
    Volatile,
    Extern,
    Static,
    Register,
    Inline,
    Restrict,
    Sizeof,
    Alignof,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    SizeT,
    SsizeT,
    IntptrT,
    UintptrT,
    PtrdiffT,
    WcharT,
    Char16T,
    Char32T,
    VaList,
    Cdecl,
    Stdcall,
    Fastcall,
    Attribute,
    Extension,
    True,
    False,
}

impl Kw {
    /// Canonical spelling, for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Kw::Void => "void",
            Kw::Bool => "bool",
            Kw::Char => "char",
            Kw::Short => "short",
            Kw::Int => "int",
            Kw::Long => "long",
            Kw::Float => "float",
            Kw::Double => "double",
            Kw::Signed => "signed",
            Kw::Unsigned => "unsigned",
            Kw::Struct => "struct",
            Kw::Union => "union",
            Kw::Enum => "enum",
            Kw::Typedef => "typedef",
            Kw::Const => "const",
            Kw::Volatile => "volatile",
            Kw::Extern => "extern",
            Kw::Static => "static",
            Kw::Register => "register",
            Kw::Inline => "inline",
            Kw::Restrict => "restrict",
            Kw::Sizeof => "sizeof",
            Kw::Alignof => "alignof",
            Kw::Int8 => "int8_t",
            Kw::Int16 => "int16_t",
            Kw::Int32 => "int32_t",
            Kw::Int64 => "int64_t",
            Kw::Uint8 => "uint8_t",
            Kw::Uint16 => "uint16_t",
            Kw::Uint32 => "uint32_t",
            Kw::Uint64 => "uint64_t",
            Kw::SizeT => "size_t",
            Kw::SsizeT => "ssize_t",
            Kw::IntptrT => "intptr_t",
            Kw::UintptrT => "uintptr_t",
            Kw::PtrdiffT => "ptrdiff_t",
            Kw::WcharT => "wchar_t",
            Kw::Char16T => "char16_t",
            Kw::Char32T => "char32_t",
            Kw::VaList => "va_list",
            Kw::Cdecl => "__cdecl",
            Kw::Stdcall => "__stdcall",
            Kw::Fastcall => "__fastcall",
            Kw::Attribute => "__attribute__",
            Kw::Extension => "__extension__",
            Kw::True => "true",
            Kw::False => "false",
        }
    }

    /// Keyword table lookup for an identifier.
    pub fn from_ident(ident: &str) -> Option<Kw> {
        Some(match ident {
            "void" => Kw::Void,
            "bool" | "_Bool" => Kw::Bool,
            "char" => Kw::Char,
            "short" => Kw::Short,
            "int" => Kw::Int,
            "long" => Kw::Long,
            "float" => Kw::Float,
            "double" => Kw::Double,
            "signed" | "__signed__" => Kw::Signed,
            "unsigned" => Kw::Unsigned,
            "struct" => Kw::Struct,
            "union" => Kw::Union,
            "enum" => Kw::Enum,
            "typedef" => Kw::Typedef,
            "const" | "__const" | "__const__" => Kw::Const,
            "volatile" | "__volatile__" => Kw::Volatile,
            "extern" => Kw::Extern,
            "static" => Kw::Static,
            "register" => Kw::Register,
            "inline" | "__inline" | "__inline__" => Kw::Inline,
            "restrict" | "__restrict" | "__restrict__" => Kw::Restrict,
            "sizeof" => Kw::Sizeof,
            "alignof" | "_Alignof" | "__alignof__" => Kw::Alignof,
            "int8_t" => Kw::Int8,
            "int16_t" => Kw::Int16,
            "int32_t" => Kw::Int32,
            "int64_t" => Kw::Int64,
            "uint8_t" => Kw::Uint8,
            "uint16_t" => Kw::Uint16,
            "uint32_t" => Kw::Uint32,
            "uint64_t" => Kw::Uint64,
            "size_t" => Kw::SizeT,
            "ssize_t" => Kw::SsizeT,
            "intptr_t" => Kw::IntptrT,
            "uintptr_t" => Kw::UintptrT,
            "ptrdiff_t" => Kw::PtrdiffT,
            "wchar_t" => Kw::WcharT,
            "char16_t" => Kw::Char16T,
            "char32_t" => Kw::Char32T,
            "va_list" | "__builtin_va_list" | "__gnuc_va_list" => Kw::VaList,
            "__cdecl" | "__cdecl__" => Kw::Cdecl,
            "__stdcall" | "__stdcall__" => Kw::Stdcall,
            "__fastcall" | "__fastcall__" => Kw::Fastcall,
            "__attribute__" | "__attribute" => Kw::Attribute,
            "__extension__" => Kw::Extension,
            "true" => Kw::True,
            "false" => Kw::False,
            _ => return None,
        })
    }
}

/// The C kind an integer literal was narrowed to.
///
/// Per C11 6.4.4.1 the literal takes the first type in its candidate list
/// that can represent the value; decimal literals without a `u` suffix never
/// become unsigned, while hex/octal/binary literals may.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntKind {
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
}

impl IntKind {
    pub fn is_signed(self) -> bool {
        matches!(self, IntKind::Int | IntKind::Long | IntKind::LongLong)
    }
}

/// An integer literal value with its narrowed C kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLit {
    /// Raw magnitude. For signed kinds the value fits the signed range.
    pub value: u64,
    pub kind: IntKind,
}

/// A single token kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(SmolStr),
    Kw(Kw),
    Int(IntLit),
    /// Character literal; C gives these type `int`, the lexer keeps the
    /// byte value (octal/hex escapes are capped at 0xFF).
    CharLit(u8),
    /// String literal bytes after escape decoding and adjacent-literal
    /// concatenation. Not NUL-terminated here.
    Str(Vec<u8>),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Colon,
    Question,
    Dot,
    Arrow,
    Ellipsis,
    /// Positional substitution marker for parameterized parsing.
    Dollar,

    Star,
    Amp,
    AmpAmp,
    Pipe,
    PipePipe,
    Caret,
    Tilde,
    Bang,
    Plus,
    Minus,
    Slash,
    Percent,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    Assign,

    Eof,
}

impl TokenKind {
    /// Short printable form used in error messages.
    pub fn describe(&self) -> SmolStr {
        match self {
            TokenKind::Ident(s) => s.clone(),
            TokenKind::Kw(k) => SmolStr::new_static(k.as_str()),
            TokenKind::Int(i) => SmolStr::new(i.value.to_string()),
            TokenKind::CharLit(c) => SmolStr::new(format!("'{}'", *c as char)),
            TokenKind::Str(_) => SmolStr::new_static("string literal"),
            TokenKind::LParen => SmolStr::new_static("("),
            TokenKind::RParen => SmolStr::new_static(")"),
            TokenKind::LBrace => SmolStr::new_static("{"),
            TokenKind::RBrace => SmolStr::new_static("}"),
            TokenKind::LBracket => SmolStr::new_static("["),
            TokenKind::RBracket => SmolStr::new_static("]"),
            TokenKind::Semi => SmolStr::new_static(";"),
            TokenKind::Comma => SmolStr::new_static(","),
            TokenKind::Colon => SmolStr::new_static(":"),
            TokenKind::Question => SmolStr::new_static("?"),
            TokenKind::Dot => SmolStr::new_static("."),
            TokenKind::Arrow => SmolStr::new_static("->"),
            TokenKind::Ellipsis => SmolStr::new_static("..."),
            TokenKind::Dollar => SmolStr::new_static("$"),
            TokenKind::Star => SmolStr::new_static("*"),
            TokenKind::Amp => SmolStr::new_static("&"),
            TokenKind::AmpAmp => SmolStr::new_static("&&"),
            TokenKind::Pipe => SmolStr::new_static("|"),
            TokenKind::PipePipe => SmolStr::new_static("||"),
            TokenKind::Caret => SmolStr::new_static("^"),
            TokenKind::Tilde => SmolStr::new_static("~"),
            TokenKind::Bang => SmolStr::new_static("!"),
            TokenKind::Plus => SmolStr::new_static("+"),
            TokenKind::Minus => SmolStr::new_static("-"),
            TokenKind::Slash => SmolStr::new_static("/"),
            TokenKind::Percent => SmolStr::new_static("%"),
            TokenKind::Shl => SmolStr::new_static("<<"),
            TokenKind::Shr => SmolStr::new_static(">>"),
            TokenKind::Lt => SmolStr::new_static("<"),
            TokenKind::Gt => SmolStr::new_static(">"),
            TokenKind::Le => SmolStr::new_static("<="),
            TokenKind::Ge => SmolStr::new_static(">="),
            TokenKind::EqEq => SmolStr::new_static("=="),
            TokenKind::Ne => SmolStr::new_static("!="),
            TokenKind::Assign => SmolStr::new_static("="),
            TokenKind::Eof => SmolStr::new_static("end of input"),
        }
    }
}

/// A token with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

impl Token {
    pub fn new(kind: TokenKind, line: u32) -> Self {
        Self { kind, line }
    }
}

/// Pull lexer over a declaration string.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    peeked: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        let mut src = input.as_bytes();
        // UTF-8 BOM
        if src.starts_with(&[0xEF, 0xBB, 0xBF]) {
            src = &src[3..];
        }
        Self {
            src,
            pos: 0,
            line: 1,
            peeked: None,
        }
    }

    /// Current line, for error reporting by the parser.
    pub fn line(&self) -> u32 {
        self.peeked.as_ref().map_or(self.line, |t| t.line)
    }

    /// Consume and return the next token.
    pub fn next(&mut self) -> Result<Token, LexError> {
        if let Some(tok) = self.peeked.take() {
            return Ok(tok);
        }
        self.lex()
    }

    /// One-token lookahead without consuming.
    pub fn peek(&mut self) -> Result<&Token, LexError> {
        if self.peeked.is_none() {
            let tok = self.lex()?;
            self.peeked = Some(tok);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    /// Push a token back; at most one token of pushback is supported.
    pub fn unget(&mut self, tok: Token) {
        debug_assert!(self.peeked.is_none());
        self.peeked = Some(tok);
    }

    fn at(&self, off: usize) -> Option<u8> {
        self.src.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.at(0)?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.at(0) {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.at(1) == Some(b'/') => {
                    while self.at(0).is_some_and(|b| b != b'\n') {
                        self.bump();
                    }
                }
                Some(b'/') if self.at(1) == Some(b'*') => {
                    let start = self.line;
                    self.bump();
                    self.bump();
                    loop {
                        match self.at(0) {
                            None => return Err(LexError::UnterminatedComment { line: start }),
                            Some(b'*') if self.at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex(&mut self) -> Result<Token, LexError> {
        self.skip_trivia()?;
        let line = self.line;
        let Some(b) = self.at(0) else {
            return Ok(Token::new(TokenKind::Eof, line));
        };

        // Wide-string / wide-char prefixes lex like their plain forms.
        if matches!(b, b'L' | b'u' | b'U') {
            if self.at(1) == Some(b'"') {
                self.bump();
                return self.lex_string(line);
            }
            if self.at(1) == Some(b'\'') {
                self.bump();
                return self.lex_char(line);
            }
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            return Ok(self.lex_ident(line));
        }
        if b.is_ascii_digit() {
            return self.lex_number(line);
        }

        match b {
            b'"' => return self.lex_string(line),
            b'\'' => return self.lex_char(line),
            _ => {}
        }

        self.bump();
        let kind = match b {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b';' => TokenKind::Semi,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b'?' => TokenKind::Question,
            b'$' => TokenKind::Dollar,
            b'*' => TokenKind::Star,
            b'~' => TokenKind::Tilde,
            b'^' => TokenKind::Caret,
            b'+' => TokenKind::Plus,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'.' => {
                if self.at(0) == Some(b'.') && self.at(1) == Some(b'.') {
                    self.bump();
                    self.bump();
                    TokenKind::Ellipsis
                } else {
                    TokenKind::Dot
                }
            }
            b'-' => {
                if self.at(0) == Some(b'>') {
                    self.bump();
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            b'&' => {
                if self.at(0) == Some(b'&') {
                    self.bump();
                    TokenKind::AmpAmp
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                if self.at(0) == Some(b'|') {
                    self.bump();
                    TokenKind::PipePipe
                } else {
                    TokenKind::Pipe
                }
            }
            b'<' => match self.at(0) {
                Some(b'<') => {
                    self.bump();
                    TokenKind::Shl
                }
                Some(b'=') => {
                    self.bump();
                    TokenKind::Le
                }
                _ => TokenKind::Lt,
            },
            b'>' => match self.at(0) {
                Some(b'>') => {
                    self.bump();
                    TokenKind::Shr
                }
                Some(b'=') => {
                    self.bump();
                    TokenKind::Ge
                }
                _ => TokenKind::Gt,
            },
            b'=' => {
                if self.at(0) == Some(b'=') {
                    self.bump();
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            b'!' => {
                if self.at(0) == Some(b'=') {
                    self.bump();
                    TokenKind::Ne
                } else {
                    TokenKind::Bang
                }
            }
            _ => {
                return Err(LexError::StrayChar {
                    line,
                    ch: b as char,
                })
            }
        };
        Ok(Token::new(kind, line))
    }

    fn lex_ident(&mut self, line: u32) -> Token {
        let start = self.pos;
        while self
            .at(0)
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        let kind = match Kw::from_ident(text) {
            Some(kw) => TokenKind::Kw(kw),
            None => TokenKind::Ident(SmolStr::new(text)),
        };
        Token::new(kind, line)
    }

    fn lex_number(&mut self, line: u32) -> Result<Token, LexError> {
        let start = self.pos;
        let radix = if self.at(0) == Some(b'0') {
            match self.at(1) {
                Some(b'x') | Some(b'X') => {
                    self.bump();
                    self.bump();
                    16
                }
                Some(b'b') | Some(b'B') => {
                    self.bump();
                    self.bump();
                    2
                }
                Some(d) if d.is_ascii_digit() => {
                    self.bump();
                    8
                }
                _ => 10,
            }
        } else {
            10
        };

        let mut value: u64 = 0;
        let mut overflow = false;
        let mut have_digit = radix == 8; // a bare `0` is a valid octal literal
        while let Some(b) = self.at(0) {
            let d = match b {
                b'0'..=b'9' => (b - b'0') as u64,
                b'a'..=b'f' if radix == 16 => (b - b'a' + 10) as u64,
                b'A'..=b'F' if radix == 16 => (b - b'A' + 10) as u64,
                _ => break,
            };
            if d >= radix {
                break;
            }
            have_digit = true;
            self.bump();
            value = match value
                .checked_mul(radix)
                .and_then(|v| v.checked_add(d))
            {
                Some(v) => v,
                None => {
                    overflow = true;
                    0
                }
            };
        }

        // Suffixes: any order of one `u` and up to two `l`s.
        let mut has_u = false;
        let mut l_count = 0u8;
        loop {
            match self.at(0) {
                Some(b'u') | Some(b'U') if !has_u => {
                    has_u = true;
                    self.bump();
                }
                Some(b'l') | Some(b'L') if l_count == 0 => {
                    let c = self.bump().unwrap();
                    // `ll` must repeat the same case
                    if self.at(0) == Some(c) {
                        self.bump();
                        l_count = 2;
                    } else {
                        l_count = 1;
                    }
                }
                _ => break,
            }
        }

        if !have_digit || self.at(0).is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_') {
            // trailing junk such as `0x` or `123abc`
            while self
                .at(0)
                .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                self.bump();
            }
            return Err(LexError::MalformedNumber {
                line,
                text: SmolStr::new(std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("")),
            });
        }
        if overflow {
            return Err(LexError::IntOutOfRange {
                line,
                text: SmolStr::new(std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("")),
            });
        }

        let kind = match narrow_int(value, radix == 10, has_u, l_count) {
            Some(kind) => kind,
            None => {
                return Err(LexError::IntOutOfRange {
                    line,
                    text: SmolStr::new(
                        std::str::from_utf8(&self.src[start..self.pos]).unwrap_or(""),
                    ),
                })
            }
        };
        Ok(Token::new(
            TokenKind::Int(IntLit { value, kind }),
            line,
        ))
    }

    /// Decode one escape sequence after the backslash has been consumed.
    fn lex_escape(&mut self, line: u32) -> Result<u8, LexError> {
        let Some(b) = self.bump() else {
            return Err(LexError::MalformedEscape { line });
        };
        Ok(match b {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0C,
            b'v' => 0x0B,
            b'e' => 0x1B,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'?' => b'?',
            b'x' => {
                let mut value: u32 = 0;
                let mut any = false;
                while let Some(d) = self.at(0).and_then(hex_digit) {
                    any = true;
                    self.bump();
                    value = value.wrapping_mul(16).wrapping_add(d);
                    if value > 0xFF {
                        return Err(LexError::MalformedEscape { line });
                    }
                }
                if !any {
                    return Err(LexError::MalformedEscape { line });
                }
                value as u8
            }
            b'0'..=b'7' => {
                // up to three octal digits, capped at 0xFF
                let mut value: u32 = (b - b'0') as u32;
                for _ in 0..2 {
                    match self.at(0) {
                        Some(d @ b'0'..=b'7') => {
                            self.bump();
                            value = value * 8 + (d - b'0') as u32;
                        }
                        _ => break,
                    }
                }
                if value > 0xFF {
                    return Err(LexError::MalformedEscape { line });
                }
                value as u8
            }
            other => {
                return Err(LexError::UnknownEscape {
                    line,
                    escape: other as char,
                })
            }
        })
    }

    fn lex_char(&mut self, line: u32) -> Result<Token, LexError> {
        self.bump(); // opening quote
        let value = match self.at(0) {
            None => return Err(LexError::UnterminatedChar { line }),
            Some(b'\'') => return Err(LexError::EmptyChar { line }),
            Some(b'\\') => {
                self.bump();
                self.lex_escape(line)?
            }
            Some(b) => {
                self.bump();
                b
            }
        };
        match self.bump() {
            Some(b'\'') => Ok(Token::new(TokenKind::CharLit(value), line)),
            _ => Err(LexError::UnterminatedChar { line }),
        }
    }

    fn lex_string(&mut self, line: u32) -> Result<Token, LexError> {
        let mut bytes = Vec::new();
        loop {
            self.bump(); // opening quote
            loop {
                match self.at(0) {
                    None | Some(b'\n') => return Err(LexError::UnterminatedString { line }),
                    Some(b'"') => {
                        self.bump();
                        break;
                    }
                    Some(b'\\') => {
                        self.bump();
                        bytes.push(self.lex_escape(line)?);
                    }
                    Some(b) => {
                        self.bump();
                        bytes.push(b);
                    }
                }
            }
            // Adjacent string literals concatenate.
            self.skip_trivia()?;
            match self.at(0) {
                Some(b'"') => continue,
                Some(b'L' | b'u' | b'U') if self.at(1) == Some(b'"') => {
                    self.bump();
                    continue;
                }
                _ => break,
            }
        }
        Ok(Token::new(TokenKind::Str(bytes), line))
    }
}

fn hex_digit(b: u8) -> Option<u32> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u32),
        b'a'..=b'f' => Some((b - b'a' + 10) as u32),
        b'A'..=b'F' => Some((b - b'A' + 10) as u32),
        _ => None,
    }
}

fn long_bits() -> u32 {
    8 * mem::size_of::<libc::c_long>() as u32
}

fn fits_signed(value: u64, bits: u32) -> bool {
    value <= (1u64 << (bits - 1)) - 1
}

fn fits_unsigned(value: u64, bits: u32) -> bool {
    bits >= 64 || value < (1u64 << bits)
}

/// Pick the narrowest C type for an integer literal, per C11 6.4.4.1.
///
/// Decimal literals without `u` only consider signed candidates; hex, octal
/// and binary literals interleave unsigned candidates of each width.
fn narrow_int(value: u64, decimal: bool, has_u: bool, l_count: u8) -> Option<IntKind> {
    let lbits = long_bits();
    // candidate list: (kind, signed, bits)
    let candidates: &[(IntKind, bool, u32)] = match (has_u, l_count, decimal) {
        (false, 0, true) => &[
            (IntKind::Int, true, 32),
            (IntKind::Long, true, 0),
            (IntKind::LongLong, true, 64),
        ],
        (false, 0, false) => &[
            (IntKind::Int, true, 32),
            (IntKind::UInt, false, 32),
            (IntKind::Long, true, 0),
            (IntKind::ULong, false, 0),
            (IntKind::LongLong, true, 64),
            (IntKind::ULongLong, false, 64),
        ],
        (true, 0, _) => &[
            (IntKind::UInt, false, 32),
            (IntKind::ULong, false, 0),
            (IntKind::ULongLong, false, 64),
        ],
        (false, 1, true) => &[(IntKind::Long, true, 0), (IntKind::LongLong, true, 64)],
        (false, 1, false) => &[
            (IntKind::Long, true, 0),
            (IntKind::ULong, false, 0),
            (IntKind::LongLong, true, 64),
            (IntKind::ULongLong, false, 64),
        ],
        (true, 1, _) => &[(IntKind::ULong, false, 0), (IntKind::ULongLong, false, 64)],
        (false, _, true) => &[(IntKind::LongLong, true, 64)],
        (false, _, false) => &[(IntKind::LongLong, true, 64), (IntKind::ULongLong, false, 64)],
        (true, _, _) => &[(IntKind::ULongLong, false, 64)],
    };
    for &(kind, signed, bits) in candidates {
        let bits = if bits == 0 { lbits } else { bits };
        let fits = if signed {
            fits_signed(value, bits)
        } else {
            fits_unsigned(value, bits)
        };
        if fits {
            return Some(kind);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn all(input: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(input);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next().expect("lex");
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            all("const int foo"),
            vec![
                TokenKind::Kw(Kw::Const),
                TokenKind::Kw(Kw::Int),
                TokenKind::Ident(SmolStr::new("foo")),
            ]
        );
    }

    #[test]
    fn multi_char_operators() {
        assert_eq!(
            all("== != <= >= && || << >> ... ->"),
            vec![
                TokenKind::EqEq,
                TokenKind::Ne,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Ellipsis,
                TokenKind::Arrow,
            ]
        );
    }

    #[test]
    fn comments_and_lines() {
        let mut lexer = Lexer::new("int /* a\nb */ x // tail\n;");
        assert_eq!(lexer.next().unwrap().kind, TokenKind::Kw(Kw::Int));
        let x = lexer.next().unwrap();
        assert_eq!(x.kind, TokenKind::Ident(SmolStr::new("x")));
        assert_eq!(x.line, 2);
        let semi = lexer.next().unwrap();
        assert_eq!(semi.kind, TokenKind::Semi);
        assert_eq!(semi.line, 3);
    }

    #[test]
    fn bom_is_skipped() {
        assert_eq!(all("\u{FEFF}int"), vec![TokenKind::Kw(Kw::Int)]);
    }

    #[test]
    fn unterminated_comment() {
        let mut lexer = Lexer::new("/* nope");
        assert_eq!(
            lexer.next(),
            Err(LexError::UnterminatedComment { line: 1 })
        );
    }

    #[test]
    fn decimal_narrowing() {
        fn kind(s: &str) -> IntKind {
            match &all(s)[0] {
                TokenKind::Int(lit) => lit.kind,
                other => panic!("not an int: {other:?}"),
            }
        }
        assert_eq!(kind("1"), IntKind::Int);
        assert_eq!(kind("2147483647"), IntKind::Int);
        // 2^31 does not fit int; next signed candidate takes it
        let next = kind("2147483648");
        assert!(matches!(next, IntKind::Long | IntKind::LongLong));
        assert!(matches!(
            kind("9223372036854775807"),
            IntKind::Long | IntKind::LongLong
        ));
        assert_eq!(kind("1u"), IntKind::UInt);
        assert_eq!(kind("1ull"), IntKind::ULongLong);
        assert_eq!(kind("1ll"), IntKind::LongLong);
    }

    #[test]
    fn hex_narrowing_uses_unsigned() {
        fn kind(s: &str) -> IntKind {
            match &all(s)[0] {
                TokenKind::Int(lit) => lit.kind,
                other => panic!("not an int: {other:?}"),
            }
        }
        assert_eq!(kind("0x7fffffff"), IntKind::Int);
        assert_eq!(kind("0x80000000"), IntKind::UInt);
        // unsigned long on LP64, unsigned long long where long is 32-bit
        assert!(matches!(
            kind("0xffffffffffffffff"),
            IntKind::ULong | IntKind::ULongLong
        ));
        assert_eq!(kind("0b101"), IntKind::Int);
        assert_eq!(kind("0777"), IntKind::Int);
    }

    #[test]
    fn decimal_out_of_range() {
        let mut lexer = Lexer::new("18446744073709551616"); // 2^64
        assert!(matches!(
            lexer.next(),
            Err(LexError::IntOutOfRange { .. })
        ));
    }

    #[test]
    fn char_literals() {
        assert_eq!(all("'a'"), vec![TokenKind::CharLit(b'a')]);
        assert_eq!(all(r"'\n'"), vec![TokenKind::CharLit(b'\n')]);
        assert_eq!(all(r"'\x41'"), vec![TokenKind::CharLit(0x41)]);
        assert_eq!(all(r"'\101'"), vec![TokenKind::CharLit(0o101)]);
        assert_eq!(all(r"'\0'"), vec![TokenKind::CharLit(0)]);
    }

    #[test]
    fn octal_escape_cap() {
        let mut lexer = Lexer::new(r"'\777'"); // 511 > 0xFF
        assert_eq!(lexer.next(), Err(LexError::MalformedEscape { line: 1 }));
    }

    #[test]
    fn unknown_escape() {
        let mut lexer = Lexer::new(r"'\q'");
        assert_eq!(
            lexer.next(),
            Err(LexError::UnknownEscape {
                line: 1,
                escape: 'q'
            })
        );
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            all(r#""foo" "bar""#),
            vec![TokenKind::Str(b"foobar".to_vec())]
        );
        assert_eq!(
            all("\"a\" /* x */ \"b\" \"c\""),
            vec![TokenKind::Str(b"abc".to_vec())]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            all(r#""a\tb\x21\0""#),
            vec![TokenKind::Str(b"a\tb!\0".to_vec())]
        );
    }

    #[test]
    fn unterminated_string() {
        let mut lexer = Lexer::new("\"abc");
        assert_eq!(
            lexer.next(),
            Err(LexError::UnterminatedString { line: 1 })
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("int x");
        assert_eq!(lexer.peek().unwrap().kind, TokenKind::Kw(Kw::Int));
        assert_eq!(lexer.next().unwrap().kind, TokenKind::Kw(Kw::Int));
        assert_eq!(
            lexer.next().unwrap().kind,
            TokenKind::Ident(SmolStr::new("x"))
        );
    }

    #[test]
    fn dollar_marker() {
        assert_eq!(
            all("int $ [$]"),
            vec![
                TokenKind::Kw(Kw::Int),
                TokenKind::Dollar,
                TokenKind::LBracket,
                TokenKind::Dollar,
                TokenKind::RBracket,
            ]
        );
    }
}
