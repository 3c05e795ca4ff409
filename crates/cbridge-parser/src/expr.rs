//! Constant-expression evaluation.
//!
//! Array dimensions, enum values and bitfield widths are integer constant
//! expressions; this evaluates them as they parse, with the usual arithmetic
//! conversions approximated in the 64-bit class: an operation runs on the
//! representation of its widest operand, unsigned winning ties.
//!
//! Division or modulo by zero is reported as a parse error. Signed overflow
//! wraps; C leaves both undefined and we do not invent a trap for the
//! latter.

use crate::{ParseArg, ParseError, Parser};
use cbridge_ast::Declaration;
use cbridge_lexer::{IntKind, Kw, TokenKind};

/// An evaluated constant with its signedness class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstValue {
    /// Two's-complement bits; interpret per `unsigned`.
    pub bits: i64,
    pub unsigned: bool,
}

impl ConstValue {
    pub fn signed(v: i64) -> ConstValue {
        ConstValue {
            bits: v,
            unsigned: false,
        }
    }

    pub fn unsigned(v: u64) -> ConstValue {
        ConstValue {
            bits: v as i64,
            unsigned: true,
        }
    }

    pub fn is_zero(self) -> bool {
        self.bits == 0
    }

    /// Value as an array dimension; negative signed values are rejected by
    /// the caller via this returning `None`.
    pub fn as_dimension(self) -> Option<u64> {
        if self.unsigned {
            Some(self.bits as u64)
        } else if self.bits >= 0 {
            Some(self.bits as u64)
        } else {
            None
        }
    }

    pub fn as_i64(self) -> i64 {
        self.bits
    }
}

fn binary(op: &TokenKind, lhs: ConstValue, rhs: ConstValue) -> Option<ConstValue> {
    let unsigned = lhs.unsigned || rhs.unsigned;
    let (a, b) = (lhs.bits, rhs.bits);
    let (ua, ub) = (a as u64, b as u64);
    let val = |bits: i64| ConstValue { bits, unsigned };
    let bool_val = |c: bool| ConstValue::signed(c as i64);
    Some(match op {
        TokenKind::Plus => val(if unsigned {
            ua.wrapping_add(ub) as i64
        } else {
            a.wrapping_add(b)
        }),
        TokenKind::Minus => val(if unsigned {
            ua.wrapping_sub(ub) as i64
        } else {
            a.wrapping_sub(b)
        }),
        TokenKind::Star => val(if unsigned {
            ua.wrapping_mul(ub) as i64
        } else {
            a.wrapping_mul(b)
        }),
        TokenKind::Slash => {
            if b == 0 {
                return None;
            }
            val(if unsigned {
                (ua / ub) as i64
            } else {
                a.wrapping_div(b)
            })
        }
        TokenKind::Percent => {
            if b == 0 {
                return None;
            }
            val(if unsigned {
                (ua % ub) as i64
            } else {
                a.wrapping_rem(b)
            })
        }
        TokenKind::Shl => val((ua.wrapping_shl(ub as u32 & 63)) as i64),
        TokenKind::Shr => val(if unsigned {
            (ua >> (ub & 63)) as i64
        } else {
            a >> (ub & 63)
        }),
        TokenKind::Amp => val(a & b),
        TokenKind::Pipe => val(a | b),
        TokenKind::Caret => val(a ^ b),
        TokenKind::Lt => bool_val(if unsigned { ua < ub } else { a < b }),
        TokenKind::Gt => bool_val(if unsigned { ua > ub } else { a > b }),
        TokenKind::Le => bool_val(if unsigned { ua <= ub } else { a <= b }),
        TokenKind::Ge => bool_val(if unsigned { ua >= ub } else { a >= b }),
        TokenKind::EqEq => bool_val(a == b),
        TokenKind::Ne => bool_val(a != b),
        TokenKind::AmpAmp => bool_val(a != 0 && b != 0),
        TokenKind::PipePipe => bool_val(a != 0 || b != 0),
        _ => return None,
    })
}

fn precedence(op: &TokenKind) -> Option<u8> {
    Some(match op {
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 10,
        TokenKind::Plus | TokenKind::Minus => 9,
        TokenKind::Shl | TokenKind::Shr => 8,
        TokenKind::Lt | TokenKind::Gt | TokenKind::Le | TokenKind::Ge => 7,
        TokenKind::EqEq | TokenKind::Ne => 6,
        TokenKind::Amp => 5,
        TokenKind::Caret => 4,
        TokenKind::Pipe => 3,
        TokenKind::AmpAmp => 2,
        TokenKind::PipePipe => 1,
        _ => return None,
    })
}

impl Parser<'_, '_> {
    /// Parse and evaluate a constant expression (ternary level).
    pub(crate) fn const_expr(&mut self) -> Result<ConstValue, ParseError> {
        let cond = self.binary_expr(0)?;
        if self.eat(&TokenKind::Question)? {
            let then = self.const_expr()?;
            self.expect(TokenKind::Colon, "`:` in conditional expression")?;
            let otherwise = self.const_expr()?;
            Ok(if !cond.is_zero() { then } else { otherwise })
        } else {
            Ok(cond)
        }
    }

    fn binary_expr(&mut self, min_prec: u8) -> Result<ConstValue, ParseError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let tok = self.peek_tok()?;
            let Some(prec) = precedence(&tok.kind) else {
                return Ok(lhs);
            };
            if prec < min_prec {
                return Ok(lhs);
            }
            let op = self.next_tok()?;
            let rhs = self.binary_expr(prec + 1)?;
            lhs = match binary(&op.kind, lhs, rhs) {
                Some(v) => v,
                None => {
                    return Err(self.syntax_err(&op, "division by zero in constant expression"))
                }
            };
        }
    }

    fn unary_expr(&mut self) -> Result<ConstValue, ParseError> {
        let tok = self.peek_tok()?;
        match tok.kind {
            TokenKind::Plus => {
                self.next_tok()?;
                self.unary_expr()
            }
            TokenKind::Minus => {
                self.next_tok()?;
                let v = self.unary_expr()?;
                Ok(ConstValue {
                    bits: v.bits.wrapping_neg(),
                    unsigned: v.unsigned,
                })
            }
            TokenKind::Bang => {
                self.next_tok()?;
                let v = self.unary_expr()?;
                Ok(ConstValue::signed(v.is_zero() as i64))
            }
            TokenKind::Tilde => {
                self.next_tok()?;
                let v = self.unary_expr()?;
                Ok(ConstValue {
                    bits: !v.bits,
                    unsigned: v.unsigned,
                })
            }
            _ => self.primary_expr(),
        }
    }

    fn primary_expr(&mut self) -> Result<ConstValue, ParseError> {
        let tok = self.next_tok()?;
        match &tok.kind {
            TokenKind::Int(lit) => Ok(match lit.kind {
                IntKind::UInt | IntKind::ULong | IntKind::ULongLong => {
                    ConstValue::unsigned(lit.value)
                }
                _ => ConstValue::signed(lit.value as i64),
            }),
            TokenKind::CharLit(c) => Ok(ConstValue::signed(*c as i64)),
            TokenKind::Kw(Kw::True) => Ok(ConstValue::signed(1)),
            TokenKind::Kw(Kw::False) => Ok(ConstValue::signed(0)),
            TokenKind::LParen => {
                let v = self.const_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(v)
            }
            TokenKind::Dollar => match self.take_arg(&tok)? {
                ParseArg::Int(v) => Ok(ConstValue::signed(v)),
                _ => Err(self.syntax_err(&tok, "expected an integer substitution argument")),
            },
            TokenKind::Kw(Kw::Sizeof) => {
                let v = self.sizeof_operand(&tok, false)?;
                Ok(ConstValue::unsigned(v as u64))
            }
            TokenKind::Kw(Kw::Alignof) => {
                let v = self.sizeof_operand(&tok, true)?;
                Ok(ConstValue::unsigned(v as u64))
            }
            TokenKind::Ident(name) => match self.store.lookup(name) {
                Some(Declaration::Constant(v)) => Ok(ConstValue::signed(*v)),
                _ => Err(self.syntax_err(
                    &tok,
                    format!("`{name}` is not a declared integer constant"),
                )),
            },
            _ => Err(self.syntax_err(&tok, "expected a constant expression")),
        }
    }

    /// `sizeof`/`alignof` operand: a parenthesized type, or a parenthesized
    /// constant expression whose natural width answers for it.
    fn sizeof_operand(
        &mut self,
        at: &cbridge_lexer::Token,
        want_align: bool,
    ) -> Result<usize, ParseError> {
        self.expect(TokenKind::LParen, "`(` after sizeof")?;
        if self.starts_type()? {
            let base = self.parse_base_type()?;
            let (_, ty) = self.parse_declarator(base, false)?;
            self.expect(TokenKind::RParen, "`)`")?;
            let answer = if want_align { ty.align() } else { ty.size() };
            answer.map_err(|e| self.syntax_err(at, e.to_string()))
        } else {
            let v = self.const_expr()?;
            self.expect(TokenKind::RParen, "`)`")?;
            // width of the expression's representation class; size and
            // alignment coincide for both
            let _ = want_align;
            Ok(
                if v.unsigned || v.bits > i32::MAX as i64 || v.bits < i32::MIN as i64 {
                    8
                } else {
                    4
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbridge_ast::DeclStore;
    use pretty_assertions::assert_eq;

    fn eval(input: &str) -> ConstValue {
        let mut store = DeclStore::new();
        let mut parser = Parser::new(&mut store, input, Vec::new());
        parser.const_expr().expect("evaluate")
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("1 + 2 * 3").as_i64(), 7);
        assert_eq!(eval("(1 + 2) * 3").as_i64(), 9);
        assert_eq!(eval("10 / 3").as_i64(), 3);
        assert_eq!(eval("10 % 3").as_i64(), 1);
        assert_eq!(eval("-5 + 2").as_i64(), -3);
    }

    #[test]
    fn bitwise_and_shift() {
        assert_eq!(eval("1 << 4").as_i64(), 16);
        assert_eq!(eval("0xff & 0x0f").as_i64(), 0x0f);
        assert_eq!(eval("1 | 2 | 4").as_i64(), 7);
        assert_eq!(eval("~0 & 0xff").as_i64(), 0xff);
        assert_eq!(eval("5 ^ 1").as_i64(), 4);
    }

    #[test]
    fn relational_and_logical() {
        assert_eq!(eval("3 > 2").as_i64(), 1);
        assert_eq!(eval("3 < 2").as_i64(), 0);
        assert_eq!(eval("1 && 0").as_i64(), 0);
        assert_eq!(eval("1 || 0").as_i64(), 1);
        assert_eq!(eval("!3").as_i64(), 0);
    }

    #[test]
    fn ternary() {
        assert_eq!(eval("1 ? 10 : 20").as_i64(), 10);
        assert_eq!(eval("0 ? 10 : 20").as_i64(), 20);
        assert_eq!(eval("2 > 1 ? 2 : 1").as_i64(), 2);
    }

    #[test]
    fn unsigned_class_wins() {
        // 0xffffffffffffffff is unsigned; comparison is unsigned
        let v = eval("0xffffffffffffffffull > 1");
        assert_eq!(v.as_i64(), 1);
        let d = eval("18446744073709551615ull / 2");
        assert!(d.unsigned);
        assert_eq!(d.bits as u64, u64::MAX / 2);
    }

    #[test]
    fn char_literals_are_ints() {
        assert_eq!(eval("'A'").as_i64(), 65);
        assert_eq!(eval("'A' + 1").as_i64(), 66);
    }

    #[test]
    fn division_by_zero_is_reported() {
        let mut store = DeclStore::new();
        let mut parser = Parser::new(&mut store, "1 / 0", Vec::new());
        assert!(parser.const_expr().is_err());
    }

    #[test]
    fn sizeof_types() {
        assert_eq!(
            eval("sizeof(int)").as_i64() as usize,
            std::mem::size_of::<libc::c_int>()
        );
        assert_eq!(
            eval("sizeof(char *)").as_i64() as usize,
            std::mem::size_of::<*const u8>()
        );
        assert_eq!(
            eval("alignof(double)").as_i64() as usize,
            std::mem::align_of::<f64>()
        );
        assert_eq!(
            eval("sizeof(int [4])").as_i64() as usize,
            4 * std::mem::size_of::<libc::c_int>()
        );
    }

    #[test]
    fn named_constants_resolve() {
        let mut store = DeclStore::new();
        store
            .define(
                smol_str::SmolStr::new("N"),
                cbridge_ast::Declaration::Constant(4),
            )
            .unwrap();
        let mut parser = Parser::new(&mut store, "N * 2", Vec::new());
        assert_eq!(parser.const_expr().unwrap().as_i64(), 8);
    }

    #[test]
    fn substitution_argument() {
        let mut store = DeclStore::new();
        let mut parser = Parser::new(&mut store, "$ + 1", vec![ParseArg::Int(41)]);
        assert_eq!(parser.const_expr().unwrap().as_i64(), 42);
    }
}
