//! Arithmetic and comparison over typed values: 64-bit-class promotion for
//! integers, f64 for floats, and element-size scaling for pointers.

use crate::cdata::Cdata;
use crate::error::FfiError;
use crate::marshal;
use crate::value::HostValue;
use cbridge_ast::{Type, TypeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
}

/// A numeric operand after classification.
enum Operand {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Pointer { addr: usize, elem: Option<Type> },
}

fn classify(value: &HostValue) -> Result<Operand, FfiError> {
    match value {
        HostValue::Int(v) => Ok(Operand::Signed(*v)),
        HostValue::Float(v) => Ok(Operand::Float(*v)),
        HostValue::Bool(b) => Ok(Operand::Signed(*b as i64)),
        HostValue::Cdata(cd) => classify_cdata(cd),
        other => Err(FfiError::Arithmetic {
            lhs: other.type_name().to_string(),
            rhs: String::new(),
        }),
    }
}

fn classify_cdata(cd: &Cdata) -> Result<Operand, FfiError> {
    let ty = cd.ty().clone();
    match &ty.kind {
        TypeKind::Pointer(p) | TypeKind::Reference(p) => Ok(Operand::Pointer {
            addr: cd.address(),
            elem: Some((**p).clone()),
        }),
        TypeKind::Array(elem, _) => Ok(Operand::Pointer {
            addr: cd.storage_ptr().map_or(0, |p| p as usize),
            elem: Some((**elem).clone()),
        }),
        TypeKind::FunctionPointer(_) => Ok(Operand::Pointer {
            addr: cd.address(),
            elem: None,
        }),
        _ if ty.is_float() => {
            let src = cd.storage_ptr().ok_or_else(|| FfiError::Arithmetic {
                lhs: ty.to_string(),
                rhs: String::new(),
            })?;
            let v = unsafe { marshal::read_int_bits(src, &ty)? };
            Ok(Operand::Float(match ty.size()? {
                4 => f32::from_bits(v as u32) as f64,
                _ => f64::from_bits(v),
            }))
        }
        _ if ty.is_integer() => {
            let src = cd.storage_ptr().ok_or_else(|| FfiError::Arithmetic {
                lhs: ty.to_string(),
                rhs: String::new(),
            })?;
            let (bits, unsigned) = unsafe { marshal::read_int_value(src, &ty)? };
            Ok(if unsigned {
                Operand::Unsigned(bits as u64)
            } else {
                Operand::Signed(bits)
            })
        }
        _ => Err(FfiError::Arithmetic {
            lhs: ty.to_string(),
            rhs: String::new(),
        }),
    }
}

fn arith_error(a: &HostValue, b: &HostValue) -> FfiError {
    FfiError::Arithmetic {
        lhs: a.type_name().to_string(),
        rhs: b.type_name().to_string(),
    }
}

/// Binary arithmetic with C-like promotion.
pub fn arith(op: BinOp, a: &HostValue, b: &HostValue) -> Result<HostValue, FfiError> {
    let lhs = classify(a)?;
    let rhs = classify(b)?;

    // pointer arithmetic scales by element size
    match (&lhs, &rhs) {
        (
            Operand::Pointer {
                addr,
                elem: Some(elem),
            },
            other,
        ) if matches!(other, Operand::Signed(_) | Operand::Unsigned(_)) => {
            let n = match other {
                Operand::Signed(v) => *v,
                Operand::Unsigned(v) => *v as i64,
                _ => unreachable!(),
            };
            let esize = elem.size()? as i64;
            let delta = match op {
                BinOp::Add => n.wrapping_mul(esize),
                BinOp::Sub => n.wrapping_mul(esize).wrapping_neg(),
                _ => return Err(arith_error(a, b)),
            };
            let new_addr = (*addr as i64).wrapping_add(delta) as usize;
            return Ok(HostValue::Cdata(Cdata::pointer_from_addr(
                pointer_type_of(a).unwrap_or_else(|| Type::pointer_to(elem.clone())),
                new_addr,
            )));
        }
        (
            Operand::Pointer {
                addr: la,
                elem: Some(elem),
            },
            Operand::Pointer {
                addr: ra,
                elem: Some(relem),
            },
        ) if op == BinOp::Sub => {
            if !elem.is_same_unqualified(relem) {
                return Err(arith_error(a, b));
            }
            let esize = elem.size()? as i64;
            let diff = (*la as i64).wrapping_sub(*ra as i64) / esize;
            return Ok(HostValue::Int(diff));
        }
        (
            other,
            Operand::Pointer {
                addr,
                elem: Some(elem),
            },
        ) if op == BinOp::Add
            && matches!(other, Operand::Signed(_) | Operand::Unsigned(_)) =>
        {
            let n = match other {
                Operand::Signed(v) => *v,
                Operand::Unsigned(v) => *v as i64,
                _ => unreachable!(),
            };
            let esize = elem.size()? as i64;
            let new_addr = (*addr as i64).wrapping_add(n.wrapping_mul(esize)) as usize;
            return Ok(HostValue::Cdata(Cdata::pointer_from_addr(
                pointer_type_of(b).unwrap_or_else(|| Type::pointer_to(elem.clone())),
                new_addr,
            )));
        }
        (Operand::Pointer { .. }, _) | (_, Operand::Pointer { .. }) => {
            return Err(arith_error(a, b))
        }
        _ => {}
    }

    // floats win, then unsigned 64-bit class, then signed
    if matches!(lhs, Operand::Float(_)) || matches!(rhs, Operand::Float(_)) {
        let x = as_f64(&lhs);
        let y = as_f64(&rhs);
        let v = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Mod => x % y,
        };
        return Ok(HostValue::Float(v));
    }

    let unsigned = matches!(lhs, Operand::Unsigned(_)) || matches!(rhs, Operand::Unsigned(_));
    let x = as_bits(&lhs);
    let y = as_bits(&rhs);
    if matches!(op, BinOp::Div | BinOp::Mod) && y == 0 {
        return Err(FfiError::Arithmetic {
            lhs: "integer".into(),
            rhs: "zero divisor".into(),
        });
    }
    let bits = if unsigned {
        let (x, y) = (x as u64, y as u64);
        match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div => x / y,
            BinOp::Mod => x % y,
        }
    } else {
        (match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div => x.wrapping_div(y),
            BinOp::Mod => x.wrapping_rem(y),
        }) as u64
    };

    if unsigned && bits > i64::MAX as u64 {
        // keep the precision in a boxed unsigned value
        let cd = Cdata::new_data(Type::new(TypeKind::U64), 8, 8);
        unsafe { (cd.storage_ptr().expect("fresh data") as *mut u64).write(bits) };
        return Ok(HostValue::Cdata(cd));
    }
    Ok(HostValue::Int(bits as i64))
}

/// Comparison with the same promotion rules; pointers compare addresses.
pub fn compare(op: CmpOp, a: &HostValue, b: &HostValue) -> Result<bool, FfiError> {
    let lhs = classify(a)?;
    let rhs = classify(b)?;

    if let (Operand::Pointer { addr: la, .. }, Operand::Pointer { addr: ra, .. }) = (&lhs, &rhs) {
        return Ok(match op {
            CmpOp::Eq => la == ra,
            CmpOp::Lt => la < ra,
            CmpOp::Le => la <= ra,
        });
    }
    if matches!(lhs, Operand::Pointer { .. }) || matches!(rhs, Operand::Pointer { .. }) {
        return Err(arith_error(a, b));
    }

    if matches!(lhs, Operand::Float(_)) || matches!(rhs, Operand::Float(_)) {
        let x = as_f64(&lhs);
        let y = as_f64(&rhs);
        return Ok(match op {
            CmpOp::Eq => x == y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
        });
    }

    let unsigned = matches!(lhs, Operand::Unsigned(_)) || matches!(rhs, Operand::Unsigned(_));
    let x = as_bits(&lhs);
    let y = as_bits(&rhs);
    Ok(if unsigned {
        let (x, y) = (x as u64, y as u64);
        match op {
            CmpOp::Eq => x == y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
        }
    } else {
        match op {
            CmpOp::Eq => x == y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
        }
    })
}

fn as_f64(op: &Operand) -> f64 {
    match op {
        Operand::Signed(v) => *v as f64,
        Operand::Unsigned(v) => *v as f64,
        Operand::Float(v) => *v,
        Operand::Pointer { addr, .. } => *addr as f64,
    }
}

fn as_bits(op: &Operand) -> i64 {
    match op {
        Operand::Signed(v) => *v,
        Operand::Unsigned(v) => *v as i64,
        Operand::Float(v) => *v as i64,
        Operand::Pointer { addr, .. } => *addr as i64,
    }
}

fn pointer_type_of(value: &HostValue) -> Option<Type> {
    match value {
        HostValue::Cdata(cd) if cd.ty().is_pointer() => Some(cd.ty().clone()),
        HostValue::Cdata(cd) => cd.ty().element().map(|e| Type::pointer_to(e.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbridge_ast::ArrayLen;
    use pretty_assertions::assert_eq;

    #[test]
    fn integer_promotion() {
        let r = arith(BinOp::Add, &HostValue::Int(40), &HostValue::Int(2)).unwrap();
        assert_eq!(r.as_int(), Some(42));
        let r = arith(BinOp::Div, &HostValue::Int(7), &HostValue::Int(2)).unwrap();
        assert_eq!(r.as_int(), Some(3));
    }

    #[test]
    fn float_wins() {
        let r = arith(BinOp::Div, &HostValue::Int(7), &HostValue::Float(2.0)).unwrap();
        let HostValue::Float(v) = r else { panic!() };
        assert_eq!(v, 3.5);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = arith(BinOp::Div, &HostValue::Int(1), &HostValue::Int(0));
        assert!(err.is_err());
    }

    #[test]
    fn unsigned_overflow_boxes() {
        let big = marshal::cast_value(
            &Type::new(TypeKind::U64),
            &HostValue::Int(-1), // wraps to u64::MAX
        )
        .unwrap();
        let r = arith(
            BinOp::Sub,
            &HostValue::Cdata(big),
            &HostValue::Int(1),
        )
        .unwrap();
        let HostValue::Cdata(boxed) = r else {
            panic!("expected boxed result");
        };
        let raw = unsafe { (boxed.storage_ptr().unwrap() as *const u64).read() };
        assert_eq!(raw, u64::MAX - 1);
    }

    #[test]
    fn pointer_arithmetic_scales_by_element() {
        let arr = marshal::construct(
            &Type::array_of(Type::int(), ArrayLen::Fixed(4)),
            &[
                HostValue::Int(10),
                HostValue::Int(20),
                HostValue::Int(30),
                HostValue::Int(40),
            ],
        )
        .unwrap();
        let base = arr.storage_ptr().unwrap() as usize;
        let p2 = arith(BinOp::Add, &HostValue::Cdata(arr.clone()), &HostValue::Int(2)).unwrap();
        let HostValue::Cdata(p2) = p2 else { panic!() };
        assert_eq!(p2.address(), base + 2 * std::mem::size_of::<libc::c_int>());
        assert_eq!(p2.get(&HostValue::Int(0)).unwrap().as_int(), Some(30));

        // pointer difference divides by element size
        let d = arith(
            BinOp::Sub,
            &HostValue::Cdata(p2),
            &HostValue::Cdata(arr),
        )
        .unwrap();
        assert_eq!(d.as_int(), Some(2));
    }

    #[test]
    fn comparisons() {
        assert!(compare(CmpOp::Lt, &HostValue::Int(1), &HostValue::Int(2)).unwrap());
        assert!(compare(CmpOp::Eq, &HostValue::Float(1.5), &HostValue::Float(1.5)).unwrap());
        assert!(!compare(CmpOp::Le, &HostValue::Int(3), &HostValue::Int(2)).unwrap());
    }
}
