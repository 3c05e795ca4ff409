//! The host boundary: a closed variant over every shape of value the
//! embedding host can hand to the marshaling engine, and the callable
//! host-function reference used by callbacks.

use crate::cdata::Cdata;
use crate::error::FfiError;
use std::fmt;
use std::rc::Rc;

/// A registered host function. The engine calls it synchronously, on the
/// calling thread, and propagates its error unchanged.
pub type HostFn = Rc<dyn Fn(&[HostValue]) -> Result<HostValue, FfiError>>;

/// A dynamic-host value at the marshaling boundary.
#[derive(Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Host string bytes, not NUL-terminated.
    Str(Rc<[u8]>),
    /// Positional initializer sequence (the host's table/array value).
    Aggregate(Rc<Vec<HostValue>>),
    /// A host function (convertible to a native callback).
    Func(HostFn),
    /// An already-typed native value.
    Cdata(Cdata),
}

impl HostValue {
    pub fn str_from(s: &str) -> HostValue {
        HostValue::Str(Rc::from(s.as_bytes()))
    }

    pub fn aggregate(values: Vec<HostValue>) -> HostValue {
        HostValue::Aggregate(Rc::new(values))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) | HostValue::Float(_) => "number",
            HostValue::Str(_) => "string",
            HostValue::Aggregate(_) => "table",
            HostValue::Func(_) => "function",
            HostValue::Cdata(_) => "cdata",
        }
    }

    /// Truthiness the way the host sees it.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, HostValue::Null | HostValue::Bool(false))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{b}"),
            HostValue::Int(v) => write!(f, "{v}"),
            HostValue::Float(v) => write!(f, "{v}"),
            HostValue::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            HostValue::Aggregate(vs) => f.debug_list().entries(vs.iter()).finish(),
            HostValue::Func(_) => write!(f, "<function>"),
            HostValue::Cdata(cd) => write!(f, "{cd}"),
        }
    }
}
