//! Native call execution.
//!
//! A [`CallInterface`] wraps a prepared `ffi_cif` plus the declared (or
//! inferred) argument types. Non-variadic interfaces are built once per
//! function cdata and cached; variadic calls rebuild the interface every
//! time, because each invocation may carry a different trailing signature
//! inferred from the values' runtime tags. Argument bytes are marshaled
//! into per-function scratch slots that grow to the high-water mark of
//! arguments seen.

use crate::cdata::{AlignedBuf, Keep};
use crate::desc::ffi_type_of;
use crate::error::FfiError;
use crate::marshal::{self, ValueCtx};
use crate::value::HostValue;
use cbridge_ast::{FuncSig, Type, TypeKind};
use libffi::low::{self, CodePtr};
use libffi::middle::Type as FfiType;
use libffi::raw;
use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

/// A prepared libffi call descriptor and the argument/return types it was
/// built from. The raw cif points into the vectors held here, so the
/// struct must stay alive for as long as the cif is used.
pub(crate) struct CallInterface {
    cif: Box<low::ffi_cif>,
    raw_args: Vec<*mut low::ffi_type>,
    _arg_types: Vec<FfiType>,
    _ret_type: FfiType,
    pub(crate) arg_decls: Vec<Type>,
    pub(crate) ret_decl: Type,
}

impl CallInterface {
    /// Prepare a cif. `nfixed` marks the fixed-argument count of a
    /// variadic signature; `None` builds a plain call.
    pub(crate) fn build(
        ret_decl: Type,
        arg_decls: Vec<Type>,
        nfixed: Option<usize>,
    ) -> Result<CallInterface, FfiError> {
        let ret_type = ffi_type_of(&ret_decl)?;
        let arg_types: Vec<FfiType> = arg_decls
            .iter()
            .map(ffi_type_of)
            .collect::<Result<_, _>>()?;
        let mut raw_args: Vec<*mut low::ffi_type> =
            arg_types.iter().map(|t| t.as_raw_ptr()).collect();

        let mut cif: Box<low::ffi_cif> = Box::new(unsafe { std::mem::zeroed() });
        let prepped = unsafe {
            match nfixed {
                None => low::prep_cif(
                    &mut *cif,
                    low::ffi_abi_FFI_DEFAULT_ABI,
                    raw_args.len(),
                    ret_type.as_raw_ptr(),
                    raw_args.as_mut_ptr(),
                ),
                Some(fixed) => low::prep_cif_var(
                    &mut *cif,
                    low::ffi_abi_FFI_DEFAULT_ABI,
                    fixed,
                    raw_args.len(),
                    ret_type.as_raw_ptr(),
                    raw_args.as_mut_ptr(),
                ),
            }
        };
        prepped.map_err(|e| {
            FfiError::Unsupported(format!("libffi rejected the signature: {e:?}"))
        })?;

        Ok(CallInterface {
            cif,
            raw_args,
            _arg_types: arg_types,
            _ret_type: ret_type,
            arg_decls,
            ret_decl,
        })
    }

    pub(crate) fn cif_ptr(&self) -> *mut low::ffi_cif {
        &*self.cif as *const low::ffi_cif as *mut low::ffi_cif
    }

    pub(crate) fn arg_count(&self) -> usize {
        self.raw_args.len()
    }
}

/// Per-function marshaling scratch, reused across calls and grown to the
/// largest argument list seen.
#[derive(Default)]
pub(crate) struct Scratch {
    slots: Vec<AlignedBuf>,
}

impl Scratch {
    fn slot(&mut self, idx: usize, size: usize, align: usize) -> *mut u8 {
        debug_assert!(idx <= self.slots.len());
        if idx < self.slots.len() {
            let existing = &self.slots[idx];
            if existing.len() >= size && existing.align() >= align {
                unsafe { std::ptr::write_bytes(existing.as_ptr(), 0, size) };
                return existing.as_ptr();
            }
            self.slots[idx] = AlignedBuf::zeroed(size, align);
            return self.slots[idx].as_ptr();
        }
        self.slots.push(AlignedBuf::zeroed(size, align));
        self.slots.last().expect("just pushed").as_ptr()
    }
}

/// A resolved native function: declared signature plus code address.
pub(crate) struct NativeFunc {
    pub(crate) sig: Rc<FuncSig>,
    pub(crate) code: *mut c_void,
    cached: RefCell<Option<Rc<CallInterface>>>,
    scratch: RefCell<Scratch>,
}

impl NativeFunc {
    pub(crate) fn new(sig: Rc<FuncSig>, code: *mut c_void) -> NativeFunc {
        NativeFunc {
            sig,
            code,
            cached: RefCell::new(None),
            scratch: RefCell::new(Scratch::default()),
        }
    }

    pub(crate) fn invoke(&self, args: &[HostValue]) -> Result<HostValue, FfiError> {
        let fixed = self.sig.params.len();
        if args.len() < fixed || (args.len() > fixed && !self.sig.variadic) {
            return Err(FfiError::Arity {
                expected: fixed,
                variadic: self.sig.variadic,
                got: args.len(),
            });
        }

        let iface = if self.sig.variadic {
            // rebuilt per call: the trailing signature is value-dependent
            let mut decls: Vec<Type> = self
                .sig
                .params
                .iter()
                .map(|p| decay_param(&p.ty))
                .collect();
            for value in &args[fixed..] {
                decls.push(variadic_decl(value)?);
            }
            Rc::new(CallInterface::build(
                self.sig.result.clone(),
                decls,
                Some(fixed),
            )?)
        } else {
            let mut cached = self.cached.borrow_mut();
            match &*cached {
                Some(iface) => iface.clone(),
                None => {
                    let decls = self.sig.params.iter().map(|p| decay_param(&p.ty)).collect();
                    let iface =
                        Rc::new(CallInterface::build(self.sig.result.clone(), decls, None)?);
                    *cached = Some(iface.clone());
                    iface
                }
            }
        };
        debug_assert_eq!(iface.arg_count(), args.len());

        // take the scratch out for the duration of the call, so a callback
        // re-entering this same function allocates its own instead of
        // clobbering our argument bytes (or panicking on the borrow)
        let mut scratch = std::mem::take(&mut *self.scratch.borrow_mut());

        let mut keep: Vec<Keep> = Vec::new();
        let mut arg_ptrs: Vec<*mut c_void> = Vec::with_capacity(args.len());
        for (idx, value) in args.iter().enumerate() {
            let decl = &iface.arg_decls[idx];
            let marshaled = decl
                .size()
                .map_err(FfiError::from)
                .and_then(|size| Ok((size, decl.align()?)))
                .and_then(|(size, align)| {
                    let slot = scratch.slot(idx, size.max(8), align.max(8));
                    marshal::to_native(value, decl, slot, &mut keep)?;
                    Ok(slot)
                });
            match marshaled {
                Ok(slot) => arg_ptrs.push(slot as *mut c_void),
                Err(err) => {
                    *self.scratch.borrow_mut() = scratch;
                    return Err(err);
                }
            }
        }

        let code = CodePtr(self.code);
        let cif = iface.cif_ptr();
        let argv = arg_ptrs.as_mut_ptr();
        let ret = &iface.ret_decl;

        // the call itself; `keep` holds every temporary alive across it
        let result = unsafe { invoke_with_return(cif, code, argv, ret) };
        drop(keep);
        // the deepest call to put its (high-water) scratch back wins
        *self.scratch.borrow_mut() = scratch;
        result
    }
}

/// Perform the prepared call and convert the native return value.
///
/// # Safety
/// `cif`/`argv` must describe a valid prepared call for `code`.
unsafe fn invoke_with_return(
    cif: *mut low::ffi_cif,
    code: CodePtr,
    argv: *mut *mut c_void,
    ret: &Type,
) -> Result<HostValue, FfiError> {
    use TypeKind::*;
    match &ret.kind {
        Void => {
            low::call::<()>(cif, code, argv);
            Ok(HostValue::Null)
        }
        Bool => {
            let v: u8 = low::call(cif, code, argv);
            Ok(HostValue::Bool(v != 0))
        }
        Float => {
            let v: f32 = low::call(cif, code, argv);
            Ok(HostValue::Float(v as f64))
        }
        Double => {
            let v: f64 = low::call(cif, code, argv);
            Ok(HostValue::Float(v))
        }
        Enum(_) => {
            let v: i32 = low::call(cif, code, argv);
            Ok(HostValue::Int(v as i64))
        }
        Pointer(_) | Reference(_) | FunctionPointer(_) => {
            let addr: usize = low::call(cif, code, argv);
            let bytes = addr.to_ne_bytes();
            marshal::from_native(bytes.as_ptr(), ret, ValueCtx::NewValue, None)
        }
        Record(_) => {
            // struct returns go through ffi_call into caller-owned bytes
            let size = ret.size()?.max(std::mem::size_of::<usize>());
            let buf = AlignedBuf::zeroed(size, ret.align()?.max(8));
            raw::ffi_call(
                cif,
                Some(std::mem::transmute::<
                    *mut c_void,
                    unsafe extern "C" fn(),
                >(code.0)),
                buf.as_ptr() as *mut c_void,
                argv,
            );
            marshal::from_native(buf.as_ptr(), ret, ValueCtx::NewValue, None)
        }
        _ if ret.is_integer() => {
            let signed = ret.is_signed_integer();
            let value = match (ret.size()?, signed) {
                (1, true) => low::call::<i8>(cif, code, argv) as i64,
                (1, false) => low::call::<u8>(cif, code, argv) as i64,
                (2, true) => low::call::<i16>(cif, code, argv) as i64,
                (2, false) => low::call::<u16>(cif, code, argv) as i64,
                (4, true) => low::call::<i32>(cif, code, argv) as i64,
                (4, false) => low::call::<u32>(cif, code, argv) as i64,
                (8, true) => low::call::<i64>(cif, code, argv),
                (8, false) => {
                    let v: u64 = low::call(cif, code, argv);
                    if v > i64::MAX as u64 {
                        // box instead of truncating
                        let bytes = v.to_ne_bytes();
                        return marshal::from_native(
                            bytes.as_ptr(),
                            ret,
                            ValueCtx::NewValue,
                            None,
                        );
                    }
                    v as i64
                }
                (n, _) => {
                    return Err(FfiError::Unsupported(format!(
                        "integer return of width {n} bytes"
                    )))
                }
            };
            Ok(HostValue::Int(value))
        }
        _ => Err(FfiError::Unsupported(format!(
            "cannot return values of type `{ret}`"
        ))),
    }
}

/// Parameter decay at call time: arrays pass as a pointer to their element,
/// bare functions as function pointers.
pub(crate) fn decay_param(ty: &Type) -> Type {
    match &ty.kind {
        TypeKind::Array(elem, _) => Type::pointer_to((**elem).clone()),
        TypeKind::Function(sig) => Type::new(TypeKind::FunctionPointer(sig.clone())),
        _ => ty.clone(),
    }
}

/// Infer the native type of a trailing variadic argument from the value's
/// runtime tag, applying the default argument promotions.
fn variadic_decl(value: &HostValue) -> Result<Type, FfiError> {
    Ok(match value {
        HostValue::Null => Type::pointer_to(Type::void()),
        HostValue::Bool(_) => Type::int(),
        HostValue::Int(v) => {
            if *v >= i32::MIN as i64 && *v <= i32::MAX as i64 {
                Type::int()
            } else {
                Type::new(TypeKind::I64)
            }
        }
        HostValue::Float(_) => Type::new(TypeKind::Double),
        HostValue::Str(_) => Type::pointer_to(Type::qualified(
            TypeKind::Char,
            cbridge_ast::Qualifiers::CONST,
        )),
        HostValue::Cdata(cd) => {
            let ty = cd.ty();
            match &ty.kind {
                // by-value records in variadic slots pass by address
                TypeKind::Record(_) => Type::pointer_to(ty.clone()),
                TypeKind::Array(elem, _) => Type::pointer_to((**elem).clone()),
                TypeKind::Float => Type::new(TypeKind::Double),
                _ if ty.is_integer() && ty.size()? < 4 => Type::int(),
                _ => ty.unqualified(),
            }
        }
        HostValue::Func(_) => {
            return Err(FfiError::Unsupported(
                "an untyped function cannot be passed through `...`".into(),
            ))
        }
        HostValue::Aggregate(_) => {
            return Err(FfiError::conversion(
                "table",
                "...",
                "aggregates cannot be passed through `...`",
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::NativeLibrary;
    use pretty_assertions::assert_eq;

    fn libc_fn(name: &str, decl_sig: FuncSig) -> NativeFunc {
        let lib = NativeLibrary::open_self().expect("open self");
        let code = lib.symbol(name).expect(name);
        // the process stays loaded; leaking the handle keeps the symbol valid
        std::mem::forget(lib);
        NativeFunc::new(Rc::new(decl_sig), code)
    }

    fn sig(result: Type, params: Vec<Type>, variadic: bool) -> FuncSig {
        FuncSig {
            result,
            params: params
                .into_iter()
                .map(|ty| cbridge_ast::Param { name: None, ty })
                .collect(),
            variadic,
            convention: cbridge_ast::CallConv::C,
        }
    }

    #[test]
    fn plain_scalar_call() {
        // int abs(int)
        let f = libc_fn("abs", sig(Type::int(), vec![Type::int()], false));
        let r = f.invoke(&[HostValue::Int(-5)]).unwrap();
        assert_eq!(r.as_int(), Some(5));
    }

    #[test]
    fn string_argument_call() {
        // size_t strlen(const char *)
        let f = libc_fn(
            "strlen",
            sig(
                Type::new(TypeKind::Size),
                vec![Type::pointer_to(Type::qualified(
                    TypeKind::Char,
                    cbridge_ast::Qualifiers::CONST,
                ))],
                false,
            ),
        );
        let r = f.invoke(&[HostValue::str_from("hello")]).unwrap();
        assert_eq!(r.as_int(), Some(5));
    }

    #[test]
    fn double_call() {
        // double fabs(double)
        let f = libc_fn(
            "fabs",
            sig(
                Type::new(TypeKind::Double),
                vec![Type::new(TypeKind::Double)],
                false,
            ),
        );
        let HostValue::Float(v) = f.invoke(&[HostValue::Float(-2.5)]).unwrap() else {
            panic!();
        };
        assert_eq!(v, 2.5);
    }

    #[test]
    fn variadic_descriptor_rebuilds_per_call() {
        // int snprintf(char *, size_t, const char *, ...)
        let char_ptr = Type::pointer_to(Type::new(TypeKind::Char));
        let const_char_ptr = Type::pointer_to(Type::qualified(
            TypeKind::Char,
            cbridge_ast::Qualifiers::CONST,
        ));
        let f = libc_fn(
            "snprintf",
            sig(
                Type::int(),
                vec![char_ptr, Type::new(TypeKind::Size), const_char_ptr],
                true,
            ),
        );

        let buf = marshal::construct(
            &Type::array_of(Type::new(TypeKind::Char), cbridge_ast::ArrayLen::Fixed(128)),
            &[],
        )
        .unwrap();
        let out = |cd: &crate::cdata::Cdata| -> String {
            let ptr = cd.storage_ptr().unwrap();
            let mut bytes = Vec::new();
            let mut i = 0;
            loop {
                let b = unsafe { ptr.add(i).read() };
                if b == 0 {
                    break;
                }
                bytes.push(b);
                i += 1;
            }
            String::from_utf8(bytes).unwrap()
        };

        // zero trailing arguments
        let r = f
            .invoke(&[
                HostValue::Cdata(buf.clone()),
                HostValue::Int(128),
                HostValue::str_from("plain"),
            ])
            .unwrap();
        assert_eq!(r.as_int(), Some(5));
        assert_eq!(out(&buf), "plain");

        // one trailing argument
        f.invoke(&[
            HostValue::Cdata(buf.clone()),
            HostValue::Int(128),
            HostValue::str_from("%d"),
            HostValue::Int(42),
        ])
        .unwrap();
        assert_eq!(out(&buf), "42");

        // five trailing arguments of mixed kinds
        f.invoke(&[
            HostValue::Cdata(buf.clone()),
            HostValue::Int(128),
            HostValue::str_from("%d %s %g %d %s"),
            HostValue::Int(1),
            HostValue::str_from("two"),
            HostValue::Float(3.5),
            HostValue::Int(4),
            HostValue::str_from("five"),
        ])
        .unwrap();
        assert_eq!(out(&buf), "1 two 3.5 4 five");
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let f = libc_fn("abs", sig(Type::int(), vec![Type::int()], false));
        assert!(matches!(
            f.invoke(&[]),
            Err(FfiError::Arity { expected: 1, .. })
        ));
        assert!(f
            .invoke(&[HostValue::Int(1), HostValue::Int(2)])
            .is_err());
    }
}
