//! Native-callable closures: a libffi trampoline bound to a registered
//! host function.
//!
//! Several cdata handles may alias one trampoline; the trampoline and its
//! registered host function are freed exactly once, when the last strong
//! handle drops. Variadic callbacks are rejected at construction, because
//! a trampoline cannot recover the caller's trailing argument types.

use crate::call::{decay_param, CallInterface, NativeFunc};
use crate::error::FfiError;
use crate::marshal::{self, ValueCtx};
use crate::value::{HostFn, HostValue};
use cbridge_ast::{FuncSig, Type};
use libffi::low;
use libffi::raw;
use std::ffi::c_void;
use std::rc::Rc;

/// Data the trampoline reads on every native call-in. Boxed so its address
/// is stable for libffi's userdata pointer.
struct ClosureUser {
    host_fn: HostFn,
    arg_decls: Vec<Type>,
    ret_decl: Type,
}

/// One allocated trampoline. Dropping the last `Rc<ClosureData>` frees the
/// native closure and releases the host function reference.
pub(crate) struct ClosureData {
    pub(crate) sig: Rc<FuncSig>,
    pub(crate) code: *mut c_void,
    closure: *mut raw::ffi_closure,
    _user: Box<ClosureUser>,
    _iface: CallInterface,
}

impl ClosureData {
    /// Call the trampoline from the host side, re-entering native code.
    pub(crate) fn invoke_native(&self, args: &[HostValue]) -> Result<HostValue, FfiError> {
        NativeFunc::new(self.sig.clone(), self.code).invoke(args)
    }
}

impl Drop for ClosureData {
    fn drop(&mut self) {
        unsafe { raw::ffi_closure_free(self.closure as *mut c_void) };
    }
}

/// Allocate a trampoline for `sig` bound to `host_fn`.
pub(crate) fn make_closure(
    sig: Rc<FuncSig>,
    host_fn: HostFn,
) -> Result<Rc<ClosureData>, FfiError> {
    if sig.variadic {
        return Err(FfiError::Unsupported(
            "variadic callbacks are not supported".into(),
        ));
    }

    let arg_decls: Vec<Type> = sig.params.iter().map(|p| decay_param(&p.ty)).collect();
    let iface = CallInterface::build(sig.result.clone(), arg_decls.clone(), None)?;
    let user = Box::new(ClosureUser {
        host_fn,
        arg_decls,
        ret_decl: sig.result.clone(),
    });

    let mut code: *mut c_void = std::ptr::null_mut();
    let closure = unsafe {
        raw::ffi_closure_alloc(std::mem::size_of::<raw::ffi_closure>(), &mut code)
    } as *mut raw::ffi_closure;
    if closure.is_null() {
        return Err(FfiError::Unsupported(
            "failed to allocate a closure trampoline".into(),
        ));
    }

    let status = unsafe {
        raw::ffi_prep_closure_loc(
            closure,
            iface.cif_ptr(),
            Some(trampoline),
            &*user as *const ClosureUser as *mut c_void,
            code,
        )
    };
    if status != raw::ffi_status_FFI_OK {
        unsafe { raw::ffi_closure_free(closure as *mut c_void) };
        return Err(FfiError::Unsupported(format!(
            "libffi rejected the callback signature (status {status})"
        )));
    }

    Ok(Rc::new(ClosureData {
        sig,
        code,
        closure,
        _user: user,
        _iface: iface,
    }))
}

/// The native entry point. Converts native arguments to host values, runs
/// the host function, and writes the converted result back. A failing host
/// function yields a zeroed result; the error cannot cross the native
/// frame.
unsafe extern "C" fn trampoline(
    _cif: *mut low::ffi_cif,
    result: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let user = &*(userdata as *const ClosureUser);

    // integral results are widened to a full register slot by convention;
    // start from zero so failure paths return 0
    let ret_size = user.ret_decl.size().unwrap_or(0);
    if !user.ret_decl.is_void() {
        std::ptr::write_bytes(
            result as *mut u8,
            0,
            ret_size.max(std::mem::size_of::<usize>()),
        );
    }

    let mut host_args = Vec::with_capacity(user.arg_decls.len());
    for (idx, decl) in user.arg_decls.iter().enumerate() {
        let src = *args.add(idx) as *const u8;
        match marshal::from_native(src, decl, ValueCtx::NewValue, None) {
            Ok(value) => host_args.push(value),
            Err(_) => return,
        }
    }

    let Ok(value) = (user.host_fn)(&host_args) else {
        return;
    };
    write_result(&value, &user.ret_decl, result);
}

/// Write a host value as a native closure result, following libffi's
/// convention of widening sub-register integers to a full `ffi_arg`.
fn write_result(value: &HostValue, ret: &Type, result: *mut c_void) {
    if ret.is_void() {
        return;
    }
    if ret.is_integer() || ret.is_bool() {
        let bits = match value {
            HostValue::Bool(b) => *b as i64,
            HostValue::Int(v) => *v,
            HostValue::Float(v) => *v as i64,
            _ => return,
        };
        unsafe { (result as *mut u64).write(bits as u64) };
        return;
    }
    let mut keep = Vec::new();
    let _ = marshal::to_native(value, ret, result as *mut u8, &mut keep);
    // `keep` dies here: a callback result that needs marshaled temporaries
    // (e.g. a string turned into char*) cannot outlive the native frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbridge_ast::{CallConv, Param, TypeKind};
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    fn int_binop_sig() -> Rc<FuncSig> {
        Rc::new(FuncSig {
            result: Type::int(),
            params: vec![
                Param {
                    name: None,
                    ty: Type::int(),
                },
                Param {
                    name: None,
                    ty: Type::int(),
                },
            ],
            variadic: false,
            convention: CallConv::C,
        })
    }

    #[test]
    fn native_code_calls_back_into_the_host() {
        let sig = int_binop_sig();
        let host: HostFn = Rc::new(|args| {
            let a = args[0].as_int().unwrap();
            let b = args[1].as_int().unwrap();
            Ok(HostValue::Int(a + b))
        });
        let cl = make_closure(sig, host).unwrap();

        // call the trampoline directly through its code pointer
        let f: extern "C" fn(libc::c_int, libc::c_int) -> libc::c_int =
            unsafe { std::mem::transmute(cl.code) };
        assert_eq!(f(20, 22), 42);
        assert_eq!(f(-1, 1), 0);
    }

    #[test]
    fn variadic_callback_is_rejected() {
        let mut sig = (*int_binop_sig()).clone();
        sig.variadic = true;
        let host: HostFn = Rc::new(|_| Ok(HostValue::Null));
        let err = make_closure(Rc::new(sig), host);
        assert!(matches!(err, Err(FfiError::Unsupported(_))));
    }

    #[test]
    fn failing_host_function_returns_zero() {
        let sig = int_binop_sig();
        let host: HostFn = Rc::new(|_| {
            Err(FfiError::Callback("deliberate".into()))
        });
        let cl = make_closure(sig, host).unwrap();
        let f: extern "C" fn(libc::c_int, libc::c_int) -> libc::c_int =
            unsafe { std::mem::transmute(cl.code) };
        assert_eq!(f(1, 2), 0);
    }

    #[test]
    fn aliasing_handles_free_once() {
        // a host fn that observes its own drop through an Rc guard
        struct DropFlag(Rc<Cell<bool>>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let guard = DropFlag(dropped.clone());
        let host: HostFn = Rc::new(move |_| {
            let _ = &guard;
            Ok(HostValue::Int(0))
        });

        let cl = make_closure(int_binop_sig(), host).unwrap();
        let aliases: Vec<Rc<ClosureData>> = (0..4).map(|_| cl.clone()).collect();

        drop(cl);
        for alias in aliases {
            assert!(!dropped.get(), "trampoline released too early");
            drop(alias);
        }
        assert!(dropped.get(), "host function reference was not released");
    }
}
