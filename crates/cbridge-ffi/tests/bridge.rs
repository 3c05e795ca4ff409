//! End-to-end: declarations parsed at runtime driving real native calls
//! through libc, including callbacks into host code.

use cbridge_ffi::{Bridge, HostFn, HostValue, NativeLibrary};
use pretty_assertions::assert_eq;
use std::rc::Rc;

#[test]
fn qsort_calls_back_into_the_host() {
    let mut bridge = Bridge::new();
    bridge
        .cdef(
            "typedef int (*cmp_fn)(const void *, const void *);
             void qsort(void *base, size_t nmemb, size_t size, cmp_fn compar);",
            Vec::new(),
        )
        .unwrap();

    let arr = bridge
        .new_value(
            "int[5]",
            &[
                HostValue::Int(3),
                HostValue::Int(1),
                HostValue::Int(4),
                HostValue::Int(1),
                HostValue::Int(5),
            ],
        )
        .unwrap();

    // the comparator receives two const void*; read them as int*
    let cmp: HostFn = Rc::new(|args| {
        let read = |v: &HostValue| -> i64 {
            let HostValue::Cdata(p) = v else { panic!("expected pointer") };
            let addr = p.address() as *const libc::c_int;
            unsafe { addr.read() as i64 }
        };
        let a = read(&args[0]);
        let b = read(&args[1]);
        Ok(HostValue::Int((a - b).signum()))
    });

    let lib = NativeLibrary::open_self().unwrap();
    bridge
        .call_symbol(
            &lib,
            "qsort",
            &[
                HostValue::Cdata(arr.clone()),
                HostValue::Int(5),
                HostValue::Int(std::mem::size_of::<libc::c_int>() as i64),
                HostValue::Func(cmp),
            ],
        )
        .unwrap();

    let sorted: Vec<i64> = (0..5)
        .map(|i| arr.get(&HostValue::Int(i)).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(sorted, vec![1, 1, 3, 4, 5]);
}

#[test]
fn variadic_snprintf_through_declarations() {
    let mut bridge = Bridge::new();
    bridge
        .cdef(
            "int snprintf(char *str, size_t size, const char *format, ...);",
            Vec::new(),
        )
        .unwrap();
    let lib = NativeLibrary::open_self().unwrap();

    let buf = bridge.new_value("char[64]", &[]).unwrap();
    let n = bridge
        .call_symbol(
            &lib,
            "snprintf",
            &[
                HostValue::Cdata(buf.clone()),
                HostValue::Int(64),
                HostValue::str_from("%s=%d"),
                HostValue::str_from("answer"),
                HostValue::Int(42),
            ],
        )
        .unwrap();
    assert_eq!(n.as_int(), Some(9));

    let mut text = Vec::new();
    for i in 0.. {
        let b = buf.get(&HostValue::Int(i)).unwrap().as_int().unwrap();
        if b == 0 {
            break;
        }
        text.push(b as u8);
    }
    assert_eq!(text, b"answer=42");
}

#[test]
fn struct_round_trip_through_native_memory() {
    let mut bridge = Bridge::new();
    bridge
        .cdef(
            "struct pair { int lo; int hi; };
             void *memcpy(void *dest, const void *src, size_t n);",
            Vec::new(),
        )
        .unwrap();
    let lib = NativeLibrary::open_self().unwrap();

    let src = bridge
        .new_value(
            "struct pair",
            &[HostValue::aggregate(vec![
                HostValue::Int(11),
                HostValue::Int(22),
            ])],
        )
        .unwrap();
    let dst = bridge.new_value("struct pair", &[]).unwrap();
    let size = bridge.sizeof("struct pair", None).unwrap();

    bridge
        .call_symbol(
            &lib,
            "memcpy",
            &[
                HostValue::Cdata(dst.clone()),
                HostValue::Cdata(src),
                HostValue::Int(size as i64),
            ],
        )
        .unwrap();

    assert_eq!(
        bridge
            .index(&dst, &HostValue::str_from("lo"))
            .unwrap()
            .as_int(),
        Some(11)
    );
    assert_eq!(
        bridge
            .index(&dst, &HostValue::str_from("hi"))
            .unwrap()
            .as_int(),
        Some(22)
    );
}

#[test]
fn failed_cdef_is_atomic_through_the_bridge() {
    let mut bridge = Bridge::new();
    let err = bridge.cdef("int a; bad!syntax; int b;", Vec::new());
    assert!(err.is_err());
    assert!(bridge.store().lookup("a").is_none());
    assert!(bridge.store().lookup("b").is_none());

    // and a later clean parse still works
    bridge.cdef("int a;", Vec::new()).unwrap();
    assert!(bridge.store().lookup("a").is_some());
}

#[test]
fn out_parameters_come_back_typed() {
    let mut bridge = Bridge::new();
    bridge
        .cdef("double modf(double x, double *iptr);", Vec::new())
        .unwrap();
    let lib = NativeLibrary::open_self().unwrap();

    let ipart = bridge.new_value("double[1]", &[]).unwrap();
    let frac = bridge
        .call_symbol(
            &lib,
            "modf",
            &[HostValue::Float(3.25), HostValue::Cdata(ipart.clone())],
        )
        .unwrap();
    let HostValue::Float(frac) = frac else { panic!() };
    assert_eq!(frac, 0.25);
    let HostValue::Float(int_part) = ipart.get(&HostValue::Int(0)).unwrap() else {
        panic!();
    };
    assert_eq!(int_part, 3.0);
}
