//! Layout must match what the platform C compiler would produce; `#[repr(C)]`
//! mirrors give us the compiler's own answers to compare against.

use cbridge_ast::{ArrayLen, FieldDef, Record, Type, TypeKind};
use pretty_assertions::assert_eq;
use smol_str::SmolStr;
use std::mem;

fn field(name: &str, ty: Type) -> FieldDef {
    FieldDef {
        name: SmolStr::new(name),
        ty,
        bit_width: None,
    }
}

#[test]
fn mixed_scalar_struct() {
    #[repr(C)]
    struct Mirror {
        a: libc::c_char,
        b: f64,
        c: libc::c_short,
        d: *const libc::c_void,
    }

    let rec = Record::new(SmolStr::new("mixed"), false);
    rec.set_fields(vec![
        field("a", Type::new(TypeKind::Char)),
        field("b", Type::new(TypeKind::Double)),
        field("c", Type::new(TypeKind::Short)),
        field("d", Type::pointer_to(Type::void())),
    ])
    .unwrap();

    let layout = rec.layout().unwrap();
    assert_eq!(layout.size, mem::size_of::<Mirror>());
    assert_eq!(layout.align, mem::align_of::<Mirror>());
    assert_eq!(rec.find_field("b").unwrap().offset, mem::offset_of!(Mirror, b));
    assert_eq!(rec.find_field("c").unwrap().offset, mem::offset_of!(Mirror, c));
    assert_eq!(rec.find_field("d").unwrap().offset, mem::offset_of!(Mirror, d));
}

#[test]
fn union_with_double_and_int() {
    #[repr(C)]
    union Mirror {
        i: libc::c_int,
        d: f64,
    }

    let rec = Record::new(SmolStr::new("u"), true);
    rec.set_fields(vec![
        field("i", Type::int()),
        field("d", Type::new(TypeKind::Double)),
    ])
    .unwrap();

    let layout = rec.layout().unwrap();
    assert_eq!(layout.size, mem::size_of::<Mirror>());
    assert_eq!(layout.align, mem::align_of::<Mirror>());
    assert_eq!(rec.find_field("i").unwrap().offset, 0);
    assert_eq!(rec.find_field("d").unwrap().offset, 0);
}

#[test]
fn trailing_flexible_array_member() {
    // struct { uint32_t len; uint16_t data[]; }
    #[repr(C)]
    struct Mirror {
        len: u32,
        // flexible tail omitted: sizeof ignores it
    }

    let rec = Record::new(SmolStr::new("flex"), false);
    rec.set_fields(vec![
        field("len", Type::new(TypeKind::U32)),
        field(
            "data",
            Type::array_of(Type::new(TypeKind::U16), ArrayLen::Flexible),
        ),
    ])
    .unwrap();

    let layout = rec.layout().unwrap().clone();
    assert!(layout.flexible);
    assert_eq!(layout.size, mem::size_of::<Mirror>());
    assert_eq!(rec.find_field("data").unwrap().offset, 4);

    // allocation size with 3 tail elements: header + 3*2, aligned
    let ty = Type::new(TypeKind::Record(std::rc::Rc::new(rec)));
    let with_tail = ty.size_with_count(3).unwrap();
    assert_eq!(with_tail % layout.align, 0);
    assert!(with_tail >= layout.size + 3 * 2);
}

#[test]
fn nested_struct_alignment_propagates() {
    #[repr(C)]
    struct Inner {
        x: f64,
        y: libc::c_char,
    }
    #[repr(C)]
    struct Outer {
        tag: libc::c_char,
        inner: Inner,
    }

    let inner = std::rc::Rc::new(Record::new(SmolStr::new("inner"), false));
    inner
        .set_fields(vec![
            field("x", Type::new(TypeKind::Double)),
            field("y", Type::new(TypeKind::Char)),
        ])
        .unwrap();

    let outer = Record::new(SmolStr::new("outer"), false);
    outer
        .set_fields(vec![
            field("tag", Type::new(TypeKind::Char)),
            field("inner", Type::new(TypeKind::Record(inner))),
        ])
        .unwrap();

    let layout = outer.layout().unwrap();
    assert_eq!(layout.size, mem::size_of::<Outer>());
    assert_eq!(
        outer.find_field("inner").unwrap().offset,
        mem::offset_of!(Outer, inner)
    );
}

#[test]
fn array_of_structs() {
    #[repr(C)]
    struct Elem {
        a: libc::c_int,
        b: libc::c_char,
    }

    let rec = std::rc::Rc::new(Record::new(SmolStr::new("elem"), false));
    rec.set_fields(vec![
        field("a", Type::int()),
        field("b", Type::new(TypeKind::Char)),
    ])
    .unwrap();

    let arr = Type::array_of(Type::new(TypeKind::Record(rec)), ArrayLen::Fixed(4));
    assert_eq!(arr.size().unwrap(), 4 * mem::size_of::<Elem>());
}
