//! Serialize-then-reparse identity: for any type we can parse, printing it
//! back to C syntax and parsing that text again must produce the same type.

use cbridge_ast::{DeclStore, Declaration, Type, TypeKind};
use cbridge_parser::{parse_decls, parse_type};

/// Parse `input` as a type, print it, reparse the printed form in the same
/// store, and require structural identity.
fn roundtrip(store: &mut DeclStore, input: &str) {
    let first = parse_type(store, input, Vec::new())
        .unwrap_or_else(|e| panic!("parse `{input}`: {e}"));
    let printed = first.to_string();
    let second = parse_type(store, &printed, Vec::new())
        .unwrap_or_else(|e| panic!("reparse `{printed}` (from `{input}`): {e}"));
    assert!(
        first.is_same(&second),
        "`{input}` printed as `{printed}` but reparsed differently"
    );
}

#[test]
fn scalars_with_qualifiers() {
    let mut store = DeclStore::new();
    let scalars = [
        "bool",
        "char",
        "signed char",
        "unsigned char",
        "short",
        "unsigned short",
        "int",
        "unsigned int",
        "long",
        "unsigned long",
        "long long",
        "unsigned long long",
        "int8_t",
        "uint8_t",
        "int16_t",
        "uint16_t",
        "int32_t",
        "uint32_t",
        "int64_t",
        "uint64_t",
        "size_t",
        "ssize_t",
        "intptr_t",
        "uintptr_t",
        "ptrdiff_t",
        "float",
        "double",
        "long double",
        "wchar_t",
        "char16_t",
        "char32_t",
    ];
    let quals = ["", "const ", "volatile ", "const volatile "];
    for scalar in scalars {
        for qual in quals {
            roundtrip(&mut store, &format!("{qual}{scalar}"));
        }
    }
}

#[test]
fn pointers_to_depth_four() {
    let mut store = DeclStore::new();
    for depth in 1..=4 {
        let stars = "*".repeat(depth);
        roundtrip(&mut store, &format!("int {stars}"));
        roundtrip(&mut store, &format!("const char {stars}"));
        roundtrip(&mut store, &format!("void {stars}"));
    }
    roundtrip(&mut store, "int *const *");
    roundtrip(&mut store, "const int *volatile *");
}

#[test]
fn function_pointers_zero_to_eight_params_and_variadic() {
    let mut store = DeclStore::new();
    let param_pool = [
        "int", "float", "double", "char *", "unsigned long", "void *", "short", "int64_t",
    ];
    for n in 0..=8 {
        let params: Vec<&str> = param_pool[..n].to_vec();
        let list = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };
        roundtrip(&mut store, &format!("int (*)({list})"));
        if n > 0 {
            roundtrip(&mut store, &format!("void (*)({}, ...)", params.join(", ")));
        }
    }
}

#[test]
fn arrays() {
    let mut store = DeclStore::new();
    roundtrip(&mut store, "int [4]");
    roundtrip(&mut store, "int [2][3]");
    roundtrip(&mut store, "int [2][3][4]");
    roundtrip(&mut store, "char *[16]");
    roundtrip(&mut store, "int (*)[8]");
    roundtrip(&mut store, "int [?]");
    roundtrip(&mut store, "int []");
    roundtrip(&mut store, "int [?][3]");
}

#[test]
fn records_and_enums_by_name() {
    let mut store = DeclStore::new();
    parse_decls(
        &mut store,
        "struct vec { float x; float y; float z; };
         union pun { int i; float f; };
         struct holder { int tag; struct { int a; short b; }; };
         enum mode { OFF, SLOW = 10, FAST };",
        Vec::new(),
    )
    .unwrap();
    roundtrip(&mut store, "struct vec");
    roundtrip(&mut store, "struct vec *");
    roundtrip(&mut store, "union pun");
    roundtrip(&mut store, "struct holder");
    roundtrip(&mut store, "enum mode");
    roundtrip(&mut store, "enum mode *");
    roundtrip(&mut store, "struct vec [4]");
}

#[test]
fn right_to_left_binding_regression() {
    // f: pointer to function (int) returning pointer to function (float)
    // returning int
    let mut store = DeclStore::new();
    parse_decls(&mut store, "int (*(*f)(int))(float);", Vec::new()).unwrap();
    let Some(Declaration::Variable(parsed)) = store.lookup("f") else {
        panic!("f not declared as a variable");
    };

    // hand-built reference tree
    let inner = cbridge_ast::FuncSig {
        result: Type::int(),
        params: vec![cbridge_ast::Param {
            name: None,
            ty: Type::new(TypeKind::Float),
        }],
        variadic: false,
        convention: cbridge_ast::CallConv::C,
    };
    let outer = cbridge_ast::FuncSig {
        result: Type::new(TypeKind::FunctionPointer(Box::new(inner))),
        params: vec![cbridge_ast::Param {
            name: None,
            ty: Type::int(),
        }],
        variadic: false,
        convention: cbridge_ast::CallConv::C,
    };
    let expected = Type::new(TypeKind::FunctionPointer(Box::new(outer)));

    assert!(
        parsed.is_same(&expected),
        "parsed `{parsed}` does not match the reference tree `{expected}`"
    );

    // and it round-trips through its printed form
    let printed = parsed.display_named("f");
    assert_eq!(printed, "int (*(*f)(int))(float)");
    let mut store2 = DeclStore::new();
    parse_decls(&mut store2, &format!("{printed};"), Vec::new()).unwrap();
    let Some(Declaration::Variable(again)) = store2.lookup("f") else {
        panic!();
    };
    assert!(again.is_same(&expected));
}

#[test]
fn pointer_to_array_of_pointers() {
    let mut store = DeclStore::new();
    parse_decls(&mut store, "char *(*table)[16];", Vec::new()).unwrap();
    let Some(Declaration::Variable(v)) = store.lookup("table") else {
        panic!();
    };
    assert_eq!(v.display_named("table"), "char *(*table)[16]");
    // pointer → array(16) → pointer → char
    let TypeKind::Pointer(arr) = &v.kind else { panic!() };
    let TypeKind::Array(elem, _) = &arr.kind else {
        panic!("pointee is not an array: {arr}")
    };
    assert!(elem.is_pointer());
}
