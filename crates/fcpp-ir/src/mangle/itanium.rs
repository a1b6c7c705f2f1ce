//! Itanium C++ ABI name mangling.
//!
//! Covers the subset the front-end emits: nested names, builtin type codes,
//! pointers and references, class names, constructors/destructors, and the
//! runtime-support symbols (`_ZTI*` typeinfo, `_ZTV*` vtables). Substitution
//! compression (`S_`, `S0_`) is applied to repeated class-name components,
//! which is what `c++filt` round-trips require for the names we produce.

use fcpp_sem::{RefKind, TypeIndex, TypeKind, TypeRegistry};
use fcpp_util::{StringHandle, StringTable};

use super::{split_qualified, MangleRequest};

/// Mangle a function symbol: `_Z` + (possibly nested) name + parameters.
pub fn mangle_function(
    req: &MangleRequest<'_>,
    types: &TypeRegistry,
    strings: &StringTable,
) -> String {
    let mut out = String::from("_Z");
    let name = strings.view(req.name);

    let mut components: Vec<String> = Vec::new();
    for &p in req.path {
        for part in split_qualified(strings.view(p)) {
            components.push(part.to_string());
        }
    }
    for part in split_qualified(name) {
        components.push(part.to_string());
    }

    let terminal = if req.is_ctor {
        "C1".to_string()
    } else if req.is_dtor {
        "D1".to_string()
    } else {
        source_name(components.last().expect("function has a name"))
    };

    if components.len() > 1 {
        out.push('N');
        // The final component is the function itself; constructors and
        // destructors encode as C1/D1 after their class prefix.
        for part in &components[..components.len() - 1] {
            out.push_str(&source_name(part));
        }
        out.push_str(&terminal);
        out.push('E');
    } else {
        out.push_str(&terminal);
    }

    // Parameters.
    match &types.info(types.canonical(req.fn_ty)).kind {
        TypeKind::Function { params, variadic, .. } => {
            if params.is_empty() && !variadic {
                out.push('v');
            } else {
                let mut subs: Vec<String> = Vec::new();
                for &p in params {
                    out.push_str(&mangle_type(p, types, strings, &mut subs));
                }
                if *variadic {
                    out.push('z');
                }
            }
        }
        _ => out.push('v'),
    }
    out
}

/// Mangle a namespace-scope variable: `_ZN<ns...><name>E` or plain.
pub fn mangle_variable(
    name: StringHandle,
    path: &[StringHandle],
    strings: &StringTable,
) -> String {
    let mut components: Vec<String> = Vec::new();
    for &p in path {
        for part in split_qualified(strings.view(p)) {
            components.push(part.to_string());
        }
    }
    for part in split_qualified(strings.view(name)) {
        components.push(part.to_string());
    }
    if components.len() == 1 {
        return format!("_Z{}", source_name(&components[0]));
    }
    let mut out = String::from("_ZN");
    for part in &components {
        out.push_str(&source_name(part));
    }
    out.push('E');
    out
}

/// `typeinfo for T`: `_ZTI<type>`.
pub fn type_info_symbol(ty: TypeIndex, types: &TypeRegistry, strings: &StringTable) -> String {
    let mut subs = Vec::new();
    format!("_ZTI{}", mangle_type(ty, types, strings, &mut subs))
}

/// `typeinfo name for T`: `_ZTS<type>`.
pub fn type_name_symbol(ty: TypeIndex, types: &TypeRegistry, strings: &StringTable) -> String {
    let mut subs = Vec::new();
    format!("_ZTS{}", mangle_type(ty, types, strings, &mut subs))
}

/// `vtable for T`: `_ZTV<type>`.
pub fn vtable_symbol(ty: TypeIndex, types: &TypeRegistry, strings: &StringTable) -> String {
    let mut subs = Vec::new();
    format!("_ZTV{}", mangle_type(ty, types, strings, &mut subs))
}

/// `<len><chars>` with `$` kept verbatim (instantiation hash suffixes are
/// valid source-name characters to the demangler).
fn source_name(part: &str) -> String {
    format!("{}{}", part.len(), part)
}

/// Encode one type, maintaining the substitution list for class names.
fn mangle_type(
    ty: TypeIndex,
    types: &TypeRegistry,
    strings: &StringTable,
    subs: &mut Vec<String>,
) -> String {
    let canon = types.canonical(ty);
    let b = types.builtins;
    // Distinct builtin spellings share structure; match on identity first.
    if canon == b.char_ {
        return "c".to_string();
    }
    if canon == b.schar {
        return "a".to_string();
    }
    if canon == b.uchar {
        return "h".to_string();
    }
    if canon == b.long {
        return "l".to_string();
    }
    if canon == b.ulong {
        return "m".to_string();
    }
    if canon == b.llong {
        return "x".to_string();
    }
    if canon == b.ullong {
        return "y".to_string();
    }
    match &types.info(canon).kind {
        TypeKind::Void => "v".to_string(),
        TypeKind::Bool => "b".to_string(),
        TypeKind::Int { signed, bits } => match (bits, signed) {
            (8, true) => "a".to_string(),
            (8, false) => "h".to_string(),
            (16, true) => "s".to_string(),
            (16, false) => "t".to_string(),
            (32, true) => "i".to_string(),
            (32, false) => "j".to_string(),
            (64, true) => "l".to_string(),
            (64, false) => "m".to_string(),
            _ => "i".to_string(),
        },
        TypeKind::Float { bits } => {
            if *bits == 32 {
                "f".to_string()
            } else {
                "d".to_string()
            }
        }
        TypeKind::Pointer { pointee } => {
            format!("P{}", mangle_type(*pointee, types, strings, subs))
        }
        TypeKind::Reference { kind, referee } => {
            let prefix = match kind {
                RefKind::LValue => "R",
                RefKind::RValue => "O",
            };
            format!("{prefix}{}", mangle_type(*referee, types, strings, subs))
        }
        TypeKind::Array { element, len } => {
            format!("A{len}_{}", mangle_type(*element, types, strings, subs))
        }
        TypeKind::Function { ret, params, .. } => {
            let mut out = String::from("F");
            out.push_str(&mangle_type(*ret, types, strings, subs));
            if params.is_empty() {
                out.push('v');
            } else {
                for &p in params {
                    out.push_str(&mangle_type(p, types, strings, subs));
                }
            }
            out.push('E');
            out
        }
        TypeKind::Struct { .. } | TypeKind::Enum { .. } => {
            let name = strings.view(types.info(canon).name);
            // Substitution compression for repeated class names.
            if let Some(pos) = subs.iter().position(|s| s == name) {
                return if pos == 0 {
                    "S_".to_string()
                } else {
                    format!("S{}_", pos - 1)
                };
            }
            subs.push(name.to_string());
            let parts = split_qualified(name);
            if parts.len() > 1 {
                let mut out = String::from("N");
                for part in parts {
                    out.push_str(&source_name(part));
                }
                out.push('E');
                out
            } else {
                source_name(name)
            }
        }
        TypeKind::Alias { target } => mangle_type(*target, types, strings, subs),
        TypeKind::Dependent => "i".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (StringTable, TypeRegistry) {
        let mut strings = StringTable::new();
        let types = TypeRegistry::new(&mut strings);
        (strings, types)
    }

    fn req<'a>(
        name: StringHandle,
        path: &'a [StringHandle],
        fn_ty: TypeIndex,
    ) -> MangleRequest<'a> {
        MangleRequest {
            name,
            path,
            fn_ty,
            is_ctor: false,
            is_dtor: false,
            is_extern_c: false,
        }
    }

    #[test]
    fn test_free_function_int_int() {
        // int add(int, int) -> _Z3addii  (verified against c++filt)
        let (mut strings, mut types) = setup();
        let int = types.builtins.int;
        let fn_ty = types.function_type(int, vec![int, int], false, &mut strings);
        let name = strings.intern("add");
        assert_eq!(mangle_function(&req(name, &[], fn_ty), &types, &strings), "_Z3addii");
    }

    #[test]
    fn test_no_parameters_is_v() {
        // int f() -> _Z1fv
        let (mut strings, mut types) = setup();
        let int = types.builtins.int;
        let fn_ty = types.function_type(int, vec![], false, &mut strings);
        let name = strings.intern("f");
        assert_eq!(mangle_function(&req(name, &[], fn_ty), &types, &strings), "_Z1fv");
    }

    #[test]
    fn test_namespaced_function() {
        // void n::run(long) -> _ZN1n3runEl
        let (mut strings, mut types) = setup();
        let void = types.builtins.void;
        let long = types.builtins.long;
        let fn_ty = types.function_type(void, vec![long], false, &mut strings);
        let name = strings.intern("run");
        let ns = strings.intern("n");
        assert_eq!(
            mangle_function(&req(name, &[ns], fn_ty), &types, &strings),
            "_ZN1n3runEl"
        );
    }

    #[test]
    fn test_pointer_and_reference_params() {
        // void f(int*, const int&) -> _Z1fPiRi (cv on the referee is not
        // tracked by the registry)
        let (mut strings, mut types) = setup();
        let void = types.builtins.void;
        let int = types.builtins.int;
        let int_ptr = types.pointer_to(int, &mut strings);
        let int_ref = types.reference_to(int, RefKind::LValue, &mut strings);
        let fn_ty = types.function_type(void, vec![int_ptr, int_ref], false, &mut strings);
        let name = strings.intern("f");
        assert_eq!(
            mangle_function(&req(name, &[], fn_ty), &types, &strings),
            "_Z1fPiRi"
        );
    }

    #[test]
    fn test_ctor_dtor() {
        let (mut strings, mut types) = setup();
        let void = types.builtins.void;
        let int = types.builtins.int;
        let fn_ty = types.function_type(void, vec![int], false, &mut strings);
        let name = strings.intern("Point");
        let class = strings.intern("Point");
        let mut r = req(name, std::slice::from_ref(&class), fn_ty);
        r.is_ctor = true;
        assert_eq!(mangle_function(&r, &types, &strings), "_ZN5PointC1Ei");
        r.is_ctor = false;
        r.is_dtor = true;
        let fn_void = types.function_type(void, vec![], false, &mut strings);
        r.fn_ty = fn_void;
        assert_eq!(mangle_function(&r, &types, &strings), "_ZN5PointD1Ev");
    }

    #[test]
    fn test_typeinfo_symbols() {
        let (strings, types) = setup();
        assert_eq!(type_info_symbol(types.builtins.int, &types, &strings), "_ZTIi");
        assert_eq!(
            type_info_symbol(types.builtins.double, &types, &strings),
            "_ZTId"
        );
    }

    #[test]
    fn test_variable_in_namespace() {
        let mut strings = StringTable::new();
        let name = strings.intern("counter");
        let ns = strings.intern("stats");
        assert_eq!(
            mangle_variable(name, &[ns], &strings),
            "_ZN5stats7counterE"
        );
    }

    #[test]
    fn test_class_substitution() {
        // void take(P, P) repeats the class: second occurrence is S_.
        let (mut strings, mut types) = setup();
        let void = types.builtins.void;
        let name = strings.intern("P");
        let id = types.structs.push(Default::default());
        let p_ty = types.register_named(
            name,
            fcpp_sem::TypeInfo {
                name,
                kind: TypeKind::Struct { id },
                size_bits: 32,
                align_bits: 32,
                is_incomplete_instantiation: false,
            },
        );
        let fn_ty = types.function_type(void, vec![p_ty, p_ty], false, &mut strings);
        let f = strings.intern("take");
        assert_eq!(
            mangle_function(&req(f, &[], fn_ty), &types, &strings),
            "_Z4take1PS_"
        );
    }
}
