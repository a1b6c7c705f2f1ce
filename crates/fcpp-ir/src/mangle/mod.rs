//! C++ name mangling.
//!
//! Two independent schemes behind one entry point: Itanium for the SysV
//! target, the MSVC scheme for Win64. The AST and IR are target-neutral;
//! the scheme is picked when a function is lowered.
//!
//! `main` and `extern "C"` functions keep their plain names under both
//! schemes.

pub mod itanium;
pub mod msvc;

use fcpp_sem::{TypeIndex, TypeRegistry};
use fcpp_util::{StringHandle, StringTable};

use crate::ir::Target;

/// Inputs to function-symbol mangling.
pub struct MangleRequest<'a> {
    /// Unqualified function name.
    pub name: StringHandle,
    /// Enclosing namespace/class components, outermost first.
    pub path: &'a [StringHandle],
    /// Function type (registry `Function` kind).
    pub fn_ty: TypeIndex,
    pub is_ctor: bool,
    pub is_dtor: bool,
    /// Plain (unmangled) symbol.
    pub is_extern_c: bool,
}

/// Mangle a function symbol for the target.
pub fn mangle_function(
    req: &MangleRequest<'_>,
    types: &TypeRegistry,
    strings: &StringTable,
    target: Target,
) -> String {
    let name = strings.view(req.name);
    if req.is_extern_c || name == "main" {
        return name.to_string();
    }
    match target {
        Target::Linux64 => itanium::mangle_function(req, types, strings),
        Target::Win64 => msvc::mangle_function(req, types, strings),
    }
}

/// Mangle a global variable symbol.
pub fn mangle_global(
    name: StringHandle,
    path: &[StringHandle],
    target: Target,
    strings: &StringTable,
) -> String {
    let spelled = strings.view(name);
    if path.is_empty() && !spelled.contains("::") {
        // Namespace-free globals keep their plain name (C compatibility).
        return spelled.to_string();
    }
    match target {
        Target::Linux64 => itanium::mangle_variable(name, path, strings),
        Target::Win64 => msvc::mangle_variable(name, path, strings),
    }
}

/// `typeinfo` symbol for a type (`_ZTIi` / MSVC type descriptor name).
pub fn type_info_symbol(ty: TypeIndex, types: &TypeRegistry, strings: &StringTable, target: Target) -> String {
    match target {
        Target::Linux64 => itanium::type_info_symbol(ty, types, strings),
        Target::Win64 => msvc::type_descriptor_symbol(ty, types, strings),
    }
}

/// Vtable symbol for a class.
pub fn vtable_symbol(ty: TypeIndex, types: &TypeRegistry, strings: &StringTable, target: Target) -> String {
    match target {
        Target::Linux64 => itanium::vtable_symbol(ty, types, strings),
        Target::Win64 => msvc::vftable_symbol(ty, types, strings),
    }
}

/// Split a possibly qualified spelling (`ns::name`) into components.
pub(crate) fn split_qualified<'s>(spelled: &'s str) -> Vec<&'s str> {
    spelled.split("::").filter(|c| !c.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcpp_sem::TypeRegistry;
    use fcpp_util::StringTable;

    #[test]
    fn test_main_is_never_mangled() {
        let mut strings = StringTable::new();
        let mut types = TypeRegistry::new(&mut strings);
        let int = types.builtins.int;
        let fn_ty = types.function_type(int, vec![], false, &mut strings);
        let name = strings.intern("main");
        let req = MangleRequest {
            name,
            path: &[],
            fn_ty,
            is_ctor: false,
            is_dtor: false,
            is_extern_c: false,
        };
        assert_eq!(mangle_function(&req, &types, &strings, Target::Linux64), "main");
        assert_eq!(mangle_function(&req, &types, &strings, Target::Win64), "main");
    }

    #[test]
    fn test_extern_c_plain() {
        let mut strings = StringTable::new();
        let mut types = TypeRegistry::new(&mut strings);
        let int = types.builtins.int;
        let fn_ty = types.function_type(int, vec![int], false, &mut strings);
        let name = strings.intern("puts_like");
        let req = MangleRequest {
            name,
            path: &[],
            fn_ty,
            is_ctor: false,
            is_dtor: false,
            is_extern_c: true,
        };
        assert_eq!(
            mangle_function(&req, &types, &strings, Target::Linux64),
            "puts_like"
        );
    }
}
