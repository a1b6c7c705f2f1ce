//! The global type table.
//!
//! Every distinct type in a translation unit has exactly one [`TypeIndex`]
//! into the registry's dense [`TypeInfo`] vector — the canonical-form
//! invariant. Derived-type constructors (`pointer_to`, `reference_to`,
//! `array_of`, `function_type`) memoize, so requesting `int*` twice returns
//! the same index, and type equality downstream is index equality.
//!
//! Named types (builtins, structs, enums, aliases, template instantiations)
//! additionally live in a name map keyed on the unqualified, hash-suffixed
//! spelling. The map is insertion-ordered so that symbol emission order is
//! deterministic.

use fcpp_util::{define_idx, IndexVec, StringHandle, StringTable};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::record::{EnumInfo, StructInfo};

define_idx! {
    /// Dense index into the global type table.
    pub struct TypeIndex;
}

define_idx! {
    /// Index of struct/class metadata in the registry.
    pub struct StructId;
}

define_idx! {
    /// Index of enum metadata in the registry.
    pub struct EnumId;
}

/// Reference flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    LValue,
    RValue,
}

/// The structural kind of a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Bool,
    Int { signed: bool, bits: u8 },
    Float { bits: u8 },
    Pointer { pointee: TypeIndex },
    Reference { kind: RefKind, referee: TypeIndex },
    Array { element: TypeIndex, len: u64 },
    Function { ret: TypeIndex, params: Vec<TypeIndex>, variadic: bool },
    Struct { id: StructId },
    Enum { id: EnumId },
    Alias { target: TypeIndex },
    /// Placeholder for a name that depends on template parameters. Created
    /// only while parsing a template pattern; never survives to codegen.
    Dependent,
}

/// Metadata for one type.
#[derive(Clone, Debug)]
pub struct TypeInfo {
    pub name: StringHandle,
    pub kind: TypeKind,
    pub size_bits: u32,
    pub align_bits: u32,
    /// True while a template instantiation's class body is still being
    /// filled in (self-referential instantiations see this flag).
    pub is_incomplete_instantiation: bool,
}

/// Pre-registered builtin type indices. Order matches registration in
/// [`TypeRegistry::new`].
#[derive(Clone, Copy, Debug)]
pub struct Builtins {
    pub void: TypeIndex,
    pub bool_: TypeIndex,
    pub char_: TypeIndex,
    pub schar: TypeIndex,
    pub uchar: TypeIndex,
    pub short: TypeIndex,
    pub ushort: TypeIndex,
    pub int: TypeIndex,
    pub uint: TypeIndex,
    pub long: TypeIndex,
    pub ulong: TypeIndex,
    pub llong: TypeIndex,
    pub ullong: TypeIndex,
    pub float: TypeIndex,
    pub double: TypeIndex,
    /// `decltype(nullptr)`, modeled as `void*`.
    pub nullptr: TypeIndex,
}

/// The per-TU type registry.
pub struct TypeRegistry {
    types: IndexVec<TypeIndex, TypeInfo>,
    by_name: IndexMap<StringHandle, TypeIndex>,
    pub structs: IndexVec<StructId, StructInfo>,
    pub enums: IndexVec<EnumId, EnumInfo>,
    pointer_cache: FxHashMap<TypeIndex, TypeIndex>,
    reference_cache: FxHashMap<(TypeIndex, RefKind), TypeIndex>,
    array_cache: FxHashMap<(TypeIndex, u64), TypeIndex>,
    function_cache: FxHashMap<(TypeIndex, Vec<TypeIndex>, bool), TypeIndex>,
    pub builtins: Builtins,
}

impl TypeRegistry {
    /// Create a registry with the builtin types pre-registered.
    pub fn new(strings: &mut StringTable) -> Self {
        let mut registry = Self {
            types: IndexVec::new(),
            by_name: IndexMap::new(),
            structs: IndexVec::new(),
            enums: IndexVec::new(),
            pointer_cache: FxHashMap::default(),
            reference_cache: FxHashMap::default(),
            array_cache: FxHashMap::default(),
            function_cache: FxHashMap::default(),
            // Placeholder, replaced below once the indices exist.
            builtins: Builtins {
                void: TypeIndex(0),
                bool_: TypeIndex(0),
                char_: TypeIndex(0),
                schar: TypeIndex(0),
                uchar: TypeIndex(0),
                short: TypeIndex(0),
                ushort: TypeIndex(0),
                int: TypeIndex(0),
                uint: TypeIndex(0),
                long: TypeIndex(0),
                ulong: TypeIndex(0),
                llong: TypeIndex(0),
                ullong: TypeIndex(0),
                float: TypeIndex(0),
                double: TypeIndex(0),
                nullptr: TypeIndex(0),
            },
        };
        let mut builtin = |name: &str, kind: TypeKind, bits: u32| {
            let handle = strings.intern(name);
            registry.register_named(
                handle,
                TypeInfo {
                    name: handle,
                    kind,
                    size_bits: bits,
                    align_bits: bits.max(8),
                    is_incomplete_instantiation: false,
                },
            )
        };
        let void = builtin("void", TypeKind::Void, 0);
        let bool_ = builtin("bool", TypeKind::Bool, 8);
        let char_ = builtin("char", TypeKind::Int { signed: true, bits: 8 }, 8);
        let schar = builtin("signed char", TypeKind::Int { signed: true, bits: 8 }, 8);
        let uchar = builtin("unsigned char", TypeKind::Int { signed: false, bits: 8 }, 8);
        let short = builtin("short", TypeKind::Int { signed: true, bits: 16 }, 16);
        let ushort = builtin("unsigned short", TypeKind::Int { signed: false, bits: 16 }, 16);
        let int = builtin("int", TypeKind::Int { signed: true, bits: 32 }, 32);
        let uint = builtin("unsigned int", TypeKind::Int { signed: false, bits: 32 }, 32);
        let long = builtin("long", TypeKind::Int { signed: true, bits: 64 }, 64);
        let ulong = builtin("unsigned long", TypeKind::Int { signed: false, bits: 64 }, 64);
        let llong = builtin("long long", TypeKind::Int { signed: true, bits: 64 }, 64);
        let ullong = builtin("unsigned long long", TypeKind::Int { signed: false, bits: 64 }, 64);
        let float = builtin("float", TypeKind::Float { bits: 32 }, 32);
        let double = builtin("double", TypeKind::Float { bits: 64 }, 64);
        let nullptr = registry.pointer_to(void, strings);
        registry.builtins = Builtins {
            void,
            bool_,
            char_,
            schar,
            uchar,
            short,
            ushort,
            int,
            uint,
            long,
            ulong,
            llong,
            ullong,
            float,
            double,
            nullptr,
        };
        registry
    }

    /// Metadata for a type.
    #[inline]
    pub fn info(&self, ty: TypeIndex) -> &TypeInfo {
        &self.types[ty]
    }

    /// Mutable metadata access (layout completion).
    #[inline]
    pub fn info_mut(&mut self, ty: TypeIndex) -> &mut TypeInfo {
        &mut self.types[ty]
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Look up a named type.
    pub fn lookup(&self, name: StringHandle) -> Option<TypeIndex> {
        self.by_name.get(&name).copied()
    }

    /// Register a named type.
    ///
    /// Exactly one `TypeInfo` may exist per name; a second registration
    /// under the same name returns the existing index. Template
    /// instantiations rely on this: the hash-suffixed name is the identity,
    /// so divergent registration paths collapse to one entity.
    pub fn register_named(&mut self, name: StringHandle, info: TypeInfo) -> TypeIndex {
        if let Some(&existing) = self.by_name.get(&name) {
            return existing;
        }
        let idx = self.types.push(info);
        self.by_name.insert(name, idx);
        idx
    }

    /// Register an anonymous (derived) type.
    pub fn register(&mut self, info: TypeInfo) -> TypeIndex {
        self.types.push(info)
    }

    /// Named types in registration order.
    pub fn named_types(&self) -> impl Iterator<Item = (StringHandle, TypeIndex)> + '_ {
        self.by_name.iter().map(|(&name, &ty)| (name, ty))
    }

    /// The canonical `T*`.
    pub fn pointer_to(&mut self, pointee: TypeIndex, strings: &mut StringTable) -> TypeIndex {
        if let Some(&cached) = self.pointer_cache.get(&pointee) {
            return cached;
        }
        let name = strings.intern(&format!("{}*", strings_name(self, pointee, strings)));
        let idx = self.types.push(TypeInfo {
            name,
            kind: TypeKind::Pointer { pointee },
            size_bits: 64,
            align_bits: 64,
            is_incomplete_instantiation: false,
        });
        self.pointer_cache.insert(pointee, idx);
        idx
    }

    /// The canonical `T&` / `T&&`.
    pub fn reference_to(
        &mut self,
        referee: TypeIndex,
        kind: RefKind,
        strings: &mut StringTable,
    ) -> TypeIndex {
        if let Some(&cached) = self.reference_cache.get(&(referee, kind)) {
            return cached;
        }
        let suffix = match kind {
            RefKind::LValue => "&",
            RefKind::RValue => "&&",
        };
        let name = strings.intern(&format!("{}{}", strings_name(self, referee, strings), suffix));
        let idx = self.types.push(TypeInfo {
            name,
            kind: TypeKind::Reference { kind, referee },
            size_bits: 64,
            align_bits: 64,
            is_incomplete_instantiation: false,
        });
        self.reference_cache.insert((referee, kind), idx);
        idx
    }

    /// The canonical `T[len]`.
    pub fn array_of(
        &mut self,
        element: TypeIndex,
        len: u64,
        strings: &mut StringTable,
    ) -> TypeIndex {
        if let Some(&cached) = self.array_cache.get(&(element, len)) {
            return cached;
        }
        let elem_info = self.info(element);
        let size_bits = elem_info.size_bits * len as u32;
        let align_bits = elem_info.align_bits;
        let name = strings.intern(&format!(
            "{}[{len}]",
            strings_name(self, element, strings)
        ));
        let idx = self.types.push(TypeInfo {
            name,
            kind: TypeKind::Array { element, len },
            size_bits,
            align_bits,
            is_incomplete_instantiation: false,
        });
        self.array_cache.insert((element, len), idx);
        idx
    }

    /// The canonical function type.
    pub fn function_type(
        &mut self,
        ret: TypeIndex,
        params: Vec<TypeIndex>,
        variadic: bool,
        strings: &mut StringTable,
    ) -> TypeIndex {
        let key = (ret, params.clone(), variadic);
        if let Some(&cached) = self.function_cache.get(&key) {
            return cached;
        }
        let name = strings.intern("<function>");
        let idx = self.types.push(TypeInfo {
            name,
            kind: TypeKind::Function { ret, params, variadic },
            size_bits: 0,
            align_bits: 8,
            is_incomplete_instantiation: false,
        });
        self.function_cache.insert(key, idx);
        idx
    }

    /// Follow alias chains to the canonical type.
    pub fn canonical(&self, ty: TypeIndex) -> TypeIndex {
        let mut current = ty;
        loop {
            match self.info(current).kind {
                TypeKind::Alias { target } => current = target,
                _ => return current,
            }
        }
    }

    /// Strip references, yielding the referee.
    pub fn strip_reference(&self, ty: TypeIndex) -> TypeIndex {
        match self.info(self.canonical(ty)).kind {
            TypeKind::Reference { referee, .. } => self.canonical(referee),
            _ => self.canonical(ty),
        }
    }

    /// True for integer types (including `bool`, `char` and enums).
    pub fn is_integral(&self, ty: TypeIndex) -> bool {
        matches!(
            self.info(self.canonical(ty)).kind,
            TypeKind::Int { .. } | TypeKind::Bool | TypeKind::Enum { .. }
        )
    }

    /// True for floating-point types.
    pub fn is_floating(&self, ty: TypeIndex) -> bool {
        matches!(self.info(self.canonical(ty)).kind, TypeKind::Float { .. })
    }

    /// True for arithmetic types.
    pub fn is_arithmetic(&self, ty: TypeIndex) -> bool {
        self.is_integral(ty) || self.is_floating(ty)
    }

    /// True for pointers.
    pub fn is_pointer(&self, ty: TypeIndex) -> bool {
        matches!(self.info(self.canonical(ty)).kind, TypeKind::Pointer { .. })
    }

    /// True for class types.
    pub fn is_class(&self, ty: TypeIndex) -> bool {
        matches!(self.info(self.canonical(ty)).kind, TypeKind::Struct { .. })
    }

    /// Struct metadata for a class type.
    pub fn struct_of(&self, ty: TypeIndex) -> Option<&StructInfo> {
        match self.info(self.canonical(ty)).kind {
            TypeKind::Struct { id } => self.structs.get(id),
            _ => None,
        }
    }

    /// (bits, signed) of an integer-like type; enums use their underlying
    /// type, `bool` is an unsigned 8-bit value.
    pub fn int_shape(&self, ty: TypeIndex) -> Option<(u8, bool)> {
        match self.info(self.canonical(ty)).kind {
            TypeKind::Int { signed, bits } => Some((bits, signed)),
            TypeKind::Bool => Some((8, false)),
            TypeKind::Enum { id } => {
                let underlying = self.enums.get(id)?.underlying;
                self.int_shape(underlying)
            }
            TypeKind::Pointer { .. } => Some((64, false)),
            _ => None,
        }
    }

    /// Size in bits; references are pointer-sized.
    pub fn size_bits(&self, ty: TypeIndex) -> u32 {
        self.info(self.canonical(ty)).size_bits
    }

    /// Alignment in bits.
    pub fn align_bits(&self, ty: TypeIndex) -> u32 {
        self.info(self.canonical(ty)).align_bits
    }
}

/// Display name of a type for synthesized derived-type names.
fn strings_name(registry: &TypeRegistry, ty: TypeIndex, strings: &StringTable) -> String {
    strings.view(registry.info(ty).name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (StringTable, TypeRegistry) {
        let mut strings = StringTable::new();
        let registry = TypeRegistry::new(&mut strings);
        (strings, registry)
    }

    #[test]
    fn test_builtins_registered() {
        let (strings, registry) = setup();
        let int = registry.builtins.int;
        assert_eq!(strings.view(registry.info(int).name), "int");
        assert_eq!(registry.size_bits(int), 32);
        assert!(registry.is_integral(int));
        assert!(!registry.is_floating(int));
    }

    #[test]
    fn test_pointer_canonicalization() {
        let (mut strings, mut registry) = setup();
        let int = registry.builtins.int;
        let p1 = registry.pointer_to(int, &mut strings);
        let p2 = registry.pointer_to(int, &mut strings);
        assert_eq!(p1, p2);
        assert_eq!(registry.size_bits(p1), 64);
        assert_eq!(strings.view(registry.info(p1).name), "int*");
    }

    #[test]
    fn test_reference_kinds_are_distinct() {
        let (mut strings, mut registry) = setup();
        let int = registry.builtins.int;
        let lref = registry.reference_to(int, RefKind::LValue, &mut strings);
        let rref = registry.reference_to(int, RefKind::RValue, &mut strings);
        assert_ne!(lref, rref);
        assert_eq!(registry.reference_to(int, RefKind::LValue, &mut strings), lref);
    }

    #[test]
    fn test_array_size() {
        let (mut strings, mut registry) = setup();
        let int = registry.builtins.int;
        let arr = registry.array_of(int, 10, &mut strings);
        assert_eq!(registry.size_bits(arr), 320);
        assert_eq!(registry.align_bits(arr), 32);
    }

    #[test]
    fn test_function_type_canonicalization() {
        let (mut strings, mut registry) = setup();
        let int = registry.builtins.int;
        let f1 = registry.function_type(int, vec![int, int], false, &mut strings);
        let f2 = registry.function_type(int, vec![int, int], false, &mut strings);
        let f3 = registry.function_type(int, vec![int], false, &mut strings);
        assert_eq!(f1, f2);
        assert_ne!(f1, f3);
    }

    #[test]
    fn test_alias_canonicalization() {
        let (mut strings, mut registry) = setup();
        let int = registry.builtins.int;
        let name = strings.intern("myint");
        let alias = registry.register_named(
            name,
            TypeInfo {
                name,
                kind: TypeKind::Alias { target: int },
                size_bits: 32,
                align_bits: 32,
                is_incomplete_instantiation: false,
            },
        );
        assert_eq!(registry.canonical(alias), int);
        assert!(registry.is_integral(alias));
    }

    #[test]
    fn test_register_named_is_idempotent() {
        let (mut strings, mut registry) = setup();
        let name = strings.intern("Point$0123456789abcdef");
        let info = TypeInfo {
            name,
            kind: TypeKind::Dependent,
            size_bits: 0,
            align_bits: 8,
            is_incomplete_instantiation: true,
        };
        let a = registry.register_named(name, info.clone());
        let b = registry.register_named(name, info);
        assert_eq!(a, b);
        // Only one entry exists under the name.
        assert_eq!(
            registry.named_types().filter(|&(n, _)| n == name).count(),
            1
        );
    }

    #[test]
    fn test_int_shape() {
        let (mut strings, mut registry) = setup();
        assert_eq!(registry.int_shape(registry.builtins.short), Some((16, true)));
        assert_eq!(registry.int_shape(registry.builtins.ullong), Some((64, false)));
        assert_eq!(registry.int_shape(registry.builtins.bool_), Some((8, false)));
        let int_ptr = {
            let int = registry.builtins.int;
            registry.pointer_to(int, &mut strings)
        };
        assert_eq!(registry.int_shape(int_ptr), Some((64, false)));
        assert_eq!(registry.int_shape(registry.builtins.double), None);
    }
}
