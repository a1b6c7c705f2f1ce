//! Template patterns, specialization selection and the instantiation cache.
//!
//! Patterns are keyed by their **unqualified** name: registration strips any
//! enclosing namespace prefix, and so does every lookup. This is the single
//! source of truth for instantiated identity — `n::H<int>` and `H<int>`
//! reach the same pattern, hash the same canonical arguments, and therefore
//! name (and cache) the same entity.
//!
//! A pattern's body is a token range into the translation unit's token
//! buffer; instantiation replays those tokens with the parameter bindings in
//! scope. The cache maps `(pattern, canonical args)` to the instantiated
//! entity, so repeated instantiation is a hash lookup, and an in-progress set
//! turns infinite recursion into a diagnosable error.

use std::hash::{BuildHasher, Hash};

use fcpp_util::{FxHashMap, FxHashSet, NodeId, StringHandle, StringTable};
use thiserror::Error;

use crate::consteval::ConstValue;
use crate::types::{RefKind, TypeIndex, TypeKind, TypeRegistry};

/// Failure inside template machinery.
///
/// In a SFINAE context these are consumed silently to prune a candidate; at
/// a use site that requires the instantiation they become fatal diagnostics.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InstantiationError {
    #[error("recursive instantiation of template '{0}'")]
    Recursive(String),
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("no matching specialization or primary template for '{0}'")]
    NoMatch(String),
    #[error("wrong number of template arguments for '{name}' (expected {expected}, got {got})")]
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("constraint not satisfied for '{0}'")]
    ConstraintFailed(String),
    #[error("substitution failure: {0}")]
    SubstitutionFailure(String),
}

/// A half-open range of token indices into the TU token buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenRange {
    pub start: u32,
    pub end: u32,
}

impl TokenRange {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Kind of one template parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateParamKind {
    /// `typename T` / `class T`.
    Type,
    /// `int N` — a non-type parameter of the given type.
    Value { ty: TypeIndex },
    /// `template <typename> class C`.
    Template,
}

/// One declared template parameter.
#[derive(Clone, Debug)]
pub struct TemplateParam {
    pub name: StringHandle,
    pub kind: TemplateParamKind,
    pub is_pack: bool,
    /// Default argument tokens, replayed when the argument is omitted.
    pub default: Option<TokenRange>,
}

/// What kind of entity the template produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateKind {
    Class,
    Function,
    Variable,
    Alias,
}

/// A fully resolved template argument, the unit of canonical identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TemplateArg {
    Type(TypeIndex),
    Value(ConstValue),
    Template(StringHandle),
    Pack(Vec<TemplateArg>),
}

/// Structural pattern of one specialization argument.
///
/// `Param(i)` binds (or checks against) the i-th specialization parameter —
/// a repeated `Param(0)` is how `is_same<T, T>` matches only equal types.
#[derive(Clone, Debug)]
pub enum TypePattern {
    /// Matches exactly this argument.
    Concrete(TemplateArg),
    /// Matches anything, binding the specialization's own parameter;
    /// a repeated index must re-match the bound argument.
    Param(u32),
    /// Matches `P*` where the pointee matches the inner pattern.
    Pointer(Box<TypePattern>),
    /// Matches `P&`.
    LValueRef(Box<TypePattern>),
    /// Matches `P&&`.
    RValueRef(Box<TypePattern>),
    /// Matches `P[N]` for any `N`.
    Array(Box<TypePattern>),
}

impl TypePattern {
    /// Specificity score; tighter patterns score higher so partial ordering
    /// can pick the most specialized match.
    fn specificity(&self) -> u32 {
        match self {
            TypePattern::Concrete(_) => 3,
            TypePattern::Param(_) => 0,
            TypePattern::Pointer(inner)
            | TypePattern::LValueRef(inner)
            | TypePattern::RValueRef(inner)
            | TypePattern::Array(inner) => 1 + inner.specificity(),
        }
    }
}

/// One explicit or partial specialization.
#[derive(Clone, Debug)]
pub struct Specialization {
    /// Parameters of the specialization itself (empty for full ones).
    pub params: Vec<TemplateParam>,
    /// Argument patterns, one per primary-template parameter.
    pub args: Vec<TypePattern>,
    pub is_partial: bool,
    pub body: TokenRange,
}

/// A registered template.
#[derive(Clone, Debug)]
pub struct TemplatePattern {
    /// Unqualified name.
    pub name: StringHandle,
    pub kind: TemplateKind,
    pub params: Vec<TemplateParam>,
    /// `requires` clause tokens, checked before instantiation.
    pub constraint: Option<TokenRange>,
    pub body: TokenRange,
    pub specializations: Vec<Specialization>,
}

/// An entity produced by instantiation.
#[derive(Clone, Debug)]
pub enum InstantiatedEntity {
    Type(TypeIndex),
    Function {
        /// Hash-suffixed instantiation name.
        name: StringHandle,
        ty: TypeIndex,
        body: NodeId,
    },
    Variable {
        ty: TypeIndex,
        value: ConstValue,
    },
}

/// Result of specialization selection.
#[derive(Debug)]
pub struct SelectedBody {
    /// Index into `specializations`, or `None` for the primary.
    pub specialization: Option<usize>,
    /// Body tokens to replay.
    pub body: TokenRange,
    /// Arguments bound to the body's own parameters, in parameter order.
    pub bindings: Vec<TemplateArg>,
}

/// The per-TU template registry.
pub struct TemplateRegistry {
    patterns: FxHashMap<StringHandle, TemplatePattern>,
    cache: FxHashMap<(StringHandle, Vec<TemplateArg>), InstantiatedEntity>,
    in_progress: FxHashSet<(StringHandle, Vec<TemplateArg>)>,
    /// Fixed-seed hasher: instantiation names must be identical across runs.
    name_hasher: ahash::RandomState,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            patterns: FxHashMap::default(),
            cache: FxHashMap::default(),
            in_progress: FxHashSet::default(),
            name_hasher: ahash::RandomState::with_seeds(
                0x7f4a_7c15_9e37_79b9,
                0x1bd1_1bda_a9fc_1a22,
                0x9e37_79b9_7f4a_7c15,
                0xa9fc_1a22_1bd1_1bda,
            ),
        }
    }

    /// Register a primary template under its unqualified name.
    ///
    /// Idempotent on redeclaration with an identical parameter list: the
    /// existing pattern (and its specializations) is kept, but a
    /// redeclaration carrying a body wins over a forward declaration.
    pub fn register(&mut self, pattern: TemplatePattern) {
        match self.patterns.get_mut(&pattern.name) {
            Some(existing) if existing.params.len() == pattern.params.len() => {
                if existing.body.is_empty() && !pattern.body.is_empty() {
                    existing.body = pattern.body;
                    existing.constraint = pattern.constraint;
                }
            }
            _ => {
                self.patterns.insert(pattern.name, pattern);
            }
        }
    }

    /// Attach a specialization to a registered pattern.
    pub fn add_specialization(
        &mut self,
        name: StringHandle,
        spec: Specialization,
        strings: &StringTable,
    ) -> Result<(), InstantiationError> {
        let pattern = self
            .patterns
            .get_mut(&name)
            .ok_or_else(|| InstantiationError::UnknownTemplate(strings.view(name).to_string()))?;
        pattern.specializations.push(spec);
        Ok(())
    }

    /// Look up a pattern by (already unqualified) name.
    pub fn get(&self, name: StringHandle) -> Option<&TemplatePattern> {
        self.patterns.get(&name)
    }

    /// True if a pattern with this name exists.
    pub fn is_template(&self, name: StringHandle) -> bool {
        self.patterns.contains_key(&name)
    }

    /// Cached instantiation, if any.
    pub fn cached(&self, name: StringHandle, args: &[TemplateArg]) -> Option<&InstantiatedEntity> {
        self.cache.get(&(name, args.to_vec()))
    }

    /// Memoize a finished instantiation.
    pub fn cache_insert(
        &mut self,
        name: StringHandle,
        args: Vec<TemplateArg>,
        entity: InstantiatedEntity,
    ) {
        self.cache.insert((name, args), entity);
    }

    /// Mark an instantiation as in progress; a second attempt for the same
    /// key is infinite recursion.
    pub fn begin_instantiation(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
        strings: &StringTable,
    ) -> Result<(), InstantiationError> {
        if !self.in_progress.insert((name, args.to_vec())) {
            return Err(InstantiationError::Recursive(
                strings.view(name).to_string(),
            ));
        }
        Ok(())
    }

    /// Clear the in-progress mark.
    pub fn end_instantiation(&mut self, name: StringHandle, args: &[TemplateArg]) {
        self.in_progress.remove(&(name, args.to_vec()));
    }

    /// The hash-suffixed instantiation name: `base$<hex64(hash(args))>`.
    ///
    /// The hash covers argument identities only — never the spelled name
    /// prefix — so every syntactic path to the same instantiation produces
    /// the same name.
    pub fn instantiated_name(
        &self,
        base: StringHandle,
        args: &[TemplateArg],
        strings: &mut StringTable,
    ) -> StringHandle {
        let mut hasher = self.name_hasher.build_hasher();
        args.hash(&mut hasher);
        let digest = std::hash::Hasher::finish(&hasher);
        let name = format!("{}${digest:016x}", strings.view(base));
        strings.intern(&name)
    }

    /// Select the body to instantiate for `(pattern, args)`.
    ///
    /// Order: full specialization, then the partial specialization with the
    /// highest specificity that matches, then the primary. Arity against the
    /// primary's parameter list is checked first (packs absorb the tail).
    pub fn select(
        &self,
        name: StringHandle,
        args: &[TemplateArg],
        types: &TypeRegistry,
        strings: &StringTable,
    ) -> Result<SelectedBody, InstantiationError> {
        let pattern = self
            .patterns
            .get(&name)
            .ok_or_else(|| InstantiationError::UnknownTemplate(strings.view(name).to_string()))?;

        let has_pack = pattern.params.iter().any(|p| p.is_pack);
        let required = pattern.params.iter().filter(|p| p.default.is_none() && !p.is_pack).count();
        if args.len() < required || (!has_pack && args.len() > pattern.params.len()) {
            return Err(InstantiationError::WrongArity {
                name: strings.view(name).to_string(),
                expected: pattern.params.len(),
                got: args.len(),
            });
        }

        let mut best: Option<(usize, u32, Vec<TemplateArg>)> = None;
        for (idx, spec) in pattern.specializations.iter().enumerate() {
            if spec.args.len() != args.len() {
                continue;
            }
            let mut bindings: Vec<Option<TemplateArg>> = vec![None; spec.params.len()];
            let matched = spec
                .args
                .iter()
                .zip(args)
                .all(|(pat, arg)| match_pattern(pat, arg, &mut bindings, types));
            if !matched {
                continue;
            }
            let score: u32 = spec.args.iter().map(TypePattern::specificity).sum();
            // Full specializations outrank every partial.
            let score = if spec.is_partial { score } else { score + 1000 };
            let bound: Vec<TemplateArg> = bindings.into_iter().flatten().collect();
            if bound.len() != spec.params.len() {
                continue; // unbound spec parameter: not deducible from args
            }
            if best.as_ref().map(|&(_, s, _)| score > s).unwrap_or(true) {
                best = Some((idx, score, bound));
            }
        }

        if let Some((idx, _, bindings)) = best {
            let spec = &pattern.specializations[idx];
            return Ok(SelectedBody {
                specialization: Some(idx),
                body: spec.body,
                bindings,
            });
        }

        Ok(SelectedBody {
            specialization: None,
            body: pattern.body,
            bindings: args.to_vec(),
        })
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Match one specialization pattern against one argument.
fn match_pattern(
    pattern: &TypePattern,
    arg: &TemplateArg,
    bindings: &mut Vec<Option<TemplateArg>>,
    types: &TypeRegistry,
) -> bool {
    match pattern {
        TypePattern::Concrete(expected) => expected == arg,
        TypePattern::Param(i) => {
            let slot = &mut bindings[*i as usize];
            match slot {
                Some(bound) => bound == arg,
                None => {
                    *slot = Some(arg.clone());
                    true
                }
            }
        }
        TypePattern::Pointer(inner) => match arg {
            TemplateArg::Type(ty) => match types.info(types.canonical(*ty)).kind {
                TypeKind::Pointer { pointee } => {
                    match_pattern(inner, &TemplateArg::Type(pointee), bindings, types)
                }
                _ => false,
            },
            _ => false,
        },
        TypePattern::LValueRef(inner) => match_ref(inner, arg, RefKind::LValue, bindings, types),
        TypePattern::RValueRef(inner) => match_ref(inner, arg, RefKind::RValue, bindings, types),
        TypePattern::Array(inner) => match arg {
            TemplateArg::Type(ty) => match types.info(types.canonical(*ty)).kind {
                TypeKind::Array { element, .. } => {
                    match_pattern(inner, &TemplateArg::Type(element), bindings, types)
                }
                _ => false,
            },
            _ => false,
        },
    }
}

fn match_ref(
    inner: &TypePattern,
    arg: &TemplateArg,
    expect: RefKind,
    bindings: &mut Vec<Option<TemplateArg>>,
    types: &TypeRegistry,
) -> bool {
    match arg {
        TemplateArg::Type(ty) => match types.info(types.canonical(*ty)).kind {
            TypeKind::Reference { kind, referee } if kind == expect => {
                match_pattern(inner, &TemplateArg::Type(referee), bindings, types)
            }
            _ => false,
        },
        _ => false,
    }
}

/// Strip any namespace qualification: `ns::inner::H` → `H`.
pub fn unqualified_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    fn setup() -> (StringTable, TypeRegistry, TemplateRegistry) {
        let mut strings = StringTable::new();
        let types = TypeRegistry::new(&mut strings);
        (strings, types, TemplateRegistry::new())
    }

    fn type_param(strings: &mut StringTable, name: &str) -> TemplateParam {
        TemplateParam {
            name: strings.intern(name),
            kind: TemplateParamKind::Type,
            is_pack: false,
            default: None,
        }
    }

    #[test]
    fn test_unqualified_name() {
        assert_eq!(unqualified_name("H"), "H");
        assert_eq!(unqualified_name("ns::H"), "H");
        assert_eq!(unqualified_name("a::b::c::Vec"), "Vec");
    }

    #[test]
    fn test_instantiated_name_ignores_prefix() {
        let (mut strings, _, registry) = setup();
        let h = strings.intern("H");
        let args = vec![TemplateArg::Type(TypeIndex(7))];
        let n1 = registry.instantiated_name(h, &args, &mut strings);
        let n2 = registry.instantiated_name(h, &args, &mut strings);
        assert_eq!(n1, n2);
        let text = strings.view(n1).to_string();
        assert!(text.starts_with("H$"), "got {text}");
        assert_eq!(text.len(), "H$".len() + 16);
    }

    #[test]
    fn test_name_differs_by_args() {
        let (mut strings, _, registry) = setup();
        let h = strings.intern("H");
        let n1 = registry.instantiated_name(h, &[TemplateArg::Type(TypeIndex(1))], &mut strings);
        let n2 = registry.instantiated_name(h, &[TemplateArg::Type(TypeIndex(2))], &mut strings);
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_cache_memoizes() {
        let (mut strings, _, mut registry) = setup();
        let h = strings.intern("H");
        let args = vec![TemplateArg::Type(TypeIndex(3))];
        assert!(registry.cached(h, &args).is_none());
        registry.cache_insert(h, args.clone(), InstantiatedEntity::Type(TypeIndex(99)));
        match registry.cached(h, &args) {
            Some(InstantiatedEntity::Type(t)) => assert_eq!(*t, TypeIndex(99)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_recursion_detection() {
        let (mut strings, _, mut registry) = setup();
        let h = strings.intern("Loop");
        let args = vec![TemplateArg::Type(TypeIndex(1))];
        registry.begin_instantiation(h, &args, &strings).unwrap();
        let err = registry.begin_instantiation(h, &args, &strings).unwrap_err();
        assert!(matches!(err, InstantiationError::Recursive(_)));
        registry.end_instantiation(h, &args);
        assert!(registry.begin_instantiation(h, &args, &strings).is_ok());
    }

    #[test]
    fn test_is_same_partial_specialization_selection() {
        // template<typename T, typename U> struct is_same;      (primary)
        // template<typename T> struct is_same<T, T>;            (partial)
        let (mut strings, types, mut registry) = setup();
        let name = strings.intern("is_same");
        let t = type_param(&mut strings, "T");
        let u = type_param(&mut strings, "U");
        registry.register(TemplatePattern {
            name,
            kind: TemplateKind::Class,
            params: vec![t.clone(), u],
            constraint: None,
            body: TokenRange::new(0, 1),
            specializations: vec![],
        });
        registry
            .add_specialization(
                name,
                Specialization {
                    params: vec![t],
                    args: vec![TypePattern::Param(0), TypePattern::Param(0)],
                    is_partial: true,
                    body: TokenRange::new(2, 3),
                },
                &strings,
            )
            .unwrap();

        let int = types.builtins.int;
        let bool_ = types.builtins.bool_;

        // is_same<int, int> -> partial specialization.
        let same = registry
            .select(name, &[TemplateArg::Type(int), TemplateArg::Type(int)], &types, &strings)
            .unwrap();
        assert_eq!(same.specialization, Some(0));
        assert_eq!(same.bindings, vec![TemplateArg::Type(int)]);

        // is_same<int, bool> -> primary.
        let diff = registry
            .select(name, &[TemplateArg::Type(int), TemplateArg::Type(bool_)], &types, &strings)
            .unwrap();
        assert_eq!(diff.specialization, None);
        assert_eq!(
            diff.bindings,
            vec![TemplateArg::Type(int), TemplateArg::Type(bool_)]
        );
    }

    #[test]
    fn test_full_specialization_beats_partial() {
        let (mut strings, mut types, mut registry) = setup();
        let name = strings.intern("traits");
        let t = type_param(&mut strings, "T");
        let int = types.builtins.int;
        let int_ptr = types.pointer_to(int, &mut strings);
        registry.register(TemplatePattern {
            name,
            kind: TemplateKind::Class,
            params: vec![t.clone()],
            constraint: None,
            body: TokenRange::new(0, 1),
            specializations: vec![],
        });
        // Partial: traits<P*>
        registry
            .add_specialization(
                name,
                Specialization {
                    params: vec![t.clone()],
                    args: vec![TypePattern::Pointer(Box::new(TypePattern::Param(0)))],
                    is_partial: true,
                    body: TokenRange::new(2, 3),
                },
                &strings,
            )
            .unwrap();
        // Full: traits<int*>
        registry
            .add_specialization(
                name,
                Specialization {
                    params: vec![],
                    args: vec![TypePattern::Concrete(TemplateArg::Type(int_ptr))],
                    is_partial: false,
                    body: TokenRange::new(4, 5),
                },
                &strings,
            )
            .unwrap();

        let selected = registry
            .select(name, &[TemplateArg::Type(int_ptr)], &types, &strings)
            .unwrap();
        assert_eq!(selected.specialization, Some(1), "full specialization wins");

        // A different pointer still hits the partial.
        let bool_ptr = types.pointer_to(types.builtins.bool_, &mut strings);
        let selected = registry
            .select(name, &[TemplateArg::Type(bool_ptr)], &types, &strings)
            .unwrap();
        assert_eq!(selected.specialization, Some(0));
        assert_eq!(selected.bindings, vec![TemplateArg::Type(types.builtins.bool_)]);
    }

    #[test]
    fn test_wrong_arity() {
        let (mut strings, types, mut registry) = setup();
        let name = strings.intern("Pair");
        let t = type_param(&mut strings, "T");
        let u = type_param(&mut strings, "U");
        registry.register(TemplatePattern {
            name,
            kind: TemplateKind::Class,
            params: vec![t, u],
            constraint: None,
            body: TokenRange::new(0, 1),
            specializations: vec![],
        });
        let err = registry
            .select(name, &[TemplateArg::Type(TypeIndex(1))], &types, &strings)
            .unwrap_err();
        assert!(matches!(err, InstantiationError::WrongArity { .. }));
    }

    #[test]
    fn test_register_is_idempotent() {
        let (mut strings, _, mut registry) = setup();
        let name = strings.intern("H");
        let t = type_param(&mut strings, "T");
        registry.register(TemplatePattern {
            name,
            kind: TemplateKind::Class,
            params: vec![t.clone()],
            constraint: None,
            body: TokenRange::new(5, 9),
            specializations: vec![Specialization {
                params: vec![],
                args: vec![TypePattern::Concrete(TemplateArg::Type(TypeIndex(1)))],
                is_partial: false,
                body: TokenRange::new(10, 12),
            }],
        });
        // Redeclaration must not clobber the body or specializations.
        registry.register(TemplatePattern {
            name,
            kind: TemplateKind::Class,
            params: vec![t],
            constraint: None,
            body: TokenRange::new(0, 0),
            specializations: vec![],
        });
        let p = registry.get(name).unwrap();
        assert_eq!(p.body, TokenRange::new(5, 9));
        assert_eq!(p.specializations.len(), 1);
    }
}
