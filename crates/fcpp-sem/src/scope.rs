//! Lexical scopes and symbol tables.
//!
//! The parser pushes a scope on `{`, namespace, class, function, template
//! parameter list and lambda entry, and pops in reverse. Each scope maps an
//! interned name to a [`Declaration`]; function names map to overload sets.
//! Resolution walks innermost-out; what kinds of declaration are admissible
//! at a use site is decided by the caller (type position vs expression
//! position), not here.

use fcpp_util::{FxHashMap, LocalId, NodeId, StringHandle};
use indexmap::IndexMap;

use crate::consteval::ConstValue;
use crate::types::TypeIndex;

/// What kind of region a scope represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    TranslationUnit,
    Namespace(StringHandle),
    Class(TypeIndex),
    Function,
    Block,
    TemplateParams,
    Lambda,
}

/// One function signature in an overload set.
#[derive(Clone, Debug)]
pub struct FunctionDecl {
    /// Unqualified name.
    pub name: StringHandle,
    /// Enclosing namespace/class path, outermost first.
    pub path: Vec<StringHandle>,
    /// Function type.
    pub ty: TypeIndex,
    /// Body, once defined.
    pub body: Option<NodeId>,
    /// Declared `extern "C"` (symbol is the plain name).
    pub is_extern_c: bool,
}

/// A set of function declarations sharing a name.
#[derive(Clone, Debug, Default)]
pub struct OverloadSet {
    pub overloads: Vec<FunctionDecl>,
}

impl OverloadSet {
    /// Add a declaration, merging a redeclaration of the same type. Returns
    /// the index of the entry.
    pub fn add(&mut self, decl: FunctionDecl) -> usize {
        if let Some(pos) = self.overloads.iter().position(|f| f.ty == decl.ty) {
            // Redeclaration; a definition supersedes a prototype.
            if decl.body.is_some() {
                self.overloads[pos].body = decl.body;
            }
            pos
        } else {
            self.overloads.push(decl);
            self.overloads.len() - 1
        }
    }
}

/// A named entity visible in some scope.
#[derive(Clone, Debug)]
pub enum Declaration {
    /// A local variable in the current function frame.
    Local {
        local: LocalId,
        ty: TypeIndex,
    },
    /// A function parameter.
    Param {
        index: u32,
        ty: TypeIndex,
    },
    /// A namespace-scope variable.
    Global {
        ty: TypeIndex,
        init: Option<NodeId>,
    },
    /// A constexpr variable with a known value.
    Constexpr {
        ty: TypeIndex,
        value: ConstValue,
    },
    /// A function overload set.
    Function(OverloadSet),
    /// A type name (class, enum, alias, builtin, bound template type
    /// parameter).
    Type(TypeIndex),
    /// A template name; the pattern lives in the template registry under
    /// this (unqualified) name.
    Template(StringHandle),
    /// An enumerator.
    EnumConst {
        ty: TypeIndex,
        value: i64,
    },
    /// A namespace name.
    Namespace(StringHandle),
    /// A bound non-type template parameter.
    TemplateValue {
        ty: TypeIndex,
        value: ConstValue,
    },
}

/// One scope level.
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    symbols: IndexMap<StringHandle, Declaration>,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            symbols: IndexMap::new(),
        }
    }

    pub fn get(&self, name: StringHandle) -> Option<&Declaration> {
        self.symbols.get(&name)
    }

    /// Symbols in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (StringHandle, &Declaration)> {
        self.symbols.iter().map(|(&n, d)| (n, d))
    }
}

/// The scope stack for a translation unit.
pub struct ScopeStack {
    scopes: Vec<Scope>,
    /// Aliases: `using ns::name;` re-exports into the declaring scope.
    using_aliases: FxHashMap<StringHandle, StringHandle>,
}

impl ScopeStack {
    /// Create a stack containing the translation-unit scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new(ScopeKind::TranslationUnit)],
            using_aliases: FxHashMap::default(),
        }
    }

    /// Enter a scope.
    pub fn push(&mut self, kind: ScopeKind) {
        self.scopes.push(Scope::new(kind));
    }

    /// Leave the innermost scope. The TU scope is never popped.
    pub fn pop(&mut self) {
        debug_assert!(self.scopes.len() > 1, "popping the translation-unit scope");
        self.scopes.pop();
    }

    /// Current nesting depth (1 = TU scope only).
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Innermost scope.
    pub fn innermost(&self) -> &Scope {
        self.scopes.last().expect("scope stack is never empty")
    }

    /// Declare a name in the innermost scope. Functions merge into the
    /// existing overload set; for any other kind, re-declaring an existing
    /// name in the same scope returns `false`.
    pub fn declare(&mut self, name: StringHandle, decl: Declaration) -> bool {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        if !scope.symbols.contains_key(&name) {
            scope.symbols.insert(name, decl);
            return true;
        }
        match (scope.symbols.get_mut(&name), decl) {
            (Some(Declaration::Function(set)), Declaration::Function(new_set)) => {
                for f in new_set.overloads {
                    set.add(f);
                }
                true
            }
            _ => false,
        }
    }

    /// Declare into the translation-unit scope regardless of nesting.
    ///
    /// Namespace members are registered here under their qualified spelling
    /// (`ns::name`) so they stay findable after the namespace scope pops.
    pub fn declare_at_root(&mut self, name: StringHandle, decl: Declaration) -> bool {
        let root = self.scopes.first_mut().expect("scope stack is never empty");
        if !root.symbols.contains_key(&name) {
            root.symbols.insert(name, decl);
            return true;
        }
        match (root.symbols.get_mut(&name), decl) {
            (Some(Declaration::Function(set)), Declaration::Function(new_set)) => {
                for f in new_set.overloads {
                    set.add(f);
                }
                true
            }
            _ => false,
        }
    }

    /// Overwrite or insert, used when binding template parameters.
    pub fn declare_or_replace(&mut self, name: StringHandle, decl: Declaration) {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        scope.symbols.insert(name, decl);
    }

    /// Record `using alias = target;`-style name forwarding.
    pub fn add_using_alias(&mut self, alias: StringHandle, target: StringHandle) {
        self.using_aliases.insert(alias, target);
    }

    /// Resolve a name, walking innermost-out. Follows using-aliases once.
    pub fn lookup(&self, name: StringHandle) -> Option<&Declaration> {
        for scope in self.scopes.iter().rev() {
            if let Some(decl) = scope.get(name) {
                return Some(decl);
            }
        }
        if let Some(&target) = self.using_aliases.get(&name) {
            for scope in self.scopes.iter().rev() {
                if let Some(decl) = scope.get(target) {
                    return Some(decl);
                }
            }
        }
        None
    }

    /// Resolve a name only among active template-parameter scopes. Template
    /// parameters shadow everything, so callers check this first.
    pub fn lookup_template_param(&self, name: StringHandle) -> Option<&Declaration> {
        self.scopes
            .iter()
            .rev()
            .filter(|s| s.kind == ScopeKind::TemplateParams)
            .find_map(|s| s.get(name))
    }

    /// Mutable access to a declaration, innermost-out.
    pub fn lookup_mut(&mut self, name: StringHandle) -> Option<&mut Declaration> {
        for scope in self.scopes.iter_mut().rev() {
            if scope.symbols.contains_key(&name) {
                return scope.symbols.get_mut(&name);
            }
        }
        None
    }

    /// The enclosing namespace/class path, outermost first.
    pub fn current_path(&self) -> Vec<StringHandle> {
        self.scopes
            .iter()
            .filter_map(|s| match s.kind {
                ScopeKind::Namespace(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// The innermost enclosing class scope, if any.
    pub fn enclosing_class(&self) -> Option<TypeIndex> {
        self.scopes.iter().rev().find_map(|s| match s.kind {
            ScopeKind::Class(ty) => Some(ty),
            _ => None,
        })
    }

    /// True if the innermost non-block scope is a class body.
    pub fn at_class_scope(&self) -> bool {
        matches!(self.innermost().kind, ScopeKind::Class(_))
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcpp_util::StringTable;

    #[test]
    fn test_innermost_shadows_outer() {
        let mut strings = StringTable::new();
        let x = strings.intern("x");
        let mut scopes = ScopeStack::new();
        scopes.declare(x, Declaration::Global { ty: TypeIndex(1), init: None });
        scopes.push(ScopeKind::Block);
        scopes.declare(x, Declaration::Local { local: fcpp_util::LocalId(0), ty: TypeIndex(2) });
        match scopes.lookup(x) {
            Some(Declaration::Local { ty, .. }) => assert_eq!(*ty, TypeIndex(2)),
            other => panic!("unexpected: {other:?}"),
        }
        scopes.pop();
        assert!(matches!(scopes.lookup(x), Some(Declaration::Global { .. })));
    }

    #[test]
    fn test_duplicate_in_same_scope_rejected() {
        let mut strings = StringTable::new();
        let x = strings.intern("x");
        let mut scopes = ScopeStack::new();
        assert!(scopes.declare(x, Declaration::Global { ty: TypeIndex(1), init: None }));
        assert!(!scopes.declare(x, Declaration::Global { ty: TypeIndex(1), init: None }));
    }

    #[test]
    fn test_overload_sets_merge() {
        let mut strings = StringTable::new();
        let f = strings.intern("f");
        let mut scopes = ScopeStack::new();
        let decl = |ty: u32| {
            Declaration::Function(OverloadSet {
                overloads: vec![FunctionDecl {
                    name: f,
                    path: vec![],
                    ty: TypeIndex(ty),
                    body: None,
                    is_extern_c: false,
                }],
            })
        };
        assert!(scopes.declare(f, decl(10)));
        assert!(scopes.declare(f, decl(11)));
        match scopes.lookup(f) {
            Some(Declaration::Function(set)) => assert_eq!(set.overloads.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_definition_supersedes_prototype() {
        let mut set = OverloadSet::default();
        let f = FunctionDecl {
            name: StringHandle::DUMMY,
            path: vec![],
            ty: TypeIndex(5),
            body: None,
            is_extern_c: false,
        };
        set.add(f.clone());
        let mut defined = f;
        defined.body = Some(fcpp_util::NodeId(3));
        set.add(defined);
        assert_eq!(set.overloads.len(), 1);
        assert_eq!(set.overloads[0].body, Some(fcpp_util::NodeId(3)));
    }

    #[test]
    fn test_template_param_lookup_is_scoped() {
        let mut strings = StringTable::new();
        let t = strings.intern("T");
        let mut scopes = ScopeStack::new();
        scopes.declare(t, Declaration::Global { ty: TypeIndex(1), init: None });
        assert!(scopes.lookup_template_param(t).is_none());
        scopes.push(ScopeKind::TemplateParams);
        scopes.declare(t, Declaration::Type(TypeIndex(7)));
        assert!(matches!(
            scopes.lookup_template_param(t),
            Some(Declaration::Type(TypeIndex(7)))
        ));
        scopes.pop();
        assert!(scopes.lookup_template_param(t).is_none());
    }

    #[test]
    fn test_current_path_collects_namespaces() {
        let mut strings = StringTable::new();
        let a = strings.intern("a");
        let b = strings.intern("b");
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Namespace(a));
        scopes.push(ScopeKind::Namespace(b));
        assert_eq!(scopes.current_path(), vec![a, b]);
    }
}
