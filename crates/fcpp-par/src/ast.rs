//! AST node definitions.
//!
//! Nodes live in a per-translation-unit arena ([`Ast`]) and refer to each
//! other by [`NodeId`]; the tree is acyclic by construction. Every node
//! carries the source span it was parsed from.
//!
//! Identifier references are resolved during parsing into a [`Binding`]
//! (C++ requires name lookup during parsing anyway, for the declaration/
//! expression ambiguities). Member accesses and method calls stay name-based
//! — the IR lowerer resolves them against the object's type, which it infers
//! bottom-up.

use fcpp_sem::{ConstValue, TypeIndex};
use fcpp_util::{IndexVec, LocalId, NodeId, Span, StringHandle};

/// The node arena for one translation unit.
#[derive(Default)]
pub struct Ast {
    nodes: IndexVec<NodeId, AstNode>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node.
    pub fn alloc(&mut self, kind: NodeKind, span: Span) -> NodeId {
        self.nodes.push(AstNode { kind, span })
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &AstNode {
        &self.nodes[id]
    }

    #[inline]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    #[inline]
    pub fn span(&self, id: NodeId) -> Span {
        self.nodes[id].span
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One allocated node.
#[derive(Debug)]
pub struct AstNode {
    pub kind: NodeKind,
    pub span: Span,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Plus,
    Neg,
    /// Logical `!`.
    Not,
    /// Bitwise `~`.
    BitNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Deref,
    AddrOf,
}

/// Binary operators (assignment and member access are separate nodes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Spaceship,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    LogicalAnd,
    LogicalOr,
    Comma,
}

/// Parse-time resolution of an identifier.
#[derive(Clone, Debug)]
pub enum Binding {
    Local {
        local: LocalId,
        ty: TypeIndex,
    },
    Param {
        index: u32,
        ty: TypeIndex,
    },
    Global {
        /// Unqualified name; the symbol is derived with `path` by mangling.
        name: StringHandle,
        path: Vec<StringHandle>,
        ty: TypeIndex,
    },
    /// A constant known at parse time (constexpr variable, static member).
    Constexpr {
        value: ConstValue,
        ty: TypeIndex,
    },
    Function {
        name: StringHandle,
        path: Vec<StringHandle>,
        ty: TypeIndex,
        is_extern_c: bool,
    },
    EnumConst {
        value: i64,
        ty: TypeIndex,
    },
}

/// Initializer forms of a variable declaration.
#[derive(Clone, Debug)]
pub enum Initializer {
    /// `= expr`
    Expr(NodeId),
    /// `{ a, b, c }`
    Braced(Vec<NodeId>),
    /// `( a, b )` direct-initialization / constructor call.
    Ctor(Vec<NodeId>),
}

/// One declarator in a declaration statement.
#[derive(Clone, Debug)]
pub struct LocalDecl {
    pub name: StringHandle,
    pub ty: TypeIndex,
    pub local: LocalId,
    pub init: Option<Initializer>,
}

/// One `catch` clause. `ty == None` is `catch (...)`.
#[derive(Clone, Debug)]
pub struct CatchHandler {
    pub ty: Option<TypeIndex>,
    pub var: Option<(StringHandle, LocalId)>,
    pub body: NodeId,
}

/// One arm of a `switch`; `value == None` is `default:`. Control falls
/// through to the next arm unless the statements break.
#[derive(Clone, Debug)]
pub struct SwitchArm {
    pub value: Option<i64>,
    pub stmts: Vec<NodeId>,
}

/// The tagged node sum.
#[derive(Clone, Debug)]
pub enum NodeKind {
    // ---- expressions ----
    IntLit {
        value: u64,
        ty: TypeIndex,
    },
    FloatLit {
        value: f64,
        ty: TypeIndex,
    },
    BoolLit(bool),
    CharLit {
        value: u32,
        ty: TypeIndex,
    },
    /// Cooked bytes of a string literal; decays to `const char*`.
    StringLit {
        text: StringHandle,
    },
    NullPtr,
    /// `this`, carrying the enclosing class type.
    This {
        class_ty: TypeIndex,
    },
    DeclRef {
        name: StringHandle,
        binding: Binding,
    },
    Unary {
        op: UnOp,
        operand: NodeId,
    },
    Binary {
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    /// `lhs = rhs` or compound `lhs op= rhs`.
    Assign {
        op: Option<BinOp>,
        lhs: NodeId,
        rhs: NodeId,
    },
    Ternary {
        cond: NodeId,
        then_expr: NodeId,
        else_expr: NodeId,
    },
    Call {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    /// `obj.method(args)` / `ptr->method(args)`; resolved by the lowerer
    /// against the object type (virtual dispatch decided there too).
    MethodCall {
        object: NodeId,
        method: StringHandle,
        args: Vec<NodeId>,
        is_arrow: bool,
    },
    Member {
        object: NodeId,
        name: StringHandle,
        is_arrow: bool,
    },
    Index {
        base: NodeId,
        index: NodeId,
    },
    /// Any cast spelling: C-style, functional, static_cast, etc.
    Cast {
        to: TypeIndex,
        expr: NodeId,
    },
    SizeOf {
        ty: TypeIndex,
    },
    AlignOf {
        ty: TypeIndex,
    },
    New {
        ty: TypeIndex,
        args: Vec<NodeId>,
        array_len: Option<NodeId>,
    },
    Delete {
        expr: NodeId,
        is_array: bool,
    },
    Throw {
        expr: Option<NodeId>,
    },
    /// `T(args)` or `T{args}` temporary construction.
    ConstructTemp {
        ty: TypeIndex,
        args: Vec<NodeId>,
    },
    /// Braced initializer list in expression position.
    InitList {
        elems: Vec<NodeId>,
    },
    /// A lambda expression; the synthesized function is in the function
    /// list under `fn_name`. Captureless lambdas only, so the value decays
    /// to a function pointer.
    Lambda {
        fn_name: StringHandle,
        fn_ty: TypeIndex,
    },

    // ---- statements ----
    Empty,
    ExprStmt(NodeId),
    Compound {
        stmts: Vec<NodeId>,
    },
    If {
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    },
    While {
        cond: NodeId,
        body: NodeId,
    },
    DoWhile {
        body: NodeId,
        cond: NodeId,
    },
    For {
        init: Option<NodeId>,
        cond: Option<NodeId>,
        step: Option<NodeId>,
        body: NodeId,
    },
    /// `for (decl : range)`; lowered to an index/iterator loop.
    RangeFor {
        var: LocalId,
        var_ty: TypeIndex,
        range: NodeId,
        body: NodeId,
    },
    Switch {
        cond: NodeId,
        arms: Vec<SwitchArm>,
    },
    Return(Option<NodeId>),
    Break,
    Continue,
    VarDecl {
        decls: Vec<LocalDecl>,
    },
    /// `auto [a, b] = expr;` — decomposition into per-name slots.
    StructuredBinding {
        locals: Vec<(StringHandle, LocalId)>,
        init: NodeId,
    },
    Try {
        body: NodeId,
        handlers: Vec<CatchHandler>,
    },
}

/// Linkage of an emitted symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
}

/// One function parameter.
#[derive(Clone, Debug)]
pub struct ParamDef {
    pub name: StringHandle,
    pub ty: TypeIndex,
}

/// One local variable slot (parameters excluded).
#[derive(Clone, Debug)]
pub struct LocalDef {
    pub name: StringHandle,
    pub ty: TypeIndex,
}

/// A parsed function ready for lowering.
#[derive(Debug)]
pub struct FunctionDef {
    /// Unqualified name (hash-suffixed for template instantiations).
    pub name: StringHandle,
    /// Enclosing namespace path; includes the class name for methods.
    pub path: Vec<StringHandle>,
    /// Function type.
    pub ty: TypeIndex,
    pub params: Vec<ParamDef>,
    pub body: Option<NodeId>,
    /// Constructor member-initializer list, in member order.
    pub ctor_inits: Vec<(StringHandle, NodeId)>,
    /// All locals of the function, across nested blocks.
    pub locals: IndexVec<LocalId, LocalDef>,
    /// Class type for non-static member functions (`this` is implicit).
    pub method_of: Option<TypeIndex>,
    pub is_virtual: bool,
    pub is_ctor: bool,
    pub is_dtor: bool,
    pub is_extern_c: bool,
    pub linkage: Linkage,
    pub span: Span,
}

/// A namespace-scope variable.
#[derive(Debug)]
pub struct GlobalDef {
    pub name: StringHandle,
    pub path: Vec<StringHandle>,
    pub ty: TypeIndex,
    pub init: Option<NodeId>,
    /// Constant initializer value, when it folds.
    pub init_const: Option<ConstValue>,
    pub linkage: Linkage,
    pub span: Span,
}

/// Everything the parser produces for one translation unit.
pub struct ParseOutput {
    pub ast: Ast,
    pub functions: Vec<FunctionDef>,
    pub globals: Vec<GlobalDef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_assigns_sequential_ids() {
        let mut ast = Ast::new();
        let a = ast.alloc(NodeKind::Empty, Span::DUMMY);
        let b = ast.alloc(NodeKind::Break, Span::DUMMY);
        assert_eq!(a, NodeId(0));
        assert_eq!(b, NodeId(1));
        assert!(matches!(ast.kind(b), NodeKind::Break));
    }

    #[test]
    fn test_nodes_reference_by_id() {
        let mut ast = Ast::new();
        let lit = ast.alloc(
            NodeKind::IntLit { value: 1, ty: TypeIndex(0) },
            Span::DUMMY,
        );
        let ret = ast.alloc(NodeKind::Return(Some(lit)), Span::DUMMY);
        match ast.kind(ret) {
            NodeKind::Return(Some(inner)) => {
                assert!(matches!(ast.kind(*inner), NodeKind::IntLit { value: 1, .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
