//! Bottom-up expression typing.
//!
//! One implementation shared by the parser (for `auto` deduction,
//! `decltype`, structured bindings) and the IR lowerer (for conversion and
//! load-width decisions). Typing is a pure function of the node, its
//! bindings and the type registry; derived types (`T*` for address-of) are
//! created through the registry's canonicalizing constructors, which is why
//! the registry comes in mutably.

use fcpp_sem::{RefKind, TypeIndex, TypeKind, TypeRegistry};
use fcpp_util::{NodeId, StringTable};

use crate::ast::{Ast, BinOp, Binding, NodeKind, UnOp};

/// The type of an expression node. Statements type as `void`.
pub fn expr_type(
    ast: &Ast,
    types: &mut TypeRegistry,
    strings: &mut StringTable,
    id: NodeId,
) -> TypeIndex {
    let b = types.builtins;
    match ast.kind(id).clone() {
        NodeKind::IntLit { ty, .. }
        | NodeKind::FloatLit { ty, .. }
        | NodeKind::CharLit { ty, .. } => ty,
        NodeKind::BoolLit(_) => b.bool_,
        NodeKind::StringLit { .. } => types.pointer_to(b.char_, strings),
        NodeKind::NullPtr => b.nullptr,
        NodeKind::This { class_ty } => types.pointer_to(class_ty, strings),
        NodeKind::DeclRef { binding, .. } => binding_type(&binding),
        NodeKind::Unary { op, operand } => {
            let operand_ty = expr_type(ast, types, strings, operand);
            match op {
                UnOp::Not => b.bool_,
                UnOp::Deref => match types.info(types.canonical(operand_ty)).kind {
                    TypeKind::Pointer { pointee } => pointee,
                    TypeKind::Array { element, .. } => element,
                    _ => operand_ty,
                },
                UnOp::AddrOf => {
                    let stripped = types.strip_reference(operand_ty);
                    types.pointer_to(stripped, strings)
                }
                UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec => operand_ty,
                UnOp::Plus | UnOp::Neg | UnOp::BitNot => promote(types, operand_ty),
            }
        }
        NodeKind::Binary { op, lhs, rhs } => {
            match op {
                BinOp::Lt
                | BinOp::Le
                | BinOp::Gt
                | BinOp::Ge
                | BinOp::Eq
                | BinOp::Ne
                | BinOp::LogicalAnd
                | BinOp::LogicalOr => b.bool_,
                BinOp::Spaceship => b.int,
                BinOp::Comma => expr_type(ast, types, strings, rhs),
                BinOp::Shl | BinOp::Shr => {
                    let l = expr_type(ast, types, strings, lhs);
                    promote(types, l)
                }
                _ => {
                    let l = expr_type(ast, types, strings, lhs);
                    let r = expr_type(ast, types, strings, rhs);
                    // Pointer arithmetic keeps the pointer type.
                    if types.is_pointer(l) {
                        return types.canonical(l);
                    }
                    if types.is_pointer(r) {
                        return types.canonical(r);
                    }
                    usual_arithmetic(types, l, r)
                }
            }
        }
        NodeKind::Assign { lhs, .. } => expr_type(ast, types, strings, lhs),
        NodeKind::Ternary { then_expr, .. } => expr_type(ast, types, strings, then_expr),
        NodeKind::Call { callee, .. } => {
            let callee_ty = expr_type(ast, types, strings, callee);
            return_type_of(types, callee_ty)
        }
        NodeKind::MethodCall { object, method, is_arrow, .. } => {
            let mut obj_ty = expr_type(ast, types, strings, object);
            obj_ty = types.strip_reference(obj_ty);
            if is_arrow {
                if let TypeKind::Pointer { pointee } = types.info(types.canonical(obj_ty)).kind {
                    obj_ty = pointee;
                }
            }
            types
                .find_member_fn(obj_ty, method)
                .map(|(f, _)| return_type_of(types, f.ty))
                .unwrap_or(b.int)
        }
        NodeKind::Member { object, name, is_arrow } => {
            let mut obj_ty = expr_type(ast, types, strings, object);
            obj_ty = types.strip_reference(obj_ty);
            if is_arrow {
                if let TypeKind::Pointer { pointee } = types.info(types.canonical(obj_ty)).kind {
                    obj_ty = pointee;
                }
            }
            types
                .find_member(obj_ty, name)
                .map(|(m, _)| m.ty)
                .unwrap_or(b.int)
        }
        NodeKind::Index { base, .. } => {
            let base_ty = expr_type(ast, types, strings, base);
            match types.info(types.canonical(types.strip_reference(base_ty))).kind {
                TypeKind::Pointer { pointee } => pointee,
                TypeKind::Array { element, .. } => element,
                _ => b.int,
            }
        }
        NodeKind::Cast { to, .. } => to,
        NodeKind::SizeOf { .. } | NodeKind::AlignOf { .. } => b.ulong,
        NodeKind::New { ty, .. } => types.pointer_to(ty, strings),
        NodeKind::Delete { .. } | NodeKind::Throw { .. } => b.void,
        NodeKind::ConstructTemp { ty, .. } => ty,
        NodeKind::InitList { .. } => b.int,
        NodeKind::Lambda { fn_ty, .. } => types.pointer_to(fn_ty, strings),
        // Statements.
        _ => b.void,
    }
}

/// Type recorded in a parse-time binding.
pub fn binding_type(binding: &Binding) -> TypeIndex {
    match binding {
        Binding::Local { ty, .. }
        | Binding::Param { ty, .. }
        | Binding::Global { ty, .. }
        | Binding::Constexpr { ty, .. }
        | Binding::Function { ty, .. }
        | Binding::EnumConst { ty, .. } => *ty,
    }
}

/// Return type of a function (or pointer/reference to function) type.
pub fn return_type_of(types: &TypeRegistry, callee_ty: TypeIndex) -> TypeIndex {
    let canon = types.canonical(callee_ty);
    match &types.info(canon).kind {
        TypeKind::Function { ret, .. } => *ret,
        TypeKind::Pointer { pointee } | TypeKind::Reference { referee: pointee, .. } => {
            match &types.info(types.canonical(*pointee)).kind {
                TypeKind::Function { ret, .. } => *ret,
                _ => types.builtins.int,
            }
        }
        _ => types.builtins.int,
    }
}

/// Element type seen by a range-for over `range_ty`.
pub fn range_element_type(types: &TypeRegistry, range_ty: TypeIndex) -> TypeIndex {
    let canon = types.canonical(types.strip_reference(range_ty));
    match types.info(canon).kind {
        TypeKind::Array { element, .. } => element,
        TypeKind::Pointer { pointee } => pointee,
        _ => canon,
    }
}

/// Integer promotion: anything narrower than `int` widens to `int`.
pub fn promote(types: &TypeRegistry, ty: TypeIndex) -> TypeIndex {
    match types.int_shape(ty) {
        Some((bits, _)) if bits < 32 => types.builtins.int,
        _ => types.canonical(ty),
    }
}

/// The usual arithmetic conversions over two operand types.
pub fn usual_arithmetic(types: &TypeRegistry, lhs: TypeIndex, rhs: TypeIndex) -> TypeIndex {
    let b = types.builtins;
    if types.is_floating(lhs) || types.is_floating(rhs) {
        let lbits = if types.is_floating(lhs) { types.size_bits(lhs) } else { 0 };
        let rbits = if types.is_floating(rhs) { types.size_bits(rhs) } else { 0 };
        return if lbits.max(rbits) > 32 { b.double } else { b.float };
    }
    let (lb, ls) = types.int_shape(lhs).unwrap_or((32, true));
    let (rb, rs) = types.int_shape(rhs).unwrap_or((32, true));
    let bits = lb.max(rb).max(32);
    let signed = if lb == rb {
        ls && rs
    } else if lb > rb {
        ls
    } else {
        rs
    };
    match (bits, signed) {
        (64, true) => b.long,
        (64, false) => b.ulong,
        (_, false) => b.uint,
        _ => b.int,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::parse_clean;
    use crate::ast::NodeKind;

    #[test]
    fn test_usual_arithmetic() {
        let p = parse_clean("");
        let b = p.types.builtins;
        assert_eq!(usual_arithmetic(&p.types, b.char_, b.char_), b.int);
        assert_eq!(usual_arithmetic(&p.types, b.int, b.uint), b.uint);
        assert_eq!(usual_arithmetic(&p.types, b.int, b.long), b.long);
        assert_eq!(usual_arithmetic(&p.types, b.float, b.int), b.float);
        assert_eq!(usual_arithmetic(&p.types, b.float, b.double), b.double);
    }

    #[test]
    fn test_comparison_types_bool() {
        let mut p = parse_clean("int main() { int a = 1; bool c = a < 2; return c; }");
        let main = &p.output.functions[0];
        let body = main.body.expect("body");
        let NodeKind::Compound { stmts } = p.output.ast.kind(body).clone() else {
            panic!("compound expected");
        };
        let NodeKind::VarDecl { decls } = p.output.ast.kind(stmts[1]).clone() else {
            panic!("decl expected");
        };
        let init = match &decls[0].init {
            Some(crate::ast::Initializer::Expr(e)) => *e,
            other => panic!("unexpected {other:?}"),
        };
        let ty = expr_type(&p.output.ast, &mut p.types, &mut p.strings, init);
        assert_eq!(ty, p.types.builtins.bool_);
    }

    #[test]
    fn test_member_access_typing() {
        let mut p = parse_clean(
            "struct P { int x; long y; };\n             int main() { P p{1, 2}; return p.x; }",
        );
        let main = p
            .output
            .functions
            .iter()
            .find(|f| p.strings.view(f.name) == "main")
            .unwrap();
        let body = main.body.unwrap();
        let NodeKind::Compound { stmts } = p.output.ast.kind(body).clone() else {
            panic!()
        };
        let NodeKind::Return(Some(e)) = p.output.ast.kind(stmts[1]).clone() else {
            panic!()
        };
        let ty = expr_type(&p.output.ast, &mut p.types, &mut p.strings, e);
        assert_eq!(ty, p.types.builtins.int);
    }
}
