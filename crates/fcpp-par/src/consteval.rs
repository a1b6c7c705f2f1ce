//! Compile-time expression evaluation.
//!
//! A recursive tree-walker used for template arguments, array bounds,
//! `static_assert`, enumerator values and non-type template parameters.
//!
//! Beyond scalars it evaluates a restricted aggregate subset: brace
//! initialization, constructor calls whose work is done entirely in the
//! member-initializer list (bodies are not executed), member functions whose
//! body is a single `return expression;`, member access, and array
//! subscripts. Anything else fails with `NotConstant` and the caller decides
//! whether that is an error.

use fcpp_sem::{
    ConstBinOp, ConstEvalError, ConstUnOp, ConstValue, TypeIndex, TypeKind, TypeRegistry,
};
use fcpp_util::{NodeId, StringHandle};

use crate::ast::{Ast, BinOp, Binding, FunctionDef, NodeKind, UnOp};

/// Intermediate value: scalars plus aggregates for struct/array constants.
#[derive(Clone, Debug)]
enum EvalValue {
    Scalar(ConstValue),
    Aggregate { ty: TypeIndex, fields: Vec<EvalValue> },
}

impl EvalValue {
    fn scalar(self) -> Result<ConstValue, ConstEvalError> {
        match self {
            EvalValue::Scalar(v) => Ok(v),
            EvalValue::Aggregate { .. } => Err(ConstEvalError::NotConstant),
        }
    }
}

/// Bindings active while evaluating inside a constexpr constructor or
/// member function.
#[derive(Clone, Debug, Default)]
struct Env {
    this_value: Option<Box<EvalValue>>,
    params: Vec<EvalValue>,
}

/// The evaluator. Borrows the registries; owns nothing.
pub struct ConstExprEvaluator<'a> {
    ast: &'a Ast,
    types: &'a TypeRegistry,
    functions: &'a [FunctionDef],
}

impl<'a> ConstExprEvaluator<'a> {
    pub fn new(ast: &'a Ast, types: &'a TypeRegistry) -> Self {
        Self {
            ast,
            types,
            functions: &[],
        }
    }

    /// Provide the function list so constexpr constructors with
    /// member-initializer lists can be evaluated.
    pub fn with_functions(mut self, functions: &'a [FunctionDef]) -> Self {
        self.functions = functions;
        self
    }

    /// Evaluate to a scalar constant.
    pub fn eval(&mut self, id: NodeId) -> Result<ConstValue, ConstEvalError> {
        let env = Env::default();
        self.eval_inner(id, &env)?.scalar()
    }

    fn eval_inner(&mut self, id: NodeId, env: &Env) -> Result<EvalValue, ConstEvalError> {
        match self.ast.kind(id).clone() {
            NodeKind::IntLit { value, ty } => {
                let (bits, signed) = self.types.int_shape(ty).unwrap_or((32, true));
                Ok(EvalValue::Scalar(ConstValue::Int {
                    value: value as i64,
                    bits,
                    signed,
                }))
            }
            NodeKind::FloatLit { value, .. } => Ok(EvalValue::Scalar(ConstValue::Float(value))),
            NodeKind::BoolLit(v) => Ok(EvalValue::Scalar(ConstValue::Bool(v))),
            NodeKind::CharLit { value, .. } => Ok(EvalValue::Scalar(ConstValue::Int {
                value: value as i64,
                bits: 8,
                signed: true,
            })),
            NodeKind::NullPtr => Ok(EvalValue::Scalar(ConstValue::Int {
                value: 0,
                bits: 64,
                signed: false,
            })),
            NodeKind::DeclRef { binding, .. } => match binding {
                Binding::Constexpr { value, .. } => Ok(EvalValue::Scalar(value)),
                Binding::EnumConst { value, ty } => {
                    let (bits, signed) = self.types.int_shape(ty).unwrap_or((32, true));
                    Ok(EvalValue::Scalar(ConstValue::Int { value, bits, signed }))
                }
                Binding::Param { index, .. } => env
                    .params
                    .get(index as usize)
                    .cloned()
                    .ok_or(ConstEvalError::NotConstant),
                _ => Err(ConstEvalError::NotConstant),
            },
            NodeKind::This { .. } => env
                .this_value
                .as_deref()
                .cloned()
                .ok_or(ConstEvalError::NotConstant),
            NodeKind::Unary { op, operand } => {
                let op = match op {
                    UnOp::Plus => ConstUnOp::Plus,
                    UnOp::Neg => ConstUnOp::Neg,
                    UnOp::Not => ConstUnOp::LogicalNot,
                    UnOp::BitNot => ConstUnOp::BitNot,
                    _ => return Err(ConstEvalError::NotConstant),
                };
                let v = self.eval_inner(operand, env)?.scalar()?;
                ConstValue::unary(op, v).map(EvalValue::Scalar)
            }
            NodeKind::Binary { op, lhs, rhs } => {
                if op == BinOp::Comma {
                    self.eval_inner(lhs, env)?;
                    return self.eval_inner(rhs, env);
                }
                let op = match op {
                    BinOp::Add => ConstBinOp::Add,
                    BinOp::Sub => ConstBinOp::Sub,
                    BinOp::Mul => ConstBinOp::Mul,
                    BinOp::Div => ConstBinOp::Div,
                    BinOp::Rem => ConstBinOp::Rem,
                    BinOp::Shl => ConstBinOp::Shl,
                    BinOp::Shr => ConstBinOp::Shr,
                    BinOp::Lt => ConstBinOp::Lt,
                    BinOp::Le => ConstBinOp::Le,
                    BinOp::Gt => ConstBinOp::Gt,
                    BinOp::Ge => ConstBinOp::Ge,
                    BinOp::Eq => ConstBinOp::Eq,
                    BinOp::Ne => ConstBinOp::Ne,
                    BinOp::BitAnd => ConstBinOp::BitAnd,
                    BinOp::BitOr => ConstBinOp::BitOr,
                    BinOp::BitXor => ConstBinOp::BitXor,
                    BinOp::LogicalAnd => ConstBinOp::LogicalAnd,
                    BinOp::LogicalOr => ConstBinOp::LogicalOr,
                    BinOp::Spaceship | BinOp::Comma => return Err(ConstEvalError::NotConstant),
                };
                let l = self.eval_inner(lhs, env)?.scalar()?;
                // Short-circuit without evaluating the right side on a
                // decided logical operator.
                if op == ConstBinOp::LogicalAnd && !l.as_bool() {
                    return Ok(EvalValue::Scalar(ConstValue::Bool(false)));
                }
                if op == ConstBinOp::LogicalOr && l.as_bool() {
                    return Ok(EvalValue::Scalar(ConstValue::Bool(true)));
                }
                let r = self.eval_inner(rhs, env)?.scalar()?;
                ConstValue::binary(op, l, r).map(EvalValue::Scalar)
            }
            NodeKind::Ternary { cond, then_expr, else_expr } => {
                let c = self.eval_inner(cond, env)?.scalar()?;
                if c.as_bool() {
                    self.eval_inner(then_expr, env)
                } else {
                    self.eval_inner(else_expr, env)
                }
            }
            NodeKind::Cast { to, expr } => {
                let v = self.eval_inner(expr, env)?.scalar()?;
                self.convert(v, to)
            }
            NodeKind::SizeOf { ty } => Ok(EvalValue::Scalar(ConstValue::Int {
                value: (self.types.size_bits(ty) / 8) as i64,
                bits: 64,
                signed: false,
            })),
            NodeKind::AlignOf { ty } => Ok(EvalValue::Scalar(ConstValue::Int {
                value: (self.types.align_bits(ty) / 8) as i64,
                bits: 64,
                signed: false,
            })),
            NodeKind::InitList { elems } => {
                let fields = elems
                    .iter()
                    .map(|&e| self.eval_inner(e, env))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(EvalValue::Aggregate { ty: self.types.builtins.void, fields })
            }
            NodeKind::ConstructTemp { ty, args } => self.construct(ty, &args, env),
            NodeKind::Member { object, name, .. } => {
                let value = self.eval_inner(object, env)?;
                self.project_member(value, name)
            }
            NodeKind::Index { base, index } => {
                let agg = self.eval_inner(base, env)?;
                let idx = self.eval_inner(index, env)?.scalar()?.as_int()?;
                match agg {
                    EvalValue::Aggregate { fields, .. } => fields
                        .into_iter()
                        .nth(idx as usize)
                        .ok_or(ConstEvalError::NotConstant),
                    EvalValue::Scalar(_) => Err(ConstEvalError::NotConstant),
                }
            }
            NodeKind::MethodCall { object, method, args, .. } => {
                self.eval_method_call(object, method, &args, env)
            }
            _ => Err(ConstEvalError::NotConstant),
        }
    }

    /// Constructor-call or aggregate construction of a class constant.
    fn construct(
        &mut self,
        ty: TypeIndex,
        args: &[NodeId],
        env: &Env,
    ) -> Result<EvalValue, ConstEvalError> {
        let canon = self.types.canonical(ty);
        if !self.types.is_class(canon) {
            // Scalar functional cast `int(x)`.
            if let Some(&arg) = args.first() {
                let v = self.eval_inner(arg, env)?.scalar()?;
                return self.convert(v, canon);
            }
            return Ok(EvalValue::Scalar(ConstValue::Int {
                value: 0,
                bits: 32,
                signed: true,
            }));
        }

        // A constructor whose member-initializer list covers the members:
        // evaluate each initializer with the arguments bound as parameters.
        let ctor = self
            .functions
            .iter()
            .find(|f| f.is_ctor && f.method_of == Some(canon) && f.params.len() == args.len());
        let member_names: Vec<StringHandle> = self
            .types
            .struct_of(canon)
            .map(|s| s.members.iter().map(|m| m.name).collect())
            .unwrap_or_default();
        if let Some(ctor) = ctor {
            if !ctor.ctor_inits.is_empty() {
                let inits = ctor.ctor_inits.clone();
                let params = args
                    .iter()
                    .map(|&a| self.eval_inner(a, env))
                    .collect::<Result<Vec<_>, _>>()?;
                let ctor_env = Env { this_value: None, params };
                let mut fields = Vec::with_capacity(member_names.len());
                for name in &member_names {
                    let init = inits
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|&(_, e)| e)
                        .ok_or(ConstEvalError::NotConstant)?;
                    fields.push(self.eval_inner(init, &ctor_env)?);
                }
                return Ok(EvalValue::Aggregate { ty: canon, fields });
            }
        }

        // Aggregate initialization in member order.
        let fields = args
            .iter()
            .map(|&a| self.eval_inner(a, env))
            .collect::<Result<Vec<_>, _>>()?;
        if fields.len() > member_names.len() {
            return Err(ConstEvalError::NotConstant);
        }
        Ok(EvalValue::Aggregate { ty: canon, fields })
    }

    fn project_member(
        &mut self,
        value: EvalValue,
        name: StringHandle,
    ) -> Result<EvalValue, ConstEvalError> {
        match value {
            EvalValue::Aggregate { ty, fields } => {
                let index = self
                    .types
                    .struct_of(ty)
                    .and_then(|s| s.members.iter().position(|m| m.name == name))
                    .ok_or(ConstEvalError::NotConstant)?;
                fields
                    .into_iter()
                    .nth(index)
                    .ok_or(ConstEvalError::NotConstant)
            }
            EvalValue::Scalar(_) => Err(ConstEvalError::NotConstant),
        }
    }

    /// A constexpr member function restricted to a single
    /// `return expression;` body.
    fn eval_method_call(
        &mut self,
        object: NodeId,
        method: StringHandle,
        args: &[NodeId],
        env: &Env,
    ) -> Result<EvalValue, ConstEvalError> {
        let obj = self.eval_inner(object, env)?;
        let obj_ty = match &obj {
            EvalValue::Aggregate { ty, .. } => *ty,
            EvalValue::Scalar(_) => return Err(ConstEvalError::NotConstant),
        };
        let func = self
            .functions
            .iter()
            .find(|f| f.method_of == Some(obj_ty) && f.name == method && !f.is_ctor)
            .ok_or(ConstEvalError::NotConstant)?;
        let body = func.body.ok_or(ConstEvalError::NotConstant)?;
        let ret_expr = self.single_return_expr(body)?;
        let params = args
            .iter()
            .map(|&a| self.eval_inner(a, env))
            .collect::<Result<Vec<_>, _>>()?;
        let method_env = Env { this_value: Some(Box::new(obj)), params };
        self.eval_inner(ret_expr, &method_env)
    }

    fn single_return_expr(&self, body: NodeId) -> Result<NodeId, ConstEvalError> {
        match self.ast.kind(body) {
            NodeKind::Compound { stmts } if stmts.len() == 1 => match self.ast.kind(stmts[0]) {
                NodeKind::Return(Some(e)) => Ok(*e),
                _ => Err(ConstEvalError::NotConstant),
            },
            _ => Err(ConstEvalError::NotConstant),
        }
    }

    fn convert(&mut self, v: ConstValue, to: TypeIndex) -> Result<EvalValue, ConstEvalError> {
        let canon = self.types.canonical(to);
        let int_shape = match self.types.info(canon).kind {
            TypeKind::Bool => return Ok(EvalValue::Scalar(ConstValue::Bool(v.as_bool()))),
            TypeKind::Float { .. } => {
                let f = match v {
                    ConstValue::Float(f) => f,
                    other => other.as_int()? as f64,
                };
                return Ok(EvalValue::Scalar(ConstValue::Float(f)));
            }
            TypeKind::Int { signed, bits } => (bits, signed),
            // Enums convert through their underlying shape.
            TypeKind::Enum { .. } => self.types.int_shape(canon).unwrap_or((32, true)),
            // Pointer casts and class conversions are not constant.
            _ => return Err(ConstEvalError::NotConstant),
        };
        let (bits, signed) = int_shape;
        let raw = match v {
            ConstValue::Float(f) => f as i64,
            other => other.as_int()?,
        };
        let truncated = if bits >= 64 {
            raw
        } else {
            let mask = (1i64 << bits) - 1;
            let low = raw & mask;
            if signed && (low >> (bits - 1)) & 1 == 1 {
                low | !mask
            } else {
                low
            }
        };
        Ok(EvalValue::Scalar(ConstValue::Int { value: truncated, bits, signed }))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{parse_clean, parse_src};

    #[test]
    fn test_static_assert_arithmetic() {
        let p = parse_clean("static_assert(2 + 2 * 10 == 22, \"precedence\");");
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_static_assert_ternary_and_logic() {
        let p = parse_clean(
            "static_assert((1 < 2 ? 10 : 20) == 10 && !(3 == 4), \"logic\");",
        );
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_sizeof_constant() {
        let p = parse_clean(
            "static_assert(sizeof(int) == 4 && sizeof(long) == 8, \"lp64\");",
        );
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_division_by_zero_rejected() {
        let p = parse_src("static_assert(1 / 0 == 0, \"boom\");");
        assert!(p.handler.has_errors());
    }

    #[test]
    fn test_constexpr_variable_propagates() {
        let p = parse_clean(
            "constexpr int base = 40; constexpr int answer = base + 2;\n             static_assert(answer == 42, \"42\");",
        );
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_enum_constants_fold() {
        let p = parse_clean(
            "enum Flags { A = 1, B = 2, C = 4 };\n             static_assert((A | C) == 5, \"bits\");",
        );
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_array_bound_must_be_constant() {
        let p = parse_src("int main() { int n = 3; int a[n]; return 0; }");
        assert!(p.handler.has_errors(), "VLA rejected");
    }
}
