//! Expression parsing.
//!
//! Precedence climbing over a fixed binding-power ladder, ordered
//! `shift > spaceship > relational > equality > &, ^, | > && > || >
//! ternary > assignment > comma`. Unary and postfix operators are handled
//! separately; primary expressions cover literals, qualified ids,
//! template-ids, lambdas, `sizeof`, `new`/`delete` and the cast spellings.
//!
//! While `template_arg_depth > 0`, a bare `>` (or `>>`) terminates the
//! expression instead of parsing as a comparison; parenthesized
//! subexpressions suspend that rule.

use fcpp_lex::{Kw, Punct, TokenKind};
use fcpp_sem::{Declaration, InstantiatedEntity, TemplateKind, TypeKind};
use fcpp_util::{NodeId, StringHandle};

use crate::ast::{BinOp, Binding, NodeKind, UnOp};
use crate::{PResult, Parser};

/// Binding powers, higher binds tighter. Left-associative operators use
/// `(bp, bp + 1)`.
fn binop_bp(punct: Punct) -> Option<(u8, u8, BinOp)> {
    use Punct::*;
    Some(match punct {
        PipePipe => (4, 5, BinOp::LogicalOr),
        AmpAmp => (6, 7, BinOp::LogicalAnd),
        Pipe => (8, 9, BinOp::BitOr),
        Caret => (10, 11, BinOp::BitXor),
        Amp => (12, 13, BinOp::BitAnd),
        EqEq => (14, 15, BinOp::Eq),
        BangEq => (14, 15, BinOp::Ne),
        Lt => (16, 17, BinOp::Lt),
        LtEq => (16, 17, BinOp::Le),
        Gt => (16, 17, BinOp::Gt),
        GtEq => (16, 17, BinOp::Ge),
        Spaceship => (18, 19, BinOp::Spaceship),
        Shl => (20, 21, BinOp::Shl),
        Shr => (20, 21, BinOp::Shr),
        Plus => (22, 23, BinOp::Add),
        Minus => (22, 23, BinOp::Sub),
        Star => (24, 25, BinOp::Mul),
        Slash => (24, 25, BinOp::Div),
        Percent => (24, 25, BinOp::Rem),
        _ => return None,
    })
}

fn compound_assign_op(punct: Punct) -> Option<BinOp> {
    use Punct::*;
    Some(match punct {
        PlusEq => BinOp::Add,
        MinusEq => BinOp::Sub,
        StarEq => BinOp::Mul,
        SlashEq => BinOp::Div,
        PercentEq => BinOp::Rem,
        AmpEq => BinOp::BitAnd,
        PipeEq => BinOp::BitOr,
        CaretEq => BinOp::BitXor,
        ShlEq => BinOp::Shl,
        ShrEq => BinOp::Shr,
        _ => return None,
    })
}

impl<'ctx> Parser<'ctx> {
    /// Assignment-expression: the default entry (no top-level comma).
    pub(crate) fn parse_expr(&mut self) -> PResult<NodeId> {
        self.parse_assign()
    }

    /// Full expression including the comma operator.
    pub(crate) fn parse_expr_with_comma(&mut self) -> PResult<NodeId> {
        let mut lhs = self.parse_assign()?;
        while self.at_punct(Punct::Comma) {
            let span = self.bump().span;
            let rhs = self.parse_assign()?;
            lhs = self.ast.alloc(
                NodeKind::Binary { op: BinOp::Comma, lhs, rhs },
                span,
            );
        }
        Ok(lhs)
    }

    fn parse_assign(&mut self) -> PResult<NodeId> {
        if self.at_kw(Kw::Throw) {
            let span = self.bump().span;
            let expr = if matches!(
                self.cur().kind,
                TokenKind::Punct(Punct::Semi | Punct::RParen | Punct::Comma | Punct::Colon)
            ) {
                None
            } else {
                Some(self.parse_assign()?)
            };
            return Ok(self.ast.alloc(NodeKind::Throw { expr }, span));
        }

        let lhs = self.parse_ternary()?;
        if self.at_punct(Punct::Assign) {
            let span = self.bump().span;
            let rhs = self.parse_assign()?;
            return Ok(self.ast.alloc(NodeKind::Assign { op: None, lhs, rhs }, span));
        }
        if let TokenKind::Punct(p) = self.cur().kind {
            if let Some(op) = compound_assign_op(p) {
                let span = self.bump().span;
                let rhs = self.parse_assign()?;
                return Ok(self
                    .ast
                    .alloc(NodeKind::Assign { op: Some(op), lhs, rhs }, span));
            }
        }
        Ok(lhs)
    }

    /// Conditional-expression; also the entry for constant expressions in
    /// template arguments and array bounds.
    pub(crate) fn parse_ternary(&mut self) -> PResult<NodeId> {
        let cond = self.parse_bin_expr(4)?;
        if !self.at_punct(Punct::Question) {
            return Ok(cond);
        }
        let span = self.bump().span;
        let then_expr = self.parse_assign()?;
        self.expect_punct(Punct::Colon)?;
        let else_expr = self.parse_assign()?;
        Ok(self.ast.alloc(
            NodeKind::Ternary { cond, then_expr, else_expr },
            span,
        ))
    }

    fn parse_bin_expr(&mut self, min_bp: u8) -> PResult<NodeId> {
        let mut lhs = self.parse_unary()?;
        loop {
            let punct = match self.cur().kind {
                TokenKind::Punct(p) => p,
                _ => break,
            };
            // Inside a template argument list an unparenthesized `>`/`>>`
            // closes the list rather than comparing.
            if self.template_arg_depth > 0 && matches!(punct, Punct::Gt | Punct::Shr) {
                break;
            }
            let Some((l_bp, r_bp, op)) = binop_bp(punct) else { break };
            if l_bp < min_bp {
                break;
            }
            let span = self.bump().span;
            let rhs = self.parse_bin_expr(r_bp)?;
            lhs = self.ast.alloc(NodeKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<NodeId> {
        let token = *self.cur();
        let op = match token.kind {
            TokenKind::Punct(Punct::Plus) => Some(UnOp::Plus),
            TokenKind::Punct(Punct::Minus) => Some(UnOp::Neg),
            TokenKind::Punct(Punct::Bang) => Some(UnOp::Not),
            TokenKind::Punct(Punct::Tilde) => Some(UnOp::BitNot),
            TokenKind::Punct(Punct::PlusPlus) => Some(UnOp::PreInc),
            TokenKind::Punct(Punct::MinusMinus) => Some(UnOp::PreDec),
            TokenKind::Punct(Punct::Star) => Some(UnOp::Deref),
            TokenKind::Punct(Punct::Amp) => Some(UnOp::AddrOf),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(self.ast.alloc(NodeKind::Unary { op, operand }, token.span));
        }

        if token.is_kw(Kw::Sizeof) || token.is_kw(Kw::Alignof) {
            return self.parse_sizeof(token.is_kw(Kw::Alignof));
        }
        if token.is_kw(Kw::New) {
            return self.parse_new();
        }
        if token.is_kw(Kw::Delete) {
            let span = self.bump().span;
            let is_array = self.eat_punct(Punct::LBracket);
            if is_array {
                self.expect_punct(Punct::RBracket)?;
            }
            let expr = self.parse_unary()?;
            return Ok(self.ast.alloc(NodeKind::Delete { expr, is_array }, span));
        }

        // C-style cast: `(type) unary-expr`.
        if token.is_punct(Punct::LParen) {
            let mark = self.toks.save();
            self.bump();
            if let Ok(Some(parsed)) = self.try_parse_type() {
                if let Ok(base) = parsed.expect_concrete(self) {
                    let to = self.parse_declarator_prefix(base);
                    if self.at_punct(Punct::RParen) {
                        let after_paren = self.toks.peek(1).kind;
                        let casts = !matches!(
                            after_paren,
                            TokenKind::Punct(
                                Punct::RParen
                                    | Punct::Semi
                                    | Punct::Comma
                                    | Punct::RBracket
                                    | Punct::RBrace
                            ) | TokenKind::Eof
                        );
                        if casts {
                            self.bump();
                            let expr = self.parse_unary()?;
                            return Ok(self.ast.alloc(NodeKind::Cast { to, expr }, token.span));
                        }
                    }
                }
            }
            self.toks.restore(mark);
        }

        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_sizeof(&mut self, is_alignof: bool) -> PResult<NodeId> {
        let span = self.bump().span;
        let ty = if self.at_punct(Punct::LParen) {
            let mark = self.toks.save();
            self.bump();
            match self.try_parse_type()? {
                Some(parsed) => {
                    let base = parsed.expect_concrete(self)?;
                    let ty = self.parse_declarator_prefix(base);
                    self.expect_punct(Punct::RParen)?;
                    ty
                }
                None => {
                    self.toks.restore(mark);
                    let expr = self.parse_unary()?;
                    crate::typecheck::expr_type(&self.ast, self.types, self.strings, expr)
                }
            }
        } else {
            let expr = self.parse_unary()?;
            crate::typecheck::expr_type(&self.ast, self.types, self.strings, expr)
        };
        let kind = if is_alignof {
            NodeKind::AlignOf { ty }
        } else {
            NodeKind::SizeOf { ty }
        };
        Ok(self.ast.alloc(kind, span))
    }

    fn parse_new(&mut self) -> PResult<NodeId> {
        let span = self.bump().span;
        let parsed = self
            .parse_type_specifier()?
            .ok_or_else(|| self.err_here("expected type after 'new'"))?;
        let base = parsed.expect_concrete(self)?;
        let ty = self.parse_declarator_prefix(base);
        let array_len = if self.eat_punct(Punct::LBracket) {
            let len = self.parse_expr()?;
            self.expect_punct(Punct::RBracket)?;
            Some(len)
        } else {
            None
        };
        let mut args = Vec::new();
        if self.at_punct(Punct::LParen) {
            args = self.parse_call_args()?;
        } else if self.at_punct(Punct::LBrace) {
            args = self.parse_braced_args()?;
        }
        Ok(self.ast.alloc(NodeKind::New { ty, args, array_len }, span))
    }

    fn parse_postfix(&mut self, mut expr: NodeId) -> PResult<NodeId> {
        loop {
            let token = *self.cur();
            match token.kind {
                TokenKind::Punct(Punct::LParen) => {
                    let args = self.parse_call_args()?;
                    expr = self.ast.alloc(NodeKind::Call { callee: expr, args }, token.span);
                }
                TokenKind::Punct(Punct::LBracket) => {
                    self.bump();
                    let index = self.parse_expr_with_comma()?;
                    self.expect_punct(Punct::RBracket)?;
                    expr = self
                        .ast
                        .alloc(NodeKind::Index { base: expr, index }, token.span);
                }
                TokenKind::Punct(Punct::Dot) | TokenKind::Punct(Punct::Arrow) => {
                    let is_arrow = token.is_punct(Punct::Arrow);
                    self.bump();
                    let name = self.expect_ident()?;
                    if self.at_punct(Punct::LParen) {
                        let args = self.parse_call_args()?;
                        expr = self.ast.alloc(
                            NodeKind::MethodCall { object: expr, method: name, args, is_arrow },
                            token.span,
                        );
                    } else {
                        expr = self.ast.alloc(
                            NodeKind::Member { object: expr, name, is_arrow },
                            token.span,
                        );
                    }
                }
                TokenKind::Punct(Punct::PlusPlus) => {
                    self.bump();
                    expr = self.ast.alloc(
                        NodeKind::Unary { op: UnOp::PostInc, operand: expr },
                        token.span,
                    );
                }
                TokenKind::Punct(Punct::MinusMinus) => {
                    self.bump();
                    expr = self.ast.alloc(
                        NodeKind::Unary { op: UnOp::PostDec, operand: expr },
                        token.span,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    pub(crate) fn parse_call_args(&mut self) -> PResult<Vec<NodeId>> {
        self.expect_punct(Punct::LParen)?;
        // Parentheses suspend the template-argument terminator rule.
        let saved_depth = std::mem::take(&mut self.template_arg_depth);
        let result = (|| {
            let mut args = Vec::new();
            if self.eat_punct(Punct::RParen) {
                return Ok(args);
            }
            loop {
                args.push(self.parse_expr()?);
                if self.eat_punct(Punct::Comma) {
                    continue;
                }
                self.expect_punct(Punct::RParen)?;
                return Ok(args);
            }
        })();
        self.template_arg_depth = saved_depth;
        result
    }

    pub(crate) fn parse_braced_args(&mut self) -> PResult<Vec<NodeId>> {
        self.expect_punct(Punct::LBrace)?;
        let mut elems = Vec::new();
        if self.eat_punct(Punct::RBrace) {
            return Ok(elems);
        }
        loop {
            elems.push(self.parse_expr()?);
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            self.expect_punct(Punct::RBrace)?;
            return Ok(elems);
        }
    }

    fn parse_primary(&mut self) -> PResult<NodeId> {
        let token = *self.cur();
        match token.kind {
            TokenKind::IntLit => {
                self.bump();
                let text = self.strings.view(token.text).to_string();
                let parsed = fcpp_lex::int_literal_value(&text).map_err(|e| crate::ParseError {
                    message: e.to_string(),
                    span: token.span,
                    fatal: false,
                })?;
                let b = self.types.builtins;
                let ty = if parsed.suffix.is_unsigned() {
                    if parsed.suffix.min_bits() > 32 || parsed.value > u32::MAX as u64 {
                        b.ullong
                    } else {
                        b.uint
                    }
                } else if parsed.suffix.min_bits() > 32 || parsed.value > i32::MAX as u64 {
                    b.llong
                } else {
                    b.int
                };
                Ok(self
                    .ast
                    .alloc(NodeKind::IntLit { value: parsed.value, ty }, token.span))
            }
            TokenKind::FloatLit => {
                self.bump();
                let text = self.strings.view(token.text).to_string();
                let parsed =
                    fcpp_lex::float_literal_value(&text).map_err(|e| crate::ParseError {
                        message: e.to_string(),
                        span: token.span,
                        fatal: false,
                    })?;
                let b = self.types.builtins;
                let ty = match parsed.suffix {
                    fcpp_lex::FloatSuffix::F => b.float,
                    _ => b.double,
                };
                Ok(self
                    .ast
                    .alloc(NodeKind::FloatLit { value: parsed.value, ty }, token.span))
            }
            TokenKind::CharLit => {
                self.bump();
                let value = fcpp_lex::char_literal_value(self.strings.view(token.text));
                let ty = self.types.builtins.char_;
                Ok(self.ast.alloc(NodeKind::CharLit { value, ty }, token.span))
            }
            TokenKind::StringLit => {
                self.bump();
                Ok(self
                    .ast
                    .alloc(NodeKind::StringLit { text: token.text }, token.span))
            }
            TokenKind::Keyword(Kw::True) => {
                self.bump();
                Ok(self.ast.alloc(NodeKind::BoolLit(true), token.span))
            }
            TokenKind::Keyword(Kw::False) => {
                self.bump();
                Ok(self.ast.alloc(NodeKind::BoolLit(false), token.span))
            }
            TokenKind::Keyword(Kw::Nullptr) => {
                self.bump();
                Ok(self.ast.alloc(NodeKind::NullPtr, token.span))
            }
            TokenKind::Keyword(Kw::This) => {
                self.bump();
                let class_ty = self
                    .fn_ctx
                    .as_ref()
                    .and_then(|f| f.method_of)
                    .ok_or_else(|| self.err_here("'this' outside of a member function"))?;
                Ok(self.ast.alloc(NodeKind::This { class_ty }, token.span))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.bump();
                let saved_depth = std::mem::take(&mut self.template_arg_depth);
                let inner = self.parse_expr_with_comma();
                self.template_arg_depth = saved_depth;
                let inner = inner?;
                self.expect_punct(Punct::RParen)?;
                Ok(inner)
            }
            TokenKind::Punct(Punct::LBracket) => self.parse_lambda(),
            TokenKind::Punct(Punct::LBrace) => {
                let elems = self.parse_braced_args()?;
                Ok(self.ast.alloc(NodeKind::InitList { elems }, token.span))
            }
            TokenKind::Keyword(
                Kw::StaticCast | Kw::ReinterpretCast | Kw::ConstCast | Kw::DynamicCast,
            ) => {
                self.bump();
                self.expect_punct(Punct::Lt)?;
                let parsed = self
                    .parse_type_specifier()?
                    .ok_or_else(|| self.err_here("expected type in cast"))?;
                let base = parsed.expect_concrete(self)?;
                let to = self.parse_declarator_prefix(base);
                if self.at_punct(Punct::Shr) {
                    self.toks.split_right_shift(self.strings);
                }
                self.expect_punct(Punct::Gt)?;
                self.expect_punct(Punct::LParen)?;
                let expr = self.parse_expr_with_comma()?;
                self.expect_punct(Punct::RParen)?;
                Ok(self.ast.alloc(NodeKind::Cast { to, expr }, token.span))
            }
            TokenKind::Identifier => self.parse_id_expression(),
            // A builtin type keyword in expression position is a functional
            // cast: `int(x)`.
            TokenKind::Keyword(
                Kw::Int | Kw::Bool | Kw::Char | Kw::Float | Kw::Double | Kw::Unsigned
                | Kw::Signed | Kw::Long | Kw::Short | Kw::Void,
            ) => {
                let parsed = self
                    .parse_type_specifier()?
                    .ok_or_else(|| self.err_here("expected type"))?;
                let ty = parsed.expect_concrete(self)?;
                let args = if self.at_punct(Punct::LBrace) {
                    self.parse_braced_args()?
                } else {
                    self.parse_call_args()?
                };
                Ok(self.ast.alloc(NodeKind::ConstructTemp { ty, args }, token.span))
            }
            _ => Err(self.err_here(format!(
                "expected expression, found '{}'",
                self.cur_text()
            ))),
        }
    }

    /// Identifier, qualified-id, or template-id in expression position.
    fn parse_id_expression(&mut self) -> PResult<NodeId> {
        let token = *self.cur();
        let first = token.text;

        // Collect a `ns::ns::name` path, stopping when a component resolves
        // to a class or enum type (the `::` then selects a member).
        let mut components = vec![first];
        self.bump();
        while self.at_punct(Punct::ColonColon)
            && self.toks.peek(1).kind == TokenKind::Identifier
            && self.resolve_type_components(&components).is_none()
        {
            self.bump();
            components.push(self.bump().text);
        }
        let last = *components.last().expect("non-empty path");

        // Template-id: `name<args...>`.
        if self.at_punct(Punct::Lt) && self.template_args_ahead() {
            let unq = self.unqualified_handle(last);
            if self.templates.is_template(unq) {
                return self.parse_template_id_expression(unq, token.span);
            }
        }

        // A type name: scoped enum access, static member, or functional cast.
        if let Some(ty) = self.resolve_type_components(&components) {
            return self.parse_type_suffix_expression(ty, token.span);
        }

        // Plain (possibly qualified) value lookup.
        let lookup_name = if components.len() == 1 {
            last
        } else {
            self.join_components(&components)
        };
        if let Some(node) = self.resolve_value_name(lookup_name, token.span)? {
            return Ok(node);
        }

        // `using namespace` fallback: retry under each imported prefix.
        for ns in self.using_namespaces.clone() {
            let joined = {
                let text = format!(
                    "{}::{}",
                    self.strings.view(ns),
                    self.strings.view(lookup_name)
                );
                self.strings.intern(&text)
            };
            if let Some(node) = self.resolve_value_name(joined, token.span)? {
                return Ok(node);
            }
        }

        // A function template called with deduced arguments: `max(a, b)`.
        let unq = self.unqualified_handle(lookup_name);
        if self.templates.is_template(unq) && self.at_punct(Punct::LParen) {
            return self.parse_deduced_template_call(unq, token.span);
        }

        Err(crate::ParseError {
            message: format!(
                "use of undeclared identifier '{}'",
                self.strings.view(lookup_name)
            ),
            span: token.span,
            fatal: false,
        })
    }

    /// Resolve a value name through template parameters and the scope stack.
    fn resolve_value_name(
        &mut self,
        name: StringHandle,
        span: fcpp_util::Span,
    ) -> PResult<Option<NodeId>> {
        // Bound non-type template parameters first.
        if let Some(Declaration::TemplateValue { ty, value }) =
            self.scopes.lookup_template_param(name)
        {
            let (ty, value) = (*ty, *value);
            return Ok(Some(self.ast.alloc(
                NodeKind::DeclRef { name, binding: Binding::Constexpr { value, ty } },
                span,
            )));
        }
        let decl = match self.scopes.lookup(name) {
            Some(d) => d.clone(),
            None => {
                // Inside a member function, an unqualified name may be a
                // field or method of the enclosing class.
                if let Some(class_ty) = self.fn_ctx.as_ref().and_then(|f| f.method_of) {
                    if self.types.find_member(class_ty, name).is_some() {
                        let this = self.ast.alloc(NodeKind::This { class_ty }, span);
                        return Ok(Some(self.ast.alloc(
                            NodeKind::Member { object: this, name, is_arrow: true },
                            span,
                        )));
                    }
                    if self.types.find_member_fn(class_ty, name).is_some()
                        && self.at_punct(Punct::LParen)
                    {
                        let this = self.ast.alloc(NodeKind::This { class_ty }, span);
                        let args = self.parse_call_args()?;
                        return Ok(Some(self.ast.alloc(
                            NodeKind::MethodCall {
                                object: this,
                                method: name,
                                args,
                                is_arrow: true,
                            },
                            span,
                        )));
                    }
                    if let Some(s) = self.types.struct_of(class_ty) {
                        if let Some(sm) = s.static_member(name) {
                            if let Some(value) = sm.const_value {
                                let ty = sm.ty;
                                return Ok(Some(self.ast.alloc(
                                    NodeKind::DeclRef {
                                        name,
                                        binding: Binding::Constexpr { value, ty },
                                    },
                                    span,
                                )));
                            }
                        }
                    }
                }
                return Ok(None);
            }
        };
        let binding = match decl {
            Declaration::Local { local, ty } => Binding::Local { local, ty },
            Declaration::Param { index, ty } => Binding::Param { index, ty },
            Declaration::Global { ty, .. } => Binding::Global {
                name,
                path: self.scopes.current_path(),
                ty,
            },
            Declaration::Constexpr { ty, value } => Binding::Constexpr { value, ty },
            Declaration::EnumConst { ty, value } => Binding::EnumConst { value, ty },
            Declaration::TemplateValue { ty, value } => Binding::Constexpr { value, ty },
            Declaration::Function(set) => {
                let f = set
                    .overloads
                    .first()
                    .ok_or_else(|| self.err_here("empty overload set"))?;
                Binding::Function {
                    name: f.name,
                    path: f.path.clone(),
                    ty: f.ty,
                    is_extern_c: f.is_extern_c,
                }
            }
            Declaration::Type(_) | Declaration::Template(_) | Declaration::Namespace(_) => {
                return Ok(None)
            }
        };
        Ok(Some(self.ast.alloc(NodeKind::DeclRef { name, binding }, span)))
    }

    /// `Type::member`, `Enum::enumerator`, `Type(args)`, `Type{args}`.
    fn parse_type_suffix_expression(
        &mut self,
        ty: fcpp_sem::TypeIndex,
        span: fcpp_util::Span,
    ) -> PResult<NodeId> {
        if self.at_punct(Punct::ColonColon) && self.toks.peek(1).kind == TokenKind::Identifier {
            self.bump();
            let member = self.bump().text;
            return self.resolve_scoped_member(ty, member, span);
        }
        if self.at_punct(Punct::LParen) {
            let args = self.parse_call_args()?;
            return Ok(self.ast.alloc(NodeKind::ConstructTemp { ty, args }, span));
        }
        if self.at_punct(Punct::LBrace) {
            let args = self.parse_braced_args()?;
            return Ok(self.ast.alloc(NodeKind::ConstructTemp { ty, args }, span));
        }
        Err(crate::ParseError {
            message: "expected '::', '(' or '{' after type name in expression".to_string(),
            span,
            fatal: false,
        })
    }

    /// `T::name` where `T` is a class or enum type.
    pub(crate) fn resolve_scoped_member(
        &mut self,
        ty: fcpp_sem::TypeIndex,
        member: StringHandle,
        span: fcpp_util::Span,
    ) -> PResult<NodeId> {
        let canon = self.types.canonical(ty);
        match &self.types.info(canon).kind {
            TypeKind::Enum { id } => {
                let info = &self.types.enums[*id];
                let value = info
                    .enumerators
                    .iter()
                    .find(|(n, _)| *n == member)
                    .map(|&(_, v)| v)
                    .ok_or_else(|| crate::ParseError {
                        message: format!("no enumerator '{}'", self.strings.view(member)),
                        span,
                        fatal: false,
                    })?;
                Ok(self.ast.alloc(
                    NodeKind::DeclRef {
                        name: member,
                        binding: Binding::EnumConst { value, ty: canon },
                    },
                    span,
                ))
            }
            TypeKind::Struct { .. } => {
                let s = self.types.struct_of(canon).expect("struct kind has info");
                if let Some(sm) = s.static_member(member) {
                    if let Some(value) = sm.const_value {
                        let ty = sm.ty;
                        return Ok(self.ast.alloc(
                            NodeKind::DeclRef {
                                name: member,
                                binding: Binding::Constexpr { value, ty },
                            },
                            span,
                        ));
                    }
                    // Non-constant static member: a global with the class
                    // prefix as its path.
                    let class_name = s.name;
                    let ty = sm.ty;
                    return Ok(self.ast.alloc(
                        NodeKind::DeclRef {
                            name: member,
                            binding: Binding::Global { name: member, path: vec![class_name], ty },
                        },
                        span,
                    ));
                }
                // Static member function call: `T::f(args)`.
                if let Some((func, _)) = self.types.find_member_fn(canon, member) {
                    let class_name = self.types.struct_of(canon).expect("struct").name;
                    return Ok(self.ast.alloc(
                        NodeKind::DeclRef {
                            name: member,
                            binding: Binding::Function {
                                name: member,
                                path: vec![class_name],
                                ty: func.ty,
                                is_extern_c: false,
                            },
                        },
                        span,
                    ));
                }
                Err(crate::ParseError {
                    message: format!(
                        "no static member '{}' in '{}'",
                        self.strings.view(member),
                        self.strings.view(self.types.info(canon).name)
                    ),
                    span,
                    fatal: false,
                })
            }
            _ => Err(crate::ParseError {
                message: "'::' applied to a non-class type".to_string(),
                span,
                fatal: false,
            }),
        }
    }

    /// `name<args>` in expression position: class template static access or
    /// explicit function template instantiation.
    fn parse_template_id_expression(
        &mut self,
        unq: StringHandle,
        span: fcpp_util::Span,
    ) -> PResult<NodeId> {
        let kind = self
            .templates
            .get(unq)
            .map(|p| p.kind)
            .ok_or_else(|| self.err_here("unknown template"))?;
        let args = self.parse_template_arg_list()?;
        match kind {
            TemplateKind::Class => {
                let ty = self.instantiate_class_template(unq, &args)?;
                self.parse_type_suffix_expression(ty, span)
            }
            TemplateKind::Function => {
                let entity = self.instantiate_function_template(unq, &args)?;
                match entity {
                    InstantiatedEntity::Function { name, ty, .. } => Ok(self.ast.alloc(
                        NodeKind::DeclRef {
                            name,
                            binding: Binding::Function {
                                name,
                                path: Vec::new(),
                                ty,
                                is_extern_c: false,
                            },
                        },
                        span,
                    )),
                    _ => Err(self.err_here("template does not name a function")),
                }
            }
            TemplateKind::Variable => {
                let entity = self.instantiate_variable_template(unq, &args)?;
                match entity {
                    InstantiatedEntity::Variable { ty, value } => Ok(self.ast.alloc(
                        NodeKind::DeclRef {
                            name: unq,
                            binding: Binding::Constexpr { value, ty },
                        },
                        span,
                    )),
                    _ => Err(self.err_here("template does not name a variable")),
                }
            }
            TemplateKind::Alias => {
                let ty = self.instantiate_alias_template(unq, &args)?;
                self.parse_type_suffix_expression(ty, span)
            }
        }
    }

    /// `f(a, b)` where `f` is a function template and the template
    /// arguments are deduced from the call arguments.
    fn parse_deduced_template_call(
        &mut self,
        unq: StringHandle,
        span: fcpp_util::Span,
    ) -> PResult<NodeId> {
        let args = self.parse_call_args()?;
        let deduced = self.deduce_function_template_args(unq, &args)?;
        let entity = self.instantiate_function_template(unq, &deduced)?;
        match entity {
            InstantiatedEntity::Function { name, ty, .. } => {
                let callee = self.ast.alloc(
                    NodeKind::DeclRef {
                        name,
                        binding: Binding::Function {
                            name,
                            path: Vec::new(),
                            ty,
                            is_extern_c: false,
                        },
                    },
                    span,
                );
                Ok(self.ast.alloc(NodeKind::Call { callee, args }, span))
            }
            _ => Err(self.err_here("template does not name a function")),
        }
    }

    /// Lambda expression. Captureless lambdas synthesize a free function;
    /// captures are parsed and rejected as unsupported.
    fn parse_lambda(&mut self) -> PResult<NodeId> {
        let span = self.cur().span;
        self.expect_punct(Punct::LBracket)?;
        if !self.at_punct(Punct::RBracket) {
            // Skip the capture list and report.
            while !self.at_punct(Punct::RBracket) && !self.cur().is_eof() {
                self.bump();
            }
            self.handler
                .error("lambda captures are not supported; use a captureless lambda", span);
        }
        self.expect_punct(Punct::RBracket)?;
        let index = self.lambda_counter;
        self.lambda_counter += 1;
        let fn_name = self.strings.intern(&format!("__lambda${index}"));
        self.parse_lambda_function(fn_name, span)
    }
}
