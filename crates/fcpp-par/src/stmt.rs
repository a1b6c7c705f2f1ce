//! Statement parsing.
//!
//! Control flow (`if`/`while`/`for`/`do`/`switch`), jumps, compound
//! statements, declaration statements, `try`/`catch` and the range-for
//! rewrite hook. Scopes are entered on `{` and left on the matching `}`.

use fcpp_lex::{Kw, Punct, TokenKind};
use fcpp_sem::ScopeKind;
use fcpp_util::NodeId;

use crate::ast::{CatchHandler, NodeKind, SwitchArm};
use crate::{DeclContext, PResult, Parser};

impl<'ctx> Parser<'ctx> {
    pub(crate) fn parse_statement(&mut self) -> PResult<NodeId> {
        let token = *self.cur();
        match token.kind {
            TokenKind::Punct(Punct::LBrace) => self.parse_compound(),
            TokenKind::Punct(Punct::Semi) => {
                self.bump();
                Ok(self.ast.alloc(NodeKind::Empty, token.span))
            }
            TokenKind::Keyword(Kw::If) => {
                self.bump();
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expr_with_comma()?;
                self.expect_punct(Punct::RParen)?;
                let then_branch = self.parse_statement()?;
                let else_branch = if self.eat_kw(Kw::Else) {
                    Some(self.parse_statement()?)
                } else {
                    None
                };
                Ok(self.ast.alloc(
                    NodeKind::If { cond, then_branch, else_branch },
                    token.span,
                ))
            }
            TokenKind::Keyword(Kw::While) => {
                self.bump();
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expr_with_comma()?;
                self.expect_punct(Punct::RParen)?;
                let body = self.parse_statement()?;
                Ok(self.ast.alloc(NodeKind::While { cond, body }, token.span))
            }
            TokenKind::Keyword(Kw::Do) => {
                self.bump();
                let body = self.parse_statement()?;
                if !self.eat_kw(Kw::While) {
                    return Err(self.err_here("expected 'while' after do-statement body"));
                }
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expr_with_comma()?;
                self.expect_punct(Punct::RParen)?;
                self.expect_punct(Punct::Semi)?;
                Ok(self.ast.alloc(NodeKind::DoWhile { body, cond }, token.span))
            }
            TokenKind::Keyword(Kw::For) => self.parse_for(),
            TokenKind::Keyword(Kw::Switch) => self.parse_switch(),
            TokenKind::Keyword(Kw::Return) => {
                self.bump();
                let value = if self.at_punct(Punct::Semi) {
                    None
                } else {
                    Some(self.parse_expr_with_comma()?)
                };
                self.expect_punct(Punct::Semi)?;
                Ok(self.ast.alloc(NodeKind::Return(value), token.span))
            }
            TokenKind::Keyword(Kw::Break) => {
                self.bump();
                self.expect_punct(Punct::Semi)?;
                Ok(self.ast.alloc(NodeKind::Break, token.span))
            }
            TokenKind::Keyword(Kw::Continue) => {
                self.bump();
                self.expect_punct(Punct::Semi)?;
                Ok(self.ast.alloc(NodeKind::Continue, token.span))
            }
            TokenKind::Keyword(Kw::Try) => self.parse_try(),
            TokenKind::Keyword(Kw::Throw) => {
                let expr = self.parse_expr_with_comma()?;
                self.expect_punct(Punct::Semi)?;
                Ok(self.ast.alloc(NodeKind::ExprStmt(expr), token.span))
            }
            _ => {
                // Declaration statement or expression statement.
                let before = self.toks.pos();
                if let Some(stmt) = self.parse_declaration(DeclContext::BlockScope)? {
                    return Ok(stmt);
                }
                if self.toks.pos() != before {
                    // A declaration form without a statement node (local
                    // class, using-alias, static_assert, prototype).
                    return Ok(self.ast.alloc(NodeKind::Empty, token.span));
                }
                let expr = self.parse_expr_with_comma()?;
                self.expect_punct(Punct::Semi)?;
                Ok(self.ast.alloc(NodeKind::ExprStmt(expr), token.span))
            }
        }
    }

    /// `{ stmt* }` with its own scope.
    pub(crate) fn parse_compound(&mut self) -> PResult<NodeId> {
        let span = self.cur().span;
        self.expect_punct(Punct::LBrace)?;
        self.in_scope(ScopeKind::Block, |p| {
            let mut stmts = Vec::new();
            while !p.at_punct(Punct::RBrace) {
                if p.cur().is_eof() {
                    return Err(p.fatal_here("unexpected end of file inside block"));
                }
                stmts.push(p.parse_statement()?);
            }
            p.bump();
            Ok(p.ast.alloc(NodeKind::Compound { stmts }, span))
        })
    }

    /// Classic and range `for`.
    fn parse_for(&mut self) -> PResult<NodeId> {
        let span = self.bump().span; // for
        self.expect_punct(Punct::LParen)?;
        self.scopes.push(ScopeKind::Block);
        let result = self.parse_for_inner(span);
        self.scopes.pop();
        result
    }

    fn parse_for_inner(&mut self, span: fcpp_util::Span) -> PResult<NodeId> {
        // Range-for: `type declarator : range`.
        let mark = self.toks.save();
        if let Some(parsed) = self.try_parse_type()? {
            let base = match parsed {
                crate::types::ParsedType::Auto => None,
                crate::types::ParsedType::Ty(t) => Some(t),
            };
            let var_ty_parsed = base.map(|b| self.parse_declarator_prefix(b));
            if self.at_ident() && self.toks.peek(1).is_punct(Punct::Colon) {
                let name = self.bump().text;
                self.bump(); // :
                let range = self.parse_expr_with_comma()?;
                let var_ty = match var_ty_parsed {
                    Some(t) => t,
                    None => {
                        // `auto` element: infer from the range.
                        let range_ty = crate::typecheck::expr_type(
                            &self.ast,
                            self.types,
                            self.strings,
                            range,
                        );
                        crate::typecheck::range_element_type(self.types, range_ty)
                    }
                };
                let local = self.fn_ctx().alloc_local(name, var_ty);
                self.scopes
                    .declare(name, fcpp_sem::Declaration::Local { local, ty: var_ty });
                self.expect_punct(Punct::RParen)?;
                let body = self.parse_statement()?;
                return Ok(self.ast.alloc(
                    NodeKind::RangeFor { var: local, var_ty, range, body },
                    span,
                ));
            }
        }
        self.toks.restore(mark);

        // Classic for.
        let before = self.toks.pos();
        let init = if self.eat_punct(Punct::Semi) {
            None
        } else if let Some(stmt) = self.parse_declaration(DeclContext::ForInit)? {
            Some(stmt)
        } else if self.toks.pos() != before {
            Some(self.ast.alloc(NodeKind::Empty, span))
        } else {
            let expr = self.parse_expr_with_comma()?;
            self.expect_punct(Punct::Semi)?;
            Some(self.ast.alloc(NodeKind::ExprStmt(expr), span))
        };
        let cond = if self.at_punct(Punct::Semi) {
            None
        } else {
            Some(self.parse_expr_with_comma()?)
        };
        self.expect_punct(Punct::Semi)?;
        let step = if self.at_punct(Punct::RParen) {
            None
        } else {
            Some(self.parse_expr_with_comma()?)
        };
        self.expect_punct(Punct::RParen)?;
        let body = self.parse_statement()?;
        Ok(self
            .ast
            .alloc(NodeKind::For { init, cond, step, body }, span))
    }

    /// `switch (expr) { case N: ... default: ... }`.
    fn parse_switch(&mut self) -> PResult<NodeId> {
        let span = self.bump().span; // switch
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expr_with_comma()?;
        self.expect_punct(Punct::RParen)?;
        self.expect_punct(Punct::LBrace)?;
        self.scopes.push(ScopeKind::Block);
        let result = (|| {
            let mut arms: Vec<SwitchArm> = Vec::new();
            while !self.at_punct(Punct::RBrace) {
                if self.cur().is_eof() {
                    return Err(self.fatal_here("unexpected end of file inside switch"));
                }
                if self.eat_kw(Kw::Case) {
                    let expr = self.parse_ternary()?;
                    let value = self.eval_const(expr)?.as_int().map_err(|e| {
                        crate::ParseError {
                            message: e.to_string(),
                            span: self.ast.span(expr),
                            fatal: false,
                        }
                    })?;
                    self.expect_punct(Punct::Colon)?;
                    arms.push(SwitchArm { value: Some(value), stmts: Vec::new() });
                } else if self.eat_kw(Kw::Default) {
                    self.expect_punct(Punct::Colon)?;
                    arms.push(SwitchArm { value: None, stmts: Vec::new() });
                } else {
                    let stmt = self.parse_statement()?;
                    match arms.last_mut() {
                        Some(arm) => arm.stmts.push(stmt),
                        None => {
                            return Err(self.err_here("statement before first case label"))
                        }
                    }
                }
            }
            self.bump(); // }
            Ok(self.ast.alloc(NodeKind::Switch { cond, arms }, span))
        })();
        self.scopes.pop();
        result
    }

    /// `try compound handler+`.
    fn parse_try(&mut self) -> PResult<NodeId> {
        let span = self.bump().span; // try
        let body = self.parse_compound()?;
        let mut handlers = Vec::new();
        while self.at_kw(Kw::Catch) {
            self.bump();
            self.expect_punct(Punct::LParen)?;
            self.scopes.push(ScopeKind::Block);
            let handler = (|| {
                let (ty, var) = if self.at_punct(Punct::Ellipsis) {
                    self.bump();
                    (None, None)
                } else {
                    let parsed = self
                        .parse_type_specifier()?
                        .ok_or_else(|| self.err_here("expected type in catch clause"))?;
                    let base = parsed.expect_concrete(self)?;
                    let ty = self.parse_declarator_prefix(base);
                    let var = if self.at_ident() {
                        let name = self.bump().text;
                        let caught = self.types.strip_reference(ty);
                        let local = self.fn_ctx().alloc_local(name, caught);
                        self.scopes
                            .declare(name, fcpp_sem::Declaration::Local { local, ty: caught });
                        Some((name, local))
                    } else {
                        None
                    };
                    (Some(self.types.strip_reference(ty)), var)
                };
                self.expect_punct(Punct::RParen)?;
                let body = self.parse_compound()?;
                Ok(CatchHandler { ty, var, body })
            })();
            self.scopes.pop();
            handlers.push(handler?);
        }
        if handlers.is_empty() {
            return Err(self.err_here("'try' requires at least one catch handler"));
        }
        Ok(self.ast.alloc(NodeKind::Try { body, handlers }, span))
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::NodeKind;
    use crate::test_support::parse_clean;

    fn body_stmts(src: &str) -> (crate::test_support::Parsed, Vec<fcpp_util::NodeId>) {
        let p = parse_clean(src);
        let f = p
            .output
            .functions
            .iter()
            .find(|f| p.strings.view(f.name) == "main")
            .expect("main parsed");
        let body = f.body.expect("main has a body");
        let stmts = match p.output.ast.kind(body) {
            NodeKind::Compound { stmts } => stmts.clone(),
            other => panic!("expected compound body, got {other:?}"),
        };
        (p, stmts)
    }

    #[test]
    fn test_return_literal() {
        let (p, stmts) = body_stmts("int main() { return 42; }");
        assert_eq!(stmts.len(), 1);
        match p.output.ast.kind(stmts[0]) {
            NodeKind::Return(Some(e)) => {
                assert!(matches!(
                    p.output.ast.kind(*e),
                    NodeKind::IntLit { value: 42, .. }
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_if_else() {
        let (p, stmts) = body_stmts("int main() { if (1) return 1; else return 2; }");
        assert!(matches!(
            p.output.ast.kind(stmts[0]),
            NodeKind::If { else_branch: Some(_), .. }
        ));
    }

    #[test]
    fn test_while_and_for() {
        let (p, stmts) =
            body_stmts("int main() { int t = 0; for (int i = 0; i < 3; ++i) t += i; while (t) --t; return t; }");
        assert!(matches!(p.output.ast.kind(stmts[1]), NodeKind::For { .. }));
        assert!(matches!(p.output.ast.kind(stmts[2]), NodeKind::While { .. }));
    }

    #[test]
    fn test_switch_arms() {
        let (p, stmts) = body_stmts(
            "int main() { int x = 2; switch (x) { case 1: return 1; case 2: return 2; default: return 0; } }",
        );
        match p.output.ast.kind(stmts[1]) {
            NodeKind::Switch { arms, .. } => {
                assert_eq!(arms.len(), 3);
                assert_eq!(arms[0].value, Some(1));
                assert_eq!(arms[1].value, Some(2));
                assert_eq!(arms[2].value, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_try_catch_handlers() {
        let (p, stmts) = body_stmts(
            "int main() { try { throw 42; } catch (int e) { return e; } catch (...) { return 1; } }",
        );
        match p.output.ast.kind(stmts[0]) {
            NodeKind::Try { handlers, .. } => {
                assert_eq!(handlers.len(), 2);
                assert!(handlers[0].ty.is_some());
                assert!(handlers[0].var.is_some());
                assert!(handlers[1].ty.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_do_while() {
        let (p, stmts) = body_stmts("int main() { int n = 3; do { --n; } while (n); return n; }");
        assert!(matches!(p.output.ast.kind(stmts[1]), NodeKind::DoWhile { .. }));
    }
}
