//! Type-specifier parsing.
//!
//! Handles builtin specifier combinations (`unsigned long long`), named
//! types including qualified ids (`ns::S`) and template-ids (`H<int>`),
//! `auto`, `decltype(expr)`, and the pointer/reference declarator prefixes.
//! The function-vs-variable lookahead classifier also lives here, since it
//! is essentially "does this token sequence start a type".

use fcpp_lex::{Kw, Punct, TokenKind};
use fcpp_sem::{unqualified_name, ConstValue, Declaration, RefKind, TemplateArg, TypeIndex};
use fcpp_util::StringHandle;

use crate::{DeclContext, PResult, Parser};

/// Outcome of type-specifier parsing. `auto` stays symbolic until the
/// initializer fixes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParsedType {
    Auto,
    Ty(TypeIndex),
}

impl ParsedType {
    pub fn expect_concrete(self, parser: &Parser<'_>) -> PResult<TypeIndex> {
        match self {
            ParsedType::Ty(ty) => Ok(ty),
            ParsedType::Auto => Err(parser.err_here("'auto' is not allowed here")),
        }
    }
}

impl<'ctx> Parser<'ctx> {
    /// Parse a type specifier, or return `None` with the stream unmoved if
    /// the current tokens cannot start a type.
    pub(crate) fn try_parse_type(&mut self) -> PResult<Option<ParsedType>> {
        let mark = self.toks.save();
        match self.parse_type_specifier() {
            Ok(Some(ty)) => Ok(Some(ty)),
            Ok(None) => {
                self.toks.restore(mark);
                Ok(None)
            }
            Err(e) => {
                self.toks.restore(mark);
                Err(e)
            }
        }
    }

    /// Core type-specifier parse: cv-qualifiers, builtin combinations,
    /// `auto`, `decltype`, qualified/template names.
    pub(crate) fn parse_type_specifier(&mut self) -> PResult<Option<ParsedType>> {
        // cv-qualifiers are accepted and recorded nowhere: they do not
        // change layout or codegen for the supported subset.
        while self.eat_kw(Kw::Const) || self.eat_kw(Kw::Volatile) {}

        if self.eat_kw(Kw::Auto) {
            return Ok(Some(ParsedType::Auto));
        }
        if self.at_kw(Kw::Decltype) {
            return self.parse_decltype().map(|t| Some(ParsedType::Ty(t)));
        }
        if let Some(builtin) = self.parse_builtin_combination()? {
            // Trailing cv-qualifiers.
            while self.eat_kw(Kw::Const) || self.eat_kw(Kw::Volatile) {}
            return Ok(Some(ParsedType::Ty(builtin)));
        }
        // `typename` prefix is allowed (and ignored) before dependent names.
        let _ = self.eat_kw(Kw::Typename);
        // Elaborated specifiers: `struct S`, `enum E`, `class C`.
        let _ = self.eat_kw(Kw::Struct) || self.eat_kw(Kw::Class) || self.eat_kw(Kw::Enum);

        match self.parse_named_type()? {
            Some(ty) => {
                while self.eat_kw(Kw::Const) || self.eat_kw(Kw::Volatile) {}
                Ok(Some(ParsedType::Ty(ty)))
            }
            None => Ok(None),
        }
    }

    /// `signed`/`unsigned`/`short`/`long`/`int`/`char`/... combinations.
    fn parse_builtin_combination(&mut self) -> PResult<Option<TypeIndex>> {
        let b = self.types.builtins;
        let mut signedness: Option<bool> = None;
        let mut longs = 0u8;
        let mut short = false;
        let mut base: Option<Kw> = None;
        let mut any = false;

        loop {
            let kw = match self.cur().kind {
                TokenKind::Keyword(kw) => kw,
                _ => break,
            };
            match kw {
                Kw::Signed => signedness = Some(true),
                Kw::Unsigned => signedness = Some(false),
                Kw::Long => longs += 1,
                Kw::Short => short = true,
                Kw::Int | Kw::Char | Kw::Bool | Kw::Void | Kw::Float | Kw::Double | Kw::WcharT
                | Kw::Char8T | Kw::Char16T | Kw::Char32T => {
                    if base.is_some() {
                        break;
                    }
                    base = Some(kw);
                }
                _ => break,
            }
            any = true;
            self.bump();
        }
        if !any {
            return Ok(None);
        }

        let unsigned = signedness == Some(false);
        let ty = match base {
            Some(Kw::Void) => b.void,
            Some(Kw::Bool) => b.bool_,
            Some(Kw::Float) => b.float,
            Some(Kw::Double) => b.double,
            Some(Kw::Char) => match signedness {
                Some(true) => b.schar,
                Some(false) => b.uchar,
                None => b.char_,
            },
            Some(Kw::Char8T) => b.uchar,
            Some(Kw::Char16T) => b.ushort,
            Some(Kw::Char32T) | Some(Kw::WcharT) => {
                if unsigned {
                    b.uint
                } else {
                    b.int
                }
            }
            Some(Kw::Int) | None => {
                if short {
                    if unsigned { b.ushort } else { b.short }
                } else if longs >= 2 {
                    if unsigned { b.ullong } else { b.llong }
                } else if longs == 1 {
                    if unsigned { b.ulong } else { b.long }
                } else if unsigned {
                    b.uint
                } else {
                    b.int
                }
            }
            Some(other) => {
                return Err(self.err_here(format!("unexpected type keyword {other:?}")))
            }
        };
        Ok(Some(ty))
    }

    /// `decltype ( expr )`.
    fn parse_decltype(&mut self) -> PResult<TypeIndex> {
        self.bump(); // decltype
        self.expect_punct(Punct::LParen)?;
        let expr = self.parse_expr()?;
        self.expect_punct(Punct::RParen)?;
        Ok(crate::typecheck::expr_type(
            &self.ast,
            self.types,
            self.strings,
            expr,
        ))
    }

    /// A (possibly qualified, possibly template-id) type name. Returns
    /// `None` with tokens consumed only when the leading identifier is
    /// consumed but resolves to nothing type-like — callers use
    /// [`Parser::try_parse_type`] for backtracking.
    pub(crate) fn parse_named_type(&mut self) -> PResult<Option<TypeIndex>> {
        let _ = self.eat_punct(Punct::ColonColon);
        if !self.at_ident() {
            return Ok(None);
        }
        let first = self.cur().text;

        // Template parameters shadow everything.
        if let Some(Declaration::Type(ty)) = self.scopes.lookup_template_param(first) {
            let ty = *ty;
            self.bump();
            return self.parse_nested_type_suffix(ty).map(Some);
        }

        // Walk a `ns::ns::Name` prefix.
        let mut components = vec![first];
        let mark = self.toks.save();
        self.bump();
        while self.at_punct(Punct::ColonColon)
            && self.toks.peek(1).kind == TokenKind::Identifier
        {
            // Stop if the name so far already resolves to a class type; the
            // `::` then selects a nested entity, handled by the suffix path.
            if self.resolve_type_components(&components).is_some() {
                break;
            }
            self.bump(); // ::
            components.push(self.bump().text);
        }

        // Template-id?
        if self.at_punct(Punct::Lt) && self.template_args_ahead() {
            let base = *components.last().expect("at least one component");
            let unq = self.unqualified_handle(base);
            if self.templates.is_template(unq) {
                let args = self.parse_template_arg_list()?;
                let ty = self.instantiate_class_template(unq, &args)?;
                return self.parse_nested_type_suffix(ty).map(Some);
            }
        }

        match self.resolve_type_components(&components) {
            Some(ty) => self.parse_nested_type_suffix(ty).map(Some),
            None => {
                self.toks.restore(mark);
                Ok(None)
            }
        }
    }

    /// Resolve a component path to a type: unqualified through the scope
    /// stack, qualified through the joined name registered at namespace
    /// declaration time.
    pub(crate) fn resolve_type_components(&mut self, components: &[StringHandle]) -> Option<TypeIndex> {
        if components.len() == 1 {
            let name = components[0];
            if let Some(Declaration::Type(ty)) = self.scopes.lookup_template_param(name) {
                return Some(*ty);
            }
            if let Some(Declaration::Type(ty)) = self.scopes.lookup(name) {
                return Some(*ty);
            }
            if let Some(ty) = self.types.lookup(name) {
                return Some(ty);
            }
            // `using namespace` fallback.
            for ns in self.using_namespaces.clone() {
                let joined = {
                    let text =
                        format!("{}::{}", self.strings.view(ns), self.strings.view(name));
                    self.strings.intern(&text)
                };
                if let Some(Declaration::Type(ty)) = self.scopes.lookup(joined) {
                    return Some(*ty);
                }
                if let Some(ty) = self.types.lookup(joined) {
                    return Some(ty);
                }
            }
            return None;
        }
        let joined = self.join_components(components);
        match self.scopes.lookup(joined) {
            Some(Declaration::Type(ty)) => Some(*ty),
            _ => self.types.lookup(joined),
        }
    }

    /// Intern `a::b::c` from its components.
    pub(crate) fn join_components(&mut self, components: &[StringHandle]) -> StringHandle {
        let joined = components
            .iter()
            .map(|&c| self.strings.view(c))
            .collect::<Vec<_>>()
            .join("::");
        self.strings.intern(&joined)
    }

    /// The unqualified form of a possibly qualified name handle.
    pub(crate) fn unqualified_handle(&mut self, name: StringHandle) -> StringHandle {
        let text = self.strings.view(name);
        if text.contains("::") {
            let unq = unqualified_name(text).to_string();
            self.strings.intern(&unq)
        } else {
            name
        }
    }

    /// `T::member` nested-type access after a resolved class type.
    fn parse_nested_type_suffix(&mut self, base: TypeIndex) -> PResult<TypeIndex> {
        let mut current = base;
        while self.at_punct(Punct::ColonColon)
            && self.toks.peek(1).kind == TokenKind::Identifier
        {
            // Only consume if the member actually names a nested type;
            // otherwise the `::` belongs to an enclosing expression parse.
            let member = self.toks.peek(1).text;
            let resolved = self
                .types
                .struct_of(current)
                .and_then(|s| {
                    s.type_aliases
                        .iter()
                        .find(|(n, _)| *n == member)
                        .map(|&(_, t)| t)
                });
            match resolved {
                Some(nested) => {
                    self.bump();
                    self.bump();
                    current = nested;
                }
                None => break,
            }
        }
        Ok(current)
    }

    /// Declarator prefix: `*`, `&`, `&&` with interleaved cv-qualifiers.
    pub(crate) fn parse_declarator_prefix(&mut self, mut ty: TypeIndex) -> TypeIndex {
        loop {
            if self.eat_punct(Punct::Star) {
                ty = self.types.pointer_to(ty, self.strings);
            } else if self.eat_punct(Punct::Amp) {
                ty = self.types.reference_to(ty, RefKind::LValue, self.strings);
            } else if self.eat_punct(Punct::AmpAmp) {
                ty = self.types.reference_to(ty, RefKind::RValue, self.strings);
            } else if self.eat_kw(Kw::Const) || self.eat_kw(Kw::Volatile) {
            } else {
                return ty;
            }
        }
    }

    // ------------------------------------------------------------------
    // Template argument lists
    // ------------------------------------------------------------------

    /// Lookahead check: does the `<` at the current position open a template
    /// argument list that closes cleanly, followed by a token that can
    /// follow a template-id? Otherwise `<` is the less-than operator.
    pub(crate) fn template_args_ahead(&mut self) -> bool {
        debug_assert!(self.at_punct(Punct::Lt));
        let mark = self.toks.save();
        self.bump();
        let mut depth = 1u32;
        let mut parens = 0u32;
        let ok = loop {
            let t = *self.cur();
            if t.is_eof() {
                break false;
            }
            match t.kind {
                TokenKind::Punct(Punct::Lt) => depth += 1,
                TokenKind::Punct(Punct::Gt) if parens == 0 => {
                    depth -= 1;
                    if depth == 0 {
                        self.bump();
                        break matches!(
                            self.cur().kind,
                            TokenKind::Punct(
                                Punct::LParen
                                    | Punct::ColonColon
                                    | Punct::LBrace
                                    | Punct::Semi
                                    | Punct::Comma
                                    | Punct::Gt
                                    | Punct::Shr
                                    | Punct::RParen
                                    | Punct::RBracket
                                    | Punct::Question
                                    | Punct::Colon
                            ) | TokenKind::Identifier
                                | TokenKind::Punct(Punct::Amp)
                                | TokenKind::Punct(Punct::AmpAmp)
                                | TokenKind::Punct(Punct::Star)
                                | TokenKind::Eof
                        );
                    }
                }
                TokenKind::Punct(Punct::Shr) if parens == 0 => {
                    if depth <= 2 {
                        // Closes this list and an enclosing one.
                        depth = depth.saturating_sub(2);
                        if depth == 0 {
                            break true;
                        }
                    } else {
                        depth -= 2;
                    }
                }
                TokenKind::Punct(Punct::LParen) => parens += 1,
                TokenKind::Punct(Punct::RParen) => {
                    if parens == 0 {
                        break false;
                    }
                    parens -= 1;
                }
                TokenKind::Punct(Punct::Semi) | TokenKind::Punct(Punct::LBrace) => break false,
                _ => {}
            }
            self.bump();
        };
        self.toks.restore(mark);
        ok
    }

    /// Parse `<arg, arg, ...>` into resolved template arguments. The `>>`
    /// token is split when it closes a nested list.
    pub(crate) fn parse_template_arg_list(&mut self) -> PResult<Vec<TemplateArg>> {
        self.expect_punct(Punct::Lt)?;
        self.template_arg_depth += 1;
        let result = self.parse_template_arg_list_inner();
        self.template_arg_depth -= 1;
        result
    }

    fn parse_template_arg_list_inner(&mut self) -> PResult<Vec<TemplateArg>> {
        let mut args = Vec::new();
        if self.close_template_list()? {
            return Ok(args);
        }
        loop {
            args.push(self.parse_template_arg()?);
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            if self.close_template_list()? {
                return Ok(args);
            }
            return Err(self.err_here("expected ',' or '>' in template argument list"));
        }
    }

    /// Consume the closing `>` of a template argument list, splitting `>>`.
    fn close_template_list(&mut self) -> PResult<bool> {
        if self.at_punct(Punct::Shr) {
            self.toks.split_right_shift(self.strings);
        }
        Ok(self.eat_punct(Punct::Gt))
    }

    /// One template argument: a type if the tokens form one, otherwise a
    /// constant expression.
    fn parse_template_arg(&mut self) -> PResult<TemplateArg> {
        if let Some(parsed) = self.try_parse_type()? {
            let base = parsed.expect_concrete(self)?;
            let ty = self.parse_declarator_prefix(base);
            // A type not followed by an expression continuation is a type
            // argument.
            if matches!(
                self.cur().kind,
                TokenKind::Punct(Punct::Comma | Punct::Gt | Punct::Shr)
            ) {
                return Ok(TemplateArg::Type(ty));
            }
            // Otherwise re-parse as an expression (e.g. `sizeof(int)` begins
            // with a type-looking token sequence only when mis-detected).
            return Err(self.err_here("malformed template argument"));
        }
        let expr = self.parse_ternary()?;
        let value = self.eval_const(expr)?;
        Ok(TemplateArg::Value(value))
    }

    /// Evaluate a node as a constant expression, mapping failures to parse
    /// errors at its span.
    pub(crate) fn eval_const(&mut self, expr: fcpp_util::NodeId) -> PResult<ConstValue> {
        let span = self.ast.span(expr);
        crate::consteval::ConstExprEvaluator::new(&self.ast, self.types)
            .with_functions(&self.functions)
            .eval(expr)
            .map_err(|e| crate::ParseError {
                message: format!("{e}"),
                span,
                fatal: false,
            })
    }

    /// True if the parenthesized region starting at the current `(` reads
    /// as a function parameter list rather than an initializer expression:
    /// empty, `void`, or beginning with a known type/storage keyword.
    pub(crate) fn paren_is_param_list(&mut self) -> bool {
        debug_assert!(self.at_punct(Punct::LParen));
        let mark = self.toks.save();
        self.bump();
        let verdict = if self.at_punct(Punct::RParen) {
            true
        } else if self.at_kw(Kw::Void) && self.toks.peek(1).is_punct(Punct::RParen) {
            true
        } else {
            matches!(
                self.cur().kind,
                TokenKind::Keyword(
                    Kw::Const
                        | Kw::Volatile
                        | Kw::Signed
                        | Kw::Unsigned
                        | Kw::Short
                        | Kw::Long
                        | Kw::Int
                        | Kw::Char
                        | Kw::Bool
                        | Kw::Float
                        | Kw::Double
                        | Kw::Void
                        | Kw::Auto
                        | Kw::Struct
                        | Kw::Class
                        | Kw::Enum
                        | Kw::Typename
                        | Kw::Decltype
                        | Kw::WcharT
                        | Kw::Char8T
                        | Kw::Char16T
                        | Kw::Char32T
                )
            ) || (self.at_ident() && {
                let name = self.cur().text;
                let is_type = self.resolve_type_components(&[name]).is_some()
                    || matches!(
                        self.scopes.lookup_template_param(name),
                        Some(Declaration::Type(_))
                    )
                    || {
                        let unq = self.unqualified_handle(name);
                        self.templates.is_template(unq)
                    };
                is_type
            })
        };
        self.toks.restore(mark);
        verdict
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::parse_clean;

    #[test]
    fn test_builtin_combinations() {
        let p = parse_clean(
            "unsigned long long a; signed char b; long c; unsigned d; short int e;",
        );
        assert_eq!(p.output.globals.len(), 5);
        let names: Vec<&str> = p
            .output
            .globals
            .iter()
            .map(|g| p.strings.view(g.name))
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(p.output.globals[0].ty, p.types.builtins.ullong);
        assert_eq!(p.output.globals[1].ty, p.types.builtins.schar);
        assert_eq!(p.output.globals[2].ty, p.types.builtins.long);
        assert_eq!(p.output.globals[3].ty, p.types.builtins.uint);
        assert_eq!(p.output.globals[4].ty, p.types.builtins.short);
    }

    #[test]
    fn test_pointer_and_reference_declarators() {
        let p = parse_clean("int* p; int** pp;");
        let int = p.types.builtins.int;
        let g0 = p.output.globals[0].ty;
        assert!(matches!(
            p.types.info(g0).kind,
            fcpp_sem::TypeKind::Pointer { pointee } if pointee == int
        ));
        let g1 = p.output.globals[1].ty;
        assert!(matches!(
            p.types.info(g1).kind,
            fcpp_sem::TypeKind::Pointer { pointee } if pointee == g0
        ));
    }

    #[test]
    fn test_const_is_accepted() {
        let p = parse_clean("const int x = 1;");
        assert_eq!(p.output.globals.len(), 1);
    }
}
