//! Declaration parsing.
//!
//! One unified entry, [`Parser::parse_declaration`], handles every context a
//! declaration can appear in: namespace scope, block scope, class members
//! and for-init. The sequence is always specifiers → type → declarator →
//! form branch (function parameters / initializer / `;` / `,`) → body
//! dispatch.
//!
//! The classic `int x(T)` ambiguity is settled by
//! [`Parser::paren_is_param_list`]: the parenthesized region is a parameter
//! list iff it reads as a type-then-optional-name sequence; otherwise it is
//! a direct-initialization.
//!
//! Member function bodies are *deferred*: the signature is parsed in place,
//! the body tokens are captured, and the bodies replay after the closing
//! brace of the class so that members declared later in the class are
//! visible (including the constructor-initializer list of constructors).

use fcpp_lex::{Kw, Punct, TokenKind};
use fcpp_sem::{
    Access, BaseClass, ConstValue, Declaration, EnumInfo, FunctionDecl, Member, MemberFunction,
    OverloadSet, ScopeKind, StaticMember, StructInfo, TokenRange, TypeIndex, TypeInfo, TypeKind,
    Virtuality,
};
use fcpp_util::{IndexVec, NodeId, Span, StringHandle};

use crate::ast::{
    FunctionDef, GlobalDef, Initializer, Linkage, LocalDecl, NodeKind, ParamDef,
};
use crate::types::ParsedType;
use crate::{DeclContext, FnCtx, PResult, Parser};

/// Parsed declaration specifiers.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DeclSpecifiers {
    pub is_static: bool,
    pub is_extern: bool,
    pub is_inline: bool,
    pub is_constexpr: bool,
    pub is_consteval: bool,
    pub is_constinit: bool,
    pub is_virtual: bool,
    pub is_explicit: bool,
    pub is_friend: bool,
    pub is_mutable: bool,
    pub is_thread_local: bool,
    pub is_typedef: bool,
}

impl DeclSpecifiers {
    fn any(&self) -> bool {
        self.is_static
            || self.is_extern
            || self.is_inline
            || self.is_constexpr
            || self.is_consteval
            || self.is_constinit
            || self.is_virtual
            || self.is_explicit
            || self.is_friend
            || self.is_mutable
            || self.is_thread_local
            || self.is_typedef
    }
}

/// Per-class parsing state threaded through member declarations.
pub(crate) struct ClassCtx {
    pub id: fcpp_sem::StructId,
    pub ty: TypeIndex,
    pub name: StringHandle,
    pub access: Access,
    /// Member function bodies to replay after the class completes:
    /// (member-fn index, params, return type, body token range, is_ctor).
    pub deferred: Vec<DeferredBody>,
}

pub(crate) struct DeferredBody {
    pub fn_index: usize,
    pub params: Vec<ParamDef>,
    pub return_ty: TypeIndex,
    pub body: TokenRange,
    pub is_ctor: bool,
    pub is_dtor: bool,
    pub span: Span,
}

impl<'ctx> Parser<'ctx> {
    /// Unified declaration entry. Returns a statement node for block-scope
    /// variable declarations, `None` otherwise.
    pub(crate) fn parse_declaration(&mut self, ctx: DeclContext) -> PResult<Option<NodeId>> {
        match self.cur().kind {
            TokenKind::Keyword(Kw::Namespace) if ctx == DeclContext::TopLevel => {
                self.parse_namespace()?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::Template) => {
                self.parse_template_declaration()?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::StaticAssert) => {
                self.parse_static_assert()?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::Using) => {
                self.parse_using(ctx)?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::Typedef) => {
                self.parse_typedef()?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::Enum) if self.is_enum_definition() => {
                self.parse_enum()?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::Extern)
                if self.toks.peek(1).kind == TokenKind::StringLit =>
            {
                self.parse_extern_c(ctx)?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::Struct | Kw::Class) if self.is_class_definition() => {
                let is_class = self.at_kw(Kw::Class);
                self.bump();
                self.parse_class(is_class)?;
                self.expect_punct(Punct::Semi)?;
                return Ok(None);
            }
            TokenKind::Keyword(Kw::Union) => {
                return Err(self.err_here("unions are not supported"));
            }
            TokenKind::Punct(Punct::Semi) if ctx == DeclContext::TopLevel => {
                self.bump();
                return Ok(None);
            }
            _ => {}
        }

        let mark = self.toks.save();
        let specifiers = self.parse_decl_specifiers();

        let Some(parsed) = self.try_parse_type()? else {
            if specifiers.any() {
                return Err(self.err_here("expected type in declaration"));
            }
            return Ok(None);
        };

        // A type name in statement position that is not followed by a
        // declarator is an expression (`Point(3);` constructs a temporary).
        if matches!(ctx, DeclContext::BlockScope | DeclContext::ForInit)
            && !specifiers.any()
            && !self.at_ident()
            && !self.at_punct(Punct::Star)
            && !self.at_punct(Punct::Amp)
            && !self.at_punct(Punct::AmpAmp)
            && !(parsed == ParsedType::Auto && self.at_punct(Punct::LBracket))
        {
            self.toks.restore(mark);
            return Ok(None);
        }

        self.parse_declarators(ctx, specifiers, parsed)
    }

    fn parse_decl_specifiers(&mut self) -> DeclSpecifiers {
        let mut spec = DeclSpecifiers::default();
        loop {
            match self.cur().kind {
                TokenKind::Keyword(Kw::Static) => spec.is_static = true,
                TokenKind::Keyword(Kw::Extern) => spec.is_extern = true,
                TokenKind::Keyword(Kw::Inline) => spec.is_inline = true,
                TokenKind::Keyword(Kw::Constexpr) => spec.is_constexpr = true,
                TokenKind::Keyword(Kw::Consteval) => spec.is_consteval = true,
                TokenKind::Keyword(Kw::Constinit) => spec.is_constinit = true,
                TokenKind::Keyword(Kw::Virtual) => spec.is_virtual = true,
                TokenKind::Keyword(Kw::Explicit) => spec.is_explicit = true,
                TokenKind::Keyword(Kw::Friend) => spec.is_friend = true,
                TokenKind::Keyword(Kw::Mutable) => spec.is_mutable = true,
                TokenKind::Keyword(Kw::ThreadLocal) => spec.is_thread_local = true,
                _ => return spec,
            }
            self.bump();
        }
    }

    /// `enum` followed by a definition (not an elaborated type use).
    fn is_enum_definition(&self) -> bool {
        let mut k = 1;
        if matches!(self.toks.peek(k).kind, TokenKind::Keyword(Kw::Class | Kw::Struct)) {
            k += 1;
        }
        if self.toks.peek(k).kind == TokenKind::Identifier {
            k += 1;
        }
        matches!(
            self.toks.peek(k).kind,
            TokenKind::Punct(Punct::LBrace | Punct::Colon | Punct::Semi)
        )
    }

    /// `struct`/`class` followed by a definition or forward declaration.
    /// `<` appears when replaying a specialization body, whose argument
    /// pattern is skipped by `parse_class`.
    fn is_class_definition(&self) -> bool {
        let mut k = 1;
        if self.toks.peek(k).kind == TokenKind::Identifier {
            k += 1;
        }
        matches!(
            self.toks.peek(k).kind,
            TokenKind::Punct(Punct::LBrace | Punct::Colon | Punct::Semi | Punct::Lt)
        )
    }

    // ------------------------------------------------------------------
    // Namespaces, using, static_assert, extern "C"
    // ------------------------------------------------------------------

    fn parse_namespace(&mut self) -> PResult<()> {
        self.bump(); // namespace
        if self.at_punct(Punct::LBrace) {
            // Anonymous namespace: members get internal linkage but are
            // otherwise parsed in the enclosing scope.
            self.bump();
            while !self.at_punct(Punct::RBrace) {
                if self.cur().is_eof() {
                    return Err(self.fatal_here("unexpected end of file in namespace"));
                }
                self.parse_declaration(DeclContext::TopLevel)?;
            }
            self.bump();
            return Ok(());
        }
        let mut names = vec![self.expect_ident()?];
        while self.eat_punct(Punct::ColonColon) {
            names.push(self.expect_ident()?);
        }
        self.expect_punct(Punct::LBrace)?;
        for &name in &names {
            self.scopes.declare(name, Declaration::Namespace(name));
            self.scopes.push(ScopeKind::Namespace(name));
        }
        let mut result = Ok(());
        while !self.at_punct(Punct::RBrace) {
            if self.cur().is_eof() {
                result = Err(self.fatal_here("unexpected end of file in namespace"));
                break;
            }
            match self.parse_declaration(DeclContext::TopLevel) {
                Ok(_) => {}
                Err(e) if e.fatal => {
                    result = Err(e);
                    break;
                }
                Err(e) => {
                    self.handler.error(e.message.clone(), e.span);
                    self.synchronize();
                }
            }
        }
        if result.is_ok() {
            self.bump(); // }
        }
        for _ in &names {
            self.scopes.pop();
        }
        result
    }

    fn parse_static_assert(&mut self) -> PResult<()> {
        let span = self.bump().span; // static_assert
        self.expect_punct(Punct::LParen)?;
        let expr = self.parse_ternary()?;
        let message = if self.eat_punct(Punct::Comma) {
            let token = *self.cur();
            if token.kind != TokenKind::StringLit {
                return Err(self.err_here("expected string literal in static_assert"));
            }
            self.bump();
            Some(token.text)
        } else {
            None
        };
        self.expect_punct(Punct::RParen)?;
        self.expect_punct(Punct::Semi)?;
        let value = self.eval_const(expr)?;
        if !value.as_bool() {
            let text = message
                .map(|m| self.strings.view(m).to_string())
                .unwrap_or_else(|| "static assertion failed".to_string());
            self.handler.error(format!("static assertion failed: {text}"), span);
        }
        Ok(())
    }

    fn parse_using(&mut self, ctx: DeclContext) -> PResult<()> {
        self.bump(); // using
        if self.eat_kw(Kw::Namespace) {
            let mut components = vec![self.expect_ident()?];
            while self.eat_punct(Punct::ColonColon) {
                components.push(self.expect_ident()?);
            }
            self.expect_punct(Punct::Semi)?;
            let joined = self.join_components(&components);
            self.using_namespaces.push(joined);
            return Ok(());
        }
        let spelled = self.expect_ident()?;
        let name = self.apply_rename(spelled);
        if self.eat_punct(Punct::Assign) {
            // Alias declaration.
            let parsed = self
                .parse_type_specifier()?
                .ok_or_else(|| self.err_here("expected type in alias declaration"))?;
            let base = parsed.expect_concrete(self)?;
            let target = self.parse_declarator_prefix(base);
            self.expect_punct(Punct::Semi)?;
            self.register_alias(name, target, ctx);
            return Ok(());
        }
        // using-declaration: `using ns::name;`
        let mut components = vec![name];
        while self.eat_punct(Punct::ColonColon) {
            components.push(self.expect_ident()?);
        }
        self.expect_punct(Punct::Semi)?;
        let last = *components.last().expect("non-empty using path");
        let joined = self.join_components(&components);
        self.scopes.add_using_alias(last, joined);
        Ok(())
    }

    fn parse_typedef(&mut self) -> PResult<()> {
        self.bump(); // typedef
        let parsed = self
            .parse_type_specifier()?
            .ok_or_else(|| self.err_here("expected type after 'typedef'"))?;
        let base = parsed.expect_concrete(self)?;
        let target = self.parse_declarator_prefix(base);
        let name = self.expect_ident()?;
        self.expect_punct(Punct::Semi)?;
        self.register_alias(name, target, DeclContext::TopLevel);
        Ok(())
    }

    pub(crate) fn register_alias(&mut self, name: StringHandle, target: TypeIndex, ctx: DeclContext) {
        let info = TypeInfo {
            name,
            kind: TypeKind::Alias { target },
            size_bits: self.types.size_bits(target),
            align_bits: self.types.align_bits(target),
            is_incomplete_instantiation: false,
        };
        let alias_ty = self.types.register(info);
        if ctx == DeclContext::ClassMember {
            if let Some(class_ty) = self.scopes.enclosing_class() {
                if let TypeKind::Struct { id } = self.types.info(class_ty).kind {
                    self.types.structs[id].type_aliases.push((name, target));
                }
            }
        }
        self.scopes.declare(name, Declaration::Type(alias_ty));
        let path = self.scopes.current_path();
        if !path.is_empty() {
            let mut components = path;
            components.push(name);
            let joined = self.join_components(&components);
            self.scopes.declare_at_root(joined, Declaration::Type(alias_ty));
        }
    }

    fn parse_extern_c(&mut self, ctx: DeclContext) -> PResult<()> {
        self.bump(); // extern
        let lang = self.bump(); // string literal
        if self.strings.view(lang.text) != "C" {
            self.handler
                .warning("unknown linkage language, assuming \"C\"", lang.span);
        }
        self.extern_c_depth += 1;
        let result = if self.at_punct(Punct::LBrace) {
            self.bump();
            loop {
                if self.at_punct(Punct::RBrace) {
                    self.bump();
                    break Ok(());
                }
                if self.cur().is_eof() {
                    break Err(self.fatal_here("unexpected end of file in extern \"C\" block"));
                }
                self.parse_declaration(ctx)?;
            }
        } else {
            self.parse_declaration(ctx).map(|_| ())
        };
        self.extern_c_depth -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Enums
    // ------------------------------------------------------------------

    fn parse_enum(&mut self) -> PResult<()> {
        self.bump(); // enum
        let is_scoped = self.eat_kw(Kw::Class) || self.eat_kw(Kw::Struct);
        let name = self.expect_ident()?;
        let underlying = if self.eat_punct(Punct::Colon) {
            let parsed = self
                .parse_type_specifier()?
                .ok_or_else(|| self.err_here("expected underlying type"))?;
            parsed.expect_concrete(self)?
        } else {
            self.types.builtins.int
        };
        if self.eat_punct(Punct::Semi) {
            // Opaque declaration.
            let _ = self.register_enum(name, underlying, is_scoped, Vec::new());
            return Ok(());
        }
        self.expect_punct(Punct::LBrace)?;
        let mut enumerators = Vec::new();
        let mut next_value: i64 = 0;
        while !self.at_punct(Punct::RBrace) {
            let ename = self.expect_ident()?;
            if self.eat_punct(Punct::Assign) {
                let expr = self.parse_ternary()?;
                next_value = self.eval_const(expr)?.as_int().map_err(|e| {
                    crate::ParseError {
                        message: e.to_string(),
                        span: self.ast.span(expr),
                        fatal: false,
                    }
                })?;
            }
            enumerators.push((ename, next_value));
            next_value += 1;
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RBrace)?;
        self.expect_punct(Punct::Semi)?;
        let ty = self.register_enum(name, underlying, is_scoped, enumerators.clone())?;
        if !is_scoped {
            for (ename, value) in enumerators {
                self.scopes
                    .declare(ename, Declaration::EnumConst { ty, value });
            }
        }
        Ok(())
    }

    fn register_enum(
        &mut self,
        name: StringHandle,
        underlying: TypeIndex,
        is_scoped: bool,
        enumerators: Vec<(StringHandle, i64)>,
    ) -> PResult<TypeIndex> {
        let id = self.types.enums.push(EnumInfo {
            name,
            underlying,
            is_scoped,
            enumerators,
        });
        let info = TypeInfo {
            name,
            kind: TypeKind::Enum { id },
            size_bits: self.types.size_bits(underlying),
            align_bits: self.types.align_bits(underlying),
            is_incomplete_instantiation: false,
        };
        let ty = self.types.register_named(name, info);
        self.scopes.declare(name, Declaration::Type(ty));
        Ok(ty)
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    /// Parse `struct|class Name [: bases] { members }`, register the type,
    /// compute layout, replay deferred member-function bodies. The `struct`
    /// or `class` keyword is already consumed.
    pub(crate) fn parse_class(&mut self, is_class: bool) -> PResult<TypeIndex> {
        let name_token = *self.cur();
        let spelled = self.expect_ident()?;
        // Template instantiation renames the pattern to its hash-suffixed
        // identity.
        let name = self.apply_rename(spelled);
        // When replaying a specialization body, the argument pattern after
        // the name (`struct X<T, T>`) is already encoded in the selection;
        // skip it.
        if self.instantiation_rename.is_some() && self.at_punct(Punct::Lt) {
            let mut depth = 0u32;
            loop {
                if self.cur().is_eof() {
                    return Err(self.fatal_here("unexpected end of file in specialization"));
                }
                if self.at_punct(Punct::Lt) {
                    depth += 1;
                } else if self.at_punct(Punct::Gt) {
                    depth -= 1;
                    if depth == 0 {
                        self.bump();
                        break;
                    }
                } else if self.at_punct(Punct::Shr) {
                    depth = depth.saturating_sub(2);
                    if depth == 0 {
                        self.bump();
                        break;
                    }
                }
                self.bump();
            }
        }
        let path = self.scopes.current_path();
        let registered_name = if path.is_empty() || self.instantiation_rename.is_some() {
            name
        } else {
            let mut components = path.clone();
            components.push(name);
            self.join_components(&components)
        };

        // Register (or find) the type up front so members can refer to it.
        let existing = self.types.lookup(registered_name);
        let (id, ty) = match existing {
            Some(ty) => match self.types.info(ty).kind {
                TypeKind::Struct { id } => (id, ty),
                _ => return Err(self.err_here("name already declared as a different kind")),
            },
            None => {
                let id = self.types.structs.push(StructInfo {
                    name,
                    ..Default::default()
                });
                let ty = self.types.register_named(
                    registered_name,
                    TypeInfo {
                        name,
                        kind: TypeKind::Struct { id },
                        size_bits: 0,
                        align_bits: 8,
                        is_incomplete_instantiation: self.instantiation_rename.is_some(),
                    },
                );
                self.types.structs[id].ty = ty;
                (id, ty)
            }
        };
        self.scopes.declare(spelled, Declaration::Type(ty));
        if name != spelled {
            self.scopes.declare(name, Declaration::Type(ty));
        }
        if registered_name != name {
            self.scopes
                .declare_at_root(registered_name, Declaration::Type(ty));
        }

        if self.at_punct(Punct::Semi) {
            // Forward declaration; caller consumes the ';'.
            return Ok(ty);
        }
        if self.types.structs[id].is_complete {
            return Err(crate::ParseError {
                message: format!("redefinition of '{}'", self.strings.view(spelled)),
                span: name_token.span,
                fatal: false,
            });
        }

        // Base clause.
        if self.eat_punct(Punct::Colon) {
            loop {
                let mut access = if is_class { Access::Private } else { Access::Public };
                let mut is_virtual = false;
                loop {
                    if self.eat_kw(Kw::Virtual) {
                        is_virtual = true;
                    } else if self.eat_kw(Kw::Public) {
                        access = Access::Public;
                    } else if self.eat_kw(Kw::Private) {
                        access = Access::Private;
                    } else if self.eat_kw(Kw::Protected) {
                        access = Access::Protected;
                    } else {
                        break;
                    }
                }
                let base_ty = self
                    .parse_named_type()?
                    .ok_or_else(|| self.err_here("expected base class name"))?;
                self.types.structs[id].bases.push(BaseClass {
                    ty: base_ty,
                    offset_bits: 0,
                    is_virtual,
                    access,
                });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }

        self.expect_punct(Punct::LBrace)?;
        let mut class_ctx = ClassCtx {
            id,
            ty,
            name,
            access: if is_class { Access::Private } else { Access::Public },
            deferred: Vec::new(),
        };
        let saved_self = self.self_type.replace(ty);
        self.scopes.push(ScopeKind::Class(ty));
        let body_result = self.parse_class_body(&mut class_ctx);
        self.scopes.pop();
        self.self_type = saved_self;
        body_result?;

        self.types.complete_struct(id);
        self.replay_deferred_bodies(class_ctx)?;
        Ok(ty)
    }

    fn parse_class_body(&mut self, class: &mut ClassCtx) -> PResult<()> {
        while !self.at_punct(Punct::RBrace) {
            if self.cur().is_eof() {
                return Err(self.fatal_here("unexpected end of file in class body"));
            }
            // Access labels.
            if self.at_kw(Kw::Public) && self.toks.peek(1).is_punct(Punct::Colon) {
                self.bump();
                self.bump();
                class.access = Access::Public;
                continue;
            }
            if self.at_kw(Kw::Private) && self.toks.peek(1).is_punct(Punct::Colon) {
                self.bump();
                self.bump();
                class.access = Access::Private;
                continue;
            }
            if self.at_kw(Kw::Protected) && self.toks.peek(1).is_punct(Punct::Colon) {
                self.bump();
                self.bump();
                class.access = Access::Protected;
                continue;
            }
            if self.at_kw(Kw::Friend) {
                self.bump();
                let _ = self.eat_kw(Kw::Class) || self.eat_kw(Kw::Struct);
                let friend = self.expect_ident()?;
                self.types.structs[class.id].friends.push(friend);
                self.expect_punct(Punct::Semi)?;
                continue;
            }
            self.parse_member_declaration(class)?;
        }
        self.bump(); // }
        Ok(())
    }

    fn parse_member_declaration(&mut self, class: &mut ClassCtx) -> PResult<()> {
        match self.cur().kind {
            TokenKind::Keyword(Kw::Using) => return self.parse_using(DeclContext::ClassMember),
            TokenKind::Keyword(Kw::StaticAssert) => return self.parse_static_assert(),
            TokenKind::Keyword(Kw::Enum) if self.is_enum_definition() => return self.parse_enum(),
            _ => {}
        }
        let specifiers = self.parse_decl_specifiers();

        // Constructor: `Name(...)`; destructor: `~Name()`.
        if self.at_punct(Punct::Tilde) {
            return self.parse_ctor_dtor(class, specifiers, true);
        }
        if self.at_ident()
            && self.cur().text == class.name
            && self.toks.peek(1).is_punct(Punct::LParen)
        {
            return self.parse_ctor_dtor(class, specifiers, false);
        }
        // The pattern name inside an instantiated class body is also a
        // constructor name.
        if let Some((orig, renamed)) = self.instantiation_rename {
            if renamed == class.name
                && self.at_ident()
                && self.cur().text == orig
                && self.toks.peek(1).is_punct(Punct::LParen)
            {
                return self.parse_ctor_dtor(class, specifiers, false);
            }
        }

        let parsed = self
            .try_parse_type()?
            .ok_or_else(|| self.err_here("expected member declaration"))?;
        let base = parsed.expect_concrete(self)?;
        let member_ty = self.parse_declarator_prefix(base);

        // `operator` overloads.
        let (name, is_operator) = if self.at_kw(Kw::Operator) {
            (self.parse_operator_name()?, true)
        } else {
            (self.expect_ident()?, false)
        };

        if !is_operator && self.at_punct(Punct::Colon) && !self.toks.peek(1).is_punct(Punct::Colon)
        {
            // Bit-field.
            self.bump();
            let width_expr = self.parse_ternary()?;
            let width = self.eval_const(width_expr)?.as_int().map_err(|e| {
                crate::ParseError {
                    message: e.to_string(),
                    span: self.ast.span(width_expr),
                    fatal: false,
                }
            })? as u8;
            self.expect_punct(Punct::Semi)?;
            self.types.structs[class.id].members.push(Member {
                name,
                ty: member_ty,
                offset_bits: 0,
                bit_width: Some(width),
            });
            return Ok(());
        }

        if self.at_punct(Punct::LParen) {
            return self.parse_member_function(class, specifiers, member_ty, name);
        }

        // Data member(s), possibly with array suffix and initializer.
        loop {
            let mut ty = member_ty;
            if self.eat_punct(Punct::LBracket) {
                let len_expr = self.parse_ternary()?;
                let len = self.eval_const(len_expr)?.as_int().map_err(|e| {
                    crate::ParseError {
                        message: e.to_string(),
                        span: self.ast.span(len_expr),
                        fatal: false,
                    }
                })? as u64;
                self.expect_punct(Punct::RBracket)?;
                ty = self.types.array_of(ty, len, self.strings);
            }

            if specifiers.is_static {
                let (initializer, const_value) = if self.eat_punct(Punct::Assign) {
                    let expr = self.parse_expr()?;
                    let value = if specifiers.is_constexpr {
                        Some(self.eval_const(expr)?)
                    } else {
                        crate::consteval::ConstExprEvaluator::new(&self.ast, self.types)
                            .with_functions(&self.functions)
                            .eval(expr)
                            .ok()
                    };
                    (Some(expr), value)
                } else {
                    (None, None)
                };
                self.types.structs[class.id].statics.push(StaticMember {
                    name,
                    ty,
                    initializer,
                    const_value,
                });
            } else {
                // Default member initializers are accepted and currently
                // applied only through constructors that name them.
                if self.eat_punct(Punct::Assign) {
                    let _ = self.parse_expr()?;
                } else if self.at_punct(Punct::LBrace) {
                    let _ = self.parse_braced_args()?;
                }
                self.types.structs[class.id].members.push(Member {
                    name,
                    ty,
                    offset_bits: 0,
                    bit_width: None,
                });
            }

            if self.eat_punct(Punct::Comma) {
                continue;
            }
            self.expect_punct(Punct::Semi)?;
            return Ok(());
        }
    }

    fn parse_operator_name(&mut self) -> PResult<StringHandle> {
        let span = self.cur().span;
        self.bump(); // operator
        let symbol = match self.cur().kind {
            TokenKind::Punct(p) => {
                self.bump();
                // `operator()` and `operator[]` consume the closer too.
                match p {
                    Punct::LParen => {
                        self.expect_punct(Punct::RParen)?;
                        "()".to_string()
                    }
                    Punct::LBracket => {
                        self.expect_punct(Punct::RBracket)?;
                        "[]".to_string()
                    }
                    _ => punct_spelling(p).to_string(),
                }
            }
            _ => {
                return Err(crate::ParseError {
                    message: "expected operator symbol".to_string(),
                    span,
                    fatal: false,
                })
            }
        };
        Ok(self.strings.intern(&format!("operator{symbol}")))
    }

    fn parse_ctor_dtor(
        &mut self,
        class: &mut ClassCtx,
        specifiers: DeclSpecifiers,
        is_dtor: bool,
    ) -> PResult<()> {
        if is_dtor {
            self.bump(); // ~
        }
        let spelled = self.expect_ident()?;
        let name = if is_dtor {
            let text = format!("~{}", self.strings.view(class.name));
            self.strings.intern(&text)
        } else {
            class.name
        };
        let _ = spelled;
        let (params, param_types, variadic) = self.parse_param_list()?;
        let void = self.types.builtins.void;
        let fn_ty = self
            .types
            .function_type(void, param_types, variadic, self.strings);
        while self.eat_kw(Kw::Noexcept) || self.eat_kw(Kw::Const) {}
        let virtuality = if specifiers.is_virtual {
            Virtuality::Virtual
        } else {
            Virtuality::None
        };
        let fn_index = self.types.structs[class.id].member_fns.len();
        self.types.structs[class.id].member_fns.push(MemberFunction {
            name,
            ty: fn_ty,
            body: None,
            virtuality,
            access: class.access,
            is_static: false,
            is_const: false,
            is_ctor: !is_dtor,
            is_dtor,
            vtable_slot: None,
        });

        if self.eat_punct(Punct::Semi) {
            return Ok(());
        }
        // Capture the ctor-init list and body for replay after completion.
        let span = self.cur().span;
        let start = self.toks.pos();
        if self.at_punct(Punct::Colon) {
            // Skip to the opening brace of the body. Braced member
            // initializers (`y{0}`) are skipped as balanced groups; the body
            // brace is the one not followed by `,` or another initializer.
            self.bump();
            loop {
                if self.cur().is_eof() {
                    return Err(self.fatal_here("unexpected end of file in constructor"));
                }
                if self.at_punct(Punct::LParen) {
                    self.skip_balanced(Punct::LParen, Punct::RParen)?;
                } else if self.at_punct(Punct::LBrace) {
                    let mark = self.toks.save();
                    self.skip_balanced(Punct::LBrace, Punct::RBrace)?;
                    if self.at_punct(Punct::Comma) || self.at_punct(Punct::LBrace) {
                        continue; // that brace was a member initializer
                    }
                    self.toks.restore(mark);
                    break;
                } else {
                    self.bump();
                }
            }
        }
        let (_, end) = self.skip_balanced(Punct::LBrace, Punct::RBrace)?;
        class.deferred.push(DeferredBody {
            fn_index,
            params,
            return_ty: void,
            body: TokenRange::new(start, end),
            is_ctor: !is_dtor,
            is_dtor,
            span,
        });
        Ok(())
    }

    fn parse_member_function(
        &mut self,
        class: &mut ClassCtx,
        specifiers: DeclSpecifiers,
        return_ty: TypeIndex,
        name: StringHandle,
    ) -> PResult<()> {
        let (params, param_types, variadic) = self.parse_param_list()?;
        let fn_ty = self
            .types
            .function_type(return_ty, param_types, variadic, self.strings);
        let mut is_const = false;
        let mut virtuality = if specifiers.is_virtual {
            Virtuality::Virtual
        } else {
            Virtuality::None
        };
        loop {
            if self.eat_kw(Kw::Const) {
                is_const = true;
            } else if self.eat_kw(Kw::Noexcept) {
            } else if self.at_ident() && self.cur_text() == "override" {
                self.bump();
                virtuality = Virtuality::Override;
            } else if self.at_ident() && self.cur_text() == "final" {
                self.bump();
            } else {
                break;
            }
        }
        // Pure virtual: `= 0`.
        if self.at_punct(Punct::Assign) && self.toks.peek(1).kind == TokenKind::IntLit {
            self.bump();
            self.bump();
            virtuality = Virtuality::Pure;
        }

        let fn_index = self.types.structs[class.id].member_fns.len();
        self.types.structs[class.id].member_fns.push(MemberFunction {
            name,
            ty: fn_ty,
            body: None,
            virtuality,
            access: class.access,
            is_static: specifiers.is_static,
            is_const,
            is_ctor: false,
            is_dtor: false,
            vtable_slot: None,
        });

        if self.eat_punct(Punct::Semi) {
            return Ok(());
        }
        let span = self.cur().span;
        let start = self.toks.pos();
        let (_, end) = self.skip_balanced(Punct::LBrace, Punct::RBrace)?;
        class.deferred.push(DeferredBody {
            fn_index,
            params,
            return_ty,
            body: TokenRange::new(start, end),
            is_ctor: false,
            is_dtor: false,
            span,
        });
        Ok(())
    }

    /// After class completion, replay each deferred member-function body in
    /// a function scope with the parameters and `this` bound.
    fn replay_deferred_bodies(&mut self, class: ClassCtx) -> PResult<()> {
        let ClassCtx { id, ty, name: class_name, deferred: bodies, .. } = class;
        for deferred in bodies {
            let member = self.types.structs[id].member_fns[deferred.fn_index].clone();
            let sub = self.toks.slice_stream(deferred.body.start, deferred.body.end);
            let saved = std::mem::replace(&mut self.toks, sub);
            let result = self.parse_deferred_body(ty, &member, &deferred);
            self.toks = saved;
            let (body, ctor_inits, locals) = result?;

            let method_of = if member.is_static { None } else { Some(ty) };
            self.functions.push(FunctionDef {
                name: member.name,
                path: vec![class_name],
                ty: member.ty,
                params: deferred.params,
                body: Some(body),
                ctor_inits,
                locals,
                method_of,
                is_virtual: member.virtuality.is_virtual(),
                is_ctor: deferred.is_ctor,
                is_dtor: deferred.is_dtor,
                is_extern_c: false,
                linkage: Linkage::External,
                span: deferred.span,
            });
            self.types.structs[id].member_fns[deferred.fn_index].body = Some(body);
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn parse_deferred_body(
        &mut self,
        class_ty: TypeIndex,
        member: &MemberFunction,
        deferred: &DeferredBody,
    ) -> PResult<(NodeId, Vec<(StringHandle, NodeId)>, IndexVec<fcpp_util::LocalId, crate::ast::LocalDef>)>
    {
        let fn_ctx = FnCtx {
            locals: IndexVec::new(),
            params: deferred.params.clone(),
            return_ty: deferred.return_ty,
            method_of: if member.is_static { None } else { Some(class_ty) },
        };
        let saved_ctx = self.fn_ctx.replace(fn_ctx);
        self.scopes.push(ScopeKind::Function);
        for (index, param) in deferred.params.iter().enumerate() {
            self.scopes.declare(
                param.name,
                Declaration::Param { index: index as u32, ty: param.ty },
            );
        }

        let result = (|| {
            let mut ctor_inits = Vec::new();
            if deferred.is_ctor && self.eat_punct(Punct::Colon) {
                loop {
                    let member_name = self.expect_ident()?;
                    let args = if self.at_punct(Punct::LBrace) {
                        self.parse_braced_args()?
                    } else {
                        self.parse_call_args()?
                    };
                    // A single-argument init is stored as that expression; a
                    // multi-argument one as a constructor temp.
                    let init_expr = match args.len() {
                        1 => args[0],
                        _ => {
                            let mty = self
                                .types
                                .find_member(class_ty, member_name)
                                .map(|(m, _)| m.ty)
                                .unwrap_or(self.types.builtins.int);
                            self.ast.alloc(
                                NodeKind::ConstructTemp { ty: mty, args },
                                deferred.span,
                            )
                        }
                    };
                    ctor_inits.push((member_name, init_expr));
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
            }
            let body = self.parse_compound()?;
            Ok((ctor_inits, body))
        })();

        self.scopes.pop();
        let fn_ctx = std::mem::replace(&mut self.fn_ctx, saved_ctx).expect("fn ctx present");
        let (ctor_inits, body) = result?;
        Ok((body, ctor_inits, fn_ctx.locals))
    }

    // ------------------------------------------------------------------
    // Functions and variables
    // ------------------------------------------------------------------

    /// Parameter list: `( [type declarator [name] [, ...]] [, ...] )`.
    pub(crate) fn parse_param_list(
        &mut self,
    ) -> PResult<(Vec<ParamDef>, Vec<TypeIndex>, bool)> {
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        let mut types = Vec::new();
        let mut variadic = false;
        if self.eat_punct(Punct::RParen) {
            return Ok((params, types, variadic));
        }
        // `(void)` is an empty list.
        if self.at_kw(Kw::Void) && self.toks.peek(1).is_punct(Punct::RParen) {
            self.bump();
            self.bump();
            return Ok((params, types, variadic));
        }
        loop {
            if self.eat_punct(Punct::Ellipsis) {
                variadic = true;
                self.expect_punct(Punct::RParen)?;
                return Ok((params, types, variadic));
            }
            let parsed = self
                .parse_type_specifier()?
                .ok_or_else(|| self.err_here("expected parameter type"))?;
            let base = parsed.expect_concrete(self)?;
            let mut ty = self.parse_declarator_prefix(base);
            let name = if self.at_ident() {
                self.bump().text
            } else {
                self.strings.intern("")
            };
            if self.eat_punct(Punct::LBracket) {
                // Array parameters decay to pointers.
                if !self.at_punct(Punct::RBracket) {
                    let _ = self.parse_ternary()?;
                }
                self.expect_punct(Punct::RBracket)?;
                ty = self.types.pointer_to(ty, self.strings);
            }
            if self.eat_punct(Punct::Assign) {
                // Default arguments are parsed and dropped; call sites must
                // pass every argument.
                let _ = self.parse_expr()?;
            }
            params.push(ParamDef { name, ty });
            types.push(ty);
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            self.expect_punct(Punct::RParen)?;
            return Ok((params, types, variadic));
        }
    }

    /// Declarator list after specifiers and type: functions, globals and
    /// block-scope variables.
    fn parse_declarators(
        &mut self,
        ctx: DeclContext,
        specifiers: DeclSpecifiers,
        parsed: ParsedType,
    ) -> PResult<Option<NodeId>> {
        let span = self.cur().span;

        // Structured binding: `auto [a, b] = expr;`
        if parsed == ParsedType::Auto && self.at_punct(Punct::LBracket) {
            return self.parse_structured_binding(span).map(Some);
        }

        let mut decls: Vec<LocalDecl> = Vec::new();
        let mut first = true;
        loop {
            let base = match parsed {
                ParsedType::Auto => None,
                ParsedType::Ty(t) => Some(t),
            };
            let declared_ty = base.map(|b| self.parse_declarator_prefix(b));

            // Declarator name, possibly qualified for out-of-class
            // definitions (`void Point::move(...)`).
            let spelled = self.expect_ident()?;
            let mut components = vec![self.apply_rename(spelled)];
            while self.at_punct(Punct::ColonColon)
                && self.toks.peek(1).kind == TokenKind::Identifier
            {
                self.bump();
                components.push(self.bump().text);
            }
            let name = *components.last().expect("non-empty declarator name");

            if first && self.at_punct(Punct::LParen) && self.paren_is_param_list() {
                let return_ty = declared_ty
                    .ok_or_else(|| self.err_here("'auto' return type requires a trailing type"))?;
                self.parse_function_rest(ctx, specifiers, return_ty, &components, span)?;
                return Ok(None);
            }

            // Variable declarator.
            let mut var_ty = declared_ty;
            if self.eat_punct(Punct::LBracket) {
                let len_expr = self.parse_ternary()?;
                let len = self.eval_const(len_expr)?.as_int().map_err(|e| {
                    crate::ParseError {
                        message: e.to_string(),
                        span: self.ast.span(len_expr),
                        fatal: false,
                    }
                })? as u64;
                self.expect_punct(Punct::RBracket)?;
                let elem = var_ty.ok_or_else(|| self.err_here("array of 'auto' is not allowed"))?;
                var_ty = Some(self.types.array_of(elem, len, self.strings));
            }

            let init = if self.eat_punct(Punct::Assign) {
                if self.at_punct(Punct::LBrace) {
                    Some(Initializer::Braced(self.parse_braced_args()?))
                } else {
                    Some(Initializer::Expr(self.parse_expr()?))
                }
            } else if self.at_punct(Punct::LBrace) {
                Some(Initializer::Braced(self.parse_braced_args()?))
            } else if self.at_punct(Punct::LParen) {
                Some(Initializer::Ctor(self.parse_call_args()?))
            } else {
                None
            };

            // `auto` deduction from the initializer.
            let ty = match var_ty {
                Some(t) => t,
                None => match &init {
                    Some(Initializer::Expr(e)) => {
                        let t =
                            crate::typecheck::expr_type(&self.ast, self.types, self.strings, *e);
                        self.types.strip_reference(t)
                    }
                    _ => {
                        return Err(self.err_here(
                            "'auto' requires an `= expression` initializer",
                        ))
                    }
                },
            };

            self.record_variable(ctx, &specifiers, name, &components, ty, init, &mut decls, span)?;

            first = false;
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            self.expect_punct(Punct::Semi)?;
            break;
        }

        if decls.is_empty() {
            Ok(Some(self.ast.alloc(NodeKind::Empty, span)))
        } else {
            Ok(Some(self.ast.alloc(NodeKind::VarDecl { decls }, span)))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_variable(
        &mut self,
        ctx: DeclContext,
        specifiers: &DeclSpecifiers,
        name: StringHandle,
        components: &[StringHandle],
        ty: TypeIndex,
        init: Option<Initializer>,
        decls: &mut Vec<LocalDecl>,
        span: Span,
    ) -> PResult<()> {
        match ctx {
            DeclContext::BlockScope | DeclContext::ForInit => {
                if specifiers.is_constexpr {
                    let value = match &init {
                        Some(Initializer::Expr(e)) => self.eval_const(*e)?,
                        _ => {
                            return Err(
                                self.err_here("constexpr variable requires an initializer")
                            )
                        }
                    };
                    self.scopes
                        .declare(name, Declaration::Constexpr { ty, value });
                    return Ok(());
                }
                let local = self.fn_ctx().alloc_local(name, ty);
                if !self.scopes.declare(name, Declaration::Local { local, ty }) {
                    self.handler.error(
                        format!("redefinition of '{}'", self.strings.view(name)),
                        span,
                    );
                }
                decls.push(LocalDecl { name, ty, local, init });
                Ok(())
            }
            DeclContext::TopLevel => {
                if components.len() > 1 {
                    return Err(self.err_here("qualified variable definitions are not supported"));
                }
                let init_node = match &init {
                    Some(Initializer::Expr(e)) => Some(*e),
                    Some(Initializer::Braced(elems)) if elems.len() == 1 => Some(elems[0]),
                    Some(Initializer::Braced(_)) => None,
                    Some(Initializer::Ctor(_)) => None,
                    None => None,
                };
                let init_const: Option<ConstValue> = init_node.and_then(|e| {
                    crate::consteval::ConstExprEvaluator::new(&self.ast, self.types)
                        .with_functions(&self.functions)
                        .eval(e)
                        .ok()
                });
                if specifiers.is_constexpr {
                    let value = init_const
                        .ok_or_else(|| self.err_here("constexpr initializer is not constant"))?;
                    self.scopes
                        .declare(name, Declaration::Constexpr { ty, value });
                    let path = self.scopes.current_path();
                    if !path.is_empty() {
                        let mut all = path;
                        all.push(name);
                        let joined = self.join_components(&all);
                        self.scopes
                            .declare_at_root(joined, Declaration::Constexpr { ty, value });
                    }
                    return Ok(());
                }
                let path = self.scopes.current_path();
                self.scopes
                    .declare(name, Declaration::Global { ty, init: init_node });
                if !path.is_empty() {
                    let mut all = path.clone();
                    all.push(name);
                    let joined = self.join_components(&all);
                    self.scopes
                        .declare_at_root(joined, Declaration::Global { ty, init: init_node });
                }
                self.globals.push(GlobalDef {
                    name,
                    path,
                    ty,
                    init: init_node,
                    init_const,
                    linkage: if specifiers.is_static {
                        Linkage::Internal
                    } else {
                        Linkage::External
                    },
                    span,
                });
                Ok(())
            }
            DeclContext::ClassMember | DeclContext::LambdaCapture => {
                Err(self.err_here("unexpected variable declaration in this context"))
            }
        }
    }

    /// `auto [a, b] = expr;`
    fn parse_structured_binding(&mut self, span: Span) -> PResult<NodeId> {
        self.expect_punct(Punct::LBracket)?;
        let mut names = Vec::new();
        loop {
            names.push(self.expect_ident()?);
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            self.expect_punct(Punct::RBracket)?;
            break;
        }
        self.expect_punct(Punct::Assign)?;
        let init = self.parse_expr()?;
        self.expect_punct(Punct::Semi)?;

        let init_ty = crate::typecheck::expr_type(&self.ast, self.types, self.strings, init);
        let canon = self.types.strip_reference(init_ty);
        let members: Vec<(StringHandle, TypeIndex)> = self
            .types
            .struct_of(canon)
            .map(|s| s.members.iter().map(|m| (m.name, m.ty)).collect())
            .unwrap_or_default();
        if members.len() != names.len() {
            return Err(crate::ParseError {
                message: format!(
                    "cannot decompose into {} names: initializer has {} members",
                    names.len(),
                    members.len()
                ),
                span,
                fatal: false,
            });
        }
        let mut locals = Vec::new();
        for (name, (_, mty)) in names.iter().zip(&members) {
            let local = self.fn_ctx().alloc_local(*name, *mty);
            self.scopes
                .declare(*name, Declaration::Local { local, ty: *mty });
            locals.push((*name, local));
        }
        Ok(self
            .ast
            .alloc(NodeKind::StructuredBinding { locals, init }, span))
    }

    /// The rest of a function declaration/definition after its name.
    fn parse_function_rest(
        &mut self,
        ctx: DeclContext,
        specifiers: DeclSpecifiers,
        return_ty: TypeIndex,
        components: &[StringHandle],
        span: Span,
    ) -> PResult<()> {
        let name = *components.last().expect("non-empty function name");

        // Out-of-class method definition: `ret Class::method(...)`.
        let method_of = if components.len() > 1 {
            self.resolve_type_components(&components[..components.len() - 1])
        } else {
            None
        };

        self.scopes.push(ScopeKind::Function);
        let result = self.parse_function_inner(ctx, specifiers, return_ty, name, method_of, span);
        self.scopes.pop();
        result
    }

    fn parse_function_inner(
        &mut self,
        _ctx: DeclContext,
        specifiers: DeclSpecifiers,
        return_ty: TypeIndex,
        spelled: StringHandle,
        method_of: Option<TypeIndex>,
        span: Span,
    ) -> PResult<()> {
        let name = match self.instantiation_rename {
            Some((orig, renamed)) if orig == spelled => renamed,
            _ => spelled,
        };
        let (params, param_types, variadic) = self.parse_param_list()?;
        let fn_ty = self
            .types
            .function_type(return_ty, param_types, variadic, self.strings);
        while self.eat_kw(Kw::Noexcept) {}

        let is_extern_c = self.extern_c_depth > 0 || self.strings.view(name) == "main";
        let path = if method_of.is_some() {
            let class_ty = method_of.expect("checked above");
            vec![self.types.info(class_ty).name]
        } else {
            self.scopes.current_path()
        };

        // Declare into the enclosing scope (an overload set).
        let decl = Declaration::Function(OverloadSet {
            overloads: vec![FunctionDecl {
                name,
                path: path.clone(),
                ty: fn_ty,
                body: None,
                is_extern_c,
            }],
        });
        self.declare_function(name, &path, decl);

        if self.eat_punct(Punct::Semi) {
            return Ok(());
        }

        // Definition.
        let fn_ctx = FnCtx {
            locals: IndexVec::new(),
            params: params.clone(),
            return_ty,
            method_of,
        };
        let saved_ctx = self.fn_ctx.replace(fn_ctx);
        for (index, param) in params.iter().enumerate() {
            self.scopes.declare(
                param.name,
                Declaration::Param { index: index as u32, ty: param.ty },
            );
        }
        let body_result = self.parse_compound();
        let fn_ctx = std::mem::replace(&mut self.fn_ctx, saved_ctx).expect("fn ctx present");
        let body = body_result?;

        if let Some(Declaration::Function(set)) = self.scopes.lookup_mut(name) {
            if let Some(f) = set.overloads.iter_mut().find(|f| f.ty == fn_ty) {
                f.body = Some(body);
            }
        }
        // Out-of-class definition completes the in-class declaration.
        if let Some(class_ty) = method_of {
            if let TypeKind::Struct { id } = self.types.info(class_ty).kind {
                if let Some(f) = self.types.structs[id]
                    .member_fns
                    .iter_mut()
                    .find(|f| f.name == name && f.ty == fn_ty)
                {
                    f.body = Some(body);
                }
            }
        }

        self.functions.push(FunctionDef {
            name,
            path,
            ty: fn_ty,
            params,
            body: Some(body),
            ctor_inits: Vec::new(),
            locals: fn_ctx.locals,
            method_of,
            is_virtual: specifiers.is_virtual,
            is_ctor: false,
            is_dtor: false,
            is_extern_c,
            linkage: if specifiers.is_static {
                Linkage::Internal
            } else {
                Linkage::External
            },
            span,
        });
        Ok(())
    }

    /// Declare a function in the current scope and, when inside a
    /// namespace, under its qualified name at the root.
    pub(crate) fn declare_function(
        &mut self,
        name: StringHandle,
        path: &[StringHandle],
        decl: Declaration,
    ) {
        self.scopes.declare(name, decl.clone());
        if !path.is_empty() {
            let mut components = path.to_vec();
            components.push(name);
            let joined = self.join_components(&components);
            self.scopes.declare_at_root(joined, decl);
        }
    }

    /// The body of a captureless lambda: parameters, optional trailing
    /// return type, compound body; synthesized as a free function.
    pub(crate) fn parse_lambda_function(
        &mut self,
        fn_name: StringHandle,
        span: Span,
    ) -> PResult<NodeId> {
        let (params, param_types, variadic) = if self.at_punct(Punct::LParen) {
            self.parse_param_list()?
        } else {
            (Vec::new(), Vec::new(), false)
        };
        let explicit_ret = if self.eat_punct(Punct::Arrow) {
            let parsed = self
                .parse_type_specifier()?
                .ok_or_else(|| self.err_here("expected return type after '->'"))?;
            let base = parsed.expect_concrete(self)?;
            Some(self.parse_declarator_prefix(base))
        } else {
            None
        };

        self.scopes.push(ScopeKind::Lambda);
        let fn_ctx = FnCtx {
            locals: IndexVec::new(),
            params: params.clone(),
            return_ty: explicit_ret.unwrap_or(self.types.builtins.int),
            method_of: None,
        };
        let saved_ctx = self.fn_ctx.replace(fn_ctx);
        for (index, param) in params.iter().enumerate() {
            self.scopes.declare(
                param.name,
                Declaration::Param { index: index as u32, ty: param.ty },
            );
        }
        let body_result = self.parse_compound();
        let fn_ctx = std::mem::replace(&mut self.fn_ctx, saved_ctx).expect("fn ctx present");
        self.scopes.pop();
        let body = body_result?;

        // Deduce the return type from the first `return expr;` if no
        // trailing type was given.
        let return_ty = match explicit_ret {
            Some(t) => t,
            None => self
                .first_return_type(body)
                .unwrap_or(self.types.builtins.void),
        };
        let fn_ty = self
            .types
            .function_type(return_ty, param_types, variadic, self.strings);

        self.functions.push(FunctionDef {
            name: fn_name,
            path: Vec::new(),
            ty: fn_ty,
            params,
            body: Some(body),
            ctor_inits: Vec::new(),
            locals: fn_ctx.locals,
            method_of: None,
            is_virtual: false,
            is_ctor: false,
            is_dtor: false,
            is_extern_c: false,
            linkage: Linkage::Internal,
            span,
        });
        Ok(self.ast.alloc(NodeKind::Lambda { fn_name, fn_ty }, span))
    }

    fn first_return_type(&mut self, body: NodeId) -> Option<TypeIndex> {
        // Walk the statement tree for the first `return expr`.
        let mut stack = vec![body];
        while let Some(id) = stack.pop() {
            match self.ast.kind(id).clone() {
                NodeKind::Return(Some(e)) => {
                    return Some(crate::typecheck::expr_type(
                        &self.ast,
                        self.types,
                        self.strings,
                        e,
                    ))
                }
                NodeKind::Compound { stmts } => stack.extend(stmts),
                NodeKind::If { then_branch, else_branch, .. } => {
                    stack.push(then_branch);
                    stack.extend(else_branch);
                }
                NodeKind::While { body, .. }
                | NodeKind::DoWhile { body, .. }
                | NodeKind::For { body, .. }
                | NodeKind::RangeFor { body, .. } => stack.push(body),
                _ => {}
            }
        }
        None
    }
}

/// Canonical spelling of a punctuator for `operator` names.
fn punct_spelling(p: Punct) -> &'static str {
    use Punct::*;
    match p {
        Plus => "+",
        Minus => "-",
        Star => "*",
        Slash => "/",
        Percent => "%",
        Amp => "&",
        Pipe => "|",
        Caret => "^",
        Tilde => "~",
        Bang => "!",
        Assign => "=",
        Lt => "<",
        Gt => ">",
        LtEq => "<=",
        GtEq => ">=",
        EqEq => "==",
        BangEq => "!=",
        Spaceship => "<=>",
        Shl => "<<",
        Shr => ">>",
        PlusPlus => "++",
        MinusMinus => "--",
        PlusEq => "+=",
        MinusEq => "-=",
        StarEq => "*=",
        SlashEq => "/=",
        PercentEq => "%=",
        AmpEq => "&=",
        PipeEq => "|=",
        CaretEq => "^=",
        ShlEq => "<<=",
        ShrEq => ">>=",
        AmpAmp => "&&",
        PipePipe => "||",
        Arrow => "->",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::NodeKind;
    use crate::test_support::{parse_clean, parse_src};

    #[test]
    fn test_global_with_const_initializer() {
        let p = parse_clean("int answer = 40 + 2;");
        assert_eq!(p.output.globals.len(), 1);
        let g = &p.output.globals[0];
        assert_eq!(p.strings.view(g.name), "answer");
        assert_eq!(
            g.init_const,
            Some(fcpp_sem::ConstValue::int(42))
        );
    }

    #[test]
    fn test_function_vs_variable_disambiguation() {
        // `int x(T);` is a function when T names a type, a variable
        // otherwise.
        let p = parse_clean("struct T {}; int f(T); int g(3);");
        // f is a prototype, g is a direct-initialized global.
        assert!(p.output.functions.is_empty());
        assert_eq!(p.output.globals.len(), 1);
        assert_eq!(p.strings.view(p.output.globals[0].name), "g");
    }

    #[test]
    fn test_simple_struct_layout() {
        let p = parse_clean("struct Point { int x; int y; };");
        assert!(p.output.functions.is_empty());
        let ty = p
            .types
            .named_types()
            .find(|&(n, _)| p.strings.view(n) == "Point")
            .map(|(_, t)| t)
            .expect("Point registered");
        assert_eq!(p.types.size_bits(ty), 64);
    }

    #[test]
    fn test_member_function_sees_later_member() {
        // `get` references `v`, declared after it in the class.
        let p = parse_clean("struct H { int get() const { return v; } int v; };");
        let get = p
            .output
            .functions
            .iter()
            .find(|f| p.strings.view(f.name) == "get")
            .expect("member function parsed");
        assert!(get.method_of.is_some());
    }

    #[test]
    fn test_ctor_with_init_list() {
        let p = parse_clean("struct P { int x; int y; P(int a) : x(a), y(0) {} };");
        let ctor = p
            .output
            .functions
            .iter()
            .find(|f| f.is_ctor)
            .expect("constructor parsed");
        assert_eq!(ctor.ctor_inits.len(), 2);
    }

    #[test]
    fn test_namespace_qualified_lookup() {
        let p = parse_clean("namespace n { int g = 7; } int main() { return n::g; }");
        assert_eq!(p.output.globals.len(), 1);
        assert_eq!(p.output.globals[0].path.len(), 1);
    }

    #[test]
    fn test_enum_and_scoped_enum() {
        let p = parse_clean(
            "enum Color { Red, Green = 5, Blue }; enum class E : char { A };\n             int main() { return Blue + static_cast<int>(E::A); }",
        );
        let color = p
            .types
            .enums
            .iter()
            .find(|e| p.strings.view(e.name) == "Color")
            .expect("Color enum");
        assert_eq!(color.enumerators[2].1, 6);
        let e = p
            .types
            .enums
            .iter()
            .find(|e| p.strings.view(e.name) == "E")
            .expect("E enum");
        assert!(e.is_scoped);
    }

    #[test]
    fn test_static_assert_failure_reports() {
        let p = parse_src("static_assert(1 == 2, \"math is broken\");");
        assert!(p.handler.has_errors());
    }

    #[test]
    fn test_structured_binding() {
        let p = parse_clean(
            "struct Point { int x; int y; };\n             int main() { Point p{20, 12}; auto [a, b] = p; return a + b; }",
        );
        let main = &p.output.functions[0];
        let body = main.body.expect("body");
        match p.output.ast.kind(body) {
            NodeKind::Compound { stmts } => {
                assert!(matches!(
                    p.output.ast.kind(stmts[1]),
                    NodeKind::StructuredBinding { locals, .. } if locals.len() == 2
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_virtual_methods_get_vtable() {
        let p = parse_clean(
            "struct Base { virtual int f() { return 1; } virtual int g() { return 2; } };\n             struct Derived : Base { int f() override { return 3; } };",
        );
        let derived_ty = p
            .types
            .named_types()
            .find(|&(n, _)| p.strings.view(n) == "Derived")
            .map(|(_, t)| t)
            .expect("Derived registered");
        let s = p.types.struct_of(derived_ty).expect("struct info");
        let vt = s.vtable.as_ref().expect("vtable built");
        assert_eq!(vt.slots.len(), 2);
    }

    #[test]
    fn test_extern_c_function() {
        let p = parse_clean("extern \"C\" int puts(const char* s);");
        assert!(p.output.functions.is_empty());
        // The prototype is declared; no definition emitted.
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_lambda_captureless() {
        let p = parse_clean("int main() { auto f = [](int x) { return x + 1; }; return f(41); }");
        assert!(p
            .output
            .functions
            .iter()
            .any(|f| p.strings.view(f.name).starts_with("__lambda$")));
    }

    #[test]
    fn test_using_alias() {
        let p = parse_clean("using myint = int; myint x = 3;");
        assert_eq!(p.output.globals.len(), 1);
        assert!(p.types.is_integral(p.output.globals[0].ty));
    }
}
