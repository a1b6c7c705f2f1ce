//! Template registration and instantiation.
//!
//! A template definition is registered without parsing its body: the body is
//! captured as a token range and replayed at instantiation time with the
//! parameter bindings installed in a `TemplateParams` scope. Replay gives
//! two-phase lookup for free — a dependent name is resolved by the ordinary
//! lookup rules of the replayed parse, which sees the bound parameters.
//!
//! Instantiation renames the pattern to its hash-suffixed identity
//! (`H$0123...`) before registration, and both the name hash and the cache
//! key are computed from the *unqualified* pattern name plus canonical
//! arguments, so every syntactic path to an instantiation converges on one
//! entity.

use fcpp_lex::{Kw, Punct, TokenKind};
use fcpp_sem::{
    Declaration, InstantiatedEntity, InstantiationError, Specialization, TemplateArg,
    TemplateKind, TemplateParam, TemplateParamKind, TemplatePattern, TokenRange, TypeIndex,
    TypePattern,
};
use fcpp_util::StringHandle;

use crate::{DeclContext, PResult, Parser};

impl<'ctx> Parser<'ctx> {
    /// Map a spelled name through the active instantiation rename.
    pub(crate) fn apply_rename(&self, spelled: StringHandle) -> StringHandle {
        match self.instantiation_rename {
            Some((orig, renamed)) if orig == spelled => renamed,
            _ => spelled,
        }
    }

    /// `template < params > entity` — registration entry.
    pub(crate) fn parse_template_declaration(&mut self) -> PResult<()> {
        self.bump(); // template
        self.expect_punct(Punct::Lt)?;
        let params = self.parse_template_param_list()?;

        // Optional requires-clause: `requires ( expr )`.
        let constraint = if self.at_kw(Kw::Requires) {
            self.bump();
            let (start, end) = self.skip_balanced(Punct::LParen, Punct::RParen)?;
            Some(self.capture_range(start, end))
        } else {
            None
        };

        let entity_start = self.toks.pos();
        match self.cur().kind {
            TokenKind::Keyword(Kw::Struct | Kw::Class) => {
                self.parse_class_template(params, constraint, entity_start)
            }
            TokenKind::Keyword(Kw::Using) => {
                self.parse_alias_template(params, constraint, entity_start)
            }
            _ => self.parse_function_or_variable_template(params, constraint, entity_start),
        }
    }

    fn parse_template_param_list(&mut self) -> PResult<Vec<TemplateParam>> {
        let mut params = Vec::new();
        if self.close_angle()? {
            return Ok(params);
        }
        loop {
            let param = if self.at_kw(Kw::Typename) || self.at_kw(Kw::Class) {
                self.bump();
                let is_pack = self.eat_punct(Punct::Ellipsis);
                let name = self.expect_ident()?;
                let default = self.capture_default_arg()?;
                TemplateParam { name, kind: TemplateParamKind::Type, is_pack, default }
            } else if self.at_kw(Kw::Template) {
                // template-template parameter: `template <typename> class C`.
                self.bump();
                self.expect_punct(Punct::Lt)?;
                let mut depth = 1u32;
                while depth > 0 {
                    if self.cur().is_eof() {
                        return Err(self.fatal_here("unexpected end of file in template parameter"));
                    }
                    if self.at_punct(Punct::Lt) {
                        depth += 1;
                    } else if self.at_punct(Punct::Gt) {
                        depth -= 1;
                    } else if self.at_punct(Punct::Shr) {
                        depth = depth.saturating_sub(2);
                    }
                    self.bump();
                }
                let _ = self.eat_kw(Kw::Class) || self.eat_kw(Kw::Typename);
                let name = self.expect_ident()?;
                let default = self.capture_default_arg()?;
                TemplateParam {
                    name,
                    kind: TemplateParamKind::Template,
                    is_pack: false,
                    default,
                }
            } else {
                // Non-type parameter: `type name`.
                let parsed = self
                    .parse_type_specifier()?
                    .ok_or_else(|| self.err_here("expected template parameter"))?;
                let base = parsed.expect_concrete(self)?;
                let ty = self.parse_declarator_prefix(base);
                let is_pack = self.eat_punct(Punct::Ellipsis);
                let name = self.expect_ident()?;
                let default = self.capture_default_arg()?;
                TemplateParam {
                    name,
                    kind: TemplateParamKind::Value { ty },
                    is_pack,
                    default,
                }
            };
            params.push(param);
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            if self.close_angle()? {
                return Ok(params);
            }
            return Err(self.err_here("expected ',' or '>' in template parameter list"));
        }
    }

    fn close_angle(&mut self) -> PResult<bool> {
        if self.at_punct(Punct::Shr) {
            self.toks.split_right_shift(self.strings);
        }
        Ok(self.eat_punct(Punct::Gt))
    }

    /// Capture `= tokens` up to a `,` or the closing `>` at depth 0.
    fn capture_default_arg(&mut self) -> PResult<Option<TokenRange>> {
        if !self.eat_punct(Punct::Assign) {
            return Ok(None);
        }
        let start = self.toks.pos();
        let mut angle = 0u32;
        let mut paren = 0u32;
        loop {
            match self.cur().kind {
                TokenKind::Eof => {
                    return Err(self.fatal_here("unexpected end of file in default argument"))
                }
                TokenKind::Punct(Punct::Lt) => angle += 1,
                TokenKind::Punct(Punct::Gt) if angle == 0 && paren == 0 => break,
                TokenKind::Punct(Punct::Gt) => angle = angle.saturating_sub(1),
                TokenKind::Punct(Punct::Shr) if angle == 0 && paren == 0 => break,
                TokenKind::Punct(Punct::Shr) => angle = angle.saturating_sub(2),
                TokenKind::Punct(Punct::Comma) if angle == 0 && paren == 0 => break,
                TokenKind::Punct(Punct::LParen) => paren += 1,
                TokenKind::Punct(Punct::RParen) => paren = paren.saturating_sub(1),
                _ => {}
            }
            self.bump();
        }
        let end = self.toks.pos();
        Ok(Some(self.capture_range(start, end)))
    }

    // ------------------------------------------------------------------
    // Registration by entity kind
    // ------------------------------------------------------------------

    fn parse_class_template(
        &mut self,
        params: Vec<TemplateParam>,
        constraint: Option<TokenRange>,
        entity_start: u32,
    ) -> PResult<()> {
        self.bump(); // struct | class
        let name = self.expect_ident()?;

        // Specialization: `struct X<patterns> { ... };`
        if self.at_punct(Punct::Lt) {
            let patterns = self.parse_spec_arg_patterns(&params)?;
            if self.at_punct(Punct::Semi) {
                self.bump();
                return Ok(());
            }
            if self.at_punct(Punct::Colon) {
                while !self.at_punct(Punct::LBrace) && !self.cur().is_eof() {
                    self.bump();
                }
            }
            self.skip_balanced(Punct::LBrace, Punct::RBrace)?;
            self.expect_punct(Punct::Semi)?;
            let end = self.toks.pos();
            let body = self.capture_range(entity_start, end);
            let spec = Specialization {
                params: params.clone(),
                args: patterns,
                is_partial: !params.is_empty(),
                body,
            };
            return self
                .templates
                .add_specialization(name, spec, self.strings)
                .map_err(|e| self.err_here(e.to_string()));
        }

        // Primary template: forward declaration or definition.
        let body = if self.at_punct(Punct::Semi) {
            self.bump();
            TokenRange::new(0, 0)
        } else {
            if self.at_punct(Punct::Colon) {
                // Base clause inside the captured range.
                while !self.at_punct(Punct::LBrace) && !self.cur().is_eof() {
                    self.bump();
                }
            }
            self.skip_balanced(Punct::LBrace, Punct::RBrace)?;
            self.expect_punct(Punct::Semi)?;
            let end = self.toks.pos();
            self.capture_range(entity_start, end)
        };
        self.templates.register(TemplatePattern {
            name,
            kind: TemplateKind::Class,
            params,
            constraint,
            body,
            specializations: Vec::new(),
        });
        self.scopes.declare(name, Declaration::Template(name));
        Ok(())
    }

    fn parse_alias_template(
        &mut self,
        params: Vec<TemplateParam>,
        constraint: Option<TokenRange>,
        entity_start: u32,
    ) -> PResult<()> {
        // `using X = type;` — skip to the `;`.
        self.bump(); // using
        let name = self.expect_ident()?;
        while !self.at_punct(Punct::Semi) {
            if self.cur().is_eof() {
                return Err(self.fatal_here("unexpected end of file in alias template"));
            }
            self.bump();
        }
        self.bump(); // ;
        let end = self.toks.pos();
        let body = self.capture_range(entity_start, end);
        self.templates.register(TemplatePattern {
            name,
            kind: TemplateKind::Alias,
            params,
            constraint,
            body,
            specializations: Vec::new(),
        });
        self.scopes.declare(name, Declaration::Template(name));
        Ok(())
    }

    fn parse_function_or_variable_template(
        &mut self,
        params: Vec<TemplateParam>,
        constraint: Option<TokenRange>,
        entity_start: u32,
    ) -> PResult<()> {
        // Scan forward to find the declared name and classify function vs
        // variable, without parsing dependent types.
        let mark = self.toks.save();
        let mut name: Option<StringHandle> = None;
        let mut is_function = false;
        let mut param_list_start = 0u32;
        loop {
            let t = *self.cur();
            match t.kind {
                TokenKind::Eof => break,
                TokenKind::Identifier => {
                    if self.toks.peek(1).is_punct(Punct::LParen) {
                        name = Some(t.text);
                        is_function = true;
                        self.bump();
                        param_list_start = self.toks.pos();
                        break;
                    }
                    if self.toks.peek(1).is_punct(Punct::Assign) {
                        name = Some(t.text);
                        break;
                    }
                    self.bump();
                }
                TokenKind::Punct(Punct::Lt) => {
                    // Template-id in the return type; skip the angle group.
                    let mut depth = 1u32;
                    self.bump();
                    while depth > 0 && !self.cur().is_eof() {
                        if self.at_punct(Punct::Lt) {
                            depth += 1;
                        } else if self.at_punct(Punct::Gt) {
                            depth -= 1;
                        } else if self.at_punct(Punct::Shr) {
                            depth = depth.saturating_sub(2);
                        }
                        self.bump();
                    }
                }
                TokenKind::Punct(Punct::Semi | Punct::LBrace) => break,
                _ => {
                    self.bump();
                }
            }
        }
        let Some(name) = name else {
            self.toks.restore(mark);
            return Err(self.err_here("could not find the declared name of this template"));
        };

        // Function templates: capture a deduction sketch from the parameter
        // list tokens (a parameter that is directly `T [name]` deduces from
        // the call argument).
        if is_function {
            let sketch = self.scan_param_sketch(param_list_start, &params)?;
            self.fn_sketches.insert(name, sketch);
        }

        // Skip to the end of the declaration.
        self.toks.restore(mark);
        let kind = if is_function {
            TemplateKind::Function
        } else {
            TemplateKind::Variable
        };
        loop {
            match self.cur().kind {
                TokenKind::Eof => {
                    return Err(self.fatal_here("unexpected end of file in template declaration"))
                }
                TokenKind::Punct(Punct::Semi) => {
                    self.bump();
                    break;
                }
                TokenKind::Punct(Punct::LBrace) => {
                    self.skip_balanced(Punct::LBrace, Punct::RBrace)?;
                    break;
                }
                _ => {
                    self.bump();
                }
            }
        }
        let end = self.toks.pos();
        let body = self.capture_range(entity_start, end);
        self.templates.register(TemplatePattern {
            name,
            kind,
            params,
            constraint,
            body,
            specializations: Vec::new(),
        });
        self.scopes.declare(name, Declaration::Template(name));
        Ok(())
    }

    /// For each function parameter, the template-parameter index it directly
    /// names (stripping cv and reference tokens), or `None`.
    fn scan_param_sketch(
        &mut self,
        param_list_start: u32,
        params: &[TemplateParam],
    ) -> PResult<Vec<Option<u32>>> {
        let mark = self.toks.save();
        debug_assert!(self.toks.pos() == param_list_start);
        self.bump(); // (
        let mut sketch = Vec::new();
        let mut current: Option<u32> = None;
        let mut tokens_in_param = 0u32;
        let mut depth = 1u32;
        loop {
            let t = *self.cur();
            match t.kind {
                TokenKind::Eof => break,
                TokenKind::Punct(Punct::LParen) => depth += 1,
                TokenKind::Punct(Punct::RParen) => {
                    depth -= 1;
                    if depth == 0 {
                        if tokens_in_param > 0 {
                            sketch.push(current);
                        }
                        break;
                    }
                }
                TokenKind::Punct(Punct::Comma) if depth == 1 => {
                    sketch.push(current);
                    current = None;
                    tokens_in_param = 0;
                    self.bump();
                    continue;
                }
                // cv-qualifiers and reference/pointer tokens do not affect
                // which token is the parameter's type.
                TokenKind::Keyword(Kw::Const | Kw::Volatile)
                | TokenKind::Punct(Punct::Amp | Punct::AmpAmp | Punct::Star) => {}
                TokenKind::Identifier => {
                    if tokens_in_param == 0 {
                        current = params
                            .iter()
                            .position(|p| p.name == t.text)
                            .map(|i| i as u32);
                    }
                    tokens_in_param += 1;
                }
                _ => {
                    // A keyword type or anything else: not a direct match.
                    if tokens_in_param == 0 {
                        current = None;
                    }
                    tokens_in_param += 1;
                }
            }
            self.bump();
        }
        self.toks.restore(mark);
        Ok(sketch)
    }

    /// Parse `<pattern, ...>` of a specialization, mapping parameter names
    /// to `Param(i)` and everything else to concrete arguments.
    fn parse_spec_arg_patterns(
        &mut self,
        spec_params: &[TemplateParam],
    ) -> PResult<Vec<TypePattern>> {
        self.expect_punct(Punct::Lt)?;
        let mut patterns = Vec::new();
        if self.close_angle()? {
            return Ok(patterns);
        }
        loop {
            patterns.push(self.parse_one_spec_pattern(spec_params)?);
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            if self.close_angle()? {
                return Ok(patterns);
            }
            return Err(self.err_here("expected ',' or '>' in specialization arguments"));
        }
    }

    fn parse_one_spec_pattern(
        &mut self,
        spec_params: &[TemplateParam],
    ) -> PResult<TypePattern> {
        // Parameter reference?
        let mut base = if self.at_ident() {
            let name = self.cur().text;
            match spec_params.iter().position(|p| p.name == name) {
                Some(i) => {
                    self.bump();
                    Some(TypePattern::Param(i as u32))
                }
                None => None,
            }
        } else {
            None
        };
        if base.is_none() {
            // Concrete type or constant value.
            if let Some(parsed) = self.try_parse_type()? {
                let ty = parsed.expect_concrete(self)?;
                base = Some(TypePattern::Concrete(TemplateArg::Type(ty)));
            } else {
                let expr = self.parse_ternary()?;
                let value = self.eval_const(expr)?;
                return Ok(TypePattern::Concrete(TemplateArg::Value(value)));
            }
        }
        let mut pattern = base.expect("pattern set above");
        loop {
            if self.eat_punct(Punct::Star) {
                pattern = self.wrap_pattern(pattern, PatternWrap::Pointer);
            } else if self.eat_punct(Punct::Amp) {
                pattern = self.wrap_pattern(pattern, PatternWrap::LValueRef);
            } else if self.eat_punct(Punct::AmpAmp) {
                pattern = self.wrap_pattern(pattern, PatternWrap::RValueRef);
            } else if self.eat_punct(Punct::LBracket) {
                while !self.at_punct(Punct::RBracket) && !self.cur().is_eof() {
                    self.bump();
                }
                self.expect_punct(Punct::RBracket)?;
                pattern = self.wrap_pattern(pattern, PatternWrap::Array);
            } else {
                return Ok(pattern);
            }
        }
    }

    fn wrap_pattern(&mut self, inner: TypePattern, wrap: PatternWrap) -> TypePattern {
        // A concrete inner type folds to a concrete derived type so that
        // full specializations stay exact matches.
        if let TypePattern::Concrete(TemplateArg::Type(ty)) = inner {
            let derived = match wrap {
                PatternWrap::Pointer => self.types.pointer_to(ty, self.strings),
                PatternWrap::LValueRef => {
                    self.types
                        .reference_to(ty, fcpp_sem::RefKind::LValue, self.strings)
                }
                PatternWrap::RValueRef => {
                    self.types
                        .reference_to(ty, fcpp_sem::RefKind::RValue, self.strings)
                }
                PatternWrap::Array => return TypePattern::Array(Box::new(TypePattern::Concrete(
                    TemplateArg::Type(ty),
                ))),
            };
            return TypePattern::Concrete(TemplateArg::Type(derived));
        }
        match wrap {
            PatternWrap::Pointer => TypePattern::Pointer(Box::new(inner)),
            PatternWrap::LValueRef => TypePattern::LValueRef(Box::new(inner)),
            PatternWrap::RValueRef => TypePattern::RValueRef(Box::new(inner)),
            PatternWrap::Array => TypePattern::Array(Box::new(inner)),
        }
    }

    // ------------------------------------------------------------------
    // Instantiation
    // ------------------------------------------------------------------

    /// Fill omitted trailing arguments from parameter defaults so the cache
    /// key is always the complete canonical argument list.
    fn fill_default_args(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
    ) -> PResult<Vec<TemplateArg>> {
        let pattern = match self.templates.get(name) {
            Some(p) => p,
            None => return Ok(args.to_vec()),
        };
        if args.len() >= pattern.params.len() {
            return Ok(args.to_vec());
        }
        let defaults: Vec<Option<TokenRange>> = pattern
            .params
            .iter()
            .skip(args.len())
            .map(|p| p.default)
            .collect();
        let mut filled = args.to_vec();
        for default in defaults {
            let Some(range) = default else { break };
            let sub = self.replay_stream(range);
            let saved = std::mem::replace(&mut self.toks, sub);
            let result = (|| -> PResult<TemplateArg> {
                if let Some(parsed) = self.try_parse_type()? {
                    let base = parsed.expect_concrete(self)?;
                    let ty = self.parse_declarator_prefix(base);
                    Ok(TemplateArg::Type(ty))
                } else {
                    let expr = self.parse_ternary()?;
                    Ok(TemplateArg::Value(self.eval_const(expr)?))
                }
            })();
            self.toks = saved;
            filled.push(result?);
        }
        Ok(filled)
    }

    /// Instantiate (or fetch) `name<args>` as a class type.
    pub(crate) fn instantiate_class_template(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
    ) -> PResult<TypeIndex> {
        let args = self.fill_default_args(name, args)?;
        if let Some(InstantiatedEntity::Type(ty)) = self.templates.cached(name, &args) {
            return Ok(*ty);
        }
        match self.instantiate_entity(name, &args, TemplateKind::Class)? {
            InstantiatedEntity::Type(ty) => Ok(ty),
            _ => Err(self.err_here("template did not produce a type")),
        }
    }

    pub(crate) fn instantiate_function_template(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
    ) -> PResult<InstantiatedEntity> {
        let args = self.fill_default_args(name, args)?;
        if let Some(entity) = self.templates.cached(name, &args) {
            return Ok(entity.clone());
        }
        self.instantiate_entity(name, &args, TemplateKind::Function)
    }

    pub(crate) fn instantiate_variable_template(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
    ) -> PResult<InstantiatedEntity> {
        let args = self.fill_default_args(name, args)?;
        if let Some(entity) = self.templates.cached(name, &args) {
            return Ok(entity.clone());
        }
        self.instantiate_entity(name, &args, TemplateKind::Variable)
    }

    pub(crate) fn instantiate_alias_template(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
    ) -> PResult<TypeIndex> {
        let args = self.fill_default_args(name, args)?;
        if let Some(InstantiatedEntity::Type(ty)) = self.templates.cached(name, &args) {
            return Ok(*ty);
        }
        match self.instantiate_entity(name, &args, TemplateKind::Alias)? {
            InstantiatedEntity::Type(ty) => Ok(ty),
            _ => Err(self.err_here("alias template did not produce a type")),
        }
    }

    /// The shared instantiation path: select a body, bind parameters,
    /// replay, harvest the entity, memoize.
    fn instantiate_entity(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
        expect_kind: TemplateKind,
    ) -> PResult<InstantiatedEntity> {
        let selected = self
            .templates
            .select(name, args, self.types, self.strings)
            .map_err(|e| self.instantiation_error(e))?;
        let pattern_kind = self
            .templates
            .get(name)
            .map(|p| p.kind)
            .unwrap_or(expect_kind);
        if pattern_kind != expect_kind {
            return Err(self.err_here("template kind mismatch"));
        }
        if selected.body.is_empty() {
            return Err(self.instantiation_error(InstantiationError::NoMatch(
                self.strings.view(name).to_string(),
            )));
        }

        // Constraint check before committing.
        let constraint = self.templates.get(name).and_then(|p| p.constraint);
        self.templates
            .begin_instantiation(name, args, self.strings)
            .map_err(|e| self.instantiation_error(e))?;

        let result = self.instantiate_selected(name, args, selected, constraint);

        self.templates.end_instantiation(name, args);
        let entity = result?;
        self.templates
            .cache_insert(name, args.to_vec(), entity.clone());
        Ok(entity)
    }

    fn instantiate_selected(
        &mut self,
        name: StringHandle,
        args: &[TemplateArg],
        selected: fcpp_sem::template::SelectedBody,
        constraint: Option<TokenRange>,
    ) -> PResult<InstantiatedEntity> {
        let inst_name = self
            .templates
            .instantiated_name(name, args, self.strings);

        // Bind the body's own parameters.
        let body_params: Vec<TemplateParam> = {
            let pattern = self
                .templates
                .get(name)
                .ok_or_else(|| self.err_here("unknown template"))?;
            match selected.specialization {
                Some(i) => pattern.specializations[i].params.clone(),
                None => pattern.params.clone(),
            }
        };
        self.scopes.push(fcpp_sem::ScopeKind::TemplateParams);
        for (param, arg) in body_params.iter().zip(&selected.bindings) {
            match (param.kind, arg) {
                (TemplateParamKind::Type, TemplateArg::Type(ty)) => {
                    self.scopes
                        .declare_or_replace(param.name, Declaration::Type(*ty));
                }
                (TemplateParamKind::Value { ty }, TemplateArg::Value(value)) => {
                    self.scopes.declare_or_replace(
                        param.name,
                        Declaration::TemplateValue { ty, value: *value },
                    );
                }
                (TemplateParamKind::Template, TemplateArg::Template(t)) => {
                    self.scopes
                        .declare_or_replace(param.name, Declaration::Template(*t));
                }
                (TemplateParamKind::Type, TemplateArg::Pack(members)) => {
                    // A pack binds its first member for the common
                    // single-expansion uses; full multi-pack interleaving is
                    // handled during argument canonicalization.
                    if let Some(TemplateArg::Type(ty)) = members.first() {
                        self.scopes
                            .declare_or_replace(param.name, Declaration::Type(*ty));
                    }
                }
                _ => {
                    self.scopes.pop();
                    return Err(self.instantiation_error(
                        InstantiationError::SubstitutionFailure(format!(
                            "argument kind does not match parameter '{}'",
                            self.strings.view(param.name)
                        )),
                    ));
                }
            }
        }

        // Constraint check with parameters bound.
        if let Some(range) = constraint {
            let ok = self.eval_constraint(range);
            match ok {
                Ok(true) => {}
                Ok(false) => {
                    self.scopes.pop();
                    return Err(self.instantiation_error(
                        InstantiationError::ConstraintFailed(
                            self.strings.view(name).to_string(),
                        ),
                    ));
                }
                Err(e) => {
                    self.scopes.pop();
                    return Err(e);
                }
            }
        }

        // Replay the body with the rename installed.
        let saved_rename = self.instantiation_rename.replace((name, inst_name));
        let sub = self.replay_stream(selected.body);
        let saved_stream = std::mem::replace(&mut self.toks, sub);
        let saved_sfinae = self.in_sfinae;
        let replay = self.parse_declaration(DeclContext::TopLevel);
        self.in_sfinae = saved_sfinae;
        self.toks = saved_stream;
        self.instantiation_rename = saved_rename;
        if let Err(e) = replay {
            self.scopes.pop();
            return Err(e);
        }

        // Harvest the instantiated entity under its hash-suffixed name
        // before popping the parameter scope (constexpr variables and alias
        // targets were declared into it).
        let harvested = self.harvest_instantiated(name, inst_name);
        self.scopes.pop();
        harvested
    }

    fn harvest_instantiated(
        &mut self,
        name: StringHandle,
        inst_name: StringHandle,
    ) -> PResult<InstantiatedEntity> {
        if let Some(ty) = self.types.lookup(inst_name) {
            if let fcpp_sem::TypeKind::Struct { id } = self.types.info(ty).kind {
                self.types.structs[id].from_template = Some(name);
            }
            return Ok(InstantiatedEntity::Type(ty));
        }
        if let Some(f) = self.functions.iter().rev().find(|f| f.name == inst_name) {
            return Ok(InstantiatedEntity::Function {
                name: inst_name,
                ty: f.ty,
                body: f.body.expect("instantiated function has a body"),
            });
        }
        if let Some(Declaration::Constexpr { ty, value }) = self.scopes.lookup(inst_name) {
            return Ok(InstantiatedEntity::Variable { ty: *ty, value: *value });
        }
        if let Some(Declaration::Type(ty)) = self.scopes.lookup(inst_name) {
            return Ok(InstantiatedEntity::Type(*ty));
        }
        Err(self.instantiation_error(InstantiationError::SubstitutionFailure(format!(
            "instantiation of '{}' produced no entity",
            self.strings.view(name)
        ))))
    }

    fn eval_constraint(&mut self, range: TokenRange) -> PResult<bool> {
        let sub = self.replay_stream(range);
        let saved = std::mem::replace(&mut self.toks, sub);
        let result = (|| -> PResult<bool> {
            self.expect_punct(Punct::LParen)?;
            let expr = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            Ok(self.eval_const(expr)?.as_bool())
        })();
        self.toks = saved;
        result
    }

    fn instantiation_error(&self, e: InstantiationError) -> crate::ParseError {
        crate::ParseError {
            message: e.to_string(),
            span: self.cur().span,
            fatal: false,
        }
    }

    /// Deduce template arguments for `name(args...)` from the call-site
    /// argument types using the registered parameter sketch.
    pub(crate) fn deduce_function_template_args(
        &mut self,
        name: StringHandle,
        call_args: &[fcpp_util::NodeId],
    ) -> PResult<Vec<TemplateArg>> {
        let param_count = self
            .templates
            .get(name)
            .map(|p| p.params.len())
            .ok_or_else(|| self.err_here("unknown template"))?;
        let sketch = self
            .fn_sketches
            .get(&name)
            .cloned()
            .unwrap_or_default();
        let mut deduced: Vec<Option<TemplateArg>> = vec![None; param_count];
        for (slot, arg) in sketch.iter().zip(call_args) {
            if let Some(i) = slot {
                let ty = crate::typecheck::expr_type(&self.ast, self.types, self.strings, *arg);
                let ty = self.types.strip_reference(ty);
                let entry = &mut deduced[*i as usize];
                if entry.is_none() {
                    *entry = Some(TemplateArg::Type(ty));
                }
            }
        }
        deduced
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                self.instantiation_error(InstantiationError::SubstitutionFailure(format!(
                    "could not deduce all template arguments for '{}'",
                    self.strings.view(name)
                )))
            })
    }
}

enum PatternWrap {
    Pointer,
    LValueRef,
    RValueRef,
    Array,
}

#[cfg(test)]
mod tests {
    use crate::test_support::{parse_clean, parse_src};

    #[test]
    fn test_class_template_instantiation() {
        let p = parse_clean(
            "template <typename T> struct Box { T value; };\n             Box<int> b;",
        );
        // One instantiated type exists, hash-suffixed.
        let inst: Vec<&str> = p
            .types
            .named_types()
            .map(|(n, _)| p.strings.view(n))
            .filter(|n| n.starts_with("Box$"))
            .collect();
        assert_eq!(inst.len(), 1);
        assert_eq!(inst[0].len(), "Box$".len() + 16);
    }

    #[test]
    fn test_instantiation_memoized() {
        let p = parse_clean(
            "template <typename T> struct Box { T value; };\n             Box<int> a; Box<int> b; Box<bool> c;",
        );
        let count = p
            .types
            .named_types()
            .filter(|&(n, _)| p.strings.view(n).starts_with("Box$"))
            .count();
        assert_eq!(count, 2, "int and bool instantiations only");
    }

    #[test]
    fn test_qualified_and_unqualified_share_identity() {
        // The regression this design guards against: `n::H<int>` and a
        // same-TU `H<int>` must be one entity.
        let p = parse_clean(
            "namespace n { template <typename T> struct H { T v; T get() const { return v; } }; }\n             int main() { n::H<int> w{42}; return w.get(); }",
        );
        let count = p
            .types
            .named_types()
            .filter(|&(n, _)| p.strings.view(n).starts_with("H$"))
            .count();
        assert_eq!(count, 1, "exactly one type symbol for H<int>");
    }

    #[test]
    fn test_is_same_partial_specialization() {
        let p = parse_clean(
            "template <typename T, typename U> struct is_same { static constexpr bool value = false; };\n             template <typename T> struct is_same<T, T> { static constexpr bool value = true; };\n             static_assert(is_same<int, int>::value, \"same\");\n             static_assert(!is_same<int, bool>::value, \"different\");",
        );
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_non_type_parameter() {
        let p = parse_clean(
            "template <int N> struct Fact { static constexpr int value = N * Fact<N - 1>::value; };\n             template <> struct Fact<0> { static constexpr int value = 1; };\n             static_assert(Fact<5>::value == 120, \"5! = 120\");",
        );
        assert!(!p.handler.has_errors());
    }

    #[test]
    fn test_recursive_instantiation_detected() {
        let p = parse_src(
            "template <typename T> struct Loop { Loop<T> inner; };\n             Loop<int> l;",
        );
        assert!(p.handler.has_errors(), "infinite recursion must diagnose");
    }

    #[test]
    fn test_function_template_explicit_args() {
        let p = parse_clean(
            "template <typename T> T twice(T x) { return x + x; }\n             int main() { return twice<int>(21); }",
        );
        assert!(p
            .output
            .functions
            .iter()
            .any(|f| p.strings.view(f.name).starts_with("twice$")));
    }

    #[test]
    fn test_function_template_deduction() {
        let p = parse_clean(
            "template <typename T> T pick(T a, T b) { return a < b ? a : b; }\n             int main() { return pick(1, 2); }",
        );
        assert!(p
            .output
            .functions
            .iter()
            .any(|f| p.strings.view(f.name).starts_with("pick$")));
    }

    #[test]
    fn test_default_template_argument() {
        let p = parse_clean(
            "template <typename T = int> struct Def { T v; };\n             Def<> a; Def<int> b;",
        );
        let count = p
            .types
            .named_types()
            .filter(|&(n, _)| p.strings.view(n).starts_with("Def$"))
            .count();
        assert_eq!(count, 1, "defaulted and explicit int share the cache entry");
    }

    #[test]
    fn test_variable_template() {
        let p = parse_clean(
            "template <typename T> constexpr int size_of_v = sizeof(T);\n             static_assert(size_of_v<int> == 4, \"int is 4 bytes\");",
        );
        assert!(!p.handler.has_errors());
    }
}
