//! fcpp-par - Recursive-descent C++ parser.
//!
//! The parser drives the replayable token stream with unbounded lookahead,
//! owns the scope stack, and writes into the three per-TU registries (types,
//! templates, strings). It produces an [`ast::ParseOutput`]: the node arena
//! plus flat lists of functions and globals ready for IR lowering.
//!
//! Error discipline follows three tiers: fatal errors abort the unit
//! (`ParseError { fatal: true }`), recoverable errors are reported to the
//! diagnostic handler and the parser resynchronizes at the next `;` or
//! balanced `}`, and template substitution failures inside a SFINAE context
//! are silently consumed by the caller that tried the candidate.

pub mod ast;
pub mod consteval;
mod decl;
mod expr;
mod stmt;
mod template;
pub mod typecheck;
mod types;

pub use ast::{Ast, FunctionDef, GlobalDef, ParseOutput};
pub use consteval::ConstExprEvaluator;

use fcpp_lex::{Kw, Punct, Token, TokenKind, TokenStream};
use fcpp_sem::{ScopeKind, ScopeStack, TemplateRegistry, TypeIndex, TypeRegistry};
use fcpp_util::diagnostic::Handler;
use fcpp_util::{FxHashMap, IndexVec, LocalId, Span, StringHandle, StringTable};

use ast::{LocalDef, ParamDef};

/// A parse failure.
#[derive(Clone, Debug)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
    /// Fatal errors abort the translation unit; recoverable ones are
    /// reported and parsing resynchronizes.
    pub fatal: bool,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

pub(crate) type PResult<T> = Result<T, ParseError>;

/// Where a declaration appears; steers ambiguity resolution and which
/// forms are admissible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclContext {
    TopLevel,
    BlockScope,
    ClassMember,
    ForInit,
    LambdaCapture,
}

/// State of the function currently being parsed.
pub(crate) struct FnCtx {
    pub locals: IndexVec<LocalId, LocalDef>,
    pub params: Vec<ParamDef>,
    pub return_ty: TypeIndex,
    pub method_of: Option<TypeIndex>,
}

impl FnCtx {
    pub fn alloc_local(&mut self, name: StringHandle, ty: TypeIndex) -> LocalId {
        self.locals.push(LocalDef { name, ty })
    }
}

/// The C++ parser for one translation unit.
pub struct Parser<'ctx> {
    pub(crate) toks: TokenStream,
    pub(crate) strings: &'ctx mut StringTable,
    pub(crate) types: &'ctx mut TypeRegistry,
    pub(crate) templates: &'ctx mut TemplateRegistry,
    pub(crate) handler: &'ctx Handler,
    pub(crate) scopes: ScopeStack,
    pub(crate) ast: Ast,
    pub(crate) functions: Vec<FunctionDef>,
    pub(crate) globals: Vec<GlobalDef>,
    pub(crate) fn_ctx: Option<FnCtx>,
    /// Nesting depth of template argument lists being parsed.
    pub(crate) template_arg_depth: u32,
    /// While instantiating, the pattern's own name maps to the hash-suffixed
    /// instantiation name.
    pub(crate) instantiation_rename: Option<(StringHandle, StringHandle)>,
    /// While instantiating a class template, the instantiated type (so the
    /// pattern name used inside its own body resolves to it).
    pub(crate) self_type: Option<TypeIndex>,
    /// Inside template substitution for candidate selection: failures prune
    /// the candidate instead of diagnosing.
    pub(crate) in_sfinae: bool,
    /// Parameter sketches of registered function templates, for simple
    /// call-site deduction: per parameter, the template-parameter index it
    /// directly names (if any).
    pub(crate) fn_sketches: FxHashMap<StringHandle, Vec<Option<u32>>>,
    pub(crate) lambda_counter: u32,
    /// Inside `extern "C"` blocks.
    pub(crate) extern_c_depth: u32,
    /// Namespaces pulled in with `using namespace`; consulted as a lookup
    /// fallback for unqualified names.
    pub(crate) using_namespaces: Vec<StringHandle>,
    /// Arena of captured token ranges (template bodies, default arguments,
    /// constraints). Replay always slices from here, so captures made while
    /// a replay stream is active stay consistent.
    pub(crate) captured: Vec<Token>,
    /// Interned empty string, used for synthesized EOF sentinels.
    pub(crate) empty_handle: StringHandle,
}

impl<'ctx> Parser<'ctx> {
    pub fn new(
        tokens: Vec<Token>,
        strings: &'ctx mut StringTable,
        types: &'ctx mut TypeRegistry,
        templates: &'ctx mut TemplateRegistry,
        handler: &'ctx Handler,
    ) -> Self {
        let empty_handle = strings.intern("");
        Self {
            toks: TokenStream::new(tokens),
            strings,
            types,
            templates,
            handler,
            scopes: ScopeStack::new(),
            ast: Ast::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            fn_ctx: None,
            template_arg_depth: 0,
            instantiation_rename: None,
            self_type: None,
            in_sfinae: false,
            fn_sketches: FxHashMap::default(),
            lambda_counter: 0,
            extern_c_depth: 0,
            using_namespaces: Vec::new(),
            captured: Vec::new(),
            empty_handle,
        }
    }

    /// Copy a token range of the *current* stream into the capture arena,
    /// returning a range that [`Parser::replay_stream`] understands.
    pub(crate) fn capture_range(&mut self, start: u32, end: u32) -> fcpp_sem::TokenRange {
        let offset = self.captured.len() as u32;
        self.captured
            .extend_from_slice(self.toks.tokens(start, end));
        fcpp_sem::TokenRange::new(offset, offset + (end - start))
    }

    /// Build a replayable stream over a captured range.
    pub(crate) fn replay_stream(&self, range: fcpp_sem::TokenRange) -> TokenStream {
        let mut tokens: Vec<Token> =
            self.captured[range.start as usize..range.end as usize].to_vec();
        let eof_span = tokens.last().map(|t| t.span).unwrap_or(Span::DUMMY);
        tokens.push(Token::new(TokenKind::Eof, self.empty_handle, eof_span));
        TokenStream::new(tokens)
    }

    /// Parse the whole translation unit.
    ///
    /// Recoverable errors accumulate in the handler; the first fatal error
    /// aborts. The caller decides the exit code from `handler.has_errors()`.
    pub fn parse(mut self) -> Result<ParseOutput, ParseError> {
        while !self.toks.current().is_eof() {
            match self.parse_declaration(DeclContext::TopLevel) {
                Ok(_) => {}
                Err(e) if e.fatal => return Err(e),
                Err(e) => {
                    self.handler.error(e.message.clone(), e.span);
                    self.synchronize();
                }
            }
        }
        Ok(ParseOutput {
            ast: self.ast,
            functions: self.functions,
            globals: self.globals,
        })
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn cur(&self) -> &Token {
        self.toks.current()
    }

    #[inline]
    pub(crate) fn at_punct(&self, p: Punct) -> bool {
        self.cur().is_punct(p)
    }

    #[inline]
    pub(crate) fn at_kw(&self, kw: Kw) -> bool {
        self.cur().is_kw(kw)
    }

    #[inline]
    pub(crate) fn at_ident(&self) -> bool {
        self.cur().kind == TokenKind::Identifier
    }

    #[inline]
    pub(crate) fn bump(&mut self) -> Token {
        self.toks.advance()
    }

    pub(crate) fn eat_punct(&mut self, p: Punct) -> bool {
        if self.at_punct(p) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub(crate) fn eat_kw(&mut self, kw: Kw) -> bool {
        if self.at_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_punct(&mut self, p: Punct) -> PResult<Token> {
        if self.at_punct(p) {
            Ok(self.bump())
        } else {
            Err(self.err_here(format!(
                "expected {:?}, found '{}'",
                p,
                self.cur_text()
            )))
        }
    }

    pub(crate) fn expect_ident(&mut self) -> PResult<StringHandle> {
        if self.at_ident() {
            Ok(self.bump().text)
        } else {
            Err(self.err_here(format!("expected identifier, found '{}'", self.cur_text())))
        }
    }

    pub(crate) fn cur_text(&self) -> &str {
        self.strings.view(self.cur().text)
    }

    pub(crate) fn err_here(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            span: self.cur().span,
            fatal: false,
        }
    }

    pub(crate) fn fatal_here(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            span: self.cur().span,
            fatal: true,
        }
    }

    /// Skip tokens until a likely declaration boundary: a `;` at the current
    /// brace depth, or the `}` closing an opened brace.
    pub(crate) fn synchronize(&mut self) {
        let mut depth = 0u32;
        loop {
            let t = *self.cur();
            if t.is_eof() {
                return;
            }
            if t.is_punct(Punct::LBrace) {
                depth += 1;
            } else if t.is_punct(Punct::RBrace) {
                self.bump();
                if depth == 0 {
                    return;
                }
                depth -= 1;
                continue;
            } else if t.is_punct(Punct::Semi) && depth == 0 {
                self.bump();
                return;
            }
            self.bump();
        }
    }

    /// Skip a balanced token group starting at the current open delimiter,
    /// returning the token range covered (inclusive of the delimiters).
    pub(crate) fn skip_balanced(&mut self, open: Punct, close: Punct) -> PResult<(u32, u32)> {
        let start = self.toks.pos();
        self.expect_punct(open)?;
        let mut depth = 1u32;
        while depth > 0 {
            let t = *self.cur();
            if t.is_eof() {
                return Err(self.fatal_here("unexpected end of file in balanced group"));
            }
            if t.is_punct(open) {
                depth += 1;
            } else if t.is_punct(close) {
                depth -= 1;
            }
            self.bump();
        }
        Ok((start, self.toks.pos()))
    }

    /// Current function context; fatal internal error if absent.
    pub(crate) fn fn_ctx(&mut self) -> &mut FnCtx {
        self.fn_ctx
            .as_mut()
            .expect("statement parsed outside of a function body")
    }

    /// Run `body` inside a fresh scope of `kind`.
    pub(crate) fn in_scope<T>(
        &mut self,
        kind: ScopeKind,
        body: impl FnOnce(&mut Self) -> PResult<T>,
    ) -> PResult<T> {
        self.scopes.push(kind);
        let result = body(self);
        self.scopes.pop();
        result
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared scaffolding for parser tests: lex + parse a source snippet
    //! with fresh registries.

    use super::*;

    pub struct Parsed {
        pub output: ParseOutput,
        pub strings: StringTable,
        pub types: TypeRegistry,
        pub templates: TemplateRegistry,
        pub handler: Handler,
    }

    pub fn parse_src(src: &str) -> Parsed {
        let mut strings = StringTable::new();
        let mut types = TypeRegistry::new(&mut strings);
        let mut templates = TemplateRegistry::new();
        let handler = Handler::new();
        let tokens =
            fcpp_lex::Lexer::tokenize(src, fcpp_util::FileId::DUMMY, &mut strings).expect("lex");
        let parser = Parser::new(tokens, &mut strings, &mut types, &mut templates, &handler);
        let output = parser.parse().expect("parse");
        Parsed {
            output,
            strings,
            types,
            templates,
            handler,
        }
    }

    /// Parse and assert no diagnostics of any kind were produced.
    pub fn parse_clean(src: &str) -> Parsed {
        let parsed = parse_src(src);
        assert!(
            !parsed.handler.has_errors(),
            "unexpected errors: {:?}",
            parsed.handler.take()
        );
        parsed
    }
}
