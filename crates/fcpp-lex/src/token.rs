//! Token identity model.
//!
//! A [`TokenKind`] is a compact tagged identity: a category plus, for
//! keywords and punctuators, the specific member. Alternative operator
//! spellings map to the same identity as their canonical punctuator, so the
//! parser compares kinds and never looks at spelling.

use fcpp_util::{Span, StringHandle};

/// The category + identity of a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// A non-keyword identifier.
    Identifier,
    /// A reserved word.
    Keyword(Kw),
    /// An operator or punctuator.
    Punct(Punct),
    /// Integer literal (value parsed on demand from the token text).
    IntLit,
    /// Floating-point literal.
    FloatLit,
    /// String literal; the token text is the cooked (unescaped) contents.
    StringLit,
    /// Character literal; the token text is the cooked contents.
    CharLit,
    /// End-of-input sentinel, always the final token of a stream.
    Eof,
}

/// C++ keywords recognized by the scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kw {
    Alignas,
    Alignof,
    Auto,
    Bool,
    Break,
    Case,
    Catch,
    Char,
    Char8T,
    Char16T,
    Char32T,
    Class,
    Concept,
    Const,
    Consteval,
    Constexpr,
    Constinit,
    ConstCast,
    Continue,
    Decltype,
    Default,
    Delete,
    Do,
    Double,
    DynamicCast,
    Else,
    Enum,
    Explicit,
    Extern,
    False,
    Float,
    For,
    Friend,
    Goto,
    If,
    Inline,
    Int,
    Long,
    Mutable,
    Namespace,
    New,
    Noexcept,
    Nullptr,
    Operator,
    Private,
    Protected,
    Public,
    ReinterpretCast,
    Requires,
    Return,
    Short,
    Signed,
    Sizeof,
    Static,
    StaticAssert,
    StaticCast,
    Struct,
    Switch,
    Template,
    This,
    ThreadLocal,
    Throw,
    True,
    Try,
    Typedef,
    Typeid,
    Typename,
    Union,
    Unsigned,
    Using,
    Virtual,
    Void,
    Volatile,
    WcharT,
    While,
}

/// Operators and punctuators, one entry per canonical identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Punct {
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Dot,
    DotStar,
    Arrow,
    ArrowStar,
    Ellipsis,
    ColonColon,
    Colon,
    Question,
    Plus,
    PlusPlus,
    PlusEq,
    Minus,
    MinusMinus,
    MinusEq,
    Star,
    StarEq,
    Slash,
    SlashEq,
    Percent,
    PercentEq,
    Amp,
    AmpAmp,
    AmpEq,
    Pipe,
    PipePipe,
    PipeEq,
    Caret,
    CaretEq,
    Tilde,
    Bang,
    BangEq,
    Assign,
    EqEq,
    Lt,
    LtEq,
    Shl,
    ShlEq,
    Gt,
    GtEq,
    Shr,
    ShrEq,
    Spaceship,
}

/// A lexed token: identity, interned text, source span.
#[derive(Clone, Copy, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub text: StringHandle,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, text: StringHandle, span: Span) -> Self {
        Self { kind, text, span }
    }

    /// True for the end-of-input sentinel.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    /// True if this token is the given punctuator.
    #[inline]
    pub fn is_punct(&self, p: Punct) -> bool {
        self.kind == TokenKind::Punct(p)
    }

    /// True if this token is the given keyword.
    #[inline]
    pub fn is_kw(&self, kw: Kw) -> bool {
        self.kind == TokenKind::Keyword(kw)
    }
}

/// Map an identifier spelling to its keyword or alternative-operator
/// identity. Returns `None` for ordinary identifiers.
pub fn keyword_or_alt(spelling: &str) -> Option<TokenKind> {
    use Kw::*;
    use Punct::*;
    let kind = match spelling {
        "alignas" => TokenKind::Keyword(Alignas),
        "alignof" => TokenKind::Keyword(Alignof),
        "auto" => TokenKind::Keyword(Auto),
        "bool" => TokenKind::Keyword(Bool),
        "break" => TokenKind::Keyword(Break),
        "case" => TokenKind::Keyword(Case),
        "catch" => TokenKind::Keyword(Catch),
        "char" => TokenKind::Keyword(Char),
        "char8_t" => TokenKind::Keyword(Char8T),
        "char16_t" => TokenKind::Keyword(Char16T),
        "char32_t" => TokenKind::Keyword(Char32T),
        "class" => TokenKind::Keyword(Class),
        "concept" => TokenKind::Keyword(Concept),
        "const" => TokenKind::Keyword(Const),
        "consteval" => TokenKind::Keyword(Consteval),
        "constexpr" => TokenKind::Keyword(Constexpr),
        "constinit" => TokenKind::Keyword(Constinit),
        "const_cast" => TokenKind::Keyword(ConstCast),
        "continue" => TokenKind::Keyword(Continue),
        "decltype" => TokenKind::Keyword(Decltype),
        "default" => TokenKind::Keyword(Default),
        "delete" => TokenKind::Keyword(Delete),
        "do" => TokenKind::Keyword(Do),
        "double" => TokenKind::Keyword(Double),
        "dynamic_cast" => TokenKind::Keyword(DynamicCast),
        "else" => TokenKind::Keyword(Else),
        "enum" => TokenKind::Keyword(Enum),
        "explicit" => TokenKind::Keyword(Explicit),
        "extern" => TokenKind::Keyword(Extern),
        "false" => TokenKind::Keyword(False),
        "float" => TokenKind::Keyword(Float),
        "for" => TokenKind::Keyword(For),
        "friend" => TokenKind::Keyword(Friend),
        "goto" => TokenKind::Keyword(Goto),
        "if" => TokenKind::Keyword(If),
        "inline" => TokenKind::Keyword(Inline),
        "int" => TokenKind::Keyword(Int),
        "long" => TokenKind::Keyword(Long),
        "mutable" => TokenKind::Keyword(Mutable),
        "namespace" => TokenKind::Keyword(Namespace),
        "new" => TokenKind::Keyword(New),
        "noexcept" => TokenKind::Keyword(Noexcept),
        "nullptr" => TokenKind::Keyword(Nullptr),
        "operator" => TokenKind::Keyword(Operator),
        "private" => TokenKind::Keyword(Private),
        "protected" => TokenKind::Keyword(Protected),
        "public" => TokenKind::Keyword(Public),
        "reinterpret_cast" => TokenKind::Keyword(ReinterpretCast),
        "requires" => TokenKind::Keyword(Requires),
        "return" => TokenKind::Keyword(Return),
        "short" => TokenKind::Keyword(Short),
        "signed" => TokenKind::Keyword(Signed),
        "sizeof" => TokenKind::Keyword(Sizeof),
        "static" => TokenKind::Keyword(Static),
        "static_assert" => TokenKind::Keyword(StaticAssert),
        "static_cast" => TokenKind::Keyword(StaticCast),
        "struct" => TokenKind::Keyword(Struct),
        "switch" => TokenKind::Keyword(Switch),
        "template" => TokenKind::Keyword(Template),
        "this" => TokenKind::Keyword(This),
        "thread_local" => TokenKind::Keyword(ThreadLocal),
        "throw" => TokenKind::Keyword(Throw),
        "true" => TokenKind::Keyword(True),
        "try" => TokenKind::Keyword(Try),
        "typedef" => TokenKind::Keyword(Typedef),
        "typeid" => TokenKind::Keyword(Typeid),
        "typename" => TokenKind::Keyword(Typename),
        "union" => TokenKind::Keyword(Union),
        "unsigned" => TokenKind::Keyword(Unsigned),
        "using" => TokenKind::Keyword(Using),
        "virtual" => TokenKind::Keyword(Virtual),
        "void" => TokenKind::Keyword(Void),
        "volatile" => TokenKind::Keyword(Volatile),
        "wchar_t" => TokenKind::Keyword(WcharT),
        "while" => TokenKind::Keyword(While),
        // Alternative operator spellings normalize to the canonical identity.
        "and" => TokenKind::Punct(AmpAmp),
        "and_eq" => TokenKind::Punct(AmpEq),
        "bitand" => TokenKind::Punct(Amp),
        "bitor" => TokenKind::Punct(Pipe),
        "compl" => TokenKind::Punct(Tilde),
        "not" => TokenKind::Punct(Bang),
        "not_eq" => TokenKind::Punct(BangEq),
        "or" => TokenKind::Punct(PipePipe),
        "or_eq" => TokenKind::Punct(PipeEq),
        "xor" => TokenKind::Punct(Caret),
        "xor_eq" => TokenKind::Punct(CaretEq),
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_lookup() {
        assert_eq!(keyword_or_alt("int"), Some(TokenKind::Keyword(Kw::Int)));
        assert_eq!(
            keyword_or_alt("constexpr"),
            Some(TokenKind::Keyword(Kw::Constexpr))
        );
        assert_eq!(keyword_or_alt("main"), None);
    }

    #[test]
    fn test_alternative_spellings_normalize() {
        assert_eq!(keyword_or_alt("and"), Some(TokenKind::Punct(Punct::AmpAmp)));
        assert_eq!(keyword_or_alt("or"), Some(TokenKind::Punct(Punct::PipePipe)));
        assert_eq!(keyword_or_alt("not_eq"), Some(TokenKind::Punct(Punct::BangEq)));
        assert_eq!(keyword_or_alt("compl"), Some(TokenKind::Punct(Punct::Tilde)));
    }

    #[test]
    fn test_identifier_with_keyword_prefix() {
        assert_eq!(keyword_or_alt("interface"), None);
        assert_eq!(keyword_or_alt("classy"), None);
    }
}
