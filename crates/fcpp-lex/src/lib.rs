//! fcpp-lex - C++ tokenizer.
//!
//! Turns source bytes into a stream of `(TokenKind, StringHandle, Span)`
//! triples. The preprocessor is an external collaborator, so the input here
//! is already a flat character stream; there is no `#include` handling and
//! `#` never reaches the scanner in well-formed input.
//!
//! The parser drives the token stream through [`TokenStream`], which supports
//! unbounded lookahead and O(1) save/restore of the cursor. The lexer itself
//! produces tokens lazily one at a time via [`Lexer::next_token`]; the stream
//! buffers them so a restore is a cursor assignment rather than a re-scan.
//!
//! Alternative operator spellings (`and`, `or`, `not_eq`, ...) are normalized
//! to their canonical punctuator identity during identifier scanning, so the
//! parser only ever sees one spelling.

pub mod cursor;
mod lexer;
mod literal;
mod stream;
pub mod token;

pub use cursor::Cursor;
pub use lexer::{LexError, LexErrorKind, Lexer};
pub use literal::{
    char_literal_value, float_literal_value, int_literal_value, FloatSuffix, IntSuffix, LiteralError,
    ParsedFloat, ParsedInt,
};
pub use stream::{Mark, TokenStream};
pub use token::{Kw, Punct, Token, TokenKind};
