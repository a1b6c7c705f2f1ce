//! The scanner.
//!
//! [`Lexer::next_token`] always produces a token — [`TokenKind::Eof`] at end
//! of input — or a fatal [`LexError`] for an ill-formed literal or stray
//! character. Scanning of numbers, strings and operators lives in the sibling
//! files of this module.

mod number;
mod operator;
mod string;

use fcpp_util::{FileId, Span, StringHandle, StringTable};
use thiserror::Error;

use crate::cursor::Cursor;
use crate::token::{keyword_or_alt, Token, TokenKind};

/// What went wrong during scanning.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LexErrorKind {
    #[error("invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated character literal")]
    UnterminatedChar,
    #[error("unterminated block comment")]
    UnterminatedBlockComment,
    #[error("malformed numeric literal")]
    InvalidNumber,
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
}

/// A fatal scan failure with its location.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("{kind}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub span: Span,
}

/// The C++ scanner.
pub struct Lexer<'a> {
    pub(crate) cursor: Cursor<'a>,
    pub(crate) file: FileId,
}

/// Position bookkeeping for the token being scanned.
pub(crate) struct TokenStart {
    pub pos: usize,
    pub line: u32,
    pub column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: FileId) -> Self {
        Self {
            cursor: Cursor::new(source),
            file,
        }
    }

    /// Scan the entire input into a token vector ending with the EOF
    /// sentinel. Lex errors are fatal: the first one aborts the unit.
    pub fn tokenize(
        source: &'a str,
        file: FileId,
        strings: &mut StringTable,
    ) -> Result<Vec<Token>, LexError> {
        let mut lexer = Self::new(source, file);
        let mut tokens = Vec::with_capacity(source.len() / 4);
        loop {
            let token = lexer.next_token(strings)?;
            let done = token.is_eof();
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    /// Produce the next token.
    pub fn next_token(&mut self, strings: &mut StringTable) -> Result<Token, LexError> {
        self.skip_trivia()?;
        let start = self.mark_start();
        let c = self.cursor.current();

        if self.cursor.is_eof() {
            let text = strings.intern("");
            return Ok(Token::new(TokenKind::Eof, text, self.span(&start)));
        }
        if is_ident_start(c) {
            return Ok(self.scan_identifier(start, strings));
        }
        if c.is_ascii_digit() || (c == '.' && self.cursor.peek(1).is_ascii_digit()) {
            return self.scan_number(start, strings);
        }
        match c {
            '"' => self.scan_string(start, strings),
            '\'' => self.scan_char(start, strings),
            _ => self.scan_punct(start, strings),
        }
    }

    fn scan_identifier(&mut self, start: TokenStart, strings: &mut StringTable) -> Token {
        let text = self.cursor.eat_while(is_ident_continue);
        let kind = keyword_or_alt(text).unwrap_or(TokenKind::Identifier);
        let handle = strings.intern(text);
        Token::new(kind, handle, self.span(&start))
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            let c = self.cursor.current();
            if c.is_whitespace() {
                self.cursor.advance();
            } else if c == '/' && self.cursor.peek(1) == '/' {
                self.cursor.eat_while(|ch| ch != '\n');
            } else if c == '/' && self.cursor.peek(1) == '*' {
                let start = self.mark_start();
                self.cursor.advance();
                self.cursor.advance();
                loop {
                    if self.cursor.is_eof() {
                        return Err(LexError {
                            kind: LexErrorKind::UnterminatedBlockComment,
                            span: self.span(&start),
                        });
                    }
                    if self.cursor.current() == '*' && self.cursor.peek(1) == '/' {
                        self.cursor.advance();
                        self.cursor.advance();
                        break;
                    }
                    self.cursor.advance();
                }
            } else if c == '#' && self.cursor.column() == 1 {
                // Preprocessing is an external collaborator; a directive that
                // survives to this stage is residue and is skipped line-wise.
                self.cursor.eat_while(|ch| ch != '\n');
            } else {
                return Ok(());
            }
        }
    }

    pub(crate) fn mark_start(&self) -> TokenStart {
        TokenStart {
            pos: self.cursor.position(),
            line: self.cursor.line(),
            column: self.cursor.column(),
        }
    }

    pub(crate) fn span(&self, start: &TokenStart) -> Span {
        self.cursor
            .span_from(start.pos, start.line, start.column, self.file)
    }

    pub(crate) fn error(&self, kind: LexErrorKind, start: &TokenStart) -> LexError {
        LexError {
            kind,
            span: self.span(start),
        }
    }

    pub(crate) fn intern_raw(
        &self,
        start: &TokenStart,
        strings: &mut StringTable,
    ) -> StringHandle {
        strings.intern(self.cursor.slice(start.pos, self.cursor.position()))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (!c.is_ascii() && c.is_alphabetic())
}

fn is_ident_continue(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Kw, Punct};

    fn lex(src: &str) -> (Vec<Token>, StringTable) {
        let mut strings = StringTable::new();
        let tokens = Lexer::tokenize(src, FileId::DUMMY, &mut strings).expect("lex ok");
        (tokens, strings)
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src).0.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_input_is_just_eof() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("int main"),
            vec![
                TokenKind::Keyword(Kw::Int),
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_simple_function() {
        let (tokens, strings) = lex("int main() { return 42; }");
        let texts: Vec<&str> = tokens.iter().map(|t| strings.view(t.text)).collect();
        assert_eq!(
            texts,
            vec!["int", "main", "(", ")", "{", "return", "42", ";", "}", ""]
        );
    }

    #[test]
    fn test_alternative_operator_spelling() {
        assert_eq!(
            kinds("a and b"),
            vec![
                TokenKind::Identifier,
                TokenKind::Punct(Punct::AmpAmp),
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_trivia() {
        assert_eq!(
            kinds("x // line\n/* block\nstill */ y"),
            vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_block_comment_is_fatal() {
        let mut strings = StringTable::new();
        let err = Lexer::tokenize("/* oops", FileId::DUMMY, &mut strings).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnterminatedBlockComment);
    }

    #[test]
    fn test_locations_are_one_based() {
        let (tokens, _) = lex("a\n  b");
        assert_eq!((tokens[0].span.line, tokens[0].span.column), (1, 1));
        assert_eq!((tokens[1].span.line, tokens[1].span.column), (2, 3));
    }

    #[test]
    fn test_stray_character_is_fatal() {
        let mut strings = StringTable::new();
        let err = Lexer::tokenize("int $x;", FileId::DUMMY, &mut strings).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::InvalidCharacter('$'));
    }

    #[test]
    fn test_directive_residue_skipped() {
        assert_eq!(
            kinds("#include <vector>\nint x;"),
            vec![
                TokenKind::Keyword(Kw::Int),
                TokenKind::Identifier,
                TokenKind::Punct(Punct::Semi),
                TokenKind::Eof
            ]
        );
    }
}
