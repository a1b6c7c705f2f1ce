//! String and character literal scanning.
//!
//! The token text of a string or character literal is the *cooked* contents:
//! escape sequences are resolved during scanning and the unescaped bytes are
//! interned. Downstream consumers (string pooling in `.rodata`, character
//! values) never re-examine escapes.

use fcpp_util::StringTable;

use super::{LexError, LexErrorKind, Lexer, TokenStart};
use crate::token::{Token, TokenKind};

impl<'a> Lexer<'a> {
    pub(crate) fn scan_string(
        &mut self,
        start: TokenStart,
        strings: &mut StringTable,
    ) -> Result<Token, LexError> {
        self.cursor.advance(); // opening quote
        let cooked = self.scan_quoted('"', LexErrorKind::UnterminatedString, &start)?;
        let text = strings.intern(&cooked);
        Ok(Token::new(TokenKind::StringLit, text, self.span(&start)))
    }

    pub(crate) fn scan_char(
        &mut self,
        start: TokenStart,
        strings: &mut StringTable,
    ) -> Result<Token, LexError> {
        self.cursor.advance(); // opening quote
        let cooked = self.scan_quoted('\'', LexErrorKind::UnterminatedChar, &start)?;
        if cooked.is_empty() {
            return Err(self.error(LexErrorKind::UnterminatedChar, &start));
        }
        let text = strings.intern(&cooked);
        Ok(Token::new(TokenKind::CharLit, text, self.span(&start)))
    }

    fn scan_quoted(
        &mut self,
        quote: char,
        unterminated: LexErrorKind,
        start: &TokenStart,
    ) -> Result<String, LexError> {
        let mut cooked = String::new();
        loop {
            let c = self.cursor.current();
            if self.cursor.is_eof() || c == '\n' {
                return Err(self.error(unterminated, start));
            }
            self.cursor.advance();
            if c == quote {
                return Ok(cooked);
            }
            if c != '\\' {
                cooked.push(c);
                continue;
            }
            let esc = self.cursor.current();
            self.cursor.advance();
            match esc {
                'n' => cooked.push('\n'),
                't' => cooked.push('\t'),
                'r' => cooked.push('\r'),
                '0' => cooked.push('\0'),
                'a' => cooked.push('\x07'),
                'b' => cooked.push('\x08'),
                'f' => cooked.push('\x0c'),
                'v' => cooked.push('\x0b'),
                '\\' => cooked.push('\\'),
                '\'' => cooked.push('\''),
                '"' => cooked.push('"'),
                '?' => cooked.push('?'),
                'x' => {
                    let digits = self.cursor.eat_while(|d| d.is_ascii_hexdigit());
                    let value = u32::from_str_radix(digits, 16)
                        .map_err(|_| self.error(LexErrorKind::InvalidEscape('x'), start))?;
                    let ch = char::from_u32(value)
                        .ok_or_else(|| self.error(LexErrorKind::InvalidEscape('x'), start))?;
                    cooked.push(ch);
                }
                other => return Err(self.error(LexErrorKind::InvalidEscape(other), start)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcpp_util::FileId;

    fn lex_one(src: &str) -> (TokenKind, String) {
        let mut strings = StringTable::new();
        let tokens = Lexer::tokenize(src, FileId::DUMMY, &mut strings).expect("lex ok");
        (tokens[0].kind, strings.view(tokens[0].text).to_string())
    }

    #[test]
    fn test_plain_string() {
        assert_eq!(
            lex_one("\"hello\""),
            (TokenKind::StringLit, "hello".to_string())
        );
    }

    #[test]
    fn test_escapes_are_cooked() {
        assert_eq!(lex_one("\"a\\nb\\t\\\\\"").1, "a\nb\t\\");
        assert_eq!(lex_one("\"\\x41\"").1, "A");
    }

    #[test]
    fn test_char_literal() {
        assert_eq!(lex_one("'x'"), (TokenKind::CharLit, "x".to_string()));
        assert_eq!(lex_one("'\\n'").1, "\n");
    }

    #[test]
    fn test_unterminated_string() {
        let mut strings = StringTable::new();
        let err = Lexer::tokenize("\"oops", FileId::DUMMY, &mut strings).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnterminatedString);
    }

    #[test]
    fn test_newline_terminates_string() {
        let mut strings = StringTable::new();
        let err = Lexer::tokenize("\"oops\nx", FileId::DUMMY, &mut strings).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::UnterminatedString);
    }

    #[test]
    fn test_bad_escape() {
        let mut strings = StringTable::new();
        let err = Lexer::tokenize("\"\\q\"", FileId::DUMMY, &mut strings).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::InvalidEscape('q'));
    }
}
