//! Numeric literal scanning.
//!
//! The scanner only validates the shape of a literal and classifies it as
//! integer or floating-point; the value is parsed later from the token text
//! by [`crate::literal`].

use fcpp_util::StringTable;

use super::{LexError, LexErrorKind, Lexer, TokenStart};
use crate::token::{Token, TokenKind};

impl<'a> Lexer<'a> {
    pub(crate) fn scan_number(
        &mut self,
        start: TokenStart,
        strings: &mut StringTable,
    ) -> Result<Token, LexError> {
        let mut is_float = false;

        if self.cursor.current() == '0'
            && matches!(self.cursor.peek(1), 'x' | 'X' | 'b' | 'B')
        {
            let radix_char = self.cursor.peek(1);
            self.cursor.advance();
            self.cursor.advance();
            let digits = self.cursor.eat_while(|c| c.is_ascii_hexdigit() || c == '\'');
            if digits.is_empty() {
                return Err(self.error(LexErrorKind::InvalidNumber, &start));
            }
            if matches!(radix_char, 'b' | 'B')
                && digits.chars().any(|c| !matches!(c, '0' | '1' | '\''))
            {
                return Err(self.error(LexErrorKind::InvalidNumber, &start));
            }
        } else {
            self.cursor.eat_while(|c| c.is_ascii_digit() || c == '\'');
            // Fraction: a '.' followed by a digit, or a trailing '.' as in "1.".
            if self.cursor.current() == '.' && self.cursor.peek(1) != '.' {
                is_float = true;
                self.cursor.advance();
                self.cursor.eat_while(|c| c.is_ascii_digit() || c == '\'');
            }
            if matches!(self.cursor.current(), 'e' | 'E') {
                let after_sign = if matches!(self.cursor.peek(1), '+' | '-') {
                    self.cursor.peek(2)
                } else {
                    self.cursor.peek(1)
                };
                if after_sign.is_ascii_digit() {
                    is_float = true;
                    self.cursor.advance();
                    if matches!(self.cursor.current(), '+' | '-') {
                        self.cursor.advance();
                    }
                    self.cursor.eat_while(|c| c.is_ascii_digit());
                }
            }
        }

        // Suffix characters; validity is checked by the value parser.
        if is_float {
            if matches!(self.cursor.current(), 'f' | 'F' | 'l' | 'L') {
                self.cursor.advance();
            }
        } else {
            self.cursor
                .eat_while(|c| matches!(c, 'u' | 'U' | 'l' | 'L'));
        }

        // An identifier character glued to a number is malformed ("42abc").
        if self.cursor.current().is_ascii_alphanumeric() || self.cursor.current() == '_' {
            return Err(self.error(LexErrorKind::InvalidNumber, &start));
        }

        let kind = if is_float {
            TokenKind::FloatLit
        } else {
            TokenKind::IntLit
        };
        let text = self.intern_raw(&start, strings);
        Ok(Token::new(kind, text, self.span(&start)))
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
    fn test_decimal_int() {
        assert_eq!(lex_one("42"), (TokenKind::IntLit, "42".to_string()));
    }

    #[test]
    fn test_hex_with_separator() {
        assert_eq!(lex_one("0xFF'00"), (TokenKind::IntLit, "0xFF'00".to_string()));
    }

    #[test]
    fn test_binary() {
        assert_eq!(lex_one("0b1010"), (TokenKind::IntLit, "0b1010".to_string()));
    }

    #[test]
    fn test_suffixed() {
        assert_eq!(lex_one("42ull"), (TokenKind::IntLit, "42ull".to_string()));
    }

    #[test]
    fn test_floats() {
        assert_eq!(lex_one("1.5").0, TokenKind::FloatLit);
        assert_eq!(lex_one("1e9").0, TokenKind::FloatLit);
        assert_eq!(lex_one("2.5e-3f").0, TokenKind::FloatLit);
        assert_eq!(lex_one(".5").0, TokenKind::FloatLit);
    }

    #[test]
    fn test_member_access_is_not_a_float() {
        // "1." followed by another '.' must not swallow an ellipsis.
        let mut strings = StringTable::new();
        let tokens = Lexer::tokenize("x.y", FileId::DUMMY, &mut strings).unwrap();
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_glued_identifier_is_malformed() {
        let mut strings = StringTable::new();
        let err = Lexer::tokenize("42abc", FileId::DUMMY, &mut strings).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::InvalidNumber);
    }

    #[test]
    fn test_empty_hex_is_malformed() {
        let mut strings = StringTable::new();
        let err = Lexer::tokenize("0x;", FileId::DUMMY, &mut strings).unwrap_err();
        assert_eq!(err.kind, LexErrorKind::InvalidNumber);
    }
}
