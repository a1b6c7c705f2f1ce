//! Operator and punctuator scanning, longest match first.

use fcpp_util::StringTable;

use super::{LexError, LexErrorKind, Lexer, TokenStart};
use crate::token::{Punct, Token, TokenKind};

impl<'a> Lexer<'a> {
    pub(crate) fn scan_punct(
        &mut self,
        start: TokenStart,
        strings: &mut StringTable,
    ) -> Result<Token, LexError> {
        let c0 = self.cursor.current();
        let c1 = self.cursor.peek(1);
        let c2 = self.cursor.peek(2);

        // (punct, consumed length). Longest spellings checked first.
        let (punct, len) = match (c0, c1, c2) {
            ('<', '=', '>') => (Punct::Spaceship, 3),
            ('<', '<', '=') => (Punct::ShlEq, 3),
            ('>', '>', '=') => (Punct::ShrEq, 3),
            ('.', '.', '.') => (Punct::Ellipsis, 3),
            ('-', '>', '*') => (Punct::ArrowStar, 3),
            ('-', '>', _) => (Punct::Arrow, 2),
            (':', ':', _) => (Punct::ColonColon, 2),
            ('+', '+', _) => (Punct::PlusPlus, 2),
            ('+', '=', _) => (Punct::PlusEq, 2),
            ('-', '-', _) => (Punct::MinusMinus, 2),
            ('-', '=', _) => (Punct::MinusEq, 2),
            ('*', '=', _) => (Punct::StarEq, 2),
            ('/', '=', _) => (Punct::SlashEq, 2),
            ('%', '=', _) => (Punct::PercentEq, 2),
            ('&', '&', _) => (Punct::AmpAmp, 2),
            ('&', '=', _) => (Punct::AmpEq, 2),
            ('|', '|', _) => (Punct::PipePipe, 2),
            ('|', '=', _) => (Punct::PipeEq, 2),
            ('^', '=', _) => (Punct::CaretEq, 2),
            ('!', '=', _) => (Punct::BangEq, 2),
            ('=', '=', _) => (Punct::EqEq, 2),
            ('<', '<', _) => (Punct::Shl, 2),
            ('<', '=', _) => (Punct::LtEq, 2),
            ('>', '>', _) => (Punct::Shr, 2),
            ('>', '=', _) => (Punct::GtEq, 2),
            ('.', '*', _) => (Punct::DotStar, 2),
            ('{', _, _) => (Punct::LBrace, 1),
            ('}', _, _) => (Punct::RBrace, 1),
            ('(', _, _) => (Punct::LParen, 1),
            (')', _, _) => (Punct::RParen, 1),
            ('[', _, _) => (Punct::LBracket, 1),
            (']', _, _) => (Punct::RBracket, 1),
            (';', _, _) => (Punct::Semi, 1),
            (',', _, _) => (Punct::Comma, 1),
            ('.', _, _) => (Punct::Dot, 1),
            (':', _, _) => (Punct::Colon, 1),
            ('?', _, _) => (Punct::Question, 1),
            ('+', _, _) => (Punct::Plus, 1),
            ('-', _, _) => (Punct::Minus, 1),
            ('*', _, _) => (Punct::Star, 1),
            ('/', _, _) => (Punct::Slash, 1),
            ('%', _, _) => (Punct::Percent, 1),
            ('&', _, _) => (Punct::Amp, 1),
            ('|', _, _) => (Punct::Pipe, 1),
            ('^', _, _) => (Punct::Caret, 1),
            ('~', _, _) => (Punct::Tilde, 1),
            ('!', _, _) => (Punct::Bang, 1),
            ('=', _, _) => (Punct::Assign, 1),
            ('<', _, _) => (Punct::Lt, 1),
            ('>', _, _) => (Punct::Gt, 1),
            _ => return Err(self.error(LexErrorKind::InvalidCharacter(c0), &start)),
        };

        for _ in 0..len {
            self.cursor.advance();
        }
        let text = self.intern_raw(&start, strings);
        Ok(Token::new(TokenKind::Punct(punct), text, self.span(&start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcpp_util::FileId;

    fn puncts(src: &str) -> Vec<Punct> {
        let mut strings = StringTable::new();
        Lexer::tokenize(src, FileId::DUMMY, &mut strings)
            .expect("lex ok")
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Punct(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_longest_match() {
        assert_eq!(puncts("<<="), vec![Punct::ShlEq]);
        assert_eq!(puncts("<= >"), vec![Punct::LtEq, Punct::Gt]);
        assert_eq!(puncts("<=>"), vec![Punct::Spaceship]);
    }

    #[test]
    fn test_shift_right_is_one_token() {
        assert_eq!(puncts(">>"), vec![Punct::Shr]);
    }

    #[test]
    fn test_scope_and_colon() {
        assert_eq!(puncts(":: :"), vec![Punct::ColonColon, Punct::Colon]);
    }

    #[test]
    fn test_member_pointer_operators() {
        assert_eq!(puncts("->* .*"), vec![Punct::ArrowStar, Punct::DotStar]);
        assert_eq!(puncts("->"), vec![Punct::Arrow]);
    }

    #[test]
    fn test_ellipsis() {
        assert_eq!(puncts("..."), vec![Punct::Ellipsis]);
    }
}
