//! Replayable token stream.
//!
//! The parser needs unbounded lookahead with cheap backtracking: tentative
//! parses (declaration vs expression, template argument list vs comparison)
//! save a [`Mark`], try one interpretation, and restore on failure. The
//! stream buffers every token, so save/restore is cursor assignment, not
//! re-lexing.

use fcpp_util::{StringTable, Span};

use crate::token::{Punct, Token, TokenKind};

/// A saved stream position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mark(u32);

/// Buffered token stream with cursor-based replay.
pub struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenStream {
    /// Wrap a fully-lexed token vector. The vector must end with the EOF
    /// sentinel produced by the lexer.
    pub fn new(tokens: Vec<Token>) -> Self {
        debug_assert!(matches!(tokens.last(), Some(t) if t.is_eof()));
        Self { tokens, pos: 0 }
    }

    /// The current token. Once the cursor reaches EOF it stays there.
    #[inline]
    pub fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    /// Look ahead `k` tokens (0 = current). Clamps at the EOF sentinel.
    #[inline]
    pub fn peek(&self, k: usize) -> &Token {
        let idx = (self.pos + k).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    /// Consume and return the current token. The EOF sentinel is sticky.
    pub fn advance(&mut self) -> Token {
        let token = *self.current();
        if !token.is_eof() {
            self.pos += 1;
        }
        token
    }

    /// Save the cursor.
    #[inline]
    pub fn save(&self) -> Mark {
        Mark(self.pos as u32)
    }

    /// Restore a previously saved cursor.
    #[inline]
    pub fn restore(&mut self, mark: Mark) {
        self.pos = mark.0 as usize;
    }

    /// Raw cursor position, used to delimit template body token ranges.
    #[inline]
    pub fn pos(&self) -> u32 {
        self.pos as u32
    }

    /// Span of the current token.
    #[inline]
    pub fn span(&self) -> Span {
        self.current().span
    }

    /// If the current token is `>>`, split it into two `>` tokens in place.
    ///
    /// Used by the parser when a nested template argument list closes: the
    /// first `>` is consumed for the inner list and the second remains
    /// current for the outer one.
    pub fn split_right_shift(&mut self, strings: &mut StringTable) {
        let token = *self.current();
        if token.kind != TokenKind::Punct(Punct::Shr) {
            return;
        }
        let gt_text = strings.intern(">");
        let mut first = token;
        first.kind = TokenKind::Punct(Punct::Gt);
        first.text = gt_text;
        first.span.end = first.span.start + 1;
        let mut second = first;
        second.span.start += 1;
        second.span.column += 1;
        self.tokens[self.pos] = first;
        self.tokens.insert(self.pos + 1, second);
    }

    /// Raw view of a token range (template body capture).
    pub fn tokens(&self, start: u32, end: u32) -> &[Token] {
        &self.tokens[start as usize..end as usize]
    }

    /// Clone a token range and terminate it with an EOF sentinel, producing
    /// an independently replayable stream (template body re-parse).
    pub fn slice_stream(&self, start: u32, end: u32) -> TokenStream {
        let mut tokens: Vec<Token> = self.tokens[start as usize..end as usize].to_vec();
        let eof_span = tokens.last().map(|t| t.span).unwrap_or(Span::DUMMY);
        let eof_text = self
            .tokens
            .last()
            .expect("stream always has an EOF token")
            .text;
        tokens.push(Token::new(TokenKind::Eof, eof_text, eof_span));
        TokenStream::new(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use fcpp_util::FileId;

    fn stream(src: &str) -> (TokenStream, StringTable) {
        let mut strings = StringTable::new();
        let tokens = Lexer::tokenize(src, FileId::DUMMY, &mut strings).expect("lex ok");
        (TokenStream::new(tokens), strings)
    }

    #[test]
    fn test_advance_and_peek() {
        let (mut s, _) = stream("a b c");
        assert_eq!(s.peek(2).kind, TokenKind::Identifier);
        s.advance();
        s.advance();
        s.advance();
        assert!(s.current().is_eof());
        // EOF is sticky.
        s.advance();
        assert!(s.current().is_eof());
    }

    #[test]
    fn test_save_restore() {
        let (mut s, _) = stream("x y z");
        let mark = s.save();
        s.advance();
        s.advance();
        s.restore(mark);
        assert_eq!(s.pos(), 0);
    }

    #[test]
    fn test_split_right_shift() {
        let (mut s, mut strings) = stream("A>>");
        s.advance(); // A
        assert_eq!(s.current().kind, TokenKind::Punct(Punct::Shr));
        s.split_right_shift(&mut strings);
        assert_eq!(s.advance().kind, TokenKind::Punct(Punct::Gt));
        assert_eq!(s.advance().kind, TokenKind::Punct(Punct::Gt));
        assert!(s.current().is_eof());
    }

    #[test]
    fn test_split_is_noop_on_other_tokens() {
        let (mut s, mut strings) = stream("x");
        s.split_right_shift(&mut strings);
        assert_eq!(s.current().kind, TokenKind::Identifier);
    }

    #[test]
    fn test_slice_stream_appends_eof() {
        let (s, _) = stream("a b c d");
        let sub = s.slice_stream(1, 3);
        assert_eq!(sub.peek(0).kind, TokenKind::Identifier);
        assert_eq!(sub.peek(1).kind, TokenKind::Identifier);
        assert_eq!(sub.peek(2).kind, TokenKind::Eof);
    }
}
