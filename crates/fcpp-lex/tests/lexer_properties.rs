//! Property tests for the scanner.

use fcpp_lex::{Lexer, TokenKind};
use fcpp_util::{FileId, StringTable};
use proptest::prelude::*;

proptest! {
    /// Any whitespace-separated sequence of identifiers lexes back to the
    /// same spellings in order (keywords excluded by construction).
    #[test]
    fn identifiers_roundtrip(words in proptest::collection::vec("[a-z][a-z0-9_]{0,10}xx", 0..20)) {
        let src = words.join(" ");
        let mut strings = StringTable::new();
        let tokens = Lexer::tokenize(&src, FileId::DUMMY, &mut strings).expect("lex ok");
        let spelled: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Identifier)
            .map(|t| strings.view(t.text))
            .collect();
        prop_assert_eq!(spelled, words.iter().map(String::as_str).collect::<Vec<_>>());
    }

    /// Decimal integer literals survive lex + value parse.
    #[test]
    fn decimal_int_value_roundtrip(value in 0u64..=u64::MAX / 2) {
        let src = format!("{value}");
        let mut strings = StringTable::new();
        let tokens = Lexer::tokenize(&src, FileId::DUMMY, &mut strings).expect("lex ok");
        prop_assert_eq!(tokens[0].kind, TokenKind::IntLit);
        let parsed = fcpp_lex::int_literal_value(strings.view(tokens[0].text)).expect("parse ok");
        prop_assert_eq!(parsed.value, value);
    }

    /// Interning the same spelling twice yields the same handle.
    #[test]
    fn intern_is_stable(word in "[a-z]{1,12}") {
        let mut strings = StringTable::new();
        let a = strings.intern(&word);
        let b = strings.intern(&word);
        prop_assert_eq!(a, b);
    }
}
