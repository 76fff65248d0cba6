//! Call-text scanning.
//!
//! The scanner works over a stack of inputs: expanding a synonym pushes
//! its body, and scanning resumes in the outer text when the body is
//! exhausted. Operator characters are only meaningful inside definition
//! text; in user-entered calls they are error tokens.

use crate::stage::{TermId, TermStore};
use crate::term::{Fraction, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Error,
    UnknownWord,
    Word,
    Integer,
    Fraction,
    Variable,
    DancerName,
    Slash,
    Dash,
    Plus,
    Asterisk,
    Not,
    NotEq,
    EqEq,
    Gtr,
    GtrEq,
    Lss,
    LssEq,
    Or,
    And,
    Xor,
    Remainder,
    LParen,
    RParen,
    Comma,
    Eq,
    EndOfString,
    /// A trailing partial word, reported only when autocompleting.
    FinalPartial,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub value: i32,
    pub term: Option<TermId>,
    pub frac: Option<Fraction>,
    pub text: String,
}

impl Token {
    pub fn end_of_string() -> Token {
        Token {
            kind: TokenKind::EndOfString,
            value: 0,
            term: None,
            frac: None,
            text: String::new(),
        }
    }

    pub fn simple(kind: TokenKind) -> Token {
        Token {
            kind,
            ..Token::end_of_string()
        }
    }

    pub fn word(term: TermId) -> Token {
        Token {
            kind: TokenKind::Word,
            term: Some(term),
            ..Token::end_of_string()
        }
    }

    pub fn integer(value: i32) -> Token {
        Token {
            kind: TokenKind::Integer,
            value,
            ..Token::end_of_string()
        }
    }

    pub fn fraction(frac: Fraction) -> Token {
        Token {
            kind: TokenKind::Fraction,
            frac: Some(frac),
            ..Token::end_of_string()
        }
    }
}

/// Read access over both term spaces without mutation.
#[derive(Clone, Copy)]
pub struct TermLook<'a> {
    pub grammar_terms: &'a TermStore,
    pub stage_terms: Option<&'a TermStore>,
}

impl<'a> TermLook<'a> {
    pub fn get(&self, id: TermId) -> &'a Term {
        if id.is_grammar_space() {
            self.grammar_terms.get(id)
        } else {
            self.stage_terms
                .expect("stage-space term id without a stage")
                .get(id)
        }
    }

    /// The token a dictionary term stands for.
    pub fn token_for(&self, id: TermId) -> Token {
        match self.get(id) {
            Term::Integer(v) => Token::integer(*v),
            Term::Fraction(f) => Token::fraction(*f),
            Term::DancerName(index) => Token {
                kind: TokenKind::DancerName,
                value: *index as i32,
                ..Token::end_of_string()
            },
            _ => Token::word(id),
        }
    }
}

/// Word dictionary and synonym access the scanner needs.
pub trait WordSource {
    fn synonym_body(&self, word: &str) -> Option<&str>;
    fn lookup_word(&self, word: &str) -> Option<TermId>;
}

pub fn valid_word_content(c: char, in_definition: bool) -> bool {
    match c {
        '_' | '$' => in_definition,
        'a'..='z' | 'A'..='Z' | '\'' | '-' => true,
        _ => false,
    }
}

struct Input {
    text: Vec<char>,
    cursor: usize,
    /// Synonym whose body this input is, for cycle detection.
    synonym: Option<String>,
}

impl Input {
    fn remaining(&self) -> bool {
        self.cursor < self.text.len()
    }

    fn next_char(&self) -> char {
        self.text[self.cursor]
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.text.get(self.cursor + ahead).copied()
    }

    fn skip(&mut self) {
        self.cursor += 1;
    }

    fn contents(&self, start: usize) -> String {
        self.text[start..self.cursor].iter().collect()
    }
}

pub struct Scanner<'a> {
    inputs: Vec<Input>,
    in_definition: bool,
    words: Option<&'a dyn WordSource>,
    look: TermLook<'a>,
    /// Plan-local designator bindings: word term to value term.
    locals: &'a [(TermId, TermId)],
    /// When set, a trailing partial word is reported as FinalPartial.
    want_partial: bool,
    token: Token,
}

impl<'a> Scanner<'a> {
    pub fn new(
        input: &str,
        in_definition: bool,
        words: Option<&'a dyn WordSource>,
        look: TermLook<'a>,
        locals: &'a [(TermId, TermId)],
        want_partial: bool,
    ) -> Scanner<'a> {
        Scanner {
            inputs: vec![Input {
                text: input.to_lowercase().chars().collect(),
                cursor: 0,
                synonym: None,
            }],
            in_definition,
            words,
            look,
            locals,
            want_partial,
            token: Token::end_of_string(),
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    fn top(&mut self) -> &mut Input {
        let last = self.inputs.len() - 1;
        &mut self.inputs[last]
    }

    fn remaining(&self) -> bool {
        self.inputs.last().map(|i| i.remaining()).unwrap_or(false)
    }

    fn op(&mut self, kind: TokenKind, glyph: char) -> &Token {
        self.top().skip();
        if self.in_definition {
            self.token = Token::simple(kind);
        } else {
            self.token = Token::simple(TokenKind::Error);
            self.token.text = glyph.to_string();
        }
        &self.token
    }

    fn op_maybe_eq(&mut self, base: TokenKind, with_eq: TokenKind, glyph: char) -> &Token {
        self.top().skip();
        if self.in_definition {
            let mut kind = base;
            if self.remaining() && self.top().next_char() == '=' {
                self.top().skip();
                kind = with_eq;
            }
            self.token = Token::simple(kind);
        } else {
            self.token = Token::simple(TokenKind::Error);
            self.token.text = glyph.to_string();
        }
        &self.token
    }

    pub fn scan(&mut self) -> &Token {
        while !self.inputs.is_empty() {
            while self.remaining() {
                let c = self.top().next_char();
                match c {
                    '0'..='9' => {
                        let start = self.top().cursor;
                        while self.remaining() && self.top().next_char().is_ascii_digit() {
                            self.top().skip();
                        }
                        let text = self.top().contents(start);
                        self.token = Token::integer(text.parse().unwrap_or(0));
                        self.token.text = text;
                        return &self.token;
                    }
                    '!' => return self.op_maybe_eq(TokenKind::Not, TokenKind::NotEq, '!'),
                    '=' => {
                        self.top().skip();
                        if self.in_definition && self.remaining() && self.top().next_char() == '=' {
                            self.top().skip();
                            self.token = Token::simple(TokenKind::EqEq);
                        } else {
                            self.token = Token::simple(TokenKind::Eq);
                        }
                        return &self.token;
                    }
                    '<' => return self.op_maybe_eq(TokenKind::Lss, TokenKind::LssEq, '<'),
                    '>' => return self.op_maybe_eq(TokenKind::Gtr, TokenKind::GtrEq, '>'),
                    '|' => return self.op(TokenKind::Or, '|'),
                    '&' => return self.op(TokenKind::And, '&'),
                    '^' => return self.op(TokenKind::Xor, '^'),
                    '/' => {
                        self.top().skip();
                        self.token = Token::simple(TokenKind::Slash);
                        return &self.token;
                    }
                    '%' => return self.op(TokenKind::Remainder, '%'),
                    '-' => return self.op(TokenKind::Dash, '-'),
                    '+' => return self.op(TokenKind::Plus, '+'),
                    '*' => return self.op(TokenKind::Asterisk, '*'),
                    '(' => return self.op(TokenKind::LParen, '('),
                    ')' => return self.op(TokenKind::RParen, ')'),
                    ',' => {
                        self.top().skip();
                        if self.in_definition {
                            self.token = Token::simple(TokenKind::Comma);
                            return &self.token;
                        }
                    }
                    '[' | ']' => {
                        self.top().skip();
                        if self.in_definition {
                            self.token = Token::simple(TokenKind::Error);
                            self.token.text = c.to_string();
                            return &self.token;
                        }
                    }
                    ' ' | '\t' | '\n' | '\r' | ':' | ';' | '.' | '?' => {
                        self.top().skip();
                    }
                    '$' if self.in_definition && self.top().peek(1).map(|p| p.is_ascii_digit()).unwrap_or(false) => {
                        let digit = self.top().peek(1).unwrap();
                        self.top().skip();
                        self.top().skip();
                        self.token = Token::simple(TokenKind::Variable);
                        self.token.value = digit as i32 - '0' as i32;
                        return &self.token;
                    }
                    _ => {
                        if valid_word_content(c, self.in_definition) {
                            let start = self.top().cursor;
                            while self.remaining() && valid_word_content(self.top().next_char(), self.in_definition) {
                                self.top().skip();
                            }
                            let text = self.top().contents(start);
                            if self.want_partial && !self.remaining() && self.inputs.len() == 1 {
                                self.token = Token::simple(TokenKind::FinalPartial);
                                self.token.text = text;
                                return &self.token;
                            }
                            if let Some(words) = self.words {
                                if let Some(body) = words.synonym_body(&text) {
                                    if self.inputs.iter().any(|i| i.synonym.as_deref() == Some(&text)) {
                                        // a synonym that expands to itself would loop
                                        self.token = Token::simple(TokenKind::Error);
                                        self.token.text = text;
                                        return &self.token;
                                    }
                                    let body = body.to_string();
                                    self.inputs.push(Input {
                                        text: body.to_lowercase().chars().collect(),
                                        cursor: 0,
                                        synonym: Some(text),
                                    });
                                    break;
                                }
                                if let Some(term) = words.lookup_word(&text) {
                                    if let Some((_, value)) = self.locals.iter().find(|(w, _)| *w == term) {
                                        self.token = Token::word(*value);
                                        self.token.text = text;
                                        return &self.token;
                                    }
                                    self.token = self.look.token_for(term);
                                    self.token.text = text;
                                    return &self.token;
                                }
                            }
                            self.token = Token::simple(TokenKind::UnknownWord);
                            self.token.text = text;
                            return &self.token;
                        }
                        self.token = Token::simple(TokenKind::Error);
                        self.token.text = c.to_string();
                        self.top().skip();
                        return &self.token;
                    }
                }
            }
            if !self.remaining() {
                self.inputs.pop();
            }
        }
        self.token = Token::end_of_string();
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{TermSpace, TermStore};
    use std::collections::HashMap;

    struct Dict {
        synonyms: HashMap<String, String>,
        words: HashMap<String, TermId>,
    }

    impl WordSource for Dict {
        fn synonym_body(&self, word: &str) -> Option<&str> {
            self.synonyms.get(word).map(|s| s.as_str())
        }

        fn lookup_word(&self, word: &str) -> Option<TermId> {
            self.words.get(word).copied()
        }
    }

    fn dict_with(store: &mut TermStore, words: &[(&str, Term)]) -> Dict {
        let mut map = HashMap::new();
        for (w, t) in words {
            map.insert(w.to_string(), store.alloc(t.clone()));
        }
        Dict {
            synonyms: HashMap::new(),
            words: map,
        }
    }

    fn scan_kinds(input: &str, in_definition: bool) -> Vec<TokenKind> {
        let store = TermStore::new(TermSpace::Grammar);
        let look = TermLook {
            grammar_terms: &store,
            stage_terms: None,
        };
        let mut scanner = Scanner::new(input, in_definition, None, look, &[], false);
        let mut kinds = Vec::new();
        loop {
            let t = scanner.scan();
            if t.kind == TokenKind::EndOfString {
                break;
            }
            kinds.push(t.kind);
            if kinds.len() > 64 {
                break;
            }
        }
        kinds
    }

    #[test]
    fn digits_become_integer_tokens() {
        assert_eq!(scan_kinds("42", false), vec![TokenKind::Integer]);
    }

    #[test]
    fn operators_are_errors_outside_definitions() {
        assert_eq!(scan_kinds("+", false), vec![TokenKind::Error]);
        assert_eq!(scan_kinds("+", true), vec![TokenKind::Plus]);
        assert_eq!(scan_kinds("%", true), vec![TokenKind::Remainder]);
    }

    #[test]
    fn comparison_operators_greedily_take_equals() {
        assert_eq!(
            scan_kinds("<= >= == !=", true),
            vec![TokenKind::LssEq, TokenKind::GtrEq, TokenKind::EqEq, TokenKind::NotEq]
        );
        assert_eq!(scan_kinds("< > !", true), vec![TokenKind::Lss, TokenKind::Gtr, TokenKind::Not]);
    }

    #[test]
    fn dollar_digit_is_a_variable_in_definitions() {
        let store = TermStore::new(TermSpace::Grammar);
        let look = TermLook {
            grammar_terms: &store,
            stage_terms: None,
        };
        let mut scanner = Scanner::new("$2", true, None, look, &[], false);
        let t = scanner.scan();
        assert_eq!(t.kind, TokenKind::Variable);
        assert_eq!(t.value, 2);
    }

    #[test]
    fn unknown_words_are_flagged() {
        assert_eq!(scan_kinds("mystery", false), vec![TokenKind::UnknownWord]);
    }

    #[test]
    fn known_words_resolve_to_terms() {
        let mut store = TermStore::new(TermSpace::Grammar);
        let dict = dict_with(&mut store, &[("swing", Term::Word("swing".into()))]);
        let look = TermLook {
            grammar_terms: &store,
            stage_terms: None,
        };
        let mut scanner = Scanner::new("Swing", false, Some(&dict as &dyn WordSource), look, &[], false);
        let t = scanner.scan();
        assert_eq!(t.kind, TokenKind::Word);
        assert!(t.term.is_some());
    }

    #[test]
    fn synonyms_push_their_body() {
        let mut store = TermStore::new(TermSpace::Grammar);
        let mut dict = dict_with(&mut store, &[("u-turn", Term::Word("u-turn".into()))]);
        dict.synonyms.insert("reverse".into(), "u-turn".into());
        let look = TermLook {
            grammar_terms: &store,
            stage_terms: None,
        };
        let mut scanner = Scanner::new("reverse", false, Some(&dict as &dyn WordSource), look, &[], false);
        let t = scanner.scan();
        assert_eq!(t.kind, TokenKind::Word);
        assert_eq!(t.text, "u-turn");
    }

    #[test]
    fn self_referential_synonym_aborts() {
        let mut store = TermStore::new(TermSpace::Grammar);
        let mut dict = dict_with(&mut store, &[]);
        dict.synonyms.insert("a".into(), "a".into());
        let look = TermLook {
            grammar_terms: &store,
            stage_terms: None,
        };
        let mut scanner = Scanner::new("a", false, Some(&dict as &dyn WordSource), look, &[], false);
        let t = scanner.scan();
        assert_eq!(t.kind, TokenKind::Error);
    }

    #[test]
    fn trailing_word_reports_final_partial_when_requested() {
        let store = TermStore::new(TermSpace::Grammar);
        let look = TermLook {
            grammar_terms: &store,
            stage_terms: None,
        };
        let mut scanner = Scanner::new("swing th", false, None, look, &[], true);
        let first = scanner.scan().clone();
        assert_eq!(first.kind, TokenKind::UnknownWord);
        let second = scanner.scan().clone();
        assert_eq!(second.kind, TokenKind::FinalPartial);
        assert_eq!(second.text, "th");
    }

    #[test]
    fn punctuation_between_words_is_skipped() {
        assert_eq!(scan_kinds("a. b? c", false).len(), 3);
    }
}
