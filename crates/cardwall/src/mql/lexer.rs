//! Lexical analysis for MQL.
//!
//! Converts raw MQL text into positioned tokens. Keywords are matched
//! case-insensitively and keep the text they were written with so that a
//! keyword used as a property name can be reported (or accepted) verbatim.

use crate::errors::MqlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Select,
    Distinct,
    From,
    Tree,
    Where,
    And,
    Or,
    Not,
    In,
    Is,
    Null,
    Group,
    Order,
    By,
    Asc,
    Desc,
    As,
    Of,
    Tagged,
    With,
    Number,
    Numbers,
    This,
    Card,
    Today,
    Current,
    User,
    Plan,
    Property,
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("SELECT", Keyword::Select),
    ("DISTINCT", Keyword::Distinct),
    ("FROM", Keyword::From),
    ("TREE", Keyword::Tree),
    ("WHERE", Keyword::Where),
    ("AND", Keyword::And),
    ("OR", Keyword::Or),
    ("NOT", Keyword::Not),
    ("IN", Keyword::In),
    ("IS", Keyword::Is),
    ("NULL", Keyword::Null),
    ("GROUP", Keyword::Group),
    ("ORDER", Keyword::Order),
    ("BY", Keyword::By),
    ("ASC", Keyword::Asc),
    ("DESC", Keyword::Desc),
    ("AS", Keyword::As),
    ("OF", Keyword::Of),
    ("TAGGED", Keyword::Tagged),
    ("WITH", Keyword::With),
    ("NUMBER", Keyword::Number),
    ("NUMBERS", Keyword::Numbers),
    ("THIS", Keyword::This),
    ("CARD", Keyword::Card),
    ("TODAY", Keyword::Today),
    ("CURRENT", Keyword::Current),
    ("USER", Keyword::User),
    ("PLAN", Keyword::Plan),
    ("PROPERTY", Keyword::Property),
    ("COUNT", Keyword::Count),
    ("SUM", Keyword::Sum),
    ("AVG", Keyword::Avg),
    ("MIN", Keyword::Min),
    ("MAX", Keyword::Max),
];

impl Keyword {
    pub fn from_word(word: &str) -> Option<Keyword> {
        KEYWORDS
            .iter()
            .find(|(text, _)| text.eq_ignore_ascii_case(word))
            .map(|(_, keyword)| *keyword)
    }

    pub fn as_str(&self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, keyword)| keyword == self)
            .map(|(text, _)| *text)
            .unwrap_or("")
    }

    /// Soft keywords only carry meaning after a specific leading keyword
    /// (`THIS CARD`, `CURRENT USER`, `FROM TREE`, ...) or before `(`, so
    /// they may also name properties without quoting.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Keyword::Tree
                | Keyword::By
                | Keyword::Of
                | Keyword::With
                | Keyword::Card
                | Keyword::User
                | Keyword::Plan
                | Keyword::Property
                | Keyword::Count
                | Keyword::Sum
                | Keyword::Avg
                | Keyword::Min
                | Keyword::Max
        )
    }
}

/// True when `word` would lex as a keyword.
pub fn is_keyword(word: &str) -> bool {
    Keyword::from_word(word).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }

    pub fn is_ordering(&self) -> bool {
        !matches!(self, Operator::Eq | Operator::Ne)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Keyword plus the text it was written with.
    Keyword(Keyword, String),
    /// Unquoted name or value.
    Word(String),
    Quoted(String),
    Number(String),
    Operator(Operator),
    LParen,
    RParen,
    Comma,
    Dot,
    Star,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Keyword(_, text) => text.clone(),
            Token::Word(text) | Token::Number(text) => text.clone(),
            Token::Quoted(text) => format!("'{}'", text),
            Token::Operator(op) => op.as_str().to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Comma => ",".to_string(),
            Token::Dot => ".".to_string(),
            Token::Star => "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub struct Lexer {
    chars: Vec<char>,
    position: usize,
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '#'
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            chars: input.chars().collect(),
            position: 0,
        }
    }

    pub fn tokenize(input: &str) -> Result<Vec<Spanned>, MqlError> {
        let mut lexer = Lexer::new(input);
        let mut tokens = Vec::new();

        while let Some(token) = lexer.next_token()? {
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Spanned>, MqlError> {
        self.skip_whitespace();
        let start = self.position;
        let Some(ch) = self.peek(0) else {
            return Ok(None);
        };

        let token = match ch {
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            ',' => self.single(Token::Comma),
            '.' => self.single(Token::Dot),
            '*' => self.single(Token::Star),
            '\'' | '"' => self.read_quoted(ch)?,
            '=' => self.single(Token::Operator(Operator::Eq)),
            '!' if self.peek(1) == Some('=') => self.double(Token::Operator(Operator::Ne)),
            '<' if self.peek(1) == Some('>') => self.double(Token::Operator(Operator::Ne)),
            '<' if self.peek(1) == Some('=') => self.double(Token::Operator(Operator::Le)),
            '<' => self.single(Token::Operator(Operator::Lt)),
            '>' if self.peek(1) == Some('=') => self.double(Token::Operator(Operator::Ge)),
            '>' => self.single(Token::Operator(Operator::Gt)),
            c if c.is_ascii_digit()
                || (c == '-' && self.peek(1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                self.read_number()
            }
            c if c.is_alphabetic() || c == '_' || c == '#' => self.read_word(),
            other => {
                return Err(MqlError::syntax(
                    format!("unexpected character '{}'", other),
                    start,
                ))
            }
        };

        Ok(Some(Spanned {
            token,
            position: start,
        }))
    }

    fn single(&mut self, token: Token) -> Token {
        self.position += 1;
        token
    }

    fn double(&mut self, token: Token) -> Token {
        self.position += 2;
        token
    }

    fn read_quoted(&mut self, quote: char) -> Result<Token, MqlError> {
        let start = self.position;
        self.position += 1;
        let mut text = String::new();
        loop {
            match self.peek(0) {
                None => {
                    return Err(MqlError::syntax("unterminated quoted string", start));
                }
                Some('\\') => {
                    if let Some(escaped) = self.peek(1) {
                        text.push(escaped);
                        self.position += 2;
                    } else {
                        return Err(MqlError::syntax("unterminated quoted string", start));
                    }
                }
                Some(c) if c == quote => {
                    self.position += 1;
                    return Ok(Token::Quoted(text));
                }
                Some(c) => {
                    text.push(c);
                    self.position += 1;
                }
            }
        }
    }

    fn read_number(&mut self) -> Token {
        let start = self.position;
        if self.peek(0) == Some('-') {
            self.position += 1;
        }
        self.consume_digits();
        if self.peek(0) == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.position += 1;
            self.consume_digits();
        }
        // `2024-01-05` or `3rd` are words, not numbers
        if self.peek(0).is_some_and(is_word_char) {
            while self.peek(0).is_some_and(is_word_char) {
                self.position += 1;
            }
            return Token::Word(self.text_from(start));
        }
        Token::Number(self.text_from(start))
    }

    fn read_word(&mut self) -> Token {
        let start = self.position;
        while self.peek(0).is_some_and(is_word_char) {
            self.position += 1;
        }
        let word = self.text_from(start);
        match Keyword::from_word(&word) {
            Some(keyword) => Token::Keyword(keyword, word),
            None => Token::Word(word),
        }
    }

    fn consume_digits(&mut self) {
        while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
            self.position += 1;
        }
    }

    fn text_from(&self, start: usize) -> String {
        self.chars[start..self.position].iter().collect()
    }

    fn skip_whitespace(&mut self) {
        while self.peek(0).is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.position + offset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::tokenize(input)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_tokenize_comparison() {
        assert_eq!(
            tokens("WHERE points >= 3"),
            vec![
                Token::Keyword(Keyword::Where, "WHERE".to_string()),
                Token::Word("points".to_string()),
                Token::Operator(Operator::Ge),
                Token::Number("3".to_string()),
            ]
        );
    }

    #[test]
    fn test_keywords_are_case_insensitive_and_keep_text() {
        assert_eq!(
            tokens("select Order"),
            vec![
                Token::Keyword(Keyword::Select, "select".to_string()),
                Token::Keyword(Keyword::Order, "Order".to_string()),
            ]
        );
    }

    #[test]
    fn test_quoted_strings_with_escapes() {
        assert_eq!(
            tokens(r#"'Story Points' = "it's" 'a\'b'"#),
            vec![
                Token::Quoted("Story Points".to_string()),
                Token::Operator(Operator::Eq),
                Token::Quoted("it's".to_string()),
                Token::Quoted("a'b".to_string()),
            ]
        );
    }

    #[test]
    fn test_numbers_and_dates() {
        assert_eq!(
            tokens("-3.5 2024-01-05 in-progress"),
            vec![
                Token::Number("-3.5".to_string()),
                Token::Word("2024-01-05".to_string()),
                Token::Word("in-progress".to_string()),
            ]
        );
    }

    #[test]
    fn test_this_card_property() {
        assert_eq!(
            tokens("THIS CARD.Release"),
            vec![
                Token::Keyword(Keyword::This, "THIS".to_string()),
                Token::Keyword(Keyword::Card, "CARD".to_string()),
                Token::Dot,
                Token::Word("Release".to_string()),
            ]
        );
    }

    #[test]
    fn test_not_equal_spellings() {
        assert_eq!(
            tokens("a != b <> c"),
            vec![
                Token::Word("a".to_string()),
                Token::Operator(Operator::Ne),
                Token::Word("b".to_string()),
                Token::Operator(Operator::Ne),
                Token::Word("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_positions_are_character_offsets() {
        let spanned = Lexer::tokenize("é = 'x'").unwrap();
        assert_eq!(spanned[1].position, 2);
        assert_eq!(spanned[2].position, 4);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = Lexer::tokenize("name = 'open").unwrap_err();
        assert_eq!(err, MqlError::syntax("unterminated quoted string", 7));
    }

    #[test]
    fn test_unexpected_character() {
        assert!(matches!(
            Lexer::tokenize("a = $").unwrap_err(),
            MqlError::Syntax { position: 4, .. }
        ));
    }
}
