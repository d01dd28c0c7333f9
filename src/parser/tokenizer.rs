//! SQL tokenization.
//!
//! Byte-oriented tokenizer for the SQL dialect: keywords, identifiers
//! (bare or double-quoted), integer/float/string literals, operators and
//! punctuation. Tokens carry their source span for error reporting.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::{Error, Result};

// ============================================================================
// Token Types
// ============================================================================

/// Token kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Literals
    Integer,
    Float,
    String,
    Identifier,

    // Keywords (alphabetical)
    Analyze,
    And,
    As,
    Asc,
    Autoincrement,
    Begin,
    Boolean,
    By,
    Commit,
    Count,
    Create,
    Default,
    Delete,
    Desc,
    Double,
    Drop,
    Exists,
    False,
    From,
    If,
    In,
    Index,
    Inner,
    Insert,
    Int4,
    Int8,
    Into,
    Is,
    Join,
    Key,
    Limit,
    Not,
    Now,
    Null,
    Offset,
    On,
    Or,
    Order,
    Primary,
    Real,
    Rollback,
    Select,
    Set,
    Table,
    Text,
    Timestamp,
    True,
    Unique,
    Update,
    Values,
    Varchar,
    Where,

    // Operators and punctuation
    Eq,        // =
    Ne,        // != or <>
    Lt,        // <
    Le,        // <=
    Gt,        // >
    Ge,        // >=
    Comma,     // ,
    Dot,       // .
    LParen,    // (
    RParen,    // )
    Semicolon, // ;
    Question,  // ?
    Star,      // *

    // Special
    Eof,
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, TokenKind> = {
        let mut m = HashMap::new();
        m.insert("ANALYZE", TokenKind::Analyze);
        m.insert("AND", TokenKind::And);
        m.insert("AS", TokenKind::As);
        m.insert("ASC", TokenKind::Asc);
        m.insert("AUTOINCREMENT", TokenKind::Autoincrement);
        m.insert("BEGIN", TokenKind::Begin);
        m.insert("BOOLEAN", TokenKind::Boolean);
        m.insert("BY", TokenKind::By);
        m.insert("COMMIT", TokenKind::Commit);
        m.insert("COUNT", TokenKind::Count);
        m.insert("CREATE", TokenKind::Create);
        m.insert("DEFAULT", TokenKind::Default);
        m.insert("DELETE", TokenKind::Delete);
        m.insert("DESC", TokenKind::Desc);
        m.insert("DOUBLE", TokenKind::Double);
        m.insert("DROP", TokenKind::Drop);
        m.insert("EXISTS", TokenKind::Exists);
        m.insert("FALSE", TokenKind::False);
        m.insert("FROM", TokenKind::From);
        m.insert("IF", TokenKind::If);
        m.insert("IN", TokenKind::In);
        m.insert("INDEX", TokenKind::Index);
        m.insert("INNER", TokenKind::Inner);
        m.insert("INSERT", TokenKind::Insert);
        m.insert("INT4", TokenKind::Int4);
        m.insert("INT8", TokenKind::Int8);
        m.insert("INTO", TokenKind::Into);
        m.insert("IS", TokenKind::Is);
        m.insert("JOIN", TokenKind::Join);
        m.insert("KEY", TokenKind::Key);
        m.insert("LIMIT", TokenKind::Limit);
        m.insert("NOT", TokenKind::Not);
        m.insert("NOW", TokenKind::Now);
        m.insert("NULL", TokenKind::Null);
        m.insert("OFFSET", TokenKind::Offset);
        m.insert("ON", TokenKind::On);
        m.insert("OR", TokenKind::Or);
        m.insert("ORDER", TokenKind::Order);
        m.insert("PRIMARY", TokenKind::Primary);
        m.insert("REAL", TokenKind::Real);
        m.insert("ROLLBACK", TokenKind::Rollback);
        m.insert("SELECT", TokenKind::Select);
        m.insert("SET", TokenKind::Set);
        m.insert("TABLE", TokenKind::Table);
        m.insert("TEXT", TokenKind::Text);
        m.insert("TIMESTAMP", TokenKind::Timestamp);
        m.insert("TRUE", TokenKind::True);
        m.insert("UNIQUE", TokenKind::Unique);
        m.insert("UPDATE", TokenKind::Update);
        m.insert("VALUES", TokenKind::Values);
        m.insert("VARCHAR", TokenKind::Varchar);
        m.insert("WHERE", TokenKind::Where);
        m
    };
}

/// One token with its source span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
}

impl Token {
    fn new(kind: TokenKind, start: usize, end: usize, line: u32, column: u32) -> Self {
        Token {
            kind,
            start,
            end,
            line,
            column,
        }
    }

    /// The text of this token from the source.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }

    /// The decoded value of a string literal token (quotes stripped,
    /// doubled quotes unescaped).
    pub fn string_value(&self, source: &str) -> String {
        let inner = &source[self.start + 1..self.end - 1];
        inner.replace("''", "'")
    }

    /// The text of an identifier token (double quotes stripped).
    pub fn identifier_value(&self, source: &str) -> String {
        let text = self.text(source);
        if text.starts_with('"') && text.ends_with('"') && text.len() >= 2 {
            text[1..text.len() - 1].to_string()
        } else {
            text.to_string()
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

/// Tokenize the entire source.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    Tokenizer::new(source).run()
}

struct Tokenizer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Tokenizer<'a> {
    fn new(source: &'a str) -> Self {
        Tokenizer {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            if self.is_eof() {
                tokens.push(Token::new(
                    TokenKind::Eof,
                    self.pos,
                    self.pos,
                    self.line,
                    self.column,
                ));
                return Ok(tokens);
            }
            let start = self.pos;
            let line = self.line;
            let column = self.column;
            let kind = self.scan_token()?;
            tokens.push(Token::new(kind, start, self.pos, line, column));
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn current(&self) -> u8 {
        self.bytes[self.pos]
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos + 1).copied()
    }

    fn advance(&mut self) {
        if !self.is_eof() {
            if self.current() == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.pos += 1;
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::InvalidSql(format!("{} at line {} column {}", msg, self.line, self.column))
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            while !self.is_eof() && self.current().is_ascii_whitespace() {
                self.advance();
            }
            if self.is_eof() {
                return Ok(());
            }
            if self.current() == b'-' && self.peek() == Some(b'-') {
                while !self.is_eof() && self.current() != b'\n' {
                    self.advance();
                }
                continue;
            }
            if self.current() == b'/' && self.peek() == Some(b'*') {
                self.advance();
                self.advance();
                loop {
                    if self.is_eof() {
                        return Err(self.error("unterminated block comment"));
                    }
                    if self.current() == b'*' && self.peek() == Some(b'/') {
                        self.advance();
                        self.advance();
                        break;
                    }
                    self.advance();
                }
                continue;
            }
            return Ok(());
        }
    }

    fn scan_token(&mut self) -> Result<TokenKind> {
        let c = self.current();

        if c.is_ascii_digit() {
            return self.scan_number();
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return Ok(self.scan_identifier());
        }
        if c == b'"' {
            return self.scan_quoted_identifier();
        }
        if c == b'\'' {
            return self.scan_string();
        }
        self.scan_operator()
    }

    fn scan_number(&mut self) -> Result<TokenKind> {
        while !self.is_eof() && self.current().is_ascii_digit() {
            self.advance();
        }
        if !self.is_eof() && self.current() == b'.' {
            if let Some(next) = self.peek() {
                if next.is_ascii_digit() {
                    self.advance();
                    while !self.is_eof() && self.current().is_ascii_digit() {
                        self.advance();
                    }
                    return Ok(TokenKind::Float);
                }
            }
        }
        Ok(TokenKind::Integer)
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while !self.is_eof() && (self.current().is_ascii_alphanumeric() || self.current() == b'_') {
            self.advance();
        }
        let text = &self.source[start..self.pos];
        KEYWORDS
            .get(text.to_ascii_uppercase().as_str())
            .copied()
            .unwrap_or(TokenKind::Identifier)
    }

    fn scan_quoted_identifier(&mut self) -> Result<TokenKind> {
        self.advance(); // opening quote
        loop {
            if self.is_eof() {
                return Err(self.error("unterminated quoted identifier"));
            }
            if self.current() == b'"' {
                self.advance();
                return Ok(TokenKind::Identifier);
            }
            self.advance();
        }
    }

    fn scan_string(&mut self) -> Result<TokenKind> {
        self.advance(); // opening quote
        loop {
            if self.is_eof() {
                return Err(self.error("unterminated string literal"));
            }
            if self.current() == b'\'' {
                if self.peek() == Some(b'\'') {
                    self.advance();
                    self.advance();
                    continue;
                }
                self.advance();
                return Ok(TokenKind::String);
            }
            self.advance();
        }
    }

    fn scan_operator(&mut self) -> Result<TokenKind> {
        let c = self.current();
        self.advance();
        let kind = match c {
            b'=' => TokenKind::Eq,
            b'!' => {
                if !self.is_eof() && self.current() == b'=' {
                    self.advance();
                    TokenKind::Ne
                } else {
                    return Err(self.error("unexpected '!'"));
                }
            }
            b'<' => {
                if !self.is_eof() && self.current() == b'=' {
                    self.advance();
                    TokenKind::Le
                } else if !self.is_eof() && self.current() == b'>' {
                    self.advance();
                    TokenKind::Ne
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if !self.is_eof() && self.current() == b'=' {
                    self.advance();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            b',' => TokenKind::Comma,
            b'.' => TokenKind::Dot,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b';' => TokenKind::Semicolon,
            b'?' => TokenKind::Question,
            b'*' => TokenKind::Star,
            other => {
                return Err(self.error(&format!("unexpected character '{}'", other as char)));
            }
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("SELECT name FROM users"),
            vec![
                TokenKind::Select,
                TokenKind::Identifier,
                TokenKind::From,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
        // Keywords are case-insensitive.
        assert_eq!(kinds("select")[0], TokenKind::Select);
        assert_eq!(kinds("SeLeCt")[0], TokenKind::Select);
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds("42 3.5 'it''s'"),
            vec![
                TokenKind::Integer,
                TokenKind::Float,
                TokenKind::String,
                TokenKind::Eof,
            ]
        );
        let tokens = tokenize("'it''s'").unwrap();
        assert_eq!(tokens[0].string_value("'it''s'"), "it's");
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("= != <> < <= > >= ? *"),
            vec![
                TokenKind::Eq,
                TokenKind::Ne,
                TokenKind::Ne,
                TokenKind::Lt,
                TokenKind::Le,
                TokenKind::Gt,
                TokenKind::Ge,
                TokenKind::Question,
                TokenKind::Star,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            kinds("SELECT -- trailing\n 1 /* block */ ;"),
            vec![
                TokenKind::Select,
                TokenKind::Integer,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_quoted_identifier() {
        let sql = "\"order\"";
        let tokens = tokenize(sql).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].identifier_value(sql), "order");
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("'unterminated").is_err());
        assert!(tokenize("a ! b").is_err());
        assert!(tokenize("/* open").is_err());
    }
}
