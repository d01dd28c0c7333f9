//! SQL parser: tokenization, AST, and a recursive-descent grammar.

pub mod ast;
pub mod grammar;
pub mod tokenizer;

use crate::error::Result;

/// Parse a SQL string into its statements.
pub fn parse(sql: &str) -> Result<Vec<ast::Stmt>> {
    grammar::Parser::new(sql)?.parse_all()
}
