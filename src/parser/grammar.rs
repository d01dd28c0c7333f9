//! SQL grammar.
//!
//! A recursive descent parser over the token stream, building the AST in
//! `ast`. Each statement form has its own `parse_*` method.

use crate::error::{Error, Result};
use crate::parser::ast::*;
use crate::parser::tokenizer::{tokenize, Token, TokenKind};
use crate::types::{DataType, Value};

/// SQL parser.
pub struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    placeholders: usize,
}

impl<'a> Parser<'a> {
    /// Create a new parser for the given SQL source.
    pub fn new(source: &'a str) -> Result<Self> {
        let tokens = tokenize(source)?;
        Ok(Parser {
            source,
            tokens,
            pos: 0,
            placeholders: 0,
        })
    }

    /// Parse every statement in the source.
    pub fn parse_all(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_semicolons();
            if self.is_eof() {
                if stmts.is_empty() {
                    return Err(Error::InvalidSql("empty statement".into()));
                }
                return Ok(stmts);
            }
            stmts.push(self.parse_stmt()?);
            if !self.is_eof() && !self.check(TokenKind::Semicolon) {
                return Err(self.unexpected("';' or end of input"));
            }
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.current().kind {
            TokenKind::Create => self.parse_create(),
            TokenKind::Drop => self.parse_drop(),
            TokenKind::Insert => Ok(Stmt::Insert(self.parse_insert()?)),
            TokenKind::Select => Ok(Stmt::Select(self.parse_select()?)),
            TokenKind::Update => Ok(Stmt::Update(self.parse_update()?)),
            TokenKind::Delete => Ok(Stmt::Delete(self.parse_delete()?)),
            TokenKind::Begin => {
                self.advance();
                Ok(Stmt::Begin)
            }
            TokenKind::Commit => {
                self.advance();
                Ok(Stmt::Commit)
            }
            TokenKind::Rollback => {
                self.advance();
                Ok(Stmt::Rollback)
            }
            TokenKind::Analyze => {
                self.advance();
                let target = if self.check(TokenKind::Identifier) {
                    Some(self.expect_identifier()?)
                } else {
                    None
                };
                Ok(Stmt::Analyze(target))
            }
            _ => Err(self.unexpected("statement")),
        }
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn parse_create(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Create)?;
        match self.current().kind {
            TokenKind::Table => Ok(Stmt::CreateTable(self.parse_create_table()?)),
            TokenKind::Index => Ok(Stmt::CreateIndex(self.parse_create_index()?)),
            _ => Err(self.unexpected("TABLE or INDEX")),
        }
    }

    fn parse_create_table(&mut self) -> Result<CreateTableStmt> {
        self.expect(TokenKind::Table)?;
        let if_not_exists = self.parse_if_not_exists()?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::LParen)?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_column_def()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(CreateTableStmt {
            name,
            if_not_exists,
            columns,
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_identifier()?;
        let kind = self.parse_data_type()?;
        let mut def = ColumnDef {
            name,
            kind,
            primary_key: false,
            autoincrement: false,
            unique: false,
            not_null: false,
            default: None,
        };
        loop {
            match self.current().kind {
                TokenKind::Primary => {
                    self.advance();
                    self.expect(TokenKind::Key)?;
                    def.primary_key = true;
                    if self.eat(TokenKind::Autoincrement) {
                        def.autoincrement = true;
                    }
                }
                TokenKind::Unique => {
                    self.advance();
                    def.unique = true;
                }
                TokenKind::Not => {
                    self.advance();
                    self.expect(TokenKind::Null)?;
                    def.not_null = true;
                }
                TokenKind::Null => {
                    self.advance();
                }
                TokenKind::Default => {
                    self.advance();
                    def.default = Some(self.parse_expr()?);
                }
                _ => break,
            }
        }
        Ok(def)
    }

    fn parse_data_type(&mut self) -> Result<DataType> {
        let kind = match self.current().kind {
            TokenKind::Boolean => DataType::Boolean,
            TokenKind::Int4 => DataType::Int4,
            TokenKind::Int8 => DataType::Int8,
            TokenKind::Real => DataType::Real,
            TokenKind::Double => DataType::Double,
            TokenKind::Timestamp => DataType::Timestamp,
            TokenKind::Text => DataType::Text,
            TokenKind::Varchar => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let len = self.expect_integer()?;
                self.expect(TokenKind::RParen)?;
                if len == 0 || len > 255 {
                    return Err(Error::InvalidSql(format!(
                        "VARCHAR length must be 1..=255, got {}",
                        len
                    )));
                }
                return Ok(DataType::Varchar(len as u16));
            }
            _ => return Err(self.unexpected("column type")),
        };
        self.advance();
        Ok(kind)
    }

    fn parse_create_index(&mut self) -> Result<CreateIndexStmt> {
        self.expect(TokenKind::Index)?;
        let if_not_exists = self.parse_if_not_exists()?;
        let name = if self.check(TokenKind::Identifier) {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        self.expect(TokenKind::On)?;
        let table = self.expect_identifier()?;
        self.expect(TokenKind::LParen)?;
        let column = self.expect_identifier()?;
        self.expect(TokenKind::RParen)?;
        Ok(CreateIndexStmt {
            name,
            if_not_exists,
            table,
            column,
        })
    }

    fn parse_drop(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Drop)?;
        match self.current().kind {
            TokenKind::Table => {
                self.advance();
                let name = self.expect_identifier()?;
                Ok(Stmt::DropTable(DropStmt { name }))
            }
            TokenKind::Index => {
                self.advance();
                let name = self.expect_identifier()?;
                Ok(Stmt::DropIndex(DropStmt { name }))
            }
            _ => Err(self.unexpected("TABLE or INDEX")),
        }
    }

    fn parse_if_not_exists(&mut self) -> Result<bool> {
        if self.eat(TokenKind::If) {
            self.expect(TokenKind::Not)?;
            self.expect(TokenKind::Exists)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ------------------------------------------------------------------
    // DML
    // ------------------------------------------------------------------

    fn parse_insert(&mut self) -> Result<InsertStmt> {
        self.expect(TokenKind::Insert)?;
        self.expect(TokenKind::Into)?;
        let table = self.expect_identifier()?;

        let mut columns = Vec::new();
        if self.eat(TokenKind::LParen) {
            loop {
                columns.push(self.expect_identifier()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }

        self.expect(TokenKind::Values)?;
        let mut rows = Vec::new();
        loop {
            self.expect(TokenKind::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_expr()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            rows.push(row);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(InsertStmt {
            table,
            columns,
            rows,
        })
    }

    fn parse_select(&mut self) -> Result<SelectStmt> {
        self.expect(TokenKind::Select)?;

        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_result_column()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::From)?;
        let from = self.parse_table_ref()?;

        let mut joins = Vec::new();
        while self.check(TokenKind::Inner) || self.check(TokenKind::Join) {
            self.eat(TokenKind::Inner);
            self.expect(TokenKind::Join)?;
            let table = self.parse_table_ref()?;
            self.expect(TokenKind::On)?;
            let left = self.parse_column_ref()?;
            self.expect(TokenKind::Eq)?;
            let right = self.parse_column_ref()?;
            joins.push(JoinClause { table, left, right });
        }

        let where_clause = self.parse_where_opt()?;

        let mut order_by = Vec::new();
        if self.eat(TokenKind::Order) {
            self.expect(TokenKind::By)?;
            loop {
                let column = self.parse_column_ref()?;
                let order = if self.eat(TokenKind::Desc) {
                    SortOrder::Desc
                } else {
                    self.eat(TokenKind::Asc);
                    SortOrder::Asc
                };
                order_by.push(OrderingTerm { column, order });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }

        let limit = if self.eat(TokenKind::Limit) {
            Some(self.expect_integer()?)
        } else {
            None
        };
        let offset = if self.eat(TokenKind::Offset) {
            Some(self.expect_integer()?)
        } else {
            None
        };

        Ok(SelectStmt {
            columns,
            from,
            joins,
            where_clause,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_result_column(&mut self) -> Result<ResultColumn> {
        if self.eat(TokenKind::Star) {
            return Ok(ResultColumn::Star);
        }
        if self.eat(TokenKind::Count) {
            self.expect(TokenKind::LParen)?;
            self.expect(TokenKind::Star)?;
            self.expect(TokenKind::RParen)?;
            let alias = self.parse_alias_opt()?;
            return Ok(ResultColumn::CountStar { alias });
        }
        let column = self.parse_column_ref()?;
        let alias = self.parse_alias_opt()?;
        Ok(ResultColumn::Column { column, alias })
    }

    fn parse_alias_opt(&mut self) -> Result<Option<String>> {
        if self.eat(TokenKind::As) {
            Ok(Some(self.expect_identifier()?))
        } else {
            Ok(None)
        }
    }

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let name = self.expect_identifier()?;
        let alias = if self.eat(TokenKind::As) {
            Some(self.expect_identifier()?)
        } else if self.check(TokenKind::Identifier) {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        Ok(TableRef { name, alias })
    }

    fn parse_column_ref(&mut self) -> Result<ColumnRef> {
        let first = self.expect_identifier()?;
        if self.eat(TokenKind::Dot) {
            let column = self.expect_identifier()?;
            Ok(ColumnRef {
                table: Some(first),
                column,
            })
        } else {
            Ok(ColumnRef {
                table: None,
                column: first,
            })
        }
    }

    fn parse_update(&mut self) -> Result<UpdateStmt> {
        self.expect(TokenKind::Update)?;
        let table = self.expect_identifier()?;
        self.expect(TokenKind::Set)?;
        let mut assignments = Vec::new();
        loop {
            let column = self.expect_identifier()?;
            self.expect(TokenKind::Eq)?;
            let value = self.parse_expr()?;
            assignments.push((column, value));
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let where_clause = self.parse_where_opt()?;
        Ok(UpdateStmt {
            table,
            assignments,
            where_clause,
        })
    }

    fn parse_delete(&mut self) -> Result<DeleteStmt> {
        self.expect(TokenKind::Delete)?;
        self.expect(TokenKind::From)?;
        let table = self.expect_identifier()?;
        let where_clause = self.parse_where_opt()?;
        Ok(DeleteStmt {
            table,
            where_clause,
        })
    }

    // ------------------------------------------------------------------
    // WHERE
    // ------------------------------------------------------------------

    fn parse_where_opt(&mut self) -> Result<Option<WhereClause>> {
        if !self.eat(TokenKind::Where) {
            return Ok(None);
        }
        let mut or_groups = Vec::new();
        loop {
            let mut group = vec![self.parse_condition()?];
            while self.eat(TokenKind::And) {
                group.push(self.parse_condition()?);
            }
            or_groups.push(group);
            if !self.eat(TokenKind::Or) {
                break;
            }
        }
        Ok(Some(WhereClause { or_groups }))
    }

    fn parse_condition(&mut self) -> Result<Condition> {
        let field = self.parse_column_ref()?;

        if self.eat(TokenKind::Is) {
            let negated = self.eat(TokenKind::Not);
            self.expect(TokenKind::Null)?;
            return Ok(Condition {
                field,
                op: if negated {
                    CmpOp::IsNotNull
                } else {
                    CmpOp::IsNull
                },
                operand: CondOperand::None,
            });
        }

        if self.check(TokenKind::In) || self.check(TokenKind::Not) {
            let negated = self.eat(TokenKind::Not);
            self.expect(TokenKind::In)?;
            self.expect(TokenKind::LParen)?;
            let mut list = Vec::new();
            loop {
                list.push(self.parse_expr()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            return Ok(Condition {
                field,
                op: if negated { CmpOp::NotIn } else { CmpOp::In },
                operand: CondOperand::List(list),
            });
        }

        let op = match self.current().kind {
            TokenKind::Eq => CmpOp::Eq,
            TokenKind::Ne => CmpOp::Ne,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::Le => CmpOp::Le,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::Ge => CmpOp::Ge,
            _ => return Err(self.unexpected("comparison operator")),
        };
        self.advance();
        let operand = CondOperand::Expr(self.parse_expr()?);
        Ok(Condition { field, op, operand })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr> {
        let token = *self.current();
        match token.kind {
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal(Value::Boolean(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal(Value::Boolean(false)))
            }
            TokenKind::Integer => {
                self.advance();
                let text = token.text(self.source);
                let v: i64 = text
                    .parse()
                    .map_err(|_| Error::InvalidSql(format!("integer out of range: {}", text)))?;
                Ok(Expr::Literal(Value::Int8(v)))
            }
            TokenKind::Float => {
                self.advance();
                let text = token.text(self.source);
                let v: f64 = text
                    .parse()
                    .map_err(|_| Error::InvalidSql(format!("bad numeric literal: {}", text)))?;
                Ok(Expr::Literal(Value::Double(v)))
            }
            TokenKind::String => {
                self.advance();
                Ok(Expr::Literal(Value::Text(token.string_value(self.source))))
            }
            TokenKind::Question => {
                self.advance();
                let idx = self.placeholders;
                self.placeholders += 1;
                Ok(Expr::Placeholder(idx))
            }
            TokenKind::Now => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Now)
            }
            _ => Err(self.unexpected("value expression")),
        }
    }

    // ------------------------------------------------------------------
    // Token stream helpers
    // ------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn is_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("{:?}", kind)))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        let token = *self.current();
        if token.kind != TokenKind::Identifier {
            return Err(self.unexpected("identifier"));
        }
        self.advance();
        Ok(token.identifier_value(self.source))
    }

    fn expect_integer(&mut self) -> Result<u64> {
        let token = *self.current();
        if token.kind != TokenKind::Integer {
            return Err(self.unexpected("integer"));
        }
        self.advance();
        token
            .text(self.source)
            .parse()
            .map_err(|_| Error::InvalidSql("integer out of range".into()))
    }

    fn skip_semicolons(&mut self) {
        while self.eat(TokenKind::Semicolon) {}
    }

    fn unexpected(&self, expected: &str) -> Error {
        let token = self.current();
        Error::InvalidSql(format!(
            "expected {} but found '{}' at line {} column {}",
            expected,
            if token.kind == TokenKind::Eof {
                "<eof>"
            } else {
                token.text(self.source)
            },
            token.line,
            token.column
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_create_table() {
        let stmts = parse(
            "CREATE TABLE IF NOT EXISTS t (\
             id INT8 PRIMARY KEY AUTOINCREMENT, \
             name VARCHAR(16) NOT NULL, \
             email VARCHAR(255) UNIQUE, \
             bio TEXT, \
             joined TIMESTAMP DEFAULT NOW())",
        )
        .unwrap();
        let Stmt::CreateTable(ct) = &stmts[0] else {
            panic!("expected CREATE TABLE");
        };
        assert!(ct.if_not_exists);
        assert_eq!(ct.name, "t");
        assert_eq!(ct.columns.len(), 5);
        assert!(ct.columns[0].primary_key && ct.columns[0].autoincrement);
        assert!(ct.columns[1].not_null);
        assert_eq!(ct.columns[1].kind, DataType::Varchar(16));
        assert!(ct.columns[2].unique);
        assert_eq!(ct.columns[4].default, Some(Expr::Now));
    }

    #[test]
    fn test_varchar_bounds() {
        assert!(parse("CREATE TABLE t (a VARCHAR(0))").is_err());
        assert!(parse("CREATE TABLE t (a VARCHAR(256))").is_err());
        assert!(parse("CREATE TABLE t (a VARCHAR(255))").is_ok());
    }

    #[test]
    fn test_insert_multi_row() {
        let stmts = parse("INSERT INTO t(a, b) VALUES (1, 'x'), (2, ?)").unwrap();
        let Stmt::Insert(ins) = &stmts[0] else {
            panic!();
        };
        assert_eq!(ins.columns, vec!["a", "b"]);
        assert_eq!(ins.rows.len(), 2);
        assert_eq!(ins.rows[0][0], Expr::Literal(Value::Int8(1)));
        assert_eq!(ins.rows[1][1], Expr::Placeholder(0));
    }

    #[test]
    fn test_select_with_everything() {
        let stmts = parse(
            "SELECT u.name AS n, o.id FROM users AS u \
             INNER JOIN orders o ON u.id = o.user_id \
             WHERE u.age >= 21 AND o.total > 5 OR u.vip = TRUE \
             ORDER BY u.id ASC, o.id DESC LIMIT 10 OFFSET 2",
        )
        .unwrap();
        let Stmt::Select(sel) = &stmts[0] else {
            panic!();
        };
        assert_eq!(sel.from.binding(), "u");
        assert_eq!(sel.joins.len(), 1);
        assert_eq!(sel.joins[0].table.binding(), "o");
        let wc = sel.where_clause.as_ref().unwrap();
        assert_eq!(wc.or_groups.len(), 2);
        assert_eq!(wc.or_groups[0].len(), 2);
        assert_eq!(sel.order_by.len(), 2);
        assert_eq!(sel.order_by[1].order, SortOrder::Desc);
        assert_eq!(sel.limit, Some(10));
        assert_eq!(sel.offset, Some(2));
    }

    #[test]
    fn test_count_star() {
        let stmts = parse("SELECT COUNT(*) AS total FROM t").unwrap();
        let Stmt::Select(sel) = &stmts[0] else {
            panic!();
        };
        assert_eq!(
            sel.columns[0],
            ResultColumn::CountStar {
                alias: Some("total".into())
            }
        );
    }

    #[test]
    fn test_where_null_and_in() {
        let stmts =
            parse("SELECT * FROM t WHERE a IS NOT NULL AND b IN (1, 2) AND c NOT IN (?)").unwrap();
        let Stmt::Select(sel) = &stmts[0] else {
            panic!();
        };
        let group = sel.where_clause.as_ref().unwrap().single_group().unwrap();
        assert_eq!(group[0].op, CmpOp::IsNotNull);
        assert_eq!(group[1].op, CmpOp::In);
        assert_eq!(group[2].op, CmpOp::NotIn);
    }

    #[test]
    fn test_update_delete() {
        let stmts = parse("UPDATE t SET a = 1, b = ? WHERE id = 3; DELETE FROM t").unwrap();
        assert_eq!(stmts.len(), 2);
        let Stmt::Update(up) = &stmts[0] else {
            panic!();
        };
        assert_eq!(up.assignments.len(), 2);
        assert!(matches!(&stmts[1], Stmt::Delete(d) if d.where_clause.is_none()));
    }

    #[test]
    fn test_transaction_and_analyze() {
        let stmts = parse("BEGIN; COMMIT; ROLLBACK; ANALYZE; ANALYZE t").unwrap();
        assert_eq!(
            stmts,
            vec![
                Stmt::Begin,
                Stmt::Commit,
                Stmt::Rollback,
                Stmt::Analyze(None),
                Stmt::Analyze(Some("t".into())),
            ]
        );
    }

    #[test]
    fn test_create_drop_index() {
        let stmts =
            parse("CREATE INDEX ON orders (user_id); DROP INDEX key__orders__user_id").unwrap();
        let Stmt::CreateIndex(ci) = &stmts[0] else {
            panic!();
        };
        assert_eq!(ci.name, None);
        assert_eq!(ci.table, "orders");
        assert_eq!(ci.column, "user_id");
        assert!(matches!(&stmts[1], Stmt::DropIndex(d) if d.name == "key__orders__user_id"));
    }

    #[test]
    fn test_placeholders_number_across_statement() {
        let stmts = parse("INSERT INTO t(a, b, c) VALUES (?, ?, ?)").unwrap();
        let Stmt::Insert(ins) = &stmts[0] else {
            panic!();
        };
        assert_eq!(
            ins.rows[0],
            vec![
                Expr::Placeholder(0),
                Expr::Placeholder(1),
                Expr::Placeholder(2)
            ]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("SELECT FROM t").is_err());
        assert!(parse("INSERT t VALUES (1)").is_err());
        assert!(parse("CREATE TABLE t (a BADTYPE)").is_err());
        assert!(parse("SELECT * FROM t WHERE (a = 1 OR b = 2) AND c = 3").is_err());
    }
}
