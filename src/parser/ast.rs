//! Abstract Syntax Tree.
//!
//! AST nodes for the SQL dialect. WHERE clauses are kept in the executor's
//! two-level shape: OR-joined groups of AND-joined conditions, each
//! condition a `(field, operator, operand)` triple.

use crate::types::{DataType, Value};

// ============================================================================
// Statements
// ============================================================================

/// Top-level SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    CreateTable(CreateTableStmt),
    CreateIndex(CreateIndexStmt),
    DropTable(DropStmt),
    DropIndex(DropStmt),
    Insert(InsertStmt),
    Select(SelectStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    Begin,
    Commit,
    Rollback,
    /// Placeholder statement; parsed and accepted, executes as a no-op.
    Analyze(Option<String>),
}

/// One column of a CREATE TABLE.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: DataType,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub unique: bool,
    pub not_null: bool,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStmt {
    pub name: String,
    pub if_not_exists: bool,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStmt {
    /// Explicit index name; auto-generated (`key__<table>__<col>`) if None.
    pub name: Option<String>,
    pub if_not_exists: bool,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropStmt {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    /// Explicit column list; empty means "all columns in order".
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub where_clause: Option<WhereClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub where_clause: Option<WhereClause>,
}

// ============================================================================
// SELECT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub columns: Vec<ResultColumn>,
    pub from: TableRef,
    pub joins: Vec<JoinClause>,
    pub where_clause: Option<WhereClause>,
    pub order_by: Vec<OrderingTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultColumn {
    /// `*`
    Star,
    /// `COUNT(*) [AS alias]`
    CountStar { alias: Option<String> },
    /// `col` or `alias.col` `[AS alias]`
    Column {
        column: ColumnRef,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// The name rows of this table are addressed by in the statement.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// `INNER JOIN <table> [AS alias] ON <left> = <right>`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub table: TableRef,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderingTerm {
    pub column: ColumnRef,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// A possibly-qualified column reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn unqualified(column: impl Into<String>) -> Self {
        ColumnRef {
            table: None,
            column: column.into(),
        }
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.table {
            Some(t) => write!(f, "{}.{}", t, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

// ============================================================================
// WHERE
// ============================================================================

/// Two-level predicate: OR across groups, AND within a group.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClause {
    pub or_groups: Vec<Vec<Condition>>,
}

impl WhereClause {
    /// The single AND group, when the clause has no OR.
    pub fn single_group(&self) -> Option<&[Condition]> {
        match self.or_groups.as_slice() {
            [group] => Some(group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: ColumnRef,
    pub op: CmpOp,
    pub operand: CondOperand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CondOperand {
    Expr(Expr),
    List(Vec<Expr>),
    /// IS NULL / IS NOT NULL take no operand.
    None,
}

// ============================================================================
// Expressions
// ============================================================================

/// Value-position expression: a literal, a `?` placeholder, or `NOW()`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// 0-based placeholder index, numbered in order of appearance.
    Placeholder(usize),
    Now,
}
