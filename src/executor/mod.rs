//! Statement execution.
//!
//! Statements compile into direct B+ tree operations: DDL allocates roots
//! and writes catalog rows, DML plans an access path (index seek, row-id
//! range, or full scan) and drives the table and index trees through the
//! transaction's page store. Transaction control statements never reach
//! this layer; the connection owns them.

pub mod ddl;
pub mod delete;
pub mod insert;
pub mod plan;
pub mod select;
pub mod update;
pub mod where_clause;

use crate::error::{Error, Result};
use crate::parser::ast::{Expr, Stmt};
use crate::txn::Transaction;
use crate::types::{now_timestamp, RowId, Value};

/// Result of one executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Output column names; empty for statements that produce no rows.
    pub columns: Vec<String>,
    /// Output rows in production order.
    pub rows: Vec<Vec<Value>>,
    /// Rows inserted/updated/deleted.
    pub rows_affected: u64,
    /// Row id of the last inserted row, when the statement inserted any.
    pub last_insert_row_id: Option<RowId>,
}

impl QueryResult {
    pub fn empty() -> Self {
        QueryResult::default()
    }

    pub fn affecting(rows_affected: u64) -> Self {
        QueryResult {
            rows_affected,
            ..QueryResult::default()
        }
    }
}

/// Execute one data or schema statement inside `tx`.
pub fn execute_stmt(tx: &mut Transaction, stmt: &Stmt, params: &[Value]) -> Result<QueryResult> {
    match stmt {
        Stmt::CreateTable(create) => ddl::execute_create_table(tx, create),
        Stmt::CreateIndex(create) => ddl::execute_create_index(tx, create),
        Stmt::DropTable(drop) => ddl::execute_drop_table(tx, drop),
        Stmt::DropIndex(drop) => ddl::execute_drop_index(tx, drop),
        Stmt::Insert(insert) => insert::execute_insert(tx, insert, params),
        Stmt::Select(select) => select::execute_select(tx, select, params),
        Stmt::Update(update) => update::execute_update(tx, update, params),
        Stmt::Delete(delete) => delete::execute_delete(tx, delete, params),
        Stmt::Analyze(_) => Ok(QueryResult::empty()),
        Stmt::Begin | Stmt::Commit | Stmt::Rollback => Err(Error::InvalidSql(
            "transaction control is handled by the connection".into(),
        )),
    }
}

/// Evaluate a value-position expression against the bound parameters.
pub fn eval_expr(expr: &Expr, params: &[Value]) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Placeholder(idx) => params.get(*idx).cloned().ok_or_else(|| {
            Error::InvalidSql(format!("no value bound for placeholder {}", idx + 1))
        }),
        Expr::Now => Ok(Value::Timestamp(now_timestamp())),
    }
}
