//! DELETE execution.
//!
//! Matching rows are collected first, then each is removed from the
//! clustered tree and every index tree; overflow chains owned by the row
//! are freed with it.

use crate::error::Result;
use crate::executor::insert::delete_row;
use crate::executor::update::collect_matching;
use crate::executor::QueryResult;
use crate::parser::ast::DeleteStmt;
use crate::storage::PageStore;
use crate::txn::Transaction;
use crate::types::Value;

pub fn execute_delete(
    tx: &mut Transaction,
    stmt: &DeleteStmt,
    params: &[Value],
) -> Result<QueryResult> {
    let table = tx.resolve_table(&stmt.table)?;
    let matched = collect_matching(tx, &table, &stmt.table, stmt.where_clause.as_ref(), params)?;

    let mut affected = 0u64;
    for (row_id, row) in matched {
        tx.cancel().check()?;
        delete_row(tx, &table, row_id, &row)?;
        affected += 1;
    }
    Ok(QueryResult::affecting(affected))
}
