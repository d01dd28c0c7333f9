//! UPDATE execution.
//!
//! Matching rows are collected first, then rewritten one by one. A change
//! to an integer primary key moves the row (delete + re-insert under the
//! new row id, rejected when the key is taken); otherwise the row is
//! rewritten in place and only the indexes whose key columns changed are
//! maintained.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::executor::insert::{check_unique, delete_row, index_entry_key, insert_full_row, spill_long_text};
use crate::executor::plan::{choose_path, scan_table};
use crate::executor::where_clause::{compare_values, eval_where, Binding};
use crate::executor::{eval_expr, QueryResult};
use crate::parser::ast::UpdateStmt;
use crate::storage::btree::{key, BTree};
use crate::storage::page::MAX_ROW_PAYLOAD;
use crate::storage::record;
use crate::storage::PageStore;
use crate::txn::Transaction;
use crate::types::{DataType, RowId, Value};

pub fn execute_update(
    tx: &mut Transaction,
    stmt: &UpdateStmt,
    params: &[Value],
) -> Result<QueryResult> {
    let table = tx.resolve_table(&stmt.table)?;

    let mut targets: Vec<usize> = Vec::with_capacity(stmt.assignments.len());
    for (name, _) in &stmt.assignments {
        let c_idx = table
            .column_index(name)
            .ok_or_else(|| Error::ColumnUnknown { name: name.clone() })?;
        if targets.contains(&c_idx) {
            return Err(Error::InvalidSql(format!("column {} assigned twice", name)));
        }
        targets.push(c_idx);
    }

    let matched = collect_matching(tx, &table, &stmt.table, stmt.where_clause.as_ref(), params)?;

    let mut affected = 0u64;
    for (row_id, old_row) in matched {
        tx.cancel().check()?;

        let mut new_row = old_row.clone();
        for (&c_idx, (_, value_expr)) in targets.iter().zip(&stmt.assignments) {
            let column = &table.columns[c_idx];
            let value = eval_expr(value_expr, params)?;
            let value = if value.is_null() {
                Value::Null
            } else {
                value.coerce_to(column.kind)?
            };
            if value.is_null() && column.not_null {
                return Err(Error::TypeMismatch(format!(
                    "column {} is NOT NULL",
                    column.name
                )));
            }
            new_row[c_idx] = value;
        }

        // An integer primary key is the row id: changing it moves the row.
        if let Some((pk_idx, pk_col)) = table.primary_key() {
            let pk_is_rowid = matches!(pk_col.kind, DataType::Int4 | DataType::Int8);
            if pk_is_rowid
                && targets.contains(&pk_idx)
                && !values_equal(&old_row[pk_idx], &new_row[pk_idx])?
            {
                let new_row_id = new_row[pk_idx].as_row_id().ok_or_else(|| {
                    Error::TypeMismatch(format!(
                        "primary key {} must be a non-negative integer",
                        pk_col.name
                    ))
                })?;
                delete_row(tx, &table, row_id, &old_row)?;
                insert_full_row(tx, &table, new_row_id, new_row)?;
                table.observe_row_id(new_row_id);
                affected += 1;
                continue;
            }
        }

        // Indexes whose key column changed get their entry swapped, with
        // the unique check first. An unchanged key has nothing to do.
        for index in &table.indexes {
            let Some(c_idx) = table.column_index(&index.column) else {
                continue;
            };
            if !targets.contains(&c_idx) || values_equal(&old_row[c_idx], &new_row[c_idx])? {
                continue;
            }
            if index.kind.is_unique() {
                check_unique(tx, &table, index, &new_row)?;
            }
            let old_key = index_entry_key(&table, index, &old_row, row_id)?;
            let new_key = index_entry_key(&table, index, &new_row, row_id)?;
            let mut tree = BTree::new(tx, index.root_page, table.index_key_width(index));
            tree.delete(&old_key)?;
            tree.insert(&new_key, row_id.to_le_bytes().to_vec())?;
        }

        // Rewrite the clustered entry in place. Overflow chains behind
        // replaced text values are freed before the new image is written.
        for &c_idx in &targets {
            if let Value::TextRef(r) = &old_row[c_idx] {
                record::free_overflow(tx, r.first_page)?;
            }
        }
        spill_long_text(tx, &mut new_row)?;
        let payload = record::encode_row(&table.kinds(), &new_row)?;
        if payload.len() > MAX_ROW_PAYLOAD {
            return Err(Error::RowTooLarge {
                size: payload.len(),
                max: MAX_ROW_PAYLOAD,
            });
        }
        let mut tree = BTree::new(tx, table.root_page, 8);
        tree.insert(&key::encode_row_id(row_id), payload)?;
        affected += 1;
    }

    Ok(QueryResult::affecting(affected))
}

fn values_equal(a: &Value, b: &Value) -> Result<bool> {
    if a.is_null() && b.is_null() {
        return Ok(true);
    }
    if a.is_null() != b.is_null() {
        return Ok(false);
    }
    if matches!(a, Value::TextRef(_)) || matches!(b, Value::TextRef(_)) {
        // Overflow-backed text never reaches index columns; for the row
        // image a pointer counts as changed.
        return Ok(a == b);
    }
    Ok(compare_values(a, b)? == Some(Ordering::Equal))
}

/// Rows matching the statement's WHERE clause, via the planned path.
pub(crate) fn collect_matching(
    tx: &mut Transaction,
    table: &std::sync::Arc<crate::schema::TableSchema>,
    binding_name: &str,
    clause: Option<&crate::parser::ast::WhereClause>,
    params: &[Value],
) -> Result<Vec<(RowId, Vec<Value>)>> {
    let path = choose_path(table, binding_name, clause, params)?;
    let candidates = scan_table(tx, table, &path)?;
    let Some(clause) = clause else {
        return Ok(candidates);
    };
    let bindings = [Binding {
        name: binding_name.to_string(),
        table: table.clone(),
    }];
    let mut matched = Vec::new();
    for (row_id, row) in candidates {
        tx.cancel().check()?;
        let tuple = vec![row];
        if eval_where(tx, &bindings, &tuple, clause, params)? {
            let [row] = <[Vec<Value>; 1]>::try_from(tuple)
                .map_err(|_| Error::corrupt("tuple arity"))?;
            matched.push((row_id, row));
        }
    }
    Ok(matched)
}
