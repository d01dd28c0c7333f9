//! SELECT execution.
//!
//! Pipeline: choose an access path for the base table, join inner tables
//! (index-nested-loop when the join column is indexed, naive nested loop
//! otherwise), re-apply the full WHERE predicate, then ORDER BY, OFFSET,
//! LIMIT and projection. `COUNT(*)` short-circuits projection.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::executor::plan::{choose_path, fetch_row, scan_table, AccessPath};
use crate::executor::where_clause::{
    compare_values, eval_where, materialize, resolve_column, sort_cmp, Binding, RowTuple,
};
use crate::executor::QueryResult;
use crate::parser::ast::{JoinClause, ResultColumn, SelectStmt, SortOrder};
use crate::schema::TableSchema;
use crate::storage::btree::{key, BTree};
use crate::storage::PageStore;
use crate::txn::Transaction;
use crate::types::{DataType, RowId, Value};

/// Execute a SELECT, producing a fully materialised result.
pub fn execute_select(
    tx: &mut Transaction,
    stmt: &SelectStmt,
    params: &[Value],
) -> Result<QueryResult> {
    // Bind the FROM table and every joined table.
    let base = tx.resolve_table(&stmt.from.name)?;
    let mut bindings = vec![Binding {
        name: stmt.from.binding().to_string(),
        table: base.clone(),
    }];
    for join in &stmt.joins {
        let table = tx.resolve_table(&join.table.name)?;
        let name = join.table.binding().to_string();
        if bindings.iter().any(|b| b.name == name) {
            return Err(Error::InvalidSql(format!(
                "duplicate table name or alias '{}'",
                name
            )));
        }
        bindings.push(Binding { name, table });
    }

    // Base rows along the chosen access path.
    let path = choose_path(&base, &bindings[0].name, stmt.where_clause.as_ref(), params)?;
    let mut tuples: Vec<RowTuple> = scan_table(tx, &base, &path)?
        .into_iter()
        .map(|(_, row)| vec![row])
        .collect();

    // Joins, left to right.
    for (i, join) in stmt.joins.iter().enumerate() {
        tuples = execute_join(tx, &bindings, i + 1, join, tuples)?;
    }

    // Residual WHERE. The access path only narrowed the base table; the
    // full predicate is re-evaluated per tuple.
    if let Some(clause) = &stmt.where_clause {
        let mut kept = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            tx.cancel().check()?;
            if eval_where(tx, &bindings, &tuple, clause, params)? {
                kept.push(tuple);
            }
        }
        tuples = kept;
    }

    // COUNT(*) produces a single INT8 row.
    if let [ResultColumn::CountStar { alias }] = stmt.columns.as_slice() {
        let name = alias.clone().unwrap_or_else(|| "count".to_string());
        let count = tuples.len() as i64;
        let rows = apply_window(vec![vec![Value::Int8(count)]], stmt);
        return Ok(QueryResult {
            columns: vec![name],
            rows,
            ..QueryResult::default()
        });
    }
    if stmt
        .columns
        .iter()
        .any(|c| matches!(c, ResultColumn::CountStar { .. }))
    {
        return Err(Error::InvalidSql(
            "COUNT(*) cannot be combined with other result columns".into(),
        ));
    }

    // ORDER BY: stable in-memory sort. Long text in a sort column is
    // resolved up front so the comparator stays pure.
    if !stmt.order_by.is_empty() {
        let mut terms = Vec::with_capacity(stmt.order_by.len());
        for term in &stmt.order_by {
            let (b_idx, c_idx) = resolve_order_target(&bindings, &stmt.columns, &term.column)?;
            terms.push((b_idx, c_idx, term.order));
        }
        for tuple in &mut tuples {
            for (b_idx, c_idx, _) in &terms {
                let value = materialize(tx, &tuple[*b_idx][*c_idx])?;
                tuple[*b_idx][*c_idx] = value;
            }
        }
        tuples.sort_by(|a, b| {
            for (b_idx, c_idx, order) in &terms {
                let ordering = sort_cmp(&a[*b_idx][*c_idx], &b[*b_idx][*c_idx]);
                let ordering = match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let tuples = apply_window(tuples, stmt);

    // Projection, in the requested column order.
    let mut columns = Vec::new();
    let mut selectors: Vec<(usize, usize)> = Vec::new();
    for result_column in &stmt.columns {
        match result_column {
            ResultColumn::Star => {
                for (b_idx, binding) in bindings.iter().enumerate() {
                    for (c_idx, column) in binding.table.columns.iter().enumerate() {
                        columns.push(column.name.clone());
                        selectors.push((b_idx, c_idx));
                    }
                }
            }
            ResultColumn::Column { column, alias } => {
                let (b_idx, c_idx, _) = resolve_column(&bindings, column)?;
                columns.push(alias.clone().unwrap_or_else(|| column.column.clone()));
                selectors.push((b_idx, c_idx));
            }
            ResultColumn::CountStar { .. } => unreachable!("handled above"),
        }
    }

    let mut rows = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        tx.cancel().check()?;
        let mut row = Vec::with_capacity(selectors.len());
        for (b_idx, c_idx) in &selectors {
            row.push(materialize(tx, &tuple[*b_idx][*c_idx])?);
        }
        rows.push(row);
    }

    Ok(QueryResult {
        columns,
        rows,
        ..QueryResult::default()
    })
}

/// ORDER BY names resolve against output aliases first, then against the
/// visible table columns.
fn resolve_order_target(
    bindings: &[Binding],
    columns: &[ResultColumn],
    column: &crate::parser::ast::ColumnRef,
) -> Result<(usize, usize)> {
    if column.table.is_none() {
        for result_column in columns {
            if let ResultColumn::Column {
                column: out,
                alias: Some(alias),
            } = result_column
            {
                if alias == &column.column {
                    let (b_idx, c_idx, _) = resolve_column(bindings, out)?;
                    return Ok((b_idx, c_idx));
                }
            }
        }
    }
    let (b_idx, c_idx, _) = resolve_column(bindings, column)?;
    Ok((b_idx, c_idx))
}

fn apply_window<T>(mut rows: Vec<T>, stmt: &SelectStmt) -> Vec<T> {
    if let Some(offset) = stmt.offset {
        let offset = (offset as usize).min(rows.len());
        rows.drain(..offset);
    }
    if let Some(limit) = stmt.limit {
        rows.truncate(limit as usize);
    }
    rows
}

/// Join the accumulated tuples with one inner table.
fn execute_join(
    tx: &mut Transaction,
    bindings: &[Binding],
    inner_idx: usize,
    join: &JoinClause,
    tuples: Vec<RowTuple>,
) -> Result<Vec<RowTuple>> {
    let visible = &bindings[..=inner_idx];

    // Work out which side of the ON equality names the inner table.
    let left = resolve_column(visible, &join.left)?;
    let right = resolve_column(visible, &join.right)?;
    let ((outer_b, outer_c, _), (_, inner_c, inner_kind)) = if left.0 == inner_idx {
        (right, left)
    } else if right.0 == inner_idx {
        (left, right)
    } else {
        return Err(Error::InvalidSql(format!(
            "join condition does not reference {}",
            bindings[inner_idx].name
        )));
    };
    if outer_b == inner_idx {
        return Err(Error::InvalidSql(
            "join condition references only the joined table".into(),
        ));
    }

    let inner_table = bindings[inner_idx].table.clone();
    let inner_column = inner_table.columns[inner_c].name.clone();
    let probe = probe_strategy(&inner_table, &inner_column);
    // The naive path scans the inner table once and filters per tuple.
    let prefetched = match probe {
        Probe::Nested => Some(scan_table(tx, &inner_table, &AccessPath::FullScan)?),
        _ => None,
    };

    let mut joined = Vec::new();
    for tuple in tuples {
        tx.cancel().check()?;
        let outer_value = materialize(tx, &tuple[outer_b][outer_c])?;
        if outer_value.is_null() {
            continue;
        }
        let matches: Vec<Vec<Value>> = match &probe {
            Probe::RowId => {
                let Some(row_id) = outer_value.as_row_id() else {
                    continue;
                };
                fetch_row(tx, &inner_table, row_id)?.into_iter().collect()
            }
            Probe::Index { root, width } => {
                let coerced = outer_value.coerce_to(inner_kind)?;
                let prefix = key::encode_index_prefix(&[inner_kind], &[coerced])?;
                let row_ids: Vec<RowId> = {
                    let mut tree = BTree::new(tx, *root, *width);
                    let mut cursor = tree.cursor_seek(&prefix)?;
                    let mut ids = Vec::new();
                    while let Some(cell) = tree.cursor_next(&mut cursor)? {
                        if !cell.key.starts_with(&prefix) {
                            break;
                        }
                        ids.push(key::index_key_row_id(&cell.key)?);
                    }
                    ids
                };
                let mut rows = Vec::with_capacity(row_ids.len());
                for row_id in row_ids {
                    if let Some(row) = fetch_row(tx, &inner_table, row_id)? {
                        rows.push(row);
                    }
                }
                rows
            }
            Probe::Nested => {
                let mut rows = Vec::new();
                for (_, row) in prefetched.as_ref().into_iter().flatten() {
                    let inner_value = &row[inner_c];
                    if inner_value.is_null() {
                        continue;
                    }
                    if compare_values(&outer_value, inner_value)? == Some(Ordering::Equal) {
                        rows.push(row.clone());
                    }
                }
                rows
            }
        };
        for inner_row in matches {
            let mut extended = tuple.clone();
            extended.push(inner_row);
            joined.push(extended);
        }
    }
    Ok(joined)
}

enum Probe {
    /// The join column is the inner table's integer primary key.
    RowId,
    /// The inner table has an index on the join column.
    Index { root: crate::types::PageId, width: usize },
    /// No index; scan and filter.
    Nested,
}

fn probe_strategy(inner: &TableSchema, column: &str) -> Probe {
    if let Some((_, pk)) = inner.primary_key() {
        if pk.name == column && matches!(pk.kind, DataType::Int4 | DataType::Int8) {
            return Probe::RowId;
        }
    }
    if let Some(index) = inner.index_on_column(column) {
        return Probe::Index {
            root: index.root_page,
            width: inner.index_key_width(index),
        };
    }
    Probe::Nested
}
