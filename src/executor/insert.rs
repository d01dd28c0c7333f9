//! INSERT execution and shared row/index maintenance.
//!
//! Inserting a row resolves column positions, applies DEFAULTs (including
//! `NOW()`), assigns the row id (autoincrement, or the explicit integer
//! primary key), spills long text, enforces unique indexes, and writes
//! the clustered tree plus one entry per index. UPDATE and DELETE reuse
//! the maintenance helpers here.

use crate::error::{Error, Result};
use crate::executor::{eval_expr, QueryResult};
use crate::parser::ast::InsertStmt;
use crate::schema::{DefaultValue, IndexSchema, TableSchema};
use crate::storage::btree::{key, BTree};
use crate::storage::page::MAX_ROW_PAYLOAD;
use crate::storage::record;
use crate::storage::PageStore;
use crate::txn::Transaction;
use crate::types::{now_timestamp, DataType, RowId, Value};

/// Execute a (possibly multi-row) INSERT.
pub fn execute_insert(
    tx: &mut Transaction,
    stmt: &InsertStmt,
    params: &[Value],
) -> Result<QueryResult> {
    let table = tx.resolve_table(&stmt.table)?;

    // Map VALUES positions onto column indices.
    let positions: Vec<usize> = if stmt.columns.is_empty() {
        (0..table.columns.len()).collect()
    } else {
        let mut positions = Vec::with_capacity(stmt.columns.len());
        for name in &stmt.columns {
            let idx = table
                .column_index(name)
                .ok_or_else(|| Error::ColumnUnknown { name: name.clone() })?;
            if positions.contains(&idx) {
                return Err(Error::InvalidSql(format!("column {} listed twice", name)));
            }
            positions.push(idx);
        }
        positions
    };

    let mut affected = 0u64;
    let mut last_row_id = None;
    for row_exprs in &stmt.rows {
        tx.cancel().check()?;
        if row_exprs.len() != positions.len() {
            return Err(Error::InvalidSql(format!(
                "expected {} values, got {}",
                positions.len(),
                row_exprs.len()
            )));
        }

        // Start from defaults, then overlay the provided values.
        let mut row: Vec<Value> = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            row.push(match &column.default {
                Some(DefaultValue::Literal(v)) => v.coerce_to(column.kind)?,
                Some(DefaultValue::Now) => Value::Timestamp(now_timestamp()),
                None => Value::Null,
            });
        }
        for (value_expr, &c_idx) in row_exprs.iter().zip(&positions) {
            let value = eval_expr(value_expr, params)?;
            let column = &table.columns[c_idx];
            row[c_idx] = if value.is_null() {
                Value::Null
            } else {
                value.coerce_to(column.kind)?
            };
        }

        let row_id = assign_row_id(&table, &mut row)?;

        for (column, value) in table.columns.iter().zip(&row) {
            if column.not_null && value.is_null() {
                return Err(Error::TypeMismatch(format!(
                    "column {} is NOT NULL",
                    column.name
                )));
            }
        }

        insert_full_row(tx, &table, row_id, row)?;
        affected += 1;
        last_row_id = Some(row_id);
    }

    Ok(QueryResult {
        rows_affected: affected,
        last_insert_row_id: last_row_id,
        ..QueryResult::default()
    })
}

/// Fill in the primary key / row id for a row about to be inserted.
///
/// An integer primary key is the clustered row id itself: an explicit
/// value becomes the row id (raising the autoincrement counter), an
/// omitted one is generated and written back into the row. Tables with a
/// non-integer or no primary key always allocate.
fn assign_row_id(table: &TableSchema, row: &mut [Value]) -> Result<RowId> {
    match table.primary_key() {
        Some((pk_idx, pk_col)) if matches!(pk_col.kind, DataType::Int4 | DataType::Int8) => {
            if row[pk_idx].is_null() {
                if !pk_col.autoincrement {
                    return Err(Error::TypeMismatch(format!(
                        "column {} is NOT NULL",
                        pk_col.name
                    )));
                }
                let row_id = table.allocate_row_id();
                row[pk_idx] = match pk_col.kind {
                    DataType::Int4 => Value::Int4(i32::try_from(row_id).map_err(|_| {
                        Error::TypeMismatch("autoincrement exceeded INT4 range".into())
                    })?),
                    _ => Value::Int8(row_id as i64),
                };
                Ok(row_id)
            } else {
                let row_id = row[pk_idx].as_row_id().ok_or_else(|| {
                    Error::TypeMismatch(format!(
                        "primary key {} must be a non-negative integer",
                        pk_col.name
                    ))
                })?;
                table.observe_row_id(row_id);
                Ok(row_id)
            }
        }
        _ => Ok(table.allocate_row_id()),
    }
}

/// Write one fully-formed row: spill long text, enforce unique indexes,
/// insert into the clustered tree and every index tree.
pub(crate) fn insert_full_row(
    tx: &mut Transaction,
    table: &TableSchema,
    row_id: RowId,
    mut row: Vec<Value>,
) -> Result<()> {
    // Unique enforcement happens before any tree is touched, so a
    // duplicate leaves no partial writes behind.
    for index in &table.indexes {
        if index.kind.is_unique() {
            check_unique(tx, table, index, &row)?;
        }
    }

    spill_long_text(tx, &mut row)?;
    let payload = record::encode_row(&table.kinds(), &row)?;
    if payload.len() > MAX_ROW_PAYLOAD {
        return Err(Error::RowTooLarge {
            size: payload.len(),
            max: MAX_ROW_PAYLOAD,
        });
    }

    {
        let mut tree = BTree::new(tx, table.root_page, 8);
        tree.insert(&key::encode_row_id(row_id), payload)?;
    }
    insert_index_entries(tx, table, &row, row_id)
}

/// Convert text values past the inline cap into overflow pointers.
pub(crate) fn spill_long_text(tx: &mut Transaction, row: &mut [Value]) -> Result<()> {
    for value in row.iter_mut() {
        if let Value::Text(s) = value {
            if s.len() > record::INLINE_TEXT_MAX {
                *value = Value::TextRef(record::store_long_text(tx, s)?);
            }
        }
    }
    Ok(())
}

/// Fail with `DuplicateKey` when a unique index already holds the row's
/// key. NULL keys are exempt: NULLs are never equal to each other.
pub(crate) fn check_unique(
    tx: &mut Transaction,
    table: &TableSchema,
    index: &IndexSchema,
    row: &[Value],
) -> Result<()> {
    let value = index_column_value(table, index, row)?;
    if value.is_null() {
        return Ok(());
    }
    let kind = index_column_kind(table, index)?;
    let prefix = key::encode_index_prefix(&[kind], &[value])?;
    let found = {
        let mut tree = BTree::new(tx, index.root_page, table.index_key_width(index));
        tree.contains_prefix(&prefix)?
    };
    if found {
        return Err(Error::DuplicateKey {
            index: index.name.clone(),
        });
    }
    Ok(())
}

/// Add one entry per index for a freshly inserted row.
pub(crate) fn insert_index_entries(
    tx: &mut Transaction,
    table: &TableSchema,
    row: &[Value],
    row_id: RowId,
) -> Result<()> {
    for index in &table.indexes {
        let entry_key = index_entry_key(table, index, row, row_id)?;
        let mut tree = BTree::new(tx, index.root_page, table.index_key_width(index));
        tree.insert(&entry_key, row_id.to_le_bytes().to_vec())?;
    }
    Ok(())
}

/// Remove every index entry of a row.
pub(crate) fn delete_index_entries(
    tx: &mut Transaction,
    table: &TableSchema,
    row: &[Value],
    row_id: RowId,
) -> Result<()> {
    for index in &table.indexes {
        let entry_key = index_entry_key(table, index, row, row_id)?;
        let mut tree = BTree::new(tx, index.root_page, table.index_key_width(index));
        tree.delete(&entry_key)?;
    }
    Ok(())
}

/// Remove a row entirely: its overflow chains, its index entries, and its
/// clustered entry.
pub(crate) fn delete_row(
    tx: &mut Transaction,
    table: &TableSchema,
    row_id: RowId,
    row: &[Value],
) -> Result<()> {
    record::free_row_overflows(tx, row)?;
    delete_index_entries(tx, table, row, row_id)?;
    let mut tree = BTree::new(tx, table.root_page, 8);
    tree.delete(&key::encode_row_id(row_id))?;
    Ok(())
}

/// Full key of one index entry: encoded column value plus the row id.
pub(crate) fn index_entry_key(
    table: &TableSchema,
    index: &IndexSchema,
    row: &[Value],
    row_id: RowId,
) -> Result<Vec<u8>> {
    let value = index_column_value(table, index, row)?;
    let kind = index_column_kind(table, index)?;
    key::encode_index_key(&[kind], &[value], row_id)
}

fn index_column_value(
    table: &TableSchema,
    index: &IndexSchema,
    row: &[Value],
) -> Result<Value> {
    let c_idx = table
        .column_index(&index.column)
        .ok_or_else(|| Error::corrupt(format!("index {} on unknown column", index.name)))?;
    let value = &row[c_idx];
    if matches!(value, Value::TextRef(_)) {
        return Err(Error::corrupt("index column holds an overflow pointer"));
    }
    Ok(value.clone())
}

fn index_column_kind(table: &TableSchema, index: &IndexSchema) -> Result<DataType> {
    table
        .column(&index.column)
        .map(|c| c.kind)
        .ok_or_else(|| Error::corrupt(format!("index {} on unknown column", index.name)))
}
