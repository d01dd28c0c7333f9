//! Access-path selection and base-table scans.
//!
//! The planner inspects the WHERE clause's single AND group (OR disables
//! index use) and picks, in order of preference: a row-id range on an
//! integer primary key, an index equality seek, an index range scan, or a
//! full table scan. Scans return decoded rows; the caller re-applies the
//! full WHERE predicate, so a path only has to be sound, not exact.

use crate::error::{Error, Result};
use crate::executor::eval_expr;
use crate::parser::ast::{CmpOp, CondOperand, Condition, WhereClause};
use crate::schema::{IndexSchema, TableSchema};
use crate::storage::btree::{key, BTree};
use crate::storage::record;
use crate::txn::Transaction;
use crate::types::{DataType, RowId, Value};

/// How the executor reaches the rows of one table.
#[derive(Debug, Clone)]
pub enum AccessPath {
    FullScan,
    /// Clustered scan over a row-id interval (integer primary key).
    RowIdRange {
        lower: Option<(RowId, bool)>,
        upper: Option<(RowId, bool)>,
    },
    /// Seek/scan of one index, then a table lookup per row id.
    Index {
        index: IndexSchema,
        column_kind: DataType,
        lower: Option<(Value, bool)>,
        upper: Option<(Value, bool)>,
    },
}

/// True when the primary key doubles as the clustered row id.
fn rowid_backed_pk(table: &TableSchema) -> Option<(usize, &str)> {
    table.primary_key().and_then(|(idx, col)| {
        matches!(col.kind, DataType::Int4 | DataType::Int8).then(|| (idx, col.name.as_str()))
    })
}

/// Conditions of the group that constrain `column` of this binding.
fn conditions_on<'a>(
    group: &'a [Condition],
    binding: &str,
    column: &str,
) -> impl Iterator<Item = &'a Condition> {
    let binding = binding.to_string();
    let column = column.to_string();
    group.iter().filter(move |c| {
        c.field.column == column
            && c.field
                .table
                .as_deref()
                .map(|q| q == binding)
                .unwrap_or(true)
    })
}

/// Pick the access path for `table` given the statement's WHERE clause.
pub fn choose_path(
    table: &TableSchema,
    binding: &str,
    clause: Option<&WhereClause>,
    params: &[Value],
) -> Result<AccessPath> {
    let Some(group) = clause.and_then(|c| c.single_group()) else {
        return Ok(AccessPath::FullScan);
    };

    // Integer primary keys are the clustered key itself: turn conditions
    // on them into a row-id interval on the table tree.
    if let Some((_, pk_name)) = rowid_backed_pk(table) {
        let mut lower: Option<(RowId, bool)> = None;
        let mut upper: Option<(RowId, bool)> = None;
        let mut usable = false;
        for cond in conditions_on(group, binding, pk_name) {
            let CondOperand::Expr(expr) = &cond.operand else {
                continue;
            };
            let value = eval_expr(expr, params)?;
            if value.is_null() {
                continue;
            }
            let Some(row_id) = value.as_row_id() else {
                continue;
            };
            match cond.op {
                CmpOp::Eq => {
                    lower = Some((row_id, true));
                    upper = Some((row_id, true));
                    usable = true;
                    break;
                }
                CmpOp::Gt => {
                    lower = tighten_lower(lower, row_id, false);
                    usable = true;
                }
                CmpOp::Ge => {
                    lower = tighten_lower(lower, row_id, true);
                    usable = true;
                }
                CmpOp::Lt => {
                    upper = tighten_upper(upper, row_id, false);
                    usable = true;
                }
                CmpOp::Le => {
                    upper = tighten_upper(upper, row_id, true);
                    usable = true;
                }
                _ => {}
            }
        }
        if usable {
            return Ok(AccessPath::RowIdRange { lower, upper });
        }
    }

    // Otherwise, the first indexed column with an equality wins; a range
    // on an indexed column is the fallback.
    let mut range_path = None;
    for index in &table.indexes {
        let Some(column) = table.column(&index.column) else {
            continue;
        };
        for cond in conditions_on(group, binding, &index.column) {
            let CondOperand::Expr(expr) = &cond.operand else {
                continue;
            };
            let value = eval_expr(expr, params)?;
            if value.is_null() {
                continue;
            }
            let value = value.coerce_to(column.kind)?;
            match cond.op {
                CmpOp::Eq => {
                    return Ok(AccessPath::Index {
                        index: index.clone(),
                        column_kind: column.kind,
                        lower: Some((value.clone(), true)),
                        upper: Some((value, true)),
                    });
                }
                CmpOp::Gt | CmpOp::Ge if range_path.is_none() => {
                    range_path = Some(AccessPath::Index {
                        index: index.clone(),
                        column_kind: column.kind,
                        lower: Some((value, cond.op == CmpOp::Ge)),
                        upper: None,
                    });
                }
                CmpOp::Lt | CmpOp::Le if range_path.is_none() => {
                    range_path = Some(AccessPath::Index {
                        index: index.clone(),
                        column_kind: column.kind,
                        lower: None,
                        upper: Some((value, cond.op == CmpOp::Le)),
                    });
                }
                _ => {}
            }
        }
    }
    Ok(range_path.unwrap_or(AccessPath::FullScan))
}

fn tighten_lower(
    current: Option<(RowId, bool)>,
    candidate: RowId,
    inclusive: bool,
) -> Option<(RowId, bool)> {
    match current {
        None => Some((candidate, inclusive)),
        Some((cur, _)) if candidate > cur => Some((candidate, inclusive)),
        other => other,
    }
}

fn tighten_upper(
    current: Option<(RowId, bool)>,
    candidate: RowId,
    inclusive: bool,
) -> Option<(RowId, bool)> {
    match current {
        None => Some((candidate, inclusive)),
        Some((cur, _)) if candidate < cur => Some((candidate, inclusive)),
        other => other,
    }
}

// ============================================================================
// Scans
// ============================================================================

/// Fetch and decode one row by row id.
pub fn fetch_row(tx: &mut Transaction, table: &TableSchema, row_id: RowId) -> Result<Option<Vec<Value>>> {
    let payload = {
        let mut tree = BTree::new(tx, table.root_page, 8);
        tree.search(&key::encode_row_id(row_id))?
    };
    match payload {
        Some(bytes) => Ok(Some(record::decode_row(&table.kinds(), &bytes)?)),
        None => Ok(None),
    }
}

/// Produce `(row_id, row)` pairs for a table along the chosen path.
pub fn scan_table(
    tx: &mut Transaction,
    table: &TableSchema,
    path: &AccessPath,
) -> Result<Vec<(RowId, Vec<Value>)>> {
    match path {
        AccessPath::FullScan => scan_row_id_range(tx, table, &None, &None),
        AccessPath::RowIdRange { lower, upper } => scan_row_id_range(tx, table, lower, upper),
        AccessPath::Index {
            index,
            column_kind,
            lower,
            upper,
        } => scan_index(tx, table, index, *column_kind, lower, upper),
    }
}

fn scan_row_id_range(
    tx: &mut Transaction,
    table: &TableSchema,
    lower: &Option<(RowId, bool)>,
    upper: &Option<(RowId, bool)>,
) -> Result<Vec<(RowId, Vec<Value>)>> {
    let kinds = table.kinds();
    let mut tree = BTree::new(tx, table.root_page, 8);
    let mut cursor = match lower {
        None => tree.cursor_first()?,
        Some((lo, inclusive)) => {
            let start = if *inclusive { *lo } else { lo.saturating_add(1) };
            tree.cursor_seek(&key::encode_row_id(start))?
        }
    };

    let mut rows = Vec::new();
    while let Some(cell) = tree.cursor_next(&mut cursor)? {
        let row_id = key::decode_row_id(&cell.key)?;
        if let Some((hi, inclusive)) = upper {
            if row_id > *hi || (!inclusive && row_id == *hi) {
                break;
            }
        }
        rows.push((row_id, record::decode_row(&kinds, &cell.payload)?));
    }
    Ok(rows)
}

fn scan_index(
    tx: &mut Transaction,
    table: &TableSchema,
    index: &IndexSchema,
    column_kind: DataType,
    lower: &Option<(Value, bool)>,
    upper: &Option<(Value, bool)>,
) -> Result<Vec<(RowId, Vec<Value>)>> {
    // Non-NULL encodings start past the NULL tag, so an open lower bound
    // of a single 0x01 byte skips the NULL group entirely.
    let start: Vec<u8> = match lower {
        None => vec![0x01],
        Some((value, inclusive)) => {
            let prefix = key::encode_index_prefix(&[column_kind], &[value.clone()])?;
            if *inclusive {
                prefix
            } else {
                match key::prefix_successor(&prefix) {
                    Some(next) => next,
                    None => return Ok(Vec::new()),
                }
            }
        }
    };
    let end: Option<Vec<u8>> = match upper {
        None => None,
        Some((value, inclusive)) => {
            let prefix = key::encode_index_prefix(&[column_kind], &[value.clone()])?;
            if *inclusive {
                match key::prefix_successor(&prefix) {
                    Some(next) => Some(next),
                    None => None,
                }
            } else {
                Some(prefix)
            }
        }
    };

    let row_ids: Vec<RowId> = {
        let width = table.index_key_width(index);
        let mut tree = BTree::new(tx, index.root_page, width);
        let mut cursor = tree.cursor_seek(&start)?;
        let mut ids = Vec::new();
        while let Some(cell) = tree.cursor_next(&mut cursor)? {
            if let Some(end) = &end {
                if cell.key.as_slice() >= end.as_slice() {
                    break;
                }
            }
            ids.push(key::index_key_row_id(&cell.key)?);
        }
        ids
    };

    let mut rows = Vec::with_capacity(row_ids.len());
    for row_id in row_ids {
        let row = fetch_row(tx, table, row_id)?.ok_or_else(|| {
            Error::corrupt(format!(
                "index {} references missing row {}",
                index.name, row_id
            ))
        })?;
        rows.push((row_id, row));
    }
    Ok(rows)
}
