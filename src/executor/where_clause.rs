//! WHERE clause evaluation.
//!
//! Predicates are two-level: OR across groups, AND within a group.
//! Comparison typing is strict — strings compare to strings, numerics to
//! numerics — and any comparison involving NULL (other than IS [NOT]
//! NULL) is unknown, which filters the row out.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::eval_expr;
use crate::parser::ast::{CmpOp, ColumnRef, CondOperand, Condition, WhereClause};
use crate::schema::TableSchema;
use crate::storage::record;
use crate::txn::Transaction;
use crate::types::{DataType, Value};

/// One table (or aliased table) visible to a statement.
#[derive(Debug, Clone)]
pub struct Binding {
    /// The name rows are addressed by: the alias if one was given.
    pub name: String,
    pub table: Arc<TableSchema>,
}

/// A row tuple: one decoded row per binding, in binding order.
pub type RowTuple = Vec<Vec<Value>>;

/// Resolve a column reference against the visible bindings. Returns the
/// binding index, column index and declared kind.
pub fn resolve_column(
    bindings: &[Binding],
    column: &ColumnRef,
) -> Result<(usize, usize, DataType)> {
    if let Some(qualifier) = &column.table {
        let (b_idx, binding) = bindings
            .iter()
            .enumerate()
            .find(|(_, b)| b.name == *qualifier)
            .ok_or_else(|| Error::NotFound {
                what: "table",
                name: qualifier.clone(),
            })?;
        let c_idx = binding
            .table
            .column_index(&column.column)
            .ok_or_else(|| Error::ColumnUnknown {
                name: column.to_string(),
            })?;
        return Ok((b_idx, c_idx, binding.table.columns[c_idx].kind));
    }

    let mut found = None;
    for (b_idx, binding) in bindings.iter().enumerate() {
        if let Some(c_idx) = binding.table.column_index(&column.column) {
            if found.is_some() {
                return Err(Error::ColumnUnknown {
                    name: format!("{} (ambiguous)", column.column),
                });
            }
            found = Some((b_idx, c_idx, binding.table.columns[c_idx].kind));
        }
    }
    found.ok_or_else(|| Error::ColumnUnknown {
        name: column.column.clone(),
    })
}

/// Evaluate a full WHERE clause over one row tuple.
pub fn eval_where(
    tx: &mut Transaction,
    bindings: &[Binding],
    row: &RowTuple,
    clause: &WhereClause,
    params: &[Value],
) -> Result<bool> {
    for group in &clause.or_groups {
        let mut all = true;
        for condition in group {
            if !eval_condition(tx, bindings, row, condition, params)? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn eval_condition(
    tx: &mut Transaction,
    bindings: &[Binding],
    row: &RowTuple,
    condition: &Condition,
    params: &[Value],
) -> Result<bool> {
    let (b_idx, c_idx, kind) = resolve_column(bindings, &condition.field)?;
    let field = materialize(tx, &row[b_idx][c_idx])?;

    match condition.op {
        CmpOp::IsNull => return Ok(field.is_null()),
        CmpOp::IsNotNull => return Ok(!field.is_null()),
        _ => {}
    }
    // NULL compared with anything else is unknown, and unknown is false.
    if field.is_null() {
        return Ok(false);
    }

    match (&condition.op, &condition.operand) {
        (CmpOp::In, CondOperand::List(list)) => {
            for expr in list {
                let operand = coerce_operand(eval_expr(expr, params)?, kind)?;
                if !operand.is_null() && compare_values(&field, &operand)? == Some(Ordering::Equal)
                {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        (CmpOp::NotIn, CondOperand::List(list)) => {
            for expr in list {
                let operand = coerce_operand(eval_expr(expr, params)?, kind)?;
                if operand.is_null() {
                    // x NOT IN (..., NULL, ...) is unknown.
                    return Ok(false);
                }
                if compare_values(&field, &operand)? == Some(Ordering::Equal) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (op, CondOperand::Expr(expr)) => {
            let operand = coerce_operand(eval_expr(expr, params)?, kind)?;
            if operand.is_null() {
                return Ok(false);
            }
            let Some(ordering) = compare_values(&field, &operand)? else {
                return Ok(false);
            };
            Ok(match op {
                CmpOp::Eq => ordering == Ordering::Equal,
                CmpOp::Ne => ordering != Ordering::Equal,
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Ge => ordering != Ordering::Less,
                _ => false,
            })
        }
        _ => Err(Error::InvalidSql("malformed condition".into())),
    }
}

/// Resolve a long-text handle when a comparison actually needs the value.
pub fn materialize(tx: &mut Transaction, value: &Value) -> Result<Value> {
    match value {
        Value::TextRef(r) => Ok(Value::Text(record::resolve_text(tx, r)?)),
        other => Ok(other.clone()),
    }
}

/// Coerce a literal or bound operand to the field's declared kind; a
/// value that cannot fit the kind is a type error, not a silent false.
pub fn coerce_operand(value: Value, kind: DataType) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    value.coerce_to(kind)
}

/// Strictly-typed comparison. `None` means the pair has no defined order.
pub fn compare_values(a: &Value, b: &Value) -> Result<Option<Ordering>> {
    let ordering = match (a, b) {
        (Value::Null, _) | (_, Value::Null) => return Ok(None),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Int4(x), Value::Int4(y)) => x.cmp(y),
        (Value::Int8(x), Value::Int8(y)) => x.cmp(y),
        (Value::Int4(x), Value::Int8(y)) => (*x as i64).cmp(y),
        (Value::Int8(x), Value::Int4(y)) => x.cmp(&(*y as i64)),
        (Value::Real(x), Value::Real(y)) => return Ok(x.partial_cmp(y)),
        (Value::Double(x), Value::Double(y)) => return Ok(x.partial_cmp(y)),
        (Value::Real(x), Value::Double(y)) => return Ok((*x as f64).partial_cmp(y)),
        (Value::Double(x), Value::Real(y)) => return Ok(x.partial_cmp(&(*y as f64))),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        _ => {
            return Err(Error::TypeMismatch(format!(
                "cannot compare {} with {}",
                a.kind_name(),
                b.kind_name()
            )))
        }
    };
    Ok(Some(ordering))
}

/// Total order used only for ORDER BY: NULLs sort first, then the value
/// order.
pub fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(a, b)
            .ok()
            .flatten()
            .unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_comparisons() {
        assert_eq!(
            compare_values(&Value::Int8(2), &Value::Int8(3)).unwrap(),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&Value::Int4(2), &Value::Int8(2)).unwrap(),
            Some(Ordering::Equal)
        );
        assert_eq!(
            compare_values(&Value::Text("a".into()), &Value::Text("b".into())).unwrap(),
            Some(Ordering::Less)
        );
        assert!(compare_values(&Value::Text("1".into()), &Value::Int8(1)).is_err());
        assert_eq!(compare_values(&Value::Null, &Value::Int8(1)).unwrap(), None);
    }

    #[test]
    fn test_sort_cmp_null_first() {
        assert_eq!(sort_cmp(&Value::Null, &Value::Int8(1)), Ordering::Less);
        assert_eq!(sort_cmp(&Value::Int8(1), &Value::Null), Ordering::Greater);
        assert_eq!(sort_cmp(&Value::Null, &Value::Null), Ordering::Equal);
    }
}
