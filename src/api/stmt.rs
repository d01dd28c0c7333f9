//! Prepared statements.
//!
//! `prepare` parses once; `?` placeholders are numbered in order of
//! appearance and bound positionally at execution time. Values are
//! type-checked against column kinds when the statement runs, not when it
//! is bound.

use crate::error::Result;
use crate::parser::ast::{CondOperand, Expr, Stmt, WhereClause};
use crate::parser::parse;

/// A parsed, re-executable statement (or statement batch).
#[derive(Debug, Clone)]
pub struct PreparedStmt {
    stmts: Vec<Stmt>,
    param_count: usize,
}

impl PreparedStmt {
    pub fn prepare(sql: &str) -> Result<PreparedStmt> {
        let stmts = parse(sql)?;
        let param_count = stmts.iter().map(count_stmt_params).max().unwrap_or(0);
        Ok(PreparedStmt { stmts, param_count })
    }

    /// How many `?` parameters must be bound.
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub(crate) fn statements(&self) -> &[Stmt] {
        &self.stmts
    }
}

fn count_stmt_params(stmt: &Stmt) -> usize {
    let mut max = 0usize;
    let mut visit = |expr: &Expr| {
        if let Expr::Placeholder(idx) = expr {
            max = max.max(idx + 1);
        }
    };
    match stmt {
        Stmt::Insert(insert) => {
            for row in &insert.rows {
                row.iter().for_each(&mut visit);
            }
        }
        Stmt::Select(select) => visit_where(&select.where_clause, &mut visit),
        Stmt::Update(update) => {
            for (_, expr) in &update.assignments {
                visit(expr);
            }
            visit_where(&update.where_clause, &mut visit);
        }
        Stmt::Delete(delete) => visit_where(&delete.where_clause, &mut visit),
        _ => {}
    }
    max
}

fn visit_where(clause: &Option<WhereClause>, visit: &mut impl FnMut(&Expr)) {
    let Some(clause) = clause else {
        return;
    };
    for group in &clause.or_groups {
        for condition in group {
            match &condition.operand {
                CondOperand::Expr(expr) => visit(expr),
                CondOperand::List(list) => list.iter().for_each(&mut *visit),
                CondOperand::None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_count() {
        let stmt = PreparedStmt::prepare("INSERT INTO t(a, b) VALUES (?, ?)").unwrap();
        assert_eq!(stmt.param_count(), 2);

        let stmt = PreparedStmt::prepare("SELECT * FROM t WHERE a = ? OR b IN (?, ?)").unwrap();
        assert_eq!(stmt.param_count(), 3);

        let stmt = PreparedStmt::prepare("SELECT * FROM t").unwrap();
        assert_eq!(stmt.param_count(), 0);
    }
}
