//! Connections: statement execution and transaction control.
//!
//! A connection holds zero or one open transaction. `BEGIN` opens one,
//! `COMMIT`/`ROLLBACK` close it, and any other statement executed outside
//! an open transaction is wrapped in an implicit one (auto-commit: begin,
//! execute, commit on success, roll back on error).

use std::sync::Arc;

use crate::api::stmt::PreparedStmt;
use crate::error::{Error, Result};
use crate::executor::{execute_stmt, QueryResult};
use crate::parser::ast::Stmt;
use crate::parser::parse;
use crate::txn::{DbShared, Transaction};
use crate::types::{CancelToken, RowId, Value};

/// A stateful handle for executing statements against a database.
pub struct Connection {
    shared: Arc<DbShared>,
    tx: Option<Transaction>,
    cancel: CancelToken,
    last_insert_row_id: Option<RowId>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<DbShared>) -> Self {
        Connection {
            shared,
            tx: None,
            cancel: CancelToken::new(),
            last_insert_row_id: None,
        }
    }

    /// The token long operations on this connection poll; cancel it from
    /// another thread to abort with [`Error::Cancelled`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// True while an explicit transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Row id produced by the most recent INSERT on this connection.
    pub fn last_insert_row_id(&self) -> Option<RowId> {
        self.last_insert_row_id
    }

    /// Parse and execute every statement in `sql`, returning the result
    /// of the last one. `?` placeholders bind to `params` in order.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let stmts = parse(sql)?;
        let mut last = QueryResult::empty();
        for stmt in &stmts {
            last = self.execute_one(stmt, params)?;
        }
        Ok(last)
    }

    /// Parse once; bind and execute later.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStmt> {
        PreparedStmt::prepare(sql)
    }

    /// Execute a prepared statement with positional arguments.
    pub fn execute_prepared(
        &mut self,
        prepared: &PreparedStmt,
        params: &[Value],
    ) -> Result<QueryResult> {
        if params.len() < prepared.param_count() {
            return Err(Error::InvalidSql(format!(
                "statement needs {} parameters, {} bound",
                prepared.param_count(),
                params.len()
            )));
        }
        let mut last = QueryResult::empty();
        for stmt in prepared.statements() {
            last = self.execute_one(stmt, params)?;
        }
        Ok(last)
    }

    fn execute_one(&mut self, stmt: &Stmt, params: &[Value]) -> Result<QueryResult> {
        match stmt {
            Stmt::Begin => {
                if self.tx.is_some() {
                    return Err(Error::InvalidSql("transaction already open".into()));
                }
                self.tx = Some(Transaction::begin(self.shared.clone(), self.cancel.clone()));
                Ok(QueryResult::empty())
            }
            Stmt::Commit => match self.tx.take() {
                Some(tx) => {
                    tx.commit()?;
                    Ok(QueryResult::empty())
                }
                None => Err(Error::InvalidSql("no open transaction".into())),
            },
            Stmt::Rollback => match self.tx.take() {
                Some(tx) => {
                    tx.rollback();
                    Ok(QueryResult::empty())
                }
                None => Err(Error::InvalidSql("no open transaction".into())),
            },
            _ => {
                let result = match self.tx.as_mut() {
                    // Inside an explicit transaction the statement's
                    // effects stay pending; errors leave the transaction
                    // open for the caller to roll back.
                    Some(tx) => execute_stmt(tx, stmt, params)?,
                    None => {
                        // Auto-commit.
                        let mut tx =
                            Transaction::begin(self.shared.clone(), self.cancel.clone());
                        match execute_stmt(&mut tx, stmt, params) {
                            Ok(result) => {
                                tx.commit()?;
                                result
                            }
                            Err(err) => {
                                tx.rollback();
                                return Err(err);
                            }
                        }
                    }
                };
                if let Some(row_id) = result.last_insert_row_id {
                    self.last_insert_row_id = Some(row_id);
                }
                Ok(result)
            }
        }
    }
}
