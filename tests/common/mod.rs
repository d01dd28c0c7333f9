//! Shared helpers for the end-to-end tests.

use std::sync::Once;

use minisql::{Connection, Database, QueryResult, Value};

static INIT: Once = Once::new();

/// Execute SQL that must succeed, with a readable panic when it does not.
pub fn exec(conn: &mut Connection, sql: &str) -> QueryResult {
    match conn.execute(sql, &[]) {
        Ok(result) => result,
        Err(err) => panic!("exec failed for '{}': {}", sql, err),
    }
}

/// Run a query and render the first column of every row as text.
pub fn query_flat(conn: &mut Connection, sql: &str) -> Vec<String> {
    match conn.execute(sql, &[]) {
        Ok(result) => result
            .rows
            .iter()
            .map(|row| row[0].to_display_string())
            .collect(),
        Err(err) => panic!("query failed for '{}': {}", sql, err),
    }
}

/// Run a query and return the raw rows.
pub fn query_rows(conn: &mut Connection, sql: &str) -> Vec<Vec<Value>> {
    match conn.execute(sql, &[]) {
        Ok(result) => result.rows,
        Err(err) => panic!("query failed for '{}': {}", sql, err),
    }
}

/// COUNT(*) of a table.
pub fn count(conn: &mut Connection, table: &str) -> i64 {
    let rows = query_rows(conn, &format!("SELECT COUNT(*) FROM {}", table));
    match rows.as_slice() {
        [row] => match &row[0] {
            Value::Int8(n) => *n,
            other => panic!("COUNT(*) returned {:?}", other),
        },
        other => panic!("COUNT(*) returned {} rows", other.len()),
    }
}

/// Open a database in `dir` under the standard test file name.
pub fn open_db(dir: &tempfile::TempDir) -> Database {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
    let path = dir.path().join("test.db");
    Database::open(path.to_str().expect("utf-8 temp path")).expect("open database")
}
