//! INNER JOIN execution: index-nested-loop over a secondary index, row-id
//! probes into a primary key, and the naive fallback.

mod common;

use common::{exec, query_rows};
use minisql::{Database, Value};
use tempfile::tempdir;

fn open(dir: &tempfile::TempDir) -> Database {
    Database::open(dir.path().join("test.db").to_str().unwrap()).unwrap()
}

fn setup_users_orders(conn: &mut minisql::Connection, with_index: bool) {
    exec(
        conn,
        "CREATE TABLE users (id INT8 PRIMARY KEY AUTOINCREMENT, name VARCHAR(16))",
    );
    exec(
        conn,
        "CREATE TABLE orders (id INT8 PRIMARY KEY AUTOINCREMENT, user_id INT8)",
    );
    if with_index {
        exec(conn, "CREATE INDEX ON orders (user_id)");
    }
    exec(conn, "INSERT INTO users(name) VALUES ('alice'), ('bob')");
    exec(
        conn,
        "INSERT INTO orders(user_id) VALUES (1), (2), (1)",
    );
}

fn expected_join_rows() -> Vec<Vec<Value>> {
    vec![
        vec![Value::Text("alice".into()), Value::Int8(1)],
        vec![Value::Text("alice".into()), Value::Int8(3)],
        vec![Value::Text("bob".into()), Value::Int8(2)],
    ]
}

#[test]
fn test_index_nested_loop_join() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();
    setup_users_orders(&mut conn, true);

    let rows = query_rows(
        &mut conn,
        "SELECT u.name, o.id FROM users u INNER JOIN orders o ON u.id = o.user_id \
         ORDER BY u.id, o.id",
    );
    assert_eq!(rows, expected_join_rows());
}

#[test]
fn test_naive_nested_loop_join() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();
    setup_users_orders(&mut conn, false);

    let rows = query_rows(
        &mut conn,
        "SELECT u.name, o.id FROM users u INNER JOIN orders o ON u.id = o.user_id \
         ORDER BY u.id, o.id",
    );
    assert_eq!(rows, expected_join_rows());
}

#[test]
fn test_join_probing_primary_key() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();
    setup_users_orders(&mut conn, false);

    // Inner side keyed by its integer primary key probes the clustered
    // tree directly.
    let rows = query_rows(
        &mut conn,
        "SELECT o.id, u.name FROM orders o INNER JOIN users u ON o.user_id = u.id \
         ORDER BY o.id",
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::Int8(1), Value::Text("alice".into())],
            vec![Value::Int8(2), Value::Text("bob".into())],
            vec![Value::Int8(3), Value::Text("alice".into())],
        ]
    );
}

#[test]
fn test_join_with_where_and_projection_order() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();
    setup_users_orders(&mut conn, true);

    let rows = query_rows(
        &mut conn,
        "SELECT o.id, u.name AS who FROM users u INNER JOIN orders o ON u.id = o.user_id \
         WHERE u.name = 'alice' ORDER BY o.id DESC",
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::Int8(3), Value::Text("alice".into())],
            vec![Value::Int8(1), Value::Text("alice".into())],
        ]
    );
}

#[test]
fn test_index_and_table_agree_after_churn() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();
    exec(
        &mut conn,
        "CREATE TABLE t (id INT8 PRIMARY KEY AUTOINCREMENT, v INT4)",
    );
    exec(&mut conn, "CREATE INDEX ON t (v)");

    for round in 0..5 {
        let values: Vec<String> = (0..40).map(|i| format!("({})", (round + i) % 11)).collect();
        exec(
            &mut conn,
            &format!("INSERT INTO t(v) VALUES {}", values.join(", ")),
        );
        exec(&mut conn, &format!("DELETE FROM t WHERE v = {}", round % 11));
        exec(
            &mut conn,
            &format!("UPDATE t SET v = {} WHERE v = {}", (round + 5) % 11, (round + 1) % 11),
        );
    }

    // For every value, the index path and a forced scan agree.
    for v in 0..11 {
        let via_index = query_rows(
            &mut conn,
            &format!("SELECT id FROM t WHERE v = {} ORDER BY id", v),
        );
        let via_scan: Vec<Vec<Value>> = query_rows(&mut conn, "SELECT id, v FROM t ORDER BY id")
            .into_iter()
            .filter(|row| row[1] == Value::Int4(v))
            .map(|row| vec![row[0].clone()])
            .collect();
        assert_eq!(via_index, via_scan, "disagreement for v = {}", v);
    }
}
