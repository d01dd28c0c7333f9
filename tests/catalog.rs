//! Catalog integrity, free-page reuse, and DDL idempotence.

mod common;

use common::{count, exec, query_flat, query_rows};
use minisql::{Database, Error, Value};
use tempfile::tempdir;

fn open(dir: &tempfile::TempDir) -> Database {
    Database::open(dir.path().join("test.db").to_str().unwrap()).unwrap()
}

#[test]
fn test_schema_rows_per_table_and_index() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();

    exec(
        &mut conn,
        "CREATE TABLE t (id INT8 PRIMARY KEY AUTOINCREMENT, email VARCHAR(64) UNIQUE, v INT4)",
    );
    exec(&mut conn, "CREATE INDEX ON t (v)");

    // One row for the catalog itself, one for t, and three for its
    // indexes.
    let mut names = query_flat(&mut conn, "SELECT name FROM minisql_schema");
    names.sort();
    assert_eq!(
        names,
        vec![
            "key__t__email",
            "key__t__v",
            "minisql_schema",
            "pkey__t",
            "t",
        ]
    );

    let types = query_rows(
        &mut conn,
        "SELECT type FROM minisql_schema WHERE table_name = 't'",
    );
    let mut types: Vec<i32> = types
        .iter()
        .map(|row| match row[0] {
            Value::Int4(v) => v,
            ref other => panic!("bad type value {:?}", other),
        })
        .collect();
    types.sort();
    assert_eq!(types, vec![2, 3, 4]);

    // DROP removes every owned row; nothing orphaned.
    exec(&mut conn, "DROP TABLE t");
    assert_eq!(
        query_flat(&mut conn, "SELECT name FROM minisql_schema"),
        ["minisql_schema"]
    );
}

#[test]
fn test_schema_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    {
        let db = Database::open(path.to_str().unwrap()).unwrap();
        let mut conn = db.connection();
        exec(
            &mut conn,
            "CREATE TABLE t (id INT8 PRIMARY KEY AUTOINCREMENT, email VARCHAR(64) UNIQUE)",
        );
        exec(&mut conn, "INSERT INTO t(email) VALUES ('a@x')");
        db.close().unwrap();
    }
    let db = Database::open(path.to_str().unwrap()).unwrap();
    let mut conn = db.connection();
    // The unique constraint still binds after a catalog reload.
    let err = conn
        .execute("INSERT INTO t(email) VALUES ('a@x')", &[])
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { index } if index == "key__t__email"));
    // And autoincrement resumes past the persisted rows.
    exec(&mut conn, "INSERT INTO t(email) VALUES ('b@x')");
    assert_eq!(query_flat(&mut conn, "SELECT id FROM t ORDER BY id"), ["1", "2"]);
}

#[test]
fn test_freed_root_pages_are_reused_newest_first() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();

    exec(&mut conn, "CREATE TABLE u (id INT8 PRIMARY KEY, v INT4)");
    let u_root = root_page(&mut conn, "u");
    let u_pkey = root_page(&mut conn, "pkey__u");
    assert_eq!((u_root, u_pkey), (1, 2));

    exec(&mut conn, "DROP TABLE u");
    exec(&mut conn, "CREATE TABLE w (id INT8 PRIMARY KEY, v INT4)");

    // The drop freed pages 1 and 2; the new table takes them back from
    // the free list newest-first, before the file grows.
    assert_eq!(root_page(&mut conn, "w"), 2);
    assert_eq!(root_page(&mut conn, "pkey__w"), 1);

    let file_len = std::fs::metadata(dir.path().join("test.db")).unwrap().len();
    assert_eq!(file_len, 3 * 4096);
}

fn root_page(conn: &mut minisql::Connection, name: &str) -> i32 {
    let rows = query_rows(
        conn,
        &format!(
            "SELECT root_page FROM minisql_schema WHERE name = '{}'",
            name
        ),
    );
    match rows.as_slice() {
        [row] => match row[0] {
            Value::Int4(v) => v,
            ref other => panic!("bad root_page {:?}", other),
        },
        other => panic!("{} has {} schema rows", name, other.len()),
    }
}

#[test]
fn test_create_if_not_exists_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    let db = Database::open(path.to_str().unwrap()).unwrap();
    let mut conn = db.connection();

    exec(
        &mut conn,
        "CREATE TABLE IF NOT EXISTS t (id INT8 PRIMARY KEY AUTOINCREMENT, v INT4)",
    );
    exec(&mut conn, "INSERT INTO t(v) VALUES (1)");
    let before = std::fs::read(&path).unwrap();

    for _ in 0..3 {
        exec(
            &mut conn,
            "CREATE TABLE IF NOT EXISTS t (id INT8 PRIMARY KEY AUTOINCREMENT, v INT4)",
        );
    }
    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after, "repeated CREATE IF NOT EXISTS must not write");

    // Without IF NOT EXISTS the duplicate is an error.
    let err = conn
        .execute("CREATE TABLE t (id INT8 PRIMARY KEY)", &[])
        .unwrap_err();
    assert!(matches!(err, Error::TableExists { name } if name == "t"));
}

#[test]
fn test_drop_index() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();

    exec(
        &mut conn,
        "CREATE TABLE t (id INT8 PRIMARY KEY AUTOINCREMENT, v INT4)",
    );
    exec(&mut conn, "INSERT INTO t(v) VALUES (1), (2), (2), (3)");
    exec(&mut conn, "CREATE INDEX ON t (v)");
    assert_eq!(query_flat(&mut conn, "SELECT id FROM t WHERE v = 2"), ["2", "3"]);

    exec(&mut conn, "DROP INDEX key__t__v");
    // Queries fall back to a scan and still answer correctly.
    assert_eq!(query_flat(&mut conn, "SELECT id FROM t WHERE v = 2"), ["2", "3"]);
    assert_eq!(
        query_rows(
            &mut conn,
            "SELECT name FROM minisql_schema WHERE name = 'key__t__v'"
        )
        .len(),
        0
    );

    // Constraint-backing indexes cannot be dropped.
    let err = conn.execute("DROP INDEX pkey__t", &[]).unwrap_err();
    assert!(matches!(err, Error::InvalidSql(_)));
    let err = conn.execute("DROP INDEX key__t__v", &[]).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn test_create_index_backfills_existing_rows() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();

    exec(
        &mut conn,
        "CREATE TABLE t (id INT8 PRIMARY KEY AUTOINCREMENT, v INT4)",
    );
    for chunk in 0..10 {
        let values: Vec<String> = (0..20).map(|i| format!("({})", (chunk * 20 + i) % 7)).collect();
        exec(
            &mut conn,
            &format!("INSERT INTO t(v) VALUES {}", values.join(", ")),
        );
    }
    exec(&mut conn, "CREATE INDEX ON t (v)");

    // The index answers for rows inserted before it existed.
    let via_index = query_flat(&mut conn, "SELECT id FROM t WHERE v = 3 ORDER BY id");
    let expected: Vec<String> = (0..200)
        .filter(|i| i % 7 == 3)
        .map(|i| (i + 1).to_string())
        .collect();
    assert_eq!(via_index, expected);
}

#[test]
fn test_drop_missing_objects() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();
    exec(&mut conn, "CREATE TABLE t (id INT8 PRIMARY KEY)");

    let err = conn.execute("DROP TABLE nope", &[]).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    let err = conn.execute("DROP INDEX nope", &[]).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    let err = conn.execute("DROP TABLE minisql_schema", &[]).unwrap_err();
    assert!(matches!(err, Error::InvalidSql(_)));
}

#[test]
fn test_ddl_rolls_back() {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    let mut conn = db.connection();

    exec(&mut conn, "BEGIN");
    exec(&mut conn, "CREATE TABLE t (id INT8 PRIMARY KEY, v INT4)");
    exec(&mut conn, "INSERT INTO t(id, v) VALUES (1, 1)");
    assert_eq!(count(&mut conn, "t"), 1);
    exec(&mut conn, "ROLLBACK");

    // The table never existed as far as anyone can tell.
    let err = conn.execute("SELECT * FROM t", &[]).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(
        query_flat(&mut conn, "SELECT name FROM minisql_schema"),
        ["minisql_schema"]
    );
}
