//! Durability and crash recovery: a committed database survives reopen,
//! and a journal left by an interrupted commit rolls the file back.

mod common;

use common::{count, exec};
use minisql::storage::journal;
use minisql::storage::pager::Pager;
use minisql::{Database, Value};
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

#[test]
fn test_committed_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let db = Database::open(path.to_str().unwrap()).unwrap();
        let mut conn = db.connection();
        exec(
            &mut conn,
            "CREATE TABLE t (id INT8 PRIMARY KEY AUTOINCREMENT, name VARCHAR(16))",
        );
        exec(&mut conn, "INSERT INTO t(name) VALUES ('a'),('b'),('c')");
        db.close().unwrap();
    }

    let db = Database::open(path.to_str().unwrap()).unwrap();
    let mut conn = db.connection();
    assert_eq!(count(&mut conn, "t"), 3);
    let rows = conn.execute("SELECT name FROM t ORDER BY id", &[]).unwrap();
    assert_eq!(
        rows.rows,
        vec![
            vec![Value::Text("a".into())],
            vec![Value::Text("b".into())],
            vec![Value::Text("c".into())],
        ]
    );
}

#[test]
fn test_recovery_after_crash_mid_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    // Committed baseline: three rows.
    {
        let db = Database::open(path.to_str().unwrap()).unwrap();
        let mut conn = db.connection();
        exec(
            &mut conn,
            "CREATE TABLE t (id INT8 PRIMARY KEY AUTOINCREMENT, v INT4)",
        );
        exec(&mut conn, "INSERT INTO t(v) VALUES (1), (2), (3)");
        db.close().unwrap();
    }

    // Simulate a transaction that died after its journal was fully
    // written and synced but while the page flush was underway: journal
    // the committed pre-images, then scribble on the main file.
    let total_pages = {
        let mut pager = Pager::open(&path).unwrap();
        let total = pager.file_pages().unwrap();
        let entries: Vec<(u32, Vec<u8>)> = (0..total)
            .map(|idx| (idx, pager.read_page(idx).unwrap()))
            .collect();
        journal::write(&path, total, &entries).unwrap();

        let garbage = vec![0xEEu8; PAGE_SIZE];
        pager.write_page(1, &garbage).unwrap();
        // The doomed transaction had also grown the file.
        pager.write_page(total, &garbage).unwrap();
        pager.write_page(total + 1, &garbage).unwrap();
        pager.sync().unwrap();
        total
    };
    assert!(journal::journal_path(&path).exists());

    // Reopen: recovery replays pre-images, truncates growth, drops the
    // journal. The interrupted transaction is gone.
    let db = Database::open(path.to_str().unwrap()).unwrap();
    assert!(!journal::journal_path(&path).exists());
    let mut conn = db.connection();
    assert_eq!(count(&mut conn, "t"), 3);

    let pager = Pager::open(&path).unwrap();
    assert_eq!(pager.file_pages().unwrap(), total_pages);
}

#[test]
fn test_recovered_database_accepts_new_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let db = Database::open(path.to_str().unwrap()).unwrap();
        let mut conn = db.connection();
        exec(&mut conn, "CREATE TABLE t (id INT8 PRIMARY KEY, v INT4)");
        exec(&mut conn, "INSERT INTO t(id, v) VALUES (1, 10)");
        db.close().unwrap();
    }
    {
        let mut pager = Pager::open(&path).unwrap();
        let total = pager.file_pages().unwrap();
        let entries: Vec<(u32, Vec<u8>)> = (0..total)
            .map(|idx| (idx, pager.read_page(idx).unwrap()))
            .collect();
        journal::write(&path, total, &entries).unwrap();
        pager.write_page(0, &vec![0u8; PAGE_SIZE]).unwrap();
        pager.sync().unwrap();
    }

    let db = Database::open(path.to_str().unwrap()).unwrap();
    let mut conn = db.connection();
    exec(&mut conn, "INSERT INTO t(id, v) VALUES (2, 20)");
    assert_eq!(count(&mut conn, "t"), 2);
}
