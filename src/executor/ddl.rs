//! DDL execution: CREATE/DROP TABLE and CREATE/DROP INDEX.
//!
//! DDL mutates pages like any DML (root allocations, catalog rows) under
//! the current transaction; the in-memory catalog only changes when the
//! transaction commits and its recorded DDL effects are applied.

use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::executor::insert::index_entry_key;
use crate::executor::QueryResult;
use crate::parser::ast::{CreateIndexStmt, CreateTableStmt, DropStmt};
use crate::schema::{
    columns_from_defs, key_index_name, pkey_index_name, schema_row_kinds, Column, DdlOp,
    DefaultValue, IndexKind, IndexSchema, SchemaRow, TableSchema, SCHEMA_TABLE,
    SCHEMA_TYPE_SECONDARY, SCHEMA_TYPE_TABLE,
};
use crate::storage::btree::{key, BTree};
use crate::storage::page::{LeafNode, Node, Page};
use crate::storage::record;
use crate::storage::PageStore;
use crate::txn::Transaction;
use crate::types::{DataType, PageId, RowId, Value};

// ============================================================================
// CREATE TABLE
// ============================================================================

pub fn execute_create_table(
    tx: &mut Transaction,
    stmt: &CreateTableStmt,
) -> Result<QueryResult> {
    if stmt.name == SCHEMA_TABLE {
        return Err(Error::InvalidSql(format!(
            "{} is reserved for the catalog",
            SCHEMA_TABLE
        )));
    }
    if tx.table_exists(&stmt.name) {
        if stmt.if_not_exists {
            return Ok(QueryResult::empty());
        }
        return Err(Error::TableExists {
            name: stmt.name.clone(),
        });
    }

    let columns = columns_from_defs(&stmt.columns)?;
    let sql = render_create_table(&stmt.name, &columns);

    // One tree per table plus one per implicit index, allocated in a
    // stable order so freed pages are reused deterministically.
    let table_root = alloc_tree_root(tx)?;
    let mut table = TableSchema::new(stmt.name.clone(), columns, table_root, sql.clone());

    if let Some((_, pk)) = table.primary_key() {
        let pk_column = pk.name.clone();
        let root = alloc_tree_root(tx)?;
        table.indexes.push(IndexSchema {
            name: pkey_index_name(&stmt.name),
            kind: IndexKind::PrimaryKey,
            column: pk_column,
            root_page: root,
        });
    }
    let unique_columns: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.unique && !c.primary_key)
        .map(|c| c.name.clone())
        .collect();
    for column in unique_columns {
        let root = alloc_tree_root(tx)?;
        table.indexes.push(IndexSchema {
            name: key_index_name(&stmt.name, &column),
            kind: IndexKind::Unique,
            column,
            root_page: root,
        });
    }

    insert_schema_row(
        tx,
        &SchemaRow {
            row_id: 0,
            ty: SCHEMA_TYPE_TABLE,
            name: stmt.name.clone(),
            table_name: None,
            root_page: table_root,
            sql: Some(sql),
        },
    )?;
    for index in &table.indexes {
        insert_schema_row(
            tx,
            &SchemaRow {
                row_id: 0,
                ty: index.kind.schema_type(),
                name: index.name.clone(),
                table_name: Some(stmt.name.clone()),
                root_page: index.root_page,
                sql: None,
            },
        )?;
    }

    debug!("created table {} at root page {}", stmt.name, table_root);
    tx.record_ddl(DdlOp::CreateTable(Arc::new(table)))?;
    Ok(QueryResult::empty())
}

// ============================================================================
// DROP TABLE
// ============================================================================

pub fn execute_drop_table(tx: &mut Transaction, stmt: &DropStmt) -> Result<QueryResult> {
    if stmt.name == SCHEMA_TABLE {
        return Err(Error::InvalidSql("cannot drop the catalog table".into()));
    }
    let table = tx.resolve_table(&stmt.name)?;

    // Overflow chains are owned by rows; walk them before the trees go.
    let payloads: Vec<Vec<u8>> = {
        let mut tree = BTree::new(tx, table.root_page, 8);
        let mut cursor = tree.cursor_first()?;
        let mut payloads = Vec::new();
        while let Some(cell) = tree.cursor_next(&mut cursor)? {
            payloads.push(cell.payload);
        }
        payloads
    };
    let kinds = table.kinds();
    for payload in payloads {
        let row = record::decode_row(&kinds, &payload)?;
        record::free_row_overflows(tx, &row)?;
    }

    // Free every page of every tree in ascending index order, so the
    // free list hands them back newest-first.
    let mut pages = {
        let mut tree = BTree::new(tx, table.root_page, 8);
        tree.collect_pages()?
    };
    for index in &table.indexes {
        let mut tree = BTree::new(tx, index.root_page, table.index_key_width(index));
        pages.extend(tree.collect_pages()?);
    }
    pages.sort_unstable();
    for page in pages {
        tx.free_page(page)?;
    }

    delete_schema_rows(tx, |row| {
        (row.ty == SCHEMA_TYPE_TABLE && row.name == stmt.name)
            || row.table_name.as_deref() == Some(stmt.name.as_str())
    })?;

    debug!("dropped table {}", stmt.name);
    tx.record_ddl(DdlOp::DropTable(stmt.name.clone()))?;
    Ok(QueryResult::empty())
}

// ============================================================================
// CREATE INDEX
// ============================================================================

pub fn execute_create_index(
    tx: &mut Transaction,
    stmt: &CreateIndexStmt,
) -> Result<QueryResult> {
    let table = tx.resolve_table(&stmt.table)?;
    let column = table
        .column(&stmt.column)
        .ok_or_else(|| Error::ColumnUnknown {
            name: stmt.column.clone(),
        })?;
    if matches!(column.kind, DataType::Text) {
        return Err(Error::TypeMismatch(
            "cannot index a TEXT column; use VARCHAR".into(),
        ));
    }

    let name = stmt
        .name
        .clone()
        .unwrap_or_else(|| key_index_name(&stmt.table, &stmt.column));
    if tx.table_of_index(&name).is_some() {
        if stmt.if_not_exists {
            return Ok(QueryResult::empty());
        }
        return Err(Error::InvalidSql(format!("index {} already exists", name)));
    }

    let root = alloc_tree_root(tx)?;
    let index = IndexSchema {
        name: name.clone(),
        kind: IndexKind::Secondary,
        column: stmt.column.clone(),
        root_page: root,
    };

    // Backfill from the existing rows.
    let existing: Vec<(RowId, Vec<u8>)> = {
        let mut tree = BTree::new(tx, table.root_page, 8);
        let mut cursor = tree.cursor_first()?;
        let mut rows = Vec::new();
        while let Some(cell) = tree.cursor_next(&mut cursor)? {
            rows.push((key::decode_row_id(&cell.key)?, cell.payload));
        }
        rows
    };
    let kinds = table.kinds();
    let width = table.index_key_width(&index);
    for (row_id, payload) in existing {
        tx.cancel().check()?;
        let row = record::decode_row(&kinds, &payload)?;
        let entry_key = index_entry_key(&table, &index, &row, row_id)?;
        let mut tree = BTree::new(tx, root, width);
        tree.insert(&entry_key, row_id.to_le_bytes().to_vec())?;
    }

    insert_schema_row(
        tx,
        &SchemaRow {
            row_id: 0,
            ty: SCHEMA_TYPE_SECONDARY,
            name: name.clone(),
            table_name: Some(stmt.table.clone()),
            root_page: root,
            sql: Some(render_create_index(&name, &stmt.table, &stmt.column)),
        },
    )?;

    debug!("created index {} at root page {}", name, root);
    tx.record_ddl(DdlOp::CreateIndex {
        table: stmt.table.clone(),
        index,
    })?;
    Ok(QueryResult::empty())
}

// ============================================================================
// DROP INDEX
// ============================================================================

pub fn execute_drop_index(tx: &mut Transaction, stmt: &DropStmt) -> Result<QueryResult> {
    let table = tx.table_of_index(&stmt.name).ok_or_else(|| Error::NotFound {
        what: "index",
        name: stmt.name.clone(),
    })?;
    let index = table
        .index_named(&stmt.name)
        .ok_or_else(|| Error::NotFound {
            what: "index",
            name: stmt.name.clone(),
        })?
        .clone();
    if !matches!(index.kind, IndexKind::Secondary) {
        return Err(Error::InvalidSql(format!(
            "{} backs a constraint and cannot be dropped",
            stmt.name
        )));
    }

    {
        let mut tree = BTree::new(tx, index.root_page, table.index_key_width(&index));
        tree.free_all()?;
    }
    delete_schema_rows(tx, |row| {
        row.ty != SCHEMA_TYPE_TABLE && row.name == stmt.name
    })?;

    debug!("dropped index {}", stmt.name);
    tx.record_ddl(DdlOp::DropIndex {
        table: table.name.clone(),
        index: stmt.name.clone(),
    })?;
    Ok(QueryResult::empty())
}

// ============================================================================
// Catalog plumbing
// ============================================================================

fn alloc_tree_root(tx: &mut Transaction) -> Result<PageId> {
    tx.alloc_page(Page::Node(Node::Leaf(LeafNode::new_root())))
}

/// Append one row to `minisql_schema`, allocating its row id from the
/// catalog table's own counter.
fn insert_schema_row(tx: &mut Transaction, row: &SchemaRow) -> Result<RowId> {
    let schema_table = tx.resolve_table(SCHEMA_TABLE)?;
    let row_id = schema_table.allocate_row_id();
    let payload = row.encode(tx)?;
    let mut tree = BTree::new(tx, schema_table.root_page, 8);
    tree.insert(&key::encode_row_id(row_id), payload)?;
    Ok(row_id)
}

/// Delete every catalog row matching `predicate`, freeing spilled DDL
/// text as it goes.
fn delete_schema_rows(
    tx: &mut Transaction,
    predicate: impl Fn(&SchemaRowView) -> bool,
) -> Result<()> {
    let schema_table = tx.resolve_table(SCHEMA_TABLE)?;
    let rows: Vec<(RowId, Vec<u8>)> = {
        let mut tree = BTree::new(tx, schema_table.root_page, 8);
        let mut cursor = tree.cursor_first()?;
        let mut rows = Vec::new();
        while let Some(cell) = tree.cursor_next(&mut cursor)? {
            rows.push((key::decode_row_id(&cell.key)?, cell.payload));
        }
        rows
    };

    for (row_id, payload) in rows {
        let values = record::decode_row(&schema_row_kinds(), &payload)?;
        let view = SchemaRowView::from_values(&values)?;
        if !predicate(&view) {
            continue;
        }
        if let Value::TextRef(r) = &values[4] {
            record::free_overflow(tx, r.first_page)?;
        }
        let mut tree = BTree::new(tx, schema_table.root_page, 8);
        tree.delete(&key::encode_row_id(row_id))?;
    }
    Ok(())
}

/// The identifying columns of a catalog row, decoded without resolving
/// spilled DDL text.
struct SchemaRowView {
    ty: i32,
    name: String,
    table_name: Option<String>,
}

impl SchemaRowView {
    fn from_values(values: &[Value]) -> Result<Self> {
        let ty = match &values[0] {
            Value::Int4(v) => *v,
            _ => return Err(Error::corrupt("catalog row: bad type column")),
        };
        let name = match &values[1] {
            Value::Text(s) => s.clone(),
            _ => return Err(Error::corrupt("catalog row: bad name column")),
        };
        let table_name = match &values[2] {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            _ => return Err(Error::corrupt("catalog row: bad table_name column")),
        };
        Ok(SchemaRowView {
            ty,
            name,
            table_name,
        })
    }
}

// ============================================================================
// DDL rendering
// ============================================================================

/// Canonical CREATE TABLE text stored in the catalog; it round-trips
/// through the parser at catalog load.
fn render_create_table(name: &str, columns: &[Column]) -> String {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        let mut part = format!("{} {}", column.name, column.kind);
        if column.primary_key {
            part.push_str(" PRIMARY KEY");
            if column.autoincrement {
                part.push_str(" AUTOINCREMENT");
            }
        }
        if column.unique && !column.primary_key {
            part.push_str(" UNIQUE");
        }
        if column.not_null && !column.primary_key {
            part.push_str(" NOT NULL");
        }
        match &column.default {
            Some(DefaultValue::Now) => part.push_str(" DEFAULT NOW()"),
            Some(DefaultValue::Literal(v)) => {
                part.push_str(" DEFAULT ");
                part.push_str(&sql_literal(v));
            }
            None => {}
        }
        parts.push(part);
    }
    format!("CREATE TABLE {} ({})", name, parts.join(", "))
}

fn render_create_index(name: &str, table: &str, column: &str) -> String {
    format!("CREATE INDEX {} ON {} ({})", name, table, column)
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Boolean(true) => "TRUE".into(),
        Value::Boolean(false) => "FALSE".into(),
        Value::Int4(v) => v.to_string(),
        Value::Int8(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Timestamp(v) => format!("'{}'", crate::types::format_timestamp(*v)),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::TextRef(_) => "NULL".into(),
    }
}
