//! Schema and catalog management.
//!
//! The catalog is the system table `minisql_schema`, a B+ tree rooted in
//! page 0 with one row per table and one row per index. At open the rows
//! are loaded into an in-memory map of [`TableSchema`]s; DDL statements
//! append or delete rows and the in-memory map is updated on commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::parser::ast::{ColumnDef, Expr, Stmt};
use crate::parser::parse;
use crate::storage::btree::{key, BTree};
use crate::storage::page::{DbHeader, LeafCell, LeafNode, Node, Page, ZeroPage};
use crate::storage::record::{self, MAX_COLUMNS};
use crate::storage::PageStore;
use crate::types::{DataType, PageId, RowId, Value, PAGE_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Name of the system catalog table.
pub const SCHEMA_TABLE: &str = "minisql_schema";

/// The catalog's own creation DDL, stored in its self-describing row.
pub const SCHEMA_TABLE_SQL: &str = "CREATE TABLE minisql_schema (\
type INT4 NOT NULL, \
name VARCHAR(255) NOT NULL, \
table_name VARCHAR(255), \
root_page INT4, \
sql TEXT)";

/// Catalog row `type` values.
pub const SCHEMA_TYPE_TABLE: i32 = 1;
pub const SCHEMA_TYPE_PRIMARY: i32 = 2;
pub const SCHEMA_TYPE_UNIQUE: i32 = 3;
pub const SCHEMA_TYPE_SECONDARY: i32 = 4;

/// Column kinds of a catalog row.
pub fn schema_row_kinds() -> [DataType; 5] {
    [
        DataType::Int4,
        DataType::Varchar(255),
        DataType::Varchar(255),
        DataType::Int4,
        DataType::Text,
    ]
}

/// Name of the implicit primary key index of `table`.
pub fn pkey_index_name(table: &str) -> String {
    format!("pkey__{}", table)
}

/// Name of the implicit unique / default secondary index on one column.
pub fn key_index_name(table: &str, column: &str) -> String {
    format!("key__{}__{}", table, column)
}

// ============================================================================
// Table Schema
// ============================================================================

/// DEFAULT clause of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(Value),
    /// `NOW()`, evaluated once per row at insert time.
    Now,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: DataType,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub unique: bool,
    pub not_null: bool,
    pub default: Option<DefaultValue>,
}

/// Index classification, mirroring the catalog `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    PrimaryKey,
    Unique,
    Secondary,
}

impl IndexKind {
    pub fn schema_type(&self) -> i32 {
        match self {
            IndexKind::PrimaryKey => SCHEMA_TYPE_PRIMARY,
            IndexKind::Unique => SCHEMA_TYPE_UNIQUE,
            IndexKind::Secondary => SCHEMA_TYPE_SECONDARY,
        }
    }

    pub fn from_schema_type(ty: i32) -> Result<Self> {
        match ty {
            SCHEMA_TYPE_PRIMARY => Ok(IndexKind::PrimaryKey),
            SCHEMA_TYPE_UNIQUE => Ok(IndexKind::Unique),
            SCHEMA_TYPE_SECONDARY => Ok(IndexKind::Secondary),
            other => Err(Error::corrupt(format!("bad index type {}", other))),
        }
    }

    /// Whether entries must be unique on the key prefix.
    pub fn is_unique(&self) -> bool {
        matches!(self, IndexKind::PrimaryKey | IndexKind::Unique)
    }
}

/// One index of a table: a single-column B+ tree keyed by the encoded
/// column value plus the row id.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    pub kind: IndexKind,
    pub column: String,
    pub root_page: PageId,
}

/// In-memory description of one table.
#[derive(Debug)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexSchema>,
    pub root_page: PageId,
    pub sql: String,
    /// Next row id to hand out; strictly monotonic for the table's life.
    next_row_id: AtomicU64,
}

impl TableSchema {
    pub fn new(name: String, columns: Vec<Column>, root_page: PageId, sql: String) -> Self {
        TableSchema {
            name,
            columns,
            indexes: Vec::new(),
            root_page,
            sql,
            next_row_id: AtomicU64::new(1),
        }
    }

    /// The built-in definition of the catalog table itself.
    pub fn catalog() -> Self {
        let defs = match parse(SCHEMA_TABLE_SQL) {
            Ok(stmts) => match stmts.into_iter().next() {
                Some(Stmt::CreateTable(ct)) => ct.columns,
                _ => unreachable!("catalog DDL is a CREATE TABLE"),
            },
            Err(_) => unreachable!("catalog DDL parses"),
        };
        let columns = columns_from_defs(&defs).expect("catalog DDL is valid");
        TableSchema::new(SCHEMA_TABLE.into(), columns, 0, SCHEMA_TABLE_SQL.into())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Declared kinds in column order, the row codec's input.
    pub fn kinds(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.kind).collect()
    }

    pub fn primary_key(&self) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.primary_key)
    }

    pub fn index_named(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Indexes covering `column`, unique ones first.
    pub fn index_on_column(&self, column: &str) -> Option<&IndexSchema> {
        self.indexes
            .iter()
            .filter(|i| i.column == column)
            .min_by_key(|i| i.kind.schema_type())
    }

    /// Widest possible encoded key of `index`, for tree fan-out.
    pub fn index_key_width(&self, index: &IndexSchema) -> usize {
        let kind = self
            .column(&index.column)
            .map(|c| c.kind)
            .unwrap_or(DataType::Text);
        key::max_key_width(&[kind])
    }

    /// Hand out the next row id.
    pub fn allocate_row_id(&self) -> RowId {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Raise the counter after an explicit key insert or a catalog load.
    pub fn observe_row_id(&self, row_id: RowId) {
        self.next_row_id.fetch_max(row_id + 1, Ordering::SeqCst);
    }

    pub fn peek_next_row_id(&self) -> RowId {
        self.next_row_id.load(Ordering::SeqCst)
    }

    /// Copy of this schema with one more index. The row id counter carries
    /// over.
    pub fn with_index(&self, index: IndexSchema) -> TableSchema {
        let mut clone = self.clone_shape();
        clone.indexes.push(index);
        clone
    }

    /// Copy of this schema minus the named index.
    pub fn without_index(&self, index_name: &str) -> TableSchema {
        let mut clone = self.clone_shape();
        clone.indexes.retain(|i| i.name != index_name);
        clone
    }

    fn clone_shape(&self) -> TableSchema {
        TableSchema {
            name: self.name.clone(),
            columns: self.columns.clone(),
            indexes: self.indexes.clone(),
            root_page: self.root_page,
            sql: self.sql.clone(),
            next_row_id: AtomicU64::new(self.peek_next_row_id()),
        }
    }
}

/// Validate and convert parsed column definitions.
pub fn columns_from_defs(defs: &[ColumnDef]) -> Result<Vec<Column>> {
    if defs.is_empty() {
        return Err(Error::InvalidSql("a table needs at least one column".into()));
    }
    if defs.len() > MAX_COLUMNS {
        return Err(Error::InvalidSql(format!(
            "at most {} columns per table",
            MAX_COLUMNS
        )));
    }

    let mut seen_pk = false;
    let mut columns = Vec::with_capacity(defs.len());
    for def in defs {
        if columns.iter().any(|c: &Column| c.name == def.name) {
            return Err(Error::InvalidSql(format!(
                "duplicate column name {}",
                def.name
            )));
        }
        if def.primary_key {
            if seen_pk {
                return Err(Error::InvalidSql("at most one PRIMARY KEY column".into()));
            }
            seen_pk = true;
            if !def.kind.is_primary_key_capable() {
                return Err(Error::TypeMismatch(format!(
                    "{} cannot be a PRIMARY KEY column",
                    def.kind
                )));
            }
        }
        if def.unique && matches!(def.kind, DataType::Text) {
            return Err(Error::InvalidSql(
                "UNIQUE requires an indexable column kind; TEXT is not".into(),
            ));
        }
        if def.autoincrement && !matches!(def.kind, DataType::Int4 | DataType::Int8) {
            return Err(Error::InvalidSql(
                "AUTOINCREMENT requires an integer PRIMARY KEY".into(),
            ));
        }
        let default = match &def.default {
            None => None,
            Some(Expr::Now) => Some(DefaultValue::Now),
            Some(Expr::Literal(v)) => Some(DefaultValue::Literal(v.clone())),
            Some(Expr::Placeholder(_)) => {
                return Err(Error::InvalidSql(
                    "DEFAULT must be a literal or NOW()".into(),
                ))
            }
        };
        columns.push(Column {
            name: def.name.clone(),
            kind: def.kind,
            primary_key: def.primary_key,
            autoincrement: def.autoincrement,
            unique: def.unique,
            not_null: def.not_null || def.primary_key,
            default,
        });
    }
    Ok(columns)
}

// ============================================================================
// Catalog Rows
// ============================================================================

/// One decoded row of `minisql_schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRow {
    pub row_id: RowId,
    pub ty: i32,
    pub name: String,
    pub table_name: Option<String>,
    pub root_page: PageId,
    pub sql: Option<String>,
}

impl SchemaRow {
    /// Serialise for storage, spilling a long `sql` into overflow pages.
    pub fn encode<S: PageStore>(&self, store: &mut S) -> Result<Vec<u8>> {
        let sql_value = match &self.sql {
            None => Value::Null,
            Some(sql) if sql.len() <= record::INLINE_TEXT_MAX => Value::Text(sql.clone()),
            Some(sql) => Value::TextRef(record::store_long_text(store, sql)?),
        };
        let values = [
            Value::Int4(self.ty),
            Value::Text(self.name.clone()),
            self.table_name
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null),
            Value::Int4(self.root_page as i32),
            sql_value,
        ];
        record::encode_row(&schema_row_kinds(), &values)
    }

    /// Decode a stored catalog row, resolving a spilled `sql`.
    pub fn decode<S: PageStore>(store: &mut S, row_id: RowId, payload: &[u8]) -> Result<SchemaRow> {
        let values = record::decode_row(&schema_row_kinds(), payload)?;
        let [ty, name, table_name, root_page, sql] = <[Value; 5]>::try_from(values)
            .map_err(|_| Error::corrupt("catalog row arity"))?;
        let ty = match ty {
            Value::Int4(v) => v,
            _ => return Err(Error::corrupt("catalog row: bad type column")),
        };
        let name = match name {
            Value::Text(s) => s,
            _ => return Err(Error::corrupt("catalog row: bad name column")),
        };
        let table_name = match table_name {
            Value::Null => None,
            Value::Text(s) => Some(s),
            _ => return Err(Error::corrupt("catalog row: bad table_name column")),
        };
        let root_page = match root_page {
            Value::Int4(v) if v >= 0 => v as PageId,
            Value::Null => 0,
            _ => return Err(Error::corrupt("catalog row: bad root_page column")),
        };
        let sql = match sql {
            Value::Null => None,
            Value::Text(s) => Some(s),
            Value::TextRef(r) => Some(record::resolve_text(store, &r)?),
            _ => return Err(Error::corrupt("catalog row: bad sql column")),
        };
        Ok(SchemaRow {
            row_id,
            ty,
            name,
            table_name,
            root_page,
            sql,
        })
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// DDL effect applied to the in-memory catalog when its transaction
/// commits.
#[derive(Debug, Clone)]
pub enum DdlOp {
    CreateTable(Arc<TableSchema>),
    DropTable(String),
    CreateIndex {
        table: String,
        index: IndexSchema,
    },
    DropIndex {
        table: String,
        index: String,
    },
}

/// The in-memory map of live tables.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl Catalog {
    pub fn get(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn insert(&mut self, table: Arc<TableSchema>) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.values()
    }

    /// The table owning the index `name`, if any.
    pub fn table_of_index(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables
            .values()
            .find(|t| t.index_named(name).is_some())
            .cloned()
    }

    /// Apply a committed DDL effect.
    pub fn apply(&mut self, op: &DdlOp) {
        match op {
            DdlOp::CreateTable(table) => {
                self.tables.insert(table.name.clone(), table.clone());
            }
            DdlOp::DropTable(name) => {
                self.tables.remove(name);
            }
            DdlOp::CreateIndex { table, index } => {
                if let Some(existing) = self.tables.get(table) {
                    let updated = Arc::new(existing.with_index(index.clone()));
                    self.tables.insert(table.clone(), updated);
                }
            }
            DdlOp::DropIndex { table, index } => {
                if let Some(existing) = self.tables.get(table) {
                    let updated = Arc::new(existing.without_index(index));
                    self.tables.insert(table.clone(), updated);
                }
            }
        }
    }
}

// ============================================================================
// Bootstrap and Load
// ============================================================================

/// Build the initial page 0 of a fresh database: header plus a catalog
/// root leaf holding the single row that describes `minisql_schema`
/// itself.
pub fn bootstrap_zero_page(journal_enabled: bool, cache_pages_hint: u32) -> Result<Vec<u8>> {
    let self_row = SchemaRow {
        row_id: 1,
        ty: SCHEMA_TYPE_TABLE,
        name: SCHEMA_TABLE.into(),
        table_name: None,
        root_page: 0,
        sql: Some(SCHEMA_TABLE_SQL.into()),
    };
    // The bootstrap row is short; it never spills, so no store is needed.
    debug_assert!(SCHEMA_TABLE_SQL.len() <= record::INLINE_TEXT_MAX);
    let values = [
        Value::Int4(self_row.ty),
        Value::Text(self_row.name.clone()),
        Value::Null,
        Value::Int4(0),
        Value::Text(SCHEMA_TABLE_SQL.into()),
    ];
    let payload = record::encode_row(&schema_row_kinds(), &values)?;

    let mut root = LeafNode::new_root();
    root.cells.push(LeafCell {
        key: key::encode_row_id(self_row.row_id),
        payload,
    });
    let zero = Page::Zero(ZeroPage {
        header: DbHeader::new(1, journal_enabled, cache_pages_hint),
        node: Node::Leaf(root),
    });
    let bytes = zero.encode(0)?;
    debug_assert_eq!(bytes.len(), PAGE_SIZE);
    Ok(bytes)
}

/// Load every schema row from the catalog tree rooted at `root` and build
/// the in-memory catalog, recovering each table's autoincrement counter
/// from its maximum row id.
pub fn load_catalog<S: PageStore>(store: &mut S, root: PageId) -> Result<Catalog> {
    let raw: Vec<(RowId, Vec<u8>)> = {
        let mut tree = BTree::new(store, root, 8);
        let mut cursor = tree.cursor_first()?;
        let mut rows = Vec::new();
        while let Some(cell) = tree.cursor_next(&mut cursor)? {
            rows.push((key::decode_row_id(&cell.key)?, cell.payload));
        }
        rows
    };

    let mut schema_rows = Vec::with_capacity(raw.len());
    for (row_id, payload) in raw {
        schema_rows.push(SchemaRow::decode(store, row_id, &payload)?);
    }

    let mut catalog = Catalog::default();
    // Tables first, so index rows can attach.
    let mut tables: HashMap<String, TableSchema> = HashMap::new();
    for row in schema_rows.iter().filter(|r| r.ty == SCHEMA_TYPE_TABLE) {
        let sql = row
            .sql
            .as_deref()
            .ok_or_else(|| Error::corrupt("table row without sql"))?;
        let stmts = parse(sql)?;
        let Some(Stmt::CreateTable(ct)) = stmts.into_iter().next() else {
            return Err(Error::corrupt(format!("bad DDL for table {}", row.name)));
        };
        let columns = columns_from_defs(&ct.columns)?;
        tables.insert(
            row.name.clone(),
            TableSchema::new(row.name.clone(), columns, row.root_page, sql.to_string()),
        );
    }

    for row in schema_rows.iter().filter(|r| r.ty != SCHEMA_TYPE_TABLE) {
        let kind = IndexKind::from_schema_type(row.ty)?;
        let owner = row
            .table_name
            .as_deref()
            .ok_or_else(|| Error::corrupt("index row without table_name"))?;
        let table = tables
            .get_mut(owner)
            .ok_or_else(|| Error::corrupt(format!("index {} references unknown table", row.name)))?;
        let column = index_column(table, row)?;
        table.indexes.push(IndexSchema {
            name: row.name.clone(),
            kind,
            column,
            root_page: row.root_page,
        });
    }

    for (_, table) in tables {
        // Recover the autoincrement counter from the clustered tree.
        let max = {
            let mut tree = BTree::new(store, table.root_page, 8);
            tree.max_key()?
        };
        if let Some(max_key) = max {
            table.observe_row_id(key::decode_row_id(&max_key)?);
        }
        catalog.insert(Arc::new(table));
    }
    Ok(catalog)
}

/// Work out which column an index row covers: from its stored DDL when
/// present, else from the generated-name convention.
fn index_column(table: &TableSchema, row: &SchemaRow) -> Result<String> {
    if let Some(sql) = &row.sql {
        let stmts = parse(sql)?;
        if let Some(Stmt::CreateIndex(ci)) = stmts.into_iter().next() {
            return Ok(ci.column);
        }
        return Err(Error::corrupt(format!("bad DDL for index {}", row.name)));
    }
    if row.name == pkey_index_name(&table.name) {
        let (_, pk) = table
            .primary_key()
            .ok_or_else(|| Error::corrupt("pkey index on table without PRIMARY KEY"))?;
        return Ok(pk.name.clone());
    }
    let prefix = format!("key__{}__", table.name);
    if let Some(column) = row.name.strip_prefix(&prefix) {
        return Ok(column.to_string());
    }
    Err(Error::corrupt(format!(
        "cannot derive column of index {}",
        row.name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::MemStore;

    fn defs(sql: &str) -> Vec<ColumnDef> {
        let stmts = parse(sql).unwrap();
        match stmts.into_iter().next() {
            Some(Stmt::CreateTable(ct)) => ct.columns,
            _ => panic!("expected CREATE TABLE"),
        }
    }

    #[test]
    fn test_columns_from_defs_validation() {
        assert!(columns_from_defs(&defs("CREATE TABLE t (a INT4, b INT4)")).is_ok());
        assert!(columns_from_defs(&defs(
            "CREATE TABLE t (a INT4 PRIMARY KEY, b INT4 PRIMARY KEY)"
        ))
        .is_err());
        assert!(columns_from_defs(&defs("CREATE TABLE t (a TEXT PRIMARY KEY)")).is_err());
        assert!(columns_from_defs(&defs("CREATE TABLE t (a INT4, a INT8)")).is_err());
        assert!(columns_from_defs(&defs("CREATE TABLE t (a VARCHAR(20) AUTOINCREMENT)")).is_err());
    }

    #[test]
    fn test_primary_key_implies_not_null() {
        let cols = columns_from_defs(&defs("CREATE TABLE t (id INT8 PRIMARY KEY)")).unwrap();
        assert!(cols[0].not_null);
    }

    #[test]
    fn test_catalog_table_definition() {
        let cat = TableSchema::catalog();
        assert_eq!(cat.name, SCHEMA_TABLE);
        assert_eq!(cat.root_page, 0);
        assert_eq!(cat.columns.len(), 5);
        assert_eq!(cat.columns[0].kind, DataType::Int4);
        assert!(cat.columns[1].not_null);
    }

    #[test]
    fn test_row_id_counter() {
        let table = TableSchema::new("t".into(), vec![], 3, "sql".into());
        assert_eq!(table.allocate_row_id(), 1);
        assert_eq!(table.allocate_row_id(), 2);
        table.observe_row_id(10);
        assert_eq!(table.allocate_row_id(), 11);
        // Observing a smaller id never lowers the counter.
        table.observe_row_id(3);
        assert_eq!(table.allocate_row_id(), 12);
    }

    #[test]
    fn test_schema_row_round_trip_inline_and_overflow() {
        let mut store = MemStore::new();
        let short = SchemaRow {
            row_id: 2,
            ty: SCHEMA_TYPE_TABLE,
            name: "users".into(),
            table_name: None,
            root_page: 5,
            sql: Some("CREATE TABLE users (id INT8 PRIMARY KEY)".into()),
        };
        let payload = short.encode(&mut store).unwrap();
        assert_eq!(SchemaRow::decode(&mut store, 2, &payload).unwrap(), short);

        let long = SchemaRow {
            sql: Some(format!("CREATE TABLE users (a INT4) -- {}", "x".repeat(600))),
            ..short.clone()
        };
        let payload = long.encode(&mut store).unwrap();
        assert_eq!(SchemaRow::decode(&mut store, 2, &payload).unwrap(), long);
    }

    #[test]
    fn test_bootstrap_and_load() {
        let mut store = MemStore::new();
        // Stand the bootstrap page up at a MemStore-assigned index, then
        // load the catalog from it.
        let bytes = bootstrap_zero_page(true, 1000).unwrap();
        let page = Page::decode(0, &bytes).unwrap();
        let root = store.alloc_page(page).unwrap();

        let catalog = load_catalog(&mut store, root).unwrap();
        let schema = catalog.get(SCHEMA_TABLE).unwrap();
        assert_eq!(schema.columns.len(), 5);
        assert_eq!(schema.peek_next_row_id(), 2);
    }

    #[test]
    fn test_catalog_apply_index_ops() {
        let mut catalog = Catalog::default();
        let table = Arc::new(TableSchema::new(
            "t".into(),
            columns_from_defs(&defs("CREATE TABLE t (id INT8 PRIMARY KEY, v INT4)")).unwrap(),
            4,
            "CREATE TABLE t (id INT8 PRIMARY KEY, v INT4)".into(),
        ));
        catalog.apply(&DdlOp::CreateTable(table));

        let index = IndexSchema {
            name: key_index_name("t", "v"),
            kind: IndexKind::Secondary,
            column: "v".into(),
            root_page: 9,
        };
        catalog.apply(&DdlOp::CreateIndex {
            table: "t".into(),
            index: index.clone(),
        });
        assert_eq!(
            catalog.table_of_index(&index.name).unwrap().name,
            "t".to_string()
        );

        catalog.apply(&DdlOp::DropIndex {
            table: "t".into(),
            index: index.name.clone(),
        });
        assert!(catalog.table_of_index(&index.name).is_none());

        catalog.apply(&DdlOp::DropTable("t".into()));
        assert!(!catalog.contains("t"));
    }
}
