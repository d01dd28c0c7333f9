//! Database facade: open, recover, close.

use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::api::config::{parse_connection_string, Config};
use crate::api::connection::Connection;
use crate::error::Result;
use crate::schema::{bootstrap_zero_page, load_catalog};
use crate::storage::journal;
use crate::storage::pager::Pager;
use crate::txn::{DbShared, Transaction};
use crate::types::CancelToken;

/// An open database file. Cheap handles for statement execution come from
/// [`Database::connection`]; the database itself owns the shared pager,
/// page cache and catalog.
pub struct Database {
    shared: Arc<DbShared>,
}

impl Database {
    /// Open a database from a connection string:
    /// `path[?journal=...&log_level=...&max_cached_pages=...]`.
    pub fn open(conn_str: &str) -> Result<Database> {
        let (path, config) = parse_connection_string(conn_str)?;
        Self::open_with_config(&path, config)
    }

    /// Open a database file with an explicit configuration.
    pub fn open_with_config(path: &Path, config: Config) -> Result<Database> {
        log::set_max_level(config.log_level);
        let mut pager = Pager::open(path)?;

        // A journal on disk means a commit never finished; put the
        // committed state back before anything reads a page.
        if journal::recover(path, &mut pager)? {
            debug!("recovered {} from rollback journal", path.display());
        }

        if pager.file_pages()? == 0 {
            let bytes = bootstrap_zero_page(config.journal, config.max_cached_pages as u32)?;
            pager.write_page(0, &bytes)?;
            pager.sync()?;
            debug!("initialised fresh database at {}", path.display());
        }

        let shared = Arc::new(DbShared::new(
            path.to_path_buf(),
            config,
            pager,
            Default::default(),
        ));
        let catalog = {
            let mut tx = Transaction::begin(shared.clone(), CancelToken::new());
            load_catalog(&mut tx, 0)?
        };
        shared.replace_catalog(catalog);
        Ok(Database { shared })
    }

    /// A new connection over this database. Connections are independent;
    /// each can hold at most one explicit transaction.
    pub fn connection(&self) -> Connection {
        Connection::new(self.shared.clone())
    }

    /// Flush pending writes and sync the file. Outstanding connections
    /// keep working; this is the orderly shutdown point.
    pub fn close(self) -> Result<()> {
        self.shared.flush_dirty()?;
        self.shared.evict_all()?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best-effort flush; close() is the checked path.
        let _ = self.shared.flush_dirty();
    }
}
