//! Error types and Result alias.
//!
//! Every fallible operation in the engine returns [`Result`]. The variants
//! are the stable identifiers exposed at the crate boundary; internal layers
//! attach the offending name, key or page so callers can report precisely
//! what went wrong.

use thiserror::Error;

use crate::types::PageId;

/// Result type alias for all engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An insert or update would create a second entry for a unique key.
    /// Carries the name of the violated index, e.g. `pkey__users`.
    #[error("duplicate key in index {index}")]
    DuplicateKey { index: String },

    /// Optimistic concurrency validation failed at commit: another
    /// transaction committed a newer version of `page` after we read it.
    #[error("transaction conflict on page {page}")]
    TxConflict { page: PageId },

    /// A table, index or row that was looked up does not exist.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// CREATE TABLE of a name that already exists (without IF NOT EXISTS).
    #[error("table already exists: {name}")]
    TableExists { name: String },

    /// A statement referenced a column the table does not have.
    #[error("unknown column: {name}")]
    ColumnUnknown { name: String },

    /// A value is incompatible with the declared column kind, or violates
    /// a column constraint (NOT NULL, VARCHAR length).
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// An encoded row would not fit in a single leaf cell.
    #[error("row of {size} bytes exceeds the maximum payload of {max} bytes")]
    RowTooLarge { size: usize, max: usize },

    /// The caller's cancel token was set mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Underlying file I/O failed. `context` names the operation that was
    /// in flight (e.g. "journal write", "page flush").
    #[error("i/o error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// On-disk state failed validation while decoding.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The SQL text (or connection string) could not be parsed.
    #[error("invalid SQL: {0}")]
    InvalidSql(String),
}

impl Error {
    /// Wrap an io::Error with the operation that produced it.
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Error::Io { context, source }
    }

    /// Shorthand for a corruption error with a formatted message.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// True when the error indicates an OCC conflict the caller may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::TxConflict { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            context: "file access",
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DuplicateKey {
            index: "pkey__users".into(),
        };
        assert_eq!(format!("{}", err), "duplicate key in index pkey__users");

        let err = Error::TxConflict { page: 7 };
        assert_eq!(format!("{}", err), "transaction conflict on page 7");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        match err {
            Error::Io { context, .. } => assert_eq!(context, "file access"),
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_is_conflict() {
        assert!(Error::TxConflict { page: 1 }.is_conflict());
        assert!(!Error::Cancelled.is_conflict());
    }
}
