//! Public API: database lifecycle, connections, prepared statements.

pub mod config;
pub mod connection;
pub mod database;
pub mod stmt;

pub use config::Config;
pub use connection::Connection;
pub use database::Database;
pub use stmt::PreparedStmt;
