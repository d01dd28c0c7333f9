//! Database configuration and connection-string parsing.
//!
//! A connection string is a file path optionally followed by `?`-separated
//! parameters: `path?journal=false&log_level=debug&max_cached_pages=64`.

use std::path::PathBuf;

use log::LevelFilter;

use crate::error::{Error, Result};
use crate::storage::pcache::DEFAULT_CACHE_PAGES;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Write a rollback journal around commits. Disabling trades
    /// durability for throughput: a crash mid-commit may corrupt the file.
    pub journal: bool,
    /// Logger verbosity, applied via `log::set_max_level`.
    pub log_level: LevelFilter,
    /// Page cache capacity in pages.
    pub max_cached_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            journal: true,
            log_level: LevelFilter::Warn,
            max_cached_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

/// Split a connection string into the database path and its configuration.
pub fn parse_connection_string(conn: &str) -> Result<(PathBuf, Config)> {
    let (path, params) = match conn.split_once('?') {
        Some((path, params)) => (path, Some(params)),
        None => (conn, None),
    };
    if path.is_empty() {
        return Err(Error::InvalidSql("empty database path".into()));
    }

    let mut config = Config::default();
    if let Some(params) = params {
        for pair in params.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::InvalidSql(format!("malformed parameter '{}'", pair)))?;
            match name {
                "journal" => {
                    config.journal = match value {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(Error::InvalidSql(format!(
                                "journal must be true or false, got '{}'",
                                other
                            )))
                        }
                    };
                }
                "log_level" => {
                    config.log_level = match value {
                        "debug" => LevelFilter::Debug,
                        "info" => LevelFilter::Info,
                        "warn" => LevelFilter::Warn,
                        "error" => LevelFilter::Error,
                        other => {
                            return Err(Error::InvalidSql(format!(
                                "unknown log_level '{}'",
                                other
                            )))
                        }
                    };
                }
                "max_cached_pages" => {
                    config.max_cached_pages = value.parse().map_err(|_| {
                        Error::InvalidSql(format!("max_cached_pages must be an integer, got '{}'", value))
                    })?;
                }
                other => {
                    return Err(Error::InvalidSql(format!(
                        "unrecognized connection parameter '{}'",
                        other
                    )))
                }
            }
        }
    }
    Ok((PathBuf::from(path), config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_path() {
        let (path, config) = parse_connection_string("/tmp/db.minisql").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/db.minisql"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_all_parameters() {
        let (_, config) =
            parse_connection_string("db?journal=false&log_level=debug&max_cached_pages=64")
                .unwrap();
        assert!(!config.journal);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.max_cached_pages, 64);
    }

    #[test]
    fn test_rejections() {
        assert!(parse_connection_string("").is_err());
        assert!(parse_connection_string("db?journal=maybe").is_err());
        assert!(parse_connection_string("db?log_level=loud").is_err());
        assert!(parse_connection_string("db?max_cached_pages=lots").is_err());
        assert!(parse_connection_string("db?nonsense=1").is_err());
    }
}
