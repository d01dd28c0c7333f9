//! Paged file I/O.
//!
//! The pager is the layer between the page cache and the OS file system:
//! byte-exact, page-aligned reads and writes against a single database
//! file. Pages past the end of the file are materialised as zero pages on
//! first read; writes extend the file as needed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{PageId, PAGE_SIZE};

/// Page-granular handle on the database file.
pub struct Pager {
    file: File,
    path: PathBuf,
}

impl Pager {
    /// Open (creating if absent) the database file at `path`.
    pub fn open(path: &Path) -> Result<Pager> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::io("database open", e))?;
        Ok(Pager {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of whole pages currently materialised in the file.
    pub fn file_pages(&self) -> Result<u32> {
        let len = self
            .file
            .metadata()
            .map_err(|e| Error::io("database stat", e))?
            .len();
        Ok((len / PAGE_SIZE as u64) as u32)
    }

    /// Read page `idx` into a fresh buffer. Reads past EOF (and short tail
    /// reads) yield zero bytes.
    pub fn read_page(&mut self, idx: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(idx as u64 * PAGE_SIZE as u64))
            .map_err(|e| Error::io("page seek", e))?;
        let mut read_total = 0usize;
        while read_total < buf.len() {
            let n = self
                .file
                .read(&mut buf[read_total..])
                .map_err(|e| Error::io("page read", e))?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        Ok(buf)
    }

    /// Write one full page at `idx`, extending the file if needed.
    pub fn write_page(&mut self, idx: PageId, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        self.file
            .seek(SeekFrom::Start(idx as u64 * PAGE_SIZE as u64))
            .map_err(|e| Error::io("page seek", e))?;
        self.file
            .write_all(bytes)
            .map_err(|e| Error::io("page write", e))?;
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io("database sync", e))
    }

    /// Shrink the file to exactly `pages` pages.
    pub fn truncate(&mut self, pages: u32) -> Result<()> {
        self.file
            .set_len(pages as u64 * PAGE_SIZE as u64)
            .map_err(|e| Error::io("database truncate", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_past_eof_is_zero_page() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("t.db")).unwrap();
        let page = pager.read_page(3).unwrap();
        assert_eq!(page, vec![0u8; PAGE_SIZE]);
        assert_eq!(pager.file_pages().unwrap(), 0);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("t.db")).unwrap();
        let mut bytes = vec![0u8; PAGE_SIZE];
        bytes[0] = 0xAA;
        bytes[PAGE_SIZE - 1] = 0x55;
        pager.write_page(2, &bytes).unwrap();
        assert_eq!(pager.file_pages().unwrap(), 3);
        assert_eq!(pager.read_page(2).unwrap(), bytes);
        // The skipped pages read back as zeroes.
        assert_eq!(pager.read_page(1).unwrap(), vec![0u8; PAGE_SIZE]);
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(&dir.path().join("t.db")).unwrap();
        pager.write_page(4, &vec![1u8; PAGE_SIZE]).unwrap();
        pager.truncate(2).unwrap();
        assert_eq!(pager.file_pages().unwrap(), 2);
        assert_eq!(pager.read_page(4).unwrap(), vec![0u8; PAGE_SIZE]);
    }
}
