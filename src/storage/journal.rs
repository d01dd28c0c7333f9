//! Rollback journal.
//!
//! Before the main file is touched during a commit, the pre-images of every
//! page the transaction dirtied are written to `<dbpath>-journal` and
//! synced. A journal found on disk at open therefore means a commit did not
//! finish: recovery replays every pre-image, truncates growth made by the
//! aborted transaction, and deletes the journal.
//!
//! File layout: `{u32 magic, u32 original_total_pages}` followed by zero or
//! more `{u32 page_idx, [PAGE_SIZE]u8 pre_image}` entries.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::btree::encoding::{read_u32, write_u32};
use crate::storage::pager::Pager;
use crate::types::{PageId, PAGE_SIZE};

/// Journal header magic, "MSJL" in little-endian byte order.
pub const JOURNAL_MAGIC: u32 = 0x4C4A_534D;

/// Size of the journal header in bytes.
pub const JOURNAL_HEADER_SIZE: usize = 8;

/// Size of one journal entry in bytes.
pub const JOURNAL_ENTRY_SIZE: usize = 4 + PAGE_SIZE;

/// Journal file path for a database at `db_path`.
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

/// Commit step 1: persist the header and every pre-image, then fsync.
///
/// Failures here surface before the main file has been touched, so the
/// committed state is still intact on disk.
pub fn write(db_path: &Path, original_total_pages: u32, entries: &[(PageId, Vec<u8>)]) -> Result<()> {
    let path = journal_path(db_path);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| Error::io("journal open", e))?;

    let mut header = [0u8; JOURNAL_HEADER_SIZE];
    write_u32(&mut header, 0, JOURNAL_MAGIC);
    write_u32(&mut header, 4, original_total_pages);
    file.write_all(&header)
        .map_err(|e| Error::io("journal write", e))?;

    for (idx, pre_image) in entries {
        debug_assert_eq!(pre_image.len(), PAGE_SIZE);
        let mut frame = [0u8; 4];
        write_u32(&mut frame, 0, *idx);
        file.write_all(&frame)
            .map_err(|e| Error::io("journal write", e))?;
        file.write_all(pre_image)
            .map_err(|e| Error::io("journal write", e))?;
    }

    file.sync_all().map_err(|e| Error::io("journal sync", e))?;
    debug!(
        "journal written: {} pre-images, original size {} pages",
        entries.len(),
        original_total_pages
    );
    Ok(())
}

/// Commit step 4: the commit is durable, discard the journal.
pub fn release(db_path: &Path) -> Result<()> {
    let path = journal_path(db_path);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("journal delete", e)),
    }
}

/// Roll the main file back from a journal left by an unfinished commit.
///
/// Returns `true` when pre-images were replayed. A journal too short to
/// contain a valid header means the interrupted commit never reached its
/// main-file writes, so the database is already consistent and the journal
/// is simply dropped; the same holds for a truncated trailing entry.
pub fn recover(db_path: &Path, pager: &mut Pager) -> Result<bool> {
    let path = journal_path(db_path);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io("journal open", e)),
    };

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| Error::io("journal read", e))?;
    drop(file);

    if contents.len() < JOURNAL_HEADER_SIZE || read_u32(&contents, 0)? != JOURNAL_MAGIC {
        warn!("discarding malformed journal at {:?}", path);
        release(db_path)?;
        return Ok(false);
    }
    let original_total_pages = read_u32(&contents, 4)?;

    let mut replayed = 0usize;
    let mut pos = JOURNAL_HEADER_SIZE;
    while pos + JOURNAL_ENTRY_SIZE <= contents.len() {
        let idx = read_u32(&contents, pos)?;
        let pre_image = &contents[pos + 4..pos + JOURNAL_ENTRY_SIZE];
        pager.write_page(idx, pre_image)?;
        replayed += 1;
        pos += JOURNAL_ENTRY_SIZE;
    }
    if pos != contents.len() {
        warn!("journal has a truncated trailing entry; ignored");
    }

    pager.truncate(original_total_pages)?;
    pager.sync()?;
    release(db_path)?;
    debug!(
        "journal recovery replayed {} pages, truncated to {} pages",
        replayed, original_total_pages
    );
    Ok(replayed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    #[test]
    fn test_recover_without_journal_is_noop() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut pager = Pager::open(&db).unwrap();
        assert!(!recover(&db, &mut pager).unwrap());
    }

    #[test]
    fn test_write_and_recover_restores_pre_images() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut pager = Pager::open(&db).unwrap();

        // Committed state: two pages.
        pager.write_page(0, &page_of(1)).unwrap();
        pager.write_page(1, &page_of(2)).unwrap();

        // A transaction journals its pre-images, then dies mid-flush after
        // scribbling on page 1 and growing the file.
        write(&db, 2, &[(1, page_of(2))]).unwrap();
        pager.write_page(1, &page_of(0xEE)).unwrap();
        pager.write_page(2, &page_of(0xEE)).unwrap();

        let mut pager = Pager::open(&db).unwrap();
        assert!(recover(&db, &mut pager).unwrap());
        assert_eq!(pager.read_page(1).unwrap(), page_of(2));
        assert_eq!(pager.file_pages().unwrap(), 2);
        assert!(!journal_path(&db).exists());
    }

    #[test]
    fn test_malformed_journal_is_dropped() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        std::fs::write(journal_path(&db), b"not a journal").unwrap();
        let mut pager = Pager::open(&db).unwrap();
        assert!(!recover(&db, &mut pager).unwrap());
        assert!(!journal_path(&db).exists());
    }

    #[test]
    fn test_truncated_entry_is_ignored() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let mut pager = Pager::open(&db).unwrap();
        pager.write_page(0, &page_of(7)).unwrap();

        write(&db, 1, &[(0, page_of(7))]).unwrap();
        // Append half an entry, as a crash mid-append would.
        let mut f = OpenOptions::new()
            .append(true)
            .open(journal_path(&db))
            .unwrap();
        f.write_all(&[9u8; 100]).unwrap();
        drop(f);

        pager.write_page(0, &page_of(0xEE)).unwrap();
        assert!(recover(&db, &mut pager).unwrap());
        assert_eq!(pager.read_page(0).unwrap(), page_of(7));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        release(&db).unwrap();
        write(&db, 0, &[]).unwrap();
        release(&db).unwrap();
        release(&db).unwrap();
    }
}
