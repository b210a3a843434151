#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use kcvgraph::primitives::bytes::StaticBuffer;
use kcvgraph::storage::backend::{EmbeddedOptions, EmbeddedStoreManager};
use kcvgraph::storage::kcv::{Entry, KeyColumnValueStore, SliceQuery, StoreManager};
use kcvgraph::storage::{Backend, BackendKind, StorageOptions};
use kcvgraph::Result;
use tempfile::tempdir;

fn row_key(i: u64) -> StaticBuffer {
    StaticBuffer::from_u64(i)
}

fn write_rows(dir: &Path, rows: std::ops::Range<u64>) -> Result<PathBuf> {
    let manager = EmbeddedStoreManager::open(&EmbeddedOptions::new(dir))?;
    let store = manager.open_store("edgestore")?;
    for i in rows {
        store.mutate(
            &row_key(i),
            &[Entry::new(StaticBuffer::from_u64(i), StaticBuffer::from("payload"))],
            &[],
        )?;
    }
    manager.close()?;
    Ok(manager.path().to_path_buf())
}

fn present(manager: &EmbeddedStoreManager, i: u64) -> Result<bool> {
    let store = manager.open_store("edgestore")?;
    Ok(!store.get_slice(&row_key(i), &SliceQuery::full_row())?.is_empty())
}

#[test]
fn torn_tail_is_discarded_and_cut_off() -> Result<()> {
    let dir = tempdir()?;
    let log = write_rows(dir.path(), 0..3)?;
    let clean_len = fs::metadata(&log)?.len();

    // Half a record header, as left by a crash in the middle of an append.
    let mut file = OpenOptions::new().append(true).open(&log)?;
    file.write_all(&[0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00])?;
    drop(file);

    let manager = EmbeddedStoreManager::open(&EmbeddedOptions::new(dir.path()))?;
    let stats = manager.replay_stats();
    assert_eq!(stats.records, 3);
    assert_eq!(stats.valid_len, clean_len);
    assert_eq!(stats.discarded_bytes, 7);
    assert_eq!(fs::metadata(&log)?.len(), clean_len);
    for i in 0..3 {
        assert!(present(&manager, i)?, "row {i} lost");
    }
    Ok(())
}

#[test]
fn corrupt_last_record_is_dropped_with_everything_after_it() -> Result<()> {
    let dir = tempdir()?;
    let log = write_rows(dir.path(), 0..4)?;
    let mut bytes = fs::read(&log)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&log, &bytes)?;

    let manager = EmbeddedStoreManager::open(&EmbeddedOptions::new(dir.path()))?;
    assert_eq!(manager.replay_stats().records, 3);
    assert!(manager.replay_stats().discarded_bytes > 0);
    assert!(present(&manager, 2)?);
    assert!(!present(&manager, 3)?);
    Ok(())
}

#[test]
fn appends_after_recovery_extend_a_valid_log() -> Result<()> {
    let dir = tempdir()?;
    let log = write_rows(dir.path(), 0..2)?;
    let mut file = OpenOptions::new().append(true).open(&log)?;
    file.write_all(&[0xDE, 0xAD])?;
    drop(file);

    {
        let manager = EmbeddedStoreManager::open(&EmbeddedOptions::new(dir.path()))?;
        let store = manager.open_store("edgestore")?;
        store.mutate(&row_key(10), &[Entry::column_only(row_key(1))], &[])?;
        store.mutate(&row_key(0), &[], &[row_key(0)])?;
        manager.close()?;
    }

    let manager = EmbeddedStoreManager::open(&EmbeddedOptions::new(dir.path()))?;
    let stats = manager.replay_stats();
    assert_eq!(stats.discarded_bytes, 0);
    assert_eq!(stats.records, 4);
    assert!(!present(&manager, 0)?, "deletion was not replayed");
    assert!(present(&manager, 1)?);
    assert!(present(&manager, 10)?);
    Ok(())
}

#[test]
fn committed_transactions_survive_reopen_through_the_selector() -> Result<()> {
    let dir = tempdir()?;
    let options = StorageOptions::embedded(dir.path());
    assert_eq!(options.backend, BackendKind::Embedded);
    {
        let backend = Backend::open(options.clone())?;
        let mut tx = backend.begin();
        for i in 0..5 {
            tx.mutate("graphindex", &row_key(i), &[Entry::column_only(row_key(i))], &[])?;
        }
        tx.commit()?;
        backend.close()?;
    }
    let backend = Backend::open(options)?;
    assert!(backend.features().persistent);
    let store = backend.store("graphindex")?;
    for i in 0..5 {
        assert_eq!(store.get_slice(&row_key(i), &SliceQuery::full_row())?.len(), 1);
    }
    Ok(())
}
