#![forbid(unsafe_code)]
//! File-backed adapter: every store lives in memory and every mutation is
//! first appended to a checksummed log that is replayed on open.
//!
//! Log record layout (all integers big-endian):
//!
//! ```text
//! len:u32 | seq:u64 | crc32:u32 | payload[len]
//! payload = var(name_len) name | var(key_len) key
//!         | var(#deletions) (var(len) column)*
//!         | var(#additions) (var(len) column var(len) value)*
//! ```
//!
//! The CRC covers `seq || payload`. Replay stops at the first record that is
//! truncated, fails its checksum or is out of sequence; the file is cut back
//! to the last good record so later appends extend a valid log. An append
//! that fails halfway is cut back the same way before the error is returned.
//!
//! The log grows with every mutation and open replays all of it. Nothing
//! compacts it implicitly; hosts call [`EmbeddedStoreManager::compact`] to
//! rewrite it as a snapshot of the live rows.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::primitives::bytes::buf::{ReadCursor, WriteBuffer};
use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::{
    Entry, EntryList, KcvMutation, KeyColumnValueStore, KeyIterator, KeyRange, KeySelector,
    PagedKeyIterator, SliceQuery, StoreFeatures, StoreManager, StoreMutations,
};
use crate::types::{record_crc32, KcvError, Result};

use super::memory::{apply_row, cas_cell, scan_page, slice_row, Table};

const LOG_FILE: &str = "kcv.log";
const RECORD_HEADER_LEN: usize = 16;
const SCAN_PAGE_ROWS: usize = 256;

/// Byte sink under the log writer.
trait LogFile: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn sync_data(&mut self) -> io::Result<()>;
    fn sync_all(&mut self) -> io::Result<()>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    fn seek_to(&mut self, pos: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(self, bytes)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(pos)).map(|_| ())
    }
}

fn encode_frame(seq: u64, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| KcvError::invalid(format!("row mutation of {} bytes", payload.len())))?;
    let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&record_crc32(seq, payload).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Append side of the log, shared by every store of one manager.
///
/// `len` is the end of the last acknowledged record. A failed append is cut
/// back to it; when that also fails the writer is poisoned and refuses
/// further appends.
struct LogWriter {
    file: Box<dyn LogFile>,
    len: u64,
    next_seq: u64,
    sync_writes: bool,
    records_appended: u64,
    poisoned: bool,
}

impl LogWriter {
    fn new(file: Box<dyn LogFile>, len: u64, next_seq: u64, sync_writes: bool) -> Self {
        Self {
            file,
            len,
            next_seq,
            sync_writes,
            records_appended: 0,
            poisoned: false,
        }
    }

    fn append(
        &mut self,
        store: &str,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
    ) -> Result<()> {
        if self.poisoned {
            return Err(KcvError::persistence(
                store,
                KcvError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "log writer poisoned by an unrecoverable append failure",
                )),
            ));
        }
        let payload = encode_row(store, key, additions, deletions);
        let frame = encode_frame(self.next_seq, &payload)?;
        if let Err(err) = self.write_frame(&frame) {
            self.cut_back();
            return Err(err.into());
        }
        self.len += frame.len() as u64;
        self.next_seq += 1;
        self.records_appended += 1;
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn cut_back(&mut self) {
        let len = self.len;
        match self.file.set_len(len).and_then(|()| self.file.seek_to(len)) {
            Ok(()) => warn!(len, seq = self.next_seq, "kcv.embedded.append.rolled_back"),
            Err(err) => {
                self.poisoned = true;
                warn!(len, error = %err, "kcv.embedded.append.poisoned");
            }
        }
    }

    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek_to(0)?;
        self.file.sync_all()?;
        self.len = 0;
        self.next_seq = 0;
        self.poisoned = false;
        Ok(())
    }
}

fn encode_row(
    store: &str,
    key: &StaticBuffer,
    additions: &[Entry],
    deletions: &[StaticBuffer],
) -> Vec<u8> {
    let mut out = WriteBuffer::new();
    out.put_var_u64(store.len() as u64).put_slice(store.as_bytes());
    out.put_var_u64(key.len() as u64).put_slice(key);
    out.put_var_u64(deletions.len() as u64);
    for column in deletions {
        out.put_var_u64(column.len() as u64).put_slice(column);
    }
    out.put_var_u64(additions.len() as u64);
    for entry in additions {
        out.put_var_u64(entry.column.len() as u64)
            .put_slice(&entry.column);
        out.put_var_u64(entry.value.len() as u64)
            .put_slice(&entry.value);
    }
    out.freeze().into_bytes().to_vec()
}

fn take_sized<'a>(cur: &mut ReadCursor<'a>) -> Result<&'a [u8]> {
    let len = cur.get_var_u64()?;
    let len = usize::try_from(len)
        .map_err(|_| KcvError::corruption(format!("log field length {len} overflows")))?;
    cur.take(len)
}

struct DecodedRow {
    store: String,
    key: StaticBuffer,
    additions: Vec<Entry>,
    deletions: Vec<StaticBuffer>,
}

fn decode_row(payload: &[u8]) -> Result<DecodedRow> {
    let mut cur = ReadCursor::new(payload);
    let store = std::str::from_utf8(take_sized(&mut cur)?)
        .map_err(|_| KcvError::corruption("log store name is not utf-8"))?
        .to_string();
    let key = StaticBuffer::copy_from_slice(take_sized(&mut cur)?);
    let deletion_count = cur.get_var_u64()?;
    let mut deletions = Vec::new();
    for _ in 0..deletion_count {
        deletions.push(StaticBuffer::copy_from_slice(take_sized(&mut cur)?));
    }
    let addition_count = cur.get_var_u64()?;
    let mut additions = Vec::new();
    for _ in 0..addition_count {
        let column = StaticBuffer::copy_from_slice(take_sized(&mut cur)?);
        let value = StaticBuffer::copy_from_slice(take_sized(&mut cur)?);
        additions.push(Entry::new(column, value));
    }
    if !cur.is_exhausted() {
        return Err(KcvError::corruption(format!(
            "{} trailing bytes in log record",
            cur.remaining()
        )));
    }
    Ok(DecodedRow {
        store,
        key,
        additions,
        deletions,
    })
}

/// Outcome of replaying a log file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied.
    pub records: u64,
    /// Byte offset of the end of the last valid record.
    pub valid_len: u64,
    /// Bytes discarded after the last valid record.
    pub discarded_bytes: u64,
}

fn replay(bytes: &[u8], tables: &mut FxHashMap<String, Table>) -> ReplayStats {
    let mut offset = 0usize;
    let mut seq = 0u64;
    loop {
        let rest = &bytes[offset..];
        if rest.is_empty() {
            break;
        }
        if rest.len() < RECORD_HEADER_LEN {
            warn!(offset, "kcv.embedded.replay.torn_header");
            break;
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&rest[4..12]);
        let record_seq = u64::from_be_bytes(seq_bytes);
        let crc = u32::from_be_bytes([rest[12], rest[13], rest[14], rest[15]]);
        if rest.len() < RECORD_HEADER_LEN + len {
            warn!(offset, seq = record_seq, "kcv.embedded.replay.torn_payload");
            break;
        }
        let payload = &rest[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len];
        if record_seq != seq || record_crc32(record_seq, payload) != crc {
            warn!(offset, seq = record_seq, expected = seq, "kcv.embedded.replay.bad_record");
            break;
        }
        let row = match decode_row(payload) {
            Ok(row) => row,
            Err(err) => {
                warn!(offset, seq, error = %err, "kcv.embedded.replay.undecodable");
                break;
            }
        };
        let table = tables.entry(row.store).or_default();
        apply_row(table, &row.key, &row.additions, &row.deletions);
        offset += RECORD_HEADER_LEN + len;
        seq += 1;
    }
    ReplayStats {
        records: seq,
        valid_len: offset as u64,
        discarded_bytes: (bytes.len() - offset) as u64,
    }
}

/// Options of the embedded adapter.
#[derive(Clone, Debug)]
pub struct EmbeddedOptions {
    /// Directory holding the log file; created when missing.
    pub dir: PathBuf,
    /// Calls `fsync` after each appended record.
    pub sync_writes: bool,
}

impl EmbeddedOptions {
    /// Options for `dir` with synchronous writes enabled.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_writes: true,
        }
    }

    /// Enables or disables `fsync` per record.
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// One store of an [`EmbeddedStoreManager`].
pub struct EmbeddedStore {
    name: String,
    table: RwLock<Table>,
    log: Arc<Mutex<LogWriter>>,
    closed: Arc<AtomicBool>,
}

impl EmbeddedStore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KcvError::Closed("embedded store manager"));
        }
        Ok(())
    }

    fn write_row(
        &self,
        table: &mut Table,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
    ) -> Result<()> {
        self.log.lock().append(&self.name, key, additions, deletions)?;
        apply_row(table, key, additions, deletions);
        Ok(())
    }

    fn apply_batch(&self, rows: &BTreeMap<StaticBuffer, KcvMutation>) -> Result<()> {
        self.ensure_open()?;
        let mut table = self.table.write();
        for (key, mutation) in rows {
            self.write_row(&mut table, key, &mutation.additions(), &mutation.deletions())?;
        }
        Ok(())
    }
}

impl KeyColumnValueStore for EmbeddedStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_slice(&self, key: &StaticBuffer, query: &SliceQuery) -> Result<EntryList> {
        self.ensure_open()?;
        let table = self.table.read();
        Ok(table
            .get(key)
            .map(|row| slice_row(row, query))
            .unwrap_or_default())
    }

    fn mutate(
        &self,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
    ) -> Result<()> {
        self.ensure_open()?;
        let mut table = self.table.write();
        self.write_row(&mut table, key, additions, deletions)
    }

    fn get_keys<'a>(
        &'a self,
        range: &KeyRange,
        query: &SliceQuery,
        selector: KeySelector,
    ) -> Result<KeyIterator<'a>> {
        self.ensure_open()?;
        let range = range.clone();
        let query = query.clone();
        let fetch = move |after: Option<&StaticBuffer>, page: usize| {
            self.ensure_open()?;
            let table = self.table.read();
            Ok(scan_page(&table, &range, &query, after, page))
        };
        Ok(Box::new(PagedKeyIterator::new(
            fetch,
            selector,
            SCAN_PAGE_ROWS,
        )))
    }

    fn compare_and_swap(
        &self,
        key: &StaticBuffer,
        column: &StaticBuffer,
        expected: Option<&StaticBuffer>,
        new: &StaticBuffer,
    ) -> Result<bool> {
        self.ensure_open()?;
        let mut table = self.table.write();
        if !cas_cell(&table, key, column, expected) {
            return Ok(false);
        }
        self.write_row(
            &mut table,
            key,
            &[Entry::new(column.clone(), new.clone())],
            &[],
        )?;
        Ok(true)
    }
}

/// Crash-safe single-process backend persisted to one append-only log.
pub struct EmbeddedStoreManager {
    path: PathBuf,
    stores: RwLock<FxHashMap<String, Arc<EmbeddedStore>>>,
    log: Arc<Mutex<LogWriter>>,
    closed: Arc<AtomicBool>,
    replay: ReplayStats,
}

impl EmbeddedStoreManager {
    /// Opens (creating if needed) the log under `options.dir` and replays it.
    pub fn open(options: &EmbeddedOptions) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;
        let path = options.dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let mut tables = FxHashMap::default();
        let stats = replay(&bytes, &mut tables);
        if stats.discarded_bytes > 0 {
            warn!(
                path = %path.display(),
                discarded = stats.discarded_bytes,
                "kcv.embedded.replay.truncated"
            );
            file.set_len(stats.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(stats.valid_len))?;
        info!(
            path = %path.display(),
            records = stats.records,
            stores = tables.len(),
            "kcv.embedded.open"
        );
        let log = Arc::new(Mutex::new(LogWriter::new(
            Box::new(file),
            stats.valid_len,
            stats.records,
            options.sync_writes,
        )));
        let closed = Arc::new(AtomicBool::new(false));
        let stores = tables
            .into_iter()
            .map(|(name, table)| {
                let store = Arc::new(EmbeddedStore {
                    name: name.clone(),
                    table: RwLock::new(table),
                    log: Arc::clone(&log),
                    closed: Arc::clone(&closed),
                });
                (name, store)
            })
            .collect();
        Ok(Self {
            path,
            stores: RwLock::new(stores),
            log,
            closed,
            replay: stats,
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What replay found when the manager was opened.
    pub fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    /// Records appended since open.
    pub fn records_appended(&self) -> u64 {
        self.log.lock().records_appended
    }

    /// Rewrites the log as one record per live row and returns the record
    /// count.
    ///
    /// The snapshot is written to a sibling file, synced, and renamed over the
    /// log, so a crash leaves either the old or the new log in place.
    pub fn compact(&self) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KcvError::Closed("embedded store manager"));
        }
        let stores = self.stores.read();
        let mut names: Vec<&String> = stores.keys().collect();
        names.sort();
        let tables: Vec<_> = names
            .iter()
            .map(|name| (name.as_str(), stores[name.as_str()].table.read()))
            .collect();
        let mut log = self.log.lock();

        let tmp = self.path.with_extension("log.compact");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut seq = 0u64;
        let mut len = 0u64;
        for (name, table) in &tables {
            for (key, row) in table.iter() {
                let additions: Vec<Entry> = row
                    .iter()
                    .map(|(column, value)| Entry::new(column.clone(), value.clone()))
                    .collect();
                let frame = encode_frame(seq, &encode_row(name, key, &additions, &[]))?;
                Write::write_all(&mut file, &frame)?;
                seq += 1;
                len += frame.len() as u64;
            }
        }
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        file.seek(SeekFrom::Start(len))?;
        let before = log.len;
        log.file = Box::new(file);
        log.len = len;
        log.next_seq = seq;
        log.poisoned = false;
        info!(
            path = %self.path.display(),
            records = seq,
            before,
            after = len,
            "kcv.embedded.compact"
        );
        Ok(seq)
    }

    fn store(&self, name: &str) -> Result<Arc<EmbeddedStore>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KcvError::Closed("embedded store manager"));
        }
        if let Some(store) = self.stores.read().get(name) {
            return Ok(Arc::clone(store));
        }
        let mut stores = self.stores.write();
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(store = name, "kcv.embedded.open_store");
                Arc::new(EmbeddedStore {
                    name: name.to_string(),
                    table: RwLock::new(Table::new()),
                    log: Arc::clone(&self.log),
                    closed: Arc::clone(&self.closed),
                })
            })
            .clone();
        Ok(store)
    }
}

impl StoreManager for EmbeddedStoreManager {
    fn name(&self) -> &str {
        "embedded"
    }

    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            ordered_keys: true,
            ttl: false,
            multi_row_transactions: false,
            batch_mutation: true,
            conditional_writes: true,
            persistent: true,
        }
    }

    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        let store: Arc<dyn KeyColumnValueStore> = self.store(name)?;
        Ok(store)
    }

    fn mutate_many(&self, mutations: &StoreMutations) -> Result<()> {
        for (store_name, rows) in mutations {
            self.store(store_name)
                .and_then(|store| store.apply_batch(rows))
                .map_err(|err| KcvError::persistence(store_name.clone(), err))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut log = self.log.lock();
        log.file.sync_all()?;
        info!(path = %self.path.display(), appended = log.records_appended, "kcv.embedded.close");
        Ok(())
    }

    fn clear_storage(&self) -> Result<()> {
        let mut stores = self.stores.write();
        self.log.lock().truncate()?;
        for store in stores.values() {
            store.table.write().clear();
        }
        stores.clear();
        Ok(())
    }
}
