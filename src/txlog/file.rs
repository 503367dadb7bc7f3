//! File-backed transaction log.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::compactor;
use super::error::{LogError, LogResult};
use super::record::{LogHeader, LogOp, LogRecord, RecordIter, HEADER_SIZE};
use super::store::TransactionStore;
use crate::branch::BranchRecord;
use crate::transaction::{GlobalId, TransactionArchive};

/// Replayed state of one key.
#[derive(Debug, Clone)]
pub(super) enum Entry {
    Live(TransactionArchive),
    /// Tombstone; dropped from the map by the next compaction.
    Deleted,
}

/// State guarded by the log-wide exclusive section.
pub(super) struct LogFile {
    pub(super) file: File,
    pub(super) header: LogHeader,
    pub(super) entries: HashMap<GlobalId, Entry>,
}

/// Counts writers that entered the append path, including those still waiting for
/// the lock. The compactor yields while it is non-zero.
struct WriterGate<'a>(&'a AtomicUsize);

impl<'a> WriterGate<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WriterGate<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Append-only transaction log, replayed into memory on open.
pub struct TransactionLog {
    pub(super) path: PathBuf,
    sync_on_write: bool,
    closed: AtomicBool,
    pub(super) writers: AtomicUsize,
    pub(super) inner: Mutex<LogFile>,
}

impl TransactionLog {
    /// Opens the log at `path`, creating it if needed.
    ///
    /// An interrupted compaction is finished first. A missing or invalid header is
    /// replaced by an empty one. Replay stops at the first undecodable record and the
    /// valid range is cut back to it.
    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        compactor::finish_pending(&path, &mut file)?;

        let file_len = file.metadata()?.len();
        let mut header = if file_len == 0 {
            log::info!("creating transaction log {}", path.display());
            bootstrap(&mut file)?
        } else {
            match read_header(&mut file) {
                Ok(header) => header,
                Err(e) => {
                    log::warn!(
                        "transaction log {} has no usable header ({}), starting empty",
                        path.display(),
                        e
                    );
                    bootstrap(&mut file)?
                }
            }
        };

        if header.max_offset > file_len.max(HEADER_SIZE) {
            log::warn!(
                "{}: header claims {} bytes, file has {}",
                path.display(),
                header.max_offset,
                file_len
            );
            header.max_offset = file_len.max(header.min_offset);
        }

        let region = read_region(&mut file, &header)?;
        let (entries, valid_end) = replay(&region, header.min_offset);
        if valid_end != header.max_offset {
            log::warn!(
                "{}: discarding {} bytes after offset {}",
                path.display(),
                header.max_offset - valid_end,
                valid_end
            );
            header.max_offset = valid_end;
            write_header(&mut file, &header)?;
            file.sync_data()?;
        }

        let live = entries
            .values()
            .filter(|e| matches!(e, Entry::Live(_)))
            .count();
        log::info!(
            "opened transaction log {} ({} live transactions, {} bytes)",
            path.display(),
            live,
            header.max_offset - header.min_offset
        );

        Ok(Self {
            path,
            sync_on_write,
            closed: AtomicBool::new(false),
            writers: AtomicUsize::new(0),
            inner: Mutex::new(LogFile {
                file,
                header,
                entries,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the file and rejects every later write.
    pub fn close(&self) -> LogResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.lock().file.sync_all()?;
        log::info!("closed transaction log {}", self.path.display());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current header.
    pub fn header(&self) -> LogHeader {
        self.inner.lock().header
    }

    /// Number of live archives.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| matches!(e, Entry::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live archive.
    pub fn live_archives(&self) -> Vec<TransactionArchive> {
        self.inner
            .lock()
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::Live(archive) => Some(archive.clone()),
                Entry::Deleted => None,
            })
            .collect()
    }

    /// Appends `record` and then applies the matching change to the in-memory map.
    /// Nothing is applied if the write fails.
    fn append(
        &self,
        record: LogRecord,
        apply: impl FnOnce(&mut HashMap<GlobalId, Entry>),
    ) -> LogResult<()> {
        let _gate = WriterGate::enter(&self.writers);
        let mut guard = self.inner.lock();
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let inner = &mut *guard;

        let mut buf = BytesMut::with_capacity(record.encoded_len());
        record.encode(&mut buf);

        let offset = inner.header.max_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&buf)?;
        if self.sync_on_write {
            inner.file.sync_data()?;
        }

        let header = LogHeader {
            max_offset: offset + buf.len() as u64,
            ..inner.header
        };
        write_header(&mut inner.file, &header)?;
        if self.sync_on_write {
            inner.file.sync_data()?;
        }
        inner.header = header;

        apply(&mut inner.entries);
        Ok(())
    }
}

impl TransactionStore for TransactionLog {
    fn create_transaction(&self, archive: &TransactionArchive) -> LogResult<()> {
        self.append(LogRecord::add(archive)?, |entries| {
            entries.insert(archive.global_id, Entry::Live(archive.clone()));
        })
    }

    fn update_transaction(&self, archive: &TransactionArchive) -> LogResult<()> {
        self.append(LogRecord::modify(archive)?, |entries| {
            entries.insert(archive.global_id, Entry::Live(archive.clone()));
        })
    }

    fn delete_transaction(&self, global_id: &GlobalId) -> LogResult<()> {
        self.append(LogRecord::delete(*global_id)?, |entries| {
            entries.insert(*global_id, Entry::Deleted);
        })
    }

    fn update_resource(&self, global_id: &GlobalId, record: &BranchRecord) -> LogResult<()> {
        let known = matches!(
            self.inner.lock().entries.get(global_id),
            Some(Entry::Live(_))
        );
        if !known {
            log::debug!(
                "ignoring branch update {} for unknown transaction {}",
                record.xid,
                global_id
            );
            return Ok(());
        }
        self.append(LogRecord::modify_branch(*global_id, record)?, |entries| {
            if let Some(Entry::Live(archive)) = entries.get_mut(global_id) {
                archive.apply_branch(record);
            }
        })
    }

    fn recover(&self, callback: &mut dyn FnMut(TransactionArchive)) {
        for archive in self.live_archives() {
            callback(archive);
        }
    }

    fn get(&self, global_id: &GlobalId) -> Option<TransactionArchive> {
        match self.inner.lock().entries.get(global_id) {
            Some(Entry::Live(archive)) => Some(archive.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish()
    }
}

/// Writes an empty header in one write and truncates the file behind it.
fn bootstrap(file: &mut File) -> LogResult<LogHeader> {
    let header = LogHeader::empty();
    write_header(file, &header)?;
    file.set_len(HEADER_SIZE)?;
    file.sync_all()?;
    Ok(header)
}

pub(super) fn read_header(file: &mut File) -> LogResult<LogHeader> {
    let mut bytes = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => LogError::InvalidHeader("file too short".into()),
        _ => LogError::Io(e),
    })?;
    LogHeader::from_bytes(&bytes)
}

pub(super) fn write_header(file: &mut File, header: &LogHeader) -> LogResult<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    Ok(())
}

/// Reads the bytes of `[min_offset, max_offset)`.
pub(super) fn read_region(file: &mut File, header: &LogHeader) -> LogResult<Vec<u8>> {
    let mut region = vec![0u8; (header.max_offset - header.min_offset) as usize];
    file.seek(SeekFrom::Start(header.min_offset))?;
    file.read_exact(&mut region)?;
    Ok(region)
}

/// Rebuilds the key map from a region starting at file offset `base`. Returns the map
/// and the offset just past the last decodable record.
fn replay(region: &[u8], base: u64) -> (HashMap<GlobalId, Entry>, u64) {
    let mut entries = HashMap::new();
    let mut end = base;
    let mut iter = RecordIter::new(region, base);

    for (offset, record, len) in iter.by_ref() {
        end = offset + len as u64;
        if !record.live {
            continue;
        }
        match record.op {
            LogOp::AddTransaction | LogOp::ModifyTransaction => match record.archive() {
                Ok(archive) => {
                    entries.insert(record.key, Entry::Live(archive));
                }
                Err(e) => log::warn!("skipping unreadable archive at offset {}: {}", offset, e),
            },
            LogOp::DeleteTransaction => {
                entries.insert(record.key, Entry::Deleted);
            }
            LogOp::ModifyBranch => match record.branch() {
                Ok(branch) => {
                    if let Some(Entry::Live(archive)) = entries.get_mut(&record.key) {
                        archive.apply_branch(&branch);
                    }
                }
                Err(e) => log::warn!("skipping unreadable branch at offset {}: {}", offset, e),
            },
        }
    }

    if let Some(e) = iter.take_error() {
        log::warn!("log replay stopped: {}", e);
    }
    (entries, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceDescriptor, Vote};
    use crate::transaction::{TransactionStatus, XidFactory};
    use tempfile::TempDir;

    fn create_test_log() -> (TransactionLog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let log = TransactionLog::open(temp_dir.path().join("tx.log"), false).unwrap();
        (log, temp_dir)
    }

    fn archive(factory: &XidFactory) -> TransactionArchive {
        TransactionArchive::new(factory.create_global_id(), TransactionStatus::Active, true)
    }

    #[test]
    fn test_open_creates_header() {
        let (log, temp_dir) = create_test_log();
        assert_eq!(log.header(), LogHeader::empty());
        assert!(log.is_empty());
        let len = fs::metadata(temp_dir.path().join("tx.log")).unwrap().len();
        assert_eq!(len, HEADER_SIZE);
    }

    #[test]
    fn test_round_trip_after_reopen() {
        let (log, temp_dir) = create_test_log();
        let factory = XidFactory::new(1);

        let mut kept = archive(&factory);
        let gone = archive(&factory);
        log.create_transaction(&kept).unwrap();
        log.create_transaction(&gone).unwrap();

        kept.status = TransactionStatus::Prepared;
        log.update_transaction(&kept).unwrap();
        let mut branch = BranchRecord::new(
            factory.create_branch_id(kept.global_id, 1),
            ResourceDescriptor::native("db"),
        );
        branch.record_vote(Vote::Ok);
        log.update_resource(&kept.global_id, &branch).unwrap();
        log.delete_transaction(&gone.global_id).unwrap();

        let expected = log.get(&kept.global_id).unwrap();
        assert_eq!(expected.native_branches, vec![branch]);
        assert!(log.get(&gone.global_id).is_none());
        drop(log);

        let reopened = TransactionLog::open(temp_dir.path().join("tx.log"), false).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&kept.global_id), Some(expected));
        assert!(reopened.get(&gone.global_id).is_none());
    }

    #[test]
    fn test_branch_update_for_unknown_transaction_is_ignored() {
        let (log, _temp_dir) = create_test_log();
        let factory = XidFactory::new(1);
        let gid = factory.create_global_id();
        let branch = BranchRecord::new(
            factory.create_branch_id(gid, 1),
            ResourceDescriptor::native("db"),
        );

        log.update_resource(&gid, &branch).unwrap();
        assert_eq!(log.header().max_offset, HEADER_SIZE);
    }

    #[test]
    fn test_bytes_beyond_max_are_ignored() {
        let (log, temp_dir) = create_test_log();
        let factory = XidFactory::new(1);
        let a = archive(&factory);
        log.create_transaction(&a).unwrap();
        let max = log.header().max_offset;
        drop(log);

        let path = temp_dir.path().join("tx.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 100]).unwrap();
        drop(file);

        let reopened = TransactionLog::open(&path, false).unwrap();
        assert_eq!(reopened.header().max_offset, max);
        assert_eq!(reopened.len(), 1);

        // The next append overwrites the garbage.
        let b = archive(&factory);
        reopened.create_transaction(&b).unwrap();
        drop(reopened);
        let again = TransactionLog::open(&path, false).unwrap();
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn test_invalid_header_bootstraps() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tx.log");
        fs::write(&path, b"definitely not a transaction log header").unwrap();

        let log = TransactionLog::open(&path, false).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.header(), LogHeader::empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_torn_record_is_cut_off() {
        let (log, temp_dir) = create_test_log();
        let factory = XidFactory::new(1);
        let a = archive(&factory);
        log.create_transaction(&a).unwrap();
        let good_end = log.header().max_offset;

        // Claim a record that was only half written.
        {
            let mut guard = log.inner.lock();
            let inner = &mut *guard;
            inner.file.seek(SeekFrom::Start(good_end)).unwrap();
            inner.file.write_all(&[1, 2, 3, 4, 5]).unwrap();
            let header = LogHeader {
                max_offset: good_end + 5,
                ..inner.header
            };
            write_header(&mut inner.file, &header).unwrap();
        }
        drop(log);

        let path = temp_dir.path().join("tx.log");
        let reopened = TransactionLog::open(&path, false).unwrap();
        assert_eq!(reopened.header().max_offset, good_end);
        let b = archive(&factory);
        reopened.create_transaction(&b).unwrap();
        drop(reopened);

        let again = TransactionLog::open(&path, false).unwrap();
        assert!(again.get(&a.global_id).is_some());
        assert!(again.get(&b.global_id).is_some());
    }

    #[test]
    fn test_recover_skips_deleted() {
        let (log, _temp_dir) = create_test_log();
        let factory = XidFactory::new(1);
        let a = archive(&factory);
        let b = archive(&factory);
        log.create_transaction(&a).unwrap();
        log.create_transaction(&b).unwrap();
        log.delete_transaction(&a.global_id).unwrap();

        let mut seen = Vec::new();
        log.recover(&mut |archive| seen.push(archive.global_id));
        assert_eq!(seen, vec![b.global_id]);
    }

    #[test]
    fn test_writes_fail_after_close() {
        let (log, _temp_dir) = create_test_log();
        let factory = XidFactory::new(1);
        log.close().unwrap();
        assert!(matches!(
            log.create_transaction(&archive(&factory)),
            Err(LogError::Closed)
        ));
    }

    #[test]
    fn test_sync_on_write() {
        let temp_dir = TempDir::new().unwrap();
        let log = TransactionLog::open(temp_dir.path().join("nested/dir/tx.log"), true).unwrap();
        let factory = XidFactory::new(1);
        log.create_transaction(&archive(&factory)).unwrap();
        assert_eq!(log.len(), 1);
    }
}
