//! Online log compaction.
//!
//! Compaction runs in two short windows of the log's exclusive section:
//! 1. Scan: read the valid region and work out which records still matter.
//! 2. Apply: clear the live flag of every dropped record, write the compacted image
//!    to a redo journal, shift the image into place, update the header, truncate.
//!
//! Either window yields to writers: if one is waiting, or the log grew in between,
//! the run is abandoned and retried on the next tick. A journal left behind by a crash
//! is replayed by [`finish_pending`] when the log is opened.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use super::error::{LogError, LogResult};
use super::file::{read_region, write_header, Entry, TransactionLog};
use super::record::{LogHeader, LogOp, RecordIter, LIVE_FLAG_OFFSET, VERSION};
use crate::transaction::GlobalId;

const JOURNAL_MAGIC: &[u8; 8] = b"XACOMPCT";
const JOURNAL_HEADER_LEN: usize = 8 + 8 + 8;

/// Result of one compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    /// A writer was active; nothing changed.
    Busy,
    /// No record could be dropped.
    Clean,
    Compacted { dropped: usize, reclaimed: u64 },
}

/// What to keep from a scanned region.
#[derive(Debug, Default)]
pub(super) struct Plan {
    /// Kept records, back to back, ready to be written at the region start.
    pub(super) image: Vec<u8>,
    /// Offsets of live records that are no longer needed.
    pub(super) dropped: Vec<u64>,
    /// Bytes held by records already flagged dead.
    pub(super) dead_bytes: u64,
}

impl Plan {
    pub(super) fn reclaimable(&self) -> bool {
        !self.dropped.is_empty() || self.dead_bytes > 0
    }
}

/// Decides which records of `region` (starting at file offset `base`) survive.
///
/// A key whose newest full-or-delete record is a delete loses every record. Otherwise
/// the newest full archive and the branch updates written after it are kept.
pub(super) fn plan(region: &[u8], base: u64) -> LogResult<Plan> {
    let mut iter = RecordIter::new(region, base);
    let records: Vec<_> = iter.by_ref().collect();
    if let Some(e) = iter.take_error() {
        return Err(e);
    }

    let mut last_full: HashMap<GlobalId, u64> = HashMap::new();
    let mut last_delete: HashMap<GlobalId, u64> = HashMap::new();
    for (offset, record, _) in records.iter().filter(|(_, r, _)| r.live) {
        match record.op {
            LogOp::AddTransaction | LogOp::ModifyTransaction => {
                last_full.insert(record.key, *offset);
            }
            LogOp::DeleteTransaction => {
                last_delete.insert(record.key, *offset);
            }
            LogOp::ModifyBranch => {}
        }
    }

    let mut plan = Plan::default();
    for (offset, record, len) in records {
        if !record.live {
            plan.dead_bytes += len as u64;
            continue;
        }
        let full = last_full.get(&record.key).copied();
        let deleted = match (full, last_delete.get(&record.key)) {
            (Some(full), Some(delete)) => *delete > full,
            (None, _) => true,
            (Some(_), None) => false,
        };
        let keep = !deleted
            && match record.op {
                op if op.is_full() => full == Some(offset),
                LogOp::ModifyBranch => full.is_some_and(|full| offset > full),
                _ => false,
            };

        if keep {
            let start = (offset - base) as usize;
            plan.image.extend_from_slice(&region[start..start + len]);
        } else {
            plan.dropped.push(offset);
        }
    }
    Ok(plan)
}

impl TransactionLog {
    /// Runs one compaction pass.
    pub fn compact(&self) -> LogResult<Compaction> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let (scanned, region) = {
            let mut guard = self.inner.lock();
            if self.writers.load(Ordering::SeqCst) > 0 {
                return Ok(Compaction::Busy);
            }
            let header = guard.header;
            (header, read_region(&mut guard.file, &header)?)
        };

        let plan = plan(&region, scanned.min_offset)?;
        if !plan.reclaimable() {
            return Ok(Compaction::Clean);
        }

        let mut guard = self.inner.lock();
        if self.writers.load(Ordering::SeqCst) > 0 || guard.header != scanned {
            log::debug!("compaction of {} abandoned: log changed", self.path.display());
            return Ok(Compaction::Busy);
        }
        let inner = &mut *guard;

        for offset in &plan.dropped {
            inner.file.seek(SeekFrom::Start(offset + LIVE_FLAG_OFFSET))?;
            inner.file.write_all(&[0])?;
        }
        inner.file.sync_data()?;

        let journal = journal_path(&self.path);
        write_journal(&journal, scanned.min_offset, &plan.image)?;
        let header = apply_image(&mut inner.file, scanned.min_offset, &plan.image)?;
        fs::remove_file(&journal)?;

        inner.header = header;
        inner.entries.retain(|_, entry| matches!(entry, Entry::Live(_)));

        let reclaimed = scanned.max_offset - header.max_offset;
        log::info!(
            "compacted {}: dropped {} records, reclaimed {} bytes",
            self.path.display(),
            plan.dropped.len(),
            reclaimed
        );
        Ok(Compaction::Compacted {
            dropped: plan.dropped.len(),
            reclaimed,
        })
    }
}

/// Sidecar file holding the image of an in-flight compaction.
pub(super) fn journal_path(log_path: &Path) -> PathBuf {
    let mut name = OsString::from(log_path.as_os_str());
    name.push(".compact");
    PathBuf::from(name)
}

pub(super) fn write_journal(path: &Path, min_offset: u64, image: &[u8]) -> LogResult<()> {
    let mut buf = Vec::with_capacity(JOURNAL_HEADER_LEN + image.len());
    buf.extend_from_slice(JOURNAL_MAGIC);
    buf.write_u64::<LittleEndian>(min_offset)?;
    buf.write_u64::<LittleEndian>(image.len() as u64)?;
    buf.extend_from_slice(image);

    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// Parses a journal. `None` if it was not completely written.
fn read_journal(bytes: &[u8]) -> LogResult<Option<(u64, &[u8])>> {
    if bytes.len() < JOURNAL_HEADER_LEN || &bytes[..8] != JOURNAL_MAGIC {
        return Ok(None);
    }
    let mut cursor = Cursor::new(&bytes[8..JOURNAL_HEADER_LEN]);
    let min_offset = cursor.read_u64::<LittleEndian>()?;
    let len = cursor.read_u64::<LittleEndian>()? as usize;
    if bytes.len() - JOURNAL_HEADER_LEN != len {
        return Ok(None);
    }
    Ok(Some((min_offset, &bytes[JOURNAL_HEADER_LEN..])))
}

/// Writes the compacted image at `min_offset`, points the header at it and cuts the
/// file behind it.
fn apply_image(file: &mut File, min_offset: u64, image: &[u8]) -> LogResult<LogHeader> {
    file.seek(SeekFrom::Start(min_offset))?;
    file.write_all(image)?;
    let header = LogHeader {
        version: VERSION,
        min_offset,
        max_offset: min_offset + image.len() as u64,
    };
    write_header(file, &header)?;
    file.set_len(header.max_offset)?;
    file.sync_all()?;
    Ok(header)
}

/// Redoes a compaction whose journal survived a crash. An incomplete journal means the
/// shift never started, so it is discarded.
pub(super) fn finish_pending(log_path: &Path, file: &mut File) -> LogResult<()> {
    let journal = journal_path(log_path);
    if !journal.exists() {
        return Ok(());
    }

    let mut bytes = Vec::new();
    File::open(&journal)?.read_to_end(&mut bytes)?;
    match read_journal(&bytes)? {
        Some((min_offset, image)) => {
            if min_offset < super::record::HEADER_SIZE {
                return Err(LogError::InvalidHeader(format!(
                    "compaction journal starts at {}",
                    min_offset
                )));
            }
            apply_image(file, min_offset, image)?;
            log::info!(
                "finished interrupted compaction of {} ({} bytes)",
                log_path.display(),
                image.len()
            );
        }
        None => log::warn!(
            "discarding incomplete compaction journal {}",
            journal.display()
        ),
    }
    fs::remove_file(&journal)?;
    Ok(())
}
