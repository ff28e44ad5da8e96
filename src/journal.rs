//! Append-only modification journal
//!
//! Binary format: a header of `u32 BE magic 0xDEADBEEF, u32 BE version`,
//! then one record per change event:
//!
//! ```text
//! event_type : u8                  (0=created, 1=modified, 2=deleted)
//! timestamp  : i64 BE              (ms since epoch)
//! path       : u16 BE len + UTF-8
//! reg_id     : u16 BE len + UTF-8  (empty = none)
//! ```
//!
//! Replay tolerates a truncated trailing record; compaction rewrites via a
//! temp file and atomic rename.

use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Journal file magic
pub const JOURNAL_MAGIC: u32 = 0xDEAD_BEEF;

/// Current journal format version
pub const JOURNAL_VERSION: u32 = 1;

const JOURNAL_FILE: &str = "changes.journal";
const HEADER_LEN: usize = 8;

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    fn to_u8(self) -> u8 {
        match self {
            ChangeKind::Created => 0,
            ChangeKind::Modified => 1,
            ChangeKind::Deleted => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChangeKind::Created),
            1 => Some(ChangeKind::Modified),
            2 => Some(ChangeKind::Deleted),
            _ => None,
        }
    }
}

/// One filesystem change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Watch registration that produced the event, when known
    pub registration_id: Option<String>,
}

/// Durable, append-only log of change events.
///
/// A single writer is serialized by the exclusive side of the lock;
/// replay takes the shared side. Compaction holds the exclusive lock and
/// re-opens the writer.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    writer: RwLock<BufWriter<File>>,
}

impl Journal {
    /// Create or open the journal inside `dir`, validating the header.
    ///
    /// A file with an unknown magic or version is logged and treated as
    /// empty; its content is discarded on open.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| Error::io_at(dir, e))?;
        let path = dir.join(JOURNAL_FILE);

        let mut start_fresh = true;
        if path.exists() {
            match read_header(&path) {
                Ok(()) => start_fresh = false,
                Err(e) => {
                    error!(journal = %path.display(), error = %e, "invalid journal header, starting empty");
                }
            }
        }

        if start_fresh {
            let mut file = File::create(&path).map_err(|e| Error::io_at(&path, e))?;
            file.write_all(&JOURNAL_MAGIC.to_be_bytes())
                .and_then(|_| file.write_all(&JOURNAL_VERSION.to_be_bytes()))
                .and_then(|_| file.sync_all())
                .map_err(|e| Error::io_at(&path, e))?;
        }

        let writer = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| Error::io_at(&path, e))?,
        );
        Ok(Self {
            path,
            writer: RwLock::new(writer),
        })
    }

    /// Append one record and flush it for durability.
    pub fn record(&self, event: &ChangeEvent) -> Result<()> {
        let encoded = encode_record(event)?;
        let mut writer = self.writer.write().unwrap();
        writer
            .write_all(&encoded)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io_at(&self.path, e))?;
        debug!(path = %event.path.display(), kind = ?event.kind, "journaled change");
        Ok(())
    }

    /// All records in insertion order.
    ///
    /// Stops cleanly at a truncated trailing record.
    pub fn replay(&self) -> Result<Vec<ChangeEvent>> {
        let _guard = self.writer.read().unwrap();
        let data = fs::read(&self.path).map_err(|e| Error::io_at(&self.path, e))?;
        Ok(decode_records(&data))
    }

    /// Rewrite the journal keeping only events with
    /// `timestamp_ms >= cutoff_ms`.
    ///
    /// Uses a temp file and atomic rename; if the read phase fails the
    /// journal is left untouched.
    pub fn compact(&self, cutoff_ms: i64) -> Result<usize> {
        let mut writer = self.writer.write().unwrap();

        // Read phase: any failure here aborts without data loss.
        let data = fs::read(&self.path).map_err(|e| Error::io_at(&self.path, e))?;
        let events = decode_records(&data);
        let kept: Vec<&ChangeEvent> = events
            .iter()
            .filter(|e| e.timestamp_ms >= cutoff_ms)
            .collect();
        let dropped = events.len() - kept.len();

        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut tmp = BufWriter::new(
                File::create(&tmp_path).map_err(|e| Error::io_at(&tmp_path, e))?,
            );
            tmp.write_all(&JOURNAL_MAGIC.to_be_bytes())
                .and_then(|_| tmp.write_all(&JOURNAL_VERSION.to_be_bytes()))
                .map_err(|e| Error::io_at(&tmp_path, e))?;
            for event in &kept {
                let encoded = encode_record(event)?;
                tmp.write_all(&encoded).map_err(|e| Error::io_at(&tmp_path, e))?;
            }
            tmp.flush().map_err(|e| Error::io_at(&tmp_path, e))?;
            tmp.get_ref()
                .sync_all()
                .map_err(|e| Error::io_at(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| Error::io_at(&self.path, e))?;

        *writer = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .open(&self.path)
                .map_err(|e| Error::io_at(&self.path, e))?,
        );
        info!(kept = kept.len(), dropped, "journal compacted");
        Ok(dropped)
    }

    #[cfg(test)]
    pub(crate) fn file_path(&self) -> &Path {
        &self.path
    }
}

fn read_header(path: &Path) -> Result<()> {
    let mut file = File::open(path).map_err(|e| Error::io_at(path, e))?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(|e| Error::io_at(path, e))?;

    let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let version = u32::from_be_bytes(header[4..8].try_into().unwrap());
    if magic != JOURNAL_MAGIC {
        return Err(Error::Integrity {
            reason: format!("journal magic {:#x}, expected {:#x}", magic, JOURNAL_MAGIC),
        });
    }
    if version != JOURNAL_VERSION {
        return Err(Error::Integrity {
            reason: format!("journal version {}, expected {}", version, JOURNAL_VERSION),
        });
    }
    Ok(())
}

fn encode_record(event: &ChangeEvent) -> Result<Vec<u8>> {
    let path = event.path.to_string_lossy();
    let path_bytes = path.as_bytes();
    let reg = event.registration_id.as_deref().unwrap_or("");
    let reg_bytes = reg.as_bytes();
    if path_bytes.len() > u16::MAX as usize || reg_bytes.len() > u16::MAX as usize {
        return Err(Error::InvalidArgument {
            reason: "journal string field exceeds 65535 bytes".to_string(),
        });
    }

    let mut out = Vec::with_capacity(1 + 8 + 2 + path_bytes.len() + 2 + reg_bytes.len());
    out.push(event.kind.to_u8());
    out.extend_from_slice(&event.timestamp_ms.to_be_bytes());
    out.extend_from_slice(&(path_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(path_bytes);
    out.extend_from_slice(&(reg_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(reg_bytes);
    Ok(out)
}

/// Decode records after the header, stopping at a truncated tail.
fn decode_records(data: &[u8]) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let mut pos = HEADER_LEN;

    while pos < data.len() {
        let Some(record) = decode_one(data, &mut pos) else {
            warn!(offset = pos, "truncated or malformed journal tail, stopping replay");
            break;
        };
        events.push(record);
    }
    events
}

fn decode_one(data: &[u8], pos: &mut usize) -> Option<ChangeEvent> {
    let mut cursor = *pos;

    let kind = ChangeKind::from_u8(*data.get(cursor)?)?;
    cursor += 1;

    let ts_bytes = data.get(cursor..cursor + 8)?;
    let timestamp_ms = i64::from_be_bytes(ts_bytes.try_into().unwrap());
    cursor += 8;

    let path = read_string(data, &mut cursor)?;
    let reg = read_string(data, &mut cursor)?;

    *pos = cursor;
    Some(ChangeEvent {
        kind,
        path: PathBuf::from(path),
        timestamp_ms,
        registration_id: if reg.is_empty() { None } else { Some(reg) },
    })
}

fn read_string(data: &[u8], cursor: &mut usize) -> Option<String> {
    let len_bytes = data.get(*cursor..*cursor + 2)?;
    let len = u16::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    *cursor += 2;
    let bytes = data.get(*cursor..*cursor + len)?;
    *cursor += len;
    String::from_utf8(bytes.to_vec()).ok()
}
