//! Durable chunk index mapping digests to blob locations
//!
//! The on-disk form is a textual append-log, one `<hex-digest> <size>
//! <relative-path>` line per entry, rebuilt into an in-memory map at open.

use crate::hasher::Digest;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::warn;

const INDEX_FILE: &str = "chunks.idx";

/// Location and size of one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Chunk size in bytes
    pub size: u64,
    /// Blob path relative to the chunk directory
    pub location: PathBuf,
}

/// Persistent map from chunk digest to stored-blob location.
///
/// Inserts are serialized by a single writer lock; lookups take a shared
/// lock. The index survives restarts by replaying the append-log.
#[derive(Debug)]
pub struct ChunkIndex {
    index_path: PathBuf,
    entries: RwLock<HashMap<Digest, IndexEntry>>,
    writer: Mutex<BufWriter<File>>,
}

impl ChunkIndex {
    /// Open or create the index inside `dir`, replaying any existing log.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| Error::io_at(dir, e))?;
        let index_path = dir.join(INDEX_FILE);

        let mut entries = HashMap::new();
        if index_path.exists() {
            let file = File::open(&index_path).map_err(|e| Error::io_at(&index_path, e))?;
            let reader = BufReader::new(file);
            let mut skipped = 0usize;
            for line in reader.lines() {
                let line = line.map_err(|e| Error::io_at(&index_path, e))?;
                match parse_line(&line) {
                    Some((digest, entry)) => {
                        entries.insert(digest, entry);
                    }
                    None => {
                        if !line.trim().is_empty() {
                            skipped += 1;
                        }
                    }
                }
            }
            if skipped > 0 {
                warn!(skipped, index = %index_path.display(), "skipped malformed index lines");
            }
        }

        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&index_path)
                .map_err(|e| Error::io_at(&index_path, e))?,
        );

        Ok(Self {
            index_path,
            entries: RwLock::new(entries),
            writer: Mutex::new(writer),
        })
    }

    /// True if the digest is present.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.read().unwrap().contains_key(digest)
    }

    /// Look up size and location for a digest.
    pub fn get(&self, digest: &Digest) -> Option<IndexEntry> {
        self.entries.read().unwrap().get(digest).cloned()
    }

    /// Insert an entry. Re-inserting an existing key is a no-op.
    pub fn put(&self, digest: Digest, size: u64, location: PathBuf) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        if self.entries.read().unwrap().contains_key(&digest) {
            return Ok(());
        }
        writeln!(writer, "{} {} {}", digest.to_hex(), size, location.display())
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io_at(&self.index_path, e))?;
        self.entries
            .write()
            .unwrap()
            .insert(digest, IndexEntry { size, location });
        Ok(())
    }

    /// Snapshot of all entries, in unspecified order.
    pub fn iter(&self) -> Vec<(Digest, IndexEntry)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(d, e)| (*d, e.clone()))
            .collect()
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes accounted by the index.
    pub fn total_bytes(&self) -> u64 {
        self.entries.read().unwrap().values().map(|e| e.size).sum()
    }

    /// Drop every entry for which `keep` returns false, rewriting the log
    /// atomically (temp file + rename) and re-opening the writer.
    pub fn retain<F>(&self, keep: F) -> Result<usize>
    where
        F: Fn(&Digest, &IndexEntry) -> bool,
    {
        let mut writer = self.writer.lock().unwrap();
        let mut entries = self.entries.write().unwrap();

        let before = entries.len();
        entries.retain(|digest, entry| keep(digest, entry));
        let dropped = before - entries.len();
        if dropped == 0 {
            return Ok(0);
        }

        let tmp_path = self.index_path.with_extension("idx.tmp");
        {
            let mut tmp = BufWriter::new(
                File::create(&tmp_path).map_err(|e| Error::io_at(&tmp_path, e))?,
            );
            for (digest, entry) in entries.iter() {
                writeln!(tmp, "{} {} {}", digest.to_hex(), entry.size, entry.location.display())
                    .map_err(|e| Error::io_at(&tmp_path, e))?;
            }
            tmp.flush().map_err(|e| Error::io_at(&tmp_path, e))?;
            tmp.get_ref()
                .sync_all()
                .map_err(|e| Error::io_at(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.index_path).map_err(|e| Error::io_at(&self.index_path, e))?;

        *writer = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .open(&self.index_path)
                .map_err(|e| Error::io_at(&self.index_path, e))?,
        );
        Ok(dropped)
    }
}

fn parse_line(line: &str) -> Option<(Digest, IndexEntry)> {
    let mut parts = line.splitn(3, ' ');
    let digest = Digest::from_hex(parts.next()?).ok()?;
    let size: u64 = parts.next()?.parse().ok()?;
    let location = PathBuf::from(parts.next()?);
    Some((digest, IndexEntry { size, location }))
}
