//! Content-addressed chunk storage
//!
//! One blob file per chunk, named by the hex digest of its bytes and
//! sharded by the leading two hex characters. Writes go through a temp
//! file, fsync and atomic rename; the chunk index is appended only after
//! the blob is durable, so a crash can orphan a blob but never leave an
//! index entry without its bytes.

use crate::chunk_index::ChunkIndex;
use crate::hasher::{self, Digest, HASH_ALGORITHM};
use crate::{Error, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Store format version, bumped on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;

const FORMAT_MARKER_FILE: &str = "format";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Aggregate numbers for maintenance and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub total_bytes: u64,
}

/// Result of an orphan sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub removed_chunks: usize,
    pub reclaimed_bytes: u64,
}

/// Write-once blob storage addressed by digest, verified on read.
#[derive(Debug)]
pub struct ChunkStore {
    chunks_dir: PathBuf,
    index: ChunkIndex,
}

impl ChunkStore {
    /// Open or create a store rooted at `chunks_dir`.
    ///
    /// Validates the format marker (a store written with a different hash
    /// algorithm or layout version is rejected) and prunes index entries
    /// whose blob went missing in a crash.
    pub fn open<P: AsRef<Path>>(chunks_dir: P) -> Result<Self> {
        let chunks_dir = chunks_dir.as_ref().to_path_buf();
        fs::create_dir_all(&chunks_dir).map_err(|e| Error::io_at(&chunks_dir, e))?;

        check_or_write_marker(&chunks_dir)?;

        let index = ChunkIndex::open(&chunks_dir)?;
        let store = Self { chunks_dir, index };
        store.prune_orphan_entries()?;
        Ok(store)
    }

    /// Store a chunk, deduplicating by content.
    ///
    /// Returns the digest of `data`. If the chunk is already present no
    /// bytes are written. Atomic per chunk: a concurrent reader sees the
    /// blob fully or not at all.
    pub fn store_chunk(&self, data: &[u8]) -> Result<Digest> {
        let digest = hasher::hash_bytes(data);
        if self.index.contains(&digest) {
            debug!(chunk = %digest, "dedupe hit");
            return Ok(digest);
        }

        let relative = blob_relative_path(&digest);
        let final_path = self.chunks_dir.join(&relative);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }

        // Unique temp name so concurrent writers of identical bytes never
        // interleave; the last rename wins over identical content.
        let tmp_path = final_path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| Error::io_at(&tmp_path, e))?;
            tmp.write_all(data).map_err(|e| Error::io_at(&tmp_path, e))?;
            tmp.sync_all().map_err(|e| Error::io_at(&tmp_path, e))?;
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::io_at(&final_path, e));
        }

        self.index.put(digest, data.len() as u64, relative)?;
        Ok(digest)
    }

    /// Read a chunk back, re-hashing to verify integrity.
    pub fn retrieve_chunk(&self, digest: &Digest) -> Result<Vec<u8>> {
        let entry = self.index.get(digest).ok_or_else(|| Error::ChunkNotFound {
            digest: digest.to_hex(),
        })?;
        let path = self.chunks_dir.join(&entry.location);

        let mut data = Vec::with_capacity(entry.size as usize);
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| Error::io_at(&path, e))?;

        let actual = hasher::hash_bytes(&data);
        if actual != *digest {
            return Err(Error::Integrity {
                reason: format!("chunk {} read back as {}", digest, actual),
            });
        }
        Ok(data)
    }

    /// True if the chunk is present and indexed.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.index.contains(digest)
    }

    /// Size of a stored chunk, without reading it.
    pub fn chunk_size(&self, digest: &Digest) -> Option<u64> {
        self.index.get(digest).map(|e| e.size)
    }

    /// All stored digests, in unspecified order.
    pub fn list(&self) -> Vec<Digest> {
        self.index.iter().into_iter().map(|(d, _)| d).collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            chunk_count: self.index.len(),
            total_bytes: self.index.total_bytes(),
        }
    }

    /// Delete every blob whose digest is not in `referenced`.
    ///
    /// Maintenance only; never called on the ingest path.
    pub fn sweep_orphaned_chunks(&self, referenced: &HashSet<Digest>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let mut doomed = Vec::new();
        for (digest, entry) in self.index.iter() {
            if !referenced.contains(&digest) {
                doomed.push((digest, entry));
            }
        }
        if doomed.is_empty() {
            return Ok(stats);
        }

        // Drop the index entries first: an unreferenced blob on disk is
        // harmless, an index entry without its blob is not.
        let doomed_set: HashSet<Digest> = doomed.iter().map(|(d, _)| *d).collect();
        self.index.retain(|digest, _| !doomed_set.contains(digest))?;

        for (digest, entry) in doomed {
            let path = self.chunks_dir.join(&entry.location);
            match fs::remove_file(&path) {
                Ok(()) => {
                    stats.removed_chunks += 1;
                    stats.reclaimed_bytes += entry.size;
                }
                Err(e) => warn!(chunk = %digest, error = %e, "failed to remove swept blob"),
            }
        }
        info!(
            removed = stats.removed_chunks,
            reclaimed = stats.reclaimed_bytes,
            "orphan sweep finished"
        );
        Ok(stats)
    }

    /// Re-read and re-hash every indexed chunk.
    pub fn verify_all(&self) -> Result<Vec<Digest>> {
        let mut corrupted = Vec::new();
        for (digest, _) in self.index.iter() {
            match self.retrieve_chunk(&digest) {
                Ok(_) => {}
                Err(Error::Integrity { .. }) => corrupted.push(digest),
                Err(e) => return Err(e),
            }
        }
        Ok(corrupted)
    }

    fn prune_orphan_entries(&self) -> Result<()> {
        let chunks_dir = self.chunks_dir.clone();
        let dropped = self
            .index
            .retain(|_, entry| chunks_dir.join(&entry.location).is_file())?;
        if dropped > 0 {
            warn!(dropped, "pruned index entries left by an interrupted write");
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.chunks_dir.join(blob_relative_path(digest))
    }
}

/// Shard blobs by the first two hex characters of the digest.
fn blob_relative_path(digest: &Digest) -> PathBuf {
    let hex = digest.to_hex();
    PathBuf::from(&hex[..2]).join(&hex[2..])
}

fn check_or_write_marker(chunks_dir: &Path) -> Result<()> {
    let marker_path = chunks_dir.join(FORMAT_MARKER_FILE);
    let expected = format!("chunkvault-store {} {}\n", STORE_FORMAT_VERSION, HASH_ALGORITHM);
    if marker_path.exists() {
        let found = fs::read_to_string(&marker_path).map_err(|e| Error::io_at(&marker_path, e))?;
        if found != expected {
            return Err(Error::Integrity {
                reason: format!(
                    "store format mismatch: expected {:?}, found {:?}",
                    expected.trim(),
                    found.trim()
                ),
            });
        }
    } else {
        fs::write(&marker_path, expected).map_err(|e| Error::io_at(&marker_path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;
    use tempfile::TempDir;

    #[test]
    fn store_and_retrieve() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ChunkStore::open(temp_dir.path())?;

        let digest = store.store_chunk(b"test chunk data")?;
        assert!(store.contains(&digest));
        assert_eq!(store.retrieve_chunk(&digest)?, b"test chunk data");
        assert_eq!(store.chunk_size(&digest), Some(15));
        Ok(())
    }

    #[test]
    fn store_chunk_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ChunkStore::open(temp_dir.path())?;

        let first = store.store_chunk(b"same bytes")?;
        let second = store.store_chunk(b"same bytes")?;
        assert_eq!(first, second);
        assert_eq!(store.stats().chunk_count, 1);
        Ok(())
    }

    #[test]
    fn corruption_is_detected_on_read() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ChunkStore::open(temp_dir.path())?;

        let digest = store.store_chunk(b"data worth protecting")?;
        fs::write(store.blob_path(&digest), b"data worth protectinG")?;

        assert!(matches!(
            store.retrieve_chunk(&digest),
            Err(Error::Integrity { .. })
        ));
        assert_eq!(store.verify_all()?, vec![digest]);
        Ok(())
    }

    #[test]
    fn missing_chunk_is_not_found() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ChunkStore::open(temp_dir.path())?;
        let digest = hash_bytes(b"never stored");
        assert!(matches!(
            store.retrieve_chunk(&digest),
            Err(Error::ChunkNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn reopen_prunes_entries_without_blobs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let digest;
        let survivor;
        {
            let store = ChunkStore::open(temp_dir.path())?;
            digest = store.store_chunk(b"doomed")?;
            survivor = store.store_chunk(b"kept")?;
            // Simulate a crash that lost the blob after the index append.
            fs::remove_file(store.blob_path(&digest))?;
        }

        let store = ChunkStore::open(temp_dir.path())?;
        assert!(!store.contains(&digest));
        assert!(store.contains(&survivor));
        assert_eq!(store.retrieve_chunk(&survivor)?, b"kept");
        Ok(())
    }

    #[test]
    fn mismatched_store_format_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        ChunkStore::open(temp_dir.path())?;
        fs::write(
            temp_dir.path().join(FORMAT_MARKER_FILE),
            "chunkvault-store 1 sha256\n",
        )?;
        assert!(matches!(
            ChunkStore::open(temp_dir.path()),
            Err(Error::Integrity { .. })
        ));
        Ok(())
    }

    #[test]
    fn sweep_removes_only_unreferenced_chunks() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ChunkStore::open(temp_dir.path())?;

        let kept = store.store_chunk(b"still referenced")?;
        let orphan = store.store_chunk(b"orphaned bytes")?;

        let mut referenced = HashSet::new();
        referenced.insert(kept);

        let stats = store.sweep_orphaned_chunks(&referenced)?;
        assert_eq!(stats.removed_chunks, 1);
        assert_eq!(stats.reclaimed_bytes, b"orphaned bytes".len() as u64);
        assert!(store.contains(&kept));
        assert!(!store.contains(&orphan));
        Ok(())
    }
}
