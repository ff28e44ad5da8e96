//! Snapshot and manifest storage
//!
//! Snapshots accumulate in memory while a backup runs and become visible
//! only when finalization renames the serialized snapshot into place, so a
//! backup is transactional: all of its manifests appear at once or never.

use crate::hasher::Digest;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Snapshot serialization format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Textual marker used to recover the source root from older snapshot
/// descriptions. The `source_root` field is the contract; this is a
/// fallback only.
pub const SOURCE_ROOT_MARKER: &str = "Processing session for directory: ";

/// Everything needed to reconstruct one file from the chunk store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileManifest {
    /// Absolute path of the file at backup time
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Modification time at backup
    pub modified: DateTime<Utc>,
    /// Unix permission bits, when available
    pub mode: Option<u32>,
    /// Chunk digests in file-offset order; concatenation reassembles the file
    pub chunks: Vec<Digest>,
    /// Digest of the whole file
    pub file_digest: Digest,
}

/// Deduplication statistics computed at finalization.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkStats {
    /// Distinct chunks referenced by the snapshot
    pub unique_chunks: usize,
    /// Chunks referenced more than once
    pub dedup_chunks: usize,
    /// Bytes that deduplication avoided storing again
    pub dedup_saved_bytes: u64,
}

/// A named, immutable set of file manifests captured from one source tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Serialization format version
    pub version: u32,
    /// Unique snapshot identifier
    pub id: Uuid,
    /// Human-readable name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Root directory the snapshot was taken from
    pub source_root: Option<PathBuf>,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// Number of files captured
    pub file_count: u64,
    /// Sum of file sizes
    pub total_bytes: u64,
    /// Per-file manifests
    pub files: Vec<FileManifest>,
    /// Deduplication statistics
    pub chunk_stats: ChunkStats,
}

impl Snapshot {
    /// The source root, from the first-class field or, failing that, the
    /// description marker.
    pub fn resolve_source_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.source_root {
            return Some(root.clone());
        }
        self.description
            .lines()
            .find_map(|line| line.strip_prefix(SOURCE_ROOT_MARKER))
            .map(|rest| PathBuf::from(rest.trim()))
    }

    /// All distinct chunk digests referenced by this snapshot.
    pub fn referenced_chunks(&self) -> HashSet<Digest> {
        self.files
            .iter()
            .flat_map(|f| f.chunks.iter().copied())
            .collect()
    }

    fn compute_chunk_stats(&mut self, chunk_size: impl Fn(&Digest) -> u64) {
        let mut usage: HashMap<Digest, usize> = HashMap::new();
        for file in &self.files {
            for chunk in &file.chunks {
                *usage.entry(*chunk).or_insert(0) += 1;
            }
        }
        let dedup_saved_bytes = usage
            .iter()
            .filter(|(_, &count)| count > 1)
            .map(|(digest, &count)| (count as u64 - 1) * chunk_size(digest))
            .sum();
        self.chunk_stats = ChunkStats {
            unique_chunks: usage.len(),
            dedup_chunks: usage.values().filter(|&&c| c > 1).count(),
            dedup_saved_bytes,
        };
    }
}

/// Durable store for snapshots and their manifests.
///
/// One JSON file per finalized snapshot under `metadata/snapshots/`.
/// Pending snapshots live in memory and are invisible to every query.
#[derive(Debug)]
pub struct MetadataStore {
    snapshots_dir: PathBuf,
    pending: Mutex<HashMap<Uuid, Snapshot>>,
}

impl MetadataStore {
    /// Open or create the store under `metadata_dir`.
    pub fn open<P: AsRef<Path>>(metadata_dir: P) -> Result<Self> {
        let snapshots_dir = metadata_dir.as_ref().join("snapshots");
        fs::create_dir_all(&snapshots_dir).map_err(|e| Error::io_at(&snapshots_dir, e))?;
        Ok(Self {
            snapshots_dir,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Start a pending snapshot and return its id.
    pub fn create_snapshot(
        &self,
        name: &str,
        description: &str,
        source_root: Option<&Path>,
    ) -> Uuid {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            source_root: source_root.map(Path::to_path_buf),
            created: Utc::now(),
            file_count: 0,
            total_bytes: 0,
            files: Vec::new(),
            chunk_stats: ChunkStats::default(),
        };
        let id = snapshot.id;
        self.pending.lock().unwrap().insert(id, snapshot);
        id
    }

    /// Append a file manifest to a pending snapshot.
    pub fn add_file(&self, id: Uuid, manifest: FileManifest) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        let snapshot = pending.get_mut(&id).ok_or_else(|| Error::State {
            reason: format!("snapshot {} is not pending", id),
        })?;
        snapshot.files.push(manifest);
        Ok(())
    }

    /// Make a pending snapshot immutable and durable.
    ///
    /// The snapshot JSON is written to a temp file, fsynced and renamed
    /// into place, so it becomes queryable atomically.
    pub fn finalize_snapshot(
        &self,
        id: Uuid,
        file_count: u64,
        total_bytes: u64,
        chunk_size_of: impl Fn(&Digest) -> u64,
    ) -> Result<Snapshot> {
        let mut snapshot = self
            .pending
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| Error::State {
                reason: format!("snapshot {} is not pending", id),
            })?;
        snapshot.file_count = file_count;
        snapshot.total_bytes = total_bytes;
        snapshot.compute_chunk_stats(chunk_size_of);

        let final_path = self.snapshot_path(&id);
        let tmp_path = final_path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path).map_err(|e| Error::io_at(&tmp_path, e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &snapshot)?;
            writer.flush().map_err(|e| Error::io_at(&tmp_path, e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::io_at(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &final_path).map_err(|e| Error::io_at(&final_path, e))?;

        info!(snapshot = %id, files = file_count, bytes = total_bytes, "snapshot finalized");
        Ok(snapshot)
    }

    /// Drop a pending snapshot without a trace.
    pub fn abort_snapshot(&self, id: Uuid) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Load a finalized snapshot.
    pub fn get_snapshot(&self, id: Uuid) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(&id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.load_snapshot_file(&path)?))
    }

    /// All finalized snapshots, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.snapshots_dir)
            .map_err(|e| Error::io_at(&self.snapshots_dir, e))?
        {
            let path = entry.map_err(|e| Error::io_at(&self.snapshots_dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match self.load_snapshot_file(&path) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
                }
            }
        }
        snapshots.sort_by_key(|s| s.created);
        Ok(snapshots)
    }

    /// Manifests of a finalized snapshot.
    pub fn files_in_snapshot(&self, id: Uuid) -> Result<Vec<FileManifest>> {
        let snapshot = self.get_snapshot(id)?.ok_or_else(|| Error::SnapshotNotFound {
            id: id.to_string(),
        })?;
        Ok(snapshot.files)
    }

    /// Remove a finalized snapshot. Chunks are not garbage-collected.
    pub fn delete_snapshot(&self, id: Uuid) -> Result<()> {
        let path = self.snapshot_path(&id);
        if !path.exists() {
            return Err(Error::SnapshotNotFound { id: id.to_string() });
        }
        fs::remove_file(&path).map_err(|e| Error::io_at(&path, e))?;
        info!(snapshot = %id, "snapshot deleted");
        Ok(())
    }

    /// Most recent finalized snapshot taken from `root`, if any.
    pub fn latest_snapshot_for_root(&self, root: &Path) -> Result<Option<Snapshot>> {
        let snapshots = self.list_snapshots()?;
        Ok(snapshots
            .into_iter()
            .filter(|s| s.resolve_source_root().as_deref() == Some(root))
            .max_by_key(|s| s.created))
    }

    /// Every chunk digest referenced by any finalized snapshot.
    pub fn referenced_digests(&self) -> Result<HashSet<Digest>> {
        let mut referenced = HashSet::new();
        for snapshot in self.list_snapshots()? {
            referenced.extend(snapshot.referenced_chunks());
        }
        Ok(referenced)
    }

    fn snapshot_path(&self, id: &Uuid) -> PathBuf {
        self.snapshots_dir.join(format!("{}.json", id))
    }

    fn load_snapshot_file(&self, path: &Path) -> Result<Snapshot> {
        let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Integrity {
                reason: format!(
                    "unsupported snapshot version {} (expected {})",
                    snapshot.version, SNAPSHOT_VERSION
                ),
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn manifest(path: &str, data: &[u8]) -> FileManifest {
        FileManifest {
            path: PathBuf::from(path),
            size: data.len() as u64,
            modified: Utc::now(),
            mode: Some(0o644),
            chunks: vec![hash_bytes(data)],
            file_digest: hash_bytes(data),
        }
    }

    #[test]
    fn pending_snapshots_are_invisible_until_finalized() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;

        let id = store.create_snapshot("nightly", "", Some(Path::new("/data")));
        store.add_file(id, manifest("/data/a.txt", b"aaa"))?;

        assert!(store.get_snapshot(id)?.is_none());
        assert!(store.list_snapshots()?.is_empty());

        store.finalize_snapshot(id, 1, 3, |_| 3)?;
        let loaded = store.get_snapshot(id)?.unwrap();
        assert_eq!(loaded.file_count, 1);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.source_root, Some(PathBuf::from("/data")));
        Ok(())
    }

    #[test]
    fn aborted_snapshots_leave_no_trace() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;

        let id = store.create_snapshot("doomed", "", None);
        store.add_file(id, manifest("/x", b"x"))?;
        store.abort_snapshot(id);

        assert!(store.get_snapshot(id)?.is_none());
        assert!(matches!(
            store.add_file(id, manifest("/y", b"y")),
            Err(Error::State { .. })
        ));
        Ok(())
    }

    #[test]
    fn source_root_marker_fallback() {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            id: Uuid::new_v4(),
            name: "old".to_string(),
            description: format!("{}/srv/files", SOURCE_ROOT_MARKER),
            source_root: None,
            created: Utc::now(),
            file_count: 0,
            total_bytes: 0,
            files: Vec::new(),
            chunk_stats: ChunkStats::default(),
        };
        assert_eq!(
            snapshot.resolve_source_root(),
            Some(PathBuf::from("/srv/files"))
        );
    }

    #[test]
    fn chunk_stats_count_dedup() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;

        let id = store.create_snapshot("dedup", "", None);
        store.add_file(id, manifest("/a", b"shared"))?;
        store.add_file(id, manifest("/b", b"shared"))?;
        let snapshot = store.finalize_snapshot(id, 2, 12, |_| 6)?;

        assert_eq!(snapshot.chunk_stats.unique_chunks, 1);
        assert_eq!(snapshot.chunk_stats.dedup_chunks, 1);
        assert_eq!(snapshot.chunk_stats.dedup_saved_bytes, 6);
        Ok(())
    }

    #[test]
    fn latest_snapshot_for_root_picks_newest_matching() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;

        let first = store.create_snapshot("one", "", Some(Path::new("/data")));
        store.finalize_snapshot(first, 0, 0, |_| 0)?;
        let other_root = store.create_snapshot("two", "", Some(Path::new("/other")));
        store.finalize_snapshot(other_root, 0, 0, |_| 0)?;
        let second = store.create_snapshot("three", "", Some(Path::new("/data")));
        store.finalize_snapshot(second, 0, 0, |_| 0)?;

        let latest = store
            .latest_snapshot_for_root(Path::new("/data"))?
            .expect("a snapshot for /data");
        assert_eq!(latest.id, second);
        Ok(())
    }

    #[test]
    fn delete_snapshot_removes_manifests_only() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;

        let id = store.create_snapshot("gone", "", None);
        store.add_file(id, manifest("/a", b"abc"))?;
        store.finalize_snapshot(id, 1, 3, |_| 3)?;

        store.delete_snapshot(id)?;
        assert!(store.get_snapshot(id)?.is_none());
        assert!(matches!(
            store.delete_snapshot(id),
            Err(Error::SnapshotNotFound { .. })
        ));
        Ok(())
    }
}
