//! Backup pipeline: scan, chunk, hash, dedupe-write, manifest
//!
//! Files are processed in parallel on the injected worker pool; within a
//! single file chunking is sequential so manifest order is file-offset
//! order. The snapshot becomes visible only at finalization, so an aborted
//! or cancelled backup leaves no trace.

use crate::cancel::CancelFlag;
use crate::cbt::{now_ms, CbtService};
use crate::chunk_store::ChunkStore;
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::hasher::{self, StreamingHasher};
use crate::metadata::{FileManifest, MetadataStore, Snapshot};
use crate::scanner::{compile_globs, Chunker, EntryKind, ScanEntry, ScanOptions, Scanner};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for one backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Snapshot name; autogenerated from the current time when empty
    pub snapshot_name: Option<String>,
    /// Free-form snapshot description
    pub description: Option<String>,
    /// Fixed chunk size in bytes
    pub chunk_size: usize,
    /// Re-read and re-hash every stored chunk after finalization
    pub verify_integrity: bool,
    /// Only paths matching one of these globs are backed up
    pub include_patterns: Vec<String>,
    /// Paths matching one of these globs are skipped
    pub exclude_patterns: Vec<String>,
    /// Restrict the file set to paths the CBT service marked dirty
    pub incremental: bool,
    /// Treat any per-file error as fatal to the whole backup
    pub strict: bool,
    /// Cooperative cancellation, checked between files
    pub cancel: CancelFlag,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            snapshot_name: None,
            description: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_integrity: false,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            incremental: false,
            strict: false,
            cancel: CancelFlag::new(),
        }
    }
}

/// One file the backup could not capture.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a backup run.
#[derive(Debug)]
pub struct BackupReport {
    pub snapshot_id: Uuid,
    pub files_backed_up: usize,
    pub files_failed: Vec<FileFailure>,
    pub bytes_processed: u64,
    pub duration: Duration,
    /// True iff no file failed and, when requested, verification passed
    pub success: bool,
    /// Result of the optional read-back verification
    pub integrity_verified: Option<bool>,
}

enum FileOutcome {
    Stored { size: u64 },
    Failed(FileFailure),
}

/// Progress callbacks for backup operations.
///
/// Workers run in parallel, so implementations must tolerate interleaved
/// calls.
pub trait BackupProgress: Send + Sync {
    /// Called when a file starts being chunked
    fn on_file_start(&self, path: &Path);

    /// Called when a file's manifest has been appended
    fn on_file_complete(&self, path: &Path, bytes: u64);

    /// Called when a file fails
    fn on_file_error(&self, path: &Path, error: &Error);

    /// Called once the run is over
    fn on_complete(&self, total_files: usize, total_bytes: u64);
}

/// A simple stdout progress reporter.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl BackupProgress for ConsoleProgress {
    fn on_file_start(&self, path: &Path) {
        println!("Backing up: {}", path.display());
    }

    fn on_file_complete(&self, _path: &Path, _bytes: u64) {}

    fn on_file_error(&self, path: &Path, error: &Error) {
        eprintln!("Error backing up {}: {}", path.display(), error);
    }

    fn on_complete(&self, total_files: usize, total_bytes: u64) {
        println!("Backup complete: {} files, {} bytes", total_files, total_bytes);
    }
}

/// Orchestrates scanner, chunker, hasher, content store and metadata store
/// into one transactional backup.
pub struct BackupService {
    chunk_store: Arc<ChunkStore>,
    metadata: Arc<MetadataStore>,
    pool: Arc<ThreadPool>,
    cbt: Option<Arc<CbtService>>,
    progress: Option<Arc<dyn BackupProgress>>,
}

impl BackupService {
    pub fn new(
        chunk_store: Arc<ChunkStore>,
        metadata: Arc<MetadataStore>,
        pool: Arc<ThreadPool>,
        cbt: Option<Arc<CbtService>>,
    ) -> Self {
        Self {
            chunk_store,
            metadata,
            pool,
            cbt,
            progress: None,
        }
    }

    /// Install a progress reporter.
    pub fn with_progress(mut self, progress: Arc<dyn BackupProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The metadata store this service writes to.
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// The content store this service writes to.
    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunk_store
    }

    /// Back up `source` into a new snapshot.
    ///
    /// Per-file errors are recorded on the report and do not abort the run
    /// unless `strict` is set. Unrecoverable store errors (and
    /// cancellation) abort: the pending snapshot is dropped and nothing
    /// becomes visible.
    pub fn backup<P: AsRef<Path>>(
        &self,
        source: P,
        options: &BackupOptions,
    ) -> Result<BackupReport> {
        let started = Instant::now();
        let started_ms = now_ms();
        let source = source.as_ref();
        if !source.is_dir() {
            return Err(Error::InvalidArgument {
                reason: format!("backup source {} is not a directory", source.display()),
            });
        }
        let source = source
            .canonicalize()
            .map_err(|e| Error::io_at(source, e))?;

        let name = options
            .snapshot_name
            .clone()
            .unwrap_or_else(|| format!("backup-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        let description = options.description.clone().unwrap_or_default();
        info!(source = %source.display(), name = %name, incremental = options.incremental, "starting backup");

        let snapshot_id = self
            .metadata
            .create_snapshot(&name, &description, Some(&source));

        let run = self.run_pipeline(&source, snapshot_id, options);
        let (files, mut failures) = match run {
            Ok(parts) => parts,
            Err(e) => {
                // Abort: the pending snapshot must stay invisible.
                self.metadata.abort_snapshot(snapshot_id);
                return Err(e);
            }
        };

        let files_backed_up = files.len();
        let bytes_processed: u64 = files.iter().map(|(_, size)| size).sum();
        if let Some(progress) = &self.progress {
            progress.on_complete(files_backed_up, bytes_processed);
        }

        let chunk_store = Arc::clone(&self.chunk_store);
        let snapshot = self.metadata.finalize_snapshot(
            snapshot_id,
            files_backed_up as u64,
            bytes_processed,
            move |digest| chunk_store.chunk_size(digest).unwrap_or(0),
        )?;

        let integrity_verified = if options.verify_integrity {
            Some(self.verify_snapshot(&snapshot, &mut failures))
        } else {
            None
        };

        let success = failures.is_empty() && integrity_verified != Some(false);
        if success {
            if let (true, Some(cbt)) = (options.incremental, &self.cbt) {
                // Post-backup cleanup: everything older than this run is
                // covered by the snapshot that just landed.
                if let Err(e) = cbt.cleanup_before(started_ms) {
                    warn!(error = %e, "journal cleanup after backup failed");
                }
            }
        }

        let report = BackupReport {
            snapshot_id,
            files_backed_up,
            files_failed: failures,
            bytes_processed,
            duration: started.elapsed(),
            success,
            integrity_verified,
        };
        info!(
            snapshot = %snapshot_id,
            files = report.files_backed_up,
            failed = report.files_failed.len(),
            bytes = report.bytes_processed,
            success = report.success,
            "backup finished"
        );
        Ok(report)
    }

    /// Select files, chunk and store them, and append their manifests.
    #[allow(clippy::type_complexity)]
    fn run_pipeline(
        &self,
        source: &Path,
        snapshot_id: Uuid,
        options: &BackupOptions,
    ) -> Result<(Vec<(PathBuf, u64)>, Vec<FileFailure>)> {
        let mut failures = Vec::new();
        let entries = self.select_files(source, options, &mut failures)?;

        let outcomes: Vec<FileOutcome> = self.pool.install(|| {
            entries
                .par_iter()
                .map(|entry| {
                    options.cancel.check()?;
                    if let Some(progress) = &self.progress {
                        progress.on_file_start(&entry.path);
                    }
                    match self.backup_file(snapshot_id, entry, options.chunk_size) {
                        Ok(size) => {
                            if let Some(progress) = &self.progress {
                                progress.on_file_complete(&entry.path, size);
                            }
                            Ok(FileOutcome::Stored { size })
                        }
                        Err(e) if options.strict => Err(e),
                        Err(e) => {
                            warn!(path = %entry.path.display(), error = %e, "file skipped");
                            if let Some(progress) = &self.progress {
                                progress.on_file_error(&entry.path, &e);
                            }
                            Ok(FileOutcome::Failed(FileFailure {
                                path: entry.path.clone(),
                                error: e.to_string(),
                            }))
                        }
                    }
                })
                .collect::<Result<Vec<FileOutcome>>>()
        })?;

        let mut files = Vec::new();
        for (entry, outcome) in entries.iter().zip(outcomes) {
            match outcome {
                FileOutcome::Stored { size } => files.push((entry.path.clone(), size)),
                FileOutcome::Failed(failure) => failures.push(failure),
            }
        }
        Ok((files, failures))
    }

    fn select_files(
        &self,
        source: &Path,
        options: &BackupOptions,
        failures: &mut Vec<FileFailure>,
    ) -> Result<Vec<ScanEntry>> {
        let include = if options.include_patterns.is_empty() {
            None
        } else {
            Some(compile_globs(&options.include_patterns)?)
        };
        let exclude = if options.exclude_patterns.is_empty() {
            None
        } else {
            Some(compile_globs(&options.exclude_patterns)?)
        };

        if options.incremental {
            if let Some(cbt) = &self.cbt {
                if let Some(previous) = self.metadata.latest_snapshot_for_root(source)? {
                    return self.select_changed(source, cbt, &previous, include, exclude);
                }
                debug!("no previous snapshot for this root, falling back to a full scan");
            } else {
                return Err(Error::State {
                    reason: "incremental backup requested without change tracking".to_string(),
                });
            }
        }

        let scanner = Scanner::new(ScanOptions {
            include,
            exclude,
            ..Default::default()
        });
        let mut entries = Vec::new();
        for item in scanner.scan(source) {
            match item {
                Ok(entry) if entry.kind == EntryKind::File => entries.push(entry),
                Ok(_) => {}
                Err(e) => failures.push(FileFailure {
                    path: source.to_path_buf(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(entries)
    }

    /// Incremental selection: dirty paths under the root, newer than the
    /// previous snapshot, still present on disk.
    fn select_changed(
        &self,
        source: &Path,
        cbt: &CbtService,
        previous: &Snapshot,
        include: Option<globset::GlobSet>,
        exclude: Option<globset::GlobSet>,
    ) -> Result<Vec<ScanEntry>> {
        let since_ms = previous.created.timestamp_millis();
        let mut entries = Vec::new();
        for path in cbt.changed_files(source, since_ms) {
            let relative = path.strip_prefix(source).unwrap_or(&path);
            if let Some(include) = &include {
                if !include.is_match(relative) {
                    continue;
                }
            }
            if let Some(exclude) = &exclude {
                if exclude.is_match(relative) {
                    continue;
                }
            }
            let metadata = match path.metadata() {
                Ok(m) => m,
                // Deleted since the event fired; nothing to capture.
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }
            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::MetadataExt;
                Some(metadata.mode())
            };
            #[cfg(not(unix))]
            let mode = None;
            entries.push(ScanEntry {
                path,
                kind: EntryKind::File,
                size: metadata.len(),
                modified: metadata
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now()),
                mode,
            });
        }
        info!(changed = entries.len(), "incremental selection");
        Ok(entries)
    }

    /// Chunk one file into the store and append its manifest.
    fn backup_file(&self, snapshot_id: Uuid, entry: &ScanEntry, chunk_size: usize) -> Result<u64> {
        let mut concat_hasher = StreamingHasher::new();
        let mut chunks = Vec::new();
        let mut stored_bytes = 0u64;

        for block in Chunker::new(&entry.path, chunk_size)? {
            let block = block?;
            concat_hasher.update(&block)?;
            stored_bytes += block.len() as u64;
            chunks.push(self.chunk_store.store_chunk(&block)?);
        }
        let concat_digest = concat_hasher.finalize()?;

        // Re-read for the whole-file digest; a mismatch means the file
        // changed under us and the manifest would be inconsistent.
        let file_digest = hasher::hash_file(&entry.path)?;
        if file_digest != concat_digest {
            return Err(Error::Integrity {
                reason: format!(
                    "{} changed while being read (digest {} vs {})",
                    entry.path.display(),
                    file_digest,
                    concat_digest
                ),
            });
        }

        self.metadata.add_file(
            snapshot_id,
            FileManifest {
                path: entry.path.clone(),
                size: stored_bytes,
                modified: entry.modified,
                mode: entry.mode,
                chunks,
                file_digest,
            },
        )?;
        debug!(path = %entry.path.display(), bytes = stored_bytes, "file stored");
        Ok(stored_bytes)
    }

    /// Read back and re-hash every chunk the snapshot references.
    fn verify_snapshot(&self, snapshot: &Snapshot, failures: &mut Vec<FileFailure>) -> bool {
        let mut ok = true;
        for file in &snapshot.files {
            for digest in &file.chunks {
                if let Err(e) = self.chunk_store.retrieve_chunk(digest) {
                    warn!(path = %file.path.display(), chunk = %digest, error = %e, "verification failed");
                    failures.push(FileFailure {
                        path: file.path.clone(),
                        error: e.to_string(),
                    });
                    ok = false;
                    break;
                }
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbt::CbtOptions;
    use crate::journal::ChangeKind;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::fs;
    use tempfile::TempDir;

    fn pool() -> Arc<ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        )
    }

    fn service(storage: &Path) -> BackupService {
        BackupService::new(
            Arc::new(ChunkStore::open(storage.join("chunks")).unwrap()),
            Arc::new(MetadataStore::open(storage.join("metadata")).unwrap()),
            pool(),
            None,
        )
    }

    #[test]
    fn backup_captures_a_tree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(source.join("sub"))?;
        fs::write(source.join("a.txt"), b"alpha")?;
        fs::write(source.join("sub/b.txt"), b"beta")?;

        let service = service(&temp_dir.path().join("storage"));
        let report = service.backup(&source, &BackupOptions::default())?;

        assert!(report.success);
        assert_eq!(report.files_backed_up, 2);
        assert_eq!(report.bytes_processed, 9);
        assert!(report.files_failed.is_empty());

        let snapshot = service
            .metadata
            .get_snapshot(report.snapshot_id)?
            .expect("finalized snapshot");
        assert_eq!(snapshot.file_count, 2);
        assert!(snapshot.resolve_source_root().is_some());
        Ok(())
    }

    #[test]
    fn identical_content_is_stored_once() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;

        // 1 MiB of fixed-seed random bytes in two files.
        let mut data = vec![0u8; 1024 * 1024];
        StdRng::seed_from_u64(12345).fill_bytes(&mut data);
        fs::write(source.join("a"), &data)?;
        fs::write(source.join("b"), &data)?;

        let service = service(&temp_dir.path().join("storage"));
        let options = BackupOptions {
            chunk_size: 64 * 1024,
            ..Default::default()
        };
        let report = service.backup(&source, &options)?;
        assert!(report.success);

        // One copy of the chunks, not two.
        let expected_chunks = data.len().div_ceil(64 * 1024);
        assert_eq!(service.chunk_store.stats().chunk_count, expected_chunks);

        let snapshot = service.metadata.get_snapshot(report.snapshot_id)?.unwrap();
        assert_eq!(snapshot.chunk_stats.unique_chunks, expected_chunks);
        assert_eq!(snapshot.chunk_stats.dedup_chunks, expected_chunks);
        Ok(())
    }

    #[test]
    fn per_file_errors_do_not_abort_without_strict() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("fine.txt"), b"fine")?;

        let service = service(&temp_dir.path().join("storage"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let locked = source.join("locked.txt");
            fs::write(&locked, b"secret")?;
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;

            // Mode bits do not stop a privileged user; only assert the
            // failure path when the file is actually unreadable.
            if fs::File::open(&locked).is_err() {
                let report = service.backup(&source, &BackupOptions::default())?;
                assert!(!report.success);
                assert_eq!(report.files_backed_up, 1);
                assert_eq!(report.files_failed.len(), 1);
                assert!(report.files_failed[0].path.ends_with("locked.txt"));

                // The snapshot still finalized with the good file.
                let snapshot = service.metadata.get_snapshot(report.snapshot_id)?.unwrap();
                assert_eq!(snapshot.file_count, 1);
            }

            fs::set_permissions(&locked, fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }

    #[test]
    fn progress_callbacks_fire() -> Result<()> {
        use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counting {
            started: AtomicUsize,
            completed: AtomicUsize,
            total_bytes: AtomicU64,
        }
        impl BackupProgress for Counting {
            fn on_file_start(&self, _path: &Path) {
                self.started.fetch_add(1, Ordering::Relaxed);
            }
            fn on_file_complete(&self, _path: &Path, _bytes: u64) {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            fn on_file_error(&self, _path: &Path, _error: &Error) {}
            fn on_complete(&self, _files: usize, bytes: u64) {
                self.total_bytes.store(bytes, Ordering::Relaxed);
            }
        }

        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("a.txt"), b"1234")?;
        fs::write(source.join("b.txt"), b"56789")?;

        let storage = temp_dir.path().join("storage");
        let counting = Arc::new(Counting::default());
        let service = BackupService::new(
            Arc::new(ChunkStore::open(storage.join("chunks"))?),
            Arc::new(MetadataStore::open(storage.join("metadata"))?),
            pool(),
            None,
        )
        .with_progress(Arc::clone(&counting) as Arc<dyn BackupProgress>);

        let report = service.backup(&source, &BackupOptions::default())?;
        assert!(report.success);
        assert_eq!(counting.started.load(Ordering::Relaxed), 2);
        assert_eq!(counting.completed.load(Ordering::Relaxed), 2);
        assert_eq!(counting.total_bytes.load(Ordering::Relaxed), 9);
        Ok(())
    }

    #[test]
    fn cancelled_backup_leaves_no_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("a.txt"), b"a")?;

        let service = service(&temp_dir.path().join("storage"));
        let options = BackupOptions::default();
        options.cancel.cancel();

        assert!(matches!(
            service.backup(&source, &options),
            Err(Error::Cancelled)
        ));
        assert!(service.metadata.list_snapshots()?.is_empty());
        Ok(())
    }

    #[test]
    fn verify_integrity_flags_corruption() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("a.txt"), b"precious bytes")?;

        let service = service(&temp_dir.path().join("storage"));
        let first = service.backup(&source, &BackupOptions::default())?;
        let snapshot = service.metadata.get_snapshot(first.snapshot_id)?.unwrap();
        let digest = snapshot.files[0].chunks[0];

        // Corrupt the stored blob, then back up again with verification.
        fs::write(service.chunk_store.blob_path(&digest), b"premious bytes")?;
        let options = BackupOptions {
            verify_integrity: true,
            ..Default::default()
        };
        let report = service.backup(&source, &options)?;
        assert_eq!(report.integrity_verified, Some(false));
        assert!(!report.success);
        Ok(())
    }

    #[test]
    fn incremental_backs_up_only_dirty_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("a.txt"), b"version one of a")?;
        fs::write(source.join("b.txt"), b"b never changes")?;

        let storage = temp_dir.path().join("storage");
        let cbt = Arc::new(CbtService::start(
            storage.join("journal"),
            CbtOptions::default(),
        )?);
        let service = BackupService::new(
            Arc::new(ChunkStore::open(storage.join("chunks"))?),
            Arc::new(MetadataStore::open(storage.join("metadata"))?),
            pool(),
            Some(Arc::clone(&cbt)),
        );

        let full = service.backup(&source, &BackupOptions::default())?;
        assert!(full.success);

        // Change a.txt and add new.txt; b.txt stays untouched.
        fs::write(source.join("a.txt"), b"version two of a")?;
        fs::write(source.join("new.txt"), b"brand new")?;
        let canonical = source.canonicalize()?;
        let later = now_ms() + 10;
        cbt.note_change(ChangeKind::Modified, canonical.join("a.txt"), later);
        cbt.note_change(ChangeKind::Created, canonical.join("new.txt"), later);

        let options = BackupOptions {
            incremental: true,
            ..Default::default()
        };
        let report = service.backup(&source, &options)?;
        assert!(report.success);
        assert_eq!(report.files_backed_up, 2);

        let snapshot = service.metadata.get_snapshot(report.snapshot_id)?.unwrap();
        let mut names: Vec<String> = snapshot
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "new.txt"]);

        // Unchanged content still shares chunks across snapshots.
        let first = service.metadata.get_snapshot(full.snapshot_id)?.unwrap();
        let b_manifest = first
            .files
            .iter()
            .find(|f| f.path.ends_with("b.txt"))
            .unwrap();
        for digest in &b_manifest.chunks {
            assert!(service.chunk_store.contains(digest));
        }
        Ok(())
    }
}
