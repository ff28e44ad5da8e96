//! Restore pipeline: manifest read, chunk fetch, verify, reassemble
//!
//! Files are restored in deterministic lexicographic path order; within a
//! file, chunks are written in manifest order and every chunk is re-hashed
//! as it is read back from the store.

use crate::backup::FileFailure;
use crate::cancel::CancelFlag;
use crate::chunk_store::ChunkStore;
use crate::hasher::{self, StreamingHasher};
use crate::metadata::{FileManifest, MetadataStore};
use crate::scanner::compile_globs;
use crate::{Error, Result};
use chrono::Utc;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for one restore run.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Replace files that already exist at the target
    pub overwrite_existing: bool,
    /// Record existing targets as skipped instead of failing them
    pub skip_existing: bool,
    /// Before overwriting, rename the existing file with a timestamped
    /// suffix
    pub backup_existing: bool,
    /// Re-hash every restored file after the run
    pub verify_integrity: bool,
    /// Restore modification time and unix permissions
    pub preserve_attributes: bool,
    /// Only paths matching one of these globs are restored
    pub include_patterns: Vec<String>,
    /// Paths matching one of these globs are skipped
    pub exclude_patterns: Vec<String>,
    /// Perform every lookup and check but write nothing
    pub dry_run: bool,
    /// Cooperative cancellation, checked between chunks
    pub cancel: CancelFlag,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: false,
            skip_existing: false,
            backup_existing: false,
            verify_integrity: false,
            preserve_attributes: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            dry_run: false,
            cancel: CancelFlag::new(),
        }
    }
}

/// Outcome of a restore run.
#[derive(Debug)]
pub struct RestoreReport {
    pub snapshot_id: Uuid,
    pub files_restored: usize,
    pub files_skipped: usize,
    pub files_failed: Vec<FileFailure>,
    pub bytes_written: u64,
    pub duration: Duration,
    /// True iff no file failed and, when requested, verification passed
    pub success: bool,
    /// Result of the optional final re-hash pass
    pub integrity_verified: Option<bool>,
}

enum FileOutcome {
    Restored {
        target: PathBuf,
        bytes: u64,
        expected: crate::hasher::Digest,
    },
    Skipped,
    Failed(FileFailure),
}

/// Reconstructs snapshots into a target directory.
pub struct RestoreService {
    chunk_store: Arc<ChunkStore>,
    metadata: Arc<MetadataStore>,
    pool: Arc<ThreadPool>,
}

impl RestoreService {
    pub fn new(
        chunk_store: Arc<ChunkStore>,
        metadata: Arc<MetadataStore>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            chunk_store,
            metadata,
            pool,
        }
    }

    /// Restore `snapshot_id` into `target_dir`.
    ///
    /// Per-file errors accumulate on the report; the run is aborted only
    /// by cancellation or an unusable metadata store.
    pub fn restore<P: AsRef<Path>>(
        &self,
        snapshot_id: Uuid,
        target_dir: P,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let started = Instant::now();
        let target_dir = target_dir.as_ref().to_path_buf();

        let snapshot = self
            .metadata
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| Error::SnapshotNotFound {
                id: snapshot_id.to_string(),
            })?;
        let source_root = snapshot.resolve_source_root();
        info!(
            snapshot = %snapshot_id,
            target = %target_dir.display(),
            files = snapshot.files.len(),
            dry_run = options.dry_run,
            "starting restore"
        );

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

        // Deterministic lexicographic order.
        let mut manifests: Vec<&FileManifest> = snapshot.files.iter().collect();
        manifests.sort_by(|a, b| a.path.cmp(&b.path));

        let outcomes: Vec<FileOutcome> = self.pool.install(|| {
            manifests
                .par_iter()
                .map(|manifest| {
                    let relative = store_relative_path(&manifest.path, source_root.as_deref());
                    if let Some(include) = &include {
                        if !include.is_match(&relative) {
                            return Ok(FileOutcome::Skipped);
                        }
                    }
                    if let Some(exclude) = &exclude {
                        if exclude.is_match(&relative) {
                            return Ok(FileOutcome::Skipped);
                        }
                    }
                    let target = target_dir.join(&relative);
                    match self.restore_file(manifest, &target, options) {
                        Ok(outcome) => Ok(outcome),
                        Err(Error::Cancelled) => Err(Error::Cancelled),
                        Err(e) => {
                            warn!(path = %manifest.path.display(), error = %e, "file restore failed");
                            Ok(FileOutcome::Failed(FileFailure {
                                path: manifest.path.clone(),
                                error: e.to_string(),
                            }))
                        }
                    }
                })
                .collect::<Result<Vec<FileOutcome>>>()
        })?;

        let mut report = RestoreReport {
            snapshot_id,
            files_restored: 0,
            files_skipped: 0,
            files_failed: Vec::new(),
            bytes_written: 0,
            duration: Duration::default(),
            success: false,
            integrity_verified: None,
        };
        let mut restored_targets = Vec::new();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Restored {
                    target,
                    bytes,
                    expected,
                } => {
                    report.files_restored += 1;
                    report.bytes_written += bytes;
                    restored_targets.push((target, expected));
                }
                FileOutcome::Skipped => report.files_skipped += 1,
                FileOutcome::Failed(failure) => report.files_failed.push(failure),
            }
        }

        if options.verify_integrity && !options.dry_run {
            report.integrity_verified =
                Some(verify_restored(&restored_targets, &mut report.files_failed));
        }

        report.success =
            report.files_failed.is_empty() && report.integrity_verified != Some(false);
        report.duration = started.elapsed();
        info!(
            restored = report.files_restored,
            skipped = report.files_skipped,
            failed = report.files_failed.len(),
            success = report.success,
            "restore finished"
        );
        Ok(report)
    }

    fn restore_file(
        &self,
        manifest: &FileManifest,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<FileOutcome> {
        options.cancel.check()?;

        if target.exists() {
            if options.overwrite_existing {
                if options.backup_existing && !options.dry_run {
                    let backup_name = format!(
                        "{}.bak-{}",
                        target
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "file".to_string()),
                        Utc::now().format("%Y%m%d%H%M%S")
                    );
                    let backup_path = target.with_file_name(backup_name);
                    fs::rename(target, &backup_path).map_err(|e| Error::io_at(target, e))?;
                    debug!(original = %target.display(), saved = %backup_path.display(), "existing file preserved");
                }
            } else if options.skip_existing {
                return Ok(FileOutcome::Skipped);
            } else {
                return Err(Error::InvalidArgument {
                    reason: format!("target {} already exists", target.display()),
                });
            }
        }

        if options.dry_run {
            // All lookups, no writes: confirm every chunk is present.
            for digest in &manifest.chunks {
                if !self.chunk_store.contains(digest) {
                    return Err(Error::ChunkNotFound {
                        digest: digest.to_hex(),
                    });
                }
            }
            return Ok(FileOutcome::Restored {
                target: target.to_path_buf(),
                bytes: manifest.size,
                expected: manifest.file_digest,
            });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }

        let result = self.write_file(manifest, target, options);
        if result.is_err() {
            // Never leave a half-written file behind.
            let _ = fs::remove_file(target);
        }
        result
    }

    fn write_file(
        &self,
        manifest: &FileManifest,
        target: &Path,
        options: &RestoreOptions,
    ) -> Result<FileOutcome> {
        let file = File::create(target).map_err(|e| Error::io_at(target, e))?;
        let mut writer = BufWriter::new(file);
        let mut whole_hasher = StreamingHasher::new();
        let mut bytes = 0u64;

        for digest in &manifest.chunks {
            options.cancel.check()?;
            // The store re-hashes on read, so a mismatch with the listed
            // digest surfaces here as an integrity error.
            let chunk = self.chunk_store.retrieve_chunk(digest)?;
            whole_hasher.update(&chunk)?;
            writer
                .write_all(&chunk)
                .map_err(|e| Error::io_at(target, e))?;
            bytes += chunk.len() as u64;
        }
        writer.flush().map_err(|e| Error::io_at(target, e))?;

        if bytes != manifest.size {
            return Err(Error::Integrity {
                reason: format!(
                    "{} reassembled to {} bytes, manifest says {}",
                    target.display(),
                    bytes,
                    manifest.size
                ),
            });
        }
        let whole_digest = whole_hasher.finalize()?;
        if whole_digest != manifest.file_digest {
            return Err(Error::Integrity {
                reason: format!(
                    "{} reassembled with digest {}, manifest says {}",
                    target.display(),
                    whole_digest,
                    manifest.file_digest
                ),
            });
        }

        if options.preserve_attributes {
            let file = writer.get_ref();
            file.set_modified(manifest.modified.into())
                .map_err(|e| Error::io_at(target, e))?;
            #[cfg(unix)]
            if let Some(mode) = manifest.mode {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(target, fs::Permissions::from_mode(mode))
                    .map_err(|e| Error::io_at(target, e))?;
            }
        }

        debug!(target = %target.display(), bytes, "file restored");
        Ok(FileOutcome::Restored {
            target: target.to_path_buf(),
            bytes,
            expected: manifest.file_digest,
        })
    }
}

/// Final pass: re-hash every restored file against its manifest digest.
fn verify_restored(
    restored: &[(PathBuf, crate::hasher::Digest)],
    failures: &mut Vec<FileFailure>,
) -> bool {
    let mut ok = true;
    for (target, expected) in restored {
        match hasher::hash_file(target) {
            Ok(digest) if digest == *expected => {}
            Ok(digest) => {
                failures.push(FileFailure {
                    path: target.clone(),
                    error: format!(
                        "restored file digest {} does not match manifest {}",
                        digest, expected
                    ),
                });
                ok = false;
            }
            Err(e) => {
                failures.push(FileFailure {
                    path: target.clone(),
                    error: e.to_string(),
                });
                ok = false;
            }
        }
    }
    ok
}

/// Path of the file inside the store, relative to the snapshot's source
/// root. Without a recoverable root, the leading root components are
/// stripped so the full structure lands under the target.
fn store_relative_path(path: &Path, source_root: Option<&Path>) -> PathBuf {
    if let Some(root) = source_root {
        if let Ok(relative) = path.strip_prefix(root) {
            return relative.to_path_buf();
        }
    }
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupOptions, BackupService};
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        target: PathBuf,
        backup: BackupService,
        restore: RestoreService,
        chunk_store: Arc<ChunkStore>,
        metadata: Arc<MetadataStore>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let target = temp.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();

        let storage = temp.path().join("storage");
        let chunk_store = Arc::new(ChunkStore::open(storage.join("chunks")).unwrap());
        let metadata = Arc::new(MetadataStore::open(storage.join("metadata")).unwrap());
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        );

        Fixture {
            backup: BackupService::new(
                Arc::clone(&chunk_store),
                Arc::clone(&metadata),
                Arc::clone(&pool),
                None,
            ),
            restore: RestoreService::new(Arc::clone(&chunk_store), Arc::clone(&metadata), pool),
            chunk_store,
            metadata,
            source,
            target,
            _temp: temp,
        }
    }

    #[test]
    fn round_trip_single_file() -> Result<()> {
        let fx = fixture();
        let content = b"Hello, World! This is a test file for backup and restore.";
        fs::write(fx.source.join("a.txt"), content)?;

        let backed = fx.backup.backup(&fx.source, &BackupOptions::default())?;
        let report = fx
            .restore
            .restore(backed.snapshot_id, &fx.target, &RestoreOptions::default())?;

        assert!(report.success);
        assert_eq!(report.files_restored, 1);
        assert_eq!(fs::read(fx.target.join("a.txt"))?, content);

        let snapshot = fx.metadata.get_snapshot(backed.snapshot_id)?.unwrap();
        assert_eq!(
            snapshot.files[0].file_digest,
            hasher::hash_file(fx.target.join("a.txt"))?
        );
        Ok(())
    }

    #[test]
    fn round_trip_preserves_structure_and_bytes() -> Result<()> {
        let fx = fixture();
        fs::create_dir_all(fx.source.join("nested/deep"))?;
        fs::write(fx.source.join("top.txt"), b"top")?;
        fs::write(fx.source.join("nested/mid.bin"), vec![9u8; 300_000])?;
        fs::write(fx.source.join("nested/deep/leaf"), b"")?;

        let options = BackupOptions {
            chunk_size: 64 * 1024,
            ..Default::default()
        };
        let backed = fx.backup.backup(&fx.source, &options)?;
        let report = fx
            .restore
            .restore(backed.snapshot_id, &fx.target, &RestoreOptions::default())?;

        assert!(report.success);
        assert_eq!(report.files_restored, 3);
        assert_eq!(fs::read(fx.target.join("top.txt"))?, b"top");
        assert_eq!(fs::read(fx.target.join("nested/mid.bin"))?, vec![9u8; 300_000]);
        assert_eq!(fs::read(fx.target.join("nested/deep/leaf"))?, b"");
        Ok(())
    }

    #[test]
    fn missing_snapshot_is_reported() {
        let fx = fixture();
        let result = fx
            .restore
            .restore(Uuid::new_v4(), &fx.target, &RestoreOptions::default());
        assert!(matches!(result, Err(Error::SnapshotNotFound { .. })));
    }

    #[test]
    fn existing_target_policies() -> Result<()> {
        let fx = fixture();
        fs::write(fx.source.join("a.txt"), b"from snapshot")?;
        let backed = fx.backup.backup(&fx.source, &BackupOptions::default())?;

        fs::write(fx.target.join("a.txt"), b"already here")?;

        // Default: existing target fails the file.
        let report = fx
            .restore
            .restore(backed.snapshot_id, &fx.target, &RestoreOptions::default())?;
        assert!(!report.success);
        assert_eq!(report.files_failed.len(), 1);
        assert_eq!(fs::read(fx.target.join("a.txt"))?, b"already here");

        // skip_existing records a skip.
        let options = RestoreOptions {
            skip_existing: true,
            ..Default::default()
        };
        let report = fx.restore.restore(backed.snapshot_id, &fx.target, &options)?;
        assert!(report.success);
        assert_eq!(report.files_skipped, 1);

        // overwrite + backup_existing preserves the old bytes aside.
        let options = RestoreOptions {
            overwrite_existing: true,
            backup_existing: true,
            ..Default::default()
        };
        let report = fx.restore.restore(backed.snapshot_id, &fx.target, &options)?;
        assert!(report.success);
        assert_eq!(fs::read(fx.target.join("a.txt"))?, b"from snapshot");
        let saved: Vec<_> = fs::read_dir(&fx.target)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("a.txt.bak-"))
            .collect();
        assert_eq!(saved.len(), 1);
        Ok(())
    }

    #[test]
    fn corrupted_chunk_fails_only_that_file() -> Result<()> {
        let fx = fixture();
        fs::write(fx.source.join("good.txt"), b"good bytes")?;
        fs::write(fx.source.join("bad.txt"), b"soon to be corrupted")?;

        let backed = fx.backup.backup(&fx.source, &BackupOptions::default())?;
        let snapshot = fx.metadata.get_snapshot(backed.snapshot_id)?.unwrap();
        let bad_digest = snapshot
            .files
            .iter()
            .find(|f| f.path.ends_with("bad.txt"))
            .unwrap()
            .chunks[0];
        fs::write(fx.chunk_store.blob_path(&bad_digest), b"soon to be Corrupted")?;

        let report = fx
            .restore
            .restore(backed.snapshot_id, &fx.target, &RestoreOptions::default())?;
        assert!(!report.success);
        assert_eq!(report.files_restored, 1);
        assert_eq!(report.files_failed.len(), 1);
        assert!(report.files_failed[0].path.ends_with("bad.txt"));
        assert!(fx.target.join("good.txt").exists());
        // No partial file left behind.
        assert!(!fx.target.join("bad.txt").exists());
        Ok(())
    }

    #[test]
    fn dry_run_writes_nothing() -> Result<()> {
        let fx = fixture();
        fs::write(fx.source.join("a.txt"), b"data")?;
        let backed = fx.backup.backup(&fx.source, &BackupOptions::default())?;

        let options = RestoreOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = fx.restore.restore(backed.snapshot_id, &fx.target, &options)?;
        assert!(report.success);
        assert_eq!(report.files_restored, 1);
        assert!(!fx.target.join("a.txt").exists());
        Ok(())
    }

    #[test]
    fn patterns_select_files() -> Result<()> {
        let fx = fixture();
        fs::write(fx.source.join("keep.txt"), b"keep")?;
        fs::write(fx.source.join("drop.log"), b"drop")?;
        let backed = fx.backup.backup(&fx.source, &BackupOptions::default())?;

        let options = RestoreOptions {
            exclude_patterns: vec!["*.log".to_string()],
            ..Default::default()
        };
        let report = fx.restore.restore(backed.snapshot_id, &fx.target, &options)?;
        assert!(report.success);
        assert_eq!(report.files_restored, 1);
        assert!(fx.target.join("keep.txt").exists());
        assert!(!fx.target.join("drop.log").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn attributes_are_preserved() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture();
        let path = fx.source.join("exec.sh");
        fs::write(&path, b"#!/bin/sh\n")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

        let backed = fx.backup.backup(&fx.source, &BackupOptions::default())?;
        fx.restore
            .restore(backed.snapshot_id, &fx.target, &RestoreOptions::default())?;

        let restored = fx.target.join("exec.sh");
        let mode = fs::metadata(&restored)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let original_mtime = fs::metadata(&path)?.modified()?;
        let restored_mtime = fs::metadata(&restored)?.modified()?;
        let drift = original_mtime
            .duration_since(restored_mtime)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn final_verification_pass() -> Result<()> {
        let fx = fixture();
        fs::write(fx.source.join("a.txt"), b"verified bytes")?;
        let backed = fx.backup.backup(&fx.source, &BackupOptions::default())?;

        let options = RestoreOptions {
            verify_integrity: true,
            ..Default::default()
        };
        let report = fx.restore.restore(backed.snapshot_id, &fx.target, &options)?;
        assert!(report.success);
        assert_eq!(report.integrity_verified, Some(true));
        Ok(())
    }
}
