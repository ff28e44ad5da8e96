//! Application context wiring the stores, worker pool and services

use crate::backup::{BackupOptions, BackupReport, BackupService};
use crate::cbt::{CbtOptions, CbtService};
use crate::chunk_store::{ChunkStore, StoreStats, SweepStats};
use crate::config::Config;
use crate::hasher::Digest;
use crate::metadata::{MetadataStore, Snapshot};
use crate::restore::{RestoreOptions, RestoreReport, RestoreService};
use crate::scheduler::Scheduler;
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Top-level handle owning the stores, the injected worker pool and the
/// backup, restore and tracking services.
///
/// Subsystems receive references from here and never reach out to a
/// global.
pub struct Vault {
    config: Config,
    chunk_store: Arc<ChunkStore>,
    metadata: Arc<MetadataStore>,
    backup: Arc<BackupService>,
    restore: RestoreService,
    cbt: Option<Arc<CbtService>>,
}

impl Vault {
    /// Open the stores described by `config`, without change tracking.
    pub fn open(config: Config) -> Result<Self> {
        Self::build(config, None)
    }

    /// Open the stores and start the changed-block tracking service.
    pub fn open_with_tracking(config: Config, cbt_options: CbtOptions) -> Result<Self> {
        let cbt = CbtService::start(&config.journal_dir, cbt_options)?;
        Self::build(config, Some(Arc::new(cbt)))
    }

    fn build(config: Config, cbt: Option<Arc<CbtService>>) -> Result<Self> {
        config.validate()?;
        let chunk_store = Arc::new(ChunkStore::open(&config.chunks_dir)?);
        let metadata = Arc::new(MetadataStore::open(&config.metadata_dir)?);
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.worker_count)
                .thread_name(|i| format!("vault-worker-{}", i))
                .build()
                .map_err(|e| Error::Configuration {
                    reason: format!("cannot build worker pool: {}", e),
                })?,
        );

        let backup = Arc::new(BackupService::new(
            Arc::clone(&chunk_store),
            Arc::clone(&metadata),
            Arc::clone(&pool),
            cbt.clone(),
        ));
        let restore = RestoreService::new(Arc::clone(&chunk_store), Arc::clone(&metadata), pool);

        Ok(Self {
            config,
            chunk_store,
            metadata,
            backup,
            restore,
            cbt,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backup<P: AsRef<Path>>(
        &self,
        source: P,
        options: &BackupOptions,
    ) -> Result<BackupReport> {
        self.backup.backup(source, options)
    }

    pub fn restore<P: AsRef<Path>>(
        &self,
        snapshot_id: Uuid,
        target: P,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        self.restore.restore(snapshot_id, target, options)
    }

    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.metadata.list_snapshots()
    }

    pub fn get_snapshot(&self, id: Uuid) -> Result<Option<Snapshot>> {
        self.metadata.get_snapshot(id)
    }

    pub fn files_in_snapshot(&self, id: Uuid) -> Result<Vec<crate::metadata::FileManifest>> {
        self.metadata.files_in_snapshot(id)
    }

    pub fn delete_snapshot(&self, id: Uuid) -> Result<()> {
        self.metadata.delete_snapshot(id)
    }

    pub fn store_stats(&self) -> StoreStats {
        self.chunk_store.stats()
    }

    /// Re-read and re-hash every stored chunk; returns the corrupted ones.
    pub fn verify_store(&self) -> Result<Vec<Digest>> {
        self.chunk_store.verify_all()
    }

    /// Delete chunks no finalized snapshot references.
    pub fn sweep_orphaned_chunks(&self) -> Result<SweepStats> {
        let referenced = self.metadata.referenced_digests()?;
        self.chunk_store.sweep_orphaned_chunks(&referenced)
    }

    /// Build the scheduler bound to this vault's backup service.
    pub fn scheduler(&self) -> Result<Scheduler> {
        Scheduler::new(&self.config.schedules_path, Arc::clone(&self.backup))
    }

    /// The change tracking service, when the vault was opened with one.
    pub fn tracking(&self) -> Option<&Arc<CbtService>> {
        self.cbt.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn end_to_end_through_the_context() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("a.txt"), b"context test")?;

        let config = Config::with_storage_root(temp_dir.path().join("storage"));
        let vault = Vault::open(config)?;

        let backed = vault.backup(&source, &BackupOptions::default())?;
        assert!(backed.success);

        let target = temp_dir.path().join("target");
        let restored = vault.restore(backed.snapshot_id, &target, &RestoreOptions::default())?;
        assert!(restored.success);
        assert_eq!(fs::read(target.join("a.txt"))?, b"context test");

        assert_eq!(vault.list_snapshots()?.len(), 1);
        Ok(())
    }

    #[test]
    fn sweep_after_snapshot_deletion() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("only.txt"), b"orphan me")?;

        let vault = Vault::open(Config::with_storage_root(temp_dir.path().join("storage")))?;
        let backed = vault.backup(&source, &BackupOptions::default())?;
        assert_eq!(vault.store_stats().chunk_count, 1);

        // Deletion alone leaves the chunks; the sweep reclaims them.
        vault.delete_snapshot(backed.snapshot_id)?;
        assert_eq!(vault.store_stats().chunk_count, 1);
        let swept = vault.sweep_orphaned_chunks()?;
        assert_eq!(swept.removed_chunks, 1);
        assert_eq!(vault.store_stats().chunk_count, 0);
        Ok(())
    }
}
