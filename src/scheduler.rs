//! Interval-driven backup scheduling
//!
//! Schedules persist as a JSON array on disk. Each enabled schedule gets
//! its own timer task; a firing runs the backup on the blocking pool and
//! persists the updated run state. Shutdown grants the tasks a bounded
//! drain before aborting them.

use crate::backup::{BackupOptions, BackupService};
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Grace period granted to running timer tasks on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A daily schedule expressed in minutes.
pub const DAILY_MINUTES: u64 = 24 * 60;

/// One persistent backup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub source_path: PathBuf,
    pub interval_minutes: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
}

struct Inner {
    schedules_path: PathBuf,
    backup: Arc<BackupService>,
    schedules: Mutex<HashMap<String, Schedule>>,
    /// Length of one scheduling minute; tests shrink it
    minute: Duration,
}

impl Inner {
    fn persist(&self) -> Result<()> {
        let schedules = self.schedules.lock().unwrap();
        let mut list: Vec<&Schedule> = schedules.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        if let Some(parent) = self.schedules_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }
        let tmp_path = self.schedules_path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path).map_err(|e| Error::io_at(&tmp_path, e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &list)?;
            writer.flush().map_err(|e| Error::io_at(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.schedules_path)
            .map_err(|e| Error::io_at(&self.schedules_path, e))?;
        Ok(())
    }

    fn record_run(&self, id: &str, started: DateTime<Utc>, result: String) {
        let mut schedules = self.schedules.lock().unwrap();
        if let Some(schedule) = schedules.get_mut(id) {
            schedule.last_run = Some(started);
            schedule.next_run =
                Some(started + ChronoDuration::minutes(schedule.interval_minutes as i64));
            schedule.last_result = Some(result);
        }
        drop(schedules);
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist schedule state");
        }
    }
}

/// Persistent, interval-driven backup scheduler.
pub struct Scheduler {
    inner: Arc<Inner>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    started: AtomicBool,
}

impl Scheduler {
    /// Load schedules from `schedules_path` (missing file means none).
    pub fn new<P: AsRef<Path>>(schedules_path: P, backup: Arc<BackupService>) -> Result<Self> {
        Self::with_minute(schedules_path, backup, Duration::from_secs(60))
    }

    fn with_minute<P: AsRef<Path>>(
        schedules_path: P,
        backup: Arc<BackupService>,
        minute: Duration,
    ) -> Result<Self> {
        let schedules_path = schedules_path.as_ref().to_path_buf();
        let mut schedules = HashMap::new();
        if schedules_path.exists() {
            let content = fs::read_to_string(&schedules_path)
                .map_err(|e| Error::io_at(&schedules_path, e))?;
            let list: Vec<Schedule> = serde_json::from_str(&content)?;
            for schedule in list {
                schedules.insert(schedule.id.clone(), schedule);
            }
        }
        info!(count = schedules.len(), "loaded schedules");

        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            inner: Arc::new(Inner {
                schedules_path,
                backup,
                schedules: Mutex::new(schedules),
                minute,
            }),
            tasks: Mutex::new(HashMap::new()),
            shutdown,
            started: AtomicBool::new(false),
        })
    }

    /// Shrink the scheduling minute so interval tests run in real time.
    #[cfg(test)]
    pub(crate) fn new_scaled<P: AsRef<Path>>(
        schedules_path: P,
        backup: Arc<BackupService>,
        minute: Duration,
    ) -> Result<Self> {
        Self::with_minute(schedules_path, backup, minute)
    }

    /// Arm a timer for every enabled schedule.
    ///
    /// Must run inside a tokio runtime; later additions arm themselves.
    pub fn start(&self) {
        self.started.store(true, Ordering::Relaxed);
        let schedules = self.inner.schedules.lock().unwrap();
        let ids: Vec<String> = schedules
            .values()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone())
            .collect();
        drop(schedules);
        for id in ids {
            self.arm(&id);
        }
    }

    /// Create, persist and (when enabled) arm a new schedule.
    pub fn add_schedule(
        &self,
        name: &str,
        source_path: &Path,
        interval_minutes: u64,
        enabled: bool,
    ) -> Result<Schedule> {
        if interval_minutes == 0 {
            return Err(Error::Scheduling {
                reason: "interval must be at least one minute".to_string(),
            });
        }
        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            source_path: source_path.to_path_buf(),
            interval_minutes,
            enabled,
            created_at: Utc::now(),
            last_run: None,
            next_run: None,
            last_result: None,
        };
        self.inner
            .schedules
            .lock()
            .unwrap()
            .insert(schedule.id.clone(), schedule.clone());
        self.inner.persist()?;
        if enabled && self.started.load(Ordering::Relaxed) {
            self.arm(&schedule.id);
        }
        info!(schedule = %schedule.id, name = %schedule.name, "schedule added");
        Ok(schedule)
    }

    /// Remove a schedule and cancel its timer.
    pub fn delete_schedule(&self, id: &str) -> Result<()> {
        let removed = self.inner.schedules.lock().unwrap().remove(id);
        if removed.is_none() {
            return Err(Error::Scheduling {
                reason: format!("no schedule with id {}", id),
            });
        }
        if let Some(task) = self.tasks.lock().unwrap().remove(id) {
            task.abort();
        }
        self.inner.persist()?;
        info!(schedule = %id, "schedule deleted");
        Ok(())
    }

    /// All schedules, oldest first.
    pub fn list_schedules(&self) -> Vec<Schedule> {
        let schedules = self.inner.schedules.lock().unwrap();
        let mut list: Vec<Schedule> = schedules.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn get_schedule(&self, id: &str) -> Option<Schedule> {
        self.inner.schedules.lock().unwrap().get(id).cloned()
    }

    /// Cancel all timers, allowing a bounded drain before aborting.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let handles: Vec<(String, JoinHandle<()>)> =
            self.tasks.lock().unwrap().drain().collect();

        let drain = async {
            for (_, handle) in &handles {
                // A task that already observed the shutdown signal
                // finishes quickly; aborted handles error out, which is
                // fine here.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace period elapsed, aborting timer tasks");
            for (_, handle) in &handles {
                handle.abort();
            }
        }
        info!("scheduler stopped");
    }

    /// Spawn the timer task for one schedule.
    fn arm(&self, id: &str) {
        let Some(schedule) = self.get_schedule(id) else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            // Unset or past next_run fires immediately.
            let initial = schedule
                .next_run
                .and_then(|next| (next - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(initial) => {}
                _ = shutdown.recv() => return,
            }

            let interval = inner.minute.saturating_mul(schedule.interval_minutes as u32);
            loop {
                let started = Utc::now();
                let result = run_backup(&inner, &schedule).await;
                inner.record_run(&schedule.id, started, result);

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.recv() => return,
                }
            }
        });
        self.tasks.lock().unwrap().insert(id.to_string(), handle);
    }
}

async fn run_backup(inner: &Arc<Inner>, schedule: &Schedule) -> String {
    let backup = Arc::clone(&inner.backup);
    let source = schedule.source_path.clone();
    let options = BackupOptions {
        snapshot_name: Some(format!(
            "{}-{}",
            schedule.name,
            Utc::now().format("%Y%m%d-%H%M%S")
        )),
        description: Some(format!("scheduled backup {}", schedule.name)),
        ..Default::default()
    };

    let outcome =
        tokio::task::spawn_blocking(move || backup.backup(&source, &options)).await;
    match outcome {
        Ok(Ok(report)) if report.success => "Success".to_string(),
        Ok(Ok(report)) => format!("Failed: {} files with errors", report.files_failed.len()),
        Ok(Err(e)) => format!("Failed: {}", e),
        Err(e) => format!("Failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::ChunkStore;
    use crate::metadata::MetadataStore;
    use std::fs;
    use tempfile::TempDir;

    fn backup_service(storage: &Path) -> Arc<BackupService> {
        Arc::new(BackupService::new(
            Arc::new(ChunkStore::open(storage.join("chunks")).unwrap()),
            Arc::new(MetadataStore::open(storage.join("metadata")).unwrap()),
            Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(2)
                    .build()
                    .unwrap(),
            ),
            None,
        ))
    }

    #[tokio::test]
    async fn schedules_persist_across_reloads() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("schedules.json");
        let backup = backup_service(&temp_dir.path().join("storage"));

        let scheduler = Scheduler::new(&path, Arc::clone(&backup))?;
        let schedule = scheduler.add_schedule("nightly", Path::new("/data"), DAILY_MINUTES, false)?;
        drop(scheduler);

        let reloaded = Scheduler::new(&path, backup)?;
        let list = reloaded.list_schedules();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, schedule.id);
        assert_eq!(list[0].interval_minutes, DAILY_MINUTES);
        Ok(())
    }

    #[tokio::test]
    async fn delete_unknown_schedule_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backup = backup_service(&temp_dir.path().join("storage"));
        let scheduler = Scheduler::new(temp_dir.path().join("schedules.json"), backup)?;
        assert!(matches!(
            scheduler.delete_schedule("nope"),
            Err(Error::Scheduling { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn enabled_schedule_fires_and_records_result() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source)?;
        fs::write(source.join("a.txt"), b"scheduled")?;

        let backup = backup_service(&temp_dir.path().join("storage"));
        // A 50ms "minute" keeps the interval test fast.
        let scheduler = Scheduler::new_scaled(
            temp_dir.path().join("schedules.json"),
            backup,
            Duration::from_millis(50),
        )?;

        scheduler.start();
        let schedule = scheduler.add_schedule("tick", &source, 1, true)?;

        // An unset next_run fires immediately.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
        loop {
            if let Some(current) = scheduler.get_schedule(&schedule.id) {
                if current.last_run.is_some() {
                    assert_eq!(current.last_result.as_deref(), Some("Success"));
                    assert!(current.next_run.is_some());
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "schedule never fired");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Delete stops further firings. Let any in-flight run drain, then
        // watch the snapshot count stay put.
        scheduler.delete_schedule(&schedule.id)?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let stable = scheduler.inner.backup.metadata().list_snapshots()?.len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            scheduler.inner.backup.metadata().list_snapshots()?.len(),
            stable
        );

        scheduler.stop().await;
        Ok(())
    }
}
