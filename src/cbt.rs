//! Changed-block tracking service
//!
//! Watches registered roots for filesystem changes, keeps an in-memory
//! dirty-file map and mirrors every event into the durable journal so the
//! map survives restarts.

use crate::bitmap::BlockBitmap;
use crate::journal::{ChangeEvent, ChangeKind, Journal};
use crate::{Error, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Watch-mode configuration.
#[derive(Debug, Clone)]
pub struct CbtOptions {
    /// Watch registered roots recursively
    pub recursive_watching: bool,
    /// Coalesce bursts of events per path
    pub event_debouncing_enabled: bool,
    /// Debounce window in milliseconds
    pub debounce_timeout_ms: u64,
}

impl Default for CbtOptions {
    fn default() -> Self {
        Self {
            recursive_watching: true,
            event_debouncing_enabled: true,
            debounce_timeout_ms: 500,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug)]
struct Shared {
    dirty: Mutex<HashMap<PathBuf, i64>>,
    /// Per-file dirty-block bitmaps for callers that report byte ranges
    bitmaps: Mutex<HashMap<PathBuf, BlockBitmap>>,
    journal: Journal,
}

impl Shared {
    /// Apply one whole-file event to the dirty map and journal it.
    ///
    /// Journal write failures are logged and swallowed so the watcher
    /// thread survives them. A whole-file event invalidates any
    /// finer-grained bitmap for the path.
    fn apply(&self, event: &ChangeEvent) {
        self.record_dirty(event);
        let mut bitmaps = self.bitmaps.lock().unwrap();
        match event.kind {
            ChangeKind::Deleted => {
                bitmaps.remove(&event.path);
            }
            _ => {
                if let Some(bitmap) = bitmaps.get_mut(&event.path) {
                    let size = bitmap.file_size();
                    let _ = bitmap.mark_range(0, size);
                }
            }
        }
    }

    fn record_dirty(&self, event: &ChangeEvent) {
        self.dirty
            .lock()
            .unwrap()
            .insert(event.path.clone(), event.timestamp_ms);
        if let Err(e) = self.journal.record(event) {
            warn!(path = %event.path.display(), error = %e, "failed to journal change event");
        }
    }
}

struct PendingChange {
    kind: ChangeKind,
    first_seen: Instant,
    timestamp_ms: i64,
    registration_id: Option<String>,
    event_count: u32,
}

/// Changed-block tracking service.
///
/// Owns the journal, the dirty-file map and the filesystem watcher. One
/// dispatch thread drains watcher events, debounces them and applies them.
pub struct CbtService {
    shared: Arc<Shared>,
    options: CbtOptions,
    watcher: Mutex<RecommendedWatcher>,
    registrations: Arc<Mutex<HashMap<PathBuf, String>>>,
    raw_tx: Sender<RawEvent>,
    dispatcher: Option<JoinHandle<()>>,
}

enum RawEvent {
    Change {
        kind: ChangeKind,
        path: PathBuf,
        registration_id: Option<String>,
    },
    Shutdown,
}

impl CbtService {
    /// Open the journal under `journal_dir`, replay it into the dirty map
    /// and start the watcher.
    pub fn start<P: AsRef<Path>>(journal_dir: P, options: CbtOptions) -> Result<Self> {
        let journal = Journal::open(journal_dir)?;

        // Replay: latest timestamp per path wins; deletions stay visible
        // as dirty entries so incremental backups can notice them.
        let mut dirty = HashMap::new();
        for event in journal.replay()? {
            dirty
                .entry(event.path)
                .and_modify(|t: &mut i64| *t = (*t).max(event.timestamp_ms))
                .or_insert(event.timestamp_ms);
        }
        info!(entries = dirty.len(), "replayed change journal");

        let shared = Arc::new(Shared {
            dirty: Mutex::new(dirty),
            bitmaps: Mutex::new(HashMap::new()),
            journal,
        });

        let (raw_tx, raw_rx) = mpsc::channel();
        let dispatcher = spawn_dispatcher(Arc::clone(&shared), options.clone(), raw_rx);

        let registrations: Arc<Mutex<HashMap<PathBuf, String>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let watcher_tx = raw_tx.clone();
        let watcher_registrations = Arc::clone(&registrations);
        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let Some(kind) = map_event_kind(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        let registration_id = {
                            let registrations = watcher_registrations.lock().unwrap();
                            registrations
                                .iter()
                                .find(|(root, _)| path.starts_with(root))
                                .map(|(_, id)| id.clone())
                        };
                        let _ = watcher_tx.send(RawEvent::Change {
                            kind,
                            path,
                            registration_id,
                        });
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            }
        })
        .map_err(|e| Error::State {
            reason: format!("failed to start filesystem watcher: {}", e),
        })?;

        Ok(Self {
            shared,
            options,
            watcher: Mutex::new(watcher),
            registrations,
            raw_tx,
            dispatcher: Some(dispatcher),
        })
    }

    /// Register a watch on `root`. Idempotent.
    pub fn enable_tracking<P: AsRef<Path>>(&self, root: P) -> Result<String> {
        let root = canonicalize(root.as_ref())?;
        let mut registrations = self.registrations.lock().unwrap();
        if let Some(existing) = registrations.get(&root) {
            return Ok(existing.clone());
        }

        let mode = if self.options.recursive_watching {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher
            .lock()
            .unwrap()
            .watch(&root, mode)
            .map_err(|e| Error::State {
                reason: format!("cannot watch {}: {}", root.display(), e),
            })?;

        let registration_id = Uuid::new_v4().to_string();
        registrations.insert(root.clone(), registration_id.clone());
        info!(root = %root.display(), registration = %registration_id, "tracking enabled");
        Ok(registration_id)
    }

    /// Cancel the watch registration for `root`.
    pub fn disable_tracking<P: AsRef<Path>>(&self, root: P) -> Result<()> {
        let root = canonicalize(root.as_ref())?;
        let mut registrations = self.registrations.lock().unwrap();
        let Some(registration_id) = registrations.remove(&root) else {
            return Err(Error::InvalidArgument {
                reason: format!("{} is not tracked", root.display()),
            });
        };
        self.watcher
            .lock()
            .unwrap()
            .unwatch(&root)
            .map_err(|e| Error::State {
                reason: format!("cannot unwatch {}: {}", root.display(), e),
            })?;
        info!(root = %root.display(), registration = %registration_id, "tracking disabled");
        Ok(())
    }

    /// Currently tracked roots.
    pub fn monitored_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.registrations.lock().unwrap().keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Dirty paths under `root` whose most recent event is strictly newer
    /// than `since_ms`, sorted.
    pub fn changed_files<P: AsRef<Path>>(&self, root: P, since_ms: i64) -> Vec<PathBuf> {
        let root = root.as_ref();
        let dirty = self.shared.dirty.lock().unwrap();
        let mut changed: Vec<PathBuf> = dirty
            .iter()
            .filter(|(path, &t)| t > since_ms && path.starts_with(root))
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        changed
    }

    /// Compact the journal and drop in-memory entries older than
    /// `cutoff_ms`.
    pub fn cleanup_before(&self, cutoff_ms: i64) -> Result<()> {
        self.shared.journal.compact(cutoff_ms)?;
        let mut dirty = self.shared.dirty.lock().unwrap();
        dirty.retain(|_, &mut t| t >= cutoff_ms);
        self.shared
            .bitmaps
            .lock()
            .unwrap()
            .retain(|path, _| dirty.contains_key(path));
        Ok(())
    }

    /// Record a modification to a specific byte range of `path`.
    ///
    /// Used by callers that know which bytes changed; the watcher only
    /// ever reports whole files. The bitmap is rebuilt when the file size
    /// changed since it was last seen.
    pub fn note_change_range(
        &self,
        path: PathBuf,
        file_size: u64,
        offset: u64,
        len: u64,
        timestamp_ms: i64,
    ) -> Result<()> {
        {
            let mut bitmaps = self.shared.bitmaps.lock().unwrap();
            let bitmap = bitmaps
                .entry(path.clone())
                .or_insert_with(|| BlockBitmap::new(file_size));
            if bitmap.file_size() != file_size {
                *bitmap = BlockBitmap::new(file_size);
            }
            bitmap.mark_range(offset, len)?;
        }
        self.shared.record_dirty(&ChangeEvent {
            kind: ChangeKind::Modified,
            path,
            timestamp_ms,
            registration_id: None,
        });
        Ok(())
    }

    /// The dirty-block bitmap accumulated for `path`, if any.
    pub fn dirty_blocks(&self, path: &Path) -> Option<BlockBitmap> {
        self.shared.bitmaps.lock().unwrap().get(path).cloned()
    }

    /// Inject one change event, bypassing the OS watcher.
    ///
    /// Used by tests and by callers that learn about changes out of band.
    pub fn note_change(&self, kind: ChangeKind, path: PathBuf, timestamp_ms: i64) {
        self.shared.apply(&ChangeEvent {
            kind,
            path,
            timestamp_ms,
            registration_id: None,
        });
    }
}

impl Drop for CbtService {
    fn drop(&mut self) {
        let _ = self.raw_tx.send(RawEvent::Shutdown);
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_dispatcher(
    shared: Arc<Shared>,
    options: CbtOptions,
    rx: Receiver<RawEvent>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("cbt-dispatch".to_string())
        .spawn(move || {
            let debounce = Duration::from_millis(options.debounce_timeout_ms);
            let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();

            loop {
                let received = if pending.is_empty() {
                    rx.recv().map_err(|_| ())
                } else {
                    match rx.recv_timeout(debounce) {
                        Ok(raw) => Ok(raw),
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            flush_expired(&shared, &mut pending, debounce);
                            continue;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => Err(()),
                    }
                };

                match received {
                    Ok(RawEvent::Change {
                        kind,
                        path,
                        registration_id,
                    }) => {
                        let timestamp_ms = now_ms();
                        if !options.event_debouncing_enabled {
                            shared.apply(&ChangeEvent {
                                kind,
                                path,
                                timestamp_ms,
                                registration_id,
                            });
                            continue;
                        }
                        pending
                            .entry(path)
                            .and_modify(|p| {
                                // A burst collapses to one modification;
                                // a deletion is never coalesced away.
                                p.kind = if p.kind == ChangeKind::Deleted || kind == ChangeKind::Deleted
                                {
                                    ChangeKind::Deleted
                                } else {
                                    ChangeKind::Modified
                                };
                                p.timestamp_ms = timestamp_ms;
                                p.event_count += 1;
                            })
                            .or_insert(PendingChange {
                                kind,
                                first_seen: Instant::now(),
                                timestamp_ms,
                                registration_id,
                                event_count: 1,
                            });
                        flush_expired(&shared, &mut pending, debounce);
                    }
                    Ok(RawEvent::Shutdown) | Err(()) => {
                        for (path, p) in pending.drain() {
                            apply_pending(&shared, path, p);
                        }
                        return;
                    }
                }
            }
        })
        .expect("spawn cbt dispatcher")
}

fn flush_expired(
    shared: &Shared,
    pending: &mut HashMap<PathBuf, PendingChange>,
    debounce: Duration,
) {
    let now = Instant::now();
    let expired: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, p)| now.duration_since(p.first_seen) >= debounce)
        .map(|(path, _)| path.clone())
        .collect();
    for path in expired {
        if let Some(p) = pending.remove(&path) {
            apply_pending(shared, path, p);
        }
    }
}

fn apply_pending(shared: &Shared, path: PathBuf, p: PendingChange) {
    debug!(path = %path.display(), events = p.event_count, "flushing debounced change");
    shared.apply(&ChangeEvent {
        kind: p.kind,
        path,
        timestamp_ms: p.timestamp_ms,
        registration_id: p.registration_id,
    });
}

fn map_event_kind(kind: &notify::EventKind) -> Option<ChangeKind> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| Error::io_at(path, e))
}
