//! Filesystem scanning and fixed-size chunking

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// How symbolic links are treated during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStrategy {
    /// Ignore symlinks entirely
    #[default]
    Skip,
    /// Traverse into link targets; `(device, inode)` pairs are tracked so
    /// cycles terminate
    Follow,
    /// Yield the link itself as an entry without traversing
    Record,
}

/// Scan options; all individually toggleable.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Include dot-files and dot-directories (default off)
    pub include_hidden: bool,
    /// Symlink handling
    pub link_strategy: LinkStrategy,
    /// Maximum directory depth below the root; `None` is unbounded
    pub max_depth: Option<usize>,
    /// When set, only matching paths are yielded
    pub include: Option<GlobSet>,
    /// Matching paths are dropped
    pub exclude: Option<GlobSet>,
}

/// Compile glob pattern strings into a matcher.
pub fn compile_globs(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| Error::InvalidArgument {
            reason: format!("bad glob {:?}: {}", pattern, e),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| Error::InvalidArgument {
        reason: format!("glob set: {}", e),
    })
}

/// What kind of filesystem object an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Symlink,
}

/// One yielded filesystem entry.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Unix permission bits, when the platform exposes them
    pub mode: Option<u32>,
}

/// Lazy directory walker yielding regular files (and, with
/// [`LinkStrategy::Record`], symlinks).
///
/// Per-entry errors are yielded in-stream as `Err` items; the walk
/// continues past them. No path is yielded twice within one scan.
#[derive(Debug)]
pub struct Scanner {
    options: ScanOptions,
}

impl Scanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Walk `root`, yielding entries lazily.
    pub fn scan<P: AsRef<Path>>(&self, root: P) -> ScanIter {
        let root = root.as_ref().to_path_buf();
        let mut walker = WalkDir::new(&root)
            .follow_links(self.options.link_strategy == LinkStrategy::Follow)
            .sort_by_file_name();
        if let Some(depth) = self.options.max_depth {
            walker = walker.max_depth(depth);
        }
        ScanIter {
            root,
            options: self.options.clone(),
            inner: walker.into_iter(),
            seen: HashSet::new(),
        }
    }
}

/// Iterator produced by [`Scanner::scan`].
pub struct ScanIter {
    root: PathBuf,
    options: ScanOptions,
    inner: walkdir::IntoIter,
    seen: HashSet<(u64, u64)>,
}

impl Iterator for ScanIter {
    type Item = Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                // The per-entry error channel: surfaced, never fatal.
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf);
                    let err = match (path, e.into_io_error()) {
                        (Some(p), Some(io)) => Error::io_at(p, io),
                        (None, Some(io)) => Error::Io(io),
                        (p, None) => Error::InvalidArgument {
                            reason: format!(
                                "filesystem loop or walk error at {:?}",
                                p.unwrap_or_default()
                            ),
                        },
                    };
                    return Some(Err(err));
                }
            };

            let path = entry.path();
            let hidden = !self.options.include_hidden && is_hidden(path, &self.root);

            if entry.file_type().is_dir() {
                if hidden && entry.depth() > 0 {
                    self.inner.skip_current_dir();
                }
                continue;
            }
            if hidden {
                continue;
            }

            let is_symlink = entry.path_is_symlink();
            match self.options.link_strategy {
                LinkStrategy::Skip if is_symlink => continue,
                LinkStrategy::Record if is_symlink => {
                    return Some(self.make_entry(path, EntryKind::Symlink));
                }
                _ => {}
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if !self.matches_patterns(path) {
                continue;
            }
            if self.options.link_strategy == LinkStrategy::Follow {
                match file_identity(path) {
                    Ok(Some(identity)) => {
                        if !self.seen.insert(identity) {
                            continue;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                }
            }
            return Some(self.make_entry(path, EntryKind::File));
        }
    }
}

impl ScanIter {
    fn matches_patterns(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if let Some(include) = &self.options.include {
            if !include.is_match(relative) {
                return false;
            }
        }
        if let Some(exclude) = &self.options.exclude {
            if exclude.is_match(relative) {
                return false;
            }
        }
        true
    }

    fn make_entry(&self, path: &Path, kind: EntryKind) -> Result<ScanEntry> {
        let metadata = match kind {
            EntryKind::File => path.metadata(),
            EntryKind::Symlink => path.symlink_metadata(),
        }
        .map_err(|e| Error::io_at(path, e))?;

        let modified = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            Some(metadata.mode())
        };
        #[cfg(not(unix))]
        let mode = None;

        Ok(ScanEntry {
            path: path.to_path_buf(),
            kind,
            size: metadata.len(),
            modified,
            mode,
        })
    }
}

fn is_hidden(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root)
        .map(|relative| {
            relative.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .is_some_and(|name| name.starts_with('.'))
            })
        })
        .unwrap_or(false)
}

#[cfg(unix)]
fn file_identity(path: &Path) -> Result<Option<(u64, u64)>> {
    use std::os::unix::fs::MetadataExt;
    let metadata = path.metadata().map_err(|e| Error::io_at(path, e))?;
    Ok(Some((metadata.dev(), metadata.ino())))
}

#[cfg(not(unix))]
fn file_identity(_path: &Path) -> Result<Option<(u64, u64)>> {
    Ok(None)
}

/// Streaming fixed-size chunker.
///
/// Yields blocks of exactly `chunk_size` bytes, the last possibly shorter,
/// without ever buffering the whole file.
pub struct Chunker {
    reader: BufReader<File>,
    chunk_size: usize,
    path: PathBuf,
    done: bool,
}

impl Chunker {
    pub fn new<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument {
                reason: "chunk_size must be non-zero".to_string(),
            });
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io_at(&path, e))?;
        Ok(Self {
            reader: BufReader::new(file),
            chunk_size,
            path,
            done: false,
        })
    }
}

impl Iterator for Chunker {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(Error::io_at(&self.path, e)));
                }
            }
        }
        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < self.chunk_size {
            buf.truncate(filled);
            self.done = true;
        }
        Some(Ok(buf))
    }
}
