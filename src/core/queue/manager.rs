//! Sharded on-disk queue implementation.

use super::naming::{bracketed, embedded_name, move_file, reserve_path};
use crate::error::QueueError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Default (and minimum) tree depth
pub const DEFAULT_LEVELS: usize = 3;
/// Default (and minimum) number of entries per directory
pub const DEFAULT_MAX_SIZE: u64 = 200;

const TOP_LEVEL_WIDTH: usize = 10;
const DEQUEUE_PREFIX: &str = "QF-";

/// A durable FIFO-ish queue stored as a balanced directory tree.
///
/// Files live at the deepest level only:
/// `root/L0/L1/.../<position>[embedded-name]`. The top level is padded to
/// 10 digits, every other level to the width of `max_size`. All public
/// methods are mutually exclusive on one instance.
#[derive(Debug)]
pub struct QueueManager {
    root: PathBuf,
    levels: usize,
    max_size: u64,
    width: usize,
    state: Mutex<QueueState>,
}

#[derive(Debug)]
struct QueueState {
    /// Cached number of files in the tree
    size: usize,
    /// Position the next enqueued file is written to
    next: Vec<u64>,
    /// Directory the last file was dequeued from
    active_dir: Option<PathBuf>,
}

impl QueueManager {
    /// Open (or create) a queue rooted at `root`.
    ///
    /// `levels` is raised to at least 3 and `max_size` to at least 200. The
    /// size is re-derived by counting files and the write position by
    /// walking to the last file written.
    pub fn new(root: impl Into<PathBuf>, levels: usize, max_size: u64) -> Result<Self, QueueError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| QueueError::CreateDirectory {
            path: root.clone(),
            source,
        })?;

        let levels = levels.max(DEFAULT_LEVELS);
        let max_size = max_size.max(DEFAULT_MAX_SIZE);
        let mut manager = Self {
            width: max_size.to_string().len(),
            root,
            levels,
            max_size,
            state: Mutex::new(QueueState {
                size: 0,
                next: vec![0; levels],
                active_dir: None,
            }),
        };

        let next = manager.locate_next()?;
        let size = count_files(&manager.root);
        {
            let state = manager.state.get_mut().unwrap_or_else(PoisonError::into_inner);
            state.next = next;
            state.size = size;
        }

        debug!(root = %manager.root.display(), size, "Opened queue");
        Ok(manager)
    }

    /// Open a queue with the default depth and fan-out.
    pub fn with_defaults(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        Self::new(root, DEFAULT_LEVELS, DEFAULT_MAX_SIZE)
    }

    /// Root directory of the tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tree depth
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Maximum entries per directory
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Cached number of queued files
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Whether the cached size is zero
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Copy `file` into the queue.
    ///
    /// The stored name keeps the file's embedded name (or its full name).
    /// The caller still owns, and must delete, the original. On failure
    /// nothing is left behind and the size is unchanged.
    pub fn enqueue(&self, file: &Path) -> Result<PathBuf, QueueError> {
        if !file.is_file() {
            return Err(QueueError::NotAFile {
                path: file.to_path_buf(),
            });
        }

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let embedded = embedded_name(&name, true);

        let mut state = self.lock();
        let mut destination = self.path_for(&state.next, &embedded);
        // Positions can be taken by files placed by hand
        while destination.exists() {
            self.increment(&mut state.next);
            destination = self.path_for(&state.next, &embedded);
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|source| QueueError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if let Err(source) = fs::copy(file, &destination) {
            let _ = fs::remove_file(&destination);
            warn!(file = %file.display(), error = %source, "Enqueue failed");
            return Err(QueueError::Copy {
                from: file.to_path_buf(),
                to: destination,
                source,
            });
        }

        self.increment(&mut state.next);
        state.size += 1;
        Ok(destination)
    }

    /// Enqueue every file under `dir` and delete the originals.
    ///
    /// Used to sweep stray files (e.g. an `active` directory after a crash)
    /// back into the queue. Returns the number of files queued; files that
    /// fail to queue are left in place.
    pub fn enqueue_dir(&self, dir: &Path) -> Result<usize, QueueError> {
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut queued = 0;
        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| QueueError::ReadDirectory {
                path: dir.to_path_buf(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            match self.enqueue(entry.path()) {
                Ok(_) => {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!(file = %entry.path().display(), error = %e, "Queued file could not be removed");
                    }
                    queued += 1;
                }
                Err(e) => warn!(error = %e, "Stray file left in place"),
            }
        }
        Ok(queued)
    }

    /// Move the next queued file into `destination`.
    ///
    /// Returns `Ok(None)` when the queue is empty or `destination` exists
    /// but is not a directory. The moved file gets a fresh temp-style name
    /// that keeps its embedded name. The file is out of the tree before
    /// this returns.
    pub fn dequeue(&self, destination: &Path) -> Result<Option<PathBuf>, QueueError> {
        if destination.exists() && !destination.is_dir() {
            return Ok(None);
        }
        fs::create_dir_all(destination).map_err(|source| QueueError::CreateDirectory {
            path: destination.to_path_buf(),
            source,
        })?;

        let mut state = self.lock();
        let source = match self.next_candidate(&mut state)? {
            Some(source) => source,
            None => {
                self.reset(&mut state);
                return Ok(None);
            }
        };

        let embedded = source
            .file_name()
            .map(|n| embedded_name(&n.to_string_lossy(), true))
            .unwrap_or_default();
        let target =
            reserve_path(destination, DEQUEUE_PREFIX, &embedded).map_err(|source_err| {
                QueueError::Move {
                    from: source.clone(),
                    to: destination.to_path_buf(),
                    source: source_err,
                }
            })?;

        if let Err(e) = move_file(&source, &target) {
            return Err(QueueError::Move {
                from: source,
                to: target,
                source: e,
            });
        }

        // The file is already out of the tree; the walk only decides
        // whether positions restart, so its errors are not the caller's.
        state.size = state.size.saturating_sub(1);
        if state.size == 0 && matches!(first_occupied_dir(&self.root), Ok(None)) {
            self.reset(&mut state);
        }
        Ok(Some(target))
    }

    /// Count the files in the tree and reset the cached size.
    pub fn recount(&self) -> usize {
        let mut state = self.lock();
        let counted = count_files(&self.root);
        if counted != state.size {
            debug!(root = %self.root.display(), cached = state.size, counted, "Queue recounted");
        }
        state.size = counted;
        counted
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the file to hand out next, preferring the cursor directory.
    fn next_candidate(&self, state: &mut QueueState) -> Result<Option<PathBuf>, QueueError> {
        if let Some(dir) = &state.active_dir {
            if let Some(file) = first_file(dir)? {
                return Ok(Some(file));
            }
        }

        state.active_dir = None;
        match first_occupied_dir(&self.root)? {
            Some(dir) => {
                let file = first_file(&dir)?;
                state.active_dir = Some(dir);
                Ok(file)
            }
            None => Ok(None),
        }
    }

    fn reset(&self, state: &mut QueueState) {
        state.size = 0;
        state.next = vec![0; self.levels];
        state.active_dir = None;
    }

    fn component_name(&self, level: usize, value: u64) -> String {
        if level == 0 {
            format!("{:0width$}", value, width = TOP_LEVEL_WIDTH)
        } else {
            format!("{:0width$}", value, width = self.width)
        }
    }

    fn path_for(&self, position: &[u64], embedded: &str) -> PathBuf {
        let mut path = self.root.clone();
        let last = position.len() - 1;
        for (level, value) in position.iter().enumerate() {
            if level == last {
                path.push(format!(
                    "{}{}",
                    self.component_name(level, *value),
                    bracketed(embedded)
                ));
            } else {
                path.push(self.component_name(level, *value));
            }
        }
        path
    }

    /// Advance a position by one, carrying from the deepest level upward.
    fn increment(&self, position: &mut [u64]) {
        for level in (1..position.len()).rev() {
            position[level] += 1;
            if position[level] < self.max_size {
                return;
            }
            position[level] = 0;
        }
        position[0] += 1;
    }

    /// Walk down the highest-numbered entries to find where to write next.
    fn locate_next(&self) -> Result<Vec<u64>, QueueError> {
        let mut position = Vec::with_capacity(self.levels);
        let mut dir = self.root.clone();

        for level in 0..self.levels {
            let want_dirs = level + 1 < self.levels;
            match max_numeric_entry(&dir, want_dirs)? {
                Some((value, path)) => {
                    position.push(value);
                    dir = path;
                }
                None if level == 0 => return Ok(vec![0; self.levels]),
                None => {
                    position.resize(self.levels, 0);
                    return Ok(position);
                }
            }
        }

        self.increment(&mut position);
        Ok(position)
    }
}

/// Numeric value of a queue entry name, ignoring any bracketed suffix.
fn numeric_prefix(name: &str) -> Option<u64> {
    let digits = name.split('[').next().unwrap_or_default();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn read_dir(dir: &Path) -> Result<Option<fs::ReadDir>, QueueError> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Some(entries)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(QueueError::ReadDirectory {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

fn max_numeric_entry(dir: &Path, dirs: bool) -> Result<Option<(u64, PathBuf)>, QueueError> {
    let Some(entries) = read_dir(dir)? else {
        return Ok(None);
    };

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() != dirs || (!dirs && !file_type.is_file()) {
            continue;
        }
        let Some(value) = numeric_prefix(&entry.file_name().to_string_lossy()) else {
            continue;
        };
        if best.as_ref().map_or(true, |(current, _)| value > *current) {
            best = Some((value, entry.path()));
        }
    }
    Ok(best)
}

/// First regular file in `dir` in sorted order.
fn first_file(dir: &Path) -> Result<Option<PathBuf>, QueueError> {
    let Some(entries) = read_dir(dir)? else {
        return Ok(None);
    };

    Ok(entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .min())
}

/// Depth-first, sorted walk for the first directory holding any file.
///
/// Empty subdirectories met on the way are removed; `dir` itself never is.
fn first_occupied_dir(dir: &Path) -> Result<Option<PathBuf>, QueueError> {
    let Some(entries) = read_dir(dir)? else {
        return Ok(None);
    };

    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_file() {
            return Ok(Some(dir.to_path_buf()));
        }
        if file_type.is_dir() {
            subdirs.push(entry.path());
        }
    }

    subdirs.sort();
    for subdir in subdirs {
        if let Some(found) = first_occupied_dir(&subdir)? {
            return Ok(Some(found));
        }
        let _ = fs::remove_dir(&subdir);
    }
    Ok(None)
}

fn count_files(root: &Path) -> usize {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}
