//! # Quarantine Module
//!
//! A flat directory of objects a stage could not or would not handle.
//!
//! Nothing in a quarantine is ever processed automatically. Files leave it
//! only when an operator deletes them, requeues them into a queue, or runs
//! an explicit purge.

use crate::core::object::FileObject;
use crate::core::queue::{embedded_name_of, move_file, reserve_path, QueueManager};
use crate::error::QuarantineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const QUARANTINE_PREFIX: &str = "Q-";

/// A file held in quarantine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedFile {
    /// Name within the quarantine directory
    pub name: String,
    /// Original name carried in brackets
    pub embedded_name: String,
    /// Full path
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// When the file entered quarantine
    pub quarantined_at: DateTime<Utc>,
}

/// A flat quarantine directory
#[derive(Debug)]
pub struct Quarantine {
    dir: PathBuf,
    /// Serialises inserts and bulk operations
    guard: Mutex<()>,
}

impl Quarantine {
    /// Open (or create) a quarantine directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, QuarantineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| QuarantineError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            guard: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of files in quarantine
    pub fn size(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Move an object into quarantine; the object follows its file.
    pub fn insert(&self, object: &mut FileObject) -> Result<PathBuf, QuarantineError> {
        let _guard = self.lock();
        let target = self.reserve(object.file())?;
        move_file(object.file(), &target).map_err(|source| QuarantineError::Insert {
            path: object.file().to_path_buf(),
            source,
        })?;
        object.set_file(&target);
        stamp(&target);
        warn!(
            quarantine = %self.dir.display(),
            name = %object.embedded_name(),
            "Object quarantined"
        );
        Ok(target)
    }

    /// Move a plain file into quarantine.
    pub fn insert_file(&self, file: &Path) -> Result<PathBuf, QuarantineError> {
        let _guard = self.lock();
        let target = self.reserve(file)?;
        move_file(file, &target).map_err(|source| QuarantineError::Insert {
            path: file.to_path_buf(),
            source,
        })?;
        stamp(&target);
        warn!(quarantine = %self.dir.display(), file = %file.display(), "File quarantined");
        Ok(target)
    }

    /// Copy an object into quarantine, leaving the original in place.
    pub fn insert_copy(&self, object: &FileObject) -> Result<PathBuf, QuarantineError> {
        let _guard = self.lock();
        let target = self.reserve(object.file())?;
        if let Err(source) = fs::copy(object.file(), &target) {
            let _ = fs::remove_file(&target);
            return Err(QuarantineError::Insert {
                path: object.file().to_path_buf(),
                source,
            });
        }
        stamp(&target);
        debug!(quarantine = %self.dir.display(), name = %object.embedded_name(), "Object copied to quarantine");
        Ok(target)
    }

    /// Quarantined files, oldest first.
    ///
    /// A file's age is its modification time, which every insert resets.
    pub fn files(&self) -> Result<Vec<QuarantinedFile>, QuarantineError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| QuarantineError::ReadDirectory {
            path: self.dir.clone(),
            source,
        })?;

        let mut files: Vec<QuarantinedFile> = entries
            .flatten()
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                if !metadata.is_file() {
                    return None;
                }
                let path = entry.path();
                Some(QuarantinedFile {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    embedded_name: embedded_name_of(&path),
                    size: metadata.len(),
                    quarantined_at: metadata
                        .modified()
                        .unwrap_or(SystemTime::UNIX_EPOCH)
                        .into(),
                    path,
                })
            })
            .collect();

        files.sort_by(|a, b| {
            a.quarantined_at
                .cmp(&b.quarantined_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(files)
    }

    /// Quarantined files no older than `max_age`, for display.
    pub fn files_newer_than(&self, max_age: Duration) -> Result<Vec<QuarantinedFile>, QuarantineError> {
        let cutoff = cutoff(max_age);
        Ok(self
            .files()?
            .into_iter()
            .filter(|f| f.quarantined_at >= cutoff)
            .collect())
    }

    /// Delete one quarantined file by name.
    pub fn delete_file(&self, name: &str) -> Result<(), QuarantineError> {
        let _guard = self.lock();
        let path = self.entry(name)?;
        fs::remove_file(&path).map_err(|source| QuarantineError::Delete { path, source })
    }

    /// Delete every quarantined file; returns how many were removed.
    pub fn delete_all(&self) -> Result<usize, QuarantineError> {
        let files = self.files()?;
        let _guard = self.lock();
        let mut deleted = 0;
        for file in files {
            match fs::remove_file(&file.path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(file = %file.path.display(), error = %e, "Quarantined file not deleted"),
            }
        }
        info!(quarantine = %self.dir.display(), deleted, "Quarantine emptied");
        Ok(deleted)
    }

    /// Requeue one quarantined file, then delete the quarantine copy.
    pub fn queue_file(&self, name: &str, queue: &QueueManager) -> Result<PathBuf, QuarantineError> {
        let _guard = self.lock();
        let path = self.entry(name)?;
        let stored = queue.enqueue(&path)?;
        fs::remove_file(&path).map_err(|source| QuarantineError::Delete { path, source })?;
        Ok(stored)
    }

    /// Requeue every quarantined file; returns how many were queued.
    ///
    /// A file that cannot be queued stays in quarantine.
    pub fn queue_all(&self, queue: &QueueManager) -> Result<usize, QuarantineError> {
        let files = self.files()?;
        let _guard = self.lock();
        let mut queued = 0;
        for file in files {
            match queue.enqueue(&file.path) {
                Ok(_) => {
                    if let Err(e) = fs::remove_file(&file.path) {
                        warn!(file = %file.path.display(), error = %e, "Requeued file left in quarantine");
                    }
                    queued += 1;
                }
                Err(e) => warn!(file = %file.path.display(), error = %e, "Requeue failed"),
            }
        }
        info!(quarantine = %self.dir.display(), queued, "Quarantine requeued");
        Ok(queued)
    }

    /// Delete files that have been quarantined longer than `age`.
    ///
    /// This is never run automatically; callers schedule it.
    pub fn purge_older_than(&self, age: Duration) -> Result<usize, QuarantineError> {
        let cutoff = cutoff(age);
        let files = self.files()?;
        let _guard = self.lock();
        let mut purged = 0;
        for file in files.into_iter().filter(|f| f.quarantined_at < cutoff) {
            if fs::remove_file(&file.path).is_ok() {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(quarantine = %self.dir.display(), purged, "Quarantine purged");
        }
        Ok(purged)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn reserve(&self, file: &Path) -> Result<PathBuf, QuarantineError> {
        reserve_path(&self.dir, QUARANTINE_PREFIX, &embedded_name_of(file)).map_err(|source| {
            QuarantineError::Insert {
                path: file.to_path_buf(),
                source,
            }
        })
    }

    /// Resolve a name to a file inside the quarantine directory.
    fn entry(&self, name: &str) -> Result<PathBuf, QuarantineError> {
        let plain = Path::new(name)
            .file_name()
            .map(|n| n == std::ffi::OsStr::new(name))
            .unwrap_or(false);
        let path = self.dir.join(name);
        if !plain || !path.is_file() {
            return Err(QuarantineError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(path)
    }
}

/// Moves and copies keep the source's modification time; quarantine ages
/// count from the insert.
fn stamp(path: &Path) {
    let stamped = fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = stamped {
        warn!(file = %path.display(), error = %e, "Quarantine time not recorded");
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn object(dir: &Path, name: &str, content: &[u8]) -> FileObject {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        FileObject::open(path).unwrap()
    }

    #[test]
    fn insert_moves_object_and_updates_location() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        let mut obj = object(temp.path(), "QF-1[bad.dcm]", b"bad");
        let original = obj.file().to_path_buf();

        let stored = quarantine.insert(&mut obj).unwrap();

        assert!(!original.exists());
        assert_eq!(obj.file(), stored.as_path());
        assert_eq!(obj.embedded_name(), "bad.dcm");
        assert_eq!(quarantine.size(), 1);
    }

    #[test]
    fn insert_copy_leaves_original() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        let obj = object(temp.path(), "keep.xml", b"<a/>");

        quarantine.insert_copy(&obj).unwrap();

        assert!(obj.file().exists());
        assert_eq!(quarantine.size(), 1);
    }

    #[test]
    fn queue_all_requeues_and_empties() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        let queue = QueueManager::with_defaults(temp.path().join("queue")).unwrap();
        for name in ["a.dcm", "b.dcm"] {
            let mut obj = object(temp.path(), name, name.as_bytes());
            quarantine.insert(&mut obj).unwrap();
        }

        let queued = quarantine.queue_all(&queue).unwrap();

        assert_eq!(queued, 2);
        assert_eq!(queue.size(), 2);
        assert_eq!(quarantine.size(), 0);
    }

    #[test]
    fn queue_file_requeues_one() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        let queue = QueueManager::with_defaults(temp.path().join("queue")).unwrap();
        let mut obj = object(temp.path(), "one.dcm", b"1");
        quarantine.insert(&mut obj).unwrap();

        let stored = quarantine.queue_file(&obj.name(), &queue).unwrap();

        assert_eq!(embedded_name_of(&stored), "one.dcm");
        assert_eq!(quarantine.size(), 0);
    }

    #[test]
    fn unknown_or_escaping_names_are_rejected() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        fs::write(temp.path().join("outside.txt"), b"x").unwrap();

        assert!(matches!(
            quarantine.delete_file("missing"),
            Err(QuarantineError::NotFound { .. })
        ));
        assert!(matches!(
            quarantine.delete_file("../outside.txt"),
            Err(QuarantineError::NotFound { .. })
        ));
        assert!(temp.path().join("outside.txt").exists());
    }

    fn backdate(path: &Path, age: Duration) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[test]
    fn age_counts_from_insert_not_from_last_write() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        let two_days = Duration::from_secs(2 * 24 * 3600);
        let hour = Duration::from_secs(3600);

        let mut moved = object(temp.path(), "old.dcm", b"old");
        backdate(moved.file(), two_days);
        quarantine.insert(&mut moved).unwrap();

        let plain = temp.path().join("stale.xml");
        fs::write(&plain, b"<a/>").unwrap();
        backdate(&plain, two_days);
        quarantine.insert_file(&plain).unwrap();

        let copied = object(temp.path(), "kept.dcm", b"kept");
        backdate(copied.file(), two_days);
        quarantine.insert_copy(&copied).unwrap();

        assert_eq!(quarantine.files_newer_than(hour).unwrap().len(), 3);
        assert_eq!(quarantine.purge_older_than(hour).unwrap(), 0);
        assert_eq!(quarantine.size(), 3);
    }

    #[test]
    fn purge_removes_only_old_entries() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        let mut old = object(temp.path(), "old.dcm", b"old");
        let mut new = object(temp.path(), "new.dcm", b"new");
        let old_path = quarantine.insert(&mut old).unwrap();
        quarantine.insert(&mut new).unwrap();
        backdate(&old_path, Duration::from_secs(7200));

        assert_eq!(quarantine.purge_older_than(Duration::from_secs(3600)).unwrap(), 1);

        let left = quarantine.files().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].embedded_name, "new.dcm");
    }

    #[test]
    fn listing_and_age_filters() {
        let temp = TempDir::new().unwrap();
        let quarantine = Quarantine::open(temp.path().join("quarantine")).unwrap();
        let mut obj = object(temp.path(), "recent.dcm", b"r");
        quarantine.insert(&mut obj).unwrap();

        let files = quarantine.files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].embedded_name, "recent.dcm");

        assert_eq!(
            quarantine
                .files_newer_than(Duration::from_secs(3600))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            quarantine.purge_older_than(Duration::from_secs(3600)).unwrap(),
            0
        );
        assert_eq!(quarantine.delete_all().unwrap(), 1);
        assert_eq!(quarantine.size(), 0);
    }
}
