//! Import files dropped into a watched directory.

use super::{Capability, ImportQueue, ImportService, PipelineStage, StageCore};
use crate::core::object::FileObject;
use crate::core::queue::{move_file, reserve_path};
use crate::error::StageError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Files younger than this are assumed to still be in the middle of being written
pub const DEFAULT_MIN_AGE: Duration = Duration::from_millis(5000);
/// Rescan interval when the watcher reports nothing
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// Watches an import directory and queues files once they settle.
///
/// A filesystem watcher wakes the scanner as soon as something changes;
/// a periodic rescan covers platforms and mounts where events are lost.
pub struct DirectoryImportService {
    core: StageCore,
    queue: Arc<ImportQueue>,
    import_dir: PathBuf,
    min_age: Duration,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    watcher: Option<RecommendedWatcher>,
    worker: Option<JoinHandle<()>>,
}

impl DirectoryImportService {
    pub fn new(core: StageCore, import_dir: impl Into<PathBuf>) -> Result<Self, StageError> {
        let queue = Arc::new(ImportQueue::open(&core)?);
        Ok(Self {
            core,
            queue,
            import_dir: import_dir.into(),
            min_age: DEFAULT_MIN_AGE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop: Arc::new(AtomicBool::new(false)),
            wake: None,
            watcher: None,
            worker: None,
        })
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn import_dir(&self) -> &Path {
        &self.import_dir
    }

    /// Queue every settled file in the import directory once.
    pub fn scan(&self) -> usize {
        scan_directory(&self.import_dir, self.min_age, &self.queue)
    }

    fn watch(&self, wake: Sender<()>) -> Option<RecommendedWatcher> {
        let stage = self.core.name().to_string();
        let handler = move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    let _ = wake.try_send(());
                }
            }
            Err(e) => warn!(stage = %stage, error = %e, "Import watcher error"),
        };

        let mut watcher = match notify::recommended_watcher(handler) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(stage = %self.core.name(), error = %e, "Watcher unavailable; polling only");
                return None;
            }
        };
        if let Err(e) = watcher.watch(&self.import_dir, RecursiveMode::Recursive) {
            warn!(stage = %self.core.name(), error = %e, "Watcher unavailable; polling only");
            return None;
        }
        Some(watcher)
    }
}

/// Move settled files from `dir` into the import queue; returns how many
/// were queued.
fn scan_directory(dir: &Path, min_age: Duration, queue: &ImportQueue) -> usize {
    let now = SystemTime::now();
    let mut queued = 0;

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e.path()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let settled = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= min_age);
        if !settled {
            continue;
        }

        match claim(entry.path(), queue) {
            Ok(()) => queued += 1,
            Err(e) => warn!(file = %entry.path().display(), error = %e, "Failed to import file"),
        }
    }
    queued
}

/// Move a file out of the import directory before queueing it, so a file
/// is never queued twice.
fn claim(file: &Path, queue: &ImportQueue) -> Result<(), StageError> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let io_error = |source| StageError::Io {
        stage: queue.stage().to_string(),
        source,
    };
    let claimed = reserve_path(queue.temp_dir(), "IN-", &name).map_err(io_error)?;
    move_file(file, &claimed).map_err(io_error)?;
    queue.file_received(&claimed)?;
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

impl PipelineStage for DirectoryImportService {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Receiver]
    }

    fn receiver(&self) -> Option<Arc<ImportQueue>> {
        Some(self.queue.clone())
    }

    fn start(&mut self) -> Result<(), StageError> {
        std::fs::create_dir_all(&self.import_dir).map_err(|source| StageError::Start {
            stage: self.core.name().to_string(),
            reason: format!("cannot create {}: {}", self.import_dir.display(), source),
        })?;

        // Files claimed but not queued before a crash
        let recovered = self.queue.queue().enqueue_dir(self.queue.temp_dir())?;
        if recovered > 0 {
            info!(stage = %self.core.name(), recovered, "Requeued claimed files");
        }

        let (wake_tx, wake_rx) = bounded(1);
        self.watcher = self.watch(wake_tx.clone());

        let dir = self.import_dir.clone();
        let min_age = self.min_age;
        let poll = self.poll_interval;
        let queue = self.queue.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(format!("import-{}", self.core.id()))
            .spawn(move || poll_loop(&dir, min_age, poll, &queue, &stop, &wake_rx))
            .map_err(|source| StageError::Io {
                stage: self.core.name().to_string(),
                source,
            })?;

        self.wake = Some(wake_tx);
        self.worker = Some(handle);
        info!(stage = %self.core.name(), dir = %self.import_dir.display(), "Watching import directory");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.watcher = None;
        if let Some(wake) = self.wake.take() {
            let _ = wake.try_send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.core.monitor().set_down();
    }
}

fn poll_loop(
    dir: &Path,
    min_age: Duration,
    poll: Duration,
    queue: &ImportQueue,
    stop: &AtomicBool,
    wake: &Receiver<()>,
) {
    while !stop.load(Ordering::SeqCst) {
        let queued = scan_directory(dir, min_age, queue);
        if queued > 0 {
            debug!(dir = %dir.display(), queued, "Import scan queued files");
        }

        // Files reported by the watcher may still be too young; look again
        // once they have had time to settle.
        let wait = if dir_has_files(dir) {
            poll.min(min_age.max(Duration::from_millis(100)))
        } else {
            poll
        };
        match wake.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn dir_has_files(dir: &Path) -> bool {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file())
}

impl ImportService for DirectoryImportService {
    fn next_object(&mut self) -> Result<Option<FileObject>, StageError> {
        self.queue.next_object()
    }

    fn release(&mut self, file: &Path) {
        self.queue.release(file);
    }
}

impl Drop for DirectoryImportService {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::{StageKind, StageSettings};
    use std::fs;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> DirectoryImportService {
        let core = StageCore::new(
            StageSettings::new("import", dir.path().join("stage")),
            StageKind::Import,
        )
        .unwrap();
        DirectoryImportService::new(core, dir.path().join("incoming"))
            .unwrap()
            .with_min_age(Duration::ZERO)
    }

    #[test]
    fn scan_queues_settled_files_and_empties_the_directory() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        fs::create_dir_all(dir.path().join("incoming/sub")).unwrap();
        fs::write(dir.path().join("incoming/a.dcm"), b"a").unwrap();
        fs::write(dir.path().join("incoming/sub/b.dcm"), b"b").unwrap();

        assert_eq!(service.scan(), 2);

        assert_eq!(service.queue.size(), 2);
        assert!(!dir.path().join("incoming/a.dcm").exists());
        assert!(!dir.path().join("incoming/sub/b.dcm").exists());
    }

    #[test]
    fn young_and_hidden_files_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).with_min_age(Duration::from_secs(3600));
        fs::create_dir_all(dir.path().join("incoming")).unwrap();
        fs::write(dir.path().join("incoming/new.dcm"), b"a").unwrap();

        assert_eq!(service.scan(), 0);
        assert!(dir.path().join("incoming/new.dcm").exists());

        let service = service.with_min_age(Duration::ZERO);
        fs::write(dir.path().join("incoming/.partial"), b"a").unwrap();
        assert_eq!(service.scan(), 1);
        assert!(dir.path().join("incoming/.partial").exists());
    }

    #[test]
    fn started_service_imports_dropped_files() {
        let dir = TempDir::new().unwrap();
        let mut service = service(&dir).with_poll_interval(Duration::from_millis(200));
        service.start().unwrap();

        fs::write(dir.path().join("incoming/a.txt"), b"hello").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut object = None;
        while object.is_none() && std::time::Instant::now() < deadline {
            object = service.next_object().unwrap();
            thread::sleep(Duration::from_millis(50));
        }
        service.shutdown();

        let object = object.expect("file was not imported");
        assert_eq!(object.embedded_name(), "a.txt");
        assert!(service.is_down());
    }
}
