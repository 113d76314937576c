//! Queue-backed base shared by every import stage.

use super::{AcceptFlags, StageCore, StageMonitor};
use crate::core::object::FileObject;
use crate::core::quarantine::Quarantine;
use crate::core::queue::{QueueManager, DEFAULT_LEVELS, DEFAULT_MAX_SIZE};
use crate::error::StageError;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Number of recent UIDs checked for duplicate deliveries
const RECENT_UIDS: usize = 10;

/// Below this size the cached queue size is re-derived from disk
const RECOUNT_THRESHOLD: usize = 20;

/// The durable side of an import stage.
///
/// Received files are copied into `root/queue` and the source is deleted.
/// The pipeline pulls them one at a time into `root/active`, where each
/// stays until the pipeline releases it. Shared by reference with anything
/// that feeds the stage (watchers, receivers on other threads).
#[derive(Debug)]
pub struct ImportQueue {
    stage: String,
    queue: Arc<QueueManager>,
    active: PathBuf,
    temp: PathBuf,
    accept: AcceptFlags,
    quarantine: Option<Arc<Quarantine>>,
    monitor: Arc<StageMonitor>,
    recent: Mutex<VecDeque<String>>,
}

impl ImportQueue {
    /// Open the stage's queue and move anything left in `active` from a
    /// previous run back into it.
    pub fn open(core: &StageCore) -> Result<Self, StageError> {
        let queue = Arc::new(QueueManager::new(
            core.root().join("queue"),
            DEFAULT_LEVELS,
            DEFAULT_MAX_SIZE,
        )?);
        let active = core.subdirectory("active")?;
        let temp = core.subdirectory("temp")?;

        let recovered = queue.enqueue_dir(&active)?;
        if recovered > 0 {
            info!(stage = %core.name(), recovered, "Requeued files left in the active directory");
        }

        core.monitor().attach_queue(queue.clone());

        Ok(Self {
            stage: core.name().to_string(),
            queue,
            active,
            temp,
            accept: core.accept(),
            quarantine: core.quarantine().cloned(),
            monitor: core.monitor().clone(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_UIDS)),
        })
    }

    /// Queue a copy of `file` and delete the original.
    pub fn file_received(&self, file: &Path) -> Result<PathBuf, StageError> {
        let queued = self.queue.enqueue(file)?;
        if let Err(e) = fs::remove_file(file) {
            warn!(stage = %self.stage, file = %file.display(), error = %e, "Queued file could not be removed");
        }
        self.monitor.file_received();
        debug!(stage = %self.stage, file = %queued.display(), "File queued for import");
        Ok(queued)
    }

    /// The next accepted object, moved into the active directory.
    ///
    /// Objects of a type this stage does not accept are quarantined (or
    /// deleted when there is no quarantine) and the search continues. A
    /// filesystem failure while dequeuing is logged and reads as an empty
    /// queue, so the pipeline idles and tries again.
    pub fn next_object(&self) -> Result<Option<FileObject>, StageError> {
        if self.queue.size() < RECOUNT_THRESHOLD {
            self.queue.recount();
        }
        loop {
            let file = match self.queue.dequeue(&self.active) {
                Ok(Some(file)) => file,
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(stage = %self.stage, error = %e, "Dequeue failed");
                    return Ok(None);
                }
            };

            let object = match FileObject::open(&file) {
                Ok(object) => object,
                Err(e) => {
                    warn!(stage = %self.stage, error = %e, "Dequeued file could not be opened");
                    self.discard_file(&file);
                    continue;
                }
            };

            self.check_duplicate(&object);

            if self.accept.accepts(object.kind()) {
                return Ok(Some(object));
            }

            debug!(
                stage = %self.stage,
                kind = %object.kind(),
                name = %object.embedded_name(),
                "Object type not accepted"
            );
            self.discard_file(object.file());
        }
    }

    /// Delete `file` if it is still in the active directory.
    pub fn release(&self, file: &Path) {
        if file.parent() != Some(self.active.as_path()) {
            return;
        }
        match fs::remove_file(file) {
            Ok(()) => self.monitor.file_processed(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(stage = %self.stage, file = %file.display(), error = %e, "Failed to release file"),
        }
    }

    /// Name of the owning stage
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn active_dir(&self) -> &Path {
        &self.active
    }

    /// Scratch space for files being claimed before they are queued
    pub fn temp_dir(&self) -> &Path {
        &self.temp
    }

    fn check_duplicate(&self, object: &FileObject) {
        let mut recent = self
            .recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let uid = object.uid().to_string();
        if recent.contains(&uid) {
            warn!(stage = %self.stage, uid = %uid, "Duplicate object received");
        }
        if recent.len() == RECENT_UIDS {
            recent.pop_front();
        }
        recent.push_back(uid);
    }

    /// Quarantine an unwanted file, falling back to deleting it. A file
    /// that can be neither stays in the active directory until restart.
    fn discard_file(&self, file: &Path) {
        if let Some(quarantine) = &self.quarantine {
            match quarantine.insert_file(file) {
                Ok(_) => {
                    self.monitor.file_quarantined();
                    return;
                }
                Err(e) => warn!(stage = %self.stage, error = %e, "Quarantine failed; deleting instead"),
            }
        }
        if let Err(e) = fs::remove_file(file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(stage = %self.stage, file = %file.display(), error = %e, "Discarded file left in the active directory");
            }
        }
    }
}
