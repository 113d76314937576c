//! State every stage carries: identity, root, acceptance, monitor.

use super::{Capability, StageKind, StageLink};
use crate::core::object::{FileObject, ObjectKind};
use crate::core::quarantine::Quarantine;
use crate::core::queue::QueueManager;
use crate::error::StageError;
use crate::events::{null_sender, Event, EventSender, ObjectEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// Object types a stage handles
///
/// Objects of a type a stage does not accept are quarantined by import
/// stages and passed through untouched by every other stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptFlags {
    pub dicom: bool,
    pub xml: bool,
    pub zip: bool,
    pub file: bool,
}

impl Default for AcceptFlags {
    fn default() -> Self {
        Self {
            dicom: true,
            xml: true,
            zip: true,
            file: true,
        }
    }
}

impl AcceptFlags {
    pub fn accepts(&self, kind: ObjectKind) -> bool {
        match kind {
            ObjectKind::Dicom => self.dicom,
            ObjectKind::Xml => self.xml,
            ObjectKind::Zip => self.zip,
            ObjectKind::File => self.file,
        }
    }
}

/// Construction parameters shared by all stage types
#[derive(Debug, Clone)]
pub struct StageSettings {
    /// Unique id used for lookup across pipelines
    pub id: String,
    /// Display name
    pub name: String,
    /// Registered type name, e.g. `DirectoryImportService`
    pub stage_type: String,
    /// Directory owned by this stage
    pub root: PathBuf,
    pub accept: AcceptFlags,
    pub quarantine: Option<Arc<Quarantine>>,
}

impl StageSettings {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            stage_type: String::new(),
            root: root.into(),
            accept: AcceptFlags::default(),
            quarantine: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_type(mut self, stage_type: impl Into<String>) -> Self {
        self.stage_type = stage_type.into();
        self
    }

    pub fn with_accept(mut self, accept: AcceptFlags) -> Self {
        self.accept = accept;
        self
    }

    pub fn with_quarantine(mut self, quarantine: Arc<Quarantine>) -> Self {
        self.quarantine = Some(quarantine);
        self
    }
}

/// Snapshot of one stage for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub id: String,
    pub name: String,
    pub stage_type: String,
    pub kind: StageKind,
    pub pipeline: Option<String>,
    pub capabilities: Vec<Capability>,
    pub queue_size: Option<usize>,
    pub quarantine_size: Option<usize>,
    pub received: u64,
    pub processed: u64,
    pub exported: u64,
    pub failed: u64,
    pub retried: u64,
    pub quarantined: u64,
    pub last_file_in: Option<DateTime<Utc>>,
    pub last_file_out: Option<DateTime<Utc>>,
    pub down: bool,
}

/// Counters and liveness of a stage, shared with the threads it spawns
/// and with whoever asks for status.
#[derive(Debug)]
pub struct StageMonitor {
    id: String,
    name: String,
    stage_type: String,
    kind: StageKind,
    pipeline: OnceLock<String>,
    capabilities: OnceLock<Vec<Capability>>,
    queue: OnceLock<Arc<QueueManager>>,
    quarantine: Option<Arc<Quarantine>>,
    received: AtomicU64,
    processed: AtomicU64,
    exported: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    quarantined: AtomicU64,
    last_file_in: Mutex<Option<DateTime<Utc>>>,
    last_file_out: Mutex<Option<DateTime<Utc>>>,
    down: AtomicBool,
}

impl StageMonitor {
    fn new(settings: &StageSettings, kind: StageKind) -> Self {
        Self {
            id: settings.id.clone(),
            name: settings.name.clone(),
            stage_type: settings.stage_type.clone(),
            kind,
            pipeline: OnceLock::new(),
            capabilities: OnceLock::new(),
            queue: OnceLock::new(),
            quarantine: settings.quarantine.clone(),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            exported: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            last_file_in: Mutex::new(None),
            last_file_out: Mutex::new(None),
            down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Report this queue's size in status snapshots.
    pub fn attach_queue(&self, queue: Arc<QueueManager>) {
        let _ = self.queue.set(queue);
    }

    pub(crate) fn set_pipeline(&self, pipeline: &str) {
        let _ = self.pipeline.set(pipeline.to_string());
    }

    pub(crate) fn set_capabilities(&self, capabilities: &[Capability]) {
        let _ = self.capabilities.set(capabilities.to_vec());
    }

    pub fn file_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_file_in) = Some(Utc::now());
    }

    pub fn file_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_file_out) = Some(Utc::now());
    }

    pub fn file_exported(&self) {
        self.exported.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_file_out) = Some(Utc::now());
    }

    pub fn file_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_quarantined(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StageStatus {
        StageStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            stage_type: self.stage_type.clone(),
            kind: self.kind,
            pipeline: self.pipeline.get().cloned(),
            capabilities: self.capabilities.get().cloned().unwrap_or_default(),
            queue_size: self.queue.get().map(|queue| queue.size()),
            quarantine_size: self.quarantine.as_ref().map(|q| q.size()),
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            exported: self.exported.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            last_file_in: *lock(&self.last_file_in),
            last_file_out: *lock(&self.last_file_out),
            down: self.is_down(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The part of a stage every concrete stage embeds
#[derive(Debug)]
pub struct StageCore {
    settings: StageSettings,
    kind: StageKind,
    monitor: Arc<StageMonitor>,
    link: Option<StageLink>,
    events: EventSender,
}

impl StageCore {
    /// Create the core and the stage's root directory.
    pub fn new(settings: StageSettings, kind: StageKind) -> Result<Self, StageError> {
        fs::create_dir_all(&settings.root).map_err(|source| StageError::Io {
            stage: settings.name.clone(),
            source,
        })?;
        let monitor = Arc::new(StageMonitor::new(&settings, kind));
        Ok(Self {
            settings,
            kind,
            monitor,
            link: None,
            events: null_sender(),
        })
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn stage_type(&self) -> &str {
        &self.settings.stage_type
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.settings.root
    }

    pub fn accept(&self) -> AcceptFlags {
        self.settings.accept
    }

    pub fn accepts(&self, object: &FileObject) -> bool {
        self.settings.accept.accepts(object.kind())
    }

    pub fn quarantine(&self) -> Option<&Arc<Quarantine>> {
        self.settings.quarantine.as_ref()
    }

    pub fn monitor(&self) -> &Arc<StageMonitor> {
        &self.monitor
    }

    pub fn link(&self) -> Option<&StageLink> {
        self.link.as_ref()
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Record this stage's position in its pipeline.
    pub fn attach(&mut self, link: StageLink, events: EventSender) {
        self.monitor.set_pipeline(&link.pipeline);
        self.link = Some(link);
        self.events = events;
    }

    /// A subdirectory of the root, created on demand.
    pub fn subdirectory(&self, name: &str) -> Result<PathBuf, StageError> {
        let dir = self.settings.root.join(name);
        fs::create_dir_all(&dir).map_err(|source| StageError::Io {
            stage: self.settings.name.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Quarantine the object if a quarantine is configured, otherwise
    /// delete it.
    pub fn reject(&self, mut object: FileObject) -> Result<(), StageError> {
        match self.quarantine() {
            Some(quarantine) => {
                let target = quarantine.insert(&mut object)?;
                self.monitor.file_quarantined();
                self.events.send(Event::Object(ObjectEvent::Quarantined {
                    stage: self.name().to_string(),
                    path: target,
                }));
            }
            None => {
                debug!(stage = %self.name(), file = %object.file().display(), "Deleting rejected object");
                if let Err(e) = object.delete() {
                    warn!(stage = %self.name(), error = %e, "Failed to delete rejected object");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accept_flags_follow_kind() {
        let accept = AcceptFlags {
            xml: false,
            ..AcceptFlags::default()
        };
        assert!(accept.accepts(ObjectKind::Dicom));
        assert!(!accept.accepts(ObjectKind::Xml));
    }

    #[test]
    fn reject_without_quarantine_deletes() {
        let dir = TempDir::new().unwrap();
        let core = StageCore::new(
            StageSettings::new("s", dir.path().join("stage")),
            StageKind::Processor,
        )
        .unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        core.reject(FileObject::open(&file).unwrap()).unwrap();

        assert!(!file.exists());
        assert_eq!(core.monitor().status().quarantined, 0);
    }

    #[test]
    fn reject_with_quarantine_moves_and_counts() {
        let dir = TempDir::new().unwrap();
        let quarantine = Arc::new(Quarantine::open(dir.path().join("q")).unwrap());
        let settings =
            StageSettings::new("s", dir.path().join("stage")).with_quarantine(quarantine.clone());
        let core = StageCore::new(settings, StageKind::Processor).unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        core.reject(FileObject::open(&file).unwrap()).unwrap();

        assert!(!file.exists());
        assert_eq!(quarantine.size(), 1);
        let status = core.monitor().status();
        assert_eq!(status.quarantined, 1);
        assert_eq!(status.quarantine_size, Some(1));
    }

    #[test]
    fn status_reports_counters_and_down_flag() {
        let dir = TempDir::new().unwrap();
        let core = StageCore::new(
            StageSettings::new("import", dir.path()).with_type("QueueImportService"),
            StageKind::Import,
        )
        .unwrap();
        let monitor = core.monitor();

        monitor.file_received();
        monitor.file_received();
        monitor.set_down();

        let status = monitor.status();
        assert_eq!(status.received, 2);
        assert!(status.last_file_in.is_some());
        assert!(status.down);
        assert_eq!(status.stage_type, "QueueImportService");
        assert!(status.queue_size.is_none());
    }
}
