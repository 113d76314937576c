//! Queue-backed base shared by every export stage.
//!
//! The pipeline thread only ever enqueues. A worker thread per stage drains
//! the queue in batches through an [`Exporter`], which reports each file as
//! sent, failed for good, or worth retrying later.

use super::{
    AcceptFlags, Capability, ExportService, PipelineStage, StageCore, StageLink, StageMonitor,
};
use crate::core::filter::ObjectFilter;
use crate::core::object::{FileObject, ObjectKind};
use crate::core::quarantine::Quarantine;
use crate::core::queue::{QueueManager, DEFAULT_LEVELS, DEFAULT_MAX_SIZE};
use crate::error::StageError;
use crate::events::{Event, EventSender, ObjectEvent};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause between batches when nothing is configured
pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_millis(5000);
const MIN_EXPORT_INTERVAL: Duration = Duration::from_millis(1000);
const MAX_EXPORT_INTERVAL: Duration = Duration::from_millis(10000);

/// A batch ends once this many retries have happened in a row
pub const MAX_CONSECUTIVE_RETRIES: u32 = 5;

/// Below this size the cached queue size is re-derived from disk
const RECOUNT_THRESHOLD: usize = 20;

/// Result of handing one file to an exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    /// Delivered; the file can be released
    Ok,
    /// Will never succeed; the file goes to quarantine
    Fail,
    /// Try again later; the file goes back to the end of the queue
    Retry,
}

/// Transmits queued files to a destination
pub trait Exporter: Send + 'static {
    /// Prepare for a batch. Anything but `Ok` skips the batch.
    fn connect(&mut self) -> ExportStatus {
        ExportStatus::Ok
    }

    fn export(&mut self, file: &Path) -> ExportStatus;

    /// Called after every batch that connected.
    fn disconnect(&mut self) {}
}

/// Tuning for an export stage
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Pause between batches, clamped to 1-10 seconds
    pub interval: Duration,
    /// Pause after each successful export
    pub throttle: Duration,
    /// When set, objects are written to a secondary `cache` queue and the
    /// main queue is topped up to this size before each dequeue
    pub cache_size: Option<usize>,
    pub dicom_script: Option<PathBuf>,
    pub xml_script: Option<PathBuf>,
    pub zip_script: Option<PathBuf>,
    /// Copy filtered-out objects into quarantine
    pub quarantine_filtered: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_EXPORT_INTERVAL,
            throttle: Duration::ZERO,
            cache_size: None,
            dicom_script: None,
            xml_script: None,
            zip_script: None,
            quarantine_filtered: false,
        }
    }
}

impl ExportOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.clamp(MIN_EXPORT_INTERVAL, MAX_EXPORT_INTERVAL);
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_cache(mut self, cache_size: usize) -> Self {
        self.cache_size = Some(cache_size.max(1));
        self
    }

    fn scripts(&self) -> Vec<PathBuf> {
        [&self.dicom_script, &self.xml_script, &self.zip_script]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// The durable side of an export stage
#[derive(Debug)]
pub struct ExportQueue {
    stage: String,
    queue: Arc<QueueManager>,
    cache: Option<(Arc<QueueManager>, usize)>,
    active: PathBuf,
    temp: PathBuf,
    accept: AcceptFlags,
    quarantine: Option<Arc<Quarantine>>,
    monitor: Arc<StageMonitor>,
    /// Replaced when the stage is linked, possibly after the queue is shared
    events: Mutex<EventSender>,
    dicom_filter: Option<ObjectFilter>,
    xml_filter: Option<ObjectFilter>,
    zip_filter: Option<ObjectFilter>,
    quarantine_filtered: bool,
}

impl ExportQueue {
    /// Open the stage's queues and move anything left in `active` from a
    /// previous run back into the queue.
    pub fn open(core: &StageCore, options: &ExportOptions) -> Result<Self, StageError> {
        let queue = Arc::new(QueueManager::new(
            core.root().join("queue"),
            DEFAULT_LEVELS,
            DEFAULT_MAX_SIZE,
        )?);
        let cache = match options.cache_size {
            Some(size) => Some((
                Arc::new(QueueManager::new(
                    core.root().join("cache"),
                    DEFAULT_LEVELS,
                    DEFAULT_MAX_SIZE,
                )?),
                size,
            )),
            None => None,
        };
        let active = core.subdirectory("active")?;
        let temp = core.subdirectory("temp")?;

        let recovered = queue.enqueue_dir(&active)?;
        if recovered > 0 {
            info!(stage = %core.name(), recovered, "Requeued files left in the active directory");
        }
        core.monitor().attach_queue(queue.clone());

        let load = |script: &Option<PathBuf>| -> Result<Option<ObjectFilter>, StageError> {
            match script {
                Some(path) => Ok(ObjectFilter::load(path)?),
                None => Ok(None),
            }
        };

        Ok(Self {
            stage: core.name().to_string(),
            queue,
            cache,
            active,
            temp,
            accept: core.accept(),
            quarantine: core.quarantine().cloned(),
            monitor: core.monitor().clone(),
            events: Mutex::new(core.events().clone()),
            dicom_filter: load(&options.dicom_script)?,
            xml_filter: load(&options.xml_script)?,
            zip_filter: load(&options.zip_script)?,
            quarantine_filtered: options.quarantine_filtered,
        })
    }

    pub(crate) fn set_events(&self, events: EventSender) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = events;
    }

    fn send(&self, event: ObjectEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(Event::Object(event));
    }

    /// Queue a copy of the object for export.
    ///
    /// Returns whether the object was queued. Unaccepted and filtered-out
    /// objects are skipped. When the copy into the queue fails, a copy goes
    /// to quarantine instead; only if that fails too is an error returned.
    pub fn enqueue(&self, object: &FileObject) -> Result<bool, StageError> {
        if !self.accept.accepts(object.kind()) {
            return Ok(false);
        }

        if let Some(filter) = self.filter_for(object.kind()) {
            if !filter.matches(object) {
                debug!(stage = %self.stage, name = %object.embedded_name(), "Object filtered out of export");
                if self.quarantine_filtered {
                    self.quarantine_copy(object)?;
                }
                return Ok(false);
            }
        }

        let target = match &self.cache {
            Some((cache, _)) => cache,
            None => &self.queue,
        };
        match target.enqueue(object.file()) {
            Ok(path) => {
                self.send(ObjectEvent::Queued {
                    stage: self.stage.clone(),
                    path,
                });
                Ok(true)
            }
            Err(e) => {
                warn!(stage = %self.stage, error = %e, "Export enqueue failed");
                match &self.quarantine {
                    Some(_) => {
                        self.quarantine_copy(object)?;
                        Ok(false)
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Move the next file to export into the active directory.
    ///
    /// A filesystem failure is logged and reported as an empty queue; the
    /// next batch tries again.
    pub fn next_file(&self) -> Option<PathBuf> {
        if let Err(e) = self.top_up() {
            warn!(stage = %self.stage, error = %e, "Cache top-up failed");
        }
        match self.queue.dequeue(&self.active) {
            Ok(file) => file,
            Err(e) => {
                warn!(stage = %self.stage, error = %e, "Dequeue for export failed");
                None
            }
        }
    }

    /// Delete `file` if it is still in the active directory.
    pub fn release(&self, file: &Path) {
        if file.parent() != Some(self.active.as_path()) {
            return;
        }
        if let Err(e) = fs::remove_file(file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(stage = %self.stage, file = %file.display(), error = %e, "Failed to release exported file");
            }
        }
    }

    /// Put a file back at the end of the queue.
    pub fn requeue(&self, file: &Path) -> Result<(), StageError> {
        self.queue.enqueue(file)?;
        self.release(file);
        Ok(())
    }

    /// Quarantine (or delete) a file that can never be exported.
    pub fn fail(&self, file: &Path) {
        match &self.quarantine {
            Some(quarantine) => match quarantine.insert_file(file) {
                Ok(_) => self.monitor.file_quarantined(),
                Err(e) => {
                    error!(stage = %self.stage, error = %e, "Failed export could not be quarantined");
                }
            },
            None => self.release(file),
        }
    }

    /// Files waiting for export, including the cache
    pub fn size(&self) -> usize {
        self.queue.size() + self.cache.as_ref().map_or(0, |(cache, _)| cache.size())
    }

    pub fn recount(&self) -> usize {
        let cached = self
            .cache
            .as_ref()
            .map_or(0, |(cache, _)| cache.recount());
        self.queue.recount() + cached
    }

    pub fn active_dir(&self) -> &Path {
        &self.active
    }

    fn filter_for(&self, kind: ObjectKind) -> Option<&ObjectFilter> {
        match kind {
            ObjectKind::Dicom => self.dicom_filter.as_ref(),
            ObjectKind::Xml => self.xml_filter.as_ref(),
            ObjectKind::Zip => self.zip_filter.as_ref(),
            ObjectKind::File => None,
        }
    }

    fn quarantine_copy(&self, object: &FileObject) -> Result<(), StageError> {
        if let Some(quarantine) = &self.quarantine {
            let path = quarantine.insert_copy(object)?;
            self.monitor.file_quarantined();
            self.send(ObjectEvent::Quarantined {
                stage: self.stage.clone(),
                path,
            });
        }
        Ok(())
    }

    /// Move files from the cache into the main queue until it holds
    /// `cache_size` files.
    fn top_up(&self) -> Result<(), StageError> {
        let Some((cache, limit)) = &self.cache else {
            return Ok(());
        };
        while self.queue.size() < *limit {
            let Some(file) = cache.dequeue(&self.temp)? else {
                break;
            };
            if let Err(e) = self.queue.enqueue(&file) {
                // Back into the cache so nothing is lost
                cache.enqueue(&file)?;
                let _ = fs::remove_file(&file);
                return Err(e.into());
            }
            let _ = fs::remove_file(&file);
        }
        Ok(())
    }
}

/// What one batch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub exported: usize,
    pub failed: usize,
    pub retried: usize,
    /// The batch ended early: the exporter would not connect or kept
    /// asking for retries
    pub backed_off: bool,
}

/// The loop run on an export stage's worker thread
struct ExportWorker<E: Exporter> {
    stage: String,
    queue: Arc<ExportQueue>,
    exporter: E,
    interval: Duration,
    throttle: Duration,
    stop: Arc<AtomicBool>,
    wake: Receiver<()>,
    monitor: Arc<StageMonitor>,
    events: EventSender,
}

impl<E: Exporter> ExportWorker<E> {
    fn run(mut self) -> E {
        info!(stage = %self.stage, "Exporter started");
        while !self.stopped() {
            if self.queue.size() > 0 {
                match self.drain_batch() {
                    Ok(outcome) if outcome.exported + outcome.failed + outcome.retried > 0 => {
                        debug!(
                            stage = %self.stage,
                            exported = outcome.exported,
                            failed = outcome.failed,
                            retried = outcome.retried,
                            "Export batch finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(stage = %self.stage, error = %e, "Export batch aborted"),
                }
            }
            if self.queue.size() < RECOUNT_THRESHOLD {
                self.queue.recount();
            }
            self.pause(self.interval);
        }
        info!(stage = %self.stage, "Exporter stopped");
        self.exporter
    }

    /// Export files until the queue is empty, the stage stops, or the
    /// exporter has asked for a retry too many times in a row.
    fn drain_batch(&mut self) -> Result<BatchOutcome, StageError> {
        let mut outcome = BatchOutcome::default();
        if self.exporter.connect() != ExportStatus::Ok {
            debug!(stage = %self.stage, "Exporter not ready");
            outcome.backed_off = true;
            return Ok(outcome);
        }

        let result = self.export_files(&mut outcome);
        self.exporter.disconnect();
        result.map(|()| outcome)
    }

    fn export_files(&mut self, outcome: &mut BatchOutcome) -> Result<(), StageError> {
        let mut retries = 0;
        while !self.stopped() {
            let Some(file) = self.queue.next_file() else {
                break;
            };

            match self.exporter.export(&file) {
                ExportStatus::Ok => {
                    if !self.throttle.is_zero() {
                        self.pause(self.throttle);
                    }
                    self.queue.release(&file);
                    self.monitor.file_exported();
                    self.send(&file, |stage, path| ObjectEvent::Exported { stage, path });
                    outcome.exported += 1;
                    retries = 0;
                }
                ExportStatus::Fail => {
                    warn!(stage = %self.stage, file = %file.display(), "Export failed");
                    self.queue.fail(&file);
                    self.monitor.file_failed();
                    self.send(&file, |stage, path| ObjectEvent::ExportFailed { stage, path });
                    outcome.failed += 1;
                }
                ExportStatus::Retry => {
                    self.queue.requeue(&file)?;
                    self.monitor.file_retried();
                    self.send(&file, |stage, path| ObjectEvent::Retried { stage, path });
                    outcome.retried += 1;
                    retries += 1;
                    if retries > MAX_CONSECUTIVE_RETRIES {
                        debug!(stage = %self.stage, "Too many retries; waiting for the next batch");
                        outcome.backed_off = true;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn send(&self, file: &Path, event: impl FnOnce(String, PathBuf) -> ObjectEvent) {
        self.events
            .send(Event::Object(event(self.stage.clone(), file.to_path_buf())));
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep, waking early when the stage is shut down.
    fn pause(&self, duration: Duration) {
        match self.wake.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.stop.store(true, Ordering::SeqCst),
        }
    }
}

/// An export stage: an [`ExportQueue`] plus a worker thread driving an
/// [`Exporter`]
pub struct ExportStage<E: Exporter> {
    core: StageCore,
    queue: Arc<ExportQueue>,
    options: ExportOptions,
    exporter: Option<E>,
    stop: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    worker: Option<JoinHandle<E>>,
}

impl<E: Exporter> ExportStage<E> {
    pub fn new(core: StageCore, options: ExportOptions, exporter: E) -> Result<Self, StageError> {
        let queue = Arc::new(ExportQueue::open(&core, &options)?);
        Ok(Self {
            core,
            queue,
            options,
            exporter: Some(exporter),
            stop: Arc::new(AtomicBool::new(false)),
            wake: None,
            worker: None,
        })
    }

    pub fn queue(&self) -> &Arc<ExportQueue> {
        &self.queue
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    fn stop_worker(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(wake) = self.wake.take() {
            let _ = wake.send(());
        }
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(exporter) => self.exporter = Some(exporter),
                Err(_) => error!(stage = %self.core.name(), "Exporter thread panicked"),
            }
        }
    }
}

impl<E: Exporter> PipelineStage for ExportStage<E> {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn capabilities(&self) -> &'static [Capability] {
        if self.options.scripts().is_empty() {
            &[]
        } else {
            &[Capability::Scriptable]
        }
    }

    fn scripts(&self) -> Vec<PathBuf> {
        self.options.scripts()
    }

    fn link(&mut self, link: StageLink, events: EventSender) {
        self.core.monitor().set_capabilities(self.capabilities());
        self.core.attach(link, events.clone());
        self.queue.set_events(events);
    }

    fn start(&mut self) -> Result<(), StageError> {
        let Some(exporter) = self.exporter.take() else {
            return Err(StageError::Start {
                stage: self.core.name().to_string(),
                reason: "already started".to_string(),
            });
        };

        let (wake_tx, wake_rx) = bounded(1);
        let worker = ExportWorker {
            stage: self.core.name().to_string(),
            queue: self.queue.clone(),
            exporter,
            interval: self.options.interval,
            throttle: self.options.throttle,
            stop: self.stop.clone(),
            wake: wake_rx,
            monitor: self.core.monitor().clone(),
            events: self.core.events().clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("export-{}", self.core.id()))
            .spawn(move || worker.run())
            .map_err(|source| StageError::Io {
                stage: self.core.name().to_string(),
                source,
            })?;
        self.wake = Some(wake_tx);
        self.worker = Some(handle);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stop_worker();
        self.core.monitor().set_down();
    }
}

impl<E: Exporter> ExportService for ExportStage<E> {
    fn export(&mut self, object: &FileObject) -> Result<(), StageError> {
        self.queue.enqueue(object)?;
        Ok(())
    }
}

impl<E: Exporter> Drop for ExportStage<E> {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::sample_dicom;
    use crate::core::stage::{StageKind, StageSettings};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays scripted results and records what it was given
    struct ScriptedExporter {
        results: VecDeque<ExportStatus>,
        exported: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedExporter {
        fn new(results: &[ExportStatus]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let exported = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    results: results.iter().copied().collect(),
                    exported: exported.clone(),
                },
                exported,
            )
        }
    }

    impl Exporter for ScriptedExporter {
        fn export(&mut self, file: &Path) -> ExportStatus {
            self.exported
                .lock()
                .unwrap()
                .push(crate::core::queue::embedded_name_of(file));
            self.results.pop_front().unwrap_or(ExportStatus::Ok)
        }
    }

    fn core(dir: &TempDir, settings: impl FnOnce(StageSettings) -> StageSettings) -> StageCore {
        StageCore::new(
            settings(StageSettings::new("export", dir.path().join("stage"))),
            StageKind::Export,
        )
        .unwrap()
    }

    fn object(dir: &TempDir, name: &str, content: &[u8]) -> FileObject {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        FileObject::open(path).unwrap()
    }

    fn worker<E: Exporter>(queue: Arc<ExportQueue>, exporter: E) -> ExportWorker<E> {
        let (_wake_tx, wake_rx) = bounded(1);
        ExportWorker {
            stage: "export".to_string(),
            monitor: queue.monitor.clone(),
            queue,
            exporter,
            interval: DEFAULT_EXPORT_INTERVAL,
            throttle: Duration::ZERO,
            stop: Arc::new(AtomicBool::new(false)),
            wake: wake_rx,
            events: crate::events::null_sender(),
        }
    }

    #[test]
    fn interval_is_clamped() {
        let options = ExportOptions::default().with_interval(Duration::from_millis(10));
        assert_eq!(options.interval, Duration::from_millis(1000));

        let options = ExportOptions::default().with_interval(Duration::from_secs(60));
        assert_eq!(options.interval, Duration::from_millis(10000));

        assert_eq!(ExportOptions::default().interval, Duration::from_millis(5000));
    }

    #[test]
    fn enqueue_copies_and_leaves_object_in_place() {
        let dir = TempDir::new().unwrap();
        let queue = ExportQueue::open(&core(&dir, |s| s), &ExportOptions::default()).unwrap();
        let object = object(&dir, "a.dcm", &sample_dicom("1.2.3", "P", "1.2"));

        assert!(queue.enqueue(&object).unwrap());

        assert!(object.file().exists());
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn unaccepted_objects_are_not_queued() {
        let dir = TempDir::new().unwrap();
        let accept = AcceptFlags {
            file: false,
            ..AcceptFlags::default()
        };
        let queue =
            ExportQueue::open(&core(&dir, |s| s.with_accept(accept)), &ExportOptions::default())
                .unwrap();

        assert!(!queue.enqueue(&object(&dir, "a.txt", b"x")).unwrap());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn filtered_objects_can_be_copied_to_quarantine() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("dicom.script");
        fs::write(&script, "patient_id == \"KEEP\"").unwrap();
        let quarantine = Arc::new(Quarantine::open(dir.path().join("q")).unwrap());
        let options = ExportOptions {
            dicom_script: Some(script),
            quarantine_filtered: true,
            ..ExportOptions::default()
        };
        let queue = ExportQueue::open(
            &core(&dir, |s| s.with_quarantine(quarantine.clone())),
            &options,
        )
        .unwrap();

        let kept = object(&dir, "keep.dcm", &sample_dicom("1.1", "KEEP", "1.2"));
        let dropped = object(&dir, "drop.dcm", &sample_dicom("1.3", "DROP", "1.2"));

        assert!(queue.enqueue(&kept).unwrap());
        assert!(!queue.enqueue(&dropped).unwrap());
        assert_eq!(queue.size(), 1);
        assert_eq!(quarantine.size(), 1);
        assert!(dropped.file().exists());
    }

    #[test]
    fn batch_exports_everything_in_order() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(ExportQueue::open(&core(&dir, |s| s), &ExportOptions::default()).unwrap());
        for name in ["a.txt", "b.txt", "c.txt"] {
            queue.enqueue(&object(&dir, name, name.as_bytes())).unwrap();
        }
        let (exporter, exported) = ScriptedExporter::new(&[]);

        let outcome = worker(queue.clone(), exporter).drain_batch().unwrap();

        assert_eq!(outcome.exported, 3);
        assert_eq!(*exported.lock().unwrap(), vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(queue.size(), 0);
        assert_eq!(fs::read_dir(queue.active_dir()).unwrap().count(), 0);
        assert_eq!(queue.monitor.status().exported, 3);
    }

    #[test]
    fn failed_files_go_to_quarantine() {
        let dir = TempDir::new().unwrap();
        let quarantine = Arc::new(Quarantine::open(dir.path().join("q")).unwrap());
        let queue = Arc::new(
            ExportQueue::open(
                &core(&dir, |s| s.with_quarantine(quarantine.clone())),
                &ExportOptions::default(),
            )
            .unwrap(),
        );
        queue.enqueue(&object(&dir, "bad.txt", b"x")).unwrap();
        let (exporter, _) = ScriptedExporter::new(&[ExportStatus::Fail]);

        let outcome = worker(queue.clone(), exporter).drain_batch().unwrap();

        assert_eq!(outcome.failed, 1);
        assert_eq!(quarantine.size(), 1);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn repeated_retries_end_the_batch() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(ExportQueue::open(&core(&dir, |s| s), &ExportOptions::default()).unwrap());
        for name in ["a.txt", "b.txt", "c.txt"] {
            queue.enqueue(&object(&dir, name, name.as_bytes())).unwrap();
        }
        let (exporter, exported) = ScriptedExporter::new(&[ExportStatus::Retry; 20]);

        let outcome = worker(queue.clone(), exporter).drain_batch().unwrap();

        assert!(outcome.backed_off);
        assert_eq!(outcome.retried, MAX_CONSECUTIVE_RETRIES as usize + 1);
        assert_eq!(exported.lock().unwrap().len(), 6);
        assert_eq!(queue.size(), 3);
        assert_eq!(fs::read_dir(queue.active_dir()).unwrap().count(), 0);
    }

    #[test]
    fn success_resets_the_retry_count() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(ExportQueue::open(&core(&dir, |s| s), &ExportOptions::default()).unwrap());
        for name in ["a.txt", "b.txt"] {
            queue.enqueue(&object(&dir, name, name.as_bytes())).unwrap();
        }
        let mut script = vec![ExportStatus::Retry; 4];
        script.push(ExportStatus::Ok);
        script.extend([ExportStatus::Retry; 4]);
        let (exporter, _) = ScriptedExporter::new(&script);

        let outcome = worker(queue.clone(), exporter).drain_batch().unwrap();

        assert!(!outcome.backed_off);
        assert_eq!(outcome.retried, 8);
        assert_eq!(outcome.exported, 2);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn refused_connection_skips_the_batch() {
        struct Offline;
        impl Exporter for Offline {
            fn connect(&mut self) -> ExportStatus {
                ExportStatus::Retry
            }
            fn export(&mut self, _file: &Path) -> ExportStatus {
                panic!("export called without a connection")
            }
        }

        let dir = TempDir::new().unwrap();
        let queue = Arc::new(ExportQueue::open(&core(&dir, |s| s), &ExportOptions::default()).unwrap());
        queue.enqueue(&object(&dir, "a.txt", b"x")).unwrap();

        let outcome = worker(queue.clone(), Offline).drain_batch().unwrap();

        assert!(outcome.backed_off);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn cache_feeds_the_main_queue() {
        let dir = TempDir::new().unwrap();
        let options = ExportOptions::default().with_cache(2);
        let queue = Arc::new(ExportQueue::open(&core(&dir, |s| s), &options).unwrap());
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            queue.enqueue(&object(&dir, name, name.as_bytes())).unwrap();
        }
        assert_eq!(queue.queue.size(), 0);
        assert_eq!(queue.size(), 4);

        let first = queue.next_file().unwrap();
        assert_eq!(crate::core::queue::embedded_name_of(&first), "a.txt");
        assert_eq!(queue.queue.size(), 1);
        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn release_ignores_files_outside_active() {
        let dir = TempDir::new().unwrap();
        let queue = ExportQueue::open(&core(&dir, |s| s), &ExportOptions::default()).unwrap();
        let elsewhere = dir.path().join("keep.dcm");
        fs::write(&elsewhere, b"x").unwrap();

        queue.release(&elsewhere);
        queue.fail(&elsewhere);
        assert!(queue.requeue(&elsewhere).is_ok());

        assert!(elsewhere.exists());
        assert_eq!(queue.size(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn unusable_active_directory_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(ExportQueue::open(&core(&dir, |s| s), &ExportOptions::default()).unwrap());
        queue.enqueue(&object(&dir, "a.txt", b"x")).unwrap();
        let active = queue.active_dir().to_path_buf();
        fs::remove_dir(&active).unwrap();
        std::os::unix::fs::symlink(dir.path().join("missing"), &active).unwrap();
        let (exporter, exported) = ScriptedExporter::new(&[]);
        let mut worker = worker(queue.clone(), exporter);

        assert!(queue.next_file().is_none());
        assert_eq!(worker.drain_batch().unwrap(), BatchOutcome::default());
        assert_eq!(queue.size(), 1);

        fs::remove_file(&active).unwrap();
        assert_eq!(worker.drain_batch().unwrap().exported, 1);
        assert_eq!(*exported.lock().unwrap(), vec!["a.txt"]);
    }

    #[test]
    fn events_follow_the_link_even_when_the_queue_is_shared() {
        let dir = TempDir::new().unwrap();
        let (exporter, _) = ScriptedExporter::new(&[]);
        let mut stage =
            ExportStage::new(core(&dir, |s| s), ExportOptions::default(), exporter).unwrap();
        let shared = stage.queue().clone();
        let (events, observed) = crate::events::EventChannel::new();

        stage.link(
            StageLink {
                pipeline: "main".to_string(),
                index: 1,
                previous: Some(0),
                next: None,
            },
            events,
        );
        shared.enqueue(&object(&dir, "a.txt", b"x")).unwrap();

        assert!(matches!(
            observed.try_recv(),
            Some(Event::Object(ObjectEvent::Queued { .. }))
        ));
    }

    #[test]
    fn stage_worker_exports_in_background() {
        let dir = TempDir::new().unwrap();
        let (exporter, exported) = ScriptedExporter::new(&[]);
        let options = ExportOptions::default().with_interval(Duration::from_millis(1000));
        let mut stage = ExportStage::new(core(&dir, |s| s), options, exporter).unwrap();

        stage.export(&object(&dir, "a.txt", b"x")).unwrap();
        stage.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while exported.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        stage.shutdown();

        assert_eq!(*exported.lock().unwrap(), vec!["a.txt"]);
        assert!(stage.is_down());
        assert_eq!(stage.queue().size(), 0);
    }
}
