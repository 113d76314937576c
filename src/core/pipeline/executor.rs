//! Pipeline execution implementation.

use super::control::{PipelineControl, PipelineHandle};
use crate::core::object::FileObject;
use crate::core::stage::{ImportQueue, Stage, StageLink, StageMonitor, StageStatus};
use crate::error::{ConfigError, StageError};
use crate::events::{null_sender, Event, EventSender, ObjectEvent, PipelineEvent};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Wait between passes when no import stage has anything
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Builder for a pipeline
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Stage>,
    events: EventSender,
    idle_interval: Duration,
}

impl PipelineBuilder {
    /// Create a new pipeline builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            events: null_sender(),
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    /// Append a stage
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append several stages in order
    pub fn stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Send pipeline and object events here
    pub fn events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// How long to wait when every import stage is empty
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Link the stages and build the pipeline.
    ///
    /// A pipeline needs at least one import stage.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        let Self {
            name,
            mut stages,
            events,
            idle_interval,
        } = self;

        if !stages.iter().any(|s| matches!(s, Stage::Import(_))) {
            return Err(ConfigError::NoImportStage { pipeline: name });
        }

        let count = stages.len();
        for (index, stage) in stages.iter_mut().enumerate() {
            let link = StageLink {
                pipeline: name.clone(),
                index,
                previous: index.checked_sub(1),
                next: (index + 1 < count).then_some(index + 1),
            };
            stage.link(link, events.clone());
        }

        Ok(Pipeline {
            name,
            stages,
            events,
            idle_interval,
            control: Arc::new(PipelineControl::new()),
        })
    }
}

/// An ordered chain of stages and the loop that drives objects through it
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    events: EventSender,
    idle_interval: Duration,
    control: Arc<PipelineControl>,
}

impl Pipeline {
    /// Create a pipeline builder
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn monitors(&self) -> Vec<Arc<StageMonitor>> {
        self.stages.iter().map(Stage::monitor).collect()
    }

    pub fn status(&self) -> Vec<StageStatus> {
        self.stages.iter().map(Stage::status).collect()
    }

    /// The receiver of the stage with this id, if it has one
    pub fn receiver(&self, id: &str) -> Option<Arc<ImportQueue>> {
        self.stages
            .iter()
            .find(|stage| stage.id() == id)
            .and_then(Stage::receiver)
    }

    /// Start every stage in order. On failure the stages already started
    /// are shut down again.
    pub fn start_stages(&mut self) -> Result<(), StageError> {
        for index in 0..self.stages.len() {
            if let Err(e) = self.stages[index].start() {
                error!(pipeline = %self.name, stage = %self.stages[index].name(), error = %e, "Stage failed to start");
                for stage in &mut self.stages[..index] {
                    stage.shutdown();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Shut every stage down, first to last.
    pub fn shutdown_stages(&mut self) {
        for stage in &mut self.stages {
            stage.shutdown();
        }
    }

    /// Start the stages and run the pipeline on its own thread.
    pub fn spawn(mut self) -> Result<PipelineHandle, StageError> {
        self.start_stages()?;

        let name = self.name.clone();
        let control = self.control.clone();
        let monitors = self.monitors();
        let thread = thread::Builder::new()
            .name(format!("pipeline-{}", name))
            .spawn(move || self.run())
            .map_err(|source| StageError::Io {
                stage: name.clone(),
                source,
            })?;

        Ok(PipelineHandle::new(name, control, monitors, thread))
    }

    /// Process objects until stopped, then shut the stages down.
    ///
    /// Any stage error or panic stops the pipeline; objects in flight stay
    /// in their import stage's active directory.
    pub fn run(mut self) {
        info!(pipeline = %self.name, stages = self.stages.len(), "Pipeline started");
        self.events.send(Event::Pipeline(PipelineEvent::Started {
            pipeline: self.name.clone(),
        }));

        while !self.control.is_stopped() {
            let pass = panic::catch_unwind(AssertUnwindSafe(|| self.process_objects()));
            let failure = match pass {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(panic_message(payload.as_ref())),
            };

            if let Some(message) = failure {
                error!(pipeline = %self.name, error = %message, "Pipeline stopping after stage failure");
                self.events.send(Event::Pipeline(PipelineEvent::Failed {
                    pipeline: self.name.clone(),
                    message,
                }));
                self.control.stop();
                break;
            }

            if !self.control.is_stopped() {
                self.control.idle(self.idle_interval);
            }
        }

        self.shutdown_stages();
        info!(pipeline = %self.name, "Pipeline stopped");
        self.events.send(Event::Pipeline(PipelineEvent::Stopped {
            pipeline: self.name.clone(),
        }));
    }

    /// Drain the import stages once; returns the number of objects that
    /// went through the pipeline.
    ///
    /// Import stages are polled in order and the first with an object wins.
    /// Each object visits every non-import stage in order until one
    /// consumes it, and is then released by the import stage it came from.
    pub fn process_objects(&mut self) -> Result<usize, StageError> {
        let mut processed = 0;
        while !self.control.is_stopped() && !self.control.is_paused() {
            let Some((source, mut object)) = self.next_object()? else {
                break;
            };

            if let Err(e) = object.set_standard_extension() {
                warn!(pipeline = %self.name, error = %e, "Could not set standard extension");
            }
            let original = object.file().to_path_buf();
            self.events.send(Event::Object(ObjectEvent::Received {
                pipeline: self.name.clone(),
                stage: self.stages[source].name().to_string(),
                path: original.clone(),
            }));

            self.walk(object)?;

            if let Stage::Import(import) = &mut self.stages[source] {
                import.release(&original);
            }
            processed += 1;
            thread::yield_now();
        }
        Ok(processed)
    }

    fn next_object(&mut self) -> Result<Option<(usize, FileObject)>, StageError> {
        for (index, stage) in self.stages.iter_mut().enumerate() {
            if let Stage::Import(import) = stage {
                if let Some(object) = import.next_object()? {
                    return Ok(Some((index, object)));
                }
            }
        }
        Ok(None)
    }

    fn walk(&mut self, object: FileObject) -> Result<(), StageError> {
        let mut current = object;
        for stage in self.stages.iter_mut() {
            let next = match stage {
                Stage::Import(_) => Some(current),
                Stage::Processor(processor) => processor.process(current)?,
                Stage::Storage(storage) => storage.store(current)?,
                Stage::Export(export) => {
                    export.export(&current)?;
                    Some(current)
                }
            };

            match next {
                Some(object) => current = object,
                None => {
                    debug!(pipeline = %self.name, stage = %stage.name(), "Object consumed");
                    self.events.send(Event::Object(ObjectEvent::Consumed {
                        pipeline: self.name.clone(),
                        stage: stage.name().to_string(),
                    }));
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("stage panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("stage panicked: {}", message)
    } else {
        "stage panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quarantine::Quarantine;
    use crate::core::stage::{
        ExportOptions, ExportStage, ExportStatus, Exporter, PipelineStage, Processor,
        QueueImportService, StageCore, StageKind, StageSettings, StorageService,
    };
    use crate::events::EventChannel;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn core(dir: &TempDir, id: &str, kind: StageKind) -> StageCore {
        StageCore::new(StageSettings::new(id, dir.path().join(id)), kind).unwrap()
    }

    /// Consumes (quarantines) objects whose name starts with "bad"
    struct RejectBad {
        core: StageCore,
    }

    impl PipelineStage for RejectBad {
        fn core(&self) -> &StageCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StageCore {
            &mut self.core
        }
    }

    impl Processor for RejectBad {
        fn process(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError> {
            if object.embedded_name().starts_with("bad") {
                self.core.reject(object)?;
                return Ok(None);
            }
            Ok(Some(object))
        }
    }

    /// Records the names it sees
    struct Recorder {
        core: StageCore,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl PipelineStage for Recorder {
        fn core(&self) -> &StageCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StageCore {
            &mut self.core
        }
    }

    impl StorageService for Recorder {
        fn store(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError> {
            assert!(object.file().exists());
            self.seen.lock().unwrap().push(object.embedded_name());
            Ok(Some(object))
        }
    }

    struct Failing {
        core: StageCore,
        panic: bool,
    }

    impl PipelineStage for Failing {
        fn core(&self) -> &StageCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StageCore {
            &mut self.core
        }
    }

    impl Processor for Failing {
        fn process(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError> {
            if self.panic {
                panic!("processor exploded on {}", object.embedded_name());
            }
            Err(StageError::Init {
                stage: self.core.name().to_string(),
                reason: "broken".to_string(),
            })
        }
    }

    struct Collect(Arc<AtomicUsize>);

    impl Exporter for Collect {
        fn export(&mut self, _file: &Path) -> ExportStatus {
            self.0.fetch_add(1, Ordering::SeqCst);
            ExportStatus::Ok
        }
    }

    fn receive(import: &QueueImportService, dir: &TempDir, name: &str) {
        let path = dir.path().join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        import.receiver().unwrap().file_received(&path).unwrap();
    }

    #[test]
    fn builder_requires_an_import_stage() {
        let dir = TempDir::new().unwrap();
        let result = Pipeline::builder("main")
            .stage(Stage::processor(RejectBad {
                core: core(&dir, "p", StageKind::Processor),
            }))
            .build();

        assert!(matches!(result, Err(ConfigError::NoImportStage { .. })));
    }

    #[test]
    fn builder_links_stages() {
        let dir = TempDir::new().unwrap();
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        let pipeline = Pipeline::builder("main")
            .stage(Stage::import(import))
            .stage(Stage::processor(RejectBad {
                core: core(&dir, "p", StageKind::Processor),
            }))
            .build()
            .unwrap();

        let Stage::Processor(processor) = &pipeline.stages()[1] else {
            panic!("wrong stage kind");
        };
        let link = processor.core().link().unwrap();
        assert_eq!(link.pipeline, "main");
        assert_eq!(link.previous, Some(0));
        assert_eq!(link.next, None);
        assert_eq!(pipeline.status()[1].pipeline.as_deref(), Some("main"));
    }

    #[test]
    fn consumed_objects_never_reach_later_stages() {
        let dir = TempDir::new().unwrap();
        let quarantine = Arc::new(Quarantine::open(dir.path().join("quarantine")).unwrap());
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        receive(&import, &dir, "good-1.txt");
        receive(&import, &dir, "bad-2.txt");
        receive(&import, &dir, "good-3.txt");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let filter_core = StageCore::new(
            StageSettings::new("a", dir.path().join("a")).with_quarantine(quarantine.clone()),
            StageKind::Processor,
        )
        .unwrap();
        let active = import.receiver().unwrap().active_dir().to_path_buf();
        let mut pipeline = Pipeline::builder("main")
            .stage(Stage::import(import))
            .stage(Stage::processor(RejectBad { core: filter_core }))
            .stage(Stage::storage(Recorder {
                core: core(&dir, "b", StageKind::Storage),
                seen: seen.clone(),
            }))
            .build()
            .unwrap();

        assert_eq!(pipeline.process_objects().unwrap(), 3);

        assert_eq!(*seen.lock().unwrap(), vec!["good-1.txt", "good-3.txt"]);
        assert_eq!(quarantine.size(), 1);
        assert_eq!(fs::read_dir(active).unwrap().count(), 0);
    }

    #[test]
    fn export_stages_queue_copies_and_pass_objects_on() {
        let dir = TempDir::new().unwrap();
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        receive(&import, &dir, "a.txt");
        let exported = Arc::new(AtomicUsize::new(0));
        let export = ExportStage::new(
            core(&dir, "out", StageKind::Export),
            ExportOptions::default(),
            Collect(exported.clone()),
        )
        .unwrap();
        let export_queue = export.queue().clone();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = Pipeline::builder("main")
            .stage(Stage::import(import))
            .stage(Stage::export(export))
            .stage(Stage::storage(Recorder {
                core: core(&dir, "store", StageKind::Storage),
                seen: seen.clone(),
            }))
            .build()
            .unwrap();

        pipeline.process_objects().unwrap();

        assert_eq!(export_queue.size(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a.txt"]);
    }

    #[test]
    fn stage_error_stops_the_pipeline_and_keeps_the_object() {
        let dir = TempDir::new().unwrap();
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        receive(&import, &dir, "a.txt");
        let receiver = import.receiver().unwrap();
        let (events, observed) = EventChannel::new();

        let pipeline = Pipeline::builder("main")
            .events(events)
            .stage(Stage::import(import))
            .stage(Stage::processor(Failing {
                core: core(&dir, "p", StageKind::Processor),
                panic: false,
            }))
            .build()
            .unwrap();
        let handle = pipeline.spawn().unwrap();
        handle.join();

        assert_eq!(fs::read_dir(receiver.active_dir()).unwrap().count(), 1);
        let failed = observed
            .iter()
            .any(|e| matches!(e, Event::Pipeline(PipelineEvent::Failed { .. })));
        assert!(failed);
    }

    #[test]
    fn panicking_stage_stops_the_pipeline() {
        let dir = TempDir::new().unwrap();
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        receive(&import, &dir, "a.txt");

        let pipeline = Pipeline::builder("main")
            .stage(Stage::import(import))
            .stage(Stage::processor(Failing {
                core: core(&dir, "p", StageKind::Processor),
                panic: true,
            }))
            .build()
            .unwrap();
        let monitors = pipeline.monitors();
        let handle = pipeline.spawn().unwrap();
        handle.join();

        assert!(monitors.iter().all(|m| m.is_down()));
    }

    #[cfg(unix)]
    #[test]
    fn filesystem_failure_on_dequeue_keeps_the_pipeline_running() {
        let dir = TempDir::new().unwrap();
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        receive(&import, &dir, "a.txt");
        let receiver = import.receiver().unwrap();
        let active = receiver.active_dir().to_path_buf();
        fs::remove_dir(&active).unwrap();
        std::os::unix::fs::symlink(dir.path().join("missing"), &active).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = Pipeline::builder("main")
            .stage(Stage::import(import))
            .stage(Stage::storage(Recorder {
                core: core(&dir, "store", StageKind::Storage),
                seen: seen.clone(),
            }))
            .build()
            .unwrap();

        assert_eq!(pipeline.process_objects().unwrap(), 0);
        assert!(!pipeline.control.is_stopped());
        assert_eq!(receiver.size(), 1);

        fs::remove_file(&active).unwrap();
        assert_eq!(pipeline.process_objects().unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a.txt"]);
    }

    #[test]
    fn paused_pipeline_leaves_objects_queued() {
        let dir = TempDir::new().unwrap();
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        receive(&import, &dir, "a.txt");
        let receiver = import.receiver().unwrap();

        let mut pipeline = Pipeline::builder("main")
            .stage(Stage::import(import))
            .build()
            .unwrap();
        pipeline.control.set_paused(true);

        assert_eq!(pipeline.process_objects().unwrap(), 0);
        assert_eq!(receiver.size(), 1);

        pipeline.control.set_paused(false);
        assert_eq!(pipeline.process_objects().unwrap(), 1);
        assert_eq!(receiver.size(), 0);
    }

    #[test]
    fn standard_extension_is_applied_before_stages_run() {
        let dir = TempDir::new().unwrap();
        let import = QueueImportService::new(core(&dir, "in", StageKind::Import)).unwrap();
        let receiver = import.receiver().unwrap();
        let path = dir.path().join("report");
        fs::write(&path, b"<report/>").unwrap();
        receiver.file_received(&path).unwrap();
        let (events, observed) = EventChannel::new();

        let mut pipeline = Pipeline::builder("main")
            .events(events)
            .stage(Stage::import(import))
            .build()
            .unwrap();
        pipeline.process_objects().unwrap();

        let received = observed.try_recv().unwrap();
        let Event::Object(ObjectEvent::Received { path, .. }) = received else {
            panic!("expected a received event");
        };
        assert!(path.to_string_lossy().ends_with("[report].xml"));
        assert_eq!(fs::read_dir(receiver.active_dir()).unwrap().count(), 0);
    }
}
