//! # App Module
//!
//! The application context: everything built from one configuration file.
//!
//! ## Ownership
//! - quarantines, one per distinct directory, shared by every stage that
//!   names it
//! - pipelines, built but idle until [`Application::start`], then owned
//!   through their [`PipelineHandle`]s
//! - the stage directory, for lookup by stage id from receivers and the CLI
//!
//! ## Shutdown
//! Every pipeline is asked to stop, then the application polls until each
//! pipeline thread has exited and each stage reports down, or it gives up.

use crate::config::Configuration;
use crate::core::pipeline::{Pipeline, PipelineHandle};
use crate::core::quarantine::Quarantine;
use crate::core::registry::{StageContext, StageRegistry};
use crate::core::stage::{ImportQueue, StageMonitor, StageSettings, StageStatus};
use crate::error::Result;
use crate::events::EventSender;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// How many times shutdown checks for stopped pipelines
pub const SHUTDOWN_ATTEMPTS: u32 = 20;

/// Wait between shutdown checks
pub const SHUTDOWN_DELAY: Duration = Duration::from_secs(2);

/// One stage in the stage directory
#[derive(Debug, Clone)]
pub struct StageEntry {
    pub id: String,
    pub pipeline: String,
    pub index: usize,
    monitor: Arc<StageMonitor>,
    receiver: Option<Arc<ImportQueue>>,
    quarantine: Option<Arc<Quarantine>>,
}

impl StageEntry {
    pub fn monitor(&self) -> &Arc<StageMonitor> {
        &self.monitor
    }

    pub fn receiver(&self) -> Option<&Arc<ImportQueue>> {
        self.receiver.as_ref()
    }

    pub fn quarantine(&self) -> Option<&Arc<Quarantine>> {
        self.quarantine.as_ref()
    }
}

/// All pipelines of one configuration
pub struct Application {
    idle: Vec<Pipeline>,
    running: Vec<PipelineHandle>,
    stages: Vec<StageEntry>,
    quarantines: HashMap<PathBuf, Arc<Quarantine>>,
}

impl Application {
    /// Build every pipeline with the built-in stage types.
    pub fn from_config(config: &Configuration, events: EventSender) -> Result<Self> {
        Self::with_registry(config, &StageRegistry::builtin(), events)
    }

    /// Build every pipeline, looking stage types up in `registry`.
    pub fn with_registry(
        config: &Configuration,
        registry: &StageRegistry,
        events: EventSender,
    ) -> Result<Self> {
        let mut quarantines: HashMap<PathBuf, Arc<Quarantine>> = HashMap::new();
        let mut pipelines = Vec::with_capacity(config.pipelines.len());
        let mut stages = Vec::new();

        for pipeline_config in &config.pipelines {
            let mut built = Vec::with_capacity(pipeline_config.stages.len());
            let mut quarantine_of = Vec::with_capacity(pipeline_config.stages.len());

            for (index, stage_config) in pipeline_config.stages.iter().enumerate() {
                let id = Configuration::stage_id(pipeline_config, index);
                let mut settings = StageSettings::new(id, config.resolve(&stage_config.root))
                    .with_name(
                        stage_config
                            .name
                            .clone()
                            .unwrap_or_else(|| stage_config.stage_type.clone()),
                    )
                    .with_type(stage_config.stage_type.clone())
                    .with_accept(stage_config.accept());

                let quarantine = match config.quarantine_dir(pipeline_config, stage_config) {
                    Some(dir) => Some(shared_quarantine(&mut quarantines, dir)?),
                    None => None,
                };
                if let Some(quarantine) = &quarantine {
                    settings = settings.with_quarantine(quarantine.clone());
                }
                quarantine_of.push(quarantine);

                let context = StageContext::new(config, stage_config, settings);
                built.push(registry.build(&pipeline_config.name, context)?);
            }

            let pipeline = Pipeline::builder(pipeline_config.name.clone())
                .stages(built)
                .events(events.clone())
                .build()?;

            for (index, (stage, quarantine)) in
                pipeline.stages().iter().zip(quarantine_of).enumerate()
            {
                stages.push(StageEntry {
                    id: stage.id().to_string(),
                    pipeline: pipeline.name().to_string(),
                    index,
                    monitor: stage.monitor(),
                    receiver: stage.receiver(),
                    quarantine,
                });
            }
            info!(pipeline = %pipeline.name(), stages = pipeline.stages().len(), "Pipeline built");
            pipelines.push(pipeline);
        }

        Ok(Self {
            idle: pipelines,
            running: Vec::new(),
            stages,
            quarantines,
        })
    }

    /// Start every pipeline on its own thread.
    ///
    /// If a pipeline fails to start, the ones already running are asked to
    /// stop and the error is returned.
    pub fn start(&mut self) -> Result<()> {
        let pipelines: Vec<Pipeline> = self.idle.drain(..).collect();
        let mut pipelines = pipelines.into_iter();
        while let Some(pipeline) = pipelines.next() {
            match pipeline.spawn() {
                Ok(handle) => self.running.push(handle),
                Err(e) => {
                    self.request_stop();
                    self.idle.extend(pipelines);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Stage directory in configuration order
    pub fn stages(&self) -> &[StageEntry] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&StageEntry> {
        self.stages.iter().find(|entry| entry.id == id)
    }

    /// The import queue external receivers hand files to
    pub fn receiver(&self, id: &str) -> Option<Arc<ImportQueue>> {
        self.stage(id).and_then(|entry| entry.receiver.clone())
    }

    /// Quarantines by directory
    pub fn quarantines(&self) -> &HashMap<PathBuf, Arc<Quarantine>> {
        &self.quarantines
    }

    pub fn quarantine(&self, dir: &Path) -> Option<&Arc<Quarantine>> {
        self.quarantines.get(dir)
    }

    /// Status of every stage, in configuration order
    pub fn status(&self) -> Vec<StageStatus> {
        self.stages.iter().map(|entry| entry.monitor.status()).collect()
    }

    pub fn pipelines(&self) -> &[PipelineHandle] {
        &self.running
    }

    /// Every started pipeline thread has exited
    pub fn is_terminated(&self) -> bool {
        self.running.iter().all(PipelineHandle::is_terminated)
    }

    /// Ask every running pipeline to stop without waiting.
    pub fn request_stop(&self) {
        for pipeline in &self.running {
            pipeline.stop();
        }
    }

    /// Stop everything, waiting up to 20 checks 2 s apart.
    pub fn shutdown(&mut self) -> bool {
        self.shutdown_with(SHUTDOWN_ATTEMPTS, SHUTDOWN_DELAY)
    }

    /// Stop everything; returns whether every pipeline and stage came down.
    pub fn shutdown_with(&mut self, attempts: u32, delay: Duration) -> bool {
        for mut pipeline in self.idle.drain(..) {
            pipeline.shutdown_stages();
        }
        self.request_stop();

        let mut clean = self.running.iter().all(PipelineHandle::is_down);
        let mut attempt = 0;
        while !clean && attempt < attempts {
            thread::sleep(delay);
            attempt += 1;
            clean = self.running.iter().all(PipelineHandle::is_down);
        }

        for pipeline in self.running.drain(..) {
            if pipeline.is_terminated() {
                pipeline.join();
            } else {
                warn!(pipeline = %pipeline.name(), "Pipeline did not stop");
            }
        }
        self.quarantines.clear();

        if clean {
            info!("All pipelines stopped");
        } else {
            warn!("Shutdown incomplete");
        }
        clean
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        if !self.running.is_empty() || !self.idle.is_empty() {
            self.shutdown();
        }
    }
}

fn shared_quarantine(
    quarantines: &mut HashMap<PathBuf, Arc<Quarantine>>,
    dir: PathBuf,
) -> Result<Arc<Quarantine>> {
    if let Some(existing) = quarantines.get(&dir) {
        return Ok(existing.clone());
    }
    let quarantine = Arc::new(Quarantine::open(dir.clone())?);
    quarantines.insert(dir, quarantine.clone());
    Ok(quarantine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{null_sender, Event, EventChannel, PipelineEvent};
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Configuration {
        let text = r#"{ "pipelines": [{
            "name": "main",
            "quarantine": "quarantine",
            "stages": [
                { "type": "QueueImportService", "id": "inbox", "root": "roots/inbox" },
                { "type": "ObjectLogger", "root": "roots/log" },
                { "type": "DirectoryStorageService", "id": "store", "root": "roots/store",
                  "store": "archive" }
            ]
        }]}"#;
        Configuration::parse(text, dir.path()).unwrap()
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn builds_the_stage_directory() {
        let dir = TempDir::new().unwrap();
        let app = Application::from_config(&config(&dir), null_sender()).unwrap();

        let ids: Vec<&str> = app.stages().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["inbox", "main/1", "store"]);
        assert!(app.receiver("inbox").is_some());
        assert!(app.receiver("store").is_none());
        assert!(app.receiver("nope").is_none());
        assert_eq!(app.status()[1].name, "ObjectLogger");
    }

    #[test]
    fn stages_share_the_pipeline_quarantine() {
        let dir = TempDir::new().unwrap();
        let app = Application::from_config(&config(&dir), null_sender()).unwrap();

        assert_eq!(app.quarantines().len(), 1);
        let first = app.stage("inbox").unwrap().quarantine().unwrap();
        let last = app.stage("store").unwrap().quarantine().unwrap();
        assert!(Arc::ptr_eq(first, last));
        assert!(app.quarantine(&dir.path().join("quarantine")).is_some());
    }

    #[test]
    fn runs_objects_and_shuts_down_cleanly() {
        let dir = TempDir::new().unwrap();
        let (sender, receiver) = EventChannel::new();
        let mut app = Application::from_config(&config(&dir), sender).unwrap();

        let file = dir.path().join("report.txt");
        fs::write(&file, b"hello").unwrap();
        app.receiver("inbox").unwrap().file_received(&file).unwrap();

        app.start().unwrap();
        let archive = dir.path().join("archive/file");
        assert!(wait_for(|| fs::read_dir(&archive)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)));

        assert!(app.shutdown_with(50, Duration::from_millis(100)));
        assert!(app.is_terminated());
        assert!(app.status().iter().all(|status| status.down));
        assert!(app.quarantines().is_empty());

        let events: Vec<Event> = receiver.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Pipeline(PipelineEvent::Stopped { pipeline }) if pipeline == "main"
        )));
    }

    #[test]
    fn unknown_stage_types_fail_the_build() {
        let dir = TempDir::new().unwrap();
        let text = r#"{ "pipelines": [{ "name": "main", "stages": [
            { "type": "QueueImportService", "root": "a" },
            { "type": "DicomExportService", "root": "b" }
        ]}]}"#;
        let config = Configuration::parse(text, dir.path()).unwrap();

        assert!(Application::from_config(&config, null_sender()).is_err());
    }

    #[test]
    fn shutdown_without_start_downs_every_stage() {
        let dir = TempDir::new().unwrap();
        let mut app = Application::from_config(&config(&dir), null_sender()).unwrap();

        assert!(app.shutdown_with(1, Duration::from_millis(1)));
        assert!(app.status().iter().all(|status| status.down));
    }
}
