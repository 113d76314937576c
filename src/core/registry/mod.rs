//! # Registry Module
//!
//! Maps stage type names from the configuration to constructors.
//!
//! The built-in table covers every stage this crate ships. Applications
//! embedding the crate can [`StageRegistry::register`] their own.

use crate::config::{Configuration, StageConfig};
use crate::core::stage::{
    DirectoryExportService, DirectoryImportService, DirectoryStorageService, ExportOptions,
    ObjectLogger, QueueImportService, ScriptFilter, Stage, StageCore, StageKind, StageSettings,
};
use crate::error::{ConfigError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a factory needs to build one stage
pub struct StageContext<'a> {
    pub config: &'a StageConfig,
    pub settings: StageSettings,
    configuration: &'a Configuration,
}

impl<'a> StageContext<'a> {
    pub fn new(
        configuration: &'a Configuration,
        config: &'a StageConfig,
        settings: StageSettings,
    ) -> Self {
        Self {
            config,
            settings,
            configuration,
        }
    }

    /// A path parameter resolved against the configuration directory
    pub fn path(&self, key: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .config
            .path_param(key)?
            .map(|p| self.configuration.resolve(&p)))
    }

    pub fn required_path(&self, key: &str) -> Result<PathBuf> {
        let path = self.config.required_path(key)?;
        Ok(self.configuration.resolve(&path))
    }

    pub fn millis(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.config.u64_param(key)?.map(Duration::from_millis))
    }

    /// Create the stage core, and with it the stage's root directory.
    pub fn into_core(self, kind: StageKind) -> Result<StageCore> {
        Ok(StageCore::new(self.settings, kind)?)
    }
}

/// Builds a stage from its configuration
pub type StageFactory = fn(StageContext<'_>) -> Result<Stage>;

const BUILTIN: &[(&str, StageKind, StageFactory)] = &[
    ("DirectoryImportService", StageKind::Import, directory_import),
    ("QueueImportService", StageKind::Import, queue_import),
    ("ObjectLogger", StageKind::Processor, object_logger),
    ("ScriptFilter", StageKind::Processor, script_filter),
    ("DirectoryStorageService", StageKind::Storage, directory_storage),
    ("DirectoryExportService", StageKind::Export, directory_export),
];

/// Stage type name to factory
#[derive(Clone)]
pub struct StageRegistry {
    factories: HashMap<String, (StageKind, StageFactory)>,
}

impl StageRegistry {
    /// A registry with no stage types
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the built-in stage types
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (name, kind, factory) in BUILTIN {
            registry.register(name, *kind, *factory);
        }
        registry
    }

    pub fn register(&mut self, stage_type: &str, kind: StageKind, factory: StageFactory) {
        self.factories
            .insert(stage_type.to_string(), (kind, factory));
    }

    /// Kind of stage a registered type builds
    pub fn kind(&self, stage_type: &str) -> Option<StageKind> {
        self.factories.get(stage_type).map(|(kind, _)| *kind)
    }

    /// Queue directory that files quarantined by stage `id` are requeued
    /// into.
    ///
    /// Import and export stages take them back into their own queue. Other
    /// stages hand them to the nearest import stage before them, so the
    /// files run through the pipeline again.
    pub fn requeue_dir(&self, config: &Configuration, id: &str) -> Result<PathBuf> {
        let (pipeline, index, stage) = config.find_stage(id).ok_or_else(|| {
            ConfigError::UnknownStage {
                id: id.to_string(),
            }
        })?;

        let target = match self.kind(&stage.stage_type) {
            Some(StageKind::Import | StageKind::Export) => Some(stage),
            _ => pipeline.stages[..index]
                .iter()
                .rev()
                .find(|earlier| self.kind(&earlier.stage_type) == Some(StageKind::Import)),
        };
        target
            .map(|stage| config.queue_dir(stage))
            .ok_or_else(|| ConfigError::NoQueue { id: id.to_string() }.into())
    }

    pub fn contains(&self, stage_type: &str) -> bool {
        self.factories.contains_key(stage_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build a stage of the configured type.
    pub fn build(&self, pipeline: &str, context: StageContext<'_>) -> Result<Stage> {
        let stage_type = context.config.stage_type.as_str();
        let (_, factory) = self
            .factories
            .get(stage_type)
            .ok_or_else(|| ConfigError::UnknownStageType {
                pipeline: pipeline.to_string(),
                stage_type: stage_type.to_string(),
            })?;
        factory(context)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn directory_import(context: StageContext<'_>) -> Result<Stage> {
    let import_dir = context.required_path("import_dir")?;
    let min_age = context.millis("min_age")?;
    let poll = context.millis("poll_interval")?;
    let core = context.into_core(StageKind::Import)?;

    let mut service = DirectoryImportService::new(core, import_dir)?;
    if let Some(min_age) = min_age {
        service = service.with_min_age(min_age);
    }
    if let Some(poll) = poll {
        service = service.with_poll_interval(poll);
    }
    Ok(Stage::import(service))
}

fn queue_import(context: StageContext<'_>) -> Result<Stage> {
    let core = context.into_core(StageKind::Import)?;
    Ok(Stage::import(QueueImportService::new(core)?))
}

fn object_logger(context: StageContext<'_>) -> Result<Stage> {
    let interval = context.config.u64_param("interval")?.unwrap_or(1);
    let core = context.into_core(StageKind::Processor)?;
    Ok(Stage::processor(ObjectLogger::new(core, interval)))
}

fn script_filter(context: StageContext<'_>) -> Result<Stage> {
    let script = context.required_path("script")?;
    let core = context.into_core(StageKind::Processor)?;
    Ok(Stage::processor(ScriptFilter::new(core, script)?))
}

fn directory_storage(context: StageContext<'_>) -> Result<Stage> {
    let store = context.path("store")?;
    let core = context.into_core(StageKind::Storage)?;
    let store = store.unwrap_or_else(|| core.root().join("store"));
    Ok(Stage::storage(DirectoryStorageService::new(core, store)))
}

fn directory_export(context: StageContext<'_>) -> Result<Stage> {
    let destination = context.required_path("destination")?;
    let mut options = ExportOptions {
        dicom_script: context.path("dicom_script")?,
        xml_script: context.path("xml_script")?,
        zip_script: context.path("zip_script")?,
        quarantine_filtered: context
            .config
            .bool_param("quarantine_filtered")?
            .unwrap_or(false),
        ..ExportOptions::default()
    };
    if let Some(interval) = context.millis("interval")? {
        options = options.with_interval(interval);
    }
    if let Some(throttle) = context.millis("throttle")? {
        options = options.with_throttle(throttle);
    }
    if let Some(cache_size) = context.config.u64_param("cache_size")? {
        options = options.with_cache(cache_size as usize);
    }

    let core = context.into_core(StageKind::Export)?;
    Ok(Stage::export(DirectoryExportService::to_directory(
        core,
        options,
        destination,
    )?))
}
