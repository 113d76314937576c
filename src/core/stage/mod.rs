//! # Stage Module
//!
//! The four kinds of pipeline stage and the concrete stages built on them.
//!
//! ## Kinds
//! - **Import** - yields objects into a pipeline from its own durable queue
//! - **Processor** - inspects or transforms an object, or consumes it
//! - **Storage** - persists an object, or consumes it
//! - **Export** - queues an object for transmission by a background worker
//!
//! A pipeline holds its stages as [`Stage`] values and dispatches on the
//! kind with a `match`; there is no runtime type inspection.
//!
//! ## Directory layout
//! Every stage owns a root directory. Queue-backed stages use
//! `root/queue`, `root/active` and `root/temp` under it.

mod common;
mod directory_export;
mod directory_import;
mod export;
mod import;
mod processors;
mod queue_import;
mod storage;

pub use common::{AcceptFlags, StageCore, StageMonitor, StageSettings, StageStatus};
pub use directory_export::{DirectoryExportService, DirectoryExporter};
pub use directory_import::{DirectoryImportService, DEFAULT_MIN_AGE, DEFAULT_POLL_INTERVAL};
pub use export::{
    BatchOutcome, ExportOptions, ExportQueue, ExportStage, ExportStatus, Exporter,
    DEFAULT_EXPORT_INTERVAL, MAX_CONSECUTIVE_RETRIES,
};
pub use import::ImportQueue;
pub use processors::{ObjectLogger, ScriptFilter};
pub use queue_import::QueueImportService;
pub use storage::DirectoryStorageService;

use crate::core::object::FileObject;
use crate::error::StageError;
use crate::events::EventSender;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which of the four stage contracts a stage implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Import,
    Processor,
    Storage,
    Export,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Import => "import",
            StageKind::Processor => "processor",
            StageKind::Storage => "storage",
            StageKind::Export => "export",
        };
        write!(f, "{}", name)
    }
}

/// Optional features a stage exposes to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Behaviour is driven by filter scripts; see [`PipelineStage::scripts`]
    Scriptable,
    /// Accepts files from outside the pipeline; see [`PipelineStage::receiver`]
    Receiver,
}

/// Where a stage sits in its pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLink {
    pub pipeline: String,
    pub index: usize,
    pub previous: Option<usize>,
    pub next: Option<usize>,
}

/// Behaviour common to every stage
pub trait PipelineStage: Send {
    fn core(&self) -> &StageCore;

    fn core_mut(&mut self) -> &mut StageCore;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Filter scripts this stage evaluates
    fn scripts(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Entry point for files handed over from outside the pipeline
    fn receiver(&self) -> Option<Arc<ImportQueue>> {
        None
    }

    /// Called by the pipeline builder once the stage is placed.
    fn link(&mut self, link: StageLink, events: EventSender) {
        self.core().monitor().set_capabilities(self.capabilities());
        self.core_mut().attach(link, events);
    }

    /// Start any background work. Called once, before the first object.
    fn start(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Stop background work; `is_down` reports true once it has stopped.
    fn shutdown(&mut self) {
        self.core().monitor().set_down();
    }

    fn is_down(&self) -> bool {
        self.core().monitor().is_down()
    }

    fn status(&self) -> StageStatus {
        self.core().monitor().status()
    }
}

/// A stage that delivers objects into the pipeline
pub trait ImportService: PipelineStage {
    /// The next accepted object, if any. Unaccepted objects found on the
    /// way are quarantined or deleted.
    fn next_object(&mut self) -> Result<Option<FileObject>, StageError>;

    /// Remove the active copy of a file once the pipeline is done with it.
    fn release(&mut self, file: &Path);
}

/// A stage that inspects an object and passes it on, or consumes it
pub trait Processor: PipelineStage {
    /// `Ok(None)` ends processing of this object in the pipeline.
    fn process(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError>;
}

/// A stage that persists an object
pub trait StorageService: PipelineStage {
    /// `Ok(None)` ends processing of this object in the pipeline.
    fn store(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError>;
}

/// A stage that queues objects for background transmission
pub trait ExportService: PipelineStage {
    /// Queue a copy of the object. The object itself always continues down
    /// the pipeline.
    fn export(&mut self, object: &FileObject) -> Result<(), StageError>;
}

/// A stage as held by a pipeline
pub enum Stage {
    Import(Box<dyn ImportService>),
    Processor(Box<dyn Processor>),
    Storage(Box<dyn StorageService>),
    Export(Box<dyn ExportService>),
}

macro_rules! each_stage {
    ($stage:expr, $inner:ident => $body:expr) => {
        match $stage {
            Stage::Import($inner) => $body,
            Stage::Processor($inner) => $body,
            Stage::Storage($inner) => $body,
            Stage::Export($inner) => $body,
        }
    };
}

impl Stage {
    pub fn import(stage: impl ImportService + 'static) -> Self {
        Stage::Import(Box::new(stage))
    }

    pub fn processor(stage: impl Processor + 'static) -> Self {
        Stage::Processor(Box::new(stage))
    }

    pub fn storage(stage: impl StorageService + 'static) -> Self {
        Stage::Storage(Box::new(stage))
    }

    pub fn export(stage: impl ExportService + 'static) -> Self {
        Stage::Export(Box::new(stage))
    }

    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Import(_) => StageKind::Import,
            Stage::Processor(_) => StageKind::Processor,
            Stage::Storage(_) => StageKind::Storage,
            Stage::Export(_) => StageKind::Export,
        }
    }

    pub fn id(&self) -> &str {
        each_stage!(self, s => s.core().id())
    }

    pub fn name(&self) -> &str {
        each_stage!(self, s => s.core().name())
    }

    pub fn monitor(&self) -> Arc<StageMonitor> {
        each_stage!(self, s => s.core().monitor().clone())
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        each_stage!(self, s => s.capabilities())
    }

    pub fn scripts(&self) -> Vec<PathBuf> {
        each_stage!(self, s => s.scripts())
    }

    pub fn receiver(&self) -> Option<Arc<ImportQueue>> {
        each_stage!(self, s => s.receiver())
    }

    pub fn link(&mut self, link: StageLink, events: EventSender) {
        each_stage!(self, s => s.link(link, events))
    }

    pub fn start(&mut self) -> Result<(), StageError> {
        each_stage!(self, s => s.start())
    }

    pub fn shutdown(&mut self) {
        each_stage!(self, s => s.shutdown())
    }

    pub fn is_down(&self) -> bool {
        each_stage!(self, s => s.is_down())
    }

    pub fn status(&self) -> StageStatus {
        each_stage!(self, s => s.status())
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}
