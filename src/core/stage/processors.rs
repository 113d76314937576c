//! Built-in processor stages.

use super::{Capability, PipelineStage, Processor, StageCore};
use crate::core::filter::ObjectFilter;
use crate::core::object::FileObject;
use crate::error::StageError;
use std::path::PathBuf;
use tracing::{debug, info};

/// Logs objects as they pass; never consumes anything.
///
/// Objects of a type the stage does not accept pass through unlogged.
pub struct ObjectLogger {
    core: StageCore,
    /// Log one object in every `interval`
    interval: u64,
    seen: u64,
}

impl ObjectLogger {
    pub fn new(core: StageCore, interval: u64) -> Self {
        Self {
            core,
            interval: interval.max(1),
            seen: 0,
        }
    }
}

impl PipelineStage for ObjectLogger {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

impl Processor for ObjectLogger {
    fn process(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError> {
        if !self.core.accepts(&object) {
            return Ok(Some(object));
        }

        self.seen += 1;
        self.core.monitor().file_received();
        if self.seen % self.interval == 0 {
            info!(
                stage = %self.core.name(),
                count = self.seen,
                kind = %object.kind(),
                uid = %object.uid(),
                patient = object.patient_id().unwrap_or("-"),
                name = %object.embedded_name(),
                size = object.size(),
                "Object"
            );
        }
        self.core.monitor().file_processed();
        Ok(Some(object))
    }
}

/// Passes objects that satisfy a filter script and rejects the rest.
///
/// Rejected objects are quarantined, or deleted without a quarantine, and
/// go no further down the pipeline. Objects of a type the stage does not
/// accept pass through untested.
pub struct ScriptFilter {
    core: StageCore,
    script: PathBuf,
    filter: ObjectFilter,
}

impl ScriptFilter {
    /// Load the filter from `script`. A missing script passes everything.
    pub fn new(core: StageCore, script: impl Into<PathBuf>) -> Result<Self, StageError> {
        let script = script.into();
        let filter = ObjectFilter::load(&script)?.unwrap_or_default();
        Ok(Self {
            core,
            script,
            filter,
        })
    }
}

impl PipelineStage for ScriptFilter {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Scriptable]
    }

    fn scripts(&self) -> Vec<PathBuf> {
        vec![self.script.clone()]
    }
}

impl Processor for ScriptFilter {
    fn process(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError> {
        if !self.core.accepts(&object) {
            return Ok(Some(object));
        }

        self.core.monitor().file_received();
        if self.filter.matches(&object) {
            self.core.monitor().file_processed();
            return Ok(Some(object));
        }

        debug!(stage = %self.core.name(), name = %object.embedded_name(), "Object rejected by filter");
        self.core.reject(object)?;
        Ok(None)
    }
}
