//! Import stage fed only by other components.

use super::{Capability, ImportQueue, ImportService, PipelineStage, StageCore};
use crate::core::object::FileObject;
use crate::error::StageError;
use std::path::Path;
use std::sync::Arc;

/// An import stage with no source of its own.
///
/// Files arrive through [`PipelineStage::receiver`]: an operator requeueing
/// from quarantine, a network listener, or another pipeline's stage.
pub struct QueueImportService {
    core: StageCore,
    queue: Arc<ImportQueue>,
}

impl QueueImportService {
    pub fn new(core: StageCore) -> Result<Self, StageError> {
        let queue = Arc::new(ImportQueue::open(&core)?);
        Ok(Self { core, queue })
    }
}

impl PipelineStage for QueueImportService {
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
}

impl ImportService for QueueImportService {
    fn next_object(&mut self) -> Result<Option<FileObject>, StageError> {
        self.queue.next_object()
    }

    fn release(&mut self, file: &Path) {
        self.queue.release(file);
    }
}
