//! # Pipeline Module
//!
//! Drives objects from import stages through a chain of stages.
//!
//! ## Lifecycle
//! 1. **Build** - stages are linked in configured order; at least one must
//!    be an import stage
//! 2. **Start** - every stage's `start()` runs, then the pipeline thread
//!    begins polling
//! 3. **Run** - import stages are polled in order; each object walks the
//!    chain until a stage consumes it, then its import copy is released
//! 4. **Stop** - on request, or on the first stage error or panic; stages
//!    are shut down in order
//!
//! ## Threads
//! One thread per pipeline. Export stages run their own worker threads and
//! import stages may run watcher threads; both talk to the pipeline only
//! through their on-disk queues.

mod control;
mod executor;

pub use control::PipelineHandle;
pub use executor::{Pipeline, PipelineBuilder, DEFAULT_IDLE_INTERVAL};
