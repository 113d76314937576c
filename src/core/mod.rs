//! # Core Module
//!
//! The pipeline engine, independent of any front-end.
//!
//! ## Modules
//! - `queue` - Durable sharded on-disk queues
//! - `quarantine` - Holding area for rejected and failed files
//! - `object` - Typed view of a file (DICOM, XML, ZIP or generic)
//! - `filter` - Filter scripts evaluated against objects
//! - `stage` - Stage traits, shared stage plumbing and the built-in stages
//! - `pipeline` - Drives objects through a chain of stages
//! - `registry` - Stage type names to constructors
//! - `app` - Builds, starts and stops everything a configuration declares

pub mod app;
pub mod filter;
pub mod object;
pub mod pipeline;
pub mod quarantine;
pub mod queue;
pub mod registry;
pub mod stage;

// Re-export commonly used types
pub use app::Application;
pub use object::{FileObject, ObjectKind};
pub use pipeline::{Pipeline, PipelineHandle};
pub use quarantine::Quarantine;
pub use queue::QueueManager;
pub use stage::{Stage, StageKind, StageStatus};
