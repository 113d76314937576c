//! Event type definitions for pipeline reporting.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All events emitted by pipelines and their stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Pipeline lifecycle events
    Pipeline(PipelineEvent),
    /// Per-object events
    Object(ObjectEvent),
}

/// Pipeline lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// The pipeline thread started its loop
    Started { pipeline: String },
    /// The pipeline stopped and its stages were shut down
    Stopped { pipeline: String },
    /// A stage failed and the pipeline is stopping
    Failed { pipeline: String, message: String },
}

/// Events about individual objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectEvent {
    /// An import stage delivered an object to the pipeline
    Received {
        pipeline: String,
        stage: String,
        path: PathBuf,
    },
    /// A stage consumed the object; later stages will not see it
    Consumed { pipeline: String, stage: String },
    /// An object was moved or copied into a quarantine
    Quarantined { stage: String, path: PathBuf },
    /// A storage stage stored the object
    Stored { stage: String, path: PathBuf },
    /// An export stage queued the object for transmission
    Queued { stage: String, path: PathBuf },
    /// An exporter transmitted a file
    Exported { stage: String, path: PathBuf },
    /// An exporter gave up on a file
    ExportFailed { stage: String, path: PathBuf },
    /// An exporter sent a file back to the end of its queue
    Retried { stage: String, path: PathBuf },
}

impl std::fmt::Display for ObjectEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectEvent::Received { stage, path, .. } => {
                write!(f, "{}: received {}", stage, path.display())
            }
            ObjectEvent::Consumed { stage, .. } => write!(f, "{}: consumed object", stage),
            ObjectEvent::Quarantined { stage, path } => {
                write!(f, "{}: quarantined {}", stage, path.display())
            }
            ObjectEvent::Stored { stage, path } => write!(f, "{}: stored {}", stage, path.display()),
            ObjectEvent::Queued { stage, path } => write!(f, "{}: queued {}", stage, path.display()),
            ObjectEvent::Exported { stage, path } => {
                write!(f, "{}: exported {}", stage, path.display())
            }
            ObjectEvent::ExportFailed { stage, path } => {
                write!(f, "{}: export failed for {}", stage, path.display())
            }
            ObjectEvent::Retried { stage, path } => {
                write!(f, "{}: will retry {}", stage, path.display())
            }
        }
    }
}
