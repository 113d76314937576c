//! # Error Module
//!
//! Error types for the medflow pipeline.
//!
//! ## Design Principles
//! - **Never panic** on queued data - return errors instead
//! - **Include context** - paths, stage names, what went wrong
//! - **Failed means not done** - an operation that returns an error left no
//!   partial side effects behind

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application error
#[derive(Error, Debug)]
pub enum MedflowError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Quarantine error: {0}")]
    Quarantine(#[from] QuarantineError),

    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by the durable queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to create queue directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy {from} into the queue at {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read queue directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a regular file: {path}")]
    NotAFile { path: PathBuf },
}

/// Errors raised by a quarantine directory
#[derive(Error, Debug)]
pub enum QuarantineError {
    #[error("Failed to create quarantine directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to place {path} in quarantine: {source}")]
    Insert {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No quarantined file named {name}")]
    NotFound { name: String },

    #[error("Failed to read quarantine directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete quarantined file {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Requeue failed: {0}")]
    Requeue(#[from] QueueError),
}

/// Errors raised while opening or moving a file object
#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("Object file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read object {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move object {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy object {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while loading a filter script
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Failed to read filter script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Filter script line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Filter script line {line}: invalid pattern: {source}")]
    Pattern {
        line: usize,
        #[source]
        source: regex::Error,
    },
}

/// Errors raised by pipeline stages
///
/// An error that reaches the pipeline thread stops that pipeline.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Stage {stage} failed to initialise: {reason}")]
    Init { stage: String, reason: String },

    #[error("Stage {stage} could not start: {reason}")]
    Start { stage: String, reason: String },

    #[error("Stage {stage}: {source}")]
    Io {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Quarantine error: {0}")]
    Quarantine(#[from] QuarantineError),

    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}

/// Errors raised while loading or binding the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown stage type '{stage_type}' in pipeline '{pipeline}'")]
    UnknownStageType { pipeline: String, stage_type: String },

    #[error("Stage id '{id}' is used more than once")]
    DuplicateStageId { id: String },

    #[error("Pipeline '{pipeline}' has no import stage")]
    NoImportStage { pipeline: String },

    #[error("Stage '{stage}': parameter '{parameter}' {reason}")]
    InvalidParameter {
        stage: String,
        parameter: String,
        reason: String,
    },

    #[error("No stage with id '{id}'")]
    UnknownStage { id: String },

    #[error("Stage '{id}' has no quarantine")]
    NoQuarantine { id: String },

    #[error("Stage '{id}' has no queue")]
    NoQueue { id: String },
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, MedflowError>;
