//! # Medflow
//!
//! Durable file pipelines for medical images.
//!
//! Files arrive at import stages, are persisted in on-disk queues, pass
//! through processor and storage stages, and leave through export stages
//! that retry until the destination accepts them. Nothing lives only in
//! memory: a restart picks up every queued file where it was left.
//!
//! ## Architecture
//! - `core` - Queues, quarantines, stages, pipelines and the application context
//! - `config` - The JSON configuration file
//! - `events` - Event-driven progress reporting
//! - `error` - Error types

pub mod config;
pub mod core;
pub mod error;
pub mod events;

// Re-export commonly used types at the crate root
pub use error::{MedflowError, Result};

/// Initialize tracing for the library
///
/// This should be called by the application entry point.
pub fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default tracing subscriber");
}

/// Like [`init_tracing`], but uses `default` as the filter when `RUST_LOG`
/// is unset or invalid.
pub fn init_tracing_with_default(default: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default tracing subscriber");
}
