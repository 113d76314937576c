//! # medflow CLI
//!
//! Command-line interface for medflow pipelines.
//!
//! ## Usage
//! ```bash
//! medflow run --config /etc/medflow/config.json
//! medflow status --output json
//! medflow quarantine list --stage import
//! ```

mod cli;

use medflow::Result;

fn main() -> Result<()> {
    cli::run()
}
