//! # CLI Module
//!
//! Command-line interface for medflow.
//!
//! ## Usage
//! ```bash
//! # Run every pipeline until Enter is pressed
//! medflow run --config config.json
//!
//! # Queue and quarantine sizes per stage
//! medflow status --config config.json --output json
//!
//! # Inspect and manage a stage's quarantine
//! medflow quarantine list --stage import --max-age 3600
//! medflow quarantine requeue --stage import --name Q-1234[ct.dcm]
//! medflow quarantine purge --stage import --older-than 604800
//!
//! # Count queued files
//! medflow queue count --stage export
//! ```
//!
//! Only `run` starts stages. The other commands read the directories the
//! configuration names, so they are safe next to a running instance.

use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use medflow::config::{Configuration, PipelineConfig, StageConfig};
use medflow::core::quarantine::{Quarantine, QuarantinedFile};
use medflow::core::queue::QueueManager;
use medflow::core::registry::StageRegistry;
use medflow::core::Application;
use medflow::error::{ConfigError, Result};
use medflow::events::{Event, EventChannel, ObjectEvent, PipelineEvent};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

/// medflow - durable pipelines for medical image files
#[derive(Parser, Debug)]
#[command(name = "medflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every configured pipeline
    Run,

    /// Show every stage with its queue and quarantine sizes
    Status {
        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,
    },

    /// Manage quarantined files
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },

    /// Inspect stage queues
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug)]
enum QuarantineAction {
    /// List quarantined files, oldest first
    List {
        /// Stage id
        #[arg(short, long)]
        stage: String,

        /// Only files quarantined within this many seconds
        #[arg(long)]
        max_age: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,
    },

    /// Move quarantined files back into a queue: the stage's own, or the
    /// nearest import stage's before it
    Requeue {
        /// Stage id
        #[arg(short, long)]
        stage: String,

        /// One file; every file when omitted
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Delete quarantined files
    Delete {
        /// Stage id
        #[arg(short, long)]
        stage: String,

        /// One file; every file when omitted
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Delete files quarantined longer than the given age
    Purge {
        /// Stage id
        #[arg(short, long)]
        stage: String,

        /// Age in seconds
        #[arg(long)]
        older_than: u64,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Count the files waiting in a stage's queue
    Count {
        /// Stage id
        #[arg(short, long)]
        stage: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with colors
    Pretty,
    /// JSON output for scripting
    Json,
}

/// Run the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        medflow::init_tracing_with_default("debug");
    } else {
        medflow::init_tracing_with_default("info");
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Configuration::load(&config_path)?;

    match cli.command {
        Commands::Run => run_pipelines(&config, cli.verbose),
        Commands::Status { output } => print_status(&config, output),
        Commands::Quarantine { action } => run_quarantine(&config, action),
        Commands::Queue {
            action: QueueAction::Count { stage },
        } => {
            let (_, _, stage_config) = find_stage(&config, &stage)?;
            println!("{}", count_files(&config.queue_dir(stage_config)));
            Ok(())
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("medflow")
        .join("config.json")
}

fn run_pipelines(config: &Configuration, verbose: bool) -> Result<()> {
    let term = Term::stderr();
    term.write_line(&format!(
        "{} {}",
        style("medflow").bold().cyan(),
        style(env!("CARGO_PKG_VERSION")).dim()
    ))
    .ok();

    let (sender, receiver) = EventChannel::new();
    let mut app = Application::from_config(config, sender)?;
    app.start()?;

    term.write_line(&format!(
        "  {} pipelines running, {} stages",
        style(config.pipelines.len()).cyan(),
        style(app.stages().len()).cyan()
    ))
    .ok();

    // Render events in a separate thread
    let event_term = term.clone();
    let event_thread = thread::spawn(move || {
        for event in receiver.iter() {
            match &event {
                Event::Pipeline(PipelineEvent::Failed { .. }) => {
                    event_term
                        .write_line(&format!("{} {}", style("✗").red().bold(), event))
                        .ok();
                }
                Event::Pipeline(_) => {
                    event_term
                        .write_line(&format!("{} {}", style("•").cyan(), event))
                        .ok();
                }
                Event::Object(ObjectEvent::ExportFailed { .. })
                | Event::Object(ObjectEvent::Quarantined { .. }) => {
                    event_term
                        .write_line(&format!("{} {}", style("!").yellow(), event))
                        .ok();
                }
                Event::Object(_) if verbose => {
                    event_term
                        .write_line(&format!("  {}", style(&event).dim()))
                        .ok();
                }
                Event::Object(_) => {}
            }
        }
    });

    let stdout = Term::stdout();
    if stdout.is_term() {
        term.write_line(&format!("{}", style("Press Enter to stop").dim()))
            .ok();
        stdout.read_line().ok();
    } else {
        while !app.is_terminated() {
            thread::sleep(Duration::from_secs(1));
        }
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("Stopping pipelines...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let clean = app.shutdown();
    spinner.finish_and_clear();

    // The event thread ends once the last sender is gone, which only
    // happens when every pipeline thread has exited
    drop(app);
    if clean {
        event_thread.join().ok();
    }

    if clean {
        term.write_line(&format!("{} All pipelines stopped", style("✓").green().bold()))
            .ok();
    } else {
        term.write_line(&format!(
            "{} Some stages did not stop; files in flight stay in their active directories",
            style("!").yellow().bold()
        ))
        .ok();
    }
    Ok(())
}

/// Directory-derived view of one stage
#[derive(Debug, serde::Serialize)]
struct StageSummary {
    id: String,
    pipeline: String,
    stage_type: String,
    root: PathBuf,
    queue_size: usize,
    quarantine: Option<PathBuf>,
    quarantine_size: Option<usize>,
}

fn print_status(config: &Configuration, output: OutputFormat) -> Result<()> {
    let mut summaries = Vec::new();
    for pipeline in &config.pipelines {
        for (index, stage) in pipeline.stages.iter().enumerate() {
            let quarantine = config.quarantine_dir(pipeline, stage);
            summaries.push(StageSummary {
                id: Configuration::stage_id(pipeline, index),
                pipeline: pipeline.name.clone(),
                stage_type: stage.stage_type.clone(),
                root: config.resolve(&stage.root),
                queue_size: count_files(&config.queue_dir(stage)),
                quarantine_size: quarantine.as_deref().map(count_quarantined),
                quarantine,
            });
        }
    }

    match output {
        OutputFormat::Json => print_json(&summaries),
        OutputFormat::Pretty => {
            let term = Term::stdout();
            let mut current = None;
            for summary in &summaries {
                if current != Some(&summary.pipeline) {
                    term.write_line(&format!(
                        "{}",
                        style(format!("Pipeline {}", summary.pipeline)).bold().underlined()
                    ))
                    .ok();
                    current = Some(&summary.pipeline);
                }
                let quarantined = summary
                    .quarantine_size
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string());
                term.write_line(&format!(
                    "  {:<24} {:<26} queued {:>6}  quarantined {:>6}",
                    style(&summary.id).cyan(),
                    summary.stage_type,
                    summary.queue_size,
                    quarantined
                ))
                .ok();
            }
        }
    }
    Ok(())
}

fn run_quarantine(config: &Configuration, action: QuarantineAction) -> Result<()> {
    match action {
        QuarantineAction::List {
            stage,
            max_age,
            output,
        } => {
            let quarantine = open_quarantine(config, &stage)?;
            let files = match max_age {
                Some(seconds) => quarantine.files_newer_than(Duration::from_secs(seconds))?,
                None => quarantine.files()?,
            };
            match output {
                OutputFormat::Json => print_json(&files),
                OutputFormat::Pretty => print_quarantined(&files),
            }
        }
        QuarantineAction::Requeue { stage, name } => {
            let quarantine = open_quarantine(config, &stage)?;
            let dir = StageRegistry::builtin().requeue_dir(config, &stage)?;
            let queue = QueueManager::with_defaults(dir)?;
            let queued = match name {
                Some(name) => {
                    quarantine.queue_file(&name, &queue)?;
                    1
                }
                None => quarantine.queue_all(&queue)?,
            };
            println!("{} file(s) requeued", queued);
        }
        QuarantineAction::Delete { stage, name } => {
            let quarantine = open_quarantine(config, &stage)?;
            let deleted = match name {
                Some(name) => {
                    quarantine.delete_file(&name)?;
                    1
                }
                None => quarantine.delete_all()?,
            };
            println!("{} file(s) deleted", deleted);
        }
        QuarantineAction::Purge { stage, older_than } => {
            let quarantine = open_quarantine(config, &stage)?;
            let purged = quarantine.purge_older_than(Duration::from_secs(older_than))?;
            println!("{} file(s) purged", purged);
        }
    }
    Ok(())
}

fn print_quarantined(files: &[QuarantinedFile]) {
    let term = Term::stdout();
    if files.is_empty() {
        term.write_line(&format!("{}", style("Quarantine is empty").dim()))
            .ok();
        return;
    }
    for file in files {
        term.write_line(&format!(
            "  {}  {:<40} {:>10}  {}",
            style(file.quarantined_at.format("%Y-%m-%d %H:%M:%S")).dim(),
            file.name,
            format_bytes(file.size),
            style(&file.embedded_name).cyan()
        ))
        .ok();
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Could not serialize output: {}", e),
    }
}

fn find_stage<'a>(
    config: &'a Configuration,
    id: &str,
) -> Result<(&'a PipelineConfig, usize, &'a StageConfig)> {
    config.find_stage(id).ok_or_else(|| {
        ConfigError::UnknownStage {
            id: id.to_string(),
        }
        .into()
    })
}

fn open_quarantine(config: &Configuration, id: &str) -> Result<Quarantine> {
    let (pipeline, _, stage) = find_stage(config, id)?;
    let dir = config
        .quarantine_dir(pipeline, stage)
        .ok_or_else(|| ConfigError::NoQuarantine { id: id.to_string() })?;
    Ok(Quarantine::open(dir)?)
}

fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

fn count_quarantined(dir: &Path) -> usize {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
