//! # Main Entry Point
//!
//! Command line front end for the streaming artifact protocol:
//! - `parse`: show how a saved model response is interpreted
//! - `replay`: stream a saved response through the pipeline into a sandbox
//! - `diff`: build the modification report for an edited file
//! - `instructions`: print the model-facing artifact instructions

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;

use blueprint::application::engine::{CommandOutput, ExecutionEngine};
use blueprint::application::pipeline::ArtifactPipeline;
use blueprint::application::shadow::ShadowFileStore;
use blueprint::application::{differ, logging, parsing};
use blueprint::domain::config::AppConfig;
use blueprint::domain::traits::{Sandbox, SandboxSlot};
use blueprint::domain::types::StepOutcome;
use blueprint::infrastructure::sandbox::local::LocalSandbox;
use blueprint::infrastructure::sandbox::memory::MemorySandbox;
use blueprint::strings::{logs, prompts};

#[derive(Parser, Debug)]
#[command(name = "blueprint", version, about = "Parse, apply and diff streamed model artifacts")]
struct Cli {
    /// Config file (defaults to data/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the parse of a saved model response as JSON
    Parse { file: PathBuf },

    /// Stream a saved model response through the pipeline and apply it
    Replay {
        file: PathBuf,
        /// Sandbox root (overrides sandbox.root)
        #[arg(long)]
        root: Option<PathBuf>,
        /// Characters per simulated chunk
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
        /// Apply to an in-memory sandbox instead of the file system
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value = "replay")]
        turn_id: String,
    },

    /// Print the modification report for an edited file
    Diff {
        original: PathBuf,
        current: PathBuf,
        /// Path reported in the block (defaults to CURRENT's file name)
        #[arg(long)]
        path: Option<String>,
        /// Prefix this user message with the report
        #[arg(long)]
        message: Option<String>,
    },

    /// Print the artifact instructions given to the model
    Instructions {
        #[arg(long, default_value = "/home/project")]
        work_dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration
    let config_path = AppConfig::locate(cli.config.as_deref());
    let config = AppConfig::load(config_path.as_deref())?;

    // 2. Logging
    let _guard = logging::init_logging(&config.logging)?;
    tracing::debug!("{}", logs::STARTING);
    tracing::debug!("{}", logs::config_loaded(config_path.as_deref()));

    match cli.command {
        Commands::Parse { file } => {
            let text = read_text(&file)?;
            let result = parsing::parse(&text);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Replay {
            file,
            root,
            chunk_size,
            dry_run,
            turn_id,
        } => {
            let text = read_text(&file)?;
            let root = root.unwrap_or_else(|| PathBuf::from(&config.sandbox.root));
            replay(&config, &text, &turn_id, &root, chunk_size.max(1), dry_run).await?;
        }
        Commands::Diff {
            original,
            current,
            path,
            message,
        } => {
            let before = read_optional(&original)?;
            let after = read_optional(&current)?;
            let path = path.unwrap_or_else(|| {
                current
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| current.display().to_string())
            });

            let modifications: Vec<_> = differ::diff(&path, &before, &after).into_iter().collect();
            match message {
                Some(message) => println!("{}", prompts::with_modifications(&modifications, &message)),
                None => println!("{}", differ::render_modifications(&modifications)),
            }
        }
        Commands::Instructions { work_dir } => {
            println!("{}", prompts::artifact_instructions(&work_dir));
        }
    }

    Ok(())
}

async fn replay(
    config: &AppConfig,
    text: &str,
    turn_id: &str,
    root: &Path,
    chunk_size: usize,
    dry_run: bool,
) -> Result<()> {
    let memory = dry_run.then(MemorySandbox::new);
    let sandbox: Arc<dyn Sandbox> = match &memory {
        Some(memory) => {
            tracing::info!("{}", logs::DRY_RUN);
            Arc::new(memory.clone())
        }
        None => {
            let local = LocalSandbox::open(root)
                .await
                .with_context(|| format!("Failed to open sandbox at {}", root.display()))?;
            tracing::info!("{}", logs::sandbox_ready(local.root()));
            Arc::new(local)
        }
    };

    // Simulated boot: the slot stays empty until the delay has passed.
    let slot = SandboxSlot::empty();
    let boot_delay = config.sandbox.boot_delay_ms;
    if boot_delay == 0 {
        slot.set(sandbox);
    } else {
        tracing::info!("{}", logs::sandbox_booting(boot_delay));
        let booting = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(boot_delay)).await;
            booting.set(sandbox);
        });
    }

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<CommandOutput>();
    tokio::spawn(async move {
        while let Some(output) = output_rx.recv().await {
            eprintln!("[{}] {}", output.command, output.line);
        }
    });

    let engine = Arc::new(
        ExecutionEngine::new(slot, ShadowFileStore::new(), config.engine.clone())
            .with_output(output_tx),
    );

    let abort_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, aborting running commands");
            abort_engine.abort_running();
        }
    });

    let pipeline = ArtifactPipeline::new(engine.clone());
    let chars: Vec<char> = text.chars().collect();
    for chunk in chars.chunks(chunk_size) {
        let chunk: String = chunk.iter().collect();
        pipeline.push_chunk(turn_id, &chunk).await;
    }

    let Some(record) = pipeline.finish(turn_id).await? else {
        tracing::info!("{}", logs::NO_ARTIFACT);
        println!("null");
        return Ok(());
    };

    let failed = record
        .steps
        .iter()
        .filter(|s| matches!(&s.outcome, Some(o) if *o != StepOutcome::Succeeded))
        .count();
    tracing::info!("{}", logs::replay_finished(turn_id, record.steps.len(), failed));

    let mut report = json!({ "turn": record });
    if let Some(memory) = memory {
        report["files"] = json!(memory.files());
        report["journal"] = json!(memory.journal());
    } else {
        report["shadow"] = json!(engine.shadow().paths().await);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// A missing file reads as empty, so `diff` also covers created and deleted files.
fn read_optional(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
