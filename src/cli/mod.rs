//! CLI module for PMP Flow Engine
//!
//! - `run`: load templates and keep the engine running until shutdown
//! - `start`: start one instance, drive it until it waits, print its document

pub mod run;
pub mod start;

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::AppConfig;
use crate::domain::process::ProcessTemplate;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::observability::init_metrics;

/// PMP Flow Engine - business process orchestration
#[derive(Parser)]
#[command(name = "pmp-flow-engine")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the engine until Ctrl+C / SIGTERM
    Run(run::RunArgs),

    /// Start a single instance and print its state once it settles
    Start(start::StartArgs),
}

/// Load `.env`, configuration, logging and metrics
pub(crate) fn bootstrap() -> AppConfig {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration, using defaults: {}", e);
        AppConfig::default()
    });
    init_logging(&config.logging);
    init_metrics(&config.metrics);
    config
}

/// Parse every `*.json` file in `dir` as a process template
pub(crate) fn load_templates(dir: &Path) -> anyhow::Result<Vec<ProcessTemplate>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read template directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut templates = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let template: ProcessTemplate = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid template {}", path.display()))?;
        info!(template_id = %template.id(), path = %path.display(), "Loaded template");
        templates.push(template);
    }
    Ok(templates)
}
