//! Run command - keeps the engine alive until a shutdown signal

use std::path::PathBuf;

use clap::Args;
use tokio::signal;
use tracing::{info, warn};

use super::{bootstrap, load_templates};

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Directory of JSON process templates
    #[arg(long, default_value = "demos")]
    pub templates: PathBuf,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = bootstrap();

    let templates = load_templates(&args.templates)?;
    let app = crate::create_flow_app(&config, templates).await?;
    info!(
        templates = app.service.list_templates().await?.len(),
        "Flow engine running, press Ctrl+C to stop"
    );

    shutdown_signal().await;

    let dead_letters = app.service.dead_letters().await;
    if !dead_letters.is_empty() {
        warn!(count = dead_letters.len(), "Dead-lettered messages at shutdown");
        for letter in &dead_letters {
            warn!(
                kind = letter.message.kind(),
                instance_id = %letter.message.instance_id(),
                attempts = letter.attempts,
                error = %letter.error,
                "Dead letter"
            );
        }
    }

    app.shutdown().await;
    info!("Flow engine shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
