//! PMP Flow Engine
//!
//! A business-process engine that executes template-defined flows:
//! - Human ACTION nodes with participant resolution and voting
//! - AND/OR joins, loops with rounds, TIMER and SCRIPT nodes, sub-processes
//! - Revoke and sendback of completed steps
//! - Per-instance serialized message handling over a worker pool

pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::AppConfig;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use domain::process::{EngineError, ProcessRepository, ProcessTemplate, TemplateRepository};
use infrastructure::process::{
    CommandScriptExecutor, ExpressionParticipantResolver, InMemoryProcessRepository,
    InMemoryTemplateRepository, ProcessEngine, ProcessRuntime, TimerScanner, TracingNotifier,
    WebhookNotifier,
};
use infrastructure::services::ProcessService;

/// A running engine: runtime, timer scanner and the service in front of them
#[derive(Debug)]
pub struct FlowApp {
    pub service: Arc<ProcessService>,
    pub runtime: Arc<ProcessRuntime>,
    timer: JoinHandle<()>,
}

impl FlowApp {
    /// Stop the timer scanner and drain the runtime
    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
        if let Err(e) = self.timer.await {
            tracing::warn!(error = %e, "Timer scanner ended abnormally");
        }
        info!("Flow engine stopped");
    }
}

/// Build the engine with in-memory storage, register `templates` and start
/// the workers. Must be called from within a tokio runtime.
pub async fn create_flow_app(
    config: &AppConfig,
    templates: Vec<ProcessTemplate>,
) -> Result<FlowApp, EngineError> {
    let repository: Arc<dyn ProcessRepository> = Arc::new(InMemoryProcessRepository::new());
    let template_repository: Arc<dyn TemplateRepository> =
        Arc::new(InMemoryTemplateRepository::new());

    let mut engine = ProcessEngine::new(repository.clone(), template_repository.clone())
        .with_resolver(Arc::new(ExpressionParticipantResolver::new(config.teams.clone())))
        .with_script_executor(Arc::new(CommandScriptExecutor::new(
            &config.script.program,
            config.script.args.clone(),
        )))
        .with_script_timeout(config.engine.script_timeout());

    engine = match &config.notifier.webhook_url {
        Some(url) => engine.with_notifier(Arc::new(WebhookNotifier::new(
            url,
            config.notifier.secret.clone(),
            Duration::from_secs(config.notifier.timeout_secs),
        )?)),
        None => engine.with_notifier(Arc::new(TracingNotifier)),
    };

    let runtime = Arc::new(ProcessRuntime::start(
        Arc::new(engine),
        config.engine.runtime(),
    ));
    let service = Arc::new(ProcessService::new(
        runtime.clone(),
        repository.clone(),
        template_repository,
    ));

    for template in templates {
        if let Err(e) = service.register_template(template).await {
            runtime.shutdown().await;
            return Err(e);
        }
    }

    let timer = Arc::new(TimerScanner::new(
        repository,
        runtime.clone(),
        config.engine.timer_interval(),
    ))
    .spawn();

    info!(workers = config.engine.workers, "Flow engine ready");

    Ok(FlowApp {
        service,
        runtime,
        timer,
    })
}
