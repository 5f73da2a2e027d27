use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::infrastructure::observability::MetricsConfig;
use crate::infrastructure::process::RuntimeConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// Team name to member ids, used when resolving participants
    #[serde(default)]
    pub teams: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub timer_interval_ms: u64,
    pub lock_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_redeliveries: u32,
    pub redelivery_delay_ms: u64,
    pub script_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timer_interval_ms: 1000,
            lock_ttl_secs: 600,
            sweep_interval_secs: 60,
            max_redeliveries: 5,
            redelivery_delay_ms: 200,
            script_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            workers: self.workers,
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_redeliveries: self.max_redeliveries,
            redelivery_delay: Duration::from_millis(self.redelivery_delay_ms),
        }
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms.max(1))
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }
}

/// External interpreter for SCRIPT nodes; the code is passed as the last argument
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
        }
    }
}

/// Webhook target for assignment notifications; logged only when unset
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
    pub secret: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            secret: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("FLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
