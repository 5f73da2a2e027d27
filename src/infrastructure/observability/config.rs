//! Observability configuration

use serde::Deserialize;

/// Prometheus exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics
    #[serde(default)]
    pub enabled: bool,
    /// Address the scrape endpoint listens on
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_listen(),
        }
    }
}
