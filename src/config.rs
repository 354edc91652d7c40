use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the blotter binary
#[derive(Debug, Clone, PartialEq)]
pub struct BlotterConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// CSV imported once at startup
    pub import_csv: Option<PathBuf>,
    /// CSV written at shutdown
    pub export_csv: Option<PathBuf>,
    pub slow_handler_threshold_ms: u64,
}

impl Default for BlotterConfig {
    fn default() -> Self {
        BlotterConfig {
            database_url: "sqlite://data/blotter.db".to_string(),
            database_max_connections: 5,
            import_csv: None,
            export_csv: None,
            slow_handler_threshold_ms: 250,
        }
    }
}

impl BlotterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BlotterConfig {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a configuration from any variable source; invalid values are
    /// logged and replaced by the default
    pub fn from_vars<F>(var: F) -> BlotterConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = BlotterConfig::default();

        if let Some(url) = var("DATABASE_URL") {
            if url.trim().is_empty() {
                tracing::warn!("Empty DATABASE_URL, using default: {}", config.database_url);
            } else {
                config.database_url = url;
            }
        }

        if let Some(connections) = var("DATABASE_MAX_CONNECTIONS") {
            match connections.parse::<u32>() {
                Ok(value) if (1..=32).contains(&value) => {
                    config.database_max_connections = value;
                }
                Ok(value) => {
                    tracing::warn!(
                        "Invalid DATABASE_MAX_CONNECTIONS value: {} (must be between 1 and 32), using default: {}",
                        value,
                        config.database_max_connections
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse DATABASE_MAX_CONNECTIONS '{}': {}, using default: {}",
                        connections,
                        e,
                        config.database_max_connections
                    );
                }
            }
        }

        if let Some(path) = var("IMPORT_CSV").filter(|p| !p.trim().is_empty()) {
            config.import_csv = Some(PathBuf::from(path));
        }

        if let Some(path) = var("EXPORT_CSV").filter(|p| !p.trim().is_empty()) {
            config.export_csv = Some(PathBuf::from(path));
        }

        if let Some(threshold) = var("SLOW_HANDLER_THRESHOLD_MS") {
            match threshold.parse::<u64>() {
                Ok(value) if value > 0 => {
                    config.slow_handler_threshold_ms = value;
                }
                _ => {
                    tracing::warn!(
                        "Invalid SLOW_HANDLER_THRESHOLD_MS '{}', using default: {}",
                        threshold,
                        config.slow_handler_threshold_ms
                    );
                }
            }
        }

        config
    }

    pub fn slow_handler_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_handler_threshold_ms)
    }
}
