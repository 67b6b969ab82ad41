//! Daemon configuration
//!
//! Service identity and surface; the store and transport read their own
//! settings from the environment (`StoreConfig::from_env`,
//! `NatsConfig::from_env`).

use serde::{Deserialize, Serialize};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Service name shared by cooperating instances
    pub service_name: String,

    /// Destinations the inbox worker subscribes to; empty runs a
    /// publisher-only node
    pub destinations: Vec<String>,

    /// Health check HTTP port (default: 8081)
    pub health_port: u16,

    /// Log level (default: "info")
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            service_name: "relay".to_string(),
            destinations: Vec::new(),
            health_port: 8081,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("RELAY_SERVICE_NAME").unwrap_or(defaults.service_name),
            destinations: std::env::var("RELAY_DESTINATIONS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.destinations),
            health_port: std::env::var("RELAY_HEALTH_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.health_port),
            log_level: std::env::var("RELAY_LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.service_name, "relay");
        assert!(config.destinations.is_empty());
        assert_eq!(config.health_port, 8081);
        assert_eq!(config.log_level, "info");
    }
}
