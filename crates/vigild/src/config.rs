//! Daemon configuration.
//!
//! One YAML file with a section per component. Missing sections take the
//! component defaults; unknown sections are tolerated so configs can be
//! shared with tooling that carries extra state.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use vigil_announcer::bird::BirdConfig;
use vigil_announcer::AnnouncerConfig;
use vigil_balancer::yanet::YanetConfig;
use vigil_balancer::BalancerConfig;
use vigil_core::{ExperimentsConfig, ManagerConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level; `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_http_addr() -> String {
    "[::1]:14080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the management HTTP server listens on.
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_addr: default_http_addr(),
        }
    }
}

/// Root daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,

    pub balancer: BalancerConfig,
    pub yanet: YanetConfig,

    pub announcer: AnnouncerConfig,
    pub bird: BirdConfig,

    /// Minimum TLS version for HTTPS and gRPC probes ("1.0" to "1.3").
    pub tls_min_version: String,
    pub experiments: ExperimentsConfig,

    pub service: ManagerConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_sections() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.http_addr, "[::1]:14080");
        assert_eq!(config.announcer.announce_group, vec!["default"]);
        assert_eq!(config.bird.batch_size, 4096);
        assert_eq!(config.balancer.flush_period, 0.05);
        assert_eq!(config.balancer.sync_states_period, 5.0);
        assert!(config.tls_min_version.is_empty());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
logging:
  level: debug
  format: json
announcer:
  update_period: 0.1
  announce_group: [g-1, g-2]
bird:
  batch_size: 1024
  sock_dir: /run/announce
balancer:
  flush_period: 0.02
  sync_states_period: 10
yanet:
  control_plane_sock_path: /run/balancer/cp.sock
tls_min_version: "1.3"
experiments:
  enabled: true
  enable_tls_sni: true
service:
  format: keepalived
  path: /etc/vigil/services.conf
  dump_path: /var/lib/vigil/services.json
server:
  http_addr: "[::1]:8080"
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.announcer.announce_group, vec!["g-1", "g-2"]);
        assert_eq!(config.bird.batch_size, 1024);
        assert_eq!(config.balancer.flush_period, 0.02);
        assert_eq!(config.tls_min_version, "1.3");
        assert!(config.experiments.tls_sni_enabled());
        assert_eq!(
            config.service.dump_path.as_deref(),
            Some(Path::new("/var/lib/vigil/services.json"))
        );
    }

    #[test]
    fn test_unknown_sections_are_tolerated() {
        let yaml = r#"
logging:
  level: warn
check_tun:
  queue_num: 10
  queue_len: 4096
some_future_section:
  key: value
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "warn");
    }
}
