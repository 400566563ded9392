//! Configuration loading for the BirdEdge daemon.
//!
//! Configuration is split by concern:
//!
//! - **Infrastructure** (`PathsConfig`, `DiscoveryConfig`, `TelemetryConfig`):
//!   where the worker template lives, what service type to browse for,
//!   how to log.
//! - **Worker** (`WorkerConfig`): the supervised executable and its restart
//!   policy.
//! - **Sinks** (`InfluxConfig`, `BusConfig`): where classifications go.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, tables are merged key by key):
//! 1. `/etc/birdedge/config.toml` (system)
//! 2. `~/.config/birdedge/config.toml` (user)
//! 3. `./birdedge.toml` (local override, replaced by an explicit path)
//! 4. Environment variables (`BIRDEDGE_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! template = "/etc/birdedge/birdedged.conf"
//! export = "/run/birdedge/dynamic.conf"
//!
//! [worker]
//! executable = "/opt/birdedge/bin/birdedge"
//! restart_interval_secs = 60
//!
//! [worker.env]
//! LD_PRELOAD = "/usr/lib/aarch64-linux-gnu/libgomp.so.1"
//!
//! [influx]
//! url = "http://influx.lan:8086"
//! token = "..."
//!
//! [bus]
//! enabled = true
//! endpoint = "tcp://0.0.0.0:5590"
//! ```

pub mod infra;
pub mod loader;
pub mod sinks;
pub mod worker;

pub use infra::{DiscoveryConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files, ConfigSources};
pub use sinks::{BusConfig, InfluxConfig};
pub use worker::WorkerConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BirdConfig {
    pub paths: PathsConfig,
    pub worker: WorkerConfig,
    pub discovery: DiscoveryConfig,
    pub influx: InfluxConfig,
    pub bus: BusConfig,
    pub telemetry: TelemetryConfig,
}

impl BirdConfig {
    /// Load configuration from the standard locations plus environment,
    /// letting `config_path` replace `./birdedge.toml`. Also reports which
    /// files and variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, sources.files.last())?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.expand_paths();

        Ok((config, sources))
    }

    /// Parse a single TOML document on top of the compiled defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let table = loader::parse_table(contents, Path::new("<inline>"))?;
        let mut config = loader::from_table(table, None)?;
        config.expand_paths();
        Ok(config)
    }

    /// Serialize the effective configuration to TOML.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self).unwrap_or_else(|e| format!("# unserializable: {e}\n"));
        format!("# BirdEdge daemon configuration\n\n{body}")
    }

    fn expand_paths(&mut self) {
        self.paths.template = loader::expand_path(&self.paths.template.to_string_lossy());
        self.paths.export = loader::expand_path(&self.paths.export.to_string_lossy());
        self.worker.executable = loader::expand_path(&self.worker.executable.to_string_lossy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BirdConfig::default();
        assert_eq!(config.worker.restart_interval_secs, 60);
        assert_eq!(config.influx.bucket, "radiotracking");
        assert_eq!(config.discovery.service_type, "_birdedge._tcp.local.");
        assert!(config.worker.env.contains_key("LD_PRELOAD"));
        assert!(!config.bus.enabled);
    }

    #[test]
    fn test_to_toml_roundtrips() {
        let config = BirdConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[worker.env]"));
        assert!(toml.contains("radiotracking"));

        let parsed = BirdConfig::from_toml_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config = BirdConfig::from_toml_str(
            r#"
[influx]
url = "http://influx.lan:8086"
"#,
        )
        .unwrap();
        assert_eq!(config.influx.url, "http://influx.lan:8086");
        assert_eq!(config.influx.org, "default");
        assert_eq!(config.worker.executable, PathBuf::from("./birdedge"));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(
            &path,
            r#"
[worker]
restart_interval_secs = 15

[bus]
enabled = true
"#,
        )
        .unwrap();

        let (config, sources) = BirdConfig::load_with_sources_from(Some(&path)).unwrap();
        assert_eq!(config.worker.restart_interval_secs, 15);
        assert!(config.bus.enabled);
        assert_eq!(sources.files.last(), Some(&path));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[worker\nrestart_interval_secs = ").unwrap();

        let err = BirdConfig::load_with_sources_from(Some(&path)).unwrap_err();
        match err {
            ConfigError::Parse { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
