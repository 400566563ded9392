//! Config file discovery, loading, and environment variable overlay.

use crate::{BirdConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Existing config files in load order: system, user, then `cli_path` if it
/// exists, otherwise `./birdedge.toml`.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/birdedge/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("birdedge/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("birdedge.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table = parse_table(&contents, path)?;

    // Validate the file on its own so type errors name the right path
    from_table(table.clone(), Some(&path.to_path_buf()))?;

    Ok(table)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

pub(crate) fn from_table(
    table: toml::Table,
    path: Option<&PathBuf>,
) -> Result<BirdConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.cloned().unwrap_or_else(|| PathBuf::from("<merged>")),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`. Nested tables merge key by key, anything
/// else in `overlay` replaces the value in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut BirdConfig, sources: &mut ConfigSources) {
    let mut record = |name: &str| sources.env_overrides.push(name.to_string());

    if let Ok(v) = env::var("BIRDEDGE_TEMPLATE") {
        config.paths.template = PathBuf::from(v);
        record("BIRDEDGE_TEMPLATE");
    }
    if let Ok(v) = env::var("BIRDEDGE_EXPORT") {
        config.paths.export = PathBuf::from(v);
        record("BIRDEDGE_EXPORT");
    }

    if let Ok(v) = env::var("BIRDEDGE_WORKER") {
        config.worker.executable = PathBuf::from(v);
        record("BIRDEDGE_WORKER");
    }
    if let Ok(v) = env::var("BIRDEDGE_RESTART_INTERVAL") {
        if let Ok(secs) = v.parse() {
            config.worker.restart_interval_secs = secs;
            record("BIRDEDGE_RESTART_INTERVAL");
        }
    }

    if let Ok(v) = env::var("BIRDEDGE_INFLUX_URL") {
        config.influx.url = v;
        record("BIRDEDGE_INFLUX_URL");
    }
    if let Ok(v) = env::var("BIRDEDGE_INFLUX_TOKEN") {
        config.influx.token = v;
        record("BIRDEDGE_INFLUX_TOKEN");
    }
    if let Ok(v) = env::var("BIRDEDGE_INFLUX_ORG") {
        config.influx.org = v;
        record("BIRDEDGE_INFLUX_ORG");
    }
    if let Ok(v) = env::var("BIRDEDGE_INFLUX_BUCKET") {
        config.influx.bucket = v;
        record("BIRDEDGE_INFLUX_BUCKET");
    }

    if let Ok(v) = env::var("BIRDEDGE_BUS_ENDPOINT") {
        config.bus.endpoint = v;
        config.bus.enabled = true;
        record("BIRDEDGE_BUS_ENDPOINT");
    }

    if let Ok(v) = env::var("BIRDEDGE_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
        record("BIRDEDGE_OTLP_ENDPOINT");
    }
    if let Ok(v) = env::var("BIRDEDGE_LOG_LEVEL") {
        config.telemetry.log_level = v;
        record("BIRDEDGE_LOG_LEVEL");
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        record("RUST_LOG");
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
