//! Settings for the supervised classification worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable, invoked as `<executable> -c <export path>`.
    pub executable: PathBuf,

    /// Minimum time between two worker launches.
    pub restart_interval_secs: u64,

    /// Time discovery gets to populate the registry before the first launch.
    pub discovery_grace_secs: u64,

    /// How long a terminated worker may take to exit before it is killed.
    pub stop_timeout_secs: u64,

    /// Classifier label that means "nothing detected".
    pub background_label: String,

    /// Environment overrides for the worker process.
    pub env: BTreeMap<String, String>,
}

impl WorkerConfig {
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    pub fn discovery_grace(&self) -> Duration {
        Duration::from_secs(self.discovery_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    fn default_env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "LD_PRELOAD".to_string(),
            "/usr/lib/aarch64-linux-gnu/libgomp.so.1".to_string(),
        );
        env
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./birdedge"),
            restart_interval_secs: 60,
            discovery_grace_secs: 5,
            stop_timeout_secs: 10,
            background_label: "00_background".to_string(),
            env: Self::default_env(),
        }
    }
}
