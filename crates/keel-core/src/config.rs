use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_ensure_interval() -> u64 {
    300
}

fn default_prune_interval() -> u64 {
    600
}

fn default_prune_wait() -> u64 {
    24 * 60 * 60
}

fn default_abort_wait() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_ready_changes() -> usize {
    500
}

fn default_max_workers() -> usize {
    8
}

/// Engine tunables, read from `<root>/keel.toml`. Every field is optional.
///
/// ```toml
/// ensure_interval_secs = 300
/// max_workers = 4
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound between ensure passes when nobody asks for an earlier one.
    #[serde(default = "default_ensure_interval")]
    pub ensure_interval_secs: u64,
    /// Minimum time between two prune passes.
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
    /// How long a ready change is kept before it is pruned.
    #[serde(default = "default_prune_wait")]
    pub prune_wait_secs: u64,
    /// Changes not ready after this long are aborted by the pruner.
    #[serde(default = "default_abort_wait")]
    pub abort_wait_secs: u64,
    #[serde(default = "default_max_ready_changes")]
    pub max_ready_changes: usize,
    /// Maximum number of handlers running at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ensure_interval_secs: default_ensure_interval(),
            prune_interval_secs: default_prune_interval(),
            prune_wait_secs: default_prune_wait(),
            abort_wait_secs: default_abort_wait(),
            max_ready_changes: default_max_ready_changes(),
            max_workers: default_max_workers(),
        }
    }
}

impl EngineConfig {
    /// Load the config at `path`, or the defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(CoreError::Io(e)),
        };
        let config: Self = toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_workers == 0 {
            return Err(CoreError::Config("max_workers must be at least 1".to_owned()));
        }
        if self.ensure_interval_secs == 0 {
            return Err(CoreError::Config(
                "ensure_interval_secs must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_secs(self.ensure_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn prune_wait(&self) -> Duration {
        Duration::from_secs(self.prune_wait_secs)
    }

    pub fn abort_wait(&self) -> Duration {
        Duration::from_secs(self.abort_wait_secs)
    }
}
