//! Options accepted when starting a cell

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::Registry;
use crate::config::Config;

/// Where a cell's execution loop runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// A tokio task. The initializer and funs run on tokio's blocking pool.
    #[default]
    Task,
    /// A dedicated OS thread that runs the initializer and funs inline
    Thread,
}

/// Execution hints for the cell's loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    pub mode: SpawnMode,

    /// Thread name (thread mode only)
    pub thread_name: Option<String>,

    /// Stack size in bytes (thread mode only)
    pub stack_size: Option<usize>,
}

/// Options for [`StateCell::start`](super::StateCell::start) and friends
#[derive(Debug, Clone)]
pub struct CellOptions {
    /// Register the cell under this name
    pub name: Option<String>,

    /// Maximum time the initializer may take; `None` waits forever
    pub init_timeout: Option<Duration>,

    /// Default timeout for synchronous calls made through the returned handle
    pub call_timeout: Duration,

    pub spawn: SpawnOptions,

    /// Registry holding the name; the process-wide registry when `None`
    pub registry: Option<Registry>,
}

impl Default for CellOptions {
    fn default() -> Self {
        Self {
            name: None,
            init_timeout: None,
            call_timeout: Duration::from_millis(crate::DEFAULT_CALL_TIMEOUT_MS),
            spawn: SpawnOptions::default(),
            registry: None,
        }
    }
}

impl CellOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options seeded from configuration
    pub fn from_config(config: &Config) -> Self {
        debug!(?config, "CellOptions::from_config: called");
        Self {
            init_timeout: config.init_timeout(),
            call_timeout: config.call_timeout(),
            spawn: config.spawn.clone(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn spawn_mode(mut self, mode: SpawnMode) -> Self {
        self.spawn.mode = mode;
        self
    }

    /// Run on a dedicated, named OS thread
    pub fn thread(mut self, name: impl Into<String>) -> Self {
        self.spawn.mode = SpawnMode::Thread;
        self.spawn.thread_name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.spawn.stack_size = Some(bytes);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }
}
