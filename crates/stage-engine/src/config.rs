//! Scheduler configuration.

use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name used in log output to tell schedulers apart.
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum number of jobs running at once.
    pub max_concurrent: usize,
    /// Whether the scheduler starts with admissions paused.
    #[serde(default)]
    pub start_paused: bool,
}

fn default_name() -> String {
    "scheduler".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_concurrent: 4,
            start_paused: false,
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with the given name and concurrency ceiling.
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            start_paused: false,
        }
    }

    /// Start with admissions paused.
    pub fn paused(mut self) -> Self {
        self.start_paused = true;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(EngineError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
