//! Engine configuration
//!
//! Read from YAML; every field has a default, so an empty file is valid:
//!
//! ```yaml
//! app_version: "1.2.0"
//! batch_threshold: 499
//! view_page_size: 100
//! max_logic_pages: 20
//! runtime_config_path: "@server/config"
//! max_view_depth: 16
//! retry:
//!   base_delay_ms: 1000
//!   max_attempts: 5
//!   capacity: 1000
//!   poll_interval_ms: 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::writer::DEFAULT_BATCH_THRESHOLD;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target version for view logic gating
    pub app_version: String,

    /// Batched writer auto-commit size
    pub batch_threshold: usize,

    /// `@views` documents read per forward view page
    pub view_page_size: usize,

    /// Page cap when the runtime config document does not set one
    pub max_logic_pages: usize,

    /// Runtime document whose `maxLogicResultPages` overrides the page cap
    pub runtime_config_path: String,

    /// Depth of view logic triggered by view logic output; paging through
    /// `@views` does not count
    pub max_view_depth: usize,

    pub retry: RetrySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_version: "0.0.0".to_string(),
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            view_page_size: 100,
            max_logic_pages: 20,
            runtime_config_path: "@server/config".to_string(),
            max_view_depth: 16,
            retry: RetrySettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&content)?)
    }

    pub fn from_yaml_str(input: &str) -> crate::Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(input)?)
    }
}

/// Backoff for `cancel-then-retry`: `base_delay * 2^(attempt - 1)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    /// Jobs held at once; scheduling beyond this fails
    pub capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 5,
            capacity: 1000,
            poll_interval_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
