//! `converge.toml` settings
//!
//! Looked up in the working directory first, then in the config
//! directory. Every field is optional; a missing file means defaults.
//!
//! ```toml
//! stack = "product"
//! file = "stacks/product.toml"
//! jobs = 8
//! failure_policy = "halt"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 250
//! ```

use anyhow::{Context, Result, bail};
use declarative::{ExecuteOptions, FailurePolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

/// Settings file name
pub const SETTINGS_FILE: &str = "converge.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Stack name; selects the default state file and provider root
    pub stack: String,
    /// Declarations file
    pub file: String,
    /// State file (default: `<state dir>/<stack>.json`)
    pub state: Option<String>,
    /// Where the local provider keeps resources (default: `<state dir>/<stack>/`)
    pub provider_root: Option<String>,
    /// Parallel workers
    pub jobs: usize,
    pub failure_policy: FailurePolicy,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stack: "default".to_string(),
            file: "resources.toml".to_string(),
            state: None,
            provider_root: None,
            jobs: 4,
            failure_policy: FailurePolicy::Continue,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per provider call, including the first; 1 disables retries
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        if self.max_attempts <= 1 {
            return RetryPolicy::no_retry();
        }
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Settings {
    /// Load from `./converge.toml`, then the config directory, else defaults
    pub fn load() -> Result<Self> {
        let local = PathBuf::from(SETTINGS_FILE);
        if local.exists() {
            return Self::load_from(&local);
        }

        let global = paths::config_dir()?.join(SETTINGS_FILE);
        if global.exists() {
            return Self::load_from(&global);
        }

        log::debug!("No {SETTINGS_FILE} found, using defaults");
        Ok(Self::default())
    }

    /// Load and validate a specific settings file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read settings file: {}", path.display()))?;

        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack.is_empty() || self.stack.contains(['/', '\\']) {
            bail!("stack name '{}' must be non-empty and contain no path separators", self.stack);
        }
        if self.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            bail!("retry.backoff_factor must be at least 1.0");
        }
        Ok(())
    }

    pub fn declarations_path(&self) -> PathBuf {
        paths::expand(&self.file)
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state {
            Some(state) => Ok(paths::expand(state)),
            None => Ok(paths::state_dir()?.join(format!("{}.json", self.stack))),
        }
    }

    pub fn provider_root(&self) -> Result<PathBuf> {
        match &self.provider_root {
            Some(root) => Ok(paths::expand(root)),
            None => Ok(paths::state_dir()?.join(&self.stack)),
        }
    }

    /// Engine options before command-line overrides
    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            dry_run: false,
            jobs: self.jobs,
            retry: self.retry.policy(),
            failure_policy: self.failure_policy,
        }
    }
}
