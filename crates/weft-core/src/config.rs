use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Scheduling bounds for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of task executions per run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Maximum number of async tasks in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Run-level deadline in seconds (none = no deadline).
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    /// Per-task timeout handed to agents.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_concurrency: default_max_concurrency(),
            run_timeout_secs: None,
            task_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// Reject bounds that would make a run hang or never start.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(WeftError::Config(
                "engine.max_iterations must be greater than 0".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(WeftError::Config(
                "engine.max_concurrency must be greater than 0".into(),
            ));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(WeftError::Config(
                "engine.run_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.weft/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = failures only, 2 = every task (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    /// Resolved log directory with `~` expanded.
    pub fn resolved_dir(&self) -> PathBuf {
        let raw = self.log_dir.as_deref().unwrap_or("~/.weft/logs");
        expand_home(raw)
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

fn default_max_iterations() -> usize { 100 }
fn default_max_concurrency() -> usize { 4 }

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// The log section, if present and enabled.
    pub fn active_log(&self) -> Option<&LogConfig> {
        self.log.as_ref().filter(|l| l.enabled)
    }
}

pub(crate) fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
