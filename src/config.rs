//! Configuration management with YAML support

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::driver::Job;

/// Largest trace the pipeline will read, in bytes.
pub const DEFAULT_MAX_TRACE_BYTES: u64 = 0x1FFF_FFE8;

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub reports: ReportsConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub jobs: Vec<Job>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Which trace files a batch analyses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    /// Only the files the driver reported for the batch
    Batch,
    /// Every matching file in the report directory
    Directory,
}

/// Trace output directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_report_dir")]
    pub dir: String,

    #[serde(default)]
    pub clear_after_analysis: bool,

    #[serde(default = "default_max_trace_bytes")]
    pub max_trace_bytes: u64,

    #[serde(default = "default_discovery")]
    pub discovery: Discovery,

    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// External automation command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_driver_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default = "default_new_file_timeout")]
    pub new_file_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_database_path() -> String {
    dirs::data_dir()
        .map(|d| d.join("domtally").join("analysis.db"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "analysis.db".to_string())
}

fn default_report_dir() -> String {
    "reports".to_string()
}

fn default_max_trace_bytes() -> u64 {
    DEFAULT_MAX_TRACE_BYTES
}

fn default_discovery() -> Discovery {
    Discovery::Batch
}

fn default_patterns() -> Vec<String> {
    vec!["*.json".to_string(), "*.json.zst".to_string()]
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_driver_command() -> String {
    "domtally-driver".to_string()
}

fn default_new_file_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    100
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: default_report_dir(),
            clear_after_analysis: false,
            max_trace_bytes: default_max_trace_bytes(),
            discovery: default_discovery(),
            patterns: default_patterns(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: default_driver_command(),
            args: vec![],
            env: HashMap::new(),
            new_file_timeout_secs: default_new_file_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            reports: ReportsConfig::default(),
            pipeline: PipelineConfig::default(),
            driver: DriverConfig::default(),
            jobs: vec![],
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./domtally.yaml (current directory)
    /// 3. ~/.config/domtally/domtally.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "domtally.yaml".to_string(),
            shellexpand::tilde("~/.config/domtally/domtally.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)
                    .with_context(|| format!("Failed to read {}", search_path))?;
                let config: Config = serde_yaml::from_str(&content)
                    .with_context(|| format!("Invalid config {}", search_path))?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }

    pub fn report_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.reports.dir).to_string())
    }

    /// Batch size, with 0 treated as unset
    pub fn batch_size(&self) -> usize {
        match self.pipeline.batch_size {
            0 => DEFAULT_BATCH_SIZE,
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{StartTrigger, WaitCondition};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.batch_size(), 10);
        assert_eq!(config.reports.discovery, Discovery::Batch);
        assert!(!config.reports.clear_after_analysis);
        assert_eq!(config.reports.max_trace_bytes, 536_870_888);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn test_zero_batch_size_falls_back() {
        let mut config = Config::default();
        config.pipeline.batch_size = 0;
        assert_eq!(config.batch_size(), DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
database:
  path: ~/.local/share/domtally/test.db

reports:
  dir: /tmp/traces
  clear_after_analysis: true
  discovery: directory

pipeline:
  batch_size: 3

driver:
  command: node
  args: [drive.mjs, --headless]
  env:
    FIREFOX_PATH: /opt/firefox/firefox

jobs:
  - name: example
    url: https://example.com
    start_trace: afterload
    wait:
      delay_ms: 10000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database.path, "~/.local/share/domtally/test.db");
        assert_eq!(config.report_dir(), PathBuf::from("/tmp/traces"));
        assert!(config.reports.clear_after_analysis);
        assert_eq!(config.reports.discovery, Discovery::Directory);
        assert_eq!(config.reports.patterns, vec!["*.json", "*.json.zst"]);
        assert_eq!(config.batch_size(), 3);
        assert_eq!(config.driver.args, vec!["drive.mjs", "--headless"]);
        assert_eq!(config.driver.new_file_timeout_secs, 120);
        assert_eq!(config.jobs[0].start_trace, StartTrigger::AfterLoad);
        assert_eq!(config.jobs[0].wait, WaitCondition::DelayMs(10000));
    }

    #[test]
    fn test_load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let config = Config::load(missing.to_str().unwrap()).unwrap();
        assert_eq!(config.batch_size(), DEFAULT_BATCH_SIZE);
    }
}
