//! CLI configuration management.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use trellis_runner::DEFAULT_INHERITED_ENV;

/// Host configuration for matrix runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Default concurrency limit.
    pub max_parallel: Option<usize>,
    /// Default workspace root.
    pub workspace: Option<PathBuf>,
    /// Root of the runtime toolcache (`<root>/<language>/<version>/bin`).
    pub toolcache: Option<PathBuf>,
    pub shell: String,
    /// Host variables passed through to job commands.
    pub inherit_env: Vec<String>,
    /// Command prefix used to install addon packages.
    pub addon_command: Option<String>,
    pub output_format: OutputFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            workspace: None,
            toolcache: None,
            shell: "sh".to_string(),
            inherit_env: DEFAULT_INHERITED_ENV.iter().map(|k| k.to_string()).collect(),
            addon_command: None,
            output_format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path. `TRELLIS_CONFIG` overrides the
    /// platform location.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        if let Some(path) = std::env::var_os("TRELLIS_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let dirs = directories::ProjectDirs::from("dev", "trellis", "trellis")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "max_parallel" => {
                let n: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid max_parallel: {}", value))?;
                if n == 0 {
                    return Err("max_parallel must be at least 1".to_string());
                }
                self.max_parallel = Some(n);
            }
            "workspace" => self.workspace = Some(PathBuf::from(value)),
            "toolcache" => self.toolcache = Some(PathBuf::from(value)),
            "shell" => self.shell = value.to_string(),
            "inherit_env" => {
                self.inherit_env = value
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "addon_command" => {
                self.addon_command = (!value.is_empty()).then(|| value.to_string());
            }
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    "yaml" => OutputFormat::Yaml,
                    _ => return Err(format!("Invalid output format: {}", value)),
                };
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}
