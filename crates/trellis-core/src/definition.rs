//! Matrix definition types.
//!
//! These types represent the user-authored matrix YAML. A definition is loaded
//! once per invocation and never mutated afterwards.

use crate::error::DefinitionError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MatrixDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub axes: Vec<AxisDefinition>,
    /// Global default variables, visible to every job.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Variables every resolved job must define.
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub keys: RecognizedKeys,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u32,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    pub entries: Vec<MatrixEntry>,
}

fn default_timeout() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Language name, e.g. `python`.
    pub language: String,
    /// Axis that enumerates the allowed runtime versions.
    #[serde(default)]
    pub axis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AxisDefinition {
    pub name: String,
    /// Environment variable the axis value is exported as.
    #[serde(default)]
    pub variable: Option<String>,
    pub values: Vec<String>,
}

impl AxisDefinition {
    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Names of the variables the engine gives a typed meaning to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RecognizedKeys {
    /// Implementation-variant selector, e.g. `PSYCOPG3_IMPL`.
    #[serde(default)]
    pub variant: Option<String>,
    /// Test-filter expression passed through to the test tool.
    #[serde(default)]
    pub test_filter: Option<String>,
    /// Database connection string.
    #[serde(default)]
    pub dsn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// Variable holding the service version.
    pub version_from: String,
    /// Variable holding the listening port.
    #[serde(default)]
    pub port_from: Option<String>,
    #[serde(default)]
    pub default_port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    /// Shell template that starts the service.
    #[serde(default)]
    pub start: Option<String>,
    /// Shell template that creates `database`.
    #[serde(default)]
    pub create_database: Option<String>,
    /// Shell template that stops a service Trellis started.
    #[serde(default)]
    pub stop: Option<String>,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_ready_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    /// Branch that must match exactly.
    pub branch: String,
    /// Boolean flag variable that must be set.
    pub flag: String,
    pub run: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MatrixEntry {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    /// Axis selections, exported through each axis' variable.
    #[serde(default)]
    pub axes: BTreeMap<String, String>,
    /// Ordered `KEY=VALUE` overrides; later items win.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<ServiceRef>,
    #[serde(default)]
    pub workdir: Option<String>,
    /// Host packages installed before the job runs.
    #[serde(default)]
    pub addons: Vec<String>,
    /// Replaces the default install phase. An empty list means no install.
    #[serde(default)]
    pub install: Option<Vec<String>>,
    #[serde(default)]
    pub script: Option<Vec<String>>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

/// Reference to a service from the catalogue, optionally pinning its port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ServiceRef {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        port: Option<u16>,
    },
}

impl ServiceRef {
    pub fn name(&self) -> &str {
        match self {
            ServiceRef::Name(name) => name,
            ServiceRef::Detailed { name, .. } => name,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            ServiceRef::Name(_) => None,
            ServiceRef::Detailed { port, .. } => *port,
        }
    }
}

impl MatrixDefinition {
    /// Parse a definition from YAML.
    pub fn from_yaml(content: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load and parse a definition file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DefinitionError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    pub fn axis(&self, name: &str) -> Option<&AxisDefinition> {
        self.axes.iter().find(|a| a.name == name)
    }

    /// Axis bound to the given environment variable, if any.
    pub fn axis_for_variable(&self, variable: &str) -> Option<&AxisDefinition> {
        self.axes
            .iter()
            .find(|a| a.variable.as_deref() == Some(variable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: demo
runtime:
  language: python
entries:
  - runtime: "3.8"
"#;

    #[test]
    fn test_parse_minimal_definition() {
        let def = MatrixDefinition::from_yaml(MINIMAL).unwrap();
        assert_eq!(def.name, "demo");
        assert_eq!(def.timeout_minutes, 60);
        assert_eq!(def.entries.len(), 1);
        assert!(def.entries[0].install.is_none());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let yaml = format!("{}bogus: true\n", MINIMAL);
        let err = MatrixDefinition::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_service_ref_forms() {
        let yaml = r#"
name: demo
runtime:
  language: python
entries:
  - runtime: "3.8"
    services:
      - postgresql
      - name: redis
        port: 6380
"#;
        let def = MatrixDefinition::from_yaml(yaml).unwrap();
        let services = &def.entries[0].services;
        assert_eq!(services[0].name(), "postgresql");
        assert_eq!(services[0].port(), None);
        assert_eq!(services[1].name(), "redis");
        assert_eq!(services[1].port(), Some(6380));
    }

    #[test]
    fn test_empty_install_phase_is_explicit() {
        let yaml = r#"
name: demo
runtime:
  language: python
install: ["pip install tox"]
entries:
  - runtime: "3.8"
    install: []
"#;
        let def = MatrixDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.entries[0].install, Some(vec![]));
    }
}
