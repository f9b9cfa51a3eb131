//! Resolved job specifications.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A fully resolved unit of work. Produced by matrix expansion and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Position in the matrix, starting at 0.
    pub index: usize,
    pub label: String,
    pub runtime: RuntimeRequirement,
    /// Global defaults merged with the entry's overrides.
    pub env: BTreeMap<String, String>,
    pub settings: JobSettings,
    pub services: Vec<ServiceRequirement>,
    pub workdir: Option<String>,
    pub addons: Vec<String>,
    pub install: Vec<String>,
    pub script: Vec<String>,
    pub allow_failure: bool,
    pub timeout_secs: u64,
}

impl JobSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Ports this job needs exclusive use of, sorted and deduplicated.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.services.iter().map(|s| s.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeRequirement {
    pub language: String,
    pub version: String,
}

/// Typed view over the recognized variables of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobSettings {
    pub variant: Option<String>,
    /// Passed through to the test tool untouched.
    pub test_filter: Option<String>,
    pub dsn: Option<String>,
    /// Whether the job sets the deploy flag.
    pub docs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceRequirement {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub database: Option<String>,
    pub start: Option<String>,
    pub create_database: Option<String>,
    pub stop: Option<String>,
    pub ready_timeout_secs: u64,
}

impl ServiceRequirement {
    /// `name@version`, used to tell services on the same port apart.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Whether a variable value reads as a set boolean flag.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
