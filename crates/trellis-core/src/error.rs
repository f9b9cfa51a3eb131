//! Error types for Trellis.

use thiserror::Error;

/// Problems with the matrix definition itself. Always detected before any
/// job runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Invalid matrix definition: {0}")]
    Parse(String),

    #[error("Matrix definition has no entries")]
    NoEntries,

    #[error("Axis declared twice: {0}")]
    DuplicateAxis(String),

    #[error("Axis {axis} declares value {value:?} more than once")]
    DuplicateAxisValue { axis: String, value: String },

    #[error("Entry {entry}: unknown axis {axis}")]
    UnknownAxis { entry: String, axis: String },

    #[error("Entry {entry}: value {value:?} is not declared on axis {axis}")]
    UnknownAxisValue {
        entry: String,
        axis: String,
        value: String,
    },

    #[error("Entry {entry}: no runtime version selected")]
    MissingRuntime { entry: String },

    #[error("Entry {entry}: malformed env item {item:?} (expected KEY=VALUE)")]
    MalformedEnv { entry: String, item: String },

    #[error("Entry {entry}: {key} is set to {first:?} and {second:?} by different overrides")]
    AmbiguousOverride {
        entry: String,
        key: String,
        first: String,
        second: String,
    },

    #[error("Entry {entry}: required variable {key} is not set")]
    MissingRequiredVariable { entry: String, key: String },

    #[error("Entry {entry}: unknown service {service}")]
    UnknownService { entry: String, service: String },

    #[error("Entry {entry}: service {service} has no version ({variable} is not set)")]
    MissingServiceVersion {
        entry: String,
        service: String,
        variable: String,
    },

    #[error("Entry {entry}: service {service} port {value:?} is not a valid port")]
    InvalidPort {
        entry: String,
        service: String,
        value: String,
    },

    #[error("Invalid deploy configuration: {0}")]
    InvalidDeploy(String),

    #[error("No matrix entry matches {0:?}")]
    EntryNotFound(String),
}

/// Environment setup failures. Localized to a single job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("Runtime {language} {version} is not available")]
    RuntimeUnavailable { language: String, version: String },

    #[error("Port {port} is held by {held_by}, cannot start {requested}")]
    PortConflict {
        port: u16,
        held_by: String,
        requested: String,
    },

    #[error("Service {service} failed to start: {message}")]
    ServiceStartFailed { service: String, message: String },

    #[error("Service {service} not ready on port {port} after {timeout_secs}s")]
    ServiceNotReady {
        service: String,
        port: u16,
        timeout_secs: u64,
    },

    #[error("Failed to create database {database} on {service}: {message}")]
    DatabaseCreateFailed {
        service: String,
        database: String,
        message: String,
    },

    #[error("Service {service} failed to stop: {message}")]
    ServiceStopFailed { service: String, message: String },

    #[error("Failed to install addons: {0}")]
    AddonInstallFailed(String),

    #[error("Failed to prepare workspace: {0}")]
    Workspace(String),
}

impl From<serde_yaml::Error> for DefinitionError {
    fn from(err: serde_yaml::Error) -> Self {
        DefinitionError::Parse(err.to_string())
    }
}
