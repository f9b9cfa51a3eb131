//! Runner configuration and command environment composition.

use std::collections::BTreeMap;
use std::path::PathBuf;
use trellis_core::ports::ProvisionedEnvironment;

/// Host variables passed through to job commands when nothing else is
/// configured.
pub const DEFAULT_INHERITED_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TMPDIR", "TERM"];

/// Configuration for command execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used as `<shell> -c <command>`.
    pub shell: String,
    /// Host variables copied into the otherwise empty command environment.
    pub inherit_env: Vec<String>,
    /// Echo each command as a `$ command` output line before running it.
    pub echo_commands: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            inherit_env: DEFAULT_INHERITED_ENV.iter().map(|k| k.to_string()).collect(),
            echo_commands: true,
        }
    }
}

impl RunnerConfig {
    /// Build the full environment of a command: inherited host keys, then the
    /// given variables, with `path_prefix` placed in front of `PATH`.
    pub fn compose_env(
        &self,
        vars: &BTreeMap<String, String>,
        path_prefix: &[PathBuf],
    ) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .inherit_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        if !path_prefix.is_empty() {
            let mut dirs: Vec<PathBuf> = path_prefix.to_vec();
            if let Some(path) = env.get("PATH") {
                dirs.extend(std::env::split_paths(path));
            }
            if let Ok(joined) = std::env::join_paths(dirs) {
                env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
            }
        }
        env
    }

    /// Environment for a provisioned job.
    pub fn job_env(&self, provisioned: &ProvisionedEnvironment) -> BTreeMap<String, String> {
        self.compose_env(&provisioned.env, &provisioned.path_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_listed_keys_are_inherited() {
        let config = RunnerConfig {
            inherit_env: vec!["TRELLIS_TEST_INHERITED_KEY_THAT_IS_UNSET".to_string()],
            ..Default::default()
        };
        let env = config.compose_env(&BTreeMap::new(), &[]);
        assert!(env.is_empty());
    }

    #[test]
    fn test_job_vars_override_inherited() {
        let config = RunnerConfig {
            inherit_env: vec!["PATH".to_string()],
            ..Default::default()
        };
        let vars = BTreeMap::from([("PATH".to_string(), "/custom".to_string())]);
        let env = config.compose_env(&vars, &[]);
        assert_eq!(env["PATH"], "/custom");
    }

    #[test]
    fn test_runtime_dir_is_prefixed_to_path() {
        let config = RunnerConfig {
            inherit_env: vec![],
            ..Default::default()
        };
        let vars = BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]);
        let env = config.compose_env(&vars, &[PathBuf::from("/opt/python/3.8/bin")]);
        assert_eq!(env["PATH"], "/opt/python/3.8/bin:/usr/bin:/bin");
    }
}
