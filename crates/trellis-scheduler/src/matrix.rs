//! Matrix expansion into resolved job specs.
//!
//! Entries are enumerated explicitly: each entry names its own axis values
//! and overrides, no cross-product is taken. Expansion is deterministic.

use std::collections::BTreeMap;
use std::collections::HashSet;
use tracing::debug;
use trellis_core::DefinitionError;
use trellis_core::definition::{MatrixDefinition, MatrixEntry};
use trellis_core::interpolation::InterpolationContext;
use trellis_core::job::{JobSettings, JobSpec, RuntimeRequirement, ServiceRequirement, is_truthy};

/// Which override mechanism set a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Axis,
    EnvList,
    Variables,
    ServicePort,
}

/// Entry overrides collected across mechanisms.
struct Overrides<'e> {
    entry: &'e str,
    values: BTreeMap<String, BTreeMap<Source, String>>,
}

impl<'e> Overrides<'e> {
    fn new(entry: &'e str) -> Self {
        Self {
            entry,
            values: BTreeMap::new(),
        }
    }

    /// Later writes from the same mechanism win.
    fn set(&mut self, key: &str, value: String, source: Source) {
        self.values
            .entry(key.to_string())
            .or_default()
            .insert(source, value);
    }

    /// Final value of every key. Different mechanisms must agree.
    fn resolve(self) -> Result<BTreeMap<String, String>, DefinitionError> {
        let mut resolved = BTreeMap::new();
        for (key, by_source) in self.values {
            let mut values = by_source.into_values();
            let Some(first) = values.next() else {
                continue;
            };
            if let Some(second) = values.find(|v| *v != first) {
                return Err(DefinitionError::AmbiguousOverride {
                    entry: self.entry.to_string(),
                    key,
                    first,
                    second,
                });
            }
            resolved.insert(key, first);
        }
        Ok(resolved)
    }
}

/// Expander for matrix definitions.
pub struct MatrixExpander<'a> {
    definition: &'a MatrixDefinition,
}

impl<'a> MatrixExpander<'a> {
    /// Validate the definition's global structure.
    pub fn new(definition: &'a MatrixDefinition) -> Result<Self, DefinitionError> {
        validate_definition(definition)?;
        Ok(Self { definition })
    }

    /// Lazy iterator over the resolved jobs, in declaration order. Each call
    /// starts from the first entry again.
    pub fn jobs(&self) -> JobSpecs<'a> {
        JobSpecs {
            definition: self.definition,
            next: 0,
        }
    }

    /// Resolve every entry, stopping at the first error.
    pub fn expand(&self) -> Result<Vec<JobSpec>, DefinitionError> {
        self.jobs().collect()
    }
}

/// Iterator returned by [`MatrixExpander::jobs`].
#[derive(Debug, Clone)]
pub struct JobSpecs<'a> {
    definition: &'a MatrixDefinition,
    next: usize,
}

impl Iterator for JobSpecs<'_> {
    type Item = Result<JobSpec, DefinitionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.definition.entries.get(self.next)?;
        let job = resolve_entry(self.definition, self.next, entry);
        self.next += 1;
        Some(job)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.definition.entries.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

/// Pick a single job by index, then by label.
pub fn select_job(mut jobs: Vec<JobSpec>, selector: &str) -> Result<JobSpec, DefinitionError> {
    let by_index = selector
        .parse::<usize>()
        .ok()
        .and_then(|index| jobs.iter().position(|job| job.index == index));
    let position = by_index.or_else(|| jobs.iter().position(|job| job.label == selector));

    match position {
        Some(position) => Ok(jobs.swap_remove(position)),
        None => Err(DefinitionError::EntryNotFound(selector.to_string())),
    }
}

fn validate_definition(def: &MatrixDefinition) -> Result<(), DefinitionError> {
    if def.entries.is_empty() {
        return Err(DefinitionError::NoEntries);
    }

    let mut axis_names = HashSet::new();
    for axis in &def.axes {
        if !axis_names.insert(axis.name.as_str()) {
            return Err(DefinitionError::DuplicateAxis(axis.name.clone()));
        }
        let mut seen = HashSet::new();
        for value in &axis.values {
            if !seen.insert(value.as_str()) {
                return Err(DefinitionError::DuplicateAxisValue {
                    axis: axis.name.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    if let Some(axis) = &def.runtime.axis
        && def.axis(axis).is_none()
    {
        return Err(DefinitionError::UnknownAxis {
            entry: "runtime".to_string(),
            axis: axis.clone(),
        });
    }

    if let Some(deploy) = &def.deploy {
        if deploy.branch.trim().is_empty() {
            return Err(DefinitionError::InvalidDeploy("branch is empty".to_string()));
        }
        if deploy.flag.trim().is_empty() {
            return Err(DefinitionError::InvalidDeploy("flag is empty".to_string()));
        }
        if deploy.run.is_empty() {
            return Err(DefinitionError::InvalidDeploy("no deploy commands".to_string()));
        }
    }

    Ok(())
}

fn entry_name(index: usize, entry: &MatrixEntry) -> String {
    entry.label.clone().unwrap_or_else(|| format!("#{}", index))
}

fn parse_env_item(entry: &str, item: &str) -> Result<(String, String), DefinitionError> {
    let malformed = || DefinitionError::MalformedEnv {
        entry: entry.to_string(),
        item: item.to_string(),
    };
    let (key, value) = item.split_once('=').ok_or_else(malformed)?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(malformed());
    }
    Ok((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn resolve_entry(
    def: &MatrixDefinition,
    index: usize,
    entry: &MatrixEntry,
) -> Result<JobSpec, DefinitionError> {
    let name = entry_name(index, entry);
    let runtime_axis = def.runtime.axis.as_deref();

    // Collect overrides from every mechanism
    let mut overrides = Overrides::new(&name);
    let mut runtime_from_axis = None;

    for (axis_name, value) in &entry.axes {
        let axis = def
            .axis(axis_name)
            .ok_or_else(|| DefinitionError::UnknownAxis {
                entry: name.clone(),
                axis: axis_name.clone(),
            })?;
        if !axis.contains(value) {
            return Err(DefinitionError::UnknownAxisValue {
                entry: name.clone(),
                axis: axis_name.clone(),
                value: value.clone(),
            });
        }
        if Some(axis_name.as_str()) == runtime_axis {
            runtime_from_axis = Some(value.clone());
        }
        if let Some(variable) = &axis.variable {
            overrides.set(variable, value.clone(), Source::Axis);
        }
    }

    for item in &entry.env {
        let (key, value) = parse_env_item(&name, item)?;
        overrides.set(&key, value, Source::EnvList);
    }

    for (key, value) in &entry.variables {
        overrides.set(key, value.clone(), Source::Variables);
    }

    for service_ref in &entry.services {
        let service = def.services.get(service_ref.name()).ok_or_else(|| {
            DefinitionError::UnknownService {
                entry: name.clone(),
                service: service_ref.name().to_string(),
            }
        })?;
        if let (Some(port), Some(port_from)) = (service_ref.port(), &service.port_from) {
            overrides.set(port_from, port.to_string(), Source::ServicePort);
        }
    }

    // Overrides win over global defaults
    let mut merged = def.env.clone();
    merged.extend(overrides.resolve()?);

    let version = match (&entry.runtime, runtime_from_axis) {
        (Some(explicit), Some(from_axis)) if *explicit != from_axis => {
            return Err(DefinitionError::AmbiguousOverride {
                entry: name,
                key: "runtime".to_string(),
                first: explicit.clone(),
                second: from_axis,
            });
        }
        (Some(explicit), _) => explicit.clone(),
        (None, Some(from_axis)) => from_axis,
        (None, None) => return Err(DefinitionError::MissingRuntime { entry: name }),
    };

    if let Some(axis) = runtime_axis.and_then(|a| def.axis(a))
        && !axis.contains(&version)
    {
        return Err(DefinitionError::UnknownAxisValue {
            entry: name,
            axis: axis.name.clone(),
            value: version,
        });
    }

    // Every axis-bound variable must hold a declared value
    for (variable, value) in &merged {
        if let Some(axis) = def.axis_for_variable(variable)
            && !axis.contains(value)
        {
            return Err(DefinitionError::UnknownAxisValue {
                entry: name,
                axis: axis.name.clone(),
                value: value.clone(),
            });
        }
    }

    let mut matrix = BTreeMap::new();
    for axis in &def.axes {
        let value = if Some(axis.name.as_str()) == runtime_axis {
            Some(version.clone())
        } else if let Some(variable) = &axis.variable {
            merged.get(variable).cloned()
        } else {
            entry.axes.get(&axis.name).cloned()
        };
        if let Some(value) = value {
            matrix.insert(axis.name.clone(), value);
        }
    }

    let mut ctx = InterpolationContext::new();
    ctx.env = merged.clone();
    ctx.matrix = matrix.clone();
    ctx.runtime
        .insert("language".to_string(), def.runtime.language.clone());
    ctx.runtime.insert("version".to_string(), version.clone());

    for value in merged.values_mut() {
        if InterpolationContext::has_expressions(value) {
            *value = ctx.interpolate(value);
        }
    }
    ctx.env = merged.clone();

    for key in &def.required_env {
        if !merged.contains_key(key) {
            return Err(DefinitionError::MissingRequiredVariable {
                entry: name,
                key: key.clone(),
            });
        }
    }

    let mut services = Vec::with_capacity(entry.services.len());
    for service_ref in &entry.services {
        let service_name = service_ref.name();
        let Some(service) = def.services.get(service_name) else {
            return Err(DefinitionError::UnknownService {
                entry: name,
                service: service_name.to_string(),
            });
        };

        let version = merged.get(&service.version_from).cloned().ok_or_else(|| {
            DefinitionError::MissingServiceVersion {
                entry: name.clone(),
                service: service_name.to_string(),
                variable: service.version_from.clone(),
            }
        })?;

        let port_value = service_ref
            .port()
            .map(|p| p.to_string())
            .or_else(|| service.port_from.as_ref().and_then(|v| merged.get(v).cloned()))
            .or_else(|| service.default_port.map(|p| p.to_string()))
            .unwrap_or_default();
        let port = port_value
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| DefinitionError::InvalidPort {
                entry: name.clone(),
                service: service_name.to_string(),
                value: port_value.clone(),
            })?;

        let database = service.database.as_ref().map(|d| ctx.interpolate(d));

        let mut service_ctx = ctx.clone();
        service_ctx.service = BTreeMap::from([
            ("name".to_string(), service_name.to_string()),
            ("version".to_string(), version.clone()),
            ("port".to_string(), port.to_string()),
            ("database".to_string(), database.clone().unwrap_or_default()),
        ]);

        services.push(ServiceRequirement {
            name: service_name.to_string(),
            version,
            port,
            database,
            start: service.start.as_ref().map(|t| service_ctx.interpolate(t)),
            create_database: service
                .create_database
                .as_ref()
                .map(|t| service_ctx.interpolate(t)),
            stop: service.stop.as_ref().map(|t| service_ctx.interpolate(t)),
            ready_timeout_secs: service.ready_timeout_secs,
        });
    }

    let lookup = |key: &Option<String>| key.as_ref().and_then(|k| merged.get(k).cloned());
    let settings = JobSettings {
        variant: lookup(&def.keys.variant),
        test_filter: lookup(&def.keys.test_filter),
        dsn: lookup(&def.keys.dsn),
        docs: def
            .deploy
            .as_ref()
            .and_then(|d| merged.get(&d.flag))
            .is_some_and(|v| is_truthy(v)),
    };

    let install = entry.install.as_ref().unwrap_or(&def.install);
    let script = entry.script.as_ref().unwrap_or(&def.script);

    let label = entry.label.clone().unwrap_or_else(|| {
        format_display_name(&def.runtime.language, &version, runtime_axis, def, &matrix)
    });

    let job = JobSpec {
        index,
        label,
        runtime: RuntimeRequirement {
            language: def.runtime.language.clone(),
            version,
        },
        settings,
        services,
        workdir: entry.workdir.as_ref().map(|w| ctx.interpolate(w)),
        addons: entry.addons.clone(),
        install: install.iter().map(|c| ctx.interpolate(c)).collect(),
        script: script.iter().map(|c| ctx.interpolate(c)).collect(),
        allow_failure: entry.allow_failure,
        timeout_secs: u64::from(entry.timeout_minutes.unwrap_or(def.timeout_minutes)) * 60,
        env: merged,
    };

    debug!(index, label = %job.label, services = job.services.len(), "Resolved matrix entry");

    Ok(job)
}

fn format_display_name(
    language: &str,
    version: &str,
    runtime_axis: Option<&str>,
    def: &MatrixDefinition,
    matrix: &BTreeMap<String, String>,
) -> String {
    let parts: Vec<String> = def
        .axes
        .iter()
        .filter(|axis| Some(axis.name.as_str()) != runtime_axis)
        .filter_map(|axis| matrix.get(&axis.name).map(|v| format!("{}={}", axis.name, v)))
        .collect();

    if parts.is_empty() {
        format!("{} {}", language, version)
    } else {
        format!("{} {} ({})", language, version, parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DEFINITION: &str = r#"
name: psycopg3
runtime:
  language: python
  axis: python
axes:
  - name: python
    values: ["3.6", "3.7", "3.8", "3.9"]
  - name: impl
    variable: PSYCOPG3_IMPL
    values: ["c", "python"]
  - name: postgres
    variable: POSTGRES
    values: ["10", "11", "12", "13"]
env:
  PGPORT: "5432"
  PSYCOPG3_TEST_DSN: "dbname=psycopg3_test port=${{ env.PGPORT }}"
keys:
  variant: PSYCOPG3_IMPL
  test_filter: PYTEST_ADDOPTS
  dsn: PSYCOPG3_TEST_DSN
services:
  postgresql:
    version_from: POSTGRES
    port_from: PGPORT
    default_port: 5432
    database: psycopg3_test
    start: "pg_ctlcluster ${{ service.version }} main start"
install: ["pip install tox"]
script: ["tox"]
timeout_minutes: 30
deploy:
  branch: master
  flag: DEPLOY_DOCS
  run: ["./tools/deploy_docs.sh"]
entries:
  - runtime: "3.6"
    env: ["TOXENV=py36", "PSYCOPG3_IMPL=c", "POSTGRES=10", "PGPORT=5433"]
    services: [postgresql]
  - runtime: "3.8"
    axes:
      impl: python
      postgres: "12"
    env: ["PYTEST_ADDOPTS=-m 'not slow'"]
    services: [postgresql]
  - label: docs
    runtime: "3.8"
    env: ["TOXENV=docs", "DEPLOY_DOCS=1"]
    install: []
"#;

    fn definition() -> MatrixDefinition {
        MatrixDefinition::from_yaml(DEFINITION).unwrap()
    }

    fn expand(def: &MatrixDefinition) -> Result<Vec<JobSpec>, DefinitionError> {
        MatrixExpander::new(def)?.expand()
    }

    #[test]
    fn test_one_job_per_entry_in_order() {
        let jobs = expand(&definition()).unwrap();
        assert_eq!(jobs.len(), 3);
        let indexes: Vec<usize> = jobs.iter().map(|j| j.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(jobs[2].label, "docs");
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let def = definition();
        let expander = MatrixExpander::new(&def).unwrap();
        let first: Vec<JobSpec> = expander.jobs().map(Result::unwrap).collect();
        let second: Vec<JobSpec> = expander.jobs().map(Result::unwrap).collect();
        assert_eq!(first, second);
        assert_eq!(first, expand(&def).unwrap());
    }

    #[test]
    fn test_override_wins_over_global_default() {
        let jobs = expand(&definition()).unwrap();
        assert_eq!(jobs[0].env["PGPORT"], "5433");
        assert_eq!(jobs[1].env["PGPORT"], "5432");
    }

    #[test]
    fn test_values_are_interpolated_after_merge() {
        let jobs = expand(&definition()).unwrap();
        assert_eq!(
            jobs[0].env["PSYCOPG3_TEST_DSN"],
            "dbname=psycopg3_test port=5433"
        );
        assert_eq!(jobs[0].settings.dsn.as_deref(), Some("dbname=psycopg3_test port=5433"));
    }

    #[test]
    fn test_services_resolve_version_and_port() {
        let jobs = expand(&definition()).unwrap();
        let pg = &jobs[0].services[0];
        assert_eq!(pg.name, "postgresql");
        assert_eq!(pg.version, "10");
        assert_eq!(pg.port, 5433);
        assert_eq!(pg.database.as_deref(), Some("psycopg3_test"));
        assert_eq!(pg.start.as_deref(), Some("pg_ctlcluster 10 main start"));
        assert!(jobs[2].services.is_empty());
    }

    #[test]
    fn test_axis_selection_exports_variable() {
        let jobs = expand(&definition()).unwrap();
        assert_eq!(jobs[1].env["PSYCOPG3_IMPL"], "python");
        assert_eq!(jobs[1].env["POSTGRES"], "12");
        assert_eq!(jobs[1].settings.variant.as_deref(), Some("python"));
        assert_eq!(jobs[1].label, "python 3.8 (impl=python, postgres=12)");
    }

    #[test]
    fn test_test_filter_passes_through_verbatim() {
        let jobs = expand(&definition()).unwrap();
        assert_eq!(jobs[1].settings.test_filter.as_deref(), Some("-m 'not slow'"));
    }

    #[test]
    fn test_empty_install_phase_and_docs_flag() {
        let jobs = expand(&definition()).unwrap();
        assert!(jobs[2].install.is_empty());
        assert_eq!(jobs[2].script, vec!["tox".to_string()]);
        assert!(jobs[2].settings.docs);
        assert!(!jobs[0].settings.docs);
        assert_eq!(jobs[0].install, vec!["pip install tox".to_string()]);
    }

    #[test]
    fn test_timeout_from_definition() {
        let jobs = expand(&definition()).unwrap();
        assert_eq!(jobs[0].timeout_secs, 30 * 60);
    }

    #[test]
    fn test_later_env_item_wins() {
        let mut def = definition();
        def.entries[0].env.push("PGPORT=5434".to_string());
        let jobs = expand(&def).unwrap();
        assert_eq!(jobs[0].env["PGPORT"], "5434");
        assert_eq!(jobs[0].services[0].port, 5434);
    }

    #[test]
    fn test_conflicting_mechanisms_are_ambiguous() {
        let mut def = definition();
        def.entries[1]
            .variables
            .insert("POSTGRES".to_string(), "13".to_string());
        let err = expand(&def).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::AmbiguousOverride {
                entry: "#1".to_string(),
                key: "POSTGRES".to_string(),
                first: "12".to_string(),
                second: "13".to_string(),
            }
        );
    }

    #[test]
    fn test_env_list_cannot_override_axis_after_agreeing() {
        let mut def = definition();
        def.entries[1].env = vec!["POSTGRES=12".to_string(), "POSTGRES=13".to_string()];
        let err = expand(&def).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::AmbiguousOverride {
                entry: "#1".to_string(),
                key: "POSTGRES".to_string(),
                first: "12".to_string(),
                second: "13".to_string(),
            }
        );
    }

    #[test]
    fn test_agreeing_mechanisms_are_accepted() {
        let mut def = definition();
        def.entries[1]
            .variables
            .insert("POSTGRES".to_string(), "12".to_string());
        assert!(expand(&def).is_ok());
    }

    #[test]
    fn test_service_port_conflicting_with_variable() {
        let mut def = definition();
        def.entries[0].services = vec![trellis_core::definition::ServiceRef::Detailed {
            name: "postgresql".to_string(),
            port: Some(5440),
        }];
        let err = expand(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::AmbiguousOverride { ref key, .. } if key == "PGPORT"));
    }

    #[test]
    fn test_undeclared_axis_value_is_rejected() {
        let mut def = definition();
        def.entries[0].env = vec!["POSTGRES=9.4".to_string()];
        let err = expand(&def).unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::UnknownAxisValue { ref axis, ref value, .. }
                if axis == "postgres" && value == "9.4"
        ));
    }

    #[test]
    fn test_undeclared_runtime_is_rejected() {
        let mut def = definition();
        def.entries[2].runtime = Some("2.7".to_string());
        let err = expand(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownAxisValue { ref axis, .. } if axis == "python"));
    }

    #[test]
    fn test_missing_runtime() {
        let mut def = definition();
        def.entries[2].runtime = None;
        let err = expand(&def).unwrap_err();
        assert_eq!(err, DefinitionError::MissingRuntime { entry: "docs".to_string() });
    }

    #[test]
    fn test_required_env_is_enforced() {
        let mut def = definition();
        def.required_env = vec!["TOXENV".to_string()];
        let err = expand(&def).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::MissingRequiredVariable {
                entry: "#1".to_string(),
                key: "TOXENV".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_env_item() {
        let mut def = definition();
        def.entries[0].env.push("NOT_AN_ASSIGNMENT".to_string());
        let err = expand(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::MalformedEnv { .. }));
    }

    #[test]
    fn test_unknown_service() {
        let mut def = definition();
        def.entries[2].services = vec![trellis_core::definition::ServiceRef::Name("redis".to_string())];
        let err = expand(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownService { ref service, .. } if service == "redis"));
    }

    #[test]
    fn test_invalid_port() {
        let mut def = definition();
        def.entries[0].env.push("PGPORT=fivefour".to_string());
        let err = expand(&def).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidPort { ref value, .. } if value == "fivefour"));
    }

    #[test]
    fn test_duplicate_axis_value() {
        let mut def = definition();
        def.axes[1].values.push("c".to_string());
        assert!(matches!(
            MatrixExpander::new(&def),
            Err(DefinitionError::DuplicateAxisValue { .. })
        ));
    }

    #[test]
    fn test_no_entries() {
        let mut def = definition();
        def.entries.clear();
        assert!(matches!(MatrixExpander::new(&def), Err(DefinitionError::NoEntries)));
    }

    #[test]
    fn test_lazy_iteration_reports_bad_entry_and_continues() {
        let mut def = definition();
        def.entries[1].env.push("BROKEN".to_string());
        let expander = MatrixExpander::new(&def).unwrap();
        let mut jobs = expander.jobs();
        assert!(jobs.next().unwrap().is_ok());
        assert!(jobs.next().unwrap().is_err());
        assert!(jobs.next().unwrap().is_ok());
        assert!(jobs.next().is_none());
    }

    #[test]
    fn test_select_by_index_and_label() {
        let jobs = expand(&definition()).unwrap();
        assert_eq!(select_job(jobs.clone(), "1").unwrap().index, 1);
        assert_eq!(select_job(jobs.clone(), "docs").unwrap().index, 2);
        assert_eq!(
            select_job(jobs, "nope").unwrap_err(),
            DefinitionError::EntryNotFound("nope".to_string())
        );
    }

    #[test]
    fn test_select_prefers_index_over_numeric_label() {
        let mut def = definition();
        def.entries[0].label = Some("1".to_string());
        let jobs = expand(&def).unwrap();
        assert_eq!(select_job(jobs.clone(), "1").unwrap().index, 1);
        assert_eq!(select_job(jobs, "7").unwrap_err(), DefinitionError::EntryNotFound("7".to_string()));
    }
}
