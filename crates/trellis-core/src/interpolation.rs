use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("interpolation pattern is valid")
});

/// Context for `${{ ... }}` interpolation in variable values and templates.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Merged job variables
    pub env: BTreeMap<String, String>,
    /// Axis name -> selected value
    pub matrix: BTreeMap<String, String>,
    /// Runtime fields: `language`, `version`
    pub runtime: BTreeMap<String, String>,
    /// Service fields: `name`, `version`, `port`, `database`
    pub service: BTreeMap<String, String>,
}

impl InterpolationContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ env.KEY }}` / `${{ KEY }}` - job variable
    /// - `${{ matrix.axis }}` - selected axis value
    /// - `${{ runtime.version }}` - runtime field
    /// - `${{ service.port }}` - service field (service templates only)
    ///
    /// Substitution is single-pass: replaced text is not interpolated again.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    /// Whether the input contains any expression.
    pub fn has_expressions(input: &str) -> bool {
        EXPRESSION.is_match(input)
    }

    fn resolve_expression(&self, expr: &str) -> String {
        let lookup = |map: &BTreeMap<String, String>, key: &str| {
            map.get(key).cloned().unwrap_or_default()
        };

        if let Some(key) = expr.strip_prefix("env.") {
            return lookup(&self.env, key);
        }
        if let Some(key) = expr.strip_prefix("matrix.") {
            return lookup(&self.matrix, key);
        }
        if let Some(key) = expr.strip_prefix("runtime.") {
            return lookup(&self.runtime, key);
        }
        if let Some(key) = expr.strip_prefix("service.") {
            return lookup(&self.service, key);
        }

        lookup(&self.env, expr)
    }
}
