//! Deserializes a workflow template from YAML or JSON and canonicalizes it
//! back to a `Value` for round-tripping.

use serde_json::Value;
use snafu::prelude::*;

use crate::spec::WorkflowSpec;
use crate::value::canonicalize;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid YAML template: {source}"))]
    Yaml { source: serde_yaml::Error },

    #[snafu(display("invalid JSON template: {source}"))]
    Json { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parse a YAML template, rejecting unknown fields, and fill in derived
/// data (`instance_id`, merged dependencies).
pub fn load_yaml(source: &str) -> Result<WorkflowSpec> {
    let spec: WorkflowSpec = serde_yaml::from_str(source).context(YamlSnafu)?;
    Ok(spec.finalize())
}

/// Parse a JSON template, rejecting unknown fields, and fill in derived
/// data (`instance_id`, merged dependencies).
pub fn load_json(source: &str) -> Result<WorkflowSpec> {
    let spec: WorkflowSpec = serde_json::from_str(source).context(JsonSnafu)?;
    Ok(spec.finalize())
}

/// Serialize a spec to its deterministic canonical JSON representation
/// (sorted object keys), used to verify `template -> graph -> template`
/// round-trips modulo key ordering.
#[must_use]
pub fn to_canonical_value(spec: &WorkflowSpec) -> Value {
    let value = serde_json::to_value(spec).expect("WorkflowSpec always serializes");
    canonicalize(&value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::indexing_slicing)]
    use super::*;

    const TEMPLATE: &str = r#"
name: demo
tasks:
  gen:
    type: generator
    config:
      seed: 1
  stats:
    type: aggregator
    config:
      input: "${gen.numbers}"
    dependencies: [gen]
dependencies:
  stats: [gen]
"#;

    #[test]
    fn loads_yaml_and_merges_dependencies() {
        let spec = load_yaml(TEMPLATE).unwrap();
        assert_eq!(spec.name, "demo");
        assert_eq!(spec.tasks["stats"].instance_id, "stats");
        assert_eq!(spec.tasks["stats"].dependencies, vec!["gen".to_string()]);
    }

    #[test]
    fn canonical_round_trip_is_idempotent_modulo_key_order() {
        let spec = load_yaml(TEMPLATE).unwrap();
        let once = to_canonical_value(&spec);
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(load_yaml("not: [valid").is_err());
    }
}
