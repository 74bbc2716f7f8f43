use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;

use crate::pipeline::{StageParameters, StageRegistry};

pub mod build;
pub mod deploy;
pub mod source;

pub use build::BuildStage;
pub use deploy::DeployStage;
pub use source::{GitRepository, Revision, SourceRepository, SourceStage};

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("source", |params| {
        Ok(Box::new(SourceStage::from_params(params)?))
    });
    registry.register("build", |params| {
        Ok(Box::new(BuildStage::from_params(params)?))
    });
    registry.register("deploy", |params| {
        Ok(Box::new(DeployStage::from_params(params)?))
    });
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn require_string(params: &mut StageParameters, kind: &str, key: &str) -> Result<String> {
    take_string(params, key)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("{kind} stage requires '{key}' parameter"))
}

/// Accepts a single string or a list of strings.
fn string_list(value: Value, what: &str) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => bail!("{what} must contain strings, found {other}"),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => bail!("{what} must be a string or a list of strings, found {other}"),
    }
}

fn take_string_map(params: &mut StageParameters, key: &str) -> Result<BTreeMap<String, String>> {
    let Some(value) = params.remove(key) else {
        return Ok(BTreeMap::new());
    };
    match value {
        Value::Object(entries) => entries
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(s) => Ok((name, s)),
                Value::Number(_) | Value::Bool(_) => Ok((name, value.to_string())),
                other => bail!("'{key}.{name}' must be a scalar, found {other}"),
            })
            .collect(),
        Value::Null => Ok(BTreeMap::new()),
        other => bail!("'{key}' must be a mapping, found {other}"),
    }
}

/// Fails on parameters the stage did not consume, which are almost always typos.
fn reject_unknown(params: &StageParameters, kind: &str) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<&str> = params.keys().map(String::as_str).collect();
    keys.sort_unstable();
    bail!("{kind} stage does not accept parameter(s): {}", keys.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> StageParameters {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn defaults_register_all_kinds() {
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry);
        assert_eq!(registry.known_kinds(), vec!["build", "deploy", "source"]);
    }

    #[test]
    fn string_map_stringifies_scalars() {
        let mut p = params(json!({"environment": {"CLUSTER_NAME": "ecs", "PORT": 8080}}));
        let env = take_string_map(&mut p, "environment").unwrap();
        assert_eq!(env["CLUSTER_NAME"], "ecs");
        assert_eq!(env["PORT"], "8080");
        assert!(p.is_empty());
    }

    #[test]
    fn string_list_accepts_single_value() {
        assert_eq!(
            string_list(json!("imagedefinitions.json"), "files").unwrap(),
            vec!["imagedefinitions.json"]
        );
        assert!(string_list(json!([1]), "files").is_err());
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let p = params(json!({"repositry": "x"}));
        let err = reject_unknown(&p, "source").unwrap_err();
        assert!(err.to_string().contains("repositry"));
    }
}
