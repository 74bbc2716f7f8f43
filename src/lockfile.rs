use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::manifest::Manifest;
use crate::pipeline::StageSpec;

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub manifest_version: u32,
    pub generated_at: DateTime<Utc>,
    pub pipelines: Vec<PipelineEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineEntry {
    pub name: String,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageLock {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    pub params_hash: String,
}

pub fn lock_manifest(manifest: &Manifest) -> PipelineLock {
    let pipelines = manifest
        .pipelines
        .iter()
        .map(|pipeline| PipelineEntry {
            name: pipeline.name.clone(),
            stages: pipeline
                .stages
                .iter()
                .map(|spec| StageLock {
                    name: spec.name.clone(),
                    kind: spec.kind.clone(),
                    inputs: spec.inputs.clone(),
                    outputs: spec.outputs.clone(),
                    params_hash: hash_params(spec),
                })
                .collect(),
        })
        .collect();

    PipelineLock {
        manifest_version: manifest.version,
        generated_at: Utc::now(),
        pipelines,
    }
}

pub fn generate_lock(manifest: &Manifest, path: &Path) -> Result<()> {
    let lock = lock_manifest(manifest);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(())
}

/// Hash of a stage's kind and parameters. Map keys serialize in sorted order,
/// so the hash does not depend on how the manifest orders them.
fn hash_params(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    let params = spec.params.clone().unwrap_or_default();
    let serialized = serde_json::to_vec(&params).unwrap_or_default();
    hasher.update(spec.kind.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
version: 1
pipelines:
  - name: infra
    stages:
      - name: Source
        kind: source
        outputs: [src]
        params: { repository: ./infra, branch: main }
      - name: Build
        kind: build
        inputs: [src]
        params:
          phases: { build: ["cdk deploy"] }
"#;

    #[test]
    fn pins_topology_and_param_hashes() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let lock = lock_manifest(&manifest);
        assert_eq!(lock.pipelines.len(), 1);
        let stages = &lock.pipelines[0].stages;
        assert_eq!(stages[0].outputs, vec!["src"]);
        assert_eq!(stages[1].inputs, vec!["src"]);
        assert_eq!(stages[0].params_hash.len(), 64);

        let reordered = MANIFEST.replace(
            "{ repository: ./infra, branch: main }",
            "{ branch: main, repository: ./infra }",
        );
        let relock = lock_manifest(&Manifest::from_yaml(&reordered).unwrap());
        assert_eq!(stages[0].params_hash, relock.pipelines[0].stages[0].params_hash);
    }

    #[test]
    fn param_changes_change_the_hash() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let changed = Manifest::from_yaml(&MANIFEST.replace("branch: main", "branch: dev")).unwrap();
        assert_ne!(
            lock_manifest(&manifest).pipelines[0].stages[0].params_hash,
            lock_manifest(&changed).pipelines[0].stages[0].params_hash
        );
    }

    #[test]
    fn writes_yaml_lockfile() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("conveyor.lock");
        generate_lock(&Manifest::from_yaml(MANIFEST).unwrap(), &path).unwrap();
        let parsed: PipelineLock =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.pipelines[0].stages[1].kind, "build");
    }
}
