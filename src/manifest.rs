use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::artifact::Labels;
use crate::pipeline::StageSpec;

pub const MANIFEST_VERSION: u32 = 1;

fn default_workspace() -> PathBuf {
    PathBuf::from(".conveyor")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    pub pipelines: Vec<PipelineSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    pub stages: Vec<StageSpec>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
        let mut manifest = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse manifest YAML: {}", path.display()))?;
        manifest.anchor_workspace(path);
        Ok(manifest)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// A relative workspace is taken relative to the manifest's directory.
    fn anchor_workspace(&mut self, manifest_path: &Path) {
        if self.workspace.is_relative()
            && let Some(parent) = manifest_path.parent()
            && !parent.as_os_str().is_empty()
        {
            self.workspace = parent.join(&self.workspace);
        }
    }

    pub fn pipeline(&self, name: &str) -> Result<&PipelineSpec> {
        self.pipelines
            .iter()
            .find(|pipeline| pipeline.name == name)
            .ok_or_else(|| {
                anyhow!(
                    "Pipeline '{}' not found. Declared pipelines: {}",
                    name,
                    self.pipeline_names().join(", ")
                )
            })
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.name.as_str()).collect()
    }
}

impl PipelineSpec {
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn stages_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a StageSpec> {
        self.stages.iter().filter(move |stage| stage.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
version: 1
labels:
  Project: flask-pipeline-demo
pipelines:
  - name: flask-app-ecs-pipeline
    environment:
      CLUSTER_NAME: ecs-cluster
    stages:
      - name: Source
        kind: source
        outputs: [src]
        params:
          repository: ./flask-app-repo
      - name: Build
        kind: build
        inputs: [src]
        outputs: [imagedefinitions]
"#;

    #[test]
    fn parses_pipelines_and_defaults() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.workspace, PathBuf::from(".conveyor"));
        assert_eq!(
            manifest.labels.get("Project").map(String::as_str),
            Some("flask-pipeline-demo")
        );

        let pipeline = manifest.pipeline("flask-app-ecs-pipeline").unwrap();
        assert_eq!(pipeline.stages.len(), 2);
        assert_eq!(pipeline.stage("Build").unwrap().inputs, vec!["src"]);
        assert_eq!(pipeline.stages_of_kind("source").count(), 1);
        assert!(pipeline.stage("Build").unwrap().params.is_none());
    }

    #[test]
    fn unknown_pipeline_lists_declared_names() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let err = manifest.pipeline("missing").unwrap_err();
        assert!(err.to_string().contains("flask-app-ecs-pipeline"));
    }

    #[test]
    fn load_anchors_workspace_next_to_manifest() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("conveyor.yaml");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.workspace, temp.path().join(".conveyor"));
    }
}
