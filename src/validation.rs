use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::manifest::{MANIFEST_VERSION, Manifest, PipelineSpec};
use crate::pipeline::{StageDecl, StageRegistry, StageSpec, check_topology};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Checks a manifest without running anything: every stage must be
/// constructible and every pipeline's topology must hold.
pub fn validate_manifest(manifest: &Manifest, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.version != MANIFEST_VERSION {
        report
            .errors
            .push(format!("Unsupported manifest version: {}", manifest.version));
    }

    if manifest.pipelines.is_empty() {
        report
            .errors
            .push("Manifest must declare at least one pipeline".into());
    }

    let mut names = HashSet::new();
    for pipeline in &manifest.pipelines {
        if pipeline.name.trim().is_empty() {
            report.errors.push("Pipeline names cannot be empty".into());
        } else if !names.insert(pipeline.name.as_str()) {
            report
                .errors
                .push(format!("Pipeline '{}' is declared twice", pipeline.name));
        }
        report.merge(validate_pipeline(pipeline, registry));
    }

    report
}

pub fn validate_pipeline(pipeline: &PipelineSpec, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    let decls: Vec<StageDecl<'_>> = pipeline
        .stages
        .iter()
        .map(|stage| StageDecl {
            name: &stage.name,
            inputs: &stage.inputs,
            outputs: &stage.outputs,
        })
        .collect();
    if let Err(err) = check_topology(&pipeline.name, &decls) {
        report
            .errors
            .push(format!("Pipeline '{}': {}", pipeline.name, err));
    }

    for (idx, stage) in pipeline.stages.iter().enumerate() {
        report.merge(validate_stage(&pipeline.name, idx, stage, registry));
    }

    let consumed: HashSet<&str> = pipeline
        .stages
        .iter()
        .flat_map(|stage| stage.inputs.iter().map(String::as_str))
        .collect();
    let mut producers: HashMap<&str, &str> = HashMap::new();
    for stage in &pipeline.stages {
        for output in &stage.outputs {
            producers.entry(output.as_str()).or_insert(stage.name.as_str());
        }
    }
    let mut unused: Vec<(&str, &str)> = producers
        .into_iter()
        .filter(|(artifact, _)| !consumed.contains(artifact))
        .collect();
    unused.sort_unstable();
    // The last stage's outputs are the pipeline's results.
    let last = pipeline.stages.last().map(|stage| stage.name.as_str());
    for (artifact, producer) in unused {
        if Some(producer) != last {
            report.warnings.push(format!(
                "Pipeline '{}': artifact '{}' produced by '{}' is never consumed",
                pipeline.name, artifact, producer
            ));
        }
    }

    report
}

fn validate_stage(
    pipeline: &str,
    idx: usize,
    spec: &StageSpec,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let prefix = format!("Pipeline '{}' stage {} ('{}')", pipeline, idx + 1, spec.name);

    let params = spec.params.clone().unwrap_or_default();
    let stage = match registry.create(&spec.kind, params) {
        Ok(stage) => stage,
        Err(err) => {
            report.errors.push(format!("{prefix}: {err:#}"));
            return report;
        }
    };

    if let Some(configured) = stage.configured_outputs() {
        for output in &spec.outputs {
            if !configured.contains(output) {
                report.errors.push(format!(
                    "{prefix}: declares output '{output}' but its configuration never produces it"
                ));
            }
        }
        for output in configured {
            if !spec.outputs.contains(&output) {
                report.warnings.push(format!(
                    "{prefix}: configured artifact '{output}' is not declared as an output and will be dropped"
                ));
            }
        }
    }

    report
}
