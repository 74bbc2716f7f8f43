//! Shell-command build stage.
//!
//! Phases run in a fixed order (`pre_build`, `build`, `post_build`), each as a
//! single `sh -c` script with `set -e`, so a variable exported in one phase is
//! not visible in the next. Phases run in a private copy of the first input
//! (`<stage workspace>/tree`), never in the input payload itself. After the
//! last phase, files matching each artifact's patterns are copied out of that
//! tree into `<stage workspace>/artifacts/<name>`; those copies are the
//! artifact payloads.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use serde_json::Value;
use tracing::{debug, info};

use super::{reject_unknown, string_list, take_string, take_string_map};
use crate::artifact::{PayloadRef, copy_tree};
use crate::digest::digest_files;
use crate::error::{ExecutionError, ValidationError};
use crate::pipeline::{
    ProducedArtifact, Stage, StageContext, StageInputs, StageOutputs, StageParameters,
};
use crate::shell;

pub const PHASES: [&str; 3] = ["pre_build", "build", "post_build"];
pub const BUILD_LOG_FILE: &str = "build.log";
pub const BUILD_TREE_DIR: &str = "tree";

/// Absolute paths and `..` components would reach outside the build tree.
fn escapes_tree(path: &Path) -> bool {
    path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
}

#[derive(Debug, Clone, Default)]
pub struct BuildStage {
    environment: BTreeMap<String, String>,
    phases: Vec<(String, Vec<String>)>,
    artifacts: BTreeMap<String, Vec<String>>,
    working_directory: Option<PathBuf>,
}

impl BuildStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_phase<I, S>(mut self, phase: &str, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases.push((
            phase.to_string(),
            commands.into_iter().map(Into::into).collect(),
        ));
        self.phases
            .sort_by_key(|(name, _)| PHASES.iter().position(|p| p == name));
        self
    }

    pub fn with_artifact<I, S>(mut self, name: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts
            .insert(name.into(), patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let environment = take_string_map(&mut params, "environment")?;
        let working_directory = take_string(&mut params, "working_directory").map(PathBuf::from);
        if let Some(dir) = &working_directory
            && escapes_tree(dir)
        {
            bail!(
                "build stage 'working_directory' {} must be relative to the source tree",
                dir.display()
            );
        }

        let mut phases = Vec::new();
        if let Some(value) = params.remove("phases") {
            let Value::Object(mut entries) = value else {
                bail!("build stage 'phases' must be a mapping of phase name to commands");
            };
            for phase in PHASES {
                if let Some(commands) = entries.remove(phase) {
                    let commands = string_list(commands, &format!("phases.{phase}"))?;
                    if !commands.is_empty() {
                        phases.push((phase.to_string(), commands));
                    }
                }
            }
            if let Some(unknown) = entries.keys().next() {
                bail!(
                    "build stage has unknown phase '{}'; expected one of {}",
                    unknown,
                    PHASES.join(", ")
                );
            }
        }

        let mut artifacts = BTreeMap::new();
        if let Some(value) = params.remove("artifacts") {
            let Value::Object(entries) = value else {
                bail!("build stage 'artifacts' must map artifact names to file patterns");
            };
            for (name, patterns) in entries {
                let patterns = string_list(patterns, &format!("artifacts.{name}"))?;
                if patterns.is_empty() {
                    bail!("build artifact '{name}' lists no file patterns");
                }
                for pattern in &patterns {
                    glob::Pattern::new(pattern).map_err(|err| {
                        anyhow::anyhow!("artifact '{name}' pattern '{pattern}' is invalid: {err}")
                    })?;
                    if escapes_tree(Path::new(pattern)) {
                        bail!(
                            "artifact '{name}' pattern '{pattern}' must stay inside the build tree"
                        );
                    }
                }
                artifacts.insert(name, patterns);
            }
        }

        reject_unknown(&params, "build")?;
        Ok(Self {
            environment,
            phases,
            artifacts,
            working_directory,
        })
    }

    /// Copies the first input into the stage's own tree and returns the
    /// directory the phases run in.
    fn prepare_tree(
        &self,
        inputs: &StageInputs<'_>,
        ctx: &StageContext<'_>,
    ) -> Result<PathBuf, ExecutionError> {
        let tree = ctx.workspace.join(BUILD_TREE_DIR);
        fs::create_dir_all(&tree)
            .map_err(|err| ExecutionError::io(format!("cannot create {}", tree.display()), err))?;
        if let Some(artifact) = inputs.first() {
            let payload = artifact.payload.path();
            let copied = if payload.is_dir() {
                copy_tree(payload, &tree)
            } else {
                let file_name = payload.file_name().unwrap_or(payload.as_os_str());
                fs::copy(payload, tree.join(file_name)).map(|_| 1)
            };
            let files = copied.map_err(|err| {
                ExecutionError::io(
                    format!("cannot copy input '{}' from {}", artifact.name, payload.display()),
                    err,
                )
            })?;
            debug!(input = artifact.name.as_str(), files, "Input copied into build tree");
        }
        Ok(match &self.working_directory {
            Some(sub) => tree.join(sub),
            None => tree,
        })
    }

    fn command_env(
        &self,
        inputs: &StageInputs<'_>,
        ctx: &StageContext<'_>,
    ) -> BTreeMap<String, String> {
        let mut env = ctx.environment.clone();
        env.extend(self.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(commit) = inputs.first().and_then(|artifact| artifact.meta("commit")) {
            env.insert("SOURCE_VERSION".to_string(), commit.to_string());
        }
        env.insert("CONVEYOR_PIPELINE".to_string(), ctx.pipeline.to_string());
        env.insert("CONVEYOR_RUN_ID".to_string(), ctx.run_id.to_string());
        env.insert("CONVEYOR_STAGE".to_string(), ctx.stage.to_string());
        env.insert(
            "CONVEYOR_OUTPUT_DIR".to_string(),
            ctx.workspace.to_string_lossy().to_string(),
        );
        env
    }

    fn collect(
        &self,
        name: &str,
        patterns: &[String],
        cwd: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<ProducedArtifact, ExecutionError> {
        let destination = ctx.workspace.join("artifacts").join(name);
        let escaped_root = glob::Pattern::escape(&cwd.to_string_lossy());
        let mut copied = Vec::new();

        for pattern in patterns {
            if escapes_tree(Path::new(pattern)) {
                return Err(ExecutionError::Other(format!(
                    "artifact '{name}' pattern '{pattern}' must stay inside the build tree"
                )));
            }
            let full = format!("{escaped_root}/{pattern}");
            let matches = glob::glob(&full).map_err(|err| ExecutionError::Other(err.to_string()))?;
            let mut matched = false;
            for entry in matches {
                let path = entry.map_err(|err| {
                    ExecutionError::io(format!("cannot read match of '{pattern}'"), err.into_error())
                })?;
                if !path.is_file() {
                    continue;
                }
                matched = true;
                let relative = path.strip_prefix(cwd).unwrap_or(&path);
                let target = destination.join(relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|err| {
                        ExecutionError::io(format!("cannot create {}", parent.display()), err)
                    })?;
                }
                fs::copy(&path, &target).map_err(|err| {
                    ExecutionError::io(format!("cannot copy {}", path.display()), err)
                })?;
                copied.push(target);
            }
            if !matched {
                return Err(ExecutionError::MissingOutputFiles {
                    stage: ctx.stage.to_string(),
                    artifact: name.to_string(),
                    pattern: pattern.clone(),
                });
            }
        }

        copied.sort();
        copied.dedup();
        let digest = digest_files(&destination, &copied)
            .map_err(|err| ExecutionError::io(format!("cannot digest artifact '{name}'"), err))?;
        Ok(ProducedArtifact::new(PayloadRef::new(&destination))
            .with_meta("files", copied.len().to_string())
            .with_meta("sha256", digest))
    }
}

impl Stage for BuildStage {
    fn kind(&self) -> &'static str {
        "build"
    }

    fn configured_outputs(&self) -> Option<Vec<String>> {
        Some(self.artifacts.keys().cloned().collect())
    }

    fn validate(&self, inputs: &StageInputs<'_>) -> Result<(), ValidationError> {
        for artifact in inputs.iter() {
            if !artifact.payload.path().exists() {
                return Err(ValidationError::MalformedArtifact {
                    artifact: artifact.name.clone(),
                    reason: format!("payload {} does not exist", artifact.payload),
                });
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        inputs: &StageInputs<'_>,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutputs, ExecutionError> {
        let cwd = self.prepare_tree(inputs, ctx)?;
        if !cwd.is_dir() {
            return Err(ExecutionError::Other(format!(
                "working directory {} does not exist",
                cwd.display()
            )));
        }
        let env = self.command_env(inputs, ctx);
        let log_path = ctx.workspace.join(BUILD_LOG_FILE);
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|err| ExecutionError::io(format!("cannot open {}", log_path.display()), err))?;

        for (phase, commands) in &self.phases {
            info!(phase = phase.as_str(), commands = commands.len(), "Entering phase");
            let output = shell::run_script(&shell::script(commands), &cwd, &env)
                .map_err(|err| ExecutionError::io(format!("cannot spawn phase '{phase}'"), err))?;
            shell::log_output(phase, &output);
            let written = writeln!(log, "== {phase}")
                .and_then(|_| log.write_all(output.stdout.as_bytes()))
                .and_then(|_| log.write_all(output.stderr.as_bytes()));
            if let Err(err) = written {
                return Err(ExecutionError::io(
                    format!("cannot write {}", log_path.display()),
                    err,
                ));
            }
            if !output.success() {
                return Err(ExecutionError::CommandFailed {
                    stage: ctx.stage.to_string(),
                    phase: phase.clone(),
                    status: output.code(),
                });
            }
        }

        let mut outputs = StageOutputs::new();
        for (name, patterns) in &self.artifacts {
            let produced = self.collect(name, patterns, &cwd, ctx)?;
            outputs.insert(name.clone(), produced);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use serde_json::json;
    use tempfile::tempdir;

    fn ctx<'a>(
        workspace: &'a Path,
        env: &'a BTreeMap<String, String>,
        labels: &'a BTreeMap<String, String>,
        outputs: &'a [String],
    ) -> StageContext<'a> {
        StageContext {
            pipeline: "flask-app-ecs-pipeline",
            run_id: "run-1",
            stage: "Build",
            index: 1,
            workspace,
            environment: env,
            labels,
            outputs,
        }
    }

    #[test]
    fn writes_descriptor_and_collects_it() {
        let source = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("commit".to_string(), "tag123".to_string());
        let src = Artifact::new("Source", "src", PayloadRef::new(source.path()))
            .with_metadata(metadata);

        let stage = BuildStage::new()
            .with_env("ECR_REPO_URI", "repo")
            .with_phase(
                "post_build",
                [r#"printf '[{"name":"flask-app","imageUri":"%s"}]' "$ECR_REPO_URI:$SOURCE_VERSION" > imagedefinitions.json"#],
            )
            .with_artifact("imagedefinitions", ["imagedefinitions.json"]);

        let env = BTreeMap::new();
        let labels = BTreeMap::new();
        let outputs_decl = vec!["imagedefinitions".to_string()];
        let inputs = StageInputs::new(vec![&src]);
        let outputs = stage
            .execute(&inputs, &ctx(workspace.path(), &env, &labels, &outputs_decl))
            .unwrap();

        let produced = &outputs["imagedefinitions"];
        let copied = produced.payload.resolve("imagedefinitions.json");
        let content = fs::read_to_string(copied).unwrap();
        assert_eq!(content, r#"[{"name":"flask-app","imageUri":"repo:tag123"}]"#);
        assert_eq!(produced.metadata["files"], "1");
        assert!(workspace.path().join(BUILD_LOG_FILE).is_file());
        assert!(!source.path().join("imagedefinitions.json").exists());
    }

    #[test]
    fn phases_run_in_a_copy_of_the_input() {
        let source = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::write(source.path().join("Dockerfile"), "FROM python:3.12-slim\n").unwrap();
        let src = Artifact::new("Source", "src", PayloadRef::new(source.path()));

        let stage = BuildStage::new()
            .with_phase("build", ["test -f Dockerfile", "rm Dockerfile", "touch built.txt"])
            .with_artifact("out", ["built.txt"]);
        let env = BTreeMap::new();
        let labels = BTreeMap::new();
        let outputs = stage
            .execute(
                &StageInputs::new(vec![&src]),
                &ctx(workspace.path(), &env, &labels, &[]),
            )
            .unwrap();

        assert!(outputs["out"].payload.resolve("built.txt").is_file());
        assert!(source.path().join("Dockerfile").is_file());
        assert!(!source.path().join("built.txt").exists());
        assert!(workspace.path().join(BUILD_TREE_DIR).join("built.txt").is_file());
    }

    #[test]
    fn failing_phase_reports_exit_status() {
        let workspace = tempdir().unwrap();
        let stage = BuildStage::new()
            .with_phase("build", ["true", "exit 4"])
            .with_phase("pre_build", ["echo preparing"]);
        let env = BTreeMap::new();
        let labels = BTreeMap::new();

        let err = stage
            .execute(
                &StageInputs::default(),
                &ctx(workspace.path(), &env, &labels, &[]),
            )
            .unwrap_err();
        match err {
            ExecutionError::CommandFailed { phase, status, .. } => {
                assert_eq!(phase, "build");
                assert_eq!(status, Some(4));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn unmatched_artifact_pattern_fails() {
        let workspace = tempdir().unwrap();
        let stage = BuildStage::new().with_artifact("imagedefinitions", ["missing.json"]);
        let env = BTreeMap::new();
        let labels = BTreeMap::new();

        let err = stage
            .execute(
                &StageInputs::default(),
                &ctx(workspace.path(), &env, &labels, &[]),
            )
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MissingOutputFiles { .. }));
    }

    #[test]
    fn params_parse_phases_in_order_and_reject_unknown_phase() {
        let params = json!({
            "environment": {"CLUSTER_NAME": "ecs-cluster"},
            "phases": {
                "post_build": ["echo done"],
                "pre_build": "env",
                "build": ["docker build -t $ECR_REPO_URI:flask-app ."]
            },
            "artifacts": {"imagedefinitions": ["imagedefinitions.json"]}
        });
        let Value::Object(map) = params else { unreachable!() };
        let stage = BuildStage::from_params(map).unwrap();
        let order: Vec<&str> = stage.phases.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(order, PHASES.to_vec());
        assert_eq!(
            stage.configured_outputs(),
            Some(vec!["imagedefinitions".to_string()])
        );

        let Value::Object(bad) = json!({"phases": {"install": ["x"]}}) else {
            unreachable!()
        };
        let err = BuildStage::from_params(bad).unwrap_err();
        assert!(err.to_string().contains("unknown phase 'install'"));
    }

    #[test]
    fn params_reject_patterns_outside_the_build_tree() {
        for pattern in ["../other/*.json", "/etc/*.json", "dist/../../*.json"] {
            let Value::Object(params) = json!({"artifacts": {"imagedefinitions": [pattern]}})
            else {
                unreachable!()
            };
            let err = BuildStage::from_params(params).unwrap_err();
            assert!(
                err.to_string().contains("must stay inside the build tree"),
                "{pattern}: {err}"
            );
        }

        let Value::Object(params) = json!({"working_directory": "../elsewhere"}) else {
            unreachable!()
        };
        assert!(BuildStage::from_params(params).is_err());
    }

    #[test]
    fn escaping_pattern_copies_nothing_outside_the_artifact_dir() {
        let root = tempdir().unwrap();
        let workspace = root.path().join("01-Build");
        let sibling = root.path().join("01-Build").join("other");
        fs::create_dir_all(&sibling).unwrap();
        fs::write(sibling.join("leak.json"), "[]").unwrap();

        let stage = BuildStage::new().with_artifact("imagedefinitions", ["../other/*.json"]);
        let env = BTreeMap::new();
        let labels = BTreeMap::new();
        let err = stage
            .execute(
                &StageInputs::default(),
                &ctx(&workspace, &env, &labels, &[]),
            )
            .unwrap_err();

        assert!(err.to_string().contains("must stay inside the build tree"));
        assert!(!workspace.join("artifacts").exists());
    }

    #[test]
    fn validate_rejects_missing_payload() {
        let src = Artifact::new("Source", "src", PayloadRef::new("/definitely/not/here"));
        let err = BuildStage::new()
            .validate(&StageInputs::new(vec![&src]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedArtifact { .. }));
    }
}
