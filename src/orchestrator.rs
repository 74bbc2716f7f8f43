//! Sequential pipeline runs: `Pending -> Running(i) -> Succeeded | Failed(i)`.
//!
//! Stage `i` only executes once every declared input resolves in the run's
//! artifact store and the stage accepts them. The first failure ends the run.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactStore, Labels};
use crate::error::{ExecutionError, StageError, ValidationError};
use crate::observability::MetricsCollector;
use crate::pipeline::{Pipeline, StageContext, StageInputs, StageNode, StageOutputs};

pub const RUN_REPORT_FILE: &str = "run.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running { stage_index: usize },
    Succeeded,
    Failed { stage_index: usize, stage: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running { stage_index } => write!(f, "running({stage_index})"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { stage_index, stage } => write!(f, "failed({stage_index}, '{stage}')"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Never reached because an earlier stage failed.
    NotRun,
    /// Outputs carried over from the run being resumed.
    Reused,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    pub outputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub run_id: String,
    pub run_dir: PathBuf,
    #[serde(flatten)]
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub labels: Labels,
    pub stages: Vec<StageReport>,
    pub artifacts: Vec<Artifact>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Index and name of the stage that ended the run, if it failed.
    pub fn failed_stage(&self) -> Option<(usize, &str)> {
        match &self.state {
            RunState::Failed { stage_index, stage } => Some((*stage_index, stage.as_str())),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|stage| stage.status == StageStatus::Failed)
            .and_then(|stage| stage.failure.as_deref())
    }

    pub fn artifact_names(&self) -> Vec<&str> {
        self.artifacts.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create run report: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(())
    }
}

/// Runs pipelines, one fresh artifact namespace per run under `workspace`.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    workspace: PathBuf,
    metrics: MetricsCollector,
}

impl Orchestrator {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    #[instrument(skip(self, pipeline), fields(pipeline = %pipeline.name()))]
    pub fn run(&self, pipeline: &Pipeline) -> RunReport {
        let run_id = new_run_id();
        let run_dir = self.workspace.join(sanitize(pipeline.name())).join(&run_id);
        let store = ArtifactStore::new(&run_dir);
        self.drive(pipeline, run_id, run_dir, store, 0)
    }

    /// Runs independent pipelines concurrently, one thread each.
    pub fn run_all(&self, pipelines: &[Pipeline]) -> Vec<RunReport> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = pipelines
                .iter()
                .map(|pipeline| scope.spawn(move || self.run(pipeline)))
                .collect();
            handles
                .into_iter()
                .zip(pipelines)
                .map(|(handle, pipeline)| {
                    handle.join().unwrap_or_else(|_| {
                        self.aborted_report(pipeline, "pipeline thread panicked")
                    })
                })
                .collect()
        })
    }

    /// Re-runs a previous run from `from_stage`, reusing the artifacts produced
    /// before it and discarding everything produced at or after it.
    #[instrument(skip(self, pipeline, run_dir), fields(pipeline = %pipeline.name()))]
    pub fn resume(&self, pipeline: &Pipeline, run_dir: &Path, from_stage: &str) -> Result<RunReport> {
        let start = pipeline.stage_index(from_stage).ok_or_else(|| {
            anyhow!(
                "Stage '{}' is not part of pipeline '{}'",
                from_stage,
                pipeline.name()
            )
        })?;
        let mut store = ArtifactStore::load(run_dir)?;

        let rerun: Vec<&str> = pipeline.stages()[start..]
            .iter()
            .map(|node| node.name.as_str())
            .collect();
        let discarded = store.discard_produced_by(&rerun);
        for (offset, node) in pipeline.stages()[start..].iter().enumerate() {
            discard_stage_dir(&stage_dir(run_dir, start + offset, &node.name));
        }
        info!(from = from_stage, ?discarded, "Resuming run");

        let run_id = run_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(new_run_id);
        Ok(self.drive(pipeline, run_id, run_dir.to_path_buf(), store, start))
    }

    fn drive(
        &self,
        pipeline: &Pipeline,
        run_id: String,
        run_dir: PathBuf,
        mut store: ArtifactStore,
        start: usize,
    ) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_span = info_span!("run", pipeline = pipeline.name(), run_id = run_id.as_str());
        let _run_guard = run_span.enter();

        let mut reports: Vec<StageReport> = pipeline
            .stages()
            .iter()
            .enumerate()
            .map(|(index, node)| StageReport {
                index,
                name: node.name.clone(),
                kind: node.stage.kind().to_string(),
                status: if index < start
                    && node.outputs.iter().all(|output| store.contains(output))
                {
                    StageStatus::Reused
                } else {
                    StageStatus::NotRun
                },
                duration_ms: None,
                outputs: Vec::new(),
                failure: None,
                exit_status: None,
            })
            .collect();

        let mut state = RunState::Pending;
        info!(stages = pipeline.len(), start, "Pipeline run started");

        for (index, node) in pipeline.stages().iter().enumerate().skip(start) {
            state = RunState::Running { stage_index: index };
            let stage_span = info_span!("stage", stage = node.name.as_str(), index);
            let _stage_guard = stage_span.enter();
            debug!(%state, "Stage starting");

            let workspace = stage_dir(&run_dir, index, &node.name);
            let timer = self.metrics.start_stage(pipeline.name(), &node.name);
            let outcome = self
                .run_stage(pipeline, &run_id, index, node, &workspace, &store)
                .and_then(|outputs| {
                    commit_outputs(pipeline, node, outputs, &mut store).map_err(StageError::from)
                });
            let elapsed_ms = timer.elapsed().as_secs_f64() * 1_000.0;
            drop(timer);

            let report = &mut reports[index];
            report.duration_ms = Some(elapsed_ms);
            match outcome {
                Ok(produced) => {
                    info!(outputs = ?produced, duration_ms = elapsed_ms, "Stage succeeded");
                    report.status = StageStatus::Succeeded;
                    report.outputs = produced;
                }
                Err(err) => {
                    let exit_status = match &err {
                        StageError::Execution(exec) => exec.exit_status(),
                        StageError::Validation(_) => None,
                    };
                    error!(
                        kind = err.kind(),
                        exit_status = ?exit_status,
                        "Stage failed: {err}"
                    );
                    self.metrics.record_stage_failure(pipeline.name(), &node.name);
                    store.discard_produced_by(&[node.name.as_str()]);
                    discard_stage_dir(&workspace);
                    report.status = StageStatus::Failed;
                    report.failure = Some(err.to_string());
                    report.exit_status = exit_status;
                    state = RunState::Failed {
                        stage_index: index,
                        stage: node.name.clone(),
                    };
                    break;
                }
            }
        }

        if !state.is_terminal() {
            state = RunState::Succeeded;
        }

        let duration = clock.elapsed();
        self.metrics.record_run(state == RunState::Succeeded, duration);
        match &state {
            RunState::Failed { stage_index, stage } => {
                error!(stage_index, stage = stage.as_str(), "Pipeline run failed");
            }
            _ => info!(
                duration_ms = duration.as_secs_f64() * 1_000.0,
                "Pipeline run succeeded"
            ),
        }

        let report = RunReport {
            pipeline: pipeline.name().to_string(),
            run_id,
            run_dir: run_dir.clone(),
            state,
            started_at,
            finished_at: Utc::now(),
            labels: pipeline.labels().clone(),
            stages: reports,
            artifacts: store.iter().cloned().collect(),
        };
        if let Err(err) = report.write(&run_dir.join(RUN_REPORT_FILE)) {
            warn!("Failed to persist run report: {err:#}");
        }
        report
    }

    /// Gates a stage on its inputs, then executes it.
    fn run_stage(
        &self,
        pipeline: &Pipeline,
        run_id: &str,
        index: usize,
        node: &StageNode,
        workspace: &Path,
        store: &ArtifactStore,
    ) -> Result<StageOutputs, StageError> {
        let inputs = resolve_inputs(node, store)?;
        node.stage.validate(&inputs)?;

        fs::create_dir_all(workspace).map_err(|err| {
            ExecutionError::io(
                format!("failed to create stage workspace {}", workspace.display()),
                err,
            )
        })?;
        let ctx = StageContext {
            pipeline: pipeline.name(),
            run_id,
            stage: &node.name,
            index,
            workspace,
            environment: pipeline.environment(),
            labels: pipeline.labels(),
            outputs: &node.outputs,
        };
        Ok(node.stage.execute(&inputs, &ctx)?)
    }

    fn aborted_report(&self, pipeline: &Pipeline, reason: &str) -> RunReport {
        let now = Utc::now();
        let name = pipeline
            .stages()
            .first()
            .map(|node| node.name.clone())
            .unwrap_or_default();
        self.metrics.record_run(false, std::time::Duration::ZERO);
        RunReport {
            pipeline: pipeline.name().to_string(),
            run_id: new_run_id(),
            run_dir: self.workspace.join(sanitize(pipeline.name())),
            state: RunState::Failed {
                stage_index: 0,
                stage: name.clone(),
            },
            started_at: now,
            finished_at: now,
            labels: pipeline.labels().clone(),
            stages: vec![StageReport {
                index: 0,
                name,
                kind: String::new(),
                status: StageStatus::Failed,
                duration_ms: None,
                outputs: Vec::new(),
                failure: Some(reason.to_string()),
                exit_status: None,
            }],
            artifacts: Vec::new(),
        }
    }
}

fn resolve_inputs<'s>(
    node: &StageNode,
    store: &'s ArtifactStore,
) -> Result<StageInputs<'s>, ValidationError> {
    let mut artifacts = Vec::with_capacity(node.inputs.len());
    for name in &node.inputs {
        artifacts.push(store.get(name)?);
    }
    Ok(StageInputs::new(artifacts))
}

/// Moves declared outputs into the store, labelled with the run's labels.
fn commit_outputs(
    pipeline: &Pipeline,
    node: &StageNode,
    outputs: StageOutputs,
    store: &mut ArtifactStore,
) -> Result<Vec<String>, ExecutionError> {
    let mut committed = Vec::new();
    for (name, produced) in outputs {
        if !node.outputs.contains(&name) {
            warn!(artifact = name.as_str(), "Dropping undeclared output");
            continue;
        }
        let artifact = Artifact::new(&node.name, &name, produced.payload)
            .with_metadata(produced.metadata)
            .with_labels(pipeline.labels());
        store.insert(artifact)?;
        committed.push(name);
    }
    for declared in &node.outputs {
        if !committed.contains(declared) {
            warn!(artifact = declared.as_str(), "Declared output was not produced");
        }
    }
    store
        .persist()
        .map_err(|err| ExecutionError::Other(format!("{err:#}")))?;
    Ok(committed)
}

fn stage_dir(run_dir: &Path, index: usize, name: &str) -> PathBuf {
    run_dir.join(format!("{index:02}-{}", sanitize(name)))
}

fn discard_stage_dir(dir: &Path) {
    if dir.exists()
        && let Err(err) = fs::remove_dir_all(dir)
    {
        warn!(dir = %dir.display(), "Failed to discard stage workspace: {err}");
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        &Uuid::new_v4().simple().to_string()[..8]
    )
}
