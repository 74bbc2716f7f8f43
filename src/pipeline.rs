use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::{Artifact, Labels, PayloadRef};
use crate::error::{DefinitionError, ExecutionError, ValidationError};
use crate::manifest::PipelineSpec;

pub type StageParameters = Map<String, Value>;

/// Declared inputs of a stage, resolved from the artifact store in declaration order.
#[derive(Debug, Clone, Default)]
pub struct StageInputs<'a> {
    artifacts: Vec<&'a Artifact>,
}

impl<'a> StageInputs<'a> {
    pub fn new(artifacts: Vec<&'a Artifact>) -> Self {
        Self { artifacts }
    }

    pub fn get(&self, name: &str) -> Result<&'a Artifact, ValidationError> {
        self.artifacts
            .iter()
            .copied()
            .find(|artifact| artifact.name == name)
            .ok_or_else(|| ValidationError::UndeclaredInput(name.to_string()))
    }

    /// The primary input: the first declared one.
    pub fn first(&self) -> Option<&'a Artifact> {
        self.artifacts.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Artifact> + '_ {
        self.artifacts.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// Read-only view of the run a stage executes in.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub pipeline: &'a str,
    pub run_id: &'a str,
    pub stage: &'a str,
    pub index: usize,
    /// Scratch directory owned by this stage for this run.
    pub workspace: &'a Path,
    pub environment: &'a BTreeMap<String, String>,
    pub labels: &'a Labels,
    pub outputs: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub payload: PayloadRef,
    pub metadata: BTreeMap<String, String>,
}

impl ProducedArtifact {
    pub fn new(payload: PayloadRef) -> Self {
        Self {
            payload,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub type StageOutputs = BTreeMap<String, ProducedArtifact>;

pub trait Stage: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Output names the stage's own configuration will produce, if it knows them.
    fn configured_outputs(&self) -> Option<Vec<String>> {
        None
    }

    fn validate(&self, _inputs: &StageInputs<'_>) -> Result<(), ValidationError> {
        Ok(())
    }

    fn execute(
        &self,
        inputs: &StageInputs<'_>,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutputs, ExecutionError>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create(&self, kind: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            anyhow!(
                "Unknown stage kind '{}'. Available kinds: {}",
                kind,
                self.known_kinds().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

/// A stage together with its declared topology.
pub struct StageNode {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub stage: Box<dyn Stage>,
}

impl StageNode {
    pub fn new(name: impl Into<String>, stage: Box<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            stage,
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }
}

impl std::fmt::Debug for StageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageNode")
            .field("name", &self.name)
            .field("kind", &self.stage.kind())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Topology of one stage, independent of how it is executed.
#[derive(Debug, Clone, Copy)]
pub struct StageDecl<'a> {
    pub name: &'a str,
    pub inputs: &'a [String],
    pub outputs: &'a [String],
}

/// An artifact edge between two stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub artifact: String,
    pub producer: String,
    pub consumer: String,
}

/// A validated, linear pipeline whose declaration order is a topological order
/// of its artifact dependency graph.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    stages: Vec<StageNode>,
    environment: BTreeMap<String, String>,
    labels: Labels,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<StageNode>) -> Result<Self, DefinitionError> {
        let name = name.into();
        let decls: Vec<StageDecl<'_>> = stages
            .iter()
            .map(|node| StageDecl {
                name: &node.name,
                inputs: &node.inputs,
                outputs: &node.outputs,
            })
            .collect();
        check_topology(&name, &decls)?;
        Ok(Self {
            name,
            stages,
            environment: BTreeMap::new(),
            labels: Labels::new(),
        })
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|node| node.name == name)
    }

    pub fn edges(&self) -> Vec<Edge> {
        let decls: Vec<StageDecl<'_>> = self
            .stages
            .iter()
            .map(|node| StageDecl {
                name: &node.name,
                inputs: &node.inputs,
                outputs: &node.outputs,
            })
            .collect();
        edges(&decls)
    }
}

/// Checks that `stages`, in the given order, form a valid dependency chain.
pub fn check_topology(pipeline: &str, stages: &[StageDecl<'_>]) -> Result<(), DefinitionError> {
    if stages.is_empty() {
        return Err(DefinitionError::Empty(pipeline.to_string()));
    }

    let mut seen = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        if seen.insert(stage.name, idx).is_some() {
            return Err(DefinitionError::DuplicateStage(stage.name.to_string()));
        }
    }

    let producers = producer_index(stages)?;

    for stage in stages {
        for input in stage.inputs {
            if !producers.contains_key(input.as_str()) {
                return Err(DefinitionError::UnresolvedInput {
                    stage: stage.name.to_string(),
                    artifact: input.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(stages, &producers) {
        return Err(DefinitionError::Cycle(cycle));
    }

    for (idx, stage) in stages.iter().enumerate() {
        for input in stage.inputs {
            let producer = producers[input.as_str()];
            if producer >= idx {
                return Err(DefinitionError::ForwardReference {
                    stage: stage.name.to_string(),
                    artifact: input.clone(),
                    producer: stages[producer].name.to_string(),
                });
            }
        }
    }

    Ok(())
}

pub fn edges(stages: &[StageDecl<'_>]) -> Vec<Edge> {
    let mut producers: HashMap<&str, &str> = HashMap::new();
    for stage in stages {
        for output in stage.outputs {
            producers.entry(output.as_str()).or_insert(stage.name);
        }
    }
    let mut edges = Vec::new();
    for stage in stages {
        for input in stage.inputs {
            if let Some(producer) = producers.get(input.as_str()) {
                edges.push(Edge {
                    artifact: input.clone(),
                    producer: (*producer).to_string(),
                    consumer: stage.name.to_string(),
                });
            }
        }
    }
    edges
}

fn producer_index<'a>(
    stages: &[StageDecl<'a>],
) -> Result<HashMap<&'a str, usize>, DefinitionError> {
    let mut producers: HashMap<&'a str, usize> = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        for output in stage.outputs {
            if let Some(&first) = producers.get(output.as_str()) {
                return Err(DefinitionError::DuplicateOutput {
                    artifact: output.clone(),
                    first: stages[first].name.to_string(),
                    second: stage.name.to_string(),
                });
            }
            producers.insert(output.as_str(), idx);
        }
    }
    Ok(producers)
}

fn find_cycle(stages: &[StageDecl<'_>], producers: &HashMap<&str, usize>) -> Option<Vec<String>> {
    let dependencies: Vec<Vec<usize>> = stages
        .iter()
        .map(|stage| {
            let mut deps: Vec<usize> = stage
                .inputs
                .iter()
                .filter_map(|input| producers.get(input.as_str()).copied())
                .collect();
            deps.dedup();
            deps
        })
        .collect();

    let mut visited = vec![false; stages.len()];
    let mut on_path = vec![false; stages.len()];
    let mut path = Vec::new();

    for start in 0..stages.len() {
        if !visited[start]
            && let Some(cycle) = dfs_cycle(start, &dependencies, &mut visited, &mut on_path, &mut path)
        {
            return Some(cycle.into_iter().map(|idx| stages[idx].name.to_string()).collect());
        }
    }
    None
}

fn dfs_cycle(
    node: usize,
    dependencies: &[Vec<usize>],
    visited: &mut [bool],
    on_path: &mut [bool],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited[node] = true;
    on_path[node] = true;
    path.push(node);

    for &dep in &dependencies[node] {
        if on_path[dep] {
            let start = path.iter().position(|&n| n == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep);
            return Some(cycle);
        }
        if !visited[dep]
            && let Some(cycle) = dfs_cycle(dep, dependencies, visited, on_path, path)
        {
            return Some(cycle);
        }
    }

    on_path[node] = false;
    path.pop();
    None
}

/// Instantiates every stage of `spec` through `registry` and validates the topology.
pub fn build_pipeline(
    registry: &StageRegistry,
    spec: &PipelineSpec,
    labels: &Labels,
) -> Result<Pipeline> {
    let mut nodes = Vec::with_capacity(spec.stages.len());
    for stage_spec in &spec.stages {
        let params = stage_spec.params.clone().unwrap_or_default();
        let stage = registry.create(&stage_spec.kind, params).with_context(|| {
            format!(
                "Failed to create stage '{}' of kind '{}'",
                stage_spec.name, stage_spec.kind
            )
        })?;
        nodes.push(
            StageNode::new(&stage_spec.name, stage)
                .with_inputs(stage_spec.inputs.iter().cloned())
                .with_outputs(stage_spec.outputs.iter().cloned()),
        );
    }

    let mut merged_labels = labels.clone();
    merged_labels.extend(spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

    let pipeline = Pipeline::new(&spec.name, nodes)
        .with_context(|| format!("Invalid pipeline '{}'", spec.name))?
        .with_environment(spec.environment.clone())
        .with_labels(merged_labels);
    Ok(pipeline)
}
