//! Error taxonomy for pipeline definition, artifact storage and stage runs.

use thiserror::Error;

/// Failures raised by the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("artifact '{artifact}' was already produced in this run (by stage '{stage}')")]
    DuplicateArtifact { stage: String, artifact: String },
    #[error("artifact '{artifact}' not found; its producing stage has not completed")]
    ArtifactNotFound { artifact: String },
}

/// A stage's inputs are missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("input artifact '{artifact}' is malformed: {reason}")]
    MalformedArtifact { artifact: String, reason: String },
    #[error("stage requires input artifact '{0}' but it is not declared")]
    UndeclaredInput(String),
}

/// A deployment descriptor that cannot be read or is not well-formed.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("descriptor contains no image definitions")]
    Empty,
    #[error("entry {position} has an empty name")]
    EmptyName { position: usize },
    #[error("entry '{name}' has an empty imageUri")]
    EmptyImageUri { name: String },
    #[error("container '{name}' is listed twice")]
    DuplicateName { name: String },
}

/// A stage's action failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("stage '{stage}' phase '{phase}' exited with {}", describe_status(.status))]
    CommandFailed {
        stage: String,
        phase: String,
        status: Option<i32>,
    },
    #[error("stage '{stage}' produced no files for artifact '{artifact}' (pattern '{pattern}')")]
    MissingOutputFiles {
        stage: String,
        artifact: String,
        pattern: String,
    },
    #[error("external service '{service}' failed: {message}")]
    ExternalService {
        service: String,
        message: String,
        status: Option<i32>,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

impl ExecutionError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
            status: None,
        }
    }

    /// An external command that ran and exited unsuccessfully.
    pub fn external_exit(
        service: impl Into<String>,
        command: &str,
        status: Option<i32>,
    ) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: format!("{command} exited with {}", describe_status(&status)),
            status,
        }
    }

    /// Exit status of the failed action, when there was one.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { status, .. } | Self::ExternalService { status, .. } => *status,
            _ => None,
        }
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "no exit status (terminated by signal)".to_string(),
    }
}

/// Why a stage ended its run in `Failed`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Execution(_) => "execution",
        }
    }
}

/// Topology errors detected while constructing a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("pipeline '{0}' has no stages")]
    Empty(String),
    #[error("stage name '{0}' is declared more than once")]
    DuplicateStage(String),
    #[error("artifact '{artifact}' is declared as output of both '{first}' and '{second}'")]
    DuplicateOutput {
        artifact: String,
        first: String,
        second: String,
    },
    #[error("stage '{stage}' consumes '{artifact}' but no stage produces it")]
    UnresolvedInput { stage: String, artifact: String },
    #[error("pipeline contains a dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error(
        "stage '{stage}' consumes '{artifact}' produced by later stage '{producer}'; stages must follow dependency order"
    )]
    ForwardReference {
        stage: String,
        artifact: String,
        producer: String,
    },
}
