pub mod artifact;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod lockfile;
pub mod manifest;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod shell;
pub mod stages;
pub mod targets;
pub mod templates;
pub mod validation;
pub mod watch;

pub use artifact::{Artifact, ArtifactStore, PayloadRef};
pub use manifest::Manifest;
pub use orchestrator::{Orchestrator, RunReport, RunState};
pub use pipeline::{Pipeline, Stage, StageNode, StageRegistry};
