use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{reject_unknown, require_string, take_string};
use crate::artifact::{PayloadRef, copy_tree};
use crate::error::ExecutionError;
use crate::pipeline::{
    ProducedArtifact, Stage, StageContext, StageInputs, StageOutputs, StageParameters,
};

/// HEAD of a repository at the moment it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub commit: String,
    pub branch: Option<String>,
    pub message: Option<String>,
}

/// Directory inside the source stage workspace holding the exported revision.
pub const SOURCE_TREE_DIR: &str = "tree";

pub trait SourceRepository: Send + Sync {
    /// Working tree the revision was read from.
    fn location(&self) -> &Path;

    fn head(&self) -> Result<Revision, ExecutionError>;

    /// Writes the files of `revision` into `destination`.
    ///
    /// The default copies the working tree as it stands, which suits
    /// checkouts already pinned to the revision `head` reports.
    fn export(&self, _revision: &Revision, destination: &Path) -> Result<(), ExecutionError> {
        copy_tree(self.location(), destination)
            .map(|_| ())
            .map_err(|err| {
                ExecutionError::io(
                    format!(
                        "cannot copy {} to {}",
                        self.location().display(),
                        destination.display()
                    ),
                    err,
                )
            })
    }
}

/// A local git working tree, read through the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitRepository {
    path: PathBuf,
}

impl GitRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn git(&self, args: &[&str]) -> Result<String, ExecutionError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .output()
            .map_err(|err| ExecutionError::external("git", err.to_string()))?;
        if !output.status.success() {
            return Err(ExecutionError::external(
                "git",
                format!(
                    "`git {}` failed in {}: {}",
                    args.join(" "),
                    self.path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl SourceRepository for GitRepository {
    fn location(&self) -> &Path {
        &self.path
    }

    fn head(&self) -> Result<Revision, ExecutionError> {
        let commit = self.git(&["rev-parse", "HEAD"])?;
        // Detached heads report "HEAD".
        let branch = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .filter(|name| name != "HEAD");
        let message = self
            .git(&["log", "-1", "--format=%s"])
            .ok()
            .filter(|m| !m.is_empty());
        Ok(Revision {
            commit,
            branch,
            message,
        })
    }

    /// `git archive <commit> | tar -x`, so uncommitted changes never reach a build.
    fn export(&self, revision: &Revision, destination: &Path) -> Result<(), ExecutionError> {
        fs::create_dir_all(destination).map_err(|err| {
            ExecutionError::io(format!("cannot create {}", destination.display()), err)
        })?;
        let mut archive = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(["archive", "--format=tar", revision.commit.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ExecutionError::external("git", err.to_string()))?;
        let stream = archive
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::external("git", "archive output was not captured"))?;
        let unpacked = Command::new("tar")
            .arg("-x")
            .arg("-C")
            .arg(destination)
            .stdin(Stdio::from(stream))
            .output()
            .map_err(|err| ExecutionError::external("tar", err.to_string()))?;
        let archived = archive
            .wait_with_output()
            .map_err(|err| ExecutionError::external("git", err.to_string()))?;
        if !archived.status.success() {
            return Err(ExecutionError::external(
                "git",
                format!(
                    "`git archive {}` failed in {}: {}",
                    revision.commit,
                    self.path.display(),
                    String::from_utf8_lossy(&archived.stderr).trim()
                ),
            ));
        }
        if !unpacked.status.success() {
            return Err(ExecutionError::external_exit(
                "tar",
                "tar -x",
                unpacked.status.code(),
            ));
        }
        Ok(())
    }
}

pub struct SourceStage {
    repository: Box<dyn SourceRepository>,
    branch: Option<String>,
}

impl SourceStage {
    pub fn new(repository: Box<dyn SourceRepository>) -> Self {
        Self {
            repository,
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let repository = require_string(&mut params, "source", "repository")?;
        let branch = take_string(&mut params, "branch");
        reject_unknown(&params, "source")?;
        Ok(Self {
            repository: Box::new(GitRepository::new(repository)),
            branch,
        })
    }
}

impl Stage for SourceStage {
    fn kind(&self) -> &'static str {
        "source"
    }

    fn execute(
        &self,
        _inputs: &StageInputs<'_>,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutputs, ExecutionError> {
        let revision = self.repository.head()?;
        if let Some(expected) = &self.branch
            && revision.branch.as_deref() != Some(expected.as_str())
        {
            return Err(ExecutionError::Other(format!(
                "repository {} is on branch {}, expected '{}'",
                self.repository.location().display(),
                revision.branch.as_deref().unwrap_or("<detached>"),
                expected
            )));
        }
        info!(
            commit = revision.commit.as_str(),
            branch = revision.branch.as_deref().unwrap_or("<detached>"),
            "Source revision resolved"
        );

        let tree = ctx.workspace.join(SOURCE_TREE_DIR);
        self.repository.export(&revision, &tree)?;
        debug!(tree = %tree.display(), "Source revision exported");

        let mut produced = ProducedArtifact::new(PayloadRef::new(&tree))
            .with_meta("commit", &revision.commit)
            .with_meta(
                "repository",
                self.repository.location().to_string_lossy().to_string(),
            );
        if let Some(branch) = &revision.branch {
            produced = produced.with_meta("branch", branch);
        }
        if let Some(message) = &revision.message {
            produced = produced.with_meta("message", message);
        }

        Ok(ctx
            .outputs
            .iter()
            .map(|name| (name.clone(), produced.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FixedRepository {
        path: PathBuf,
        revision: Mutex<Revision>,
    }

    impl SourceRepository for FixedRepository {
        fn location(&self) -> &Path {
            &self.path
        }

        fn head(&self) -> Result<Revision, ExecutionError> {
            Ok(self.revision.lock().unwrap().clone())
        }
    }

    fn fixed(path: &Path, branch: &str) -> FixedRepository {
        FixedRepository {
            path: path.to_path_buf(),
            revision: Mutex::new(Revision {
                commit: "tag123".into(),
                branch: Some(branch.into()),
                message: Some("initial".into()),
            }),
        }
    }

    fn run(
        stage: &SourceStage,
        workspace: &Path,
        outputs: &[String],
    ) -> Result<StageOutputs, ExecutionError> {
        let env = BTreeMap::new();
        let labels = BTreeMap::new();
        let ctx = StageContext {
            pipeline: "app",
            run_id: "run",
            stage: "Source",
            index: 0,
            workspace,
            environment: &env,
            labels: &labels,
            outputs,
        };
        stage.execute(&StageInputs::default(), &ctx)
    }

    #[test]
    fn produces_every_declared_output_with_revision() {
        let repo = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::write(repo.path().join("Dockerfile"), "FROM python:3.12-slim\n").unwrap();
        let stage = SourceStage::new(Box::new(fixed(repo.path(), "main")));
        let outputs = run(&stage, workspace.path(), &["src".to_string()]).unwrap();

        let src = &outputs["src"];
        assert_eq!(src.payload.path(), workspace.path().join(SOURCE_TREE_DIR));
        assert!(src.payload.resolve("Dockerfile").is_file());
        assert_eq!(src.metadata["commit"], "tag123");
        assert_eq!(src.metadata["branch"], "main");
        assert_eq!(src.metadata["repository"], repo.path().to_string_lossy());
    }

    #[test]
    fn snapshot_is_detached_from_the_working_tree() {
        let repo = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::write(repo.path().join("app.py"), "print('v1')\n").unwrap();
        let stage = SourceStage::new(Box::new(fixed(repo.path(), "main")));
        let outputs = run(&stage, workspace.path(), &["src".to_string()]).unwrap();

        fs::write(outputs["src"].payload.resolve("build-output.txt"), "x").unwrap();
        assert!(!repo.path().join("build-output.txt").exists());
    }

    #[test]
    fn branch_mismatch_fails() {
        let repo = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let stage = SourceStage::new(Box::new(fixed(repo.path(), "feature"))).with_branch("main");
        let err = run(&stage, workspace.path(), &["src".to_string()]).unwrap_err();
        assert!(err.to_string().contains("expected 'main'"));
        assert!(!workspace.path().join(SOURCE_TREE_DIR).exists());
    }

    #[test]
    fn repository_parameter_is_required() {
        assert!(SourceStage::from_params(StageParameters::new()).is_err());
    }
}
