//! Container orchestration collaborators a deploy stage hands descriptors to.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::Labels;
use crate::descriptor::{DeploymentDescriptor, ImageDefinition};
use crate::error::ExecutionError;
use crate::shell;

/// What a deploy stage submits: a service and the images it should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub service: String,
    pub images: Vec<ImageDefinition>,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReceipt {
    pub target: String,
    pub service: String,
    pub revision: u64,
    #[serde(default)]
    pub images: Vec<ImageDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 60,
        }
    }
}

pub trait DeploymentTarget: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, deployment: &Deployment) -> Result<DeploymentReceipt, ExecutionError>;

    fn rollout_status(&self, receipt: &DeploymentReceipt) -> Result<RolloutStatus, ExecutionError>;

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default()
    }
}

/// Polls until the rollout completes. Exhausting the policy is an external failure.
pub fn wait_for_rollout(
    target: &dyn DeploymentTarget,
    receipt: &DeploymentReceipt,
) -> Result<(), ExecutionError> {
    let policy = target.poll_policy();
    for attempt in 1..=policy.max_polls.max(1) {
        match target.rollout_status(receipt)? {
            RolloutStatus::Completed => {
                info!(
                    target_name = target.name(),
                    service = receipt.service.as_str(),
                    revision = receipt.revision,
                    attempt,
                    "Rollout completed"
                );
                return Ok(());
            }
            RolloutStatus::InProgress => {
                debug!(attempt, "Rollout in progress");
                if attempt < policy.max_polls {
                    thread::sleep(policy.interval);
                }
            }
        }
    }
    Err(ExecutionError::external(
        target.name(),
        format!(
            "rollout of service '{}' did not complete after {} poll(s)",
            receipt.service, policy.max_polls
        ),
    ))
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_polls() -> u32 {
    60
}

/// `target:` block of a deploy stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSpec {
    Ledger {
        directory: PathBuf,
    },
    Command {
        deploy: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        working_directory: Option<PathBuf>,
        #[serde(default = "default_poll_interval")]
        poll_interval_secs: u64,
        #[serde(default = "default_max_polls")]
        max_polls: u32,
    },
}

impl TargetSpec {
    pub fn build(self) -> Box<dyn DeploymentTarget> {
        match self {
            Self::Ledger { directory } => Box::new(LedgerTarget::new(directory)),
            Self::Command {
                deploy,
                status,
                working_directory,
                poll_interval_secs,
                max_polls,
            } => Box::new(CommandTarget {
                deploy,
                status,
                working_directory: working_directory.unwrap_or_else(|| PathBuf::from(".")),
                policy: PollPolicy {
                    interval: Duration::from_secs(poll_interval_secs),
                    max_polls,
                },
            }),
        }
    }
}

/// Desired state of one service as recorded by [`LedgerTarget`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub service: String,
    pub revision: u64,
    pub containers: Vec<ImageDefinition>,
    #[serde(default)]
    pub labels: Labels,
    pub updated_at: DateTime<Utc>,
}

/// Keeps each service's desired state in `<directory>/<service>.json`.
/// Rollouts complete as soon as the state is written.
#[derive(Debug, Clone)]
pub struct LedgerTarget {
    directory: PathBuf,
}

impl LedgerTarget {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn state_path(&self, service: &str) -> PathBuf {
        self.directory.join(format!("{service}.json"))
    }

    pub fn state(&self, service: &str) -> Result<Option<ServiceState>, ExecutionError> {
        read_state(&self.state_path(service))
    }
}

fn read_state(path: &Path) -> Result<Option<ServiceState>, ExecutionError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .map_err(|err| ExecutionError::io(format!("cannot read {}", path.display()), err))?;
    serde_json::from_str(&content).map(Some).map_err(|err| {
        ExecutionError::external("ledger", format!("corrupt state {}: {err}", path.display()))
    })
}

impl DeploymentTarget for LedgerTarget {
    fn name(&self) -> &str {
        "ledger"
    }

    fn submit(&self, deployment: &Deployment) -> Result<DeploymentReceipt, ExecutionError> {
        fs::create_dir_all(&self.directory).map_err(|err| {
            ExecutionError::io(format!("cannot create {}", self.directory.display()), err)
        })?;
        let path = self.state_path(&deployment.service);
        let revision = read_state(&path)?.map_or(0, |state| state.revision) + 1;
        let state = ServiceState {
            service: deployment.service.clone(),
            revision,
            containers: deployment.images.clone(),
            labels: deployment.labels.clone(),
            updated_at: Utc::now(),
        };
        let rendered = serde_json::to_string_pretty(&state)
            .map_err(|err| ExecutionError::Other(err.to_string()))?;
        fs::write(&path, rendered)
            .map_err(|err| ExecutionError::io(format!("cannot write {}", path.display()), err))?;
        Ok(DeploymentReceipt {
            target: self.name().to_string(),
            service: deployment.service.clone(),
            revision,
            images: deployment.images.clone(),
        })
    }

    fn rollout_status(&self, receipt: &DeploymentReceipt) -> Result<RolloutStatus, ExecutionError> {
        match self.state(&receipt.service)? {
            Some(state) if state.revision >= receipt.revision => Ok(RolloutStatus::Completed),
            _ => Ok(RolloutStatus::InProgress),
        }
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::ZERO,
            max_polls: 1,
        }
    }
}

/// Delegates to user commands, e.g. a cloud CLI `update-service` call.
///
/// Both commands see `SERVICE_NAME`, `IMAGE_URIS` (space separated) and
/// `IMAGE_DEFINITIONS` (the descriptor JSON). A zero exit from `status`
/// means the rollout finished.
#[derive(Debug, Clone)]
pub struct CommandTarget {
    deploy: String,
    status: Option<String>,
    working_directory: PathBuf,
    policy: PollPolicy,
}

impl CommandTarget {
    fn env(&self, service: &str, images: &[ImageDefinition]) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("SERVICE_NAME".to_string(), service.to_string());
        env.insert(
            "IMAGE_URIS".to_string(),
            images
                .iter()
                .map(|image| image.image_uri.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        env.insert(
            "IMAGE_DEFINITIONS".to_string(),
            DeploymentDescriptor {
                images: images.to_vec(),
            }
            .to_json(),
        );
        env
    }
}

impl DeploymentTarget for CommandTarget {
    fn name(&self) -> &str {
        "command"
    }

    fn submit(&self, deployment: &Deployment) -> Result<DeploymentReceipt, ExecutionError> {
        let env = self.env(&deployment.service, &deployment.images);
        let output = shell::run_script(&self.deploy, &self.working_directory, &env)
            .map_err(|err| ExecutionError::external("command", err.to_string()))?;
        shell::log_output("deploy", &output);
        if !output.success() {
            return Err(ExecutionError::external_exit(
                "command",
                "deploy command",
                output.code(),
            ));
        }
        Ok(DeploymentReceipt {
            target: self.name().to_string(),
            service: deployment.service.clone(),
            revision: Utc::now().timestamp().max(0) as u64,
            images: deployment.images.clone(),
        })
    }

    fn rollout_status(&self, receipt: &DeploymentReceipt) -> Result<RolloutStatus, ExecutionError> {
        let Some(status) = &self.status else {
            return Ok(RolloutStatus::Completed);
        };
        let env = self.env(&receipt.service, &receipt.images);
        let output = shell::run_script(status, &self.working_directory, &env)
            .map_err(|err| ExecutionError::external("command", err.to_string()))?;
        Ok(if output.success() {
            RolloutStatus::Completed
        } else {
            RolloutStatus::InProgress
        })
    }

    fn poll_policy(&self) -> PollPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn deployment(uri: &str) -> Deployment {
        let mut labels = Labels::new();
        labels.insert("Project".into(), "flask-pipeline-demo".into());
        Deployment {
            service: "flask-app-service".into(),
            images: vec![ImageDefinition::new("flask-app", uri)],
            labels,
        }
    }

    #[test]
    fn ledger_increments_revision_per_submit() {
        let temp = tempdir().unwrap();
        let target = LedgerTarget::new(temp.path().join("cluster"));

        let first = target.submit(&deployment("repo:1")).unwrap();
        let second = target.submit(&deployment("repo:2")).unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);

        wait_for_rollout(&target, &second).unwrap();
        let state = target.state("flask-app-service").unwrap().unwrap();
        assert_eq!(state.containers[0].image_uri, "repo:2");
        assert_eq!(
            state.labels.get("Project").map(String::as_str),
            Some("flask-pipeline-demo")
        );
    }

    #[test]
    fn command_target_exposes_descriptor_env() {
        let temp = tempdir().unwrap();
        let target = TargetSpec::Command {
            deploy: "printf '%s|%s' \"$SERVICE_NAME\" \"$IMAGE_URIS\" > deployed.txt".into(),
            status: Some("test -f deployed.txt".into()),
            working_directory: Some(temp.path().to_path_buf()),
            poll_interval_secs: 0,
            max_polls: 2,
        }
        .build();

        let receipt = target.submit(&deployment("repo:tag123")).unwrap();
        wait_for_rollout(target.as_ref(), &receipt).unwrap();
        let written = fs::read_to_string(temp.path().join("deployed.txt")).unwrap();
        assert_eq!(written, "flask-app-service|repo:tag123");
    }

    #[test]
    fn exhausted_polls_are_an_external_failure() {
        let temp = tempdir().unwrap();
        let target = TargetSpec::Command {
            deploy: "true".into(),
            status: Some("false".into()),
            working_directory: Some(temp.path().to_path_buf()),
            poll_interval_secs: 0,
            max_polls: 2,
        }
        .build();

        let receipt = target.submit(&deployment("repo:1")).unwrap();
        let err = wait_for_rollout(target.as_ref(), &receipt).unwrap_err();
        assert!(matches!(err, ExecutionError::ExternalService { .. }));
    }

    #[test]
    fn failing_deploy_command_is_reported() {
        let temp = tempdir().unwrap();
        let target = TargetSpec::Command {
            deploy: "exit 7".into(),
            status: None,
            working_directory: Some(temp.path().to_path_buf()),
            poll_interval_secs: 0,
            max_polls: 1,
        }
        .build();
        let err = target.submit(&deployment("repo:1")).unwrap_err();
        assert_eq!(err.exit_status(), Some(7));
        assert!(
            err.to_string().contains("deploy command exited with exit status 7"),
            "{err}"
        );
    }

    #[test]
    fn status_command_sees_submitted_images() {
        let temp = tempdir().unwrap();
        let target = TargetSpec::Command {
            deploy: "true".into(),
            status: Some(
                "printf '%s|%s' \"$IMAGE_URIS\" \"$IMAGE_DEFINITIONS\" > status.txt".into(),
            ),
            working_directory: Some(temp.path().to_path_buf()),
            poll_interval_secs: 0,
            max_polls: 1,
        }
        .build();

        let receipt = target.submit(&deployment("repo:tag123")).unwrap();
        wait_for_rollout(target.as_ref(), &receipt).unwrap();
        let seen = fs::read_to_string(temp.path().join("status.txt")).unwrap();
        assert_eq!(
            seen,
            r#"repo:tag123|[{"name":"flask-app","imageUri":"repo:tag123"}]"#
        );
    }

    #[test]
    fn target_spec_parses_from_yaml() {
        let spec: TargetSpec =
            serde_yaml::from_str("type: ledger\ndirectory: .conveyor/cluster\n").unwrap();
        assert!(matches!(spec, TargetSpec::Ledger { .. }));
    }
}
