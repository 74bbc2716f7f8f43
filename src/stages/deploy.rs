use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use super::{reject_unknown, take_string};
use crate::artifact::PayloadRef;
use crate::descriptor::{DEFAULT_DESCRIPTOR_FILE, DeploymentDescriptor};
use crate::error::{ExecutionError, ValidationError};
use crate::pipeline::{
    ProducedArtifact, Stage, StageContext, StageInputs, StageOutputs, StageParameters,
};
use crate::targets::{Deployment, DeploymentTarget, TargetSpec, wait_for_rollout};

pub const RECEIPT_FILE: &str = "deployment.json";

/// Hands the deployment descriptor from its input to a [`DeploymentTarget`]
/// and waits for the rollout to finish.
pub struct DeployStage {
    service: String,
    image_file: String,
    target: Box<dyn DeploymentTarget>,
}

impl DeployStage {
    pub fn new(service: impl Into<String>, target: Box<dyn DeploymentTarget>) -> Self {
        Self {
            service: service.into(),
            image_file: DEFAULT_DESCRIPTOR_FILE.to_string(),
            target,
        }
    }

    pub fn with_image_file(mut self, image_file: impl Into<String>) -> Self {
        self.image_file = image_file.into();
        self
    }

    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let service = super::require_string(&mut params, "deploy", "service")?;
        let image_file =
            take_string(&mut params, "image_file").unwrap_or_else(|| DEFAULT_DESCRIPTOR_FILE.into());
        let target = params
            .remove("target")
            .context("deploy stage requires 'target' parameter")?;
        let target: TargetSpec =
            serde_json::from_value(target).context("deploy stage has an invalid 'target'")?;
        reject_unknown(&params, "deploy")?;
        Ok(Self {
            service,
            image_file,
            target: target.build(),
        })
    }

    fn descriptor(&self, inputs: &StageInputs<'_>) -> Result<DeploymentDescriptor, ValidationError> {
        let artifact = inputs
            .first()
            .ok_or_else(|| ValidationError::UndeclaredInput(self.image_file.clone()))?;
        let path = artifact.payload.resolve(&self.image_file);
        DeploymentDescriptor::read(&path).map_err(|err| ValidationError::MalformedArtifact {
            artifact: artifact.name.clone(),
            reason: err.to_string(),
        })
    }
}

impl Stage for DeployStage {
    fn kind(&self) -> &'static str {
        "deploy"
    }

    fn validate(&self, inputs: &StageInputs<'_>) -> Result<(), ValidationError> {
        self.descriptor(inputs).map(|_| ())
    }

    fn execute(
        &self,
        inputs: &StageInputs<'_>,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutputs, ExecutionError> {
        let descriptor = self
            .descriptor(inputs)
            .map_err(|err| ExecutionError::Other(err.to_string()))?;
        let deployment = Deployment {
            service: self.service.clone(),
            images: descriptor.images,
            labels: ctx.labels.clone(),
        };
        info!(
            target_name = self.target.name(),
            service = deployment.service.as_str(),
            containers = deployment.images.len(),
            "Submitting deployment"
        );
        let receipt = self.target.submit(&deployment)?;
        wait_for_rollout(self.target.as_ref(), &receipt)?;

        let mut outputs = StageOutputs::new();
        if ctx.outputs.is_empty() {
            return Ok(outputs);
        }
        let path = ctx.workspace.join(RECEIPT_FILE);
        let rendered = serde_json::to_string_pretty(&receipt)
            .map_err(|err| ExecutionError::Other(err.to_string()))?;
        fs::write(&path, rendered)
            .map_err(|err| ExecutionError::io(format!("cannot write {}", path.display()), err))?;
        let produced = ProducedArtifact::new(PayloadRef::new(&path))
            .with_meta("service", &receipt.service)
            .with_meta("target", &receipt.target)
            .with_meta("revision", receipt.revision.to_string());
        for name in ctx.outputs {
            outputs.insert(name.clone(), produced.clone());
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::targets::{DeploymentReceipt, PollPolicy, RolloutStatus};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct Recorder {
        submitted: Arc<Mutex<Vec<Deployment>>>,
    }

    impl DeploymentTarget for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn submit(&self, deployment: &Deployment) -> Result<DeploymentReceipt, ExecutionError> {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(deployment.clone());
            Ok(DeploymentReceipt {
                target: "recorder".into(),
                service: deployment.service.clone(),
                revision: submitted.len() as u64,
                images: deployment.images.clone(),
            })
        }

        fn rollout_status(&self, _: &DeploymentReceipt) -> Result<RolloutStatus, ExecutionError> {
            Ok(RolloutStatus::Completed)
        }

        fn poll_policy(&self) -> PollPolicy {
            PollPolicy {
                interval: Duration::ZERO,
                max_polls: 1,
            }
        }
    }

    fn descriptor_artifact(dir: &Path, content: &str) -> Artifact {
        fs::write(dir.join(DEFAULT_DESCRIPTOR_FILE), content).unwrap();
        Artifact::new("Build", "imagedefinitions", PayloadRef::new(dir))
    }

    #[test]
    fn submits_descriptor_contents() {
        let temp = tempdir().unwrap();
        let artifact = descriptor_artifact(
            temp.path(),
            r#"[{"name":"flask-app","imageUri":"repo:tag123"}]"#,
        );
        let recorder = Recorder::default();
        let stage = DeployStage::new("flask-app-service", Box::new(recorder.clone()));
        let inputs = StageInputs::new(vec![&artifact]);
        stage.validate(&inputs).unwrap();

        let env = BTreeMap::new();
        let mut labels = BTreeMap::new();
        labels.insert("Project".to_string(), "flask-pipeline-demo".to_string());
        let outputs_decl = vec!["deployment".to_string()];
        let ctx = StageContext {
            pipeline: "flask-app-ecs-pipeline",
            run_id: "run",
            stage: "Deploy-to-ECS",
            index: 2,
            workspace: temp.path(),
            environment: &env,
            labels: &labels,
            outputs: &outputs_decl,
        };
        let outputs = stage.execute(&inputs, &ctx).unwrap();

        let submitted = recorder.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].images.len(), 1);
        assert_eq!(submitted[0].images[0].name, "flask-app");
        assert_eq!(submitted[0].images[0].image_uri, "repo:tag123");
        assert_eq!(submitted[0].labels["Project"], "flask-pipeline-demo");
        assert_eq!(outputs["deployment"].metadata["revision"], "1");
    }

    #[test]
    fn malformed_descriptor_fails_validation() {
        let temp = tempdir().unwrap();
        let artifact = descriptor_artifact(temp.path(), "[]");
        let stage = DeployStage::new("svc", Box::new(Recorder::default()));
        let err = stage
            .validate(&StageInputs::new(vec![&artifact]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedArtifact { .. }));
        assert!(err.to_string().contains("no image definitions"));
    }

    #[test]
    fn missing_input_fails_validation() {
        let stage = DeployStage::new("svc", Box::new(Recorder::default()));
        let err = stage.validate(&StageInputs::default()).unwrap_err();
        assert!(matches!(err, ValidationError::UndeclaredInput(_)));
    }

    #[test]
    fn params_require_target() {
        let serde_json::Value::Object(params) = serde_json::json!({"service": "svc"}) else {
            unreachable!()
        };
        let Err(err) = DeployStage::from_params(params) else {
            panic!("a deploy stage without target was accepted");
        };
        assert!(err.to_string().contains("target"));

        let serde_json::Value::Object(params) = serde_json::json!({
            "service": "svc",
            "image_file": "images.json",
            "target": {"type": "ledger", "directory": "/tmp/cluster"}
        }) else {
            unreachable!()
        };
        let Ok(stage) = DeployStage::from_params(params) else {
            panic!("ledger target was rejected");
        };
        assert_eq!(stage.image_file, "images.json");
        assert_eq!(stage.target.name(), "ledger");
    }
}
