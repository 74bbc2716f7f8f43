//! Starter manifests for `conveyor init`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::artifact::Labels;
use crate::manifest::{MANIFEST_VERSION, Manifest, PipelineSpec};
use crate::pipeline::{StageParameters, StageSpec};

pub const TEMPLATES: [&str; 2] = ["ecs", "infra"];

pub fn generate_template(name: &str, destination: &Path) -> Result<PathBuf> {
    let manifest = match name {
        "ecs" => ecs_template(),
        "infra" => infra_template(),
        other => bail!(
            "Unknown template '{other}'. Available templates: {}",
            TEMPLATES.join(", ")
        ),
    };

    let rendered = serde_yaml::to_string(&manifest)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write manifest: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn project_labels() -> Labels {
    let mut labels = Labels::new();
    labels.insert("Project".into(), "flask-pipeline-demo".into());
    labels
}

/// Application pipeline: Source -> Build (container image) -> Deploy-to-ECS.
fn ecs_template() -> Manifest {
    let mut environment = BTreeMap::new();
    environment.insert("CLUSTER_NAME".into(), "ecs-cluster".into());
    environment.insert(
        "ECR_REPO_URI".into(),
        "111111111111.dkr.ecr.eu-central-1.amazonaws.com/flask-ecr-rep".into(),
    );

    let build = json!({
        "phases": {
            "pre_build": ["env", "export TAG=${SOURCE_VERSION}"],
            "build": [
                "docker build -t $ECR_REPO_URI:flask-app .",
                "$(aws ecr get-login --no-include-email)",
                "docker push $ECR_REPO_URI:flask-app"
            ],
            "post_build": [
                "echo \"In Post-Build Stage\"",
                "printf '[{\"name\":\"flask-app\",\"imageUri\":\"%s\"}]' $ECR_REPO_URI:flask-app > imagedefinitions.json",
                "pwd; ls -al; cat imagedefinitions.json"
            ]
        },
        "artifacts": { "imagedefinitions": ["imagedefinitions.json"] }
    });
    let deploy = json!({
        "service": "flask-app-service",
        "image_file": "imagedefinitions.json",
        "target": {
            "type": "command",
            "deploy": "aws ecs update-service --cluster ecs-cluster --service \"$SERVICE_NAME\" --force-new-deployment",
            "status": "aws ecs wait services-stable --cluster ecs-cluster --services \"$SERVICE_NAME\"",
            "poll_interval_secs": 15,
            "max_polls": 40
        }
    });

    Manifest {
        version: MANIFEST_VERSION,
        workspace: PathBuf::from(".conveyor"),
        labels: project_labels(),
        pipelines: vec![PipelineSpec {
            name: "flask-app-ecs-pipeline".into(),
            environment,
            labels: Labels::new(),
            stages: vec![
                stage("Source", "source", &[], &["src"], source_params("./flask-app-repo")),
                stage("Build", "build", &["src"], &["imagedefinitions"], params(build)),
                stage("Deploy-to-ECS", "deploy", &["imagedefinitions"], &[], params(deploy)),
            ],
        }],
    }
}

/// Infrastructure pipeline: Source -> Build, where the build deploys the stack itself.
fn infra_template() -> Manifest {
    let build = json!({
        "phases": {
            "pre_build": [
                "npm install -g typescript",
                "npm install -g aws-cdk",
                "npm install -g ts-node",
                "npm install -g construct",
                "npm install"
            ],
            "build": ["cdk deploy FlaskAppECSStack --no-rollback --require-approval never"]
        }
    });

    Manifest {
        version: MANIFEST_VERSION,
        workspace: PathBuf::from(".conveyor"),
        labels: project_labels(),
        pipelines: vec![PipelineSpec {
            name: "flask-app-cdk-pipeline".into(),
            environment: BTreeMap::new(),
            labels: Labels::new(),
            stages: vec![
                stage("Source", "source", &[], &["src"], source_params("./flask-infra-repo")),
                stage("Build", "build", &["src"], &[], params(build)),
            ],
        }],
    }
}

fn source_params(repository: &str) -> StageParameters {
    params(json!({ "repository": repository, "branch": "master" }))
}

fn params(value: Value) -> StageParameters {
    match value {
        Value::Object(map) => map,
        _ => StageParameters::new(),
    }
}

fn stage(
    name: &str,
    kind: &str,
    inputs: &[&str],
    outputs: &[&str],
    params: StageParameters,
) -> StageSpec {
    StageSpec {
        name: name.into(),
        kind: kind.into(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        params: Some(params),
    }
}
