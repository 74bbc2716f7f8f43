use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use conveyor::lockfile::generate_lock;
use conveyor::manifest::{Manifest, PipelineSpec};
use conveyor::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use conveyor::observability::server::MetricsServer;
use conveyor::orchestrator::{Orchestrator, RunReport};
use conveyor::pipeline::{Pipeline, StageRegistry, build_pipeline};
use conveyor::stages::{self, GitRepository};
use conveyor::templates::generate_template;
use conveyor::validation::validate_manifest;
use conveyor::watch::RevisionWatcher;
use serde_json::{Value, to_writer_pretty};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match command {
        Commands::Run {
            manifest,
            pipeline,
            all,
            workspace,
            report,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint: _,
        } => run_command(
            &manifest,
            RunSelection { pipeline, all },
            workspace,
            report,
            MetricsOutputs {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
                listen: metrics_listen,
            },
        ),
        Commands::Resume {
            manifest,
            pipeline,
            run_dir,
            from,
            report,
        } => resume_command(&manifest, &pipeline, &run_dir, &from, report),
        Commands::Watch {
            manifest,
            pipeline,
            interval,
            max_runs,
        } => watch_command(&manifest, &pipeline, interval, max_runs),
        Commands::Validate { manifest } => validate_command(&manifest),
        Commands::Lock { manifest, output } => lock_command(&manifest, &output),
        Commands::Graph { manifest, pipeline } => graph_command(&manifest, pipeline.as_deref()),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Init { template, output } => init_command(&template, output),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "conveyor")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

struct RunSelection {
    pipeline: Option<String>,
    all: bool,
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
    listen: Option<String>,
}

fn select_pipelines<'a>(
    manifest: &'a Manifest,
    selection: &RunSelection,
) -> Result<Vec<&'a PipelineSpec>> {
    match (&selection.pipeline, selection.all) {
        (Some(_), true) => bail!("--pipeline and --all cannot be combined"),
        (Some(name), false) => Ok(vec![manifest.pipeline(name)?]),
        (None, true) => Ok(manifest.pipelines.iter().collect()),
        (None, false) => match manifest.pipelines.as_slice() {
            [only] => Ok(vec![only]),
            [] => bail!("Manifest declares no pipelines"),
            _ => bail!(
                "Manifest declares several pipelines ({}); choose one with --pipeline or run them all with --all",
                manifest.pipeline_names().join(", ")
            ),
        },
    }
}

fn build_pipelines(
    manifest: &Manifest,
    registry: &StageRegistry,
    specs: &[&PipelineSpec],
) -> Result<Vec<Pipeline>> {
    specs
        .iter()
        .map(|spec| build_pipeline(registry, spec, &manifest.labels))
        .collect()
}

fn run_command(
    manifest_path: &Path,
    selection: RunSelection,
    workspace: Option<PathBuf>,
    report_path: Option<PathBuf>,
    metrics_outputs: MetricsOutputs,
) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let registry = build_registry();
    let specs = select_pipelines(&manifest, &selection)?;
    let pipelines = build_pipelines(&manifest, &registry, &specs)?;

    let workspace = workspace.unwrap_or_else(|| manifest.workspace.clone());
    let workspace = std::path::absolute(&workspace)
        .with_context(|| format!("Invalid workspace directory: {}", workspace.display()))?;
    let metrics = MetricsCollector::new();
    let orchestrator = Orchestrator::new(workspace).with_metrics(metrics.clone());

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &metrics_outputs.listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &metrics_outputs.listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let reports = if pipelines.len() == 1 {
        vec![orchestrator.run(&pipelines[0])]
    } else {
        orchestrator.run_all(&pipelines)
    };

    for report in &reports {
        print_report(report);
    }
    if let Some(path) = report_path {
        write_reports(&reports, &path)?;
    }
    emit_metrics(&metrics, &metrics_outputs)?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    finish(&reports)
}

fn resume_command(
    manifest_path: &Path,
    pipeline_name: &str,
    run_dir: &Path,
    from_stage: &str,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let registry = build_registry();
    let spec = manifest.pipeline(pipeline_name)?;
    let pipeline = build_pipeline(&registry, spec, &manifest.labels)?;

    let workspace = run_dir
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest.workspace.clone());
    let report = Orchestrator::new(workspace).resume(&pipeline, run_dir, from_stage)?;
    print_report(&report);
    if let Some(path) = report_path {
        report.write(&path)?;
    }
    finish(std::slice::from_ref(&report))
}

fn watch_command(
    manifest_path: &Path,
    pipeline_name: &str,
    interval_secs: u64,
    max_runs: Option<usize>,
) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let registry = build_registry();
    let spec = manifest.pipeline(pipeline_name)?;
    let repository = watched_repository(spec)?;
    let workspace = std::path::absolute(&manifest.workspace).with_context(|| {
        format!("Invalid workspace directory: {}", manifest.workspace.display())
    })?;
    let orchestrator = Orchestrator::new(workspace);

    info!(
        pipeline = pipeline_name,
        repository = %repository.display(),
        interval_secs,
        "Watching for new revisions"
    );
    let mut watcher = RevisionWatcher::new(GitRepository::new(repository));
    let mut failures = 0usize;
    let runs = watcher.watch(Duration::from_secs(interval_secs), max_runs, |revision| {
        info!(commit = revision.commit.as_str(), "Triggering run");
        let pipeline = build_pipeline(&registry, spec, &manifest.labels)?;
        let report = orchestrator.run(&pipeline);
        print_report(&report);
        if !report.succeeded() {
            failures += 1;
        }
        Ok(())
    })?;

    if failures > 0 {
        bail!("{failures} of {runs} triggered run(s) failed");
    }
    Ok(())
}

/// The repository of the pipeline's first source stage.
fn watched_repository(spec: &PipelineSpec) -> Result<PathBuf> {
    let source = spec.stages_of_kind("source").next().ok_or_else(|| {
        anyhow!(
            "Pipeline '{}' has no source stage to watch",
            spec.name
        )
    })?;
    match source.params.as_ref().and_then(|params| params.get("repository")) {
        Some(Value::String(path)) => Ok(PathBuf::from(path)),
        _ => bail!(
            "Source stage '{}' does not name a repository",
            source.name
        ),
    }
}

fn print_report(report: &RunReport) {
    println!(
        "{} {}: {} ({})",
        report.pipeline,
        report.run_id,
        report.state,
        report.run_dir.display()
    );
    match report.failed_stage() {
        None => info!(
            pipeline = report.pipeline.as_str(),
            run_id = report.run_id.as_str(),
            artifacts = ?report.artifact_names(),
            "Pipeline succeeded"
        ),
        Some((index, stage)) => {
            let cause = report.failure().unwrap_or("unknown failure");
            error!(
                pipeline = report.pipeline.as_str(),
                run_id = report.run_id.as_str(),
                stage_index = index,
                stage,
                "{cause}"
            );
            eprintln!(
                "Pipeline '{}' failed at stage {} ('{}'): {}",
                report.pipeline, index, stage, cause
            );
        }
    }
}

fn write_reports(reports: &[RunReport], path: &Path) -> Result<()> {
    if let [report] = reports {
        return report.write(path);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create run report: {}", path.display()))?;
    to_writer_pretty(file, reports)
        .with_context(|| format!("Failed to write run report: {}", path.display()))?;
    Ok(())
}

fn emit_metrics(metrics: &MetricsCollector, outputs: &MetricsOutputs) -> Result<()> {
    if !outputs.print && outputs.json.is_none() && outputs.prometheus.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if outputs.print {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &outputs.json {
        create_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &outputs.prometheus {
        create_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create metrics directory: {}", parent.display())
        })?;
    }
    Ok(())
}

fn finish(reports: &[RunReport]) -> Result<()> {
    let failed: Vec<String> = reports
        .iter()
        .filter_map(|report| {
            report
                .failed_stage()
                .map(|(index, stage)| format!("{} at stage {} ('{}')", report.pipeline, index, stage))
        })
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("Pipeline run failed: {}", failed.join("; ")))
    }
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stage kinds:");
    for name in registry.known_kinds() {
        println!("- {name}");
    }
}

fn validate_command(manifest_path: &Path) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let registry = build_registry();
    let report = validate_manifest(&manifest, &registry);

    for warning in &report.warnings {
        warn!(file = %manifest_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %manifest_path.display(), "Manifest validation passed");
        println!("{}: ok", manifest_path.display());
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %manifest_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Manifest validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_command(manifest_path: &Path, output_path: &Path) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let registry = build_registry();
    let report = validate_manifest(&manifest, &registry);

    for warning in &report.warnings {
        warn!(file = %manifest_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %manifest_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create lockfile directory: {}", parent.display())
        })?;
    }

    generate_lock(&manifest, output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn graph_command(manifest_path: &Path, pipeline: Option<&str>) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let registry = build_registry();
    let selection = RunSelection {
        pipeline: pipeline.map(str::to_string),
        all: pipeline.is_none(),
    };
    let specs = select_pipelines(&manifest, &selection)?;

    for pipeline in build_pipelines(&manifest, &registry, &specs)? {
        println!("{}:", pipeline.name());
        for (index, node) in pipeline.stages().iter().enumerate() {
            println!("  {index}. {} [{}]", node.name, node.stage.kind());
        }
        for edge in pipeline.edges() {
            println!(
                "  {} --{}--> {}",
                edge.producer, edge.artifact, edge.consumer
            );
        }
    }
    Ok(())
}

fn init_command(template: &str, output: Option<PathBuf>) -> Result<()> {
    let destination = output.unwrap_or_else(|| PathBuf::from(format!("conveyor-{template}.yaml")));
    let generated = generate_template(template, &destination)?;
    info!(
        template,
        path = %generated.display(),
        "Manifest template generated"
    );
    println!("{}", generated.display());
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Source -> build -> deploy pipeline orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline, or every pipeline of the manifest with --all.
    Run {
        manifest: PathBuf,
        #[arg(long)]
        pipeline: Option<String>,
        #[arg(long)]
        all: bool,
        /// Overrides the manifest's workspace directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Also write the run report(s) to this file.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Re-run an earlier run starting at the given stage.
    Resume {
        manifest: PathBuf,
        #[arg(long)]
        pipeline: String,
        /// Directory of the run to resume, as printed by `run`.
        #[arg(long = "run-dir")]
        run_dir: PathBuf,
        #[arg(long)]
        from: String,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Run the pipeline whenever its source repository gets a new commit.
    Watch {
        manifest: PathBuf,
        #[arg(long)]
        pipeline: String,
        #[arg(long, default_value_t = 30)]
        interval: u64,
        #[arg(long = "max-runs")]
        max_runs: Option<usize>,
    },
    Validate {
        manifest: PathBuf,
    },
    Lock {
        manifest: PathBuf,
        output: PathBuf,
    },
    /// Print execution order and artifact edges.
    Graph {
        manifest: PathBuf,
        #[arg(long)]
        pipeline: Option<String>,
    },
    ListStages,
    /// Write a starter manifest.
    Init {
        #[arg(long, value_parser = ["ecs", "infra"])]
        template: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
