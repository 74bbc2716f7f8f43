use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    /// Keyed by `<pipeline>/<stage>`.
    pub stages: BTreeMap<String, StageMetrics>,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub pipeline: String,
    pub stage: String,
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared, internally synchronised metrics sink. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, pipeline: &str, stage: &str) -> StageTimer {
        StageTimer {
            pipeline: pipeline.to_string(),
            stage: stage.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_stage_failure(&self, pipeline: &str, stage: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            stage_entry(&mut guard, pipeline, stage).failures += 1;
        }
    }

    pub fn record_run(&self, succeeded: bool, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            if succeeded {
                guard.runs_succeeded += 1;
            } else {
                guard.runs_failed += 1;
            }
            guard.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

fn stage_entry<'a>(
    snapshot: &'a mut MetricsSnapshot,
    pipeline: &str,
    stage: &str,
) -> &'a mut StageMetrics {
    snapshot
        .stages
        .entry(format!("{pipeline}/{stage}"))
        .or_insert_with(|| StageMetrics {
            pipeline: pipeline.to_string(),
            stage: stage.to_string(),
            ..StageMetrics::default()
        })
}

/// Records one stage call and its duration when dropped.
pub struct StageTimer {
    pipeline: String,
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = stage_entry(&mut guard, &self.pipeline, &self.stage);
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            pipeline = self.pipeline.as_str(),
            stage = self.stage.as_str(),
            duration_ms,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        runs_succeeded = snapshot.runs_succeeded,
        runs_failed = snapshot.runs_failed,
        "Pipeline metrics summary"
    );
    for metrics in snapshot.stages.values() {
        info!(
            pipeline = metrics.pipeline.as_str(),
            stage = metrics.stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP conveyor_runs_total Pipeline runs by outcome\n");
        output.push_str("# TYPE conveyor_runs_total counter\n");
        output.push_str(&format!(
            "conveyor_runs_total{{outcome=\"succeeded\"}} {}\n",
            self.runs_succeeded
        ));
        output.push_str(&format!(
            "conveyor_runs_total{{outcome=\"failed\"}} {}\n",
            self.runs_failed
        ));
        output.push_str("# HELP conveyor_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE conveyor_stage_calls_total counter\n");
        output.push_str("# HELP conveyor_stage_failures_total Stage failure count\n");
        output.push_str("# TYPE conveyor_stage_failures_total counter\n");
        output.push_str(
            "# HELP conveyor_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE conveyor_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP conveyor_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE conveyor_stage_duration_seconds_max gauge\n");
        for metrics in self.stages.values() {
            let labels = format!(
                "pipeline=\"{}\",stage=\"{}\"",
                metrics.pipeline, metrics.stage
            );
            output.push_str(&format!(
                "conveyor_stage_calls_total{{{labels}}} {}\n",
                metrics.calls
            ));
            output.push_str(&format!(
                "conveyor_stage_failures_total{{{labels}}} {}\n",
                metrics.failures
            ));
            output.push_str(&format!(
                "conveyor_stage_duration_seconds_total{{{labels}}} {:.6}\n",
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "conveyor_stage_duration_seconds_max{{{labels}}} {:.6}\n",
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP conveyor_run_duration_seconds_total Accumulated run duration\n");
        output.push_str("# TYPE conveyor_run_duration_seconds_total counter\n");
        output.push_str(&format!(
            "conveyor_run_duration_seconds_total {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_call_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("app", "Build");
        }
        collector.record_stage_failure("app", "Build");
        collector.record_run(false, Duration::from_millis(5));

        let snapshot = collector.snapshot();
        let build = snapshot.stages.get("app/Build").unwrap();
        assert_eq!(build.calls, 1);
        assert_eq!(build.failures, 1);
        assert_eq!(snapshot.runs_failed, 1);
        assert_eq!(snapshot.runs_succeeded, 0);
    }

    #[test]
    fn prometheus_output_labels_pipeline_and_stage() {
        let collector = MetricsCollector::new();
        drop(collector.start_stage("infra", "Source"));
        collector.record_run(true, Duration::from_millis(1));

        let prom = collector.snapshot().to_prometheus();
        assert!(prom.contains("conveyor_stage_calls_total{pipeline=\"infra\",stage=\"Source\"} 1"));
        assert!(prom.contains("conveyor_runs_total{outcome=\"succeeded\"} 1"));
    }

    #[test]
    fn reset_clears_counters() {
        let collector = MetricsCollector::new();
        collector.record_run(true, Duration::ZERO);
        collector.reset();
        assert_eq!(collector.snapshot().runs_succeeded, 0);
    }
}
