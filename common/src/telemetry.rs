// Telemetry: structured logging, OTLP tracing and Prometheus metrics

use crate::models::{JobKind, RunStatus};
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const SERVICE_NAME: &str = "backup-orchestrator";

/// Install the JSON log subscriber.
///
/// `RUST_LOG` wins over `log_level`. Spans additionally go to the OTLP
/// collector at `tracing_endpoint` when one is configured.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", log_level, e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let otel_layer = match tracing_endpoint {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Log subscriber already installed: {}", e))?;

    tracing::info!(log_level, tracing_endpoint, "Logging ready");
    Ok(())
}

fn otlp_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("OTLP exporter for {}: {}", endpoint, e))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(SERVICE_NAME))
}

/// Flush remaining spans; call on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe every metric
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("job_run_success_total", "Runs that finished successfully");
    describe_counter!("job_run_failed_total", "Runs that failed");
    describe_counter!(
        "job_run_partial_total",
        "Cleanup runs where some files could not be deleted"
    );
    describe_counter!(
        "job_run_skipped_total",
        "Fires dropped because the job was still running"
    );
    describe_counter!(
        "cleanup_files_deleted_total",
        "Backup files removed by retention cleanup"
    );
    describe_counter!(
        "job_bytes_moved_total",
        "Bytes written by backups, pushed by syncs or freed by cleanup"
    );
    describe_histogram!("job_run_duration_seconds", "Duration of job runs in seconds");
    describe_gauge!("scheduled_jobs", "Jobs with an armed timer");
    describe_gauge!("running_jobs", "Jobs currently executing");

    tracing::info!(%addr, "Serving Prometheus metrics");

    Ok(())
}

fn run_counter(status: RunStatus) -> Option<&'static str> {
    match status {
        RunStatus::Success => Some("job_run_success_total"),
        RunStatus::Failed => Some("job_run_failed_total"),
        RunStatus::Partial => Some("job_run_partial_total"),
        RunStatus::Running => None,
    }
}

/// Count a finished run and record its duration and volume
pub fn record_run_finished(
    job_id: &Uuid,
    kind: JobKind,
    status: RunStatus,
    duration_seconds: f64,
    bytes_moved: Option<u64>,
) {
    let Some(name) = run_counter(status) else {
        return;
    };
    counter!(name, "job_id" => job_id.to_string(), "kind" => kind.as_str()).increment(1);
    histogram!("job_run_duration_seconds", "kind" => kind.as_str()).record(duration_seconds);
    if let Some(bytes) = bytes_moved {
        counter!("job_bytes_moved_total", "kind" => kind.as_str()).increment(bytes);
    }
}

/// Count a fire dropped by the at-most-one-running gate
pub fn record_run_skipped(job_id: &Uuid, kind: JobKind) {
    counter!("job_run_skipped_total", "job_id" => job_id.to_string(), "kind" => kind.as_str())
        .increment(1);
}

pub fn record_files_deleted(count: u64) {
    counter!("cleanup_files_deleted_total").increment(count);
}

pub fn update_scheduled_jobs(count: usize) {
    gauge!("scheduled_jobs").set(count as f64);
}

pub fn update_running_jobs(count: usize) {
    gauge!("running_jobs").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_runs_are_not_counted() {
        assert_eq!(run_counter(RunStatus::Running), None);
        assert_eq!(run_counter(RunStatus::Partial), Some("job_run_partial_total"));
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        let job_id = Uuid::new_v4();
        record_run_finished(&job_id, JobKind::Backup, RunStatus::Success, 1.5, Some(4096));
        record_run_finished(&job_id, JobKind::Cleanup, RunStatus::Partial, 0.2, None);
        record_run_finished(&job_id, JobKind::Sync, RunStatus::Running, 0.0, None);
        record_run_skipped(&job_id, JobKind::Backup);
        record_files_deleted(3);
        update_scheduled_jobs(4);
        update_running_jobs(1);
    }
}
