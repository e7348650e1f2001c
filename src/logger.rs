use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const SERVICE_NAME: &str = "switchboard";
/// Target of the one-line-per-dispatch events written to the JSON event log.
pub const DISPATCH_TARGET: &str = "dispatch";

/// Install the global subscriber.
///
/// With an OTLP endpoint, logs, spans and metrics go to the collector and a
/// copy of the logs to stdout. Without one, logs go to a daily rolling text
/// file under `root` and dispatch events to a rolling JSON file next to it.
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    event_file: String,
    log_level: String,
    otel_logs_endpoint: Option<String>,
    otel_events_endpoint: Option<String>,
) -> Result<Telemetry> {
    match (otel_logs_endpoint, otel_events_endpoint) {
        (None, None) => Telemetry::init_files(&log_level, root.join(log_file), root.join(event_file)),
        (logs, events) => {
            let logs = logs.or_else(|| events.clone()).unwrap_or_default();
            let events = events.unwrap_or_else(|| logs.clone());
            Telemetry::init_otlp(&log_level, &logs, &logs, &events)
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(end_point: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Keeps the telemetry pipelines alive; call `shutdown` to flush them.
pub enum Telemetry {
    Otlp {
        logger_provider: SdkLoggerProvider,
        tracer_provider: SdkTracerProvider,
        meter_provider: SdkMeterProvider,
    },
    Files {
        log_file: PathBuf,
        event_file: PathBuf,
    },
}

impl Telemetry {
    pub fn init_otlp(log_level: &str, logger_endpoint: &str, tracer_endpoint: &str, meter_endpoint: &str) -> Result<Self> {
        let logger_provider = init_logs(logger_endpoint)?;
        let tracer_provider = init_traces(tracer_endpoint)?;
        let meter_provider = init_metrics(meter_endpoint)?;

        let otel_logs_layer = {
            let filter = EnvFilter::try_new(log_level)?
                .add_directive("hyper=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter)
        };
        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::try_new(log_level)?.add_directive("opentelemetry=debug".parse()?));

        Registry::default().with(otel_logs_layer).with(fmt_layer).try_init()?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());
        info!(endpoint = logger_endpoint, "telemetry exported over OTLP");

        Ok(Telemetry::Otlp { logger_provider, tracer_provider, meter_provider })
    }

    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<Self> {
        let (log_dir, log_name) = split_log_path(&log_file)?;
        let (event_dir, event_name) = split_log_path(&event_file)?;

        let txt_layer = fmt::layer()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, log_name))
            .with_ansi(false)
            .with_filter(EnvFilter::try_new(log_level)?);

        // One JSON line per dispatch.
        let json_layer = fmt::layer()
            .json()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, event_dir, event_name))
            .with_target(true)
            .with_filter(EnvFilter::try_new(format!("{DISPATCH_TARGET}=info"))?);

        Registry::default().with(txt_layer).with(json_layer).try_init()?;
        info!(log = %log_file.display(), events = %event_file.display(), "logging to files");

        Ok(Telemetry::Files { log_file, event_file })
    }

    pub fn shutdown(&self) {
        if let Telemetry::Otlp { logger_provider, tracer_provider, meter_provider } = self {
            if let Err(e) = tracer_provider.shutdown() {
                warn!(error = %e, "tracer provider did not shut down cleanly");
            }
            if let Err(e) = meter_provider.shutdown() {
                warn!(error = %e, "meter provider did not shut down cleanly");
            }
            if let Err(e) = logger_provider.shutdown() {
                eprintln!("logger provider did not shut down cleanly: {e}");
            }
        }
    }
}

fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_paths_are_split_and_created() {
        let dir = TempDir::new().unwrap();
        let (parent, name) = split_log_path(&dir.path().join("logs/switchboard.log")).unwrap();
        assert_eq!(name, "switchboard.log");
        assert!(parent.is_dir());
        assert!(split_log_path(Path::new("/")).is_err());
    }
}
