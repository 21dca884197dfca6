use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};
use worker_channel::Response;

use crate::error::BridgeError;

const SERVICE_NAME: &str = "worker-bridge";

/// Keeps whichever telemetry backend was installed alive for the process lifetime.
pub enum TelemetryGuard {
    Otlp(Telemetry),
    Files(FileTelemetry),
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otlp(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Install the global tracing subscriber: OTLP when an endpoint is given,
/// otherwise a rolling text log plus a JSON "request" event log under `root`.
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    event_file: String,
    log_level: String,
    otel_logs_endpoint: Option<String>,
    otel_events_endpoint: Option<String>,
) -> Result<TelemetryGuard> {
    let otel_enabled = otel_logs_endpoint.is_some() || otel_events_endpoint.is_some();

    if otel_enabled {
        let logs_endpoint = otel_logs_endpoint
            .as_deref()
            .or(otel_events_endpoint.as_deref())
            .unwrap_or_default();
        let telemetry = Telemetry::init(
            &log_level,
            logs_endpoint,
            /* tracer_endpoint */ logs_endpoint,
            /* meter_endpoint  */ otel_events_endpoint.as_deref().unwrap_or(logs_endpoint),
        )?;
        Ok(TelemetryGuard::Otlp(telemetry))
    } else {
        let files = FileTelemetry::init_files(
            &log_level,
            root.join(&log_file),
            root.join(&event_file),
        )?;
        Ok(TelemetryGuard::Files(files))
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
        .context("building OTLP log exporter")?;
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
        .context("building OTLP span exporter")?;
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
        .context("building OTLP metric exporter")?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// OTLP-HTTP logs, traces and metrics.
pub struct Telemetry {
    /// emits OTel Logs from `tracing::event!`
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    /// backs the global meter used by [`BridgeMetrics`]
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(
        log_level: &str,
        logger_endpoint: &str,
        tracer_endpoint: &str,
        meter_endpoint: &str,
    ) -> Result<Self> {
        let logger_provider = init_logs(logger_endpoint)?;
        let tracer_provider = init_traces(tracer_endpoint)?;
        let meter_provider = init_metrics(meter_endpoint)?;

        let otel_logs_layer = {
            let mut filter = env_filter(log_level);
            for directive in ["hyper=off", "tonic=off", "h2=off", "reqwest=off"] {
                filter = filter.add_directive(directive.parse()?);
            }
            OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter)
        };

        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(env_filter(log_level).add_directive("opentelemetry=debug".parse()?));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .context("installing tracing subscriber")?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(self) {
        if let Err(e) = self.meter_provider.shutdown() {
            warn!(error = %e, "meter provider shutdown failed");
        }
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!(error = %e, "tracer provider shutdown failed");
        }
        if let Err(e) = self.logger_provider.shutdown() {
            warn!(error = %e, "logger provider shutdown failed");
        }
    }
}

/// File-only telemetry: a rolling text log and a rolling JSON "request" log.
pub struct FileTelemetry {
    pub log_file: PathBuf,
    pub event_file: PathBuf,
}

fn split_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    Ok((dir, name))
}

impl FileTelemetry {
    /// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
    /// - `log_file` is the path to the rolling text log.
    /// - `event_file` is the path to the rolling JSON “report” log.
    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<Self> {
        let (txt_dir, txt_name) = split_path(&log_file)?;
        let txt_appender = RollingFileAppender::new(Rotation::DAILY, txt_dir, txt_name);
        let txt_layer = fmt::Layer::default()
            .with_writer(txt_appender)
            .with_ansi(false)
            .with_filter(env_filter(log_level));

        let (json_dir, json_name) = split_path(&event_file)?;
        let json_appender = RollingFileAppender::new(Rotation::DAILY, json_dir, json_name);
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("request=info"));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .context("installing tracing subscriber")?;

        Ok(FileTelemetry {
            log_file,
            event_file,
        })
    }
}

/// Dispatch counters and latency, recorded through the global meter. Without an
/// installed provider the instruments are no-ops.
#[derive(Clone)]
pub struct BridgeMetrics {
    pub requests_started: Counter<u64>,
    pub requests_succeeded: Counter<u64>,
    pub requests_failed: Counter<u64>,
    pub requests_timed_out: Counter<u64>,
    pub request_latency_ms: Histogram<f64>,
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BridgeMetrics")
    }
}

impl BridgeMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            requests_started: meter
                .u64_counter("requests_started")
                .with_description("Total requests dispatched to the worker")
                .build(),
            requests_succeeded: meter.u64_counter("requests_succeeded").build(),
            requests_failed: meter.u64_counter("requests_failed").build(),
            requests_timed_out: meter.u64_counter("requests_timed_out").build(),
            request_latency_ms: meter
                .f64_histogram("request_latency_ms")
                .with_description("Latency per request in ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn started(&self, method: &str) {
        self.requests_started
            .add(1, &[KeyValue::new("method", method.to_string())]);
    }

    /// Record the outcome and emit one `target: "request"` event for the JSON log.
    pub fn finished(
        &self,
        method: &str,
        session_id: Option<&str>,
        outcome: Result<&Response, &BridgeError>,
        elapsed: Duration,
    ) {
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        let attrs = [KeyValue::new("method", method.to_string())];
        self.request_latency_ms.record(latency_ms, &attrs);

        let status = match outcome {
            Ok(rsp) if rsp.is_error() => "worker_error",
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        match outcome {
            Ok(_) => {
                self.requests_succeeded.add(1, &attrs);
                info!("request `{}` completed in {:.1} ms", method, latency_ms);
            }
            Err(err) if matches!(err, BridgeError::RequestTimeout { .. }) => {
                self.requests_timed_out.add(1, &attrs);
                self.requests_failed.add(1, &attrs);
                error!(error = %err, "request `{}` timed out after {:.1} ms", method, latency_ms);
            }
            Err(err) => {
                self.requests_failed.add(1, &attrs);
                error!(error = %err, "request `{}` failed in {:.1} ms", method, latency_ms);
            }
        }

        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = method,
            session = session_id.unwrap_or("-"),
            latency_ms,
            status,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use worker_channel::Id;

    #[test]
    fn metrics_without_a_provider_are_noops() {
        let metrics = BridgeMetrics::new();
        metrics.started("tools/list");
        let rsp = Response::success(Id::Number(1), json!({}));
        metrics.finished("tools/list", Some("s"), Ok(&rsp), Duration::from_millis(3));
        metrics.finished(
            "tools/call",
            None,
            Err(&BridgeError::RequestTimeout {
                id: Id::Number(2),
                timeout_ms: 10,
            }),
            Duration::from_millis(10),
        );
    }

    #[test]
    fn split_path_needs_a_file_name() {
        assert!(split_path(Path::new("/")).is_err());
        let (dir, name) = split_path(Path::new("logs/bridge.log")).unwrap();
        assert_eq!(dir, Path::new("logs"));
        assert_eq!(name, "bridge.log");
    }
}
