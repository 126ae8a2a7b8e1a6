//! Optional OTLP trace export.
//!
//! When `[telemetry]` is configured, spans are batched and exported over
//! OTLP/HTTP in addition to console logging. Without it the worker logs to
//! the console only.
//!
//! The [`BatchSpanProcessor`] exports from its own background thread outside
//! the tokio runtime, so it needs the blocking `reqwest` client. That client
//! is built on a separate thread so construction never blocks the runtime.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use url::Url;

use crate::config::LogLevel;

const DEFAULT_SERVICE_NAME: &str = "st0x-decisions";

/// Identifies spans produced by this crate, as opposed to `service.name`
/// which identifies the running service.
const TRACER_NAME: &str = "st0x-decisions-tracer";

/// `[telemetry]` section of the plaintext config.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TelemetryConfig {
    endpoint: Url,
    service_name: Option<String>,
}

/// `[telemetry]` section of the secrets file.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TelemetrySecrets {
    api_key: String,
}

#[derive(Debug, Clone)]
pub struct TelemetryCtx {
    pub(crate) endpoint: Url,
    pub(crate) api_key: String,
    pub(crate) service_name: String,
}

impl TelemetryCtx {
    pub(crate) fn new(config: TelemetryConfig, secrets: TelemetrySecrets) -> Self {
        Self {
            endpoint: config.endpoint,
            api_key: secrets.api_key,
            service_name: config
                .service_name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        }
    }

    /// Installs the global subscriber with both console and OTLP layers.
    pub fn setup_telemetry(&self, log_level: &LogLevel) -> Result<TelemetryGuard, TelemetryError> {
        let headers = HashMap::from([("authorization".to_string(), self.api_key.clone())]);

        let http_client = std::thread::spawn(|| {
            reqwest::blocking::Client::builder()
                .gzip(true)
                .build()
                .map_err(|e| format!("Failed to build HTTP client: {e}"))
        })
        .join()
        .map_err(|_| TelemetryError::ThreadSpawn)?
        .map_err(TelemetryError::HttpClient)?;

        let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_http_client(http_client)
            .with_endpoint(self.endpoint.as_str())
            .with_headers(headers)
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()?;

        let batch_exporter = BatchSpanProcessor::builder(otlp_exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_export_batch_size(512)
                    .with_max_queue_size(2048)
                    .with_scheduled_delay(Duration::from_secs(3))
                    .build(),
            )
            .build();

        let tracer_provider = SdkTracerProvider::builder()
            .with_span_processor(batch_exporter)
            .with_resource(
                Resource::builder()
                    .with_service_name(self.service_name.clone())
                    .with_attributes(vec![KeyValue::new("deployment.environment", "production")])
                    .build(),
            )
            .build();

        let tracer = tracer_provider.tracer(TRACER_NAME);
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let default_filter = crate::default_log_filter(log_level);

        let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.clone().into());
        let telemetry_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.into());

        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(fmt_filter);
        let telemetry_layer = telemetry_layer.with_filter(telemetry_filter);

        let subscriber = Registry::default().with(fmt_layer).with(telemetry_layer);

        tracing::subscriber::set_global_default(subscriber)?;

        Ok(TelemetryGuard { tracer_provider })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter")]
    OtlpExporter(#[from] ExporterBuildError),

    #[error("Failed to build HTTP client")]
    HttpClient(String),

    #[error("Failed to spawn HTTP client thread")]
    ThreadSpawn,

    #[error("Failed to set global subscriber")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes pending spans and shuts the exporter down on drop.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tracer_provider.force_flush() {
            eprintln!("Failed to flush telemetry spans: {e:?}");
        }

        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown telemetry provider: {e:?}");
        }
    }
}
