//! Logging and metrics export setup
//!
//! - tracing-subscriber with an `EnvFilter` (`RUST_LOG`), plain or JSON output
//! - OTLP metrics export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported metrics
    pub service_name: String,

    /// OTLP endpoint for metric export (e.g., "http://otel-collector:4317").
    /// If None, metrics are recorded against a no-op provider.
    pub otlp_endpoint: Option<String>,

    /// Lower the default filter to debug
    pub debug: bool,

    /// Emit one JSON object per log line
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "permbot".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            debug: false,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set
    pub fn default_filter(&self) -> &'static str {
        if self.debug {
            "debug,kube=info,tower=warn,hyper=warn,h2=warn,rustls=warn"
        } else {
            "info,kube=warn,tower=warn,hyper=warn"
        }
    }
}

/// Initialize logging and, if configured, metrics export
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    if let Some(endpoint) = &config.otlp_endpoint {
        init_otlp_metrics(endpoint, build_resource(&config.service_name))?;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    // Option<Layer> implements Layer, so exactly one of these is active
    let json_layer = config.json_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
    });
    let text_layer = (!config.json_logs).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}

/// Build OpenTelemetry resource with service info and pod identity
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            crate::version(),
        ),
    ];

    // Set via the Deployment downward API
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }

    Resource::new(attributes)
}

/// Initialize OTLP metrics exporter with periodic push
fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader =
        opentelemetry_sdk::metrics::PeriodicReader::builder(exporter, runtime::Tokio).build();

    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_lowers_default_filter() {
        let mut config = TelemetryConfig {
            service_name: "permbot".to_string(),
            otlp_endpoint: None,
            debug: false,
            json_logs: false,
        };
        assert!(config.default_filter().starts_with("info"));

        config.debug = true;
        assert!(config.default_filter().starts_with("debug"));
    }

    #[test]
    fn resource_carries_service_name() {
        let resource = build_resource("permbot-test");
        assert!(!resource.is_empty());
    }
}
