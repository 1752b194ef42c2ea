//! Logging and trace export setup
//!
//! Both binaries call [`init_telemetry`] once and hold the returned guard
//! until exit. Logs go to stdout as JSON lines. With an OTLP endpoint set,
//! spans and metrics are exported too, and W3C trace context is propagated
//! so a routed request can be followed from the platform into the worker.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,trellis=debug,hyper=warn,tower=warn,rustls=warn";

/// Standard variable naming the OTLP collector
pub const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("otlp {signal} exporter: {reason}")]
    Exporter {
        /// "traces" or "metrics"
        signal: &'static str,
        /// Exporter error text
        reason: String,
    },

    /// A global subscriber is already installed
    #[error("tracing subscriber already installed: {0}")]
    Subscriber(String),
}

/// Who is emitting, and where spans go
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported as `service.name`
    pub service_name: String,
    /// Reported as `service.instance.id`
    pub instance_id: Option<String>,
    /// Collector address; logs only when unset
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Config for a named binary, reading the instance and collector from the environment
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: std::env::var(crate::config::vars::INSTANCE_ID).ok(),
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_VAR)
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.namespace", "trellis"),
        ];
        attributes.extend(
            self.instance_id
                .iter()
                .map(|id| KeyValue::new("service.instance.id", id.clone())),
        );
        Resource::new(attributes)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::for_service("trellis")
    }
}

/// Flushes exporters when dropped
#[must_use = "dropping the guard stops trace export"]
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            exporters.shutdown();
        }
    }
}

struct Exporters {
    traces: TracerProvider,
    metrics: SdkMeterProvider,
}

impl std::fmt::Debug for Exporters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Exporters")
    }
}

impl Exporters {
    fn install(endpoint: &str, resource: Resource) -> Result<Self, TelemetryError> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::Exporter {
                signal: "traces",
                reason: e.to_string(),
            })?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::Exporter {
                signal: "metrics",
                reason: e.to_string(),
            })?;

        let traces = TracerProvider::builder()
            .with_batch_exporter(spans, runtime::Tokio)
            .with_resource(resource.clone())
            .build();
        let metrics = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
            .with_resource(resource)
            .build();

        global::set_tracer_provider(traces.clone());
        global::set_meter_provider(metrics.clone());
        Ok(Self { traces, metrics })
    }

    fn shutdown(self) {
        if let Err(e) = self.traces.shutdown() {
            eprintln!("trace exporter shutdown: {e}");
        }
        if let Err(e) = self.metrics.shutdown() {
            eprintln!("metrics exporter shutdown: {e}");
        }
    }
}

/// Install the global subscriber, plus OTLP export when configured
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporters = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| Exporters::install(endpoint, config.resource()))
        .transpose()?;
    let otel_layer = exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.traces.tracer(config.service_name.clone()))
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(TelemetryGuard { exporters })
}
