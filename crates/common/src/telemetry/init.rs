use anyhow::Result;
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use super::{TelemetryConfig, TelemetryProviders};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize tracing with optional OpenTelemetry trace export
///
/// When OTEL is enabled:
/// - Sets up OTLP exporter for traces
/// - Bridges tracing spans to OpenTelemetry
/// - Configures W3C Trace Context propagation
///
/// Logs always go to stdout, as JSON or plain text.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Option<TelemetryProviders>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    let providers = if config.otel_enabled {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let resource = Resource::new(vec![KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            config.service_name.clone(),
        )]);

        let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otel_endpoint)
            .build()?;

        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(trace_exporter, runtime::Tokio)
            .with_sampler(Sampler::AlwaysOn)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build();

        let tracer = tracer_provider.tracer("fleet");
        layers.push(Box::new(tracing_opentelemetry::layer().with_tracer(tracer)));

        Some(TelemetryProviders { tracer_provider })
    } else {
        None
    };

    // Span layer first so fmt output can see OTel context
    if config.json_logs {
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_list(true)
                .with_current_span(true),
        ));
    } else {
        layers.push(Box::new(tracing_subscriber::fmt::layer().with_target(true)));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    Ok(providers)
}

/// Shutdown telemetry and flush any pending traces
pub fn shutdown_telemetry(providers: Option<TelemetryProviders>) {
    if let Some(providers) = providers {
        if let Err(e) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }
}
