use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::{ServerConfig, TracingExporter};

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_span_list(false)
                .with_current_span(true),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

pub fn setup_tracing(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    let base = tracing_subscriber::Registry::default();

    let Some(tracing_exporter) = &config.telemetry.tracing_exporter else {
        let log_layer = get_log_layer(config).with_filter(get_env_filter());
        if let Err(e) = tracing::subscriber::set_global_default(base.with(log_layer)) {
            error!("logger was already initiated, continuing: {:?}", e);
        }
        return Ok(None);
    };

    let mut tracer_provider = TracerProviderBuilder::default().with_resource(
        Resource::builder_empty()
            .with_service_name("chunkstore-server")
            .build(),
    );
    match tracing_exporter {
        TracingExporter::Otlp => {
            let mut otlp = SpanExporter::builder().with_tonic();
            if let Some(endpoint) = &config.telemetry.endpoint {
                otlp = otlp.with_endpoint(endpoint.clone());
            }
            tracer_provider = tracer_provider.with_batch_exporter(otlp.build()?);
        }
    }
    let tracer_provider = tracer_provider.build();
    global::set_tracer_provider(tracer_provider.clone());

    let span_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer("chunkstore-server"))
        .with_filter(get_env_filter());
    let log_layer = get_log_layer(config).with_filter(get_env_filter());
    if let Err(e) = tracing::subscriber::set_global_default(base.with(span_layer).with(log_layer)) {
        error!("logger was already initiated, continuing: {:?}", e);
    }

    Ok(Some(tracer_provider))
}
