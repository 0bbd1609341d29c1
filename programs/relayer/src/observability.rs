//! Observability configuration for the relayer.
//!
//! Stdout logging + optional OpenTelemetry OTLP export.

use anyhow::{Context, Result};
use ibc_header_relayer_core::config::{LogFormat, ObservabilityConfig};
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    trace::{Sampler, SdkTracerProvider, SpanExporter, Tracer},
};
use tracing::Subscriber;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// Guard that shuts down OpenTelemetry on drop (if enabled).
pub struct ObservabilityGuard {
    otel_tracer_provider: Option<SdkTracerProvider>,
    otel_logger_provider: Option<SdkLoggerProvider>,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.otel_tracer_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.otel_logger_provider.take() {
            // Dropping the provider flushes its processors.
            drop(provider);
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Keep the returned guard alive for the program's lifetime to ensure a
/// clean OpenTelemetry shutdown.
#[allow(clippy::missing_errors_doc)]
pub fn init_observability(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let (otel_tracer_provider, otel_logger_provider) = if config.use_otel {
        match (setup_otlp_tracer(config), setup_otlp_logger(config)) {
            (Ok((tracer, tracer_provider)), Ok(logger_provider)) => {
                let subscriber = Registry::default()
                    .with(env_filter(config))
                    .with(fmt_layer(config.log_format))
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .with(OpenTelemetryTracingBridge::new(&logger_provider));

                try_init_subscriber(subscriber)?;
                (Some(tracer_provider), Some(logger_provider))
            }
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("OpenTelemetry disabled: {e}");
                try_init_subscriber(
                    Registry::default()
                        .with(env_filter(config))
                        .with(fmt_layer(config.log_format)),
                )?;
                (None, None)
            }
        }
    } else {
        let subscriber = Registry::default()
            .with(env_filter(config))
            .with(fmt_layer(config.log_format));

        try_init_subscriber(subscriber)?;
        (None, None)
    };

    Ok(ObservabilityGuard {
        otel_tracer_provider,
        otel_logger_provider,
    })
}

fn env_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::new(config.level().as_str().to_lowercase())
}

/// The stdout layer in the configured format.
fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true);

    match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Initialize the subscriber and handle errors.
fn try_init_subscriber(subscriber: impl SubscriberInitExt) -> Result<()> {
    subscriber
        .try_init()
        .context("Failed to set global default subscriber")
}

fn resource(config: &ObservabilityConfig) -> Resource {
    Resource::builder()
        .with_attributes(vec![
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build()
}

/// Build an OTLP tracer and a gRPC provider
fn setup_otlp_tracer(config: &ObservabilityConfig) -> Result<(Tracer, SdkTracerProvider)> {
    let exporter = build_otlp_grpc_exporter(config)?;

    let provider = SdkTracerProvider::builder()
        .with_resource(resource(config))
        .with_sampler(Sampler::AlwaysOn)
        .with_batch_exporter(exporter)
        .build();

    let tracer = provider.tracer(config.service_name.clone());

    Ok((tracer, provider))
}

fn build_otlp_grpc_exporter(config: &ObservabilityConfig) -> Result<impl SpanExporter> {
    let mut exporter_builder = opentelemetry_otlp::SpanExporter::builder().with_tonic();

    if let Some(endpoint) = &config.otel_endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint);
    }

    Ok(exporter_builder.build()?)
}

/// Build an OTLP logger provider for exporting logs over gRPC
fn setup_otlp_logger(config: &ObservabilityConfig) -> Result<SdkLoggerProvider> {
    let mut exporter_builder = opentelemetry_otlp::LogExporter::builder().with_tonic();
    if let Some(endpoint) = &config.otel_endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint);
    }
    let exporter = exporter_builder.build()?;

    let provider = SdkLoggerProvider::builder()
        .with_resource(resource(config))
        .with_batch_exporter(exporter)
        .build();

    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Once;
    static INIT: Once = Once::new();

    fn config(use_otel: bool, otel_endpoint: Option<&str>) -> ObservabilityConfig {
        ObservabilityConfig {
            use_otel,
            service_name: "test-header-relayer".to_string(),
            otel_endpoint: otel_endpoint.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn init_without_otel_succeeds() {
        let config = ObservabilityConfig {
            log_format: LogFormat::Json,
            ..config(false, None)
        };

        // Initialize at most once to avoid global subscriber conflicts across tests
        INIT.call_once(|| {
            let _ = init_observability(&config);
        });

        tracing::info!(src_chain = "bbn-test-1", "hello from tracing crate");
    }

    #[tokio::test]
    async fn setup_otlp_logger_builds_with_endpoint() {
        let provider = setup_otlp_logger(&config(true, Some("http://127.0.0.1:4317")));
        assert!(provider.is_ok());
    }

    #[tokio::test]
    async fn setup_otlp_tracer_builds_with_endpoint() {
        let tracer_provider = setup_otlp_tracer(&config(true, Some("http://127.0.0.1:4317")));
        assert!(tracer_provider.is_ok());
    }

    #[test]
    fn every_log_format_builds_a_layer() {
        for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
            let subscriber = Registry::default().with(fmt_layer(format));
            tracing::subscriber::with_default(subscriber, || {
                tracing::debug!(?format, "formatted");
            });
        }
    }
}
