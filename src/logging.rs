use color_eyre::Result;
use color_eyre::eyre::Context;
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: an `EnvFilter`, a fmt layer on stderr and,
/// when `otlp_endpoint` is set, an OTLP span exporter. The returned provider
/// must be shut down before exit to flush pending spans.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    filter: &str,
) -> Result<Option<SdkTracerProvider>> {
    let tracer_provider = match otlp_endpoint {
        Some(endpoint) => {
            let resource = Resource::builder()
                .with_attributes(vec![KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    service_name.to_string(),
                )])
                .build();

            let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .wrap_err("Failed to create OTLP span exporter")?;

            Some(
                SdkTracerProvider::builder()
                    .with_batch_exporter(otlp_exporter)
                    .with_resource(resource)
                    .build(),
            )
        }
        None => None,
    };

    let telemetry_layer = tracer_provider.as_ref().map(|provider| {
        opentelemetry::global::set_tracer_provider(provider.clone());
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let filter_layer = EnvFilter::try_new(filter).wrap_err("Failed to create tracing filter")?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    Ok(tracer_provider)
}
