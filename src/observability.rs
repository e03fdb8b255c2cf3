//! Observability utilities.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::telemetry::MetricsFacade;
use crate::types::{Error, ObservabilityConfig, Result};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `GATEWAY_LOG_FORMAT=json`. Filter defaults to `info` if `RUST_LOG` is unset.
pub fn init_tracing() {
    init_tracing_with(&ObservabilityConfig::default());
}

/// Like [`init_tracing`], with configured fallbacks for level and format.
/// `RUST_LOG` and `GATEWAY_LOG_FORMAT` still take precedence.
pub fn init_tracing_with(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        let json = std::env::var("GATEWAY_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(config.json_logs);

        let mut layers: Vec<BoxedLayer> = Vec::new();
        layers.push(if json {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().compact().boxed()
        });
        #[cfg(feature = "otel")]
        layers.push(otel_layer());

        let result = tracing_subscriber::registry()
            .with(layers)
            .with(env_filter)
            .try_init();

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

/// Span export through OpenTelemetry with W3C trace-context propagation.
#[cfg(feature = "otel")]
fn otel_layer() -> BoxedLayer {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    let provider = SdkTracerProvider::builder().build();
    let tracer = provider.tracer("action-gateway");
    opentelemetry::global::set_tracer_provider(provider);

    tracing_opentelemetry::layer().with_tracer(tracer).boxed()
}

/// Install the Prometheus recorder with a scrape endpoint on `addr`.
///
/// A recorder that is already installed (tests, repeated startup) is kept.
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .map_err(|e| Error::internal(format!("metrics exporter: {e}")))?;

    match builder.install() {
        Ok(()) => {
            MetricsFacade::describe();
            tracing::info!(addr = %addr, "metrics available at http://{}/metrics", addr);
            Ok(())
        }
        Err(e) => {
            let err_msg = e.to_string();
            if err_msg.contains("already") {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            } else {
                Err(Error::internal(format!("metrics exporter: {err_msg}")))
            }
        }
    }
}
