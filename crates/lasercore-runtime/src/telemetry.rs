//! Tracing setup for the LaserCore binaries.
//!
//! [`init_tracing`] installs the global subscriber once at startup:
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Filter directives, default `info`. |
//! | `LASERCORE_LOG_FORMAT=json` | Newline-delimited JSON instead of the compact format. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Export spans over OTLP/HTTP to this collector. |
//!
//! ```rust,no_run
//! let _telemetry = lasercore_runtime::telemetry::init_tracing("lasercore");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// What the environment asked for, read once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub filter: String,
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl TelemetrySettings {
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned()),
            format: LogFormat::parse(std::env::var("LASERCORE_LOG_FORMAT").ok().as_deref()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Install the global subscriber. Hold the returned guard until exit so
/// exported spans are flushed.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    init_with(service_name, &TelemetrySettings::from_env())
}

pub fn init_with(service_name: &str, settings: &TelemetrySettings) -> TracerProviderGuard {
    let filter = EnvFilter::try_new(&settings.filter).unwrap_or_else(|e| {
        eprintln!("[lasercore] ignoring invalid log filter {:?}: {e}", settings.filter);
        EnvFilter::new("info")
    });
    let provider = settings
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| build_provider(service_name, endpoint));

    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("lasercore")));
    let (json, compact) = match settings.format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Compact => (None, Some(tracing_subscriber::fmt::layer().compact())),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(otel)
        .with(json)
        .with(compact)
        .try_init()
    {
        eprintln!("[lasercore] tracing already initialised: {e}");
    }

    TracerProviderGuard(provider)
}

/// Shuts the span exporter down on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[lasercore] span exporter shutdown failed: {e}");
            }
        }
    }
}

fn build_provider(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[lasercore] OTLP exporter unavailable: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_owned())
        .build();

    // Simple exporter: the CLI builds its Tokio runtime after this runs.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_format_is_opt_in() {
        assert_eq!(LogFormat::parse(None), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Compact);
    }

    #[test]
    fn no_endpoint_means_no_exporter() {
        let settings = TelemetrySettings {
            filter: "warn".into(),
            format: LogFormat::Compact,
            otlp_endpoint: None,
        };
        let guard = init_with("lasercore-test", &settings);
        assert!(!guard.exporting());
    }

    #[test]
    fn empty_guard_drops_quietly() {
        drop(TracerProviderGuard(None));
    }
}
