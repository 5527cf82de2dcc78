//! Logging, tracing, and metrics
//!
//! Structured logs go through `tracing`. When OpenTelemetry is enabled, spans
//! and metrics are exported to an OTLP collector as well.

use std::fmt;

use opentelemetry::{
    global,
    metrics::{Counter, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::MeterProvider as SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LoggingConfig, OtelConfig};
use crate::models::{Provider, SyncRunResult};

/// Telemetry setup errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// OpenTelemetry tracer and meter providers
pub struct TelemetryProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl TelemetryProvider {
    pub fn new(config: &OtelConfig) -> Result<Self, TelemetryError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_ref().ok_or_else(|| {
                TelemetryError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::init_tracer_provider(endpoint, &resource)?;
            let meter_provider = Self::init_meter_provider(endpoint, &resource)?;
            (Some(tracer_provider), meter_provider)
        } else {
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        if let Some(ref tp) = tracer_provider {
            global::set_tracer_provider(tp.clone());
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
            config: config.clone(),
        })
    }

    fn init_tracer_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<TracerProvider, TelemetryError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

        let trace_config = Config::default()
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource.clone());

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(trace_config)
            .build())
    }

    fn init_meter_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<SdkMeterProvider, TelemetryError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| TelemetryError::MeterInit(e.to_string()))?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader)
            .build())
    }

    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match self.tracer_provider {
            Some(ref tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Flush and stop both providers
    pub fn shutdown(&self) -> Result<(), TelemetryError> {
        if let Err(e) = self.meter_provider.shutdown() {
            return Err(TelemetryError::Shutdown(format!(
                "Meter shutdown failed: {:?}",
                e
            )));
        }

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                if let Err(e) = result {
                    return Err(TelemetryError::Shutdown(format!(
                        "Tracer flush failed: {:?}",
                        e
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Drop for TelemetryProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Counters for sync runs and the calls they make
pub struct SyncMetrics {
    pub items_created: Counter<u64>,
    pub items_updated: Counter<u64>,
    pub items_skipped: Counter<u64>,
    pub items_errored: Counter<u64>,
    pub runs_total: Counter<u64>,
    pub http_retries: Counter<u64>,
    pub token_refreshes: Counter<u64>,
}

impl fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncMetrics").finish_non_exhaustive()
    }
}

impl SyncMetrics {
    pub fn new(meter: &Meter) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            meter.u64_counter(name).with_description(description).init()
        };

        Self {
            items_created: counter("sportswire_items_created_total", "Content records created"),
            items_updated: counter("sportswire_items_updated_total", "Content records updated"),
            items_skipped: counter("sportswire_items_skipped_total", "Items skipped by the matcher or filter"),
            items_errored: counter("sportswire_items_errored_total", "Items that failed to upsert"),
            runs_total: counter("sportswire_sync_runs_total", "Sync runs finished"),
            http_retries: counter("sportswire_http_retries_total", "Outbound HTTP retries"),
            token_refreshes: counter("sportswire_token_refreshes_total", "OAuth token refreshes"),
        }
    }

    /// Add a finished run's counters
    pub fn record_run(&self, result: &SyncRunResult) {
        let kind = [KeyValue::new("kind", result.kind.to_string())];
        self.items_created.add(result.created, &kind);
        self.items_updated.add(result.updated, &kind);
        self.items_skipped.add(result.skipped, &kind);
        self.items_errored.add(result.errored, &kind);

        let outcome = if result.cancelled {
            "cancelled"
        } else if result.aborted.is_some() {
            "aborted"
        } else {
            "completed"
        };
        self.runs_total.add(
            1,
            &[
                KeyValue::new("kind", result.kind.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    pub fn record_http_retry(&self) {
        self.http_retries.add(1, &[]);
    }

    pub fn record_token_refresh(&self, provider: Provider) {
        self.token_refreshes
            .add(1, &[KeyValue::new("provider", provider.as_str())]);
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_tracing(
    telemetry: &TelemetryProvider,
    logging: &LoggingConfig,
) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| TelemetryError::Config(format!("invalid log level: {}", e)))?;

    let json = !logging.format.eq_ignore_ascii_case("pretty");
    let otel_layer = telemetry
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(telemetry.tracer("sportswire-sync")));

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().pretty()))
        .try_init()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunKind;
    use chrono::Utc;

    fn disabled() -> OtelConfig {
        OtelConfig {
            enabled: false,
            endpoint: None,
            service_name: "test-service".to_string(),
        }
    }

    // Test 1: Disabled config builds without a tracer provider
    #[test]
    fn test_provider_disabled() {
        let provider = TelemetryProvider::new(&disabled()).unwrap();
        assert!(!provider.is_enabled());
        assert!(provider.tracer_provider.is_none());
    }

    // Test 2: Enabled config requires an endpoint
    #[test]
    fn test_provider_requires_endpoint() {
        let config = OtelConfig {
            enabled: true,
            ..disabled()
        };

        match TelemetryProvider::new(&config) {
            Err(TelemetryError::Config(msg)) => assert!(msg.contains("endpoint is required")),
            _ => panic!("Expected TelemetryError::Config"),
        }
    }

    // Test 3: Sync metrics accept run results
    #[test]
    fn test_sync_metrics_record() {
        let provider = TelemetryProvider::new(&disabled()).unwrap();
        let metrics = SyncMetrics::new(&provider.meter());

        let mut result = SyncRunResult::new(RunKind::Full, Utc::now());
        result.created = 2;
        result.errored = 1;
        metrics.record_run(&result);
        metrics.record_http_retry();
        metrics.record_token_refresh(Provider::Facebook);
    }

    // Test 4: Shutdown of a disabled provider succeeds
    #[test]
    fn test_provider_shutdown() {
        let provider = TelemetryProvider::new(&disabled()).unwrap();
        assert!(provider.shutdown().is_ok());
    }

    // Test 5: Error display
    #[test]
    fn test_error_display() {
        let err = TelemetryError::Config("bad".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad");
    }
}
