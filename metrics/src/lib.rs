use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0,
    ]
}

/// Installs the global meter provider exporting over OTLP.
///
/// When metrics are disabled the global no-op provider stays in place, so
/// instruments can be created unconditionally.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "chunkstore"))
        .with_attribute(KeyValue::new("service.name", "chunkstore-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "chunkstore.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    tracing::info!(?interval, "metrics export enabled");
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");
            let operations = meter
                .f64_histogram("chunkstore.blob_store.operations")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("blob store operation latencies in seconds")
                .build();
            Metrics { operations }
        }
    }
}

pub mod upload_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub chunks_uploaded: Counter<u64>,
        pub chunk_bytes: Counter<u64>,
        pub chunks_rejected: Counter<u64>,
        pub uploads_canceled: Counter<u64>,
        pub objects_deleted: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("service-api");
            let chunks_uploaded = meter
                .u64_counter("chunkstore.chunks_uploaded")
                .with_description("number of chunks committed to the blob store")
                .build();
            let chunk_bytes = meter
                .u64_counter("chunkstore.chunk_bytes")
                .with_description("number of chunk bytes committed to the blob store")
                .build();
            let chunks_rejected = meter
                .u64_counter("chunkstore.chunks_rejected")
                .with_description("number of chunk uploads rejected before the store write")
                .build();
            let uploads_canceled = meter
                .u64_counter("chunkstore.uploads_canceled")
                .with_description("number of uploads canceled and purged")
                .build();
            let objects_deleted = meter
                .u64_counter("chunkstore.objects_deleted")
                .with_description("number of chunk objects deleted")
                .build();
            Metrics {
                chunks_uploaded,
                chunk_bytes,
                chunks_rejected,
                uploads_canceled,
                objects_deleted,
            }
        }
    }
}
