//! Internal code for metrics.
//!
//! Instruments are created on the global [`opentelemetry`] meter and
//! exported into the default Prometheus registry once
//! [`initialize_metrics`] has been called. Before that they are
//! no-ops.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> RecoveryResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("epochflow")
        .build()
        .map_err(|err| RecoveryError::Metrics(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| RecoveryError::Metrics(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Render everything in the default registry in the Prometheus text
/// format.
pub fn gather_metrics() -> RecoveryResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&default_registry().gather(), &mut buffer)
        .map_err(|err| RecoveryError::Metrics(err.to_string()))?;
    String::from_utf8(buffer).map_err(|err| RecoveryError::Metrics(err.to_string()))
}

/// Instruments recorded by one execution.
pub(crate) struct ExecutionMetrics {
    pub(crate) item_inp_count: Counter<u64>,
    pub(crate) epochs_committed: Counter<u64>,
    pub(crate) commit_duration: Histogram<f64>,
    pub(crate) gc_duration: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl ExecutionMetrics {
    pub(crate) fn new(proc_id: usize) -> Self {
        let meter = global::meter("epochflow");
        Self {
            item_inp_count: meter
                .u64_counter("item_inp_count")
                .with_description("number of items pulled from the input")
                .init(),
            epochs_committed: meter
                .u64_counter("epochs_committed")
                .with_description("number of epochs committed to the recovery store")
                .init(),
            commit_duration: meter
                .f64_histogram("epoch_commit_duration_seconds")
                .with_description("time to commit an epoch to all local recovery partitions")
                .init(),
            gc_duration: meter
                .f64_histogram("gc_duration_seconds")
                .with_description("time to GC all local recovery partitions")
                .init(),
            labels: vec![KeyValue::new("proc_id", proc_id.to_string())],
        }
    }
}
