use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use tracing_subscriber::layer::SubscriberExt;

fn plant_resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_owned())
        .build()
}

/// Wires tracing through OTLP and installs the global subscriber.
///
/// The plant only talks to the broker and the database; there is no
/// inbound request context to propagate, so every span tree starts fresh
/// at the delivery that caused it.
pub fn setup_tracing(
    collector: &str,
    service_name: &str,
    filters: tracing_subscriber::EnvFilter,
) -> SdkTracerProvider {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(format!("{}/v1/traces", collector))
        .build()
        .expect("failed to build the OTLP span exporter");

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(plant_resource(service_name))
        .build();
    global::set_tracer_provider(provider.clone());

    let subscriber = tracing_subscriber::Registry::default()
        .with(filters)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_opentelemetry::layer()
                .with_tracer(provider.tracer(service_name.to_owned())),
        );
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set the global subscriber");

    tracing::info!("span export wired to {}", collector);
    provider
}

pub fn setup_metrics(collector: &str, service_name: &str) -> SdkMeterProvider {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/metrics", collector))
        .build()
        .expect("failed to build the OTLP metric exporter");

    let provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(plant_resource(service_name))
        .build();
    global::set_meter_provider(provider.clone());

    tracing::info!("metric export wired to {}", collector);
    provider
}

use opentelemetry::metrics::{Counter, Meter, UpDownCounter};

pub struct Metrics {
    pub consumer: ConsumerMetrics,
    pub updater: UpdaterMetrics,
    pub tracker: TrackerMetrics,
    pub events: EventsMetrics,
}

impl Metrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            consumer: ConsumerMetrics::init(meter),
            updater: UpdaterMetrics::init(meter),
            tracker: TrackerMetrics::init(meter),
            events: EventsMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsumerMetrics {
    pub total_consumed_messages: Counter<u64>,
    pub total_errors: Counter<u64>,
}

impl ConsumerMetrics {
    pub const LABEL: &'static str = "data_consumer";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_consumed_messages: meter
                .u64_counter(format!("{}_total_consumed_messages", Self::LABEL))
                .with_description("Total number of deliveries taken off the data queues")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn record_consumed(&self, msg_type: &str) {
        self.total_consumed_messages
            .add(1, &[KeyValue::new("msg_type", msg_type.to_owned())]);
    }

    pub fn increment_total_errors(&self, reason: &str) {
        self.total_errors
            .add(1, &[KeyValue::new("reason", reason.to_owned())]);
    }
}

#[derive(Clone, Debug)]
pub struct UpdaterMetrics {
    pub active_devices: UpDownCounter<i64>,
    pub total_processed_messages: Counter<u64>,
    pub total_discarded_messages: Counter<u64>,
    pub total_errors: Counter<u64>,
}

impl UpdaterMetrics {
    pub const LABEL: &'static str = "data_updater";

    pub fn init(meter: &Meter) -> Self {
        Self {
            active_devices: meter
                .i64_up_down_counter(format!("{}_active_devices", Self::LABEL))
                .with_description("Number of device actors currently alive")
                .build(),
            total_processed_messages: meter
                .u64_counter(format!("{}_total_processed_messages", Self::LABEL))
                .with_description("Total number of messages fully processed and acked")
                .build(),
            total_discarded_messages: meter
                .u64_counter(format!("{}_total_discarded_messages", Self::LABEL))
                .with_description("Total number of messages discarded on payload violations")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn increment_total_errors(&self, reason: &str) {
        self.total_errors
            .add(1, &[KeyValue::new("reason", reason.to_owned())]);
    }
}

#[derive(Clone, Debug)]
pub struct TrackerMetrics {
    pub total_acked_messages: Counter<u64>,
    pub total_requeued_messages: Counter<u64>,
}

impl TrackerMetrics {
    pub const LABEL: &'static str = "message_tracker";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_acked_messages: meter
                .u64_counter(format!("{}_total_acked_messages", Self::LABEL))
                .with_description("Total number of deliveries acked back to the broker")
                .build(),
            total_requeued_messages: meter
                .u64_counter(format!("{}_total_requeued_messages", Self::LABEL))
                .with_description("Total number of deliveries requeued after an actor crash")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventsMetrics {
    pub total_published_events: Counter<u64>,
    pub total_errors: Counter<u64>,
}

impl EventsMetrics {
    pub const LABEL: &'static str = "events";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_published_events: meter
                .u64_counter(format!("{}_total_published_events", Self::LABEL))
                .with_description("Total number of trigger events published to the exchange")
                .build(),
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn record_published(&self, event_type: &str) {
        self.total_published_events
            .add(1, &[KeyValue::new("event_type", event_type.to_owned())]);
    }

    pub fn increment_total_errors(&self) {
        self.total_errors.add(1, &[]);
    }
}
