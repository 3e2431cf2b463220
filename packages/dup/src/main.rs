use clap::Parser;
use opentelemetry::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dup::{
    args::CliArgs,
    config::{Config, ConfigBuilder},
};
use utils::{
    context::AppContext,
    telemetry::{setup_metrics, setup_tracing, Metrics},
};

fn main() {
    let args = CliArgs::parse();
    let config: Config = ConfigBuilder::new(args).build().unwrap();

    let ctx = AppContext::new(config.worker_threads);

    let filters = config.tracing_env_filter().unwrap();
    let tracer_provider = if let Some(collector) = config.otlp_trace_collector.as_ref() {
        Some(setup_tracing(collector, "dup", filters))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_target(false),
            )
            .with(filters)
            .try_init()
            .unwrap();
        None
    };

    let meter_provider = config
        .otlp_metrics_collector
        .as_ref()
        .map(|collector| setup_metrics(collector, "dup_metrics"));
    let meter = global::meter("dup_metrics");
    let metrics = Metrics::init(&meter);

    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.kill();
        }
    });

    let rt = ctx.rt.clone();
    if let Err(err) = rt.block_on(dup::run_plant(ctx, config, metrics)) {
        tracing::error!("data updater plant failed: {:?}", err);
    }

    if let Some(tracer) = tracer_provider {
        let _ = tracer.shutdown();
    }
    if let Some(meter) = meter_provider {
        let _ = meter.shutdown();
    }
}
