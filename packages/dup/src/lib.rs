#![allow(clippy::uninlined_format_args)]
#![allow(clippy::type_complexity)]

pub mod apis;
pub mod args;
pub mod config;
pub mod dispatcher;
pub mod payload;
pub mod queries;
pub mod subsystems;

use std::sync::Arc;

use backoff::ExponentialBackoff;
use lapin::{
    options::ExchangeDeclareOptions, types::FieldTable, Connection, ConnectionProperties,
    ExchangeKind,
};

use utils::context::AppContext;
use utils::telemetry::Metrics;

use apis::vmq::AmqpVmqPlugin;
use config::Config;
use dispatcher::Dispatcher;
use queries::mem::MemQueries;
use subsystems::consumer::AmqpDataConsumer;
use subsystems::events::{AmqpEventsPublisher, TriggersHandler};

/// Entry point to bring up the whole plant: broker connection, outbound
/// channels, the dispatcher, and one consumer worker per data queue.
/// Called from main and end-to-end tests.
pub async fn run_plant(ctx: AppContext, config: Config, metrics: Metrics) -> anyhow::Result<()> {
    let connection = Arc::new(connect_with_backoff(&config.amqp_connection_url).await?);

    let events_channel = connection.create_channel().await?;
    events_channel
        .exchange_declare(
            &config.events_exchange_name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    let publisher = AmqpEventsPublisher::new(events_channel, config.events_exchange_name.clone());
    let triggers_handler = Arc::new(TriggersHandler::new(publisher, metrics.events.clone()));

    let vmq = Arc::new(AmqpVmqPlugin::new(
        connection.create_channel().await?,
        config.vmq_rpc_queue.clone(),
    ));
    let queries = Arc::new(MemQueries::new());

    let dispatcher = Arc::new(Dispatcher::new(
        ctx.kill_handle(),
        queries,
        triggers_handler,
        vmq,
        metrics.updater.clone(),
        metrics.tracker.clone(),
    ));

    let mut workers = tokio::task::JoinSet::new();
    for queue_name in config.data_queue_names() {
        let consumer = AmqpDataConsumer::new(dispatcher.clone(), metrics.consumer.clone());
        let connection = connection.clone();
        let prefetch_count = config.amqp_consumer_prefetch_count;
        let kill = ctx.get_kill_receiver();
        let name = queue_name.clone();
        workers.spawn(async move {
            (
                name,
                consumer.start(connection, queue_name, prefetch_count, kill).await,
            )
        });
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((queue, Ok(()))) => tracing::info!("consumer for {} stopped", queue),
            Ok((queue, Err(err))) => {
                tracing::error!("consumer for {} failed: {}", queue, err);
                ctx.kill();
            }
            Err(join_err) => {
                tracing::error!("consumer task aborted: {}", join_err);
                ctx.kill();
            }
        }
    }

    Ok(())
}

/// Connects to the broker, retrying with exponential backoff until it
/// answers; a plant without its broker has nothing to do.
async fn connect_with_backoff(url: &str) -> anyhow::Result<Connection> {
    let connection = backoff::future::retry_notify(
        ExponentialBackoff::default(),
        || async {
            let options = ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current());
            #[cfg(unix)]
            let options = options.with_reactor(tokio_reactor_trait::Tokio);

            Connection::connect(url, options)
                .await
                .map_err(|err| backoff::Error::transient(anyhow::Error::from(err)))
        },
        |err, duration| {
            tracing::warn!("broker connection failed: {}, retrying in {:?}", err, duration);
        },
    )
    .await?;

    tracing::info!("connected to the broker");
    Ok(connection)
}

// the test version of init_tracing does not take a config
// since config itself is tested and modified from different parallel tests
// therefore, this only uses the default tracing settings
pub fn init_tracing_tests() {
    use std::sync::LazyLock;

    static INIT: LazyLock<std::sync::Mutex<bool>> = LazyLock::new(|| std::sync::Mutex::new(false));

    let mut init = INIT.lock().unwrap();

    if !*init {
        *init = true;
        tracing_subscriber::fmt::init();
        tracing::debug!("Tracing initialized for tests");
    }
}
