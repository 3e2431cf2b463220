//! The broker-facing worker: one channel per worker, QoS prefetch, header
//! decoding, and routing into the per-device actors. Acks travel back
//! through the tracker to this worker's channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
        QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::instrument;

use dup_types::{DeviceId, Realm, Timestamp};
use utils::telemetry::ConsumerMetrics;

use crate::apis::vmq::VmqPlugin;
use crate::dispatcher::{Dispatcher, DispatcherError};
use crate::queries::Queries;
use crate::subsystems::events::EventsPublisher;
use crate::subsystems::tracker::{AckError, Acknowledger};
use crate::subsystems::updater::UpdaterMessage;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("broker channel error: {0}")]
    Channel(String),
    #[error("message tracker failure")]
    MessageTrackerFailure,
}

/// Acks back over the channel the delivery came in on.
#[derive(Clone)]
pub struct AmqpAcknowledger {
    channel: Channel,
}

impl AmqpAcknowledger {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AckError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| AckError::Channel(e.to_string()))
    }

    async fn discard(&self, delivery_tag: u64) -> Result<(), AckError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| AckError::Channel(e.to_string()))
    }

    async fn requeue(&self, delivery_tag: u64) -> Result<(), AckError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
            .await
            .map_err(|e| AckError::Channel(e.to_string()))
    }
}

fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key) {
        Some(AMQPValue::LongString(value)) => Some(value.to_string()),
        Some(AMQPValue::ShortString(value)) => Some(value.to_string()),
        _ => None,
    }
}

/// Decodes the routing headers and meta of one delivery into an actor
/// work item. Errors name the missing piece; those deliveries are
/// rejected without requeue.
pub fn parse_message(
    properties: &BasicProperties,
    data: &[u8],
) -> Result<(Realm, DeviceId, &'static str, UpdaterMessage), &'static str> {
    let headers = properties
        .headers()
        .as_ref()
        .ok_or("missing headers table")?;

    let realm: Realm = header_string(headers, "x_astarte_realm")
        .ok_or("missing x_astarte_realm")?
        .parse()
        .map_err(|_| "malformed x_astarte_realm")?;
    let device_id: DeviceId = header_string(headers, "x_astarte_device_id")
        .ok_or("missing x_astarte_device_id")?
        .parse()
        .map_err(|_| "malformed x_astarte_device_id")?;
    let msg_type = header_string(headers, "x_astarte_msg_type").ok_or("missing x_astarte_msg_type")?;

    let message_id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().as_bytes().to_vec())
        .filter(|id| !id.is_empty())
        .ok_or("missing message_id")?;

    // broker meta carries milliseconds; internal time is decimicroseconds
    let timestamp = properties
        .timestamp()
        .map(|ms| Timestamp::from_millis(ms as i64))
        .unwrap_or_else(Timestamp::now);

    let message = match msg_type.as_str() {
        "connection" => UpdaterMessage::Connection {
            ip: header_string(headers, "x_astarte_remote_ip")
                .ok_or("missing x_astarte_remote_ip")?,
            message_id,
            timestamp,
        },
        "disconnection" => UpdaterMessage::Disconnection {
            message_id,
            timestamp,
        },
        "introspection" => UpdaterMessage::Introspection {
            payload: data.to_vec(),
            message_id,
            timestamp,
        },
        "data" => UpdaterMessage::Data {
            interface: header_string(headers, "x_astarte_interface")
                .ok_or("missing x_astarte_interface")?,
            path: header_string(headers, "x_astarte_path").ok_or("missing x_astarte_path")?,
            payload: data.to_vec(),
            message_id,
            timestamp,
        },
        "control" => UpdaterMessage::Control {
            path: header_string(headers, "x_astarte_control_path")
                .ok_or("missing x_astarte_control_path")?,
            payload: data.to_vec(),
            message_id,
            timestamp,
        },
        _ => return Err("unknown x_astarte_msg_type"),
    };

    let label = match &message {
        UpdaterMessage::Connection { .. } => "connection",
        UpdaterMessage::Disconnection { .. } => "disconnection",
        UpdaterMessage::Introspection { .. } => "introspection",
        UpdaterMessage::Data { .. } => "data",
        UpdaterMessage::Control { .. } => "control",
        _ => "other",
    };

    Ok((realm, device_id, label, message))
}

pub struct AmqpDataConsumer<Q, P, V> {
    dispatcher: Arc<Dispatcher<Q, P, V>>,
    metrics: ConsumerMetrics,
}

impl<Q, P, V> AmqpDataConsumer<Q, P, V>
where
    Q: Queries,
    P: EventsPublisher,
    V: VmqPlugin,
{
    pub fn new(dispatcher: Arc<Dispatcher<Q, P, V>>, metrics: ConsumerMetrics) -> Self {
        Self {
            dispatcher,
            metrics,
        }
    }

    /// Consumes one data queue until the kill signal fires or the channel
    /// dies. A tracker failure means a device actor chain is broken beyond
    /// repair, so the worker stops and lets the supervisor reconnect.
    #[instrument(skip_all, fields(subsys = "AMQPDataConsumer", queue = %queue_name))]
    pub async fn start(
        self,
        connection: Arc<Connection>,
        queue_name: String,
        prefetch_count: u16,
        mut kill: broadcast::Receiver<()>,
    ) -> Result<(), ConsumerError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;

        let mut consumer = channel
            .basic_consume(
                &queue_name,
                "data_updater_plant",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;

        tracing::info!("consuming from {}", queue_name);

        loop {
            tokio::select! {
                _ = kill.recv() => break,
                delivery = consumer.next() => match delivery {
                    None => return Err(ConsumerError::Channel("consumer stream closed".to_string())),
                    Some(Err(err)) => return Err(ConsumerError::Channel(err.to_string())),
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        match parse_message(&delivery.properties, &delivery.data) {
                            Err(reason) => {
                                tracing::warn!("rejecting malformed delivery: {}", reason);
                                self.metrics.increment_total_errors(reason);
                                channel
                                    .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
                                    .await
                                    .map_err(|e| ConsumerError::Channel(e.to_string()))?;
                            }
                            Ok((realm, device_id, label, message)) => {
                                self.metrics.record_consumed(label);
                                let acknowledger = AmqpAcknowledger::new(channel.clone());
                                match self
                                    .dispatcher
                                    .dispatch(&realm, device_id, delivery_tag, message, move || acknowledger)
                                    .await
                                {
                                    Ok(()) => {}
                                    Err(DispatcherError::Tracker(_)) => {
                                        return Err(ConsumerError::MessageTrackerFailure);
                                    }
                                    Err(err) => {
                                        return Err(ConsumerError::Channel(err.to_string()));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
