//! Builds the typed trigger events and publishes them to the outbound
//! exchange, one publish per trigger target.

use std::collections::HashMap;

use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, types::FieldTable, BasicProperties, Channel};
use prost::Message;
use thiserror::Error;

use dup_types::{
    events::{self, Event, SimpleEvent},
    triggers::TriggerTarget,
    DeviceId, Realm,
};
use utils::telemetry::EventsMetrics;

#[derive(Error, Debug)]
pub enum EventsError {
    #[error("event publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait EventsPublisher: Send + Sync + 'static {
    async fn publish(
        &self,
        routing_key: &str,
        headers: Vec<(String, String)>,
        payload: Vec<u8>,
    ) -> Result<(), EventsError>;
}

/// Publishes to the configured events exchange over a dedicated channel.
pub struct AmqpEventsPublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpEventsPublisher {
    pub fn new(channel: Channel, exchange: String) -> Self {
        Self { channel, exchange }
    }
}

#[async_trait]
impl EventsPublisher for AmqpEventsPublisher {
    async fn publish(
        &self,
        routing_key: &str,
        headers: Vec<(String, String)>,
        payload: Vec<u8>,
    ) -> Result<(), EventsError> {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(key.into(), lapin::types::AMQPValue::LongString(value.into()));
        }

        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_headers(table),
            )
            .await
            .map_err(|e| EventsError::Publish(e.to_string()))?
            .await
            .map_err(|e| EventsError::Publish(e.to_string()))?;

        Ok(())
    }
}

/// Serializes one event per target and publishes it with the target's
/// routing key and headers.
#[derive(Clone)]
pub struct TriggersHandler<P> {
    publisher: P,
    metrics: EventsMetrics,
}

impl<P: EventsPublisher> TriggersHandler<P> {
    pub fn new(publisher: P, metrics: EventsMetrics) -> Self {
        Self { publisher, metrics }
    }

    pub async fn device_connected(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        ip: &str,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::DeviceConnected(events::DeviceConnectedEvent {
                device_ip_address: ip.to_string(),
            }),
        )
        .await
    }

    pub async fn device_disconnected(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::DeviceDisconnected(events::DeviceDisconnectedEvent {}),
        )
        .await
    }

    pub async fn device_empty_cache_received(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::DeviceEmptyCacheReceived(events::DeviceEmptyCacheReceivedEvent {}),
        )
        .await
    }

    pub async fn device_error(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        error_name: &str,
        metadata: HashMap<String, String>,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::DeviceError(events::DeviceErrorEvent {
                error_name: error_name.to_string(),
                metadata,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn incoming_data(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        path: &str,
        bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::IncomingData(events::IncomingDataEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                bson_value,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn value_change(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        path: &str,
        old_bson_value: Vec<u8>,
        new_bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::ValueChange(events::ValueChangeEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                old_bson_value,
                new_bson_value,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn value_change_applied(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        path: &str,
        old_bson_value: Vec<u8>,
        new_bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::ValueChangeApplied(events::ValueChangeAppliedEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                old_bson_value,
                new_bson_value,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn path_created(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        path: &str,
        bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::PathCreated(events::PathCreatedEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                bson_value,
            }),
        )
        .await
    }

    pub async fn path_removed(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        path: &str,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::PathRemoved(events::PathRemovedEvent {
                interface: interface.to_string(),
                path: path.to_string(),
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn value_stored(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        path: &str,
        bson_value: Vec<u8>,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::ValueStored(events::ValueStoredEvent {
                interface: interface.to_string(),
                path: path.to_string(),
                bson_value,
            }),
        )
        .await
    }

    pub async fn incoming_introspection(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        introspection: &str,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::IncomingIntrospection(events::IncomingIntrospectionEvent {
                introspection: introspection.to_string(),
            }),
        )
        .await
    }

    pub async fn interface_added(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        major_version: i32,
        minor_version: i32,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::InterfaceAdded(events::InterfaceAddedEvent {
                interface: interface.to_string(),
                major_version,
                minor_version,
            }),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn interface_minor_updated(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        major_version: i32,
        old_minor_version: i32,
        new_minor_version: i32,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::InterfaceMinorUpdated(events::InterfaceMinorUpdatedEvent {
                interface: interface.to_string(),
                major_version,
                old_minor_version,
                new_minor_version,
            }),
        )
        .await
    }

    pub async fn interface_removed(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        interface: &str,
        major_version: i32,
        timestamp_ms: i64,
    ) -> Result<(), EventsError> {
        self.dispatch(
            targets,
            realm,
            device_id,
            Some(timestamp_ms),
            Event::InterfaceRemoved(events::InterfaceRemovedEvent {
                interface: interface.to_string(),
                major_version,
            }),
        )
        .await
    }

    async fn dispatch(
        &self,
        targets: &[TriggerTarget],
        realm: &Realm,
        device_id: DeviceId,
        timestamp_ms: Option<i64>,
        event: Event,
    ) -> Result<(), EventsError> {
        let event_type = event.type_name();
        let is_data_event = event.is_data_event();
        let device_id = device_id.encode();

        for target in targets {
            let simple_event = SimpleEvent {
                version: 1,
                realm: realm.as_str().to_string(),
                device_id: device_id.clone(),
                parent_trigger_id: Some(target.parent_trigger_id.to_string()),
                simple_trigger_id: Some(target.simple_trigger_id.to_string()),
                timestamp_ms,
                event: Some(event.clone()),
            };

            let mut headers: Vec<(String, String)> = target.static_headers.clone();
            headers.push(("x_astarte_realm".to_string(), realm.as_str().to_string()));
            headers.push(("x_astarte_device_id".to_string(), device_id.clone()));
            headers.push(("x_astarte_event_type".to_string(), event_type.to_string()));
            if is_data_event {
                headers.push((
                    "x_astarte_simple_trigger_id".to_string(),
                    target.simple_trigger_id.to_string(),
                ));
                headers.push((
                    "x_astarte_parent_trigger_id".to_string(),
                    target.parent_trigger_id.to_string(),
                ));
            }

            self.publisher
                .publish(&target.routing_key, headers, simple_event.encode_to_vec())
                .await
                .inspect_err(|_| self.metrics.increment_total_errors())?;
            self.metrics.record_published(event_type);
        }

        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub struct PublishedEvent {
        pub routing_key: String,
        pub headers: Vec<(String, String)>,
        pub event: SimpleEvent,
    }

    impl PublishedEvent {
        pub fn header(&self, key: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        }
    }

    /// Decodes and records every published event instead of touching the
    /// broker.
    #[derive(Clone, Default)]
    pub struct MockEventsPublisher {
        published: Arc<Mutex<Vec<PublishedEvent>>>,
    }

    impl MockEventsPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn published(&self) -> Vec<PublishedEvent> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventsPublisher for MockEventsPublisher {
        async fn publish(
            &self,
            routing_key: &str,
            headers: Vec<(String, String)>,
            payload: Vec<u8>,
        ) -> Result<(), EventsError> {
            let event = SimpleEvent::decode(payload.as_slice())
                .map_err(|e| EventsError::Publish(e.to_string()))?;
            self.published.lock().unwrap().push(PublishedEvent {
                routing_key: routing_key.to_string(),
                headers,
                event,
            });
            Ok(())
        }
    }
}
