//! The data critical path: endpoint resolution, payload decoding, trigger
//! evaluation, and value insertion.

use std::collections::HashMap;

use bson::{doc, Bson};

use dup_types::{
    endpoint_id, path_segments,
    triggers::DataTriggerEvent,
    Aggregation, Duration, InterfaceDescriptor, InterfaceType, Mapping, Ownership, ResolvedPath,
    Timestamp,
};

use crate::apis::vmq::{VmqError, VmqPlugin};
use crate::payload::decode_bson_payload;
use crate::queries::{Consistency, PathStatus, Queries, QueriesError};
use crate::subsystems::events::{EventsError, EventsPublisher};
use crate::subsystems::tracker::{MessageId, TrackerError};

use super::error::{MessageViolation, UpdaterError};
use super::DataUpdater;

/// Hard cap on a single serialized value.
const VALUE_SIZE_LIMIT: usize = 65_535;

/// Why the data path stopped short of a successful insert.
pub(super) enum DataFailure {
    /// Malformed publish; discard, clean session.
    Violation(MessageViolation),
    /// Drop the message quietly (already logged); no clean session.
    Discard,
    /// Infrastructure failure; crash the actor.
    Infra(UpdaterError),
}

impl From<QueriesError> for DataFailure {
    fn from(err: QueriesError) -> Self {
        DataFailure::Infra(err.into())
    }
}

impl From<EventsError> for DataFailure {
    fn from(err: EventsError) -> Self {
        DataFailure::Infra(err.into())
    }
}

impl From<TrackerError> for DataFailure {
    fn from(err: TrackerError) -> Self {
        DataFailure::Infra(err.into())
    }
}

impl From<VmqError> for DataFailure {
    fn from(err: VmqError) -> Self {
        DataFailure::Infra(err.into())
    }
}

/// Encodes a value the way events carry it: a `{v: value}` document, or
/// empty bytes for no value.
fn encode_value(value: Option<&Bson>) -> Vec<u8> {
    match value {
        Some(value) => bson::to_vec(&doc! { "v": value.clone() }).unwrap_or_default(),
        None => Vec::new(),
    }
}

enum ResolvedEndpoint {
    Individual {
        mapping: Mapping,
    },
    Object {
        expected: Vec<Mapping>,
        object_endpoint_id: uuid::Uuid,
    },
}

impl<Q, P, V> DataUpdater<Q, P, V>
where
    Q: Queries,
    P: EventsPublisher,
    V: VmqPlugin,
{
    pub(super) async fn handle_data(
        &mut self,
        interface: &str,
        path: &str,
        payload: &[u8],
        message_id: MessageId,
        timestamp: Timestamp,
    ) -> Result<(), UpdaterError> {
        match self.process_data(interface, path, payload, timestamp).await {
            Ok(()) => {
                self.total_received_msgs += 1;
                self.total_received_bytes +=
                    (payload.len() + interface.len() + path.len()) as i64;
                self.tracker.ack(message_id).await?;
                self.metrics.total_processed_messages.add(1, &[]);
                Ok(())
            }
            Err(DataFailure::Violation(violation)) => {
                let metadata = HashMap::from([
                    ("interface".to_string(), interface.to_string()),
                    ("path".to_string(), path.to_string()),
                ]);
                self.handle_violation(violation, message_id, timestamp, metadata, true)
                    .await
            }
            Err(DataFailure::Discard) => {
                self.metrics.total_discarded_messages.add(1, &[]);
                self.tracker.discard(message_id).await?;
                Ok(())
            }
            Err(DataFailure::Infra(err)) => Err(err),
        }
    }

    async fn process_data(
        &mut self,
        interface: &str,
        path: &str,
        payload: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), DataFailure> {
        if path.contains("//") {
            return Err(DataFailure::Violation(MessageViolation::InvalidPath));
        }

        if !self.interfaces.contains_key(interface) {
            let loaded = self
                .load_interface(interface)
                .await
                .map_err(DataFailure::Infra)?;
            if !loaded {
                tracing::warn!("no schema for interface {} in introspection", interface);
                return Err(DataFailure::Violation(
                    MessageViolation::InterfaceLoadingFailed,
                ));
            }
        }
        let descriptor = self.interfaces[interface].clone();

        if descriptor.ownership == Ownership::Server {
            return Err(DataFailure::Violation(
                MessageViolation::CannotWriteOnServerOwnedInterface,
            ));
        }

        let resolved = self.resolve_endpoint(&descriptor, path)?;

        let decoded = decode_bson_payload(payload)
            .map_err(|_| DataFailure::Violation(MessageViolation::UndecodableBsonPayload))?;
        self.check_value_type(&resolved, decoded.value.as_ref())?;

        let value = decoded.value;
        let value_timestamp_ms = decoded.timestamp_ms.unwrap_or(timestamp.as_millis());

        // incoming_data fires for every well-formed publish, before any
        // storage side effect
        let endpoint_for_lookup = match &resolved {
            ResolvedEndpoint::Individual { mapping } => mapping.endpoint_id,
            ResolvedEndpoint::Object {
                object_endpoint_id, ..
            } => *object_endpoint_id,
        };
        let encoded_value = encode_value(value.as_ref());
        let targets = self.triggers.data_targets(
            DataTriggerEvent::IncomingData,
            descriptor.interface_id,
            Some(endpoint_for_lookup),
            path,
            value.as_ref(),
        );
        if !targets.is_empty() {
            self.triggers_handler
                .incoming_data(
                    &targets,
                    &self.realm,
                    self.device_id,
                    interface,
                    path,
                    encoded_value.clone(),
                    value_timestamp_ms,
                )
                .await?;
        }

        match (&resolved, descriptor.interface_type) {
            (ResolvedEndpoint::Individual { mapping }, InterfaceType::Properties) => {
                self.store_property(
                    &descriptor,
                    mapping.clone(),
                    path,
                    value,
                    &encoded_value,
                    value_timestamp_ms,
                    timestamp,
                )
                .await
            }
            (ResolvedEndpoint::Individual { mapping }, InterfaceType::Datastream) => {
                self.store_datastream(
                    &descriptor,
                    mapping.clone(),
                    path,
                    value,
                    &encoded_value,
                    value_timestamp_ms,
                    timestamp,
                )
                .await
            }
            (
                ResolvedEndpoint::Object {
                    expected,
                    object_endpoint_id,
                },
                _,
            ) => {
                self.store_object_datastream(
                    &descriptor,
                    expected.clone(),
                    *object_endpoint_id,
                    path,
                    value,
                    &encoded_value,
                    value_timestamp_ms,
                    timestamp,
                )
                .await
            }
        }
    }

    fn resolve_endpoint(
        &self,
        descriptor: &InterfaceDescriptor,
        path: &str,
    ) -> Result<ResolvedEndpoint, DataFailure> {
        match descriptor.aggregation {
            Aggregation::Individual => match descriptor.automaton.resolve_path(path) {
                ResolvedPath::Exact(endpoint_id) => {
                    let mapping = self
                        .mappings
                        .get(&endpoint_id)
                        .cloned()
                        .ok_or(DataFailure::Violation(MessageViolation::MappingNotFound))?;
                    Ok(ResolvedEndpoint::Individual { mapping })
                }
                _ => Err(DataFailure::Violation(MessageViolation::MappingNotFound)),
            },
            Aggregation::Object => match descriptor.automaton.resolve_path(path) {
                ResolvedPath::Guessed(endpoint_ids) => {
                    // every guessed endpoint must sit exactly one level
                    // below the published path
                    let depth = path_segments(path).len();
                    let mut expected = Vec::with_capacity(endpoint_ids.len());
                    for id in endpoint_ids {
                        let mapping = self
                            .mappings
                            .get(&id)
                            .ok_or(DataFailure::Violation(MessageViolation::MappingNotFound))?;
                        if path_segments(&mapping.endpoint).len() != depth + 1 {
                            return Err(DataFailure::Violation(
                                MessageViolation::GuessedEndpoints,
                            ));
                        }
                        expected.push(mapping.clone());
                    }
                    Ok(ResolvedEndpoint::Object {
                        expected,
                        object_endpoint_id: endpoint_id(
                            &descriptor.name,
                            descriptor.major_version,
                            "",
                        ),
                    })
                }
                _ => Err(DataFailure::Violation(MessageViolation::GuessedEndpoints)),
            },
        }
    }

    fn check_value_type(
        &self,
        resolved: &ResolvedEndpoint,
        value: Option<&Bson>,
    ) -> Result<(), DataFailure> {
        let Some(value) = value else {
            return Ok(());
        };

        match resolved {
            ResolvedEndpoint::Individual { mapping } => {
                if !mapping.value_type.conforms(value) {
                    return Err(DataFailure::Violation(MessageViolation::UnexpectedValueType));
                }
                if encode_value(Some(value)).len() > VALUE_SIZE_LIMIT {
                    return Err(DataFailure::Violation(MessageViolation::ValueSizeExceeded));
                }
            }
            ResolvedEndpoint::Object { expected, .. } => {
                let Bson::Document(document) = value else {
                    return Err(DataFailure::Violation(MessageViolation::UnexpectedValueType));
                };
                for (key, item) in document {
                    let mapping = expected
                        .iter()
                        .find(|m| m.last_segment() == key.as_str())
                        .ok_or(DataFailure::Violation(MessageViolation::UnexpectedObjectKey))?;
                    if !mapping.value_type.conforms(item) {
                        return Err(DataFailure::Violation(
                            MessageViolation::UnexpectedValueType,
                        ));
                    }
                    if encode_value(Some(item)).len() > VALUE_SIZE_LIMIT {
                        return Err(DataFailure::Violation(MessageViolation::ValueSizeExceeded));
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_property(
        &mut self,
        descriptor: &InterfaceDescriptor,
        mapping: Mapping,
        path: &str,
        value: Option<Bson>,
        encoded_value: &[u8],
        value_timestamp_ms: i64,
        timestamp: Timestamp,
    ) -> Result<(), DataFailure> {
        if value.is_none() && !mapping.allow_unset {
            tracing::warn!("unset on {} which does not allow it", mapping.endpoint);
            return Err(DataFailure::Violation(MessageViolation::UnexpectedValueType));
        }

        let interface_id = descriptor.interface_id;
        let endpoint_id = mapping.endpoint_id;

        let wants_previous = [
            DataTriggerEvent::ValueChange,
            DataTriggerEvent::ValueChangeApplied,
            DataTriggerEvent::PathCreated,
        ]
        .iter()
        .any(|event| {
            self.triggers
                .has_data_triggers(*event, interface_id, Some(endpoint_id), path)
        });

        let previous = if wants_previous {
            self.queries
                .fetch_property_value(&self.realm, self.device_id, interface_id, endpoint_id, path)
                .await?
        } else {
            None
        };
        let encoded_previous = encode_value(previous.as_ref());

        if previous != value {
            let targets = self.triggers.data_targets(
                DataTriggerEvent::ValueChange,
                interface_id,
                Some(endpoint_id),
                path,
                value.as_ref(),
            );
            if !targets.is_empty() {
                self.triggers_handler
                    .value_change(
                        &targets,
                        &self.realm,
                        self.device_id,
                        &descriptor.name,
                        path,
                        encoded_previous.clone(),
                        encoded_value.to_vec(),
                        value_timestamp_ms,
                    )
                    .await?;
            }
        }

        let consistency = Consistency::for_value_insert(
            InterfaceType::Properties,
            mapping.reliability,
            mapping.retention,
        );
        match &value {
            Some(value) => {
                self.queries
                    .insert_property(
                        &self.realm,
                        &descriptor.storage,
                        self.device_id,
                        interface_id,
                        endpoint_id,
                        path,
                        timestamp.as_millis(),
                        value,
                        consistency,
                    )
                    .await?;
            }
            None => {
                self.queries
                    .delete_property(
                        &self.realm,
                        self.device_id,
                        interface_id,
                        endpoint_id,
                        path,
                        consistency,
                    )
                    .await?;
            }
        }

        if previous.is_none() && value.is_some() {
            let targets = self.triggers.data_targets(
                DataTriggerEvent::PathCreated,
                interface_id,
                Some(endpoint_id),
                path,
                value.as_ref(),
            );
            if !targets.is_empty() {
                self.triggers_handler
                    .path_created(
                        &targets,
                        &self.realm,
                        self.device_id,
                        &descriptor.name,
                        path,
                        encoded_value.to_vec(),
                        value_timestamp_ms,
                    )
                    .await?;
            }
        }
        if previous.is_some() && value.is_none() {
            let targets = self.triggers.data_targets(
                DataTriggerEvent::PathRemoved,
                interface_id,
                Some(endpoint_id),
                path,
                None,
            );
            if !targets.is_empty() {
                self.triggers_handler
                    .path_removed(
                        &targets,
                        &self.realm,
                        self.device_id,
                        &descriptor.name,
                        path,
                        value_timestamp_ms,
                    )
                    .await?;
            }
        }
        if previous != value {
            let targets = self.triggers.data_targets(
                DataTriggerEvent::ValueChangeApplied,
                interface_id,
                Some(endpoint_id),
                path,
                value.as_ref(),
            );
            if !targets.is_empty() {
                self.triggers_handler
                    .value_change_applied(
                        &targets,
                        &self.realm,
                        self.device_id,
                        &descriptor.name,
                        path,
                        encoded_previous,
                        encoded_value.to_vec(),
                        value_timestamp_ms,
                    )
                    .await?;
            }
        }

        if value.is_some() {
            self.emit_value_stored(
                descriptor,
                Some(endpoint_id),
                path,
                value.as_ref(),
                encoded_value,
                value_timestamp_ms,
            )
            .await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_datastream(
        &mut self,
        descriptor: &InterfaceDescriptor,
        mapping: Mapping,
        path: &str,
        value: Option<Bson>,
        encoded_value: &[u8],
        value_timestamp_ms: i64,
        timestamp: Timestamp,
    ) -> Result<(), DataFailure> {
        let Some(value) = value else {
            tracing::warn!("datastream value for {} is null, ignoring", path);
            return Err(DataFailure::Discard);
        };

        let created_path = self
            .register_path(
                descriptor,
                mapping.endpoint_id,
                mapping.reliability,
                path,
                value_timestamp_ms,
                timestamp,
            )
            .await?;

        self.queries
            .insert_datastream_value(
                &self.realm,
                &descriptor.storage,
                self.device_id,
                descriptor.interface_id,
                mapping.endpoint_id,
                path,
                &value,
                value_timestamp_ms,
                timestamp.as_millis(),
                timestamp.sub_millis(),
                self.datastream_maximum_storage_retention,
                Consistency::for_value_insert(
                    InterfaceType::Datastream,
                    mapping.reliability,
                    mapping.retention,
                ),
            )
            .await?;

        if created_path {
            let targets = self.triggers.data_targets(
                DataTriggerEvent::PathCreated,
                descriptor.interface_id,
                Some(mapping.endpoint_id),
                path,
                Some(&value),
            );
            if !targets.is_empty() {
                self.triggers_handler
                    .path_created(
                        &targets,
                        &self.realm,
                        self.device_id,
                        &descriptor.name,
                        path,
                        encoded_value.to_vec(),
                        value_timestamp_ms,
                    )
                    .await?;
            }
        }

        self.emit_value_stored(
            descriptor,
            Some(mapping.endpoint_id),
            path,
            Some(&value),
            encoded_value,
            value_timestamp_ms,
        )
        .await?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_object_datastream(
        &mut self,
        descriptor: &InterfaceDescriptor,
        expected: Vec<Mapping>,
        object_endpoint_id: uuid::Uuid,
        path: &str,
        value: Option<Bson>,
        encoded_value: &[u8],
        value_timestamp_ms: i64,
        timestamp: Timestamp,
    ) -> Result<(), DataFailure> {
        let Some(Bson::Document(document)) = value else {
            tracing::warn!("object datastream value for {} is null, ignoring", path);
            return Err(DataFailure::Discard);
        };

        // every mapping of an object interface shares the storage
        // attributes, so the first one speaks for all of them
        let Some(attributes) = expected.first() else {
            return Err(DataFailure::Violation(MessageViolation::MappingNotFound));
        };

        let created_path = self
            .register_path(
                descriptor,
                object_endpoint_id,
                attributes.reliability,
                path,
                value_timestamp_ms,
                timestamp,
            )
            .await?;

        let mut columns = Vec::with_capacity(document.len());
        for (key, item) in &document {
            if !expected.iter().any(|m| m.last_segment() == key.as_str()) {
                tracing::warn!("skipping unknown object key {}", key);
                continue;
            }
            columns.push((
                dup_types::endpoint_to_db_column_name(key),
                item.clone(),
            ));
        }

        let explicit_timestamp_ms = attributes
            .explicit_timestamp
            .then_some(value_timestamp_ms);

        self.queries
            .insert_object_datastream_value(
                &self.realm,
                &descriptor.storage,
                self.device_id,
                descriptor.interface_id,
                path,
                &columns,
                explicit_timestamp_ms,
                timestamp.as_millis(),
                self.datastream_maximum_storage_retention,
                Consistency::for_value_insert(
                    InterfaceType::Datastream,
                    attributes.reliability,
                    attributes.retention,
                ),
            )
            .await?;

        let object_value = Bson::Document(document);
        if created_path {
            let targets = self.triggers.data_targets(
                DataTriggerEvent::PathCreated,
                descriptor.interface_id,
                Some(object_endpoint_id),
                path,
                Some(&object_value),
            );
            if !targets.is_empty() {
                self.triggers_handler
                    .path_created(
                        &targets,
                        &self.realm,
                        self.device_id,
                        &descriptor.name,
                        path,
                        encoded_value.to_vec(),
                        value_timestamp_ms,
                    )
                    .await?;
            }
        }

        self.emit_value_stored(
            descriptor,
            Some(object_endpoint_id),
            path,
            Some(&object_value),
            encoded_value,
            value_timestamp_ms,
        )
        .await?;

        Ok(())
    }

    /// Keeps the datastream path registry fresh: checks the paths cache,
    /// then the stored row's TTL, and inserts a new row when the stored
    /// one is missing or about to lapse. Returns whether the path did not
    /// exist before.
    async fn register_path(
        &mut self,
        descriptor: &InterfaceDescriptor,
        endpoint_id: uuid::Uuid,
        reliability: dup_types::Reliability,
        path: &str,
        value_timestamp_ms: i64,
        timestamp: Timestamp,
    ) -> Result<bool, DataFailure> {
        if self
            .paths_cache
            .contains(&descriptor.name, path, timestamp)
        {
            return Ok(false);
        }

        let retention = self.datastream_maximum_storage_retention;
        let status = self
            .queries
            .fetch_path_status(
                &self.realm,
                self.device_id,
                descriptor.interface_id,
                endpoint_id,
                path,
            )
            .await?;

        let still_valid = match status {
            PathStatus::Missing => false,
            PathStatus::NoExpiry => true,
            PathStatus::ExpiresIn(remaining) => remaining > retention.unwrap_or(0) + 3_600,
        };

        if !still_valid {
            let path_ttl = retention.map(|ttl| 2 * ttl + ttl / 2);
            self.queries
                .insert_path(
                    &self.realm,
                    self.device_id,
                    descriptor.interface_id,
                    endpoint_id,
                    path,
                    value_timestamp_ms,
                    timestamp.as_millis(),
                    path_ttl,
                    Consistency::for_path_insert(reliability),
                )
                .await?;
        }

        let cache_expiry = retention.map(|secs| timestamp + Duration::from_secs(secs));
        self.paths_cache
            .insert(&descriptor.name, path, cache_expiry);

        Ok(status == PathStatus::Missing)
    }

    async fn emit_value_stored(
        &self,
        descriptor: &InterfaceDescriptor,
        endpoint_id: Option<uuid::Uuid>,
        path: &str,
        value: Option<&Bson>,
        encoded_value: &[u8],
        value_timestamp_ms: i64,
    ) -> Result<(), DataFailure> {
        let targets = self.triggers.data_targets(
            DataTriggerEvent::ValueStored,
            descriptor.interface_id,
            endpoint_id,
            path,
            value,
        );
        if !targets.is_empty() {
            self.triggers_handler
                .value_stored(
                    &targets,
                    &self.realm,
                    self.device_id,
                    &descriptor.name,
                    path,
                    encoded_value.to_vec(),
                    value_timestamp_ms,
                )
                .await?;
        }
        Ok(())
    }
}
