//! Control-path handling: device-properties pruning and the empty-cache
//! resend of server-owned property values.

use std::collections::{HashMap, HashSet};

use bson::doc;

use dup_types::{
    triggers::{DataTriggerEvent, DeviceTriggerEvent},
    InterfaceType, Ownership, Timestamp,
};

use crate::apis::vmq::VmqPlugin;
use crate::payload::{encode_properties_payload, parse_producer_properties};
use crate::queries::{Consistency, Queries};
use crate::subsystems::events::EventsPublisher;
use crate::subsystems::tracker::MessageId;

use super::error::{MessageViolation, UpdaterError};
use super::DataUpdater;

impl<Q, P, V> DataUpdater<Q, P, V>
where
    Q: Queries,
    P: EventsPublisher,
    V: VmqPlugin,
{
    pub(super) async fn handle_control(
        &mut self,
        control_path: &str,
        payload: &[u8],
        message_id: MessageId,
        timestamp: Timestamp,
    ) -> Result<(), UpdaterError> {
        match control_path {
            "/producer/properties" => {
                self.handle_producer_properties(payload, message_id, timestamp)
                    .await
            }
            "/emptyCache" => self.handle_empty_cache(message_id, timestamp).await,
            other => {
                tracing::warn!("unexpected control message on {}", other);
                let metadata =
                    HashMap::from([("control_path".to_string(), other.to_string())]);
                self.handle_violation(
                    MessageViolation::UnexpectedControlMessage,
                    message_id,
                    timestamp,
                    metadata,
                    false,
                )
                .await
            }
        }
    }

    /// The device declared the full set of properties it still holds;
    /// everything stored beyond that set is pruned.
    async fn handle_producer_properties(
        &mut self,
        payload: &[u8],
        message_id: MessageId,
        timestamp: Timestamp,
    ) -> Result<(), UpdaterError> {
        let keep: HashSet<(String, String)> = match parse_producer_properties(payload) {
            Ok(entries) => entries.into_iter().collect(),
            Err(err) => {
                tracing::warn!("invalid device properties payload: {}", err);
                return self
                    .handle_violation(
                        MessageViolation::InvalidProperties,
                        message_id,
                        timestamp,
                        HashMap::new(),
                        true,
                    )
                    .await;
            }
        };

        let names: Vec<String> = self.introspection.keys().cloned().collect();
        for name in names {
            if !self.interfaces.contains_key(&name) && !self.load_interface(&name).await? {
                tracing::warn!("skipping prune of {}: schema not found", name);
                continue;
            }
            let descriptor = self.interfaces[&name].clone();
            if descriptor.interface_type != InterfaceType::Properties
                || descriptor.ownership != Ownership::Device
            {
                continue;
            }

            let stored = self
                .queries
                .fetch_interface_properties(&self.realm, self.device_id, descriptor.interface_id)
                .await?;
            for property in stored {
                if keep.contains(&(name.clone(), property.path.clone())) {
                    continue;
                }

                self.queries
                    .delete_property(
                        &self.realm,
                        self.device_id,
                        descriptor.interface_id,
                        property.endpoint_id,
                        &property.path,
                        Consistency::Quorum,
                    )
                    .await?;

                let targets = self.triggers.data_targets(
                    DataTriggerEvent::PathRemoved,
                    descriptor.interface_id,
                    Some(property.endpoint_id),
                    &property.path,
                    None,
                );
                if !targets.is_empty() {
                    self.triggers_handler
                        .path_removed(
                            &targets,
                            &self.realm,
                            self.device_id,
                            &name,
                            &property.path,
                            timestamp.as_millis(),
                        )
                        .await?;
                }
            }
        }

        self.tracker.ack(message_id).await?;
        self.metrics.total_processed_messages.add(1, &[]);
        Ok(())
    }

    /// A device with an empty local cache asked for the server-owned
    /// state: resend every server property value, then the property list
    /// as a consumer-properties control message.
    async fn handle_empty_cache(
        &mut self,
        message_id: MessageId,
        timestamp: Timestamp,
    ) -> Result<(), UpdaterError> {
        let device = self.device_id.encode();
        let mut absolute_paths = Vec::new();

        let names: Vec<String> = self.introspection.keys().cloned().collect();
        for name in names {
            if !self.interfaces.contains_key(&name) && !self.load_interface(&name).await? {
                tracing::warn!("skipping empty-cache resend of {}: schema not found", name);
                continue;
            }
            let descriptor = self.interfaces[&name].clone();
            if descriptor.interface_type != InterfaceType::Properties
                || descriptor.ownership != Ownership::Server
            {
                continue;
            }

            let stored = self
                .queries
                .fetch_interface_properties(&self.realm, self.device_id, descriptor.interface_id)
                .await?;
            for property in stored {
                let topic = format!("{}/{}/{}{}", self.realm, device, name, property.path);
                let payload =
                    bson::to_vec(&doc! { "v": property.value.clone() }).unwrap_or_default();
                self.vmq.publish(&topic, &payload, 2).await?;
                absolute_paths.push(format!("{}{}", name, property.path));
            }
        }

        let control_topic = format!("{}/{}/control/consumer/properties", self.realm, device);
        self.vmq
            .publish(
                &control_topic,
                &encode_properties_payload(&absolute_paths),
                2,
            )
            .await?;

        self.queries
            .set_pending_empty_cache(&self.realm, self.device_id, false)
            .await?;

        let targets = self
            .triggers
            .device_targets(DeviceTriggerEvent::EmptyCacheReceived);
        if !targets.is_empty() {
            self.triggers_handler
                .device_empty_cache_received(
                    &targets,
                    &self.realm,
                    self.device_id,
                    timestamp.as_millis(),
                )
                .await?;
        }

        self.tracker.ack(message_id).await?;
        self.metrics.total_processed_messages.add(1, &[]);
        Ok(())
    }
}
