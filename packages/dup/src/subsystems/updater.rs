//! The per-device actor. One task per `{realm, device_id}` serializes
//! every state mutation for that device; the message tracker gates
//! processing so broker order is preserved even across crashes.

pub mod cache;
mod control;
pub mod data;
pub mod error;
mod introspection;
pub mod triggers;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::instrument;
use uuid::Uuid;

use dup_types::{
    triggers::{DeviceTriggerEvent, SimpleTriggerConfig, TriggerObject, TriggerTarget},
    DeviceId, EndpointsAutomaton, InterfaceDescriptor, Mapping, Realm, Timestamp,
    DEVICE_TRIGGERS_LIFESPAN, INTERFACE_LIFESPAN,
};
use utils::telemetry::UpdaterMetrics;

use crate::apis::vmq::VmqPlugin;
use crate::queries::Queries;
use crate::subsystems::events::{EventsPublisher, TriggersHandler};
use crate::subsystems::tracker::{MessageId, TrackerHandle};

use cache::PathsCache;
use error::{MessageViolation, UpdaterError, VolatileTriggerError};
use triggers::{InterfaceTriggerContext, TriggerTables, VolatileTrigger};

/// Work items posted to a device actor's inbox.
#[derive(Debug)]
pub enum UpdaterMessage {
    Connection {
        ip: String,
        message_id: MessageId,
        timestamp: Timestamp,
    },
    Disconnection {
        message_id: MessageId,
        timestamp: Timestamp,
    },
    Data {
        interface: String,
        path: String,
        payload: Vec<u8>,
        message_id: MessageId,
        timestamp: Timestamp,
    },
    Introspection {
        payload: Vec<u8>,
        message_id: MessageId,
        timestamp: Timestamp,
    },
    Control {
        path: String,
        payload: Vec<u8>,
        message_id: MessageId,
        timestamp: Timestamp,
    },
    InstallVolatileTrigger {
        trigger_id: Uuid,
        config: SimpleTriggerConfig,
        target: TriggerTarget,
        message_id: MessageId,
        reply: oneshot::Sender<Result<(), VolatileTriggerError>>,
    },
    DeleteVolatileTrigger {
        trigger_id: Uuid,
        message_id: MessageId,
        reply: oneshot::Sender<Result<(), VolatileTriggerError>>,
    },
}

impl UpdaterMessage {
    pub(crate) fn message_id(&self) -> &MessageId {
        match self {
            UpdaterMessage::Connection { message_id, .. }
            | UpdaterMessage::Disconnection { message_id, .. }
            | UpdaterMessage::Data { message_id, .. }
            | UpdaterMessage::Introspection { message_id, .. }
            | UpdaterMessage::Control { message_id, .. }
            | UpdaterMessage::InstallVolatileTrigger { message_id, .. }
            | UpdaterMessage::DeleteVolatileTrigger { message_id, .. } => message_id,
        }
    }

    fn timestamp(&self) -> Timestamp {
        match self {
            UpdaterMessage::Connection { timestamp, .. }
            | UpdaterMessage::Disconnection { timestamp, .. }
            | UpdaterMessage::Data { timestamp, .. }
            | UpdaterMessage::Introspection { timestamp, .. }
            | UpdaterMessage::Control { timestamp, .. } => *timestamp,
            UpdaterMessage::InstallVolatileTrigger { .. }
            | UpdaterMessage::DeleteVolatileTrigger { .. } => Timestamp::now(),
        }
    }
}

pub struct DataUpdater<Q, P, V> {
    realm: Realm,
    device_id: DeviceId,
    queries: Arc<Q>,
    triggers_handler: Arc<TriggersHandler<P>>,
    vmq: Arc<V>,
    tracker: TrackerHandle,
    metrics: UpdaterMetrics,

    connected: bool,
    last_seen_message: Timestamp,
    last_device_triggers_refresh: Timestamp,
    introspection: HashMap<String, i32>,
    introspection_minor: HashMap<String, i32>,
    interfaces: HashMap<String, InterfaceDescriptor>,
    interfaces_by_expiry: VecDeque<(Timestamp, String)>,
    interface_ids_to_name: HashMap<Uuid, String>,
    mappings: HashMap<Uuid, Mapping>,
    paths_cache: PathsCache,
    triggers: TriggerTables,
    total_received_msgs: i64,
    total_received_bytes: i64,
    datastream_maximum_storage_retention: Option<i64>,
}

impl<Q, P, V> DataUpdater<Q, P, V>
where
    Q: Queries,
    P: EventsPublisher,
    V: VmqPlugin,
{
    /// Loads the device row and the device-level trigger tables, then
    /// hands back an actor ready to register with its tracker.
    pub async fn init(
        realm: Realm,
        device_id: DeviceId,
        queries: Arc<Q>,
        triggers_handler: Arc<TriggersHandler<P>>,
        vmq: Arc<V>,
        tracker: TrackerHandle,
        metrics: UpdaterMetrics,
    ) -> Result<Self, UpdaterError> {
        let registration = queries.fetch_device_registration(&realm, device_id).await?;
        let retention = queries
            .fetch_datastream_maximum_storage_retention(&realm)
            .await?;

        let now = Timestamp::now();
        let mut updater = Self {
            realm,
            device_id,
            queries,
            triggers_handler,
            vmq,
            tracker,
            metrics,
            connected: registration.connected,
            last_seen_message: now,
            last_device_triggers_refresh: now,
            introspection: registration.introspection,
            introspection_minor: registration.introspection_minor,
            interfaces: HashMap::new(),
            interfaces_by_expiry: VecDeque::new(),
            interface_ids_to_name: HashMap::new(),
            mappings: HashMap::new(),
            paths_cache: PathsCache::new(),
            triggers: TriggerTables::default(),
            total_received_msgs: registration.total_received_msgs,
            total_received_bytes: registration.total_received_bytes,
            datastream_maximum_storage_retention: retention,
        };
        updater.reload_device_triggers().await?;
        Ok(updater)
    }

    /// Runs the actor until its inbox closes, the kill signal fires, or an
    /// infrastructure error crashes it (which requeues everything still in
    /// flight).
    #[instrument(skip_all, fields(subsys = "DataUpdater", realm = %self.realm, device = %self.device_id))]
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<UpdaterMessage>,
        mut kill: broadcast::Receiver<()>,
    ) -> Result<(), UpdaterError> {
        self.tracker.register().await?;
        self.metrics.active_devices.add(1, &[]);

        let result = loop {
            tokio::select! {
                _ = kill.recv() => break Ok(()),
                message = inbox.recv() => match message {
                    None => break Ok(()),
                    Some(message) => {
                        if let Err(err) = self.handle_message(message).await {
                            tracing::error!("device actor crashing: {}", err);
                            break Err(err);
                        }
                    }
                }
            }
        };

        self.metrics.active_devices.add(-1, &[]);
        result
    }

    pub(super) async fn handle_message(
        &mut self,
        message: UpdaterMessage,
    ) -> Result<(), UpdaterError> {
        let message_id = message.message_id().clone();
        let timestamp = message.timestamp();

        self.run_time_based_actions(timestamp).await?;

        if !self.tracker.can_process(message_id.clone()).await? {
            tracing::debug!("skipping out-of-order or duplicate delivery");
            return Ok(());
        }

        match message {
            UpdaterMessage::Connection { ip, .. } => {
                self.handle_connection(&ip, message_id, timestamp).await
            }
            UpdaterMessage::Disconnection { .. } => {
                self.handle_disconnection(message_id, timestamp).await
            }
            UpdaterMessage::Data {
                interface,
                path,
                payload,
                ..
            } => {
                self.handle_data(&interface, &path, &payload, message_id, timestamp)
                    .await
            }
            UpdaterMessage::Introspection { payload, .. } => {
                self.handle_introspection(&payload, message_id, timestamp)
                    .await
            }
            UpdaterMessage::Control { path, payload, .. } => {
                self.handle_control(&path, &payload, message_id, timestamp)
                    .await
            }
            UpdaterMessage::InstallVolatileTrigger {
                trigger_id,
                config,
                target,
                reply,
                ..
            } => {
                let result = self
                    .handle_install_volatile_trigger(trigger_id, config, target)
                    .await?;
                let _ = reply.send(result);
                self.tracker.ack(message_id).await?;
                Ok(())
            }
            UpdaterMessage::DeleteVolatileTrigger {
                trigger_id, reply, ..
            } => {
                let _ = reply.send(self.handle_delete_volatile_trigger(trigger_id));
                self.tracker.ack(message_id).await?;
                Ok(())
            }
        }
    }

    /// Time-based housekeeping, run before every message: expire stale
    /// interface-cache entries and refresh the device-level triggers.
    async fn run_time_based_actions(&mut self, timestamp: Timestamp) -> Result<(), UpdaterError> {
        self.last_seen_message = timestamp;

        while self
            .interfaces_by_expiry
            .front()
            .is_some_and(|(expiry, _)| *expiry <= timestamp)
        {
            if let Some((_, name)) = self.interfaces_by_expiry.pop_front() {
                tracing::debug!("interface cache entry for {} expired", name);
                self.drop_interface(&name);
            }
        }

        if (timestamp - self.last_device_triggers_refresh).as_ticks()
            >= DEVICE_TRIGGERS_LIFESPAN.as_ticks()
        {
            self.reload_device_triggers().await?;
            self.last_device_triggers_refresh = timestamp;
        }

        Ok(())
    }

    async fn handle_connection(
        &mut self,
        ip: &str,
        message_id: MessageId,
        timestamp: Timestamp,
    ) -> Result<(), UpdaterError> {
        let ip: IpAddr = ip.parse().unwrap_or_else(|_| {
            tracing::warn!("device connected with unparsable ip {:?}", ip);
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });

        self.queries
            .set_device_connected(&self.realm, self.device_id, timestamp.as_millis(), ip)
            .await?;

        let targets = self.triggers.device_targets(DeviceTriggerEvent::Connected);
        self.triggers_handler
            .device_connected(
                &targets,
                &self.realm,
                self.device_id,
                &ip.to_string(),
                timestamp.as_millis(),
            )
            .await?;

        self.tracker.ack(message_id).await?;
        self.connected = true;
        self.metrics.total_processed_messages.add(1, &[]);
        Ok(())
    }

    async fn handle_disconnection(
        &mut self,
        message_id: MessageId,
        timestamp: Timestamp,
    ) -> Result<(), UpdaterError> {
        self.queries
            .set_device_disconnected(
                &self.realm,
                self.device_id,
                timestamp.as_millis(),
                self.total_received_msgs,
                self.total_received_bytes,
            )
            .await?;

        let targets = self
            .triggers
            .device_targets(DeviceTriggerEvent::Disconnected);
        self.triggers_handler
            .device_disconnected(&targets, &self.realm, self.device_id, timestamp.as_millis())
            .await?;

        self.tracker.ack(message_id).await?;
        self.connected = false;
        self.metrics.total_processed_messages.add(1, &[]);
        Ok(())
    }

    async fn handle_install_volatile_trigger(
        &mut self,
        trigger_id: Uuid,
        config: SimpleTriggerConfig,
        target: TriggerTarget,
    ) -> Result<Result<(), VolatileTriggerError>, UpdaterError> {
        // data triggers against an interface this actor has not loaded yet
        // are validated against the database schema instead
        if let SimpleTriggerConfig::Data {
            interface_name,
            interface_major,
            ..
        } = &config
        {
            if interface_name != "*" && !self.interfaces.contains_key(interface_name) {
                let Some(row) = self
                    .queries
                    .fetch_interface_row(&self.realm, interface_name, *interface_major)
                    .await?
                else {
                    return Ok(Err(VolatileTriggerError::InterfaceNotFound));
                };
                let mappings = self
                    .queries
                    .fetch_interface_mappings(&self.realm, row.interface_id)
                    .await?;
                let context = InterfaceTriggerContext {
                    interface_id: row.interface_id,
                    aggregation: row.aggregation,
                    mappings: mappings.iter().collect(),
                };
                let result = self.triggers.install(&config, target.clone(), Some(context));
                if result.is_ok() {
                    self.triggers.volatile.push(VolatileTrigger {
                        id: trigger_id,
                        config,
                        target,
                    });
                }
                return Ok(result);
            }
        }

        let result = self.install_compiled(&config, target.clone());
        if result.is_ok() {
            self.triggers.volatile.push(VolatileTrigger {
                id: trigger_id,
                config,
                target,
            });
        }
        Ok(result)
    }

    fn handle_delete_volatile_trigger(
        &mut self,
        trigger_id: Uuid,
    ) -> Result<(), VolatileTriggerError> {
        let position = self
            .triggers
            .volatile
            .iter()
            .position(|v| v.id == trigger_id)
            .ok_or(VolatileTriggerError::NotFound)?;
        let removed = self.triggers.volatile.remove(position);
        self.triggers.remove_target(removed.target.simple_trigger_id);
        Ok(())
    }

    /// Installs a trigger, resolving the interface context from the loaded
    /// descriptors.
    fn install_compiled(
        &mut self,
        config: &SimpleTriggerConfig,
        target: TriggerTarget,
    ) -> Result<(), VolatileTriggerError> {
        let context = match config {
            SimpleTriggerConfig::Data { interface_name, .. } if interface_name != "*" => {
                match self.interfaces.get(interface_name) {
                    Some(descriptor) => Some(InterfaceTriggerContext {
                        interface_id: descriptor.interface_id,
                        aggregation: descriptor.aggregation,
                        mappings: self
                            .mappings
                            .values()
                            .filter(|m| m.interface_id == descriptor.interface_id)
                            .collect(),
                    }),
                    None => None,
                }
            }
            _ => None,
        };
        self.triggers.install(config, target, context)
    }

    /// Reloads the device-level, any-device, and any-interface trigger
    /// tables from storage, then re-applies the volatile triggers.
    async fn reload_device_triggers(&mut self) -> Result<(), UpdaterError> {
        self.triggers.clear_refreshable();

        for object in [
            TriggerObject::Device(self.device_id),
            TriggerObject::AnyDevice,
            TriggerObject::AnyInterface,
        ] {
            let rows = self.queries.fetch_simple_triggers(&self.realm, object).await?;
            for row in rows {
                if let Err(err) = self.install_compiled(&row.config, row.target) {
                    tracing::warn!("skipping stored trigger: {}", err);
                }
            }
        }

        for volatile in self.triggers.volatile.clone() {
            if let Err(err) = self.install_compiled(&volatile.config, volatile.target) {
                tracing::debug!("volatile trigger {} not re-applied: {}", volatile.id, err);
            }
        }

        Ok(())
    }

    /// Loads an interface the device declares into the cache, together
    /// with its mappings and interface-scoped triggers. Returns false when
    /// the schema cannot be found.
    pub(super) async fn load_interface(&mut self, name: &str) -> Result<bool, UpdaterError> {
        let Some(&major) = self.introspection.get(name) else {
            return Ok(false);
        };
        let Some(row) = self
            .queries
            .fetch_interface_row(&self.realm, name, major)
            .await?
        else {
            return Ok(false);
        };

        let mappings = self
            .queries
            .fetch_interface_mappings(&self.realm, row.interface_id)
            .await?;
        let automaton = EndpointsAutomaton::from_endpoints(
            mappings.iter().map(|m| (m.endpoint.as_str(), m.endpoint_id)),
        );
        let descriptor = InterfaceDescriptor {
            interface_id: row.interface_id,
            name: row.name,
            major_version: row.major_version,
            minor_version: row.minor_version,
            interface_type: row.interface_type,
            aggregation: row.aggregation,
            ownership: row.ownership,
            storage: row.storage,
            storage_type: row.storage_type,
            automaton,
        };

        self.interface_ids_to_name
            .insert(descriptor.interface_id, name.to_string());
        for mapping in &mappings {
            self.mappings.insert(mapping.endpoint_id, mapping.clone());
        }
        self.interfaces_by_expiry
            .push_back((self.last_seen_message + INTERFACE_LIFESPAN, name.to_string()));
        let interface_id = descriptor.interface_id;
        self.interfaces.insert(name.to_string(), descriptor);

        let rows = self
            .queries
            .fetch_simple_triggers(&self.realm, TriggerObject::Interface(interface_id))
            .await?;
        for row in rows {
            if let Err(err) = self.install_compiled(&row.config, row.target) {
                tracing::warn!("skipping stored trigger on {}: {}", name, err);
            }
        }

        for volatile in self.triggers.volatile.clone() {
            let _ = self.install_compiled(&volatile.config, volatile.target);
        }

        Ok(true)
    }

    /// Forgets one loaded interface: descriptor, mappings, id index, and
    /// the triggers keyed by its id.
    fn drop_interface(&mut self, name: &str) {
        let Some(descriptor) = self.interfaces.remove(name) else {
            return;
        };
        let interface_id = descriptor.interface_id;
        self.interface_ids_to_name.remove(&interface_id);
        self.mappings.retain(|_, m| m.interface_id != interface_id);
        self.triggers.forget_interface(interface_id);
    }

    /// Forgets interfaces removed by an introspection change; unlike plain
    /// expiry this also rewrites the expiry queue.
    pub(super) fn forget_interfaces(&mut self, names: &[String]) {
        for name in names {
            self.drop_interface(name);
        }
        let interfaces = &self.interfaces;
        self.interfaces_by_expiry
            .retain(|(_, name)| interfaces.contains_key(name));
    }

    /// Asks the device for a clean session: flag it in storage and drop
    /// the broker session so it reconnects from scratch.
    pub(super) async fn ask_clean_session(&mut self) -> Result<(), UpdaterError> {
        self.queries
            .set_pending_empty_cache(&self.realm, self.device_id, true)
            .await?;
        self.vmq
            .disconnect(
                &format!("{}/{}", self.realm, self.device_id.encode()),
                true,
            )
            .await?;
        Ok(())
    }

    /// Handles a payload violation per policy: warn, fire the device-error
    /// triggers, optionally ask a clean session, and discard the message.
    pub(super) async fn handle_violation(
        &mut self,
        violation: MessageViolation,
        message_id: MessageId,
        timestamp: Timestamp,
        metadata: HashMap<String, String>,
        clean_session: bool,
    ) -> Result<(), UpdaterError> {
        tracing::warn!(
            "discarding message: {} {:?}",
            violation.error_name(),
            metadata
        );
        self.metrics.total_discarded_messages.add(1, &[]);
        self.metrics.increment_total_errors(violation.error_name());

        let targets = self.triggers.device_targets(DeviceTriggerEvent::Error);
        if !targets.is_empty() {
            self.triggers_handler
                .device_error(
                    &targets,
                    &self.realm,
                    self.device_id,
                    violation.error_name(),
                    metadata,
                    timestamp.as_millis(),
                )
                .await?;
        }

        if clean_session {
            self.ask_clean_session().await?;
        }

        self.tracker.discard(message_id).await?;
        Ok(())
    }
}
