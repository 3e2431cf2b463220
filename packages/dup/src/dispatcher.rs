//! Wires the subsystems together and owns the per-device actor registry.
//!
//! A device actor (and its message tracker) comes alive on the first
//! delivery for its `{realm, device_id}`. When an actor crashes on an
//! infrastructure error, the monitor reports the death to the tracker —
//! which requeues everything unacked — and drops the registry entry, so
//! the next delivery spawns a fresh actor that replays the stream.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use dup_types::{
    triggers::{SimpleTriggerConfig, TriggerTarget},
    DeviceId, Realm, BASE_BACKOFF_MS, RANDOM_BACKOFF_MS,
};
use utils::telemetry::{TrackerMetrics, UpdaterMetrics};

use crate::apis::vmq::VmqPlugin;
use crate::queries::Queries;
use crate::subsystems::events::{EventsPublisher, TriggersHandler};
use crate::subsystems::tracker::{
    spawn_message_tracker, Acknowledger, DeliveryTag, TrackerError, TrackerHandle,
};
use crate::subsystems::updater::{
    error::VolatileTriggerError, DataUpdater, UpdaterMessage,
};

const DEVICE_INBOX_SIZE: usize = 128;

/// Bookkeeping-only message id for RPC-injected work; skips every broker
/// interaction in the tracker.
fn injected_message_id() -> (Vec<u8>, DeliveryTag) {
    let id = Uuid::new_v4();
    (id.as_bytes().to_vec(), DeliveryTag::Injected(id))
}

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("device actor unavailable")]
    ActorUnavailable,
    #[error("no running actor for this device")]
    DeviceNotActive,
    #[error(transparent)]
    VolatileTrigger(#[from] VolatileTriggerError),
}

#[derive(Clone)]
struct DeviceEntry {
    tracker: TrackerHandle,
    inbox: mpsc::Sender<UpdaterMessage>,
}

pub struct Dispatcher<Q, P, V> {
    kill: broadcast::Sender<()>,
    queries: Arc<Q>,
    triggers_handler: Arc<TriggersHandler<P>>,
    vmq: Arc<V>,
    updater_metrics: UpdaterMetrics,
    tracker_metrics: TrackerMetrics,
    devices: Arc<DashMap<(Realm, DeviceId), DeviceEntry>>,
    tracker_backoff_ms: (u64, u64),
}

impl<Q, P, V> Dispatcher<Q, P, V>
where
    Q: Queries,
    P: EventsPublisher,
    V: VmqPlugin,
{
    pub fn new(
        kill: broadcast::Sender<()>,
        queries: Arc<Q>,
        triggers_handler: Arc<TriggersHandler<P>>,
        vmq: Arc<V>,
        updater_metrics: UpdaterMetrics,
        tracker_metrics: TrackerMetrics,
    ) -> Self {
        Self {
            kill,
            queries,
            triggers_handler,
            vmq,
            updater_metrics,
            tracker_metrics,
            devices: Arc::new(DashMap::new()),
            tracker_backoff_ms: (BASE_BACKOFF_MS, RANDOM_BACKOFF_MS),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_tracker_backoff(mut self, backoff_ms: (u64, u64)) -> Self {
        self.tracker_backoff_ms = backoff_ms;
        self
    }

    /// Routes one broker delivery: report it to the device's tracker, then
    /// post the work item to the actor's inbox.
    pub async fn dispatch<A: Acknowledger>(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        delivery_tag: u64,
        message: UpdaterMessage,
        make_acknowledger: impl FnOnce() -> A,
    ) -> Result<(), DispatcherError> {
        let entry = self.ensure_device(realm, device_id, make_acknowledger);
        entry
            .tracker
            .track_delivery(message.message_id().clone(), DeliveryTag::Broker(delivery_tag))?;
        entry
            .inbox
            .send(message)
            .await
            .map_err(|_| DispatcherError::ActorUnavailable)
    }

    /// Installs a runtime trigger on a live device actor, serialized with
    /// the in-flight messages through an injected message id.
    pub async fn install_volatile_trigger(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        trigger_id: Uuid,
        config: SimpleTriggerConfig,
        target: TriggerTarget,
    ) -> Result<(), DispatcherError> {
        let entry = self.live_entry(realm, device_id)?;
        let (message_id, injected_tag) = injected_message_id();
        entry.tracker.track_delivery(message_id.clone(), injected_tag)?;

        let (reply, rx) = oneshot::channel();
        entry
            .inbox
            .send(UpdaterMessage::InstallVolatileTrigger {
                trigger_id,
                config,
                target,
                message_id,
                reply,
            })
            .await
            .map_err(|_| DispatcherError::ActorUnavailable)?;
        rx.await
            .map_err(|_| DispatcherError::ActorUnavailable)?
            .map_err(DispatcherError::from)
    }

    pub async fn delete_volatile_trigger(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        trigger_id: Uuid,
    ) -> Result<(), DispatcherError> {
        let entry = self.live_entry(realm, device_id)?;
        let (message_id, injected_tag) = injected_message_id();
        entry.tracker.track_delivery(message_id.clone(), injected_tag)?;

        let (reply, rx) = oneshot::channel();
        entry
            .inbox
            .send(UpdaterMessage::DeleteVolatileTrigger {
                trigger_id,
                message_id,
                reply,
            })
            .await
            .map_err(|_| DispatcherError::ActorUnavailable)?;
        rx.await
            .map_err(|_| DispatcherError::ActorUnavailable)?
            .map_err(DispatcherError::from)
    }

    fn live_entry(&self, realm: &Realm, device_id: DeviceId) -> Result<DeviceEntry, DispatcherError> {
        let key = (realm.clone(), device_id);
        match self.devices.get(&key) {
            Some(entry) if !entry.inbox.is_closed() => Ok(entry.clone()),
            _ => Err(DispatcherError::DeviceNotActive),
        }
    }

    /// Looks up the device's entry, spawning the tracker and actor when
    /// missing — or just a fresh actor over the surviving tracker when a
    /// previous actor crashed.
    fn ensure_device<A: Acknowledger>(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        make_acknowledger: impl FnOnce() -> A,
    ) -> DeviceEntry {
        let key = (realm.clone(), device_id);

        let mut slot = self.devices.entry(key.clone()).or_insert_with(|| {
            let tracker = spawn_message_tracker(
                make_acknowledger(),
                self.tracker_metrics.clone(),
                self.tracker_backoff_ms,
            );
            let inbox = self.spawn_actor(key.clone(), tracker.clone());
            DeviceEntry { tracker, inbox }
        });

        if slot.inbox.is_closed() {
            // the previous actor died; the tracker survives and will hold
            // the new registration until its recovery pass completes
            let inbox = self.spawn_actor(key.clone(), slot.tracker.clone());
            slot.inbox = inbox;
        }

        slot.clone()
    }

    fn spawn_actor(
        &self,
        key: (Realm, DeviceId),
        tracker: TrackerHandle,
    ) -> mpsc::Sender<UpdaterMessage> {
        let (inbox_tx, inbox_rx) = mpsc::channel(DEVICE_INBOX_SIZE);

        let (realm, device_id) = key.clone();
        let queries = self.queries.clone();
        let triggers_handler = self.triggers_handler.clone();
        let vmq = self.vmq.clone();
        let metrics = self.updater_metrics.clone();
        let kill = self.kill.subscribe();
        let actor_tracker = tracker.clone();

        let actor = tokio::spawn(async move {
            let updater = DataUpdater::init(
                realm,
                device_id,
                queries,
                triggers_handler,
                vmq,
                actor_tracker,
                metrics,
            )
            .await?;
            updater.run(inbox_rx, kill).await
        });

        // the monitor: report the actor's death to the tracker and retire
        // the registry entry
        let devices = self.devices.clone();
        tokio::spawn(async move {
            let crashed = match actor.await {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    tracing::error!("device actor {}/{} failed: {}", key.0, key.1, err);
                    true
                }
                Err(join_err) => {
                    tracing::error!("device actor {}/{} aborted: {}", key.0, key.1, join_err);
                    true
                }
            };
            if crashed {
                let _ = tracker.caller_down();
            }
            devices.remove_if(&key, |_, entry| entry.inbox.is_closed());
        });

        inbox_tx
    }
}
