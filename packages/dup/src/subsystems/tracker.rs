//! Per-device linearizer between the broker consumer and the device actor.
//!
//! The consumer reports deliveries as it takes them off the queue; the
//! actor asks permission before processing each message and acks through
//! here. When the actor dies mid-flight, every unacked delivery is pushed
//! back to the broker, so the broker itself is the write-ahead log.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;
use uuid::Uuid;

use dup_types::{BASE_BACKOFF_MS, RANDOM_BACKOFF_MS};
use utils::telemetry::TrackerMetrics;

pub type MessageId = Vec<u8>;

/// A delivery tag as the tracker sees it. `Injected` messages exist only
/// for in-process bookkeeping and never touch the broker; `Requeued` marks
/// a broker tag that was already pushed back during crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTag {
    Broker(u64),
    Injected(Uuid),
    Requeued(u64),
}

impl DeliveryTag {
    fn is_requeued(&self) -> bool {
        matches!(self, DeliveryTag::Requeued(_))
    }
}

#[derive(Error, Debug)]
pub enum AckError {
    #[error("broker channel error: {0}")]
    Channel(String),
}

/// The consumer side of the tracker: the owner of the broker channel the
/// deliveries came in on.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AckError>;
    async fn discard(&self, delivery_tag: u64) -> Result<(), AckError>;
    async fn requeue(&self, delivery_tag: u64) -> Result<(), AckError>;
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("message tracker channel closed")]
    Closed,
    #[error("operation on a message that is not the queue head")]
    NotQueueHead,
    #[error("untracked message id")]
    UntrackedMessage,
    #[error(transparent)]
    Ack(#[from] AckError),
}

enum TrackerState {
    New,
    Accepting,
    WaitingDelivery {
        reply: oneshot::Sender<bool>,
        message_id: MessageId,
    },
    WaitingCleanup {
        reply: oneshot::Sender<()>,
    },
}

/// The tracker state machine. Deferred replies (the GenServer `:noreply`
/// cases) are oneshot senders parked inside the state variant.
pub struct MessageTracker<A> {
    state: TrackerState,
    queue: VecDeque<MessageId>,
    ids: HashMap<MessageId, DeliveryTag>,
    acknowledger: A,
    metrics: TrackerMetrics,
    backoff_ms: (u64, u64),
}

impl<A: Acknowledger> MessageTracker<A> {
    pub fn new(acknowledger: A, metrics: TrackerMetrics) -> Self {
        Self::with_backoff(acknowledger, metrics, (BASE_BACKOFF_MS, RANDOM_BACKOFF_MS))
    }

    pub fn with_backoff(acknowledger: A, metrics: TrackerMetrics, backoff_ms: (u64, u64)) -> Self {
        Self {
            state: TrackerState::New,
            queue: VecDeque::new(),
            ids: HashMap::new(),
            acknowledger,
            metrics,
            backoff_ms,
        }
    }

    /// A (re)starting data updater announces itself. While a crash
    /// recovery is still in progress the reply is parked until the
    /// requeue pass finishes.
    pub fn register_data_updater(&mut self, reply: oneshot::Sender<()>) {
        match self.state {
            TrackerState::New => {
                self.state = TrackerState::Accepting;
                let _ = reply.send(());
            }
            _ => {
                self.state = TrackerState::WaitingCleanup { reply };
            }
        }
    }

    pub fn track_delivery(&mut self, message_id: MessageId, delivery_tag: DeliveryTag) {
        match self.ids.get_mut(&message_id) {
            Some(existing) if existing.is_requeued() => {
                // broker redelivery of a requeued message: refresh the tag,
                // keep the queue position
                *existing = delivery_tag;
            }
            Some(_) => {
                // duplicate track of an in-flight delivery
                return;
            }
            None => {
                self.queue.push_back(message_id.clone());
                self.ids.insert(message_id.clone(), delivery_tag);
            }
        }

        // wake a parked updater if this was the delivery it asked about
        let should_wake = match &self.state {
            TrackerState::WaitingDelivery {
                message_id: waiting,
                ..
            } => {
                *waiting == message_id
                    && self.queue.front() == Some(waiting)
                    && self
                        .ids
                        .get(waiting)
                        .map(|tag| !tag.is_requeued())
                        .unwrap_or(false)
            }
            _ => false,
        };
        if should_wake {
            if let TrackerState::WaitingDelivery { reply, .. } =
                std::mem::replace(&mut self.state, TrackerState::Accepting)
            {
                let _ = reply.send(true);
            }
        }
    }

    pub fn can_process_message(&mut self, message_id: MessageId, reply: oneshot::Sender<bool>) {
        match self.queue.front() {
            Some(head) if *head == message_id => match self.ids.get(&message_id) {
                Some(tag) if !tag.is_requeued() => {
                    let _ = reply.send(true);
                }
                // the delivery was requeued (or lost): park until the
                // broker hands it back
                _ => {
                    self.state = TrackerState::WaitingDelivery { reply, message_id };
                }
            },
            Some(_) => {
                let _ = reply.send(false);
            }
            // the updater saw the message before the consumer tracked it
            None => {
                self.state = TrackerState::WaitingDelivery { reply, message_id };
            }
        }
    }

    pub async fn ack_delivery(&mut self, message_id: MessageId) -> Result<(), TrackerError> {
        let tag = self.pop_head(&message_id)?;
        if let DeliveryTag::Broker(tag) = tag {
            self.acknowledger.ack(tag).await?;
            self.metrics.total_acked_messages.add(1, &[]);
        }
        Ok(())
    }

    pub async fn discard(&mut self, message_id: MessageId) -> Result<(), TrackerError> {
        let tag = self.pop_head(&message_id)?;
        if let DeliveryTag::Broker(tag) = tag {
            self.acknowledger.discard(tag).await?;
        }
        Ok(())
    }

    fn pop_head(&mut self, message_id: &MessageId) -> Result<DeliveryTag, TrackerError> {
        if self.queue.front() != Some(message_id) {
            return Err(TrackerError::NotQueueHead);
        }
        self.queue.pop_front();
        self.ids
            .remove(message_id)
            .ok_or(TrackerError::UntrackedMessage)
    }

    /// The monitored data updater died. Push every unacked broker
    /// delivery back to the queue, then either serve the registration
    /// that is already waiting or go back to `New`.
    #[instrument(skip(self), fields(subsys = "MessageTracker"))]
    pub async fn caller_down(&mut self) {
        let mut requeued = 0u64;
        for message_id in &self.queue {
            let Some(tag) = self.ids.get_mut(message_id) else {
                continue;
            };
            if let DeliveryTag::Broker(broker_tag) = *tag {
                if let Err(err) = self.acknowledger.requeue(broker_tag).await {
                    tracing::warn!("failed to requeue delivery {}: {}", broker_tag, err);
                }
                *tag = DeliveryTag::Requeued(broker_tag);
                requeued += 1;
            }
        }
        if requeued > 0 {
            self.metrics.total_requeued_messages.add(requeued, &[]);
        }

        if !self.queue.is_empty() {
            let (base, random) = self.backoff_ms;
            let jitter = if random > 0 {
                rand::rng().random_range(0..=random)
            } else {
                0
            };
            tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
        }

        match std::mem::replace(&mut self.state, TrackerState::New) {
            TrackerState::WaitingCleanup { reply } => {
                self.state = TrackerState::Accepting;
                let _ = reply.send(());
            }
            _ => {
                self.state = TrackerState::New;
            }
        }
    }
}

pub enum TrackerCommand {
    Register {
        reply: oneshot::Sender<()>,
    },
    TrackDelivery {
        message_id: MessageId,
        delivery_tag: DeliveryTag,
    },
    CanProcess {
        message_id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Ack {
        message_id: MessageId,
        reply: oneshot::Sender<Result<(), TrackerError>>,
    },
    Discard {
        message_id: MessageId,
        reply: oneshot::Sender<Result<(), TrackerError>>,
    },
    CallerDown,
}

/// Cloneable handle to a spawned tracker task.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<TrackerCommand>,
}

impl TrackerHandle {
    pub async fn register(&self) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerCommand::Register { reply })
            .map_err(|_| TrackerError::Closed)?;
        rx.await.map_err(|_| TrackerError::Closed)
    }

    pub fn track_delivery(
        &self,
        message_id: MessageId,
        delivery_tag: DeliveryTag,
    ) -> Result<(), TrackerError> {
        self.tx
            .send(TrackerCommand::TrackDelivery {
                message_id,
                delivery_tag,
            })
            .map_err(|_| TrackerError::Closed)
    }

    pub async fn can_process(&self, message_id: MessageId) -> Result<bool, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerCommand::CanProcess { message_id, reply })
            .map_err(|_| TrackerError::Closed)?;
        rx.await.map_err(|_| TrackerError::Closed)
    }

    pub async fn ack(&self, message_id: MessageId) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerCommand::Ack { message_id, reply })
            .map_err(|_| TrackerError::Closed)?;
        rx.await.map_err(|_| TrackerError::Closed)?
    }

    pub async fn discard(&self, message_id: MessageId) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerCommand::Discard { message_id, reply })
            .map_err(|_| TrackerError::Closed)?;
        rx.await.map_err(|_| TrackerError::Closed)?
    }

    pub fn caller_down(&self) -> Result<(), TrackerError> {
        self.tx
            .send(TrackerCommand::CallerDown)
            .map_err(|_| TrackerError::Closed)
    }
}

/// Spawns the task owning one device's tracker and returns its handle.
pub fn spawn_message_tracker<A: Acknowledger>(
    acknowledger: A,
    metrics: TrackerMetrics,
    backoff_ms: (u64, u64),
) -> TrackerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tracker = MessageTracker::with_backoff(acknowledger, metrics, backoff_ms);

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                TrackerCommand::Register { reply } => tracker.register_data_updater(reply),
                TrackerCommand::TrackDelivery {
                    message_id,
                    delivery_tag,
                } => tracker.track_delivery(message_id, delivery_tag),
                TrackerCommand::CanProcess { message_id, reply } => {
                    tracker.can_process_message(message_id, reply)
                }
                TrackerCommand::Ack { message_id, reply } => {
                    let _ = reply.send(tracker.ack_delivery(message_id).await);
                }
                TrackerCommand::Discard { message_id, reply } => {
                    let _ = reply.send(tracker.discard(message_id).await);
                }
                TrackerCommand::CallerDown => tracker.caller_down().await,
            }
        }
    });

    TrackerHandle { tx }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AckOp {
        Ack(u64),
        Discard(u64),
        Requeue(u64),
    }

    /// Records every broker call instead of talking to a channel.
    #[derive(Clone, Default)]
    pub struct MockAcknowledger {
        pub ops: Arc<Mutex<Vec<AckOp>>>,
    }

    impl MockAcknowledger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ops(&self) -> Vec<AckOp> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Acknowledger for MockAcknowledger {
        async fn ack(&self, delivery_tag: u64) -> Result<(), AckError> {
            self.ops.lock().unwrap().push(AckOp::Ack(delivery_tag));
            Ok(())
        }

        async fn discard(&self, delivery_tag: u64) -> Result<(), AckError> {
            self.ops.lock().unwrap().push(AckOp::Discard(delivery_tag));
            Ok(())
        }

        async fn requeue(&self, delivery_tag: u64) -> Result<(), AckError> {
            self.ops.lock().unwrap().push(AckOp::Requeue(delivery_tag));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{AckOp, MockAcknowledger};
    use super::*;

    fn test_metrics() -> TrackerMetrics {
        TrackerMetrics::init(&opentelemetry::global::meter("tracker-tests"))
    }

    fn tracker(acknowledger: MockAcknowledger) -> MessageTracker<MockAcknowledger> {
        MessageTracker::with_backoff(acknowledger, test_metrics(), (0, 0))
    }

    fn mid(n: u8) -> MessageId {
        vec![n; 4]
    }

    async fn registered(acknowledger: MockAcknowledger) -> MessageTracker<MockAcknowledger> {
        let mut t = tracker(acknowledger);
        let (reply, rx) = oneshot::channel();
        t.register_data_updater(reply);
        rx.await.unwrap();
        t
    }

    #[tokio::test]
    async fn ordering_gate() {
        let acks = MockAcknowledger::new();
        let mut t = registered(acks.clone()).await;

        t.track_delivery(mid(1), DeliveryTag::Broker(1));
        t.track_delivery(mid(2), DeliveryTag::Broker(2));

        let (reply, rx) = oneshot::channel();
        t.can_process_message(mid(1), reply);
        assert!(rx.await.unwrap());

        // head is still m1
        let (reply, rx) = oneshot::channel();
        t.can_process_message(mid(2), reply);
        assert!(!rx.await.unwrap());

        t.ack_delivery(mid(1)).await.unwrap();
        assert_eq!(acks.ops(), vec![AckOp::Ack(1)]);

        let (reply, rx) = oneshot::channel();
        t.can_process_message(mid(2), reply);
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn crash_requeues_everything_once() {
        let acks = MockAcknowledger::new();
        let mut t = registered(acks.clone()).await;

        t.track_delivery(mid(1), DeliveryTag::Broker(1));
        t.track_delivery(mid(2), DeliveryTag::Broker(2));

        t.caller_down().await;
        assert_eq!(acks.ops(), vec![AckOp::Requeue(1), AckOp::Requeue(2)]);

        // a second crash must not requeue the already-requeued tags
        t.caller_down().await;
        assert_eq!(acks.ops(), vec![AckOp::Requeue(1), AckOp::Requeue(2)]);
    }

    #[tokio::test]
    async fn recovery_defers_processing_until_redelivery() {
        let acks = MockAcknowledger::new();
        let mut t = registered(acks.clone()).await;

        t.track_delivery(mid(1), DeliveryTag::Broker(1));
        t.caller_down().await;

        // a fresh updater registers; the old state was New after recovery
        let (reply, rx) = oneshot::channel();
        t.register_data_updater(reply);
        rx.await.unwrap();

        // the tag is still marked requeued, so processing parks
        let (reply, mut rx) = oneshot::channel();
        t.can_process_message(mid(1), reply);
        assert!(rx.try_recv().is_err());

        // the broker redelivers with a fresh tag, which wakes the updater
        t.track_delivery(mid(1), DeliveryTag::Broker(33));
        assert!(rx.await.unwrap());

        t.ack_delivery(mid(1)).await.unwrap();
        assert_eq!(
            acks.ops(),
            vec![AckOp::Requeue(1), AckOp::Ack(33)]
        );
    }

    #[tokio::test]
    async fn registration_during_recovery_waits_for_cleanup() {
        let acks = MockAcknowledger::new();
        let mut t = registered(acks.clone()).await;

        t.track_delivery(mid(1), DeliveryTag::Broker(1));

        // the replacement actor registers before the crash is handled
        let (reply, mut rx) = oneshot::channel();
        t.register_data_updater(reply);
        assert!(rx.try_recv().is_err());

        t.caller_down().await;
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn early_can_process_waits_for_track() {
        let acks = MockAcknowledger::new();
        let mut t = registered(acks.clone()).await;

        let (reply, mut rx) = oneshot::channel();
        t.can_process_message(mid(9), reply);
        assert!(rx.try_recv().is_err());

        t.track_delivery(mid(9), DeliveryTag::Broker(5));
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn injected_messages_skip_the_broker() {
        let acks = MockAcknowledger::new();
        let mut t = registered(acks.clone()).await;

        let injected = DeliveryTag::Injected(Uuid::from_u128(1));
        t.track_delivery(mid(3), injected);

        let (reply, rx) = oneshot::channel();
        t.can_process_message(mid(3), reply);
        assert!(rx.await.unwrap());

        t.ack_delivery(mid(3)).await.unwrap();

        // crash with an injected message in flight: nothing to requeue
        t.track_delivery(mid(4), injected);
        t.caller_down().await;
        assert!(acks.ops().is_empty());
    }

    #[tokio::test]
    async fn ack_requires_queue_head() {
        let acks = MockAcknowledger::new();
        let mut t = registered(acks.clone()).await;

        t.track_delivery(mid(1), DeliveryTag::Broker(1));
        t.track_delivery(mid(2), DeliveryTag::Broker(2));

        assert!(matches!(
            t.ack_delivery(mid(2)).await,
            Err(TrackerError::NotQueueHead)
        ));
        assert!(acks.ops().is_empty());
    }

    #[tokio::test]
    async fn handle_round_trip() {
        let acks = MockAcknowledger::new();
        let handle = spawn_message_tracker(acks.clone(), test_metrics(), (0, 0));

        handle.register().await.unwrap();
        handle
            .track_delivery(mid(1), DeliveryTag::Broker(7))
            .unwrap();
        assert!(handle.can_process(mid(1)).await.unwrap());
        handle.ack(mid(1)).await.unwrap();
        assert_eq!(acks.ops(), vec![AckOp::Ack(7)]);
    }
}
