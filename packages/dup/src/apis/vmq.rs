//! The device-side channel: an opaque RPC into the broker plugin that owns
//! the MQTT sessions. The plant only ever publishes towards a device or
//! asks for a session teardown.

use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties, Channel};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmqError {
    #[error("vmq rpc failed: {0}")]
    Rpc(String),
}

#[async_trait]
pub trait VmqPlugin: Send + Sync + 'static {
    /// Publishes a payload on a device topic with the given QoS.
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), VmqError>;

    /// Disconnects a client; `discard_state` asks for a non-clean close so
    /// the session state is dropped.
    async fn disconnect(&self, client_id: &str, discard_state: bool) -> Result<(), VmqError>;
}

#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum VmqRpcCall<'a> {
    Publish {
        topic: &'a str,
        #[serde(with = "payload_b64")]
        payload: &'a [u8],
        qos: u8,
    },
    Disconnect {
        client_id: &'a str,
        discard_state: bool,
    },
}

mod payload_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }
}

/// Ships the calls to the plugin's RPC queue over the broker.
pub struct AmqpVmqPlugin {
    channel: Channel,
    rpc_queue: String,
}

impl AmqpVmqPlugin {
    pub fn new(channel: Channel, rpc_queue: String) -> Self {
        Self { channel, rpc_queue }
    }

    async fn call(&self, call: VmqRpcCall<'_>) -> Result<(), VmqError> {
        let payload = serde_json::to_vec(&call).map_err(|e| VmqError::Rpc(e.to_string()))?;
        self.channel
            .basic_publish(
                "",
                &self.rpc_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| VmqError::Rpc(e.to_string()))?
            .await
            .map_err(|e| VmqError::Rpc(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl VmqPlugin for AmqpVmqPlugin {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), VmqError> {
        self.call(VmqRpcCall::Publish {
            topic,
            payload,
            qos,
        })
        .await
    }

    async fn disconnect(&self, client_id: &str, discard_state: bool) -> Result<(), VmqError> {
        self.call(VmqRpcCall::Disconnect {
            client_id,
            discard_state,
        })
        .await
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum VmqCall {
        Publish {
            topic: String,
            payload: Vec<u8>,
            qos: u8,
        },
        Disconnect {
            client_id: String,
            discard_state: bool,
        },
    }

    #[derive(Clone, Default)]
    pub struct MockVmqPlugin {
        calls: Arc<Mutex<Vec<VmqCall>>>,
    }

    impl MockVmqPlugin {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<VmqCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VmqPlugin for MockVmqPlugin {
        async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), VmqError> {
            self.calls.lock().unwrap().push(VmqCall::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
            });
            Ok(())
        }

        async fn disconnect(&self, client_id: &str, discard_state: bool) -> Result<(), VmqError> {
            self.calls.lock().unwrap().push(VmqCall::Disconnect {
                client_id: client_id.to_string(),
                discard_state,
            });
            Ok(())
        }
    }
}
