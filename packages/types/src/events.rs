//! The typed events published to the outbound exchange. These are
//! hand-written prost messages; the wire format is the plant's event
//! protocol, so tags must stay stable.

use std::collections::HashMap;

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct SimpleEvent {
    #[prost(int32, tag = "1")]
    pub version: i32,
    #[prost(string, tag = "2")]
    pub realm: String,
    /// base64-url encoded device id.
    #[prost(string, tag = "3")]
    pub device_id: String,
    #[prost(string, optional, tag = "4")]
    pub parent_trigger_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub simple_trigger_id: Option<String>,
    /// Event time in milliseconds since the epoch, when the source
    /// carries one.
    #[prost(int64, optional, tag = "6")]
    pub timestamp_ms: Option<i64>,
    #[prost(
        oneof = "Event",
        tags = "7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20"
    )]
    pub event: Option<Event>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Event {
    #[prost(message, tag = "7")]
    DeviceConnected(DeviceConnectedEvent),
    #[prost(message, tag = "8")]
    DeviceDisconnected(DeviceDisconnectedEvent),
    #[prost(message, tag = "9")]
    IncomingData(IncomingDataEvent),
    #[prost(message, tag = "10")]
    ValueChange(ValueChangeEvent),
    #[prost(message, tag = "11")]
    ValueChangeApplied(ValueChangeAppliedEvent),
    #[prost(message, tag = "12")]
    PathCreated(PathCreatedEvent),
    #[prost(message, tag = "13")]
    PathRemoved(PathRemovedEvent),
    #[prost(message, tag = "14")]
    ValueStored(ValueStoredEvent),
    #[prost(message, tag = "15")]
    IncomingIntrospection(IncomingIntrospectionEvent),
    #[prost(message, tag = "16")]
    InterfaceAdded(InterfaceAddedEvent),
    #[prost(message, tag = "17")]
    InterfaceMinorUpdated(InterfaceMinorUpdatedEvent),
    #[prost(message, tag = "18")]
    InterfaceRemoved(InterfaceRemovedEvent),
    #[prost(message, tag = "19")]
    DeviceError(DeviceErrorEvent),
    #[prost(message, tag = "20")]
    DeviceEmptyCacheReceived(DeviceEmptyCacheReceivedEvent),
}

impl Event {
    /// The snake-case name carried in the `x_astarte_event_type` header.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::DeviceConnected(_) => "device_connected",
            Event::DeviceDisconnected(_) => "device_disconnected",
            Event::IncomingData(_) => "incoming_data",
            Event::ValueChange(_) => "value_change",
            Event::ValueChangeApplied(_) => "value_change_applied",
            Event::PathCreated(_) => "path_created",
            Event::PathRemoved(_) => "path_removed",
            Event::ValueStored(_) => "value_stored",
            Event::IncomingIntrospection(_) => "incoming_introspection",
            Event::InterfaceAdded(_) => "interface_added",
            Event::InterfaceMinorUpdated(_) => "interface_minor_updated",
            Event::InterfaceRemoved(_) => "interface_removed",
            Event::DeviceError(_) => "device_error",
            Event::DeviceEmptyCacheReceived(_) => "device_empty_cache_received",
        }
    }

    /// Whether this event originates from the data path; only those carry
    /// trigger-id headers.
    pub fn is_data_event(&self) -> bool {
        matches!(
            self,
            Event::IncomingData(_)
                | Event::ValueChange(_)
                | Event::ValueChangeApplied(_)
                | Event::PathCreated(_)
                | Event::PathRemoved(_)
                | Event::ValueStored(_)
        )
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceConnectedEvent {
    #[prost(string, tag = "1")]
    pub device_ip_address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceDisconnectedEvent {}

#[derive(Clone, PartialEq, Message)]
pub struct IncomingDataEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    /// BSON document `{v: <value>}`; empty on unset.
    #[prost(bytes = "vec", tag = "3")]
    pub bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueChangeEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub old_bson_value: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub new_bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueChangeAppliedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub old_bson_value: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub new_bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PathCreatedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PathRemovedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueStoredEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub bson_value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct IncomingIntrospectionEvent {
    #[prost(string, tag = "1")]
    pub introspection: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct InterfaceAddedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(int32, tag = "2")]
    pub major_version: i32,
    #[prost(int32, tag = "3")]
    pub minor_version: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct InterfaceMinorUpdatedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(int32, tag = "2")]
    pub major_version: i32,
    #[prost(int32, tag = "3")]
    pub old_minor_version: i32,
    #[prost(int32, tag = "4")]
    pub new_minor_version: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct InterfaceRemovedEvent {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(int32, tag = "2")]
    pub major_version: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceEmptyCacheReceivedEvent {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceErrorEvent {
    #[prost(string, tag = "1")]
    pub error_name: String,
    #[prost(map = "string, string", tag = "2")]
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let event = SimpleEvent {
            version: 1,
            realm: "test".to_string(),
            device_id: "9ZVtNWVxSY2bTXm3Tq6jtw".to_string(),
            parent_trigger_id: Some("d0f2cf38-e7e8-4a21-9bd7-7a7ef0fb9f82".to_string()),
            simple_trigger_id: Some("77a1f4a8-8ee6-4b4c-a276-938771292b1c".to_string()),
            timestamp_ms: Some(1_539_350_173_280),
            event: Some(Event::IncomingData(IncomingDataEvent {
                interface: "com.example.Sensors".to_string(),
                path: "/time/from".to_string(),
                bson_value: vec![0x0c, 0, 0, 0, 0x10, b'v', 0, 42, 0, 0, 0, 0],
            })),
        };

        let bytes = event.encode_to_vec();
        let decoded = SimpleEvent::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn event_type_names() {
        let connected = Event::DeviceConnected(DeviceConnectedEvent {
            device_ip_address: "10.0.0.1".to_string(),
        });
        assert_eq!(connected.type_name(), "device_connected");
        assert!(!connected.is_data_event());

        let stored = Event::ValueStored(ValueStoredEvent {
            interface: "com.X".to_string(),
            path: "/p".to_string(),
            bson_value: vec![],
        });
        assert_eq!(stored.type_name(), "value_stored");
        assert!(stored.is_data_event());
    }
}
