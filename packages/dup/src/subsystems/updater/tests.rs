use std::collections::HashMap;
use std::sync::Arc;

use bson::doc;
use uuid::Uuid;

use dup_types::{
    endpoint_id, interface_id,
    triggers::{
        DataTriggerEvent, DeviceTriggerEvent, IntrospectionTriggerEvent, SimpleTriggerConfig,
        SimpleTriggerRow, TriggerObject, TriggerTarget, ValueMatchOperator,
    },
    Aggregation, DeviceId, InterfaceType, Mapping, MappingType, Ownership, Realm, Reliability,
    Retention, StorageType, Timestamp,
};
use utils::telemetry::{EventsMetrics, TrackerMetrics, UpdaterMetrics};

use crate::apis::vmq::mock::{MockVmqPlugin, VmqCall};
use crate::payload::encode_properties_payload;
use crate::queries::mem::MemQueries;
use crate::queries::{Consistency, InterfaceRow, Queries};
use crate::subsystems::events::mock::{MockEventsPublisher, PublishedEvent};
use crate::subsystems::events::TriggersHandler;
use crate::subsystems::tracker::{
    mock::{AckOp, MockAcknowledger},
    spawn_message_tracker, DeliveryTag, TrackerHandle,
};

use super::{DataUpdater, UpdaterMessage};

const STREAM_INTERFACE: &str = "com.test.SimpleStreamTest";
const PROPERTIES_INTERFACE: &str = "com.test.LCDMonitor";
const SERVER_INTERFACE: &str = "org.astarte.ServerOwnedInterface";
const OBJECT_INTERFACE: &str = "com.test.ObjectStream";

fn realm() -> Realm {
    Realm::new("autotestrealm").unwrap()
}

fn device() -> DeviceId {
    DeviceId::new([0x42; 16])
}

fn target(n: u128) -> TriggerTarget {
    TriggerTarget {
        simple_trigger_id: Uuid::from_u128(n),
        parent_trigger_id: Uuid::from_u128(n + 1_000),
        routing_key: "trigger_engine".to_string(),
        static_headers: vec![],
    }
}

fn mapping(
    interface: &str,
    endpoint: &str,
    value_type: MappingType,
    reliability: Reliability,
    retention: Retention,
    allow_unset: bool,
    explicit_timestamp: bool,
) -> Mapping {
    Mapping {
        endpoint_id: endpoint_id(interface, 1, endpoint),
        interface_id: interface_id(interface, 1),
        endpoint: endpoint.to_string(),
        value_type,
        reliability,
        retention,
        allow_unset,
        explicit_timestamp,
    }
}

fn base_ts() -> Timestamp {
    // 1_539_350_173_280 ms plus a sub-millisecond remainder
    Timestamp::from_ticks(1_539_350_173_280 * 10_000 + 9_999)
}

struct Fixture {
    realm: Realm,
    device: DeviceId,
    queries: Arc<MemQueries>,
    publisher: MockEventsPublisher,
    vmq: MockVmqPlugin,
    acks: MockAcknowledger,
    tracker: TrackerHandle,
}

impl Fixture {
    fn new() -> Self {
        crate::init_tracing_tests();

        let queries = Arc::new(MemQueries::new());
        let realm = realm();
        let device = device();

        // the interfaces this test device can declare
        queries
            .seed_interface(
                &realm,
                InterfaceRow {
                    interface_id: interface_id(STREAM_INTERFACE, 1),
                    name: STREAM_INTERFACE.to_string(),
                    major_version: 1,
                    minor_version: 0,
                    interface_type: InterfaceType::Datastream,
                    aggregation: Aggregation::Individual,
                    ownership: Ownership::Device,
                    storage: "individual_datastreams".to_string(),
                    storage_type: StorageType::MultiInterfaceIndividualDatastreamDbtable,
                },
                vec![mapping(
                    STREAM_INTERFACE,
                    "/%{sensor}/value",
                    MappingType::Integer,
                    Reliability::Guaranteed,
                    Retention::Stored,
                    false,
                    true,
                )],
            )
            .unwrap();

        queries
            .seed_interface(
                &realm,
                InterfaceRow {
                    interface_id: interface_id(PROPERTIES_INTERFACE, 1),
                    name: PROPERTIES_INTERFACE.to_string(),
                    major_version: 1,
                    minor_version: 3,
                    interface_type: InterfaceType::Properties,
                    aggregation: Aggregation::Individual,
                    ownership: Ownership::Device,
                    storage: "individual_properties".to_string(),
                    storage_type: StorageType::MultiInterfaceIndividualPropertiesDbtable,
                },
                vec![
                    mapping(
                        PROPERTIES_INTERFACE,
                        "/time/to",
                        MappingType::Integer,
                        Reliability::Guaranteed,
                        Retention::Stored,
                        true,
                        false,
                    ),
                    mapping(
                        PROPERTIES_INTERFACE,
                        "/weekSchedule/%{day}/start",
                        MappingType::Integer,
                        Reliability::Guaranteed,
                        Retention::Stored,
                        true,
                        false,
                    ),
                ],
            )
            .unwrap();

        queries
            .seed_interface(
                &realm,
                InterfaceRow {
                    interface_id: interface_id(SERVER_INTERFACE, 1),
                    name: SERVER_INTERFACE.to_string(),
                    major_version: 1,
                    minor_version: 0,
                    interface_type: InterfaceType::Properties,
                    aggregation: Aggregation::Individual,
                    ownership: Ownership::Server,
                    storage: "individual_properties".to_string(),
                    storage_type: StorageType::MultiInterfaceIndividualPropertiesDbtable,
                },
                vec![mapping(
                    SERVER_INTERFACE,
                    "/p",
                    MappingType::Integer,
                    Reliability::Guaranteed,
                    Retention::Stored,
                    true,
                    false,
                )],
            )
            .unwrap();

        queries
            .seed_interface(
                &realm,
                InterfaceRow {
                    interface_id: interface_id(OBJECT_INTERFACE, 1),
                    name: OBJECT_INTERFACE.to_string(),
                    major_version: 1,
                    minor_version: 0,
                    interface_type: InterfaceType::Datastream,
                    aggregation: Aggregation::Object,
                    ownership: Ownership::Device,
                    storage: "com_test_objectstream_v1".to_string(),
                    storage_type: StorageType::OneObjectDatastreamDbtable,
                },
                vec![
                    mapping(
                        OBJECT_INTERFACE,
                        "/x",
                        MappingType::Double,
                        Reliability::Unreliable,
                        Retention::Discard,
                        false,
                        true,
                    ),
                    mapping(
                        OBJECT_INTERFACE,
                        "/y",
                        MappingType::Double,
                        Reliability::Unreliable,
                        Retention::Discard,
                        false,
                        true,
                    ),
                ],
            )
            .unwrap();

        queries
            .seed_device(
                &realm,
                device,
                HashMap::from([
                    (STREAM_INTERFACE.to_string(), 1),
                    (PROPERTIES_INTERFACE.to_string(), 1),
                    (SERVER_INTERFACE.to_string(), 1),
                    (OBJECT_INTERFACE.to_string(), 1),
                ]),
                HashMap::from([
                    (STREAM_INTERFACE.to_string(), 0),
                    (PROPERTIES_INTERFACE.to_string(), 3),
                    (SERVER_INTERFACE.to_string(), 0),
                    (OBJECT_INTERFACE.to_string(), 0),
                ]),
            )
            .unwrap();

        // an any-interface incoming-data trigger plus the lifecycle ones
        queries
            .seed_simple_trigger(
                &realm,
                TriggerObject::AnyInterface,
                SimpleTriggerRow {
                    config: SimpleTriggerConfig::Data {
                        on: DataTriggerEvent::IncomingData,
                        interface_name: "*".to_string(),
                        interface_major: 1,
                        match_path: "/*".to_string(),
                        value_match_operator: ValueMatchOperator::Any,
                        known_value: None,
                    },
                    target: target(1),
                },
            )
            .unwrap();
        queries
            .seed_simple_trigger(
                &realm,
                TriggerObject::Device(device),
                SimpleTriggerRow {
                    config: SimpleTriggerConfig::Device {
                        on: DeviceTriggerEvent::Connected,
                    },
                    target: target(2),
                },
            )
            .unwrap();
        queries
            .seed_simple_trigger(
                &realm,
                TriggerObject::AnyDevice,
                SimpleTriggerRow {
                    config: SimpleTriggerConfig::Device {
                        on: DeviceTriggerEvent::Disconnected,
                    },
                    target: target(3),
                },
            )
            .unwrap();
        queries
            .seed_simple_trigger(
                &realm,
                TriggerObject::AnyInterface,
                SimpleTriggerRow {
                    config: SimpleTriggerConfig::Introspection {
                        on: IntrospectionTriggerEvent::InterfaceAdded,
                        interface_name: None,
                    },
                    target: target(4),
                },
            )
            .unwrap();
        queries
            .seed_simple_trigger(
                &realm,
                TriggerObject::AnyInterface,
                SimpleTriggerRow {
                    config: SimpleTriggerConfig::Introspection {
                        on: IntrospectionTriggerEvent::InterfaceRemoved,
                        interface_name: None,
                    },
                    target: target(5),
                },
            )
            .unwrap();
        // a path-removed trigger scoped to the properties interface
        queries
            .seed_simple_trigger(
                &realm,
                TriggerObject::Interface(interface_id(PROPERTIES_INTERFACE, 1)),
                SimpleTriggerRow {
                    config: SimpleTriggerConfig::Data {
                        on: DataTriggerEvent::PathRemoved,
                        interface_name: PROPERTIES_INTERFACE.to_string(),
                        interface_major: 1,
                        match_path: "/*".to_string(),
                        value_match_operator: ValueMatchOperator::Any,
                        known_value: None,
                    },
                    target: target(6),
                },
            )
            .unwrap();

        let acks = MockAcknowledger::new();
        let tracker = spawn_message_tracker(
            acks.clone(),
            TrackerMetrics::init(&opentelemetry::global::meter("updater-tests")),
            (0, 0),
        );

        Self {
            realm,
            device,
            queries,
            publisher: MockEventsPublisher::new(),
            vmq: MockVmqPlugin::new(),
            acks,
            tracker,
        }
    }

    async fn updater(&self) -> DataUpdater<MemQueries, MockEventsPublisher, MockVmqPlugin> {
        let updater = DataUpdater::init(
            self.realm.clone(),
            self.device,
            self.queries.clone(),
            Arc::new(TriggersHandler::new(
                self.publisher.clone(),
                EventsMetrics::init(&opentelemetry::global::meter("updater-tests")),
            )),
            Arc::new(self.vmq.clone()),
            self.tracker.clone(),
            UpdaterMetrics::init(&opentelemetry::global::meter("updater-tests")),
        )
        .await
        .unwrap();
        self.tracker.register().await.unwrap();
        updater
    }

    async fn deliver(
        &self,
        updater: &mut DataUpdater<MemQueries, MockEventsPublisher, MockVmqPlugin>,
        tag: u64,
        message: UpdaterMessage,
    ) {
        self.tracker
            .track_delivery(message.message_id().clone(), DeliveryTag::Broker(tag))
            .unwrap();
        updater.handle_message(message).await.unwrap();
    }

    fn events_of_type(&self, event_type: &str) -> Vec<PublishedEvent> {
        self.publisher
            .published()
            .into_iter()
            .filter(|e| e.header("x_astarte_event_type") == Some(event_type))
            .collect()
    }
}

fn mid(n: u8) -> Vec<u8> {
    vec![n; 8]
}

fn data_message(interface: &str, path: &str, payload: Vec<u8>, n: u8, ts: Timestamp) -> UpdaterMessage {
    UpdaterMessage::Data {
        interface: interface.to_string(),
        path: path.to_string(),
        payload,
        message_id: mid(n),
        timestamp: ts,
    }
}

#[tokio::test]
async fn connection_and_disconnection_lifecycle() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let ts = base_ts();

    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Connection {
                ip: "10.0.23.4".to_string(),
                message_id: mid(1),
                timestamp: ts,
            },
        )
        .await;

    assert!(updater.connected);
    assert!(fixture
        .queries
        .device_registration(&fixture.realm, fixture.device)
        .connected);
    let connected = fixture.events_of_type("device_connected");
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].event.timestamp_ms, Some(ts.as_millis()));

    fixture
        .deliver(
            &mut updater,
            2,
            UpdaterMessage::Disconnection {
                message_id: mid(2),
                timestamp: ts,
            },
        )
        .await;

    assert!(!updater.connected);
    assert_eq!(fixture.events_of_type("device_disconnected").len(), 1);
    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1), AckOp::Ack(2)]);
}

#[tokio::test]
async fn datastream_insert_with_explicit_timestamp() {
    let fixture = Fixture::new();
    fixture
        .queries
        .seed_datastream_maximum_storage_retention(&fixture.realm, Some(604_800))
        .unwrap();
    let mut updater = fixture.updater().await;
    let ts = base_ts();

    let payload = bson::to_vec(&doc! {
        "v": 42i32,
        "t": bson::DateTime::from_millis(1_000),
    })
    .unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(STREAM_INTERFACE, "/foobar/value", payload, 1, ts),
        )
        .await;

    let samples = fixture.queries.datastream_samples(
        &fixture.realm,
        fixture.device,
        interface_id(STREAM_INTERFACE, 1),
        endpoint_id(STREAM_INTERFACE, 1, "/%{sensor}/value"),
        "/foobar/value",
    );
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value_timestamp_ms, 1_000);
    assert_eq!(samples[0].reception_timestamp_ms, ts.as_millis());
    assert_eq!(samples[0].reception_timestamp_submillis, ts.sub_millis());
    assert_eq!(samples[0].value, bson::Bson::Int32(42));
    assert_eq!(samples[0].ttl_seconds, Some(604_800));

    // the incoming_data event carries the explicit value timestamp
    let incoming = fixture.events_of_type("incoming_data");
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].event.timestamp_ms, Some(1_000));

    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1)]);
}

#[tokio::test]
async fn second_sample_reuses_the_cached_path() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let ts = base_ts();

    for n in 1..=2u8 {
        let payload = bson::to_vec(&doc! { "v": i32::from(n) }).unwrap();
        fixture
            .deliver(
                &mut updater,
                u64::from(n),
                data_message(STREAM_INTERFACE, "/foobar/value", payload, n, ts),
            )
            .await;
    }

    let samples = fixture.queries.datastream_samples(
        &fixture.realm,
        fixture.device,
        interface_id(STREAM_INTERFACE, 1),
        endpoint_id(STREAM_INTERFACE, 1, "/%{sensor}/value"),
        "/foobar/value",
    );
    assert_eq!(samples.len(), 2);
    assert!(updater.paths_cache.contains(STREAM_INTERFACE, "/foobar/value", ts));
    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1), AckOp::Ack(2)]);
}

#[tokio::test]
async fn server_owned_interface_is_rejected_with_clean_session() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;

    let payload = bson::to_vec(&doc! { "v": 1i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(SERVER_INTERFACE, "/p", payload, 1, base_ts()),
        )
        .await;

    // no write happened and the message was discarded, not acked
    assert_eq!(
        fixture.queries.property_value(
            &fixture.realm,
            fixture.device,
            interface_id(SERVER_INTERFACE, 1),
            "/p"
        ),
        None
    );
    assert_eq!(fixture.acks.ops(), vec![AckOp::Discard(1)]);

    // the device was asked for a clean session
    assert!(fixture
        .queries
        .device_registration(&fixture.realm, fixture.device)
        .pending_empty_cache);
    assert!(fixture.vmq.calls().iter().any(|call| matches!(
        call,
        VmqCall::Disconnect { discard_state: true, .. }
    )));
}

#[tokio::test]
async fn datastream_null_value_is_quietly_discarded() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;

    fixture
        .deliver(
            &mut updater,
            1,
            data_message(STREAM_INTERFACE, "/foobar/value", Vec::new(), 1, base_ts()),
        )
        .await;

    assert!(fixture
        .queries
        .datastream_samples(
            &fixture.realm,
            fixture.device,
            interface_id(STREAM_INTERFACE, 1),
            endpoint_id(STREAM_INTERFACE, 1, "/%{sensor}/value"),
            "/foobar/value",
        )
        .is_empty());
    assert_eq!(fixture.acks.ops(), vec![AckOp::Discard(1)]);
    // a null datastream is not a protocol violation: no clean session
    assert!(fixture.vmq.calls().is_empty());
}

#[tokio::test]
async fn mistyped_value_is_rejected() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;

    let payload = bson::to_vec(&doc! { "v": "a string" }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(STREAM_INTERFACE, "/foobar/value", payload, 1, base_ts()),
        )
        .await;

    assert_eq!(fixture.acks.ops(), vec![AckOp::Discard(1)]);
}

#[tokio::test]
async fn property_set_then_unset() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let ts = base_ts();

    let payload = bson::to_vec(&doc! { "v": 9i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(PROPERTIES_INTERFACE, "/time/to", payload, 1, ts),
        )
        .await;
    assert_eq!(
        fixture.queries.property_value(
            &fixture.realm,
            fixture.device,
            interface_id(PROPERTIES_INTERFACE, 1),
            "/time/to"
        ),
        Some(bson::Bson::Int32(9))
    );

    // unset: empty payload on a mapping with allow_unset
    fixture
        .deliver(
            &mut updater,
            2,
            data_message(PROPERTIES_INTERFACE, "/time/to", Vec::new(), 2, ts),
        )
        .await;
    assert_eq!(
        fixture.queries.property_value(
            &fixture.realm,
            fixture.device,
            interface_id(PROPERTIES_INTERFACE, 1),
            "/time/to"
        ),
        None
    );

    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1), AckOp::Ack(2)]);
}

#[tokio::test]
async fn object_datastream_maps_keys_to_columns() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let ts = base_ts();

    let payload = bson::to_vec(&doc! {
        "v": { "x": 0.5f64, "y": 1.5f64 },
        "t": bson::DateTime::from_millis(2_000),
    })
    .unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(OBJECT_INTERFACE, "/", payload, 1, ts),
        )
        .await;

    let samples = fixture.queries.object_samples(
        &fixture.realm,
        fixture.device,
        interface_id(OBJECT_INTERFACE, 1),
        "/",
    );
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].explicit_timestamp_ms, Some(2_000));
    let mut columns = samples[0].columns.clone();
    columns.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        columns,
        vec![
            ("x".to_string(), bson::Bson::Double(0.5)),
            ("y".to_string(), bson::Bson::Double(1.5)),
        ]
    );
    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1)]);
}

#[tokio::test]
async fn object_with_unknown_key_is_rejected() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;

    let payload = bson::to_vec(&doc! { "v": { "x": 0.5f64, "intruder": 1.0f64 } }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(OBJECT_INTERFACE, "/", payload, 1, base_ts()),
        )
        .await;

    assert!(fixture
        .queries
        .object_samples(
            &fixture.realm,
            fixture.device,
            interface_id(OBJECT_INTERFACE, 1),
            "/",
        )
        .is_empty());
    assert_eq!(fixture.acks.ops(), vec![AckOp::Discard(1)]);
}

#[tokio::test]
async fn introspection_diff_updates_everything() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let ts = base_ts();

    // warm a paths-cache entry so we can observe the reset
    updater.paths_cache.insert(STREAM_INTERFACE, "/foobar/value", None);

    // the device drops the stream and object interfaces and adds a new one
    let payload = format!(
        "{}:1:4;{}:1:0;org.test.Fresh:2:1",
        PROPERTIES_INTERFACE, SERVER_INTERFACE
    );
    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Introspection {
                payload: payload.into_bytes(),
                message_id: mid(1),
                timestamp: ts,
            },
        )
        .await;

    let added = fixture.events_of_type("interface_added");
    assert_eq!(added.len(), 1);
    let removed = fixture.events_of_type("interface_removed");
    assert_eq!(removed.len(), 2);

    assert_eq!(
        updater.introspection.get("org.test.Fresh").copied(),
        Some(2)
    );
    assert!(!updater.introspection.contains_key(STREAM_INTERFACE));
    assert!(updater.paths_cache.is_empty());

    let registration = fixture
        .queries
        .device_registration(&fixture.realm, fixture.device);
    assert_eq!(registration.introspection.len(), 3);
    assert_eq!(
        registration
            .old_introspection
            .get(&(STREAM_INTERFACE.to_string(), 1))
            .copied(),
        Some(0)
    );
    assert_eq!(
        registration
            .old_introspection
            .get(&(OBJECT_INTERFACE.to_string(), 1))
            .copied(),
        Some(0)
    );

    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1)]);
}

#[tokio::test]
async fn introspection_minor_update_fires_trigger() {
    let fixture = Fixture::new();
    fixture
        .queries
        .seed_simple_trigger(
            &fixture.realm,
            TriggerObject::AnyInterface,
            SimpleTriggerRow {
                config: SimpleTriggerConfig::Introspection {
                    on: IntrospectionTriggerEvent::InterfaceMinorUpdated,
                    interface_name: None,
                },
                target: target(7),
            },
        )
        .unwrap();
    let mut updater = fixture.updater().await;

    // same majors, the properties interface bumps its minor from 3 to 4
    let payload = format!(
        "{}:1:0;{}:1:4;{}:1:0;{}:1:0",
        STREAM_INTERFACE, PROPERTIES_INTERFACE, SERVER_INTERFACE, OBJECT_INTERFACE
    );
    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Introspection {
                payload: payload.into_bytes(),
                message_id: mid(1),
                timestamp: base_ts(),
            },
        )
        .await;

    let events = fixture.events_of_type("interface_minor_updated");
    assert_eq!(events.len(), 1);
    assert!(fixture.events_of_type("interface_added").is_empty());
    assert!(fixture.events_of_type("interface_removed").is_empty());
}

#[tokio::test]
async fn invalid_introspection_is_discarded() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;

    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Introspection {
                payload: b"0bad:name".to_vec(),
                message_id: mid(1),
                timestamp: base_ts(),
            },
        )
        .await;

    assert_eq!(fixture.acks.ops(), vec![AckOp::Discard(1)]);
    // introspection unchanged
    assert!(updater.introspection.contains_key(STREAM_INTERFACE));
}

#[tokio::test]
async fn producer_properties_prunes_unlisted_paths() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let iface = interface_id(PROPERTIES_INTERFACE, 1);

    for (endpoint, path, value) in [
        ("/time/to", "/time/to", 10i32),
        ("/weekSchedule/%{day}/start", "/weekSchedule/2/start", 8),
    ] {
        fixture
            .queries
            .insert_property(
                &fixture.realm,
                "individual_properties",
                fixture.device,
                iface,
                endpoint_id(PROPERTIES_INTERFACE, 1, endpoint),
                path,
                0,
                &bson::Bson::Int32(value),
                Consistency::Quorum,
            )
            .await
            .unwrap();
    }

    // the device only still holds /time/to
    let payload =
        encode_properties_payload(&[format!("{}{}", PROPERTIES_INTERFACE, "/time/to")]);
    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Control {
                path: "/producer/properties".to_string(),
                payload,
                message_id: mid(1),
                timestamp: base_ts(),
            },
        )
        .await;

    assert_eq!(
        fixture
            .queries
            .property_value(&fixture.realm, fixture.device, iface, "/time/to"),
        Some(bson::Bson::Int32(10))
    );
    assert_eq!(
        fixture
            .queries
            .property_value(&fixture.realm, fixture.device, iface, "/weekSchedule/2/start"),
        None
    );

    let removed = fixture.events_of_type("path_removed");
    assert_eq!(removed.len(), 1);
    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1)]);
}

#[tokio::test]
async fn producer_properties_zero_payload_prunes_everything() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let iface = interface_id(PROPERTIES_INTERFACE, 1);

    fixture
        .queries
        .insert_property(
            &fixture.realm,
            "individual_properties",
            fixture.device,
            iface,
            endpoint_id(PROPERTIES_INTERFACE, 1, "/time/to"),
            "/time/to",
            0,
            &bson::Bson::Int32(10),
            Consistency::Quorum,
        )
        .await
        .unwrap();

    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Control {
                path: "/producer/properties".to_string(),
                payload: vec![0, 0, 0, 0],
                message_id: mid(1),
                timestamp: base_ts(),
            },
        )
        .await;

    assert_eq!(
        fixture
            .queries
            .property_value(&fixture.realm, fixture.device, iface, "/time/to"),
        None
    );
}

#[tokio::test]
async fn empty_cache_resends_server_owned_properties() {
    let fixture = Fixture::new();
    fixture
        .queries
        .set_pending_empty_cache(&fixture.realm, fixture.device, true)
        .await
        .unwrap();
    fixture
        .queries
        .insert_property(
            &fixture.realm,
            "individual_properties",
            fixture.device,
            interface_id(SERVER_INTERFACE, 1),
            endpoint_id(SERVER_INTERFACE, 1, "/p"),
            "/p",
            0,
            &bson::Bson::Int32(7),
            Consistency::Quorum,
        )
        .await
        .unwrap();
    let mut updater = fixture.updater().await;

    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Control {
                path: "/emptyCache".to_string(),
                payload: b"1".to_vec(),
                message_id: mid(1),
                timestamp: base_ts(),
            },
        )
        .await;

    let calls = fixture.vmq.calls();
    let device = fixture.device.encode();
    let value_topic = format!("autotestrealm/{}/{}/p", device, SERVER_INTERFACE);
    let control_topic = format!("autotestrealm/{}/control/consumer/properties", device);

    assert!(calls.iter().any(|call| matches!(
        call,
        VmqCall::Publish { topic, qos: 2, .. } if *topic == value_topic
    )));
    // the property list travels as a control message, at QoS 2 like the
    // values themselves
    let (control_payload, control_qos) = calls
        .iter()
        .find_map(|call| match call {
            VmqCall::Publish { topic, payload, qos } if *topic == control_topic => {
                Some((payload.clone(), *qos))
            }
            _ => None,
        })
        .expect("consumer properties control message");
    assert_eq!(
        control_payload,
        encode_properties_payload(&[format!("{}/p", SERVER_INTERFACE)])
    );
    assert_eq!(control_qos, 2);

    assert!(!fixture
        .queries
        .device_registration(&fixture.realm, fixture.device)
        .pending_empty_cache);
    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1)]);
}

#[tokio::test]
async fn empty_cache_without_server_properties_sends_the_empty_list() {
    let fixture = Fixture::new();
    fixture
        .queries
        .set_pending_empty_cache(&fixture.realm, fixture.device, true)
        .await
        .unwrap();
    let mut updater = fixture.updater().await;

    fixture
        .deliver(
            &mut updater,
            1,
            UpdaterMessage::Control {
                path: "/emptyCache".to_string(),
                payload: Vec::new(),
                message_id: mid(1),
                timestamp: base_ts(),
            },
        )
        .await;

    // nothing to resend, but the device still learns its consumer set is
    // empty: exactly one publish, the four-zero-bytes control frame
    let device = fixture.device.encode();
    let control_topic = format!("autotestrealm/{}/control/consumer/properties", device);
    let calls = fixture.vmq.calls();
    assert_eq!(
        calls,
        vec![VmqCall::Publish {
            topic: control_topic,
            payload: vec![0, 0, 0, 0],
            qos: 2,
        }]
    );

    assert!(!fixture
        .queries
        .device_registration(&fixture.realm, fixture.device)
        .pending_empty_cache);
    assert_eq!(fixture.acks.ops(), vec![AckOp::Ack(1)]);
}

#[tokio::test]
async fn volatile_trigger_lifecycle() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let ts = base_ts();
    let trigger_id = Uuid::from_u128(99);

    // install through an injected message, gated like everything else
    let injected = Uuid::from_u128(7);
    fixture
        .tracker
        .track_delivery(injected.as_bytes().to_vec(), DeliveryTag::Injected(injected))
        .unwrap();
    let (reply, rx) = tokio::sync::oneshot::channel();
    updater
        .handle_message(UpdaterMessage::InstallVolatileTrigger {
            trigger_id,
            config: SimpleTriggerConfig::Data {
                on: DataTriggerEvent::IncomingData,
                interface_name: STREAM_INTERFACE.to_string(),
                interface_major: 1,
                match_path: "/%{sensor}/value".to_string(),
                value_match_operator: ValueMatchOperator::GreaterThan,
                known_value: Some(bson::Bson::Int32(10)),
            },
            target: target(42),
            message_id: injected.as_bytes().to_vec(),
            reply,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    // a matching publish fires both the any-interface and volatile targets
    let payload = bson::to_vec(&doc! { "v": 42i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(STREAM_INTERFACE, "/foobar/value", payload, 1, ts),
        )
        .await;
    let incoming = fixture.events_of_type("incoming_data");
    assert_eq!(incoming.len(), 2);
    assert!(incoming.iter().any(|e| {
        e.header("x_astarte_simple_trigger_id") == Some(target(42).simple_trigger_id.to_string().as_str())
    }));

    // a value below the operator threshold only fires the stored trigger
    let payload = bson::to_vec(&doc! { "v": 3i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            2,
            data_message(STREAM_INTERFACE, "/foobar/value", payload, 2, ts),
        )
        .await;
    assert_eq!(fixture.events_of_type("incoming_data").len(), 3);

    // delete, then nothing volatile fires anymore
    let injected = Uuid::from_u128(8);
    fixture
        .tracker
        .track_delivery(injected.as_bytes().to_vec(), DeliveryTag::Injected(injected))
        .unwrap();
    let (reply, rx) = tokio::sync::oneshot::channel();
    updater
        .handle_message(UpdaterMessage::DeleteVolatileTrigger {
            trigger_id,
            message_id: injected.as_bytes().to_vec(),
            reply,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();
    assert!(updater.triggers.volatile.is_empty());

    let payload = bson::to_vec(&doc! { "v": 42i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            3,
            data_message(STREAM_INTERFACE, "/foobar/value", payload, 3, ts),
        )
        .await;
    let incoming = fixture.events_of_type("incoming_data");
    assert_eq!(incoming.len(), 4);
    assert!(incoming
        .last()
        .unwrap()
        .header("x_astarte_simple_trigger_id")
        != Some(target(42).simple_trigger_id.to_string().as_str()));
}

#[tokio::test]
async fn interface_cache_expires_on_lifespan() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;
    let ts = base_ts();

    let payload = bson::to_vec(&doc! { "v": 1i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(STREAM_INTERFACE, "/foobar/value", payload, 1, ts),
        )
        .await;
    assert!(updater.interfaces.contains_key(STREAM_INTERFACE));

    // eleven minutes later the cache entry has lapsed; a non-data message
    // purges without reloading
    let later = ts + dup_types::Duration::from_secs(11 * 60);
    fixture
        .deliver(
            &mut updater,
            2,
            UpdaterMessage::Disconnection {
                message_id: mid(2),
                timestamp: later,
            },
        )
        .await;
    assert!(!updater.interfaces.contains_key(STREAM_INTERFACE));
    assert!(updater.interfaces_by_expiry.is_empty());
}

#[tokio::test]
async fn unknown_interface_discards_with_clean_session() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;

    let payload = bson::to_vec(&doc! { "v": 1i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message("com.not.Declared", "/p", payload, 1, base_ts()),
        )
        .await;

    assert_eq!(fixture.acks.ops(), vec![AckOp::Discard(1)]);
    assert!(fixture
        .queries
        .device_registration(&fixture.realm, fixture.device)
        .pending_empty_cache);
}

#[tokio::test]
async fn double_slash_path_is_invalid() {
    let fixture = Fixture::new();
    let mut updater = fixture.updater().await;

    let payload = bson::to_vec(&doc! { "v": 1i32 }).unwrap();
    fixture
        .deliver(
            &mut updater,
            1,
            data_message(STREAM_INTERFACE, "/foobar//value", payload, 1, base_ts()),
        )
        .await;

    assert_eq!(fixture.acks.ops(), vec![AckOp::Discard(1)]);
}
