//! In-memory queries backend over the typed table store. Used by tests and
//! local single-node runs; TTLs are modeled as absolute expiries checked on
//! read.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bson::Bson;
use chrono::Utc;
use uuid::Uuid;

use dup_types::{
    triggers::{SimpleTriggerRow, TriggerObject},
    DeviceId, Mapping, Realm,
};
use utils::storage::db::{PlantDb, Table, TableHandle};

use super::{
    Consistency, DeviceRegistration, InterfaceRow, PathStatus, Queries, QueriesError,
    StoredProperty,
};

#[derive(Debug, Clone, Default)]
struct DeviceRow {
    connected: bool,
    last_connection_ms: Option<i64>,
    last_disconnection_ms: Option<i64>,
    last_seen_ip: Option<IpAddr>,
    total_received_msgs: i64,
    total_received_bytes: i64,
    introspection: HashMap<String, i32>,
    introspection_minor: HashMap<String, i32>,
    old_introspection: HashMap<(String, i32), i32>,
    pending_empty_cache: bool,
}

#[derive(Debug, Clone)]
struct PropertyRow {
    endpoint_id: Uuid,
    value: Option<Bson>,
    reception_timestamp_ms: i64,
    datetime_value_ms: Option<i64>,
    expires_at_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatastreamSample {
    pub value_timestamp_ms: i64,
    pub reception_timestamp_ms: i64,
    pub reception_timestamp_submillis: i64,
    pub value: Bson,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSample {
    pub explicit_timestamp_ms: Option<i64>,
    pub reception_timestamp_ms: i64,
    pub columns: Vec<(String, Bson)>,
    pub ttl_seconds: Option<i64>,
}

type DeviceKey = (String, DeviceId);
type PropertyKey = (String, DeviceId, Uuid, String);
type DatastreamKey = (String, DeviceId, Uuid, Uuid, String);
type ObjectKey = (String, DeviceId, Uuid, String);

const DEVICES: TableHandle<DeviceKey, DeviceRow> = TableHandle::new(Table::Devices);
const INTERFACES: TableHandle<(String, String, i32), InterfaceRow> =
    TableHandle::new(Table::Interfaces);
const ENDPOINTS: TableHandle<(String, Uuid), Vec<Mapping>> = TableHandle::new(Table::Endpoints);
const INDIVIDUAL_PROPERTIES: TableHandle<PropertyKey, PropertyRow> =
    TableHandle::new(Table::IndividualProperties);
const INDIVIDUAL_DATASTREAMS: TableHandle<DatastreamKey, Vec<DatastreamSample>> =
    TableHandle::new(Table::IndividualDatastreams);
const OBJECT_DATASTREAMS: TableHandle<ObjectKey, Vec<ObjectSample>> =
    TableHandle::new(Table::ObjectDatastreams);
const SIMPLE_TRIGGERS: TableHandle<(String, TriggerObject), Vec<SimpleTriggerRow>> =
    TableHandle::new(Table::SimpleTriggers);
const KV_STORE: TableHandle<(String, String, String), Vec<u8>> = TableHandle::new(Table::KvStore);

const REALM_CONFIG_GROUP: &str = "realm_config";
const RETENTION_KEY: &str = "datastream_maximum_storage_retention";

fn db_err(err: anyhow::Error) -> QueriesError {
    QueriesError::Database(err.to_string())
}

#[derive(Clone, Default)]
pub struct MemQueries {
    db: PlantDb,
}

impl MemQueries {
    pub fn new() -> Self {
        Self { db: PlantDb::new() }
    }

    fn realm_key(realm: &Realm) -> String {
        realm.as_str().to_string()
    }

    // Seeding helpers, used by tests and local bootstrap.

    pub fn seed_interface(
        &self,
        realm: &Realm,
        row: InterfaceRow,
        mappings: Vec<Mapping>,
    ) -> Result<(), QueriesError> {
        let realm = Self::realm_key(realm);
        self.db
            .set(&ENDPOINTS, (realm.clone(), row.interface_id), mappings)
            .map_err(db_err)?;
        self.db
            .set(
                &INTERFACES,
                (realm, row.name.clone(), row.major_version),
                row,
            )
            .map_err(db_err)
    }

    pub fn seed_device(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        introspection: HashMap<String, i32>,
        introspection_minor: HashMap<String, i32>,
    ) -> Result<(), QueriesError> {
        self.db
            .set(
                &DEVICES,
                (Self::realm_key(realm), device_id),
                DeviceRow {
                    introspection,
                    introspection_minor,
                    ..Default::default()
                },
            )
            .map_err(db_err)
    }

    pub fn seed_simple_trigger(
        &self,
        realm: &Realm,
        object: TriggerObject,
        row: SimpleTriggerRow,
    ) -> Result<(), QueriesError> {
        self.db
            .update(&SIMPLE_TRIGGERS, (Self::realm_key(realm), object), |rows| {
                rows.push(row)
            })
            .map_err(db_err)
    }

    pub fn seed_datastream_maximum_storage_retention(
        &self,
        realm: &Realm,
        retention_seconds: Option<i64>,
    ) -> Result<(), QueriesError> {
        let key = (
            Self::realm_key(realm),
            REALM_CONFIG_GROUP.to_string(),
            RETENTION_KEY.to_string(),
        );
        match retention_seconds {
            Some(secs) => self
                .db
                .set(&KV_STORE, key, secs.to_be_bytes().to_vec())
                .map_err(db_err),
            None => self.db.remove(&KV_STORE, &key).map(|_| ()).map_err(db_err),
        }
    }

    // Inspection helpers for tests.

    pub fn datastream_samples(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
    ) -> Vec<DatastreamSample> {
        self.db
            .get(
                &INDIVIDUAL_DATASTREAMS,
                &(
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    endpoint_id,
                    path.to_string(),
                ),
            )
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn object_samples(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        path: &str,
    ) -> Vec<ObjectSample> {
        self.db
            .get(
                &OBJECT_DATASTREAMS,
                &(
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    path.to_string(),
                ),
            )
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn property_value(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        path: &str,
    ) -> Option<Bson> {
        self.db
            .get(
                &INDIVIDUAL_PROPERTIES,
                &(
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    path.to_string(),
                ),
            )
            .ok()
            .flatten()
            .and_then(|row| row.value)
    }

    pub fn device_registration(&self, realm: &Realm, device_id: DeviceId) -> DeviceRegistration {
        self.db
            .get(&DEVICES, &(Self::realm_key(realm), device_id))
            .ok()
            .flatten()
            .map(|row| DeviceRegistration {
                connected: row.connected,
                introspection: row.introspection,
                introspection_minor: row.introspection_minor,
                old_introspection: row.old_introspection,
                pending_empty_cache: row.pending_empty_cache,
                total_received_msgs: row.total_received_msgs,
                total_received_bytes: row.total_received_bytes,
            })
            .unwrap_or_default()
    }

    pub fn device_registered_with_interface(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_name: &str,
        major_version: i32,
    ) -> bool {
        let key = (
            Self::realm_key(realm),
            format!("devices-by-interface-{}-v{}", interface_name, major_version),
            device_id.encode(),
        );
        self.db.contains_key(&KV_STORE, &key).unwrap_or(false)
    }

    fn with_device<F>(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        f: F,
    ) -> Result<(), QueriesError>
    where
        F: FnOnce(&mut DeviceRow),
    {
        self.db
            .update(&DEVICES, (Self::realm_key(realm), device_id), f)
            .map_err(db_err)
    }
}

#[async_trait]
impl Queries for MemQueries {
    async fn fetch_device_registration(
        &self,
        realm: &Realm,
        device_id: DeviceId,
    ) -> Result<DeviceRegistration, QueriesError> {
        Ok(self.device_registration(realm, device_id))
    }

    async fn set_device_connected(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        timestamp_ms: i64,
        ip: IpAddr,
    ) -> Result<(), QueriesError> {
        self.with_device(realm, device_id, |row| {
            row.connected = true;
            row.last_connection_ms = Some(timestamp_ms);
            row.last_seen_ip = Some(ip);
        })
    }

    async fn set_device_disconnected(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        timestamp_ms: i64,
        total_received_msgs: i64,
        total_received_bytes: i64,
    ) -> Result<(), QueriesError> {
        self.with_device(realm, device_id, |row| {
            row.connected = false;
            row.last_disconnection_ms = Some(timestamp_ms);
            row.total_received_msgs = total_received_msgs;
            row.total_received_bytes = total_received_bytes;
        })
    }

    async fn set_pending_empty_cache(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        pending: bool,
    ) -> Result<(), QueriesError> {
        self.with_device(realm, device_id, |row| {
            row.pending_empty_cache = pending;
        })
    }

    async fn update_device_introspection(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        introspection: &HashMap<String, i32>,
        introspection_minor: &HashMap<String, i32>,
        removed: &HashMap<(String, i32), i32>,
        readded: &[String],
    ) -> Result<(), QueriesError> {
        self.with_device(realm, device_id, |row| {
            row.introspection = introspection.clone();
            row.introspection_minor = introspection_minor.clone();
            for ((name, major), minor) in removed {
                row.old_introspection
                    .insert((name.clone(), *major), *minor);
            }
            row.old_introspection
                .retain(|(name, _), _| !readded.iter().any(|n| n == name));
        })
    }

    async fn fetch_interface_row(
        &self,
        realm: &Realm,
        name: &str,
        major_version: i32,
    ) -> Result<Option<InterfaceRow>, QueriesError> {
        self.db
            .get(
                &INTERFACES,
                &(Self::realm_key(realm), name.to_string(), major_version),
            )
            .map_err(db_err)
    }

    async fn fetch_interface_mappings(
        &self,
        realm: &Realm,
        interface_id: Uuid,
    ) -> Result<Vec<Mapping>, QueriesError> {
        Ok(self
            .db
            .get(&ENDPOINTS, &(Self::realm_key(realm), interface_id))
            .map_err(db_err)?
            .unwrap_or_default())
    }

    async fn insert_property(
        &self,
        realm: &Realm,
        _storage: &str,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        reception_timestamp_ms: i64,
        value: &Bson,
        _consistency: Consistency,
    ) -> Result<(), QueriesError> {
        self.db
            .set(
                &INDIVIDUAL_PROPERTIES,
                (
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    path.to_string(),
                ),
                PropertyRow {
                    endpoint_id,
                    value: Some(value.clone()),
                    reception_timestamp_ms,
                    datetime_value_ms: None,
                    expires_at_secs: None,
                },
            )
            .map_err(db_err)
    }

    async fn delete_property(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        _endpoint_id: Uuid,
        path: &str,
        _consistency: Consistency,
    ) -> Result<(), QueriesError> {
        self.db
            .remove(
                &INDIVIDUAL_PROPERTIES,
                &(
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    path.to_string(),
                ),
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn fetch_property_value(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        _endpoint_id: Uuid,
        path: &str,
    ) -> Result<Option<Bson>, QueriesError> {
        Ok(self.property_value(realm, device_id, interface_id, path))
    }

    async fn fetch_interface_properties(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
    ) -> Result<Vec<StoredProperty>, QueriesError> {
        let realm = Self::realm_key(realm);
        self.db
            .with_table_read(&INDIVIDUAL_PROPERTIES, |table| {
                let mut properties = Vec::new();
                for entry in table.iter() {
                    let ((row_realm, row_device, row_interface, path), row) = entry.pair();
                    if *row_realm == realm
                        && *row_device == device_id
                        && *row_interface == interface_id
                    {
                        if let Some(value) = &row.value {
                            properties.push(StoredProperty {
                                endpoint_id: row.endpoint_id,
                                path: path.clone(),
                                value: value.clone(),
                            });
                        }
                    }
                }
                properties.sort_by(|a, b| a.path.cmp(&b.path));
                Ok(properties)
            })
            .map_err(db_err)
    }

    async fn insert_datastream_value(
        &self,
        realm: &Realm,
        _storage: &str,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        value: &Bson,
        value_timestamp_ms: i64,
        reception_timestamp_ms: i64,
        reception_timestamp_submillis: i64,
        ttl_seconds: Option<i64>,
        _consistency: Consistency,
    ) -> Result<(), QueriesError> {
        let sample = DatastreamSample {
            value_timestamp_ms,
            reception_timestamp_ms,
            reception_timestamp_submillis,
            value: value.clone(),
            ttl_seconds,
        };
        self.db
            .update(
                &INDIVIDUAL_DATASTREAMS,
                (
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    endpoint_id,
                    path.to_string(),
                ),
                |samples| samples.push(sample),
            )
            .map_err(db_err)
    }

    async fn insert_object_datastream_value(
        &self,
        realm: &Realm,
        _storage: &str,
        device_id: DeviceId,
        interface_id: Uuid,
        path: &str,
        columns: &[(String, Bson)],
        explicit_timestamp_ms: Option<i64>,
        reception_timestamp_ms: i64,
        ttl_seconds: Option<i64>,
        _consistency: Consistency,
    ) -> Result<(), QueriesError> {
        let sample = ObjectSample {
            explicit_timestamp_ms,
            reception_timestamp_ms,
            columns: columns.to_vec(),
            ttl_seconds,
        };
        self.db
            .update(
                &OBJECT_DATASTREAMS,
                (
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    path.to_string(),
                ),
                |samples| samples.push(sample),
            )
            .map_err(db_err)
    }

    async fn fetch_path_status(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        _endpoint_id: Uuid,
        path: &str,
    ) -> Result<PathStatus, QueriesError> {
        let row = self
            .db
            .get(
                &INDIVIDUAL_PROPERTIES,
                &(
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    path.to_string(),
                ),
            )
            .map_err(db_err)?;

        Ok(match row {
            None => PathStatus::Missing,
            Some(row) => match row.expires_at_secs {
                None => PathStatus::NoExpiry,
                Some(expires_at) => {
                    let remaining = expires_at - Utc::now().timestamp();
                    if remaining <= 0 {
                        PathStatus::Missing
                    } else {
                        PathStatus::ExpiresIn(remaining)
                    }
                }
            },
        })
    }

    async fn insert_path(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        datetime_value_ms: i64,
        reception_timestamp_ms: i64,
        ttl_seconds: Option<i64>,
        _consistency: Consistency,
    ) -> Result<(), QueriesError> {
        self.db
            .set(
                &INDIVIDUAL_PROPERTIES,
                (
                    Self::realm_key(realm),
                    device_id,
                    interface_id,
                    path.to_string(),
                ),
                PropertyRow {
                    endpoint_id,
                    value: None,
                    reception_timestamp_ms,
                    datetime_value_ms: Some(datetime_value_ms),
                    expires_at_secs: ttl_seconds.map(|ttl| Utc::now().timestamp() + ttl),
                },
            )
            .map_err(db_err)
    }

    async fn fetch_simple_triggers(
        &self,
        realm: &Realm,
        object: TriggerObject,
    ) -> Result<Vec<SimpleTriggerRow>, QueriesError> {
        Ok(self
            .db
            .get(&SIMPLE_TRIGGERS, &(Self::realm_key(realm), object))
            .map_err(db_err)?
            .unwrap_or_default())
    }

    async fn register_device_with_interface(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_name: &str,
        major_version: i32,
    ) -> Result<(), QueriesError> {
        let key = (
            Self::realm_key(realm),
            format!("devices-by-interface-{}-v{}", interface_name, major_version),
            device_id.encode(),
        );
        self.db.set(&KV_STORE, key, Vec::new()).map_err(db_err)
    }

    async fn unregister_device_with_interface(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_name: &str,
        major_version: i32,
    ) -> Result<(), QueriesError> {
        let key = (
            Self::realm_key(realm),
            format!("devices-by-interface-{}-v{}", interface_name, major_version),
            device_id.encode(),
        );
        self.db.remove(&KV_STORE, &key).map(|_| ()).map_err(db_err)
    }

    async fn fetch_datastream_maximum_storage_retention(
        &self,
        realm: &Realm,
    ) -> Result<Option<i64>, QueriesError> {
        let key = (
            Self::realm_key(realm),
            REALM_CONFIG_GROUP.to_string(),
            RETENTION_KEY.to_string(),
        );
        let value = self.db.get(&KV_STORE, &key).map_err(db_err)?;
        Ok(value.and_then(|bytes| {
            let bytes: [u8; 8] = bytes.as_slice().try_into().ok()?;
            Some(i64::from_be_bytes(bytes))
        }))
    }
}
