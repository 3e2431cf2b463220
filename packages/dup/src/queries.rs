//! The logical database operations of the plant. The wide-column driver
//! itself lives outside this service; everything here is expressed against
//! this trait, with an in-memory backend for tests and local runs.

pub mod mem;

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bson::Bson;
use thiserror::Error;
use uuid::Uuid;

use dup_types::{
    triggers::{SimpleTriggerRow, TriggerObject},
    Aggregation, DeviceId, InterfaceType, Mapping, Ownership, Realm, StorageType,
};

#[derive(Error, Debug)]
pub enum QueriesError {
    #[error("database error: {0}")]
    Database(String),
    #[error("device {1} not registered in realm {0}")]
    DeviceNotFound(Realm, DeviceId),
}

/// Write consistency, chosen by the caller per the interface's type,
/// reliability, and retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Any,
    One,
    Quorum,
    LocalQuorum,
}

impl Consistency {
    pub fn for_value_insert(
        interface_type: InterfaceType,
        reliability: dup_types::Reliability,
        retention: dup_types::Retention,
    ) -> Self {
        use dup_types::{Reliability, Retention};

        match (interface_type, reliability, retention) {
            (InterfaceType::Properties, _, _) => Consistency::Quorum,
            (InterfaceType::Datastream, Reliability::Guaranteed, Retention::Stored) => {
                Consistency::LocalQuorum
            }
            (_, Reliability::Unreliable, _) => Consistency::Any,
            _ => Consistency::One,
        }
    }

    pub fn for_path_insert(reliability: dup_types::Reliability) -> Self {
        match reliability {
            dup_types::Reliability::Unreliable => Consistency::One,
            _ => Consistency::LocalQuorum,
        }
    }
}

/// The `devices` row as loaded when an actor starts.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistration {
    pub connected: bool,
    pub introspection: HashMap<String, i32>,
    pub introspection_minor: HashMap<String, i32>,
    /// `{name, major} -> minor` of interfaces the device stopped declaring.
    pub old_introspection: HashMap<(String, i32), i32>,
    pub pending_empty_cache: bool,
    pub total_received_msgs: i64,
    pub total_received_bytes: i64,
}

/// An `interfaces` row; the actor composes the full descriptor by pairing
/// it with the interface's mappings.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceRow {
    pub interface_id: Uuid,
    pub name: String,
    pub major_version: i32,
    pub minor_version: i32,
    pub interface_type: InterfaceType,
    pub aggregation: Aggregation,
    pub ownership: Ownership,
    pub storage: String,
    pub storage_type: StorageType,
}

/// A stored property of one interface.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProperty {
    pub endpoint_id: Uuid,
    pub path: String,
    pub value: Bson,
}

/// TTL state of a datastream path-registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Missing,
    NoExpiry,
    /// Remaining TTL in seconds.
    ExpiresIn(i64),
}

#[async_trait]
pub trait Queries: Send + Sync + 'static {
    async fn fetch_device_registration(
        &self,
        realm: &Realm,
        device_id: DeviceId,
    ) -> Result<DeviceRegistration, QueriesError>;

    async fn set_device_connected(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        timestamp_ms: i64,
        ip: IpAddr,
    ) -> Result<(), QueriesError>;

    async fn set_device_disconnected(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        timestamp_ms: i64,
        total_received_msgs: i64,
        total_received_bytes: i64,
    ) -> Result<(), QueriesError>;

    async fn set_pending_empty_cache(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        pending: bool,
    ) -> Result<(), QueriesError>;

    /// Writes the new introspection maps and folds the diff into
    /// `old_introspection`: `removed` entries are merged in, re-added
    /// names are dropped.
    async fn update_device_introspection(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        introspection: &HashMap<String, i32>,
        introspection_minor: &HashMap<String, i32>,
        removed: &HashMap<(String, i32), i32>,
        readded: &[String],
    ) -> Result<(), QueriesError>;

    async fn fetch_interface_row(
        &self,
        realm: &Realm,
        name: &str,
        major_version: i32,
    ) -> Result<Option<InterfaceRow>, QueriesError>;

    async fn fetch_interface_mappings(
        &self,
        realm: &Realm,
        interface_id: Uuid,
    ) -> Result<Vec<Mapping>, QueriesError>;

    #[allow(clippy::too_many_arguments)]
    async fn insert_property(
        &self,
        realm: &Realm,
        storage: &str,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        reception_timestamp_ms: i64,
        value: &Bson,
        consistency: Consistency,
    ) -> Result<(), QueriesError>;

    async fn delete_property(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        consistency: Consistency,
    ) -> Result<(), QueriesError>;

    async fn fetch_property_value(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
    ) -> Result<Option<Bson>, QueriesError>;

    async fn fetch_interface_properties(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
    ) -> Result<Vec<StoredProperty>, QueriesError>;

    #[allow(clippy::too_many_arguments)]
    async fn insert_datastream_value(
        &self,
        realm: &Realm,
        storage: &str,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
        value: &Bson,
        value_timestamp_ms: i64,
        reception_timestamp_ms: i64,
        reception_timestamp_submillis: i64,
        ttl_seconds: Option<i64>,
        consistency: Consistency,
    ) -> Result<(), QueriesError>;

    #[allow(clippy::too_many_arguments)]
    async fn insert_object_datastream_value(
        &self,
        realm: &Realm,
        storage: &str,
        device_id: DeviceId,
        interface_id: Uuid,
        path: &str,
        columns: &[(String, Bson)],
        explicit_timestamp_ms: Option<i64>,
        reception_timestamp_ms: i64,
        ttl_seconds: Option<i64>,
        consistency: Consistency,
    ) -> Result<(), QueriesError>;

    async fn fetch_path_status(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_id: Uuid,
        endpoint_id: Uuid,
        path: &str,
    ) -> Result<PathStatus, QueriesError>;

    #[allow(clippy::too_many_arguments)]
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
        consistency: Consistency,
    ) -> Result<(), QueriesError>;

    async fn fetch_simple_triggers(
        &self,
        realm: &Realm,
        object: TriggerObject,
    ) -> Result<Vec<SimpleTriggerRow>, QueriesError>;

    async fn register_device_with_interface(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_name: &str,
        major_version: i32,
    ) -> Result<(), QueriesError>;

    async fn unregister_device_with_interface(
        &self,
        realm: &Realm,
        device_id: DeviceId,
        interface_name: &str,
        major_version: i32,
    ) -> Result<(), QueriesError>;

    async fn fetch_datastream_maximum_storage_retention(
        &self,
        realm: &Realm,
    ) -> Result<Option<i64>, QueriesError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dup_types::{Reliability, Retention};

    #[test]
    fn value_insert_consistency_table() {
        assert_eq!(
            Consistency::for_value_insert(
                InterfaceType::Properties,
                Reliability::Guaranteed,
                Retention::Discard
            ),
            Consistency::Quorum
        );
        assert_eq!(
            Consistency::for_value_insert(
                InterfaceType::Datastream,
                Reliability::Guaranteed,
                Retention::Stored
            ),
            Consistency::LocalQuorum
        );
        assert_eq!(
            Consistency::for_value_insert(
                InterfaceType::Datastream,
                Reliability::Unreliable,
                Retention::Discard
            ),
            Consistency::Any
        );
        assert_eq!(
            Consistency::for_value_insert(
                InterfaceType::Datastream,
                Reliability::Guaranteed,
                Retention::Discard
            ),
            Consistency::One
        );
    }

    #[test]
    fn path_insert_consistency() {
        assert_eq!(
            Consistency::for_path_insert(Reliability::Unreliable),
            Consistency::One
        );
        assert_eq!(
            Consistency::for_path_insert(Reliability::Guaranteed),
            Consistency::LocalQuorum
        );
    }
}
